//! Host prerequisite checks, collected into one report.

use crate::context::Context;
use crate::error::{Error, Result};

/// Verify root privilege and required tools before a mutating operation.
///
/// Dry-run needs neither: nothing privileged will execute.
pub async fn check(ctx: &Context) -> Result<()> {
    if ctx.exec.is_dry_run() {
        return Ok(());
    }

    let mut problems = Vec::new();
    if !nix::unistd::geteuid().is_root() {
        problems.push("root privilege required for kernel mutations".to_string());
    }
    for tool in ["ip", "iptables", "sysctl"] {
        if which::which(tool).is_err() {
            problems.push(format!("required command not found: {tool}"));
        }
    }

    if problems.is_empty() {
        Ok(())
    } else {
        Err(Error::Privilege(problems.join("; ")))
    }
}
