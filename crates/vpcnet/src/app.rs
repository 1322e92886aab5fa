//! Test workloads: a minimal HTTP listener inside a subnet namespace.

use std::time::Duration;

use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use tracing::{info, warn};

use crate::context::Context;
use crate::error::{Error, Result};
use crate::types::{AppRecord, VpcDoc};

/// How long a workload gets to exit after SIGTERM before SIGKILL.
const STOP_GRACE: Duration = Duration::from_secs(5);
const STOP_POLL: Duration = Duration::from_millis(500);

/// Start a detached HTTP listener inside a subnet's namespace.
///
/// Output goes to the store's per-namespace log file; the pid and the exact
/// command are recorded so the workload can be stopped later.
pub async fn deploy_app(ctx: &Context, vpc: &str, subnet: &str, port: u16) -> Result<AppRecord> {
    let _lock = ctx.store.lock().await?;
    let mut doc = ctx.store.must_load(vpc).await?;
    let sub = doc
        .subnet(subnet)
        .cloned()
        .ok_or_else(|| Error::NotFound(format!("subnet {subnet} in vpc {vpc}")))?;

    let mut command = crate::command::argv(&["ip", "netns", "exec"]);
    command.push(sub.ns.clone());
    command.extend(crate::command::argv(&["python3", "-m", "http.server"]));
    command.push(port.to_string());
    let log_path = ctx.store.app_log_path(&sub.ns);
    info!(vpc, subnet, port, ns = %sub.ns, "deploying test workload");

    let pid = ctx.exec.spawn_detached(&command, &log_path).await?;
    let record = AppRecord {
        ns: sub.ns.clone(),
        port,
        pid,
        command,
    };
    doc.apps.push(record.clone());
    ctx.store.save(&doc).await?;
    Ok(record)
}

/// Selects workloads by namespace or pid; both absent selects all.
#[derive(Debug, Default, Clone)]
pub struct AppSelector {
    pub ns: Option<String>,
    pub pid: Option<u32>,
}

impl AppSelector {
    fn matches(&self, app: &AppRecord) -> bool {
        match (&self.ns, self.pid) {
            (None, None) => true,
            (ns, pid) => {
                ns.as_deref().is_some_and(|n| n == app.ns) || pid.is_some_and(|p| p == app.pid)
            }
        }
    }

    fn is_empty(&self) -> bool {
        self.ns.is_none() && self.pid.is_none()
    }
}

/// Stop matching workloads and drop their records.
///
/// Returns the number stopped. A selector that names something is expected
/// to match; an empty selector on a vpc with no workloads is a no-op.
pub async fn stop_app(ctx: &Context, vpc: &str, selector: &AppSelector) -> Result<usize> {
    let _lock = ctx.store.lock().await?;
    let mut doc = ctx.store.must_load(vpc).await?;

    let selected: Vec<AppRecord> = doc
        .apps
        .iter()
        .filter(|app| selector.matches(app))
        .cloned()
        .collect();
    if selected.is_empty() {
        if selector.is_empty() {
            return Ok(0);
        }
        return Err(Error::NotFound(format!("no matching app in vpc {vpc}")));
    }

    for app in &selected {
        terminate(ctx, app).await;
    }
    doc.apps.retain(|app| !selector.matches(app));
    ctx.store.save(&doc).await?;
    Ok(selected.len())
}

/// Stop every workload of a document without touching the store. Used by
/// vpc deletion, which removes the whole document afterwards.
pub(crate) async fn stop_all(ctx: &Context, doc: &VpcDoc) {
    for app in &doc.apps {
        terminate(ctx, app).await;
    }
}

/// SIGTERM, bounded wait, then SIGKILL.
async fn terminate(ctx: &Context, app: &AppRecord) {
    if ctx.exec.is_dry_run() || app.pid == 0 {
        info!(pid = app.pid, ns = %app.ns, "dry-run: would stop workload");
        return;
    }
    let Ok(raw) = i32::try_from(app.pid) else {
        warn!(pid = app.pid, "pid out of range, skipping");
        return;
    };
    let pid = Pid::from_raw(raw);
    info!(pid = app.pid, ns = %app.ns, "stopping workload");
    if signal::kill(pid, Signal::SIGTERM).is_err() {
        // Already gone.
        return;
    }
    let deadline = tokio::time::Instant::now() + STOP_GRACE;
    while tokio::time::Instant::now() < deadline {
        tokio::time::sleep(STOP_POLL).await;
        if signal::kill(pid, None).is_err() {
            return;
        }
    }
    warn!(pid = app.pid, "workload ignored SIGTERM, killing");
    let _ = signal::kill(pid, Signal::SIGKILL);
}
