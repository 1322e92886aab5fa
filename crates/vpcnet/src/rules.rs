//! Packet-filter rule management.
//!
//! Rules are typed records serialized to iptables tokens only at the executor
//! boundary. Every rule carries a `vpcctl:<info>` comment naming its owner;
//! the comment is part of the rule's identity for existence probes and
//! deletions. The kernel is the source of truth: no rule state is held in
//! process; the vpc document's replay log is what teardown works from.

use tracing::{debug, warn};

use crate::command::Executor;
use crate::error::Result;

/// Tag prefix marking every rule owned by this tool.
pub const COMMENT_PREFIX: &str = "vpcctl:";

/// Comment annotation `vpcctl:<part>:<part>...`.
pub fn tag(parts: &[&str]) -> String {
    format!("{COMMENT_PREFIX}{}", parts.join(":"))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Table {
    Filter,
    Nat,
}

impl Table {
    fn as_str(self) -> &'static str {
        match self {
            Table::Filter => "filter",
            Table::Nat => "nat",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    Accept,
    Drop,
    Masquerade,
    Jump(String),
}

impl Verdict {
    fn target(&self) -> &str {
        match self {
            Verdict::Accept => "ACCEPT",
            Verdict::Drop => "DROP",
            Verdict::Masquerade => "MASQUERADE",
            Verdict::Jump(chain) => chain,
        }
    }
}

/// One packet-filter rule.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rule {
    pub table: Table,
    pub chain: String,
    /// Namespace scope; `None` targets the host tables.
    pub netns: Option<String>,
    /// Tokenized match selectors, e.g. `["-s", "10.10.1.0/24", "-p", "tcp"]`.
    pub matches: Vec<String>,
    pub verdict: Verdict,
    /// `vpcctl:<info>` annotation naming the owning vpc.
    pub comment: String,
}

impl Rule {
    fn command(&self, verb: &str) -> Vec<String> {
        let mut argv: Vec<String> = Vec::new();
        if let Some(ns) = &self.netns {
            argv.extend(["ip", "netns", "exec"].map(String::from));
            argv.push(ns.clone());
        }
        argv.push("iptables".to_string());
        argv.push("-t".to_string());
        argv.push(self.table.as_str().to_string());
        argv.push(verb.to_string());
        argv.push(self.chain.clone());
        argv.extend(self.matches.iter().cloned());
        argv.extend(["-m", "comment", "--comment"].map(String::from));
        argv.push(self.comment.clone());
        argv.push("-j".to_string());
        argv.push(self.verdict.target().to_string());
        argv
    }

    /// Append form, recorded verbatim in the document replay log.
    pub fn add_command(&self) -> Vec<String> {
        self.command("-A")
    }

    /// Existence-check form of the same rule.
    pub fn check_command(&self) -> Vec<String> {
        self.command("-C")
    }

    pub fn delete_command(&self) -> Vec<String> {
        self.command("-D")
    }
}

/// Transform a recorded add-form into its delete-form.
///
/// Swaps the `-A`/`-I` verb for `-D`; an insert position after the chain is
/// dropped since deletes take no position. Returns `None` when no add verb is
/// present.
pub fn delete_form(add: &[String]) -> Option<Vec<String>> {
    let pos = add.iter().position(|t| t == "-A" || t == "-I")?;
    let was_insert = add.get(pos).map(String::as_str) == Some("-I");
    let mut out = add.to_vec();
    if let Some(verb) = out.get_mut(pos) {
        "-D".clone_into(verb);
    }
    let has_position = was_insert
        && out
            .get(pos + 2)
            .is_some_and(|t| !t.is_empty() && t.chars().all(|c| c.is_ascii_digit()));
    if has_position {
        out.remove(pos + 2);
    }
    Some(out)
}

/// Drop the `-m comment --comment <tag>` match from a tokenized rule.
pub fn strip_comment(argv: &[String]) -> Vec<String> {
    let mut out = Vec::with_capacity(argv.len());
    let mut i = 0;
    while let Some(token) = argv.get(i) {
        if token == "-m"
            && argv.get(i + 1).map(String::as_str) == Some("comment")
            && argv.get(i + 2).map(String::as_str) == Some("--comment")
            && argv.get(i + 3).is_some()
        {
            i += 4;
            continue;
        }
        out.push(token.clone());
        i += 1;
    }
    out
}

/// Applies, probes, and reverses rules through the executor.
pub struct RuleManager<'a> {
    exec: &'a Executor,
}

impl<'a> RuleManager<'a> {
    pub fn new(exec: &'a Executor) -> Self {
        Self { exec }
    }

    /// Install `rule` unless an identical rule is already present.
    ///
    /// Returns the tokenized add-form for the caller to persist in the
    /// replay log whether or not the add actually ran.
    pub async fn ensure(&self, rule: &Rule) -> Result<Vec<String>> {
        if self.exec.probe(&rule.check_command()).await? {
            debug!(chain = %rule.chain, comment = %rule.comment, "rule already present");
        } else {
            self.exec.run(&rule.add_command()).await?;
        }
        Ok(rule.add_command())
    }

    /// Replay a recorded add-form as a deletion, best effort.
    ///
    /// Tries the exact recorded form first; if that fails (e.g. the comment
    /// was edited away out-of-band) retries with the comment stripped.
    /// Failure is logged, never fatal.
    pub async fn delete_recorded(&self, recorded: &[String]) {
        let Some(delete) = delete_form(recorded) else {
            warn!(
                command = %recorded.join(" "),
                "recorded rule has no add verb, skipping"
            );
            return;
        };
        if self.exec.run(&delete).await.is_ok() {
            return;
        }
        let stripped = strip_comment(&delete);
        if stripped != delete && self.exec.run(&stripped).await.is_ok() {
            return;
        }
        warn!(
            command = %recorded.join(" "),
            "failed to delete recorded rule"
        );
    }

    /// Create a filter-table chain if it does not exist.
    pub async fn ensure_chain(&self, chain: &str, netns: Option<&str>) -> Result<()> {
        if self
            .exec
            .probe(&chain_command(netns, &["-t", "filter", "-n", "-L", chain]))
            .await?
        {
            debug!(chain, "chain already present");
            return Ok(());
        }
        self.exec
            .run(&chain_command(netns, &["-t", "filter", "-N", chain]))
            .await?;
        Ok(())
    }

    /// Flush and delete a host filter chain, best effort.
    pub async fn remove_chain(&self, chain: &str) {
        for verb in ["-F", "-X"] {
            let argv = chain_command(None, &["-t", "filter", verb, chain]);
            if let Err(e) = self.exec.run(&argv).await {
                warn!(chain, error = %e, "chain teardown step failed");
            }
        }
    }
}

fn chain_command(netns: Option<&str>, args: &[&str]) -> Vec<String> {
    let mut argv: Vec<String> = Vec::new();
    if let Some(ns) = netns {
        argv.extend(["ip", "netns", "exec"].map(String::from));
        argv.push(ns.to_string());
    }
    argv.push("iptables".to_string());
    argv.extend(args.iter().map(|s| s.to_string()));
    argv
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::{DEFAULT_TIMEOUT, ExecMode, Executor};

    fn accept_rule() -> Rule {
        Rule {
            table: Table::Filter,
            chain: "vpc-myvpc".to_string(),
            netns: None,
            matches: vec![
                "-s".to_string(),
                "10.10.1.0/24".to_string(),
                "-d".to_string(),
                "10.20.1.0/24".to_string(),
            ],
            verdict: Verdict::Accept,
            comment: tag(&["myvpc", "peer", "othervpc"]),
        }
    }

    #[test]
    fn tag_formats_with_prefix() {
        assert_eq!(tag(&["myvpc"]), "vpcctl:myvpc");
        assert_eq!(tag(&["myvpc", "nat", "public"]), "vpcctl:myvpc:nat:public");
    }

    #[test]
    fn add_command_tokens() {
        let argv = accept_rule().add_command();
        assert_eq!(
            argv,
            vec![
                "iptables",
                "-t",
                "filter",
                "-A",
                "vpc-myvpc",
                "-s",
                "10.10.1.0/24",
                "-d",
                "10.20.1.0/24",
                "-m",
                "comment",
                "--comment",
                "vpcctl:myvpc:peer:othervpc",
                "-j",
                "ACCEPT",
            ]
        );
    }

    #[test]
    fn check_and_delete_differ_only_in_verb() {
        let rule = accept_rule();
        let add = rule.add_command();
        let check = rule.check_command();
        let delete = rule.delete_command();
        assert_eq!(add.len(), check.len());
        assert_eq!(add.len(), delete.len());
        assert!(check.contains(&"-C".to_string()));
        assert!(delete.contains(&"-D".to_string()));
        assert!(!check.contains(&"-A".to_string()));
    }

    #[test]
    fn namespace_scope_prefixes_ip_netns_exec() {
        let mut rule = accept_rule();
        rule.netns = Some("ns-myvpc-public".to_string());
        let argv = rule.add_command();
        assert_eq!(
            argv.iter().take(5).cloned().collect::<Vec<_>>(),
            vec!["ip", "netns", "exec", "ns-myvpc-public", "iptables"]
        );
    }

    #[test]
    fn masquerade_and_jump_targets() {
        let mut rule = accept_rule();
        rule.table = Table::Nat;
        rule.verdict = Verdict::Masquerade;
        let argv = rule.add_command();
        assert!(argv.contains(&"nat".to_string()));
        assert!(argv.contains(&"MASQUERADE".to_string()));

        rule.verdict = Verdict::Jump("vpc-myvpc".to_string());
        let argv = rule.add_command();
        assert_eq!(argv.last().unwrap(), "vpc-myvpc");
    }

    #[test]
    fn delete_form_swaps_append_verb() {
        let add = accept_rule().add_command();
        let delete = delete_form(&add).unwrap();
        assert_eq!(delete, accept_rule().delete_command());
    }

    #[test]
    fn delete_form_drops_insert_position() {
        let add = crate::command::argv(&[
            "iptables", "-t", "filter", "-I", "FORWARD", "1", "-j", "ACCEPT",
        ]);
        let delete = delete_form(&add).unwrap();
        assert_eq!(
            delete,
            crate::command::argv(&["iptables", "-t", "filter", "-D", "FORWARD", "-j", "ACCEPT"])
        );
    }

    #[test]
    fn delete_form_requires_an_add_verb() {
        let listing = crate::command::argv(&["iptables", "-t", "filter", "-L"]);
        assert!(delete_form(&listing).is_none());
    }

    #[test]
    fn strip_comment_removes_the_match() {
        let delete = accept_rule().delete_command();
        let stripped = strip_comment(&delete);
        assert!(!stripped.contains(&"comment".to_string()));
        assert!(!stripped.iter().any(|t| t.starts_with(COMMENT_PREFIX)));
        assert_eq!(stripped.len(), delete.len() - 4);
    }

    #[test]
    fn strip_comment_keeps_unrelated_matches() {
        let argv = crate::command::argv(&[
            "iptables",
            "-t",
            "filter",
            "-D",
            "FORWARD",
            "-m",
            "state",
            "--state",
            "RELATED,ESTABLISHED",
            "-m",
            "comment",
            "--comment",
            "vpcctl:myvpc:nat:public",
            "-j",
            "ACCEPT",
        ]);
        let stripped = strip_comment(&argv);
        assert!(stripped.contains(&"state".to_string()));
        assert!(!stripped.contains(&"comment".to_string()));
    }

    #[tokio::test]
    async fn ensure_returns_add_form_in_dry_run() {
        let exec = Executor::new(ExecMode::DryRun, DEFAULT_TIMEOUT);
        let mgr = RuleManager::new(&exec);
        let rule = accept_rule();
        let recorded = mgr.ensure(&rule).await.unwrap();
        assert_eq!(recorded, rule.add_command());
        // The probe reported absent, so the add itself was traced.
        assert_eq!(exec.traced().len(), 1);
    }

    #[tokio::test]
    async fn delete_recorded_traces_delete_form_in_dry_run() {
        let exec = Executor::new(ExecMode::DryRun, DEFAULT_TIMEOUT);
        let mgr = RuleManager::new(&exec);
        mgr.delete_recorded(&accept_rule().add_command()).await;
        let traced = exec.traced();
        assert_eq!(traced.len(), 1);
        assert!(traced.first().unwrap().contains(" -D "));
    }
}
