//! Declarative subnet policies and their compilation to namespace rules.

use ipnet::Ipv4Net;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::context::Context;
use crate::error::{Error, Result};
use crate::rules::{self, Rule, Table, Verdict};
use crate::types::{AppliedPolicy, SubnetRecord};

/// Ingress/egress policy scoped to one subnet.
///
/// Unknown fields are rejected so a typoed document fails loudly instead of
/// silently allowing traffic.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PolicyDoc {
    pub subnet: Ipv4Net,
    #[serde(default)]
    pub ingress: Vec<PolicyRule>,
    #[serde(default)]
    pub egress: Vec<PolicyRule>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PolicyRule {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
    pub protocol: Protocol,
    pub action: Action,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Tcp,
    Udp,
    Icmp,
}

impl Protocol {
    fn as_str(self) -> &'static str {
        match self {
            Protocol::Tcp => "tcp",
            Protocol::Udp => "udp",
            Protocol::Icmp => "icmp",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Action {
    Allow,
    Deny,
}

impl PolicyDoc {
    /// Parse a policy document, rejecting schema violations.
    pub fn parse(json: &str) -> Result<Self> {
        serde_json::from_str(json).map_err(|e| Error::PolicyMalformed(e.to_string()))
    }
}

/// The policy installed on every new subnet: web ports open, ssh shut.
pub fn default_policy(cidr: Ipv4Net) -> PolicyDoc {
    PolicyDoc {
        subnet: cidr,
        ingress: vec![
            PolicyRule {
                port: Some(80),
                protocol: Protocol::Tcp,
                action: Action::Allow,
            },
            PolicyRule {
                port: Some(443),
                protocol: Protocol::Tcp,
                action: Action::Allow,
            },
            PolicyRule {
                port: Some(22),
                protocol: Protocol::Tcp,
                action: Action::Deny,
            },
        ],
        egress: Vec::new(),
    }
}

/// Compile a policy into namespace-scoped filter rules.
///
/// Ingress entries target the namespace INPUT chain, egress entries OUTPUT,
/// in document order; first match wins. `icmp` entries ignore `port`.
pub fn compile(policy: &PolicyDoc, vpc: &str, subnet: &str, ns: &str) -> Vec<Rule> {
    let comment = rules::tag(&[vpc, "policy", subnet]);
    let mut out = Vec::with_capacity(policy.ingress.len() + policy.egress.len());
    for entry in &policy.ingress {
        out.push(entry_rule(entry, "INPUT", ns, &comment));
    }
    for entry in &policy.egress {
        out.push(entry_rule(entry, "OUTPUT", ns, &comment));
    }
    out
}

fn entry_rule(entry: &PolicyRule, chain: &str, ns: &str, comment: &str) -> Rule {
    let mut matches = vec!["-p".to_string(), entry.protocol.as_str().to_string()];
    if entry.protocol != Protocol::Icmp
        && let Some(port) = entry.port
    {
        matches.push("--dport".to_string());
        matches.push(port.to_string());
    }
    Rule {
        table: Table::Filter,
        chain: chain.to_string(),
        netns: Some(ns.to_string()),
        matches,
        verdict: match entry.action {
            Action::Allow => Verdict::Accept,
            Action::Deny => Verdict::Drop,
        },
        comment: comment.to_string(),
    }
}

/// Apply a policy to the subnet whose range matches its `subnet` field.
///
/// Additive: prior rules are never flushed; re-applying an identical policy
/// is a no-op through the rule manager's existence probes. The applied
/// document is recorded in the vpc document and written out for inspection.
pub async fn apply_policy(ctx: &Context, vpc: &str, policy: &PolicyDoc) -> Result<()> {
    let _lock = ctx.store.lock().await?;
    let mut doc = ctx.store.must_load(vpc).await?;
    let Some(subnet) = doc.subnets.iter().find(|s| s.cidr == policy.subnet).cloned() else {
        return Err(Error::NoMatchingSubnet(policy.subnet.to_string()));
    };
    info!(vpc, subnet = %subnet.name, "applying policy");

    let result = install(ctx, vpc, &subnet, policy).await;
    record(&mut doc.policies, &subnet.name, policy);
    ctx.store.save_policy(vpc, &subnet.name, policy).await?;
    ctx.store.save(&doc).await?;
    result
}

/// Install a compiled policy's rules inside the subnet's namespace.
pub(crate) async fn install(
    ctx: &Context,
    vpc: &str,
    subnet: &SubnetRecord,
    policy: &PolicyDoc,
) -> Result<()> {
    let mgr = ctx.rules();
    for rule in compile(policy, vpc, &subnet.name, &subnet.ns) {
        mgr.ensure(&rule).await?;
    }
    Ok(())
}

/// Record an applied policy, skipping an exact duplicate.
pub(crate) fn record(applied: &mut Vec<AppliedPolicy>, subnet: &str, policy: &PolicyDoc) {
    let entry = AppliedPolicy {
        subnet: subnet.to_string(),
        policy: policy.clone(),
    };
    if !applied.contains(&entry) {
        applied.push(entry);
    }
}
