//! Source NAT for subnet traffic leaving through a host interface.

use tracing::info;

use crate::context::Context;
use crate::error::{Error, Result};
use crate::rules::{self, Rule, Table, Verdict};
use crate::types::{NatRecord, SubnetRecord};

/// Which subnets an `enable-nat` call targets.
///
/// There is no per-subnet public flag, so without explicit operator intent
/// the only safe heuristic is the subnet name itself.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NatScope {
    /// Subnets literally named `public`; a no-op when there are none.
    Public,
    /// One named subnet.
    Subnet(String),
    /// Every subnet in the vpc.
    All,
}

/// Masquerade traffic from the targeted subnets out of `interface`.
///
/// Per subnet: one POSTROUTING masquerade for the subnet range plus the
/// bridge↔interface forward-accept pair. All adds are recorded in the replay
/// log; the attachment is recorded in the document's `nat` field. Returns
/// the names of the subnets NAT was enabled for.
pub async fn enable_nat(
    ctx: &Context,
    vpc: &str,
    interface: &str,
    scope: NatScope,
) -> Result<Vec<String>> {
    let _lock = ctx.store.lock().await?;
    let mut doc = ctx.store.must_load(vpc).await?;

    let targets: Vec<SubnetRecord> = match &scope {
        NatScope::Public => doc
            .subnets
            .iter()
            .filter(|s| s.name == "public")
            .cloned()
            .collect(),
        NatScope::Subnet(name) => vec![
            doc.subnet(name)
                .cloned()
                .ok_or_else(|| Error::NotFound(format!("subnet {name} in vpc {vpc}")))?,
        ],
        NatScope::All => doc.subnets.clone(),
    };
    if targets.is_empty() {
        info!(vpc, "no subnet named public, nat not enabled");
        return Ok(Vec::new());
    }

    let bridge = doc.bridge.clone();
    let mgr = ctx.rules();
    let mut natted = Vec::new();
    let mut result = Ok(());
    'targets: for sub in &targets {
        info!(vpc, subnet = %sub.name, interface, "enabling nat");
        let comment = rules::tag(&[vpc, "nat", &sub.name]);
        let subnet_rules = [
            Rule {
                table: Table::Nat,
                chain: "POSTROUTING".to_string(),
                netns: None,
                matches: vec![
                    "-s".to_string(),
                    sub.cidr.to_string(),
                    "-o".to_string(),
                    interface.to_string(),
                ],
                verdict: Verdict::Masquerade,
                comment: comment.clone(),
            },
            Rule {
                table: Table::Filter,
                chain: "FORWARD".to_string(),
                netns: None,
                matches: vec![
                    "-i".to_string(),
                    bridge.clone(),
                    "-o".to_string(),
                    interface.to_string(),
                ],
                verdict: Verdict::Accept,
                comment: comment.clone(),
            },
            Rule {
                table: Table::Filter,
                chain: "FORWARD".to_string(),
                netns: None,
                matches: vec![
                    "-i".to_string(),
                    interface.to_string(),
                    "-o".to_string(),
                    bridge.clone(),
                    "-m".to_string(),
                    "state".to_string(),
                    "--state".to_string(),
                    "RELATED,ESTABLISHED".to_string(),
                ],
                verdict: Verdict::Accept,
                comment,
            },
        ];
        for rule in &subnet_rules {
            match mgr.ensure(rule).await {
                Ok(tokens) => {
                    if !doc.host_iptables.contains(&tokens) {
                        doc.host_iptables.push(tokens);
                    }
                }
                Err(e) => {
                    result = Err(e);
                    break 'targets;
                }
            }
        }
        natted.push(sub.name.clone());
    }

    match doc.nat.as_mut() {
        Some(nat) => {
            nat.interface = interface.to_string();
            for name in &natted {
                if !nat.subnets.contains(name) {
                    nat.subnets.push(name.clone());
                }
            }
        }
        None => {
            doc.nat = Some(NatRecord {
                interface: interface.to_string(),
                subnets: natted.clone(),
            });
        }
    }

    ctx.store.save(&doc).await?;
    result.map(|()| natted)
}
