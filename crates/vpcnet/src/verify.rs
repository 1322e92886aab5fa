//! Cross-check of metadata against live kernel state.
//!
//! Enumeration is read-only: verify never mutates. Reconciliation is pure so
//! the matching rules can be exercised without a live kernel.

use serde::Serialize;
use tracing::warn;

use crate::command::{Executor, argv};
use crate::context::Context;
use crate::error::Result;
use crate::names;
use crate::types::VpcDoc;

/// Kernel objects observed live, filtered to the reserved name prefixes.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct LiveState {
    pub links: Vec<String>,
    pub namespaces: Vec<String>,
    /// `None` when the filter tables could not be read (no privilege);
    /// chain reconciliation is skipped rather than reported wrongly.
    pub chains: Option<Vec<String>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ResourceKind {
    Bridge,
    Veth,
    Namespace,
    Chain,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Resource {
    pub kind: ResourceKind,
    pub name: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum OrphanReason {
    /// Live on the host but accounted for by no document.
    Unaccounted,
    /// Named by a document but missing from the host.
    Missing,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Orphan {
    pub kind: ResourceKind,
    pub name: String,
    pub reason: OrphanReason,
}

#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize)]
pub struct VerifyReport {
    pub accounted: Vec<Resource>,
    pub orphans: Vec<Orphan>,
}

impl VerifyReport {
    pub fn is_clean(&self) -> bool {
        self.orphans.is_empty()
    }
}

/// Enumerate live kernel objects and reconcile them against the store.
pub async fn verify(ctx: &Context) -> Result<VerifyReport> {
    let mut docs = Vec::new();
    for name in ctx.store.list().await? {
        if let Some(doc) = ctx.store.load(&name).await? {
            docs.push(doc);
        }
    }
    let live = enumerate_live(&ctx.exec).await?;
    Ok(reconcile(&docs, &live))
}

async fn enumerate_live(exec: &Executor) -> Result<LiveState> {
    let mut live = LiveState::default();

    let links = exec.query(&argv(&["ip", "-o", "link", "show"])).await?;
    for line in links.lines() {
        if let Some(name) = parse_link_name(line)
            && names::is_reserved_link(&name)
        {
            live.links.push(name);
        }
    }

    let namespaces = exec.query(&argv(&["ip", "netns", "list"])).await?;
    for line in namespaces.lines() {
        if let Some(name) = line.split_whitespace().next()
            && name.starts_with(names::NETNS_PREFIX)
        {
            live.namespaces.push(name.to_string());
        }
    }

    match exec
        .query(&argv(&["iptables", "-t", "filter", "-S"]))
        .await
    {
        Ok(out) => {
            let chains = out
                .lines()
                .filter_map(|line| line.strip_prefix("-N "))
                .map(|chain| chain.trim().to_string())
                .filter(|chain| chain.starts_with(names::CHAIN_PREFIX))
                .collect();
            live.chains = Some(chains);
        }
        Err(e) => {
            warn!(error = %e, "cannot read filter chains, skipping chain check");
        }
    }

    Ok(live)
}

/// Extract the device name from one `ip -o link show` line
/// (`"3: br-myvpc: <...>"`, veth sides show as `"5: v-x@if4: <...>"`).
fn parse_link_name(line: &str) -> Option<String> {
    let mut parts = line.splitn(3, ':');
    let _index = parts.next()?;
    let name = parts.next()?.trim();
    let name = name.split('@').next()?;
    (!name.is_empty()).then(|| name.to_string())
}

/// Pure matching of documents against observed state.
pub fn reconcile(docs: &[VpcDoc], live: &LiveState) -> VerifyReport {
    use std::collections::{BTreeMap, BTreeSet};

    let mut expected_links: BTreeMap<String, ResourceKind> = BTreeMap::new();
    let mut expected_namespaces: BTreeSet<String> = BTreeSet::new();
    let mut expected_chains: BTreeSet<String> = BTreeSet::new();
    for doc in docs {
        expected_links.insert(doc.bridge.clone(), ResourceKind::Bridge);
        expected_chains.insert(doc.chain.clone());
        for subnet in &doc.subnets {
            expected_links.insert(subnet.veth.bridge_side.clone(), ResourceKind::Veth);
            expected_namespaces.insert(subnet.ns.clone());
        }
        for peering in &doc.peers {
            expected_links.insert(peering.local_if.clone(), ResourceKind::Veth);
            expected_links.insert(peering.peer_if.clone(), ResourceKind::Veth);
        }
    }

    let live_links: BTreeSet<&String> = live.links.iter().collect();
    let live_namespaces: BTreeSet<&String> = live.namespaces.iter().collect();

    let mut report = VerifyReport::default();

    for (name, kind) in &expected_links {
        if live_links.contains(name) {
            report.accounted.push(Resource {
                kind: *kind,
                name: name.clone(),
            });
        } else {
            report.orphans.push(Orphan {
                kind: *kind,
                name: name.clone(),
                reason: OrphanReason::Missing,
            });
        }
    }
    for name in &live.links {
        if !expected_links.contains_key(name) {
            let kind = if name.starts_with(names::BRIDGE_PREFIX) {
                ResourceKind::Bridge
            } else {
                ResourceKind::Veth
            };
            report.orphans.push(Orphan {
                kind,
                name: name.clone(),
                reason: OrphanReason::Unaccounted,
            });
        }
    }

    for name in &expected_namespaces {
        if live_namespaces.contains(name) {
            report.accounted.push(Resource {
                kind: ResourceKind::Namespace,
                name: name.clone(),
            });
        } else {
            report.orphans.push(Orphan {
                kind: ResourceKind::Namespace,
                name: name.clone(),
                reason: OrphanReason::Missing,
            });
        }
    }
    for name in &live.namespaces {
        if !expected_namespaces.contains(name.as_str()) {
            report.orphans.push(Orphan {
                kind: ResourceKind::Namespace,
                name: name.clone(),
                reason: OrphanReason::Unaccounted,
            });
        }
    }

    if let Some(chains) = &live.chains {
        let live_chains: BTreeSet<&String> = chains.iter().collect();
        for name in &expected_chains {
            if live_chains.contains(name) {
                report.accounted.push(Resource {
                    kind: ResourceKind::Chain,
                    name: name.clone(),
                });
            } else {
                report.orphans.push(Orphan {
                    kind: ResourceKind::Chain,
                    name: name.clone(),
                    reason: OrphanReason::Missing,
                });
            }
        }
        for name in chains {
            if !expected_chains.contains(name.as_str()) {
                report.orphans.push(Orphan {
                    kind: ResourceKind::Chain,
                    name: name.clone(),
                    reason: OrphanReason::Unaccounted,
                });
            }
        }
    }

    report
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{SubnetRecord, VethPair, VpcDoc};

    fn doc() -> VpcDoc {
        let mut doc = VpcDoc::new(
            "myvpc",
            "10.10.0.0/16".parse().unwrap(),
            "br-myvpc".to_string(),
            "vpc-myvpc".to_string(),
        );
        doc.subnets.push(SubnetRecord {
            name: "public".to_string(),
            cidr: "10.10.1.0/24".parse().unwrap(),
            ns: "ns-myvpc-public".to_string(),
            gw: "10.10.1.1".parse().unwrap(),
            host_ip: "10.10.1.2".parse().unwrap(),
            veth: VethPair {
                bridge_side: "v-myvpc-pub-b".to_string(),
                ns_side: "v-myvpc-pub-n".to_string(),
            },
        });
        doc
    }

    fn live_for(doc: &VpcDoc) -> LiveState {
        LiveState {
            links: vec![
                doc.bridge.clone(),
                doc.subnets.first().unwrap().veth.bridge_side.clone(),
            ],
            namespaces: vec![doc.subnets.first().unwrap().ns.clone()],
            chains: Some(vec![doc.chain.clone()]),
        }
    }

    #[test]
    fn matching_state_is_clean() {
        let doc = doc();
        let report = reconcile(std::slice::from_ref(&doc), &live_for(&doc));
        assert!(report.is_clean(), "orphans: {:?}", report.orphans);
        assert_eq!(report.accounted.len(), 4);
    }

    #[test]
    fn empty_store_and_empty_host_is_clean() {
        let report = reconcile(&[], &LiveState::default());
        assert!(report.is_clean());
        assert!(report.accounted.is_empty());
    }

    #[test]
    fn live_object_without_document_is_unaccounted() {
        let live = LiveState {
            links: vec!["br-ghost".to_string()],
            namespaces: vec!["ns-ghost-public".to_string()],
            chains: Some(vec!["vpc-ghost".to_string()]),
        };
        let report = reconcile(&[], &live);
        assert_eq!(report.orphans.len(), 3);
        assert!(
            report
                .orphans
                .iter()
                .all(|o| o.reason == OrphanReason::Unaccounted)
        );
    }

    #[test]
    fn documented_object_missing_live_is_reported() {
        let doc = doc();
        let report = reconcile(std::slice::from_ref(&doc), &LiveState::default());
        // Chains are skipped entirely (None), the rest are missing.
        assert!(
            report
                .orphans
                .iter()
                .all(|o| o.reason == OrphanReason::Missing)
        );
        assert_eq!(report.orphans.len(), 3);
    }

    #[test]
    fn unreadable_chains_are_not_reported_missing() {
        let doc = doc();
        let mut live = live_for(&doc);
        live.chains = None;
        let report = reconcile(std::slice::from_ref(&doc), &live);
        assert!(report.is_clean(), "orphans: {:?}", report.orphans);
    }

    #[test]
    fn peering_links_are_accounted_from_either_side() {
        let mut doc = doc();
        doc.peers.push(crate::types::PeeringRecord {
            peer_vpc: "othervpc".to_string(),
            local_if: "pv-m-o-0".to_string(),
            peer_if: "pv-m-o-1".to_string(),
            allow_cidrs: Vec::new(),
        });
        let mut live = live_for(&doc);
        live.links.push("pv-m-o-0".to_string());
        live.links.push("pv-m-o-1".to_string());
        let report = reconcile(std::slice::from_ref(&doc), &live);
        assert!(report.is_clean(), "orphans: {:?}", report.orphans);
    }

    #[test]
    fn parse_link_name_strips_peer_suffix() {
        assert_eq!(
            parse_link_name("3: br-myvpc: <BROADCAST,MULTICAST> mtu 1500"),
            Some("br-myvpc".to_string())
        );
        assert_eq!(
            parse_link_name("5: v-myvpc-pub-b@if4: <BROADCAST> mtu 1500"),
            Some("v-myvpc-pub-b".to_string())
        );
        assert_eq!(parse_link_name(""), None);
    }
}
