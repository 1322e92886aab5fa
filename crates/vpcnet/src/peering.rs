//! Vpc peering: a bridge-to-bridge veth plus explicit allow rules.
//!
//! A peering is a relation, not an ownership link: both documents record it
//! by value (peer name + local veth identifiers) and either side's deletion
//! scrubs the mirror record.

use ipnet::Ipv4Net;
use tracing::info;

use crate::cidr;
use crate::context::Context;
use crate::error::{Error, Result};
use crate::names;
use crate::net;
use crate::rules::{self, Rule, Table, Verdict};
use crate::types::{AllowPair, PeeringRecord, VpcDoc};

/// Connect two vpcs with filtered reachability.
///
/// `allow` is a flat list of ranges, each contained in one of the two vpcs;
/// the installed pairs are the cross product in both directions. When
/// absent, both full vpc ranges are allowed both ways. Each pair's accept
/// rule lands in the chain of the vpc owning the source range.
pub async fn peer(
    ctx: &Context,
    vpc_a: &str,
    vpc_b: &str,
    allow: Option<&[Ipv4Net]>,
) -> Result<()> {
    if vpc_a == vpc_b {
        return Err(Error::SelfPeer(vpc_a.to_string()));
    }
    let _lock = ctx.store.lock().await?;
    let mut doc_a = ctx.store.must_load(vpc_a).await?;
    let mut doc_b = ctx.store.must_load(vpc_b).await?;
    if doc_a.peering(vpc_b).is_some() || doc_b.peering(vpc_a).is_some() {
        return Err(Error::AlreadyPeered(vpc_a.to_string(), vpc_b.to_string()));
    }

    let pairs = allow_pairs(&doc_a, &doc_b, allow)?;
    let (if_a, if_b) = names::peering_veth_pair(vpc_a, vpc_b);
    info!(vpc_a, vpc_b, link_a = %if_a, link_b = %if_b, "peering vpcs");

    let result = link_bridges(ctx, &doc_a.bridge, &doc_b.bridge, &if_a, &if_b).await;
    let rules_result = match &result {
        Ok(()) => install_allow_rules(ctx, &mut doc_a, &mut doc_b, &pairs).await,
        Err(_) => Ok(()),
    };

    doc_a.peers.push(PeeringRecord {
        peer_vpc: vpc_b.to_string(),
        local_if: if_a.clone(),
        peer_if: if_b.clone(),
        allow_cidrs: pairs.clone(),
    });
    doc_b.peers.push(PeeringRecord {
        peer_vpc: vpc_a.to_string(),
        local_if: if_b,
        peer_if: if_a,
        allow_cidrs: pairs,
    });
    ctx.store.save(&doc_a).await?;
    ctx.store.save(&doc_b).await?;
    result?;
    rules_result
}

fn allow_pairs(a: &VpcDoc, b: &VpcDoc, allow: Option<&[Ipv4Net]>) -> Result<Vec<AllowPair>> {
    let Some(list) = allow else {
        return Ok(vec![
            AllowPair {
                src: a.cidr,
                dst: b.cidr,
            },
            AllowPair {
                src: b.cidr,
                dst: a.cidr,
            },
        ]);
    };

    let mut in_a = Vec::new();
    let mut in_b = Vec::new();
    for net in list {
        if cidr::contains_net(a.cidr, *net) {
            in_a.push(*net);
        } else if cidr::contains_net(b.cidr, *net) {
            in_b.push(*net);
        } else {
            return Err(Error::CidrOutOfRange(format!(
                "{net} is in neither {} nor {}",
                a.name, b.name
            )));
        }
    }
    if in_a.is_empty() || in_b.is_empty() {
        return Err(Error::CidrInvalid(
            "allow list must name at least one range on each side".to_string(),
        ));
    }

    let mut pairs = Vec::with_capacity(in_a.len() * in_b.len() * 2);
    for x in &in_a {
        for y in &in_b {
            pairs.push(AllowPair { src: *x, dst: *y });
            pairs.push(AllowPair { src: *y, dst: *x });
        }
    }
    Ok(pairs)
}

async fn link_bridges(
    ctx: &Context,
    bridge_a: &str,
    bridge_b: &str,
    if_a: &str,
    if_b: &str,
) -> Result<()> {
    let exec = &ctx.exec;
    net::create_veth(exec, if_a, if_b).await?;
    net::attach_to_bridge(exec, if_a, bridge_a).await?;
    net::attach_to_bridge(exec, if_b, bridge_b).await?;
    net::link_up(exec, if_a).await?;
    net::link_up(exec, if_b).await?;
    Ok(())
}

async fn install_allow_rules(
    ctx: &Context,
    a: &mut VpcDoc,
    b: &mut VpcDoc,
    pairs: &[AllowPair],
) -> Result<()> {
    let mgr = ctx.rules();
    for pair in pairs {
        let src_in_a = cidr::contains_net(a.cidr, pair.src);
        let (chain, comment) = if src_in_a {
            (a.chain.clone(), rules::tag(&[&a.name, "peer", &b.name]))
        } else {
            (b.chain.clone(), rules::tag(&[&b.name, "peer", &a.name]))
        };
        let rule = Rule {
            table: Table::Filter,
            chain,
            netns: None,
            matches: vec![
                "-s".to_string(),
                pair.src.to_string(),
                "-d".to_string(),
                pair.dst.to_string(),
            ],
            verdict: Verdict::Accept,
            comment,
        };
        let tokens = mgr.ensure(&rule).await?;
        let log = if src_in_a {
            &mut a.host_iptables
        } else {
            &mut b.host_iptables
        };
        if !log.contains(&tokens) {
            log.push(tokens);
        }
    }
    Ok(())
}

/// Remove the record of a peering with `dead` from `peer`'s document, along
/// with the peer-side chain rules installed for it. Called during
/// `delete(dead)`; a missing peer document is not an error.
pub(crate) async fn unlink_peer(ctx: &Context, dead: &str, peer: &str) -> Result<()> {
    let Some(mut doc) = ctx.store.load(peer).await? else {
        return Ok(());
    };
    doc.peers.retain(|p| p.peer_vpc != dead);

    let tag = rules::tag(&[peer, "peer", dead]);
    let (dead_rules, kept): (Vec<Vec<String>>, Vec<Vec<String>>) = doc
        .host_iptables
        .drain(..)
        .partition(|tokens| tokens.iter().any(|t| *t == tag));
    doc.host_iptables = kept;

    let mgr = ctx.rules();
    for tokens in &dead_rules {
        mgr.delete_recorded(tokens).await;
    }
    ctx.store.save(&doc).await
}

#[cfg(test)]
mod tests {
    use super::*;

    fn doc(name: &str, cidr: &str) -> VpcDoc {
        VpcDoc::new(
            name,
            cidr.parse().unwrap(),
            format!("br-{name}"),
            format!("vpc-{name}"),
        )
    }

    #[test]
    fn default_allow_is_both_full_ranges() {
        let a = doc("a", "10.10.0.0/16");
        let b = doc("b", "10.20.0.0/16");
        let pairs = allow_pairs(&a, &b, None).unwrap();
        assert_eq!(
            pairs,
            vec![
                AllowPair {
                    src: a.cidr,
                    dst: b.cidr
                },
                AllowPair {
                    src: b.cidr,
                    dst: a.cidr
                },
            ]
        );
    }

    #[test]
    fn explicit_allow_builds_bidirectional_pairs() {
        let a = doc("a", "10.10.0.0/16");
        let b = doc("b", "10.20.0.0/16");
        let list: Vec<Ipv4Net> = vec![
            "10.10.1.0/24".parse().unwrap(),
            "10.20.1.0/24".parse().unwrap(),
        ];
        let pairs = allow_pairs(&a, &b, Some(&list)).unwrap();
        assert_eq!(pairs.len(), 2);
        assert_eq!(pairs.first().unwrap().src, list[0]);
        assert_eq!(pairs.first().unwrap().dst, list[1]);
        assert_eq!(pairs.get(1).unwrap().src, list[1]);
    }

    #[test]
    fn allow_range_outside_both_vpcs_is_rejected() {
        let a = doc("a", "10.10.0.0/16");
        let b = doc("b", "10.20.0.0/16");
        let list: Vec<Ipv4Net> = vec!["192.168.0.0/24".parse().unwrap()];
        let err = allow_pairs(&a, &b, Some(&list)).unwrap_err();
        assert!(matches!(err, Error::CidrOutOfRange(_)), "got {err:?}");
    }

    #[test]
    fn one_sided_allow_list_is_rejected() {
        let a = doc("a", "10.10.0.0/16");
        let b = doc("b", "10.20.0.0/16");
        let list: Vec<Ipv4Net> = vec!["10.10.1.0/24".parse().unwrap()];
        let err = allow_pairs(&a, &b, Some(&list)).unwrap_err();
        assert!(matches!(err, Error::CidrInvalid(_)), "got {err:?}");
    }
}
