//! Subnet attachment: namespace, veth plumbing, addressing, default policy.

use std::net::Ipv4Addr;

use ipnet::Ipv4Net;
use tracing::info;

use crate::cidr;
use crate::context::Context;
use crate::error::{Error, Result};
use crate::names;
use crate::net;
use crate::policy;
use crate::types::{SubnetRecord, VethPair, VpcDoc};

/// Attach a subnet to a vpc.
///
/// The subnet becomes a namespace joined to the vpc bridge by a veth pair;
/// the namespace side carries the second usable address, the gateway (first
/// usable unless supplied) is answered by the bridge. Every new subnet gets
/// the default policy applied unconditionally.
pub async fn add_subnet(
    ctx: &Context,
    vpc: &str,
    name: &str,
    subnet_cidr: Ipv4Net,
    gw: Option<Ipv4Addr>,
) -> Result<SubnetRecord> {
    cidr::validate(subnet_cidr)?;
    let _lock = ctx.store.lock().await?;
    let mut doc = ctx.store.must_load(vpc).await?;

    if doc.subnet(name).is_some() {
        return Err(Error::Exists(format!("subnet {name} in vpc {vpc}")));
    }
    if !cidr::contains_net(doc.cidr, subnet_cidr) {
        return Err(Error::CidrOutOfRange(format!(
            "{subnet_cidr} not within vpc range {}",
            doc.cidr
        )));
    }
    if let Some(existing) = doc
        .subnets
        .iter()
        .find(|s| cidr::overlaps(s.cidr, subnet_cidr))
    {
        return Err(Error::CidrOverlap(format!(
            "{subnet_cidr} overlaps subnet {} ({})",
            existing.name, existing.cidr
        )));
    }
    let gw = match gw {
        Some(addr) if !subnet_cidr.contains(&addr) => {
            return Err(Error::CidrOutOfRange(format!(
                "gateway {addr} not within {subnet_cidr}"
            )));
        }
        Some(addr) => addr,
        None => cidr::first_usable(subnet_cidr),
    };

    let ns = names::netns_name(vpc, name);
    let (bridge_side, ns_side) = names::subnet_veth_pair(vpc, name);
    info!(vpc, subnet = name, cidr = %subnet_cidr, ns = %ns, "adding subnet");

    let record = SubnetRecord {
        name: name.to_string(),
        cidr: subnet_cidr,
        ns,
        gw,
        host_ip: cidr::second_usable(subnet_cidr),
        veth: VethPair {
            bridge_side,
            ns_side,
        },
    };

    let result = materialize(ctx, &doc, &record).await;
    doc.subnets.push(record.clone());
    let policy_result = match &result {
        Ok(()) => apply_default_policy(ctx, vpc, &mut doc, &record).await,
        Err(_) => Ok(()),
    };
    ctx.store.save(&doc).await?;
    result?;
    policy_result?;
    Ok(record)
}

async fn materialize(ctx: &Context, doc: &VpcDoc, sub: &SubnetRecord) -> Result<()> {
    let exec = &ctx.exec;
    net::create_netns(exec, &sub.ns).await?;
    net::create_veth(exec, &sub.veth.bridge_side, &sub.veth.ns_side).await?;
    net::attach_to_bridge(exec, &sub.veth.bridge_side, &doc.bridge).await?;
    net::link_up(exec, &sub.veth.bridge_side).await?;
    net::move_to_netns(exec, &sub.veth.ns_side, &sub.ns).await?;
    net::addr_add_in_ns(exec, &sub.ns, &sub.veth.ns_side, sub.host_ip, sub.cidr).await?;
    net::link_up_in_ns(exec, &sub.ns, &sub.veth.ns_side).await?;
    // The bridge answers for every subnet gateway.
    net::addr_add(exec, &doc.bridge, sub.gw, sub.cidr).await?;
    net::default_route_in_ns(exec, &sub.ns, sub.gw).await?;
    Ok(())
}

async fn apply_default_policy(
    ctx: &Context,
    vpc: &str,
    doc: &mut VpcDoc,
    sub: &SubnetRecord,
) -> Result<()> {
    let default = policy::default_policy(sub.cidr);
    let result = policy::install(ctx, vpc, sub, &default).await;
    policy::record(&mut doc.policies, &sub.name, &default);
    ctx.store.save_policy(vpc, &sub.name, &default).await?;
    result
}
