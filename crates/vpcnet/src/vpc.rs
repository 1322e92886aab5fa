//! Vpc lifecycle: create, delete, cleanup, list, inspect.

use ipnet::Ipv4Net;
use tracing::{info, warn};

use crate::app;
use crate::cidr;
use crate::context::Context;
use crate::error::{Error, Result};
use crate::names;
use crate::net;
use crate::peering;
use crate::rules::{self, Rule, Table, Verdict};
use crate::types::VpcDoc;

/// Create a vpc: bridge with the range's first usable address, dedicated
/// filter chain jumped to from FORWARD, host forwarding enabled.
///
/// Validation failures abort before any kernel mutation. A mid-flight
/// execution failure still writes the document so `delete` can unwind
/// whatever was materialized.
pub async fn create(ctx: &Context, name: &str, vpc_cidr: Ipv4Net) -> Result<VpcDoc> {
    cidr::validate(vpc_cidr)?;
    let _lock = ctx.store.lock().await?;
    if ctx.store.load(name).await?.is_some() {
        return Err(Error::Exists(format!("vpc {name}")));
    }

    let bridge = names::bridge_name(name);
    let chain = names::chain_name(name);
    info!(vpc = name, cidr = %vpc_cidr, bridge = %bridge, chain = %chain, "creating vpc");

    let mut doc = VpcDoc::new(name, vpc_cidr, bridge, chain);
    let result = materialize(ctx, &mut doc).await;
    ctx.store.save(&doc).await?;
    result.map(|()| doc)
}

async fn materialize(ctx: &Context, doc: &mut VpcDoc) -> Result<()> {
    net::create_bridge(&ctx.exec, &doc.bridge).await?;
    net::addr_add(
        &ctx.exec,
        &doc.bridge,
        cidr::first_usable(doc.cidr),
        doc.cidr,
    )
    .await?;
    net::link_up(&ctx.exec, &doc.bridge).await?;
    net::enable_ip_forward(&ctx.exec).await?;

    let mgr = ctx.rules();
    mgr.ensure_chain(&doc.chain, None).await?;
    let jump = Rule {
        table: Table::Filter,
        chain: "FORWARD".to_string(),
        netns: None,
        matches: Vec::new(),
        verdict: Verdict::Jump(doc.chain.clone()),
        comment: rules::tag(&[&doc.name]),
    };
    doc.host_iptables.push(mgr.ensure(&jump).await?);
    Ok(())
}

/// Tear down a vpc and everything it owns.
///
/// Per-step failures are downgraded to warnings; the only hard error is
/// failing to persist the final (absent) state.
pub async fn delete(ctx: &Context, name: &str) -> Result<()> {
    let _lock = ctx.store.lock().await?;
    let doc = ctx.store.must_load(name).await?;
    info!(vpc = name, "deleting vpc");

    // Workloads first so nothing is left running inside the namespaces.
    app::stop_all(ctx, &doc).await;

    // Replay the host rule log in reverse.
    let mgr = ctx.rules();
    for recorded in doc.host_iptables.iter().rev() {
        mgr.delete_recorded(recorded).await;
    }

    // Unlink peerings and scrub the mirror records.
    for record in &doc.peers {
        if let Err(e) = net::delete_link(&ctx.exec, &record.local_if).await {
            warn!(link = %record.local_if, error = %e, "peering veth removal failed");
        }
        if let Err(e) = peering::unlink_peer(ctx, name, &record.peer_vpc).await {
            warn!(peer = %record.peer_vpc, error = %e, "peer document update failed");
        }
    }

    for subnet in &doc.subnets {
        if let Err(e) = net::delete_link(&ctx.exec, &subnet.veth.bridge_side).await {
            warn!(link = %subnet.veth.bridge_side, error = %e, "veth removal failed");
        }
        if let Err(e) = net::delete_netns(&ctx.exec, &subnet.ns).await {
            warn!(ns = %subnet.ns, error = %e, "namespace removal failed");
        }
    }

    if let Err(e) = net::delete_link(&ctx.exec, &doc.bridge).await {
        warn!(bridge = %doc.bridge, error = %e, "bridge removal failed");
    }
    mgr.remove_chain(&doc.chain).await;

    ctx.store.remove(name).await
}

/// Delete every vpc in the store, in name order.
pub async fn cleanup_all(ctx: &Context) -> Result<Vec<String>> {
    let names = ctx.store.list().await?;
    for name in &names {
        match delete(ctx, name).await {
            Ok(()) | Err(Error::NotFound(_)) => {}
            Err(e) => return Err(e),
        }
    }
    Ok(names)
}

pub async fn list(ctx: &Context) -> Result<Vec<String>> {
    ctx.store.list().await
}

/// The vpc document, verbatim.
pub async fn inspect(ctx: &Context, name: &str) -> Result<VpcDoc> {
    ctx.store.must_load(name).await
}
