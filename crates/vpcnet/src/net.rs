//! Idempotent wrappers over the `ip` and `sysctl` tools.
//!
//! Each primitive probes for its target condition and skips the mutation
//! when already satisfied, so re-running an operation converges instead of
//! failing. Deletions run unconditionally in dry-run so the teardown plan is
//! fully traced.

use std::net::Ipv4Addr;

use ipnet::Ipv4Net;
use tracing::debug;

use crate::cidr;
use crate::command::{Executor, argv};
use crate::error::Result;

fn ip_cmd(args: &[&str]) -> Vec<String> {
    let mut out = vec!["ip".to_string()];
    out.extend(args.iter().map(|s| s.to_string()));
    out
}

fn ip_in_ns(ns: &str, args: &[&str]) -> Vec<String> {
    let mut out = argv(&["ip", "netns", "exec", ns, "ip"]);
    out.extend(args.iter().map(|s| s.to_string()));
    out
}

async fn link_exists(exec: &Executor, name: &str) -> Result<bool> {
    exec.probe(&ip_cmd(&["link", "show", "dev", name])).await
}

async fn link_exists_in_ns(exec: &Executor, ns: &str, name: &str) -> Result<bool> {
    exec.probe(&ip_in_ns(ns, &["link", "show", "dev", name]))
        .await
}

async fn addr_present(exec: &Executor, dev: &str, addr_prefix: &str) -> bool {
    if exec.is_dry_run() {
        return false;
    }
    match exec
        .query(&ip_cmd(&["-o", "addr", "show", "dev", dev]))
        .await
    {
        Ok(out) => out.split_whitespace().any(|w| w == addr_prefix),
        Err(_) => false,
    }
}

async fn addr_present_in_ns(exec: &Executor, ns: &str, dev: &str, addr_prefix: &str) -> bool {
    if exec.is_dry_run() {
        return false;
    }
    match exec
        .query(&ip_in_ns(ns, &["-o", "addr", "show", "dev", dev]))
        .await
    {
        Ok(out) => out.split_whitespace().any(|w| w == addr_prefix),
        Err(_) => false,
    }
}

pub async fn create_bridge(exec: &Executor, name: &str) -> Result<()> {
    if link_exists(exec, name).await? {
        debug!(bridge = name, "bridge already present");
        return Ok(());
    }
    exec.run(&ip_cmd(&["link", "add", name, "type", "bridge"]))
        .await?;
    Ok(())
}

/// Assign `addr/prefix` to a host link, skipping when already assigned.
pub async fn addr_add(exec: &Executor, dev: &str, addr: Ipv4Addr, net: Ipv4Net) -> Result<()> {
    let addr_prefix = cidr::with_prefix(addr, net);
    if addr_present(exec, dev, &addr_prefix).await {
        debug!(dev, addr = %addr_prefix, "address already assigned");
        return Ok(());
    }
    exec.run(&ip_cmd(&["addr", "add", &addr_prefix, "dev", dev]))
        .await?;
    Ok(())
}

/// Bring a host link up. `ip link set up` converges on its own.
pub async fn link_up(exec: &Executor, dev: &str) -> Result<()> {
    exec.run(&ip_cmd(&["link", "set", "dev", dev, "up"])).await?;
    Ok(())
}

/// Delete a host link if present (live) or unconditionally (dry-run).
pub async fn delete_link(exec: &Executor, name: &str) -> Result<()> {
    if !exec.is_dry_run() && !link_exists(exec, name).await? {
        return Ok(());
    }
    exec.run(&ip_cmd(&["link", "del", name])).await?;
    Ok(())
}

pub async fn netns_exists(exec: &Executor, ns: &str) -> Result<bool> {
    if exec.is_dry_run() {
        return Ok(false);
    }
    let out = exec.query(&ip_cmd(&["netns", "list"])).await?;
    Ok(out
        .lines()
        .filter_map(|line| line.split_whitespace().next())
        .any(|name| name == ns))
}

/// Create a namespace and bring its loopback up.
pub async fn create_netns(exec: &Executor, ns: &str) -> Result<()> {
    if netns_exists(exec, ns).await? {
        debug!(ns, "namespace already present");
    } else {
        exec.run(&ip_cmd(&["netns", "add", ns])).await?;
    }
    exec.run(&ip_in_ns(ns, &["link", "set", "lo", "up"])).await?;
    Ok(())
}

pub async fn delete_netns(exec: &Executor, ns: &str) -> Result<()> {
    if !exec.is_dry_run() && !netns_exists(exec, ns).await? {
        return Ok(());
    }
    exec.run(&ip_cmd(&["netns", "del", ns])).await?;
    Ok(())
}

/// Create a veth pair on the host.
pub async fn create_veth(exec: &Executor, side_a: &str, side_b: &str) -> Result<()> {
    if link_exists(exec, side_a).await? {
        debug!(veth = side_a, "veth already present");
        return Ok(());
    }
    exec.run(&ip_cmd(&[
        "link", "add", side_a, "type", "veth", "peer", "name", side_b,
    ]))
    .await?;
    Ok(())
}

/// Enslave a host link to a bridge. Re-running converges.
pub async fn attach_to_bridge(exec: &Executor, dev: &str, bridge: &str) -> Result<()> {
    exec.run(&ip_cmd(&["link", "set", "dev", dev, "master", bridge]))
        .await?;
    Ok(())
}

/// Move a host link into a namespace, skipping when it is already there.
pub async fn move_to_netns(exec: &Executor, dev: &str, ns: &str) -> Result<()> {
    if !exec.is_dry_run()
        && !link_exists(exec, dev).await?
        && link_exists_in_ns(exec, ns, dev).await?
    {
        debug!(dev, ns, "link already in namespace");
        return Ok(());
    }
    exec.run(&ip_cmd(&["link", "set", "dev", dev, "netns", ns]))
        .await?;
    Ok(())
}

/// Assign `addr/prefix` to a link inside a namespace.
pub async fn addr_add_in_ns(
    exec: &Executor,
    ns: &str,
    dev: &str,
    addr: Ipv4Addr,
    net: Ipv4Net,
) -> Result<()> {
    let addr_prefix = cidr::with_prefix(addr, net);
    if addr_present_in_ns(exec, ns, dev, &addr_prefix).await {
        debug!(ns, dev, addr = %addr_prefix, "address already assigned");
        return Ok(());
    }
    exec.run(&ip_in_ns(ns, &["addr", "add", &addr_prefix, "dev", dev]))
        .await?;
    Ok(())
}

pub async fn link_up_in_ns(exec: &Executor, ns: &str, dev: &str) -> Result<()> {
    exec.run(&ip_in_ns(ns, &["link", "set", "dev", dev, "up"]))
        .await?;
    Ok(())
}

/// Install the namespace default route. `route replace` converges.
pub async fn default_route_in_ns(exec: &Executor, ns: &str, gw: Ipv4Addr) -> Result<()> {
    exec.run(&ip_in_ns(
        ns,
        &["route", "replace", "default", "via", &gw.to_string()],
    ))
    .await?;
    Ok(())
}

/// Enable host-global IPv4 forwarding, once.
pub async fn enable_ip_forward(exec: &Executor) -> Result<()> {
    if !exec.is_dry_run()
        && let Ok(current) = exec
            .query(&argv(&["sysctl", "-n", "net.ipv4.ip_forward"]))
            .await
        && current.trim() == "1"
    {
        debug!("ipv4 forwarding already enabled");
        return Ok(());
    }
    exec.run(&argv(&["sysctl", "-w", "net.ipv4.ip_forward=1"]))
        .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::{DEFAULT_TIMEOUT, ExecMode};

    fn dry() -> Executor {
        Executor::new(ExecMode::DryRun, DEFAULT_TIMEOUT)
    }

    #[tokio::test]
    async fn bridge_creation_is_traced_in_dry_run() {
        let exec = dry();
        create_bridge(&exec, "br-myvpc").await.unwrap();
        addr_add(&exec, "br-myvpc", "10.10.0.1".parse().unwrap(), "10.10.0.0/16".parse().unwrap())
            .await
            .unwrap();
        link_up(&exec, "br-myvpc").await.unwrap();
        let traced = exec.traced();
        assert_eq!(
            traced,
            vec![
                "ip link add br-myvpc type bridge",
                "ip addr add 10.10.0.1/16 dev br-myvpc",
                "ip link set dev br-myvpc up",
            ]
        );
    }

    #[tokio::test]
    async fn namespace_setup_commands() {
        let exec = dry();
        create_netns(&exec, "ns-myvpc-public").await.unwrap();
        let traced = exec.traced();
        assert_eq!(
            traced,
            vec![
                "ip netns add ns-myvpc-public",
                "ip netns exec ns-myvpc-public ip link set lo up",
            ]
        );
    }

    #[tokio::test]
    async fn veth_plumbing_commands() {
        let exec = dry();
        create_veth(&exec, "v-a-b", "v-a-n").await.unwrap();
        attach_to_bridge(&exec, "v-a-b", "br-a").await.unwrap();
        move_to_netns(&exec, "v-a-n", "ns-a-s").await.unwrap();
        let traced = exec.traced();
        assert_eq!(
            traced,
            vec![
                "ip link add v-a-b type veth peer name v-a-n",
                "ip link set dev v-a-b master br-a",
                "ip link set dev v-a-n netns ns-a-s",
            ]
        );
    }

    #[tokio::test]
    async fn namespace_addressing_commands() {
        let exec = dry();
        addr_add_in_ns(
            &exec,
            "ns-a-s",
            "v-a-n",
            "10.10.1.2".parse().unwrap(),
            "10.10.1.0/24".parse().unwrap(),
        )
        .await
        .unwrap();
        default_route_in_ns(&exec, "ns-a-s", "10.10.1.1".parse().unwrap())
            .await
            .unwrap();
        let traced = exec.traced();
        assert_eq!(
            traced,
            vec![
                "ip netns exec ns-a-s ip addr add 10.10.1.2/24 dev v-a-n",
                "ip netns exec ns-a-s ip route replace default via 10.10.1.1",
            ]
        );
    }

    #[tokio::test]
    async fn deletions_are_traced_in_dry_run() {
        let exec = dry();
        delete_link(&exec, "br-myvpc").await.unwrap();
        delete_netns(&exec, "ns-myvpc-public").await.unwrap();
        let traced = exec.traced();
        assert_eq!(
            traced,
            vec!["ip link del br-myvpc", "ip netns del ns-myvpc-public"]
        );
    }

    #[tokio::test]
    async fn forwarding_sysctl_is_traced_in_dry_run() {
        let exec = dry();
        enable_ip_forward(&exec).await.unwrap();
        assert_eq!(exec.traced(), vec!["sysctl -w net.ipv4.ip_forward=1"]);
    }
}
