//! IPv4 prefix arithmetic for vpc and subnet ranges.

use std::net::Ipv4Addr;

use ipnet::Ipv4Net;

use crate::error::{Error, Result};

/// Parse a prefix-form IPv4 range, normalized to its network address.
pub fn parse(s: &str) -> Result<Ipv4Net> {
    let net: Ipv4Net = s
        .parse()
        .map_err(|e| Error::CidrInvalid(format!("{s}: {e}")))?;
    let net = net.trunc();
    validate(net)?;
    Ok(net)
}

/// Reject ranges that cannot hold a gateway plus at least one host.
pub fn validate(net: Ipv4Net) -> Result<()> {
    if net.prefix_len() > 30 {
        return Err(Error::CidrInvalid(format!(
            "{net}: fewer than two usable addresses"
        )));
    }
    Ok(())
}

/// First usable address (network + 1), the conventional gateway.
pub fn first_usable(net: Ipv4Net) -> Ipv4Addr {
    offset(net, 1)
}

/// Second usable address (network + 2), the default namespace-side address.
pub fn second_usable(net: Ipv4Net) -> Ipv4Addr {
    offset(net, 2)
}

fn offset(net: Ipv4Net, n: u32) -> Ipv4Addr {
    Ipv4Addr::from(u32::from(net.network()).wrapping_add(n))
}

/// Prefix networks overlap exactly when one contains the other's base.
pub fn overlaps(a: Ipv4Net, b: Ipv4Net) -> bool {
    a.contains(&b.network()) || b.contains(&a.network())
}

pub fn contains_net(outer: Ipv4Net, inner: Ipv4Net) -> bool {
    outer.contains(&inner.network()) && outer.contains(&inner.broadcast())
}

/// `addr/prefix` form as consumed by `ip addr add`.
pub fn with_prefix(addr: Ipv4Addr, net: Ipv4Net) -> String {
    format!("{addr}/{}", net.prefix_len())
}
