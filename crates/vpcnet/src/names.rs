//! Kernel-safe identifier derivation.
//!
//! Every kernel object this tool creates is named from the logical vpc and
//! subnet names through one deterministic encoder, so metadata and live state
//! can always be cross-referenced by name alone. Role prefixes are reserved
//! on the host:
//!
//! | role          | prefix | cap |
//! |---------------|--------|-----|
//! | bridge        | `br-`  | 15  |
//! | subnet veth   | `v-`   | 15  |
//! | peering veth  | `pv-`  | 15  |
//! | namespace     | `ns-`  | 32  |
//! | filter chain  | `vpc-` | 28  |
//!
//! Link names are capped at IFNAMSIZ − 1. Namespace names are entries under
//! `/var/run/netns` and chains live in xtables, so both take a wider cap.
//! When a candidate exceeds its cap it is right-truncated and suffixed with
//! four hex chars of the SHA-256 of the full logical input.

use sha2::{Digest, Sha256};

pub const BRIDGE_PREFIX: &str = "br-";
pub const NETNS_PREFIX: &str = "ns-";
pub const CHAIN_PREFIX: &str = "vpc-";
pub const VETH_PREFIX: &str = "v-";
pub const PEER_VETH_PREFIX: &str = "pv-";

/// IFNAMSIZ − 1: the longest name the kernel accepts for a link interface.
pub const LINK_NAME_MAX: usize = 15;
/// XT_EXTENSION_MAXNAMELEN − 1: the longest xtables chain name.
const CHAIN_NAME_MAX: usize = 28;
const NETNS_NAME_MAX: usize = 32;

/// Hex chars of hash suffix appended on truncation.
const HASH_LEN: usize = 4;

fn sanitize(logical: &str) -> String {
    logical
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' {
                c.to_ascii_lowercase()
            } else {
                '-'
            }
        })
        .collect()
}

fn short_hash(logical: &str) -> String {
    use std::fmt::Write;

    let digest = Sha256::digest(logical.as_bytes());
    let mut hash = String::with_capacity(HASH_LEN);
    for byte in digest.iter().take(HASH_LEN / 2) {
        let _ = write!(hash, "{byte:02x}");
    }
    hash
}

/// Prefix + sanitized name, truncated with a hash suffix when over `max`.
///
/// Pure and reproducible: the same logical input yields the same identifier
/// on every run. Distinct inputs that collide after truncation are told
/// apart by the hash of the untruncated input.
fn encode(prefix: &str, logical: &str, max: usize) -> String {
    let sanitized = sanitize(logical);
    let candidate = format!("{prefix}{sanitized}");
    if candidate.len() <= max {
        return candidate;
    }
    let hash = short_hash(logical);
    let keep = max - prefix.len() - HASH_LEN - 1;
    let truncated: String = sanitized.chars().take(keep).collect();
    format!("{prefix}{truncated}-{hash}")
}

pub fn bridge_name(vpc: &str) -> String {
    encode(BRIDGE_PREFIX, vpc, LINK_NAME_MAX)
}

pub fn chain_name(vpc: &str) -> String {
    encode(CHAIN_PREFIX, vpc, CHAIN_NAME_MAX)
}

pub fn netns_name(vpc: &str, subnet: &str) -> String {
    encode(NETNS_PREFIX, &format!("{vpc}-{subnet}"), NETNS_NAME_MAX)
}

/// (bridge-side, namespace-side) veth names for a subnet.
pub fn subnet_veth_pair(vpc: &str, subnet: &str) -> (String, String) {
    (
        encode(VETH_PREFIX, &format!("{vpc}-{subnet}-b"), LINK_NAME_MAX),
        encode(VETH_PREFIX, &format!("{vpc}-{subnet}-n"), LINK_NAME_MAX),
    )
}

/// (local-side, peer-side) veth names for a peering.
///
/// Derived from the lexicographically ordered vpc pair, so both call orders
/// yield the same two identifiers.
pub fn peering_veth_pair(local: &str, peer: &str) -> (String, String) {
    let (lo, hi) = if local <= peer {
        (local, peer)
    } else {
        (peer, local)
    };
    let lo_side = encode(PEER_VETH_PREFIX, &format!("{lo}-{hi}-0"), LINK_NAME_MAX);
    let hi_side = encode(PEER_VETH_PREFIX, &format!("{lo}-{hi}-1"), LINK_NAME_MAX);
    if local <= peer {
        (lo_side, hi_side)
    } else {
        (hi_side, lo_side)
    }
}

/// True when `name` carries one of the link-role prefixes (`br-`, `v-`, `pv-`).
pub fn is_reserved_link(name: &str) -> bool {
    name.starts_with(BRIDGE_PREFIX)
        || name.starts_with(PEER_VETH_PREFIX)
        || name.starts_with(VETH_PREFIX)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_names_keep_their_prefix_and_text() {
        assert_eq!(bridge_name("myvpc"), "br-myvpc");
        assert_eq!(chain_name("myvpc"), "vpc-myvpc");
        assert_eq!(netns_name("myvpc", "private"), "ns-myvpc-private");
    }

    #[test]
    fn encoding_is_deterministic() {
        let a = bridge_name("a-rather-long-vpc-name");
        let b = bridge_name("a-rather-long-vpc-name");
        assert_eq!(a, b);
    }

    #[test]
    fn long_names_respect_link_cap() {
        let name = bridge_name("this-vpc-name-is-far-too-long-for-a-link");
        assert!(name.len() <= LINK_NAME_MAX, "got {name}");
        assert!(name.starts_with(BRIDGE_PREFIX));
    }

    #[test]
    fn long_chain_names_respect_chain_cap() {
        let name = chain_name("this-vpc-name-is-far-too-long-for-a-chain");
        assert!(name.len() <= CHAIN_NAME_MAX, "got {name}");
        assert!(name.starts_with(CHAIN_PREFIX));
    }

    #[test]
    fn truncated_names_are_disambiguated() {
        // Identical up to the truncation point, different beyond it.
        let a = bridge_name("identical-prefix-content-alpha");
        let b = bridge_name("identical-prefix-content-bravo");
        assert_ne!(a, b);
        assert!(a.len() <= LINK_NAME_MAX);
        assert!(b.len() <= LINK_NAME_MAX);
    }

    #[test]
    fn odd_characters_are_sanitized() {
        assert_eq!(bridge_name("My VPC!"), "br-my-vpc-");
    }

    #[test]
    fn subnet_veth_sides_differ_and_fit() {
        let (bridge_side, ns_side) = subnet_veth_pair("myvpc", "public");
        assert_ne!(bridge_side, ns_side);
        assert!(bridge_side.len() <= LINK_NAME_MAX);
        assert!(ns_side.len() <= LINK_NAME_MAX);
        assert!(bridge_side.starts_with(VETH_PREFIX));
    }

    #[test]
    fn peering_veth_is_symmetric_in_call_order() {
        let (a_local, a_peer) = peering_veth_pair("myvpc", "othervpc");
        let (b_local, b_peer) = peering_veth_pair("othervpc", "myvpc");
        assert_eq!(a_local, b_peer);
        assert_eq!(a_peer, b_local);
        assert!(a_local.starts_with(PEER_VETH_PREFIX));
        assert!(a_local.len() <= LINK_NAME_MAX);
    }

    #[test]
    fn reserved_link_prefixes_are_recognized() {
        assert!(is_reserved_link("br-myvpc"));
        assert!(is_reserved_link("v-myvpc-pu-01ab"));
        assert!(is_reserved_link("pv-a-b-0"));
        assert!(!is_reserved_link("eth0"));
        assert!(!is_reserved_link("docker0"));
    }
}
