//! The durable data model: one document per vpc.

use std::net::Ipv4Addr;

use chrono::{DateTime, Utc};
use ipnet::Ipv4Net;
use serde::{Deserialize, Serialize};

use crate::policy::PolicyDoc;

/// Identifiers of the two ends of a veth pair.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VethPair {
    pub bridge_side: String,
    pub ns_side: String,
}

/// A subnet materialized as a namespace joined to the vpc bridge.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubnetRecord {
    pub name: String,
    pub cidr: Ipv4Net,
    pub ns: String,
    pub gw: Ipv4Addr,
    pub host_ip: Ipv4Addr,
    pub veth: VethPair,
}

/// A deployed test workload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppRecord {
    pub ns: String,
    pub port: u16,
    pub pid: u32,
    pub command: Vec<String>,
}

/// One permitted source/destination pair across a peering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AllowPair {
    pub src: Ipv4Net,
    pub dst: Ipv4Net,
}

/// One side of a vpc peering; the peer document holds the mirror record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeeringRecord {
    pub peer_vpc: String,
    pub local_if: String,
    pub peer_if: String,
    pub allow_cidrs: Vec<AllowPair>,
}

/// NAT attachment for a set of subnets through one host egress interface.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NatRecord {
    pub interface: String,
    pub subnets: Vec<String>,
}

/// A policy applied to a subnet, kept for inspection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AppliedPolicy {
    pub subnet: String,
    pub policy: PolicyDoc,
}

/// The durable declarative state of one vpc.
///
/// The document exclusively owns every kernel object its fields name; a
/// peering is co-owned, recorded by value on both sides. `host_iptables` is
/// the replay log: the exact tokenized add-form of every host rule installed,
/// replayed in reverse at teardown.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VpcDoc {
    pub name: String,
    pub cidr: Ipv4Net,
    pub bridge: String,
    pub chain: String,
    #[serde(default)]
    pub subnets: Vec<SubnetRecord>,
    #[serde(default)]
    pub host_iptables: Vec<Vec<String>>,
    #[serde(default)]
    pub apps: Vec<AppRecord>,
    #[serde(default)]
    pub peers: Vec<PeeringRecord>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nat: Option<NatRecord>,
    #[serde(default)]
    pub policies: Vec<AppliedPolicy>,
    pub created_at: DateTime<Utc>,
}

impl VpcDoc {
    pub fn new(name: &str, cidr: Ipv4Net, bridge: String, chain: String) -> Self {
        Self {
            name: name.to_string(),
            cidr,
            bridge,
            chain,
            subnets: Vec::new(),
            host_iptables: Vec::new(),
            apps: Vec::new(),
            peers: Vec::new(),
            nat: None,
            policies: Vec::new(),
            created_at: Utc::now(),
        }
    }

    pub fn subnet(&self, name: &str) -> Option<&SubnetRecord> {
        self.subnets.iter().find(|s| s.name == name)
    }

    pub fn peering(&self, peer_vpc: &str) -> Option<&PeeringRecord> {
        self.peers.iter().find(|p| p.peer_vpc == peer_vpc)
    }
}
