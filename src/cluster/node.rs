//! Node Identity and Membership
//!
//! Every node has a stable UUID identity persisted under the data directory,
//! so a restart keeps its cluster identity. The membership map holds every
//! node seen alive during the latest sweep; the coordinator is the member
//! with the numerically smallest IP.

use std::net::Ipv4Addr;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};

use dashmap::DashMap;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::info;
use uuid::Uuid;

use crate::errors::SerengetiResult;

pub type NodeId = Uuid;

const NODE_ID_FILE: &str = "node.id";

/// Primary/secondary holders for one row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Placement {
    pub primary: NodeId,
    pub secondary: NodeId,
}

impl Placement {
    pub fn holds(&self, node: NodeId) -> bool {
        self.primary == node || self.secondary == node
    }
}

/// One member as tracked by discovery.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeInfo {
    pub id: NodeId,
    pub ip: Ipv4Addr,
    /// Stamp of the sweep that last confirmed this node.
    pub last_checked_ms: u64,
}

/// Thread-safe membership view shared by discovery, transport, and the
/// persistence scheduler.
pub struct Membership {
    local_id: NodeId,
    local_ip: RwLock<Ipv4Addr>,
    nodes: DashMap<NodeId, NodeInfo>,
    coordinator: RwLock<Option<NodeId>>,
    online: AtomicBool,
}

impl Membership {
    pub fn new(local_id: NodeId, local_ip: Ipv4Addr) -> Membership {
        let membership = Membership {
            local_id,
            local_ip: RwLock::new(local_ip),
            nodes: DashMap::new(),
            coordinator: RwLock::new(None),
            online: AtomicBool::new(true),
        };
        // The local node is always a member.
        membership.upsert(local_id, local_ip, now_ms());
        membership
    }

    pub fn local_id(&self) -> NodeId {
        self.local_id
    }

    pub fn local_ip(&self) -> Ipv4Addr {
        *self.local_ip.read()
    }

    pub fn set_local_ip(&self, ip: Ipv4Addr) {
        *self.local_ip.write() = ip;
        self.upsert(self.local_id, ip, now_ms());
    }

    /// Records a node as alive at the given sweep stamp.
    pub fn upsert(&self, id: NodeId, ip: Ipv4Addr, checked_ms: u64) {
        self.nodes.insert(
            id,
            NodeInfo {
                id,
                ip,
                last_checked_ms: checked_ms,
            },
        );
    }

    /// Evicts every node not confirmed since `sweep_start_ms` (except the
    /// local node) and returns the evicted set.
    pub fn evict_stale(&self, sweep_start_ms: u64) -> Vec<NodeInfo> {
        let stale: Vec<NodeInfo> = self
            .nodes
            .iter()
            .filter(|entry| entry.id != self.local_id && entry.last_checked_ms < sweep_start_ms)
            .map(|entry| entry.value().clone())
            .collect();
        for node in &stale {
            self.nodes.remove(&node.id);
            info!(node = %node.id, ip = %node.ip, "evicted unreachable node");
        }
        stale
    }

    pub fn members(&self) -> Vec<NodeInfo> {
        self.nodes.iter().map(|e| e.value().clone()).collect()
    }

    pub fn member_ids(&self) -> Vec<NodeId> {
        self.nodes.iter().map(|e| *e.key()).collect()
    }

    pub fn size(&self) -> usize {
        self.nodes.len()
    }

    pub fn contains(&self, id: NodeId) -> bool {
        self.nodes.contains_key(&id)
    }

    pub fn ip_of(&self, id: NodeId) -> Option<Ipv4Addr> {
        self.nodes.get(&id).map(|entry| entry.ip)
    }

    /// Elects the member with the numerically smallest IP. Eventual and
    /// monotonic within a stable membership set.
    pub fn elect_coordinator(&self) -> Option<NodeId> {
        let winner = self
            .nodes
            .iter()
            .min_by_key(|entry| entry.ip.octets())
            .map(|entry| entry.id);
        *self.coordinator.write() = winner;
        winner
    }

    pub fn coordinator(&self) -> Option<NodeId> {
        *self.coordinator.read()
    }

    pub fn is_coordinator(&self) -> bool {
        self.coordinator() == Some(self.local_id)
    }

    pub fn is_online(&self) -> bool {
        self.online.load(Ordering::SeqCst)
    }

    pub fn set_online(&self, online: bool) {
        self.online.store(online, Ordering::SeqCst);
    }
}

/// Loads the node id persisted under `data_path`, creating one on first
/// boot. The id survives restarts by contract.
pub fn load_or_create_node_id(data_path: &Path) -> SerengetiResult<NodeId> {
    let path = data_path.join(NODE_ID_FILE);
    if path.exists() {
        let raw = std::fs::read_to_string(&path)?;
        if let Ok(id) = raw.trim().parse::<Uuid>() {
            return Ok(id);
        }
    }
    let id = Uuid::new_v4();
    std::fs::create_dir_all(data_path)?;
    std::fs::write(&path, id.to_string())?;
    info!(node = %id, "generated new node identity");
    Ok(id)
}

/// Best-effort local IPv4 detection: a connected UDP socket reveals the
/// interface address the OS would route through; falls back to loopback.
pub fn detect_local_ip() -> Ipv4Addr {
    let probe = || -> std::io::Result<Ipv4Addr> {
        let socket = std::net::UdpSocket::bind("0.0.0.0:0")?;
        socket.connect("8.8.8.8:80")?;
        match socket.local_addr()? {
            std::net::SocketAddr::V4(addr) => Ok(*addr.ip()),
            std::net::SocketAddr::V6(_) => Err(std::io::Error::new(
                std::io::ErrorKind::Other,
                "no local ipv4",
            )),
        }
    };
    probe().unwrap_or(Ipv4Addr::LOCALHOST)
}

pub fn now_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
