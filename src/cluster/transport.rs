//! Replication Transport
//!
//! Point-to-point and broadcast message RPC over HTTP, plus replica
//! placement selection. Replication is best-effort: a network failure is
//! recorded in metrics and reported as `false`, never propagated as an
//! error — the local request must not fail because a peer is down.

use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Duration;

use rand::seq::SliceRandom;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::cluster::messages::ClusterMessage;
use crate::cluster::node::{Membership, NodeId, Placement};
use crate::metrics::Metrics;

pub struct Transport {
    client: reqwest::Client,
    membership: Arc<Membership>,
    metrics: Arc<Metrics>,
    http_port: u16,
}

impl Transport {
    pub fn new(
        membership: Arc<Membership>,
        metrics: Arc<Metrics>,
        http_port: u16,
        network_timeout_ms: u64,
    ) -> Transport {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_millis(network_timeout_ms))
            .build()
            .unwrap_or_default();
        Transport {
            client,
            membership,
            metrics,
            http_port,
        }
    }

    /// Point-to-point RPC. Returns `true` when the peer acknowledged with a
    /// 2xx status.
    pub async fn send_to_node(&self, node: NodeId, ip: Ipv4Addr, message: &ClusterMessage) -> bool {
        if node == self.membership.local_id() {
            // Local effects are applied by the caller; nothing to send.
            return true;
        }
        Metrics::incr(&self.metrics.messages_sent);
        let url = format!("http://{ip}:{}/post", self.http_port);
        match self.client.post(&url).json(message).send().await {
            Ok(response) if response.status().is_success() => {
                debug!(peer = %node, kind = message.kind(), "message delivered");
                true
            }
            Ok(response) => {
                Metrics::incr(&self.metrics.messages_failed);
                warn!(peer = %node, status = %response.status(), kind = message.kind(), "peer rejected message");
                false
            }
            Err(e) => {
                Metrics::incr(&self.metrics.messages_failed);
                warn!(peer = %node, error = %e, kind = message.kind(), "message send failed");
                false
            }
        }
    }

    /// Fire-and-forget fan-out to every current member except self.
    pub async fn broadcast_all_nodes(&self, message: &ClusterMessage) {
        Metrics::incr(&self.metrics.broadcasts);
        let local = self.membership.local_id();
        let peers: Vec<_> = self
            .membership
            .members()
            .into_iter()
            .filter(|n| n.id != local)
            .collect();
        let sends = peers
            .iter()
            .map(|peer| self.send_to_node(peer.id, peer.ip, message));
        futures::future::join_all(sends).await;
    }

    /// Picks two distinct holders from the current membership when the
    /// cluster has at least two members; a single-node cluster holds both
    /// replicas itself.
    pub fn pick_primary_secondary(&self) -> Placement {
        let mut ids = self.membership.member_ids();
        ids.shuffle(&mut rand::thread_rng());
        match ids.len() {
            0 => {
                let local = self.membership.local_id();
                Placement {
                    primary: local,
                    secondary: local,
                }
            }
            1 => Placement {
                primary: ids[0],
                secondary: ids[0],
            },
            _ => Placement {
                primary: ids[0],
                secondary: ids[1],
            },
        }
    }

    /// Membership lookup used by callers that only have a node id.
    pub fn ip_from_node_id(&self, id: NodeId) -> Option<Ipv4Addr> {
        self.membership.ip_of(id)
    }

    /// Asks a holder for every row of a table. Used by scans running on a
    /// node that holds no replica of some rows. Errors degrade to `None` so
    /// the caller can retry the other holder.
    pub async fn request_table_rows(
        &self,
        ip: Ipv4Addr,
        db: &str,
        table: &str,
    ) -> Option<Vec<(Uuid, serde_json::Value)>> {
        Metrics::incr(&self.metrics.messages_sent);
        let url = format!("http://{ip}:{}/post", self.http_port);
        let message = ClusterMessage::MetaRequest {
            db: Some(db.to_string()),
            table: Some(table.to_string()),
        };
        let response = match self.client.post(&url).json(&message).send().await {
            Ok(r) if r.status().is_success() => r,
            Ok(r) => {
                Metrics::incr(&self.metrics.messages_failed);
                warn!(peer = %ip, status = %r.status(), "row fetch rejected");
                return None;
            }
            Err(e) => {
                Metrics::incr(&self.metrics.messages_failed);
                warn!(peer = %ip, error = %e, "row fetch failed");
                return None;
            }
        };
        let body: serde_json::Value = response.json().await.ok()?;
        let rows = body.get("rows")?.as_object()?;
        Some(
            rows.iter()
                .filter_map(|(id, json)| Some((id.parse().ok()?, json.clone())))
                .collect(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::node::now_ms;

    fn harness(member_count: usize) -> Transport {
        let membership = Arc::new(Membership::new(
            Uuid::new_v4(),
            Ipv4Addr::new(10, 0, 0, 1),
        ));
        for i in 0..member_count.saturating_sub(1) {
            membership.upsert(
                Uuid::new_v4(),
                Ipv4Addr::new(10, 0, 0, 2 + i as u8),
                now_ms(),
            );
        }
        Transport::new(membership, Arc::new(Metrics::new()), 59_985, 100)
    }

    #[test]
    fn placement_is_distinct_with_two_or_more_members() {
        let transport = harness(3);
        for _ in 0..50 {
            let placement = transport.pick_primary_secondary();
            assert_ne!(placement.primary, placement.secondary);
        }
    }

    #[test]
    fn single_node_cluster_holds_both_replicas() {
        let transport = harness(1);
        let placement = transport.pick_primary_secondary();
        assert_eq!(placement.primary, placement.secondary);
    }

    #[tokio::test]
    async fn send_to_unreachable_peer_returns_false() {
        let transport = harness(1);
        let delivered = transport
            .send_to_node(
                Uuid::new_v4(),
                Ipv4Addr::new(127, 0, 0, 1),
                &ClusterMessage::MetaRequest {
                    db: None,
                    table: None,
                },
            )
            .await;
        assert!(!delivered);
        assert_eq!(
            transport
                .metrics
                .messages_failed
                .load(std::sync::atomic::Ordering::Relaxed),
            1
        );
    }
}
