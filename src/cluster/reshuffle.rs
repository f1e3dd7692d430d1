//! Lost-Node Reshuffle
//!
//! When discovery evicts a node, every row that listed it as a replica
//! holder must be re-homed. The worker debounces lost-node events so a
//! transiently unreachable peer that comes back within the window causes no
//! data movement. For each affected row it keeps the surviving holder,
//! picks a replacement from the current membership, pushes the row to the
//! replacement with a `ReplicateInsertObject`, updates the local placement
//! map, and broadcasts the new placement.

use std::sync::Arc;
use std::time::Duration;

use rand::seq::SliceRandom;
use tokio::sync::{mpsc, watch};
use tracing::{info, warn};
use uuid::Uuid;

use crate::cluster::messages::ClusterMessage;
use crate::cluster::node::{Membership, NodeId, NodeInfo, Placement};
use crate::cluster::transport::Transport;
use crate::config::ClusterConfig;

/// A row whose placement references a given node.
#[derive(Debug, Clone)]
pub struct RowLocation {
    pub db: String,
    pub table: String,
    pub row_id: Uuid,
    pub placement: Placement,
}

/// Narrow catalog interface the reshuffle worker needs; implemented by the
/// catalog so the cluster layer never owns it.
pub trait CatalogView: Send + Sync {
    /// Every row whose placement names `node` as primary or secondary.
    fn rows_placed_on(&self, node: NodeId) -> Vec<RowLocation>;
    /// Row payload for re-replication; `None` when the row is not local.
    fn row_payload(&self, db: &str, table: &str, row_id: Uuid) -> Option<serde_json::Value>;
    /// Commits a new placement locally.
    fn update_placement(&self, db: &str, table: &str, row_id: Uuid, placement: Placement);
}

pub struct ReshuffleWorker {
    membership: Arc<Membership>,
    transport: Arc<Transport>,
    catalog: Arc<dyn CatalogView>,
    config: ClusterConfig,
}

impl ReshuffleWorker {
    pub fn new(
        membership: Arc<Membership>,
        transport: Arc<Transport>,
        catalog: Arc<dyn CatalogView>,
        config: ClusterConfig,
    ) -> ReshuffleWorker {
        ReshuffleWorker {
            membership,
            transport,
            catalog,
            config,
        }
    }

    /// Consumes lost-node events until shutdown.
    pub async fn run(
        self: Arc<Self>,
        mut lost_rx: mpsc::UnboundedReceiver<NodeInfo>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        loop {
            tokio::select! {
                event = lost_rx.recv() => {
                    match event {
                        Some(lost) => self.handle_lost_node(lost).await,
                        None => return,
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("reshuffle worker stopping");
                        return;
                    }
                }
            }
        }
    }

    /// Debounce, re-check, then re-home every affected row.
    async fn handle_lost_node(&self, lost: NodeInfo) {
        tokio::time::sleep(Duration::from_millis(self.config.reshuffle_debounce_ms)).await;
        if self.membership.contains(lost.id) {
            info!(node = %lost.id, "node reappeared before debounce expired; skipping reshuffle");
            return;
        }
        self.reshuffle_node(lost.id).await;
    }

    /// Immediate reshuffle of all rows placed on `lost`. Public so tests and
    /// admin tooling can drive it without the debounce.
    pub async fn reshuffle_node(&self, lost: NodeId) {
        let affected = self.catalog.rows_placed_on(lost);
        if affected.is_empty() {
            return;
        }
        info!(node = %lost, rows = affected.len(), "reshuffling replicas of lost node");

        for location in affected {
            let Some(new_placement) = self.choose_replacement(&location.placement, lost) else {
                warn!(
                    row = %location.row_id,
                    "no replacement holder available; keeping stale placement"
                );
                continue;
            };

            // Ship the row to the new holder before publishing the placement.
            if let Some(json) =
                self.catalog
                    .row_payload(&location.db, &location.table, location.row_id)
            {
                let new_holder = if new_placement.primary == location.placement.primary
                    || new_placement.primary == location.placement.secondary
                {
                    new_placement.secondary
                } else {
                    new_placement.primary
                };
                if let Some(ip) = self.transport.ip_from_node_id(new_holder) {
                    self.transport
                        .send_to_node(
                            new_holder,
                            ip,
                            &ClusterMessage::ReplicateInsertObject {
                                db: location.db.clone(),
                                table: location.table.clone(),
                                row_id: location.row_id,
                                json,
                            },
                        )
                        .await;
                }
            }

            self.catalog.update_placement(
                &location.db,
                &location.table,
                location.row_id,
                new_placement,
            );
            self.transport
                .broadcast_all_nodes(&ClusterMessage::TableReplicaObjectInsertOrReplace {
                    db: location.db.clone(),
                    table: location.table.clone(),
                    row_id: location.row_id,
                    primary: new_placement.primary,
                    secondary: new_placement.secondary,
                })
                .await;
        }
    }

    /// Keeps the surviving holder and draws the replacement from the current
    /// membership. Returns `None` when no distinct replacement exists.
    fn choose_replacement(&self, old: &Placement, lost: NodeId) -> Option<Placement> {
        let survivor = if old.primary == lost {
            old.secondary
        } else {
            old.primary
        };
        let survivor = if survivor == lost || !self.membership.contains(survivor) {
            None
        } else {
            Some(survivor)
        };

        let mut candidates: Vec<NodeId> = self
            .membership
            .member_ids()
            .into_iter()
            .filter(|id| *id != lost && Some(*id) != survivor)
            .collect();
        candidates.shuffle(&mut rand::thread_rng());

        match (survivor, candidates.first().copied()) {
            (Some(survivor), Some(replacement)) => Some(Placement {
                // Preserve the survivor's role.
                primary: if old.primary == lost { replacement } else { survivor },
                secondary: if old.primary == lost { survivor } else { replacement },
            }),
            (Some(survivor), None) => Some(Placement {
                primary: survivor,
                secondary: survivor,
            }),
            (None, Some(replacement)) => {
                let second = candidates.get(1).copied().unwrap_or(replacement);
                Some(Placement {
                    primary: replacement,
                    secondary: second,
                })
            }
            (None, None) => None,
        }
    }
}
