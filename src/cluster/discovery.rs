//! Discovery Sweep
//!
//! Every `ping_interval_ms` the sweep probes all 254 host addresses of the
//! local /24 with a short `GET /` and a per-probe deadline. Reachable peers
//! are upserted into the membership map stamped with the sweep start time;
//! anything older than the stamp after the sweep is evicted and queued for
//! the reshuffle worker. The whole sweep also obeys a global deadline so one
//! slow subnet cannot stall liveness tracking.

use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Duration;

use futures::stream::{self, StreamExt};
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use crate::cluster::node::{now_ms, Membership, NodeInfo};
use crate::config::ClusterConfig;
use crate::metrics::Metrics;

pub struct Discovery {
    membership: Arc<Membership>,
    metrics: Arc<Metrics>,
    config: ClusterConfig,
    http_port: u16,
    client: reqwest::Client,
    lost_tx: mpsc::UnboundedSender<NodeInfo>,
}

impl Discovery {
    pub fn new(
        membership: Arc<Membership>,
        metrics: Arc<Metrics>,
        config: ClusterConfig,
        http_port: u16,
        lost_tx: mpsc::UnboundedSender<NodeInfo>,
    ) -> Discovery {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_millis(config.network_timeout_ms))
            .build()
            .unwrap_or_default();
        Discovery {
            membership,
            metrics,
            config,
            http_port,
            client,
            lost_tx,
        }
    }

    /// Sweep loop. Exits when the shutdown channel flips to `true`.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let interval = Duration::from_millis(self.config.ping_interval_ms);
        loop {
            tokio::select! {
                _ = tokio::time::sleep(interval) => {
                    self.sweep().await;
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("discovery loop stopping");
                        return;
                    }
                }
            }
        }
    }

    /// One full sweep of the local /24: probe, upsert, evict, elect.
    pub async fn sweep(&self) {
        let sweep_start_ms = now_ms();
        let local_ip = self.membership.local_ip();
        let octets = local_ip.octets();

        let candidates: Vec<Ipv4Addr> = (1..=254u8)
            .map(|host| Ipv4Addr::new(octets[0], octets[1], octets[2], host))
            .collect();

        // Global deadline: a sweep of a dead subnet must complete within
        // roughly one probe timeout past the interval.
        let deadline = Duration::from_millis(
            self.config.ping_interval_ms + self.config.network_timeout_ms,
        );
        let probes = stream::iter(candidates)
            .map(|ip| self.probe(ip, sweep_start_ms))
            .buffer_unordered(self.config.probe_concurrency)
            .collect::<Vec<_>>();
        if tokio::time::timeout(deadline, probes).await.is_err() {
            warn!("discovery sweep hit its global deadline");
        }

        // Always keep ourselves fresh, even when the probe to our own IP
        // lost the race with the deadline.
        self.membership
            .upsert(self.membership.local_id(), local_ip, sweep_start_ms);

        for lost in self.membership.evict_stale(sweep_start_ms) {
            if self.lost_tx.send(lost).is_err() {
                // Reshuffle worker is gone; shutdown is in progress.
                break;
            }
        }

        let coordinator = self.membership.elect_coordinator();
        debug!(
            members = self.membership.size(),
            coordinator = ?coordinator,
            "sweep complete"
        );
    }

    /// Probes one address and upserts the peer on a parseable reply.
    async fn probe(&self, ip: Ipv4Addr, sweep_start_ms: u64) {
        Metrics::incr(&self.metrics.probes_sent);
        let url = format!("http://{ip}:{}/", self.http_port);
        let response = match self.client.get(&url).send().await {
            Ok(r) if r.status().is_success() => r,
            _ => return,
        };
        let body: serde_json::Value = match response.json().await {
            Ok(b) => b,
            Err(_) => return,
        };
        let Some(id) = body
            .get("this")
            .and_then(|t| t.get("id"))
            .and_then(|v| v.as_str())
            .and_then(|s| s.parse().ok())
        else {
            return;
        };
        Metrics::incr(&self.metrics.probes_succeeded);
        self.membership.upsert(id, ip, sweep_start_ms);
    }
}
