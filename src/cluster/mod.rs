//! Cluster Layer
//!
//! Discovery and membership, coordinator election, replication transport and
//! lost-node reshuffle. Nodes find each other by sweeping the local /24 —
//! no seed list, no operator configuration.

pub mod discovery;
pub mod messages;
pub mod node;
pub mod reshuffle;
pub mod transport;

pub use discovery::Discovery;
pub use messages::ClusterMessage;
pub use node::{
    detect_local_ip, load_or_create_node_id, now_ms, Membership, NodeId, NodeInfo, Placement,
};
pub use reshuffle::{CatalogView, ReshuffleWorker, RowLocation};
pub use transport::Transport;
