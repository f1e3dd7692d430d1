//! Replication Wire Messages
//!
//! Every message is a JSON object with a `type` tag, POSTed to a peer's
//! `/post` endpoint. The names are part of the wire contract.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::cluster::node::NodeId;

/// Typed cluster message.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ClusterMessage {
    /// Store a row replica on the receiving node.
    ReplicateInsertObject {
        db: String,
        table: String,
        row_id: Uuid,
        json: serde_json::Value,
    },
    /// Overwrite a row replica on the receiving node.
    ReplicateUpdateObject {
        db: String,
        table: String,
        row_id: Uuid,
        json: serde_json::Value,
    },
    /// Delete a row replica on the receiving node.
    ReplicateDeleteObject {
        db: String,
        table: String,
        row_id: Uuid,
    },
    /// Authoritative placement record for a row.
    TableReplicaObject {
        db: String,
        table: String,
        row_id: Uuid,
        primary: NodeId,
        secondary: NodeId,
    },
    /// Placement record that must overwrite any existing entry.
    TableReplicaObjectInsertOrReplace {
        db: String,
        table: String,
        row_id: Uuid,
        primary: NodeId,
        secondary: NodeId,
    },
    /// On-demand metadata sync. With `db`/`table` set, the peer answers with
    /// that table's rows; bare, it answers with its catalog snapshot.
    MetaRequest {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        db: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        table: Option<String>,
    },
    /// Advisory hello from a node that found us before we found it.
    JoinCluster { id: NodeId, ip: String },
}

impl ClusterMessage {
    /// Short label for logs and metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            ClusterMessage::ReplicateInsertObject { .. } => "ReplicateInsertObject",
            ClusterMessage::ReplicateUpdateObject { .. } => "ReplicateUpdateObject",
            ClusterMessage::ReplicateDeleteObject { .. } => "ReplicateDeleteObject",
            ClusterMessage::TableReplicaObject { .. } => "TableReplicaObject",
            ClusterMessage::TableReplicaObjectInsertOrReplace { .. } => {
                "TableReplicaObjectInsertOrReplace"
            }
            ClusterMessage::MetaRequest { .. } => "MetaRequest",
            ClusterMessage::JoinCluster { .. } => "JoinCluster",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_format_carries_type_tag() {
        let message = ClusterMessage::ReplicateInsertObject {
            db: "users".into(),
            table: "contacts".into(),
            row_id: Uuid::new_v4(),
            json: serde_json::json!({"id": 1}),
        };
        let wire = serde_json::to_value(&message).unwrap();
        assert_eq!(wire["type"], "ReplicateInsertObject");
        assert_eq!(wire["db"], "users");

        let parsed: ClusterMessage = serde_json::from_value(wire).unwrap();
        assert_eq!(parsed.kind(), "ReplicateInsertObject");
    }

    #[test]
    fn meta_request_omits_empty_fields() {
        let wire = serde_json::to_value(ClusterMessage::MetaRequest {
            db: None,
            table: None,
        })
        .unwrap();
        assert!(wire.get("db").is_none());

        let parsed: ClusterMessage =
            serde_json::from_value(serde_json::json!({"type": "MetaRequest"})).unwrap();
        assert_eq!(parsed.kind(), "MetaRequest");
    }
}
