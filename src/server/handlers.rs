//! Route Handlers
//!
//! Thin boundary adapters: translate HTTP requests into catalog/executor
//! calls and shape the JSON replies. The status-code contract:
//! HTTP 200 for any well-formed request (errors ride inside the JSON),
//! 400 for malformed bodies, 401 for admin without the bearer token,
//! 503 when the node is unhealthy or shutting down.

use std::sync::Arc;

use tracing::{debug, info};
use warp::http::StatusCode;

use crate::cluster::messages::ClusterMessage;
use crate::cluster::node::now_ms;
use crate::metrics::Metrics;
use crate::server::AppState;
use crate::types::row_to_json;

/// `GET /` — node identity and cluster view; the discovery probe target.
pub fn node_info(state: &Arc<AppState>) -> serde_json::Value {
    Metrics::incr(&state.metrics.http_requests);
    serde_json::json!({
        "this": {
            "id": state.membership.local_id().to_string(),
            "ip": state.membership.local_ip().to_string(),
            "version": env!("CARGO_PKG_VERSION"),
        },
        "cluster": {
            "size": state.membership.size(),
            "coordinator": state.membership.coordinator().map(|id| id.to_string()),
        },
    })
}

/// `GET /health` — UP / DEGRADED / DOWN plus the matching status code.
pub fn health(state: &Arc<AppState>) -> (serde_json::Value, StatusCode) {
    Metrics::incr(&state.metrics.http_requests);
    let status = if !state.membership.is_online() {
        "DOWN"
    } else {
        let persistence = state.scheduler.health();
        let recent_error = persistence
            .last_error_ms
            .map(|at| now_ms().saturating_sub(at) < 10 * 60 * 1000)
            .unwrap_or(false);
        if persistence.error_count > 0 && recent_error {
            "DEGRADED"
        } else {
            "UP"
        }
    };
    let code = if status == "UP" {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (serde_json::json!({ "status": status }), code)
}

/// `GET /metrics`.
pub fn metrics(state: &Arc<AppState>) -> serde_json::Value {
    Metrics::incr(&state.metrics.http_requests);
    let mut snapshot = state.metrics.snapshot();
    let persistence = state.scheduler.health();
    snapshot["server"]["persistence"] = serde_json::json!({
        "passes_ok": persistence.passes_ok,
        "errors": persistence.error_count,
        "last_error_ms": persistence.last_error_ms,
        "last_pass_durations_ms": persistence
            .last_pass_durations
            .iter()
            .map(|(db, duration)| serde_json::json!({"db": db, "ms": duration.as_millis() as u64}))
            .collect::<Vec<_>>(),
    });
    snapshot["server"]["cache"] =
        serde_json::to_value(state.executor.cache.stats()).unwrap_or_default();
    snapshot
}

/// `GET /admin` — requires `Authorization: Bearer <token>`.
pub fn admin(state: &Arc<AppState>, authorization: Option<String>) -> (serde_json::Value, StatusCode) {
    Metrics::incr(&state.metrics.http_requests);
    let expected = format!("Bearer {}", state.config.node.admin_token);
    match authorization {
        Some(header) if header == expected => (
            serde_json::json!({
                "commands": [
                    "optimization (enable|disable|status|level <n>)",
                    "cache (enable|disable|clear|stats)",
                    "statistics collect",
                    "delete everything",
                ],
            }),
            StatusCode::OK,
        ),
        _ => (
            serde_json::json!({"error": "unauthorized"}),
            StatusCode::UNAUTHORIZED,
        ),
    }
}

/// `POST /query` — raw SQL-ish body, one response element per statement.
pub async fn query(state: &Arc<AppState>, body: bytes::Bytes) -> (serde_json::Value, StatusCode) {
    Metrics::incr(&state.metrics.http_requests);
    let input = String::from_utf8_lossy(&body);
    if input.trim().is_empty() {
        return (
            serde_json::json!([{"executed": false, "error": "empty query"}]),
            StatusCode::BAD_REQUEST,
        );
    }
    let outcomes = state.executor.execute_request(&input).await;
    (serde_json::to_value(outcomes).unwrap_or_default(), StatusCode::OK)
}

/// `GET /meta` — full catalog snapshot.
pub fn meta(state: &Arc<AppState>) -> serde_json::Value {
    Metrics::incr(&state.metrics.http_requests);
    state.catalog.meta_snapshot()
}

/// `POST /post` — typed cluster messages from peers.
pub async fn post_message(
    state: &Arc<AppState>,
    message: ClusterMessage,
) -> (serde_json::Value, StatusCode) {
    Metrics::incr(&state.metrics.http_requests);
    debug!(kind = message.kind(), "cluster message received");
    match apply_cluster_message(state, message).await {
        Ok(reply) => (reply, StatusCode::OK),
        Err(e) => (
            serde_json::json!({"ok": false, "error": e.to_string()}),
            StatusCode::OK,
        ),
    }
}

/// Applies one replication message locally. The sender treats any network
/// failure as best-effort, so these handlers only report success in-band.
async fn apply_cluster_message(
    state: &Arc<AppState>,
    message: ClusterMessage,
) -> crate::errors::SerengetiResult<serde_json::Value> {
    match message {
        ClusterMessage::ReplicateInsertObject {
            db,
            table,
            row_id,
            json,
        }
        | ClusterMessage::ReplicateUpdateObject {
            db,
            table,
            row_id,
            json,
        } => {
            ensure_table(state, &db, &table)?;
            let row = crate::types::row_from_json(&json)?;
            state.catalog.write_row_local(&db, &table, row_id, &row)?;
            state.executor.cache.invalidate(&db, &table);
            Ok(serde_json::json!({"ok": true}))
        }
        ClusterMessage::ReplicateDeleteObject { db, table, row_id } => {
            if state.catalog.table_exists(&db, &table) {
                state.catalog.delete_row_local(&db, &table, row_id)?;
                state.executor.cache.invalidate(&db, &table);
            }
            Ok(serde_json::json!({"ok": true}))
        }
        ClusterMessage::TableReplicaObject {
            db,
            table,
            row_id,
            primary,
            secondary,
        }
        | ClusterMessage::TableReplicaObjectInsertOrReplace {
            db,
            table,
            row_id,
            primary,
            secondary,
        } => {
            ensure_table(state, &db, &table)?;
            let handle = state.catalog.table(&db, &table)?;
            handle.replicas.set(
                row_id,
                crate::cluster::node::Placement { primary, secondary },
            );
            Ok(serde_json::json!({"ok": true}))
        }
        ClusterMessage::MetaRequest { db, table } => match (db, table) {
            (Some(db), Some(table)) => {
                let handle = state.catalog.table(&db, &table)?;
                let rows = state.catalog.materialize_local_rows(&handle)?;
                let map: serde_json::Map<String, serde_json::Value> = rows
                    .into_iter()
                    .map(|(row_id, row)| (row_id.to_string(), row_to_json(&row)))
                    .collect();
                Ok(serde_json::json!({ "rows": map }))
            }
            _ => Ok(serde_json::json!({"meta": state.catalog.meta_snapshot()})),
        },
        ClusterMessage::JoinCluster { id, ip } => {
            if let Ok(ip) = ip.parse() {
                state.membership.upsert(id, ip, now_ms());
                info!(node = %id, %ip, "peer announced itself");
            }
            Ok(serde_json::json!({"ok": true}))
        }
    }
}

/// Replica messages can outrun meta sync; accept them by materializing the
/// database and a schemaless table on demand.
fn ensure_table(
    state: &Arc<AppState>,
    db: &str,
    table: &str,
) -> crate::errors::SerengetiResult<()> {
    if !state.catalog.database_exists(db) {
        state.catalog.create_database(db)?;
    }
    if !state.catalog.table_exists(db, table) {
        state
            .catalog
            .create_table(db, table, Default::default())?;
    }
    Ok(())
}

/// `GET /dashboard` and `GET /interactive` — the real UI ships separately;
/// these return a minimal placeholder page.
pub fn dashboard_html() -> String {
    format!(
        "<!DOCTYPE html><html><head><title>Serengeti</title></head>\
         <body><h1>Serengeti {}</h1>\
         <p>POST SQL to <code>/query</code>. Cluster state at <code>/</code>.</p>\
         </body></html>",
        env!("CARGO_PKG_VERSION")
    )
}
