//! HTTP Boundary
//!
//! warp routes for the node's single live port: identity, health, metrics,
//! admin, cluster messages, SQL queries, and the catalog snapshot.

pub mod handlers;

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::sync::watch;
use tracing::{error, info};
use warp::Filter;

use crate::catalog::persistence::PersistenceScheduler;
use crate::catalog::Catalog;
use crate::cluster::node::Membership;
use crate::config::Config;
use crate::metrics::Metrics;
use crate::query::executor::QueryExecutor;

/// Everything the handlers need, shared by reference.
pub struct AppState {
    pub membership: Arc<Membership>,
    pub catalog: Arc<Catalog>,
    pub executor: Arc<QueryExecutor>,
    pub scheduler: Arc<PersistenceScheduler>,
    pub metrics: Arc<Metrics>,
    pub config: Config,
}

fn with_state(
    state: Arc<AppState>,
) -> impl Filter<Extract = (Arc<AppState>,), Error = std::convert::Infallible> + Clone {
    warp::any().map(move || state.clone())
}

/// Builds the full route tree.
pub fn routes(
    state: Arc<AppState>,
) -> impl Filter<Extract = (impl warp::Reply,), Error = warp::Rejection> + Clone {
    let root = warp::path::end()
        .and(warp::get())
        .and(with_state(state.clone()))
        .map(|state: Arc<AppState>| warp::reply::json(&handlers::node_info(&state)));

    let health = warp::path("health")
        .and(warp::path::end())
        .and(warp::get())
        .and(with_state(state.clone()))
        .map(|state: Arc<AppState>| {
            let (body, code) = handlers::health(&state);
            warp::reply::with_status(warp::reply::json(&body), code)
        });

    let metrics = warp::path("metrics")
        .and(warp::path::end())
        .and(warp::get())
        .and(with_state(state.clone()))
        .map(|state: Arc<AppState>| warp::reply::json(&handlers::metrics(&state)));

    let admin = warp::path("admin")
        .and(warp::path::end())
        .and(warp::get())
        .and(warp::header::optional::<String>("authorization"))
        .and(with_state(state.clone()))
        .map(|authorization: Option<String>, state: Arc<AppState>| {
            let (body, code) = handlers::admin(&state, authorization);
            warp::reply::with_status(warp::reply::json(&body), code)
        });

    let post = warp::path("post")
        .and(warp::path::end())
        .and(warp::post())
        .and(warp::body::json())
        .and(with_state(state.clone()))
        .and_then(
            |message: crate::cluster::messages::ClusterMessage, state: Arc<AppState>| async move {
                let (body, code) = handlers::post_message(&state, message).await;
                Ok::<_, warp::Rejection>(warp::reply::with_status(
                    warp::reply::json(&body),
                    code,
                ))
            },
        );

    let query = warp::path("query")
        .and(warp::path::end())
        .and(warp::post())
        .and(warp::body::bytes())
        .and(with_state(state.clone()))
        .and_then(|body: bytes::Bytes, state: Arc<AppState>| async move {
            let (body, code) = handlers::query(&state, body).await;
            Ok::<_, warp::Rejection>(warp::reply::with_status(warp::reply::json(&body), code))
        });

    let meta = warp::path("meta")
        .and(warp::path::end())
        .and(warp::get())
        .and(with_state(state.clone()))
        .map(|state: Arc<AppState>| warp::reply::json(&handlers::meta(&state)));

    let dashboard = warp::path("dashboard")
        .and(warp::path::end())
        .and(warp::get())
        .map(|| warp::reply::html(handlers::dashboard_html()));

    let interactive = warp::path("interactive")
        .and(warp::path::end())
        .and(warp::get())
        .map(|| warp::reply::html(handlers::dashboard_html()));

    root.or(health)
        .or(metrics)
        .or(admin)
        .or(post)
        .or(query)
        .or(meta)
        .or(dashboard)
        .or(interactive)
}

/// Serves until the shutdown channel flips to `true`.
pub async fn serve(state: Arc<AppState>, mut shutdown: watch::Receiver<bool>) {
    let port = state.config.node.http_port;
    let address: SocketAddr = ([0, 0, 0, 0], port).into();
    let bound = warp::serve(routes(state)).try_bind_with_graceful_shutdown(address, async move {
        // Wait for the shutdown flag.
        while shutdown.changed().await.is_ok() {
            if *shutdown.borrow() {
                break;
            }
        }
    });
    match bound {
        Ok((bound, server)) => {
            info!(%bound, "http server listening");
            server.await;
            info!("http server stopped");
        }
        Err(e) => {
            error!(error = %e, port, "failed to bind http server");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StorageConfig;
    use crate::query::cache::QueryCache;
    use crate::query::memory::MemoryManager;
    use std::net::Ipv4Addr;
    use std::time::Duration;
    use uuid::Uuid;

    fn state(dir: &std::path::Path) -> Arc<AppState> {
        let config = Config::default();
        let metrics = Arc::new(Metrics::new());
        let membership = Arc::new(Membership::new(Uuid::new_v4(), Ipv4Addr::LOCALHOST));
        let catalog = Arc::new(Catalog::open(dir, StorageConfig::default()).unwrap());
        let transport = Arc::new(crate::cluster::transport::Transport::new(
            membership.clone(),
            metrics.clone(),
            config.node.http_port,
            config.cluster.network_timeout_ms,
        ));
        let memory = Arc::new(MemoryManager::new(
            config.query_pool_bytes(),
            dir.join("spill"),
            metrics.clone(),
        ));
        let cache = Arc::new(QueryCache::new(
            Duration::from_millis(config.query.cache_ttl_ms),
            config.query.cache_max_entries,
        ));
        let executor = Arc::new(QueryExecutor::new(
            catalog.clone(),
            membership.clone(),
            transport,
            memory,
            cache,
            metrics.clone(),
            config.query.clone(),
        ));
        let scheduler = Arc::new(PersistenceScheduler::new(
            catalog.clone(),
            membership.clone(),
            metrics.clone(),
            config.persistence.clone(),
        ));
        Arc::new(AppState {
            membership,
            catalog,
            executor,
            scheduler,
            metrics,
            config,
        })
    }

    #[tokio::test]
    async fn root_reports_identity_and_cluster() {
        let dir = tempfile::tempdir().unwrap();
        let state = state(dir.path());
        let response = warp::test::request()
            .method("GET")
            .path("/")
            .reply(&routes(state.clone()))
            .await;
        assert_eq!(response.status(), 200);
        let body: serde_json::Value = serde_json::from_slice(response.body()).unwrap();
        assert_eq!(
            body["this"]["id"],
            state.membership.local_id().to_string()
        );
        assert_eq!(body["cluster"]["size"], 1);
    }

    #[tokio::test]
    async fn health_reflects_online_flag() {
        let dir = tempfile::tempdir().unwrap();
        let state = state(dir.path());

        let response = warp::test::request()
            .method("GET")
            .path("/health")
            .reply(&routes(state.clone()))
            .await;
        assert_eq!(response.status(), 200);

        state.membership.set_online(false);
        let response = warp::test::request()
            .method("GET")
            .path("/health")
            .reply(&routes(state.clone()))
            .await;
        assert_eq!(response.status(), 503);
        let body: serde_json::Value = serde_json::from_slice(response.body()).unwrap();
        assert_eq!(body["status"], "DOWN");
    }

    #[tokio::test]
    async fn admin_requires_bearer_token() {
        let dir = tempfile::tempdir().unwrap();
        let state = state(dir.path());

        let response = warp::test::request()
            .method("GET")
            .path("/admin")
            .reply(&routes(state.clone()))
            .await;
        assert_eq!(response.status(), 401);

        let response = warp::test::request()
            .method("GET")
            .path("/admin")
            .header(
                "authorization",
                format!("Bearer {}", state.config.node.admin_token),
            )
            .reply(&routes(state.clone()))
            .await;
        assert_eq!(response.status(), 200);
        let body: serde_json::Value = serde_json::from_slice(response.body()).unwrap();
        assert!(body["commands"].is_array());
    }

    #[tokio::test]
    async fn query_round_trip_over_http() {
        let dir = tempfile::tempdir().unwrap();
        let state = state(dir.path());

        let response = warp::test::request()
            .method("POST")
            .path("/query")
            .body("CREATE DATABASE u; CREATE TABLE u.c (id INT, name VARCHAR); INSERT INTO u.c (id, name) VALUES (1, 'A'); SELECT * FROM u.c WHERE id = 1")
            .reply(&routes(state.clone()))
            .await;
        assert_eq!(response.status(), 200);
        let body: serde_json::Value = serde_json::from_slice(response.body()).unwrap();
        let results = body.as_array().unwrap();
        assert_eq!(results.len(), 4);
        for result in results {
            assert_eq!(result["executed"], true, "failed: {result}");
        }
        assert_eq!(results[3]["list"], serde_json::json!([{"id": 1, "name": "A"}]));
    }

    #[tokio::test]
    async fn empty_query_is_bad_request() {
        let dir = tempfile::tempdir().unwrap();
        let state = state(dir.path());
        let response = warp::test::request()
            .method("POST")
            .path("/query")
            .body("   ")
            .reply(&routes(state))
            .await;
        assert_eq!(response.status(), 400);
    }

    #[tokio::test]
    async fn post_applies_replica_messages() {
        let dir = tempfile::tempdir().unwrap();
        let state = state(dir.path());
        let row_id = Uuid::new_v4();

        let message = serde_json::json!({
            "type": "ReplicateInsertObject",
            "db": "u", "table": "c", "row_id": row_id,
            "json": {"id": 7},
        });
        let response = warp::test::request()
            .method("POST")
            .path("/post")
            .json(&message)
            .reply(&routes(state.clone()))
            .await;
        assert_eq!(response.status(), 200);

        let handle = state.catalog.table("u", "c").unwrap();
        let row = state.catalog.read_row_local(&handle, row_id).unwrap().unwrap();
        assert_eq!(row["id"], crate::types::Value::Int(7));
    }

    #[tokio::test]
    async fn meta_lists_catalog() {
        let dir = tempfile::tempdir().unwrap();
        let state = state(dir.path());
        state.catalog.create_database("u").unwrap();
        state.catalog.create_table("u", "c", Default::default()).unwrap();

        let response = warp::test::request()
            .method("GET")
            .path("/meta")
            .reply(&routes(state))
            .await;
        let body: serde_json::Value = serde_json::from_slice(response.body()).unwrap();
        assert_eq!(body["u"], serde_json::json!(["c"]));
    }
}
