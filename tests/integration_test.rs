//! End-to-end scenarios driven through the query executor, the same path
//! the HTTP boundary uses.

use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Duration;

use uuid::Uuid;

use serengeti::catalog::Catalog;
use serengeti::cluster::{now_ms, Membership, Placement, ReshuffleWorker, Transport};
use serengeti::config::{ClusterConfig, Config};
use serengeti::metrics::Metrics;
use serengeti::query::cache::QueryCache;
use serengeti::query::executor::QueryExecutor;
use serengeti::query::memory::MemoryManager;

struct TestNode {
    _dir: tempfile::TempDir,
    membership: Arc<Membership>,
    transport: Arc<Transport>,
    catalog: Arc<Catalog>,
    executor: Arc<QueryExecutor>,
    config: Config,
}

fn node() -> TestNode {
    node_with(|_| {})
}

fn node_with(tune: impl FnOnce(&mut Config)) -> TestNode {
    let dir = tempfile::tempdir().unwrap();
    let mut config = Config::default();
    // Keep any accidental network activity short.
    config.cluster.network_timeout_ms = 100;
    tune(&mut config);

    let metrics = Arc::new(Metrics::new());
    let membership = Arc::new(Membership::new(
        Uuid::new_v4(),
        Ipv4Addr::new(192, 0, 2, 10),
    ));
    let catalog = Arc::new(Catalog::open(dir.path(), config.storage.clone()).unwrap());
    let transport = Arc::new(Transport::new(
        membership.clone(),
        metrics.clone(),
        59_985,
        config.cluster.network_timeout_ms,
    ));
    let memory = Arc::new(MemoryManager::new(
        config.query_pool_bytes(),
        dir.path().join("spill"),
        metrics.clone(),
    ));
    let cache = Arc::new(QueryCache::new(
        Duration::from_millis(config.query.cache_ttl_ms),
        config.query.cache_max_entries,
    ));
    let executor = Arc::new(QueryExecutor::new(
        catalog.clone(),
        membership.clone(),
        transport.clone(),
        memory,
        cache,
        metrics,
        config.query.clone(),
    ));
    TestNode {
        _dir: dir,
        membership,
        transport,
        catalog,
        executor,
        config,
    }
}

#[tokio::test]
async fn create_insert_select_round_trip() {
    let node = node();
    let outcomes = node
        .executor
        .execute_request(
            "CREATE DATABASE u; \
             CREATE TABLE u.c (id INT, name VARCHAR); \
             INSERT INTO u.c (id, name) VALUES (1, 'A'); \
             SELECT * FROM u.c WHERE id = 1",
        )
        .await;

    assert_eq!(outcomes.len(), 4);
    for outcome in &outcomes {
        assert!(outcome.executed, "outcome failed: {:?}", outcome.error);
    }
    let rows = outcomes[3].list.as_ref().unwrap();
    assert_eq!(rows, &vec![serde_json::json!({"id": 1, "name": "A"})]);
}

#[tokio::test]
async fn range_filter_uses_index_lookup() {
    let node = node();
    node.executor
        .execute_request("CREATE DATABASE u; CREATE TABLE u.c (id INT)")
        .await;
    for id in [25, 30, 35, 40] {
        node.executor
            .execute_request(&format!("INSERT INTO u.c (id) VALUES ({id})"))
            .await;
    }
    let outcomes = node
        .executor
        .execute_request("CREATE INDEX ON u.c(id); SELECT * FROM u.c WHERE id > 30")
        .await;
    assert!(outcomes[0].executed);
    let select = &outcomes[1];
    assert!(select.executed);
    assert!(
        select.explain.as_ref().unwrap().contains("INDEX_LOOKUP"),
        "explain was {:?}",
        select.explain
    );

    let mut ids: Vec<i64> = select
        .list
        .as_ref()
        .unwrap()
        .iter()
        .map(|row| row["id"].as_i64().unwrap())
        .collect();
    ids.sort_unstable();
    assert_eq!(ids, vec![35, 40]);
}

#[tokio::test]
async fn replication_placement_names_two_distinct_members() {
    let node = node();
    // Two unreachable peers; replication sends are best-effort.
    let n2 = Uuid::new_v4();
    let n3 = Uuid::new_v4();
    node.membership.upsert(n2, Ipv4Addr::new(192, 0, 2, 11), now_ms());
    node.membership.upsert(n3, Ipv4Addr::new(192, 0, 2, 12), now_ms());

    node.executor
        .execute_request("CREATE DATABASE u; CREATE TABLE u.c (id INT)")
        .await;
    let outcomes = node
        .executor
        .execute_request("INSERT INTO u.c (id) VALUES (1)")
        .await;
    assert!(outcomes[0].executed);

    let handle = node.catalog.table("u", "c").unwrap();
    let placements = handle.replicas.all();
    assert_eq!(placements.len(), 1);
    let (_, placement) = placements[0];
    let members = [node.membership.local_id(), n2, n3];
    assert!(members.contains(&placement.primary));
    assert!(members.contains(&placement.secondary));
    assert_ne!(placement.primary, placement.secondary);
}

#[tokio::test]
async fn lost_node_reshuffle_rehomes_rows() {
    let node = node();
    let n2 = Uuid::new_v4();
    let n3 = Uuid::new_v4();
    node.membership.upsert(n2, Ipv4Addr::new(192, 0, 2, 11), now_ms());
    node.membership.upsert(n3, Ipv4Addr::new(192, 0, 2, 12), now_ms());

    node.executor
        .execute_request("CREATE DATABASE u; CREATE TABLE u.c (id INT)")
        .await;
    let outcomes = node
        .executor
        .execute_request("INSERT INTO u.c (id) VALUES (9)")
        .await;
    assert!(outcomes[0].executed);

    // Force a known placement: local primary, n2 secondary.
    let handle = node.catalog.table("u", "c").unwrap();
    let (row_id, _) = handle.replicas.all()[0];
    let local = node.membership.local_id();
    handle.replicas.set(
        row_id,
        Placement {
            primary: local,
            secondary: n2,
        },
    );

    // n2 disappears.
    node.membership.evict_stale(now_ms() + 1);
    assert!(!node.membership.contains(n2));
    // evict_stale also dropped n3; bring it back as the only candidate.
    node.membership.upsert(n3, Ipv4Addr::new(192, 0, 2, 12), now_ms());

    let worker = ReshuffleWorker::new(
        node.membership.clone(),
        node.transport.clone(),
        node.catalog.clone(),
        ClusterConfig {
            reshuffle_debounce_ms: 0,
            network_timeout_ms: 100,
            ..node.config.cluster.clone()
        },
    );
    worker.reshuffle_node(n2).await;

    let placement = handle.replicas.get(row_id).unwrap();
    assert_eq!(placement.primary, local);
    assert_eq!(placement.secondary, n3);
}

#[tokio::test]
async fn order_by_spills_and_stays_sorted() {
    let node = node_with(|config| {
        config.query.sort_chunk_max_rows = 10;
    });
    node.executor
        .execute_request("CREATE DATABASE u; CREATE TABLE u.c (age INT)")
        .await;

    let mut values = Vec::new();
    for i in 0..100u32 {
        values.push(format!("({})", (i * 37) % 101));
    }
    node.executor
        .execute_request(&format!(
            "INSERT INTO u.c (age) VALUES {}",
            values.join(", ")
        ))
        .await;

    let outcomes = node
        .executor
        .execute_request("SELECT * FROM u.c ORDER BY age ASC")
        .await;
    let rows = outcomes[0].list.as_ref().unwrap();
    assert_eq!(rows.len(), 100);
    let ages: Vec<i64> = rows.iter().map(|row| row["age"].as_i64().unwrap()).collect();
    assert!(ages.windows(2).all(|pair| pair[0] <= pair[1]));
}

#[tokio::test]
async fn cache_hits_until_write_invalidates() {
    let node = node();
    node.executor
        .execute_request(
            "CREATE DATABASE u; CREATE TABLE u.c (id INT); INSERT INTO u.c (id) VALUES (1)",
        )
        .await;

    let first = node
        .executor
        .execute_request("SELECT * FROM u.c WHERE id = 1")
        .await;
    assert!(first[0].explain.as_ref().unwrap().contains("cache: miss"));

    let second = node
        .executor
        .execute_request("SELECT * FROM u.c WHERE id = 1")
        .await;
    assert!(second[0].explain.as_ref().unwrap().contains("cache: hit"));

    node.executor
        .execute_request("INSERT INTO u.c (id) VALUES (2)")
        .await;
    let third = node
        .executor
        .execute_request("SELECT * FROM u.c WHERE id = 1")
        .await;
    assert!(third[0].explain.as_ref().unwrap().contains("cache: miss"));
}

#[tokio::test]
async fn joins_aggregate_group_and_limit() {
    let node = node();
    node.executor
        .execute_request(
            "CREATE DATABASE u; \
             CREATE TABLE u.people (id INT, city VARCHAR); \
             CREATE TABLE u.pets (owner_id INT, pet VARCHAR)",
        )
        .await;
    node.executor
        .execute_request(
            "INSERT INTO u.people (id, city) VALUES (1, 'paris'), (2, 'oslo'), (3, 'paris'); \
             INSERT INTO u.pets (owner_id, pet) VALUES (1, 'cat'), (1, 'dog'), (3, 'fox')",
        )
        .await;

    let join = node
        .executor
        .execute_request("SELECT * FROM u.people JOIN u.pets ON id = owner_id")
        .await;
    let rows = join[0].list.as_ref().unwrap();
    assert_eq!(rows.len(), 3);
    assert!(rows.iter().all(|row| row.get("pet").is_some()));

    let grouped = node
        .executor
        .execute_request("SELECT city, COUNT(*) FROM u.people GROUP BY city")
        .await;
    let rows = grouped[0].list.as_ref().unwrap();
    assert_eq!(rows.len(), 2);
    let paris = rows
        .iter()
        .find(|row| row["city"] == "paris")
        .expect("paris group");
    assert_eq!(paris["count(*)"], 2);

    let limited = node
        .executor
        .execute_request("SELECT * FROM u.people ORDER BY id ASC LIMIT 2 OFFSET 1")
        .await;
    let rows = limited[0].list.as_ref().unwrap();
    assert_eq!(rows.len(), 2);
    assert_eq!(rows[0]["id"], 2);

    // Lenient limit: non-numeric count passes everything through.
    let lenient = node
        .executor
        .execute_request("SELECT * FROM u.people LIMIT oops")
        .await;
    assert_eq!(lenient[0].list.as_ref().unwrap().len(), 3);
}

#[tokio::test]
async fn update_delete_and_transactions() {
    let node = node();
    node.executor
        .execute_request(
            "CREATE DATABASE u; CREATE TABLE u.c (id INT, name VARCHAR); \
             INSERT INTO u.c (id, name) VALUES (1, 'A'), (2, 'B')",
        )
        .await;

    let updated = node
        .executor
        .execute_request("UPDATE u.c SET name = 'Z' WHERE id = 1")
        .await;
    assert_eq!(updated[0].list.as_ref().unwrap()[0]["updated"], 1);

    let outcomes = node
        .executor
        .execute_request(
            "BEGIN; DELETE FROM u.c WHERE id = 2; SELECT * FROM u.c; COMMIT; SELECT * FROM u.c",
        )
        .await;
    // The DELETE is queued, so the mid-transaction SELECT still sees 2 rows.
    assert_eq!(outcomes[2].list.as_ref().unwrap().len(), 2);
    // COMMIT applies the queued delete; the final SELECT sees 1 row.
    assert!(outcomes[3].executed);
    assert_eq!(outcomes[4].list.as_ref().unwrap().len(), 1);
    assert_eq!(outcomes[4].list.as_ref().unwrap()[0]["name"], "Z");
}

#[tokio::test]
async fn errors_are_in_band_and_isolated() {
    let node = node();
    let outcomes = node
        .executor
        .execute_request("CREATE DATABASE u; CREATE DATABASE u; SELECT * FROM ghost.t; NONSENSE")
        .await;

    assert!(outcomes[0].executed);
    assert!(!outcomes[1].executed);
    assert!(outcomes[1].error.as_ref().unwrap().contains("already exists"));
    assert!(!outcomes[2].executed);
    assert!(!outcomes[3].executed);

    // The failing statements changed nothing.
    assert_eq!(node.catalog.list_databases(), vec!["u".to_string()]);
}
