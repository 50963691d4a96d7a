//! Watcher budget of a single-node deployment, read through the monitor

use tabletloc::common::{BudgetConfig, TableId};
use tabletloc::coordination::{fetch_watch_count, serve_monitor};
use tabletloc::coordinator::budget::WatcherBudget;
use tabletloc::{Config, Instance};
use tokio::net::TcpListener;

async fn start_monitor(instance: &Instance) -> std::net::SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(serve_monitor(listener, instance.service().clone()));
    addr
}

#[tokio::test]
async fn test_three_tables_within_budget() {
    let mut config = Config::default();
    config.manager.assignment_interval_ms = 20;
    let instance = Instance::start(config).await.unwrap();
    let monitor = start_monitor(&instance).await;

    let base = fetch_watch_count(monitor).await.unwrap();
    let budget = WatcherBudget::default();
    budget.check(base, 0).unwrap();

    for name in ["t1", "t2", "t3"] {
        let table = TableId::new(name).unwrap();
        instance.create_table(&table, &[]).await.unwrap();
        instance.ops().set_online(&table, true).await.unwrap();
    }

    let observed = fetch_watch_count(monitor).await.unwrap();
    assert!(
        (155..=185).contains(&observed),
        "observed {} watches",
        observed
    );
    budget.check(observed, 3).unwrap();
    assert_eq!(observed, instance.watch_count().await as u64);

    let per_table = (observed - base) / 3;
    assert!((15..=20).contains(&per_table), "per table {}", per_table);

    let summary = instance.watch_summary().await.unwrap();
    assert!(summary.within_budget);
    assert_eq!(summary.tables, 3);
    assert_eq!(summary.processes.len(), 4);

    instance.shutdown().await;
}

#[tokio::test]
async fn test_budget_holds_with_several_tablet_servers() {
    let mut config = Config::default();
    config.manager.tablet_servers = 3;
    config.manager.assignment_interval_ms = 20;
    let instance = Instance::start(config).await.unwrap();
    let monitor = start_monitor(&instance).await;
    let budget = WatcherBudget::default();

    let base = fetch_watch_count(monitor).await.unwrap();
    budget.check(base, 0).unwrap();

    for name in ["t1", "t2", "t3"] {
        let table = TableId::new(name).unwrap();
        let splits: Vec<String> = (1..10).map(|i| format!("row{}", i)).collect();
        instance.create_table(&table, &splits).await.unwrap();
        instance.ops().set_online(&table, true).await.unwrap();
    }

    let observed = fetch_watch_count(monitor).await.unwrap();
    budget.check(observed, 3).unwrap();
    assert_eq!(observed, instance.watch_count().await as u64);

    // Tablet servers hold their locks but no watches of their own
    let stats = instance.service().watch_stats().unwrap();
    for server in instance.tservers() {
        assert!(instance
            .service()
            .session_watches(server.session())
            .unwrap()
            .is_empty());
    }
    assert_eq!(stats.total as u64, observed);
    assert_eq!(stats.connections, 4);
    assert_eq!(instance.watch_summary().await.unwrap().processes.len(), 4);

    instance.shutdown().await;
}

#[tokio::test]
async fn test_watches_per_table_ignore_split_count() {
    let instance = Instance::start(Config::default()).await.unwrap();
    let base = instance.watch_count().await;

    let whole = TableId::new("whole").unwrap();
    instance.create_table(&whole, &[]).await.unwrap();
    let after_whole = instance.watch_count().await;

    let split = TableId::new("split").unwrap();
    let splits: Vec<String> = (1..=50).map(|i| format!("row{:03}", i)).collect();
    assert_eq!(instance.create_table(&split, &splits).await.unwrap(), 51);
    instance.ops().set_online(&split, true).await.unwrap();
    let after_split = instance.watch_count().await;

    assert_eq!(after_whole - base, after_split - after_whole);
    assert_eq!(after_whole - base, 16);

    instance.shutdown().await;
}

#[tokio::test]
async fn test_recreated_table_keeps_its_watches() {
    let mut config = Config::default();
    config.manager.assignment_interval_ms = 20;
    let instance = Instance::start(config).await.unwrap();
    let table = TableId::new("again").unwrap();

    instance.create_table(&table, &[]).await.unwrap();
    let with_table = instance.watch_count().await;

    for _ in 0..3 {
        instance.delete_table(&table).await.unwrap();
        instance.create_table(&table, &[]).await.unwrap();
    }
    instance.ops().set_online(&table, true).await.unwrap();

    // Let the deletions' notifications drain before counting
    tokio::time::sleep(std::time::Duration::from_millis(200)).await;
    assert_eq!(instance.watch_count().await, with_table);
    assert_eq!(
        instance.service().watch_stats().unwrap().total,
        with_table
    );
    let summary = instance.watch_summary().await.unwrap();
    assert!(summary.within_budget);
    assert_eq!(summary.tables, 1);

    instance.shutdown().await;
}

#[tokio::test]
async fn test_count_stable_across_online_cycles() {
    let instance = Instance::start(Config::default()).await.unwrap();
    let table = TableId::new("cycled").unwrap();
    instance.create_table(&table, &[]).await.unwrap();
    let before = instance.watch_count().await;

    for _ in 0..3 {
        instance.ops().set_offline(&table, true).await.unwrap();
        instance.ops().set_online(&table, true).await.unwrap();
    }
    assert_eq!(instance.watch_count().await, before);

    instance.shutdown().await;
}

#[tokio::test]
async fn test_deleted_table_releases_watches() {
    let instance = Instance::start(Config::default()).await.unwrap();
    let base = instance.watch_count().await;

    let table = TableId::new("gone").unwrap();
    instance.create_table(&table, &["k".to_string()]).await.unwrap();
    assert!(instance.watch_count().await > base);

    instance.delete_table(&table).await.unwrap();
    assert_eq!(instance.watch_count().await, base);

    instance.shutdown().await;
}

#[test]
fn test_custom_envelope_rejects_excess() {
    let budget = WatcherBudget::new(BudgetConfig {
        base_min: 10,
        base_max: 12,
        per_table_min: 2,
        per_table_max: 3,
    });
    assert_eq!(budget.envelope(2), 14..=18);
    assert!(budget.check(16, 2).is_ok());
    assert!(budget.check(19, 2).is_err());
    assert!(budget.check(13, 2).is_err());
}
