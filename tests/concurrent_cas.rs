//! Concurrent actors against one tablet record

use futures_util::future::join_all;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tabletloc::common::{KeyExtent, ServerId, TableId};
use tabletloc::coordinator::metadata::MetadataStore;
use tabletloc::coordinator::{LocationEvent, LocationMode, LocationState, LocationStateMachine};
use tabletloc::Error;
use tempfile::TempDir;

fn setup(store: MetadataStore, mode: LocationMode) -> (Arc<LocationStateMachine>, KeyExtent) {
    let store = Arc::new(store);
    let extent = store
        .create_table(&TableId::new("race").unwrap(), &[])
        .unwrap()
        .remove(0);
    (
        Arc::new(LocationStateMachine::new(store, mode, 256)),
        extent,
    )
}

/// Sample the record until stopped, checking what every reader relies on
fn observe(
    machine: Arc<LocationStateMachine>,
    extent: KeyExtent,
    stop: Arc<AtomicBool>,
) -> tokio::task::JoinHandle<usize> {
    tokio::spawn(async move {
        let mut samples = 0;
        let mut seen_last: Option<ServerId> = None;
        let mut version = 0;
        while !stop.load(Ordering::SeqCst) {
            let read = machine.store().tablet(&extent).unwrap();
            assert!(read.version >= version, "version went backwards");
            version = read.version;

            let snapshot = read.record.location.snapshot();
            assert!(!(snapshot.current.is_some() && snapshot.future.is_some()));
            if seen_last.is_some() {
                assert!(snapshot.last.is_some(), "last reverted to empty");
            }
            seen_last = snapshot.last;
            samples += 1;
            tokio::task::yield_now().await;
        }
        samples
    })
}

async fn race(machine: Arc<LocationStateMachine>, extent: KeyExtent) {
    let stop = Arc::new(AtomicBool::new(false));
    let observer = observe(machine.clone(), extent.clone(), stop.clone());

    // Only one assignment can win
    let servers: Vec<ServerId> = (0..8).map(|i| ServerId::new(format!("ts{}", i))).collect();
    let begins = join_all(servers.iter().cloned().map(|target| {
        let machine = machine.clone();
        let extent = extent.clone();
        tokio::spawn(async move {
            machine
                .apply(&extent, LocationEvent::BeginAssignment { target })
                .await
        })
    }))
    .await;
    let mut winners = Vec::new();
    for outcome in begins {
        match outcome.unwrap() {
            Ok(record) => winners.push(record.record.location.future().cloned().unwrap()),
            Err(Error::InvalidTransition { .. }) => {}
            Err(e) => panic!("unexpected error: {}", e),
        }
    }
    assert_eq!(winners.len(), 1);
    let winner = winners.remove(0);

    // Every loser confirming is rejected, the winner's confirm is idempotent
    let confirms = join_all(servers.iter().cloned().chain([winner.clone(), winner.clone()]).map(
        |server| {
            let machine = machine.clone();
            let extent = extent.clone();
            tokio::spawn(async move {
                let ok = machine
                    .apply(&extent, LocationEvent::AssignmentConfirmed { server: server.clone() })
                    .await
                    .is_ok();
                (server, ok)
            })
        },
    ))
    .await;
    for outcome in confirms {
        let (server, ok) = outcome.unwrap();
        assert_eq!(ok, server == winner, "confirm by {}", server);
    }

    // Concurrent persists all land; the highest flush id wins
    let persists = join_all((1..=16u64).map(|id| {
        let machine = machine.clone();
        let extent = extent.clone();
        let server = winner.clone();
        tokio::spawn(async move {
            machine
                .apply(
                    &extent,
                    LocationEvent::PersistCompleted {
                        server,
                        flush_id: Some(id),
                    },
                )
                .await
        })
    }))
    .await;
    for outcome in persists {
        outcome.unwrap().unwrap();
    }
    let record = machine.store().tablet(&extent).unwrap().record;
    assert_eq!(record.flush_id, 16);
    assert_eq!(record.location.current(), Some(&winner));
    assert_eq!(record.location.last(), Some(&winner));

    // Offline races late persists; whatever the order, last stays
    let offline = {
        let machine = machine.clone();
        let extent = extent.clone();
        tokio::spawn(async move { machine.apply(&extent, LocationEvent::TakeOffline).await })
    };
    let late = join_all((17..=24u64).map(|id| {
        let machine = machine.clone();
        let extent = extent.clone();
        let server = winner.clone();
        tokio::spawn(async move {
            machine
                .apply(
                    &extent,
                    LocationEvent::PersistCompleted {
                        server,
                        flush_id: Some(id),
                    },
                )
                .await
        })
    }))
    .await;
    offline.await.unwrap().unwrap();
    for outcome in late {
        match outcome.unwrap() {
            Ok(_) | Err(Error::InvalidTransition { .. }) => {}
            Err(e) => panic!("unexpected error: {}", e),
        }
    }

    stop.store(true, Ordering::SeqCst);
    assert!(observer.await.unwrap() > 0);

    let record = machine.store().tablet(&extent).unwrap().record;
    assert_eq!(record.location.state, LocationState::Offline);
    assert_eq!(record.location.last(), Some(&winner));
    assert!(record.flush_id >= 16);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_racing_actors_in_memory() {
    let (machine, extent) = setup(MetadataStore::in_memory(), LocationMode::Compaction);
    race(machine, extent).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_racing_actors_rocksdb() {
    let dir = TempDir::new().unwrap();
    let (machine, extent) = setup(
        MetadataStore::open(dir.path()).unwrap(),
        LocationMode::Compaction,
    );
    race(machine, extent).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_stale_read_is_rejected() {
    let store = Arc::new(MetadataStore::in_memory());
    let extent = store
        .create_table(&TableId::new("hot").unwrap(), &[])
        .unwrap()
        .remove(0);
    let machine = Arc::new(LocationStateMachine::new(
        store.clone(),
        LocationMode::Assignment,
        0,
    ));

    // A stale read loses against a concurrent writer and is not retried
    let stale = store.tablet(&extent).unwrap();
    machine
        .apply(
            &extent,
            LocationEvent::BeginAssignment {
                target: ServerId::new("a"),
            },
        )
        .await
        .unwrap();
    let mut next = stale.record.clone();
    next.flush_id = 1;
    let err = store.compare_and_set_tablet(&stale, next).unwrap_err();
    assert!(matches!(err, Error::StaleWriteConflict { .. }));
    assert!(err.is_retryable());
}
