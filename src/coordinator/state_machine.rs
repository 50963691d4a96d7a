//! Location state machine
//!
//! [`transition`] is the pure transition function over a tablet's
//! [`TabletLocation`]; [`LocationStateMachine::apply`] commits its result
//! through the metadata store's compare-and-set, retrying from a fresh read
//! when another actor wrote the record first.
//!
//! | From | Event | To | `last` |
//! |---|---|---|---|
//! | Unassigned / Offline | begin-assignment(t) | Assigning{t} | unchanged |
//! | Assigning{t} | assignment-confirmed(t) | Hosted{t} | ← t in assignment mode |
//! | Hosted{s} | persist-completed(s) | Hosted{s} | ← s in compaction mode |
//! | Hosted{s} / Assigning{s} | take-offline | Offline | unchanged |
//! | Hosted{s} / Assigning{s} | server-lost(s) | Unassigned | unchanged |
//!
//! Events whose effect is already in place are no-ops. Anything else is an
//! [`Error::InvalidTransition`].

use crate::common::metrics::METRICS;
use crate::common::{Error, KeyExtent, Result, ServerId, TableId};
use crate::coordination::{paths, CoordinationClient};
use crate::coordinator::location::{LocationState, TabletLocation};
use crate::coordinator::metadata::{MetadataStore, TabletRecord, Versioned};
use crate::coordinator::mode::{policy_for, LastLocationTrigger, LocationMode, LocationModePolicy};
use std::fmt;
use std::sync::{Arc, RwLock};
use tracing::{debug, warn};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LocationEvent {
    /// The assignment authority picked `target`.
    BeginAssignment { target: ServerId },
    /// `server` loaded the tablet and took ownership.
    AssignmentConfirmed { server: ServerId },
    /// `server` durably persisted the tablet (flush or compaction).
    PersistCompleted {
        server: ServerId,
        flush_id: Option<u64>,
    },
    TakeOffline,
    /// `server` lost its liveness lock.
    ServerLost { server: ServerId },
}

impl fmt::Display for LocationEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LocationEvent::BeginAssignment { target } => write!(f, "begin-assignment({})", target),
            LocationEvent::AssignmentConfirmed { server } => {
                write!(f, "assignment-confirmed({})", server)
            }
            LocationEvent::PersistCompleted { server, .. } => {
                write!(f, "persist-completed({})", server)
            }
            LocationEvent::TakeOffline => write!(f, "take-offline"),
            LocationEvent::ServerLost { server } => write!(f, "server-lost({})", server),
        }
    }
}

fn invalid(from: &LocationState, event: &LocationEvent) -> Error {
    Error::InvalidTransition {
        from: from.to_string(),
        event: event.to_string(),
    }
}

/// Compute the location that follows `event`.
pub fn transition(
    location: &TabletLocation,
    event: &LocationEvent,
    policy: &dyn LocationModePolicy,
) -> Result<TabletLocation> {
    use LocationState::*;

    let last = location.last.clone();
    let next = match (&location.state, event) {
        (Unassigned | Offline, LocationEvent::BeginAssignment { target }) => {
            TabletLocation::new(Assigning { target: target.clone() }, last)
        }
        (Assigning { target }, LocationEvent::BeginAssignment { target: requested })
            if target == requested =>
        {
            location.clone()
        }

        (Assigning { target }, LocationEvent::AssignmentConfirmed { server }) if target == server => {
            let last = if policy.updates_last_on(LastLocationTrigger::Hosted) {
                Some(server.clone())
            } else {
                last
            };
            TabletLocation::new(Hosted { server: server.clone() }, last)
        }
        (Hosted { server }, LocationEvent::AssignmentConfirmed { server: confirmed })
            if server == confirmed =>
        {
            location.clone()
        }

        (Hosted { server }, LocationEvent::PersistCompleted { server: persisted, .. })
            if server == persisted =>
        {
            let last = if policy.updates_last_on(LastLocationTrigger::Persisted) {
                Some(server.clone())
            } else {
                last
            };
            TabletLocation::new(location.state.clone(), last)
        }

        (Hosted { .. } | Assigning { .. }, LocationEvent::TakeOffline) => {
            TabletLocation::new(Offline, last)
        }
        (Offline | Unassigned, LocationEvent::TakeOffline) => location.clone(),

        (Hosted { server } | Assigning { target: server }, LocationEvent::ServerLost { server: lost })
            if server == lost =>
        {
            TabletLocation::new(Unassigned, last)
        }
        (_, LocationEvent::ServerLost { .. }) => location.clone(),

        (state, event) => return Err(invalid(state, event)),
    };
    Ok(next)
}

/// Applies location events to stored tablet records
pub struct LocationStateMachine {
    store: Arc<MetadataStore>,
    policy: RwLock<Arc<dyn LocationModePolicy>>,
    max_retries: u32,
    notifier: Option<Arc<dyn CoordinationClient>>,
}

impl LocationStateMachine {
    pub fn new(store: Arc<MetadataStore>, mode: LocationMode, max_retries: u32) -> Self {
        Self {
            store,
            policy: RwLock::new(policy_for(mode)),
            max_retries,
            notifier: None,
        }
    }

    /// Touch the table's `locations` node after every committed transition
    pub fn with_notifier(mut self, client: Arc<dyn CoordinationClient>) -> Self {
        self.notifier = Some(client);
        self
    }

    pub fn store(&self) -> &Arc<MetadataStore> {
        &self.store
    }

    pub fn mode(&self) -> LocationMode {
        self.policy().mode()
    }

    /// Swap the mode policy. Existing `last` values are left as they are;
    /// the new policy applies from the next transition on.
    pub fn set_mode(&self, mode: LocationMode) {
        let mut policy = self
            .policy
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if policy.mode() != mode {
            tracing::info!(%mode, "Last location mode changed");
            *policy = policy_for(mode);
        }
    }

    fn policy(&self) -> Arc<dyn LocationModePolicy> {
        self.policy
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    /// Apply `event` to the tablet, retrying on stale write conflicts.
    ///
    /// Returns the stored record once the write is acknowledged, or the
    /// unchanged record when the event was already in effect.
    pub async fn apply(
        &self,
        extent: &KeyExtent,
        event: LocationEvent,
    ) -> Result<Versioned<TabletRecord>> {
        let mut attempt = 0;
        loop {
            let read = self.store.tablet(extent)?;
            let policy = self.policy();
            let location = transition(&read.record.location, &event, policy.as_ref())?;

            let flush_id = match &event {
                LocationEvent::PersistCompleted {
                    flush_id: Some(id), ..
                } => read.record.flush_id.max(*id),
                _ => read.record.flush_id,
            };

            if location == read.record.location && flush_id == read.record.flush_id {
                METRICS.transitions_noop.inc();
                return Ok(read);
            }

            let next = TabletRecord {
                extent: read.record.extent.clone(),
                location,
                flush_id,
                updated_at: read.record.updated_at,
            };

            match self.store.compare_and_set_tablet(&read, next) {
                Ok(written) => {
                    METRICS.transitions_applied.inc();
                    debug!(
                        extent = %extent,
                        event = %event,
                        from = %read.record.location.state,
                        to = %written.record.location.state,
                        last = ?written.record.location.last,
                        mode = %policy.mode(),
                        "Location transition committed"
                    );
                    self.notify(&extent.table).await;
                    return Ok(written);
                }
                Err(Error::StaleWriteConflict { key }) => {
                    METRICS.cas_conflicts.inc();
                    attempt += 1;
                    if attempt > self.max_retries {
                        warn!(extent = %extent, event = %event, attempt, "Giving up after repeated CAS conflicts");
                        return Err(Error::StaleWriteConflict { key });
                    }
                    debug!(extent = %extent, event = %event, attempt, "CAS conflict, retrying from a fresh read");
                    tokio::task::yield_now().await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn notify(&self, table: &TableId) {
        let Some(client) = &self.notifier else {
            return;
        };
        let path = paths::table_locations(table);
        let stamp = crate::common::timestamp_now_millis().to_string().into_bytes();
        if let Err(e) = client.set_data(&path, stamp).await {
            warn!(table = %table, error = %e, "Failed to publish location change");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coordinator::mode::{AssignmentPolicy, CompactionPolicy};

    fn ts(id: &str) -> ServerId {
        ServerId::new(id)
    }

    fn hosted(server: &str, last: Option<&str>) -> TabletLocation {
        TabletLocation::new(
            LocationState::Hosted { server: ts(server) },
            last.map(ts),
        )
    }

    #[test]
    fn test_assignment_mode_sets_last_on_confirm() {
        let policy = AssignmentPolicy;
        let start = TabletLocation::default();
        let assigning = transition(
            &start,
            &LocationEvent::BeginAssignment { target: ts("ts1") },
            &policy,
        )
        .unwrap();
        assert_eq!(assigning.future(), Some(&ts("ts1")));
        assert_eq!(assigning.last(), None);

        let confirmed = transition(
            &assigning,
            &LocationEvent::AssignmentConfirmed { server: ts("ts1") },
            &policy,
        )
        .unwrap();
        assert_eq!(confirmed, hosted("ts1", Some("ts1")));

        let persisted = transition(
            &hosted("ts1", Some("ts0")),
            &LocationEvent::PersistCompleted {
                server: ts("ts1"),
                flush_id: None,
            },
            &policy,
        )
        .unwrap();
        assert_eq!(persisted.last(), Some(&ts("ts0")));
    }

    #[test]
    fn test_compaction_mode_sets_last_on_persist() {
        let policy = CompactionPolicy;
        let assigning = TabletLocation::new(
            LocationState::Assigning { target: ts("ts1") },
            None,
        );
        let confirmed = transition(
            &assigning,
            &LocationEvent::AssignmentConfirmed { server: ts("ts1") },
            &policy,
        )
        .unwrap();
        assert_eq!(confirmed, hosted("ts1", None));

        let persisted = transition(
            &confirmed,
            &LocationEvent::PersistCompleted {
                server: ts("ts1"),
                flush_id: Some(1),
            },
            &policy,
        )
        .unwrap();
        assert_eq!(persisted, hosted("ts1", Some("ts1")));
    }

    #[test]
    fn test_last_survives_offline_online() {
        let policy = CompactionPolicy;
        let offline = transition(
            &hosted("ts1", Some("ts1")),
            &LocationEvent::TakeOffline,
            &policy,
        )
        .unwrap();
        assert_eq!(offline.state, LocationState::Offline);
        assert_eq!(offline.last(), Some(&ts("ts1")));

        let assigning = transition(
            &offline,
            &LocationEvent::BeginAssignment { target: ts("ts2") },
            &policy,
        )
        .unwrap();
        let hosted_again = transition(
            &assigning,
            &LocationEvent::AssignmentConfirmed { server: ts("ts2") },
            &policy,
        )
        .unwrap();
        assert_eq!(hosted_again, hosted("ts2", Some("ts1")));
    }

    #[test]
    fn test_idempotent_events() {
        let policy = CompactionPolicy;
        let h = hosted("ts1", None);
        let same = transition(
            &h,
            &LocationEvent::AssignmentConfirmed { server: ts("ts1") },
            &policy,
        )
        .unwrap();
        assert_eq!(same, h);

        let unassigned = TabletLocation::default();
        assert_eq!(
            transition(&unassigned, &LocationEvent::TakeOffline, &policy).unwrap(),
            unassigned
        );

        let unrelated = transition(
            &h,
            &LocationEvent::ServerLost { server: ts("ts9") },
            &policy,
        )
        .unwrap();
        assert_eq!(unrelated, h);
    }

    #[test]
    fn test_server_lost_and_cancel() {
        let policy = CompactionPolicy;
        let lost = transition(
            &hosted("ts1", Some("ts1")),
            &LocationEvent::ServerLost { server: ts("ts1") },
            &policy,
        )
        .unwrap();
        assert_eq!(lost.state, LocationState::Unassigned);
        assert_eq!(lost.last(), Some(&ts("ts1")));

        let assigning = TabletLocation::new(
            LocationState::Assigning { target: ts("ts1") },
            None,
        );
        let cancelled = transition(&assigning, &LocationEvent::TakeOffline, &policy).unwrap();
        assert_eq!(cancelled.state, LocationState::Offline);
    }

    #[test]
    fn test_invalid_transitions() {
        let policy = CompactionPolicy;
        let cases = [
            (
                hosted("ts1", None),
                LocationEvent::BeginAssignment { target: ts("ts2") },
            ),
            (
                TabletLocation::default(),
                LocationEvent::AssignmentConfirmed { server: ts("ts1") },
            ),
            (
                TabletLocation::new(LocationState::Assigning { target: ts("ts1") }, None),
                LocationEvent::AssignmentConfirmed { server: ts("ts2") },
            ),
            (
                hosted("ts1", None),
                LocationEvent::PersistCompleted {
                    server: ts("ts2"),
                    flush_id: None,
                },
            ),
            (
                TabletLocation::new(LocationState::Offline, None),
                LocationEvent::PersistCompleted {
                    server: ts("ts1"),
                    flush_id: None,
                },
            ),
        ];
        for (location, event) in cases {
            let err = transition(&location, &event, &policy).unwrap_err();
            assert!(matches!(err, Error::InvalidTransition { .. }), "{}", event);
        }
    }

    fn machine(mode: LocationMode) -> (Arc<MetadataStore>, LocationStateMachine, KeyExtent) {
        let store = Arc::new(MetadataStore::in_memory());
        let table = TableId::new("t1").unwrap();
        let extent = store.create_table(&table, &[]).unwrap().remove(0);
        let machine = LocationStateMachine::new(store.clone(), mode, 16);
        (store, machine, extent)
    }

    #[tokio::test]
    async fn test_apply_commits_and_skips_noops() {
        let (store, machine, extent) = machine(LocationMode::Compaction);
        let begin = LocationEvent::BeginAssignment { target: ts("ts1") };

        let first = machine.apply(&extent, begin.clone()).await.unwrap();
        let again = machine.apply(&extent, begin).await.unwrap();
        assert_eq!(first.version, again.version);

        machine
            .apply(&extent, LocationEvent::AssignmentConfirmed { server: ts("ts1") })
            .await
            .unwrap();
        let persisted = machine
            .apply(
                &extent,
                LocationEvent::PersistCompleted {
                    server: ts("ts1"),
                    flush_id: Some(4),
                },
            )
            .await
            .unwrap();
        assert_eq!(persisted.record.flush_id, 4);
        assert_eq!(persisted.record.location, hosted("ts1", Some("ts1")));

        // An older flush id never lowers the persisted one
        machine
            .apply(
                &extent,
                LocationEvent::PersistCompleted {
                    server: ts("ts1"),
                    flush_id: Some(2),
                },
            )
            .await
            .unwrap();
        assert_eq!(store.tablet(&extent).unwrap().record.flush_id, 4);
    }

    #[tokio::test]
    async fn test_mode_switch_is_not_retroactive() {
        let (store, machine, extent) = machine(LocationMode::Compaction);
        machine
            .apply(&extent, LocationEvent::BeginAssignment { target: ts("ts1") })
            .await
            .unwrap();
        machine
            .apply(&extent, LocationEvent::AssignmentConfirmed { server: ts("ts1") })
            .await
            .unwrap();
        machine.set_mode(LocationMode::Assignment);
        assert_eq!(machine.mode(), LocationMode::Assignment);
        assert_eq!(store.tablet(&extent).unwrap().record.location.last, None);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_persists_keep_highest_flush_id() {
        let (store, machine, extent) = machine(LocationMode::Compaction);
        let machine = Arc::new(machine);
        machine
            .apply(&extent, LocationEvent::BeginAssignment { target: ts("ts1") })
            .await
            .unwrap();
        machine
            .apply(&extent, LocationEvent::AssignmentConfirmed { server: ts("ts1") })
            .await
            .unwrap();

        let mut handles = Vec::new();
        for id in 1..=8u64 {
            let machine = machine.clone();
            let extent = extent.clone();
            handles.push(tokio::spawn(async move {
                machine
                    .apply(
                        &extent,
                        LocationEvent::PersistCompleted {
                            server: ts("ts1"),
                            flush_id: Some(id),
                        },
                    )
                    .await
            }));
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }
        assert_eq!(store.tablet(&extent).unwrap().record.flush_id, 8);
    }
}
