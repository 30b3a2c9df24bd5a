//! End-to-end scenarios through the registry with in-memory collaborators.
//!
//! Each test builds its own registry over a `MemoryStore` and a
//! `LocalTransport`, joins real participants and drives the public API.

use planning_collab::{
    AttributeOp, CollabConfig, CollabError, CollaboratorRole, ConflictKind, CurrentUser, EventType,
    LocalTransport, MemoryStore, OperationKind, Planning, PlanningRegistry, PlanningStatus, PlanningStore,
    PlanningTask, RealtimeEvent, SaveStatus, TextField, Transport, UserRole,
};
use planning_collab::engine::events::{CursorMoved, OperationApplied};
use planning_collab::transport::planning_channel;

use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;
use uuid::Uuid;

// ─── Helpers ─────────────────────────────────────────────────────────────────

struct Fixture {
    registry: PlanningRegistry,
    store: Arc<MemoryStore>,
    transport: Arc<LocalTransport>,
    family: CurrentUser,
    director: CurrentUser,
}

fn fixture_with(config: CollabConfig) -> Fixture {
    let store = Arc::new(MemoryStore::new());
    let transport = Arc::new(LocalTransport::new(config.subscriber_capacity, config.publish_timeout));
    let registry = PlanningRegistry::new(store.clone(), transport.clone(), config);
    Fixture {
        registry,
        store,
        transport,
        family: CurrentUser::new(Uuid::new_v4(), "Maria", UserRole::Family),
        director: CurrentUser::new(Uuid::new_v4(), "Sam", UserRole::Director),
    }
}

fn fixture() -> Fixture {
    fixture_with(CollabConfig::for_testing())
}

impl Fixture {
    async fn planning(&self, title: &str, description: &str) -> Planning {
        let planning = Planning::new(title, self.family.user_id, self.director.user_id).with_description(description);
        self.registry.create_planning(planning).await.unwrap()
    }

    async fn join_both(&self, planning: &Planning) {
        self.registry.join(planning.id, &self.family).await.unwrap();
        self.registry.join(planning.id, &self.director).await.unwrap();
    }
}

/// Wait for the next event of `event_type`, skipping others.
async fn next_event(sub: &mut planning_collab::Subscription, event_type: EventType) -> Arc<RealtimeEvent> {
    timeout(Duration::from_secs(2), async {
        loop {
            let event = sub.recv().await.expect("subscription closed");
            if event.event_type == event_type {
                return event;
            }
        }
    })
    .await
    .expect("timed out waiting for event")
}

// ─── Reference scenarios ─────────────────────────────────────────────────────

#[tokio::test]
async fn test_text_insert_concurrent_with_task_add() {
    let f = fixture();
    let planning = f
        .registry
        .create_planning(
            Planning::new("Service", f.family.user_id, f.director.user_id)
                .with_description("Plan the ceremony")
                .with_version(1),
        )
        .await
        .unwrap();
    f.join_both(&planning).await;

    let insert = f.family.stamp(planning.id, 1, OperationKind::insert(TextField::Description, 0, "urgent "));
    let task = PlanningTask::new("Book venue", f.director.user_id);
    let add = f.director.stamp(planning.id, 1, OperationKind::attribute(AttributeOp::TaskAdded { task }));

    let first = f.registry.submit(insert).await.unwrap();
    let second = f.registry.submit(add).await.unwrap();
    assert_eq!(first.version, 2);
    assert_eq!(second.version, 3);
    assert!(second.conflicts.is_empty());

    let snapshot = f.registry.snapshot(planning.id).await.unwrap();
    assert_eq!(snapshot.planning.description, "urgent Plan the ceremony");
    assert_eq!(snapshot.planning.title, "Service");
    assert_eq!(snapshot.planning.tasks.len(), 1);
    assert_eq!(snapshot.planning.tasks[0].title, "Book venue");
    assert_eq!(snapshot.planning.version, 3);
}

#[tokio::test]
async fn test_insert_and_delete_converge_in_either_order() {
    let mut outcomes = Vec::new();

    for insert_first in [true, false] {
        let f = fixture();
        let planning = f.planning("Service", "HELLO WORLD").await;
        f.join_both(&planning).await;

        let insert = f.family.stamp(planning.id, 0, OperationKind::insert(TextField::Description, 5, " BIG"));
        let delete = f.director.stamp(planning.id, 0, OperationKind::delete(TextField::Description, 6, 5));

        if insert_first {
            f.registry.submit(insert).await.unwrap();
            f.registry.submit(delete).await.unwrap();
        } else {
            f.registry.submit(delete).await.unwrap();
            f.registry.submit(insert).await.unwrap();
        }

        let snapshot = f.registry.snapshot(planning.id).await.unwrap();
        assert_eq!(snapshot.planning.version, 2);
        outcomes.push(snapshot.planning.description);
    }

    assert_eq!(outcomes, vec!["HELLO BIG ".to_string(), "HELLO BIG ".to_string()]);
}

#[tokio::test]
async fn test_lock_blocks_other_editors_until_released() {
    let f = fixture();
    let planning = f.planning("Service", "").await;
    f.join_both(&planning).await;

    let lock = f.registry.acquire_lock(planning.id, f.family.user_id, Some("Finalizing".into())).await.unwrap();
    assert!(lock.is_locked);
    assert_eq!(lock.locked_by, Some(f.family.user_id));

    let op = f.director.stamp(planning.id, 0, OperationKind::insert(TextField::Title, 0, "Final "));
    match f.registry.submit(op.clone()).await {
        Err(CollabError::LockConflict { locked_by, reason, .. }) => {
            assert_eq!(locked_by, f.family.user_id);
            assert_eq!(reason.as_deref(), Some("Finalizing"));
        }
        other => panic!("expected LockConflict, got {other:?}"),
    }

    // Acquiring is exclusive too
    assert!(matches!(
        f.registry.acquire_lock(planning.id, f.director.user_id, None).await,
        Err(CollabError::LockConflict { .. })
    ));

    assert!(f.registry.release_lock(planning.id, f.family.user_id).await.unwrap());
    let receipt = f.registry.submit(op).await.unwrap();
    assert!(!receipt.duplicate);
    assert_eq!(receipt.version, 1);
    assert!(f.registry.acquire_lock(planning.id, f.director.user_id, None).await.is_ok());
}

// ─── Pipeline properties ─────────────────────────────────────────────────────

#[tokio::test]
async fn test_resubmission_is_idempotent() {
    let f = fixture();
    let planning = f.planning("Service", "").await;
    f.join_both(&planning).await;

    let op = f.family.stamp(planning.id, 0, OperationKind::insert(TextField::Title, 0, "Memorial "));
    let first = f.registry.submit(op.clone()).await.unwrap();
    let again = f.registry.submit(op).await.unwrap();

    assert!(!first.duplicate);
    assert!(again.duplicate);
    assert_eq!(again.version, first.version);
    assert_eq!(again.operation.seq, first.operation.seq);

    let snapshot = f.registry.snapshot(planning.id).await.unwrap();
    assert_eq!(snapshot.planning.title, "Memorial Service");
    assert_eq!(snapshot.planning.version, 1);
}

#[tokio::test]
async fn test_version_counts_accepted_operations() {
    let f = fixture();
    let planning = f.planning("Service", "").await;
    f.join_both(&planning).await;

    // Everyone edits from the same stale base; each accepted op bumps by one.
    for i in 0..10 {
        let user = if i % 2 == 0 { &f.family } else { &f.director };
        let op = user.stamp(planning.id, 0, OperationKind::insert(TextField::Description, 0, "x"));
        let receipt = f.registry.submit(op).await.unwrap();
        assert_eq!(receipt.version, i + 1);
        assert_eq!(receipt.operation.seq, i + 1);
    }

    let snapshot = f.registry.snapshot(planning.id).await.unwrap();
    assert_eq!(snapshot.planning.version, 10);
    assert_eq!(snapshot.planning.description, "x".repeat(10));
}

#[tokio::test]
async fn test_invalid_operations_change_nothing() {
    let f = fixture();
    let planning = f.planning("Service", "").await;
    f.join_both(&planning).await;

    let empty = f.family.stamp(planning.id, 0, OperationKind::insert(TextField::Title, 0, ""));
    assert!(matches!(f.registry.submit(empty).await, Err(CollabError::Validation(_))));

    let future = f.family.stamp(planning.id, 5, OperationKind::insert(TextField::Title, 0, "x"));
    assert!(matches!(f.registry.submit(future).await, Err(CollabError::Validation(_))));

    let ghost = f.family.stamp(
        planning.id,
        0,
        OperationKind::attribute(AttributeOp::TaskDeleted { task_id: Uuid::new_v4() }),
    );
    assert!(matches!(f.registry.submit(ghost).await, Err(CollabError::Validation(_))));

    let snapshot = f.registry.snapshot(planning.id).await.unwrap();
    assert_eq!(snapshot.planning.version, 0);
}

#[tokio::test]
async fn test_viewer_is_denied_and_recorded() {
    let f = fixture();
    let viewer = CurrentUser::new(Uuid::new_v4(), "Cousin", UserRole::Family);
    let planning = Planning::new("Service", f.family.user_id, f.director.user_id)
        .with_collaborator(viewer.user_id, CollaboratorRole::Viewer);
    let planning = f.registry.create_planning(planning).await.unwrap();
    f.registry.join(planning.id, &f.family).await.unwrap();
    f.registry.join(planning.id, &viewer).await.unwrap();

    let op = viewer.stamp(planning.id, 0, OperationKind::insert(TextField::Title, 0, "x"));
    match f.registry.submit(op).await {
        Err(CollabError::PermissionDenied { user_id, .. }) => assert_eq!(user_id, viewer.user_id),
        other => panic!("expected PermissionDenied, got {other:?}"),
    }

    let conflicts = f.registry.conflicts(planning.id).await.unwrap();
    assert_eq!(conflicts.len(), 1);
    assert_eq!(conflicts[0].kind, ConflictKind::PermissionDenied);

    // Viewers may join; users without a role may not.
    let stranger = CurrentUser::new(Uuid::new_v4(), "Stranger", UserRole::Family);
    assert!(matches!(
        f.registry.join(planning.id, &stranger).await,
        Err(CollabError::PermissionDenied { .. })
    ));
}

#[tokio::test]
async fn test_stale_base_requires_resync() {
    let config = CollabConfig {
        transform_window_cap: 2,
        save_debounce: Duration::from_secs(60),
        ..CollabConfig::for_testing()
    };
    let f = fixture_with(config);
    let planning = f.planning("Service", "").await;
    f.join_both(&planning).await;

    for base in 0..4 {
        let op = f.family.stamp(planning.id, base, OperationKind::insert(TextField::Description, 0, "a"));
        f.registry.submit(op).await.unwrap();
    }

    let stale = f.director.stamp(planning.id, 0, OperationKind::insert(TextField::Title, 0, "x"));
    match f.registry.submit(stale).await {
        Err(CollabError::VersionMismatch { base, oldest }) => {
            assert_eq!(base, 0);
            assert_eq!(oldest, 2);
        }
        other => panic!("expected VersionMismatch, got {other:?}"),
    }

    let reset = f.registry.resync(planning.id, 0).await.unwrap();
    assert!(reset.requires_reset);
    assert!(reset.operations.is_empty());
    assert_eq!(reset.planning.version, 4);

    let replay = f.registry.resync(planning.id, 2).await.unwrap();
    assert!(!replay.requires_reset);
    let seqs: Vec<u64> = replay.operations.iter().map(|op| op.seq).collect();
    assert_eq!(seqs, vec![3, 4]);

    // Rebased on the snapshot the submission goes through.
    let fresh = f.director.stamp(planning.id, 4, OperationKind::insert(TextField::Title, 0, "x"));
    assert_eq!(f.registry.submit(fresh).await.unwrap().version, 5);
}

#[tokio::test]
async fn test_insert_inside_delete_is_recorded_for_review() {
    let f = fixture();
    let planning = f.planning("Service", "HELLO WORLD").await;
    f.join_both(&planning).await;

    let delete = f.family.stamp(planning.id, 0, OperationKind::delete(TextField::Description, 2, 6));
    let insert = f.director.stamp(planning.id, 0, OperationKind::insert(TextField::Description, 4, "zz"));
    f.registry.submit(delete).await.unwrap();
    let receipt = f.registry.submit(insert).await.unwrap();

    assert_eq!(receipt.conflicts.len(), 1);
    let conflict = &receipt.conflicts[0];
    assert_eq!(conflict.kind, ConflictKind::ConcurrentEdit);
    assert!(!conflict.resolved);
    assert_eq!(conflict.operations.len(), 2);

    let snapshot = f.registry.snapshot(planning.id).await.unwrap();
    assert_eq!(snapshot.planning.description, "HERLD");
    assert_eq!(snapshot.unresolved_conflicts.len(), 1);

    let resolved = f
        .registry
        .resolve_conflict(planning.id, conflict.id, f.director.user_id, "retyped by hand")
        .await
        .unwrap();
    assert!(resolved.resolved);
    assert!(f.registry.conflicts(planning.id).await.unwrap().is_empty());
    assert_eq!(f.registry.conflict_history(planning.id).await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_concurrent_status_changes_are_flagged() {
    let f = fixture();
    let planning = f.planning("Service", "").await;
    f.join_both(&planning).await;

    let a = f.family.stamp(
        planning.id,
        0,
        OperationKind::attribute(AttributeOp::StatusChanged { status: PlanningStatus::Active }),
    );
    let b = f.director.stamp(
        planning.id,
        0,
        OperationKind::attribute(AttributeOp::StatusChanged { status: PlanningStatus::Completed }),
    );
    f.registry.submit(a).await.unwrap();
    let receipt = f.registry.submit(b).await.unwrap();

    assert_eq!(receipt.conflicts.len(), 1);
    let snapshot = f.registry.snapshot(planning.id).await.unwrap();
    assert_eq!(snapshot.planning.status, PlanningStatus::Completed);
}

// ─── Realtime events ─────────────────────────────────────────────────────────

#[tokio::test]
async fn test_applied_operations_are_broadcast() {
    let f = fixture();
    let planning = f.planning("Service", "").await;
    let mut sub = f.transport.subscribe(&planning_channel(planning.id), &[EventType::OperationApplied]);
    f.join_both(&planning).await;

    let op = f.family.stamp(planning.id, 0, OperationKind::insert(TextField::Title, 0, "Memorial "));
    f.registry.submit(op.clone()).await.unwrap();

    let event = next_event(&mut sub, EventType::OperationApplied).await;
    assert_eq!(event.user_id, f.family.user_id);
    let applied: OperationApplied = event.payload().unwrap();
    assert_eq!(applied.operation.id, op.id);
    assert_eq!(applied.version, 1);
}

#[tokio::test]
async fn test_cursor_updates_are_coalesced() {
    let config = CollabConfig { cursor_interval: Duration::from_millis(200), ..CollabConfig::for_testing() };
    let f = fixture_with(config);
    let planning = f.planning("Service", "a long enough description").await;
    let mut sub = f.transport.subscribe(&planning_channel(planning.id), &[EventType::CursorMoved]);
    f.join_both(&planning).await;

    for position in 1..=5 {
        f.registry
            .update_cursor(planning.id, f.family.user_id, TextField::Description, position, None)
            .await
            .unwrap();
    }

    let first: CursorMoved = next_event(&mut sub, EventType::CursorMoved).await.payload().unwrap();
    assert_eq!(first.cursor.position, 1);
    let last: CursorMoved = next_event(&mut sub, EventType::CursorMoved).await.payload().unwrap();
    assert_eq!(last.cursor.position, 5);

    // Nothing else was queued
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(sub.try_recv().is_none());
}

#[tokio::test]
async fn test_cursor_positions_are_clamped() {
    let f = fixture();
    let planning = f.planning("Service", "").await;
    f.join_both(&planning).await;

    f.registry
        .update_cursor(planning.id, f.family.user_id, TextField::Title, 500, None)
        .await
        .unwrap();
    let snapshot = f.registry.snapshot(planning.id).await.unwrap();
    let cursor = snapshot.session.participants[&f.family.user_id].cursor.clone().unwrap();
    assert_eq!(cursor.position, "Service".chars().count());
}

// ─── Lifecycle ───────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_last_leave_flushes_and_closes() {
    let config = CollabConfig { save_debounce: Duration::from_secs(60), ..CollabConfig::for_testing() };
    let f = fixture_with(config);
    let planning = f.planning("Service", "").await;
    f.join_both(&planning).await;

    let op = f.family.stamp(planning.id, 0, OperationKind::insert(TextField::Title, 0, "Memorial "));
    f.registry.submit(op).await.unwrap();

    f.registry.leave(planning.id, f.family.user_id).await.unwrap();
    assert!(f.registry.is_open(planning.id).await);
    f.registry.leave(planning.id, f.director.user_id).await.unwrap();
    assert!(!f.registry.is_open(planning.id).await);

    let stored = f.store.get_planning(planning.id).unwrap();
    assert_eq!(stored.planning.version, 1);
    assert_eq!(stored.planning.title, "Memorial Service");
    assert_eq!(stored.operations.len(), 1);

    assert!(matches!(
        f.registry.submit(f.family.stamp(planning.id, 1, OperationKind::insert(TextField::Title, 0, "x"))).await,
        Err(CollabError::NotOpen(_))
    ));
}

#[tokio::test]
async fn test_leaving_releases_held_lock() {
    let f = fixture();
    let planning = f.planning("Service", "").await;
    f.join_both(&planning).await;

    f.registry.acquire_lock(planning.id, f.family.user_id, None).await.unwrap();
    f.registry.leave(planning.id, f.family.user_id).await.unwrap();

    let snapshot = f.registry.snapshot(planning.id).await.unwrap();
    assert!(!snapshot.session.lock.is_locked);
    let op = f.director.stamp(planning.id, 0, OperationKind::insert(TextField::Title, 0, "x"));
    assert!(f.registry.submit(op).await.is_ok());
}

#[tokio::test]
async fn test_save_status_reaches_saved() {
    let f = fixture();
    let planning = f.planning("Service", "").await;
    f.join_both(&planning).await;

    let op = f.family.stamp(planning.id, 0, OperationKind::insert(TextField::Title, 0, "x"));
    f.registry.submit(op).await.unwrap();

    timeout(Duration::from_secs(2), async {
        loop {
            let stats = f.registry.stats().await;
            let doc = &stats.documents[0];
            if doc.save_status == SaveStatus::Saved && !doc.has_unsaved_changes {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("planning never reported saved");

    assert_eq!(f.store.get_planning(planning.id).unwrap().planning.version, 1);
}

#[tokio::test]
async fn test_save_failures_surface_after_threshold() {
    let f = fixture();
    let planning = f.planning("Service", "").await;
    let mut sub = f.transport.subscribe(&planning_channel(planning.id), &[EventType::SaveStatusChanged]);
    f.join_both(&planning).await;
    f.store.fail_next_saves(3);

    let op = f.family.stamp(planning.id, 0, OperationKind::insert(TextField::Title, 0, "x"));
    f.registry.submit(op).await.unwrap();

    let mut statuses = Vec::new();
    while statuses.last() != Some(&SaveStatus::Saved) {
        let event = next_event(&mut sub, EventType::SaveStatusChanged).await;
        let payload: planning_collab::engine::events::SaveStatusChanged = event.payload().unwrap();
        statuses.push(payload.status);
    }
    assert!(statuses.contains(&SaveStatus::Failing { consecutive_failures: 3 }));
    assert_eq!(statuses.last(), Some(&SaveStatus::Saved));
}

#[tokio::test]
async fn test_closing_one_planning_does_not_stall_another() {
    let f = fixture_with(CollabConfig {
        save_debounce: Duration::from_secs(60),
        save_backoff_base: Duration::from_millis(200),
        save_backoff_max: Duration::from_millis(400),
        max_save_attempts: 4,
        ..CollabConfig::for_testing()
    });
    let slow = f.planning("Slow", "").await;
    let other = f.planning("Other", "").await;
    f.registry.join(slow.id, &f.family).await.unwrap();
    f.registry.join(other.id, &f.director).await.unwrap();

    let op = f.family.stamp(slow.id, 0, OperationKind::insert(TextField::Title, 0, "x"));
    f.registry.submit(op).await.unwrap();
    // The teardown flush of `slow` keeps retrying for over a second.
    f.store.fail_next_saves(1000);

    let leave = f.registry.leave(slow.id, f.family.user_id);
    let edit = async {
        tokio::time::sleep(Duration::from_millis(100)).await;
        let started = tokio::time::Instant::now();
        let op = f.director.stamp(other.id, 0, OperationKind::insert(TextField::Title, 0, "y"));
        let version = f.registry.submit(op).await.unwrap().version;
        let snapshot = f.registry.snapshot(other.id).await.unwrap();
        (version, snapshot.planning.title, started.elapsed())
    };
    let (left, (version, title, waited)) = tokio::join!(leave, edit);

    left.unwrap();
    assert_eq!(version, 1);
    assert_eq!(title, "yOther");
    assert!(waited < Duration::from_millis(500), "edit waited {waited:?} behind another planning's teardown");
    assert!(!f.registry.is_open(slow.id).await);
    assert!(f.registry.is_open(other.id).await);
    f.store.fail_next_saves(0);
}

#[tokio::test]
async fn test_rejoin_during_teardown_waits_for_flush() {
    let f = fixture_with(CollabConfig {
        save_debounce: Duration::from_secs(60),
        save_backoff_base: Duration::from_millis(100),
        save_backoff_max: Duration::from_millis(100),
        max_save_attempts: 3,
        ..CollabConfig::for_testing()
    });
    let planning = f.planning("Service", "").await;
    f.registry.join(planning.id, &f.family).await.unwrap();
    let op = f.family.stamp(planning.id, 0, OperationKind::insert(TextField::Title, 0, "Memorial "));
    f.registry.submit(op).await.unwrap();
    // First attempt fails, the retry lands.
    f.store.fail_next_saves(1);

    let leave = f.registry.leave(planning.id, f.family.user_id);
    let rejoin = async {
        tokio::time::sleep(Duration::from_millis(20)).await;
        f.registry.join(planning.id, &f.director).await
    };
    let (left, joined) = tokio::join!(leave, rejoin);

    left.unwrap();
    let snapshot = joined.unwrap();
    assert_eq!(snapshot.planning.version, 1);
    assert_eq!(snapshot.planning.title, "Memorial Service");
    assert!(!snapshot.session.has_unsaved_changes);
    assert!(f.registry.is_open(planning.id).await);
    f.registry.shutdown().await;
}

#[tokio::test]
async fn test_plannings_are_independent() {
    let f = fixture();
    let first = f.planning("First", "").await;
    let second = f.planning("Second", "").await;
    f.join_both(&first).await;
    f.join_both(&second).await;

    f.registry.acquire_lock(first.id, f.family.user_id, None).await.unwrap();
    let op = f.director.stamp(second.id, 0, OperationKind::insert(TextField::Title, 0, "x"));
    assert_eq!(f.registry.submit(op).await.unwrap().version, 1);

    let stats = f.registry.stats().await;
    assert_eq!(stats.open_plannings, 2);
    assert_eq!(stats.participants, 4);

    f.registry.shutdown().await;
    assert!(!f.registry.is_open(first.id).await);
    assert_eq!(f.store.get_planning(second.id).unwrap().planning.version, 1);
}
