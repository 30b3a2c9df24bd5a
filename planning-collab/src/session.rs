//! Per-document session: roster, advisory lock and cursor presence.
//!
//! ## Architecture
//!
//! ```text
//! join / leave ──► PlanningSession ──► presence events
//!                      │
//!                      ├── LockState          (at most one holder)
//!                      ├── Participant.cursor (overwritten, never persisted)
//!                      └── CursorCoalescer    (≤ 1 broadcast / 100ms / user)
//! ```
//!
//! A session is owned by exactly one document actor, so nothing here locks.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::time::{Duration, Instant};
use uuid::Uuid;

use crate::error::{CollabError, Result};
use crate::model::{CollaboratorRole, PlanningId, UserId};
use crate::operation::TextField;

// ───────────────────────────────────────────────────────────────────
// Cursor presence
// ───────────────────────────────────────────────────────────────────

/// RGBA display color for a collaborator's cursor.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CursorColor {
    pub r: f32,
    pub g: f32,
    pub b: f32,
    pub a: f32,
}

impl CursorColor {
    /// Stable, saturated color derived from a user id.
    pub fn from_uuid(id: Uuid) -> Self {
        let hue = ((id.as_u128() % 360) as f32) / 360.0;
        let (r, g, b) = hsl_to_rgb(hue, 0.7, 0.6);
        Self { r, g, b, a: 1.0 }
    }

    /// `#rrggbb`, for web clients.
    pub fn to_hex(&self) -> String {
        let channel = |v: f32| (v.clamp(0.0, 1.0) * 255.0).round() as u8;
        format!("#{:02x}{:02x}{:02x}", channel(self.r), channel(self.g), channel(self.b))
    }
}

fn hsl_to_rgb(h: f32, s: f32, l: f32) -> (f32, f32, f32) {
    if s == 0.0 {
        return (l, l, l);
    }
    let q = if l < 0.5 { l * (1.0 + s) } else { l + s - l * s };
    let p = 2.0 * l - q;
    (
        hue_to_rgb(p, q, h + 1.0 / 3.0),
        hue_to_rgb(p, q, h),
        hue_to_rgb(p, q, h - 1.0 / 3.0),
    )
}

fn hue_to_rgb(p: f32, q: f32, mut t: f32) -> f32 {
    if t < 0.0 {
        t += 1.0;
    }
    if t > 1.0 {
        t -= 1.0;
    }
    if t < 1.0 / 6.0 {
        return p + (q - p) * 6.0 * t;
    }
    if t < 1.0 / 2.0 {
        return q;
    }
    if t < 2.0 / 3.0 {
        return p + (q - p) * (2.0 / 3.0 - t) * 6.0;
    }
    p
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SelectionRange {
    pub start: usize,
    pub end: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CollaboratorCursor {
    pub user_id: UserId,
    pub field: TextField,
    pub position: usize,
    pub selection: Option<SelectionRange>,
    pub color: CursorColor,
    pub timestamp: u64,
}

/// What to do with a cursor update.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CursorDecision {
    /// Broadcast immediately.
    Send,
    /// Held back. `schedule` is set for the first deferred update in a
    /// window; the caller arms one timer that fires after `wait`.
    Deferred { wait: Duration, schedule: bool },
}

/// Coalesces cursor broadcasts to at most one per `interval` per user.
///
/// Updates that arrive inside the window overwrite each other; only the
/// latest is sent when the window closes.
#[derive(Debug)]
pub struct CursorCoalescer {
    interval: Duration,
    last_sent: HashMap<UserId, Instant>,
    pending: HashMap<UserId, CollaboratorCursor>,
}

impl CursorCoalescer {
    pub fn new(interval: Duration) -> Self {
        Self { interval, last_sent: HashMap::new(), pending: HashMap::new() }
    }

    pub fn offer(&mut self, cursor: CollaboratorCursor, now: Instant) -> CursorDecision {
        let user_id = cursor.user_id;
        match self.last_sent.get(&user_id) {
            Some(last) if now.duration_since(*last) < self.interval => {
                let wait = self.interval - now.duration_since(*last);
                let schedule = self.pending.insert(user_id, cursor).is_none();
                CursorDecision::Deferred { wait, schedule }
            }
            _ => {
                self.last_sent.insert(user_id, now);
                self.pending.remove(&user_id);
                CursorDecision::Send
            }
        }
    }

    /// Take the coalesced cursor for a user whose window closed.
    pub fn take_pending(&mut self, user_id: UserId, now: Instant) -> Option<CollaboratorCursor> {
        let cursor = self.pending.remove(&user_id)?;
        self.last_sent.insert(user_id, now);
        Some(cursor)
    }

    pub fn forget(&mut self, user_id: UserId) {
        self.last_sent.remove(&user_id);
        self.pending.remove(&user_id);
    }
}

// ───────────────────────────────────────────────────────────────────
// Roster and lock
// ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Participant {
    pub user_id: UserId,
    pub user_name: String,
    pub role: CollaboratorRole,
    pub joined_at: u64,
    pub last_active: u64,
    pub cursor: Option<CollaboratorCursor>,
    /// Highest planning version this participant reported as integrated.
    pub acknowledged_version: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockState {
    pub is_locked: bool,
    pub locked_by: Option<UserId>,
    pub locked_at: Option<u64>,
    pub reason: Option<String>,
}

/// Save-back state shown to users next to the unsaved-changes indicator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum SaveStatus {
    Saved,
    Pending,
    Retrying { attempt: u32 },
    /// Persistent failure, surfaced to users.
    Failing { consecutive_failures: u32 },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanningSession {
    pub planning_id: PlanningId,
    pub participants: BTreeMap<UserId, Participant>,
    pub current_version: u64,
    pub last_saved: Option<u64>,
    pub has_unsaved_changes: bool,
    pub lock: LockState,
    pub save_status: SaveStatus,
}

impl PlanningSession {
    pub fn new(planning_id: PlanningId, current_version: u64) -> Self {
        Self {
            planning_id,
            participants: BTreeMap::new(),
            current_version,
            last_saved: None,
            has_unsaved_changes: false,
            lock: LockState::default(),
            save_status: SaveStatus::Saved,
        }
    }

    /// Add a participant, or refresh one that reconnects.
    pub fn join(&mut self, user_id: UserId, user_name: &str, role: CollaboratorRole, now: u64) -> &Participant {
        let version = self.current_version;
        let participant = self.participants.entry(user_id).or_insert_with(|| Participant {
            user_id,
            user_name: user_name.to_string(),
            role,
            joined_at: now,
            last_active: now,
            cursor: None,
            acknowledged_version: version,
        });
        participant.last_active = now;
        participant.role = role;
        participant
    }

    /// Remove a participant. Returns the participant and whether their lock
    /// was released on the way out.
    pub fn leave(&mut self, user_id: UserId) -> (Option<Participant>, bool) {
        let removed = self.participants.remove(&user_id);
        let released = self.lock.locked_by == Some(user_id);
        if released {
            self.lock = LockState::default();
        }
        (removed, released)
    }

    pub fn is_empty(&self) -> bool {
        self.participants.is_empty()
    }

    pub fn participant(&self, user_id: UserId) -> Option<&Participant> {
        self.participants.get(&user_id)
    }

    pub fn touch(&mut self, user_id: UserId, now: u64) {
        if let Some(p) = self.participants.get_mut(&user_id) {
            p.last_active = now;
        }
    }

    /// Fails if someone other than `user_id` holds the lock.
    pub fn check_lock(&self, user_id: UserId) -> Result<()> {
        match self.lock.locked_by {
            Some(holder) if self.lock.is_locked && holder != user_id => Err(CollabError::LockConflict {
                planning_id: self.planning_id,
                locked_by: holder,
                reason: self.lock.reason.clone(),
            }),
            _ => Ok(()),
        }
    }

    /// Acquire the advisory lock. Re-acquiring your own lock refreshes the reason.
    pub fn acquire_lock(&mut self, user_id: UserId, reason: Option<String>, now: u64) -> Result<&LockState> {
        self.check_lock(user_id)?;
        let locked_at = match self.lock.locked_by {
            Some(holder) if holder == user_id => self.lock.locked_at,
            _ => Some(now),
        };
        self.lock = LockState { is_locked: true, locked_by: Some(user_id), locked_at, reason };
        Ok(&self.lock)
    }

    /// Release the lock. `Ok(false)` when there was nothing to release.
    pub fn release_lock(&mut self, user_id: UserId) -> Result<bool> {
        if !self.lock.is_locked {
            return Ok(false);
        }
        self.check_lock(user_id)?;
        self.lock = LockState::default();
        Ok(true)
    }

    pub fn update_cursor(&mut self, cursor: CollaboratorCursor) -> Result<()> {
        let planning_id = self.planning_id;
        let participant = self
            .participants
            .get_mut(&cursor.user_id)
            .ok_or(CollabError::NotParticipant { planning_id, user_id: cursor.user_id })?;
        participant.last_active = cursor.timestamp;
        participant.cursor = Some(cursor);
        Ok(())
    }

    /// Record the version a participant has integrated. Never moves backwards.
    pub fn acknowledge(&mut self, user_id: UserId, version: u64) {
        if let Some(p) = self.participants.get_mut(&user_id) {
            p.acknowledged_version = p.acknowledged_version.max(version.min(self.current_version));
        }
    }

    /// Oldest version still needed by any participant.
    pub fn min_acknowledged(&self) -> Option<u64> {
        self.participants.values().map(|p| p.acknowledged_version).min()
    }

    pub fn mark_applied(&mut self, version: u64) {
        self.current_version = version;
        self.has_unsaved_changes = true;
        if matches!(self.save_status, SaveStatus::Saved) {
            self.save_status = SaveStatus::Pending;
        }
    }

    pub fn mark_saved(&mut self, version: u64, now: u64) {
        self.last_saved = Some(now);
        if version >= self.current_version {
            self.has_unsaved_changes = false;
            self.save_status = SaveStatus::Saved;
        } else {
            self.save_status = SaveStatus::Pending;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session() -> PlanningSession {
        PlanningSession::new(Uuid::new_v4(), 1)
    }

    fn cursor(user_id: UserId, position: usize) -> CollaboratorCursor {
        CollaboratorCursor {
            user_id,
            field: TextField::Description,
            position,
            selection: None,
            color: CursorColor::from_uuid(user_id),
            timestamp: 0,
        }
    }

    #[test]
    fn test_lock_exclusivity() {
        let mut s = session();
        let alice = Uuid::new_v4();
        let bob = Uuid::new_v4();

        s.acquire_lock(alice, Some("Finalizing".into()), 10).unwrap();
        let err = s.acquire_lock(bob, None, 11).unwrap_err();
        assert!(matches!(err, CollabError::LockConflict { locked_by, .. } if locked_by == alice));

        // Bob cannot release Alice's lock.
        assert!(s.release_lock(bob).is_err());
        assert!(s.release_lock(alice).unwrap());
        assert!(s.acquire_lock(bob, None, 12).is_ok());
    }

    #[test]
    fn test_reacquire_keeps_original_timestamp() {
        let mut s = session();
        let alice = Uuid::new_v4();
        s.acquire_lock(alice, Some("a".into()), 10).unwrap();
        let lock = s.acquire_lock(alice, Some("b".into()), 20).unwrap();
        assert_eq!(lock.locked_at, Some(10));
        assert_eq!(lock.reason.as_deref(), Some("b"));
    }

    #[test]
    fn test_leave_releases_lock() {
        let mut s = session();
        let alice = Uuid::new_v4();
        s.join(alice, "Alice", CollaboratorRole::Owner, 1);
        s.acquire_lock(alice, None, 2).unwrap();

        let (gone, released) = s.leave(alice);
        assert!(gone.is_some());
        assert!(released);
        assert!(!s.lock.is_locked);
        assert!(s.is_empty());
    }

    #[test]
    fn test_rejoin_keeps_joined_at() {
        let mut s = session();
        let alice = Uuid::new_v4();
        s.join(alice, "Alice", CollaboratorRole::Editor, 1);
        let p = s.join(alice, "Alice", CollaboratorRole::Editor, 5);
        assert_eq!(p.joined_at, 1);
        assert_eq!(p.last_active, 5);
        assert_eq!(s.participants.len(), 1);
    }

    #[test]
    fn test_cursor_requires_participant() {
        let mut s = session();
        assert!(matches!(
            s.update_cursor(cursor(Uuid::new_v4(), 3)),
            Err(CollabError::NotParticipant { .. })
        ));
    }

    #[test]
    fn test_acknowledge_is_monotonic_and_bounded() {
        let mut s = session();
        let alice = Uuid::new_v4();
        let bob = Uuid::new_v4();
        s.join(alice, "Alice", CollaboratorRole::Owner, 1);
        s.join(bob, "Bob", CollaboratorRole::Owner, 1);
        s.mark_applied(5);

        s.acknowledge(alice, 4);
        s.acknowledge(alice, 2);
        s.acknowledge(bob, 99);
        assert_eq!(s.participant(alice).unwrap().acknowledged_version, 4);
        assert_eq!(s.participant(bob).unwrap().acknowledged_version, 5);
        assert_eq!(s.min_acknowledged(), Some(4));
    }

    #[test]
    fn test_save_status_transitions() {
        let mut s = session();
        s.mark_applied(2);
        assert!(s.has_unsaved_changes);
        assert_eq!(s.save_status, SaveStatus::Pending);

        s.mark_applied(3);
        s.mark_saved(2, 100);
        assert!(s.has_unsaved_changes);

        s.mark_saved(3, 200);
        assert!(!s.has_unsaved_changes);
        assert_eq!(s.save_status, SaveStatus::Saved);
        assert_eq!(s.last_saved, Some(200));
    }

    #[test]
    fn test_coalescer_sends_first_then_defers() {
        let user = Uuid::new_v4();
        let mut c = CursorCoalescer::new(Duration::from_millis(100));
        let t0 = Instant::now();

        assert_eq!(c.offer(cursor(user, 1), t0), CursorDecision::Send);

        let d1 = c.offer(cursor(user, 2), t0 + Duration::from_millis(10));
        assert_eq!(d1, CursorDecision::Deferred { wait: Duration::from_millis(90), schedule: true });

        // A second update in the same window overwrites without a new timer.
        let d2 = c.offer(cursor(user, 3), t0 + Duration::from_millis(20));
        assert!(matches!(d2, CursorDecision::Deferred { schedule: false, .. }));

        let flushed = c.take_pending(user, t0 + Duration::from_millis(100)).unwrap();
        assert_eq!(flushed.position, 3);
        assert!(c.take_pending(user, t0 + Duration::from_millis(101)).is_none());
    }

    #[test]
    fn test_coalescer_window_is_per_user() {
        let mut c = CursorCoalescer::new(Duration::from_millis(100));
        let t0 = Instant::now();
        assert_eq!(c.offer(cursor(Uuid::new_v4(), 1), t0), CursorDecision::Send);
        assert_eq!(c.offer(cursor(Uuid::new_v4(), 1), t0), CursorDecision::Send);
    }

    #[test]
    fn test_cursor_color_stable_hex() {
        let id = Uuid::parse_str("550e8400-e29b-41d4-a716-446655440000").unwrap();
        let hex = CursorColor::from_uuid(id).to_hex();
        assert_eq!(hex, CursorColor::from_uuid(id).to_hex());
        assert_eq!(hex.len(), 7);
        assert!(hex.starts_with('#'));
    }
}
