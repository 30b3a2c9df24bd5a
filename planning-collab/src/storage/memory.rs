//! Process-local store for tests and single-node deployments without disk.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use uuid::Uuid;

use super::{PlanningStore, StoreError, StoredPlanning};
use crate::conflict::PlanningConflict;
use crate::model::{Planning, PlanningId};
use crate::operation::Operation;

#[derive(Debug)]
struct Entry {
    planning: Planning,
    operations: Vec<Operation>,
    /// Op id to its index in `operations`
    operation_ids: HashMap<Uuid, usize>,
    conflicts: Vec<PlanningConflict>,
}

#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: Mutex<HashMap<PlanningId, Entry>>,
    failing_saves: AtomicU32,
    saves: AtomicU64,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `n` calls to `save_planning` fail with a transient error.
    pub fn fail_next_saves(&self, n: u32) {
        self.failing_saves.store(n, Ordering::SeqCst);
    }

    /// Number of successful saves so far.
    pub fn save_count(&self) -> u64 {
        self.saves.load(Ordering::SeqCst)
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<PlanningId, Entry>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn take_failure(&self) -> bool {
        self.failing_saves
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

impl PlanningStore for MemoryStore {
    fn create_planning(&self, planning: &Planning) -> Result<(), StoreError> {
        let mut entries = self.lock();
        if entries.contains_key(&planning.id) {
            return Err(StoreError::AlreadyExists(planning.id));
        }
        entries.insert(
            planning.id,
            Entry {
                planning: planning.clone(),
                operations: Vec::new(),
                operation_ids: HashMap::new(),
                conflicts: Vec::new(),
            },
        );
        Ok(())
    }

    fn get_planning(&self, id: PlanningId) -> Result<StoredPlanning, StoreError> {
        let entries = self.lock();
        let entry = entries.get(&id).ok_or(StoreError::NotFound(id))?;
        Ok(StoredPlanning { planning: entry.planning.clone(), operations: entry.operations.clone() })
    }

    fn save_planning(&self, id: PlanningId, planning: &Planning, expected_version: u64) -> Result<(), StoreError> {
        if self.take_failure() {
            return Err(StoreError::Unavailable("injected save failure".into()));
        }
        let mut entries = self.lock();
        let entry = entries.get_mut(&id).ok_or(StoreError::NotFound(id))?;
        if entry.planning.version != expected_version {
            return Err(StoreError::VersionConflict { expected: expected_version, actual: entry.planning.version });
        }
        entry.planning = planning.clone();
        self.saves.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn append_operation(&self, id: PlanningId, operation: &Operation) -> Result<bool, StoreError> {
        let mut entries = self.lock();
        let entry = entries.get_mut(&id).ok_or(StoreError::NotFound(id))?;
        if let Some(&index) = entry.operation_ids.get(&operation.id) {
            if let Some(logged) = entry.operations.get_mut(index) {
                if logged.seq != operation.seq {
                    *logged = operation.clone();
                }
            }
            return Ok(false);
        }
        entry.operation_ids.insert(operation.id, entry.operations.len());
        entry.operations.push(operation.clone());
        Ok(true)
    }

    fn record_conflict(&self, conflict: &PlanningConflict) -> Result<(), StoreError> {
        let mut entries = self.lock();
        let entry = entries
            .get_mut(&conflict.planning_id)
            .ok_or(StoreError::NotFound(conflict.planning_id))?;
        match entry.conflicts.iter_mut().find(|c| c.id == conflict.id) {
            Some(existing) => *existing = conflict.clone(),
            None => entry.conflicts.push(conflict.clone()),
        }
        Ok(())
    }

    fn list_conflicts(&self, id: PlanningId) -> Result<Vec<PlanningConflict>, StoreError> {
        let entries = self.lock();
        let entry = entries.get(&id).ok_or(StoreError::NotFound(id))?;
        Ok(entry.conflicts.clone())
    }
}
