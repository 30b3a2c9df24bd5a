//! Transform window: recently accepted operations, ordered by seq.
//!
//! A submission based on version `v` is rebased over every window entry with
//! `seq > v`. Entries at or below `floor` are gone, so anything based before
//! the floor cannot be transformed and the client has to resync.
//!
//! Accepted ids are remembered for the whole life of the log, including ids
//! trimmed from the window, so a late duplicate is still recognised.

use std::collections::{HashMap, VecDeque};
use uuid::Uuid;

use crate::operation::Operation;

#[derive(Debug, Default)]
pub struct TransformWindow {
    window: VecDeque<Operation>,
    accepted: HashMap<Uuid, u64>,
    floor: u64,
}

impl TransformWindow {
    /// Empty log for a document currently at `version`.
    pub fn new(version: u64) -> Self {
        Self { window: VecDeque::new(), accepted: HashMap::new(), floor: version }
    }

    /// Rebuild from a stored log. Only operations above `floor` enter the
    /// window; every id is remembered.
    pub fn from_stored<'a, I>(operations: I, floor: u64) -> Self
    where
        I: IntoIterator<Item = &'a Operation>,
    {
        let mut log = Self::new(floor);
        let mut window: Vec<Operation> = Vec::new();
        for op in operations {
            log.accepted.insert(op.id, op.seq);
            if op.seq > floor {
                window.push(op.clone());
            }
        }
        window.sort_by_key(Operation::order_key);
        log.window = window.into();
        log
    }

    /// Seq assigned to `id`, if it was already accepted.
    pub fn seq_of(&self, id: Uuid) -> Option<u64> {
        self.accepted.get(&id).copied()
    }

    pub fn get(&self, id: Uuid) -> Option<&Operation> {
        let seq = self.seq_of(id)?;
        self.window.iter().find(|op| op.seq == seq && op.id == id)
    }

    /// Whether a submission based on `base_version` can still be rebased.
    pub fn covers(&self, base_version: u64) -> bool {
        base_version >= self.floor
    }

    /// Operations accepted after `version`, oldest first.
    pub fn since(&self, version: u64) -> impl Iterator<Item = &Operation> {
        let start = self.window.partition_point(|op| op.seq <= version);
        self.window.range(start..)
    }

    /// Append an accepted operation. Its seq must be above every entry.
    pub fn push(&mut self, op: Operation) {
        debug_assert!(self.window.back().map_or(true, |last| last.seq < op.seq));
        self.accepted.insert(op.id, op.seq);
        self.window.push_back(op);
    }

    /// Drop entries with `seq <= keep_after`, then the oldest entries beyond
    /// `cap`. Returns how many were dropped.
    pub fn trim(&mut self, keep_after: u64, cap: usize) -> usize {
        let mut dropped = 0;
        while let Some(front) = self.window.front() {
            if front.seq > keep_after && self.window.len() <= cap {
                break;
            }
            if let Some(op) = self.window.pop_front() {
                self.floor = self.floor.max(op.seq);
                dropped += 1;
            }
        }
        if dropped > 0 {
            log::trace!("Trimmed {dropped} operations, window floor now {}", self.floor);
        }
        dropped
    }

    pub fn floor(&self) -> u64 {
        self.floor
    }

    pub fn len(&self) -> usize {
        self.window.len()
    }

    pub fn is_empty(&self) -> bool {
        self.window.is_empty()
    }
}
