//! In-process concurrency governor.
//!
//! Capacity is reserved before a claim is issued so that concurrent ticks
//! can never over-claim. A [`Reservation`] either becomes an
//! [`ActiveTaskGuard`] on dispatch or is released when dropped. The guard
//! removes its record on drop, so a record disappears exactly once however
//! execution ends.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::error::TaskError;
use crate::exec::SessionControl;

/// A task this process is executing. Never persisted.
#[derive(Clone)]
pub struct ActiveTaskRecord {
    pub task_id: Uuid,
    /// Machine whose capacity slot the task holds.
    pub machine_id: String,
    pub thread_id: Option<String>,
    pub started_at: DateTime<Utc>,
    pub cancel_requested: bool,
    session: Option<Arc<dyn SessionControl>>,
}

impl ActiveTaskRecord {
    pub fn has_session(&self) -> bool {
        self.session.is_some()
    }
}

impl std::fmt::Debug for ActiveTaskRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ActiveTaskRecord")
            .field("task_id", &self.task_id)
            .field("machine_id", &self.machine_id)
            .field("thread_id", &self.thread_id)
            .field("started_at", &self.started_at)
            .field("cancel_requested", &self.cancel_requested)
            .field("has_session", &self.session.is_some())
            .finish()
    }
}

#[derive(Default)]
struct GovernorState {
    /// Outstanding reservations per machine.
    reserved: HashMap<String, usize>,
    records: HashMap<Uuid, ActiveTaskRecord>,
}

impl GovernorState {
    fn load(&self, machine_id: &str) -> usize {
        let reserved = self.reserved.get(machine_id).copied().unwrap_or(0);
        let running = self
            .records
            .values()
            .filter(|r| r.machine_id == machine_id)
            .count();
        reserved + running
    }

    fn release(&mut self, machine_id: &str) {
        if let Some(n) = self.reserved.get_mut(machine_id) {
            *n = n.saturating_sub(1);
            if *n == 0 {
                self.reserved.remove(machine_id);
            }
        }
    }
}

/// Owns the ActiveTaskRecord map. Cheap to clone; clones share state.
#[derive(Clone, Default)]
pub struct ConcurrencyGovernor {
    state: Arc<Mutex<GovernorState>>,
}

impl ConcurrencyGovernor {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, GovernorState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Reserve one slot on `machine_id` if fewer than `cap` are in use.
    pub fn try_reserve(&self, machine_id: &str, cap: usize) -> Option<Reservation> {
        let mut state = self.lock();
        if state.load(machine_id) >= cap {
            return None;
        }
        *state.reserved.entry(machine_id.to_string()).or_insert(0) += 1;
        Some(Reservation {
            governor: self.clone(),
            machine_id: machine_id.to_string(),
            released: false,
        })
    }

    /// Slots in use on `machine_id`, reservations included.
    pub fn load(&self, machine_id: &str) -> usize {
        self.lock().load(machine_id)
    }

    /// Number of tasks executing.
    pub fn active_count(&self) -> usize {
        self.lock().records.len()
    }

    pub fn contains(&self, task_id: Uuid) -> bool {
        self.lock().records.contains_key(&task_id)
    }

    pub fn get(&self, task_id: Uuid) -> Option<ActiveTaskRecord> {
        self.lock().records.get(&task_id).cloned()
    }

    pub fn active_ids(&self) -> Vec<Uuid> {
        self.lock().records.keys().copied().collect()
    }

    /// Forget every record and reservation.
    pub fn reset(&self) {
        let mut state = self.lock();
        state.records.clear();
        state.reserved.clear();
    }

    pub fn set_thread(&self, task_id: Uuid, thread_id: Option<String>) {
        if let Some(record) = self.lock().records.get_mut(&task_id) {
            record.thread_id = thread_id;
        }
    }

    pub fn thread_id(&self, task_id: Uuid) -> Option<String> {
        self.lock()
            .records
            .get(&task_id)
            .and_then(|r| r.thread_id.clone())
    }

    /// Attach a live session. Returns `false` if the task is not active.
    pub fn attach_session(&self, task_id: Uuid, session: Arc<dyn SessionControl>) -> bool {
        match self.lock().records.get_mut(&task_id) {
            Some(record) => {
                record.session = Some(session);
                true
            }
            None => false,
        }
    }

    pub fn session(&self, task_id: Uuid) -> Option<Arc<dyn SessionControl>> {
        self.lock()
            .records
            .get(&task_id)
            .and_then(|r| r.session.clone())
    }

    /// Flag `task_id` for cancellation and return its session, if any,
    /// so the caller can kill it outside the lock.
    pub fn request_cancel(
        &self,
        task_id: Uuid,
    ) -> Result<Option<Arc<dyn SessionControl>>, TaskError> {
        let mut state = self.lock();
        let record = state
            .records
            .get_mut(&task_id)
            .ok_or(TaskError::NotActive { id: task_id })?;
        record.cancel_requested = true;
        Ok(record.session.clone())
    }

    pub fn is_cancel_requested(&self, task_id: Uuid) -> bool {
        self.lock()
            .records
            .get(&task_id)
            .is_some_and(|r| r.cancel_requested)
    }

    fn remove(&self, task_id: Uuid) -> Option<ActiveTaskRecord> {
        self.lock().records.remove(&task_id)
    }
}

/// A capacity slot held while a claim is in flight.
pub struct Reservation {
    governor: ConcurrencyGovernor,
    machine_id: String,
    released: bool,
}

impl Reservation {
    pub fn machine_id(&self) -> &str {
        &self.machine_id
    }

    /// Turn the slot into an ActiveTaskRecord for `task_id`.
    pub fn activate(mut self, task_id: Uuid, thread_id: Option<String>) -> ActiveTaskGuard {
        let mut state = self.governor.lock();
        state.release(&self.machine_id);
        state.records.insert(
            task_id,
            ActiveTaskRecord {
                task_id,
                machine_id: self.machine_id.clone(),
                thread_id,
                started_at: Utc::now(),
                cancel_requested: false,
                session: None,
            },
        );
        drop(state);
        self.released = true;

        ActiveTaskGuard {
            governor: self.governor.clone(),
            task_id,
        }
    }
}

impl Reservation {
    /// Move `task_id`'s record onto this reservation's machine, freeing
    /// the slot it held before. Returns `false` if the task is not active.
    pub fn transfer(mut self, task_id: Uuid) -> bool {
        let mut state = self.governor.lock();
        state.release(&self.machine_id);
        self.released = true;
        match state.records.get_mut(&task_id) {
            Some(record) => {
                record.machine_id = self.machine_id.clone();
                true
            }
            None => false,
        }
    }
}

impl Drop for Reservation {
    fn drop(&mut self) {
        if !self.released {
            self.governor.lock().release(&self.machine_id);
        }
    }
}

/// Removes the task's record when dropped.
pub struct ActiveTaskGuard {
    governor: ConcurrencyGovernor,
    task_id: Uuid,
}

impl ActiveTaskGuard {
    pub fn task_id(&self) -> Uuid {
        self.task_id
    }
}

impl Drop for ActiveTaskGuard {
    fn drop(&mut self) {
        if self.governor.remove(self.task_id).is_some() {
            tracing::debug!(task_id = %self.task_id, "Active task record removed");
        }
    }
}
