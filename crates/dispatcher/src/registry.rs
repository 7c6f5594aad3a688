//! Worker registry and round-robin rotation
//!
//! The registry owns every on-duty worker's record and one rotation queue per
//! speciality. Queues are lazily cleaned: leaving only removes the record, and
//! the stale queue entries are dropped when selection runs into them.
//!
//! Entries are tagged with the generation of the registration that produced
//! them. A worker that re-joins (or re-registers while on duty) gets a fresh
//! generation, which turns every older entry into garbage and puts it at the
//! back of the rotation.

use crate::channel::Channel;
use expo_common::error::{ExpoError, Result};
use expo_common::METRICS;
use expo_proto::{Speciality, WorkerId};
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// An on-duty worker and the channel its orders travel over
pub struct WorkerRecord {
    id: WorkerId,
    specialities: Vec<Speciality>,
    generation: u64,
    channel: tokio::sync::Mutex<Box<dyn Channel>>,
    desynced: AtomicBool,
}

impl WorkerRecord {
    pub fn id(&self) -> &WorkerId {
        &self.id
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Take exclusive use of the worker's channel, waiting for any relay in progress
    pub async fn lock_channel(&self) -> tokio::sync::MutexGuard<'_, Box<dyn Channel>> {
        self.channel.lock().await
    }

    /// Whether a relay currently holds the channel
    pub fn is_busy(&self) -> bool {
        self.channel.try_lock().is_err()
    }

    /// Flag the channel as out of step: an order went out and its response was never read
    pub fn mark_desynced(&self) {
        self.desynced.store(true, Ordering::Release);
    }

    pub fn is_desynced(&self) -> bool {
        self.desynced.load(Ordering::Acquire)
    }
}

impl fmt::Debug for WorkerRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkerRecord")
            .field("id", &self.id)
            .field("specialities", &self.specialities)
            .field("generation", &self.generation)
            .field("desynced", &self.is_desynced())
            .finish_non_exhaustive()
    }
}

/// Result of [`WorkerRegistry::register`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Registration {
    /// The identifier was not on duty
    Joined,

    /// The identifier was already on duty; its old record and channel were discarded
    Replaced,
}

/// Result of [`WorkerRegistry::deregister`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Deregistration {
    Left,

    /// The identifier was not on duty; nothing changed
    NotOnDuty,
}

#[derive(Debug, Clone)]
struct Entry {
    id: WorkerId,
    generation: u64,
}

/// Rotation order for one speciality
#[derive(Debug, Default)]
struct RotationQueue {
    entries: VecDeque<Entry>,

    /// Entries that still point at a current registration
    live: usize,
}

impl RotationQueue {
    fn stale(&self) -> usize {
        self.entries.len().saturating_sub(self.live)
    }
}

#[derive(Default)]
struct RegistryState {
    active: HashMap<WorkerId, Arc<WorkerRecord>>,
    queues: HashMap<Speciality, RotationQueue>,
    next_generation: u64,
}

fn is_live(active: &HashMap<WorkerId, Arc<WorkerRecord>>, entry: &Entry) -> bool {
    active
        .get(&entry.id)
        .map_or(false, |record| record.generation == entry.generation)
}

impl RegistryState {
    /// Remove `id` from duty and account for the entries it leaves behind
    fn retire(&mut self, id: &WorkerId, compaction_threshold: usize) -> Option<Arc<WorkerRecord>> {
        let record = self.active.remove(id)?;
        self.forget(&record, compaction_threshold);
        Some(record)
    }

    fn forget(&mut self, record: &WorkerRecord, compaction_threshold: usize) {
        for speciality in &record.specialities {
            if let Some(queue) = self.queues.get_mut(speciality) {
                queue.live = queue.live.saturating_sub(1);
            }
            self.compact(speciality, compaction_threshold);
        }
    }

    /// Rewrite a queue to its live entries once garbage dominates it
    fn compact(&mut self, speciality: &Speciality, threshold: usize) {
        let RegistryState { active, queues, .. } = self;
        let Some(queue) = queues.get_mut(speciality) else {
            return;
        };

        let stale = queue.stale();
        if stale <= threshold || stale <= queue.live {
            return;
        }

        queue.entries.retain(|entry| is_live(active, entry));
        METRICS.dispatcher.queue_compactions.inc();
        debug!(
            "Compacted rotation for {}: dropped {} stale entries, {} remain",
            speciality,
            stale,
            queue.entries.len()
        );

        if queue.entries.is_empty() {
            queues.remove(speciality);
        }
    }
}

/// Registry of on-duty workers
///
/// All mutation and selection happens under one lock, so the active map and
/// the rotation queues are never observed out of step with each other.
pub struct WorkerRegistry {
    state: Mutex<RegistryState>,
    compaction_threshold: usize,
}

impl WorkerRegistry {
    /// Create an empty registry for a new operating period
    pub fn new(compaction_threshold: usize) -> Self {
        Self {
            state: Mutex::new(RegistryState::default()),
            compaction_threshold,
        }
    }

    /// Put a worker on duty
    ///
    /// If `id` is already on duty its record is replaced: the new speciality
    /// set and channel take effect, the old channel is dropped once no relay
    /// holds it, and the worker moves to the back of every rotation it is in.
    /// Duplicate tags are collapsed; an empty speciality set is rejected.
    pub fn register(
        &self,
        id: WorkerId,
        specialities: Vec<Speciality>,
        channel: Box<dyn Channel>,
    ) -> Result<Registration> {
        let mut unique: Vec<Speciality> = Vec::with_capacity(specialities.len());
        for speciality in specialities {
            if !unique.contains(&speciality) {
                unique.push(speciality);
            }
        }

        if unique.is_empty() {
            return Err(ExpoError::invalid_input(format!(
                "worker {} must offer at least one speciality",
                id
            )));
        }

        let mut state = self.state.lock();

        let generation = state.next_generation;
        state.next_generation += 1;

        let record = Arc::new(WorkerRecord {
            id: id.clone(),
            specialities: unique,
            generation,
            channel: tokio::sync::Mutex::new(channel),
            desynced: AtomicBool::new(false),
        });

        let previous = state.active.insert(id.clone(), record.clone());

        for speciality in &record.specialities {
            let queue = state.queues.entry(speciality.clone()).or_default();
            queue.entries.push_back(Entry {
                id: id.clone(),
                generation,
            });
            queue.live += 1;
        }

        let outcome = match previous {
            Some(old) => {
                state.forget(&old, self.compaction_threshold);
                warn!(
                    "Worker {} re-registered while on duty; replacing {:?} with {:?}",
                    id, old.specialities, record.specialities
                );
                Registration::Replaced
            }
            None => {
                info!("Worker {} on duty for {:?}", id, record.specialities);
                Registration::Joined
            }
        };

        METRICS.dispatcher.joins_total.inc();
        METRICS.dispatcher.active_workers.set(state.active.len() as i64);

        Ok(outcome)
    }

    /// Take a worker off duty
    ///
    /// Leaving when not on duty is a no-op. Stale rotation entries are left for
    /// [`WorkerRegistry::select`] to drop.
    pub fn deregister(&self, id: &WorkerId) -> Deregistration {
        let mut state = self.state.lock();

        match state.retire(id, self.compaction_threshold) {
            Some(_) => {
                info!("Worker {} off duty", id);
                METRICS.dispatcher.leaves_total.inc();
                METRICS.dispatcher.active_workers.set(state.active.len() as i64);
                Deregistration::Left
            }
            None => {
                debug!("Leave for worker {} which is not on duty", id);
                Deregistration::NotOnDuty
            }
        }
    }

    /// Remove a worker after its connection failed
    ///
    /// Only the registration identified by `generation` is removed; a newer
    /// registration under the same id is left alone.
    pub fn evict(&self, id: &WorkerId, generation: u64) -> bool {
        let mut state = self.state.lock();

        let current = state
            .active
            .get(id)
            .map_or(false, |record| record.generation == generation);
        if !current {
            return false;
        }

        state.retire(id, self.compaction_threshold);
        METRICS.dispatcher.active_workers.set(state.active.len() as i64);
        warn!("Evicted worker {} after a channel failure", id);
        true
    }

    /// Pick the next worker for `speciality` in round-robin order
    ///
    /// Stale entries met on the way are dropped for good. When the queue runs
    /// out without finding an on-duty worker, fails with
    /// [`ExpoError::NoAvailableWorker`].
    pub fn select(&self, speciality: &Speciality) -> Result<Arc<WorkerRecord>> {
        let mut state = self.state.lock();
        let RegistryState { active, queues, .. } = &mut *state;

        let Some(queue) = queues.get_mut(speciality) else {
            return Err(ExpoError::NoAvailableWorker(speciality.clone()));
        };

        let mut skipped = 0u64;
        let mut selected = None;

        while let Some(entry) = queue.entries.pop_front() {
            if !is_live(active, &entry) {
                skipped += 1;
                continue;
            }

            let record = active[&entry.id].clone();
            if record.is_desynced() {
                // Its channel still owes a response to an abandoned order.
                selected = Some(Err(record));
                break;
            }

            queue.entries.push_back(entry);
            selected = Some(Ok(record));
            break;
        }

        if skipped > 0 {
            METRICS.dispatcher.stale_entries_skipped.inc_by(skipped);
            debug!("Dropped {} stale entries from {} rotation", skipped, speciality);
        }

        match selected {
            Some(Ok(record)) => {
                debug!(
                    "Selected worker {} for {} (generation {})",
                    record.id, speciality, record.generation
                );
                Ok(record)
            }
            Some(Err(desynced)) => {
                state.retire(&desynced.id, self.compaction_threshold);
                METRICS.dispatcher.active_workers.set(state.active.len() as i64);
                warn!("Evicted worker {}: channel out of step", desynced.id);
                drop(state);
                self.select(speciality)
            }
            None => {
                queues.remove(speciality);
                Err(ExpoError::NoAvailableWorker(speciality.clone()))
            }
        }
    }

    /// Number of workers on duty
    pub fn active_count(&self) -> usize {
        self.state.lock().active.len()
    }

    pub fn is_active(&self, id: &WorkerId) -> bool {
        self.state.lock().active.contains_key(id)
    }

    /// Physical length of a rotation queue, stale entries included
    pub fn queue_len(&self, speciality: &Speciality) -> usize {
        self.state
            .lock()
            .queues
            .get(speciality)
            .map_or(0, |queue| queue.entries.len())
    }
}

impl fmt::Debug for WorkerRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("WorkerRegistry")
            .field("active", &state.active.len())
            .field("queues", &state.queues.len())
            .field("compaction_threshold", &self.compaction_threshold)
            .finish()
    }
}
