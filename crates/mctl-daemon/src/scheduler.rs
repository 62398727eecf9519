//! Cron scheduler for `run_mode: schedule` workloads.
//!
//! A min-heap of `(next_fire_time, insertion_seq, name)` drives a single
//! cooperative loop: sleep until the head entry is due, fire it, compute
//! the next occurrence and reinsert. A firing never preempts an active
//! run; an overlapping firing is dropped and the schedule advances.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::str::FromStr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::registry::Registry;

#[derive(Debug, thiserror::Error)]
pub enum ScheduleError {
    #[error("invalid cron expression '{expr}': {message}")]
    InvalidCron { expr: String, message: String },
}

#[derive(Clone, Debug, PartialEq, Eq)]
struct FireEntry {
    at: DateTime<Utc>,
    seq: u64,
    name: String,
    generation: u64,
}

impl Ord for FireEntry {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        // Equal fire times release in insertion order.
        (self.at, self.seq).cmp(&(other.at, other.seq))
    }
}

impl PartialOrd for FireEntry {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

struct Inner {
    heap: BinaryHeap<Reverse<FireEntry>>,
    schedules: HashMap<String, (cron::Schedule, u64)>,
    next_seq: u64,
    next_generation: u64,
}

/// Min-heap cron trigger source for schedule-mode workloads.
pub struct Scheduler {
    inner: Mutex<Inner>,
    notify: Notify,
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl Scheduler {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                heap: BinaryHeap::new(),
                schedules: HashMap::new(),
                next_seq: 0,
                next_generation: 0,
            }),
            notify: Notify::new(),
        }
    }

    /// Registers (or re-registers) a workload's cron expression. Operators
    /// write classic five-field expressions; the parser wants six.
    pub fn add(&self, name: &str, expr: &str) -> Result<(), ScheduleError> {
        let schedule = cron::Schedule::from_str(&format!("0 {expr}")).map_err(|e| {
            ScheduleError::InvalidCron {
                expr: expr.to_string(),
                message: e.to_string(),
            }
        })?;
        let next = schedule.after(&Utc::now()).next();
        {
            let mut inner = self.inner.lock().expect("scheduler lock");
            inner.next_generation += 1;
            let generation = inner.next_generation;
            inner
                .schedules
                .insert(name.to_string(), (schedule, generation));
            if let Some(at) = next {
                let seq = inner.next_seq;
                inner.next_seq += 1;
                inner.heap.push(Reverse(FireEntry {
                    at,
                    seq,
                    name: name.to_string(),
                    generation,
                }));
                info!(workload = name, cron = expr, next_fire = %at, "schedule registered");
            }
        }
        self.notify.notify_one();
        Ok(())
    }

    /// Unregisters a workload. Stale heap entries are discarded lazily.
    pub fn remove(&self, name: &str) {
        let removed = {
            let mut inner = self.inner.lock().expect("scheduler lock");
            inner.schedules.remove(name).is_some()
        };
        if removed {
            debug!(workload = name, "schedule removed");
            self.notify.notify_one();
        }
    }

    pub fn contains(&self, name: &str) -> bool {
        self.inner
            .lock()
            .expect("scheduler lock")
            .schedules
            .contains_key(name)
    }

    /// Next pending fire time, if any. Exposed for status surfaces.
    pub fn next_fire(&self) -> Option<DateTime<Utc>> {
        let mut inner = self.inner.lock().expect("scheduler lock");
        Self::prune_stale(&mut inner);
        inner.heap.peek().map(|Reverse(entry)| entry.at)
    }

    fn prune_stale(inner: &mut Inner) {
        while let Some(Reverse(head)) = inner.heap.peek() {
            let valid = inner
                .schedules
                .get(&head.name)
                .is_some_and(|(_, generation)| *generation == head.generation);
            if valid {
                break;
            }
            inner.heap.pop();
        }
    }

    /// The cooperative scheduler loop. Runs until cancelled.
    pub async fn run(&self, registry: Arc<Registry>, shutdown: CancellationToken) {
        loop {
            let head_at = {
                let mut inner = self.inner.lock().expect("scheduler lock");
                Self::prune_stale(&mut inner);
                inner.heap.peek().map(|Reverse(entry)| entry.at)
            };

            match head_at {
                None => {
                    tokio::select! {
                        _ = self.notify.notified() => {}
                        _ = shutdown.cancelled() => return,
                    }
                }
                Some(at) => {
                    let wait = (at - Utc::now())
                        .to_std()
                        .unwrap_or(Duration::ZERO);
                    tokio::select! {
                        _ = tokio::time::sleep(wait) => {
                            self.fire_due(&registry).await;
                        }
                        _ = self.notify.notified() => {}
                        _ = shutdown.cancelled() => return,
                    }
                }
            }
        }
    }

    async fn fire_due(&self, registry: &Registry) {
        let now = Utc::now();
        let mut due = Vec::new();
        {
            let mut inner = self.inner.lock().expect("scheduler lock");
            loop {
                Self::prune_stale(&mut inner);
                let is_due = inner
                    .heap
                    .peek()
                    .is_some_and(|Reverse(entry)| entry.at <= now);
                if !is_due {
                    break;
                }
                let Reverse(entry) = inner.heap.pop().expect("peeked entry");
                // Reinsert at the next occurrence regardless of whether
                // this firing starts anything.
                if let Some((schedule, generation)) = inner.schedules.get(&entry.name) {
                    let generation = *generation;
                    if let Some(next) = schedule.after(&now).next() {
                        let seq = inner.next_seq;
                        inner.next_seq += 1;
                        let name = entry.name.clone();
                        inner.heap.push(Reverse(FireEntry {
                            at: next,
                            seq,
                            name,
                            generation,
                        }));
                    }
                }
                due.push(entry.name);
            }
        }

        for name in due {
            let Some(supervisor) = registry.get(&name) else {
                continue;
            };
            let status = supervisor.state_snapshot().status;
            if status.is_startable() {
                debug!(workload = %name, "schedule fired");
                if let Err(e) = supervisor.start().await {
                    warn!(workload = %name, error = %e, "scheduled start failed");
                }
            } else {
                warn!(
                    workload = %name,
                    status = status.as_str(),
                    "dropping scheduled firing, previous run still active"
                );
            }
        }
    }
}
