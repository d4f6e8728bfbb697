use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex, MutexGuard,
    },
    time::{Duration, Instant},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ProgressPhase {
    #[default]
    Pending,
    Downloading,
    DownloadComplete,
    Merging,
    MergeComplete,
    Done,
    Failed,
}

impl ProgressPhase {
    fn is_finished(self) -> bool {
        matches!(self, Self::MergeComplete | Self::Done | Self::Failed)
    }

    fn is_running(self) -> bool {
        matches!(
            self,
            Self::Downloading | Self::DownloadComplete | Self::Merging
        )
    }
}

struct TaskProgress {
    /// Registration order, used to hand freed display slots to the oldest waiting task.
    order: u64,
    started_at: Instant,

    completed: AtomicUsize,
    failed: AtomicUsize,
    total: AtomicUsize,

    phase: Mutex<ProgressPhase>,
    slot: Mutex<Option<usize>>,
    message: Mutex<Option<String>>,
}

impl TaskProgress {
    fn phase(&self) -> MutexGuard<'_, ProgressPhase> {
        self.phase.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn slot(&self) -> Option<usize> {
        *self.slot.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Point-in-time view of one task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskSnapshot {
    pub name: String,
    pub completed: usize,
    pub failed: usize,
    pub total: usize,
    pub phase: ProgressPhase,
    /// Display slot held by the task, if it is rendering.
    pub slot: Option<usize>,
    pub message: Option<String>,
    pub elapsed: Duration,
}

impl TaskSnapshot {
    pub fn percentage(&self) -> f32 {
        if self.total == 0 {
            0.
        } else {
            (self.completed + self.failed) as f32 / self.total as f32 * 100.
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProgressSummary {
    pub total: usize,
    pub completed: usize,
    pub failed: usize,
    pub in_progress: usize,
    pub pending: usize,
}

struct Slots {
    free: Vec<usize>,
    next_order: u64,
}

/// Progress of every task of a run.
///
/// Counters are atomics so segment workers never serialize on a lock. Only tasks holding
/// one of the display slots emit progress lines; the others keep counting silently and
/// the oldest of them inherits the next slot that frees up.
pub struct ProgressAggregator {
    tasks: Mutex<HashMap<String, Arc<TaskProgress>>>,
    slots: Mutex<Slots>,
}

impl ProgressAggregator {
    pub fn new(display_slots: usize) -> Self {
        Self {
            tasks: Mutex::new(HashMap::new()),
            slots: Mutex::new(Slots {
                // reversed so that `pop` hands out the lowest slot
                free: (0..display_slots).rev().collect(),
                next_order: 0,
            }),
        }
    }

    fn tasks(&self) -> MutexGuard<'_, HashMap<String, Arc<TaskProgress>>> {
        self.tasks.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn slots(&self) -> MutexGuard<'_, Slots> {
        self.slots.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn get(&self, name: &str) -> Option<Arc<TaskProgress>> {
        let task = self.tasks().get(name).cloned();
        if task.is_none() {
            tracing::debug!("Progress update for unknown task {name}.");
        }
        task
    }

    /// Starts tracking `name`. Registering a name again resets its state.
    pub fn register_task(&self, name: &str, total: usize) {
        let previous = self.tasks().remove(name);
        if let Some(previous) = previous {
            self.release_slot(&previous);
        }

        let (order, slot) = {
            let mut slots = self.slots();
            slots.next_order += 1;
            (slots.next_order, slots.free.pop())
        };

        let task = Arc::new(TaskProgress {
            order,
            started_at: Instant::now(),
            completed: AtomicUsize::new(0),
            failed: AtomicUsize::new(0),
            total: AtomicUsize::new(total),
            phase: Mutex::new(ProgressPhase::Pending),
            slot: Mutex::new(slot),
            message: Mutex::new(None),
        });
        self.tasks().insert(name.to_string(), task);
    }

    /// Sets the segment count once it is known. Only the first non-zero value sticks.
    pub fn set_total(&self, name: &str, total: usize) {
        let Some(task) = self.get(name) else { return };
        if task
            .total
            .compare_exchange(0, total, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            tracing::debug!("Total of {name} is already set, ignoring {total}.");
        }
    }

    pub fn start_download(&self, name: &str) {
        let Some(task) = self.get(name) else { return };
        *task.phase() = ProgressPhase::Downloading;

        if let Some(slot) = task.slot() {
            let total = task.total.load(Ordering::Acquire);
            tracing::info!("[{slot}] {name}: downloading {total} segments.");
        }
    }

    pub fn on_segment_complete(&self, name: &str, success: bool) {
        let Some(task) = self.get(name) else { return };

        let (completed, failed) = if success {
            let completed = task.completed.fetch_add(1, Ordering::AcqRel) + 1;
            (completed, task.failed.load(Ordering::Acquire))
        } else {
            let failed = task.failed.fetch_add(1, Ordering::AcqRel) + 1;
            (task.completed.load(Ordering::Acquire), failed)
        };
        let total = task.total.load(Ordering::Acquire);
        let done = completed + failed;

        if total > 0 && done == total {
            let mut phase = task.phase();
            if matches!(*phase, ProgressPhase::Pending | ProgressPhase::Downloading) {
                *phase = ProgressPhase::DownloadComplete;
            }
        }

        if let Some(slot) = task.slot() {
            let percentage = if total == 0 {
                0.
            } else {
                done as f32 / total as f32 * 100.
            };
            if failed > 0 {
                tracing::info!(
                    "[{slot}] {name}: {done} / {total} or {percentage:.2}% ({failed} failed)"
                );
            } else {
                tracing::info!("[{slot}] {name}: {done} / {total} or {percentage:.2}%");
            }
        }
    }

    pub fn on_merge_start(&self, name: &str) {
        let Some(task) = self.get(name) else { return };
        *task.phase() = ProgressPhase::Merging;

        if let Some(slot) = task.slot() {
            tracing::info!("[{slot}] {name}: merging.");
        }
    }

    pub fn on_merge_complete(&self, name: &str, success: bool, message: Option<String>) {
        let phase = if success {
            ProgressPhase::MergeComplete
        } else {
            ProgressPhase::Failed
        };
        self.settle(name, phase, message);
    }

    pub fn finish(&self, name: &str, success: bool, message: Option<String>) {
        let phase = if success {
            ProgressPhase::Done
        } else {
            ProgressPhase::Failed
        };
        self.settle(name, phase, message);
    }

    fn settle(&self, name: &str, phase: ProgressPhase, message: Option<String>) {
        let Some(task) = self.get(name) else { return };
        *task.phase() = phase;
        if message.is_some() {
            *task.message.lock().unwrap_or_else(|e| e.into_inner()) = message.clone();
        }

        if let Some(slot) = task.slot() {
            let elapsed = task.started_at.elapsed();
            match (phase, message) {
                (ProgressPhase::Failed, Some(message)) => {
                    tracing::error!("[{slot}] {name}: failed after {elapsed:.1?}. {message}")
                }
                (ProgressPhase::Failed, None) => {
                    tracing::error!("[{slot}] {name}: failed after {elapsed:.1?}.")
                }
                _ => tracing::info!("[{slot}] {name}: finished in {elapsed:.1?}."),
            }
        }
        self.release_slot(&task);
    }

    /// Frees the slot of `task` and passes it to the oldest task still waiting for one.
    fn release_slot(&self, task: &TaskProgress) {
        let Some(slot) = task.slot.lock().unwrap_or_else(|e| e.into_inner()).take() else {
            return;
        };

        let waiting = self
            .tasks()
            .iter()
            .filter(|(_, t)| t.slot().is_none() && !t.phase().is_finished())
            .min_by_key(|(_, t)| t.order)
            .map(|(name, t)| (name.clone(), t.clone()));

        match waiting {
            Some((name, next)) => {
                *next.slot.lock().unwrap_or_else(|e| e.into_inner()) = Some(slot);
                tracing::debug!("Display slot {slot} passed to {name}.");
            }
            None => {
                let mut slots = self.slots();
                slots.free.push(slot);
                slots.free.sort_unstable_by(|a, b| b.cmp(a));
            }
        }
    }

    pub fn task(&self, name: &str) -> Option<TaskSnapshot> {
        let task = self.tasks().get(name).cloned()?;
        let phase = *task.phase();
        let slot = task.slot();
        let message = task.message.lock().unwrap_or_else(|e| e.into_inner()).clone();

        Some(TaskSnapshot {
            name: name.to_string(),
            completed: task.completed.load(Ordering::Acquire),
            failed: task.failed.load(Ordering::Acquire),
            total: task.total.load(Ordering::Acquire),
            phase,
            slot,
            message,
            elapsed: task.started_at.elapsed(),
        })
    }

    pub fn summary(&self) -> ProgressSummary {
        let phases: Vec<_> = self.tasks().values().map(|t| *t.phase()).collect();

        let mut summary = ProgressSummary {
            total: phases.len(),
            ..Default::default()
        };
        for phase in phases {
            match phase {
                ProgressPhase::MergeComplete | ProgressPhase::Done => summary.completed += 1,
                ProgressPhase::Failed => summary.failed += 1,
                ProgressPhase::Pending => summary.pending += 1,
                p if p.is_running() => summary.in_progress += 1,
                _ => {}
            }
        }
        summary
    }
}
