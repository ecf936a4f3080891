//! In-memory task database with a per-tag ready index.
//!
//! The database owns every task record and is the only place state
//! transitions happen. It is written for single-owner access: the server
//! serializes all calls, so there is no locking in here.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use chrono::Utc;
use rand::Rng;

use crate::task::{Task, TaskCreateInfo, TaskId, TaskState, TaskStats};

/// Collision budget for random ID allocation. Hitting the warn threshold
/// means the ID space is implausibly full (or the RNG is broken).
const ID_COLLISION_WARN_THRESHOLD: u32 = 10;
const ID_COLLISION_FAIL_THRESHOLD: u32 = 1000;

/// Error type for database operations.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DbError {
    #[error("task not found: {0}")]
    TaskNotFound(TaskId),
    #[error("task {0} is still pending and cannot be canceled")]
    TaskNotStarted(TaskId),
    #[error("failed to allocate an unused task ID after {ID_COLLISION_FAIL_THRESHOLD} attempts")]
    IdSpaceExhausted,
}

/// The in-memory task database.
///
/// `ready_by_tag` holds pending tasks bucketed under each of their
/// required tags; `ready_no_requirements` holds pending tasks with no
/// required tags at all. A task is in the index iff it is pending.
#[derive(Debug, Default)]
pub struct TaskDatabase {
    all_tasks: BTreeMap<TaskId, Task>,
    ready_by_tag: HashMap<String, BTreeSet<TaskId>>,
    ready_no_requirements: BTreeSet<TaskId>,
    stats: TaskStats,
}

impl TaskDatabase {
    pub fn new() -> TaskDatabase {
        TaskDatabase::default()
    }

    /// Snapshot of a task, or `None` if it does not exist (anymore).
    pub fn get_task(&self, id: TaskId) -> Option<Task> {
        self.all_tasks.get(&id).cloned()
    }

    /// Snapshot of every task currently in one of the given states, in
    /// ascending ID order. Linear scan; callers bound it via
    /// [`TaskDatabase::total_task_count`].
    pub fn get_tasks_by_states(&self, states: &[TaskState]) -> Vec<Task> {
        self.all_tasks
            .values()
            .filter(|task| states.contains(&task.state()))
            .cloned()
            .collect()
    }

    pub fn total_task_count(&self) -> usize {
        self.all_tasks.len()
    }

    pub fn stats(&self) -> TaskStats {
        self.stats
    }

    /// Enqueue a new task and return its snapshot.
    pub fn create_task(&mut self, info: TaskCreateInfo) -> Result<Task, DbError> {
        let id = self.unused_task_id()?;
        let task = Task::new(id, info);

        if task.schedule.required_resources.is_empty() {
            self.ready_no_requirements.insert(id);
        } else {
            for tag in &task.schedule.required_resources {
                self.ready_by_tag.entry(tag.clone()).or_default().insert(id);
            }
        }

        let snapshot = task.clone();
        self.all_tasks.insert(id, task);
        self.stats.num_pending += 1;

        self.assert_counters();
        Ok(snapshot)
    }

    /// Claim a pending task matching the worker's resource tags.
    ///
    /// Buckets are tried starting at a random offset so that assignment
    /// has no bias toward tag-alphabetical order. A bucket entry is only
    /// eligible when the worker covers the task's *entire* requirement
    /// set: the index is a necessary condition, not a sufficient one, for
    /// tasks with more than one required tag. Tasks without requirements
    /// match any worker and are consulted last.
    pub fn take_task_to_run(&mut self, worker_tags: &[String]) -> Option<Task> {
        let found = if worker_tags.is_empty() {
            self.ready_no_requirements.iter().next().copied()
        } else {
            self.find_eligible_in_buckets(worker_tags)
                .or_else(|| self.ready_no_requirements.iter().next().copied())
        };

        let id = found?;
        let task = self
            .all_tasks
            .get_mut(&id)
            .expect("ready index entry without a task record");

        for tag in &task.schedule.required_resources {
            if let Some(bucket) = self.ready_by_tag.get_mut(tag) {
                bucket.remove(&id);
                if bucket.is_empty() {
                    self.ready_by_tag.remove(tag);
                }
            }
        }
        self.ready_no_requirements.remove(&id);

        task.mark_started();
        self.stats.num_pending -= 1;
        self.stats.num_running += 1;

        let snapshot = task.clone();
        self.assert_counters();
        Some(snapshot)
    }

    /// Record a worker's proof-of-life and report whether the task was
    /// meanwhile marked for cancellation. Heartbeats for a still-pending
    /// task are ignored.
    pub fn heartbeat_task(&mut self, id: TaskId) -> Result<bool, DbError> {
        let task = self.all_tasks.get_mut(&id).ok_or(DbError::TaskNotFound(id))?;
        task.heartbeat();
        Ok(task.state() == TaskState::Canceling)
    }

    /// Transition a running task to canceling. The owning worker learns
    /// via its next heartbeat reply. Canceling a pending task is refused
    /// and leaves it untouched; re-canceling a canceling task is a no-op.
    pub fn mark_task_should_cancel(&mut self, id: TaskId) -> Result<(), DbError> {
        let task = self.all_tasks.get_mut(&id).ok_or(DbError::TaskNotFound(id))?;
        match task.state() {
            TaskState::Pending => Err(DbError::TaskNotStarted(id)),
            TaskState::Canceling => Ok(()),
            TaskState::Running => {
                task.mark_should_cancel();
                self.stats.num_running -= 1;
                self.stats.num_canceling += 1;
                self.assert_counters();
                Ok(())
            }
        }
    }

    /// Terminal transition: remove the task and account for it.
    pub fn mark_task_finished(&mut self, id: TaskId) -> Result<(), DbError> {
        let task = self.all_tasks.remove(&id).ok_or(DbError::TaskNotFound(id))?;

        match task.state() {
            TaskState::Pending => {
                self.stats.num_pending -= 1;
                for tag in &task.schedule.required_resources {
                    if let Some(bucket) = self.ready_by_tag.get_mut(tag) {
                        bucket.remove(&id);
                        if bucket.is_empty() {
                            self.ready_by_tag.remove(tag);
                        }
                    }
                }
                self.ready_no_requirements.remove(&id);
            }
            TaskState::Running => self.stats.num_running -= 1,
            TaskState::Canceling => self.stats.num_canceling -= 1,
        }
        self.stats.num_finished += 1;

        self.assert_counters();
        Ok(())
    }

    /// Finish every running/canceling task whose worker has missed the
    /// heartbeat timeout. Returns how many tasks were reaped.
    pub fn cleanup_zombie_tasks(&mut self, timeout_seconds: i64) -> usize {
        let now = Utc::now().timestamp();
        let zombies: Vec<TaskId> = self
            .all_tasks
            .values()
            .filter(|task| match task.status.run_status {
                Some(run) => now - run.heartbeat_time >= timeout_seconds,
                None => false,
            })
            .map(|task| task.id)
            .collect();

        for id in &zombies {
            tracing::warn!(task = %id, "reaping zombie task: worker missed heartbeat timeout");
            let _ = self.mark_task_finished(*id);
        }
        zombies.len()
    }

    fn find_eligible_in_buckets(&self, worker_tags: &[String]) -> Option<TaskId> {
        let offset = rand::thread_rng().gen_range(0..worker_tags.len());
        for i in 0..worker_tags.len() {
            let tag = &worker_tags[(i + offset) % worker_tags.len()];
            let Some(bucket) = self.ready_by_tag.get(tag) else {
                continue;
            };
            for id in bucket {
                let task = &self.all_tasks[id];
                let eligible = task
                    .schedule
                    .required_resources
                    .iter()
                    .all(|required| worker_tags.iter().any(|have| have == required));
                if eligible {
                    return Some(*id);
                }
            }
        }
        None
    }

    fn unused_task_id(&self) -> Result<TaskId, DbError> {
        let mut rng = rand::thread_rng();
        for attempt in 0..ID_COLLISION_FAIL_THRESHOLD {
            let id = TaskId(rng.gen::<u64>());
            if !self.all_tasks.contains_key(&id) {
                return Ok(id);
            }
            if attempt + 1 >= ID_COLLISION_WARN_THRESHOLD {
                tracing::warn!(
                    attempts = attempt + 1,
                    "task ID allocation is taking unusually long to find a free slot"
                );
            }
        }
        Err(DbError::IdSpaceExhausted)
    }

    /// Counter identity, checked after every mutation in debug builds.
    fn assert_counters(&self) {
        debug_assert!(self.stats.num_pending >= 0);
        debug_assert!(self.stats.num_running >= 0);
        debug_assert!(self.stats.num_canceling >= 0);
        debug_assert_eq!(
            (self.stats.num_pending + self.stats.num_running + self.stats.num_canceling) as usize,
            self.all_tasks.len()
        );
    }

    /// Rewind a task's heartbeat so zombie reaping can be exercised
    /// without waiting out the real timeout.
    #[cfg(test)]
    pub(crate) fn backdate_heartbeat(&mut self, id: TaskId, seconds: i64) {
        if let Some(run) = self
            .all_tasks
            .get_mut(&id)
            .and_then(|task| task.status.run_status.as_mut())
        {
            run.heartbeat_time -= seconds;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::TaskSchedule;

    fn tags(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    fn info(command: &str, required: &[&str]) -> TaskCreateInfo {
        TaskCreateInfo {
            command: command.to_string(),
            schedule: TaskSchedule {
                required_resources: tags(required),
                optional_resources: Vec::new(),
            },
        }
    }

    fn assert_stats(db: &TaskDatabase, pending: i32, running: i32, canceling: i32, finished: i32) {
        let stats = db.stats();
        assert_eq!(stats.num_pending, pending, "num_pending");
        assert_eq!(stats.num_running, running, "num_running");
        assert_eq!(stats.num_canceling, canceling, "num_canceling");
        assert_eq!(stats.num_finished, finished, "num_finished");
    }

    #[test]
    fn create_and_get() {
        let mut db = TaskDatabase::new();
        let task = db.create_task(info("echo hi", &["cuda"])).unwrap();

        let fetched = db.get_task(task.id).unwrap();
        assert_eq!(fetched.command, "echo hi");
        assert_eq!(fetched.state(), TaskState::Pending);
        assert_stats(&db, 1, 0, 0, 0);
    }

    #[test]
    fn created_ids_are_distinct() {
        let mut db = TaskDatabase::new();
        let a = db.create_task(info("a", &[])).unwrap();
        let b = db.create_task(info("b", &[])).unwrap();
        assert_ne!(a.id, b.id);
        assert_eq!(db.total_task_count(), 2);
    }

    #[test]
    fn take_matches_required_tag() {
        let mut db = TaskDatabase::new();
        let created = db.create_task(info("echo hi", &["cuda"])).unwrap();

        let taken = db.take_task_to_run(&tags(&["cuda", "amd64"])).unwrap();
        assert_eq!(taken.id, created.id);
        assert_eq!(taken.state(), TaskState::Running);
        assert_stats(&db, 0, 1, 0, 0);
    }

    #[test]
    fn take_rejects_tag_mismatch() {
        let mut db = TaskDatabase::new();
        db.create_task(info("echo hi", &["gpu"])).unwrap();

        assert!(db.take_task_to_run(&tags(&["cpu"])).is_none());
        assert_stats(&db, 1, 0, 0, 0);
    }

    #[test]
    fn take_requires_every_tag_not_just_the_bucket_tag() {
        let mut db = TaskDatabase::new();
        // In the "gpu" bucket, but also needs "big-mem".
        db.create_task(info("train", &["gpu", "big-mem"])).unwrap();

        // Worker hits the "gpu" bucket, yet must not receive the task.
        assert!(db.take_task_to_run(&tags(&["gpu"])).is_none());
        assert_stats(&db, 1, 0, 0, 0);

        let taken = db.take_task_to_run(&tags(&["gpu", "big-mem"]));
        assert!(taken.is_some());
    }

    #[test]
    fn partial_match_does_not_block_eligible_task_in_same_bucket() {
        let mut db = TaskDatabase::new();
        db.create_task(info("needs both", &["gpu", "big-mem"])).unwrap();
        let simple = db.create_task(info("needs one", &["gpu"])).unwrap();

        // Whichever bucket entry is scanned first, the ineligible task
        // must be skipped rather than ending the search.
        let taken = db.take_task_to_run(&tags(&["gpu"])).unwrap();
        assert_eq!(taken.id, simple.id);
    }

    #[test]
    fn untagged_worker_only_gets_unconstrained_tasks() {
        let mut db = TaskDatabase::new();
        db.create_task(info("needs gpu", &["gpu"])).unwrap();
        let free = db.create_task(info("anything", &[])).unwrap();

        let taken = db.take_task_to_run(&[]).unwrap();
        assert_eq!(taken.id, free.id);
        assert!(db.take_task_to_run(&[]).is_none());
    }

    #[test]
    fn tagged_worker_also_gets_unconstrained_tasks() {
        let mut db = TaskDatabase::new();
        let free = db.create_task(info("anything", &[])).unwrap();

        let taken = db.take_task_to_run(&tags(&["cuda"])).unwrap();
        assert_eq!(taken.id, free.id);
    }

    #[test]
    fn take_exercises_every_bucket_over_repeated_calls() {
        // With the randomized starting offset, neither "apple" nor
        // "zebra" may be starved just because of alphabetical order.
        let mut seen_first = std::collections::HashSet::new();
        for _ in 0..200 {
            let mut db = TaskDatabase::new();
            let a = db.create_task(info("a", &["apple"])).unwrap();
            let z = db.create_task(info("z", &["zebra"])).unwrap();

            let first = db.take_task_to_run(&tags(&["apple", "zebra"])).unwrap();
            seen_first.insert(first.id == a.id);
            let _ = z;
            if seen_first.len() == 2 {
                break;
            }
        }
        assert_eq!(seen_first.len(), 2, "one bucket was never tried first");
    }

    #[test]
    fn heartbeat_reports_cancellation() {
        let mut db = TaskDatabase::new();
        let task = db.create_task(info("sleep 100", &["cpu"])).unwrap();
        db.take_task_to_run(&tags(&["cpu"])).unwrap();

        assert_eq!(db.heartbeat_task(task.id), Ok(false));
        db.mark_task_should_cancel(task.id).unwrap();
        assert_eq!(db.heartbeat_task(task.id), Ok(true));
    }

    #[test]
    fn heartbeat_of_pending_task_is_ignored() {
        let mut db = TaskDatabase::new();
        let task = db.create_task(info("echo", &[])).unwrap();

        assert_eq!(db.heartbeat_task(task.id), Ok(false));
        assert_eq!(db.get_task(task.id).unwrap().state(), TaskState::Pending);
    }

    #[test]
    fn heartbeat_of_unknown_task_fails() {
        let mut db = TaskDatabase::new();
        assert_eq!(
            db.heartbeat_task(TaskId(42)),
            Err(DbError::TaskNotFound(TaskId(42)))
        );
    }

    #[test]
    fn cancel_moves_running_to_canceling() {
        let mut db = TaskDatabase::new();
        let task = db.create_task(info("sleep 100", &["cpu"])).unwrap();
        db.take_task_to_run(&tags(&["cpu"])).unwrap();

        db.mark_task_should_cancel(task.id).unwrap();
        assert_eq!(db.get_task(task.id).unwrap().state(), TaskState::Canceling);
        assert_stats(&db, 0, 0, 1, 0);
    }

    #[test]
    fn cancel_of_pending_task_is_refused() {
        let mut db = TaskDatabase::new();
        let task = db.create_task(info("echo", &["cpu"])).unwrap();

        assert_eq!(
            db.mark_task_should_cancel(task.id),
            Err(DbError::TaskNotStarted(task.id))
        );
        assert_eq!(db.get_task(task.id).unwrap().state(), TaskState::Pending);
        assert_stats(&db, 1, 0, 0, 0);
    }

    #[test]
    fn double_cancel_is_idempotent() {
        let mut db = TaskDatabase::new();
        let task = db.create_task(info("sleep 100", &["cpu"])).unwrap();
        db.take_task_to_run(&tags(&["cpu"])).unwrap();

        db.mark_task_should_cancel(task.id).unwrap();
        db.mark_task_should_cancel(task.id).unwrap();
        assert_stats(&db, 0, 0, 1, 0);
    }

    #[test]
    fn finish_running_task() {
        let mut db = TaskDatabase::new();
        let task = db.create_task(info("echo", &["cpu"])).unwrap();
        db.take_task_to_run(&tags(&["cpu"])).unwrap();

        db.mark_task_finished(task.id).unwrap();
        assert!(db.get_task(task.id).is_none());
        assert_stats(&db, 0, 0, 0, 1);
    }

    #[test]
    fn finish_canceling_task() {
        let mut db = TaskDatabase::new();
        let task = db.create_task(info("echo", &["cpu"])).unwrap();
        db.take_task_to_run(&tags(&["cpu"])).unwrap();
        db.mark_task_should_cancel(task.id).unwrap();

        db.mark_task_finished(task.id).unwrap();
        assert_stats(&db, 0, 0, 0, 1);
    }

    #[test]
    fn finish_pending_task_clears_ready_index() {
        let mut db = TaskDatabase::new();
        let task = db.create_task(info("echo", &["cpu"])).unwrap();

        db.mark_task_finished(task.id).unwrap();
        assert_stats(&db, 0, 0, 0, 1);
        // The index must not resurrect the task for a matching worker.
        assert!(db.take_task_to_run(&tags(&["cpu"])).is_none());
    }

    #[test]
    fn double_finish_fails_and_leaves_counters_alone() {
        let mut db = TaskDatabase::new();
        let task = db.create_task(info("echo", &["cpu"])).unwrap();
        db.take_task_to_run(&tags(&["cpu"])).unwrap();

        db.mark_task_finished(task.id).unwrap();
        assert_eq!(
            db.mark_task_finished(task.id),
            Err(DbError::TaskNotFound(task.id))
        );
        assert_stats(&db, 0, 0, 0, 1);
    }

    #[test]
    fn claimed_task_leaves_every_bucket() {
        let mut db = TaskDatabase::new();
        db.create_task(info("multi", &["a", "b"])).unwrap();

        db.take_task_to_run(&tags(&["a", "b"])).unwrap();
        // Neither bucket may still offer the task.
        assert!(db.take_task_to_run(&tags(&["a", "b"])).is_none());
    }

    #[test]
    fn get_tasks_by_states_filters() {
        let mut db = TaskDatabase::new();
        db.create_task(info("p", &["x"])).unwrap();
        let running = db.create_task(info("r", &["cpu"])).unwrap();
        db.take_task_to_run(&tags(&["cpu"])).unwrap();

        let pending = db.get_tasks_by_states(&[TaskState::Pending]);
        assert_eq!(pending.len(), 1);

        let active = db.get_tasks_by_states(&[TaskState::Running, TaskState::Canceling]);
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].id, running.id);

        let all = db.get_tasks_by_states(&TaskState::all());
        assert_eq!(all.len(), 2);
    }

    #[test]
    fn zombie_reaping_finishes_stale_tasks() {
        let mut db = TaskDatabase::new();
        let stale = db.create_task(info("stale", &["cpu"])).unwrap();
        db.take_task_to_run(&tags(&["cpu"])).unwrap();
        let fresh = db.create_task(info("fresh", &["cpu"])).unwrap();
        db.take_task_to_run(&tags(&["cpu"])).unwrap();

        db.backdate_heartbeat(stale.id, 301);
        let reaped = db.cleanup_zombie_tasks(300);

        assert_eq!(reaped, 1);
        assert!(db.get_task(stale.id).is_none());
        assert!(db.get_task(fresh.id).is_some());
        assert_stats(&db, 0, 1, 0, 1);
    }

    #[test]
    fn zombie_reaping_spares_pending_tasks() {
        let mut db = TaskDatabase::new();
        db.create_task(info("pending forever", &["cpu"])).unwrap();

        assert_eq!(db.cleanup_zombie_tasks(0), 0);
        assert_stats(&db, 1, 0, 0, 0);
    }

    #[test]
    fn zombie_reaping_covers_canceling_tasks() {
        let mut db = TaskDatabase::new();
        let task = db.create_task(info("wedged", &["cpu"])).unwrap();
        db.take_task_to_run(&tags(&["cpu"])).unwrap();
        db.mark_task_should_cancel(task.id).unwrap();

        db.backdate_heartbeat(task.id, 301);
        assert_eq!(db.cleanup_zombie_tasks(300), 1);
        assert_stats(&db, 0, 0, 0, 1);
    }

    #[test]
    fn counters_partition_live_tasks_through_a_full_lifecycle() {
        let mut db = TaskDatabase::new();
        let a = db.create_task(info("a", &["cpu"])).unwrap();
        let b = db.create_task(info("b", &["cpu"])).unwrap();
        db.create_task(info("c", &["gpu"])).unwrap();

        db.take_task_to_run(&tags(&["cpu"])).unwrap();
        db.take_task_to_run(&tags(&["cpu"])).unwrap();
        db.mark_task_should_cancel(a.id).unwrap();
        assert_stats(&db, 1, 1, 1, 0);

        db.mark_task_finished(a.id).unwrap();
        db.mark_task_finished(b.id).unwrap();
        assert_stats(&db, 1, 0, 0, 2);
        assert_eq!(db.total_task_count(), 1);
    }
}
