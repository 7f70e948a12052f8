//! Per-project admission queues.
//!
//! Each project keeps its own ordered queue of Pending jobs: higher priority
//! first, then submission order (`seq`). Admission walks projects
//! round-robin so one busy project cannot starve another.

use std::cmp::Reverse;
use std::collections::{BTreeMap, HashMap, VecDeque};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;

use crate::domain::Job;

type EntryKey = (Reverse<i32>, i64);

/// A Pending job waiting for a slot.
#[derive(Debug, Clone)]
pub struct QueueEntry {
    pub job: Job,
    pub enqueued_at: DateTime<Utc>,
}

impl QueueEntry {
    pub fn new(job: Job) -> Self {
        Self {
            job,
            enqueued_at: Utc::now(),
        }
    }

    fn key(&self) -> EntryKey {
        (Reverse(self.job.priority), self.job.seq)
    }
}

#[derive(Default)]
struct QueueState {
    projects: HashMap<String, BTreeMap<EntryKey, QueueEntry>>,
    /// Job id -> (project, key).
    index: HashMap<String, (String, EntryKey)>,
    /// Projects with queued jobs, in visiting order.
    rotation: VecDeque<String>,
}

impl QueueState {
    fn drop_project_if_empty(&mut self, project: &str) {
        if self.projects.get(project).is_some_and(BTreeMap::is_empty) {
            self.projects.remove(project);
            self.rotation.retain(|p| p != project);
        }
    }
}

/// Pending jobs grouped by project.
#[derive(Default)]
pub struct QueueManager {
    state: Mutex<QueueState>,
}

impl QueueManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a Pending job. Returns false if it is already queued.
    pub fn push(&self, job: Job) -> bool {
        let mut state = self.state.lock();
        if state.index.contains_key(&job.id) {
            return false;
        }

        let entry = QueueEntry::new(job);
        let key = entry.key();
        let project = entry.job.project.clone();
        state
            .index
            .insert(entry.job.id.clone(), (project.clone(), key));

        let queue = state.projects.entry(project.clone()).or_default();
        let was_empty = queue.is_empty();
        queue.insert(key, entry);
        if was_empty {
            state.rotation.push_back(project);
        }
        true
    }

    /// Remove a queued job, e.g. on cancellation.
    pub fn remove(&self, job_id: &str) -> Option<QueueEntry> {
        let mut state = self.state.lock();
        let (project, key) = state.index.remove(job_id)?;
        let entry = state.projects.get_mut(&project)?.remove(&key);
        state.drop_project_if_empty(&project);
        entry
    }

    /// Pop the next admissible job.
    ///
    /// Projects are visited in rotation order; the first project for which
    /// `has_slot` is true gives up its head entry and moves to the back of
    /// the rotation.
    pub fn pop_next<F>(&self, mut has_slot: F) -> Option<QueueEntry>
    where
        F: FnMut(&str) -> bool,
    {
        let mut state = self.state.lock();
        let position = state.rotation.iter().position(|p| has_slot(p))?;
        let project = state.rotation.remove(position)?;

        let entry = state
            .projects
            .get_mut(&project)
            .and_then(|queue| queue.pop_first())
            .map(|(_, entry)| entry);

        if let Some(entry) = &entry {
            state.index.remove(&entry.job.id);
        }

        if state.projects.get(&project).is_some_and(|q| !q.is_empty()) {
            state.rotation.push_back(project);
        } else {
            state.projects.remove(&project);
        }
        entry
    }

    pub fn contains(&self, job_id: &str) -> bool {
        self.state.lock().index.contains_key(job_id)
    }

    pub fn len(&self) -> usize {
        self.state.lock().index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn len_for(&self, project: &str) -> usize {
        self.state
            .lock()
            .projects
            .get(project)
            .map_or(0, BTreeMap::len)
    }

    /// Queued job ids of one project in admission order.
    pub fn job_ids(&self, project: &str) -> Vec<String> {
        self.state
            .lock()
            .projects
            .get(project)
            .map(|q| q.values().map(|e| e.job.id.clone()).collect())
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::JobState;
    use std::collections::BTreeMap as Args;

    fn job(id: &str, project: &str, seq: i64, priority: i32) -> Job {
        Job {
            id: id.to_string(),
            project: project.to_string(),
            spider: "s".to_string(),
            args: Args::new(),
            priority,
            state: JobState::Pending,
            seq,
            created_at: Utc::now(),
            started_at: None,
            finished_at: None,
            exit_code: None,
            failure_reason: None,
            log_path: None,
            pid: None,
        }
    }

    fn drain(queue: &QueueManager) -> Vec<String> {
        std::iter::from_fn(|| queue.pop_next(|_| true))
            .map(|e| e.job.id)
            .collect()
    }

    #[test]
    fn fifo_within_project() {
        let queue = QueueManager::new();
        for (i, id) in ["a", "b", "c"].iter().enumerate() {
            queue.push(job(id, "p", i as i64, 0));
        }
        assert_eq!(drain(&queue), ["a", "b", "c"]);
        assert!(queue.is_empty());
    }

    #[test]
    fn priority_overrides_fifo() {
        let queue = QueueManager::new();
        queue.push(job("low", "p", 1, 0));
        queue.push(job("high", "p", 2, 5));
        queue.push(job("low2", "p", 3, 0));
        assert_eq!(drain(&queue), ["high", "low", "low2"]);
    }

    #[test]
    fn projects_are_visited_round_robin() {
        let queue = QueueManager::new();
        queue.push(job("a1", "a", 1, 0));
        queue.push(job("a2", "a", 2, 0));
        queue.push(job("a3", "a", 3, 0));
        queue.push(job("b1", "b", 4, 0));
        queue.push(job("c1", "c", 5, 0));
        assert_eq!(drain(&queue), ["a1", "b1", "c1", "a2", "a3"]);
    }

    #[test]
    fn projects_without_slots_are_skipped() {
        let queue = QueueManager::new();
        queue.push(job("a1", "a", 1, 0));
        queue.push(job("b1", "b", 2, 0));

        let popped = queue.pop_next(|p| p != "a").unwrap();
        assert_eq!(popped.job.id, "b1");
        assert!(queue.pop_next(|p| p != "a").is_none());
        assert_eq!(queue.len_for("a"), 1);
    }

    #[test]
    fn remove_and_duplicates() {
        let queue = QueueManager::new();
        assert!(queue.push(job("a", "p", 1, 0)));
        assert!(!queue.push(job("a", "p", 1, 0)));
        queue.push(job("b", "p", 2, 0));

        assert_eq!(queue.remove("a").unwrap().job.id, "a");
        assert!(queue.remove("a").is_none());
        assert!(!queue.contains("a"));
        assert_eq!(queue.job_ids("p"), ["b"]);

        queue.remove("b");
        assert!(queue.is_empty());
        assert!(queue.pop_next(|_| true).is_none());
    }
}
