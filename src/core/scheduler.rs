use crate::core::model::{ItemId, QueueEntry, ResumePackage};
use std::collections::{HashSet, VecDeque};

/// What the scheduler decided for the head of the queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Admission {
    Start(ResumePackage),
    /// The popped item is already running; nudge it with Resume instead.
    AlreadyActive(ItemId),
    Idle,
}

/// Admission state: the ordered queue plus the set of running item ids.
/// Running transfers are never preempted; the cap only gates new starts.
#[derive(Debug)]
pub struct Scheduler {
    queue: VecDeque<ResumePackage>,
    active: HashSet<ItemId>,
    max_concurrent: usize,
}

impl Scheduler {
    pub fn new(max_concurrent: usize) -> Self {
        Self { queue: VecDeque::new(), active: HashSet::new(), max_concurrent: max_concurrent.max(1) }
    }

    pub fn push(&mut self, pkg: ResumePackage) {
        self.queue.push_back(pkg);
    }

    pub fn admit(&mut self) -> Admission {
        if self.active.len() >= self.max_concurrent {
            return Admission::Idle;
        }
        let Some(pkg) = self.queue.pop_front() else {
            return Admission::Idle;
        };
        let id = pkg.id();
        if self.active.contains(&id) {
            return Admission::AlreadyActive(id);
        }
        self.active.insert(id);
        Admission::Start(pkg)
    }

    pub fn finish(&mut self, id: ItemId) {
        self.active.remove(&id);
    }

    /// Drops every queued entry for `id`; true if any was removed.
    pub fn remove_queued(&mut self, id: ItemId) -> bool {
        let before = self.queue.len();
        self.queue.retain(|p| p.id() != id);
        before != self.queue.len()
    }

    pub fn is_queued(&self, id: ItemId) -> bool {
        self.queue.iter().any(|p| p.id() == id)
    }

    pub fn is_active(&self, id: ItemId) -> bool {
        self.active.contains(&id)
    }

    pub fn is_idle(&self) -> bool {
        self.active.is_empty() && self.queue.is_empty()
    }

    pub fn snapshot(&self) -> Vec<QueueEntry> {
        self.queue
            .iter()
            .enumerate()
            .map(|(index, pkg)| QueueEntry { index, pkg: pkg.clone() })
            .collect()
    }
}
