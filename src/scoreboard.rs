//! Driver-side completion scoreboard
//!
//! Context tasks post their outcomes here from runtime threads; the driver
//! thread waits on it with a deadline at flush and finish.

use crate::context::RewriteOutcome;
use parking_lot::{Condvar, Mutex};
use std::collections::{HashMap, HashSet};
use std::time::Instant;
use tracing::debug;

#[derive(Default)]
struct Board {
    completed: HashMap<u64, RewriteOutcome>,
    abandoned: HashSet<u64>,
}

#[derive(Default)]
pub struct Scoreboard {
    board: Mutex<Board>,
    changed: Condvar,
}

impl Scoreboard {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the outcome of context `id`
    ///
    /// Outcomes for contexts the driver already gave up on are dropped.
    pub fn post(&self, id: u64, outcome: RewriteOutcome) {
        let mut board = self.board.lock();
        if board.abandoned.remove(&id) {
            debug!("Dropping late result for context {}: {:?}", id, outcome);
            return;
        }
        board.completed.insert(id, outcome);
        self.changed.notify_all();
    }

    /// Wait until every id in `ids` has completed or `deadline` passes
    ///
    /// Returns whether all completed.
    pub fn wait_for(&self, ids: &[u64], deadline: Instant) -> bool {
        let mut board = self.board.lock();
        loop {
            if ids.iter().all(|id| board.completed.contains_key(id)) {
                return true;
            }
            if self.changed.wait_until(&mut board, deadline).timed_out() {
                return ids.iter().all(|id| board.completed.contains_key(id));
            }
        }
    }

    pub fn take(&self, id: u64) -> Option<RewriteOutcome> {
        self.board.lock().completed.remove(&id)
    }

    /// Give up on `id`; a later post for it is discarded
    pub fn abandon(&self, id: u64) {
        let mut board = self.board.lock();
        if board.completed.remove(&id).is_none() {
            board.abandoned.insert(id);
        }
    }

    pub fn completed(&self) -> usize {
        self.board.lock().completed.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    #[test]
    fn test_wait_times_out_without_posts() {
        let board = Scoreboard::new();
        let start = Instant::now();
        assert!(!board.wait_for(&[1], start + Duration::from_millis(20)));
        assert!(start.elapsed() >= Duration::from_millis(20));
    }

    #[test]
    fn test_post_from_other_thread_wakes_waiter() {
        let board = Arc::new(Scoreboard::new());
        let poster = board.clone();
        let handle = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(10));
            poster.post(1, RewriteOutcome::Declined);
            poster.post(2, RewriteOutcome::Failed);
        });
        assert!(board.wait_for(&[1, 2], Instant::now() + Duration::from_secs(5)));
        handle.join().unwrap();
        assert_eq!(board.take(1), Some(RewriteOutcome::Declined));
        assert_eq!(board.take(1), None);
    }

    #[test]
    fn test_late_post_after_abandon_is_dropped() {
        let board = Scoreboard::new();
        board.abandon(7);
        board.post(7, RewriteOutcome::Declined);
        assert_eq!(board.completed(), 0);
        assert!(board.wait_for(&[], Instant::now()));
    }
}
