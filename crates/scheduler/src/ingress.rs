//! Submission queue between caller threads and the scheduler loop.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::time::Duration;

use crate::command::{Command, CommandState};
use crate::error::SchedError;

/// Condition variable the scheduler loop sleeps on.
///
/// Wakers take the mutex before notifying, and the sleeper evaluates its
/// predicate under the same mutex, so a wake-up between "check" and "sleep"
/// cannot be lost.
#[derive(Debug, Default)]
pub struct Wakeup {
    lock: Mutex<()>,
    cond: Condvar,
}

impl Wakeup {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn notify(&self) {
        let _guard = self.lock.lock().unwrap_or_else(PoisonError::into_inner);
        self.cond.notify_all();
    }

    /// Sleep while `idle()` returns true, up to `timeout` if given.
    pub fn wait_while(&self, timeout: Option<Duration>, mut idle: impl FnMut() -> bool) {
        let guard = self.lock.lock().unwrap_or_else(PoisonError::into_inner);
        match timeout {
            None => {
                drop(self.cond.wait_while(guard, |_| idle()));
            }
            Some(timeout) => {
                drop(self.cond.wait_timeout_while(guard, timeout, |_| idle()));
            }
        }
    }
}

/// Commands submitted but not yet seen by the scheduler loop.
#[derive(Debug)]
pub struct IngressQueue {
    pending: Mutex<Pending>,
    num_pending: AtomicUsize,
    wakeup: Arc<Wakeup>,
}

#[derive(Debug, Default)]
struct Pending {
    queue: VecDeque<Box<Command>>,
    closed: bool,
}

impl IngressQueue {
    pub fn new(wakeup: Arc<Wakeup>) -> Self {
        Self {
            pending: Mutex::new(Pending::default()),
            num_pending: AtomicUsize::new(0),
            wakeup,
        }
    }

    /// Append a command and wake the loop. A closed queue hands the command
    /// back so the caller can release its buffer.
    pub fn submit(&self, cmd: Box<Command>) -> Result<(), (SchedError, Box<Command>)> {
        {
            let mut pending = self.pending.lock().unwrap_or_else(PoisonError::into_inner);
            if pending.closed {
                return Err((SchedError::ShuttingDown, cmd));
            }
            pending.queue.push_back(cmd);
            self.num_pending.fetch_add(1, Ordering::AcqRel);
        }
        self.wakeup.notify();
        Ok(())
    }

    /// Move every pending command to `dst` in submission order, marking each
    /// QUEUED. Returns how many moved.
    pub fn drain_into(&self, dst: &mut VecDeque<Box<Command>>) -> usize {
        let mut pending = self.pending.lock().unwrap_or_else(PoisonError::into_inner);
        let moved = pending.queue.len();
        for mut cmd in pending.queue.drain(..) {
            cmd.set_state(CommandState::Queued);
            dst.push_back(cmd);
        }
        self.num_pending.fetch_sub(moved, Ordering::AcqRel);
        moved
    }

    /// Close the queue and hand back everything still pending, untouched.
    pub fn take_all(&self) -> Vec<Box<Command>> {
        let mut pending = self.pending.lock().unwrap_or_else(PoisonError::into_inner);
        pending.closed = true;
        let taken: Vec<_> = pending.queue.drain(..).collect();
        self.num_pending.fetch_sub(taken.len(), Ordering::AcqRel);
        taken
    }

    pub fn pending(&self) -> usize {
        self.num_pending.load(Ordering::Acquire)
    }

    /// Reject all further submissions.
    pub fn close(&self) {
        let mut pending = self.pending.lock().unwrap_or_else(PoisonError::into_inner);
        pending.closed = true;
    }

    pub fn is_closed(&self) -> bool {
        self.pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .closed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::CommandPool;
    use std::thread;

    fn queue() -> IngressQueue {
        IngressQueue::new(Arc::new(Wakeup::new()))
    }

    #[test]
    fn test_drain_preserves_order_and_marks_queued() {
        let pool = CommandPool::new(8);
        let ingress = queue();
        for _ in 0..3 {
            ingress.submit(pool.acquire().unwrap()).unwrap();
        }
        assert_eq!(ingress.pending(), 3);

        let mut dst = VecDeque::new();
        assert_eq!(ingress.drain_into(&mut dst), 3);
        assert_eq!(ingress.pending(), 0);
        let order: Vec<u32> = dst.iter().map(|c| c.index()).collect();
        assert_eq!(order, vec![0, 1, 2]);
        assert!(dst.iter().all(|c| c.state() == CommandState::Queued));
    }

    #[test]
    fn test_closed_queue_returns_command() {
        let pool = CommandPool::new(2);
        let ingress = queue();
        ingress.close();
        let (err, cmd) = ingress.submit(pool.acquire().unwrap()).unwrap_err();
        assert!(matches!(err, SchedError::ShuttingDown));
        assert_eq!(cmd.index(), 0);
        assert_eq!(ingress.pending(), 0);
    }

    #[test]
    fn test_take_all_closes_and_empties() {
        let pool = CommandPool::new(4);
        let ingress = queue();
        ingress.submit(pool.acquire().unwrap()).unwrap();
        ingress.submit(pool.acquire().unwrap()).unwrap();

        let taken = ingress.take_all();
        assert_eq!(taken.len(), 2);
        assert_eq!(taken[0].state(), CommandState::New);
        assert_eq!(ingress.pending(), 0);
        assert!(ingress.is_closed());
        assert!(ingress.submit(pool.acquire().unwrap()).is_err());
    }

    #[test]
    fn test_concurrent_submitters_lose_nothing() {
        let pool = Arc::new(CommandPool::new(1024));
        let ingress = Arc::new(queue());
        let workers: Vec<_> = (0..4)
            .map(|_| {
                let pool = Arc::clone(&pool);
                let ingress = Arc::clone(&ingress);
                thread::spawn(move || {
                    for _ in 0..100 {
                        ingress.submit(pool.acquire().unwrap()).unwrap();
                    }
                })
            })
            .collect();
        for w in workers {
            w.join().unwrap();
        }
        let mut dst = VecDeque::new();
        assert_eq!(ingress.drain_into(&mut dst), 400);
    }

    #[test]
    fn test_wakeup_returns_when_predicate_clears() {
        let wakeup = Arc::new(Wakeup::new());
        let flag = Arc::new(AtomicUsize::new(0));
        let waker = {
            let wakeup = Arc::clone(&wakeup);
            let flag = Arc::clone(&flag);
            thread::spawn(move || {
                flag.store(1, Ordering::SeqCst);
                wakeup.notify();
            })
        };
        wakeup.wait_while(Some(Duration::from_secs(5)), || flag.load(Ordering::SeqCst) == 0);
        waker.join().unwrap();
        assert_eq!(flag.load(Ordering::SeqCst), 1);
    }
}
