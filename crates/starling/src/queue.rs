//! Bounded receive queue.

use std::collections::VecDeque;
use std::sync::{Condvar, Mutex};

use starling_core::GcsError;
use starling_types::Action;

struct QueueState {
    queue: VecDeque<Action>,
    limit: usize,
    closed: bool,
}

/// Bounded FIFO of fully assembled actions awaiting `recv`.
///
/// The delivery thread pushes (blocking at the hard limit, which is the
/// local backpressure of last resort behind flow control); application
/// threads pop. `close` empties the queue and turns both ends into
/// immediate returns.
pub(crate) struct RecvQueue {
    state: Mutex<QueueState>,
    not_empty: Condvar,
    not_full: Condvar,
}

impl RecvQueue {
    pub fn new(limit: usize) -> Self {
        RecvQueue {
            state: Mutex::new(QueueState {
                queue: VecDeque::new(),
                limit: limit.max(1),
                closed: false,
            }),
            not_empty: Condvar::new(),
            not_full: Condvar::new(),
        }
    }

    /// Enqueue a delivered action, blocking while the queue is at its hard
    /// limit. Actions offered after close are dropped.
    pub fn push(&self, action: Action) {
        let mut state = self.state.lock().expect("recv queue mutex poisoned");
        while state.queue.len() >= state.limit && !state.closed {
            state = self
                .not_full
                .wait(state)
                .expect("recv queue mutex poisoned");
        }
        if state.closed {
            return;
        }
        state.queue.push_back(action);
        self.not_empty.notify_one();
    }

    /// Dequeue the next action, blocking until one is available or the
    /// queue closes.
    pub fn pop(&self) -> Result<Action, GcsError> {
        let mut state = self.state.lock().expect("recv queue mutex poisoned");
        loop {
            if state.closed {
                return Err(GcsError::NotConnected);
            }
            if let Some(action) = state.queue.pop_front() {
                self.not_full.notify_one();
                return Ok(action);
            }
            state = self
                .not_empty
                .wait(state)
                .expect("recv queue mutex poisoned");
        }
    }

    /// Close and empty the queue; wakes every blocked producer and consumer.
    pub fn close(&self) {
        let mut state = self.state.lock().expect("recv queue mutex poisoned");
        state.closed = true;
        state.queue.clear();
        self.not_empty.notify_all();
        self.not_full.notify_all();
    }

    pub fn len(&self) -> usize {
        self.state.lock().expect("recv queue mutex poisoned").queue.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use starling_types::ActionType;
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    fn action(tag: u8) -> Action {
        Action::new(ActionType::Data, vec![tag], None)
    }

    #[test]
    fn fifo_order() {
        let q = RecvQueue::new(8);
        q.push(action(1));
        q.push(action(2));
        assert_eq!(q.pop().unwrap().buf, vec![1]);
        assert_eq!(q.pop().unwrap().buf, vec![2]);
    }

    #[test]
    fn pop_blocks_until_push() {
        let q = Arc::new(RecvQueue::new(8));
        let popper = {
            let q = Arc::clone(&q);
            thread::spawn(move || q.pop().unwrap().buf)
        };
        thread::sleep(Duration::from_millis(30));
        q.push(action(7));
        assert_eq!(popper.join().unwrap(), vec![7]);
    }

    #[test]
    fn push_blocks_at_limit_until_pop() {
        let q = Arc::new(RecvQueue::new(1));
        q.push(action(1));
        let pusher = {
            let q = Arc::clone(&q);
            thread::spawn(move || q.push(action(2)))
        };
        thread::sleep(Duration::from_millis(30));
        assert_eq!(q.pop().unwrap().buf, vec![1]);
        pusher.join().unwrap();
        assert_eq!(q.pop().unwrap().buf, vec![2]);
    }

    #[test]
    fn close_wakes_and_empties() {
        let q = Arc::new(RecvQueue::new(8));
        q.push(action(1));
        let popper = {
            let q = Arc::clone(&q);
            thread::spawn(move || {
                // First pop drains the queued action, second blocks.
                let first = q.pop();
                let second = q.pop();
                (first, second)
            })
        };
        thread::sleep(Duration::from_millis(30));
        q.close();
        let (first, second) = popper.join().unwrap();
        assert!(first.is_ok());
        assert_eq!(second, Err(GcsError::NotConnected));
        // After close everything returns immediately.
        assert_eq!(q.pop(), Err(GcsError::NotConnected));
        q.push(action(9));
        assert_eq!(q.len(), 0);
    }
}
