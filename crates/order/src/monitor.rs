//! The total-order monitor implementation.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Condvar, Mutex, MutexGuard};

use starling_types::Seqno;
use thiserror::Error;

/// Errors reported by the [`Monitor`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum OrderError {
    /// The seqno is already past, or the operation does not apply to the
    /// slot's current state.
    #[error("seqno out of range")]
    OutOfRange,
    /// The waiter table is full; retry after some release.
    #[error("waiter table overflow, try again later")]
    Overflow,
    /// The waiter was cancelled; the seqno is skipped and predecessors
    /// advance over it.
    #[error("waiter cancelled, seqno skipped")]
    Canceled,
    /// The wait was interrupted; the seqno stays live and must be re-grabbed
    /// or self-cancelled.
    #[error("wait interrupted, seqno still pending")]
    Interrupted,
    /// Protocol violation: releasing out of order, grabbing a seqno another
    /// thread already occupies, or self-cancelling an active slot.
    #[error("total-order monitor misuse")]
    Misuse,
}

/// Scoped acquisition token returned by [`Monitor::grab`].
///
/// Holding a ticket for seqno `s` means the critical section for `s` is
/// open: every smaller seqno was released or skipped, and every larger one
/// is still blocked. The ticket must be handed back through
/// [`Monitor::release`]; a dropped ticket leaves the order stalled.
#[derive(Debug, PartialEq, Eq)]
#[must_use = "a grabbed seqno must be released or the order stalls"]
pub struct Ticket {
    seqno: Seqno,
}

impl Ticket {
    /// The seqno this ticket holds.
    pub fn seqno(&self) -> Seqno {
        self.seqno
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SlotState {
    Free,
    Waiting,
    Interrupted,
    Canceled,
    Holding,
}

#[derive(Debug, Clone, Copy)]
struct Slot {
    seqno: i64,
    state: SlotState,
}

impl Slot {
    const FREE: Slot = Slot {
        seqno: Seqno::ILL.0,
        state: SlotState::Free,
    };
}

struct Ring {
    /// Highest seqno that was released or skipped. The next holder is
    /// `last_released + 1`.
    last_released: i64,
    slots: Box<[Slot]>,
}

/// Seqno-keyed entry barrier with a bounded circular waiter table.
///
/// One mutex guards `last_released` and every slot transition; each slot has
/// its own condvar so wakeups are narrow. Seqno `s` lives in slot
/// `s mod window_len`; admission refuses seqnos `window_len` or more ahead
/// of the last released one, which keeps live seqnos on distinct slots.
pub struct Monitor {
    ring: Mutex<Ring>,
    conds: Box<[Condvar]>,
    /// Relaxed mirror of `last_released` for the lock-free [`Monitor::seqno`]
    /// snapshot.
    released: AtomicI64,
}

impl Monitor {
    /// Create a monitor accepting `start_seqno` as the first grabbable seqno.
    ///
    /// `window_len` bounds the number of in-flight seqnos; it should be no
    /// less than the maximum number of threads competing for the resource
    /// (1024 is plenty for most applications).
    ///
    /// # Panics
    ///
    /// Panics if `window_len` is zero or `start_seqno` is negative.
    pub fn new(window_len: usize, start_seqno: Seqno) -> Self {
        assert!(window_len > 0, "window_len must be positive");
        assert!(start_seqno.0 >= 0, "start_seqno must be non-negative");
        let last_released = start_seqno.0 - 1;
        Monitor {
            ring: Mutex::new(Ring {
                last_released,
                slots: vec![Slot::FREE; window_len].into_boxed_slice(),
            }),
            conds: (0..window_len).map(|_| Condvar::new()).collect(),
            released: AtomicI64::new(last_released),
        }
    }

    fn index(&self, seqno: i64) -> usize {
        seqno.rem_euclid(self.conds.len() as i64) as usize
    }

    fn lock(&self) -> MutexGuard<'_, Ring> {
        self.ring.lock().expect("monitor mutex poisoned")
    }

    /// Block until it is `seqno`'s turn and return the acquisition token.
    ///
    /// Fails with [`OrderError::OutOfRange`] for seqnos at or below the last
    /// released one, [`OrderError::Overflow`] when the waiter table is full,
    /// [`OrderError::Canceled`] when the seqno was skipped, and
    /// [`OrderError::Interrupted`] when [`Monitor::interrupt`] kicked the
    /// wait (the seqno stays live: re-grab or self-cancel it).
    pub fn grab(&self, seqno: Seqno) -> Result<Ticket, OrderError> {
        let s = seqno.0;
        let idx = self.index(s);
        let mut ring = self.lock();

        if s <= ring.last_released {
            return Err(OrderError::OutOfRange);
        }
        if s - ring.last_released >= self.conds.len() as i64 {
            return Err(OrderError::Overflow);
        }

        {
            let slot = &mut ring.slots[idx];
            match slot.state {
                SlotState::Free => {
                    slot.seqno = s;
                    slot.state = SlotState::Waiting;
                }
                // Resuming after an interrupt.
                SlotState::Interrupted if slot.seqno == s => slot.state = SlotState::Waiting,
                // Pre-cancelled before the grab arrived; the slot stays
                // cancelled so predecessors skip it.
                SlotState::Canceled if slot.seqno == s => return Err(OrderError::Canceled),
                _ => return Err(OrderError::Misuse),
            }
        }

        loop {
            let slot = ring.slots[idx];
            if slot.seqno != s {
                // The slot was recycled: we were cancelled and advanced over
                // while asleep.
                return Err(OrderError::Canceled);
            }
            match slot.state {
                SlotState::Canceled => return Err(OrderError::Canceled),
                SlotState::Interrupted => return Err(OrderError::Interrupted),
                _ => {}
            }
            if ring.last_released + 1 == s {
                ring.slots[idx].state = SlotState::Holding;
                return Ok(Ticket { seqno });
            }
            ring = self.conds[idx].wait(ring).expect("monitor mutex poisoned");
        }
    }

    /// Release the seqno held by `ticket` and wake its successor.
    ///
    /// Consuming the ticket makes out-of-order release unrepresentable; the
    /// monitor still verifies the hand-back and reports
    /// [`OrderError::Misuse`] defensively.
    pub fn release(&self, ticket: Ticket) -> Result<(), OrderError> {
        let s = ticket.seqno.0;
        let idx = self.index(s);
        let mut ring = self.lock();

        let slot = ring.slots[idx];
        if ring.last_released + 1 != s
            || slot.seqno != s
            || slot.state != SlotState::Holding
        {
            return Err(OrderError::Misuse);
        }

        ring.slots[idx] = Slot::FREE;
        ring.last_released = s;
        self.advance(&mut ring);
        Ok(())
    }

    /// Skip `seqno`, which some other thread is (or will be) waiting on.
    ///
    /// The caller is expected to be the current holder. The target waiter
    /// returns [`OrderError::Canceled`]; a not-yet-grabbed seqno is
    /// pre-cancelled so the eventual grab fails immediately. Cancelling a
    /// seqno already past, including the caller's own held one, is
    /// [`OrderError::OutOfRange`].
    pub fn cancel(&self, seqno: Seqno) -> Result<(), OrderError> {
        let s = seqno.0;
        let idx = self.index(s);
        let mut ring = self.lock();

        if s <= ring.last_released {
            return Err(OrderError::OutOfRange);
        }

        if ring.slots[idx].seqno == s {
            match ring.slots[idx].state {
                SlotState::Waiting | SlotState::Interrupted => {
                    ring.slots[idx].state = SlotState::Canceled;
                    self.conds[idx].notify_all();
                }
                SlotState::Canceled => {}
                // The current holder cancelling itself is not well defined.
                SlotState::Holding => return Err(OrderError::OutOfRange),
                SlotState::Free => unreachable!("free slot holds no seqno"),
            }
        } else {
            if s - ring.last_released >= self.conds.len() as i64 {
                return Err(OrderError::Overflow);
            }
            debug_assert_eq!(ring.slots[idx].state, SlotState::Free);
            ring.slots[idx] = Slot {
                seqno: s,
                state: SlotState::Canceled,
            };
        }

        // A cancelled slot at the head of the window will see no further
        // release; advance over it here.
        if ring.last_released + 1 == s {
            self.advance(&mut ring);
        }
        Ok(())
    }

    /// Skip `seqno` on behalf of its own would-be holder, without entering
    /// the critical section. Predecessors advance over the slot as if it had
    /// been released.
    pub fn self_cancel(&self, seqno: Seqno) -> Result<(), OrderError> {
        let s = seqno.0;
        let idx = self.index(s);
        let mut ring = self.lock();

        if s <= ring.last_released {
            return Err(OrderError::OutOfRange);
        }

        if ring.slots[idx].seqno == s {
            match ring.slots[idx].state {
                // Only the interrupted owner may self-cancel a live slot.
                SlotState::Interrupted => ring.slots[idx].state = SlotState::Canceled,
                SlotState::Canceled => {}
                SlotState::Waiting | SlotState::Holding => return Err(OrderError::Misuse),
                SlotState::Free => unreachable!("free slot holds no seqno"),
            }
        } else {
            if s - ring.last_released >= self.conds.len() as i64 {
                return Err(OrderError::Overflow);
            }
            debug_assert_eq!(ring.slots[idx].state, SlotState::Free);
            ring.slots[idx] = Slot {
                seqno: s,
                state: SlotState::Canceled,
            };
        }

        if ring.last_released + 1 == s {
            self.advance(&mut ring);
        }
        Ok(())
    }

    /// Wake the waiter of `seqno` with [`OrderError::Interrupted`].
    ///
    /// The seqno stays live: later seqnos keep blocking until the owner
    /// re-grabs or self-cancels it. Interrupting a slot that is not waiting
    /// is [`OrderError::OutOfRange`]; re-interrupting an already interrupted
    /// slot is a no-op.
    pub fn interrupt(&self, seqno: Seqno) -> Result<(), OrderError> {
        let s = seqno.0;
        let idx = self.index(s);
        let mut ring = self.lock();

        if s <= ring.last_released || ring.slots[idx].seqno != s {
            return Err(OrderError::OutOfRange);
        }
        match ring.slots[idx].state {
            SlotState::Waiting => {
                ring.slots[idx].state = SlotState::Interrupted;
                self.conds[idx].notify_all();
                Ok(())
            }
            SlotState::Interrupted => Ok(()),
            SlotState::Holding | SlotState::Canceled => Err(OrderError::OutOfRange),
            SlotState::Free => unreachable!("free slot holds no seqno"),
        }
    }

    /// Conservative snapshot of the last released seqno.
    ///
    /// Taken without the monitor lock: the returned value may trail the true
    /// one, but the seqno it names is guaranteed to be out of use. After
    /// quiescence it is exact.
    pub fn seqno(&self) -> Seqno {
        Seqno(self.released.load(Ordering::Acquire))
    }

    /// Advance `last_released` over consecutive cancelled slots and wake the
    /// next live waiter. Skipped waiters are woken too so they can observe
    /// their cancellation.
    fn advance(&self, ring: &mut Ring) {
        loop {
            let next = ring.last_released + 1;
            let idx = self.index(next);
            let slot = ring.slots[idx];
            if slot.seqno == next && slot.state == SlotState::Canceled {
                ring.slots[idx] = Slot::FREE;
                ring.last_released = next;
                self.conds[idx].notify_all();
                continue;
            }
            if slot.seqno == next && slot.state == SlotState::Waiting {
                self.conds[idx].notify_one();
            }
            break;
        }
        self.released.store(ring.last_released, Ordering::Release);
    }
}

impl std::fmt::Debug for Monitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Monitor")
            .field("window_len", &self.conds.len())
            .field("last_released", &self.released.load(Ordering::Relaxed))
            .finish()
    }
}
