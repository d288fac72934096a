//! Cross-thread completion hand-off.
//!
//! Query handles report readiness from whatever thread their I/O runs on. The only thing
//! that crosses over to the owning thread is a slot index, pushed onto the bounded
//! [`ReadyQueue`] by the slot's [`CompletionBridge`].
use std::{
    sync::{
        Arc, Weak,
        atomic::{AtomicBool, Ordering},
    },
    thread,
    time::Duration,
};

use crossbeam_channel::{Receiver, RecvTimeoutError, SendTimeoutError, Sender, bounded};
use log::trace;

use crate::SlotIndex;

/// Bounded queue of slot indices waiting for the scheduler.
#[derive(Debug)]
pub(crate) struct ReadyQueue {
    sender: Sender<SlotIndex>,
    receiver: Receiver<SlotIndex>,
}

impl ReadyQueue {
    pub(crate) fn new(capacity: usize) -> Self {
        let (sender, receiver) = bounded(capacity);
        Self { sender, receiver }
    }

    /// Pops the next ready slot, blocking for up to `timeout` when one is given.
    pub(crate) fn pop(&self, timeout: Option<Duration>) -> Option<SlotIndex> {
        match timeout {
            Some(timeout) => match self.receiver.recv_timeout(timeout) {
                Ok(slot) => Some(slot),
                Err(RecvTimeoutError::Timeout | RecvTimeoutError::Disconnected) => None,
            },
            None => self.receiver.try_recv().ok(),
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.receiver.len()
    }
}

/// Per-slot notifier handed to query handles.
///
/// A bridge lives as long as its slot and is reused by every query attached to it. It only
/// holds a weak reference to the ready queue: once the engine is gone, notifications are
/// silently discarded.
#[derive(Debug, Clone)]
pub struct CompletionBridge {
    slot: SlotIndex,
    queue: Weak<ReadyQueue>,
    queued: Arc<AtomicBool>,
    push_timeout: Duration,
}

impl CompletionBridge {
    pub(crate) fn new(slot: SlotIndex, queue: &Arc<ReadyQueue>, push_timeout: Duration) -> Self {
        Self {
            slot,
            queue: Arc::downgrade(queue),
            queued: Arc::new(AtomicBool::new(false)),
            push_timeout,
        }
    }

    /// Bridge that belongs to no engine. Its signals are dropped.
    pub(crate) fn detached(slot: SlotIndex) -> Self {
        Self {
            slot,
            queue: Weak::new(),
            queued: Arc::new(AtomicBool::new(false)),
            push_timeout: Duration::ZERO,
        }
    }

    pub fn slot(&self) -> SlotIndex {
        self.slot
    }

    /// Signals that the slot's query has a row or has completed.
    ///
    /// Safe to call from any thread. While the slot is already queued, further signals are
    /// coalesced into the outstanding entry: the scheduler re-reads the query status when it
    /// gets to it. Otherwise the push is retried until it succeeds.
    pub fn notify(&self) {
        if self.queued.swap(true, Ordering::AcqRel) {
            return;
        }

        loop {
            let Some(queue) = self.queue.upgrade() else {
                trace!("slot {} signalled without a ready queue", self.slot);
                return;
            };

            match queue.sender.send_timeout(self.slot, self.push_timeout) {
                Ok(()) => return,
                Err(SendTimeoutError::Timeout(_)) => {
                    drop(queue);
                    thread::yield_now();
                }
                Err(SendTimeoutError::Disconnected(_)) => return,
            }
        }
    }

    /// Allows the next signal to enqueue the slot again. Called by the scheduler right before
    /// it inspects the slot's query.
    pub(crate) fn rearm(&self) {
        self.queued.store(false, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TIMEOUT: Duration = Duration::from_millis(5);

    #[test]
    fn notify_pushes_slot_index() {
        let queue = Arc::new(ReadyQueue::new(2));
        let bridge = CompletionBridge::new(1, &queue, TIMEOUT);

        bridge.notify();
        assert_eq!(queue.pop(None), Some(1));
        assert_eq!(queue.pop(None), None);
    }

    #[test]
    fn repeated_signals_coalesce_until_rearmed() {
        let queue = Arc::new(ReadyQueue::new(1));
        let bridge = CompletionBridge::new(0, &queue, TIMEOUT);

        bridge.notify();
        bridge.notify();
        assert_eq!(queue.len(), 1);

        assert_eq!(queue.pop(None), Some(0));
        bridge.rearm();
        bridge.notify();
        assert_eq!(queue.pop(Some(TIMEOUT)), Some(0));
    }

    #[test]
    fn notify_from_other_threads() {
        let queue = Arc::new(ReadyQueue::new(4));
        let handles = (0..4)
            .map(|slot| {
                let bridge = CompletionBridge::new(slot, &queue, TIMEOUT);
                thread::spawn(move || bridge.notify())
            })
            .collect::<Vec<_>>();
        for handle in handles {
            handle.join().unwrap();
        }

        let mut slots = (0..4).filter_map(|_| queue.pop(None)).collect::<Vec<_>>();
        slots.sort();
        assert_eq!(slots, vec![0, 1, 2, 3]);
    }

    #[test]
    fn full_queue_blocks_until_drained() {
        let queue = Arc::new(ReadyQueue::new(1));
        let first = CompletionBridge::new(0, &queue, TIMEOUT);
        let second = CompletionBridge::new(1, &queue, TIMEOUT);
        first.notify();

        let pusher = thread::spawn(move || second.notify());
        thread::sleep(Duration::from_millis(20));
        assert_eq!(queue.pop(None), Some(0));

        pusher.join().unwrap();
        assert_eq!(queue.pop(Some(Duration::from_secs(1))), Some(1));
    }

    #[test]
    fn notify_after_engine_gone_is_dropped() {
        let queue = Arc::new(ReadyQueue::new(1));
        let bridge = CompletionBridge::new(0, &queue, TIMEOUT);
        drop(queue);

        bridge.notify();
    }
}
