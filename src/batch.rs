use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};

use crate::event::CapturedEvent;

/// Outcome of [`BatchEventQueue::push`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum PushOutcome {
    /// Event queued.
    Queued {
        /// Queue length reached the flush threshold.
        should_flush: bool,
    },
    /// Queue is full, event dropped.
    Dropped,
}

/// A bounded in-memory queue of captured events shared between the client and the flusher
/// thread.
#[derive(Debug, Clone)]
pub(crate) struct BatchEventQueue {
    flush_at: usize,
    max_batch_size: usize,
    max_queue_size: usize,
    event_queue: Arc<Mutex<VecDeque<CapturedEvent>>>,
}

impl BatchEventQueue {
    pub fn new(flush_at: usize, max_batch_size: usize, max_queue_size: usize) -> Self {
        BatchEventQueue {
            flush_at: flush_at.max(1),
            max_batch_size: max_batch_size.max(1),
            max_queue_size: max_queue_size.max(1),
            event_queue: Arc::new(Mutex::new(VecDeque::new())),
        }
    }

    fn lock(&self) -> MutexGuard<'_, VecDeque<CapturedEvent>> {
        // The queue holds plain data and every critical section leaves it consistent, so a
        // poisoned lock is still usable.
        self.event_queue
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn push(&self, event: CapturedEvent) -> PushOutcome {
        let mut queue = self.lock();
        if queue.len() >= self.max_queue_size {
            return PushOutcome::Dropped;
        }
        queue.push_back(event);
        PushOutcome::Queued {
            should_flush: queue.len() >= self.flush_at,
        }
    }

    /// Take up to `max_batch_size` oldest events.
    pub fn next_batch(&self) -> Vec<CapturedEvent> {
        let mut queue = self.lock();
        let size = queue.len().min(self.max_batch_size);
        queue.drain(..size).collect()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::{BatchEventQueue, PushOutcome};
    use crate::{event::CapturedEvent, Event, Properties};

    fn event(name: &str) -> CapturedEvent {
        CapturedEvent::from_event(Event::new(name, "user"), &Properties::new())
    }

    #[test]
    fn signals_flush_at_threshold() {
        let queue = BatchEventQueue::new(2, 10, 10);

        assert_eq!(
            queue.push(event("a")),
            PushOutcome::Queued { should_flush: false }
        );
        assert_eq!(
            queue.push(event("b")),
            PushOutcome::Queued { should_flush: true }
        );
    }

    #[test]
    fn drops_events_when_full() {
        let queue = BatchEventQueue::new(10, 10, 2);
        queue.push(event("a"));
        queue.push(event("b"));

        assert_eq!(queue.push(event("c")), PushOutcome::Dropped);
        assert_eq!(queue.len(), 2);
    }

    #[test]
    fn batches_are_bounded_and_ordered() {
        let queue = BatchEventQueue::new(10, 2, 10);
        for name in ["a", "b", "c"] {
            queue.push(event(name));
        }

        let first: Vec<_> = queue.next_batch().into_iter().map(|e| e.event).collect();
        assert_eq!(first, ["a", "b"]);
        let second: Vec<_> = queue.next_batch().into_iter().map(|e| e.event).collect();
        assert_eq!(second, ["c"]);
        assert!(queue.next_batch().is_empty());
        assert!(queue.is_empty());
    }
}
