//! Transactions parked behind a barrier layer's frame number.
//!
//! Each barrier owns a FIFO. A parked transaction is released only when its
//! frame has been committed and everything parked ahead of it on the same
//! barrier has been released.

use crate::frame_source::FrameNumber;
use crate::layer::LayerId;
use crate::transaction::{LayerMutation, TransactionId};
use indexmap::IndexMap;
use std::collections::{HashMap, VecDeque};

#[derive(Debug, Clone)]
pub struct ParkedTransaction {
    pub id: TransactionId,
    pub frame_number: FrameNumber,
    pub mutations: IndexMap<LayerId, LayerMutation>,
}

#[derive(Debug, Default)]
pub struct DeferredTransactions {
    queues: HashMap<LayerId, VecDeque<ParkedTransaction>>,
}

impl DeferredTransactions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn park(&mut self, barrier: LayerId, parked: ParkedTransaction) {
        tracing::debug!(
            "{} parked until layer {:?} commits frame {}",
            parked.id,
            barrier,
            parked.frame_number
        );
        self.queues.entry(barrier).or_default().push_back(parked);
    }

    pub fn has_parked(&self, barrier: LayerId) -> bool {
        self.queues.get(&barrier).is_some_and(|queue| !queue.is_empty())
    }

    /// Pops the satisfied head of `barrier`'s queue, in order.
    pub fn take_ready(&mut self, barrier: LayerId, committed: FrameNumber) -> Vec<ParkedTransaction> {
        let Some(queue) = self.queues.get_mut(&barrier) else {
            return Vec::new();
        };

        let mut ready = Vec::new();
        while queue.front().is_some_and(|parked| parked.frame_number <= committed) {
            if let Some(parked) = queue.pop_front() {
                ready.push(parked);
            }
        }
        if queue.is_empty() {
            self.queues.remove(&barrier);
        }
        ready
    }

    /// Removes every transaction parked on `barrier`, in order.
    pub fn take_all(&mut self, barrier: LayerId) -> Vec<ParkedTransaction> {
        self.queues
            .remove(&barrier)
            .map(Vec::from)
            .unwrap_or_default()
    }

    /// Total parked transactions.
    pub fn len(&self) -> usize {
        self.queues.values().map(VecDeque::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.queues.is_empty()
    }

    pub fn parked_on(&self, barrier: LayerId) -> usize {
        self.queues.get(&barrier).map_or(0, VecDeque::len)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parked(id: u64, frame_number: FrameNumber) -> ParkedTransaction {
        ParkedTransaction {
            id: TransactionId(id),
            frame_number,
            mutations: IndexMap::new(),
        }
    }

    fn barrier() -> LayerId {
        let mut ids: slotmap::SlotMap<LayerId, ()> = slotmap::SlotMap::with_key();
        ids.insert(())
    }

    #[test]
    fn test_release_in_order() {
        let barrier = barrier();
        let mut deferred = DeferredTransactions::new();
        deferred.park(barrier, parked(1, 1));
        deferred.park(barrier, parked(2, 2));
        assert_eq!(deferred.len(), 2);

        let ready = deferred.take_ready(barrier, 1);
        assert_eq!(ready.len(), 1);
        assert_eq!(ready[0].id, TransactionId(1));

        let ready = deferred.take_ready(barrier, 2);
        assert_eq!(ready[0].id, TransactionId(2));
        assert!(deferred.is_empty());
    }

    #[test]
    fn test_head_of_line_blocks() {
        let barrier = barrier();
        let mut deferred = DeferredTransactions::new();
        deferred.park(barrier, parked(1, 5));
        deferred.park(barrier, parked(2, 1));

        assert!(deferred.take_ready(barrier, 3).is_empty());
        assert!(deferred.has_parked(barrier));

        let ready = deferred.take_ready(barrier, 5);
        let ids: Vec<_> = ready.iter().map(|p| p.id).collect();
        assert_eq!(ids, vec![TransactionId(1), TransactionId(2)]);
    }

    #[test]
    fn test_take_all_flushes() {
        let barrier = barrier();
        let mut deferred = DeferredTransactions::new();
        deferred.park(barrier, parked(1, 10));
        deferred.park(barrier, parked(2, 20));
        assert_eq!(deferred.parked_on(barrier), 2);

        let flushed = deferred.take_all(barrier);
        assert_eq!(flushed.len(), 2);
        assert_eq!(flushed[0].id, TransactionId(1));
        assert_eq!(deferred.parked_on(barrier), 0);
    }
}
