//! # Weighted Fair Queuing
//!
//! One FIFO per priority class. Serving a message from class `c` advances
//! that class's virtual time by `size / weight(c)`; dequeue always serves
//! the non-empty class with the smallest virtual time (ties go to the more
//! urgent class).
//!
//! A class that was idle re-enters at the current virtual clock rather than
//! at its stale value, so idling never banks credit and a burst in one class
//! delays the others by at most a factor bounded by the weight ratio.
//!
//! Capacity: at the high watermark NORMAL/LOW are refused; CRITICAL/HIGH are
//! admitted until absolute capacity.

use std::collections::VecDeque;

use crate::domain::{Message, Priority, PriorityWeights};

const CLASSES: usize = Priority::ALL.len();

/// Why a message was not enqueued.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueRejection {
    /// NORMAL/LOW at or above the high watermark.
    Watermark,
    /// Absolute capacity reached.
    Full,
}

/// Per-route set of priority queues under WFQ.
#[derive(Debug)]
pub struct PriorityQueueSet {
    queues: [VecDeque<Message>; CLASSES],
    virtual_time: [f64; CLASSES],
    virtual_clock: f64,
    weights: PriorityWeights,
    capacity: usize,
    high_watermark: usize,
    len: usize,
}

impl PriorityQueueSet {
    /// Empty queue set.
    pub fn new(weights: PriorityWeights, capacity: usize, high_watermark: usize) -> Self {
        Self {
            queues: Default::default(),
            virtual_time: [0.0; CLASSES],
            virtual_clock: 0.0,
            weights,
            capacity,
            high_watermark: high_watermark.min(capacity),
            len: 0,
        }
    }

    /// Whether a message of `priority` would be admitted now.
    pub fn check_room(&self, priority: Priority) -> Result<(), EnqueueRejection> {
        if self.len >= self.capacity {
            return Err(EnqueueRejection::Full);
        }
        if self.len >= self.high_watermark && !priority.bypasses_watermark() {
            return Err(EnqueueRejection::Watermark);
        }
        Ok(())
    }

    /// Enqueue subject to capacity; hands the message back on rejection.
    pub fn try_enqueue(&mut self, message: Message) -> Result<(), (Message, EnqueueRejection)> {
        match self.check_room(message.priority()) {
            Ok(()) => {
                self.push(message);
                Ok(())
            }
            Err(reason) => Err((message, reason)),
        }
    }

    /// Enqueue ignoring capacity (recovery and re-homing only).
    pub fn restore(&mut self, message: Message) {
        self.push(message);
    }

    fn push(&mut self, message: Message) {
        let class = message.priority().index();
        if self.queues[class].is_empty() {
            self.virtual_time[class] = self.virtual_time[class].max(self.virtual_clock);
        }
        self.queues[class].push_back(message);
        self.len += 1;
    }

    /// Serve the next message.
    pub fn dequeue(&mut self) -> Option<Message> {
        let class = self.next_class()?;
        let message = self.queues[class].pop_front()?;
        self.len -= 1;

        self.virtual_clock = self.virtual_time[class];
        let weight = self.weights.weight(Priority::ALL[class]) as f64;
        self.virtual_time[class] += message.size() as f64 / weight;
        Some(message)
    }

    fn next_class(&self) -> Option<usize> {
        let mut best: Option<usize> = None;
        for class in 0..CLASSES {
            if self.queues[class].is_empty() {
                continue;
            }
            best = match best {
                Some(b) if self.virtual_time[b] <= self.virtual_time[class] => Some(b),
                _ => Some(class),
            };
        }
        best
    }

    /// Remove everything, in service order.
    pub fn drain(&mut self) -> Vec<Message> {
        let mut out = Vec::with_capacity(self.len);
        while let Some(m) = self.dequeue() {
            out.push(m);
        }
        out
    }

    /// Total queued messages.
    pub fn len(&self) -> usize {
        self.len
    }

    /// True when nothing is queued.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Queued messages per class, CRITICAL first.
    pub fn depth_by_priority(&self) -> [usize; CLASSES] {
        let mut out = [0; CLASSES];
        for (i, q) in self.queues.iter().enumerate() {
            out[i] = q.len();
        }
        out
    }

    /// Absolute capacity.
    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn msg(priority: Priority, n: u32) -> Message {
        Message::new(0, b"key".to_vec(), priority, n.to_le_bytes().to_vec())
    }

    fn queue(capacity: usize) -> PriorityQueueSet {
        PriorityQueueSet::new(PriorityWeights::default(), capacity, capacity * 85 / 100)
    }

    #[test]
    fn test_fifo_within_class() {
        let mut q = queue(100);
        for i in 0..5 {
            q.try_enqueue(msg(Priority::Normal, i)).unwrap();
        }
        for i in 0..5u32 {
            assert_eq!(q.dequeue().unwrap().payload(), &i.to_le_bytes());
        }
        assert!(q.dequeue().is_none());
    }

    #[test]
    fn test_service_share_follows_weights() {
        let mut q = queue(10_000);
        for i in 0..1_000 {
            for p in Priority::ALL {
                q.try_enqueue(msg(p, i)).unwrap();
            }
        }
        let mut served = [0usize; 4];
        for _ in 0..1_500 {
            served[q.dequeue().unwrap().priority().index()] += 1;
        }
        // 8:4:2:1 of 1500 = 800:400:200:100
        assert!((790..=810).contains(&served[0]), "{:?}", served);
        assert!((390..=410).contains(&served[1]), "{:?}", served);
        assert!((190..=210).contains(&served[2]), "{:?}", served);
        assert!((90..=110).contains(&served[3]), "{:?}", served);
    }

    #[test]
    fn test_low_never_starved() {
        let mut q = queue(10_000);
        q.try_enqueue(msg(Priority::Low, 0)).unwrap();
        for i in 0..1_000 {
            q.try_enqueue(msg(Priority::Critical, i)).unwrap();
        }
        let position = (0..)
            .find(|_| q.dequeue().map(|m| m.priority()) == Some(Priority::Low))
            .unwrap();
        assert!(position <= 8, "LOW served after {} dequeues", position);
    }

    #[test]
    fn test_idle_class_banks_no_credit() {
        let mut q = queue(10_000);
        for i in 0..200 {
            q.try_enqueue(msg(Priority::Critical, i)).unwrap();
        }
        for _ in 0..200 {
            q.dequeue();
        }
        // LOW arriving now starts at the current clock, not at zero
        for i in 0..20 {
            q.try_enqueue(msg(Priority::Low, i)).unwrap();
            q.try_enqueue(msg(Priority::Critical, i)).unwrap();
        }
        let first_ten: Vec<Priority> = (0..10).map(|_| q.dequeue().unwrap().priority()).collect();
        let critical = first_ten.iter().filter(|&&p| p == Priority::Critical).count();
        assert!(critical >= 8, "{:?}", first_ten);
    }

    #[test]
    fn test_watermark_rejects_normal_and_low_only() {
        let mut q = PriorityQueueSet::new(PriorityWeights::default(), 10, 8);
        for i in 0..8 {
            q.try_enqueue(msg(Priority::Normal, i)).unwrap();
        }
        let (_, reason) = q.try_enqueue(msg(Priority::Low, 99)).unwrap_err();
        assert_eq!(reason, EnqueueRejection::Watermark);
        assert!(q.try_enqueue(msg(Priority::Normal, 99)).is_err());
        q.try_enqueue(msg(Priority::High, 1)).unwrap();
        q.try_enqueue(msg(Priority::Critical, 2)).unwrap();
        let (_, reason) = q.try_enqueue(msg(Priority::Critical, 3)).unwrap_err();
        assert_eq!(reason, EnqueueRejection::Full);
        assert_eq!(q.len(), 10);
    }

    #[test]
    fn test_restore_ignores_capacity() {
        let mut q = PriorityQueueSet::new(PriorityWeights::default(), 1, 1);
        q.try_enqueue(msg(Priority::Critical, 0)).unwrap();
        q.restore(msg(Priority::Low, 1));
        assert_eq!(q.len(), 2);
        assert_eq!(q.depth_by_priority(), [1, 0, 0, 1]);
    }

    #[test]
    fn test_drain_empties_in_service_order() {
        let mut q = queue(100);
        q.try_enqueue(msg(Priority::Low, 0)).unwrap();
        q.try_enqueue(msg(Priority::Critical, 1)).unwrap();
        let drained = q.drain();
        assert_eq!(drained.len(), 2);
        assert_eq!(drained[0].priority(), Priority::Critical);
        assert!(q.is_empty());
    }
}
