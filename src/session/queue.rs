//! Per-session outbound message queue
//!
//! A bounded FIFO fed by dispatch while the session is slow or offline.
//! The overflow policy decides what gives when the bound is hit; a high
//! watermark below the bound signals backpressure to dispatch before
//! messages are lost. Queued messages honor the v5 message expiry interval:
//! expired entries are dropped on drain and by the periodic sweep.

use std::collections::VecDeque;
use std::time::Instant;

use crate::config::OverflowPolicy;
use crate::protocol::Publish;

/// Outcome of an enqueue attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueResult {
    Queued,
    /// Queue full, the incoming message was rejected
    DroppedNewest,
    /// Queue full, the oldest entry was evicted to make room
    DroppedOldest,
    /// Queue full and the policy demands disconnecting the session
    Disconnect,
}

impl EnqueueResult {
    /// True when a message was lost (either end of the queue)
    pub fn dropped(self) -> bool {
        matches!(self, EnqueueResult::DroppedNewest | EnqueueResult::DroppedOldest)
    }
}

#[derive(Debug, Clone)]
pub struct QueuedMessage {
    pub publish: Publish,
    pub queued_at: Instant,
}

impl QueuedMessage {
    /// Remaining expiry seconds, `None` if expired
    fn remaining_expiry(&self, now: Instant) -> Option<Option<u32>> {
        match self.publish.properties.message_expiry_interval {
            None => Some(None),
            Some(expiry) => {
                let elapsed = now.duration_since(self.queued_at).as_secs() as u32;
                if elapsed >= expiry {
                    None
                } else {
                    Some(Some(expiry - elapsed))
                }
            }
        }
    }
}

/// Bounded FIFO with overflow policy and backpressure watermark
#[derive(Debug)]
pub struct SendQueue {
    messages: VecDeque<QueuedMessage>,
    max: usize,
    high_watermark: usize,
    policy: OverflowPolicy,
}

impl SendQueue {
    pub fn new(max: usize, high_watermark: usize, policy: OverflowPolicy) -> Self {
        Self {
            messages: VecDeque::with_capacity(max.min(64)),
            max,
            high_watermark: high_watermark.min(max),
            policy,
        }
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    /// Depth is past the watermark; dispatch should hold non-essential
    /// deliveries
    pub fn over_watermark(&self) -> bool {
        self.high_watermark > 0 && self.messages.len() >= self.high_watermark
    }

    pub fn enqueue(&mut self, publish: Publish) -> EnqueueResult {
        if self.messages.len() >= self.max {
            match self.policy {
                OverflowPolicy::DropNewest => return EnqueueResult::DroppedNewest,
                OverflowPolicy::Disconnect => return EnqueueResult::Disconnect,
                OverflowPolicy::DropOldest => {
                    self.messages.pop_front();
                    self.messages.push_back(QueuedMessage {
                        publish,
                        queued_at: Instant::now(),
                    });
                    return EnqueueResult::DroppedOldest;
                }
            }
        }
        self.messages.push_back(QueuedMessage {
            publish,
            queued_at: Instant::now(),
        });
        EnqueueResult::Queued
    }

    fn drop_expired_front(&mut self) {
        let now = Instant::now();
        while let Some(front) = self.messages.front() {
            if front.remaining_expiry(now).is_none() {
                self.messages.pop_front();
            } else {
                break;
            }
        }
    }

    /// QoS of the next alive entry, without removing it
    pub fn front_qos(&mut self) -> Option<crate::protocol::QoS> {
        self.drop_expired_front();
        self.messages.front().map(|qm| qm.publish.qos)
    }

    /// Pop the next alive entry, updating its remaining expiry
    pub fn pop_front(&mut self) -> Option<Publish> {
        self.drop_expired_front();
        let qm = self.messages.pop_front()?;
        let remaining = qm.remaining_expiry(Instant::now())?;
        let mut publish = qm.publish;
        publish.properties.message_expiry_interval = remaining;
        Some(publish)
    }

    /// Take everything still alive, updating each message expiry to the
    /// remaining time
    pub fn drain(&mut self) -> Vec<Publish> {
        let now = Instant::now();
        std::mem::take(&mut self.messages)
            .into_iter()
            .filter_map(|qm| {
                let remaining = qm.remaining_expiry(now)?;
                let mut publish = qm.publish;
                publish.properties.message_expiry_interval = remaining;
                Some(publish)
            })
            .collect()
    }

    /// Drop expired entries in place; returns how many were removed
    pub fn purge_expired(&mut self) -> usize {
        let now = Instant::now();
        let before = self.messages.len();
        self.messages.retain(|qm| qm.remaining_expiry(now).is_some());
        before - self.messages.len()
    }

    /// The newest `n` entries, oldest first, for session persistence
    pub fn newest(&self, n: usize) -> Vec<&Publish> {
        let skip = self.messages.len().saturating_sub(n);
        self.messages.iter().skip(skip).map(|qm| &qm.publish).collect()
    }
}
