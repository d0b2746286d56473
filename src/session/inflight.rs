//! Inflight window and QoS 1/2 acknowledgement state
//!
//! Tracks messages sent but not yet acknowledged (outgoing) and QoS 2
//! publishes received but not yet released (incoming). The send quota is
//! bounded by the peer's receive maximum; packet ids are allocated
//! monotonically in [1, 65535], skipping ids still inflight, and survive a
//! session resume so retransmissions keep their original id.

use std::time::{Duration, Instant};

use ahash::AHashMap;

use crate::protocol::{Publish, QoS};

/// Outgoing QoS 2 progress
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Qos2State {
    /// PUBLISH sent, waiting for PUBREC
    AwaitingPubRec,
    /// PUBREC received and PUBREL sent, waiting for PUBCOMP
    AwaitingPubComp,
}

/// An unacknowledged outbound message
#[derive(Debug, Clone)]
pub struct InflightMessage {
    pub packet_id: u16,
    pub publish: Publish,
    pub qos2_state: Option<Qos2State>,
    pub sent_at: Instant,
    pub retry_count: u32,
}

/// A retransmission due for one inflight entry
#[derive(Debug, Clone)]
pub enum Retransmit {
    /// Resend the PUBLISH with the DUP flag set
    Publish(Publish),
    /// Resend the PUBREL for a half-completed QoS 2 flow
    PubRel(u16),
}

/// Per-session inflight bookkeeping for both directions
#[derive(Debug)]
pub struct InflightWindow {
    /// Outbound QoS 1/2 awaiting acknowledgement, by packet id
    outgoing: AHashMap<u16, InflightMessage>,
    /// Inbound QoS 2 publishes held until PUBREL, by packet id
    incoming: AHashMap<u16, Publish>,
    next_packet_id: u16,
    /// Remaining sends allowed by the peer's receive maximum
    send_quota: u16,
    receive_maximum: u16,
    /// Server-imposed bound on the outgoing window
    max_inflight: u16,
}

impl InflightWindow {
    pub fn new(receive_maximum: u16, max_inflight: u16) -> Self {
        Self {
            outgoing: AHashMap::with_capacity(16),
            incoming: AHashMap::with_capacity(8),
            next_packet_id: 1,
            send_quota: receive_maximum,
            receive_maximum,
            max_inflight,
        }
    }

    pub fn outgoing_len(&self) -> usize {
        self.outgoing.len()
    }

    pub fn incoming_len(&self) -> usize {
        self.incoming.len()
    }

    /// Update the quota ceiling from the peer's CONNECT properties
    pub fn set_receive_maximum(&mut self, receive_maximum: u16) {
        self.receive_maximum = receive_maximum;
        self.send_quota = receive_maximum.saturating_sub(self.outgoing.len() as u16);
    }

    /// Whether another QoS 1/2 send fits the window right now
    pub fn has_send_capacity(&self) -> bool {
        self.send_quota > 0 && (self.outgoing.len() as u16) < self.max_inflight
    }

    /// Allocate the next free packet id
    ///
    /// Monotone with wraparound inside [1, 65535]; ids held by either
    /// direction are skipped.
    pub fn next_packet_id(&mut self) -> u16 {
        loop {
            let id = self.next_packet_id;
            self.next_packet_id = if self.next_packet_id == u16::MAX {
                1
            } else {
                self.next_packet_id + 1
            };
            if !self.outgoing.contains_key(&id) && !self.incoming.contains_key(&id) {
                return id;
            }
        }
    }

    /// Record an outbound QoS 1/2 publish and consume quota
    pub fn track_outgoing(&mut self, packet_id: u16, publish: Publish) {
        let qos2_state = match publish.qos {
            QoS::ExactlyOnce => Some(Qos2State::AwaitingPubRec),
            _ => None,
        };
        self.send_quota = self.send_quota.saturating_sub(1);
        self.outgoing.insert(
            packet_id,
            InflightMessage {
                packet_id,
                publish,
                qos2_state,
                sent_at: Instant::now(),
                retry_count: 0,
            },
        );
    }

    /// PUBACK received: QoS 1 flow complete
    pub fn ack_puback(&mut self, packet_id: u16) -> bool {
        let removed = self.outgoing.remove(&packet_id).is_some();
        if removed {
            self.restore_quota();
        }
        removed
    }

    /// PUBREC received: advance to awaiting PUBCOMP
    pub fn ack_pubrec(&mut self, packet_id: u16) -> bool {
        match self.outgoing.get_mut(&packet_id) {
            Some(inflight) if inflight.publish.qos == QoS::ExactlyOnce => {
                inflight.qos2_state = Some(Qos2State::AwaitingPubComp);
                inflight.sent_at = Instant::now();
                true
            }
            _ => false,
        }
    }

    /// PUBCOMP received: QoS 2 flow complete
    pub fn ack_pubcomp(&mut self, packet_id: u16) -> bool {
        let removed = self.outgoing.remove(&packet_id).is_some();
        if removed {
            self.restore_quota();
        }
        removed
    }

    fn restore_quota(&mut self) {
        if self.send_quota < self.receive_maximum {
            self.send_quota += 1;
        }
    }

    /// Store an inbound QoS 2 publish until its PUBREL
    ///
    /// Re-receiving an id already held is the client retrying; the stored
    /// message wins and the duplicate is dropped.
    pub fn store_incoming(&mut self, packet_id: u16, publish: Publish) -> bool {
        use std::collections::hash_map::Entry;
        match self.incoming.entry(packet_id) {
            Entry::Occupied(_) => false,
            Entry::Vacant(slot) => {
                slot.insert(publish);
                true
            }
        }
    }

    /// PUBREL received: release the held publish for routing
    pub fn release_incoming(&mut self, packet_id: u16) -> Option<Publish> {
        self.incoming.remove(&packet_id)
    }

    /// Entries older than the retry interval, with their retry counters
    /// bumped
    ///
    /// Returns the retransmissions to send and whether any entry exceeded
    /// `retry_max` (the session should be disconnected).
    pub fn due_for_retry(
        &mut self,
        retry_interval: Duration,
        retry_max: u32,
    ) -> (Vec<Retransmit>, bool) {
        let now = Instant::now();
        let mut out = Vec::new();
        let mut exhausted = false;

        for inflight in self.outgoing.values_mut() {
            if now.duration_since(inflight.sent_at) < retry_interval {
                continue;
            }
            inflight.retry_count += 1;
            inflight.sent_at = now;
            if inflight.retry_count > retry_max {
                exhausted = true;
                continue;
            }
            match inflight.qos2_state {
                None | Some(Qos2State::AwaitingPubRec) => {
                    let mut publish = inflight.publish.clone();
                    publish.dup = true;
                    publish.packet_id = Some(inflight.packet_id);
                    out.push(Retransmit::Publish(publish));
                }
                Some(Qos2State::AwaitingPubComp) => {
                    out.push(Retransmit::PubRel(inflight.packet_id));
                }
            }
        }

        (out, exhausted)
    }

    /// Everything to retransmit on session resume, original packet ids kept
    pub fn resume_replay(&mut self) -> Vec<Retransmit> {
        let mut ids: Vec<u16> = self.outgoing.keys().copied().collect();
        ids.sort_unstable();

        let now = Instant::now();
        ids.into_iter()
            .filter_map(|id| {
                let inflight = self.outgoing.get_mut(&id)?;
                inflight.sent_at = now;
                match inflight.qos2_state {
                    None | Some(Qos2State::AwaitingPubRec) => {
                        let mut publish = inflight.publish.clone();
                        publish.dup = true;
                        publish.packet_id = Some(id);
                        Some(Retransmit::Publish(publish))
                    }
                    Some(Qos2State::AwaitingPubComp) => Some(Retransmit::PubRel(id)),
                }
            })
            .collect()
    }

    /// Snapshot of outgoing entries for session persistence
    pub fn outgoing_snapshot(&self) -> Vec<&InflightMessage> {
        self.outgoing.values().collect()
    }

    /// Restore a persisted entry (session reload)
    pub fn restore_outgoing(&mut self, message: InflightMessage) {
        self.send_quota = self.send_quota.saturating_sub(1);
        self.outgoing.insert(message.packet_id, message);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use std::sync::Arc;

    fn publish(qos: QoS, packet_id: u16) -> Publish {
        Publish {
            topic: Arc::from("t"),
            payload: Bytes::from_static(b"x"),
            qos,
            packet_id: Some(packet_id),
            ..Default::default()
        }
    }

    #[test]
    fn test_packet_id_skips_inflight() {
        let mut w = InflightWindow::new(10, 10);
        let id1 = w.next_packet_id();
        assert_eq!(id1, 1);
        w.track_outgoing(id1, publish(QoS::AtLeastOnce, id1));
        // Force the allocator to wrap onto the used id
        w.next_packet_id = 1;
        assert_eq!(w.next_packet_id(), 2);
    }

    #[test]
    fn test_qos1_flow() {
        let mut w = InflightWindow::new(2, 10);
        w.track_outgoing(1, publish(QoS::AtLeastOnce, 1));
        w.track_outgoing(2, publish(QoS::AtLeastOnce, 2));
        assert!(!w.has_send_capacity());

        assert!(w.ack_puback(1));
        assert!(w.has_send_capacity());
        assert!(!w.ack_puback(1));
        assert_eq!(w.outgoing_len(), 1);
    }

    #[test]
    fn test_qos2_outbound_flow() {
        let mut w = InflightWindow::new(10, 10);
        w.track_outgoing(5, publish(QoS::ExactlyOnce, 5));

        assert!(w.ack_pubrec(5));
        // PUBACK against a QoS 2 id in PUBCOMP phase still clears it, but
        // PUBREC twice only refreshes the state
        assert!(w.ack_pubrec(5));
        assert!(w.ack_pubcomp(5));
        assert_eq!(w.outgoing_len(), 0);
    }

    #[test]
    fn test_qos2_inbound_dedup() {
        let mut w = InflightWindow::new(10, 10);
        assert!(w.store_incoming(9, publish(QoS::ExactlyOnce, 9)));
        // Client retransmission of the same id is not stored twice
        assert!(!w.store_incoming(9, publish(QoS::ExactlyOnce, 9)));

        assert!(w.release_incoming(9).is_some());
        assert!(w.release_incoming(9).is_none());
    }

    #[test]
    fn test_retry_and_exhaustion() {
        let mut w = InflightWindow::new(10, 10);
        w.track_outgoing(1, publish(QoS::AtLeastOnce, 1));

        let (due, exhausted) = w.due_for_retry(Duration::from_secs(0), 2);
        assert_eq!(due.len(), 1);
        assert!(!exhausted);
        assert!(matches!(&due[0], Retransmit::Publish(p) if p.dup));

        let (_, _) = w.due_for_retry(Duration::from_secs(0), 2);
        let (due, exhausted) = w.due_for_retry(Duration::from_secs(0), 2);
        assert!(due.is_empty());
        assert!(exhausted);
    }

    #[test]
    fn test_resume_replay_keeps_ids() {
        let mut w = InflightWindow::new(10, 10);
        w.track_outgoing(3, publish(QoS::AtLeastOnce, 3));
        w.track_outgoing(7, publish(QoS::ExactlyOnce, 7));
        assert!(w.ack_pubrec(7));

        let replay = w.resume_replay();
        assert_eq!(replay.len(), 2);
        assert!(matches!(&replay[0], Retransmit::Publish(p) if p.packet_id == Some(3) && p.dup));
        // Half-completed QoS 2 resumes at PUBREL, not PUBLISH
        assert!(matches!(replay[1], Retransmit::PubRel(7)));
    }

    #[test]
    fn test_max_inflight_bound() {
        let mut w = InflightWindow::new(100, 1);
        w.track_outgoing(1, publish(QoS::AtLeastOnce, 1));
        assert!(!w.has_send_capacity());
        w.ack_puback(1);
        assert!(w.has_send_capacity());
    }
}
