//! Message channels layered over packet-level acks.
//!
//! Packets are unreliable; the reliable channel keeps every sent message
//! until a packet that carried it is acked, resending after the current
//! retransmission timeout. Receivers deliver reliable messages strictly in
//! sequence order. The unreliable channel is a plain drain-on-flush queue.

use std::collections::{BTreeMap, HashMap, VecDeque};

use crate::protocol::{Envelope, MAX_PACKET_SIZE, Message, Reliability};

/// Bounds on the retransmission interval regardless of measured RTT.
pub const RTO_MIN_SECS: f64 = 0.1;
pub const RTO_MAX_SECS: f64 = 1.0;

#[derive(Debug)]
struct PendingMessage {
    message: Message,
    last_sent: f64,
    ever_sent: bool,
}

#[derive(Debug, Default)]
pub struct ReliableSender {
    next_seq: u64,
    pending: BTreeMap<u64, PendingMessage>,
    packet_contents: HashMap<u32, Vec<u64>>,
}

impl ReliableSender {
    pub fn send(&mut self, message: Message) -> u64 {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.pending.insert(
            seq,
            PendingMessage {
                message,
                last_sent: 0.0,
                ever_sent: false,
            },
        );
        seq
    }

    /// Messages to put on the wire now: never-sent ones plus those whose
    /// retransmission timeout has elapsed.
    pub fn due(&self, now: f64, rto: f64) -> Vec<(u64, Message)> {
        let rto = rto.clamp(RTO_MIN_SECS, RTO_MAX_SECS);
        self.pending
            .iter()
            .filter(|(_, p)| !p.ever_sent || now - p.last_sent >= rto)
            .map(|(seq, p)| (*seq, p.message.clone()))
            .collect()
    }

    pub fn mark_sent(&mut self, packet_seq: u32, message_seqs: &[u64], now: f64) {
        for seq in message_seqs {
            if let Some(pending) = self.pending.get_mut(seq) {
                pending.last_sent = now;
                pending.ever_sent = true;
            }
        }
        if !message_seqs.is_empty() {
            self.packet_contents
                .insert(packet_seq, message_seqs.to_vec());
        }
    }

    /// An acked packet settles every reliable message it carried.
    pub fn ack_packet(&mut self, packet_seq: u32) {
        if let Some(seqs) = self.packet_contents.remove(&packet_seq) {
            for seq in seqs {
                self.pending.remove(&seq);
            }
            // Entries for lost packets whose messages have since been
            // delivered through a retransmit are dead weight.
            let pending = &self.pending;
            self.packet_contents
                .retain(|_, seqs| seqs.iter().any(|s| pending.contains_key(s)));
        }
    }

    pub fn in_flight(&self) -> usize {
        self.pending.len()
    }
}

#[derive(Debug, Default)]
pub struct ReliableReceiver {
    next_expected: u64,
    ahead: BTreeMap<u64, Message>,
}

impl ReliableReceiver {
    /// Accepts one reliable message, returning everything now deliverable
    /// in order. Duplicates and already-delivered sequences yield nothing.
    pub fn receive(&mut self, seq: u64, message: Message) -> Vec<Message> {
        if seq < self.next_expected {
            return Vec::new();
        }
        if seq != self.next_expected {
            self.ahead.entry(seq).or_insert(message);
            return Vec::new();
        }

        let mut out = vec![message];
        self.next_expected += 1;
        while let Some(next) = self.ahead.remove(&self.next_expected) {
            out.push(next);
            self.next_expected += 1;
        }
        out
    }

    pub fn buffered(&self) -> usize {
        self.ahead.len()
    }
}

/// Both channels of one connection.
#[derive(Debug, Default)]
pub struct MessageChannels {
    reliable_tx: ReliableSender,
    reliable_rx: ReliableReceiver,
    unreliable_tx: VecDeque<Message>,
    unreliable_seq: u64,
}

impl MessageChannels {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn send(&mut self, channel: Reliability, message: Message) {
        match channel {
            Reliability::Reliable => {
                self.reliable_tx.send(message);
            }
            Reliability::Unreliable => self.unreliable_tx.push_back(message),
        }
    }

    /// Envelopes to send this flush. The reliable seqs included must be
    /// reported back through `mark_sent` with the carrying packet sequence.
    pub fn outgoing(&mut self, now: f64, rto: f64) -> Vec<Envelope> {
        let mut entries: Vec<Envelope> = self
            .reliable_tx
            .due(now, rto)
            .into_iter()
            .map(|(seq, message)| Envelope {
                channel: Reliability::Reliable,
                seq,
                message,
            })
            .collect();
        while let Some(message) = self.unreliable_tx.pop_front() {
            let seq = self.unreliable_seq;
            self.unreliable_seq += 1;
            entries.push(Envelope {
                channel: Reliability::Unreliable,
                seq,
                message,
            });
        }
        entries
    }

    pub fn mark_sent(&mut self, packet_seq: u32, entries: &[Envelope], now: f64) {
        let reliable: Vec<u64> = entries
            .iter()
            .filter(|e| e.channel == Reliability::Reliable)
            .map(|e| e.seq)
            .collect();
        self.reliable_tx.mark_sent(packet_seq, &reliable, now);
    }

    pub fn ack_packet(&mut self, packet_seq: u32) {
        self.reliable_tx.ack_packet(packet_seq);
    }

    /// Routes one received envelope, returning deliverable messages in
    /// order.
    pub fn receive(&mut self, envelope: Envelope) -> Vec<Message> {
        match envelope.channel {
            Reliability::Reliable => self.reliable_rx.receive(envelope.seq, envelope.message),
            Reliability::Unreliable => vec![envelope.message],
        }
    }

    pub fn idle(&self) -> bool {
        self.reliable_tx.in_flight() == 0 && self.unreliable_tx.is_empty()
    }
}

/// Rough serialized footprint of one envelope, used only to group messages
/// into packets near the size budget.
fn estimated_size(envelope: &Envelope) -> usize {
    let body = match &envelope.message {
        Message::SendManifest {
            assignment, rank, ..
        } => 32 + assignment.len() * 8 + rank.len() * 4,
        Message::ClientCommand { payload, .. }
        | Message::ServerCommand { payload, .. }
        | Message::ClientReply { payload, .. }
        | Message::ServerReply { payload, .. } => 24 + payload.len(),
        Message::ObjectCreate { .. } | Message::ObjectUpdate { .. } => 48,
        Message::ObjectDelete { .. } => 24,
    };
    body + 16
}

/// Greedy packing of envelopes into packet-sized groups. A single envelope
/// over the budget (a large manifest) travels alone and is left to IP
/// fragmentation.
pub(crate) fn group_entries(entries: Vec<Envelope>) -> Vec<Vec<Envelope>> {
    let budget = MAX_PACKET_SIZE - 128;
    let mut groups = Vec::new();
    let mut current: Vec<Envelope> = Vec::new();
    let mut current_size = 0usize;
    for envelope in entries {
        let size = estimated_size(&envelope);
        if !current.is_empty() && current_size + size > budget {
            groups.push(std::mem::take(&mut current));
            current_size = 0;
        }
        current_size += size;
        current.push(envelope);
    }
    if !current.is_empty() {
        groups.push(current);
    }
    groups
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::ObjectId;

    fn delete(n: u64) -> Message {
        Message::ObjectDelete {
            object: ObjectId(n),
        }
    }

    fn object_of(message: &Message) -> u64 {
        match message {
            Message::ObjectDelete { object } => object.0,
            other => panic!("unexpected message {:?}", other),
        }
    }

    #[test]
    fn receiver_orders_and_dedups() {
        let mut rx = ReliableReceiver::default();
        assert!(rx.receive(2, delete(2)).is_empty());
        assert!(rx.receive(1, delete(1)).is_empty());
        assert!(rx.receive(2, delete(2)).is_empty());

        let delivered = rx.receive(0, delete(0));
        let ids: Vec<u64> = delivered.iter().map(object_of).collect();
        assert_eq!(ids, vec![0, 1, 2]);

        // Replay of an already-delivered sequence.
        assert!(rx.receive(1, delete(1)).is_empty());
    }

    #[test]
    fn sender_retransmits_until_acked() {
        let mut tx = ReliableSender::default();
        tx.send(delete(0));

        let due = tx.due(0.0, 0.2);
        assert_eq!(due.len(), 1);
        tx.mark_sent(10, &[due[0].0], 0.0);

        // Within the timeout nothing is due; after it, the same message is.
        assert!(tx.due(0.1, 0.2).is_empty());
        assert_eq!(tx.due(0.5, 0.2).len(), 1);
        tx.mark_sent(11, &[0], 0.5);

        // Ack of either carrying packet settles the message.
        tx.ack_packet(10);
        assert_eq!(tx.in_flight(), 0);
        assert!(tx.due(5.0, 0.2).is_empty());
        tx.ack_packet(11);
    }

    #[test]
    fn unreliable_drains_once() {
        let mut channels = MessageChannels::new();
        channels.send(Reliability::Unreliable, delete(7));

        let first = channels.outgoing(0.0, 0.2);
        assert_eq!(first.len(), 1);
        assert_eq!(first[0].channel, Reliability::Unreliable);
        assert!(channels.outgoing(0.0, 0.2).is_empty());
    }
}
