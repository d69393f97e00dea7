//! Consumer-side reorder buffer.

use crate::ack::Ack;
use crate::seq_no::{HasSeqNo, SeqNo};
use std::collections::{BTreeMap, BTreeSet};

/// Holds out-of-order arrivals until the gap before them is filled.
#[derive(Debug, Clone)]
pub struct AckedReceiveBuffer<T> {
    last_delivered: SeqNo,
    highest_received: SeqNo,
    buf: BTreeMap<SeqNo, T>,
    max_nacks: usize,
}

impl<T: HasSeqNo> Default for AckedReceiveBuffer<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: HasSeqNo> AckedReceiveBuffer<T> {
    /// Buffer expecting sequence number 0 first
    pub fn new() -> Self {
        Self::starting_after(SeqNo::new(-1))
    }

    /// Buffer expecting `last_delivered.inc()` first
    pub fn starting_after(last_delivered: SeqNo) -> Self {
        Self {
            last_delivered,
            highest_received: last_delivered,
            buf: BTreeMap::new(),
            max_nacks: usize::MAX,
        }
    }

    /// Report at most `max_nacks` gaps per ack, the lowest first
    pub fn with_max_nacks(mut self, max_nacks: usize) -> Self {
        self.max_nacks = max_nacks;
        self
    }

    /// Highest sequence number handed out by [`extract_deliverable`](Self::extract_deliverable)
    pub fn last_delivered(&self) -> SeqNo {
        self.last_delivered
    }

    pub fn highest_received(&self) -> SeqNo {
        self.highest_received
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Already delivered or currently buffered
    pub fn has_seen(&self, seq_no: SeqNo) -> bool {
        seq_no <= self.last_delivered || self.buf.contains_key(&seq_no)
    }

    /// Buffered messages, in sequence order
    pub fn buffered(&self) -> impl Iterator<Item = &T> {
        self.buf.values()
    }

    pub fn into_buffered(self) -> impl Iterator<Item = T> {
        self.buf.into_values()
    }

    /// Accept an arrival. Duplicates and already delivered sequence numbers
    /// are ignored; returns whether the message was new.
    pub fn receive(&mut self, msg: T) -> bool {
        let seq_no = msg.seq_no();
        if self.has_seen(seq_no) {
            return false;
        }
        self.highest_received = self.highest_received.max(seq_no);
        self.buf.insert(seq_no, msg);
        true
    }

    /// Remove the contiguous prefix starting at the next expected sequence
    /// number. The ack's cumulative value is the highest contiguous sequence
    /// number; its nacks are the lowest gaps below the highest received, at
    /// most `max_nacks` of them.
    pub fn extract_deliverable(&mut self) -> (Vec<T>, Ack) {
        let mut deliver = Vec::new();
        while let Some(entry) = self.buf.first_entry() {
            if !entry.key().is_successor(self.last_delivered) {
                break;
            }
            deliver.push(entry.remove());
            self.last_delivered = self.last_delivered.inc();
        }

        let mut nacks = BTreeSet::new();
        let mut prev = self.last_delivered;
        'gaps: for seq_no in self.buf.keys() {
            let mut missing = prev.inc();
            while missing < *seq_no {
                if nacks.len() >= self.max_nacks {
                    break 'gaps;
                }
                nacks.insert(missing);
                missing = missing.inc();
            }
            prev = *seq_no;
        }

        (
            deliver,
            Ack {
                cumulative_ack: self.last_delivered,
                nacks,
            },
        )
    }

    /// Absorb another buffer's state, e.g. from a replaced consumer.
    pub fn merge_from(&mut self, other: AckedReceiveBuffer<T>) {
        self.last_delivered = self.last_delivered.max(other.last_delivered);
        self.highest_received = self.highest_received.max(other.highest_received);
        for (seq_no, msg) in other.buf {
            self.buf.entry(seq_no).or_insert(msg);
        }
        let last_delivered = self.last_delivered;
        self.buf.retain(|seq_no, _| *seq_no > last_delivered);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::seq_no::Sequenced;

    fn msg(seq: i64) -> Sequenced<i64> {
        Sequenced::new(seq, seq * 10)
    }

    fn values(msgs: Vec<Sequenced<i64>>) -> Vec<i64> {
        msgs.into_iter().map(|m| m.seq_no.value()).collect()
    }

    #[test]
    fn test_in_order_delivery() {
        let mut buffer = AckedReceiveBuffer::new();
        buffer.receive(msg(0));
        buffer.receive(msg(1));
        let (deliver, ack) = buffer.extract_deliverable();
        assert_eq!(values(deliver), vec![0, 1]);
        assert_eq!(ack, Ack::cumulative(SeqNo::new(1)));
        assert!(buffer.is_empty());
    }

    #[test]
    fn test_any_order_with_duplicates_delivers_once() {
        let orders: [&[i64]; 6] = [
            &[0, 1, 2],
            &[2, 1, 0],
            &[1, 1, 0, 2],
            &[2, 0, 0, 1, 2],
            &[1, 2, 2, 1, 0, 0],
            &[0, 2, 0, 1],
        ];
        for order in orders {
            let mut buffer = AckedReceiveBuffer::new();
            let mut delivered = Vec::new();
            for seq in order {
                buffer.receive(msg(*seq));
                let (deliver, _) = buffer.extract_deliverable();
                delivered.extend(values(deliver));
            }
            assert_eq!(delivered, vec![0, 1, 2], "order {:?}", order);
        }
    }

    #[test]
    fn test_gaps_are_nacked() {
        let mut buffer = AckedReceiveBuffer::new();
        for seq in [0, 2, 5] {
            buffer.receive(msg(seq));
        }
        let (deliver, ack) = buffer.extract_deliverable();
        assert_eq!(values(deliver), vec![0]);
        assert_eq!(ack, Ack::new(SeqNo::new(0), [1, 3, 4].map(SeqNo::new)));
        assert_eq!(buffer.highest_received(), SeqNo::new(5));

        buffer.receive(msg(1));
        let (deliver, ack) = buffer.extract_deliverable();
        assert_eq!(values(deliver), vec![1, 2]);
        assert_eq!(ack, Ack::new(SeqNo::new(2), [3, 4].map(SeqNo::new)));
    }

    #[test]
    fn test_nacks_capped_at_lowest_gaps() {
        let mut buffer = AckedReceiveBuffer::new().with_max_nacks(3);
        for seq in [0, 2, 1_000_000_000] {
            buffer.receive(msg(seq));
        }
        let (deliver, ack) = buffer.extract_deliverable();
        assert_eq!(values(deliver), vec![0]);
        assert_eq!(ack, Ack::new(SeqNo::new(0), [1, 3, 4].map(SeqNo::new)));
    }

    #[test]
    fn test_already_delivered_ignored() {
        let mut buffer = AckedReceiveBuffer::starting_after(SeqNo::new(10));
        assert!(!buffer.receive(msg(7)));
        assert!(buffer.receive(msg(11)));
        assert!(!buffer.receive(msg(11)));
        let (deliver, _) = buffer.extract_deliverable();
        assert_eq!(values(deliver), vec![11]);
    }

    #[test]
    fn test_merge_from() {
        let mut replacement = AckedReceiveBuffer::starting_after(SeqNo::new(0));
        replacement.receive(msg(4));

        let mut old = AckedReceiveBuffer::starting_after(SeqNo::new(1));
        old.receive(msg(2));
        old.receive(msg(3));

        replacement.merge_from(old);
        assert_eq!(replacement.last_delivered(), SeqNo::new(1));
        let (deliver, ack) = replacement.extract_deliverable();
        assert_eq!(values(deliver), vec![2, 3, 4]);
        assert_eq!(ack, Ack::cumulative(SeqNo::new(4)));
    }

    #[test]
    fn test_wraparound_delivery() {
        let mut buffer = AckedReceiveBuffer::starting_after(SeqNo::MAX.dec());
        buffer.receive(Sequenced::new(SeqNo::MIN, 2));
        buffer.receive(Sequenced::new(SeqNo::MAX, 1));
        let (deliver, ack) = buffer.extract_deliverable();
        assert_eq!(deliver.iter().map(|m| m.payload).collect::<Vec<_>>(), vec![1, 2]);
        assert_eq!(ack.cumulative_ack, SeqNo::MIN);
    }
}
