//! Producer-side buffer of sent but not yet acknowledged messages.

use crate::ack::Ack;
use crate::error::{DeliveryError, Result};
use crate::seq_no::{HasSeqNo, SeqNo};
use std::collections::VecDeque;

/// Messages awaiting acknowledgement, split into `nacked` (resend first) and
/// `non_acked` (sent, unconfirmed). Both halves are kept in sequence order.
#[derive(Debug, Clone)]
pub struct AckedSendBuffer<T> {
    capacity: usize,
    non_acked: VecDeque<T>,
    nacked: VecDeque<T>,
    max_seq_no: SeqNo,
}

impl<T: HasSeqNo> AckedSendBuffer<T> {
    /// Empty buffer expecting sequence numbers from 0
    pub fn new(capacity: usize) -> Self {
        Self::starting_after(capacity, SeqNo::new(-1))
    }

    /// Empty buffer whose first message must come after `last`
    pub fn starting_after(capacity: usize, last: SeqNo) -> Self {
        Self {
            capacity,
            non_acked: VecDeque::new(),
            nacked: VecDeque::new(),
            max_seq_no: last,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.non_acked.len() + self.nacked.len()
    }

    pub fn is_empty(&self) -> bool {
        self.non_acked.is_empty() && self.nacked.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.len() >= self.capacity
    }

    /// Highest sequence number ever buffered
    pub fn max_seq_no(&self) -> SeqNo {
        self.max_seq_no
    }

    pub fn non_acked(&self) -> impl Iterator<Item = &T> {
        self.non_acked.iter()
    }

    pub fn nacked(&self) -> impl Iterator<Item = &T> {
        self.nacked.iter()
    }

    /// All buffered messages, oldest first
    pub fn unacked(&self) -> Vec<&T> {
        let mut all: Vec<&T> = self.nacked.iter().chain(self.non_acked.iter()).collect();
        all.sort_by(|a, b| a.seq_no().cmp(&b.seq_no()));
        all
    }

    /// Oldest buffered message
    pub fn first(&self) -> Option<&T> {
        match (self.nacked.front(), self.non_acked.front()) {
            (Some(n), Some(a)) => Some(if n.seq_no() < a.seq_no() { n } else { a }),
            (n, a) => n.or(a),
        }
    }

    pub fn contains(&self, seq_no: SeqNo) -> bool {
        self.nacked
            .iter()
            .chain(self.non_acked.iter())
            .any(|m| m.seq_no() == seq_no)
    }

    /// Append a newly sent message.
    pub fn buffer(&mut self, msg: T) -> Result<()> {
        if self.len() >= self.capacity {
            return Err(DeliveryError::ResendBufferCapacityReached {
                capacity: self.capacity,
            });
        }
        let seq_no = msg.seq_no();
        if seq_no <= self.max_seq_no {
            return Err(DeliveryError::NonMonotonicSeqNo {
                seq_no,
                highest: self.max_seq_no,
            });
        }
        self.max_seq_no = seq_no;
        self.non_acked.push_back(msg);
        Ok(())
    }

    /// Append the parts of one split message.
    ///
    /// The parts are admitted together as soon as one slot is free, so the
    /// buffer may exceed its capacity by the parts of a single message. On
    /// error the buffer is unchanged.
    pub fn buffer_all(&mut self, parts: Vec<T>) -> Result<()> {
        if parts.is_empty() {
            return Ok(());
        }
        if self.is_full() {
            return Err(DeliveryError::ResendBufferCapacityReached {
                capacity: self.capacity,
            });
        }
        let mut highest = self.max_seq_no;
        for part in &parts {
            let seq_no = part.seq_no();
            if seq_no <= highest {
                return Err(DeliveryError::NonMonotonicSeqNo { seq_no, highest });
            }
            highest = seq_no;
        }
        self.max_seq_no = highest;
        self.non_acked.extend(parts);
        Ok(())
    }

    /// Apply an acknowledgement.
    ///
    /// Messages up to `cumulative_ack` are released unless nacked; nacked
    /// messages move to the resend list; previously nacked messages that are
    /// no longer nacked return to `non_acked`. On error the buffer is
    /// unchanged.
    pub fn acknowledge(&mut self, ack: &Ack) -> Result<()> {
        if ack.cumulative_ack > self.max_seq_no {
            return Err(DeliveryError::AckBeyondHighestSent {
                ack: ack.cumulative_ack,
                highest: self.max_seq_no,
            });
        }

        let missing: Vec<SeqNo> = ack
            .nacks
            .iter()
            .copied()
            .filter(|nack| !self.contains(*nack))
            .collect();
        if !missing.is_empty() {
            return Err(DeliveryError::ResendUnfulfillable { missing });
        }

        let mut all: Vec<T> = self.nacked.drain(..).chain(self.non_acked.drain(..)).collect();
        all.sort_by(|a, b| a.seq_no().cmp(&b.seq_no()));

        for msg in all {
            let seq_no = msg.seq_no();
            if ack.nacks.contains(&seq_no) {
                self.nacked.push_back(msg);
            } else if seq_no > ack.cumulative_ack {
                self.non_acked.push_back(msg);
            }
        }
        Ok(())
    }
}
