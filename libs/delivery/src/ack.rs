use crate::seq_no::SeqNo;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;

/// Selective acknowledgement: everything up to `cumulative_ack` except the
/// sequence numbers in `nacks`, which must be resent.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Ack {
    pub cumulative_ack: SeqNo,
    pub nacks: BTreeSet<SeqNo>,
}

impl Ack {
    pub fn new(cumulative_ack: SeqNo, nacks: impl IntoIterator<Item = SeqNo>) -> Self {
        Self {
            cumulative_ack,
            nacks: nacks.into_iter().collect(),
        }
    }

    /// Plain cumulative ack with nothing to resend
    pub fn cumulative(cumulative_ack: SeqNo) -> Self {
        Self::new(cumulative_ack, std::iter::empty())
    }
}

impl fmt::Display for Ack {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ACK[{}, {{", self.cumulative_ack)?;
        for (i, nack) in self.nacks.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{}", nack)?;
        }
        write!(f, "}}]")
    }
}
