//! Entity addressing

use serde::{Deserialize, Serialize};

/// Logical destination of a sharded message
pub type EntityId = String;

/// A message addressed to one entity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShardingEnvelope<M> {
    pub entity_id: EntityId,
    pub message: M,
}

impl<M> ShardingEnvelope<M> {
    pub fn new(entity_id: impl Into<EntityId>, message: M) -> Self {
        Self {
            entity_id: entity_id.into(),
            message,
        }
    }

    pub fn map<N>(self, f: impl FnOnce(M) -> N) -> ShardingEnvelope<N> {
        ShardingEnvelope {
            entity_id: self.entity_id,
            message: f(self.message),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_map_keeps_entity() {
        let envelope = ShardingEnvelope::new("cart-7", 41).map(|n| n + 1);
        assert_eq!(envelope.entity_id, "cart-7");
        assert_eq!(envelope.message, 42);
    }
}
