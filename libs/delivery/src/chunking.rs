//! Splitting large messages into sequenced chunks and putting them back
//! together on the consumer side.

use crate::error::{DeliveryError, Result};
use crate::messages::ChunkedMessage;
use bytes::{Bytes, BytesMut};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::marker::PhantomData;

/// Serialization used when messages have to be chunked
pub trait MessageCodec<T>: Send + Sync + 'static {
    fn encode(&self, message: &T) -> Result<Bytes>;
    fn decode(&self, bytes: &[u8]) -> Result<T>;
}

/// serde + bincode
pub struct BincodeCodec<T> {
    _marker: PhantomData<fn() -> T>,
}

impl<T> BincodeCodec<T> {
    pub fn new() -> Self {
        Self {
            _marker: PhantomData,
        }
    }
}

impl<T> Default for BincodeCodec<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> MessageCodec<T> for BincodeCodec<T>
where
    T: Serialize + DeserializeOwned + 'static,
{
    fn encode(&self, message: &T) -> Result<Bytes> {
        bincode::serialize(message)
            .map(Bytes::from)
            .map_err(|e| DeliveryError::codec_with_source("failed to encode message", e))
    }

    fn decode(&self, bytes: &[u8]) -> Result<T> {
        bincode::deserialize(bytes)
            .map_err(|e| DeliveryError::codec_with_source("failed to decode message", e))
    }
}

/// Split `serialized` into chunks of at most `chunk_size` bytes. Always
/// yields at least one chunk; the slices share the original buffer.
pub fn split_into_chunks(serialized: Bytes, chunk_size: usize) -> Vec<ChunkedMessage> {
    let chunk_size = chunk_size.max(1);
    let total = serialized.len();
    if total <= chunk_size {
        return vec![ChunkedMessage {
            serialized,
            first_chunk: true,
            last_chunk: true,
        }];
    }

    let mut chunks = Vec::with_capacity(total.div_ceil(chunk_size));
    let mut offset = 0;
    while offset < total {
        let end = (offset + chunk_size).min(total);
        chunks.push(ChunkedMessage {
            serialized: serialized.slice(offset..end),
            first_chunk: offset == 0,
            last_chunk: end == total,
        });
        offset = end;
    }
    chunks
}

/// Reassembles consecutive chunks of one message
#[derive(Debug, Default)]
pub struct ChunkAssembler {
    buffer: BytesMut,
    chunks: usize,
}

impl ChunkAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add the next chunk; returns the full payload once the last chunk arrived.
    ///
    /// A chunk flagged `first_chunk` discards any unfinished message.
    pub fn push(&mut self, chunk: &ChunkedMessage) -> Option<Bytes> {
        if chunk.first_chunk {
            self.clear();
        }
        self.buffer.extend_from_slice(&chunk.serialized);
        self.chunks += 1;
        if chunk.last_chunk {
            self.chunks = 0;
            Some(self.buffer.split().freeze())
        } else {
            None
        }
    }

    /// Chunks collected for the message in progress
    pub fn pending_chunks(&self) -> usize {
        self.chunks
    }

    pub fn clear(&mut self) {
        self.buffer.clear();
        self.chunks = 0;
    }
}
