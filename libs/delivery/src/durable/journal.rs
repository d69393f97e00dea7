//! Append-only journal file backing a [`DurableProducerQueue`].
//!
//! Every event is one record: a little-endian `u32` length followed by the
//! bincode-encoded event. Opening the journal replays it; every
//! `load_state` compacts it into a claim record plus the renumbered
//! unconfirmed messages. A truncated trailing record (crash mid-write) is
//! ignored on replay.
//!
//! File IO is blocking `std::fs` done inside the async trait methods while the
//! journal mutex is held. Each call is one small append plus `sync_data`.

use super::{DurableProducerQueue, DurableState, MessageSent, QueueContents, StoreMessageSentAck};
use crate::error::DurableQueueError;
use crate::messages::Incarnation;
use crate::seq_no::SeqNo;
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fs::{self, File, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, info, trace, warn};

const LENGTH_PREFIX: usize = 4;

#[derive(Debug, Serialize, Deserialize)]
enum JournalEvent<T> {
    Claimed {
        incarnation: Incarnation,
    },
    Sent {
        sent: MessageSent<T>,
    },
    Confirmed {
        seq_nr: SeqNo,
        qualifier: String,
        timestamp_ms: u64,
    },
}

struct Journal<T> {
    contents: QueueContents<T>,
    file: File,
}

pub struct JournalDurableQueue<T> {
    path: PathBuf,
    journal: Mutex<Journal<T>>,
}

impl<T> JournalDurableQueue<T>
where
    T: Clone + Serialize + DeserializeOwned + Send + 'static,
{
    /// Open (or create) the journal at `path` and replay it.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, DurableQueueError> {
        let path = path.into();
        let (contents, valid_len) = replay(&path)?;
        let file = open_append(&path)?;
        if file.metadata()?.len() > valid_len {
            warn!(path = %path.display(), valid_len, "Truncating journal to last complete record");
            file.set_len(valid_len)?;
        }
        info!(
            path = %path.display(),
            unconfirmed = contents.unconfirmed().len(),
            "Opened durable queue journal"
        );
        Ok(Self {
            path,
            journal: Mutex::new(Journal { contents, file }),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn unconfirmed(&self) -> Vec<MessageSent<T>> {
        self.journal.lock().contents.unconfirmed().to_vec()
    }

    /// Rewrite the journal as a claim by `incarnation` followed by `state`.
    fn compact(
        &self,
        journal: &mut Journal<T>,
        incarnation: Incarnation,
        state: &DurableState<T>,
    ) -> Result<(), DurableQueueError> {
        let tmp_path = self.path.with_extension("compacting");
        {
            let mut tmp = File::create(&tmp_path)?;
            tmp.write_all(&encode_record(&JournalEvent::<T>::Claimed { incarnation })?)?;
            for sent in &state.unconfirmed {
                tmp.write_all(&encode_record(&JournalEvent::Sent { sent: sent.clone() })?)?;
            }
            tmp.sync_all()?;
        }
        fs::rename(&tmp_path, &self.path)?;
        sync_parent_dir(&self.path)?;
        journal.file = open_append(&self.path)?;
        debug!(path = %self.path.display(), records = state.unconfirmed.len() + 1, "Compacted journal");
        Ok(())
    }
}

#[async_trait]
impl<T> DurableProducerQueue<T> for JournalDurableQueue<T>
where
    T: Clone + Serialize + DeserializeOwned + Send + 'static,
{
    async fn load_state(&self, incarnation: Incarnation) -> Result<DurableState<T>, DurableQueueError> {
        let mut journal = self.journal.lock();
        let state = journal.contents.claim(incarnation);
        self.compact(&mut journal, incarnation, &state)?;
        info!(
            %incarnation,
            unconfirmed = state.unconfirmed.len(),
            current_seq_nr = %state.current_seq_nr,
            "Durable queue journal claimed"
        );
        Ok(state)
    }

    async fn store_message_sent(
        &self,
        incarnation: Incarnation,
        sent: MessageSent<T>,
    ) -> Result<StoreMessageSentAck, DurableQueueError> {
        let mut journal = self.journal.lock();
        journal.contents.check_owner(incarnation)?;
        let stored_seq_nr = sent.seq_nr;
        let record = encode_record(&JournalEvent::Sent { sent: sent.clone() })?;
        append(&mut journal.file, &record)?;
        journal.contents.apply_sent(sent);
        trace!(%incarnation, seq_nr = %stored_seq_nr, "Journaled message sent");
        Ok(StoreMessageSentAck { stored_seq_nr })
    }

    async fn store_message_confirmed(
        &self,
        incarnation: Incarnation,
        seq_nr: SeqNo,
        confirmation_qualifier: String,
        timestamp_ms: u64,
    ) -> Result<(), DurableQueueError> {
        let mut journal = self.journal.lock();
        journal.contents.check_owner(incarnation)?;
        let record = encode_record(&JournalEvent::<T>::Confirmed {
            seq_nr,
            qualifier: confirmation_qualifier.clone(),
            timestamp_ms,
        })?;
        append(&mut journal.file, &record)?;
        journal
            .contents
            .apply_confirmed(seq_nr, &confirmation_qualifier, timestamp_ms);
        trace!(%incarnation, %seq_nr, qualifier = %confirmation_qualifier, "Journaled confirmation");
        Ok(())
    }
}

fn open_append(path: &Path) -> Result<File, DurableQueueError> {
    Ok(OpenOptions::new().create(true).append(true).open(path)?)
}

/// Make a rename inside the journal's directory durable.
fn sync_parent_dir(path: &Path) -> Result<(), DurableQueueError> {
    #[cfg(unix)]
    {
        let dir = match path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent,
            _ => Path::new("."),
        };
        File::open(dir)?.sync_all()?;
    }
    #[cfg(not(unix))]
    let _ = path;
    Ok(())
}

fn append(file: &mut File, record: &[u8]) -> Result<(), DurableQueueError> {
    file.write_all(record)?;
    file.sync_data()?;
    Ok(())
}

fn encode_record<T: Serialize>(event: &JournalEvent<T>) -> Result<Vec<u8>, DurableQueueError> {
    let body = bincode::serialize(event)?;
    let mut record = Vec::with_capacity(LENGTH_PREFIX + body.len());
    record.extend_from_slice(&(body.len() as u32).to_le_bytes());
    record.extend_from_slice(&body);
    Ok(record)
}

/// Replay the journal; also returns the length of its intact prefix.
fn replay<T>(path: &Path) -> Result<(QueueContents<T>, u64), DurableQueueError>
where
    T: Clone + DeserializeOwned,
{
    let mut contents = QueueContents::new();
    let bytes = match fs::read(path) {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok((contents, 0)),
        Err(e) => return Err(e.into()),
    };

    let mut offset = 0;
    let mut records = 0usize;
    while offset < bytes.len() {
        if offset + LENGTH_PREFIX > bytes.len() {
            warn!(path = %path.display(), offset, "Ignoring truncated journal record header");
            break;
        }
        let mut len = [0u8; LENGTH_PREFIX];
        len.copy_from_slice(&bytes[offset..offset + LENGTH_PREFIX]);
        let start = offset + LENGTH_PREFIX;
        let end = start + u32::from_le_bytes(len) as usize;
        if end > bytes.len() {
            warn!(path = %path.display(), offset, "Ignoring truncated journal record");
            break;
        }

        match bincode::deserialize::<JournalEvent<T>>(&bytes[start..end])? {
            JournalEvent::Claimed { incarnation } => {
                contents.claim(incarnation);
            }
            JournalEvent::Sent { sent } => contents.apply_sent(sent),
            JournalEvent::Confirmed {
                seq_nr,
                qualifier,
                timestamp_ms,
            } => contents.apply_confirmed(seq_nr, &qualifier, timestamp_ms),
        }
        records += 1;
        offset = end;
    }

    debug!(path = %path.display(), records, "Replayed journal");
    Ok((contents, offset as u64))
}
