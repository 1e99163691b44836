//! Journal stage
//!
//! Persists every record through a journal writer before forwarding it.
//! The stage never parses record contents. With replication enabled the
//! stage reads from the replica's output ring, so a record reaches the
//! journal only after it was published to the replica stream.
//!
//! A journal I/O fault closes this stage only; the rest of the pipeline
//! keeps running and upstream backpressure takes over.

use std::fs::{ File, OpenOptions };
use std::io::{ Seek, SeekFrom, Write };
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{ AtomicBool, Ordering };

use crate::constants::STAGE_BATCH_LIMIT;
use crate::error::Result;
use crate::idle::IdleStrategy;
use crate::ring::RingBuffer;
use crate::stage::forward_until_accepted;
use crate::worker::StagePoller;

/// External journal writer collaborator
pub trait Journal: Send {
    /// Append one record payload
    fn write(&mut self, payload: &[u8]) -> Result<()>;

    /// Push buffered writes toward stable storage
    fn flush(&mut self) -> Result<()>;
}

/// How the file journal positions its writes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JournalStrategy {
    /// Seek to the append position, then write
    Seek,
    /// Positional write at the append position without moving the file cursor
    Positional,
}

/// Append-only file journal
///
/// The file is pre-sized at creation so appends do not grow it on the hot
/// path. On-disk layout beyond a plain concatenation of payloads is the
/// journal consumer's concern.
pub struct FileJournal {
    file: File,
    strategy: JournalStrategy,
    position: u64,
}

impl FileJournal {
    /// Create (or truncate) a journal file, pre-sized to `pre_allocate` bytes
    pub fn create(
        path: impl AsRef<Path>,
        strategy: JournalStrategy,
        pre_allocate: u64
    ) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;
        if pre_allocate > 0 {
            file.set_len(pre_allocate)?;
        }
        Ok(Self {
            file,
            strategy,
            position: 0,
        })
    }

    /// Bytes appended so far
    pub fn position(&self) -> u64 {
        self.position
    }
}

impl Journal for FileJournal {
    fn write(&mut self, payload: &[u8]) -> Result<()> {
        match self.strategy {
            JournalStrategy::Seek => {
                self.file.seek(SeekFrom::Start(self.position))?;
                self.file.write_all(payload)?;
            }
            #[cfg(unix)]
            JournalStrategy::Positional => {
                use std::os::unix::fs::FileExt;
                self.file.write_all_at(payload, self.position)?;
            }
            #[cfg(not(unix))]
            JournalStrategy::Positional => {
                self.file.seek(SeekFrom::Start(self.position))?;
                self.file.write_all(payload)?;
            }
        }
        self.position += payload.len() as u64;
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        self.file.sync_data()?;
        Ok(())
    }
}

/// Persists records through the journal writer, then forwards them
pub struct JournalStage {
    input: Arc<RingBuffer>,
    journal: Box<dyn Journal>,
    output: Arc<RingBuffer>,
    retry_idle: IdleStrategy,
    flushing_enabled: bool,
    faulted: bool,
}

impl JournalStage {
    /// Wire the stage between its input ring, journal writer and output ring
    pub fn new(
        input: Arc<RingBuffer>,
        journal: Box<dyn Journal>,
        output: Arc<RingBuffer>,
        retry_idle: IdleStrategy,
        flushing_enabled: bool
    ) -> Self {
        Self {
            input,
            journal,
            output,
            retry_idle,
            flushing_enabled,
            faulted: false,
        }
    }
}

impl StagePoller for JournalStage {
    fn poll(&mut self, running: &AtomicBool) -> usize {
        let journal = &mut self.journal;
        let output = &self.output;
        let retry_idle = &mut self.retry_idle;
        let faulted = &mut self.faulted;

        let mut records = 0;
        self.input.read(
            |msg_type_id, payload| {
                if !*faulted {
                    if let Err(err) = journal.write(payload) {
                        tracing::error!(%err, "journal write failed, closing journal stage");
                        *faulted = true;
                        running.store(false, Ordering::SeqCst);
                    }
                }
                forward_until_accepted(output, msg_type_id, payload, retry_idle, running);
                records += 1;
            },
            STAGE_BATCH_LIMIT
        );

        if self.flushing_enabled && records > 0 && !self.faulted {
            if let Err(err) = self.journal.flush() {
                tracing::error!(%err, "journal flush failed, closing journal stage");
                self.faulted = true;
                running.store(false, Ordering::SeqCst);
            }
        }
        records
    }

    fn on_close(&mut self) {
        if !self.faulted {
            if let Err(err) = self.journal.flush() {
                tracing::warn!(%err, "journal flush failed during close");
            }
        }
    }
}
