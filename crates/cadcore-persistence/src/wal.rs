//! Append-only JSON-lines log.
//!
//! Each line is one record. A batch is a single line, so it is either fully
//! present or absent after a crash. A crash mid-append leaves at most one
//! torn final line, which is cut off the next time the log is opened.
//!
//! Truncation rewrites the retained records behind a `floor` record and
//! atomically replaces the file. The floor remembers the highest sequence
//! ever assigned even when no entries remain.
//!
//! Every change to the file runs on one blocking task that owns the log
//! mutex, so a caller dropping a write midway cannot leave the in-memory
//! position behind the file.

use async_trait::async_trait;
use cadcore::{DomainEvent, LogEntry, ReplayConsumer, SequenceNumber, WalError, WalPort};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::{self, Seek, SeekFrom, Write};
use std::marker::PhantomData;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, info, warn};

use crate::atomic::{blocking, persist_file, sync_dir};

/// When appends are forced to stable storage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncMode {
    /// `sync_data` after every append, before the write is acknowledged.
    #[default]
    Always,
    /// Leave flushing to the OS. Acknowledged writes can be lost on power failure.
    Never,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileWalConfig {
    pub dir: PathBuf,
    #[serde(default = "default_file_name")]
    pub file_name: String,
    #[serde(default)]
    pub sync: SyncMode,
}

fn default_file_name() -> String {
    "events.wal".to_string()
}

impl FileWalConfig {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            file_name: default_file_name(),
            sync: SyncMode::default(),
        }
    }

    pub fn with_file_name(mut self, file_name: impl Into<String>) -> Self {
        self.file_name = file_name.into();
        self
    }

    pub fn with_sync(mut self, sync: SyncMode) -> Self {
        self.sync = sync;
        self
    }

    pub fn path(&self) -> PathBuf {
        self.dir.join(&self.file_name)
    }
}

#[derive(Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum RecordRef<'a, P> {
    Entry {
        sequence: SequenceNumber,
        event: &'a DomainEvent<P>,
    },
    Batch {
        first: SequenceNumber,
        events: &'a [DomainEvent<P>],
    },
    Floor {
        sequence: SequenceNumber,
    },
}

#[derive(Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum Record<P> {
    Entry {
        sequence: SequenceNumber,
        event: DomainEvent<P>,
    },
    Batch {
        first: SequenceNumber,
        events: Vec<DomainEvent<P>>,
    },
    Floor {
        sequence: SequenceNumber,
    },
}

impl<P> Record<P> {
    fn into_entries(self) -> Vec<LogEntry<P>> {
        match self {
            Record::Entry { sequence, event } => vec![LogEntry { sequence, event }],
            Record::Batch { first, events } => events
                .into_iter()
                .zip(0u64..)
                .map(|(event, offset)| LogEntry {
                    sequence: first.advance(offset),
                    event,
                })
                .collect(),
            Record::Floor { .. } => Vec::new(),
        }
    }
}

fn encode<P: Serialize>(record: &RecordRef<'_, P>) -> Result<Vec<u8>, WalError> {
    let mut line = serde_json::to_vec(record)?;
    line.push(b'\n');
    Ok(line)
}

/// Records parsed from a log file.
struct Scan<P> {
    records: Vec<Record<P>>,
    last: SequenceNumber,
    floor: SequenceNumber,
    /// Length of the prefix made of complete records.
    valid_len: u64,
    torn: bool,
}

impl<P: DeserializeOwned> Scan<P> {
    fn parse(bytes: &[u8]) -> Result<Self, WalError> {
        let mut scan = Scan {
            records: Vec::new(),
            last: SequenceNumber::start(),
            floor: SequenceNumber::start(),
            valid_len: 0,
            torn: false,
        };

        let mut offset = 0;
        let mut line_no = 0;
        while offset < bytes.len() {
            line_no += 1;
            let rest = &bytes[offset..];
            let Some(end) = rest.iter().position(|byte| *byte == b'\n') else {
                // Unterminated: the append never completed.
                scan.torn = true;
                break;
            };
            let next = offset + end + 1;
            let line = &rest[..end];

            if !line.iter().all(u8::is_ascii_whitespace) {
                match serde_json::from_slice::<Record<P>>(line) {
                    Ok(record) => scan.push(record, line_no)?,
                    Err(_) if next == bytes.len() => {
                        scan.torn = true;
                        break;
                    }
                    Err(err) => {
                        return Err(WalError::Corrupt {
                            line: line_no,
                            reason: err.to_string(),
                        })
                    }
                }
            }
            offset = next;
            scan.valid_len = next as u64;
        }
        Ok(scan)
    }

    fn push(&mut self, record: Record<P>, line: usize) -> Result<(), WalError> {
        match &record {
            Record::Entry { sequence, .. } => {
                self.expect_after_last(*sequence, line)?;
                self.last = *sequence;
            }
            Record::Batch { first, events } => {
                if events.is_empty() {
                    return Err(WalError::Corrupt {
                        line,
                        reason: "empty batch".into(),
                    });
                }
                self.expect_after_last(*first, line)?;
                self.last = first
                    .checked_advance(events.len() as u64 - 1)
                    .map_err(|err| WalError::Corrupt {
                        line,
                        reason: err.to_string(),
                    })?;
            }
            Record::Floor { sequence } => {
                self.floor = self.floor.max(*sequence);
                self.last = self.last.max(*sequence);
            }
        }
        self.records.push(record);
        Ok(())
    }

    fn expect_after_last(&self, sequence: SequenceNumber, line: usize) -> Result<(), WalError> {
        if sequence.is_after(self.last) {
            return Ok(());
        }
        Err(WalError::Corrupt {
            line,
            reason: format!("sequence {sequence} does not follow {}", self.last),
        })
    }
}

struct Inner {
    file: File,
    /// Bytes of complete records in the file.
    len: u64,
    last: SequenceNumber,
    floor: SequenceNumber,
}

impl Inner {
    fn append(&mut self, line: &[u8], sync: SyncMode) -> io::Result<()> {
        if let Err(err) = self.write_line(line, sync) {
            // Cut back to the last complete record so the next append starts clean.
            if let Err(cleanup) = self.file.set_len(self.len) {
                warn!(error = %cleanup, "could not cut back failed log append");
            }
            return Err(err);
        }
        self.len += line.len() as u64;
        Ok(())
    }

    fn write_line(&mut self, line: &[u8], sync: SyncMode) -> io::Result<()> {
        self.file.seek(SeekFrom::Start(self.len))?;
        self.file.write_all(line)?;
        self.file.flush()?;
        if sync == SyncMode::Always {
            self.file.sync_data()?;
        }
        Ok(())
    }
}

/// A [`WalPort`] backed by one JSON-lines file.
pub struct FileWal<P> {
    dir: PathBuf,
    path: PathBuf,
    sync: SyncMode,
    inner: Arc<Mutex<Inner>>,
    _payload: PhantomData<fn() -> P>,
}

impl<P> FileWal<P>
where
    P: Serialize + DeserializeOwned + Send + Sync + 'static,
{
    /// Open or create the log, discarding a torn final record if present.
    pub async fn open(config: FileWalConfig) -> Result<Self, WalError> {
        tokio::fs::create_dir_all(&config.dir).await?;
        let path = config.path();

        let bytes = match tokio::fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == io::ErrorKind::NotFound => Vec::new(),
            Err(err) => return Err(err.into()),
        };
        let scan = Scan::<P>::parse(&bytes)?;

        if scan.torn {
            warn!(
                path = %path.display(),
                kept_bytes = scan.valid_len,
                discarded_bytes = bytes.len() as u64 - scan.valid_len,
                "discarding torn log tail"
            );
        }
        let (open_path, valid_len, torn) = (path.clone(), scan.valid_len, scan.torn);
        let file = blocking(move || {
            let file = OpenOptions::new()
                .create(true)
                .truncate(false)
                .write(true)
                .open(&open_path)?;
            if torn {
                file.set_len(valid_len)?;
                file.sync_data()?;
            }
            Ok::<_, io::Error>(file)
        })
        .await?;
        if config.sync == SyncMode::Never {
            warn!(
                path = %path.display(),
                "log opened without sync; acknowledged writes may be lost"
            );
        }
        info!(
            path = %path.display(),
            last_sequence = %scan.last,
            floor = %scan.floor,
            "log opened"
        );

        Ok(Self {
            dir: config.dir,
            path,
            sync: config.sync,
            inner: Arc::new(Mutex::new(Inner {
                file,
                len: scan.valid_len,
                last: scan.last,
                floor: scan.floor,
            })),
            _payload: PhantomData,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Entries at or before this sequence have been truncated.
    pub async fn floor(&self) -> SequenceNumber {
        self.inner.lock().await.floor
    }

    /// Append one encoded record and advance the log to `last`.
    ///
    /// The append and the position update run together on a blocking task
    /// holding the log mutex, so they complete even if the caller goes away.
    async fn append(
        &self,
        mut inner: OwnedMutexGuard<Inner>,
        line: Vec<u8>,
        last: SequenceNumber,
    ) -> Result<(), WalError> {
        let sync = self.sync;
        blocking(move || {
            inner.append(&line, sync)?;
            inner.last = last;
            Ok::<_, io::Error>(())
        })
        .await?;
        Ok(())
    }
}

/// Rebuild the file contents with every entry through `up_to` dropped.
fn compact<P>(bytes: &[u8], up_to: SequenceNumber) -> Result<(Vec<u8>, usize), WalError>
where
    P: Serialize + DeserializeOwned,
{
    let mut retained = encode::<P>(&RecordRef::Floor { sequence: up_to })?;
    let mut discarded = 0;
    for record in Scan::<P>::parse(bytes)?.records {
        match record {
            Record::Floor { .. } => {}
            Record::Entry { sequence, event } => {
                if sequence.is_after(up_to) {
                    retained.extend(encode(&RecordRef::Entry {
                        sequence,
                        event: &event,
                    })?);
                } else {
                    discarded += 1;
                }
            }
            Record::Batch { first, mut events } => {
                let covered = if first.is_after(up_to) {
                    0
                } else {
                    ((up_to.value() - first.value() + 1) as usize).min(events.len())
                };
                let kept = events.split_off(covered);
                discarded += covered;
                if !kept.is_empty() {
                    retained.extend(encode(&RecordRef::Batch {
                        first: first.advance(covered as u64),
                        events: &kept,
                    })?);
                }
            }
        }
    }
    Ok((retained, discarded))
}

#[async_trait]
impl<P> WalPort<P> for FileWal<P>
where
    P: Serialize + DeserializeOwned + Send + Sync + 'static,
{
    async fn write(&self, event: &DomainEvent<P>) -> Result<SequenceNumber, WalError> {
        let inner = self.inner.clone().lock_owned().await;
        let sequence = inner.last.checked_next()?;
        let line = encode(&RecordRef::Entry { sequence, event })?;
        self.append(inner, line, sequence).await?;
        debug!(%sequence, "log entry durable");
        Ok(sequence)
    }

    async fn write_batch(&self, events: &[DomainEvent<P>]) -> Result<SequenceNumber, WalError> {
        let inner = self.inner.clone().lock_owned().await;
        if events.is_empty() {
            return Ok(inner.last);
        }
        let first = inner.last.checked_next()?;
        let last = first.checked_advance(events.len() as u64 - 1)?;
        let line = encode(&RecordRef::Batch { first, events })?;
        self.append(inner, line, last).await?;
        debug!(%first, %last, "log batch durable");
        Ok(last)
    }

    async fn replay_from(
        &self,
        from: SequenceNumber,
        consumer: &mut ReplayConsumer<'_, P>,
    ) -> Result<usize, WalError> {
        let bytes = {
            let inner = self.inner.lock().await;
            if from.is_before(inner.floor) {
                return Err(WalError::Truncated {
                    requested: from,
                    floor: inner.floor,
                });
            }
            tokio::fs::read(&self.path).await?
        };

        let mut delivered = 0;
        for record in Scan::<P>::parse(&bytes)?.records {
            for entry in record.into_entries() {
                if entry.sequence.is_after(from) {
                    consumer(entry);
                    delivered += 1;
                }
            }
        }
        Ok(delivered)
    }

    async fn truncate(&self, up_to: SequenceNumber) -> Result<(), WalError> {
        let mut inner = self.inner.clone().lock_owned().await;
        let up_to = up_to.min(inner.last);
        if !up_to.is_after(inner.floor) {
            return Ok(());
        }

        let (dir, path) = (self.dir.clone(), self.path.clone());
        let discarded = blocking(move || {
            let bytes = std::fs::read(&path)?;
            let (retained, discarded) = compact::<P>(&bytes, up_to)?;
            // The replacement handle is adopted as soon as the rename lands, so
            // later appends never go to the unlinked file.
            inner.file = persist_file(&dir, &path, &retained)?;
            inner.len = retained.len() as u64;
            inner.floor = up_to;
            sync_dir(&dir)?;
            Ok::<_, WalError>(discarded)
        })
        .await?;
        info!(through = %up_to, discarded, "log truncated");
        Ok(())
    }

    async fn current_sequence(&self) -> SequenceNumber {
        self.inner.lock().await.last
    }
}
