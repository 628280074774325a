use std::collections::HashMap;
use std::io::{ErrorKind, SeekFrom};
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::Deserialize;
use tokio::fs::{self, OpenOptions};
use tokio::io::{AsyncBufReadExt, AsyncSeekExt, AsyncWriteExt, BufReader};
use toolgate_protocol::{AuditEvent, RequestId};
use tracing::{debug, instrument, warn};

use crate::AuditError;

/// Durable home of audit events. Records are never updated or deleted.
#[async_trait]
pub trait AuditStore: Send + Sync {
    /// Persist one event. Returns only once the record is durable.
    async fn append(&self, event: &AuditEvent) -> Result<(), AuditError>;
    async fn find_by_request(
        &self,
        request_id: &RequestId,
    ) -> Result<Option<AuditEvent>, AuditError>;
    async fn read_all(&self) -> Result<Vec<AuditEvent>, AuditError>;
}

/// Where the first record of a request starts in the log.
#[derive(Debug, Clone, Copy)]
struct RecordPosition {
    offset: u64,
    line: usize,
}

/// Request id lookup table over the log, built once and kept current by appends.
#[derive(Debug, Default)]
struct AuditIndex {
    positions: HashMap<RequestId, RecordPosition>,
    len: u64,
    lines: usize,
}

#[derive(Deserialize)]
struct IndexedRecord {
    request_id: RequestId,
}

/// JSON-lines store at `<data_dir>/audit/events.jsonl`.
///
/// An unterminated final line that does not parse is a record torn by a crash
/// mid-append; it is truncated when the index is built. Other unparsable lines
/// are skipped by lookups and reported by [`AuditStore::read_all`].
#[derive(Debug)]
pub struct FileAuditStore {
    path: PathBuf,
    index: tokio::sync::Mutex<Option<AuditIndex>>,
}

impl FileAuditStore {
    pub fn new(data_dir: impl AsRef<Path>) -> Self {
        Self {
            path: data_dir.as_ref().join("audit").join("events.jsonl"),
            index: tokio::sync::Mutex::new(None),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Lock the index, building it on first use. Appends happen under this lock.
    async fn index(
        &self,
    ) -> Result<tokio::sync::MutexGuard<'_, Option<AuditIndex>>, AuditError> {
        let mut guard = self.index.lock().await;
        if guard.is_none() {
            *guard = Some(self.build_index().await?);
        }
        Ok(guard)
    }

    #[instrument(skip(self), fields(path = %self.path.display()))]
    async fn build_index(&self) -> Result<AuditIndex, AuditError> {
        let bytes = match fs::read(&self.path).await {
            Ok(bytes) => bytes,
            Err(error) if error.kind() == ErrorKind::NotFound => return Ok(AuditIndex::default()),
            Err(error) => return Err(error.into()),
        };

        let mut index = AuditIndex::default();
        let mut offset = 0_usize;
        while offset < bytes.len() {
            let line_end = bytes[offset..]
                .iter()
                .position(|byte| *byte == b'\n')
                .map_or(bytes.len(), |position| offset + position + 1);
            let line = bytes[offset..line_end].trim_ascii();
            index.lines += 1;

            if !line.is_empty() {
                match serde_json::from_slice::<IndexedRecord>(line) {
                    Ok(record) => {
                        index.positions.entry(record.request_id).or_insert(RecordPosition {
                            offset: offset as u64,
                            line: index.lines,
                        });
                    }
                    Err(error) if line_end == bytes.len() && !bytes.ends_with(b"\n") => {
                        warn!(line = index.lines, %error, "truncating torn audit record");
                        self.truncate(offset as u64).await?;
                        index.lines -= 1;
                        index.len = offset as u64;
                        return Ok(index);
                    }
                    Err(error) => {
                        warn!(line = index.lines, %error, "skipping unreadable audit record");
                    }
                }
            }
            offset = line_end;
        }

        if bytes.last().is_some_and(|byte| *byte != b'\n') {
            let mut file = OpenOptions::new().append(true).open(&self.path).await?;
            file.write_all(b"\n").await?;
            file.sync_data().await?;
            index.len = bytes.len() as u64 + 1;
        } else {
            index.len = bytes.len() as u64;
        }
        debug!(records = index.positions.len(), "audit index built");
        Ok(index)
    }

    async fn truncate(&self, len: u64) -> Result<(), AuditError> {
        let file = OpenOptions::new().write(true).open(&self.path).await?;
        file.set_len(len).await?;
        file.sync_data().await?;
        Ok(())
    }

    async fn len_on_disk(&self) -> Result<u64, AuditError> {
        match fs::metadata(&self.path).await {
            Ok(metadata) => Ok(metadata.len()),
            Err(error) if error.kind() == ErrorKind::NotFound => Ok(0),
            Err(error) => Err(error.into()),
        }
    }

    async fn read_at(&self, position: RecordPosition) -> Result<AuditEvent, AuditError> {
        let mut file = OpenOptions::new().read(true).open(&self.path).await?;
        file.seek(SeekFrom::Start(position.offset)).await?;
        let mut line = String::new();
        BufReader::new(file).read_line(&mut line).await?;
        serde_json::from_str(line.trim_end()).map_err(|source| AuditError::Corrupt {
            line: position.line,
            source,
        })
    }
}

#[async_trait]
impl AuditStore for FileAuditStore {
    #[instrument(skip(self, event), fields(request_id = %event.request_id))]
    async fn append(&self, event: &AuditEvent) -> Result<(), AuditError> {
        let mut line = serde_json::to_string(event)?;
        line.push('\n');

        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).await?;
        }

        let mut guard = self.index().await?;
        let on_disk = self.len_on_disk().await?;
        if guard.as_ref().is_some_and(|index| index.len != on_disk) {
            warn!(on_disk, "audit log changed outside this store, rebuilding index");
            *guard = Some(self.build_index().await?);
        }

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await?;
        file.write_all(line.as_bytes()).await?;
        file.sync_data().await?;

        if let Some(index) = guard.as_mut() {
            index.lines += 1;
            index.positions
                .entry(event.request_id.clone())
                .or_insert(RecordPosition {
                    offset: index.len,
                    line: index.lines,
                });
            index.len += line.len() as u64;
        }
        debug!("audit event appended");
        Ok(())
    }

    #[instrument(skip(self, request_id), fields(request_id = %request_id))]
    async fn find_by_request(
        &self,
        request_id: &RequestId,
    ) -> Result<Option<AuditEvent>, AuditError> {
        let position = self
            .index()
            .await?
            .as_ref()
            .and_then(|index| index.positions.get(request_id).copied());
        match position {
            Some(position) => Ok(Some(self.read_at(position).await?)),
            None => Ok(None),
        }
    }

    async fn read_all(&self) -> Result<Vec<AuditEvent>, AuditError> {
        // Holding the index lock repairs a torn tail first and keeps appends out.
        let _guard = self.index().await?;
        let bytes = match fs::read(&self.path).await {
            Ok(bytes) => bytes,
            Err(error) if error.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(error) => return Err(error.into()),
        };

        let mut events = Vec::new();
        for (number, line) in bytes.split(|byte| *byte == b'\n').enumerate() {
            let line = line.trim_ascii();
            if line.is_empty() {
                continue;
            }
            let event = serde_json::from_slice(line).map_err(|source| AuditError::Corrupt {
                line: number + 1,
                source,
            })?;
            events.push(event);
        }
        debug!(count = events.len(), "audit events loaded");
        Ok(events)
    }
}

/// Process-local store for tests and the CLI's one-shot invocations.
#[derive(Debug, Default)]
pub struct InMemoryAuditStore {
    events: Mutex<Vec<AuditEvent>>,
}

impl InMemoryAuditStore {
    pub fn len(&self) -> usize {
        self.events.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.lock().is_empty()
    }
}

#[async_trait]
impl AuditStore for InMemoryAuditStore {
    async fn append(&self, event: &AuditEvent) -> Result<(), AuditError> {
        self.events.lock().push(event.clone());
        Ok(())
    }

    async fn find_by_request(
        &self,
        request_id: &RequestId,
    ) -> Result<Option<AuditEvent>, AuditError> {
        Ok(self
            .events
            .lock()
            .iter()
            .find(|event| &event.request_id == request_id)
            .cloned())
    }

    async fn read_all(&self) -> Result<Vec<AuditEvent>, AuditError> {
        Ok(self.events.lock().clone())
    }
}
