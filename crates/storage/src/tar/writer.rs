//! Append-only TAR writer with a durable side index.
//!
//! Each entry is written, padded and synced to disk before its index line is
//! appended to `<tar>.idx`. Anything past the last indexed entry is therefore
//! never referenced, and [`TarAppender::recover`] truncates it away.

use super::header::{self, BLOCK, padded_size};
use crate::error::{TarError, TarResult};
use std::fs::{File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use tapevault_core::{DigestType, TarEntryDescription};
use time::OffsetDateTime;
use tracing::{debug, info, warn};

const COPY_BUFFER_SIZE: usize = 64 * 1024;
const END_OF_ARCHIVE: [u8; 2 * BLOCK] = [0u8; 2 * BLOCK];

/// Path of the index file kept next to a TAR.
pub fn index_path(tar_path: &Path) -> PathBuf {
    let mut name = tar_path.as_os_str().to_os_string();
    name.push(".idx");
    PathBuf::from(name)
}

/// A TAR closed with its end-of-archive marker.
#[derive(Debug, Clone)]
pub struct SealedTar {
    pub tar_id: String,
    pub path: PathBuf,
    pub size: u64,
    pub digest: String,
    pub digest_type: DigestType,
    pub entries: Vec<TarEntryDescription>,
}

/// Writer for one TAR container being built on disk.
pub struct TarAppender {
    tar_id: String,
    path: PathBuf,
    file: File,
    index: File,
    index_len: u64,
    position: u64,
    max_size: u64,
    entries: Vec<TarEntryDescription>,
}

impl TarAppender {
    /// Start a new, empty TAR. Fails if `path` already exists.
    pub fn create(
        path: impl Into<PathBuf>,
        tar_id: impl Into<String>,
        max_size: u64,
    ) -> TarResult<Self> {
        let path = path.into();
        let file = OpenOptions::new().write(true).create_new(true).open(&path)?;
        let index = OpenOptions::new()
            .create(true)
            .truncate(true)
            .write(true)
            .open(index_path(&path))?;
        Ok(Self {
            tar_id: tar_id.into(),
            path,
            file,
            index,
            index_len: 0,
            position: 0,
            max_size,
            entries: Vec::new(),
        })
    }

    /// Reopen a TAR left behind by a previous run.
    ///
    /// Keeps the longest prefix of index lines that are complete and describe
    /// contiguous entries present on disk, then truncates both the TAR and the
    /// index to that prefix. An end-of-archive marker, if any, is dropped too.
    pub fn recover(
        path: impl Into<PathBuf>,
        tar_id: impl Into<String>,
        max_size: u64,
    ) -> TarResult<Self> {
        let path = path.into();
        let tar_id = tar_id.into();
        let idx_path = index_path(&path);

        let raw_index = match std::fs::read(&idx_path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == io::ErrorKind::NotFound => Vec::new(),
            Err(e) => return Err(e.into()),
        };
        let file = OpenOptions::new().read(true).write(true).open(&path)?;
        let file_len = file.metadata()?.len();

        let mut entries: Vec<TarEntryDescription> = Vec::new();
        let mut index_len = 0usize;
        let mut durable_end = 0u64;
        for line in raw_index.split_inclusive(|b| *b == b'\n') {
            if !line.ends_with(b"\n") {
                break;
            }
            let Ok(entry) = serde_json::from_slice::<TarEntryDescription>(line) else {
                break;
            };
            let expected_start = durable_end + BLOCK as u64;
            let end = expected_start + padded_size(entry.size);
            if entry.tar_id != tar_id || entry.start_pos != expected_start || end > file_len {
                break;
            }
            durable_end = end;
            index_len += line.len();
            entries.push(entry);
        }

        if durable_end < file_len {
            warn!(
                tar_id = %tar_id,
                durable_end,
                file_len,
                "truncating TAR past its last indexed entry"
            );
        }
        file.set_len(durable_end)?;
        file.sync_all()?;

        let index = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(false)
            .open(&idx_path)?;
        index.set_len(index_len as u64)?;
        index.sync_all()?;

        let mut appender = Self {
            tar_id,
            path,
            file,
            index,
            index_len: index_len as u64,
            position: durable_end,
            max_size,
            entries,
        };
        appender.file.seek(SeekFrom::Start(durable_end))?;
        appender.index.seek(SeekFrom::End(0))?;
        info!(
            tar_id = %appender.tar_id,
            entries = appender.entries.len(),
            size = durable_end,
            "recovered TAR"
        );
        Ok(appender)
    }

    pub fn tar_id(&self) -> &str {
        &self.tar_id
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn entries(&self) -> &[TarEntryDescription] {
        &self.entries
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Bytes written so far, end-of-archive marker excluded.
    pub fn position(&self) -> u64 {
        self.position
    }

    /// Whether an entry of `size` bytes still fits, leaving room for the end marker.
    pub fn fits(&self, size: u64) -> bool {
        self.position + BLOCK as u64 + padded_size(size) + END_OF_ARCHIVE.len() as u64
            <= self.max_size
    }

    /// Append exactly `size` bytes read from `input` as one entry.
    ///
    /// The returned descriptor is already durable. On error the TAR is cut
    /// back to its previous length.
    pub fn append(
        &mut self,
        entry_name: &str,
        input: &mut impl Read,
        size: u64,
        digest_type: DigestType,
    ) -> TarResult<TarEntryDescription> {
        if !self.fits(size) {
            return Err(TarError::InvalidEntry {
                entry: entry_name.to_string(),
                reason: format!(
                    "{size} bytes do not fit in TAR {} at offset {}",
                    self.tar_id, self.position
                ),
            });
        }

        let start = self.position;
        match self.write_entry(entry_name, input, size, digest_type) {
            Ok(entry) => Ok(entry),
            Err(err) => {
                if let Err(rollback) = self.rollback(start) {
                    warn!(tar_id = %self.tar_id, error = %rollback, "could not roll back TAR");
                }
                Err(err)
            }
        }
    }

    fn write_entry(
        &mut self,
        entry_name: &str,
        input: &mut impl Read,
        size: u64,
        digest_type: DigestType,
    ) -> TarResult<TarEntryDescription> {
        let mtime = OffsetDateTime::now_utc().unix_timestamp();
        let header = header::build(entry_name, size, mtime)?;
        self.file.write_all(&header)?;

        let mut digester = digest_type.digester();
        let mut buf = vec![0u8; COPY_BUFFER_SIZE];
        let mut remaining = size;
        while remaining > 0 {
            let want = remaining.min(buf.len() as u64) as usize;
            let n = input.read(&mut buf[..want])?;
            if n == 0 {
                return Err(TarError::InvalidEntry {
                    entry: entry_name.to_string(),
                    reason: format!("input ended after {} of {size} bytes", size - remaining),
                });
            }
            digester.update(&buf[..n]);
            self.file.write_all(&buf[..n])?;
            remaining -= n as u64;
        }
        let padding = (padded_size(size) - size) as usize;
        self.file.write_all(&[0u8; BLOCK][..padding])?;
        self.file.sync_data()?;

        let entry = TarEntryDescription {
            tar_id: self.tar_id.clone(),
            entry_name: entry_name.to_string(),
            start_pos: self.position + BLOCK as u64,
            size,
            digest: digester.finalize_hex(),
            digest_type,
        };
        let mut line = serde_json::to_vec(&entry)
            .map_err(|e| TarError::InvalidIndex(e.to_string()))?;
        line.push(b'\n');
        self.index.write_all(&line)?;
        self.index.sync_data()?;
        self.index_len += line.len() as u64;

        self.position += BLOCK as u64 + padded_size(size);
        self.entries.push(entry.clone());
        debug!(tar_id = %self.tar_id, entry = entry_name, size, "appended TAR entry");
        Ok(entry)
    }

    fn rollback(&mut self, position: u64) -> io::Result<()> {
        self.file.set_len(position)?;
        self.file.seek(SeekFrom::Start(position))?;
        self.index.set_len(self.index_len)?;
        self.index.seek(SeekFrom::Start(self.index_len))?;
        Ok(())
    }

    /// Write the end-of-archive marker and digest the whole file.
    ///
    /// The index is left in place: drop it with [`discard_index`] once the
    /// entries are recorded elsewhere.
    pub fn finalize(mut self, digest_type: DigestType) -> TarResult<SealedTar> {
        self.file.write_all(&END_OF_ARCHIVE)?;
        self.file.sync_all()?;
        let size = self.position + END_OF_ARCHIVE.len() as u64;

        let mut reader = File::open(&self.path)?;
        let mut digester = digest_type.digester();
        let mut buf = vec![0u8; COPY_BUFFER_SIZE];
        loop {
            let n = reader.read(&mut buf)?;
            if n == 0 {
                break;
            }
            digester.update(&buf[..n]);
        }

        info!(tar_id = %self.tar_id, size, entries = self.entries.len(), "sealed TAR");
        Ok(SealedTar {
            tar_id: self.tar_id,
            path: self.path,
            size,
            digest: digester.finalize_hex(),
            digest_type,
            entries: self.entries,
        })
    }
}

/// Remove the index of a sealed TAR. Missing index is fine.
pub fn discard_index(tar_path: &Path) -> io::Result<()> {
    match std::fs::remove_file(index_path(tar_path)) {
        Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e),
        _ => Ok(()),
    }
}
