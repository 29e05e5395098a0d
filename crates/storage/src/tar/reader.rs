//! Random-access reads of TAR entries by recorded offset.

use super::header::{self, BLOCK};
use crate::error::{StorageError, TarError, TarResult};
use crate::traits::ByteStream;
use bytes::Bytes;
use std::fs::File;
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use tapevault_core::TarEntryDescription;
use tokio::io::{AsyncReadExt, AsyncSeekExt};

const COPY_BUFFER_SIZE: usize = 64 * 1024;

/// Entry found by walking the headers of a TAR.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScannedEntry {
    pub name: String,
    pub start_pos: u64,
    pub size: u64,
}

/// Read one entry into memory.
pub fn read_entry(
    tar_path: &Path,
    entry: &TarEntryDescription,
    verify: bool,
) -> TarResult<Vec<u8>> {
    let mut data = Vec::with_capacity(entry.size as usize);
    copy_entry(tar_path, entry, verify, &mut data)?;
    Ok(data)
}

/// Copy one entry to `out`.
///
/// With `verify`, the digest of the bytes read is compared to the recorded
/// one after the copy; on [`TarError::Corruption`] whatever reached `out`
/// must be discarded.
pub fn copy_entry(
    tar_path: &Path,
    entry: &TarEntryDescription,
    verify: bool,
    out: &mut impl Write,
) -> TarResult<u64> {
    let mut file = File::open(tar_path)?;
    check_range(&file, entry)?;
    check_header(&mut file, entry)?;

    file.seek(SeekFrom::Start(entry.start_pos))?;
    let mut digester = entry.digest_type.digester();
    let mut input = file.take(entry.size);
    let mut buf = vec![0u8; COPY_BUFFER_SIZE];
    let mut copied = 0u64;
    loop {
        let n = input.read(&mut buf)?;
        if n == 0 {
            break;
        }
        if verify {
            digester.update(&buf[..n]);
        }
        out.write_all(&buf[..n])?;
        copied += n as u64;
    }
    if copied != entry.size {
        return Err(TarError::OutOfRange {
            entry: entry.entry_name.clone(),
            end: entry.end_pos(),
            len: entry.start_pos + copied,
        });
    }
    if verify {
        let actual = digester.finalize_hex();
        if actual != entry.digest {
            return Err(TarError::Corruption {
                entry: entry.entry_name.clone(),
                expected: entry.digest.clone(),
                actual,
            });
        }
    }
    Ok(copied)
}

fn check_range(file: &File, entry: &TarEntryDescription) -> TarResult<()> {
    let len = file.metadata()?.len();
    if entry.start_pos < BLOCK as u64 || entry.end_pos() > len {
        return Err(TarError::OutOfRange {
            entry: entry.entry_name.clone(),
            end: entry.end_pos(),
            len,
        });
    }
    Ok(())
}

fn check_header(file: &mut File, entry: &TarEntryDescription) -> TarResult<()> {
    let offset = entry.start_pos - BLOCK as u64;
    file.seek(SeekFrom::Start(offset))?;
    let mut block = [0u8; BLOCK];
    file.read_exact(&mut block)?;
    match header::parse(&block, offset)? {
        Some(h) if h.size == entry.size => Ok(()),
        Some(h) => Err(TarError::InvalidHeader {
            offset,
            reason: format!("header size {} but entry size {}", h.size, entry.size),
        }),
        None => Err(TarError::InvalidHeader {
            offset,
            reason: "end-of-archive block where an entry header was expected".to_string(),
        }),
    }
}

/// Walk the headers of a TAR from the start up to the end-of-archive marker
/// (or the end of the file).
pub fn scan_entries(tar_path: &Path) -> TarResult<Vec<ScannedEntry>> {
    let file = File::open(tar_path)?;
    let len = file.metadata()?.len();
    let mut archive = tar::Archive::new(file);
    let mut entries = Vec::new();
    for entry in archive.entries()? {
        let entry = entry?;
        let name = entry.path()?.to_string_lossy().into_owned();
        let start_pos = entry.raw_file_position();
        let size = entry.size();
        // Checked before the iterator skips past the data.
        if start_pos + size > len {
            return Err(TarError::OutOfRange {
                entry: name,
                end: start_pos + size,
                len,
            });
        }
        entries.push(ScannedEntry {
            name,
            start_pos,
            size,
        });
    }
    Ok(entries)
}

/// Stream the concatenation of `entries`, each read from the TAR path paired
/// with it. Every entry digest is checked once its last byte has been read.
pub fn stream_entries(
    object: String,
    entries: Vec<(PathBuf, TarEntryDescription)>,
) -> ByteStream {
    let stream = async_stream::try_stream! {
        for (path, entry) in entries {
            let mut file = tokio::fs::File::open(&path).await?;
            let len = file.metadata().await?.len();
            if entry.end_pos() > len {
                Err::<(), _>(StorageError::from(TarError::OutOfRange {
                    entry: entry.entry_name.clone(),
                    end: entry.end_pos(),
                    len,
                }))?;
            }
            file.seek(SeekFrom::Start(entry.start_pos)).await?;

            let mut digester = entry.digest_type.digester();
            let mut remaining = entry.size;
            let mut buf = vec![0u8; COPY_BUFFER_SIZE];
            while remaining > 0 {
                let want = remaining.min(buf.len() as u64) as usize;
                let n = file.read(&mut buf[..want]).await?;
                if n == 0 {
                    Err::<(), _>(StorageError::from(TarError::OutOfRange {
                        entry: entry.entry_name.clone(),
                        end: entry.end_pos(),
                        len: entry.end_pos() - remaining,
                    }))?;
                }
                digester.update(&buf[..n]);
                remaining -= n as u64;
                yield Bytes::copy_from_slice(&buf[..n]);
            }
            let actual = digester.finalize_hex();
            if actual != entry.digest {
                Err::<(), _>(StorageError::Corruption {
                    object: object.clone(),
                    expected: entry.digest.clone(),
                    actual,
                })?;
            }
        }
    };
    Box::pin(stream)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tar::TarAppender;
    use futures::StreamExt;
    use std::io::Cursor;
    use tapevault_core::DigestType;

    /// Deterministic pseudo-random sizes and contents.
    fn payloads() -> Vec<Vec<u8>> {
        let mut seed = 0x2545_f491_u32;
        let mut next = move || {
            seed ^= seed << 13;
            seed ^= seed >> 17;
            seed ^= seed << 5;
            seed
        };
        (0..12)
            .map(|_| {
                let size = (next() % 5000) as usize;
                (0..size).map(|_| next() as u8).collect()
            })
            .collect()
    }

    fn build(dir: &Path) -> (PathBuf, Vec<TarEntryDescription>, Vec<Vec<u8>>) {
        let path = dir.join("t.tar");
        let data = payloads();
        let mut tar = TarAppender::create(&path, "t.tar", 1 << 20).unwrap();
        let entries = data
            .iter()
            .enumerate()
            .map(|(i, d)| {
                let size = d.len() as u64;
                tar.append(&format!("e{i}"), &mut Cursor::new(d), size, DigestType::Sha256)
                    .unwrap()
            })
            .collect();
        tar.finalize(DigestType::Sha512).unwrap();
        (path, entries, data)
    }

    #[test]
    fn test_entries_read_back_identical() {
        let dir = tempfile::tempdir().unwrap();
        let (path, entries, data) = build(dir.path());
        for (entry, expected) in entries.iter().zip(&data) {
            assert_eq!(&read_entry(&path, entry, true).unwrap(), expected);
        }
    }

    #[test]
    fn test_byte_flip_fails_only_that_entry() {
        let dir = tempfile::tempdir().unwrap();
        let (path, entries, _) = build(dir.path());
        let victim = entries.iter().position(|e| e.size > 0).unwrap();

        let mut raw = std::fs::read(&path).unwrap();
        let pos = (entries[victim].start_pos + entries[victim].size / 2) as usize;
        raw[pos] ^= 0xff;
        std::fs::write(&path, raw).unwrap();

        for (i, entry) in entries.iter().enumerate() {
            let result = read_entry(&path, entry, true);
            if i == victim {
                assert!(result.unwrap_err().is_corruption());
            } else {
                assert!(result.is_ok(), "entry {i} should still verify");
            }
        }
        // Without verification the altered bytes are returned as-is.
        assert!(read_entry(&path, &entries[victim], false).is_ok());
    }

    #[test]
    fn test_out_of_range_entry() {
        let dir = tempfile::tempdir().unwrap();
        let (path, entries, _) = build(dir.path());
        let mut entry = entries[0].clone();
        entry.start_pos = 1 << 30;
        assert!(matches!(
            read_entry(&path, &entry, true),
            Err(TarError::OutOfRange { .. })
        ));
    }

    #[test]
    fn test_wrong_offset_hits_header_check() {
        let dir = tempfile::tempdir().unwrap();
        let (path, entries, _) = build(dir.path());
        let mut entry = entries[1].clone();
        entry.start_pos += 512;
        assert!(matches!(
            read_entry(&path, &entry, true),
            Err(TarError::InvalidHeader { .. })
        ));
    }

    #[test]
    fn test_scan_matches_index() {
        let dir = tempfile::tempdir().unwrap();
        let (path, entries, _) = build(dir.path());
        let scanned = scan_entries(&path).unwrap();
        assert_eq!(scanned.len(), entries.len());
        for (s, e) in scanned.iter().zip(&entries) {
            assert_eq!(s.name, e.entry_name);
            assert_eq!(s.start_pos, e.start_pos);
            assert_eq!(s.size, e.size);
        }
    }

    #[test]
    fn test_scan_stops_at_truncated_data() {
        let dir = tempfile::tempdir().unwrap();
        let (path, entries, _) = build(dir.path());
        let victim = entries.iter().position(|e| e.size > 0).unwrap();
        let file = std::fs::OpenOptions::new().write(true).open(&path).unwrap();
        file.set_len(entries[victim].start_pos + entries[victim].size - 1).unwrap();

        match scan_entries(&path) {
            Err(TarError::OutOfRange { entry, .. }) => {
                assert_eq!(entry, entries[victim].entry_name)
            }
            other => panic!("expected OutOfRange, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_stream_entries_concatenates() {
        let dir = tempfile::tempdir().unwrap();
        let (path, entries, data) = build(dir.path());
        let parts: Vec<_> = entries[..3].iter().map(|e| (path.clone(), e.clone())).collect();
        let mut stream = stream_entries("obj".into(), parts);
        let mut out = Vec::new();
        while let Some(chunk) = stream.next().await {
            out.extend_from_slice(&chunk.unwrap());
        }
        assert_eq!(out, data[..3].concat());
    }
}
