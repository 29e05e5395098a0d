//! Durable file writes from byte streams.

use crate::error::{StorageError, StorageResult};
use crate::traits::ByteStream;
use futures::StreamExt;
use std::path::{Path, PathBuf};
use tapevault_core::DigestType;
use tokio::fs;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use uuid::Uuid;

const READ_CHUNK_SIZE: usize = 64 * 1024;

/// Temporary sibling used while `path` is being written.
pub fn temp_path_for(path: &Path) -> PathBuf {
    let temp_name = format!(".tmp.{}", Uuid::new_v4());
    path.with_file_name(
        path.file_name()
            .map(|n| format!("{}{}", n.to_string_lossy(), temp_name))
            .unwrap_or(temp_name),
    )
}

/// Write `input` to `path` and return the digest of what was written.
///
/// Bytes go to a temporary sibling, are synced, and only then renamed over
/// `path`; the directory is synced after the rename. If the stream does not
/// yield exactly `size` bytes nothing is left behind and
/// [`StorageError::TransferCorrupted`] is returned.
pub async fn persist_stream(
    path: &Path,
    input: ByteStream,
    digest_type: DigestType,
    size: u64,
    object: &str,
) -> StorageResult<String> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).await?;
    }
    let temp_path = temp_path_for(path);

    let result = write_temp(&temp_path, input, digest_type, size, object).await;

    match result {
        Ok(digest) => {
            fs::rename(&temp_path, path).await?;
            sync_parent_dir(path).await?;
            Ok(digest)
        }
        Err(err) => {
            let _ = fs::remove_file(&temp_path).await;
            Err(err)
        }
    }
}

/// Sync the directory holding `path` so a rename into it is durable.
pub async fn sync_parent_dir(path: &Path) -> std::io::Result<()> {
    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    fs::File::open(dir).await?.sync_all().await
}

async fn write_temp(
    temp_path: &Path,
    mut input: ByteStream,
    digest_type: DigestType,
    size: u64,
    object: &str,
) -> StorageResult<String> {
    let mut file = fs::File::create(temp_path).await?;
    let mut digester = digest_type.digester();
    while let Some(chunk) = input.next().await {
        let chunk = chunk?;
        let received = digester.bytes_digested() + chunk.len() as u64;
        if received > size {
            return Err(StorageError::TransferCorrupted {
                object: object.to_string(),
                expected: size,
                actual: received,
            });
        }
        digester.update(&chunk);
        file.write_all(&chunk).await?;
    }
    if digester.bytes_digested() != size {
        return Err(StorageError::TransferCorrupted {
            object: object.to_string(),
            expected: size,
            actual: digester.bytes_digested(),
        });
    }
    file.sync_all().await?;
    Ok(digester.finalize_hex())
}

/// Digest of a whole file, read asynchronously.
pub async fn digest_path(path: &Path, digest_type: DigestType) -> StorageResult<(String, u64)> {
    let mut file = fs::File::open(path).await?;
    let mut digester = digest_type.digester();
    let mut buf = vec![0u8; READ_CHUNK_SIZE];
    loop {
        let n = file.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        digester.update(&buf[..n]);
    }
    let size = digester.bytes_digested();
    Ok((digester.finalize_hex(), size))
}

/// Reject names that would not map to exactly one file under the container.
pub fn validate_name(name: &str) -> StorageResult<()> {
    if name.is_empty()
        || name.starts_with('.')
        || name.contains(['/', '\\', '\0'])
        || name.contains(".tmp.")
    {
        return Err(StorageError::InvalidName(name.to_string()));
    }
    Ok(())
}

/// Map a `NotFound` I/O error to [`StorageError::NotFound`] for `what`.
pub fn not_found_as(what: &str) -> impl FnOnce(std::io::Error) -> StorageError + '_ {
    move |e| {
        if e.kind() == std::io::ErrorKind::NotFound {
            StorageError::NotFound(what.to_string())
        } else {
            StorageError::Io(e)
        }
    }
}
