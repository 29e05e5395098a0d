//! Shared fixtures for storage integration tests.

use std::io::Cursor;
use std::path::{Path, PathBuf};
use tapevault_core::{DigestType, TarEntryDescription};
use tapevault_storage::tar::TarAppender;

/// Deterministic stream of payloads of varying sizes.
pub struct Payloads {
    state: u64,
}

impl Payloads {
    pub fn new(seed: u64) -> Self {
        Self {
            state: seed.wrapping_mul(0x9e37_79b9_7f4a_7c15) | 1,
        }
    }

    fn next_u64(&mut self) -> u64 {
        self.state ^= self.state << 7;
        self.state ^= self.state >> 9;
        self.state
    }

    pub fn take(mut self, count: usize) -> Vec<Vec<u8>> {
        (0..count)
            .map(|_| {
                let size = (self.next_u64() % 10_000) as usize;
                (0..size).map(|_| self.next_u64() as u8).collect()
            })
            .collect()
    }
}

/// Write `data` as consecutive entries of a sealed TAR.
pub fn write_tar(
    dir: &Path,
    tar_id: &str,
    data: &[Vec<u8>],
) -> (PathBuf, Vec<TarEntryDescription>) {
    let path = dir.join(tar_id);
    let mut tar = TarAppender::create(&path, tar_id, 1 << 24).unwrap();
    let entries = data
        .iter()
        .enumerate()
        .map(|(i, d)| {
            let size = d.len() as u64;
            tar.append(&format!("entry-{i}"), &mut Cursor::new(d), size, DigestType::Sha256)
                .unwrap()
        })
        .collect();
    tar.finalize(DigestType::Sha512).unwrap();
    (path, entries)
}
