//! POSIX ustar headers.

use crate::error::{TarError, TarResult};
use tapevault_core::TAR_BLOCK_SIZE;
use tar::{EntryType, Header};

pub(crate) const BLOCK: usize = TAR_BLOCK_SIZE as usize;

/// Largest size an 11-digit octal size field can hold.
pub const MAX_ENTRY_SIZE: u64 = 0o77_777_777_777;

/// Size rounded up to a whole number of blocks.
pub fn padded_size(size: u64) -> u64 {
    size.div_ceil(TAR_BLOCK_SIZE) * TAR_BLOCK_SIZE
}

/// Build the header block of a regular file entry.
pub(crate) fn build(name: &str, size: u64, mtime: i64) -> TarResult<[u8; BLOCK]> {
    let invalid = |reason: String| TarError::InvalidEntry {
        entry: name.to_string(),
        reason,
    };
    if size > MAX_ENTRY_SIZE {
        return Err(invalid(format!("size {size} exceeds {MAX_ENTRY_SIZE}")));
    }
    if name.is_empty() {
        return Err(invalid("empty entry name".to_string()));
    }

    let mut header = Header::new_ustar();
    // Long names are split into prefix + '/' + name; fails past 255 bytes.
    header
        .set_path(name)
        .map_err(|e| invalid(format!("name rejected by ustar header: {e}")))?;
    header.set_size(size);
    header.set_mode(0o644);
    header.set_uid(0);
    header.set_gid(0);
    header.set_mtime(u64::try_from(mtime).unwrap_or(0));
    header.set_entry_type(EntryType::Regular);
    header.set_cksum();
    Ok(*header.as_bytes())
}

/// Name and size of a parsed header block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct ParsedHeader {
    pub name: String,
    pub size: u64,
}

/// Parse a header block. `None` for the all-zero end-of-archive block.
pub(crate) fn parse(block: &[u8; BLOCK], offset: u64) -> TarResult<Option<ParsedHeader>> {
    if block.iter().all(|b| *b == 0) {
        return Ok(None);
    }
    let invalid = |reason: String| TarError::InvalidHeader { offset, reason };

    let header = Header::from_byte_slice(block);
    let stored = header
        .cksum()
        .map_err(|e| invalid(format!("bad checksum field: {e}")))?;
    let mut recomputed = header.clone();
    recomputed.set_cksum();
    let computed = recomputed
        .cksum()
        .map_err(|e| invalid(format!("bad checksum field: {e}")))?;
    if stored != computed {
        return Err(invalid(format!("checksum {stored} does not match {computed}")));
    }

    let size = header
        .entry_size()
        .map_err(|e| invalid(format!("bad size field: {e}")))?;
    let name = header
        .path()
        .map_err(|e| invalid(format!("bad name field: {e}")))?
        .to_string_lossy()
        .into_owned();
    Ok(Some(ParsedHeader { name, size }))
}
