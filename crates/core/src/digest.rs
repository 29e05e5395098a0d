//! Digest algorithms and incremental digesters.

use serde::{Deserialize, Serialize};
use sha2::{Digest as _, Sha256, Sha384, Sha512};
use std::fmt;
use std::io::Read;
use std::path::Path;
use std::str::FromStr;

/// Digest algorithm recorded alongside every stored object and TAR entry.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DigestType {
    #[serde(rename = "SHA-256")]
    Sha256,
    #[serde(rename = "SHA-384")]
    Sha384,
    #[default]
    #[serde(rename = "SHA-512")]
    Sha512,
}

impl DigestType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Sha256 => "SHA-256",
            Self::Sha384 => "SHA-384",
            Self::Sha512 => "SHA-512",
        }
    }

    /// Length of the hex encoding of a digest of this type.
    pub fn hex_len(&self) -> usize {
        match self {
            Self::Sha256 => 64,
            Self::Sha384 => 96,
            Self::Sha512 => 128,
        }
    }

    /// Create an incremental digester for this algorithm.
    pub fn digester(&self) -> Digester {
        Digester::new(*self)
    }

    /// Digest an in-memory buffer.
    pub fn digest_bytes(&self, data: &[u8]) -> String {
        let mut digester = self.digester();
        digester.update(data);
        digester.finalize_hex()
    }

    /// Digest a file by streaming it through the digester.
    pub fn digest_file(&self, path: &Path) -> crate::Result<String> {
        let mut file = std::fs::File::open(path)?;
        let mut digester = self.digester();
        let mut buf = vec![0u8; 64 * 1024];
        loop {
            let n = file.read(&mut buf)?;
            if n == 0 {
                break;
            }
            digester.update(&buf[..n]);
        }
        Ok(digester.finalize_hex())
    }

    /// Validate that `hex` looks like a digest of this type.
    pub fn validate_hex(&self, hex: &str) -> crate::Result<()> {
        if hex.len() != self.hex_len() {
            return Err(crate::Error::InvalidDigest(format!(
                "expected {} hex chars for {}, got {}",
                self.hex_len(),
                self.as_str(),
                hex.len()
            )));
        }
        if !hex.bytes().all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b)) {
            return Err(crate::Error::InvalidDigest(format!(
                "not a lowercase hex digest: {hex}"
            )));
        }
        Ok(())
    }
}

impl fmt::Display for DigestType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DigestType {
    type Err = crate::Error;

    fn from_str(s: &str) -> crate::Result<Self> {
        match s.to_ascii_uppercase().as_str() {
            "SHA-256" | "SHA256" => Ok(Self::Sha256),
            "SHA-384" | "SHA384" => Ok(Self::Sha384),
            "SHA-512" | "SHA512" => Ok(Self::Sha512),
            other => Err(crate::Error::UnknownDigestType(other.to_string())),
        }
    }
}

/// Incremental digester producing a lowercase hex digest.
pub struct Digester {
    inner: DigesterInner,
    bytes: u64,
}

enum DigesterInner {
    Sha256(Sha256),
    Sha384(Sha384),
    Sha512(Sha512),
}

impl Digester {
    pub fn new(digest_type: DigestType) -> Self {
        let inner = match digest_type {
            DigestType::Sha256 => DigesterInner::Sha256(Sha256::new()),
            DigestType::Sha384 => DigesterInner::Sha384(Sha384::new()),
            DigestType::Sha512 => DigesterInner::Sha512(Sha512::new()),
        };
        Self { inner, bytes: 0 }
    }

    /// Update the digester with data.
    pub fn update(&mut self, data: &[u8]) {
        self.bytes += data.len() as u64;
        match &mut self.inner {
            DigesterInner::Sha256(h) => h.update(data),
            DigesterInner::Sha384(h) => h.update(data),
            DigesterInner::Sha512(h) => h.update(data),
        }
    }

    /// Number of bytes fed so far.
    pub fn bytes_digested(&self) -> u64 {
        self.bytes
    }

    /// Finalize and return the digest as lowercase hex.
    pub fn finalize_hex(self) -> String {
        match self.inner {
            DigesterInner::Sha256(h) => to_hex(&h.finalize()),
            DigesterInner::Sha384(h) => to_hex(&h.finalize()),
            DigesterInner::Sha512(h) => to_hex(&h.finalize()),
        }
    }
}

fn to_hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}
