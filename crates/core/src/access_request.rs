//! Access request identifiers and statuses.

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Opaque ticket handed to callers staging tape-resident objects.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AccessRequestId(Uuid);

impl AccessRequestId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn parse(s: &str) -> crate::Result<Self> {
        Uuid::parse_str(s)
            .map(Self)
            .map_err(|e| crate::Error::InvalidAccessRequestId(format!("{s}: {e}")))
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for AccessRequestId {
    fn default() -> Self {
        Self::new()
    }
}

impl From<Uuid> for AccessRequestId {
    fn from(id: Uuid) -> Self {
        Self(id)
    }
}

impl fmt::Debug for AccessRequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "AccessRequestId({})", self.0)
    }
}

impl fmt::Display for AccessRequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AccessRequestStatus {
    /// Some archives are still on tape only.
    Pending,
    /// Everything is staged; objects can be read until expiration.
    Ready,
    /// Staged copies may have been evicted; create a new request.
    Expired,
    /// Unknown or already purged.
    NotFound,
}

impl AccessRequestStatus {
    pub fn is_ready(&self) -> bool {
        matches!(self, Self::Ready)
    }
}
