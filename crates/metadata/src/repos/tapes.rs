//! Tape catalog repository.

use crate::error::MetadataResult;
use async_trait::async_trait;
use serde_json::{Map, Value};
use std::collections::HashMap;
use tapevault_core::{QueryCriteria, TapeCatalog, TapeState};

/// Persistent inventory of cartridges.
///
/// Writes bump `version`. Plain writes are not conditioned on a previously
/// observed version; only the drive transfers below check the location they
/// move the tape from.
#[async_trait]
pub trait TapeCatalogRepo: Send + Sync {
    /// Register a tape. Its version is reset to 0.
    async fn create_tape(&self, tape: &TapeCatalog) -> MetadataResult<()>;

    /// Overwrite a tape document. Returns whether exactly one tape matched.
    async fn replace_tape(&self, tape: &TapeCatalog) -> MetadataResult<bool>;

    /// Apply a partial update and bump the version in one statement.
    ///
    /// Keys are tape field names (dotted for nested fields). Fails on an
    /// empty map. Returns whether exactly one tape matched.
    async fn update_tape(&self, id: &str, fields: &Map<String, Value>) -> MetadataResult<bool>;

    /// All tapes matching every criterion. Fails on empty criteria.
    async fn find_tapes(&self, criteria: &[QueryCriteria]) -> MetadataResult<Vec<TapeCatalog>>;

    async fn find_tape_by_id(&self, id: &str) -> MetadataResult<Option<TapeCatalog>>;

    async fn find_tape_by_code(&self, code: &str) -> MetadataResult<Option<TapeCatalog>>;

    /// Record `code` as loaded into `drive` unless a drive already holds it.
    ///
    /// The location check and the write are one statement: of two drives
    /// claiming the same tape, exactly one gets `Some`. The previous location
    /// is kept as the tape's home. Fails with `NotFound` for an unknown code.
    async fn claim_tape_for_drive(
        &self,
        code: &str,
        drive: u32,
    ) -> MetadataResult<Option<TapeCatalog>>;

    /// Record `code` as moved from `drive` back to `slot`.
    ///
    /// Fails with `InvalidStateTransition` when the catalog does not show the
    /// tape in `drive`, and with `NotFound` for an unknown code.
    async fn release_tape_to_slot(
        &self,
        code: &str,
        drive: u32,
        slot: u32,
    ) -> MetadataResult<TapeCatalog>;

    /// Number of tapes per state. States without tapes are absent.
    async fn count_by_state(&self) -> MetadataResult<HashMap<TapeState, u64>>;
}
