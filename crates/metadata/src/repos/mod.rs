//! Repository traits for metadata operations.

pub mod access_requests;
pub mod archives;
pub mod objects;
pub mod queue;
pub mod tapes;

pub use access_requests::AccessRequestRepo;
pub use archives::ArchiveReferentialRepo;
pub use objects::ObjectReferentialRepo;
pub use queue::QueueRepo;
pub use tapes::TapeCatalogRepo;
