//! Offers implementing [`ContentAddressableStorage`](crate::ContentAddressableStorage)
//! without tape staging.

pub mod filesystem;
