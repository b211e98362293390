//! Adapters implementing the domain ports: in-memory and RocksDB storage,
//! plus sandbox stand-ins for the settlement network and treasury.

pub mod in_memory;
#[cfg(feature = "storage-rocksdb")]
pub mod rocksdb;
pub mod sandbox;
