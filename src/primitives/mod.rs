//! Low-level primitives the logs and the store are built from.
//!
//! Includes positioned file I/O, file naming and discovery, the codec strategy,
//! and the commit lock with its version counter.

/// Payload codecs plugged into resources at registration time.
pub mod codec;

/// Commit serialization and the durable version counter.
pub mod concurrency;

/// File naming, discovery and directory-level durability helpers.
pub mod fs;

/// Positioned file I/O.
pub mod io;
