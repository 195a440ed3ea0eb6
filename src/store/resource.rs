#![forbid(unsafe_code)]

use std::fmt;
use std::sync::Arc;

use crate::log::{LogIter, LogKind};
use crate::primitives::codec::Codec;
use crate::types::{Result, StorageLocation};

/// Typed handle to a registered resource.
///
/// Returned by the loader's registration methods and passed to the store and
/// its transactions; the codec travels with the handle.
pub struct Resource<C> {
    key: Arc<str>,
    kind: LogKind,
    codec: Arc<C>,
}

impl<C> Clone for Resource<C> {
    fn clone(&self) -> Self {
        Self {
            key: Arc::clone(&self.key),
            kind: self.kind,
            codec: Arc::clone(&self.codec),
        }
    }
}

impl<C> fmt::Debug for Resource<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Resource")
            .field("key", &self.key)
            .field("kind", &self.kind)
            .finish()
    }
}

impl<C: Codec> Resource<C> {
    pub(crate) fn new(key: &str, kind: LogKind, codec: C) -> Self {
        Self {
            key: Arc::from(key),
            kind,
            codec: Arc::new(codec),
        }
    }

    /// Resource name.
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Backend kind.
    pub fn kind(&self) -> LogKind {
        self.kind
    }

    /// Codec used for this resource's records.
    pub fn codec(&self) -> &C {
        &self.codec
    }
}

/// Decoding iterator over a resource's committed records.
pub struct Entries<C: Codec> {
    inner: LogIter,
    codec: Arc<C>,
}

impl<C: Codec> Entries<C> {
    pub(crate) fn new(inner: LogIter, resource: &Resource<C>) -> Self {
        Self {
            inner,
            codec: Arc::clone(&resource.codec),
        }
    }

    /// Yields each value together with its location.
    pub fn located(self) -> impl Iterator<Item = Result<(StorageLocation, C::Item)>> {
        let codec = self.codec;
        self.inner.map(move |record| {
            let record = record?;
            Ok((record.location, codec.decode(&record.payload)?))
        })
    }
}

impl<C: Codec> Iterator for Entries<C> {
    type Item = Result<C::Item>;

    fn next(&mut self) -> Option<Self::Item> {
        let record = self.inner.next()?;
        Some(record.and_then(|record| self.codec.decode(&record.payload)))
    }
}
