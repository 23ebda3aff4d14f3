//! Abstractions over crypto hash digest algorithms.

use std::fmt::{Debug, Formatter};

use serde::{Deserialize, Serialize};

use crate::bft::error::*;

mod ring_sha2;

/// The type `Context` represents an on-going hash digest calculation.
pub struct Context {
    inner: ring_sha2::Context,
}

/// Represents a hash digest.
#[derive(Hash, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
#[repr(transparent)]
pub struct Digest {
    inner: ring_sha2::Digest,
}

impl Context {
    /// Initializes a new `Context` instance.
    ///
    /// Feed this it data with `Context::update`.
    pub fn new() -> Self {
        let inner = ring_sha2::Context::new();
        Context { inner }
    }

    /// Feeds the `Context` some data to be hashed.
    pub fn update(&mut self, data: &[u8]) {
        self.inner.update(data);
    }

    /// Extracts the resulting digest of hashing data onto the `Context`.
    pub fn finish(self) -> Digest {
        let inner = self.inner.finish();
        Digest { inner }
    }
}

impl Default for Context {
    fn default() -> Self {
        Context::new()
    }
}

impl Digest {
    /// The length of the `Digest` in bytes.
    pub const LENGTH: usize = ring_sha2::Digest::LENGTH;

    /// Constructs a `Digest` from a byte buffer of appropriate size.
    pub fn from_bytes(raw_bytes: &[u8]) -> Result<Self> {
        let inner = ring_sha2::Digest::from_bytes(raw_bytes)?;
        Ok(Digest { inner })
    }
}

impl AsRef<[u8]> for Digest {
    fn as_ref(&self) -> &[u8] {
        self.inner.as_ref()
    }
}

impl Debug for Digest {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:x?}", self.inner.as_ref().chunks(4).next().unwrap())
    }
}
