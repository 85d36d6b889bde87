use std::any::Any;
use std::sync::Arc;

use serde::Serialize;
use serde_json::{Map, Value};

/// A type-erased, thread-safe container.
pub type Dynamic = Arc<dyn Any + Send + Sync>;

/// Atomic reference-counted string type used for output and input names.
pub type ArcStr = Arc<str>;

/// A 32-byte BLAKE3 hash used for parameter fingerprints and artifact
/// content hashes.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub(crate) struct Hash32([u8; 32]);

impl<T> From<T> for Hash32
where
    T: Into<[u8; 32]>,
{
    fn from(value: T) -> Self {
        Hash32(value.into())
    }
}

impl Hash32 {
    pub(crate) fn hash(buffer: impl AsRef<[u8]>) -> Self {
        blake3::Hasher::new()
            .update(buffer.as_ref())
            .finalize()
            .into()
    }

    pub(crate) fn hash_file(path: impl AsRef<std::path::Path>) -> std::io::Result<Self> {
        Ok(blake3::Hasher::new().update_mmap(path)?.finalize().into())
    }

    pub(crate) fn to_hex(self) -> String {
        const HEX: &[u8; 16] = b"0123456789abcdef";
        let mut acc = String::with_capacity(64);

        for &byte in self.0.iter() {
            acc.push(HEX[(byte >> 4) as usize] as char);
            acc.push(HEX[(byte & 0xF) as usize] as char);
        }

        acc
    }
}

impl std::fmt::Debug for Hash32 {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Hash32({})", self.to_hex())
    }
}

/// Deterministic, order-independent encoding of a set of named parameters.
///
/// Parameters are first converted to a JSON value, which sorts object keys,
/// so two parameter sets that only differ in field or insertion order hash
/// to the same fingerprint. The fingerprint is embedded in artifact
/// filenames and recorded in the sidecar next to every artifact.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Fingerprint(Hash32);

impl Fingerprint {
    /// Number of hex characters used when a fingerprint is put in a filename.
    pub const SHORT: usize = 16;

    /// Fingerprint a single serializable value.
    pub fn of<T: Serialize + ?Sized>(params: &T) -> serde_json::Result<Self> {
        let value = serde_json::to_value(params)?;
        Ok(Self::of_value(&value))
    }

    /// Fingerprint an already canonicalized set of named parameters.
    pub fn of_map(params: &Map<String, Value>) -> Self {
        Self::of_value(&Value::Object(params.clone()))
    }

    fn of_value(value: &Value) -> Self {
        // `Value` serializes object keys in sorted order.
        let canonical = value.to_string();
        Self(Hash32::hash(canonical))
    }

    /// Full 64 character hex form, as stored in sidecars.
    pub fn to_hex(self) -> String {
        self.0.to_hex()
    }

    /// Truncated hex form used in filenames.
    pub fn short(self) -> String {
        let mut hex = self.0.to_hex();
        hex.truncate(Self::SHORT);
        hex
    }
}

impl std::fmt::Debug for Fingerprint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Fingerprint({})", self.short())
    }
}

impl std::fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.short())
    }
}
