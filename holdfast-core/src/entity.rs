//! Entity contract for repository-managed records.

use crate::Result;
use bytes::Bytes;

/// A persistent, individually locked record managed by a repository.
///
/// Implementors are mutable in place and round-trip through an opaque byte
/// string: decoding the bytes produced by [`encode`](Entity::encode) into a
/// default-constructed instance must yield the same bytes on re-encode.
///
/// The repository wraps each resident entity in a shared reader/writer lock
/// and only ever hands out scoped guards; [`encode`](Entity::encode) is
/// called under at least a read hold, [`decode`](Entity::decode) under a
/// write hold.
///
/// ```rust
/// use bytes::Bytes;
/// use holdfast_core::{Entity, Error};
///
/// #[derive(Default)]
/// struct Counter {
///     value: u64,
/// }
///
/// impl Entity for Counter {
///     fn encode(&self) -> Bytes {
///         Bytes::copy_from_slice(&self.value.to_le_bytes())
///     }
///
///     fn decode(&mut self, raw: &[u8]) -> holdfast_core::Result<()> {
///         let bytes = raw.try_into().map_err(|_| Error::Codec {
///             message: format!("expected 8 bytes, got {}", raw.len()),
///         })?;
///         self.value = u64::from_le_bytes(bytes);
///         Ok(())
///     }
/// }
/// ```
pub trait Entity: Default + Send + Sync + 'static {
    /// Encode the entity into an opaque byte string.
    fn encode(&self) -> Bytes;

    /// Decode the entity in place from a byte string previously produced by
    /// [`encode`](Entity::encode).
    ///
    /// # Errors
    /// Returns a codec error when `raw` is not a valid encoding; the
    /// repository treats that as "entity not found".
    fn decode(&mut self, raw: &[u8]) -> Result<()>;
}
