//! Domain identifiers.
//!
//! Job ids are plain strings: callers may supply their own and backends
//! usually store them as text. Adapter-internal handles (leases, adapter
//! instances) are ULIDs wrapped in a phantom-typed `Id<T>` so they cannot be
//! mixed up with each other.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::marker::PhantomData;
use ulid::Ulid;

/// Identifier of a job, unique per queue.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(String);

impl JobId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_string(self) -> String {
        self.0
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for JobId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for JobId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl AsRef<str> for JobId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Marker trait providing the display prefix of an [`Id`].
pub trait IdMarker: Send + Sync + 'static {
    fn prefix() -> &'static str;
}

/// ULID-backed identifier, typed by marker `T`.
#[repr(transparent)]
#[derive(Debug, Serialize, Deserialize)]
pub struct Id<T: IdMarker> {
    ulid: Ulid,
    #[serde(skip)]
    _marker: PhantomData<T>,
}

// Manual impls: derives would put bounds on `T`.
impl<T: IdMarker> Clone for Id<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T: IdMarker> Copy for Id<T> {}

impl<T: IdMarker> PartialEq for Id<T> {
    fn eq(&self, other: &Self) -> bool {
        self.ulid == other.ulid
    }
}

impl<T: IdMarker> Eq for Id<T> {}

impl<T: IdMarker> std::hash::Hash for Id<T> {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.ulid.hash(state);
    }
}

impl<T: IdMarker> Id<T> {
    pub fn new() -> Self {
        Self::from_ulid(Ulid::new())
    }

    pub fn from_ulid(ulid: Ulid) -> Self {
        Self {
            ulid,
            _marker: PhantomData,
        }
    }

    pub fn as_ulid(&self) -> Ulid {
        self.ulid
    }
}

impl<T: IdMarker> Default for Id<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: IdMarker> From<Ulid> for Id<T> {
    fn from(ulid: Ulid) -> Self {
        Self::from_ulid(ulid)
    }
}

impl<T: IdMarker> fmt::Display for Id<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", T::prefix(), self.ulid)
    }
}

/// Lease marker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Lease {}

impl IdMarker for Lease {
    fn prefix() -> &'static str {
        "lease-"
    }
}

/// Adapter instance marker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Instance {}

impl IdMarker for Instance {
    fn prefix() -> &'static str {
        "provider-"
    }
}

/// Identifier of one checkout of a job.
pub type LeaseId = Id<Lease>;

/// Identifier of an adapter instance; leases are only valid on their issuer.
pub type InstanceId = Id<Instance>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn job_id_is_transparent_string() {
        let id = JobId::new("email-42");
        assert_eq!(serde_json::to_string(&id).unwrap(), "\"email-42\"");
        assert_eq!(id.to_string(), "email-42");
    }

    #[test]
    fn typed_ids_have_prefixes() {
        let lease = LeaseId::new();
        let instance = InstanceId::new();
        assert!(lease.to_string().starts_with("lease-"));
        assert!(instance.to_string().starts_with("provider-"));
        // let _: LeaseId = instance; // <- does not compile
    }

    #[test]
    fn phantom_data_does_not_consume_memory() {
        assert_eq!(std::mem::size_of::<LeaseId>(), std::mem::size_of::<Ulid>());
    }
}
