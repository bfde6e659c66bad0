//! Per-operation authorization hook.
//!
//! The embedding application injects one policy into the authoritative
//! store at construction. A denial fails the operation synchronously,
//! before any mutation or persistence is attempted.

/// Capability interface checked on every read and write.
///
/// `key` is the empty string for whole-namespace operations (read-all,
/// clear).
pub trait AccessPolicy: Send + Sync {
    fn check(&self, namespace: &str, key: &str, write: bool) -> bool;
}

/// Permissive default policy.
#[derive(Debug, Clone, Copy, Default)]
pub struct AllowAll;

impl AccessPolicy for AllowAll {
    fn check(&self, _namespace: &str, _key: &str, _write: bool) -> bool {
        true
    }
}
