//! # prefsync-core — typed preference values
//!
//! The process-local half of the preference sync stack: the six-kind
//! value model, the lossless string codec used on the wire and in
//! storage, and the access-policy seam checked by the authoritative
//! store.
//!
//! ## Modules
//!
//! - [`value`] — `PrefType` / `PrefValue` tagged union and codec
//! - [`access`] — pluggable per-operation authorization hook

pub mod access;
pub mod value;

pub use access::{AccessPolicy, AllowAll};
pub use value::{FormatError, PrefType, PrefValue};
