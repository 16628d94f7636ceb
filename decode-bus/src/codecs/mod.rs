//! Codec adapters shipped with the crate.

pub mod raw;
