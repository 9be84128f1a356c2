//! Shared types for the Isoforge live ISO editor.

mod error;

pub use error::{IsoforgeError, IsoforgeResult};
