//! Lumen CLI library - shared functionality for tests and the binary.

pub mod dumps;
pub mod profile;
