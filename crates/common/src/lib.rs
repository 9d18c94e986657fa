//! Shared types for the API pipeline crates and the probe binary

mod error;
mod secret;

pub use error::{Error, Result};
pub use secret::Secret;
