//! Common types shared by the access scheduler crates and the proxy service

mod error;
mod secret;

pub use error::{Error, Result};
pub use secret::Secret;
