#![doc = "Common types shared across the time-warp workspace."]

pub mod config;
pub mod error;
pub mod source;

pub use config::*;
pub use error::*;
pub use source::*;
