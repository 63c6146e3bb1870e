//! Data models

mod instance;
mod log;

pub use instance::*;
pub use log::*;
