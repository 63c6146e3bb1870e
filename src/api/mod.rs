//! HTTP API for remote instance control

mod server;
mod handlers;
mod types;

pub use server::{router, Server};
pub use types::*;
