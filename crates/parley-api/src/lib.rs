//! parley-api: client-side contract with the chat backend
//!
//! This crate provides the wire types of the conversation endpoints, the
//! incremental response protocol, and an HTTP/SSE implementation of the
//! [`Backend`] trait.

pub mod client;
pub mod error;
pub mod stream;
pub mod types;

pub use client::{Backend, BackendConfig, HttpBackend};
pub use error::{Error, Result};
pub use stream::{ChatStream, ChunkStream, StreamChunk};
pub use types::*;
