//! Provider plumbing: wire types, SSE parsing, clients, and tools

pub mod anthropic;
pub mod client;
pub mod mock;
pub mod sse;
pub mod tools;
pub mod types;
