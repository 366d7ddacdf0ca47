//! Client-facing HTTP API.

pub mod client_http;

pub use client_http::{client_router, ClientState};
