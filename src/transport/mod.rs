//! Network transports composed into exchange facades.
//!
//! - rest: pooled HTTP client for `POST {endpoint}/{method}` APIs
//!
//! Websocket I/O lives in `adapters::stream`, which drives the
//! facade's `StreamProtocol` over tokio-tungstenite.
pub mod rest;
