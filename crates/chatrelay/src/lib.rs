//! chatrelay - authenticated HTTP front-end for hosted chat models
//!
//! Accepts `{query}` requests on configured routes, screens them against a
//! keyword denylist, shapes the prompt and relays the answer from Zhipu or
//! Coze either as one JSON string or as a stream of text fragments.

pub mod auth;
pub mod config;
pub mod error;
pub mod filter;
pub mod prompt;
pub mod relay;
pub mod server;
pub mod sse;
pub mod upstream;

pub use error::RelayError;
