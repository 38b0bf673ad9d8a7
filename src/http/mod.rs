//! # HTTP Transport
//!
//! The transport capability: resolved requests in, captured responses (or
//! transport errors) out.

pub mod client;
pub mod method;
pub mod request;
pub mod response;
