//! Ferry - forward-browsing HTTP relay
//!
//! Fetches pages from arbitrary origins on a client's behalf and rewrites
//! them so that navigation keeps going through the relay.

pub mod config;
pub mod http;
pub mod relay;
pub mod server;
