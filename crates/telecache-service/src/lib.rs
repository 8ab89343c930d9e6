//! Retrieval, caching and streaming of remote objects stored on a messaging platform.
//!
//! See [`services::Service`] for the composition root tying all the parts together.

#[macro_use]
pub mod metrics;

pub mod caching;
pub mod config;
pub mod download;
pub mod logging;
pub mod services;
pub mod utils;
