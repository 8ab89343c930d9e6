//! Telecache.
//!
//! Telecache is a standalone web service that streams large binary objects stored behind a chat
//! platform's bot API to web clients. Objects are kept in a size and age bounded disk cache.
//! Objects the bot API refuses to hand out because they are too big are retrieved through a
//! long-lived session instead.

#![warn(
    missing_docs,
    missing_debug_implementations,
    unused_crate_dependencies,
    clippy::all
)]

#[macro_use]
extern crate telecache_service;

mod cli;
mod endpoints;
mod logging;
mod server;


fn main() {
    match cli::execute() {
        Ok(()) => std::process::exit(0),
        Err(error) => {
            logging::ensure_log_error(&error);
            std::process::exit(1);
        }
    }
}
