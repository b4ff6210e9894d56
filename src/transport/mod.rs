//! Long-poll HTTP endpoint the browsers talk to.
//!
//! Requests are parsed by hand on top of `tokio::net`; every response is a
//! JSON body on a closed connection.

mod http;
mod server;

pub use server::LongPollServer;
