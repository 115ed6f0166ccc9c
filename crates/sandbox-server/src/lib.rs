//! HTTP server that provisions Docker sandboxes and runs commands in them.

pub mod batch;
pub mod config;
pub mod error;
pub mod lifecycle;
pub mod rpc;
pub mod serve;
pub mod timeline;

#[cfg(test)]
mod testing;
