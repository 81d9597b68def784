//! Per-VM configuration store and session manager.
//!
//! The `vmkeeper` binary is a thin CLI over this library; everything it does
//! goes through [`registry::Registry`] and the handles it returns.

pub mod cell;
pub mod config;
pub mod crypto;
pub mod error;
pub mod events;
pub mod machine;
pub mod registry;
pub mod session;
pub mod settings;
pub mod storage;

#[cfg(test)]
mod testing;
