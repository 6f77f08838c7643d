//! Queue provider implementations.
//!
//! This module contains the backing stores that implement the
//! [`QueueProvider`](crate::client::QueueProvider) trait.

pub mod filesystem;
pub mod memory;

pub use filesystem::FilesystemProvider;
pub use memory::InMemoryProvider;
