//! # Holdfast Core
//!
//! Core primitives for the Holdfast entity cache and session gateway.
//!
//! This crate provides:
//! - The [`Entity`] contract for records managed by a repository
//! - Multi-producer channels with a tagged [`Select`] multiplexer
//! - A worker pool for opaque CPU-bound jobs
//! - Tracing bootstrap helpers
//!
//! ## Examples
//!
//! ```rust
//! use holdfast_core::{Channel, Select};
//!
//! # async fn example() {
//! let control = Channel::new();
//! let data = Channel::new();
//!
//! let select = Select::new([(1, &control), (2, &data)]);
//! data.send("payload");
//! let (tag, value) = select.recv().await;
//! assert_eq!((tag, value), (2, "payload"));
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]

pub mod channel;
pub mod entity;
pub mod error;
pub mod runtime;
pub mod telemetry;

pub use channel::{Channel, ChannelTag, Select};
pub use entity::Entity;
pub use error::{Error, Result};
pub use runtime::WorkerPool;

/// Re-export commonly used types for convenience.
pub mod prelude {
    pub use crate::channel::{Channel, ChannelTag, Select};
    pub use crate::entity::Entity;
    pub use crate::runtime::WorkerPool;
    pub use crate::{Error, Result};
    pub use bytes::Bytes;
}
