//! # Holdfast Store
//!
//! RAM-resident entity repository with disk spill for the Holdfast system.
//!
//! This crate provides:
//! - [`BlobTable`] - a durable `i64` to bytes table backed by SQLite
//! - [`Repository`] - a thread-safe map of individually locked entities
//!   that can be swapped between RAM and the durable table
//! - Scoped [`ReadGuard`]/[`WriteGuard`] access to resident entities
//!
//! ## Examples
//!
//! ```rust,no_run
//! use bytes::Bytes;
//! use holdfast_core::Entity;
//! use holdfast_store::Repository;
//!
//! #[derive(Default)]
//! struct Account {
//!     balance: i64,
//! }
//!
//! impl Entity for Account {
//!     fn encode(&self) -> Bytes {
//!         Bytes::copy_from_slice(&self.balance.to_le_bytes())
//!     }
//!
//!     fn decode(&mut self, raw: &[u8]) -> holdfast_core::Result<()> {
//!         self.balance = i64::from_le_bytes(raw.try_into().map_err(|_| {
//!             holdfast_core::Error::Codec { message: "bad length".into() }
//!         })?);
//!         Ok(())
//!     }
//! }
//!
//! # async fn example() {
//! let repo: Repository<Account> = Repository::new("./data/accounts.db", "accounts");
//! {
//!     let mut account = repo.get_mut(7).await;
//!     account.balance += 100;
//! }
//! repo.swap_out(7).await;
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]

pub mod error;
pub mod repo;
pub mod table;

pub use error::{StoreError, StoreResult};
pub use repo::{EntityId, ReadGuard, Repository, SpillFailurePolicy, WriteGuard};
pub use table::BlobTable;
