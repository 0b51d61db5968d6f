//! Client-side sync layer for the seller dashboard's notifications and wallet
//! transactions.
//!
//! A [`Session`] owns one [`QueryCache`] shared by the [`NotificationSync`]
//! and [`TransactionEngine`]. Both engines talk to the service only through
//! a [`RemoteClient`].

pub mod cache;
pub mod config;
pub mod error;
pub mod model;
pub mod notifications;
pub mod output;
pub mod query;
pub mod remote;
pub mod session;
pub mod transactions;

pub use cache::QueryCache;
pub use config::Config;
pub use error::{RemoteError, SyncError, SyncResult};
pub use notifications::{NotificationSync, UnreadWatcher};
pub use query::{Mutation, MutationState, Query, QueryState};
pub use remote::{HttpRemote, MemoryRemote, RemoteClient};
pub use session::Session;
pub use transactions::{Resolution, TransactionEngine};
