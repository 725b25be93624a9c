//! An asynchronous Cloud Spanner client that keeps working through transient failures.
//!
//! # Example
//!
//! ```no_run
//! use futures::FutureExt;
//! use spanner_rs::{Client, Context, DatabaseId, Error, Statement};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Error> {
//!     let client = Client::configure()
//!         .database(DatabaseId::parse(
//!             "projects/my-project/instances/my-instance/databases/my-database",
//!         )?)
//!         .connect()
//!         .await?;
//!
//!     let ctx = Context::background();
//!
//!     // assuming the following table:
//!     //   person(id INT64, name STRING(MAX)) PRIMARY KEY(id)
//!     client
//!         .read_write_transaction(&ctx, |tx| {
//!             async move {
//!                 let insert = Statement::new("INSERT INTO person(id, name) VALUES(@id, @name)")
//!                     .bind("id", 42)
//!                     .bind("name", "ferris");
//!                 tx.execute_update(&insert).await
//!             }
//!             .boxed()
//!         })
//!         .await?;
//!
//!     let mut rows = client
//!         .single()
//!         .execute_query(&ctx, &"SELECT id, name FROM person".into());
//!     while let Some(row) = rows.next().await? {
//!         let id: i64 = row.get("id")?;
//!         let name: &str = row.get("name")?;
//!         println!("found person: {} {}", id, name);
//!     }
//!
//!     Ok(())
//! }
//! ```
//!
//! # Failures
//!
//! Errors are sorted by an [`ErrorClassifier`]:
//!
//! * `UNAVAILABLE`, and `INTERNAL` errors that signal a broken stream or connection, are
//!   transient. Single RPCs are re-sent, and queries resume from the last resume token the server
//!   sent, without ever returning a row twice.
//! * `ABORTED` means the read/write transaction lost a conflict. The whole transaction body is run
//!   again in a new transaction, see [`Client::read_write_transaction`].
//! * Everything else is returned to the caller.
//!
//! Retries wait according to a randomized exponential [`Backoff`]. Every operation takes a
//! [`Context`] whose deadline and cancellation bound the operation and all of its retries.
//!
//! # Transactions
//!
//! * [`Client::single`] reads in single-use read-only transactions;
//! * [`Client::read_only_transaction`] reads several times from the same snapshot;
//! * [`Client::read_write_transaction`] reads and writes, committing when its body succeeds;
//! * [`Client::apply`] commits mutations, optionally in a single round trip.
//!
//! # Endpoint discovery
//!
//! When resource-based routing is enabled (see [`ResourceRouting`]), the client asks the
//! instance for its dedicated endpoint before connecting and falls back to the default endpoint
//! when there is none, or when the lookup is denied or unavailable.
//!
//! ## Authentication
//!
//! Authentication uses the [`gcp_auth`] crate which supports several authentication methods.

pub use crate::classify::{
    Classification, ErrorClassifier, ErrorKind, DEFAULT_TRANSIENT_INTERNAL_MESSAGES,
};
pub(crate) use crate::client::Shared;
pub use crate::client::{ApplyOptions, Client, ReadContext};
pub use crate::config::{Config, ConfigBuilder};
pub use crate::context::{CancelHandle, Context};
pub use crate::endpoint::{Endpoint, ResourceRouting, DEFAULT_ENDPOINT, RESOURCE_ROUTING_ENV};
pub use crate::error::Error;
pub use crate::from_spanner::*;
pub use crate::resource::*;
pub use crate::result_set::Row;
pub use crate::resumable::{ResultStream, ResumeToken, StreamState};
pub use crate::retry::Backoff;
pub(crate) use crate::session::{Session, SessionManager};
pub use crate::statement::Statement;
pub use crate::to_spanner::*;
pub use crate::transaction::{
    CommitResult, Mutation, ReadOnlyTransaction, TimestampBound, TransactionContext,
};
pub(crate) use crate::transaction::{Transaction, TransactionMode, TransactionSelector};

mod auth;
mod classify;
mod client;
mod config;
mod connection;
mod context;
mod endpoint;
mod error;
mod from_spanner;
mod resource;
mod result_set;
mod resumable;
mod retry;
mod runner;
mod session;
mod statement;
#[cfg(test)]
mod testing;
mod to_spanner;
mod transaction;
