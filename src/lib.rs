//! # pgip-pubsub
//!
//! Reliable publish/subscribe over PostgreSQL `LISTEN`/`NOTIFY` with a
//! distributed single-listener guarantee.
//!
//! Among many processes sharing one database, at most one holds the live
//! listener role per channel. Ownership is a row in a lock table; deleting
//! the row fires a deferred trigger that wakes every peer for fast failover,
//! and a `deadlock_check` routine lets peers steal locks whose holders no
//! longer appear in `pg_stat_activity`.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use pgip_pubsub::{PgPubSub, PubSubConfig};
//! use serde_json::json;
//! use std::sync::Arc;
//!
//! # async fn run() -> pgip_pubsub::Result<()> {
//! let config = PubSubConfig::new("postgresql://localhost/app");
//! let pubsub = PgPubSub::new(config)?;
//!
//! pubsub.connect().await?;
//! pubsub.on("orders", Arc::new(|channel, payload| {
//!     println!("{channel}: {payload}");
//! }));
//! pubsub.listen("orders").await?;
//! pubsub.notify("orders", &json!({"id": 42})).await?;
//! # Ok(())
//! # }
//! ```

pub mod codec;
pub mod config;
pub mod connection;
pub mod emitter;
pub mod error;
pub mod events;
pub mod lock;
pub mod pubsub;
pub mod roster;
pub mod schema;
pub mod shutdown;

pub use config::PubSubConfig;
pub use connection::{ConnectionIdentity, PgConnection};
pub use emitter::{ChannelEmitter, Handler, SubscriptionId};
pub use error::{PubSubError, Result};
pub use events::PubSubEvent;
pub use lock::{ChannelLock, Lock, NoopLock};
pub use pubsub::PgPubSub;
pub use schema::LockSchema;
