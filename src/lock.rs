//! # Inter-process channel locks
//!
//! A database-backed mutual-exclusion primitive keyed by channel name. At
//! most one connection holds the lock row for a channel; deleting the row
//! fires a deferred trigger that notifies every peer subscribed to the
//! channel's internal lock channel, and a periodic re-acquire timer masks
//! silent connection loss until the dead holder's backend is reaped.
//!
//! Two interchangeable variants implement the [`Lock`] capability set:
//! [`ChannelLock`] for single-listener mode and [`NoopLock`] when the
//! guarantee is disabled.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, OnceLock, Weak};
use std::time::Duration;

use async_trait::async_trait;
use regex::Regex;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_postgres::error::SqlState;
use tracing::{debug, instrument, warn};

use crate::connection::PgConnection;
use crate::error::{PubSubError, Result};
use crate::roster;
use crate::schema::LockSchema;

/// Fixed token separating internal lock channels from user channels
const LOCK_TAG: &str = "pgip_lock";

static LOCK_PREFIX: OnceLock<Regex> = OnceLock::new();

fn lock_prefix() -> &'static Regex {
    LOCK_PREFIX.get_or_init(|| {
        Regex::new(&format!("^__{LOCK_TAG}__:")).expect("lock prefix pattern is valid")
    })
}

/// Map a user channel to its internal lock channel
pub fn mangle(channel: &str) -> String {
    format!("__{LOCK_TAG}__:{channel}")
}

/// Whether a channel name lives in the internal lock namespace
pub fn is_lock_channel(channel: &str) -> bool {
    lock_prefix().is_match(channel)
}

/// Strip the internal prefix, surfacing the user channel name
pub fn unmangle(channel: &str) -> String {
    lock_prefix().replace(channel, "").into_owned()
}

/// Handler invoked with the unmangled channel name when a release
/// notification arrives for a lock this process does not hold
pub type ReleaseHandler = Arc<dyn Fn(&str) + Send + Sync>;

/// Capability set shared by the locking and non-locking variants
#[async_trait]
pub trait Lock: Send + Sync {
    /// Prepare the lock: bootstrap schema, subscribe the internal channel,
    /// join the process-wide roster, arm the re-acquire timer. Idempotent.
    async fn init(&self) -> Result<()>;

    /// Attempt to take the lock row; `Ok(false)` means someone else holds it
    async fn acquire(&self) -> Result<bool>;

    /// Delete the lock row if held; never fails the caller
    async fn release(&self) -> Result<()>;

    /// Whether this process currently holds the lock
    fn is_acquired(&self) -> bool;

    /// Forget local ownership without touching the database. Used when the
    /// connection is lost and the row's owner identity is now stale.
    fn invalidate(&self);

    /// Install the single release-notification handler
    fn on_release(&self, handler: ReleaseHandler) -> Result<()>;

    /// Deliver a release notification to the installed handler
    fn notify_released(&self);

    /// Tear down: detach handler, cancel timer, release row, unsubscribe,
    /// leave the roster
    async fn destroy(&self) -> Result<()>;

    /// User-visible channel name
    fn channel(&self) -> &str;

    /// Internal lock channel name
    fn lock_channel(&self) -> &str;
}

/// Database-backed lock for one channel
pub struct ChannelLock {
    channel: String,
    lock_channel: String,
    connection: Arc<PgConnection>,
    schema: LockSchema,
    acquire_interval: Duration,
    acquired: AtomicBool,
    release_handler: Mutex<Option<ReleaseHandler>>,
    timer: Mutex<Option<JoinHandle<()>>>,
    weak_self: Weak<ChannelLock>,
}

impl ChannelLock {
    /// Create a lock for a user channel.
    ///
    /// Returned as `Arc` so the re-acquire timer can hold a weak reference
    /// back to the lock without keeping a destroyed instance alive.
    pub fn new(
        channel: impl Into<String>,
        connection: Arc<PgConnection>,
        schema: impl Into<String>,
        acquire_interval: Duration,
    ) -> Arc<Self> {
        let channel = channel.into();
        let lock_channel = mangle(&channel);

        Arc::new_cyclic(|weak| Self {
            channel,
            lock_channel,
            connection,
            schema: LockSchema::new(schema),
            acquire_interval,
            acquired: AtomicBool::new(false),
            release_handler: Mutex::new(None),
            timer: Mutex::new(None),
            weak_self: weak.clone(),
        })
    }

    fn upsert_sql(&self) -> String {
        format!(
            "INSERT INTO {table} AS l (channel, app) VALUES ($1, $2) \
             ON CONFLICT (channel) DO UPDATE SET app = {check}(l.app, EXCLUDED.app)",
            table = self.schema.qualified_table(),
            check = self.schema.qualified_deadlock_check(),
        )
    }

    fn delete_sql(&self) -> String {
        format!(
            "DELETE FROM {table} WHERE channel = $1",
            table = self.schema.qualified_table(),
        )
    }

    /// Arm the periodic re-acquire timer if it is not already running
    fn arm_timer(&self) {
        let mut timer = self.timer.lock().unwrap();
        if timer.as_ref().is_some_and(|handle| !handle.is_finished()) {
            return;
        }

        let weak = self.weak_self.clone();
        let interval = self.acquire_interval;
        *timer = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // interval fires immediately; the caller just acquired
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(lock) = weak.upgrade() else {
                    break;
                };
                if !lock.is_acquired() {
                    lock.reattempt().await;
                }
            }
        }));
    }

    /// Timer-driven takeover attempt. Routed through the release handler
    /// when one is installed, so a timer-won takeover runs the same
    /// acquire-then-listen path as a release notification.
    async fn reattempt(&self) {
        let handler = self.release_handler.lock().unwrap().clone();
        match handler {
            Some(handler) => handler(&self.channel),
            None => {
                let _ = self.acquire().await;
            }
        }
    }
}

#[async_trait]
impl Lock for ChannelLock {
    #[instrument(skip(self), fields(channel = %self.channel))]
    async fn init(&self) -> Result<()> {
        if let Ok(client) = self.connection.client() {
            if let Err(e) = self.schema.ensure(&client).await {
                debug!("Lock schema bootstrap skipped: {}", e);
            }
        }

        self.connection.listen(&self.lock_channel).await?;

        if let Some(this) = self.weak_self.upgrade() {
            let as_lock: Arc<dyn Lock> = this;
            roster::register(&as_lock);
        }

        self.arm_timer();
        Ok(())
    }

    #[instrument(skip(self), fields(channel = %self.channel))]
    async fn acquire(&self) -> Result<bool> {
        // Re-running the upsert while holding the row would trip our own
        // deadlock check, and repeated listen() must stay idempotent.
        if self.acquired.load(Ordering::SeqCst) {
            return Ok(true);
        }

        let client = match self.connection.client() {
            Ok(client) => client,
            Err(e) => {
                warn!("Lock acquisition skipped: {}", e);
                return Ok(false);
            }
        };
        let Some(identity) = self.connection.identity() else {
            warn!("Lock acquisition skipped: connection has no identity");
            return Ok(false);
        };

        let sql = self.upsert_sql();
        match client
            .execute(sql.as_str(), &[&self.lock_channel, &identity.app_name])
            .await
        {
            Ok(_) => {
                self.acquired.store(true, Ordering::SeqCst);
                debug!(app = %identity.app_name, "Lock acquired");
                Ok(true)
            }
            Err(e) if is_locked_sentinel(&e) => {
                debug!("Lock contended");
                Ok(false)
            }
            Err(e) => {
                warn!("Lock acquisition failed: {}", e);
                Ok(false)
            }
        }
    }

    #[instrument(skip(self), fields(channel = %self.channel))]
    async fn release(&self) -> Result<()> {
        if !self.acquired.swap(false, Ordering::SeqCst) {
            return Ok(());
        }

        let sql = self.delete_sql();
        match self.connection.client() {
            Ok(client) => {
                if let Err(e) = client.execute(sql.as_str(), &[&self.lock_channel]).await {
                    warn!("Lock release failed: {}", e);
                } else {
                    debug!("Lock released");
                }
            }
            Err(e) => warn!("Lock release skipped: {}", e),
        }

        Ok(())
    }

    fn is_acquired(&self) -> bool {
        self.acquired.load(Ordering::SeqCst)
    }

    fn invalidate(&self) {
        self.acquired.store(false, Ordering::SeqCst);
    }

    fn on_release(&self, handler: ReleaseHandler) -> Result<()> {
        let mut slot = self.release_handler.lock().unwrap();
        if slot.is_some() {
            return Err(PubSubError::protocol(format!(
                "release handler already installed for channel {:?}",
                self.channel
            )));
        }
        *slot = Some(handler);
        Ok(())
    }

    fn notify_released(&self) {
        let handler = self.release_handler.lock().unwrap().clone();
        if let Some(handler) = handler {
            handler(&self.channel);
        }
    }

    #[instrument(skip(self), fields(channel = %self.channel))]
    async fn destroy(&self) -> Result<()> {
        *self.release_handler.lock().unwrap() = None;

        if let Some(timer) = self.timer.lock().unwrap().take() {
            timer.abort();
        }

        self.release().await?;

        if let Err(e) = self.connection.unlisten(&self.lock_channel).await {
            debug!("Lock channel unsubscribe skipped: {}", e);
        }

        if let Some(this) = self.weak_self.upgrade() {
            let as_lock: Arc<dyn Lock> = this;
            roster::deregister(&as_lock);
        }

        Ok(())
    }

    fn channel(&self) -> &str {
        &self.channel
    }

    fn lock_channel(&self) -> &str {
        &self.lock_channel
    }
}

impl std::fmt::Debug for ChannelLock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChannelLock")
            .field("channel", &self.channel)
            .field("acquired", &self.is_acquired())
            .finish()
    }
}

/// Recognize the sentinel raised by `deadlock_check` for a live holder
fn is_locked_sentinel(error: &tokio_postgres::Error) -> bool {
    error.as_db_error().is_some_and(|db| {
        db.code() == &SqlState::RAISE_EXCEPTION && db.detail() == Some("LOCKED")
    })
}

/// Non-locking variant used when the single-listener guarantee is off
#[derive(Debug, Clone)]
pub struct NoopLock {
    channel: String,
    lock_channel: String,
}

impl NoopLock {
    /// Create a no-op lock for a user channel
    pub fn new(channel: impl Into<String>) -> Self {
        let channel = channel.into();
        let lock_channel = mangle(&channel);
        Self {
            channel,
            lock_channel,
        }
    }
}

#[async_trait]
impl Lock for NoopLock {
    async fn init(&self) -> Result<()> {
        Ok(())
    }

    async fn acquire(&self) -> Result<bool> {
        Ok(true)
    }

    async fn release(&self) -> Result<()> {
        Ok(())
    }

    fn is_acquired(&self) -> bool {
        true
    }

    fn invalidate(&self) {}

    fn on_release(&self, _handler: ReleaseHandler) -> Result<()> {
        Ok(())
    }

    fn notify_released(&self) {}

    async fn destroy(&self) -> Result<()> {
        Ok(())
    }

    fn channel(&self) -> &str {
        &self.channel
    }

    fn lock_channel(&self) -> &str {
        &self.lock_channel
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn test_lock(channel: &str) -> Arc<ChannelLock> {
        let (connection, _notify_rx, _lost_rx) = PgConnection::new("host=localhost", 16);
        ChannelLock::new(channel, connection, "pgip_lock", Duration::from_secs(30))
    }

    #[test]
    fn test_mangle_round_trip() {
        assert_eq!(mangle("orders"), "__pgip_lock__:orders");
        assert_eq!(unmangle("__pgip_lock__:orders"), "orders");
        assert!(is_lock_channel("__pgip_lock__:orders"));
        assert!(!is_lock_channel("orders"));
    }

    #[test]
    fn test_unmangle_leaves_user_channels_alone() {
        assert_eq!(unmangle("orders"), "orders");
        assert_eq!(unmangle("orders__pgip_lock__:x"), "orders__pgip_lock__:x");
    }

    #[test]
    fn test_upsert_sql_shape() {
        let lock = test_lock("orders");
        let sql = lock.upsert_sql();
        assert!(sql.contains(r#"INSERT INTO "pgip_lock"."lock" AS l"#));
        assert!(sql.contains("ON CONFLICT (channel) DO UPDATE"));
        assert!(sql.contains(r#""pgip_lock"."deadlock_check"(l.app, EXCLUDED.app)"#));
    }

    #[tokio::test]
    async fn test_acquire_without_connection_is_non_acquisition() {
        let lock = test_lock("orders");
        assert!(!lock.acquire().await.unwrap());
        assert!(!lock.is_acquired());
    }

    #[tokio::test]
    async fn test_release_when_not_acquired_is_noop() {
        let lock = test_lock("orders");
        assert!(lock.release().await.is_ok());
        assert!(!lock.is_acquired());
    }

    #[test]
    fn test_on_release_rejects_second_handler() {
        let lock = test_lock("orders");
        assert!(lock.on_release(Arc::new(|_| {})).is_ok());

        let err = lock.on_release(Arc::new(|_| {})).unwrap_err();
        assert!(matches!(err, PubSubError::Protocol { .. }));
    }

    #[test]
    fn test_notify_released_passes_unmangled_channel() {
        let lock = test_lock("orders");
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen_in_handler = Arc::clone(&seen);
        lock.on_release(Arc::new(move |channel| {
            seen_in_handler.lock().unwrap().push(channel.to_string());
        }))
        .unwrap();

        lock.notify_released();
        assert_eq!(*seen.lock().unwrap(), vec!["orders".to_string()]);
    }

    #[tokio::test]
    async fn test_reattempt_routes_through_handler() {
        let lock = test_lock("orders");
        let calls = Arc::new(AtomicUsize::new(0));
        let calls_in_handler = Arc::clone(&calls);
        lock.on_release(Arc::new(move |_| {
            calls_in_handler.fetch_add(1, Ordering::SeqCst);
        }))
        .unwrap();

        lock.reattempt().await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_noop_lock_is_always_acquired() {
        let lock = NoopLock::new("orders");
        assert!(lock.is_acquired());
        assert!(lock.init().await.is_ok());
        assert!(lock.acquire().await.unwrap());
        assert!(lock.release().await.is_ok());
        assert!(lock.on_release(Arc::new(|_| {})).is_ok());
        assert!(lock.destroy().await.is_ok());
        assert!(lock.is_acquired());
        assert_eq!(lock.lock_channel(), "__pgip_lock__:orders");
    }

    #[test]
    fn test_invalidate_clears_local_ownership() {
        let lock = test_lock("orders");
        lock.acquired.store(true, Ordering::SeqCst);
        lock.invalidate();
        assert!(!lock.is_acquired());
    }
}
