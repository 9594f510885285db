//! # Pub/sub facade
//!
//! The public client surface: connect/close/listen/unlisten/notify/destroy
//! over one supervised connection, plus the notification demultiplexer that
//! routes inbound traffic to user channels or to the channel locks' internal
//! release channels.
//!
//! Two background tasks are spawned per instance: a demux task consuming the
//! notification stream, and a supervisor task consuming connection-loss
//! signals and driving the reconnect loop. Both survive reconnects because
//! the transport keeps the sending halves alive across sessions.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use serde_json::Value;
use tokio::sync::{broadcast, mpsc};
use tokio_postgres::Notification;
use tracing::{debug, info, instrument, warn};

use crate::codec;
use crate::config::PubSubConfig;
use crate::connection::PgConnection;
use crate::emitter::{ChannelEmitter, Handler, SubscriptionId};
use crate::error::{PubSubError, Result};
use crate::events::PubSubEvent;
use crate::lock::{self, ChannelLock, Lock, NoopLock, ReleaseHandler};

const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Reliable pub/sub client over PostgreSQL `LISTEN`/`NOTIFY`
#[derive(Clone)]
pub struct PgPubSub {
    inner: Arc<Inner>,
}

struct Inner {
    config: PubSubConfig,
    connection: Arc<PgConnection>,
    registry: Mutex<HashMap<String, Arc<dyn Lock>>>,
    emitter: ChannelEmitter,
    events: broadcast::Sender<PubSubEvent>,
    closed: AtomicBool,
    retries: AtomicU32,
    tasks_started: AtomicBool,
    notify_rx: Mutex<Option<mpsc::Receiver<Notification>>>,
    lost_rx: Mutex<Option<mpsc::Receiver<()>>>,
    weak_self: std::sync::Weak<Inner>,
}

impl PgPubSub {
    /// Create a client for the given configuration
    pub fn new(config: PubSubConfig) -> Result<Self> {
        config.validate()?;

        let (connection, notify_rx, lost_rx) =
            PgConnection::new(config.conn_str.clone(), config.notify_buffer_size);
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);

        Ok(Self {
            inner: Arc::new_cyclic(|weak| Inner {
                config,
                connection,
                registry: Mutex::new(HashMap::new()),
                emitter: ChannelEmitter::new(),
                events,
                closed: AtomicBool::new(false),
                retries: AtomicU32::new(0),
                tasks_started: AtomicBool::new(false),
                notify_rx: Mutex::new(Some(notify_rx)),
                lost_rx: Mutex::new(Some(lost_rx)),
                weak_self: weak.clone(),
            }),
        })
    }

    /// The configuration this client runs with
    pub fn config(&self) -> &PubSubConfig {
        &self.inner.config
    }

    /// Establish the connection and start the background tasks.
    ///
    /// Safe to call again after `close()`; the closed flag is reset and a
    /// fresh session installed.
    #[instrument(skip(self))]
    pub async fn connect(&self) -> Result<()> {
        self.inner.closed.store(false, Ordering::SeqCst);
        self.inner.connection.establish().await?;
        self.inner.spawn_background_tasks();
        self.inner.emit(PubSubEvent::Connect);
        Ok(())
    }

    /// Adopt an externally-constructed client/connection pair instead of
    /// dialing. Later reconnects go through the configured connection string.
    pub async fn connect_with<S, T>(
        &self,
        client: tokio_postgres::Client,
        connection: tokio_postgres::Connection<S, T>,
    ) -> Result<()>
    where
        S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin + Send + 'static,
        T: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin + Send + 'static,
    {
        self.inner.closed.store(false, Ordering::SeqCst);
        self.inner.connection.adopt(client, connection).await?;
        self.inner.spawn_background_tasks();
        self.inner.emit(PubSubEvent::Connect);
        Ok(())
    }

    /// Close the connection without releasing any held locks
    pub async fn close(&self) {
        self.inner.do_close();
    }

    /// Start listening on a channel.
    ///
    /// In single-listener mode the `LISTEN` is only issued when the channel
    /// lock is won; a contended lock is skipped silently and taken over
    /// later via the release notification or the re-acquire timer.
    #[instrument(skip(self), fields(channel = %channel))]
    pub async fn listen(&self, channel: &str) -> Result<()> {
        let lock = self.inner.obtain_lock(channel);
        self.inner.do_listen(channel, &lock).await
    }

    /// Stop listening on a channel and destroy its lock
    #[instrument(skip(self), fields(channel = %channel))]
    pub async fn unlisten(&self, channel: &str) -> Result<()> {
        self.inner.connection.unlisten(channel).await?;

        let removed = self.inner.registry.lock().unwrap().remove(channel);
        if let Some(lock) = removed {
            if let Err(e) = lock.destroy().await {
                warn!("Lock teardown failed: {}", e);
            }
        }

        self.inner.emit(PubSubEvent::Unlisten {
            channels: vec![channel.to_string()],
        });
        Ok(())
    }

    /// Stop listening on every channel and destroy all locks
    #[instrument(skip(self))]
    pub async fn unlisten_all(&self) -> Result<()> {
        self.inner.connection.unlisten_all().await?;

        let entries: Vec<(String, Arc<dyn Lock>)> =
            self.inner.registry.lock().unwrap().drain().collect();
        let channels: Vec<String> = entries.iter().map(|(name, _)| name.clone()).collect();

        for (_, lock) in entries {
            if let Err(e) = lock.destroy().await {
                warn!("Lock teardown failed: {}", e);
            }
        }

        self.inner.emit(PubSubEvent::Unlisten { channels });
        Ok(())
    }

    /// Publish a payload to a channel
    #[instrument(skip(self, payload), fields(channel = %channel))]
    pub async fn notify(&self, channel: &str, payload: &Value) -> Result<()> {
        let encoded = codec::pack(payload, false);
        self.inner.connection.notify(channel, &encoded).await?;
        self.inner.emit(PubSubEvent::Notify {
            channel: channel.to_string(),
            payload: payload.clone(),
        });
        Ok(())
    }

    /// Subscribe to the lifecycle and message event stream
    pub fn subscribe(&self) -> broadcast::Receiver<PubSubEvent> {
        self.inner.events.subscribe()
    }

    /// Register a per-channel payload handler
    pub fn on(&self, channel: impl Into<String>, handler: Handler) -> SubscriptionId {
        self.inner.emitter.on(channel, handler)
    }

    /// Register a per-channel payload handler removed after one invocation
    pub fn once(&self, channel: impl Into<String>, handler: Handler) -> SubscriptionId {
        self.inner.emitter.once(channel, handler)
    }

    /// Remove a per-channel payload handler
    pub fn off(&self, channel: &str, id: SubscriptionId) -> bool {
        self.inner.emitter.off(channel, id)
    }

    /// Channels whose lock this instance currently holds
    pub fn active_channels(&self) -> Vec<String> {
        self.inner
            .registry
            .lock()
            .unwrap()
            .iter()
            .filter(|(_, lock)| lock.is_acquired())
            .map(|(name, _)| name.clone())
            .collect()
    }

    /// Registered channels whose lock is held elsewhere
    pub fn inactive_channels(&self) -> Vec<String> {
        self.inner
            .registry
            .lock()
            .unwrap()
            .iter()
            .filter(|(_, lock)| !lock.is_acquired())
            .map(|(name, _)| name.clone())
            .collect()
    }

    /// Every registered channel
    pub fn all_channels(&self) -> Vec<String> {
        self.inner.registry.lock().unwrap().keys().cloned().collect()
    }

    /// Whether this instance is the live listener for a channel
    pub fn is_active(&self, channel: &str) -> bool {
        self.inner
            .registry
            .lock()
            .unwrap()
            .get(channel)
            .is_some_and(|lock| lock.is_acquired())
    }

    /// Server-side process id of the current session
    pub fn backend_pid(&self) -> Option<i32> {
        self.inner.connection.backend_pid()
    }

    /// `application_name` of the current session
    pub fn application_name(&self) -> Option<String> {
        self.inner.connection.identity().map(|i| i.app_name)
    }

    /// Release every lock, close the connection, and detach all handlers
    #[instrument(skip(self))]
    pub async fn destroy(&self) {
        let entries: Vec<Arc<dyn Lock>> = self
            .inner
            .registry
            .lock()
            .unwrap()
            .drain()
            .map(|(_, lock)| lock)
            .collect();

        for lock in entries {
            if let Err(e) = lock.destroy().await {
                warn!("Lock teardown failed: {}", e);
            }
        }

        self.inner.do_close();
        self.inner.emitter.clear();
    }
}

impl std::fmt::Debug for PgPubSub {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PgPubSub")
            .field("channels", &self.all_channels())
            .field("closed", &self.inner.closed.load(Ordering::SeqCst))
            .finish()
    }
}

impl Inner {
    fn emit(&self, event: PubSubEvent) {
        // No subscribers is fine; events are best-effort fan-out.
        let _ = self.events.send(event);
    }

    fn do_close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.connection.disconnect();
        self.emit(PubSubEvent::Close);
        info!("Pub/sub closed");
    }

    fn spawn_background_tasks(&self) {
        if self.tasks_started.swap(true, Ordering::SeqCst) {
            return;
        }
        let Some(this) = self.weak_self.upgrade() else {
            return;
        };

        if let Some(notify_rx) = self.notify_rx.lock().unwrap().take() {
            tokio::spawn(run_demux(Arc::clone(&this), notify_rx));
        }
        if let Some(lost_rx) = self.lost_rx.lock().unwrap().take() {
            tokio::spawn(run_supervisor(this, lost_rx));
        }
    }

    /// Fetch or create the lock for a channel, wiring the takeover handler
    /// exactly once at creation
    fn obtain_lock(&self, channel: &str) -> Arc<dyn Lock> {
        let mut registry = self.registry.lock().unwrap();
        if let Some(existing) = registry.get(channel) {
            return Arc::clone(existing);
        }

        let lock: Arc<dyn Lock> = if self.config.single_listener || self.config.execution_lock {
            let lock = ChannelLock::new(
                channel,
                Arc::clone(&self.connection),
                self.config.schema.clone(),
                self.config.acquire_interval,
            );
            lock.on_release(self.takeover_handler(channel))
                .expect("fresh lock has no release handler");
            lock
        } else {
            Arc::new(NoopLock::new(channel))
        };

        registry.insert(channel.to_string(), Arc::clone(&lock));
        lock
    }

    fn takeover_handler(&self, channel: &str) -> ReleaseHandler {
        let weak = self.weak_self.clone();
        let channel = channel.to_string();
        Arc::new(move |_| {
            let Some(inner) = weak.upgrade() else { return };
            let channel = channel.clone();
            tokio::spawn(async move {
                inner.try_takeover(&channel).await;
            });
        })
    }

    /// Attempt to become the live listener for a channel after its lock was
    /// released elsewhere (or the re-acquire timer fired)
    async fn try_takeover(&self, channel: &str) {
        if self.closed.load(Ordering::SeqCst) {
            return;
        }
        let entry = self.registry.lock().unwrap().get(channel).cloned();
        let Some(lock) = entry else { return };
        if lock.is_acquired() {
            return;
        }

        match lock.acquire().await {
            Ok(true) => match self.connection.listen(channel).await {
                Ok(()) => {
                    info!(channel = %channel, "Took over as live listener");
                    self.emit(PubSubEvent::Listen {
                        channel: channel.to_string(),
                    });
                }
                Err(e) => warn!(channel = %channel, "Takeover listen failed: {}", e),
            },
            Ok(false) => debug!(channel = %channel, "Takeover attempt lost"),
            Err(e) => warn!(channel = %channel, "Takeover attempt failed: {}", e),
        }
    }

    async fn do_listen(&self, channel: &str, lock: &Arc<dyn Lock>) -> Result<()> {
        lock.init().await?;

        let was_acquired = lock.is_acquired();
        let acquired = lock.acquire().await?;
        let gated = self.config.single_listener && !self.config.execution_lock;

        // One LISTEN per acquisition transition; ungated modes always listen.
        if (acquired && !was_acquired) || !gated {
            self.connection.listen(channel).await?;
            self.emit(PubSubEvent::Listen {
                channel: channel.to_string(),
            });
        } else if !acquired {
            debug!(channel = %channel, "Lock contended, deferring listen");
        }

        Ok(())
    }

    fn invalidate_locks(&self) {
        for lock in self.registry.lock().unwrap().values() {
            lock.invalidate();
        }
    }

    async fn resubscribe_all(&self) {
        let entries: Vec<(String, Arc<dyn Lock>)> = self
            .registry
            .lock()
            .unwrap()
            .iter()
            .map(|(name, lock)| (name.clone(), Arc::clone(lock)))
            .collect();

        for (channel, lock) in entries {
            if let Err(e) = self.do_listen(&channel, &lock).await {
                warn!(channel = %channel, "Re-subscription failed: {}", e);
            }
        }
    }

    /// Reconnect loop: Retrying until success or `retry_limit` exhaustion
    async fn handle_disconnect(&self) {
        warn!("Connection lost");
        self.emit(PubSubEvent::End);
        // Rows out there still carry the dead session's identity; the
        // re-listen pass must run the real steal path.
        self.invalidate_locks();

        loop {
            if self.closed.load(Ordering::SeqCst) {
                return;
            }

            let attempt = self.retries.fetch_add(1, Ordering::SeqCst) + 1;
            if let Some(limit) = self.config.retry_limit {
                if attempt > limit {
                    let error = PubSubError::retry_exhausted(limit);
                    warn!("{}", error);
                    self.emit(PubSubEvent::Error {
                        message: error.to_string(),
                    });
                    self.do_close();
                    return;
                }
            }

            tokio::time::sleep(self.config.retry_delay).await;
            if self.closed.load(Ordering::SeqCst) {
                return;
            }

            match self.connection.establish().await {
                Ok(()) => {
                    self.resubscribe_all().await;
                    self.emit(PubSubEvent::Reconnect { retries: attempt });
                    self.retries.store(0, Ordering::SeqCst);
                    info!(retries = attempt, "Reconnected");
                    return;
                }
                Err(e) => {
                    warn!(attempt = attempt, "Reconnect attempt failed: {}", e);
                }
            }
        }
    }

    fn dispatch(&self, notification: &Notification) {
        let channel = notification.channel();
        let decision = demux_decision(
            channel,
            notification.process_id(),
            self.connection.backend_pid(),
            self.config.filtered,
            self.config.single_listener,
            self.config.execution_lock,
            |user_channel| {
                self.registry
                    .lock()
                    .unwrap()
                    .get(user_channel)
                    .is_some_and(|lock| lock.is_acquired())
            },
        );

        match decision {
            DemuxDecision::LockRelease => {
                let user_channel = lock::unmangle(channel);
                let entry = self.registry.lock().unwrap().get(&user_channel).cloned();
                match entry {
                    Some(lock) => lock.notify_released(),
                    None => debug!(channel = %channel, "Release notification for unknown lock"),
                }
            }
            DemuxDecision::DropSelf => {
                debug!(channel = %channel, "Dropping self-produced notification");
            }
            DemuxDecision::DropNotHolder => {
                debug!(channel = %channel, "Dropping notification, not the live listener");
            }
            DemuxDecision::Deliver => {
                let payload = codec::unpack(Some(notification.payload()));
                self.emit(PubSubEvent::message(channel, payload.clone()));
                self.emitter.emit(channel, &payload);
            }
        }
    }
}

async fn run_demux(inner: Arc<Inner>, mut notify_rx: mpsc::Receiver<Notification>) {
    debug!("Notification demux started");
    while let Some(notification) = notify_rx.recv().await {
        inner.dispatch(&notification);
    }
    debug!("Notification demux ended");
}

async fn run_supervisor(inner: Arc<Inner>, mut lost_rx: mpsc::Receiver<()>) {
    debug!("Connection supervisor started");
    while lost_rx.recv().await.is_some() {
        if inner.closed.load(Ordering::SeqCst) {
            continue;
        }
        // A replaced session's poll task also signals; only react when the
        // current client is actually gone.
        if inner.connection.client_alive() {
            continue;
        }
        inner.handle_disconnect().await;
    }
    debug!("Connection supervisor ended");
}

/// Routing verdict for one inbound notification
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DemuxDecision {
    /// Internal lock namespace; hand to the channel lock's handler
    LockRelease,
    /// Produced by this very connection and filtering is on
    DropSelf,
    /// Single-listener mode and we do not hold the channel lock
    DropNotHolder,
    /// Decode and emit to user handlers
    Deliver,
}

fn demux_decision(
    channel: &str,
    origin_pid: i32,
    self_pid: Option<i32>,
    filtered: bool,
    single_listener: bool,
    execution_lock: bool,
    lock_acquired: impl FnOnce(&str) -> bool,
) -> DemuxDecision {
    if lock::is_lock_channel(channel) {
        return DemuxDecision::LockRelease;
    }
    if filtered && self_pid == Some(origin_pid) {
        return DemuxDecision::DropSelf;
    }
    if single_listener && !execution_lock && !lock_acquired(channel) {
        return DemuxDecision::DropNotHolder;
    }
    DemuxDecision::Deliver
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_client(configure: impl FnOnce(PubSubConfig) -> PubSubConfig) -> PgPubSub {
        let config = configure(PubSubConfig::new("host=localhost dbname=pgip_test"));
        PgPubSub::new(config).unwrap()
    }

    #[test]
    fn test_new_rejects_invalid_config() {
        assert!(PgPubSub::new(PubSubConfig::default()).is_err());
    }

    #[test]
    fn test_self_filter_decision() {
        // filtered on, own pid 7777: self-produced notification is dropped
        let decision = demux_decision("T", 7777, Some(7777), true, false, false, |_| true);
        assert_eq!(decision, DemuxDecision::DropSelf);

        // same notification from another backend is delivered
        let decision = demux_decision("T", 9999, Some(7777), true, false, false, |_| true);
        assert_eq!(decision, DemuxDecision::Deliver);

        // filtering off delivers even our own traffic
        let decision = demux_decision("T", 7777, Some(7777), false, false, false, |_| true);
        assert_eq!(decision, DemuxDecision::Deliver);
    }

    #[test]
    fn test_non_listener_drop_decision() {
        let decision = demux_decision("C", 1234, Some(7777), false, true, false, |_| false);
        assert_eq!(decision, DemuxDecision::DropNotHolder);

        let decision = demux_decision("C", 1234, Some(7777), false, true, false, |_| true);
        assert_eq!(decision, DemuxDecision::Deliver);
    }

    #[test]
    fn test_lock_channel_decision() {
        let decision = demux_decision(
            "__pgip_lock__:C",
            1234,
            Some(7777),
            true,
            true,
            false,
            |_| true,
        );
        assert_eq!(decision, DemuxDecision::LockRelease);
    }

    #[test]
    fn test_execution_lock_never_drops_for_lock_state() {
        let decision = demux_decision("C", 1234, Some(7777), false, true, true, |_| false);
        assert_eq!(decision, DemuxDecision::Deliver);

        // self-filtering still applies in execution-lock mode
        let decision = demux_decision("C", 7777, Some(7777), true, true, true, |_| false);
        assert_eq!(decision, DemuxDecision::DropSelf);
    }

    #[test]
    fn test_obtain_lock_reuses_instances() {
        let client = test_client(|c| c);
        let first = client.inner.obtain_lock("orders");
        let second = client.inner.obtain_lock("orders");
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(client.all_channels(), vec!["orders".to_string()]);
    }

    #[test]
    fn test_multi_listener_mode_uses_noop_locks() {
        let client = test_client(|c| c.with_single_listener(false));
        client.inner.obtain_lock("orders");

        assert!(client.is_active("orders"));
        assert_eq!(client.active_channels(), vec!["orders".to_string()]);
        assert!(client.inactive_channels().is_empty());
    }

    #[test]
    fn test_single_listener_mode_starts_inactive() {
        let client = test_client(|c| c);
        client.inner.obtain_lock("orders");

        assert!(!client.is_active("orders"));
        assert!(client.active_channels().is_empty());
        assert_eq!(client.inactive_channels(), vec!["orders".to_string()]);
    }

    #[test]
    fn test_is_active_unknown_channel() {
        let client = test_client(|c| c);
        assert!(!client.is_active("nope"));
    }

    #[tokio::test]
    async fn test_event_fan_out() {
        let client = test_client(|c| c);
        let mut events = client.subscribe();

        client.inner.emit(PubSubEvent::Listen {
            channel: "orders".to_string(),
        });

        let event = events.recv().await.unwrap();
        assert_eq!(event.event_type(), "listen");
        assert_eq!(event.channel(), Some("orders"));
    }

    #[tokio::test]
    async fn test_retry_exhaustion_emits_single_error_then_close() {
        use std::time::Duration;

        // Nothing listens on port 1, so every reconnect attempt fails fast.
        let config = PubSubConfig::new("host=127.0.0.1 port=1 user=pgip dbname=pgip")
            .with_retry_limit(2)
            .with_retry_delay(Duration::from_millis(10));
        let client = PgPubSub::new(config).unwrap();
        let mut events = client.subscribe();

        client.inner.handle_disconnect().await;

        assert_eq!(events.recv().await.unwrap(), PubSubEvent::End);
        match events.recv().await.unwrap() {
            PubSubEvent::Error { message } => {
                assert!(message.contains("failed after 2 retries"), "{message}");
            }
            other => panic!("expected error event, got {other:?}"),
        }
        assert_eq!(events.recv().await.unwrap(), PubSubEvent::Close);
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let client = test_client(|c| c);
        let mut events = client.subscribe();

        client.close().await;
        client.close().await;

        let event = events.recv().await.unwrap();
        assert_eq!(event, PubSubEvent::Close);
        assert!(events.try_recv().is_err());
    }
}
