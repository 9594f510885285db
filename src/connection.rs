//! # Single-connection transport
//!
//! One persistent `tokio-postgres` connection carries both SQL commands and
//! asynchronous notifications. A spawned task polls the connection, forwards
//! notifications into a bounded channel, and signals loss of the link when
//! the stream ends. Every established session names itself with a fresh
//! `application_name` sentinel and records its server-side backend pid.

use std::sync::{Arc, RwLock};

use futures::{stream, StreamExt};
use postgres_protocol::escape::{escape_identifier, escape_literal};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio_postgres::tls::NoTls;
use tokio_postgres::{AsyncMessage, Client, Connection, Notification};
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::error::{PubSubError, Result};

/// Identity a live connection presents to the server
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionIdentity {
    /// Unique `application_name`, also used as the lock-owner value
    pub app_name: String,
    /// Server-side process id of this session, for self-message filtering
    pub backend_pid: i32,
}

/// Persistent connection shared by user traffic and lock traffic
pub struct PgConnection {
    conn_str: String,
    client: RwLock<Option<Arc<Client>>>,
    identity: RwLock<Option<ConnectionIdentity>>,
    notify_tx: mpsc::Sender<Notification>,
    lost_tx: mpsc::Sender<()>,
}

impl PgConnection {
    /// Create the transport along with its notification and loss receivers.
    ///
    /// The returned receivers are each consumed by exactly one task: the
    /// facade's demultiplexer and its reconnect supervisor.
    pub fn new(
        conn_str: impl Into<String>,
        notify_buffer_size: usize,
    ) -> (Arc<Self>, mpsc::Receiver<Notification>, mpsc::Receiver<()>) {
        let (notify_tx, notify_rx) = mpsc::channel(notify_buffer_size);
        let (lost_tx, lost_rx) = mpsc::channel(4);

        let connection = Arc::new(Self {
            conn_str: conn_str.into(),
            client: RwLock::new(None),
            identity: RwLock::new(None),
            notify_tx,
            lost_tx,
        });

        (connection, notify_rx, lost_rx)
    }

    /// Dial the server, assign a fresh identity, and install the session.
    ///
    /// Replaces any previous session; the old client is dropped, which ends
    /// its poll task.
    #[instrument(skip(self))]
    pub async fn establish(&self) -> Result<()> {
        let (client, connection) = tokio_postgres::connect(&self.conn_str, NoTls)
            .await
            .map_err(|e| PubSubError::connection(e.to_string()))?;
        self.install(client, connection).await
    }

    /// Install an externally-constructed client/connection pair instead of
    /// dialing. Reconnects after this session dies go through the configured
    /// connection string.
    pub async fn adopt<S, T>(&self, client: Client, connection: Connection<S, T>) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
        T: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        self.install(client, connection).await
    }

    async fn install<S, T>(&self, client: Client, mut connection: Connection<S, T>) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
        T: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let client = Arc::new(client);

        let notify_tx = self.notify_tx.clone();
        let lost_tx = self.lost_tx.clone();
        let mut messages = stream::poll_fn(move |cx| connection.poll_message(cx));

        tokio::spawn(async move {
            while let Some(message) = messages.next().await {
                match message {
                    Ok(AsyncMessage::Notification(notification)) => {
                        if notify_tx.send(notification).await.is_err() {
                            break;
                        }
                    }
                    Ok(AsyncMessage::Notice(notice)) => {
                        debug!("Server notice: {}", notice.message());
                    }
                    Ok(_) => {}
                    Err(e) => {
                        warn!("Connection stream error: {}", e);
                        break;
                    }
                }
            }
            let _ = lost_tx.send(()).await;
        });

        let app_name = format!("pgip-{}", Uuid::new_v4());
        client
            .query_one(
                "SELECT set_config('application_name', $1, false)",
                &[&app_name],
            )
            .await?;

        let row = client.query_one("SELECT pg_backend_pid()", &[]).await?;
        let backend_pid: i32 = row.get(0);

        *self.identity.write().unwrap() = Some(ConnectionIdentity {
            app_name: app_name.clone(),
            backend_pid,
        });
        *self.client.write().unwrap() = Some(client);

        info!(
            app_name = %app_name,
            backend_pid = backend_pid,
            "Connection established"
        );
        Ok(())
    }

    /// Drop the current session without touching identity history
    pub fn disconnect(&self) {
        if self.client.write().unwrap().take().is_some() {
            debug!("Connection dropped");
        }
    }

    /// Current client handle, or `NotConnected`
    pub fn client(&self) -> Result<Arc<Client>> {
        self.client
            .read()
            .unwrap()
            .clone()
            .ok_or(PubSubError::NotConnected)
    }

    /// Whether a session is installed and its socket still open
    pub fn client_alive(&self) -> bool {
        self.client
            .read()
            .unwrap()
            .as_ref()
            .is_some_and(|c| !c.is_closed())
    }

    /// Identity of the current (or most recent) session
    pub fn identity(&self) -> Option<ConnectionIdentity> {
        self.identity.read().unwrap().clone()
    }

    /// Server-side process id of the current session
    pub fn backend_pid(&self) -> Option<i32> {
        self.identity.read().unwrap().as_ref().map(|i| i.backend_pid)
    }

    /// Subscribe the session to a channel
    #[instrument(skip(self), fields(channel = %channel))]
    pub async fn listen(&self, channel: &str) -> Result<()> {
        let client = self.client()?;
        client.batch_execute(&listen_command(channel)).await?;
        debug!("Now listening");
        Ok(())
    }

    /// Unsubscribe the session from a channel
    #[instrument(skip(self), fields(channel = %channel))]
    pub async fn unlisten(&self, channel: &str) -> Result<()> {
        let client = self.client()?;
        client.batch_execute(&unlisten_command(channel)).await?;
        debug!("Stopped listening");
        Ok(())
    }

    /// Unsubscribe the session from every channel
    pub async fn unlisten_all(&self) -> Result<()> {
        let client = self.client()?;
        client.batch_execute("UNLISTEN *").await?;
        debug!("Stopped listening on all channels");
        Ok(())
    }

    /// Send a notification with an already-encoded payload
    #[instrument(skip(self, payload), fields(channel = %channel))]
    pub async fn notify(&self, channel: &str, payload: &str) -> Result<()> {
        let client = self.client()?;
        client
            .batch_execute(&notify_command(channel, payload))
            .await?;
        debug!("Notification sent");
        Ok(())
    }
}

impl std::fmt::Debug for PgConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PgConnection")
            .field("connected", &self.client_alive())
            .field("identity", &self.identity())
            .finish()
    }
}

/// Build a `LISTEN` command with a safely quoted channel identifier
pub fn listen_command(channel: &str) -> String {
    format!("LISTEN {}", escape_identifier(channel))
}

/// Build an `UNLISTEN` command with a safely quoted channel identifier
pub fn unlisten_command(channel: &str) -> String {
    format!("UNLISTEN {}", escape_identifier(channel))
}

/// Build a `NOTIFY` command with quoted identifier and literal payload
pub fn notify_command(channel: &str, payload: &str) -> String {
    format!(
        "NOTIFY {}, {}",
        escape_identifier(channel),
        escape_literal(payload)
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_notify_command_formatting() {
        assert_eq!(
            notify_command("Test", r#"{"a":"b"}"#),
            r#"NOTIFY "Test", '{"a":"b"}'"#
        );
    }

    #[test]
    fn test_listen_command_quotes_identifier() {
        assert_eq!(listen_command("orders"), r#"LISTEN "orders""#);
        assert_eq!(
            listen_command(r#"weird"name"#),
            r#"LISTEN "weird""name""#
        );
    }

    #[test]
    fn test_unlisten_command() {
        assert_eq!(unlisten_command("orders"), r#"UNLISTEN "orders""#);
    }

    #[test]
    fn test_notify_command_escapes_payload() {
        let command = notify_command("ch", "it's");
        assert_eq!(command, r#"NOTIFY "ch", 'it''s'"#);
    }

    #[test]
    fn test_disconnected_accessors() {
        let (connection, _notify_rx, _lost_rx) = PgConnection::new("host=localhost", 16);
        assert!(!connection.client_alive());
        assert!(connection.identity().is_none());
        assert!(connection.backend_pid().is_none());
        assert!(matches!(
            connection.client(),
            Err(PubSubError::NotConnected)
        ));
    }
}
