use std::time::Duration;

use tokio_postgres::{Client, NoTls};
use uuid::Uuid;

/// Test database utilities for pgip-pubsub integration tests
pub struct TestDb {
    pub client: Client,
    pub test_id: String,
}

/// Resolve the test database URL, if one is configured
pub fn database_url() -> Option<String> {
    dotenvy::dotenv().ok();
    std::env::var("PGIP_DATABASE_URL")
        .ok()
        .filter(|s| !s.is_empty())
        .or_else(|| std::env::var("DATABASE_URL").ok())
        .filter(|s| !s.is_empty())
}

/// Initialize test logging; repeated calls are no-ops
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("debug")),
        )
        .with_test_writer()
        .try_init();
}

impl TestDb {
    /// Open an auxiliary connection for assertions and raw NOTIFY traffic
    pub async fn connect(url: &str) -> Result<Self, tokio_postgres::Error> {
        init_tracing();

        let (client, connection) = tokio_postgres::connect(url, NoTls).await?;
        tokio::spawn(async move {
            let _ = connection.await;
        });

        let test_id = Uuid::new_v4().to_string()[..8].to_string();
        Ok(TestDb { client, test_id })
    }

    /// Build a channel name unique to this test run
    pub fn channel(&self, base: &str) -> String {
        format!("{}_{}", base, self.test_id)
    }

    /// Count lock rows for one internal lock channel
    pub async fn lock_row_count(
        &self,
        schema: &str,
        lock_channel: &str,
    ) -> Result<i64, tokio_postgres::Error> {
        let sql = format!(
            "SELECT COUNT(*) FROM \"{}\".\"lock\" WHERE channel = $1",
            schema
        );
        let row = self.client.query_one(sql.as_str(), &[&lock_channel]).await?;
        Ok(row.get(0))
    }

    /// Owner identity of a lock row, if the row exists
    pub async fn lock_owner(
        &self,
        schema: &str,
        lock_channel: &str,
    ) -> Result<Option<String>, tokio_postgres::Error> {
        let sql = format!(
            "SELECT app FROM \"{}\".\"lock\" WHERE channel = $1",
            schema
        );
        let row = self.client.query_opt(sql.as_str(), &[&lock_channel]).await?;
        Ok(row.map(|r| r.get(0)))
    }

    /// Send a raw notification outside the clients under test
    pub async fn notify(
        &self,
        channel: &str,
        payload: &str,
    ) -> Result<(), tokio_postgres::Error> {
        self.client
            .query_one("SELECT pg_notify($1, $2)", &[&channel, &payload])
            .await?;
        Ok(())
    }
}

/// Poll a condition until it holds or the deadline passes
pub async fn wait_until<F, Fut>(timeout: Duration, mut condition: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if condition().await {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
}
