//! Idempotent bootstrap of the lock schema.
//!
//! The schema houses the `lock` table (one row per held channel), a trigger
//! function notifying the deleted row's channel, a deferrable constraint
//! trigger so release notifications only reach peers after commit, and the
//! `deadlock_check` routine that lets a new owner steal a lock whose bearer
//! no longer appears in `pg_stat_activity`.

use postgres_protocol::escape::escape_identifier;
use tokio_postgres::Client;
use tracing::{debug, instrument, warn};

use crate::error::Result;

/// Lock schema bootstrap for a configured schema name
#[derive(Debug, Clone)]
pub struct LockSchema {
    schema: String,
}

impl LockSchema {
    /// Create a bootstrap handle for the given schema name
    pub fn new(schema: impl Into<String>) -> Self {
        Self {
            schema: schema.into(),
        }
    }

    /// The configured schema name
    pub fn name(&self) -> &str {
        &self.schema
    }

    /// Fully-qualified, quoted lock table name
    pub fn qualified_table(&self) -> String {
        format!("{}.{}", escape_identifier(&self.schema), escape_identifier("lock"))
    }

    /// Fully-qualified, quoted `deadlock_check` function name
    pub fn qualified_deadlock_check(&self) -> String {
        format!(
            "{}.{}",
            escape_identifier(&self.schema),
            escape_identifier("deadlock_check")
        )
    }

    /// Check whether the schema already exists
    pub async fn exists(&self, client: &Client) -> Result<bool> {
        let row = client
            .query_opt(
                "SELECT 1 FROM information_schema.schemata WHERE schema_name = $1",
                &[&self.schema],
            )
            .await?;
        Ok(row.is_some())
    }

    /// Create the schema, table, trigger, and deadlock-check routine if the
    /// schema is absent.
    ///
    /// Concurrent initialisers race benignly: every statement is idempotent
    /// or its failure is swallowed, so one bootstrap wins and the others
    /// observe existing objects.
    #[instrument(skip(self, client), fields(schema = %self.schema))]
    pub async fn ensure(&self, client: &Client) -> Result<()> {
        if self.exists(client).await? {
            debug!("Lock schema already present");
            return Ok(());
        }

        debug!("Bootstrapping lock schema");

        for statement in self.bootstrap_statements() {
            if let Err(e) = client.batch_execute(&statement).await {
                // Lost the bootstrap race; the winner's objects serve us.
                debug!("Bootstrap statement skipped: {}", e);
            }
        }

        if !self.exists(client).await? {
            warn!("Lock schema still absent after bootstrap");
        }

        Ok(())
    }

    /// The DDL statements the bootstrap runs, in order
    pub fn bootstrap_statements(&self) -> Vec<String> {
        let schema = escape_identifier(&self.schema);
        let table = self.qualified_table();

        vec![
            format!("CREATE SCHEMA IF NOT EXISTS {schema}"),
            format!(
                "CREATE TABLE IF NOT EXISTS {table} (
                    channel TEXT PRIMARY KEY,
                    app TEXT NOT NULL
                )"
            ),
            format!(
                "CREATE OR REPLACE FUNCTION {schema}.notify_lock() RETURNS trigger AS $$
                BEGIN
                    PERFORM PG_NOTIFY(OLD.channel, '1');
                    RETURN OLD;
                END;
                $$ LANGUAGE plpgsql"
            ),
            // CREATE CONSTRAINT TRIGGER has no IF NOT EXISTS form
            format!("DROP TRIGGER IF EXISTS notify_release_lock_trigger ON {table}"),
            format!(
                "CREATE CONSTRAINT TRIGGER notify_release_lock_trigger
                    AFTER DELETE ON {table}
                    DEFERRABLE INITIALLY DEFERRED
                    FOR EACH ROW EXECUTE FUNCTION {schema}.notify_lock()"
            ),
            format!(
                "CREATE OR REPLACE FUNCTION {schema}.deadlock_check(old_app TEXT, new_app TEXT)
                RETURNS TEXT AS $$
                BEGIN
                    IF EXISTS (
                        SELECT 1 FROM pg_stat_activity WHERE application_name = old_app
                    ) THEN
                        RAISE EXCEPTION 'channel lock held by a live connection'
                            USING ERRCODE = 'P0001', DETAIL = 'LOCKED';
                    END IF;
                    RETURN new_app;
                END;
                $$ LANGUAGE plpgsql"
            ),
        ]
    }
}
