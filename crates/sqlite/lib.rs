//! SQLite job-run sessions for drover.
//!
//! Every job gets a fresh connection for the duration of its run. The
//! session records the run in a `{namespace}_job_runs` ledger table and
//! exports the run id and database URL to the job process, so the job can
//! attach its own writes to the run.
//!
//! ## Usage
//!
//! ```rust,ignore
//! use drover_core::{Migrator, ProcessQueue};
//! use drover_sqlite::{SqliteMigrator, SqliteSessions};
//!
//! #[tokio::main]
//! async fn main() -> drover_core::Result<()> {
//!     let url = "sqlite:drover.db?mode=rwc";
//!     SqliteMigrator::new(url, "drover").migrate().await?;
//!     let queue = ProcessQueue::builder()
//!         .sessions(SqliteSessions::new(url, "drover"))
//!         .build();
//!     Ok(())
//! }
//! ```

use async_trait::async_trait;
use drover_core::{DroverError, Job, JobOutcome, Migrator, Result, Session, SessionProvider};
use sqlx::sqlite::{SqliteConnection, SqlitePoolOptions};
use sqlx::Connection;

/// Environment variable carrying the run id into the job process.
pub const RUN_ID_ENV: &str = "DROVER_RUN_ID";

/// Environment variable carrying the database URL into the job process.
pub const DATABASE_URL_ENV: &str = "DROVER_DATABASE_URL";

fn runs_table(namespace: &str) -> String {
    format!("{}_job_runs", namespace)
}

/// Creates the tables the SQLite session provider writes to.
#[derive(Debug, Clone)]
pub struct SqliteMigrator {
    database_url: String,
    namespace: String,
}

impl SqliteMigrator {
    /// Create a migrator.
    ///
    /// The database_url should be in the format: `sqlite:path/to/db.sqlite`
    /// (append `?mode=rwc` to create the file).
    pub fn new(database_url: impl Into<String>, namespace: impl Into<String>) -> Self {
        Self {
            database_url: database_url.into(),
            namespace: namespace.into(),
        }
    }
}

#[async_trait]
impl Migrator for SqliteMigrator {
    async fn migrate(&self) -> Result<()> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect(&self.database_url)
            .await
            .map_err(|e| DroverError::Store(format!("Failed to connect to SQLite: {}", e)))?;

        let table = runs_table(&self.namespace);

        sqlx::query(&format!(
            r#"
            CREATE TABLE IF NOT EXISTS {} (
                run_id TEXT PRIMARY KEY,
                job_id TEXT NOT NULL,
                status TEXT NOT NULL,
                exit_code INTEGER,
                started_at TEXT DEFAULT (datetime('now')),
                finished_at TEXT
            )
            "#,
            table
        ))
        .execute(&pool)
        .await
        .map_err(|e| DroverError::Store(format!("Failed to create job runs table: {}", e)))?;

        sqlx::query(&format!(
            "CREATE INDEX IF NOT EXISTS idx_{}_job_id ON {} (job_id)",
            table, table
        ))
        .execute(&pool)
        .await
        .ok();

        pool.close().await;
        tracing::debug!(table = %table, "SQLite migrations applied");
        Ok(())
    }
}

/// One row of the job run ledger.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobRun {
    pub run_id: String,
    pub job_id: String,
    pub status: String,
    pub exit_code: Option<i64>,
}

/// [`SessionProvider`] that opens a fresh SQLite connection per job.
#[derive(Debug, Clone)]
pub struct SqliteSessions {
    database_url: String,
    namespace: String,
}

impl SqliteSessions {
    /// Create a session provider for `database_url`.
    pub fn new(database_url: impl Into<String>, namespace: impl Into<String>) -> Self {
        Self {
            database_url: database_url.into(),
            namespace: namespace.into(),
        }
    }

    async fn connect(&self) -> Result<SqliteConnection> {
        SqliteConnection::connect(&self.database_url)
            .await
            .map_err(|e| DroverError::Session(format!("Failed to connect to SQLite: {}", e)))
    }

    /// Ledger rows for `job_id`, oldest first.
    pub async fn runs(&self, job_id: &str) -> Result<Vec<JobRun>> {
        let mut conn = self.connect().await?;
        let rows: Vec<(String, String, String, Option<i64>)> = sqlx::query_as(&format!(
            "SELECT run_id, job_id, status, exit_code FROM {} WHERE job_id = ? ORDER BY rowid",
            runs_table(&self.namespace)
        ))
        .bind(job_id)
        .fetch_all(&mut conn)
        .await
        .map_err(|e| DroverError::Session(e.to_string()))?;
        conn.close().await.ok();

        Ok(rows
            .into_iter()
            .map(|(run_id, job_id, status, exit_code)| JobRun {
                run_id,
                job_id,
                status,
                exit_code,
            })
            .collect())
    }
}

#[async_trait]
impl SessionProvider for SqliteSessions {
    async fn open(&self, job: &Job) -> Result<Box<dyn Session>> {
        let mut conn = self.connect().await?;
        let run_id = uuid::Uuid::new_v4().to_string();
        let table = runs_table(&self.namespace);

        sqlx::query(&format!(
            "INSERT INTO {} (run_id, job_id, status) VALUES (?, ?, 'running')",
            table
        ))
        .bind(&run_id)
        .bind(job.id.as_str())
        .execute(&mut conn)
        .await
        .map_err(|e| DroverError::Session(format!("Failed to record job run: {}", e)))?;

        tracing::debug!(job_id = %job.id, run_id = %run_id, "Job session opened");

        Ok(Box::new(SqliteSession {
            conn,
            run_id,
            table,
            database_url: self.database_url.clone(),
        }))
    }
}

struct SqliteSession {
    conn: SqliteConnection,
    run_id: String,
    table: String,
    database_url: String,
}

fn exit_code(outcome: &JobOutcome) -> Option<i64> {
    match outcome {
        JobOutcome::Succeeded => Some(0),
        JobOutcome::Failed { exit_code, .. } => exit_code.map(i64::from),
        JobOutcome::NotStarted { .. } | JobOutcome::Skipped => None,
    }
}

#[async_trait]
impl Session for SqliteSession {
    fn env(&self) -> Vec<(String, String)> {
        vec![
            (RUN_ID_ENV.to_string(), self.run_id.clone()),
            (DATABASE_URL_ENV.to_string(), self.database_url.clone()),
        ]
    }

    async fn close(mut self: Box<Self>, outcome: &JobOutcome) -> Result<()> {
        sqlx::query(&format!(
            "UPDATE {} SET status = ?, exit_code = ?, finished_at = datetime('now') WHERE run_id = ?",
            self.table
        ))
        .bind(outcome.label())
        .bind(exit_code(outcome))
        .bind(&self.run_id)
        .execute(&mut self.conn)
        .await
        .map_err(|e| DroverError::Session(format!("Failed to finish job run: {}", e)))?;

        tracing::debug!(run_id = %self.run_id, status = outcome.label(), "Job session closed");

        self.conn
            .close()
            .await
            .map_err(|e| DroverError::Session(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use drover_core::{run_scoped, JobTarget};

    async fn setup() -> (tempfile::TempDir, String) {
        let dir = tempfile::tempdir().unwrap();
        let url = format!("sqlite:{}?mode=rwc", dir.path().join("drover.db").display());
        SqliteMigrator::new(&url, "test").migrate().await.unwrap();
        (dir, url)
    }

    #[tokio::test]
    async fn test_migrate_is_idempotent() {
        let (_dir, url) = setup().await;
        SqliteMigrator::new(&url, "test").migrate().await.unwrap();
        let sessions = SqliteSessions::new(&url, "test");
        assert!(sessions.runs("none").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_session_records_run() {
        let (_dir, url) = setup().await;
        let sessions = SqliteSessions::new(&url, "test");
        let job = Job::new("block_run_42", JobTarget::new("true"));

        let session = sessions.open(&job).await.unwrap();
        let env = session.env();
        assert_eq!(env[0].0, RUN_ID_ENV);
        assert_eq!(env[1], (DATABASE_URL_ENV.to_string(), url.clone()));

        let running = sessions.runs("block_run_42").await.unwrap();
        assert_eq!(running.len(), 1);
        assert_eq!(running[0].status, "running");
        assert_eq!(running[0].run_id, env[0].1);

        session
            .close(&JobOutcome::Failed {
                exit_code: Some(3),
                signal: None,
            })
            .await
            .unwrap();

        let runs = sessions.runs("block_run_42").await.unwrap();
        assert_eq!(runs[0].status, "failed");
        assert_eq!(runs[0].exit_code, Some(3));
    }

    #[tokio::test]
    async fn test_each_run_gets_fresh_session() {
        let (_dir, url) = setup().await;
        let sessions = SqliteSessions::new(&url, "test");
        let job = Job::new("twice", JobTarget::new("true"));

        for _ in 0..2 {
            let outcome = run_scoped(&sessions, &job, |_env| async { JobOutcome::Succeeded })
                .await
                .unwrap();
            assert_eq!(outcome, JobOutcome::Succeeded);
        }

        let runs = sessions.runs("twice").await.unwrap();
        assert_eq!(runs.len(), 2);
        assert_ne!(runs[0].run_id, runs[1].run_id);
        assert!(runs.iter().all(|r| r.status == "succeeded" && r.exit_code == Some(0)));
    }

    #[tokio::test]
    async fn test_open_without_migration_fails() {
        let dir = tempfile::tempdir().unwrap();
        let url = format!("sqlite:{}?mode=rwc", dir.path().join("empty.db").display());
        let sessions = SqliteSessions::new(&url, "test");

        let err = sessions
            .open(&Job::new("x", JobTarget::new("true")))
            .await
            .err()
            .unwrap();
        assert!(matches!(err, DroverError::Session(_)));
    }

    #[tokio::test]
    async fn test_migrate_bad_url_fails() {
        let dir = tempfile::tempdir().unwrap();
        let url = format!("sqlite:{}", dir.path().join("missing/dir/db.sqlite").display());
        assert!(SqliteMigrator::new(url, "test").migrate().await.is_err());
    }
}
