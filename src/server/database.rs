use log::{debug, info, warn};
use sqlx::pool::PoolConnection;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::{Sqlite, SqliteConnection, SqlitePool};
use std::ops::{Deref, DerefMut};
use std::str::FromStr;
use std::time::Duration;

/// How long a writer waits for the database lock before giving up.
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone)]
pub struct Database {
    pub pool: SqlitePool,
}

impl Database {
    pub async fn connect(database_url: &str) -> Result<Self, sqlx::Error> {
        info!("🔗 Connecting to database: {}", database_url);

        // Strip the scheme and any query parameters to find the file on disk
        let file_path = if let Some(rest) = database_url.strip_prefix("sqlite://") {
            rest.split('?').next().unwrap_or(rest)
        } else if let Some(rest) = database_url.strip_prefix("sqlite:") {
            rest.split('?').next().unwrap_or(rest)
        } else {
            database_url
        };

        if !file_path.contains(":memory:") {
            if let Some(parent) = std::path::Path::new(file_path).parent() {
                if !parent.as_os_str().is_empty() && !parent.exists() {
                    std::fs::create_dir_all(parent).map_err(|e| sqlx::Error::Configuration(Box::new(e)))?;
                    info!("📁 Created database directory {:?}", parent);
                }
            }
            if !std::path::Path::new(file_path).exists() {
                debug!("Database file {} does not exist yet, SQLite will create it", file_path);
            }
        }

        let mut options = SqliteConnectOptions::from_str(database_url)?
            .create_if_missing(true)
            .busy_timeout(BUSY_TIMEOUT);
        if !file_path.contains(":memory:") {
            // Readers keep going while a writer holds the lock
            options = options.journal_mode(SqliteJournalMode::Wal);
        }

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?;

        info!("✅ Database connection established");
        Ok(Self { pool })
    }

    /// Private in-memory database with the schema applied. Every pooled
    /// connection to `:memory:` is a separate database, so the pool is
    /// capped at a single connection.
    pub async fn in_memory() -> Result<Self, sqlx::Error> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect("sqlite::memory:")
            .await?;
        let db = Self { pool };
        db.migrate().await?;
        Ok(db)
    }

    /// Open a transaction that holds the write lock from its first statement.
    ///
    /// A deferred transaction that reads before it writes cannot upgrade its
    /// lock while another connection is writing, and SQLite fails it at once
    /// with `SQLITE_BUSY`. `BEGIN IMMEDIATE` queues writers on the busy
    /// timeout instead.
    pub async fn begin_write(&self) -> Result<WriteTx, sqlx::Error> {
        let mut conn = self.pool.acquire().await?;
        sqlx::query("BEGIN IMMEDIATE").execute(&mut *conn).await?;
        Ok(WriteTx { conn: Some(conn) })
    }

    pub async fn migrate(&self) -> Result<(), sqlx::Error> {
        // Users
        sqlx::query(r#"
            CREATE TABLE IF NOT EXISTS users (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                email TEXT UNIQUE NOT NULL,
                availability TEXT,
                year TEXT,
                bio TEXT,
                image_url TEXT,
                created_at INTEGER NOT NULL
            );
        "#).execute(&self.pool).await?;

        // Normalized course codes; one row per (user, course)
        sqlx::query(r#"
            CREATE TABLE IF NOT EXISTS user_courses (
                user_id TEXT NOT NULL,
                course_code TEXT NOT NULL,
                position INTEGER NOT NULL,
                PRIMARY KEY (user_id, course_code)
            );
        "#).execute(&self.pool).await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_user_courses_code ON user_courses (course_code);")
            .execute(&self.pool).await?;

        // Auth
        sqlx::query(r#"
            CREATE TABLE IF NOT EXISTS auth (
                user_id TEXT PRIMARY KEY,
                password_hash TEXT NOT NULL
            );
        "#).execute(&self.pool).await?;

        // Sessions
        sqlx::query(r#"
            CREATE TABLE IF NOT EXISTS sessions (
                user_id TEXT NOT NULL,
                session_token TEXT PRIMARY KEY,
                created_at INTEGER NOT NULL,
                expires_at INTEGER NOT NULL
            );
        "#).execute(&self.pool).await?;

        // Study groups
        sqlx::query(r#"
            CREATE TABLE IF NOT EXISTS study_groups (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                creator_id TEXT NOT NULL,
                max_members INTEGER NOT NULL CHECK (max_members BETWEEN 2 AND 20),
                is_public INTEGER NOT NULL DEFAULT 1,
                created_at INTEGER NOT NULL
            );
        "#).execute(&self.pool).await?;

        sqlx::query(r#"
            CREATE TABLE IF NOT EXISTS group_courses (
                group_id TEXT NOT NULL,
                course_code TEXT NOT NULL,
                position INTEGER NOT NULL,
                PRIMARY KEY (group_id, course_code)
            );
        "#).execute(&self.pool).await?;

        // Group members, ordered by position
        sqlx::query(r#"
            CREATE TABLE IF NOT EXISTS group_members (
                group_id TEXT NOT NULL,
                user_id TEXT NOT NULL,
                position INTEGER NOT NULL,
                joined_at INTEGER NOT NULL,
                PRIMARY KEY (group_id, user_id)
            );
        "#).execute(&self.pool).await?;

        // Join requests for private groups
        sqlx::query(r#"
            CREATE TABLE IF NOT EXISTS join_requests (
                id TEXT PRIMARY KEY,
                group_id TEXT NOT NULL,
                user_id TEXT NOT NULL,
                user_name TEXT NOT NULL,
                user_email TEXT NOT NULL,
                message TEXT,
                status TEXT NOT NULL,
                created_at INTEGER NOT NULL,
                responded_at INTEGER
            );
        "#).execute(&self.pool).await?;

        // At most one pending request per (group, user)
        sqlx::query(r#"
            CREATE UNIQUE INDEX IF NOT EXISTS idx_join_requests_pending
            ON join_requests (group_id, user_id) WHERE status = 'pending';
        "#).execute(&self.pool).await?;

        // AI-suggested group creations, for the reuse window
        sqlx::query(r#"
            CREATE TABLE IF NOT EXISTS ai_group_requests (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                user_id TEXT NOT NULL,
                course_code TEXT NOT NULL,
                group_id TEXT NOT NULL,
                created_at INTEGER NOT NULL
            );
        "#).execute(&self.pool).await?;

        Ok(())
    }
}

/// A `BEGIN IMMEDIATE` transaction on a pooled connection. Dropping it without
/// [`WriteTx::commit`] rolls the transaction back before the connection goes
/// back to the pool.
pub struct WriteTx {
    // Only `None` once `commit` has consumed the guard
    conn: Option<PoolConnection<Sqlite>>,
}

impl WriteTx {
    pub async fn commit(mut self) -> Result<(), sqlx::Error> {
        if let Some(mut conn) = self.conn.take() {
            if let Err(e) = sqlx::query("COMMIT").execute(&mut *conn).await {
                rollback_in_background(conn);
                return Err(e);
            }
        }
        Ok(())
    }
}

impl Deref for WriteTx {
    type Target = SqliteConnection;

    fn deref(&self) -> &SqliteConnection {
        self.conn.as_deref().expect("write transaction used after commit")
    }
}

impl DerefMut for WriteTx {
    fn deref_mut(&mut self) -> &mut SqliteConnection {
        self.conn.as_deref_mut().expect("write transaction used after commit")
    }
}

impl Drop for WriteTx {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            rollback_in_background(conn);
        }
    }
}

fn rollback_in_background(mut conn: PoolConnection<Sqlite>) {
    match tokio::runtime::Handle::try_current() {
        Ok(handle) => {
            handle.spawn(async move {
                if let Err(e) = sqlx::query("ROLLBACK").execute(&mut *conn).await {
                    warn!("Rollback failed, closing connection: {}", e);
                    // Closing the connection discards the open transaction
                    drop(conn.detach());
                }
            });
        }
        Err(_) => drop(conn.detach()),
    }
}
