//! SQLite store for applications, deployments and GitHub credentials
//!
//! All access goes through a single connection guarded by a mutex. Writes
//! that hit `SQLITE_BUSY`/`SQLITE_LOCKED` (another process holding the file
//! lock) are retried with exponential backoff before the error surfaces.
//! The backoff sleeps the calling thread, so async code reaches the store
//! through [`Database::call`], which runs on tokio's blocking pool.

use anyhow::{Context, Result};
use chrono::{DateTime, SecondsFormat, Utc};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension, Row, Transaction};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Current schema version for migrations
const SCHEMA_VERSION: i32 = 2;

/// Attempts made on a busy database before giving up
const BUSY_RETRIES: u32 = 6;

/// First backoff delay; doubles per attempt
const BUSY_BACKOFF: Duration = Duration::from_millis(20);

/// Current time in the format stored in every timestamp column
pub fn now_timestamp() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true)
}

fn parse_timestamp(value: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .ok()
        .map(|t| t.with_timezone(&Utc))
}

fn is_busy(err: &rusqlite::Error) -> bool {
    matches!(
        err,
        rusqlite::Error::SqliteFailure(e, _)
            if e.code == rusqlite::ErrorCode::DatabaseBusy
                || e.code == rusqlite::ErrorCode::DatabaseLocked
    )
}

/// Database connection wrapper with thread-safe access
#[derive(Clone)]
pub struct Database {
    conn: Arc<Mutex<Connection>>,
}

impl Database {
    /// Open or create a database at the given path
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let conn = Connection::open(path).context("Failed to open database")?;

        // WAL lets log readers proceed while a worker writes
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON;")?;
        conn.busy_timeout(Duration::from_millis(250))?;

        let db = Self {
            conn: Arc::new(Mutex::new(conn)),
        };

        db.run_migrations()?;

        info!("Database opened at {}", path.display());
        Ok(db)
    }

    /// Open an in-memory database (for testing)
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().context("Failed to open in-memory database")?;

        conn.execute_batch("PRAGMA foreign_keys=ON;")?;

        let db = Self {
            conn: Arc::new(Mutex::new(conn)),
        };

        db.run_migrations()?;
        Ok(db)
    }

    /// Run store work on the blocking pool
    pub async fn call<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Database) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let db = self.clone();
        tokio::task::spawn_blocking(move || f(&db))
            .await
            .context("Store task failed")?
    }

    /// Run `f` against the connection, retrying while the file is locked
    fn with_conn<T>(
        &self,
        mut f: impl FnMut(&mut Connection) -> rusqlite::Result<T>,
    ) -> rusqlite::Result<T> {
        let mut attempt = 0;
        loop {
            let result = {
                let mut conn = self.conn.lock();
                f(&mut conn)
            };
            match result {
                Err(e) if is_busy(&e) && attempt + 1 < BUSY_RETRIES => {
                    let delay = BUSY_BACKOFF * 2u32.pow(attempt);
                    warn!(attempt = attempt + 1, delay_ms = delay.as_millis() as u64, "Database busy, retrying");
                    std::thread::sleep(delay);
                    attempt += 1;
                }
                other => return other,
            }
        }
    }

    /// Run database migrations
    fn run_migrations(&self) -> Result<()> {
        let conn = self.conn.lock();

        conn.execute(
            "CREATE TABLE IF NOT EXISTS schema_migrations (
                version INTEGER PRIMARY KEY,
                applied_at TEXT NOT NULL DEFAULT (datetime('now'))
            )",
            [],
        )?;

        let current_version: i32 = conn
            .query_row(
                "SELECT COALESCE(MAX(version), 0) FROM schema_migrations",
                [],
                |row| row.get(0),
            )
            .unwrap_or(0);

        if current_version < SCHEMA_VERSION {
            info!("Running migrations from v{} to v{}", current_version, SCHEMA_VERSION);

            if current_version < 1 {
                Self::migrate_v1(&conn)?;
            }

            if current_version < 2 {
                Self::migrate_v2(&conn)?;
            }
        }

        Ok(())
    }

    /// Migration v1: Initial schema
    fn migrate_v1(conn: &Connection) -> Result<()> {
        debug!("Applying migration v1: initial schema");

        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS users (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                username TEXT NOT NULL UNIQUE,
                email TEXT NOT NULL DEFAULT '',
                role TEXT NOT NULL DEFAULT 'user',
                created_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS projects (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                name TEXT NOT NULL,
                owner_id INTEGER NOT NULL REFERENCES users(id),
                created_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS project_members (
                project_id INTEGER NOT NULL REFERENCES projects(id) ON DELETE CASCADE,
                user_id INTEGER NOT NULL REFERENCES users(id) ON DELETE CASCADE,
                PRIMARY KEY (project_id, user_id)
            );

            CREATE TABLE IF NOT EXISTS applications (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                project_id INTEGER NOT NULL REFERENCES projects(id) ON DELETE CASCADE,
                created_by INTEGER NOT NULL,
                name TEXT NOT NULL,
                git_repository TEXT,
                git_branch TEXT NOT NULL DEFAULT 'main',
                port INTEGER,
                root_directory TEXT NOT NULL DEFAULT '',
                dockerfile_path TEXT,
                deployment_strategy TEXT NOT NULL DEFAULT 'auto',
                status TEXT NOT NULL DEFAULT 'stopped',
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS deployments (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                app_id INTEGER NOT NULL REFERENCES applications(id) ON DELETE CASCADE,
                commit_hash TEXT NOT NULL,
                commit_message TEXT,
                commit_author TEXT,
                triggered_by INTEGER,
                deployment_number INTEGER NOT NULL,
                container_id TEXT,
                container_name TEXT,
                image_tag TEXT,
                build_logs_path TEXT,
                status TEXT NOT NULL DEFAULT 'pending',
                stage TEXT NOT NULL DEFAULT 'pending',
                progress INTEGER NOT NULL DEFAULT 0,
                error_message TEXT,
                created_at TEXT NOT NULL,
                started_at TEXT,
                finished_at TEXT,
                duration INTEGER,
                is_active INTEGER NOT NULL DEFAULT 0,
                rolled_back_from INTEGER,
                UNIQUE (app_id, deployment_number)
            );

            CREATE TABLE IF NOT EXISTS domains (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                app_id INTEGER NOT NULL REFERENCES applications(id) ON DELETE CASCADE,
                domain TEXT NOT NULL UNIQUE,
                ssl_status TEXT NOT NULL DEFAULT 'pending',
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS env_variables (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                app_id INTEGER NOT NULL REFERENCES applications(id) ON DELETE CASCADE,
                key TEXT NOT NULL,
                value TEXT NOT NULL,
                UNIQUE (app_id, key)
            );

            CREATE TABLE IF NOT EXISTS github_app (
                id INTEGER PRIMARY KEY CHECK (id = 1),
                app_id INTEGER NOT NULL,
                client_id TEXT NOT NULL DEFAULT '',
                client_secret TEXT NOT NULL DEFAULT '',
                webhook_secret TEXT NOT NULL DEFAULT '',
                private_key_pem TEXT NOT NULL,
                name TEXT NOT NULL DEFAULT '',
                slug TEXT NOT NULL DEFAULT ''
            );

            CREATE TABLE IF NOT EXISTS github_installations (
                installation_id INTEGER PRIMARY KEY,
                user_id INTEGER NOT NULL,
                account_login TEXT NOT NULL DEFAULT '',
                account_type TEXT NOT NULL DEFAULT 'User',
                access_token TEXT,
                token_expires_at TEXT
            );

            CREATE TABLE IF NOT EXISTS audit_logs (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                user_id INTEGER,
                action TEXT NOT NULL,
                resource_type TEXT NOT NULL,
                resource_id INTEGER,
                details TEXT NOT NULL DEFAULT '{}',
                created_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS system_settings (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_applications_repo ON applications(git_repository, git_branch);
            CREATE INDEX IF NOT EXISTS idx_deployments_app ON deployments(app_id);
            CREATE INDEX IF NOT EXISTS idx_deployments_status ON deployments(status);
            CREATE INDEX IF NOT EXISTS idx_domains_app ON domains(app_id);
            CREATE INDEX IF NOT EXISTS idx_installations_user ON github_installations(user_id);
            CREATE INDEX IF NOT EXISTS idx_audit_created ON audit_logs(created_at DESC);

            INSERT INTO schema_migrations (version) VALUES (1);
        "#,
        )?;

        Ok(())
    }

    /// Migration v2: at most one active deployment per application
    fn migrate_v2(conn: &Connection) -> Result<()> {
        debug!("Applying migration v2: single active deployment");

        conn.execute_batch(
            r#"
            CREATE UNIQUE INDEX IF NOT EXISTS idx_deployments_one_active
                ON deployments(app_id) WHERE is_active = 1;

            INSERT INTO schema_migrations (version) VALUES (2);
        "#,
        )?;

        Ok(())
    }

    // ==================== User Operations ====================

    /// Create a user, returning its id
    pub fn create_user(&self, username: &str, email: &str, role: &str) -> Result<i64> {
        let now = now_timestamp();
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO users (username, email, role, created_at) VALUES (?1, ?2, ?3, ?4)",
                params![username, email, role, now],
            )?;
            Ok(conn.last_insert_rowid())
        })
        .context("Failed to create user")
    }

    pub fn get_user(&self, id: i64) -> Result<Option<UserRecord>> {
        self.with_conn(|conn| {
            conn.query_row(
                "SELECT id, username, email, role, created_at FROM users WHERE id = ?1",
                params![id],
                |row| {
                    Ok(UserRecord {
                        id: row.get(0)?,
                        username: row.get(1)?,
                        email: row.get(2)?,
                        role: row.get(3)?,
                        created_at: row.get(4)?,
                    })
                },
            )
            .optional()
        })
        .context("Failed to get user")
    }

    pub fn count_users(&self) -> Result<i64> {
        self.with_conn(|conn| conn.query_row("SELECT COUNT(*) FROM users", [], |row| row.get(0)))
            .context("Failed to count users")
    }

    // ==================== Project Operations ====================

    /// Create a project; the owner becomes its first member
    pub fn create_project(&self, name: &str, owner_id: i64) -> Result<i64> {
        let now = now_timestamp();
        self.with_conn(|conn| {
            let tx = conn.transaction()?;
            tx.execute(
                "INSERT INTO projects (name, owner_id, created_at) VALUES (?1, ?2, ?3)",
                params![name, owner_id, now],
            )?;
            let id = tx.last_insert_rowid();
            tx.execute(
                "INSERT INTO project_members (project_id, user_id) VALUES (?1, ?2)",
                params![id, owner_id],
            )?;
            tx.commit()?;
            Ok(id)
        })
        .context("Failed to create project")
    }

    pub fn get_project(&self, id: i64) -> Result<Option<ProjectRecord>> {
        self.with_conn(|conn| {
            conn.query_row(
                "SELECT id, name, owner_id, created_at FROM projects WHERE id = ?1",
                params![id],
                |row| {
                    Ok(ProjectRecord {
                        id: row.get(0)?,
                        name: row.get(1)?,
                        owner_id: row.get(2)?,
                        created_at: row.get(3)?,
                    })
                },
            )
            .optional()
        })
        .context("Failed to get project")
    }

    pub fn add_project_member(&self, project_id: i64, user_id: i64) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT OR IGNORE INTO project_members (project_id, user_id) VALUES (?1, ?2)",
                params![project_id, user_id],
            )
        })
        .context("Failed to add project member")?;
        Ok(())
    }

    pub fn is_project_member(&self, project_id: i64, user_id: i64) -> Result<bool> {
        self.with_conn(|conn| {
            conn.query_row(
                "SELECT EXISTS(
                    SELECT 1 FROM project_members WHERE project_id = ?1 AND user_id = ?2
                    UNION ALL
                    SELECT 1 FROM projects WHERE id = ?1 AND owner_id = ?2
                 )",
                params![project_id, user_id],
                |row| row.get(0),
            )
        })
        .context("Failed to check project membership")
    }

    // ==================== Application Operations ====================

    /// Insert an application; `id`, `created_at` and `updated_at` are assigned here
    pub fn create_application(&self, app: &ApplicationRecord) -> Result<i64> {
        let now = now_timestamp();
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO applications (project_id, created_by, name, git_repository, git_branch,
                    port, root_directory, dockerfile_path, deployment_strategy, status,
                    created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?11)",
                params![
                    app.project_id,
                    app.created_by,
                    app.name,
                    app.git_repository,
                    app.git_branch,
                    app.port,
                    app.root_directory,
                    app.dockerfile_path,
                    app.deployment_strategy,
                    app.status,
                    now,
                ],
            )?;
            Ok(conn.last_insert_rowid())
        })
        .context("Failed to create application")
    }

    pub fn get_application(&self, id: i64) -> Result<Option<ApplicationRecord>> {
        self.with_conn(|conn| {
            conn.query_row(
                &format!("SELECT {} FROM applications WHERE id = ?1", APPLICATION_COLUMNS),
                params![id],
                application_from_row,
            )
            .optional()
        })
        .context("Failed to get application")
    }

    pub fn list_applications(&self, project_id: i64) -> Result<Vec<ApplicationRecord>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {} FROM applications WHERE project_id = ?1 ORDER BY id",
                APPLICATION_COLUMNS
            ))?;
            let apps = stmt
                .query_map(params![project_id], application_from_row)?
                .collect::<rusqlite::Result<Vec<_>>>();
            apps
        })
        .context("Failed to list applications")
    }

    pub fn update_application_status(&self, id: i64, status: &str) -> Result<()> {
        let now = now_timestamp();
        self.with_conn(|conn| {
            conn.execute(
                "UPDATE applications SET status = ?1, updated_at = ?2 WHERE id = ?3",
                params![status, now, id],
            )
        })
        .context("Failed to update application status")?;
        Ok(())
    }

    /// Resolve a webhook's (repository, branch) to an application
    ///
    /// When several applications track the same pair the oldest one wins.
    pub fn find_application_id_by_repo_and_branch(
        &self,
        repository: &str,
        branch: &str,
    ) -> Result<Option<i64>> {
        self.with_conn(|conn| {
            conn.query_row(
                "SELECT id FROM applications
                 WHERE git_repository = ?1 AND git_branch = ?2
                 ORDER BY id LIMIT 1",
                params![repository, branch],
                |row| row.get(0),
            )
            .optional()
        })
        .context("Failed to find application by repository")
    }

    // ==================== Deployment Operations ====================

    /// Insert a pending deployment with the next per-application number
    pub fn create_deployment(&self, new: &NewDeployment) -> Result<DeploymentRecord> {
        let now = now_timestamp();
        let id = self
            .with_conn(|conn| {
                let tx = conn.transaction()?;
                let number: i64 = tx.query_row(
                    "SELECT COALESCE(MAX(deployment_number), 0) + 1 FROM deployments WHERE app_id = ?1",
                    params![new.app_id],
                    |row| row.get(0),
                )?;
                tx.execute(
                    "INSERT INTO deployments (app_id, commit_hash, commit_message, commit_author,
                        triggered_by, deployment_number, status, stage, progress, created_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, 'pending', 'pending', 0, ?7)",
                    params![
                        new.app_id,
                        new.commit_hash,
                        new.commit_message,
                        new.commit_author,
                        new.triggered_by,
                        number,
                        now,
                    ],
                )?;
                let id = tx.last_insert_rowid();
                tx.commit()?;
                Ok(id)
            })
            .context("Failed to create deployment")?;

        self.get_deployment(id)?
            .context("Deployment disappeared after insert")
    }

    pub fn get_deployment(&self, id: i64) -> Result<Option<DeploymentRecord>> {
        self.with_conn(|conn| {
            conn.query_row(
                &format!("SELECT {} FROM deployments WHERE id = ?1", DEPLOYMENT_COLUMNS),
                params![id],
                deployment_from_row,
            )
            .optional()
        })
        .context("Failed to get deployment")
    }

    /// Recent deployments for an application, newest first
    pub fn list_deployments(&self, app_id: i64, limit: usize) -> Result<Vec<DeploymentRecord>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {} FROM deployments WHERE app_id = ?1
                 ORDER BY deployment_number DESC LIMIT ?2",
                DEPLOYMENT_COLUMNS
            ))?;
            let rows = stmt
                .query_map(params![app_id, limit as i64], deployment_from_row)?
                .collect::<rusqlite::Result<Vec<_>>>();
            rows
        })
        .context("Failed to list deployments")
    }

    /// Deployments that have not reached a terminal status, oldest first
    pub fn list_unfinished_deployments(&self) -> Result<Vec<DeploymentRecord>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {} FROM deployments
                 WHERE status IN ('pending', 'building', 'deploying')
                 ORDER BY id",
                DEPLOYMENT_COLUMNS
            ))?;
            let rows = stmt
                .query_map([], deployment_from_row)?
                .collect::<rusqlite::Result<Vec<_>>>();
            rows
        })
        .context("Failed to list unfinished deployments")
    }

    pub fn get_active_deployment_by_app_id(&self, app_id: i64) -> Result<Option<DeploymentRecord>> {
        self.with_conn(|conn| {
            conn.query_row(
                &format!(
                    "SELECT {} FROM deployments WHERE app_id = ?1 AND is_active = 1",
                    DEPLOYMENT_COLUMNS
                ),
                params![app_id],
                deployment_from_row,
            )
            .optional()
        })
        .context("Failed to get active deployment")
    }

    pub fn next_deployment_number(&self, app_id: i64) -> Result<i64> {
        self.with_conn(|conn| {
            conn.query_row(
                "SELECT COALESCE(MAX(deployment_number), 0) + 1 FROM deployments WHERE app_id = ?1",
                params![app_id],
                |row| row.get(0),
            )
        })
        .context("Failed to compute next deployment number")
    }

    /// Make `deployment_id` the only active deployment of `app_id`
    pub fn mark_deployment_active(&self, deployment_id: i64, app_id: i64) -> Result<()> {
        self.with_conn(|conn| {
            let tx = conn.transaction()?;
            activate(&tx, deployment_id, app_id)?;
            tx.commit()
        })
        .with_context(|| {
            format!(
                "Failed to mark deployment {} active for application {}",
                deployment_id, app_id
            )
        })
    }

    pub fn mark_deployment_started(&self, id: i64) -> Result<()> {
        let now = now_timestamp();
        self.with_conn(|conn| {
            conn.execute(
                "UPDATE deployments SET started_at = ?1 WHERE id = ?2",
                params![now, id],
            )
        })
        .context("Failed to mark deployment started")?;
        Ok(())
    }

    pub fn set_build_logs_path(&self, id: i64, path: &str) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "UPDATE deployments SET build_logs_path = ?1 WHERE id = ?2",
                params![path, id],
            )
        })
        .context("Failed to set build log path")?;
        Ok(())
    }

    /// Advance a deployment's status and stage
    ///
    /// Terminal statuses stamp `finished_at` and `duration`; others clear
    /// them. Progress never moves backwards except on `failed`, which
    /// resets it to 0 and drops the active flag.
    pub fn set_deployment_stage(
        &self,
        id: i64,
        status: DeploymentStatus,
        stage: DeploymentStage,
        progress: i64,
        error_message: Option<&str>,
    ) -> Result<()> {
        let now = now_timestamp();

        self.with_conn(|conn| {
            let tx = conn.transaction()?;
            write_stage(&tx, id, status, stage, progress, error_message, &now)?;
            tx.commit()
        })
        .with_context(|| format!("Failed to set stage of deployment {}", id))
    }

    /// Finish a deployment in one transaction
    ///
    /// Records the serving container, makes the row the only active one for
    /// its application, marks the application `running` and moves the row
    /// to `success`. Either all of it commits or none of it does.
    pub fn complete_deployment(
        &self,
        deployment_id: i64,
        app_id: i64,
        container_id: &str,
        container_name: &str,
        image_tag: &str,
    ) -> Result<()> {
        let now = now_timestamp();

        self.with_conn(|conn| {
            let tx = conn.transaction()?;
            tx.execute(
                "UPDATE deployments SET container_id = ?1, container_name = ?2, image_tag = ?3
                 WHERE id = ?4",
                params![container_id, container_name, image_tag, deployment_id],
            )?;
            activate(&tx, deployment_id, app_id)?;
            tx.execute(
                "UPDATE applications SET status = 'running', updated_at = ?1 WHERE id = ?2",
                params![now, app_id],
            )?;
            let success = DeploymentStage::Success;
            write_stage(
                &tx,
                deployment_id,
                success.status(),
                success,
                success.progress(),
                None,
                &now,
            )?;
            tx.commit()
        })
        .with_context(|| format!("Failed to complete deployment {}", deployment_id))
    }

    // ==================== Domain Operations ====================

    pub fn add_domain(&self, app_id: i64, domain: &str) -> Result<i64> {
        let now = now_timestamp();
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO domains (app_id, domain, ssl_status, created_at, updated_at)
                 VALUES (?1, ?2, 'pending', ?3, ?3)",
                params![app_id, domain, now],
            )?;
            Ok(conn.last_insert_rowid())
        })
        .context("Failed to add domain")
    }

    /// Domains for an application; the first entry is the primary domain
    pub fn list_domains(&self, app_id: i64) -> Result<Vec<DomainRecord>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, app_id, domain, ssl_status, created_at, updated_at
                 FROM domains WHERE app_id = ?1 ORDER BY created_at, id",
            )?;
            let rows = stmt
                .query_map(params![app_id], |row| {
                    Ok(DomainRecord {
                        id: row.get(0)?,
                        app_id: row.get(1)?,
                        domain: row.get(2)?,
                        ssl_status: row.get(3)?,
                        created_at: row.get(4)?,
                        updated_at: row.get(5)?,
                    })
                })?
                .collect::<rusqlite::Result<Vec<_>>>();
            rows
        })
        .context("Failed to list domains")
    }

    // ==================== Environment Operations ====================

    pub fn set_env_variable(&self, app_id: i64, key: &str, value: &str) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO env_variables (app_id, key, value) VALUES (?1, ?2, ?3)
                 ON CONFLICT(app_id, key) DO UPDATE SET value = excluded.value",
                params![app_id, key, value],
            )
        })
        .context("Failed to set environment variable")?;
        Ok(())
    }

    pub fn list_env_variables(&self, app_id: i64) -> Result<Vec<EnvVariableRecord>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, app_id, key, value FROM env_variables WHERE app_id = ?1 ORDER BY key",
            )?;
            let rows = stmt
                .query_map(params![app_id], |row| {
                    Ok(EnvVariableRecord {
                        id: row.get(0)?,
                        app_id: row.get(1)?,
                        key: row.get(2)?,
                        value: row.get(3)?,
                    })
                })?
                .collect::<rusqlite::Result<Vec<_>>>();
            rows
        })
        .context("Failed to list environment variables")
    }

    pub fn delete_env_variable(&self, app_id: i64, key: &str) -> Result<bool> {
        let rows = self
            .with_conn(|conn| {
                conn.execute(
                    "DELETE FROM env_variables WHERE app_id = ?1 AND key = ?2",
                    params![app_id, key],
                )
            })
            .context("Failed to delete environment variable")?;
        Ok(rows > 0)
    }

    // ==================== GitHub Operations ====================

    /// Store the singleton GitHub App row
    pub fn save_github_app(&self, app: &GitHubAppRecord) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO github_app (id, app_id, client_id, client_secret, webhook_secret,
                    private_key_pem, name, slug)
                 VALUES (1, ?1, ?2, ?3, ?4, ?5, ?6, ?7)
                 ON CONFLICT(id) DO UPDATE SET
                    app_id = excluded.app_id,
                    client_id = excluded.client_id,
                    client_secret = excluded.client_secret,
                    webhook_secret = excluded.webhook_secret,
                    private_key_pem = excluded.private_key_pem,
                    name = excluded.name,
                    slug = excluded.slug",
                params![
                    app.app_id,
                    app.client_id,
                    app.client_secret,
                    app.webhook_secret,
                    app.private_key_pem,
                    app.name,
                    app.slug
                ],
            )
        })
        .context("Failed to save GitHub app")?;
        Ok(())
    }

    pub fn get_github_app(&self) -> Result<Option<GitHubAppRecord>> {
        self.with_conn(|conn| {
            conn.query_row(
                "SELECT id, app_id, client_id, client_secret, webhook_secret, private_key_pem, name, slug
                 FROM github_app WHERE id = 1",
                [],
                |row| {
                    Ok(GitHubAppRecord {
                        id: row.get(0)?,
                        app_id: row.get(1)?,
                        client_id: row.get(2)?,
                        client_secret: row.get(3)?,
                        webhook_secret: row.get(4)?,
                        private_key_pem: row.get(5)?,
                        name: row.get(6)?,
                        slug: row.get(7)?,
                    })
                },
            )
            .optional()
        })
        .context("Failed to get GitHub app")
    }

    pub fn save_github_installation(&self, installation: &GitHubInstallationRecord) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO github_installations (installation_id, user_id, account_login,
                    account_type, access_token, token_expires_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                 ON CONFLICT(installation_id) DO UPDATE SET
                    user_id = excluded.user_id,
                    account_login = excluded.account_login,
                    account_type = excluded.account_type,
                    access_token = excluded.access_token,
                    token_expires_at = excluded.token_expires_at",
                params![
                    installation.installation_id,
                    installation.user_id,
                    installation.account_login,
                    installation.account_type,
                    installation.access_token,
                    installation.token_expires_at
                ],
            )
        })
        .context("Failed to save GitHub installation")?;
        Ok(())
    }

    /// Installation owned by a user (newest if several)
    pub fn get_installation_by_user(&self, user_id: i64) -> Result<Option<GitHubInstallationRecord>> {
        self.with_conn(|conn| {
            conn.query_row(
                "SELECT installation_id, user_id, account_login, account_type, access_token, token_expires_at
                 FROM github_installations WHERE user_id = ?1
                 ORDER BY installation_id DESC LIMIT 1",
                params![user_id],
                |row| {
                    Ok(GitHubInstallationRecord {
                        installation_id: row.get(0)?,
                        user_id: row.get(1)?,
                        account_login: row.get(2)?,
                        account_type: row.get(3)?,
                        access_token: row.get(4)?,
                        token_expires_at: row.get(5)?,
                    })
                },
            )
            .optional()
        })
        .context("Failed to get GitHub installation")
    }

    /// Store a refreshed token if the row still carries `expected_expires_at`
    ///
    /// Returns false when another writer refreshed the token first.
    pub fn update_installation_token(
        &self,
        installation_id: i64,
        token: &str,
        expires_at: &str,
        expected_expires_at: Option<&str>,
    ) -> Result<bool> {
        let rows = self
            .with_conn(|conn| {
                conn.execute(
                    "UPDATE github_installations SET access_token = ?1, token_expires_at = ?2
                     WHERE installation_id = ?3 AND token_expires_at IS ?4",
                    params![token, expires_at, installation_id, expected_expires_at],
                )
            })
            .context("Failed to update installation token")?;
        Ok(rows > 0)
    }

    // ==================== Audit Log Operations ====================

    pub fn insert_audit_log(
        &self,
        user_id: Option<i64>,
        action: &str,
        resource_type: &str,
        resource_id: Option<i64>,
        details: &serde_json::Value,
    ) -> Result<i64> {
        let now = now_timestamp();
        let details = details.to_string();
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO audit_logs (user_id, action, resource_type, resource_id, details, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![user_id, action, resource_type, resource_id, details, now],
            )?;
            Ok(conn.last_insert_rowid())
        })
        .context("Failed to insert audit log")
    }

    /// Most recent audit rows, newest first
    pub fn list_audit_logs(&self, limit: usize) -> Result<Vec<AuditLogRecord>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, user_id, action, resource_type, resource_id, details, created_at
                 FROM audit_logs ORDER BY id DESC LIMIT ?1",
            )?;
            let rows = stmt
                .query_map(params![limit as i64], |row| {
                    let user_id: Option<i64> = row.get(1)?;
                    let raw: String = row.get(5)?;
                    let details: serde_json::Value =
                        serde_json::from_str(&raw).unwrap_or(serde_json::Value::Null);
                    Ok(AuditLogRecord {
                        id: row.get(0)?,
                        trigger_type: TriggerType::derive(user_id, &details),
                        user_id,
                        action: row.get(2)?,
                        resource_type: row.get(3)?,
                        resource_id: row.get(4)?,
                        details,
                        created_at: row.get(6)?,
                    })
                })?
                .collect::<rusqlite::Result<Vec<_>>>();
            rows
        })
        .context("Failed to list audit logs")
    }

    // ==================== System Settings ====================

    pub fn get_setting(&self, key: &str) -> Result<Option<String>> {
        self.with_conn(|conn| {
            conn.query_row(
                "SELECT value FROM system_settings WHERE key = ?1",
                params![key],
                |row| row.get(0),
            )
            .optional()
        })
        .context("Failed to get setting")
    }

    pub fn set_setting(&self, key: &str, value: &str) -> Result<()> {
        let now = now_timestamp();
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO system_settings (key, value, updated_at) VALUES (?1, ?2, ?3)
                 ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at",
                params![key, value, now],
            )
        })
        .context("Failed to set setting")?;
        Ok(())
    }

    /// Settings the deployment core reads, empty when unset
    pub fn get_system_settings(&self) -> Result<SystemSettings> {
        Ok(SystemSettings {
            wildcard_domain: self.get_setting(SETTING_WILDCARD_DOMAIN)?.unwrap_or_default(),
            mist_app_name: self.get_setting(SETTING_MIST_APP_NAME)?.unwrap_or_default(),
            allowed_origins: self.get_setting(SETTING_ALLOWED_ORIGINS)?.unwrap_or_default(),
        })
    }
}

pub const SETTING_WILDCARD_DOMAIN: &str = "wildcardDomain";
pub const SETTING_MIST_APP_NAME: &str = "mistAppName";
pub const SETTING_ALLOWED_ORIGINS: &str = "allowedOrigins";
pub const SETTING_JWT_SECRET: &str = "jwtSecret";

const APPLICATION_COLUMNS: &str = "id, project_id, created_by, name, git_repository, git_branch, \
     port, root_directory, dockerfile_path, deployment_strategy, status, created_at, updated_at";

/// Clear the app's active flag and set it on `deployment_id`
fn activate(tx: &Transaction<'_>, deployment_id: i64, app_id: i64) -> rusqlite::Result<()> {
    tx.execute(
        "UPDATE deployments SET is_active = 0 WHERE app_id = ?1 AND is_active = 1",
        params![app_id],
    )?;
    let updated = tx.execute(
        "UPDATE deployments SET is_active = 1 WHERE id = ?1 AND app_id = ?2",
        params![deployment_id, app_id],
    )?;
    if updated != 1 {
        return Err(rusqlite::Error::QueryReturnedNoRows);
    }
    Ok(())
}

fn write_stage(
    tx: &Transaction<'_>,
    id: i64,
    status: DeploymentStatus,
    stage: DeploymentStage,
    progress: i64,
    error_message: Option<&str>,
    now: &str,
) -> rusqlite::Result<()> {
    let progress = progress.clamp(0, 100);
    let started_at: Option<Option<String>> = tx
        .query_row(
            "SELECT started_at FROM deployments WHERE id = ?1",
            params![id],
            |row| row.get(0),
        )
        .optional()?;
    let Some(started_at) = started_at else {
        return Err(rusqlite::Error::QueryReturnedNoRows);
    };

    if status.is_terminal() {
        let started_at = started_at.unwrap_or_else(|| now.to_string());
        let duration = match (parse_timestamp(&started_at), parse_timestamp(now)) {
            (Some(start), Some(end)) => (end - start).num_seconds().max(0),
            _ => 0,
        };
        tx.execute(
            "UPDATE deployments SET
                status = ?1,
                stage = ?2,
                progress = CASE WHEN ?2 = 'failed' THEN 0 ELSE MAX(progress, ?3) END,
                is_active = CASE WHEN ?2 = 'failed' THEN 0 ELSE is_active END,
                error_message = ?4,
                started_at = ?5,
                finished_at = ?6,
                duration = ?7
             WHERE id = ?8",
            params![
                status.as_str(),
                stage.as_str(),
                progress,
                error_message,
                started_at,
                now,
                duration,
                id
            ],
        )?;
    } else {
        tx.execute(
            "UPDATE deployments SET
                status = ?1,
                stage = ?2,
                progress = CASE WHEN ?2 = 'failed' THEN 0 ELSE MAX(progress, ?3) END,
                error_message = ?4,
                finished_at = NULL,
                duration = NULL
             WHERE id = ?5",
            params![status.as_str(), stage.as_str(), progress, error_message, id],
        )?;
    }
    Ok(())
}

fn application_from_row(row: &Row<'_>) -> rusqlite::Result<ApplicationRecord> {
    Ok(ApplicationRecord {
        id: row.get(0)?,
        project_id: row.get(1)?,
        created_by: row.get(2)?,
        name: row.get(3)?,
        git_repository: row.get(4)?,
        git_branch: row.get(5)?,
        port: row.get(6)?,
        root_directory: row.get(7)?,
        dockerfile_path: row.get(8)?,
        deployment_strategy: row.get(9)?,
        status: row.get(10)?,
        created_at: row.get(11)?,
        updated_at: row.get(12)?,
    })
}

const DEPLOYMENT_COLUMNS: &str = "id, app_id, commit_hash, commit_message, commit_author, \
     triggered_by, deployment_number, container_id, container_name, image_tag, build_logs_path, \
     status, stage, progress, error_message, created_at, started_at, finished_at, duration, \
     is_active, rolled_back_from";

fn deployment_from_row(row: &Row<'_>) -> rusqlite::Result<DeploymentRecord> {
    Ok(DeploymentRecord {
        id: row.get(0)?,
        app_id: row.get(1)?,
        commit_hash: row.get(2)?,
        commit_message: row.get(3)?,
        commit_author: row.get(4)?,
        triggered_by: row.get(5)?,
        deployment_number: row.get(6)?,
        container_id: row.get(7)?,
        container_name: row.get(8)?,
        image_tag: row.get(9)?,
        build_logs_path: row.get(10)?,
        status: row.get(11)?,
        stage: row.get(12)?,
        progress: row.get(13)?,
        error_message: row.get(14)?,
        created_at: row.get(15)?,
        started_at: row.get(16)?,
        finished_at: row.get(17)?,
        duration: row.get(18)?,
        is_active: row.get(19)?,
        rolled_back_from: row.get(20)?,
    })
}

// ==================== Status Types ====================

/// Persisted deployment status
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeploymentStatus {
    Pending,
    Building,
    Deploying,
    Success,
    Failed,
    Stopped,
    RolledBack,
}

impl DeploymentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeploymentStatus::Pending => "pending",
            DeploymentStatus::Building => "building",
            DeploymentStatus::Deploying => "deploying",
            DeploymentStatus::Success => "success",
            DeploymentStatus::Failed => "failed",
            DeploymentStatus::Stopped => "stopped",
            DeploymentStatus::RolledBack => "rolled_back",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        Some(match value {
            "pending" => DeploymentStatus::Pending,
            "building" => DeploymentStatus::Building,
            "deploying" => DeploymentStatus::Deploying,
            "success" => DeploymentStatus::Success,
            "failed" => DeploymentStatus::Failed,
            "stopped" => DeploymentStatus::Stopped,
            "rolled_back" => DeploymentStatus::RolledBack,
            _ => return None,
        })
    }

    /// Statuses that carry `finished_at` and `duration`
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            DeploymentStatus::Success | DeploymentStatus::Failed | DeploymentStatus::Stopped
        )
    }
}

/// Stage of the deployment state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeploymentStage {
    Pending,
    Cloning,
    Building,
    Deploying,
    Success,
    Failed,
}

impl DeploymentStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeploymentStage::Pending => "pending",
            DeploymentStage::Cloning => "cloning",
            DeploymentStage::Building => "building",
            DeploymentStage::Deploying => "deploying",
            DeploymentStage::Success => "success",
            DeploymentStage::Failed => "failed",
        }
    }

    /// Progress shown for the stage
    pub fn progress(&self) -> i64 {
        match self {
            DeploymentStage::Pending => 0,
            DeploymentStage::Cloning => 20,
            DeploymentStage::Building => 50,
            DeploymentStage::Deploying => 80,
            DeploymentStage::Success => 100,
            DeploymentStage::Failed => 0,
        }
    }

    /// Status persisted alongside the stage
    pub fn status(&self) -> DeploymentStatus {
        match self {
            DeploymentStage::Pending => DeploymentStatus::Pending,
            DeploymentStage::Cloning | DeploymentStage::Building => DeploymentStatus::Building,
            DeploymentStage::Deploying => DeploymentStatus::Deploying,
            DeploymentStage::Success => DeploymentStatus::Success,
            DeploymentStage::Failed => DeploymentStatus::Failed,
        }
    }
}

/// Who caused an audited action
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TriggerType {
    User,
    Webhook,
    System,
}

impl TriggerType {
    pub fn as_str(&self) -> &'static str {
        match self {
            TriggerType::User => "user",
            TriggerType::Webhook => "webhook",
            TriggerType::System => "system",
        }
    }

    /// Rows without a user are webhook or system actions when tagged so
    pub fn derive(user_id: Option<i64>, details: &serde_json::Value) -> Self {
        if user_id.is_some() {
            return TriggerType::User;
        }
        match details.get("trigger_type").and_then(|v| v.as_str()) {
            Some("webhook") => TriggerType::Webhook,
            Some("system") => TriggerType::System,
            _ => TriggerType::User,
        }
    }
}

// ==================== Record Types ====================

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserRecord {
    pub id: i64,
    pub username: String,
    pub email: String,
    pub role: String,
    pub created_at: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProjectRecord {
    pub id: i64,
    pub name: String,
    pub owner_id: i64,
    pub created_at: String,
}

/// Application record from database
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApplicationRecord {
    pub id: i64,
    pub project_id: i64,
    pub created_by: i64,
    pub name: String,
    /// `owner/repo`
    pub git_repository: Option<String>,
    pub git_branch: String,
    pub port: Option<i64>,
    pub root_directory: String,
    pub dockerfile_path: Option<String>,
    /// `auto` or `manual`
    pub deployment_strategy: String,
    /// `stopped`, `running`, `error` or `building`
    pub status: String,
    pub created_at: String,
    pub updated_at: String,
}

impl ApplicationRecord {
    /// A new application row with defaults for everything optional
    pub fn new(project_id: i64, created_by: i64, name: impl Into<String>) -> Self {
        Self {
            id: 0,
            project_id,
            created_by,
            name: name.into(),
            git_repository: None,
            git_branch: "main".to_string(),
            port: None,
            root_directory: String::new(),
            dockerfile_path: None,
            deployment_strategy: "auto".to_string(),
            status: "stopped".to_string(),
            created_at: String::new(),
            updated_at: String::new(),
        }
    }
}

/// Fields supplied by a deployment producer
#[derive(Debug, Clone, Default)]
pub struct NewDeployment {
    pub app_id: i64,
    pub commit_hash: String,
    pub commit_message: Option<String>,
    pub commit_author: Option<String>,
    pub triggered_by: Option<i64>,
}

/// Deployment record from database
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeploymentRecord {
    pub id: i64,
    pub app_id: i64,
    pub commit_hash: String,
    pub commit_message: Option<String>,
    pub commit_author: Option<String>,
    pub triggered_by: Option<i64>,
    pub deployment_number: i64,
    pub container_id: Option<String>,
    pub container_name: Option<String>,
    pub image_tag: Option<String>,
    pub build_logs_path: Option<String>,
    pub status: String,
    pub stage: String,
    pub progress: i64,
    pub error_message: Option<String>,
    pub created_at: String,
    pub started_at: Option<String>,
    pub finished_at: Option<String>,
    pub duration: Option<i64>,
    pub is_active: bool,
    pub rolled_back_from: Option<i64>,
}

impl DeploymentRecord {
    pub fn status(&self) -> Option<DeploymentStatus> {
        DeploymentStatus::parse(&self.status)
    }

    pub fn is_terminal(&self) -> bool {
        self.status().map(|s| s.is_terminal()).unwrap_or(false)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DomainRecord {
    pub id: i64,
    pub app_id: i64,
    pub domain: String,
    pub ssl_status: String,
    pub created_at: String,
    pub updated_at: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EnvVariableRecord {
    pub id: i64,
    pub app_id: i64,
    pub key: String,
    pub value: String,
}

/// The singleton GitHub App configuration
#[derive(Debug, Clone, Default)]
pub struct GitHubAppRecord {
    pub id: i64,
    pub app_id: i64,
    pub client_id: String,
    pub client_secret: String,
    pub webhook_secret: String,
    pub private_key_pem: String,
    pub name: String,
    pub slug: String,
}

#[derive(Debug, Clone, Default)]
pub struct GitHubInstallationRecord {
    pub installation_id: i64,
    pub user_id: i64,
    pub account_login: String,
    pub account_type: String,
    pub access_token: Option<String>,
    pub token_expires_at: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditLogRecord {
    pub id: i64,
    pub user_id: Option<i64>,
    pub action: String,
    pub resource_type: String,
    pub resource_id: Option<i64>,
    pub details: serde_json::Value,
    pub created_at: String,
    pub trigger_type: TriggerType,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SystemSettings {
    pub wildcard_domain: String,
    pub mist_app_name: String,
    /// Comma separated origins allowed to open WebSockets
    pub allowed_origins: String,
}
