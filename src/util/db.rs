use anyhow::{Context, Result};
use sqlx::{
    postgres::{PgConnectOptions, PgPoolOptions, PgSslMode},
    PgPool, Row,
};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;
use tracing::{info, instrument, warn};

use crate::util::env::{env_flag, env_parse};

pub const MIGRATIONS_DIR: &str = "./migrations";

#[derive(Clone)]
pub struct Db {
    pub pool: PgPool,
}

impl Db {
    // SECURITY: never include raw DSNs in tracing spans (they may contain credentials).
    #[instrument(skip(database_url))]
    pub async fn connect(
        database_url: &str,
        max_connections: u32,
        acquire_timeout: Duration,
    ) -> Result<Self> {
        let mut connect_options = PgConnectOptions::from_str(database_url)
            .context("parse database url")?;
        if database_url.contains("sslmode=require") {
            connect_options = connect_options.ssl_mode(PgSslMode::Require);
        }
        if !env_flag("USE_PREPARED", false) {
            // PgBouncer txn mode safe
            connect_options = connect_options.statement_cache_capacity(0);
        }

        // Optional bulk-load session tuning
        let fast_ingest = env_flag("FAST_INGEST", false);
        let work_mem_mb: u32 = env_parse("FAST_INGEST_WORK_MEM_MB", 64);

        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .acquire_timeout(acquire_timeout)
            .idle_timeout(Duration::from_secs(600))
            .after_connect(move |conn, _meta| {
                Box::pin(async move {
                    if fast_ingest {
                        // Best-effort; ignore errors to avoid blocking startup in restricted envs
                        let _ = sqlx::query("SET synchronous_commit = 'off'")
                            .execute(&mut *conn)
                            .await;
                        let _ = sqlx::query(&format!("SET work_mem = '{work_mem_mb}MB'"))
                            .execute(&mut *conn)
                            .await;
                    }
                    Ok(())
                })
            })
            .connect_with(connect_options)
            .await
            .context("connect to postgres")?;
        info!(max_connections, "connected to db");

        // Optional auto-migrate gate (default: OFF). Enable with AUTO_MIGRATE=1/true/on.
        if env_flag("AUTO_MIGRATE", false) {
            info!("running migrations (AUTO_MIGRATE=on)");
            Self::run_migrations(&pool, Path::new(MIGRATIONS_DIR)).await?;
        } else {
            info!("AUTO_MIGRATE disabled; skipping migrations");
        }
        Ok(Self { pool })
    }

    pub async fn migrate(&self) -> Result<usize> {
        Self::run_migrations(&self.pool, Path::new(MIGRATIONS_DIR)).await
    }

    /// Apply `NNNN_description.sql` files in version order, once each.
    /// Returns the number of files applied.
    pub async fn run_migrations(pool: &PgPool, dir: &Path) -> Result<usize> {
        if !dir.exists() {
            warn!(dir = %dir.display(), "migrations directory missing; nothing to apply");
            return Ok(0);
        }
        // raw_sql avoids prepared statements under PgBouncer
        sqlx::raw_sql(
            "CREATE TABLE IF NOT EXISTS fec_schema_migrations (
                version BIGINT PRIMARY KEY,
                description TEXT,
                installed_at TIMESTAMPTZ DEFAULT now()
             )",
        )
        .execute(pool)
        .await?;
        let mut applied: HashSet<i64> = HashSet::new();
        for r in sqlx::raw_sql("SELECT version FROM fec_schema_migrations")
            .fetch_all(pool)
            .await?
        {
            applied.insert(r.try_get::<i64, _>(0)?);
        }

        let mut count = 0;
        for (version, desc, path) in migration_files(dir)? {
            if applied.contains(&version) {
                continue;
            }
            let sql = std::fs::read_to_string(&path)
                .with_context(|| format!("read migration {}", path.display()))?;
            info!(version, file = ?path, "applying migration");

            let (transactional, concurrent) = split_concurrent_indexes(&sql);
            if !transactional.trim().is_empty() {
                sqlx::raw_sql(transactional.trim())
                    .execute(pool)
                    .await
                    .with_context(|| format!("migration {version} ({desc})"))?;
            }
            // CREATE INDEX CONCURRENTLY cannot run inside the implicit transaction above.
            for stmt in concurrent {
                info!(migration_version = version, index_stmt = %stmt, "creating concurrent index");
                sqlx::raw_sql(&stmt)
                    .execute(pool)
                    .await
                    .with_context(|| format!("migration {version}: {stmt}"))?;
            }
            let insert_stmt = format!(
                "INSERT INTO fec_schema_migrations(version, description) VALUES ({}, '{}')",
                version,
                desc.replace('\'', "''")
            );
            sqlx::raw_sql(&insert_stmt).execute(pool).await?;
            applied.insert(version);
            count += 1;
        }
        info!(applied = count, "migrations up-to-date");
        Ok(count)
    }
}

/// Versioned migration files, sorted; names without a numeric prefix are ignored.
fn migration_files(dir: &Path) -> Result<Vec<(i64, String, PathBuf)>> {
    let mut out = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        let path = entry?.path();
        if !path.is_file() {
            continue;
        }
        let Some(fname) = path.file_name().and_then(|s| s.to_str()) else {
            continue;
        };
        if let Some((version, desc)) = parse_migration_name(fname) {
            out.push((version, desc, path));
        }
    }
    out.sort_by_key(|(v, _, _)| *v);
    Ok(out)
}

fn parse_migration_name(fname: &str) -> Option<(i64, String)> {
    let stem = fname.strip_suffix(".sql")?;
    let digits = stem.bytes().take_while(u8::is_ascii_digit).count();
    if digits == 0 {
        return None;
    }
    let (num, rest) = stem.split_at(digits);
    let desc = rest.strip_prefix('_')?;
    Some((num.parse().ok()?, desc.to_string()))
}

/// Separate `CREATE INDEX CONCURRENTLY` statements from the rest of a migration.
fn split_concurrent_indexes(sql: &str) -> (String, Vec<String>) {
    let mut transactional = String::with_capacity(sql.len());
    let mut concurrent = Vec::new();
    let mut buf = String::new();
    let mut capturing = false;
    for line in sql.lines() {
        if !capturing
            && line
                .trim_start()
                .to_ascii_lowercase()
                .starts_with("create index concurrently")
        {
            capturing = true;
            buf.clear();
        }
        if capturing {
            buf.push_str(line);
            buf.push('\n');
            if line.contains(';') {
                capturing = false;
                concurrent.push(buf.trim().to_string());
            }
            continue;
        }
        transactional.push_str(line);
        transactional.push('\n');
    }
    (transactional, concurrent)
}
