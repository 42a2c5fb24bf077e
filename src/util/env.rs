//! Environment helpers: centralized dotenv loading and ergonomic getters.
//! Call `init_env()` once early in each binary (or rely on lazy Once).
use std::str::FromStr;
use std::sync::Once;
use tracing::{debug, info};

static INIT: Once = Once::new();

/// Load .env exactly once. Safe to call many times.
pub fn init_env() {
    INIT.call_once(|| {
        let _ = dotenv::dotenv();
    });
}

/// Common bootstrap for CLI binaries: load .env and note which DSN source wins.
pub fn bootstrap_cli(bin_name: &str) {
    init_env();
    match db_url_source() {
        Some(source) => debug!(target: "bootstrap", bin = bin_name, source, "database url source"),
        None => info!(
            target: "bootstrap",
            bin = bin_name,
            "no database url configured; only --dry-run imports will work"
        ),
    }
}

/// Get required env var; error if missing.
pub fn env_req(key: &str) -> anyhow::Result<String> {
    init_env();
    std::env::var(key).map_err(|_| anyhow::anyhow!("missing env var {key}"))
}

/// Get optional env var (None if unset or empty).
pub fn env_opt(key: &str) -> Option<String> {
    init_env();
    match std::env::var(key) {
        Ok(v) if !v.trim().is_empty() => Some(v),
        _ => None,
    }
}

/// Get parsed value with default fallback.
pub fn env_parse<T>(key: &str, default: T) -> T
where
    T: FromStr + Clone,
{
    init_env();
    match std::env::var(key) {
        Ok(raw) => raw.trim().parse::<T>().unwrap_or(default),
        Err(_) => default,
    }
}

/// Boolean flag; accepts 1/true/on/yes (case-insensitive) as true.
pub fn env_flag(key: &str, default: bool) -> bool {
    init_env();
    match std::env::var(key) {
        Ok(raw) => {
            let v = raw.trim().to_ascii_lowercase();
            matches!(v.as_str(), "1" | "true" | "on" | "yes")
        }
        Err(_) => default,
    }
}

/// Optional parsed value.
pub fn env_parse_opt<T>(key: &str) -> Option<T>
where
    T: FromStr,
{
    init_env();
    std::env::var(key).ok().and_then(|s| s.trim().parse().ok())
}

const URL_KEYS: [&str; 3] = ["FEC_DATABASE_URL", "DATABASE_URL", "DB_URL"];

fn db_url_source() -> Option<&'static str> {
    URL_KEYS
        .into_iter()
        .find(|k| env_opt(k).is_some())
        .or_else(|| build_dsn_from_parts().map(|_| "DB_*"))
}

/// Composed database URL (tries specific -> generic). Returns first found.
pub fn db_url() -> anyhow::Result<String> {
    init_env();
    for k in URL_KEYS {
        if let Some(v) = env_opt(k) {
            return Ok(v);
        }
    }
    if let Some(dsn) = build_dsn_from_parts() {
        return Ok(dsn);
    }
    Err(anyhow::anyhow!(
        "no database URL env vars set (FEC_DATABASE_URL, DATABASE_URL, DB_URL or DB_HOST/DB_USERNAME)"
    ))
}

fn build_dsn_from_parts() -> Option<String> {
    let host = env_opt("DB_HOST")?;
    let user = env_opt("DB_USERNAME")?;
    let password = env_opt("DB_PASSWORD");
    let database = env_opt("DB_DATABASE").unwrap_or_else(|| "postgres".into());
    let port: u16 = env_parse("DB_PORT", 5432u16);
    let ssl_mode = env_opt("DB_SSLMODE").unwrap_or_else(|| "prefer".into());

    // Build via `url::Url` so reserved characters in the password are encoded.
    let mut out = url::Url::parse("postgresql://localhost").ok()?;
    out.set_username(&user).ok()?;
    if let Some(pass) = password {
        out.set_password(Some(&pass)).ok()?;
    }
    let host_trimmed = host.trim().trim_matches(|c| c == '[' || c == ']');
    if host_trimmed.contains(':') {
        out.set_host(Some(&format!("[{host_trimmed}]"))).ok()?;
    } else {
        out.set_host(Some(host_trimmed)).ok()?;
    }
    out.set_port(Some(port)).ok()?;
    out.set_path(&format!("/{database}"));
    if ssl_mode != "disable" {
        out.query_pairs_mut().append_pair("sslmode", &ssl_mode);
    }
    Some(out.to_string())
}

pub(crate) fn redact_value(key: &str, val: &str) -> String {
    let k = key.to_ascii_uppercase();
    if k.contains("PASSWORD") || k.contains("SECRET") || k.contains("TOKEN") {
        return "***".to_string();
    }
    let val_trim = val.trim();
    if let Ok(mut u) = url::Url::parse(val_trim) {
        let scheme = u.scheme().to_ascii_lowercase();
        if scheme == "postgres" || scheme == "postgresql" {
            let _ = u.set_username("***");
            let _ = u.set_password(Some("***"));
            return u.to_string();
        }
    }
    val_trim.to_string()
}

/// Validate required keys and log a consolidated, redacted snapshot of configuration.
/// Returns error if any required key is missing.
pub fn preflight_check(title: &str, required: &[&str], also_log: &[&str]) -> anyhow::Result<()> {
    init_env();
    let missing: Vec<&str> = required
        .iter()
        .copied()
        .filter(|k| env_opt(k).is_none())
        .collect();
    let snapshot: Vec<(String, String)> = also_log
        .iter()
        .map(|&k| (k.to_string(), redact_value(k, &env_opt(k).unwrap_or_default())))
        .collect();
    info!(target: "preflight", title, snapshot = ?snapshot, "configuration snapshot");
    if !missing.is_empty() {
        return Err(anyhow::anyhow!("missing required env: {:?}", missing));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn redacts_credentials_in_postgres_urls() {
        let out = redact_value("DATABASE_URL", "postgres://fec:hunter2@db:5432/fec");
        assert!(!out.contains("hunter2"));
        assert!(out.contains("db:5432/fec"));
        assert_eq!(redact_value("DB_PASSWORD", "hunter2"), "***");
        assert_eq!(redact_value("FEC_CHUNK_SIZE", " 500 "), "500");
    }

    #[test]
    fn parse_falls_back_on_garbage() {
        std::env::set_var("FEC_TEST_ENV_PARSE", "not-a-number");
        assert_eq!(env_parse("FEC_TEST_ENV_PARSE", 7usize), 7);
        std::env::set_var("FEC_TEST_ENV_PARSE", " 12 ");
        assert_eq!(env_parse("FEC_TEST_ENV_PARSE", 7usize), 12);
        assert_eq!(env_parse_opt::<u32>("FEC_TEST_ENV_PARSE_MISSING"), None);
    }
}
