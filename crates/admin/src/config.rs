use mwt_core::{events::default_events_dir, StoreSettings};
use std::{collections::BTreeMap, env, fmt, net::SocketAddr, path::PathBuf};

const DEFAULT_ADDR: ([u8; 4], u16) = ([127, 0, 0, 1], 8780);
const DEFAULT_TIMEOUT_MS: u64 = 30_000;
const DEFAULT_CONCURRENCY: u64 = 64;

/// Control-plane server configuration, read from `MWT_*` environment variables.
#[derive(Clone, PartialEq)]
pub struct AdminConfig {
    pub addr: SocketAddr,
    /// Shared secret expected in the `auth` header. `None` rejects every call.
    pub password: Option<String>,
    pub store: StoreSettings,
    pub events_dir: PathBuf,
    /// 0 disables the request timeout.
    pub timeout_ms: u64,
    /// 0 disables the concurrency limit.
    pub concurrency: u64,
}

impl Default for AdminConfig {
    fn default() -> Self {
        Self {
            addr: SocketAddr::from(DEFAULT_ADDR),
            password: None,
            store: StoreSettings::default(),
            events_dir: default_events_dir(),
            timeout_ms: DEFAULT_TIMEOUT_MS,
            concurrency: DEFAULT_CONCURRENCY,
        }
    }
}

// The password never shows up in logs.
impl fmt::Debug for AdminConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AdminConfig")
            .field("addr", &self.addr)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .field("store", &self.store)
            .field("events_dir", &self.events_dir)
            .field("timeout_ms", &self.timeout_ms)
            .field("concurrency", &self.concurrency)
            .finish()
    }
}

fn env_u64(key: &str, default: u64) -> u64 {
    match env::var(key) {
        Ok(v) => v.parse::<u64>().unwrap_or_else(|_| {
            tracing::warn!("Invalid value for {key}='{}' – falling back to {default}", v);
            default
        }),
        Err(_) => default,
    }
}

fn env_nonempty(key: &str) -> Option<String> {
    env::var(key).ok().filter(|v| !v.trim().is_empty())
}

impl AdminConfig {
    /// Reads:
    ///   MWT_ADMIN_ADDR (default 127.0.0.1:8780)
    ///   MWT_ADMIN_PASSWORD
    ///   MWT_STORE_URL (HTTP store) or MWT_STORE_PATH (SQLite store)
    ///   MWT_EVENTS_DIR
    ///   MWT_HTTP_TIMEOUT_MS, MWT_HTTP_CONCURRENCY
    pub fn from_env() -> anyhow::Result<Self> {
        let defaults = Self::default();
        let addr = match env_nonempty("MWT_ADMIN_ADDR") {
            Some(v) => v
                .parse()
                .map_err(|e| anyhow::anyhow!("invalid MWT_ADMIN_ADDR '{v}': {e}"))?,
            None => defaults.addr,
        };
        let store = match (env_nonempty("MWT_STORE_URL"), env_nonempty("MWT_STORE_PATH")) {
            (Some(base_url), _) => StoreSettings::Http { base_url },
            (None, Some(path)) => StoreSettings::Sqlite {
                path: Some(path.into()),
            },
            (None, None) => defaults.store,
        };
        let password = env_nonempty("MWT_ADMIN_PASSWORD");
        if password.is_none() {
            tracing::warn!("MWT_ADMIN_PASSWORD not set – all automation endpoints will reject requests");
        }

        Ok(Self {
            addr,
            password,
            store,
            events_dir: env_nonempty("MWT_EVENTS_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.events_dir),
            timeout_ms: env_u64("MWT_HTTP_TIMEOUT_MS", DEFAULT_TIMEOUT_MS),
            concurrency: env_u64("MWT_HTTP_CONCURRENCY", DEFAULT_CONCURRENCY),
        })
    }

    /// Non-secret settings, as served by the app-settings endpoint.
    pub fn app_settings(&self) -> BTreeMap<String, String> {
        let mut out = BTreeMap::new();
        out.insert("addr".into(), self.addr.to_string());
        out.insert("auth_configured".into(), self.password.is_some().to_string());
        match &self.store {
            StoreSettings::Http { base_url } => {
                out.insert("store.kind".into(), "http".into());
                out.insert("store.base_url".into(), base_url.clone());
            }
            StoreSettings::Sqlite { path } => {
                out.insert("store.kind".into(), "sqlite".into());
                if let Some(path) = path {
                    out.insert("store.path".into(), path.display().to_string());
                }
            }
        }
        out.insert("events_dir".into(), self.events_dir.display().to_string());
        out.insert("http.timeout_ms".into(), self.timeout_ms.to_string());
        out.insert("http.concurrency".into(), self.concurrency.to_string());
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    const KEYS: [&str; 7] = [
        "MWT_ADMIN_ADDR",
        "MWT_ADMIN_PASSWORD",
        "MWT_STORE_URL",
        "MWT_STORE_PATH",
        "MWT_EVENTS_DIR",
        "MWT_HTTP_TIMEOUT_MS",
        "MWT_HTTP_CONCURRENCY",
    ];

    fn clear_env() {
        for key in KEYS {
            env::remove_var(key);
        }
    }

    #[test]
    #[serial]
    fn defaults_without_environment() {
        clear_env();
        let cfg = AdminConfig::from_env().unwrap();
        assert_eq!(cfg.addr.to_string(), "127.0.0.1:8780");
        assert!(cfg.password.is_none());
        assert_eq!(cfg.timeout_ms, DEFAULT_TIMEOUT_MS);
        assert_eq!(cfg.store, StoreSettings::Sqlite { path: None });
    }

    #[test]
    #[serial]
    fn environment_overrides_and_invalid_numbers_fall_back() {
        clear_env();
        env::set_var("MWT_ADMIN_PASSWORD", "s3cret");
        env::set_var("MWT_STORE_URL", "https://blobs.example/");
        env::set_var("MWT_STORE_PATH", "/ignored/when/url/is/set.db");
        env::set_var("MWT_HTTP_TIMEOUT_MS", "soon");
        env::set_var("MWT_HTTP_CONCURRENCY", "8");

        let cfg = AdminConfig::from_env().unwrap();
        clear_env();

        assert_eq!(cfg.password.as_deref(), Some("s3cret"));
        assert_eq!(
            cfg.store,
            StoreSettings::Http {
                base_url: "https://blobs.example/".into()
            }
        );
        assert_eq!(cfg.timeout_ms, DEFAULT_TIMEOUT_MS);
        assert_eq!(cfg.concurrency, 8);
    }

    #[test]
    fn secrets_stay_out_of_debug_and_app_settings() {
        let cfg = AdminConfig {
            password: Some("s3cret".into()),
            ..AdminConfig::default()
        };
        assert!(!format!("{cfg:?}").contains("s3cret"));
        let settings = cfg.app_settings();
        assert!(settings.values().all(|v| v != "s3cret"));
        assert_eq!(settings["auth_configured"], "true");
    }
}
