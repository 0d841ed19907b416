use serde::Deserialize;
use std::env;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::jobs::QueueSettings;
use crate::platform::{CredentialPair, PlatformCredentials, PlatformSettings};
use crate::retry::ContentionPolicy;
use crate::shadow::ShadowPolicy;
use crate::worker::RetryPolicy;

pub const DEFAULT_MAX_BODY_BYTES: usize = 1024 * 1024;
const DEFAULT_ACCEPTED_OBJECTS: &str = "instagram,page";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to parse config file: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid {key}: {value}")]
    Invalid { key: &'static str, value: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueBackend {
    /// Shared SQLite wake-lists; gateway and workers may be separate processes.
    Sqlite,
    /// In-process channels; only for a single process.
    Memory,
}

#[derive(Debug, Clone)]
pub struct GatewaySettings {
    pub host: String,
    pub port: u16,
    pub max_body_bytes: usize,
    pub verify_token: Option<String>,
}

#[derive(Debug, Clone)]
pub struct DrafterSettings {
    pub url: String,
    pub token: Option<String>,
    pub timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct InboxConfig {
    pub db_path: PathBuf,
    pub queue_backend: QueueBackend,
    pub queue: QueueSettings,
    pub retry: RetryPolicy,
    pub contention: ContentionPolicy,
    pub shadow: ShadowPolicy,
    pub shadow_poll_interval: Duration,
    pub app_secret: Option<String>,
    pub accepted_objects: Vec<String>,
    pub gateway: GatewaySettings,
    pub platform: PlatformSettings,
    pub directory_max_pages: usize,
    pub drafter: Option<DrafterSettings>,
}

/// Optional TOML overrides for the tunables that are awkward as env vars.
#[derive(Debug, Default, Deserialize)]
struct InboxConfigFile {
    #[serde(default)]
    queue: QueueSection,
    #[serde(default)]
    retry: Option<RetryPolicy>,
    #[serde(default)]
    contention: Option<ContentionPolicy>,
    #[serde(default)]
    shadow: Option<ShadowPolicy>,
}

#[derive(Debug, Default, Deserialize)]
struct QueueSection {
    max_attempts: Option<u32>,
    dequeue_timeout_ms: Option<u64>,
    poll_interval_ms: Option<u64>,
    claim_lease_seconds: Option<u64>,
}

impl InboxConfig {
    /// Loads `.env`, then reads the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();
        Self::from_process_env()
    }

    pub fn from_process_env() -> Result<Self, ConfigError> {
        let file = match resolve_string_env("INBOX_CONFIG_PATH") {
            Some(path) => load_config_file(Path::new(&path))?,
            None => InboxConfigFile::default(),
        };

        let queue_backend = match resolve_string_env("INBOX_QUEUE_BACKEND")
            .map(|value| value.to_ascii_lowercase())
            .as_deref()
        {
            None | Some("sqlite") => QueueBackend::Sqlite,
            Some("memory") => QueueBackend::Memory,
            Some(other) => {
                return Err(ConfigError::Invalid {
                    key: "INBOX_QUEUE_BACKEND",
                    value: other.to_string(),
                })
            }
        };

        let defaults = QueueSettings::default();
        let queue = QueueSettings {
            max_attempts: resolve_u64_env("INBOX_MAX_ATTEMPTS")
                .map(|value| value as u32)
                .or(file.queue.max_attempts)
                .unwrap_or(defaults.max_attempts),
            dequeue_timeout: file
                .queue
                .dequeue_timeout_ms
                .map(Duration::from_millis)
                .unwrap_or(defaults.dequeue_timeout),
            poll_interval: file
                .queue
                .poll_interval_ms
                .map(Duration::from_millis)
                .unwrap_or(defaults.poll_interval),
            claim_lease: resolve_u64_env("INBOX_CLAIM_LEASE_SECS")
                .or(file.queue.claim_lease_seconds)
                .map(Duration::from_secs)
                .unwrap_or(defaults.claim_lease),
        };

        let mut shadow = file.shadow.unwrap_or_default();
        if let Some(value) = resolve_u64_env("SHADOW_DEBOUNCE_SECONDS") {
            shadow.debounce_seconds = value;
        }
        if let Some(value) = resolve_u64_env("SHADOW_TYPING_WINDOW_SECONDS") {
            shadow.typing_window_seconds = value;
        }
        if let Some(value) = resolve_u64_env("SHADOW_POSTPONE_CEILING") {
            shadow.postpone_ceiling = value as u32;
        }

        let accepted_objects = resolve_string_env("WEBHOOK_ACCEPTED_OBJECTS")
            .unwrap_or_else(|| DEFAULT_ACCEPTED_OBJECTS.to_string())
            .split(',')
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty() && value != "*")
            .collect();

        let gateway = GatewaySettings {
            host: resolve_string_env("GATEWAY_HOST").unwrap_or_else(|| "0.0.0.0".to_string()),
            port: resolve_u64_env("GATEWAY_PORT")
                .and_then(|value| u16::try_from(value).ok())
                .unwrap_or(9100),
            max_body_bytes: resolve_u64_env("GATEWAY_MAX_BODY_BYTES")
                .map(|value| value as usize)
                .unwrap_or(DEFAULT_MAX_BODY_BYTES),
            verify_token: resolve_string_env("WEBHOOK_VERIFY_TOKEN"),
        };

        let platform_defaults = PlatformSettings::default();
        let platform = PlatformSettings {
            api_base: resolve_string_env("PLATFORM_API_BASE").unwrap_or(platform_defaults.api_base),
            api_version: resolve_string_env("PLATFORM_API_VERSION").unwrap_or(platform_defaults.api_version),
            credentials: PlatformCredentials {
                page: resolve_pair("PLATFORM_PAGE_ID", "PLATFORM_PAGE_ACCESS_TOKEN"),
                user: resolve_pair("PLATFORM_USER_ID", "PLATFORM_ACCESS_TOKEN"),
            },
            requests_per_minute: resolve_u64_env("PLATFORM_REQUESTS_PER_MINUTE")
                .map(|value| value as u32)
                .unwrap_or(platform_defaults.requests_per_minute),
            page_size: platform_defaults.page_size,
            listing_platform: match resolve_string_env("PLATFORM_LISTING") {
                Some(value) if value.eq_ignore_ascii_case("none") => None,
                Some(value) => Some(value),
                None => platform_defaults.listing_platform,
            },
            request_timeout: platform_defaults.request_timeout,
            media_root: resolve_string_env("INBOX_MEDIA_ROOT")
                .map(PathBuf::from)
                .unwrap_or(platform_defaults.media_root),
        };

        let drafter = resolve_string_env("REPLY_DRAFTER_URL").map(|url| DrafterSettings {
            url,
            token: resolve_string_env("REPLY_DRAFTER_TOKEN"),
            timeout: Duration::from_secs(resolve_u64_env("REPLY_DRAFTER_TIMEOUT_SECS").unwrap_or(30)),
        });

        Ok(Self {
            db_path: resolve_string_env("INBOX_DB_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("data/inbox.db")),
            queue_backend,
            queue,
            retry: file.retry.unwrap_or_default(),
            contention: file.contention.unwrap_or_default(),
            shadow,
            shadow_poll_interval: Duration::from_secs(
                resolve_u64_env("SHADOW_POLL_INTERVAL_SECS").unwrap_or(2),
            ),
            app_secret: resolve_string_env("WEBHOOK_APP_SECRET"),
            accepted_objects,
            gateway,
            platform,
            directory_max_pages: resolve_u64_env("PLATFORM_DIRECTORY_MAX_PAGES")
                .map(|value| value as usize)
                .unwrap_or(5),
            drafter,
        })
    }
}

fn load_config_file(path: &Path) -> Result<InboxConfigFile, ConfigError> {
    let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    Ok(toml::from_str::<InboxConfigFile>(&content)?)
}

fn resolve_string_env(key: &str) -> Option<String> {
    env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn resolve_u64_env(key: &str) -> Option<u64> {
    resolve_string_env(key)
        .and_then(|value| value.parse::<u64>().ok())
        .filter(|value| *value > 0)
}

fn resolve_pair(id_key: &str, token_key: &str) -> Option<CredentialPair> {
    match (resolve_string_env(id_key), resolve_string_env(token_key)) {
        (Some(owner_id), Some(access_token)) => Some(CredentialPair {
            owner_id,
            access_token,
        }),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::retry::Backoff;
    use serial_test::serial;
    use std::io::Write;

    const KEYS: &[&str] = &[
        "INBOX_CONFIG_PATH",
        "INBOX_QUEUE_BACKEND",
        "INBOX_DB_PATH",
        "INBOX_MAX_ATTEMPTS",
        "INBOX_CLAIM_LEASE_SECS",
        "WEBHOOK_APP_SECRET",
        "WEBHOOK_ACCEPTED_OBJECTS",
        "GATEWAY_PORT",
        "PLATFORM_PAGE_ID",
        "PLATFORM_PAGE_ACCESS_TOKEN",
        "PLATFORM_USER_ID",
        "PLATFORM_ACCESS_TOKEN",
        "SHADOW_DEBOUNCE_SECONDS",
        "REPLY_DRAFTER_URL",
    ];

    fn clear_env() {
        for key in KEYS {
            env::remove_var(key);
        }
    }

    #[test]
    #[serial]
    fn defaults_without_env() {
        clear_env();
        let config = InboxConfig::from_process_env().unwrap();
        assert_eq!(config.queue_backend, QueueBackend::Sqlite);
        assert_eq!(config.db_path, PathBuf::from("data/inbox.db"));
        assert_eq!(config.accepted_objects, vec!["instagram", "page"]);
        assert_eq!(config.gateway.max_body_bytes, DEFAULT_MAX_BODY_BYTES);
        assert!(config.app_secret.is_none());
        assert!(config.drafter.is_none());
        assert_eq!(config.shadow, ShadowPolicy::default());
    }

    #[test]
    #[serial]
    fn env_values_are_trimmed_and_pairs_need_both_halves() {
        clear_env();
        env::set_var("WEBHOOK_APP_SECRET", "  s3cret ");
        env::set_var("INBOX_QUEUE_BACKEND", "Memory");
        env::set_var("GATEWAY_PORT", "8088");
        env::set_var("PLATFORM_PAGE_ID", "page-1");
        env::set_var("PLATFORM_USER_ID", "user-1");
        env::set_var("PLATFORM_ACCESS_TOKEN", "user-token");
        env::set_var("SHADOW_DEBOUNCE_SECONDS", "12");

        let config = InboxConfig::from_process_env().unwrap();
        clear_env();
        assert_eq!(config.app_secret.as_deref(), Some("s3cret"));
        assert_eq!(config.queue_backend, QueueBackend::Memory);
        assert_eq!(config.gateway.port, 8088);
        assert!(config.platform.credentials.page.is_none());
        assert_eq!(config.platform.credentials.user.as_ref().unwrap().owner_id, "user-1");
        assert_eq!(config.shadow.debounce_seconds, 12);
    }

    #[test]
    #[serial]
    fn toml_file_overrides_policies() {
        clear_env();
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
[queue]
max_attempts = 3
poll_interval_ms = 50
claim_lease_seconds = 120

[retry.backoff]
type = "fixed"
seconds = 9

[shadow]
postpone_ceiling = 5
postpone_backoff = {{ type = "exponential", base_seconds = 60, factor = 3, max_seconds = 900 }}
"#
        )
        .unwrap();
        env::set_var("INBOX_CONFIG_PATH", file.path());

        let config = InboxConfig::from_process_env().unwrap();
        clear_env();
        assert_eq!(config.queue.max_attempts, 3);
        assert_eq!(config.queue.poll_interval, Duration::from_millis(50));
        assert_eq!(config.queue.claim_lease, Duration::from_secs(120));
        assert_eq!(config.retry.backoff, Backoff::Fixed { seconds: 9 });
        assert_eq!(config.shadow.postpone_ceiling, 5);
        assert_eq!(config.shadow.debounce_seconds, ShadowPolicy::default().debounce_seconds);
    }

    #[test]
    #[serial]
    fn rejects_unknown_backend() {
        clear_env();
        env::set_var("INBOX_QUEUE_BACKEND", "redis");
        let result = InboxConfig::from_process_env();
        clear_env();
        assert!(matches!(result, Err(ConfigError::Invalid { key: "INBOX_QUEUE_BACKEND", .. })));
    }
}
