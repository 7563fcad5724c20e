/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

//! Server configuration: a TOML file merged with `SYNC_`-prefixed
//! environment variables (`SYNC_PORT=9000`, `SYNC_LIMIT__MAX_POST_RECORDS=50`).

use figment::providers::{Env, Format, Toml};
use figment::Figment;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub host: String,
    pub port: u16,
    /// Reported in logs; defaults to whatever the OS thinks it is.
    pub hostname: Option<String>,
    /// Root of the per-user database tree.
    pub data_dir: PathBuf,
    /// Shared secrets consumed by the fronting auth layer. Unused here but
    /// carried so one config file serves the whole deployment.
    pub secrets: Vec<String>,
    pub pool: PoolSettings,
    pub limit: LimitSettings,
    pub cache: CacheSettings,
    pub log: LogSettings,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8000,
            hostname: None,
            data_dir: PathBuf::from("./data"),
            secrets: Vec::new(),
            pool: PoolSettings::default(),
            limit: LimitSettings::default(),
            cache: CacheSettings::default(),
            log: LogSettings::default(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PoolSettings {
    /// Number of independent sub-pools.
    pub num: usize,
    /// Open-store bound per sub-pool.
    pub max_size: usize,
    pub ttl_idle_secs: u64,
    /// How long shutdown waits for in-flight operations.
    pub stop_timeout_secs: u64,
    /// Extra time before shutdown gives up entirely.
    pub kill_timeout_secs: u64,
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            num: 8,
            max_size: 25,
            ttl_idle_secs: 300,
            stop_timeout_secs: 180,
            kill_timeout_secs: 120,
        }
    }
}

/// The serialized form doubles as the `info/configuration` payload, minus
/// the server-private fields.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LimitSettings {
    pub max_request_bytes: usize,
    pub max_record_payload_bytes: usize,
    /// Server-side clamp on collection GET page sizes.
    pub max_bso_get_limit: i64,
    pub max_post_records: usize,
    pub max_post_bytes: usize,
    pub max_total_records: usize,
    pub max_total_bytes: usize,
    pub max_batch_ttl_secs: u64,
    /// Per-user payload byte budget; None means unlimited.
    pub max_quota_bytes: Option<u64>,
}

impl Default for LimitSettings {
    fn default() -> Self {
        Self {
            max_request_bytes: 2 * 1024 * 1024,
            max_record_payload_bytes: 256 * 1024,
            max_bso_get_limit: 1000,
            max_post_records: 100,
            max_post_bytes: 1024 * 1024,
            max_total_records: 10_000,
            max_total_bytes: 100 * 1024 * 1024,
            max_batch_ttl_secs: 7200,
            max_quota_bytes: None,
        }
    }
}

/// What `GET info/configuration` advertises to clients.
#[derive(Debug, Clone, Serialize)]
pub struct InfoConfiguration {
    pub max_request_bytes: usize,
    pub max_post_records: usize,
    pub max_post_bytes: usize,
    pub max_total_records: usize,
    pub max_total_bytes: usize,
    pub max_record_payload_bytes: usize,
}

impl LimitSettings {
    pub fn info_configuration(&self) -> InfoConfiguration {
        InfoConfiguration {
            max_request_bytes: self.max_request_bytes,
            max_post_records: self.max_post_records,
            max_post_bytes: self.max_post_bytes,
            max_total_records: self.max_total_records,
            max_total_bytes: self.max_total_bytes,
            max_record_payload_bytes: self.max_record_payload_bytes,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CacheSettings {
    /// Budget for the info/collections + configuration response cache.
    pub max_cache_size_mb: usize,
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            max_cache_size_mb: 256,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LogSettings {
    pub level: String,
    /// Turns off per-request summary logging.
    pub disable_http: bool,
}

impl Default for LogSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            disable_http: false,
        }
    }
}

impl Settings {
    /// Load from an optional TOML file plus `SYNC_` environment variables;
    /// the environment wins.
    pub fn load(config_path: Option<&Path>) -> Result<Self, figment::Error> {
        let mut figment = Figment::new();
        if let Some(path) = config_path {
            figment = figment.merge(Toml::file(path));
        }
        figment.merge(Env::prefixed("SYNC_").split("__")).extract()
    }

    pub fn pool_config(&self) -> syncstorage::PoolConfig {
        syncstorage::PoolConfig {
            basepath: self.data_dir.clone(),
            num: self.pool.num,
            max_size: self.pool.max_size,
            ttl_idle: Duration::from_secs(self.pool.ttl_idle_secs),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let settings = Settings::default();
        assert_eq!(settings.port, 8000);
        assert_eq!(settings.pool.num, 8);
        assert_eq!(settings.limit.max_record_payload_bytes, 256 * 1024);
        assert!(settings.limit.max_quota_bytes.is_none());
    }

    #[test]
    fn test_load_from_toml() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sync.toml");
        std::fs::write(
            &path,
            r#"
                port = 9999
                data_dir = "/srv/sync"

                [limit]
                max_post_records = 50

                [pool]
                num = 2
            "#,
        )
        .unwrap();
        let settings = Settings::load(Some(&path)).unwrap();
        assert_eq!(settings.port, 9999);
        assert_eq!(settings.data_dir, PathBuf::from("/srv/sync"));
        assert_eq!(settings.limit.max_post_records, 50);
        assert_eq!(settings.pool.num, 2);
        // Untouched keys keep their defaults.
        assert_eq!(settings.limit.max_post_bytes, 1024 * 1024);
    }

    #[test]
    fn test_info_configuration_shape() {
        let json =
            serde_json::to_value(LimitSettings::default().info_configuration()).unwrap();
        assert_eq!(json["max_record_payload_bytes"], 256 * 1024);
        assert_eq!(json["max_post_records"], 100);
        assert!(json.get("max_quota_bytes").is_none());
    }
}
