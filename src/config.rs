use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::cache::{CacheOptions, DEFAULT_CACHE_DIR_NAME, DEFAULT_LOCK_TIMEOUT, FingerprintMode};
use crate::project::ScanOptions;
use crate::session::DEFAULT_FIRST_MESSAGE_CHARS;

const CONFIG_SCHEMA_VERSION: u32 = 1;
const CONFIG_FILE_NAME: &str = "claude-log-index.json";
const MIN_FIRST_MESSAGE_CHARS: usize = 20;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct IndexConfig {
    pub schema_version: u32,
    pub fingerprint: FingerprintMode,
    pub cache_dir_name: String,
    pub lock_timeout_ms: u64,
    pub first_message_chars: usize,
}

impl Default for IndexConfig {
    fn default() -> Self {
        Self {
            schema_version: CONFIG_SCHEMA_VERSION,
            fingerprint: FingerprintMode::Stat,
            cache_dir_name: DEFAULT_CACHE_DIR_NAME.to_string(),
            lock_timeout_ms: DEFAULT_LOCK_TIMEOUT.as_millis() as u64,
            first_message_chars: DEFAULT_FIRST_MESSAGE_CHARS,
        }
    }
}

impl IndexConfig {
    pub fn load_or_init() -> Result<Self> {
        Self::load_or_init_at(&config_path())
    }

    pub fn load_or_init_at(path: &Path) -> Result<Self> {
        if path.exists() {
            let raw = fs::read_to_string(path)
                .with_context(|| format!("failed to read {}", path.display()))?;
            let mut parsed: IndexConfig = serde_json::from_str(&raw)
                .with_context(|| format!("invalid JSON in {}", path.display()))?;
            if parsed.normalize_and_migrate() {
                parsed.save_to(path)?;
            }
            Ok(parsed)
        } else {
            let cfg = IndexConfig::default();
            cfg.save_to(path)?;
            Ok(cfg)
        }
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("failed to create config directory {}", parent.display())
            })?;
        }

        let data = serde_json::to_string_pretty(self)?;
        fs::write(path, data).with_context(|| format!("failed to write {}", path.display()))?;
        Ok(())
    }

    /// Environment wins over the file.
    pub fn effective_fingerprint(&self) -> FingerprintMode {
        resolve_fingerprint(env::var("CLAUDE_LOG_INDEX_FINGERPRINT").ok(), self.fingerprint)
    }

    pub fn lock_timeout(&self) -> Duration {
        Duration::from_millis(env_u64(
            "CLAUDE_LOG_INDEX_LOCK_TIMEOUT_MS",
            self.lock_timeout_ms,
        ))
    }

    pub fn scan_options(&self) -> ScanOptions {
        ScanOptions {
            use_cache: true,
            cache: CacheOptions {
                cache_dir_name: self.cache_dir_name.clone(),
                fingerprint_mode: self.effective_fingerprint(),
                lock_timeout: self.lock_timeout(),
            },
            first_message_chars: self.first_message_chars,
            ..ScanOptions::default()
        }
    }

    fn normalize_and_migrate(&mut self) -> bool {
        let mut changed = false;

        if self.schema_version < CONFIG_SCHEMA_VERSION {
            self.schema_version = CONFIG_SCHEMA_VERSION;
            changed = true;
        }

        let trimmed = self.cache_dir_name.trim().to_string();
        if !is_plain_dir_name(&trimmed) {
            self.cache_dir_name = DEFAULT_CACHE_DIR_NAME.to_string();
            changed = true;
        } else if trimmed != self.cache_dir_name {
            self.cache_dir_name = trimmed;
            changed = true;
        }

        if self.lock_timeout_ms == 0 {
            self.lock_timeout_ms = DEFAULT_LOCK_TIMEOUT.as_millis() as u64;
            changed = true;
        }
        if self.first_message_chars < MIN_FIRST_MESSAGE_CHARS {
            self.first_message_chars = MIN_FIRST_MESSAGE_CHARS;
            changed = true;
        }

        changed
    }
}

pub fn claude_home() -> PathBuf {
    if let Ok(custom) = env::var("CLAUDE_HOME") {
        let trimmed = custom.trim();
        if !trimmed.is_empty() {
            return PathBuf::from(trimmed);
        }
    }

    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".claude")
}

pub fn projects_path() -> PathBuf {
    claude_home().join("projects")
}

pub fn config_path() -> PathBuf {
    claude_home().join(CONFIG_FILE_NAME)
}

fn resolve_fingerprint(from_env: Option<String>, configured: FingerprintMode) -> FingerprintMode {
    from_env
        .as_deref()
        .and_then(FingerprintMode::parse)
        .unwrap_or(configured)
}

fn env_u64(name: &str, default: u64) -> u64 {
    env::var(name)
        .ok()
        .and_then(|v| v.trim().parse::<u64>().ok())
        .filter(|v| *v > 0)
        .unwrap_or(default)
}

/// A single relative path component; the cache must stay inside the project directory.
fn is_plain_dir_name(name: &str) -> bool {
    !name.is_empty()
        && name != "."
        && name != ".."
        && !name.contains(['/', '\\'])
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn first_load_writes_defaults() {
        let tmp = TempDir::new().expect("temp dir");
        let path = tmp.path().join("nested").join(CONFIG_FILE_NAME);

        let cfg = IndexConfig::load_or_init_at(&path).expect("load");
        assert_eq!(cfg, IndexConfig::default());
        assert!(path.exists());

        let again = IndexConfig::load_or_init_at(&path).expect("reload");
        assert_eq!(again, cfg);
    }

    #[test]
    fn migration_repairs_bad_values_and_saves() {
        let tmp = TempDir::new().expect("temp dir");
        let path = tmp.path().join(CONFIG_FILE_NAME);
        fs::write(
            &path,
            r#"{"schema_version":0,"fingerprint":"content_hash","cache_dir_name":"../escape","lock_timeout_ms":0,"first_message_chars":3}"#,
        )
        .expect("write config");

        let cfg = IndexConfig::load_or_init_at(&path).expect("load");
        assert_eq!(cfg.schema_version, CONFIG_SCHEMA_VERSION);
        assert_eq!(cfg.fingerprint, FingerprintMode::ContentHash);
        assert_eq!(cfg.cache_dir_name, DEFAULT_CACHE_DIR_NAME);
        assert_eq!(cfg.lock_timeout_ms, 2000);
        assert_eq!(cfg.first_message_chars, MIN_FIRST_MESSAGE_CHARS);

        let saved: IndexConfig =
            serde_json::from_str(&fs::read_to_string(&path).expect("read")).expect("json");
        assert_eq!(saved, cfg);
    }

    #[test]
    fn missing_fields_fall_back_to_defaults() {
        let tmp = TempDir::new().expect("temp dir");
        let path = tmp.path().join(CONFIG_FILE_NAME);
        fs::write(&path, r#"{"schema_version":1,"cache_dir_name":" .index "}"#)
            .expect("write config");

        let cfg = IndexConfig::load_or_init_at(&path).expect("load");
        assert_eq!(cfg.cache_dir_name, ".index");
        assert_eq!(cfg.fingerprint, FingerprintMode::Stat);
        assert_eq!(cfg.first_message_chars, DEFAULT_FIRST_MESSAGE_CHARS);
    }

    #[test]
    fn invalid_json_is_reported_with_path() {
        let tmp = TempDir::new().expect("temp dir");
        let path = tmp.path().join(CONFIG_FILE_NAME);
        fs::write(&path, "{").expect("write config");

        let err = IndexConfig::load_or_init_at(&path).expect_err("should fail");
        assert!(format!("{err:#}").contains(CONFIG_FILE_NAME));
    }

    #[test]
    fn env_fingerprint_overrides_config_when_valid() {
        assert_eq!(
            resolve_fingerprint(Some("content_hash".to_string()), FingerprintMode::Stat),
            FingerprintMode::ContentHash
        );
        assert_eq!(
            resolve_fingerprint(Some("bogus".to_string()), FingerprintMode::Stat),
            FingerprintMode::Stat
        );
        assert_eq!(
            resolve_fingerprint(None, FingerprintMode::ContentHash),
            FingerprintMode::ContentHash
        );
    }

    #[test]
    fn scan_options_carry_config_values() {
        let cfg = IndexConfig {
            cache_dir_name: "idx".to_string(),
            first_message_chars: 80,
            ..IndexConfig::default()
        };
        let options = cfg.scan_options();
        assert!(options.use_cache);
        assert_eq!(options.cache.cache_dir_name, "idx");
        assert_eq!(options.first_message_chars, 80);
        assert!(options.range.is_unbounded());
    }
}
