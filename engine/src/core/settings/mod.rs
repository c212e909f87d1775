//! Settings Persistence System
//!
//! Provides persistent engine settings with:
//! - Atomic file writes (temp file + rename)
//! - Tolerant loading with defaults for missing or bad values
//! - Migration support for schema changes
//!
//! Storage location: {data_dir}/settings.json

use std::fs::{self, OpenOptions};
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::core::chunking::ChunkConfig;
use crate::core::embedding::{BackoffPolicy, EmbeddingProviderConfig, QuotaConfig};
use crate::core::fs::{atomic_write_json_pretty, validate_path_id_component};
use crate::core::index::DistanceMetric;
use crate::core::search::RankingConfig;
use crate::core::{CoreError, CoreResult};

/// Settings schema version for migration support
pub const SETTINGS_VERSION: u32 = 1;

/// Settings file name
pub const SETTINGS_FILE: &str = "settings.json";

/// Lock file name (advisory lock to prevent concurrent writers)
pub const SETTINGS_LOCK_FILE: &str = "settings.json.lock";

/// Engine settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RetrievalSettings {
    /// Schema version for migrations
    #[serde(default = "default_version")]
    pub version: u32,

    #[serde(default)]
    pub chunking: ChunkConfig,

    #[serde(default)]
    pub embedding: EmbeddingSettings,

    #[serde(default)]
    pub quota: QuotaConfig,

    #[serde(default)]
    pub index: IndexSettings,

    #[serde(default)]
    pub ranking: RankingConfig,

    #[serde(default)]
    pub ingestion: IngestionSettings,

    #[serde(default)]
    pub storage: StorageSettings,
}

fn default_version() -> u32 {
    SETTINGS_VERSION
}

impl Default for RetrievalSettings {
    fn default() -> Self {
        Self {
            version: SETTINGS_VERSION,
            chunking: ChunkConfig::default(),
            embedding: EmbeddingSettings::default(),
            quota: QuotaConfig::default(),
            index: IndexSettings::default(),
            ranking: RankingConfig::default(),
            ingestion: IngestionSettings::default(),
            storage: StorageSettings::default(),
        }
    }
}

impl RetrievalSettings {
    /// Normalizes settings values to safe ranges.
    ///
    /// Corrects bad values instead of failing, so an old or hand-edited file
    /// still loads.
    pub fn normalize(&mut self) {
        self.version = SETTINGS_VERSION;

        let defaults = ChunkConfig::default();
        let chunking = &mut self.chunking;
        chunking.max_duration_sec =
            clamp_f64(chunking.max_duration_sec, 1.0, 600.0, defaults.max_duration_sec);
        chunking.min_duration_sec = clamp_f64(
            chunking.min_duration_sec,
            0.0,
            chunking.max_duration_sec,
            defaults.min_duration_sec.min(chunking.max_duration_sec),
        );
        chunking.overlap_sec = clamp_f64(
            chunking.overlap_sec,
            0.0,
            chunking.max_duration_sec / 2.0,
            defaults.overlap_sec.min(chunking.max_duration_sec / 2.0),
        );
        if chunking.validate().is_err() {
            self.chunking = ChunkConfig::default();
        }

        self.embedding.normalize();

        if self.quota.max_wait < self.quota.min_wait {
            self.quota.max_wait = self.quota.min_wait;
        }
        self.quota.max_quota_waits = self.quota.max_quota_waits.clamp(1, 20);

        self.ranking.weights = self.ranking.weights.normalized();
        self.ranking.candidate_multiplier = self.ranking.candidate_multiplier.clamp(1, 10);
        self.ranking.min_score = clamp_f64(self.ranking.min_score, 0.0, 1.0, 0.0);

        self.ingestion.normalize();
        self.storage.normalize();
    }
}

/// Clamps to `[min, max]`; non-finite values become `fallback`
fn clamp_f64(value: f64, min: f64, max: f64, fallback: f64) -> f64 {
    if !value.is_finite() {
        return fallback;
    }
    value.clamp(min, max)
}

// =============================================================================
// Sections
// =============================================================================

/// Embedding provider, retry policy and batching
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct EmbeddingSettings {
    #[serde(default)]
    pub provider: EmbeddingProviderConfig,

    #[serde(default)]
    pub backoff: BackoffPolicy,

    /// Concurrent embedding calls per video
    #[serde(default = "default_batch_limit")]
    pub batch_limit: usize,
}

fn default_batch_limit() -> usize {
    4
}

impl Default for EmbeddingSettings {
    fn default() -> Self {
        Self {
            provider: EmbeddingProviderConfig::default(),
            backoff: BackoffPolicy::default(),
            batch_limit: default_batch_limit(),
        }
    }
}

impl EmbeddingSettings {
    fn normalize(&mut self) {
        if self.provider.dimension == 0 || self.provider.dimension > 8192 {
            self.provider.dimension = EmbeddingProviderConfig::default().dimension;
        }
        if self.provider.api_key_env.trim().is_empty() {
            self.provider.api_key_env = EmbeddingProviderConfig::default().api_key_env;
        }
        self.provider.timeout_secs = self.provider.timeout_secs.clamp(1, 600);

        self.backoff.max_retries = self.backoff.max_retries.clamp(0, 10);
        self.backoff.jitter_ratio = clamp_f64(self.backoff.jitter_ratio, 0.0, 1.0, 0.0);
        if self.backoff.max_delay < self.backoff.base_delay {
            self.backoff.max_delay = self.backoff.base_delay;
        }

        self.batch_limit = self.batch_limit.clamp(1, 32);
    }
}

/// Vector index settings
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct IndexSettings {
    #[serde(default)]
    pub metric: DistanceMetric,
}

/// Ingestion pipeline and worker pool
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct IngestionSettings {
    /// Videos ingested in parallel
    #[serde(default = "default_workers")]
    pub workers: usize,

    /// Maximum queued or running ingestion jobs
    #[serde(default = "default_max_queue_size")]
    pub max_queue_size: usize,

    /// Per-video deadline in seconds
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,

    /// Transcript language preference, most preferred first
    #[serde(default = "default_languages")]
    pub preferred_languages: Vec<String>,

    /// Ingest unprocessed videos named in a query scope before searching
    #[serde(default = "default_true")]
    pub auto_ingest_on_query: bool,

    /// Directory of `{videoId}.{lang}.json` transcript files
    #[serde(default)]
    pub transcripts_dir: Option<PathBuf>,
}

fn default_workers() -> usize {
    num_cpus::get().clamp(2, 4)
}

fn default_max_queue_size() -> usize {
    1000
}

fn default_timeout_secs() -> u64 {
    600
}

fn default_languages() -> Vec<String> {
    vec!["en".to_string()]
}

fn default_true() -> bool {
    true
}

impl Default for IngestionSettings {
    fn default() -> Self {
        Self {
            workers: default_workers(),
            max_queue_size: default_max_queue_size(),
            timeout_secs: default_timeout_secs(),
            preferred_languages: default_languages(),
            auto_ingest_on_query: true,
            transcripts_dir: None,
        }
    }
}

impl IngestionSettings {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    fn normalize(&mut self) {
        self.workers = self.workers.clamp(1, 32);
        self.max_queue_size = self.max_queue_size.clamp(1, 10_000);
        self.timeout_secs = self.timeout_secs.clamp(10, 86_400);

        let mut languages: Vec<String> = Vec::new();
        for lang in &self.preferred_languages {
            let lang = lang.trim().to_ascii_lowercase();
            if !lang.is_empty() && !languages.contains(&lang) {
                languages.push(lang);
            }
        }
        self.preferred_languages = if languages.is_empty() {
            default_languages()
        } else {
            languages
        };
    }
}

/// Persistence backend
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    #[default]
    Sqlite,
    Memory,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct StorageSettings {
    #[serde(default)]
    pub backend: StorageBackend,

    /// Database file name inside the data directory
    #[serde(default = "default_database_file")]
    pub database_file: String,
}

fn default_database_file() -> String {
    "reelindex.db".to_string()
}

impl Default for StorageSettings {
    fn default() -> Self {
        Self {
            backend: StorageBackend::default(),
            database_file: default_database_file(),
        }
    }
}

impl StorageSettings {
    /// Database location under `data_dir`
    pub fn database_path(&self, data_dir: &Path) -> PathBuf {
        data_dir.join(&self.database_file)
    }

    fn normalize(&mut self) {
        if validate_path_id_component(&self.database_file, "databaseFile").is_err() {
            self.database_file = default_database_file();
        }
    }
}

// =============================================================================
// Settings Manager
// =============================================================================

/// Settings manager for loading, saving, and resetting settings
pub struct SettingsManager {
    settings_path: PathBuf,
}

impl SettingsManager {
    /// Create a new settings manager with the given data directory
    pub fn new(data_dir: PathBuf) -> Self {
        Self {
            settings_path: data_dir.join(SETTINGS_FILE),
        }
    }

    fn lock_path(&self) -> PathBuf {
        self.settings_path
            .parent()
            .unwrap_or_else(|| Path::new("."))
            .join(SETTINGS_LOCK_FILE)
    }

    fn with_lock<T>(&self, exclusive: bool, op: impl FnOnce() -> CoreResult<T>) -> CoreResult<T> {
        // The lock file lives next to the settings file.
        if let Some(parent) = self.settings_path.parent() {
            fs::create_dir_all(parent)?;
        }

        let lock_file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(self.lock_path())?;

        if exclusive {
            fs2::FileExt::lock_exclusive(&lock_file)
                .map_err(|e| CoreError::Internal(format!("Failed to lock settings file (exclusive): {}", e)))?;
        } else {
            fs2::FileExt::lock_shared(&lock_file)
                .map_err(|e| CoreError::Internal(format!("Failed to lock settings file (shared): {}", e)))?;
        }

        let result = op();

        if let Err(e) = fs2::FileExt::unlock(&lock_file) {
            warn!("Failed to unlock settings lock file: {}", e);
        }

        result
    }

    /// Get the settings file path
    pub fn settings_path(&self) -> &PathBuf {
        &self.settings_path
    }

    /// Load settings from disk, returning defaults if the file is missing or unreadable
    pub fn load(&self) -> RetrievalSettings {
        let result = self.with_lock(false, || {
            if !self.settings_path.exists() {
                info!("Settings file not found, using defaults");
                return Ok(RetrievalSettings::default());
            }

            let content = fs::read_to_string(&self.settings_path)?;
            let mut settings = serde_json::from_str::<RetrievalSettings>(&content)?;

            if settings.version < SETTINGS_VERSION {
                info!(
                    "Migrating settings from version {} to {}",
                    settings.version, SETTINGS_VERSION
                );
                settings = self.migrate(settings);
            }

            settings.normalize();
            Ok(settings)
        });

        match result {
            Ok(settings) => settings,
            Err(e) => {
                warn!("Failed to load settings, using defaults: {}", e);
                RetrievalSettings::default()
            }
        }
    }

    /// Save normalized settings using an atomic write
    pub fn save(&self, settings: &RetrievalSettings) -> CoreResult<RetrievalSettings> {
        self.with_lock(true, || {
            let mut normalized = settings.clone();
            normalized.normalize();

            atomic_write_json_pretty(&self.settings_path, &normalized)?;

            info!("Settings saved to {:?}", self.settings_path);
            Ok(normalized)
        })
    }

    /// Reset settings to defaults and delete the settings file
    pub fn reset(&self) -> CoreResult<RetrievalSettings> {
        self.with_lock(true, || {
            if self.settings_path.exists() {
                fs::remove_file(&self.settings_path)?;
                info!("Settings file deleted");
            }
            Ok(RetrievalSettings::default())
        })
    }

    /// Migrate settings from an older version
    fn migrate(&self, mut settings: RetrievalSettings) -> RetrievalSettings {
        settings.version = SETTINGS_VERSION;
        settings
    }
}
