//! Configuration management for marketrag
//!
//! Loads the TOML configuration, applies `MARKETRAG_SECTION__KEY` environment
//! overrides and named profiles, then validates the result.

use crate::error::{MarketRagError, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

mod validator;

pub use validator::ConfigValidator;

/// Supported schema version of the configuration file
pub const SCHEMA_VERSION: &str = "1.0.0";

const ENV_PREFIX: &str = "MARKETRAG_";

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(rename = "_meta")]
    pub meta: MetaConfig,
    pub storage: StorageConfig,
    pub embedding: EmbeddingConfig,
    pub indexing: IndexingConfig,
    pub retrieval: RetrievalConfig,
    pub reranker: RerankerConfig,
    #[serde(default)]
    pub profiles: HashMap<String, ProfileOverrides>,
}

/// Metadata about the configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetaConfig {
    pub schema_version: String,
    #[serde(default = "current_timestamp")]
    pub created_at: String,
    #[serde(default = "current_timestamp")]
    pub last_modified: String,
}

fn current_timestamp() -> String {
    chrono::Utc::now().to_rfc3339()
}

/// Storage configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Root directory; the chunk database and keyword index live under `store/`
    pub data_dir: PathBuf,
}

/// Embedding configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmbeddingConfig {
    /// Model name (e.g., "all-MiniLM-L6-v2")
    pub model: String,
    /// Embedding dimension, constant across the corpus
    pub dimension: usize,
    /// Batch size used when filling missing embeddings on import
    pub batch_size: usize,
}

/// Index construction and search parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexingConfig {
    /// HNSW M parameter (number of connections per layer)
    pub hnsw_m: usize,
    /// HNSW construction parameter (higher = better recall, slower build)
    pub hnsw_ef_construction: usize,
    /// HNSW search parameter, raised to the requested pool size when smaller
    pub hnsw_ef_search: usize,
    /// Memory budget of the tantivy writer in bytes
    pub keyword_writer_heap: usize,
}

/// Defaults applied to retrieval requests that do not set a field
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrievalConfig {
    pub top_k: usize,
    /// Weight on dense distance in fusion (0..=1)
    pub alpha: f32,
    pub use_sparse: bool,
    /// Candidate pool size for each search path
    pub pool_n: usize,
    pub dedup: bool,
    pub rerank: bool,
    /// Model name; names starting with "cohere" select the hosted reranker
    pub rerank_model: String,
    /// Abort a query if embedding it takes longer than this
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub embedding_timeout_ms: Option<u64>,
}

/// Reranker models and hosted API settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RerankerConfig {
    /// Lighter cross-encoder tried when the requested one fails
    pub fallback_model: String,
    pub hosted_endpoint: String,
    pub hosted_model: String,
    /// Environment variable holding the hosted API key
    pub api_key_env: String,
    /// Inline hosted API key; takes precedence over `api_key_env`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
    /// Passages are cut to this many characters before scoring
    pub max_chars: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
}

/// Profile-specific configuration overrides
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProfileOverrides {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub alpha: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub use_sparse: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pool_n: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rerank: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rerank_model: Option<String>,
}

impl Config {
    /// Load configuration from a file
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Err(MarketRagError::ConfigNotFound {
                path: path.to_path_buf(),
            });
        }

        let content = std::fs::read_to_string(path).map_err(|e| MarketRagError::Io {
            source: e,
            context: format!("Failed to read config file: {:?}", path),
        })?;
        let mut config: Config = toml::from_str(&content)?;

        config.apply_env_overrides();

        ConfigValidator::validate(&config)?;

        Ok(config)
    }

    /// Save configuration to a file
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| MarketRagError::Io {
                source: e,
                context: format!("Failed to create config directory: {:?}", parent),
            })?;
        }
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content).map_err(|e| MarketRagError::Io {
            source: e,
            context: format!("Failed to write config file: {:?}", path),
        })?;
        Ok(())
    }

    /// Load configuration with a specific profile applied
    pub fn load_with_profile(path: &Path, profile: &str) -> Result<Self> {
        let mut config = Self::load(path)?;
        config.apply_profile(profile)?;
        ConfigValidator::validate(&config)?;
        Ok(config)
    }

    /// Apply a profile's overrides to the retrieval defaults
    pub fn apply_profile(&mut self, profile: &str) -> Result<()> {
        let overrides = self.profiles.get(profile).cloned().ok_or_else(|| {
            MarketRagError::Config(format!("Unknown profile: {}", profile))
        })?;

        if let Some(alpha) = overrides.alpha {
            self.retrieval.alpha = alpha;
        }
        if let Some(use_sparse) = overrides.use_sparse {
            self.retrieval.use_sparse = use_sparse;
        }
        if let Some(pool_n) = overrides.pool_n {
            self.retrieval.pool_n = pool_n;
        }
        if let Some(rerank) = overrides.rerank {
            self.retrieval.rerank = rerank;
        }
        if let Some(model) = overrides.rerank_model {
            self.retrieval.rerank_model = model;
        }
        Ok(())
    }

    /// Apply environment variable overrides
    /// Environment variables in format: MARKETRAG_SECTION__KEY=value
    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides_from(std::env::vars());
    }

    /// Apply overrides from `(NAME, value)` pairs; names without the prefix are ignored
    pub fn apply_overrides_from(&mut self, vars: impl IntoIterator<Item = (String, String)>) {
        for (key, value) in vars {
            if let Some(config_key) = key.strip_prefix(ENV_PREFIX) {
                if let Err(e) = self.set_value_from_env(config_key, &value) {
                    tracing::warn!("Failed to apply env override {}: {}", key, e);
                }
            }
        }
    }

    fn set_value_from_env(&mut self, path: &str, value: &str) -> Result<()> {
        match path {
            "STORAGE__DATA_DIR" => self.storage.data_dir = PathBuf::from(value),
            "EMBEDDING__MODEL" => self.embedding.model = value.to_string(),
            "EMBEDDING__DIMENSION" => self.embedding.dimension = parse_value(path, value)?,
            "RETRIEVAL__TOP_K" => self.retrieval.top_k = parse_value(path, value)?,
            "RETRIEVAL__ALPHA" => self.retrieval.alpha = parse_value(path, value)?,
            "RETRIEVAL__USE_SPARSE" => self.retrieval.use_sparse = parse_value(path, value)?,
            "RETRIEVAL__POOL_N" => self.retrieval.pool_n = parse_value(path, value)?,
            "RETRIEVAL__DEDUP" => self.retrieval.dedup = parse_value(path, value)?,
            "RETRIEVAL__RERANK" => self.retrieval.rerank = parse_value(path, value)?,
            "RETRIEVAL__RERANK_MODEL" => self.retrieval.rerank_model = value.to_string(),
            "RERANKER__HOSTED_ENDPOINT" => self.reranker.hosted_endpoint = value.to_string(),
            "RERANKER__API_KEY_ENV" => self.reranker.api_key_env = value.to_string(),
            "RERANKER__API_KEY" => self.reranker.api_key = Some(value.to_string()),
            _ => {
                tracing::debug!("Unknown env config key: {}", path);
            }
        }
        Ok(())
    }

    /// Data directory with a leading `~` expanded
    pub fn data_dir(&self) -> Result<PathBuf> {
        expand_path(&self.storage.data_dir)
    }

    /// Get the default configuration file path
    pub fn default_path() -> Result<PathBuf> {
        let config_dir = dirs::config_dir().ok_or_else(|| {
            MarketRagError::Config("Cannot determine config directory".to_string())
        })?;

        Ok(config_dir.join("marketrag").join("config.toml"))
    }
}

fn parse_value<T: std::str::FromStr>(path: &str, value: &str) -> Result<T> {
    value
        .parse()
        .map_err(|_| MarketRagError::InvalidConfigValue {
            path: path.to_string(),
            message: format!("Cannot parse '{}'", value),
        })
}

/// Expand a leading `~` to the user's home directory
pub fn expand_path(path: &Path) -> Result<PathBuf> {
    match path.strip_prefix("~") {
        Ok(rest) => {
            let home = dirs::home_dir().ok_or_else(|| {
                MarketRagError::Config("Cannot determine home directory".to_string())
            })?;
            Ok(home.join(rest))
        }
        Err(_) => Ok(path.to_path_buf()),
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            meta: MetaConfig {
                schema_version: SCHEMA_VERSION.to_string(),
                created_at: current_timestamp(),
                last_modified: current_timestamp(),
            },
            storage: StorageConfig {
                data_dir: PathBuf::from("~/.marketrag"),
            },
            embedding: EmbeddingConfig {
                model: "all-MiniLM-L6-v2".to_string(),
                dimension: 384,
                batch_size: 32,
            },
            indexing: IndexingConfig {
                hnsw_m: 16,
                hnsw_ef_construction: 200,
                hnsw_ef_search: 64,
                keyword_writer_heap: 50_000_000,
            },
            retrieval: RetrievalConfig {
                top_k: 20,
                alpha: 0.5,
                use_sparse: false,
                pool_n: 200,
                dedup: true,
                rerank: false,
                rerank_model: "BAAI/bge-reranker-base".to_string(),
                embedding_timeout_ms: None,
            },
            reranker: RerankerConfig {
                fallback_model: "jinaai/jina-reranker-v1-turbo-en".to_string(),
                hosted_endpoint: "https://api.cohere.com/v2/rerank".to_string(),
                hosted_model: "rerank-v3.5".to_string(),
                api_key_env: "COHERE_API_KEY".to_string(),
                api_key: None,
                max_chars: 3500,
                timeout_ms: None,
            },
            profiles: HashMap::new(),
        }
    }
}
