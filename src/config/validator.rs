use crate::config::{Config, SCHEMA_VERSION};
use crate::error::{MarketRagError, Result, ValidationError};

/// Configuration validator
pub struct ConfigValidator;

impl ConfigValidator {
    /// Validate the configuration, collecting every problem found
    pub fn validate(config: &Config) -> Result<()> {
        let mut errors = Vec::new();

        Self::validate_schema_version(config, &mut errors);
        Self::validate_storage(config, &mut errors);
        Self::validate_embedding(config, &mut errors);
        Self::validate_indexing(config, &mut errors);
        Self::validate_retrieval(config, &mut errors);
        Self::validate_reranker(config, &mut errors);

        if errors.is_empty() {
            Ok(())
        } else {
            Err(MarketRagError::ConfigValidation { errors })
        }
    }

    fn validate_schema_version(config: &Config, errors: &mut Vec<ValidationError>) {
        let version = &config.meta.schema_version;
        if version != SCHEMA_VERSION {
            errors.push(ValidationError::new(
                "_meta.schema_version",
                format!("Unsupported schema version: {}", version),
            ));
        }
    }

    fn validate_storage(config: &Config, errors: &mut Vec<ValidationError>) {
        if config.storage.data_dir.as_os_str().is_empty() {
            errors.push(ValidationError::new(
                "storage.data_dir",
                "Data directory cannot be empty",
            ));
        }
    }

    fn validate_embedding(config: &Config, errors: &mut Vec<ValidationError>) {
        if config.embedding.model.is_empty() {
            errors.push(ValidationError::new(
                "embedding.model",
                "Model name cannot be empty",
            ));
        }

        if config.embedding.dimension == 0 {
            errors.push(ValidationError::new(
                "embedding.dimension",
                "Embedding dimension must be greater than 0",
            ));
        }

        if config.embedding.batch_size == 0 {
            errors.push(ValidationError::new(
                "embedding.batch_size",
                "Batch size must be greater than 0",
            ));
        }
    }

    fn validate_indexing(config: &Config, errors: &mut Vec<ValidationError>) {
        if config.indexing.hnsw_m == 0 {
            errors.push(ValidationError::new(
                "indexing.hnsw_m",
                "HNSW M must be greater than 0",
            ));
        }

        if config.indexing.hnsw_ef_construction == 0 {
            errors.push(ValidationError::new(
                "indexing.hnsw_ef_construction",
                "HNSW ef_construction must be greater than 0",
            ));
        }

        if config.indexing.hnsw_ef_search == 0 {
            errors.push(ValidationError::new(
                "indexing.hnsw_ef_search",
                "HNSW ef_search must be greater than 0",
            ));
        }

        // tantivy refuses writer budgets below 15MB
        if config.indexing.keyword_writer_heap < 15_000_000 {
            errors.push(ValidationError::new(
                "indexing.keyword_writer_heap",
                format!(
                    "Keyword writer heap must be at least 15000000 bytes, got {}",
                    config.indexing.keyword_writer_heap
                ),
            ));
        }
    }

    fn validate_retrieval(config: &Config, errors: &mut Vec<ValidationError>) {
        let retrieval = &config.retrieval;

        if !(0.0..=1.0).contains(&retrieval.alpha) {
            errors.push(ValidationError::new(
                "retrieval.alpha",
                format!("Alpha must be between 0.0 and 1.0, got {}", retrieval.alpha),
            ));
        }

        if retrieval.top_k == 0 {
            errors.push(ValidationError::new(
                "retrieval.top_k",
                "top_k must be greater than 0",
            ));
        }

        if retrieval.pool_n == 0 {
            errors.push(ValidationError::new(
                "retrieval.pool_n",
                "pool_n must be greater than 0",
            ));
        }

        if retrieval.rerank_model.is_empty() {
            errors.push(ValidationError::new(
                "retrieval.rerank_model",
                "Rerank model cannot be empty",
            ));
        }

        if retrieval.embedding_timeout_ms == Some(0) {
            errors.push(ValidationError::new(
                "retrieval.embedding_timeout_ms",
                "Timeout must be greater than 0 when set",
            ));
        }
    }

    fn validate_reranker(config: &Config, errors: &mut Vec<ValidationError>) {
        let reranker = &config.reranker;

        if reranker.fallback_model.is_empty() {
            errors.push(ValidationError::new(
                "reranker.fallback_model",
                "Fallback model cannot be empty",
            ));
        }

        let endpoint = &reranker.hosted_endpoint;
        if !(endpoint.starts_with("http://") || endpoint.starts_with("https://")) {
            errors.push(ValidationError::new(
                "reranker.hosted_endpoint",
                format!("Endpoint must be an http(s) URL, got '{}'", endpoint),
            ));
        }

        if reranker.api_key_env.is_empty() && reranker.api_key.is_none() {
            errors.push(ValidationError::new(
                "reranker.api_key_env",
                "API key variable name cannot be empty",
            ));
        }

        if reranker.max_chars == 0 {
            errors.push(ValidationError::new(
                "reranker.max_chars",
                "max_chars must be greater than 0",
            ));
        }

        if reranker.timeout_ms == Some(0) {
            errors.push(ValidationError::new(
                "reranker.timeout_ms",
                "Timeout must be greater than 0 when set",
            ));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn test_valid_config() {
        let config = Config::default();
        assert!(ConfigValidator::validate(&config).is_ok());
    }

    #[test]
    fn test_empty_data_dir() {
        let mut config = Config::default();
        config.storage.data_dir = PathBuf::new();
        assert!(ConfigValidator::validate(&config).is_err());
    }

    #[test]
    fn test_alpha_out_of_range() {
        let mut config = Config::default();
        config.retrieval.alpha = 1.5;
        assert!(ConfigValidator::validate(&config).is_err());
    }

    #[test]
    fn test_inline_api_key_replaces_env_name() {
        let mut config = Config::default();
        config.reranker.api_key_env = String::new();
        assert!(ConfigValidator::validate(&config).is_err());

        config.reranker.api_key = Some("inline".to_string());
        assert!(ConfigValidator::validate(&config).is_ok());
    }

    #[test]
    fn test_collects_all_errors() {
        let mut config = Config::default();
        config.embedding.dimension = 0;
        config.retrieval.top_k = 0;
        config.reranker.hosted_endpoint = "ftp://example".to_string();

        match ConfigValidator::validate(&config) {
            Err(MarketRagError::ConfigValidation { errors }) => {
                let paths: Vec<&str> = errors.iter().map(|e| e.path.as_str()).collect();
                assert_eq!(
                    paths,
                    vec![
                        "embedding.dimension",
                        "retrieval.top_k",
                        "reranker.hosted_endpoint"
                    ]
                );
            }
            other => panic!("expected validation failure, got {:?}", other),
        }
    }
}
