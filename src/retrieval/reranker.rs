//! Second-stage reranking of a candidate pool
//!
//! Two strategies share one entry point: a local cross-encoder (FastEmbed)
//! with a lighter fallback model, and a hosted rerank API. The hosted path
//! never fails a query; without a key or on any request error it returns the
//! pool head unchanged and reports the degradation.

use crate::config::RerankerConfig;
use crate::retrieval::ScoredChunk;
use ahash::{HashMap, HashMapExt};
use fastembed::{RerankInitOptions, TextRerank};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};

#[derive(Error, Debug)]
pub enum RerankError {
    #[error("Reranker initialization failed: {0}")]
    InitializationError(String),

    #[error("Reranking failed: {0}")]
    RerankingError(String),

    #[error("Reranking timed out after {0}ms")]
    Timeout(u64),

    #[error("All reranker models failed: {}", failures.join("; "))]
    AllModelsFailed { failures: Vec<String> },
}

/// A loaded cross-encoder
pub trait CrossEncoder: Send + Sync {
    /// Relevance of each document to the query, in input order, higher is better
    fn score(&self, query: &str, documents: &[String]) -> Result<Vec<f32>, RerankError>;

    fn model_name(&self) -> &str;
}

/// Loads cross-encoders by model id
pub trait CrossEncoderLoader: Send + Sync {
    fn load(&self, model: &str) -> Result<Arc<dyn CrossEncoder>, RerankError>;
}

/// Loads models supported by FastEmbed, downloading them on first use
#[derive(Debug, Default)]
pub struct FastEmbedLoader;

impl CrossEncoderLoader for FastEmbedLoader {
    fn load(&self, model: &str) -> Result<Arc<dyn CrossEncoder>, RerankError> {
        let info = TextRerank::list_supported_models()
            .into_iter()
            .find(|m| m.model_code.eq_ignore_ascii_case(model))
            .ok_or_else(|| {
                RerankError::InitializationError(format!("Unsupported reranker model: {}", model))
            })?;

        info!("Loading reranker model: {}", info.model_code);

        let init_options = RerankInitOptions::new(info.model).with_show_download_progress(false);
        let model_impl = TextRerank::try_new(init_options)
            .map_err(|e| RerankError::InitializationError(e.to_string()))?;

        Ok(Arc::new(FastEmbedCrossEncoder {
            model: model_impl,
            model_name: info.model_code,
        }))
    }
}

struct FastEmbedCrossEncoder {
    model: TextRerank,
    model_name: String,
}

impl CrossEncoder for FastEmbedCrossEncoder {
    fn score(&self, query: &str, documents: &[String]) -> Result<Vec<f32>, RerankError> {
        let docs: Vec<&str> = documents.iter().map(|s| s.as_str()).collect();

        let results = self
            .model
            .rerank(query, docs, false, None)
            .map_err(|e| RerankError::RerankingError(e.to_string()))?;

        // Results come back sorted by score; put them back in input order
        let mut scores: Vec<Option<f32>> = vec![None; documents.len()];
        for result in results {
            if let Some(slot) = scores.get_mut(result.index) {
                *slot = Some(result.score);
            }
        }

        scores
            .into_iter()
            .enumerate()
            .map(|(i, s)| {
                s.ok_or_else(|| RerankError::RerankingError(format!("No score for document {}", i)))
            })
            .collect()
    }

    fn model_name(&self) -> &str {
        &self.model_name
    }
}

/// Where a hosted API key comes from
#[derive(Debug, Clone, PartialEq)]
pub enum CredentialRef {
    /// Read from this environment variable at call time
    Env(String),
    /// Key given inline in the configuration
    Static(String),
}

impl CredentialRef {
    /// The key, if present and non-empty
    pub fn resolve(&self) -> Option<String> {
        let value = match self {
            CredentialRef::Env(var) => std::env::var(var).ok()?,
            CredentialRef::Static(value) => value.clone(),
        };
        let value = value.trim().to_string();
        (!value.is_empty()).then_some(value)
    }
}

/// How a pool is reranked, resolved from a model name
#[derive(Debug, Clone, PartialEq)]
pub enum RerankStrategy {
    /// Local cross-encoders tried in order until one succeeds
    CrossEncoder { models: Vec<String> },
    /// Hosted rerank API
    Hosted {
        endpoint: String,
        model: String,
        credential: CredentialRef,
    },
}

impl RerankStrategy {
    /// Names starting with "cohere" select the hosted API; "cohere/<model>" or
    /// "cohere:<model>" overrides the hosted model. Any other name is a
    /// cross-encoder, with the configured fallback tried after it.
    pub fn resolve(model_name: &str, config: &RerankerConfig) -> Self {
        let name = model_name.trim();

        if name.to_ascii_lowercase().starts_with("cohere") {
            let model = name["cohere".len()..]
                .strip_prefix(['/', ':'])
                .filter(|m| !m.is_empty())
                .unwrap_or(config.hosted_model.as_str())
                .to_string();

            return RerankStrategy::Hosted {
                endpoint: config.hosted_endpoint.clone(),
                model,
                credential: match &config.api_key {
                    Some(key) => CredentialRef::Static(key.clone()),
                    None => CredentialRef::Env(config.api_key_env.clone()),
                },
            };
        }

        let mut models = vec![name.to_string()];
        if !config.fallback_model.eq_ignore_ascii_case(name) {
            models.push(config.fallback_model.clone());
        }
        RerankStrategy::CrossEncoder { models }
    }

    pub fn label(&self) -> String {
        match self {
            RerankStrategy::CrossEncoder { models } => models.join(" -> "),
            RerankStrategy::Hosted { model, .. } => format!("cohere:{}", model),
        }
    }
}

/// What happened to the rerank stage of a query
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum RerankStatus {
    NotRequested,
    /// Results carry scores from this model
    Applied { model: String },
    /// Requested but unavailable; results are in pre-rerank order
    Degraded { reason: String },
    /// Requested but there was nothing to rerank
    Skipped,
}

#[derive(Serialize)]
struct HostedRerankRequest<'a> {
    model: &'a str,
    query: &'a str,
    documents: Vec<&'a str>,
    top_n: usize,
}

#[derive(Deserialize)]
struct HostedRerankResponse {
    results: Vec<HostedRerankResult>,
}

#[derive(Deserialize)]
struct HostedRerankResult {
    index: usize,
    relevance_score: f32,
}

/// Reranks candidate pools; loaded cross-encoders are cached for the
/// lifetime of the reranker
pub struct Reranker {
    loader: Arc<dyn CrossEncoderLoader>,
    cache: Mutex<HashMap<String, Arc<dyn CrossEncoder>>>,
    client: reqwest::Client,
    max_chars: usize,
    timeout: Option<Duration>,
}

impl Reranker {
    pub fn new(config: &RerankerConfig) -> Self {
        Self::with_loader(config, Arc::new(FastEmbedLoader))
    }

    /// Use a custom cross-encoder loader
    pub fn with_loader(config: &RerankerConfig, loader: Arc<dyn CrossEncoderLoader>) -> Self {
        Self {
            loader,
            cache: Mutex::new(HashMap::new()),
            client: reqwest::Client::new(),
            max_chars: config.max_chars,
            timeout: config.timeout_ms.map(Duration::from_millis),
        }
    }

    /// Rerank `candidates` for `query` and keep the best `k`
    ///
    /// # Returns
    /// At most `k` chunks. When scoring succeeded they carry `rerank_score`
    /// and are in descending score order.
    pub async fn rerank(
        &self,
        query: &str,
        candidates: Vec<ScoredChunk>,
        strategy: &RerankStrategy,
        k: usize,
    ) -> Result<(Vec<ScoredChunk>, RerankStatus), RerankError> {
        if candidates.is_empty() {
            return Ok((candidates, RerankStatus::Skipped));
        }

        let documents: Vec<String> = candidates
            .iter()
            .map(|c| truncate_chars(&c.chunk.content, self.max_chars).to_string())
            .collect();

        match strategy {
            RerankStrategy::CrossEncoder { models } => {
                let (model, scores) = self.score_with_cascade(query, documents, models).await?;
                let scores = scores.into_iter().map(Some).collect();
                Ok((apply_scores(candidates, scores, k), RerankStatus::Applied { model }))
            }
            RerankStrategy::Hosted {
                endpoint,
                model,
                credential,
            } => {
                let Some(api_key) = credential.resolve() else {
                    warn!("No API key for hosted reranker; returning pool order");
                    return Ok((
                        truncated(candidates, k),
                        RerankStatus::Degraded {
                            reason: "missing API key".to_string(),
                        },
                    ));
                };

                match self
                    .score_hosted(endpoint, model, &api_key, query, &documents, k)
                    .await
                {
                    Ok(scores) if scores.iter().all(Option::is_none) => {
                        warn!("Hosted reranker returned no scores; returning pool order");
                        Ok((
                            truncated(candidates, k),
                            RerankStatus::Degraded {
                                reason: "no scores returned".to_string(),
                            },
                        ))
                    }
                    Ok(scores) => Ok((
                        apply_scores(candidates, scores, k),
                        RerankStatus::Applied {
                            model: format!("cohere:{}", model),
                        },
                    )),
                    Err(e) => {
                        warn!("Hosted rerank failed, returning pool order: {}", e);
                        Ok((
                            truncated(candidates, k),
                            RerankStatus::Degraded {
                                reason: e.to_string(),
                            },
                        ))
                    }
                }
            }
        }
    }

    async fn score_with_cascade(
        &self,
        query: &str,
        documents: Vec<String>,
        models: &[String],
    ) -> Result<(String, Vec<f32>), RerankError> {
        let mut failures = Vec::new();

        for model in models {
            match self.score_with_model(query, &documents, model).await {
                Ok(scores) => return Ok((model.clone(), scores)),
                Err(e) => {
                    warn!("Reranker {} failed: {}", model, e);
                    failures.push(format!("{}: {}", model, e));
                }
            }
        }

        Err(RerankError::AllModelsFailed { failures })
    }

    async fn score_with_model(
        &self,
        query: &str,
        documents: &[String],
        model: &str,
    ) -> Result<Vec<f32>, RerankError> {
        let cached = self
            .cache
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(model)
            .cloned();

        let loader = self.loader.clone();
        let model_id = model.to_string();
        let query = query.to_string();
        let documents = documents.to_vec();

        let task = tokio::task::spawn_blocking(move || {
            let encoder = match cached {
                Some(encoder) => encoder,
                None => loader.load(&model_id)?,
            };
            let scores = encoder.score(&query, &documents)?;
            if scores.len() != documents.len() {
                return Err(RerankError::RerankingError(format!(
                    "Expected {} scores, got {}",
                    documents.len(),
                    scores.len()
                )));
            }
            Ok((encoder, scores))
        });

        let joined = match self.timeout {
            Some(limit) => tokio::time::timeout(limit, task)
                .await
                .map_err(|_| RerankError::Timeout(limit.as_millis() as u64))?,
            None => task.await,
        };
        let (encoder, scores) =
            joined.map_err(|e| RerankError::RerankingError(format!("Rerank task failed: {}", e)))??;

        self.cache
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(model.to_string())
            .or_insert(encoder);

        debug!("Scored {} passages with {}", scores.len(), model);
        Ok(scores)
    }

    async fn score_hosted(
        &self,
        endpoint: &str,
        model: &str,
        api_key: &str,
        query: &str,
        documents: &[String],
        k: usize,
    ) -> Result<Vec<Option<f32>>, RerankError> {
        let body = HostedRerankRequest {
            model,
            query,
            documents: documents.iter().map(|d| d.as_str()).collect(),
            top_n: k.min(documents.len()),
        };

        let request = async {
            let response = self
                .client
                .post(endpoint)
                .bearer_auth(api_key)
                .json(&body)
                .send()
                .await
                .map_err(|e| RerankError::RerankingError(format!("HTTP error: {}", e)))?;

            if !response.status().is_success() {
                let status = response.status();
                let text = response.text().await.unwrap_or_default();
                return Err(RerankError::RerankingError(format!(
                    "API returned {}: {}",
                    status, text
                )));
            }

            response
                .json::<HostedRerankResponse>()
                .await
                .map_err(|e| RerankError::RerankingError(format!("JSON parse error: {}", e)))
        };

        let parsed = match self.timeout {
            Some(limit) => tokio::time::timeout(limit, request)
                .await
                .map_err(|_| RerankError::Timeout(limit.as_millis() as u64))??,
            None => request.await?,
        };

        let mut scores = vec![None; documents.len()];
        for result in parsed.results {
            match scores.get_mut(result.index) {
                Some(slot) => *slot = Some(result.relevance_score),
                None => warn!(index = result.index, "Hosted reranker returned out-of-range index"),
            }
        }
        Ok(scores)
    }
}

/// Set rerank scores, order scored chunks by descending score with unscored
/// chunks after them in input order, and keep `k`
fn apply_scores(
    candidates: Vec<ScoredChunk>,
    scores: Vec<Option<f32>>,
    k: usize,
) -> Vec<ScoredChunk> {
    let (mut scored, unscored): (Vec<ScoredChunk>, Vec<ScoredChunk>) = candidates
        .into_iter()
        .zip(scores)
        .map(|(mut chunk, score)| {
            chunk.rerank_score = score;
            chunk
        })
        .partition(|c| c.rerank_score.is_some());

    scored.sort_by(|a, b| {
        let sa = a.rerank_score.unwrap_or(f32::NEG_INFINITY);
        let sb = b.rerank_score.unwrap_or(f32::NEG_INFINITY);
        sb.total_cmp(&sa)
    });
    scored.extend(unscored);
    scored.truncate(k);
    scored
}

fn truncated(mut candidates: Vec<ScoredChunk>, k: usize) -> Vec<ScoredChunk> {
    candidates.truncate(k);
    candidates
}

/// Longest prefix of `text` with at most `max_chars` characters
pub fn truncate_chars(text: &str, max_chars: usize) -> &str {
    match text.char_indices().nth(max_chars) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}
