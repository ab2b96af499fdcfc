use marketrag::cli::{Cli, Commands, ConfigAction};
use marketrag::config::{Config, ConfigValidator};
use marketrag::embedding::{BatchProcessor, FastEmbedProvider};
use marketrag::error::{MarketRagError, Result};
use marketrag::retrieval::{HybridSearcher, IndexManager, RerankStatus, RetrieveOutcome};
use marketrag::storage::StorageManager;
use std::path::PathBuf;
use std::sync::Arc;

/// Options of the `search` command
struct SearchArgs {
    query: String,
    top_k: Option<usize>,
    alpha: Option<f32>,
    sparse: bool,
    pool: Option<usize>,
    rerank: bool,
    rerank_model: Option<String>,
    sources: Vec<String>,
    no_dedup: bool,
    json: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Parse CLI arguments
    let cli = Cli::parse_args();

    // Initialize logging
    init_logging(cli.verbose);

    // Handle commands
    match cli.command {
        Commands::Search {
            query,
            top_k,
            alpha,
            sparse,
            pool,
            rerank,
            rerank_model,
            sources,
            no_dedup,
            json,
        } => {
            let args = SearchArgs {
                query,
                top_k,
                alpha,
                sparse,
                pool,
                rerank,
                rerank_model,
                sources,
                no_dedup,
                json,
            };
            cmd_search(cli.config, cli.profile, args).await?;
        }
        Commands::Import { file, no_embed } => {
            cmd_import(cli.config, cli.profile, &file, no_embed).await?;
        }
        Commands::Index => {
            cmd_index(cli.config, cli.profile).await?;
        }
        Commands::Stats => {
            cmd_stats(cli.config, cli.profile)?;
        }
        Commands::Config { action } => {
            cmd_config(cli.config, cli.profile, action)?;
        }
    }

    Ok(())
}

fn init_logging(verbose: bool) {
    use tracing_subscriber::{fmt, EnvFilter};

    let default_level = if verbose { "marketrag=debug" } else { "marketrag=info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    // stderr keeps --json output clean
    fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

async fn cmd_search(
    config_path: Option<PathBuf>,
    profile: Option<String>,
    args: SearchArgs,
) -> Result<()> {
    let config = load_config(config_path, profile)?;
    let storage = StorageManager::new(config.data_dir()?)?;
    let provider = FastEmbedProvider::new(&config.embedding.model)?;
    let searcher = HybridSearcher::new(Arc::new(provider), &storage, &config)?;

    let mut request = searcher.request(args.query);
    if let Some(top_k) = args.top_k {
        request = request.with_top_k(top_k);
    }
    if let Some(alpha) = args.alpha {
        request = request.with_alpha(alpha);
    }
    if args.sparse {
        request = request.with_sparse(true);
    }
    if let Some(pool) = args.pool {
        request = request.with_pool(pool);
    }
    if args.rerank {
        request = request.with_rerank(true);
    }
    if let Some(model) = args.rerank_model {
        request = request.with_rerank_model(model);
    }
    if !args.sources.is_empty() {
        request = request.with_sources(args.sources);
    }
    if args.no_dedup {
        request = request.with_dedup(false);
    }

    let outcome = searcher.retrieve(&request).await?;

    if args.json {
        let json = serde_json::to_string_pretty(&outcome).map_err(|e| MarketRagError::Json {
            source: e,
            context: "Failed to serialize results".to_string(),
        })?;
        println!("{}", json);
    } else {
        print_outcome(&outcome);
    }

    Ok(())
}

fn print_outcome(outcome: &RetrieveOutcome) {
    if outcome.hits.is_empty() {
        println!("No results");
        return;
    }

    for (rank, hit) in outcome.hits.iter().enumerate() {
        let chunk = &hit.chunk;
        let mut scores = Vec::new();
        if let Some(dist) = hit.dist {
            scores.push(format!("dist={:.4}", dist));
        }
        if let Some(bm25) = hit.bm25 {
            scores.push(format!("bm25={:.4}", bm25));
        }
        if let Some(hybrid) = hit.hybrid_score {
            scores.push(format!("hybrid={:.4}", hybrid));
        }
        if let Some(rerank) = hit.rerank_score {
            scores.push(format!("rerank={:.4}", rerank));
        }

        let symbol = chunk
            .symbol
            .as_deref()
            .map(|s| format!(" {}", s))
            .unwrap_or_default();
        println!(
            "{}. [{}{}] {}#{}  {}",
            rank + 1,
            chunk.source,
            symbol,
            chunk.document_id.as_deref().unwrap_or("-"),
            chunk.chunk_index,
            scores.join(" ")
        );
        println!("   {}", hit.preview(200).replace('\n', " "));
    }

    match &outcome.rerank {
        RerankStatus::Applied { model } => println!("\nReranked with {}", model),
        RerankStatus::Degraded { reason } => {
            println!("\n⚠ Reranking unavailable ({}); results are in retrieval order", reason)
        }
        RerankStatus::NotRequested | RerankStatus::Skipped => {}
    }
}

async fn cmd_import(
    config_path: Option<PathBuf>,
    profile: Option<String>,
    file: &std::path::Path,
    no_embed: bool,
) -> Result<()> {
    let config = load_config(config_path, profile)?;
    let storage = StorageManager::new(config.data_dir()?)?;

    let stats = storage.import_jsonl(file, config.embedding.dimension)?;
    println!(
        "✓ Imported {} chunks ({} already present)",
        stats.inserted, stats.skipped
    );

    if no_embed {
        return Ok(());
    }

    let provider = FastEmbedProvider::new(&config.embedding.model)?;
    let processor = BatchProcessor::new(
        Arc::new(provider),
        storage.database.clone(),
        config.embedding.batch_size,
    );
    let result = processor.process().await?;
    if result.processed > 0 || result.failed > 0 {
        println!(
            "✓ Embedded {} chunks in {}ms ({} failed)",
            result.processed, result.duration_ms, result.failed
        );
    }

    Ok(())
}

async fn cmd_index(config_path: Option<PathBuf>, profile: Option<String>) -> Result<()> {
    let config = load_config(config_path, profile)?;
    let storage = StorageManager::new(config.data_dir()?)?;

    let indexes = IndexManager::new(
        storage.database.clone(),
        storage.keyword_index_dir(),
        config.embedding.dimension,
        config.indexing.clone(),
    );

    let (dense, sparse) = tokio::join!(indexes.ensure_dense_index(), indexes.ensure_sparse_index());
    let (dense, sparse) = (dense?, sparse?);

    println!("✓ Vector index: {} chunks", dense.len());
    println!("✓ Keyword index: {} chunks", sparse.len());

    Ok(())
}

fn cmd_stats(config_path: Option<PathBuf>, profile: Option<String>) -> Result<()> {
    let config = load_config(config_path, profile)?;
    let data_dir = config.data_dir()?;
    let storage = StorageManager::new(data_dir.clone())?;
    let stats = storage.database.stats()?;

    println!("marketrag store");
    println!("===============");
    println!("Location:  {}", data_dir.display());
    println!("Chunks:    {}", stats.chunk_count);
    println!("Embedded:  {}", stats.embedded_count);
    println!("Documents: {}", stats.document_count);

    if !stats.sources.is_empty() {
        println!("\nBy source:");
        for (source, count) in &stats.sources {
            println!("  {:<16} {}", source, count);
        }
    }

    Ok(())
}

fn cmd_config(
    config_path: Option<PathBuf>,
    profile: Option<String>,
    action: ConfigAction,
) -> Result<()> {
    match action {
        ConfigAction::Show => {
            let config = load_config(config_path, profile)?;
            let toml = toml::to_string_pretty(&config)?;
            println!("{}", toml);
        }
        ConfigAction::Validate { file } => {
            let path = match file.or(config_path) {
                Some(path) => path,
                None => Config::default_path()?,
            };
            let config = Config::load(&path)?;
            println!("✓ Configuration is valid");
            println!("  Schema version: {}", config.meta.schema_version);
        }
        ConfigAction::Init { force } => {
            let path = match config_path {
                Some(path) => path,
                None => Config::default_path()?,
            };

            if path.exists() && !force {
                println!("Configuration file already exists at: {}", path.display());
                println!("Use --force to overwrite");
                return Ok(());
            }

            Config::default().save(&path)?;
            println!("✓ Configuration initialized at: {}", path.display());
        }
        ConfigAction::Path => {
            let path = match config_path {
                Some(path) => path,
                None => Config::default_path()?,
            };
            println!("{}", path.display());
        }
    }

    Ok(())
}

fn load_config(config_path: Option<PathBuf>, profile: Option<String>) -> Result<Config> {
    let path = match config_path {
        Some(path) => path,
        None => Config::default_path()?,
    };

    if !path.exists() {
        tracing::warn!(
            "Config file not found, using defaults. Run 'marketrag config init' to create one."
        );
        let mut config = Config::default();
        config.apply_env_overrides();
        if let Some(profile) = profile {
            config.apply_profile(&profile)?;
        }
        ConfigValidator::validate(&config)?;
        return Ok(config);
    }

    if let Some(profile) = profile {
        Config::load_with_profile(&path, &profile)
    } else {
        Config::load(&path)
    }
}
