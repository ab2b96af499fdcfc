//! CLI command definitions and parsing
use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(
    name = "marketrag",
    version,
    author = "neur0map",
    about = "Hybrid semantic and keyword retrieval over market text",
    long_about = "marketrag stores chunks of filings, news and research, indexes them for dense (HNSW) \
                  and sparse (BM25) search, and answers queries with fused, deduplicated and optionally \
                  reranked results."
)]
pub struct Cli {
    /// Global config file path (defaults to ~/.config/marketrag/config.toml)
    #[arg(short, long, global = true, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Named profile from the `[profiles]` table to apply on top of the configuration
    #[arg(short, long, global = true)]
    pub profile: Option<String>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Retrieve chunks relevant to a query
    Search {
        /// Search query text
        query: String,

        /// Maximum number of results to return
        #[arg(short = 'k', long)]
        top_k: Option<usize>,

        /// Weight on dense distance when fusing (0 = keyword only, 1 = semantic only)
        #[arg(short, long)]
        alpha: Option<f32>,

        /// Also run keyword search and fuse the two pools
        #[arg(long)]
        sparse: bool,

        /// Candidate pool size for each search path
        #[arg(long, value_name = "N")]
        pool: Option<usize>,

        /// Rerank the pool before truncating
        #[arg(short, long)]
        rerank: bool,

        /// Reranker model; names starting with "cohere" use the hosted API
        #[arg(long, value_name = "MODEL")]
        rerank_model: Option<String>,

        /// Only return chunks from this source (repeatable)
        #[arg(short, long = "source", value_name = "SOURCE")]
        sources: Vec<String>,

        /// Return every matching chunk instead of one per document
        #[arg(long)]
        no_dedup: bool,

        /// Show results in JSON format
        #[arg(long)]
        json: bool,
    },

    /// Import chunks from a JSON Lines file
    Import {
        /// File with one chunk object per line
        file: PathBuf,

        /// Skip computing embeddings for chunks that arrive without one
        #[arg(long)]
        no_embed: bool,
    },

    /// Build the dense index and bring the keyword index up to date
    Index,

    /// Show chunk store statistics
    Stats,

    /// Manage configuration
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand, Debug)]
pub enum ConfigAction {
    /// Show current configuration
    Show,

    /// Validate configuration file
    Validate {
        /// Path to config file (defaults to standard location)
        #[arg(short, long)]
        file: Option<PathBuf>,
    },

    /// Initialize default configuration
    Init {
        /// Force overwrite existing config
        #[arg(short, long)]
        force: bool,
    },

    /// Print the configuration file location
    Path,
}

impl Cli {
    /// Parse CLI arguments from command line
    pub fn parse_args() -> Self {
        Self::parse()
    }
}
