//! Chunk records and the JSON-lines import format

use serde::{Deserialize, Serialize};

/// A stored chunk, the unit of retrieval
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Chunk {
    /// Row id, unique and immutable once assigned
    pub id: i64,

    /// Categorical tag (e.g. "sec", "news", "market")
    pub source: String,

    /// Associated ticker or entity
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub symbol: Option<String>,

    /// Logical parent document
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub document_id: Option<String>,

    /// Position within the parent document
    pub chunk_index: i64,

    /// Raw text payload
    pub content: String,

    /// Only loaded when building the dense index
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub embedding: Option<Vec<f32>>,
}

/// A chunk as it arrives from an import file, before an id is assigned
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewChunk {
    pub source: String,
    #[serde(default)]
    pub symbol: Option<String>,
    #[serde(default)]
    pub document_id: Option<String>,
    #[serde(default)]
    pub chunk_index: i64,
    pub content: String,
    #[serde(default)]
    pub embedding: Option<Vec<f32>>,
}

impl NewChunk {
    pub fn new(source: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            symbol: None,
            document_id: None,
            chunk_index: 0,
            content: content.into(),
            embedding: None,
        }
    }

    pub fn with_document(mut self, document_id: impl Into<String>, chunk_index: i64) -> Self {
        self.document_id = Some(document_id.into());
        self.chunk_index = chunk_index;
        self
    }

    pub fn with_symbol(mut self, symbol: impl Into<String>) -> Self {
        self.symbol = Some(symbol.into());
        self
    }

    pub fn with_embedding(mut self, embedding: Vec<f32>) -> Self {
        self.embedding = Some(embedding);
        self
    }
}

/// Serialize an embedding as little-endian f32 bytes
pub fn encode_embedding(vector: &[f32]) -> Vec<u8> {
    vector.iter().flat_map(|v| v.to_le_bytes()).collect()
}

/// Decode a little-endian f32 blob; `None` if the length is not a multiple of 4
pub fn decode_embedding(bytes: &[u8]) -> Option<Vec<f32>> {
    if bytes.len() % 4 != 0 {
        return None;
    }
    Some(
        bytes
            .chunks_exact(4)
            .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
            .collect(),
    )
}
