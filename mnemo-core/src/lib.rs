pub mod config;
pub mod db;
pub mod embeddings;
pub mod error;
pub mod graph;
pub mod ipc;
pub mod llm;
pub mod models;
pub mod tenant;
pub mod vector;

pub use config::MnemoConfig;
pub use embeddings::{create_embedder, EmbeddingBackend, EmbeddingError, GeminiEmbeddingClient, GEMINI_DIMENSIONS};
pub use error::MnemoError;
pub use graph::{
    ingest_graph_data, GraphConnector, GraphData, GraphError, GraphSession, GraphStore, IngestReport,
    InMemoryGraphStore, PgGraphConnector, PgGraphStore,
};
pub use llm::{create_generator, GeminiTextClient, LlmError, TextGenerator};
pub use tenant::TenantId;
pub use vector::{InMemoryVectorStore, PgVectorStore, VectorError, VectorStore};
