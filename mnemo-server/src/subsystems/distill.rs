//! Distillation task body: LLM extraction plus knowledge-graph ingestion.
//!
//! Runs inside a worker unit. Everything it needs arrives in the payload, and
//! every failure comes back as `DistillationResult::Error` rather than
//! escaping the call.

use anyhow::Context;
use mnemo_core::config::{GraphDatabaseConfig, LlmConfig};
use mnemo_core::graph::{ingest_graph_data, GraphConnector, GraphData, PgGraphConnector};
use mnemo_core::llm::{create_generator, LlmError, TextGenerator};
use mnemo_core::models::{DistillationPayload, DistillationResult, MemoryEntry};
use regex::Regex;
use std::sync::OnceLock;

pub type GeneratorFactory = dyn Fn(&LlmConfig) -> Result<Box<dyn TextGenerator>, LlmError> + Send + Sync;
pub type ConnectorFactory = dyn Fn(&GraphDatabaseConfig) -> Box<dyn GraphConnector> + Send + Sync;

pub struct DistillationProcessor {
    generators: Box<GeneratorFactory>,
    connectors: Box<ConnectorFactory>,
}

impl Default for DistillationProcessor {
    fn default() -> Self {
        Self::new()
    }
}

impl DistillationProcessor {
    /// Gemini for generation, a dedicated Postgres connection for the graph.
    pub fn new() -> Self {
        Self::with_factories(
            Box::new(create_generator),
            Box::new(|config: &GraphDatabaseConfig| {
                Box::new(PgGraphConnector::new(config.clone())) as Box<dyn GraphConnector>
            }),
        )
    }

    pub fn with_factories(generators: Box<GeneratorFactory>, connectors: Box<ConnectorFactory>) -> Self {
        Self {
            generators,
            connectors,
        }
    }

    pub async fn process(&self, payload: DistillationPayload) -> DistillationResult {
        let entries = match self.extract(&payload).await {
            Ok(entries) => entries,
            Err(e) => {
                tracing::warn!(error = %format!("{:#}", e), "Distillation failed");
                return DistillationResult::Error(format!("{:#}", e));
            }
        };

        match &payload.config.graph_database {
            Some(db) if entries.iter().any(MemoryEntry::has_graph_data) => {
                self.ingest(db, &entries).await;
            }
            Some(_) => tracing::debug!("No entities or relations extracted, skipping graph ingestion"),
            None => tracing::debug!("No graph database configured, skipping graph ingestion"),
        }

        tracing::info!(entries = entries.len(), "Distillation complete");
        DistillationResult::Entries(entries)
    }

    async fn extract(&self, payload: &DistillationPayload) -> anyhow::Result<Vec<MemoryEntry>> {
        let generator = (self.generators)(&payload.config.llm).context("Failed to build LLM client")?;

        let model = payload
            .model_override
            .as_deref()
            .filter(|m| !m.is_empty())
            .unwrap_or_else(|| generator.default_model())
            .to_string();

        tracing::debug!(provider = generator.name(), model = %model, "Requesting distillation");
        let raw = generator
            .generate(&payload.prompt, &model)
            .await
            .context("LLM generation failed")?;

        parse_entries(&raw).context("Malformed distillation output")
    }

    /// Graph writes are best-effort: failures are logged and the session is
    /// always closed.
    async fn ingest(&self, db: &GraphDatabaseConfig, entries: &[MemoryEntry]) {
        let connector = (self.connectors)(db);
        let session = match connector.open().await {
            Ok(session) => session,
            Err(e) => {
                tracing::warn!(host = %db.host, error = %e, "Graph connection failed, skipping ingestion");
                return;
            }
        };

        let report = ingest_graph_data(&*session, &GraphData::from_entries(entries)).await;
        tracing::info!(
            nodes = report.nodes_upserted,
            edges = report.edges_written,
            skipped = report.relations_skipped,
            failures = report.failures,
            "Graph ingestion done"
        );

        if let Err(e) = session.close().await {
            tracing::warn!(error = %e, "Failed to close graph connection");
        }
    }
}

/// Remove Markdown code-fence markers and surrounding whitespace.
pub fn strip_code_fences(raw: &str) -> String {
    static FENCE: OnceLock<Option<Regex>> = OnceLock::new();
    let cleaned = match FENCE.get_or_init(|| Regex::new(r"```(?:json)?").ok()) {
        Some(re) => re.replace_all(raw, "").into_owned(),
        None => raw.replace("```json", "").replace("```", ""),
    };
    cleaned.trim().to_string()
}

pub fn parse_entries(raw: &str) -> Result<Vec<MemoryEntry>, serde_json::Error> {
    serde_json::from_str(&strip_code_fences(raw))
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use mnemo_core::graph::{GraphError, GraphSession, GraphStore, InMemoryGraphConnector, InMemoryGraphStore};
    use mnemo_core::models::DistillationSettings;
    use std::sync::{Arc, Mutex};

    struct FakeGenerator {
        reply: Result<String, String>,
        seen_models: Arc<Mutex<Vec<String>>>,
    }

    #[async_trait]
    impl TextGenerator for FakeGenerator {
        async fn generate(&self, _prompt: &str, model: &str) -> Result<String, LlmError> {
            self.seen_models.lock().unwrap().push(model.to_string());
            self.reply.clone().map_err(|message| LlmError::Api { code: 500, message })
        }

        fn default_model(&self) -> &str {
            "fake-default"
        }

        fn name(&self) -> &str {
            "fake"
        }
    }

    struct SharedConnector(Arc<InMemoryGraphConnector>);

    #[async_trait]
    impl GraphConnector for SharedConnector {
        async fn open(&self) -> Result<Box<dyn GraphSession>, GraphError> {
            self.0.open().await
        }
    }

    struct Harness {
        processor: DistillationProcessor,
        connector: Arc<InMemoryGraphConnector>,
        models: Arc<Mutex<Vec<String>>>,
    }

    fn harness(reply: Result<&str, &str>, connector: InMemoryGraphConnector) -> Harness {
        let reply = reply.map(str::to_string).map_err(str::to_string);
        let models: Arc<Mutex<Vec<String>>> = Arc::default();
        let connector = Arc::new(connector);

        let (m, c) = (models.clone(), connector.clone());
        let processor = DistillationProcessor::with_factories(
            Box::new(move |_config: &LlmConfig| {
                Ok::<_, LlmError>(Box::new(FakeGenerator {
                    reply: reply.clone(),
                    seen_models: m.clone(),
                }) as Box<dyn TextGenerator>)
            }),
            Box::new(move |_db: &GraphDatabaseConfig| Box::new(SharedConnector(c.clone())) as Box<dyn GraphConnector>),
        );

        Harness {
            processor,
            connector,
            models,
        }
    }

    fn graph_db() -> GraphDatabaseConfig {
        GraphDatabaseConfig {
            host: "localhost".to_string(),
            port: 5432,
            username: "mnemo".to_string(),
            password: None,
            database: "mnemo".to_string(),
            ssl: false,
        }
    }

    fn payload(graph_database: Option<GraphDatabaseConfig>, model_override: Option<&str>) -> DistillationPayload {
        DistillationPayload {
            config: DistillationSettings {
                llm: LlmConfig::default(),
                graph_database,
            },
            prompt: "extract".to_string(),
            model_override: model_override.map(str::to_string),
        }
    }

    const GRAPH_REPLY: &str = r#"```json
[
  {"content": "User builds services in Rust", "type": "DOMAIN", "entities": ["User", "Rust"], "relations": ["User -> uses -> Rust", "broken relation"]},
  {"content": "User dislikes YAML"}
]
```"#;

    #[test]
    fn test_fenced_json_parses() {
        let entries = parse_entries("```json\n[{\"content\":\"x\"}]\n```").unwrap();
        assert_eq!(entries, vec![MemoryEntry::new("x")]);
    }

    #[test]
    fn test_bare_fence_and_whitespace_are_stripped() {
        assert_eq!(strip_code_fences("  ```\n[]\n```  "), "[]");
        assert_eq!(strip_code_fences("[]"), "[]");
    }

    #[test]
    fn test_prose_around_json_is_malformed() {
        assert!(parse_entries("Here you go: [{\"content\":\"x\"}]").is_err());
    }

    #[tokio::test]
    async fn test_llm_failure_returns_error_and_opens_no_connection() {
        let h = harness(Err("quota exceeded"), InMemoryGraphConnector::default());

        let result = h.processor.process(payload(Some(graph_db()), None)).await;

        match result {
            DistillationResult::Error(message) => assert!(message.contains("quota exceeded")),
            other => panic!("Expected error result, got {:?}", other),
        }
        assert_eq!(h.connector.opened(), 0);
    }

    #[tokio::test]
    async fn test_malformed_json_fails_whole_call() {
        let h = harness(Ok("```json\n[{\"content\": \"x\"\n```"), InMemoryGraphConnector::default());
        let result = h.processor.process(payload(Some(graph_db()), None)).await;

        assert!(result.is_error());
        assert_eq!(h.connector.opened(), 0);
    }

    #[tokio::test]
    async fn test_entries_are_ingested_and_session_closed() {
        let h = harness(Ok(GRAPH_REPLY), InMemoryGraphConnector::default());

        let result = h.processor.process(payload(Some(graph_db()), None)).await;

        let entries = match result {
            DistillationResult::Entries(entries) => entries,
            other => panic!("Expected entries, got {:?}", other),
        };
        assert_eq!(entries.len(), 2);
        assert_eq!(h.connector.opened(), 1);
        assert_eq!(h.connector.closed(), 1);

        let store = h.connector.store();
        assert_eq!(store.node_count().await, 2);
        assert_eq!(store.edge_count().await, 1);
        assert!(store.node_by_name("Rust").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_no_graph_config_skips_ingestion() {
        let h = harness(Ok(GRAPH_REPLY), InMemoryGraphConnector::default());
        let result = h.processor.process(payload(None, None)).await;

        assert!(!result.is_error());
        assert_eq!(h.connector.opened(), 0);
    }

    #[tokio::test]
    async fn test_entries_without_graph_data_open_no_connection() {
        let h = harness(Ok(r#"[{"content": "plain"}]"#), InMemoryGraphConnector::default());
        let result = h.processor.process(payload(Some(graph_db()), None)).await;

        assert!(!result.is_error());
        assert_eq!(h.connector.opened(), 0);
    }

    #[tokio::test]
    async fn test_graph_connection_failure_is_swallowed() {
        let h = harness(Ok(GRAPH_REPLY), InMemoryGraphConnector::unavailable());
        let result = h.processor.process(payload(Some(graph_db()), None)).await;

        assert!(matches!(result, DistillationResult::Entries(ref e) if e.len() == 2));
    }

    #[tokio::test]
    async fn test_model_override_wins_over_default() {
        let h = harness(Ok("[]"), InMemoryGraphConnector::default());

        h.processor.process(payload(None, Some("gemini-1.5-pro"))).await;
        h.processor.process(payload(None, None)).await;
        h.processor.process(payload(None, Some(""))).await;

        assert_eq!(
            *h.models.lock().unwrap(),
            vec!["gemini-1.5-pro", "fake-default", "fake-default"]
        );
    }

    #[tokio::test]
    async fn test_missing_credentials_become_error_result() {
        let processor = DistillationProcessor::new();
        let result = processor.process(payload(None, None)).await;
        assert!(matches!(result, DistillationResult::Error(ref m) if m.contains("LLM client")));
    }

    #[tokio::test]
    async fn test_in_memory_store_sees_ingested_relation() {
        let store = Arc::new(InMemoryGraphStore::new());
        let h = harness(Ok(GRAPH_REPLY), InMemoryGraphConnector::new(store.clone()));
        h.processor.process(payload(Some(graph_db()), None)).await;

        let user = store.node_by_name("User").await.unwrap().unwrap();
        let hops = store.traverse(user.id, 1).await.unwrap();
        assert_eq!(hops.len(), 1);
        assert_eq!(hops[0].target_name, "Rust");
    }
}
