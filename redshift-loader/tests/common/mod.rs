#![allow(dead_code)]

use redshift_config::shared::{BatchConfig, LoaderConfig, RetryConfig};
use redshift_loader::concurrency::shutdown::create_shutdown_channel;
use redshift_loader::context::EngineContext;
use redshift_loader::engine::{Engine, RunSummary};
use redshift_loader::error::LoaderResult;
use redshift_loader::naming::TableName;
use redshift_loader::staging::MemoryStagingClient;
use redshift_loader::warehouse::{MemoryTable, MemoryWarehouse};
use redshift_telemetry::tracing::init_test_tracing;
use serde_json::{Value as JsonValue, json};

/// A target wired to in-memory staging and warehouse. Runs share both, so a second run sees
/// the tables left by the first.
pub struct TestTarget {
    pub staging: MemoryStagingClient,
    pub warehouse: MemoryWarehouse,
    config: LoaderConfig,
}

/// Outcome of one run: the engine result and the checkpoints written to the output.
pub struct RunOutput {
    pub result: LoaderResult<RunSummary>,
    pub states: Vec<String>,
}

impl TestTarget {
    pub fn new(update: impl FnOnce(&mut LoaderConfig)) -> Self {
        init_test_tracing();

        let mut config = LoaderConfig {
            batch: BatchConfig {
                max_fill_ms: 3_600_000,
                ..BatchConfig::default()
            },
            staging_retry: fast_retry(),
            load_retry: fast_retry(),
            ..LoaderConfig::default()
        };
        update(&mut config);

        let staging = MemoryStagingClient::new();
        let warehouse = MemoryWarehouse::new(staging.clone());

        Self {
            staging,
            warehouse,
            config,
        }
    }

    pub fn context(&self) -> EngineContext<MemoryWarehouse, MemoryStagingClient> {
        EngineContext::new(
            self.config.clone(),
            self.warehouse.clone(),
            self.staging.clone(),
        )
    }

    pub async fn run(&self, lines: &[String]) -> RunOutput {
        let ctx = self.context();
        let (_shutdown_tx, shutdown_rx) = create_shutdown_channel();

        let input = lines.join("\n");
        let mut output = Vec::new();
        let result = Engine::new(ctx, shutdown_rx)
            .run(input.as_bytes(), &mut output)
            .await;

        let states = String::from_utf8(output)
            .unwrap()
            .lines()
            .map(str::to_string)
            .collect();

        RunOutput { result, states }
    }

    pub async fn table(&self, name: &str) -> MemoryTable {
        self.warehouse
            .table(&table(name))
            .await
            .unwrap_or_else(|| panic!("table {name} does not exist"))
    }

    /// Staged object keys under `prefix`, sorted.
    pub async fn staged_keys(&self, prefix: &str) -> Vec<String> {
        self.staging
            .keys()
            .await
            .into_iter()
            .filter(|key| key.starts_with(prefix))
            .collect()
    }
}

pub fn fast_retry() -> RetryConfig {
    RetryConfig {
        max_attempts: 3,
        initial_delay_ms: 1,
        max_delay_ms: 2,
        backoff_factor: 2.0,
    }
}

pub fn table(name: &str) -> TableName {
    TableName::new("public", name)
}

pub fn schema(stream: &str, properties: JsonValue, keys: &[&str]) -> String {
    json!({
        "type": "SCHEMA",
        "stream": stream,
        "schema": {"properties": properties},
        "key_properties": keys,
    })
    .to_string()
}

pub fn record(stream: &str, record: JsonValue) -> String {
    json!({"type": "RECORD", "stream": stream, "record": record}).to_string()
}

pub fn versioned_record(stream: &str, version: u64, record: JsonValue) -> String {
    json!({"type": "RECORD", "stream": stream, "version": version, "record": record}).to_string()
}

pub fn state(value: JsonValue) -> String {
    json!({"type": "STATE", "value": value}).to_string()
}

pub fn activate_version(stream: &str, version: u64) -> String {
    json!({"type": "ACTIVATE_VERSION", "stream": stream, "version": version}).to_string()
}

/// `{id: integer, title: string}`, the shape most tests load.
pub fn id_title_properties() -> JsonValue {
    json!({
        "id": {"type": "integer"},
        "title": {"type": ["null", "string"]}
    })
}

/// Text values of `column`, with nulls as `None`, sorted.
pub fn sorted_values(table: &MemoryTable, column: &str) -> Vec<Option<String>> {
    let mut values = table.column_values(column);
    values.sort();
    values
}

pub fn text(value: &str) -> Option<String> {
    Some(value.to_string())
}
