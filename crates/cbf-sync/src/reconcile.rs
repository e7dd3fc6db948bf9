//! Per-domain reconciliation: source enumeration, sink enumeration, left-anti-join.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use arrow_array::{RecordBatch, StringArray};
use arrow_schema::{DataType, Field as ArrowField, Schema};
use cbf_adapters::{AdapterError, IdentifierSink, IdentifierSource};
use cbf_core::{DomainConfig, Identifier, WorkQueue};
use cbf_storage::{sha256_hex, write_file_atomic, write_id_csv, ID_COLUMN};
use chrono::{DateTime, Utc};
use parquet::arrow::ArrowWriter;
use serde::Serialize;
use thiserror::Error;
use tracing::{info, instrument, warn};
use uuid::Uuid;

pub const FULL_FILE: &str = "full.csv";
pub const LOADED_FILE: &str = "loaded.csv";
pub const UNPROCESSED_FILE: &str = "unprocessed.csv";
pub const UNPROCESSED_PARQUET_FILE: &str = "unprocessed.parquet";

#[derive(Debug, Error)]
pub enum DomainError {
    #[error(transparent)]
    Adapter(#[from] AdapterError),
    #[error("writing outputs: {0:#}")]
    Output(#[from] anyhow::Error),
    #[error("domain task aborted: {0}")]
    Aborted(String),
}

#[derive(Debug, Clone, Serialize)]
pub struct WrittenFile {
    pub path: String,
    pub sha256: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct DomainOutcome {
    pub domain: String,
    pub generated_at: DateTime<Utc>,
    pub source_count: usize,
    pub sink_count: usize,
    pub unprocessed_count: usize,
    pub full: WrittenFile,
    pub loaded: WrittenFile,
    pub unprocessed: WrittenFile,
    pub unprocessed_parquet: WrittenFile,
}

#[derive(Debug, Clone, Serialize)]
pub struct DomainReport {
    pub domain: String,
    pub status: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub outcome: Option<DomainOutcome>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl DomainReport {
    pub fn is_ok(&self) -> bool {
        self.outcome.is_some()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ReconcileRunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub domains: Vec<DomainReport>,
    pub report_path: String,
}

impl ReconcileRunSummary {
    pub fn failed(&self) -> usize {
        self.domains.iter().filter(|d| !d.is_ok()).count()
    }
}

/// Reconciles domains against one source and one sink.
///
/// Every domain owns `data_dir/<domain>/`. Nothing is written until both enumerations
/// succeed. The work queue is written first and the snapshots last, so a failed write
/// never leaves fresh snapshots next to a stale queue.
#[derive(Clone)]
pub struct ReconcilePipeline {
    source: Arc<dyn IdentifierSource>,
    sink: Arc<dyn IdentifierSink>,
    data_dir: PathBuf,
    reports_dir: PathBuf,
}

impl ReconcilePipeline {
    pub fn new(
        source: Arc<dyn IdentifierSource>,
        sink: Arc<dyn IdentifierSink>,
        data_dir: impl Into<PathBuf>,
        reports_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            source,
            sink,
            data_dir: data_dir.into(),
            reports_dir: reports_dir.into(),
        }
    }

    pub fn domain_dir(&self, domain: &str) -> PathBuf {
        self.data_dir.join(domain)
    }

    #[instrument(skip_all, fields(domain = %domain.name))]
    pub async fn reconcile_domain(&self, domain: &DomainConfig) -> Result<DomainOutcome, DomainError> {
        let (source_ids, sink_ids) = tokio::try_join!(
            self.source.source_identifiers(domain),
            self.sink.loaded_identifiers(domain),
        )?;
        info!(source = source_ids.len(), sink = sink_ids.len(), "identifiers enumerated");

        let queue = WorkQueue::build(domain.name.clone(), Utc::now(), &source_ids, &sink_ids);
        let dir = self.domain_dir(&domain.name);

        let unprocessed_path = dir.join(UNPROCESSED_FILE);
        let unprocessed = written(&unprocessed_path, write_id_csv(&unprocessed_path, &queue.ids).await?);

        let parquet_path = dir.join(UNPROCESSED_PARQUET_FILE);
        let parquet_bytes = work_queue_parquet(&queue.ids)?;
        write_file_atomic(&parquet_path, &parquet_bytes).await?;
        let unprocessed_parquet = written(&parquet_path, sha256_hex(&parquet_bytes));

        let full_path = dir.join(FULL_FILE);
        let full = written(&full_path, write_id_csv(&full_path, &source_ids).await?);
        let loaded_path = dir.join(LOADED_FILE);
        let loaded = written(&loaded_path, write_id_csv(&loaded_path, &sink_ids).await?);

        info!(
            unprocessed = queue.len(),
            path = %unprocessed.path,
            "work queue written"
        );
        Ok(DomainOutcome {
            domain: domain.name.clone(),
            generated_at: queue.generated_at,
            source_count: source_ids.len(),
            sink_count: sink_ids.len(),
            unprocessed_count: queue.len(),
            full,
            loaded,
            unprocessed,
            unprocessed_parquet,
        })
    }

    /// Reconcile every domain concurrently. A failing domain is reported, never propagated.
    pub async fn run(&self, domains: Vec<DomainConfig>) -> anyhow::Result<ReconcileRunSummary> {
        let run_id = Uuid::new_v4();
        let started_at = Utc::now();
        info!(%run_id, domains = domains.len(), "reconcile run started");

        let handles: Vec<_> = domains
            .into_iter()
            .map(|domain| {
                let pipeline = self.clone();
                let name = domain.name.clone();
                let handle = tokio::spawn(async move { pipeline.reconcile_domain(&domain).await });
                (name, handle)
            })
            .collect();

        let mut reports = Vec::with_capacity(handles.len());
        for (name, handle) in handles {
            let result = match handle.await {
                Ok(result) => result,
                Err(join_err) => Err(DomainError::Aborted(join_err.to_string())),
            };
            let report = match result {
                Ok(outcome) => DomainReport {
                    domain: name,
                    status: "ok",
                    outcome: Some(outcome),
                    error: None,
                },
                Err(err) => {
                    warn!(domain = %name, error = %err, "domain reconciliation failed; continuing");
                    DomainReport {
                        domain: name,
                        status: "failed",
                        outcome: None,
                        error: Some(err.to_string()),
                    }
                }
            };
            reports.push(report);
        }

        let finished_at = Utc::now();
        let report_path = self.reports_dir.join(run_id.to_string()).join("reconcile.json");
        let summary = ReconcileRunSummary {
            run_id,
            started_at,
            finished_at,
            domains: reports,
            report_path: report_path.display().to_string(),
        };
        let bytes = serde_json::to_vec_pretty(&summary).context("serializing reconcile report")?;
        write_file_atomic(&report_path, &bytes).await?;

        info!(
            %run_id,
            ok = summary.domains.len() - summary.failed(),
            failed = summary.failed(),
            "reconcile run finished"
        );
        Ok(summary)
    }
}

fn written(path: &Path, sha256: String) -> WrittenFile {
    WrittenFile {
        path: path.display().to_string(),
        sha256,
    }
}

/// Single `id` column parquet encoding of a work queue.
pub fn work_queue_parquet(ids: &[Identifier]) -> anyhow::Result<Vec<u8>> {
    let schema = Arc::new(Schema::new(vec![ArrowField::new(ID_COLUMN, DataType::Utf8, false)]));
    let column = StringArray::from(ids.iter().map(Identifier::as_str).collect::<Vec<_>>());
    let batch = RecordBatch::try_new(schema.clone(), vec![Arc::new(column)])
        .context("building work queue record batch")?;

    let mut writer = ArrowWriter::try_new(Vec::new(), schema, None).context("opening parquet writer")?;
    writer.write(&batch).context("writing work queue record batch")?;
    writer.into_inner().context("closing parquet writer")
}

#[cfg(test)]
mod tests {
    use super::*;
    use cbf_adapters::StaticIdentifiers;
    use cbf_storage::read_id_csv;
    use tempfile::tempdir;

    fn ids(values: &[&str]) -> Vec<Identifier> {
        values.iter().map(|v| Identifier::from(*v)).collect()
    }

    fn pipeline(source: StaticIdentifiers, sink: StaticIdentifiers, root: &Path) -> ReconcilePipeline {
        ReconcilePipeline::new(
            Arc::new(source),
            Arc::new(sink),
            root.join("data"),
            root.join("reports"),
        )
    }

    #[tokio::test]
    async fn writes_full_loaded_and_unprocessed_files() {
        let dir = tempdir().expect("tempdir");
        let p = pipeline(
            StaticIdentifiers::new().with_domain("amazon", ["A", "B", "C", "D"]),
            StaticIdentifiers::new().with_domain("amazon", ["B", "D"]),
            dir.path(),
        );

        let outcome = p
            .reconcile_domain(&DomainConfig::new("amazon"))
            .await
            .expect("reconcile");
        assert_eq!(outcome.unprocessed_count, 2);

        let domain_dir = dir.path().join("data/amazon");
        assert_eq!(
            read_id_csv(&domain_dir.join(UNPROCESSED_FILE)).await.expect("unprocessed"),
            ids(&["A", "C"])
        );
        assert_eq!(
            read_id_csv(&domain_dir.join(FULL_FILE)).await.expect("full"),
            ids(&["A", "B", "C", "D"])
        );
        assert_eq!(
            read_id_csv(&domain_dir.join(LOADED_FILE)).await.expect("loaded"),
            ids(&["B", "D"])
        );
        assert!(domain_dir.join(UNPROCESSED_PARQUET_FILE).exists());
        assert!(outcome.generated_at <= Utc::now());
    }

    #[tokio::test]
    async fn failed_domain_keeps_previous_work_queue() {
        let dir = tempdir().expect("tempdir");
        let ok = pipeline(
            StaticIdentifiers::new().with_domain("shopee", ["1", "2"]),
            StaticIdentifiers::new().with_domain("shopee", Vec::<&str>::new()),
            dir.path(),
        );
        ok.reconcile_domain(&DomainConfig::new("shopee"))
            .await
            .expect("first run");

        let broken = pipeline(
            StaticIdentifiers::new().with_domain("shopee", ["9"]),
            StaticIdentifiers::new().with_unavailable("shopee", "connection refused"),
            dir.path(),
        );
        let err = broken
            .reconcile_domain(&DomainConfig::new("shopee"))
            .await
            .expect_err("sink down");
        assert!(matches!(
            err,
            DomainError::Adapter(AdapterError::BackingStoreUnavailable { .. })
        ));

        let path = dir.path().join("data/shopee").join(UNPROCESSED_FILE);
        assert_eq!(read_id_csv(&path).await.expect("kept"), ids(&["1", "2"]));
    }

    #[tokio::test]
    async fn work_queue_is_written_before_snapshots() {
        let dir = tempdir().expect("tempdir");
        let domain_dir = dir.path().join("data/amazon");
        std::fs::create_dir_all(domain_dir.join(FULL_FILE)).expect("blocking dir");

        let p = pipeline(
            StaticIdentifiers::new().with_domain("amazon", ["A", "B"]),
            StaticIdentifiers::new().with_domain("amazon", ["B"]),
            dir.path(),
        );
        let err = p
            .reconcile_domain(&DomainConfig::new("amazon"))
            .await
            .expect_err("full.csv is a directory");
        assert!(matches!(err, DomainError::Output(_)));

        assert_eq!(
            read_id_csv(&domain_dir.join(UNPROCESSED_FILE)).await.expect("queue"),
            ids(&["A"])
        );
        assert!(!domain_dir.join(LOADED_FILE).exists());
    }

    #[tokio::test]
    async fn run_isolates_failures_per_domain_and_writes_report() {
        let dir = tempdir().expect("tempdir");
        let p = pipeline(
            StaticIdentifiers::new()
                .with_domain("amazon", ["A", "B"])
                .with_domain("supply", ["p1", "p2", "p3"]),
            StaticIdentifiers::new()
                .with_domain("amazon", ["A"])
                .with_unavailable("supply", "neo4j down"),
            dir.path(),
        );

        let summary = p
            .run(vec![
                DomainConfig::new("amazon"),
                DomainConfig::new("tiktok"),
                DomainConfig::new("supply"),
            ])
            .await
            .expect("run");

        let statuses: Vec<_> = summary
            .domains
            .iter()
            .map(|d| (d.domain.as_str(), d.status))
            .collect();
        assert_eq!(
            statuses,
            vec![("amazon", "ok"), ("tiktok", "failed"), ("supply", "failed")]
        );
        assert_eq!(summary.failed(), 2);
        assert!(summary.domains[1]
            .error
            .as_deref()
            .unwrap_or_default()
            .contains("tiktok"));

        let report: serde_json::Value = serde_json::from_str(
            &std::fs::read_to_string(&summary.report_path).expect("report file"),
        )
        .expect("report json");
        assert_eq!(report["domains"][0]["outcome"]["unprocessed_count"], 1);
        assert!(!dir.path().join("data/supply").join(UNPROCESSED_FILE).exists());
    }

    #[test]
    fn parquet_encoding_of_empty_queue_succeeds() {
        let bytes = work_queue_parquet(&[]).expect("parquet");
        assert_eq!(&bytes[..4], b"PAR1");
    }
}
