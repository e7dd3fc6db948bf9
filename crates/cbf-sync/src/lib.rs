//! Reconciliation and taxonomy-discovery pipelines for CBF.

pub mod config;
pub mod crawl;
pub mod ingest;
pub mod reconcile;

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use cbf_adapters::{
    Neo4jIdentifierSink, PgCategorySink, PgIdentifierSource, SellerAppTaxonomyClient, TaxonomyClient,
};
use cbf_core::DatabaseTarget;
use cbf_storage::{write_file_atomic, ArtifactStore, HttpFetcher};
use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{info, warn};
use uuid::Uuid;

pub use config::{DomainRegistry, PipelineConfig, ALL_DOMAINS};
pub use crawl::{CategoryCrawler, CrawlConfig, CrawlReport, NodeFailure};
pub use ingest::{load_batch, CategoryBatch, CategoryIngestor, IngestError, IngestOutcome};
pub use reconcile::{DomainError, DomainOutcome, DomainReport, ReconcilePipeline, ReconcileRunSummary};

pub const CRATE_NAME: &str = "cbf-sync";

pub const DEFAULT_GEO: &str = "us";
pub const DEFAULT_SEED: &str = "553958";

#[derive(Debug, Clone, Serialize)]
pub struct SeedReport {
    pub seed_id: String,
    pub nodes: usize,
    pub fetched: usize,
    pub failures: Vec<NodeFailure>,
    pub truncated: bool,
    pub duration_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ingest: Option<IngestOutcome>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub artifact: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct CrawlRunSummary {
    pub run_id: Uuid,
    pub geo: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub seeds: Vec<SeedReport>,
    pub report_path: String,
}

impl CrawlRunSummary {
    /// Seeds whose crawl was abandoned or whose batch did not reach the sink.
    pub fn failed_seeds(&self) -> usize {
        self.seeds.iter().filter(|s| s.error.is_some()).count()
    }
}

/// Crawl each seed independently and ingest its table. One seed failing never stops the others.
///
/// A crawl abandoned because the taxonomy API is unusable is reported as failed and not ingested.
pub async fn crawl_and_ingest(
    crawler: &CategoryCrawler,
    ingestor: &CategoryIngestor,
    seeds: &[String],
    geo: &str,
) -> Vec<SeedReport> {
    let mut reports = Vec::with_capacity(seeds.len());
    for seed_id in seeds {
        let crawl = crawler.crawl(seed_id).await;
        let mut report = SeedReport {
            seed_id: seed_id.clone(),
            nodes: crawl.table.len(),
            fetched: crawl.fetched,
            failures: crawl.failures,
            truncated: crawl.truncated,
            duration_ms: u64::try_from(crawl.duration.as_millis()).unwrap_or(u64::MAX),
            ingest: None,
            error: None,
            artifact: None,
        };
        if let Some(reason) = crawl.aborted {
            warn!(seed_id = %seed_id, error = %reason, "crawl abandoned; nothing ingested for this seed");
            report.error = Some(reason);
            reports.push(report);
            continue;
        }
        match ingestor.ingest_seed(&crawl.table, geo, Some(seed_id)).await {
            Ok(outcome) => {
                report.artifact = Some(outcome.artifact.clone());
                report.ingest = Some(outcome);
            }
            Err(err) => {
                warn!(seed_id = %seed_id, error = %err, "seed ingest failed; continuing with next seed");
                report.artifact = err.artifact().map(|p| p.display().to_string());
                report.error = Some(err.to_string());
            }
        }
        reports.push(report);
    }
    reports
}

pub async fn run_reconcile_from_env(selector: &str) -> Result<ReconcileRunSummary> {
    let config = PipelineConfig::from_env();
    let registry = DomainRegistry::load(&config.registry_path())?;
    let domains = registry.select(selector)?;

    let pipeline = ReconcilePipeline::new(
        Arc::new(PgIdentifierSource::new(config.postgres.clone())),
        Arc::new(Neo4jIdentifierSink::new(config.neo4j.clone())),
        config.data_dir.clone(),
        config.reports_dir(),
    );
    pipeline.run(domains).await
}

pub async fn run_crawl_from_env(seeds: &[String], geo: &str) -> Result<CrawlRunSummary> {
    let config = PipelineConfig::from_env();
    let run_id = Uuid::new_v4();
    let started_at = Utc::now();

    let http = Arc::new(HttpFetcher::new(config.http_client_config())?);
    let client: Arc<dyn TaxonomyClient> = Arc::new(
        SellerAppTaxonomyClient::new(http, run_id, &config.sellerapp, geo)
            .context("configuring taxonomy client")?,
    );
    let sink = PgCategorySink::connect(&config.postgres, config.category_table.clone())
        .await
        .context("connecting category sink")?;

    let crawler = CategoryCrawler::new(client, config.crawl.clone());
    let ingestor = CategoryIngestor::new(Arc::new(sink), ArtifactStore::new(config.artifacts_dir.clone()));
    info!(%run_id, geo, seeds = seeds.len(), "category crawl started");
    let seeds = crawl_and_ingest(&crawler, &ingestor, seeds, geo).await;

    let report_path = config
        .reports_dir()
        .join(run_id.to_string())
        .join("crawl.json");
    let summary = CrawlRunSummary {
        run_id,
        geo: geo.to_string(),
        started_at,
        finished_at: Utc::now(),
        seeds,
        report_path: report_path.display().to_string(),
    };
    let bytes = serde_json::to_vec_pretty(&summary).context("serializing crawl report")?;
    write_file_atomic(&report_path, &bytes).await?;
    Ok(summary)
}

pub async fn replay_from_env(artifact: &Path) -> Result<IngestOutcome> {
    let config = PipelineConfig::from_env();
    let sink = PgCategorySink::connect(&config.postgres, config.category_table.clone())
        .await
        .context("connecting category sink")?;
    let ingestor = CategoryIngestor::new(Arc::new(sink), ArtifactStore::new(config.artifacts_dir.clone()));
    Ok(ingestor.replay(artifact).await?)
}

pub async fn migrate_from_env() -> Result<()> {
    let config = PipelineConfig::from_env();
    let pool = config
        .postgres
        .connect(DatabaseTarget::Main, "migrate")
        .await
        .context("connecting to postgres")?;
    sqlx::migrate!("../../migrations")
        .run(&pool)
        .await
        .context("applying migrations")?;
    info!("migrations applied");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use cbf_adapters::{MemoryCategorySink, RemoteCategory, ScriptedTaxonomy};
    use tempfile::tempdir;

    #[tokio::test]
    async fn one_seed_failing_ingest_does_not_block_the_next() {
        let dir = tempdir().expect("tempdir");
        let taxonomy = Arc::new(
            ScriptedTaxonomy::new()
                .with_children("s1", vec![RemoteCategory::new("bad", "Bad", "/Bad", false)])
                .with_children("s2", vec![RemoteCategory::new("ok", "Ok", "/Ok", false)]),
        );
        let sink = Arc::new(MemoryCategorySink::new().rejecting("bad"));
        let crawler = CategoryCrawler::new(taxonomy, CrawlConfig::default());
        let ingestor = CategoryIngestor::new(sink.clone(), ArtifactStore::new(dir.path()));

        let reports = crawl_and_ingest(
            &crawler,
            &ingestor,
            &["s1".to_string(), "s2".to_string()],
            DEFAULT_GEO,
        )
        .await;

        assert!(reports[0].error.is_some());
        assert!(reports[0].artifact.is_some());
        assert_eq!(reports[1].ingest.as_ref().map(|o| o.rows), Some(1));
        assert_eq!(sink.len().await, 1);
        assert!(sink.get("ok", DEFAULT_GEO).await.is_some());
    }

    #[tokio::test]
    async fn abandoned_crawl_is_reported_and_not_ingested() {
        let dir = tempdir().expect("tempdir");
        let taxonomy = Arc::new(
            ScriptedTaxonomy::new()
                .with_unavailable("s1", "http status 401")
                .with_children("s2", vec![RemoteCategory::new("ok", "Ok", "/Ok", false)]),
        );
        let sink = Arc::new(MemoryCategorySink::new());
        let crawler = CategoryCrawler::new(taxonomy, CrawlConfig::default());
        let ingestor = CategoryIngestor::new(sink.clone(), ArtifactStore::new(dir.path()));

        let reports = crawl_and_ingest(
            &crawler,
            &ingestor,
            &["s1".to_string(), "s2".to_string()],
            DEFAULT_GEO,
        )
        .await;

        assert!(reports[0].error.as_deref().unwrap_or_default().contains("401"));
        assert!(reports[0].ingest.is_none());
        assert!(reports[0].artifact.is_none());
        assert!(reports[1].error.is_none());
        assert_eq!(sink.len().await, 1);
    }
}
