//! Category ingestion: persist the raw batch, then upsert it in one transaction.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use cbf_adapters::{AdapterError, CategorySink};
use cbf_core::{CategoryRow, CategoryTable};
use cbf_storage::ArtifactStore;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, warn};

#[derive(Debug, Error)]
pub enum IngestError {
    #[error("category batch artifact: {message}")]
    Artifact { message: String },
    #[error("ingest failed, batch preserved at {}: {source}", .artifact.display())]
    Sink {
        artifact: PathBuf,
        #[source]
        source: AdapterError,
    },
}

impl IngestError {
    /// Artifact to replay once the cause is fixed.
    pub fn artifact(&self) -> Option<&Path> {
        match self {
            IngestError::Sink { artifact, .. } => Some(artifact),
            IngestError::Artifact { .. } => None,
        }
    }
}

/// Raw batch written before any database work; `cbf replay` reads it back.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CategoryBatch {
    pub market: String,
    #[serde(default)]
    pub seed_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub rows: Vec<CategoryRow>,
}

#[derive(Debug, Clone, Serialize)]
pub struct IngestOutcome {
    pub market: String,
    pub rows: usize,
    pub affected: u64,
    pub artifact: String,
}

pub struct CategoryIngestor {
    sink: Arc<dyn CategorySink>,
    artifacts: ArtifactStore,
}

impl CategoryIngestor {
    pub fn new(sink: Arc<dyn CategorySink>, artifacts: ArtifactStore) -> Self {
        Self { sink, artifacts }
    }

    pub async fn ingest(&self, table: &CategoryTable, geo: &str) -> Result<IngestOutcome, IngestError> {
        self.ingest_seed(table, geo, None).await
    }

    pub async fn ingest_seed(
        &self,
        table: &CategoryTable,
        geo: &str,
        seed_id: Option<&str>,
    ) -> Result<IngestOutcome, IngestError> {
        let batch = CategoryBatch {
            market: geo.to_string(),
            seed_id: seed_id.map(ToString::to_string),
            created_at: Utc::now(),
            rows: table.to_rows(geo),
        };
        let artifact = self.persist(&batch).await?;
        self.upsert(&batch, artifact).await
    }

    /// Re-run ingestion from a batch artifact.
    pub async fn replay(&self, artifact: &Path) -> Result<IngestOutcome, IngestError> {
        let batch = load_batch(artifact).await?;
        info!(artifact = %artifact.display(), rows = batch.rows.len(), market = %batch.market, "replaying category batch");
        self.upsert(&batch, artifact.to_path_buf()).await
    }

    async fn persist(&self, batch: &CategoryBatch) -> Result<PathBuf, IngestError> {
        let bytes = serde_json::to_vec_pretty(batch).map_err(|err| IngestError::Artifact {
            message: format!("serializing batch: {err}"),
        })?;
        let stored = self
            .artifacts
            .store_bytes(
                batch.created_at,
                &format!("categories-{}", batch.market),
                "json",
                &bytes,
            )
            .await
            .map_err(|err| IngestError::Artifact {
                message: format!("{err:#}"),
            })?;
        Ok(stored.absolute_path)
    }

    async fn upsert(&self, batch: &CategoryBatch, artifact: PathBuf) -> Result<IngestOutcome, IngestError> {
        match self.sink.upsert_batch(&batch.rows).await {
            Ok(affected) => {
                info!(market = %batch.market, rows = batch.rows.len(), affected, "categories ingested");
                Ok(IngestOutcome {
                    market: batch.market.clone(),
                    rows: batch.rows.len(),
                    affected,
                    artifact: artifact.display().to_string(),
                })
            }
            Err(source) => {
                warn!(
                    market = %batch.market,
                    artifact = %artifact.display(),
                    error = %source,
                    "category ingest rolled back"
                );
                Err(IngestError::Sink { artifact, source })
            }
        }
    }
}

pub async fn load_batch(path: &Path) -> Result<CategoryBatch, IngestError> {
    let text = tokio::fs::read_to_string(path)
        .await
        .map_err(|err| IngestError::Artifact {
            message: format!("reading {}: {err}", path.display()),
        })?;
    serde_json::from_str(&text).map_err(|err| IngestError::Artifact {
        message: format!("parsing {}: {err}", path.display()),
    })
}
