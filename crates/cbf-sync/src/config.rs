//! Process configuration and the domain registry.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use cbf_adapters::{Neo4jSettings, PostgresSettings, Secret, SellerAppSettings, DEFAULT_CATEGORY_TABLE};
use cbf_core::DomainConfig;
use cbf_storage::{BackoffPolicy, HttpClientConfig, TokenBucketConfig};
use serde::Deserialize;

use crate::crawl::CrawlConfig;

pub const ALL_DOMAINS: &str = "all";

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub postgres: PostgresSettings,
    pub neo4j: Neo4jSettings,
    pub sellerapp: SellerAppSettings,
    pub workspace_root: PathBuf,
    pub data_dir: PathBuf,
    pub artifacts_dir: PathBuf,
    pub category_table: String,
    pub user_agent: String,
    pub http_timeout_secs: u64,
    pub http_max_retries: usize,
    pub http_requests_per_sec: Option<u32>,
    pub crawl: CrawlConfig,
}

impl PipelineConfig {
    pub fn from_env() -> Self {
        Self::from_vars(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary key lookup; blank values count as unset.
    pub fn from_vars(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        let parse_usize = |key: &str| get(key).and_then(|v| v.trim().parse::<usize>().ok());
        let workspace_root = get("CBF_WORKSPACE_ROOT")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("."));

        let crawl_defaults = CrawlConfig::default();
        Self {
            postgres: PostgresSettings {
                host: get("PG_HOST").unwrap_or_else(|| "localhost".to_string()),
                port: get("PG_PORT").and_then(|v| v.parse().ok()).unwrap_or(5432),
                user: get("PG_USER"),
                password: get("PG_PASSWORD").map(Secret::new),
                database: get("PG_DATABASE"),
                app_database: get("PG_DATABASE_APP"),
            },
            neo4j: Neo4jSettings {
                uri: get("NEO4J_URI"),
                user: get("NEO4J_USER"),
                password: get("NEO4J_PASSWORD").map(Secret::new),
            },
            sellerapp: SellerAppSettings {
                base_url: get("SELLERAPP_BASE_URL")
                    .unwrap_or_else(|| SellerAppSettings::default().base_url),
                client_id: get("SELLERAPP_CLIENT_ID"),
                token: get("SELLERAPP_TOKEN").map(Secret::new),
            },
            data_dir: get("CBF_DATA_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|| workspace_root.join("data")),
            artifacts_dir: get("CBF_ARTIFACTS_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|| workspace_root.join("artifacts")),
            workspace_root,
            category_table: get("CBF_CATEGORY_TABLE")
                .unwrap_or_else(|| DEFAULT_CATEGORY_TABLE.to_string()),
            user_agent: get("CBF_USER_AGENT").unwrap_or_else(|| "cbf-bot/0.1".to_string()),
            http_timeout_secs: get("CBF_HTTP_TIMEOUT_SECS")
                .and_then(|v| v.parse().ok())
                .unwrap_or(20),
            http_max_retries: parse_usize("CBF_HTTP_MAX_RETRIES").unwrap_or(0),
            http_requests_per_sec: get("CBF_HTTP_REQUESTS_PER_SEC")
                .and_then(|v| v.parse().ok())
                .filter(|n| *n > 0),
            crawl: CrawlConfig {
                concurrency: parse_usize("CBF_CRAWL_CONCURRENCY")
                    .unwrap_or(crawl_defaults.concurrency)
                    .max(1),
                max_nodes: parse_usize("CBF_CRAWL_MAX_NODES"),
                max_depth: parse_usize("CBF_CRAWL_MAX_DEPTH"),
            },
        }
    }

    pub fn http_client_config(&self) -> HttpClientConfig {
        HttpClientConfig {
            timeout: Duration::from_secs(self.http_timeout_secs),
            user_agent: Some(self.user_agent.clone()),
            per_scope_concurrency: self.crawl.concurrency,
            backoff: BackoffPolicy {
                max_retries: self.http_max_retries,
                ..Default::default()
            },
            token_bucket: self.http_requests_per_sec.map(|per_sec| TokenBucketConfig {
                capacity: per_sec,
                refill_every: Duration::from_millis(1000 / u64::from(per_sec)).max(Duration::from_millis(1)),
            }),
            ..Default::default()
        }
    }

    pub fn registry_path(&self) -> PathBuf {
        self.workspace_root.join("domains.yaml")
    }

    pub fn reports_dir(&self) -> PathBuf {
        self.workspace_root.join("reports")
    }
}

/// Statically enumerated domains, loaded from `domains.yaml`.
#[derive(Debug, Clone, Deserialize)]
pub struct DomainRegistry {
    pub domains: Vec<DomainConfig>,
}

impl DomainRegistry {
    pub fn from_yaml(text: &str) -> Result<Self> {
        let registry: DomainRegistry = serde_yaml::from_str(text).context("parsing domain registry")?;
        let mut seen = std::collections::HashSet::new();
        for domain in &registry.domains {
            if domain.name == ALL_DOMAINS {
                bail!("`{ALL_DOMAINS}` is reserved and cannot name a domain");
            }
            if !seen.insert(domain.name.as_str()) {
                bail!("domain `{}` is declared twice", domain.name);
            }
        }
        Ok(registry)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
        Self::from_yaml(&text).with_context(|| format!("loading {}", path.display()))
    }

    pub fn names(&self) -> Vec<&str> {
        self.domains.iter().map(|d| d.name.as_str()).collect()
    }

    /// `all` picks every enabled domain; any other value must name one domain.
    pub fn select(&self, selector: &str) -> Result<Vec<DomainConfig>> {
        if selector == ALL_DOMAINS {
            return Ok(self.domains.iter().filter(|d| d.enabled).cloned().collect());
        }
        match self.domains.iter().find(|d| d.name == selector) {
            Some(domain) => Ok(vec![domain.clone()]),
            None => bail!(
                "unknown domain `{selector}` (expected one of: {}, {ALL_DOMAINS})",
                self.names().join(", ")
            ),
        }
    }
}
