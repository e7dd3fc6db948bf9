//! Backing-store adapters: identifier sources/sinks, the remote taxonomy and the category sink.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use cbf_core::{CategoryNode, CategoryRow, DatabaseTarget, DomainConfig, Identifier, IdentifierSet};
use cbf_storage::{FetchError, FetchRequest, HttpFetcher};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value as JsonValue;
use sqlx::postgres::{PgConnectOptions, PgPoolOptions};
use sqlx::{PgPool, Postgres, QueryBuilder, Row};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

pub const CRATE_NAME: &str = "cbf-adapters";

pub const DEFAULT_CATEGORY_TABLE: &str = "amz.bestsellers";

// Postgres caps a statement at 65535 bind parameters; five per row.
const UPSERT_CHUNK_ROWS: usize = 10_000;

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("domain `{domain}` source unavailable: {reason}")]
    SourceUnavailable { domain: String, reason: String },
    #[error("{store} unavailable for `{scope}`: {message}")]
    BackingStoreUnavailable {
        store: &'static str,
        scope: String,
        message: String,
    },
    #[error("{store} query failed for `{scope}`: {message}")]
    Query {
        store: &'static str,
        scope: String,
        message: String,
    },
    #[error("fetching children of category {node_id}: {source}")]
    TaxonomyFetch {
        node_id: String,
        #[source]
        source: FetchError,
    },
    #[error("malformed taxonomy response for category {node_id}: {message}")]
    MalformedResponse { node_id: String, message: String },
    #[error("upsert into {table} rejected at category {category_id} (market {market}): {message}")]
    IngestConflict {
        table: String,
        market: String,
        category_id: String,
        message: String,
    },
}

#[derive(Clone, Default, PartialEq, Eq)]
pub struct Secret(String);

impl Secret {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Secret(***)")
    }
}

#[async_trait]
pub trait IdentifierSource: Send + Sync {
    async fn source_identifiers(&self, domain: &DomainConfig) -> Result<IdentifierSet, AdapterError>;
}

#[async_trait]
pub trait IdentifierSink: Send + Sync {
    async fn loaded_identifiers(&self, domain: &DomainConfig) -> Result<IdentifierSet, AdapterError>;
}

#[derive(Debug, Clone)]
pub struct PostgresSettings {
    pub host: String,
    pub port: u16,
    pub user: Option<String>,
    pub password: Option<Secret>,
    pub database: Option<String>,
    pub app_database: Option<String>,
}

impl Default for PostgresSettings {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 5432,
            user: None,
            password: None,
            database: None,
            app_database: None,
        }
    }
}

impl PostgresSettings {
    pub fn database_for(&self, target: DatabaseTarget) -> Option<&str> {
        match target {
            DatabaseTarget::Main => self.database.as_deref(),
            DatabaseTarget::App => self.app_database.as_deref(),
        }
    }

    pub fn connect_options(
        &self,
        target: DatabaseTarget,
        scope: &str,
    ) -> Result<PgConnectOptions, AdapterError> {
        let unavailable = |message: &str| AdapterError::BackingStoreUnavailable {
            store: "postgres",
            scope: scope.to_string(),
            message: message.to_string(),
        };
        let user = self.user.as_deref().ok_or_else(|| unavailable("PG_USER is not set"))?;
        let database = self.database_for(target).ok_or_else(|| match target {
            DatabaseTarget::Main => unavailable("PG_DATABASE is not set"),
            DatabaseTarget::App => unavailable("PG_DATABASE_APP is not set"),
        })?;

        let mut options = PgConnectOptions::new()
            .host(&self.host)
            .port(self.port)
            .username(user)
            .database(database);
        if let Some(password) = &self.password {
            options = options.password(password.expose());
        }
        Ok(options)
    }

    pub async fn connect(&self, target: DatabaseTarget, scope: &str) -> Result<PgPool, AdapterError> {
        let options = self.connect_options(target, scope)?;
        PgPoolOptions::new()
            .max_connections(4)
            .acquire_timeout(Duration::from_secs(15))
            .connect_with(options)
            .await
            .map_err(|err| AdapterError::BackingStoreUnavailable {
                store: "postgres",
                scope: scope.to_string(),
                message: err.to_string(),
            })
    }
}

fn classify_sqlx_error(err: sqlx::Error, scope: &str) -> AdapterError {
    match err {
        sqlx::Error::Io(_)
        | sqlx::Error::Tls(_)
        | sqlx::Error::PoolTimedOut
        | sqlx::Error::PoolClosed
        | sqlx::Error::Configuration(_) => AdapterError::BackingStoreUnavailable {
            store: "postgres",
            scope: scope.to_string(),
            message: err.to_string(),
        },
        other => AdapterError::Query {
            store: "postgres",
            scope: scope.to_string(),
            message: other.to_string(),
        },
    }
}

pub struct PgIdentifierSource {
    settings: PostgresSettings,
    pools: Mutex<HashMap<DatabaseTarget, PgPool>>,
}

impl PgIdentifierSource {
    pub fn new(settings: PostgresSettings) -> Self {
        Self {
            settings,
            pools: Mutex::new(HashMap::new()),
        }
    }

    async fn pool_for(&self, target: DatabaseTarget, scope: &str) -> Result<PgPool, AdapterError> {
        let mut pools = self.pools.lock().await;
        if let Some(pool) = pools.get(&target) {
            return Ok(pool.clone());
        }
        let pool = self.settings.connect(target, scope).await?;
        pools.insert(target, pool.clone());
        Ok(pool)
    }
}

#[async_trait]
impl IdentifierSource for PgIdentifierSource {
    async fn source_identifiers(&self, domain: &DomainConfig) -> Result<IdentifierSet, AdapterError> {
        let sql = domain
            .source_query
            .as_deref()
            .ok_or_else(|| AdapterError::SourceUnavailable {
                domain: domain.name.clone(),
                reason: "no source_query configured".to_string(),
            })?;
        let pool = self.pool_for(domain.database, &domain.name).await?;

        let rows = sqlx::query(sql)
            .fetch_all(&pool)
            .await
            .map_err(|err| classify_sqlx_error(err, &domain.name))?;

        let mut values = Vec::with_capacity(rows.len());
        for row in rows {
            let id: Option<String> = row
                .try_get("id")
                .map_err(|err| classify_sqlx_error(err, &domain.name))?;
            values.push(id);
        }
        let (ids, nulls) = non_null_identifiers(values);
        if nulls > 0 {
            warn!(domain = %domain.name, nulls, "source rows without an id dropped");
        }
        debug!(domain = %domain.name, count = ids.len(), "source identifiers fetched");
        Ok(ids)
    }
}

// Null ids can never match; they are dropped and counted.
pub fn non_null_identifiers<I>(values: I) -> (IdentifierSet, usize)
where
    I: IntoIterator<Item = Option<String>>,
{
    let mut nulls = 0usize;
    let ids = values
        .into_iter()
        .filter_map(|value| {
            if value.is_none() {
                nulls += 1;
            }
            value.map(Identifier::new)
        })
        .collect();
    (ids, nulls)
}

#[derive(Debug, Clone, Default)]
pub struct Neo4jSettings {
    pub uri: Option<String>,
    pub user: Option<String>,
    pub password: Option<Secret>,
}

pub struct Neo4jIdentifierSink {
    settings: Neo4jSettings,
    graph: Mutex<Option<neo4rs::Graph>>,
}

impl Neo4jIdentifierSink {
    pub fn new(settings: Neo4jSettings) -> Self {
        Self {
            settings,
            graph: Mutex::new(None),
        }
    }

    async fn graph(&self, scope: &str) -> Result<neo4rs::Graph, AdapterError> {
        let mut slot = self.graph.lock().await;
        if let Some(graph) = slot.as_ref() {
            return Ok(graph.clone());
        }
        let unavailable = |message: String| AdapterError::BackingStoreUnavailable {
            store: "neo4j",
            scope: scope.to_string(),
            message,
        };
        let uri = self
            .settings
            .uri
            .as_deref()
            .ok_or_else(|| unavailable("NEO4J_URI is not set".to_string()))?;
        let user = self.settings.user.as_deref().unwrap_or_default();
        let password = self
            .settings
            .password
            .as_ref()
            .map(Secret::expose)
            .unwrap_or_default();

        let graph = neo4rs::Graph::new(uri, user, password)
            .await
            .map_err(|err| unavailable(err.to_string()))?;
        *slot = Some(graph.clone());
        Ok(graph)
    }
}

#[async_trait]
impl IdentifierSink for Neo4jIdentifierSink {
    async fn loaded_identifiers(&self, domain: &DomainConfig) -> Result<IdentifierSet, AdapterError> {
        let cypher = domain
            .sink_query
            .as_deref()
            .ok_or_else(|| AdapterError::SourceUnavailable {
                domain: domain.name.clone(),
                reason: "no sink_query configured".to_string(),
            })?;
        let graph = self.graph(&domain.name).await?;
        let query_failed = |message: String| AdapterError::Query {
            store: "neo4j",
            scope: domain.name.clone(),
            message,
        };

        let mut stream = graph
            .execute(neo4rs::query(cypher))
            .await
            .map_err(|err| query_failed(err.to_string()))?;
        let mut values = Vec::new();
        while let Some(row) = stream.next().await.map_err(|err| query_failed(err.to_string()))? {
            let id: Option<String> = row
                .get("id")
                .map_err(|err| query_failed(format!("row without string `id`: {err}")))?;
            values.push(id);
        }
        let (ids, nulls) = non_null_identifiers(values);
        debug!(domain = %domain.name, count = ids.len(), nulls, "loaded identifiers fetched");
        Ok(ids)
    }
}

#[derive(Debug, Default, Clone)]
pub struct StaticIdentifiers {
    domains: HashMap<String, Result<IdentifierSet, String>>,
}

impl StaticIdentifiers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_domain<I, S>(mut self, domain: &str, ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<Identifier>,
    {
        self.domains.insert(
            domain.to_string(),
            Ok(ids.into_iter().map(Into::into).collect()),
        );
        self
    }

    /// Make `domain` fail as if its backing store were unreachable.
    pub fn with_unavailable(mut self, domain: &str, message: &str) -> Self {
        self.domains
            .insert(domain.to_string(), Err(message.to_string()));
        self
    }

    fn lookup(&self, domain: &DomainConfig) -> Result<IdentifierSet, AdapterError> {
        match self.domains.get(&domain.name) {
            Some(Ok(ids)) => Ok(ids.clone()),
            Some(Err(message)) => Err(AdapterError::BackingStoreUnavailable {
                store: "static",
                scope: domain.name.clone(),
                message: message.clone(),
            }),
            None => Err(AdapterError::SourceUnavailable {
                domain: domain.name.clone(),
                reason: "domain not configured".to_string(),
            }),
        }
    }
}

#[async_trait]
impl IdentifierSource for StaticIdentifiers {
    async fn source_identifiers(&self, domain: &DomainConfig) -> Result<IdentifierSet, AdapterError> {
        self.lookup(domain)
    }
}

#[async_trait]
impl IdentifierSink for StaticIdentifiers {
    async fn loaded_identifiers(&self, domain: &DomainConfig) -> Result<IdentifierSet, AdapterError> {
        self.lookup(domain)
    }
}

fn string_or_number<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    match JsonValue::deserialize(deserializer)? {
        JsonValue::String(s) => Ok(s),
        JsonValue::Number(n) => Ok(n.to_string()),
        other => Err(serde::de::Error::custom(format!(
            "expected string or number, found {other}"
        ))),
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteCategory {
    #[serde(deserialize_with = "string_or_number")]
    pub category_id: String,
    pub name: String,
    pub category_path: String,
    pub has_child: bool,
}

impl RemoteCategory {
    pub fn new(category_id: &str, name: &str, category_path: &str, has_child: bool) -> Self {
        Self {
            category_id: category_id.to_string(),
            name: name.to_string(),
            category_path: category_path.to_string(),
            has_child,
        }
    }

    pub fn to_node(&self) -> CategoryNode {
        CategoryNode::from_raw_path(
            self.category_id.clone(),
            self.name.clone(),
            &self.category_path,
            self.has_child,
        )
    }
}

pub fn parse_category_payload(node_id: &str, body: &[u8]) -> Result<Vec<RemoteCategory>, AdapterError> {
    serde_json::from_slice(body).map_err(|err| AdapterError::MalformedResponse {
        node_id: node_id.to_string(),
        message: err.to_string(),
    })
}

#[async_trait]
pub trait TaxonomyClient: Send + Sync {
    async fn fetch_children(&self, node_id: &str) -> Result<Vec<RemoteCategory>, AdapterError>;
}

#[derive(Debug, Clone)]
pub struct SellerAppSettings {
    pub base_url: String,
    pub client_id: Option<String>,
    pub token: Option<Secret>,
}

impl Default for SellerAppSettings {
    fn default() -> Self {
        Self {
            base_url: "https://api.sellerapp.com/sellmetricsv2/category_tree".to_string(),
            client_id: None,
            token: None,
        }
    }
}

/// `GET category_tree?key={id}&key_type=id&geo={geo}` with `client-id`/`token` headers.
pub struct SellerAppTaxonomyClient {
    http: Arc<HttpFetcher>,
    run_id: Uuid,
    base_url: String,
    geo: String,
    client_id: String,
    token: Secret,
}

impl SellerAppTaxonomyClient {
    pub fn new(
        http: Arc<HttpFetcher>,
        run_id: Uuid,
        settings: &SellerAppSettings,
        geo: &str,
    ) -> Result<Self, AdapterError> {
        let unavailable = |message: &str| AdapterError::BackingStoreUnavailable {
            store: "sellerapp",
            scope: geo.to_string(),
            message: message.to_string(),
        };
        let client_id = settings
            .client_id
            .clone()
            .ok_or_else(|| unavailable("SELLERAPP_CLIENT_ID is not set"))?;
        let token = settings
            .token
            .clone()
            .ok_or_else(|| unavailable("SELLERAPP_TOKEN is not set"))?;
        Ok(Self {
            http,
            run_id,
            base_url: settings.base_url.clone(),
            geo: geo.to_string(),
            client_id,
            token,
        })
    }

    /// Auth rejections and unreachable hosts fail the whole crawl; anything else fails one node.
    fn fetch_failure(&self, node_id: &str, source: FetchError) -> AdapterError {
        let fatal = match &source {
            FetchError::HttpStatus { status: 401 | 403, .. } => true,
            FetchError::HttpStatus { .. } => false,
            FetchError::Request(err) => err.is_connect(),
        };
        if fatal {
            AdapterError::BackingStoreUnavailable {
                store: "sellerapp",
                scope: self.geo.clone(),
                message: format!("category {node_id}: {source}"),
            }
        } else {
            AdapterError::TaxonomyFetch {
                node_id: node_id.to_string(),
                source,
            }
        }
    }

    fn request_for(&self, node_id: &str) -> FetchRequest {
        FetchRequest::get(&self.base_url)
            .query("key", node_id)
            .query("key_type", "id")
            .query("geo", &self.geo)
            .header("client-id", &self.client_id)
            .header("token", self.token.expose())
    }
}

#[async_trait]
impl TaxonomyClient for SellerAppTaxonomyClient {
    async fn fetch_children(&self, node_id: &str) -> Result<Vec<RemoteCategory>, AdapterError> {
        let response = self
            .http
            .fetch(self.run_id, "sellerapp", &self.request_for(node_id))
            .await
            .map_err(|source| self.fetch_failure(node_id, source))?;
        debug!(
            node_id,
            status = response.status.as_u16(),
            url = %response.final_url,
            bytes = response.body.len(),
            "category children fetched"
        );
        parse_category_payload(node_id, &response.body)
    }
}

/// Canned taxonomy for offline runs and tests. Unknown nodes have no children.
#[derive(Debug, Clone)]
enum ScriptedReply {
    Children(Vec<RemoteCategory>),
    Malformed(String),
    Unavailable(String),
}

#[derive(Debug, Default)]
pub struct ScriptedTaxonomy {
    children: HashMap<String, ScriptedReply>,
    calls: std::sync::Mutex<Vec<String>>,
}

impl ScriptedTaxonomy {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_children(mut self, node_id: &str, children: Vec<RemoteCategory>) -> Self {
        self.children
            .insert(node_id.to_string(), ScriptedReply::Children(children));
        self
    }

    pub fn with_failure(mut self, node_id: &str, message: &str) -> Self {
        self.children
            .insert(node_id.to_string(), ScriptedReply::Malformed(message.to_string()));
        self
    }

    /// Fetching `node_id` fails as if the API rejected the credentials.
    pub fn with_unavailable(mut self, node_id: &str, message: &str) -> Self {
        self.children
            .insert(node_id.to_string(), ScriptedReply::Unavailable(message.to_string()));
        self
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls
            .lock()
            .map(|calls| calls.clone())
            .unwrap_or_default()
    }
}

#[async_trait]
impl TaxonomyClient for ScriptedTaxonomy {
    async fn fetch_children(&self, node_id: &str) -> Result<Vec<RemoteCategory>, AdapterError> {
        if let Ok(mut calls) = self.calls.lock() {
            calls.push(node_id.to_string());
        }
        match self.children.get(node_id) {
            Some(ScriptedReply::Children(children)) => Ok(children.clone()),
            Some(ScriptedReply::Malformed(message)) => Err(AdapterError::MalformedResponse {
                node_id: node_id.to_string(),
                message: message.clone(),
            }),
            Some(ScriptedReply::Unavailable(message)) => Err(AdapterError::BackingStoreUnavailable {
                store: "scripted",
                scope: node_id.to_string(),
                message: message.clone(),
            }),
            None => Ok(Vec::new()),
        }
    }
}

/// Relational target for category rows, keyed by `(category_id, market)`.
///
/// `upsert_batch` is all-or-nothing: on error no row of the batch is kept.
#[async_trait]
pub trait CategorySink: Send + Sync {
    async fn upsert_batch(&self, rows: &[CategoryRow]) -> Result<u64, AdapterError>;
}

pub struct PgCategorySink {
    pool: PgPool,
    table: String,
}

impl PgCategorySink {
    pub fn new(pool: PgPool, table: impl Into<String>) -> Self {
        Self {
            pool,
            table: table.into(),
        }
    }

    pub async fn connect(settings: &PostgresSettings, table: impl Into<String>) -> Result<Self, AdapterError> {
        let pool = settings.connect(DatabaseTarget::Main, "category-sink").await?;
        Ok(Self::new(pool, table))
    }

    fn conflict(&self, chunk: &[CategoryRow], offset: usize, err: sqlx::Error) -> AdapterError {
        let first = chunk.first();
        AdapterError::IngestConflict {
            table: self.table.clone(),
            market: first.map(|r| r.market.clone()).unwrap_or_default(),
            category_id: first.map(|r| r.category_id.clone()).unwrap_or_default(),
            message: format!("batch rows {}..{}: {err}", offset, offset + chunk.len()),
        }
    }
}

#[async_trait]
impl CategorySink for PgCategorySink {
    async fn upsert_batch(&self, rows: &[CategoryRow]) -> Result<u64, AdapterError> {
        if rows.is_empty() {
            return Ok(0);
        }
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|err| classify_sqlx_error(err, &self.table))?;

        let mut affected = 0u64;
        for (index, chunk) in rows.chunks(UPSERT_CHUNK_ROWS).enumerate() {
            let mut builder: QueryBuilder<Postgres> = QueryBuilder::new(format!(
                "INSERT INTO {} (category_id, market, category, category_path, url) ",
                self.table
            ));
            builder.push_values(chunk, |mut b, row| {
                b.push_bind(row.category_id.clone())
                    .push_bind(row.market.clone())
                    .push_bind(row.category.clone())
                    .push_bind(row.category_path_json())
                    .push_bind(row.url.clone());
            });
            builder.push(
                " ON CONFLICT (category_id, market) DO UPDATE \
                 SET category = EXCLUDED.category, \
                     category_path = EXCLUDED.category_path, \
                     updated_at = NOW()",
            );

            match builder.build().execute(&mut *tx).await {
                Ok(result) => affected += result.rows_affected(),
                Err(err) => {
                    let conflict = self.conflict(chunk, index * UPSERT_CHUNK_ROWS, err);
                    let _ = tx.rollback().await;
                    return Err(conflict);
                }
            }
        }

        tx.commit()
            .await
            .map_err(|err| classify_sqlx_error(err, &self.table))?;
        info!(table = %self.table, rows = rows.len(), affected, "category batch upserted");
        Ok(affected)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredCategoryRow {
    pub row: CategoryRow,
    pub updated_at: DateTime<Utc>,
    pub writes: u32,
}

#[derive(Debug, Default)]
pub struct MemoryCategorySink {
    rows: Mutex<BTreeMap<(String, String), StoredCategoryRow>>,
    rejected_ids: HashSet<String>,
}

impl MemoryCategorySink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Any batch containing `category_id` fails with `IngestConflict`.
    pub fn rejecting(mut self, category_id: &str) -> Self {
        self.rejected_ids.insert(category_id.to_string());
        self
    }

    pub async fn seed(&self, row: CategoryRow) {
        let key = (row.category_id.clone(), row.market.clone());
        self.rows.lock().await.insert(
            key,
            StoredCategoryRow {
                row,
                updated_at: Utc::now(),
                writes: 1,
            },
        );
    }

    pub async fn len(&self) -> usize {
        self.rows.lock().await.len()
    }

    pub async fn get(&self, category_id: &str, market: &str) -> Option<StoredCategoryRow> {
        self.rows
            .lock()
            .await
            .get(&(category_id.to_string(), market.to_string()))
            .cloned()
    }
}

#[async_trait]
impl CategorySink for MemoryCategorySink {
    async fn upsert_batch(&self, rows: &[CategoryRow]) -> Result<u64, AdapterError> {
        let mut committed = self.rows.lock().await;
        let mut staged = committed.clone();
        let now = Utc::now();

        for row in rows {
            if self.rejected_ids.contains(&row.category_id) {
                return Err(AdapterError::IngestConflict {
                    table: "memory".to_string(),
                    market: row.market.clone(),
                    category_id: row.category_id.clone(),
                    message: "rejected by sink".to_string(),
                });
            }
            let key = (row.category_id.clone(), row.market.clone());
            match staged.get_mut(&key) {
                Some(existing) => {
                    existing.row.category = row.category.clone();
                    existing.row.category_path = row.category_path.clone();
                    existing.updated_at = now;
                    existing.writes += 1;
                }
                None => {
                    staged.insert(
                        key,
                        StoredCategoryRow {
                            row: row.clone(),
                            updated_at: now,
                            writes: 1,
                        },
                    );
                }
            }
        }

        *committed = staged;
        Ok(rows.len() as u64)
    }
}
