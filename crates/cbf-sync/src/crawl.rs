//! Category tree crawler with an explicit frontier.

use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use cbf_adapters::{AdapterError, TaxonomyClient};
use cbf_core::CategoryTable;
use serde::Serialize;
use tracing::{debug, error, info, instrument, warn};

#[derive(Debug, Clone)]
pub struct CrawlConfig {
    /// Frontier nodes fetched at once.
    pub concurrency: usize,
    /// Stop recording once the table holds this many nodes. `None` = unbounded.
    pub max_nodes: Option<usize>,
    /// Deepest level recorded below the seed (seed children are depth 1). `None` = unbounded.
    pub max_depth: Option<usize>,
}

impl Default for CrawlConfig {
    fn default() -> Self {
        Self {
            concurrency: 4,
            max_nodes: None,
            max_depth: None,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct NodeFailure {
    pub node_id: String,
    pub depth: usize,
    pub error: String,
}

#[derive(Debug, Clone)]
pub struct CrawlReport {
    pub seed_id: String,
    pub table: CategoryTable,
    pub fetched: usize,
    pub duplicates_skipped: usize,
    pub failures: Vec<NodeFailure>,
    /// A safety bound left part of the tree unexplored.
    pub truncated: bool,
    /// Set when the taxonomy API itself became unusable; the table is partial.
    pub aborted: Option<String>,
    pub duration: Duration,
}

pub struct CategoryCrawler {
    client: Arc<dyn TaxonomyClient>,
    config: CrawlConfig,
}

impl CategoryCrawler {
    pub fn new(client: Arc<dyn TaxonomyClient>, config: CrawlConfig) -> Self {
        Self { client, config }
    }

    /// Walk the hierarchy below `seed_id` breadth-first.
    ///
    /// A node is recorded the first time its id is seen and expanded at most once.
    /// A failed fetch abandons that node's subtree only.
    #[instrument(skip(self), fields(concurrency = self.config.concurrency))]
    pub async fn crawl(&self, seed_id: &str) -> CrawlReport {
        let started = Instant::now();
        if self.config.max_nodes.is_none() && self.config.max_depth.is_none() {
            debug!("crawl is unbounded; set a node or depth limit to cap it");
        }

        let mut table = CategoryTable::new();
        let mut frontier: VecDeque<(String, usize)> = VecDeque::from([(seed_id.to_string(), 0)]);
        let mut expanded: HashSet<String> = HashSet::from([seed_id.to_string()]);
        let mut failures = Vec::new();
        let mut fetched = 0usize;
        let mut duplicates_skipped = 0usize;
        let mut truncated = false;
        let mut aborted = None;

        'crawl: while !frontier.is_empty() {
            let take = frontier.len().min(self.config.concurrency.max(1));
            let batch: Vec<(String, usize)> = frontier.drain(..take).collect();

            let handles: Vec<_> = batch
                .into_iter()
                .map(|(node_id, depth)| {
                    let client = Arc::clone(&self.client);
                    let id = node_id.clone();
                    let handle = tokio::spawn(async move { client.fetch_children(&id).await });
                    (node_id, depth, handle)
                })
                .collect();

            // Results are merged in frontier order so first-write-wins is deterministic.
            for (node_id, depth, handle) in handles {
                fetched += 1;
                let children = match handle.await {
                    Ok(Ok(children)) => children,
                    Ok(Err(err @ AdapterError::BackingStoreUnavailable { .. })) => {
                        error!(node_id = %node_id, depth, error = %err, "taxonomy unavailable; abandoning crawl");
                        aborted = Some(err.to_string());
                        break 'crawl;
                    }
                    Ok(Err(err)) => {
                        warn!(node_id = %node_id, depth, error = %err, "fetch failed; skipping subtree");
                        failures.push(NodeFailure {
                            node_id,
                            depth,
                            error: err.to_string(),
                        });
                        continue;
                    }
                    Err(join_err) => {
                        warn!(node_id = %node_id, depth, error = %join_err, "fetch task aborted; skipping subtree");
                        failures.push(NodeFailure {
                            node_id,
                            depth,
                            error: join_err.to_string(),
                        });
                        continue;
                    }
                };

                let child_depth = depth + 1;
                for child in children {
                    let node = child.to_node();
                    let id = node.category_id.clone();
                    let has_children = node.has_children;
                    if table.contains(&id) {
                        duplicates_skipped += 1;
                        continue;
                    }
                    if self
                        .config
                        .max_nodes
                        .is_some_and(|max| table.len() >= max)
                    {
                        warn!(max_nodes = table.len(), "node limit reached; stopping crawl");
                        truncated = true;
                        break 'crawl;
                    }
                    table.insert(node);
                    if !has_children || expanded.contains(&id) {
                        continue;
                    }
                    if self.config.max_depth.is_some_and(|max| child_depth >= max) {
                        truncated = true;
                        continue;
                    }
                    expanded.insert(id.clone());
                    frontier.push_back((id, child_depth));
                }
            }
        }

        if truncated {
            warn!(
                seed_id,
                nodes = table.len(),
                unexplored = frontier.len(),
                "crawl stopped by safety bound"
            );
        }
        info!(
            seed_id,
            nodes = table.len(),
            fetched,
            failures = failures.len(),
            duplicates_skipped,
            "crawl finished"
        );

        CrawlReport {
            seed_id: seed_id.to_string(),
            table,
            fetched,
            duplicates_skipped,
            failures,
            truncated,
            aborted,
            duration: started.elapsed(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cbf_adapters::{RemoteCategory, ScriptedTaxonomy};

    fn cat(id: &str, path: &str, has_child: bool) -> RemoteCategory {
        let name = path.rsplit('/').next().unwrap_or(path);
        RemoteCategory::new(id, name, path, has_child)
    }

    fn sequential() -> CrawlConfig {
        CrawlConfig {
            concurrency: 1,
            ..Default::default()
        }
    }

    fn assert_leaf_matches_name(table: &CategoryTable) {
        for node in table.iter() {
            assert_eq!(node.leaf_segment(), Some(node.name.as_str()), "node {}", node.category_id);
        }
    }

    #[tokio::test]
    async fn crawls_tree_and_stops_on_cycle() {
        let taxonomy = Arc::new(
            ScriptedTaxonomy::new()
                .with_children("seed", vec![cat("1", "/A", true), cat("2", "/B", false)])
                .with_children("1", vec![cat("3", "/A/C", true)])
                .with_children("3", vec![cat("1", "/A", true)]),
        );
        let crawler = CategoryCrawler::new(taxonomy.clone(), sequential());

        let report = crawler.crawl("seed").await;

        assert_eq!(report.table.ids(), vec!["1", "2", "3"]);
        assert_eq!(report.duplicates_skipped, 1);
        assert!(report.failures.is_empty());
        assert!(!report.truncated);
        assert_eq!(taxonomy.calls(), vec!["seed", "1", "3"]);
        assert_leaf_matches_name(&report.table);
    }

    #[tokio::test]
    async fn node_reachable_from_two_parents_is_recorded_and_expanded_once() {
        let taxonomy = Arc::new(
            ScriptedTaxonomy::new()
                .with_children("seed", vec![cat("a", "/A", true), cat("b", "/B", true)])
                .with_children("a", vec![cat("shared", "/A/Shared", true)])
                .with_children("b", vec![cat("shared", "/B/Shared", true)])
                .with_children("shared", vec![cat("leaf", "/A/Shared/Leaf", false)]),
        );
        let report = CategoryCrawler::new(taxonomy.clone(), sequential())
            .crawl("seed")
            .await;

        assert_eq!(report.table.ids(), vec!["a", "b", "shared", "leaf"]);
        assert_eq!(
            report.table.get("shared").map(|n| n.path.clone()),
            Some(vec!["A".to_string(), "Shared".to_string()])
        );
        let shared_fetches = taxonomy.calls().iter().filter(|c| *c == "shared").count();
        assert_eq!(shared_fetches, 1);
    }

    #[tokio::test]
    async fn failed_node_drops_only_its_subtree() {
        let taxonomy = Arc::new(
            ScriptedTaxonomy::new()
                .with_children("seed", vec![cat("x", "/X", true), cat("y", "/Y", true)])
                .with_failure("x", "expected array")
                .with_children("y", vec![cat("y1", "/Y/Y1", true)])
                .with_children("y1", vec![cat("y2", "/Y/Y1/Y2", false)]),
        );
        let report = CategoryCrawler::new(taxonomy, CrawlConfig::default())
            .crawl("seed")
            .await;

        assert_eq!(report.table.ids(), vec!["x", "y", "y1", "y2"]);
        assert_eq!(report.failures.len(), 1);
        assert_eq!(report.failures[0].node_id, "x");
        assert_eq!(report.failures[0].depth, 1);
    }

    #[tokio::test]
    async fn failed_seed_yields_empty_table() {
        let taxonomy = Arc::new(ScriptedTaxonomy::new().with_failure("seed", "timeout"));
        let report = CategoryCrawler::new(taxonomy, sequential()).crawl("seed").await;
        assert!(report.table.is_empty());
        assert_eq!(report.fetched, 1);
        assert_eq!(report.failures.len(), 1);
    }

    #[tokio::test]
    async fn unavailable_taxonomy_aborts_the_crawl() {
        let taxonomy = Arc::new(
            ScriptedTaxonomy::new()
                .with_children("seed", vec![cat("1", "/A", true), cat("2", "/B", true)])
                .with_unavailable("1", "http status 401")
                .with_children("2", vec![cat("3", "/B/C", false)]),
        );
        let report = CategoryCrawler::new(taxonomy.clone(), sequential())
            .crawl("seed")
            .await;

        assert!(report.aborted.as_deref().unwrap_or_default().contains("401"));
        assert!(report.failures.is_empty());
        assert_eq!(taxonomy.calls(), vec!["seed", "1"]);
    }

    #[tokio::test]
    async fn full_table_with_only_known_children_is_not_truncated() {
        let taxonomy = Arc::new(
            ScriptedTaxonomy::new()
                .with_children("seed", vec![cat("1", "/A", true), cat("2", "/B", false)])
                .with_children("1", vec![cat("2", "/A/B", false)]),
        );
        let config = CrawlConfig {
            concurrency: 1,
            max_depth: None,
            max_nodes: Some(2),
        };
        let report = CategoryCrawler::new(taxonomy, config).crawl("seed").await;
        assert_eq!(report.table.ids(), vec!["1", "2"]);
        assert_eq!(report.duplicates_skipped, 1);
        assert!(!report.truncated);
    }

    #[tokio::test]
    async fn child_pointing_back_at_seed_is_recorded_but_not_refetched() {
        let taxonomy = Arc::new(
            ScriptedTaxonomy::new()
                .with_children("seed", vec![cat("1", "/A", true)])
                .with_children("1", vec![cat("seed", "/Root", true)]),
        );
        let report = CategoryCrawler::new(taxonomy.clone(), sequential())
            .crawl("seed")
            .await;
        assert_eq!(report.table.ids(), vec!["1", "seed"]);
        assert_eq!(taxonomy.calls(), vec!["seed", "1"]);
    }

    #[tokio::test]
    async fn depth_bound_truncates_crawl() {
        let taxonomy = Arc::new(
            ScriptedTaxonomy::new()
                .with_children("seed", vec![cat("1", "/A", true)])
                .with_children("1", vec![cat("2", "/A/B", true)])
                .with_children("2", vec![cat("3", "/A/B/C", false)]),
        );
        let config = CrawlConfig {
            concurrency: 1,
            max_depth: Some(2),
            max_nodes: None,
        };
        let report = CategoryCrawler::new(taxonomy.clone(), config).crawl("seed").await;
        assert_eq!(report.table.ids(), vec!["1", "2"]);
        assert!(report.truncated);
        assert_eq!(taxonomy.calls(), vec!["seed", "1"]);
    }

    #[tokio::test]
    async fn node_bound_truncates_crawl() {
        let taxonomy = Arc::new(ScriptedTaxonomy::new().with_children(
            "seed",
            vec![cat("1", "/A", false), cat("2", "/B", false), cat("3", "/C", false)],
        ));
        let config = CrawlConfig {
            concurrency: 1,
            max_depth: None,
            max_nodes: Some(2),
        };
        let report = CategoryCrawler::new(taxonomy, config).crawl("seed").await;
        assert_eq!(report.table.ids(), vec!["1", "2"]);
        assert!(report.truncated);
    }

    #[tokio::test]
    async fn concurrent_siblings_keep_frontier_order() {
        let taxonomy = Arc::new(
            ScriptedTaxonomy::new()
                .with_children(
                    "seed",
                    vec![cat("a", "/A", true), cat("b", "/B", true), cat("c", "/C", true)],
                )
                .with_children("a", vec![cat("dup", "/A/Dup", false)])
                .with_children("b", vec![cat("dup", "/B/Dup", false)])
                .with_children("c", vec![cat("c1", "/C/C1", false)]),
        );
        let config = CrawlConfig {
            concurrency: 8,
            ..Default::default()
        };
        let report = CategoryCrawler::new(taxonomy, config).crawl("seed").await;
        assert_eq!(report.table.ids(), vec!["a", "b", "c", "dup", "c1"]);
        assert_eq!(report.table.get("dup").map(|n| n.path[0].as_str()), Some("A"));
    }
}
