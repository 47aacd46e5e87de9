//! Pattern router: request text -> workflow and its executor set
//!
//! Matching order:
//! 1. keyword patterns of the static seed table (best hit count, ties go
//!    to the earlier seed)
//! 2. learned routes recorded for the same normalized query
//! 3. nearest learned route by embedding, above the route threshold
//!
//! Usage counts are written back on every match. Store errors skip the
//! learned tiers and never fail the caller.

pub mod fallback;

pub use fallback::{FallbackDecision, FallbackSelector};

use crate::cache::keys::{content_hash, normalize_text};
use crate::config::EngineConfig;
use crate::models::Route;
use crate::store::{KeyValueStore, Namespace};
use crate::workflows::{ADVISOR, EQUITY_ANALYSIS, QUOTE, RESEARCH};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

pub const SEED_SOURCE: &str = "seed";
pub const FALLBACK_SOURCE: &str = "fallback";

const LEARNED_PREFIX: &str = "learned:";

struct SeedRoute {
    route_id: &'static str,
    workflow_id: &'static str,
    executors: &'static [&'static str],
    patterns: &'static [&'static str],
}

const SEED_TABLE: &[SeedRoute] = &[
    SeedRoute {
        route_id: "quote",
        workflow_id: QUOTE,
        executors: &["price_snapshot"],
        patterns: &["price of", "quote", "trading at", "current price", "stock price"],
    },
    SeedRoute {
        route_id: "equity_analysis",
        workflow_id: EQUITY_ANALYSIS,
        executors: &["price_history", "sentiment", "fundamentals", "risk_metrics"],
        patterns: &["analyze", "analysis", "full report", "deep dive"],
    },
    SeedRoute {
        route_id: "research",
        workflow_id: RESEARCH,
        executors: &["news_research", "fundamentals", "synthesis"],
        patterns: &["research", "news on", "latest news", "what happened", "compare"],
    },
    SeedRoute {
        route_id: "advisor",
        workflow_id: ADVISOR,
        executors: &["triage", "risk_metrics", "sentiment", "synthesis"],
        patterns: &["should i", "advice", "recommend", "buy or sell"],
    },
];

/// How a route was matched
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchKind {
    Pattern,
    LearnedExact,
    Similarity,
}

#[derive(Debug, Clone)]
pub struct RouteMatch {
    pub route: Route,
    pub matched_by: MatchKind,
    pub similarity: Option<f32>,
}

pub struct PatternRouter {
    store: Arc<dyn KeyValueStore>,
    seeds: Vec<Route>,
    similarity_threshold: f32,
    route_ttl: Option<Duration>,
}

impl PatternRouter {
    pub fn new(store: Arc<dyn KeyValueStore>, config: &EngineConfig) -> Self {
        let now = Utc::now();
        let seeds = SEED_TABLE
            .iter()
            .map(|seed| Route {
                route_id: seed.route_id.to_string(),
                trigger_patterns: seed.patterns.iter().map(|p| p.to_string()).collect(),
                workflow_id: seed.workflow_id.to_string(),
                required_task_executors: seed.executors.iter().map(|e| e.to_string()).collect(),
                usage_count: 0,
                source: SEED_SOURCE.to_string(),
                embedding: None,
                created_at: now,
            })
            .collect();

        Self {
            store,
            seeds,
            similarity_threshold: config.route_similarity_threshold,
            route_ttl: config.route_ttl,
        }
    }

    fn route_key(route_id: &str) -> String {
        Namespace::Route.key(route_id)
    }

    fn learned_key(query: &str) -> String {
        Namespace::Route.key(&format!(
            "{}{}",
            LEARNED_PREFIX,
            content_hash(&normalize_text(query))
        ))
    }

    /// Persist seed routes that are not yet in the store
    pub async fn seed_routes(&self) -> usize {
        let mut written = 0;
        for seed in &self.seeds {
            let key = Self::route_key(&seed.route_id);
            match self.store.get(&key).await {
                Ok(Some(_)) => continue,
                Ok(None) => {}
                Err(e) => {
                    warn!(error = %e, "Route store unavailable, seeds stay in memory");
                    return written;
                }
            }

            if let Ok(value) = serde_json::to_value(seed) {
                match self.store.set(&key, value, None).await {
                    Ok(()) => written += 1,
                    Err(e) => warn!(route_id = %seed.route_id, error = %e, "Failed to seed route"),
                }
            }
        }

        info!(seeded = written, "Seed routes initialised");
        written
    }

    pub async fn find_route(&self, query: &str, embedding: Option<&[f32]>) -> Option<RouteMatch> {
        let found = if let Some(seed) = self.match_seed(query) {
            Some(RouteMatch {
                route: seed.clone(),
                matched_by: MatchKind::Pattern,
                similarity: None,
            })
        } else if let Some(route) = self.match_learned_exact(query).await {
            Some(RouteMatch {
                route,
                matched_by: MatchKind::LearnedExact,
                similarity: None,
            })
        } else {
            match embedding {
                Some(embedding) => self.match_similar(embedding).await,
                None => None,
            }
        };

        let mut found = found?;
        found.route.usage_count = self.bump_usage(&found.route).await;

        debug!(
            route_id = %found.route.route_id,
            workflow_id = %found.route.workflow_id,
            matched_by = ?found.matched_by,
            usage_count = found.route.usage_count,
            "Route matched"
        );
        Some(found)
    }

    fn match_seed(&self, query: &str) -> Option<&Route> {
        let text = normalize_text(query);
        let tokens = word_tokens(&text);

        let mut best: Option<(&Route, usize)> = None;
        for seed in &self.seeds {
            let hits = seed
                .trigger_patterns
                .iter()
                .filter(|p| contains_phrase(&tokens, p))
                .count();
            if hits > 0 && best.map_or(true, |(_, top)| hits > top) {
                best = Some((seed, hits));
            }
        }

        best.map(|(route, _)| route)
    }

    async fn match_learned_exact(&self, query: &str) -> Option<Route> {
        match self.store.get(&Self::learned_key(query)).await {
            Ok(Some(value)) => serde_json::from_value(value).ok(),
            Ok(None) => None,
            Err(e) => {
                warn!(error = %e, "Route store unavailable, skipping learned routes");
                None
            }
        }
    }

    async fn match_similar(&self, embedding: &[f32]) -> Option<RouteMatch> {
        let prefix = Namespace::Route.key(LEARNED_PREFIX);
        let best = match self.store.nearest(&prefix, embedding, 1).await {
            Ok(mut matches) => matches.pop()?,
            Err(e) => {
                warn!(error = %e, "Route similarity lookup failed");
                return None;
            }
        };

        let similarity = best.similarity();
        if similarity < self.similarity_threshold {
            debug!(similarity, "Nearest learned route below threshold");
            return None;
        }

        let route: Route = serde_json::from_value(best.value).ok()?;
        Some(RouteMatch {
            route,
            matched_by: MatchKind::Similarity,
            similarity: Some(similarity),
        })
    }

    /// Read-modify-write of the persisted usage count; best effort
    async fn bump_usage(&self, matched: &Route) -> u64 {
        let key = if matched.is_seed() {
            Self::route_key(&matched.route_id)
        } else {
            match matched.trigger_patterns.first() {
                Some(query) => Self::learned_key(query),
                None => Self::route_key(&matched.route_id),
            }
        };

        let mut route = match self.store.get(&key).await {
            Ok(Some(value)) => serde_json::from_value::<Route>(value).unwrap_or_else(|_| matched.clone()),
            Ok(None) => matched.clone(),
            Err(e) => {
                warn!(error = %e, "Route usage not persisted");
                return matched.usage_count + 1;
            }
        };
        route.usage_count += 1;

        if let Err(e) = self.persist(&key, &route).await {
            warn!(route_id = %route.route_id, error = %e, "Route usage not persisted");
        }
        route.usage_count
    }

    async fn persist(&self, key: &str, route: &Route) -> crate::Result<()> {
        let value = serde_json::to_value(route)?;
        match &route.embedding {
            Some(embedding) => {
                self.store
                    .upsert_vector(key, embedding.clone(), value, self.route_ttl)
                    .await
            }
            None => self.store.set(key, value, self.route_ttl).await,
        }
    }

    /// Learn a routing decision so the same (or a near-identical) query
    /// routes directly next time
    pub async fn record_route(
        &self,
        query: &str,
        embedding: Option<&[f32]>,
        route_id: &str,
        workflow_id: &str,
        task_executors: &[String],
        source: &str,
    ) -> Route {
        let route = Route {
            route_id: route_id.to_string(),
            trigger_patterns: vec![normalize_text(query)],
            workflow_id: workflow_id.to_string(),
            required_task_executors: task_executors.to_vec(),
            usage_count: 0,
            source: source.to_string(),
            embedding: embedding.map(<[f32]>::to_vec),
            created_at: Utc::now(),
        };

        match self.persist(&Self::learned_key(query), &route).await {
            Ok(()) => info!(route_id, workflow_id, source, "Route recorded"),
            Err(e) => warn!(route_id, error = %e, "Failed to record route"),
        }

        route
    }

    /// Seeds (with persisted usage counts) followed by learned routes
    pub async fn list_routes(&self) -> Vec<Route> {
        let mut stored: HashMap<String, Route> = HashMap::new();
        match self.store.keys(&Namespace::Route.pattern()).await {
            Ok(keys) => {
                for key in keys {
                    if let Ok(Some(value)) = self.store.get(&key).await {
                        if let Ok(route) = serde_json::from_value::<Route>(value) {
                            stored.insert(key, route);
                        }
                    }
                }
            }
            Err(e) => warn!(error = %e, "Route store unavailable, listing seeds only"),
        }

        let mut routes: Vec<Route> = self
            .seeds
            .iter()
            .map(|seed| {
                stored
                    .remove(&Self::route_key(&seed.route_id))
                    .unwrap_or_else(|| seed.clone())
            })
            .collect();

        let mut learned: Vec<Route> = stored.into_values().filter(|r| !r.is_seed()).collect();
        learned.sort_by(|a, b| a.route_id.cmp(&b.route_id));
        routes.extend(learned);

        routes
    }

    pub fn seeds(&self) -> &[Route] {
        &self.seeds
    }
}

fn word_tokens(text: &str) -> Vec<&str> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .collect()
}

/// Whole-word match of a pattern phrase against pre-split query tokens
fn contains_phrase(tokens: &[&str], pattern: &str) -> bool {
    let phrase = word_tokens(pattern);
    if phrase.is_empty() || phrase.len() > tokens.len() {
        return false;
    }
    tokens
        .windows(phrase.len())
        .any(|window| window.iter().zip(&phrase).all(|(a, b)| a.eq_ignore_ascii_case(b)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::testing::UnavailableStore;
    use crate::store::InMemoryStore;

    fn router() -> PatternRouter {
        PatternRouter::new(Arc::new(InMemoryStore::new()), &EngineConfig::default())
    }

    #[tokio::test]
    async fn test_seed_pattern_match() {
        let router = router();
        let found = router.find_route("What is the price of AAPL?", None).await.unwrap();
        assert_eq!(found.route.workflow_id, QUOTE);
        assert_eq!(found.matched_by, MatchKind::Pattern);
        assert_eq!(found.route.required_task_executors, vec!["price_snapshot"]);
    }

    #[tokio::test]
    async fn test_seed_patterns_match_whole_words() {
        let router = router();
        assert!(router.find_route("list the unquoted bonds", None).await.is_none());
        assert!(router.find_route("should it rain tomorrow", None).await.is_none());

        let found = router.find_route("Should I hold NVDA?", None).await.unwrap();
        assert_eq!(found.route.workflow_id, ADVISOR);
        let found = router.find_route("quote: MSFT", None).await.unwrap();
        assert_eq!(found.route.workflow_id, QUOTE);
    }

    #[tokio::test]
    async fn test_usage_count_increments() {
        let router = router();
        router.seed_routes().await;
        router.find_route("quote for MSFT", None).await;
        let found = router.find_route("MSFT quote", None).await.unwrap();
        assert_eq!(found.route.usage_count, 2);

        let routes = router.list_routes().await;
        let quote = routes.iter().find(|r| r.route_id == "quote").unwrap();
        assert_eq!(quote.usage_count, 2);
    }

    #[tokio::test]
    async fn test_best_pattern_count_wins() {
        let router = router();
        let found = router
            .find_route("deep dive analysis of NVDA, latest news too", None)
            .await
            .unwrap();
        assert_eq!(found.route.workflow_id, EQUITY_ANALYSIS);
    }

    #[tokio::test]
    async fn test_novel_query_has_no_route() {
        let router = router();
        assert!(router.find_route("tell me about NVDA", None).await.is_none());
    }

    #[tokio::test]
    async fn test_recorded_route_matches_repeat_query() {
        let router = router();
        router
            .record_route(
                "tell me about NVDA",
                None,
                "fallback:quote:abc",
                QUOTE,
                &["price_snapshot".to_string()],
                FALLBACK_SOURCE,
            )
            .await;

        let found = router.find_route("Tell me  about NVDA", None).await.unwrap();
        assert_eq!(found.matched_by, MatchKind::LearnedExact);
        assert_eq!(found.route.source, FALLBACK_SOURCE);
        assert_eq!(found.route.usage_count, 1);
        assert_eq!(router.list_routes().await.len(), 5);
    }

    #[tokio::test]
    async fn test_similarity_fallback_over_learned_routes() {
        let router = router();
        router
            .record_route(
                "how is nvidia doing",
                Some(&[1.0, 0.0, 0.0]),
                "learned:nvda",
                RESEARCH,
                &[],
                FALLBACK_SOURCE,
            )
            .await;

        let found = router
            .find_route("how's nvidia doing lately", Some(&[0.98, 0.1, 0.0]))
            .await
            .unwrap();
        assert_eq!(found.matched_by, MatchKind::Similarity);
        assert!(found.similarity.unwrap() >= 0.90);

        assert!(router
            .find_route("unrelated", Some(&[0.0, 1.0, 0.0]))
            .await
            .is_none());
    }

    #[tokio::test]
    async fn test_unavailable_store_still_matches_seeds() {
        let router = PatternRouter::new(Arc::new(UnavailableStore), &EngineConfig::default());
        assert_eq!(router.seed_routes().await, 0);
        let found = router.find_route("should I buy TSLA", None).await.unwrap();
        assert_eq!(found.route.workflow_id, ADVISOR);
        assert!(router.find_route("novel", Some(&[1.0])).await.is_none());
        assert_eq!(router.list_routes().await.len(), 4);
    }
}
