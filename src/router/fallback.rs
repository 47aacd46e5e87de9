//! Fallback workflow selection
//!
//! Used by the engine when no route matches. Picks a default workflow from
//! coarse signals: advice/analysis keywords and the number of symbols in
//! the query.

use super::FALLBACK_SOURCE;
use crate::cache::keys::content_hash;
use crate::workflows::{extract_tickers, ADVISOR, EQUITY_ANALYSIS, QUOTE, RESEARCH};

/// Static keyword lists, zero allocation
const ADVICE_KEYWORDS: &[&str] = &[
    "should", "advice", "advise", "recommend", "buy", "sell", "hold", "worth",
];

const ANALYSIS_KEYWORDS: &[&str] = &[
    // Indicators
    "risk", "volatility", "sentiment", "rsi", "macd", "beta",
    // Fundamentals
    "fundamental", "valuation", "earnings", "revenue", "margin",
    // Reports
    "report", "outlook", "performance", "trend",
];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FallbackDecision {
    pub workflow_id: &'static str,
    pub tickers: Vec<String>,
    pub reason: &'static str,
}

impl FallbackDecision {
    /// Stable id for the learned route
    pub fn route_id(&self, query: &str) -> String {
        let hash = content_hash(&query.to_lowercase());
        format!("{}:{}:{}", FALLBACK_SOURCE, self.workflow_id, &hash[..12])
    }
}

pub struct FallbackSelector;

impl FallbackSelector {
    pub fn select(query: &str) -> FallbackDecision {
        let text = query.to_lowercase();
        let tickers = extract_tickers(query);

        let advice_score = keyword_score(&text, ADVICE_KEYWORDS);
        let analysis_score = keyword_score(&text, ANALYSIS_KEYWORDS);

        let (workflow_id, reason) = if advice_score >= 1 && !tickers.is_empty() {
            (ADVISOR, "advice keywords with symbols")
        } else if analysis_score >= 1 && !tickers.is_empty() {
            (EQUITY_ANALYSIS, "analysis keywords with symbols")
        } else if tickers.len() >= 2 {
            (EQUITY_ANALYSIS, "multiple symbols")
        } else if tickers.len() == 1 && text.len() < 40 {
            (QUOTE, "single symbol, short query")
        } else {
            (RESEARCH, "no decisive signal")
        };

        FallbackDecision {
            workflow_id,
            tickers,
            reason,
        }
    }
}

fn keyword_score(text: &str, keywords: &[&str]) -> usize {
    keywords.iter().filter(|kw| text.contains(**kw)).count()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_single_symbol_short_query_is_quote() {
        let decision = FallbackSelector::select("tell me about NVDA");
        assert_eq!(decision.workflow_id, QUOTE);
        assert_eq!(decision.tickers, vec!["NVDA"]);
    }

    #[test]
    fn test_signals() {
        let cases = vec![
            ("is TSLA worth it right now", ADVISOR),
            ("volatility picture for AMD", EQUITY_ANALYSIS),
            ("AAPL versus MSFT", EQUITY_ANALYSIS),
            ("what moved the semiconductor sector this week", RESEARCH),
        ];

        for (query, expected) in cases {
            assert_eq!(FallbackSelector::select(query).workflow_id, expected, "{}", query);
        }
    }

    #[test]
    fn test_route_id_is_stable() {
        let decision = FallbackSelector::select("tell me about NVDA");
        assert_eq!(
            decision.route_id("tell me about NVDA"),
            decision.route_id("Tell me about NVDA")
        );
        assert!(decision.route_id("x").starts_with("fallback:quote:"));
    }
}
