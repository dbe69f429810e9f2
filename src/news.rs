//! `News` collaborator contract (§2, §4.1): recent headlines with sentiment,
//! interface only — same stance as `market.rs`.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::errors::AppResult;

#[derive(Debug, Clone)]
pub struct RawNewsItem {
    pub headline: String,
    pub url: String,
    pub timestamp: DateTime<Utc>,
    /// `Some` when the provider supplies its own sentiment score; `None` falls
    /// back to the keyword heuristic below.
    pub sentiment: Option<f64>,
}

#[async_trait]
pub trait News: Send + Sync {
    async fn recent(&self, ticker: &str, within_hours: i64) -> AppResult<Vec<RawNewsItem>>;
}

/// Returns an empty list, never fabricates headlines. The fact synthesizer
/// treats an empty feed as ordinary, not a failure (§4.1: "News miss → empty
/// list").
pub struct NoNews;

#[async_trait]
impl News for NoNews {
    async fn recent(&self, _ticker: &str, _within_hours: i64) -> AppResult<Vec<RawNewsItem>> {
        Ok(Vec::new())
    }
}

const POSITIVE_WORDS: &[&str] = &[
    "beat", "beats", "surge", "soar", "upgrade", "record", "strong", "raises", "raised",
    "growth", "profit", "outperform", "bullish", "rally", "exceeds",
];
const NEGATIVE_WORDS: &[&str] = &[
    "miss", "misses", "plunge", "downgrade", "recall", "weak", "cuts", "cut", "lawsuit",
    "investigation", "bearish", "slump", "warns", "warning", "default",
];

/// Small static word-table heuristic, scored per headline and clamped to
/// `[-1, 1]` (§4.1 Rust-native additions). Used only when the provider doesn't
/// supply its own sentiment.
pub fn keyword_sentiment(headline: &str) -> f64 {
    let lower = headline.to_lowercase();
    let mut score = 0i32;
    for word in POSITIVE_WORDS {
        if lower.contains(word) {
            score += 1;
        }
    }
    for word in NEGATIVE_WORDS {
        if lower.contains(word) {
            score -= 1;
        }
    }
    (f64::from(score) / 3.0).clamp(-1.0, 1.0)
}

pub fn sentiment_for(item: &RawNewsItem) -> f64 {
    item.sentiment.unwrap_or_else(|| keyword_sentiment(&item.headline))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn positive_headline_scores_positive() {
        assert!(keyword_sentiment("Company beats estimates, raises guidance") > 0.0);
    }

    #[test]
    fn negative_headline_scores_negative() {
        assert!(keyword_sentiment("Company misses and warns of weak demand") < 0.0);
    }

    #[test]
    fn neutral_headline_scores_zero() {
        assert_eq!(keyword_sentiment("Company to present at industry conference"), 0.0);
    }

    #[test]
    fn provider_sentiment_takes_precedence() {
        let item = RawNewsItem {
            headline: "miss".to_string(),
            url: "https://example.com".to_string(),
            timestamp: Utc::now(),
            sentiment: Some(0.9),
        };
        assert_eq!(sentiment_for(&item), 0.9);
    }
}
