//! Optional item annotations.
//!
//! Analysis runs after dedup, so the set of new items never depends on
//! whether an analyzer is configured or whether it succeeds.

use async_trait::async_trait;
use tracing::warn;

use sourcewatch_shared::{Analysis, Item, ReadingPriority, Result, RunItem, compact_text};

const TOPIC_KEYWORDS: &[&str] = &[
    "ai",
    "agent",
    "llm",
    "model",
    "reasoning",
    "inference",
    "fine-tuning",
    "evaluation",
    "retrieval",
    "rag",
    "prompt",
    "multimodal",
    "automation",
];

const TAG_KEYWORDS: &[&str] = &[
    "agent",
    "llm",
    "model",
    "reasoning",
    "inference",
    "evaluation",
    "benchmark",
    "api",
    "multimodal",
    "rag",
    "safety",
    "open-source",
];

const CODE_INDICATORS: &[&str] = &[
    "code",
    "github",
    "repository",
    "implementation",
    "function",
    "class",
    "def ",
    "import ",
    "```",
    "<code",
    "api endpoint",
    "sdk",
    "library",
    "package",
];

const API_INDICATORS: &[&str] = &[
    "api",
    "endpoint",
    "sdk",
    "integration",
    "webhook",
    "rest",
    "graphql",
    "request",
    "response",
    "authentication",
    "rate limit",
    "new feature",
    "launch",
    "release",
];

const MAX_TAGS: usize = 6;
const MAX_SUMMARY_CHARS: usize = 140;
const WORDS_PER_MINUTE: f64 = 200.0;

/// Produces annotations for a single item.
#[async_trait]
pub trait ItemAnalyzer: Send + Sync {
    async fn analyze(&self, item: &Item) -> Result<Analysis>;
}

/// Keyword heuristics over title and summary.
#[derive(Debug, Clone, Copy, Default)]
pub struct RuleBasedAnalyzer;

impl RuleBasedAnalyzer {
    pub fn analyze_sync(&self, item: &Item) -> Analysis {
        let text = format!("{} {}", item.title, item.raw_summary).to_lowercase();

        let score = TOPIC_KEYWORDS
            .iter()
            .filter(|k| text.contains(*k))
            .count()
            .saturating_mul(10)
            .min(100) as u8;

        let tags = TAG_KEYWORDS
            .iter()
            .filter(|k| text.contains(*k))
            .take(MAX_TAGS)
            .map(|k| k.to_string())
            .collect();

        let mut summary: String = compact_text(&item.raw_summary)
            .chars()
            .take(MAX_SUMMARY_CHARS)
            .collect();
        if summary.is_empty() {
            summary = compact_text(&item.title).chars().take(MAX_SUMMARY_CHARS).collect();
        }

        let reading_priority = match score {
            80.. => ReadingPriority::High,
            50.. => ReadingPriority::Medium,
            _ => ReadingPriority::Low,
        };

        let words = format!("{}\n{}", item.title, item.raw_summary)
            .split_whitespace()
            .count();

        Analysis {
            relevance_score: score,
            tags,
            summary,
            has_code_example: CODE_INDICATORS.iter().any(|k| text.contains(k)),
            has_api_update: API_INDICATORS.iter().any(|k| text.contains(k)),
            reading_priority,
            technical_depth: (score / 20 + 1).clamp(1, 5),
            estimated_reading_time: ((words as f64 / WORDS_PER_MINUTE).round() as u32).max(1),
            model_used: "rule-based".to_string(),
        }
    }
}

#[async_trait]
impl ItemAnalyzer for RuleBasedAnalyzer {
    async fn analyze(&self, item: &Item) -> Result<Analysis> {
        Ok(self.analyze_sync(item))
    }
}

/// Attach analyses to new items. A failing analyzer falls back to the
/// rule-based annotations; with no analyzer, items carry none.
pub async fn annotate(items: Vec<Item>, analyzer: Option<&dyn ItemAnalyzer>) -> Vec<RunItem> {
    let Some(analyzer) = analyzer else {
        return items
            .into_iter()
            .map(|item| RunItem {
                item,
                analysis: None,
            })
            .collect();
    };

    let mut out = Vec::with_capacity(items.len());
    for item in items {
        let analysis = match analyzer.analyze(&item).await {
            Ok(analysis) => analysis,
            Err(e) => {
                warn!(uid = %item.uid, error = %e, "analysis failed, using rule-based fallback");
                RuleBasedAnalyzer.analyze_sync(&item)
            }
        };
        out.push(RunItem {
            item,
            analysis: Some(analysis),
        });
    }
    out
}

/// Most relevant first, then newest. Stable for ties.
pub fn sort_by_relevance(items: &mut [RunItem]) {
    items.sort_by(|a, b| {
        let score = |i: &RunItem| i.analysis.as_ref().map_or(0, |a| a.relevance_score);
        score(b)
            .cmp(&score(a))
            .then_with(|| b.item.published_at.cmp(&a.item.published_at))
    });
}
