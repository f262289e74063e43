//! Response-quality scoring collaborator
//!
//! The engine only depends on the numeric contract: a score in
//! [0.0, 1.0] for a (prompt, response) pair. `HeuristicScorer` is the
//! built-in lexical implementation; hosts with a real evaluator plug in
//! their own `QualityScorer`.

use std::collections::HashSet;

/// Collaborator contract: score a response against its prompt.
///
/// Implementations must return a value in [0.0, 1.0] and must not block
/// on I/O; the engine calls this from request paths.
pub trait QualityScorer: Send + Sync {
    fn score(&self, prompt: &str, response: &str) -> f64;
}

/// Lexical heuristic scorer.
///
/// Blends five sub-scores: relevance (0.3), coherence (0.25),
/// completeness (0.2), clarity (0.15), and utility (0.1). Crude, but
/// cheap and deterministic.
pub struct HeuristicScorer {
    coherence_markers: Vec<&'static str>,
    positive_markers: Vec<&'static str>,
    negative_markers: Vec<&'static str>,
    utility_markers: Vec<&'static str>,
    stop_words: HashSet<&'static str>,
}

impl Default for HeuristicScorer {
    fn default() -> Self {
        Self {
            coherence_markers: vec![
                "therefore",
                "however",
                "first",
                "second",
                "finally",
                "additionally",
                "consequently",
                "in other words",
                "on the other hand",
            ],
            positive_markers: vec!["clear", "specific", "detailed", "precise", "useful"],
            negative_markers: vec!["vague", "confusing", "incomplete", "incorrect", "irrelevant"],
            utility_markers: vec![
                "how", "steps", "first", "example", "tutorial", "configure", "install", "run",
                "use",
            ],
            stop_words: ["the", "a", "an", "of", "to", "in", "for", "with", "and", "or", "is"]
                .into_iter()
                .collect(),
        }
    }
}

impl HeuristicScorer {
    pub fn new() -> Self {
        Self::default()
    }

    fn relevance(&self, prompt: &str, response: &str) -> f64 {
        let tokens = |text: &str| -> HashSet<String> {
            text.to_lowercase()
                .split_whitespace()
                .filter(|w| !self.stop_words.contains(*w))
                .map(|w| w.to_string())
                .collect()
        };

        let prompt_words = tokens(prompt);
        if prompt_words.is_empty() {
            return 0.5;
        }
        let response_words = tokens(response);

        let overlap = prompt_words.intersection(&response_words).count();
        (overlap as f64 / prompt_words.len() as f64).min(1.0)
    }

    fn coherence(&self, response: &str) -> f64 {
        let lower = response.to_lowercase();
        let mut score = 0.5;

        let markers = self
            .coherence_markers
            .iter()
            .filter(|m| lower.contains(*m))
            .count();
        score += (markers as f64 * 0.1).min(0.3);

        if response.split('.').count() > 1 {
            score += 0.1;
        }

        let words: Vec<&str> = lower.split_whitespace().collect();
        if !words.is_empty() {
            let unique: HashSet<&&str> = words.iter().collect();
            score += (unique.len() as f64 / words.len() as f64) * 0.1;
        }

        score.min(1.0)
    }

    fn completeness(&self, prompt: &str, response: &str) -> f64 {
        let prompt_len = prompt.split_whitespace().count();
        if prompt_len == 0 {
            return 0.5;
        }
        let ratio = response.split_whitespace().count() as f64 / prompt_len as f64;

        // Answers roughly twice the prompt length read as complete;
        // one-word answers and walls of text both get marked down.
        if ratio < 0.5 {
            ratio / 0.5 * 0.5
        } else if ratio > 10.0 {
            (1.0 - (ratio - 10.0) * 0.1).max(0.2)
        } else {
            (ratio / 2.0).min(1.0)
        }
    }

    fn clarity(&self, response: &str) -> f64 {
        let lower = response.to_lowercase();
        let mut score: f64 = 0.5;

        for marker in &self.positive_markers {
            if lower.contains(marker) {
                score += 0.1;
            }
        }
        for marker in &self.negative_markers {
            if lower.contains(marker) {
                score -= 0.1;
            }
        }
        if response.contains('.') && response.contains(',') {
            score += 0.1;
        }

        score.clamp(0.0, 1.0)
    }

    fn utility(&self, response: &str) -> f64 {
        let lower = response.to_lowercase();
        let markers = self
            .utility_markers
            .iter()
            .filter(|m| lower.contains(*m))
            .count();
        (markers as f64 * 0.2 + 0.3).min(1.0)
    }
}

impl QualityScorer for HeuristicScorer {
    fn score(&self, prompt: &str, response: &str) -> f64 {
        if response.trim().is_empty() {
            return 0.0;
        }

        let score = self.relevance(prompt, response) * 0.3
            + self.coherence(response) * 0.25
            + self.completeness(prompt, response) * 0.2
            + self.clarity(response) * 0.15
            + self.utility(response) * 0.1;

        score.clamp(0.0, 1.0)
    }
}
