//! Weighted voting across scoring sources.

use std::cmp::Ordering;
use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::candidate::{ScoreScale, ScoredCandidate, Source};
use crate::config::EnsembleWeights;

/// One code in the merged ranking.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConsensusEntry {
    pub code: String,
    /// Aggregate score in [0, 1].
    pub score: f32,
    /// Sources that voted for the code, in vote order.
    pub sources: Vec<Source>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub explanation: Option<String>,
}

/// A source's ranked output and the scale its scores are on.
pub struct Ballot<'a> {
    pub source: Source,
    pub scale: ScoreScale,
    pub candidates: &'a [ScoredCandidate],
}

/// Merge ballots by weighted sum.
///
/// Each vote adds `weight(source) * normalize(score)` to its code's total;
/// the aggregate is `min(total, 1.0)`. Votes that normalize to 0 are not
/// counted. Ordering is aggregate descending, then number of voting sources
/// descending, then first appearance across ballots.
pub fn weighted_vote(weights: &EnsembleWeights, ballots: &[Ballot<'_>]) -> Vec<ConsensusEntry> {
    struct Tally {
        total: f32,
        sources: Vec<Source>,
        explanation: Option<String>,
        first_seen: usize,
    }

    let mut tallies: HashMap<&str, Tally> = HashMap::new();
    let mut seen = 0usize;

    for ballot in ballots {
        let weight = weights.weight(ballot.source);
        for candidate in ballot.candidates {
            let normalized = ballot.scale.normalize(candidate.score);
            if normalized <= 0.0 {
                continue;
            }
            let tally = tallies.entry(candidate.code.as_str()).or_insert_with(|| {
                seen += 1;
                Tally {
                    total: 0.0,
                    sources: Vec::new(),
                    explanation: None,
                    first_seen: seen,
                }
            });
            if tally.sources.contains(&ballot.source) {
                continue;
            }
            tally.total += weight * normalized;
            tally.sources.push(ballot.source);
            if tally.explanation.is_none() {
                tally.explanation = candidate.explanation.clone();
            }
        }
    }

    let mut merged: Vec<(usize, ConsensusEntry)> = tallies
        .into_iter()
        .map(|(code, t)| {
            (
                t.first_seen,
                ConsensusEntry {
                    code: code.to_string(),
                    score: t.total.min(1.0),
                    sources: t.sources,
                    explanation: t.explanation,
                },
            )
        })
        .collect();

    merged.sort_by(|(seen_a, a), (seen_b, b)| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(Ordering::Equal)
            .then(b.sources.len().cmp(&a.sources.len()))
            .then(seen_a.cmp(seen_b))
    });
    merged.into_iter().map(|(_, entry)| entry).collect()
}
