use crate::models::{RetrievalMetrics, ScoredChunk};
use std::collections::HashSet;

/// Hit density, source diversity and mean distance of one Top-K result.
///
/// Density is the share of results with `distance <= distance_threshold`;
/// diversity counts distinct documents. An empty result scores zero on both
/// with a mean distance of 1.0.
pub fn score(results: &[ScoredChunk], distance_threshold: f32) -> RetrievalMetrics {
    if results.is_empty() {
        return RetrievalMetrics {
            density: 0.0,
            diversity: 0,
            mean_distance: 1.0,
            result_count: 0,
        };
    }

    let hits = results
        .iter()
        .filter(|result| result.distance <= distance_threshold)
        .count();
    let documents: HashSet<&str> = results
        .iter()
        .map(|result| result.chunk.document_id.as_str())
        .collect();
    let total_distance: f32 = results.iter().map(|result| result.distance).sum();

    RetrievalMetrics {
        density: hits as f32 / results.len() as f32,
        diversity: documents.len(),
        mean_distance: total_distance / results.len() as f32,
        result_count: results.len(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Chunk;
    use std::collections::BTreeSet;

    fn result(document_id: &str, distance: f32) -> ScoredChunk {
        ScoredChunk {
            chunk: Chunk {
                chunk_id: format!("{document_id}-{distance}"),
                document_id: document_id.to_string(),
                source_name: format!("{document_id}.pdf"),
                page: 1,
                chunk_index: 0,
                text: String::new(),
                char_start: 0,
                char_end: 0,
                embedding: Vec::new(),
                tags: BTreeSet::new(),
                note_topic: None,
            },
            distance,
        }
    }

    #[test]
    fn empty_results_score_zero() {
        let metrics = score(&[], 0.4);
        assert_eq!(metrics.density, 0.0);
        assert_eq!(metrics.diversity, 0);
        assert_eq!(metrics.mean_distance, 1.0);
        assert_eq!(metrics.result_count, 0);
    }

    #[test]
    fn density_counts_hits_within_threshold() {
        let results = vec![
            result("a", 0.1),
            result("a", 0.4),
            result("b", 0.41),
            result("c", 0.9),
        ];
        let metrics = score(&results, 0.4);
        assert!((metrics.density - 0.5).abs() < f32::EPSILON);
        assert_eq!(metrics.diversity, 3);
        assert!((metrics.mean_distance - 0.4525).abs() < 1e-5);
        assert_eq!(metrics.result_count, 4);
    }
}
