//! Reciprocal Rank Fusion.
//!
//! Merges the keyword and semantic ranked lists without score normalization:
//! each list contributes 1/(k + rank) per item (1-indexed) and contributions
//! are summed. Ordering is fully deterministic, including ties.

use std::cmp::Ordering;
use std::collections::HashMap;

use crate::store::FtsHit;
use crate::vector::VectorHit;

/// Fixed fusion constant; not configurable.
pub const RRF_K: f64 = 60.0;

#[derive(Debug, Clone, PartialEq)]
pub struct FusedHit {
    pub point_id: String,
    pub score: f64,
    /// Raw semantic score when the point appeared in the vector list.
    pub vector_score: Option<f32>,
    pub chunk_index: Option<u32>,
}

/// Fuse both ranked lists. A point appearing in both collapses into one entry
/// with summed contributions.
pub fn rrf_fuse(fts: &[FtsHit], vector: &[VectorHit]) -> Vec<FusedHit> {
    let mut merged: HashMap<String, FusedHit> = HashMap::new();

    for (position, hit) in fts.iter().enumerate() {
        let contribution = 1.0 / (RRF_K + position as f64 + 1.0);
        let entry = merged
            .entry(hit.point_id.clone())
            .or_insert_with(|| FusedHit {
                point_id: hit.point_id.clone(),
                score: 0.0,
                vector_score: None,
                chunk_index: None,
            });
        entry.score += contribution;
        entry.chunk_index = entry.chunk_index.or(Some(hit.chunk_index));
    }

    for (position, hit) in vector.iter().enumerate() {
        let contribution = 1.0 / (RRF_K + position as f64 + 1.0);
        let entry = merged
            .entry(hit.point_id.clone())
            .or_insert_with(|| FusedHit {
                point_id: hit.point_id.clone(),
                score: 0.0,
                vector_score: None,
                chunk_index: None,
            });
        entry.score += contribution;
        entry.vector_score = Some(match entry.vector_score {
            Some(existing) => existing.max(hit.score),
            None => hit.score,
        });
        entry.chunk_index = entry.chunk_index.or(hit.chunk_index);
    }

    let mut fused: Vec<FusedHit> = merged.into_values().collect();
    sort_fused(&mut fused);
    fused
}

/// Tie-break order: fused score desc, raw vector score desc, chunk index asc,
/// point id lexicographic. Determinism here is what makes fusion testable.
fn sort_fused(hits: &mut [FusedHit]) {
    hits.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(Ordering::Equal)
            .then_with(|| {
                let a_vec = a.vector_score.unwrap_or(f32::MIN);
                let b_vec = b.vector_score.unwrap_or(f32::MIN);
                b_vec.partial_cmp(&a_vec).unwrap_or(Ordering::Equal)
            })
            .then_with(|| {
                a.chunk_index
                    .unwrap_or(u32::MAX)
                    .cmp(&b.chunk_index.unwrap_or(u32::MAX))
            })
            .then_with(|| a.point_id.cmp(&b.point_id))
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fts_hit(point_id: &str, rank: f64, chunk_index: u32) -> FtsHit {
        FtsHit {
            point_id: point_id.to_string(),
            rank,
            chunk_index,
        }
    }

    fn vector_hit(point_id: &str, score: f32, chunk_index: Option<u32>) -> VectorHit {
        VectorHit {
            point_id: point_id.to_string(),
            score,
            chunk_index,
        }
    }

    #[test]
    fn fusion_matches_reference_scores() {
        // FTS: [p1, p2], vector: [p2, p3], k = 60.
        let fts = vec![fts_hit("p1", -2.0, 0), fts_hit("p2", -1.5, 1)];
        let vector = vec![
            vector_hit("p2", 0.9, Some(1)),
            vector_hit("p3", 0.7, Some(2)),
        ];

        let fused = rrf_fuse(&fts, &vector);
        assert_eq!(fused.len(), 3);

        // p2 = 1/62 + 1/61, p1 = 1/61, p3 = 1/62.
        assert_eq!(fused[0].point_id, "p2");
        assert!((fused[0].score - (1.0 / 62.0 + 1.0 / 61.0)).abs() < 1e-12);
        assert_eq!(fused[1].point_id, "p1");
        assert!((fused[1].score - 1.0 / 61.0).abs() < 1e-12);
        assert_eq!(fused[2].point_id, "p3");
        assert!((fused[2].score - 1.0 / 62.0).abs() < 1e-12);
    }

    #[test]
    fn point_in_both_lists_collapses_into_one_entry() {
        let fts = vec![fts_hit("p1", -1.0, 0)];
        let vector = vec![vector_hit("p1", 0.8, Some(0))];
        let fused = rrf_fuse(&fts, &vector);
        assert_eq!(fused.len(), 1);
        assert!((fused[0].score - 2.0 / 61.0).abs() < 1e-12);
        assert_eq!(fused[0].vector_score, Some(0.8));
    }

    #[test]
    fn equal_scores_break_by_vector_score_then_index_then_id() {
        // Two vector-only hits plus an FTS hit whose rank gives it the same
        // fused score as the top vector hit.
        let vector = vec![
            vector_hit("pb", 0.5, Some(3)),
            vector_hit("pa", 0.5, Some(1)),
        ];
        // Ranks differ so scores differ; instead craft ties via FTS only.
        let fts = vec![fts_hit("za", -1.0, 5)];
        let fused = rrf_fuse(&fts, &vector);
        assert_eq!(fused[0].point_id, "pb");

        // Pure tie: two FTS-only entries never tie by construction (ranks
        // differ), so exercise the comparator directly.
        let mut hits = vec![
            FusedHit {
                point_id: "b".to_string(),
                score: 0.5,
                vector_score: None,
                chunk_index: Some(2),
            },
            FusedHit {
                point_id: "a".to_string(),
                score: 0.5,
                vector_score: None,
                chunk_index: Some(2),
            },
            FusedHit {
                point_id: "c".to_string(),
                score: 0.5,
                vector_score: Some(0.1),
                chunk_index: Some(9),
            },
            FusedHit {
                point_id: "d".to_string(),
                score: 0.5,
                vector_score: None,
                chunk_index: Some(1),
            },
        ];
        sort_fused(&mut hits);
        let order: Vec<&str> = hits.iter().map(|h| h.point_id.as_str()).collect();
        // c wins on vector score; d beats a/b on chunk index; a beats b on id.
        assert_eq!(order, vec!["c", "d", "a", "b"]);
    }

    #[test]
    fn fusion_is_deterministic_across_runs() {
        let fts: Vec<FtsHit> = (0..20)
            .map(|i| fts_hit(&format!("p{}", i), -(i as f64), i))
            .collect();
        let vector: Vec<VectorHit> = (0..20)
            .rev()
            .map(|i| vector_hit(&format!("p{}", i), i as f32 / 20.0, Some(i)))
            .collect();

        let first = rrf_fuse(&fts, &vector);
        for _ in 0..10 {
            assert_eq!(rrf_fuse(&fts, &vector), first);
        }
    }

    #[test]
    fn empty_lists_fuse_to_empty() {
        assert!(rrf_fuse(&[], &[]).is_empty());
    }

    #[test]
    fn single_list_keeps_its_order() {
        let fts = vec![
            fts_hit("p1", -3.0, 0),
            fts_hit("p2", -2.0, 1),
            fts_hit("p3", -1.0, 2),
        ];
        let fused = rrf_fuse(&fts, &[]);
        let order: Vec<&str> = fused.iter().map(|h| h.point_id.as_str()).collect();
        assert_eq!(order, vec!["p1", "p2", "p3"]);
    }
}
