//! Local Distance Difference Test (LDDT) scoring.
//!
//! For each aligned query residue, the reference set is every other query
//! residue within the inclusion radius in the query's own geometry. The
//! residue score is the fraction of those reference distances preserved
//! in the target geometry, averaged over the tolerance thresholds. A
//! residue with no aligned reference partner is undefined and excluded
//! from the average rather than counted as zero.

use crate::backtrace::Backtrace;
use crate::error::{FoldscanError, Result};
use crate::structure::distance;

/// Partner inclusion radius in the query geometry (Angstrom).
const INCLUSION_RADIUS: f32 = 15.0;

/// Tolerance thresholds averaged per reference distance (Angstrom).
const THRESHOLDS: [f32; 4] = [0.5, 1.0, 2.0, 4.0];

/// Per-alignment LDDT scores.
#[derive(Debug, Clone)]
pub struct LddtResult {
    /// Mean over residues with a defined score.
    pub average: f32,
    /// One slot per Match step of the backtrace, in order; `None` when
    /// the residue had no aligned reference partner within the radius.
    pub per_residue: Vec<Option<f32>>,
}

/// LDDT scorer with query-side reference distances built once by
/// [`LddtScorer::init_query`] and reused across targets.
#[derive(Debug, Default)]
pub struct LddtScorer {
    query_len: usize,
    /// Per query residue: (partner index, reference distance) for every
    /// other residue within the inclusion radius.
    reference: Vec<Vec<(usize, f32)>>,
}

impl LddtScorer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn init_query(&mut self, coords: &[[f32; 3]]) -> Result<()> {
        if coords.is_empty() {
            return Err(FoldscanError::LengthMismatch(
                "query has 0 residues".to_string(),
            ));
        }
        self.query_len = coords.len();
        self.reference.clear();
        self.reference.resize(coords.len(), Vec::new());
        for i in 0..coords.len() {
            for j in i + 1..coords.len() {
                let d = distance(&coords[i], &coords[j]);
                if d < INCLUSION_RADIUS {
                    self.reference[i].push((j, d));
                    self.reference[j].push((i, d));
                }
            }
        }
        Ok(())
    }

    /// Score a fixed alignment against `target_coords`.
    pub fn score(
        &self,
        target_coords: &[[f32; 3]],
        query_start: usize,
        target_start: usize,
        backtrace: &Backtrace,
    ) -> Result<LddtResult> {
        if self.reference.is_empty() {
            return Err(FoldscanError::InvalidState(
                "score called before init_query".to_string(),
            ));
        }
        if backtrace.match_count() == 0 {
            return Err(FoldscanError::DegenerateAlignment(
                "alignment has no matched residues".to_string(),
            ));
        }
        if query_start + backtrace.query_span() > self.query_len {
            return Err(FoldscanError::LengthMismatch(format!(
                "alignment consumes {} query residues from {} but the query has {}",
                backtrace.query_span(),
                query_start,
                self.query_len
            )));
        }
        if target_start + backtrace.target_span() > target_coords.len() {
            return Err(FoldscanError::LengthMismatch(format!(
                "alignment consumes {} target residues from {} but the target has {}",
                backtrace.target_span(),
                target_start,
                target_coords.len()
            )));
        }

        let pairs = backtrace.matched_pairs(query_start, target_start);
        // Query residue -> aligned target residue; usize::MAX marks
        // unaligned positions.
        let mut mapped = vec![usize::MAX; self.query_len];
        for &(qi, ti) in &pairs {
            mapped[qi] = ti;
        }

        let mut per_residue = Vec::with_capacity(pairs.len());
        let mut sum = 0.0f64;
        let mut defined = 0usize;
        for &(qi, ti) in &pairs {
            let mut preserved = 0.0f32;
            let mut partners = 0usize;
            for &(qj, ref_d) in &self.reference[qi] {
                let tj = mapped[qj];
                if tj == usize::MAX {
                    continue;
                }
                let target_d = distance(&target_coords[ti], &target_coords[tj]);
                let diff = (ref_d - target_d).abs();
                let within = THRESHOLDS.iter().filter(|t| diff < **t).count();
                preserved += within as f32 / THRESHOLDS.len() as f32;
                partners += 1;
            }
            if partners == 0 {
                per_residue.push(None);
            } else {
                let score = preserved / partners as f32;
                per_residue.push(Some(score));
                sum += f64::from(score);
                defined += 1;
            }
        }

        if defined == 0 {
            return Err(FoldscanError::UndefinedScore(
                "no aligned residue had a reference partner within the inclusion radius"
                    .to_string(),
            ));
        }
        Ok(LddtResult {
            average: (sum / defined as f64) as f32,
            per_residue,
        })
    }
}

/// One-shot LDDT over an explicit alignment between two coordinate sets.
pub fn compute_lddt_pair(
    query_coords: &[[f32; 3]],
    target_coords: &[[f32; 3]],
    query_start: usize,
    target_start: usize,
    backtrace: &Backtrace,
) -> Result<LddtResult> {
    let mut scorer = LddtScorer::new();
    scorer.init_query(query_coords)?;
    scorer.score(target_coords, query_start, target_start, backtrace)
}
