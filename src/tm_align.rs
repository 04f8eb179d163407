//! TM-align-style rigid alignment and TM-score computation.
//!
//! The engine works in two phases. Phase 1 finds a residue
//! correspondence: gapless fragment pairs seed candidate superpositions,
//! each superposition induces a distance score matrix over all residue
//! pairs, and a global dynamic program with free end gaps extracts the
//! best path. Phase 2 refits the superposition by Kabsch least squares on
//! the matched pairs, re-scores, and repeats the DP until the backtrace
//! stabilizes or the iteration cap is reached. The best seed by TM
//! estimate wins.
//!
//! Query-side state (the coordinate buffer) is loaded once with
//! [`TmAligner::init_query`] and reused across every `align` call against
//! different targets, which is what makes the linear database scan cheap
//! on the query side.

use crate::backtrace::{AlignOp, Backtrace};
use crate::error::{FoldscanError, Result};
use crate::structure::Structure;
use crate::superpose::{kabsch_fit, rmsd_under, Superposition};

/// Gap penalty for the correspondence DP.
const GAP_PENALTY: f32 = 0.6;

/// Iteration cap for the inlier-refit loop in `compute_tm_score`.
const MAX_REFINE_ITERS: usize = 20;

/// Inlier distance cutoff schedule for the final superposition search.
const CUTOFF_START: f64 = 8.0;
const CUTOFF_FLOOR: f64 = 4.5;

/// TM-score scale constant for a given reference length:
/// `1.24 * cbrt(L - 15) - 1.8`, floored at 0.5 for short chains.
pub fn d0(reference_length: usize) -> f64 {
    let l = reference_length as f64;
    (1.24 * (l - 15.0).cbrt() - 1.8).max(0.5)
}

/// Reference length used as the TM-score divisor.
///
/// Convention (held crate-wide): the shorter of query and target,
/// clamped to at least 1 so the divisor is never zero.
/// `alignment_length` participates only as a fallback when both lengths
/// are zero.
pub fn normalization(alignment_length: usize, query_length: usize, target_length: usize) -> f32 {
    let reference = match (query_length, target_length) {
        (0, 0) => alignment_length,
        (0, t) => t,
        (q, 0) => q,
        (q, t) => q.min(t),
    };
    reference.max(1) as f32
}

/// Engine mode flags.
///
/// `fast` bounds the seed enumeration and refinement iteration counts,
/// trading exactness for speed. `score_only` skips reporting a
/// superposition in the result (identity placeholder) when only the
/// scalar score is needed.
#[derive(Debug, Clone, Copy, Default)]
pub struct AlignMode {
    pub fast: bool,
    pub score_only: bool,
}

/// TM-score plus the superposition that produced it.
///
/// `converged == false` flags a rotation fit that failed outright; the
/// score is reported as 0 rather than propagated as an error, so a batch
/// scan can rank the pair last instead of aborting.
#[derive(Debug, Clone, Copy)]
pub struct TmScoreResult {
    pub tm_score: f64,
    pub rmsd: f64,
    pub superposition: Superposition,
    pub converged: bool,
}

/// Residue correspondence found by [`TmAligner::align`].
#[derive(Debug, Clone)]
pub struct AlignmentSummary {
    pub backtrace: Backtrace,
    pub query_start: usize,
    pub target_start: usize,
    /// Query-length-normalized TM estimate from the seed search.
    pub raw_score: f32,
}

/// Rigid alignment engine with engine-owned query state.
///
/// `init_query` takes `&mut self` and must complete before alignment;
/// `align` and `compute_tm_score` take `&self` and only read query-side
/// buffers, so one loaded engine can serve parallel scans.
pub struct TmAligner {
    max_len: usize,
    mode: AlignMode,
    query: Vec<[f32; 3]>,
}

impl TmAligner {
    pub fn new(max_len: usize, mode: AlignMode) -> Self {
        TmAligner {
            max_len,
            mode,
            query: Vec::new(),
        }
    }

    pub fn mode(&self) -> AlignMode {
        self.mode
    }

    /// One-time query load. The coordinate buffer is engine-owned and
    /// reallocated only on capacity growth, so repeated loads across a
    /// scan do not churn.
    pub fn init_query(&mut self, structure: &Structure) -> Result<()> {
        if structure.is_empty() {
            return Err(FoldscanError::LengthMismatch(
                "query has 0 residues".to_string(),
            ));
        }
        if structure.len() > self.max_len {
            return Err(FoldscanError::Capacity(format!(
                "query length {} exceeds engine maximum {}",
                structure.len(),
                self.max_len
            )));
        }
        self.query.clear();
        self.query.extend_from_slice(structure.coords());
        Ok(())
    }

    /// Find the best residue correspondence between the loaded query and
    /// `target`.
    pub fn align(&self, target: &Structure) -> Result<AlignmentSummary> {
        if self.query.is_empty() {
            return Err(FoldscanError::InvalidState(
                "align called before init_query".to_string(),
            ));
        }
        if target.is_empty() {
            return Err(FoldscanError::LengthMismatch(
                "target has 0 residues".to_string(),
            ));
        }
        if target.len() > self.max_len {
            return Err(FoldscanError::Capacity(format!(
                "target length {} exceeds engine maximum {}",
                target.len(),
                self.max_len
            )));
        }

        let tcoords = target.coords();
        let ql = self.query.len();
        let tl = tcoords.len();
        let min_len = ql.min(tl);
        let d0v = d0(min_len);

        // Seed set: the full-overlap gapless pair plus shorter fragments
        // slid over both chains. Fast mode halves the fragment menu and
        // coarsens the stride.
        let (frag_lens, stride_div, max_iters) = if self.mode.fast {
            (vec![min_len], 2, 4)
        } else {
            (vec![min_len, (min_len / 2).max(4), (min_len / 4).max(4)], 4, 20)
        };

        let mut best: Option<(f64, Backtrace, usize, usize)> = None;
        for &frag_len in &frag_lens {
            let frag = frag_len.min(min_len);
            if frag < 3 {
                continue;
            }
            let stride = (min_len / stride_div).max(1);
            let mut qi = 0;
            while qi + frag <= ql {
                let mut ti = 0;
                while ti + frag <= tl {
                    if let Some(candidate) = self.refine_seed(tcoords, qi, ti, frag, d0v, max_iters)
                    {
                        if best.as_ref().map_or(true, |b| candidate.0 > b.0) {
                            best = Some(candidate);
                        }
                    }
                    ti += stride;
                }
                qi += stride;
            }
        }

        let (raw_score, backtrace, query_start, target_start) = best.ok_or_else(|| {
            FoldscanError::DegenerateAlignment(
                "no residue correspondence found".to_string(),
            )
        })?;
        Ok(AlignmentSummary {
            backtrace,
            query_start,
            target_start,
            raw_score: raw_score as f32,
        })
    }

    /// Refine one gapless seed: fit on the fragment, then alternate DP
    /// and Kabsch until the backtrace stabilizes or the cap is hit.
    fn refine_seed(
        &self,
        tcoords: &[[f32; 3]],
        qi: usize,
        ti: usize,
        frag: usize,
        d0v: f64,
        max_iters: usize,
    ) -> Option<(f64, Backtrace, usize, usize)> {
        let mut sp = kabsch_fit(&self.query[qi..qi + frag], &tcoords[ti..ti + frag]).ok()?;
        let mut prev: Option<Backtrace> = None;
        let mut result = None;
        for _ in 0..max_iters {
            let (bt, qs, ts) = self.correspondence_dp(tcoords, &sp, d0v)?;
            let pairs = bt.matched_pairs(qs, ts);
            if pairs.len() < 3 {
                break;
            }
            let (qpts, tpts) = gather_pairs(&self.query, tcoords, &pairs);
            match kabsch_fit(&qpts, &tpts) {
                Ok(refit) => sp = refit,
                Err(_) => break,
            }
            let score = pair_score_sum(&qpts, &tpts, &sp, d0v) / self.query.len() as f64;
            let stable = prev.as_ref() == Some(&bt);
            result = Some((score, bt.clone(), qs, ts));
            if stable {
                break;
            }
            prev = Some(bt);
        }
        result
    }

    /// Global DP with free end gaps over the distance score matrix
    /// `1 / (1 + d_ij^2 / d0^2)` induced by `sp`.
    fn correspondence_dp(
        &self,
        tcoords: &[[f32; 3]],
        sp: &Superposition,
        d0v: f64,
    ) -> Option<(Backtrace, usize, usize)> {
        let ql = self.query.len();
        let tl = tcoords.len();
        let width = tl + 1;
        let moved: Vec<[f64; 3]> = tcoords.iter().map(|p| sp.apply(p)).collect();
        let d0_sq = d0v * d0v;

        // 0 = stop, 1 = diagonal (match), 2 = up (query gap), 3 = left
        let mut score = vec![0.0f32; (ql + 1) * width];
        let mut dir = vec![0u8; (ql + 1) * width];
        for i in 1..=ql {
            let q = self.query[i - 1];
            for j in 1..=tl {
                let dx = f64::from(q[0]) - moved[j - 1][0];
                let dy = f64::from(q[1]) - moved[j - 1][1];
                let dz = f64::from(q[2]) - moved[j - 1][2];
                let s = (1.0 / (1.0 + (dx * dx + dy * dy + dz * dz) / d0_sq)) as f32;

                let diag = score[(i - 1) * width + j - 1] + s;
                let up = score[(i - 1) * width + j] - GAP_PENALTY;
                let left = score[i * width + j - 1] - GAP_PENALTY;
                let (best, step) = if diag >= up && diag >= left {
                    (diag, 1)
                } else if up >= left {
                    (up, 2)
                } else {
                    (left, 3)
                };
                score[i * width + j] = best;
                dir[i * width + j] = step;
            }
        }

        // End gaps are free: the alignment ends at the best cell on the
        // last row or column.
        let mut end = (ql, tl);
        let mut end_score = score[ql * width + tl];
        for j in 0..=tl {
            if score[ql * width + j] > end_score {
                end_score = score[ql * width + j];
                end = (ql, j);
            }
        }
        for i in 0..=ql {
            if score[i * width + tl] > end_score {
                end_score = score[i * width + tl];
                end = (i, tl);
            }
        }

        let mut ops = Vec::new();
        let (mut i, mut j) = end;
        while i > 0 && j > 0 {
            match dir[i * width + j] {
                1 => {
                    ops.push(AlignOp::Match);
                    i -= 1;
                    j -= 1;
                }
                2 => {
                    ops.push(AlignOp::Insertion);
                    i -= 1;
                }
                3 => {
                    ops.push(AlignOp::Deletion);
                    j -= 1;
                }
                _ => break,
            }
        }
        ops.reverse();

        // Trim non-Match ends so the backtrace covers exactly the aligned
        // spans; the trimmed leading gaps advance the start positions.
        let (mut qs, mut ts) = (i, j);
        let mut lead = 0;
        for op in &ops {
            match op {
                AlignOp::Match => break,
                AlignOp::Insertion => qs += 1,
                AlignOp::Deletion => ts += 1,
            }
            lead += 1;
        }
        ops.drain(..lead);
        while matches!(ops.last(), Some(AlignOp::Insertion) | Some(AlignOp::Deletion)) {
            ops.pop();
        }
        if ops.is_empty() {
            return None;
        }
        Some((Backtrace::new(ops), qs, ts))
    }

    /// Score an established correspondence: iterative inlier refit in the
    /// TM-align manner, reporting the TM-score under the supplied
    /// `normalization` divisor plus the RMSD over all matched pairs.
    pub fn compute_tm_score(
        &self,
        target: &Structure,
        query_start: usize,
        target_start: usize,
        backtrace: &Backtrace,
        normalization: f32,
    ) -> Result<TmScoreResult> {
        if self.query.is_empty() {
            return Err(FoldscanError::InvalidState(
                "compute_tm_score called before init_query".to_string(),
            ));
        }
        if target.is_empty() {
            return Err(FoldscanError::LengthMismatch(
                "target has 0 residues".to_string(),
            ));
        }
        if backtrace.match_count() == 0 {
            return Err(FoldscanError::DegenerateAlignment(
                "alignment has no matched residues".to_string(),
            ));
        }
        if query_start + backtrace.query_span() > self.query.len() {
            return Err(FoldscanError::LengthMismatch(format!(
                "alignment consumes {} query residues from {} but the query has {}",
                backtrace.query_span(),
                query_start,
                self.query.len()
            )));
        }
        if target_start + backtrace.target_span() > target.len() {
            return Err(FoldscanError::LengthMismatch(format!(
                "alignment consumes {} target residues from {} but the target has {}",
                backtrace.target_span(),
                target_start,
                target.len()
            )));
        }

        let norm = f64::from(normalization.max(1.0));
        let d0v = d0(norm as usize);
        let pairs = backtrace.matched_pairs(query_start, target_start);
        let (qpts, tpts) = gather_pairs(&self.query, target.coords(), &pairs);

        let mut sp = match kabsch_fit(&qpts, &tpts) {
            Ok(sp) => sp,
            Err(_) => {
                return Ok(TmScoreResult {
                    tm_score: 0.0,
                    rmsd: 0.0,
                    superposition: Superposition::identity(),
                    converged: false,
                })
            }
        };

        // Refit on inlier pairs under a shrinking distance cutoff; the
        // full pair set is always re-scored so the best superposition
        // seen wins, even if a later refit overshoots.
        let mut best_sp = sp;
        let mut best_score = pair_score_sum(&qpts, &tpts, &sp, d0v) / norm;
        let mut cutoff = CUTOFF_START.max(d0v);
        let mut prev_inliers: Vec<usize> = Vec::new();
        for _ in 0..MAX_REFINE_ITERS {
            let mut inliers = Vec::with_capacity(qpts.len());
            for (idx, (q, t)) in qpts.iter().zip(&tpts).enumerate() {
                let p = sp.apply(t);
                let dx = p[0] - f64::from(q[0]);
                let dy = p[1] - f64::from(q[1]);
                let dz = p[2] - f64::from(q[2]);
                if (dx * dx + dy * dy + dz * dz).sqrt() < cutoff {
                    inliers.push(idx);
                }
            }
            if inliers.len() < 3 {
                cutoff += 0.5;
                continue;
            }
            let at_floor = cutoff <= CUTOFF_FLOOR.max(d0v);
            if inliers == prev_inliers && at_floor {
                break;
            }
            let sub_q: Vec<[f32; 3]> = inliers.iter().map(|&i| qpts[i]).collect();
            let sub_t: Vec<[f32; 3]> = inliers.iter().map(|&i| tpts[i]).collect();
            match kabsch_fit(&sub_q, &sub_t) {
                Ok(refit) => sp = refit,
                Err(_) => break,
            }
            let sc = pair_score_sum(&qpts, &tpts, &sp, d0v) / norm;
            if sc > best_score {
                best_score = sc;
                best_sp = sp;
            }
            prev_inliers = inliers;
            if !at_floor {
                cutoff -= 0.5;
            }
        }

        let rmsd = rmsd_under(&qpts, &tpts, &best_sp);
        let superposition = if self.mode.score_only {
            Superposition::identity()
        } else {
            best_sp
        };
        Ok(TmScoreResult {
            tm_score: best_score.min(1.0),
            rmsd,
            superposition,
            converged: true,
        })
    }
}

/// One-shot TM-score between two structures: builds an engine sized to
/// the pair, loads the query, aligns, and scores under the
/// shorter-length normalization.
pub fn compute_tm_score_pair(
    query: &Structure,
    target: &Structure,
    mode: AlignMode,
) -> Result<TmScoreResult> {
    let mut aligner = TmAligner::new(query.len().max(target.len()), mode);
    aligner.init_query(query)?;
    let summary = aligner.align(target)?;
    let norm = normalization(
        summary.backtrace.match_count(),
        query.len(),
        target.len(),
    );
    aligner.compute_tm_score(
        target,
        summary.query_start,
        summary.target_start,
        &summary.backtrace,
        norm,
    )
}

fn gather_pairs(
    query: &[[f32; 3]],
    target: &[[f32; 3]],
    pairs: &[(usize, usize)],
) -> (Vec<[f32; 3]>, Vec<[f32; 3]>) {
    let mut qpts = Vec::with_capacity(pairs.len());
    let mut tpts = Vec::with_capacity(pairs.len());
    for &(qi, ti) in pairs {
        qpts.push(query[qi]);
        tpts.push(target[ti]);
    }
    (qpts, tpts)
}

/// Sum over pairs of `1 / (1 + (d_i / d0)^2)` under a superposition of
/// the target points.
fn pair_score_sum(
    qpts: &[[f32; 3]],
    tpts: &[[f32; 3]],
    sp: &Superposition,
    d0v: f64,
) -> f64 {
    let d0_sq = d0v * d0v;
    qpts.iter()
        .zip(tpts)
        .map(|(q, t)| {
            let p = sp.apply(t);
            let dx = p[0] - f64::from(q[0]);
            let dy = p[1] - f64::from(q[1]);
            let dz = p[2] - f64::from(q[2]);
            1.0 / (1.0 + (dx * dx + dy * dy + dz * dz) / d0_sq)
        })
        .sum()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn helix(n: usize) -> Structure {
        let coords: Vec<[f32; 3]> = (0..n)
            .map(|i| {
                let theta = i as f32 * 100.0_f32.to_radians();
                [2.3 * theta.cos(), 2.3 * theta.sin(), 1.5 * i as f32]
            })
            .collect();
        Structure::new(coords, vec![b'A'; n]).unwrap()
    }

    #[test]
    fn d0_matches_reference_formula() {
        assert!((d0(50) - (1.24 * 35.0_f64.cbrt() - 1.8)).abs() < 1e-9);
        // Short chains floor at 0.5 instead of going negative.
        assert_eq!(d0(10), 0.5);
        assert_eq!(d0(0), 0.5);
    }

    #[test]
    fn normalization_uses_shorter_length() {
        assert_eq!(normalization(30, 50, 80), 50.0);
        assert_eq!(normalization(30, 80, 50), 50.0);
        // Fallbacks clamp to at least 1, never zero.
        assert_eq!(normalization(0, 0, 0), 1.0);
        assert_eq!(normalization(7, 0, 0), 7.0);
        assert_eq!(normalization(0, 0, 12), 12.0);
    }

    #[test]
    fn empty_inputs_rejected() {
        let mut aligner = TmAligner::new(100, AlignMode::default());
        let empty = Structure::new(vec![], vec![]).unwrap();
        assert!(matches!(
            aligner.init_query(&empty).unwrap_err(),
            FoldscanError::LengthMismatch(_)
        ));
        aligner.init_query(&helix(10)).unwrap();
        assert!(matches!(
            aligner.align(&empty).unwrap_err(),
            FoldscanError::LengthMismatch(_)
        ));
    }

    #[test]
    fn capacity_enforced() {
        let mut aligner = TmAligner::new(5, AlignMode::default());
        assert!(matches!(
            aligner.init_query(&helix(10)).unwrap_err(),
            FoldscanError::Capacity(_)
        ));
        aligner.init_query(&helix(5)).unwrap();
        assert!(matches!(
            aligner.align(&helix(10)).unwrap_err(),
            FoldscanError::Capacity(_)
        ));
    }

    #[test]
    fn align_before_init_is_invalid_state() {
        let aligner = TmAligner::new(100, AlignMode::default());
        assert!(matches!(
            aligner.align(&helix(10)).unwrap_err(),
            FoldscanError::InvalidState(_)
        ));
    }

    #[test]
    fn self_alignment_is_all_match() {
        let s = helix(50);
        let mut aligner = TmAligner::new(50, AlignMode::default());
        aligner.init_query(&s).unwrap();
        let summary = aligner.align(&s).unwrap();
        assert_eq!(summary.query_start, 0);
        assert_eq!(summary.target_start, 0);
        assert_eq!(summary.backtrace.match_count(), 50);
        assert!(summary.raw_score > 0.99);
    }

    #[test]
    fn empty_backtrace_rejected_in_scoring() {
        let s = helix(20);
        let mut aligner = TmAligner::new(20, AlignMode::default());
        aligner.init_query(&s).unwrap();
        let err = aligner
            .compute_tm_score(&s, 0, 0, &Backtrace::new(vec![]), 20.0)
            .unwrap_err();
        assert!(matches!(err, FoldscanError::DegenerateAlignment(_)));
    }

    #[test]
    fn overrunning_backtrace_rejected() {
        let s = helix(20);
        let mut aligner = TmAligner::new(30, AlignMode::default());
        aligner.init_query(&s).unwrap();
        let bt = Backtrace::new(vec![AlignOp::Match; 25]);
        let err = aligner.compute_tm_score(&s, 0, 0, &bt, 20.0).unwrap_err();
        assert!(matches!(err, FoldscanError::LengthMismatch(_)));
    }

    #[test]
    fn score_only_reports_identity_placeholder() {
        let s = helix(30);
        let offset: Vec<[f32; 3]> = s.coords().iter().map(|p| [p[0] + 5.0, p[1], p[2]]).collect();
        let shifted = Structure::new(offset, s.sequence().to_vec()).unwrap();
        let mode = AlignMode {
            fast: false,
            score_only: true,
        };
        let result = compute_tm_score_pair(&s, &shifted, mode).unwrap();
        assert!(result.tm_score > 0.99);
        for i in 0..3 {
            for j in 0..3 {
                let expected = if i == j { 1.0 } else { 0.0 };
                assert_eq!(result.superposition.rotation[i][j], expected);
            }
            assert_eq!(result.superposition.translation[i], 0.0);
        }
    }
}
