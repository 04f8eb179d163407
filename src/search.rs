//! Linear-scan search pipeline.
//!
//! Ranks every candidate in a collection against a preloaded query:
//! decode stored coordinates, align, score, apply score and coverage
//! thresholds, then sort descending by TM-score with the candidate key
//! as the deterministic tiebreak. This is the unoptimized correctness
//! baseline; prefiltering and indexing live outside this crate.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use indexmap::IndexMap;
use log::debug;
use ordered_float::OrderedFloat;
use rayon::prelude::*;

use crate::backtrace::Backtrace;
use crate::coord_codec;
use crate::error::{FoldscanError, Result};
use crate::structure::Structure;
use crate::tm_align::{normalization, AlignMode, TmAligner};

/// Candidate coordinates as handed over by the database layer: either
/// already decoded or still in the 16-bit encoded block form, decoded
/// lazily during the scan.
#[derive(Debug, Clone)]
pub enum CandidateCoords {
    Decoded(Vec<[f32; 3]>),
    Encoded(Vec<u8>),
}

/// One database entry. Entries without coordinates are skipped by the
/// scan rather than treated as errors.
#[derive(Debug, Clone)]
pub struct CandidateRecord {
    pub key: u32,
    pub name: String,
    pub sequence: Vec<u8>,
    pub coords: Option<CandidateCoords>,
}

/// Insertion-ordered, key-addressable candidate collection.
#[derive(Debug, Default)]
pub struct CandidateSet {
    entries: IndexMap<u32, CandidateRecord>,
}

impl CandidateSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, record: CandidateRecord) {
        self.entries.insert(record.key, record);
    }

    pub fn get(&self, key: u32) -> Option<&CandidateRecord> {
        self.entries.get(&key)
    }

    pub fn get_by_index(&self, index: usize) -> Option<&CandidateRecord> {
        self.entries.get_index(index).map(|(_, record)| record)
    }

    pub fn keys(&self) -> impl Iterator<Item = u32> + '_ {
        self.entries.keys().copied()
    }

    pub fn iter(&self) -> impl Iterator<Item = &CandidateRecord> {
        self.entries.values()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// One accepted candidate, ready for ranking.
#[derive(Debug, Clone)]
pub struct SearchHit {
    pub key: u32,
    pub name: String,
    pub tm_score: f32,
    pub rmsd: f32,
    pub alignment_length: usize,
    pub query_coverage: f32,
    pub target_coverage: f32,
    pub backtrace: Backtrace,
}

/// Scan configuration.
#[derive(Debug, Clone)]
pub struct SearchConfig {
    pub tm_score_threshold: f32,
    pub coverage_threshold: f32,
    pub max_hits: usize,
    /// Engine capacity; candidates longer than this are skipped.
    pub max_len: usize,
    pub mode: AlignMode,
}

impl Default for SearchConfig {
    fn default() -> Self {
        SearchConfig {
            tm_score_threshold: 0.5,
            coverage_threshold: 0.0,
            max_hits: 1000,
            max_len: 50_000,
            mode: AlignMode::default(),
        }
    }
}

impl SearchConfig {
    pub fn with_tm_score_threshold(mut self, threshold: f32) -> Self {
        self.tm_score_threshold = threshold;
        self
    }

    pub fn with_coverage_threshold(mut self, threshold: f32) -> Self {
        self.coverage_threshold = threshold;
        self
    }

    pub fn with_max_hits(mut self, max_hits: usize) -> Self {
        self.max_hits = max_hits;
        self
    }

    pub fn with_max_len(mut self, max_len: usize) -> Self {
        self.max_len = max_len;
        self
    }

    pub fn with_mode(mut self, mode: AlignMode) -> Self {
        self.mode = mode;
        self
    }
}

/// Pipeline lifecycle. `Scanning` is transient inside `search`, which
/// runs to `Done`; callers observe `Idle`, `QueryLoaded`, or `Done`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineState {
    Idle,
    QueryLoaded,
    Scanning,
    Done,
}

/// Query-against-collection search driver.
///
/// Owns its alignment engine, so independent pipelines can scan
/// concurrently without sharing state.
pub struct SearchPipeline {
    config: SearchConfig,
    engine: TmAligner,
    query: Option<Structure>,
    state: PipelineState,
    cancel: Arc<AtomicBool>,
}

impl SearchPipeline {
    pub fn new(config: SearchConfig) -> Self {
        let engine = TmAligner::new(config.max_len, config.mode);
        SearchPipeline {
            config,
            engine,
            query: None,
            state: PipelineState::Idle,
            cancel: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn state(&self) -> PipelineState {
        self.state
    }

    /// Handle for cooperative cancellation, checked between candidates
    /// (never mid-alignment). A cancelled scan returns the hits gathered
    /// so far.
    pub fn cancel_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.cancel)
    }

    /// One-time query preprocessing. Must complete before `search`.
    pub fn load_query(&mut self, query: Structure) -> Result<()> {
        self.engine.init_query(&query)?;
        self.query = Some(query);
        self.state = PipelineState::QueryLoaded;
        Ok(())
    }

    /// Scan `candidates`, returning accepted hits ranked descending by
    /// TM-score with ascending key as the tiebreak, truncated to
    /// `max_hits` only after the full sort.
    pub fn search(&mut self, candidates: &CandidateSet) -> Result<Vec<SearchHit>> {
        if !matches!(self.state, PipelineState::QueryLoaded | PipelineState::Done) {
            return Err(FoldscanError::InvalidState(
                "search called before load_query".to_string(),
            ));
        }
        let query_len = self
            .query
            .as_ref()
            .ok_or_else(|| {
                FoldscanError::InvalidState("search called before load_query".to_string())
            })?
            .len();
        self.state = PipelineState::Scanning;

        let engine = &self.engine;
        let config = &self.config;
        let cancel = &self.cancel;
        let records: Vec<&CandidateRecord> = candidates.iter().collect();
        let mut hits: Vec<SearchHit> = records
            .into_par_iter()
            .filter_map(|record| {
                if cancel.load(Ordering::Relaxed) {
                    return None;
                }
                score_candidate(engine, config, query_len, record)
            })
            .collect();

        hits.sort_by_key(|hit| (std::cmp::Reverse(OrderedFloat(hit.tm_score)), hit.key));
        hits.truncate(self.config.max_hits);
        self.state = PipelineState::Done;
        Ok(hits)
    }
}

/// Align and score one candidate; any per-candidate failure drops the
/// candidate from the results instead of aborting the scan.
fn score_candidate(
    engine: &TmAligner,
    config: &SearchConfig,
    query_len: usize,
    record: &CandidateRecord,
) -> Option<SearchHit> {
    let coords = match &record.coords {
        None => return None,
        Some(CandidateCoords::Decoded(coords)) => coords.clone(),
        Some(CandidateCoords::Encoded(block)) => {
            match coord_codec::decode(block, record.sequence.len()) {
                Ok(coords) => coords,
                Err(e) => {
                    debug!("skipping candidate {}: {}", record.key, e);
                    return None;
                }
            }
        }
    };
    let target = match Structure::new(coords, record.sequence.clone()) {
        Ok(target) => target,
        Err(e) => {
            debug!("skipping candidate {}: {}", record.key, e);
            return None;
        }
    };
    let summary = match engine.align(&target) {
        Ok(summary) => summary,
        Err(e) => {
            debug!("skipping candidate {}: {}", record.key, e);
            return None;
        }
    };
    let aligned = summary.backtrace.match_count();
    let norm = normalization(aligned, query_len, target.len());
    let result = match engine.compute_tm_score(
        &target,
        summary.query_start,
        summary.target_start,
        &summary.backtrace,
        norm,
    ) {
        Ok(result) => result,
        Err(e) => {
            debug!("skipping candidate {}: {}", record.key, e);
            return None;
        }
    };

    let tm_score = result.tm_score as f32;
    let query_coverage = aligned as f32 / query_len as f32;
    let target_coverage = aligned as f32 / target.len() as f32;
    if tm_score < config.tm_score_threshold
        || query_coverage < config.coverage_threshold
        || target_coverage < config.coverage_threshold
    {
        return None;
    }
    Some(SearchHit {
        key: record.key,
        name: record.name.clone(),
        tm_score,
        rmsd: result.rmsd as f32,
        alignment_length: aligned,
        query_coverage,
        target_coverage,
        backtrace: summary.backtrace,
    })
}

/// One-shot convenience: load `query`, scan `candidates`, return the
/// ranked hits.
pub fn search_structures(
    query: Structure,
    candidates: &CandidateSet,
    config: SearchConfig,
) -> Result<Vec<SearchHit>> {
    let mut pipeline = SearchPipeline::new(config);
    pipeline.load_query(query)?;
    pipeline.search(candidates)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn search_before_load_query_is_invalid_state() {
        let mut pipeline = SearchPipeline::new(SearchConfig::default());
        let err = pipeline.search(&CandidateSet::new()).unwrap_err();
        assert!(matches!(err, FoldscanError::InvalidState(_)));
        assert_eq!(pipeline.state(), PipelineState::Idle);
    }

    #[test]
    fn candidate_set_is_key_and_index_addressable() {
        let mut set = CandidateSet::new();
        for key in [7u32, 3, 9] {
            set.insert(CandidateRecord {
                key,
                name: format!("entry{key}"),
                sequence: b"AG".to_vec(),
                coords: None,
            });
        }
        assert_eq!(set.len(), 3);
        // Insertion order is preserved, independent of key order.
        assert_eq!(set.get_by_index(0).unwrap().key, 7);
        assert_eq!(set.get_by_index(2).unwrap().key, 9);
        assert_eq!(set.get(3).unwrap().name, "entry3");
        assert_eq!(set.keys().collect::<Vec<_>>(), vec![7, 3, 9]);
    }

    #[test]
    fn config_builders_compose() {
        let config = SearchConfig::default()
            .with_tm_score_threshold(0.7)
            .with_coverage_threshold(0.8)
            .with_max_hits(5);
        assert_eq!(config.tm_score_threshold, 0.7);
        assert_eq!(config.coverage_threshold, 0.8);
        assert_eq!(config.max_hits, 5);
    }
}
