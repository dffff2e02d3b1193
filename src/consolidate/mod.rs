//! Sleep consolidation: decay → prune → merge → extract → boost.
//!
//! Every step integrates from `last_consolidation_at`, never from the
//! absolute age of the data, so running the cycle twice in a row is a
//! no-op for the second run.

mod merge;

pub(crate) use merge::merge_pass;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{info, warn};

use crate::ai::Embedder;
use crate::db::{now, Memory, MemoryDB};
use crate::error::EngramError;
use crate::thresholds::{
    BOOST_FACTOR, BOOST_MIN_ACCESS, CONSOLIDATION_INTERVAL_DAYS, DECAY_RATE, MERGE_SIM,
    PRUNE_THRESHOLD,
};
use crate::util::days_between;

pub const LAST_CONSOLIDATION_KEY: &str = "last_consolidation_at";

#[derive(Debug, Clone)]
pub struct ConsolidateOptions {
    pub decay_rate: f64,
    pub prune_threshold: f64,
    pub merge_threshold: f64,
    pub boost_factor: f64,
    pub boost_min_access: i64,
    pub dry_run: bool,
}

impl Default for ConsolidateOptions {
    fn default() -> Self {
        Self {
            decay_rate: DECAY_RATE,
            prune_threshold: PRUNE_THRESHOLD,
            merge_threshold: MERGE_SIM,
            boost_factor: BOOST_FACTOR,
            boost_min_access: BOOST_MIN_ACCESS,
            dry_run: false,
        }
    }
}

#[derive(Debug, Default, Serialize)]
pub struct ConsolidateReport {
    pub decayed: usize,
    pub pruned: usize,
    pub merged: usize,
    pub extracted: usize,
    pub boosted: usize,
    pub elapsed_ms: u64,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub dry_run: bool,
}

fn last_consolidation(db: &MemoryDB) -> Option<DateTime<Utc>> {
    db.get_meta(LAST_CONSOLIDATION_KEY).and_then(|v| {
        DateTime::parse_from_rfc3339(&v)
            .map(|t| t.with_timezone(&Utc))
            .map_err(|e| warn!(value = %v, error = %e, "bad last_consolidation_at"))
            .ok()
    })
}

/// Run one sleep cycle. Any sub-step failure aborts before the
/// `last_consolidation_at` write, so a retried run re-integrates from the
/// same base.
pub async fn run_consolidation(
    db: &MemoryDB,
    embedder: &dyn Embedder,
    opts: &ConsolidateOptions,
) -> Result<ConsolidateReport, EngramError> {
    let started = std::time::Instant::now();
    let last = last_consolidation(db);
    let mut report = ConsolidateReport { dry_run: opts.dry_run, ..Default::default() };

    report.decayed = decay_step(db, last, opts.decay_rate, opts.dry_run)?;
    report.pruned = prune_step(db, opts.prune_threshold, opts.dry_run)?;
    report.merged = merge_pass(db, Some(embedder), opts.merge_threshold, opts.dry_run).await?;
    report.extracted = extract_step();
    report.boosted = boost_step(db, last, opts.boost_factor, opts.boost_min_access, opts.dry_run)?;

    if !opts.dry_run {
        db.set_meta(LAST_CONSOLIDATION_KEY, &now().to_rfc3339())?;
    }
    report.elapsed_ms = started.elapsed().as_millis() as u64;
    info!(
        decayed = report.decayed,
        pruned = report.pruned,
        merged = report.merged,
        boosted = report.boosted,
        elapsed_ms = report.elapsed_ms,
        dry_run = report.dry_run,
        "consolidation complete"
    );
    Ok(report)
}

/// Multiply strength by `rate^days` for every non-archived, non-permanent
/// memory, where days counts from `last_consolidation_at` (or, on the
/// first ever run, from the memory's own last access / creation).
fn decay_step(
    db: &MemoryDB,
    last: Option<DateTime<Utc>>,
    rate: f64,
    dry_run: bool,
) -> Result<usize, EngramError> {
    let permanent = db.permanent_ids()?;
    let ts = now();
    let mut updates: Vec<(i64, f64)> = Vec::new();
    for (id, strength, fallback_base) in db.decay_rows()? {
        if permanent.contains(&id) {
            continue;
        }
        let base = last.unwrap_or(fallback_base);
        let days = days_between(base, ts);
        let decayed = (strength * rate.powf(days)).clamp(0.0, 1.0);
        if (strength - decayed).abs() > 1e-9 {
            updates.push((id, decayed));
        }
    }
    let count = updates.len();
    if !dry_run {
        db.set_strengths(&updates)?;
    }
    Ok(count)
}

/// Archive every non-permanent memory whose strength fell below the
/// threshold.
fn prune_step(db: &MemoryDB, threshold: f64, dry_run: bool) -> Result<usize, EngramError> {
    let candidates = db.prune_candidates(threshold)?;
    if !dry_run {
        for &id in &candidates {
            db.set_archived(id, true)?;
        }
    }
    Ok(candidates.len())
}

/// Placeholder for LLM-driven pattern discovery; a stable no-op today.
fn extract_step() -> usize {
    0
}

/// Reinforce frequently-accessed memories — but at most once per day, so
/// back-to-back cycles don't compound the boost.
fn boost_step(
    db: &MemoryDB,
    last: Option<DateTime<Utc>>,
    factor: f64,
    min_access: i64,
    dry_run: bool,
) -> Result<usize, EngramError> {
    if let Some(last) = last {
        if days_between(last, now()) < 1.0 {
            return Ok(0);
        }
    }
    let mut updates: Vec<(i64, f64)> = Vec::new();
    for (id, strength) in db.boost_candidates(min_access)? {
        let boosted = (strength * factor).min(1.0);
        if (boosted - strength).abs() > 1e-9 {
            updates.push((id, boosted));
        }
    }
    let count = updates.len();
    if !dry_run {
        db.set_strengths(&updates)?;
    }
    Ok(count)
}

/// Whether a cycle is due: at least `interval_days` since the last run,
/// or no run recorded yet.
pub fn should_consolidate(db: &MemoryDB, interval_days: f64) -> bool {
    match last_consolidation(db) {
        Some(last) => days_between(last, now()) >= interval_days,
        None => true,
    }
}

pub fn default_interval_days() -> f64 {
    CONSOLIDATION_INTERVAL_DAYS
}

#[derive(Debug, Serialize)]
pub struct ConsolidationPreview {
    /// The ten weakest non-archived memories, next in line for pruning.
    pub weakest: Vec<Memory>,
    /// How many pairs the merge step would fold together.
    pub merge_candidates: usize,
}

pub async fn consolidation_preview(
    db: &MemoryDB,
    opts: &ConsolidateOptions,
) -> Result<ConsolidationPreview, EngramError> {
    let weakest = db.weakest(10)?;
    let merge_candidates = merge_pass(db, None, opts.merge_threshold, true).await?;
    Ok(ConsolidationPreview { weakest, merge_candidates })
}
