/// Tunables shared across components. The similarity hierarchy matters:
/// auto-link (loose) < merge (tight) — merging destroys a record, linking
/// only annotates it.

/// Embedding width. Constant across the whole database; enforced at every
/// blob write.
pub const EMBED_DIM: usize = 1024;

/// Write path: fold a new memory into an existing one at or above this
/// cosine similarity.
pub const MERGE_SIM: f64 = 0.92;

/// Write path: create a `related_to` edge to neighbours at or above this.
pub const AUTO_LINK_SIM: f64 = 0.70;

/// Maximum automatic edges created per insert.
pub const MAX_AUTO_LINKS: usize = 3;

/// Extra neighbours probed beyond MAX_AUTO_LINKS so that self-hits and
/// sub-threshold candidates don't starve the link budget.
pub const AUTO_LINK_PROBE_EXTRA: usize = 5;

/// Reciprocal rank fusion constant.
pub const RRF_K: f64 = 60.0;

/// Characters-per-token divisor for the budget estimator.
pub const CHARS_PER_TOKEN: f64 = 3.5;

/// Consolidation defaults.
pub const DECAY_RATE: f64 = 0.95;
pub const PRUNE_THRESHOLD: f64 = 0.05;
pub const BOOST_FACTOR: f64 = 1.1;
pub const BOOST_MIN_ACCESS: i64 = 3;
pub const CONSOLIDATION_INTERVAL_DAYS: f64 = 3.0;

/// Strength multiplier applied to a memory that absorbs a near-duplicate
/// on the write path.
pub const MERGE_REINFORCE: f64 = 1.1;

/// The tag that exempts a memory from decay and prune.
pub const PERMANENT_TAG: &str = "permanent";

/// Query-embedding LRU capacity.
pub const EMBED_CACHE_CAP: usize = 128;

/// Validation caps.
pub const MAX_CONTENT_LEN: usize = 16 * 1024;
pub const MAX_TAGS: usize = 20;
pub const MAX_TAG_LEN: usize = 64;
