//! The two-phase index object.
//!
//! An [`AnnIndex`] starts in the ingest phase, where items are added to a
//! growable store. A successful [`AnnIndex::build`] or [`AnnIndex::load`]
//! moves it to the ready phase, where the forest and items are one immutable
//! image and queries take `&self`, so any number of threads may search at once.
//! [`AnnIndex::unload`] releases the image.
//!
//! Each transition computes the new state completely before replacing the old
//! one: a failed build or load leaves the index exactly as it was.

use crate::config::{DEFAULT_SEED, MAX_DIMENSION};
use crate::distance::Metric;
use crate::error::{IndexError, Result};
use crate::forest::{build_forest, NodeLayout};
use crate::search::{search, Neighbor};
use crate::storage::IndexImage;
use crate::store::{ItemVectors, VectorStore};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Logs build and persistence progress at `info` when verbose, `debug` otherwise.
macro_rules! progress {
    ($verbose:expr, $($arg:tt)+) => {
        if $verbose {
            tracing::info!($($arg)+)
        } else {
            tracing::debug!($($arg)+)
        }
    };
}

fn default_seed() -> u64 {
    DEFAULT_SEED
}

/// Creation-time settings of an index.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexConfig {
    pub dimension: usize,
    pub metric: Metric,
    /// Maximum items per leaf. Defaults to `dimension + 3`.
    #[serde(default)]
    pub bucket_size: Option<usize>,
    #[serde(default = "default_seed")]
    pub seed: u64,
    /// Threads used by `build`; 0 uses the global rayon pool.
    #[serde(default)]
    pub build_threads: usize,
}

impl IndexConfig {
    pub fn new(dimension: usize, metric: Metric) -> Self {
        Self {
            dimension,
            metric,
            bucket_size: None,
            seed: DEFAULT_SEED,
            build_threads: 0,
        }
    }

    /// Rejects a dimension outside `1..=MAX_DIMENSION` and a bucket size
    /// outside `1..=MAX_BUCKET_SIZE`.
    pub fn validate(&self) -> Result<()> {
        if self.dimension == 0 || self.dimension > MAX_DIMENSION {
            return Err(IndexError::InvalidConfig(format!(
                "dimension {} outside 1..={MAX_DIMENSION}",
                self.dimension
            )));
        }
        NodeLayout::try_new(self.dimension, self.bucket_or_default())?;
        Ok(())
    }

    fn bucket_or_default(&self) -> usize {
        self.bucket_size
            .unwrap_or_else(|| NodeLayout::default_bucket_size(self.dimension))
    }

    /// Node geometry for this configuration.
    pub fn layout(&self) -> NodeLayout {
        NodeLayout::new(self.dimension, self.bucket_or_default())
    }
}

#[derive(Debug)]
enum Phase {
    Ingest(VectorStore),
    Ready(IndexImage),
    Unloaded,
}

/// Approximate nearest-neighbor index over a forest of random-projection trees.
///
/// ```no_run
/// use rpforest_core::{AnnIndex, Metric};
///
/// let mut index = AnnIndex::new(2, Metric::Euclidean)?;
/// index.add_item(0, &[0.0, 0.0])?;
/// index.add_item(1, &[1.0, 0.0])?;
/// index.build(10)?;
/// let nearest = index.get_nns_by_vector(&[0.1, 0.0], 1, None)?;
/// assert_eq!(nearest[0].id, 0);
/// # Ok::<(), rpforest_core::IndexError>(())
/// ```
#[derive(Debug)]
pub struct AnnIndex {
    config: IndexConfig,
    phase: Phase,
    verbose: bool,
}

impl AnnIndex {
    /// Creates an empty index in the ingest phase.
    pub fn new(dimension: usize, metric: Metric) -> Result<Self> {
        Self::with_config(IndexConfig::new(dimension, metric))
    }

    pub fn with_config(config: IndexConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            phase: Phase::Ingest(VectorStore::new(config.dimension)),
            config,
            verbose: false,
        })
    }

    /// Opens a saved index file as a ready index, taking dimension and metric
    /// from the file.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let image = IndexImage::load(path)?;
        let header = *image.header();
        let config = IndexConfig {
            dimension: header.dimension as usize,
            metric: header.metric,
            bucket_size: Some(header.bucket_size as usize),
            seed: header.seed,
            build_threads: 0,
        };
        tracing::debug!(?path, items = header.n_items, trees = header.n_trees, "opened index");
        Ok(Self {
            config,
            phase: Phase::Ready(image),
            verbose: false,
        })
    }

    pub fn config(&self) -> &IndexConfig {
        &self.config
    }

    /// Seeds tree construction. Only allowed before `build`.
    pub fn set_seed(&mut self, seed: u64) -> Result<()> {
        match self.phase {
            Phase::Ingest(_) => {
                self.config.seed = seed;
                Ok(())
            }
            Phase::Ready(_) => Err(IndexError::BuildAlreadyFinalized),
            Phase::Unloaded => Err(IndexError::IndexNotLoaded),
        }
    }

    /// Toggles progress logging at `info` level. Never changes results.
    pub fn verbose(&mut self, flag: bool) {
        self.verbose = flag;
    }

    /// Stores `vector` under `id`.
    ///
    /// Ids beyond the current count zero-fill the gap; gap ids may be added
    /// later. A gap of more than [`MAX_GAP_FILL`](crate::config::MAX_GAP_FILL)
    /// values fails with `OutOfRange`. A failed call leaves the index unchanged.
    pub fn add_item(&mut self, id: u32, vector: &[f32]) -> Result<()> {
        match &mut self.phase {
            Phase::Ingest(store) => store.add_item(id, vector),
            Phase::Ready(_) => Err(IndexError::BuildAlreadyFinalized),
            Phase::Unloaded => Err(IndexError::IndexNotLoaded),
        }
    }

    /// Builds `n_trees` trees and makes the index ready.
    pub fn build(&mut self, n_trees: usize) -> Result<()> {
        let store = match &self.phase {
            Phase::Ingest(store) => store,
            Phase::Ready(_) => return Err(IndexError::BuildAlreadyFinalized),
            Phase::Unloaded => return Err(IndexError::IndexNotLoaded),
        };
        if store.is_empty() {
            return Err(IndexError::EmptyIndex);
        }
        if n_trees == 0 {
            return Err(IndexError::InvalidConfig("tree count must be at least 1".into()));
        }

        let layout = self.config.layout();
        let start = std::time::Instant::now();
        let forest = build_forest(
            store.view(),
            self.config.metric,
            layout,
            n_trees,
            self.config.seed,
            self.config.build_threads,
        )?;
        let image = IndexImage::assemble(
            self.config.metric,
            layout,
            self.config.seed,
            store.view(),
            &forest,
        )?;
        progress!(
            self.verbose,
            items = store.len(),
            trees = n_trees,
            nodes = forest.stats.nodes,
            leaves = forest.stats.leaves,
            max_depth = forest.stats.max_depth,
            forced_splits = forest.stats.forced_splits,
            elapsed_ms = start.elapsed().as_millis() as u64,
            "built forest"
        );
        self.phase = Phase::Ready(image);
        Ok(())
    }

    /// Writes the ready index to `path`. A failed save leaves no usable file.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let image = self.ready()?;
        image.save(path)?;
        progress!(
            self.verbose,
            ?path,
            bytes = image.byte_len(),
            crc = %format!("{:#010x}", image.header().body_crc),
            "saved index"
        );
        Ok(())
    }

    /// Replaces the contents of this index with the file at `path`.
    ///
    /// The file must match this index's dimension and metric. Any items still
    /// being ingested are discarded on success.
    pub fn load(&mut self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let image = IndexImage::load(path)?;
        if image.dimension() != self.config.dimension {
            return Err(IndexError::DimensionMismatch {
                expected: self.config.dimension,
                actual: image.dimension(),
            });
        }
        if image.metric() != self.config.metric {
            return Err(IndexError::MetricMismatch {
                expected: self.config.metric,
                actual: image.metric(),
            });
        }
        let header = *image.header();
        progress!(
            self.verbose,
            ?path,
            items = header.n_items,
            trees = header.n_trees,
            mapped = image.is_mapped(),
            "loaded index"
        );
        self.config.bucket_size = Some(header.bucket_size as usize);
        self.config.seed = header.seed;
        self.phase = Phase::Ready(image);
        Ok(())
    }

    /// Releases the index. Later operations fail with `IndexNotLoaded` until
    /// the next `load`.
    pub fn unload(&mut self) {
        if !matches!(self.phase, Phase::Unloaded) {
            progress!(self.verbose, "unloaded index");
        }
        self.phase = Phase::Unloaded;
    }

    /// Exact distance between two stored items.
    pub fn get_distance(&self, i: u32, j: u32) -> Result<f32> {
        self.items()?.distance(self.config.metric, i, j)
    }

    /// The `n` approximate nearest items to item `id`, itself included.
    pub fn get_nns_by_item(
        &self,
        id: u32,
        n: usize,
        search_k: Option<usize>,
    ) -> Result<Vec<Neighbor>> {
        let image = self.ready()?;
        let items = image.items();
        items.check(id)?;
        Ok(search(
            image.forest(),
            items,
            self.config.metric,
            items.vector(id),
            n,
            search_k,
        ))
    }

    /// The `n` approximate nearest items to `query`, nearest first.
    ///
    /// `search_k` is the number of candidates to gather before ranking;
    /// `None` means `n * n_trees`.
    pub fn get_nns_by_vector(
        &self,
        query: &[f32],
        n: usize,
        search_k: Option<usize>,
    ) -> Result<Vec<Neighbor>> {
        let image = self.ready()?;
        if query.len() != self.config.dimension {
            return Err(IndexError::DimensionMismatch {
                expected: self.config.dimension,
                actual: query.len(),
            });
        }
        Ok(search(
            image.forest(),
            image.items(),
            self.config.metric,
            query,
            n,
            search_k,
        ))
    }

    /// Number of items. Zero after `unload`.
    pub fn get_n_items(&self) -> usize {
        match &self.phase {
            Phase::Ingest(store) => store.len(),
            Phase::Ready(image) => image.n_items(),
            Phase::Unloaded => 0,
        }
    }

    /// Number of trees. Zero before `build` and after `unload`.
    pub fn get_n_trees(&self) -> usize {
        match &self.phase {
            Phase::Ready(image) => image.n_trees(),
            _ => 0,
        }
    }

    /// Copy of the vector stored under `id`.
    pub fn get_item(&self, id: u32) -> Result<Vec<f32>> {
        let items = self.items()?;
        items.check(id)?;
        Ok(items.vector(id).to_vec())
    }

    pub fn dimension(&self) -> usize {
        self.config.dimension
    }

    pub fn metric(&self) -> Metric {
        self.config.metric
    }

    pub fn is_ready(&self) -> bool {
        matches!(self.phase, Phase::Ready(_))
    }

    /// Whether the ready image is a memory map of its file.
    pub fn is_mapped(&self) -> bool {
        matches!(&self.phase, Phase::Ready(image) if image.is_mapped())
    }

    /// Total nodes across all trees.
    pub fn node_count(&self) -> usize {
        match &self.phase {
            Phase::Ready(image) => image.node_count(),
            _ => 0,
        }
    }

    fn ready(&self) -> Result<&IndexImage> {
        match &self.phase {
            Phase::Ready(image) => Ok(image),
            Phase::Ingest(_) => Err(IndexError::IndexNotBuilt),
            Phase::Unloaded => Err(IndexError::IndexNotLoaded),
        }
    }

    fn items(&self) -> Result<ItemVectors<'_>> {
        match &self.phase {
            Phase::Ingest(store) => Ok(store.view()),
            Phase::Ready(image) => Ok(image.items()),
            Phase::Unloaded => Err(IndexError::IndexNotLoaded),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MAX_BUCKET_SIZE;

    fn small_index() -> AnnIndex {
        let mut index = AnnIndex::new(2, Metric::Euclidean).unwrap();
        index.add_item(0, &[0.0, 0.0]).unwrap();
        index.add_item(1, &[1.0, 0.0]).unwrap();
        index.add_item(2, &[0.0, 1.0]).unwrap();
        index
    }

    #[test]
    fn test_index_is_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<AnnIndex>();
    }

    #[test]
    fn test_invalid_configs() {
        assert!(matches!(
            AnnIndex::new(0, Metric::Angular),
            Err(IndexError::InvalidConfig(_))
        ));
        let mut config = IndexConfig::new(4, Metric::Angular);
        config.bucket_size = Some(0);
        assert!(AnnIndex::with_config(config).is_err());
    }

    #[test]
    fn test_oversized_bucket_rejected_before_build() {
        for bucket in [usize::MAX, MAX_BUCKET_SIZE + 1] {
            let mut config = IndexConfig::new(4, Metric::Euclidean);
            config.bucket_size = Some(bucket);
            assert!(
                matches!(
                    AnnIndex::with_config(config),
                    Err(IndexError::InvalidConfig(_))
                ),
                "bucket {bucket}"
            );
        }

        let mut config = IndexConfig::new(2, Metric::Euclidean);
        config.bucket_size = Some(MAX_BUCKET_SIZE);
        let mut index = AnnIndex::with_config(config).unwrap();
        index.add_item(0, &[0.0, 1.0]).unwrap();
        index.add_item(1, &[1.0, 0.0]).unwrap();
        index.build(1).unwrap();
        assert_eq!(index.get_nns_by_item(0, 2, None).unwrap().len(), 2);
    }

    #[test]
    fn test_build_empty_index_fails() {
        let mut index = AnnIndex::new(3, Metric::Angular).unwrap();
        assert!(matches!(index.build(4), Err(IndexError::EmptyIndex)));
        assert!(!index.is_ready());
    }

    #[test]
    fn test_zero_trees_rejected() {
        let mut index = small_index();
        assert!(matches!(index.build(0), Err(IndexError::InvalidConfig(_))));
        assert!(!index.is_ready());
    }

    #[test]
    fn test_queries_before_build_fail() {
        let index = small_index();
        assert!(matches!(
            index.get_nns_by_item(0, 1, None),
            Err(IndexError::IndexNotBuilt)
        ));
        assert!(matches!(
            index.get_nns_by_vector(&[0.0, 0.0], 1, None),
            Err(IndexError::IndexNotBuilt)
        ));
        assert!(matches!(
            index.save("unused.rpf"),
            Err(IndexError::IndexNotBuilt)
        ));
        // Stored vectors are readable while ingesting.
        assert_eq!(index.get_item(1).unwrap(), vec![1.0, 0.0]);
        assert!((index.get_distance(0, 1).unwrap() - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_mutation_after_build_fails() {
        let mut index = small_index();
        index.build(2).unwrap();
        assert!(matches!(
            index.add_item(3, &[1.0, 1.0]),
            Err(IndexError::BuildAlreadyFinalized)
        ));
        assert!(matches!(index.build(2), Err(IndexError::BuildAlreadyFinalized)));
        assert!(matches!(
            index.set_seed(1),
            Err(IndexError::BuildAlreadyFinalized)
        ));
        assert_eq!(index.get_n_items(), 3);
        assert_eq!(index.get_n_trees(), 2);
    }

    #[test]
    fn test_query_errors_when_ready() {
        let mut index = small_index();
        index.build(2).unwrap();
        assert!(matches!(
            index.get_nns_by_item(3, 1, None),
            Err(IndexError::OutOfRange { id: 3, n_items: 3 })
        ));
        assert!(matches!(
            index.get_nns_by_vector(&[0.0], 1, None),
            Err(IndexError::DimensionMismatch {
                expected: 2,
                actual: 1
            })
        ));
        assert!(matches!(
            index.get_item(7),
            Err(IndexError::OutOfRange { .. })
        ));
    }

    #[test]
    fn test_unload_blocks_everything() {
        let mut index = small_index();
        index.build(2).unwrap();
        index.unload();
        assert_eq!(index.get_n_items(), 0);
        assert_eq!(index.get_n_trees(), 0);
        assert!(matches!(
            index.get_nns_by_item(0, 1, None),
            Err(IndexError::IndexNotLoaded)
        ));
        assert!(matches!(
            index.get_distance(0, 1),
            Err(IndexError::IndexNotLoaded)
        ));
        assert!(matches!(
            index.add_item(0, &[0.0, 0.0]),
            Err(IndexError::IndexNotLoaded)
        ));
        assert!(matches!(index.build(1), Err(IndexError::IndexNotLoaded)));
    }

    #[test]
    fn test_verbose_does_not_change_results() {
        let mut quiet = small_index();
        let mut loud = small_index();
        loud.verbose(true);
        quiet.build(3).unwrap();
        loud.build(3).unwrap();
        assert_eq!(
            quiet.get_nns_by_vector(&[0.2, 0.1], 3, None).unwrap(),
            loud.get_nns_by_vector(&[0.2, 0.1], 3, None).unwrap()
        );
    }

    #[test]
    fn test_config_serde_defaults() {
        let config: IndexConfig =
            serde_json::from_str(r#"{"dimension": 8, "metric": "angular"}"#).unwrap();
        assert_eq!(config, IndexConfig::new(8, Metric::Angular));
        assert_eq!(config.layout().bucket_size, 11);
    }
}
