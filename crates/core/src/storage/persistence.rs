//! The ready index image: one word buffer shared by memory and disk.
//!
//! A built index is assembled straight into the file layout, so `save` is a
//! single write and `load` is either a memory map of the file (zero-copy; many
//! processes share one resident copy) or one read into an owned buffer. Writes
//! go to a temporary sibling that is renamed over the target.

use crate::config::{FORMAT_VERSION, HEADER_WORDS};
use crate::distance::Metric;
use crate::error::{IndexError, Result};
use crate::forest::{Forest, ForestView, NodeArena, NodeLayout};
use crate::storage::format::{word_bytes, words_crc, BodyLayout, Header};
use crate::store::ItemVectors;
use memmap2::Mmap;
use std::fs::{self, File};
use std::io::{BufWriter, Read, Write};
use std::path::{Path, PathBuf};

/// Backing storage of an image.
#[derive(Debug)]
enum Words {
    Owned(Vec<u32>),
    Mapped(Mmap),
}

impl Words {
    fn as_slice(&self) -> &[u32] {
        match self {
            Words::Owned(words) => words,
            // Length and alignment are checked before a map is wrapped.
            Words::Mapped(map) => bytemuck::try_cast_slice(&map[..]).unwrap_or(&[]),
        }
    }
}

/// A validated, immutable index: header, forest, and item vectors.
#[derive(Debug)]
pub struct IndexImage {
    words: Words,
    header: Header,
    body: BodyLayout,
}

impl IndexImage {
    /// Lays out a freshly built forest and its items as a file image.
    pub fn assemble(
        metric: Metric,
        layout: NodeLayout,
        seed: u64,
        items: ItemVectors<'_>,
        forest: &Forest,
    ) -> Result<Self> {
        let too_large = |what: &str| IndexError::InvalidConfig(format!("{what} exceeds u32"));
        let mut header = Header {
            version: FORMAT_VERSION,
            dimension: u32::try_from(layout.dimension).map_err(|_| too_large("dimension"))?,
            metric,
            bucket_size: u32::try_from(layout.bucket_size).map_err(|_| too_large("bucket size"))?,
            stride: u32::try_from(layout.stride).map_err(|_| too_large("node stride"))?,
            n_items: u32::try_from(items.len()).map_err(|_| too_large("item count"))?,
            n_trees: u32::try_from(forest.roots.len()).map_err(|_| too_large("tree count"))?,
            n_nodes: u32::try_from(forest.arena.len()).map_err(|_| too_large("node count"))?,
            seed,
            body_crc: 0,
        };
        let body = header.body_layout()?;

        let mut words = Vec::with_capacity(body.total);
        words.extend_from_slice(&[0u32; HEADER_WORDS]);
        words.extend_from_slice(&forest.roots);
        words.extend_from_slice(forest.arena.words());
        words.extend_from_slice(bytemuck::cast_slice::<f32, u32>(items.data()));
        words.extend_from_slice(bytemuck::cast_slice::<f32, u32>(items.norms()));
        debug_assert_eq!(words.len(), body.total);

        header.body_crc = words_crc(&words[HEADER_WORDS..]);
        words[..HEADER_WORDS].copy_from_slice(&header.encode());

        Ok(Self {
            words: Words::Owned(words),
            header,
            body,
        })
    }

    /// Opens `path`, memory-mapping it where possible.
    ///
    /// Mapping is only attempted on little-endian targets; if it fails the file
    /// is read into memory instead.
    pub fn load(path: &Path) -> Result<Self> {
        let file = File::open(path)?;
        let len = checked_file_len(&file)?;
        if cfg!(target_endian = "little") {
            // SAFETY: the map is read-only; callers must not truncate the file
            // while the index is loaded.
            match unsafe { Mmap::map(&file) } {
                Ok(map) if bytemuck::try_cast_slice::<u8, u32>(&map[..]).is_ok() => {
                    return Self::from_words(Words::Mapped(map));
                }
                Ok(_) => tracing::warn!(?path, "mapped index is misaligned, reading instead"),
                Err(e) => tracing::warn!(?path, error = %e, "mmap failed, reading index instead"),
            }
        }
        Self::from_words(Words::Owned(read_words(file, len)?))
    }

    /// Reads `path` fully into owned memory.
    pub fn read(path: &Path) -> Result<Self> {
        let file = File::open(path)?;
        let len = checked_file_len(&file)?;
        Self::from_words(Words::Owned(read_words(file, len)?))
    }

    fn from_words(words: Words) -> Result<Self> {
        let slice = words.as_slice();
        let header = Header::decode(slice)?;
        let body = header.body_layout()?;
        if slice.len() != body.total {
            return Err(IndexError::CorruptFormat(format!(
                "file holds {} words, header describes {}",
                slice.len(),
                body.total
            )));
        }
        let image = Self {
            words,
            header,
            body,
        };
        image.validate()?;
        Ok(image)
    }

    fn validate(&self) -> Result<()> {
        let forest = self.forest();
        forest
            .arena
            .validate(forest.roots, self.header.n_items as usize)
    }

    /// Writes the image to `path` atomically (temporary file, then rename).
    pub fn save(&self, path: &Path) -> Result<()> {
        let tmp = tmp_path(path);
        let written = write_words(&tmp, self.words.as_slice());
        if let Err(e) = written {
            let _ = fs::remove_file(&tmp);
            return Err(e);
        }
        if let Err(e) = fs::rename(&tmp, path) {
            let _ = fs::remove_file(&tmp);
            return Err(e.into());
        }
        Ok(())
    }

    pub fn header(&self) -> &Header {
        &self.header
    }

    pub fn metric(&self) -> Metric {
        self.header.metric
    }

    pub fn dimension(&self) -> usize {
        self.header.dimension as usize
    }

    pub fn n_items(&self) -> usize {
        self.header.n_items as usize
    }

    pub fn n_trees(&self) -> usize {
        self.header.n_trees as usize
    }

    pub fn node_count(&self) -> usize {
        self.header.n_nodes as usize
    }

    /// Whether the image is served from a memory map.
    pub fn is_mapped(&self) -> bool {
        matches!(self.words, Words::Mapped(_))
    }

    /// Size of the image in bytes.
    pub fn byte_len(&self) -> usize {
        self.body.total * 4
    }

    pub fn forest(&self) -> ForestView<'_> {
        let words = self.words.as_slice();
        ForestView {
            roots: &words[self.body.roots.clone()],
            arena: NodeArena::new(&words[self.body.arena.clone()], self.header.node_layout()),
        }
    }

    pub fn items(&self) -> ItemVectors<'_> {
        let words = self.words.as_slice();
        ItemVectors::new(
            bytemuck::cast_slice(&words[self.body.vectors.clone()]),
            bytemuck::cast_slice(&words[self.body.norms.clone()]),
            self.dimension(),
        )
    }
}

/// Fully checks an index file, including the body checksum that `load` skips.
pub fn verify_index_file(path: &Path) -> Result<Header> {
    let image = IndexImage::read(path)?;
    let words = image.words.as_slice();
    let crc = words_crc(&words[HEADER_WORDS..]);
    if crc != image.header.body_crc {
        return Err(IndexError::CorruptFormat(format!(
            "body checksum mismatch: stored {:#010x}, computed {crc:#010x}",
            image.header.body_crc
        )));
    }
    Ok(image.header)
}

fn checked_file_len(file: &File) -> Result<usize> {
    let len = file.metadata()?.len();
    let len = usize::try_from(len)
        .map_err(|_| IndexError::CorruptFormat(format!("file of {len} bytes is too large")))?;
    if len % 4 != 0 || len < HEADER_WORDS * 4 {
        return Err(IndexError::CorruptFormat(format!(
            "file length {len} is not a whole number of words or is shorter than the header"
        )));
    }
    Ok(len)
}

fn read_words(mut file: File, len: usize) -> Result<Vec<u32>> {
    let mut words = vec![0u32; len / 4];
    file.read_exact(bytemuck::cast_slice_mut(&mut words))?;
    if cfg!(target_endian = "big") {
        for w in &mut words {
            *w = u32::from_le(*w);
        }
    }
    Ok(words)
}

fn write_words(path: &Path, words: &[u32]) -> Result<()> {
    let mut out = BufWriter::new(File::create(path)?);
    out.write_all(&word_bytes(words))?;
    let file = out.into_inner().map_err(|e| e.into_error())?;
    file.sync_all()?;
    Ok(())
}

fn tmp_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(".tmp");
    PathBuf::from(name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::forest::build_forest;
    use crate::search::search;
    use crate::store::VectorStore;

    fn image(metric: Metric) -> IndexImage {
        let mut store = VectorStore::new(3);
        for id in 0..64u32 {
            let x = id as f32;
            store.add_item(id, &[x.sin(), x.cos(), x * 0.01]).unwrap();
        }
        let layout = NodeLayout::new(3, 4);
        let forest = build_forest(store.view(), metric, layout, 3, 8, 0).unwrap();
        IndexImage::assemble(metric, layout, 8, store.view(), &forest).unwrap()
    }

    fn write_raw(path: &Path, words: &[u32]) {
        fs::write(path, &*word_bytes(words)).unwrap();
    }

    #[test]
    fn test_save_load_preserves_image() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("index.rpf");
        let built = image(Metric::Angular);
        built.save(&path).unwrap();
        assert!(!tmp_path(&path).exists());

        let loaded = IndexImage::load(&path).unwrap();
        assert_eq!(loaded.header(), built.header());
        assert_eq!(loaded.words.as_slice(), built.words.as_slice());
        assert_eq!(loaded.items().vector(5), built.items().vector(5));
        assert_eq!(fs::metadata(&path).unwrap().len() as usize, built.byte_len());
    }

    #[test]
    fn test_read_path_is_owned() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("index.rpf");
        image(Metric::Euclidean).save(&path).unwrap();
        let loaded = IndexImage::read(&path).unwrap();
        assert!(!loaded.is_mapped());
        assert_eq!(loaded.n_trees(), 3);
        assert_eq!(loaded.n_items(), 64);
    }

    #[test]
    fn test_truncated_file_is_corrupt() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("index.rpf");
        let built = image(Metric::Euclidean);
        let words = built.words.as_slice();
        write_raw(&path, &words[..words.len() - 1]);
        assert!(matches!(
            IndexImage::load(&path),
            Err(IndexError::CorruptFormat(_))
        ));

        fs::write(&path, [1u8, 2, 3]).unwrap();
        assert!(matches!(
            IndexImage::load(&path),
            Err(IndexError::CorruptFormat(_))
        ));
    }

    #[test]
    fn test_bad_magic_is_corrupt() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("index.rpf");
        let mut words = image(Metric::Angular).words.as_slice().to_vec();
        words[0] = u32::from_le_bytes(*b"NOPE");
        write_raw(&path, &words);
        let err = IndexImage::load(&path).unwrap_err();
        assert!(err.to_string().contains("magic"), "{err}");
    }

    #[test]
    fn test_body_corruption_caught_by_verify() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("index.rpf");
        let built = image(Metric::Euclidean);
        built.save(&path).unwrap();
        assert_eq!(verify_index_file(&path).unwrap(), *built.header());

        // Flip a norm: structurally valid, so load accepts it.
        let mut words = built.words.as_slice().to_vec();
        let last = words.len() - 1;
        words[last] ^= 0x0000_0100;
        write_raw(&path, &words);
        assert!(IndexImage::load(&path).is_ok());
        let err = verify_index_file(&path).unwrap_err();
        assert!(err.to_string().contains("body checksum"), "{err}");
    }

    #[test]
    fn test_cyclic_child_rejected_on_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("index.rpf");
        let built = image(Metric::Euclidean);
        let mut words = built.words.as_slice().to_vec();
        // Root of tree 0 is a split; point its left child back at itself.
        let arena_start = built.body.arena.start;
        assert_eq!(words[arena_start], 1);
        words[arena_start + 2] = 0;
        write_raw(&path, &words);
        assert!(matches!(
            IndexImage::load(&path),
            Err(IndexError::CorruptFormat(_))
        ));
    }

    #[test]
    fn test_shared_children_rejected_on_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("index.rpf");
        let built = image(Metric::Euclidean);
        let stride = built.header().stride as usize;
        let arena_start = built.body.arena.start;
        let words = built.words.as_slice();
        assert_eq!(words[arena_start], 1, "root of tree 0 should be a split");
        let inner = (1..built.node_count())
            .map(|node| arena_start + node * stride)
            .find(|&rec| words[rec] == 1)
            .expect("a split below the root");

        let mut same = words.to_vec();
        same[arena_start + 3] = same[arena_start + 2];
        write_raw(&path, &same);
        let err = IndexImage::load(&path).unwrap_err();
        assert!(err.to_string().contains("both children"), "{err}");

        // Root's right child redirected to a node that already has a parent.
        let mut shared = words.to_vec();
        shared[arena_start + 3] = shared[inner + 2];
        write_raw(&path, &shared);
        let err = IndexImage::read(&path).unwrap_err();
        assert!(matches!(err, IndexError::CorruptFormat(_)), "{err}");
    }

    #[test]
    fn test_mapped_load_matches_read() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("index.rpf");
        let metric = Metric::Angular;
        image(metric).save(&path).unwrap();

        let mapped = IndexImage::load(&path).unwrap();
        let owned = IndexImage::read(&path).unwrap();
        assert_eq!(mapped.is_mapped(), cfg!(target_endian = "little"));
        assert!(!owned.is_mapped());
        assert_eq!(mapped.words.as_slice(), owned.words.as_slice());

        for id in [0u32, 17, 63] {
            let query = owned.items().vector(id).to_vec();
            let a = search(mapped.forest(), mapped.items(), metric, &query, 5, Some(20));
            let b = search(owned.forest(), owned.items(), metric, &query, 5, Some(20));
            assert_eq!(a.len(), 5);
            assert_eq!(a, b);
        }
    }
}
