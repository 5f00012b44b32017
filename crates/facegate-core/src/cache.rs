//! Per-identity mean encodings, rebuilt lazily from the dataset.
//!
//! Readers get an immutable [`CacheSnapshot`] behind an `Arc`. A snapshot is
//! stale once the TTL has elapsed since its build or once [`invalidate`]
//! has been called after its build started; the next reader then rebuilds.
//! Rebuilds happen under a mutex so concurrent stale readers collapse into
//! one build, and the finished snapshot replaces the old one in a single swap.
//!
//! [`invalidate`]: EncodingCache::invalidate

use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};

use crate::dataset::DatasetStore;
use crate::encoder::FaceEncoder;
use crate::types::{Embedding, IdentityEncoding};

/// Default time-to-live of a built snapshot.
pub const DEFAULT_TTL: Duration = Duration::from_secs(300);

/// One complete build of the cache.
#[derive(Debug)]
pub struct CacheSnapshot {
    identities: Vec<IdentityEncoding>,
    images_encoded: usize,
    generation: u64,
    built_at: Instant,
    built_at_utc: DateTime<Utc>,
}

impl CacheSnapshot {
    /// Identities in name order.
    pub fn identities(&self) -> &[IdentityEncoding] {
        &self.identities
    }

    pub fn persons_count(&self) -> usize {
        self.identities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.identities.is_empty()
    }

    /// Images that produced an encoding during the build.
    pub fn images_encoded(&self) -> usize {
        self.images_encoded
    }

    pub fn built_at(&self) -> DateTime<Utc> {
        self.built_at_utc
    }
}

pub struct EncodingCache {
    dataset: DatasetStore,
    encoder: Arc<dyn FaceEncoder>,
    ttl: Duration,
    published: RwLock<Option<Arc<CacheSnapshot>>>,
    rebuild: Mutex<()>,
    generation: AtomicU64,
    builds: AtomicU64,
}

impl EncodingCache {
    pub fn new(dataset: DatasetStore, encoder: Arc<dyn FaceEncoder>, ttl: Duration) -> Self {
        Self {
            dataset,
            encoder,
            ttl,
            published: RwLock::new(None),
            rebuild: Mutex::new(()),
            generation: AtomicU64::new(0),
            builds: AtomicU64::new(0),
        }
    }

    pub fn dataset(&self) -> &DatasetStore {
        &self.dataset
    }

    /// Current snapshot, rebuilding first if it is missing or stale.
    ///
    /// Blocks the caller for the duration of a rebuild.
    pub fn snapshot(&self) -> Arc<CacheSnapshot> {
        if let Some(fresh) = self.fresh_snapshot() {
            return fresh;
        }

        let _guard = self.rebuild.lock().unwrap_or_else(PoisonError::into_inner);
        // Another caller may have rebuilt while we waited.
        if let Some(fresh) = self.fresh_snapshot() {
            return fresh;
        }

        let generation = self.generation.load(Ordering::Acquire);
        let snapshot = Arc::new(self.build(generation));
        *self.published.write().unwrap_or_else(PoisonError::into_inner) = Some(snapshot.clone());
        snapshot
    }

    /// Last published snapshot without triggering a rebuild.
    pub fn peek(&self) -> Option<Arc<CacheSnapshot>> {
        self.published
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Mark every existing snapshot stale. The rebuild is deferred to the next reader.
    pub fn invalidate(&self) {
        let generation = self.generation.fetch_add(1, Ordering::AcqRel) + 1;
        tracing::info!(generation, "encoding cache invalidated");
    }

    /// Number of builds performed so far.
    pub fn build_count(&self) -> u64 {
        self.builds.load(Ordering::Acquire)
    }

    fn fresh_snapshot(&self) -> Option<Arc<CacheSnapshot>> {
        let published = self.peek()?;
        let current_generation = self.generation.load(Ordering::Acquire);
        (published.generation == current_generation && published.built_at.elapsed() <= self.ttl)
            .then_some(published)
    }

    fn build(&self, generation: u64) -> CacheSnapshot {
        let started = Instant::now();
        let records = self.dataset.identities().unwrap_or_else(|e| {
            tracing::warn!(
                root = %self.dataset.root().display(),
                error = %e,
                "dataset listing failed; building empty cache"
            );
            Vec::new()
        });

        let mut identities = Vec::with_capacity(records.len());
        let mut images_encoded = 0;
        for record in records {
            let encodings: Vec<Embedding> = record
                .images
                .iter()
                .filter_map(|path| self.encode_sample(path))
                .collect();
            images_encoded += encodings.len();

            match Embedding::mean(&encodings) {
                Some(embedding) => identities.push(IdentityEncoding {
                    name: record.name,
                    embedding,
                    samples: encodings.len(),
                }),
                None => tracing::debug!(identity = %record.name, "no usable samples; identity excluded"),
            }
        }

        self.builds.fetch_add(1, Ordering::AcqRel);
        tracing::info!(
            persons = identities.len(),
            images = images_encoded,
            generation,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "encoding cache built"
        );

        CacheSnapshot {
            identities,
            images_encoded,
            generation,
            built_at: Instant::now(),
            built_at_utc: Utc::now(),
        }
    }

    /// Encoding of the first face in one sample image, if any.
    fn encode_sample(&self, path: &Path) -> Option<Embedding> {
        let image = match image::open(path) {
            Ok(image) => image.to_rgb8(),
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "sample image could not be decoded");
                return None;
            }
        };

        match self.encoder.encode_faces(&image) {
            Ok(faces) => {
                let first = faces.into_iter().next();
                if first.is_none() {
                    tracing::debug!(path = %path.display(), "no face in sample image");
                }
                first.map(|face| face.embedding)
            }
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "sample image could not be encoded");
                None
            }
        }
    }
}
