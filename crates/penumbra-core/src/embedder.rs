// ─────────────────────────────────────────────────────────────────────
// Director-Class AI — Embedder Interface
// ─────────────────────────────────────────────────────────────────────
//! Text → vector capability consumed by the semantic clusterer and the
//! analyzers.
//!
//! In production a sentence-embedding model sits behind this trait,
//! either in-process or behind an inference server. `NgramEmbedder`
//! is a deterministic, model-free backend for testing and offline use.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;

use penumbra_types::{PenumbraError, PenumbraResult};

/// Trait for embedding backends.
///
/// Failures are reported as `PenumbraError::EmbeddingUnavailable`; callers
/// degrade rather than abort.
pub trait Embedder: Send + Sync {
    fn embed(&self, text: &str) -> PenumbraResult<Vec<f32>>;

    /// Embed several texts at once. Backends with a native batch path
    /// should override this.
    fn embed_batch(&self, texts: &[&str]) -> PenumbraResult<Vec<Vec<f32>>> {
        texts.iter().map(|t| self.embed(t)).collect()
    }
}

/// Cosine similarity; 0.0 when either vector has zero norm or the
/// dimensions differ.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f64 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let mut dot = 0.0f64;
    let mut na = 0.0f64;
    let mut nb = 0.0f64;
    for (&x, &y) in a.iter().zip(b) {
        let (x, y) = (x as f64, y as f64);
        dot += x * y;
        na += x * x;
        nb += y * y;
    }
    if na <= 0.0 || nb <= 0.0 {
        return 0.0;
    }
    (dot / (na.sqrt() * nb.sqrt())).clamp(-1.0, 1.0)
}

/// Map a cosine similarity in [-1, 1] to a relevance in [0, 1].
#[inline]
pub fn similarity_to_unit(similarity: f64) -> f64 {
    ((similarity + 1.0) / 2.0).clamp(0.0, 1.0)
}

/// Deterministic character n-gram hashing embedder (no model required).
///
/// Lower-cases and collapses whitespace first, so tokenizer variants such
/// as `" Paris"` and `"paris"` embed identically.
pub struct NgramEmbedder {
    dim: usize,
    n: usize,
}

impl Default for NgramEmbedder {
    fn default() -> Self {
        Self { dim: 512, n: 3 }
    }
}

impl NgramEmbedder {
    pub fn new(dim: usize, n: usize) -> Self {
        Self { dim: dim.max(1), n: n.max(1) }
    }

    fn normalise(text: &str) -> String {
        text.split_whitespace()
            .collect::<Vec<_>>()
            .join(" ")
            .to_lowercase()
    }
}

/// FNV-1a over the UTF-8 bytes of a char window.
fn fnv1a(chars: &[char]) -> u64 {
    let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
    let mut buf = [0u8; 4];
    for c in chars {
        for b in c.encode_utf8(&mut buf).bytes() {
            hash ^= b as u64;
            hash = hash.wrapping_mul(0x0100_0000_01b3);
        }
    }
    hash
}

impl Embedder for NgramEmbedder {
    fn embed(&self, text: &str) -> PenumbraResult<Vec<f32>> {
        let mut v = vec![0.0f32; self.dim];
        let norm_text = Self::normalise(text);
        if norm_text.is_empty() {
            return Ok(v);
        }
        let chars: Vec<char> = std::iter::once('^')
            .chain(norm_text.chars())
            .chain(std::iter::once('$'))
            .collect();
        let n = self.n.min(chars.len());
        for window in chars.windows(n) {
            let h = fnv1a(window);
            v[(h % self.dim as u64) as usize] += 1.0;
        }
        let norm = v.iter().map(|x| x * x).sum::<f32>().sqrt();
        if norm > 0.0 {
            for x in &mut v {
                *x /= norm;
            }
        }
        Ok(v)
    }
}

/// External embedder that calls a host function.
///
/// Lets the host route embedding to whatever model it already runs.
type EmbedFn = Box<dyn Fn(&str) -> Result<Vec<f32>, String> + Send + Sync>;

pub struct ExternalEmbedder {
    embed_fn: EmbedFn,
}

impl ExternalEmbedder {
    pub fn new(embed_fn: impl Fn(&str) -> Result<Vec<f32>, String> + Send + Sync + 'static) -> Self {
        Self { embed_fn: Box::new(embed_fn) }
    }
}

impl Embedder for ExternalEmbedder {
    fn embed(&self, text: &str) -> PenumbraResult<Vec<f32>> {
        (self.embed_fn)(text).map_err(PenumbraError::EmbeddingUnavailable)
    }
}

/// Memoising wrapper: token texts repeat heavily across steps.
///
/// Thread-safe: the cache is guarded by a `parking_lot::Mutex`. When the
/// cache reaches `capacity` it is cleared wholesale.
pub struct CachedEmbedder {
    inner: Arc<dyn Embedder>,
    cache: Mutex<HashMap<String, Vec<f32>>>,
    capacity: usize,
}

impl CachedEmbedder {
    pub fn new(inner: Arc<dyn Embedder>, capacity: usize) -> Self {
        Self {
            inner,
            cache: Mutex::new(HashMap::new()),
            capacity: capacity.max(1),
        }
    }

    pub fn cached_len(&self) -> usize {
        self.cache.lock().len()
    }

    fn store(&self, text: &str, vector: &[f32]) {
        let mut cache = self.cache.lock();
        if cache.len() >= self.capacity {
            cache.clear();
        }
        cache.insert(text.to_string(), vector.to_vec());
    }
}

impl Embedder for CachedEmbedder {
    fn embed(&self, text: &str) -> PenumbraResult<Vec<f32>> {
        if let Some(v) = self.cache.lock().get(text) {
            return Ok(v.clone());
        }
        let v = self.inner.embed(text)?;
        self.store(text, &v);
        Ok(v)
    }

    fn embed_batch(&self, texts: &[&str]) -> PenumbraResult<Vec<Vec<f32>>> {
        let mut out: Vec<Option<Vec<f32>>> = {
            let cache = self.cache.lock();
            texts.iter().map(|t| cache.get(*t).cloned()).collect()
        };
        let missing: Vec<usize> = (0..texts.len()).filter(|&i| out[i].is_none()).collect();
        if !missing.is_empty() {
            let query: Vec<&str> = missing.iter().map(|&i| texts[i]).collect();
            let fresh = self.inner.embed_batch(&query)?;
            if fresh.len() != query.len() {
                return Err(PenumbraError::EmbeddingUnavailable(format!(
                    "backend returned {} vectors for {} texts",
                    fresh.len(),
                    query.len()
                )));
            }
            for (&i, v) in missing.iter().zip(fresh) {
                self.store(texts[i], &v);
                out[i] = Some(v);
            }
        }
        Ok(out.into_iter().flatten().collect())
    }
}
