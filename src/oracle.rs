use anyhow::Context;
use async_trait::async_trait;
use img_hash::{HashAlg, HasherConfig, ImageHash};
use serde::{Deserialize, Serialize};
use std::{
    collections::BTreeMap,
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};
use thiserror::Error;
use tracing::{debug, warn};

use crate::{
    config::{OracleCfg, OracleKind},
    io::is_hidden,
    normalize::ImageKind,
};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Candidate {
    pub name: String,
    pub score: f32,
}

impl Candidate {
    pub fn new(name: impl Into<String>, score: f32) -> Self {
        Self { name: name.into(), score }
    }
}

/// image name -> candidate duplicates, names as they exist on disk
pub type OracleOutput = BTreeMap<String, Vec<Candidate>>;

#[derive(Error, Debug)]
pub enum OracleError {
    /// Nothing in the directory could be processed at all.
    #[error("no image in the directory could be processed")]
    EmptyInput,

    #[error(transparent)]
    Fault(#[from] anyhow::Error),
}

/// Pairwise "these look alike" judgments over one directory of images.
/// Output need not be symmetric.
#[async_trait]
pub trait SimilarityOracle: Send + Sync {
    fn name(&self) -> &'static str;
    async fn find_duplicates(&self, dir: &Path) -> Result<OracleOutput, OracleError>;
}

pub fn from_cfg(cfg: &OracleCfg) -> anyhow::Result<Arc<dyn SimilarityOracle>> {
    Ok(match cfg.kind {
        OracleKind::Perceptual => Arc::new(PerceptualOracle::new(cfg.hash_bits, cfg.threshold)),
        OracleKind::Http => {
            let endpoint = cfg.endpoint.clone().context("http oracle needs an endpoint")?;
            Arc::new(HttpOracle::new(endpoint, Duration::from_secs(cfg.timeout_secs))?)
        }
    })
}

/// Near-duplicates by perceptual hash (gradient hash, Hamming distance).
pub struct PerceptualOracle {
    /// side of the square hash; 8 -> 64 bits
    size: u32,
    /// 0 -> exact hash match, 5..10 typical for lenient matching
    threshold: u32,
}

impl PerceptualOracle {
    /// `hash_bits` -> 64 (8x8) or 256 (16x16) etc. Larger = slower but more discriminative.
    pub fn new(hash_bits: u32, threshold: u32) -> Self {
        let size = ((hash_bits as f32).sqrt().round() as u32).max(2);
        Self { size, threshold }
    }
}

#[async_trait]
impl SimilarityOracle for PerceptualOracle {
    fn name(&self) -> &'static str { "perceptual" }

    async fn find_duplicates(&self, dir: &Path) -> Result<OracleOutput, OracleError> {
        let dir = dir.to_path_buf();
        let (size, threshold) = (self.size, self.threshold);
        tokio::task::spawn_blocking(move || hash_dir(&dir, size, threshold))
            .await
            .context("perceptual hashing task panicked")?
    }
}

fn hash_dir(dir: &Path, size: u32, threshold: u32) -> Result<OracleOutput, OracleError> {
    let hasher = HasherConfig::new().hash_alg(HashAlg::Gradient).hash_size(size, size).to_hasher();

    let mut names = Vec::new();
    for entry in std::fs::read_dir(dir).with_context(|| format!("reading {}", dir.display()))? {
        let name = entry.context("reading directory entry")?.file_name();
        if let Some(name) = name.to_str() {
            if !is_hidden(name) && ImageKind::from_name(name) == Some(ImageKind::Standard) {
                names.push(name.to_string());
            }
        }
    }
    names.sort();

    let mut hashes: Vec<(String, ImageHash)> = Vec::with_capacity(names.len());
    for name in names {
        match load_for_hashing(&dir.join(&name)) {
            Ok(img) => hashes.push((name, hasher.hash_image(&img))),
            Err(e) => warn!(file = %name, "skipping undecodable image: {e:#}"),
        }
    }
    if hashes.is_empty() {
        return Err(OracleError::EmptyInput);
    }

    let bits = (size * size) as f32;
    let mut out = OracleOutput::new();
    for (i, (name, hash)) in hashes.iter().enumerate() {
        let candidates = hashes
            .iter()
            .enumerate()
            .filter(|(j, _)| *j != i)
            .filter_map(|(_, (other, other_hash))| {
                let dist = hash.dist(other_hash);
                (dist <= threshold).then(|| Candidate::new(other.clone(), 1.0 - dist as f32 / bits))
            })
            .collect();
        out.insert(name.clone(), candidates);
    }
    debug!(images = hashes.len(), "perceptual hashing done");
    Ok(out)
}

// img_hash works on its own (older) `image` types, so decode with ours and
// hand over raw pixels.
fn load_for_hashing(path: &Path) -> anyhow::Result<img_hash::image::DynamicImage> {
    let rgba = image::open(path)?.to_rgba8();
    let (w, h) = rgba.dimensions();
    let buf = img_hash::image::RgbaImage::from_raw(w, h, rgba.into_raw()).context("pixel buffer size mismatch")?;
    Ok(img_hash::image::DynamicImage::ImageRgba8(buf))
}

/// External oracle service reached over HTTP.
///
/// `POST endpoint {"image_dir": ".."}` answers `{"a.jpg": [["b.jpg", 0.93]], ..}`;
/// 422 means nothing in the directory was processable.
pub struct HttpOracle {
    client: reqwest::Client,
    endpoint: String,
}

#[derive(Serialize)]
struct FindReq<'a> {
    image_dir: &'a Path,
}

impl HttpOracle {
    pub fn new(endpoint: String, timeout: Duration) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self { client, endpoint })
    }
}

#[async_trait]
impl SimilarityOracle for HttpOracle {
    fn name(&self) -> &'static str { "http" }

    async fn find_duplicates(&self, dir: &Path) -> Result<OracleOutput, OracleError> {
        let abs: PathBuf = tokio::fs::canonicalize(dir)
            .await
            .with_context(|| format!("resolving {}", dir.display()))?;
        let resp = self
            .client
            .post(&self.endpoint)
            .json(&FindReq { image_dir: &abs })
            .send()
            .await
            .context("oracle request failed")?;
        if resp.status() == reqwest::StatusCode::UNPROCESSABLE_ENTITY {
            return Err(OracleError::EmptyInput);
        }
        let raw: BTreeMap<String, Vec<(String, f32)>> = resp
            .error_for_status()
            .context("oracle returned an error status")?
            .json()
            .await
            .context("malformed oracle reply")?;
        Ok(raw
            .into_iter()
            .map(|(k, v)| (k, v.into_iter().map(|(name, score)| Candidate { name, score }).collect()))
            .collect())
    }
}
