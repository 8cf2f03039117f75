use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum OracleKind {
    #[default]
    Perceptual,
    Http,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OracleCfg {
    pub kind: OracleKind,
    pub hash_bits: u32,
    pub threshold: u32,
    pub endpoint: Option<String>,
    pub timeout_secs: u64,
}

impl Default for OracleCfg {
    fn default() -> Self {
        Self { kind: OracleKind::Perceptual, hash_bits: 64, threshold: 6, endpoint: None, timeout_secs: 300 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConvertCfg {
    pub native: bool,
    pub magick: bool,
    pub magick_bin: Option<PathBuf>,
}

impl Default for ConvertCfg {
    fn default() -> Self { Self { native: true, magick: true, magick_bin: None } }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceCfg {
    pub bind: String,
    pub upload_dir: PathBuf,
    pub max_upload_mb: usize,
    pub oracle: OracleCfg,
    pub convert: ConvertCfg,
}

impl Default for ServiceCfg {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0:8000".into(),
            upload_dir: PathBuf::from("photo"),
            max_upload_mb: 512,
            oracle: OracleCfg::default(),
            convert: ConvertCfg::default(),
        }
    }
}

impl ServiceCfg {
    /// Defaults, then the YAML file (if any), then environment overrides.
    pub async fn load(path: Option<&Path>) -> Result<Self> {
        let mut cfg = match path {
            Some(p) => {
                let txt = tokio::fs::read_to_string(p)
                    .await
                    .with_context(|| format!("Failed to read config file: {}", p.display()))?;
                serde_yaml::from_str(&txt).context("Failed to parse config YAML")?
            }
            None => Self::default(),
        };
        cfg.apply_env(|k| std::env::var(k).ok())?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn apply_env(&mut self, var: impl Fn(&str) -> Option<String>) -> Result<()> {
        if let Some(dir) = var("UPLOAD_DIR") { self.upload_dir = PathBuf::from(dir); }
        if let Some(bind) = var("IMGDEDUP_BIND") { self.bind = bind; }
        if let Some(url) = var("IMGDEDUP_ORACLE_URL") {
            self.oracle.kind = OracleKind::Http;
            self.oracle.endpoint = Some(url);
        }
        if let Some(t) = var("IMGDEDUP_THRESHOLD") {
            self.oracle.threshold = t
                .trim()
                .parse()
                .with_context(|| format!("IMGDEDUP_THRESHOLD must be a non-negative integer, got {t:?}"))?;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if !(4..=1024).contains(&self.oracle.hash_bits) {
            bail!("oracle.hash_bits must be between 4 and 1024, got {}", self.oracle.hash_bits);
        }
        if self.oracle.kind == OracleKind::Http && self.oracle.endpoint.as_deref().map_or(true, str::is_empty) {
            bail!("oracle.kind is http but oracle.endpoint is not set");
        }
        if self.max_upload_mb == 0 {
            bail!("max_upload_mb must be greater than 0");
        }
        Ok(())
    }

    pub fn max_upload_bytes(&self) -> usize { self.max_upload_mb.saturating_mul(1024 * 1024) }
}
