use image::{DynamicImage, ImageFormat, ImageReader};
use std::{
    collections::{BTreeMap, BTreeSet},
    io::{self, Cursor},
    path::{Path, PathBuf},
    process::Command,
};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::{
    config::ConvertCfg,
    io::{is_hidden, temp_sibling, write_atomic_blocking},
};

pub const STANDARD_EXTENSIONS: &[&str] = &["jpg", "jpeg", "png", "gif", "bmp", "tiff"];
pub const HEIC_EXTENSION: &str = "heic";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageKind {
    /// Readable by the oracle as-is.
    Standard,
    /// Container that has to be converted first.
    Heic,
}

impl ImageKind {
    pub fn from_name(name: &str) -> Option<Self> {
        let ext = Path::new(name).extension()?.to_str()?.to_ascii_lowercase();
        if STANDARD_EXTENSIONS.contains(&ext.as_str()) {
            Some(Self::Standard)
        } else if ext == HEIC_EXTENSION {
            Some(Self::Heic)
        } else {
            None
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageRecord {
    pub original_filename: String,
    pub stored_filename: String,
    pub extension: String,
    pub was_converted: bool,
}

/// What the oracle is about to see in a workspace.
#[derive(Debug, Default)]
pub struct Normalized {
    pub has_standard_images: bool,
    pub has_unconverted_proprietary: bool,
    /// stored name -> original name, identity for files that were not converted
    pub rename_map: BTreeMap<String, String>,
    pub records: Vec<ImageRecord>,
    pub unconverted: Vec<String>,
}

#[derive(Error, Debug)]
pub enum ConvertError {
    #[error("{converter} could not decode '{path}': {message}")]
    Decode { converter: &'static str, path: PathBuf, message: String },

    #[error("{converter} exited with {status}: {stderr}")]
    Tool { converter: &'static str, status: String, stderr: String },

    #[error("{converter} I/O error: {source}")]
    Io {
        converter: &'static str,
        #[source]
        source: io::Error,
    },
}

/// Turns one proprietary image file into a standard raster file.
pub trait Converter: Send + Sync {
    fn name(&self) -> &'static str;
    fn convert(&self, input: &Path, output: &Path) -> Result<(), ConvertError>;
}

/// In-process decoding through the `image` crate. Sniffs the content rather
/// than trusting the extension, so JPEG/PNG payloads saved as `.heic` convert.
pub struct NativeConverter;

impl Converter for NativeConverter {
    fn name(&self) -> &'static str { "native" }

    fn convert(&self, input: &Path, output: &Path) -> Result<(), ConvertError> {
        let decode_err = |message: String| ConvertError::Decode {
            converter: self.name(),
            path: input.to_path_buf(),
            message,
        };
        let img = ImageReader::open(input)
            .and_then(|r| r.with_guessed_format())
            .map_err(|e| ConvertError::Io { converter: self.name(), source: e })?
            .decode()
            .map_err(|e| decode_err(e.to_string()))?;

        let rgb = DynamicImage::ImageRgb8(img.to_rgb8());
        let mut buf = Vec::new();
        rgb.write_to(&mut Cursor::new(&mut buf), ImageFormat::Jpeg)
            .map_err(|e| decode_err(e.to_string()))?;
        write_atomic_blocking(output, &buf).map_err(|e| ConvertError::Io { converter: self.name(), source: e })
    }
}

/// External ImageMagick binary (`magick convert <in> <out>`).
pub struct MagickConverter {
    bin: PathBuf,
}

impl MagickConverter {
    pub fn new(bin: impl Into<PathBuf>) -> Self { Self { bin: bin.into() } }

    /// Use the configured binary, or look `magick` up on `PATH`.
    pub fn locate(configured: Option<&Path>) -> Option<Self> {
        match configured {
            Some(p) => Some(Self::new(p)),
            None => which::which("magick").ok().map(Self::new),
        }
    }
}

impl Converter for MagickConverter {
    fn name(&self) -> &'static str { "magick" }

    fn convert(&self, input: &Path, output: &Path) -> Result<(), ConvertError> {
        let tmp = temp_sibling(output, "jpg");
        let out = Command::new(&self.bin)
            .arg("convert")
            .arg(input)
            .arg(&tmp)
            .output()
            .map_err(|e| ConvertError::Io { converter: self.name(), source: e })?;
        if !out.status.success() {
            let _ = std::fs::remove_file(&tmp);
            return Err(ConvertError::Tool {
                converter: self.name(),
                status: out.status.to_string(),
                stderr: String::from_utf8_lossy(&out.stderr).trim().to_string(),
            });
        }
        std::fs::rename(&tmp, output).map_err(|e| {
            let _ = std::fs::remove_file(&tmp);
            ConvertError::Io { converter: self.name(), source: e }
        })
    }
}

pub struct FormatNormalizer {
    converters: Vec<Box<dyn Converter>>,
}

impl FormatNormalizer {
    /// Converters are tried in order; the first success wins.
    pub fn new(converters: Vec<Box<dyn Converter>>) -> Self { Self { converters } }

    pub fn from_cfg(cfg: &ConvertCfg) -> Self {
        let mut converters: Vec<Box<dyn Converter>> = Vec::new();
        if cfg.native {
            converters.push(Box::new(NativeConverter));
        }
        if cfg.magick {
            match MagickConverter::locate(cfg.magick_bin.as_deref()) {
                Some(m) => {
                    info!(bin = %m.bin.display(), "HEIC fallback converter available");
                    converters.push(Box::new(m));
                }
                None => warn!("ImageMagick not found; HEIC files the native decoder cannot read will be rejected"),
            }
        }
        Self::new(converters)
    }

    /// Scan `dir` once and convert every HEIC file in place.
    ///
    /// A missing directory normalizes to nothing.
    pub fn normalize(&self, dir: &Path) -> io::Result<Normalized> {
        let names = match list_files(dir) {
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Normalized::default()),
            Err(e) => return Err(e),
        };
        let mut taken: BTreeSet<String> = names.iter().map(|n| n.to_lowercase()).collect();
        let mut out = Normalized::default();

        for name in &names {
            let ext = Path::new(name)
                .extension()
                .and_then(|e| e.to_str())
                .unwrap_or_default()
                .to_ascii_lowercase();
            match ImageKind::from_name(name) {
                Some(ImageKind::Standard) => {
                    out.has_standard_images = true;
                    out.rename_map.insert(name.clone(), name.clone());
                    out.records.push(ImageRecord {
                        original_filename: name.clone(),
                        stored_filename: name.clone(),
                        extension: ext,
                        was_converted: false,
                    });
                }
                Some(ImageKind::Heic) => {
                    let target = converted_name(name, &taken);
                    let input = dir.join(name);
                    if self.convert(&input, &dir.join(&target)) {
                        taken.insert(target.to_lowercase());
                        if let Err(e) = std::fs::remove_file(&input) {
                            warn!(file = %input.display(), "could not remove converted original: {e}");
                        }
                        debug!(from = %name, to = %target, "converted HEIC");
                        out.has_standard_images = true;
                        out.rename_map.insert(target.clone(), name.clone());
                        out.records.push(ImageRecord {
                            original_filename: name.clone(),
                            stored_filename: target,
                            extension: ext,
                            was_converted: true,
                        });
                    } else {
                        out.has_unconverted_proprietary = true;
                        out.unconverted.push(name.clone());
                    }
                }
                None => debug!(file = %name, "ignoring non-image file"),
            }
        }
        Ok(out)
    }

    fn convert(&self, input: &Path, output: &Path) -> bool {
        for c in &self.converters {
            match c.convert(input, output) {
                Ok(()) => return true,
                Err(e) => debug!(converter = c.name(), "conversion attempt failed: {e}"),
            }
        }
        warn!(file = %input.display(), "no converter could handle file");
        false
    }
}

/// Visible regular files in `dir`, sorted so every scan sees the same order.
fn list_files(dir: &Path) -> io::Result<Vec<String>> {
    let mut names = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        if !entry.file_type()?.is_file() {
            continue;
        }
        if let Some(name) = entry.file_name().to_str() {
            if !is_hidden(name) {
                names.push(name.to_string());
            }
        }
    }
    names.sort();
    Ok(names)
}

/// `q.heic` -> `q.jpg`, unless that is taken; then `q.heic.jpg`, then `q-1.jpg`, `q-2.jpg`, ...
fn converted_name(original: &str, taken: &BTreeSet<String>) -> String {
    let stem = Path::new(original).file_stem().and_then(|s| s.to_str()).unwrap_or(original);
    let free = |c: &str| !taken.contains(&c.to_lowercase());

    let plain = format!("{stem}.jpg");
    if free(&plain) {
        return plain;
    }
    let suffixed = format!("{original}.jpg");
    if free(&suffixed) {
        return suffixed;
    }
    (1..)
        .map(|n| format!("{stem}-{n}.jpg"))
        .find(|c| free(c))
        .unwrap_or(suffixed)
}
