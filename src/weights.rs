use std::collections::HashMap;
use std::fmt;
use std::fs::{self, File};
use std::io::{self, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use clap::ValueEnum;
use indicatif::{ProgressBar, ProgressStyle};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, warn};

use crate::errors::{Result, SegError, WeightFailureReason};

const CHECKPOINT_BASE_URL: &str = "https://dl.fbaipublicfiles.com/segment_anything";
const DOWNLOAD_TIMEOUT_SECS: u64 = 3600;
const CHUNK_SIZE: usize = 64 * 1024;

/// Published Segment Anything checkpoints.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, ValueEnum, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelVariant {
    /// Same checkpoint as `vit_h`.
    Default,
    #[value(name = "vit_h")]
    VitH,
    #[value(name = "vit_l")]
    VitL,
    #[value(name = "vit_b")]
    VitB,
}

impl ModelVariant {
    pub const fn file_name(self) -> &'static str {
        match self {
            Self::Default | Self::VitH => "sam_vit_h_4b8939.pth",
            Self::VitL => "sam_vit_l_0b3195.pth",
            Self::VitB => "sam_vit_b_01ec64.pth",
        }
    }

    pub fn url(self) -> String {
        format!("{}/{}", CHECKPOINT_BASE_URL, self.file_name())
    }
}

impl fmt::Display for ModelVariant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Default => "default",
            Self::VitH => "vit_h",
            Self::VitL => "vit_l",
            Self::VitB => "vit_b",
        })
    }
}

/// Failure while streaming a remote file.
#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed")]
    Network(#[source] Box<dyn std::error::Error + Send + Sync>),
    #[error("write failed")]
    Io(#[from] io::Error),
}

/// Source of weight bytes.
pub trait WeightFetcher: Send + Sync {
    /// Stream the body at `url` into `sink` and return the number of bytes written.
    fn fetch(&self, url: &str, sink: &mut dyn Write) -> std::result::Result<u64, FetchError>;
}

/// Blocking HTTP download with a byte progress bar.
pub struct HttpFetcher {
    client: reqwest::blocking::Client,
}

impl HttpFetcher {
    pub fn new() -> Result<Self> {
        let client = reqwest::blocking::Client::builder()
            .timeout(Duration::from_secs(DOWNLOAD_TIMEOUT_SECS))
            .build()
            .map_err(|e| SegError::Configuration {
                message: format!("HTTP client setup failed: {}", e),
            })?;
        Ok(Self { client })
    }
}

impl WeightFetcher for HttpFetcher {
    fn fetch(&self, url: &str, sink: &mut dyn Write) -> std::result::Result<u64, FetchError> {
        let mut response = self
            .client
            .get(url)
            .send()
            .and_then(|response| response.error_for_status())
            .map_err(|e| FetchError::Network(Box::new(e)))?;

        let pb = match response.content_length() {
            Some(len) => ProgressBar::new(len),
            None => ProgressBar::new_spinner(),
        };
        pb.set_style(
            ProgressStyle::default_bar()
                .template(
                    "{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {bytes}/{total_bytes} ({eta})",
                )
                .unwrap_or_else(|_| ProgressStyle::default_bar())
                .progress_chars("#>-"),
        );

        let mut buffer = vec![0u8; CHUNK_SIZE];
        let mut written = 0u64;
        loop {
            let n = match response.read(&mut buffer) {
                Ok(0) => break,
                Ok(n) => n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    pb.abandon();
                    return Err(FetchError::Network(Box::new(e)));
                }
            };
            sink.write_all(&buffer[..n])?;
            written += n as u64;
            pb.inc(n as u64);
        }
        pb.finish_and_clear();
        Ok(written)
    }
}

/// `<user cache dir>/interactive-seg`, or a relative directory when the
/// platform has no cache dir.
pub fn default_cache_root() -> PathBuf {
    dirs::cache_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("interactive-seg")
}

/// Local store of downloaded checkpoints.
///
/// Resolving the same file from several threads downloads it once; the other
/// callers wait on the file's lock and then find it cached.
pub struct WeightCache<F: WeightFetcher = HttpFetcher> {
    root: PathBuf,
    fetcher: F,
    locks: Mutex<HashMap<&'static str, Arc<Mutex<()>>>>,
}

impl<F: WeightFetcher> WeightCache<F> {
    pub fn new(root: impl Into<PathBuf>, fetcher: F) -> Self {
        Self {
            root: root.into(),
            fetcher,
            locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn path_for(&self, variant: ModelVariant) -> PathBuf {
        self.root.join(variant.file_name())
    }

    /// Local path of `variant`'s checkpoint, downloading it first if needed.
    pub fn resolve(&self, variant: ModelVariant) -> Result<PathBuf> {
        let file_lock = self
            .locks
            .lock()
            .entry(variant.file_name())
            .or_default()
            .clone();
        let _guard = file_lock.lock();

        let path = self.path_for(variant);
        if path.is_file() {
            return Ok(path);
        }

        fs::create_dir_all(&self.root)
            .map_err(|e| weight_error(variant, WeightFailureReason::Io, e))?;

        let partial = partial_path(&path);
        let url = variant.url();
        info!(%variant, %url, "downloading weights");

        if let Err(err) = self.download(&url, &partial) {
            remove_partial(&partial);
            return Err(match err {
                FetchError::Network(source) => SegError::WeightResolution {
                    variant,
                    reason: WeightFailureReason::Network,
                    source,
                },
                FetchError::Io(source) => weight_error(variant, WeightFailureReason::Io, source),
            });
        }

        fs::rename(&partial, &path).map_err(|e| {
            remove_partial(&partial);
            weight_error(variant, WeightFailureReason::Io, e)
        })?;
        info!(%variant, path = %path.display(), "weights cached");
        Ok(path)
    }

    fn download(&self, url: &str, partial: &Path) -> std::result::Result<u64, FetchError> {
        let mut file = BufWriter::new(File::create(partial)?);
        let written = self.fetcher.fetch(url, &mut file)?;
        file.flush()?;
        Ok(written)
    }
}

fn partial_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(".part");
    PathBuf::from(name)
}

fn remove_partial(partial: &Path) {
    if let Err(e) = fs::remove_file(partial) {
        if e.kind() != io::ErrorKind::NotFound {
            warn!(path = %partial.display(), error = %e, "could not remove partial download");
        }
    }
}

fn weight_error(variant: ModelVariant, reason: WeightFailureReason, err: io::Error) -> SegError {
    SegError::WeightResolution {
        variant,
        reason,
        source: Box::new(err),
    }
}
