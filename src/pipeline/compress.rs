// In-place gzip compression of the export file

use crate::error::ToolError;
use async_trait::async_trait;
use flate2::write::GzEncoder;
use flate2::Compression;
use std::fs::File;
use std::io::{self, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use tracing::info;

const TOOL: &str = "gzip";

#[async_trait]
pub trait Compressor: Send + Sync {
    /// Compresses `path` into its `.gz` sibling and removes the original.
    /// Returns the path of the compressed file.
    async fn compress_in_place(&self, path: &Path) -> Result<PathBuf, ToolError>;
}

/// gzip via flate2, streamed from disk to disk
#[derive(Debug, Clone, Copy)]
pub struct GzipCompressor {
    level: Compression,
}

impl Default for GzipCompressor {
    fn default() -> Self {
        Self {
            level: Compression::fast(),
        }
    }
}

impl GzipCompressor {
    pub fn with_level(level: u32) -> Self {
        Self {
            level: Compression::new(level.min(9)),
        }
    }
}

/// `<path>.gz`
pub fn gz_sibling(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(".gz");
    PathBuf::from(name)
}

fn compress_file(source: &Path, target: &Path, level: Compression) -> io::Result<u64> {
    let input = File::open(source)?;
    let output = File::create(target)?;

    let mut reader = BufReader::new(input);
    let mut encoder = GzEncoder::new(BufWriter::new(output), level);
    let bytes = io::copy(&mut reader, &mut encoder)?;
    let mut writer = encoder.finish()?;
    writer.flush()?;
    Ok(bytes)
}

#[async_trait]
impl Compressor for GzipCompressor {
    async fn compress_in_place(&self, path: &Path) -> Result<PathBuf, ToolError> {
        let source = path.to_path_buf();
        let target = gz_sibling(path);
        let level = self.level;

        let (src, dst) = (source.clone(), target.clone());
        let result = tokio::task::spawn_blocking(move || compress_file(&src, &dst, level))
            .await
            .map_err(|e| ToolError::new(TOOL, None, format!("compression task failed: {}", e)))?;

        match result {
            Ok(bytes) => {
                tokio::fs::remove_file(&source).await.map_err(|e| {
                    ToolError::new(TOOL, None, format!("cannot remove {}: {}", source.display(), e))
                })?;
                info!(path = %target.display(), original_bytes = bytes, "Export compressed");
                Ok(target)
            }
            Err(e) => {
                let _ = tokio::fs::remove_file(&target).await;
                Err(ToolError::new(
                    TOOL,
                    None,
                    format!("failed to compress {}: {}", source.display(), e),
                ))
            }
        }
    }
}
