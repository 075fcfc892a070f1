//! Content extraction: supply one page's raw bytes and text layer.
//!
//! Low-level document decoding is deliberately outside this crate. The
//! pipeline consumes pre-exported page files through the
//! [`ContentExtractor`] trait; [`DirectoryExtractor`] is the bundled
//! implementation, reading a directory produced by an upstream exporter
//! (`pdftoppm`, `mutool draw`, or similar):
//!
//! ```text
//! book-pages/
//!   page-0001.png        page image (recognised remotely when no .txt)
//!   page-0001.txt        optional embedded text layer for the same page
//!   page-0002.png
//!   ...
//! ```
//!
//! A page with a `.txt` sidecar has an embedded text layer and skips the
//! remote recognition call entirely; the cheaper extraction path wins.

use crate::cache::PageFingerprint;
use crate::error::ConvertError;
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::debug;

/// Upstream collaborator failure while supplying a page.
///
/// Treated as permanent for the page: the job records a Failed page and
/// moves on (or halts, under `abort_on_page_failure`).
#[derive(Debug, Clone, Error)]
#[error("extraction failed for page {page}: {detail}")]
pub struct ExtractionError {
    pub page: usize,
    pub detail: String,
}

/// One page's raw content as supplied by the extractor.
#[derive(Debug, Clone)]
pub struct RawPageContent {
    /// Zero-based page position.
    pub page_index: usize,
    /// Page image bytes (PNG/JPEG as exported). Empty for text-only pages.
    pub image: Vec<u8>,
    /// Embedded text layer, when the source document has one.
    pub text_layer: Option<String>,
}

impl RawPageContent {
    /// Whether this page can skip remote recognition.
    pub fn has_text_layer(&self) -> bool {
        self.text_layer
            .as_deref()
            .is_some_and(|t| !t.trim().is_empty())
    }

    /// Content-derived cache key for this page.
    ///
    /// Image bytes and text layer both feed the hash: if either changes in
    /// the source, the fingerprint changes and the cache misses.
    pub fn fingerprint(&self) -> PageFingerprint {
        let mut hasher = blake3::Hasher::new();
        hasher.update(&self.image);
        if let Some(ref text) = self.text_layer {
            hasher.update(text.as_bytes());
        }
        PageFingerprint {
            page_index: self.page_index,
            content_hash: hasher.finalize().to_hex().to_string(),
        }
    }
}

/// Supplies raw page content to the pipeline.
///
/// `async_trait` keeps the trait object-safe so the stage can hold an
/// `Arc<dyn ContentExtractor>` chosen at run time (directory input in the
/// CLI, scripted fakes in tests).
#[async_trait]
pub trait ContentExtractor: Send + Sync {
    /// Total number of pages available.
    fn page_count(&self) -> usize;

    /// Extract one page's raw content.
    async fn extract(&self, page_index: usize) -> Result<RawPageContent, ExtractionError>;
}

/// Bundled extractor reading pre-exported page files from a directory.
#[derive(Debug)]
pub struct DirectoryExtractor {
    pages: Vec<PageFiles>,
}

#[derive(Debug)]
struct PageFiles {
    image: Option<PathBuf>,
    text: Option<PathBuf>,
}

impl DirectoryExtractor {
    /// Scan `dir` for `page-NNNN.{png,jpg,jpeg}` / `page-NNNN.txt` files.
    ///
    /// Pages are ordered by their number in the file name, not by inode
    /// order, so gaps in numbering are tolerated.
    pub fn open(dir: impl AsRef<Path>) -> Result<Self, ConvertError> {
        let dir = dir.as_ref();
        let entries = match std::fs::read_dir(dir) {
            Ok(e) => e,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(ConvertError::InputNotFound {
                    path: dir.to_path_buf(),
                })
            }
            Err(e) if e.kind() == std::io::ErrorKind::PermissionDenied => {
                return Err(ConvertError::PermissionDenied {
                    path: dir.to_path_buf(),
                })
            }
            Err(e) => return Err(ConvertError::Internal(e.to_string())),
        };

        let mut by_number: BTreeMap<u32, PageFiles> = BTreeMap::new();
        for entry in entries.flatten() {
            let path = entry.path();
            let Some((number, ext)) = parse_page_file(&path) else {
                continue;
            };
            let files = by_number.entry(number).or_insert(PageFiles {
                image: None,
                text: None,
            });
            match ext.as_str() {
                "png" | "jpg" | "jpeg" => files.image = Some(path),
                "txt" => files.text = Some(path),
                _ => {}
            }
        }

        if by_number.is_empty() {
            return Err(ConvertError::NoPages {
                path: dir.to_path_buf(),
            });
        }

        let pages: Vec<PageFiles> = by_number.into_values().collect();
        debug!("directory extractor found {} pages", pages.len());
        Ok(Self { pages })
    }
}

/// `page-0042.png` → `(42, "png")`.
fn parse_page_file(path: &Path) -> Option<(u32, String)> {
    let stem = path.file_stem()?.to_str()?;
    let ext = path.extension()?.to_str()?.to_ascii_lowercase();
    let number = stem.strip_prefix("page-")?.parse::<u32>().ok()?;
    Some((number, ext))
}

#[async_trait]
impl ContentExtractor for DirectoryExtractor {
    fn page_count(&self) -> usize {
        self.pages.len()
    }

    async fn extract(&self, page_index: usize) -> Result<RawPageContent, ExtractionError> {
        let files = self.pages.get(page_index).ok_or_else(|| ExtractionError {
            page: page_index,
            detail: format!("page index out of range (document has {})", self.pages.len()),
        })?;

        let image = match &files.image {
            Some(path) => tokio::fs::read(path).await.map_err(|e| ExtractionError {
                page: page_index,
                detail: format!("reading {}: {e}", path.display()),
            })?,
            None => Vec::new(),
        };

        let text_layer = match &files.text {
            Some(path) => Some(tokio::fs::read_to_string(path).await.map_err(|e| {
                ExtractionError {
                    page: page_index,
                    detail: format!("reading {}: {e}", path.display()),
                }
            })?),
            None => None,
        };

        let content = RawPageContent {
            page_index,
            image,
            text_layer,
        };
        if content.image.is_empty() && !content.has_text_layer() {
            return Err(ExtractionError {
                page: page_index,
                detail: "page has neither image nor usable text layer".into(),
            });
        }

        Ok(content)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn write(dir: &Path, name: &str, bytes: &[u8]) {
        std::fs::write(dir.join(name), bytes).unwrap();
    }

    #[tokio::test]
    async fn scans_and_orders_pages() {
        let dir = TempDir::new().unwrap();
        write(dir.path(), "page-0003.png", b"third");
        write(dir.path(), "page-0001.png", b"first");
        write(dir.path(), "page-0001.txt", b"first text");
        write(dir.path(), "page-0002.png", b"second");
        write(dir.path(), "notes.md", b"ignored");

        let extractor = DirectoryExtractor::open(dir.path()).unwrap();
        assert_eq!(extractor.page_count(), 3);

        let first = extractor.extract(0).await.unwrap();
        assert_eq!(first.image, b"first");
        assert!(first.has_text_layer());

        let second = extractor.extract(1).await.unwrap();
        assert_eq!(second.image, b"second");
        assert!(!second.has_text_layer());
    }

    #[tokio::test]
    async fn text_only_page_is_valid() {
        let dir = TempDir::new().unwrap();
        write(dir.path(), "page-0001.txt", b"only text");

        let extractor = DirectoryExtractor::open(dir.path()).unwrap();
        let page = extractor.extract(0).await.unwrap();
        assert!(page.image.is_empty());
        assert!(page.has_text_layer());
    }

    #[tokio::test]
    async fn blank_text_layer_without_image_is_extraction_error() {
        // A whitespace-only sidecar must not pass extraction only to fail
        // the text-layer check later and ship an empty image payload.
        let dir = TempDir::new().unwrap();
        write(dir.path(), "page-0001.txt", b"   \n\t\n");

        let extractor = DirectoryExtractor::open(dir.path()).unwrap();
        let err = extractor.extract(0).await.unwrap_err();
        assert_eq!(err.page, 0);
        assert!(err.detail.contains("neither image nor usable text layer"));
    }

    #[tokio::test]
    async fn out_of_range_is_extraction_error() {
        let dir = TempDir::new().unwrap();
        write(dir.path(), "page-0001.png", b"only");
        let extractor = DirectoryExtractor::open(dir.path()).unwrap();
        let err = extractor.extract(5).await.unwrap_err();
        assert_eq!(err.page, 5);
    }

    #[test]
    fn missing_dir_and_empty_dir_errors() {
        let err = DirectoryExtractor::open("/definitely/not/here").unwrap_err();
        assert!(matches!(err, ConvertError::InputNotFound { .. }));

        let dir = TempDir::new().unwrap();
        let err = DirectoryExtractor::open(dir.path()).unwrap_err();
        assert!(matches!(err, ConvertError::NoPages { .. }));
    }

    #[test]
    fn fingerprint_covers_text_layer() {
        let base = RawPageContent {
            page_index: 0,
            image: b"img".to_vec(),
            text_layer: None,
        };
        let with_text = RawPageContent {
            text_layer: Some("layer".into()),
            ..base.clone()
        };
        assert_ne!(
            base.fingerprint().content_hash,
            with_text.fingerprint().content_hash
        );
    }

    #[test]
    fn whitespace_only_text_layer_does_not_count() {
        let page = RawPageContent {
            page_index: 0,
            image: b"img".to_vec(),
            text_layer: Some("   \n".into()),
        };
        assert!(!page.has_text_layer());
    }
}
