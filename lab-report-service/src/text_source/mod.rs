//! Turns an uploaded document into raw text.
//!
//! PDFs are read from their embedded text layer first; scanned PDFs and
//! raster images go through the vision OCR model.

pub mod vision_ocr;

use async_trait::async_trait;
use image::ImageFormat;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{info, warn};

pub use vision_ocr::VisionOcr;

#[derive(Debug, Error)]
pub enum ExtractionError {
    #[error("Unsupported file format '{extension}' for {path:?}. Use PDF, PNG, JPEG, TIFF, BMP or WebP.")]
    UnsupportedFormat { path: PathBuf, extension: String },

    #[error("Document not found: {path:?}")]
    NotFound { path: PathBuf },

    #[error("Failed to read {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to extract text from PDF: {0}")]
    Pdf(String),

    #[error("Failed to decode image: {0}")]
    Image(String),

    #[error("OCR failed: {0}")]
    Ocr(String),

    #[error("Document needs OCR but no vision model is configured")]
    OcrUnavailable,
}

#[async_trait]
pub trait TextSource: Send + Sync {
    /// Extract all readable text from the document at `path`.
    async fn extract(&self, path: &Path) -> Result<String, ExtractionError>;
}

/// What kind of document a path points at, judged by its extension
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DocumentKind {
    Pdf,
    Image(ImageFormat),
}

impl DocumentKind {
    pub fn from_path(path: &Path) -> Result<Self, ExtractionError> {
        let extension = path
            .extension()
            .and_then(|e| e.to_str())
            .map(str::to_ascii_lowercase)
            .unwrap_or_default();

        if extension == "pdf" {
            return Ok(DocumentKind::Pdf);
        }

        match ImageFormat::from_extension(&extension) {
            Some(
                format @ (ImageFormat::Png
                | ImageFormat::Jpeg
                | ImageFormat::Tiff
                | ImageFormat::Bmp
                | ImageFormat::WebP),
            ) => Ok(DocumentKind::Image(format)),
            _ => Err(ExtractionError::UnsupportedFormat {
                path: path.to_path_buf(),
                extension,
            }),
        }
    }
}

/// Text source for PDFs and raster images
pub struct DocumentTextSource {
    vision: Option<VisionOcr>,
}

impl DocumentTextSource {
    pub fn new(vision: Option<VisionOcr>) -> Self {
        Self { vision }
    }

    fn vision(&self) -> Result<&VisionOcr, ExtractionError> {
        self.vision.as_ref().ok_or(ExtractionError::OcrUnavailable)
    }
}

#[async_trait]
impl TextSource for DocumentTextSource {
    async fn extract(&self, path: &Path) -> Result<String, ExtractionError> {
        info!(path = %path.display(), "Starting text extraction");

        let kind = DocumentKind::from_path(path)?;

        let exists = tokio::fs::try_exists(path)
            .await
            .map_err(|source| ExtractionError::Io {
                path: path.to_path_buf(),
                source,
            })?;
        if !exists {
            return Err(ExtractionError::NotFound {
                path: path.to_path_buf(),
            });
        }

        let text = match kind {
            DocumentKind::Pdf => {
                let text = extract_pdf_text(path).await?;
                if !text.trim().is_empty() {
                    text
                } else if let Some(vision) = &self.vision {
                    warn!(path = %path.display(), "PDF has no text layer, falling back to vision OCR");
                    vision.ocr_pdf(path).await?
                } else {
                    text
                }
            }
            DocumentKind::Image(format) => self.vision()?.ocr_image_file(path, format).await?,
        };

        info!(
            path = %path.display(),
            characters = text.len(),
            "Text extraction completed"
        );
        Ok(text)
    }
}

/// Read the embedded text layer of a PDF
pub async fn extract_pdf_text(path: &Path) -> Result<String, ExtractionError> {
    let bytes = tokio::fs::read(path)
        .await
        .map_err(|source| ExtractionError::Io {
            path: path.to_path_buf(),
            source,
        })?;

    tokio::task::spawn_blocking(move || pdf_extract::extract_text_from_mem(&bytes))
        .await
        .map_err(|e| ExtractionError::Pdf(format!("PDF parser aborted: {e}")))?
        .map_err(|e| ExtractionError::Pdf(e.to_string()))
}


#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_document_kind_from_extension() {
        assert_eq!(
            DocumentKind::from_path(Path::new("report.PDF")).unwrap(),
            DocumentKind::Pdf
        );
        assert_eq!(
            DocumentKind::from_path(Path::new("scan.jpeg")).unwrap(),
            DocumentKind::Image(ImageFormat::Jpeg)
        );
        assert_eq!(
            DocumentKind::from_path(Path::new("scan.png")).unwrap(),
            DocumentKind::Image(ImageFormat::Png)
        );
    }

    #[test]
    fn test_unsupported_extensions_are_rejected() {
        for name in ["notes.docx", "report", "archive.tar.gz"] {
            let err = DocumentKind::from_path(Path::new(name)).unwrap_err();
            assert!(matches!(err, ExtractionError::UnsupportedFormat { .. }), "{name}");
        }
    }

    #[tokio::test]
    async fn test_missing_file_is_reported() {
        let source = DocumentTextSource::new(None);
        let err = source
            .extract(Path::new("/definitely/not/here/report.pdf"))
            .await
            .unwrap_err();
        assert!(matches!(err, ExtractionError::NotFound { .. }));
    }

    #[tokio::test]
    async fn test_unsupported_format_checked_before_reading() {
        let source = DocumentTextSource::new(None);
        let err = source.extract(Path::new("/tmp/whatever.txt")).await.unwrap_err();
        assert!(matches!(err, ExtractionError::UnsupportedFormat { .. }));
    }

    #[tokio::test]
    async fn test_image_without_vision_model_fails() {
        let mut file = tempfile::Builder::new().suffix(".png").tempfile().unwrap();
        file.write_all(b"not really a png").unwrap();

        let source = DocumentTextSource::new(None);
        let err = source.extract(file.path()).await.unwrap_err();
        assert!(matches!(err, ExtractionError::OcrUnavailable));
    }

    #[tokio::test]
    async fn test_corrupt_pdf_is_an_extraction_error() {
        let mut file = tempfile::Builder::new().suffix(".pdf").tempfile().unwrap();
        file.write_all(b"this is not a pdf").unwrap();

        let err = extract_pdf_text(file.path()).await.unwrap_err();
        assert!(matches!(err, ExtractionError::Pdf(_)));
    }
}
