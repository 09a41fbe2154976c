use crate::error::{CorpusLoadError, PdfParseError};
use crate::extractor::{LopdfExtractor, PdfExtractor};
use crate::models::{Document, LoaderOptions, Metadata, METADATA_PAGE, METADATA_SOURCE, METADATA_TOTAL_PAGES};
use crate::normalize::normalize;
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};
use walkdir::WalkDir;

pub fn discover_pdf_files(folder: &Path, recursive: bool) -> Vec<PathBuf> {
    let mut walker = WalkDir::new(folder).min_depth(1);
    if !recursive {
        walker = walker.max_depth(1);
    }

    let mut files = Vec::new();
    for entry in walker.into_iter().filter_map(|item| item.ok()) {
        if !entry.file_type().is_file() {
            continue;
        }

        let is_pdf = entry
            .path()
            .extension()
            .and_then(|ext| ext.to_str())
            .is_some_and(|ext| ext.eq_ignore_ascii_case("pdf"));

        if is_pdf {
            files.push(entry.path().to_path_buf());
        }
    }

    files.sort_unstable();
    files
}

pub fn digest_file(path: &Path) -> Result<String, std::io::Error> {
    let bytes = fs::read(path)?;
    let mut hasher = Sha256::new();
    hasher.update(&bytes);
    Ok(format!("{:x}", hasher.finalize()))
}

#[derive(Debug, Clone)]
pub struct LoadedFile {
    pub path: PathBuf,
    pub checksum: String,
    pub pages: usize,
}

#[derive(Debug, Clone)]
pub struct CorpusReport {
    pub documents: Vec<Document>,
    pub files: Vec<LoadedFile>,
    pub skipped: Vec<PdfParseError>,
}

impl CorpusReport {
    /// Digest over every loaded file path and content checksum.
    pub fn fingerprint(&self) -> String {
        let mut hasher = Sha256::new();
        for file in &self.files {
            hasher.update(file.path.to_string_lossy().as_bytes());
            hasher.update([0u8]);
            hasher.update(file.checksum.as_bytes());
            hasher.update([0u8]);
        }
        format!("{:x}", hasher.finalize())
    }
}

pub fn load_corpus(dir: &Path, options: &LoaderOptions) -> Result<CorpusReport, CorpusLoadError> {
    load_corpus_with(dir, options, &LopdfExtractor)
}

/// Load one normalized document per page from every PDF under `dir`.
///
/// Files that fail to parse are reported in [`CorpusReport::skipped`] and do
/// not abort the load unless no file at all could be read.
pub fn load_corpus_with<E: PdfExtractor + ?Sized>(
    dir: &Path,
    options: &LoaderOptions,
    extractor: &E,
) -> Result<CorpusReport, CorpusLoadError> {
    if !dir.is_dir() {
        return Err(CorpusLoadError::MissingDirectory(dir.to_path_buf()));
    }

    let files = discover_pdf_files(dir, options.recursive);
    if files.is_empty() {
        return Err(CorpusLoadError::NoPdfFiles(dir.to_path_buf()));
    }

    info!(dir = %dir.display(), files = files.len(), "loading pdf corpus");

    let mut documents = Vec::new();
    let mut loaded = Vec::new();
    let mut skipped = Vec::new();

    for path in files {
        match load_file(&path, extractor) {
            Ok((file, file_documents)) => {
                debug!(path = %path.display(), pages = file.pages, documents = file_documents.len(), "loaded pdf");
                loaded.push(file);
                documents.extend(file_documents);
            }
            Err(error) => {
                warn!(path = %error.path.display(), reason = %error.reason, "skipped pdf");
                skipped.push(error);
            }
        }
    }

    if loaded.is_empty() {
        return Err(CorpusLoadError::NoReadableFiles {
            dir: dir.to_path_buf(),
            skipped,
        });
    }

    info!(
        documents = documents.len(),
        files = loaded.len(),
        skipped = skipped.len(),
        "corpus loaded"
    );

    Ok(CorpusReport {
        documents,
        files: loaded,
        skipped,
    })
}

fn load_file<E: PdfExtractor + ?Sized>(
    path: &Path,
    extractor: &E,
) -> Result<(LoadedFile, Vec<Document>), PdfParseError> {
    let checksum = digest_file(path).map_err(|error| PdfParseError {
        path: path.to_path_buf(),
        reason: error.to_string(),
    })?;
    let pages = extractor.extract_pages(path)?;
    let total_pages = pages.len();
    let source = path.to_string_lossy().to_string();

    let documents = pages
        .into_iter()
        .filter_map(|page| {
            let content = normalize(&page.text);
            if content.is_empty() {
                return None;
            }

            let mut metadata = Metadata::new();
            metadata.insert(METADATA_SOURCE.to_string(), Value::from(source.clone()));
            metadata.insert(METADATA_PAGE.to_string(), Value::from(page.number));
            metadata.insert(METADATA_TOTAL_PAGES.to_string(), Value::from(total_pages));
            Some(Document::new(content, metadata))
        })
        .collect();

    Ok((
        LoadedFile {
            path: path.to_path_buf(),
            checksum,
            pages: total_pages,
        },
        documents,
    ))
}
