use crate::error::PdfParseError;
use lopdf::Document;
use std::path::Path;

#[derive(Debug, Clone)]
pub struct PageText {
    pub number: u32,
    pub text: String,
}

pub trait PdfExtractor {
    /// Returns every page of the file in page order, blank pages included.
    fn extract_pages(&self, path: &Path) -> Result<Vec<PageText>, PdfParseError>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct LopdfExtractor;

impl PdfExtractor for LopdfExtractor {
    fn extract_pages(&self, path: &Path) -> Result<Vec<PageText>, PdfParseError> {
        let parse_error = |reason: String| PdfParseError {
            path: path.to_path_buf(),
            reason,
        };

        let document = Document::load(path).map_err(|error| parse_error(error.to_string()))?;

        let mut pages = Vec::new();
        for (page_no, _page_id) in document.get_pages() {
            let text = document
                .extract_text(&[page_no])
                .map_err(|error| parse_error(format!("page {page_no}: {error}")))?;

            pages.push(PageText {
                number: page_no,
                text,
            });
        }

        if pages.iter().all(|page| page.text.trim().is_empty()) {
            return Err(parse_error("pdf had no readable page text".to_string()));
        }

        Ok(pages)
    }
}

pub fn extract_page_texts(path: &Path) -> Result<Vec<PageText>, PdfParseError> {
    LopdfExtractor.extract_pages(path)
}
