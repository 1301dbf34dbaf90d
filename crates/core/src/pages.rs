use crate::error::{IngestError, PageError};
use crate::traits::{ImageFormat, PageImage, PageSource};
use lopdf::Document;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

pub struct PdfPageSource {
    document: Document,
}

impl PdfPageSource {
    pub fn open(path: &Path) -> Result<Self, IngestError> {
        let document =
            Document::load(path).map_err(|error| IngestError::PdfParse(error.to_string()))?;
        if document.get_pages().is_empty() {
            return Err(IngestError::PdfParse(format!(
                "pdf has no pages: {}",
                path.display()
            )));
        }
        Ok(Self { document })
    }
}

impl PageSource for PdfPageSource {
    fn page_numbers(&self) -> Vec<u32> {
        self.document.get_pages().keys().copied().collect()
    }

    fn render(&self, page: u32) -> Result<PageImage, PageError> {
        let others: Vec<u32> = self
            .page_numbers()
            .into_iter()
            .filter(|number| *number != page)
            .collect();
        if others.len() == self.document.get_pages().len() {
            return Err(PageError {
                page,
                reason: "page does not exist".to_string(),
            });
        }

        let mut single = self.document.clone();
        single.delete_pages(&others);
        single.prune_objects();

        let mut bytes = Vec::new();
        single.save_to(&mut bytes).map_err(|error| PageError {
            page,
            reason: format!("could not render page: {error}"),
        })?;

        Ok(PageImage {
            page,
            format: ImageFormat::Pdf,
            bytes,
        })
    }
}

/// A directory of scans named `page_NNNN.png` (or `.jpg`). Page numbers come
/// from the file names.
pub struct ImageDirSource {
    pages: BTreeMap<u32, PathBuf>,
}

impl ImageDirSource {
    pub fn open(dir: &Path) -> Result<Self, IngestError> {
        let mut pages = BTreeMap::new();
        for entry in fs::read_dir(dir)? {
            let path = entry?.path();
            if let Some(page) = page_number_from_path(&path) {
                pages.insert(page, path);
            }
        }

        if pages.is_empty() {
            return Err(IngestError::UnsupportedSource(format!(
                "no page_NNNN images in {}",
                dir.display()
            )));
        }
        Ok(Self { pages })
    }
}

impl PageSource for ImageDirSource {
    fn page_numbers(&self) -> Vec<u32> {
        self.pages.keys().copied().collect()
    }

    fn render(&self, page: u32) -> Result<PageImage, PageError> {
        let path = self.pages.get(&page).ok_or_else(|| PageError {
            page,
            reason: "page does not exist".to_string(),
        })?;
        let format = path
            .extension()
            .and_then(|ext| ext.to_str())
            .and_then(ImageFormat::from_extension)
            .unwrap_or(ImageFormat::Png);
        let bytes = fs::read(path).map_err(|error| PageError {
            page,
            reason: format!("could not read {}: {error}", path.display()),
        })?;

        Ok(PageImage {
            page,
            format,
            bytes,
        })
    }
}

pub fn page_number_from_path(path: &Path) -> Option<u32> {
    let name = path.file_name()?.to_str()?.to_ascii_lowercase();
    let (digits, extension) = name.strip_prefix("page_")?.split_once('.')?;
    if digits.is_empty() || !digits.bytes().all(|byte| byte.is_ascii_digit()) {
        return None;
    }
    ImageFormat::from_extension(extension).filter(|format| *format != ImageFormat::Pdf)?;
    digits.parse().ok()
}

fn is_page_dir(path: &Path) -> bool {
    fs::read_dir(path)
        .map(|entries| {
            entries
                .filter_map(|entry| entry.ok())
                .any(|entry| page_number_from_path(&entry.path()).is_some())
        })
        .unwrap_or(false)
}

fn is_pdf(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| ext.eq_ignore_ascii_case("pdf"))
}

pub fn open_source(path: &Path) -> Result<Box<dyn PageSource>, IngestError> {
    if path.is_dir() {
        return Ok(Box::new(ImageDirSource::open(path)?));
    }
    if is_pdf(path) {
        return Ok(Box::new(PdfPageSource::open(path)?));
    }
    Err(IngestError::UnsupportedSource(path.display().to_string()))
}

/// PDFs and page-image directories below `folder`, sorted by path.
pub fn discover_sources(folder: &Path) -> Vec<PathBuf> {
    let mut sources = Vec::new();

    for entry in WalkDir::new(folder)
        .into_iter()
        .filter_map(|item| item.ok())
    {
        let path = entry.path();
        if entry.file_type().is_file() && is_pdf(path) {
            sources.push(path.to_path_buf());
        } else if entry.file_type().is_dir() && is_page_dir(path) {
            sources.push(path.to_path_buf());
        }
    }

    sources.sort_unstable();
    sources
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn page_numbers_come_from_file_names() {
        assert_eq!(page_number_from_path(Path::new("scans/page_0003.png")), Some(3));
        assert_eq!(page_number_from_path(Path::new("PAGE_12.JPG")), Some(12));
        assert_eq!(page_number_from_path(Path::new("cover.png")), None);
        assert_eq!(page_number_from_path(Path::new("page_0003.tiff")), None);
    }

    #[test]
    fn image_dir_lists_and_renders_pages() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempdir()?;
        fs::write(dir.path().join("page_0003.png"), b"three")?;
        fs::write(dir.path().join("page_0001.jpg"), b"one")?;
        fs::write(dir.path().join("notes.txt"), b"ignored")?;

        let source = ImageDirSource::open(dir.path())?;
        assert_eq!(source.page_numbers(), vec![1, 3]);

        let page = source.render(3)?;
        assert_eq!(page.format, ImageFormat::Png);
        assert_eq!(page.bytes, b"three");
        assert_eq!(source.render(1)?.format, ImageFormat::Jpeg);
        assert!(source.render(2).is_err());
        Ok(())
    }

    #[test]
    fn discovery_finds_pdfs_and_scan_directories() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempdir()?;
        let scans = dir.path().join("kobun-scans");
        let nested = dir.path().join("nested");
        fs::create_dir(&scans)?;
        fs::create_dir(&nested)?;
        fs::write(scans.join("page_0001.png"), b"png")?;
        fs::write(dir.path().join("a.pdf"), b"%PDF-1.4\n%fake")?;
        fs::write(nested.join("b.PDF"), b"%PDF-1.4\n%fake")?;
        fs::write(nested.join("readme.md"), b"no")?;

        let sources = discover_sources(dir.path());
        assert_eq!(sources.len(), 3);
        assert!(sources.contains(&scans));
        Ok(())
    }

    #[test]
    fn broken_pdf_is_a_fatal_source_error() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempdir()?;
        let path = dir.path().join("broken.pdf");
        fs::write(&path, b"%PDF-1.4\n%broken")?;
        assert!(matches!(open_source(&path), Err(IngestError::PdfParse(_))));
        assert!(matches!(
            open_source(&dir.path().join("notes.txt")),
            Err(IngestError::UnsupportedSource(_))
        ));
        Ok(())
    }
}
