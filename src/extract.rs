//! Content extraction: file paths in, plain UTF-8 text out.
//!
//! Converters are batch-oriented. A converter returns a map from path to
//! extracted text; a path missing from the map means extraction failed for
//! that one file. An `Err` from [`ContentConverter::convert_batch`] means the
//! converter itself is broken and fails the sync.
//!
//! | Converter | Extensions |
//! |-----------|------------|
//! | [`TextConverter`] | plain text, markup, data files and source code |
//! | [`DocumentConverter`] | `pdf`, `docx`, `pptx`, `xlsx` |

use std::collections::HashMap;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;

use crate::error::ExtractError;

/// Maximum sheets to process in an xlsx.
const XLSX_MAX_SHEETS: usize = 100;
/// Maximum cells to process per sheet (avoids unbounded memory).
const XLSX_MAX_CELLS_PER_SHEET: usize = 100_000;
/// Maximum decompressed bytes to read from a single ZIP entry (zip-bomb protection).
const MAX_XML_ENTRY_BYTES: u64 = 50 * 1024 * 1024;

const TEXT_EXTENSIONS: &[&str] = &[
    "txt", "md", "markdown", "rst", "adoc", "csv", "tsv", "json", "jsonl", "yaml", "yml", "toml",
    "ini", "cfg", "xml", "html", "htm", "log", "sql",
];

/// Source-code extensions and their language tags. Every one of them is
/// also read by [`TextConverter`].
pub const CODE_EXTENSIONS: &[(&str, &str)] = &[
    ("rs", "rust"),
    ("py", "python"),
    ("js", "javascript"),
    ("mjs", "javascript"),
    ("cjs", "javascript"),
    ("jsx", "javascript"),
    ("ts", "typescript"),
    ("tsx", "typescript"),
    ("go", "go"),
    ("java", "java"),
    ("c", "c"),
    ("h", "c"),
    ("cc", "cpp"),
    ("cpp", "cpp"),
    ("cxx", "cpp"),
    ("hpp", "cpp"),
    ("cs", "csharp"),
    ("rb", "ruby"),
    ("php", "php"),
    ("swift", "swift"),
    ("kt", "kotlin"),
    ("kts", "kotlin"),
    ("scala", "scala"),
    ("lua", "lua"),
    ("sh", "bash"),
    ("bash", "bash"),
];

/// Language tag for a source file, by extension.
pub fn code_language(path: &Path) -> Option<&'static str> {
    let ext = path.extension()?.to_str()?.to_ascii_lowercase();
    CODE_EXTENSIONS
        .iter()
        .find(|(candidate, _)| *candidate == ext)
        .map(|(_, language)| *language)
}

const DOCUMENT_EXTENSIONS: &[&str] = &["pdf", "docx", "pptx", "xlsx"];

#[async_trait]
pub trait ContentConverter: Send + Sync {
    fn name(&self) -> &str;

    /// Convert every path it can. Failed files are left out of the result.
    async fn convert_batch(
        &self,
        paths: &[PathBuf],
    ) -> Result<HashMap<PathBuf, String>, ExtractError>;
}

/// Converter lookup by lowercase file extension.
#[derive(Default, Clone)]
pub struct ConverterRegistry {
    by_extension: HashMap<String, Arc<dyn ContentConverter>>,
}

impl ConverterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with [`TextConverter`] and [`DocumentConverter`].
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        let text: Arc<dyn ContentConverter> = Arc::new(TextConverter);
        registry.register(TEXT_EXTENSIONS, Arc::clone(&text));
        let code: Vec<&str> = CODE_EXTENSIONS.iter().map(|(ext, _)| *ext).collect();
        registry.register(&code, text);
        registry.register(DOCUMENT_EXTENSIONS, Arc::new(DocumentConverter));
        registry
    }

    pub fn register(&mut self, extensions: &[&str], converter: Arc<dyn ContentConverter>) {
        for ext in extensions {
            self.by_extension
                .insert(ext.to_ascii_lowercase(), Arc::clone(&converter));
        }
    }

    pub fn get(&self, extension: &str) -> Option<Arc<dyn ContentConverter>> {
        self.by_extension
            .get(&extension.to_ascii_lowercase())
            .cloned()
    }

    pub fn supports(&self, extension: &str) -> bool {
        self.by_extension
            .contains_key(&extension.to_ascii_lowercase())
    }
}

// ============ Text ============

/// Reads files as UTF-8, replacing invalid sequences.
pub struct TextConverter;

#[async_trait]
impl ContentConverter for TextConverter {
    fn name(&self) -> &str {
        "text"
    }

    async fn convert_batch(
        &self,
        paths: &[PathBuf],
    ) -> Result<HashMap<PathBuf, String>, ExtractError> {
        let mut out = HashMap::with_capacity(paths.len());
        for path in paths {
            match tokio::fs::read(path).await {
                Ok(bytes) => {
                    out.insert(path.clone(), String::from_utf8_lossy(&bytes).into_owned());
                }
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "text conversion failed");
                }
            }
        }
        Ok(out)
    }
}

// ============ Documents ============

/// PDF and OOXML extraction. Parsing runs on the blocking pool.
pub struct DocumentConverter;

#[async_trait]
impl ContentConverter for DocumentConverter {
    fn name(&self) -> &str {
        "document"
    }

    async fn convert_batch(
        &self,
        paths: &[PathBuf],
    ) -> Result<HashMap<PathBuf, String>, ExtractError> {
        let paths = paths.to_vec();
        let results = tokio::task::spawn_blocking(move || {
            paths
                .into_iter()
                .map(|path| {
                    let result = convert_document(&path);
                    (path, result)
                })
                .collect::<Vec<_>>()
        })
        .await
        .map_err(|e| ExtractError::Infrastructure(format!("extraction task failed: {e}")))?;

        let mut out = HashMap::with_capacity(results.len());
        for (path, result) in results {
            match result {
                Ok(text) => {
                    out.insert(path, text);
                }
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "document conversion failed");
                }
            }
        }
        Ok(out)
    }
}

fn convert_document(path: &std::path::Path) -> Result<String, ExtractError> {
    let extension = path
        .extension()
        .map(|e| e.to_string_lossy().to_lowercase())
        .unwrap_or_default();
    let bytes = std::fs::read(path).map_err(|e| ExtractError::Pdf(e.to_string()))?;
    extract_document(&bytes, &extension)
}

/// Extract plain text from document bytes, selected by file extension.
pub fn extract_document(bytes: &[u8], extension: &str) -> Result<String, ExtractError> {
    match extension {
        "pdf" => pdf_extract::extract_text_from_mem(bytes)
            .map_err(|e| ExtractError::Pdf(e.to_string())),
        "docx" => {
            let mut archive = open_zip(bytes)?;
            let xml = read_zip_entry_bounded(&mut archive, "word/document.xml")?;
            text_elements(&xml, "")
        }
        "pptx" => extract_pptx(bytes),
        "xlsx" => extract_xlsx(bytes),
        other => Err(ExtractError::UnsupportedContentType(other.to_string())),
    }
}

type Zip<'a> = zip::ZipArchive<std::io::Cursor<&'a [u8]>>;

fn open_zip(bytes: &[u8]) -> Result<Zip<'_>, ExtractError> {
    zip::ZipArchive::new(std::io::Cursor::new(bytes)).map_err(|e| ExtractError::Ooxml(e.to_string()))
}

fn read_zip_entry_bounded(archive: &mut Zip<'_>, name: &str) -> Result<Vec<u8>, ExtractError> {
    let entry = archive
        .by_name(name)
        .map_err(|e| ExtractError::Ooxml(format!("{name}: {e}")))?;
    let mut out = Vec::new();
    entry
        .take(MAX_XML_ENTRY_BYTES)
        .read_to_end(&mut out)
        .map_err(|e| ExtractError::Ooxml(e.to_string()))?;
    if out.len() as u64 >= MAX_XML_ENTRY_BYTES {
        return Err(ExtractError::Ooxml(format!(
            "ZIP entry {name} exceeds size limit ({MAX_XML_ENTRY_BYTES} bytes)"
        )));
    }
    Ok(out)
}

/// Numbered parts such as `ppt/slides/slide3.xml`, in numeric order.
fn numbered_parts(archive: &Zip<'_>, prefix: &str) -> Vec<String> {
    let mut names: Vec<String> = archive
        .file_names()
        .filter(|n| n.starts_with(prefix) && n.ends_with(".xml"))
        .map(str::to_string)
        .collect();
    names.sort_by_key(|name| {
        name.trim_start_matches(prefix)
            .trim_end_matches(".xml")
            .parse::<u32>()
            .unwrap_or(u32::MAX)
    });
    names
}

/// Concatenate the text of every `<*:t>` element. `sep` joins runs.
fn text_elements(xml: &[u8], sep: &str) -> Result<String, ExtractError> {
    use quick_xml::events::Event;

    let mut out = String::new();
    let mut reader = quick_xml::Reader::from_reader(xml);
    reader.config_mut().trim_text(true);
    let mut buf = Vec::new();
    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(e)) if e.local_name().as_ref() == b"t" => {
                if let Ok(Event::Text(te)) = reader.read_event_into(&mut buf) {
                    if !out.is_empty() && !sep.is_empty() {
                        out.push_str(sep);
                    }
                    out.push_str(te.unescape().unwrap_or_default().as_ref());
                }
            }
            Ok(Event::Eof) => break,
            Err(e) => return Err(ExtractError::Ooxml(e.to_string())),
            _ => {}
        }
        buf.clear();
    }
    Ok(out)
}

fn extract_pptx(bytes: &[u8]) -> Result<String, ExtractError> {
    let mut archive = open_zip(bytes)?;
    let mut slides = Vec::new();
    for name in numbered_parts(&archive, "ppt/slides/slide") {
        let xml = read_zip_entry_bounded(&mut archive, &name)?;
        let text = text_elements(&xml, " ")?;
        if !text.is_empty() {
            slides.push(text);
        }
    }
    Ok(slides.join("\n\n"))
}

fn extract_xlsx(bytes: &[u8]) -> Result<String, ExtractError> {
    let mut archive = open_zip(bytes)?;
    let has_shared = archive.file_names().any(|n| n == "xl/sharedStrings.xml");
    let shared_strings = if has_shared {
        read_shared_strings(&read_zip_entry_bounded(&mut archive, "xl/sharedStrings.xml")?)?
    } else {
        Vec::new()
    };

    let mut sheets = Vec::new();
    for name in numbered_parts(&archive, "xl/worksheets/sheet")
        .into_iter()
        .take(XLSX_MAX_SHEETS)
    {
        let xml = read_zip_entry_bounded(&mut archive, &name)?;
        let cells = sheet_cells(&xml, &shared_strings)?;
        if !cells.is_empty() {
            sheets.push(cells);
        }
    }
    Ok(sheets.join("\n\n"))
}

fn read_shared_strings(xml: &[u8]) -> Result<Vec<String>, ExtractError> {
    use quick_xml::events::Event;

    let mut strings = Vec::new();
    let mut reader = quick_xml::Reader::from_reader(xml);
    reader.config_mut().trim_text(true);
    let mut buf = Vec::new();
    let mut current: Option<String> = None;
    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(e)) => match e.local_name().as_ref() {
                b"si" => current = Some(String::new()),
                b"t" => {
                    if let (Some(item), Ok(Event::Text(te))) =
                        (current.as_mut(), reader.read_event_into(&mut buf))
                    {
                        item.push_str(te.unescape().unwrap_or_default().as_ref());
                    }
                }
                _ => {}
            },
            Ok(Event::End(e)) if e.local_name().as_ref() == b"si" => {
                strings.extend(current.take());
            }
            Ok(Event::Eof) => break,
            Err(e) => return Err(ExtractError::Ooxml(e.to_string())),
            _ => {}
        }
        buf.clear();
    }
    Ok(strings)
}

/// Cell values of one sheet, space separated. Shared strings are resolved,
/// inline numbers are kept as written.
fn sheet_cells(xml: &[u8], shared_strings: &[String]) -> Result<String, ExtractError> {
    use quick_xml::events::Event;

    let mut cells: Vec<String> = Vec::new();
    let mut reader = quick_xml::Reader::from_reader(xml);
    reader.config_mut().trim_text(true);
    let mut buf = Vec::new();
    let mut in_value = false;
    let mut shared = false;
    while cells.len() < XLSX_MAX_CELLS_PER_SHEET {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(e)) => match e.local_name().as_ref() {
                b"c" => {
                    shared = e.attributes().flatten().any(|a| {
                        a.key.as_ref() == b"t" && a.value.as_ref() == b"s"
                    });
                }
                b"v" => in_value = true,
                _ => {}
            },
            Ok(Event::Text(te)) if in_value => {
                let raw = te.unescape().unwrap_or_default();
                let value = raw.trim();
                if shared {
                    if let Some(s) = value
                        .parse::<usize>()
                        .ok()
                        .and_then(|i| shared_strings.get(i))
                    {
                        cells.push(s.clone());
                    }
                } else if !value.is_empty() {
                    cells.push(value.to_string());
                }
                in_value = false;
            }
            Ok(Event::End(e)) => match e.local_name().as_ref() {
                b"v" => in_value = false,
                b"c" => shared = false,
                _ => {}
            },
            Ok(Event::Eof) => break,
            Err(e) => return Err(ExtractError::Ooxml(e.to_string())),
            _ => {}
        }
        buf.clear();
    }
    Ok(cells.join(" "))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn every_code_extension_has_a_converter() {
        let registry = ConverterRegistry::with_defaults();
        for (ext, _) in CODE_EXTENSIONS {
            assert!(registry.supports(ext), "no converter for .{ext}");
        }
        assert_eq!(code_language(Path::new("web/app.MJS")), Some("javascript"));
        assert_eq!(code_language(Path::new("build.gradle.kts")), Some("kotlin"));
        assert_eq!(code_language(Path::new("notes.md")), None);
    }

    fn zip_with(entries: &[(&str, &str)]) -> Vec<u8> {
        let mut cursor = std::io::Cursor::new(Vec::new());
        {
            let mut writer = zip::ZipWriter::new(&mut cursor);
            let options = zip::write::SimpleFileOptions::default();
            for (name, body) in entries {
                writer.start_file(*name, options).unwrap();
                writer.write_all(body.as_bytes()).unwrap();
            }
            writer.finish().unwrap();
        }
        cursor.into_inner()
    }

    #[test]
    fn unsupported_extension_returns_error() {
        let err = extract_document(b"foo", "bin").unwrap_err();
        assert!(matches!(err, ExtractError::UnsupportedContentType(_)));
    }

    #[test]
    fn invalid_pdf_returns_error() {
        let err = extract_document(b"not a pdf", "pdf").unwrap_err();
        assert!(matches!(err, ExtractError::Pdf(_)));
    }

    #[test]
    fn invalid_zip_returns_error_for_docx() {
        let err = extract_document(b"not a zip", "docx").unwrap_err();
        assert!(matches!(err, ExtractError::Ooxml(_)));
    }

    #[test]
    fn docx_text_runs_are_joined() {
        let doc = r#"<w:document xmlns:w="w"><w:body><w:p><w:r><w:t>Hello </w:t></w:r><w:r><w:t>world</w:t></w:r></w:p></w:body></w:document>"#;
        let bytes = zip_with(&[("word/document.xml", doc)]);
        assert_eq!(extract_document(&bytes, "docx").unwrap(), "Helloworld");
    }

    #[test]
    fn pptx_slides_in_numeric_order() {
        let slide = |t: &str| format!(r#"<p:sld xmlns:a="a" xmlns:p="p"><a:t>{t}</a:t></p:sld>"#);
        let (s1, s2, s10) = (slide("one"), slide("two"), slide("ten"));
        let bytes = zip_with(&[
            ("ppt/slides/slide10.xml", &s10),
            ("ppt/slides/slide2.xml", &s2),
            ("ppt/slides/slide1.xml", &s1),
        ]);
        assert_eq!(extract_document(&bytes, "pptx").unwrap(), "one\n\ntwo\n\nten");
    }

    #[test]
    fn xlsx_resolves_shared_strings() {
        let shared = r#"<sst><si><t>name</t></si><si><t>alice</t></si></sst>"#;
        let sheet = r#"<worksheet><sheetData><row><c t="s"><v>0</v></c><c><v>42</v></c></row><row><c t="s"><v>1</v></c></row></sheetData></worksheet>"#;
        let bytes = zip_with(&[
            ("xl/sharedStrings.xml", shared),
            ("xl/worksheets/sheet1.xml", sheet),
        ]);
        assert_eq!(extract_document(&bytes, "xlsx").unwrap(), "name 42 alice");
    }

    #[tokio::test]
    async fn text_converter_omits_unreadable_files() {
        let tmp = tempfile::TempDir::new().unwrap();
        let good = tmp.path().join("a.md");
        std::fs::write(&good, "# Title\nbody").unwrap();
        let missing = tmp.path().join("missing.md");

        let out = TextConverter
            .convert_batch(&[good.clone(), missing.clone()])
            .await
            .unwrap();
        assert_eq!(out.len(), 1);
        assert_eq!(out[&good], "# Title\nbody");
        assert!(!out.contains_key(&missing));
    }

    #[tokio::test]
    async fn document_converter_tolerates_broken_files() {
        let tmp = tempfile::TempDir::new().unwrap();
        let broken = tmp.path().join("broken.docx");
        std::fs::write(&broken, b"not a zip").unwrap();

        let out = DocumentConverter.convert_batch(&[broken]).await.unwrap();
        assert!(out.is_empty());
    }

    #[test]
    fn registry_lookup_is_case_insensitive() {
        let registry = ConverterRegistry::with_defaults();
        assert_eq!(registry.get("MD").map(|c| c.name().to_string()).as_deref(), Some("text"));
        assert_eq!(registry.get("pdf").map(|c| c.name().to_string()).as_deref(), Some("document"));
        assert!(!registry.supports("exe"));
    }
}
