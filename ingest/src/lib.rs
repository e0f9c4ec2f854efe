//! Conversion of input files into the plain-text records that are written
//! verbatim into a peer's sandbox.
//!
//! Every supported format is flattened into one record per line, with the
//! fields of a record separated by whitespace.

use std::fs;
use std::path::Path;

use anyhow::{anyhow, Context, Result};
use tracing::debug;

pub mod arff;
pub mod csv;
pub mod json;
mod table;
pub mod xml;

/// A supported input file format.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileKind {
    Txt,
    Csv,
    Json,
    Arff,
    Xml,
}

impl FileKind {
    /// Resolve the kind of a file from its extension.
    pub fn from_path(path: &Path) -> Result<Self> {
        let extension = path
            .extension()
            .and_then(|ext| ext.to_str())
            .map(str::to_ascii_lowercase)
            .unwrap_or_default();

        match extension.as_str() {
            "txt" => Ok(FileKind::Txt),
            "csv" => Ok(FileKind::Csv),
            "json" => Ok(FileKind::Json),
            "arff" => Ok(FileKind::Arff),
            "xml" => Ok(FileKind::Xml),
            _ => Err(anyhow!("unsupported file format: {}", path.display())),
        }
    }
}

/// Convert the content of a file of the given kind to plain text.
pub fn convert(kind: FileKind, content: &str) -> Result<String> {
    match kind {
        FileKind::Txt => Ok(content.to_string()),
        FileKind::Csv => csv::convert(content).context("failed to process CSV"),
        FileKind::Json => json::convert(content).context("failed to process JSON"),
        FileKind::Arff => arff::convert(content).context("failed to process ARFF"),
        FileKind::Xml => xml::convert(content).context("failed to process XML"),
    }
}

/// Read and convert a single file.
pub fn convert_file(path: &Path) -> Result<String> {
    let kind = FileKind::from_path(path)?;
    let content = fs::read_to_string(path)
        .with_context(|| format!("failed to read {}", path.display()))?;

    debug!("converting {} as {kind:?}", path.display());
    convert(kind, &content)
}

/// Convert several files and join their contents with newlines.
pub fn concatenate<P: AsRef<Path>>(paths: &[P]) -> Result<String> {
    let contents = paths
        .iter()
        .map(|path| convert_file(path.as_ref()))
        .collect::<Result<Vec<_>>>()?;

    Ok(contents.join("\n"))
}
