use anyhow::{anyhow, Result};
use ::csv::{ReaderBuilder, Trim};

const DELIMITERS: [char; 4] = [',', ';', '|', '\t'];

/// How many lines are inspected when guessing the delimiter.
const SAMPLE_LINES: usize = 10;

/// Guess the delimiter from the first few non-empty lines.
///
/// The delimiter that splits the sample into the most fields wins; ties go
/// to the earlier entry of [`DELIMITERS`].
pub fn detect_delimiter(content: &str) -> Option<char> {
    let sample = content
        .split('\n')
        .filter(|line| !line.trim().is_empty())
        .take(SAMPLE_LINES)
        .collect::<Vec<_>>()
        .join("\n");

    let mut best = (DELIMITERS[0], sample.split(DELIMITERS[0]).count());
    for delimiter in &DELIMITERS[1..] {
        let count = sample.split(*delimiter).count();
        if count > best.1 {
            best = (*delimiter, count);
        }
    }

    (best.1 > 1).then_some(best.0)
}

/// Drop the header row and emit one space-separated record per data row.
pub fn convert(content: &str) -> Result<String> {
    let delimiter =
        detect_delimiter(content).ok_or_else(|| anyhow!("could not detect the CSV delimiter"))?;

    let mut reader = ReaderBuilder::new()
        .has_headers(true)
        .delimiter(delimiter as u8)
        .trim(Trim::All)
        .flexible(true)
        .from_reader(content.as_bytes());

    let mut rows = Vec::new();
    for record in reader.records() {
        let record = record?;
        if record.iter().all(str::is_empty) {
            continue;
        }
        rows.push(record.iter().collect::<Vec<_>>().join(" "));
    }

    Ok(rows.join("\n"))
}
