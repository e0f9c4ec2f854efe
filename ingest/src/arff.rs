use anyhow::Result;
use tracing::debug;

/// Emit the `@data` section of an ARFF file as space-separated records.
///
/// Comments (`%`) and blank lines are skipped. Each value is trimmed and
/// loses one surrounding quote character.
pub fn convert(content: &str) -> Result<String> {
    let mut attributes = Vec::new();
    let mut rows = Vec::new();
    let mut in_data = false;

    for line in content.split('\n') {
        let line = line.trim();
        if line.is_empty() || line.starts_with('%') {
            continue;
        }

        if line.starts_with("@attribute") {
            if let Some(name) = line.split(' ').nth(1) {
                attributes.push(name.to_string());
            }
        }

        if line.starts_with("@data") {
            in_data = true;
            continue;
        }

        if in_data {
            let row = line
                .split(',')
                .map(|value| unquote(value.trim()))
                .collect::<Vec<_>>()
                .join(" ");
            rows.push(row);
        }
    }

    debug!("ARFF relation with {} attributes, {} rows", attributes.len(), rows.len());
    Ok(rows.join("\n"))
}

fn unquote(value: &str) -> &str {
    let is_quote = |c: char| c == '\'' || c == '"';
    let value = value.strip_prefix(is_quote).unwrap_or(value);
    value.strip_suffix(is_quote).unwrap_or(value)
}
