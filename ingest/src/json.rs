use anyhow::Result;
use serde_json::Value;

use crate::table::{column_widths, format_rows};

/// Flatten a JSON document into a padded, tab-separated table.
///
/// Scalar fields of an object form a row. Nested objects and arrays of
/// objects produce their own rows, prefixed with the scalar fields of their
/// parents collected so far.
pub fn convert(content: &str) -> Result<String> {
    let document: Value = serde_json::from_str(content)?;

    let mut flattener = Flattener::default();
    flattener.visit(&document, &[]);

    let widths = column_widths(&flattener.rows);
    Ok(format_rows(&flattener.rows, &widths))
}

#[derive(Default)]
struct Flattener {
    rows: Vec<Vec<String>>,

    /// Values already emitted as the prefix of nested rows.
    headers: Vec<String>,
}

impl Flattener {
    fn visit(&mut self, item: &Value, context: &[String]) {
        match item {
            Value::Array(items) => {
                for sub_item in items {
                    self.visit(sub_item, context);
                }
            }
            Value::Object(fields) => {
                let mut local = context.to_vec();
                for (key, value) in fields {
                    match value {
                        Value::Array(items) => {
                            self.headers.extend(local.iter().cloned());
                            for sub_item in items {
                                self.visit(sub_item, &local);
                            }
                        }
                        Value::Object(_) => {
                            let mut nested = local.clone();
                            nested.push(key.clone());
                            self.visit(value, &nested);
                        }
                        scalar => local.push(scalar_text(scalar)),
                    }
                }

                // A row made only of values already used as prefixes adds nothing.
                if local.iter().any(|value| !self.headers.contains(value)) {
                    self.rows.push(local);
                }
            }
            scalar => {
                let mut row = context.to_vec();
                row.push(scalar_text(scalar));
                self.rows.push(row);
            }
        }
    }
}

fn scalar_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}
