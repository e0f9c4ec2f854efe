use anyhow::Result;
use roxmltree::{Document, Node};

use crate::table::{column_widths, format_rows};

/// Flatten an XML document into a padded, tab-separated table.
///
/// An element's attribute values followed by the text of its leaf children
/// form a row. Children that have children of their own produce their own
/// rows, prefixed with the values collected so far.
pub fn convert(content: &str) -> Result<String> {
    let document = Document::parse(content)?;

    let mut flattener = Flattener::default();
    flattener.visit(document.root_element(), &[]);

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
    fn visit(&mut self, element: Node, context: &[String]) {
        let mut row = context.to_vec();

        for attribute in element.attributes() {
            self.headers.push(attribute.value().to_string());
            row.push(attribute.value().to_string());
        }

        for child in element.children().filter(Node::is_element) {
            if child.children().any(|node| node.is_element()) {
                if let Some(last) = row.last() {
                    self.headers.push(last.clone());
                }
                self.visit(child, &row);
            } else {
                let text = text_content(child);
                let text = text.trim();
                if !text.is_empty() {
                    row.push(text.to_string());
                }
            }
        }

        if row.iter().any(|value| !self.headers.contains(value)) {
            self.rows.push(row);
        }
    }
}

fn text_content(node: Node) -> String {
    node.descendants()
        .filter(Node::is_text)
        .filter_map(|text| text.text())
        .collect()
}
