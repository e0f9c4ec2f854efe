/// Width of every column, measured in characters.
pub(crate) fn column_widths(rows: &[Vec<String>]) -> Vec<usize> {
    let mut widths: Vec<usize> = Vec::new();
    for row in rows {
        for (i, col) in row.iter().enumerate() {
            let len = col.chars().count();
            match widths.get_mut(i) {
                Some(width) => *width = (*width).max(len),
                None => widths.push(len),
            }
        }
    }
    widths
}

/// Pad every cell to its column width and lay the rows out as
/// tab-separated lines.
pub(crate) fn format_rows(rows: &[Vec<String>], widths: &[usize]) -> String {
    rows.iter()
        .map(|row| {
            row.iter()
                .enumerate()
                .map(|(i, col)| format!("{col:<width$}", width = widths[i]))
                .collect::<Vec<_>>()
                .join("\t")
        })
        .collect::<Vec<_>>()
        .join("\n")
}
