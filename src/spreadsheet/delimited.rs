use super::{finish_row, Matrix, SpreadsheetError};

const UTF8_BOM: &[u8] = b"\xEF\xBB\xBF";

/// Reads comma-separated text. Empty fields become missing cells.
pub(super) fn read(bytes: &[u8]) -> Result<Matrix, SpreadsheetError> {
    let bytes = bytes.strip_prefix(UTF8_BOM).unwrap_or(bytes);
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .from_reader(bytes);

    let mut rows = Vec::new();
    for record in reader.records() {
        let record = record?;
        let cells = record
            .iter()
            .map(|field| (!field.is_empty()).then(|| field.to_string()))
            .collect();
        if let Some(row) = finish_row(cells) {
            rows.push(row);
        }
    }
    Ok(rows)
}
