//! Upload decoding: turns a spreadsheet buffer into a matrix of raw cell text.
//!
//! Only the first sheet is read. Cells keep their literal text (no type
//! inference); missing cells are `None`, trailing missing cells are trimmed
//! and rows without any cell are skipped.

mod delimited;
mod xlsx;

use thiserror::Error;

/// Rows of optional cell text, in sheet order.
pub type Matrix = Vec<Vec<Option<String>>>;

const ZIP_MAGIC: &[u8] = b"PK\x03\x04";
const CFB_MAGIC: &[u8] = &[0xD0, 0xCF, 0x11, 0xE0];

#[derive(Error, Debug)]
pub enum SpreadsheetError {
    #[error("{0}")]
    Zip(#[from] zip::result::ZipError),

    #[error("{0}")]
    Xml(#[from] quick_xml::Error),

    #[error("{0}")]
    XmlAttribute(#[from] quick_xml::events::attributes::AttrError),

    #[error("{0}")]
    XmlEncoding(#[from] quick_xml::encoding::EncodingError),

    #[error("{0}")]
    Csv(#[from] csv::Error),

    #[error("{0}")]
    ParseInt(#[from] std::num::ParseIntError),

    #[error("workbook part '{0}' is missing")]
    MissingPart(String),

    #[error("workbook has no sheets")]
    NoSheets,

    #[error("shared string index {0} out of range")]
    SharedStringOutOfRange(usize),

    #[error("cell '{0}' lies outside the sheet bounds")]
    CellOutOfRange(String),

    #[error("cannot resolve XML entity '{0}'")]
    Entity(String),

    #[error("unsupported spreadsheet format: {0}")]
    Unsupported(&'static str),

    #[error("unrecognized file content")]
    Unrecognized,
}

/// Decodes the first sheet of an upload.
pub fn decode(bytes: &[u8]) -> Result<Matrix, SpreadsheetError> {
    if bytes.is_empty() {
        return Ok(Vec::new());
    }
    if bytes.starts_with(ZIP_MAGIC) {
        return xlsx::read_first_sheet(bytes);
    }
    if bytes.starts_with(CFB_MAGIC) {
        return Err(SpreadsheetError::Unsupported("legacy binary .xls"));
    }
    if std::str::from_utf8(bytes).is_ok() {
        return delimited::read(bytes);
    }
    Err(SpreadsheetError::Unrecognized)
}

/// Drops trailing empty cells; returns `None` for a row with no cells at all.
fn finish_row(mut row: Vec<Option<String>>) -> Option<Vec<Option<String>>> {
    while matches!(row.last(), Some(None)) {
        row.pop();
    }
    if row.is_empty() {
        None
    } else {
        Some(row)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_upload_is_an_empty_matrix() {
        assert!(decode(b"").unwrap().is_empty());
    }

    #[test]
    fn legacy_xls_is_reported() {
        let err = decode(&[0xD0, 0xCF, 0x11, 0xE0, 0, 0]).unwrap_err();
        assert!(matches!(err, SpreadsheetError::Unsupported(_)));
    }

    #[test]
    fn binary_garbage_is_unrecognized() {
        let err = decode(&[0xff, 0xfe, 0x00, 0x81]).unwrap_err();
        assert!(matches!(err, SpreadsheetError::Unrecognized));
    }

    #[test]
    fn finish_row_trims_trailing_gaps() {
        let row = vec![Some("a".to_string()), None, Some("c".to_string()), None];
        assert_eq!(finish_row(row).unwrap().len(), 3);
        assert!(finish_row(vec![None, None]).is_none());
    }
}
