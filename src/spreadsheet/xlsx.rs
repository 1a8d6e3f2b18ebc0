use super::{finish_row, Matrix, SpreadsheetError};
use quick_xml::escape::resolve_xml_entity;
use quick_xml::events::{BytesRef, BytesStart, Event};
use quick_xml::name::QName;
use quick_xml::Reader;
use std::borrow::Cow;
use std::collections::{BTreeMap, HashMap};
use std::io::{BufRead, BufReader, Cursor, Read, Seek};
use zip::read::ZipFile;
use zip::result::ZipError;
use zip::ZipArchive;

// XML tag names for the parts of an .xlsx package we read
const TAG_RELATIONSHIP: &[u8] = b"Relationship";
const TAG_SHEET: QName = QName(b"sheet");
const TAG_SHARED_STRING_ITEM: QName = QName(b"si");
const TAG_PHONETIC_TEXT: QName = QName(b"rPh");
const TAG_TEXT: QName = QName(b"t");
const TAG_ROW: QName = QName(b"row");
const TAG_CELL: QName = QName(b"c");
const TAG_VALUE: QName = QName(b"v");

// Largest sheet a workbook may describe: column XFD, row 1048576
const MAX_COLS: usize = 16_384;
const MAX_ROWS: usize = 1_048_576;

type XmlReader<R> = Reader<BufReader<R>>;

/// Reads the first worksheet of an .xlsx package held in memory.
pub(super) fn read_first_sheet(bytes: &[u8]) -> Result<Matrix, SpreadsheetError> {
    let mut zip = ZipArchive::new(Cursor::new(bytes))?;
    let relationships = load_relationships(&mut zip, "xl/_rels/workbook.xml.rels")?;
    let sheet_path = first_sheet_path(&mut zip, &relationships)?;
    let shared_strings = load_shared_strings(&mut zip)?;
    read_sheet(&mut zip, &sheet_path, &shared_strings)
}

/// Finds a package part by name, ignoring case and path separator style.
fn xml_reader<'z, R: Read + Seek>(
    zip: &'z mut ZipArchive<R>,
    name: &str,
) -> Result<Option<XmlReader<ZipFile<'z, R>>>, SpreadsheetError> {
    let pattern = name.replace('\\', "/");
    let path = zip
        .file_names()
        .find(|file_name| pattern.eq_ignore_ascii_case(file_name))
        .map(|file_name| file_name.to_owned());
    let file = match path.map(|file_name| zip.by_name(&file_name)).transpose() {
        Ok(file) => file,
        Err(ZipError::FileNotFound) => None,
        Err(error) => return Err(error.into()),
    };
    Ok(file.map(|file| {
        let mut reader = Reader::from_reader(BufReader::new(file));
        let config = reader.config_mut();
        config.check_comments = false;
        config.check_end_names = false;
        config.expand_empty_elements = true;
        config.trim_text(false);
        reader
    }))
}

fn attribute<'a>(event: &'a BytesStart<'a>, name: &str) -> Result<Option<Cow<'a, str>>, SpreadsheetError> {
    match event.try_get_attribute(name)? {
        Some(attribute) => Ok(Some(attribute.unescape_value()?)),
        None => Ok(None),
    }
}

fn load_relationships<R: Read + Seek>(
    zip: &mut ZipArchive<R>,
    path: &str,
) -> Result<HashMap<String, String>, SpreadsheetError> {
    let mut reader =
        xml_reader(zip, path)?.ok_or_else(|| SpreadsheetError::MissingPart(path.to_string()))?;
    let mut relationships = HashMap::new();
    let mut buffer = Vec::new();
    loop {
        match reader.read_event_into(&mut buffer)? {
            Event::Eof => break,
            Event::Start(event) if event.local_name().as_ref() == TAG_RELATIONSHIP => {
                let id = attribute(&event, "Id")?;
                let kind = attribute(&event, "Type")?;
                let target = attribute(&event, "Target")?;
                // Only worksheet relationships matter here
                if kind.map(|it| it.ends_with("/worksheet")).unwrap_or(true) {
                    if let Some((id, target)) = id.zip(target) {
                        relationships.insert(id.to_string(), to_zip_path(&target));
                    }
                }
            }
            _ => {}
        }
        buffer.clear();
    }
    Ok(relationships)
}

fn first_sheet_path<R: Read + Seek>(
    zip: &mut ZipArchive<R>,
    relationships: &HashMap<String, String>,
) -> Result<String, SpreadsheetError> {
    let mut reader = xml_reader(zip, "xl/workbook.xml")?
        .ok_or_else(|| SpreadsheetError::MissingPart("xl/workbook.xml".to_string()))?;
    let mut buffer = Vec::new();
    loop {
        match reader.read_event_into(&mut buffer)? {
            Event::Eof => break,
            Event::Start(event) if event.name() == TAG_SHEET => {
                for result in event.attributes() {
                    let attribute = result?;
                    if attribute.key.local_name().as_ref() == b"id" {
                        let id = attribute.unescape_value()?;
                        if let Some(path) = relationships.get(id.as_ref()) {
                            return Ok(path.to_owned());
                        }
                    }
                }
            }
            _ => {}
        }
        buffer.clear();
    }
    Err(SpreadsheetError::NoSheets)
}

fn load_shared_strings<R: Read + Seek>(
    zip: &mut ZipArchive<R>,
) -> Result<Vec<String>, SpreadsheetError> {
    let Some(mut reader) = xml_reader(zip, "xl/sharedStrings.xml")? else {
        return Ok(Vec::new());
    };
    let mut strings = Vec::new();
    let mut current = String::new();
    let mut in_item = false;
    let mut in_phonetic = false;
    let mut in_text = false;
    let mut buffer = Vec::new();
    loop {
        match reader.read_event_into(&mut buffer)? {
            Event::Eof => break,
            Event::Start(event) if event.name() == TAG_SHARED_STRING_ITEM => {
                in_item = true;
                current.clear();
            }
            Event::End(event) if event.name() == TAG_SHARED_STRING_ITEM => {
                in_item = false;
                strings.push(std::mem::take(&mut current));
            }
            Event::Start(event) if event.name() == TAG_PHONETIC_TEXT => in_phonetic = true,
            Event::End(event) if event.name() == TAG_PHONETIC_TEXT => in_phonetic = false,
            Event::Start(event) if in_item && !in_phonetic && event.name() == TAG_TEXT => {
                in_text = true
            }
            Event::End(event) if event.name() == TAG_TEXT => in_text = false,
            Event::Text(event) if in_text => current.push_str(&event.xml_content()?),
            Event::CData(event) if in_text => current.push_str(&event.xml_content()?),
            Event::GeneralRef(event) if in_text => push_entity(&mut current, &event)?,
            _ => {}
        }
        buffer.clear();
    }
    Ok(strings)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CellKind {
    Raw,
    SharedString,
    InlineString,
}

/// Sparse cells of one sheet, keyed by zero-based (row, col).
#[derive(Default)]
struct SheetCells {
    rows: BTreeMap<usize, BTreeMap<usize, String>>,
    min_col: Option<usize>,
}

impl SheetCells {
    fn push(&mut self, row: usize, col: usize, value: String) -> Result<(), SpreadsheetError> {
        if row >= MAX_ROWS || col >= MAX_COLS {
            return Err(SpreadsheetError::CellOutOfRange(format!(
                "row {}, column {}",
                row.saturating_add(1),
                col.saturating_add(1)
            )));
        }
        if value.is_empty() {
            return Ok(());
        }
        self.min_col = Some(self.min_col.map_or(col, |c| c.min(col)));
        self.rows.entry(row).or_default().insert(col, value);
        Ok(())
    }

    fn into_matrix(self) -> Matrix {
        let origin = self.min_col.unwrap_or(0);
        self.rows
            .into_values()
            .filter_map(|cells| {
                let width = cells.keys().next_back().map_or(0, |c| c + 1 - origin);
                let mut row = vec![None; width];
                for (col, value) in cells {
                    row[col - origin] = Some(value);
                }
                finish_row(row)
            })
            .collect()
    }
}

fn read_sheet<R: Read + Seek>(
    zip: &mut ZipArchive<R>,
    path: &str,
    shared_strings: &[String],
) -> Result<Matrix, SpreadsheetError> {
    let mut reader =
        xml_reader(zip, path)?.ok_or_else(|| SpreadsheetError::MissingPart(path.to_string()))?;
    read_cells(&mut reader, shared_strings).map(SheetCells::into_matrix)
}

fn read_cells<B: BufRead>(
    reader: &mut Reader<B>,
    shared_strings: &[String],
) -> Result<SheetCells, SpreadsheetError> {
    let mut cells = SheetCells::default();
    let mut row = 0usize;
    let mut next_row = 0usize;
    let mut col = 0usize;
    let mut next_col = 0usize;
    let mut kind = CellKind::Raw;
    let mut in_cell = false;
    let mut in_text = false;
    let mut in_phonetic = false;
    let mut value = String::new();
    let mut buffer = Vec::new();
    loop {
        match reader.read_event_into(&mut buffer)? {
            Event::Eof => break,
            Event::Start(event) if event.name() == TAG_ROW => {
                row = match attribute(&event, "r")? {
                    Some(r) => row_number(&r)?.saturating_sub(1),
                    None => next_row,
                };
                next_row = row.saturating_add(1);
                next_col = 0;
            }
            Event::Start(event) if event.name() == TAG_CELL => {
                let position = match attribute(&event, "r")? {
                    Some(reference) => reference_to_index(&reference)?,
                    None => None,
                };
                (row, col) = position.unwrap_or((row, next_col));
                next_col = col.saturating_add(1);
                kind = match attribute(&event, "t")?.as_deref() {
                    Some("s") => CellKind::SharedString,
                    Some("inlineStr") => CellKind::InlineString,
                    _ => CellKind::Raw,
                };
                in_cell = true;
                value.clear();
            }
            Event::End(event) if event.name() == TAG_CELL => {
                in_cell = false;
                let text = match kind {
                    CellKind::SharedString if !value.is_empty() => {
                        let index = value.trim().parse::<usize>()?;
                        shared_strings
                            .get(index)
                            .cloned()
                            .ok_or(SpreadsheetError::SharedStringOutOfRange(index))?
                    }
                    _ => std::mem::take(&mut value),
                };
                cells.push(row, col, text)?;
            }
            Event::Start(event) if event.name() == TAG_PHONETIC_TEXT => in_phonetic = true,
            Event::End(event) if event.name() == TAG_PHONETIC_TEXT => in_phonetic = false,
            Event::Start(event)
                if in_cell
                    && !in_phonetic
                    && (event.name() == TAG_VALUE
                        || (kind == CellKind::InlineString && event.name() == TAG_TEXT)) =>
            {
                in_text = true
            }
            Event::End(event) if event.name() == TAG_VALUE || event.name() == TAG_TEXT => {
                in_text = false
            }
            Event::Text(event) if in_text => value.push_str(&event.xml_content()?),
            Event::CData(event) if in_text => value.push_str(&event.xml_content()?),
            Event::GeneralRef(event) if in_text => push_entity(&mut value, &event)?,
            _ => {}
        }
        buffer.clear();
    }
    Ok(cells)
}

/// Appends a character or predefined entity reference.
fn push_entity(text: &mut String, bytes: &BytesRef) -> Result<(), SpreadsheetError> {
    let raw = bytes.xml_content()?;
    if let Some(number) = raw.strip_prefix('#') {
        let code = if let Some(hex) = number.strip_prefix('x') {
            u32::from_str_radix(hex, 16)?
        } else {
            number.parse::<u32>()?
        };
        if let Some(character) = char::from_u32(code) {
            text.push(character);
        }
    } else if let Some(entity) = resolve_xml_entity(&raw) {
        text.push_str(entity);
    } else {
        return Err(SpreadsheetError::Entity(raw.to_string()));
    }
    Ok(())
}

/// Normalizes a relationship target to a path inside the package.
fn to_zip_path(path: &str) -> String {
    if let Some(stripped) = path.strip_prefix('/') {
        stripped.to_string()
    } else if path.starts_with("xl/") {
        path.to_string()
    } else {
        format!("xl/{path}")
    }
}

/// One-based row number of a `<row r="...">` attribute.
fn row_number(raw: &str) -> Result<usize, SpreadsheetError> {
    let out_of_range = || SpreadsheetError::CellOutOfRange(format!("row {raw}"));
    if !raw.is_empty() && raw.bytes().all(|b| b.is_ascii_digit()) {
        return raw
            .parse::<usize>()
            .ok()
            .filter(|n| *n <= MAX_ROWS)
            .ok_or_else(out_of_range);
    }
    Ok(raw.parse::<usize>()?)
}

/// Converts an A1-style reference to zero-based (row, col). Malformed
/// references yield `None`; well-formed ones past XFD1048576 are an error.
fn reference_to_index(reference: &str) -> Result<Option<(usize, usize)>, SpreadsheetError> {
    let Some(split) = reference.find(|c: char| c.is_ascii_digit()) else {
        return Ok(None);
    };
    let (letters, digits) = reference.split_at(split);
    if letters.is_empty()
        || !letters.bytes().all(|b| b.is_ascii_alphabetic())
        || !digits.bytes().all(|b| b.is_ascii_digit())
    {
        return Ok(None);
    }
    let out_of_range = || SpreadsheetError::CellOutOfRange(reference.to_string());

    let mut col = 0usize;
    for b in letters.bytes() {
        let digit = usize::from(b.to_ascii_uppercase() - b'A' + 1);
        col = col
            .checked_mul(26)
            .and_then(|c| c.checked_add(digit))
            .filter(|c| *c <= MAX_COLS)
            .ok_or_else(out_of_range)?;
    }
    let row = match digits.parse::<usize>() {
        Ok(0) => return Ok(None),
        Ok(row) if row <= MAX_ROWS => row,
        _ => return Err(out_of_range()),
    };
    Ok(Some((row - 1, col - 1)))
}
