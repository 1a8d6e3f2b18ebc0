use crate::error::SheetError;
use crate::sql::{self, quote_ident, MAX_IDENTIFIER_LEN};
use crate::store::Store;
use regex::Regex;
use std::sync::OnceLock;

/// Name of the identity column prepended to every upload table.
pub const ID_COLUMN: &str = "id";
pub const TABLE_PREFIX: &str = "data_";
const COLUMN_TYPE: &str = "VARCHAR(255)";

/// Definition derived from a header row for a freshly named table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableSchema {
    pub table_name: String,
    /// Header-derived columns, without the identity column.
    pub columns: Vec<String>,
    pub create_statement: String,
}

impl TableSchema {
    /// Parameterized multi-row insert over the header columns.
    pub fn insert_statement(&self, rows: usize) -> String {
        let cols = self
            .columns
            .iter()
            .map(|c| quote_ident(c))
            .collect::<Vec<_>>()
            .join(", ");
        let tuple = format!("({})", vec!["?"; self.columns.len()].join(", "));
        format!(
            "INSERT INTO {} ({cols}) VALUES {}",
            quote_ident(&self.table_name),
            vec![tuple.as_str(); rows].join(", ")
        )
    }
}

pub fn table_name_for(created_at_millis: i64) -> String {
    format!("{TABLE_PREFIX}{created_at_millis}")
}

/// Ingest timestamp encoded in a generated table name.
pub fn table_timestamp(name: &str) -> Option<i64> {
    static RE: OnceLock<Regex> = OnceLock::new();
    let re = RE.get_or_init(|| Regex::new(r"^data_(\d+)$").expect("valid regex"));
    re.captures(name)?.get(1)?.as_str().parse().ok()
}

pub fn synthesize(
    headers: &[Option<String>],
    created_at_millis: i64,
) -> Result<TableSchema, SheetError> {
    if headers.is_empty() {
        return Err(SheetError::BadFormat("header row is empty".into()));
    }
    let mut columns = Vec::with_capacity(headers.len());
    for (i, header) in headers.iter().enumerate() {
        let name = header
            .as_deref()
            .ok_or_else(|| SheetError::BadFormat(format!("header cell {} is empty", i + 1)))?;
        check_header(i, name)?;
        columns.push(name.to_string());
    }

    let table_name = table_name_for(created_at_millis);
    let column_defs = columns
        .iter()
        .map(|c| format!("{} {COLUMN_TYPE}", quote_ident(c)))
        .collect::<Vec<_>>()
        .join(", ");
    let create_statement = format!(
        "CREATE TABLE {} ({} INT NOT NULL AUTO_INCREMENT PRIMARY KEY, {column_defs})",
        quote_ident(&table_name),
        quote_ident(ID_COLUMN),
    );

    Ok(TableSchema {
        table_name,
        columns,
        create_statement,
    })
}

fn check_header(i: usize, name: &str) -> Result<(), SheetError> {
    if name.trim().is_empty() {
        return Err(SheetError::BadFormat(format!("header cell {} is blank", i + 1)));
    }
    if name.chars().count() > MAX_IDENTIFIER_LEN {
        return Err(SheetError::BadFormat(format!(
            "header '{name}' is longer than {MAX_IDENTIFIER_LEN} characters"
        )));
    }
    if name.chars().any(char::is_control) {
        return Err(SheetError::BadFormat(format!(
            "header {name:?} contains control characters"
        )));
    }
    Ok(())
}

/// Issues the schema's DDL against storage.
pub fn create_table(store: &Store, schema: &TableSchema) -> Result<(), SheetError> {
    sql::execute(&schema.create_statement, &[], store)?;
    Ok(())
}

/// Ordered field names of a table, read from the live catalog.
pub fn columns_of(store: &Store, table: &str) -> Result<Vec<String>, SheetError> {
    Ok(store.get_table(table)?.column_names())
}

/// Generated upload tables, oldest first.
pub fn upload_tables(store: &Store) -> Result<Vec<(i64, String)>, SheetError> {
    let mut tables: Vec<(i64, String)> = store
        .list_tables()?
        .into_iter()
        .filter_map(|name| table_timestamp(&name).map(|ts| (ts, name)))
        .collect();
    tables.sort();
    Ok(tables)
}
