use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum SqlType {
    Int,
    /// Text bounded to the given number of characters.
    Varchar(u32),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ColumnDef {
    pub name: String,
    pub ty: SqlType,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TableDef {
    pub name: String,
    pub columns: Vec<ColumnDef>,
    /// Identity column; ids come from the table's auto-increment counter.
    pub primary_key: String,
}

impl TableDef {
    pub fn column_names(&self) -> Vec<String> {
        self.columns.iter().map(|c| c.name.clone()).collect()
    }

    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns
            .iter()
            .position(|c| c.name.eq_ignore_ascii_case(name))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Cell {
    Null,
    Int(i64),
    Text(String),
}

impl Cell {
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Cell::Int(i) => Some(*i),
            _ => None,
        }
    }

    /// Text rendering used by search; NULL has none.
    pub fn as_text(&self) -> Option<String> {
        match self {
            Cell::Null => None,
            Cell::Int(i) => Some(i.to_string()),
            Cell::Text(s) => Some(s.clone()),
        }
    }

    pub fn to_json(&self) -> Value {
        match self {
            Cell::Null => Value::Null,
            Cell::Int(i) => Value::from(*i),
            Cell::Text(s) => Value::String(s.clone()),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Row {
    /// Values aligned to TableDef.columns.
    pub values: Vec<Cell>,
}

impl Row {
    /// JSON object keyed by column name, in column order.
    pub fn to_json_object(&self, def: &TableDef) -> Value {
        let mut obj = Map::with_capacity(def.columns.len());
        for (col, cell) in def.columns.iter().zip(self.values.iter()) {
            obj.insert(col.name.clone(), cell.to_json());
        }
        Value::Object(obj)
    }
}

/// The body served by `GET /data` and stored in the query cache.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PageEnvelope {
    pub table_name: String,
    pub data: Vec<Value>,
    pub total: u64,
}
