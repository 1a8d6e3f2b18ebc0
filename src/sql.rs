use crate::error::SheetError;
use crate::model::{Cell, ColumnDef, Row, SqlType, TableDef};
use crate::store::Store;
use sqlparser::ast::{self, Ident, ObjectName, ObjectNamePart, SetExpr, Statement};
use sqlparser::dialect::MySqlDialect;
use sqlparser::parser::Parser;
use std::collections::HashSet;

/// Longest identifier the catalog accepts, in characters.
pub const MAX_IDENTIFIER_LEN: usize = 64;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecOutput {
    pub affected_rows: u64,
    pub last_insert_id: i64,
}

/// Backtick-quotes an identifier, doubling embedded backticks.
pub fn quote_ident(name: &str) -> String {
    Ident::with_quote('`', name).to_string()
}

/// Executes a single DDL or DML statement. Each `?` outside quotes is bound
/// to the next entry of `params`.
pub fn execute(query: &str, params: &[Cell], store: &Store) -> Result<ExecOutput, SheetError> {
    let bound = bind_params(query, params)?;
    let q = strip_trailing_semicolon(&bound);

    let dialect = MySqlDialect {};
    let ast = Parser::parse_sql(&dialect, q).map_err(|e| SheetError::Parse(e.to_string()))?;
    let Some(stmt) = ast.first() else {
        return Ok(ExecOutput {
            affected_rows: 0,
            last_insert_id: 0,
        });
    };
    if ast.len() > 1 {
        return Err(SheetError::NotSupported(
            "multiple statements in one call".into(),
        ));
    }

    match stmt {
        Statement::CreateTable(c) => handle_create_table(store, &c.name, &c.columns),
        Statement::Insert(insert) => handle_insert(store, insert),
        _ => Err(SheetError::NotSupported(format!(
            "Statement not implemented: {stmt}"
        ))),
    }
}

fn strip_trailing_semicolon(s: &str) -> &str {
    let s = s.trim();
    if let Some(stripped) = s.strip_suffix(';') {
        stripped.trim()
    } else {
        s
    }
}

fn bind_params(template: &str, params: &[Cell]) -> Result<String, SheetError> {
    let parts = split_query_template(template);
    if parts.len() - 1 != params.len() {
        return Err(SheetError::Parse(format!(
            "statement expects {} parameters, got {}",
            parts.len() - 1,
            params.len()
        )));
    }
    let mut out = String::with_capacity(template.len() + params.len() * 8);
    let mut param_iter = params.iter();
    for (i, part) in parts.iter().enumerate() {
        out.push_str(part);
        if i < parts.len() - 1 {
            if let Some(p) = param_iter.next() {
                out.push_str(&cell_to_sql(p));
            }
        }
    }
    Ok(out)
}

fn split_query_template(query: &str) -> Vec<&str> {
    let mut out = Vec::new();
    let mut last = 0;
    let mut in_sq = false;
    let mut in_bq = false;
    let mut chars = query.char_indices().peekable();

    while let Some((i, ch)) = chars.next() {
        match ch {
            '\\' if in_sq => {
                chars.next();
            }
            '\'' if !in_bq => {
                if in_sq {
                    if let Some((_, '\'')) = chars.peek() {
                        chars.next();
                    } else {
                        in_sq = false;
                    }
                } else {
                    in_sq = true;
                }
            }
            '`' if !in_sq => {
                in_bq = !in_bq;
            }
            '?' if !in_sq && !in_bq => {
                out.push(&query[last..i]);
                last = i + ch.len_utf8();
            }
            _ => {}
        }
    }
    out.push(&query[last..]);
    out
}

fn cell_to_sql(cell: &Cell) -> String {
    match cell {
        Cell::Null => "NULL".to_string(),
        // Data columns are all VARCHAR.
        Cell::Int(n) => format!("'{n}'"),
        Cell::Text(s) => format!("'{}'", escape_sql_string(s)),
    }
}

// The MySQL dialect treats backslash as an escape inside string literals.
fn escape_sql_string(input: &str) -> String {
    input.replace('\\', "\\\\").replace('\'', "''")
}

fn get_ident_name(part: &ObjectNamePart) -> String {
    match part {
        ObjectNamePart::Identifier(i) => i.value.clone(),
        _ => "".to_string(),
    }
}

fn table_name_of(name: &ObjectName) -> Result<String, SheetError> {
    match name.0.as_slice() {
        [part] => Ok(get_ident_name(part)),
        _ => Err(SheetError::NotSupported(
            "qualified table names are not supported".into(),
        )),
    }
}

fn validate_identifier(kind: &str, name: &str) -> Result<(), SheetError> {
    if name.trim().is_empty() {
        return Err(SheetError::Invalid(format!("empty {kind} name")));
    }
    if name.chars().count() > MAX_IDENTIFIER_LEN {
        return Err(SheetError::Invalid(format!("{kind} name too long: {name}")));
    }
    if name.chars().any(char::is_control) {
        return Err(SheetError::Invalid(format!(
            "{kind} name contains control characters: {name:?}"
        )));
    }
    Ok(())
}

fn handle_create_table(
    store: &Store,
    name: &ObjectName,
    columns: &[ast::ColumnDef],
) -> Result<ExecOutput, SheetError> {
    let table_name = table_name_of(name)?;
    validate_identifier("table", &table_name)?;

    let mut my_columns = Vec::with_capacity(columns.len());
    let mut seen: HashSet<String> = HashSet::new();
    let mut primary_key: Option<(String, bool)> = None;

    for col in columns {
        let col_name = col.name.value.clone();
        validate_identifier("column", &col_name)?;
        if !seen.insert(col_name.to_lowercase()) {
            return Err(SheetError::Invalid(format!(
                "duplicate column name '{col_name}'"
            )));
        }

        let sql_ty = match &col.data_type {
            ast::DataType::Int(_) | ast::DataType::Integer(_) => SqlType::Int,
            ast::DataType::Varchar(Some(ast::CharacterLength::IntegerLength { length, .. })) => {
                let length = u32::try_from(*length).map_err(|_| {
                    SheetError::Invalid(format!("column length too large for '{col_name}'"))
                })?;
                SqlType::Varchar(length)
            }
            other => {
                return Err(SheetError::NotSupported(format!(
                    "column type {other} for '{col_name}'"
                )))
            }
        };

        let mut is_primary = false;
        let mut auto_increment = false;
        for opt in &col.options {
            match &opt.option {
                ast::ColumnOption::PrimaryKey(_) => is_primary = true,
                ast::ColumnOption::DialectSpecific(tokens) => {
                    let text = tokens
                        .iter()
                        .map(|t| t.to_string())
                        .collect::<Vec<_>>()
                        .join(" ");
                    if text.to_ascii_lowercase().contains("auto_increment") {
                        auto_increment = true;
                    }
                }
                _ => {}
            }
        }

        if is_primary {
            if primary_key.is_some() {
                return Err(SheetError::Invalid("multiple primary keys defined".into()));
            }
            primary_key = Some((col_name.clone(), sql_ty == SqlType::Int && auto_increment));
        } else if sql_ty == SqlType::Int {
            return Err(SheetError::NotSupported(format!(
                "INT is reserved for the identity column, not '{col_name}'"
            )));
        }

        my_columns.push(ColumnDef {
            name: col_name,
            ty: sql_ty,
        });
    }

    let (pk, generated) =
        primary_key.ok_or_else(|| SheetError::Invalid("PRIMARY KEY required".into()))?;
    if !generated {
        return Err(SheetError::Invalid(format!(
            "PRIMARY KEY '{pk}' must be an AUTO_INCREMENT INT column"
        )));
    }

    store.create_table(&TableDef {
        name: table_name,
        columns: my_columns,
        primary_key: pk,
    })?;

    Ok(ExecOutput {
        affected_rows: 0,
        last_insert_id: 0,
    })
}

fn handle_insert(store: &Store, insert: &ast::Insert) -> Result<ExecOutput, SheetError> {
    let Some(src) = &insert.source else {
        return Err(SheetError::Parse("INSERT missing source".into()));
    };

    let table_name = match &insert.table {
        ast::TableObject::TableName(name) => name,
        _ => {
            return Err(SheetError::NotSupported(
                "Complex table insert not supported".into(),
            ));
        }
    };
    let table = table_name_of(table_name)?;
    let def = store.get_table(&table)?;
    let pk_index = def
        .column_index(&def.primary_key)
        .ok_or_else(|| SheetError::Invalid("corrupt table: missing primary key column".into()))?;

    if insert.columns.is_empty() {
        return Err(SheetError::NotSupported(
            "INSERT requires an explicit column list".into(),
        ));
    }
    let col_indexes = insert
        .columns
        .iter()
        .map(|c| match def.column_index(&c.value) {
            Some(idx) if idx == pk_index => Err(SheetError::Invalid(format!(
                "column '{}' is generated and cannot be assigned",
                c.value
            ))),
            Some(idx) => Ok(idx),
            None => Err(SheetError::Invalid(format!("unknown column '{}'", c.value))),
        })
        .collect::<Result<Vec<_>, _>>()?;

    let rows_exprs = match src.body.as_ref() {
        SetExpr::Values(values) => &values.rows,
        _ => {
            return Err(SheetError::NotSupported(
                "INSERT only supports VALUES".into(),
            ))
        }
    };

    let mut staged: Vec<Vec<Cell>> = Vec::with_capacity(rows_exprs.len());
    for (row_no, row_exprs) in rows_exprs.iter().enumerate() {
        if row_exprs.len() != col_indexes.len() {
            return Err(SheetError::Invalid(format!(
                "column count doesn't match value count at row {}",
                row_no + 1
            )));
        }
        let mut row_vals = vec![Cell::Null; def.columns.len()];
        for (idx, expr) in col_indexes.iter().zip(row_exprs.iter()) {
            row_vals[*idx] = coerce_cell(eval_expr(expr)?, &def.columns[*idx], row_no + 1)?;
        }
        staged.push(row_vals);
    }

    let first_id = store.allocate_auto_increment(&table, staged.len() as u64)?;
    let out_rows: Vec<(i64, Row)> = staged
        .into_iter()
        .zip(first_id..)
        .map(|(mut values, pk)| {
            values[pk_index] = Cell::Int(pk);
            (pk, Row { values })
        })
        .collect();

    store.insert_rows(&table, &out_rows)?;

    Ok(ExecOutput {
        affected_rows: out_rows.len() as u64,
        last_insert_id: first_id,
    })
}

fn eval_expr(expr: &ast::Expr) -> Result<Cell, SheetError> {
    match expr {
        ast::Expr::Value(v) => match &v.value {
            ast::Value::SingleQuotedString(s) => Ok(Cell::Text(s.clone())),
            ast::Value::Null => Ok(Cell::Null),
            _ => Err(SheetError::NotSupported(format!(
                "Value type not supported: {}",
                v.value
            ))),
        },
        _ => Err(SheetError::NotSupported(format!(
            "Expr not supported: {expr}"
        ))),
    }
}

fn coerce_cell(cell: Cell, coldef: &ColumnDef, row_no: usize) -> Result<Cell, SheetError> {
    match (coldef.ty, cell) {
        (_, Cell::Null) => Ok(Cell::Null),
        (SqlType::Varchar(len), Cell::Text(text)) => {
            if text.chars().count() > len as usize {
                return Err(SheetError::Invalid(format!(
                    "data too long for column '{}' at row {row_no}",
                    coldef.name
                )));
            }
            Ok(Cell::Text(text))
        }
        (ty, cell) => Err(SheetError::Invalid(format!(
            "incorrect {ty:?} value {cell:?} for column '{}' at row {row_no}",
            coldef.name
        ))),
    }
}
