use crate::cache::LatestTable;
use crate::error::SheetError;
use crate::model::Cell;
use crate::schema::{self, TableSchema};
use crate::spreadsheet::{self, Matrix};
use crate::sql;
use crate::store::Store;
use tracing::{info, warn};

/// Outcome of a successful upload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IngestReceipt {
    pub table_name: String,
    /// Columns of the created table, identity first.
    pub columns: Vec<String>,
    pub rows: u64,
}

#[derive(Clone)]
pub struct Ingestor {
    store: Store,
    pointer: LatestTable,
}

impl Ingestor {
    pub fn new(store: Store, pointer: LatestTable) -> Self {
        Self { store, pointer }
    }

    /// Decodes an upload, creates its table, loads the data rows and points
    /// the latest-table slot at it.
    pub async fn ingest(&self, bytes: Vec<u8>) -> Result<IngestReceipt, SheetError> {
        let size = bytes.len();
        let matrix = tokio::task::spawn_blocking(move || spreadsheet::decode(&bytes)).await??;
        if matrix.len() < 2 {
            return Err(SheetError::BadFormat(format!(
                "found {} non-empty row(s)",
                matrix.len()
            )));
        }

        let created_at = chrono::Utc::now().timestamp_millis();
        let schema = schema::synthesize(&matrix[0], created_at)?;

        let store = self.store.clone();
        let receipt = tokio::task::spawn_blocking(move || load(&store, &schema, matrix)).await??;

        self.pointer.publish(&receipt.table_name).await?;
        info!(
            table = %receipt.table_name,
            columns = receipt.columns.len(),
            rows = receipt.rows,
            bytes = size,
            "upload ingested"
        );
        Ok(receipt)
    }
}

fn load(store: &Store, schema: &TableSchema, matrix: Matrix) -> Result<IngestReceipt, SheetError> {
    schema::create_table(store, schema)
        .map_err(|e| SheetError::failed("failed to create table", e))?;

    let width = schema.columns.len();
    let data_rows = matrix.len() - 1;
    let mut params = Vec::with_capacity(data_rows * width);
    for (i, row) in matrix.into_iter().skip(1).enumerate() {
        let len = row.len();
        if len > width {
            return Err(insert_failed(
                schema,
                SheetError::Invalid(format!(
                    "column count doesn't match value count at row {}",
                    i + 1
                )),
            ));
        }
        params.extend(row.into_iter().map(|c| c.map_or(Cell::Null, Cell::Text)));
        params.extend(std::iter::repeat(Cell::Null).take(width - len));
    }

    let statement = schema.insert_statement(data_rows);
    let out = sql::execute(&statement, &params, store).map_err(|e| insert_failed(schema, e))?;

    Ok(IngestReceipt {
        table_name: schema.table_name.clone(),
        columns: schema::columns_of(store, &schema.table_name)?,
        rows: out.affected_rows,
    })
}

fn insert_failed(schema: &TableSchema, e: SheetError) -> SheetError {
    warn!(table = %schema.table_name, error = %e, "bulk insert failed, table left without rows");
    SheetError::failed("failed to insert data", e)
}
