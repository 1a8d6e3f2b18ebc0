use crate::error::SheetError;
use crate::model::{Row, TableDef};
use sled::Batch;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

#[derive(Clone)]
pub struct Store {
    db: sled::Db,
    catalog: sled::Tree,
    data: sled::Tree,
    cache: sled::Tree,
    reads: Arc<AtomicU64>,
}

impl Store {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, SheetError> {
        let db = sled::open(path)?;
        let catalog = db.open_tree("catalog")?;
        let data = db.open_tree("data")?;
        let cache = db.open_tree("cache")?;
        Ok(Self {
            db,
            catalog,
            data,
            cache,
            reads: Arc::new(AtomicU64::new(0)),
        })
    }

    /// Number of catalog and row reads served since open.
    pub fn reads(&self) -> u64 {
        self.reads.load(Ordering::Relaxed)
    }

    fn record_read(&self) {
        self.reads.fetch_add(1, Ordering::Relaxed);
    }

    pub fn list_tables(&self) -> Result<Vec<String>, SheetError> {
        self.record_read();
        let mut out = Vec::new();
        for item in self.catalog.scan_prefix(b"t\0") {
            let (k, _v) = item?;
            out.push(String::from_utf8_lossy(&k[2..]).to_string());
        }
        out.sort();
        Ok(out)
    }

    pub fn get_table(&self, table: &str) -> Result<TableDef, SheetError> {
        self.record_read();
        let Some(v) = self.catalog.get(Self::table_key(table))? else {
            return Err(SheetError::NotFound(format!("unknown table: {table}")));
        };
        Ok(bincode::deserialize(&v)?)
    }

    pub fn create_table(&self, def: &TableDef) -> Result<(), SheetError> {
        let key = Self::table_key(&def.name);
        let val = bincode::serialize(def)?;
        // Insert only if absent so two creators cannot both win.
        let swapped = self
            .catalog
            .compare_and_swap(key, None as Option<&[u8]>, Some(val))?;
        if swapped.is_err() {
            return Err(SheetError::Invalid(format!(
                "table already exists: {}",
                def.name
            )));
        }
        self.catalog.flush()?;
        Ok(())
    }

    pub fn drop_table(&self, table: &str) -> Result<(), SheetError> {
        let key = Self::table_key(table);
        if self.catalog.get(&key)?.is_none() {
            return Err(SheetError::NotFound(format!("unknown table: {table}")));
        }
        self.catalog.remove(key)?;
        self.catalog.remove(Self::auto_inc_key(table))?;

        let row_keys: Vec<Vec<u8>> = self
            .data
            .scan_prefix(Self::row_prefix(table))
            .map(|r| r.map(|(k, _)| k.to_vec()))
            .collect::<Result<_, _>>()?;
        let mut batch = Batch::default();
        for rkey in row_keys {
            batch.remove(rkey);
        }
        self.data.apply_batch(batch)?;
        self.flush()?;
        Ok(())
    }

    pub fn insert_rows(&self, table: &str, rows: &[(i64, Row)]) -> Result<(), SheetError> {
        let mut batch = Batch::default();
        for (pk, row) in rows {
            batch.insert(Self::row_key(table, *pk), bincode::serialize(row)?);
        }
        self.data.apply_batch(batch)?;
        self.flush()?;
        Ok(())
    }

    /// Reserves `count` consecutive identity values and returns the first one.
    pub fn allocate_auto_increment(&self, table: &str, count: u64) -> Result<i64, SheetError> {
        let count = i64::try_from(count)
            .map_err(|_| SheetError::Invalid("auto_increment range too large".into()))?;
        let mut first = 0i64;
        let mut exhausted = false;
        self.catalog
            .update_and_fetch(Self::auto_inc_key(table), |old| {
                let cur = old.and_then(decode_i64).unwrap_or(1);
                first = cur;
                match cur.checked_add(count) {
                    Some(next) => {
                        exhausted = false;
                        Some(next.to_be_bytes().to_vec())
                    }
                    None => {
                        exhausted = true;
                        Some(cur.to_be_bytes().to_vec())
                    }
                }
            })?
            .ok_or_else(|| SheetError::Invalid("auto_increment update failed".into()))?;
        if exhausted || first <= 0 {
            return Err(SheetError::Invalid("auto_increment exhausted".into()));
        }
        Ok(first)
    }

    /// Rows in identity order, keeping those accepted by `filter`, then
    /// applying `offset` and `limit`.
    pub fn scan_rows<F>(
        &self,
        table: &str,
        filter: F,
        offset: usize,
        limit: usize,
    ) -> Result<Vec<(i64, Row)>, SheetError>
    where
        F: Fn(&Row) -> bool,
    {
        self.record_read();
        let mut out = Vec::new();
        let mut skipped = 0usize;
        for item in self.data.scan_prefix(Self::row_prefix(table)) {
            if out.len() >= limit {
                break;
            }
            let (k, v) = item?;
            let row: Row = bincode::deserialize(&v)?;
            if !filter(&row) {
                continue;
            }
            if skipped < offset {
                skipped += 1;
                continue;
            }
            out.push((Self::parse_pk_from_row_key(&k)?, row));
        }
        Ok(out)
    }

    pub fn count_rows<F>(&self, table: &str, filter: F) -> Result<u64, SheetError>
    where
        F: Fn(&Row) -> bool,
    {
        self.record_read();
        let mut count = 0u64;
        for item in self.data.scan_prefix(Self::row_prefix(table)) {
            let (_k, v) = item?;
            let row: Row = bincode::deserialize(&v)?;
            if filter(&row) {
                count = count.saturating_add(1);
            }
        }
        Ok(count)
    }

    pub(crate) fn cache_tree(&self) -> &sled::Tree {
        &self.cache
    }

    pub fn flush(&self) -> Result<(), SheetError> {
        self.data.flush()?;
        self.catalog.flush()?;
        self.db.flush()?;
        Ok(())
    }

    fn table_key(table: &str) -> Vec<u8> {
        let mut k = Vec::with_capacity(2 + table.len());
        k.extend_from_slice(b"t\0");
        k.extend_from_slice(table.as_bytes());
        k
    }

    fn row_prefix(table: &str) -> Vec<u8> {
        let mut k = Vec::with_capacity(3 + table.len());
        k.extend_from_slice(b"r\0");
        k.extend_from_slice(table.as_bytes());
        // Terminate so `data_1` does not match rows of `data_10`.
        k.push(0);
        k
    }

    fn row_key(table: &str, pk: i64) -> Vec<u8> {
        let mut k = Self::row_prefix(table);
        k.extend_from_slice(&pk.to_be_bytes());
        k
    }

    fn auto_inc_key(table: &str) -> Vec<u8> {
        let mut k = Vec::with_capacity(3 + table.len());
        k.extend_from_slice(b"ai\0");
        k.extend_from_slice(table.as_bytes());
        k
    }

    fn parse_pk_from_row_key(key: &[u8]) -> Result<i64, SheetError> {
        if key.len() < 8 {
            return Err(SheetError::Invalid("corrupt row key".into()));
        }
        let pk_bytes: [u8; 8] = key[key.len() - 8..]
            .try_into()
            .map_err(|_| SheetError::Invalid("corrupt row key".into()))?;
        Ok(i64::from_be_bytes(pk_bytes))
    }
}

fn decode_i64(bytes: &[u8]) -> Option<i64> {
    let raw: [u8; 8] = bytes.try_into().ok()?;
    Some(i64::from_be_bytes(raw))
}
