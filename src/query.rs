use crate::cache::{page_key, CacheStore, LatestTable};
use crate::error::SheetError;
use crate::model::{PageEnvelope, Row};
use crate::schema;
use crate::store::Store;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

pub const DEFAULT_PAGE: i64 = 1;
pub const DEFAULT_LIMIT: i64 = 10;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageRequest {
    pub page: i64,
    pub limit: i64,
    pub search: String,
}

impl Default for PageRequest {
    fn default() -> Self {
        Self {
            page: DEFAULT_PAGE,
            limit: DEFAULT_LIMIT,
            search: String::new(),
        }
    }
}

impl PageRequest {
    /// Builds a request from raw query-string values. `page` and `limit` take
    /// their leading integer (decimal, or hex after `0x`); absent, unparsable
    /// or zero values fall back to the defaults. Negative values are kept.
    pub fn from_params(page: Option<&str>, limit: Option<&str>, search: Option<&str>) -> Self {
        Self {
            page: leading_int(page).filter(|n| *n != 0).unwrap_or(DEFAULT_PAGE),
            limit: leading_int(limit).filter(|n| *n != 0).unwrap_or(DEFAULT_LIMIT),
            search: search.unwrap_or_default().to_string(),
        }
    }
}

// Leading integer of a query value: optional sign, then decimal digits or a
// `0x` hex run. Runs too long for i64 saturate.
fn leading_int(raw: Option<&str>) -> Option<i64> {
    let s = raw?.trim_start();
    let (negative, rest) = match s.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, s.strip_prefix('+').unwrap_or(s)),
    };
    let (radix, digits) = match rest.get(..2) {
        Some("0x") | Some("0X") => (16, &rest[2..]),
        _ => (10, rest),
    };
    let end = digits
        .find(|c: char| !c.is_digit(radix))
        .unwrap_or(digits.len());
    let run = &digits[..end];
    if run.is_empty() {
        return None;
    }
    let value = i64::from_str_radix(run, radix).unwrap_or(i64::MAX);
    Some(if negative { -value } else { value })
}

/// Serialized page envelope, as stored in the cache.
#[derive(Debug, Clone)]
pub struct PageResponse {
    pub body: String,
    pub from_cache: bool,
}

impl PageResponse {
    pub fn envelope(&self) -> Result<PageEnvelope, SheetError> {
        Ok(serde_json::from_str(&self.body)?)
    }
}

/// Case-insensitive substring match over the space-joined non-NULL cells of
/// the searched column positions.
fn search_filter(needle: &str, searched: Vec<usize>) -> impl Fn(&Row) -> bool {
    let needle = needle.to_lowercase();
    move |row: &Row| {
        let haystack = searched
            .iter()
            .filter_map(|&i| row.values.get(i).and_then(|c| c.as_text()))
            .collect::<Vec<_>>()
            .join(" ");
        haystack.to_lowercase().contains(&needle)
    }
}

#[derive(Clone)]
pub struct QueryEngine {
    store: Store,
    cache: Arc<dyn CacheStore>,
    pointer: LatestTable,
    ttl: Duration,
    fallback_to_newest: bool,
}

impl QueryEngine {
    pub fn new(
        store: Store,
        cache: Arc<dyn CacheStore>,
        ttl: Duration,
        fallback_to_newest: bool,
    ) -> Self {
        let pointer = LatestTable::new(cache.clone(), ttl);
        Self {
            store,
            cache,
            pointer,
            ttl,
            fallback_to_newest,
        }
    }

    async fn resolve_table(&self) -> Result<String, SheetError> {
        if let Some(table) = self.pointer.current().await? {
            return Ok(table);
        }
        if self.fallback_to_newest {
            let store = self.store.clone();
            let newest = tokio::task::spawn_blocking(move || schema::upload_tables(&store)).await??;
            if let Some((_, table)) = newest.into_iter().last() {
                debug!(table, "latest pointer absent, using newest upload table");
                return Ok(table);
            }
        }
        Err(SheetError::NoLatestTable)
    }

    pub async fn query(&self, req: &PageRequest) -> Result<PageResponse, SheetError> {
        let table = self.resolve_table().await?;
        let key = page_key(&table, req.page, &req.search);
        if let Some(body) = self.cache.get(&key).await? {
            debug!(key, "query cache hit");
            return Ok(PageResponse {
                body,
                from_cache: true,
            });
        }

        let store = self.store.clone();
        let req_owned = req.clone();
        let table_name = table.clone();
        let envelope =
            tokio::task::spawn_blocking(move || run_page_query(&store, &table_name, &req_owned))
                .await??;
        let body = serde_json::to_string(&envelope)?;
        self.cache.set_ex(&key, &body, self.ttl).await?;
        info!(
            table,
            page = req.page,
            limit = req.limit,
            total = envelope.total,
            rows = envelope.data.len(),
            "query cache miss served from storage"
        );
        Ok(PageResponse {
            body,
            from_cache: false,
        })
    }
}

/// Count and page queries against one table.
pub fn run_page_query(
    store: &Store,
    table: &str,
    req: &PageRequest,
) -> Result<PageEnvelope, SheetError> {
    if req.limit < 0 {
        return Err(SheetError::failed(
            "failed to query data",
            SheetError::Invalid(format!("invalid LIMIT {}", req.limit)),
        ));
    }
    let offset = req.page.saturating_sub(1).saturating_mul(req.limit);
    if offset < 0 {
        return Err(SheetError::failed(
            "failed to query data",
            SheetError::Invalid(format!("invalid OFFSET {offset}")),
        ));
    }

    let def = store
        .get_table(table)
        .map_err(|e| SheetError::failed("failed to query total", e))?;
    let filter: Box<dyn Fn(&Row) -> bool> = if req.search.is_empty() {
        Box::new(|_: &Row| true)
    } else {
        let columns = schema::columns_of(store, table)
            .map_err(|e| SheetError::failed("failed to query total", e))?;
        let searched = columns
            .iter()
            .map(|name| {
                def.column_index(name).ok_or_else(|| {
                    SheetError::failed(
                        "failed to query total",
                        SheetError::NotFound(format!("unknown column: {name}")),
                    )
                })
            })
            .collect::<Result<Vec<_>, _>>()?;
        debug!(table, columns = searched.len(), "search across resolved columns");
        Box::new(search_filter(&req.search, searched))
    };

    let total = store
        .count_rows(table, &filter)
        .map_err(|e| SheetError::failed("failed to query total", e))?;
    let rows = store
        .scan_rows(
            table,
            &filter,
            usize::try_from(offset).unwrap_or(usize::MAX),
            usize::try_from(req.limit).unwrap_or(usize::MAX),
        )
        .map_err(|e| SheetError::failed("failed to query data", e))?;

    Ok(PageEnvelope {
        table_name: table.to_string(),
        data: rows.iter().map(|(_, row)| row.to_json_object(&def)).collect(),
        total,
    })
}
