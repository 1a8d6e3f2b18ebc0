use crate::cache::LatestTable;
use crate::error::SheetError;
use crate::schema;
use crate::store::Store;
use tracing::info;

/// Drops the oldest upload tables until at most `keep` remain. The table the
/// latest pointer names is never dropped, even past `keep`.
pub async fn prune(
    store: &Store,
    pointer: &LatestTable,
    keep: usize,
) -> Result<Vec<String>, SheetError> {
    let current = pointer.current().await?;
    let store = store.clone();
    let dropped = tokio::task::spawn_blocking(move || {
        let tables = schema::upload_tables(&store)?;
        let excess = tables.len().saturating_sub(keep);
        let mut dropped = Vec::new();
        for (_, name) in tables.into_iter().take(excess) {
            if current.as_deref() == Some(name.as_str()) {
                continue;
            }
            store.drop_table(&name)?;
            dropped.push(name);
        }
        Ok::<_, SheetError>(dropped)
    })
    .await??;
    if !dropped.is_empty() {
        info!(count = dropped.len(), keep, "pruned upload tables");
    }
    Ok(dropped)
}
