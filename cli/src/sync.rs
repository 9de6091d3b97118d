use std::collections::HashSet;

use jam_backend::{from_addr, list_sorted};
use tracing::info;

/// Copies every object the destination is missing from the source.
/// Operates on raw (still encrypted) objects, so no key is needed.
pub async fn backend_sync(source: &str, dest: &str) -> anyhow::Result<()> {
    let source_store = from_addr(source).await?;
    let dest_store = from_addr(dest).await?;

    let existing: HashSet<String> = list_sorted(dest_store.as_ref(), "")
        .await?
        .into_iter()
        .collect();

    let mut synced = 0u64;
    for path in list_sorted(source_store.as_ref(), "").await? {
        if existing.contains(&path) {
            continue;
        }
        info!(%path, "syncing");
        let mut reader = source_store.get(&path, 0, None).await?;
        dest_store.put(&path, &mut reader).await?;
        synced += 1;
    }
    info!(synced, "backend sync complete");

    source_store.close().await?;
    dest_store.close().await?;
    Ok(())
}
