use anyhow::Context;

use crate::system::{parse_snap, SysOpts};

pub async fn list(sys: &SysOpts) -> anyhow::Result<()> {
    let manager = sys.manager().await?;
    for timestamp in manager.list_snapshots().await? {
        let snapshot = manager.open_snapshot(timestamp).await?;
        println!(
            "{}: {} ({} files)",
            timestamp.timestamp_nanos_opt().unwrap_or_default(),
            timestamp.format("%Y-%m-%d %H:%M:%S"),
            snapshot.len(),
        );
    }
    Ok(())
}

pub async fn unsnap(sys: &SysOpts, snap: &str) -> anyhow::Result<()> {
    let timestamp = parse_snap(snap)?.context("unsnap needs a snapshot id")?;
    let manager = sys.manager().await?;
    manager.delete_snapshot(timestamp).await?;
    Ok(())
}

pub async fn revert_to(sys: &SysOpts, snap: &str) -> anyhow::Result<()> {
    let timestamp = parse_snap(snap)?.context("revert-to needs a snapshot id")?;
    let manager = sys.manager().await?;
    let mut session = manager.revert_to(timestamp).await?;
    session.commit().await?;
    Ok(())
}

pub async fn coalesce_hashes(sys: &SysOpts) -> anyhow::Result<()> {
    let manager = sys.manager().await?;
    manager.coalesce_hashes().await?;
    Ok(())
}

pub async fn split_hashes(sys: &SysOpts) -> anyhow::Result<()> {
    let manager = sys.manager().await?;
    manager.split_hashes().await?;
    Ok(())
}
