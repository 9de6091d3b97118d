//! Commands that create new snapshots.

use std::path::Path;

use anyhow::Context;
use chrono::{DateTime, Utc};
use regex::Regex;
use tracing::{info, warn};
use walkdir::WalkDir;

use crate::system::SysOpts;

pub async fn store(sys: &SysOpts, source: &Path, target_prefix: &str) -> anyhow::Result<()> {
    let manager = sys.manager().await?;
    let mut session = manager.new_session().await?;

    let mut stored = 0u64;
    for entry in WalkDir::new(source) {
        let entry = entry?;
        if entry.file_type().is_dir() {
            continue;
        }

        let rel = entry
            .path()
            .strip_prefix(source)
            .context("walked outside the source")?;
        let target = format!("{}{}", target_prefix, key_for(rel));

        let meta = entry.metadata()?;
        let modified: DateTime<Utc> = meta.modified()?.into();
        let creation: DateTime<Utc> = meta.created().map(Into::into).unwrap_or(modified);
        let mode = mode_of(&meta);

        if entry.path_is_symlink() {
            let link = std::fs::read_link(entry.path())?;
            session
                .put_symlink(
                    &target,
                    creation,
                    modified,
                    mode,
                    &link.to_string_lossy(),
                )
                .await?;
        } else {
            let file = tokio::fs::File::open(entry.path()).await?;
            session
                .put_file(&target, creation, modified, mode, Box::new(file))
                .await?;
        }
        stored += 1;
    }

    match session.commit().await? {
        Some(timestamp) => info!(
            snapshot = timestamp.timestamp_nanos_opt().unwrap_or_default(),
            files = stored,
            "snapshot committed"
        ),
        None => warn!("nothing changed, no snapshot created"),
    }
    Ok(())
}

pub async fn rename(sys: &SysOpts, pattern: &str, replacement: &str) -> anyhow::Result<()> {
    let re = Regex::new(pattern)?;
    let manager = sys.manager().await?;
    let mut session = manager.new_session().await?;
    let renamed = session.rename(&re, replacement);
    info!(renamed, "paths renamed");
    session.commit().await?;
    Ok(())
}

pub async fn rm(sys: &SysOpts, pattern: &str) -> anyhow::Result<()> {
    let re = Regex::new(pattern)?;
    let manager = sys.manager().await?;
    let mut session = manager.new_session().await?;
    let removed = session.delete_all(&re);
    info!(removed, "paths removed");
    session.commit().await?;
    Ok(())
}

/// A relative filesystem path as an archive key: forward slashes, no
/// leading separator.
fn key_for(rel: &Path) -> String {
    let mut key = String::new();
    for component in rel.components() {
        if !key.is_empty() {
            key.push('/');
        }
        key.push_str(&component.as_os_str().to_string_lossy());
    }
    key
}

#[cfg(unix)]
fn mode_of(meta: &std::fs::Metadata) -> u32 {
    use std::os::unix::fs::PermissionsExt;
    meta.permissions().mode()
}

#[cfg(not(unix))]
fn mode_of(_meta: &std::fs::Metadata) -> u32 {
    0o644
}
