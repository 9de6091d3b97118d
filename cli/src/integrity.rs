//! Archive consistency checking.

use std::collections::{HashMap, HashSet};

use jam_backend::list_sorted;
use jam_store::ids::BLOB_PREFIX;
use jam_store::{proto, streams};
use tokio::io::AsyncReadExt;
use tracing::{debug, info};

use crate::system::{open_snapshot, SysOpts};

pub async fn check(
    sys: &SysOpts,
    snap: &str,
    show_unneeded: bool,
    skip_blob_end: bool,
) -> anyhow::Result<()> {
    let manager = sys.manager().await?;
    let backend = manager.backend();

    debug!("confirming that a blob exists for every hash");
    let blobs: HashSet<String> = list_sorted(backend.as_ref(), BLOB_PREFIX)
        .await?
        .into_iter()
        .collect();

    let mut blob_last_range: HashMap<String, proto::Range> = HashMap::new();
    let mut missing: HashSet<String> = HashSet::new();
    let mut bad_hashsets: HashSet<String> = HashSet::new();
    manager
        .iterate_hashes(|_, hashset, stream| {
            for range in &stream.ranges {
                let blob_path = range.blob()?.blob_path();
                if range.length > 0 {
                    let is_later = blob_last_range
                        .get(&blob_path)
                        .map(|last| last.offset < range.offset)
                        .unwrap_or(true);
                    if is_later {
                        blob_last_range.insert(blob_path.clone(), range.clone());
                    }
                }
                if !blobs.contains(&blob_path) && missing.insert(blob_path.clone()) {
                    println!("missing blob: {}", blob_path);
                    if let Some(hashset) = hashset {
                        if bad_hashsets.insert(hashset.to_string()) {
                            println!("from hash set: {}", hashset);
                        }
                    }
                }
            }
            Ok(())
        })
        .await?;
    debug!("no dangling hashes");

    if show_unneeded {
        for blob in &blobs {
            if !blob_last_range.contains_key(blob) {
                println!("blob unnecessary: {}", blob);
            }
        }
    }

    debug!("making sure a hash for every listed path resolves");
    let (snapshot, _) = open_snapshot(&manager, snap).await?;
    let mut files = Vec::new();
    snapshot.list("", true, |entry| {
        match entry.meta {
            Some(meta) if meta.kind() == proto::metadata::Type::File => {
                files.push(entry.path);
            }
            _ => {}
        }
        Ok(())
    })?;
    for path in files {
        // opening resolves the hash through the hash database
        snapshot.open(&path).await?;
    }
    debug!("no dangling paths");

    if !skip_blob_end {
        debug!("checking that the last byte of each blob is readable");
        for (blob, range) in &blob_last_range {
            debug!(%blob, end = range.offset + range.length, "checking blob end");
            // authenticated decryption fails loudly on damaged data
            let mut reader =
                streams::open_range(backend.as_ref(), range, range.length as u64 - 1).await?;
            let mut sink = Vec::new();
            reader.read_to_end(&mut sink).await?;
        }
    }

    if missing.is_empty() {
        info!("integrity check passed");
    } else {
        anyhow::bail!("{} missing blobs", missing.len());
    }
    Ok(())
}
