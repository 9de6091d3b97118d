use crate::system::{open_snapshot, SysOpts};

pub async fn ls(
    sys: &SysOpts,
    snap: &str,
    recursive: bool,
    prefix: &str,
) -> anyhow::Result<()> {
    let manager = sys.manager().await?;
    let (snapshot, _) = open_snapshot(&manager, snap).await?;

    snapshot.list(prefix, recursive, |entry| {
        if entry.prefix {
            println!("{}/", entry.path);
        } else {
            println!("{}", entry.path);
        }
        Ok(())
    })?;
    Ok(())
}
