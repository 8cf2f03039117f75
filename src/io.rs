use std::{
    io::{self, Write},
    path::{Path, PathBuf},
};
use tokio::{fs, io::AsyncWriteExt};
use uuid::Uuid;

/// Hidden sibling of `path` used while its content is being produced.
/// `ext` is kept last so external tools can infer the output format.
pub fn temp_sibling(path: &Path, ext: &str) -> PathBuf {
    let name = path.file_name().and_then(|n| n.to_str()).unwrap_or("file");
    path.with_file_name(format!(".{name}.{}.part.{ext}", Uuid::new_v4().simple()))
}

/// Temporaries and dotfiles are never part of a workspace's image set.
pub fn is_hidden(name: &str) -> bool { name.starts_with('.') }

/// Write `bytes` to `path` so that readers see either nothing or the full file.
pub async fn write_atomic(path: &Path, bytes: &[u8]) -> io::Result<()> {
    let tmp = temp_sibling(path, "tmp");
    let res = async {
        let mut f = fs::File::create(&tmp).await?;
        f.write_all(bytes).await?;
        let _ = f.sync_all().await; // best-effort
        drop(f);
        fs::rename(&tmp, path).await
    }
    .await;
    if res.is_err() {
        let _ = fs::remove_file(&tmp).await;
    }
    res
}

/// Blocking twin of [`write_atomic`] for code already on a blocking thread.
pub fn write_atomic_blocking(path: &Path, bytes: &[u8]) -> io::Result<()> {
    let tmp = temp_sibling(path, "tmp");
    let res = (|| {
        let mut f = std::fs::File::create(&tmp)?;
        f.write_all(bytes)?;
        let _ = f.sync_all(); // best-effort
        drop(f);
        std::fs::rename(&tmp, path)
    })();
    if res.is_err() {
        let _ = std::fs::remove_file(&tmp);
    }
    res
}
