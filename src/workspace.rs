use parking_lot::Mutex;
use sha2::{Digest, Sha256};
use std::{
    collections::HashMap,
    io,
    path::{Path, PathBuf},
    sync::Arc,
};
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use tracing::{debug, info};

/// Per-user transient directories under one root, plus the per-user lock
/// that serializes a whole ingest → cleanup cycle for a key.
pub struct Workspaces {
    root: PathBuf,
    locks: Mutex<HashMap<String, Arc<AsyncMutex<()>>>>,
}

impl Workspaces {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into(), locks: Mutex::new(HashMap::new()) }
    }

    pub fn root(&self) -> &Path { &self.root }

    pub async fn ensure_root(&self) -> io::Result<()> {
        tokio::fs::create_dir_all(&self.root).await
    }

    /// Directory owned by `user_key`. Keys are hashed so that arbitrary
    /// strings can neither collide nor escape the root.
    pub fn dir_for(&self, user_key: &str) -> PathBuf {
        self.root.join(workspace_name(user_key))
    }

    /// Wait for exclusive access to `user_key`'s workspace.
    pub async fn lock(&self, user_key: &str) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.locks.lock();
            // entries nobody holds or waits on
            locks.retain(|_, l| Arc::strong_count(l) > 1);
            locks
                .entry(user_key.to_string())
                .or_insert_with(|| Arc::new(AsyncMutex::new(())))
                .clone()
        };
        lock.lock_owned().await
    }

    /// Remove the user's workspace recursively. Returns whether anything was
    /// there; an absent workspace is not an error.
    pub async fn cleanup(&self, user_key: &str) -> io::Result<bool> {
        let dir = self.dir_for(user_key);
        match tokio::fs::remove_dir_all(&dir).await {
            Ok(()) => {
                info!(user_key, dir = %dir.display(), "deleted workspace");
                Ok(true)
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                debug!(user_key, "no workspace to delete");
                Ok(false)
            }
            Err(e) => Err(e),
        }
    }

    #[cfg(test)]
    fn tracked_keys(&self) -> usize { self.locks.lock().len() }
}

fn workspace_name(user_key: &str) -> String {
    let mut h = Sha256::new();
    h.update(user_key.as_bytes());
    format!("{:x}", h.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[test]
    fn distinct_keys_get_distinct_dirs() {
        let ws = Workspaces::new("/srv/uploads");
        assert_ne!(ws.dir_for("alice"), ws.dir_for("bob"));
        assert_eq!(ws.dir_for("alice"), ws.dir_for("alice"));
    }

    #[test]
    fn hostile_keys_stay_under_root() {
        let ws = Workspaces::new("/srv/uploads");
        for key in ["../../etc", "/abs", "a/b", "", ".."] {
            let dir = ws.dir_for(key);
            assert_eq!(dir.parent(), Some(Path::new("/srv/uploads")), "key {key:?}");
        }
    }

    #[tokio::test]
    async fn cleanup_is_idempotent() {
        let tmp = tempfile::tempdir().unwrap();
        let ws = Workspaces::new(tmp.path());
        let dir = ws.dir_for("u1");
        std::fs::create_dir_all(dir.join("nested")).unwrap();
        std::fs::write(dir.join("a.jpg"), b"x").unwrap();
        std::fs::write(dir.join("nested/b.jpg"), b"y").unwrap();

        assert!(ws.cleanup("u1").await.unwrap());
        assert!(!dir.exists());
        assert!(!ws.cleanup("u1").await.unwrap());
        assert!(!ws.cleanup("never-seen").await.unwrap());
    }

    #[tokio::test]
    async fn cleanup_leaves_other_users_alone() {
        let tmp = tempfile::tempdir().unwrap();
        let ws = Workspaces::new(tmp.path());
        std::fs::create_dir_all(ws.dir_for("u1")).unwrap();
        std::fs::create_dir_all(ws.dir_for("u2")).unwrap();

        ws.cleanup("u1").await.unwrap();
        assert!(ws.dir_for("u2").exists());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn same_key_is_serialized() {
        let ws = Arc::new(Workspaces::new("/unused"));
        let inside = Arc::new(AtomicUsize::new(0));
        let max_seen = Arc::new(AtomicUsize::new(0));

        let mut tasks = Vec::new();
        for _ in 0..8 {
            let (ws, inside, max_seen) = (ws.clone(), inside.clone(), max_seen.clone());
            tasks.push(tokio::spawn(async move {
                let _guard = ws.lock("same").await;
                let now = inside.fetch_add(1, Ordering::SeqCst) + 1;
                max_seen.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(5)).await;
                inside.fetch_sub(1, Ordering::SeqCst);
            }));
        }
        for t in tasks { t.await.unwrap(); }
        assert_eq!(max_seen.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn different_keys_do_not_block_each_other() {
        let ws = Workspaces::new("/unused");
        let _a = ws.lock("a").await;
        let b = tokio::time::timeout(Duration::from_millis(200), ws.lock("b")).await;
        assert!(b.is_ok());
    }

    #[tokio::test]
    async fn idle_locks_are_pruned() {
        let ws = Workspaces::new("/unused");
        for i in 0..10 {
            let _g = ws.lock(&format!("user-{i}")).await;
        }
        let _g = ws.lock("last").await;
        assert_eq!(ws.tracked_keys(), 1);
    }
}
