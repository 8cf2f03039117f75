use std::sync::Arc;
use tracing::{debug, error, info, warn};

use crate::{
    cluster::find_components,
    error::{DetectError, DetectResult},
    graph::SimilarityGraph,
    ingest::{ingest, IngestReport, UploadedFile},
    normalize::FormatNormalizer,
    oracle::SimilarityOracle,
    workspace::Workspaces,
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UploadOutcome {
    /// Nothing in the batch had an allowed extension; no detection ran.
    NothingAccepted { skipped: usize },
    Groups { report: IngestReport, groups: Vec<Vec<String>> },
}

/// Runs detection cycles: lock → ingest → normalize → oracle → graph →
/// components → cleanup, one user key at a time.
#[derive(Clone)]
pub struct DuplicateDetector {
    workspaces: Arc<Workspaces>,
    normalizer: Arc<FormatNormalizer>,
    oracle: Arc<dyn SimilarityOracle>,
}

impl DuplicateDetector {
    pub fn new(workspaces: Arc<Workspaces>, normalizer: Arc<FormatNormalizer>, oracle: Arc<dyn SimilarityOracle>) -> Self {
        Self { workspaces, normalizer, oracle }
    }

    pub fn workspaces(&self) -> &Workspaces { &self.workspaces }

    /// Store `files` and detect duplicates among them. The cycle runs on its
    /// own task so the workspace is still cleaned up if the caller goes away.
    pub async fn upload(&self, user_key: String, files: Vec<UploadedFile>) -> DetectResult<UploadOutcome> {
        let this = self.clone();
        tokio::spawn(async move { this.upload_cycle(&user_key, &files).await }).await?
    }

    /// Detect duplicates over whatever the user's workspace holds right now.
    pub async fn duplicates(&self, user_key: String) -> DetectResult<Vec<Vec<String>>> {
        let this = self.clone();
        tokio::spawn(async move {
            let _guard = this.workspaces.lock(&user_key).await;
            let res = this.detect_locked(&user_key).await;
            this.cleanup(&user_key).await;
            res
        })
        .await?
    }

    async fn upload_cycle(&self, user_key: &str, files: &[UploadedFile]) -> DetectResult<UploadOutcome> {
        let _guard = self.workspaces.lock(user_key).await;
        let res: DetectResult<UploadOutcome> = async {
            let report = ingest(&self.workspaces, user_key, files).await?;
            if report.accepted == 0 {
                return Ok(UploadOutcome::NothingAccepted { skipped: report.skipped });
            }
            let groups = self.detect_locked(user_key).await?;
            Ok(UploadOutcome::Groups { report, groups })
        }
        .await;
        self.cleanup(user_key).await;
        res
    }

    /// Caller must hold the user's lock.
    async fn detect_locked(&self, user_key: &str) -> DetectResult<Vec<Vec<String>>> {
        let dir = self.workspaces.dir_for(user_key);
        let normalizer = self.normalizer.clone();
        let scan_dir = dir.clone();
        let normalized = tokio::task::spawn_blocking(move || normalizer.normalize(&scan_dir))
            .await?
            .map_err(|e| DetectError::workspace(&dir, e))?;

        if !normalized.has_standard_images {
            if normalized.has_unconverted_proprietary {
                return Err(DetectError::UnconvertibleImages);
            }
            return Ok(Vec::new());
        }
        if !normalized.unconverted.is_empty() {
            warn!(user_key, files = ?normalized.unconverted, "leaving out files that could not be converted");
        }

        let mut converted = 0;
        for r in normalized.records.iter().filter(|r| r.was_converted) {
            debug!(original = %r.original_filename, stored = %r.stored_filename, ext = %r.extension, "converted for oracle");
            converted += 1;
        }
        info!(user_key, images = normalized.records.len(), converted, oracle = self.oracle.name(), "running similarity oracle");
        let output = self.oracle.find_duplicates(&dir).await?;

        let graph = SimilarityGraph::build(&output, &normalized.rename_map);
        if graph.is_empty() {
            debug!(user_key, "oracle reported no images");
        }
        let groups = find_components(&graph);
        info!(user_key, nodes = graph.len(), edges = graph.edge_count(), groups = groups.len(), "duplicate detection finished");
        Ok(groups)
    }

    async fn cleanup(&self, user_key: &str) {
        if let Err(e) = self.workspaces.cleanup(user_key).await {
            error!(user_key, "failed to delete workspace: {e}");
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::normalize::{
        tests::{CopyConverter, FailingConverter},
        Converter,
    };
    use crate::oracle::{tests::ScriptedOracle, OracleError, OracleOutput};
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use std::{path::Path, time::Duration};

    pub(crate) fn detector(root: &Path, oracle: Arc<dyn SimilarityOracle>, converter: Box<dyn Converter>) -> DuplicateDetector {
        DuplicateDetector::new(
            Arc::new(Workspaces::new(root)),
            Arc::new(FormatNormalizer::new(vec![converter])),
            oracle,
        )
    }

    fn upload(names: &[&str]) -> Vec<UploadedFile> {
        names.iter().map(|n| UploadedFile::new(*n, b"pixels".to_vec())).collect()
    }

    fn groups_of(outcome: UploadOutcome) -> Vec<Vec<String>> {
        match outcome {
            UploadOutcome::Groups { groups, .. } => groups,
            other => panic!("expected groups, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn unconnected_image_is_left_out() {
        let tmp = tempfile::tempdir().unwrap();
        let oracle = Arc::new(ScriptedOracle::replying(&[("a.jpg", &[("b.jpg", 0.9)]), ("c.png", &[])]));
        let d = detector(tmp.path(), oracle.clone(), Box::new(CopyConverter));

        let out = d.upload("u1".into(), upload(&["a.jpg", "b.jpg", "c.png"])).await.unwrap();
        assert_eq!(groups_of(out), vec![vec!["a.jpg".to_string(), "b.jpg".to_string()]]);
        assert_eq!(oracle.calls(), 1);
        assert!(!d.workspaces().dir_for("u1").exists());
    }

    #[tokio::test]
    async fn unconvertible_heic_is_a_domain_error_and_cleans_up() {
        let tmp = tempfile::tempdir().unwrap();
        let oracle = Arc::new(ScriptedOracle::replying(&[]));
        let d = detector(tmp.path(), oracle.clone(), Box::new(FailingConverter));

        let err = d.upload("u1".into(), upload(&["x.heic"])).await.unwrap_err();
        assert!(matches!(err, DetectError::UnconvertibleImages));
        assert_eq!(oracle.calls(), 0);
        assert!(!d.workspaces().dir_for("u1").exists());
    }

    #[tokio::test]
    async fn converted_file_reported_under_original_name() {
        let tmp = tempfile::tempdir().unwrap();
        let oracle = Arc::new(ScriptedOracle::replying(&[("q.jpg", &[("p.jpg", 0.8)])]));
        let d = detector(tmp.path(), oracle.clone(), Box::new(CopyConverter));

        let out = d.upload("u1".into(), upload(&["p.jpg", "q.heic"])).await.unwrap();
        let groups = groups_of(out);
        assert_eq!(groups, vec![vec!["p.jpg".to_string(), "q.heic".to_string()]]);
        assert!(groups.iter().flatten().all(|n| n != "q.jpg"));
        assert_eq!(*oracle.seen.lock(), vec!["p.jpg".to_string(), "q.jpg".to_string()]);
    }

    #[tokio::test]
    async fn no_valid_files_skips_the_oracle() {
        let tmp = tempfile::tempdir().unwrap();
        let oracle = Arc::new(ScriptedOracle::replying(&[]));
        let d = detector(tmp.path(), oracle.clone(), Box::new(CopyConverter));

        let out = d.upload("u1".into(), upload(&["a.txt", "b.webp"])).await.unwrap();
        assert_eq!(out, UploadOutcome::NothingAccepted { skipped: 2 });
        assert_eq!(oracle.calls(), 0);
        assert!(!d.workspaces().dir_for("u1").exists());
    }

    #[tokio::test]
    async fn empty_oracle_input_becomes_no_processable_images() {
        let tmp = tempfile::tempdir().unwrap();
        let d = detector(tmp.path(), Arc::new(ScriptedOracle::failing(OracleError::EmptyInput)), Box::new(CopyConverter));

        let err = d.upload("u1".into(), upload(&["a.jpg"])).await.unwrap_err();
        assert!(matches!(err, DetectError::NoProcessableImages));
        assert!(!d.workspaces().dir_for("u1").exists());
    }

    #[tokio::test]
    async fn oracle_fault_still_cleans_up() {
        let tmp = tempfile::tempdir().unwrap();
        let oracle = ScriptedOracle::failing(OracleError::Fault(anyhow::anyhow!("segfault in model")));
        let d = detector(tmp.path(), Arc::new(oracle), Box::new(CopyConverter));

        let err = d.upload("u1".into(), upload(&["a.jpg", "b.jpg"])).await.unwrap_err();
        assert!(matches!(err, DetectError::Oracle(_)));
        assert!(!err.is_domain());
        assert!(!d.workspaces().dir_for("u1").exists());
    }

    #[tokio::test]
    async fn failed_write_fails_the_upload_and_removes_earlier_files() {
        let tmp = tempfile::tempdir().unwrap();
        let oracle = Arc::new(ScriptedOracle::replying(&[]));
        let d = detector(tmp.path(), oracle.clone(), Box::new(CopyConverter));
        let dir = d.workspaces().dir_for("u1");
        // a directory in the way of the second file's rename
        std::fs::create_dir_all(dir.join("b.jpg")).unwrap();

        let err = d.upload("u1".into(), upload(&["a.jpg", "b.jpg", "c.jpg"])).await.unwrap_err();
        match &err {
            DetectError::Workspace { path, .. } => assert_eq!(path, &dir.join("b.jpg")),
            other => panic!("expected a workspace error, got {other:?}"),
        }
        assert!(!err.is_domain());
        assert_eq!(oracle.calls(), 0);
        assert!(!dir.exists());
    }

    #[tokio::test]
    async fn unconvertible_heic_beside_standard_images_is_left_out() {
        let tmp = tempfile::tempdir().unwrap();
        let oracle = Arc::new(ScriptedOracle::replying(&[("a.jpg", &[("b.jpg", 0.9)])]));
        let d = detector(tmp.path(), oracle.clone(), Box::new(FailingConverter));

        let out = d.upload("u1".into(), upload(&["a.jpg", "b.jpg", "x.heic"])).await.unwrap();
        assert_eq!(groups_of(out), vec![vec!["a.jpg".to_string(), "b.jpg".to_string()]]);
        assert_eq!(oracle.calls(), 1);
        assert_eq!(*oracle.seen.lock(), vec!["a.jpg".to_string(), "b.jpg".into(), "x.heic".into()]);
        assert!(!d.workspaces().dir_for("u1").exists());
    }

    #[tokio::test]
    async fn query_over_missing_workspace_is_empty() {
        let tmp = tempfile::tempdir().unwrap();
        let oracle = Arc::new(ScriptedOracle::replying(&[]));
        let d = detector(tmp.path(), oracle.clone(), Box::new(CopyConverter));

        assert!(d.duplicates("nobody".into()).await.unwrap().is_empty());
        assert_eq!(oracle.calls(), 0);
    }

    #[tokio::test]
    async fn query_uses_current_contents_then_deletes_them() {
        let tmp = tempfile::tempdir().unwrap();
        let oracle = Arc::new(ScriptedOracle::replying(&[("a.jpg", &[("b.jpg", 0.95)]), ("b.jpg", &[("c.jpg", 0.91)])]));
        let d = detector(tmp.path(), oracle, Box::new(CopyConverter));
        let dir = d.workspaces().dir_for("u1");
        std::fs::create_dir_all(&dir).unwrap();
        for n in ["a.jpg", "b.jpg", "c.jpg", "d.jpg"] {
            std::fs::write(dir.join(n), b"x").unwrap();
        }

        let groups = d.duplicates("u1".into()).await.unwrap();
        assert_eq!(groups, vec![vec!["a.jpg".to_string(), "b.jpg".into(), "c.jpg".into()]]);
        assert!(!dir.exists());
    }

    /// Sleeps inside the oracle call and records what each call saw.
    struct SlowOracle {
        delay: Duration,
        snapshots: Mutex<Vec<Vec<String>>>,
    }

    #[async_trait]
    impl SimilarityOracle for SlowOracle {
        fn name(&self) -> &'static str { "slow" }

        async fn find_duplicates(&self, dir: &Path) -> Result<OracleOutput, OracleError> {
            tokio::time::sleep(self.delay).await;
            let mut names: Vec<String> = std::fs::read_dir(dir)
                .unwrap()
                .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
                .collect();
            names.sort();
            self.snapshots.lock().push(names);
            Ok(OracleOutput::new())
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_cycles_for_one_user_do_not_interleave() {
        let tmp = tempfile::tempdir().unwrap();
        let oracle = Arc::new(SlowOracle { delay: Duration::from_millis(30), snapshots: Mutex::new(Vec::new()) });
        let d = detector(tmp.path(), oracle.clone(), Box::new(CopyConverter));

        let first = tokio::spawn({
            let d = d.clone();
            async move { d.upload("same".into(), upload(&["a1.jpg", "a2.jpg"])).await }
        });
        let second = tokio::spawn({
            let d = d.clone();
            async move { d.upload("same".into(), upload(&["b1.jpg", "b2.jpg"])).await }
        });
        first.await.unwrap().unwrap();
        second.await.unwrap().unwrap();

        let mut snapshots = oracle.snapshots.lock().clone();
        snapshots.sort();
        assert_eq!(
            snapshots,
            vec![vec!["a1.jpg".to_string(), "a2.jpg".into()], vec!["b1.jpg".to_string(), "b2.jpg".into()]]
        );
        assert!(!d.workspaces().dir_for("same").exists());
    }

    #[tokio::test]
    async fn abandoned_request_still_cleans_up() {
        let tmp = tempfile::tempdir().unwrap();
        let oracle = Arc::new(SlowOracle { delay: Duration::from_millis(100), snapshots: Mutex::new(Vec::new()) });
        let d = detector(tmp.path(), oracle.clone(), Box::new(CopyConverter));

        let abandoned = tokio::time::timeout(Duration::from_millis(10), d.upload("u1".into(), upload(&["a.jpg"]))).await;
        assert!(abandoned.is_err());

        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                if oracle.snapshots.lock().len() == 1 {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();
        // queues behind the abandoned cycle until its cleanup is done
        let _lock = d.workspaces().lock("u1").await;
        assert!(!d.workspaces().dir_for("u1").exists());
    }
}
