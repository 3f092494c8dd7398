//! End-to-end restore scenarios
//!
//! Every test archives a generated source tree into a fresh repository and
//! restores it through the same entry point the CLI uses.

use ::snaprestore::*;
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;
use tracing::info;

/// Cloneable in-memory output sink
#[derive(Clone, Default)]
pub struct CapturedOutput(Arc<Mutex<Vec<u8>>>);

impl CapturedOutput {
    pub fn contents(&self) -> String {
        String::from_utf8_lossy(&self.0.lock()).to_string()
    }
}

impl Write for CapturedOutput {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.lock().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

/// Repository, source and target directories for one scenario
pub struct RestoreTestHarness {
    pub temp_dir: TempDir,
    pub repo: Repository,
    pub source: PathBuf,
    pub stdout: CapturedOutput,
    pub stderr: CapturedOutput,
}

impl Default for RestoreTestHarness {
    fn default() -> Self {
        Self::new()
    }
}

impl RestoreTestHarness {
    pub fn new() -> Self {
        colored::control::set_override(false);
        let temp_dir = TempDir::new().unwrap();
        let config = RepositoryConfig {
            chunk_size: 4096,
            ..Default::default()
        };
        let repo = Repository::init(temp_dir.path().join("repo"), config).unwrap();
        let source = temp_dir.path().join("source");
        fs::create_dir_all(&source).unwrap();

        Self {
            temp_dir,
            repo,
            source,
            stdout: CapturedOutput::default(),
            stderr: CapturedOutput::default(),
        }
    }

    pub fn write(&self, rel: &str, content: &[u8]) {
        let path = self.source.join(rel);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, content).unwrap();
    }

    pub fn backup(&self) -> String {
        Archiver::new(&self.repo, &self.source).run().unwrap().0
    }

    pub fn backup_as(&self, host: &str, tags: &[&str]) -> String {
        Archiver::new(&self.repo, &self.source)
            .with_hostname(Some(host.to_string()))
            .with_tags(tags.iter().map(|t| t.to_string()).collect())
            .run()
            .unwrap()
            .0
    }

    pub fn target(&self, name: &str) -> PathBuf {
        self.temp_dir.path().join(name)
    }

    pub fn global_options(&self) -> GlobalOptions {
        GlobalOptions {
            repo: Some(self.repo.root().to_path_buf()),
            workers: 4,
            ..Default::default()
        }
    }

    pub fn restore(&self, spec: &str, opts: &RestoreOptions) -> Result<RestoreOutcome> {
        let printer = TextProgress::with_writers(Box::new(self.stdout.clone()), Box::new(self.stderr.clone()));
        restore_from_repository(
            opts,
            &self.global_options(),
            &[spec.to_string()],
            Arc::new(printer),
            &CancellationToken::new(),
        )
    }

    /// Files below `root` keyed by their relative path
    pub fn collect_files(root: &Path) -> BTreeMap<String, Vec<u8>> {
        walkdir::WalkDir::new(root)
            .into_iter()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_type().is_file())
            .map(|e| {
                let rel = e.path().strip_prefix(root).unwrap().to_string_lossy().replace('\\', "/");
                (rel, fs::read(e.path()).unwrap())
            })
            .collect()
    }
}

/// Generates random project trees from a fixed seed
pub struct FileGenerator {
    rng: StdRng,
}

/// Shape of a generated tree
#[derive(Debug, Clone)]
pub struct ProjectConfig {
    pub max_depth: usize,
    pub dirs_per_level: usize,
    pub files_per_dir: usize,
    pub file_size_range: std::ops::Range<usize>,
}

impl FileGenerator {
    pub fn new(seed: u64) -> Self {
        Self {
            rng: StdRng::seed_from_u64(seed),
        }
    }

    pub fn generate(&mut self, root: &Path, config: &ProjectConfig) -> usize {
        self.generate_level(root, config, 0)
    }

    fn generate_level(&mut self, dir: &Path, config: &ProjectConfig, depth: usize) -> usize {
        fs::create_dir_all(dir).unwrap();
        let mut count = 0;
        for i in 0..config.files_per_dir {
            let ext = if i % 2 == 0 { "txt" } else { "log" };
            let size = self.rng.random_range(config.file_size_range.clone());
            let content: Vec<u8> = (0..size).map(|_| self.rng.random()).collect();
            fs::write(dir.join(format!("file_{}.{}", i, ext)), content).unwrap();
            count += 1;
        }
        if depth < config.max_depth {
            for d in 0..config.dirs_per_level {
                count += self.generate_level(&dir.join(format!("dir_{}", d)), config, depth + 1);
            }
        }
        count
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tracing_test::traced_test;

    fn restore_opts(target: PathBuf) -> RestoreOptions {
        RestoreOptions {
            target,
            ..Default::default()
        }
    }

    #[test]
    #[traced_test]
    fn test_full_restore_of_generated_project() {
        let harness = RestoreTestHarness::new();
        let files = FileGenerator::new(42).generate(
            &harness.source,
            &ProjectConfig {
                max_depth: 2,
                dirs_per_level: 3,
                files_per_dir: 4,
                file_size_range: 0..10_000,
            },
        );
        harness.backup();

        let target = harness.target("out");
        let mut opts = restore_opts(target.clone());
        opts.verify = true;
        let outcome = harness.restore("latest", &opts).unwrap();

        assert_eq!(outcome.stats.files_restored, files);
        assert_eq!(outcome.files_verified, Some(files));
        assert_eq!(
            RestoreTestHarness::collect_files(&harness.source),
            RestoreTestHarness::collect_files(&target)
        );
        let stdout = harness.stdout.contents();
        assert!(stdout.contains("restoring snapshot "));
        assert!(stdout.contains("Summary: Restored"));
        assert!(stdout.contains(&format!("finished verifying {} files in", files)));
        info!("Restored {} files", files);
    }

    #[test]
    #[traced_test]
    fn test_exclude_patterns() {
        let harness = RestoreTestHarness::new();
        harness.write("keep/a.txt", b"a");
        harness.write("keep/b.log", b"b");
        harness.write("cache/big.bin", b"cache");
        harness.write("README.TXT", b"readme");
        harness.backup();

        let target = harness.target("out");
        let mut opts = restore_opts(target.clone());
        opts.exclude.excludes = vec!["*.log".into(), "/cache".into()];
        opts.exclude.insensitive_excludes = vec!["readme.txt".into()];
        harness.restore("latest", &opts).unwrap();

        // Only the first (case-sensitive) reject predicate is consulted
        let restored: Vec<String> = RestoreTestHarness::collect_files(&target).into_keys().collect();
        assert_eq!(restored, vec!["README.TXT".to_string(), "keep/a.txt".to_string()]);
    }

    #[test]
    fn test_include_patterns_from_file() {
        let harness = RestoreTestHarness::new();
        harness.write("docs/guide.md", b"guide");
        harness.write("docs/img/logo.png", b"png");
        harness.write("src/lib.rs", b"lib");
        harness.write("notes.md", b"notes");
        harness.backup();

        let pattern_file = harness.target("includes.txt");
        fs::write(&pattern_file, "# documentation only\n\n/docs/*.md\n/notes.md\n").unwrap();

        let target = harness.target("out");
        let mut opts = restore_opts(target.clone());
        opts.include.include_files = vec![pattern_file];
        harness.restore("latest", &opts).unwrap();

        let restored: Vec<String> = RestoreTestHarness::collect_files(&target).into_keys().collect();
        assert_eq!(restored, vec!["docs/guide.md".to_string(), "notes.md".to_string()]);
    }

    #[test]
    fn test_subfolder_restore() {
        let harness = RestoreTestHarness::new();
        harness.write("etc/nginx/nginx.conf", b"worker_processes 1;");
        harness.write("etc/hosts", b"127.0.0.1 localhost");
        let id = harness.backup();

        let target = harness.target("out");
        let outcome = harness
            .restore(&format!("{}:/etc/nginx", &id[..10]), &restore_opts(target.clone()))
            .unwrap();

        assert_eq!(outcome.snapshot_id, id);
        assert_eq!(outcome.subfolder, "/etc/nginx");
        let restored: Vec<String> = RestoreTestHarness::collect_files(&target).into_keys().collect();
        assert_eq!(restored, vec!["nginx.conf".to_string()]);
    }

    #[test]
    fn test_latest_respects_host_and_tag_filters() {
        let harness = RestoreTestHarness::new();
        harness.write("data.txt", b"from alpha");
        harness.backup_as("alpha", &["daily"]);
        harness.write("data.txt", b"from beta");
        harness.backup_as("beta", &["weekly"]);

        let target = harness.target("alpha");
        let mut opts = restore_opts(target.clone());
        opts.filter.hosts = vec!["alpha".into()];
        harness.restore("latest", &opts).unwrap();
        assert_eq!(fs::read(target.join("data.txt")).unwrap(), b"from alpha");

        let target = harness.target("weekly");
        let mut opts = restore_opts(target.clone());
        opts.filter.tags = vec!["weekly".into()];
        harness.restore("latest", &opts).unwrap();
        assert_eq!(fs::read(target.join("data.txt")).unwrap(), b"from beta");

        let mut opts = restore_opts(harness.target("none"));
        opts.filter.hosts = vec!["gamma".into()];
        let err = harness.restore("latest", &opts).unwrap_err();
        assert!(err.to_string().starts_with("failed to find snapshot: "));
    }

    #[test]
    fn test_corrupted_chunk_counts_errors_and_skips_verify() {
        let harness = RestoreTestHarness::new();
        harness.write("good.txt", b"good content");
        harness.write("bad.txt", b"this chunk will be corrupted");
        harness.backup();

        // Damage every object belonging to bad.txt
        let bad_chunk = utils_hash(b"this chunk will be corrupted");
        let object = harness.repo.root().join("objects").join(&bad_chunk[..2]).join(&bad_chunk[2..]);
        fs::write(&object, b"garbage").unwrap();

        let target = harness.target("out");
        let mut opts = restore_opts(target.clone());
        opts.verify = true;
        let err = harness.restore("latest", &opts).unwrap_err();

        assert!(matches!(err, RestoreError::TooManyErrors { count: 1 }));
        assert_eq!(err.to_string(), "There were 1 errors");
        assert_eq!(fs::read(target.join("good.txt")).unwrap(), b"good content");
        assert!(harness.stderr.contents().contains("ignoring error for /bad.txt"));
        assert!(!harness.stdout.contents().contains("verifying files in"));
    }

    #[test]
    fn test_validation_happens_before_repository_access() {
        let harness = RestoreTestHarness::new();
        let mut gopts = harness.global_options();
        gopts.repo = Some(harness.target("does-not-exist"));

        let mut opts = restore_opts(harness.target("out"));
        opts.exclude.exclude_files = vec![harness.target("missing-excludes.txt")];
        opts.include.includes = vec!["/x".into()];

        let printer = TextProgress::with_writers(Box::new(std::io::sink()), Box::new(std::io::sink()));
        let err = restore_from_repository(
            &opts,
            &gopts,
            &["latest".to_string()],
            Arc::new(printer),
            &CancellationToken::new(),
        )
        .unwrap_err();
        assert!(matches!(err, RestoreError::ConflictingFilters));
    }

    #[test]
    fn test_json_output() {
        let harness = RestoreTestHarness::new();
        harness.write("a.txt", b"a");
        harness.backup();

        let out = CapturedOutput::default();
        let err = CapturedOutput::default();
        let printer = JsonProgress::with_writers(Box::new(out.clone()), Box::new(err.clone()));
        let mut gopts = harness.global_options();
        gopts.json = true;

        let mut opts = restore_opts(harness.target("out"));
        opts.verify = true;
        restore_from_repository(&opts, &gopts, &["latest".to_string()], Arc::new(printer), &CancellationToken::new())
            .unwrap();

        let out = out.contents();
        // Human messages are suppressed, every line is JSON
        for line in out.lines() {
            let value: serde_json::Value = serde_json::from_str(line).unwrap();
            assert!(value["message_type"].is_string());
        }
        let last: serde_json::Value = serde_json::from_str(out.lines().last().unwrap()).unwrap();
        assert_eq!(last["message_type"], "summary");
        assert_eq!(last["files_restored"], 1);
        assert!(err.contents().is_empty());
    }

    fn utils_hash(data: &[u8]) -> String {
        use sha2::{Digest, Sha256};
        hex::encode(Sha256::digest(data))
    }
}
