//! Main test module for snaprestore
//!
//! This module includes all test suites:
//! - Integration tests for end-to-end restore scenarios
//! - Property-based tests for selection invariants
//! - Edge cases around unusual trees and repository state

pub mod integration;
pub mod property;

#[cfg(test)]
mod edge_cases {
    use super::integration::RestoreTestHarness;
    use ::snaprestore::*;
    use std::fs;

    fn opts(harness: &RestoreTestHarness, name: &str) -> RestoreOptions {
        RestoreOptions {
            target: harness.target(name),
            ..Default::default()
        }
    }

    #[test]
    fn test_empty_snapshot() {
        let harness = RestoreTestHarness::new();
        harness.backup();

        let outcome = harness.restore("latest", &opts(&harness, "out")).unwrap();
        assert_eq!(outcome.stats, RestoreStats::default());
        assert!(harness.target("out").is_dir());
    }

    #[test]
    fn test_unicode_filenames() {
        let harness = RestoreTestHarness::new();
        let names = ["файл.txt", "文件.txt", "ファイル.txt", "αρχείο.txt", "🚀🌟💾.txt"];

        let mut created = Vec::new();
        for name in &names {
            if fs::write(harness.source.join(name), format!("Unicode content: {}", name)).is_ok() {
                created.push(*name);
            }
        }
        if created.is_empty() {
            // No unicode support on this system
            return;
        }
        harness.backup();

        let target = harness.target("out");
        harness.restore("latest", &opts(&harness, "out")).unwrap();
        for name in &created {
            let content = fs::read_to_string(target.join(name)).unwrap();
            assert_eq!(content, format!("Unicode content: {}", name));
        }
    }

    #[test]
    fn test_permission_preservation() {
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;

            let harness = RestoreTestHarness::new();
            let files = [
                ("readable.txt", 0o644),
                ("executable.sh", 0o755),
                ("readonly.txt", 0o444),
                ("useronly.txt", 0o600),
            ];
            for (name, mode) in &files {
                let path = harness.source.join(name);
                fs::write(&path, format!("Content of {}", name)).unwrap();
                fs::set_permissions(&path, fs::Permissions::from_mode(*mode)).unwrap();
            }
            harness.backup();

            let target = harness.target("out");
            harness.restore("latest", &opts(&harness, "out")).unwrap();
            for (name, expected_mode) in &files {
                let actual = fs::metadata(target.join(name)).unwrap().permissions().mode() & 0o777;
                assert_eq!(
                    actual, *expected_mode,
                    "Permission mismatch for {}: expected {:o}, got {:o}",
                    name, expected_mode, actual
                );
            }
        }
    }

    #[test]
    fn test_restore_over_existing_target() {
        let harness = RestoreTestHarness::new();
        harness.write("a.txt", b"snapshot content");
        harness.backup();

        let target = harness.target("out");
        fs::create_dir_all(&target).unwrap();
        fs::write(target.join("a.txt"), b"a much longer local content that must be truncated").unwrap();
        fs::write(target.join("unrelated.txt"), b"stays").unwrap();

        let mut options = opts(&harness, "out");
        options.verify = true;
        harness.restore("latest", &options).unwrap();
        assert_eq!(fs::read(target.join("a.txt")).unwrap(), b"snapshot content");
        assert_eq!(fs::read(target.join("unrelated.txt")).unwrap(), b"stays");
    }

    #[test]
    fn test_subfolder_that_is_a_file() {
        let harness = RestoreTestHarness::new();
        harness.write("etc/hosts", b"127.0.0.1");
        harness.backup();

        let err = harness.restore("latest:/etc/hosts", &opts(&harness, "out")).unwrap_err();
        assert!(matches!(err, RestoreError::NotADirectory(_)));
    }

    #[test]
    fn test_repository_locked_exclusively() {
        let harness = RestoreTestHarness::new();
        harness.write("a.txt", b"a");
        harness.backup();

        let _exclusive = harness.repo.lock(LockKind::Exclusive).unwrap();
        let err = harness.restore("latest", &opts(&harness, "out")).unwrap_err();
        assert!(matches!(err, RestoreError::Locked(_)));

        let mut gopts = harness.global_options();
        gopts.no_lock = true;
        let printer = TextProgress::with_writers(Box::new(std::io::sink()), Box::new(std::io::sink()));
        restore_from_repository(
            &opts(&harness, "out"),
            &gopts,
            &["latest".to_string()],
            std::sync::Arc::new(printer),
            &tokio_util::sync::CancellationToken::new(),
        )
        .unwrap();
    }

    #[test]
    fn test_ambiguous_and_unknown_ids() {
        let harness = RestoreTestHarness::new();
        harness.write("a.txt", b"a");
        harness.backup();

        let err = harness.restore("0000000000", &opts(&harness, "out")).unwrap_err();
        assert!(err.to_string().starts_with("failed to find snapshot: "));
    }
}
