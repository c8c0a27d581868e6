use kiln_cache::{ArtifactCache, CacheDir, Digest, EvictionReason, GcPolicy};
use std::path::Path;
use tempfile::TempDir;

fn build_output(dir: &Path, name: &str, contents: &[u8]) -> std::path::PathBuf {
    let path = dir.join("out").join(name);
    std::fs::create_dir_all(path.parent().unwrap()).unwrap();
    std::fs::write(&path, contents).unwrap();
    path
}

fn store_generations(cache: &mut ArtifactCache, root: &Path, target: &str, count: usize) {
    for generation in 0..count {
        let out = build_output(root, &format!("lib{target}.a"), format!("{target}-{generation}").as_bytes());
        let fp = Digest::from_bytes(format!("{target}-{generation}"));
        cache.store(target, &fp, &out).unwrap();
        // Distinct `last_used_at` values keep eviction order deterministic.
        std::thread::sleep(std::time::Duration::from_millis(3));
    }
}

#[test]
fn count_stage_deletes_files_and_keeps_newest() {
    let tmp = TempDir::new().unwrap();
    let dir = CacheDir::at(tmp.path().join("cache")).unwrap();
    let mut cache = dir.open_artifact_cache();
    store_generations(&mut cache, tmp.path(), "core", 5);
    store_generations(&mut cache, tmp.path(), "app", 1);
    cache.commit().unwrap();

    let policy = GcPolicy {
        max_entries_per_target: 2,
        max_age_ms: None,
        max_total_bytes: None,
    };
    let report = cache.collect_garbage(&policy);
    cache.commit().unwrap();

    assert_eq!(report.evicted.len(), 3);
    assert!(report.failed.is_empty());
    assert!(report.evicted.iter().all(|e| e.reason == EvictionReason::Count));
    assert!(report.evicted.iter().all(|e| e.target_id == "core"));
    for evicted in &report.evicted {
        assert!(!evicted.artifact_path.exists());
    }
    assert_eq!(report.after_bytes, report.before_bytes - 3 * 6);

    let reopened = dir.open_artifact_cache();
    assert_eq!(reopened.len(), 3);
    let mut core_left: Vec<_> = reopened
        .entries()
        .filter(|e| e.target_id == "core")
        .map(|e| e.fingerprint.clone())
        .collect();
    core_left.sort();
    let mut expected = vec![Digest::from_bytes("core-3"), Digest::from_bytes("core-4")];
    expected.sort();
    assert_eq!(core_left, expected);
}

#[test]
fn size_stage_never_removes_a_targets_last_artifact() {
    let tmp = TempDir::new().unwrap();
    let dir = CacheDir::at(tmp.path().join("cache")).unwrap();
    let mut cache = dir.open_artifact_cache();
    store_generations(&mut cache, tmp.path(), "core", 1);
    store_generations(&mut cache, tmp.path(), "app", 1);

    let report = cache.collect_garbage(&GcPolicy {
        max_entries_per_target: 10,
        max_age_ms: None,
        max_total_bytes: Some(0),
    });

    assert!(report.evicted.is_empty());
    assert_eq!(cache.len(), 2);
}

#[test]
fn externally_deleted_artifacts_still_evict_cleanly() {
    let tmp = TempDir::new().unwrap();
    let dir = CacheDir::at(tmp.path().join("cache")).unwrap();
    let mut cache = dir.open_artifact_cache();
    store_generations(&mut cache, tmp.path(), "core", 3);

    let oldest = cache
        .entries()
        .min_by_key(|e| e.last_used_at)
        .unwrap()
        .artifact_path
        .clone();
    std::fs::remove_file(&oldest).unwrap();

    let report = cache.collect_garbage(&GcPolicy {
        max_entries_per_target: 1,
        max_age_ms: None,
        max_total_bytes: None,
    });
    assert_eq!(report.evicted.len(), 2);
    assert!(report.failed.is_empty());
    assert_eq!(cache.len(), 1);
}
