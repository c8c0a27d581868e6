mod support;

use kiln_build::{BuildRequest, Builder};
use kiln_cache::{BuildCache, BuildStatus, CacheDir, FileFilter, SourceTree};
use kiln_scheduler::{OrchestratorConfig, RunStatus};
use std::fs;
use std::sync::{Arc, Barrier};
use support::{rewrite, ScriptedToolchain};

const BUILDERS: usize = 4;
const ROUNDS: usize = 3;

fn library(root: &std::path::Path, index: usize) -> BuildRequest {
    let src = root.join(format!("lib{index}"));
    BuildRequest::new(format!("lib{index}"), root.join("out").join(format!("lib{index}")))
        .with_tree(SourceTree::new("src", src, FileFilter::any()))
        .with_artifact(format!("lib{index}.a"))
}

/// Several builders sharing one cache directory, each editing and rebuilding
/// its own library, never lose each other's records or corrupt a cache file.
#[test]
fn concurrent_builds_share_one_cache_directory() {
    let tmp = tempfile::tempdir().unwrap();
    let root = tmp.path().to_path_buf();
    let cache = CacheDir::at(root.join("cache")).unwrap();

    for index in 0..BUILDERS {
        let src = root.join(format!("lib{index}"));
        fs::create_dir_all(&src).unwrap();
        fs::write(src.join("main.cpp"), format!("int f{index}() {{ return 0; }}\n")).unwrap();
        fs::write(src.join("extra.cpp"), "int g() { return 0; }\n").unwrap();
    }

    let barrier = Arc::new(Barrier::new(BUILDERS));
    let handles: Vec<_> = (0..BUILDERS)
        .map(|index| {
            let root = root.clone();
            let cache = cache.clone();
            let barrier = Arc::clone(&barrier);
            std::thread::spawn(move || {
                let toolchain = Arc::new(ScriptedToolchain::default());
                let builder = Builder::new(cache, toolchain)
                    .with_orchestrator_config(OrchestratorConfig::default().with_worker_count(2));
                let request = library(&root, index);
                barrier.wait();
                for round in 0..ROUNDS {
                    let report = builder.build(&request).unwrap();
                    assert_eq!(report.status, RunStatus::Success);
                    rewrite(
                        &root.join(format!("lib{index}")).join("main.cpp"),
                        &format!("int f{index}() {{ return {}; }}\n", round + 1),
                    );
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    for path in [cache.files_path(), cache.builds_path(), cache.artifacts_index_path()] {
        let text = fs::read_to_string(&path).unwrap();
        serde_json::from_str::<serde_json::Value>(&text)
            .unwrap_or_else(|err| panic!("{} does not parse: {err}", path.display()));
    }

    let builds = BuildCache::open(cache.builds_path());
    assert_eq!(builds.len(), BUILDERS);
    for index in 0..BUILDERS {
        let entry = builds.entry(&format!("lib{index}")).unwrap();
        assert_eq!(entry.last_status, BuildStatus::Success);
    }
    assert_eq!(cache.open_artifact_cache().len(), BUILDERS * ROUNDS);

    // Every library saw its last edit: one more build recompiles only main.cpp.
    let toolchain = Arc::new(ScriptedToolchain::default());
    let builder = Builder::new(cache.clone(), toolchain.clone());
    for index in 0..BUILDERS {
        let report = builder.build(&library(&root, index)).unwrap();
        assert_eq!(report.status, RunStatus::Success);
        assert_eq!(report.compiled(), 1);
        assert!(builder.build(&library(&root, index)).unwrap().skipped);
    }
    assert_eq!(toolchain.compiled().len(), BUILDERS);
}
