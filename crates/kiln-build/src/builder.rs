use crate::error::Result;
use crate::plan::{plan_build, BuildPlan};
use crate::report::{ArtifactReport, ArtifactSource, BuildReport, JobReport};
use crate::request::BuildRequest;
use crate::toolchain::{LinkInvocation, Toolchain, ToolchainExecutor};
use kiln_cache::{
    ArtifactCache, BuildFingerprint, BuildFingerprintCalculator, BuildStatus, CacheDir, Digest,
    DigestBuilder, FileFingerprintStore, GcPolicy, GcReport, TreeSnapshot, TREE_COMPONENT_PREFIX,
};
use kiln_scheduler::{CompilationOrchestrator, OrchestratorConfig, RunResult, RunStatus};
use std::sync::Arc;
use std::time::Instant;

pub const CONFIG_COMPONENT: &str = "config";
pub const TOOLCHAIN_COMPONENT: &str = "toolchain";
pub const BUILD_SCRIPT_COMPONENT: &str = "build-script";
pub const PRECOMPILED_HEADER_COMPONENT: &str = "precompiled-header";

/// Wires the caches, the fingerprint calculator and the orchestrator into
/// incremental builds.
///
/// Each [`Builder::build`] loads the caches from the [`CacheDir`], decides
/// what to rebuild, runs the jobs and commits the caches. Concurrent builders
/// (threads or processes) may share one cache directory.
#[derive(Debug, Clone)]
pub struct Builder {
    cache_dir: CacheDir,
    toolchain: Arc<dyn Toolchain>,
    orchestrator: CompilationOrchestrator,
    disable_cache: bool,
}

impl Builder {
    pub fn new(cache_dir: CacheDir, toolchain: Arc<dyn Toolchain>) -> Self {
        Self {
            cache_dir,
            toolchain,
            orchestrator: CompilationOrchestrator::default(),
            disable_cache: false,
        }
    }

    pub fn with_orchestrator_config(mut self, config: OrchestratorConfig) -> Self {
        self.orchestrator = CompilationOrchestrator::new(config);
        self
    }

    /// Rebuild everything, rehash every file and bypass artifact reuse.
    /// Results are still recorded.
    pub fn with_disable_cache(mut self, disable_cache: bool) -> Self {
        self.disable_cache = disable_cache;
        self
    }

    pub fn cache_dir(&self) -> &CacheDir {
        &self.cache_dir
    }

    pub fn build(&self, request: &BuildRequest) -> Result<BuildReport> {
        request.validate()?;
        let started = Instant::now();
        let key = request.build_key.as_str();

        let store = self
            .cache_dir
            .open_file_store()
            .with_force_rehash(self.disable_cache);
        let mut builds = self
            .cache_dir
            .open_build_cache()
            .with_disabled(self.disable_cache);
        let mut artifacts = self
            .cache_dir
            .open_artifact_cache()
            .with_disabled(self.disable_cache);

        let (fingerprint, snapshots) = self.fingerprint(request, &store);

        if !builds.should_rebuild(key, &fingerprint) {
            if let Some(artifact) = reusable_output(request, &snapshots, &fingerprint, &mut artifacts)? {
                store.commit()?;
                artifacts.commit()?;
                tracing::info!(
                    target: "kiln.build",
                    build_key = key,
                    fingerprint = %fingerprint.combined.short(),
                    "build is up to date"
                );
                return Ok(BuildReport {
                    build_key: request.build_key.clone(),
                    target_id: request.target_id.clone(),
                    skipped: true,
                    fingerprint: fingerprint.combined.clone(),
                    fingerprint_incomplete: false,
                    jobs: Vec::new(),
                    up_to_date: count_units(request, &snapshots),
                    status: RunStatus::Success,
                    artifact,
                    link_error: None,
                    watchdog: None,
                    elapsed_ms: elapsed_ms(started),
                });
            }
        }

        let force_all = self.disable_cache
            || builds
                .entry(key)
                .map_or(true, |entry| !same_settings(&entry.components, &fingerprint));
        let header_digest = request
            .precompiled_header
            .as_deref()
            .and_then(|header| store.hash_of(header));
        let plan = plan_build(
            request,
            &snapshots,
            header_digest.as_ref(),
            builds.entry(key),
            force_all,
        );
        tracing::info!(
            target: "kiln.build",
            build_key = key,
            jobs = plan.jobs.len(),
            up_to_date = plan.up_to_date(),
            force_all,
            "building"
        );

        let executor = Arc::new(ToolchainExecutor::new(
            Arc::clone(&self.toolchain),
            request.settings.clone(),
            plan.precompiled_header_output.clone(),
        ));
        let run = self.orchestrator.run(plan.jobs.clone(), executor)?;

        let mut status = run.overall;
        let mut artifact = None;
        let mut link_error = None;
        if status == RunStatus::Success {
            match self.link(request, &plan, &fingerprint, &mut artifacts) {
                Ok(linked) => artifact = linked,
                Err(message) => {
                    status = RunStatus::Failure;
                    link_error = Some(message);
                }
            }
        }

        let built_inputs =
            plan.built_inputs(|id| run.outcome(id).map_or(false, |outcome| outcome.is_done()));
        if status == RunStatus::Success {
            builds.record_attempt(key, &fingerprint, BuildStatus::Success, built_inputs);
        } else {
            // Unfinished sources are left out of the record, so this key retries
            // exactly those. Forgetting them also makes the store rehash them.
            for job in &plan.jobs {
                if run.outcome(job.id).map_or(true, |outcome| !outcome.is_done()) {
                    store.forget(&job.source_path);
                }
            }
            builds.record_attempt(key, &fingerprint, BuildStatus::Failure, built_inputs);
        }
        // The build record goes last so it never describes files that weren't committed.
        store.commit()?;
        artifacts.commit()?;
        builds.commit()?;

        let report = BuildReport {
            build_key: request.build_key.clone(),
            target_id: request.target_id.clone(),
            skipped: false,
            fingerprint: fingerprint.combined.clone(),
            fingerprint_incomplete: fingerprint.incomplete,
            jobs: job_reports(&plan, &run),
            up_to_date: plan.up_to_date(),
            status,
            artifact,
            link_error,
            watchdog: run.watchdog.clone(),
            elapsed_ms: elapsed_ms(started),
        };
        log_finished(&report);
        Ok(report)
    }

    /// Runs artifact GC with `policy` and persists the result.
    pub fn collect_garbage(&self, policy: &GcPolicy) -> Result<GcReport> {
        let mut artifacts = self.cache_dir.open_artifact_cache();
        let report = artifacts.collect_garbage(policy);
        artifacts.commit()?;
        Ok(report)
    }

    /// Forgets every file, build and artifact, so the next build starts from scratch.
    pub fn reset_caches(&self) -> Result<()> {
        let store = self.cache_dir.open_file_store();
        store.reset();
        store.commit()?;

        let mut builds = self.cache_dir.open_build_cache();
        builds.reset();
        builds.commit()?;

        let mut artifacts = self.cache_dir.open_artifact_cache();
        artifacts.reset()?;
        artifacts.commit()?;

        tracing::info!(
            target: "kiln.build",
            cache_dir = %self.cache_dir.root().display(),
            "reset caches"
        );
        Ok(())
    }

    fn fingerprint(
        &self,
        request: &BuildRequest,
        store: &FileFingerprintStore,
    ) -> (BuildFingerprint, Vec<TreeSnapshot>) {
        let calculator = BuildFingerprintCalculator::new(store);
        let mut incomplete = false;

        let mut components = vec![
            (CONFIG_COMPONENT.to_string(), config_digest(request)),
            (TOOLCHAIN_COMPONENT.to_string(), self.toolchain.identity()),
        ];
        if !request.build_script_inputs.is_empty() {
            let scripts = calculator.digest_files(&request.build_script_inputs);
            incomplete |= scripts.incomplete;
            components.push((BUILD_SCRIPT_COMPONENT.to_string(), scripts.digest));
        }
        if let Some(header) = &request.precompiled_header {
            let header = calculator.digest_files(std::slice::from_ref(header));
            incomplete |= header.incomplete;
            components.push((PRECOMPILED_HEADER_COMPONENT.to_string(), header.digest));
        }

        let (mut fingerprint, snapshots) =
            calculator.compute_with_snapshots(&request.build_key, &request.trees, &components);
        fingerprint.incomplete |= incomplete;
        (fingerprint, snapshots)
    }

    /// Produces the linked artifact: from the artifact cache when this exact
    /// fingerprint was linked before, otherwise by running the linker and
    /// storing the result.
    fn link(
        &self,
        request: &BuildRequest,
        plan: &BuildPlan,
        fingerprint: &BuildFingerprint,
        artifacts: &mut ArtifactCache,
    ) -> std::result::Result<Option<ArtifactReport>, String> {
        let Some(output) = request.artifact_path() else {
            return Ok(None);
        };
        // An incomplete fingerprint doesn't identify its inputs.
        let cacheable = !fingerprint.incomplete;

        if cacheable {
            match artifacts.materialize(&request.target_id, &fingerprint.combined, &output) {
                Ok(Some(path)) => {
                    tracing::info!(
                        target: "kiln.build",
                        target_id = %request.target_id,
                        path = %path.display(),
                        "restored artifact from cache"
                    );
                    return Ok(Some(ArtifactReport {
                        path,
                        source: ArtifactSource::Cache,
                    }));
                }
                Ok(None) => {}
                Err(err) => {
                    tracing::warn!(
                        target: "kiln.build",
                        target_id = %request.target_id,
                        error = %err,
                        "failed to restore cached artifact; linking instead"
                    );
                }
            }
        }

        if let Some(parent) = output.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|err| format!("failed to create {}: {err}", parent.display()))?;
        }
        let objects = plan.objects();
        self.toolchain
            .link(&LinkInvocation {
                objects: &objects,
                output: &output,
                settings: &request.settings,
            })
            .map_err(|err| err.to_string())?;
        if !output.is_file() {
            return Err(format!("linker did not produce {}", output.display()));
        }

        if cacheable {
            if let Err(err) = artifacts.store(&request.target_id, &fingerprint.combined, &output) {
                tracing::warn!(
                    target: "kiln.build",
                    target_id = %request.target_id,
                    error = %err,
                    "failed to store artifact in cache"
                );
            }
        }
        Ok(Some(ArtifactReport {
            path: output,
            source: ArtifactSource::Linked,
        }))
    }
}

/// The output a skipped build would leave behind, if it is actually there.
///
/// A linking build needs its artifact (restored from the cache if needed);
/// a compile-only build needs every object.
fn reusable_output(
    request: &BuildRequest,
    snapshots: &[TreeSnapshot],
    fingerprint: &BuildFingerprint,
    artifacts: &mut ArtifactCache,
) -> Result<Option<Option<ArtifactReport>>> {
    let Some(output) = request.artifact_path() else {
        let objects_present = translation_units(request, snapshots)
            .all(|(label, relative)| request.object_path(label, relative).is_file());
        return Ok(objects_present.then_some(None));
    };

    if output.is_file() {
        // Refreshes `last_used_at` so GC sees the artifact as live.
        let _ = artifacts.lookup(&request.target_id, &fingerprint.combined);
        return Ok(Some(Some(ArtifactReport {
            path: output,
            source: ArtifactSource::UpToDate,
        })));
    }
    let restored = artifacts.materialize(&request.target_id, &fingerprint.combined, &output)?;
    Ok(restored.map(|path| {
        Some(ArtifactReport {
            path,
            source: ArtifactSource::Cache,
        })
    }))
}

fn translation_units<'a>(
    request: &'a BuildRequest,
    snapshots: &'a [TreeSnapshot],
) -> impl Iterator<Item = (&'a str, &'a str)> + 'a {
    snapshots.iter().flat_map(move |snapshot| {
        snapshot
            .files
            .iter()
            .filter(move |file| request.settings.is_translation_unit(&file.path))
            .map(move |file| (snapshot.label.as_str(), file.relative.as_str()))
    })
}

fn count_units(request: &BuildRequest, snapshots: &[TreeSnapshot]) -> usize {
    translation_units(request, snapshots).count()
}

/// Digest of everything in the request that isn't a file.
///
/// Paths stay out of it so a moved checkout keeps its fingerprints; a new
/// output directory is caught by the missing-output checks instead.
fn config_digest(request: &BuildRequest) -> Digest {
    let mut builder = DigestBuilder::new();
    builder
        .field("kiln-build-config-v1")
        .field(&request.target_id)
        .field(request.artifact_name.as_deref().unwrap_or_default());
    let lists: [&[String]; 3] = [
        &request.settings.flags,
        &request.settings.defines,
        request.settings.translation_units.extension_list(),
    ];
    for list in lists {
        builder.field(list.len().to_string());
        for item in list {
            builder.field(item);
        }
    }
    builder.finish()
}

/// Whether the non-tree components (configuration, toolchain, build scripts,
/// precompiled header) match the previous attempt's.
fn same_settings(previous: &[(String, Digest)], fingerprint: &BuildFingerprint) -> bool {
    previous
        .iter()
        .filter(|(label, _)| !label.starts_with(TREE_COMPONENT_PREFIX))
        .eq(fingerprint.non_tree_components())
}

fn job_reports(plan: &BuildPlan, run: &RunResult) -> Vec<JobReport> {
    plan.jobs
        .iter()
        .filter_map(|job| {
            run.outcome(job.id).map(|outcome| JobReport {
                id: job.id,
                kind: job.kind,
                source: job.source_path.clone(),
                outcome: outcome.clone(),
            })
        })
        .collect()
}

fn log_finished(report: &BuildReport) {
    let failed: Vec<String> = report
        .failed_jobs()
        .map(|job| job.source.display().to_string())
        .collect();
    match report.status {
        RunStatus::Success => tracing::info!(
            target: "kiln.build",
            build_key = %report.build_key,
            compiled = report.compiled(),
            up_to_date = report.up_to_date,
            elapsed_ms = report.elapsed_ms,
            "build succeeded"
        ),
        RunStatus::Failure => tracing::warn!(
            target: "kiln.build",
            build_key = %report.build_key,
            failed = ?failed,
            link_error = report.link_error.as_deref().unwrap_or(""),
            "build failed"
        ),
        RunStatus::WatchdogTimeout => tracing::error!(
            target: "kiln.build",
            build_key = %report.build_key,
            unfinished = failed.len(),
            "build stopped by watchdog"
        ),
    }
}

fn elapsed_ms(started: Instant) -> u64 {
    u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX)
}
