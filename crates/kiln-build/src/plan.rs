use crate::request::BuildRequest;
use kiln_cache::{BuildCacheEntry, Digest, TreeSnapshot};
use kiln_scheduler::{CompilationJob, JobId};
use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;

/// Id of the precompiled-header job. Translation units are numbered from 1.
pub(crate) const PCH_JOB_ID: JobId = JobId(0);

/// Key of the precompiled header in [`BuildCacheEntry::inputs`]. Tree file
/// keys always contain a `/`, so the two never collide.
pub(crate) const PRECOMPILED_HEADER_INPUT: &str = "precompiled-header";

/// Why a job was scheduled. Only used for logging.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum RebuildReason {
    /// Every job reruns: first build, disabled cache, or a changed configuration,
    /// toolchain or build script.
    Forced,
    SourceChanged,
    OutputMissing,
    PrecompiledHeaderRebuilt,
    /// A non-translation-unit file (a header) of the same tree changed.
    TreeInputChanged,
}

/// One translation unit and where its object goes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct TranslationUnit {
    pub id: JobId,
    pub source: PathBuf,
    pub object: PathBuf,
    /// Key of the source in [`BuildCacheEntry::inputs`].
    pub input: String,
}

#[derive(Debug, Clone, Default)]
pub(crate) struct BuildPlan {
    /// Jobs to run, in id order.
    pub jobs: Vec<CompilationJob>,
    /// Every translation unit of the request, scheduled or not.
    pub units: Vec<TranslationUnit>,
    pub precompiled_header_output: Option<PathBuf>,
    /// Current digest of every readable input, keyed like [`BuildCacheEntry::inputs`].
    pub inputs: BTreeMap<String, Digest>,
}

impl BuildPlan {
    /// Objects to link, in translation-unit order.
    pub fn objects(&self) -> Vec<PathBuf> {
        self.units.iter().map(|unit| unit.object.clone()).collect()
    }

    pub fn up_to_date(&self) -> usize {
        let scheduled: BTreeSet<JobId> = self.jobs.iter().map(|job| job.id).collect();
        self.units
            .iter()
            .filter(|unit| !scheduled.contains(&unit.id))
            .count()
    }

    /// The input digests to record after a run: every current input except
    /// those whose scheduled job did not finish, so the next attempt
    /// recompiles exactly those.
    pub fn built_inputs(&self, is_done: impl Fn(JobId) -> bool) -> BTreeMap<String, Digest> {
        let mut inputs = self.inputs.clone();
        for job in &self.jobs {
            if is_done(job.id) {
                continue;
            }
            if job.id == PCH_JOB_ID {
                inputs.remove(PRECOMPILED_HEADER_INPUT);
            } else if let Some(unit) = self.units.iter().find(|unit| unit.id == job.id) {
                inputs.remove(&unit.input);
            }
        }
        inputs
    }
}

/// Decides which jobs must run.
///
/// Inputs are compared with the digests `previous` recorded for this build
/// key, never with another key's, so targets sharing a tree each notice an
/// edit. There is no include scanning: when a tracked file that is not a
/// translation unit changes, every translation unit of its tree is rebuilt.
pub(crate) fn plan_build(
    request: &BuildRequest,
    snapshots: &[TreeSnapshot],
    header_digest: Option<&Digest>,
    previous: Option<&BuildCacheEntry>,
    force_all: bool,
) -> BuildPlan {
    let mut plan = BuildPlan {
        precompiled_header_output: request.precompiled_header_output(),
        ..BuildPlan::default()
    };
    let changed = |input: &str, current: Option<&Digest>| {
        previous.map_or(true, |entry| entry.input_changed(input, current))
    };

    if let Some(digest) = header_digest {
        plan.inputs
            .insert(PRECOMPILED_HEADER_INPUT.to_string(), digest.clone());
    }
    let pch_job = match (&request.precompiled_header, &plan.precompiled_header_output) {
        (Some(header), Some(output)) => {
            let reason = if force_all {
                Some(RebuildReason::Forced)
            } else if changed(PRECOMPILED_HEADER_INPUT, header_digest) {
                Some(RebuildReason::SourceChanged)
            } else if !output.is_file() {
                Some(RebuildReason::OutputMissing)
            } else {
                None
            };
            reason.map(|reason| {
                log_scheduled(PCH_JOB_ID, header, reason);
                CompilationJob::precompiled_header(PCH_JOB_ID, header, output)
            })
        }
        _ => None,
    };
    let pch_rebuilt = pch_job.is_some();
    plan.jobs.extend(pch_job);

    let mut next_id = PCH_JOB_ID.0 + 1;
    for snapshot in snapshots {
        let mut tree_input_changed = false;
        for file in &snapshot.files {
            let input = BuildCacheEntry::input_key(&snapshot.label, &file.relative);
            if !request.settings.is_translation_unit(&file.path) {
                tree_input_changed |= changed(&input, file.digest.as_ref());
            }
            if let Some(digest) = &file.digest {
                plan.inputs.insert(input, digest.clone());
            }
        }

        for file in &snapshot.files {
            if !request.settings.is_translation_unit(&file.path) {
                continue;
            }
            let unit = TranslationUnit {
                id: JobId(next_id),
                source: file.path.clone(),
                object: request.object_path(&snapshot.label, &file.relative),
                input: BuildCacheEntry::input_key(&snapshot.label, &file.relative),
            };
            next_id += 1;

            let reason = if force_all {
                Some(RebuildReason::Forced)
            } else if pch_rebuilt {
                Some(RebuildReason::PrecompiledHeaderRebuilt)
            } else if changed(&unit.input, file.digest.as_ref()) {
                Some(RebuildReason::SourceChanged)
            } else if tree_input_changed {
                Some(RebuildReason::TreeInputChanged)
            } else if !unit.object.is_file() {
                Some(RebuildReason::OutputMissing)
            } else {
                None
            };

            if let Some(reason) = reason {
                log_scheduled(unit.id, &unit.source, reason);
                let mut job = CompilationJob::compile(unit.id, &unit.source, &unit.object);
                if pch_rebuilt {
                    job = job.with_prerequisite(PCH_JOB_ID);
                }
                plan.jobs.push(job);
            }
            plan.units.push(unit);
        }
    }

    tracing::debug!(
        target: "kiln.build",
        build_key = %request.build_key,
        jobs = plan.jobs.len(),
        translation_units = plan.units.len(),
        "planned build"
    );
    plan
}

fn log_scheduled(id: JobId, source: &std::path::Path, reason: RebuildReason) {
    tracing::trace!(
        target: "kiln.build",
        job = %id,
        source = %source.display(),
        reason = ?reason,
        "scheduling job"
    );
}
