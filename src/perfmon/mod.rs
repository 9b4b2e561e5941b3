//! Counter-definition processing: selection, bucketing, pass planning and
//! emission of per-pass definition files.

pub mod bucket;
pub mod files;
pub mod line;
pub mod plan;
pub mod select;

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tracing::{info, warn};

use crate::soc::SocCapacity;
use bucket::{ClassifyError, Classifier, CounterBucket, LevelOptions, LevelPass, LineOutcome};
use plan::PlanResult;
use select::Selection;

/// Bucketed counters plus level lines diverted to their own passes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Coalesced {
    pub bucket: CounterBucket,
    pub levels: Vec<LevelPass>,
}

/// Classify every `pmc:` line of the given definition texts.
///
/// Level lines are written to `level_dir` when one is given. Channel lists
/// are sorted once, after all texts are processed.
pub fn coalesce<'t>(
    definitions: impl IntoIterator<Item = &'t str>,
    soc: &SocCapacity,
    level_dir: Option<&Path>,
) -> Result<Coalesced, ClassifyError> {
    let classifier = Classifier::new(soc);
    let mut bucket = classifier.empty_bucket();
    let mut levels = Vec::new();

    for text in definitions {
        for line in line::parse_lines(text) {
            let opts = match level_dir {
                Some(dir) => LevelOptions::save_to(&line.text, dir),
                None => LevelOptions::in_memory(&line.text),
            };
            if let LineOutcome::Level(level) =
                classifier.add_line(&mut bucket, &line.counters, &opts)?
            {
                levels.push(level);
            }
        }
    }

    bucket.sort_channels();
    Ok(Coalesced { bucket, levels })
}

/// Read and coalesce reference files, writing level and timestamp
/// definitions into `perfmon_dir`.
pub fn coalesce_files(
    sources: &[PathBuf],
    soc: &SocCapacity,
    perfmon_dir: &Path,
) -> Result<Coalesced> {
    let mut texts = Vec::with_capacity(sources.len());
    for path in sources {
        let text =
            fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
        texts.push(text);
    }

    let coalesced = coalesce(texts.iter().map(String::as_str), soc, Some(perfmon_dir))
        .context("classifying counters")?;
    files::write_timestamps(perfmon_dir)?;

    info!(
        files = sources.len(),
        counters = coalesced.bucket.len(),
        level_passes = coalesced.levels.len(),
        "coalesced counter definitions",
    );

    Ok(coalesced)
}

/// Inputs for producing a workload's pass definitions.
#[derive(Debug, Clone)]
pub struct FilterRequest<'a> {
    /// Directory holding the reference `pmc_*_perf*.txt` files.
    pub perfmon_dir: &'a Path,
    /// Workload output directory; recreated from scratch.
    pub workload_dir: &'a Path,
    pub soc: &'a SocCapacity,
    /// Optional block allowlist, case-insensitive.
    pub ip_blocks: Option<&'a [String]>,
    /// Split the combined plan into one file per pass.
    pub split_passes: bool,
}

/// What was produced for a workload.
#[derive(Debug, Clone)]
pub struct WorkloadPlan {
    pub selection: Selection,
    pub plan: PlanResult,
    pub levels: Vec<LevelPass>,
    /// Per-pass definition files, empty unless splitting was requested.
    pub pass_files: Vec<PathBuf>,
}

/// Select, coalesce, plan and emit pass definitions for a workload.
///
/// Sources are selected before the workload directory is recreated, so a
/// selection error leaves prior outputs in place.
pub fn filter_workload(req: &FilterRequest<'_>) -> Result<WorkloadPlan> {
    let selection = select::select_sources(req.perfmon_dir, req.soc.name(), req.ip_blocks)?;
    let perfmon_out = select::prepare_workload_dir(req.workload_dir)?;

    emit_workload(selection, req.soc, &perfmon_out, req.split_passes)
}

/// Plan the roofline counter set, recreating only the workload's perfmon
/// subdirectory.
pub fn roofline_workload(
    perfmon_dir: &Path,
    workload_dir: &Path,
    soc: &SocCapacity,
    split_passes: bool,
) -> Result<WorkloadPlan> {
    let selection = Selection {
        included: select::roofline_sources(perfmon_dir)?,
        excluded: Vec::new(),
    };
    let perfmon_out = select::prepare_perfmon_dir(workload_dir)?;

    emit_workload(selection, soc, &perfmon_out, split_passes)
}

fn emit_workload(
    selection: Selection,
    soc: &SocCapacity,
    perfmon_out: &Path,
    split_passes: bool,
) -> Result<WorkloadPlan> {
    let coalesced = coalesce_files(&selection.included, soc, perfmon_out)?;
    let plan = plan::plan(&coalesced.bucket, soc).context("planning passes")?;
    if plan.is_empty() {
        warn!(soc = soc.name(), "no counters selected, plan is empty");
    }

    files::write_plan(perfmon_out, &plan)?;
    let pass_files = if split_passes {
        files::split_plan(perfmon_out)?
    } else {
        Vec::new()
    };

    Ok(WorkloadPlan {
        selection,
        plan,
        levels: coalesced.levels,
        pass_files,
    })
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::panic)]
mod tests {
    use super::*;
    use crate::soc::{CapacityTable, HardwareBlock};

    #[test]
    fn test_coalesce_dedups_across_files() {
        let table = CapacityTable::builtin();
        let soc = table.get("mi200").unwrap();
        let a = "pmc: SQ_WAVES SQ_BUSY_CYCLES\npmc: TCC_HIT[1] TCC_EA_RDREQ[1]\n";
        let b = "# second file\npmc: SQ_WAVES GRBM_COUNT # dup\n";

        let coalesced = coalesce([a, b], soc, None).unwrap();

        assert_eq!(
            coalesced.bucket.block(HardwareBlock::Sq),
            ["SQ_WAVES", "SQ_BUSY_CYCLES"]
        );
        assert_eq!(coalesced.bucket.block(HardwareBlock::Grbm), ["GRBM_COUNT"]);
        assert_eq!(
            coalesced.bucket.channels()[&1],
            ["TCC_EA_RDREQ[1]", "TCC_HIT[1]"]
        );
        assert!(coalesced.levels.is_empty());
    }

    #[test]
    fn test_coalesce_collects_level_lines() {
        let table = CapacityTable::builtin();
        let soc = table.get("mi200").unwrap();
        let text = "pmc: SQ_WAVES\npmc: SQ_LEVEL_WAVES SQ_ACCUM_PREV_HIRES\n";

        let coalesced = coalesce([text], soc, None).unwrap();

        assert_eq!(coalesced.bucket.len(), 1);
        assert_eq!(coalesced.levels.len(), 1);
        assert_eq!(coalesced.levels[0].counter, "SQ_LEVEL_WAVES");
    }

    #[test]
    fn test_selection_error_keeps_prior_outputs() {
        let refs = tempfile::tempdir().unwrap();
        let out = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(refs.path().join("mi200")).unwrap();
        std::fs::write(refs.path().join("pmc_perf.txt"), "pmc: GRBM_COUNT\n").unwrap();
        let workload = out.path().join("app");
        std::fs::create_dir_all(workload.join("perfmon")).unwrap();
        std::fs::write(workload.join("pmc_perf_0.csv"), "prior").unwrap();

        let table = CapacityTable::builtin();
        let allow = vec!["sq".to_string()];
        let err = filter_workload(&FilterRequest {
            perfmon_dir: refs.path(),
            workload_dir: &workload,
            soc: table.get("mi200").unwrap(),
            ip_blocks: Some(&allow),
            split_passes: false,
        });

        assert!(err.is_err());
        assert_eq!(
            std::fs::read_to_string(workload.join("pmc_perf_0.csv")).unwrap(),
            "prior"
        );
    }

    #[test]
    fn test_missing_roofline_keeps_prior_plan() {
        let refs = tempfile::tempdir().unwrap();
        let out = tempfile::tempdir().unwrap();
        let perfmon_out = out.path().join("perfmon");
        std::fs::create_dir_all(&perfmon_out).unwrap();
        std::fs::write(perfmon_out.join("pmc_perf.txt"), "prior").unwrap();

        let table = CapacityTable::builtin();
        let soc = table.get("mi200").unwrap();

        assert!(roofline_workload(refs.path(), out.path(), soc, false).is_err());
        assert!(perfmon_out.join("pmc_perf.txt").exists());
    }
}
