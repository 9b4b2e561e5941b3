//! Definition file emission under `<workload>/perfmon/`.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tracing::{debug, info};

use super::bucket::LevelPass;
use super::line::{parse_lines, render_definition, render_pmc, TRAILER};
use super::plan::PlanResult;

/// Combined plan file, one `pmc:` line per pass.
pub const PLAN_FILE: &str = "pmc_perf.txt";

/// Timestamp-only pass definition.
pub const TIMESTAMPS_FILE: &str = "timestamps.txt";

/// Per-pass definition file name for pass `index`.
pub fn pass_file_name(index: usize) -> String {
    format!("pmc_perf_{index}.txt")
}

/// Path of the dedicated definition file for a level counter.
pub fn level_definition_path(dir: &Path, counter: &str) -> PathBuf {
    dir.join(format!("{counter}.txt"))
}

/// Write `<dir>/<counter>.txt` holding the level line and trailer.
pub fn write_level_definition(dir: &Path, level: &LevelPass) -> io::Result<()> {
    let path = level_definition_path(dir, &level.counter);
    fs::write(&path, render_definition(std::slice::from_ref(&level.line)))
}

/// Write the timestamp-only pass definition.
pub fn write_timestamps(dir: &Path) -> Result<PathBuf> {
    let path = dir.join(TIMESTAMPS_FILE);
    fs::write(&path, render_definition(&[render_pmc(&[])]))
        .with_context(|| format!("writing {}", path.display()))?;
    Ok(path)
}

/// Render the combined plan file body.
pub fn render_plan(plan: &PlanResult) -> String {
    let mut out = String::new();
    for pass in &plan.passes {
        out.push_str(&render_pmc(&pass.counters));
        out.push('\n');
    }
    out.push('\n');
    out.push_str(TRAILER);
    out
}

/// Write the combined plan file, passes in execution order.
pub fn write_plan(dir: &Path, plan: &PlanResult) -> Result<PathBuf> {
    let path = dir.join(PLAN_FILE);
    fs::write(&path, render_plan(plan)).with_context(|| format!("writing {}", path.display()))?;
    info!(passes = plan.len(), path = %path.display(), "wrote pass plan");
    Ok(path)
}

/// Split the combined plan file into one definition file per `pmc:` line
/// (`pmc_perf_0.txt`, `pmc_perf_1.txt`, ...) and remove the combined file.
///
/// Returns the per-pass paths in pass order.
pub fn split_plan(dir: &Path) -> Result<Vec<PathBuf>> {
    let plan_path = dir.join(PLAN_FILE);
    let content = fs::read_to_string(&plan_path)
        .with_context(|| format!("reading {}", plan_path.display()))?;

    let mut written = Vec::new();
    for (i, line) in parse_lines(&content).into_iter().enumerate() {
        let path = dir.join(pass_file_name(i));
        fs::write(&path, render_definition(&[line.text]))
            .with_context(|| format!("writing {}", path.display()))?;
        debug!(pass = i, path = %path.display(), "wrote pass definition");
        written.push(path);
    }

    fs::remove_file(&plan_path).with_context(|| format!("removing {}", plan_path.display()))?;

    Ok(written)
}
