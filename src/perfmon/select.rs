//! Reference counter-definition discovery and block filtering.
//!
//! Reference files live in a perfmon directory, named
//! `pmc_<block>_perf*.txt`. SoC-agnostic files sit at the top level and
//! SoC-specific ones in a `<soc>/` subdirectory.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use once_cell::sync::Lazy;
use regex::Regex;
use thiserror::Error;
use tracing::info;

/// SoC-agnostic reference files: `pmc_*perf*.txt`.
static TOP_LEVEL_FILE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^pmc_.*perf.*\.txt$").expect("valid top-level regex"));

/// SoC-specific reference files: `pmc_*_perf*.txt`.
static SOC_FILE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^pmc_.*_perf.*\.txt$").expect("valid soc regex"));

/// Block name embedded in a reference file stem.
static BLOCK_NAME: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^pmc_([a-zA-Z0-9_]+)_perf").expect("valid block regex"));

/// Roofline counter definitions, relative to the perfmon directory.
pub const ROOFLINE_FILE: &str = "roofline/pmc_roof_perf.txt";

/// Subdirectory of a workload that receives definition files.
pub const PERFMON_SUBDIR: &str = "perfmon";

/// Source selection failures. All are configuration errors.
#[derive(Error, Debug)]
pub enum SelectError {
    #[error("cannot determine hardware block from file name {}", path.display())]
    MalformedFileName { path: PathBuf },

    #[error("reading directory {}", path.display())]
    ReadDir {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("preparing output directory {}", path.display())]
    Prepare {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("roofline definitions not found at {}", path.display())]
    MissingRoofline { path: PathBuf },
}

/// Outcome of filtering the reference files.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Selection {
    /// Files that feed the classifier, in discovery order.
    pub included: Vec<PathBuf>,
    /// Candidates rejected by the block allowlist.
    pub excluded: Vec<PathBuf>,
}

/// List files in `dir` whose names match `pattern`, sorted by name.
/// A missing directory yields no files.
fn matching_files(dir: &Path, pattern: &Regex) -> Result<Vec<PathBuf>, SelectError> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(source) => {
            return Err(SelectError::ReadDir {
                path: dir.to_path_buf(),
                source,
            })
        }
    };

    let mut files = Vec::new();
    for entry in entries {
        let entry = entry.map_err(|source| SelectError::ReadDir {
            path: dir.to_path_buf(),
            source,
        })?;
        let path = entry.path();
        if !path.is_file() {
            continue;
        }
        let name = entry.file_name();
        if pattern.is_match(&name.to_string_lossy()) {
            files.push(path);
        }
    }
    files.sort();

    Ok(files)
}

/// All reference files for `soc`: top-level files first, then SoC-specific.
pub fn candidate_files(perfmon_dir: &Path, soc: &str) -> Result<Vec<PathBuf>, SelectError> {
    let mut files = matching_files(perfmon_dir, &TOP_LEVEL_FILE)?;
    files.extend(matching_files(&perfmon_dir.join(soc), &SOC_FILE)?);
    Ok(files)
}

/// Extract the lower-cased block name from a reference file path.
pub fn block_name(path: &Path) -> Result<String, SelectError> {
    let stem = path
        .file_stem()
        .map(|s| s.to_string_lossy())
        .unwrap_or_default();

    BLOCK_NAME
        .captures(&stem)
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str().to_ascii_lowercase())
        .ok_or_else(|| SelectError::MalformedFileName {
            path: path.to_path_buf(),
        })
}

/// Select the reference files feeding the classifier.
///
/// Without an allowlist every candidate is included. With one, a file is
/// included iff its embedded block name appears in the list
/// (case-insensitive).
pub fn select_sources(
    perfmon_dir: &Path,
    soc: &str,
    allowlist: Option<&[String]>,
) -> Result<Selection, SelectError> {
    let candidates = candidate_files(perfmon_dir, soc)?;

    let Some(allowlist) = allowlist else {
        return Ok(Selection {
            included: candidates,
            excluded: Vec::new(),
        });
    };

    let allowed: Vec<String> = allowlist.iter().map(|b| b.to_ascii_lowercase()).collect();
    let mut selection = Selection::default();

    for path in candidates {
        let block = block_name(&path)?;
        let stem = path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default();
        if allowed.contains(&block) {
            info!(file = %stem, block = %block, "added");
            selection.included.push(path);
        } else {
            info!(file = %stem, block = %block, "skipped");
            selection.excluded.push(path);
        }
    }

    Ok(selection)
}

/// Roofline counter definitions under `perfmon_dir`.
pub fn roofline_sources(perfmon_dir: &Path) -> Result<Vec<PathBuf>, SelectError> {
    let path = perfmon_dir.join(ROOFLINE_FILE);
    if !path.is_file() {
        return Err(SelectError::MissingRoofline { path });
    }
    Ok(vec![path])
}

fn recreate(path: &Path) -> Result<(), SelectError> {
    let prepare_err = |source| SelectError::Prepare {
        path: path.to_path_buf(),
        source,
    };
    if path.exists() {
        fs::remove_dir_all(path).map_err(prepare_err)?;
    }
    fs::create_dir_all(path).map_err(prepare_err)
}

/// Recreate `workload_dir` from scratch and return its perfmon directory.
///
/// Any existing content of the workload directory is removed.
pub fn prepare_workload_dir(workload_dir: &Path) -> Result<PathBuf, SelectError> {
    recreate(workload_dir)?;
    let perfmon = workload_dir.join(PERFMON_SUBDIR);
    recreate(&perfmon)?;
    Ok(perfmon)
}

/// Recreate only the perfmon subdirectory, keeping other workload content.
pub fn prepare_perfmon_dir(workload_dir: &Path) -> Result<PathBuf, SelectError> {
    let perfmon = workload_dir.join(PERFMON_SUBDIR);
    recreate(&perfmon)?;
    Ok(perfmon)
}
