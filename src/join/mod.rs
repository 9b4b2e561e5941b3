//! Pass output joining.
//!
//! Each profiling pass produces one result table with a row per kernel
//! dispatch. Rows are matched across passes by a synthetic key built from
//! the kernel name (and optionally the grid size) plus the dispatch's
//! occurrence ordinal within its pass, then merged into a single table.
//!
//! The merge is an inner join: a pass that captured fewer dispatches
//! truncates the unified result.

pub mod table;

use std::collections::HashMap;
use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use once_cell::sync::Lazy;
use regex::Regex;
use thiserror::Error;
use tracing::{debug, info, warn};

use table::{Table, TableError};

/// Per-pass result files: `pmc_perf_<n>.csv`.
static PASS_OUTPUT: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^pmc_perf_(\d+)\.csv$").expect("valid pass output regex"));

/// Unified output file written into the workload directory.
pub const UNIFIED_FILE: &str = "pmc_perf.csv";

/// Synthetic join key column.
pub const KEY_COLUMN: &str = "key";

/// Kernel-name column candidates, in resolution order.
pub const NAME_COLUMNS: [&str; 3] = ["Kernel_Name", "KernelName", "Name"];

/// Grid-size column.
pub const GRID_COLUMN: &str = "GRD";

/// Dispatch-invariant field groups checked in every join.
const INVARIANT_GROUPS: [&str; 6] = ["GPU_ID", "GRD", "WGR", "LDS", "SCR", "SGPR"];

/// Register-count field used by older profilers. When absent the
/// `Arch_VGPR`/`ACCUM_VGPR` pair is checked instead.
const LEGACY_VGPR: &str = "vgpr";
const SPLIT_VGPR: [&str; 2] = ["Arch_VGPR", "ACCUM_VGPR"];

/// Per-instance fields; every copy is dropped.
const DROP_ALL: [&str; 6] = ["Queue_ID", "Queue_Index", "PID", "TID", "SIG", "OBJ"];

/// Fields whose first copy is kept and pass copies dropped.
const DROP_SUFFIXED: [&str; 2] = ["Dispatch_ID", "dispatch"];

/// Timestamp columns that carry no duration information.
const DROP_TIMESTAMPS: [&str; 3] = ["DispatchNs", "CompleteNs", "HostDuration"];

const START_TIMESTAMP: &str = "Start_Timestamp";
const END_TIMESTAMP: &str = "End_Timestamp";

/// Averaged timestamp columns appended to the unified table.
pub const BEGIN_COLUMN: &str = "BeginNs";
pub const END_COLUMN: &str = "EndNs";

/// How dispatches are matched across passes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum JoinMode {
    /// Kernel name plus occurrence ordinal.
    #[default]
    Kernel,
    /// Kernel name, grid size, plus occurrence ordinal.
    Grid,
}

impl JoinMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Kernel => "kernel",
            Self::Grid => "grid",
        }
    }
}

impl FromStr for JoinMode {
    type Err = JoinError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "kernel" => Ok(Self::Kernel),
            "grid" => Ok(Self::Grid),
            _ => Err(JoinError::UnsupportedMode {
                mode: s.to_string(),
            }),
        }
    }
}

impl fmt::Display for JoinMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Join failures.
#[derive(Error, Debug)]
pub enum JoinError {
    #[error("unsupported join mode {mode:?}, expected \"kernel\" or \"grid\"")]
    UnsupportedMode { mode: String },

    #[error("no pass tables to join")]
    NoInputs,

    #[error("pass {pass}: missing column {column}")]
    MissingColumn { pass: usize, column: String },

    #[error("row {row}: kernel name {found:?} in {column} differs from {expected:?}, join key collision")]
    KernelNameMismatch {
        column: String,
        row: usize,
        expected: String,
        found: String,
    },

    #[error("row {row}: non-numeric timestamp {value:?} in {column}")]
    NonNumeric {
        column: String,
        row: usize,
        value: String,
    },

    #[error("reading directory {}", path.display())]
    ReadDir {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("removing consumed input {}", path.display())]
    RemoveInput {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error(transparent)]
    Table(#[from] TableError),
}

/// Non-fatal findings recorded while joining.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JoinWarning {
    /// Copies of a dispatch-invariant field disagree; the first was kept.
    FieldMismatch { field: String },
    /// No source columns for an averaged timestamp; the column is omitted.
    MissingTimestamps { column: &'static str },
}

impl fmt::Display for JoinWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::FieldMismatch { field } => {
                write!(f, "differing {field} values across passes")
            }
            Self::MissingTimestamps { column } => {
                write!(f, "no timestamp columns for {column}")
            }
        }
    }
}

/// Unified table plus the warnings raised while producing it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JoinReport {
    pub table: Table,
    pub warnings: Vec<JoinWarning>,
}

impl JoinReport {
    pub fn has_warnings(&self) -> bool {
        !self.warnings.is_empty()
    }
}

/// `column` is `base` itself or a pass copy `base_<n>`.
fn is_copy_of(column: &str, base: &str) -> bool {
    column == base || is_suffixed_copy(column, base)
}

/// `column` is a pass copy `base_<n>`.
fn is_suffixed_copy(column: &str, base: &str) -> bool {
    column
        .strip_prefix(base)
        .and_then(|rest| rest.strip_prefix('_'))
        .is_some_and(|digits| !digits.is_empty() && digits.bytes().all(|b| b.is_ascii_digit()))
}

/// Indices of every copy of `base`, in column order.
fn copies_of(table: &Table, base: &str) -> Vec<usize> {
    table
        .headers()
        .iter()
        .enumerate()
        .filter(|(_, h)| is_copy_of(h, base))
        .map(|(i, _)| i)
        .collect()
}

fn name_column(table: &Table) -> Option<usize> {
    NAME_COLUMNS.iter().find_map(|c| table.column_index(c))
}

/// Append the join key column to a pass table.
///
/// The ordinal counts dispatches of the same kernel (or kernel and grid
/// size) in row order, so row order within a pass is significant.
pub fn with_key(mut table: Table, pass: usize, mode: JoinMode) -> Result<Table, JoinError> {
    let name_idx = name_column(&table).ok_or_else(|| JoinError::MissingColumn {
        pass,
        column: NAME_COLUMNS[0].to_string(),
    })?;
    let grid_idx = match mode {
        JoinMode::Kernel => None,
        JoinMode::Grid => Some(table.column_index(GRID_COLUMN).ok_or_else(|| {
            JoinError::MissingColumn {
                pass,
                column: GRID_COLUMN.to_string(),
            }
        })?),
    };

    let mut seen: HashMap<String, usize> = HashMap::new();
    let keys: Vec<String> = table
        .rows()
        .iter()
        .map(|row| {
            let group = match grid_idx {
                Some(g) => format!("{} - {}", row[name_idx], row[g]),
                None => row[name_idx].clone(),
            };
            let ordinal = seen.entry(group.clone()).or_default();
            let key = format!("{group} - {ordinal}");
            *ordinal += 1;
            key
        })
        .collect();

    table.push_column(KEY_COLUMN, keys)?;
    Ok(table)
}

/// Inner-join `right` onto `left` by key. Colliding right-hand columns get
/// a `_<pass>` suffix; left row order is preserved.
fn merge_inner(left: &Table, right: &Table, pass: usize) -> Result<Table, JoinError> {
    let missing_key = |pass| JoinError::MissingColumn {
        pass,
        column: KEY_COLUMN.to_string(),
    };
    let lkey = left.column_index(KEY_COLUMN).ok_or_else(|| missing_key(0))?;
    let rkey = right.column_index(KEY_COLUMN).ok_or_else(|| missing_key(pass))?;

    let right_cols: Vec<usize> = (0..right.headers().len()).filter(|c| *c != rkey).collect();

    let mut headers = left.headers().to_vec();
    for &c in &right_cols {
        let name = &right.headers()[c];
        if left.has_column(name) {
            headers.push(format!("{name}_{pass}"));
        } else {
            headers.push(name.clone());
        }
    }

    let mut index: HashMap<&str, Vec<usize>> = HashMap::new();
    for (r, row) in right.rows().iter().enumerate() {
        index.entry(row[rkey].as_str()).or_default().push(r);
    }

    let mut rows = Vec::with_capacity(left.len());
    for lrow in left.rows() {
        let Some(matches) = index.get(lrow[lkey].as_str()) else {
            continue;
        };
        for &r in matches {
            let rrow = &right.rows()[r];
            let mut row = lrow.clone();
            row.extend(right_cols.iter().map(|&c| rrow[c].clone()));
            rows.push(row);
        }
    }

    Ok(Table::new(headers, rows)?)
}

fn columns_agree(table: &Table, columns: &[usize]) -> bool {
    let Some((&first, rest)) = columns.split_first() else {
        return true;
    };
    table
        .rows()
        .iter()
        .all(|row| rest.iter().all(|&c| row[c] == row[first]))
}

fn column_names(table: &Table, columns: &[usize]) -> Vec<String> {
    columns
        .iter()
        .map(|&c| table.headers()[c].clone())
        .collect()
}

/// Row-wise mean over `columns`. Integer cells are summed exactly so that
/// nanosecond timestamps survive when the mean is whole.
fn row_means(table: &Table, columns: &[usize]) -> Result<Vec<String>, JoinError> {
    let n = columns.len();
    let mut means = Vec::with_capacity(table.len());

    for (r, row) in table.rows().iter().enumerate() {
        let mut exact: Option<i128> = Some(0);
        let mut sum = 0f64;
        for &c in columns {
            let cell = row[c].trim();
            if let Ok(v) = cell.parse::<i64>() {
                exact = exact.map(|s| s + i128::from(v));
                sum += v as f64;
                continue;
            }
            let v: f64 = cell.parse().map_err(|_| JoinError::NonNumeric {
                column: table.headers()[c].clone(),
                row: r,
                value: row[c].clone(),
            })?;
            exact = None;
            sum += v;
        }

        let mean = match exact {
            Some(total) if total % n as i128 == 0 => (total / n as i128).to_string(),
            Some(total) => (total as f64 / n as f64).to_string(),
            None => (sum / n as f64).to_string(),
        };
        means.push(mean);
    }

    Ok(means)
}

/// Collapse pass copies and derive the unified columns.
fn reconcile(mut table: Table) -> Result<JoinReport, JoinError> {
    let mut warnings = Vec::new();

    // Dispatch-invariant groups: verify, then keep the first copy.
    let mut groups: Vec<&str> = INVARIANT_GROUPS.to_vec();
    if table.has_column(LEGACY_VGPR) {
        groups.push(LEGACY_VGPR);
    } else {
        groups.extend(SPLIT_VGPR);
    }
    for group in groups {
        let copies = copies_of(&table, group);
        if copies.is_empty() {
            debug!(field = group, "field group absent");
            continue;
        }
        if columns_agree(&table, &copies) {
            info!(field = group, "successfully joined");
        } else {
            warn!(field = group, "differing values across passes, keeping first");
            warnings.push(JoinWarning::FieldMismatch {
                field: group.to_string(),
            });
        }
        let extra = column_names(&table, &copies[1..]);
        table.drop_columns(&extra);
    }

    table.retain_columns(|h| {
        !DROP_ALL.iter().any(|b| is_copy_of(h, b))
            && !DROP_SUFFIXED.iter().any(|b| is_suffixed_copy(h, b))
            && !DROP_TIMESTAMPS.iter().any(|t| h.contains(t))
    });

    // Averaged timestamps. Both means are computed before any column moves.
    let mut averaged = Vec::new();
    for (pattern, column) in [(START_TIMESTAMP, BEGIN_COLUMN), (END_TIMESTAMP, END_COLUMN)] {
        let sources: Vec<usize> = table
            .headers()
            .iter()
            .enumerate()
            .filter(|(_, h)| h.contains(pattern))
            .map(|(i, _)| i)
            .collect();
        if sources.is_empty() {
            warn!(column, "no timestamp columns, omitting");
            warnings.push(JoinWarning::MissingTimestamps { column });
            continue;
        }
        let values = row_means(&table, &sources)?;
        averaged.push((column, column_names(&table, &sources), values));
    }
    for (_, sources, _) in &averaged {
        table.drop_columns(sources);
    }
    for (column, _, values) in averaged {
        table.push_column(column, values)?;
    }

    // Kernel names must agree under a shared key.
    let name_idx = name_column(&table).ok_or_else(|| JoinError::MissingColumn {
        pass: 0,
        column: NAME_COLUMNS[0].to_string(),
    })?;
    let base = table.headers()[name_idx].clone();
    let copies = copies_of(&table, &base);
    for &c in copies.iter().skip(1) {
        for (r, row) in table.rows().iter().enumerate() {
            if row[c] != row[name_idx] {
                return Err(JoinError::KernelNameMismatch {
                    column: table.headers()[c].clone(),
                    row: r,
                    expected: row[name_idx].clone(),
                    found: row[c].clone(),
                });
            }
        }
    }
    let extra = column_names(&table, &copies[1..]);
    table.drop_columns(&extra);

    table.drop_columns(&[KEY_COLUMN.to_string()]);

    Ok(JoinReport { table, warnings })
}

/// Join pass tables that already carry a [`KEY_COLUMN`].
pub fn join_keyed(tables: Vec<Table>) -> Result<JoinReport, JoinError> {
    let mut passes = tables.into_iter().enumerate();
    let Some((_, mut merged)) = passes.next() else {
        return Err(JoinError::NoInputs);
    };
    if !merged.has_column(KEY_COLUMN) {
        return Err(JoinError::MissingColumn {
            pass: 0,
            column: KEY_COLUMN.to_string(),
        });
    }

    for (pass, table) in passes {
        merged = merge_inner(&merged, &table, pass)?;
    }
    debug!(
        rows = merged.len(),
        columns = merged.headers().len(),
        "merged passes"
    );

    reconcile(merged)
}

/// Join in-memory pass tables, in pass order.
pub fn join_tables(tables: Vec<Table>, mode: JoinMode) -> Result<JoinReport, JoinError> {
    let keyed = tables
        .into_iter()
        .enumerate()
        .map(|(pass, table)| with_key(table, pass, mode))
        .collect::<Result<Vec<_>, _>>()?;
    join_keyed(keyed)
}

/// Per-pass result files in `dir`, ordered by pass number.
pub fn pass_output_files(dir: &Path) -> Result<Vec<PathBuf>, JoinError> {
    let read_err = |source| JoinError::ReadDir {
        path: dir.to_path_buf(),
        source,
    };

    let mut numbered = Vec::new();
    for entry in fs::read_dir(dir).map_err(read_err)? {
        let entry = entry.map_err(read_err)?;
        let file_name = entry.file_name();
        let name = file_name.to_string_lossy();
        let Some(caps) = PASS_OUTPUT.captures(&name) else {
            continue;
        };
        let Ok(index) = caps[1].parse::<u64>() else {
            continue;
        };
        numbered.push((index, entry.path()));
    }
    numbered.sort();

    Ok(numbered.into_iter().map(|(_, path)| path).collect())
}

/// What a directory join consumed and produced.
#[derive(Debug, Clone)]
pub struct JoinOutcome {
    pub report: JoinReport,
    pub output: PathBuf,
    /// Pass files that fed the join.
    pub inputs: Vec<PathBuf>,
    /// Pass files skipped as empty or unparseable.
    pub skipped: Vec<PathBuf>,
}

/// Join the per-pass result files of a workload directory into
/// [`UNIFIED_FILE`].
///
/// The output is durably written before any input is removed. Inputs are
/// kept when `keep_inputs` is set.
pub fn join_workload(dir: &Path, mode: JoinMode, keep_inputs: bool) -> Result<JoinOutcome, JoinError> {
    let mut tables = Vec::new();
    let mut inputs = Vec::new();
    let mut skipped = Vec::new();

    for path in pass_output_files(dir)? {
        match Table::read_csv(&path, true) {
            Ok(table) => {
                debug!(path = %path.display(), rows = table.len(), "loaded pass output");
                tables.push(table);
                inputs.push(path);
            }
            Err(e) => {
                warn!(path = %path.display(), error = %e, "skipping pass output");
                skipped.push(path);
            }
        }
    }

    let report = join_tables(tables, mode)?;

    let output = dir.join(UNIFIED_FILE);
    report.table.write_csv(&output)?;
    info!(
        passes = inputs.len(),
        rows = report.table.len(),
        warnings = report.warnings.len(),
        path = %output.display(),
        "wrote unified pass output",
    );

    if !keep_inputs {
        for path in &inputs {
            fs::remove_file(path).map_err(|source| JoinError::RemoveInput {
                path: path.clone(),
                source,
            })?;
        }
    }

    Ok(JoinOutcome {
        report,
        output,
        inputs,
        skipped,
    })
}
