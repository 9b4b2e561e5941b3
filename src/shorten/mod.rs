//! Kernel symbol shortening.
//!
//! Mangled kernel names in result tables are demangled and truncated to a
//! template/argument nesting depth so that reports stay readable. Each
//! unique raw name is demangled once per [`NameCache`].

use std::collections::HashMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::process::Command;

use once_cell::sync::Lazy;
use regex::Regex;
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::join::table::{Table, TableError};

/// Levels at or above this leave names untouched.
pub const MAX_SHORTEN_LEVEL: u32 = 5;

/// Shallowest level that still keeps the kernel's own name.
pub const MIN_SHORTEN_LEVEL: u32 = 1;

/// Demangler shipped with ROCm.
pub const DEFAULT_CXXFILT: &str = "/opt/rocm/llvm/bin/llvm-cxxfilt";

/// Name columns, in preference order.
pub const NAME_COLUMNS: [&str; 2] = ["Name", "KernelName"];

/// A name fragment, its trailing punctuation, and an optional scope
/// separator.
static SYMBOL_TOKEN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?P<name>[( )A-Za-z0-9_]+)(?P<punct>[ ,*<>()]+)(?P<scope>::)?")
        .expect("valid symbol token regex")
});

/// Compiler artifact marker, e.g. `[clone .kd]`.
const CLONE_MARKER: &str = "clone";

#[derive(Error, Debug)]
pub enum ShortenError {
    #[error("shortening level {level} is below {}", MIN_SHORTEN_LEVEL)]
    InvalidLevel { level: u32 },

    #[error("demangler not found at {}", path.display())]
    MissingDemangler { path: PathBuf },

    #[error("running demangler {}", path.display())]
    Spawn {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("demangler exited with {status} for {symbol:?}: {stderr}")]
    DemanglerFailed {
        symbol: String,
        status: String,
        stderr: String,
    },

    #[error("reading directory {}", path.display())]
    ReadDir {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error(transparent)]
    Table(#[from] TableError),
}

/// Turns a raw (mangled) symbol into a readable signature.
pub trait Demangler {
    fn demangle(&self, symbol: &str) -> Result<String, ShortenError>;
}

/// `llvm-cxxfilt`, run once per symbol.
#[derive(Debug, Clone)]
pub struct LlvmCxxFilt {
    path: PathBuf,
}

impl LlvmCxxFilt {
    /// Fails if `path` is not an existing file.
    pub fn new(path: impl Into<PathBuf>) -> Result<Self, ShortenError> {
        let path = path.into();
        if !path.is_file() {
            return Err(ShortenError::MissingDemangler { path });
        }
        Ok(Self { path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Demangler for LlvmCxxFilt {
    fn demangle(&self, symbol: &str) -> Result<String, ShortenError> {
        let output = Command::new(&self.path)
            .arg(symbol)
            .output()
            .map_err(|source| ShortenError::Spawn {
                path: self.path.clone(),
                source,
            })?;

        if !output.status.success() {
            return Err(ShortenError::DemanglerFailed {
                symbol: symbol.to_string(),
                status: output.status.to_string(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }
}

/// Raw name to shortened name, scoped to one batch of files.
#[derive(Debug, Clone, Default)]
pub struct NameCache {
    names: HashMap<String, String>,
}

impl NameCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, raw: &str) -> Option<&str> {
        self.names.get(raw).map(String::as_str)
    }

    pub fn insert(&mut self, raw: String, short: String) {
        self.names.insert(raw, short);
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }
}

/// Truncate a demangled signature to `level` nesting levels.
///
/// Names the token grammar does not match (already-simple names) and any
/// level at or above [`MAX_SHORTEN_LEVEL`] return `demangled` unchanged.
pub fn shorten_symbol(demangled: &str, level: u32) -> String {
    if level >= MAX_SHORTEN_LEVEL || !SYMBOL_TOKEN.is_match(demangled) {
        return demangled.to_string();
    }

    let level = i64::from(level);
    let mut depth: i64 = 0;
    let mut out = String::with_capacity(demangled.len());

    for caps in SYMBOL_TOKEN.captures_iter(demangled) {
        let name = &caps["name"];
        let punct = &caps["punct"];
        if name == CLONE_MARKER || caps.name("scope").is_some() {
            continue;
        }

        if depth < level {
            out.push_str(name);
        }

        if !punct.contains('>') {
            // An opening bracket at the boundary would be left unmatched.
            let opens = punct.matches('<').count() as i64;
            if depth < level && !(depth == level - 1 && opens > 0) {
                out.push_str(punct);
            }
            depth += opens;
            continue;
        }

        for (i, ch) in punct.char_indices() {
            if depth < level {
                let rest = &punct[i..];
                out.push_str(rest);
                depth -= rest.matches('>').count() as i64;
                break;
            }
            if ch == '>' {
                depth -= 1;
            }
        }
    }

    let trimmed = out.trim_end();
    if trimmed.is_empty() {
        demangled.to_string()
    } else {
        trimmed.to_string()
    }
}

/// Shorten each raw name, consulting and filling `cache`.
pub fn shorten_names<'a, D>(
    names: impl IntoIterator<Item = &'a str>,
    level: u32,
    demangler: &D,
    cache: &mut NameCache,
) -> Result<Vec<String>, ShortenError>
where
    D: Demangler + ?Sized,
{
    let mut shortened = Vec::new();
    for raw in names {
        if let Some(short) = cache.get(raw) {
            shortened.push(short.to_string());
            continue;
        }
        let demangled = demangler.demangle(raw)?;
        let short = shorten_symbol(&demangled, level);
        cache.insert(raw.to_string(), short.clone());
        shortened.push(short);
    }
    Ok(shortened)
}

/// Index of the kernel-name column, if any.
pub fn name_column(table: &Table) -> Option<usize> {
    NAME_COLUMNS.iter().find_map(|c| table.column_index(c))
}

/// Replace the name column of `table` in place. Returns `false` when the
/// table has no name column.
pub fn shorten_table<D>(
    table: &mut Table,
    level: u32,
    demangler: &D,
    cache: &mut NameCache,
) -> Result<bool, ShortenError>
where
    D: Demangler + ?Sized,
{
    let Some(idx) = name_column(table) else {
        return Ok(false);
    };
    let shortened = shorten_names(table.column_values(idx), level, demangler, cache)?;
    table.set_column(idx, shortened)?;
    Ok(true)
}

/// Per-file results of a directory pass.
#[derive(Debug, Default)]
pub struct ShortenSummary {
    pub rewritten: Vec<PathBuf>,
    /// Empty, unparseable, or without a name column.
    pub skipped: Vec<PathBuf>,
    pub failed: Vec<(PathBuf, ShortenError)>,
}

impl ShortenSummary {
    pub fn is_success(&self) -> bool {
        self.failed.is_empty()
    }
}

fn csv_files(dir: &Path) -> Result<Vec<PathBuf>, ShortenError> {
    let read_err = |source| ShortenError::ReadDir {
        path: dir.to_path_buf(),
        source,
    };

    let mut files = Vec::new();
    for entry in fs::read_dir(dir).map_err(read_err)? {
        let path = entry.map_err(read_err)?.path();
        if path.is_file() && path.extension().is_some_and(|ext| ext == "csv") {
            files.push(path);
        }
    }
    files.sort();
    Ok(files)
}

/// Rewrite the name column of every `*.csv` in `dir`.
///
/// A file that cannot be read is skipped; a demangler or write failure
/// fails that file only.
pub fn shorten_workload<D>(
    dir: &Path,
    level: u32,
    demangler: &D,
    cache: &mut NameCache,
) -> Result<ShortenSummary, ShortenError>
where
    D: Demangler + ?Sized,
{
    if level < MIN_SHORTEN_LEVEL {
        return Err(ShortenError::InvalidLevel { level });
    }
    let mut summary = ShortenSummary::default();
    if level >= MAX_SHORTEN_LEVEL {
        info!(level, "shortening disabled at this level");
        return Ok(summary);
    }

    for path in csv_files(dir)? {
        let mut table = match Table::read_csv(&path, false) {
            Ok(table) => table,
            Err(e) => {
                info!(path = %path.display(), error = %e, "skipping csv");
                summary.skipped.push(path);
                continue;
            }
        };

        match shorten_table(&mut table, level, demangler, cache) {
            Ok(true) => {
                if let Err(e) = table.write_csv(&path) {
                    error!(path = %path.display(), error = %e, "writing shortened names failed");
                    summary.failed.push((path, e.into()));
                    continue;
                }
                debug!(path = %path.display(), "shortened kernel names");
                summary.rewritten.push(path);
            }
            Ok(false) => {
                debug!(path = %path.display(), "no kernel name column");
                summary.skipped.push(path);
            }
            Err(e) => {
                error!(path = %path.display(), error = %e, "shortening failed");
                summary.failed.push((path, e));
            }
        }
    }

    if summary.is_success() {
        info!(
            rewritten = summary.rewritten.len(),
            skipped = summary.skipped.len(),
            cached = cache.len(),
            "kernel name shortening complete",
        );
    } else {
        warn!(failed = summary.failed.len(), "kernel name shortening incomplete");
    }

    Ok(summary)
}
