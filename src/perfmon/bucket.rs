//! Counter classification into hardware-block buckets.
//!
//! A [`CounterBucket`] keeps one ordered, de-duplicated counter list per
//! [`HardwareBlock`], plus a separate per-channel map for TCC counters that
//! carry a `[<channel>]` suffix. Insertion order is first-seen order and is
//! preserved, because pass slot assignment is positional.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use once_cell::sync::Lazy;
use regex::Regex;
use thiserror::Error;
use tracing::debug;

use super::files;
use crate::soc::{HardwareBlock, SocCapacity, BLOCK_COUNT};

/// Counter that marks the preceding token on its line as a level counter.
pub const LEVEL_SENTINEL: &str = "SQ_ACCUM_PREV_HIRES";

/// TCC counters with a bracketed channel index, e.g. `TCC_HIT[3]`.
static CHANNEL_SUFFIX: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[\s\S]+\[(\d+)\]").expect("valid channel regex"));

/// Errors raised while classifying counters.
#[derive(Error, Debug)]
pub enum ClassifyError {
    #[error("counter {counter}: unknown hardware block {block}")]
    UnknownBlock { counter: String, block: String },

    #[error("counter {counter}: invalid channel index")]
    InvalidChannel { counter: String },

    #[error("level sentinel SQ_ACCUM_PREV_HIRES has no preceding counter in: {line}")]
    MissingLevelCounter { line: String },

    #[error("saving level counter files requires both the line text and an output directory")]
    MissingSaveContext,

    #[error("writing level counter file {}", path.display())]
    LevelFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Where a single counter lands in a bucket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Placement {
    /// Ordinary block, or aggregate TCC.
    Block(HardwareBlock),
    /// Per-channel TCC counter.
    Channel(u32),
}

/// Determine the bucket destination of a counter token.
pub fn classify_counter(counter: &str) -> Result<Placement, ClassifyError> {
    let prefix = counter.split('_').next().unwrap_or_default();
    let name = prefix.to_ascii_uppercase();
    let block = HardwareBlock::from_name(&name).ok_or_else(|| ClassifyError::UnknownBlock {
        counter: counter.to_string(),
        block: name.clone(),
    })?;

    if block != HardwareBlock::Tcc {
        return Ok(Placement::Block(block));
    }

    match CHANNEL_SUFFIX.captures(counter) {
        None => Ok(Placement::Block(HardwareBlock::Tcc)),
        Some(caps) => {
            let channel = caps
                .get(1)
                .and_then(|m| m.as_str().parse::<u32>().ok())
                .ok_or_else(|| ClassifyError::InvalidChannel {
                    counter: counter.to_string(),
                })?;
            Ok(Placement::Channel(channel))
        }
    }
}

/// Per-block ordered counter lists plus the per-channel TCC map.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CounterBucket {
    blocks: [Vec<String>; BLOCK_COUNT],
    channels: BTreeMap<u32, Vec<String>>,
}

impl CounterBucket {
    /// Empty bucket with channel entries `0..channel_count` pre-created.
    pub fn new(channel_count: usize) -> Self {
        let mut bucket = Self::default();
        for ch in 0..channel_count {
            bucket.channels.insert(ch as u32, Vec::new());
        }
        bucket
    }

    /// Counters of one block in first-seen order. For TCC this is the
    /// aggregate (non-channel) list.
    pub fn block(&self, block: HardwareBlock) -> &[String] {
        &self.blocks[block.index()]
    }

    /// Per-channel TCC counters, ordered by channel index.
    pub fn channels(&self) -> &BTreeMap<u32, Vec<String>> {
        &self.channels
    }

    /// Total number of counters across all blocks and channels.
    pub fn len(&self) -> usize {
        self.blocks.iter().map(Vec::len).sum::<usize>()
            + self.channels.values().map(Vec::len).sum::<usize>()
    }

    /// True when no block or channel holds a counter.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Insert a counter into its destination list. Duplicates are skipped.
    /// Returns true when the counter was newly added.
    pub fn insert(&mut self, counter: &str) -> Result<bool, ClassifyError> {
        let list = match classify_counter(counter)? {
            Placement::Block(block) => &mut self.blocks[block.index()],
            Placement::Channel(ch) => self.channels.entry(ch).or_default(),
        };

        if list.iter().any(|c| c == counter) {
            return Ok(false);
        }
        list.push(counter.to_string());
        Ok(true)
    }

    /// Sort every channel list lexically so position `i` means "the i-th
    /// counter" in every channel.
    pub fn sort_channels(&mut self) {
        for list in self.channels.values_mut() {
            list.sort();
        }
    }
}

/// Options for the internal, per-line classification mode.
#[derive(Debug, Clone, Default)]
pub struct LevelOptions {
    /// Write a dedicated definition file for each level line.
    pub save_file: bool,
    /// Comment-stripped text of the line being classified.
    pub line_text: Option<String>,
    /// Directory receiving level definition files.
    pub output_dir: Option<PathBuf>,
}

impl LevelOptions {
    /// Options that record level lines without touching the filesystem.
    pub fn in_memory(line_text: &str) -> Self {
        Self {
            save_file: false,
            line_text: Some(line_text.to_string()),
            output_dir: None,
        }
    }

    /// Options that persist level lines under `dir`.
    pub fn save_to(line_text: &str, dir: &Path) -> Self {
        Self {
            save_file: true,
            line_text: Some(line_text.to_string()),
            output_dir: Some(dir.to_path_buf()),
        }
    }

    fn validate(&self) -> Result<(), ClassifyError> {
        if self.save_file && (self.line_text.is_none() || self.output_dir.is_none()) {
            return Err(ClassifyError::MissingSaveContext);
        }
        Ok(())
    }
}

/// A level counter line that must be sampled in a pass of its own.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LevelPass {
    /// Counter preceding the sentinel; names the definition file.
    pub counter: String,
    /// Full directive line, emitted unchanged.
    pub line: String,
}

/// Result of classifying one definition line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LineOutcome {
    /// Counters were merged into the bucket; `added` excludes duplicates.
    Bucketed { added: usize },
    /// The line was diverted to a dedicated level pass.
    Level(LevelPass),
}

/// Classifies counters for one SoC.
#[derive(Debug, Clone, Copy)]
pub struct Classifier<'a> {
    soc: &'a SocCapacity,
}

impl<'a> Classifier<'a> {
    pub fn new(soc: &'a SocCapacity) -> Self {
        Self { soc }
    }

    /// Fresh bucket sized for this SoC's channels.
    pub fn empty_bucket(&self) -> CounterBucket {
        CounterBucket::new(self.soc.tcc_channels())
    }

    /// One-shot classification of an arbitrary counter list.
    ///
    /// Level sentinels are not interpreted here. Channel lists are sorted
    /// before returning.
    pub fn bucket_counters<S: AsRef<str>>(
        &self,
        counters: &[S],
    ) -> Result<CounterBucket, ClassifyError> {
        let mut bucket = self.empty_bucket();
        for counter in counters {
            bucket.insert(counter.as_ref())?;
        }
        bucket.sort_channels();
        Ok(bucket)
    }

    /// Classify one definition line into an existing bucket.
    ///
    /// A line containing [`LEVEL_SENTINEL`] is excluded from bucketing
    /// entirely and becomes a [`LevelPass`], written to
    /// `<output_dir>/<counter>.txt` when `opts.save_file` is set. Channel
    /// lists are not sorted here; the caller sorts once all lines are in.
    pub fn add_line(
        &self,
        bucket: &mut CounterBucket,
        counters: &[String],
        opts: &LevelOptions,
    ) -> Result<LineOutcome, ClassifyError> {
        opts.validate()?;

        if let Some(idx) = counters.iter().position(|c| c == LEVEL_SENTINEL) {
            let line = opts
                .line_text
                .clone()
                .unwrap_or_else(|| super::line::render_pmc(counters));
            let counter = idx
                .checked_sub(1)
                .and_then(|i| counters.get(i))
                .ok_or_else(|| ClassifyError::MissingLevelCounter { line: line.clone() })?
                .clone();

            let level = LevelPass { counter, line };
            if let (true, Some(dir)) = (opts.save_file, opts.output_dir.as_deref()) {
                files::write_level_definition(dir, &level).map_err(|source| {
                    ClassifyError::LevelFile {
                        path: files::level_definition_path(dir, &level.counter),
                        source,
                    }
                })?;
            }
            debug!(counter = %level.counter, "diverted level counter line");
            return Ok(LineOutcome::Level(level));
        }

        let mut added = 0;
        for counter in counters {
            if bucket.insert(counter)? {
                added += 1;
            }
        }
        Ok(LineOutcome::Bucketed { added })
    }
}
