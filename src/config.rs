use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use serde::Deserialize;

use crate::join::JoinMode;
use crate::shorten::{DEFAULT_CXXFILT, MAX_SHORTEN_LEVEL, MIN_SHORTEN_LEVEL};
use crate::soc::{self, CapacityTable, HardwareBlock, SocCapacity, BLOCK_COUNT};

/// Top-level configuration for pmc-batch.
#[derive(Debug, Deserialize)]
pub struct Config {
    /// Logging verbosity (debug, info, warn, error). Default: "info".
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Target SoC identifier (e.g., mi200). Mutually exclusive with `arch`.
    #[serde(default)]
    pub soc: Option<String>,

    /// Target gfx architecture (e.g., gfx90a), resolved to a SoC.
    #[serde(default)]
    pub arch: Option<String>,

    /// Directory holding the reference counter definitions.
    #[serde(default)]
    pub perfmon_dir: Option<PathBuf>,

    /// Hardware block allowlist. Unset selects every block.
    #[serde(default)]
    pub ip_blocks: Option<Vec<String>>,

    /// Pass output joining configuration.
    #[serde(default)]
    pub join: JoinConfig,

    /// Kernel name shortening configuration.
    #[serde(default)]
    pub shorten: ShortenConfig,

    /// Additional SoC capacity entries, keyed by SoC name. Entries named
    /// after a built-in SoC replace it.
    #[serde(default)]
    pub socs: BTreeMap<String, SocEntry>,
}

/// Pass output joining configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct JoinConfig {
    /// Dispatch matching mode (kernel, grid). Default: "kernel".
    #[serde(default = "default_join_mode")]
    pub mode: String,

    /// Keep the per-pass result files after joining. Default: false.
    #[serde(default)]
    pub keep_inputs: bool,
}

/// Kernel name shortening configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ShortenConfig {
    /// Template nesting depth kept in kernel names. 5 or more disables
    /// shortening. Default: 5.
    #[serde(default = "default_shorten_level")]
    pub level: u32,

    /// Path to llvm-cxxfilt. Default: "/opt/rocm/llvm/bin/llvm-cxxfilt".
    #[serde(default = "default_demangler")]
    pub demangler: PathBuf,
}

/// A user-supplied SoC capacity entry.
#[derive(Debug, Clone, Deserialize)]
pub struct SocEntry {
    /// Number of replicated TCC channels.
    pub tcc_channels: usize,

    /// Per-block counter limits, keyed by block name (SQ, TA, ...). Every
    /// block must be listed.
    pub capacities: BTreeMap<String, usize>,
}

impl SocEntry {
    /// Build the capacity entry for SoC `name`.
    pub fn to_capacity(&self, name: &str) -> Result<SocCapacity> {
        let mut limits = [0usize; BLOCK_COUNT];
        for (block_name, limit) in &self.capacities {
            let Some(block) = HardwareBlock::from_name(&block_name.to_ascii_uppercase()) else {
                bail!("socs.{name}.capacities: unknown block {block_name}");
            };
            limits[block.index()] = *limit;
        }

        for block in HardwareBlock::all() {
            if !self
                .capacities
                .keys()
                .any(|k| HardwareBlock::from_name(&k.to_ascii_uppercase()) == Some(*block))
            {
                bail!("socs.{name}.capacities: missing block {block}");
            }
        }

        SocCapacity::new(name, limits, self.tcc_channels)
            .with_context(|| format!("socs.{name}"))
    }
}

// --- Default value functions ---

fn default_log_level() -> String {
    "info".to_string()
}

fn default_join_mode() -> String {
    JoinMode::default().as_str().to_string()
}

fn default_shorten_level() -> u32 {
    MAX_SHORTEN_LEVEL
}

fn default_demangler() -> PathBuf {
    PathBuf::from(DEFAULT_CXXFILT)
}

// --- Default trait impls ---

impl Default for Config {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            soc: None,
            arch: None,
            perfmon_dir: None,
            ip_blocks: None,
            join: JoinConfig::default(),
            shorten: ShortenConfig::default(),
            socs: BTreeMap::new(),
        }
    }
}

impl Default for JoinConfig {
    fn default() -> Self {
        Self {
            mode: default_join_mode(),
            keep_inputs: false,
        }
    }
}

impl Default for ShortenConfig {
    fn default() -> Self {
        Self {
            level: default_shorten_level(),
            demangler: default_demangler(),
        }
    }
}

impl Config {
    /// Load and validate configuration from a YAML file.
    pub fn load(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path.display()))?;

        let cfg: Config = serde_yaml::from_str(&data)
            .with_context(|| format!("parsing config file {}", path.display()))?;

        cfg.validate()?;

        Ok(cfg)
    }

    /// Validate the configuration for consistency.
    pub fn validate(&self) -> Result<()> {
        if self.log_level.is_empty() {
            bail!("log_level must not be empty");
        }

        if self.soc.is_some() && self.arch.is_some() {
            bail!("soc and arch are mutually exclusive");
        }

        self.join_mode()?;

        if let Some(blocks) = &self.ip_blocks {
            if blocks.iter().any(|b| b.trim().is_empty()) {
                bail!("ip_blocks entries must not be empty");
            }
        }

        if self.shorten.level < MIN_SHORTEN_LEVEL {
            bail!("shorten.level must be at least {MIN_SHORTEN_LEVEL}");
        }

        if self.shorten.demangler.as_os_str().is_empty() {
            bail!("shorten.demangler must not be empty");
        }

        let table = self.capacity_table()?;
        if let Some(name) = self.soc_name()? {
            table.get(&name).context("soc")?;
        }

        Ok(())
    }

    /// Parsed join mode.
    pub fn join_mode(&self) -> Result<JoinMode> {
        self.join.mode.parse().context("join.mode")
    }

    /// Target SoC from `soc` or, failing that, from `arch`.
    pub fn soc_name(&self) -> Result<Option<String>> {
        if let Some(soc) = &self.soc {
            return Ok(Some(soc.to_ascii_lowercase()));
        }
        match &self.arch {
            Some(arch) => Ok(Some(soc::soc_for_arch(arch).context("arch")?.to_string())),
            None => Ok(None),
        }
    }

    /// Built-in capacities plus the configured entries.
    pub fn capacity_table(&self) -> Result<CapacityTable> {
        let mut table = CapacityTable::builtin();
        for (name, entry) in &self.socs {
            table.insert(entry.to_capacity(name)?);
        }
        Ok(table)
    }
}
