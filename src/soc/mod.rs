//! Per-SoC hardware counter capacities.
//!
//! Every GPU IP block can only sample a fixed number of performance counters
//! at once. The [`CapacityTable`] holds those limits per SoC, along with the
//! number of replicated TCC channels. Built-in entries cover the supported
//! Instinct/Vega parts; additional SoCs are registered from configuration
//! rather than code.

use std::collections::BTreeMap;
use std::fmt;

use thiserror::Error;

/// Hardware IP block that owns a set of performance counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(u8)]
pub enum HardwareBlock {
    Sq = 0,
    Grbm = 1,
    Tcp = 2,
    Ta = 3,
    Td = 4,
    Tcc = 5,
    Spi = 6,
    Cpc = 7,
    Cpf = 8,
    Gds = 9,
}

/// Number of HardwareBlock variants, used for array sizing.
pub const BLOCK_COUNT: usize = 10;

impl HardwareBlock {
    /// Returns the canonical upper-case block name.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Sq => "SQ",
            Self::Grbm => "GRBM",
            Self::Tcp => "TCP",
            Self::Ta => "TA",
            Self::Td => "TD",
            Self::Tcc => "TCC",
            Self::Spi => "SPI",
            Self::Cpc => "CPC",
            Self::Cpf => "CPF",
            Self::Gds => "GDS",
        }
    }

    /// Convert from an upper-case block name. `SQC` folds into `SQ`.
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "SQ" | "SQC" => Some(Self::Sq),
            "GRBM" => Some(Self::Grbm),
            "TCP" => Some(Self::Tcp),
            "TA" => Some(Self::Ta),
            "TD" => Some(Self::Td),
            "TCC" => Some(Self::Tcc),
            "SPI" => Some(Self::Spi),
            "CPC" => Some(Self::Cpc),
            "CPF" => Some(Self::Cpf),
            "GDS" => Some(Self::Gds),
            _ => None,
        }
    }

    /// Array index for per-block tables.
    pub const fn index(self) -> usize {
        self as usize
    }

    /// All blocks in emission order. TCC is always emitted last within a
    /// pass, after every ordinary block.
    pub fn all() -> &'static [Self] {
        &[
            Self::Sq,
            Self::Grbm,
            Self::Tcp,
            Self::Ta,
            Self::Td,
            Self::Spi,
            Self::Cpc,
            Self::Cpf,
            Self::Gds,
            Self::Tcc,
        ]
    }

    /// Blocks bucketed and sliced independently (everything except TCC).
    pub fn ordinary() -> &'static [Self] {
        &Self::all()[..BLOCK_COUNT - 1]
    }
}

impl fmt::Display for HardwareBlock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Capacity lookup failures.
#[derive(Error, Debug)]
pub enum SocError {
    #[error("unrecognized SoC: {name}")]
    UnknownSoc { name: String },

    #[error("unsupported gfx architecture: {arch}")]
    UnknownArch { arch: String },

    #[error("SoC {soc}: capacity for block {block} must be at least 1")]
    ZeroCapacity { soc: String, block: HardwareBlock },

    #[error("SoC {soc}: TCC channel count must be at least 1")]
    ZeroChannels { soc: String },
}

/// Concurrent-counter limits for one SoC.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SocCapacity {
    name: String,
    capacities: [usize; BLOCK_COUNT],
    tcc_channels: usize,
}

impl SocCapacity {
    /// Build a capacity entry, rejecting zero limits.
    pub fn new(
        name: impl Into<String>,
        capacities: [usize; BLOCK_COUNT],
        tcc_channels: usize,
    ) -> Result<Self, SocError> {
        let name = name.into().to_ascii_lowercase();
        for block in HardwareBlock::all() {
            if capacities[block.index()] == 0 {
                return Err(SocError::ZeroCapacity {
                    soc: name,
                    block: *block,
                });
            }
        }
        if tcc_channels == 0 {
            return Err(SocError::ZeroChannels { soc: name });
        }

        Ok(Self {
            name,
            capacities,
            tcc_channels,
        })
    }

    /// SoC identifier, e.g. `mi200`.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Maximum counters of `block` sampled concurrently in one pass.
    pub fn capacity(&self, block: HardwareBlock) -> usize {
        self.capacities[block.index()]
    }

    /// Number of replicated TCC channels.
    pub fn tcc_channels(&self) -> usize {
        self.tcc_channels
    }
}

// SQ, GRBM, TCP, TA, TD, TCC, SPI, CPC, CPF, GDS (HardwareBlock index order).
const GFX9_CAPACITIES: [usize; BLOCK_COUNT] = [8, 2, 4, 2, 2, 4, 2, 2, 2, 4];

/// Built-in SoCs and their TCC channel counts.
const BUILTIN_SOCS: &[(&str, usize)] = &[
    ("vega10", 16),
    ("mi50", 16),
    ("mi100", 32),
    ("mi200", 32),
    ("mi300", 32),
];

/// gfx architecture name to SoC identifier.
const ARCH_TO_SOC: &[(&str, &str)] = &[
    ("gfx900", "vega10"),
    ("gfx906", "mi50"),
    ("gfx908", "mi100"),
    ("gfx90a", "mi200"),
    ("gfx940", "mi300"),
];

/// Resolve a gfx architecture string (as reported in sysinfo) to a SoC name.
pub fn soc_for_arch(arch: &str) -> Result<&'static str, SocError> {
    ARCH_TO_SOC
        .iter()
        .find(|(a, _)| *a == arch)
        .map(|(_, soc)| *soc)
        .ok_or_else(|| SocError::UnknownArch {
            arch: arch.to_string(),
        })
}

/// Versioned table of per-SoC capacities. Read-only once built.
#[derive(Debug, Clone)]
pub struct CapacityTable {
    entries: BTreeMap<String, SocCapacity>,
}

impl CapacityTable {
    /// Table with only the built-in SoCs.
    pub fn builtin() -> Self {
        let entries = BUILTIN_SOCS
            .iter()
            .map(|(name, channels)| {
                (
                    (*name).to_string(),
                    SocCapacity {
                        name: (*name).to_string(),
                        capacities: GFX9_CAPACITIES,
                        tcc_channels: *channels,
                    },
                )
            })
            .collect();
        Self { entries }
    }

    /// Add or replace an entry.
    pub fn insert(&mut self, capacity: SocCapacity) {
        self.entries.insert(capacity.name.clone(), capacity);
    }

    /// Look up a SoC by name (case-insensitive).
    pub fn get(&self, soc: &str) -> Result<&SocCapacity, SocError> {
        self.entries
            .get(&soc.to_ascii_lowercase())
            .ok_or_else(|| SocError::UnknownSoc {
                name: soc.to_string(),
            })
    }

    /// Known SoC names in sorted order.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }
}

impl Default for CapacityTable {
    fn default() -> Self {
        Self::builtin()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::panic)]
mod tests {
    use super::*;

    #[test]
    fn test_block_name_roundtrip() {
        for block in HardwareBlock::all() {
            assert_eq!(HardwareBlock::from_name(block.as_str()), Some(*block));
        }
    }

    #[test]
    fn test_sqc_folds_into_sq() {
        assert_eq!(HardwareBlock::from_name("SQC"), Some(HardwareBlock::Sq));
        assert_eq!(HardwareBlock::from_name("XYZ"), None);
    }

    #[test]
    fn test_ordinary_excludes_tcc() {
        assert_eq!(HardwareBlock::ordinary().len(), BLOCK_COUNT - 1);
        assert!(!HardwareBlock::ordinary().contains(&HardwareBlock::Tcc));
        assert_eq!(HardwareBlock::all().last(), Some(&HardwareBlock::Tcc));
    }

    #[test]
    fn test_builtin_capacities() {
        let table = CapacityTable::builtin();
        let mi200 = table.get("mi200").unwrap();
        assert_eq!(mi200.capacity(HardwareBlock::Sq), 8);
        assert_eq!(mi200.capacity(HardwareBlock::Tcc), 4);
        assert_eq!(mi200.capacity(HardwareBlock::Grbm), 2);
        assert_eq!(mi200.capacity(HardwareBlock::Gds), 4);
        assert_eq!(mi200.tcc_channels(), 32);
        assert_eq!(table.get("MI50").unwrap().tcc_channels(), 16);
    }

    #[test]
    fn test_unknown_soc() {
        let err = CapacityTable::builtin().get("mi9000").unwrap_err();
        assert!(matches!(err, SocError::UnknownSoc { .. }));
    }

    #[test]
    fn test_insert_custom_soc() {
        let mut table = CapacityTable::builtin();
        let custom = SocCapacity::new("lab", [1; BLOCK_COUNT], 2).unwrap();
        table.insert(custom);
        assert_eq!(table.get("lab").unwrap().capacity(HardwareBlock::Sq), 1);
        assert!(table.names().any(|n| n == "lab"));
    }

    #[test]
    fn test_zero_capacity_rejected() {
        let mut caps = GFX9_CAPACITIES;
        caps[HardwareBlock::Td.index()] = 0;
        let err = SocCapacity::new("bad", caps, 16).unwrap_err();
        assert!(err.to_string().contains("TD"));
        assert!(SocCapacity::new("bad", GFX9_CAPACITIES, 0).is_err());
    }

    #[test]
    fn test_soc_for_arch() {
        assert_eq!(soc_for_arch("gfx90a").unwrap(), "mi200");
        assert_eq!(soc_for_arch("gfx906").unwrap(), "mi50");
        assert!(soc_for_arch("gfx1100").is_err());
    }
}
