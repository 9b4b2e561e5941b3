//! Pass planning.
//!
//! Splits a populated [`CounterBucket`] into the minimum number of passes
//! such that no pass samples more counters from a block than the hardware
//! allows. Aggregate TCC counters occupy the earliest passes; per-channel TCC
//! counters start only once the aggregate list is exhausted, so the two
//! pass counts add up rather than overlap.

use std::collections::BTreeMap;

use thiserror::Error;

use super::bucket::{classify_counter, ClassifyError, CounterBucket, Placement};
use crate::soc::{HardwareBlock, SocCapacity};

/// Planner failures. Any of these means the plan must not be used.
#[derive(Error, Debug)]
pub enum PlanError {
    #[error("pass {pass}: {scope} holds {count} counters, capacity is {capacity}")]
    CapacityExceeded {
        pass: usize,
        scope: String,
        count: usize,
        capacity: usize,
    },

    #[error("pass {pass}: {source}")]
    Classify {
        pass: usize,
        #[source]
        source: ClassifyError,
    },
}

/// Counters sampled together in one execution of the target program.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Pass {
    pub counters: Vec<String>,
}

impl Pass {
    pub fn is_empty(&self) -> bool {
        self.counters.is_empty()
    }
}

/// Ordered passes; index is execution order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PlanResult {
    pub passes: Vec<Pass>,
}

impl PlanResult {
    pub fn len(&self) -> usize {
        self.passes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.passes.is_empty()
    }

    /// Passes as plain counter lists, for callers that run them directly.
    pub fn into_batches(self) -> Vec<Vec<String>> {
        self.passes.into_iter().map(|p| p.counters).collect()
    }
}

/// Pass counts contributed by each part of the bucket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PassCounts {
    /// Max over ordinary blocks.
    pub ordinary: usize,
    /// Aggregate TCC counters.
    pub tcc: usize,
    /// Max over TCC channels.
    pub channel: usize,
}

impl PassCounts {
    /// Total passes: ordinary blocks run alongside TCC, while aggregate and
    /// channel TCC passes are sequential.
    pub fn total(&self) -> usize {
        self.ordinary.max(self.tcc + self.channel)
    }
}

/// Compute the per-part pass counts for a bucket.
pub fn pass_counts(bucket: &CounterBucket, soc: &SocCapacity) -> PassCounts {
    let ordinary = HardwareBlock::ordinary()
        .iter()
        .map(|block| bucket.block(*block).len().div_ceil(soc.capacity(*block)))
        .max()
        .unwrap_or(0);

    let tcc_capacity = soc.capacity(HardwareBlock::Tcc);
    let tcc = bucket.block(HardwareBlock::Tcc).len().div_ceil(tcc_capacity);
    let channel = bucket
        .channels()
        .values()
        .map(|list| list.len().div_ceil(tcc_capacity))
        .max()
        .unwrap_or(0);

    PassCounts {
        ordinary,
        tcc,
        channel,
    }
}

/// Window `[pass * capacity, pass * capacity + capacity)` of `list`, empty
/// beyond the end.
fn slice(list: &[String], pass: usize, capacity: usize) -> &[String] {
    let start = (pass * capacity).min(list.len());
    let end = (start + capacity).min(list.len());
    &list[start..end]
}

/// Build the pass list for a bucket.
///
/// An empty bucket yields an empty plan. Every emitted pass is checked
/// against the SoC capacities before the plan is returned.
pub fn plan(bucket: &CounterBucket, soc: &SocCapacity) -> Result<PlanResult, PlanError> {
    let counts = pass_counts(bucket, soc);
    let total = counts.total();
    let tcc_capacity = soc.capacity(HardwareBlock::Tcc);

    let mut passes = Vec::with_capacity(total);
    for p in 0..total {
        let mut counters = Vec::new();

        for block in HardwareBlock::ordinary() {
            counters.extend_from_slice(slice(bucket.block(*block), p, soc.capacity(*block)));
        }

        let aggregate = slice(bucket.block(HardwareBlock::Tcc), p, tcc_capacity);
        if aggregate.is_empty() {
            // Aggregate slots stay reserved (empty) for channel passes.
            let channel_pass = p.saturating_sub(counts.tcc);
            for list in bucket.channels().values() {
                counters.extend_from_slice(slice(list, channel_pass, tcc_capacity));
            }
        } else {
            counters.extend_from_slice(aggregate);
        }

        let pass = Pass { counters };
        check_capacity(p, &pass, soc)?;
        passes.push(pass);
    }

    Ok(PlanResult { passes })
}

/// Verify a pass against every block, aggregate TCC and channel limit.
pub fn check_capacity(index: usize, pass: &Pass, soc: &SocCapacity) -> Result<(), PlanError> {
    let mut blocks: BTreeMap<HardwareBlock, usize> = BTreeMap::new();
    let mut channels: BTreeMap<u32, usize> = BTreeMap::new();

    for counter in &pass.counters {
        match classify_counter(counter).map_err(|source| PlanError::Classify {
            pass: index,
            source,
        })? {
            Placement::Block(block) => *blocks.entry(block).or_default() += 1,
            Placement::Channel(ch) => *channels.entry(ch).or_default() += 1,
        }
    }

    for (block, count) in blocks {
        let capacity = soc.capacity(block);
        if count > capacity {
            return Err(PlanError::CapacityExceeded {
                pass: index,
                scope: block.to_string(),
                count,
                capacity,
            });
        }
    }

    let tcc_capacity = soc.capacity(HardwareBlock::Tcc);
    for (ch, count) in channels {
        if count > tcc_capacity {
            return Err(PlanError::CapacityExceeded {
                pass: index,
                scope: format!("TCC channel {ch}"),
                count,
                capacity: tcc_capacity,
            });
        }
    }

    Ok(())
}
