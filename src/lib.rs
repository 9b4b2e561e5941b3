//! Counter pass planning and multi-pass result reconciliation for GPU
//! performance profiling.
//!
//! Hardware blocks can only sample a few counters at once, so a counter
//! request is split into passes ([`perfmon`]), the workload is run once per
//! pass, and the per-pass result tables are joined back together
//! ([`join`]). Kernel names in the results can be shortened for display
//! ([`shorten`]).

pub mod config;
pub mod join;
pub mod perfmon;
pub mod shorten;
pub mod soc;
