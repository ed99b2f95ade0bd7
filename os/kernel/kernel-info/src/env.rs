//! # Environment Table Sizing

/// log2 of [`MAX_ENVS`]; the number of index bits in an environment id.
pub const LOG2_MAX_ENVS: u32 = 10;

/// Size of the environment table.
pub const MAX_ENVS: usize = 1 << LOG2_MAX_ENVS;

/// Execution budget granted to an environment each time it is (re)scheduled,
/// in clock ticks.
pub const TIME_SLICE: u64 = 500_000_000;

/// Upper bound on CPUs the scheduler tracks.
pub const MAX_CPUS: usize = 8;
