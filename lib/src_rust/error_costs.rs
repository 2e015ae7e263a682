//! Costs used to rank competing error recoveries, and the limits that keep
//! the number of explored stack versions bounded.

use crate::language::StateId;

pub const ERROR_STATE: StateId = 0;
pub const ERROR_COST_PER_RECOVERY: u32 = 500;
pub const ERROR_COST_PER_MISSING_TREE: u32 = 110;
pub const ERROR_COST_PER_SKIPPED_TREE: u32 = 100;
pub const ERROR_COST_PER_SKIPPED_LINE: u32 = 30;
pub const ERROR_COST_PER_SKIPPED_CHAR: u32 = 1;

pub const MAX_VERSION_COUNT: usize = 6;
pub const MAX_VERSION_COUNT_OVERFLOW: usize = 4;
pub const MAX_SUMMARY_DEPTH: u32 = 16;
pub const MAX_COST_DIFFERENCE: u32 = 18 * ERROR_COST_PER_SKIPPED_TREE;
pub const OP_COUNT_PER_TIMEOUT_CHECK: u32 = 100;
