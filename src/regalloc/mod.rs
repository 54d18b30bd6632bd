//! Register allocation: request and result types plus strategy dispatch.
//!
//! The allocator never rewrites the kernel. Spilled values are described by
//! an [`AllocationResult`] (slot, store points, reload points and the scratch
//! register serving each one) and the lowering strategies materialise the
//! memory traffic in target code.

use std::fmt;
use std::str::FromStr;

use bumpalo::Bump;
use thiserror::Error;

use crate::arch::Architecture;
use crate::core::error::ConfigError;
use crate::core::register_file::{PhysReg, RegAllocError};
use crate::ir::{Kernel, VReg};

pub mod linear_scan;

/// Bytes of scratch memory backing one spilled value.
pub const SPILL_SLOT_BYTES: u32 = 4;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum AllocationStrategy {
    #[default]
    LinearScan,
}

impl AllocationStrategy {
    pub const fn name(self) -> &'static str {
        match self {
            AllocationStrategy::LinearScan => "linear-scan",
        }
    }
}

impl fmt::Display for AllocationStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for AllocationStrategy {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().replace(['-', '_'], "").as_str() {
            "linearscan" => Ok(AllocationStrategy::LinearScan),
            _ => Err(ConfigError::UnknownStrategy { name: s.to_string() }),
        }
    }
}

/// Everything the allocator needs besides the kernel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AllocationRequest {
    pub strategy: AllocationStrategy,
    /// Physical register budget, scratch registers included.
    pub register_count: u32,
    /// Scratch memory available for spill slots.
    pub scratch_bytes: u32,
}

impl AllocationRequest {
    pub fn new(register_count: u32) -> Self {
        Self {
            strategy: AllocationStrategy::LinearScan,
            register_count,
            scratch_bytes: u32::MAX,
        }
    }

    /// Request bounded by the scratch capacity of `arch`.
    pub fn for_architecture(arch: Architecture, register_count: u32) -> Self {
        Self::new(register_count).with_scratch_bytes(arch.scratch_capacity())
    }

    pub fn with_scratch_bytes(mut self, bytes: u32) -> Self {
        self.scratch_bytes = bytes;
        self
    }

    pub fn with_strategy(mut self, strategy: AllocationStrategy) -> Self {
        self.strategy = strategy;
        self
    }
}

/// Where a virtual register lives for its whole lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Location {
    Register(PhysReg),
    Spilled { slot: u32 },
}

/// A reload before, or a store after, the statement at `position`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SpillPoint {
    pub position: usize,
    /// Scratch register holding the value around the statement.
    pub register: PhysReg,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpillRecord {
    pub vreg: VReg,
    pub slot: u32,
    /// Stores right after each definition.
    pub stores: Vec<SpillPoint>,
    /// Reloads right before each use.
    pub reloads: Vec<SpillPoint>,
}

impl SpillRecord {
    pub fn byte_offset(&self) -> u32 {
        self.slot * SPILL_SLOT_BYTES
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AllocError {
    #[error("register budget is zero")]
    ZeroBudget,

    #[error("statement {index} needs {needed} registers at once but the budget is {budget}")]
    InsufficientRegisters { needed: u32, budget: u32, index: usize },

    #[error("spilling needs {needed_bytes} bytes of scratch memory, only {capacity} available")]
    ScratchExhausted { needed_bytes: u64, capacity: u32 },

    #[error(transparent)]
    RegisterFile(#[from] RegAllocError),
}

/// Outcome of one allocation run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AllocationResult {
    /// Location of every virtual register referenced by the kernel.
    pub locations: hashbrown::HashMap<VReg, Location>,
    /// Spilled registers, ordered by slot.
    pub spills: Vec<SpillRecord>,
    /// Registers held back for reload and store segments, lowest first.
    pub scratch: Vec<PhysReg>,
}

impl AllocationResult {
    pub fn location(&self, vreg: VReg) -> Option<Location> {
        self.locations.get(&vreg).copied()
    }

    /// Physical register holding `vreg` while the statement at `index` runs.
    pub fn register_at(&self, vreg: VReg, index: usize) -> Option<PhysReg> {
        match self.location(vreg)? {
            Location::Register(reg) => Some(reg),
            Location::Spilled { .. } => {
                let record = self.spill(vreg)?;
                record
                    .reloads
                    .iter()
                    .chain(&record.stores)
                    .find(|p| p.position == index)
                    .map(|p| p.register)
            }
        }
    }

    pub fn spill(&self, vreg: VReg) -> Option<&SpillRecord> {
        self.spills.iter().find(|s| s.vreg == vreg)
    }

    pub fn is_empty(&self) -> bool {
        self.locations.is_empty()
    }

    pub fn has_spills(&self) -> bool {
        !self.spills.is_empty()
    }

    /// Scratch memory the spill slots occupy.
    pub fn scratch_bytes(&self) -> u32 {
        self.spills.len() as u32 * SPILL_SLOT_BYTES
    }

    /// Number of distinct physical registers handed out.
    pub fn registers_used(&self) -> u32 {
        let mut regs: Vec<PhysReg> = self
            .locations
            .values()
            .filter_map(|l| match l {
                Location::Register(r) => Some(*r),
                Location::Spilled { .. } => None,
            })
            .collect();
        if self.has_spills() {
            regs.extend(&self.scratch);
        }
        regs.sort_unstable();
        regs.dedup();
        regs.len() as u32
    }

    /// Reloads to emit before the statement at `index`, by slot.
    pub fn reloads_before(&self, index: usize) -> impl Iterator<Item = (&SpillRecord, PhysReg)> + '_ {
        self.spills.iter().filter_map(move |s| {
            s.reloads.iter().find(|p| p.position == index).map(|p| (s, p.register))
        })
    }

    /// Stores to emit after the statement at `index`, by slot.
    pub fn stores_after(&self, index: usize) -> impl Iterator<Item = (&SpillRecord, PhysReg)> + '_ {
        self.spills.iter().filter_map(move |s| {
            s.stores.iter().find(|p| p.position == index).map(|p| (s, p.register))
        })
    }
}

/// Allocate physical registers for `kernel`.
pub fn allocate(kernel: &Kernel, request: &AllocationRequest) -> Result<AllocationResult, AllocError> {
    let arena = Bump::new();
    allocate_in(&arena, kernel, request)
}

/// Like [`allocate`], building analysis tables in `arena`.
pub fn allocate_in(
    arena: &Bump,
    kernel: &Kernel,
    request: &AllocationRequest,
) -> Result<AllocationResult, AllocError> {
    match request.strategy {
        AllocationStrategy::LinearScan => linear_scan::allocate(arena, kernel, request),
    }
}
