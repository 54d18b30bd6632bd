//! Physical register pool.
//!
//! The RegisterFile tracks which physical registers of the budget are free,
//! which virtual register currently owns each busy one, and which registers
//! are held back as spill scratch. Allocation always hands out the lowest
//! free register so results are deterministic.

use std::fmt;

use thiserror::Error;

use crate::ir::VReg;

/// Physical register identifier, `0..budget`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PhysReg(pub u32);

impl fmt::Display for PhysReg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "${}", self.0)
    }
}

/// Bit set over physical register ids.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RegBitSet {
    words: Vec<u64>,
}

impl RegBitSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set containing registers `0..count`.
    pub fn all(count: u32) -> Self {
        let mut set = Self::new();
        for id in 0..count {
            set.set(PhysReg(id));
        }
        set
    }

    pub fn contains(&self, reg: PhysReg) -> bool {
        let (word, bit) = Self::slot(reg);
        self.words.get(word).is_some_and(|w| w & (1u64 << bit) != 0)
    }

    pub fn set(&mut self, reg: PhysReg) {
        let (word, bit) = Self::slot(reg);
        if word >= self.words.len() {
            self.words.resize(word + 1, 0);
        }
        self.words[word] |= 1u64 << bit;
    }

    pub fn clear(&mut self, reg: PhysReg) {
        let (word, bit) = Self::slot(reg);
        if let Some(w) = self.words.get_mut(word) {
            *w &= !(1u64 << bit);
        }
    }

    /// Lowest register in the set.
    pub fn first(&self) -> Option<PhysReg> {
        self.words
            .iter()
            .enumerate()
            .find(|(_, w)| **w != 0)
            .map(|(i, w)| PhysReg(i as u32 * 64 + w.trailing_zeros()))
    }

    pub fn count(&self) -> u32 {
        self.words.iter().map(|w| w.count_ones()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.words.iter().all(|w| *w == 0)
    }

    fn slot(reg: PhysReg) -> (usize, u32) {
        ((reg.0 / 64) as usize, reg.0 % 64)
    }
}

/// Error types for register pool operations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RegAllocError {
    #[error("no physical register available")]
    NoRegistersAvailable,

    #[error("register {0} is not allocated")]
    RegisterNotAllocated(PhysReg),

    #[error("register {0} is outside the register file")]
    InvalidRegister(PhysReg),
}

/// RegisterFile manages the physical registers of one allocation run.
#[derive(Debug, Clone)]
pub struct RegisterFile {
    /// Size of the budget, scratch included.
    total_regs: u32,
    /// Registers the allocator may hand out (budget minus scratch).
    allocatable: RegBitSet,
    /// Currently allocated registers.
    used: RegBitSet,
    /// Which virtual register owns each physical register.
    assignments: Vec<Option<VReg>>,
    /// Highest number of simultaneously used registers seen.
    high_water: u32,
}

impl RegisterFile {
    pub fn new(total_regs: u32) -> Self {
        Self {
            total_regs,
            allocatable: RegBitSet::all(total_regs),
            used: RegBitSet::new(),
            assignments: vec![None; total_regs as usize],
            high_water: 0,
        }
    }

    /// Remove the top `count` registers from the allocatable pool and return
    /// them, lowest first.
    pub fn reserve_scratch(&mut self, count: u32) -> Vec<PhysReg> {
        let count = count.min(self.total_regs);
        let scratch: Vec<PhysReg> = (self.total_regs - count..self.total_regs).map(PhysReg).collect();
        for reg in &scratch {
            self.allocatable.clear(*reg);
        }
        scratch
    }

    /// Allocate the lowest free register to `vreg`.
    pub fn allocate_reg(&mut self, vreg: VReg) -> Result<PhysReg, RegAllocError> {
        let reg = self.find_first_free().ok_or(RegAllocError::NoRegistersAvailable)?;
        self.assign_register(reg, vreg)?;
        Ok(reg)
    }

    fn find_first_free(&self) -> Option<PhysReg> {
        let mut free = self.allocatable.clone();
        for (i, w) in self.used.words.iter().enumerate() {
            if let Some(f) = free.words.get_mut(i) {
                *f &= !w;
            }
        }
        free.first()
    }

    /// Hand `reg` to `vreg`, replacing any previous owner.
    pub fn assign_register(&mut self, reg: PhysReg, vreg: VReg) -> Result<(), RegAllocError> {
        if reg.0 >= self.total_regs {
            return Err(RegAllocError::InvalidRegister(reg));
        }
        self.used.set(reg);
        self.assignments[reg.0 as usize] = Some(vreg);
        self.high_water = self.high_water.max(self.used.count());
        Ok(())
    }

    pub fn free_register(&mut self, reg: PhysReg) -> Result<(), RegAllocError> {
        if reg.0 >= self.total_regs {
            return Err(RegAllocError::InvalidRegister(reg));
        }
        if !self.used.contains(reg) {
            return Err(RegAllocError::RegisterNotAllocated(reg));
        }
        self.used.clear(reg);
        self.assignments[reg.0 as usize] = None;
        Ok(())
    }

    /// Virtual register currently holding `reg`.
    pub(crate) fn get_assignment(&self, reg: PhysReg) -> Option<VReg> {
        self.assignments.get(reg.0 as usize).copied().flatten()
    }

    pub fn high_water(&self) -> u32 {
        self.high_water
    }

    pub fn reset(&mut self) {
        self.allocatable = RegBitSet::all(self.total_regs);
        self.used = RegBitSet::new();
        self.assignments.fill(None);
        self.high_water = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_regbitset_operations() {
        let mut set = RegBitSet::new();
        let reg = PhysReg(70);

        assert!(!set.contains(reg));
        set.set(reg);
        assert!(set.contains(reg));
        assert_eq!(set.first(), Some(reg));
        set.clear(reg);
        assert!(!set.contains(reg));
        assert!(set.is_empty());
        assert_eq!(RegBitSet::all(130).count(), 130);
    }

    #[test]
    fn test_register_allocation() {
        let mut regfile = RegisterFile::new(4);

        let reg1 = regfile.allocate_reg(VReg(10)).unwrap();
        let reg2 = regfile.allocate_reg(VReg(11)).unwrap();
        assert_eq!(reg1, PhysReg(0));
        assert_eq!(reg2, PhysReg(1));

        assert_eq!(regfile.get_assignment(reg1), Some(VReg(10)));
        assert_eq!(regfile.get_assignment(reg2), Some(VReg(11)));
        assert_eq!(regfile.get_assignment(PhysReg(2)), None);
    }

    #[test]
    fn test_free_and_reuse_lowest() {
        let mut regfile = RegisterFile::new(3);
        let a = regfile.allocate_reg(VReg(0)).unwrap();
        regfile.allocate_reg(VReg(1)).unwrap();
        regfile.free_register(a).unwrap();
        assert_eq!(regfile.allocate_reg(VReg(2)).unwrap(), a);
        assert_eq!(regfile.high_water(), 2);
        assert_eq!(regfile.free_register(PhysReg(2)), Err(RegAllocError::RegisterNotAllocated(PhysReg(2))));
        assert_eq!(regfile.free_register(PhysReg(9)), Err(RegAllocError::InvalidRegister(PhysReg(9))));
    }

    #[test]
    fn test_exhaustion_and_scratch() {
        let mut regfile = RegisterFile::new(3);
        assert_eq!(regfile.reserve_scratch(1), vec![PhysReg(2)]);
        regfile.allocate_reg(VReg(0)).unwrap();
        regfile.allocate_reg(VReg(1)).unwrap();
        assert_eq!(regfile.allocate_reg(VReg(2)), Err(RegAllocError::NoRegistersAvailable));

        regfile.reset();
        assert_eq!(regfile.allocate_reg(VReg(3)), Ok(PhysReg(0)));
        assert_eq!(regfile.high_water(), 1);
    }
}
