//! Lowering: optimized, allocated kernel IR → target statements.
//!
//! Each supported (source, target) architecture pair maps to one
//! [`Lowering`] strategy in a [`LoweringRegistry`]. The translator checks the
//! registry before touching the kernel, so an unsupported pair fails as a
//! configuration error rather than halfway through a translation.

mod amdil;
mod ptx;

use thiserror::Error;

use crate::arch::Architecture;
use crate::core::assembler::TargetStatement;
use crate::core::register_file::PhysReg;
use crate::ir::{Kernel, VReg};
use crate::regalloc::{AllocationResult, Location};

pub use amdil::AmdilLowering;
pub use ptx::PtxLowering;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LoweringError {
    #[error("statement {index}: `{mnemonic}` has no {target} equivalent")]
    UnsupportedOperation { index: usize, mnemonic: String, target: Architecture },

    #[error("statement {index}: {vreg} has no physical register")]
    MissingRegister { vreg: VReg, index: usize },

    #[error("statement {index}: 64-bit {vreg} does not fit a 4-byte spill slot")]
    WideSpill { vreg: VReg, index: usize },
}

/// Lowers an optimized kernel into target statements.
pub trait Lowering {
    /// The target name (e.g. "ptx", "amdil").
    fn target_name(&self) -> &str;

    /// Produce the complete target statement list, spill code included.
    fn lower(
        &self,
        kernel: &Kernel,
        allocation: &AllocationResult,
    ) -> Result<Vec<TargetStatement>, LoweringError>;
}

type Strategy = Box<dyn Lowering + Send + Sync>;

/// Lowering strategies indexed by (source, target).
pub struct LoweringRegistry {
    strategies: hashbrown::HashMap<(Architecture, Architecture), Strategy>,
}

impl LoweringRegistry {
    /// Registry without any strategy.
    pub fn empty() -> Self {
        Self { strategies: hashbrown::HashMap::new() }
    }

    /// PTX → PTX, PTX → AMD IL and AMD IL → AMD IL.
    pub fn with_defaults() -> Self {
        let mut registry = Self::empty();
        registry.register(Architecture::Ptx, Architecture::Ptx, Box::new(PtxLowering::new()));
        registry.register(Architecture::Ptx, Architecture::Amdil, Box::new(AmdilLowering::new()));
        registry.register(Architecture::Amdil, Architecture::Amdil, Box::new(AmdilLowering::new()));
        registry
    }

    /// Add or replace the strategy for a pair.
    pub fn register(&mut self, source: Architecture, target: Architecture, strategy: Strategy) {
        self.strategies.insert((source, target), strategy);
    }

    pub fn get(&self, source: Architecture, target: Architecture) -> Option<&(dyn Lowering + Send + Sync)> {
        self.strategies.get(&(source, target)).map(|s| s.as_ref())
    }

    pub fn supports(&self, source: Architecture, target: Architecture) -> bool {
        self.strategies.contains_key(&(source, target))
    }

    /// Supported pairs in declaration order of [`Architecture::ALL`].
    pub fn pairs(&self) -> Vec<(Architecture, Architecture)> {
        let mut pairs = Vec::new();
        for source in Architecture::ALL {
            for target in Architecture::ALL {
                if self.supports(source, target) {
                    pairs.push((source, target));
                }
            }
        }
        pairs
    }
}

impl Default for LoweringRegistry {
    fn default() -> Self {
        Self::with_defaults()
    }
}

impl std::fmt::Debug for LoweringRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoweringRegistry").field("pairs", &self.pairs()).finish()
    }
}

/// Physical register serving `vreg` at statement `index`.
fn physical(allocation: &AllocationResult, vreg: VReg, index: usize) -> Result<PhysReg, LoweringError> {
    allocation
        .register_at(vreg, index)
        .ok_or(LoweringError::MissingRegister { vreg, index })
}

/// One past the highest physical register id in use.
fn register_span(allocation: &AllocationResult) -> u32 {
    allocation
        .locations
        .values()
        .filter_map(|l| match l {
            Location::Register(r) => Some(r.0 + 1),
            Location::Spilled { .. } => None,
        })
        .chain(allocation.scratch.iter().map(|r| r.0 + 1))
        .max()
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_pairs() {
        let registry = LoweringRegistry::default();
        assert_eq!(
            registry.pairs(),
            vec![
                (Architecture::Ptx, Architecture::Ptx),
                (Architecture::Ptx, Architecture::Amdil),
                (Architecture::Amdil, Architecture::Amdil),
            ]
        );
        assert!(!registry.supports(Architecture::Ptx, Architecture::Llvm));
        assert!(registry.get(Architecture::Emulated, Architecture::Ptx).is_none());
    }

    #[test]
    fn test_target_names() {
        let registry = LoweringRegistry::with_defaults();
        let ptx = registry.get(Architecture::Ptx, Architecture::Ptx).unwrap();
        assert_eq!(ptx.target_name(), "ptx");
        let amdil = registry.get(Architecture::Ptx, Architecture::Amdil).unwrap();
        assert_eq!(amdil.target_name(), "amdil");
    }

    #[test]
    fn test_register_replaces() {
        let mut registry = LoweringRegistry::empty();
        assert!(registry.pairs().is_empty());
        registry.register(Architecture::Amdil, Architecture::Ptx, Box::new(PtxLowering::new()));
        assert_eq!(registry.pairs(), vec![(Architecture::Amdil, Architecture::Ptx)]);
    }
}
