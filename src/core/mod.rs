// This module gathers the infrastructure shared by the passes, the allocator and
// the lowering strategies: typed pipeline errors, the arena-backed translation
// session with its statistics, the physical register pool, the live interval
// analyzer, and the target kernel assembler. None of these know about a particular
// target architecture.

//! Core gpuopt infrastructure.
//!
//! # Key Components
//!
//! ## Session Management (`session`)
//! - Arena-based memory allocation using `bumpalo`
//! - Translation statistics
//!
//! ## Register Pool (`register_file`)
//! - Bitset tracking of free and busy physical registers
//! - Scratch register reservation for spill code
//!
//! ## Liveness (`analyzer`)
//! - Linear live intervals with loop extension
//!
//! ## Assembly (`assembler`)
//! - Target statements and on-demand code generation

pub mod analyzer;
pub mod assembler;
pub mod error;
pub mod register_file;
pub mod session;

pub use analyzer::{Analyzer, LiveInterval, LivenessAnalysis};
pub use assembler::{AssembleError, TargetKernel, TargetStatement};
pub use error::{ConfigError, Phase, TranslateError, TranslateResult};
pub use register_file::{PhysReg, RegAllocError, RegisterFile};
pub use session::{SessionStats, TranslationSession};
