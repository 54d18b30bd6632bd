//! gpuopt - GPU kernel optimization and translation.
//!
//! gpuopt rewrites GPU kernels (PTX and AMD IL) with a small catalog of
//! synchronization and control-flow passes, assigns physical registers with
//! a linear-scan allocator that spills to scratch memory, and lowers the
//! result to a target architecture.
//!
//! # Primary Usage
//!
//! ```
//! use gpuopt::{parse_kernel, Architecture, OptimizationLevel, Translator};
//!
//! let kernel = parse_kernel(
//!     ".kernel scale .arch ptx
//!         mov.s32 %r0, %tid.x;
//!         st.shared.s32 [buf], %r0;
//!         bar.sync 0;
//!         bar.sync 0;
//!         ld.shared.s32 %r1, [buf+4];
//!         st.global.s32 [out], %r1;
//!         ret;",
//! )?;
//!
//! let translator = Translator::new(
//!     Architecture::Ptx,
//!     Architecture::Amdil,
//!     OptimizationLevel::BasicOptimization,
//! );
//! let target = translator.translate(kernel)?;
//! assert_eq!(target.code()?.matches("fence_threads_lds").count(), 1);
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```
//!
//! # Architecture
//!
//! - [`ir`] - Kernel IR, textual format, derived control-flow graph
//! - [`passes`] - Barrier removal, reverse if-conversion, block unification, sync elimination
//! - [`regalloc`] - Linear-scan register allocation with spilling
//! - [`lowering`] - Per architecture pair lowering strategies
//! - [`core`] - Shared infrastructure (errors, session, register pool, liveness, assembler)
//! - [`translator`] - Optimization levels and the translation pipeline
//! - [`optimizer`] - Optimization in place with a manual pass mask

pub mod arch;
pub mod core;
pub mod ir;
pub mod lowering;
pub mod optimizer;
pub mod passes;
pub mod regalloc;
pub mod translator;

pub use arch::Architecture;
pub use core::{
    AssembleError, ConfigError, Phase, SessionStats, TargetKernel, TargetStatement, TranslateError,
    TranslateResult, TranslationSession,
};
pub use ir::{parse_kernel, ConsistencyError, Kernel, ParseError, Statement, VReg};
pub use lowering::{Lowering, LoweringError, LoweringRegistry};
pub use optimizer::{optimize, Optimized};
pub use passes::{apply_passes, Pass, PassMask, PassReport};
pub use regalloc::{allocate, AllocError, AllocationRequest, AllocationResult, AllocationStrategy, Location};
pub use translator::{level_name, Instrumentation, OptimizationLevel, TranslationOptions, Translator};
