// This module defines the error types surfaced at the translator boundary, using the
// thiserror crate. Configuration problems (zero register budget, architecture pairs
// without a lowering strategy, unknown pass bits, a kernel tagged with the wrong
// source architecture) are detected before any pass touches the kernel. Every later
// failure is wrapped into TranslateError together with the phase that produced it:
// a pass that breaks a kernel invariant is fatal for the translation, allocation and
// lowering failures carry their own component errors, and assembly reports a stale
// statement list. Nothing is recovered locally and no fallback code is emitted.

//! Error types for the translation pipeline.

use std::fmt;

use thiserror::Error;

use crate::arch::Architecture;
use crate::core::assembler::AssembleError;
use crate::ir::ConsistencyError;
use crate::lowering::LoweringError;
use crate::regalloc::AllocError;

/// Invalid translator or allocation settings.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("register budget must be a positive integer")]
    ZeroRegisterBudget,

    #[error("no lowering strategy translates {from} to {to}")]
    UnsupportedPair { from: Architecture, to: Architecture },

    #[error("kernel `{kernel}` is {found} code but the translator expects {expected}")]
    ArchitectureMismatch {
        kernel: String,
        expected: Architecture,
        found: Architecture,
    },

    #[error("unknown pass bits {bits:#x} in pass mask")]
    UnknownPassBits { bits: u32 },

    #[error("unknown pass `{name}`")]
    UnknownPass { name: String },

    #[error("unknown optimization level `{name}`")]
    UnknownLevel { name: String },

    #[error("unknown register allocation strategy `{name}`")]
    UnknownStrategy { name: String },
}

/// Pipeline phase a failure originated in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Configuration,
    PassApplication,
    Allocation,
    Lowering,
    Assembly,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Phase::Configuration => "configuration",
            Phase::PassApplication => "pass application",
            Phase::Allocation => "register allocation",
            Phase::Lowering => "lowering",
            Phase::Assembly => "assembly",
        })
    }
}

/// Main error type returned by [`crate::Translator::translate`].
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TranslateError {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("pass `{pass}` broke a kernel invariant: {source}")]
    Consistency {
        pass: &'static str,
        source: ConsistencyError,
    },

    #[error("register allocation failed: {0}")]
    Allocation(#[from] AllocError),

    #[error("lowering to {target} failed: {source}")]
    Lowering {
        target: Architecture,
        source: LoweringError,
    },

    #[error("assembly failed: {0}")]
    Assembly(#[from] AssembleError),
}

impl TranslateError {
    pub fn phase(&self) -> Phase {
        match self {
            TranslateError::Config(_) => Phase::Configuration,
            TranslateError::Consistency { .. } => Phase::PassApplication,
            TranslateError::Allocation(_) => Phase::Allocation,
            TranslateError::Lowering { .. } => Phase::Lowering,
            TranslateError::Assembly(_) => Phase::Assembly,
        }
    }

    /// Internal invariant violations end the translation; everything else is
    /// a problem with the input or settings.
    pub fn is_fatal(&self) -> bool {
        matches!(self, TranslateError::Consistency { .. })
    }
}

/// Result type alias for translation operations.
pub type TranslateResult<T> = Result<T, TranslateError>;
