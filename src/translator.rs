// This module defines the Translator, the entry point that takes a parsed kernel from
// its source architecture to target code. A translator is configured once with a
// source architecture, a target architecture and an optimization level; the level
// alone decides which passes run, through an explicit level-to-mask table evaluated
// per translation. Each call checks its configuration first (positive register
// budget, a lowering strategy registered for the architecture pair, a kernel tagged
// with the expected source architecture) and only then mutates the kernel: passes
// in canonical order, the optional instrumentation hook for the instrumented levels,
// linear-scan allocation under the budget, architecture-pair lowering and assembly.
// Every failure comes back as a TranslateError naming the phase; nothing is emitted
// on failure.

//! Kernel translation driven by optimization levels.

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use bumpalo::Bump;

use crate::arch::Architecture;
use crate::core::assembler::TargetKernel;
use crate::core::error::{ConfigError, TranslateError, TranslateResult};
use crate::core::session::TranslationSession;
use crate::ir::Kernel;
use crate::lowering::LoweringRegistry;
use crate::passes::{apply_passes, PassMask};
use crate::regalloc::{self, AllocationRequest, AllocationStrategy};

/// Optimization aggressiveness, in reporting order.
///
/// The order is for logging and comparison only; each level's passes come
/// from [`OptimizationLevel::implied_passes`], never from its position.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum OptimizationLevel {
    #[default]
    NoOptimization,
    ReportOptimization,
    DebugOptimization,
    InstrumentOptimization,
    MemoryCheckOptimization,
    BasicOptimization,
    AggressiveOptimization,
    SpaceOptimization,
    FullOptimization,
}

impl OptimizationLevel {
    pub const ALL: [OptimizationLevel; 9] = [
        OptimizationLevel::NoOptimization,
        OptimizationLevel::ReportOptimization,
        OptimizationLevel::DebugOptimization,
        OptimizationLevel::InstrumentOptimization,
        OptimizationLevel::MemoryCheckOptimization,
        OptimizationLevel::BasicOptimization,
        OptimizationLevel::AggressiveOptimization,
        OptimizationLevel::SpaceOptimization,
        OptimizationLevel::FullOptimization,
    ];

    pub const fn name(self) -> &'static str {
        match self {
            OptimizationLevel::NoOptimization => "NoOptimization",
            OptimizationLevel::ReportOptimization => "ReportOptimization",
            OptimizationLevel::DebugOptimization => "DebugOptimization",
            OptimizationLevel::InstrumentOptimization => "InstrumentOptimization",
            OptimizationLevel::MemoryCheckOptimization => "MemoryCheckOptimization",
            OptimizationLevel::BasicOptimization => "BasicOptimization",
            OptimizationLevel::AggressiveOptimization => "AggressiveOptimization",
            OptimizationLevel::SpaceOptimization => "SpaceOptimization",
            OptimizationLevel::FullOptimization => "FullOptimization",
        }
    }

    /// Level for a raw discriminant, in [`OptimizationLevel::ALL`] order.
    pub fn from_raw(raw: u32) -> Option<Self> {
        Self::ALL.get(raw as usize).copied()
    }

    /// Passes this level runs.
    pub const fn implied_passes(self) -> PassMask {
        match self {
            OptimizationLevel::NoOptimization
            | OptimizationLevel::ReportOptimization
            | OptimizationLevel::DebugOptimization
            | OptimizationLevel::InstrumentOptimization
            | OptimizationLevel::MemoryCheckOptimization => PassMask::NONE,
            OptimizationLevel::BasicOptimization => {
                PassMask::REMOVE_BARRIERS.union(PassMask::SYNC_ELIMINATION)
            }
            OptimizationLevel::AggressiveOptimization | OptimizationLevel::FullOptimization => PassMask::ALL,
            OptimizationLevel::SpaceOptimization => {
                PassMask::BLOCK_UNIFICATION.union(PassMask::SYNC_ELIMINATION)
            }
        }
    }

    /// Levels that hand the kernel to an [`Instrumentation`] hook.
    pub const fn is_instrumented(self) -> bool {
        matches!(
            self,
            OptimizationLevel::ReportOptimization
                | OptimizationLevel::DebugOptimization
                | OptimizationLevel::InstrumentOptimization
                | OptimizationLevel::MemoryCheckOptimization
        )
    }
}

/// Canonical name of a raw level value; anything unknown is `NoOptimization`.
pub fn level_name(raw: u32) -> &'static str {
    OptimizationLevel::from_raw(raw)
        .unwrap_or(OptimizationLevel::NoOptimization)
        .name()
}

impl fmt::Display for OptimizationLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for OptimizationLevel {
    type Err = ConfigError;

    /// Canonical names, case-insensitive and with or without the
    /// `Optimization` suffix, plus `O0`, `O1`, `O2`, `O3` and `Os`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let alias = match s {
            "O0" | "o0" => Some(OptimizationLevel::NoOptimization),
            "O1" | "o1" => Some(OptimizationLevel::BasicOptimization),
            "O2" | "o2" => Some(OptimizationLevel::AggressiveOptimization),
            "O3" | "o3" => Some(OptimizationLevel::FullOptimization),
            "Os" | "os" => Some(OptimizationLevel::SpaceOptimization),
            _ => None,
        };
        if let Some(level) = alias {
            return Ok(level);
        }

        let key = s.to_ascii_lowercase().replace(['-', '_'], "");
        Self::ALL
            .into_iter()
            .find(|level| {
                let name = level.name().to_ascii_lowercase();
                name == key || name.strip_suffix("optimization") == Some(key.as_str())
            })
            .ok_or_else(|| ConfigError::UnknownLevel { name: s.to_string() })
    }
}

/// Recognized translation options.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TranslationOptions {
    /// Source path, consumed by the front-end.
    pub input: Option<PathBuf>,
    /// Destination path, consumed by the writer.
    pub output: Option<PathBuf>,
    pub register_allocation: AllocationStrategy,
    /// Manual pass mask. Only [`crate::optimizer::optimize`] honours it; a
    /// translator always runs the passes its level implies.
    pub passes: PassMask,
    /// Register budget; the target architecture's default when unset.
    pub register_count: Option<u32>,
    /// Attach the control-flow graph of the optimized kernel to the output.
    pub cfg: bool,
}

/// Hook run on the optimized kernel at the instrumented levels.
pub trait Instrumentation {
    fn name(&self) -> &str;

    /// Inspect or rewrite the kernel before register allocation. New
    /// registers must come from [`Kernel::new_register`].
    fn instrument(&self, level: OptimizationLevel, kernel: &mut Kernel);
}

pub struct Translator {
    source: Architecture,
    target: Architecture,
    level: OptimizationLevel,
    register_budget: Option<u32>,
    registry: LoweringRegistry,
    instrumentation: Option<Box<dyn Instrumentation + Send + Sync>>,
}

impl Translator {
    pub fn new(source: Architecture, target: Architecture, level: OptimizationLevel) -> Self {
        Self {
            source,
            target,
            level,
            register_budget: None,
            registry: LoweringRegistry::with_defaults(),
            instrumentation: None,
        }
    }

    /// Override the target's default register budget.
    pub fn with_register_budget(mut self, budget: u32) -> Self {
        self.register_budget = Some(budget);
        self
    }

    pub fn with_registry(mut self, registry: LoweringRegistry) -> Self {
        self.registry = registry;
        self
    }

    pub fn with_instrumentation(mut self, hook: Box<dyn Instrumentation + Send + Sync>) -> Self {
        self.instrumentation = Some(hook);
        self
    }

    pub fn source(&self) -> Architecture {
        self.source
    }

    pub fn target(&self) -> Architecture {
        self.target
    }

    pub fn level(&self) -> OptimizationLevel {
        self.level
    }

    /// Budget used when the options carry none.
    pub fn register_budget(&self) -> u32 {
        self.register_budget
            .unwrap_or_else(|| self.target.default_register_budget())
    }

    /// Configuration checks, run before the kernel is touched.
    pub fn check(&self, kernel: &Kernel, budget: u32) -> Result<(), ConfigError> {
        if budget == 0 {
            return Err(ConfigError::ZeroRegisterBudget);
        }
        if !self.registry.supports(self.source, self.target) {
            return Err(ConfigError::UnsupportedPair { from: self.source, to: self.target });
        }
        if kernel.arch() != self.source {
            return Err(ConfigError::ArchitectureMismatch {
                kernel: kernel.name().to_string(),
                expected: self.source,
                found: kernel.arch(),
            });
        }
        Ok(())
    }

    pub fn translate(&self, kernel: Kernel) -> TranslateResult<TargetKernel> {
        self.translate_with(kernel, &TranslationOptions::default())
    }

    pub fn translate_with(&self, kernel: Kernel, options: &TranslationOptions) -> TranslateResult<TargetKernel> {
        let arena = Bump::new();
        let session = TranslationSession::new(&arena);
        self.translate_in(&session, kernel, options)
    }

    /// Translate one kernel, recording statistics in `session`.
    pub fn translate_in(
        &self,
        session: &TranslationSession<'_>,
        mut kernel: Kernel,
        options: &TranslationOptions,
    ) -> TranslateResult<TargetKernel> {
        let budget = options.register_count.unwrap_or_else(|| self.register_budget());
        self.check(&kernel, budget)?;
        kernel
            .verify()
            .map_err(|source| TranslateError::Consistency { pass: "input", source })?;

        let name = session.intern_str(kernel.name());
        session.set_current_kernel(name);
        log::debug!("translating `{}` {} -> {} at {}", name, self.source, self.target, self.level);

        // -------- passes ---------
        let mask = self.level.implied_passes();
        if !options.passes.is_empty() && options.passes != mask {
            log::warn!(
                "ignoring manual pass mask `{}`: {} runs `{}`",
                options.passes,
                self.level,
                mask
            );
        }
        let report = apply_passes(&mut kernel, mask)?;
        for run in &report.runs {
            session.record_pass(run.pass.name(), run.rewritten);
        }

        if self.level.is_instrumented() {
            if let Some(hook) = &self.instrumentation {
                log::debug!("running instrumentation `{}` on `{}`", hook.name(), name);
                hook.instrument(self.level, &mut kernel);
                kernel
                    .verify()
                    .map_err(|source| TranslateError::Consistency { pass: "instrumentation", source })?;
            }
        }

        // -------- allocation ---------
        let request = AllocationRequest::for_architecture(self.target, budget)
            .with_strategy(options.register_allocation);
        let allocation = regalloc::allocate_in(session.arena(), &kernel, &request)?;
        session.record_registers_allocated(allocation.locations.len() - allocation.spills.len());
        session.record_spills(allocation.spills.len());

        // -------- lowering and assembly ---------
        let strategy = self
            .registry
            .get(self.source, self.target)
            .ok_or(ConfigError::UnsupportedPair { from: self.source, to: self.target })?;
        let statements = strategy
            .lower(&kernel, &allocation)
            .map_err(|source| TranslateError::Lowering { target: self.target, source })?;

        let mut target = TargetKernel::from_statements(name, self.target, statements);
        if options.cfg {
            target.set_cfg(kernel.cfg().to_dot());
        }
        let code_len = target.code()?.len();

        session.record_kernel_translated(name, target.statements().len());
        session.clear_kernel_state();
        log::debug!(
            "translated `{}`: {} target statements, {} bytes of code",
            name,
            target.statements().len(),
            code_len
        );
        Ok(target)
    }
}

impl fmt::Debug for Translator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Translator")
            .field("source", &self.source)
            .field("target", &self.target)
            .field("level", &self.level)
            .field("register_budget", &self.register_budget)
            .field("registry", &self.registry)
            .field("instrumentation", &self.instrumentation.as_ref().map(|h| h.name().to_string()))
            .finish()
    }
}
