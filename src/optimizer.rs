//! Manual optimization without lowering.
//!
//! [`optimize`] runs exactly the passes named in
//! [`TranslationOptions::passes`] and then allocates registers, leaving the
//! kernel in its source architecture. It is what the command line's
//! `optimize` subcommand and the pass test harness drive.

use bumpalo::Bump;

use crate::core::error::{ConfigError, TranslateError, TranslateResult};
use crate::core::session::TranslationSession;
use crate::ir::Kernel;
use crate::passes::{apply_passes, PassReport};
use crate::regalloc::{self, AllocationRequest, AllocationResult};
use crate::translator::TranslationOptions;

/// Kernel after the selected passes, with its register assignment.
#[derive(Debug, Clone)]
pub struct Optimized {
    pub kernel: Kernel,
    pub report: PassReport,
    pub allocation: AllocationResult,
    /// Graphviz CFG of the optimized kernel, when requested.
    pub cfg: Option<String>,
}

pub fn optimize(kernel: Kernel, options: &TranslationOptions) -> TranslateResult<Optimized> {
    let arena = Bump::new();
    let session = TranslationSession::new(&arena);
    optimize_in(&session, kernel, options)
}

pub fn optimize_in(
    session: &TranslationSession<'_>,
    mut kernel: Kernel,
    options: &TranslationOptions,
) -> TranslateResult<Optimized> {
    let budget = options
        .register_count
        .unwrap_or_else(|| kernel.arch().default_register_budget());
    if budget == 0 {
        return Err(ConfigError::ZeroRegisterBudget.into());
    }
    kernel
        .verify()
        .map_err(|source| TranslateError::Consistency { pass: "input", source })?;

    session.set_current_kernel(kernel.name());
    let report = apply_passes(&mut kernel, options.passes)?;
    for run in &report.runs {
        session.record_pass(run.pass.name(), run.rewritten);
    }

    let request = AllocationRequest::for_architecture(kernel.arch(), budget)
        .with_strategy(options.register_allocation);
    let allocation = regalloc::allocate_in(session.arena(), &kernel, &request)?;
    session.record_registers_allocated(allocation.locations.len() - allocation.spills.len());
    session.record_spills(allocation.spills.len());
    session.clear_kernel_state();

    log::debug!(
        "optimized `{}` with `{}`: {} statements rewritten, {} spills",
        kernel.name(),
        options.passes,
        report.total_rewritten(),
        allocation.spills.len()
    );

    let cfg = options.cfg.then(|| kernel.cfg().to_dot());
    Ok(Optimized { kernel, report, allocation, cfg })
}
