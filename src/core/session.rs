// This module provides arena-based translation session management using the bumpalo
// crate. A TranslationSession owns a reference to the arena that per-run analysis
// tables live in, interns kernel and label names, and accumulates statistics across
// every kernel translated through it: passes applied and the statements each one
// rewrote, registers allocated, spills planned, and target statements emitted. The
// session holds no cross-kernel semantic state; one session per thread is the
// intended use, and independent kernels can be translated on independent threads
// with their own sessions.

//! Arena-based translation session management.

use std::cell::RefCell;
use std::collections::HashMap;
use std::fmt;

use bumpalo::Bump;

/// Per-thread translation session.
pub struct TranslationSession<'arena> {
    /// Arena allocator for analysis data.
    arena: &'arena Bump,

    /// Session statistics for debugging and tuning.
    stats: RefCell<SessionStats>,

    /// String interning for kernel and label names.
    interned_strings: RefCell<HashMap<String, &'arena str>>,

    /// Kernel currently being translated.
    current_kernel: RefCell<Option<String>>,
}

impl<'arena> TranslationSession<'arena> {
    pub fn new(arena: &'arena Bump) -> Self {
        Self {
            arena,
            stats: RefCell::new(SessionStats::default()),
            interned_strings: RefCell::new(HashMap::new()),
            current_kernel: RefCell::new(None),
        }
    }

    pub fn arena(&self) -> &'arena Bump {
        self.arena
    }

    /// Intern a string in the arena.
    pub fn intern_str(&self, s: &str) -> &'arena str {
        let mut strings = self.interned_strings.borrow_mut();
        if let Some(&interned) = strings.get(s) {
            return interned;
        }

        let interned = self.arena.alloc_str(s);
        strings.insert(s.to_string(), interned);
        interned
    }

    pub fn set_current_kernel(&self, name: &str) {
        *self.current_kernel.borrow_mut() = Some(name.to_string());
    }

    pub fn current_kernel(&self) -> Option<String> {
        self.current_kernel.borrow().clone()
    }

    pub fn clear_kernel_state(&self) {
        *self.current_kernel.borrow_mut() = None;
    }

    /// Record that a kernel went through the whole pipeline.
    pub fn record_kernel_translated(&self, name: &str, statements: usize) {
        let mut stats = self.stats.borrow_mut();
        stats.kernels_translated += 1;
        stats.statements_emitted += statements;
        if stats.largest_kernel_size < statements {
            stats.largest_kernel_size = statements;
            stats.largest_kernel_name = name.to_string();
        }
    }

    /// Record one pass application and how many statements it rewrote.
    pub fn record_pass(&self, pass: &str, rewritten: usize) {
        let mut stats = self.stats.borrow_mut();
        stats.passes_applied += 1;
        *stats.statements_rewritten.entry(pass.to_string()).or_insert(0) += rewritten;
    }

    pub fn record_registers_allocated(&self, count: usize) {
        self.stats.borrow_mut().registers_allocated += count;
    }

    pub fn record_spills(&self, count: usize) {
        self.stats.borrow_mut().spills_generated += count;
    }

    pub fn stats(&self) -> SessionStats {
        self.stats.borrow().clone()
    }
}

/// Translation session statistics.
#[derive(Debug, Default, Clone)]
pub struct SessionStats {
    pub kernels_translated: usize,

    pub passes_applied: usize,

    /// Statements rewritten, keyed by pass name.
    pub statements_rewritten: HashMap<String, usize>,

    /// Virtual registers that received a physical register.
    pub registers_allocated: usize,

    /// Virtual registers moved to scratch memory.
    pub spills_generated: usize,

    /// Target statements produced by lowering.
    pub statements_emitted: usize,

    pub largest_kernel_size: usize,

    pub largest_kernel_name: String,
}

impl fmt::Display for SessionStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Translation Session Statistics:")?;
        writeln!(f, "  Kernels translated: {}", self.kernels_translated)?;
        writeln!(f, "  Passes applied: {}", self.passes_applied)?;
        writeln!(f, "  Registers allocated: {}", self.registers_allocated)?;
        writeln!(f, "  Spills generated: {}", self.spills_generated)?;
        writeln!(f, "  Statements emitted: {}", self.statements_emitted)?;

        if !self.largest_kernel_name.is_empty() {
            writeln!(
                f,
                "  Largest kernel: {} ({} statements)",
                self.largest_kernel_name, self.largest_kernel_size
            )?;
        }

        if !self.statements_rewritten.is_empty() {
            writeln!(f, "  Statements rewritten:")?;
            let mut sorted: Vec<_> = self.statements_rewritten.iter().collect();
            sorted.sort_by(|a, b| b.1.cmp(a.1).then_with(|| a.0.cmp(b.0)));
            for (pass, count) in sorted {
                writeln!(f, "    {}: {}", pass, count)?;
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_creation() {
        let arena = Bump::new();
        let session = TranslationSession::new(&arena);

        let stats = session.stats();
        assert_eq!(stats.kernels_translated, 0);
        assert_eq!(stats.passes_applied, 0);
        assert!(session.current_kernel().is_none());
    }

    #[test]
    fn test_string_interning() {
        let arena = Bump::new();
        let session = TranslationSession::new(&arena);

        let s1 = session.intern_str("LOOP");
        let s2 = session.intern_str("LOOP");
        let s3 = session.intern_str("DONE");

        assert_eq!(s1.as_ptr(), s2.as_ptr());
        assert_ne!(s1.as_ptr(), s3.as_ptr());
    }

    #[test]
    fn test_session_statistics() {
        let arena = Bump::new();
        let session = TranslationSession::new(&arena);

        session.record_pass("remove-barriers", 2);
        session.record_pass("sync-elimination", 0);
        session.record_pass("remove-barriers", 1);
        session.record_registers_allocated(5);
        session.record_spills(1);
        session.record_kernel_translated("saxpy", 12);

        let stats = session.stats();
        assert_eq!(stats.passes_applied, 3);
        assert_eq!(stats.statements_rewritten["remove-barriers"], 3);
        assert_eq!(stats.registers_allocated, 5);
        assert_eq!(stats.spills_generated, 1);
        assert_eq!(stats.statements_emitted, 12);

        let output = stats.to_string();
        assert!(output.contains("Kernels translated: 1"));
        assert!(output.contains("saxpy (12 statements)"));
        assert!(output.contains("remove-barriers: 3"));
    }
}
