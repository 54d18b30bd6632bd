// This module implements the liveness analysis behind linear-scan allocation. Every
// statement gets a linear index in program order and each virtual register gets one
// interval [first occurrence, last occurrence] over those indices, ignoring basic
// block boundaries. Backward branches are the one place where linear order lies
// about liveness: a value that is live into a loop, or whose first occurrence inside
// the loop reads a value from the previous iteration, must stay allocated over the
// whole loop range. The analysis widens those intervals until nothing changes.
// Interval tables are built in the caller's bumpalo arena, like the rest of the
// per-run analysis data, and handed out as arena slices.

//! Live interval computation over linearized statement indices.

use bumpalo::collections::Vec as BumpVec;
use bumpalo::Bump;

use crate::ir::{Kernel, VReg};

/// Program-order span a virtual register must stay in a register.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LiveInterval {
    pub vreg: VReg,
    /// Index of the first statement referencing the register.
    pub start: usize,
    /// Index of the last statement referencing the register (inclusive).
    pub end: usize,
}

impl LiveInterval {
    pub fn overlaps(&self, other: &LiveInterval) -> bool {
        self.start <= other.end && other.start <= self.end
    }

    pub fn contains(&self, index: usize) -> bool {
        self.start <= index && index <= self.end
    }
}

/// Analysis results that own arena-allocated data.
#[derive(Debug)]
pub struct LivenessAnalysis<'arena> {
    /// Intervals sorted by start, ties broken by ascending register id.
    pub intervals: &'arena [LiveInterval],
    /// Backward branch ranges `(header, latch)` found in the kernel.
    pub loops: &'arena [(usize, usize)],
    pub statement_count: usize,
}

impl LivenessAnalysis<'_> {
    pub fn interval(&self, vreg: VReg) -> Option<&LiveInterval> {
        self.intervals.iter().find(|i| i.vreg == vreg)
    }

    /// Largest number of intervals covering a single statement.
    pub fn max_pressure(&self) -> usize {
        (0..self.statement_count)
            .map(|idx| self.intervals.iter().filter(|i| i.contains(idx)).count())
            .max()
            .unwrap_or(0)
    }
}

#[derive(Clone, Copy)]
struct Occurrence {
    first: usize,
    last: usize,
    /// First occurrence reads a value it did not define on every path.
    upward_exposed: bool,
}

/// Computes live intervals for a kernel.
pub struct Analyzer<'arena> {
    arena: &'arena Bump,
}

impl<'arena> Analyzer<'arena> {
    pub fn new(arena: &'arena Bump) -> Self {
        Self { arena }
    }

    pub fn analyze(&self, kernel: &Kernel) -> LivenessAnalysis<'arena> {
        let stmts = kernel.statements();
        let mut occ: BumpVec<'arena, Option<Occurrence>> =
            BumpVec::from_iter_in((0..kernel.register_count()).map(|_| None), self.arena);

        for (idx, stmt) in stmts.iter().enumerate() {
            for reg in stmt.uses() {
                Self::record(&mut occ, reg, idx, true);
            }
            if let Some(reg) = stmt.def() {
                Self::record(&mut occ, reg, idx, stmt.predicate.is_some());
            }
        }

        // -------- backward branches ---------
        let labels = kernel.label_positions();
        let mut loops = BumpVec::new_in(self.arena);
        for (idx, stmt) in stmts.iter().enumerate() {
            if let Some(&header) = stmt.branch_target().and_then(|t| labels.get(t)) {
                if header <= idx {
                    loops.push((header, idx));
                }
            }
        }

        let mut changed = !loops.is_empty();
        while changed {
            changed = false;
            for slot in occ.iter_mut().flatten() {
                for &(header, latch) in loops.iter() {
                    let live_in = slot.first < header && slot.last >= header;
                    let carried = slot.upward_exposed
                        && slot.first >= header
                        && slot.first <= latch;
                    if live_in && slot.last < latch {
                        slot.last = latch;
                        changed = true;
                    }
                    if carried && (slot.first > header || slot.last < latch) {
                        slot.first = header;
                        slot.last = slot.last.max(latch);
                        changed = true;
                    }
                }
            }
        }

        let mut intervals = BumpVec::with_capacity_in(occ.len(), self.arena);
        for (id, slot) in occ.iter().enumerate() {
            if let Some(o) = slot {
                intervals.push(LiveInterval { vreg: VReg(id as u32), start: o.first, end: o.last });
            }
        }
        intervals.sort_by_key(|i| (i.start, i.vreg));

        log::trace!(
            "liveness for `{}`: {} intervals, {} loops",
            kernel.name(),
            intervals.len(),
            loops.len()
        );

        LivenessAnalysis {
            intervals: intervals.into_bump_slice(),
            loops: loops.into_bump_slice(),
            statement_count: stmts.len(),
        }
    }

    fn record(occ: &mut [Option<Occurrence>], reg: VReg, idx: usize, exposed: bool) {
        let Some(slot) = occ.get_mut(reg.0 as usize) else {
            return;
        };
        match slot {
            None => *slot = Some(Occurrence { first: idx, last: idx, upward_exposed: exposed }),
            Some(o) => o.last = idx,
        }
    }
}
