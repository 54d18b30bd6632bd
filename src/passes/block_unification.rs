//! Block unification.
//!
//! Two adjacent blocks are merged when the first one ends without a
//! terminator, so its only edge is the fall-through into the second, and the
//! second block is entered by nothing else. Merging just drops the label that
//! started the second block. An unpredicated `bra` to the label that directly
//! follows it is a disguised fall-through and is dropped first, which can
//! expose another merge.

use crate::ir::{ControlFlowGraph, EdgeKind, Kernel, Opcode, Statement};

/// Merge blocks until no candidate is left. Returns the number of statements
/// removed.
pub fn run(kernel: &mut Kernel) -> usize {
    let mut removed = 0;
    while let Some(index) = find_candidate(kernel) {
        log::trace!("block-unification: dropping `{}`", kernel.statements()[index].to_string().trim());
        kernel.statements_mut().remove(index);
        removed += 1;
    }
    removed
}

fn find_candidate(kernel: &Kernel) -> Option<usize> {
    let stmts = kernel.statements();
    if let Some(index) = stmts.windows(2).position(|pair| is_jump_to_next(&pair[0], &pair[1])) {
        return Some(index);
    }

    let cfg = kernel.cfg();
    cfg.blocks()
        .iter()
        .skip(1)
        .filter(|block| block.label.is_some())
        .find(|block| is_mergeable(kernel, &cfg, block.id))
        .map(|block| block.range.start)
}

fn is_jump_to_next(stmt: &Statement, next: &Statement) -> bool {
    stmt.op == Opcode::Bra
        && stmt.predicate.is_none()
        && stmt.branch_target().is_some()
        && stmt.branch_target() == next.label_name()
}

fn is_mergeable(kernel: &Kernel, cfg: &ControlFlowGraph, block: usize) -> bool {
    let prev = &cfg.blocks()[block - 1];
    let prev_last = &kernel.statements()[prev.range.end - 1];
    if prev_last.info().is_terminator {
        return false;
    }

    let mut preds = cfg.predecessors(block);
    let only_fall_through = matches!(
        (preds.next(), preds.next()),
        (Some(edge), None) if edge.kind == EdgeKind::FallThrough && edge.from == prev.id
    );
    only_fall_through && cfg.successors(prev.id).count() == 1
}
