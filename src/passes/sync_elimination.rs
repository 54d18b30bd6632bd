// This module implements sync elimination, the coarse barrier cleanup that runs
// last. It works on the control-flow graph instead of straight-line windows: first
// every barrier in a block unreachable from the entry is dropped, then two must
// analyses alternate. The forward one computes, for every block entry, whether on
// all incoming paths no CTA-visible memory access happened since the last
// barrier (or since kernel entry); a barrier reached in that state orders
// nothing and goes. The backward one computes whether on all outgoing paths no
// CTA-visible access happens before the next barrier or the end of the thread;
// a barrier followed by that state goes as well. The two directions are never
// applied in the same round, since each can justify removing a barrier only
// while the other one is still present. Rounds repeat until neither direction
// finds anything.

//! CFG-based barrier elimination.

use crate::ir::{ControlFlowGraph, Kernel, Opcode, Statement};

/// Eliminate barriers until a fixpoint. Returns the number removed.
pub fn run(kernel: &mut Kernel) -> usize {
    let mut removed = remove(kernel, unreachable_barriers(kernel));
    loop {
        let forward = remove(kernel, forward_redundant(kernel));
        let backward = remove(kernel, backward_redundant(kernel));
        removed += forward + backward;
        if forward + backward == 0 {
            break;
        }
    }
    removed
}

fn remove(kernel: &mut Kernel, mut indices: Vec<usize>) -> usize {
    indices.sort_unstable();
    indices.dedup();
    for &index in indices.iter().rev() {
        kernel.statements_mut().remove(index);
    }
    if !indices.is_empty() {
        log::trace!("sync-elimination: removed barriers at {:?} in `{}`", indices, kernel.name());
    }
    indices.len()
}

fn unreachable_barriers(kernel: &Kernel) -> Vec<usize> {
    let cfg = kernel.cfg();
    let reachable = cfg.reachable();
    cfg.blocks()
        .iter()
        .filter(|block| !reachable[block.id])
        .flat_map(|block| block.range.clone())
        .filter(|&i| kernel.statements()[i].is_barrier())
        .collect()
}

/// State after `stmt` walking forwards: `true` while no CTA-visible access
/// happened since the last barrier.
fn step_forward(stmt: &Statement, synced: bool) -> bool {
    if stmt.is_barrier() && stmt.predicate.is_none() {
        true
    } else if stmt.touches_cta_memory() {
        false
    } else {
        synced
    }
}

/// State before `stmt` walking backwards: `true` while no CTA-visible access
/// happens before the next barrier or thread exit.
fn step_backward(stmt: &Statement, synced: bool) -> bool {
    let unconditional = stmt.predicate.is_none();
    if stmt.is_barrier() && unconditional {
        true
    } else if matches!(stmt.op, Opcode::Ret | Opcode::Exit) && unconditional {
        true
    } else if stmt.touches_cta_memory() {
        false
    } else {
        synced
    }
}

fn forward_redundant(kernel: &Kernel) -> Vec<usize> {
    let cfg = kernel.cfg();
    let stmts = kernel.statements();
    let entry = solve(&cfg, |block, state| {
        cfg.blocks()[block].range.clone().fold(state, |s, i| step_forward(&stmts[i], s))
    }, Direction::Forward);

    let mut redundant = Vec::new();
    for block in cfg.blocks() {
        let mut synced = entry[block.id];
        for i in block.range.clone() {
            let stmt = &stmts[i];
            if stmt.is_barrier() && stmt.predicate.is_none() && synced {
                redundant.push(i);
            }
            synced = step_forward(stmt, synced);
        }
    }
    redundant
}

fn backward_redundant(kernel: &Kernel) -> Vec<usize> {
    let cfg = kernel.cfg();
    let stmts = kernel.statements();
    let exit = solve(&cfg, |block, state| {
        cfg.blocks()[block].range.clone().rev().fold(state, |s, i| step_backward(&stmts[i], s))
    }, Direction::Backward);

    let mut redundant = Vec::new();
    for block in cfg.blocks() {
        let mut synced = exit[block.id];
        for i in block.range.clone().rev() {
            let stmt = &stmts[i];
            if stmt.is_barrier() && stmt.predicate.is_none() && synced {
                redundant.push(i);
            }
            synced = step_backward(stmt, synced);
        }
    }
    redundant
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Direction {
    Forward,
    Backward,
}

/// Must-analysis over the CFG with optimistic initialisation.
///
/// Returns the state on block entry (forward) or block exit (backward).
/// `transfer` maps that state through the whole block.
fn solve(
    cfg: &ControlFlowGraph,
    transfer: impl Fn(usize, bool) -> bool,
    direction: Direction,
) -> Vec<bool> {
    let n = cfg.len();
    let mut input = vec![true; n];
    let mut output: Vec<bool> = (0..n).map(|b| transfer(b, true)).collect();

    let mut changed = true;
    while changed {
        changed = false;
        for block in 0..n {
            let mut state = true;
            match direction {
                Direction::Forward => {
                    for edge in cfg.predecessors(block) {
                        state &= output[edge.from];
                    }
                }
                Direction::Backward => {
                    for edge in cfg.successors(block) {
                        state &= output[edge.to];
                    }
                }
            }
            if state != input[block] {
                input[block] = state;
                output[block] = transfer(block, state);
                changed = true;
            }
        }
    }
    input
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::parse_kernel;

    fn barriers(kernel: &Kernel) -> Vec<usize> {
        kernel
            .statements()
            .iter()
            .enumerate()
            .filter(|(_, s)| s.is_barrier())
            .map(|(i, _)| i)
            .collect()
    }

    #[test]
    fn test_unreachable_barriers_dropped() {
        let mut kernel = parse_kernel(
            ".kernel k
                st.shared.s32 [buf], %r0;
                ret;
            DEAD:
                bar.sync 0;
                ld.shared.s32 %r1, [buf];
                exit;",
        )
        .unwrap();
        assert_eq!(run(&mut kernel), 1);
        assert!(barriers(&kernel).is_empty());
    }

    #[test]
    fn test_barrier_synced_on_all_paths() {
        // Both arms end with a barrier and touch nothing afterwards, so the
        // barrier at the join orders nothing.
        let mut kernel = parse_kernel(
            ".kernel k
                setp.eq.s32 %r0, %tid.x, 0;
                @%r0 bra ELSE;
                st.shared.s32 [buf], 1;
                bar.sync 0;
                bra JOIN;
            ELSE:
                st.shared.s32 [buf], 2;
                bar.sync 0;
            JOIN:
                bar.sync 0;
                ld.shared.s32 %r1, [buf];
                st.global.s32 [out], %r1;
                ret;",
        )
        .unwrap();
        assert_eq!(run(&mut kernel), 1);
        assert_eq!(barriers(&kernel), vec![3, 7]);
    }

    #[test]
    fn test_one_dirty_path_keeps_barrier() {
        let text = ".kernel k
                setp.eq.s32 %r0, %tid.x, 0;
                @%r0 bra JOIN;
                st.shared.s32 [buf], 1;
            JOIN:
                bar.sync 0;
                ld.shared.s32 %r1, [buf];
                st.global.s32 [out], %r1;
                ret;";
        let mut kernel = parse_kernel(text).unwrap();
        assert_eq!(run(&mut kernel), 0);
        assert_eq!(kernel, parse_kernel(text).unwrap());
    }

    #[test]
    fn test_loop_barrier_kept() {
        let text = ".kernel k
                mov.s32 %r0, 0;
            LOOP:
                ld.shared.s32 %r1, [buf];
                bar.sync 0;
                st.shared.s32 [buf], %r1;
                add.s32 %r0, %r0, 1;
                setp.lt.s32 %r2, %r0, 8;
                @%r2 bra LOOP;
                ret;";
        let mut kernel = parse_kernel(text).unwrap();
        assert_eq!(run(&mut kernel), 0);
        assert_eq!(kernel, parse_kernel(text).unwrap());
    }

    #[test]
    fn test_directions_not_mixed() {
        // Each barrier is redundant in one direction only; removing both
        // would lose the ordering between the store and the load.
        let mut kernel = parse_kernel(
            ".kernel k
                st.shared.s32 [buf], %r0;
                bar.sync 0;
                bar.sync 0;
                ld.shared.s32 %r1, [buf];
                ret;",
        )
        .unwrap();
        assert_eq!(run(&mut kernel), 1);
        assert_eq!(barriers(&kernel).len(), 1);
    }

    #[test]
    fn test_barrier_before_exit_on_every_path() {
        let mut kernel = parse_kernel(
            ".kernel k
                st.shared.s32 [buf], %r0;
                setp.eq.s32 %r1, %tid.x, 0;
                @%r1 bra OUT;
                mov.s32 %r2, 1;
            OUT:
                bar.sync 0;
                ret;",
        )
        .unwrap();
        assert_eq!(run(&mut kernel), 1);
        assert!(barriers(&kernel).is_empty());
    }

    #[test]
    fn test_idempotent() {
        let mut kernel = parse_kernel(
            ".kernel k
                bar.sync 0;
                st.shared.s32 [buf], %r0;
                bar.sync 0;
                ld.shared.s32 %r1, [buf];
                bar.sync 0;
                ret;",
        )
        .unwrap();
        assert_eq!(run(&mut kernel), 2);
        let once = kernel.clone();
        assert_eq!(run(&mut kernel), 0);
        assert_eq!(kernel, once);
    }
}
