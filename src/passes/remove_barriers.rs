//! Redundant barrier removal.
//!
//! A `bar.sync` orders the CTA-visible memory accesses before it against the
//! ones after it. It is redundant when one of its sides is clean:
//!
//! * walking backwards, another unpredicated barrier or the kernel entry is
//!   reached before any CTA-visible access or label (a label means other
//!   paths join in and the walk proves nothing), or
//! * walking forwards, another unpredicated barrier or an unpredicated
//!   `ret`/`exit` is reached before any CTA-visible access or branch.
//!
//! Predicated barriers may not execute, so they are never removed and never
//! end a clean walk. Barriers are removed one at a time because removing one
//! changes what its neighbours can see.

use crate::ir::{Kernel, Opcode, Statement};

/// Remove redundant barriers until none is left. Returns the number removed.
pub fn run(kernel: &mut Kernel) -> usize {
    let mut removed = 0;
    while let Some(index) = find_redundant(kernel.statements()) {
        log::trace!("remove-barriers: barrier at {} in `{}` is redundant", index, kernel.name());
        kernel.statements_mut().remove(index);
        removed += 1;
    }
    removed
}

fn find_redundant(stmts: &[Statement]) -> Option<usize> {
    (0..stmts.len()).find(|&i| {
        let stmt = &stmts[i];
        stmt.is_barrier() && stmt.predicate.is_none() && (clean_before(stmts, i) || clean_after(stmts, i))
    })
}

fn clean_before(stmts: &[Statement], index: usize) -> bool {
    for stmt in stmts[..index].iter().rev() {
        if stmt.is_barrier() {
            return stmt.predicate.is_none();
        }
        if stmt.is_label() || stmt.touches_cta_memory() {
            return false;
        }
    }
    true
}

fn clean_after(stmts: &[Statement], index: usize) -> bool {
    for stmt in &stmts[index + 1..] {
        if stmt.is_barrier() {
            return stmt.predicate.is_none();
        }
        match stmt.op {
            Opcode::Ret | Opcode::Exit => return stmt.predicate.is_none(),
            Opcode::Bra => return false,
            _ if stmt.touches_cta_memory() => return false,
            _ => {}
        }
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::parse_kernel;

    fn barriers(kernel: &Kernel) -> usize {
        kernel.statements().iter().filter(|s| s.is_barrier()).count()
    }

    #[test]
    fn test_keeps_barrier_between_producer_and_consumer() {
        let mut kernel = parse_kernel(
            ".kernel k
                st.shared.s32 [buf], %r0;
                bar.sync 0;
                ld.shared.s32 %r1, [buf+4];
                bar.sync 0;
                ret;",
        )
        .unwrap();
        assert_eq!(run(&mut kernel), 1);
        assert_eq!(barriers(&kernel), 1);
        assert!(kernel.statements()[1].is_barrier());
    }

    #[test]
    fn test_back_to_back_barriers_collapse() {
        let mut kernel = parse_kernel(
            ".kernel k
                st.shared.s32 [buf], %r0;
                bar.sync 0;
                bar.sync 0;
                bar.sync 0;
                ld.shared.s32 %r1, [buf];
                st.global.s32 [out], %r1;
                ret;",
        )
        .unwrap();
        assert_eq!(run(&mut kernel), 2);
        assert_eq!(barriers(&kernel), 1);
    }

    #[test]
    fn test_local_memory_does_not_need_barrier() {
        let mut kernel = parse_kernel(
            ".kernel k
                ld.global.s32 %r0, [in];
                bar.sync 0;
                st.local.s32 [tmp], %r0;
                ld.local.s32 %r1, [tmp];
                ret;",
        )
        .unwrap();
        assert_eq!(run(&mut kernel), 1);
        assert_eq!(barriers(&kernel), 0);
    }

    #[test]
    fn test_labels_and_branches_block_removal() {
        let text = ".kernel k
                st.shared.s32 [buf], %r0;
            TOP:
                bar.sync 0;
                ld.shared.s32 %r1, [buf];
                setp.lt.s32 %r2, %r1, 4;
                @%r2 bra TOP;
                ret;";
        let mut kernel = parse_kernel(text).unwrap();
        assert_eq!(run(&mut kernel), 0);
        assert_eq!(kernel, parse_kernel(text).unwrap());
    }

    #[test]
    fn test_predicated_barrier_kept() {
        let mut kernel = parse_kernel(
            ".kernel k
                setp.eq.s32 %r0, %tid.x, 0;
                @%r0 bar.sync 0;
                ret;",
        )
        .unwrap();
        assert_eq!(run(&mut kernel), 0);
        assert_eq!(barriers(&kernel), 1);
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
        run(&mut kernel);
        let once = kernel.clone();
        assert_eq!(run(&mut kernel), 0);
        assert_eq!(kernel, once);
    }
}
