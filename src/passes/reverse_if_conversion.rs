// This module reverses if-conversion. A front-end that flattened a conditional into
// predicated statements leaves behind a run of consecutive statements guarded by the
// same predicate. When such a run is long enough, guarding it with one branch is
// cheaper than predicating every statement: the run becomes `@!p bra SKIP`, the
// unpredicated body, and `SKIP:`. A run only qualifies while the predicate fully
// guards it: no labels, branches, returns or barriers inside, and no statement in
// it may redefine the predicate register, since the flattened form re-reads the
// guard on every statement. Fresh labels are picked from the `$Lrif_` namespace and
// never collide with existing labels; no registers are created.

//! Reverse if-conversion.

use crate::ir::{Kernel, Predicate, Statement};

/// Shortest predicated run worth a branch: the rewrite adds two statements.
pub const MIN_RUN: usize = 3;

const LABEL_PREFIX: &str = "$Lrif_";

/// Rewrite every qualifying run. Returns the number of statements that lost
/// their predicate.
pub fn run(kernel: &mut Kernel) -> usize {
    let mut rewritten = 0;
    let mut next_label = 0usize;
    let mut start = 0;

    while let Some((begin, end, guard)) = find_run(kernel.statements(), start) {
        let label = fresh_label(kernel, &mut next_label);
        log::trace!(
            "reverse-if-conversion: statements {}..{} guarded by {} -> {}",
            begin,
            end,
            guard,
            label
        );

        let body: Vec<Statement> = kernel.statements()[begin..end]
            .iter()
            .cloned()
            .map(|mut stmt| {
                stmt.predicate = None;
                stmt
            })
            .collect();
        let mut replacement = Vec::with_capacity(body.len() + 2);
        replacement.push(Statement::branch(label.clone()).guarded(guard.negate()));
        replacement.extend(body);
        replacement.push(Statement::label(label));

        rewritten += end - begin;
        start = begin + (end - begin) + 2;
        kernel.statements_mut().splice(begin..end, replacement);
    }
    rewritten
}

/// Next run at or after `from`, as `(begin, end, guard)`.
fn find_run(stmts: &[Statement], from: usize) -> Option<(usize, usize, Predicate)> {
    let mut i = from;
    while i < stmts.len() {
        let Some(guard) = stmts[i].predicate.filter(|g| convertible(&stmts[i], *g)) else {
            i += 1;
            continue;
        };
        let end = stmts[i..]
            .iter()
            .position(|s| s.predicate != Some(guard) || !convertible(s, guard))
            .map_or(stmts.len(), |len| i + len);
        if end - i >= MIN_RUN {
            return Some((i, end, guard));
        }
        i = end;
    }
    None
}

fn convertible(stmt: &Statement, guard: Predicate) -> bool {
    !stmt.is_label() && !stmt.is_barrier() && !stmt.info().is_terminator && stmt.def() != Some(guard.reg)
}

fn fresh_label(kernel: &Kernel, counter: &mut usize) -> String {
    let taken = kernel.label_positions();
    loop {
        let name = format!("{LABEL_PREFIX}{counter}");
        *counter += 1;
        if !taken.contains_key(name.as_str()) {
            return name;
        }
    }
}
