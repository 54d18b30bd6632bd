// This module derives the control-flow graph view of a kernel. Nothing here is
// stored on the kernel itself: a block starts at statement 0, at every label and
// after every branch, return or exit, and edges follow from the last statement of
// each block (fall-through to the next block unless control unconditionally
// leaves, plus a branch edge to the target label's block). Because the graph is
// rebuilt from statement order on demand it can never disagree with the
// statements a pass just rewrote. The DOT printer is what the `cfg` option
// exposes to diagnostic consumers.

//! Control-flow graph derived from statement order.

use std::fmt::Write as _;
use std::ops::Range;

use super::Kernel;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EdgeKind {
    /// Control reaches the next block by running off the end of this one.
    FallThrough,
    /// Control reaches the target through a `bra`.
    Branch,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Edge {
    pub from: usize,
    pub to: usize,
    pub kind: EdgeKind,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BasicBlock {
    pub id: usize,
    /// Label of the block's first statement, if it is one.
    pub label: Option<String>,
    /// Statement indices covered by the block.
    pub range: Range<usize>,
}

impl BasicBlock {
    pub fn len(&self) -> usize {
        self.range.len()
    }

    pub fn is_empty(&self) -> bool {
        self.range.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControlFlowGraph {
    name: String,
    blocks: Vec<BasicBlock>,
    edges: Vec<Edge>,
    /// Block id for every statement index.
    block_of: Vec<usize>,
    text: Vec<String>,
}

impl ControlFlowGraph {
    pub fn build(kernel: &Kernel) -> Self {
        let stmts = kernel.statements();
        let mut leaders = vec![false; stmts.len()];
        for (i, stmt) in stmts.iter().enumerate() {
            if i == 0 || stmt.is_label() {
                leaders[i] = true;
            }
            if stmt.info().is_terminator && i + 1 < stmts.len() {
                leaders[i + 1] = true;
            }
        }

        let mut blocks: Vec<BasicBlock> = Vec::new();
        let mut block_of = vec![0; stmts.len()];
        for (i, &leader) in leaders.iter().enumerate() {
            if leader {
                blocks.push(BasicBlock {
                    id: blocks.len(),
                    label: stmts[i].label_name().map(str::to_string),
                    range: i..i + 1,
                });
            } else if let Some(block) = blocks.last_mut() {
                block.range.end = i + 1;
            }
            block_of[i] = blocks.len() - 1;
        }

        let labels = kernel.label_positions();
        let mut edges = Vec::new();
        for block in &blocks {
            let last = &stmts[block.range.end - 1];
            let next = block.id + 1;
            if let Some(target) = last.branch_target() {
                if let Some(&pos) = labels.get(target) {
                    edges.push(Edge { from: block.id, to: block_of[pos], kind: EdgeKind::Branch });
                }
            }
            if !last.ends_flow() && next < blocks.len() {
                edges.push(Edge { from: block.id, to: next, kind: EdgeKind::FallThrough });
            }
        }

        Self {
            name: kernel.name().to_string(),
            blocks,
            edges,
            block_of,
            text: stmts.iter().map(|s| s.to_string()).collect(),
        }
    }

    pub fn blocks(&self) -> &[BasicBlock] {
        &self.blocks
    }

    pub fn edges(&self) -> &[Edge] {
        &self.edges
    }

    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    /// Block containing the statement at `index`.
    pub fn block_of(&self, index: usize) -> Option<usize> {
        self.block_of.get(index).copied()
    }

    pub fn successors(&self, block: usize) -> impl Iterator<Item = &Edge> + '_ {
        self.edges.iter().filter(move |e| e.from == block)
    }

    pub fn predecessors(&self, block: usize) -> impl Iterator<Item = &Edge> + '_ {
        self.edges.iter().filter(move |e| e.to == block)
    }

    /// Blocks reachable from the entry block.
    pub fn reachable(&self) -> Vec<bool> {
        let mut seen = vec![false; self.blocks.len()];
        let mut stack = Vec::new();
        if !self.blocks.is_empty() {
            stack.push(0);
        }
        while let Some(block) = stack.pop() {
            if std::mem::replace(&mut seen[block], true) {
                continue;
            }
            for edge in self.successors(block) {
                if !seen[edge.to] {
                    stack.push(edge.to);
                }
            }
        }
        seen
    }

    /// Graphviz rendering, one record node per block.
    pub fn to_dot(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "digraph \"{}\" {{", escape(&self.name));
        out.push_str("    node [shape=record, fontname=monospace];\n");
        for block in &self.blocks {
            let title = block.label.clone().unwrap_or_else(|| format!("BB_{}", block.id));
            let mut body = format!("{}|", escape(&title));
            for line in &self.text[block.range.clone()] {
                body.push_str(&escape(line.trim()));
                body.push_str("\\l");
            }
            let _ = writeln!(out, "    bb{} [label=\"{{{}}}\"];", block.id, body);
        }
        for edge in &self.edges {
            let style = match edge.kind {
                EdgeKind::FallThrough => "dashed",
                EdgeKind::Branch => "solid",
            };
            let _ = writeln!(out, "    bb{} -> bb{} [style={}];", edge.from, edge.to, style);
        }
        out.push_str("}\n");
        out
    }
}

fn escape(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        if matches!(c, '"' | '{' | '}' | '|' | '<' | '>' | '\\') {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

#[cfg(test)]
mod tests {
    use crate::ir::parse_kernel;

    use super::*;

    #[test]
    fn test_blocks_and_edges() {
        let kernel = parse_kernel(
            ".kernel k .arch ptx
                mov.s32 %r0, %tid.x;
                setp.lt.s32 %r1, %r0, 4;
                @%r1 bra SKIP;
                add.s32 %r0, %r0, 1;
            SKIP:
                ret;
            DEAD:
                exit;",
        )
        .unwrap();
        let cfg = kernel.cfg();
        assert_eq!(cfg.len(), 4);
        assert_eq!(cfg.blocks()[0].range, 0..3);
        assert_eq!(cfg.blocks()[2].label.as_deref(), Some("SKIP"));

        let succs: Vec<_> = cfg.successors(0).map(|e| (e.to, e.kind)).collect();
        assert_eq!(succs, vec![(2, EdgeKind::Branch), (1, EdgeKind::FallThrough)]);
        assert_eq!(cfg.successors(2).count(), 0);
        assert_eq!(cfg.reachable(), vec![true, true, true, false]);
    }

    #[test]
    fn test_empty_kernel() {
        let kernel = Kernel::new("empty", crate::arch::Architecture::Ptx);
        let cfg = kernel.cfg();
        assert!(cfg.is_empty());
        assert!(cfg.reachable().is_empty());
        assert!(cfg.to_dot().starts_with("digraph \"empty\""));
    }

    #[test]
    fn test_dot_output() {
        let kernel = parse_kernel(
            ".kernel k
                bra NEXT;
            NEXT:
                ret;",
        )
        .unwrap();
        let dot = kernel.cfg().to_dot();
        assert!(dot.contains("bb0 -> bb1 [style=solid];"));
        assert!(dot.contains("{NEXT|NEXT:\\lret;\\l}"));
    }
}
