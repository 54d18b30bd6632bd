// This module lowers kernels to AMD IL text. AMD IL has no predication and no
// arbitrary jumps: control flow is structured. Predicated statements are wrapped in
// `if_logicalnz`/`if_logicalz` ... `endif`. Branches are matched to three region
// shapes before anything is emitted: a predicated forward branch becomes an `if`
// around the statements it skips, a predicated forward branch whose skipped part
// ends in an unconditional jump right before the target label becomes
// `if ... else ... endif`, and a backward branch becomes `whileloop ... endloop`
// with a `break_logicalz`/`break_logicalnz` on the branch predicate. Regions must
// nest; a branch whose region overlaps another one partially, or an unconditional
// forward branch that is not the jump of an if/else, is rejected as unsupported.
// Integer, float and unsigned opcodes get their typed AMD IL mnemonics; `setp`
// comparisons AMD IL lacks (`le`, `gt`) swap their operands. Global memory goes
// through UAV 0, shared memory through LDS 1, and spill slots live in the indexed
// temp array `x0`.

//! AMD IL lowering.

use super::{physical, Lowering, LoweringError};
use crate::arch::Architecture;
use crate::core::assembler::TargetStatement;
use crate::ir::{AddressBase, Cmp, Kernel, Opcode, Operand, Space, SpecialReg, Statement, Type, VReg};
use crate::regalloc::AllocationResult;

#[derive(Debug, Default)]
pub struct AmdilLowering;

impl AmdilLowering {
    pub fn new() -> Self {
        Self
    }
}

fn unsupported(stmt: &Statement, index: usize) -> LoweringError {
    LoweringError::UnsupportedOperation {
        index,
        mnemonic: stmt.mnemonic(),
        target: Architecture::Amdil,
    }
}

fn special(reg: SpecialReg) -> Option<&'static str> {
    Some(match reg {
        SpecialReg::TidX => "vTidInGrp0.x",
        SpecialReg::TidY => "vTidInGrp0.y",
        SpecialReg::TidZ => "vTidInGrp0.z",
        SpecialReg::CtaidX => "vThreadGrpId0.x",
        SpecialReg::NctaidX => "cb0[0].x",
        SpecialReg::NtidX => "cb0[1].x",
        SpecialReg::LaneId => return None,
    })
}

/// Mnemonic for `stmt`, and whether its two source operands swap.
fn mnemonic(stmt: &Statement) -> Option<(&'static str, bool)> {
    let float = stmt.ty == Some(Type::F32);
    let unsigned = matches!(stmt.ty, Some(Type::U32 | Type::U64));
    let pick = |f: &'static str, u: &'static str, i: &'static str| {
        if float {
            f
        } else if unsigned {
            u
        } else {
            i
        }
    };
    let name = match stmt.op {
        Opcode::Mov => "mov",
        Opcode::Add => pick("add", "iadd", "iadd"),
        Opcode::Sub => pick("sub", "isub", "isub"),
        Opcode::Mul => pick("mul", "umul", "imul"),
        Opcode::Mad => pick("mad", "umad", "imad"),
        Opcode::Div => pick("div", "udiv", "idiv"),
        Opcode::Rem => pick("mod", "umod", "imod"),
        Opcode::Min => pick("min", "umin", "imin"),
        Opcode::Max => pick("max", "umax", "imax"),
        Opcode::And => "iand",
        Opcode::Or => "ior",
        Opcode::Xor => "ixor",
        Opcode::Not => "inot",
        Opcode::Shl => "ishl",
        Opcode::Shr => pick("ishr", "ushr", "ishr"),
        Opcode::Selp => "cmov_logical",
        Opcode::Setp(cmp) => {
            let (f, u, i) = match cmp {
                Cmp::Eq => ("eq", "ieq", "ieq"),
                Cmp::Ne => ("ne", "ine", "ine"),
                Cmp::Lt | Cmp::Gt => ("lt", "ult", "ilt"),
                Cmp::Ge | Cmp::Le => ("ge", "uge", "ige"),
            };
            return Some((pick(f, u, i), matches!(cmp, Cmp::Gt | Cmp::Le)));
        }
        Opcode::Ld(Space::Global) => "uav_raw_load_id(0)",
        Opcode::Ld(Space::Shared) => "lds_load_id(1)",
        Opcode::St(Space::Global) => "uav_raw_store_id(0)",
        Opcode::St(Space::Shared) => "lds_store_id(1)",
        Opcode::AtomAdd(Space::Global) => "uav_read_add_id(0)",
        Opcode::AtomAdd(Space::Shared) => "lds_read_add_id(1)",
        Opcode::Bar => "fence_threads_lds",
        Opcode::Ret | Opcode::Exit => "ret_dyn",
        _ => return None,
    };
    Some((name, false))
}

struct Emitter<'a> {
    allocation: &'a AllocationResult,
    out: Vec<TargetStatement>,
}

impl Emitter<'_> {
    fn reg(&self, vreg: VReg, index: usize) -> Result<String, LoweringError> {
        Ok(format!("r{}", physical(self.allocation, vreg, index)?.0))
    }

    fn operand(&self, stmt: &Statement, op: &Operand, index: usize) -> Result<String, LoweringError> {
        Ok(match op {
            Operand::Reg(vreg) => self.reg(*vreg, index)?,
            Operand::Imm(value) => value.to_string(),
            Operand::Special(reg) => special(*reg).ok_or_else(|| unsupported(stmt, index))?.to_string(),
            Operand::Label(_) => return Err(unsupported(stmt, index)),
            Operand::Address { base, offset } => {
                let base = match base {
                    AddressBase::Reg(vreg) => self.reg(*vreg, index)?,
                    AddressBase::Symbol(symbol) => symbol.clone(),
                };
                match offset {
                    0 => base,
                    o if *o < 0 => format!("{base}{o}"),
                    o => format!("{base}+{o}"),
                }
            }
        })
    }

    fn emit(&mut self, opcode: &str, operands: Vec<String>) {
        self.out.push(TargetStatement::instruction(opcode, operands).unterminated());
    }

    fn open_if(&mut self, stmt: &Statement, index: usize, run_when_true: bool) -> Result<(), LoweringError> {
        let Some(p) = stmt.predicate else {
            return Ok(());
        };
        let reg = self.reg(p.reg, index)?;
        let opcode = if run_when_true != p.negated { "if_logicalnz" } else { "if_logicalz" };
        self.emit(opcode, vec![reg]);
        Ok(())
    }

    /// Close a loop at its latch; `@p bra HEAD` repeats while `p` holds.
    fn close_loop(&mut self, stmt: &Statement, index: usize) -> Result<(), LoweringError> {
        if let Some(p) = stmt.predicate {
            let reg = self.reg(p.reg, index)?;
            let opcode = if p.negated { "break_logicalnz" } else { "break_logicalz" };
            self.emit(opcode, vec![reg]);
        }
        self.emit("endloop", vec![]);
        Ok(())
    }

    fn spills_before(&mut self, index: usize) {
        let reloads: Vec<_> = self.allocation.reloads_before(index).map(|(s, r)| (s.slot, r)).collect();
        for (slot, reg) in reloads {
            self.emit("mov", vec![format!("r{}", reg.0), format!("x0[{slot}]")]);
        }
    }

    fn spills_after(&mut self, index: usize) {
        let stores: Vec<_> = self.allocation.stores_after(index).map(|(s, r)| (s.slot, r)).collect();
        for (slot, reg) in stores {
            self.emit("mov", vec![format!("x0[{slot}]"), format!("r{}", reg.0)]);
        }
    }
}

/// Structured region opened or closed by a branch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Region {
    /// `@p bra END` over the statements before the label at `end`.
    If { end: usize },
    /// `@p bra ELSE` whose skipped part ends in the `bra JOIN` at `jump`.
    IfElse { jump: usize, join: usize },
    /// `bra HEAD` back to the label at `head`.
    Loop { head: usize },
}

impl Region {
    /// Inclusive statement range the region emits around.
    fn span(self, branch: usize) -> (usize, usize) {
        match self {
            Region::If { end } => (branch, end - 1),
            Region::IfElse { join, .. } => (branch, join - 1),
            Region::Loop { head } => (head, branch),
        }
    }
}

/// Regions keyed by the index of their branch, in branch order.
fn regions(kernel: &Kernel) -> Result<Vec<(usize, Region)>, LoweringError> {
    let stmts = kernel.statements();
    let labels = kernel.label_positions();
    let target = |stmt: &Statement| stmt.branch_target().and_then(|t| labels.get(t).copied());

    let mut regions = Vec::new();
    let mut jumps = hashbrown::HashSet::new();
    for (index, stmt) in stmts.iter().enumerate() {
        if stmt.op != Opcode::Bra {
            continue;
        }
        let Some(dest) = target(stmt) else {
            return Err(unsupported(stmt, index));
        };
        if dest < index {
            regions.push((index, Region::Loop { head: dest }));
        } else if stmt.predicate.is_some() {
            let jump = dest - 1;
            let join = stmts
                .get(jump)
                .filter(|s| jump > index && s.op == Opcode::Bra && s.predicate.is_none())
                .and_then(target)
                .filter(|&join| join > dest);
            match join {
                Some(join) => {
                    if !jumps.insert(jump) {
                        return Err(unsupported(stmt, index));
                    }
                    regions.push((index, Region::IfElse { jump, join }));
                }
                None => regions.push((index, Region::If { end: dest })),
            }
        }
    }

    for &(branch, region) in &regions {
        let (start, end) = region.span(branch);
        for &(other, inner) in &regions {
            let (s, e) = inner.span(other);
            let disjoint = end < s || e < start;
            let nested = (start <= s && e <= end) || (s <= start && end <= e);
            if !disjoint && !nested {
                return Err(unsupported(&stmts[branch], branch));
            }
            // Nothing inside an if/else may straddle its `else`.
            if let Region::IfElse { jump, .. } = region {
                if other != branch && start <= s && e <= end && s <= jump && jump <= e {
                    return Err(unsupported(&stmts[other], other));
                }
            }
        }
    }
    Ok(regions)
}

impl Lowering for AmdilLowering {
    fn target_name(&self) -> &str {
        "amdil"
    }

    fn lower(
        &self,
        kernel: &Kernel,
        allocation: &AllocationResult,
    ) -> Result<Vec<TargetStatement>, LoweringError> {
        let regions = regions(kernel)?;
        let mut endifs: hashbrown::HashMap<usize, usize> = hashbrown::HashMap::new();
        let mut heads: hashbrown::HashMap<usize, usize> = hashbrown::HashMap::new();
        let mut elses = hashbrown::HashSet::new();
        for (_, region) in &regions {
            match *region {
                Region::If { end } => *endifs.entry(end).or_insert(0) += 1,
                Region::IfElse { jump, join } => {
                    *endifs.entry(join).or_insert(0) += 1;
                    elses.insert(jump);
                }
                Region::Loop { head } => *heads.entry(head).or_insert(0) += 1,
            }
        }
        let branches: hashbrown::HashMap<usize, Region> = regions.into_iter().collect();

        let mut e = Emitter { allocation, out: Vec::new() };
        e.out.push(TargetStatement::directive("il_cs_2_0"));
        e.out.push(TargetStatement::directive(format!("; kernel {}", kernel.name())));
        if allocation.has_spills() {
            e.out.push(TargetStatement::directive(format!(
                "dcl_indexed_temp_array x0[{}]",
                allocation.spills.len()
            )));
        }

        for (index, stmt) in kernel.statements().iter().enumerate() {
            if let Some(label) = stmt.label_name() {
                for _ in 0..endifs.get(&index).copied().unwrap_or(0) {
                    e.emit("endif", vec![]);
                }
                e.out.push(TargetStatement::directive(format!("; {label}:")));
                for _ in 0..heads.get(&index).copied().unwrap_or(0) {
                    e.emit("whileloop", vec![]);
                }
                continue;
            }

            if stmt.op == Opcode::Bra {
                match branches.get(&index) {
                    Some(Region::Loop { .. }) => {
                        e.spills_before(index);
                        e.close_loop(stmt, index)?;
                    }
                    Some(_) => {
                        e.spills_before(index);
                        // The skipped statements run when the branch is not taken.
                        e.open_if(stmt, index, false)?;
                    }
                    None if elses.contains(&index) => e.emit("else", vec![]),
                    None => return Err(unsupported(stmt, index)),
                }
                continue;
            }

            e.spills_before(index);
            let (opcode, swap) = mnemonic(stmt).ok_or_else(|| unsupported(stmt, index))?;
            let mut operands = Vec::with_capacity(stmt.operands.len());
            for op in &stmt.operands {
                operands.push(e.operand(stmt, op, index)?);
            }
            if stmt.op == Opcode::Bar {
                operands.clear();
            }
            if swap && operands.len() == 3 {
                operands.swap(1, 2);
            }
            if stmt.op == Opcode::Selp && operands.len() == 4 {
                // selp d, a, b, p  ->  cmov_logical d, p, a, b
                let pred = operands.remove(3);
                operands.insert(1, pred);
            }

            e.open_if(stmt, index, true)?;
            e.emit(opcode, operands);
            if stmt.predicate.is_some() {
                e.emit("endif", vec![]);
            }
            e.spills_after(index);
        }

        e.emit("end", vec![]);
        log::debug!(
            "amdil lowering of `{}`: {} statements, {} structured regions",
            kernel.name(),
            e.out.len(),
            branches.len()
        );
        Ok(e.out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::assembler::assemble;
    use crate::ir::parse_kernel;
    use crate::regalloc::{allocate, AllocationRequest};

    fn lower(text: &str) -> Result<String, LoweringError> {
        let kernel = parse_kernel(text).unwrap();
        let allocation = allocate(&kernel, &AllocationRequest::new(16)).unwrap();
        AmdilLowering::new().lower(&kernel, &allocation).map(|s| assemble(&s))
    }

    #[test]
    fn test_straight_line() {
        let code = lower(
            ".kernel k
                mov.s32 %r0, %tid.x;
                ld.global.s32 %r1, [%r0+4];
                setp.gt.s32 %r2, %r1, 16;
                selp.s32 %r3, %r1, 0, %r2;
                st.shared.s32 [%r0], %r3;
                bar.sync 0;
                ret;",
        )
        .unwrap();
        assert_eq!(
            code,
            "il_cs_2_0
; kernel k
    mov r0, vTidInGrp0.x
    uav_raw_load_id(0) r1, r0+4
    ilt r2, 16, r1
    cmov_logical r3, r2, r1, 0
    lds_store_id(1) r0, r3
    fence_threads_lds
    ret_dyn
    end
"
        );
    }

    #[test]
    fn test_predication_becomes_if() {
        let code = lower(
            ".kernel k
                setp.eq.s32 %r0, %tid.x, 0;
                @!%r0 st.global.s32 [out], 1;
                ret;",
        )
        .unwrap();
        assert!(code.contains("    if_logicalz r0\n    uav_raw_store_id(0) out, 1\n    endif\n"));
    }

    #[test]
    fn test_forward_branch_becomes_if() {
        let code = lower(
            ".kernel k
                setp.eq.s32 %r0, %tid.x, 0;
                @!%r0 bra SKIP;
                st.global.s32 [out], 1;
                st.global.s32 [out+4], 2;
            SKIP:
                ret;",
        )
        .unwrap();
        assert!(code.contains(
            "    if_logicalnz r0\n    uav_raw_store_id(0) out, 1\n    uav_raw_store_id(0) out+4, 2\n    endif\n; SKIP:\n"
        ));
    }

    #[test]
    fn test_backward_branch_becomes_loop() {
        let code = lower(
            ".kernel k
                mov.s32 %r0, 0;
            LOOP:
                add.s32 %r0, %r0, 1;
                setp.lt.s32 %r1, %r0, 8;
                @%r1 bra LOOP;
                st.global.s32 [out], %r0;
                ret;",
        )
        .unwrap();
        assert_eq!(
            code,
            "il_cs_2_0
; kernel k
    mov r0, 0
; LOOP:
    whileloop
    iadd r0, r0, 1
    ilt r1, r0, 8
    break_logicalz r1
    endloop
    uav_raw_store_id(0) out, r0
    ret_dyn
    end
"
        );
    }

    #[test]
    fn test_diamond_becomes_if_else() {
        let code = lower(
            ".kernel k
                setp.eq.s32 %r0, %tid.x, 0;
                @%r0 bra ELSE;
                mov.s32 %r1, 1;
                bra JOIN;
            ELSE:
                mov.s32 %r1, 2;
            JOIN:
                st.global.s32 [out], %r1;
                ret;",
        )
        .unwrap();
        assert!(code.contains(
            "    if_logicalz r0\n    mov r0, 1\n    else\n; ELSE:\n    mov r0, 2\n    endif\n; JOIN:\n"
        ));
    }

    #[test]
    fn test_nested_regions() {
        let code = lower(
            ".kernel k
                mov.s32 %r0, 0;
            LOOP:
                setp.eq.s32 %r1, %r0, 4;
                @!%r1 bra SKIP;
                st.global.s32 [out], %r0;
            SKIP:
                add.s32 %r0, %r0, 1;
                setp.lt.s32 %r1, %r0, 8;
                @!%r1 bra LOOP;
                ret;",
        )
        .unwrap();
        let body: Vec<&str> = code.lines().map(str::trim).skip(3).collect();
        assert_eq!(
            body,
            [
                "; LOOP:",
                "whileloop",
                "ieq r1, r0, 4",
                "if_logicalnz r1",
                "uav_raw_store_id(0) out, r0",
                "endif",
                "; SKIP:",
                "iadd r0, r0, 1",
                "ilt r1, r0, 8",
                "break_logicalnz r1",
                "endloop",
                "ret_dyn",
                "end",
            ]
        );
    }

    #[test]
    fn test_crossing_branches_rejected() {
        let err = lower(
            ".kernel k
                setp.eq.s32 %r0, %tid.x, 0;
                @%r0 bra INSIDE;
            LOOP:
                add.s32 %r1, %r1, 1;
            INSIDE:
                setp.lt.s32 %r2, %r1, 8;
                @%r2 bra LOOP;
                ret;",
        )
        .unwrap_err();
        assert_eq!(
            err,
            LoweringError::UnsupportedOperation { index: 1, mnemonic: "bra".into(), target: Architecture::Amdil }
        );

        let err = lower(".kernel k\n    bra END;\n    ret;\nEND:\n    ret;").unwrap_err();
        assert!(matches!(err, LoweringError::UnsupportedOperation { index: 0, .. }));
    }

    #[test]
    fn test_param_space_rejected() {
        assert!(matches!(
            lower(".kernel k\n    ld.param.s32 %r0, [arg];\n    ret;"),
            Err(LoweringError::UnsupportedOperation { index: 0, .. })
        ));
    }
}
