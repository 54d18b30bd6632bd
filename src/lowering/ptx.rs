//! PTX lowering.
//!
//! The kernel keeps its PTX shape; virtual registers are renamed to their
//! physical registers in one of three banks: `%pN` for predicates, `%rdN`
//! for 64-bit values and `%rN` for everything else. The banks share physical
//! numbers, so a register's number is the same whatever bank names it.
//! Spilled values go through a `.local` array: `ld.local` before each use,
//! `st.local` after each definition. A spilled predicate travels through the
//! `%rN` register of its scratch number.

use super::{physical, register_span, Lowering, LoweringError};
use crate::core::assembler::TargetStatement;
use crate::ir::{AddressBase, Kernel, Opcode, Operand, Statement, Type, VReg};
use crate::regalloc::{AllocationResult, SpillRecord};

const SPILL_ARRAY: &str = "__spill";

/// PTX register bank of a virtual register.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum Bank {
    B32,
    B64,
    Pred,
}

impl Bank {
    const ALL: [Bank; 3] = [Bank::Pred, Bank::B32, Bank::B64];

    fn prefix(self) -> &'static str {
        match self {
            Bank::Pred => "%p",
            Bank::B32 => "%r",
            Bank::B64 => "%rd",
        }
    }

    fn decl(self) -> &'static str {
        match self {
            Bank::Pred => ".pred",
            Bank::B32 => ".b32",
            Bank::B64 => ".b64",
        }
    }
}

/// Bank of every register the kernel mentions; a predicate use wins over
/// any other evidence, then a 64-bit definition.
fn banks(kernel: &Kernel) -> hashbrown::HashMap<VReg, Bank> {
    let mut banks = hashbrown::HashMap::new();
    let mut note = |vreg: VReg, bank: Bank| {
        let entry = banks.entry(vreg).or_insert(bank);
        *entry = (*entry).max(bank);
    };
    for stmt in kernel.statements() {
        if let Some(p) = stmt.predicate {
            note(p.reg, Bank::Pred);
        }
        if stmt.op == Opcode::Selp {
            if let Some(Operand::Reg(p)) = stmt.operands.get(3) {
                note(*p, Bank::Pred);
            }
        }
        if let Some(def) = stmt.def() {
            let bank = match (stmt.op, stmt.ty) {
                (Opcode::Setp(_), _) | (_, Some(Type::Pred)) => Bank::Pred,
                (_, Some(Type::S64 | Type::U64)) => Bank::B64,
                _ => Bank::B32,
            };
            note(def, bank);
        }
    }
    banks
}

#[derive(Debug, Default)]
pub struct PtxLowering;

impl PtxLowering {
    pub fn new() -> Self {
        Self
    }
}

struct Renamer<'a> {
    allocation: &'a AllocationResult,
    banks: hashbrown::HashMap<VReg, Bank>,
}

impl Renamer<'_> {
    fn bank(&self, vreg: VReg) -> Bank {
        self.banks.get(&vreg).copied().unwrap_or(Bank::B32)
    }

    fn reg(&self, vreg: VReg, index: usize) -> Result<String, LoweringError> {
        let reg = physical(self.allocation, vreg, index)?;
        Ok(format!("{}{}", self.bank(vreg).prefix(), reg.0))
    }

    fn operand(&self, op: &Operand, index: usize) -> Result<String, LoweringError> {
        Ok(match op {
            Operand::Reg(vreg) => self.reg(*vreg, index)?,
            Operand::Imm(value) => value.to_string(),
            Operand::Special(special) => special.name().to_string(),
            Operand::Label(label) => label.clone(),
            Operand::Address { base, offset } => {
                let base = match base {
                    AddressBase::Reg(vreg) => self.reg(*vreg, index)?,
                    AddressBase::Symbol(symbol) => symbol.clone(),
                };
                match offset {
                    0 => format!("[{base}]"),
                    o if *o < 0 => format!("[{base}{o}]"),
                    o => format!("[{base}+{o}]"),
                }
            }
        })
    }

    fn instruction(&self, stmt: &Statement, index: usize) -> Result<TargetStatement, LoweringError> {
        let operands = stmt
            .operands
            .iter()
            .map(|op| self.operand(op, index))
            .collect::<Result<Vec<_>, _>>()?;
        let lowered = TargetStatement::instruction(stmt.mnemonic(), operands);
        Ok(match stmt.predicate {
            Some(p) => {
                let bang = if p.negated { "!" } else { "" };
                lowered.with_guard(format!("@{bang}{}", self.reg(p.reg, index)?))
            }
            None => lowered,
        })
    }

    fn reload(
        &self,
        record: &SpillRecord,
        reg: u32,
        index: usize,
        out: &mut Vec<TargetStatement>,
    ) -> Result<(), LoweringError> {
        let word = format!("%r{reg}");
        match self.bank(record.vreg) {
            Bank::B64 => return Err(LoweringError::WideSpill { vreg: record.vreg, index }),
            Bank::B32 => out.push(TargetStatement::instruction("ld.local.b32", vec![word, spill_slot(record)])),
            Bank::Pred => {
                out.push(TargetStatement::instruction("ld.local.b32", vec![word.clone(), spill_slot(record)]));
                out.push(TargetStatement::instruction(
                    "setp.ne.b32",
                    vec![format!("%p{reg}"), word, "0".to_string()],
                ));
            }
        }
        Ok(())
    }

    fn store(
        &self,
        record: &SpillRecord,
        reg: u32,
        index: usize,
        out: &mut Vec<TargetStatement>,
    ) -> Result<(), LoweringError> {
        let word = format!("%r{reg}");
        match self.bank(record.vreg) {
            Bank::B64 => return Err(LoweringError::WideSpill { vreg: record.vreg, index }),
            Bank::B32 => {}
            Bank::Pred => out.push(TargetStatement::instruction(
                "selp.b32",
                vec![word.clone(), "1".to_string(), "0".to_string(), format!("%p{reg}")],
            )),
        }
        out.push(TargetStatement::instruction("st.local.b32", vec![spill_slot(record), word]));
        Ok(())
    }
}

fn spill_slot(record: &SpillRecord) -> String {
    match record.byte_offset() {
        0 => format!("[{SPILL_ARRAY}]"),
        off => format!("[{SPILL_ARRAY}+{off}]"),
    }
}

impl Lowering for PtxLowering {
    fn target_name(&self) -> &str {
        "ptx"
    }

    fn lower(
        &self,
        kernel: &Kernel,
        allocation: &AllocationResult,
    ) -> Result<Vec<TargetStatement>, LoweringError> {
        let renamer = Renamer { allocation, banks: banks(kernel) };
        let mut out = vec![
            TargetStatement::directive(".version 7.0"),
            TargetStatement::directive(".target sm_50"),
            TargetStatement::directive(format!(".visible .entry {}()", kernel.name())),
            TargetStatement::directive("{"),
        ];
        let span = register_span(allocation);
        let spilled_pred = allocation.spills.iter().any(|s| renamer.bank(s.vreg) == Bank::Pred);
        for bank in Bank::ALL {
            let used = allocation.locations.keys().any(|v| renamer.bank(*v) == bank);
            if span > 0 && (used || (bank == Bank::B32 && spilled_pred)) {
                out.push(TargetStatement::directive(format!(
                    "    .reg {} {}<{span}>;",
                    bank.decl(),
                    bank.prefix()
                )));
            }
        }
        if allocation.has_spills() {
            out.push(TargetStatement::directive(format!(
                "    .local .align 4 .b8 {SPILL_ARRAY}[{}];",
                allocation.scratch_bytes()
            )));
        }

        for (index, stmt) in kernel.statements().iter().enumerate() {
            if let Some(label) = stmt.label_name() {
                out.push(TargetStatement::Label(label.to_string()));
                continue;
            }
            for (record, reg) in allocation.reloads_before(index) {
                renamer.reload(record, reg.0, index, &mut out)?;
            }
            out.push(renamer.instruction(stmt, index)?);
            for (record, reg) in allocation.stores_after(index) {
                renamer.store(record, reg.0, index, &mut out)?;
            }
        }

        out.push(TargetStatement::directive("}"));
        log::debug!("ptx lowering of `{}`: {} statements", kernel.name(), out.len());
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::assembler::assemble;
    use crate::ir::parse_kernel;
    use crate::regalloc::{allocate, AllocationRequest};

    fn try_lower(text: &str, budget: u32) -> Result<String, LoweringError> {
        let kernel = parse_kernel(text).unwrap();
        let allocation = allocate(&kernel, &AllocationRequest::new(budget)).unwrap();
        PtxLowering::new().lower(&kernel, &allocation).map(|s| assemble(&s))
    }

    fn lower(text: &str, budget: u32) -> String {
        try_lower(text, budget).unwrap()
    }

    #[test]
    fn test_renames_registers() {
        let code = lower(
            ".kernel scale
                mov.s32 %r4, %tid.x;
                ld.global.s32 %r7, [%r4+4];
                setp.lt.s32 %r9, %r7, 16;
                @!%r9 bra DONE;
                st.global.s32 [out], %r7;
            DONE:
                ret;",
            8,
        );
        assert_eq!(
            code,
            ".version 7.0
.target sm_50
.visible .entry scale()
{
    .reg .pred %p<2>;
    .reg .b32 %r<2>;
    mov.s32 %r0, %tid.x;
    ld.global.s32 %r1, [%r0+4];
    setp.lt.s32 %p0, %r1, 16;
    @!%p0 bra DONE;
    st.global.s32 [out], %r1;
DONE:
    ret;
}
"
        );
    }

    #[test]
    fn test_wide_values_use_b64_bank() {
        let code = lower(
            ".kernel wide
                ld.global.u64 %r0, [ptr];
                add.u64 %r1, %r0, 8;
                ld.global.s32 %r2, [%r1];
                st.global.s32 [out], %r2;
                ret;",
            8,
        );
        assert!(code.contains("    .reg .b32 %r<2>;\n    .reg .b64 %rd<2>;\n"));
        assert!(code.contains("    add.u64 %rd1, %rd0, 8;\n    ld.global.s32 %r0, [%rd1];\n"));
        assert!(!code.contains(".pred"));
    }

    #[test]
    fn test_spill_code() {
        let code = lower(
            ".kernel k
                mov.s32 %r0, 1;
                mov.s32 %r1, 2;
                mov.s32 %r2, 3;
                mov.s32 %r3, 4;
                add.s32 %r4, %r0, %r1;
                add.s32 %r4, %r4, %r2;
                add.s32 %r4, %r4, %r3;
                st.global.s32 [out], %r4;
                ret;",
            4,
        );
        assert!(code.contains("    .reg .b32 %r<4>;\n"));
        assert!(code.contains("    .local .align 4 .b8 __spill[12];\n"));
        assert!(code.contains("    mov.s32 %r2, 3;\n    st.local.b32 [__spill], %r2;\n"));
        assert!(code.contains(
            "    ld.local.b32 %r2, [__spill];\n    ld.local.b32 %r3, [__spill+8];\n    add.s32 %r3, %r3, %r2;\n    st.local.b32 [__spill+8], %r3;\n"
        ));
        assert!(code.ends_with("    ret;\n}\n"));
    }

    #[test]
    fn test_spilled_predicate_goes_through_word_register() {
        let code = lower(
            ".kernel k
                setp.eq.s32 %r0, %tid.x, 0;
                mov.s32 %r1, 1;
                mov.s32 %r2, 2;
                add.s32 %r1, %r1, %r2;
                @%r0 st.global.s32 [out], %r1;
                ret;",
            2,
        );
        assert!(code.contains("    .reg .pred %p<2>;\n    .reg .b32 %r<2>;\n"));
        assert!(code.contains(
            "    setp.eq.s32 %p0, %tid.x, 0;\n    selp.b32 %r0, 1, 0, %p0;\n    st.local.b32 [__spill], %r0;\n"
        ));
        assert!(code.contains(
            "    ld.local.b32 %r0, [__spill];\n    setp.ne.b32 %p0, %r0, 0;\n    ld.local.b32 %r1, [__spill+4];\n    @%p0 st.global.s32 [out], %r1;\n"
        ));
    }

    #[test]
    fn test_wide_spill_rejected() {
        let err = try_lower(
            ".kernel k
                ld.global.u64 %r0, [ptr];
                ld.global.u64 %r1, [ptr+8];
                st.global.u64 [out], %r1;
                ld.global.u64 %r2, [ptr+16];
                st.global.u64 [out+8], %r2;
                st.global.u64 [out+16], %r0;
                ret;",
            1,
        )
        .unwrap_err();
        assert!(matches!(err, LoweringError::WideSpill { .. }));
    }
}
