//! Kernel IR: the in-memory form every pass, the allocator and the lowering
//! strategies operate on.
//!
//! A [`Kernel`] is an ordered list of [`Statement`]s. Statement order is
//! program order. Basic blocks are never stored; [`Kernel::cfg`] derives
//! them from labels, branches and terminators each time it is called, so the
//! block view cannot drift away from the statements.
//!
//! # Text format
//!
//! ```text
//! // comments start with two slashes
//! .kernel scale .arch ptx
//!     mov.s32 %r0, %tid.x;
//!     ld.global.s32 %r1, [%r0+4];
//!     setp.lt.s32 %r2, %r1, 16;
//!     @!%r2 bra DONE;
//!     mul.s32 %r1, %r1, 2;
//! DONE:
//!     ret;
//! ```

use std::fmt;

use thiserror::Error;

use crate::arch::Architecture;

pub mod cfg;
pub mod check;
pub mod parser;

pub use cfg::{BasicBlock, ControlFlowGraph, Edge, EdgeKind};
pub use parser::{parse_kernel, ParseError};

/// Virtual register identifier, unique within one kernel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct VReg(pub u32);

impl fmt::Display for VReg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "%r{}", self.0)
    }
}

/// State space addressed by a memory statement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Space {
    Global,
    Shared,
    Local,
    Param,
    Const,
    Generic,
}

impl Space {
    pub const fn name(self) -> &'static str {
        match self {
            Space::Global => "global",
            Space::Shared => "shared",
            Space::Local => "local",
            Space::Param => "param",
            Space::Const => "const",
            Space::Generic => "generic",
        }
    }

    pub fn from_name(s: &str) -> Option<Self> {
        Some(match s {
            "global" => Space::Global,
            "shared" => Space::Shared,
            "local" => Space::Local,
            "param" => Space::Param,
            "const" => Space::Const,
            "generic" => Space::Generic,
            _ => return None,
        })
    }

    /// Whether accesses to this space are visible to other threads of the
    /// CTA and therefore ordered by `bar.sync`.
    pub const fn is_cta_visible(self) -> bool {
        matches!(self, Space::Global | Space::Shared | Space::Generic)
    }
}

/// Comparison performed by `setp`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Cmp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

impl Cmp {
    pub const fn name(self) -> &'static str {
        match self {
            Cmp::Eq => "eq",
            Cmp::Ne => "ne",
            Cmp::Lt => "lt",
            Cmp::Le => "le",
            Cmp::Gt => "gt",
            Cmp::Ge => "ge",
        }
    }

    pub fn from_name(s: &str) -> Option<Self> {
        Some(match s {
            "eq" => Cmp::Eq,
            "ne" => Cmp::Ne,
            "lt" => Cmp::Lt,
            "le" => Cmp::Le,
            "gt" => Cmp::Gt,
            "ge" => Cmp::Ge,
            _ => return None,
        })
    }
}

/// Scalar type suffix of a statement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Type {
    S32,
    U32,
    S64,
    U64,
    F32,
    B32,
    Pred,
}

impl Type {
    pub const fn name(self) -> &'static str {
        match self {
            Type::S32 => "s32",
            Type::U32 => "u32",
            Type::S64 => "s64",
            Type::U64 => "u64",
            Type::F32 => "f32",
            Type::B32 => "b32",
            Type::Pred => "pred",
        }
    }

    pub fn from_name(s: &str) -> Option<Self> {
        Some(match s {
            "s32" => Type::S32,
            "u32" => Type::U32,
            "s64" => Type::S64,
            "u64" => Type::U64,
            "f32" => Type::F32,
            "b32" => Type::B32,
            "pred" => Type::Pred,
            _ => return None,
        })
    }
}

/// Operation kind of a statement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Opcode {
    Mov,
    Add,
    Sub,
    Mul,
    Mad,
    Div,
    Rem,
    Min,
    Max,
    And,
    Or,
    Xor,
    Not,
    Shl,
    Shr,
    Setp(Cmp),
    Selp,
    Ld(Space),
    St(Space),
    AtomAdd(Space),
    Bar,
    Bra,
    Ret,
    Exit,
    Label,
}

/// Static properties of an [`Opcode`].
#[derive(Debug, Clone, Copy)]
pub struct OpInfo {
    pub name: &'static str,
    /// Ends straight-line flow when not predicated.
    pub is_terminator: bool,
    /// First operand is a destination register.
    pub is_def: bool,
    pub op_count: usize,
}

impl Opcode {
    pub const fn info(self) -> OpInfo {
        use Opcode::*;
        const fn op(name: &'static str, is_def: bool, op_count: usize) -> OpInfo {
            OpInfo { name, is_terminator: false, is_def, op_count }
        }
        match self {
            Mov => op("mov", true, 2),
            Add => op("add", true, 3),
            Sub => op("sub", true, 3),
            Mul => op("mul", true, 3),
            Mad => op("mad", true, 4),
            Div => op("div", true, 3),
            Rem => op("rem", true, 3),
            Min => op("min", true, 3),
            Max => op("max", true, 3),
            And => op("and", true, 3),
            Or => op("or", true, 3),
            Xor => op("xor", true, 3),
            Not => op("not", true, 2),
            Shl => op("shl", true, 3),
            Shr => op("shr", true, 3),
            Setp(_) => op("setp", true, 3),
            Selp => op("selp", true, 4),
            Ld(_) => op("ld", true, 2),
            St(_) => op("st", false, 2),
            AtomAdd(_) => op("atom", true, 3),
            Bar => op("bar", false, 1),
            Bra => OpInfo { name: "bra", is_terminator: true, is_def: false, op_count: 1 },
            Ret => OpInfo { name: "ret", is_terminator: true, is_def: false, op_count: 0 },
            Exit => OpInfo { name: "exit", is_terminator: true, is_def: false, op_count: 0 },
            Label => op("label", false, 1),
        }
    }

    /// Memory space touched by the operation, if any.
    pub const fn space(self) -> Option<Space> {
        match self {
            Opcode::Ld(s) | Opcode::St(s) | Opcode::AtomAdd(s) => Some(s),
            _ => None,
        }
    }

    /// Mnemonic for simple arithmetic opcodes.
    pub fn from_mnemonic(s: &str) -> Option<Self> {
        use Opcode::*;
        Some(match s {
            "mov" => Mov,
            "add" => Add,
            "sub" => Sub,
            "mul" => Mul,
            "mad" => Mad,
            "div" => Div,
            "rem" => Rem,
            "min" => Min,
            "max" => Max,
            "and" => And,
            "or" => Or,
            "xor" => Xor,
            "not" => Not,
            "shl" => Shl,
            "shr" => Shr,
            "selp" => Selp,
            "bra" => Bra,
            "ret" => Ret,
            "exit" => Exit,
            _ => return None,
        })
    }
}

/// Hardware-provided read-only registers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SpecialReg {
    TidX,
    TidY,
    TidZ,
    NtidX,
    CtaidX,
    NctaidX,
    LaneId,
}

impl SpecialReg {
    pub const fn name(self) -> &'static str {
        match self {
            SpecialReg::TidX => "%tid.x",
            SpecialReg::TidY => "%tid.y",
            SpecialReg::TidZ => "%tid.z",
            SpecialReg::NtidX => "%ntid.x",
            SpecialReg::CtaidX => "%ctaid.x",
            SpecialReg::NctaidX => "%nctaid.x",
            SpecialReg::LaneId => "%laneid",
        }
    }

    pub fn from_name(s: &str) -> Option<Self> {
        Some(match s {
            "%tid.x" => SpecialReg::TidX,
            "%tid.y" => SpecialReg::TidY,
            "%tid.z" => SpecialReg::TidZ,
            "%ntid.x" => SpecialReg::NtidX,
            "%ctaid.x" => SpecialReg::CtaidX,
            "%nctaid.x" => SpecialReg::NctaidX,
            "%laneid" => SpecialReg::LaneId,
            _ => return None,
        })
    }
}

/// Base of a memory address.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum AddressBase {
    Reg(VReg),
    Symbol(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Operand {
    Reg(VReg),
    Imm(i64),
    Special(SpecialReg),
    Label(String),
    Address { base: AddressBase, offset: i64 },
}

impl Operand {
    /// Register read or written through this operand, including address bases.
    pub fn reg(&self) -> Option<VReg> {
        match self {
            Operand::Reg(r) => Some(*r),
            Operand::Address { base: AddressBase::Reg(r), .. } => Some(*r),
            _ => None,
        }
    }
}

impl fmt::Display for Operand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Operand::Reg(r) => write!(f, "{r}"),
            Operand::Imm(v) => write!(f, "{v}"),
            Operand::Special(s) => f.write_str(s.name()),
            Operand::Label(l) => f.write_str(l),
            Operand::Address { base, offset } => {
                match base {
                    AddressBase::Reg(r) => write!(f, "[{r}")?,
                    AddressBase::Symbol(s) => write!(f, "[{s}")?,
                }
                match offset {
                    0 => f.write_str("]"),
                    o if *o < 0 => write!(f, "{o}]"),
                    o => write!(f, "+{o}]"),
                }
            }
        }
    }
}

/// Guard of a predicated statement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Predicate {
    pub reg: VReg,
    pub negated: bool,
}

impl Predicate {
    pub fn new(reg: VReg) -> Self {
        Self { reg, negated: false }
    }

    pub fn negate(self) -> Self {
        Self { reg: self.reg, negated: !self.negated }
    }
}

impl fmt::Display for Predicate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.negated {
            write!(f, "@!{}", self.reg)
        } else {
            write!(f, "@{}", self.reg)
        }
    }
}

/// One IR statement: operation kind, operand list and optional guard.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Statement {
    pub op: Opcode,
    pub ty: Option<Type>,
    pub operands: Vec<Operand>,
    pub predicate: Option<Predicate>,
}

impl Statement {
    pub fn new(op: Opcode, ty: Option<Type>, operands: Vec<Operand>) -> Self {
        Self { op, ty, operands, predicate: None }
    }

    pub fn label(name: impl Into<String>) -> Self {
        Self::new(Opcode::Label, None, vec![Operand::Label(name.into())])
    }

    pub fn branch(target: impl Into<String>) -> Self {
        Self::new(Opcode::Bra, None, vec![Operand::Label(target.into())])
    }

    pub fn barrier() -> Self {
        Self::new(Opcode::Bar, None, vec![Operand::Imm(0)])
    }

    pub fn guarded(mut self, predicate: Predicate) -> Self {
        self.predicate = Some(predicate);
        self
    }

    pub fn info(&self) -> OpInfo {
        self.op.info()
    }

    /// Register written by the statement.
    pub fn def(&self) -> Option<VReg> {
        if !self.info().is_def {
            return None;
        }
        match self.operands.first() {
            Some(Operand::Reg(r)) => Some(*r),
            _ => None,
        }
    }

    /// Registers read by the statement, guard first, in operand order.
    pub fn uses(&self) -> impl Iterator<Item = VReg> + '_ {
        let skip = usize::from(self.def().is_some());
        self.predicate
            .map(|p| p.reg)
            .into_iter()
            .chain(self.operands.iter().skip(skip).filter_map(Operand::reg))
    }

    /// Distinct registers referenced by the statement.
    pub fn registers(&self) -> Vec<VReg> {
        let mut regs: Vec<VReg> = self.def().into_iter().chain(self.uses()).collect();
        regs.sort_unstable();
        regs.dedup();
        regs
    }

    pub fn label_name(&self) -> Option<&str> {
        match (self.op, self.operands.first()) {
            (Opcode::Label, Some(Operand::Label(name))) => Some(name),
            _ => None,
        }
    }

    pub fn branch_target(&self) -> Option<&str> {
        match (self.op, self.operands.first()) {
            (Opcode::Bra, Some(Operand::Label(name))) => Some(name),
            _ => None,
        }
    }

    pub fn is_label(&self) -> bool {
        self.op == Opcode::Label
    }

    pub fn is_barrier(&self) -> bool {
        self.op == Opcode::Bar
    }

    /// Control never falls through to the next statement.
    pub fn ends_flow(&self) -> bool {
        self.info().is_terminator && self.predicate.is_none()
    }

    /// The statement accesses memory other threads of the CTA can observe.
    pub fn touches_cta_memory(&self) -> bool {
        self.op.space().is_some_and(Space::is_cta_visible)
    }

    /// Full dotted mnemonic, e.g. `ld.shared.s32`.
    pub fn mnemonic(&self) -> String {
        let mut m = String::from(self.info().name);
        match self.op {
            Opcode::Ld(s) | Opcode::St(s) => {
                m.push('.');
                m.push_str(s.name());
            }
            Opcode::AtomAdd(s) => {
                m.push('.');
                m.push_str(s.name());
                m.push_str(".add");
            }
            Opcode::Setp(c) => {
                m.push('.');
                m.push_str(c.name());
            }
            Opcode::Bar => m.push_str(".sync"),
            _ => {}
        }
        if let Some(ty) = self.ty {
            m.push('.');
            m.push_str(ty.name());
        }
        m
    }
}

impl fmt::Display for Statement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(name) = self.label_name() {
            return write!(f, "{name}:");
        }
        f.write_str("    ")?;
        if let Some(p) = self.predicate {
            write!(f, "{p} ")?;
        }
        f.write_str(&self.mnemonic())?;
        for (i, op) in self.operands.iter().enumerate() {
            f.write_str(if i == 0 { " " } else { ", " })?;
            write!(f, "{op}")?;
        }
        f.write_str(";")
    }
}

/// Structural invariant broken by a kernel.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConsistencyError {
    #[error("statement {index} references {reg}, outside the kernel's {count} registers")]
    UnknownRegister { index: usize, reg: VReg, count: u32 },

    #[error("label `{label}` defined twice (second at statement {index})")]
    DuplicateLabel { index: usize, label: String },

    #[error("statement {index} branches to undefined label `{label}`")]
    UndefinedLabel { index: usize, label: String },

    #[error("statement {index} is malformed: {reason}")]
    Malformed { index: usize, reason: String },
}

/// A unit of GPU code, owned by the translator for the duration of one call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Kernel {
    name: String,
    arch: Architecture,
    statements: Vec<Statement>,
    register_count: u32,
}

impl Kernel {
    pub fn new(name: impl Into<String>, arch: Architecture) -> Self {
        Self { name: name.into(), arch, statements: Vec::new(), register_count: 0 }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn arch(&self) -> Architecture {
        self.arch
    }

    /// Size of the register namespace: every id below this is allocated.
    pub fn register_count(&self) -> u32 {
        self.register_count
    }

    /// Allocate a fresh virtual register.
    pub fn new_register(&mut self) -> VReg {
        let reg = VReg(self.register_count);
        self.register_count += 1;
        reg
    }

    /// Append a statement, growing the register namespace to cover it.
    pub fn push(&mut self, stmt: Statement) {
        for reg in stmt.registers() {
            self.register_count = self.register_count.max(reg.0 + 1);
        }
        self.statements.push(stmt);
    }

    pub fn statements(&self) -> &[Statement] {
        &self.statements
    }

    /// Direct access for passes. The namespace is not grown by edits made
    /// here; [`Kernel::verify`] rejects registers outside it.
    pub fn statements_mut(&mut self) -> &mut Vec<Statement> {
        &mut self.statements
    }

    pub fn len(&self) -> usize {
        self.statements.len()
    }

    pub fn is_empty(&self) -> bool {
        self.statements.is_empty()
    }

    /// Derive the control-flow graph from the current statements.
    pub fn cfg(&self) -> ControlFlowGraph {
        ControlFlowGraph::build(self)
    }

    /// Map from label name to the index of its label statement.
    pub fn label_positions(&self) -> hashbrown::HashMap<&str, usize> {
        self.statements
            .iter()
            .enumerate()
            .filter_map(|(i, s)| s.label_name().map(|l| (l, i)))
            .collect()
    }

    /// Check the structural invariants every pass must preserve.
    pub fn verify(&self) -> Result<(), ConsistencyError> {
        let mut labels = hashbrown::HashSet::new();
        for (index, stmt) in self.statements.iter().enumerate() {
            let info = stmt.info();
            if stmt.operands.len() != info.op_count {
                return Err(ConsistencyError::Malformed {
                    index,
                    reason: format!(
                        "`{}` takes {} operands, found {}",
                        info.name,
                        info.op_count,
                        stmt.operands.len()
                    ),
                });
            }
            if info.is_def && stmt.def().is_none() {
                return Err(ConsistencyError::Malformed {
                    index,
                    reason: format!("`{}` needs a destination register", info.name),
                });
            }
            if let Some(reg) = stmt.registers().into_iter().find(|r| r.0 >= self.register_count) {
                return Err(ConsistencyError::UnknownRegister {
                    index,
                    reg,
                    count: self.register_count,
                });
            }
            if stmt.is_label() {
                if stmt.predicate.is_some() {
                    return Err(ConsistencyError::Malformed {
                        index,
                        reason: "labels cannot be predicated".into(),
                    });
                }
                let Some(name) = stmt.label_name() else {
                    return Err(ConsistencyError::Malformed {
                        index,
                        reason: "label without a name".into(),
                    });
                };
                if !labels.insert(name) {
                    return Err(ConsistencyError::DuplicateLabel { index, label: name.to_string() });
                }
            }
            if stmt.op == Opcode::Bra && stmt.branch_target().is_none() {
                return Err(ConsistencyError::Malformed {
                    index,
                    reason: "branch without a label target".into(),
                });
            }
        }
        for (index, stmt) in self.statements.iter().enumerate() {
            if let Some(target) = stmt.branch_target() {
                if !labels.contains(target) {
                    return Err(ConsistencyError::UndefinedLabel { index, label: target.to_string() });
                }
            }
        }
        Ok(())
    }
}

impl fmt::Display for Kernel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, ".kernel {} .arch {}", self.name, self.arch)?;
        for stmt in &self.statements {
            writeln!(f, "{stmt}")?;
        }
        Ok(())
    }
}
