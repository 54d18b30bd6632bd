// This module holds the target kernel and its assembler. Lowering produces an
// ordered list of TargetStatements; assembling concatenates each statement's text
// followed by a newline, in order, without reordering or filtering anything. The
// code string is generated on demand: mutating the statement list marks the
// kernel dirty, and `code()` refuses to hand out the old string until the caller
// re-assembles. A TargetKernel can also carry the DOT rendering of the optimized
// kernel's control-flow graph for diagnostic consumers.

//! Target kernel assembly.

use std::fmt;

use thiserror::Error;

use crate::arch::Architecture;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AssembleError {
    #[error("statements changed since the last assemble; call assemble() first")]
    Stale,
}

/// One target-architecture statement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TargetStatement {
    /// Branch target, printed as `NAME:`.
    Label(String),
    /// Instruction, optionally guarded (`@%p` or `@!%p`).
    Instruction {
        guard: Option<String>,
        opcode: String,
        operands: Vec<String>,
        /// Printed with a trailing `;`.
        terminated: bool,
    },
    /// Anything printed verbatim: directives, braces, comments.
    Directive(String),
}

impl TargetStatement {
    pub fn instruction(opcode: impl Into<String>, operands: Vec<String>) -> Self {
        TargetStatement::Instruction { guard: None, opcode: opcode.into(), operands, terminated: true }
    }

    pub fn directive(text: impl Into<String>) -> Self {
        TargetStatement::Directive(text.into())
    }

    pub fn with_guard(self, guard: impl Into<String>) -> Self {
        match self {
            TargetStatement::Instruction { opcode, operands, terminated, .. } => {
                TargetStatement::Instruction { guard: Some(guard.into()), opcode, operands, terminated }
            }
            other => other,
        }
    }

    /// Drop the trailing `;`, for targets without statement terminators.
    pub fn unterminated(self) -> Self {
        match self {
            TargetStatement::Instruction { guard, opcode, operands, .. } => {
                TargetStatement::Instruction { guard, opcode, operands, terminated: false }
            }
            other => other,
        }
    }

    pub fn is_instruction(&self) -> bool {
        matches!(self, TargetStatement::Instruction { .. })
    }
}

impl fmt::Display for TargetStatement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TargetStatement::Label(name) => write!(f, "{name}:"),
            TargetStatement::Directive(text) => f.write_str(text),
            TargetStatement::Instruction { guard, opcode, operands, terminated } => {
                f.write_str("    ")?;
                if let Some(guard) = guard {
                    write!(f, "{guard} ")?;
                }
                f.write_str(opcode)?;
                for (i, op) in operands.iter().enumerate() {
                    f.write_str(if i == 0 { " " } else { ", " })?;
                    f.write_str(op)?;
                }
                if *terminated {
                    f.write_str(";")?;
                }
                Ok(())
            }
        }
    }
}

/// Concatenate every statement's text, each followed by `\n`.
pub fn assemble(statements: &[TargetStatement]) -> String {
    let mut code = String::new();
    for stmt in statements {
        code.push_str(&stmt.to_string());
        code.push('\n');
    }
    code
}

/// Output of one translation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TargetKernel {
    name: String,
    arch: Architecture,
    statements: Vec<TargetStatement>,
    code: String,
    dirty: bool,
    cfg: Option<String>,
}

impl TargetKernel {
    pub fn new(name: impl Into<String>, arch: Architecture) -> Self {
        Self {
            name: name.into(),
            arch,
            statements: Vec::new(),
            code: String::new(),
            dirty: false,
            cfg: None,
        }
    }

    /// Build from lowered statements and assemble immediately.
    pub fn from_statements(
        name: impl Into<String>,
        arch: Architecture,
        statements: Vec<TargetStatement>,
    ) -> Self {
        let mut kernel = Self::new(name, arch);
        kernel.statements = statements;
        kernel.assemble();
        kernel
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn arch(&self) -> Architecture {
        self.arch
    }

    pub fn statements(&self) -> &[TargetStatement] {
        &self.statements
    }

    /// Mutable access marks the code stale until the next [`assemble`](Self::assemble).
    pub fn statements_mut(&mut self) -> &mut Vec<TargetStatement> {
        self.dirty = true;
        &mut self.statements
    }

    pub fn push(&mut self, stmt: TargetStatement) {
        self.dirty = true;
        self.statements.push(stmt);
    }

    /// Regenerate the code string from the current statements.
    pub fn assemble(&mut self) -> &str {
        self.code = assemble(&self.statements);
        self.dirty = false;
        log::trace!("assembled `{}`: {} statements, {} bytes", self.name, self.statements.len(), self.code.len());
        &self.code
    }

    pub fn is_stale(&self) -> bool {
        self.dirty
    }

    /// The assembled code, refused while the statements are newer than it.
    pub fn code(&self) -> Result<&str, AssembleError> {
        if self.dirty {
            return Err(AssembleError::Stale);
        }
        Ok(&self.code)
    }

    /// DOT rendering of the optimized kernel's control-flow graph.
    pub fn cfg(&self) -> Option<&str> {
        self.cfg.as_deref()
    }

    pub fn set_cfg(&mut self, dot: String) {
        self.cfg = Some(dot);
    }

    /// Number of instruction statements, ignoring labels and directives.
    pub fn instruction_count(&self) -> usize {
        self.statements.iter().filter(|s| s.is_instruction()).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Vec<TargetStatement> {
        vec![
            TargetStatement::directive(".entry k"),
            TargetStatement::Label("L0".into()),
            TargetStatement::instruction("add.s32", vec!["%r0".into(), "%r0".into(), "1".into()])
                .with_guard("@%r1"),
            TargetStatement::instruction("ret", vec![]),
        ]
    }

    #[test]
    fn test_assemble_one_line_per_statement() {
        let code = assemble(&sample());
        assert_eq!(code, ".entry k\nL0:\n    @%r1 add.s32 %r0, %r0, 1;\n    ret;\n");
        assert_eq!(assemble(&[]), "");
    }

    #[test]
    fn test_assemble_is_deterministic() {
        let mut kernel = TargetKernel::from_statements("k", Architecture::Ptx, sample());
        let first = kernel.code().unwrap().to_string();
        let second = kernel.assemble().to_string();
        assert_eq!(first, second);
        assert_eq!(kernel.instruction_count(), 2);
    }

    #[test]
    fn test_mutation_requires_reassembly() {
        let mut kernel = TargetKernel::from_statements("k", Architecture::Ptx, sample());
        kernel.push(TargetStatement::instruction("exit", vec![]).unterminated());
        assert!(kernel.is_stale());
        assert_eq!(kernel.code(), Err(AssembleError::Stale));

        kernel.assemble();
        assert!(kernel.code().unwrap().ends_with("    ret;\n    exit\n"));
    }

    #[test]
    fn test_empty_kernel() {
        let kernel = TargetKernel::new("empty", Architecture::Amdil);
        assert_eq!(kernel.code(), Ok(""));
        assert!(kernel.cfg().is_none());
    }
}
