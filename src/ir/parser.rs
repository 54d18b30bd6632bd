//! Parser for the textual kernel format.
//!
//! The format is line oriented: one `.kernel` header, then one label or
//! statement per line. Everything after `//` is a comment and a trailing `;`
//! is optional. The parsed kernel is verified before it is returned.

use thiserror::Error;

use super::{
    AddressBase, Cmp, ConsistencyError, Kernel, Opcode, Operand, Predicate, Space, SpecialReg,
    Statement, Type, VReg,
};
use crate::arch::Architecture;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ParseError {
    #[error("line {line}: expected `.kernel <name>` header")]
    MissingHeader { line: usize },

    #[error("line {line}: unknown architecture `{name}`")]
    UnknownArchitecture { line: usize, name: String },

    #[error("line {line}: unknown opcode `{mnemonic}`")]
    UnknownOpcode { line: usize, mnemonic: String },

    #[error("line {line}: bad operand `{text}`: {reason}")]
    BadOperand { line: usize, text: String, reason: &'static str },

    #[error("line {line}: bad predicate `{text}`")]
    BadPredicate { line: usize, text: String },

    #[error("parsed kernel is inconsistent: {0}")]
    Inconsistent(#[from] ConsistencyError),
}

/// Parse one kernel from its textual form.
pub fn parse_kernel(text: &str) -> Result<Kernel, ParseError> {
    let mut lines = text.lines().enumerate().filter_map(|(idx, raw)| {
        let content = match raw.find("//") {
            Some(pos) => &raw[..pos],
            None => raw,
        };
        let content = content.trim().trim_end_matches(';').trim_end();
        (!content.is_empty()).then_some((idx + 1, content))
    });

    let (line, header) = lines.next().ok_or(ParseError::MissingHeader { line: 1 })?;
    let mut kernel = parse_header(header, line)?;

    for (line, content) in lines {
        if let Some(label) = content.strip_suffix(':') {
            if is_identifier(label) {
                kernel.push(Statement::label(label));
                continue;
            }
        }
        kernel.push(parse_statement(content, line)?);
    }

    kernel.verify()?;
    log::trace!("parsed kernel `{}` with {} statements", kernel.name(), kernel.len());
    Ok(kernel)
}

fn parse_header(content: &str, line: usize) -> Result<Kernel, ParseError> {
    let mut words = content.split_whitespace();
    if words.next() != Some(".kernel") {
        return Err(ParseError::MissingHeader { line });
    }
    let name = words.next().filter(|n| is_identifier(n)).ok_or(ParseError::MissingHeader { line })?;
    let mut arch = Architecture::Ptx;
    while let Some(word) = words.next() {
        match (word, words.next()) {
            (".arch", Some(value)) => {
                arch = value.parse().map_err(|_| ParseError::UnknownArchitecture {
                    line,
                    name: value.to_string(),
                })?;
            }
            _ => return Err(ParseError::MissingHeader { line }),
        }
    }
    Ok(Kernel::new(name, arch))
}

fn parse_statement(content: &str, line: usize) -> Result<Statement, ParseError> {
    let mut rest = content;
    let mut predicate = None;
    if let Some(guarded) = rest.strip_prefix('@') {
        let (guard, tail) = guarded
            .split_once(char::is_whitespace)
            .ok_or_else(|| ParseError::BadPredicate { line, text: content.to_string() })?;
        let (negated, reg) = match guard.strip_prefix('!') {
            Some(reg) => (true, reg),
            None => (false, guard),
        };
        let reg = parse_vreg(reg)
            .ok_or_else(|| ParseError::BadPredicate { line, text: guard.to_string() })?;
        predicate = Some(Predicate { reg, negated });
        rest = tail.trim_start();
    }

    let (mnemonic, operand_text) = match rest.split_once(char::is_whitespace) {
        Some((m, ops)) => (m, ops.trim()),
        None => (rest, ""),
    };
    let (op, ty) = parse_mnemonic(mnemonic)
        .ok_or_else(|| ParseError::UnknownOpcode { line, mnemonic: mnemonic.to_string() })?;

    let mut operands = Vec::new();
    if !operand_text.is_empty() {
        for text in operand_text.split(',') {
            operands.push(parse_operand(text.trim(), line)?);
        }
    }
    if op == Opcode::Bar && operands.is_empty() {
        operands.push(Operand::Imm(0));
    }

    Ok(Statement { op, ty, operands, predicate })
}

fn parse_mnemonic(mnemonic: &str) -> Option<(Opcode, Option<Type>)> {
    let mut parts = mnemonic.split('.');
    let head = parts.next()?;
    let op = match head {
        "ld" | "st" => {
            let space = Space::from_name(parts.next()?)?;
            if head == "ld" {
                Opcode::Ld(space)
            } else {
                Opcode::St(space)
            }
        }
        "atom" => {
            let space = Space::from_name(parts.next()?)?;
            if parts.next()? != "add" {
                return None;
            }
            Opcode::AtomAdd(space)
        }
        "setp" => Opcode::Setp(Cmp::from_name(parts.next()?)?),
        "bar" => {
            if let Some(kind) = parts.next() {
                if kind != "sync" {
                    return None;
                }
            }
            Opcode::Bar
        }
        other => Opcode::from_mnemonic(other)?,
    };
    let ty = match parts.next() {
        Some(t) => Some(Type::from_name(t)?),
        None => None,
    };
    if parts.next().is_some() {
        return None;
    }
    Some((op, ty))
}

fn parse_operand(text: &str, line: usize) -> Result<Operand, ParseError> {
    let bad = |reason| ParseError::BadOperand { line, text: text.to_string(), reason };

    if let Some(inner) = text.strip_prefix('[') {
        let inner = inner.strip_suffix(']').ok_or_else(|| bad("unterminated address"))?;
        let split = inner
            .char_indices()
            .skip(1)
            .find(|&(_, c)| c == '+' || c == '-')
            .map(|(i, _)| i);
        let (base, offset) = match split {
            Some(i) => {
                let (base, off) = inner.split_at(i);
                let off = off.strip_prefix('+').unwrap_or(off);
                (base.trim(), parse_int(off.trim()).ok_or_else(|| bad("bad address offset"))?)
            }
            None => (inner.trim(), 0),
        };
        let base = if let Some(reg) = parse_vreg(base) {
            AddressBase::Reg(reg)
        } else if is_identifier(base) {
            AddressBase::Symbol(base.to_string())
        } else {
            return Err(bad("bad address base"));
        };
        return Ok(Operand::Address { base, offset });
    }

    if let Some(reg) = parse_vreg(text) {
        return Ok(Operand::Reg(reg));
    }
    if text.starts_with('%') {
        return SpecialReg::from_name(text).map(Operand::Special).ok_or_else(|| bad("unknown register"));
    }
    if let Some(value) = parse_int(text) {
        return Ok(Operand::Imm(value));
    }
    if is_identifier(text) {
        return Ok(Operand::Label(text.to_string()));
    }
    Err(bad("unrecognised operand"))
}

fn parse_vreg(text: &str) -> Option<VReg> {
    let digits = text.strip_prefix("%r")?;
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    digits.parse().ok().map(VReg)
}

fn parse_int(text: &str) -> Option<i64> {
    let (negative, body) = match text.strip_prefix('-') {
        Some(body) => (true, body),
        None => (false, text),
    };
    let value = match body.strip_prefix("0x").or_else(|| body.strip_prefix("0X")) {
        Some(hex) => i64::from_str_radix(hex, 16).ok()?,
        None if !body.is_empty() && body.bytes().all(|b| b.is_ascii_digit()) => body.parse().ok()?,
        None => return None,
    };
    Some(if negative { -value } else { value })
}

fn is_identifier(text: &str) -> bool {
    let mut chars = text.chars();
    matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_' || c == '$')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '$')
}
