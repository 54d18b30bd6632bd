// This module is the pass framework: a closed catalog of IR-to-IR transformations
// selected by a bitmask and driven in a fixed canonical order. Each pass is a plain
// function over `&mut Kernel` that returns how many statements it rewrote; the
// driver runs the selected ones in dependency order (block unification, reverse
// if-conversion, barrier removal, sync elimination) no matter how the mask bits
// were combined, and re-verifies the kernel after every pass. A pass that leaves
// the kernel violating a structural invariant turns into a fatal consistency
// error naming the pass. Every pass iterates to its own fixpoint, so applying it
// to its own output changes nothing.

//! Bitmask-selected optimization passes.

use std::fmt;
use std::ops::{BitOr, BitOrAssign};
use std::str::FromStr;

use crate::core::error::{ConfigError, TranslateError, TranslateResult};
use crate::ir::Kernel;

pub mod block_unification;
pub mod remove_barriers;
pub mod reverse_if_conversion;
pub mod sync_elimination;

/// One transformation of the pass catalog.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Pass {
    BlockUnification,
    ReverseIfConversion,
    RemoveBarriers,
    SyncElimination,
}

impl Pass {
    /// Order the driver runs passes in.
    pub const CANONICAL_ORDER: [Pass; 4] = [
        Pass::BlockUnification,
        Pass::ReverseIfConversion,
        Pass::RemoveBarriers,
        Pass::SyncElimination,
    ];

    pub const fn name(self) -> &'static str {
        match self {
            Pass::BlockUnification => "block-unification",
            Pass::ReverseIfConversion => "reverse-if-conversion",
            Pass::RemoveBarriers => "remove-barriers",
            Pass::SyncElimination => "sync-elimination",
        }
    }

    pub const fn mask(self) -> PassMask {
        match self {
            Pass::BlockUnification => PassMask::BLOCK_UNIFICATION,
            Pass::ReverseIfConversion => PassMask::REVERSE_IF_CONVERSION,
            Pass::RemoveBarriers => PassMask::REMOVE_BARRIERS,
            Pass::SyncElimination => PassMask::SYNC_ELIMINATION,
        }
    }

    /// Accepts `remove-barriers`, `remove_barriers` and `RemoveBarriers`.
    pub fn from_name(s: &str) -> Option<Self> {
        let key: String = s
            .chars()
            .filter(|c| *c != '-' && *c != '_')
            .map(|c| c.to_ascii_lowercase())
            .collect();
        Self::CANONICAL_ORDER
            .into_iter()
            .find(|p| p.name().replace('-', "") == key)
    }

    /// Run the pass to its fixpoint, returning the number of statements
    /// removed, inserted or rewritten.
    pub fn run(self, kernel: &mut Kernel) -> usize {
        match self {
            Pass::BlockUnification => block_unification::run(kernel),
            Pass::ReverseIfConversion => reverse_if_conversion::run(kernel),
            Pass::RemoveBarriers => remove_barriers::run(kernel),
            Pass::SyncElimination => sync_elimination::run(kernel),
        }
    }
}

impl fmt::Display for Pass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Bitwise OR of pass flags.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct PassMask(u32);

impl PassMask {
    pub const NONE: PassMask = PassMask(0);
    pub const REMOVE_BARRIERS: PassMask = PassMask(0x1);
    pub const REVERSE_IF_CONVERSION: PassMask = PassMask(0x2);
    pub const BLOCK_UNIFICATION: PassMask = PassMask(0x4);
    pub const SYNC_ELIMINATION: PassMask = PassMask(0x8);
    pub const ALL: PassMask = PassMask(0xf);

    /// Validate raw bits, rejecting anything outside the catalog.
    pub fn from_bits(bits: u32) -> Result<Self, ConfigError> {
        let unknown = bits & !Self::ALL.0;
        if unknown != 0 {
            return Err(ConfigError::UnknownPassBits { bits: unknown });
        }
        Ok(PassMask(bits))
    }

    pub const fn bits(self) -> u32 {
        self.0
    }

    pub const fn contains(self, other: PassMask) -> bool {
        self.0 & other.0 == other.0
    }

    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub const fn union(self, other: PassMask) -> PassMask {
        PassMask(self.0 | other.0)
    }

    /// Selected passes in canonical order.
    pub fn passes(self) -> impl Iterator<Item = Pass> {
        Pass::CANONICAL_ORDER
            .into_iter()
            .filter(move |p| self.contains(p.mask()))
    }
}

impl BitOr for PassMask {
    type Output = PassMask;

    fn bitor(self, rhs: PassMask) -> PassMask {
        PassMask(self.0 | rhs.0)
    }
}

impl BitOrAssign for PassMask {
    fn bitor_assign(&mut self, rhs: PassMask) {
        self.0 |= rhs.0;
    }
}

impl fmt::Display for PassMask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_empty() {
            return f.write_str("none");
        }
        for (i, pass) in self.passes().enumerate() {
            if i > 0 {
                f.write_str(",")?;
            }
            f.write_str(pass.name())?;
        }
        Ok(())
    }
}

impl FromStr for PassMask {
    type Err = ConfigError;

    /// Parses `none`, `all`, a number (`5`, `0xf`) or a list of pass names
    /// separated by `,` or `|`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        match s {
            "" | "none" => return Ok(PassMask::NONE),
            "all" => return Ok(PassMask::ALL),
            _ => {}
        }

        let numeric = match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
            Some(hex) => u32::from_str_radix(hex, 16).ok(),
            None => s.parse::<u32>().ok(),
        };
        if let Some(bits) = numeric {
            return PassMask::from_bits(bits);
        }

        let mut mask = PassMask::NONE;
        for name in s.split([',', '|']).map(str::trim).filter(|n| !n.is_empty()) {
            let pass = Pass::from_name(name)
                .ok_or_else(|| ConfigError::UnknownPass { name: name.to_string() })?;
            mask |= pass.mask();
        }
        Ok(mask)
    }
}

/// One pass execution recorded by [`apply_passes`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PassRun {
    pub pass: Pass,
    pub rewritten: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PassReport {
    pub runs: Vec<PassRun>,
}

impl PassReport {
    pub fn total_rewritten(&self) -> usize {
        self.runs.iter().map(|r| r.rewritten).sum()
    }

    pub fn passes(&self) -> impl Iterator<Item = Pass> + '_ {
        self.runs.iter().map(|r| r.pass)
    }
}

/// Apply every pass selected by `mask` to `kernel`, in canonical order.
///
/// An empty mask leaves the kernel untouched. The kernel is verified after
/// each pass; a violation is reported as [`TranslateError::Consistency`]
/// and the kernel must not be used further.
pub fn apply_passes(kernel: &mut Kernel, mask: PassMask) -> TranslateResult<PassReport> {
    let mut report = PassReport::default();
    for pass in mask.passes() {
        let before = kernel.len();
        let rewritten = pass.run(kernel);
        kernel
            .verify()
            .map_err(|source| TranslateError::Consistency { pass: pass.name(), source })?;

        log::debug!(
            "{} on `{}`: {} statements rewritten ({} -> {} statements)",
            pass,
            kernel.name(),
            rewritten,
            before,
            kernel.len()
        );
        report.runs.push(PassRun { pass, rewritten });
    }
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::parse_kernel;

    #[test]
    fn test_canonical_order_ignores_bit_order() {
        let mask = PassMask::SYNC_ELIMINATION | PassMask::BLOCK_UNIFICATION | PassMask::REMOVE_BARRIERS;
        let order: Vec<_> = mask.passes().collect();
        assert_eq!(
            order,
            vec![Pass::BlockUnification, Pass::RemoveBarriers, Pass::SyncElimination]
        );
        assert_eq!(PassMask::NONE.passes().count(), 0);
    }

    #[test]
    fn test_unknown_bits_rejected() {
        assert_eq!(PassMask::from_bits(0x5), Ok(PassMask::REMOVE_BARRIERS | PassMask::BLOCK_UNIFICATION));
        assert_eq!(PassMask::from_bits(0x31), Err(ConfigError::UnknownPassBits { bits: 0x30 }));
    }

    #[test]
    fn test_mask_parsing() {
        assert_eq!("none".parse::<PassMask>(), Ok(PassMask::NONE));
        assert_eq!("all".parse::<PassMask>(), Ok(PassMask::ALL));
        assert_eq!("0x9".parse::<PassMask>(), Ok(PassMask::REMOVE_BARRIERS | PassMask::SYNC_ELIMINATION));
        assert_eq!(
            "BlockUnification|sync_elimination".parse::<PassMask>(),
            Ok(PassMask::BLOCK_UNIFICATION | PassMask::SYNC_ELIMINATION)
        );
        assert_eq!(
            "remove-barriers,frobnicate".parse::<PassMask>(),
            Err(ConfigError::UnknownPass { name: "frobnicate".into() })
        );

        let mask = PassMask::ALL;
        assert_eq!(
            mask.to_string(),
            "block-unification,reverse-if-conversion,remove-barriers,sync-elimination"
        );
        assert_eq!(mask.to_string().parse::<PassMask>(), Ok(mask));
    }

    #[test]
    fn test_empty_mask_is_noop() {
        let mut kernel = parse_kernel(
            ".kernel k
                bar.sync 0;
            L:
                ret;",
        )
        .unwrap();
        let before = kernel.clone();
        let report = apply_passes(&mut kernel, PassMask::NONE).unwrap();
        assert!(report.runs.is_empty());
        assert_eq!(kernel, before);
    }

    #[test]
    fn test_report_lists_selected_passes() {
        let mut kernel = parse_kernel(
            ".kernel k
                mov.s32 %r0, 1;
            NEXT:
                bar.sync 0;
                ret;",
        )
        .unwrap();
        let report = apply_passes(&mut kernel, PassMask::ALL).unwrap();
        assert_eq!(report.passes().collect::<Vec<_>>(), Pass::CANONICAL_ORDER.to_vec());
        assert_eq!(report.total_rewritten(), 2);
        assert_eq!(kernel.len(), 2);
    }
}
