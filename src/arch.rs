//! Instruction set families a kernel can be written in or translated to.

use std::fmt;
use std::str::FromStr;

/// Closed set of architectures known to the toolchain.
///
/// Not every pair is translatable; see [`crate::lowering::LoweringRegistry`]
/// for the pairs that carry a lowering strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Architecture {
    /// NVIDIA PTX virtual ISA.
    Ptx,
    /// AMD intermediate language.
    Amdil,
    /// LLVM IR, used by the CPU execution path.
    Llvm,
    /// Host-side emulator.
    Emulated,
}

impl Architecture {
    pub const ALL: [Architecture; 4] = [
        Architecture::Ptx,
        Architecture::Amdil,
        Architecture::Llvm,
        Architecture::Emulated,
    ];

    pub const fn name(self) -> &'static str {
        match self {
            Architecture::Ptx => "ptx",
            Architecture::Amdil => "amdil",
            Architecture::Llvm => "llvm",
            Architecture::Emulated => "emulated",
        }
    }

    /// Physical register budget used when the caller supplies no override.
    pub const fn default_register_budget(self) -> u32 {
        match self {
            Architecture::Ptx => 63,
            Architecture::Amdil => 128,
            Architecture::Llvm => 16,
            Architecture::Emulated => 256,
        }
    }

    /// Bytes of per-thread scratch memory available for spill slots.
    pub const fn scratch_capacity(self) -> u32 {
        match self {
            Architecture::Ptx => 16 * 1024,
            Architecture::Amdil => 4 * 1024,
            Architecture::Llvm => 64 * 1024,
            Architecture::Emulated => u32::MAX,
        }
    }
}

impl fmt::Display for Architecture {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Architecture {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "ptx" => Ok(Architecture::Ptx),
            "amdil" | "il" => Ok(Architecture::Amdil),
            "llvm" => Ok(Architecture::Llvm),
            "emulated" | "emu" => Ok(Architecture::Emulated),
            other => Err(format!("unknown architecture `{other}`")),
        }
    }
}
