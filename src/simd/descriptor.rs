use crate::core::hardware::Arch;
use crate::simd::probe;
use serde::Serialize;
use std::cmp::Ordering;
use std::fmt;
use std::hash::{Hash, Hasher};

/// Element types the code generator asks lane counts for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ElementType {
    Float,
    BFloat16,
    Float16,
}

/// Static record of a base vector variant.
#[derive(Debug)]
pub struct IsaSpec {
    pub name: &'static str,
    pub arch: Arch,
    pub bit_width: u32,
    pub macros: &'static [&'static str],
    pub arch_flags: &'static str,
    pub lanes: &'static [(ElementType, u32)],
    /// Baseline on its platform: kept without a dry compile.
    pub assume_usable: bool,
}

/// Extra capability layered on top of a base variant.
#[derive(Debug)]
pub struct IsaExtension {
    pub name: &'static str,
    pub macros: &'static [&'static str],
    pub arch_flags: &'static str,
    /// Kernel body compiled after the base probe passes.
    pub probe_kernel: &'static str,
    /// Needs the OS to grant extra register state before first use.
    pub requires_runtime_enable: bool,
}

/// One selectable vector ISA.
///
/// Identity is the display name: two descriptors compare, order and hash
/// equal exactly when their names match.
#[derive(Debug, Clone, Copy)]
pub struct IsaDescriptor {
    base: &'static IsaSpec,
    extension: Option<&'static IsaExtension>,
}

impl IsaDescriptor {
    pub const fn new(base: &'static IsaSpec) -> Self {
        Self {
            base,
            extension: None,
        }
    }

    pub const fn extended(base: &'static IsaSpec, extension: &'static IsaExtension) -> Self {
        Self {
            base,
            extension: Some(extension),
        }
    }

    pub fn base(&self) -> &'static IsaSpec {
        self.base
    }

    pub fn extension(&self) -> Option<&'static IsaExtension> {
        self.extension
    }

    pub fn arch(&self) -> Arch {
        self.base.arch
    }

    pub fn bit_width(&self) -> u32 {
        self.base.bit_width
    }

    /// False only for the "no vector ISA" sentinel.
    pub fn is_valid(&self) -> bool {
        self.base.bit_width != 0
    }

    pub fn name(&self) -> String {
        match self.extension {
            Some(ext) => format!("{} {}", self.base.name, ext.name),
            None => self.base.name.to_string(),
        }
    }

    /// Host feature names that must all be present for this ISA to be considered.
    pub fn feature_names(&self) -> Vec<&'static str> {
        let mut names = vec![self.base.name];
        if let Some(ext) = self.extension {
            names.push(ext.name);
        }
        names
    }

    pub fn macros(&self) -> Vec<&'static str> {
        let mut macros = self.base.macros.to_vec();
        if let Some(ext) = self.extension {
            macros.extend_from_slice(ext.macros);
        }
        macros
    }

    pub fn arch_flags(&self) -> String {
        match self.extension {
            Some(ext) if !ext.arch_flags.is_empty() => {
                format!("{} {}", self.base.arch_flags, ext.arch_flags)
            }
            _ => self.base.arch_flags.to_string(),
        }
    }

    /// Vector lanes for `dtype`, or `None` if the ISA has no vector type for it.
    pub fn nelements(&self, dtype: ElementType) -> Option<u32> {
        self.base
            .lanes
            .iter()
            .find(|(ty, _)| *ty == dtype)
            .map(|(_, n)| *n)
    }

    pub fn assume_usable(&self) -> bool {
        self.base.assume_usable
    }

    /// Minimal self-test translation unit shared by all variants; the
    /// capability macros passed at build time choose the kernel.
    pub fn probe_source(&self) -> String {
        probe::render(probe::VEC_KERNEL)
    }

    pub fn extension_probe_source(&self) -> Option<String> {
        self.extension.map(|ext| probe::render(ext.probe_kernel))
    }
}

impl fmt::Display for IsaDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name())
    }
}

impl PartialEq for IsaDescriptor {
    fn eq(&self, other: &Self) -> bool {
        self.name() == other.name()
    }
}

impl Eq for IsaDescriptor {}

impl PartialOrd for IsaDescriptor {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for IsaDescriptor {
    fn cmp(&self, other: &Self) -> Ordering {
        self.name().cmp(&other.name())
    }
}

impl Hash for IsaDescriptor {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.name().hash(state);
    }
}
