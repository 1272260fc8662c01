//! Hardware Detection Module
//! Reduces OS/CPU reported features to the short names the ISA catalog uses.
use crate::core::runtime::{CpuQuery, NativeCpu};
use bitflags::bitflags;
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, OnceLock, PoisonError};

pub const DEFAULT_CPUINFO_PATH: &str = "/proc/cpuinfo";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Os {
    Linux,
    Windows,
    MacOs,
    Other,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Arch {
    X86_64,
    Aarch64,
    S390x,
    Other,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Platform {
    pub os: Os,
    pub arch: Arch,
}

impl Platform {
    pub fn current() -> Self {
        Self::from_names(std::env::consts::OS, std::env::consts::ARCH)
    }

    /// Accepts the spellings different OSes and toolchains use
    /// (`x86_64` on Linux, `AMD64` on Windows, `arm64` on macOS, ...).
    pub fn from_names(os: &str, arch: &str) -> Self {
        let os = match os.to_ascii_lowercase().as_str() {
            "linux" => Os::Linux,
            "windows" | "win32" => Os::Windows,
            "macos" | "darwin" => Os::MacOs,
            _ => Os::Other,
        };
        let arch = match arch.to_ascii_lowercase().as_str() {
            "x86_64" | "amd64" | "x64" => Arch::X86_64,
            "aarch64" | "arm64" => Arch::Aarch64,
            "s390x" => Arch::S390x,
            _ => Arch::Other,
        };
        Self { os, arch }
    }

    pub fn is_apple_silicon(&self) -> bool {
        self.os == Os::MacOs && self.arch == Arch::Aarch64
    }

    /// Only these OSes get a catalog scan beyond the Apple baseline.
    pub fn scans_catalog(&self) -> bool {
        matches!(self.os, Os::Linux | Os::Windows)
    }
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct HostFeatures: u8 {
        const AVX2 = 1 << 0;
        const AVX512 = 1 << 1;
        const AMX_TILE = 1 << 2;
        const ASIMD = 1 << 3;
        const ZVECTOR = 1 << 4;
    }
}

const FEATURE_NAMES: [(HostFeatures, &str); 5] = [
    (HostFeatures::AVX2, "avx2"),
    (HostFeatures::AVX512, "avx512"),
    (HostFeatures::AMX_TILE, "amx_tile"),
    (HostFeatures::ASIMD, "asimd"),
    (HostFeatures::ZVECTOR, "zvector"),
];

impl HostFeatures {
    pub fn from_short_name(name: &str) -> Option<Self> {
        FEATURE_NAMES
            .iter()
            .find(|(_, short)| *short == name)
            .map(|(flag, _)| *flag)
    }

    pub fn from_short_names<'a>(names: impl IntoIterator<Item = &'a str>) -> Self {
        names
            .into_iter()
            .filter_map(Self::from_short_name)
            .fold(Self::empty(), |acc, flag| acc | flag)
    }

    pub fn short_names(&self) -> Vec<&'static str> {
        FEATURE_NAMES
            .iter()
            .filter(|(flag, _)| self.contains(*flag))
            .map(|(_, name)| *name)
            .collect()
    }

    /// Unknown names never match, so a descriptor needing one is never considered.
    pub fn has_all(&self, names: &[&str]) -> bool {
        names
            .iter()
            .all(|name| Self::from_short_name(name).is_some_and(|flag| self.contains(flag)))
    }
}

impl Serialize for HostFeatures {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_seq(self.short_names())
    }
}

/// Memoizing host feature probe.
///
/// The platform, CPU primitives and cpuinfo location are injectable so tests
/// can simulate other machines; `reset` forgets the cached answer.
pub struct HostFeatureProbe {
    platform: Platform,
    cpu: Arc<dyn CpuQuery>,
    cpuinfo_path: PathBuf,
    cached: Mutex<Option<HostFeatures>>,
}

impl HostFeatureProbe {
    pub fn new(platform: Platform, cpu: Arc<dyn CpuQuery>) -> Self {
        Self {
            platform,
            cpu,
            cpuinfo_path: PathBuf::from(DEFAULT_CPUINFO_PATH),
            cached: Mutex::new(None),
        }
    }

    pub fn native() -> Self {
        Self::new(Platform::current(), Arc::new(NativeCpu))
    }

    pub fn with_cpuinfo_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.cpuinfo_path = path.into();
        self
    }

    pub fn platform(&self) -> Platform {
        self.platform
    }

    pub fn cpu(&self) -> &dyn CpuQuery {
        self.cpu.as_ref()
    }

    pub fn detect(&self) -> HostFeatures {
        let mut cached = self.cached.lock().unwrap_or_else(PoisonError::into_inner);
        *cached.get_or_insert_with(|| {
            let features = self.probe();
            tracing::debug!(
                "host {:?}/{:?} reports {:?}",
                self.platform.os,
                self.platform.arch,
                features.short_names()
            );
            features
        })
    }

    pub fn reset(&self) {
        *self.cached.lock().unwrap_or_else(PoisonError::into_inner) = None;
    }

    fn probe(&self) -> HostFeatures {
        if self.platform.is_apple_silicon() {
            return HostFeatures::ASIMD;
        }
        if !self.platform.scans_catalog() {
            return HostFeatures::empty();
        }

        match self.platform.arch {
            Arch::Aarch64 => HostFeatures::ASIMD,
            Arch::S390x => s390x_features(&self.cpuinfo_path),
            Arch::X86_64 => x86_features(self.cpu.as_ref()),
            Arch::Other => HostFeatures::empty(),
        }
    }
}

fn x86_features(cpu: &dyn CpuQuery) -> HostFeatures {
    let mut features = HostFeatures::empty();
    features.set(HostFeatures::AVX2, cpu.supports_avx2());
    features.set(HostFeatures::AVX512, cpu.supports_avx512());
    features.set(HostFeatures::AMX_TILE, cpu.supports_amx_tile());
    features
}

/// Unreadable cpuinfo means "nothing", not an error.
fn s390x_features(cpuinfo: &Path) -> HostFeatures {
    match std::fs::read_to_string(cpuinfo) {
        Ok(content) => parse_s390x_cpuinfo(&content),
        Err(e) => {
            tracing::debug!("cannot read {:?}: {}", cpuinfo, e);
            HostFeatures::empty()
        }
    }
}

pub fn parse_s390x_cpuinfo(content: &str) -> HostFeatures {
    for line in content.lines() {
        let line = line.trim_start();
        let Some(rest) = line.strip_prefix("features") else {
            continue;
        };
        if !rest.trim_start().starts_with(':') {
            continue;
        }
        if let Some(tokens) = parse_value(line) {
            if tokens.split_whitespace().any(|token| token == "vxe") {
                return HostFeatures::ZVECTOR;
            }
        }
    }
    HostFeatures::empty()
}

fn parse_value(line: &str) -> Option<&str> {
    line.split_once(':').map(|(_, value)| value.trim())
}

/// Host features of this process, probed once.
pub fn host_features() -> HostFeatures {
    static HOST: OnceLock<HostFeatures> = OnceLock::new();
    *HOST.get_or_init(|| HostFeatureProbe::native().detect())
}
