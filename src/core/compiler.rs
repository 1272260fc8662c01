//! C compiler toolchain abstraction
//!
//! Finds the native compiler, reports its version for fingerprinting and
//! builds probe sources into shared libraries.

use crate::simd::descriptor::IsaDescriptor;
use std::ffi::OsString;
use std::io;
use std::path::{Path, PathBuf};
use std::process::Command;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum BuildError {
    #[error("no C compiler found, install {0} or set CC")]
    CompilerNotFound(String),
    #[error("failed to run {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: io::Error,
    },
    #[error("{program} compilation failed:\n{stderr}")]
    Failed { program: String, stderr: String },
}

/// Supported C compilers
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CCompiler {
    /// Clang (default on macOS)
    Clang,
    /// GCC (default on Linux)
    Gcc,
    /// MSVC cl.exe (default on Windows)
    Msvc,
    /// Whatever `CC` points at. Treated as GCC-compatible unless it is `cl`.
    Custom(PathBuf),
}

impl CCompiler {
    pub fn default_for_platform() -> Self {
        if cfg!(target_os = "macos") {
            CCompiler::Clang
        } else if cfg!(target_os = "windows") {
            CCompiler::Msvc
        } else {
            CCompiler::Gcc
        }
    }

    pub fn from_env() -> Option<Self> {
        std::env::var_os("CC")
            .filter(|cc| !cc.is_empty())
            .map(|cc| CCompiler::Custom(PathBuf::from(cc)))
    }

    pub fn executable(&self) -> OsString {
        match self {
            CCompiler::Clang => "clang".into(),
            CCompiler::Gcc => "gcc".into(),
            CCompiler::Msvc => "cl.exe".into(),
            CCompiler::Custom(path) => path.clone().into_os_string(),
        }
    }

    pub fn is_msvc(&self) -> bool {
        match self {
            CCompiler::Msvc => true,
            CCompiler::Custom(path) => path
                .file_stem()
                .is_some_and(|stem| stem.eq_ignore_ascii_case("cl")),
            _ => false,
        }
    }

    pub fn is_available(&self) -> bool {
        !compiler_version_info(self).is_empty()
    }

    pub fn shared_lib_extension() -> &'static str {
        if cfg!(target_os = "windows") {
            "dll"
        } else if cfg!(target_os = "macos") {
            "dylib"
        } else {
            "so"
        }
    }

    fn display_name(&self) -> String {
        self.executable().to_string_lossy().into_owned()
    }
}

/// `CC` if set, else the platform default, else any alternative that runs.
pub fn find_compiler() -> Result<CCompiler, BuildError> {
    locate_compiler().map(|(compiler, _)| compiler)
}

/// Like [`find_compiler`], but also hands back the version banner when
/// finding the compiler already required running it.
pub fn locate_compiler() -> Result<(CCompiler, Option<String>), BuildError> {
    if let Some(cc) = CCompiler::from_env() {
        return Ok((cc, None));
    }

    let default = CCompiler::default_for_platform();
    let alternatives = match default {
        CCompiler::Clang => vec![CCompiler::Clang, CCompiler::Gcc],
        CCompiler::Gcc => vec![CCompiler::Gcc, CCompiler::Clang],
        CCompiler::Msvc | CCompiler::Custom(_) => {
            vec![default.clone(), CCompiler::Gcc, CCompiler::Clang]
        }
    };
    first_available(alternatives)
        .map(|(compiler, banner)| (compiler, Some(banner)))
        .ok_or_else(|| BuildError::CompilerNotFound(default.display_name()))
}

fn first_available(candidates: Vec<CCompiler>) -> Option<(CCompiler, String)> {
    candidates.into_iter().find_map(|compiler| {
        let banner = compiler_version_info(&compiler);
        (!banner.is_empty()).then_some((compiler, banner))
    })
}

/// One-line version banner of `compiler`, or an empty string if it cannot be run.
///
/// Tries `-v` first and falls back to `--version`. Output is captured
/// unlocalized and line breaks become `_`.
pub fn compiler_version_info(compiler: &CCompiler) -> String {
    for flag in ["-v", "--version"] {
        if let Some(banner) = run_version_flag(compiler, flag) {
            return normalize_version(&banner);
        }
    }
    tracing::debug!("could not query version of {}", compiler.display_name());
    String::new()
}

fn run_version_flag(compiler: &CCompiler, flag: &str) -> Option<String> {
    let output = Command::new(compiler.executable())
        .arg(flag)
        .env("LC_ALL", "C")
        .output()
        .ok()?;
    if !output.status.success() {
        return None;
    }
    let mut banner = String::from_utf8_lossy(&output.stdout).into_owned();
    banner.push_str(&String::from_utf8_lossy(&output.stderr));
    Some(banner)
}

pub fn normalize_version(banner: &str) -> String {
    banner.replace(['\r', '\n'], "_")
}

/// What a probe is built with.
#[derive(Debug, Clone)]
pub struct BuildOptions {
    /// Supplies the arch flags and capability macros.
    pub vec_isa: IsaDescriptor,
    pub warning_all: bool,
    pub opt_level: u8,
}

impl BuildOptions {
    pub fn new(vec_isa: IsaDescriptor) -> Self {
        Self {
            vec_isa,
            warning_all: false,
            opt_level: 2,
        }
    }
}

/// Build collaborator: turns sources into a loadable artifact.
pub trait ProbeBuilder: Send + Sync {
    /// Where `build` will put the artifact for `key`.
    fn target_path(&self, key: &str, output_dir: &Path) -> PathBuf;

    fn build(
        &self,
        key: &str,
        sources: &[PathBuf],
        options: &BuildOptions,
        output_dir: &Path,
    ) -> Result<PathBuf, BuildError>;
}

/// Shells out to a native C compiler to produce a shared library.
#[derive(Debug, Clone)]
pub struct CompilerBuilder {
    compiler: CCompiler,
}

impl CompilerBuilder {
    pub fn new(compiler: CCompiler) -> Self {
        Self { compiler }
    }

    pub fn compiler(&self) -> &CCompiler {
        &self.compiler
    }

    pub fn command(
        &self,
        sources: &[PathBuf],
        options: &BuildOptions,
        output_path: &Path,
    ) -> Command {
        let mut cmd = Command::new(self.compiler.executable());
        let isa = &options.vec_isa;
        let arch_flags = isa.arch_flags();
        let macros = isa.macros();
        let macros = macros.iter().filter(|m| !m.is_empty());

        if self.compiler.is_msvc() {
            cmd.arg("/LD")
                .arg(format!("/O{}", options.opt_level.min(2)))
                .arg(if options.warning_all { "/W4" } else { "/w" });
            for m in macros {
                cmd.arg(format!("/D{}", m));
            }
            cmd.args(arch_flags.split_whitespace())
                .arg(format!("/Fe:{}", output_path.display()))
                .args(sources);
        } else {
            cmd.arg("-shared")
                .arg("-fPIC")
                .arg(format!("-O{}", options.opt_level.min(3)))
                .arg(if options.warning_all { "-Wall" } else { "-w" });
            for m in macros {
                cmd.arg(format!("-D{}", m));
            }
            cmd.args(arch_flags.split_whitespace())
                .arg("-o")
                .arg(output_path)
                .args(sources);
            if cfg!(target_os = "macos") {
                cmd.arg("-dynamiclib");
            }
        }
        cmd.env("LC_ALL", "C");
        cmd
    }
}

impl ProbeBuilder for CompilerBuilder {
    fn target_path(&self, key: &str, output_dir: &Path) -> PathBuf {
        output_dir.join(format!("{}.{}", key, CCompiler::shared_lib_extension()))
    }

    fn build(
        &self,
        key: &str,
        sources: &[PathBuf],
        options: &BuildOptions,
        output_dir: &Path,
    ) -> Result<PathBuf, BuildError> {
        let output_path = self.target_path(key, output_dir);
        let program = self.compiler.display_name();
        tracing::debug!("building {:?} for {}", output_path, options.vec_isa);

        let output = self
            .command(sources, options, &output_path)
            .output()
            .map_err(|source| BuildError::Spawn {
                program: program.clone(),
                source,
            })?;

        if !output.status.success() {
            return Err(BuildError::Failed {
                program,
                stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            });
        }
        Ok(output_path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::simd::catalog::{VEC_AMX, VEC_ZVECTOR};

    fn args_of(cmd: &Command) -> Vec<String> {
        cmd.get_args()
            .map(|a| a.to_string_lossy().into_owned())
            .collect()
    }

    #[test]
    fn test_normalize_version_single_line() {
        let banner = "gcc version 13.2.0\r\nTarget: x86_64-linux-gnu\n";
        assert_eq!(
            normalize_version(banner),
            "gcc version 13.2.0__Target: x86_64-linux-gnu_"
        );
    }

    #[test]
    fn test_missing_compiler_yields_empty_version() {
        let cc = CCompiler::Custom(PathBuf::from("/nonexistent/vecisa-cc"));
        assert_eq!(compiler_version_info(&cc), "");
        assert!(!cc.is_available());
    }

    #[test]
    fn test_first_available_keeps_banner() {
        let missing = CCompiler::Custom(PathBuf::from("/nonexistent/vecisa-cc"));
        assert_eq!(first_available(vec![missing.clone()]), None);

        if !CCompiler::Gcc.is_available() {
            return;
        }
        let (found, banner) = first_available(vec![missing, CCompiler::Gcc]).unwrap();
        assert_eq!(found, CCompiler::Gcc);
        assert_eq!(banner, compiler_version_info(&CCompiler::Gcc));
    }

    #[test]
    fn test_msvc_detection() {
        assert!(CCompiler::Msvc.is_msvc());
        assert!(CCompiler::Custom(PathBuf::from("C:/VS/bin/CL.exe")).is_msvc());
        assert!(!CCompiler::Custom(PathBuf::from("/usr/bin/clang-17")).is_msvc());
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_gnu_command_carries_isa_flags_and_macros() {
        let builder = CompilerBuilder::new(CCompiler::Gcc);
        let out = Path::new("/tmp/out.so");
        let cmd = builder.command(
            &[PathBuf::from("/tmp/probe.c")],
            &BuildOptions::new(VEC_AMX),
            out,
        );
        let args = args_of(&cmd);
        assert!(args.contains(&"-shared".to_string()));
        assert!(args.contains(&"-DCPU_CAPABILITY_AVX512".to_string()));
        assert!(args.contains(&"-mavx512f".to_string()));
        assert!(args.contains(&"-mamx-tile".to_string()));
        assert!(args.contains(&"-w".to_string()));
        assert_eq!(args.last().map(String::as_str), Some("/tmp/probe.c"));
    }

    #[test]
    fn test_macro_with_value_is_passed_through() {
        let builder = CompilerBuilder::new(CCompiler::Gcc);
        let cmd = builder.command(&[], &BuildOptions::new(VEC_ZVECTOR), Path::new("o"));
        assert!(args_of(&cmd).contains(&"-DCPU_CAPABILITY=ZVECTOR".to_string()));
    }

    #[test]
    fn test_build_with_missing_compiler_is_spawn_error() {
        let dir = tempfile::tempdir().unwrap();
        let builder = CompilerBuilder::new(CCompiler::Custom(dir.path().join("no-cc")));
        let err = builder
            .build("ckey", &[], &BuildOptions::new(VEC_ZVECTOR), dir.path())
            .unwrap_err();
        assert!(matches!(err, BuildError::Spawn { .. }));
    }
}
