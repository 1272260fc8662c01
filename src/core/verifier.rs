//! Dry-compile verification of a vector ISA.
//!
//! Hardware flags alone are not enough: the compiler in use must also accept
//! the ISA flags and the result must load. A full check costs about a second,
//! so results are cached twice. The boolean is memoized per process, and the
//! compiled artifact is kept on disk under a key that includes the compiler
//! version, the ISA flags and the crate version.

use crate::core::compiler::{
    compiler_version_info, locate_compiler, BuildError, BuildOptions, CCompiler, CompilerBuilder,
    ProbeBuilder,
};
use crate::core::loader::{default_loader, ArtifactLoader, LoadError};
use crate::simd::descriptor::IsaDescriptor;
use crate::storage::cache::{ArtifactStore, DiskArtifactStore, StorageError};
use crate::storage::lock::FileLock;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, OnceLock, PoisonError};
use thiserror::Error;

pub const FRAMEWORK_VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Error, Debug)]
pub enum VerifyError {
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error(transparent)]
    Build(#[from] BuildError),
    #[error(transparent)]
    Load(#[from] LoadError),
}

pub struct DryCompileVerifier {
    store: Arc<dyn ArtifactStore>,
    builder: Arc<dyn ProbeBuilder>,
    loader: Arc<dyn ArtifactLoader>,
    compiler: Option<CCompiler>,
    compiler_version: OnceLock<String>,
    framework_version: String,
    memo: Mutex<HashMap<String, bool>>,
}

impl DryCompileVerifier {
    pub fn new(
        store: Arc<dyn ArtifactStore>,
        builder: Arc<dyn ProbeBuilder>,
        loader: Arc<dyn ArtifactLoader>,
    ) -> Self {
        Self {
            store,
            builder,
            loader,
            compiler: None,
            compiler_version: OnceLock::new(),
            framework_version: FRAMEWORK_VERSION.to_string(),
            memo: Mutex::new(HashMap::new()),
        }
    }

    /// Disk cache in the default location, the system compiler and the
    /// default loader. A missing compiler only shows up later as failed
    /// builds.
    pub fn native() -> Self {
        let (compiler, banner) = locate_compiler().unwrap_or_else(|e| {
            tracing::debug!("{}", e);
            (CCompiler::default_for_platform(), None)
        });
        let verifier = Self::new(
            Arc::new(DiskArtifactStore::default()),
            Arc::new(CompilerBuilder::new(compiler.clone())),
            default_loader(),
        )
        .with_compiler(compiler);
        match banner {
            Some(banner) => verifier.with_compiler_version(banner),
            None => verifier,
        }
    }

    /// Compiler whose version goes into the fingerprint. Queried lazily.
    pub fn with_compiler(mut self, compiler: CCompiler) -> Self {
        self.compiler = Some(compiler);
        self
    }

    /// Pin the compiler version instead of asking the compiler.
    pub fn with_compiler_version(self, version: impl Into<String>) -> Self {
        let _ = self.compiler_version.set(version.into());
        self
    }

    pub fn with_framework_version(mut self, version: impl Into<String>) -> Self {
        self.framework_version = version.into();
        self
    }

    pub fn compiler_version(&self) -> &str {
        self.compiler_version.get_or_init(|| {
            self.compiler
                .as_ref()
                .map(compiler_version_info)
                .unwrap_or_default()
        })
    }

    pub fn fingerprint(&self, isa: &IsaDescriptor) -> String {
        format!(
            "{}={}={}",
            self.compiler_version(),
            isa.arch_flags(),
            self.framework_version
        )
    }

    /// Does the generic vector probe build and load for `isa`? Memoized.
    pub fn verify(&self, isa: &IsaDescriptor) -> bool {
        if !isa.is_valid() {
            return false;
        }
        let name = isa.name();
        if let Some(&usable) = self.memo().get(&name) {
            return usable;
        }
        let usable = self.check_build(isa, &isa.probe_source());
        self.memo().insert(name, usable);
        usable
    }

    /// Build and load `source` with `isa`'s flags. Not memoized.
    pub fn check_build(&self, isa: &IsaDescriptor, source: &str) -> bool {
        match self.try_check_build(isa, source) {
            Ok(()) => {
                tracing::debug!("{} passed dry compile", isa);
                true
            }
            Err(e) => {
                tracing::debug!("{} failed dry compile: {}", isa, e);
                false
            }
        }
    }

    fn try_check_build(&self, isa: &IsaDescriptor, source: &str) -> Result<(), VerifyError> {
        let fingerprint = self.fingerprint(isa);
        let (key, input_path) = self.store.write(source, "c", &fingerprint)?;

        let lock_path = self.store.lock_dir().join(format!("{}.lock", key));
        let _lock = FileLock::acquire(&lock_path, self.store.lock_timeout())?;

        let output_dir = input_path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));
        let mut target = self.builder.target_path(&key, &output_dir);
        if !target.is_file() {
            let options = BuildOptions::new(*isa);
            target = self
                .builder
                .build(&key, &[input_path], &options, &output_dir)?;
        }

        self.loader.load(&target)?;
        Ok(())
    }

    fn memo(&self) -> std::sync::MutexGuard<'_, HashMap<String, bool>> {
        self.memo.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::simd::catalog::{INVALID_VEC_ISA, VEC_AVX2, VEC_AVX512};
    use std::fs;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;
    use std::time::Duration;

    /// Writes a dummy artifact; fails for any ISA named in `reject`.
    #[derive(Default)]
    pub(crate) struct FakeBuilder {
        pub builds: AtomicUsize,
        pub reject: Vec<String>,
        pub delay: Duration,
    }

    impl ProbeBuilder for FakeBuilder {
        fn target_path(&self, key: &str, output_dir: &Path) -> PathBuf {
            output_dir.join(format!("{}.so", key))
        }

        fn build(
            &self,
            key: &str,
            _sources: &[PathBuf],
            options: &BuildOptions,
            output_dir: &Path,
        ) -> Result<PathBuf, BuildError> {
            self.builds.fetch_add(1, Ordering::SeqCst);
            thread::sleep(self.delay);
            if self.reject.contains(&options.vec_isa.name()) {
                return Err(BuildError::Failed {
                    program: "fake-cc".to_string(),
                    stderr: "unsupported".to_string(),
                });
            }
            let path = self.target_path(key, output_dir);
            fs::write(&path, b"artifact").map_err(|source| BuildError::Spawn {
                program: "fake-cc".to_string(),
                source,
            })?;
            Ok(path)
        }
    }

    /// Succeeds whenever the artifact exists.
    #[derive(Default)]
    pub(crate) struct FakeLoader {
        pub loads: AtomicUsize,
    }

    impl ArtifactLoader for FakeLoader {
        fn load(&self, artifact: &Path) -> Result<(), LoadError> {
            self.loads.fetch_add(1, Ordering::SeqCst);
            fs::metadata(artifact)?;
            Ok(())
        }
    }

    fn verifier(
        root: &Path,
        builder: Arc<FakeBuilder>,
        loader: Arc<FakeLoader>,
        compiler: &str,
    ) -> DryCompileVerifier {
        DryCompileVerifier::new(Arc::new(DiskArtifactStore::new(root)), builder, loader)
            .with_compiler_version(compiler)
    }

    #[test]
    fn test_fingerprint_format() {
        let dir = tempfile::tempdir().unwrap();
        let v = verifier(dir.path(), Default::default(), Default::default(), "gcc 13")
            .with_framework_version("9.9");
        assert_eq!(
            v.fingerprint(&VEC_AVX2),
            format!("gcc 13={}=9.9", VEC_AVX2.arch_flags())
        );
    }

    #[test]
    fn test_verify_builds_once_then_memoizes() {
        let dir = tempfile::tempdir().unwrap();
        let builder = Arc::new(FakeBuilder::default());
        let loader = Arc::new(FakeLoader::default());
        let v = verifier(dir.path(), builder.clone(), loader.clone(), "gcc 13");

        assert!(v.verify(&VEC_AVX2));
        assert!(v.verify(&VEC_AVX2));
        assert_eq!(builder.builds.load(Ordering::SeqCst), 1);
        assert_eq!(loader.loads.load(Ordering::SeqCst), 1);
        assert!(dir.path().join("locks").is_dir());
    }

    #[test]
    fn test_artifact_reused_across_processes() {
        let dir = tempfile::tempdir().unwrap();
        let builder = Arc::new(FakeBuilder::default());

        let first = verifier(dir.path(), builder.clone(), Default::default(), "gcc 13");
        assert!(first.verify(&VEC_AVX2));
        let second = verifier(dir.path(), builder.clone(), Default::default(), "gcc 13");
        assert!(second.verify(&VEC_AVX2));

        assert_eq!(builder.builds.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_compiler_upgrade_forces_rebuild() {
        let dir = tempfile::tempdir().unwrap();
        let builder = Arc::new(FakeBuilder::default());

        let old = verifier(dir.path(), builder.clone(), Default::default(), "gcc 12");
        assert!(old.verify(&VEC_AVX2));
        let upgraded = verifier(dir.path(), builder.clone(), Default::default(), "gcc 13");
        assert!(upgraded.verify(&VEC_AVX2));

        assert_eq!(builder.builds.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_build_failure_is_not_usable_and_isolated() {
        let dir = tempfile::tempdir().unwrap();
        let builder = Arc::new(FakeBuilder {
            reject: vec!["avx512".to_string()],
            ..Default::default()
        });
        let loader = Arc::new(FakeLoader::default());
        let v = verifier(dir.path(), builder, loader.clone(), "gcc 13");

        assert!(!v.verify(&VEC_AVX512));
        assert!(v.verify(&VEC_AVX2));
        assert_eq!(loader.loads.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_load_failure_is_not_usable() {
        struct Crashing;
        impl ArtifactLoader for Crashing {
            fn load(&self, artifact: &Path) -> Result<(), LoadError> {
                Err(LoadError::Timeout {
                    artifact: artifact.to_path_buf(),
                    timeout: Duration::ZERO,
                })
            }
        }
        let dir = tempfile::tempdir().unwrap();
        let v = DryCompileVerifier::new(
            Arc::new(DiskArtifactStore::new(dir.path())),
            Arc::new(FakeBuilder::default()),
            Arc::new(Crashing),
        )
        .with_compiler_version("gcc 13");
        assert!(!v.verify(&VEC_AVX2));
    }

    #[test]
    fn test_lock_timeout_is_not_usable() {
        let dir = tempfile::tempdir().unwrap();
        let store = DiskArtifactStore::new(dir.path()).with_lock_timeout(Duration::from_millis(50));
        let v = DryCompileVerifier::new(
            Arc::new(store.clone()),
            Arc::new(FakeBuilder::default()),
            Arc::new(FakeLoader::default()),
        )
        .with_compiler_version("gcc 13");

        let (key, _) = store
            .write(&VEC_AVX2.probe_source(), "c", &v.fingerprint(&VEC_AVX2))
            .unwrap();
        let _held = FileLock::acquire(
            &store.lock_dir().join(format!("{}.lock", key)),
            Duration::from_secs(1),
        )
        .unwrap();

        assert!(!v.check_build(&VEC_AVX2, &VEC_AVX2.probe_source()));
    }

    #[test]
    fn test_concurrent_verifiers_build_once() {
        let dir = tempfile::tempdir().unwrap();
        let builder = Arc::new(FakeBuilder {
            delay: Duration::from_millis(200),
            ..Default::default()
        });

        let handles: Vec<_> = (0..2)
            .map(|_| {
                let root = dir.path().to_path_buf();
                let builder = builder.clone();
                thread::spawn(move || {
                    let v = verifier(&root, builder, Default::default(), "gcc 13");
                    v.verify(&VEC_AVX2)
                })
            })
            .collect();

        for handle in handles {
            assert!(handle.join().unwrap());
        }
        assert_eq!(builder.builds.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_sentinel_never_probes() {
        let dir = tempfile::tempdir().unwrap();
        let builder = Arc::new(FakeBuilder::default());
        let v = verifier(dir.path(), builder.clone(), Default::default(), "gcc 13");
        assert!(!v.verify(&INVALID_VEC_ISA));
        assert_eq!(builder.builds.load(Ordering::SeqCst), 0);
        assert!(!dir.path().join("locks").exists());
    }

    #[test]
    fn test_missing_compiler_version_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let v = DryCompileVerifier::new(
            Arc::new(DiskArtifactStore::new(dir.path())),
            Arc::new(FakeBuilder::default()),
            Arc::new(FakeLoader::default()),
        )
        .with_compiler(CCompiler::Custom(dir.path().join("missing-cc")));
        assert_eq!(v.compiler_version(), "");
        assert!(v.fingerprint(&VEC_AVX2).starts_with('='));
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_real_compiler_and_loader() {
        use crate::core::runtime::{CpuQuery, NativeCpu};

        if !CCompiler::Gcc.is_available() {
            return;
        }
        let dir = tempfile::tempdir().unwrap();
        let v = DryCompileVerifier::new(
            Arc::new(DiskArtifactStore::new(dir.path())),
            Arc::new(CompilerBuilder::new(CCompiler::Gcc)),
            default_loader(),
        )
        .with_compiler(CCompiler::Gcc);

        assert_eq!(
            v.check_build(&VEC_AVX2, &VEC_AVX2.probe_source()),
            NativeCpu.supports_avx2()
        );
        let broken = format!("{}\nint broken( {{", VEC_AVX2.probe_source());
        assert!(!v.check_build(&VEC_AVX2, &broken));
    }
}
