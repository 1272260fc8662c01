//! Out-of-process artifact loading.
//!
//! A probe that traps (illegal instruction, bad relocation, missing symbol)
//! must only take down a child, never the process choosing an ISA.

#[cfg(unix)]
use crate::simd::probe::VEC_KERNEL_SYMBOL;
use std::io;
use std::path::{Path, PathBuf};
use std::process::{Command, ExitStatus, Stdio};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use thiserror::Error;

/// Overrides the location of the `probe_loader` helper.
pub const ENV_PROBE_LOADER: &str = "VECISA_PROBE_LOADER";

const WAIT_POLL: Duration = Duration::from_millis(10);

#[derive(Error, Debug)]
pub enum LoadError {
    #[error("failed to fork probe loader: {0}")]
    Fork(#[source] io::Error),
    #[error("failed to launch probe loader {program:?}: {source}")]
    Spawn {
        program: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("loading {artifact:?} failed ({status})")]
    Exit { artifact: PathBuf, status: ExitStatus },
    #[error("loading {artifact:?} did not finish within {timeout:?}")]
    Timeout { artifact: PathBuf, timeout: Duration },
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

pub trait ArtifactLoader: Send + Sync {
    /// Ok only if the artifact loaded and exercised cleanly.
    fn load(&self, artifact: &Path) -> Result<(), LoadError>;
}

/// `$VECISA_PROBE_LOADER` when set, else an in-process fork on unix, else
/// the `probe_loader` helper found by [`SubprocessLoader::locate`].
pub fn default_loader() -> Arc<dyn ArtifactLoader> {
    if std::env::var_os(ENV_PROBE_LOADER).is_some_and(|p| !p.is_empty()) {
        return Arc::new(SubprocessLoader::locate());
    }
    #[cfg(unix)]
    {
        Arc::new(ForkLoader::new())
    }
    #[cfg(not(unix))]
    {
        Arc::new(SubprocessLoader::locate())
    }
}

/// Forks, opens the artifact in the child and runs its vector kernel.
///
/// The child exits without returning to Rust code, so a trap or a non-zero
/// exit is the only thing the parent sees.
#[cfg(unix)]
#[derive(Debug, Clone, Default)]
pub struct ForkLoader {
    timeout: Option<Duration>,
}

#[cfg(unix)]
impl ForkLoader {
    pub fn new() -> Self {
        Self { timeout: None }
    }

    /// Kill the child if it has not exited after `timeout`.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    fn wait(&self, pid: libc::pid_t, artifact: &Path) -> Result<ExitStatus, LoadError> {
        use std::os::unix::process::ExitStatusExt;

        let deadline = self.timeout.map(|t| Instant::now() + t);
        let flags = if deadline.is_some() { libc::WNOHANG } else { 0 };
        let mut status: libc::c_int = 0;
        loop {
            let rc = unsafe { libc::waitpid(pid, &mut status, flags) };
            if rc == pid {
                return Ok(ExitStatus::from_raw(status));
            }
            if rc < 0 {
                let err = io::Error::last_os_error();
                if err.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                return Err(LoadError::Io(err));
            }
            if let (Some(deadline), Some(timeout)) = (deadline, self.timeout) {
                if Instant::now() >= deadline {
                    unsafe {
                        libc::kill(pid, libc::SIGKILL);
                        libc::waitpid(pid, &mut status, 0);
                    }
                    return Err(LoadError::Timeout {
                        artifact: artifact.to_path_buf(),
                        timeout,
                    });
                }
            }
            thread::sleep(WAIT_POLL);
        }
    }
}

// Runs in the forked child only. Never returns.
#[cfg(unix)]
fn exercise_in_child(artifact: &Path) -> ! {
    use libloading::{Library, Symbol};

    let code = match unsafe { Library::new(artifact) } {
        Ok(library) => {
            let kernel: Result<Symbol<unsafe extern "C" fn()>, _> =
                unsafe { library.get(VEC_KERNEL_SYMBOL.as_bytes()) };
            if let Ok(kernel) = kernel {
                unsafe { kernel() };
            }
            0
        }
        Err(_) => 1,
    };
    unsafe { libc::_exit(code) }
}

#[cfg(unix)]
impl ArtifactLoader for ForkLoader {
    fn load(&self, artifact: &Path) -> Result<(), LoadError> {
        match unsafe { libc::fork() } {
            -1 => Err(LoadError::Fork(io::Error::last_os_error())),
            0 => exercise_in_child(artifact),
            pid => {
                let status = self.wait(pid, artifact)?;
                if status.success() {
                    Ok(())
                } else {
                    Err(LoadError::Exit {
                        artifact: artifact.to_path_buf(),
                        status,
                    })
                }
            }
        }
    }
}

/// Runs `<program> <artifact>` and expects exit status 0.
#[derive(Debug, Clone)]
pub struct SubprocessLoader {
    program: PathBuf,
    timeout: Option<Duration>,
}

impl SubprocessLoader {
    pub const HELPER_NAME: &'static str = "probe_loader";

    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            timeout: None,
        }
    }

    /// Kill the child if it has not exited after `timeout`.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn program(&self) -> &Path {
        &self.program
    }

    /// `$VECISA_PROBE_LOADER`, else the helper installed next to the current
    /// executable (or one level up, as cargo lays out test binaries), else
    /// whatever `PATH` resolves.
    pub fn locate() -> Self {
        if let Some(program) = std::env::var_os(ENV_PROBE_LOADER).filter(|p| !p.is_empty()) {
            return Self::new(program);
        }

        let file_name = format!("{}{}", Self::HELPER_NAME, std::env::consts::EXE_SUFFIX);
        if let Ok(exe) = std::env::current_exe() {
            for dir in exe.ancestors().skip(1).take(2) {
                let candidate = dir.join(&file_name);
                if candidate.is_file() {
                    return Self::new(candidate);
                }
            }
        }
        Self::new(file_name)
    }
}

impl ArtifactLoader for SubprocessLoader {
    fn load(&self, artifact: &Path) -> Result<(), LoadError> {
        let mut child = Command::new(&self.program)
            .arg(artifact)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|source| LoadError::Spawn {
                program: self.program.clone(),
                source,
            })?;

        let status = match self.timeout {
            None => child.wait()?,
            Some(timeout) => {
                let deadline = Instant::now() + timeout;
                loop {
                    if let Some(status) = child.try_wait()? {
                        break status;
                    }
                    if Instant::now() >= deadline {
                        let _ = child.kill();
                        let _ = child.wait();
                        return Err(LoadError::Timeout {
                            artifact: artifact.to_path_buf(),
                            timeout,
                        });
                    }
                    thread::sleep(WAIT_POLL);
                }
            }
        };

        if status.success() {
            Ok(())
        } else {
            Err(LoadError::Exit {
                artifact: artifact.to_path_buf(),
                status,
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_helper_is_spawn_error() {
        let loader = SubprocessLoader::new("/nonexistent/probe_loader");
        let err = loader.load(Path::new("/tmp/x.so")).unwrap_err();
        assert!(matches!(err, LoadError::Spawn { .. }));
    }

    #[cfg(unix)]
    #[test]
    fn test_exit_status_decides() {
        assert!(SubprocessLoader::new("true").load(Path::new("a.so")).is_ok());
        let err = SubprocessLoader::new("false")
            .load(Path::new("a.so"))
            .unwrap_err();
        assert!(matches!(err, LoadError::Exit { .. }));
    }

    #[cfg(unix)]
    #[test]
    fn test_fork_loader_reports_unloadable_artifact() {
        let dir = tempfile::tempdir().unwrap();
        let bogus = dir.path().join("not_a_library.so");
        std::fs::write(&bogus, b"not an ELF file").unwrap();

        let err = ForkLoader::new().load(&bogus).unwrap_err();
        match err {
            LoadError::Exit { status, .. } => assert_eq!(status.code(), Some(1)),
            other => panic!("unexpected error: {other}"),
        }
        let missing = ForkLoader::new().load(&dir.path().join("missing.so"));
        assert!(matches!(missing, Err(LoadError::Exit { .. })));
    }

    #[cfg(unix)]
    #[test]
    fn test_hung_child_is_killed() {
        // `sleep <path>` fails fast on a bad argument, so give it a number.
        let loader = SubprocessLoader::new("sleep").with_timeout(Duration::from_millis(100));
        let started = Instant::now();
        let err = loader.load(Path::new("5")).unwrap_err();
        assert!(matches!(err, LoadError::Timeout { .. }));
        assert!(started.elapsed() < Duration::from_secs(5));
    }
}
