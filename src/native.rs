use std::{
    ffi::{OsStr, OsString},
    io,
    path::PathBuf,
    process::{Command, Stdio},
};
use tracing::{debug, warn};

/// Runs a third-party installer. The exit code is the only success signal;
/// `None` means the process was killed by a signal.
pub trait NativeInstaller: Send + Sync {
    fn run(&self, args: &[OsString]) -> io::Result<Option<i32>>;
}

pub struct JavaRunner {
    java: PathBuf,
}

impl JavaRunner {
    pub fn new(java: impl Into<PathBuf>) -> Self {
        Self { java: java.into() }
    }
}

impl NativeInstaller for JavaRunner {
    fn run(&self, args: &[OsString]) -> io::Result<Option<i32>> {
        debug!(java = %self.java.display(), ?args, "running installer");
        let output = Command::new(&self.java)
            .args(args)
            .stdin(Stdio::null())
            .output()?;
        for line in String::from_utf8_lossy(&output.stdout).lines() {
            debug!(target: "packsmith::installer", "{line}");
        }
        if !output.status.success() {
            for line in String::from_utf8_lossy(&output.stderr).lines() {
                warn!(target: "packsmith::installer", "{line}");
            }
        }
        Ok(output.status.code())
    }
}

/// Platform classpath, e.g. `a.jar:b.jar` or `a.jar;b.jar` on Windows.
pub fn build_classpath<I, P>(entries: I) -> io::Result<OsString>
where
    I: IntoIterator<Item = P>,
    P: AsRef<OsStr>,
{
    std::env::join_paths(entries)
        .map_err(|err| io::Error::new(io::ErrorKind::InvalidInput, err.to_string()))
}
