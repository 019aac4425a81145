//! Helpers for spawning and probing the external media tools used by `live-rec`.

use std::ffi::OsStr;
use std::path::{Path, PathBuf};
use std::process::Stdio;

#[cfg(windows)]
const CREATE_NO_WINDOW: u32 = 0x0800_0000;

/// Suppress the console window Windows opens for console children.
///
/// No-op elsewhere.
pub trait NoWindowExt {
    fn no_window(&mut self) -> &mut Self;
}

impl NoWindowExt for std::process::Command {
    fn no_window(&mut self) -> &mut Self {
        #[cfg(windows)]
        {
            use std::os::windows::process::CommandExt;
            self.creation_flags(CREATE_NO_WINDOW);
        }
        self
    }
}

#[cfg(feature = "tokio")]
impl NoWindowExt for tokio::process::Command {
    fn no_window(&mut self) -> &mut Self {
        #[cfg(windows)]
        {
            use std::os::windows::process::CommandExt;
            self.as_std_mut().creation_flags(CREATE_NO_WINDOW);
        }
        self
    }
}

/// Build a `tokio::process::Command` for a long-running media child.
///
/// stdin is closed so the tool never waits on the terminal, and the child is
/// killed if its handle is dropped while still running.
#[cfg(feature = "tokio")]
pub fn tokio_command(program: impl AsRef<OsStr>) -> tokio::process::Command {
    let mut cmd = tokio::process::Command::new(program);
    cmd.no_window().stdin(Stdio::null()).kill_on_drop(true);
    cmd
}

/// Run `<program> -version` and return the first line of its output.
///
/// `None` means the program could not be spawned or printed nothing, which
/// callers treat as "tool unavailable".
pub fn probe_version(program: impl AsRef<OsStr>) -> Option<String> {
    let output = std::process::Command::new(program)
        .no_window()
        .arg("-version")
        .stdin(Stdio::null())
        .stderr(Stdio::null())
        .output()
        .ok()?;

    String::from_utf8_lossy(&output.stdout)
        .lines()
        .map(str::trim)
        .find(|line| !line.is_empty())
        .map(str::to_string)
}

/// Locate `program` the way a shell would.
///
/// Paths with a directory component are returned as-is when they exist;
/// bare names are looked up in `PATH` (with `.exe` appended on Windows).
pub fn find_program(program: &str) -> Option<PathBuf> {
    let candidate = Path::new(program);
    if candidate.components().count() > 1 {
        return candidate.is_file().then(|| candidate.to_path_buf());
    }

    let paths = std::env::var_os("PATH")?;
    std::env::split_paths(&paths).find_map(|dir| {
        let full = dir.join(program);
        if full.is_file() {
            return Some(full);
        }
        if cfg!(windows) {
            let exe = full.with_extension("exe");
            if exe.is_file() {
                return Some(exe);
            }
        }
        None
    })
}
