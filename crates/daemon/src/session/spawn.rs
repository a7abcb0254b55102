//! Process spawning.
//!
//! Opens a pseudo-terminal pair, starts a shell attached to the slave side
//! and hands back the master-side handles the session needs.

use std::io::{Read, Write};
use std::path::PathBuf;

use portable_pty::{native_pty_system, Child, ChildKiller, CommandBuilder, MasterPty, PtySize};

use super::pty::SessionError;

/// Terminal type advertised to spawned shells.
pub const DEFAULT_TERM: &str = "xterm-256color";

/// Locale advertised to spawned shells.
pub const DEFAULT_LANG: &str = "en_US.UTF-8";

/// Options used to start a shell on a fresh PTY.
#[derive(Debug, Clone)]
pub struct SpawnOptions {
    /// Shell program. Falls back to `$SHELL`, then a platform default.
    pub shell: Option<String>,
    /// Initial window height.
    pub rows: u16,
    /// Initial window width.
    pub cols: u16,
    /// Value for `TERM`.
    pub term: String,
    /// Value for `LANG` and `LC_ALL`.
    pub lang: String,
    /// Extra environment variables, applied after the defaults.
    pub env: Vec<(String, String)>,
    /// Working directory for the shell.
    pub cwd: Option<PathBuf>,
}

impl Default for SpawnOptions {
    fn default() -> Self {
        Self {
            shell: None,
            rows: protocol::DEFAULT_ROWS,
            cols: protocol::DEFAULT_COLS,
            term: DEFAULT_TERM.to_string(),
            lang: DEFAULT_LANG.to_string(),
            env: Vec::new(),
            cwd: None,
        }
    }
}

/// Master-side handles of a running shell.
pub struct SpawnedPty {
    /// Resolved shell program.
    pub shell: String,
    /// PTY master, kept for resizing.
    pub master: Box<dyn MasterPty + Send>,
    /// Output stream of the PTY.
    pub reader: Box<dyn Read + Send>,
    /// Input stream of the PTY.
    pub writer: Box<dyn Write + Send>,
    /// The shell process.
    pub child: Box<dyn Child + Send + Sync>,
    /// Handle able to signal the shell without owning it.
    pub killer: Box<dyn ChildKiller + Send + Sync>,
    /// Process id of the shell, when the platform reports one.
    pub pid: Option<u32>,
}

impl std::fmt::Debug for SpawnedPty {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SpawnedPty")
            .field("shell", &self.shell)
            .field("pid", &self.pid)
            .finish_non_exhaustive()
    }
}

/// Starts a shell on a new PTY sized `options.rows` x `options.cols`.
///
/// The shell inherits the daemon's environment with `TERM`, `COLORTERM`,
/// `LANG` and `LC_ALL` overridden. If anything fails after the process has
/// started, the process is killed and reaped before the error is returned.
pub fn spawn_pty(options: &SpawnOptions) -> Result<SpawnedPty, SessionError> {
    let shell = detect_shell(options.shell.clone());

    let pair = native_pty_system()
        .openpty(PtySize {
            rows: options.rows,
            cols: options.cols,
            pixel_width: 0,
            pixel_height: 0,
        })
        .map_err(|e| SessionError::Spawn(format!("failed to open PTY: {e}")))?;

    let mut cmd = CommandBuilder::new(&shell);
    cmd.env("TERM", &options.term);
    cmd.env("COLORTERM", "truecolor");
    cmd.env("LANG", &options.lang);
    cmd.env("LC_ALL", &options.lang);
    for (key, value) in &options.env {
        cmd.env(key, value);
    }
    if let Some(dir) = &options.cwd {
        cmd.cwd(dir);
    }

    let mut child = pair
        .slave
        .spawn_command(cmd)
        .map_err(|e| SessionError::Spawn(format!("failed to start {shell}: {e}")))?;

    // The shell holds its own copy of the slave side.
    drop(pair.slave);

    let master = pair.master;
    let handles = master
        .try_clone_reader()
        .and_then(|reader| Ok((reader, master.take_writer()?)));

    let (reader, writer) = match handles {
        Ok(handles) => handles,
        Err(e) => {
            reap(child.as_mut());
            return Err(SessionError::Spawn(format!(
                "failed to open PTY streams: {e}"
            )));
        }
    };

    let killer = child.clone_killer();
    let pid = child.process_id();

    tracing::debug!(shell = %shell, pid = ?pid, rows = options.rows, cols = options.cols, "Spawned shell");

    Ok(SpawnedPty {
        shell,
        master,
        reader,
        writer,
        child,
        killer,
        pid,
    })
}

/// Resolves the shell program.
///
/// Preference order: the explicit choice, `$SHELL`, then `/bin/sh`
/// (`powershell.exe` on Windows).
pub fn detect_shell(shell: Option<String>) -> String {
    if let Some(s) = shell.filter(|s| !s.trim().is_empty()) {
        return s;
    }

    std::env::var("SHELL")
        .ok()
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| platform_default_shell().to_string())
}

/// Shell used when nothing else is configured.
pub fn platform_default_shell() -> &'static str {
    if cfg!(windows) {
        "powershell.exe"
    } else {
        "/bin/sh"
    }
}

fn reap(child: &mut (dyn Child + Send + Sync)) {
    if let Err(e) = child.kill() {
        tracing::debug!(error = %e, "Kill after failed spawn returned an error");
    }
    if let Err(e) = child.wait() {
        tracing::warn!(error = %e, "Failed to reap shell after failed spawn");
    }
}

/// Sends SIGKILL to `pid`. Used when a shell ignores the hangup sent on close.
#[cfg(unix)]
pub(crate) fn force_kill(pid: u32) {
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;

    let Ok(raw) = i32::try_from(pid) else {
        return;
    };
    if let Err(e) = kill(Pid::from_raw(raw), Signal::SIGKILL) {
        tracing::debug!(pid, error = %e, "SIGKILL failed");
    }
}

#[cfg(not(unix))]
pub(crate) fn force_kill(_pid: u32) {}

#[cfg(test)]
mod tests {
    use super::*;

    fn sh() -> SpawnOptions {
        SpawnOptions {
            shell: Some("/bin/sh".to_string()),
            ..SpawnOptions::default()
        }
    }

    #[test]
    fn test_detect_shell_with_provided() {
        let shell = detect_shell(Some("/bin/bash".to_string()));
        assert_eq!(shell, "/bin/bash");
    }

    #[test]
    fn test_detect_shell_blank_falls_through() {
        let shell = detect_shell(Some("   ".to_string()));
        assert!(!shell.trim().is_empty());
    }

    #[test]
    fn test_detect_shell_from_env() {
        let shell = detect_shell(None);
        assert!(!shell.is_empty());
    }

    #[test]
    fn test_default_options() {
        let options = SpawnOptions::default();
        assert_eq!(options.rows, 24);
        assert_eq!(options.cols, 80);
        assert_eq!(options.term, "xterm-256color");
        assert_eq!(options.lang, "en_US.UTF-8");
        assert!(options.shell.is_none());
    }

    #[cfg(unix)]
    #[test]
    fn test_spawn_sets_initial_size() {
        let mut spawned = spawn_pty(&SpawnOptions {
            rows: 30,
            cols: 100,
            ..sh()
        })
        .unwrap();

        let size = spawned.master.get_size().unwrap();
        assert_eq!((size.rows, size.cols), (30, 100));
        assert!(spawned.pid.is_some());
        assert_eq!(spawned.shell, "/bin/sh");

        spawned.child.kill().unwrap();
        spawned.child.wait().unwrap();
    }

    #[cfg(unix)]
    #[test]
    fn test_spawn_exports_terminal_env() {
        let mut spawned = spawn_pty(&SpawnOptions {
            env: vec![("PTYHUB_TEST_VAR".to_string(), "marker_value".to_string())],
            ..sh()
        })
        .unwrap();

        spawned
            .writer
            .write_all(b"echo \"$TERM/$COLORTERM/$PTYHUB_TEST_VAR\"; exit\n")
            .unwrap();
        spawned.writer.flush().unwrap();

        let mut output = Vec::new();
        let mut buf = [0u8; 4096];
        loop {
            match spawned.reader.read(&mut buf) {
                Ok(0) | Err(_) => break,
                Ok(n) => output.extend_from_slice(&buf[..n]),
            }
            if String::from_utf8_lossy(&output).contains("xterm-256color/truecolor/marker_value") {
                break;
            }
        }

        let text = String::from_utf8_lossy(&output);
        assert!(
            text.contains("xterm-256color/truecolor/marker_value"),
            "unexpected output: {text}"
        );
        spawned.child.wait().unwrap();
    }

    #[test]
    fn test_spawn_missing_shell_fails() {
        let result = spawn_pty(&SpawnOptions {
            shell: Some("/nonexistent/ptyhub-shell".to_string()),
            ..SpawnOptions::default()
        });
        assert!(matches!(result, Err(SessionError::Spawn(_))));
    }
}
