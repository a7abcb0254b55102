//! Unix domain socket IPC between the `ptyhub` CLI and a running daemon.
//!
//! Each message is a single JSON value followed by a newline. The daemon
//! answers every request with exactly one response.
//!
//! ## Socket Path
//!
//! - Primary: `$XDG_RUNTIME_DIR/ptyhub/daemon.sock`
//! - Fallback: `/tmp/ptyhub-$UID/daemon.sock`
//! - `daemon.socket_path` in the config file overrides both.
//!
//! ## Example
//!
//! ```rust,no_run
//! use daemon::ipc::{get_socket_path, IpcClient};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let mut client = IpcClient::connect(&get_socket_path()).await?;
//!     if client.ping().await? {
//!         println!("Daemon is running");
//!     }
//!     Ok(())
//! }
//! ```

mod client;
mod messages;
mod server;

pub use client::IpcClient;
pub use messages::{IpcRequest, IpcResponse};
pub use server::{IpcConnection, IpcContext, IpcError, IpcServer};

use std::path::PathBuf;

/// Returns the default IPC socket path.
///
/// `$XDG_RUNTIME_DIR` is preferred since it is per-user, private and
/// cleared on logout.
#[cfg(unix)]
pub fn get_socket_path() -> PathBuf {
    if let Some(runtime_dir) = std::env::var_os("XDG_RUNTIME_DIR").filter(|d| !d.is_empty()) {
        return PathBuf::from(runtime_dir).join("ptyhub").join("daemon.sock");
    }

    let uid = nix::unistd::getuid();
    PathBuf::from(format!("/tmp/ptyhub-{uid}")).join("daemon.sock")
}

/// Unix domain sockets are unavailable here; the path is never bound.
#[cfg(not(unix))]
pub fn get_socket_path() -> PathBuf {
    std::env::temp_dir().join("ptyhub").join("daemon.sock")
}

/// Resolves the socket path, honouring a configured override.
pub fn resolve_socket_path(configured: Option<&std::path::Path>) -> PathBuf {
    configured
        .map(|p| p.to_path_buf())
        .unwrap_or_else(get_socket_path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    #[serial]
    fn test_get_socket_path_with_xdg_runtime_dir() {
        let original = std::env::var_os("XDG_RUNTIME_DIR");

        std::env::set_var("XDG_RUNTIME_DIR", "/run/user/1000");
        let path = get_socket_path();

        match original {
            Some(val) => std::env::set_var("XDG_RUNTIME_DIR", val),
            None => std::env::remove_var("XDG_RUNTIME_DIR"),
        }
        assert_eq!(path, PathBuf::from("/run/user/1000/ptyhub/daemon.sock"));
    }

    #[test]
    #[serial]
    fn test_get_socket_path_without_xdg_runtime_dir() {
        let original = std::env::var_os("XDG_RUNTIME_DIR");

        std::env::remove_var("XDG_RUNTIME_DIR");
        let path = get_socket_path();

        if let Some(val) = original {
            std::env::set_var("XDG_RUNTIME_DIR", val);
        }
        let path = path.to_string_lossy().into_owned();
        assert!(path.starts_with("/tmp/ptyhub-"), "unexpected path {path}");
        assert!(path.ends_with("/daemon.sock"));
    }

    #[test]
    fn test_resolve_socket_path_prefers_override() {
        let custom = PathBuf::from("/run/custom/ptyhub.sock");
        assert_eq!(resolve_socket_path(Some(&custom)), custom);
        assert!(resolve_socket_path(None).is_absolute());
    }
}
