//! Action dispatch
//!
//! Launches the user's action script in response to a change decision.
//! Dispatch is fire-and-forget: the caller gets the spawned child back
//! for registration with the reaper and is never blocked on it.

use std::fs;
use std::io::ErrorKind;
use std::os::unix::fs::PermissionsExt;
use std::os::unix::process::CommandExt;
use std::path::PathBuf;
use std::process::Stdio;

use tokio::process::{Child, Command};
use tracing::{debug, error, trace};

/// Synthetic status for the optional one-shot startup action.
pub const INIT_STATUS: &str = "init";

/// Where change decisions are turned into external action.
pub trait ActionSink {
    /// Launch the action with the given arguments. Returns the spawned
    /// child for reaping, or `None` when nothing was spawned; failures
    /// never surface beyond the log.
    fn dispatch(&mut self, status: &str, output: &str, fingerprint: &str) -> Option<Child>;
}

/// Spawns the configured script with the fixed argument contract:
/// argv[0] is the script basename, then the connection status, the
/// output name (possibly empty) and the fingerprint hex.
pub struct ScriptDispatcher {
    script: PathBuf,
}

impl ScriptDispatcher {
    pub fn new(script: PathBuf) -> Self {
        Self { script }
    }
}

impl ActionSink for ScriptDispatcher {
    fn dispatch(&mut self, status: &str, output: &str, fingerprint: &str) -> Option<Child> {
        let meta = match fs::metadata(&self.script) {
            Ok(meta) => meta,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                // No script installed means the feature is simply off.
                trace!("{}: no action script installed", self.script.display());
                return None;
            }
            Err(e) => {
                error!("{}: {e}", self.script.display());
                return None;
            }
        };
        let mode = meta.permissions().mode();
        if !meta.is_file() || mode & 0o111 == 0 || mode & 0o444 == 0 {
            error!("{}: not a readable executable", self.script.display());
            return None;
        }

        let arg0 = self
            .script
            .file_name()
            .map(|name| name.to_os_string())
            .unwrap_or_else(|| self.script.clone().into_os_string());

        let mut cmd = std::process::Command::new(&self.script);
        cmd.arg0(arg0)
            .arg(status)
            .arg(output)
            .arg(fingerprint)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null());

        match Command::from(cmd).spawn() {
            Ok(child) => {
                debug!(
                    "dispatched {}: {status} {output} {fingerprint}",
                    self.script.display()
                );
                Some(child)
            }
            Err(e) => {
                // A missed notification, not a daemon failure.
                error!("failed to spawn {}: {e}", self.script.display());
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn executable_script(dir: &tempfile::TempDir, name: &str, body: &str) -> PathBuf {
        let path = dir.path().join(name);
        let mut file = fs::File::create(&path).unwrap();
        writeln!(file, "#!/bin/sh").unwrap();
        writeln!(file, "{body}").unwrap();
        drop(file);
        let mut perms = fs::metadata(&path).unwrap().permissions();
        perms.set_mode(0o755);
        fs::set_permissions(&path, perms).unwrap();
        path
    }

    #[tokio::test]
    async fn missing_script_is_tolerated() {
        let mut dispatcher = ScriptDispatcher::new(PathBuf::from("/nonexistent/monwatch-action"));
        assert!(dispatcher
            .dispatch("connected", "DP-1", "abc123")
            .is_none());
    }

    #[tokio::test]
    async fn non_executable_script_is_not_spawned() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("action");
        fs::write(&path, "#!/bin/sh\nexit 0\n").unwrap();
        let mut perms = fs::metadata(&path).unwrap().permissions();
        perms.set_mode(0o644);
        fs::set_permissions(&path, perms).unwrap();

        let mut dispatcher = ScriptDispatcher::new(path);
        assert!(dispatcher.dispatch("connected", "DP-1", "abc123").is_none());
    }

    #[tokio::test]
    async fn dispatch_argument_fidelity() {
        let dir = tempfile::tempdir().unwrap();
        let record = dir.path().join("args.txt");
        let script = executable_script(
            &dir,
            "on-change",
            &format!("printf '%s|%s|%s' \"$1\" \"$2\" \"$3\" > {}", record.display()),
        );

        let mut dispatcher = ScriptDispatcher::new(script);
        let mut child = dispatcher
            .dispatch("disconnected", "DP-1", "abc123")
            .expect("script should spawn");
        let status = child.wait().await.unwrap();
        assert!(status.success());

        let recorded = fs::read_to_string(&record).unwrap();
        assert_eq!(recorded, "disconnected|DP-1|abc123");
    }

    #[tokio::test]
    async fn empty_arguments_pass_through() {
        let dir = tempfile::tempdir().unwrap();
        let record = dir.path().join("argc.txt");
        let script = executable_script(
            &dir,
            "on-change",
            &format!("printf '%d' \"$#\" > {}", record.display()),
        );

        let mut dispatcher = ScriptDispatcher::new(script);
        let mut child = dispatcher
            .dispatch(INIT_STATUS, "", "")
            .expect("script should spawn");
        child.wait().await.unwrap();

        // Empty strings are still distinct positional arguments.
        assert_eq!(fs::read_to_string(&record).unwrap(), "3");
    }
}
