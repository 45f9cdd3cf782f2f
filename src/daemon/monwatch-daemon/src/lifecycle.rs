//! Signal handling and child reaping
//!
//! Termination signals set an atomic flag and wake the event loop;
//! terminated action children are collected off the loop and logged
//! by exit status.

use std::os::unix::process::ExitStatusExt;
use std::process::ExitStatus;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::Result;
use tokio::process::Child;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::Notify;
use tokio::task::JoinSet;
use tracing::{debug, warn};

/// Cooperative shutdown: a lock-free flag set from signal context plus
/// a wakeup for the reconciler's wait.
#[derive(Clone, Default)]
pub struct ShutdownHandle {
    flag: Arc<AtomicBool>,
    wake: Arc<Notify>,
}

impl ShutdownHandle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn request(&self) {
        self.flag.store(true, Ordering::SeqCst);
        self.wake.notify_one();
    }

    pub fn is_requested(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    /// Resolves once shutdown has been requested; pair with
    /// `is_requested` checks at loop boundaries.
    pub async fn requested(&self) {
        self.wake.notified().await;
    }
}

/// Route termination signals into the shutdown handle.
///
/// SIGHUP is swallowed so that losing the controlling terminal never
/// stops the daemon.
pub fn spawn_signal_listener(shutdown: ShutdownHandle) -> Result<()> {
    let mut interrupt = signal(SignalKind::interrupt())?;
    let mut quit = signal(SignalKind::quit())?;
    let mut terminate = signal(SignalKind::terminate())?;
    let mut hangup = signal(SignalKind::hangup())?;

    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = interrupt.recv() => {}
                _ = quit.recv() => {}
                _ = terminate.recv() => {}
                _ = hangup.recv() => {
                    debug!("ignoring hangup");
                    continue;
                }
            }
            shutdown.request();
        }
    });
    Ok(())
}

/// Exit report for one reaped child.
#[derive(Debug)]
pub struct ChildExit {
    pub pid: Option<u32>,
    pub status: std::io::Result<ExitStatus>,
}

impl ChildExit {
    /// Non-zero exits are notable, abnormal terminations distinctly
    /// so; a clean exit stays quiet under default verbosity.
    pub fn log(&self) {
        let pid = self.pid.unwrap_or(0);
        match &self.status {
            Ok(status) if status.success() => debug!("child {pid} exited cleanly"),
            Ok(status) => match status.code() {
                Some(code) => warn!("child {pid} exit status: {code}"),
                None => match status.signal() {
                    Some(sig) => warn!("child {pid} terminated abnormally (signal {sig})"),
                    None => warn!("child {pid} terminated abnormally"),
                },
            },
            Err(e) => warn!("wait for child {pid} failed: {e}"),
        }
    }
}

/// Registry of in-flight action children.
///
/// Each child is waited on off the event loop; one reap sweep collects
/// every already-terminated child, never just the first, because
/// several can finish before the loop gets back around.
#[derive(Default)]
pub struct ChildReaper {
    children: JoinSet<ChildExit>,
}

impl ChildReaper {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn watch(&mut self, mut child: Child) {
        let pid = child.id();
        self.children.spawn(async move {
            let status = child.wait().await;
            ChildExit { pid, status }
        });
    }

    pub fn is_empty(&self) -> bool {
        self.children.is_empty()
    }

    pub fn len(&self) -> usize {
        self.children.len()
    }

    /// Wait for the next child to terminate. `None` when no children
    /// remain.
    pub async fn next_exit(&mut self) -> Option<ChildExit> {
        while let Some(joined) = self.children.join_next().await {
            match joined {
                Ok(exit) => return Some(exit),
                Err(e) => warn!("child wait task failed: {e}"),
            }
        }
        None
    }

    /// Collect every child that has already terminated, without
    /// blocking. An empty registry just ends the sweep.
    pub fn reap_finished(&mut self) -> Vec<ChildExit> {
        let mut exits = Vec::new();
        while let Some(joined) = self.children.try_join_next() {
            match joined {
                Ok(exit) => exits.push(exit),
                Err(e) => warn!("child wait task failed: {e}"),
            }
        }
        exits
    }
}
