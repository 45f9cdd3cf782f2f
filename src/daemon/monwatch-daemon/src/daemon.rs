//! Event loop / reconciler
//!
//! The daemon's state machine: multiplex display-server notifications
//! with a periodic poke timer, deduplicate redundant notifications by
//! fingerprint, and dispatch the action script on real changes without
//! ever blocking on a child.

use std::time::Duration;

use anyhow::{Context, Result};
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use monwatch_core::{detect, ChangeDecision};
use monwatch_system::{DisplaySource, OutputChange, OutputStatus};

use crate::dispatch::{ActionSink, INIT_STATUS};
use crate::lifecycle::{ChildExit, ChildReaper, ShutdownHandle};

/// Policies that shape one reconciler run.
#[derive(Debug, Clone)]
pub struct ReconcileOptions {
    pub poll_interval: Duration,
    /// Fire the action once at startup with a synthetic "init" status.
    pub startup_action: bool,
    /// Run the detect/dispatch path on poll ticks too, for servers
    /// that never push notifications.
    pub detect_on_poll: bool,
}

impl Default for ReconcileOptions {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(3),
            startup_action: false,
            detect_on_poll: false,
        }
    }
}

enum Wake {
    Notifications,
    PollTick,
    Child(ChildExit),
    Shutdown,
}

/// Drives the daemon. Owns the current fingerprint, the display source
/// and the child registry; the shutdown handle is the only value shared
/// with other contexts.
pub struct Reconciler<S, A> {
    source: S,
    actions: A,
    reaper: ChildReaper,
    shutdown: ShutdownHandle,
    options: ReconcileOptions,
    current: Option<monwatch_core::Fingerprint>,
}

impl<S: DisplaySource, A: ActionSink> Reconciler<S, A> {
    pub fn new(source: S, actions: A, shutdown: ShutdownHandle, options: ReconcileOptions) -> Self {
        Self {
            source,
            actions,
            reaper: ChildReaper::new(),
            shutdown,
            options,
            current: None,
        }
    }

    /// Run until shutdown is requested. Source-level failures are
    /// fatal; everything below the connection keeps the loop alive.
    pub async fn run(&mut self) -> Result<()> {
        self.seed_baseline()
            .context("initial display snapshot failed")?;

        let mut ticker = interval_at(
            Instant::now() + self.options.poll_interval,
            self.options.poll_interval,
        );
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        while !self.shutdown.is_requested() {
            self.drain_pending()?;
            if self.shutdown.is_requested() {
                break;
            }

            let have_children = !self.reaper.is_empty();
            let wake = tokio::select! {
                _ = self.shutdown.requested() => Wake::Shutdown,
                ready = self.source.wait_ready() => {
                    ready?;
                    Wake::Notifications
                }
                _ = ticker.tick() => Wake::PollTick,
                Some(exit) = self.reaper.next_exit(), if have_children => Wake::Child(exit),
            };

            match wake {
                Wake::Shutdown => break,
                // Drained at the top of the next iteration.
                Wake::Notifications => {}
                Wake::PollTick => self.poll(),
                Wake::Child(exit) => {
                    // Several children can terminate before we run;
                    // sweep the whole backlog on one trigger.
                    exit.log();
                    for exit in self.reaper.reap_finished() {
                        exit.log();
                    }
                }
            }
        }

        // Draining: consume whatever is still queued, dispatch nothing.
        let _ = self.source.drain_changes();
        debug!("reconciler stopped");
        Ok(())
    }

    /// First-ever fingerprint computation. Always a forced change:
    /// it seeds the state and optionally fires the startup action.
    fn seed_baseline(&mut self) -> Result<()> {
        let snapshot = self.source.refresh_snapshot()?;
        let fingerprint = snapshot.fingerprint();
        if detect(self.current.as_ref(), &fingerprint).is_changed() {
            self.current = Some(fingerprint);
            info!("baseline fingerprint {fingerprint}");
            if self.options.startup_action {
                self.launch(INIT_STATUS, "", &fingerprint.to_hex());
            }
        }
        Ok(())
    }

    /// Process every queued notification before the next wait. New
    /// notifications arriving mid-drain are picked up in the same
    /// pass; a shutdown request stops dispatching immediately.
    fn drain_pending(&mut self) -> Result<usize> {
        let mut handled = 0;
        loop {
            let changes = self.source.drain_changes()?;
            if changes.is_empty() {
                return Ok(handled);
            }
            for change in changes {
                if self.shutdown.is_requested() {
                    return Ok(handled);
                }
                self.reconcile(change);
                handled += 1;
            }
        }
    }

    fn reconcile(&mut self, change: OutputChange) {
        // Every observed pair is logged, whether or not it changes
        // anything.
        info!("{} {}", change.output, change.status);

        let snapshot = match self.source.current_snapshot() {
            Ok(snapshot) => snapshot,
            Err(e) => {
                // Skip this notification; the loop stays up.
                warn!("snapshot failed: {e}");
                return;
            }
        };

        let fingerprint = snapshot.fingerprint();
        match detect(self.current.as_ref(), &fingerprint) {
            ChangeDecision::Unchanged => {
                debug!("fingerprint unchanged ({fingerprint})");
            }
            ChangeDecision::Changed { .. } => {
                self.current = Some(fingerprint);
                self.launch(change.status.as_str(), &change.output, &fingerprint.to_hex());
            }
        }
    }

    /// Defensive poll: re-enumerate so the server's output view stays
    /// fresh even when it never pushes hotplug notifications.
    fn poll(&mut self) {
        let snapshot = match self.source.refresh_snapshot() {
            Ok(snapshot) => snapshot,
            Err(e) => {
                // The next tick retries; nothing depends on this one.
                warn!("poll refresh failed: {e}");
                return;
            }
        };
        if !self.options.detect_on_poll {
            return;
        }

        let fingerprint = snapshot.fingerprint();
        if detect(self.current.as_ref(), &fingerprint).is_changed() {
            let status = if snapshot.any_connected() {
                OutputStatus::Connected
            } else {
                OutputStatus::Disconnected
            };
            info!("poll detected change, now {status}");
            self.current = Some(fingerprint);
            self.launch(status.as_str(), "", &fingerprint.to_hex());
        }
    }

    fn launch(&mut self, status: &str, output: &str, fingerprint: &str) {
        if let Some(child) = self.actions.dispatch(status, output, fingerprint) {
            self.reaper.watch(child);
        }
    }
}
