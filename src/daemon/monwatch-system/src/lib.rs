//! monwatch System Integration
//!
//! Boundary to the display server. Everything the daemon needs from X
//! is behind the [`DisplaySource`] trait: enumerate the attached
//! outputs with their identity blocks, and deliver output-change
//! notifications. [`RandrSource`] is the production implementation on
//! top of the RandR extension; [`ScriptedSource`] replays canned
//! events for tests.

use std::collections::VecDeque;
use std::fmt;
use std::os::fd::{AsRawFd, RawFd};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::io::unix::AsyncFd;
use tracing::{debug, warn};
use x11rb::connection::Connection;
use x11rb::connection::RequestConnection;
use x11rb::errors::ReplyError;
use x11rb::protocol::randr::{self, ConnectionExt as _};
use x11rb::protocol::xproto::{self, ConnectionExt as _};
use x11rb::protocol::Event;
use x11rb::rust_connection::RustConnection;

use monwatch_core::Fingerprint;

/// EDID blocks are fetched as 32-bit words; 100 words covers the base
/// block plus extensions.
const EDID_LENGTH_WORDS: u32 = 100;

/// Errors from the display-server connection.
///
/// Connection-level failures are fatal to the daemon; per-output
/// failures are absorbed inside this crate and logged.
#[derive(Debug, Error)]
pub enum SourceError {
    #[error("can't open display: {0}")]
    Connect(#[from] x11rb::errors::ConnectError),
    #[error("display connection lost: {0}")]
    Connection(#[from] x11rb::errors::ConnectionError),
    #[error("display request failed: {0}")]
    Reply(#[from] x11rb::errors::ReplyError),
    #[error("randr extension not available")]
    RandrMissing,
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Connection state of one output, as reported by the server.
///
/// The wire encodes this as a small integer; any value outside the
/// known range maps to `Unknown` rather than being trusted as an
/// index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputStatus {
    Connected,
    Disconnected,
    Unknown,
}

impl OutputStatus {
    pub fn from_raw(raw: u8) -> Self {
        match raw {
            0 => OutputStatus::Connected,
            1 => OutputStatus::Disconnected,
            _ => OutputStatus::Unknown,
        }
    }

    /// The string handed to the action script.
    pub fn as_str(&self) -> &'static str {
        match self {
            OutputStatus::Connected => "connected",
            OutputStatus::Disconnected => "disconnected",
            OutputStatus::Unknown => "unknown",
        }
    }
}

impl fmt::Display for OutputStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One physical display connector known to the server.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Output {
    pub name: String,
    pub status: OutputStatus,
    /// Raw identity block (EDID) if the attached display exposes one.
    pub edid: Option<Vec<u8>>,
}

/// The full set of outputs enumerated at one instant.
///
/// Enumeration order is whatever the server returned; it is not
/// assumed stable across calls, only within one snapshot.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Snapshot {
    pub outputs: Vec<Output>,
}

impl Snapshot {
    /// Digest of all identity blocks in enumeration order. Outputs
    /// without one contribute no bytes.
    pub fn fingerprint(&self) -> Fingerprint {
        Fingerprint::of_blocks(self.outputs.iter().filter_map(|o| o.edid.as_deref()))
    }

    pub fn any_connected(&self) -> bool {
        self.outputs
            .iter()
            .any(|o| o.status == OutputStatus::Connected)
    }
}

/// An output-connectivity notification delivered by the server.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutputChange {
    /// Output name; empty when the server could not resolve it.
    pub output: String,
    pub status: OutputStatus,
}

/// What the reconciler requires from a display server.
#[allow(async_fn_in_trait)]
pub trait DisplaySource {
    /// Pull every output-change notification currently queued on the
    /// connection. Non-connectivity notifications are dropped here.
    fn drain_changes(&mut self) -> Result<Vec<OutputChange>, SourceError>;

    /// Snapshot the server's current (cached) view of the outputs.
    fn current_snapshot(&mut self) -> Result<Snapshot, SourceError>;

    /// Force a full server-side re-enumeration and snapshot it.
    fn refresh_snapshot(&mut self) -> Result<Snapshot, SourceError>;

    /// Resolve once the connection may have notifications pending.
    async fn wait_ready(&mut self) -> Result<(), SourceError>;
}

/// Raw connection fd handed to the async reactor for readiness.
struct ConnectionFd(RawFd);

impl AsRawFd for ConnectionFd {
    fn as_raw_fd(&self) -> RawFd {
        self.0
    }
}

/// Production source: RandR over an X connection.
///
/// Subscribes to output-change notifications on the root window at
/// connect time and reads EDID blocks through the RandR output
/// property interface.
pub struct RandrSource {
    conn: RustConnection,
    root: xproto::Window,
    edid_atom: xproto::Atom,
    async_fd: AsyncFd<ConnectionFd>,
}

impl RandrSource {
    /// Connect to the default display and subscribe to output-change
    /// notifications. Must be called from within a tokio runtime.
    pub fn connect() -> Result<Self, SourceError> {
        let (conn, screen_num) = x11rb::connect(None)?;

        if conn
            .extension_information(randr::X11_EXTENSION_NAME)?
            .is_none()
        {
            return Err(SourceError::RandrMissing);
        }
        // 1.3 is the floor for querying current resources without a
        // forced re-probe.
        let _ = conn.randr_query_version(1, 3)?.reply()?;

        let root = conn.setup().roots[screen_num].root;
        let edid_atom = conn.intern_atom(false, b"EDID")?.reply()?.atom;

        conn.randr_select_input(root, randr::NotifyMask::OUTPUT_CHANGE)?;
        conn.flush()?;

        let fd = conn.stream().as_raw_fd();
        let async_fd = AsyncFd::new(ConnectionFd(fd))?;

        Ok(RandrSource {
            conn,
            root,
            edid_atom,
            async_fd,
        })
    }

    fn collect_outputs(&self, outputs: &[randr::Output], ts: xproto::Timestamp) -> Vec<Output> {
        let mut collected = Vec::with_capacity(outputs.len());
        for &output in outputs {
            match self.read_output(output, ts) {
                Ok(out) => collected.push(out),
                // A vanished or misbehaving output contributes no
                // identity data; the cycle goes on without it.
                Err(e) => debug!("output {output:#x} query failed: {e}"),
            }
        }
        collected
    }

    fn read_output(
        &self,
        output: randr::Output,
        ts: xproto::Timestamp,
    ) -> Result<Output, SourceError> {
        let info = self.conn.randr_get_output_info(output, ts)?.reply()?;
        Ok(Output {
            name: String::from_utf8_lossy(&info.name).into_owned(),
            status: OutputStatus::from_raw(u8::from(info.connection)),
            edid: self.read_edid(output),
        })
    }

    /// Fetch the EDID property. Anything other than a well-formed
    /// byte-format integer property counts as "no identity block".
    fn read_edid(&self, output: randr::Output) -> Option<Vec<u8>> {
        let reply = match self
            .conn
            .randr_get_output_property(
                output,
                self.edid_atom,
                0u32,
                0,
                EDID_LENGTH_WORDS,
                false,
                false,
            )
            .map_err(ReplyError::from)
            .and_then(|cookie| cookie.reply())
        {
            Ok(reply) => reply,
            Err(e) => {
                debug!("EDID fetch for output {output:#x} failed: {e}");
                return None;
            }
        };

        if reply.format != 8 || reply.type_ != xproto::Atom::from(xproto::AtomEnum::INTEGER) {
            return None;
        }
        if reply.data.is_empty() {
            return None;
        }
        Some(reply.data)
    }
}

impl DisplaySource for RandrSource {
    fn drain_changes(&mut self) -> Result<Vec<OutputChange>, SourceError> {
        let mut changes = Vec::new();
        while let Some(event) = self.conn.poll_for_event()? {
            let Event::RandrNotify(notify) = event else {
                continue;
            };
            if notify.sub_code != randr::Notify::OUTPUT_CHANGE {
                continue;
            }
            let oc = notify.u.as_oc();
            let status = OutputStatus::from_raw(u8::from(oc.connection));
            let output = match self
                .conn
                .randr_get_output_info(oc.output, oc.config_timestamp)
                .map_err(ReplyError::from)
                .and_then(|cookie| cookie.reply())
            {
                Ok(info) => String::from_utf8_lossy(&info.name).into_owned(),
                Err(e) => {
                    warn!("output name lookup for change notification failed: {e}");
                    String::new()
                }
            };
            changes.push(OutputChange { output, status });
        }
        Ok(changes)
    }

    fn current_snapshot(&mut self) -> Result<Snapshot, SourceError> {
        let res = self
            .conn
            .randr_get_screen_resources_current(self.root)?
            .reply()?;
        Ok(Snapshot {
            outputs: self.collect_outputs(&res.outputs, res.config_timestamp),
        })
    }

    fn refresh_snapshot(&mut self) -> Result<Snapshot, SourceError> {
        let res = self.conn.randr_get_screen_resources(self.root)?.reply()?;
        Ok(Snapshot {
            outputs: self.collect_outputs(&res.outputs, res.config_timestamp),
        })
    }

    async fn wait_ready(&mut self) -> Result<(), SourceError> {
        let mut guard = self.async_fd.readable().await?;
        guard.clear_ready();
        Ok(())
    }
}

/// Canned source replaying scripted batches of notifications and
/// snapshots, for driving the reconciler without a live server.
#[derive(Debug, Default)]
pub struct ScriptedSource {
    batches: VecDeque<Vec<OutputChange>>,
    snapshots: VecDeque<Snapshot>,
    resting: Snapshot,
}

impl ScriptedSource {
    /// `resting` is returned by snapshot calls once the scripted
    /// snapshot queue runs dry.
    pub fn new(resting: Snapshot) -> Self {
        ScriptedSource {
            batches: VecDeque::new(),
            snapshots: VecDeque::new(),
            resting,
        }
    }

    /// Queue one batch of notifications, delivered by a single drain.
    pub fn push_batch(&mut self, batch: Vec<OutputChange>) {
        self.batches.push_back(batch);
    }

    /// Queue a snapshot; snapshot calls consume these in order.
    pub fn push_snapshot(&mut self, snapshot: Snapshot) {
        self.snapshots.push_back(snapshot);
    }
}

impl DisplaySource for ScriptedSource {
    fn drain_changes(&mut self) -> Result<Vec<OutputChange>, SourceError> {
        Ok(self.batches.pop_front().unwrap_or_default())
    }

    fn current_snapshot(&mut self) -> Result<Snapshot, SourceError> {
        Ok(self
            .snapshots
            .pop_front()
            .unwrap_or_else(|| self.resting.clone()))
    }

    fn refresh_snapshot(&mut self) -> Result<Snapshot, SourceError> {
        self.current_snapshot()
    }

    async fn wait_ready(&mut self) -> Result<(), SourceError> {
        if self.batches.is_empty() {
            // Nothing scripted: behave like a quiet connection.
            std::future::pending::<()>().await;
        }
        Ok(())
    }
}
