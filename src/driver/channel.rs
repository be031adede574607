//! The channel to the kernel filter and the in-flight action table.
//!
//! [`DriverChannel`] is the seam the service is written against: one
//! message port delivering framed requests and accepting framed replies,
//! one control port answering framed control requests. The frames are the
//! §protocol byte layouts; [`DriverControl`] wraps the control port with
//! typed calls.

use std::io;
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;

use super::protocol::{ControlReply, ControlRequest, ProtocolError};
use crate::text;

/// Transport to the filter's two communication ports.
#[async_trait]
pub trait DriverChannel: Send + Sync {
    /// Connects (or reconnects) the message port. When the filter is not
    /// present the implementation should attempt to load it; the caller
    /// backs off and retries.
    async fn connect(&self) -> io::Result<()>;

    /// Receives one framed service message. Blocks until a message
    /// arrives or the port dies; closing the port unblocks this call.
    async fn get_message(&self) -> io::Result<Vec<u8>>;

    /// Sends one framed service reply.
    async fn reply_message(&self, frame: &[u8]) -> io::Result<()>;

    /// Round-trips one framed control request.
    async fn control(&self, frame: &[u8]) -> io::Result<Vec<u8>>;

    /// Translates a kernel volume name into its DOS form
    /// (`\Device\HarddiskVolume3` -> `C:`).
    async fn volume_dos_name(&self, volume_name: &str) -> io::Result<String>;

    /// Image name of a process, for the excluded-process check.
    async fn process_name(&self, process_id: u32) -> Option<String>;

    /// Closes the ports, unblocking any pending receive.
    async fn disconnect(&self);
}

/// Typed wrapper over the control port.
#[derive(Clone)]
pub struct DriverControl {
    channel: Arc<dyn DriverChannel>,
}

impl DriverControl {
    pub fn new(channel: Arc<dyn DriverChannel>) -> Self {
        Self { channel }
    }

    async fn round_trip(&self, request: &ControlRequest) -> io::Result<ControlReply> {
        let reply = self.channel.control(&request.serialize()).await?;
        ControlReply::parse(&reply).map_err(|e: ProtocolError| io::Error::other(e.to_string()))
    }

    pub async fn set_trace_enabled(&self, channels: u32) -> io::Result<()> {
        self.round_trip(&ControlRequest::SetTraceEnabled { channels }).await.map(|_| ())
    }

    pub async fn is_connected(&self) -> io::Result<bool> {
        match self.round_trip(&ControlRequest::GetIsConnected).await? {
            ControlReply::IsConnected { connected } => Ok(connected),
            _ => Err(io::Error::other("mismatched control reply")),
        }
    }

    pub async fn version(&self) -> io::Result<(u16, u16, u16, u16)> {
        match self.round_trip(&ControlRequest::GetVersion).await? {
            ControlReply::Version { major, minor, build, revision } => {
                Ok((major, minor, build, revision))
            }
            _ => Err(io::Error::other("mismatched control reply")),
        }
    }

    /// Sets a named filter flag (`SanitizeAttributes`,
    /// `ShareModeDuringHydration`).
    pub async fn set_flag(&self, name: &str, value: u32) -> io::Result<()> {
        self.round_trip(&ControlRequest::SetFlag { name: name.to_string(), value })
            .await
            .map(|_| ())
    }

    /// Opens a file through the filter with the reparse point visible,
    /// returning an opaque kernel handle.
    pub async fn open_reparse_point(
        &self,
        file_path: &str,
        access: u8,
        share: u8,
    ) -> io::Result<u64> {
        let request = ControlRequest::OpenReparsePoint {
            file_path: format!(r"\??\{}", text::unextended_path(file_path)),
            access,
            share,
        };
        match self.round_trip(&request).await? {
            ControlReply::OpenReparsePoint { handle, ntstatus: 0 } => Ok(handle),
            ControlReply::OpenReparsePoint { ntstatus, .. } => {
                Err(io::Error::other(format!("open reparse point failed: {ntstatus:#x}")))
            }
            _ => Err(io::Error::other("mismatched control reply")),
        }
    }

    pub async fn close_reparse_point(&self, handle: u64) -> io::Result<()> {
        match self.round_trip(&ControlRequest::CloseReparsePoint { handle }).await? {
            ControlReply::CloseReparsePoint { ntstatus: 0 } => Ok(()),
            ControlReply::CloseReparsePoint { ntstatus } => {
                Err(io::Error::other(format!("close reparse point failed: {ntstatus:#x}")))
            }
            _ => Err(io::Error::other("mismatched control reply")),
        }
    }
}

/// Reference-counted, case-insensitive multiset of paths currently being
/// hydrated. The filter consults it to report "hydration in progress" to
/// opportunistic-lock logic and to force share access during that window.
#[derive(Debug, Default)]
pub struct InFlightTable {
    entries: DashMap<String, u32>,
}

impl InFlightTable {
    pub fn new() -> Self {
        Self::default()
    }

    fn key(path: &str) -> String {
        text::fold(path)
    }

    /// Registers a hydration; the returned guard deregisters on drop.
    pub fn begin(self: &Arc<Self>, path: &str) -> InFlightGuard {
        let key = Self::key(path);
        *self.entries.entry(key.clone()).or_insert(0) += 1;
        InFlightGuard { table: self.clone(), key }
    }

    /// True when any hydration is in flight for `path`.
    pub fn contains(&self, path: &str) -> bool {
        self.entries.get(&Self::key(path)).map(|count| *count > 0).unwrap_or(false)
    }

    /// Number of distinct paths currently in flight.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn end(&self, key: &str) {
        if let Some(mut entry) = self.entries.get_mut(key) {
            *entry = entry.saturating_sub(1);
            if *entry > 0 {
                return;
            }
        }
        self.entries.remove_if(key, |_, count| *count == 0);
    }
}

/// Active registration in the in-flight table.
pub struct InFlightGuard {
    table: Arc<InFlightTable>,
    key: String,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.table.end(&self.key);
    }
}
