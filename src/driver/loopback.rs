//! In-process driver emulation.
//!
//! Behaves like the kernel filter from the service's point of view: file
//! opens on placeholder files raise `ResolveFile` messages on the message
//! port, alternate-stream opens never notify, and the control port
//! answers version/flag/open requests. Backed by the same
//! [`LocalStore`] the placeholder manager writes through, it lets the
//! whole hydration pipeline run end to end without a kernel. Used by the
//! demos and the integration tests.

use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::{mpsc, Mutex, Notify};
use tokio_util::sync::CancellationToken;

use super::channel::DriverChannel;
use super::protocol::{
    ControlReply, ControlRequest, ResolveFileMessage, ServiceMessage, ServiceOperation,
    ServiceReply,
};
use crate::fs::local::LocalStore;
use crate::fs::FileStore;
use crate::placeholder;
use crate::text;

/// Default emulated kernel volume prefix.
pub const LOOPBACK_VOLUME: &str = r"\Device\LoopbackVolume";

struct Ports {
    sender: mpsc::UnboundedSender<Vec<u8>>,
    receiver: Mutex<mpsc::UnboundedReceiver<Vec<u8>>>,
}

/// The emulated filter.
pub struct LoopbackDriver {
    store: LocalStore,
    ports: Ports,
    closed: Mutex<CancellationToken>,
    connected: AtomicBool,
    next_request_id: AtomicU32,
    next_handle: AtomicU64,
    flags: DashMap<String, u32>,
    trace_channels: AtomicU32,
    open_points: DashMap<u64, PathBuf>,
    process_names: DashMap<u32, String>,
    replies: DashMap<u32, ServiceReply>,
    reply_notify: Notify,
    /// Root the emulated volume name maps onto.
    volume_root: Mutex<PathBuf>,
}

impl LoopbackDriver {
    pub fn new(store: LocalStore, volume_root: &Path) -> Arc<Self> {
        let (sender, receiver) = mpsc::unbounded_channel();
        Arc::new(Self {
            store,
            ports: Ports { sender, receiver: Mutex::new(receiver) },
            closed: Mutex::new(CancellationToken::new()),
            connected: AtomicBool::new(false),
            next_request_id: AtomicU32::new(1),
            next_handle: AtomicU64::new(1),
            flags: DashMap::new(),
            trace_channels: AtomicU32::new(0),
            open_points: DashMap::new(),
            process_names: DashMap::new(),
            replies: DashMap::new(),
            reply_notify: Notify::new(),
            volume_root: Mutex::new(volume_root.to_path_buf()),
        })
    }

    pub fn store(&self) -> &LocalStore {
        &self.store
    }

    /// Registers an image name for a process id, for excluded-process
    /// checks.
    pub fn set_process_name(&self, process_id: u32, name: &str) {
        self.process_names.insert(process_id, name.to_string());
    }

    /// Current value of a filter flag set via the control port.
    pub fn flag(&self, name: &str) -> Option<u32> {
        self.flags.get(name).map(|v| *v)
    }

    /// Emulates a user opening `path`: placeholder files raise a
    /// `ResolveFile` message and return its request id; plain files and
    /// alternate-stream opens do not notify.
    pub async fn simulate_open(
        &self,
        path: &Path,
        process_id: u32,
        thread_id: u32,
    ) -> Option<u32> {
        let path_text = path.to_string_lossy().into_owned();
        let (file_path, stream) = text::split_stream_suffix(&path_text);
        if stream.is_some() {
            // Alternate data streams never trigger hydration.
            return None;
        }
        let file_path = PathBuf::from(file_path);
        if !placeholder::detect(&self.store, &file_path).await {
            return None;
        }

        let request_id = self.next_request_id.fetch_add(1, Ordering::SeqCst);
        let root = self.volume_root.lock().await.clone();
        let data_name = match file_path.strip_prefix(&root) {
            Ok(relative) => {
                // Keep platform separators so the service's volume
                // translation lands back on a usable local path.
                format!("{LOOPBACK_VOLUME}{}{}", std::path::MAIN_SEPARATOR, relative.display())
            }
            Err(_) => path_text.clone(),
        };
        let message = ServiceMessage {
            request_id,
            operation: ServiceOperation::ResolveFile(ResolveFileMessage {
                session_id: 1,
                volume_name: LOOPBACK_VOLUME.to_string(),
                data_name,
                process_id,
                thread_id,
            }),
        };
        self.ports.sender.send(message.serialize()).ok()?;
        Some(request_id)
    }

    /// Forwards one kernel log line to the service.
    pub fn send_log_write(&self, message_text: &str) -> Option<u32> {
        let request_id = self.next_request_id.fetch_add(1, Ordering::SeqCst);
        let message = ServiceMessage {
            request_id,
            operation: ServiceOperation::LogWrite(super::protocol::LogWriteMessage {
                text: message_text.to_string(),
            }),
        };
        self.ports.sender.send(message.serialize()).ok()?;
        Some(request_id)
    }

    /// Waits for the service's reply to one request.
    pub async fn wait_reply(&self, request_id: u32) -> ServiceReply {
        loop {
            let notified = self.reply_notify.notified();
            if let Some(reply) = self.replies.get(&request_id) {
                return *reply;
            }
            notified.await;
        }
    }

    async fn handle_control(&self, request: ControlRequest) -> (u32, ControlReply) {
        use super::protocol::*;
        match request {
            ControlRequest::SetTraceEnabled { channels } => {
                self.trace_channels.store(channels, Ordering::SeqCst);
                (OPERATION_SET_TRACE_ENABLED, ControlReply::Empty)
            }
            ControlRequest::GetIsConnected => (
                OPERATION_GET_IS_CONNECTED,
                ControlReply::IsConnected { connected: self.connected.load(Ordering::SeqCst) },
            ),
            ControlRequest::GetVersion => {
                let (major, minor, build) = placeholder::producer_version();
                (
                    OPERATION_GET_VERSION,
                    ControlReply::Version { major, minor, build, revision: 0 },
                )
            }
            ControlRequest::SetFlag { name, value } => {
                self.flags.insert(name, value);
                (OPERATION_SET_FLAG, ControlReply::Empty)
            }
            ControlRequest::OpenReparsePoint { file_path, .. } => {
                let local = file_path.strip_prefix(r"\??\").unwrap_or(&file_path);
                let path = PathBuf::from(local);
                match self.store.metadata(&path).await {
                    Ok(Some(_)) => {
                        let handle = self.next_handle.fetch_add(1, Ordering::SeqCst);
                        self.open_points.insert(handle, path);
                        (
                            OPERATION_OPEN_REPARSE_POINT,
                            ControlReply::OpenReparsePoint { handle, ntstatus: ntstatus::SUCCESS },
                        )
                    }
                    _ => (
                        OPERATION_OPEN_REPARSE_POINT,
                        ControlReply::OpenReparsePoint {
                            handle: 0,
                            ntstatus: ntstatus::UNSUCCESSFUL,
                        },
                    ),
                }
            }
            ControlRequest::CloseReparsePoint { handle } => {
                let status = if self.open_points.remove(&handle).is_some() {
                    ntstatus::SUCCESS
                } else {
                    ntstatus::UNSUCCESSFUL
                };
                (OPERATION_CLOSE_REPARSE_POINT, ControlReply::CloseReparsePoint { ntstatus: status })
            }
        }
    }
}

#[async_trait]
impl DriverChannel for LoopbackDriver {
    async fn connect(&self) -> io::Result<()> {
        let mut closed = self.closed.lock().await;
        if closed.is_cancelled() {
            *closed = CancellationToken::new();
        }
        self.connected.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn get_message(&self) -> io::Result<Vec<u8>> {
        let closed = self.closed.lock().await.clone();
        let mut receiver = self.ports.receiver.lock().await;
        tokio::select! {
            frame = receiver.recv() => frame.ok_or_else(|| {
                io::Error::new(io::ErrorKind::BrokenPipe, "message port closed")
            }),
            _ = closed.cancelled() => {
                Err(io::Error::new(io::ErrorKind::BrokenPipe, "message port closed"))
            }
        }
    }

    async fn reply_message(&self, frame: &[u8]) -> io::Result<()> {
        let reply = ServiceReply::parse(frame).map_err(|e| io::Error::other(e.to_string()))?;
        self.replies.insert(reply.request_id, reply);
        self.reply_notify.notify_waiters();
        Ok(())
    }

    async fn control(&self, frame: &[u8]) -> io::Result<Vec<u8>> {
        let request = ControlRequest::parse(frame).map_err(|e| io::Error::other(e.to_string()))?;
        let (operation, reply) = self.handle_control(request).await;
        Ok(reply.serialize(operation))
    }

    async fn volume_dos_name(&self, volume_name: &str) -> io::Result<String> {
        if volume_name == LOOPBACK_VOLUME {
            Ok(self.volume_root.lock().await.to_string_lossy().into_owned())
        } else {
            Ok(volume_name.to_string())
        }
    }

    async fn process_name(&self, process_id: u32) -> Option<String> {
        self.process_names.get(&process_id).map(|n| n.clone())
    }

    async fn disconnect(&self) {
        self.connected.store(false, Ordering::SeqCst);
        self.closed.lock().await.cancel();
    }
}
