//! The hydration service: owns the driver ports and dispatches requests.
//!
//! The loop connects to the filter's message port (attempting a driver
//! load and backing off one second when it is absent), receives framed
//! requests, and hands them to the worker pool. Hydrations of the same
//! file are serialized by the pool; every blocking point observes the
//! stop token; a dead port closes and the loop reconnects.

use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;

use crate::context::{AppContext, UserContext};
use crate::driver::protocol::{
    ntstatus, ResolveFileMessage, ServiceMessage, ServiceOperation, ServiceReply,
};
use crate::driver::{DriverChannel, DriverControl, InFlightTable};
use crate::resolver::{self, ResolveError, ResolvedPolicy};
use crate::settings::keys;
use crate::tasks::TaskQueue;
use crate::text::{self, SearchCase};

const DRIVER_RECONNECT_WAIT: Duration = Duration::from_secs(1);

/// The long-running hydration service.
pub struct ServiceHost {
    context: AppContext,
    channel: Arc<dyn DriverChannel>,
    in_flight: Arc<InFlightTable>,
    cancel: CancellationToken,
    last_request_time: Arc<Mutex<Option<Instant>>>,
}

impl ServiceHost {
    pub fn new(context: AppContext, channel: Arc<dyn DriverChannel>) -> Self {
        Self {
            context,
            channel,
            in_flight: Arc::new(InFlightTable::new()),
            cancel: CancellationToken::new(),
            last_request_time: Arc::new(Mutex::new(None)),
        }
    }

    /// Token observed by every blocking point; cancel to stop the service.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Paths currently hydrating, shared with oplock logic.
    pub fn in_flight(&self) -> Arc<InFlightTable> {
        self.in_flight.clone()
    }

    /// Start time of the most recent ResolveFile, for watchdog reporting.
    pub fn last_request_time(&self) -> Option<Instant> {
        *self.last_request_time.lock().unwrap()
    }

    /// Runs until the stop token fires. Never exits on errors; ports are
    /// reconnected and requests keep flowing.
    pub async fn run(&self) {
        self.push_driver_flags().await;
        self.spawn_session_gc();

        let worker_count =
            self.context.settings.get_i32(keys::POOL_DEFAULT_NUMBER_OF_THREADS).max(1) as usize;
        let queue = TaskQueue::start(worker_count, self.cancel.child_token());

        let mut connected = false;
        while !self.cancel.is_cancelled() {
            if !connected {
                match self.channel.connect().await {
                    Ok(()) => {
                        tracing::info!("connected to driver");
                        connected = true;
                    }
                    Err(e) => {
                        tracing::error!(error = %e, "failed to connect to driver, retrying");
                        self.wait_or_cancel(DRIVER_RECONNECT_WAIT).await;
                        continue;
                    }
                }
            }

            let frame = tokio::select! {
                frame = self.channel.get_message() => frame,
                _ = self.cancel.cancelled() => break,
            };
            let frame = match frame {
                Ok(frame) => frame,
                Err(e) => {
                    if !self.cancel.is_cancelled() {
                        tracing::error!(error = %e, "message port receive failed, reconnecting");
                    }
                    self.channel.disconnect().await;
                    connected = false;
                    self.wait_or_cancel(DRIVER_RECONNECT_WAIT).await;
                    continue;
                }
            };

            let message = match ServiceMessage::parse(&frame) {
                Ok(message) => message,
                Err(e) => {
                    tracing::error!(error = %e, "dropping malformed driver message");
                    continue;
                }
            };
            self.dispatch(&queue, message).await;
        }

        queue.shutdown().await;
        self.channel.disconnect().await;
    }

    /// Periodically drops idle depot sessions from the pool.
    fn spawn_session_gc(&self) {
        let period = self.context.settings.get_i32(keys::GARBAGE_COLLECT_PERIOD_MS).max(1000);
        let idle = self
            .context
            .settings
            .get_i32(keys::DEPOT_CLIENT_CACHE_IDLE_TIMEOUT_MS)
            .max(0);
        let pool = self.context.pool.clone();
        let cancel = self.cancel.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(Duration::from_millis(period as u64)) => {
                        pool.garbage_collect(Duration::from_millis(idle as u64)).await;
                    }
                    _ = cancel.cancelled() => return,
                }
            }
        });
    }

    /// Pushes the configured filter flags and logs the driver version.
    async fn push_driver_flags(&self) {
        let control = DriverControl::new(self.channel.clone());
        if let Ok((major, minor, build, revision)) = control.version().await {
            tracing::info!("driver version {major}.{minor}.{build}.{revision}");
        }
        for name in [keys::SANITIZE_ATTRIBUTES, keys::SHARE_MODE_DURING_HYDRATION] {
            let value = self.context.settings.get_bool(name) as u32;
            if let Err(e) = control.set_flag(name, value).await {
                tracing::warn!(flag = name, error = %e, "failed to push driver flag");
            }
        }
    }

    async fn dispatch(&self, queue: &TaskQueue, message: ServiceMessage) {
        match message.operation {
            ServiceOperation::ResolveFile(resolve) => {
                self.dispatch_resolve_file(queue, message.request_id, resolve).await;
            }
            ServiceOperation::LogWrite(log_write) => {
                let channel = self.channel.clone();
                let request_id = message.request_id;
                queue
                    .submit(None, async move {
                        tracing::info!("[Driver] {}", log_write.text);
                        let reply = ServiceReply { request_id, request_result: ntstatus::SUCCESS };
                        let _ = channel.reply_message(&reply.serialize()).await;
                    })
                    .await;
            }
        }
    }

    async fn dispatch_resolve_file(
        &self,
        queue: &TaskQueue,
        request_id: u32,
        message: ResolveFileMessage,
    ) {
        if self.is_excluded_process(message.process_id).await {
            tracing::debug!(
                path = message.data_name,
                process = message.process_id,
                "ignoring request from excluded process"
            );
            self.reply(request_id, ntstatus::ACCESS_DENIED).await;
            return;
        }

        let local_path = match self.resolve_local_path(&message).await {
            Ok(path) => path,
            Err(e) => {
                tracing::error!(path = message.data_name, error = %e, "failed to resolve path");
                self.reply(request_id, ntstatus::UNSUCCESSFUL).await;
                return;
            }
        };

        // Alternate data streams never hydrate; answer without touching
        // the last-request time.
        let path_text = local_path.to_string_lossy().into_owned();
        if text::split_stream_suffix(&path_text).1.is_some() {
            self.reply(request_id, ntstatus::SUCCESS).await;
            return;
        }

        *self.last_request_time.lock().unwrap() = Some(Instant::now());

        let user = UserContext {
            session_id: message.session_id,
            process_id: message.process_id,
            thread_id: message.thread_id,
        };
        let context = self.context.clone();
        let channel = self.channel.clone();
        let in_flight = self.in_flight.clone();

        tracing::debug!(path = path_text, process = message.process_id, "resolve file start");
        let exclusive_key = path_text.clone();
        queue
            .submit(Some(&exclusive_key), async move {
                let guard = in_flight.begin(&path_text);
                let outcome =
                    resolver::resolve_file_residency(&context, &user, &local_path).await;
                drop(guard);

                let status = match outcome {
                    Ok(ResolvedPolicy::Resident) | Ok(ResolvedPolicy::RemoveFile) => {
                        ntstatus::SUCCESS
                    }
                    Ok(ResolvedPolicy::Symlink) => ntstatus::RETRY,
                    Err(ResolveError::UndefinedPolicy) => ntstatus::UNSUCCESSFUL,
                    Err(e) => {
                        tracing::error!(path = path_text, error = %e, "resolve file failed");
                        ntstatus::UNSUCCESSFUL
                    }
                };
                let reply = ServiceReply { request_id, request_result: status };
                let _ = channel.reply_message(&reply.serialize()).await;
                tracing::debug!(path = path_text, status, "resolve file end");
            })
            .await;
    }

    async fn reply(&self, request_id: u32, request_result: u32) {
        let reply = ServiceReply { request_id, request_result };
        if let Err(e) = self.channel.reply_message(&reply.serialize()).await {
            tracing::error!(error = %e, "failed to reply to driver");
        }
    }

    async fn is_excluded_process(&self, process_id: u32) -> bool {
        let excluded = self.context.settings.get_str(keys::EXCLUDED_PROCESS_NAMES);
        if excluded.is_empty() {
            return false;
        }
        match self.channel.process_name(process_id).await {
            Some(name) => text::contains_token(';', &excluded, &name, SearchCase::Insensitive),
            None => false,
        }
    }

    /// Translates the kernel volume prefix of `dataName` into its DOS
    /// form and returns the local path.
    async fn resolve_local_path(&self, message: &ResolveFileMessage) -> std::io::Result<PathBuf> {
        let dos = self.channel.volume_dos_name(&message.volume_name).await?;
        let data_name = &message.data_name;
        let local = match data_name.strip_prefix(message.volume_name.as_str()) {
            Some(rest) => format!("{dos}{rest}"),
            None => data_name.clone(),
        };
        Ok(PathBuf::from(local))
    }

    async fn wait_or_cancel(&self, wait: Duration) {
        tokio::select! {
            _ = tokio::time::sleep(wait) => {}
            _ = self.cancel.cancelled() => {}
        }
    }
}
