//! The narrow wrapper around a Perforce client.
//!
//! The core never speaks the Perforce wire protocol itself; it drives a
//! [`Transport`] with commands and consumes the typed event stream. The
//! production implementation, [`CliTransport`], runs the `p4` binary with
//! tagged output and translates its console protocol into events. Tests
//! substitute scripted transports.

use std::path::PathBuf;
use std::process::Stdio;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::process::Command;

use super::command::{CommandHandler, DepotCommand};
use super::config::DepotConfig;
use super::result::{DepotChannel, DepotTag};
use super::SessionError;

/// Connection-time parameters supplied alongside the configuration.
#[derive(Debug, Clone, Default)]
pub struct ConnectOptions {
    /// Program name/version string reported to the server.
    pub program: String,
    /// Resolved tickets file path, when one was found writable.
    pub tickets_file: Option<PathBuf>,
    /// Resolved trust file path, when one was found writable.
    pub trust_file: Option<PathBuf>,
}

/// A live connection to one Perforce server under one identity.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Establishes the connection. The supplied configuration is fully
    /// resolved by the caller.
    async fn connect(
        &mut self,
        config: &DepotConfig,
        options: &ConnectOptions,
    ) -> Result<(), SessionError>;

    /// True while the connection is believed healthy.
    fn is_connected(&self) -> bool;

    /// Runs one command, delivering events to `handler` as they arrive.
    /// Command failures are reported through the event stream, not errors;
    /// the `Err` path is reserved for transport faults.
    async fn run(
        &mut self,
        command: &DepotCommand,
        handler: &mut dyn CommandHandler,
    ) -> Result<(), SessionError>;

    /// Returns the transport to its disconnected state.
    async fn disconnect(&mut self);
}

/// [`Transport`] implementation over the installed `p4` command-line
/// client. Tagged commands run with `-ztag`, text commands with `-s`
/// severity markers, and binary print streams run unmarked.
#[derive(Debug, Default)]
pub struct CliTransport {
    p4_path: Option<PathBuf>,
    config: DepotConfig,
    options: ConnectOptions,
    connected: bool,
}

impl CliTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Overrides the `p4` binary used, for portable installs.
    pub fn with_p4_path(mut self, path: PathBuf) -> Self {
        self.p4_path = Some(path);
        self
    }

    fn base_command(&self, depot_command: &DepotCommand) -> Command {
        let program = self.p4_path.clone().unwrap_or_else(|| PathBuf::from("p4"));
        let mut cmd = Command::new(program);

        if !self.config.port.is_empty() {
            cmd.arg("-p").arg(&self.config.port);
        }
        if !self.config.user.is_empty() {
            cmd.arg("-u").arg(&self.config.user);
        }
        if !self.config.client.is_empty() {
            cmd.arg("-c").arg(&self.config.client);
        }
        if !self.config.host.is_empty() {
            cmd.arg("-H").arg(&self.config.host);
        }
        if !self.config.directory.is_empty() {
            cmd.arg("-d").arg(&self.config.directory);
        }
        if !self.options.program.is_empty() {
            cmd.env("P4CLIENTPROG", &self.options.program);
        }
        if let Some(tickets) = &self.options.tickets_file {
            cmd.env("P4TICKETS", tickets);
        }
        if let Some(trust) = &self.options.trust_file {
            cmd.env("P4TRUST", trust);
        }
        // External diff and merge programs must never run under the service.
        cmd.env_remove("P4DIFF");
        cmd.env_remove("P4MERGE");

        if depot_command.flags.binary {
            // Raw content stream, no markers.
        } else if depot_command.flags.untagged {
            cmd.arg("-s");
        } else {
            cmd.arg("-ztag");
        }

        cmd.arg(&depot_command.name);
        cmd.args(&depot_command.args);
        cmd.stdin(Stdio::piped());
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());
        cmd.kill_on_drop(true);
        cmd
    }
}

#[async_trait]
impl Transport for CliTransport {
    async fn connect(
        &mut self,
        config: &DepotConfig,
        options: &ConnectOptions,
    ) -> Result<(), SessionError> {
        self.config = config.clone();
        self.options = options.clone();
        self.connected = true;
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected
    }

    async fn run(
        &mut self,
        command: &DepotCommand,
        handler: &mut dyn CommandHandler,
    ) -> Result<(), SessionError> {
        if !self.connected {
            return Err(SessionError::NotConnected);
        }

        let mut child = self.base_command(command).spawn().map_err(|e| {
            self.connected = false;
            SessionError::Transport(format!("failed to spawn p4: {e}"))
        })?;

        // Answer the password prompt up front; the CLI reads it from stdin.
        let mut stdin_payload = command.input.clone().unwrap_or_default();
        if stdin_payload.is_empty() {
            if let Some(reply) = handler.on_prompt("Enter password:").await {
                stdin_payload = reply;
            }
        }
        if let Some(mut stdin) = child.stdin.take() {
            if !stdin_payload.is_empty() {
                if !stdin_payload.ends_with('\n') {
                    stdin_payload.push('\n');
                }
                let _ = stdin.write_all(stdin_payload.as_bytes()).await;
            }
            drop(stdin);
        }

        let stdout = child.stdout.take().expect("piped stdout");
        let stderr = child.stderr.take().expect("piped stderr");

        // Drain stderr concurrently so neither pipe can stall the child.
        let stderr_task = tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            let mut collected = Vec::new();
            while let Ok(Some(line)) = lines.next_line().await {
                collected.push(line);
            }
            collected
        });

        if command.flags.binary {
            let mut reader = BufReader::new(stdout);
            let mut buffer = vec![0u8; 64 * 1024];
            loop {
                let read = reader
                    .read(&mut buffer)
                    .await
                    .map_err(|e| SessionError::Transport(format!("p4 stream read: {e}")))?;
                if read == 0 {
                    break;
                }
                handler
                    .on_binary(&buffer[..read])
                    .await
                    .map_err(|e| SessionError::Transport(format!("stream sink: {e}")))?;
            }
        } else {
            let mut lines = BufReader::new(stdout).lines();
            let mut tag: Option<DepotTag> = None;
            while let Some(line) = lines
                .next_line()
                .await
                .map_err(|e| SessionError::Transport(format!("p4 read: {e}")))?
            {
                dispatch_marked_line(&line, &mut tag, handler).await;
            }
            if let Some(tag) = tag.take() {
                if !tag.is_empty() {
                    handler.on_tag(tag).await;
                }
            }
        }

        for line in stderr_task.await.unwrap_or_default() {
            handler.on_text(DepotChannel::StdErr, 0, &line).await;
        }

        let status = child
            .wait()
            .await
            .map_err(|e| SessionError::Transport(format!("p4 wait: {e}")))?;
        if !status.success() && command.flags.binary {
            handler
                .on_text(DepotChannel::StdErr, 0, &format!("p4 exited with {status}"))
                .await;
        }
        Ok(())
    }

    async fn disconnect(&mut self) {
        self.connected = false;
    }
}

/// Routes one `-s`/`-ztag` marked console line to the handler, maintaining
/// the current tagged record across `... key value` lines.
async fn dispatch_marked_line(
    line: &str,
    tag: &mut Option<DepotTag>,
    handler: &mut dyn CommandHandler,
) {
    if let Some(rest) = line.strip_prefix("... ") {
        let rest = rest.strip_prefix("... ").unwrap_or(rest);
        let (key, value) = match rest.split_once(' ') {
            Some((k, v)) => (k, v),
            None => (rest, ""),
        };
        tag.get_or_insert_with(DepotTag::new).set(key, value);
        return;
    }

    // A non-field line terminates the current record.
    if let Some(done) = tag.take() {
        if !done.is_empty() {
            handler.on_tag(done).await;
        }
    }

    if line.is_empty() {
        return;
    }

    if let Some(rest) = line.strip_prefix("error: ") {
        handler.on_text(DepotChannel::StdErr, 0, rest).await;
    } else if let Some(rest) = line.strip_prefix("warning: ") {
        handler.on_text(DepotChannel::StdErr, 0, rest).await;
    } else if let Some(rest) = line.strip_prefix("text: ") {
        handler.on_text(DepotChannel::StdOut, 0, rest).await;
    } else if line.starts_with("exit: ") {
        // Completion marker; the exit status is taken from the process.
    } else if let Some(rest) = line.strip_prefix("info") {
        match rest.split_once(": ") {
            Some((level, text)) => {
                let level = level.parse().unwrap_or(0);
                handler.on_text(DepotChannel::StdOut, level, text).await;
            }
            None => handler.on_text(DepotChannel::StdOut, 0, line).await,
        }
    } else {
        handler.on_text(DepotChannel::StdOut, 0, line).await;
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::depot::result::ResultCollector;

    async fn feed(lines: &[&str]) -> crate::depot::result::DepotResult {
        let mut collector = ResultCollector::new(None);
        let mut tag = None;
        for line in lines {
            dispatch_marked_line(line, &mut tag, &mut collector).await;
        }
        if let Some(done) = tag.take() {
            if !done.is_empty() {
                collector.on_tag(done).await;
            }
        }
        collector.result
    }

    #[tokio::test]
    async fn test_tagged_record_grouping() {
        let result = feed(&[
            "... depotFile //depot/src/a.cpp",
            "... rev 3",
            "... action updated",
            "",
            "... depotFile //depot/src/b.cpp",
            "... rev 1",
            "exit: 0",
        ])
        .await;

        assert_eq!(result.node_count(), 2);
        assert_eq!(result.node(0).unwrap().get("depotFile"), "//depot/src/a.cpp");
        assert_eq!(result.node(0).unwrap().get_i32("rev"), 3);
        assert_eq!(result.node(1).unwrap().get("depotFile"), "//depot/src/b.cpp");
        assert!(!result.has_error());
    }

    #[tokio::test]
    async fn test_severity_markers() {
        let result = feed(&[
            "info: //depot/src/a.cpp#3 - updating c:\\w\\a.cpp",
            "info1: //depot/src/a.cpp#3 - is opened and not being changed",
            "warning: file(s) up-to-date.",
            "error: Can't clobber writable file c:\\w\\b.cpp",
            "exit: 1",
        ])
        .await;

        assert_eq!(result.texts().len(), 4);
        assert_eq!(result.texts()[0].level, 0);
        assert_eq!(result.texts()[1].level, 1);
        assert_eq!(result.texts()[2].channel, DepotChannel::StdErr);
        assert!(result.has_error());
        assert!(result.has_error_regex("can't clobber"));
    }
}
