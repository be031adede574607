//! Depot command description and the event stream it produces.

use std::sync::Arc;

use async_trait::async_trait;

use super::result::{DepotChannel, DepotTag};

/// Callback used to answer interactive prompts raised during a command.
/// Returning `None` leaves the prompt unanswered.
pub type PromptCallback = Arc<dyn Fn(&str) -> Option<String> + Send + Sync>;

/// Execution flags for one command.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CommandFlags {
    /// Suppress tagged output; the command produces plain text records.
    pub untagged: bool,
    /// Raw content stream: output bytes go to [`CommandHandler::on_binary`]
    /// untouched. Implies untagged.
    pub binary: bool,
}

impl CommandFlags {
    pub const UNTAGGED: CommandFlags = CommandFlags { untagged: true, binary: false };
}

/// One depot command: name, arguments, optional stdin payload and flags.
#[derive(Clone, Default)]
pub struct DepotCommand {
    pub name: String,
    pub args: Vec<String>,
    pub input: Option<String>,
    pub flags: CommandFlags,
    pub prompt: Option<PromptCallback>,
}

impl std::fmt::Debug for DepotCommand {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DepotCommand")
            .field("name", &self.name)
            .field("args", &self.args)
            .field("flags", &self.flags)
            .field("prompt", &self.prompt.is_some())
            .finish()
    }
}

impl DepotCommand {
    pub fn new(name: &str, args: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self {
            name: name.to_string(),
            args: args.into_iter().map(Into::into).collect(),
            ..Default::default()
        }
    }

    pub fn untagged(mut self) -> Self {
        self.flags.untagged = true;
        self
    }

    pub fn binary(mut self) -> Self {
        self.flags.untagged = true;
        self.flags.binary = true;
        self
    }

    pub fn with_input(mut self, input: impl Into<String>) -> Self {
        self.input = Some(input.into());
        self
    }

    pub fn with_prompt(mut self, prompt: PromptCallback) -> Self {
        self.prompt = Some(prompt);
        self
    }
}

/// Receiver of the typed events a running command emits. Results and
/// streaming writers implement this; the transport drives it.
#[async_trait]
pub trait CommandHandler: Send {
    /// One line of console output with its channel and severity level.
    async fn on_text(&mut self, channel: DepotChannel, level: i32, text: &str);

    /// One tagged record.
    async fn on_tag(&mut self, tag: DepotTag);

    /// A chunk of raw file content from a print-family command.
    async fn on_binary(&mut self, data: &[u8]) -> std::io::Result<()>;

    /// An interactive prompt; `None` leaves it unanswered.
    async fn on_prompt(&mut self, message: &str) -> Option<String> {
        let _ = message;
        None
    }
}
