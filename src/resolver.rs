//! The residency resolver: turns one placeholder into a real file.
//!
//! Given a local path, the resolver reads the placeholder metadata,
//! derives a session key from it, borrows a session from the pool and
//! executes the recorded residency policy. Sessions that fault during the
//! attempt are discarded rather than returned to the pool, and the
//! resolver retries with another, up to one more than the pool's free
//! count.

use std::path::Path;

use async_trait::async_trait;

use crate::context::{AppContext, UserContext};
use crate::depot::command::{CommandHandler, DepotCommand};
use crate::depot::config::{self, DepotConfig};
use crate::depot::encoding::OutputEncoder;
use crate::depot::result::{DepotChannel, DepotTag, FstatNode};
use crate::depot::session::DepotSession;
use crate::fs::{AccessMode, FileAttrs, ShareMode, StoreHandle};
use crate::placeholder::{self, PlaceholderInfo, ResidencyPolicy};
use crate::settings::keys;

/// The policy the resolver applied.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ResolvedPolicy {
    /// Content materialized (or the file was never ours to begin with).
    Resident,
    /// The file wants to be re-created as a normal symlink; retry the open.
    Symlink,
    /// The placeholder was deleted.
    RemoveFile,
}

/// Resolver failures, mapped by the service to NT statuses.
#[derive(Debug)]
pub enum ResolveError {
    /// No session could be produced for the placeholder's identity.
    NoSession,
    /// Metadata declared no usable policy; the file is not serviceable.
    UndefinedPolicy,
    Io(std::io::Error),
    Depot(String),
}

impl std::fmt::Display for ResolveError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ResolveError::NoSession => write!(f, "no depot session available"),
            ResolveError::UndefinedPolicy => write!(f, "undefined residency policy"),
            ResolveError::Io(e) => write!(f, "io: {e}"),
            ResolveError::Depot(text) => write!(f, "depot: {text}"),
        }
    }
}

impl std::error::Error for ResolveError {}

impl From<std::io::Error> for ResolveError {
    fn from(e: std::io::Error) -> Self {
        ResolveError::Io(e)
    }
}

/// How content is moved into the placeholder.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum PopulateMethod {
    Copy,
    Move,
    Stream,
}

impl PopulateMethod {
    pub fn from_name(name: &str) -> PopulateMethod {
        if name.eq_ignore_ascii_case("copy") {
            PopulateMethod::Copy
        } else if name.eq_ignore_ascii_case("move") {
            PopulateMethod::Move
        } else {
            PopulateMethod::Stream
        }
    }
}

/// Resolves the residency of `path`. Files without parseable placeholder
/// metadata are reported already resident and succeed; an explicit
/// Undefined policy is an integrity failure.
pub async fn resolve_file_residency(
    context: &AppContext,
    user: &UserContext,
    path: &Path,
) -> Result<ResolvedPolicy, ResolveError> {
    let info = match placeholder::read_info(context.store.as_ref(), path).await {
        Ok(Some(info)) => info,
        Ok(None) => {
            tracing::info!(path = %path.display(), "resolve skipped, file has no placeholder");
            return Ok(ResolvedPolicy::Resident);
        }
        Err(e) => {
            // Unknown or truncated payloads: not ours, leave it alone.
            tracing::info!(path = %path.display(), error = %e, "resolve skipped, foreign payload");
            return Ok(ResolvedPolicy::Resident);
        }
    };

    if info.residency() == ResidencyPolicy::Undefined || info.depot_path.is_empty() {
        tracing::error!(path = %path.display(), "placeholder carries no usable policy");
        return Err(ResolveError::UndefinedPolicy);
    }

    if info.residency() == ResidencyPolicy::Symlink {
        return Ok(ResolvedPolicy::Symlink);
    }

    // The session key resolves the recorded server through the rewrite
    // patterns; directory scopes any config-file discovery to the file.
    let mut config = DepotConfig::default();
    config.port = config::resolve_depot_server_name(&context.settings, &info.depot_server);
    config.user = info.depot_user.clone();
    config.client = info.depot_client.clone();
    config.directory =
        path.parent().map(|p| p.to_string_lossy().into_owned()).unwrap_or_default();

    let attempts = context.pool.free_count().await + 1;
    let mut last_error = ResolveError::NoSession;
    for _ in 0..attempts {
        let Some(mut session) = context.pool.allocate(&config, &path.to_string_lossy()).await
        else {
            last_error = ResolveError::NoSession;
            continue;
        };

        let outcome = match info.residency() {
            ResidencyPolicy::Resident => {
                make_file_resident(context, &mut session, path, &info).await
            }
            ResidencyPolicy::RemoveFile => {
                tracing::info!(path = %path.display(), "residency policy removes file");
                context.store.remove_file(path).await.map_err(ResolveError::Io)
            }
            _ => Err(ResolveError::UndefinedPolicy),
        };

        match outcome {
            Ok(()) => {
                context.pool.free(&config, session).await;
                tracing::info!(
                    "{}#{} - hydrated as {} [{},{},{}] process [{}.{}]",
                    info.depot_path,
                    info.file_revision,
                    path.display(),
                    config.port,
                    info.depot_user,
                    info.depot_client,
                    user.process_id,
                    user.thread_id,
                );
                return Ok(match info.residency() {
                    ResidencyPolicy::RemoveFile => ResolvedPolicy::RemoveFile,
                    _ => ResolvedPolicy::Resident,
                });
            }
            Err(e) => {
                tracing::error!(path = %path.display(), error = %e, "resolve attempt failed");
                // Faulted mid-call: drop the session rather than pool it.
                drop(session);
                last_error = e;
            }
        }
    }
    Err(last_error)
}

/// Materializes the file's bytes at exactly the recorded revision, using
/// the populate method selected by settings.
async fn make_file_resident(
    context: &AppContext,
    session: &mut DepotSession,
    path: &Path,
    info: &PlaceholderInfo,
) -> Result<(), ResolveError> {
    let file_spec = format!("{}#{}", info.depot_path, info.file_revision);
    let method =
        PopulateMethod::from_name(&context.settings.get_str(keys::POPULATE_METHOD));
    tracing::debug!(spec = file_spec, ?method, "make file resident");

    let original_attrs = context
        .store
        .metadata(path)
        .await?
        .map(|m| m.attrs)
        .ok_or_else(|| ResolveError::Io(std::io::Error::new(
            std::io::ErrorKind::NotFound,
            "placeholder vanished",
        )))?;
    if original_attrs.readonly {
        context.store.set_file_attrs(path, FileAttrs::NORMAL.offline(original_attrs.offline)).await?;
    }

    let populate = async {
        match method {
            PopulateMethod::Copy => populate_by_copy(context, session, path, &file_spec).await,
            PopulateMethod::Move => populate_by_move(context, session, path, &file_spec).await,
            PopulateMethod::Stream => populate_by_stream(context, session, path, &file_spec).await,
        }
    }
    .await;

    match populate {
        Ok(()) => {
            // Hydration is complete; drop the offline marker, keep the
            // original read-only state.
            context
                .store
                .set_file_attrs(path, original_attrs.offline(false))
                .await
                .map_err(ResolveError::Io)
        }
        Err(e) => {
            let _ = context.store.set_file_attrs(path, original_attrs).await;
            Err(e)
        }
    }
}

/// `print -o` into a temp file, then copy its bytes into the placeholder
/// through an open-by-id handle.
async fn populate_by_copy(
    context: &AppContext,
    session: &mut DepotSession,
    path: &Path,
    file_spec: &str,
) -> Result<(), ResolveError> {
    let temp = tempfile::NamedTempFile::new().map_err(ResolveError::Io)?;
    let temp_path = temp.path().to_path_buf();
    print_to_file(session, file_spec, &temp_path).await?;

    let mut handle = context
        .store
        .open_by_file_id(path, AccessMode::WRITE, ShareMode::ALL)
        .await?;
    let sequence = async {
        handle.freeze_times().await?;
        let content = tokio::fs::read(&temp_path).await?;
        handle.write(&content).await?;
        finish_hydrated_handle(&mut handle).await
    }
    .await;
    close_with(handle, sequence).await
}

/// `print -o` into a temp file adjacent to the target, then atomically
/// rename it over the placeholder, preserving the target's file times.
async fn populate_by_move(
    context: &AppContext,
    session: &mut DepotSession,
    path: &Path,
    file_spec: &str,
) -> Result<(), ResolveError> {
    let parent = path.parent().ok_or_else(|| {
        ResolveError::Io(std::io::Error::new(std::io::ErrorKind::InvalidInput, "no parent"))
    })?;
    let temp = tempfile::NamedTempFile::new_in(parent).map_err(ResolveError::Io)?;
    let temp_path = temp.path().to_path_buf();
    // Keep the file after the rename; the guard must not delete the target.
    let (_, _kept) = temp.keep().map_err(|e| ResolveError::Io(e.error))?;

    print_to_file(session, file_spec, &temp_path).await?;

    let (accessed, modified) = context.store.file_times(path).await?;
    context.store.set_file_times(&temp_path, accessed, modified).await?;
    context.store.rename_replace(&temp_path, path).await?;
    Ok(())
}

/// Streams `print -a` output straight into the placeholder's open handle,
/// through the encoder chain for the server-reported file type.
async fn populate_by_stream(
    context: &AppContext,
    session: &mut DepotSession,
    path: &Path,
    file_spec: &str,
) -> Result<(), ResolveError> {
    let head_type = query_head_type(session, file_spec).await;
    let encoder = OutputEncoder::new(&head_type, &session.line_end());

    let mut handle = context
        .store
        .open_by_file_id(path, AccessMode::WRITE, ShareMode::ALL)
        .await?;
    let sequence = async {
        handle.freeze_times().await.map_err(ResolveError::Io)?;

        let command = DepotCommand::new("print", ["-q", "-a", file_spec]).binary();
        let mut sink = PrintSink { handle: handle.as_mut(), encoder, errors: Vec::new() };
        session
            .run_with_handler(&command, &mut sink)
            .await
            .map_err(|e| ResolveError::Depot(e.to_string()))?;
        let tail = sink.encoder.finish();
        if !tail.is_empty() {
            sink.handle.write(&tail).await.map_err(ResolveError::Io)?;
        }
        if !sink.errors.is_empty() {
            return Err(ResolveError::Depot(sink.errors.join("; ")));
        }
        finish_hydrated_handle(&mut handle).await
    }
    .await;
    close_with(handle, sequence).await
}

/// Truncate at position, strip the reparse point, clear sparse: the tail
/// of the strict hydrate sequence.
async fn finish_hydrated_handle(
    handle: &mut Box<dyn StoreHandle>,
) -> Result<(), ResolveError> {
    handle.truncate_at_position().await?;
    handle.remove_reparse().await?;
    handle.clear_sparse().await?;
    Ok(())
}

async fn close_with(
    handle: Box<dyn StoreHandle>,
    sequence: Result<(), ResolveError>,
) -> Result<(), ResolveError> {
    match sequence {
        Ok(()) => handle.close().await.map_err(ResolveError::Io),
        Err(e) => {
            let _ = handle.close().await;
            Err(e)
        }
    }
}

async fn print_to_file(
    session: &mut DepotSession,
    file_spec: &str,
    output: &Path,
) -> Result<(), ResolveError> {
    let output_text = output.to_string_lossy().into_owned();
    let result = session
        .run(DepotCommand::new("print", ["-a", "-o", output_text.as_str(), file_spec]))
        .await;
    if result.has_error() {
        return Err(ResolveError::Depot(result.error_text()));
    }
    Ok(())
}

async fn query_head_type(session: &mut DepotSession, file_spec: &str) -> String {
    let result = session.run(DepotCommand::new("fstat", ["-T", "headType", file_spec])).await;
    result.node(0).map(|tag| FstatNode(tag).head_type().to_string()).unwrap_or_default()
}

/// Streams decoded print output into a placeholder handle.
struct PrintSink<'a> {
    handle: &'a mut dyn StoreHandle,
    encoder: OutputEncoder,
    errors: Vec<String>,
}

#[async_trait]
impl CommandHandler for PrintSink<'_> {
    async fn on_text(&mut self, channel: DepotChannel, _level: i32, text: &str) {
        if channel == DepotChannel::StdErr {
            self.errors.push(text.to_string());
        }
    }

    async fn on_tag(&mut self, _tag: DepotTag) {}

    async fn on_binary(&mut self, data: &[u8]) -> std::io::Result<()> {
        let encoded = self.encoder.encode(data);
        self.handle.write(&encoded).await
    }
}
