//! The virtual sync engine.
//!
//! A virtual sync asks the server what a sync would do, installs a
//! placeholder for every planned file modification in parallel, and
//! brings the have-table up to date, either per file as each placeholder
//! lands (`Atomic` flush) or in one batch performed by the plan command
//! itself (`Single` flush). Always-resident files (matched by the
//! configured pattern) bypass placeholders with a forced real sync.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use regex::RegexBuilder;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use crate::context::AppContext;
use crate::depot::command::DepotCommand;
use crate::depot::config::DepotConfig;
use crate::depot::result::{
    is_symlink_file_type, is_writable_file_type, ChangesNode, ClientNode, Diff2Node, FstatNode,
    SizesNode,
};
use crate::depot::revision::Revision;
use crate::depot::session::DepotSession;
use crate::depot::sync_action::{
    FlushMode, SyncActionFlags, SyncActionInfo, SyncActionKind, SyncFlags,
};
use crate::fs::FileAttrs;
use crate::logging::{LogChannel, OperationLog};
use crate::placeholder::{self, InstallRequest, ResidencyPolicy};
use crate::resolver;
use crate::settings::keys;
use crate::text;

/// How a sync materializes content.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum SyncMethod {
    /// Install placeholders; content arrives on first access.
    Virtual,
    /// Let the server transfer file content as usual.
    Regular,
}

/// One sync invocation.
#[derive(Debug, Clone)]
pub struct SyncOptions {
    pub files: Vec<String>,
    pub revision: Option<Revision>,
    pub sync_flags: SyncFlags,
    pub sync_method: SyncMethod,
    pub flush_mode: FlushMode,
    /// Regex over depot paths whose files are always fully synced.
    pub resident_pattern: String,
}

impl Default for SyncOptions {
    fn default() -> Self {
        Self {
            files: Vec::new(),
            revision: None,
            sync_flags: SyncFlags::NORMAL,
            sync_method: SyncMethod::Virtual,
            flush_mode: FlushMode::Atomic,
            resident_pattern: String::new(),
        }
    }
}

/// Overall outcome, classified from the operation log.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum SyncStatus {
    Success,
    Warning,
    Error,
}

impl SyncStatus {
    fn from_log(log: &OperationLog) -> SyncStatus {
        match log.max_channel() {
            Some(LogChannel::Error) => SyncStatus::Error,
            Some(LogChannel::Warning) => SyncStatus::Warning,
            _ => SyncStatus::Success,
        }
    }
}

/// Aggregated result of one sync call.
#[derive(Debug)]
pub struct SyncResult {
    pub status: SyncStatus,
    pub modifications: Option<Vec<SyncActionInfo>>,
}

impl SyncResult {
    fn status_only(status: SyncStatus) -> SyncResult {
        SyncResult { status, modifications: None }
    }
}

/// Entry point: virtual unless the method or flags demand a regular sync.
pub async fn sync(
    context: &AppContext,
    session: &mut DepotSession,
    options: &SyncOptions,
) -> SyncResult {
    if options.sync_method == SyncMethod::Regular
        || options.sync_flags.contains(SyncFlags::PREVIEW.union(SyncFlags::FLUSH))
    {
        sync_regular(session, options).await
    } else {
        sync_virtual(context, session, options).await
    }
}

/// A plain sync: run the command, parse its output, classify.
pub async fn sync_regular(session: &mut DepotSession, options: &SyncOptions) -> SyncResult {
    let log = OperationLog::new();

    let Some(revision) = pin_revision(session, options.revision.clone(), &log).await else {
        return SyncResult::status_only(SyncStatus::Error);
    };

    let modifications =
        sync_command(session, &options.files, &revision, options.sync_flags, &log).await;

    let status = SyncStatus::from_log(&log);
    if status != SyncStatus::Success {
        log_warning_error_summary(&log);
    }
    SyncResult { status, modifications }
}

/// The virtual sync: plan, partition, parallelize, classify, summarize.
pub async fn sync_virtual(
    context: &AppContext,
    session: &mut DepotSession,
    options: &SyncOptions,
) -> SyncResult {
    let total_timer = Instant::now();
    let log = Arc::new(OperationLog::new());

    let Some(revision) = pin_revision(session, options.revision.clone(), &log).await else {
        return SyncResult::status_only(SyncStatus::Error);
    };

    log.info(format!(
        "Virtual Sync: {} {:?} {} {}",
        to_display_string(&options.files),
        options.sync_flags,
        options.flush_mode,
        revision
    ));

    // The plan: Single flush updates the whole batch's have-table here;
    // Atomic flush previews and pairs per-file flushes with installs.
    let mut primary_flags = options.sync_flags;
    primary_flags.remove(SyncFlags::IGNORE_OUTPUT);
    primary_flags.insert(match options.flush_mode {
        FlushMode::Single => SyncFlags::FLUSH,
        FlushMode::Atomic => SyncFlags::PREVIEW,
    });
    primary_flags.insert(SyncFlags::QUIET);

    let Some(mut modifications) =
        sync_command(session, &options.files, &revision, primary_flags, &log).await
    else {
        return SyncResult::status_only(SyncStatus::Error);
    };
    let planned_total = modifications.len();
    log.info(format!(
        "{planned_total} modification message{} to act on.",
        if planned_total == 1 { "" } else { "s" }
    ));

    let resident_re = (!options.resident_pattern.is_empty())
        .then(|| {
            RegexBuilder::new(&options.resident_pattern).case_insensitive(true).build().ok()
        })
        .flatten();
    for modification in &mut modifications {
        modification.sync_flags = options.sync_flags;
        modification.flush_mode = options.flush_mode;
        modification.is_always_resident = resident_re
            .as_ref()
            .map(|re| re.is_match(&modification.depot_file))
            .unwrap_or(false);
        if primary_flags.contains(SyncFlags::WRITEABLE) {
            modification.action_flags.insert(SyncActionFlags::CLIENT_CLOBBER);
        }
    }

    // In Single mode always-resident files defer to one forced batch sync
    // at the end; Atomic mode handles them per file inside the workers.
    let (resident_batch, parallel_batch): (Vec<_>, Vec<_>) = match options.flush_mode {
        FlushMode::Single => modifications.into_iter().partition(|m| {
            m.is_always_resident && !m.action_flags.contains(SyncActionFlags::FILE_SYMLINK)
        }),
        FlushMode::Atomic => (Vec::new(), modifications),
    };

    let keep_results = !options.sync_flags.contains(SyncFlags::IGNORE_OUTPUT);
    let client_root = client_root(session);
    let config = session.config().clone();

    let parallel_timer = Instant::now();
    let results = apply_parallel(
        context,
        &config,
        &client_root,
        &revision,
        parallel_batch,
        log.clone(),
    )
    .await;
    let parallel_ms = parallel_timer.elapsed().as_millis() as i64;

    // Force sync the deferred always-resident batch.
    let resident_timer = Instant::now();
    let mut all_results = results;
    if !resident_batch.is_empty() {
        let specs: Vec<String> = resident_batch
            .iter()
            .filter(|m| !m.is_preview())
            .map(SyncActionInfo::file_spec)
            .collect();
        if !specs.is_empty() {
            sync_command(
                session,
                &specs,
                &revision,
                SyncFlags::FORCE.union(SyncFlags::IGNORE_OUTPUT),
                &log,
            )
            .await;
        }
        all_results.extend(resident_batch);
    }
    let resident_ms = resident_timer.elapsed().as_millis() as i64;

    if !keep_results {
        return SyncResult::status_only(SyncStatus::Success);
    }

    let status = SyncStatus::from_log(&log);
    if status != SyncStatus::Success {
        log_warning_error_summary(&log);
    }

    let total_ms = total_timer.elapsed().as_millis() as i64;
    let virtual_bytes: i64 = all_results.iter().map(|m| m.virtual_file_size).sum();
    let disk_bytes: i64 = all_results.iter().map(|m| m.disk_file_size).sum();
    let flush_ms: i64 = all_results.iter().map(|m| m.flush_time_ms).sum();
    let placeholder_ms: i64 = all_results.iter().map(|m| m.placeholder_time_ms).sum();

    log.info("Virtual Sync Summary:".to_string());
    log.info(format!("Total Files:         {} / {}", all_results.len(), planned_total));
    log.info(format!("Total Time:          {}", display_milliseconds(total_ms)));
    log.info(format!("Virtual Mod Time:    {}", display_milliseconds(parallel_ms)));
    log.info(format!("Resident Mod Time:   {}", display_milliseconds(resident_ms)));
    log.info(format!("Virtual File Size:   {}", display_bytes(virtual_bytes.max(0) as u64)));
    log.info(format!("Disk File Size:      {}", display_bytes(disk_bytes.max(0) as u64)));
    log.verbose(format!("Flush Time:          {}", display_milliseconds(flush_ms)));
    log.verbose(format!("Placeholder Time:    {}", display_milliseconds(placeholder_ms)));

    SyncResult { status, modifications: Some(all_results) }
}

/// Runs the per-file phase across up to `MaxSyncConnections` workers.
/// Each worker lazily connects one session of its own; a worker that
/// faults cancels the drain.
async fn apply_parallel(
    context: &AppContext,
    config: &DepotConfig,
    client_root: &Path,
    revision: &Revision,
    batch: Vec<SyncActionInfo>,
    log: Arc<OperationLog>,
) -> Vec<SyncActionInfo> {
    if batch.is_empty() {
        return Vec::new();
    }

    let worker_count = (context.settings.get_i32(keys::MAX_SYNC_CONNECTIONS).max(1) as usize)
        .min(batch.len());
    let queue = Arc::new(Mutex::new(batch.into_iter().collect::<std::collections::VecDeque<_>>()));
    let results = Arc::new(Mutex::new(Vec::new()));
    let cancel = CancellationToken::new();

    let mut workers = tokio::task::JoinSet::new();
    for _ in 0..worker_count {
        let context = context.clone();
        let config = config.clone();
        let client_root = client_root.to_path_buf();
        let revision = revision.clone();
        let queue = queue.clone();
        let results = results.clone();
        let cancel = cancel.clone();
        let log = log.clone();

        workers.spawn(async move {
            let mut session: Option<DepotSession> = None;
            loop {
                if cancel.is_cancelled() {
                    break;
                }
                let Some(mut modification) = queue.lock().await.pop_front() else { break };

                let needs_session = modification.is_always_resident
                    || modification.flush_mode == FlushMode::Atomic
                    || modification.action_flags.contains(SyncActionFlags::FILE_SYMLINK);
                if needs_session && session.is_none() {
                    match context.pool.allocate(&config, "virtual-sync").await {
                        Some(connected) => session = Some(connected),
                        None => {
                            log.error("depot session failed to connect".to_string());
                            cancel.cancel();
                            break;
                        }
                    }
                }

                apply_virtual_modification(
                    &context,
                    session.as_mut(),
                    &config,
                    &client_root,
                    &revision,
                    &mut modification,
                    &log,
                )
                .await;

                let faulted = session.as_ref().map(DepotSession::is_faulted).unwrap_or(false);
                results.lock().await.push(modification);
                if faulted {
                    log.info("aborting sync from depot session fault".to_string());
                    cancel.cancel();
                    break;
                }
            }
            if let Some(session) = session.take() {
                context.pool.free(&config, session).await;
            }
        });
    }
    while workers.join_next().await.is_some() {}

    Arc::try_unwrap(results).expect("workers joined").into_inner()
}

/// Applies one planned modification: install/uninstall the placeholder,
/// flush the have-table, or log the server's verdict.
async fn apply_virtual_modification(
    context: &AppContext,
    mut session: Option<&mut DepotSession>,
    config: &DepotConfig,
    client_root: &Path,
    revision: &Revision,
    modification: &mut SyncActionInfo,
    parent_log: &OperationLog,
) {
    // Nested actions buffer their lines and flush them all at once.
    let buffered = OperationLog::new();
    let log: &OperationLog =
        if modification.sub_actions.is_empty() { parent_log } else { &buffered };

    let spec = modification.file_spec();
    let client_file = PathBuf::from(&modification.client_file);

    match modification.kind {
        kind if kind.is_local_changed() => {
            let verb = if modification.is_always_resident { "downloaded" } else { "installed" };
            log.info(format!("{spec} - {verb} as {}", modification.client_file));

            if !clobber_check(context, modification, &client_file, log).await {
                // Logged inside the check; nothing touches the disk.
            } else if modification.is_always_resident {
                modification.disk_file_size = modification.file_size;
                if !modification.is_preview() {
                    if let Some(session) = session.as_deref_mut() {
                        let timer = Instant::now();
                        sync_command(
                            session,
                            std::slice::from_ref(&modification.depot_file),
                            revision,
                            SyncFlags::FORCE
                                .union(SyncFlags::IGNORE_OUTPUT)
                                .union(SyncFlags::QUIET),
                            log,
                        )
                        .await;
                        modification.sync_time_ms = timer.elapsed().as_millis() as i64;
                    }
                }
            } else {
                modification.virtual_file_size = modification.file_size;
                if !modification.is_preview() {
                    let timer = Instant::now();
                    let installed = install_modification(
                        context,
                        session.as_deref_mut(),
                        config,
                        modification,
                    )
                    .await;
                    modification.placeholder_time_ms = timer.elapsed().as_millis() as i64;

                    if installed {
                        if modification.flush_mode == FlushMode::Atomic {
                            if let Some(session) = session.as_deref_mut() {
                                let timer = Instant::now();
                                sync_command(
                                    session,
                                    std::slice::from_ref(&modification.depot_file),
                                    revision,
                                    SyncFlags::FLUSH
                                        .union(SyncFlags::IGNORE_OUTPUT)
                                        .union(SyncFlags::QUIET),
                                    log,
                                )
                                .await;
                                modification.flush_time_ms = timer.elapsed().as_millis() as i64;
                            }
                        }
                    } else {
                        log.error(format!(
                            "Failed to install {spec} -> {}",
                            modification.client_file
                        ));
                    }
                }
            }
        }
        SyncActionKind::Deleted => {
            log.info(format!("{spec} - deleted as {}", modification.client_file));
            if !clobber_check(context, modification, &client_file, log).await {
                // Writable local file; leave it alone.
            } else if !modification.is_preview() {
                let timer = Instant::now();
                let removed =
                    placeholder::uninstall(context.store.as_ref(), &client_file, client_root)
                        .await
                        .is_ok();
                modification.placeholder_time_ms = timer.elapsed().as_millis() as i64;
                if removed {
                    if let Some(session) = session.as_deref_mut() {
                        let timer = Instant::now();
                        sync_command(
                            session,
                            std::slice::from_ref(&modification.depot_file),
                            &Revision::None,
                            SyncFlags::FLUSH.union(SyncFlags::IGNORE_OUTPUT).union(SyncFlags::QUIET),
                            log,
                        )
                        .await;
                        modification.flush_time_ms = timer.elapsed().as_millis() as i64;
                    }
                } else {
                    log.error(format!("Failed to remove file {}", modification.client_file));
                }
            }
        }
        SyncActionKind::OpenedNotChanged => {
            if let Some(session) = session.as_deref_mut() {
                let timer = Instant::now();
                sync_command(
                    session,
                    std::slice::from_ref(&modification.depot_file),
                    revision,
                    SyncFlags::FLUSH.union(SyncFlags::IGNORE_OUTPUT).union(SyncFlags::QUIET),
                    log,
                )
                .await;
                modification.flush_time_ms = timer.elapsed().as_millis() as i64;
            }
            log.warning(format!("{spec} - is opened and not being changed"));
        }
        SyncActionKind::UpToDate => {
            log.info(format!("File up-to-date {spec}"));
        }
        SyncActionKind::NoFilesFound => {
            log.error(format!("No file at that changelist number {spec}"));
        }
        SyncActionKind::NoFileAtRevision => {
            log.error(format!("No file at that revision {spec}"));
        }
        SyncActionKind::InvalidPattern => {
            log.error(format!("No such file {spec}"));
        }
        SyncActionKind::NotInClientView => {
            log.error(format!("File not in client view {spec}"));
        }
        SyncActionKind::CantClobber => {
            log.error(format!("Can't clobber writable file {}", modification.client_file));
        }
        SyncActionKind::NeedsResolve => {
            log.error(format!(
                "... {} - must resolve {} before submitting",
                modification.depot_file,
                Revision::to_spec_string(modification.revision.as_ref())
            ));
        }
        SyncActionKind::GenericError => {
            log.error(modification.message.clone());
        }
        other => {
            log.error(format!("Unsupported sync action: {other}"));
        }
    }

    let mut sub_actions = std::mem::take(&mut modification.sub_actions);
    for sub in &mut sub_actions {
        Box::pin(apply_virtual_modification(
            context,
            session.as_deref_mut(),
            config,
            client_root,
            revision,
            sub,
            log,
        ))
        .await;
    }
    modification.sub_actions = sub_actions;

    if !modification.sub_actions.is_empty() {
        parent_log.append(&buffered);
    }
}

/// Verifies the existing file is ours to replace. Existing writable files
/// are only touched when the action flags permit it.
async fn clobber_check(
    context: &AppContext,
    modification: &SyncActionInfo,
    client_file: &Path,
    log: &OperationLog,
) -> bool {
    match context.store.metadata(client_file).await {
        Ok(Some(meta)) if !meta.attrs.readonly && !meta.is_directory => {
            if modification.can_modify_writable_file() {
                true
            } else {
                log.error(format!("Can't clobber writeable file {}", modification.client_file));
                false
            }
        }
        _ => true,
    }
}

/// Installs the placeholder (or symlink) for one modification.
async fn install_modification(
    context: &AppContext,
    session: Option<&mut DepotSession>,
    config: &DepotConfig,
    modification: &SyncActionInfo,
) -> bool {
    let client_file = PathBuf::from(&modification.client_file);

    // Symlink file types become real symlinks only when enabled; otherwise
    // they get an ordinary placeholder like everything else.
    if modification.action_flags.contains(SyncActionFlags::FILE_SYMLINK)
        && context.settings.get_bool(keys::ALLOW_SYMLINK_RESIDENCY_POLICY)
    {
        let Some(session) = session else { return false };
        let Some(target) =
            symlink_target_path(session, &modification.depot_file, modification.revision.as_ref())
                .await
        else {
            return false;
        };
        return context
            .store
            .create_symlink(&client_file, Path::new(&target))
            .await
            .is_ok();
    }

    let request = InstallRequest {
        residency_policy: ResidencyPolicy::Resident as u8,
        file_revision: modification.revision_number().max(0) as u32,
        file_size: modification.file_size,
        attrs: FileAttrs::NORMAL.readonly(!modification.can_set_writable_file()),
        depot_path: modification.depot_file.clone(),
        depot_server: config.port.clone(),
        depot_client: config.client.clone(),
        depot_user: config.user.clone(),
    };
    placeholder::install(context.store.as_ref(), &context.settings, &client_file, &request)
        .await
        .is_ok()
}

/// The depot content of a symlink file is its target path.
async fn symlink_target_path(
    session: &mut DepotSession,
    depot_file: &str,
    revision: Option<&Revision>,
) -> Option<String> {
    let spec = create_file_spec(depot_file, revision, false)?;
    let result =
        session.run(DepotCommand::new("print", ["-q", spec.as_str()]).untagged()).await;
    if result.has_error() {
        return None;
    }
    let target = result.text(crate::depot::result::DepotChannel::StdOut).trim().to_string();
    (!target.is_empty()).then_some(target)
}

/// Runs one `sync` command and parses its output into action records.
/// Returns `None` for command failure or when output is ignored.
pub async fn sync_command(
    session: &mut DepotSession,
    files: &[String],
    revision: &Revision,
    sync_flags: SyncFlags,
    log: &OperationLog,
) -> Option<Vec<SyncActionInfo>> {
    let client_name = session_client_name(session);
    let files_display = to_display_string(files);
    let report_error = move |log: &OperationLog, context: &str| {
        log.error(format!(
            "sync failed for client='{client_name}' files={files_display} revision='{revision}' flags={sync_flags:?}. {context}",
        ));
    };

    let file_specs = create_file_specs(session, files, revision);
    if file_specs.is_empty() {
        report_error(log, "No files specified to sync to");
        return None;
    }

    // Writable/symlink file types at the have and head revisions drive the
    // clobber rules; only worth asking when output will be consumed.
    let mut diff_depot_files: HashSet<String> = HashSet::new();
    let mut writable_head: HashSet<String> = HashSet::new();
    let mut writable_have: HashSet<String> = HashSet::new();
    let mut symlink_files: HashSet<String> = HashSet::new();
    let mut client_sizes: HashMap<String, i64> = HashMap::new();

    let wants_state = sync_flags.contains(SyncFlags::PREVIEW.union(SyncFlags::FLUSH))
        && !sync_flags.contains(SyncFlags::IGNORE_OUTPUT);
    if wants_state {
        let have_revision =
            if sync_flags.contains(SyncFlags::FORCE) { Revision::None } else { Revision::Have };
        for file_spec in &file_specs {
            let Some(have_spec) = create_file_spec(file_spec, Some(&have_revision), true) else {
                report_error(log, &format!("Invalid have spec for '{file_spec}'"));
                return None;
            };

            let diff2 = session
                .run(DepotCommand::new("diff2", ["-q", have_spec.as_str(), file_spec.as_str()]))
                .await;
            for tag in diff2.tags() {
                let node = Diff2Node(tag);
                diff_depot_files.insert(text::fold(node.depot_file()));
                diff_depot_files.insert(text::fold(node.depot_file2()));
                if is_writable_file_type(node.file_type()) {
                    writable_have.insert(text::fold(node.depot_file()));
                }
                if is_writable_file_type(node.file_type2()) {
                    writable_head.insert(text::fold(node.depot_file2()));
                }
                if is_symlink_file_type(node.file_type()) {
                    symlink_files.insert(text::fold(node.depot_file()));
                }
                if is_symlink_file_type(node.file_type2()) {
                    symlink_files.insert(text::fold(node.depot_file2()));
                }
            }

            if sync_flags.contains(SyncFlags::CLIENT_SIZE) {
                let sizes = session
                    .run(DepotCommand::new("sizes", ["-C", file_spec.as_str()]))
                    .await;
                for tag in sizes.tags() {
                    let node = SizesNode(tag);
                    client_sizes.insert(text::fold(node.depot_file()), node.file_size());
                }
            }
        }
    }

    let mut command = DepotCommand::new("sync", Vec::<String>::new());
    if sync_flags.contains(SyncFlags::FORCE) {
        command.args.push("-f".to_string());
    }
    if sync_flags.contains(SyncFlags::FLUSH) {
        command.args.push("-k".to_string());
    }
    if sync_flags.contains(SyncFlags::PREVIEW) {
        command.args.push("-n".to_string());
    }
    command.args.extend(file_specs.iter().cloned());
    if !sync_flags.contains(SyncFlags::QUIET) {
        command = command.untagged();
    }

    let result = session.run(command).await;
    if sync_flags.contains(SyncFlags::IGNORE_OUTPUT) {
        return None;
    }

    let mut modifications: Vec<SyncActionInfo> = Vec::new();
    for tag in result.tags() {
        if let Some(info) = SyncActionInfo::from_tagged(tag, log) {
            modifications.push(info);
        }
    }

    // Text output nests subactions beneath the preceding level-0 line.
    let mut parent_alive = false;
    for record in result.texts() {
        use crate::depot::result::DepotChannel;
        let info = match record.channel {
            DepotChannel::StdOut => SyncActionInfo::from_info_output(&record.value, log),
            DepotChannel::StdErr => Some(SyncActionInfo::from_error_output(&record.value)),
        };
        match info {
            None => parent_alive = false,
            Some(info) if record.level == 0 => {
                modifications.push(info);
                parent_alive = true;
            }
            Some(info) => {
                if parent_alive {
                    if let Some(parent) = modifications.last_mut() {
                        parent.sub_actions.push(info);
                    }
                }
            }
        }
    }

    // Files opened in this workspace keep their head revision.
    let mut opened_head: HashMap<String, i32> = HashMap::new();
    let mut fstat_args: Vec<String> =
        vec!["-Ro".to_string(), "-T".to_string(), "depotFile,headRev".to_string()];
    fstat_args.extend(file_specs.iter().cloned());
    let opened = session
        .run(DepotCommand::new("fstat", fstat_args.iter().map(String::as_str)))
        .await;
    for tag in opened.tags() {
        let node = FstatNode(tag);
        opened_head.insert(text::fold(node.depot_file()), node.head_rev());
    }

    for modification in &mut modifications {
        if modification.kind == SyncActionKind::OpenedNotChanged
            && !modification.depot_file.is_empty()
        {
            if let Some(head_rev) = opened_head.get(&text::fold(&modification.depot_file)) {
                modification.revision = Some(Revision::Number(*head_rev));
            }
        }
        if let Some(size) = client_sizes.get(&text::fold(&modification.depot_file)) {
            if *size > 0 {
                modification.file_size = *size;
            }
        }
    }

    // Identical-have files never show in diff2 output; ask fstat with a
    // writable-filetype filter to attach their write flags.
    if wants_state {
        let identical: Vec<String> = modifications
            .iter()
            .filter(|m| {
                m.kind.is_local_changed()
                    && !m.depot_file.is_empty()
                    && !diff_depot_files.contains(&text::fold(&m.depot_file))
            })
            .map(|m| format!("{}{revision}", m.depot_file))
            .collect();
        if !identical.is_empty() {
            let mut args: Vec<String> = vec![
                "-F".to_string(),
                "headType=*+*w*".to_string(),
                "-T".to_string(),
                "depotFile".to_string(),
            ];
            args.extend(identical);
            let writable =
                session.run(DepotCommand::new("fstat", args.iter().map(String::as_str))).await;
            for tag in writable.tags() {
                let key = text::fold(FstatNode(tag).depot_file());
                writable_have.insert(key.clone());
                writable_head.insert(key);
            }
        }
    }

    let mut common_flags = SyncActionFlags::NONE;
    if let Some(client) = session.connection().and_then(|c| c.node(0)) {
        let node = ClientNode(client);
        if node.is_clobber() {
            common_flags.insert(SyncActionFlags::CLIENT_CLOBBER);
        }
        if node.is_all_write() {
            common_flags.insert(SyncActionFlags::CLIENT_WRITE);
        }
    }

    for modification in &mut modifications {
        modification.sync_flags = sync_flags;
        modification.action_flags = common_flags;
        let key = text::fold(&modification.depot_file);
        if writable_head.contains(&key) {
            modification.action_flags.insert(SyncActionFlags::FILE_WRITE);
        }
        if writable_have.contains(&key) {
            modification.action_flags.insert(SyncActionFlags::HAVE_FILE_WRITE);
        }
        if symlink_files.contains(&key) {
            modification.action_flags.insert(SyncActionFlags::FILE_SYMLINK);
        }
    }
    Some(modifications)
}

/// Reads the top changelist once so every subsequent command in a batch
/// pins to the same snapshot.
pub async fn head_revision_changelist(session: &mut DepotSession) -> Option<Revision> {
    let changes = session.run(DepotCommand::new("changes", ["-m", "1"])).await;
    let change = changes.node(0).map(|tag| ChangesNode(tag).change()).unwrap_or(0);
    (change > 0).then_some(Revision::Changelist(change))
}

async fn pin_revision(
    session: &mut DepotSession,
    revision: Option<Revision>,
    log: &OperationLog,
) -> Option<Revision> {
    match revision {
        Some(revision) if !revision.is_head() => Some(revision),
        _ => match head_revision_changelist(session).await {
            Some(revision) => Some(revision),
            None => {
                log.error("Missing specific head revision".to_string());
                None
            }
        },
    }
}

/// Builds `path#rev` from a path that may already carry a revision
/// suffix. `override_revision` discards any embedded suffix.
pub fn create_file_spec(
    file_path: &str,
    revision: Option<&Revision>,
    override_revision: bool,
) -> Option<String> {
    let trimmed = file_path.trim().trim_matches('"').trim();
    let (path, embedded) = match trimmed.find(['@', '#']) {
        Some(at) => (&trimmed[..at], Some(&trimmed[at..])),
        None => (trimmed, None),
    };

    let revision_text = match embedded {
        Some(embedded) if !override_revision && embedded.len() > 1 => {
            Some(Revision::parse(embedded)?.to_string())
        }
        _ => revision.map(Revision::to_string),
    };
    Some(format!("{path}{}", revision_text.unwrap_or_default()))
}

fn create_file_specs(
    session: &DepotSession,
    file_paths: &[String],
    revision: &Revision,
) -> Vec<String> {
    let mut valid: Vec<String> = file_paths.iter().filter(|p| !p.is_empty()).cloned().collect();
    if valid.is_empty() {
        // No scope means the whole client view.
        valid.push(format!("//{}/...", session_client_name(session)));
    }
    valid
        .iter()
        .filter_map(|path| create_file_spec(path, Some(revision), false))
        .collect()
}

fn session_client_name(session: &DepotSession) -> String {
    session.config().client.clone()
}

fn client_root(session: &DepotSession) -> PathBuf {
    let from_spec = session
        .connection()
        .and_then(|c| c.node(0))
        .map(|tag| ClientNode(tag).root().to_string())
        .unwrap_or_default();
    if from_spec.is_empty() {
        PathBuf::from(&session.config().directory)
    } else {
        PathBuf::from(from_spec)
    }
}

/// Flags for the placeholder identity rewrite.
#[derive(Debug, Clone, Copy, Default)]
pub struct ReconfigOptions {
    pub rewrite_port: bool,
    pub rewrite_client: bool,
    pub rewrite_user: bool,
    pub preview: bool,
}

/// Rewrites the recorded identity of existing placeholders to the current
/// connection, preserving revision and read-only state.
pub async fn reconfig(
    context: &AppContext,
    session: &mut DepotSession,
    files: &[String],
    options: ReconfigOptions,
) -> bool {
    let log = OperationLog::new();
    let specs = create_file_specs(session, files, &Revision::Have);
    if specs.is_empty() {
        log.error("No files specified to reconfig".to_string());
        return false;
    }

    let mut args: Vec<String> =
        vec!["-T".to_string(), "depotFile,clientFile,fileSize".to_string(), "-Ol".to_string()];
    args.extend(specs);
    let fstat = session.run(DepotCommand::new("fstat", args.iter().map(String::as_str))).await;
    if fstat.has_error() {
        log.error(format!("Failed to fstat paths to reconfig: {}", fstat.error_text()));
        return false;
    }

    let config = session.config().clone();
    let mut status = true;
    for tag in fstat.tags() {
        let node = FstatNode(tag);
        let client_file = PathBuf::from(node.client_file());
        let Some(meta) = context.store.metadata(&client_file).await.ok().flatten() else {
            continue;
        };
        if !meta.attrs.offline {
            continue;
        }
        let Ok(Some(info)) = placeholder::read_info(context.store.as_ref(), &client_file).await
        else {
            continue;
        };

        let port = if options.rewrite_port { &config.port } else { &info.depot_server };
        let client = if options.rewrite_client { &config.client } else { &info.depot_client };
        let user = if options.rewrite_user { &config.user } else { &info.depot_user };

        log.info(format!(
            "{}#{} - reconfig as {} [{port} {client} {user}]",
            node.depot_file(),
            info.file_revision,
            node.client_file(),
        ));
        if options.preview {
            continue;
        }

        let request = InstallRequest {
            residency_policy: ResidencyPolicy::Resident as u8,
            file_revision: info.file_revision,
            file_size: node.file_size(),
            attrs: FileAttrs::NORMAL.readonly(meta.attrs.readonly),
            depot_path: node.depot_file().to_string(),
            depot_server: port.clone(),
            depot_client: client.clone(),
            depot_user: user.clone(),
        };
        if placeholder::install(context.store.as_ref(), &context.settings, &client_file, &request)
            .await
            .is_err()
        {
            log.error(format!("Failed to reconfig file '{}'", node.client_file()));
            status = false;
        }
    }
    status
}

/// Forces content into already-synced offline files: every placeholder in
/// scope (matching the resident pattern when one is set) is resolved at
/// its have revision.
pub async fn hydrate(
    context: &AppContext,
    session: &mut DepotSession,
    options: &SyncOptions,
) -> SyncResult {
    let log = OperationLog::new();
    let specs = create_file_specs_override(session, &options.files, &Revision::Have);
    if specs.is_empty() {
        log.error("No files specified to hydrate".to_string());
        return SyncResult::status_only(SyncStatus::Error);
    }

    let mut args: Vec<String> =
        vec!["-T".to_string(), "depotFile,clientFile,haveRev".to_string()];
    args.extend(specs);
    let fstat = session.run(DepotCommand::new("fstat", args.iter().map(String::as_str))).await;
    if fstat.has_error() {
        log.error(format!("Failed to fstat paths to hydrate: {}", fstat.error_text()));
        return SyncResult::status_only(SyncStatus::Error);
    }

    let resident_re = (!options.resident_pattern.is_empty())
        .then(|| {
            RegexBuilder::new(&options.resident_pattern).case_insensitive(true).build().ok()
        })
        .flatten();

    let mut modifications = Vec::new();
    for tag in fstat.tags() {
        let node = FstatNode(tag);
        let client_file = PathBuf::from(node.client_file());
        let Some(meta) = context.store.metadata(&client_file).await.ok().flatten() else {
            continue;
        };
        if !meta.attrs.offline {
            continue;
        }
        if let Some(re) = &resident_re {
            if !re.is_match(node.depot_file()) {
                continue;
            }
        }

        let mut modification = SyncActionInfo {
            depot_file: node.depot_file().to_string(),
            client_file: node.client_file().to_string(),
            revision: Some(Revision::Number(node.have_rev())),
            sync_flags: options.sync_flags,
            is_always_resident: resident_re.is_some(),
            ..Default::default()
        };

        log.info(format!(
            "{}#{} - request hydrate as {}",
            node.depot_file(),
            node.have_rev(),
            node.client_file()
        ));
        if !options.sync_flags.contains(SyncFlags::PREVIEW) {
            let user = crate::context::UserContext::default();
            if let Err(e) = resolver::resolve_file_residency(context, &user, &client_file).await {
                log.error(format!(
                    "Failed to hydrate file '{}' with error [{e}]",
                    node.client_file()
                ));
            } else {
                modification.disk_file_size = node.file_size();
            }
        }
        modifications.push(modification);
    }

    SyncResult { status: SyncStatus::from_log(&log), modifications: Some(modifications) }
}

fn create_file_specs_override(
    session: &DepotSession,
    file_paths: &[String],
    revision: &Revision,
) -> Vec<String> {
    let mut valid: Vec<String> = file_paths.iter().filter(|p| !p.is_empty()).cloned().collect();
    if valid.is_empty() {
        valid.push(format!("//{}/...", session_client_name(session)));
    }
    valid
        .iter()
        .filter_map(|path| create_file_spec(path, Some(revision), true))
        .collect()
}

/// True when the depot path matches the always-resident pattern.
pub fn is_file_type_always_resident(pattern: &str, depot_file: &str) -> bool {
    if pattern.is_empty() || depot_file.is_empty() {
        return false;
    }
    RegexBuilder::new(pattern)
        .case_insensitive(true)
        .build()
        .map(|re| re.is_match(depot_file))
        .unwrap_or(false)
}

fn log_warning_error_summary(log: &OperationLog) {
    let lines = log.warning_error_lines();
    if lines.is_empty() {
        return;
    }
    tracing::info!("Summary of warnings and errors:");
    for line in lines {
        match line.channel {
            LogChannel::Error => tracing::error!("{}", line.text),
            _ => tracing::warn!("{}", line.text),
        }
    }
}

fn to_display_string(paths: &[String]) -> String {
    if paths.is_empty() {
        "[]".to_string()
    } else {
        format!("[\"{}\"]", paths.join("\",\""))
    }
}

/// `1768 bytes (1.7 KB)` style rendering.
pub fn display_bytes(size_bytes: u64) -> String {
    const UNITS: [(&str, u64); 4] =
        [("TB", 1 << 40), ("GB", 1 << 30), ("MB", 1 << 20), ("KB", 1 << 10)];
    let mut text = format!("{size_bytes} bytes");
    for (prefix, factor) in UNITS {
        if size_bytes >= factor {
            text.push_str(&format!(" ({:.1} {prefix})", size_bytes as f64 / factor as f64));
            break;
        }
    }
    text
}

/// `95 sec (1:35.000)` style rendering.
pub fn display_milliseconds(total_milliseconds: i64) -> String {
    let mut ms = total_milliseconds.unsigned_abs();
    let hours = ms / (60 * 60 * 1000);
    ms -= hours * 60 * 60 * 1000;
    let minutes = ms / (60 * 1000);
    ms -= minutes * 60 * 1000;
    let seconds = ms / 1000;
    ms -= seconds * 1000;

    let mut span = String::new();
    if hours > 0 {
        span.push_str(&format!("{hours}:"));
    }
    if minutes > 0 || !span.is_empty() {
        let width = if span.is_empty() { 1 } else { 2 };
        span.push_str(&format!("{minutes:0width$}:"));
    }
    if seconds > 0 || ms > 0 || !span.is_empty() {
        let width = if span.is_empty() { 1 } else { 2 };
        span.push_str(&format!("{seconds:0width$}.{ms:03}"));
    }

    let mut text = format!("{} sec", total_milliseconds / 1000);
    if !span.is_empty() {
        text.push_str(&format!(" ({span})"));
    }
    text
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_create_file_spec() {
        let rev = Revision::Changelist(4569);
        assert_eq!(
            create_file_spec("//depot/src/...", Some(&rev), false),
            Some("//depot/src/...@4569".to_string())
        );
        // An embedded revision wins unless overridden.
        assert_eq!(
            create_file_spec("//depot/a.cpp#3", Some(&rev), false),
            Some("//depot/a.cpp#3".to_string())
        );
        assert_eq!(
            create_file_spec("//depot/a.cpp#3", Some(&rev), true),
            Some("//depot/a.cpp@4569".to_string())
        );
        assert_eq!(
            create_file_spec("  \"//depot/a.cpp\"  ", None, false),
            Some("//depot/a.cpp".to_string())
        );
        // Unparseable embedded revisions invalidate the spec.
        assert_eq!(create_file_spec("//depot/a.cpp#bogus", Some(&rev), false), None);
    }

    #[test]
    fn test_always_resident_pattern() {
        assert!(is_file_type_always_resident(r"\.exe$", "//depot/bin/tool.EXE"));
        assert!(!is_file_type_always_resident(r"\.exe$", "//depot/src/a.cpp"));
        assert!(!is_file_type_always_resident("", "//depot/bin/tool.exe"));
    }

    #[test]
    fn test_display_bytes() {
        assert_eq!(display_bytes(512), "512 bytes");
        assert_eq!(display_bytes(1768), "1768 bytes (1.7 KB)");
        assert!(display_bytes(3 << 20).contains("(3.0 MB)"));
    }

    #[test]
    fn test_display_milliseconds() {
        assert_eq!(display_milliseconds(0), "0 sec");
        assert_eq!(display_milliseconds(1500), "1 sec (1.500)");
        assert_eq!(display_milliseconds(95_000), "95 sec (1:35.000)");
    }
}
