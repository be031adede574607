//! Shared fixtures: an in-memory depot served through the transport seam.
//!
//! `FakeDepot` models a tiny Perforce server (head revisions, a
//! have-table, clobber rules) and `FakeTransport` answers the commands
//! the core issues (`client`, `info`, `changes`, `sync`, `fstat`,
//! `diff2`, `sizes`, `print`, `login`, `trust`) the way the real client
//! renders them. Every command line is recorded for assertions.

#![allow(dead_code)]

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use vdepot::context::AppContext;
use vdepot::depot::command::{CommandHandler, DepotCommand};
use vdepot::depot::config::DepotConfig;
use vdepot::depot::pool::SessionPool;
use vdepot::depot::result::{DepotChannel, DepotTag};
use vdepot::depot::session::{DepotSession, TransportFactory};
use vdepot::depot::transport::{ConnectOptions, Transport};
use vdepot::depot::SessionError;
use vdepot::fs::local::LocalStore;
use vdepot::settings::Settings;

pub const CLIENT_NAME: &str = "dev-ws";
pub const USER_NAME: &str = "alice";
pub const PORT_NAME: &str = "perforce:1666";

/// One head-revision file in the fake depot.
#[derive(Debug, Clone)]
pub struct FakeFile {
    pub depot_path: String,
    pub rev: i32,
    pub content: Vec<u8>,
    pub file_type: String,
    pub deleted: bool,
}

/// The server side of the fixture.
pub struct FakeDepot {
    pub client_root: PathBuf,
    files: Mutex<Vec<FakeFile>>,
    have: Mutex<HashMap<String, i32>>,
    head_change: AtomicI32,
    commands: Mutex<Vec<String>>,
    print_delay_ms: AtomicU64,
    refuse_connect: AtomicBool,
}

impl FakeDepot {
    pub fn new(client_root: &Path) -> Arc<FakeDepot> {
        Arc::new(FakeDepot {
            client_root: client_root.to_path_buf(),
            files: Mutex::new(Vec::new()),
            have: Mutex::new(HashMap::new()),
            head_change: AtomicI32::new(100),
            commands: Mutex::new(Vec::new()),
            print_delay_ms: AtomicU64::new(0),
            refuse_connect: AtomicBool::new(false),
        })
    }

    pub fn add_file(&self, depot_path: &str, rev: i32, content: &[u8], file_type: &str) {
        self.files.lock().unwrap().push(FakeFile {
            depot_path: depot_path.to_string(),
            rev,
            content: content.to_vec(),
            file_type: file_type.to_string(),
            deleted: false,
        });
    }

    pub fn delete_file(&self, depot_path: &str) {
        let mut files = self.files.lock().unwrap();
        if let Some(file) = files.iter_mut().find(|f| f.depot_path == depot_path) {
            file.deleted = true;
            file.rev += 1;
        }
    }

    pub fn set_print_delay(&self, delay: Duration) {
        self.print_delay_ms.store(delay.as_millis() as u64, Ordering::SeqCst);
    }

    pub fn set_refuse_connect(&self, refuse: bool) {
        self.refuse_connect.store(refuse, Ordering::SeqCst);
    }

    pub fn have_rev(&self, depot_path: &str) -> i32 {
        *self.have.lock().unwrap().get(&depot_path.to_lowercase()).unwrap_or(&0)
    }

    pub fn set_have_rev(&self, depot_path: &str, rev: i32) {
        self.have.lock().unwrap().insert(depot_path.to_lowercase(), rev);
    }

    /// Every command line the transport ran, oldest first.
    pub fn commands(&self) -> Vec<String> {
        self.commands.lock().unwrap().clone()
    }

    pub fn commands_matching(&self, needle: &str) -> Vec<String> {
        self.commands().into_iter().filter(|c| c.contains(needle)).collect()
    }

    pub fn client_path(&self, depot_path: &str) -> PathBuf {
        let rel = depot_path
            .trim_start_matches('/')
            .split_once('/')
            .map(|(_, rest)| rest)
            .unwrap_or("");
        self.client_root.join(rel)
    }

    fn record(&self, command: &DepotCommand) {
        self.commands.lock().unwrap().push(format!("{} {}", command.name, command.args.join(" ")));
    }

    fn matching_files(&self, path_part: &str) -> Vec<FakeFile> {
        let files = self.files.lock().unwrap();
        if let Some(prefix) = path_part.strip_suffix("...") {
            let whole_client = prefix.trim_start_matches('/').starts_with(CLIENT_NAME);
            files
                .iter()
                .filter(|f| whole_client || f.depot_path.starts_with(prefix))
                .cloned()
                .collect()
        } else {
            files.iter().filter(|f| f.depot_path == path_part).cloned().collect()
        }
    }
}

fn split_spec(spec: &str) -> (&str, Option<&str>) {
    match spec.find(['#', '@']) {
        Some(at) => (&spec[..at], Some(&spec[at..])),
        None => (spec, None),
    }
}

fn target_rev(file: &FakeFile, rev_part: Option<&str>) -> i32 {
    match rev_part {
        Some("#none") | Some("#0") => 0,
        Some("#have") => -1,
        Some(rev) if rev.starts_with('#') => rev[1..].parse().unwrap_or(file.rev),
        // Changelists and dates pin the head state of this fixture.
        Some(_) => file.rev,
        None => file.rev,
    }
}

/// The client side of the fixture.
pub struct FakeTransport {
    depot: Arc<FakeDepot>,
    connected: bool,
}

impl FakeTransport {
    pub fn factory(depot: Arc<FakeDepot>) -> TransportFactory {
        Arc::new(move || {
            Box::new(FakeTransport { depot: depot.clone(), connected: false }) as Box<dyn Transport>
        })
    }

    async fn run_sync(
        &self,
        command: &DepotCommand,
        handler: &mut dyn CommandHandler,
    ) -> std::io::Result<()> {
        let force = command.args.iter().any(|a| a == "-f");
        let flush = command.args.iter().any(|a| a == "-k");
        let preview = command.args.iter().any(|a| a == "-n");
        let tagged = !command.flags.untagged;

        for spec in command.args.iter().filter(|a| !a.starts_with('-')) {
            let (path_part, rev_part) = split_spec(spec);
            for file in self.depot.matching_files(path_part) {
                let have = self.depot.have_rev(&file.depot_path);
                let mut target = target_rev(&file, rev_part);
                if target == -1 {
                    target = have;
                }
                if file.deleted && rev_part.map(|r| !r.starts_with("#none")).unwrap_or(true) {
                    target = 0;
                }

                let client_file = self.depot.client_path(&file.depot_path);
                let client_text = client_file.to_string_lossy().into_owned();

                let action = if target == 0 {
                    if have == 0 {
                        continue;
                    }
                    "deleted"
                } else if have == 0 {
                    "added"
                } else if have == target {
                    continue;
                } else {
                    "updated"
                };

                // A real content sync refuses writable files unless forced.
                let transfers_content = !flush && !preview;
                if transfers_content && action != "deleted" && !force {
                    if let Ok(meta) = std::fs::metadata(&client_file) {
                        if !meta.permissions().readonly() {
                            handler
                                .on_text(
                                    DepotChannel::StdErr,
                                    0,
                                    &format!("Can't clobber writable file {client_text}"),
                                )
                                .await;
                            continue;
                        }
                    }
                }

                if tagged {
                    let tag = DepotTag::from_fields([
                        ("action", action.to_string()),
                        ("depotFile", file.depot_path.clone()),
                        ("clientFile", client_text.clone()),
                        ("rev", if target == 0 { have } else { target }.to_string()),
                        ("fileSize", file.content.len().to_string()),
                    ]);
                    handler.on_tag(tag).await;
                } else {
                    let line = match action {
                        "deleted" => format!("{}#{have} - deleted as {client_text}", file.depot_path),
                        "added" => format!("{}#{target} - added as {client_text}", file.depot_path),
                        _ => format!("{}#{target} - updating {client_text}", file.depot_path),
                    };
                    handler.on_text(DepotChannel::StdOut, 0, &line).await;
                }

                if preview {
                    continue;
                }

                if transfers_content {
                    if action == "deleted" {
                        let _ = std::fs::remove_file(&client_file);
                    } else {
                        if let Some(parent) = client_file.parent() {
                            std::fs::create_dir_all(parent)?;
                        }
                        std::fs::write(&client_file, &file.content)?;
                        let mut perms = std::fs::metadata(&client_file)?.permissions();
                        perms.set_readonly(!file.file_type.contains("+w"));
                        std::fs::set_permissions(&client_file, perms)?;
                    }
                }
                self.depot.set_have_rev(&file.depot_path, target);
            }
        }
        Ok(())
    }

    async fn run_fstat(
        &self,
        command: &DepotCommand,
        handler: &mut dyn CommandHandler,
    ) {
        // No files are ever opened in this fixture.
        if command.args.iter().any(|a| a == "-Ro") {
            return;
        }
        let writable_filter = command
            .args
            .iter()
            .position(|a| a == "-F")
            .and_then(|i| command.args.get(i + 1))
            .map(|f| f.contains("*w*"))
            .unwrap_or(false);

        let mut skip_next = false;
        for spec in &command.args {
            if skip_next {
                skip_next = false;
                continue;
            }
            if spec == "-T" || spec == "-F" {
                skip_next = true;
                continue;
            }
            if spec.starts_with('-') {
                continue;
            }
            let (path_part, _) = split_spec(spec);
            for file in self.depot.matching_files(path_part) {
                if file.deleted {
                    continue;
                }
                if writable_filter && !file.file_type.contains("+w") {
                    continue;
                }
                let tag = DepotTag::from_fields([
                    ("depotFile", file.depot_path.clone()),
                    (
                        "clientFile",
                        self.depot.client_path(&file.depot_path).to_string_lossy().into_owned(),
                    ),
                    ("haveRev", self.depot.have_rev(&file.depot_path).to_string()),
                    ("headRev", file.rev.to_string()),
                    ("headType", file.file_type.clone()),
                    ("fileSize", file.content.len().to_string()),
                ]);
                handler.on_tag(tag).await;
            }
        }
    }

    async fn run_diff2(&self, command: &DepotCommand, handler: &mut dyn CommandHandler) {
        let specs: Vec<&String> = command.args.iter().filter(|a| !a.starts_with('-')).collect();
        if specs.len() != 2 {
            return;
        }
        let (path_part, _) = split_spec(specs[1]);
        for file in self.depot.matching_files(path_part) {
            let have = self.depot.have_rev(&file.depot_path);
            if have == 0 || have == file.rev {
                continue;
            }
            let tag = DepotTag::from_fields([
                ("depotFile", file.depot_path.clone()),
                ("depotFile2", file.depot_path.clone()),
                ("type", file.file_type.clone()),
                ("type2", file.file_type.clone()),
            ]);
            handler.on_tag(tag).await;
        }
    }

    async fn run_print(
        &self,
        command: &DepotCommand,
        handler: &mut dyn CommandHandler,
    ) -> std::io::Result<()> {
        let delay = self.depot.print_delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }

        let output = command
            .args
            .iter()
            .position(|a| a == "-o")
            .and_then(|i| command.args.get(i + 1))
            .cloned();
        let spec = command
            .args
            .iter()
            .filter(|a| !a.starts_with('-'))
            .filter(|a| Some(a.as_str()) != output.as_deref())
            .next_back()
            .cloned()
            .unwrap_or_default();

        let (path_part, rev_part) = split_spec(&spec);
        let Some(file) = self.depot.matching_files(path_part).into_iter().next() else {
            handler
                .on_text(DepotChannel::StdErr, 0, &format!("{spec} - no such file(s)."))
                .await;
            return Ok(());
        };
        let rev = target_rev(&file, rev_part);
        if rev != file.rev {
            // One revision of history is enough for these tests.
        }

        match output {
            Some(output) => std::fs::write(output, &file.content)?,
            None => handler.on_binary(&file.content).await?,
        }
        Ok(())
    }
}

#[async_trait]
impl Transport for FakeTransport {
    async fn connect(
        &mut self,
        _config: &DepotConfig,
        _options: &ConnectOptions,
    ) -> Result<(), SessionError> {
        if self.depot.refuse_connect.load(Ordering::SeqCst) {
            return Err(SessionError::Transport("connection refused".to_string()));
        }
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
        if self.depot.refuse_connect.load(Ordering::SeqCst) {
            self.connected = false;
            return Err(SessionError::Transport("connection dropped".to_string()));
        }
        self.depot.record(command);

        match command.name.as_str() {
            "client" => {
                let tag = DepotTag::from_fields([
                    ("Client", CLIENT_NAME.to_string()),
                    ("Owner", USER_NAME.to_string()),
                    ("Root", self.depot.client_root.to_string_lossy().into_owned()),
                    ("Options", "noallwrite noclobber nocompress".to_string()),
                    ("LineEnd", "unix".to_string()),
                    ("Access", "2026/07/01 12:00:00".to_string()),
                ]);
                handler.on_tag(tag).await;
            }
            "info" => {
                let tag = DepotTag::from_fields([
                    ("serverAddress", PORT_NAME),
                    ("userName", USER_NAME),
                    ("clientName", CLIENT_NAME),
                    ("caseHandling", "insensitive"),
                ]);
                handler.on_tag(tag).await;
            }
            "changes" => {
                let change = self.depot.head_change.load(Ordering::SeqCst);
                handler.on_tag(DepotTag::from_fields([("change", change.to_string())])).await;
            }
            "login" | "trust" => {}
            "sync" => self.run_sync(command, handler).await.map_err(SessionError::Io)?,
            "fstat" => self.run_fstat(command, handler).await,
            "diff2" => self.run_diff2(command, handler).await,
            "sizes" => {
                for spec in command.args.iter().filter(|a| !a.starts_with('-')) {
                    let (path_part, _) = split_spec(spec);
                    for file in self.depot.matching_files(path_part) {
                        let tag = DepotTag::from_fields([
                            ("depotFile", file.depot_path.clone()),
                            ("fileSize", file.content.len().to_string()),
                        ]);
                        handler.on_tag(tag).await;
                    }
                }
            }
            "print" => self.run_print(command, handler).await.map_err(SessionError::Io)?,
            other => {
                handler
                    .on_text(DepotChannel::StdErr, 0, &format!("Unknown command '{other}'."))
                    .await;
            }
        }
        Ok(())
    }

    async fn disconnect(&mut self) {
        self.connected = false;
    }
}

/// A fully wired test world: settings, local store, pool, fake depot.
pub struct Fixture {
    pub depot: Arc<FakeDepot>,
    pub settings: Arc<Settings>,
    pub store: LocalStore,
    pub context: AppContext,
}

impl Fixture {
    pub fn new(client_root: &Path) -> Fixture {
        let depot = FakeDepot::new(client_root);
        let settings = Arc::new(Settings::new());
        let store = LocalStore::new();
        let factory = FakeTransport::factory(depot.clone());
        let pool = Arc::new(SessionPool::new(factory, settings.clone()));
        let context =
            AppContext::new(settings.clone(), Arc::new(store.clone()), pool);
        Fixture { depot, settings, store, context }
    }

    pub fn config(&self) -> DepotConfig {
        let mut config = DepotConfig::new(PORT_NAME, USER_NAME, CLIENT_NAME);
        config.directory = self.depot.client_root.to_string_lossy().into_owned();
        config
    }

    pub async fn connect_session(&self) -> DepotSession {
        let factory = FakeTransport::factory(self.depot.clone());
        let mut session = DepotSession::new(factory, self.settings.clone());
        assert!(session.connect(&self.config()).await.unwrap());
        session
    }
}
