//! A depot session: one live server connection under one identity.
//!
//! A session owns a [`Transport`] and layers connection resolution, the
//! trust handshake, the login ladder and the run surface on top of it.
//! Run failures are reported inside the returned result and never as
//! errors; transport faults mark the session faulted so the pool can
//! discard it.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use regex::Regex;

use super::command::{DepotCommand, PromptCallback};
use super::config::{self, DepotConfig};
use super::result::{ClientNode, DepotResult, InfoNode, ResultCollector};
use super::transport::{ConnectOptions, Transport};
use super::SessionError;
use crate::depot::command::CommandHandler;
use crate::settings::{keys, Settings};

/// Factory producing fresh transports; used for new sessions and for the
/// client-owner login probes.
pub type TransportFactory = Arc<dyn Fn() -> Box<dyn Transport> + Send + Sync>;

/// Session behavior flags.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SessionFlags {
    /// Skip the login ladder entirely.
    pub disable_login: bool,
    /// Never attempt the interactive login step.
    pub unattended: bool,
}

/// A connected (or connecting) depot session.
pub struct DepotSession {
    transport: Box<dyn Transport>,
    factory: TransportFactory,
    settings: Arc<Settings>,
    config: DepotConfig,
    flags: SessionFlags,
    connection: Option<DepotResult>,
    faulted: bool,
    authenticated: bool,
    last_access: Instant,
    context: Option<String>,
}

impl DepotSession {
    pub fn new(factory: TransportFactory, settings: Arc<Settings>) -> Self {
        let transport = factory();
        Self {
            transport,
            factory,
            settings,
            config: DepotConfig::default(),
            flags: SessionFlags::default(),
            connection: None,
            faulted: false,
            authenticated: false,
            last_access: Instant::now(),
            context: None,
        }
    }

    pub fn with_flags(mut self, flags: SessionFlags) -> Self {
        self.flags = flags;
        self
    }

    /// The program name/version string reported to the server.
    pub fn program_name() -> String {
        format!("vdepot/{}", env!("CARGO_PKG_VERSION"))
    }

    /// Connects using `config`, populating missing fields from the config
    /// file walk, the environment and the host name, then runs the trust
    /// and login ladders. Returns `Ok(true)` when connected; a connected
    /// but unauthenticated session also returns `Ok(true)` with
    /// [`DepotSession::is_authenticated`] false.
    pub async fn connect(&mut self, config: &DepotConfig) -> Result<bool, SessionError> {
        self.reset().await;
        self.config.apply(config);
        self.config.resolve();
        if self.config.port.is_empty() {
            return Err(SessionError::Configuration(
                "no server port resolved from configuration, file or environment".to_string(),
            ));
        }

        let options = ConnectOptions {
            program: Self::program_name(),
            tickets_file: config::tickets_file_path(None),
            trust_file: config::trust_file_path(None),
        };
        self.transport.connect(&self.config, &options).await?;

        if !self.flags.disable_login && self.login_required().await {
            self.authenticated = self.login().await;
        } else {
            self.authenticated = true;
        }

        if self.connection.is_none() {
            let client = self.client().await;
            self.apply_client_spec(&client);
            self.connection = Some(client);
        }

        let info = self.info().await;
        if let Some(tag) = info.node(0) {
            let node = InfoNode(tag);
            if !node.case_handling().is_empty() {
                // Read but not consumed; path comparisons stay
                // case-insensitive regardless of the server's report.
                tracing::debug!(case = node.case_handling(), "server case handling");
            }
        }

        Ok(self.is_connected())
    }

    fn apply_client_spec(&mut self, client: &DepotResult) {
        if let Some(tag) = client.node(0) {
            let node = ClientNode(tag);
            let mut from_spec = DepotConfig::default();
            from_spec.client = tag.get("Client").to_string();
            from_spec.user = tag.get("Owner").to_string();
            from_spec.directory = node.root().to_string();
            self.config.apply(&from_spec);
        }
    }

    /// True when the transport believes the connection is healthy.
    pub fn is_connected(&self) -> bool {
        self.transport.is_connected()
    }

    /// True when the login ladder resolved the access-granted state.
    pub fn is_authenticated(&self) -> bool {
        self.authenticated
    }

    /// True once a transport fault was observed; faulted sessions are
    /// discarded rather than pooled.
    pub fn is_faulted(&self) -> bool {
        self.faulted
    }

    pub fn config(&self) -> &DepotConfig {
        &self.config
    }

    /// Age since the last command ran, for idle eviction.
    pub fn idle_time(&self) -> Duration {
        self.last_access.elapsed()
    }

    /// Assigns or clears the caller context label carried in log lines.
    pub fn set_context(&mut self, context: Option<String>) {
        self.context = context;
    }

    /// Returns the session to a clean disconnected state.
    pub async fn reset(&mut self) {
        self.transport.disconnect().await;
        self.transport = (self.factory)();
        self.connection = None;
        self.faulted = false;
        self.authenticated = false;
        self.last_access = Instant::now();
    }

    /// Runs one command, collecting its output. Command failures are in
    /// the result; transport faults also mark the session faulted.
    pub async fn run(&mut self, command: DepotCommand) -> DepotResult {
        let prompt = command.prompt.clone();
        let mut collector = ResultCollector::new(prompt);
        if let Err(error) = self.run_with_handler(&command, &mut collector).await {
            collector.result.set_error(format!("depot session: {error}"));
        }
        collector.result
    }

    /// Runs one command against a caller-supplied handler, for streaming
    /// consumers.
    pub async fn run_with_handler(
        &mut self,
        command: &DepotCommand,
        handler: &mut dyn CommandHandler,
    ) -> Result<(), SessionError> {
        self.last_access = Instant::now();
        let outcome = self.transport.run(command, handler).await;
        self.last_access = Instant::now();
        if outcome.is_err() {
            self.faulted = true;
        }
        outcome
    }

    pub async fn run_simple(&mut self, name: &str, args: &[&str]) -> DepotResult {
        self.run(DepotCommand::new(name, args.iter().copied())).await
    }

    /// The cached `client -o` spec from connect time.
    pub fn connection(&self) -> Option<&DepotResult> {
        self.connection.as_ref()
    }

    pub async fn client(&mut self) -> DepotResult {
        let result = self.run_simple("client", &["-o"]).await;
        if result.has_error_regex("use the 'p4 trust' command") {
            // First contact with an ssl server; trust it and retry.
            self.trust().await;
            return self.run_simple("client", &["-o"]).await;
        }
        result
    }

    pub async fn info(&mut self) -> DepotResult {
        self.run_simple("info", &[]).await
    }

    pub async fn trust(&mut self) -> DepotResult {
        self.run_simple("trust", &["-y", "-f"]).await
    }

    /// The client spec's `LineEnd` value, for the output encoder chain.
    pub fn line_end(&self) -> String {
        self.connection
            .as_ref()
            .and_then(|c| c.node(0))
            .map(|tag| ClientNode(tag).line_end().to_string())
            .unwrap_or_default()
    }

    /// True when a ticket or password is still needed.
    async fn login_required(&mut self) -> bool {
        if !self.is_connected() {
            return false;
        }

        let client = self.client().await;
        self.apply_client_spec(&client);
        let access_granted =
            client.node(0).map(|tag| !ClientNode(tag).access().is_empty()).unwrap_or(false);
        self.connection = Some(client);
        if access_granted {
            return false;
        }

        self.run_simple("login", &["-s"]).await.has_error()
    }

    /// The login ladder: configured password, then client-owner probe, then
    /// interactive helper. Failing all three leaves the session connected
    /// but unauthenticated.
    async fn login(&mut self) -> bool {
        if self.login_using_config().await {
            return true;
        }
        if self.login_using_client_owner().await {
            return true;
        }
        if self.login_using_interactive_session().await {
            return true;
        }
        tracing::warn!(
            connection = self.config.to_connection_string(),
            "login failed; session is connected but unauthenticated"
        );
        false
    }

    async fn login_with_prompt(&mut self, prompt: PromptCallback) -> bool {
        let command = DepotCommand::new("login", Vec::<String>::new()).with_prompt(prompt);
        if self.run(command).await.has_error() {
            return false;
        }
        !self.login_required().await
    }

    async fn login_using_config(&mut self) -> bool {
        if self.config.passwd.is_empty() {
            if let Ok(passwd) = std::env::var(config::env_names::P4PASSWD) {
                self.config.passwd = passwd;
            }
        }
        let passwd = self.config.passwd.clone();
        let prompt: PromptCallback = Arc::new(move |message: &str| {
            message.to_lowercase().contains("password").then(|| passwd.clone())
        });
        self.login_with_prompt(prompt).await
    }

    /// Scans the tickets file for candidate users and probes each for the
    /// client spec's owner; a different owner triggers a reconnect as that
    /// user without a password.
    async fn login_using_client_owner(&mut self) -> bool {
        if !self.is_connected() || self.config.client.is_empty() {
            return false;
        }

        let owner = self.client_owner_user_name().await;
        let owner = match owner {
            Some(owner) if !owner.is_empty() && !owner.eq_ignore_ascii_case(&self.config.user) => {
                owner
            }
            _ => return false,
        };

        tracing::info!(owner, client = self.config.client, "reconnecting as client owner");
        let mut config = self.config.clone();
        config.user = owner;
        config.passwd.clear();
        self.config = DepotConfig::default();

        let options = ConnectOptions {
            program: Self::program_name(),
            tickets_file: config::tickets_file_path(None),
            trust_file: config::trust_file_path(None),
        };
        self.config.apply(&config);
        if self.transport.connect(&self.config, &options).await.is_err() {
            return false;
        }
        !self.login_required().await
    }

    /// Finds the owner of the configured client by probing each user that
    /// holds a ticket for this server.
    async fn client_owner_user_name(&mut self) -> Option<String> {
        let tickets_path = config::tickets_file_path(None)?;
        let lines = std::fs::read_to_string(&tickets_path).ok()?;
        let user_re = Regex::new(r"=\s*(.+?)\s*:").expect("static ticket pattern");

        let mut users: Vec<String> = Vec::new();
        for line in lines.lines() {
            if let Some(m) = user_re.captures(line) {
                let user = m[1].to_string();
                if !users.iter().any(|u| u.eq_ignore_ascii_case(&user)) {
                    users.push(user);
                }
            }
        }

        for user in users {
            let mut probe = DepotSession::new(self.factory.clone(), self.settings.clone())
                .with_flags(SessionFlags { disable_login: true, unattended: true });
            let config = DepotConfig {
                port: self.config.port.clone(),
                client: self.config.client.clone(),
                user,
                ..Default::default()
            };
            if Box::pin(probe.connect(&config)).await.unwrap_or(false) {
                let client = probe.client().await;
                if let Some(tag) = client.node(0) {
                    let node = ClientNode(tag);
                    let owner = node.owner();
                    if !owner.is_empty() {
                        return Some(owner.to_string());
                    }
                }
            }
        }
        None
    }

    /// Last resort: spawn the configured helper process to prompt the
    /// originating user, then log in with the password it reports.
    async fn login_using_interactive_session(&mut self) -> bool {
        if self.flags.unattended || self.settings.get_bool(keys::UNATTENDED) {
            return false;
        }

        let ticket = self.run_simple("login", &["-s"]).await;
        if !ticket.has_error() {
            return true;
        }
        if ticket.has_error_regex("user .+ doesn't exist") {
            return false;
        }

        let Some(passwd) = self.request_interactive_password().await else {
            return false;
        };
        let prompt: PromptCallback = Arc::new(move |message: &str| {
            message.to_lowercase().contains("password").then(|| passwd.clone())
        });
        self.login_with_prompt(prompt).await
    }

    async fn request_interactive_password(&self) -> Option<String> {
        let helper = self.settings.get_str(keys::INTERACTIVE_LOGIN_COMMAND);
        if helper.is_empty() {
            return None;
        }

        let mut parts = helper.split_whitespace();
        let program = PathBuf::from(parts.next()?);
        let mut command = tokio::process::Command::new(program);
        command.args(parts);
        command.args(self.config.to_command_string().split_whitespace());
        command.stdout(std::process::Stdio::piped());

        let output = command.output().await.ok()?;
        let text = String::from_utf8_lossy(&output.stdout).into_owned();
        let passwd_re = Regex::new(r"P4PASSWD=(.*)").expect("static password pattern");
        for line in text.lines() {
            if let Some(m) = passwd_re.captures(line) {
                return Some(m[1].trim().to_string());
            }
        }
        None
    }
}

impl std::fmt::Debug for DepotSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DepotSession")
            .field("config", &self.config.to_connection_string())
            .field("connected", &self.is_connected())
            .field("authenticated", &self.authenticated)
            .field("faulted", &self.faulted)
            .field("context", &self.context)
            .finish()
    }
}
