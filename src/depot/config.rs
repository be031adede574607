//! Depot connection configuration and its discovery.
//!
//! A [`DepotConfig`] is a partially-filled set of Perforce identity fields.
//! Missing fields are populated, in order, from a config file discovered by
//! walking upward from the working directory, from `P4*` environment
//! variables, and finally from the local host name.

use std::collections::HashMap;
use std::fs::OpenOptions;
use std::path::{Path, PathBuf};

use regex::RegexBuilder;

use crate::settings::Settings;
use crate::text;

/// Environment variable names understood by the discovery ladder.
pub mod env_names {
    pub const P4CLIENT: &str = "P4CLIENT";
    pub const P4CONFIG: &str = "P4CONFIG";
    pub const P4HOST: &str = "P4HOST";
    pub const P4PASSWD: &str = "P4PASSWD";
    pub const P4PORT: &str = "P4PORT";
    pub const P4TICKETS: &str = "P4TICKETS";
    pub const P4TRUST: &str = "P4TRUST";
    pub const P4USER: &str = "P4USER";
    pub const COMPUTERNAME: &str = "COMPUTERNAME";
    pub const HOSTNAME: &str = "HOSTNAME";
}

/// Perforce connection identity. Empty fields mean "not yet resolved".
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DepotConfig {
    pub host: String,
    pub port: String,
    pub client: String,
    pub user: String,
    pub passwd: String,
    pub ignore: String,
    pub directory: String,
}

impl DepotConfig {
    pub fn new(port: &str, user: &str, client: &str) -> Self {
        Self {
            port: port.to_string(),
            user: user.to_string(),
            client: client.to_string(),
            ..Default::default()
        }
    }

    /// Fills every empty field of `self` from `other`.
    pub fn apply(&mut self, other: &DepotConfig) {
        set_non_empty(&mut self.host, &other.host);
        set_non_empty(&mut self.port, &other.port);
        set_non_empty(&mut self.client, &other.client);
        set_non_empty(&mut self.user, &other.user);
        set_non_empty(&mut self.passwd, &other.passwd);
        set_non_empty(&mut self.ignore, &other.ignore);
        set_non_empty(&mut self.directory, &other.directory);
    }

    /// Port tokens with any leading transport prefix (`ssl:`, `tcp:`, ...)
    /// stripped, so `ssl:host:1666` splits the same way as `host:1666`.
    fn port_tokens(&self) -> impl Iterator<Item = &str> {
        const TRANSPORT_PREFIXES: [&str; 10] = [
            "tcp", "tcp4", "tcp6", "tcp46", "tcp64", "ssl", "ssl4", "ssl6", "ssl46", "ssl64",
        ];
        let mut tokens = self.port.split(':').filter(|t| !t.is_empty()).peekable();
        if tokens
            .peek()
            .is_some_and(|t| TRANSPORT_PREFIXES.iter().any(|p| t.eq_ignore_ascii_case(p)))
        {
            tokens.next();
        }
        tokens
    }

    /// The name half of `"name:number"`, or the whole port if unnumbered.
    /// An optional transport prefix is not part of the name.
    pub fn port_name(&self) -> &str {
        self.port_tokens().next().unwrap_or("")
    }

    /// The number half of `"name:number"`, when present.
    pub fn port_number(&self) -> Option<&str> {
        let mut tokens = self.port_tokens();
        tokens.next()?;
        tokens.next()
    }

    /// The case-folded `(port, user, client)` key used by the session pool.
    pub fn pool_key(&self) -> String {
        text::fold(&format!("{},{},{}", self.port, self.user, self.client))
    }

    /// `-p/-u/-c/-H/-P` style argument rendering for helper processes.
    pub fn to_command_string(&self) -> String {
        let mut out = String::new();
        let mut push = |flag: &str, value: &str| {
            if !value.is_empty() {
                if !out.is_empty() {
                    out.push(' ');
                }
                out.push_str(flag);
                out.push(' ');
                out.push_str(value);
            }
        };
        push("-H", &self.host);
        push("-p", &self.port);
        push("-c", &self.client);
        push("-u", &self.user);
        push("-P", &self.passwd);
        out
    }

    /// Short `port client user` rendering used in log lines.
    pub fn to_connection_string(&self) -> String {
        [&self.port, &self.client, &self.user]
            .iter()
            .filter(|s| !s.is_empty())
            .map(|s| s.as_str())
            .collect::<Vec<_>>()
            .join(" ")
    }

    /// Populates missing fields from the discovery ladder: config file found
    /// by walking upward from `directory`, then environment, then host name.
    pub fn resolve(&mut self) {
        if self.directory.is_empty() {
            if let Ok(cwd) = std::env::current_dir() {
                self.directory = cwd.to_string_lossy().into_owned();
            }
        }

        if let Some(found) = discover_config_file(Path::new(&self.directory)) {
            self.apply(&found);
        }

        let mut env = DepotConfig::default();
        set_non_empty_opt(&mut env.client, std::env::var(env_names::P4CLIENT).ok());
        set_non_empty_opt(&mut env.port, std::env::var(env_names::P4PORT).ok());
        set_non_empty_opt(&mut env.user, std::env::var(env_names::P4USER).ok());
        set_non_empty_opt(&mut env.passwd, std::env::var(env_names::P4PASSWD).ok());
        set_non_empty_opt(&mut env.host, std::env::var(env_names::P4HOST).ok());
        self.apply(&env);

        if self.host.is_empty() {
            self.host = host_name();
        }
    }
}

fn set_non_empty(dst: &mut String, src: &str) -> bool {
    if dst.is_empty() && !src.is_empty() {
        *dst = src.to_string();
        return true;
    }
    false
}

fn set_non_empty_opt(dst: &mut String, src: Option<String>) {
    if let Some(src) = src {
        set_non_empty(dst, &src);
    }
}

/// The local host name: `P4HOST` env, else the computer name.
pub fn host_name() -> String {
    for name in [env_names::P4HOST, env_names::COMPUTERNAME, env_names::HOSTNAME] {
        if let Ok(value) = std::env::var(name) {
            if !value.is_empty() {
                return value;
            }
        }
    }
    String::new()
}

/// Walks from `start` upward looking for the file named by `P4CONFIG`,
/// parsing `KEY=VALUE` lines of the nearest hit.
pub fn discover_config_file(start: &Path) -> Option<DepotConfig> {
    let file_name = std::env::var(env_names::P4CONFIG).ok().filter(|n| !n.is_empty())?;
    let mut dir = Some(start);
    while let Some(current) = dir {
        let candidate = current.join(&file_name);
        if candidate.is_file() {
            return Some(parse_config_file(&candidate));
        }
        dir = current.parent();
    }
    None
}

fn parse_config_file(path: &Path) -> DepotConfig {
    let mut values = HashMap::new();
    if let Ok(text) = std::fs::read_to_string(path) {
        for line in text.lines() {
            if let Some((key, value)) = line.split_once('=') {
                values.insert(key.trim().to_string(), value.trim().to_string());
            }
        }
    }
    let mut config = DepotConfig::default();
    let take = |key: &str| values.get(key).cloned().unwrap_or_default();
    config.port = take(env_names::P4PORT);
    config.user = take(env_names::P4USER);
    config.client = take(env_names::P4CLIENT);
    config.passwd = take(env_names::P4PASSWD);
    config.host = take(env_names::P4HOST);
    config
}

/// Resolves the tickets file path: first writable candidate wins, in the
/// order env `P4TICKETS`, the config file's `P4TICKETS`, then the user
/// profile locations.
pub fn tickets_file_path(config_value: Option<&str>) -> Option<PathBuf> {
    user_file_path(env_names::P4TICKETS, config_value, "p4tickets.txt")
}

/// Same ladder as [`tickets_file_path`] for `p4trust.txt`.
pub fn trust_file_path(config_value: Option<&str>) -> Option<PathBuf> {
    user_file_path(env_names::P4TRUST, config_value, "p4trust.txt")
}

fn user_file_path(env_name: &str, config_value: Option<&str>, file_name: &str) -> Option<PathBuf> {
    let mut candidates: Vec<PathBuf> = Vec::new();
    if let Ok(value) = std::env::var(env_name) {
        if !value.is_empty() {
            candidates.push(PathBuf::from(value));
        }
    }
    if let Some(value) = config_value {
        if !value.is_empty() {
            candidates.push(PathBuf::from(value));
        }
    }
    if let Some(profile) = profile_dir() {
        candidates.push(profile.join(file_name));
    }
    if let Ok(user) = std::env::var("USERNAME").or_else(|_| std::env::var("USER")) {
        if cfg!(windows) {
            candidates.push(PathBuf::from(format!(r"C:\Users\{user}")).join(file_name));
        }
    }
    candidates.into_iter().find(|p| is_writable_file(p))
}

fn profile_dir() -> Option<PathBuf> {
    std::env::var("USERPROFILE").or_else(|_| std::env::var("HOME")).ok().map(PathBuf::from)
}

/// True when the file exists writable or can be created in place.
fn is_writable_file(path: &Path) -> bool {
    OpenOptions::new().append(true).create(true).open(path).is_ok()
}

/// Applies the configured server rewrite patterns to a depot server name.
/// The first case-insensitive match wins; unmatched names return unchanged.
pub fn resolve_depot_server_name(settings: &Settings, source: &str) -> String {
    for entry in settings.server_rewrites() {
        let matched = RegexBuilder::new(&entry.pattern)
            .case_insensitive(true)
            .build()
            .map(|re| re.is_match(source))
            .unwrap_or(false);
        if matched {
            return entry.address.clone();
        }
    }
    source.to_string()
}
