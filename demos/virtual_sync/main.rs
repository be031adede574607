//! Runs a virtual sync against a real Perforce server through the
//! installed `p4` client.
//!
//! ```text
//! cargo run --example virtual_sync -- -p perforce:1666 -c my-ws //depot/src/...
//! ```

use std::sync::Arc;

use clap::Parser;

use vdepot::context::AppContext;
use vdepot::depot::config::DepotConfig;
use vdepot::depot::pool::SessionPool;
use vdepot::depot::session::{DepotSession, TransportFactory};
use vdepot::depot::sync_action::FlushMode;
use vdepot::depot::transport::CliTransport;
use vdepot::fs::local::LocalStore;
use vdepot::settings::Settings;
use vdepot::vsync::{self, SyncOptions};

#[derive(Parser, Debug)]
#[command(about = "Install placeholders for a fileset instead of syncing content")]
struct Args {
    /// Perforce server, name:port.
    #[arg(short = 'p', long)]
    port: Option<String>,

    /// Client workspace name.
    #[arg(short = 'c', long)]
    client: Option<String>,

    /// Perforce user.
    #[arg(short = 'u', long)]
    user: Option<String>,

    /// Have-table flush mode: atomic or single.
    #[arg(long, default_value = "atomic")]
    flush: String,

    /// Regex of depot paths to sync fully resident.
    #[arg(long, default_value = "")]
    resident: String,

    /// File specs to sync; defaults to the whole client view.
    files: Vec<String>,
}

#[tokio::main]
async fn main() {
    let args = Args::parse();
    let settings = Settings::install();
    let _log_guard = vdepot::logging::init(&settings);

    let store = Arc::new(LocalStore::new());
    let factory: TransportFactory =
        Arc::new(|| Box::new(CliTransport::new()) as Box<dyn vdepot::depot::transport::Transport>);
    let pool = Arc::new(SessionPool::new(factory.clone(), settings.clone()));
    let context = AppContext::new(settings.clone(), store, pool);

    let mut config = DepotConfig::default();
    config.port = args.port.unwrap_or_default();
    config.client = args.client.unwrap_or_default();
    config.user = args.user.unwrap_or_default();

    let mut session = DepotSession::new(factory, settings.clone());
    match session.connect(&config).await {
        Ok(true) => {}
        _ => {
            tracing::error!("unable to connect to {}", config.to_connection_string());
            std::process::exit(1);
        }
    }

    let resident_pattern = if args.resident.is_empty() {
        settings.get_str(vdepot::settings::keys::SYNC_RESIDENT_PATTERN)
    } else {
        args.resident
    };
    let flush_mode = FlushMode::from_name(&args.flush)
        .or_else(|| FlushMode::from_name(&settings.get_str(vdepot::settings::keys::DEFAULT_FLUSH_TYPE)))
        .unwrap_or(FlushMode::Atomic);
    let options = SyncOptions {
        files: args.files,
        flush_mode,
        resident_pattern,
        ..Default::default()
    };
    let result = vsync::sync(&context, &mut session, &options).await;
    tracing::info!(status = ?result.status, "virtual sync finished");
    if result.status == vsync::SyncStatus::Error {
        std::process::exit(1);
    }
}
