//! Runs the hydration service against the in-process loopback driver.
//!
//! Scans a workspace for placeholder files, then simulates a first open
//! of each one and reports the hydration result. Placeholders must have
//! been installed with the `virtual_sync` demo (their recorded identity
//! is used to reach the depot through the installed `p4` client).
//!
//! ```text
//! cargo run --example hydrate_service -- --root /path/to/workspace
//! ```

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;

use vdepot::context::AppContext;
use vdepot::depot::pool::SessionPool;
use vdepot::depot::session::TransportFactory;
use vdepot::depot::transport::CliTransport;
use vdepot::driver::loopback::LoopbackDriver;
use vdepot::driver::protocol::ntstatus;
use vdepot::driver::DriverChannel;
use vdepot::fs::local::LocalStore;
use vdepot::fs::FileStore;
use vdepot::placeholder;
use vdepot::service::ServiceHost;
use vdepot::settings::Settings;

#[derive(Parser, Debug)]
#[command(about = "Hydrate every placeholder under a workspace root")]
struct Args {
    /// Workspace root to scan.
    #[arg(long)]
    root: PathBuf,

    /// Walker threads for the placeholder scan.
    #[arg(long, default_value_t = 4)]
    threads: usize,
}

#[tokio::main]
async fn main() {
    let args = Args::parse();
    let settings = Settings::install();
    let _log_guard = vdepot::logging::init(&settings);

    let store = LocalStore::new();
    let factory: TransportFactory =
        Arc::new(|| Box::new(CliTransport::new()) as Box<dyn vdepot::depot::transport::Transport>);
    let pool = Arc::new(SessionPool::new(factory, settings.clone()));
    let context =
        AppContext::new(settings.clone(), Arc::new(store.clone()) as Arc<dyn FileStore>, pool);

    let driver = LoopbackDriver::new(store.clone(), &args.root);
    let channel: Arc<dyn DriverChannel> = driver.clone();
    let host = Arc::new(ServiceHost::new(context.clone(), channel));
    let runner = host.clone();
    let service = tokio::spawn(async move { runner.run().await });

    let placeholders = placeholder::find_placeholders(
        Arc::new(store.clone()) as Arc<dyn FileStore>,
        &args.root,
        args.threads,
    )
    .await
    .unwrap_or_default();
    tracing::info!("found {} placeholder(s)", placeholders.len());

    let mut failures = 0usize;
    for path in placeholders {
        match driver.simulate_open(&path, std::process::id(), 0).await {
            Some(request_id) => {
                let reply = driver.wait_reply(request_id).await;
                if reply.request_result == ntstatus::SUCCESS {
                    tracing::info!("hydrated {}", path.display());
                } else {
                    tracing::error!(
                        "failed to hydrate {} [{:#x}]",
                        path.display(),
                        reply.request_result
                    );
                    failures += 1;
                }
            }
            None => tracing::info!("already resident {}", path.display()),
        }
    }

    host.cancel_token().cancel();
    driver.disconnect().await;
    let _ = service.await;
    if failures > 0 {
        std::process::exit(1);
    }
}
