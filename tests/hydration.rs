//! End-to-end hydration through the loopback driver and the service.

mod support;

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use support::Fixture;
use vdepot::context::AppContext;
use vdepot::driver::loopback::LoopbackDriver;
use vdepot::driver::protocol::ntstatus;
use vdepot::driver::DriverChannel;
use vdepot::fs::{FileAttrs, FileStore};
use vdepot::placeholder::{self, InstallRequest, ResidencyPolicy};
use vdepot::service::ServiceHost;
use vdepot::settings::keys;
use vdepot::vsync::{self, SyncOptions};

const CONTENT: &[u8] = &[0x42u8; 1768];

struct World {
    fixture: Fixture,
    driver: Arc<LoopbackDriver>,
    host: Arc<ServiceHost>,
    _dir: tempfile::TempDir,
}

async fn start_world() -> World {
    let dir = tempfile::tempdir().unwrap();
    let fixture = Fixture::new(dir.path());
    let driver = LoopbackDriver::new(fixture.store.clone(), dir.path());
    let channel: Arc<dyn DriverChannel> = driver.clone();
    let host = Arc::new(ServiceHost::new(fixture.context.clone(), channel));
    let runner = host.clone();
    tokio::spawn(async move { runner.run().await });
    World { fixture, driver, host, _dir: dir }
}

async fn stop_world(world: &World) {
    world.host.cancel_token().cancel();
    world.driver.disconnect().await;
}

async fn install_placeholder(context: &AppContext, path: &Path, depot_path: &str, rev: u32) {
    let request = InstallRequest {
        residency_policy: ResidencyPolicy::Resident as u8,
        file_revision: rev,
        file_size: CONTENT.len() as i64,
        attrs: FileAttrs::NORMAL.readonly(true),
        depot_path: depot_path.to_string(),
        depot_server: support::PORT_NAME.to_string(),
        depot_client: support::CLIENT_NAME.to_string(),
        depot_user: support::USER_NAME.to_string(),
    };
    placeholder::install(context.store.as_ref(), &context.settings, path, &request)
        .await
        .unwrap();
}

#[tokio::test]
async fn test_hydrate_single_file() {
    let world = start_world().await;
    world.fixture.depot.add_file("//depot/src/a.cpp", 3, CONTENT, "text");

    // Virtual-sync the file in, then open it.
    let mut session = world.fixture.connect_session().await;
    let options = SyncOptions {
        files: vec!["//depot/src/...".to_string()],
        ..Default::default()
    };
    let result = vsync::sync(&world.fixture.context, &mut session, &options).await;
    assert_eq!(result.status, vsync::SyncStatus::Success);

    let local = world.fixture.depot.client_path("//depot/src/a.cpp");
    let meta = world.fixture.store.metadata(&local).await.unwrap().unwrap();
    assert!(meta.is_reparse);
    assert_eq!(meta.len, CONTENT.len() as u64);

    let request_id = world.driver.simulate_open(&local, 500, 501).await.unwrap();
    let reply = world.driver.wait_reply(request_id).await;
    assert_eq!(reply.request_result, ntstatus::SUCCESS);

    // Fully resident: markers stripped, exact depot bytes on disk.
    let meta = world.fixture.store.metadata(&local).await.unwrap().unwrap();
    assert!(!meta.is_reparse);
    assert!(!meta.is_sparse);
    assert!(!meta.attrs.offline);
    assert_eq!(meta.len, CONTENT.len() as u64);
    assert_eq!(tokio::fs::read(&local).await.unwrap(), CONTENT);

    // A second open is ordinary file access; the filter stays quiet.
    assert!(world.driver.simulate_open(&local, 500, 501).await.is_none());

    stop_world(&world).await;
}

#[tokio::test]
async fn test_alternate_stream_never_hydrates() {
    let world = start_world().await;
    world.fixture.depot.add_file("//depot/src/b.cpp", 1, CONTENT, "text");

    let local = world.fixture.depot.client_path("//depot/src/b.cpp");
    install_placeholder(&world.fixture.context, &local, "//depot/src/b.cpp", 1).await;

    let stream = format!("{}:Zone.Identifier", local.display());
    assert!(world.driver.simulate_open(Path::new(&stream), 500, 501).await.is_none());
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(world.host.last_request_time().is_none());

    // The real file still hydrates exactly once.
    let request_id = world.driver.simulate_open(&local, 500, 501).await.unwrap();
    let reply = world.driver.wait_reply(request_id).await;
    assert_eq!(reply.request_result, ntstatus::SUCCESS);
    assert!(world.host.last_request_time().is_some());

    stop_world(&world).await;
}

#[tokio::test]
async fn test_excluded_process_is_denied() {
    let world = start_world().await;
    world.fixture.depot.add_file("//depot/src/c.cpp", 1, CONTENT, "text");
    world
        .fixture
        .settings
        .set_from_text(keys::EXCLUDED_PROCESS_NAMES, "buildtool.exe;indexer.exe");
    world.driver.set_process_name(77, "indexer.exe");

    let local = world.fixture.depot.client_path("//depot/src/c.cpp");
    install_placeholder(&world.fixture.context, &local, "//depot/src/c.cpp", 1).await;

    let request_id = world.driver.simulate_open(&local, 77, 1).await.unwrap();
    let reply = world.driver.wait_reply(request_id).await;
    assert_eq!(reply.request_result, ntstatus::ACCESS_DENIED);

    // Still a placeholder; nothing was hydrated.
    let meta = world.fixture.store.metadata(&local).await.unwrap().unwrap();
    assert!(meta.is_reparse);

    stop_world(&world).await;
}

#[tokio::test]
async fn test_in_flight_table_reports_hydration_window() {
    let world = start_world().await;
    world.fixture.depot.add_file("//depot/src/d.cpp", 2, CONTENT, "text");
    world.fixture.depot.set_print_delay(Duration::from_millis(150));

    let local = world.fixture.depot.client_path("//depot/src/d.cpp");
    install_placeholder(&world.fixture.context, &local, "//depot/src/d.cpp", 2).await;

    let request_id = world.driver.simulate_open(&local, 500, 501).await.unwrap();

    // While the print streams, the path reads as in flight, so oplock
    // logic can force share access.
    let in_flight = world.host.in_flight();
    let path_text = local.to_string_lossy().into_owned();
    let mut observed = false;
    for _ in 0..50 {
        if in_flight.contains(&path_text) {
            observed = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(observed, "hydration window never visible in the in-flight table");

    let reply = world.driver.wait_reply(request_id).await;
    assert_eq!(reply.request_result, ntstatus::SUCCESS);
    assert!(!in_flight.contains(&path_text));
    assert_eq!(tokio::fs::read(&local).await.unwrap(), CONTENT);

    stop_world(&world).await;
}

#[tokio::test]
async fn test_symlink_policy_replies_retry() {
    let world = start_world().await;
    let local = world.fixture.depot.client_root.join("link.txt");
    let request = InstallRequest {
        residency_policy: ResidencyPolicy::Symlink as u8,
        file_revision: 1,
        file_size: 4,
        attrs: FileAttrs::NORMAL,
        depot_path: "//depot/link.txt".to_string(),
        depot_server: support::PORT_NAME.to_string(),
        depot_client: support::CLIENT_NAME.to_string(),
        depot_user: support::USER_NAME.to_string(),
    };
    placeholder::install(
        world.fixture.context.store.as_ref(),
        &world.fixture.settings,
        &local,
        &request,
    )
    .await
    .unwrap();

    let request_id = world.driver.simulate_open(&local, 500, 501).await.unwrap();
    let reply = world.driver.wait_reply(request_id).await;
    assert_eq!(reply.request_result, ntstatus::RETRY);

    stop_world(&world).await;
}

#[tokio::test]
async fn test_remove_file_policy_deletes_placeholder() {
    let world = start_world().await;
    let local = world.fixture.depot.client_root.join("gone.txt");
    let request = InstallRequest {
        residency_policy: ResidencyPolicy::RemoveFile as u8,
        file_revision: 1,
        file_size: 4,
        attrs: FileAttrs::NORMAL,
        depot_path: "//depot/gone.txt".to_string(),
        depot_server: support::PORT_NAME.to_string(),
        depot_client: support::CLIENT_NAME.to_string(),
        depot_user: support::USER_NAME.to_string(),
    };
    placeholder::install(
        world.fixture.context.store.as_ref(),
        &world.fixture.settings,
        &local,
        &request,
    )
    .await
    .unwrap();

    let request_id = world.driver.simulate_open(&local, 500, 501).await.unwrap();
    let reply = world.driver.wait_reply(request_id).await;
    assert_eq!(reply.request_result, ntstatus::SUCCESS);
    assert!(world.fixture.store.metadata(&local).await.unwrap().is_none());

    stop_world(&world).await;
}

#[tokio::test]
async fn test_share_mode_flag_pushed_to_driver() {
    // Default: off.
    let world = start_world().await;
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(world.driver.flag(keys::SHARE_MODE_DURING_HYDRATION), Some(0));
    stop_world(&world).await;

    // Enabled by settings before the service starts.
    let dir = tempfile::tempdir().unwrap();
    let fixture = Fixture::new(dir.path());
    fixture.settings.set_from_text(keys::SHARE_MODE_DURING_HYDRATION, "true");
    let driver = LoopbackDriver::new(fixture.store.clone(), dir.path());
    let channel: Arc<dyn DriverChannel> = driver.clone();
    let host = Arc::new(ServiceHost::new(fixture.context.clone(), channel));
    let runner = host.clone();
    tokio::spawn(async move { runner.run().await });
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(driver.flag(keys::SHARE_MODE_DURING_HYDRATION), Some(1));
    host.cancel_token().cancel();
    driver.disconnect().await;
}

#[tokio::test]
async fn test_driver_log_write_forwarded() {
    let world = start_world().await;
    let request_id = world.driver.send_log_write("filter attached to volume").unwrap();
    let reply = world.driver.wait_reply(request_id).await;
    assert_eq!(reply.request_result, ntstatus::SUCCESS);
    stop_world(&world).await;
}
