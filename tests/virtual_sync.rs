//! Virtual sync engine behavior against the fake depot.

mod support;

use support::Fixture;
use vdepot::depot::revision::Revision;
use vdepot::depot::sync_action::{FlushMode, SyncFlags};
use vdepot::fs::FileStore;
use vdepot::placeholder;
use vdepot::vsync::{self, ReconfigOptions, SyncMethod, SyncOptions};

fn options(files: &[&str]) -> SyncOptions {
    SyncOptions {
        files: files.iter().map(|f| f.to_string()).collect(),
        ..Default::default()
    }
}

#[tokio::test]
async fn test_atomic_flush_pairs_installs_with_per_file_flushes() {
    let dir = tempfile::tempdir().unwrap();
    let fixture = Fixture::new(dir.path());
    for (path, size) in
        [("//depot/src/a.cpp", 1768usize), ("//depot/src/b.cpp", 64), ("//depot/inc/c.h", 256)]
    {
        fixture.depot.add_file(path, 3, &vec![0x5A; size], "text");
    }

    let mut session = fixture.connect_session().await;
    let result =
        vsync::sync(&fixture.context, &mut session, &options(&["//depot/..."])).await;
    assert_eq!(result.status, vsync::SyncStatus::Success);
    let modifications = result.modifications.unwrap();
    assert_eq!(modifications.len(), 3);

    // The plan is a preview; each install pairs with its own have flush.
    assert_eq!(fixture.depot.commands_matching("sync -n").len(), 1);
    assert_eq!(fixture.depot.commands_matching("sync -k").len(), 3);

    for (path, size) in
        [("//depot/src/a.cpp", 1768u64), ("//depot/src/b.cpp", 64), ("//depot/inc/c.h", 256)]
    {
        let local = fixture.depot.client_path(path);
        let meta = fixture.store.metadata(&local).await.unwrap().unwrap();
        assert!(meta.is_reparse, "{path} should be a placeholder");
        assert_eq!(meta.len, size);
        assert!(meta.attrs.readonly);

        let info = placeholder::read_info(&fixture.store, &local).await.unwrap().unwrap();
        assert_eq!(info.file_revision, 3);
        assert_eq!(info.depot_path, path);

        // The have-table agrees with the local placeholder; a reconcile
        // over this scope would report no changes.
        assert_eq!(fixture.depot.have_rev(path), 3);
    }
}

#[tokio::test]
async fn test_single_flush_updates_have_table_in_one_batch() {
    let dir = tempfile::tempdir().unwrap();
    let fixture = Fixture::new(dir.path());
    fixture.depot.add_file("//depot/src/a.cpp", 2, b"alpha", "text");
    fixture.depot.add_file("//depot/src/b.cpp", 4, b"bravo", "text");

    let mut session = fixture.connect_session().await;
    let mut opts = options(&["//depot/src/..."]);
    opts.flush_mode = FlushMode::Single;
    let result = vsync::sync(&fixture.context, &mut session, &opts).await;
    assert_eq!(result.status, vsync::SyncStatus::Success);

    // One batch-wide `sync -k` from the plan, no per-file flushes.
    let flushes = fixture.depot.commands_matching("sync -k");
    assert_eq!(flushes.len(), 1);
    assert!(flushes[0].contains("//depot/src/..."));

    for path in ["//depot/src/a.cpp", "//depot/src/b.cpp"] {
        let local = fixture.depot.client_path(path);
        assert!(placeholder::detect(&fixture.store, &local).await, "{path} placeholder");
    }
    assert_eq!(fixture.depot.have_rev("//depot/src/a.cpp"), 2);
    assert_eq!(fixture.depot.have_rev("//depot/src/b.cpp"), 4);
}

#[tokio::test]
async fn test_writable_local_file_is_not_clobbered() {
    let dir = tempfile::tempdir().unwrap();
    let fixture = Fixture::new(dir.path());
    fixture.depot.add_file("//depot/src/a.cpp", 5, b"depot content", "text");

    // A writable local file the user edited outside our control.
    let local = fixture.depot.client_path("//depot/src/a.cpp");
    tokio::fs::create_dir_all(local.parent().unwrap()).await.unwrap();
    tokio::fs::write(&local, b"local edits").await.unwrap();

    let mut session = fixture.connect_session().await;
    let result =
        vsync::sync(&fixture.context, &mut session, &options(&["//depot/src/..."])).await;

    assert_eq!(result.status, vsync::SyncStatus::Error);
    assert_eq!(tokio::fs::read(&local).await.unwrap(), b"local edits");
    assert!(!placeholder::detect(&fixture.store, &local).await);
}

#[tokio::test]
async fn test_writeable_flag_permits_clobber() {
    let dir = tempfile::tempdir().unwrap();
    let fixture = Fixture::new(dir.path());
    fixture.depot.add_file("//depot/src/a.cpp", 5, b"depot content", "text");

    let local = fixture.depot.client_path("//depot/src/a.cpp");
    tokio::fs::create_dir_all(local.parent().unwrap()).await.unwrap();
    tokio::fs::write(&local, b"local edits").await.unwrap();

    let mut session = fixture.connect_session().await;
    let mut opts = options(&["//depot/src/..."]);
    opts.sync_flags.insert(SyncFlags::WRITEABLE);
    let result = vsync::sync(&fixture.context, &mut session, &opts).await;

    assert_eq!(result.status, vsync::SyncStatus::Success);
    assert!(placeholder::detect(&fixture.store, &local).await);
}

#[tokio::test]
async fn test_deleted_file_uninstalls_and_flushes_none() {
    let dir = tempfile::tempdir().unwrap();
    let fixture = Fixture::new(dir.path());
    fixture.depot.add_file("//depot/src/a.cpp", 2, b"alpha", "text");

    let mut session = fixture.connect_session().await;
    let result =
        vsync::sync(&fixture.context, &mut session, &options(&["//depot/src/..."])).await;
    assert_eq!(result.status, vsync::SyncStatus::Success);
    let local = fixture.depot.client_path("//depot/src/a.cpp");
    assert!(placeholder::detect(&fixture.store, &local).await);

    // The file disappears from the depot; the next sync removes it.
    fixture.depot.delete_file("//depot/src/a.cpp");
    let result =
        vsync::sync(&fixture.context, &mut session, &options(&["//depot/src/..."])).await;
    assert_eq!(result.status, vsync::SyncStatus::Success);

    assert!(fixture.store.metadata(&local).await.unwrap().is_none());
    assert_eq!(fixture.depot.have_rev("//depot/src/a.cpp"), 0);
    assert!(fixture
        .depot
        .commands()
        .iter()
        .any(|c| c.starts_with("sync -k") && c.contains("#none")));
}

#[tokio::test]
async fn test_always_resident_pattern_downloads_content() {
    let dir = tempfile::tempdir().unwrap();
    let fixture = Fixture::new(dir.path());
    fixture.depot.add_file("//depot/bin/tool.bin", 1, b"\x7fELFbinarybytes", "binary");
    fixture.depot.add_file("//depot/src/a.cpp", 1, b"source", "text");

    let mut session = fixture.connect_session().await;
    let mut opts = options(&["//depot/..."]);
    opts.resident_pattern = r"\.bin$".to_string();
    let result = vsync::sync(&fixture.context, &mut session, &opts).await;
    assert_eq!(result.status, vsync::SyncStatus::Success);

    // The matched file arrived as real bytes, not a placeholder.
    let tool = fixture.depot.client_path("//depot/bin/tool.bin");
    assert!(!placeholder::detect(&fixture.store, &tool).await);
    assert_eq!(tokio::fs::read(&tool).await.unwrap(), b"\x7fELFbinarybytes");

    let source = fixture.depot.client_path("//depot/src/a.cpp");
    assert!(placeholder::detect(&fixture.store, &source).await);

    let modifications = result.modifications.unwrap();
    let tool_action =
        modifications.iter().find(|m| m.depot_file == "//depot/bin/tool.bin").unwrap();
    assert!(tool_action.is_always_resident);
    assert_eq!(tool_action.disk_file_size, 15);
}

#[tokio::test]
async fn test_preview_routes_to_regular_sync_and_touches_nothing() {
    let dir = tempfile::tempdir().unwrap();
    let fixture = Fixture::new(dir.path());
    fixture.depot.add_file("//depot/src/a.cpp", 3, b"alpha", "text");

    let mut session = fixture.connect_session().await;
    let mut opts = options(&["//depot/src/..."]);
    opts.sync_flags.insert(SyncFlags::PREVIEW);
    opts.sync_flags.insert(SyncFlags::QUIET);
    let result = vsync::sync(&fixture.context, &mut session, &opts).await;

    assert_eq!(result.status, vsync::SyncStatus::Success);
    let modifications = result.modifications.unwrap();
    assert_eq!(modifications.len(), 1);
    assert_eq!(modifications[0].revision, Some(Revision::Number(3)));

    let local = fixture.depot.client_path("//depot/src/a.cpp");
    assert!(fixture.store.metadata(&local).await.unwrap().is_none());
    assert_eq!(fixture.depot.have_rev("//depot/src/a.cpp"), 0);
}

#[tokio::test]
async fn test_regular_sync_parses_untagged_output() {
    let dir = tempfile::tempdir().unwrap();
    let fixture = Fixture::new(dir.path());
    fixture.depot.add_file("//depot/src/a.cpp", 3, b"alpha", "text");

    let mut session = fixture.connect_session().await;
    let mut opts = options(&["//depot/src/..."]);
    opts.sync_method = SyncMethod::Regular;
    let result = vsync::sync(&fixture.context, &mut session, &opts).await;

    assert_eq!(result.status, vsync::SyncStatus::Success);
    let modifications = result.modifications.unwrap();
    assert_eq!(modifications.len(), 1);
    assert_eq!(modifications[0].depot_file, "//depot/src/a.cpp");

    // A regular sync transfers real content.
    let local = fixture.depot.client_path("//depot/src/a.cpp");
    assert_eq!(tokio::fs::read(&local).await.unwrap(), b"alpha");
}

#[tokio::test]
async fn test_hydrate_populates_offline_files() {
    let dir = tempfile::tempdir().unwrap();
    let fixture = Fixture::new(dir.path());
    fixture.depot.add_file("//depot/src/a.cpp", 3, b"hydrate me", "text");

    let mut session = fixture.connect_session().await;
    let result =
        vsync::sync(&fixture.context, &mut session, &options(&["//depot/src/..."])).await;
    assert_eq!(result.status, vsync::SyncStatus::Success);

    let local = fixture.depot.client_path("//depot/src/a.cpp");
    assert!(placeholder::detect(&fixture.store, &local).await);

    let result =
        vsync::hydrate(&fixture.context, &mut session, &options(&["//depot/src/..."])).await;
    assert_eq!(result.status, vsync::SyncStatus::Success);
    assert_eq!(result.modifications.unwrap().len(), 1);

    assert!(!placeholder::detect(&fixture.store, &local).await);
    assert_eq!(tokio::fs::read(&local).await.unwrap(), b"hydrate me");
}

#[tokio::test]
async fn test_reconfig_rewrites_placeholder_identity() {
    let dir = tempfile::tempdir().unwrap();
    let fixture = Fixture::new(dir.path());
    fixture.depot.add_file("//depot/src/a.cpp", 3, b"alpha", "text");

    let mut session = fixture.connect_session().await;
    let result =
        vsync::sync(&fixture.context, &mut session, &options(&["//depot/src/..."])).await;
    assert_eq!(result.status, vsync::SyncStatus::Success);
    fixture.depot.set_have_rev("//depot/src/a.cpp", 3);

    // Forge an out-of-date server name, then reconfig it back.
    let local = fixture.depot.client_path("//depot/src/a.cpp");
    let mut info = placeholder::read_info(&fixture.store, &local).await.unwrap().unwrap();
    info.depot_server = "decommissioned:1666".to_string();
    {
        use vdepot::fs::{AccessMode, FileAttrs, FileStore, ShareMode};
        fixture
            .store
            .set_file_attrs(&local, FileAttrs::NORMAL.offline(true))
            .await
            .unwrap();
        let mut handle = fixture
            .store
            .open_by_file_id(&local, AccessMode::READ_WRITE, ShareMode::ALL)
            .await
            .unwrap();
        handle.set_reparse(&info.encode_v2()).await.unwrap();
        handle.close().await.unwrap();
        fixture
            .store
            .set_file_attrs(&local, FileAttrs::NORMAL.readonly(true).offline(true))
            .await
            .unwrap();
    }

    let reconfigured = vsync::reconfig(
        &fixture.context,
        &mut session,
        &["//depot/src/...".to_string()],
        ReconfigOptions { rewrite_port: true, ..Default::default() },
    )
    .await;
    assert!(reconfigured);

    let info = placeholder::read_info(&fixture.store, &local).await.unwrap().unwrap();
    assert_eq!(info.depot_server, support::PORT_NAME);
    assert_eq!(info.file_revision, 3);
}
