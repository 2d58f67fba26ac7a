//! End-to-end package lifecycle scenarios, driven through the public
//! `PackageManager` interface against real temporary directories.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use tempfile::TempDir;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::broadcast::Receiver;

use hangar::core::manifest::MANIFEST_NAME;
use hangar::core::report::REPORT_NAME;
use hangar::core::signature::verifying_key;
use hangar::{
    Config, ErrorCode, InstallationReport, MetaMap, Notification, PackageBuilder, PackageInfo,
    PackageManager, PackageState,
};

const DEV_KEY: [u8; 32] = [1; 32];
const STORE_KEY: [u8; 32] = [2; 32];
const HARDWARE_ID: &str = "test-hardware-0815";

/// Temporary on-disk layout for one test: built-in manifests, the
/// installation directory, the document directory and package sources.
struct TestBench {
    tmp: TempDir,
}

impl TestBench {
    fn new() -> Self {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| "warn".into()),
            )
            .try_init();
        Self {
            tmp: TempDir::new().expect("failed to create temp dir"),
        }
    }

    fn installation_dir(&self) -> PathBuf {
        self.tmp.path().join("installed")
    }

    fn document_dir(&self) -> PathBuf {
        self.tmp.path().join("documents")
    }

    fn builtin_dir(&self) -> PathBuf {
        self.tmp.path().join("builtin")
    }

    fn config(&self) -> Config {
        let mut config = Config::new(self.installation_dir());
        config.document_dir = Some(self.document_dir());
        config.chain_of_trust = vec![verifying_key(&DEV_KEY), verifying_key(&STORE_KEY)];
        config.hardware_id = Some(HARDWARE_ID.to_string());
        if self.builtin_dir().is_dir() {
            config.builtin_dirs = vec![self.builtin_dir()];
        }
        config
    }

    fn manifest(id: &str, version: &str) -> PackageInfo {
        PackageInfo {
            id: id.into(),
            version: version.into(),
            name: [("en".to_string(), format!("{id} (test)"))].into(),
            description: Default::default(),
            icon: "icon.png".into(),
            categories: vec!["test".into()],
            applications: vec![hangar::ApplicationInfo {
                id: format!("{id}.app"),
                code: "app".into(),
                runtime: "native".into(),
            }],
            intents: vec![],
        }
    }

    /// Writes a package source tree and returns its directory.
    fn package_source(&self, id: &str, version: &str, files: &[(&str, &str)]) -> PathBuf {
        let dir = self.tmp.path().join(format!("src-{id}-{version}"));
        std::fs::create_dir_all(&dir).unwrap();
        Self::manifest(id, version).save(&dir).unwrap();
        std::fs::write(dir.join("icon.png"), b"\x89PNG icon").unwrap();
        std::fs::write(dir.join("app"), "#!/bin/sh\n").unwrap();
        for (name, content) in files {
            std::fs::write(dir.join(name), content).unwrap();
        }
        dir
    }

    fn build_package(&self, builder: PackageBuilder, name: &str) -> String {
        let path = self.tmp.path().join(name);
        builder.create(&path).unwrap();
        path.to_str().unwrap().to_string()
    }

    /// A plain, unsigned package with the given payload files.
    fn unsigned_package(&self, id: &str, version: &str, files: &[(&str, &str)]) -> String {
        let source = self.package_source(id, version, files);
        self.build_package(
            PackageBuilder::new(source),
            &format!("{id}-{version}.ampkg"),
        )
    }

    fn dev_signed_package(&self, id: &str, version: &str, files: &[(&str, &str)]) -> String {
        let source = self.package_source(id, version, files);
        self.build_package(
            PackageBuilder::new(source).developer_sign(DEV_KEY),
            &format!("{id}-{version}.ampkg"),
        )
    }

    fn store_signed_package(&self, id: &str, version: &str, files: &[(&str, &str)]) -> String {
        let source = self.package_source(id, version, files);
        self.build_package(
            PackageBuilder::new(source).store_sign(STORE_KEY, Some(HARDWARE_ID)),
            &format!("{id}-{version}.ampkg"),
        )
    }

    /// Registers a built-in package (manifest only, read-only location).
    fn add_builtin(&self, id: &str, version: &str) {
        let dir = self.builtin_dir().join(id);
        std::fs::create_dir_all(&dir).unwrap();
        Self::manifest(id, version).save(&dir).unwrap();
        std::fs::write(dir.join("icon.png"), b"builtin icon").unwrap();
    }
}

async fn wait_for(
    events: &mut Receiver<Notification>,
    what: &str,
    pred: impl Fn(&Notification) -> bool,
) -> Notification {
    tokio::time::timeout(Duration::from_secs(30), async {
        loop {
            match events.recv().await {
                Ok(notification) if pred(&notification) => return notification,
                Ok(_) => continue,
                Err(RecvError::Lagged(_)) => continue,
                Err(RecvError::Closed) => panic!("notification stream closed"),
            }
        }
    })
    .await
    .unwrap_or_else(|_| panic!("timed out waiting for {what}"))
}

async fn wait_for_ack_request(events: &mut Receiver<Notification>, task: &str) {
    wait_for(events, "acknowledge request", |n| {
        matches!(n, Notification::TaskRequestingInstallationAcknowledge { task: t, .. } if t.as_str() == task)
    })
    .await;
}

async fn wait_for_finished(events: &mut Receiver<Notification>, task: &str) {
    wait_for(events, "task finished", |n| {
        matches!(n, Notification::TaskFinished { task: t } if t.as_str() == task)
    })
    .await;
}

async fn wait_for_failed(events: &mut Receiver<Notification>, task: &str) -> (ErrorCode, String) {
    let notification = wait_for(events, "task failed", |n| {
        matches!(n, Notification::TaskFailed { task: t, .. } if t.as_str() == task)
    })
    .await;
    match notification {
        Notification::TaskFailed { code, message, .. } => (code, message),
        _ => unreachable!(),
    }
}

/// Runs one installation through the acknowledge handshake.
async fn install(
    manager: &PackageManager,
    events: &mut Receiver<Notification>,
    package: &str,
) -> String {
    let task = manager.start_package_installation(package).await.unwrap();
    wait_for_ack_request(events, &task).await;
    manager
        .acknowledge_package_installation(&task)
        .await
        .unwrap();
    wait_for_finished(events, &task).await;
    task
}

fn dir_names(dir: &Path) -> BTreeSet<String> {
    match std::fs::read_dir(dir) {
        Ok(entries) => entries
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect(),
        Err(_) => BTreeSet::new(),
    }
}

/// No `<id>+` or `<id>-` sibling may survive any task sequence.
fn assert_no_transient_siblings(dir: &Path) {
    for name in dir_names(dir) {
        assert!(
            !name.ends_with('+') && !name.ends_with('-'),
            "transient sibling left behind: {name}"
        );
    }
}

// ----- scenario 1: fresh install of an unsigned package -----

#[tokio::test]
async fn test_fresh_unsigned_install() {
    let bench = TestBench::new();
    let mut config = bench.config();
    config.allow_unsigned = true;

    let manager = PackageManager::new(config).await.unwrap();
    let mut events = manager.subscribe();

    let package = bench.unsigned_package(
        "com.pelagicore.test",
        "1.0",
        &[("test", "test\n"), ("tëst", "test\n")],
    );
    install(&manager, &mut events, &package).await;

    let snapshot = manager
        .package("com.pelagicore.test")
        .await
        .unwrap()
        .expect("package must be registered");
    assert_eq!(snapshot.id(), "com.pelagicore.test");
    assert_eq!(snapshot.state, PackageState::Installed);
    assert!(!snapshot.blocked);

    let installed = bench.installation_dir().join("com.pelagicore.test");
    assert_eq!(
        dir_names(&installed),
        [REPORT_NAME, MANIFEST_NAME, "icon.png", "app", "test", "tëst"]
            .iter()
            .map(|s| s.to_string())
            .collect::<BTreeSet<_>>()
    );
    assert_eq!(
        std::fs::read_to_string(installed.join("test")).unwrap(),
        "test\n"
    );
    assert!(bench.document_dir().join("com.pelagicore.test").is_dir());
    assert_no_transient_siblings(&bench.installation_dir());

    // the report on disk is valid and MAC-verified
    let report =
        InstallationReport::load(&std::fs::read(installed.join(REPORT_NAME)).unwrap()).unwrap();
    assert_eq!(report.package_id, "com.pelagicore.test");
    assert!(report.files.contains(&"test".to_string()));
    assert_eq!(
        manager
            .installed_package_size("com.pelagicore.test")
            .await
            .unwrap(),
        Some(report.disk_space_used)
    );
}

// ----- scenario 2: install, then update (developer-signed) -----

#[tokio::test]
async fn test_install_then_update() {
    let bench = TestBench::new();
    let mut config = bench.config();
    config.development_mode = true;

    let manager = PackageManager::new(config).await.unwrap();
    let mut events = manager.subscribe();

    let v1 = bench.dev_signed_package("com.pelagicore.test", "1.0", &[("test", "test\n")]);
    install(&manager, &mut events, &v1).await;

    let v2 = bench.dev_signed_package("com.pelagicore.test", "2.0", &[("test", "test update\n")]);
    install(&manager, &mut events, &v2).await;

    let packages = manager.packages().await.unwrap();
    assert_eq!(packages.len(), 1);
    assert_eq!(packages[0].version(), "2.0");

    let installed = bench.installation_dir().join("com.pelagicore.test");
    assert_eq!(
        std::fs::read_to_string(installed.join("test")).unwrap(),
        "test update\n"
    );
    assert_no_transient_siblings(&bench.installation_dir());
    assert_no_transient_siblings(&bench.document_dir());
}

// ----- scenario 3: cancellation while awaiting the acknowledge -----

#[tokio::test]
async fn test_cancel_during_awaiting_acknowledge() {
    let bench = TestBench::new();
    let mut config = bench.config();
    config.allow_unsigned = true;

    let manager = PackageManager::new(config).await.unwrap();
    let mut events = manager.subscribe();

    let big_payload = "x".repeat(512 * 1024);
    let package =
        bench.unsigned_package("com.pelagicore.test", "1.0", &[("blob", &big_payload)]);

    let task = manager.start_package_installation(&package).await.unwrap();
    wait_for(&mut events, "blocking until acknowledge", |n| {
        matches!(n, Notification::TaskBlockingUntilInstallationAcknowledge { task: t } if *t == task)
    })
    .await;

    assert!(manager.cancel_task(&task).await.unwrap());
    let (code, message) = wait_for_failed(&mut events, &task).await;
    assert_eq!(code, ErrorCode::Canceled);
    assert_eq!(message, "canceled");

    assert!(manager
        .package("com.pelagicore.test")
        .await
        .unwrap()
        .is_none());
    assert!(!bench
        .installation_dir()
        .join("com.pelagicore.test")
        .exists());
    assert_no_transient_siblings(&bench.installation_dir());
}

// ----- scenario 4: parallel install of the same id is forbidden -----

#[tokio::test]
async fn test_parallel_install_of_same_id() {
    let bench = TestBench::new();
    let mut config = bench.config();
    config.allow_unsigned = true;

    let manager = PackageManager::new(config).await.unwrap();
    let mut events = manager.subscribe();

    let first = bench.unsigned_package("com.pelagicore.test", "1.0", &[("test", "test\n")]);
    let task1 = manager.start_package_installation(&first).await.unwrap();
    wait_for_ack_request(&mut events, &task1).await;

    // the first task now waits for its acknowledge; a second install of
    // the same id must be declined
    let second = bench.unsigned_package("com.pelagicore.test", "1.1", &[("test", "other\n")]);
    let task2 = manager.start_package_installation(&second).await.unwrap();
    let (code, message) = wait_for_failed(&mut events, &task2).await;
    assert_eq!(code, ErrorCode::Package);
    assert!(
        message.contains("multiple times in parallel"),
        "unexpected message: {message}"
    );

    // the first task is unaffected and still completes
    manager
        .acknowledge_package_installation(&task1)
        .await
        .unwrap();
    wait_for_finished(&mut events, &task1).await;

    let snapshot = manager
        .package("com.pelagicore.test")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(snapshot.version(), "1.0");
    assert_no_transient_siblings(&bench.installation_dir());
}

// ----- scenario 5: update a built-in, then remove to revert -----

#[tokio::test]
async fn test_builtin_update_and_revert() {
    let bench = TestBench::new();
    bench.add_builtin("builtin.x", "1.0");
    let mut config = bench.config();
    config.allow_unsigned = true;

    let manager = PackageManager::new(config).await.unwrap();
    let mut events = manager.subscribe();

    {
        let snapshot = manager.package("builtin.x").await.unwrap().unwrap();
        assert!(snapshot.built_in);
        assert!(!snapshot.has_removable_update);
        assert_eq!(snapshot.version(), "1.0");

        // built-ins without an update cannot be removed
        let task = manager
            .remove_package("builtin.x", false, false)
            .await
            .unwrap();
        let (code, message) = wait_for_failed(&mut events, &task).await;
        assert_eq!(code, ErrorCode::Package);
        assert!(message.contains("no removable update"));
    }

    let update = bench.unsigned_package("builtin.x", "2.0", &[("test", "update\n")]);
    install(&manager, &mut events, &update).await;

    {
        let snapshot = manager.package("builtin.x").await.unwrap().unwrap();
        assert!(snapshot.built_in);
        assert!(snapshot.has_removable_update);
        assert_eq!(snapshot.version(), "2.0");
        assert!(bench.installation_dir().join("builtin.x").is_dir());
    }

    let task = manager.remove_package("builtin.x", false, false).await.unwrap();
    wait_for_finished(&mut events, &task).await;

    // the entry survives the removal, reverted to the built-in manifest
    let snapshot = manager.package("builtin.x").await.unwrap().unwrap();
    assert!(snapshot.built_in);
    assert!(!snapshot.has_removable_update);
    assert_eq!(snapshot.version(), "1.0");
    assert_eq!(snapshot.state, PackageState::Installed);

    assert!(!bench.installation_dir().join("builtin.x").exists());
    assert_no_transient_siblings(&bench.installation_dir());
    assert_no_transient_siblings(&bench.document_dir());
}

// ----- scenario 6: tampered installation report on startup -----

#[tokio::test]
async fn test_tampered_report_is_cleaned_up_on_startup() {
    let bench = TestBench::new();
    let mut config = bench.config();
    config.allow_unsigned = true;

    {
        let manager = PackageManager::new(config.clone()).await.unwrap();
        let mut events = manager.subscribe();
        let package = bench.unsigned_package("com.pelagicore.test", "1.0", &[("test", "test\n")]);
        install(&manager, &mut events, &package).await;
        assert!(bench.document_dir().join("com.pelagicore.test").is_dir());
    }

    // flip one byte inside the report
    let report_path = bench
        .installation_dir()
        .join("com.pelagicore.test")
        .join(REPORT_NAME);
    let mut data = std::fs::read(&report_path).unwrap();
    let pos = data
        .windows(14)
        .position(|w| w == b"diskSpaceUsed:")
        .unwrap()
        + 15;
    data[pos] = data[pos].wrapping_add(1);
    std::fs::write(&report_path, &data).unwrap();

    // restart: the broken installation is removed, including documents
    let manager = PackageManager::new(config).await.unwrap();
    assert!(manager
        .package("com.pelagicore.test")
        .await
        .unwrap()
        .is_none());
    assert!(!bench
        .installation_dir()
        .join("com.pelagicore.test")
        .exists());
    assert!(!bench.document_dir().join("com.pelagicore.test").exists());
}

// ----- signature policy -----

#[tokio::test]
async fn test_unsigned_package_is_rejected_by_default() {
    let bench = TestBench::new();
    let manager = PackageManager::new(bench.config()).await.unwrap();
    let mut events = manager.subscribe();

    let package = bench.unsigned_package("com.pelagicore.test", "1.0", &[("test", "test\n")]);
    let task = manager.start_package_installation(&package).await.unwrap();
    let (code, message) = wait_for_failed(&mut events, &task).await;
    assert_eq!(code, ErrorCode::Signature);
    assert!(message.contains("unsigned"));
    assert!(manager.packages().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_developer_package_needs_development_mode() {
    let bench = TestBench::new();
    let manager = PackageManager::new(bench.config()).await.unwrap();
    let mut events = manager.subscribe();

    let package = bench.dev_signed_package("com.pelagicore.test", "1.0", &[("test", "test\n")]);
    let task = manager.start_package_installation(&package).await.unwrap();
    let (code, message) = wait_for_failed(&mut events, &task).await;
    assert_eq!(code, ErrorCode::Signature);
    assert!(message.contains("development"));
}

#[tokio::test]
async fn test_store_signed_package_installs_on_consumer_device() {
    let bench = TestBench::new();
    let manager = PackageManager::new(bench.config()).await.unwrap();
    let mut events = manager.subscribe();

    let package = bench.store_signed_package("com.pelagicore.test", "1.0", &[("test", "test\n")]);
    install(&manager, &mut events, &package).await;
    assert!(manager
        .package("com.pelagicore.test")
        .await
        .unwrap()
        .is_some());
}

#[tokio::test]
async fn test_store_signature_bound_to_other_device_fails() {
    let bench = TestBench::new();
    let source = bench.package_source("com.pelagicore.test", "1.0", &[("test", "test\n")]);
    let package = bench.build_package(
        PackageBuilder::new(source).store_sign(STORE_KEY, Some("some-other-device")),
        "other.ampkg",
    );

    let manager = PackageManager::new(bench.config()).await.unwrap();
    let mut events = manager.subscribe();
    let task = manager.start_package_installation(&package).await.unwrap();
    let (code, _) = wait_for_failed(&mut events, &task).await;
    assert_eq!(code, ErrorCode::Signature);
}

// ----- removal behavior -----

#[tokio::test]
async fn test_remove_package_deletes_everything() {
    let bench = TestBench::new();
    let mut config = bench.config();
    config.allow_unsigned = true;

    let manager = PackageManager::new(config).await.unwrap();
    let mut events = manager.subscribe();

    let package = bench.unsigned_package("com.pelagicore.test", "1.0", &[("test", "test\n")]);
    install(&manager, &mut events, &package).await;
    std::fs::write(
        bench.document_dir().join("com.pelagicore.test").join("doc"),
        "user data",
    )
    .unwrap();

    let task = manager
        .remove_package("com.pelagicore.test", false, false)
        .await
        .unwrap();
    wait_for_finished(&mut events, &task).await;

    assert!(manager
        .package("com.pelagicore.test")
        .await
        .unwrap()
        .is_none());
    assert!(!bench
        .installation_dir()
        .join("com.pelagicore.test")
        .exists());
    assert!(!bench.document_dir().join("com.pelagicore.test").exists());
    assert_no_transient_siblings(&bench.installation_dir());
}

#[tokio::test]
async fn test_remove_package_keeping_documents() {
    let bench = TestBench::new();
    let mut config = bench.config();
    config.allow_unsigned = true;

    let manager = PackageManager::new(config).await.unwrap();
    let mut events = manager.subscribe();

    let package = bench.unsigned_package("com.pelagicore.test", "1.0", &[("test", "test\n")]);
    install(&manager, &mut events, &package).await;

    let task = manager
        .remove_package("com.pelagicore.test", true, false)
        .await
        .unwrap();
    wait_for_finished(&mut events, &task).await;

    assert!(!bench
        .installation_dir()
        .join("com.pelagicore.test")
        .exists());
    assert!(bench.document_dir().join("com.pelagicore.test").is_dir());
}

#[tokio::test]
async fn test_remove_unknown_package_fails() {
    let bench = TestBench::new();
    let manager = PackageManager::new(bench.config()).await.unwrap();
    let err = manager
        .remove_package("com.not.there", false, false)
        .await
        .unwrap_err();
    assert_eq!(err.code(), ErrorCode::NotInstalled);
}

// ----- metadata plumbing -----

#[tokio::test]
async fn test_extra_metadata_round_trip() {
    let bench = TestBench::new();
    let mut config = bench.config();
    config.allow_unsigned = true;

    let manager = PackageManager::new(config).await.unwrap();
    let mut events = manager.subscribe();

    let extra: MetaMap = [("channel".to_string(), "beta".into())].into();
    let signed: MetaMap = [("origin".to_string(), "store".into())].into();
    let source = bench.package_source("com.pelagicore.test", "1.0", &[("test", "test\n")]);
    let package = bench.build_package(
        PackageBuilder::new(source)
            .extra_metadata(extra.clone())
            .extra_signed_metadata(signed.clone()),
        "meta.ampkg",
    );

    let task = manager.start_package_installation(&package).await.unwrap();
    let notification = wait_for(&mut events, "acknowledge request", |n| {
        matches!(n, Notification::TaskRequestingInstallationAcknowledge { task: t, .. } if *t == task)
    })
    .await;
    match &notification {
        Notification::TaskRequestingInstallationAcknowledge {
            package,
            extra_metadata,
            extra_signed_metadata,
            ..
        } => {
            assert_eq!(package.id(), "com.pelagicore.test");
            assert_eq!(package.state, PackageState::BeingInstalled);
            assert!(package.blocked);
            assert_eq!(extra_metadata, &extra);
            assert_eq!(extra_signed_metadata, &signed);
        }
        _ => unreachable!(),
    }
    manager
        .acknowledge_package_installation(&task)
        .await
        .unwrap();
    wait_for_finished(&mut events, &task).await;

    assert_eq!(
        manager
            .installed_package_extra_metadata("com.pelagicore.test")
            .await
            .unwrap(),
        Some(extra)
    );
    assert_eq!(
        manager
            .installed_package_extra_signed_metadata("com.pelagicore.test")
            .await
            .unwrap(),
        Some(signed)
    );
}

// ----- task bookkeeping -----

#[tokio::test]
async fn test_task_queries_and_stale_cancel() {
    let bench = TestBench::new();
    let mut config = bench.config();
    config.allow_unsigned = true;

    let manager = PackageManager::new(config).await.unwrap();
    let mut events = manager.subscribe();

    let package = bench.unsigned_package("com.pelagicore.test", "1.0", &[("test", "test\n")]);
    let task = manager.start_package_installation(&package).await.unwrap();
    wait_for_ack_request(&mut events, &task).await;

    assert_eq!(
        manager.task_package_id(&task).await.unwrap(),
        Some("com.pelagicore.test".to_string())
    );
    assert!(manager.active_task_ids().await.unwrap().contains(&task));

    manager
        .acknowledge_package_installation(&task)
        .await
        .unwrap();
    wait_for_finished(&mut events, &task).await;

    // finished tasks are gone: canceling is a no-op returning false
    assert_eq!(manager.task_state(&task).await.unwrap(), None);
    assert!(!manager.cancel_task(&task).await.unwrap());
    assert!(!manager.cancel_task("task-does-not-exist").await.unwrap());
}

#[tokio::test]
async fn test_acknowledge_before_extraction_finishes_is_tolerated() {
    let bench = TestBench::new();
    let mut config = bench.config();
    config.allow_unsigned = true;

    let manager = PackageManager::new(config).await.unwrap();
    let mut events = manager.subscribe();

    let big_payload = "y".repeat(2 * 1024 * 1024);
    let package =
        bench.unsigned_package("com.pelagicore.test", "1.0", &[("blob", &big_payload)]);
    let task = manager.start_package_installation(&package).await.unwrap();

    // acknowledge immediately, possibly before extraction finished;
    // the install must still go through
    manager
        .acknowledge_package_installation(&task)
        .await
        .unwrap();
    wait_for_finished(&mut events, &task).await;
    assert!(manager
        .package("com.pelagicore.test")
        .await
        .unwrap()
        .is_some());
}

// ----- uid separation (needs root, skipped otherwise) -----

#[cfg(unix)]
#[tokio::test]
async fn test_uid_separation_install_and_remove() {
    use std::os::unix::fs::MetadataExt;
    use std::sync::Arc;

    // chown only works with elevated rights
    if unsafe { libc::geteuid() } != 0 {
        eprintln!("skipping uid separation test: not running as root");
        return;
    }

    let bench = TestBench::new();
    let mut config = bench.config();
    config.allow_unsigned = true;
    config.uid_separation = Some(hangar::UidRange {
        min_uid: 64000,
        max_uid: 64010,
        common_gid: 64000,
    });
    // route privileged operations through the framed helper protocol
    config.helper =
        Arc::new(hangar::HelperClient::spawn_in_process(Arc::new(hangar::DirectHelper)).unwrap());

    let manager = PackageManager::new(config).await.unwrap();
    let mut events = manager.subscribe();

    let package = bench.unsigned_package("com.pelagicore.test", "1.0", &[("test", "test\n")]);
    install(&manager, &mut events, &package).await;

    let snapshot = manager
        .package("com.pelagicore.test")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(snapshot.uid, Some(64000));

    let installed = bench.installation_dir().join("com.pelagicore.test");
    assert_eq!(installed.metadata().unwrap().uid(), 64000);
    assert_eq!(installed.join("test").metadata().unwrap().uid(), 64000);
    assert_eq!(
        bench
            .document_dir()
            .join("com.pelagicore.test")
            .metadata()
            .unwrap()
            .uid(),
        64000
    );

    let task = manager
        .remove_package("com.pelagicore.test", false, false)
        .await
        .unwrap();
    wait_for_finished(&mut events, &task).await;
    assert!(!installed.exists());
}

// ----- registry utilities -----

#[test]
fn test_version_and_dns_utilities() {
    assert_eq!(PackageManager::compare_versions("1.2", "1.10"), -1);
    assert_eq!(PackageManager::compare_versions("1.10", "1.2"), 1);
    assert_eq!(PackageManager::compare_versions("1.2.3", "1.2.3"), 0);
    assert!(PackageManager::validate_dns_name("com.pelagicore.test", 3));
    assert!(!PackageManager::validate_dns_name("com.pelagicore", 3));
}
