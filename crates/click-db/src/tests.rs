use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::os::unix::fs::symlink;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use click_core::{manifest_path, ClickConfig, ClickError, Result};
use tempfile::TempDir;

use super::*;

#[derive(Default)]
struct FakeSupervisor {
    running: Mutex<BTreeSet<String>>,
    stopped: Mutex<Vec<String>>,
}

impl FakeSupervisor {
    fn set_running(&self, id: &str, running: bool) {
        let mut ids = self.running.lock().expect("lock running");
        if running {
            ids.insert(id.to_string());
        } else {
            ids.remove(id);
        }
    }

    fn stopped(&self) -> Vec<String> {
        self.stopped.lock().expect("lock stopped").clone()
    }
}

impl AppSupervisor for FakeSupervisor {
    fn is_running(&self, package: &str, app_name: &str, version: &str) -> Result<bool> {
        let id = format!("{package}_{app_name}_{version}");
        Ok(self.running.lock().expect("lock running").contains(&id))
    }

    fn stop(&self, package: &str, app_name: &str, version: &str) -> Result<()> {
        let id = format!("{package}_{app_name}_{version}");
        self.stopped.lock().expect("lock stopped").push(id);
        Ok(())
    }
}

struct Fixture {
    temp: TempDir,
    supervisor: Arc<FakeSupervisor>,
}

impl Fixture {
    fn new() -> Self {
        Self {
            temp: tempfile::tempdir().expect("tempdir"),
            supervisor: Arc::new(FakeSupervisor::default()),
        }
    }

    fn path(&self, name: &str) -> PathBuf {
        self.temp.path().join(name)
    }

    fn config(&self) -> ClickConfig {
        ClickConfig {
            db_dir: self.path("databases"),
            hooks_dir: self.path("hooks"),
            frameworks_dir: self.path("frameworks"),
            ..ClickConfig::default()
        }
    }

    fn db(&self, roots: &[&str]) -> ClickDb {
        let mut db = ClickDb::new(self.config())
            .with_privilege_mode(PrivilegeMode::Inherit)
            .with_supervisor(self.supervisor.clone());
        for root in roots {
            db.add(self.path(root));
        }
        db
    }

    fn write_hook(&self, name: &str, body: &str) {
        let hooks_dir = self.path("hooks");
        fs::create_dir_all(&hooks_dir).expect("create hooks dir");
        fs::write(hooks_dir.join(format!("{name}.hook")), body).expect("write hook");
    }
}

fn install_version(root: &Path, package: &str, version: &str, hooks: &str) -> PathBuf {
    let dir = root.join(package).join(version);
    fs::create_dir_all(dir.join(".click").join("info")).expect("create version dir");
    fs::write(
        manifest_path(&dir, package),
        format!(r#"{{"name": "{package}", "version": "{version}", "hooks": {hooks}}}"#),
    )
    .expect("write manifest");
    dir
}

fn set_current(root: &Path, package: &str, version: &str) {
    let link = root.join(package).join("current");
    let _ = fs::remove_file(&link);
    symlink(version, link).expect("current symlink");
}

fn register_raw(root: &Path, user: &str, package: &str, target: &Path) {
    let db = root.join(".click").join("users").join(user);
    fs::create_dir_all(&db).expect("create user db");
    symlink(target, db.join(package)).expect("registration symlink");
}

fn tree_snapshot(root: &Path) -> Vec<(PathBuf, Option<PathBuf>)> {
    let mut entries = Vec::new();
    let mut pending = vec![root.to_path_buf()];
    while let Some(dir) = pending.pop() {
        let Ok(read) = fs::read_dir(&dir) else {
            continue;
        };
        for entry in read {
            let path = entry.expect("dir entry").path();
            let metadata = fs::symlink_metadata(&path).expect("metadata");
            let target = if metadata.file_type().is_symlink() {
                Some(fs::read_link(&path).expect("read link"))
            } else {
                None
            };
            if metadata.is_dir() {
                pending.push(path.clone());
            }
            entries.push((path, target));
        }
    }
    entries.sort();
    entries
}

#[test]
fn force_symlink_replaces_and_unlink_tolerates_absence() {
    let temp = tempfile::tempdir().expect("tempdir");
    let link = temp.path().join("link");
    force_symlink(Path::new("first"), &link).expect("first link");
    force_symlink(Path::new("second"), &link).expect("replace link");
    assert_eq!(fs::read_link(&link).expect("read link"), PathBuf::from("second"));

    force_unlink(&link).expect("unlink");
    force_unlink(&link).expect("unlink absent");
    assert!(list_dir_or_empty(&temp.path().join("missing"))
        .expect("missing dir")
        .is_empty());
}

#[test]
fn listing_a_regular_file_is_an_error() {
    let temp = tempfile::tempdir().expect("tempdir");
    let file = temp.path().join("file");
    fs::write(&file, "").expect("write");
    assert!(matches!(
        list_dir_or_empty(&file),
        Err(ClickError::Io { .. })
    ));
    assert!(crate::fs_utils::remove_dir_if_empty(&file).is_err());
    assert!(file.is_file());
}

#[test]
fn ensure_dir_rejects_files() {
    let temp = tempfile::tempdir().expect("tempdir");
    let file = temp.path().join("file");
    fs::write(&file, "").expect("write");
    ensure_dir(&temp.path().join("a").join("b")).expect("nested dirs");
    assert!(matches!(
        ensure_dir(&file),
        Err(ClickError::CorruptState { .. })
    ));
}

#[test]
fn link_state_distinguishes_markers() {
    let temp = tempfile::tempdir().expect("tempdir");
    let hidden = temp.path().join("hidden");
    symlink(HIDDEN_VERSION, &hidden).expect("marker");
    let valid = temp.path().join("valid");
    symlink("/somewhere/1.0", &valid).expect("link");

    assert_eq!(link_state(&hidden), LinkState::Marker("@hidden".to_string()));
    assert_eq!(
        link_state(&valid),
        LinkState::Valid(PathBuf::from("/somewhere/1.0"))
    );
    assert_eq!(link_state(&temp.path().join("absent")), LinkState::Absent);
}

#[test]
fn layer_enumeration_is_sorted_and_honours_current() {
    let fixture = Fixture::new();
    let root = fixture.path("click");
    install_version(&root, "a", "1.1", "{}");
    install_version(&root, "a", "1.0", "{}");
    set_current(&root, "a", "1.0");
    install_version(&root, "b", "2.0", "{}");
    fs::write(root.join("stray"), "").expect("write stray file");
    let layer = InstallationLayer::new(&root);

    let current = layer.enumerate(false).expect("enumerate current");
    assert_eq!(current.len(), 1);
    assert_eq!(
        (current[0].package.as_str(), current[0].version.as_str()),
        ("a", "1.0")
    );
    assert_eq!(current[0].path, root.join("a").join("current"));

    let all = layer.enumerate(true).expect("enumerate all");
    let ids: Vec<(&str, &str)> = all
        .iter()
        .map(|entry| (entry.package.as_str(), entry.version.as_str()))
        .collect();
    assert_eq!(ids, vec![("a", "1.0"), ("a", "1.1"), ("b", "2.0")]);
    assert_eq!(all[0].path, root.join("a").join("1.0"));
}

#[test]
fn current_with_path_separator_is_absent() {
    let fixture = Fixture::new();
    let root = fixture.path("click");
    install_version(&root, "a", "1.0", "{}");
    symlink("../a/1.0", root.join("a").join("current")).expect("bad current");
    let layer = InstallationLayer::new(&root);

    assert_eq!(layer.current_version("a").expect("current"), None);
    assert!(layer.enumerate(false).expect("enumerate").is_empty());
}

#[test]
fn layer_remove_version_unlinks_current_without_relinking() {
    let fixture = Fixture::new();
    let root = fixture.path("click");
    install_version(&root, "a", "1.0", "{}");
    install_version(&root, "a", "1.1", "{}");
    set_current(&root, "a", "1.1");
    let layer = InstallationLayer::new(&root);

    let outcome = layer
        .remove_version_if_unreferenced("a", "1.1", fixture.supervisor.as_ref(), || Ok(()))
        .expect("remove");
    assert_eq!(outcome, RemovalOutcome::Removed);
    assert!(!root.join("a").join("1.1").exists());
    assert_eq!(link_state(&root.join("a").join("current")), LinkState::Absent);
    assert!(root.join("a").join("1.0").is_dir());

    let outcome = layer
        .remove_version_if_unreferenced("a", "1.0", fixture.supervisor.as_ref(), || Ok(()))
        .expect("remove last");
    assert_eq!(outcome, RemovalOutcome::Removed);
    assert!(!root.join("a").exists());
}

#[test]
fn database_lookup_prefers_overlay() {
    let fixture = Fixture::new();
    let base = fixture.path("base");
    let overlay = fixture.path("overlay");
    install_version(&base, "a", "1.0", "{}");
    set_current(&base, "a", "1.0");
    install_version(&base, "shared", "1.0", "{}");
    install_version(&overlay, "a", "1.1", "{}");
    set_current(&overlay, "a", "1.1");
    install_version(&overlay, "shared", "1.0", "{}");
    let db = fixture.db(&["base", "overlay"]);

    assert_eq!(
        db.path("shared", "1.0").expect("shared"),
        overlay.join("shared").join("1.0")
    );
    assert_eq!(db.path("a", "1.0").expect("a"), base.join("a").join("1.0"));
    assert!(db.path("a", "9.9").expect_err("absent").is_not_found());

    let current = db.packages(false).expect("current packages");
    assert_eq!(current.len(), 1);
    assert_eq!(current[0].version, "1.1");
    assert!(current[0].writeable);

    let all = db.packages(true).expect("all packages");
    let ids: BTreeSet<(String, String, bool)> = all
        .into_iter()
        .map(|entry| (entry.package, entry.version, entry.writeable))
        .collect();
    let expected: BTreeSet<(String, String, bool)> = [
        ("a", "1.1", true),
        ("shared", "1.0", true),
        ("a", "1.0", false),
    ]
    .into_iter()
    .map(|(package, version, writeable)| (package.to_string(), version.to_string(), writeable))
    .collect();
    assert_eq!(ids, expected);
}

#[test]
fn database_reads_layers_from_config_files() {
    let fixture = Fixture::new();
    let db_dir = fixture.path("databases");
    fs::create_dir_all(&db_dir).expect("create db dir");
    fs::write(
        db_dir.join("10_core.conf"),
        format!("[Click Database]\nroot = {}\n", fixture.path("core").display()),
    )
    .expect("write core conf");
    fs::write(
        db_dir.join("99_default.conf"),
        format!("[Click Database]\nroot = {}\n", fixture.path("click").display()),
    )
    .expect("write default conf");

    let db = ClickDb::read(fixture.config()).expect("read db");
    assert_eq!(db.len(), 2);
    assert_eq!(db.overlay().expect("overlay").root(), fixture.path("click"));
    assert!(matches!(
        fixture.db(&[]).overlay(),
        Err(ClickError::NoDatabase)
    ));
}

#[test]
fn manifest_report_adds_directory() {
    let fixture = Fixture::new();
    let root = fixture.path("click");
    let dir = install_version(&root, "a", "1.0", r#"{"a-app": {}}"#);
    let db = fixture.db(&["click"]);

    let manifest = db.manifest("a", "1.0").expect("manifest");
    assert_eq!(manifest.name, "a");
    let report = db.manifest_report("a", "1.0").expect("report");
    assert_eq!(report["_directory"], dir.to_string_lossy().into_owned());
    assert_eq!(db.app_names("a", "1.0").expect("apps"), vec!["a-app"]);
    assert!(db
        .any_app_running("a", "2.0")
        .expect_err("missing version")
        .is_not_found());
}

#[test]
fn set_version_is_idempotent() {
    let fixture = Fixture::new();
    let root = fixture.path("click");
    install_version(&root, "a", "1.0", "{}");
    let db = fixture.db(&["click"]);
    let registry = UserRegistry::new(&db, Some("user")).expect("registry");

    registry.set_version("a", "1.0").expect("first set");
    let once = tree_snapshot(&root);
    registry.set_version("a", "1.0").expect("second set");
    assert_eq!(tree_snapshot(&root), once);

    assert_eq!(registry.get_version("a").expect("version"), "1.0");
    assert_eq!(
        fs::read_link(registry.overlay_db().expect("overlay db").join("a")).expect("link"),
        root.join("a").join("1.0")
    );
}

#[test]
fn set_version_rejects_bad_identifiers_without_side_effects() {
    let fixture = Fixture::new();
    let root = fixture.path("click");
    install_version(&root, "a", "1.0", "{}");
    let db = fixture.db(&["click"]);
    let registry = UserRegistry::new(&db, Some("user")).expect("registry");

    let before = tree_snapshot(&root);
    assert!(matches!(
        registry.set_version("a/b", "1.0"),
        Err(ClickError::InvalidIdentifier { .. })
    ));
    assert!(matches!(
        registry.set_version("a", "../1.0"),
        Err(ClickError::InvalidIdentifier { .. })
    ));
    assert!(matches!(
        registry.set_version("a", "2.0"),
        Err(ClickError::NotFound { .. })
    ));
    assert_eq!(tree_snapshot(&root), before);
}

#[test]
fn remove_exposes_underlay_registration() {
    let fixture = Fixture::new();
    let base = fixture.path("base");
    let overlay = fixture.path("overlay");
    let a_1_0 = install_version(&base, "a", "1.0", "{}");
    set_current(&base, "a", "1.0");
    install_version(&overlay, "a", "1.1", "{}");
    set_current(&overlay, "a", "1.1");
    register_raw(&base, "user", "a", &a_1_0);
    let db = fixture.db(&["base", "overlay"]);
    let registry = UserRegistry::new(&db, Some("user")).expect("registry");

    registry.set_version("a", "1.1").expect("set overlay version");
    assert_eq!(registry.get_version("a").expect("version"), "1.1");
    assert_eq!(
        db.packages(false).expect("packages")[0].version,
        "1.1"
    );

    assert_eq!(registry.remove("a").expect("remove"), "1.1");
    assert_eq!(
        link_state(&registry.overlay_db().expect("overlay db").join("a")),
        LinkState::Absent
    );
    assert_eq!(registry.get_version("a").expect("underlay version"), "1.0");
}

#[test]
fn remove_hides_registration_pointing_into_underlay() {
    let fixture = Fixture::new();
    let base = fixture.path("base");
    let b_2_0 = install_version(&base, "b", "2.0", "{}");
    fs::create_dir_all(fixture.path("overlay")).expect("create overlay");
    register_raw(&fixture.path("overlay"), "user", "b", &b_2_0);
    let db = fixture.db(&["base", "overlay"]);
    let registry = UserRegistry::new(&db, Some("user")).expect("registry");

    assert_eq!(registry.remove("b").expect("remove"), "2.0");
    let link = registry.overlay_db().expect("overlay db").join("b");
    assert_eq!(fs::read_link(&link).expect("marker"), PathBuf::from("@hidden"));
    assert!(!registry.has_package_name("b").expect("has b"));
    assert!(!registry.is_removable("b").expect("removable b"));
    assert_eq!(registry.lookup("b").expect("lookup"), Lookup::Hidden);
    assert!(matches!(
        registry.get_version("b"),
        Err(ClickError::HiddenPackage { .. })
    ));
    assert!(matches!(
        registry.path("b"),
        Err(ClickError::HiddenPackage { .. })
    ));
    assert!(matches!(
        registry.remove("b"),
        Err(ClickError::NoSuchPackage { .. })
    ));

    registry.set_version("b", "2.0").expect("re-register");
    assert_eq!(registry.get_version("b").expect("version"), "2.0");
    assert!(registry.is_removable("b").expect("removable"));
}

#[test]
fn remove_of_underlay_only_registration_creates_overlay_db() {
    let fixture = Fixture::new();
    let base = fixture.path("preinstalled");
    let a_1_0 = install_version(&base, "a", "1.0", "{}");
    register_raw(&base, "user", "a", &a_1_0);
    let db = fixture.db(&["preinstalled", "click"]);
    let registry = UserRegistry::new(&db, Some("user")).expect("registry");
    let overlay_db = registry.overlay_db().expect("overlay db");
    assert!(!overlay_db.exists());

    registry.remove("a").expect("remove");
    assert!(!registry.has_package_name("a").expect("has a"));
    assert_eq!(
        fs::read_link(overlay_db.join("a")).expect("marker"),
        PathBuf::from(HIDDEN_VERSION)
    );
    assert!(matches!(
        registry.remove("missing"),
        Err(ClickError::NoSuchPackage { .. })
    ));
}

#[test]
fn set_version_matching_underlay_collapses_overlay_entry() {
    let fixture = Fixture::new();
    let base = fixture.path("base");
    let a_1_0 = install_version(&base, "a", "1.0", "{}");
    install_version(&fixture.path("overlay"), "a", "1.1", "{}");
    register_raw(&base, "user", "a", &a_1_0);
    let db = fixture.db(&["base", "overlay"]);
    let registry = UserRegistry::new(&db, Some("user")).expect("registry");
    let overlay_link = registry.overlay_db().expect("overlay db").join("a");

    registry.set_version("a", "1.1").expect("override");
    assert_eq!(link_state(&overlay_link), LinkState::Valid(fixture.path("overlay").join("a").join("1.1")));

    registry.set_version("a", "1.0").expect("restore");
    assert_eq!(link_state(&overlay_link), LinkState::Absent);
    assert_eq!(registry.get_version("a").expect("version"), "1.0");
    assert_eq!(registry.path("a").expect("path"), base.join(".click/users/user/a"));
}

#[test]
fn all_users_registrations_apply_to_each_user() {
    let fixture = Fixture::new();
    let root = fixture.path("click");
    install_version(&root, "a", "1.0", "{}");
    install_version(&root, "b", "1.0", "{}");
    let db = fixture.db(&["click"]);
    let all = UserRegistry::all_users(&db);
    all.set_version("a", "1.0").expect("register for all");
    all.set_version("b", "1.0").expect("register for all");

    let registry = UserRegistry::new(&db, Some("user")).expect("registry");
    assert_eq!(registry.get_version("a").expect("a"), "1.0");
    registry.remove("b").expect("hide b");
    assert_eq!(registry.package_names().expect("names"), vec!["a"]);
    assert_eq!(all.package_names().expect("all names"), vec!["a", "b"]);
    assert!(registry.is_removable("a").expect("removable"));
}

#[test]
fn unreadable_previous_registration_still_allows_switching() {
    let fixture = Fixture::new();
    let root = fixture.path("click");
    install_version(&root, "a", "1.0", "{}");
    register_raw(&root, "user", "a", Path::new("/"));
    let db = fixture.db(&["click"]);
    let registry = UserRegistry::new(&db, Some("user")).expect("registry");

    assert!(matches!(
        registry.lookup("a"),
        Err(ClickError::CorruptState { .. })
    ));
    registry.set_version("a", "1.0").expect("switch");
    assert_eq!(registry.get_version("a").expect("version"), "1.0");
}

#[test]
fn registry_manifest_reports_link_and_removability() {
    let fixture = Fixture::new();
    let root = fixture.path("click");
    install_version(&root, "a", "1.0", "{}");
    let db = fixture.db(&["click"]);
    let registry = UserRegistry::new(&db, Some("user")).expect("registry");
    registry.set_version("a", "1.0").expect("register");

    let manifest = registry.manifest("a").expect("manifest");
    let link = registry.overlay_db().expect("overlay db").join("a");
    assert_eq!(manifest["_directory"], link.to_string_lossy().into_owned());
    assert_eq!(manifest["_removable"], 1);
    assert_eq!(registry.manifests().expect("manifests").len(), 1);
}

#[test]
fn users_snapshot_covers_every_layer() {
    let fixture = Fixture::new();
    let base = fixture.path("base");
    let overlay = fixture.path("overlay");
    let a_1_0 = install_version(&base, "a", "1.0", "{}");
    let b_1_0 = install_version(&overlay, "b", "1.0", "{}");
    register_raw(&base, "alice", "a", &a_1_0);
    register_raw(&overlay, "bob", "b", &b_1_0);
    register_raw(&overlay, ALL_USERS, "a", &a_1_0);
    let db = fixture.db(&["base", "overlay"]);
    let users = Users::new(&db);

    assert_eq!(users.names().expect("names"), vec!["@all", "alice", "bob"]);
    assert!(matches!(
        users.get("carol"),
        Err(ClickError::UnknownUser(_))
    ));

    let mut registrations = users.registrations().expect("registrations");
    registrations.sort();
    let flat: Vec<(&str, &str, &str)> = registrations
        .iter()
        .map(|entry| (entry.user.as_str(), entry.package.as_str(), entry.version.as_str()))
        .collect();
    assert_eq!(
        flat,
        vec![
            ("@all", "a", "1.0"),
            ("alice", "a", "1.0"),
            ("bob", "a", "1.0"),
            ("bob", "b", "1.0"),
        ]
    );
}

#[test]
fn gc_keeps_registered_versions_only() {
    let fixture = Fixture::new();
    let root = fixture.path("click");
    install_version(&root, "a", "1.0", "{}");
    install_version(&root, "a", "1.1", "{}");
    set_current(&root, "a", "1.1");
    install_version(&root, "b", "1.0", "{}");
    let db = fixture.db(&["click"]);
    UserRegistry::new(&db, Some("user"))
        .expect("registry")
        .set_version("a", "1.0")
        .expect("register");

    let report = db.gc(&Users::new(&db)).expect("gc");
    let outcomes: Vec<(&str, &str, RemovalOutcome)> = report
        .iter()
        .map(|entry| (entry.package.as_str(), entry.version.as_str(), entry.outcome))
        .collect();
    assert_eq!(
        outcomes,
        vec![
            ("a", "1.0", RemovalOutcome::Registered),
            ("a", "1.1", RemovalOutcome::Removed),
            ("b", "1.0", RemovalOutcome::Removed),
        ]
    );
    assert!(root.join("a").join("1.0").is_dir());
    assert_eq!(link_state(&root.join("a").join("current")), LinkState::Absent);
    assert!(!root.join("b").exists());
}

#[test]
fn corrupt_registration_does_not_block_reads_or_gc() {
    let fixture = Fixture::new();
    let root = fixture.path("click");
    install_version(&root, "a", "1.0", "{}");
    install_version(&root, "b", "1.0", "{}");
    let db = fixture.db(&["click"]);
    UserRegistry::new(&db, Some("alice"))
        .expect("registry")
        .set_version("a", "1.0")
        .expect("register");
    register_raw(&root, "bob", "zzz", Path::new("/"));

    let bob = UserRegistry::new(&db, Some("bob")).expect("registry");
    assert!(bob.package_names().expect("names").is_empty());
    assert!(bob.versions().expect("versions").is_empty());
    assert!(matches!(
        bob.get_version("zzz"),
        Err(ClickError::CorruptState { .. })
    ));

    let report = db.gc(&Users::new(&db)).expect("gc");
    let outcomes: Vec<(&str, &str, RemovalOutcome)> = report
        .iter()
        .map(|entry| (entry.package.as_str(), entry.version.as_str(), entry.outcome))
        .collect();
    assert_eq!(
        outcomes,
        vec![
            ("a", "1.0", RemovalOutcome::Registered),
            ("b", "1.0", RemovalOutcome::Removed),
        ]
    );
    assert!(root.join("a").join("1.0").is_dir());
    assert!(!root.join("b").exists());
}

#[test]
fn gc_runs_system_remove_hooks_only_for_deleted_versions() {
    let fixture = Fixture::new();
    let root = fixture.path("click");
    let links = fixture.path("links");
    fixture.write_hook(
        "test",
        &format!("Pattern: {}/${{id}}.test\n", links.display()),
    );
    install_version(&root, "a", "1.0", r#"{"app": {"test": "target"}}"#);
    install_version(&root, "b", "1.0", r#"{"app": {"test": "target"}}"#);
    let db = fixture.db(&["click"]);
    let engine = HookEngine::new(&db);
    engine
        .run_install_hooks("a", None, Some("1.0"), None)
        .expect("install a hooks");
    engine
        .run_install_hooks("b", None, Some("1.0"), None)
        .expect("install b hooks");
    fixture.supervisor.set_running("b_app_1.0", true);

    let report = db.gc(&Users::new(&db)).expect("gc");
    let outcomes: Vec<RemovalOutcome> = report.iter().map(|entry| entry.outcome).collect();
    assert_eq!(outcomes, vec![RemovalOutcome::Removed, RemovalOutcome::InUse]);
    assert_eq!(
        list_dir_or_empty(&links).expect("links"),
        vec!["b_app_1.0.test"]
    );
}

#[test]
fn layer_removal_callback_runs_only_before_deletion() {
    let fixture = Fixture::new();
    let root = fixture.path("click");
    install_version(&root, "a", "1.0", r#"{"app": {}}"#);
    let layer = InstallationLayer::new(&root);
    let calls = Mutex::new(0);
    let count = || -> Result<()> {
        *calls.lock().expect("lock calls") += 1;
        Ok(())
    };

    let outcome = layer
        .remove_version_if_unreferenced("a", "2.0", fixture.supervisor.as_ref(), count)
        .expect("absent");
    assert_eq!(outcome, RemovalOutcome::Absent);

    fixture.supervisor.set_running("a_app_1.0", true);
    let outcome = layer
        .remove_version_if_unreferenced("a", "1.0", fixture.supervisor.as_ref(), count)
        .expect("in use");
    assert_eq!(outcome, RemovalOutcome::InUse);
    assert_eq!(*calls.lock().expect("lock calls"), 0);

    fixture.supervisor.set_running("a_app_1.0", false);
    let err = layer
        .remove_version_if_unreferenced("a", "1.0", fixture.supervisor.as_ref(), || {
            Err(ClickError::HookFailed {
                hook: "test".to_string(),
                reason: "exit status 1".to_string(),
            })
        })
        .expect_err("callback failure");
    assert!(matches!(err, ClickError::HookFailed { .. }));
    assert!(root.join("a").join("1.0").is_dir());

    let outcome = layer
        .remove_version_if_unreferenced("a", "1.0", fixture.supervisor.as_ref(), count)
        .expect("remove");
    assert_eq!(outcome, RemovalOutcome::Removed);
    assert_eq!(*calls.lock().expect("lock calls"), 1);
    assert!(!root.join("a").exists());
}

#[test]
fn gc_defers_running_versions_until_they_stop() {
    let fixture = Fixture::new();
    let root = fixture.path("click");
    install_version(&root, "a", "1.0", r#"{"app": {}}"#);
    let db = fixture.db(&["click"]);
    fixture.supervisor.set_running("a_app_1.0", true);

    let outcome = db.maybe_remove(&Users::new(&db), "a", "1.0").expect("first pass");
    assert_eq!(outcome, RemovalOutcome::InUse);
    assert!(root.join("a").join("1.0").is_dir());
    let marker = root.join(".click").join("users").join(GC_IN_USE_USER).join("a");
    assert_eq!(link_state(&marker), LinkState::Valid(root.join("a").join("1.0")));

    fixture.supervisor.set_running("a_app_1.0", false);
    let report = db.gc(&Users::new(&db)).expect("second pass");
    assert_eq!(report.len(), 1);
    assert_eq!(report[0].outcome, RemovalOutcome::Removed);
    assert_eq!(link_state(&marker), LinkState::Absent);
    assert!(!root.join("a").exists());
}

#[test]
fn pattern_expansion_and_matching() {
    let mut values = BTreeMap::new();
    values.insert("id", "pkg_app_1.0".to_string());
    assert_eq!(
        expand_pattern("/usr/share/${id}/$${id}/${missing}x/", &values),
        "/usr/share/pkg_app_1.0/${id}/x"
    );
    assert_eq!(expand_pattern("/costs/$5", &values), "/costs/$5");

    let unbound = BTreeMap::new();
    let found = possible_expansion("/out/pkg_app_1.0.test", "/out/${id}.test", &unbound)
        .expect("matches");
    assert_eq!(found["id"], "pkg_app_1.0");
    assert!(possible_expansion("/elsewhere/x.test", "/out/${id}.test", &unbound).is_none());

    let mut bound = BTreeMap::new();
    bound.insert("user", "alice".to_string());
    assert!(possible_expansion("/out/bob/x", "/out/${user}/${id}", &bound).is_none());
    let found = possible_expansion("/out/alice/x", "/out/${user}/${id}", &bound)
        .expect("bound match");
    assert_eq!(found.get("id").map(String::as_str), Some("x"));
    assert!(!found.contains_key("user"));
}

#[test]
fn install_hooks_are_symmetric() {
    let fixture = Fixture::new();
    let out = fixture.path("out");
    fixture.write_hook("test", &format!("Pattern: {}/${{id}}.test\n", out.display()));
    let root = fixture.path("click");
    install_version(&root, "pkg", "1.0", r#"{"app": {"test": "target"}}"#);
    let db = fixture.db(&["click"]);
    let engine = HookEngine::new(&db);

    engine
        .run_install_hooks("pkg", None, Some("1.0"), None)
        .expect("install hooks");
    assert_eq!(list_dir_or_empty(&out).expect("out"), vec!["pkg_app_1.0.test"]);
    assert_eq!(
        fs::read_link(out.join("pkg_app_1.0.test")).expect("hook link"),
        root.join("pkg").join("1.0").join("target")
    );

    engine
        .run_install_hooks("pkg", Some("1.0"), None, None)
        .expect("remove hooks");
    assert!(list_dir_or_empty(&out).expect("out").is_empty());
}

#[test]
fn single_version_hooks_drop_previous_versions() {
    let fixture = Fixture::new();
    let out = fixture.path("out");
    fixture.write_hook(
        "test",
        &format!("Pattern: {}/${{id}}.test\nSingle-Version: yes\n", out.display()),
    );
    fixture.write_hook(
        "other",
        &format!("Pattern: {}/${{id}}.other\n", out.display()),
    );
    let root = fixture.path("click");
    install_version(&root, "pkg", "1.0", r#"{"app": {"test": "t", "other": "o"}}"#);
    install_version(&root, "pkg", "1.1", r#"{"app": {"test": "t"}}"#);
    let db = fixture.db(&["click"]);
    let engine = HookEngine::new(&db);

    engine
        .run_install_hooks("pkg", None, Some("1.0"), None)
        .expect("install 1.0");
    engine
        .run_install_hooks("pkg", Some("1.0"), Some("1.1"), None)
        .expect("upgrade");
    assert_eq!(list_dir_or_empty(&out).expect("out"), vec!["pkg_app_1.1.test"]);
}

#[test]
fn install_rejects_ambiguous_identifiers() {
    let fixture = Fixture::new();
    fixture.write_hook("test", "Pattern: /nonexistent/${id}\n");
    let db = fixture.db(&["click"]);
    let hook = HookDescriptor::open(&db, "test").expect("hook");
    let engine = HookEngine::new(&db);

    for (package, version, app) in [("a_b", "1.0", "app"), ("a", "1/0", "app"), ("a", "1.0", "x_y")] {
        assert!(matches!(
            engine.install_package(&hook, package, version, app, "target", None),
            Err(ClickError::InvalidIdentifier { .. })
        ));
    }
    assert!(matches!(
        HookDescriptor::open(&db, "absent"),
        Err(ClickError::HookNotFound(_))
    ));
}

#[test]
fn user_level_hooks_follow_registration() {
    let fixture = Fixture::new();
    let out = fixture.path("out");
    fixture.write_hook(
        "test",
        &format!("User-Level: yes\nPattern: {}/${{user}}/${{id}}.json\n", out.display()),
    );
    let root = fixture.path("click");
    install_version(&root, "com.example.hooked", "1.0", r#"{"app": {"test": "target.json"}}"#);
    let db = fixture.db(&["click"]);
    let registry = UserRegistry::new(&db, Some("user")).expect("registry");

    registry
        .set_version("com.example.hooked", "1.0")
        .expect("register");
    let link = out.join("user").join("com.example.hooked_app_1.0.json");
    assert_eq!(
        fs::read_link(&link).expect("hook link"),
        registry
            .overlay_db()
            .expect("overlay db")
            .join("com.example.hooked")
            .join("target.json")
    );

    registry.remove("com.example.hooked").expect("remove");
    assert_eq!(link_state(&link), LinkState::Absent);
    assert_eq!(fixture.supervisor.stopped(), vec!["com.example.hooked_app_1.0"]);
}

#[test]
fn sync_removes_stale_links_and_runs_exec() {
    let fixture = Fixture::new();
    let out = fixture.path("out");
    let marker = fixture.path("ran");
    fixture.write_hook(
        "test",
        &format!(
            "Pattern: {}/${{id}}.test\nExec: touch {}\n",
            out.display(),
            marker.display()
        ),
    );
    let root = fixture.path("click");
    install_version(&root, "pkg", "1.0", r#"{"app": {"test": "target"}}"#);
    set_current(&root, "pkg", "1.0");
    fs::create_dir_all(&out).expect("create out");
    symlink("/stale", out.join("pkg_app_0.9.test")).expect("stale link");
    fs::write(out.join("unrelated"), "").expect("unrelated file");
    let db = fixture.db(&["click"]);

    HookEngine::new(&db).run_system_hooks().expect("system hooks");
    assert_eq!(
        list_dir_or_empty(&out).expect("out"),
        vec!["pkg_app_1.0.test", "unrelated"]
    );
    assert!(marker.exists());
}

#[test]
fn failing_exec_and_triggers_are_errors() {
    let fixture = Fixture::new();
    fixture.write_hook("fails", "Pattern: /nonexistent/${id}\nExec: exit 3\n");
    fixture.write_hook("trigger", "Pattern: /nonexistent/${id}\nTrigger: yes\n");
    let db = fixture.db(&["click"]);
    let engine = HookEngine::new(&db);

    for name in ["fails", "trigger"] {
        let hook = HookDescriptor::open(&db, name).expect("hook");
        assert!(matches!(
            engine.remove_package(&hook, "pkg", "1.0", "app", None),
            Err(ClickError::HookFailed { .. })
        ));
    }
}

#[test]
fn install_all_projects_every_current_package() {
    let fixture = Fixture::new();
    let out = fixture.path("out");
    fixture.write_hook(
        "desktop",
        &format!("Pattern: {}/${{short-id}}.desktop\nSingle-Version: yes\n", out.display()),
    );
    let root = fixture.path("click");
    for package in ["a", "b"] {
        install_version(&root, package, "1.0", r#"{"app": {"desktop": "app.desktop"}}"#);
        set_current(&root, package, "1.0");
    }
    install_version(&root, "c", "1.0", r#"{"app": {"other": "x"}}"#);
    set_current(&root, "c", "1.0");
    let db = fixture.db(&["click"]);
    let engine = HookEngine::new(&db);
    let hook = HookDescriptor::open(&db, "desktop").expect("hook");

    engine.install_all(&hook, None).expect("install all");
    assert_eq!(
        list_dir_or_empty(&out).expect("out"),
        vec!["a_app.desktop", "b_app.desktop"]
    );
    engine.remove_all(&hook, None).expect("remove all");
    assert!(list_dir_or_empty(&out).expect("out").is_empty());
}

#[test]
fn mode_bits_permission_check_uses_nearest_ancestor() {
    let temp = tempfile::tempdir().expect("tempdir");
    let user = current_user_name().expect("current user");
    let checker = ModeBitsPermissionCheck;
    assert!(checker
        .can_write(&temp.path().join("missing").join("child"), &user)
        .expect("check"));
    check_permission(&checker, temp.path(), &user).expect("writable");
}

/// Records what the overlay registry holds for a package at the moment its
/// apps are stopped.
struct RegistryAtStop {
    registry_db: PathBuf,
    seen: Mutex<Vec<(String, LinkState)>>,
}

impl AppSupervisor for RegistryAtStop {
    fn is_running(&self, _package: &str, _app_name: &str, _version: &str) -> Result<bool> {
        Ok(false)
    }

    fn stop(&self, package: &str, _app_name: &str, _version: &str) -> Result<()> {
        let state = link_state(&self.registry_db.join(package));
        self.seen
            .lock()
            .expect("lock seen")
            .push((package.to_string(), state));
        Ok(())
    }
}

#[test]
fn remove_stops_apps_before_touching_the_registration() {
    let fixture = Fixture::new();
    let base = fixture.path("preinstalled");
    let overlay = fixture.path("click");
    let a_1_0 = install_version(&base, "a", "1.0", r#"{"app": {}}"#);
    register_raw(&base, "user", "a", &a_1_0);
    let b_1_0 = install_version(&overlay, "b", "1.0", r#"{"app": {}}"#);
    register_raw(&overlay, "user", "b", &b_1_0);
    let supervisor = Arc::new(RegistryAtStop {
        registry_db: overlay.join(".click").join("users").join("user"),
        seen: Mutex::new(Vec::new()),
    });
    let mut db = ClickDb::new(fixture.config())
        .with_privilege_mode(PrivilegeMode::Inherit)
        .with_supervisor(supervisor.clone());
    db.add(base);
    db.add(overlay);
    let registry = UserRegistry::new(&db, Some("user")).expect("registry");

    assert_eq!(registry.remove("a").expect("remove a"), "1.0");
    assert_eq!(registry.remove("b").expect("remove b"), "1.0");

    assert_eq!(
        *supervisor.seen.lock().expect("lock seen"),
        vec![
            ("a".to_string(), LinkState::Absent),
            ("b".to_string(), LinkState::Valid(b_1_0)),
        ]
    );
    assert_eq!(registry.lookup("a").expect("lookup a"), Lookup::Hidden);
    assert_eq!(registry.lookup("b").expect("lookup b"), Lookup::NotFound);
}

#[test]
fn remove_for_current_user_clears_their_cache() {
    let fixture = Fixture::new();
    let user = current_user_name().expect("current user");
    let cache_home = fixture.path("cache");
    let cache = cache_home.join("cached-pkg");
    fs::create_dir_all(cache.join("nested")).expect("create cache");
    fs::write(cache.join("nested").join("data"), "x").expect("write cache");
    std::env::set_var("XDG_CACHE_HOME", &cache_home);
    let root = fixture.path("click");
    install_version(&root, "cached-pkg", "1.0", "{}");
    let db = fixture.db(&["click"]);
    let registry = UserRegistry::new(&db, Some(user.as_str())).expect("registry");
    registry.set_version("cached-pkg", "1.0").expect("register");

    registry.remove("cached-pkg").expect("remove");

    assert!(!cache.exists());
    assert!(cache_home.is_dir());
}
