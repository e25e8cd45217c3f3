//! Integration tests for spec file watching.

use std::fs::File;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use tempfile::TempDir;

use warden_agent::loader::{ReloadGuard, SpecWatcher};
use warden_agent::spec::{BackendConfig, SpecReload};

const LOBBY: &str = r#"
maintenance_interval_secs = 60

[[instances]]
name = "lobby"

[instances.backend]
kind = "docker"
image = "itzg/minecraft-server:java21"
ports = ["25566:25565"]
address = "127.0.0.1:25566"

[instances.lifecycle]
reconciliation_behavior = "force"

[instances.lifecycle.timeouts]
reconciliation_grace_period_secs = 30
"#;

const LOBBY_AND_CREATIVE: &str = r#"
[[instances]]
name = "lobby"
backend = { kind = "docker", image = "itzg/minecraft-server:java21" }

[[instances]]
name = "creative"
backend = { kind = "jar", jar_file = "paper.jar", java_flags = ["-Xmx2G"], address = "127.0.0.1:30000" }
"#;

fn kinds() -> Vec<String> {
    vec!["docker".to_string(), "cmd".to_string(), "jar".to_string()]
}

/// Write `contents` and push the modification time forward so the change is
/// visible regardless of filesystem timestamp granularity.
fn write_spec(path: &Path, contents: &str, bump_secs: u64) {
    std::fs::write(path, contents).unwrap();
    let file = File::options().write(true).open(path).unwrap();
    file.set_modified(SystemTime::now() + Duration::from_secs(bump_secs))
        .unwrap();
}

fn watcher(dir: &TempDir) -> SpecWatcher {
    SpecWatcher::new(dir.path().join("warden.toml"), Duration::from_millis(100), kinds())
}

#[tokio::test]
async fn test_initial_load() {
    let dir = TempDir::new().unwrap();
    write_spec(&dir.path().join("warden.toml"), LOBBY, 0);
    let mut watcher = watcher(&dir);

    let reload = watcher.load().await;
    assert!(reload.allowed);
    assert!(reload.old.instances.is_empty());
    assert_eq!(reload.new.maintenance_interval_secs, 60);

    let lobby = reload.new.instance("lobby").unwrap();
    assert_eq!(lobby.lifecycle.timeouts.reconciliation_grace_period_secs, 30);
    match &lobby.backend {
        BackendConfig::Docker(docker) => {
            assert_eq!(docker.ports, vec!["25566:25565"]);
            assert_eq!(docker.host, "unix:///var/run/docker.sock");
        }
        other => panic!("unexpected backend {other:?}"),
    }
}

#[tokio::test]
async fn test_missing_file_loads_empty_fleet() {
    let dir = TempDir::new().unwrap();
    let mut watcher = watcher(&dir);

    let reload = watcher.load().await;
    assert!(reload.allowed);
    assert!(reload.new.instances.is_empty());
}

#[tokio::test]
async fn test_poll_detects_changes() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("warden.toml");
    write_spec(&path, LOBBY, 0);
    let mut watcher = watcher(&dir);
    watcher.load().await;

    assert!(watcher.poll().await.is_none());

    write_spec(&path, LOBBY_AND_CREATIVE, 10);
    let reload = watcher.poll().await.unwrap();
    assert!(reload.allowed);
    assert_eq!(reload.old.instances.len(), 1);
    assert_eq!(reload.new.instances.len(), 2);
    assert_eq!(watcher.current(), reload.new);

    // Touching the file without changing it emits nothing.
    write_spec(&path, LOBBY_AND_CREATIVE, 20);
    assert!(watcher.poll().await.is_none());
}

#[tokio::test]
async fn test_invalid_spec_is_denied() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("warden.toml");
    write_spec(&path, LOBBY, 0);
    let mut watcher = watcher(&dir);
    let initial = watcher.load().await;

    write_spec(&path, "[[instances]]\nname = 42\n", 10);
    let reload = watcher.poll().await.unwrap();
    assert!(!reload.allowed);
    assert_eq!(watcher.current(), initial.new);

    write_spec(
        &path,
        "[[instances]]\nname = \"edge\"\nbackend = { kind = \"kubernetes\" }\n",
        20,
    );
    let reload = watcher.poll().await.unwrap();
    assert!(!reload.allowed);
    assert_eq!(watcher.current(), initial.new);
}

struct NoEmptyFleet;

impl ReloadGuard for NoEmptyFleet {
    fn allow(&self, reload: &SpecReload) -> bool {
        !reload.new.instances.is_empty()
    }
}

#[tokio::test]
async fn test_guard_vetoes_reload() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("warden.toml");
    write_spec(&path, LOBBY, 0);
    let mut watcher = watcher(&dir).with_guard(Arc::new(NoEmptyFleet));
    let initial = watcher.load().await;
    assert!(initial.allowed);

    write_spec(&path, "", 10);
    let reload = watcher.poll().await.unwrap();
    assert!(!reload.allowed);
    assert_eq!(watcher.current(), initial.new);
}

#[tokio::test]
async fn test_run_forwards_reloads() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("warden.toml");
    let mut watcher = watcher(&dir);
    watcher.load().await;

    let (tx, mut rx) = tokio::sync::mpsc::channel(4);
    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    let handle = tokio::spawn(watcher.run(tx, shutdown_rx));

    write_spec(&path, LOBBY, 10);
    let reload = tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert!(reload.allowed);
    assert_eq!(reload.new.instances.len(), 1);

    shutdown_tx.send(true).unwrap();
    handle.await.unwrap();
}
