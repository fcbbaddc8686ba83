use config::notifications::HistoryFilter;
use config::{
    ConfigSystem, ManagerSettings, NotificationMessage, NotificationType, VersionType,
};
use serde_json::json;
use std::time::Duration;
use testing::{ConfigTree, wait_until};

fn settings(tree: &ConfigTree) -> ManagerSettings {
    testing::init_tracing();
    let mut settings = ManagerSettings::for_dir(tree.path(), "development");
    settings.debounce_ms = 150;
    settings
}

fn drain(rx: &mut tokio::sync::mpsc::Receiver<String>) -> Vec<NotificationMessage> {
    let mut messages = Vec::new();
    while let Ok(payload) = rx.try_recv() {
        messages.push(serde_json::from_str(&payload).unwrap());
    }
    messages
}

#[test]
fn test_development_scenario_with_rollback() {
    let tree = ConfigTree::standard().unwrap();
    let system = ConfigSystem::new(settings(&tree)).unwrap();
    system.load().unwrap();

    let (_, mut rx) = system.notifications().subscribe_channel(64).unwrap();
    let welcome = drain(&mut rx);
    assert_eq!(welcome.len(), 1);
    assert_eq!(welcome[0].kind, NotificationType::SystemStatus);

    tree.write("override.yaml", "api:\n  workers: 8\n").unwrap();
    system.reload().unwrap();
    assert_eq!(system.get_value("api.workers", json!(null)), json!(8));
    assert_eq!(system.get_history(10).len(), 2);

    tree.remove("override.yaml").unwrap();
    let outcome = system.rollback_to_version(1, "ops").unwrap();
    assert_eq!(outcome.backup.version, 3);
    assert_eq!(outcome.backup.version_type, VersionType::Rollback);
    assert_eq!(system.get_value("api.workers", json!(null)), json!(1));

    let kinds: Vec<NotificationType> = drain(&mut rx).into_iter().map(|m| m.kind).collect();
    assert_eq!(
        kinds,
        vec![
            NotificationType::ConfigReloaded,
            NotificationType::Rollback,
            NotificationType::ConfigReloaded
        ]
    );
    assert_eq!(system.get_history(10).len(), 3);
}

#[test]
fn test_failed_rollback_leaves_live_file() {
    let tree = ConfigTree::standard().unwrap();
    let system = ConfigSystem::new(settings(&tree)).unwrap();
    system.load().unwrap();
    let before = tree.read("default.yaml").unwrap();

    assert!(system.rollback_to_version(7, "ops").is_err());
    assert_eq!(tree.read("default.yaml").unwrap(), before);
    assert!(!tree.exists("restored.json"));
    let rollbacks = system.notifications().history(&HistoryFilter {
        kind: Some(NotificationType::Rollback),
        ..HistoryFilter::default()
    });
    assert!(rollbacks.is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_file_change_is_versioned_and_broadcast() {
    let tree = ConfigTree::standard().unwrap();
    let system = ConfigSystem::new(settings(&tree)).unwrap();
    system.load().unwrap();
    system.start_watching().unwrap();
    let (_, mut rx) = system.notifications().subscribe_channel(256).unwrap();

    tree.write("override.yaml", "logging:\n  level: WARNING\n").unwrap();
    let versioned = wait_until(Duration::from_secs(10), || system.get_history(10).len() == 2).await;
    assert!(versioned, "reload was not versioned");
    assert_eq!(system.get_value("logging.level", json!(null)), json!("WARNING"));

    system.stop_watching();
    let messages = drain(&mut rx);
    assert!(messages.iter().any(|m| m.kind == NotificationType::ConfigChanged));
    let reloaded = messages
        .iter()
        .find(|m| m.kind == NotificationType::ConfigReloaded)
        .unwrap();
    assert_eq!(reloaded.data["changed_keys"], json!(["logging"]));

    let latest = &system.get_history(1)[0];
    assert_eq!(latest.version_type, VersionType::Auto);
    assert_eq!(latest.author, "watcher");
}
