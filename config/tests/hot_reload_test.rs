use config::{ChangeEvent, ChangeHandler, ChangeKind, ConfigManager, ConfigWatcher, ManagerSettings};
use errors::ConfigError;
use parking_lot::Mutex;
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use testing::{ConfigTree, wait_until};

#[derive(Default)]
struct Recorder {
    reloads: AtomicUsize,
    failures: AtomicUsize,
    kinds: Mutex<Vec<ChangeKind>>
}

impl ChangeHandler for Recorder {
    fn on_event(&self, event: &ChangeEvent) -> anyhow::Result<()> {
        if event.kind == ChangeKind::Reloaded {
            self.reloads.fetch_add(1, Ordering::SeqCst);
        }
        self.kinds.lock().push(event.kind);
        Ok(())
    }

    fn on_error(&self, _error: &ConfigError) -> anyhow::Result<()> {
        self.failures.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

fn watcher(tree: &ConfigTree, debounce: Duration) -> (Arc<ConfigWatcher>, Arc<Recorder>) {
    testing::init_tracing();
    let manager = ConfigManager::new(&ManagerSettings::for_dir(tree.path(), "development"))
        .with_env(Arc::new(HashMap::<String, String>::new()));
    manager.load().unwrap();
    let watcher = Arc::new(ConfigWatcher::new(Arc::new(manager), debounce, 100).ignoring(tree.backup_dir()));
    let recorder = Arc::new(Recorder::default());
    watcher.add_handler(recorder.clone());
    (watcher, recorder)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_burst_of_writes_reloads_once() {
    let tree = ConfigTree::standard().unwrap();
    let (watcher, recorder) = watcher(&tree, Duration::from_millis(300));
    watcher.start().unwrap();

    for workers in 2..=6 {
        tree.write("override.yaml", &format!("api:\n  workers: {workers}\n")).unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;
    }

    let reloaded = wait_until(Duration::from_secs(10), || {
        recorder.reloads.load(Ordering::SeqCst) >= 1
    })
    .await;
    assert!(reloaded, "no reload observed");
    tokio::time::sleep(Duration::from_millis(900)).await;

    assert_eq!(recorder.reloads.load(Ordering::SeqCst), 1);
    let event = watcher
        .recent_events(100)
        .into_iter()
        .rfind(|e| e.kind == ChangeKind::Reloaded)
        .unwrap();
    assert_eq!(event.new_config.unwrap()["api"]["workers"], json!(6));
    assert_eq!(event.old_config.unwrap()["api"]["workers"], json!(1));
    watcher.stop();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_ignored_files_do_not_trigger_reload() {
    let tree = ConfigTree::standard().unwrap();
    let (watcher, recorder) = watcher(&tree, Duration::from_millis(100));
    watcher.start().unwrap();

    tree.write("notes.txt", "scratch").unwrap();
    tree.write(".default.yaml.swp", "x").unwrap();
    tree.write("backups/main_v1_0.dat", "x").unwrap();
    tokio::time::sleep(Duration::from_millis(600)).await;

    assert_eq!(recorder.reloads.load(Ordering::SeqCst), 0);
    assert!(recorder.kinds.lock().is_empty());
    watcher.stop();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_invalid_change_reports_error_and_keeps_config() {
    let tree = ConfigTree::standard().unwrap();
    let (watcher, recorder) = watcher(&tree, Duration::from_millis(100));
    watcher.start().unwrap();

    tree.write("override.yaml", "api:\n  workers: 900\n").unwrap();
    let failed = wait_until(Duration::from_secs(10), || {
        recorder.failures.load(Ordering::SeqCst) >= 1
    })
    .await;
    assert!(failed, "reload failure was not reported");
    assert_eq!(recorder.reloads.load(Ordering::SeqCst), 0);
    watcher.stop();
}

#[tokio::test]
async fn test_stop_is_idempotent_and_restartable() {
    let tree = ConfigTree::standard().unwrap();
    let (watcher, _recorder) = watcher(&tree, Duration::from_millis(50));
    watcher.start().unwrap();
    watcher.start().unwrap();
    assert!(watcher.is_watching());

    watcher.stop();
    watcher.stop();
    assert!(!watcher.is_watching());
    assert!(!watcher.notify_change(ChangeKind::Modified, tree.join("default.yaml")));

    watcher.start().unwrap();
    assert!(watcher.is_watching());
    watcher.stop();
}
