mod common;

use common::{next_event, pair, payload};
use ferry_core::spooled::{SpoolMode, SpooledConfig, SpooledWatcher};
use ferry_types::{CoreEvent, UpdatedInfo};
use std::path::Path;
use std::time::Duration;

fn spool_config(root: &Path, mode: SpoolMode, ignore_already_used: bool) -> SpooledConfig {
    let dir = root.join("spool");
    std::fs::create_dir_all(&dir).unwrap();
    SpooledConfig {
        name: "outbox".into(),
        directories: vec![dir],
        status_file: root.join("spool.json"),
        stop_file: root.join("spool.stop"),
        elapse_ms: 50,
        min_size: 100,
        mode,
        limit_parallel: 2,
        ignore_already_used,
        rule_id: "push".into(),
        hosts: vec!["beta".into()],
        ..Default::default()
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn direct_spool_delivers_each_file_once() {
    let pair = pair(4).await;
    let config = spool_config(&pair.alpha.root, SpoolMode::Direct, false);
    let file = config.directories[0].join("drop.bin");
    let mut watcher = SpooledWatcher::new(pair.alpha.core.clone(), config).await.unwrap();

    std::fs::write(&file, payload(200)).unwrap();
    assert_eq!(watcher.scan_once().await.unwrap(), 0);
    assert_eq!(watcher.scan_once().await.unwrap(), 1);
    assert_eq!(std::fs::read(pair.beta.in_dir().join("drop.bin")).unwrap(), payload(200));

    std::fs::write(&file, payload(300)).unwrap();
    for _ in 0..3 {
        assert_eq!(watcher.scan_once().await.unwrap(), 0);
    }
    assert_eq!(watcher.stats().sent(), 1);
    assert_eq!(watcher.stats().errors(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn changed_file_goes_out_again_when_asked() {
    let pair = pair(4).await;
    let config = spool_config(&pair.alpha.root, SpoolMode::Direct, true);
    let file = config.directories[0].join("drop.bin");
    let mut watcher = SpooledWatcher::new(pair.alpha.core.clone(), config).await.unwrap();

    std::fs::write(&file, payload(200)).unwrap();
    watcher.scan_once().await.unwrap();
    assert_eq!(watcher.scan_once().await.unwrap(), 1);

    std::fs::write(&file, payload(300)).unwrap();
    watcher.scan_once().await.unwrap();
    assert_eq!(watcher.scan_once().await.unwrap(), 1);
    assert_eq!(watcher.stats().sent(), 2);
    assert_eq!(std::fs::read(pair.beta.in_dir().join("drop.bin")).unwrap(), payload(300));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn queued_spool_runs_until_stop_file() {
    let pair = pair(4).await;
    let alpha = pair.alpha.core.clone();
    let config = spool_config(&pair.alpha.root, SpoolMode::Submit, false);
    let dir = config.directories[0].clone();
    let stop_file = config.stop_file.clone();
    let mut events = alpha.subscribe();
    alpha.start_commander();

    let watcher = SpooledWatcher::new(alpha.clone(), config).await.unwrap();
    let running = tokio::spawn(watcher.run());
    std::fs::write(dir.join("one.bin"), payload(1000)).unwrap();

    let result = next_event(&mut events, |event| match event {
        CoreEvent::TransferCompleted { result } => Some(result.clone()),
        _ => None,
    })
    .await;
    assert!(result.success, "{:?}", result);

    std::fs::write(&stop_file, b"").unwrap();
    let stats = tokio::time::timeout(Duration::from_secs(5), running)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(stats.sent(), 1);

    let runner = alpha.status(&result.key).await.unwrap();
    assert_eq!(runner.updated_info, UpdatedInfo::Done);
    assert_eq!(std::fs::read(pair.beta.in_dir().join("one.bin")).unwrap(), payload(1000));
    alpha.shutdown().await;
}
