mod common;

use common::{pair, payload};
use ferry_core::{ControlRequest, FerryError, InfoKind, SubmitRequest};
use ferry_types::{ErrorCode, FileEntry};

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_packet_is_echoed() {
    let pair = pair(4).await;
    let reply = pair
        .alpha
        .core
        .remote_control("beta", ControlRequest::Test("hello".into()))
        .await
        .unwrap();
    assert_eq!(reply.code, ErrorCode::CompleteOk);
    assert_eq!(reply.info, "hello");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn information_lists_received_files() {
    let pair = pair(4).await;
    let alpha = &pair.alpha.core;
    for name in ["a.csv", "b.csv", "c.txt"] {
        pair.alpha.write_out(name, &payload(500));
        let result = alpha
            .direct_transfer(SubmitRequest::new("push", "beta", name))
            .await
            .unwrap();
        assert!(result.success, "{:?}", result);
    }

    let info = |kind, filename: &str| ControlRequest::Information {
        kind,
        rule_id: "push".into(),
        filename: Some(filename.into()),
        key: None,
    };

    let reply = alpha.remote_control("beta", info(InfoKind::List, "*.csv")).await.unwrap();
    let names: Vec<String> = serde_json::from_str(&reply.info).unwrap();
    assert_eq!(names, ["a.csv", "b.csv"]);

    let reply = alpha.remote_control("beta", info(InfoKind::Exist, "c.txt")).await.unwrap();
    assert_eq!(reply.info, "true");
    let reply = alpha.remote_control("beta", info(InfoKind::Exist, "d.txt")).await.unwrap();
    assert_eq!(reply.info, "false");

    let reply = alpha.remote_control("beta", info(InfoKind::MlsDetail, "a.csv")).await.unwrap();
    let entry: FileEntry = serde_json::from_str(&reply.info).unwrap();
    assert_eq!(entry.name, "a.csv");
    assert_eq!(entry.size, 500);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn bandwidth_needs_the_system_role() {
    let pair = pair(4).await;
    let err = pair
        .alpha
        .core
        .remote_control("beta", ControlRequest::Bandwidth(None))
        .await
        .unwrap_err();
    assert!(matches!(err, FerryError::Authentication(_)), "{err}");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn blocked_host_refuses_transfers() {
    let pair = pair(4).await;
    let alpha = &pair.alpha.core;
    pair.alpha.write_out("x.bin", &payload(1000));
    pair.beta.core.engine().network.set_blocked(true);

    let result = alpha
        .direct_transfer(SubmitRequest::new("push", "beta", "x.bin"))
        .await
        .unwrap();
    assert!(!result.success);
    assert_eq!(result.code, ErrorCode::ServerOverloaded);
    // Overload is worth retrying, up to the configured attempts.
    assert_eq!(result.attempts, 2);

    pair.beta.core.engine().network.set_blocked(false);
    let result = alpha
        .direct_transfer(SubmitRequest::new("push", "beta", "x.bin"))
        .await
        .unwrap();
    assert!(result.success, "{:?}", result);
}
