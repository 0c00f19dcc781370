use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    body::Body,
    extract::connect_info::MockConnectInfo,
    http::{Request, StatusCode},
    Router,
};
use http_body_util::BodyExt;
use serde_json::Value;
use tower::ServiceExt;

use seaweed_master::config::MasterOptions;
use seaweed_master::master_server::MasterServer;
use seaweed_master::peers::resolve_peers;
use seaweed_master::raft::{RaftServer, RaftTimings};
use seaweed_master::MasterError;

fn create_master(options: MasterOptions, raw_peers: &str) -> Arc<MasterServer> {
    let (me, peers) = resolve_peers("127.0.0.1", 9333, raw_peers).unwrap();
    MasterServer::new(options, peers, me, None).unwrap()
}

fn create_raft(master: &MasterServer, dir: &Path) -> Arc<RaftServer> {
    RaftServer::new(
        None,
        master.peers().clone(),
        master.self_address().clone(),
        dir,
        master.topology().clone(),
        RaftTimings::from_pulse_seconds(1),
    )
    .unwrap()
}

/// Routes as served, with the client appearing to connect from `remote`.
fn create_test_app(master: &Arc<MasterServer>, remote: [u8; 4]) -> Router {
    let mut app = master.router();
    if let Some(raft) = master.raft() {
        app = app.merge(raft.status_router());
    }
    app.layer(MockConnectInfo(SocketAddr::from((remote, 40000))))
}

async fn send(app: Router, method: &str, uri: &str) -> (StatusCode, Value) {
    let response = app
        .oneshot(
            Request::builder()
                .method(method)
                .uri(uri)
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    let status = response.status();
    let body = response.into_body().collect().await.unwrap().to_bytes();
    let json = if body.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&body).unwrap()
    };
    (status, json)
}

#[tokio::test]
async fn test_dir_status_reports_topology() {
    let options = MasterOptions {
        volume_size_limit_mb: 512,
        default_replication: "010".into(),
        ..MasterOptions::default()
    };
    let master = create_master(options, "");
    master.topology().up_adjust_max_volume_id(4);

    let (status, json) = send(create_test_app(&master, [127, 0, 0, 1]), "GET", "/dir/status").await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["Version"], env!("CARGO_PKG_VERSION"));
    assert_eq!(json["Topology"]["Max"], 4);
    assert_eq!(json["Topology"]["VolumeSizeLimitMB"], 512);
    assert_eq!(json["Topology"]["DefaultReplication"], "010");
    assert!(json.get("Leader").is_none());
}

#[tokio::test]
async fn test_reserve_without_raft_is_unavailable() {
    let master = create_master(MasterOptions::default(), "");

    let (status, json) = send(create_test_app(&master, [127, 0, 0, 1]), "POST", "/vol/reserve").await;

    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert!(json["error"].is_string());
}

#[tokio::test]
async fn test_reserve_rejects_client_outside_whitelist() {
    let dir = tempfile::tempdir().unwrap();
    let options = MasterOptions {
        white_list: vec!["10.0.0.5".into()],
        ..MasterOptions::default()
    };
    let master = create_master(options, "");
    master.attach_raft(create_raft(&master, dir.path())).unwrap();

    let (status, _) = send(create_test_app(&master, [10, 0, 0, 6]), "POST", "/vol/reserve").await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    // Whitelisted, but this raft server never started so it is not the leader.
    let (status, _) = send(create_test_app(&master, [10, 0, 0, 5]), "POST", "/vol/reserve").await;
    assert_eq!(status, StatusCode::CONFLICT);
}

#[tokio::test]
async fn test_reserve_cidr_whitelist_rejects_outsiders() {
    let dir = tempfile::tempdir().unwrap();
    let options = MasterOptions {
        white_list: vec!["10.0.0.0/8".into()],
        ..MasterOptions::default()
    };
    let master = create_master(options, "");
    master.attach_raft(create_raft(&master, dir.path())).unwrap();

    let (status, _) = send(create_test_app(&master, [203, 0, 113, 9]), "POST", "/vol/reserve").await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    // Inside the range: past the guard, refused only for not leading.
    let (status, _) = send(create_test_app(&master, [10, 20, 30, 40]), "POST", "/vol/reserve").await;
    assert_eq!(status, StatusCode::CONFLICT);
}

#[test]
fn test_malformed_white_list_fails_construction() {
    let options = MasterOptions {
        white_list: vec!["10.0.0.0/8".into(), "10.0.0.300".into()],
        ..MasterOptions::default()
    };
    let (me, peers) = resolve_peers("127.0.0.1", 9333, "").unwrap();
    let err = MasterServer::new(options, peers, me, None).err().unwrap();
    assert!(matches!(err, MasterError::InvalidWhiteList { .. }), "got {:?}", err);
}

#[tokio::test]
async fn test_reserve_on_follower_returns_leader_hint() {
    let dir = tempfile::tempdir().unwrap();
    let master = create_master(MasterOptions::default(), "127.0.0.2:9333,127.0.0.3:9333");
    let raft = create_raft(&master, dir.path());
    raft.state.write().await.leader = Some("127.0.0.2:9333".into());
    master.attach_raft(raft).unwrap();

    let (status, json) = send(create_test_app(&master, [127, 0, 0, 1]), "POST", "/vol/reserve").await;

    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(json["Leader"], "127.0.0.2:9333");
}

#[tokio::test]
async fn test_reserve_on_leader_allocates_sequential_ids() {
    let dir = tempfile::tempdir().unwrap();
    let master = create_master(MasterOptions::default(), "");
    let raft = create_raft(&master, dir.path());
    master.attach_raft(raft.clone()).unwrap();
    let _loops = raft.start();

    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !raft.is_leader().await {
        assert!(tokio::time::Instant::now() < deadline, "never became leader");
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    for expected in 1..=3 {
        let (status, json) =
            send(create_test_app(&master, [127, 0, 0, 1]), "POST", "/vol/reserve").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["VolumeId"], expected);
    }
    assert_eq!(master.topology().max_volume_id(), 3);
}

#[tokio::test]
async fn test_disable_http_hides_management_routes() {
    let dir = tempfile::tempdir().unwrap();
    let options = MasterOptions {
        disable_http: true,
        ..MasterOptions::default()
    };
    let master = create_master(options, "");
    master.attach_raft(create_raft(&master, dir.path())).unwrap();

    let (status, _) = send(create_test_app(&master, [127, 0, 0, 1]), "GET", "/dir/status").await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, _) = send(create_test_app(&master, [127, 0, 0, 1]), "POST", "/vol/reserve").await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, _) = send(create_test_app(&master, [127, 0, 0, 1]), "GET", "/cluster/status").await;
    assert_eq!(status, StatusCode::OK);
}

#[tokio::test]
async fn test_cluster_status_lists_other_peers() {
    let dir = tempfile::tempdir().unwrap();
    let master = create_master(MasterOptions::default(), "127.0.0.2:9333,127.0.0.3:9333");
    master.attach_raft(create_raft(&master, dir.path())).unwrap();

    let (status, json) = send(create_test_app(&master, [127, 0, 0, 1]), "GET", "/cluster/status").await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["IsLeader"], false);
    assert!(json.get("Leader").is_none());
    assert_eq!(
        json["Peers"],
        serde_json::json!(["127.0.0.2:9333", "127.0.0.3:9333"])
    );
}

#[tokio::test]
async fn test_raft_attaches_only_once() {
    let dir = tempfile::tempdir().unwrap();
    let master = create_master(MasterOptions::default(), "");
    let raft = create_raft(&master, dir.path());

    master.attach_raft(raft.clone()).unwrap();
    let err = master.attach_raft(raft).unwrap_err();
    assert!(matches!(err, MasterError::RaftAlreadyAttached));
}
