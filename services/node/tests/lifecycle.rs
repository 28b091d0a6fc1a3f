
use std::sync::Arc;
use std::time::Duration;

use harness::TestNode;
use tokio::time::timeout;
use vnet_node::logpipe::{LOG_BUFFER_FILE, LOG_CONFIG_FILE};
use vnet_node::sim::{SimOptions, SimStage};
use vnet_node::{Backend, BackendState, Error, MemStore};

#[tokio::test]
async fn failed_start_is_memoized_and_rolled_back() {
    let node = TestNode::new(SimOptions {
        fail_at: Some(SimStage::Stack),
        ..Default::default()
    });

    let (a, b) = tokio::join!(node.server.start(), node.server.start());
    let (Err(Error::Init(a)), Err(Error::Init(b))) = (a, b) else {
        panic!("both concurrent starts must fail");
    };
    assert!(Arc::ptr_eq(&a, &b));
    assert!(a.to_string().contains("simulated netstack failure"));

    // netmon, engine, stack: nothing after the failing step was built.
    assert_eq!(node.sim.build_count(), 3);
    assert_eq!(node.sim.closed(), vec!["engine", "netmon"]);

    let Err(Error::Init(c)) = node.server.start().await else {
        panic!("third start must fail");
    };
    assert!(Arc::ptr_eq(&a, &c));
    assert_eq!(node.sim.build_count(), 3);
}

#[tokio::test]
async fn failed_backend_start_releases_everything() {
    let node = TestNode::new(SimOptions {
        fail_at: Some(SimStage::BackendStart),
        ..Default::default()
    });

    let err = node.server.start().await.unwrap_err();
    assert!(matches!(err.root(), Error::Subsystem { subsystem: "backend start", .. }));
    assert_eq!(
        node.sim.closed(),
        vec!["backend", "netstack", "engine", "netmon"]
    );
}

#[tokio::test]
async fn mem_store_requires_ephemeral() {
    let node = TestNode::with_config(SimOptions::default(), |c| {
        c.store = Some(Arc::new(MemStore::new()));
    });

    let err = node.server.start().await.unwrap_err();
    assert!(matches!(err.root(), Error::MemStoreRequiresEphemeral));
    assert_eq!(node.sim.build_count(), 0);
}

#[tokio::test]
async fn up_reports_running_status() {
    let node = TestNode::up().await;

    let status = node.server.up().await.unwrap();
    assert_eq!(status.backend_state, BackendState::Running);
    assert!(!status.addrs.is_empty());
    assert_eq!(status.self_node.hostname, "test-node");
    assert!(!node.server.node_addrs().is_empty());
    assert_eq!(node.server.cert_domains(), vec![harness::CERT_DOMAIN]);

    assert!(node.dir.path().join("vnet.state").exists());
    assert!(node.dir.path().join(LOG_CONFIG_FILE).exists());
    assert!(node.dir.path().join(LOG_BUFFER_FILE).exists());
}

#[tokio::test]
async fn up_clears_stale_serve_config() {
    let node = TestNode::up().await;
    let client = node.server.local_client().await.unwrap();

    let mut config = client.serve_config().await.unwrap();
    config.allow_funnel.insert("stale.example:443".into(), true);
    client.set_serve_config(&config).await.unwrap();

    node.server.up().await.unwrap();
    assert!(client.serve_config().await.unwrap().is_empty());
}

#[tokio::test]
async fn up_surfaces_backend_error() {
    let node = TestNode::new(SimOptions {
        backend_error: Some("auth key expired".into()),
        ..Default::default()
    });

    let err = timeout(Duration::from_secs(5), node.server.up())
        .await
        .unwrap()
        .unwrap_err();
    assert!(matches!(&err, Error::Backend(msg) if msg == "auth key expired"));
}

#[tokio::test]
async fn up_waits_for_interactive_login() {
    let node = TestNode::new(SimOptions {
        needs_login: true,
        ..Default::default()
    });
    node.server.start().await.unwrap();
    assert_eq!(node.backend().state(), BackendState::NeedsLogin);

    let status = node.backend().status();
    assert!(status.auth_url.is_some());

    let (status, ()) = tokio::join!(node.server.up(), async {
        tokio::time::sleep(Duration::from_millis(50)).await;
        node.backend().complete_login();
    });
    assert_eq!(status.unwrap().backend_state, BackendState::Running);
}

#[tokio::test]
async fn auth_key_skips_login() {
    let node = TestNode::with_config(
        SimOptions {
            needs_login: true,
            ..Default::default()
        },
        |c| c.auth_key = Some("vnet-auth-key".into()),
    );

    node.server.up().await.unwrap();
    assert!(node.backend().status().auth_url.is_none());
    assert_eq!(node.backend().prefs().hostname, "test-node");
}

#[tokio::test]
async fn close_tears_down_once() {
    let node = TestNode::up().await;
    let listener = node.server.listen("tcp", ":80").await.unwrap();

    node.server.close().await.unwrap();
    assert_eq!(
        node.sim.closed(),
        vec!["netstack", "backend", "engine", "netmon"]
    );
    assert!(listener.is_closed());
    assert!(matches!(listener.accept().await, Err(Error::ListenerClosed)));

    assert!(matches!(node.server.close().await, Err(Error::ServerClosed)));
    assert_eq!(node.sim.closed().len(), 4);
}

#[tokio::test]
async fn close_before_start() {
    let node = TestNode::new(SimOptions::default());
    node.server.close().await.unwrap();

    let err = node.server.start().await.unwrap_err();
    assert!(matches!(err.root(), Error::ServerClosed));
    assert_eq!(node.sim.build_count(), 0);
    assert!(matches!(
        node.server.listen("tcp", ":80").await,
        Err(Error::Init(_))
    ));
}

#[tokio::test]
async fn close_during_start_releases_everything() {
    let node = TestNode::new(SimOptions {
        slow_at: Some((SimStage::NetMonitor, Duration::from_millis(300))),
        ..Default::default()
    });

    let (started, closed) = tokio::join!(node.server.start(), async {
        tokio::time::sleep(Duration::from_millis(50)).await;
        node.server.close().await
    });
    closed.unwrap();
    let err = started.unwrap_err();
    assert!(matches!(err.root(), Error::ServerClosed));

    // Close waited for the start in flight, then released what it built.
    assert_eq!(node.sim.build_count(), 4);
    assert_eq!(
        node.sim.closed(),
        vec!["netstack", "backend", "engine", "netmon"]
    );

    assert!(node.server.start().await.is_err());
    assert_eq!(node.sim.build_count(), 4);
}

#[tokio::test]
async fn close_wakes_up() {
    let node = TestNode::new(SimOptions {
        needs_login: true,
        ..Default::default()
    });
    node.server.start().await.unwrap();

    let (up, closed) = tokio::join!(node.server.up(), async {
        tokio::time::sleep(Duration::from_millis(50)).await;
        node.server.close().await
    });
    closed.unwrap();
    assert!(matches!(up, Err(Error::ServerClosed)));
}

#[tokio::test]
async fn listen_after_close_fails() {
    let node = TestNode::up().await;
    node.server.close().await.unwrap();
    assert!(matches!(
        node.server.listen("tcp", ":80").await,
        Err(Error::ServerClosed)
    ));
}
