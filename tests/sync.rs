//! End-to-end scenarios: two nodes over loopback TCP.

use std::collections::BTreeMap;
use std::future::Future;
use std::path::Path;
use std::time::Duration;

use rask::actor::{Action, ActorHandle};
use rask::config::{Config, ConnectionConfig, PeerConfig, TenantConfig};
use rask::server::Server;
use rask::tick::Tick;
use rask::tree::{FileType, Inode, TreeHash};

fn node_config(server: u32, root: &Path, peers: Vec<PeerConfig>) -> Config {
    let mut tenants = BTreeMap::new();
    tenants.insert(
        "t".to_owned(),
        TenantConfig {
            path: root.to_owned(),
            subscribe: true,
        },
    );
    Config {
        bind: "127.0.0.1:0".parse().unwrap(),
        server,
        data_dir: None,
        metrics_addr: None,
        connection: ConnectionConfig {
            heartbeat_secs: 1,
            send_queue: 256,
        },
        peers,
        tenants,
    }
}

async fn wait_for<T, F, Fut>(mut probe: F) -> Option<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Option<T>>,
{
    for _ in 0..200 {
        if let Some(value) = probe().await {
            return Some(value);
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    None
}

async fn wait_for_inode(handle: &ActorHandle, name: &str) -> Option<Inode> {
    let handle = handle.clone();
    let name = name.to_owned();
    wait_for(move || {
        let handle = handle.clone();
        let name = name.clone();
        async move { handle.get_inode("t", &name).await.ok().flatten() }
    })
    .await
}

#[tokio::test]
async fn handshake_and_empty_tenants_converge_silently() {
    let dir_a = tempfile::tempdir().unwrap();
    let dir_b = tempfile::tempdir().unwrap();

    let a = Server::spawn(node_config(1, dir_a.path(), vec![]))
        .await
        .unwrap();
    let peer = PeerConfig {
        addr: a.local_addr(),
        reconnect_secs: None,
    };
    let b = Server::spawn(node_config(2, dir_b.path(), vec![peer]))
        .await
        .unwrap();

    // both sides learn the peer's version and identity
    let registry = b.registry().clone();
    let identity = wait_for(move || {
        let registry = registry.clone();
        async move {
            registry
                .connections()
                .into_iter()
                .find(|conn| conn.peer_version().is_some() && conn.identity() != 0)
                .map(|conn| conn.identity())
        }
    })
    .await
    .expect("handshake must complete");
    assert_eq!(identity, 1);

    // give reconciliation a moment; nothing must change on either side
    tokio::time::sleep(Duration::from_millis(500)).await;
    assert_eq!(a.handle().root_hash("t").await.unwrap(), TreeHash::empty());
    assert_eq!(b.handle().root_hash("t").await.unwrap(), TreeHash::empty());

    a.shutdown().await;
    b.shutdown().await;
}

#[tokio::test]
async fn single_directory_propagates() {
    let dir_a = tempfile::tempdir().unwrap();
    let dir_b = tempfile::tempdir().unwrap();
    std::fs::create_dir(dir_a.path().join("shared")).unwrap();

    let a = Server::spawn(node_config(1, dir_a.path(), vec![]))
        .await
        .unwrap();
    let peer = PeerConfig {
        addr: a.local_addr(),
        reconnect_secs: None,
    };
    let b = Server::spawn(node_config(2, dir_b.path(), vec![peer]))
        .await
        .unwrap();

    let inode = wait_for_inode(b.handle(), "shared")
        .await
        .expect("directory must propagate");
    assert_eq!(inode.filetype, FileType::Directory);
    assert_eq!(inode.priority.server, 1, "the tick must keep its origin");
    assert!(dir_b.path().join("shared").is_dir());

    let handle_a = a.handle().clone();
    let handle_b = b.handle().clone();
    let roots_equal = wait_for(move || {
        let handle_a = handle_a.clone();
        let handle_b = handle_b.clone();
        async move {
            let root_a = handle_a.root_hash("t").await.ok()?;
            let root_b = handle_b.root_hash("t").await.ok()?;
            (root_a == root_b).then_some(())
        }
    })
    .await;
    assert!(roots_equal.is_some(), "replicas must agree on the root hash");

    a.shutdown().await;
    b.shutdown().await;
}

#[tokio::test]
async fn equal_time_ticks_resolve_to_the_higher_server() {
    let dir_a = tempfile::tempdir().unwrap();
    let dir_b = tempfile::tempdir().unwrap();

    let a = Server::spawn(node_config(1, dir_a.path(), vec![]))
        .await
        .unwrap();
    let b = Server::spawn(node_config(2, dir_b.path(), vec![]))
        .await
        .unwrap();

    // both nodes hold "d" with the same time but different origin servers
    for (server, node) in [(1u32, &a), (2u32, &b)] {
        node.handle()
            .send(Action::RemoteDirectory {
                tenant: "t".to_owned(),
                name: "d".to_owned(),
                priority: Tick { time: 10, server },
            })
            .await
            .unwrap();
        wait_for_inode(node.handle(), "d").await.expect("seed record");
    }

    b.connect(PeerConfig {
        addr: a.local_addr(),
        reconnect_secs: None,
    });

    for node in [&a, &b] {
        let handle = node.handle().clone();
        let settled = wait_for(move || {
            let handle = handle.clone();
            async move {
                let inode = handle.get_inode("t", "d").await.ok().flatten()?;
                (inode.priority
                    == Tick {
                        time: 10,
                        server: 2,
                    })
                .then_some(())
            }
        })
        .await;
        assert!(settled.is_some(), "higher server id must win the tie");
    }

    a.shutdown().await;
    b.shutdown().await;
}

#[tokio::test]
async fn watchdog_redials_a_dead_peer() {
    let dir_a = tempfile::tempdir().unwrap();
    let dir_b = tempfile::tempdir().unwrap();

    let a = Server::spawn(node_config(1, dir_a.path(), vec![]))
        .await
        .unwrap();
    let a_addr = a.local_addr();
    let peer = PeerConfig {
        addr: a_addr,
        reconnect_secs: Some(2),
    };
    let b = Server::spawn(node_config(2, dir_b.path(), vec![peer]))
        .await
        .unwrap();

    let registry = b.registry().clone();
    wait_for(move || {
        let registry = registry.clone();
        async move {
            registry
                .connections()
                .into_iter()
                .find(|conn| conn.identity() == 1)
                .map(|_| ())
        }
    })
    .await
    .expect("initial connection");

    // kill the peer, then bring it back on the same address with new content
    a.shutdown().await;
    std::fs::create_dir(dir_a.path().join("late")).unwrap();
    let mut config = node_config(1, dir_a.path(), vec![]);
    config.bind = a_addr;
    let a = Server::spawn(config).await.unwrap();

    let inode = wait_for_inode(b.handle(), "late")
        .await
        .expect("content must flow again after the watchdog re-dials");
    assert_eq!(inode.filetype, FileType::Directory);

    a.shutdown().await;
    b.shutdown().await;
}
