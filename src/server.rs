//! The daemon: listener, dialer and lifetime management.

use std::net::SocketAddr;

use anyhow::{Context, Result};
use iroh_metrics::inc;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tokio_util::task::AbortOnDropHandle;
use tracing::{debug, error, info, info_span, Instrument};

use crate::actor::ActorHandle;
use crate::config::{Config, PeerConfig};
use crate::metrics::Metrics;
use crate::net::{self, ConnContext, Connection, Registry};
use crate::store::Store;
use crate::tenant::Tenants;

/// A running rask node.
pub struct Server {
    local_addr: SocketAddr,
    ctx: ConnContext,
    cancel: CancellationToken,
    accept_task: AbortOnDropHandle<()>,
}

impl Server {
    /// Bind the listener, spawn the worker actor (which sweeps every
    /// subscribed tenant) and dial the configured peers.
    pub async fn spawn(config: Config) -> Result<Server> {
        let store = match &config.data_dir {
            Some(dir) => Store::persistent(dir.clone())?,
            None => Store::memory(),
        };
        let registry = Registry::default();
        let tenants = Tenants::from_config(&config.tenants, &store);
        let actor = ActorHandle::spawn(config.server, tenants, store, registry.clone());
        let cancel = CancellationToken::new();
        let ctx = ConnContext {
            actor,
            registry,
            server: config.server,
            heartbeat: config.connection.heartbeat(),
            send_queue: config.connection.send_queue,
            cancel: cancel.clone(),
        };

        let listener = TcpListener::bind(config.bind)
            .await
            .with_context(|| format!("binding {}", config.bind))?;
        let local_addr = listener.local_addr()?;
        info!(%local_addr, server = config.server, "listening");

        let accept_ctx = ctx.clone();
        let accept_cancel = cancel.clone();
        let task = tokio::spawn(
            async move {
                loop {
                    tokio::select! {
                        biased;
                        _ = accept_cancel.cancelled() => break,
                        accepted = listener.accept() => match accepted {
                            Ok((stream, peer_addr)) => {
                                inc!(Metrics, connections_accepted);
                                debug!(%peer_addr, "connection accepted");
                                Connection::spawn(stream, &accept_ctx, None);
                            }
                            Err(err) => error!("accept failed: {err}"),
                        }
                    }
                }
                debug!("accept loop stopped");
            }
            .instrument(info_span!("accept", %local_addr)),
        );

        for peer in config.peers.clone() {
            tokio::spawn(net::dial(peer, ctx.clone()));
        }

        Ok(Server {
            local_addr,
            ctx,
            cancel,
            accept_task: AbortOnDropHandle::new(task),
        })
    }

    /// The address the listener actually bound.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Handle to the worker actor.
    pub fn handle(&self) -> &ActorHandle {
        &self.ctx.actor
    }

    /// This node's connection registry.
    pub fn registry(&self) -> &Registry {
        &self.ctx.registry
    }

    /// Dial an additional peer.
    pub fn connect(&self, peer: PeerConfig) {
        tokio::spawn(net::dial(peer, self.ctx.clone()));
    }

    /// Tear down every connection and stop the worker.
    pub async fn shutdown(self) {
        self.cancel.cancel();
        self.ctx.actor.shutdown();
        let _ = self.accept_task.await;
    }
}

/// Spawn the server and run until ctrl-c.
pub async fn run_until_ctrl_c(config: Config) -> Result<()> {
    let server = Server::spawn(config).await?;
    tokio::signal::ctrl_c().await?;
    info!("shutdown");
    server.shutdown().await;
    Ok(())
}
