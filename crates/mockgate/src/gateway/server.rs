//! TCP accept loop: one task per connection, HTTP/1 served by hyper.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper_util::rt::TokioIo;
use tokio::net::TcpListener;
use tracing::{debug, info, warn};

use crate::gateway::handler::handle_request;
use crate::gateway::GatewayEngine;

pub struct GatewayServer {
    engine: Arc<GatewayEngine>,
    listener: TcpListener,
    local_addr: SocketAddr,
}

impl GatewayServer {
    /// Binds the configured listen address. Port 0 picks an ephemeral
    /// port, which the tests rely on.
    pub async fn bind(engine: Arc<GatewayEngine>) -> anyhow::Result<Self> {
        let listen = &engine.config().listen;
        let addr = format!("{}:{}", listen.host, listen.port);
        let listener = TcpListener::bind(&addr)
            .await
            .with_context(|| format!("failed to bind {addr}"))?;
        let local_addr = listener.local_addr()?;
        Ok(GatewayServer {
            engine,
            listener,
            local_addr,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub async fn run(self) -> anyhow::Result<()> {
        info!(addr = %self.local_addr, "gateway listening");
        loop {
            // Accept errors (fd exhaustion, aborted handshakes) are
            // transient; the listener must outlive them.
            let (stream, peer) = match self.listener.accept().await {
                Ok(accepted) => accepted,
                Err(err) => {
                    warn!(error = %err, "failed to accept connection");
                    tokio::time::sleep(std::time::Duration::from_millis(50)).await;
                    continue;
                }
            };
            let engine = Arc::clone(&self.engine);
            tokio::spawn(async move {
                let io = TokioIo::new(stream);
                let service =
                    service_fn(move |request| handle_request(Arc::clone(&engine), request));
                if let Err(err) = http1::Builder::new().serve_connection(io, service).await {
                    debug!(peer = %peer, error = %err, "connection closed with error");
                }
            });
        }
    }
}
