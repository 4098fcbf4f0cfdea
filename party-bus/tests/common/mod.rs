#![allow(dead_code)]

use std::{future::Future, net::SocketAddr, sync::Arc, time::Duration};

use anyhow::{Result, anyhow};
use party_bus::{broker::Broker, registry::Registry};
use tokio::{net::TcpListener, sync::oneshot, task::JoinHandle, time::timeout};

pub const READ_TIMEOUT: Duration = Duration::from_secs(2);

/// A relay running on an ephemeral port for the duration of a test.
pub struct TestRelay {
    pub addr: SocketAddr,
    pub registry: Arc<Registry>,
    shutdown: oneshot::Sender<()>,
    server: JoinHandle<()>,
}

impl TestRelay {
    pub async fn start() -> Result<Self> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let broker = Broker::new(listener);
        let addr = broker.local_addr()?;
        let registry = broker.registry();

        let (shutdown, shutdown_rx) = oneshot::channel::<()>();
        let server = tokio::spawn(async move {
            let shutdown = async move {
                let _ = shutdown_rx.await;
            };
            let _ = broker.run_until(shutdown).await;
        });

        Ok(Self {
            addr,
            registry,
            shutdown,
            server,
        })
    }

    pub fn host(&self) -> String {
        self.addr.to_string()
    }

    pub async fn stop(self) {
        let _ = self.shutdown.send(());
        if timeout(READ_TIMEOUT, self.server).await.is_err() {
            eprintln!("relay did not stop in time");
        }
    }
}

/// Polls `condition` until it holds or the read timeout expires.
pub async fn wait_until<F, Fut>(description: &str, mut condition: F) -> Result<()>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + READ_TIMEOUT;
    while tokio::time::Instant::now() < deadline {
        if condition().await {
            return Ok(());
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    Err(anyhow!("timed out waiting until {description}"))
}
