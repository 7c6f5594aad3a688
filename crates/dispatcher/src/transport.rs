//! Newline-delimited JSON over TCP
//!
//! The first line of every connection is the request scope. After that each
//! line is one payload, in either direction. A worker's join connection stays
//! open for its shift and carries its orders.

use crate::channel::Channel;
use crate::dispatcher::{Dispatcher, Request};
use async_trait::async_trait;
use expo_common::error::{ExpoError, Result};
use expo_proto::Payload;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream, ToSocketAddrs};
use tracing::{debug, info, warn};

/// [`Channel`] over one TCP connection
#[derive(Debug)]
pub struct LineChannel {
    lines: Lines<BufReader<OwnedReadHalf>>,
    writer: OwnedWriteHalf,
    peer: String,
}

impl LineChannel {
    pub fn new(stream: TcpStream) -> Self {
        let peer = stream
            .peer_addr()
            .map(|addr| addr.to_string())
            .unwrap_or_else(|_| "unknown peer".to_string());
        let (reader, writer) = stream.into_split();

        Self {
            lines: BufReader::new(reader).lines(),
            writer,
            peer,
        }
    }

    /// Open a connection to a dispatcher
    pub async fn connect(addr: impl ToSocketAddrs) -> Result<Self> {
        let stream = TcpStream::connect(addr).await?;
        stream.set_nodelay(true)?;
        Ok(Self::new(stream))
    }
}

#[async_trait]
impl Channel for LineChannel {
    async fn receive(&mut self) -> Result<Payload> {
        while let Some(line) = self.lines.next_line().await? {
            if line.trim().is_empty() {
                continue;
            }
            return Ok(serde_json::from_str(&line)?);
        }
        Err(ExpoError::channel_closed(format!("{} hung up", self.peer)))
    }

    async fn send(&mut self, payload: Payload) -> Result<()> {
        let mut line = serde_json::to_string(&payload)?;
        line.push('\n');
        self.writer.write_all(line.as_bytes()).await?;
        self.writer.flush().await?;
        Ok(())
    }

    async fn closed(&mut self) {
        // Anything the peer sends mid-exchange is out of protocol and dropped.
        loop {
            match self.lines.next_line().await {
                Ok(Some(line)) => debug!("Ignoring unexpected line from {}: {}", self.peer, line),
                Ok(None) | Err(_) => return,
            }
        }
    }
}

/// Accept connections until `shutdown` resolves, one task per request
///
/// Requests already accepted keep running on their own tasks.
pub async fn serve(
    listener: TcpListener,
    dispatcher: Arc<Dispatcher>,
    shutdown: impl Future<Output = ()>,
) {
    if let Ok(addr) = listener.local_addr() {
        info!("Dispatcher listening on {}", addr);
    }
    tokio::pin!(shutdown);

    loop {
        let accepted = tokio::select! {
            _ = &mut shutdown => {
                info!("Dispatcher stopped accepting requests");
                return;
            }
            accepted = listener.accept() => accepted,
        };
        let (stream, peer) = match accepted {
            Ok(accepted) => accepted,
            Err(e) => {
                warn!("Failed to accept connection: {}", e);
                continue;
            }
        };

        let dispatcher = dispatcher.clone();
        tokio::spawn(async move {
            if let Err(e) = handle_connection(stream, peer, &dispatcher).await {
                debug!("Request from {} ended with error: {}", peer, e);
            }
        });
    }
}

async fn handle_connection(stream: TcpStream, peer: SocketAddr, dispatcher: &Dispatcher) -> Result<()> {
    stream.set_nodelay(true)?;
    let mut channel = LineChannel::new(stream);
    let scope = channel.receive().await?;
    debug!("Request from {}: {}", peer, scope);

    let handled = dispatcher.handle(Request::new(scope, channel)).await?;
    debug!("Request from {} handled: {:?}", peer, handled);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use expo_common::DispatcherConfig;
    use expo_proto::Rejection;
    use serde_json::json;

    async fn start() -> (SocketAddr, Arc<Dispatcher>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let dispatcher = Arc::new(Dispatcher::new(&DispatcherConfig::default()));
        tokio::spawn(serve(listener, dispatcher.clone(), std::future::pending()));
        (addr, dispatcher)
    }

    async fn wait_for_duty(dispatcher: &Dispatcher, workers: usize) {
        while dispatcher.registry().active_count() < workers {
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }
    }

    #[tokio::test]
    async fn test_order_over_tcp() {
        let (addr, dispatcher) = start().await;

        let mut station = LineChannel::connect(addr).await.unwrap();
        station
            .send(json!({"type": "join", "id": 1, "speciality": ["grill"]}))
            .await
            .unwrap();
        wait_for_duty(&dispatcher, 1).await;

        let mut client = LineChannel::connect(addr).await.unwrap();
        client
            .send(json!({"type": "order", "speciality": "grill"}))
            .await
            .unwrap();
        client.send(json!("burger")).await.unwrap();

        assert_eq!(station.receive().await.unwrap(), json!("burger"));
        station.send(json!("cooked-burger")).await.unwrap();
        assert_eq!(client.receive().await.unwrap(), json!("cooked-burger"));

        // The order connection is closed once the exchange is done.
        assert!(matches!(
            client.receive().await,
            Err(ExpoError::ChannelClosed(_))
        ));
    }

    #[tokio::test]
    async fn test_rejection_over_tcp() {
        let (addr, _dispatcher) = start().await;

        let mut client = LineChannel::connect(addr).await.unwrap();
        client
            .send(json!({"type": "order", "speciality": "grill"}))
            .await
            .unwrap();

        let reply = client.receive().await.unwrap();
        assert_eq!(Rejection::from_payload(&reply).unwrap().code, "no_available_worker");
    }

    #[tokio::test]
    async fn test_serve_stops_on_shutdown() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let dispatcher = Arc::new(Dispatcher::new(&DispatcherConfig::default()));
        let (stop, stopped) = tokio::sync::oneshot::channel::<()>();
        let server = tokio::spawn(serve(listener, dispatcher, async move {
            let _ = stopped.await;
        }));

        stop.send(()).unwrap();
        server.await.unwrap();

        // The listener went down with the accept loop.
        assert!(LineChannel::connect(addr).await.is_err());
    }

    #[tokio::test]
    async fn test_client_hangup_mid_order_retires_worker() {
        let (addr, dispatcher) = start().await;

        let mut station = LineChannel::connect(addr).await.unwrap();
        station
            .send(json!({"type": "join", "id": "slow", "speciality": ["grill"]}))
            .await
            .unwrap();
        wait_for_duty(&dispatcher, 1).await;

        let mut client = LineChannel::connect(addr).await.unwrap();
        client
            .send(json!({"type": "order", "speciality": "grill"}))
            .await
            .unwrap();
        client.send(json!("burger")).await.unwrap();
        assert_eq!(station.receive().await.unwrap(), json!("burger"));
        drop(client);

        // The abandoned worker is dropped by the next order that meets it,
        // which closes its shift connection.
        loop {
            let mut next = LineChannel::connect(addr).await.unwrap();
            next.send(json!({"type": "order", "speciality": "grill"}))
                .await
                .unwrap();
            next.send(json!("steak")).await.unwrap();
            let reply = next.receive().await.unwrap();
            if Rejection::from_payload(&reply).is_some_and(|r| r.code == "no_available_worker") {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }

        assert!(matches!(
            station.receive().await,
            Err(ExpoError::ChannelClosed(_))
        ));
        assert_eq!(dispatcher.registry().active_count(), 0);
    }

    #[tokio::test]
    async fn test_leave_over_tcp_closes_worker_connection() {
        let (addr, dispatcher) = start().await;

        let mut station = LineChannel::connect(addr).await.unwrap();
        station
            .send(json!({"type": "staff.onduty", "id": "w", "speciality": ["fry"]}))
            .await
            .unwrap();
        wait_for_duty(&dispatcher, 1).await;

        let mut leave = LineChannel::connect(addr).await.unwrap();
        leave
            .send(json!({"type": "staff.offduty", "id": "w"}))
            .await
            .unwrap();

        assert!(matches!(
            station.receive().await,
            Err(ExpoError::ChannelClosed(_))
        ));
        assert_eq!(dispatcher.registry().active_count(), 0);
    }
}
