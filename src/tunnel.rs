//! Local TCP → WebSocket tunnel for GDB.
//!
//! Listens on a local port; every accepted client gets its own WebSocket to
//! the gateway's gdb-tunnel endpoint and bytes are pumped both ways until
//! either side closes. Connections are independent of each other: each owns
//! a child of the server's cancellation token, so tearing one down leaves
//! the rest alone while server shutdown reaches all of them.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::{JoinHandle, JoinSet};
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::descriptor::{self, ConnectionDescriptor};
use crate::error::TunnelError;

const READ_BUF: usize = 16 * 1024;

pub struct TunnelServer {
    listener: TcpListener,
    descriptor: Arc<ConnectionDescriptor>,
    connect_timeout: Duration,
}

impl TunnelServer {
    /// Bind the local listener, then open (and close) one probe socket so
    /// auth or availability problems surface before any client connects.
    ///
    /// A `host` of `*` binds all interfaces.
    pub async fn bind(
        host: &str,
        port: u16,
        descriptor: ConnectionDescriptor,
        connect_timeout: Duration,
    ) -> Result<Self, TunnelError> {
        let host = if host == "*" { "0.0.0.0" } else { host };
        let listener = TcpListener::bind((host, port))
            .await
            .map_err(|e| TunnelError::from_bind(port, e))?;

        let mut probe = descriptor::connect(&descriptor, connect_timeout).await?;
        let _ = probe.close(None).await;
        debug!(uri = %descriptor.uri, "Tunnel: probe connection ok");

        Ok(Self {
            listener,
            descriptor: Arc::new(descriptor),
            connect_timeout,
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Accept clients until `shutdown` fires, then wait for every open
    /// connection to wind down.
    pub async fn run(self, shutdown: CancellationToken) -> Result<(), TunnelError> {
        let mut connections = JoinSet::new();

        loop {
            tokio::select! {
                () = shutdown.cancelled() => break,
                accepted = self.listener.accept() => {
                    let (tcp, peer) = match accepted {
                        Ok(pair) => pair,
                        Err(e) => {
                            warn!("Tunnel: accept failed: {e}");
                            continue;
                        }
                    };
                    connections.spawn(serve_connection(
                        tcp,
                        peer,
                        self.descriptor.clone(),
                        self.connect_timeout,
                        shutdown.child_token(),
                    ));
                }
                Some(_) = connections.join_next(), if !connections.is_empty() => {}
            }
        }

        info!(open = connections.len(), "Tunnel: shutting down");
        while connections.join_next().await.is_some() {}
        Ok(())
    }

    /// Run on a background task.
    pub fn spawn(self) -> Result<TunnelHandle, TunnelError> {
        let local_addr = self.local_addr()?;
        let shutdown = CancellationToken::new();
        let task = tokio::spawn(self.run(shutdown.clone()));
        Ok(TunnelHandle {
            local_addr,
            shutdown,
            task,
        })
    }
}

pub struct TunnelHandle {
    local_addr: SocketAddr,
    shutdown: CancellationToken,
    task: JoinHandle<Result<(), TunnelError>>,
}

impl TunnelHandle {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Stop accepting, close every connection and wait for them.
    pub async fn shutdown(self) -> Result<(), TunnelError> {
        self.shutdown.cancel();
        match self.task.await {
            Ok(result) => result,
            Err(e) => Err(TunnelError::Io(io::Error::other(e))),
        }
    }
}

async fn serve_connection(
    tcp: TcpStream,
    peer: SocketAddr,
    descriptor: Arc<ConnectionDescriptor>,
    connect_timeout: Duration,
    token: CancellationToken,
) {
    let ws = tokio::select! {
        () = token.cancelled() => return,
        res = descriptor::connect(&descriptor, connect_timeout) => match res {
            Ok(ws) => ws,
            Err(e) => {
                warn!(peer = %peer, "Tunnel: could not open websocket: {e}");
                return;
            }
        },
    };
    info!(peer = %peer, "Tunnel: client connected");

    let (mut ws_tx, mut ws_rx) = ws.split();
    let (mut tcp_rx, mut tcp_tx) = tcp.into_split();

    // TCP → WS
    let upstream = async {
        let mut buf = vec![0u8; READ_BUF];
        loop {
            tokio::select! {
                () = token.cancelled() => break,
                read = tcp_rx.read(&mut buf) => match read {
                    Ok(0) => break,
                    Ok(n) => {
                        if let Err(e) = ws_tx.send(Message::Binary(buf[..n].to_vec().into())).await {
                            debug!(peer = %peer, "Tunnel: websocket send failed: {e}");
                            break;
                        }
                    }
                    Err(e) => {
                        debug!(peer = %peer, "Tunnel: tcp read failed: {e}");
                        break;
                    }
                },
            }
        }
        token.cancel();
        ws_tx
    };

    // WS → TCP
    let downstream = async {
        loop {
            let payload = tokio::select! {
                () = token.cancelled() => break,
                msg = ws_rx.next() => match msg {
                    Some(Ok(Message::Binary(data))) => data.to_vec(),
                    Some(Ok(Message::Text(text))) => text.as_bytes().to_vec(),
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => continue,
                    Some(Err(e)) => {
                        debug!(peer = %peer, "Tunnel: websocket read failed: {e}");
                        break;
                    }
                },
            };
            if let Err(e) = tcp_tx.write_all(&payload).await {
                debug!(peer = %peer, "Tunnel: tcp write failed: {e}");
                break;
            }
        }
        token.cancel();
        tcp_tx
    };

    let (mut ws_tx, mut tcp_tx) = tokio::join!(upstream, downstream);
    let _ = tokio::time::timeout(Duration::from_secs(1), ws_tx.close()).await;
    let _ = tcp_tx.shutdown().await;
    info!(peer = %peer, "Tunnel: client disconnected");
}

#[cfg(test)]
mod tests {
    use tokio::net::TcpListener;

    use super::*;
    use crate::descriptor::SessionKind;
    use crate::error::ConnectError;

    fn descriptor(addr: SocketAddr) -> ConnectionDescriptor {
        ConnectionDescriptor::for_session(
            &format!("ws://{addr}"),
            &SessionKind::GdbTunnel {
                gateway_id: "gw-1".into(),
            },
            "Bearer",
            "token",
            None,
        )
    }

    /// WebSocket peer that echoes every binary message on every connection.
    async fn echo_peer() -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                tokio::spawn(async move {
                    let Ok(mut ws) = tokio_tungstenite::accept_async(stream).await else {
                        return;
                    };
                    while let Some(Ok(msg)) = ws.next().await {
                        if msg.is_binary() && ws.send(msg).await.is_err() {
                            break;
                        }
                    }
                });
            }
        });
        addr
    }

    async fn start(peer: SocketAddr) -> TunnelHandle {
        TunnelServer::bind("127.0.0.1", 0, descriptor(peer), Duration::from_secs(5))
            .await
            .unwrap()
            .spawn()
            .unwrap()
    }

    async fn roundtrip(client: &mut TcpStream, data: &[u8]) -> Vec<u8> {
        client.write_all(data).await.unwrap();
        let mut buf = vec![0u8; data.len()];
        client.read_exact(&mut buf).await.unwrap();
        buf
    }

    #[tokio::test]
    async fn bytes_flow_both_ways() {
        let handle = start(echo_peer().await).await;
        let mut client = TcpStream::connect(handle.local_addr()).await.unwrap();

        assert_eq!(roundtrip(&mut client, b"$qSupported#37").await, b"$qSupported#37");
        assert_eq!(roundtrip(&mut client, b"+").await, b"+");

        handle.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn closing_one_client_leaves_others_working() {
        let handle = start(echo_peer().await).await;
        let mut first = TcpStream::connect(handle.local_addr()).await.unwrap();
        let mut second = TcpStream::connect(handle.local_addr()).await.unwrap();

        assert_eq!(roundtrip(&mut first, b"one").await, b"one");
        assert_eq!(roundtrip(&mut second, b"two").await, b"two");

        drop(first);
        tokio::time::sleep(Duration::from_millis(100)).await;

        assert_eq!(roundtrip(&mut second, b"still here").await, b"still here");
        handle.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn remote_close_ends_local_client() {
        // Sends a greeting on every connection, then closes.
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let peer = listener.local_addr().unwrap();
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                tokio::spawn(async move {
                    let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();
                    let _ = ws.send(Message::Binary(b"bye".to_vec().into())).await;
                    let _ = ws.close(None).await;
                    while let Some(Ok(_)) = ws.next().await {}
                });
            }
        });

        let handle = start(peer).await;
        let mut client = TcpStream::connect(handle.local_addr()).await.unwrap();
        let mut received = Vec::new();
        client.read_to_end(&mut received).await.unwrap();
        assert_eq!(received, b"bye");

        handle.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn shutdown_closes_open_clients() {
        let handle = start(echo_peer().await).await;
        let mut client = TcpStream::connect(handle.local_addr()).await.unwrap();
        assert_eq!(roundtrip(&mut client, b"x").await, b"x");

        handle.shutdown().await.unwrap();

        let mut rest = Vec::new();
        client.read_to_end(&mut rest).await.unwrap();
        assert!(rest.is_empty());
    }

    #[tokio::test]
    async fn wildcard_host_binds_all_interfaces() {
        let server = TunnelServer::bind("*", 0, descriptor(echo_peer().await), Duration::from_secs(5))
            .await
            .unwrap();
        assert!(server.local_addr().unwrap().ip().is_unspecified());
    }

    #[tokio::test]
    async fn port_in_use_is_a_bind_error() {
        let taken = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = taken.local_addr().unwrap().port();

        let err = TunnelServer::bind("127.0.0.1", port, descriptor(echo_peer().await), Duration::from_secs(5))
            .await
            .err()
            .unwrap();
        assert!(matches!(err, TunnelError::Bind { port: p, .. } if p == port), "{err:?}");
    }

    #[tokio::test]
    async fn failing_probe_is_reported_before_serving() {
        let gone = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = gone.local_addr().unwrap();
        drop(gone);

        let err = TunnelServer::bind("127.0.0.1", 0, descriptor(addr), Duration::from_secs(5))
            .await
            .err()
            .unwrap();
        assert!(matches!(err, TunnelError::Connect(ConnectError::Refused)), "{err:?}");
    }
}
