//! Connection descriptors and the WebSocket connect routine.
//!
//! A [`ConnectionDescriptor`] carries everything needed to open one socket to
//! the gateway API: the URI, the auth headers and the TLS roots. It is built
//! once per CLI invocation and cloned for each connection attempt, so the
//! tunnel server can open a fresh socket for every accepted client.

use std::path::Path;
use std::time::Duration;

use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::{HeaderName, HeaderValue};
use tokio_tungstenite::{Connector, MaybeTlsStream, WebSocketStream};
use tracing::debug;

use crate::config::ApiConfig;
use crate::error::ConnectError;
use crate::util::expand_home;

pub type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// What the socket is for. Determines the endpoint path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionKind {
    Job { job_id: String },
    GdbTunnel { gateway_id: String },
}

impl SessionKind {
    pub fn path(&self) -> String {
        match self {
            SessionKind::Job { job_id } => format!("/ws/job/{job_id}"),
            SessionKind::GdbTunnel { gateway_id } => {
                format!("/ws/gateway/{gateway_id}/gdb-tunnel")
            }
        }
    }
}

/// Extra trust configuration for `wss://` endpoints.
#[derive(Debug, Clone, Default)]
pub struct TlsContext {
    /// PEM-encoded root certificate added to the system roots.
    pub root_ca_pem: Option<Vec<u8>>,
}

impl TlsContext {
    pub fn from_ca_file(path: &Path) -> std::io::Result<Self> {
        Ok(Self {
            root_ca_pem: Some(std::fs::read(path)?),
        })
    }

    fn connector(&self) -> Result<native_tls::TlsConnector, ConnectError> {
        let mut builder = native_tls::TlsConnector::builder();
        if let Some(pem) = &self.root_ca_pem {
            let cert = native_tls::Certificate::from_pem(pem)
                .map_err(|e| ConnectError::InvalidDescriptor(format!("bad CA certificate: {e}")))?;
            builder.add_root_certificate(cert);
        }
        builder
            .build()
            .map_err(|e| ConnectError::InvalidDescriptor(format!("TLS setup failed: {e}")))
    }
}

#[derive(Debug, Clone)]
pub struct ConnectionDescriptor {
    pub uri: String,
    pub headers: Vec<(String, Vec<u8>)>,
    pub tls: Option<TlsContext>,
}

impl ConnectionDescriptor {
    /// Descriptor for `kind` on `ws_host`, authorized with `"<token_type> <token>"`.
    pub fn for_session(
        ws_host: &str,
        kind: &SessionKind,
        token_type: &str,
        token: &str,
        tls: Option<TlsContext>,
    ) -> Self {
        let uri = format!("{}{}", ws_host.trim_end_matches('/'), kind.path());
        let authorization = format!("{token_type} {token}").into_bytes();
        Self {
            uri,
            headers: vec![("authorization".to_string(), authorization)],
            tls,
        }
    }

    /// Build from the `[api]` config section, loading the CA file if one is set.
    pub fn from_config(api: &ApiConfig, kind: &SessionKind) -> std::io::Result<Self> {
        let tls = api
            .ca_file
            .as_deref()
            .map(|path| TlsContext::from_ca_file(&expand_home(path)))
            .transpose()?;
        Ok(Self::for_session(
            &api.ws_host,
            kind,
            &api.token_type,
            &api.token,
            tls,
        ))
    }
}

/// Open a WebSocket described by `desc`, bounded by `connect_timeout`.
pub async fn connect(
    desc: &ConnectionDescriptor,
    connect_timeout: Duration,
) -> Result<WsStream, ConnectError> {
    let mut request = desc
        .uri
        .as_str()
        .into_client_request()
        .map_err(|e| ConnectError::InvalidDescriptor(e.to_string()))?;

    for (name, value) in &desc.headers {
        let name = HeaderName::from_bytes(name.as_bytes())
            .map_err(|e| ConnectError::InvalidDescriptor(format!("header {name}: {e}")))?;
        let value = HeaderValue::from_bytes(value)
            .map_err(|e| ConnectError::InvalidDescriptor(format!("header {name}: {e}")))?;
        request.headers_mut().insert(name, value);
    }

    let connector = match &desc.tls {
        Some(tls) => Some(Connector::NativeTls(tls.connector()?)),
        None => None,
    };

    debug!(uri = %desc.uri, "Connecting websocket");
    let attempt =
        tokio_tungstenite::connect_async_tls_with_config(request, None, false, connector);
    match tokio::time::timeout(connect_timeout, attempt).await {
        Ok(Ok((ws, _response))) => Ok(ws),
        Ok(Err(e)) => Err(ConnectError::from_tungstenite(e)),
        Err(_) => Err(ConnectError::TimedOut),
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use tokio::net::TcpListener;
    use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
    use tokio_tungstenite::tungstenite::http::StatusCode;

    use super::*;

    fn local(addr: std::net::SocketAddr, kind: &SessionKind) -> ConnectionDescriptor {
        ConnectionDescriptor::for_session(&format!("ws://{addr}/"), kind, "Bearer", "t0k", None)
    }

    #[test]
    fn paths_per_kind() {
        let job = SessionKind::Job {
            job_id: "abc".into(),
        };
        let gdb = SessionKind::GdbTunnel {
            gateway_id: "gw1".into(),
        };
        assert_eq!(job.path(), "/ws/job/abc");
        assert_eq!(gdb.path(), "/ws/gateway/gw1/gdb-tunnel");
    }

    #[test]
    fn descriptor_joins_host_and_sets_auth() {
        let desc = ConnectionDescriptor::for_session(
            "wss://api.example.com/",
            &SessionKind::Job {
                job_id: "42".into(),
            },
            "Bearer",
            "secret",
            None,
        );
        assert_eq!(desc.uri, "wss://api.example.com/ws/job/42");
        assert_eq!(
            desc.headers,
            vec![("authorization".to_string(), b"Bearer secret".to_vec())]
        );
    }

    #[test]
    fn missing_ca_file_is_an_error() {
        assert!(TlsContext::from_ca_file(Path::new("/nonexistent/ca.pem")).is_err());
    }

    #[tokio::test]
    async fn sends_path_and_authorization() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let seen: Arc<Mutex<Option<(String, String)>>> = Arc::default();

        let seen_srv = seen.clone();
        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let callback = move |req: &Request, resp: Response| {
                let auth = req.headers()["authorization"].to_str().unwrap().to_string();
                *seen_srv.lock().unwrap() = Some((req.uri().path().to_string(), auth));
                Ok::<_, ErrorResponse>(resp)
            };
            tokio_tungstenite::accept_hdr_async(stream, callback)
                .await
                .unwrap()
        });

        let kind = SessionKind::Job {
            job_id: "j1".into(),
        };
        let _ws = connect(&local(addr, &kind), Duration::from_secs(5))
            .await
            .unwrap();
        server.await.unwrap();

        let (path, auth) = seen.lock().unwrap().clone().unwrap();
        assert_eq!(path, "/ws/job/j1");
        assert_eq!(auth, "Bearer t0k");
    }

    #[tokio::test]
    async fn handshake_404_maps_to_not_found() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let reject = |_: &Request, _: Response| {
                let mut resp = ErrorResponse::new(None);
                *resp.status_mut() = StatusCode::NOT_FOUND;
                Err::<Response, ErrorResponse>(resp)
            };
            let _ = tokio_tungstenite::accept_hdr_async(stream, reject).await;
        });

        let kind = SessionKind::Job {
            job_id: "missing".into(),
        };
        let err = connect(&local(addr, &kind), Duration::from_secs(5))
            .await
            .unwrap_err();
        assert!(matches!(err, ConnectError::NotFound), "{err:?}");
    }

    #[tokio::test]
    async fn refused_connection() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let kind = SessionKind::Job { job_id: "x".into() };
        let err = connect(&local(addr, &kind), Duration::from_secs(5))
            .await
            .unwrap_err();
        assert!(matches!(err, ConnectError::Refused), "{err:?}");
    }

    #[tokio::test]
    async fn silent_server_times_out() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let holder = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            tokio::time::sleep(Duration::from_secs(5)).await;
            drop(stream);
        });

        let kind = SessionKind::Job { job_id: "x".into() };
        let err = connect(&local(addr, &kind), Duration::from_millis(200))
            .await
            .unwrap_err();
        assert!(matches!(err, ConnectError::TimedOut), "{err:?}");
        holder.abort();
    }

    #[tokio::test]
    async fn invalid_uri_is_rejected() {
        let desc = ConnectionDescriptor {
            uri: "not a uri".into(),
            headers: Vec::new(),
            tls: None,
        };
        let err = connect(&desc, Duration::from_secs(1)).await.unwrap_err();
        assert!(matches!(err, ConnectError::InvalidDescriptor(_)), "{err:?}");
    }
}
