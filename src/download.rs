//! Side-channel downloads for `urls` envelopes.
//!
//! Large job output is not sent inline; the API hands out URLs instead. Each
//! body is streamed straight to the output sink, unclassified, in URL order.

use std::io::Write;

use tracing::debug;

use crate::descriptor::TlsContext;
use crate::error::DownloadError;

#[derive(Debug, Clone)]
pub struct Downloader {
    client: reqwest::Client,
}

impl Downloader {
    /// Client trusting the same extra root CA as the WebSocket connection.
    pub fn new(tls: Option<&TlsContext>) -> Result<Self, DownloadError> {
        let mut builder = reqwest::Client::builder();
        if let Some(pem) = tls.and_then(|t| t.root_ca_pem.as_deref()) {
            builder = builder.add_root_certificate(reqwest::Certificate::from_pem(pem)?);
        }
        Ok(Self {
            client: builder.build()?,
        })
    }

    /// Fetch every URL in order, writing each body to `out` as it arrives.
    /// The first failure aborts the remaining URLs.
    pub async fn fetch(&self, urls: &[String], out: &mut dyn Write) -> Result<(), DownloadError> {
        for url in urls {
            debug!(%url, "Fetching side-channel content");
            let mut resp = self.client.get(url).send().await?;

            let status = resp.status();
            if status == reqwest::StatusCode::NOT_FOUND {
                return Err(DownloadError::NotFound { url: url.clone() });
            }
            if !status.is_success() {
                return Err(DownloadError::Status {
                    url: url.clone(),
                    status: status.as_u16(),
                });
            }

            while let Some(chunk) = resp.chunk().await? {
                out.write_all(&chunk).map_err(DownloadError::Output)?;
            }
        }
        out.flush().map_err(DownloadError::Output)
    }
}

#[cfg(test)]
mod tests {
    use std::net::SocketAddr;

    use axum::http::StatusCode;
    use axum::routing::get;
    use axum::Router;

    use super::*;

    async fn serve() -> SocketAddr {
        let app = Router::new()
            .route("/a", get(|| async { "response" }))
            .route("/b", get(|| async { "response" }))
            .route("/boom", get(|| async { StatusCode::INTERNAL_SERVER_ERROR }));
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move { axum::serve(listener, app).await.unwrap() });
        addr
    }

    #[tokio::test]
    async fn bodies_are_concatenated_in_order() {
        let addr = serve().await;
        let downloader = Downloader::new(None).unwrap();
        let mut out = Vec::new();
        downloader
            .fetch(
                &[format!("http://{addr}/a"), format!("http://{addr}/b")],
                &mut out,
            )
            .await
            .unwrap();
        assert_eq!(out, b"responseresponse");
    }

    #[tokio::test]
    async fn missing_content_is_not_found() {
        let addr = serve().await;
        let downloader = Downloader::new(None).unwrap();
        let mut out = Vec::new();
        let err = downloader
            .fetch(
                &[format!("http://{addr}/a"), format!("http://{addr}/gone")],
                &mut out,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, DownloadError::NotFound { .. }));
        assert_eq!(err.to_string(), "Test run content not found");
        assert_eq!(out, b"response");
    }

    #[tokio::test]
    async fn server_error_is_status() {
        let addr = serve().await;
        let downloader = Downloader::new(None).unwrap();
        let err = downloader
            .fetch(&[format!("http://{addr}/boom")], &mut Vec::new())
            .await
            .unwrap_err();
        assert!(matches!(err, DownloadError::Status { status: 500, .. }));
    }
}
