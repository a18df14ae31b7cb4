//! HTTP/1.1 over a filesystem Unix socket, via hyper.
//!
//! Each request opens a fresh connection, performs one exchange and drops
//! the connection, so no protocol state can leak between calls on the same
//! handle.

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::header::{ACCEPT, CONTENT_TYPE, HOST};
use hyper::{Method, Request};
use hyper_util::rt::TokioIo;
use tokio::net::UnixStream;

use super::{API_ROOT, Transport, WireObserver};
use crate::errors::{MonitorError, Result};

/// Transport bound to one VMM's API socket.
pub struct UnixTransport {
    socket_path: PathBuf,
    observer: Option<Arc<dyn WireObserver>>,
}

impl UnixTransport {
    pub fn new(socket_path: impl Into<PathBuf>) -> Self {
        UnixTransport {
            socket_path: socket_path.into(),
            observer: None,
        }
    }

    /// Attach an observer that sees every request and response.
    pub fn with_observer(mut self, observer: Arc<dyn WireObserver>) -> Self {
        self.observer = Some(observer);
        self
    }

    pub fn socket_path(&self) -> &PathBuf {
        &self.socket_path
    }
}

fn transport_err(context: &str, e: impl std::fmt::Display) -> MonitorError {
    MonitorError::Transport(format!("{context}: {e}"))
}

#[async_trait]
impl Transport for UnixTransport {
    async fn request(&self, method: Method, endpoint: &str, body: Option<Bytes>) -> Result<Bytes> {
        let stream = UnixStream::connect(&self.socket_path).await.map_err(|e| {
            transport_err(
                &format!("cannot connect to '{}'", self.socket_path.display()),
                e,
            )
        })?;

        let (mut sender, conn) = hyper::client::conn::http1::handshake(TokioIo::new(stream))
            .await
            .map_err(|e| transport_err("HTTP handshake failed", e))?;

        // The connection task ends as soon as this exchange completes.
        let conn_task = tokio::spawn(conn);

        let payload = body.unwrap_or_default();
        if let Some(observer) = &self.observer {
            observer.on_request(&method, endpoint, &payload);
        }

        let request = Request::builder()
            .method(method)
            .uri(format!("{API_ROOT}/{endpoint}"))
            .header(HOST, "localhost")
            .header(ACCEPT, "application/json")
            .header(CONTENT_TYPE, "application/json")
            .body(Full::new(payload))
            .map_err(|e| transport_err("cannot build request", e))?;

        let response = sender
            .send_request(request)
            .await
            .map_err(|e| transport_err(&format!("request to '{endpoint}' failed"), e))?;

        let status = response.status().as_u16();
        let body = response
            .into_body()
            .collect()
            .await
            .map_err(|e| transport_err(&format!("reading response from '{endpoint}'"), e))?
            .to_bytes();

        drop(sender);
        conn_task.abort();

        if let Some(observer) = &self.observer {
            observer.on_response(endpoint, status, &body);
        }

        if status == 200 || status == 204 {
            Ok(body)
        } else {
            Err(MonitorError::HttpStatus {
                status,
                endpoint: endpoint.to_string(),
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;
    use std::sync::atomic::{AtomicU16, Ordering};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::UnixListener;

    /// Serves canned HTTP responses on a Unix socket, one per connection.
    async fn serve_one(socket: &Path, status_line: &'static str, body: &'static str) {
        let listener = UnixListener::bind(socket).unwrap();
        tokio::spawn(async move {
            while let Ok((mut stream, _)) = listener.accept().await {
                let mut buf = [0u8; 4096];
                let _ = stream.read(&mut buf).await;
                let response = format!(
                    "HTTP/1.1 {status_line}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
                    body.len()
                );
                let _ = stream.write_all(response.as_bytes()).await;
            }
        });
    }

    #[tokio::test]
    async fn success_status_yields_body() {
        let dir = tempfile::tempdir().unwrap();
        let socket = dir.path().join("api.sock");
        serve_one(&socket, "200 OK", "{\"state\":\"Running\"}").await;

        let transport = UnixTransport::new(&socket);
        let body = transport
            .request(Method::GET, "vm.info", None)
            .await
            .unwrap();
        assert_eq!(&body[..], b"{\"state\":\"Running\"}");
    }

    #[tokio::test]
    async fn error_status_is_reported_with_code() {
        let dir = tempfile::tempdir().unwrap();
        let socket = dir.path().join("api.sock");
        serve_one(&socket, "500 Internal Server Error", "").await;

        let transport = UnixTransport::new(&socket);
        let err = transport
            .request(Method::PUT, "vm.boot", None)
            .await
            .unwrap_err();
        match err {
            MonitorError::HttpStatus { status, endpoint } => {
                assert_eq!(status, 500);
                assert_eq!(endpoint, "vm.boot");
            }
            other => panic!("expected HttpStatus, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn missing_socket_is_a_transport_error() {
        let transport = UnixTransport::new("/nonexistent/api.sock");
        let err = transport
            .request(Method::GET, "vmm.ping", None)
            .await
            .unwrap_err();
        assert!(matches!(err, MonitorError::Transport(_)), "got {err:?}");
    }

    #[tokio::test]
    async fn observer_sees_both_directions() {
        struct Counter {
            requests: AtomicU16,
            responses: AtomicU16,
        }
        impl WireObserver for Counter {
            fn on_request(&self, _: &Method, _: &str, _: &[u8]) {
                self.requests.fetch_add(1, Ordering::SeqCst);
            }
            fn on_response(&self, _: &str, status: u16, _: &[u8]) {
                assert_eq!(status, 204);
                self.responses.fetch_add(1, Ordering::SeqCst);
            }
        }

        let dir = tempfile::tempdir().unwrap();
        let socket = dir.path().join("api.sock");
        serve_one(&socket, "204 No Content", "").await;

        let counter = Arc::new(Counter {
            requests: AtomicU16::new(0),
            responses: AtomicU16::new(0),
        });
        let transport = UnixTransport::new(&socket).with_observer(counter.clone());
        transport
            .request(Method::PUT, "vm.resume", None)
            .await
            .unwrap();
        assert_eq!(counter.requests.load(Ordering::SeqCst), 1);
        assert_eq!(counter.responses.load(Ordering::SeqCst), 1);
    }
}
