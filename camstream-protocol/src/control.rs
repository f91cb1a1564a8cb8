//! HTTP Control Client
//!
//! Thin wrapper over the capture server's companion HTTP API: health,
//! shutdown, camera detection, camera group management and recording.
//! Request and response bodies are passed through as JSON values; the
//! server owns their schema.

use crate::{Result, StreamError};
use reqwest::{Client, Method, Response};
use serde_json::{json, Value};
use std::time::Duration;
use tracing::{debug, info};

/// Default server port
pub const DEFAULT_PORT: u16 = 8006;

/// Path of the streaming endpoint
pub const WEBSOCKET_PATH: &str = "/skellycam/websocket/connect";

const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// URLs of every server endpoint, derived from one HTTP base URL
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerEndpoints {
    base: String,
}

impl ServerEndpoints {
    /// Build endpoints from a base such as `http://localhost:8006`
    pub fn new(base_url: impl Into<String>) -> Result<Self> {
        let base = base_url.into().trim_end_matches('/').to_string();
        if !(base.starts_with("http://") || base.starts_with("https://")) {
            return Err(StreamError::Configuration(format!(
                "server URL must start with http:// or https://: {}",
                base
            )));
        }
        Ok(Self { base })
    }

    pub fn from_host(host: &str, port: u16, use_tls: bool) -> Result<Self> {
        let scheme = if use_tls { "https" } else { "http" };
        Self::new(format!("{}://{}:{}", scheme, host, port))
    }

    pub fn base_url(&self) -> &str {
        &self.base
    }

    /// Streaming URL on the same host (`http` → `ws`, `https` → `wss`)
    pub fn ws_url(&self) -> String {
        self.ws_url_with_path(WEBSOCKET_PATH)
    }

    pub fn ws_url_with_path(&self, path: &str) -> String {
        let ws_base = if let Some(rest) = self.base.strip_prefix("https://") {
            format!("wss://{}", rest)
        } else if let Some(rest) = self.base.strip_prefix("http://") {
            format!("ws://{}", rest)
        } else {
            self.base.clone()
        };
        format!("{}{}", ws_base, path)
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base, path)
    }

    pub fn health(&self) -> String {
        self.url("/health")
    }

    pub fn shutdown(&self) -> String {
        self.url("/shutdown")
    }

    pub fn detect_cameras(&self) -> String {
        self.url("/skellycam/camera/detect")
    }

    pub fn create_group(&self) -> String {
        self.url("/skellycam/camera/group/apply")
    }

    pub fn close_all(&self) -> String {
        self.url("/skellycam/camera/group/close/all")
    }

    pub fn update_configs(&self) -> String {
        self.url("/skellycam/camera/update")
    }

    pub fn pause_unpause(&self) -> String {
        self.url("/skellycam/camera/group/all/pause_unpause")
    }

    pub fn start_recording(&self) -> String {
        self.url("/skellycam/camera/group/all/record/start")
    }

    pub fn stop_recording(&self) -> String {
        self.url("/skellycam/camera/group/all/record/stop")
    }
}

impl Default for ServerEndpoints {
    fn default() -> Self {
        Self {
            base: format!("http://localhost:{}", DEFAULT_PORT),
        }
    }
}

/// Client for the companion HTTP API
#[derive(Debug, Clone)]
pub struct ControlClient {
    http: Client,
    endpoints: ServerEndpoints,
}

impl ControlClient {
    pub fn new(endpoints: ServerEndpoints) -> Result<Self> {
        Self::with_timeout(endpoints, DEFAULT_REQUEST_TIMEOUT)
    }

    pub fn with_timeout(endpoints: ServerEndpoints, timeout: Duration) -> Result<Self> {
        let http = Client::builder()
            .timeout(timeout)
            .user_agent(concat!("camstream/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self { http, endpoints })
    }

    pub fn endpoints(&self) -> &ServerEndpoints {
        &self.endpoints
    }

    /// `true` when the server answers its health check
    pub async fn health(&self) -> Result<bool> {
        let response = self.http.get(self.endpoints.health()).send().await?;
        let healthy = response.status().is_success();
        debug!("Health check: {}", response.status());
        Ok(healthy)
    }

    pub async fn shutdown(&self) -> Result<()> {
        info!("Requesting server shutdown");
        self.request(Method::GET, self.endpoints.shutdown(), None)
            .await
            .map(|_| ())
    }

    /// Detect attached cameras
    pub async fn detect_cameras(&self, filter_virtual: bool) -> Result<Value> {
        let body = json!({ "filter_virtual": filter_virtual });
        self.request(Method::POST, self.endpoints.detect_cameras(), Some(body))
            .await
    }

    /// Open a camera group with the given per-camera configs
    pub async fn create_group(&self, camera_configs: Value) -> Result<Value> {
        let body = json!({ "camera_configs": camera_configs });
        self.request(Method::POST, self.endpoints.create_group(), Some(body))
            .await
    }

    pub async fn update_configs(&self, camera_configs: Value) -> Result<Value> {
        let body = json!({ "camera_configs": camera_configs });
        self.request(Method::PUT, self.endpoints.update_configs(), Some(body))
            .await
    }

    pub async fn close_all(&self) -> Result<()> {
        self.request(Method::DELETE, self.endpoints.close_all(), None)
            .await
            .map(|_| ())
    }

    pub async fn pause_unpause(&self) -> Result<Value> {
        self.request(Method::GET, self.endpoints.pause_unpause(), None)
            .await
    }

    /// Start recording on every camera, optionally into a named recording
    pub async fn start_recording(&self, recording_name: Option<&str>) -> Result<Value> {
        let body = match recording_name {
            Some(name) => json!({ "recording_name": name }),
            None => json!({}),
        };
        info!("Starting recording {:?}", recording_name);
        self.request(Method::POST, self.endpoints.start_recording(), Some(body))
            .await
    }

    pub async fn stop_recording(&self) -> Result<Value> {
        info!("Stopping recording");
        self.request(Method::GET, self.endpoints.stop_recording(), None)
            .await
    }

    async fn request(&self, method: Method, url: String, body: Option<Value>) -> Result<Value> {
        debug!("{} {}", method, url);
        let mut request = self.http.request(method, &url);
        if let Some(body) = body {
            request = request.json(&body);
        }
        let response = request.send().await?;
        read_json(url, response).await
    }
}

/// Map a response to its JSON body, or to `HttpStatus` when not 2xx
///
/// An empty success body becomes `Value::Null`.
async fn read_json(endpoint: String, response: Response) -> Result<Value> {
    let status = response.status();
    let text = response.text().await?;

    if !status.is_success() {
        return Err(StreamError::HttpStatus {
            endpoint,
            status: status.as_u16(),
            body: text,
        });
    }

    if text.trim().is_empty() {
        return Ok(Value::Null);
    }
    Ok(serde_json::from_str(&text)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    #[test]
    fn test_endpoints_from_base() {
        let endpoints = ServerEndpoints::new("http://localhost:8006/").unwrap();
        assert_eq!(endpoints.base_url(), "http://localhost:8006");
        assert_eq!(endpoints.health(), "http://localhost:8006/health");
        assert_eq!(
            endpoints.close_all(),
            "http://localhost:8006/skellycam/camera/group/close/all"
        );
        assert_eq!(
            endpoints.ws_url(),
            "ws://localhost:8006/skellycam/websocket/connect"
        );
    }

    #[test]
    fn test_tls_maps_to_wss() {
        let endpoints = ServerEndpoints::from_host("capture.local", 443, true).unwrap();
        assert_eq!(
            endpoints.ws_url(),
            "wss://capture.local:443/skellycam/websocket/connect"
        );
    }

    #[test]
    fn test_rejects_non_http_base() {
        assert!(matches!(
            ServerEndpoints::new("ws://localhost:8006"),
            Err(StreamError::Configuration(_))
        ));
    }

    #[test]
    fn test_default_endpoints() {
        assert_eq!(
            ServerEndpoints::default().base_url(),
            "http://localhost:8006"
        );
    }

    /// Serve exactly one HTTP response, returning the raw request text
    async fn one_shot_server(
        status_line: &'static str,
        body: &'static str,
    ) -> (String, tokio::task::JoinHandle<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let task = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let request = read_request(&mut socket).await;
            let response = format!(
                "{}\r\ncontent-type: application/json\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{}",
                status_line,
                body.len(),
                body
            );
            socket.write_all(response.as_bytes()).await.unwrap();
            socket.shutdown().await.ok();
            request
        });
        (format!("http://{}", addr), task)
    }

    /// Read headers plus a `content-length` body
    async fn read_request(socket: &mut tokio::net::TcpStream) -> String {
        let mut buf = Vec::new();
        let mut chunk = [0u8; 4096];
        loop {
            let n = socket.read(&mut chunk).await.unwrap();
            if n == 0 {
                break;
            }
            buf.extend_from_slice(&chunk[..n]);
            let text = String::from_utf8_lossy(&buf).to_string();
            if let Some(header_end) = text.find("\r\n\r\n") {
                let content_length = text[..header_end]
                    .lines()
                    .find_map(|line| {
                        let (name, value) = line.split_once(':')?;
                        name.eq_ignore_ascii_case("content-length")
                            .then(|| value.trim().parse::<usize>().ok())
                            .flatten()
                    })
                    .unwrap_or(0);
                if buf.len() >= header_end + 4 + content_length {
                    return text;
                }
            }
        }
        String::from_utf8_lossy(&buf).to_string()
    }

    #[tokio::test]
    async fn test_detect_returns_json() {
        let (base, server) = one_shot_server("HTTP/1.1 200 OK", r#"{"cameras":[{"index":0}]}"#).await;
        let client = ControlClient::new(ServerEndpoints::new(base).unwrap()).unwrap();

        let value = client.detect_cameras(true).await.unwrap();
        assert_eq!(value["cameras"][0]["index"], 0);

        let request = server.await.unwrap();
        assert!(request.starts_with("POST /skellycam/camera/detect"));
        assert!(request.contains("filter_virtual"));
    }

    #[tokio::test]
    async fn test_error_status_maps_to_http_status() {
        let (base, server) =
            one_shot_server("HTTP/1.1 503 Service Unavailable", r#"{"detail":"busy"}"#).await;
        let client = ControlClient::new(ServerEndpoints::new(base).unwrap()).unwrap();

        let err = client.close_all().await.unwrap_err();
        match &err {
            StreamError::HttpStatus { status, body, endpoint } => {
                assert_eq!(*status, 503);
                assert!(body.contains("busy"));
                assert!(endpoint.ends_with("/skellycam/camera/group/close/all"));
            }
            other => panic!("unexpected {:?}", other),
        }
        assert!(err.is_recoverable());

        let request = server.await.unwrap();
        assert!(request.starts_with("DELETE "));
    }

    #[tokio::test]
    async fn test_empty_body_is_null() {
        let (base, server) = one_shot_server("HTTP/1.1 200 OK", "").await;
        let client = ControlClient::new(ServerEndpoints::new(base).unwrap()).unwrap();

        let value = tokio_test::assert_ok!(client.pause_unpause().await);
        assert_eq!(value, Value::Null);
        server.await.unwrap();
    }
}
