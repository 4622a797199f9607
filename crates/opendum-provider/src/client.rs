use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::StreamExt;
use wreq::{Client, Method, Proxy};

use crate::{ProviderError, ProviderResult};

/// Outbound HTTP seam. The engine talks to upstreams through this trait
/// so tests can script responses.
#[async_trait]
pub trait UpstreamTransport: Send + Sync {
    async fn send(&self, req: UpstreamRequest) -> ProviderResult<UpstreamResponse>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HttpMethod {
    Get,
    Post,
}

#[derive(Debug, Clone)]
pub struct UpstreamRequest {
    pub method: HttpMethod,
    pub url: String,
    pub headers: Vec<(String, String)>,
    pub body: Option<Bytes>,
    pub is_stream: bool,
}

impl UpstreamRequest {
    pub fn post_json(url: impl Into<String>, body: Bytes) -> Self {
        Self {
            method: HttpMethod::Post,
            url: url.into(),
            headers: vec![("content-type".to_string(), "application/json".to_string())],
            body: Some(body),
            is_stream: false,
        }
    }

    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn streaming(mut self) -> Self {
        self.is_stream = true;
        self
    }
}

#[derive(Debug)]
pub enum UpstreamBody {
    Bytes(Bytes),
    Stream(tokio::sync::mpsc::Receiver<Bytes>),
}

#[derive(Debug)]
pub struct UpstreamResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: UpstreamBody,
}

impl UpstreamResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Buffered body text; empty for streaming bodies.
    pub fn body_text(&self) -> String {
        match &self.body {
            UpstreamBody::Bytes(bytes) => String::from_utf8_lossy(bytes).into_owned(),
            UpstreamBody::Stream(_) => String::new(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub proxy: Option<String>,
    pub connect_timeout: Duration,
    pub request_timeout: Duration,
    /// Per-chunk read deadline for generative streams.
    pub stream_idle_timeout: Duration,
    /// Read deadline for short control-plane calls (OAuth, quota).
    pub control_timeout: Duration,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            proxy: None,
            connect_timeout: Duration::from_secs(5),
            request_timeout: Duration::from_secs(86400),
            stream_idle_timeout: Duration::from_secs(120),
            control_timeout: Duration::from_secs(10),
        }
    }
}

/// Shared outbound HTTP client. One underlying client is cached per
/// proxy configuration so proxy changes do not tear down live streams.
#[derive(Clone)]
pub struct HttpClient {
    config: HttpClientConfig,
    clients: Arc<Mutex<HashMap<Option<String>, Client>>>,
}

impl HttpClient {
    pub fn new(config: HttpClientConfig) -> ProviderResult<Self> {
        let proxy = normalize_proxy(config.proxy.clone());
        let initial = build_client(&config, proxy.as_deref()).map_err(map_transport)?;
        let mut clients = HashMap::new();
        clients.insert(proxy, initial);
        Ok(Self {
            config,
            clients: Arc::new(Mutex::new(clients)),
        })
    }

    pub async fn send(&self, req: UpstreamRequest) -> ProviderResult<UpstreamResponse> {
        let client = self.client_for_proxy(normalize_proxy(self.config.proxy.clone()))?;
        let method = match req.method {
            HttpMethod::Get => Method::GET,
            HttpMethod::Post => Method::POST,
        };
        let mut builder = client.request(method, &req.url);
        for (name, value) in &req.headers {
            builder = builder.header(name, value);
        }
        if let Some(body) = req.body {
            builder = builder.body(body);
        }

        let resp = builder.send().await.map_err(map_transport)?;
        let status = resp.status().as_u16();
        let headers = collect_headers(resp.headers());

        let want_stream = req.is_stream && (200..300).contains(&status);
        if !want_stream {
            let bytes = resp.bytes().await.map_err(map_transport)?;
            return Ok(UpstreamResponse {
                status,
                headers,
                body: UpstreamBody::Bytes(bytes),
            });
        }

        let idle_timeout = self.config.stream_idle_timeout;
        let (tx, rx) = tokio::sync::mpsc::channel::<Bytes>(16);
        tokio::spawn(async move {
            let mut stream = resp.bytes_stream();
            loop {
                let next = tokio::time::timeout(idle_timeout, stream.next()).await;
                let Ok(item) = next else {
                    break;
                };
                let Some(item) = item else {
                    break;
                };
                let Ok(chunk) = item else {
                    break;
                };
                if tx.send(chunk).await.is_err() {
                    // Receiver dropped: the caller went away, stop reading.
                    break;
                }
            }
        });

        Ok(UpstreamResponse {
            status,
            headers,
            body: UpstreamBody::Stream(rx),
        })
    }

    /// Short-deadline JSON POST used by OAuth and discovery endpoints.
    pub async fn post_json_value(
        &self,
        url: &str,
        headers: &[(&str, String)],
        body: &serde_json::Value,
    ) -> ProviderResult<serde_json::Value> {
        let payload =
            serde_json::to_vec(body).map_err(|err| ProviderError::Other(err.to_string()))?;
        let mut req = UpstreamRequest::post_json(url, Bytes::from(payload));
        for (name, value) in headers {
            req = req.header(*name, value.clone());
        }
        self.expect_json(req).await
    }

    /// Short-deadline form POST used by token endpoints.
    pub async fn post_form(
        &self,
        url: &str,
        headers: &[(&str, String)],
        body: String,
    ) -> ProviderResult<serde_json::Value> {
        let mut req = UpstreamRequest {
            method: HttpMethod::Post,
            url: url.to_string(),
            headers: vec![(
                "content-type".to_string(),
                "application/x-www-form-urlencoded".to_string(),
            )],
            body: Some(Bytes::from(body)),
            is_stream: false,
        };
        for (name, value) in headers {
            req = req.header(*name, value.clone());
        }
        self.expect_json(req).await
    }

    async fn expect_json(&self, req: UpstreamRequest) -> ProviderResult<serde_json::Value> {
        let resp = tokio::time::timeout(self.config.control_timeout, self.send(req))
            .await
            .map_err(|_| ProviderError::Transport("control request timed out".to_string()))??;
        let body = resp.body_text();
        if !resp.is_success() {
            return Err(ProviderError::Http {
                status: resp.status,
                body,
            });
        }
        serde_json::from_str(&body).map_err(|err| ProviderError::Other(err.to_string()))
    }

    fn client_for_proxy(&self, proxy: Option<String>) -> ProviderResult<Client> {
        let mut guard = self
            .clients
            .lock()
            .map_err(|_| ProviderError::Other("client cache lock failed".to_string()))?;
        if let Some(client) = guard.get(&proxy) {
            return Ok(client.clone());
        }
        let client = build_client(&self.config, proxy.as_deref()).map_err(map_transport)?;
        guard.insert(proxy, client.clone());
        Ok(client)
    }
}

fn normalize_proxy(value: Option<String>) -> Option<String> {
    value
        .map(|item| item.trim().to_string())
        .filter(|item| !item.is_empty())
}

fn build_client(config: &HttpClientConfig, proxy: Option<&str>) -> Result<Client, wreq::Error> {
    let mut builder = Client::builder()
        .connect_timeout(config.connect_timeout)
        .timeout(config.request_timeout)
        .read_timeout(config.stream_idle_timeout);
    if let Some(proxy) = proxy {
        builder = builder.proxy(Proxy::all(proxy)?);
    }
    builder.build()
}

fn collect_headers(map: &wreq::header::HeaderMap) -> Vec<(String, String)> {
    let mut out = Vec::new();
    for (name, value) in map {
        if let Ok(text) = value.to_str() {
            out.push((name.as_str().to_string(), text.to_string()));
        }
    }
    out
}

fn map_transport(err: wreq::Error) -> ProviderError {
    ProviderError::Transport(err.to_string())
}

#[async_trait]
impl UpstreamTransport for HttpClient {
    async fn send(&self, req: UpstreamRequest) -> ProviderResult<UpstreamResponse> {
        HttpClient::send(self, req).await
    }
}
