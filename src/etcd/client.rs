use std::time::Duration;

use base64::Engine;
use bytes::BytesMut;
use futures_util::StreamExt;
use serde::{Deserialize, Deserializer, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::config::EtcdConfig;

/// Timeout applied to lease grant / revoke requests.
pub const LEASE_REQUEST_TIMEOUT: Duration = Duration::from_secs(3);

/// Deserialize an i64 that may come as a JSON number or a JSON string
/// (etcd's gRPC-gateway encodes int64 as string).
fn deserialize_i64_or_string<'de, D>(deserializer: D) -> Result<Option<i64>, D::Error>
where
    D: Deserializer<'de>,
{
    use serde::de;

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum I64OrString {
        Num(i64),
        Str(String),
    }

    Option::<I64OrString>::deserialize(deserializer).and_then(|opt| match opt {
        None => Ok(None),
        Some(I64OrString::Num(n)) => Ok(Some(n)),
        Some(I64OrString::Str(s)) => s.parse::<i64>().map(Some).map_err(de::Error::custom),
    })
}

/// Shared etcd v3 HTTP/JSON client (gRPC-gateway endpoints: `/v3/kv/*`,
/// `/v3/watch`, `/v3/lease/*`, `/v3/auth/authenticate`).
///
/// Cheaply cloneable: the underlying `reqwest::Client` is an `Arc`
/// internally, so one handle is shared by every registrar and discoverer
/// an orchestrator spawns.
#[derive(Clone)]
pub struct EtcdClient {
    http: reqwest::Client,
    base_url: String,
    auth_token: Option<String>,
}

#[derive(Serialize)]
struct AuthRequest {
    name: String,
    password: String,
}

#[derive(Deserialize)]
struct AuthResponse {
    token: Option<String>,
}

#[derive(Serialize)]
struct RangeRequest {
    key: String,
    range_end: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    keys_only: Option<bool>,
}

#[derive(Deserialize)]
struct RawRangeResponse {
    #[serde(default)]
    kvs: Vec<RawKeyValue>,
    #[serde(default)]
    header: Option<ResponseHeader>,
}

#[derive(Deserialize)]
struct ResponseHeader {
    #[serde(default, deserialize_with = "deserialize_i64_or_string")]
    revision: Option<i64>,
}

#[derive(Deserialize)]
struct RawKeyValue {
    key: String,
    #[serde(default)]
    value: String,
    #[serde(default, deserialize_with = "deserialize_i64_or_string")]
    lease: Option<i64>,
}

/// A decoded key/value pair from a range read.
#[derive(Debug, Clone)]
pub struct KeyValue {
    pub key: String,
    pub value: String,
    /// Lease the key is bound to, 0 when unbound.
    pub lease: i64,
}

/// A revision-consistent prefix snapshot.
#[derive(Debug)]
pub struct RangeSnapshot {
    pub kvs: Vec<KeyValue>,
    /// Store revision the snapshot was taken at.
    pub revision: i64,
}

#[derive(Serialize)]
struct PutRequest {
    key: String,
    value: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    lease: Option<i64>,
}

#[derive(Serialize)]
struct WatchCreateRequest {
    create_request: WatchCreate,
}

#[derive(Serialize)]
struct WatchCreate {
    key: String,
    range_end: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    start_revision: Option<i64>,
}

#[derive(Deserialize)]
struct RawWatchResponse {
    #[serde(default)]
    result: Option<RawWatchResult>,
}

#[derive(Deserialize)]
struct RawWatchResult {
    #[serde(default)]
    events: Vec<RawWatchEvent>,
    #[serde(default)]
    header: Option<ResponseHeader>,
}

#[derive(Deserialize)]
struct RawWatchEvent {
    #[serde(rename = "type", default)]
    event_type: Option<String>,
    kv: Option<RawKeyValue>,
}

/// Event kind as tagged by the store's watch stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    Put,
    Delete,
}

/// A single decoded watch event.
#[derive(Debug, Clone)]
pub struct WatchEvent {
    pub kind: EventKind,
    pub key: String,
    /// Present for PUT events; DELETE events carry only the key.
    pub value: Option<String>,
}

/// One batch of watch events, delivered in store-revision order.
#[derive(Debug)]
pub struct WatchBatch {
    pub events: Vec<WatchEvent>,
    pub revision: i64,
}

#[derive(Serialize)]
struct LeaseGrantRequest {
    #[serde(rename = "TTL")]
    ttl: i64,
}

#[derive(Deserialize)]
struct LeaseGrantResponse {
    #[serde(rename = "ID")]
    id: Option<String>,
}

#[derive(Serialize)]
struct LeaseKeepAliveRequest {
    #[serde(rename = "ID")]
    id: i64,
}

#[derive(Deserialize)]
struct LeaseKeepAliveResponse {
    result: Option<LeaseKeepAliveResult>,
}

#[derive(Deserialize)]
struct LeaseKeepAliveResult {
    #[serde(rename = "TTL", default, deserialize_with = "deserialize_i64_or_string")]
    ttl: Option<i64>,
}

#[derive(Serialize)]
struct LeaseRevokeRequest {
    #[serde(rename = "ID")]
    id: i64,
}

fn b64_encode(s: &str) -> String {
    base64::engine::general_purpose::STANDARD.encode(s.as_bytes())
}

fn b64_decode(s: &str) -> anyhow::Result<String> {
    let bytes = base64::engine::general_purpose::STANDARD.decode(s)?;
    Ok(String::from_utf8(bytes)?)
}

/// Smallest key strictly greater than every key with `prefix`, base64-encoded
/// for the wire. Empty result means "to the end of the keyspace".
fn prefix_range_end(prefix: &str) -> String {
    let mut end = prefix.as_bytes().to_vec();
    for i in (0..end.len()).rev() {
        if end[i] < 0xff {
            end[i] += 1;
            end.truncate(i + 1);
            return base64::engine::general_purpose::STANDARD.encode(&end);
        }
    }
    String::new()
}

impl EtcdClient {
    /// Connect to etcd, trying each endpoint in order until one answers.
    /// Authenticates when credentials are configured. The dial timeout from
    /// the config bounds connection establishment for every later request.
    pub async fn connect(cfg: &EtcdConfig) -> anyhow::Result<Self> {
        if cfg.endpoints.is_empty() {
            anyhow::bail!("etcd: no endpoints configured");
        }

        let http = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(cfg.dial_timeout_secs))
            .build()?;
        let mut last_error: Option<anyhow::Error> = None;

        for endpoint in &cfg.endpoints {
            let base_url = normalize_endpoint(endpoint);

            let auth_token = if let (Some(user), Some(pass)) = (&cfg.username, &cfg.password) {
                match http
                    .post(format!("{}/v3/auth/authenticate", base_url))
                    .json(&AuthRequest {
                        name: user.clone(),
                        password: pass.clone(),
                    })
                    .send()
                    .await
                {
                    Ok(resp) => {
                        let auth: AuthResponse = resp.json().await?;
                        auth.token
                    }
                    Err(e) => {
                        warn!("etcd: endpoint {} auth failed: {}, trying next", base_url, e);
                        last_error = Some(e.into());
                        continue;
                    }
                }
            } else {
                // Verify connectivity with a lightweight range request.
                match http
                    .post(format!("{}/v3/kv/range", base_url))
                    .json(&RangeRequest {
                        key: b64_encode("/"),
                        range_end: String::new(),
                        keys_only: Some(true),
                    })
                    .send()
                    .await
                {
                    Ok(_) => None,
                    Err(e) => {
                        warn!(
                            "etcd: endpoint {} unreachable: {}, trying next",
                            base_url, e
                        );
                        last_error = Some(e.into());
                        continue;
                    }
                }
            };

            debug!("etcd: connected, endpoint={}", base_url);
            return Ok(Self {
                http,
                base_url,
                auth_token,
            });
        }

        Err(last_error.unwrap_or_else(|| anyhow::anyhow!("etcd: all endpoints failed")))
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn request(&self, path: &str, body: &impl serde::Serialize) -> reqwest::RequestBuilder {
        let mut req = self
            .http
            .post(format!("{}{}", self.base_url, path))
            .json(body);
        if let Some(ref token) = self.auth_token {
            req = req.header("Authorization", token);
        }
        req
    }

    /// POST JSON to an etcd endpoint, failing on non-2xx with body context.
    async fn post_json(
        &self,
        path: &str,
        body: &impl serde::Serialize,
        timeout: Option<Duration>,
    ) -> anyhow::Result<reqwest::Response> {
        let mut req = self.request(path, body);
        if let Some(t) = timeout {
            req = req.timeout(t);
        }
        let resp = req.send().await?;
        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            anyhow::bail!("etcd {} failed: {} - {}", path, status, body);
        }
        Ok(resp)
    }

    /// Revision-consistent snapshot of all keys under `prefix`.
    pub async fn range_prefix(&self, prefix: &str) -> anyhow::Result<RangeSnapshot> {
        let raw: RawRangeResponse = self
            .post_json(
                "/v3/kv/range",
                &RangeRequest {
                    key: b64_encode(prefix),
                    range_end: prefix_range_end(prefix),
                    keys_only: None,
                },
                None,
            )
            .await?
            .json()
            .await?;

        let mut kvs = Vec::with_capacity(raw.kvs.len());
        for kv in raw.kvs {
            let key = match b64_decode(&kv.key) {
                Ok(k) => k,
                Err(e) => {
                    warn!("etcd: undecodable key in range response, skipping: {}", e);
                    continue;
                }
            };
            let value = b64_decode(&kv.value).unwrap_or_default();
            kvs.push(KeyValue {
                key,
                value,
                lease: kv.lease.unwrap_or(0),
            });
        }

        Ok(RangeSnapshot {
            kvs,
            revision: raw.header.and_then(|h| h.revision).unwrap_or(0),
        })
    }

    /// Put `value` at `key`, bound to `lease` when non-zero.
    pub async fn put(&self, key: &str, value: &str, lease: i64) -> anyhow::Result<()> {
        self.post_json(
            "/v3/kv/put",
            &PutRequest {
                key: b64_encode(key),
                value: b64_encode(value),
                lease: (lease != 0).then_some(lease),
            },
            None,
        )
        .await?;
        Ok(())
    }

    /// Grant a lease of `ttl` seconds, returning its id.
    pub async fn lease_grant(&self, ttl: i64) -> anyhow::Result<i64> {
        let grant: LeaseGrantResponse = self
            .post_json(
                "/v3/lease/grant",
                &LeaseGrantRequest { ttl },
                Some(LEASE_REQUEST_TIMEOUT),
            )
            .await?
            .json()
            .await?;
        let id: i64 = grant.id.unwrap_or_default().parse().unwrap_or(0);
        if id == 0 {
            anyhow::bail!("etcd: lease grant returned invalid id");
        }
        Ok(id)
    }

    /// Revoke a lease; the store deletes every key bound to it.
    pub async fn lease_revoke(&self, lease_id: i64) -> anyhow::Result<()> {
        self.post_json(
            "/v3/lease/revoke",
            &LeaseRevokeRequest { id: lease_id },
            Some(LEASE_REQUEST_TIMEOUT),
        )
        .await?;
        Ok(())
    }

    /// Single heartbeat. Errors when the lease is expired or not found.
    /// Returns the refreshed TTL.
    pub async fn lease_keepalive(&self, lease_id: i64) -> anyhow::Result<i64> {
        let ka: LeaseKeepAliveResponse = self
            .post_json(
                "/v3/lease/keepalive",
                &LeaseKeepAliveRequest { id: lease_id },
                Some(LEASE_REQUEST_TIMEOUT),
            )
            .await?
            .json()
            .await?;
        match ka.result.and_then(|r| r.ttl) {
            Some(ttl) if ttl > 0 => Ok(ttl),
            _ => anyhow::bail!("etcd: lease {} expired or not found", lease_id),
        }
    }

    /// Open the lazy heartbeat sequence for `lease_id`.
    ///
    /// A background producer pings the store at `interval` and forwards each
    /// acknowledgement; the first failed ping closes the sequence, which is
    /// how the consumer observes lease loss. Dropping the handle cancels the
    /// producer.
    pub fn keep_alive(&self, lease_id: i64, interval: Duration) -> LeaseKeepAlive {
        let (tx, rx) = tokio::sync::mpsc::channel(4);
        let cancel = CancellationToken::new();
        let client = self.clone();
        let token = cancel.clone();

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            // The lease was granted just before this stream opened; the first
            // immediate tick would be a redundant refresh.
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => {}
                    _ = token.cancelled() => return,
                }
                match client.lease_keepalive(lease_id).await {
                    Ok(ttl) => {
                        // A full queue only means the consumer is behind on
                        // acks; dropping one is harmless.
                        let _ = tx.try_send(KeepAliveAck { ttl });
                    }
                    Err(e) => {
                        warn!("etcd: keepalive ping failed, lease={}: {}", lease_id, e);
                        return;
                    }
                }
            }
        });

        LeaseKeepAlive { rx, cancel }
    }

    /// Open a watch stream over `prefix`, starting after `start_revision`
    /// when it is positive. Event batches arrive in store-revision order.
    pub async fn watch_prefix(
        &self,
        prefix: &str,
        start_revision: i64,
    ) -> anyhow::Result<WatchStream> {
        let resp = self
            .post_json(
                "/v3/watch",
                &WatchCreateRequest {
                    create_request: WatchCreate {
                        key: b64_encode(prefix),
                        range_end: prefix_range_end(prefix),
                        start_revision: (start_revision > 0).then_some(start_revision),
                    },
                },
                None,
            )
            .await?;
        Ok(WatchStream {
            stream: Box::pin(resp.bytes_stream()),
            buf: BytesMut::with_capacity(4096),
        })
    }
}

fn normalize_endpoint(endpoint: &str) -> String {
    let trimmed = endpoint.trim_end_matches('/');
    if trimmed.starts_with("http://") || trimmed.starts_with("https://") {
        trimmed.to_string()
    } else {
        format!("http://{}", trimmed)
    }
}

/// A heartbeat acknowledgement from the store.
#[derive(Debug, Clone, Copy)]
pub struct KeepAliveAck {
    pub ttl: i64,
}

/// Handle to the lazy keepalive sequence. `recv()` returning `None` means
/// the stream closed: the lease is lost or the store is unreachable.
pub struct LeaseKeepAlive {
    rx: tokio::sync::mpsc::Receiver<KeepAliveAck>,
    cancel: CancellationToken,
}

impl LeaseKeepAlive {
    pub async fn recv(&mut self) -> Option<KeepAliveAck> {
        self.rx.recv().await
    }
}

impl Drop for LeaseKeepAlive {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// A streaming watch connection; newline-delimited JSON frames parsed into
/// decoded event batches.
pub struct WatchStream {
    stream: std::pin::Pin<
        Box<dyn futures_util::Stream<Item = Result<bytes::Bytes, reqwest::Error>> + Send>,
    >,
    buf: BytesMut,
}

impl WatchStream {
    /// Next event batch, or `None` when the stream ends. Empty batches
    /// (watch-created confirmations, progress notifications) are skipped.
    pub async fn next_batch(&mut self) -> Option<WatchBatch> {
        loop {
            if let Some(pos) = self.buf.iter().position(|&b| b == b'\n') {
                let line_bytes = self.buf.split_to(pos + 1);
                let line = String::from_utf8_lossy(&line_bytes).trim().to_string();
                if line.is_empty() {
                    continue;
                }
                match serde_json::from_str::<RawWatchResponse>(&line) {
                    Ok(resp) => {
                        if let Some(batch) = decode_watch_result(resp) {
                            return Some(batch);
                        }
                    }
                    Err(e) => {
                        error!("etcd: watch frame parse failed: {}, line={}", e, line);
                    }
                }
                continue;
            }

            match self.stream.next().await {
                Some(Ok(chunk)) => {
                    self.buf.extend_from_slice(&chunk);
                }
                Some(Err(e)) => {
                    error!("etcd: watch stream error: {}", e);
                    return None;
                }
                None => {
                    // Trailing data without a newline.
                    if !self.buf.is_empty() {
                        let line = String::from_utf8_lossy(&self.buf).trim().to_string();
                        self.buf.clear();
                        if !line.is_empty() {
                            if let Ok(resp) = serde_json::from_str::<RawWatchResponse>(&line) {
                                if let Some(batch) = decode_watch_result(resp) {
                                    return Some(batch);
                                }
                            }
                        }
                    }
                    return None;
                }
            }
        }
    }
}

fn decode_watch_result(resp: RawWatchResponse) -> Option<WatchBatch> {
    let result = resp.result?;
    if result.events.is_empty() {
        return None;
    }

    let revision = result.header.and_then(|h| h.revision).unwrap_or(0);
    let mut events = Vec::with_capacity(result.events.len());
    for raw in result.events {
        let kind = match raw.event_type.as_deref() {
            Some("DELETE") => EventKind::Delete,
            // The gateway omits the type field for PUT (zero value).
            _ => EventKind::Put,
        };
        let Some(kv) = raw.kv else {
            warn!("etcd: watch event missing kv, skipping");
            continue;
        };
        let key = match b64_decode(&kv.key) {
            Ok(k) => k,
            Err(e) => {
                warn!("etcd: watch event key undecodable, skipping: {}", e);
                continue;
            }
        };
        let value = match kind {
            EventKind::Put => Some(b64_decode(&kv.value).unwrap_or_default()),
            EventKind::Delete => None,
        };
        events.push(WatchEvent { kind, key, value });
    }

    if events.is_empty() {
        return None;
    }
    Some(WatchBatch { events, revision })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prefix_range_end_increments_last_byte() {
        let end = prefix_range_end("/octopus/rpc/apps/user-service/");
        let decoded = base64::engine::general_purpose::STANDARD
            .decode(end)
            .unwrap();
        assert_eq!(decoded, b"/octopus/rpc/apps/user-service0");
    }

    #[test]
    fn prefix_range_end_operates_on_raw_bytes() {
        // U+00FF encodes as 0xc3 0xbf; the last byte increments to 0xc0.
        let end = prefix_range_end("a\u{ff}");
        let decoded = base64::engine::general_purpose::STANDARD
            .decode(end)
            .unwrap();
        assert_eq!(decoded, vec![b'a', 0xc3, 0xc0]);
    }

    #[test]
    fn decode_skips_empty_batches() {
        let resp = RawWatchResponse {
            result: Some(RawWatchResult {
                events: vec![],
                header: None,
            }),
        };
        assert!(decode_watch_result(resp).is_none());
    }

    #[test]
    fn decode_tags_delete_events() {
        let resp = RawWatchResponse {
            result: Some(RawWatchResult {
                events: vec![RawWatchEvent {
                    event_type: Some("DELETE".to_string()),
                    kv: Some(RawKeyValue {
                        key: b64_encode("/octopus/rpc/apps/a/1.2.3.4:50051"),
                        value: String::new(),
                        lease: None,
                    }),
                }],
                header: Some(ResponseHeader { revision: Some(7) }),
            }),
        };
        let batch = decode_watch_result(resp).unwrap();
        assert_eq!(batch.revision, 7);
        assert_eq!(batch.events.len(), 1);
        assert_eq!(batch.events[0].kind, EventKind::Delete);
        assert_eq!(batch.events[0].key, "/octopus/rpc/apps/a/1.2.3.4:50051");
        assert!(batch.events[0].value.is_none());
    }

    #[test]
    fn normalize_endpoint_adds_scheme() {
        assert_eq!(normalize_endpoint("127.0.0.1:2379"), "http://127.0.0.1:2379");
        assert_eq!(
            normalize_endpoint("http://etcd:2379/"),
            "http://etcd:2379"
        );
    }
}
