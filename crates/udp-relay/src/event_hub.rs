// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Azure Event Hubs sink speaking the REST batch-send API.
//!
//! Text payloads are posted together as a JSON array of `{"Body": "<payload>"}` objects, which
//! the service stores as the exact UTF-8 bytes of each string. A payload that is not valid
//! UTF-8 cannot be a JSON string; it is posted alone as the raw body of a single-event
//! request. Every request is authorized with a shared-access-signature token derived from
//! the namespace connection string.
//!
//! Batch size accounting matches the serialized JSON body exactly, so no request built from
//! a batch accepted by [`Batch::try_add`] exceeds the configured service limit.

use std::fmt::Debug;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use hmac::{Hmac, Mac};
use reqwest::{header, StatusCode};
use serde::Serialize;
use sha2::Sha256;
use tracing::{debug, error};

use crate::batch::{Batch, BatchLimits};
use crate::errors::{RelayError, SinkError};
use crate::sink::RemoteSink;

type HmacSha256 = Hmac<Sha256>;

const BATCH_CONTENT_TYPE: &str = "application/vnd.microsoft.servicebus.json";
const EVENT_CONTENT_TYPE: &str = "application/atom+xml;type=entry;charset=utf-8";
const API_VERSION: &str = "2014-01";
const SAS_TOKEN_TTL: Duration = Duration::from_secs(3600);
// `{"Body":""}`
const EVENT_FRAMING_BYTES: usize = 11;

/// Parsed `Endpoint=sb://...;SharedAccessKeyName=...;SharedAccessKey=...` string.
#[derive(Clone, PartialEq, Eq)]
pub struct ConnectionString {
    pub host: String,
    pub key_name: String,
    key: String,
    pub entity_path: Option<String>,
}

impl ConnectionString {
    pub fn parse(raw: &str) -> Result<Self, RelayError> {
        let mut endpoint = None;
        let mut key_name = None;
        let mut key = None;
        let mut entity_path = None;

        let segments = raw.split(';').map(str::trim).filter(|p| !p.is_empty());
        for (index, part) in segments.enumerate() {
            // Keys are base64 and may end in '=', so only split on the first one.
            let Some((name, value)) = part.split_once('=') else {
                return Err(RelayError::InvalidConnectionString(format!(
                    "segment {} is not a key=value pair",
                    index
                )));
            };
            match name.trim().to_ascii_lowercase().as_str() {
                "endpoint" => endpoint = Some(value.trim().to_string()),
                "sharedaccesskeyname" => key_name = Some(value.trim().to_string()),
                "sharedaccesskey" => key = Some(value.trim().to_string()),
                "entitypath" => entity_path = Some(value.trim().to_string()),
                other => debug!("Ignoring connection string segment '{}'", other),
            }
        }

        let endpoint = endpoint.ok_or_else(|| missing("Endpoint"))?;
        let host = endpoint
            .strip_prefix("sb://")
            .map(|rest| rest.trim_end_matches('/'))
            .filter(|host| !host.is_empty() && !host.contains('/'))
            .ok_or_else(|| {
                RelayError::InvalidConnectionString(format!(
                    "Endpoint must look like sb://<namespace>/, got '{}'",
                    endpoint
                ))
            })?
            .to_string();

        Ok(ConnectionString {
            host,
            key_name: key_name.ok_or_else(|| missing("SharedAccessKeyName"))?,
            key: key.ok_or_else(|| missing("SharedAccessKey"))?,
            entity_path: entity_path.filter(|p| !p.is_empty()),
        })
    }

    /// Picks the hub to send to from `EntityPath` and the separately configured name.
    pub fn resolve_hub(&self, configured: Option<&str>) -> Result<String, RelayError> {
        let configured = configured.map(str::trim).filter(|name| !name.is_empty());
        match (self.entity_path.as_deref(), configured) {
            (Some(path), Some(name)) if path != name => Err(RelayError::InvalidConfig(format!(
                "EVENT_HUB_NAME '{}' does not match EntityPath '{}' of the connection string",
                name, path
            ))),
            (Some(hub), _) | (None, Some(hub)) => Ok(hub.to_string()),
            (None, None) => Err(RelayError::InvalidConfig(
                "EVENT_HUB_NAME is not set and the connection string has no EntityPath"
                    .to_string(),
            )),
        }
    }
}

impl Debug for ConnectionString {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionString")
            .field("host", &self.host)
            .field("key_name", &self.key_name)
            .field("entity_path", &self.entity_path)
            .finish_non_exhaustive()
    }
}

fn missing(name: &str) -> RelayError {
    RelayError::InvalidConnectionString(format!("missing {}", name))
}

/// Builds a `SharedAccessSignature` authorization header value for `resource_uri`.
pub fn sas_token(
    resource_uri: &str,
    key_name: &str,
    key: &str,
    expiry: u64,
) -> Result<String, SinkError> {
    let encoded_uri = urlencoding::encode(resource_uri);
    let string_to_sign = format!("{}\n{}", encoded_uri, expiry);
    let mut mac = HmacSha256::new_from_slice(key.as_bytes())
        .map_err(|e| SinkError::Payload(format!("Invalid shared access key: {}", e)))?;
    mac.update(string_to_sign.as_bytes());
    let signature = STANDARD.encode(mac.finalize().into_bytes());
    Ok(format!(
        "SharedAccessSignature sr={}&sig={}&se={}&skn={}",
        encoded_uri,
        urlencoding::encode(&signature),
        expiry,
        key_name
    ))
}

/// Serialized size of one payload inside the batch body, including its separator.
///
/// Payloads that are not UTF-8 are sent on their own; they are charged their raw length
/// plus the same framing so the limit still bounds that request.
#[must_use]
pub fn event_size(payload: &[u8]) -> usize {
    let body = match std::str::from_utf8(payload) {
        Ok(text) => escaped_len(text),
        Err(_) => payload.len(),
    };
    body + EVENT_FRAMING_BYTES + 1
}

// Length of `text` as a JSON string body, matching serde_json's escaping.
fn escaped_len(text: &str) -> usize {
    text.bytes()
        .map(|b| match b {
            b'"' | b'\\' | b'\x08' | b'\x0c' | b'\n' | b'\r' | b'\t' => 2,
            0x00..=0x1f => 6,
            _ => 1,
        })
        .sum()
}

#[derive(Serialize)]
struct EventBody<'a> {
    #[serde(rename = "Body")]
    body: &'a str,
}

/// One HTTP request worth of events, in batch order.
#[derive(Debug, PartialEq, Eq)]
enum Request<'a> {
    Text(Vec<&'a str>),
    Binary(&'a [u8]),
}

/// Groups consecutive text payloads into one batch request; every other payload gets its own.
fn plan_requests(batch: &Batch) -> Vec<Request<'_>> {
    let mut requests = Vec::new();
    for payload in batch.payloads() {
        match std::str::from_utf8(payload.bytes()) {
            Ok(text) => match requests.last_mut() {
                Some(Request::Text(events)) => events.push(text),
                _ => requests.push(Request::Text(vec![text])),
            },
            Err(_) => requests.push(Request::Binary(payload.bytes())),
        }
    }
    requests
}

fn serialize_events(events: &[&str]) -> Result<Vec<u8>, SinkError> {
    let events: Vec<EventBody<'_>> = events.iter().map(|body| EventBody { body }).collect();
    serde_json::to_vec(&events).map_err(|e| SinkError::Payload(e.to_string()))
}

pub struct EventHubConfig {
    pub connection_string: ConnectionString,
    pub hub_name: String,
    /// Largest request body the hub accepts.
    pub max_batch_size_bytes: usize,
    pub timeout: Duration,
    pub https_proxy: Option<String>,
    /// Replaces `https://<namespace>` as the base URL, for tests and private endpoints.
    pub endpoint_override: Option<String>,
}

#[derive(Debug, Clone)]
pub struct EventHubSink {
    client: reqwest::Client,
    messages_url: String,
    resource_uri: String,
    connection_string: ConnectionString,
    limits: BatchLimits,
}

impl EventHubSink {
    pub fn new(config: EventHubConfig) -> Result<Self, RelayError> {
        // The closing bracket of the JSON array is the only byte not covered by event_size.
        if config.max_batch_size_bytes < 2 {
            return Err(RelayError::InvalidConfig(format!(
                "Maximum batch size of {} bytes is too small",
                config.max_batch_size_bytes
            )));
        }

        let mut builder = reqwest::Client::builder().timeout(config.timeout);
        if let Some(proxy) = &config.https_proxy {
            let proxy = reqwest::Proxy::https(proxy)
                .map_err(|e| RelayError::SinkCreation(format!("Invalid HTTPS proxy: {}", e)))?;
            builder = builder.proxy(proxy);
        }
        let client = builder
            .build()
            .map_err(|e| RelayError::SinkCreation(e.to_string()))?;

        let base_url = config
            .endpoint_override
            .as_deref()
            .map(|url| url.trim_end_matches('/').to_string())
            .unwrap_or_else(|| format!("https://{}", config.connection_string.host));

        Ok(EventHubSink {
            client,
            messages_url: format!(
                "{}/{}/messages?timeout=60&api-version={}",
                base_url, config.hub_name, API_VERSION
            ),
            resource_uri: format!(
                "https://{}/{}",
                config.connection_string.host, config.hub_name
            ),
            connection_string: config.connection_string,
            limits: BatchLimits::new(config.max_batch_size_bytes - 1, event_size),
        })
    }

    #[must_use]
    pub fn messages_url(&self) -> &str {
        &self.messages_url
    }

    fn authorization(&self) -> Result<String, SinkError> {
        let expiry = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|now| now + SAS_TOKEN_TTL)
            .unwrap_or(SAS_TOKEN_TTL)
            .as_secs();
        sas_token(
            &self.resource_uri,
            &self.connection_string.key_name,
            &self.connection_string.key,
            expiry,
        )
    }

    async fn post(
        &self,
        content_type: &str,
        events: usize,
        body: Vec<u8>,
    ) -> Result<(), SinkError> {
        let authorization = self.authorization()?;
        debug!(
            "Submitting {} events ({} bytes) to {}",
            events,
            body.len(),
            self.messages_url
        );

        let resp = self
            .client
            .post(&self.messages_url)
            .header(header::AUTHORIZATION, authorization)
            .header(header::CONTENT_TYPE, content_type)
            .body(body)
            .send()
            .await
            .map_err(|e| SinkError::Destination(e.status(), e.to_string()))?;

        let status = resp.status();
        if status == StatusCode::CREATED || status.is_success() {
            return Ok(());
        }
        let text = resp.text().await.unwrap_or_default();
        if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            error!("Event Hub rejected the shared access signature, check the connection string");
        }
        Err(SinkError::Destination(Some(status), text))
    }
}

#[async_trait]
impl RemoteSink for EventHubSink {
    fn batch_limits(&self) -> BatchLimits {
        self.limits
    }

    /// Requests go out in batch order. A failure part way through returns the error, and a
    /// retry of the batch re-sends the requests that already succeeded.
    async fn submit_batch(&self, batch: &Batch) -> Result<(), SinkError> {
        if batch.is_empty() {
            debug!("Skipping submission of an empty batch");
            return Ok(());
        }
        for request in plan_requests(batch) {
            let (content_type, events, body) = match request {
                Request::Text(events) => {
                    (BATCH_CONTENT_TYPE, events.len(), serialize_events(&events)?)
                }
                Request::Binary(bytes) => (EVENT_CONTENT_TYPE, 1, bytes.to_vec()),
            };
            self.post(content_type, events, body).await?;
        }
        Ok(())
    }
}
