//! The inner HTTP handler: everything that happens after TLS termination.
//!
//! Three gates, in order: the endpoint allowlist, the sentinel check, and
//! only then the key swap and upstream forward. A request that fails any
//! gate never touches the network.

use std::sync::Arc;

use {
    futures::TryStreamExt,
    http::{Request, Response, StatusCode, header},
    http_body_util::{BodyExt, Full, StreamBody, combinators::UnsyncBoxBody},
    hyper::body::{Bytes, Frame},
    secrecy::ExposeSecret,
    tracing::{debug, warn},
};

use crate::providers::{KeyInjection, SentinelMap};

pub type BoxedBody = UnsyncBoxBody<Bytes, std::io::Error>;

/// Headers never copied between the client and the upstream.
const HOP_BY_HOP: &[header::HeaderName] = &[
    header::CONNECTION,
    header::TRANSFER_ENCODING,
    header::HOST,
    header::CONTENT_LENGTH,
];

pub struct InnerHandler {
    sentinels: Arc<SentinelMap>,
    http: reqwest::Client,
}

impl InnerHandler {
    pub fn new(sentinels: Arc<SentinelMap>) -> Self {
        Self {
            sentinels,
            // No connection-level timeout: streaming completions run long.
            http: reqwest::Client::new(),
        }
    }

    /// Handle one decrypted request CONNECTed to `host`.
    pub async fn handle<B>(&self, host: &str, req: Request<B>) -> Response<BoxedBody>
    where
        B: hyper::body::Body<Data = Bytes>,
        B::Error: std::fmt::Display,
    {
        let Some(entry) = self.sentinels.get(host) else {
            // CONNECT already filtered hosts; a miss here means no real key
            // is configured for this provider.
            return reject(StatusCode::FORBIDDEN, "no credentials for host");
        };

        let method = req.method().as_str().to_string();
        let path_and_query = req
            .uri()
            .path_and_query()
            .map(|pq| pq.as_str().to_string())
            .unwrap_or_else(|| "/".to_string());

        if !entry.provider.endpoint_allowed(&method, &path_and_query) {
            warn!(host, method, path = %path_and_query, "endpoint not on allowlist");
            return reject(StatusCode::FORBIDDEN, "endpoint not allowed");
        }

        let presented = extract_credential(req.headers(), &entry.provider.key_injection);
        let Some(presented) = presented else {
            warn!(host, "request carried no credential");
            return reject(StatusCode::FORBIDDEN, "missing credential");
        };
        let Some(real_key) = self.sentinels.swap(host, &presented) else {
            // An unknown credential is never laundered upstream.
            warn!(host, "credential does not match the issued sentinel");
            return reject(StatusCode::FORBIDDEN, "invalid credential");
        };

        // Build the upstream request: same method, path, and headers, with
        // the sentinel swapped for the real key.
        let url = format!("https://{host}{path_and_query}");
        let mut upstream = self
            .http
            .request(
                reqwest::Method::from_bytes(method.as_bytes())
                    .unwrap_or(reqwest::Method::POST),
                &url,
            );
        for (name, value) in req.headers() {
            if HOP_BY_HOP.contains(name) || is_credential_header(name, &entry.provider.key_injection)
            {
                continue;
            }
            upstream = upstream.header(name, value);
        }
        upstream = match &entry.provider.key_injection {
            KeyInjection::Header(name) => upstream.header(*name, real_key.expose_secret()),
            KeyInjection::Bearer => upstream.header(
                header::AUTHORIZATION,
                format!("Bearer {}", real_key.expose_secret()),
            ),
        };

        let body = match req.into_body().collect().await {
            Ok(collected) => collected.to_bytes(),
            Err(e) => {
                warn!(host, error = %e, "failed to read request body");
                return reject(StatusCode::BAD_REQUEST, "unreadable body");
            },
        };

        debug!(host, method, path = %path_and_query, "forwarding to upstream");
        let response = match upstream.body(body).send().await {
            Ok(response) => response,
            Err(e) => {
                // Failure before any response headers: a clean 502.
                warn!(host, error = %e, "upstream request failed");
                return reject(StatusCode::BAD_GATEWAY, "upstream unreachable");
            },
        };

        // Stream the response back chunk-by-chunk so server-sent events
        // flow as the upstream produces them.
        let mut builder = Response::builder().status(response.status().as_u16());
        for (name, value) in response.headers() {
            if name == header::CONNECTION || name == header::TRANSFER_ENCODING {
                continue;
            }
            builder = builder.header(name, value);
        }
        let stream = response
            .bytes_stream()
            .map_ok(Frame::data)
            .map_err(std::io::Error::other);
        builder
            .body(StreamBody::new(stream).boxed_unsync())
            .unwrap_or_else(|_| reject(StatusCode::BAD_GATEWAY, "invalid upstream response"))
    }
}

fn extract_credential(headers: &header::HeaderMap, injection: &KeyInjection) -> Option<String> {
    match injection {
        KeyInjection::Header(name) => headers
            .get(*name)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string),
        KeyInjection::Bearer => headers
            .get(header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.strip_prefix("Bearer "))
            .map(str::to_string),
    }
}

fn is_credential_header(name: &header::HeaderName, injection: &KeyInjection) -> bool {
    match injection {
        KeyInjection::Header(header_name) => name.as_str().eq_ignore_ascii_case(header_name),
        KeyInjection::Bearer => *name == header::AUTHORIZATION,
    }
}

fn reject(status: StatusCode, message: &str) -> Response<BoxedBody> {
    let body = Full::new(Bytes::from(message.to_string()))
        .map_err(std::io::Error::other)
        .boxed_unsync();
    Response::builder()
        .status(status)
        .header(header::CONTENT_TYPE, "text/plain")
        .body(body)
        .unwrap_or_else(|_| {
            Response::new(
                Full::new(Bytes::new())
                    .map_err(std::io::Error::other)
                    .boxed_unsync(),
            )
        })
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use {
        super::*,
        crate::providers::default_providers,
        secrecy::SecretString,
        std::collections::HashMap,
    };

    fn handler_with_anthropic_key() -> (InnerHandler, String) {
        let sentinels = Arc::new(SentinelMap::new(
            default_providers(),
            HashMap::from([(
                "api.anthropic.com".to_string(),
                SecretString::new("sk-ant-real".into()),
            )]),
        ));
        let sentinel = sentinels.get("api.anthropic.com").unwrap().sentinel.clone();
        (InnerHandler::new(sentinels), sentinel)
    }

    fn request(method: &str, path: &str, key_header: Option<(&str, &str)>) -> Request<Full<Bytes>> {
        let mut builder = Request::builder().method(method).uri(path);
        if let Some((name, value)) = key_header {
            builder = builder.header(name, value);
        }
        builder.body(Full::new(Bytes::from_static(b"{}"))).unwrap()
    }

    #[tokio::test]
    async fn disallowed_endpoint_is_rejected_before_upstream() {
        let (handler, sentinel) = handler_with_anthropic_key();
        let response = handler
            .handle(
                "api.anthropic.com",
                request("POST", "/v1/complete", Some(("x-api-key", &sentinel))),
            )
            .await;
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn sentinel_mismatch_never_forwards() {
        let (handler, _) = handler_with_anthropic_key();
        let response = handler
            .handle(
                "api.anthropic.com",
                request("POST", "/v1/messages", Some(("x-api-key", "sk-ant-guessed"))),
            )
            .await;
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn missing_credential_is_rejected() {
        let (handler, _) = handler_with_anthropic_key();
        let response = handler
            .handle("api.anthropic.com", request("POST", "/v1/messages", None))
            .await;
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn unconfigured_host_is_rejected() {
        let (handler, _) = handler_with_anthropic_key();
        let response = handler
            .handle("api.openai.com", request("GET", "/v1/models", None))
            .await;
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
    }

    #[test]
    fn bearer_credentials_are_extracted_from_authorization() {
        let mut headers = header::HeaderMap::new();
        headers.insert(header::AUTHORIZATION, "Bearer sk-abc".parse().unwrap());
        assert_eq!(
            extract_credential(&headers, &KeyInjection::Bearer).as_deref(),
            Some("sk-abc")
        );
        assert_eq!(extract_credential(&headers, &KeyInjection::Header("x-api-key")), None);
    }
}
