//! Signing reverse proxy.
//!
//! Every request is forwarded to the configured upstream, the response is
//! buffered, run through the [`Signer`] and handed back to the client with
//! the HARC headers attached.

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use http::header::{self, HeaderMap, HeaderName, HeaderValue};
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use tokio::net::TcpListener;
use tracing::{debug, error, info, warn};

use crate::core::observability;
use crate::error::ProxyError;
use crate::signer::{SignedResponse, Signer};

/// Headers that describe one hop and are never forwarded.
const HOP_BY_HOP: [HeaderName; 8] = [
    header::CONNECTION,
    HeaderName::from_static("keep-alive"),
    header::PROXY_AUTHENTICATE,
    header::PROXY_AUTHORIZATION,
    header::TE,
    header::TRAILER,
    header::TRANSFER_ENCODING,
    header::UPGRADE,
];

/// Only encodings the signer can undo are offered upstream.
const UPSTREAM_ACCEPT_ENCODING: &str = "gzip, identity";

fn strip_hop_by_hop(headers: &mut HeaderMap) {
    // Headers named in Connection are hop-by-hop as well.
    let named: Vec<HeaderName> = headers
        .get_all(header::CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .filter_map(|name| HeaderName::from_bytes(name.trim().as_bytes()).ok())
        .collect();
    for name in named.iter().chain(HOP_BY_HOP.iter()) {
        headers.remove(name);
    }
}

fn plain_response(status: StatusCode, message: String) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(Bytes::from(message)));
    *response.status_mut() = status;
    response.headers_mut().insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("text/plain; charset=utf-8"),
    );
    response
}

pub struct SigningProxy {
    upstream: String,
    client: reqwest::Client,
    signer: Signer,
}

impl SigningProxy {
    pub fn new(upstream: &str, signer: Signer) -> Result<Self, ProxyError> {
        let parsed = url::Url::parse(upstream)
            .map_err(|e| ProxyError::Config(format!("invalid upstream {upstream}: {e}")))?;
        if parsed.host_str().is_none() {
            return Err(ProxyError::Config(format!("upstream {upstream} has no host")));
        }

        // Redirects go back to the browser untouched.
        let client = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .connect_timeout(Duration::from_secs(10))
            .build()?;

        Ok(Self {
            upstream: upstream.trim_end_matches('/').to_string(),
            client,
            signer,
        })
    }

    pub fn signer(&self) -> &Signer {
        &self.signer
    }

    pub async fn bind(addr: SocketAddr) -> Result<TcpListener, ProxyError> {
        let listener = TcpListener::bind(addr).await?;
        info!(addr = %listener.local_addr()?, "Signing proxy bound");
        Ok(listener)
    }

    /// Serve connections from `listener` until the task is dropped.
    pub async fn accept_connections(self: Arc<Self>, listener: TcpListener) -> Result<(), ProxyError> {
        loop {
            let (stream, addr) = match listener.accept().await {
                Ok(accepted) => accepted,
                Err(e) => {
                    warn!(error = %e, "Failed to accept connection");
                    continue;
                }
            };
            debug!(peer = %addr, "Accepted connection");

            let proxy = Arc::clone(&self);
            tokio::spawn(async move {
                let io = TokioIo::new(stream);
                let service = service_fn(move |req| {
                    let proxy = Arc::clone(&proxy);
                    async move { Ok::<_, Infallible>(proxy.handle_request(req).await) }
                });

                if let Err(err) = http1::Builder::new().serve_connection(io, service).await {
                    debug!(peer = %addr, error = ?err, "Connection closed with error");
                }
            });
        }
    }

    pub async fn handle_request(&self, req: Request<Incoming>) -> Response<Full<Bytes>> {
        let (parts, body) = req.into_parts();
        let path = parts
            .uri
            .path_and_query()
            .map(|pq| pq.as_str().to_string())
            .unwrap_or_else(|| "/".to_string());

        let body = match body.collect().await {
            Ok(collected) => collected.to_bytes(),
            Err(e) => {
                let err = ProxyError::BadRequest(format!("unreadable request body: {e}"));
                let (status, message) = err.into_status_code_and_body();
                return plain_response(status, message);
            }
        };

        match self.forward(parts.method.clone(), &path, parts.headers, body).await {
            Ok(response) => response,
            Err(e) => {
                if matches!(e, ProxyError::Upstream(_)) {
                    observability::record_upstream_failure();
                }
                error!(method = %parts.method, path = %path, error = %e, "Request failed");
                let (status, message) = e.into_status_code_and_body();
                plain_response(status, message)
            }
        }
    }

    /// Forward one request and sign the upstream response.
    pub async fn forward(
        &self,
        method: Method,
        path_and_query: &str,
        mut headers: HeaderMap,
        body: Bytes,
    ) -> Result<Response<Full<Bytes>>, ProxyError> {
        strip_hop_by_hop(&mut headers);
        headers.remove(header::HOST);
        headers.remove(header::CONTENT_LENGTH);
        headers.insert(
            header::ACCEPT_ENCODING,
            HeaderValue::from_static(UPSTREAM_ACCEPT_ENCODING),
        );

        let url = format!("{}{}", self.upstream, path_and_query);
        let upstream = self
            .client
            .request(method.clone(), &url)
            .headers(headers)
            .body(body)
            .send()
            .await?;

        let status = upstream.status();
        let mut response_headers = upstream.headers().clone();
        let response_body = upstream.bytes().await?;
        strip_hop_by_hop(&mut response_headers);

        let prepared = if method == Method::HEAD || is_bodiless(status) {
            // No body to sign; the upstream framing headers still describe
            // the representation a full GET would return.
            SignedResponse {
                status,
                headers: response_headers,
                body: response_body,
            }
        } else {
            self.signer.prepare(SignedResponse {
                status,
                headers: response_headers,
                body: response_body,
            })?
        };

        debug!(method = %method, url = %url, status = %prepared.status, "Proxied response");

        let mut response = Response::new(Full::new(prepared.body));
        *response.status_mut() = prepared.status;
        *response.headers_mut() = prepared.headers;
        Ok(response)
    }
}

/// Statuses that never carry a body (RFC 9110 §6.4.1).
fn is_bodiless(status: StatusCode) -> bool {
    status.is_informational()
        || status == StatusCode::NO_CONTENT
        || status == StatusCode::NOT_MODIFIED
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::key_management::{SigningKey, VerifyingKey};
    use crate::signer::{HEADER_ALGO, HEADER_SIGNATURE};
    use flate2::write::GzEncoder;
    use flate2::Compression;
    use std::io::Write;

    const PAGE: &str = "<html><body>signed page</body></html>";

    fn gzip(data: &[u8]) -> Vec<u8> {
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(data).unwrap();
        encoder.finish().unwrap()
    }

    async fn origin(req: Request<Incoming>) -> Result<Response<Full<Bytes>>, Infallible> {
        let mut builder = Response::builder();
        let body = match req.uri().path() {
            "/data.json" => {
                builder = builder.header("content-type", "application/json");
                Bytes::from_static(b"{\"a\":1}")
            }
            "/page.gz" => {
                let compressed = gzip(PAGE.as_bytes());
                builder = builder
                    .header("content-type", "text/html; charset=utf-8")
                    .header("content-encoding", "gzip")
                    .header("content-length", compressed.len());
                Bytes::from(compressed)
            }
            "/echo" => {
                let seen = |name: &str| {
                    req.headers()
                        .get(name)
                        .and_then(|v| v.to_str().ok())
                        .unwrap_or("-")
                        .to_string()
                };
                builder = builder
                    .header("content-type", "text/plain")
                    .header("x-seen-accept-encoding", seen("accept-encoding"))
                    .header("x-seen-proxy-authorization", seen("proxy-authorization"))
                    .header("x-seen-custom", seen("x-custom"));
                Bytes::new()
            }
            "/logo.png" => {
                builder = builder.header("content-type", "image/png");
                Bytes::from_static(&[0x89, b'P', b'N', b'G'])
            }
            "/broken.png" => {
                builder = builder
                    .header("content-type", "image/png")
                    .header("content-encoding", "gzip");
                Bytes::from_static(b"definitely not gzip")
            }
            "/cached.json" => {
                builder = builder
                    .status(304)
                    .header("content-type", "application/json")
                    .header("etag", "\"v1\"");
                Bytes::new()
            }
            "/empty.json" => {
                builder = builder.status(204).header("content-type", "application/json");
                Bytes::new()
            }
            _ => {
                builder = builder.status(404);
                Bytes::new()
            }
        };
        Ok(builder.body(Full::new(body)).unwrap())
    }

    async fn spawn_origin() -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            loop {
                let (stream, _) = listener.accept().await.unwrap();
                tokio::spawn(async move {
                    let _ = http1::Builder::new()
                        .serve_connection(TokioIo::new(stream), service_fn(origin))
                        .await;
                });
            }
        });
        addr
    }

    async fn spawn_proxy(upstream: &str) -> (SocketAddr, Arc<SigningProxy>) {
        let (key, _) = SigningKey::generate().unwrap();
        let proxy = Arc::new(SigningProxy::new(upstream, Signer::new(key)).unwrap());
        let listener = SigningProxy::bind("127.0.0.1:0".parse().unwrap()).await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(Arc::clone(&proxy).accept_connections(listener));
        (addr, proxy)
    }

    fn verifying_key(proxy: &SigningProxy) -> VerifyingKey {
        VerifyingKey::from_spki_der(&proxy.signer().key().public_key_spki()).unwrap()
    }

    #[tokio::test]
    async fn test_json_response_is_signed() {
        let origin = spawn_origin().await;
        let (addr, proxy) = spawn_proxy(&format!("http://{origin}")).await;

        let resp = reqwest::get(format!("http://{addr}/data.json")).await.unwrap();
        assert_eq!(resp.status(), 200);
        let signature = resp.headers()[HEADER_SIGNATURE].to_str().unwrap().to_string();
        assert_eq!(resp.headers()[HEADER_ALGO], "ECDSA_P-256; SHA-256");
        let body = resp.bytes().await.unwrap();

        assert_eq!(&body[..], b"{\"a\":1}");
        assert!(verifying_key(&proxy).verify_encoded(&body, &signature).is_ok());
    }

    #[tokio::test]
    async fn test_gzip_upstream_is_decoded_and_length_fixed() {
        let origin = spawn_origin().await;
        let (addr, proxy) = spawn_proxy(&format!("http://{origin}/")).await;

        let resp = reqwest::get(format!("http://{addr}/page.gz")).await.unwrap();
        assert!(resp.headers().get("content-encoding").is_none());
        assert_eq!(resp.headers()["content-length"], PAGE.len().to_string().as_str());
        let signature = resp.headers()[HEADER_SIGNATURE].to_str().unwrap().to_string();
        let body = resp.bytes().await.unwrap();

        assert_eq!(&body[..], PAGE.as_bytes());
        assert!(verifying_key(&proxy).verify_encoded(&body, &signature).is_ok());
    }

    #[tokio::test]
    async fn test_request_headers_are_rewritten() {
        let origin = spawn_origin().await;
        let (addr, _proxy) = spawn_proxy(&format!("http://{origin}")).await;

        let resp = reqwest::Client::new()
            .get(format!("http://{addr}/echo"))
            .header("accept-encoding", "br, zstd")
            .header("proxy-authorization", "Basic c2VjcmV0")
            .header("x-custom", "kept")
            .send()
            .await
            .unwrap();

        assert_eq!(resp.headers()["x-seen-accept-encoding"], "gzip, identity");
        assert_eq!(resp.headers()["x-seen-proxy-authorization"], "-");
        assert_eq!(resp.headers()["x-seen-custom"], "kept");
    }

    #[tokio::test]
    async fn test_ineligible_content_is_unsigned() {
        let origin = spawn_origin().await;
        let (addr, _proxy) = spawn_proxy(&format!("http://{origin}")).await;

        let resp = reqwest::get(format!("http://{addr}/logo.png")).await.unwrap();
        assert!(resp.headers().get(HEADER_SIGNATURE).is_none());
        assert_eq!(resp.bytes().await.unwrap().len(), 4);
    }

    #[tokio::test]
    async fn test_not_modified_passes_through_unsigned() {
        let origin = spawn_origin().await;
        let (addr, _proxy) = spawn_proxy(&format!("http://{origin}")).await;

        let resp = reqwest::Client::new()
            .get(format!("http://{addr}/cached.json"))
            .header("if-none-match", "\"v1\"")
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_MODIFIED);
        assert_eq!(resp.headers()["etag"], "\"v1\"");
        assert!(resp.headers().get(HEADER_SIGNATURE).is_none());

        let resp = reqwest::get(format!("http://{addr}/empty.json")).await.unwrap();
        assert_eq!(resp.status(), StatusCode::NO_CONTENT);
        assert!(resp.headers().get(HEADER_SIGNATURE).is_none());
    }

    #[test]
    fn test_bodiless_statuses() {
        assert!(is_bodiless(StatusCode::CONTINUE));
        assert!(is_bodiless(StatusCode::NO_CONTENT));
        assert!(is_bodiless(StatusCode::NOT_MODIFIED));
        assert!(!is_bodiless(StatusCode::OK));
        assert!(!is_bodiless(StatusCode::NOT_FOUND));
    }

    #[tokio::test]
    async fn test_corrupt_compressed_image_is_forwarded_unchanged() {
        let origin = spawn_origin().await;
        let (addr, _proxy) = spawn_proxy(&format!("http://{origin}")).await;

        let resp = reqwest::get(format!("http://{addr}/broken.png")).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(resp.headers()["content-encoding"], "gzip");
        assert!(resp.headers().get(HEADER_SIGNATURE).is_none());
        assert_eq!(&resp.bytes().await.unwrap()[..], b"definitely not gzip");
    }

    #[tokio::test]
    async fn test_unreachable_upstream_is_bad_gateway() {
        // Bind then drop to get a port nobody listens on.
        let dead = TcpListener::bind("127.0.0.1:0").await.unwrap().local_addr().unwrap();
        let (addr, _proxy) = spawn_proxy(&format!("http://{dead}")).await;

        let resp = reqwest::get(format!("http://{addr}/")).await.unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_GATEWAY);
    }

    #[test]
    fn test_rejects_invalid_upstream() {
        let (key, _) = SigningKey::generate().unwrap();
        assert!(matches!(
            SigningProxy::new("not a url", Signer::new(key)),
            Err(ProxyError::Config(_))
        ));
    }

    #[test]
    fn test_connection_named_headers_are_stripped() {
        let mut headers = HeaderMap::new();
        headers.insert(header::CONNECTION, HeaderValue::from_static("x-session, keep-alive"));
        headers.insert("x-session", HeaderValue::from_static("1"));
        headers.insert("x-other", HeaderValue::from_static("2"));

        strip_hop_by_hop(&mut headers);
        assert!(headers.get("x-session").is_none());
        assert!(headers.get(header::CONNECTION).is_none());
        assert_eq!(headers["x-other"], "2");
    }
}
