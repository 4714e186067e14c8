//! Transport core shared by every service client.
//!
//! Owns the HTTP connection pool, the in-memory cookie jar, trace-context
//! propagation and the translation of error responses into the crate's
//! error taxonomy. Service clients (storage, blob, vcluster, apps) hold an
//! `Arc<Core>` and only ever talk to the platform through it.

pub mod cookies;
pub mod errors;
pub mod trace;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use reqwest::cookie::{CookieStore, Jar};
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION};
use reqwest::{Method, Response, Url};
use rusqlite::Connection;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::Error as WsError;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::debug;

pub use cookies::{SessionCookie, SESSION_COOKIE_MAX_AGE_SECS};
pub use errors::{Error, OsCode, OsError, Result};

/// Prefix and suffix of cookie names that participate in session affinity.
/// Anything else in the jar stays in memory only.
const SESSION_COOKIE_PREFIX: &str = "SKYLIFT_";
const SESSION_COOKIE_SUFFIX: &str = "_SESSION";

pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(60);

/// Optional parts of a request; most calls only set one or two of these.
#[derive(Default)]
pub struct RequestOpts {
    pub params: Vec<(String, String)>,
    pub json: Option<serde_json::Value>,
    pub body: Option<reqwest::Body>,
    pub headers: Option<HeaderMap>,
    pub timeout: Option<Duration>,
}

pub struct Core {
    http: reqwest::Client,
    jar: Arc<Jar>,
    base_url: Url,
    trace_id: Option<String>,
    trace_sampled: Option<bool>,
    closed: AtomicBool,
}

impl Core {
    pub fn new(
        http: reqwest::Client,
        jar: Arc<Jar>,
        base_url: Url,
        trace_id: Option<String>,
        trace_sampled: Option<bool>,
    ) -> Self {
        Self {
            http,
            jar,
            base_url,
            trace_id,
            trace_sampled,
            closed: AtomicBool::new(false),
        }
    }

    /// Seed the cookie jar from previously persisted session cookies.
    pub fn load_cookies(&self, conn: &Connection) -> Result<()> {
        for cookie in cookies::load(conn, unix_now())? {
            let header = format!(
                "{}={}; Domain={}; Path={}; Max-Age={}",
                cookie.name,
                cookie.value,
                cookie.domain,
                cookie.path,
                SESSION_COOKIE_MAX_AGE_SECS as u64,
            );
            self.jar.add_cookie_str(&header, &self.base_url);
        }
        Ok(())
    }

    /// Persist the session-affinity cookies currently held in the jar.
    pub fn save_cookies(&self, conn: &Connection) -> Result<()> {
        let now = unix_now();
        let domain = self.base_url.host_str().unwrap_or_default().to_string();
        let mut to_save = Vec::new();
        if let Some(header) = self.jar.cookies(&self.base_url) {
            for pair in header.to_str().unwrap_or_default().split("; ") {
                let Some((name, value)) = pair.split_once('=') else {
                    continue;
                };
                if name.starts_with(SESSION_COOKIE_PREFIX) && name.ends_with(SESSION_COOKIE_SUFFIX)
                {
                    to_save.push(SessionCookie {
                        name: name.to_string(),
                        domain: domain.clone(),
                        path: "/".to_string(),
                        value: value.to_string(),
                        timestamp: now,
                    });
                }
            }
        }
        cookies::save(conn, &to_save, now)?;
        Ok(())
    }

    /// Issue a request and return the raw response.
    ///
    /// The URL must be absolute; a relative URL is a programming error and
    /// panics. Responses with status >= 400 are consumed and translated via
    /// [`Error::from_status`]; transport failures propagate untouched.
    pub async fn request(
        &self,
        method: Method,
        url: Url,
        auth: &str,
        opts: RequestOpts,
    ) -> Result<Response> {
        assert!(url.has_host(), "URL must be absolute: {url}");
        assert!(
            !self.closed.load(Ordering::SeqCst),
            "core is used after close"
        );
        debug!("fetch [{method}] {url}");
        let mut url = url;
        if !opts.params.is_empty() {
            url.query_pairs_mut()
                .extend_pairs(opts.params.iter().map(|(k, v)| (k.as_str(), v.as_str())));
        }
        let mut headers = opts.headers.unwrap_or_default();
        self.attach_auth(&mut headers, auth)?;
        self.attach_trace(&mut headers);
        let mut request = self.http.request(method, url).headers(headers);
        if let Some(json) = &opts.json {
            request = request.json(json);
        }
        if let Some(body) = opts.body {
            request = request.body(body);
        }
        if let Some(timeout) = opts.timeout {
            request = request.timeout(timeout);
        }
        let response = request.send().await?;
        let status = response.status();
        if status.as_u16() >= 400 {
            let body = response.text().await.unwrap_or_default();
            return Err(Error::from_status(status, &body));
        }
        Ok(response)
    }

    /// Open a WebSocket to the platform with the same auth and trace headers
    /// as plain requests. A rejected handshake is translated through the
    /// error taxonomy, preferring the `X-Error` response header.
    pub async fn ws_connect(
        &self,
        url: Url,
        auth: &str,
        headers: Option<HeaderMap>,
        timeout: Option<Duration>,
    ) -> Result<WebSocketStream<MaybeTlsStream<TcpStream>>> {
        assert!(url.has_host(), "URL must be absolute: {url}");
        debug!("fetch web socket: {url}");
        let mut request = url.as_str().into_client_request()?;
        {
            let request_headers = request.headers_mut();
            if let Some(extra) = headers {
                for (name, value) in extra.iter() {
                    request_headers.insert(name, value.clone());
                }
            }
            // Unlike plain requests, the socket handshake sends whatever auth
            // value the caller supplies, bare tokens included.
            if !auth.is_empty() {
                let value = HeaderValue::from_str(auth)
                    .map_err(|_| Error::IllegalArgument("invalid authorization header".into()))?;
                request_headers.insert(AUTHORIZATION, value);
            }
            let mut trace_headers = HeaderMap::new();
            self.attach_trace(&mut trace_headers);
            for (name, value) in trace_headers.iter() {
                request_headers.insert(name, value.clone());
            }
        }
        let connect = connect_async(request);
        let result = match timeout {
            Some(limit) => tokio::time::timeout(limit, connect).await.map_err(|_| {
                Error::Io(std::io::Error::new(
                    std::io::ErrorKind::TimedOut,
                    "websocket handshake timed out",
                ))
            })?,
            None => connect.await,
        };
        match result {
            Ok((stream, _response)) => Ok(stream),
            Err(WsError::Http(response)) => {
                let status = reqwest::StatusCode::from_u16(response.status().as_u16())
                    .unwrap_or(reqwest::StatusCode::BAD_REQUEST);
                let message = response
                    .headers()
                    .get("X-Error")
                    .and_then(|v| v.to_str().ok())
                    .map(str::to_owned)
                    .or_else(|| {
                        response
                            .body()
                            .as_ref()
                            .map(|body| String::from_utf8_lossy(body).into_owned())
                    })
                    .unwrap_or_default();
                Err(Error::from_status(status, &message))
            }
            Err(err) => Err(err.into()),
        }
    }

    /// Release the transport. Safe to call more than once; only the first
    /// call has any effect.
    pub fn close(&self) {
        self.closed.swap(true, Ordering::SeqCst);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Attach `Authorization` only when the value carries an actual scheme
    /// and credentials; a bare or empty string means anonymous.
    fn attach_auth(&self, headers: &mut HeaderMap, auth: &str) -> Result<()> {
        let mut words = auth.split_whitespace();
        if words.next().is_some() && words.next().is_some() {
            let value = HeaderValue::from_str(auth)
                .map_err(|_| Error::IllegalArgument("invalid authorization header".into()))?;
            headers.insert(AUTHORIZATION, value);
        }
        Ok(())
    }

    fn attach_trace(&self, headers: &mut HeaderMap) {
        let trace_id = self
            .trace_id
            .clone()
            .unwrap_or_else(trace::gen_trace_id);
        if let Ok(value) = HeaderValue::from_str(&trace_id) {
            headers.insert(trace::TRACE_ID_HEADER, value);
        }
        if let Some(sampled) = self.trace_sampled {
            headers.insert(
                trace::TRACE_SAMPLED_HEADER,
                HeaderValue::from_static(if sampled { "1" } else { "0" }),
            );
        }
    }
}

pub(crate) fn unix_now() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}
