//! Per-connection sessions and per-exchange contexts

use hyper::http::Extensions;
use hyper::{HeaderMap, Method, Uri, Version};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use super::{HttpRequest, Modifier};

static NEXT_SESSION_ID: AtomicU64 = AtomicU64::new(1);

/// State shared by every exchange on one client connection.
///
/// A MITM-decrypted stream gets its own session with `secure` set, sharing
/// the value bag of the connection that issued the CONNECT.
pub struct Session {
    id: String,
    client_addr: Option<String>,
    secure: bool,
    next_exchange: AtomicU64,
    values: Arc<Mutex<HashMap<String, Value>>>,
}

impl Session {
    pub fn new(client_addr: Option<String>) -> Arc<Self> {
        Self::with_secure(client_addr, false)
    }

    /// Session for a stream decrypted inside `outer`'s CONNECT tunnel.
    ///
    /// Values set by either session are visible to the other.
    pub fn secure_within(outer: &Session) -> Arc<Self> {
        Self::build(outer.client_addr.clone(), true, outer.values.clone())
    }

    fn with_secure(client_addr: Option<String>, secure: bool) -> Arc<Self> {
        Self::build(client_addr, secure, Arc::default())
    }

    fn build(
        client_addr: Option<String>,
        secure: bool,
        values: Arc<Mutex<HashMap<String, Value>>>,
    ) -> Arc<Self> {
        let n = NEXT_SESSION_ID.fetch_add(1, Ordering::Relaxed);
        Arc::new(Self {
            id: format!("{:08x}", n),
            client_addr,
            secure,
            next_exchange: AtomicU64::new(1),
            values,
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn client_addr(&self) -> Option<&str> {
        self.client_addr.as_deref()
    }

    /// True when exchanges on this session were decrypted by the MITM manager
    pub fn is_secure(&self) -> bool {
        self.secure
    }

    pub fn get(&self, key: &str) -> Option<Value> {
        self.values.lock().ok()?.get(key).cloned()
    }

    pub fn set(&self, key: impl Into<String>, value: Value) {
        if let Ok(mut values) = self.values.lock() {
            values.insert(key.into(), value);
        }
    }

    fn next_exchange_id(&self) -> String {
        let n = self.next_exchange.fetch_add(1, Ordering::Relaxed);
        format!("{}-{}", self.id, n)
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("client_addr", &self.client_addr)
            .field("secure", &self.secure)
            .finish()
    }
}

/// Method, URI and headers of the request an exchange forwarded.
///
/// Response-phase conditions match against this.
#[derive(Debug, Clone)]
pub struct RequestHead {
    pub method: Method,
    pub uri: Uri,
    pub version: Version,
    pub headers: HeaderMap,
}

impl RequestHead {
    pub fn from_request(req: &HttpRequest) -> Self {
        Self {
            method: req.method().clone(),
            uri: req.uri().clone(),
            version: req.version(),
            headers: req.headers().clone(),
        }
    }
}

/// Timing marks of one exchange
#[derive(Debug, Clone)]
pub struct Timings {
    pub started_at: time::OffsetDateTime,
    pub started: Instant,
    pub request_sent: Option<Instant>,
    pub response_received: Option<Instant>,
}

impl Timings {
    fn now() -> Self {
        Self {
            started_at: time::OffsetDateTime::now_utc(),
            started: Instant::now(),
            request_sent: None,
            response_received: None,
        }
    }
}

/// Mutable state of one request/response exchange, passed by reference
/// through the modifier tree.
pub struct Context {
    id: String,
    session: Arc<Session>,
    values: HashMap<String, Value>,
    extensions: Extensions,
    skip_round_trip: bool,
    request: Option<RequestHead>,
    installed: Option<Arc<dyn Modifier>>,
    timings: Timings,
}

impl Context {
    pub fn new(session: Arc<Session>) -> Self {
        Self {
            id: session.next_exchange_id(),
            session,
            values: HashMap::new(),
            extensions: Extensions::new(),
            skip_round_trip: false,
            request: None,
            installed: None,
            timings: Timings::now(),
        }
    }

    /// Context on a fresh plaintext session, handy in tests
    pub fn detached() -> Self {
        Self::new(Session::new(None))
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn session(&self) -> &Arc<Session> {
        &self.session
    }

    /// True when the exchange travels inside a MITM-decrypted stream
    pub fn is_secure(&self) -> bool {
        self.session.is_secure()
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.values.get(key)
    }

    pub fn set(&mut self, key: impl Into<String>, value: Value) {
        self.values.insert(key.into(), value);
    }

    /// Typed storage private to individual modifiers
    pub fn extensions(&self) -> &Extensions {
        &self.extensions
    }

    pub fn extensions_mut(&mut self) -> &mut Extensions {
        &mut self.extensions
    }

    /// Answer the request without contacting the upstream server
    pub fn skip_round_trip(&mut self) {
        self.skip_round_trip = true;
    }

    pub fn should_skip_round_trip(&self) -> bool {
        self.skip_round_trip
    }

    pub fn request(&self) -> Option<&RequestHead> {
        self.request.as_ref()
    }

    pub fn set_request(&mut self, head: RequestHead) {
        self.request = Some(head);
    }

    pub(crate) fn pinned_installed(&self) -> Option<&Arc<dyn Modifier>> {
        self.installed.as_ref()
    }

    pub(crate) fn pin_installed(&mut self, modifier: Arc<dyn Modifier>) {
        self.installed = Some(modifier);
    }

    pub fn timings(&self) -> &Timings {
        &self.timings
    }

    pub fn mark_request_sent(&mut self) {
        self.timings.request_sent = Some(Instant::now());
    }

    pub fn mark_response_received(&mut self) {
        self.timings.response_received = Some(Instant::now());
    }
}

impl fmt::Debug for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Context")
            .field("id", &self.id)
            .field("session", &self.session)
            .field("skip_round_trip", &self.skip_round_trip)
            .finish()
    }
}
