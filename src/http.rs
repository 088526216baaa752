//! Outbound HTTP for webhooks.
//!
//! Webhook URLs are user supplied, so every request goes through an egress
//! policy: literal IP hosts are checked against the configured deny-list
//! before any connection is attempted, and hostnames are resolved by
//! [`DenyListResolver`], which drops denied addresses before reqwest ever
//! sees them. Redirects get the same literal IP check on every hop.
//!
//! ```rust,ignore
//! let access = HttpAccess::new(Duration::from_secs(15), "127.0.0.0/8,::1".parse()?);
//! let call = access.call(Method::POST, "https://example.com/hook", Some(&body)).await;
//! if call.is_error() { ... }
//! ```

use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::str::FromStr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use reqwest::dns::{Addrs, Name, Resolve, Resolving};
use reqwest::redirect::Policy;
use reqwest::{Client, Method};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tokio::sync::OnceCell;
use tracing::{debug, warn};
use url::{Host, Url};

/// Cap on resolving a webhook hostname.
const RESOLVE_TIMEOUT: Duration = Duration::from_secs(10);

// reqwest pools idle connections per host only, there is no global cap
const MAX_IDLE_PER_HOST: usize = 8;
const IDLE_TIMEOUT: Duration = Duration::from_secs(30);

const MAX_REDIRECTS: usize = 10;

/// Longest response body kept on a call trace.
const MAX_TRACE_BODY: usize = 10_000;

#[derive(Debug, Error)]
pub enum AccessError {
    #[error("host {host} resolves to a disallowed network")]
    DisallowedNetwork { host: String },

    #[error("invalid network '{0}'")]
    InvalidNetwork(String),

    #[error("invalid url: {0}")]
    InvalidUrl(#[from] url::ParseError),

    #[error("unable to build http client: {0}")]
    Client(#[source] reqwest::Error),

    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
}

/// An IPv4 or IPv6 network in CIDR notation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Cidr {
    addr: IpAddr,
    prefix: u8,
}

impl Cidr {
    pub fn contains(&self, ip: &IpAddr) -> bool {
        match (self.addr, ip) {
            (IpAddr::V4(net), IpAddr::V4(ip)) => {
                mask_matches(u32::from(net).into(), u32::from(*ip).into(), self.prefix, 32)
            }
            (IpAddr::V6(net), IpAddr::V6(ip)) => {
                mask_matches(u128::from(net), u128::from(*ip), self.prefix, 128)
            }
            (IpAddr::V4(_), IpAddr::V6(ip)) => ip
                .to_ipv4_mapped()
                .is_some_and(|v4| self.contains(&IpAddr::V4(v4))),
            _ => false,
        }
    }
}

fn mask_matches(net: u128, ip: u128, prefix: u8, bits: u8) -> bool {
    if prefix == 0 {
        return true;
    }
    let shift = u32::from(bits - prefix);
    (net >> shift) == (ip >> shift)
}

impl FromStr for Cidr {
    type Err = AccessError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || AccessError::InvalidNetwork(s.to_string());
        let (addr, prefix) = match s.split_once('/') {
            Some((addr, prefix)) => (addr, Some(prefix)),
            None => (s, None),
        };
        let addr: IpAddr = addr.trim().parse().map_err(|_| invalid())?;
        let max = if addr.is_ipv4() { 32 } else { 128 };
        let prefix = match prefix {
            Some(p) => p.trim().parse::<u8>().map_err(|_| invalid())?,
            None => max,
        };
        if prefix > max {
            return Err(invalid());
        }
        Ok(Self { addr, prefix })
    }
}

impl fmt::Display for Cidr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.addr, self.prefix)
    }
}

/// IPs and networks webhooks may never connect to.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DisallowedNetworks(Vec<Cidr>);

impl DisallowedNetworks {
    pub fn contains(&self, ip: &IpAddr) -> bool {
        self.0.iter().any(|net| net.contains(ip))
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }
}

/// Parses a comma separated list such as `127.0.0.1,::1,10.0.0.0/8`.
impl FromStr for DisallowedNetworks {
    type Err = AccessError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.split(',')
            .map(str::trim)
            .filter(|part| !part.is_empty())
            .map(Cidr::from_str)
            .collect::<Result<Vec<_>, _>>()
            .map(Self)
    }
}

/// DNS resolver which filters out addresses in the deny-list.
pub struct DenyListResolver {
    networks: Arc<DisallowedNetworks>,
}

impl Resolve for DenyListResolver {
    fn resolve(&self, name: Name) -> Resolving {
        let networks = self.networks.clone();
        let host = name.as_str().to_string();

        Box::pin(async move {
            let lookup = tokio::net::lookup_host(format!("{host}:0"));
            let addrs: Vec<SocketAddr> = tokio::time::timeout(RESOLVE_TIMEOUT, lookup)
                .await
                .map_err(|_| -> Box<dyn std::error::Error + Send + Sync> {
                    format!("timed out resolving {host}").into()
                })?
                .map_err(|e| -> Box<dyn std::error::Error + Send + Sync> { Box::new(e) })?
                .collect();

            let allowed: Vec<SocketAddr> = addrs
                .into_iter()
                .filter(|addr| {
                    let denied = networks.contains(&addr.ip());
                    if denied {
                        warn!(ip = %addr.ip(), host = %host, "Dropping disallowed address");
                    }
                    !denied
                })
                .collect();

            if allowed.is_empty() {
                let err: Box<dyn std::error::Error + Send + Sync> =
                    Box::new(AccessError::DisallowedNetwork { host });
                return Err(err);
            }

            let addrs: Addrs = Box::new(allowed.into_iter());
            Ok(addrs)
        })
    }
}

fn literal_ip(url: &Url) -> Option<IpAddr> {
    match url.host() {
        Some(Host::Ipv4(ip)) => Some(IpAddr::V4(ip)),
        Some(Host::Ipv6(ip)) => Some(IpAddr::V6(ip)),
        _ => None,
    }
}

/// Follows redirects unless a hop targets a literal IP in the deny-list.
/// Hostname hops are resolved through [`DenyListResolver`] like any request.
fn redirect_policy(networks: Arc<DisallowedNetworks>) -> Policy {
    Policy::custom(move |attempt| {
        if attempt.previous().len() >= MAX_REDIRECTS {
            return attempt.error("too many redirects");
        }
        match literal_ip(attempt.url()) {
            Some(ip) if networks.contains(&ip) => {
                warn!(ip = %ip, "Refusing redirect to disallowed network");
                attempt.error(AccessError::DisallowedNetwork { host: ip.to_string() })
            }
            _ => attempt.follow(),
        }
    })
}

/// How a webhook call ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WebhookStatus {
    Success,
    ResponseError,
    ConnectionError,
    /// The endpoint answered 410, meaning the resthook subscriber is gone
    SubscriberGone,
}

impl WebhookStatus {
    pub fn from_status_code(code: u16) -> Self {
        match code {
            410 => Self::SubscriberGone,
            200..=299 => Self::Success,
            _ => Self::ResponseError,
        }
    }
}

/// Trace of one outgoing webhook request.
#[derive(Debug, Clone)]
pub struct WebhookCall {
    pub url: String,
    pub method: Method,
    pub request: String,
    pub response: String,
    /// Zero when no response was received
    pub status_code: u16,
    pub status: WebhookStatus,
    pub elapsed: Duration,
}

impl WebhookCall {
    pub fn is_error(&self) -> bool {
        self.status != WebhookStatus::Success
    }
}

/// Shared outbound client plus the egress policy it enforces.
pub struct HttpAccess {
    timeout: Duration,
    networks: Arc<DisallowedNetworks>,
    client: OnceCell<Client>,
}

impl HttpAccess {
    pub fn new(timeout: Duration, networks: DisallowedNetworks) -> Self {
        Self {
            timeout,
            networks: Arc::new(networks),
            client: OnceCell::new(),
        }
    }

    pub fn disallowed_networks(&self) -> &DisallowedNetworks {
        &self.networks
    }

    /// The shared client, built on first use.
    pub async fn client(&self) -> Result<&Client, AccessError> {
        self.client
            .get_or_try_init(|| async {
                Client::builder()
                    .timeout(self.timeout)
                    .pool_max_idle_per_host(MAX_IDLE_PER_HOST)
                    .pool_idle_timeout(IDLE_TIMEOUT)
                    .redirect(redirect_policy(self.networks.clone()))
                    .dns_resolver(Arc::new(DenyListResolver {
                        networks: self.networks.clone(),
                    }))
                    .build()
                    .map_err(AccessError::Client)
            })
            .await
    }

    /// Parses a URL and rejects literal IP hosts in the deny-list.
    pub fn check_url(&self, url: &str) -> Result<Url, AccessError> {
        let parsed = Url::parse(url)?;
        if let Some(ip) = literal_ip(&parsed) {
            if self.networks.contains(&ip) {
                return Err(AccessError::DisallowedNetwork { host: ip.to_string() });
            }
        }
        Ok(parsed)
    }

    async fn send(
        &self,
        method: Method,
        url: &str,
        body: Option<&Value>,
    ) -> Result<(u16, String), AccessError> {
        let url = self.check_url(url)?;
        let mut request = self.client().await?.request(method, url);
        if let Some(body) = body {
            request = request.json(body);
        }
        let response = request.send().await?;
        let status = response.status().as_u16();
        let text = response.text().await?;
        Ok((status, text))
    }

    /// Makes a request and traces it. Failures are classified on the trace
    /// rather than returned.
    pub async fn call(&self, method: Method, url: &str, body: Option<&Value>) -> WebhookCall {
        let request = trace_request(&method, url, body);
        let started = Instant::now();
        let result = self.send(method.clone(), url, body).await;
        let elapsed = started.elapsed();

        let (status_code, status, response) = match result {
            Ok((code, text)) => (code, WebhookStatus::from_status_code(code), truncate(text)),
            Err(e) => {
                debug!(url = %url, error = %e, "Webhook connection error");
                (0, WebhookStatus::ConnectionError, String::new())
            }
        };

        WebhookCall {
            url: url.to_string(),
            method,
            request,
            response,
            status_code,
            status,
            elapsed,
        }
    }
}

fn trace_request(method: &Method, url: &str, body: Option<&Value>) -> String {
    let (host, path) = match Url::parse(url) {
        Ok(u) => (u.host_str().unwrap_or_default().to_string(), u.path().to_string()),
        Err(_) => (String::new(), url.to_string()),
    };
    let mut trace = format!("{method} {path} HTTP/1.1\r\nHost: {host}\r\n");
    if let Some(body) = body {
        trace.push_str("Content-Type: application/json\r\n\r\n");
        trace.push_str(&body.to_string());
    } else {
        trace.push_str("\r\n");
    }
    trace
}

fn truncate(mut body: String) -> String {
    if body.len() > MAX_TRACE_BODY {
        let mut end = MAX_TRACE_BODY;
        while !body.is_char_boundary(end) {
            end -= 1;
        }
        body.truncate(end);
    }
    body
}
