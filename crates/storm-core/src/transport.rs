use crate::config::RunConfig;
use crate::request::RequestDescriptor;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::pin::Pin;
use std::time::Duration;
use tokio::time::{sleep, Instant};
use tracing::debug;

/// Why an attempt counts as failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureClass {
    /// No response within the per-request timeout
    Timeout,
    /// Connection refused, reset, DNS failure
    Connection,
    /// Connected, but the exchange broke before a response head arrived
    Request,
    /// Redirect limit exceeded or redirect loop
    Redirect,
    /// Response head arrived, reading or decoding the body failed
    Body,
    /// A response arrived with status >= 400
    HttpStatus,
    /// TLS setup and anything else the client reports
    Other,
    /// In-flight exchange abandoned after the shutdown grace period
    Aborted,
}

impl FailureClass {
    pub const ALL: [FailureClass; 8] = [
        FailureClass::Timeout,
        FailureClass::Connection,
        FailureClass::Request,
        FailureClass::Redirect,
        FailureClass::Body,
        FailureClass::HttpStatus,
        FailureClass::Other,
        FailureClass::Aborted,
    ];
}

/// Classified result of one attempt. Consumed once by the aggregator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Outcome {
    pub status: Option<u16>,
    pub latency: Duration,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    /// Transport-level failure, if any
    pub error: Option<FailureClass>,
}

impl Outcome {
    pub fn response(status: u16, latency: Duration, bytes_sent: u64, bytes_received: u64) -> Self {
        Self {
            status: Some(status),
            latency,
            bytes_sent,
            bytes_received,
            error: None,
        }
    }

    pub fn failure(class: FailureClass, latency: Duration, bytes_sent: u64) -> Self {
        Self {
            status: None,
            latency,
            bytes_sent,
            bytes_received: 0,
            error: Some(class),
        }
    }

    pub fn aborted(latency: Duration, bytes_sent: u64) -> Self {
        Self::failure(FailureClass::Aborted, latency, bytes_sent)
    }

    /// `None` means the attempt succeeded.
    pub fn failure_class(&self) -> Option<FailureClass> {
        if let Some(class) = self.error {
            return Some(class);
        }
        match self.status {
            Some(status) if status >= 400 => Some(FailureClass::HttpStatus),
            Some(_) => None,
            None => Some(FailureClass::Other),
        }
    }

    pub fn is_success(&self) -> bool {
        self.failure_class().is_none()
    }
}

/// Performs the wire exchange for one request descriptor.
///
/// Implementations never return an error: every failure is folded into the
/// returned [`Outcome`].
pub trait Transport: Send + Sync {
    fn name(&self) -> &'static str;

    fn execute<'a>(
        &'a self,
        request: &'a RequestDescriptor,
    ) -> Pin<Box<dyn Future<Output = Outcome> + Send + 'a>>;
}

/// reqwest-backed transport.
///
/// reqwest binds proxies per client, so one client is built for each
/// configured proxy endpoint alongside the direct client.
pub struct HttpTransport {
    direct: reqwest::Client,
    proxied: Vec<reqwest::Client>,
}

impl HttpTransport {
    pub fn new(config: &RunConfig) -> Result<Self, reqwest::Error> {
        let builder = || {
            reqwest::Client::builder()
                .timeout(config.request_timeout())
                .danger_accept_invalid_certs(!config.verify_tls)
                .pool_max_idle_per_host(config.workers as usize)
                .tcp_nodelay(true)
        };

        let direct = builder().no_proxy().build()?;
        let proxied = config
            .proxies
            .urls
            .iter()
            .map(|url| builder().proxy(reqwest::Proxy::all(url.as_str())?).build())
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self { direct, proxied })
    }

    fn client_for(&self, request: &RequestDescriptor) -> &reqwest::Client {
        request
            .proxy
            .and_then(|idx| self.proxied.get(idx))
            .unwrap_or(&self.direct)
    }
}

fn classify(err: &reqwest::Error) -> FailureClass {
    if err.is_timeout() {
        FailureClass::Timeout
    } else if err.is_connect() {
        FailureClass::Connection
    } else if err.is_redirect() {
        FailureClass::Redirect
    } else if err.is_body() || err.is_decode() {
        FailureClass::Body
    } else if err.is_request() {
        FailureClass::Request
    } else {
        FailureClass::Other
    }
}

impl Transport for HttpTransport {
    fn name(&self) -> &'static str {
        "http"
    }

    fn execute<'a>(
        &'a self,
        request: &'a RequestDescriptor,
    ) -> Pin<Box<dyn Future<Output = Outcome> + Send + 'a>> {
        Box::pin(async move {
            let start = Instant::now();
            let bytes_sent = request.body_len();

            let mut builder = self
                .client_for(request)
                .request(request.method.clone(), request.url.clone())
                .headers(request.headers.clone());
            if let Some(body) = &request.body {
                builder = builder.body(body.clone());
            }

            let response = match builder.send().await {
                Ok(response) => response,
                Err(e) => {
                    debug!("request failed: {}", e);
                    return Outcome::failure(classify(&e), start.elapsed(), bytes_sent);
                }
            };

            let status = response.status().as_u16();
            match response.bytes().await {
                Ok(body) => {
                    Outcome::response(status, start.elapsed(), bytes_sent, body.len() as u64)
                }
                Err(e) => {
                    debug!("reading response body failed: {}", e);
                    Outcome {
                        status: Some(status),
                        ..Outcome::failure(classify(&e), start.elapsed(), bytes_sent)
                    }
                }
            }
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MockBehavior {
    Respond { status: u16, body_bytes: u64 },
    Fail(FailureClass),
}

/// In-process transport with fixed latency, for tests and dry runs.
pub struct MockTransport {
    latency: Duration,
    behavior: MockBehavior,
}

impl MockTransport {
    /// Answers 200 with an empty body after `latency`.
    pub fn new(latency: Duration) -> Self {
        Self {
            latency,
            behavior: MockBehavior::Respond {
                status: 200,
                body_bytes: 0,
            },
        }
    }

    pub fn responding(latency: Duration, status: u16, body_bytes: u64) -> Self {
        Self {
            latency,
            behavior: MockBehavior::Respond { status, body_bytes },
        }
    }

    pub fn failing(latency: Duration, class: FailureClass) -> Self {
        Self {
            latency,
            behavior: MockBehavior::Fail(class),
        }
    }
}

impl Transport for MockTransport {
    fn name(&self) -> &'static str {
        "mock"
    }

    fn execute<'a>(
        &'a self,
        request: &'a RequestDescriptor,
    ) -> Pin<Box<dyn Future<Output = Outcome> + Send + 'a>> {
        Box::pin(async move {
            let start = Instant::now();
            sleep(self.latency).await;

            match self.behavior {
                MockBehavior::Respond { status, body_bytes } => {
                    Outcome::response(status, start.elapsed(), request.body_len(), body_bytes)
                }
                MockBehavior::Fail(class) => {
                    Outcome::failure(class, start.elapsed(), request.body_len())
                }
            }
        })
    }
}
