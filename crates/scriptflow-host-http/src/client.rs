use std::collections::BTreeMap;
use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use reqwest::dns::{Addrs, Name, Resolve, Resolving};
use reqwest::{Client, Method, redirect};
use scriptflow_host_log::ScriptLog;

use crate::error::{DeniedAddress, HttpError};
use crate::policy::HttpPolicy;

const CAPABILITY: &str = "http";

/// Per-call options passed by the script.
#[derive(Debug, Clone)]
pub struct RequestOptions {
  pub timeout: Option<Duration>,
  pub max_response_bytes: Option<usize>,
  pub headers: Vec<(String, String)>,
  /// Treat non-2xx responses as errors.
  pub raise_for_status: bool,
}

impl Default for RequestOptions {
  fn default() -> Self {
    Self {
      timeout: None,
      max_response_bytes: None,
      headers: Vec::new(),
      raise_for_status: true,
    }
  }
}

/// Body of a POST request.
#[derive(Debug, Clone, Default)]
pub enum RequestBody {
  #[default]
  Empty,
  Text(String),
  Json(serde_json::Value),
}

/// Response handed back to the script.
#[derive(Debug, Clone)]
pub struct HttpResponse {
  pub status: u16,
  pub headers: BTreeMap<String, String>,
  pub body: String,
}

impl HttpResponse {
  pub fn is_success(&self) -> bool {
    (200..300).contains(&self.status)
  }

  /// Body parsed as JSON, if it is JSON.
  pub fn json(&self) -> Option<serde_json::Value> {
    serde_json::from_str(&self.body).ok()
  }
}

/// System resolver that refuses hosts resolving to a denied address.
///
/// Checking at resolution time covers names pointing at metadata
/// addresses and records that change between check and connect.
struct GuardedResolver {
  policy: HttpPolicy,
}

impl Resolve for GuardedResolver {
  fn resolve(&self, name: Name) -> Resolving {
    Box::pin(resolve_checked(
      self.policy.clone(),
      name.as_str().to_string(),
    ))
  }
}

async fn resolve_checked(
  policy: HttpPolicy,
  host: String,
) -> Result<Addrs, Box<dyn std::error::Error + Send + Sync>> {
  let addrs: Vec<SocketAddr> = tokio::net::lookup_host((host.as_str(), 0))
    .await?
    .collect();
  if addrs.iter().any(|addr| policy.is_denied_address(addr.ip())) {
    return Err(Box::new(DeniedAddress { host }));
  }
  Ok(Box::new(addrs.into_iter()))
}

struct Inner {
  client: Client,
  policy: HttpPolicy,
  log: ScriptLog,
  requests: AtomicU32,
}

/// HTTP capability exposed to one invocation.
///
/// Exposes `get` and `post` only. Every call is recorded through the
/// invocation's [`ScriptLog`] before it is sent and again if it fails.
#[derive(Clone)]
pub struct HttpShim {
  inner: Arc<Inner>,
}

impl fmt::Debug for HttpShim {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("HttpShim")
      .field("policy", &self.inner.policy)
      .field("requests_made", &self.requests_made())
      .finish()
  }
}

impl HttpShim {
  /// Build a reqwest client whose redirect handling and name resolution
  /// follow `policy`.
  pub fn build_client(policy: &HttpPolicy) -> Result<Client, HttpError> {
    let redirect_policy = {
      let policy = policy.clone();
      redirect::Policy::custom(move |attempt| {
        if attempt.previous().len() >= policy.max_redirects {
          attempt.error(format!("too many redirects (max {})", policy.max_redirects))
        } else if let Err(e) = policy.check_parsed(attempt.url()) {
          attempt.error(e)
        } else {
          attempt.follow()
        }
      })
    };

    Client::builder()
      .redirect(redirect_policy)
      .dns_resolver(Arc::new(GuardedResolver {
        policy: policy.clone(),
      }))
      .build()
      .map_err(|e| HttpError::Transport(e.to_string()))
  }

  /// Create the capability for one invocation.
  pub fn new(client: Client, policy: HttpPolicy, log: ScriptLog) -> Self {
    Self {
      inner: Arc::new(Inner {
        client,
        policy,
        log,
        requests: AtomicU32::new(0),
      }),
    }
  }

  pub fn policy(&self) -> &HttpPolicy {
    &self.inner.policy
  }

  /// Number of requests attempted so far.
  pub fn requests_made(&self) -> u32 {
    self.inner.requests.load(Ordering::Relaxed)
  }

  pub async fn get(&self, url: &str, options: RequestOptions) -> Result<HttpResponse, HttpError> {
    self
      .send(Method::GET, url, RequestBody::Empty, options)
      .await
  }

  pub async fn post(
    &self,
    url: &str,
    body: RequestBody,
    options: RequestOptions,
  ) -> Result<HttpResponse, HttpError> {
    self.send(Method::POST, url, body, options).await
  }

  async fn send(
    &self,
    method: Method,
    url: &str,
    body: RequestBody,
    options: RequestOptions,
  ) -> Result<HttpResponse, HttpError> {
    let timeout = self.inner.policy.effective_timeout(options.timeout);
    let timeout_ms = timeout.as_millis() as u64;

    self
      .inner
      .log
      .capability_call(CAPABILITY, method.as_str(), url, timeout_ms);

    let result = self.send_inner(&method, url, body, &options, timeout).await;

    if let Err(e) = &result {
      self
        .inner
        .log
        .capability_failure(CAPABILITY, method.as_str(), url, &e.to_string());
    }

    result
  }

  async fn send_inner(
    &self,
    method: &Method,
    url: &str,
    body: RequestBody,
    options: &RequestOptions,
    timeout: Duration,
  ) -> Result<HttpResponse, HttpError> {
    let policy = &self.inner.policy;
    let timeout_ms = timeout.as_millis() as u64;

    let attempt = self.inner.requests.fetch_add(1, Ordering::Relaxed) + 1;
    if attempt > policy.max_requests {
      return Err(HttpError::QuotaExceeded {
        limit: policy.max_requests,
      });
    }

    let url = policy.check_url(url)?;
    let limit = policy.effective_max_response_bytes(options.max_response_bytes);

    let mut request = self
      .inner
      .client
      .request(method.clone(), url)
      .timeout(timeout);

    for (name, value) in &options.headers {
      request = request.header(name.as_str(), value.as_str());
    }

    request = match body {
      RequestBody::Empty => request,
      RequestBody::Text(text) => request.body(text),
      RequestBody::Json(value) => request.json(&value),
    };

    let mut response = request
      .send()
      .await
      .map_err(|e| HttpError::from_reqwest(e, timeout_ms))?;

    let status = response.status().as_u16();
    if options.raise_for_status && !response.status().is_success() {
      return Err(HttpError::Status { status });
    }

    if response.content_length().is_some_and(|len| len > limit as u64) {
      return Err(HttpError::ResponseTooLarge { limit });
    }

    let headers: BTreeMap<String, String> = response
      .headers()
      .iter()
      .filter_map(|(k, v)| {
        v.to_str()
          .ok()
          .map(|val| (k.as_str().to_string(), val.to_string()))
      })
      .collect();

    // Stream the body so an oversized response is cut off early.
    let mut buf: Vec<u8> = Vec::new();
    while let Some(chunk) = response
      .chunk()
      .await
      .map_err(|e| HttpError::from_reqwest(e, timeout_ms))?
    {
      if buf.len() + chunk.len() > limit {
        return Err(HttpError::ResponseTooLarge { limit });
      }
      buf.extend_from_slice(&chunk);
    }

    Ok(HttpResponse {
      status,
      headers,
      body: String::from_utf8_lossy(&buf).into_owned(),
    })
  }
}
