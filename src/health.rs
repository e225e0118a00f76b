//! HTTP liveness probes for freshly started containers.
use std::time::Duration;

use async_trait::async_trait;
use hyper::{client::HttpConnector, Client};
use tokio::time::{sleep, timeout, Instant};
use tracing::{debug, trace};
use url::Url;

/// Outcome of waiting for a container to become healthy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Health {
    /// The health endpoint answered with a 2xx status
    Healthy,
    /// The endpoint never answered successfully within the bound
    Degraded,
    /// No health endpoint was declared
    NotChecked,
}

/// How often and for how long a health endpoint is polled
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HealthPolicy {
    pub interval: Duration,
    pub timeout: Duration,
}

impl Default for HealthPolicy {
    fn default() -> Self {
        HealthPolicy {
            interval: Duration::from_secs(3),
            timeout: Duration::from_secs(60),
        }
    }
}

#[async_trait]
pub trait HealthProbe: Send + Sync {
    /// A single attempt, `true` for any 2xx answer
    async fn probe(&self, url: &Url) -> bool;
}

#[async_trait]
impl<T: HealthProbe + ?Sized> HealthProbe for &T {
    async fn probe(&self, url: &Url) -> bool {
        (**self).probe(url).await
    }
}

/// Plain HTTP GET probe
#[derive(Debug, Clone)]
pub struct HttpProbe {
    client: Client<HttpConnector>,
    request_timeout: Duration,
}

impl Default for HttpProbe {
    fn default() -> Self {
        HttpProbe::new(Duration::from_secs(5))
    }
}

impl HttpProbe {
    pub fn new(request_timeout: Duration) -> HttpProbe {
        HttpProbe {
            client: Client::new(),
            request_timeout,
        }
    }
}

#[async_trait]
impl HealthProbe for HttpProbe {
    async fn probe(&self, url: &Url) -> bool {
        let uri: hyper::Uri = match url.as_str().parse() {
            Ok(uri) => uri,
            Err(e) => {
                debug!("Invalid health url {}: {}", url, e);
                return false;
            }
        };
        match timeout(self.request_timeout, self.client.get(uri)).await {
            Ok(Ok(response)) => {
                trace!("Health response from {}: {}", url, response.status());
                response.status().is_success()
            }
            Ok(Err(e)) => {
                trace!("Health request to {} failed: {}", url, e);
                false
            }
            Err(_) => {
                trace!("Health request to {} timed out", url);
                false
            }
        }
    }
}

/// Poll `url` until it answers successfully or `policy.timeout` elapses.
///
/// Returns at the latest one interval after the timeout. An attempt may run
/// until the deadline, or for one interval once the deadline is reached,
/// whatever the probe's own request timeout is.
pub async fn wait_healthy<P: HealthProbe + ?Sized>(probe: &P, url: &Url, policy: HealthPolicy) -> Health {
    let deadline = Instant::now() + policy.timeout;
    loop {
        let budget = deadline
            .saturating_duration_since(Instant::now())
            .max(policy.interval);
        match timeout(budget, probe.probe(url)).await {
            Ok(true) => {
                debug!("{} is healthy", url);
                return Health::Healthy;
            }
            Ok(false) => {}
            Err(_) => trace!("Health attempt on {} cut off after {:?}", url, budget),
        }
        let now = Instant::now();
        if now >= deadline {
            debug!("{} did not become healthy within {:?}", url, policy.timeout);
            return Health::Degraded;
        }
        sleep(policy.interval.min(deadline - now)).await;
    }
}
