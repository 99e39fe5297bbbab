use ragno_common::types::{IpApiMsg, IpInfo};
use ragno_storage::Store;
use std::collections::VecDeque;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio_util::{sync::CancellationToken, task::TaskTracker};
use tracing::{debug, info, trace, warn};

pub const DEFAULT_IP_API_URL: &str = "http://ip-api.com/json/{__ip__}?fields=status,continent,continentCode,country,countryCode,region,regionName,city,zip,lat,lon,isp,org,as,asname,mobile,proxy,hosting,query";

/// Pending lookups the queue will hold before dropping requests.
const QUEUE_CAPACITY: usize = 8192;
/// Pace between provider calls.
const MIN_ITER_TIME: Duration = Duration::from_millis(100);
const HTTP_TIMEOUT: Duration = Duration::from_secs(10);
/// Extra margin on top of the provider's X-Ttl after a 429.
const RATE_LIMITED_MARGIN: Duration = Duration::from_secs(5);
/// Extra margin when the attempt budget (X-Rl) runs out.
const EXHAUSTED_MARGIN: Duration = Duration::from_secs(2);

/// Rate-limited ip-api.com client with an internal FIFO of pending IPs.
#[derive(Clone)]
pub struct IpLocator {
    store: Store,
    client: reqwest::Client,
    api_url: String,
    queue: Arc<Mutex<VecDeque<String>>>,
    token: CancellationToken,
}

impl IpLocator {
    pub fn new(store: Store, api_url: String, token: CancellationToken) -> Self {
        Self {
            store,
            client: reqwest::Client::new(),
            api_url,
            queue: Arc::new(Mutex::new(VecDeque::with_capacity(QUEUE_CAPACITY))),
            token,
        }
    }

    pub fn start(&self, tracker: &TaskTracker) {
        info!("starting IP locator");
        tracker.spawn({
            let locator = self.clone();
            async move { locator.run().await }
        });
    }

    /// Queues an IP for geolocation unless it is already pending or the
    /// store holds a fresh record for it.
    pub async fn request(&self, ip: IpAddr) {
        let ip = ip.to_string();
        {
            let queue = self.queue.lock().await;
            if queue.contains(&ip) {
                return;
            }
        }
        match self.store.check_ip_records(&ip).await {
            Ok((exists, expired)) => {
                if exists && !expired {
                    return;
                }
            }
            Err(e) => {
                warn!(err = %e, "unable to check existing ip records");
            }
        }
        let mut queue = self.queue.lock().await;
        if queue.len() >= QUEUE_CAPACITY {
            warn!(ip, "ip lookup queue full, dropping request");
            return;
        }
        queue.push_back(ip);
    }

    async fn run(self) {
        let mut ticker = tokio::time::interval(MIN_ITER_TIME);
        loop {
            tokio::select! {
                _ = self.token.cancelled() => {
                    info!("IP locator shutting down");
                    return;
                }
                _ = ticker.tick() => {}
            }
            let next = { self.queue.lock().await.pop_front() };
            if let Some(ip) = next {
                self.locate(&ip).await;
            }
        }
    }

    /// One lookup, honouring the provider's rate-limit headers: a 429 sleeps
    /// `X-Ttl` plus a margin and retries, an exhausted budget delays the
    /// next call.
    async fn locate(&self, ip: &str) {
        loop {
            trace!(ip, "calling the ip api");
            let url = self.api_url.replace("{__ip__}", ip);
            let response = match self
                .client
                .get(&url)
                .timeout(HTTP_TIMEOUT)
                .send()
                .await
            {
                Ok(response) => response,
                Err(e) => {
                    debug!(ip, err = %e, "ip api request failed, dropping ip");
                    return;
                }
            };

            let ttl = header_seconds(&response, "X-Ttl");
            if response.status().as_u16() == 429 {
                let wait = ttl + RATE_LIMITED_MARGIN;
                debug!(ip, wait_secs = wait.as_secs(), "ip api rate limited");
                if !self.sleep_or_cancel(wait).await {
                    return;
                }
                continue;
            }

            let attempts_left = header_number(&response, "X-Rl");
            let msg = match response.json::<IpApiMsg>().await {
                Ok(msg) => msg,
                Err(e) => {
                    debug!(ip, err = %e, "could not parse ip api response, dropping ip");
                    return;
                }
            };
            if msg.status != "success" || msg.is_empty() {
                debug!(ip, status = %msg.status, "ip api lookup unsuccessful, dropping ip");
                return;
            }

            let mut msg = msg;
            msg.isp = normalize_isp(&msg.isp);
            self.store.persist_ip_info(IpInfo::from_msg(msg)).await;

            if attempts_left <= 0 {
                let wait = ttl + EXHAUSTED_MARGIN;
                debug!(wait_secs = wait.as_secs(), "ip api attempt budget exhausted");
                self.sleep_or_cancel(wait).await;
            }
            return;
        }
    }

    /// Returns false when the sleep was cut short by shutdown.
    async fn sleep_or_cancel(&self, duration: Duration) -> bool {
        tokio::select! {
            _ = self.token.cancelled() => false,
            _ = tokio::time::sleep(duration) => true,
        }
    }
}

fn header_seconds(response: &reqwest::Response, name: &str) -> Duration {
    Duration::from_secs(header_number(response, name).max(0) as u64)
}

fn header_number(response: &reqwest::Response, name: &str) -> i64 {
    response
        .headers()
        .get(name)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.trim().parse().ok())
        .unwrap_or(0)
}

/// Providers report ISP names with legal suffixes and inconsistent casing;
/// collapse the common ones so the aggregates group sensibly.
fn normalize_isp(raw: &str) -> String {
    const KNOWN_ISPS: &[(&str, &str)] = &[
        ("amazon", "Amazon"),
        ("google", "Google"),
        ("microsoft", "Microsoft"),
        ("digitalocean", "DigitalOcean"),
        ("hetzner", "Hetzner"),
        ("ovh", "OVH"),
        ("contabo", "Contabo"),
        ("oracle", "Oracle"),
        ("alibaba", "Alibaba"),
        ("linode", "Linode"),
        ("netcup", "netcup"),
        ("comcast", "Comcast"),
        ("deutsche telekom", "Deutsche Telekom"),
    ];
    let lowered = raw.to_lowercase();
    for (needle, canonical) in KNOWN_ISPS {
        if lowered.contains(needle) {
            return canonical.to_string();
        }
    }
    raw.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn isp_normalization_collapses_suffixes() {
        assert_eq!(normalize_isp("Amazon.com, Inc."), "Amazon");
        assert_eq!(normalize_isp("Hetzner Online GmbH"), "Hetzner");
        assert_eq!(normalize_isp("DIGITALOCEAN-ASN"), "DigitalOcean");
        assert_eq!(normalize_isp("Some Local ISP"), "Some Local ISP");
    }
}
