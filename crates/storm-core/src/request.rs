use crate::config::{parse_header, ConfigError, DelayRange, ProxySelection, RunConfig};
use rand::distributions::Alphanumeric;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use reqwest::header::{self, HeaderMap, HeaderValue};
use reqwest::Method;
use std::time::Duration;
use url::Url;

pub const DEFAULT_USER_AGENTS: &[&str] = &[
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/91.0.4472.124 Safari/537.36",
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/605.1.15 (KHTML, like Gecko) Version/14.1.1 Safari/605.1.15",
    "Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/91.0.4472.124 Safari/537.36",
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64; rv:89.0) Gecko/20100101 Firefox/89.0",
    "Mozilla/5.0 (iPhone; CPU iPhone OS 14_6 like Mac OS X) AppleWebKit/605.1.15 (KHTML, like Gecko) Version/14.0 Mobile/15E148 Safari/604.1",
];

const ACCEPT: &[&str] = &[
    "text/html,application/xhtml+xml,application/xml;q=0.9,*/*;q=0.8",
    "application/json,text/plain,*/*",
    "*/*",
];

const ACCEPT_LANGUAGE: &[&str] = &[
    "en-US,en;q=0.9",
    "es-ES,es;q=0.9",
    "fr-FR,fr;q=0.9",
    "de-DE,de;q=0.9",
    "zh-CN,zh;q=0.9",
];

const CACHE_CONTROL: &[&str] = &["no-cache", "max-age=0", "no-store"];

/// Separates the think-time stream from the request stream of one attempt.
const DELAY_STREAM: u64 = 0x5DEE_CE66_D1CE_4E5B;

/// One outbound request, owned by the issuing worker until the exchange ends.
#[derive(Debug, Clone)]
pub struct RequestDescriptor {
    pub method: Method,
    pub url: Url,
    pub headers: HeaderMap,
    pub body: Option<Vec<u8>>,
    /// Index into the run's [`ProxyPool`]; `None` goes direct
    pub proxy: Option<usize>,
}

impl RequestDescriptor {
    pub fn body_len(&self) -> u64 {
        self.body.as_ref().map_or(0, |b| b.len() as u64)
    }
}

/// Fixed set of proxy endpoints. Selection is stateless: round-robin keys
/// off the attempt index, random draws from the attempt's rng.
#[derive(Debug, Clone, Default)]
pub struct ProxyPool {
    endpoints: Vec<String>,
    selection: ProxySelection,
}

impl ProxyPool {
    pub fn new(endpoints: Vec<String>, selection: ProxySelection) -> Self {
        Self {
            endpoints,
            selection,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.endpoints.is_empty()
    }

    pub fn len(&self) -> usize {
        self.endpoints.len()
    }

    pub fn select<R: Rng + ?Sized>(&self, attempt: u64, rng: &mut R) -> Option<usize> {
        if self.is_empty() {
            return None;
        }
        let idx = match self.selection {
            ProxySelection::RoundRobin => (attempt % self.len() as u64) as usize,
            ProxySelection::Random => rng.gen_range(0..self.len()),
        };
        Some(idx)
    }
}

/// Builds request descriptors. Holds no mutable state: every call derives
/// its randomness from `(seed, attempt)`, so the same attempt index always
/// yields the same request and concurrent callers never contend.
#[derive(Debug, Clone)]
pub struct RequestFactory {
    seed: u64,
    method: Method,
    url: Url,
    static_headers: HeaderMap,
    randomize_headers: bool,
    user_agents: Vec<HeaderValue>,
    payloads: Vec<Vec<u8>>,
    payload_bytes: Option<usize>,
    delay: Option<DelayRange>,
    proxies: ProxyPool,
}

impl RequestFactory {
    pub fn new(config: &RunConfig, seed: u64) -> Result<Self, ConfigError> {
        let mut static_headers = HeaderMap::new();
        for (name, value) in &config.headers {
            let (name, value) = parse_header(name, value)?;
            static_headers.insert(name, value);
        }

        let user_agents = if !config.randomize.user_agent {
            Vec::new()
        } else if config.randomize.user_agents.is_empty() {
            DEFAULT_USER_AGENTS
                .iter()
                .copied()
                .map(HeaderValue::from_static)
                .collect()
        } else {
            config
                .randomize
                .user_agents
                .iter()
                .map(|ua| parse_header("user-agent", ua).map(|(_, value)| value))
                .collect::<Result<Vec<_>, _>>()?
        };

        Ok(Self {
            seed,
            method: config.http_method()?,
            url: config.target_url()?,
            static_headers,
            randomize_headers: config.randomize.headers,
            user_agents,
            payloads: config
                .randomize
                .payloads
                .iter()
                .map(|p| p.as_bytes().to_vec())
                .collect(),
            payload_bytes: config.randomize.payload_bytes,
            delay: config.randomize.delay,
            proxies: ProxyPool::new(config.proxies.urls.clone(), config.proxies.selection),
        })
    }

    fn rng_for(&self, attempt: u64, stream: u64) -> StdRng {
        StdRng::seed_from_u64(splitmix64(self.seed ^ splitmix64(attempt ^ stream)))
    }

    fn carries_body(&self) -> bool {
        self.method == Method::POST || self.method == Method::PUT || self.method == Method::PATCH
    }

    pub fn build(&self, attempt: u64) -> RequestDescriptor {
        let mut rng = self.rng_for(attempt, 0);
        let mut headers = HeaderMap::new();

        if let Some(ua) = self.user_agents.choose(&mut rng) {
            headers.insert(header::USER_AGENT, ua.clone());
        }

        if self.randomize_headers {
            let pick = |rng: &mut StdRng, set: &'static [&'static str]| {
                HeaderValue::from_static(set[rng.gen_range(0..set.len())])
            };
            headers.insert(header::ACCEPT, pick(&mut rng, ACCEPT));
            headers.insert(header::ACCEPT_LANGUAGE, pick(&mut rng, ACCEPT_LANGUAGE));
            headers.insert(header::CACHE_CONTROL, pick(&mut rng, CACHE_CONTROL));
            if rng.gen_bool(0.4) {
                headers.insert(header::DNT, HeaderValue::from_static("1"));
            }
        }

        let body = if self.carries_body() {
            self.payload(&mut rng)
        } else {
            None
        };
        if let Some(body) = &body {
            let content_type = if looks_like_json(body) {
                "application/json"
            } else {
                "text/plain; charset=utf-8"
            };
            headers.insert(header::CONTENT_TYPE, HeaderValue::from_static(content_type));
        }

        for (name, value) in &self.static_headers {
            headers.insert(name.clone(), value.clone());
        }

        RequestDescriptor {
            method: self.method.clone(),
            url: self.url.clone(),
            headers,
            body,
            proxy: self.proxies.select(attempt, &mut rng),
        }
    }

    fn payload(&self, rng: &mut StdRng) -> Option<Vec<u8>> {
        if let Some(size) = self.payload_bytes {
            return Some(rng.sample_iter(&Alphanumeric).take(size).collect());
        }
        self.payloads.choose(rng).cloned()
    }

    /// Stealth pause applied before the exchange of `attempt`, if enabled.
    pub fn think_time(&self, attempt: u64) -> Option<Duration> {
        let range = self.delay?;
        let mut rng = self.rng_for(attempt, DELAY_STREAM);
        let ms = rng.gen_range(range.min_ms..=range.max_ms);
        Some(Duration::from_millis(ms))
    }
}

fn looks_like_json(body: &[u8]) -> bool {
    matches!(
        body.iter().find(|b| !b.is_ascii_whitespace()),
        Some(b'{') | Some(b'[')
    )
}

fn splitmix64(mut x: u64) -> u64 {
    x = x.wrapping_add(0x9E37_79B9_7F4A_7C15);
    x = (x ^ (x >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
    x = (x ^ (x >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
    x ^ (x >> 31)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ProxyConfig;

    fn config() -> RunConfig {
        RunConfig {
            url: "http://localhost:8080/submit".to_string(),
            duration_secs: Some(1),
            ..RunConfig::default()
        }
    }

    #[test]
    fn test_plain_get() {
        let factory = RequestFactory::new(&config(), 7).unwrap();
        let request = factory.build(0);

        assert_eq!(request.method, Method::GET);
        assert_eq!(request.url.as_str(), "http://localhost:8080/submit");
        assert!(request.headers.is_empty());
        assert!(request.body.is_none());
        assert!(request.proxy.is_none());
        assert!(factory.think_time(0).is_none());
    }

    #[test]
    fn test_same_attempt_is_reproducible() {
        let mut cfg = config();
        cfg.method = "POST".to_string();
        cfg.randomize.headers = true;
        cfg.randomize.user_agent = true;
        cfg.randomize.payload_bytes = Some(64);

        let a = RequestFactory::new(&cfg, 99).unwrap();
        let b = RequestFactory::new(&cfg, 99).unwrap();
        for attempt in [0, 1, 17, 10_000] {
            let (ra, rb) = (a.build(attempt), b.build(attempt));
            assert_eq!(ra.headers, rb.headers);
            assert_eq!(ra.body, rb.body);
        }
    }

    #[test]
    fn test_user_agent_rotates_over_builtin_list() {
        let mut cfg = config();
        cfg.randomize.user_agent = true;
        let factory = RequestFactory::new(&cfg, 1).unwrap();

        let seen: std::collections::HashSet<_> = (0..200)
            .map(|i| factory.build(i).headers[header::USER_AGENT].clone())
            .collect();
        assert!(seen.len() > 1);
        for ua in &seen {
            assert!(DEFAULT_USER_AGENTS.contains(&ua.to_str().unwrap()));
        }
    }

    #[test]
    fn test_static_headers_override_random_ones() {
        let mut cfg = config();
        cfg.randomize.headers = true;
        cfg.headers
            .insert("Accept".to_string(), "application/x-custom".to_string());
        let factory = RequestFactory::new(&cfg, 3).unwrap();

        for attempt in 0..20 {
            let request = factory.build(attempt);
            assert_eq!(request.headers[header::ACCEPT], "application/x-custom");
            assert!(request.headers.contains_key(header::CACHE_CONTROL));
        }
    }

    #[test]
    fn test_payload_only_for_methods_with_body() {
        let mut cfg = config();
        cfg.randomize.payloads = vec![r#"{"id":1}"#.to_string(), "plain".to_string()];
        let factory = RequestFactory::new(&cfg, 5).unwrap();
        assert!(factory.build(0).body.is_none());

        cfg.method = "put".to_string();
        let factory = RequestFactory::new(&cfg, 5).unwrap();
        for attempt in 0..20 {
            let request = factory.build(attempt);
            let body = request.body.expect("PUT carries a payload");
            let expected = if body.starts_with(b"{") {
                "application/json"
            } else {
                "text/plain; charset=utf-8"
            };
            assert_eq!(request.headers[header::CONTENT_TYPE], expected);
        }
    }

    #[test]
    fn test_generated_payload_size() {
        let mut cfg = config();
        cfg.method = "POST".to_string();
        cfg.randomize.payload_bytes = Some(128);
        let factory = RequestFactory::new(&cfg, 11).unwrap();

        let request = factory.build(4);
        assert_eq!(request.body_len(), 128);
        assert!(request.body.unwrap().iter().all(u8::is_ascii_alphanumeric));
    }

    #[test]
    fn test_round_robin_proxy_selection() {
        let mut cfg = config();
        cfg.proxies = ProxyConfig {
            urls: vec![
                "http://10.0.0.1:3128".to_string(),
                "http://10.0.0.2:3128".to_string(),
                "http://10.0.0.3:3128".to_string(),
            ],
            selection: ProxySelection::RoundRobin,
        };
        let factory = RequestFactory::new(&cfg, 0).unwrap();

        let picks: Vec<_> = (0..6).map(|i| factory.build(i).proxy).collect();
        assert_eq!(
            picks,
            vec![Some(0), Some(1), Some(2), Some(0), Some(1), Some(2)]
        );
    }

    #[test]
    fn test_random_proxy_selection_stays_in_pool() {
        let pool = ProxyPool::new(
            vec!["http://a:1".to_string(), "http://b:1".to_string()],
            ProxySelection::Random,
        );
        let mut rng = StdRng::seed_from_u64(9);
        for attempt in 0..100 {
            let idx = pool.select(attempt, &mut rng).unwrap();
            assert!(idx < pool.len());
        }
        assert_eq!(ProxyPool::default().select(0, &mut rng), None);
    }

    #[test]
    fn test_think_time_within_range() {
        let mut cfg = config();
        cfg.randomize.delay = Some(DelayRange {
            min_ms: 20,
            max_ms: 40,
        });
        let factory = RequestFactory::new(&cfg, 21).unwrap();

        for attempt in 0..100 {
            let delay = factory.think_time(attempt).unwrap();
            assert!(delay >= Duration::from_millis(20) && delay <= Duration::from_millis(40));
            assert_eq!(Some(delay), factory.think_time(attempt));
        }
    }
}
