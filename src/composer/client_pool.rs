//! Shared outbound HTTP clients.
//!
//! One default client plus one per proxy URL, built lazily and shared
//! across every backend stage that names the same proxy.

use std::collections::HashMap;
use std::sync::Mutex;
use tracing::warn;
use url::Url;

pub struct ProxyClientPool {
    clients: Mutex<HashMap<String, reqwest::Client>>,
    default_client: reqwest::Client,
}

impl Default for ProxyClientPool {
    fn default() -> Self {
        Self::new()
    }
}

impl ProxyClientPool {
    pub fn new() -> Self {
        Self {
            clients: Mutex::new(HashMap::new()),
            default_client: reqwest::Client::new(),
        }
    }

    /// Client routed through `proxy_url`. An empty or unparseable URL
    /// yields the direct client.
    pub fn client(&self, proxy_url: &str) -> reqwest::Client {
        if proxy_url.is_empty() {
            return self.default_client.clone();
        }
        if Url::parse(proxy_url).is_err() {
            warn!(proxy_url, "invalid proxy url, using direct client");
            return self.default_client.clone();
        }

        let mut clients = self.clients.lock().expect("client pool lock poisoned");
        if let Some(client) = clients.get(proxy_url) {
            return client.clone();
        }
        let client = match reqwest::Proxy::all(proxy_url) {
            Ok(proxy) => reqwest::Client::builder()
                .proxy(proxy)
                .build()
                .unwrap_or_else(|err| {
                    warn!(proxy_url, error = %err, "failed to build proxied client");
                    self.default_client.clone()
                }),
            Err(err) => {
                warn!(proxy_url, error = %err, "failed to configure proxy");
                self.default_client.clone()
            }
        };
        clients.insert(proxy_url.to_string(), client.clone());
        client
    }
}
