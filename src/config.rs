/// Backend selection: a `{hostname, port, options}` triple.
///
/// `hostname` unset means the in-process proxy client against a supplied
/// coordinator; set means the networked client talking to redis directly,
/// bypassing the coordinator.
///
use crate::client::proxy::{ProxyClient, DEFAULT_TIMEOUT_MS};
use crate::client::remote::RemoteClient;
use crate::client::{CacheError, StoreClient};
use crate::coordinator::{Coordinator, DEFAULT_CAPACITY};
use serde::{Deserialize, Serialize};

pub const DEFAULT_REDIS_PORT: u16 = 6379;

#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub struct ConfigOptions {
    /// correlated reply deadline in milliseconds (proxy path)
    pub timeout: Option<u64>,
    /// bounded store capacity (coordinator side)
    pub capacity: Option<usize>,
    /// key prefix for clusters cohabiting one database (networked path)
    pub prefix: Option<String>,
}

#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    pub hostname: Option<String>,
    pub port: u16,
    pub options: ConfigOptions,
}

impl StoreConfig {
    pub fn in_process() -> StoreConfig {
        StoreConfig::default()
    }

    pub fn networked(hostname: &str, port: u16) -> StoreConfig {
        StoreConfig {
            hostname: Some(hostname.to_string()),
            port,
            options: ConfigOptions::default(),
        }
    }

    pub fn is_networked(&self) -> bool {
        self.hostname.is_some()
    }

    /// bounded store capacity for the coordinator this config pairs with
    pub fn capacity(&self) -> usize {
        self.options.capacity.unwrap_or(DEFAULT_CAPACITY)
    }

    pub fn url(&self) -> String {
        let host = self.hostname.as_deref().unwrap_or("127.0.0.1");
        let port = if self.port == 0 {
            DEFAULT_REDIS_PORT
        } else {
            self.port
        };
        format!("redis://{}:{}/", host, port)
    }
}

/// instantiate the backend the config selects
pub async fn open(
    config: &StoreConfig,
    coordinator: &Coordinator,
) -> Result<Box<dyn StoreClient>, CacheError> {
    if config.is_networked() {
        let prefix = config.options.prefix.clone().unwrap_or_default();
        let client = RemoteClient::connect_with_prefix(&config.url(), &prefix).await?;
        Ok(Box::new(client))
    } else {
        let timeout = config.options.timeout.unwrap_or(DEFAULT_TIMEOUT_MS);
        Ok(Box::new(
            ProxyClient::with_timeout(coordinator, timeout).await,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::StoreOpts;
    use serde_json::json;

    #[test]
    fn defaults_to_in_process() {
        let config = StoreConfig::in_process();
        assert!(!config.is_networked());
        assert_eq!(config.capacity(), DEFAULT_CAPACITY);
    }

    #[test]
    fn url_building() {
        let config = StoreConfig::networked("cache.example.com", 6380);
        assert!(config.is_networked());
        assert_eq!(config.url(), "redis://cache.example.com:6380/");

        let config = StoreConfig::networked("cache.example.com", 0);
        assert_eq!(config.url(), "redis://cache.example.com:6379/");
    }

    #[test]
    fn config_from_json() {
        let config: StoreConfig =
            serde_json::from_str(r#"{"hostname": "10.0.0.5", "port": 6379, "options": {}}"#)
                .expect("should parse");
        assert!(config.is_networked());
        assert_eq!(config.options.prefix, None);
    }

    #[test]
    fn open_in_process() {
        async_std::task::block_on(async move {
            let coordinator = Coordinator::start(100).await;
            let client = open(&StoreConfig::in_process(), &coordinator)
                .await
                .expect("in-process open cannot fail");

            let put = client
                .put("k", json!(1), StoreOpts::scalar())
                .await
                .expect("not misuse");
            assert!(!put.is_degraded());

            let got = client
                .get("k".into(), StoreOpts::scalar())
                .await
                .expect("not misuse");
            assert_eq!(got.value, Some(json!(1)));
        });
    }
}
