use std::{env, path::Path};

use config::Config;
use lazy_static::lazy_static;
use serde::Deserialize;

use crate::generation::provider::{ModelConfig, ProviderApiConfig};
use crate::jobs::orchestrator::OrchestratorConfig;
use crate::queue::ProcessorConfig;
use crate::rate_limiter::RateLimitConfig;

#[derive(Debug, Deserialize)]
pub struct ServerConfig {
    pub api: ProviderApiConfig,
    pub model: ModelConfig,
    pub rate_limit: RateLimitConfig,
    pub queue: ProcessorConfig,
    pub batch: OrchestratorConfig,
}

impl std::fmt::Display for ServerConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Server Config:\nEndpoint: {}\nModel: {:?}\nRate Limit: {:?}\nQueue: {:?}\nBatch: {:?}",
            self.api.endpoint, self.model, self.rate_limit, self.queue, self.batch,
        )
    }
}

lazy_static! {
    pub static ref cfg: ServerConfig = {
        let root = env::var("APP_DIR").unwrap_or_else(|_| {
            let dir =
                env::var("CARGO_MANIFEST_DIR").expect("CARGO_MANIFEST_DIR or APP_DIR is required");
            let dir = Path::new(&dir).parent().unwrap().display().to_string();
            format!("{}/config", dir)
        });
        let path = format!("{root}/config.toml");
        Config::builder()
            .add_source(config::File::with_name(&path))
            .build()
            .expect("config.toml is required")
            .try_deserialize()
            .expect("config.toml is invalid")
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_file_parses() {
        let config = &*cfg;
        assert!(config.rate_limit.request_limit > 0);
        assert!(config.queue.max_concurrent > 0);
        assert!(config.batch.max_iterations > 0);
        assert!(!config.api.endpoint.is_empty());
    }
}
