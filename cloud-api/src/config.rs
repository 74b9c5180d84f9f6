use serde::Deserialize;

pub const BIND_ENV_VAR: &str = "CLOUD_API_BIND";

/// Settings of the HTTP listener. Everything the orchestrator needs comes
/// from the YAML configuration instead.
#[derive(Debug, Clone, Deserialize)]
pub struct ApiConfig {
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,
}

fn default_bind_addr() -> String {
    std::env::var(BIND_ENV_VAR).unwrap_or_else(|_| "0.0.0.0:3121".to_string())
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            bind_addr: default_bind_addr(),
        }
    }
}

impl ApiConfig {
    pub fn from_env() -> Self {
        Self::default()
    }
}
