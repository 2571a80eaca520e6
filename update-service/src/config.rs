use update_engine::Config as EngineConfig;

pub const DEFAULT_PORT: u16 = 8123;
pub const PORT_ENV: &str = "UPDATER_HTTP_PORT";

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub port: u16,
    pub engine: EngineConfig,
}

impl AppConfig {
    pub fn from_env() -> Self {
        let _ = dotenvy::dotenv();

        Self {
            port: std::env::var(PORT_ENV)
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(DEFAULT_PORT),
            engine: EngineConfig::from_env(),
        }
    }
}
