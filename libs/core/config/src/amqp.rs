use crate::{env_parse, env_required, ConfigError, FromEnv};
use std::time::Duration;

/// AMQP broker connection and pool settings
#[derive(Clone, Debug)]
pub struct AmqpConfig {
    pub url: String,
    pub connections: usize,
    pub channels_per_connection: usize,
    pub prefetch: u16,
    pub reconnect_initial: Duration,
    pub reconnect_max: Duration,
}

impl AmqpConfig {
    pub fn new(url: String) -> Self {
        Self {
            url,
            connections: 1,
            channels_per_connection: 4,
            prefetch: 10,
            reconnect_initial: Duration::from_secs(1),
            reconnect_max: Duration::from_secs(30),
        }
    }

    /// URL with the password masked, for logging
    pub fn redacted_url(&self) -> String {
        match (self.url.find("://"), self.url.rfind('@')) {
            (Some(scheme_end), Some(at)) if at > scheme_end => {
                let credentials = &self.url[scheme_end + 3..at];
                match credentials.split_once(':') {
                    Some((user, _)) => format!(
                        "{}{}:***{}",
                        &self.url[..scheme_end + 3],
                        user,
                        &self.url[at..]
                    ),
                    None => self.url.clone(),
                }
            }
            _ => self.url.clone(),
        }
    }
}

impl FromEnv for AmqpConfig {
    /// Reads from environment variables:
    /// - AMQP_URL (or RABBITMQ_URL): required
    /// - AMQP_CONNECTIONS: defaults to 1
    /// - AMQP_CHANNELS_PER_CONNECTION: defaults to 4
    /// - AMQP_PREFETCH: defaults to 10
    /// - AMQP_RECONNECT_INITIAL_MS: defaults to 1000
    /// - AMQP_RECONNECT_MAX_MS: defaults to 30000
    fn from_env() -> Result<Self, ConfigError> {
        let url = env_required("AMQP_URL")
            .or_else(|_| env_required("RABBITMQ_URL"))
            .map_err(|_| ConfigError::MissingEnvVar("AMQP_URL".to_string()))?;

        let defaults = Self::new(url);
        let reconnect_initial_ms = env_parse(
            "AMQP_RECONNECT_INITIAL_MS",
            defaults.reconnect_initial.as_millis() as u64,
        )?;
        let reconnect_max_ms = env_parse(
            "AMQP_RECONNECT_MAX_MS",
            defaults.reconnect_max.as_millis() as u64,
        )?;
        if reconnect_max_ms < reconnect_initial_ms {
            return Err(ConfigError::ParseError {
                key: "AMQP_RECONNECT_MAX_MS".to_string(),
                details: format!(
                    "must be at least AMQP_RECONNECT_INITIAL_MS ({reconnect_initial_ms})"
                ),
            });
        }

        Ok(Self {
            connections: env_parse("AMQP_CONNECTIONS", defaults.connections)?,
            channels_per_connection: env_parse(
                "AMQP_CHANNELS_PER_CONNECTION",
                defaults.channels_per_connection,
            )?,
            prefetch: env_parse("AMQP_PREFETCH", defaults.prefetch)?,
            reconnect_initial: Duration::from_millis(reconnect_initial_ms),
            reconnect_max: Duration::from_millis(reconnect_max_ms),
            url: defaults.url,
        })
    }
}
