use std::num::ParseIntError;
use std::time::Duration;

use snafu::{OptionExt, ResultExt, Snafu, ensure};
use url::Url;

pub const ENV_API_KEY: &str = "HYPERNYM_API_KEY";
pub const ENV_API_URL: &str = "HYPERNYM_API_URL";
pub const ENV_POLL_INTERVAL_SECS: &str = "HYPERNYM_POLL_INTERVAL_SECS";
pub const ENV_MAX_WAIT_SECS: &str = "HYPERNYM_MAX_WAIT_SECS";

const DEFAULT_USER_AGENT: &str = concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION"));

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum ConfigError {
    #[snafu(display("Required environment variable '{name}' is not set"))]
    MissingVar { name: &'static str },

    #[snafu(display("API key must not be empty"))]
    EmptyApiKey,

    #[snafu(display("Invalid API URL '{url}': {source}"))]
    InvalidUrl { url: String, source: url::ParseError },

    #[snafu(display("API URL '{url}' has no endpoint path to replace"))]
    NoEndpointPath { url: String },

    #[snafu(display("Invalid value '{value}' for '{name}': {source}"))]
    InvalidNumber {
        name: &'static str,
        value: String,
        source: ParseIntError,
    },

    #[snafu(display("Failed to build HTTP client: {source}"))]
    ClientBuild { source: reqwest::Error },
}

/// Connection settings for the compression API.
///
/// `api_url` is the synchronous analysis endpoint (for example
/// `https://api.hypernym.ai/analyze_sync`). The async, status and
/// rate-limit endpoints are its siblings.
#[derive(Clone, Debug)]
pub struct HypernymConfig {
    pub api_key: String,
    pub api_url: Url,
    /// Delay between status polls of an async task.
    pub poll_interval: Duration,
    /// Longest time an async task may run before the attempt times out.
    pub max_wait: Duration,
    pub user_agent: String,
}

impl HypernymConfig {
    pub fn new(api_key: impl Into<String>, api_url: &str) -> Result<Self, ConfigError> {
        let api_key = api_key.into();
        ensure!(!api_key.trim().is_empty(), EmptyApiKeySnafu);
        let api_url = Url::parse(api_url).context(InvalidUrlSnafu { url: api_url })?;
        Ok(Self {
            api_key,
            api_url,
            poll_interval: Duration::from_secs(5),
            max_wait: Duration::from_secs(1200),
            user_agent: DEFAULT_USER_AGENT.to_string(),
        })
    }

    /// Reads the configuration from the process environment, loading a
    /// `.env` file first if one exists.
    pub fn from_env() -> Result<Self, ConfigError> {
        if dotenvy::dotenv().is_ok() {
            debug!(".env file loaded");
        }
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Builds the configuration from an arbitrary variable source.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let api_key = lookup(ENV_API_KEY).context(MissingVarSnafu { name: ENV_API_KEY })?;
        let api_url = lookup(ENV_API_URL).context(MissingVarSnafu { name: ENV_API_URL })?;
        let mut config = Self::new(api_key, &api_url)?;

        if let Some(secs) = seconds(&lookup, ENV_POLL_INTERVAL_SECS)? {
            config.poll_interval = secs;
        }
        if let Some(secs) = seconds(&lookup, ENV_MAX_WAIT_SECS)? {
            config.max_wait = secs;
        }
        Ok(config)
    }

    /// URL of a sibling of the sync endpoint, e.g. `analyze_begin`.
    pub(crate) fn sibling(&self, path: &[&str]) -> Result<Url, ConfigError> {
        let mut url = self.api_url.clone();
        {
            let mut segments = url
                .path_segments_mut()
                .map_err(|_| ConfigError::NoEndpointPath {
                    url: self.api_url.to_string(),
                })?;
            segments.pop_if_empty().pop().extend(path);
        }
        url.set_query(None);
        Ok(url)
    }

    pub(crate) fn build_client(&self) -> Result<reqwest::Client, ConfigError> {
        reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .user_agent(&self.user_agent)
            .build()
            .context(ClientBuildSnafu)
    }
}

fn seconds(lookup: &impl Fn(&str) -> Option<String>, name: &'static str) -> Result<Option<Duration>, ConfigError> {
    lookup(name)
        .map(|value| {
            value
                .trim()
                .parse::<u64>()
                .map(Duration::from_secs)
                .context(InvalidNumberSnafu { name, value: value.clone() })
        })
        .transpose()
}
