use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::sources::twitter::{DEFAULT_API_BASE, MAX_PAGE};

pub const DEFAULT_PAGE_SIZE: u32 = 20;

#[derive(Serialize, Deserialize)]
pub struct Config {
    /// SQLite cache file
    pub cache: Option<String>,
    #[serde(default = "default_page_size")]
    pub page_size: u32,

    pub twitter: TwitterConfig,
}

#[derive(Serialize, Deserialize)]
pub struct TwitterConfig {
    pub token: String,
    /// User id of the account owning the cached timelines
    pub account_id: String,
    #[serde(default = "default_api_base")]
    pub api_base: String,
}

impl Config {
    /// Parse and validate a toml configuration.
    pub fn from_toml(s: &str) -> Result<Self, ConfigError> {
        let cfg: Config = toml::from_str(s)?;
        if !(1..=MAX_PAGE).contains(&cfg.page_size) {
            return Err(ConfigError::PageSize(cfg.page_size));
        }
        Ok(cfg)
    }
}

fn default_page_size() -> u32 {
    DEFAULT_PAGE_SIZE
}

fn default_api_base() -> String {
    DEFAULT_API_BASE.into()
}
