//! Process settings for the HTTP ingress, read from the environment (and a
//! `.env` file, if present).

use {
    crate::engine::TpuClientConfig,
    std::{net::SocketAddr, path::PathBuf, time::Duration},
    thiserror::Error,
};

pub const DEFAULT_BIND_ADDR: &str = "127.0.0.1:3001";

#[derive(Error, Debug, PartialEq, Eq)]
pub enum SettingsError {
    #[error("{0} must be set")]
    Missing(&'static str),
    #[error("invalid {name}: {value:?}")]
    Invalid { name: &'static str, value: String },
}

#[derive(Debug, Clone)]
pub struct ServiceSettings {
    pub rpc_url: String,
    /// Empty disables the slot update subscription.
    pub ws_url: String,
    pub bind_addr: SocketAddr,
    pub identity_keypair: Option<PathBuf>,
    pub tpu_client_config: TpuClientConfig,
}

impl ServiceSettings {
    pub fn from_env() -> Result<Self, SettingsError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, SettingsError> {
        let var = |name: &'static str| lookup(name).filter(|value| !value.trim().is_empty());

        let rpc_url = var("RPC_URL").ok_or(SettingsError::Missing("RPC_URL"))?;
        let ws_url = var("WS_URL").unwrap_or_default();
        let bind_addr = parse(
            "BIND_ADDR",
            &var("BIND_ADDR").unwrap_or_else(|| DEFAULT_BIND_ADDR.to_string()),
        )?;

        let mut tpu_client_config = TpuClientConfig::default();
        if let Some(fanout_slots) = var("FANOUT_SLOTS") {
            tpu_client_config = tpu_client_config.with_fanout_slots(parse("FANOUT_SLOTS", &fanout_slots)?);
        }
        if let Some(retry_max_count) = var("RETRY_MAX_COUNT") {
            tpu_client_config =
                tpu_client_config.with_retry_max_count(parse("RETRY_MAX_COUNT", &retry_max_count)?);
        }
        if let Some(secs) = var("CLUSTER_REFRESH_SECS") {
            tpu_client_config.cluster_refresh_interval =
                Duration::from_secs(parse("CLUSTER_REFRESH_SECS", &secs)?);
        }
        tpu_client_config.subscribe_slot_updates = !ws_url.is_empty();

        Ok(Self {
            rpc_url,
            ws_url,
            bind_addr,
            identity_keypair: var("IDENTITY_KEYPAIR").map(PathBuf::from),
            tpu_client_config,
        })
    }
}

fn parse<T: std::str::FromStr>(name: &'static str, value: &str) -> Result<T, SettingsError> {
    value.trim().parse().map_err(|_| SettingsError::Invalid {
        name,
        value: value.to_string(),
    })
}
