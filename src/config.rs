use figment::{
    providers::{Env, Format, Json, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::PathBuf;

use crate::mapper::DnsSettings;

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    /// Domain appended to node names when MagicDNS is on.
    pub base_domain: String,
    pub magic_dns: bool,
    /// Serve node names over DNS.
    pub dns_enabled: bool,
    pub dns_bind: SocketAddr,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bind_ip: Option<String>,
    /// JSON export of nodes, routes and rules to start from.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub seed_file: Option<PathBuf>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            base_domain: "netmap.internal".into(),
            magic_dns: true,
            dns_enabled: false,
            dns_bind: SocketAddr::from(([0, 0, 0, 0], 53)),
            bind_ip: None,
            seed_file: None,
        }
    }
}

impl Config {
    pub fn load() -> anyhow::Result<Self> {
        let mut config: Config = Figment::from(Serialized::defaults(Config::default()))
            .merge(Toml::file("netmapd.toml"))
            .merge(Json::file("netmapd.json"))
            .merge(Env::prefixed("NETMAPD_"))
            .extract()
            .map_err(|e| anyhow::anyhow!("Failed to load configuration: {}", e))?;

        // If bind_ip is set, override the IP part of dns_bind
        if let Some(ref ip) = config.bind_ip {
            let port = config.dns_bind.port();
            config.dns_bind = format!("{}:{}", ip, port)
                .parse()
                .map_err(|e| anyhow::anyhow!("Invalid bind_ip: {}", e))?;
        }

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.magic_dns && self.base_domain.trim_matches('.').is_empty() {
            anyhow::bail!("magic_dns requires a non-empty base_domain");
        }
        Ok(())
    }

    pub fn dns_settings(&self) -> DnsSettings {
        DnsSettings {
            magic_dns: self.magic_dns,
            base_domain: self.base_domain.trim_matches('.').to_string(),
        }
    }
}
