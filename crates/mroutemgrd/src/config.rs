//! Configuration file support for mroutemgrd
//!
//! Loads and validates daemon settings and static multicast routes from
//! TOML. Default location: /etc/mroutemgrd.conf

use std::collections::BTreeMap;
use std::fs;
use std::net::IpAddr;
use std::path::{Path, PathBuf};

use mroute_common::{sysctl, AddressFamily, MrouteError, MrouteResult};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::types::{RouteRequest, DEFAULT_TTL};

/// Default configuration file location
pub const DEFAULT_CONFIG_PATH: &str = "/etc/mroutemgrd.conf";

/// Smallest upcall read buffer that fits an upcall record
const MIN_UPCALL_BUFFER: usize = 64;

/// Daemon settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DaemonConfig {
    /// Enable IPv4 multicast routing
    #[serde(default = "default_enabled")]
    pub ipv4: bool,

    /// Enable IPv6 multicast routing
    #[serde(default = "default_enabled")]
    pub ipv6: bool,

    /// Set the IPv6 multicast forwarding switch when IPv6 routing is enabled
    #[serde(default = "default_enabled")]
    pub mc_forwarding: bool,

    /// Path of the IPv6 multicast forwarding switch
    #[serde(default = "default_mc_forwarding_sysctl")]
    pub mc_forwarding_sysctl: PathBuf,

    /// Read buffer for kernel upcalls, in bytes
    #[serde(default = "default_upcall_buffer_size")]
    pub upcall_buffer_size: usize,
}

/// Outbound interface, either a bare name or a name with a TTL threshold
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum OutboundSpec {
    Name(String),
    WithTtl { name: String, ttl: u8 },
}

impl OutboundSpec {
    pub fn name(&self) -> &str {
        match self {
            OutboundSpec::Name(name) | OutboundSpec::WithTtl { name, .. } => name,
        }
    }

    pub fn ttl(&self) -> u8 {
        match self {
            OutboundSpec::Name(_) => DEFAULT_TTL,
            OutboundSpec::WithTtl { ttl, .. } => *ttl,
        }
    }
}

/// A static multicast route
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MrouteEntry {
    /// Interface the traffic is expected on
    pub inbound: String,

    /// Sender address; omitted or unspecified means any sender (*,G)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<IpAddr>,

    /// Multicast group
    pub group: IpAddr,

    /// Interfaces to forward to
    #[serde(default)]
    pub outbound: Vec<OutboundSpec>,
}

impl MrouteEntry {
    /// Converts the entry into an add request. An unspecified source
    /// becomes a wildcard.
    pub fn to_request(&self) -> RouteRequest {
        let source = self.source.filter(|addr| !addr.is_unspecified());
        let outbound: BTreeMap<String, u8> = self
            .outbound
            .iter()
            .map(|spec| (spec.name().to_string(), spec.ttl()))
            .collect();

        let mut req = RouteRequest::add(source, self.group, self.inbound.clone());
        req.outbound = outbound;
        req
    }

    fn validate(&self, index: usize) -> MrouteResult<()> {
        let field = |name: &str| format!("mroute[{}].{}", index, name);

        if !self.group.is_multicast() {
            return Err(MrouteError::invalid_config(
                field("group"),
                format!("{} is not a multicast address", self.group),
            ));
        }

        if let Some(source) = self.source {
            if AddressFamily::of(&source) != AddressFamily::of(&self.group) {
                return Err(MrouteError::invalid_config(
                    field("source"),
                    format!("{} is not an {} address", source, AddressFamily::of(&self.group)),
                ));
            }
        }

        if self.inbound.is_empty() {
            return Err(MrouteError::invalid_config(
                field("inbound"),
                "must not be empty",
            ));
        }

        if self.outbound.is_empty() {
            return Err(MrouteError::invalid_config(
                field("outbound"),
                "at least one outbound interface is required",
            ));
        }

        for spec in &self.outbound {
            if spec.ttl() == 0 {
                return Err(MrouteError::invalid_config(
                    field("outbound"),
                    format!("ttl for {} must be > 0", spec.name()),
                ));
            }
        }

        Ok(())
    }
}

/// Complete mroutemgrd configuration
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MrouteConfig {
    /// Daemon settings
    #[serde(default)]
    pub daemon: DaemonConfig,

    /// Static routes
    #[serde(default)]
    pub mroute: Vec<MrouteEntry>,
}

// Default functions
fn default_enabled() -> bool {
    true
}

fn default_mc_forwarding_sysctl() -> PathBuf {
    PathBuf::from(sysctl::IPV6_ALL_MC_FORWARDING)
}

fn default_upcall_buffer_size() -> usize {
    8192
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            ipv4: default_enabled(),
            ipv6: default_enabled(),
            mc_forwarding: default_enabled(),
            mc_forwarding_sysctl: default_mc_forwarding_sysctl(),
            upcall_buffer_size: default_upcall_buffer_size(),
        }
    }
}

impl DaemonConfig {
    /// Forwarding switch to set on enable, or `None` when the toggle is off.
    pub fn forwarding_switch(&self) -> Option<PathBuf> {
        self.mc_forwarding
            .then(|| self.mc_forwarding_sysctl.clone())
    }
}

impl MrouteConfig {
    /// Load configuration from file, falling back to defaults if file not found
    pub fn load_or_default(path: impl AsRef<Path>) -> MrouteResult<Self> {
        let path = path.as_ref();

        match fs::read_to_string(path) {
            Ok(content) => Self::parse(&content).map_err(|e| match e {
                MrouteError::InvalidConfig { message, .. } => {
                    MrouteError::invalid_config(path.display().to_string(), message)
                }
                other => other,
            }),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                info!("Config file {} not found, using defaults", path.display());
                Ok(Self::default())
            }
            Err(e) => Err(MrouteError::Io(e)),
        }
    }

    /// Load from default location or defaults
    pub fn load() -> MrouteResult<Self> {
        Self::load_or_default(DEFAULT_CONFIG_PATH)
    }

    /// Parse TOML content
    pub fn parse(content: &str) -> MrouteResult<Self> {
        toml::from_str(content).map_err(|e| {
            MrouteError::invalid_config("file", format!("Failed to parse config: {}", e))
        })
    }

    /// Validate configuration
    pub fn validate(&self) -> MrouteResult<()> {
        if self.daemon.upcall_buffer_size < MIN_UPCALL_BUFFER {
            return Err(MrouteError::invalid_config(
                "daemon.upcall_buffer_size",
                format!("must be >= {}", MIN_UPCALL_BUFFER),
            ));
        }

        for (index, entry) in self.mroute.iter().enumerate() {
            entry.validate(index)?;
        }

        Ok(())
    }

    /// Route requests for every configured route, in file order
    pub fn to_requests(&self) -> Vec<RouteRequest> {
        self.mroute.iter().map(MrouteEntry::to_request).collect()
    }
}
