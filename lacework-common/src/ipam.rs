//! Host-local IPAM configuration for a granted overlay subnet

use crate::{LaceworkError, Result};
use ipnetwork::IpNetwork;
use serde::{Deserialize, Serialize};
use std::net::Ipv4Addr;
use std::path::Path;
use tracing::debug;

/// CNI spec version emitted in generated configs
pub const CNI_VERSION: &str = "0.3.1";

/// Top-level host-local IPAM document
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HostLocalIpam {
    /// CNI spec version
    #[serde(rename = "cniVersion")]
    pub cni_version: String,
    /// Network name
    pub name: String,
    /// Plugin section
    pub ipam: IpamConfig,
}

/// The `ipam` section handed to the host-local plugin
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct IpamConfig {
    /// Plugin name, always `host-local`
    #[serde(rename = "type")]
    pub plugin_type: String,
    /// Range sets; each inner list is one set
    pub ranges: Vec<Vec<IpamRange>>,
    /// Routes installed in the container
    pub routes: Vec<IpamRoute>,
    /// Where the plugin keeps its allocation state
    #[serde(rename = "dataDir")]
    pub data_dir: String,
}

/// One allocatable address range inside the subnet
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct IpamRange {
    /// Leased subnet in CIDR notation
    pub subnet: String,
    /// First assignable address
    #[serde(rename = "rangeStart")]
    pub range_start: Ipv4Addr,
    /// Last assignable address
    #[serde(rename = "rangeEnd")]
    pub range_end: Ipv4Addr,
    /// Gateway handed to containers
    pub gateway: Ipv4Addr,
}

/// Static route entry
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct IpamRoute {
    /// Destination network
    pub dst: String,
    /// Next hop, the default gateway when absent
    #[serde(skip_serializing_if = "Option::is_none")]
    pub gw: Option<Ipv4Addr>,
}

/// Builds host-local IPAM configs from a leased subnet
#[derive(Debug, Clone, Copy, Default)]
pub struct IpamConfigGenerator;

impl IpamConfigGenerator {
    /// Generate the IPAM document for `subnet` on network `network`.
    ///
    /// Addresses run from the first address after the subnet base up to the
    /// last address of the subnet, which doubles as the gateway.
    pub fn generate_config(
        &self,
        subnet: &str,
        network: &str,
        data_dir: impl AsRef<Path>,
    ) -> Result<HostLocalIpam> {
        let parsed = subnet
            .parse::<IpNetwork>()
            .map_err(|_| LaceworkError::InvalidCidr(subnet.to_string()))?;

        let IpNetwork::V4(subnet_v4) = parsed else {
            return Err(LaceworkError::NotIpv4(parsed.ip().to_string()));
        };

        let base = subnet_v4.ip();
        let range_start = Ipv4Addr::from(u32::from(base).wrapping_add(1));
        let range_end = last_ip(subnet_v4);

        debug!(subnet = %subnet_v4, %range_start, %range_end, "generated host-local ipam range");

        Ok(HostLocalIpam {
            cni_version: CNI_VERSION.to_string(),
            name: network.to_string(),
            ipam: IpamConfig {
                plugin_type: "host-local".to_string(),
                ranges: vec![vec![IpamRange {
                    subnet: subnet_v4.to_string(),
                    range_start,
                    range_end,
                    gateway: range_end,
                }]],
                routes: Vec::new(),
                data_dir: data_dir.as_ref().join("ipam").to_string_lossy().into_owned(),
            },
        })
    }
}

fn last_ip(subnet: ipnetwork::Ipv4Network) -> Ipv4Addr {
    Ipv4Addr::from(u32::from(subnet.ip()) | !u32::from(subnet.mask()))
}
