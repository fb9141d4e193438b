//! Analysis Builder API
//!
//! Collects analysis preferences, validates them as a whole and opens an
//! [`AnalysisSession`]. Anything left unset falls back to [`AnalysisConfig::default`], or to the
//! base document given through [`AnalysisBuilder::with_config`] or
//! [`AnalysisBuilder::with_config_json`].
//!
//! # Example
//! ```rust
//! use flowscope_sdk::prelude::*;
//!
//! let session = AnalysisBuilder::default()
//!     .with_xcp_udp_ports([5555, 5556])
//!     .with_xcp_address_name(0, 0x1000, "engine_speed")
//!     .with_shicp_heuristic(false)
//!     .build()
//!     .unwrap();
//! ```
//!
//! # Important Notes
//! - Every port list must hold at least one port, and no port may be claimed by two protocols
//!   on the same transport
//! - Address names must be unique, both by name and by (extension, address)
//! - `max_dispatch_depth` must be at least 1

use flowscope_proto::prelude::*;
use itertools::Itertools;
use std::path::Path;

/// Used to construct an [`AnalysisSession`] from validated preferences
#[derive(Default)]
pub struct AnalysisBuilder {
    base: Option<AnalysisConfig>,
    socks_tcp_ports: Option<Vec<u16>>,
    xcp_udp_ports: Option<Vec<u16>>,
    xcp_tcp_ports: Option<Vec<u16>>,
    xcp_byte_order: Option<XcpByteOrder>,
    xcp_granularity: Option<AddressGranularity>,
    xcp_max_packet_len: Option<usize>,
    xcp_address_names: Vec<AddressName>,
    msproxy_udp_ports: Option<Vec<u16>>,
    z21_udp_ports: Option<Vec<u16>>,
    dcc_udp_ports: Option<Vec<u16>>,
    shicp_udp_ports: Option<Vec<u16>>,
    shicp_heuristic: Option<bool>,
    max_dispatch_depth: Option<usize>,
}

impl AnalysisBuilder {
    /// Validates the preferences and opens a session with every built-in dissector registered
    pub fn build(&mut self) -> anyhow::Result<AnalysisSession> {
        let config = self.config()?;
        log::trace!(target: "flowscope", "[AnalysisBuilder] Opening session with {} ODT address names", config.xcp.address_names.len());
        Ok(AnalysisSession::new(config))
    }

    /// The merged, validated configuration the next [`Self::build`] would use
    pub fn config(&self) -> anyhow::Result<AnalysisConfig> {
        let config = self.merged();
        check(&config)?;
        Ok(config)
    }

    /// Starts from `config` instead of the defaults. Setters override its fields
    pub fn with_config(&mut self, config: AnalysisConfig) -> &mut Self {
        self.base = Some(config);
        self
    }

    /// Starts from a JSON document. Missing fields take their defaults
    pub fn with_config_json<T: AsRef<str>>(&mut self, json: T) -> anyhow::Result<&mut Self> {
        let config = AnalysisConfig::from_json_str(json.as_ref())?;
        Ok(self.with_config(config))
    }

    /// Starts from a JSON file on disk
    pub fn with_config_file<P: AsRef<Path>>(&mut self, path: P) -> anyhow::Result<&mut Self> {
        let json = std::fs::read_to_string(path.as_ref()).map_err(|err| {
            anyhow::Error::msg(format!(
                "Unable to read {}: {err}",
                path.as_ref().display()
            ))
        })?;
        self.with_config_json(json)
    }

    /// TCP ports on which SOCKS is expected
    pub fn with_socks_ports<T: Into<Vec<u16>>>(&mut self, ports: T) -> &mut Self {
        self.socks_tcp_ports = Some(ports.into());
        self
    }

    pub fn with_xcp_udp_ports<T: Into<Vec<u16>>>(&mut self, ports: T) -> &mut Self {
        self.xcp_udp_ports = Some(ports.into());
        self
    }

    pub fn with_xcp_tcp_ports<T: Into<Vec<u16>>>(&mut self, ports: T) -> &mut Self {
        self.xcp_tcp_ports = Some(ports.into());
        self
    }

    /// Byte order assumed for XCP until a CONNECT response announces one
    pub fn with_xcp_byte_order(&mut self, byte_order: XcpByteOrder) -> &mut Self {
        self.xcp_byte_order = Some(byte_order);
        self
    }

    /// Address granularity assumed for XCP until a CONNECT response announces one
    pub fn with_xcp_address_granularity(&mut self, granularity: AddressGranularity) -> &mut Self {
        self.xcp_granularity = Some(granularity);
        self
    }

    /// Largest XCP packet the framer accepts, excluding the 4-byte Ethernet header
    pub fn with_xcp_max_packet_len(&mut self, max_packet_len: usize) -> &mut Self {
        self.xcp_max_packet_len = Some(max_packet_len);
        self
    }

    /// Labels ODT entries that point at `address`. Appends to any names in the base config
    pub fn with_xcp_address_name<T: Into<String>>(
        &mut self,
        address_extension: u8,
        address: u32,
        name: T,
    ) -> &mut Self {
        self.xcp_address_names.push(AddressName {
            address_extension,
            address,
            name: name.into(),
        });
        self
    }

    pub fn with_msproxy_ports<T: Into<Vec<u16>>>(&mut self, ports: T) -> &mut Self {
        self.msproxy_udp_ports = Some(ports.into());
        self
    }

    pub fn with_z21_ports<T: Into<Vec<u16>>>(&mut self, ports: T) -> &mut Self {
        self.z21_udp_ports = Some(ports.into());
        self
    }

    pub fn with_dcc_ports<T: Into<Vec<u16>>>(&mut self, ports: T) -> &mut Self {
        self.dcc_udp_ports = Some(ports.into());
        self
    }

    pub fn with_shicp_ports<T: Into<Vec<u16>>>(&mut self, ports: T) -> &mut Self {
        self.shicp_udp_ports = Some(ports.into());
        self
    }

    /// Whether SHICP is tried on UDP traffic that no port claims. Enabled by default
    pub fn with_shicp_heuristic(&mut self, enabled: bool) -> &mut Self {
        self.shicp_heuristic = Some(enabled);
        self
    }

    /// Bound on nested dispatch of tunnelled payloads
    pub fn with_max_dispatch_depth(&mut self, depth: usize) -> &mut Self {
        self.max_dispatch_depth = Some(depth);
        self
    }

    fn merged(&self) -> AnalysisConfig {
        let mut config = self.base.clone().unwrap_or_default();

        let overrides = [
            (&self.socks_tcp_ports, &mut config.socks.tcp_ports),
            (&self.xcp_udp_ports, &mut config.xcp.udp_ports),
            (&self.xcp_tcp_ports, &mut config.xcp.tcp_ports),
            (&self.msproxy_udp_ports, &mut config.msproxy.udp_ports),
            (&self.z21_udp_ports, &mut config.z21.udp_ports),
            (&self.dcc_udp_ports, &mut config.dcc.udp_ports),
            (&self.shicp_udp_ports, &mut config.shicp.udp_ports),
        ];

        for (ports, target) in overrides {
            if let Some(ports) = ports {
                target.clone_from(ports);
            }
        }

        if let Some(byte_order) = self.xcp_byte_order {
            config.xcp.default_byte_order = byte_order;
        }

        if let Some(granularity) = self.xcp_granularity {
            config.xcp.default_address_granularity = granularity;
        }

        if let Some(max_packet_len) = self.xcp_max_packet_len {
            config.xcp.max_packet_len = max_packet_len;
        }

        config
            .xcp
            .address_names
            .extend(self.xcp_address_names.iter().cloned());

        if let Some(enabled) = self.shicp_heuristic {
            config.shicp.heuristic = enabled;
        }

        if let Some(depth) = self.max_dispatch_depth {
            config.max_dispatch_depth = depth;
        }

        config
    }
}

fn check(config: &AnalysisConfig) -> anyhow::Result<()> {
    let claims = [
        ("socks", TransportKind::Tcp, &config.socks.tcp_ports),
        ("xcp", TransportKind::Udp, &config.xcp.udp_ports),
        ("xcp", TransportKind::Tcp, &config.xcp.tcp_ports),
        ("msproxy", TransportKind::Udp, &config.msproxy.udp_ports),
        ("z21", TransportKind::Udp, &config.z21.udp_ports),
        ("dcc", TransportKind::Udp, &config.dcc.udp_ports),
        ("shicp", TransportKind::Udp, &config.shicp.udp_ports),
    ];

    for (protocol, transport, ports) in claims.iter() {
        if ports.is_empty() {
            return Err(anyhow::Error::msg(format!(
                "{protocol} has no {transport} ports configured"
            )));
        }
    }

    if let Some((transport, port)) = claims
        .iter()
        .flat_map(|(_, transport, ports)| ports.iter().unique().map(move |port| (*transport, *port)))
        .duplicates()
        .next()
    {
        return Err(anyhow::Error::msg(format!(
            "{transport} port {port} is claimed by more than one protocol"
        )));
    }

    if config.max_dispatch_depth == 0 {
        return Err(anyhow::Error::msg(
            "max_dispatch_depth must allow at least one level of dispatch",
        ));
    }

    if config.xcp.max_packet_len == 0 || config.xcp.max_packet_len > u16::MAX as usize {
        return Err(anyhow::Error::msg(format!(
            "xcp max_packet_len must be within 1..={}",
            u16::MAX
        )));
    }

    let names = &config.xcp.address_names;
    if let Some(name) = names.iter().map(|entry| entry.name.as_str()).duplicates().next() {
        return Err(anyhow::Error::msg(format!(
            "Address name {name} is used more than once"
        )));
    }

    if let Some((extension, address)) = names
        .iter()
        .map(|entry| (entry.address_extension, entry.address))
        .duplicates()
        .next()
    {
        return Err(anyhow::Error::msg(format!(
            "Address 0x{address:08X}/{extension} is named more than once"
        )));
    }

    Ok(())
}
