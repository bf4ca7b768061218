//! The emulator's configuration and cli parsing code using [serde] and [clap].
//!
//! Options are read from a YAML configuration file, and most can be overridden on the command
//! line. [schemars] provides the description (doc comment) and default value of each option so
//! that they can be shown in the CLI help text.
//!
//! This code only checks the format of the options. Whether they make sense together (for
//! example that the gateway node exists) is checked when the emulation is built.

use std::collections::BTreeMap;
use std::str::FromStr;
use std::time::Duration;

use clap::Parser;
use merge::Merge;
use once_cell::sync::Lazy;
use schemars::{schema_for, JsonSchema};
use serde::{Deserialize, Serialize};

use crate::host::network::interface::IpNetwork;
use crate::host::socket_layer::SocketLayerConfig;
use crate::network::nat::DEFAULT_BASE_PORT;
use crate::proxy::channels::ChannelPorts;
use crate::proxy::ProxyConfig;

const START_HELP_TEXT: &str = "\
    Connect real applications to an emulated network.\n\n\
    Proxies drive virtual sockets over UDP, and an optional gateway translates \
    traffic between the emulated network and a real interface.";

#[derive(Debug, Clone, Parser)]
#[clap(name = "emu-socket", about = START_HELP_TEXT, version)]
#[clap(next_display_order = None)]
#[clap(hide_possible_values = true)]
pub struct CliOptions {
    /// Path to the configuration file. Use '-' to read from stdin
    pub config: String,

    /// Exit after printing the final configuration
    #[clap(long)]
    pub show_config: bool,

    #[clap(flatten)]
    pub general: GeneralOptions,

    #[clap(flatten)]
    pub proxy: ProxyOptions,

    #[clap(flatten)]
    pub socket_layer: SocketLayerOptions,
}

/// Options contained in a configuration file.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ConfigFileOptions {
    #[serde(default)]
    pub general: GeneralOptions,

    #[serde(default)]
    pub proxy: ProxyOptions,

    #[serde(default)]
    pub socket_layer: SocketLayerOptions,

    #[serde(default)]
    pub gateway: Option<GatewayOptions>,

    // sorted by id so that nodes are built in a deterministic order
    pub nodes: BTreeMap<u32, NodeOptions>,
}

/// Configuration options after processing command-line and configuration file options.
#[derive(Debug, Clone, Serialize)]
pub struct ConfigOptions {
    pub general: GeneralOptions,
    pub proxy: ProxyOptions,
    pub socket_layer: SocketLayerOptions,
    pub gateway: Option<GatewayOptions>,
    pub nodes: BTreeMap<u32, NodeOptions>,
}

impl ConfigOptions {
    pub fn new(config_file: ConfigFileOptions, options: CliOptions) -> Self {
        // override config options with command line options, and fill in anything still unset
        Self {
            general: options
                .general
                .with_defaults(config_file.general)
                .with_defaults(GeneralOptions::new_with_defaults()),
            proxy: options
                .proxy
                .with_defaults(config_file.proxy)
                .with_defaults(ProxyOptions::new_with_defaults()),
            socket_layer: options
                .socket_layer
                .with_defaults(config_file.socket_layer)
                .with_defaults(SocketLayerOptions::new_with_defaults()),
            gateway: config_file.gateway,
            nodes: config_file.nodes,
        }
    }

    pub fn log_level(&self) -> log::LevelFilter {
        self.general
            .log_level
            .map(|l| log::Level::from(l).to_level_filter())
            .unwrap_or(log::LevelFilter::Info)
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.general.tick_interval_ms.unwrap_or(1))
    }

    pub fn stop_after(&self) -> Option<Duration> {
        self.general.stop_after_secs.map(Duration::from_secs)
    }

    pub fn proxy_enabled(&self) -> bool {
        self.proxy.enabled.unwrap_or(true)
    }

    pub fn channel_ports(&self) -> ChannelPorts {
        let default = ChannelPorts::default();
        ChannelPorts {
            control: self.proxy.control_port.unwrap_or(default.control),
            data: self.proxy.data_port.unwrap_or(default.data),
            control_v6: self.proxy.control_port_v6.unwrap_or(default.control_v6),
            data_v6: self.proxy.data_port_v6.unwrap_or(default.data_v6),
            multicast: self.proxy.multicast_port.unwrap_or(default.multicast),
        }
    }

    pub fn proxy_config(&self) -> ProxyConfig {
        let default = ProxyConfig::default();
        ProxyConfig {
            beacon_interval: self
                .proxy
                .beacon_interval_ms
                .map(Duration::from_millis)
                .unwrap_or(default.beacon_interval),
            max_connection_managers: self
                .proxy
                .max_connection_managers
                .unwrap_or(default.max_connection_managers),
            max_message_size: self
                .proxy
                .max_message_size
                .unwrap_or(default.max_message_size),
        }
    }

    pub fn socket_layer_config(&self) -> SocketLayerConfig {
        let default = SocketLayerConfig::default();
        SocketLayerConfig {
            max_descriptors: self
                .socket_layer
                .max_descriptors
                .unwrap_or(default.max_descriptors),
            accept_backlog: self
                .socket_layer
                .accept_backlog
                .unwrap_or(default.accept_backlog),
        }
    }
}

/// Help messages used by Clap for command line arguments, combining the doc string with
/// the Serde default.
static GENERAL_HELP: Lazy<std::collections::HashMap<String, String>> =
    Lazy::new(|| generate_help_strs(schema_for!(GeneralOptions)));

// these must all be Option types since they aren't required by the CLI, even if they're
// required in the configuration file
#[derive(Debug, Clone, Default, Parser, Serialize, Deserialize, Merge, JsonSchema)]
#[clap(next_help_heading = "General (Override configuration file options)")]
#[clap(next_display_order = None)]
#[serde(deny_unknown_fields)]
pub struct GeneralOptions {
    /// Log level of output written on stdout. Messages at level 'trace' are always dropped in
    /// release builds
    #[clap(long, short = 'l', value_name = "level")]
    #[clap(help = help(&GENERAL_HELP, "log_level"))]
    #[serde(default = "default_some_info")]
    pub log_level: Option<LogLevel>,

    /// Interval between two polls of the proxy channels and the capture device
    #[clap(long, value_name = "ms")]
    #[clap(help = help(&GENERAL_HELP, "tick_interval_ms"))]
    #[serde(default = "default_some_1")]
    pub tick_interval_ms: Option<u64>,

    /// Stop after this many seconds instead of running until interrupted
    #[clap(long, value_name = "seconds")]
    #[clap(help = help(&GENERAL_HELP, "stop_after_secs"))]
    #[serde(default)]
    pub stop_after_secs: Option<u64>,
}

impl GeneralOptions {
    fn new_with_defaults() -> Self {
        Self {
            log_level: default_some_info(),
            tick_interval_ms: default_some_1(),
            stop_after_secs: None,
        }
    }

    /// Replace unset (`None`) values of `base` with values from `default`.
    pub fn with_defaults(mut self, default: Self) -> Self {
        self.merge(default);
        self
    }
}

static PROXY_HELP: Lazy<std::collections::HashMap<String, String>> =
    Lazy::new(|| generate_help_strs(schema_for!(ProxyOptions)));

#[derive(Debug, Clone, Default, Parser, Serialize, Deserialize, Merge, JsonSchema)]
#[clap(next_help_heading = "Proxy (Override configuration file options)")]
#[clap(next_display_order = None)]
#[serde(deny_unknown_fields)]
pub struct ProxyOptions {
    /// Open the proxy channels
    #[clap(long = "proxy-enabled", value_name = "bool")]
    #[clap(help = help(&PROXY_HELP, "enabled"))]
    #[serde(default = "default_some_true")]
    pub enabled: Option<bool>,

    /// UDP port of the IPv4 control channel
    #[clap(long, value_name = "port")]
    #[clap(help = help(&PROXY_HELP, "control_port"))]
    #[serde(default = "default_control_port")]
    pub control_port: Option<u16>,

    /// UDP port of the IPv4 data channel
    #[clap(long, value_name = "port")]
    #[clap(help = help(&PROXY_HELP, "data_port"))]
    #[serde(default = "default_data_port")]
    pub data_port: Option<u16>,

    /// UDP port of the IPv6 control channel
    #[clap(long, value_name = "port")]
    #[clap(help = help(&PROXY_HELP, "control_port_v6"))]
    #[serde(default = "default_control_port_v6")]
    pub control_port_v6: Option<u16>,

    /// UDP port of the IPv6 data channel
    #[clap(long, value_name = "port")]
    #[clap(help = help(&PROXY_HELP, "data_port_v6"))]
    #[serde(default = "default_data_port_v6")]
    pub data_port_v6: Option<u16>,

    /// UDP port that IPv6 solicitations are multicast to
    #[clap(long, value_name = "port")]
    #[clap(help = help(&PROXY_HELP, "multicast_port"))]
    #[serde(default = "default_multicast_port")]
    pub multicast_port: Option<u16>,

    /// Interval between two beacons to connection managers
    #[clap(long, value_name = "ms")]
    #[clap(help = help(&PROXY_HELP, "beacon_interval_ms"))]
    #[serde(default = "default_beacon_interval_ms")]
    pub beacon_interval_ms: Option<u64>,

    /// Connection managers beyond this many are ignored
    #[clap(long, value_name = "N")]
    #[clap(help = help(&PROXY_HELP, "max_connection_managers"))]
    #[serde(default = "default_max_connection_managers")]
    pub max_connection_managers: Option<usize>,

    /// Messages to proxies larger than this many bytes are dropped
    #[clap(long, value_name = "bytes")]
    #[clap(help = help(&PROXY_HELP, "max_message_size"))]
    #[serde(default = "default_max_message_size")]
    pub max_message_size: Option<usize>,
}

impl ProxyOptions {
    fn new_with_defaults() -> Self {
        Self {
            enabled: default_some_true(),
            control_port: default_control_port(),
            data_port: default_data_port(),
            control_port_v6: default_control_port_v6(),
            data_port_v6: default_data_port_v6(),
            multicast_port: default_multicast_port(),
            beacon_interval_ms: default_beacon_interval_ms(),
            max_connection_managers: default_max_connection_managers(),
            max_message_size: default_max_message_size(),
        }
    }

    pub fn with_defaults(mut self, default: Self) -> Self {
        self.merge(default);
        self
    }
}

static SOCKET_LAYER_HELP: Lazy<std::collections::HashMap<String, String>> =
    Lazy::new(|| generate_help_strs(schema_for!(SocketLayerOptions)));

#[derive(Debug, Clone, Default, Parser, Serialize, Deserialize, Merge, JsonSchema)]
#[clap(next_help_heading = "Socket layer (Override configuration file options)")]
#[clap(next_display_order = None)]
#[serde(deny_unknown_fields)]
pub struct SocketLayerOptions {
    /// Open sockets allowed per node
    #[clap(long, value_name = "N")]
    #[clap(help = help(&SOCKET_LAYER_HELP, "max_descriptors"))]
    #[serde(default = "default_max_descriptors")]
    pub max_descriptors: Option<usize>,

    /// Largest backlog of pending connections on a listening socket
    #[clap(long, value_name = "N")]
    #[clap(help = help(&SOCKET_LAYER_HELP, "accept_backlog"))]
    #[serde(default = "default_accept_backlog")]
    pub accept_backlog: Option<usize>,
}

impl SocketLayerOptions {
    fn new_with_defaults() -> Self {
        Self {
            max_descriptors: default_max_descriptors(),
            accept_backlog: default_accept_backlog(),
        }
    }

    pub fn with_defaults(mut self, default: Self) -> Self {
        self.merge(default);
        self
    }
}

/// The gateway between the emulated network and a real interface.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct GatewayOptions {
    /// The node whose traffic to foreign addresses leaves through the gateway
    pub node: u32,

    /// IPv4 address of the real interface
    pub interface_address: std::net::Ipv4Addr,

    /// IPv6 address of the real interface
    #[serde(default)]
    pub interface_address_v6: Option<std::net::Ipv6Addr>,

    /// Name of the interface to capture replies on. Without one, nothing is captured
    #[serde(default)]
    pub capture_device: Option<String>,

    /// Capture on a dedicated thread
    #[serde(default)]
    pub threaded_capture: bool,

    /// Frames the capture thread can queue before dropping them
    #[serde(default = "default_capture_queue_len")]
    pub capture_queue_len: usize,

    /// First translation port handed out
    #[serde(default = "default_nat_base_port")]
    pub nat_base_port: u16,

    /// Also rewrite the fragment field when converting IPv4 headers
    #[serde(default)]
    pub format_ip_fragment: bool,

    /// Write translated packets to this pcap file
    #[serde(default)]
    pub pcap_file: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct NodeOptions {
    pub hostname: String,

    /// The partition that handles the node
    #[serde(default)]
    pub partition: u32,

    #[serde(default)]
    pub interfaces: Vec<InterfaceOptions>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct InterfaceOptions {
    /// An IPv4 address and prefix length, such as "10.0.0.1/24"
    #[serde(default)]
    #[schemars(with = "Option<String>")]
    pub ipv4: Option<IpNetwork>,

    /// An IPv6 address and prefix length, such as "2001:db8::1/64"
    #[serde(default)]
    #[schemars(with = "Option<String>")]
    pub ipv6: Option<IpNetwork>,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "kebab-case")]
pub enum LogLevel {
    Error,
    Warning,
    Info,
    Debug,
    Trace,
}

impl FromStr for LogLevel {
    type Err = serde_yaml::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        serde_yaml::from_str(s)
    }
}

impl From<LogLevel> for log::Level {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Error => log::Level::Error,
            LogLevel::Warning => log::Level::Warn,
            LogLevel::Info => log::Level::Info,
            LogLevel::Debug => log::Level::Debug,
            LogLevel::Trace => log::Level::Trace,
        }
    }
}

fn default_some_true() -> Option<bool> {
    Some(true)
}

fn default_some_1() -> Option<u64> {
    Some(1)
}

fn default_some_info() -> Option<LogLevel> {
    Some(LogLevel::Info)
}

fn default_control_port() -> Option<u16> {
    Some(ChannelPorts::default().control)
}

fn default_data_port() -> Option<u16> {
    Some(ChannelPorts::default().data)
}

fn default_control_port_v6() -> Option<u16> {
    Some(ChannelPorts::default().control_v6)
}

fn default_data_port_v6() -> Option<u16> {
    Some(ChannelPorts::default().data_v6)
}

fn default_multicast_port() -> Option<u16> {
    Some(ChannelPorts::default().multicast)
}

fn default_beacon_interval_ms() -> Option<u64> {
    Some(ProxyConfig::default().beacon_interval.as_millis() as u64)
}

fn default_max_connection_managers() -> Option<usize> {
    Some(ProxyConfig::default().max_connection_managers)
}

fn default_max_message_size() -> Option<usize> {
    Some(ProxyConfig::default().max_message_size)
}

fn default_max_descriptors() -> Option<usize> {
    Some(SocketLayerConfig::default().max_descriptors)
}

fn default_accept_backlog() -> Option<usize> {
    Some(SocketLayerConfig::default().accept_backlog)
}

fn default_capture_queue_len() -> usize {
    1024
}

fn default_nat_base_port() -> u16 {
    DEFAULT_BASE_PORT
}

/// Generate help strings for objects in a JSON schema, including the Serde defaults if available.
fn generate_help_strs(
    schema: schemars::schema::RootSchema,
) -> std::collections::HashMap<String, String> {
    let mut defaults = std::collections::HashMap::<String, String>::new();
    let Some(object) = schema.schema.object.as_ref() else {
        return defaults;
    };
    for (name, obj) in &object.properties {
        if let Some(meta) = obj.clone().into_object().metadata {
            let description = meta.description.unwrap_or_default();
            let space = if !description.is_empty() { " " } else { "" };
            match meta.default {
                Some(default) => defaults.insert(
                    name.clone(),
                    format!("{}{}[default: {}]", description, space, default),
                ),
                None => defaults.insert(name.clone(), description.to_string()),
            };
        }
    }
    defaults
}

/// The help string of option `name`, or an empty string if it has none.
fn help(strs: &'static std::collections::HashMap<String, String>, name: &str) -> &'static str {
    strs.get(name).map(String::as_str).unwrap_or_default()
}
