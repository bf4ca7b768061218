use std::fs::File;
use std::io::BufWriter;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use anyhow::Context;
use emu_packet::FormatOptions;

use crate::core::configuration::{ConfigOptions, GatewayOptions, NodeOptions};
use crate::core::kernel::{GatewayLink, Kernel};
use crate::host::network::interface::{IpNetwork, NodeInterface};
use crate::host::network::NetworkStack;
use crate::host::node::{NodeId, NodeInfo};
use crate::network::capture::{PacketSource, RawCapture, RawInjector, ThreadedCapture};
use crate::network::gateway::{Gateway, GatewayConfig};
use crate::proxy::channels::Channels;
use crate::proxy::Proxy;

/// How long the capture thread waits for a frame before checking whether it should stop.
const CAPTURE_THREAD_TIMEOUT: std::time::Duration = std::time::Duration::from_millis(100);

/// Frames read from the capture per tick, so that a busy interface can't starve the proxies.
const MAX_FRAMES_PER_TICK: usize = 1024;

pub struct Controller<'a> {
    config: &'a ConfigOptions,
    kernel: Kernel,
    proxy: Proxy,
    channels: Option<Channels>,
    capture: Option<Box<dyn PacketSource>>,
}

impl<'a> Controller<'a> {
    /// Build the nodes, and open the proxy channels and the gateway.
    pub fn new(config: &'a ConfigOptions) -> anyhow::Result<Self> {
        let mut kernel = Kernel::new(config.socket_layer_config());

        for (id, options) in &config.nodes {
            let (info, network) = build_node(*id, options)
                .with_context(|| format!("Invalid configuration for node {id}"))?;
            kernel.add_node(info, network)?;
        }

        let mut capture = None;
        if let Some(options) = &config.gateway {
            kernel.set_gateway(build_gateway(options)?)?;
            capture = open_capture(options)?;
        }

        let channels = if config.proxy_enabled() {
            let channels = Channels::open(
                &config.channel_ports(),
                config.proxy_config().max_message_size,
            )
            .context("Could not open the proxy channels")?;
            Some(channels)
        } else {
            log::info!("Proxy channels are disabled");
            None
        };

        Ok(Self {
            config,
            kernel,
            proxy: Proxy::new(&config.proxy_config()),
            channels,
            capture,
        })
    }

    /// Run until `stop` is set, the configured run time elapses, or a fatal error occurs.
    pub fn run(mut self, stop: &AtomicBool) -> anyhow::Result<()> {
        let start = Instant::now();
        let end = self.config.stop_after().map(|d| start + d);
        let tick_interval = self.config.tick_interval();

        log::info!(
            "Running {} nodes in {} partitions",
            self.kernel.nodes().count(),
            self.kernel.num_partitions()
        );

        while !stop.load(Ordering::Relaxed) {
            let now = Instant::now();
            if end.is_some_and(|end| now >= end) {
                log::info!("Stopping after {:?}", now - start);
                break;
            }

            self.tick(now)?;
            std::thread::sleep(tick_interval);
        }

        self.kernel.flush_gateway();
        log::info!("Emulation finished");
        Ok(())
    }

    fn tick(&mut self, now: Instant) -> anyhow::Result<()> {
        if let Some(channels) = &self.channels {
            for incoming in channels.poll() {
                self.kernel
                    .dispatch_incoming(&mut self.proxy, incoming, now)
                    .context("Fatal proxy protocol error")?;
            }
        }

        self.drain_capture();

        self.kernel
            .process_inboxes(&mut self.proxy, now)
            .context("Fatal proxy protocol error")?;
        self.kernel.run_until_idle();

        self.proxy.send_beacons(now, self.kernel.nodes());
        if let Some(channels) = &mut self.channels {
            self.proxy.flush(channels);
        } else {
            let dropped = self.proxy.egress().borrow_mut().drain().count();
            if dropped > 0 {
                log::trace!("Dropped {dropped} proxy messages; the channels are disabled");
            }
        }

        Ok(())
    }

    fn drain_capture(&mut self) {
        let Some(capture) = &mut self.capture else {
            return;
        };

        for _ in 0..MAX_FRAMES_PER_TICK {
            match capture.next_frame() {
                Ok(Some(frame)) => self.kernel.ingress_frame(&frame),
                Ok(None) => break,
                Err(e) => {
                    log::error!("Packet capture stopped: {e}");
                    self.capture = None;
                    break;
                }
            }
        }
    }
}

fn build_node(id: u32, options: &NodeOptions) -> anyhow::Result<(NodeInfo, NetworkStack)> {
    let mut interfaces = Vec::with_capacity(options.interfaces.len());
    for (index, iface) in options.interfaces.iter().enumerate() {
        check_family(iface.ipv4.as_ref(), true).with_context(|| format!("Interface {index}"))?;
        check_family(iface.ipv6.as_ref(), false).with_context(|| format!("Interface {index}"))?;
        interfaces.push(NodeInterface::new(index, iface.ipv4, iface.ipv6));
    }

    let info = NodeInfo {
        id: NodeId::from(id),
        hostname: options.hostname.clone(),
        partition: options.partition,
    };
    Ok((info, NetworkStack::new(interfaces)))
}

fn check_family(net: Option<&IpNetwork>, ipv4: bool) -> anyhow::Result<()> {
    match net {
        Some(net) if net.addr().is_ipv4() != ipv4 => {
            let expected = if ipv4 { "IPv4" } else { "IPv6" };
            anyhow::bail!("{net} is not an {expected} address")
        }
        _ => Ok(()),
    }
}

fn build_gateway(options: &GatewayOptions) -> anyhow::Result<GatewayLink> {
    let mut gateway = Gateway::new(GatewayConfig {
        interface_address: options.interface_address,
        interface_address_v6: options.interface_address_v6,
        nat_base_port: options.nat_base_port,
        format_options: FormatOptions {
            format_ip_fragment: options.format_ip_fragment,
        },
    });

    if let Some(path) = &options.pcap_file {
        let file = File::create(path)
            .with_context(|| format!("Could not create the pcap file {path:?}"))?;
        gateway = gateway
            .with_pcap(Box::new(BufWriter::new(file)))
            .with_context(|| format!("Could not write to the pcap file {path:?}"))?;
    }

    let injector = RawInjector::open().context("Could not open a raw socket for the gateway")?;

    Ok(GatewayLink {
        node: NodeId::from(options.node),
        gateway,
        sink: Box::new(injector),
    })
}

fn open_capture(options: &GatewayOptions) -> anyhow::Result<Option<Box<dyn PacketSource>>> {
    let Some(device) = &options.capture_device else {
        log::info!("No capture device; replies to the gateway won't be received");
        return Ok(None);
    };

    let context = || format!("Could not capture on {device:?}");
    if options.threaded_capture {
        let source =
            RawCapture::open(device, Some(CAPTURE_THREAD_TIMEOUT)).with_context(context)?;
        let capture =
            ThreadedCapture::spawn(source, options.capture_queue_len).with_context(context)?;
        Ok(Some(Box::new(capture)))
    } else {
        let source = RawCapture::open(device, None).with_context(context)?;
        Ok(Some(Box::new(source)))
    }
}

/// A flag set when the process receives SIGINT or SIGTERM.
pub fn install_stop_flag() -> anyhow::Result<Arc<AtomicBool>> {
    let stop = Arc::new(AtomicBool::new(false));
    for signal in [signal_hook::consts::SIGINT, signal_hook::consts::SIGTERM] {
        signal_hook::flag::register(signal, stop.clone())
            .with_context(|| format!("Could not install a handler for signal {signal}"))?;
    }
    Ok(stop)
}
