use std::process;

use netcore::device::{Device, IfaceId, Tun};
use netcore::ip::{IpAddress, Ipv4Header, Ipv6Header, Protocol, ValidatorConfig};
use netcore::pipeline::{self, Worker};
use netcore::registry::{Entry, Registry};
use netcore::{error, info, log};

const IFACE: IfaceId = IfaceId(1);

fn main() {
    log::init_from_env();

    let info = Tun::info(IFACE, "tun0").unwrap_or_else(|err| {
        error!("invalid interface name: {err}");
        process::exit(1);
    });

    let mut nic = Device::new(info, Tun::new());
    nic.open().unwrap_or_else(|err| {
        error!("failed to create TUN interface: {err}");
        process::exit(1);
    });

    info!("interface name: {}", nic.name());

    let config = pipeline::Config::default();
    let (tx, rx) = config.channel();

    let poller = pipeline::spawn_poller(nic, tx, config);

    let mut worker = Worker::new(
        rx,
        registry(),
        IFACE,
        ValidatorConfig::default().with_ipv6(true),
    );
    let stats = worker.run(&config.backoff);

    info!(
        "received {} packets, dispatched {}, dropped {}",
        stats.received,
        stats.dispatched,
        stats.dropped()
    );

    match poller.join() {
        Ok(Ok(mut nic)) => {
            if let Err(err) = nic.close() {
                error!("failed to close TUN interface: {err}");
            }
        }
        Ok(Err(err)) => {
            error!("failed to read from TUN interface: {err}");
            process::exit(1);
        }
        Err(_) => {
            error!("polling thread panicked");
            process::exit(1);
        }
    }
}

/// Builds a registry that logs every ICMP, TCP and UDP packet it sees.
fn registry() -> Registry {
    let mut registry = Registry::new();

    for (protocol, name) in [
        (Protocol::ICMP, "icmp"),
        (Protocol::TCP, "tcp"),
        (Protocol::UDP, "udp"),
        (Protocol::ICMPV6, "icmpv6"),
    ] {
        registry.register(
            Entry::new(protocol, name)
                .on_ipv4(move |payload: &[u8], iface: IfaceId, iph: &Ipv4Header| {
                    info!(
                        "{iface}: {} {} -> {} ({} bytes)",
                        protocol,
                        IpAddress::v4(iph.src()),
                        IpAddress::v4(iph.dst()),
                        payload.len()
                    );
                    Ok(())
                })
                .on_ipv6(move |payload: &[u8], iface: IfaceId, iph: &Ipv6Header| {
                    info!(
                        "{iface}: {} {} -> {} ({} bytes)",
                        protocol,
                        IpAddress::v6(iph.src()),
                        IpAddress::v6(iph.dst()),
                        payload.len()
                    );
                    Ok(())
                }),
        );
    }

    registry
}
