//! Glue between a device and the protocol registry.
//!
//! A poller thread owns the [Device] and pushes every frame it reads into a
//! channel. A [Worker] pops frames, validates them and dispatches their
//! payloads. Neither side blocks on the channel; both back off with a capped
//! exponential delay when there is nothing to do.
//!
//! Closing the channel from either side stops both.

use std::thread::{self, JoinHandle};
use std::time::Duration;

use crate::channel::{self, Receiver, Sender};
use crate::device::{Device, Driver, IfaceId, MTU_SIZE};
use crate::ip::{self, ValidatorConfig};
use crate::registry::Registry;
use crate::{ChannelError, DeviceError, Error, IpError, Result};
use crate::{debug, error, warn};

/// Capped exponential backoff for retry loops.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
    /// First delay after a streak of successful operations.
    pub initial: Duration,
    /// Upper bound for a single delay.
    pub max: Duration,
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            initial: Duration::from_micros(50),
            max: Duration::from_millis(10),
        }
    }
}

impl Backoff {
    /// Returns a fresh delay sequence starting at `initial`.
    pub fn start(&self) -> Delay {
        Delay {
            next: self.initial,
            backoff: *self,
        }
    }
}

/// A running delay sequence created by [Backoff::start].
#[derive(Debug, Clone)]
pub struct Delay {
    next: Duration,
    backoff: Backoff,
}

impl Delay {
    /// Returns the next delay and doubles the following one, up to the
    /// configured maximum.
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.next;
        self.next = (self.next * 2).min(self.backoff.max);
        delay.min(self.backoff.max)
    }

    /// Sleeps for the next delay.
    pub fn wait(&mut self) {
        thread::sleep(self.next_delay());
    }

    /// Restarts the sequence at the initial delay.
    pub fn reset(&mut self) {
        self.next = self.backoff.initial;
    }
}

/// Configuration for [spawn_poller].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Config {
    /// Capacity and overflow policy of the frame channel.
    pub channel: channel::Config,
    /// Size of the buffer each frame is read into.
    pub frame_len: usize,
    /// Delay applied when no frame is ready or the channel is full.
    pub backoff: Backoff,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            channel: channel::Config::bounded(256),
            frame_len: MTU_SIZE,
            backoff: Backoff::default(),
        }
    }
}

impl Config {
    /// Sets the channel configuration.
    pub fn with_channel(mut self, channel: channel::Config) -> Self {
        self.channel = channel;
        self
    }

    /// Sets the frame buffer size.
    pub fn with_frame_len(mut self, frame_len: usize) -> Self {
        self.frame_len = frame_len;
        self
    }

    /// Sets the backoff.
    pub fn with_backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = backoff;
        self
    }

    /// Creates the frame channel described by this configuration.
    pub fn channel(&self) -> (Sender<Vec<u8>>, Receiver<Vec<u8>>) {
        channel::channel(self.channel)
    }
}

/// Moves `device` onto a new thread that polls it and sends every frame into
/// `tx`.
///
/// The thread runs until the channel is closed, then returns the device so it
/// can be reused or closed by the caller. If polling fails the channel is
/// closed and the error is returned instead.
///
/// The device must already be open.
pub fn spawn_poller<D>(
    mut device: Device<D>,
    tx: Sender<Vec<u8>>,
    config: Config,
) -> JoinHandle<Result<Device<D>>>
where
    D: Driver + Send + 'static,
{
    thread::spawn(move || {
        let mut buf = vec![0u8; config.frame_len];
        let mut delay = config.backoff.start();

        debug!("polling device {} ({})", device.name(), device.id());

        while !tx.is_closed() {
            let nbytes = match device.poll(&mut buf) {
                Ok(Some(nbytes)) => nbytes,
                Ok(None) => {
                    delay.wait();
                    continue;
                }
                // The driver has already discarded the frame.
                Err(err @ Error::Device(DeviceError::FrameTooLarge { .. })) => {
                    warn!("dropped frame on device {}: {err}", device.name());
                    continue;
                }
                Err(err) => {
                    error!("failed to poll device {}: {err}", device.name());
                    tx.close();
                    return Err(err);
                }
            };

            delay.reset();

            let mut frame = buf[..nbytes].to_vec();
            loop {
                match tx.send(frame) {
                    Ok(()) => break,
                    Err(err) if err.kind() == ChannelError::Limited => {
                        frame = err.into_inner();
                        delay.wait();
                    }
                    Err(_) => break,
                }
            }
        }

        debug!("stopped polling device {}", device.name());
        Ok(device)
    })
}

/// Counters kept by a [Worker].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WorkerStats {
    /// Frames taken from the channel.
    pub received: u64,
    /// Packets a handler accepted.
    pub dispatched: u64,
    /// Dropped with [IpError::Version].
    pub version: u64,
    /// Dropped with [IpError::HeaderLength].
    pub header_length: u64,
    /// Dropped with [IpError::PacketLength].
    pub packet_length: u64,
    /// Dropped with [IpError::PacketLost].
    pub packet_lost: u64,
    /// Dropped with [IpError::Checksum].
    pub checksum: u64,
    /// Dropped with [IpError::Internal], including packets with no handler.
    pub internal: u64,
}

impl WorkerStats {
    /// Returns the total number of dropped packets.
    pub fn dropped(&self) -> u64 {
        self.version
            + self.header_length
            + self.packet_length
            + self.packet_lost
            + self.checksum
            + self.internal
    }

    fn record(&mut self, err: &IpError) {
        let counter = match err {
            IpError::Version { .. } => &mut self.version,
            IpError::HeaderLength { .. } => &mut self.header_length,
            IpError::PacketLength { .. } => &mut self.packet_length,
            IpError::PacketLost => &mut self.packet_lost,
            IpError::Checksum { .. } => &mut self.checksum,
            IpError::Internal(_) => &mut self.internal,
        };
        *counter += 1;
    }
}

/// Validates frames from a channel and dispatches them through a [Registry].
#[derive(Debug)]
pub struct Worker {
    rx: Receiver<Vec<u8>>,
    registry: Registry,
    iface: IfaceId,
    config: ValidatorConfig,
    stats: WorkerStats,
}

impl Worker {
    /// Creates a worker for frames received on interface `iface`.
    pub fn new(
        rx: Receiver<Vec<u8>>,
        registry: Registry,
        iface: IfaceId,
        config: ValidatorConfig,
    ) -> Self {
        Self {
            rx,
            registry,
            iface,
            config,
            stats: WorkerStats::default(),
        }
    }

    /// Processes at most one frame without waiting.
    ///
    /// # Errors
    ///
    /// Returns [ChannelError::Empty] if no frame is queued,
    /// [ChannelError::Closed] once the channel is closed and drained, or the
    /// [IpError] the frame was dropped with. Dropped frames are counted in
    /// [Worker::stats].
    pub fn run_once(&mut self) -> Result<()> {
        let frame = self.rx.receive()?;
        self.stats.received += 1;

        let result = ip::validate(&frame, &self.config)
            .and_then(|packet| self.registry.dispatch(&packet, self.iface));

        match result {
            Ok(()) => {
                self.stats.dispatched += 1;
                Ok(())
            }
            Err(err) => {
                self.stats.record(&err);
                match err {
                    IpError::Internal(_) => warn!("dropped packet on {}: {err}", self.iface),
                    _ => debug!("dropped packet on {}: {err}", self.iface),
                }
                Err(err.into())
            }
        }
    }

    /// Processes frames until the channel is closed and drained, backing off
    /// while it is empty. Returns the final counters.
    pub fn run(&mut self, backoff: &Backoff) -> WorkerStats {
        let mut delay = backoff.start();

        loop {
            match self.run_once() {
                Ok(()) | Err(Error::Ip(_)) => delay.reset(),
                Err(Error::Channel(ChannelError::Empty)) => delay.wait(),
                Err(_) => break,
            }
        }

        debug!(
            "worker on {} finished: {} received, {} dispatched, {} dropped",
            self.iface,
            self.stats.received,
            self.stats.dispatched,
            self.stats.dropped()
        );
        self.stats
    }

    /// Returns the counters.
    pub fn stats(&self) -> WorkerStats {
        self.stats
    }

    /// Returns the registry.
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Returns the registry mutably, e.g. to register handlers between runs.
    pub fn registry_mut(&mut self) -> &mut Registry {
        &mut self.registry
    }

    /// Consumes the worker, returning its registry.
    pub fn into_registry(self) -> Registry {
        self.registry
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::Loopback;
    use crate::ip::{Ipv4Header, Protocol};
    use crate::registry::Entry;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    const IFACE: IfaceId = IfaceId(9);

    fn fast() -> Backoff {
        Backoff {
            initial: Duration::from_micros(10),
            max: Duration::from_micros(200),
        }
    }

    fn udp_packet(payload: &[u8]) -> Vec<u8> {
        let header = Ipv4Header::new(
            [192, 168, 0, 1],
            [192, 168, 0, 2],
            Protocol::UDP,
            payload.len(),
        )
        .unwrap();

        let mut buf = header.to_be_bytes();
        buf.extend_from_slice(payload);
        buf
    }

    fn counting_registry(count: Arc<AtomicUsize>) -> Registry {
        let mut registry = Registry::new();
        registry.register(Entry::new(Protocol::UDP, "udp").on_ipv4(
            move |_payload: &[u8], iface: IfaceId, _header: &Ipv4Header| {
                assert_eq!(iface, IFACE);
                count.fetch_add(1, Ordering::SeqCst);
                Ok(())
            },
        ));
        registry
    }

    #[test]
    fn backoff_doubles_until_max() {
        let mut delay = Backoff {
            initial: Duration::from_millis(1),
            max: Duration::from_millis(5),
        }
        .start();

        assert_eq!(delay.next_delay(), Duration::from_millis(1));
        assert_eq!(delay.next_delay(), Duration::from_millis(2));
        assert_eq!(delay.next_delay(), Duration::from_millis(4));
        assert_eq!(delay.next_delay(), Duration::from_millis(5));
        assert_eq!(delay.next_delay(), Duration::from_millis(5));

        delay.reset();
        assert_eq!(delay.next_delay(), Duration::from_millis(1));
    }

    #[test]
    fn worker_run_once() {
        let count = Arc::new(AtomicUsize::new(0));
        let (tx, rx) = Config::default().channel();
        let mut worker = Worker::new(
            rx,
            counting_registry(count.clone()),
            IFACE,
            ValidatorConfig::default(),
        );

        assert!(matches!(
            worker.run_once(),
            Err(Error::Channel(ChannelError::Empty))
        ));

        tx.send(udp_packet(b"hello")).unwrap();
        worker.run_once().unwrap();
        assert_eq!(count.load(Ordering::SeqCst), 1);

        tx.close();
        assert!(matches!(
            worker.run_once(),
            Err(Error::Channel(ChannelError::Closed))
        ));
    }

    #[test]
    fn worker_counts_drops() {
        let count = Arc::new(AtomicUsize::new(0));
        let (tx, rx) = Config::default().channel();
        let mut worker = Worker::new(
            rx,
            counting_registry(count.clone()),
            IFACE,
            ValidatorConfig::default(),
        );

        let mut corrupt = udp_packet(b"data");
        corrupt[10] ^= 0xff;

        let mut expired = udp_packet(b"data");
        expired[8] = 0;

        let tcp = {
            let header = Ipv4Header::new([1, 1, 1, 1], [2, 2, 2, 2], Protocol::TCP, 0).unwrap();
            header.to_be_bytes()
        };

        for frame in [
            vec![0x45; 10],
            vec![0x60; 40],
            corrupt,
            expired,
            tcp,
            udp_packet(b"ok"),
        ] {
            tx.send(frame).unwrap();
        }
        tx.close();

        let stats = worker.run(&fast());

        assert_eq!(stats.received, 6);
        assert_eq!(stats.dispatched, 1);
        assert_eq!(stats.header_length, 1);
        assert_eq!(stats.version, 1);
        assert_eq!(stats.checksum, 1);
        assert_eq!(stats.packet_lost, 1);
        assert_eq!(stats.internal, 1);
        assert_eq!(stats.dropped(), 5);
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn poller_forwards_frames_and_returns_device() {
        let mut device = Device::new(Loopback::info(IFACE, "lo0").unwrap(), Loopback::new());
        device.open().unwrap();

        let handle = device.driver().handle();
        for i in 0..5u8 {
            handle.inject(vec![i; 3]).unwrap();
        }

        let config = Config::default()
            .with_channel(channel::Config::bounded(1))
            .with_backoff(fast());
        let (tx, rx) = config.channel();
        let poller = spawn_poller(device, tx, config);

        let mut frames = Vec::new();
        while frames.len() < 5 {
            match rx.receive() {
                Ok(frame) => frames.push(frame),
                Err(ChannelError::Empty) => thread::yield_now(),
                Err(ChannelError::Closed) | Err(ChannelError::Limited) => break,
            }
        }
        rx.close();

        let device = poller.join().unwrap().unwrap();
        assert_eq!(frames, (0..5u8).map(|i| vec![i; 3]).collect::<Vec<_>>());
        assert_eq!(device.stats().rx_packets, 5);
        assert!(device.is_up());
    }

    #[test]
    fn poller_skips_oversized_frame() {
        let mut device = Device::new(Loopback::info(IFACE, "lo0").unwrap(), Loopback::new());
        device.open().unwrap();

        let handle = device.driver().handle();
        handle.inject(vec![0u8; MTU_SIZE + 500]).unwrap();
        handle.inject(udp_packet(b"after")).unwrap();

        let config = Config::default().with_backoff(fast());
        let (tx, rx) = config.channel();
        let poller = spawn_poller(device, tx, config);

        let frame = loop {
            match rx.receive() {
                Ok(frame) => break frame,
                Err(ChannelError::Empty) => thread::yield_now(),
                Err(err) => panic!("channel failed: {err}"),
            }
        };
        assert_eq!(frame, udp_packet(b"after"));
        assert!(!rx.is_closed());

        rx.close();
        let device = poller.join().unwrap().unwrap();
        assert_eq!(device.stats().rx_errors, 1);
        assert_eq!(device.stats().rx_packets, 1);
    }

    #[test]
    fn poller_requires_open_device() {
        let device = Device::new(Loopback::info(IFACE, "lo0").unwrap(), Loopback::new());
        let config = Config::default().with_backoff(fast());
        let (tx, rx) = config.channel();

        let result = spawn_poller(device, tx, config).join().unwrap();

        assert!(matches!(
            result,
            Err(Error::Device(DeviceError::NotOpen))
        ));
        assert!(rx.is_closed());
    }
}
