use super::{DeviceInfo, Driver, EtherType, HwAddr, IfaceId, LinkType};
use crate::channel::{self, Config, Receiver, Sender};
use crate::{ChannelError, DeviceError, Result};

/// Driver for a software loopback interface: every transmitted frame is queued
/// and handed back by a later poll.
///
/// Frames can also be injected from outside the device through a
/// [LoopbackHandle], which makes the driver useful for exercising receive
/// paths without a kernel interface.
#[derive(Debug)]
pub struct Loopback {
    tx: Sender<Vec<u8>>,
    rx: Receiver<Vec<u8>>,
}

/// Injects frames into a [Loopback] driver from another thread.
#[derive(Debug, Clone)]
pub struct LoopbackHandle {
    tx: Sender<Vec<u8>>,
}

impl Loopback {
    /// Default number of frames queued before transmissions are refused.
    pub const DEFAULT_BACKLOG: usize = 64;

    /// Creates a driver with [Loopback::DEFAULT_BACKLOG].
    pub fn new() -> Self {
        Self::with_backlog(Self::DEFAULT_BACKLOG)
    }

    /// Creates a driver queueing at most `backlog` frames.
    pub fn with_backlog(backlog: usize) -> Self {
        let (tx, rx) = channel::channel(Config::bounded(backlog));
        Self { tx, rx }
    }

    /// Returns [DeviceInfo] for a loopback interface named `name`.
    ///
    /// # Errors
    ///
    /// Returns an error if `name` is not a valid interface name.
    pub fn info(id: IfaceId, name: &str) -> Result<DeviceInfo> {
        DeviceInfo::new(id, name, LinkType::Loopback)
    }

    /// Returns a handle for injecting frames.
    pub fn handle(&self) -> LoopbackHandle {
        LoopbackHandle {
            tx: self.tx.clone(),
        }
    }

    /// Returns the number of queued frames.
    pub fn pending(&self) -> usize {
        self.rx.len()
    }
}

impl Default for Loopback {
    fn default() -> Self {
        Self::new()
    }
}

impl LoopbackHandle {
    /// Queues `frame` for the next poll.
    ///
    /// # Errors
    ///
    /// Returns [ChannelError::Limited] if the backlog is full.
    pub fn inject(&self, frame: impl Into<Vec<u8>>) -> std::result::Result<(), ChannelError> {
        self.tx.send(frame.into()).map_err(|err| err.kind())
    }
}

impl Driver for Loopback {
    fn open(&mut self, _info: &mut DeviceInfo) -> Result<()> {
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        while self.rx.receive().is_ok() {}
        Ok(())
    }

    fn transmit(&mut self, _ty: EtherType, data: &[u8], _dst: Option<&HwAddr>) -> Result<()> {
        self.tx
            .send(data.to_vec())
            .map_err(|_| DeviceError::Status(-libc::ENOBUFS).into())
    }

    fn poll(&mut self, buf: &mut [u8]) -> Result<Option<usize>> {
        let frame = match self.rx.receive() {
            Ok(frame) => frame,
            Err(_) => return Ok(None),
        };

        if frame.len() > buf.len() {
            return Err(DeviceError::FrameTooLarge {
                provided: frame.len(),
                mtu: buf.len(),
            }
            .into());
        }

        buf[..frame.len()].copy_from_slice(&frame);
        Ok(Some(frame.len()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Error;
    use crate::device::Device;

    fn loopback(backlog: usize) -> Device<Loopback> {
        let mut dev = Device::new(
            Loopback::info(IfaceId(0), "lo").unwrap(),
            Loopback::with_backlog(backlog),
        );
        dev.open().unwrap();
        dev
    }

    #[test]
    fn loopback_transmit_then_poll() {
        let mut dev = loopback(4);
        let mut buf = [0u8; 64];

        assert_eq!(dev.poll(&mut buf).unwrap(), None);

        dev.transmit(EtherType::IPV4, b"first", None).unwrap();
        dev.transmit(EtherType::IPV4, b"second", None).unwrap();

        assert_eq!(dev.poll(&mut buf).unwrap(), Some(5));
        assert_eq!(&buf[..5], b"first");
        assert_eq!(dev.poll(&mut buf).unwrap(), Some(6));
        assert_eq!(&buf[..6], b"second");
        assert_eq!(dev.poll(&mut buf).unwrap(), None);

        let stats = dev.stats();
        assert_eq!(stats.tx_packets, 2);
        assert_eq!(stats.rx_packets, 2);
        assert_eq!(stats.rx_bytes, 11);
    }

    #[test]
    fn loopback_backlog_full() {
        let mut dev = loopback(1);

        dev.transmit(EtherType::IPV4, b"a", None).unwrap();
        assert!(matches!(
            dev.transmit(EtherType::IPV4, b"b", None),
            Err(Error::Device(DeviceError::Status(status))) if status == -libc::ENOBUFS
        ));
        assert_eq!(dev.stats().tx_errors, 1);
    }

    #[test]
    fn loopback_handle_injects() {
        let dev = loopback(2);
        let handle = dev.driver().handle();

        handle.inject(&b"x"[..]).unwrap();
        handle.inject(vec![1, 2]).unwrap();
        assert_eq!(handle.inject(vec![3]), Err(ChannelError::Limited));
        assert_eq!(dev.driver().pending(), 2);
    }

    #[test]
    fn loopback_small_buffer() {
        let mut dev = loopback(2);
        dev.driver().handle().inject(vec![0u8; 32]).unwrap();

        let mut buf = [0u8; 16];
        assert!(matches!(
            dev.poll(&mut buf),
            Err(Error::Device(DeviceError::FrameTooLarge {
                provided: 32,
                mtu: 16
            }))
        ));
    }

    #[test]
    fn loopback_close_discards_backlog() {
        let mut dev = loopback(4);
        dev.transmit(EtherType::IPV6, b"stale", None).unwrap();

        dev.close().unwrap();
        assert_eq!(dev.driver().pending(), 0);

        dev.open().unwrap();
        let mut buf = [0u8; 8];
        assert_eq!(dev.poll(&mut buf).unwrap(), None);
    }
}
