use std::ffi::CStr;
use std::fs::{File, OpenOptions};
use std::io::{self, Read, Write};
use std::os::unix::io::{AsRawFd, RawFd};
use std::{mem, ptr};

use super::{DeviceInfo, Driver, EtherType, HwAddr, IFNAMSIZ, LinkType};
use crate::error::errno;
use crate::{DeviceError, Error, Result};

/// Length of the packet information prefix the kernel adds when `IFF_NO_PI`
/// is not set.
const PACKET_INFO_LEN: usize = 4;

/// Set in the packet information flags when the kernel truncated the frame to
/// fit the read buffer.
const TUN_PKT_STRIP: u16 = 0x0001;

/// Largest frame a TUN interface can deliver (the IP total length limit).
const MAX_FRAME_LEN: usize = u16::MAX as usize;

/// Driver for a Linux TUN (network TUNnel) interface, a virtual layer 3 device
/// that transfers raw IP packets between user space and the kernel.
///
/// The interface is created when the device is opened and released when it is
/// closed. Opening requires the `CAP_NET_ADMIN` capability.
#[derive(Debug, Default)]
pub struct Tun {
    fd: Option<File>,
    packet_info: bool,
    scratch: Vec<u8>,
}

impl Tun {
    /// Creates a driver whose frames carry no packet information.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a driver whose frames carry the kernel's 4-byte packet
    /// information prefix:
    ///
    /// - Flags [2 bytes]
    /// - Proto [2 bytes] [EtherType](https://en.wikipedia.org/wiki/EtherType)
    ///
    /// The prefix is stripped on [Driver::poll] and added on
    /// [Driver::transmit], so callers always see raw IP packets.
    pub fn with_packet_info() -> Self {
        Self {
            packet_info: true,
            ..Self::default()
        }
    }

    /// Returns [DeviceInfo] for a TUN interface named `name`.
    ///
    /// # Errors
    ///
    /// Returns an error if `name` is not a valid interface name.
    pub fn info(id: super::IfaceId, name: &str) -> Result<DeviceInfo> {
        DeviceInfo::new(id, name, LinkType::Tun)
    }

    /// Returns the raw file descriptor, or `None` if the interface is not
    /// open.
    pub fn fd(&self) -> Option<RawFd> {
        self.fd.as_ref().map(AsRawFd::as_raw_fd)
    }

    fn file(&self) -> Result<&File> {
        self.fd.as_ref().ok_or(Error::Device(DeviceError::NotOpen))
    }

    fn create_tun(name: &str, packet_info: bool) -> Result<(File, String)> {
        if name.len() >= IFNAMSIZ {
            return Err(Error::Io(io::Error::new(
                io::ErrorKind::InvalidInput,
                "interface name too long",
            )));
        }

        let fd = OpenOptions::new()
            .read(true)
            .write(true)
            .open("/dev/net/tun")?;

        let mut ifr: libc::ifreq = unsafe { mem::zeroed() };

        // IFF_TUN   - TUN device (no Ethernet headers)
        //
        // IFF_NO_PI - Do not provide packet information
        let flags = if packet_info {
            libc::IFF_TUN
        } else {
            libc::IFF_TUN | libc::IFF_NO_PI
        };

        unsafe {
            // SAFETY: `name.len()` is less than `IFNAMSIZ`.
            ptr::copy_nonoverlapping(
                name.as_ptr(),
                ifr.ifr_name.as_mut_ptr() as *mut u8,
                name.len(),
            );

            ifr.ifr_ifru.ifru_flags = flags as i16;
        }

        if unsafe { libc::ioctl(fd.as_raw_fd(), libc::TUNSETIFF, &ifr) } == -1 {
            return Err(errno!("failed to bind network interface with TUN file handle"));
        }

        // SAFETY: `ifr_name` remains null-terminated after copying `name`.
        let assigned = unsafe {
            CStr::from_ptr(ifr.ifr_name.as_ptr())
                .to_string_lossy()
                .into_owned()
        };

        Ok((fd, assigned))
    }

    fn set_non_blocking(fd: &File) -> Result<()> {
        let fd = fd.as_raw_fd();

        // Get current flags so they can be combined with `O_NONBLOCK`.
        let flags = unsafe { libc::fcntl(fd, libc::F_GETFL) };
        if flags == -1 {
            return Err(errno!("failed to get flags of TUN file handle"));
        }

        if unsafe { libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) } == -1 {
            return Err(errno!("failed to set TUN file handle to non-blocking"));
        }

        Ok(())
    }
}

impl Driver for Tun {
    fn open(&mut self, info: &mut DeviceInfo) -> Result<()> {
        let (fd, assigned) = Self::create_tun(info.name(), self.packet_info)?;
        Self::set_non_blocking(&fd)?;

        // The requested name is a suggestion; the kernel may pick another.
        info.set_name(&assigned)?;

        self.scratch = vec![0; MAX_FRAME_LEN + PACKET_INFO_LEN];
        self.fd = Some(fd);
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        self.fd = None;
        Ok(())
    }

    fn transmit(&mut self, ty: EtherType, data: &[u8], _dst: Option<&HwAddr>) -> Result<()> {
        let mut file = self.file()?;

        if self.packet_info {
            let mut frame = Vec::with_capacity(PACKET_INFO_LEN + data.len());
            frame.extend_from_slice(&[0, 0]);
            frame.extend_from_slice(&ty.0.to_be_bytes());
            frame.extend_from_slice(data);
            file.write_all(&frame)?;
        } else {
            file.write_all(data)?;
        }

        Ok(())
    }

    fn poll(&mut self, buf: &mut [u8]) -> Result<Option<usize>> {
        let Some(mut file) = self.fd.as_ref() else {
            return Err(DeviceError::NotOpen.into());
        };

        // Frames are always read whole into `scratch` so that one larger than
        // `buf` is reported rather than truncated by the kernel.
        let nbytes = match file.read(&mut self.scratch) {
            Ok(nbytes) => nbytes,
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => return Ok(None),
            Err(err) if err.kind() == io::ErrorKind::Interrupted => return Ok(None),
            Err(err) => return Err(err.into()),
        };

        unpack(&self.scratch[..nbytes], self.packet_info, buf)
    }
}

/// Copies the frame read from the kernel into `buf`, stripping the packet
/// information prefix when present.
fn unpack(raw: &[u8], packet_info: bool, buf: &mut [u8]) -> Result<Option<usize>> {
    let frame = if packet_info {
        if raw.len() < PACKET_INFO_LEN {
            return Ok(None);
        }

        // Flags are in host byte order; only the protocol is big-endian.
        let flags = u16::from_ne_bytes([raw[0], raw[1]]);
        if flags & TUN_PKT_STRIP != 0 {
            return Err(DeviceError::FrameTooLarge {
                provided: raw.len() - PACKET_INFO_LEN,
                mtu: buf.len(),
            }
            .into());
        }

        &raw[PACKET_INFO_LEN..]
    } else {
        raw
    };

    if frame.len() > buf.len() {
        return Err(DeviceError::FrameTooLarge {
            provided: frame.len(),
            mtu: buf.len(),
        }
        .into());
    }

    buf[..frame.len()].copy_from_slice(frame);
    Ok(Some(frame.len()))
}
