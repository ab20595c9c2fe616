//! Protocol-number dispatch table.
//!
//! A [Registry] owns a list of [Entry] values, each naming a protocol number
//! and up to two handlers: one for payloads carried by IPv4 and one for IPv6.
//! Lookup is a linear scan in registration order; registries hold a handful
//! of entries.
//!
//! When several entries share a protocol number, the first one registered
//! that has a handler for the packet's IP version receives the payload.

use std::fmt;

use crate::IpError;
use crate::debug;
use crate::device::IfaceId;
use crate::ip::{IpHeader, Ipv4Header, Ipv6Header, Packet, Protocol};

/// Handler for payloads carried by IPv4 packets.
///
/// Receives the payload (its length is the declared total length minus the
/// header length), the interface the packet arrived on, and the decoded header.
/// Handlers run on the packet-processing path and must not block indefinitely.
pub type Ipv4Handler = Box<dyn FnMut(&[u8], IfaceId, &Ipv4Header) -> Result<(), IpError> + Send>;

/// Handler for payloads carried by IPv6 packets.
pub type Ipv6Handler = Box<dyn FnMut(&[u8], IfaceId, &Ipv6Header) -> Result<(), IpError> + Send>;

/// A protocol number, its name and its handlers.
pub struct Entry {
    protocol: Protocol,
    name: String,
    ipv4: Option<Ipv4Handler>,
    ipv6: Option<Ipv6Handler>,
}

impl Entry {
    /// Creates an entry with no handlers.
    pub fn new(protocol: Protocol, name: impl Into<String>) -> Self {
        Self {
            protocol,
            name: name.into(),
            ipv4: None,
            ipv6: None,
        }
    }

    /// Sets the handler invoked for IPv4 packets.
    pub fn on_ipv4<F>(mut self, handler: F) -> Self
    where
        F: FnMut(&[u8], IfaceId, &Ipv4Header) -> Result<(), IpError> + Send + 'static,
    {
        self.ipv4 = Some(Box::new(handler));
        self
    }

    /// Sets the handler invoked for IPv6 packets.
    pub fn on_ipv6<F>(mut self, handler: F) -> Self
    where
        F: FnMut(&[u8], IfaceId, &Ipv6Header) -> Result<(), IpError> + Send + 'static,
    {
        self.ipv6 = Some(Box::new(handler));
        self
    }

    /// Returns the protocol number.
    pub fn protocol(&self) -> Protocol {
        self.protocol
    }

    /// Returns the human-readable name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns `true` if an IPv4 handler is set.
    pub fn handles_ipv4(&self) -> bool {
        self.ipv4.is_some()
    }

    /// Returns `true` if an IPv6 handler is set.
    pub fn handles_ipv6(&self) -> bool {
        self.ipv6.is_some()
    }

    fn handles(&self, header: &IpHeader) -> bool {
        match header {
            IpHeader::V4(_) => self.handles_ipv4(),
            IpHeader::V6(_) => self.handles_ipv6(),
        }
    }
}

impl fmt::Debug for Entry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Entry")
            .field("protocol", &self.protocol)
            .field("name", &self.name)
            .field("ipv4", &self.handles_ipv4())
            .field("ipv6", &self.handles_ipv6())
            .finish()
    }
}

/// Table of protocol handlers.
#[derive(Debug, Default)]
pub struct Registry {
    entries: Vec<Entry>,
}

impl Registry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds an entry after all existing ones. Duplicate protocol numbers are
    /// allowed.
    pub fn register(&mut self, entry: Entry) -> &mut Self {
        debug!(
            "registered protocol {} as {:?} (ipv4: {}, ipv6: {})",
            entry.protocol,
            entry.name,
            entry.handles_ipv4(),
            entry.handles_ipv6()
        );

        self.entries.push(entry);
        self
    }

    /// Removes every entry for `protocol`, returning how many were removed.
    pub fn unregister(&mut self, protocol: Protocol) -> usize {
        let before = self.entries.len();
        self.entries.retain(|entry| entry.protocol != protocol);
        before - self.entries.len()
    }

    /// Returns the first entry registered for `protocol`.
    pub fn find(&self, protocol: Protocol) -> Option<&Entry> {
        self.entries.iter().find(|entry| entry.protocol == protocol)
    }

    /// Returns the number of entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns `true` if no entries are registered.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Iterates over the entries in registration order.
    pub fn entries(&self) -> impl Iterator<Item = &Entry> {
        self.entries.iter()
    }

    /// Hands the payload of a validated packet to the handler registered for
    /// its protocol number and IP version.
    ///
    /// # Errors
    ///
    /// Returns [IpError::Internal] if no entry handles the packet, otherwise
    /// whatever the handler returns.
    pub fn dispatch(&mut self, packet: &Packet<'_>, iface: IfaceId) -> Result<(), IpError> {
        let protocol = packet.header.protocol();

        let entry = self
            .entries
            .iter_mut()
            .find(|entry| entry.protocol == protocol && entry.handles(&packet.header))
            .ok_or(IpError::Internal("no handler registered for protocol"))?;

        match (&packet.header, &mut entry.ipv4, &mut entry.ipv6) {
            (IpHeader::V4(header), Some(handler), _) => handler(packet.payload, iface, header),
            (IpHeader::V6(header), _, Some(handler)) => handler(packet.payload, iface, header),
            _ => Err(IpError::Internal("no handler registered for protocol")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ip::{self, ValidatorConfig};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};

    const IFACE: IfaceId = IfaceId(3);

    fn ipv4_packet(protocol: Protocol, payload: &[u8]) -> Vec<u8> {
        let header =
            Ipv4Header::new([10, 0, 0, 1], [10, 0, 0, 2], protocol, payload.len()).unwrap();

        let mut buf = header.to_be_bytes();
        buf.extend_from_slice(payload);
        buf
    }

    fn ipv6_packet(protocol: Protocol, payload: &[u8]) -> Vec<u8> {
        let header = Ipv6Header::new([0; 16], [1; 16], protocol, payload.len() as u16);

        let mut buf = header.to_be_bytes().to_vec();
        buf.extend_from_slice(payload);
        buf
    }

    #[test]
    fn registry_dispatch_tcp_once() {
        let calls = Arc::new(Mutex::new(Vec::new()));
        let seen = Arc::clone(&calls);

        let mut registry = Registry::new();
        registry.register(Entry::new(Protocol::TCP, "tcp").on_ipv4(
            move |payload, iface, header| {
                seen.lock().unwrap().push((payload.to_vec(), iface, header.payload_len()));
                Ok(())
            },
        ));

        let buf = ipv4_packet(Protocol::TCP, b"segment");
        let packet = ip::validate(&buf, &ValidatorConfig::default()).unwrap();

        assert_eq!(registry.dispatch(&packet, IFACE), Ok(()));

        let calls = calls.lock().unwrap();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0], (b"segment".to_vec(), IFACE, 7));
    }

    #[test]
    fn registry_dispatch_unregistered_internal() {
        let mut registry = Registry::new();
        registry.register(Entry::new(Protocol::TCP, "tcp").on_ipv4(|_, _, _| Ok(())));

        let buf = ipv4_packet(Protocol::UDP, b"datagram");
        let packet = ip::validate(&buf, &ValidatorConfig::default()).unwrap();

        assert!(matches!(
            registry.dispatch(&packet, IFACE),
            Err(IpError::Internal(_))
        ));
    }

    #[test]
    fn registry_dispatch_propagates_handler_result() {
        let mut registry = Registry::new();
        registry.register(
            Entry::new(Protocol::ICMP, "icmp").on_ipv4(|_, _, _| Err(IpError::PacketLost)),
        );

        let buf = ipv4_packet(Protocol::ICMP, &[8, 0, 0, 0]);
        let packet = ip::validate(&buf, &ValidatorConfig::default()).unwrap();

        assert_eq!(registry.dispatch(&packet, IFACE), Err(IpError::PacketLost));
    }

    #[test]
    fn registry_duplicate_first_match_wins() {
        let first = Arc::new(AtomicUsize::new(0));
        let second = Arc::new(AtomicUsize::new(0));
        let (f, s) = (Arc::clone(&first), Arc::clone(&second));

        let mut registry = Registry::new();
        registry
            .register(Entry::new(Protocol::UDP, "udp-a").on_ipv4(move |_, _, _| {
                f.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }))
            .register(Entry::new(Protocol::UDP, "udp-b").on_ipv4(move |_, _, _| {
                s.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }));

        let buf = ipv4_packet(Protocol::UDP, b"x");
        let packet = ip::validate(&buf, &ValidatorConfig::default()).unwrap();

        registry.dispatch(&packet, IFACE).unwrap();
        registry.dispatch(&packet, IFACE).unwrap();

        assert_eq!(first.load(Ordering::SeqCst), 2);
        assert_eq!(second.load(Ordering::SeqCst), 0);
        assert_eq!(registry.find(Protocol::UDP).map(Entry::name), Some("udp-a"));
    }

    #[test]
    fn registry_version_specific_handlers() {
        let v4 = Arc::new(AtomicUsize::new(0));
        let v6 = Arc::new(AtomicUsize::new(0));
        let (c4, c6) = (Arc::clone(&v4), Arc::clone(&v6));

        let mut registry = Registry::new();
        // The first UDP entry only handles IPv6, so IPv4 falls through to the
        // second.
        registry
            .register(Entry::new(Protocol::UDP, "udp6").on_ipv6(move |payload, _, header| {
                assert_eq!(payload.len(), header.payload_len() as usize);
                c6.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }))
            .register(Entry::new(Protocol::UDP, "udp4").on_ipv4(move |_, _, _| {
                c4.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }));

        let config = ValidatorConfig::default().with_ipv6(true);

        let buf = ipv4_packet(Protocol::UDP, b"four");
        registry
            .dispatch(&ip::validate(&buf, &config).unwrap(), IFACE)
            .unwrap();

        let buf = ipv6_packet(Protocol::UDP, b"six");
        registry
            .dispatch(&ip::validate(&buf, &config).unwrap(), IFACE)
            .unwrap();

        assert_eq!(v4.load(Ordering::SeqCst), 1);
        assert_eq!(v6.load(Ordering::SeqCst), 1);

        let buf = ipv6_packet(Protocol::TCP, b"none");
        assert!(matches!(
            registry.dispatch(&ip::validate(&buf, &config).unwrap(), IFACE),
            Err(IpError::Internal(_))
        ));
    }

    #[test]
    fn registry_unregister_removes_all() {
        let mut registry = Registry::new();
        registry
            .register(Entry::new(Protocol::TCP, "tcp"))
            .register(Entry::new(Protocol::UDP, "udp"))
            .register(Entry::new(Protocol::TCP, "tcp-alt"));

        assert_eq!(registry.len(), 3);
        assert_eq!(registry.unregister(Protocol::TCP), 2);
        assert_eq!(registry.unregister(Protocol::TCP), 0);
        assert_eq!(
            registry.entries().map(Entry::name).collect::<Vec<_>>(),
            vec!["udp"]
        );
        assert!(!registry.is_empty());
    }

    #[test]
    fn registry_entry_without_handler_not_dispatched() {
        let mut registry = Registry::new();
        registry.register(Entry::new(Protocol::ICMP, "icmp"));

        let buf = ipv4_packet(Protocol::ICMP, &[]);
        let packet = ip::validate(&buf, &ValidatorConfig::default()).unwrap();

        assert!(matches!(
            registry.dispatch(&packet, IFACE),
            Err(IpError::Internal(_))
        ));
    }
}
