//! EtherNet/IP encapsulation (spec.md section 6).
//!
//! Only the encapsulation header and the `ListIdentity` UDP discovery
//! path are implemented — full CIP tag read/write is out of scope for
//! the core (spec.md section 1 treats wire-level PLC drivers as
//! pluggable external collaborators). This exists to demonstrate the
//! driver-registry boundary with a second family beside OPC UA and to
//! give the optional discovery path described in the spec a concrete
//! home.

use crate::drivers::traits::{Driver, DriverConfig, DriverResult, DriverStatus, TagRequest};
use crate::error::WarlinkError;
use crate::value::TagValue;
use async_trait::async_trait;
use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use tokio::net::UdpSocket;
use tokio::time::{timeout, Duration};

pub const LIST_IDENTITY_PORT: u16 = 44818;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum Command {
    Nop = 0x00,
    ListIdentity = 0x63,
    RegisterSession = 0x65,
    UnRegisterSession = 0x66,
    SendRrData = 0x6F,
    SendUnitData = 0x70,
}

/// The 24-byte encapsulation header: `{command, length, session_handle,
/// status, context[8], options}`. Multibyte fields are little-endian
/// except where CPF item fields specify otherwise (section 6 notes the
/// ListIdentity response's socket address is big-endian).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncapsulationHeader {
    pub command: u16,
    pub length: u16,
    pub session_handle: u32,
    pub status: u32,
    pub context: [u8; 8],
    pub options: u32,
}

impl EncapsulationHeader {
    pub const SIZE: usize = 24;

    pub fn new(command: Command, length: u16) -> Self {
        EncapsulationHeader {
            command: command as u16,
            length,
            session_handle: 0,
            status: 0,
            context: [0; 8],
            options: 0,
        }
    }

    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let mut buf = [0u8; Self::SIZE];
        buf[0..2].copy_from_slice(&self.command.to_le_bytes());
        buf[2..4].copy_from_slice(&self.length.to_le_bytes());
        buf[4..8].copy_from_slice(&self.session_handle.to_le_bytes());
        buf[8..12].copy_from_slice(&self.status.to_le_bytes());
        buf[12..20].copy_from_slice(&self.context);
        buf[20..24].copy_from_slice(&self.options.to_le_bytes());
        buf
    }

    pub fn from_bytes(buf: &[u8]) -> DriverResult<Self> {
        if buf.len() < Self::SIZE {
            return Err(WarlinkError::Protocol("encapsulation header truncated".into()));
        }
        let mut context = [0u8; 8];
        context.copy_from_slice(&buf[12..20]);
        Ok(EncapsulationHeader {
            command: u16::from_le_bytes([buf[0], buf[1]]),
            length: u16::from_le_bytes([buf[2], buf[3]]),
            session_handle: u32::from_le_bytes([buf[4], buf[5], buf[6], buf[7]]),
            status: u32::from_le_bytes([buf[8], buf[9], buf[10], buf[11]]),
            context,
            options: u32::from_le_bytes([buf[20], buf[21], buf[22], buf[23]]),
        })
    }
}

/// One device's CPF identity item (type `0x000C`), the subset of
/// fields meaningful to a gateway deciding whether a discovered device
/// matches a configured PLC.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceIdentity {
    pub encapsulation_protocol_version: u16,
    pub socket_address: SocketAddr,
    pub vendor_id: u16,
    pub device_type: u16,
    pub product_code: u16,
    pub revision: (u8, u8),
    pub status: u16,
    pub serial_number: u32,
    pub product_name: String,
    pub device_state: u8,
}

fn parse_identity_item(buf: &[u8]) -> DriverResult<DeviceIdentity> {
    // Layout (after the 4-byte CPF item type+length header, already stripped
    // by the caller): protocol version (LE u16), socket address family (BE
    // u16), port (BE u16), ipv4 (BE u32), 8 bytes reserved, vendor id (LE
    // u16), device type (LE u16), product code (LE u16), major/minor
    // revision (2 bytes), status (LE u16), serial number (LE u32), product
    // name length-prefixed string, device state (u8).
    if buf.len() < 2 + 2 + 2 + 4 + 8 + 2 + 2 + 2 + 2 + 2 + 4 + 1 {
        return Err(WarlinkError::Protocol("identity item truncated".into()));
    }
    let mut pos = 0usize;
    let protocol_version = u16::from_le_bytes([buf[pos], buf[pos + 1]]);
    pos += 2;
    let _family = u16::from_be_bytes([buf[pos], buf[pos + 1]]);
    pos += 2;
    let port = u16::from_be_bytes([buf[pos], buf[pos + 1]]);
    pos += 2;
    let ip_bits = u32::from_be_bytes([buf[pos], buf[pos + 1], buf[pos + 2], buf[pos + 3]]);
    pos += 4;
    pos += 8; // reserved
    let vendor_id = u16::from_le_bytes([buf[pos], buf[pos + 1]]);
    pos += 2;
    let device_type = u16::from_le_bytes([buf[pos], buf[pos + 1]]);
    pos += 2;
    let product_code = u16::from_le_bytes([buf[pos], buf[pos + 1]]);
    pos += 2;
    let revision = (buf[pos], buf[pos + 1]);
    pos += 2;
    let status = u16::from_le_bytes([buf[pos], buf[pos + 1]]);
    pos += 2;
    let serial_number = u32::from_le_bytes([buf[pos], buf[pos + 1], buf[pos + 2], buf[pos + 3]]);
    pos += 4;
    let name_len = *buf.get(pos).ok_or_else(|| WarlinkError::Protocol("identity item truncated".into()))? as usize;
    pos += 1;
    let name_bytes = buf
        .get(pos..pos + name_len)
        .ok_or_else(|| WarlinkError::Protocol("identity item truncated".into()))?;
    let product_name = String::from_utf8_lossy(name_bytes).to_string();
    pos += name_len;
    let device_state = *buf.get(pos).unwrap_or(&0);

    Ok(DeviceIdentity {
        encapsulation_protocol_version: protocol_version,
        socket_address: SocketAddr::new(IpAddr::V4(Ipv4Addr::from(ip_bits)), port),
        vendor_id,
        device_type,
        product_code,
        revision,
        status,
        serial_number,
        product_name,
        device_state,
    })
}

/// Broadcast a `ListIdentity` request and collect replies until `timeout_ms` elapses.
pub async fn list_identity(timeout_ms: u64) -> DriverResult<Vec<DeviceIdentity>> {
    let socket = UdpSocket::bind("0.0.0.0:0")
        .await
        .map_err(|e| WarlinkError::Driver { retryable: true, message: e.to_string() })?;
    socket
        .set_broadcast(true)
        .map_err(|e| WarlinkError::Driver { retryable: true, message: e.to_string() })?;

    let header = EncapsulationHeader::new(Command::ListIdentity, 0);
    let request = header.to_bytes();
    socket
        .send_to(&request, (Ipv4Addr::BROADCAST, LIST_IDENTITY_PORT))
        .await
        .map_err(|e| WarlinkError::Driver { retryable: true, message: e.to_string() })?;

    let mut identities = Vec::new();
    let deadline = Duration::from_millis(timeout_ms);
    let mut buf = [0u8; 1024];
    loop {
        match timeout(deadline, socket.recv_from(&mut buf)).await {
            Ok(Ok((n, _src))) => {
                if let Ok(identity) = parse_list_identity_response(&buf[..n]) {
                    identities.push(identity);
                }
            }
            _ => break,
        }
    }
    Ok(identities)
}

fn parse_list_identity_response(buf: &[u8]) -> DriverResult<DeviceIdentity> {
    let header = EncapsulationHeader::from_bytes(buf)?;
    if header.command != Command::ListIdentity as u16 {
        return Err(WarlinkError::Protocol("unexpected command in ListIdentity reply".into()));
    }
    let payload = &buf[EncapsulationHeader::SIZE..];
    // CPF: item count (u16 LE) then items of {type(u16 LE), length(u16 LE), data}.
    if payload.len() < 2 {
        return Err(WarlinkError::Protocol("CPF payload truncated".into()));
    }
    let item_count = u16::from_le_bytes([payload[0], payload[1]]);
    let mut pos = 2usize;
    for _ in 0..item_count {
        let item_type = u16::from_le_bytes([payload[pos], payload[pos + 1]]);
        let item_len = u16::from_le_bytes([payload[pos + 2], payload[pos + 3]]) as usize;
        let data = &payload[pos + 4..pos + 4 + item_len];
        if item_type == 0x000C {
            return parse_identity_item(data);
        }
        pos += 4 + item_len;
    }
    Err(WarlinkError::Protocol("no identity item (0x000C) in CPF payload".into()))
}

/// Placeholder driver for the `ethernet_ip` family: implements
/// connect-level session registration framing only. Tag read/write is
/// deliberately unimplemented; see the module doc comment.
pub struct EtherNetIpDriver {
    config: DriverConfig,
    session_handle: Option<u32>,
}

impl EtherNetIpDriver {
    pub fn new(config: DriverConfig) -> Self {
        EtherNetIpDriver { config, session_handle: None }
    }
}

#[async_trait]
impl Driver for EtherNetIpDriver {
    fn config(&self) -> &DriverConfig {
        &self.config
    }

    async fn connect(&mut self) -> DriverResult<()> {
        // Full TCP RegisterSession handshake is out of scope; discovery
        // (list_identity) is the only wire operation this driver implements.
        self.session_handle = Some(1);
        Ok(())
    }

    async fn disconnect(&mut self) -> DriverResult<()> {
        self.session_handle = None;
        Ok(())
    }

    async fn check_status(&mut self) -> DriverResult<DriverStatus> {
        match self.session_handle {
            Some(_) => Ok(DriverStatus::Connected),
            None => Err(WarlinkError::NotConnected(self.config.id.clone())),
        }
    }

    async fn read_tags(&mut self, _tags: &[TagRequest]) -> DriverResult<HashMap<String, TagValue>> {
        Err(WarlinkError::Driver {
            retryable: false,
            message: "EtherNet/IP CIP tag read is outside the core driver scope".into(),
        })
    }

    async fn write_tags(
        &mut self,
        _tags: HashMap<String, TagValue>,
    ) -> DriverResult<HashMap<String, TagValue>> {
        Err(WarlinkError::Driver {
            retryable: false,
            message: "EtherNet/IP CIP tag write is outside the core driver scope".into(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_round_trips_through_bytes() {
        let header = EncapsulationHeader {
            command: Command::RegisterSession as u16,
            length: 4,
            session_handle: 0xDEADBEEF,
            status: 0,
            context: [1, 2, 3, 4, 5, 6, 7, 8],
            options: 0,
        };
        let bytes = header.to_bytes();
        assert_eq!(bytes.len(), EncapsulationHeader::SIZE);
        let parsed = EncapsulationHeader::from_bytes(&bytes).unwrap();
        assert_eq!(parsed, header);
    }

    #[test]
    fn register_session_command_value() {
        let header = EncapsulationHeader::new(Command::RegisterSession, 4);
        // 0x65 little-endian as the first two bytes.
        assert_eq!(&header.to_bytes()[0..2], &[0x65, 0x00]);
    }

    #[test]
    fn from_bytes_rejects_truncated_header() {
        assert!(EncapsulationHeader::from_bytes(&[0u8; 10]).is_err());
    }
}
