//! Core persistent reservation value types
//!
//! Reservation keys, reservation types and scopes, the PR generation counter
//! and SPC TransportIDs that name initiator ports.

use crate::error::{PrError, PrResult};
use byteorder::{BigEndian, ByteOrder};
use rand::Rng;
use std::fmt;
use std::str::FromStr;

/// 8-byte reservation key registered by an initiator port
///
/// A zero key never identifies a registration; on the wire it means
/// "no key" (e.g. the service action key of an unregister).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct ReservationKey(u64);

impl ReservationKey {
    pub const ZERO: ReservationKey = ReservationKey(0);

    pub const fn new(value: u64) -> Self {
        ReservationKey(value)
    }

    pub fn value(&self) -> u64 {
        self.0
    }

    pub fn is_zero(&self) -> bool {
        self.0 == 0
    }

    /// Generate a random non-zero key
    pub fn random() -> Self {
        let mut rng = rand::thread_rng();
        loop {
            let value: u64 = rng.gen();
            if value != 0 {
                return ReservationKey(value);
            }
        }
    }

    pub fn to_bytes(&self) -> [u8; 8] {
        self.0.to_be_bytes()
    }

    pub fn from_bytes(bytes: &[u8]) -> Self {
        ReservationKey(BigEndian::read_u64(bytes))
    }
}

impl From<u64> for ReservationKey {
    fn from(value: u64) -> Self {
        ReservationKey(value)
    }
}

impl fmt::Display for ReservationKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:016x}", self.0)
    }
}

impl FromStr for ReservationKey {
    type Err = PrError;

    /// Parse a key written in hex, with or without a `0x` prefix
    fn from_str(s: &str) -> PrResult<Self> {
        let digits = s
            .trim()
            .strip_prefix("0x")
            .or_else(|| s.trim().strip_prefix("0X"))
            .unwrap_or_else(|| s.trim());

        if digits.is_empty() || digits.len() > 16 {
            return Err(PrError::InvalidParameter(format!(
                "reservation key '{}' must be 1 to 16 hex digits",
                s
            )));
        }

        let padded = format!("{:0>16}", digits);
        let bytes = hex::decode(&padded).map_err(|e| {
            PrError::InvalidParameter(format!("reservation key '{}' is not hex: {}", s, e))
        })?;

        Ok(ReservationKey::from_bytes(&bytes))
    }
}

/// Persistent reservation type (SPC TYPE field)
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ReservationType {
    WriteExclusive = 0x01,
    ExclusiveAccess = 0x03,
    WriteExclusiveRegistrantsOnly = 0x05,
    ExclusiveAccessRegistrantsOnly = 0x06,
    WriteExclusiveAllRegistrants = 0x07,
    ExclusiveAccessAllRegistrants = 0x08,
}

impl ReservationType {
    pub const ALL: [ReservationType; 6] = [
        ReservationType::WriteExclusive,
        ReservationType::ExclusiveAccess,
        ReservationType::WriteExclusiveRegistrantsOnly,
        ReservationType::ExclusiveAccessRegistrantsOnly,
        ReservationType::WriteExclusiveAllRegistrants,
        ReservationType::ExclusiveAccessAllRegistrants,
    ];

    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            0x01 => Some(ReservationType::WriteExclusive),
            0x03 => Some(ReservationType::ExclusiveAccess),
            0x05 => Some(ReservationType::WriteExclusiveRegistrantsOnly),
            0x06 => Some(ReservationType::ExclusiveAccessRegistrantsOnly),
            0x07 => Some(ReservationType::WriteExclusiveAllRegistrants),
            0x08 => Some(ReservationType::ExclusiveAccessAllRegistrants),
            _ => None,
        }
    }

    pub fn code(&self) -> u8 {
        *self as u8
    }

    /// Every registrant is a reservation holder; the device reports key 0
    pub fn is_all_registrants(&self) -> bool {
        matches!(
            self,
            ReservationType::WriteExclusiveAllRegistrants
                | ReservationType::ExclusiveAccessAllRegistrants
        )
    }

    /// Abbreviation used by sg_persist and the SPC tables
    pub fn short_name(&self) -> &'static str {
        match self {
            ReservationType::WriteExclusive => "WE",
            ReservationType::ExclusiveAccess => "EA",
            ReservationType::WriteExclusiveRegistrantsOnly => "WERO",
            ReservationType::ExclusiveAccessRegistrantsOnly => "EARO",
            ReservationType::WriteExclusiveAllRegistrants => "WEAR",
            ReservationType::ExclusiveAccessAllRegistrants => "EAAR",
        }
    }
}

impl fmt::Display for ReservationType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.short_name())
    }
}

/// Reservation scope (upper nibble of the scope/type byte)
///
/// Element and extent scopes are obsolete and never produced.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ReservationScope {
    #[default]
    LogicalUnit = 0x00,
}

impl ReservationScope {
    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            0x00 => Some(ReservationScope::LogicalUnit),
            _ => None,
        }
    }

    pub fn code(&self) -> u8 {
        *self as u8
    }
}

/// Pack scope and type into the SPC scope/type byte
pub fn pack_scope_type(scope: ReservationScope, reservation_type: Option<ReservationType>) -> u8 {
    (scope.code() << 4) | reservation_type.map_or(0, |t| t.code())
}

/// PR generation counter reported in every PR IN header
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Generation(pub u32);

impl fmt::Display for Generation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// SCSI protocol identifiers (low nibble of TransportID byte 0)
pub mod protocol_id {
    pub const FCP: u8 = 0x00;
    pub const ISCSI: u8 = 0x05;
    pub const SAS: u8 = 0x06;
}

/// Minimum TransportID length allowed by SPC
pub const MIN_TRANSPORT_ID_LEN: usize = 24;

/// SPC TransportID naming an initiator port
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TransportId(Vec<u8>);

impl TransportId {
    /// iSCSI name TransportID (format 00b)
    ///
    /// The name is null terminated and padded to a multiple of four bytes,
    /// with the whole identifier at least 24 bytes long.
    pub fn iscsi(name: &str) -> Self {
        let mut payload = name.as_bytes().to_vec();
        payload.push(0);
        while payload.len() % 4 != 0 || payload.len() + 4 < MIN_TRANSPORT_ID_LEN {
            payload.push(0);
        }

        let mut bytes = vec![protocol_id::ISCSI, 0, 0, 0];
        BigEndian::write_u16(&mut bytes[2..4], payload.len() as u16);
        bytes.extend_from_slice(&payload);
        TransportId(bytes)
    }

    /// SAS address TransportID (24 bytes)
    pub fn sas(address: u64) -> Self {
        let mut bytes = vec![0u8; MIN_TRANSPORT_ID_LEN];
        bytes[0] = protocol_id::SAS;
        BigEndian::write_u64(&mut bytes[4..12], address);
        TransportId(bytes)
    }

    pub fn from_bytes(bytes: &[u8]) -> PrResult<Self> {
        if bytes.is_empty() {
            return Err(PrError::InvalidParameter("empty TransportID".to_string()));
        }
        Ok(TransportId(bytes.to_vec()))
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn protocol_id(&self) -> u8 {
        self.0[0] & 0x0F
    }

    pub fn iscsi_name(&self) -> Option<String> {
        if self.protocol_id() != protocol_id::ISCSI || self.0.len() < 4 {
            return None;
        }
        let declared = BigEndian::read_u16(&self.0[2..4]) as usize;
        let payload = &self.0[4..(4 + declared).min(self.0.len())];
        let name_len = payload.iter().position(|&b| b == 0).unwrap_or(payload.len());
        Some(String::from_utf8_lossy(&payload[..name_len]).into_owned())
    }

    pub fn sas_address(&self) -> Option<u64> {
        if self.protocol_id() != protocol_id::SAS || self.0.len() < 12 {
            return None;
        }
        Some(BigEndian::read_u64(&self.0[4..12]))
    }
}

impl fmt::Display for TransportId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(name) = self.iscsi_name() {
            write!(f, "iscsi:{}", name)
        } else if let Some(address) = self.sas_address() {
            write!(f, "sas:0x{:016x}", address)
        } else {
            write!(f, "tid:{}", hex::encode(&self.0))
        }
    }
}
