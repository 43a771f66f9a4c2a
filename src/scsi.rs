//! SCSI status, sense data and command response definitions
//!
//! This module holds the pieces of SPC that sit around persistent
//! reservation commands: status bytes, sense keys and additional sense codes
//! a device reports when it refuses a PR command.

use byteorder::{BigEndian, ByteOrder};
use std::fmt;

/// SCSI command opcodes used by this crate
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScsiOpcode {
    PersistentReserveIn = 0x5E,
    PersistentReserveOut = 0x5F,
}

impl ScsiOpcode {
    pub fn from_u8(val: u8) -> Option<Self> {
        match val {
            0x5E => Some(ScsiOpcode::PersistentReserveIn),
            0x5F => Some(ScsiOpcode::PersistentReserveOut),
            _ => None,
        }
    }
}

/// SCSI status codes
pub mod scsi_status {
    pub const GOOD: u8 = 0x00;
    pub const CHECK_CONDITION: u8 = 0x02;
    pub const CONDITION_MET: u8 = 0x04;
    pub const BUSY: u8 = 0x08;
    pub const RESERVATION_CONFLICT: u8 = 0x18;
    pub const TASK_SET_FULL: u8 = 0x28;
    pub const ACA_ACTIVE: u8 = 0x30;
    pub const TASK_ABORTED: u8 = 0x40;

    /// Human-readable name of a status byte
    pub fn name(status: u8) -> &'static str {
        match status {
            GOOD => "GOOD",
            CHECK_CONDITION => "CHECK CONDITION",
            CONDITION_MET => "CONDITION MET",
            BUSY => "BUSY",
            RESERVATION_CONFLICT => "RESERVATION CONFLICT",
            TASK_SET_FULL => "TASK SET FULL",
            ACA_ACTIVE => "ACA ACTIVE",
            TASK_ABORTED => "TASK ABORTED",
            _ => "UNKNOWN STATUS",
        }
    }
}

/// SCSI sense key codes
pub mod sense_key {
    pub const NO_SENSE: u8 = 0x00;
    pub const RECOVERED_ERROR: u8 = 0x01;
    pub const NOT_READY: u8 = 0x02;
    pub const MEDIUM_ERROR: u8 = 0x03;
    pub const HARDWARE_ERROR: u8 = 0x04;
    pub const ILLEGAL_REQUEST: u8 = 0x05;
    pub const UNIT_ATTENTION: u8 = 0x06;
    pub const DATA_PROTECT: u8 = 0x07;
    pub const ABORTED_COMMAND: u8 = 0x0B;

    pub fn name(key: u8) -> &'static str {
        match key & 0x0F {
            NO_SENSE => "NO SENSE",
            RECOVERED_ERROR => "RECOVERED ERROR",
            NOT_READY => "NOT READY",
            MEDIUM_ERROR => "MEDIUM ERROR",
            HARDWARE_ERROR => "HARDWARE ERROR",
            ILLEGAL_REQUEST => "ILLEGAL REQUEST",
            UNIT_ATTENTION => "UNIT ATTENTION",
            DATA_PROTECT => "DATA PROTECT",
            ABORTED_COMMAND => "ABORTED COMMAND",
            _ => "OTHER",
        }
    }
}

/// Additional Sense Code (ASC) values seen around PR commands
pub mod asc {
    pub const NO_ADDITIONAL_SENSE: u8 = 0x00;
    pub const LOGICAL_UNIT_NOT_READY: u8 = 0x04;
    pub const PARAMETER_LIST_LENGTH_ERROR: u8 = 0x1A;
    pub const INVALID_COMMAND_OPERATION_CODE: u8 = 0x20;
    pub const INVALID_FIELD_IN_CDB: u8 = 0x24;
    pub const LOGICAL_UNIT_NOT_SUPPORTED: u8 = 0x25;
    /// ASCQ 0x04 under this code is INVALID RELEASE OF PERSISTENT RESERVATION
    pub const INVALID_FIELD_IN_PARAMETER_LIST: u8 = 0x26;
    pub const POWER_ON_RESET: u8 = 0x29;
    /// ASCQ 0x03..0x05: reservations preempted / released, registrations preempted
    pub const PARAMETERS_CHANGED: u8 = 0x2A;
    pub const MEDIUM_NOT_PRESENT: u8 = 0x3A;
    pub const INTERNAL_TARGET_FAILURE: u8 = 0x44;
    pub const SYSTEM_RESOURCE_FAILURE: u8 = 0x55;
}

/// SCSI sense data, decoded from either fixed or descriptor format
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SenseData {
    pub sense_key: u8,
    pub asc: u8,        // Additional Sense Code
    pub ascq: u8,       // Additional Sense Code Qualifier
    pub information: u32,
}

impl SenseData {
    pub fn new(sense_key: u8, asc: u8, ascq: u8) -> Self {
        SenseData {
            sense_key,
            asc,
            ascq,
            information: 0,
        }
    }

    pub fn with_info(mut self, info: u32) -> Self {
        self.information = info;
        self
    }

    /// Serialize to fixed format sense data (18 bytes)
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut data = vec![0u8; 18];

        // Response code: 0x70 = current error, fixed format
        data[0] = 0x70;
        data[2] = self.sense_key & 0x0F;
        BigEndian::write_u32(&mut data[3..7], self.information);

        // Additional sense length: remaining bytes after this field
        data[7] = 10;

        data[12] = self.asc;
        data[13] = self.ascq;

        data
    }

    /// Parse sense data returned alongside CHECK CONDITION
    ///
    /// Accepts fixed (0x70/0x71) and descriptor (0x72/0x73) formats. Returns
    /// `None` when the buffer is too short or carries an unknown response code.
    pub fn from_bytes(buf: &[u8]) -> Option<Self> {
        if buf.len() < 4 {
            return None;
        }

        match buf[0] & 0x7F {
            0x70 | 0x71 => {
                let sense_key = buf[2] & 0x0F;
                let information = if buf.len() >= 7 {
                    BigEndian::read_u32(&buf[3..7])
                } else {
                    0
                };
                let asc = buf.get(12).copied().unwrap_or(0);
                let ascq = buf.get(13).copied().unwrap_or(0);
                Some(SenseData::new(sense_key, asc, ascq).with_info(information))
            }
            0x72 | 0x73 => {
                let mut sense = SenseData::new(buf[1] & 0x0F, buf[2], buf[3]);

                // Walk descriptors looking for the information descriptor (type 0)
                let additional = buf.get(7).copied().unwrap_or(0) as usize;
                let end = (8 + additional).min(buf.len());
                let mut offset = 8;
                while offset + 2 <= end {
                    let desc_type = buf[offset];
                    let desc_len = buf[offset + 1] as usize;
                    if desc_type == 0x00 && offset + 12 <= end {
                        let info = BigEndian::read_u64(&buf[offset + 4..offset + 12]);
                        sense.information = (info & 0xFFFF_FFFF) as u32;
                    }
                    offset += 2 + desc_len;
                }
                Some(sense)
            }
            _ => None,
        }
    }

    /// Operator-facing explanation of the sense code
    pub fn describe(&self) -> String {
        let detail = match (self.asc, self.ascq) {
            (asc::NO_ADDITIONAL_SENSE, _) => "no additional sense information",
            (asc::LOGICAL_UNIT_NOT_READY, _) => "logical unit not ready, retry once it becomes ready",
            (asc::PARAMETER_LIST_LENGTH_ERROR, _) => "parameter list length error",
            (asc::INVALID_COMMAND_OPERATION_CODE, _) => {
                "invalid command operation code, device does not support persistent reservations"
            }
            (asc::INVALID_FIELD_IN_CDB, _) => "invalid field in CDB",
            (asc::LOGICAL_UNIT_NOT_SUPPORTED, _) => "logical unit not supported",
            (asc::INVALID_FIELD_IN_PARAMETER_LIST, 0x04) => {
                "invalid release of persistent reservation, type does not match the active reservation"
            }
            (asc::INVALID_FIELD_IN_PARAMETER_LIST, _) => "invalid field in parameter list",
            (asc::POWER_ON_RESET, _) => "power on, reset, or bus device reset occurred",
            (asc::PARAMETERS_CHANGED, 0x03) => "reservations preempted by another initiator",
            (asc::PARAMETERS_CHANGED, 0x04) => "reservations released",
            (asc::PARAMETERS_CHANGED, 0x05) => "registrations preempted by another initiator",
            (asc::PARAMETERS_CHANGED, _) => "parameters changed",
            (asc::MEDIUM_NOT_PRESENT, _) => "medium not present",
            (asc::INTERNAL_TARGET_FAILURE, _) => "internal target failure",
            (asc::SYSTEM_RESOURCE_FAILURE, 0x02) => {
                "insufficient registration resources, the device cannot hold more keys"
            }
            (asc::SYSTEM_RESOURCE_FAILURE, _) => "system resource failure",
            _ => "unrecognized additional sense code",
        };

        format!(
            "{}: {} (asc 0x{:02x}, ascq 0x{:02x})",
            sense_key::name(self.sense_key),
            detail,
            self.asc,
            self.ascq
        )
    }

    /// Create sense data for invalid/unsupported command opcode
    pub fn invalid_command() -> Self {
        SenseData::new(sense_key::ILLEGAL_REQUEST, asc::INVALID_COMMAND_OPERATION_CODE, 0)
    }

    pub fn invalid_field_in_cdb() -> Self {
        SenseData::new(sense_key::ILLEGAL_REQUEST, asc::INVALID_FIELD_IN_CDB, 0)
    }

    pub fn invalid_field_in_parameter_list() -> Self {
        SenseData::new(sense_key::ILLEGAL_REQUEST, asc::INVALID_FIELD_IN_PARAMETER_LIST, 0)
    }

    pub fn parameter_list_length_error() -> Self {
        SenseData::new(sense_key::ILLEGAL_REQUEST, asc::PARAMETER_LIST_LENGTH_ERROR, 0)
    }

    /// Release whose type differs from the active reservation
    pub fn invalid_release() -> Self {
        SenseData::new(sense_key::ILLEGAL_REQUEST, asc::INVALID_FIELD_IN_PARAMETER_LIST, 0x04)
    }
}

impl fmt::Display for SenseData {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.describe())
    }
}

/// Result of SCSI command execution as reported by a transport
#[derive(Debug, Clone)]
pub struct ScsiResponse {
    /// SCSI status code
    pub status: u8,
    /// Data-in bytes actually transferred (may be shorter than requested)
    pub data: Vec<u8>,
    /// Sense data (for CHECK CONDITION status)
    pub sense: Option<SenseData>,
}

impl ScsiResponse {
    /// Create a GOOD status response with data
    pub fn good(data: Vec<u8>) -> Self {
        ScsiResponse {
            status: scsi_status::GOOD,
            data,
            sense: None,
        }
    }

    /// Create a GOOD status response without data
    pub fn good_no_data() -> Self {
        Self::with_status(scsi_status::GOOD)
    }

    /// Create a CHECK CONDITION response with sense data
    pub fn check_condition(sense: SenseData) -> Self {
        ScsiResponse {
            status: scsi_status::CHECK_CONDITION,
            data: Vec::new(),
            sense: Some(sense),
        }
    }

    pub fn reservation_conflict() -> Self {
        Self::with_status(scsi_status::RESERVATION_CONFLICT)
    }

    /// Bare status with no data or sense
    pub fn with_status(status: u8) -> Self {
        ScsiResponse {
            status,
            data: Vec::new(),
            sense: None,
        }
    }
}
