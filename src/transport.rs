//! SCSI transport adapter interface
//!
//! The engine never talks to hardware itself. Implement [`ScsiTransport`]
//! on top of SG_IO, an iSCSI session, a virtual disk or anything else that
//! can carry a CDB to a logical unit and return the status byte.

use crate::error::{PrError, PrResult};
use crate::scsi::{scsi_status, sense_key, ScsiResponse};

/// Capability to execute one SCSI command against a logical unit
///
/// Calls are synchronous. Implementations own timeouts and their own retry
/// policy; a transport failure (as opposed to a SCSI status) is reported as
/// an error and passed through to the caller untouched.
pub trait ScsiTransport {
    /// Execute a command
    ///
    /// # Arguments
    /// * `cdb` - Command descriptor block
    /// * `data_out` - Data sent to the device (empty for data-in commands)
    /// * `expected_in_len` - Maximum number of data-in bytes to accept
    ///
    /// # Returns
    /// The status byte, the data-in bytes actually transferred and any sense data
    fn execute(
        &mut self,
        cdb: &[u8],
        data_out: &[u8],
        expected_in_len: usize,
    ) -> PrResult<ScsiResponse>;
}

impl<T: ScsiTransport + ?Sized> ScsiTransport for &mut T {
    fn execute(
        &mut self,
        cdb: &[u8],
        data_out: &[u8],
        expected_in_len: usize,
    ) -> PrResult<ScsiResponse> {
        (**self).execute(cdb, data_out, expected_in_len)
    }
}

impl<T: ScsiTransport + ?Sized> ScsiTransport for Box<T> {
    fn execute(
        &mut self,
        cdb: &[u8],
        data_out: &[u8],
        expected_in_len: usize,
    ) -> PrResult<ScsiResponse> {
        (**self).execute(cdb, data_out, expected_in_len)
    }
}

/// Map a command response onto its data-in bytes or a typed error
pub fn check_status(response: ScsiResponse) -> PrResult<Vec<u8>> {
    match response.status {
        scsi_status::GOOD | scsi_status::CONDITION_MET => Ok(response.data),
        scsi_status::RESERVATION_CONFLICT => Err(PrError::ReservationConflict(
            "device reported RESERVATION CONFLICT".to_string(),
        )),
        scsi_status::BUSY
        | scsi_status::TASK_SET_FULL
        | scsi_status::ACA_ACTIVE
        | scsi_status::TASK_ABORTED => Err(PrError::DeviceBusy(response.status)),
        scsi_status::CHECK_CONDITION => match response.sense {
            Some(sense) => match sense.sense_key {
                sense_key::NOT_READY | sense_key::UNIT_ATTENTION => {
                    log::debug!("Transient check condition: {}", sense);
                    Err(PrError::DeviceBusy(response.status))
                }
                // Includes ILLEGAL REQUEST; InvalidParameter is for local refusals only
                _ => Err(PrError::CheckCondition(sense)),
            },
            None => Err(PrError::Transport(
                "CHECK CONDITION without sense data".to_string(),
            )),
        },
        other => Err(PrError::Transport(format!(
            "unexpected SCSI status 0x{:02x} ({})",
            other,
            scsi_status::name(other)
        ))),
    }
}
