//! PERSISTENT RESERVE IN / OUT command encoding
//!
//! Builds the 10-byte CDBs and PR OUT parameter lists defined by SPC, and
//! decodes them back into typed commands.
//!
//! PR IN CDB layout:
//!   [0]     = 0x5E
//!   [1]     = service action (bits 4:0)
//!   [2..7]  = reserved
//!   [7..9]  = allocation length (big-endian u16)
//!   [9]     = control
//!
//! PR OUT CDB layout:
//!   [0]     = 0x5F
//!   [1]     = service action (bits 4:0)
//!   [2]     = scope (bits 7:4) | type (bits 3:0)
//!   [3..5]  = reserved
//!   [5..9]  = parameter list length (big-endian u32)
//!   [9]     = control

use crate::error::{PrError, PrResult};
use crate::scsi::ScsiOpcode;
use crate::types::{
    pack_scope_type, ReservationKey, ReservationScope, ReservationType, TransportId,
    MIN_TRANSPORT_ID_LEN,
};
use byteorder::{BigEndian, ByteOrder};

/// Length of both PR IN and PR OUT CDBs
pub const PR_CDB_LEN: usize = 10;

/// Length of the basic PR OUT parameter list
pub const BASIC_PARAMETER_LIST_LEN: usize = 24;

/// Fixed part of the REGISTER AND MOVE parameter list
pub const MOVE_PARAMETER_HEADER_LEN: usize = 24;

/// Every PR IN response starts with generation + additional length
pub const PR_IN_HEADER_LEN: usize = 8;

/// Flags in byte 20 of the basic parameter list
pub mod out_flags {
    pub const APTPL: u8 = 0x01;
    pub const ALL_TG_PT: u8 = 0x04;
    pub const SPEC_I_PT: u8 = 0x08;
}

/// Flags in byte 17 of the REGISTER AND MOVE parameter list
pub mod move_flags {
    pub const APTPL: u8 = 0x01;
    pub const UNREG: u8 = 0x02;
}

/// PERSISTENT RESERVE IN service actions
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PrInAction {
    ReadKeys = 0x00,
    ReadReservation = 0x01,
    ReportCapabilities = 0x02,
    ReadFullStatus = 0x03,
}

impl PrInAction {
    pub const ALL: [PrInAction; 4] = [
        PrInAction::ReadKeys,
        PrInAction::ReadReservation,
        PrInAction::ReportCapabilities,
        PrInAction::ReadFullStatus,
    ];

    pub fn from_code(code: u8) -> PrResult<Self> {
        match code {
            0x00 => Ok(PrInAction::ReadKeys),
            0x01 => Ok(PrInAction::ReadReservation),
            0x02 => Ok(PrInAction::ReportCapabilities),
            0x03 => Ok(PrInAction::ReadFullStatus),
            _ => Err(PrError::InvalidAction(format!(
                "unknown PERSISTENT RESERVE IN service action 0x{:02x}",
                code
            ))),
        }
    }

    pub fn code(&self) -> u8 {
        *self as u8
    }
}

/// PERSISTENT RESERVE OUT service actions
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PrOutAction {
    Register = 0x00,
    Reserve = 0x01,
    Release = 0x02,
    Clear = 0x03,
    Preempt = 0x04,
    PreemptAndAbort = 0x05,
    RegisterAndIgnoreExisting = 0x06,
    RegisterAndMove = 0x07,
}

impl PrOutAction {
    pub const ALL: [PrOutAction; 8] = [
        PrOutAction::Register,
        PrOutAction::Reserve,
        PrOutAction::Release,
        PrOutAction::Clear,
        PrOutAction::Preempt,
        PrOutAction::PreemptAndAbort,
        PrOutAction::RegisterAndIgnoreExisting,
        PrOutAction::RegisterAndMove,
    ];

    pub fn from_code(code: u8) -> PrResult<Self> {
        match code {
            0x00 => Ok(PrOutAction::Register),
            0x01 => Ok(PrOutAction::Reserve),
            0x02 => Ok(PrOutAction::Release),
            0x03 => Ok(PrOutAction::Clear),
            0x04 => Ok(PrOutAction::Preempt),
            0x05 => Ok(PrOutAction::PreemptAndAbort),
            0x06 => Ok(PrOutAction::RegisterAndIgnoreExisting),
            0x07 => Ok(PrOutAction::RegisterAndMove),
            _ => Err(PrError::InvalidAction(format!(
                "unknown PERSISTENT RESERVE OUT service action 0x{:02x}",
                code
            ))),
        }
    }

    pub fn code(&self) -> u8 {
        *self as u8
    }

    /// Actions whose TYPE field is meaningful
    pub fn needs_type(&self) -> bool {
        matches!(
            self,
            PrOutAction::Reserve
                | PrOutAction::Release
                | PrOutAction::Preempt
                | PrOutAction::PreemptAndAbort
                | PrOutAction::RegisterAndMove
        )
    }

    /// Actions that (re)register a key and may carry APTPL
    pub fn is_register(&self) -> bool {
        matches!(
            self,
            PrOutAction::Register
                | PrOutAction::RegisterAndIgnoreExisting
                | PrOutAction::RegisterAndMove
        )
    }

    /// Actions that must name an existing registration in the key field
    pub fn needs_key(&self) -> bool {
        !matches!(
            self,
            PrOutAction::Register | PrOutAction::RegisterAndIgnoreExisting
        )
    }
}

/// Destination of a REGISTER AND MOVE
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MoveTarget {
    pub transport_id: TransportId,
    pub relative_target_port: u16,
    /// Unregister the issuing I_T nexus once the move completes
    pub unregister: bool,
}

/// Inputs of a PERSISTENT RESERVE OUT command
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct PrOutParams {
    pub key: ReservationKey,
    pub service_action_key: ReservationKey,
    pub scope: ReservationScope,
    pub reservation_type: Option<ReservationType>,
    pub aptpl: bool,
    pub all_target_ports: bool,
    pub move_target: Option<MoveTarget>,
}

/// A CDB and the data-out block that goes with it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodedCommand {
    pub cdb: [u8; PR_CDB_LEN],
    pub data_out: Vec<u8>,
    pub expected_in_len: usize,
}

/// Encode a PERSISTENT RESERVE IN command
pub fn encode_reserve_in(action: PrInAction, allocation_length: u16) -> PrResult<EncodedCommand> {
    if (allocation_length as usize) < PR_IN_HEADER_LEN {
        return Err(PrError::InvalidParameter(format!(
            "allocation length {} is smaller than the {}-byte PR IN header",
            allocation_length, PR_IN_HEADER_LEN
        )));
    }

    let mut cdb = [0u8; PR_CDB_LEN];
    cdb[0] = ScsiOpcode::PersistentReserveIn as u8;
    cdb[1] = action.code() & 0x1F;
    BigEndian::write_u16(&mut cdb[7..9], allocation_length);
    cdb[9] = 0; // Control

    Ok(EncodedCommand {
        cdb,
        data_out: Vec::new(),
        expected_in_len: allocation_length as usize,
    })
}

/// Encode a PERSISTENT RESERVE OUT command and its parameter list
pub fn encode_reserve_out(action: PrOutAction, params: &PrOutParams) -> PrResult<EncodedCommand> {
    validate_out(action, params)?;

    let data_out = match action {
        PrOutAction::RegisterAndMove => encode_move_parameter_list(params)?,
        _ => encode_basic_parameter_list(params),
    };

    let mut cdb = [0u8; PR_CDB_LEN];
    cdb[0] = ScsiOpcode::PersistentReserveOut as u8;
    cdb[1] = action.code() & 0x1F;
    cdb[2] = pack_scope_type(params.scope, params.reservation_type);
    BigEndian::write_u32(&mut cdb[5..9], data_out.len() as u32);
    cdb[9] = 0; // Control

    Ok(EncodedCommand {
        cdb,
        data_out,
        expected_in_len: 0,
    })
}

fn validate_out(action: PrOutAction, params: &PrOutParams) -> PrResult<()> {
    match (action.needs_type(), params.reservation_type) {
        (true, None) => {
            return Err(PrError::InvalidParameter(format!(
                "{:?} requires a reservation type",
                action
            )));
        }
        (false, Some(ty)) => {
            return Err(PrError::InvalidParameter(format!(
                "{:?} does not take a reservation type (got {})",
                action, ty
            )));
        }
        _ => {}
    }

    if action.needs_key() && params.key.is_zero() {
        return Err(PrError::InvalidParameter(format!(
            "{:?} requires the caller's registered reservation key",
            action
        )));
    }

    if params.aptpl && !action.is_register() {
        return Err(PrError::InvalidParameter(format!(
            "APTPL is only valid for register actions, not {:?}",
            action
        )));
    }

    if action == PrOutAction::RegisterAndMove {
        if params.service_action_key.is_zero() {
            return Err(PrError::InvalidParameter(
                "REGISTER AND MOVE requires a non-zero service action key".to_string(),
            ));
        }
        if params.all_target_ports {
            return Err(PrError::InvalidParameter(
                "ALL_TG_PT is not valid for REGISTER AND MOVE".to_string(),
            ));
        }
        match &params.move_target {
            None => {
                return Err(PrError::InvalidParameter(
                    "REGISTER AND MOVE requires a destination TransportID".to_string(),
                ));
            }
            Some(target) => {
                let len = target.transport_id.len();
                if len < MIN_TRANSPORT_ID_LEN || len % 4 != 0 {
                    return Err(PrError::InvalidParameter(format!(
                        "TransportID length {} must be a multiple of 4 and at least {}",
                        len, MIN_TRANSPORT_ID_LEN
                    )));
                }
            }
        }
    } else if params.move_target.is_some() {
        return Err(PrError::InvalidParameter(format!(
            "{:?} does not take a move destination",
            action
        )));
    }

    Ok(())
}

fn encode_basic_parameter_list(params: &PrOutParams) -> Vec<u8> {
    let mut data = vec![0u8; BASIC_PARAMETER_LIST_LEN];
    data[0..8].copy_from_slice(&params.key.to_bytes());
    data[8..16].copy_from_slice(&params.service_action_key.to_bytes());
    // [16..20] obsolete

    let mut flags = 0;
    if params.aptpl {
        flags |= out_flags::APTPL;
    }
    if params.all_target_ports {
        flags |= out_flags::ALL_TG_PT;
    }
    data[20] = flags;
    // [21] reserved, [22..24] obsolete
    data
}

fn encode_move_parameter_list(params: &PrOutParams) -> PrResult<Vec<u8>> {
    let target = params.move_target.as_ref().ok_or_else(|| {
        PrError::InvalidParameter("REGISTER AND MOVE requires a destination".to_string())
    })?;
    let tid = target.transport_id.as_bytes();

    let mut data = vec![0u8; MOVE_PARAMETER_HEADER_LEN];
    data[0..8].copy_from_slice(&params.key.to_bytes());
    data[8..16].copy_from_slice(&params.service_action_key.to_bytes());

    let mut flags = 0;
    if params.aptpl {
        flags |= move_flags::APTPL;
    }
    if target.unregister {
        flags |= move_flags::UNREG;
    }
    data[17] = flags;
    BigEndian::write_u16(&mut data[18..20], target.relative_target_port);
    BigEndian::write_u32(&mut data[20..24], tid.len() as u32);
    data.extend_from_slice(tid);
    Ok(data)
}

/// Decode a PERSISTENT RESERVE IN CDB into (action, allocation length)
pub fn decode_reserve_in_cdb(cdb: &[u8]) -> PrResult<(PrInAction, u16)> {
    if cdb.len() < PR_CDB_LEN {
        return Err(PrError::InvalidParameter(format!(
            "PR IN CDB too short: {} bytes",
            cdb.len()
        )));
    }
    if cdb[0] != ScsiOpcode::PersistentReserveIn as u8 {
        return Err(PrError::InvalidAction(format!(
            "opcode 0x{:02x} is not PERSISTENT RESERVE IN",
            cdb[0]
        )));
    }

    let action = PrInAction::from_code(cdb[1] & 0x1F)?;
    let allocation_length = BigEndian::read_u16(&cdb[7..9]);
    Ok((action, allocation_length))
}

/// Decode a PERSISTENT RESERVE OUT CDB plus parameter list
pub fn decode_reserve_out(cdb: &[u8], data: &[u8]) -> PrResult<(PrOutAction, PrOutParams)> {
    if cdb.len() < PR_CDB_LEN {
        return Err(PrError::InvalidParameter(format!(
            "PR OUT CDB too short: {} bytes",
            cdb.len()
        )));
    }
    if cdb[0] != ScsiOpcode::PersistentReserveOut as u8 {
        return Err(PrError::InvalidAction(format!(
            "opcode 0x{:02x} is not PERSISTENT RESERVE OUT",
            cdb[0]
        )));
    }

    let action = PrOutAction::from_code(cdb[1] & 0x1F)?;

    let scope = ReservationScope::from_code(cdb[2] >> 4).ok_or_else(|| {
        PrError::InvalidParameter(format!("unsupported reservation scope 0x{:x}", cdb[2] >> 4))
    })?;
    let type_code = cdb[2] & 0x0F;
    let reservation_type = if action.needs_type() {
        Some(ReservationType::from_code(type_code).ok_or_else(|| {
            PrError::InvalidParameter(format!("undefined reservation type 0x{:x}", type_code))
        })?)
    } else {
        None
    };

    let list_len = BigEndian::read_u32(&cdb[5..9]) as usize;
    if data.len() < list_len {
        return Err(PrError::TruncatedResponse {
            declared: list_len,
            available: data.len(),
        });
    }
    let data = &data[..list_len];

    let mut params = PrOutParams {
        scope,
        reservation_type,
        ..Default::default()
    };

    if action == PrOutAction::RegisterAndMove {
        if data.len() < MOVE_PARAMETER_HEADER_LEN {
            return Err(PrError::InvalidParameter(format!(
                "REGISTER AND MOVE parameter list too short: {} bytes",
                data.len()
            )));
        }
        params.key = ReservationKey::from_bytes(&data[0..8]);
        params.service_action_key = ReservationKey::from_bytes(&data[8..16]);
        params.aptpl = data[17] & move_flags::APTPL != 0;

        let tid_len = BigEndian::read_u32(&data[20..24]) as usize;
        let tid_end = MOVE_PARAMETER_HEADER_LEN + tid_len;
        if data.len() < tid_end {
            return Err(PrError::TruncatedResponse {
                declared: tid_end,
                available: data.len(),
            });
        }
        params.move_target = Some(MoveTarget {
            transport_id: TransportId::from_bytes(&data[MOVE_PARAMETER_HEADER_LEN..tid_end])?,
            relative_target_port: BigEndian::read_u16(&data[18..20]),
            unregister: data[17] & move_flags::UNREG != 0,
        });
    } else {
        if data.len() != BASIC_PARAMETER_LIST_LEN {
            return Err(PrError::InvalidParameter(format!(
                "parameter list length {} (expected {})",
                data.len(),
                BASIC_PARAMETER_LIST_LEN
            )));
        }
        params.key = ReservationKey::from_bytes(&data[0..8]);
        params.service_action_key = ReservationKey::from_bytes(&data[8..16]);
        params.aptpl = data[20] & out_flags::APTPL != 0;
        params.all_target_ports = data[20] & out_flags::ALL_TG_PT != 0;
        if data[20] & out_flags::SPEC_I_PT != 0 {
            return Err(PrError::InvalidParameter(
                "SPEC_I_PT is not supported".to_string(),
            ));
        }
    }

    Ok((action, params))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(v: u64) -> ReservationKey {
        ReservationKey::new(v)
    }

    fn valid_params(action: PrOutAction, ty: ReservationType) -> PrOutParams {
        let mut params = PrOutParams {
            key: key(0x1111_1111_1111_1111),
            service_action_key: key(0x2222_2222_2222_2222),
            ..Default::default()
        };
        if action.needs_type() {
            params.reservation_type = Some(ty);
        }
        if action == PrOutAction::Register || action == PrOutAction::RegisterAndIgnoreExisting {
            params.key = ReservationKey::ZERO;
        }
        if action == PrOutAction::RegisterAndMove {
            params.move_target = Some(MoveTarget {
                transport_id: TransportId::iscsi("iqn.2025-12.local:node2"),
                relative_target_port: 1,
                unregister: true,
            });
        }
        params
    }

    #[test]
    fn test_encode_read_keys_cdb() {
        let cmd = encode_reserve_in(PrInAction::ReadKeys, 8192).unwrap();
        assert_eq!(cmd.cdb, [0x5E, 0x00, 0, 0, 0, 0, 0, 0x20, 0x00, 0]);
        assert!(cmd.data_out.is_empty());
        assert_eq!(cmd.expected_in_len, 8192);
    }

    #[test]
    fn test_encode_read_full_status_cdb() {
        let cmd = encode_reserve_in(PrInAction::ReadFullStatus, 0x1234).unwrap();
        assert_eq!(cmd.cdb[1], 0x03);
        assert_eq!(&cmd.cdb[7..9], &[0x12, 0x34]);
    }

    #[test]
    fn test_allocation_length_below_header() {
        let err = encode_reserve_in(PrInAction::ReadKeys, 4).unwrap_err();
        assert!(matches!(err, PrError::InvalidParameter(_)));
    }

    #[test]
    fn test_unknown_action_codes() {
        assert!(matches!(PrInAction::from_code(0x04), Err(PrError::InvalidAction(_))));
        assert!(matches!(PrOutAction::from_code(0x08), Err(PrError::InvalidAction(_))));
        assert!(matches!(PrOutAction::from_code(0x1F), Err(PrError::InvalidAction(_))));
    }

    #[test]
    fn test_encode_reserve_cdb_and_parameter_list() {
        let params = PrOutParams {
            key: key(0x1111_1111_1111_1111),
            reservation_type: Some(ReservationType::ExclusiveAccess),
            ..Default::default()
        };
        let cmd = encode_reserve_out(PrOutAction::Reserve, &params).unwrap();
        assert_eq!(cmd.cdb, [0x5F, 0x01, 0x03, 0, 0, 0, 0, 0, 24, 0]);
        assert_eq!(cmd.data_out.len(), BASIC_PARAMETER_LIST_LEN);
        assert_eq!(&cmd.data_out[0..8], &[0x11; 8]);
        assert_eq!(&cmd.data_out[8..16], &[0u8; 8]);
        assert_eq!(cmd.expected_in_len, 0);
    }

    #[test]
    fn test_encode_register_with_aptpl() {
        let params = PrOutParams {
            service_action_key: key(0xABCD),
            aptpl: true,
            all_target_ports: true,
            ..Default::default()
        };
        let cmd = encode_reserve_out(PrOutAction::Register, &params).unwrap();
        assert_eq!(cmd.cdb[2], 0x00);
        assert_eq!(cmd.data_out[20], out_flags::APTPL | out_flags::ALL_TG_PT);
        assert_eq!(ReservationKey::from_bytes(&cmd.data_out[8..16]), key(0xABCD));
    }

    #[test]
    fn test_missing_type_rejected() {
        let params = PrOutParams {
            key: key(1),
            ..Default::default()
        };
        for action in [PrOutAction::Reserve, PrOutAction::Release, PrOutAction::Preempt] {
            let err = encode_reserve_out(action, &params).unwrap_err();
            assert!(matches!(err, PrError::InvalidParameter(_)), "{:?}", action);
        }
    }

    #[test]
    fn test_type_on_register_rejected() {
        let params = PrOutParams {
            service_action_key: key(1),
            reservation_type: Some(ReservationType::WriteExclusive),
            ..Default::default()
        };
        let err = encode_reserve_out(PrOutAction::Register, &params).unwrap_err();
        assert!(matches!(err, PrError::InvalidParameter(_)));
    }

    #[test]
    fn test_zero_key_rejected_for_reserve() {
        let params = PrOutParams {
            reservation_type: Some(ReservationType::WriteExclusive),
            ..Default::default()
        };
        let err = encode_reserve_out(PrOutAction::Reserve, &params).unwrap_err();
        assert!(matches!(err, PrError::InvalidParameter(_)));
    }

    #[test]
    fn test_aptpl_on_reserve_rejected() {
        let params = PrOutParams {
            key: key(1),
            reservation_type: Some(ReservationType::WriteExclusive),
            aptpl: true,
            ..Default::default()
        };
        let err = encode_reserve_out(PrOutAction::Reserve, &params).unwrap_err();
        assert!(matches!(err, PrError::InvalidParameter(_)));
    }

    #[test]
    fn test_register_and_move_requires_destination() {
        let mut params = valid_params(PrOutAction::RegisterAndMove, ReservationType::WriteExclusive);
        params.move_target = None;
        assert!(encode_reserve_out(PrOutAction::RegisterAndMove, &params).is_err());

        let mut params = valid_params(PrOutAction::RegisterAndMove, ReservationType::WriteExclusive);
        params.move_target.as_mut().unwrap().transport_id =
            TransportId::from_bytes(&[0x05, 0, 0, 2, b'a', 0]).unwrap();
        assert!(encode_reserve_out(PrOutAction::RegisterAndMove, &params).is_err());
    }

    #[test]
    fn test_register_and_move_layout() {
        let params = valid_params(PrOutAction::RegisterAndMove, ReservationType::WriteExclusive);
        let cmd = encode_reserve_out(PrOutAction::RegisterAndMove, &params).unwrap();
        let tid_len = params.move_target.as_ref().unwrap().transport_id.len();
        assert_eq!(cmd.data_out.len(), MOVE_PARAMETER_HEADER_LEN + tid_len);
        assert_eq!(cmd.data_out[17], move_flags::UNREG);
        assert_eq!(BigEndian::read_u16(&cmd.data_out[18..20]), 1);
        assert_eq!(BigEndian::read_u32(&cmd.data_out[20..24]) as usize, tid_len);
        assert_eq!(BigEndian::read_u32(&cmd.cdb[5..9]) as usize, cmd.data_out.len());
    }

    #[test]
    fn test_round_trip_all_valid_combinations() {
        for (action, ty) in PrOutAction::ALL
            .iter()
            .flat_map(|a| ReservationType::ALL.iter().map(move |t| (*a, *t)))
        {
            let params = valid_params(action, ty);
            let cmd = encode_reserve_out(action, &params).unwrap();
            let (decoded_action, decoded) = decode_reserve_out(&cmd.cdb, &cmd.data_out).unwrap();
            assert_eq!(decoded_action, action);
            assert_eq!(decoded, params, "{:?}/{:?}", action, ty);
        }

        for action in PrInAction::ALL {
            let cmd = encode_reserve_in(action, 512).unwrap();
            assert_eq!(decode_reserve_in_cdb(&cmd.cdb).unwrap(), (action, 512));
        }
    }

    #[test]
    fn test_decode_rejects_wrong_opcode() {
        let cdb = [0x28, 0, 0, 0, 0, 0, 0, 0, 0, 0];
        assert!(matches!(decode_reserve_in_cdb(&cdb), Err(PrError::InvalidAction(_))));
        assert!(matches!(decode_reserve_out(&cdb, &[]), Err(PrError::InvalidAction(_))));
    }

    #[test]
    fn test_decode_rejects_undefined_type() {
        let mut cdb = [0x5F, 0x01, 0x02, 0, 0, 0, 0, 0, 24, 0];
        let data = [0u8; 24];
        assert!(decode_reserve_out(&cdb, &data).is_err());
        cdb[2] = 0x21; // element scope
        assert!(decode_reserve_out(&cdb, &data).is_err());
    }
}
