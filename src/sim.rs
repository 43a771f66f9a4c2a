//! In-memory logical unit with persistent reservation support
//!
//! [`SimulatedLun`] answers PERSISTENT RESERVE IN/OUT the way a target
//! would, tracking one registration per initiator port. Each
//! [`SimulatedPort`] is one I_T nexus onto the shared LU and implements
//! [`ScsiTransport`], so several handles can contend for the same
//! reservation inside one process.
//!
//! Deviations from a full target: PREEMPT leaves the preempted key
//! registered and only moves the reservation, and the generation counter
//! advances on every PR OUT that completes with GOOD status.

use crate::cdb::{
    decode_reserve_in_cdb, decode_reserve_out, PrInAction, PrOutAction, PrOutParams,
    BASIC_PARAMETER_LIST_LEN,
};
use crate::error::PrResult;
use crate::response::{
    encode_full_status, encode_read_keys, encode_read_reservation, encode_report_capabilities,
    Capabilities, StatusDescriptor,
};
use crate::scsi::{ScsiOpcode, ScsiResponse, SenseData};
use crate::state::Reservation;
use crate::transport::ScsiTransport;
use crate::types::{Generation, ReservationKey, ReservationScope, ReservationType, TransportId};
use byteorder::{BigEndian, ByteOrder};
use std::collections::{BTreeMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};

#[derive(Debug, Clone)]
struct PortRegistration {
    key: ReservationKey,
    relative_target_port: u16,
    all_target_ports: bool,
}

#[derive(Debug, Clone)]
struct HeldReservation {
    holder: TransportId,
    reservation_type: ReservationType,
    scope: ReservationScope,
}

#[derive(Debug, Default)]
struct LunState {
    generation: u32,
    registrations: BTreeMap<TransportId, PortRegistration>,
    reservation: Option<HeldReservation>,
    aptpl: bool,
    injected: VecDeque<ScsiResponse>,
    commands: u64,
}

/// Shared simulated logical unit
#[derive(Debug, Clone, Default)]
pub struct SimulatedLun {
    inner: Arc<Mutex<LunState>>,
}

impl SimulatedLun {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open an I_T nexus for `port` through relative target port 1
    pub fn connect(&self, port: TransportId) -> SimulatedPort {
        self.connect_via(port, 1)
    }

    /// Open an I_T nexus for `port` through a specific relative target port
    pub fn connect_via(&self, port: TransportId, relative_target_port: u16) -> SimulatedPort {
        SimulatedPort {
            lun: self.clone(),
            port,
            relative_target_port,
        }
    }

    pub fn generation(&self) -> Generation {
        Generation(self.state().generation)
    }

    /// Number of commands that reached the LU, injected responses included
    pub fn command_count(&self) -> u64 {
        self.state().commands
    }

    /// Registered keys, in port order
    pub fn registered_keys(&self) -> Vec<ReservationKey> {
        self.state().registrations.values().map(|r| r.key).collect()
    }

    /// Port that established the current reservation
    pub fn holder_port(&self) -> Option<TransportId> {
        self.state().reservation.as_ref().map(|r| r.holder.clone())
    }

    pub fn reservation_type(&self) -> Option<ReservationType> {
        self.state().reservation.as_ref().map(|r| r.reservation_type)
    }

    pub fn aptpl(&self) -> bool {
        self.state().aptpl
    }

    /// Register `key` for `port` directly, as if another host had done it
    pub fn seed_registration(&self, port: TransportId, key: ReservationKey) {
        let mut state = self.state();
        state.registrations.insert(
            port,
            PortRegistration {
                key,
                relative_target_port: 1,
                all_target_ports: false,
            },
        );
        state.generation = state.generation.wrapping_add(1);
    }

    /// Answer the next command with `response` instead of processing it
    pub fn inject_response(&self, response: ScsiResponse) {
        self.state().injected.push_back(response);
    }

    /// Answer the next command with a bare status byte
    pub fn inject_status(&self, status: u8) {
        self.inject_response(ScsiResponse::with_status(status));
    }

    fn state(&self) -> MutexGuard<'_, LunState> {
        // Poisoned only if another port panicked mid-command; the state is still whole
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// One initiator port connected to a [`SimulatedLun`]
#[derive(Debug, Clone)]
pub struct SimulatedPort {
    lun: SimulatedLun,
    port: TransportId,
    relative_target_port: u16,
}

impl SimulatedPort {
    pub fn port(&self) -> &TransportId {
        &self.port
    }

    pub fn lun(&self) -> &SimulatedLun {
        &self.lun
    }
}

impl ScsiTransport for SimulatedPort {
    fn execute(
        &mut self,
        cdb: &[u8],
        data_out: &[u8],
        expected_in_len: usize,
    ) -> PrResult<ScsiResponse> {
        let mut state = self.lun.state();
        state.commands += 1;

        if let Some(mut injected) = state.injected.pop_front() {
            log::debug!("Simulated LU: injected status 0x{:02x}", injected.status);
            injected.data.truncate(expected_in_len);
            return Ok(injected);
        }

        let nexus = Nexus {
            port: &self.port,
            relative_target_port: self.relative_target_port,
        };
        let mut response = state.handle_command(&nexus, cdb, data_out)?;
        response.data.truncate(expected_in_len);
        Ok(response)
    }
}

struct Nexus<'a> {
    port: &'a TransportId,
    relative_target_port: u16,
}

impl LunState {
    fn handle_command(
        &mut self,
        nexus: &Nexus<'_>,
        cdb: &[u8],
        data_out: &[u8],
    ) -> PrResult<ScsiResponse> {
        if cdb.is_empty() {
            return Ok(ScsiResponse::check_condition(SenseData::invalid_command()));
        }

        match ScsiOpcode::from_u8(cdb[0]) {
            Some(ScsiOpcode::PersistentReserveIn) => Ok(self.handle_reserve_in(cdb)),
            Some(ScsiOpcode::PersistentReserveOut) => Ok(self.handle_reserve_out(nexus, cdb, data_out)),
            None => Ok(ScsiResponse::check_condition(SenseData::invalid_command())),
        }
    }

    /// Handle PERSISTENT RESERVE IN (0x5E)
    fn handle_reserve_in(&self, cdb: &[u8]) -> ScsiResponse {
        let (action, allocation_length) = match decode_reserve_in_cdb(cdb) {
            Ok(decoded) => decoded,
            Err(_) => return ScsiResponse::check_condition(SenseData::invalid_field_in_cdb()),
        };
        let generation = Generation(self.generation);

        let mut data = match action {
            PrInAction::ReadKeys => {
                let keys: Vec<_> = self.registrations.values().map(|r| r.key).collect();
                encode_read_keys(generation, &keys)
            }
            PrInAction::ReadReservation => {
                let reservation = self.reported_reservation();
                encode_read_reservation(generation, reservation.as_ref())
            }
            PrInAction::ReportCapabilities => encode_report_capabilities(&Capabilities {
                all_target_ports: true,
                persist_through_power_loss: true,
                type_mask_valid: true,
                persist_through_power_loss_active: self.aptpl,
                supported_types: ReservationType::ALL.to_vec(),
                ..Default::default()
            }),
            PrInAction::ReadFullStatus => {
                let descriptors: Vec<_> = self
                    .registrations
                    .iter()
                    .map(|(port, reg)| {
                        let holder = self.is_holder(port);
                        StatusDescriptor {
                            key: reg.key,
                            holder,
                            all_target_ports: reg.all_target_ports,
                            reservation_type: self
                                .reservation
                                .as_ref()
                                .filter(|_| holder)
                                .map(|r| r.reservation_type),
                            relative_target_port: reg.relative_target_port,
                            transport_id: Some(port.clone()),
                        }
                    })
                    .collect();
                encode_full_status(generation, &descriptors)
            }
        };

        data.truncate(allocation_length as usize);
        ScsiResponse::good(data)
    }

    /// Handle PERSISTENT RESERVE OUT (0x5F)
    fn handle_reserve_out(&mut self, nexus: &Nexus<'_>, cdb: &[u8], data_out: &[u8]) -> ScsiResponse {
        if cdb.len() < 10 {
            return ScsiResponse::check_condition(SenseData::invalid_command());
        }
        let action = match PrOutAction::from_code(cdb[1] & 0x1F) {
            Ok(action) => action,
            Err(_) => return ScsiResponse::check_condition(SenseData::invalid_field_in_cdb()),
        };
        if cdb[2] >> 4 != ReservationScope::LogicalUnit.code() {
            return ScsiResponse::check_condition(SenseData::invalid_field_in_cdb());
        }
        if action.needs_type() && ReservationType::from_code(cdb[2] & 0x0F).is_none() {
            return ScsiResponse::check_condition(SenseData::invalid_field_in_cdb());
        }

        let list_len = BigEndian::read_u32(&cdb[5..9]) as usize;
        if action != PrOutAction::RegisterAndMove && list_len != BASIC_PARAMETER_LIST_LEN {
            return ScsiResponse::check_condition(SenseData::parameter_list_length_error());
        }
        if data_out.len() < list_len {
            return ScsiResponse::check_condition(SenseData::parameter_list_length_error());
        }

        let params = match decode_reserve_out(cdb, data_out) {
            Ok((_, params)) => params,
            Err(e) => {
                log::debug!("Simulated LU: rejecting PR OUT {:?}: {}", action, e);
                return ScsiResponse::check_condition(SenseData::invalid_field_in_parameter_list());
            }
        };

        let result = match action {
            PrOutAction::Register => self.register(nexus, &params, false),
            PrOutAction::RegisterAndIgnoreExisting => self.register(nexus, &params, true),
            PrOutAction::Reserve => self.reserve(nexus, &params),
            PrOutAction::Release => self.release(nexus, &params),
            PrOutAction::Clear => self.clear(nexus, &params),
            PrOutAction::Preempt | PrOutAction::PreemptAndAbort => self.preempt(nexus, &params),
            PrOutAction::RegisterAndMove => self.register_and_move(nexus, &params),
        };

        match result {
            Ok(changed) => {
                if changed {
                    self.generation = self.generation.wrapping_add(1);
                }
                log::trace!(
                    "Simulated LU: {:?} from {} ok, generation {}",
                    action,
                    nexus.port,
                    self.generation
                );
                ScsiResponse::good_no_data()
            }
            Err(response) => response,
        }
    }

    fn reported_reservation(&self) -> Option<Reservation> {
        let held = self.reservation.as_ref()?;
        let holder_key = self
            .registrations
            .get(&held.holder)
            .map_or(ReservationKey::ZERO, |r| r.key);
        let mut reservation = Reservation::new(holder_key, held.reservation_type);
        reservation.scope = held.scope;
        Some(reservation)
    }

    fn is_holder(&self, port: &TransportId) -> bool {
        match &self.reservation {
            Some(resv) if resv.reservation_type.is_all_registrants() => {
                self.registrations.contains_key(port)
            }
            Some(resv) => resv.holder == *port,
            None => false,
        }
    }

    /// Registered nexus whose reservation key matches, or RESERVATION CONFLICT
    fn check_key(&self, nexus: &Nexus<'_>, key: ReservationKey) -> Result<(), ScsiResponse> {
        match self.registrations.get(nexus.port) {
            Some(reg) if reg.key == key => Ok(()),
            _ => Err(ScsiResponse::reservation_conflict()),
        }
    }

    fn drop_registration(&mut self, port: &TransportId) {
        self.registrations.remove(port);
        let keep = match &self.reservation {
            Some(resv) if resv.reservation_type.is_all_registrants() => {
                !self.registrations.is_empty()
            }
            Some(resv) => resv.holder != *port,
            None => true,
        };
        if !keep {
            self.reservation = None;
        } else if let Some(resv) = self.reservation.as_mut() {
            // All-registrants reservations outlive the port that created them
            if resv.holder == *port {
                if let Some(next) = self.registrations.keys().next() {
                    resv.holder = next.clone();
                }
            }
        }
    }

    fn register(
        &mut self,
        nexus: &Nexus<'_>,
        params: &PrOutParams,
        ignore_existing: bool,
    ) -> Result<bool, ScsiResponse> {
        let existing = self.registrations.get(nexus.port).map(|r| r.key);
        match existing {
            None if !ignore_existing && !params.key.is_zero() => {
                return Err(ScsiResponse::reservation_conflict())
            }
            Some(key) if !ignore_existing && key != params.key => {
                return Err(ScsiResponse::reservation_conflict())
            }
            _ => {}
        }

        if params.service_action_key.is_zero() {
            if existing.is_none() {
                return Ok(false);
            }
            self.drop_registration(nexus.port);
        } else {
            self.registrations.insert(
                nexus.port.clone(),
                PortRegistration {
                    key: params.service_action_key,
                    relative_target_port: nexus.relative_target_port,
                    all_target_ports: params.all_target_ports,
                },
            );
        }
        self.aptpl = params.aptpl;
        Ok(true)
    }

    fn reserve(&mut self, nexus: &Nexus<'_>, params: &PrOutParams) -> Result<bool, ScsiResponse> {
        self.check_key(nexus, params.key)?;
        let reservation_type = params
            .reservation_type
            .ok_or_else(|| ScsiResponse::check_condition(SenseData::invalid_field_in_cdb()))?;

        if let Some(resv) = &self.reservation {
            // Re-reserving with the same type is a no-op; anything else conflicts
            if self.is_holder(nexus.port) && resv.reservation_type == reservation_type {
                return Ok(false);
            }
            return Err(ScsiResponse::reservation_conflict());
        }

        self.reservation = Some(HeldReservation {
            holder: nexus.port.clone(),
            reservation_type,
            scope: params.scope,
        });
        Ok(true)
    }

    fn release(&mut self, nexus: &Nexus<'_>, params: &PrOutParams) -> Result<bool, ScsiResponse> {
        self.check_key(nexus, params.key)?;

        let resv = match &self.reservation {
            Some(resv) if self.is_holder(nexus.port) => resv,
            // Releasing someone else's reservation, or none at all, is a no-op
            _ => return Ok(false),
        };
        if Some(resv.reservation_type) != params.reservation_type {
            return Err(ScsiResponse::check_condition(SenseData::invalid_release()));
        }

        self.reservation = None;
        Ok(true)
    }

    fn clear(&mut self, nexus: &Nexus<'_>, params: &PrOutParams) -> Result<bool, ScsiResponse> {
        self.check_key(nexus, params.key)?;
        self.registrations.clear();
        self.reservation = None;
        Ok(true)
    }

    fn preempt(&mut self, nexus: &Nexus<'_>, params: &PrOutParams) -> Result<bool, ScsiResponse> {
        self.check_key(nexus, params.key)?;
        let reservation_type = params
            .reservation_type
            .ok_or_else(|| ScsiResponse::check_condition(SenseData::invalid_field_in_cdb()))?;

        if params.service_action_key.is_zero() {
            let all_registrants = self
                .reservation
                .as_ref()
                .map_or(false, |r| r.reservation_type.is_all_registrants());
            if !all_registrants {
                return Err(ScsiResponse::check_condition(
                    SenseData::invalid_field_in_parameter_list(),
                ));
            }
        } else if !self
            .registrations
            .values()
            .any(|r| r.key == params.service_action_key)
        {
            return Err(ScsiResponse::reservation_conflict());
        }

        self.reservation = Some(HeldReservation {
            holder: nexus.port.clone(),
            reservation_type,
            scope: params.scope,
        });
        Ok(true)
    }

    fn register_and_move(
        &mut self,
        nexus: &Nexus<'_>,
        params: &PrOutParams,
    ) -> Result<bool, ScsiResponse> {
        self.check_key(nexus, params.key)?;
        let target = params.move_target.as_ref().ok_or_else(|| {
            ScsiResponse::check_condition(SenseData::invalid_field_in_parameter_list())
        })?;

        let reservation_type = match &self.reservation {
            Some(resv) if resv.reservation_type.is_all_registrants() => {
                return Err(ScsiResponse::check_condition(SenseData::invalid_field_in_cdb()))
            }
            Some(resv) if resv.holder == *nexus.port => resv.reservation_type,
            _ => return Err(ScsiResponse::reservation_conflict()),
        };
        if params.service_action_key.is_zero() || target.transport_id == *nexus.port {
            return Err(ScsiResponse::check_condition(
                SenseData::invalid_field_in_parameter_list(),
            ));
        }

        self.registrations.insert(
            target.transport_id.clone(),
            PortRegistration {
                key: params.service_action_key,
                relative_target_port: target.relative_target_port,
                all_target_ports: false,
            },
        );
        self.reservation = Some(HeldReservation {
            holder: target.transport_id.clone(),
            reservation_type,
            scope: ReservationScope::LogicalUnit,
        });
        if target.unregister {
            self.registrations.remove(nexus.port);
        }
        self.aptpl = params.aptpl;
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cdb::{encode_reserve_in, encode_reserve_out};
    use crate::response::{decode_full_status, decode_read_keys, decode_read_reservation};
    use crate::scsi::scsi_status;

    fn port(name: &str) -> TransportId {
        TransportId::iscsi(&format!("iqn.2025-12.local:{}", name))
    }

    fn out(p: &mut SimulatedPort, action: PrOutAction, params: PrOutParams) -> u8 {
        let cmd = encode_reserve_out(action, &params).unwrap();
        p.execute(&cmd.cdb, &cmd.data_out, 0).unwrap().status
    }

    fn inq(p: &mut SimulatedPort, action: PrInAction) -> Vec<u8> {
        let cmd = encode_reserve_in(action, 4096).unwrap();
        let resp = p.execute(&cmd.cdb, &[], cmd.expected_in_len).unwrap();
        assert_eq!(resp.status, scsi_status::GOOD);
        resp.data
    }

    fn register(p: &mut SimulatedPort, key: u64) -> u8 {
        out(
            p,
            PrOutAction::Register,
            PrOutParams {
                service_action_key: ReservationKey::new(key),
                ..Default::default()
            },
        )
    }

    #[test]
    fn test_register_and_read_keys() {
        let lun = SimulatedLun::new();
        let mut a = lun.connect(port("a"));
        assert_eq!(register(&mut a, 0xAAAA), scsi_status::GOOD);

        let keys = decode_read_keys(&inq(&mut a, PrInAction::ReadKeys)).unwrap();
        assert_eq!(keys.generation, Generation(1));
        assert!(keys.registrations.contains(ReservationKey::new(0xAAAA)));
    }

    #[test]
    fn test_register_twice_conflicts() {
        let lun = SimulatedLun::new();
        let mut a = lun.connect(port("a"));
        register(&mut a, 0xAAAA);
        assert_eq!(register(&mut a, 0xBBBB), scsi_status::RESERVATION_CONFLICT);
        assert_eq!(lun.generation(), Generation(1));
    }

    #[test]
    fn test_reserve_requires_registration() {
        let lun = SimulatedLun::new();
        let mut a = lun.connect(port("a"));
        let status = out(
            &mut a,
            PrOutAction::Reserve,
            PrOutParams {
                key: ReservationKey::new(0x1),
                reservation_type: Some(ReservationType::WriteExclusive),
                ..Default::default()
            },
        );
        assert_eq!(status, scsi_status::RESERVATION_CONFLICT);
    }

    #[test]
    fn test_release_type_mismatch() {
        let lun = SimulatedLun::new();
        let mut a = lun.connect(port("a"));
        register(&mut a, 0xA);
        out(
            &mut a,
            PrOutAction::Reserve,
            PrOutParams {
                key: ReservationKey::new(0xA),
                reservation_type: Some(ReservationType::WriteExclusive),
                ..Default::default()
            },
        );
        let status = out(
            &mut a,
            PrOutAction::Release,
            PrOutParams {
                key: ReservationKey::new(0xA),
                reservation_type: Some(ReservationType::ExclusiveAccess),
                ..Default::default()
            },
        );
        assert_eq!(status, scsi_status::CHECK_CONDITION);
        assert!(lun.holder_port().is_some());
    }

    #[test]
    fn test_preempt_keeps_victim_registered() {
        let lun = SimulatedLun::new();
        let mut a = lun.connect(port("a"));
        let mut b = lun.connect(port("b"));
        register(&mut a, 0xA);
        register(&mut b, 0xB);
        out(
            &mut a,
            PrOutAction::Reserve,
            PrOutParams {
                key: ReservationKey::new(0xA),
                reservation_type: Some(ReservationType::ExclusiveAccess),
                ..Default::default()
            },
        );
        let status = out(
            &mut b,
            PrOutAction::Preempt,
            PrOutParams {
                key: ReservationKey::new(0xB),
                service_action_key: ReservationKey::new(0xA),
                reservation_type: Some(ReservationType::WriteExclusive),
                ..Default::default()
            },
        );
        assert_eq!(status, scsi_status::GOOD);

        let resv = decode_read_reservation(&inq(&mut a, PrInAction::ReadReservation)).unwrap();
        let resv = resv.reservation.unwrap();
        assert_eq!(resv.holder, ReservationKey::new(0xB));
        assert_eq!(resv.reservation_type, ReservationType::WriteExclusive);
        assert_eq!(lun.registered_keys().len(), 2);
    }

    #[test]
    fn test_full_status_reports_ports() {
        let lun = SimulatedLun::new();
        let mut a = lun.connect_via(port("a"), 3);
        register(&mut a, 0xA);
        let status = decode_full_status(&inq(&mut a, PrInAction::ReadFullStatus)).unwrap();
        let reg = status.registrations.get(ReservationKey::new(0xA)).unwrap();
        assert_eq!(reg.port, Some(port("a")));
        assert_eq!(reg.relative_target_port, 3);
        assert!(status.reservation.is_none());
    }

    #[test]
    fn test_data_in_truncated_to_allocation_length() {
        let lun = SimulatedLun::new();
        for i in 0..10u64 {
            lun.seed_registration(port(&format!("host{}", i)), ReservationKey::new(i + 1));
        }
        let mut a = lun.connect(port("a"));
        let cmd = encode_reserve_in(PrInAction::ReadKeys, 16).unwrap();
        let resp = a.execute(&cmd.cdb, &[], cmd.expected_in_len).unwrap();
        assert_eq!(resp.data.len(), 16);
        assert_eq!(BigEndian::read_u32(&resp.data[4..8]), 80);
    }

    #[test]
    fn test_bad_parameter_list_length() {
        let lun = SimulatedLun::new();
        let mut a = lun.connect(port("a"));
        let mut cmd = encode_reserve_out(
            PrOutAction::Register,
            &PrOutParams {
                service_action_key: ReservationKey::new(1),
                ..Default::default()
            },
        )
        .unwrap();
        BigEndian::write_u32(&mut cmd.cdb[5..9], 20);
        let resp = a.execute(&cmd.cdb, &cmd.data_out, 0).unwrap();
        assert_eq!(resp.status, scsi_status::CHECK_CONDITION);
        let sense = resp.sense.unwrap();
        assert_eq!(sense.asc, crate::scsi::asc::PARAMETER_LIST_LENGTH_ERROR);
    }

    #[test]
    fn test_undefined_type_is_invalid_field_in_cdb() {
        let lun = SimulatedLun::new();
        let mut a = lun.connect(port("a"));
        register(&mut a, 0xA);
        let mut cmd = encode_reserve_out(
            PrOutAction::Reserve,
            &PrOutParams {
                key: ReservationKey::new(0xA),
                reservation_type: Some(ReservationType::WriteExclusive),
                ..Default::default()
            },
        )
        .unwrap();
        // Type 2 is obsolete and undefined
        cmd.cdb[2] = 0x02;
        let resp = a.execute(&cmd.cdb, &cmd.data_out, 0).unwrap();
        assert_eq!(resp.status, scsi_status::CHECK_CONDITION);
        assert_eq!(resp.sense.unwrap(), SenseData::invalid_field_in_cdb());
        assert!(lun.holder_port().is_none());
    }

    #[test]
    fn test_zero_victim_preempts_all_registrants() {
        let lun = SimulatedLun::new();
        let mut a = lun.connect(port("a"));
        let mut b = lun.connect(port("b"));
        register(&mut a, 0xA);
        register(&mut b, 0xB);
        out(
            &mut a,
            PrOutAction::Reserve,
            PrOutParams {
                key: ReservationKey::new(0xA),
                reservation_type: Some(ReservationType::WriteExclusiveAllRegistrants),
                ..Default::default()
            },
        );
        let status = out(
            &mut b,
            PrOutAction::Preempt,
            PrOutParams {
                key: ReservationKey::new(0xB),
                reservation_type: Some(ReservationType::ExclusiveAccess),
                ..Default::default()
            },
        );
        assert_eq!(status, scsi_status::GOOD);
        assert_eq!(lun.holder_port(), Some(port("b")));
        assert_eq!(lun.reservation_type(), Some(ReservationType::ExclusiveAccess));
    }

    #[test]
    fn test_injected_status() {
        let lun = SimulatedLun::new();
        let mut a = lun.connect(port("a"));
        lun.inject_status(scsi_status::BUSY);
        assert_eq!(register(&mut a, 0xA), scsi_status::BUSY);
        assert_eq!(register(&mut a, 0xA), scsi_status::GOOD);
        assert_eq!(lun.command_count(), 2);
    }
}
