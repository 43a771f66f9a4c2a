//! Persistent reservation command orchestration
//!
//! A [`PrHandle`] drives one logical unit through one transport on behalf
//! of one initiator port. It validates every request against an explicit
//! phase transition table before anything reaches the device, issues the
//! PR command, and folds the outcome into its [`ReservationCache`].
//!
//! Handles are not internally synchronized. Each call blocks on the
//! transport and must finish before the next call on the same handle;
//! independent handles may run on separate threads.

use crate::cdb::{
    encode_reserve_in, encode_reserve_out, MoveTarget, PrInAction, PrOutAction, PrOutParams,
    PR_IN_HEADER_LEN,
};
use crate::error::{PrError, PrResult};
use crate::response::{
    decode_full_status, decode_read_keys, decode_read_reservation, decode_report_capabilities,
    Capabilities, FullStatus, ReadKeys, ReadReservation,
};
use crate::state::{Registrant, Reservation, ReservationCache, ReservationSnapshot};
use crate::transport::{check_status, ScsiTransport};
use crate::types::{Generation, ReservationKey, ReservationScope, ReservationType, TransportId};

/// Default PR IN allocation length
pub const DEFAULT_ALLOCATION_LENGTH: u16 = 8192;

/// Where this initiator stands with respect to the logical unit
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Unregistered,
    Registered {
        key: ReservationKey,
    },
    Reserved {
        key: ReservationKey,
        reservation_type: ReservationType,
    },
    /// Still registered, but another initiator took our reservation
    Preempted {
        key: ReservationKey,
    },
}

impl Phase {
    pub fn kind(&self) -> PhaseKind {
        match self {
            Phase::Unregistered => PhaseKind::Unregistered,
            Phase::Registered { .. } => PhaseKind::Registered,
            Phase::Reserved { .. } => PhaseKind::Reserved,
            Phase::Preempted { .. } => PhaseKind::Preempted,
        }
    }

    pub fn key(&self) -> Option<ReservationKey> {
        match self {
            Phase::Unregistered => None,
            Phase::Registered { key } | Phase::Reserved { key, .. } | Phase::Preempted { key } => {
                Some(*key)
            }
        }
    }
}

/// Phase without its data, as used by the transition table
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PhaseKind {
    Unregistered,
    Registered,
    Reserved,
    Preempted,
}

/// Operations a handle can be asked to perform
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    Register,
    RegisterIgnoreExisting,
    Reserve,
    Release,
    Preempt,
    Clear,
    Unregister,
    Move,
}

use Operation as Op;
use PhaseKind as K;

/// Every allowed (from, operation, to) transition
pub const TRANSITIONS: &[(PhaseKind, Operation, PhaseKind)] = &[
    (K::Unregistered, Op::Register, K::Registered),
    (K::Unregistered, Op::RegisterIgnoreExisting, K::Registered),
    (K::Unregistered, Op::Unregister, K::Unregistered),
    (K::Registered, Op::RegisterIgnoreExisting, K::Registered),
    (K::Registered, Op::Reserve, K::Reserved),
    (K::Registered, Op::Preempt, K::Reserved),
    (K::Registered, Op::Clear, K::Unregistered),
    (K::Registered, Op::Unregister, K::Unregistered),
    (K::Reserved, Op::RegisterIgnoreExisting, K::Reserved),
    (K::Reserved, Op::Reserve, K::Reserved),
    (K::Reserved, Op::Release, K::Registered),
    (K::Reserved, Op::Preempt, K::Reserved),
    (K::Reserved, Op::Clear, K::Unregistered),
    (K::Reserved, Op::Unregister, K::Unregistered),
    (K::Reserved, Op::Move, K::Registered),
    (K::Preempted, Op::RegisterIgnoreExisting, K::Preempted),
    (K::Preempted, Op::Reserve, K::Reserved),
    (K::Preempted, Op::Preempt, K::Reserved),
    (K::Preempted, Op::Clear, K::Unregistered),
    (K::Preempted, Op::Unregister, K::Unregistered),
];

/// Look up the phase an operation leads to, if it is allowed at all
pub fn next_phase(from: PhaseKind, op: Operation) -> Option<PhaseKind> {
    TRANSITIONS
        .iter()
        .find(|(f, o, _)| *f == from && *o == op)
        .map(|(_, _, to)| *to)
}

fn rejection(phase: &Phase, op: Operation) -> PrError {
    match (phase, op) {
        (_, Op::Register) => already_registered(phase.key()),
        (Phase::Unregistered, _) => PrError::ReservationConflict(format!(
            "{:?} requires a registered key, this initiator is not registered",
            op
        )),
        (_, Op::Release) => PrError::ReservationConflict(
            "this initiator does not hold a reservation".to_string(),
        ),
        (_, Op::Move) => PrError::ReservationConflict(
            "only the reservation holder can move the reservation".to_string(),
        ),
        _ => PrError::InvalidParameter(format!("{:?} is not allowed in phase {:?}", op, phase)),
    }
}

fn already_registered(key: Option<ReservationKey>) -> PrError {
    PrError::AlreadyRegistered(key.map_or_else(|| "(unknown)".to_string(), |k| k.to_string()))
}

/// Settings for a [`PrHandle`]
#[derive(Debug, Clone)]
pub struct HandleConfig {
    /// TransportID of the local initiator port, recorded with our registration
    pub initiator_port: Option<TransportId>,
    /// Initial PR IN allocation length
    pub allocation_length: u16,
    /// Activate Persist Through Power Loss on register actions
    pub aptpl: bool,
    /// Register on all target ports (ALL_TG_PT)
    pub all_target_ports: bool,
}

impl Default for HandleConfig {
    fn default() -> Self {
        HandleConfig {
            initiator_port: None,
            allocation_length: DEFAULT_ALLOCATION_LENGTH,
            aptpl: false,
            all_target_ports: false,
        }
    }
}

/// Persistent reservation handle for one logical unit
pub struct PrHandle<T: ScsiTransport> {
    transport: T,
    config: HandleConfig,
    phase: Phase,
    cache: ReservationCache,
}

impl<T: ScsiTransport> PrHandle<T> {
    /// Create a new builder for configuring the handle
    pub fn builder() -> PrHandleBuilder<T> {
        PrHandleBuilder::new()
    }

    /// Create a handle with default settings
    pub fn new(transport: T) -> Self {
        PrHandle {
            transport,
            config: HandleConfig::default(),
            phase: Phase::Unregistered,
            cache: ReservationCache::new(),
        }
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    /// Key this initiator is registered with, if any
    pub fn key(&self) -> Option<ReservationKey> {
        self.phase.key()
    }

    pub fn config(&self) -> &HandleConfig {
        &self.config
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    /// Cached view of registrations and reservation; never touches the device
    pub fn snapshot(&self) -> ReservationSnapshot {
        self.cache.snapshot()
    }

    /// Register `key` for this initiator
    ///
    /// Fails with [`PrError::AlreadyRegistered`] when this handle is already
    /// registered or the device rejects the registration with RESERVATION
    /// CONFLICT, and with [`PrError::DeviceBusy`] on transient device status.
    pub fn register(&mut self, key: ReservationKey) -> PrResult<()> {
        if key.is_zero() {
            return Err(PrError::InvalidParameter(
                "cannot register the zero reservation key".to_string(),
            ));
        }
        self.begin(Op::Register)?;

        let params = PrOutParams {
            service_action_key: key,
            aptpl: self.config.aptpl,
            all_target_ports: self.config.all_target_ports,
            ..Default::default()
        };
        self.execute_out(PrOutAction::Register, &params)
            .map_err(|e| match e {
                PrError::ReservationConflict(_) => already_registered(Some(key)),
                other => other,
            })?;

        self.set_phase(Phase::Registered { key });
        let registrant = self.local_registrant(key);
        self.cache.record_registration(None, registrant)
    }

    /// Register `key` regardless of any existing registration for this initiator
    ///
    /// Replaces the current key when registered; a held reservation follows
    /// the new key.
    pub fn register_ignore_existing(&mut self, key: ReservationKey) -> PrResult<()> {
        if key.is_zero() {
            return Err(PrError::InvalidParameter(
                "use unregister() to remove a registration".to_string(),
            ));
        }
        self.begin(Op::RegisterIgnoreExisting)?;

        let params = PrOutParams {
            service_action_key: key,
            aptpl: self.config.aptpl,
            all_target_ports: self.config.all_target_ports,
            ..Default::default()
        };
        self.execute_out(PrOutAction::RegisterAndIgnoreExisting, &params)?;

        let previous = self.phase.key();
        let phase = match self.phase {
            Phase::Unregistered | Phase::Registered { .. } => Phase::Registered { key },
            Phase::Reserved {
                reservation_type, ..
            } => Phase::Reserved {
                key,
                reservation_type,
            },
            Phase::Preempted { .. } => Phase::Preempted { key },
        };
        self.set_phase(phase);
        let registrant = self.local_registrant(key);
        self.cache.record_registration(previous, registrant)
    }

    /// Reserve the logical unit with `reservation_type`
    pub fn reserve(
        &mut self,
        reservation_type: ReservationType,
        scope: ReservationScope,
    ) -> PrResult<()> {
        let key = self.begin_keyed(Op::Reserve)?;

        let params = PrOutParams {
            key,
            scope,
            reservation_type: Some(reservation_type),
            ..Default::default()
        };
        self.execute_out(PrOutAction::Reserve, &params)?;

        self.set_phase(Phase::Reserved {
            key,
            reservation_type,
        });
        let mut reservation = Reservation::new(key, reservation_type);
        reservation.scope = scope;
        self.cache.record_reservation(reservation)
    }

    /// Release the reservation this initiator holds
    ///
    /// The holder is re-read from the device first; a generation change
    /// since the last read forces a full resync, and the release only goes
    /// out if the fresh state still names this initiator as holder.
    pub fn release(&mut self) -> PrResult<()> {
        let key = self.begin_keyed(Op::Release)?;

        let fresh = self.query_read_reservation()?;
        if self.cache_is_current(fresh.generation) {
            self.cache.apply_reservation(&fresh)?;
        } else {
            self.resync()?;
        }

        let held = self
            .cache
            .reservation()
            .filter(|resv| resv.is_held_by(key, self.cache.registrations()))
            .copied();
        let reservation = match held {
            Some(resv) => resv,
            None => {
                self.reconcile_phase();
                return Err(PrError::ReservationConflict(format!(
                    "key {} no longer holds the reservation",
                    key
                )));
            }
        };

        let params = PrOutParams {
            key,
            scope: reservation.scope,
            reservation_type: Some(reservation.reservation_type),
            ..Default::default()
        };
        self.execute_out(PrOutAction::Release, &params)?;

        self.set_phase(Phase::Registered { key });
        self.cache.apply_release()
    }

    /// Take the reservation from `victim`, installing ours with `new_type`
    ///
    /// Does not require holding the reservation. The victim must be a
    /// registered key; it stays registered and only loses the reservation.
    /// A zero `victim` takes over an all-registrants reservation.
    pub fn preempt(&mut self, victim: ReservationKey, new_type: ReservationType) -> PrResult<()> {
        self.preempt_with(PrOutAction::Preempt, victim, new_type)
    }

    /// Like [`PrHandle::preempt`], also aborting the victim's outstanding tasks
    pub fn preempt_and_abort(
        &mut self,
        victim: ReservationKey,
        new_type: ReservationType,
    ) -> PrResult<()> {
        self.preempt_with(PrOutAction::PreemptAndAbort, victim, new_type)
    }

    fn preempt_with(
        &mut self,
        action: PrOutAction,
        victim: ReservationKey,
        new_type: ReservationType,
    ) -> PrResult<()> {
        let key = self.begin_keyed(Op::Preempt)?;
        self.verify_registered(key)?;

        if victim.is_zero() {
            let shared = self
                .cache
                .reservation()
                .map_or(false, |r| r.reservation_type.is_all_registrants());
            if !shared {
                return Err(PrError::InvalidParameter(
                    "a zero victim key only preempts an all-registrants reservation".to_string(),
                ));
            }
        } else if !self.cache.registrations().contains(victim) {
            return Err(PrError::InvalidParameter(format!(
                "victim key {} is not registered on the device",
                victim
            )));
        }

        let params = PrOutParams {
            key,
            service_action_key: victim,
            reservation_type: Some(new_type),
            ..Default::default()
        };
        self.execute_out(action, &params)?;

        self.set_phase(Phase::Reserved {
            key,
            reservation_type: new_type,
        });
        self.cache
            .record_preempt(victim, Reservation::new(key, new_type))
    }

    /// Remove every registration and the reservation from the logical unit
    ///
    /// This is an administrative override that affects all initiators; it
    /// is refused unless `confirm` is true.
    pub fn clear(&mut self, confirm: bool) -> PrResult<()> {
        if !confirm {
            return Err(PrError::InvalidParameter(
                "clear removes every registration on the device; pass confirm = true".to_string(),
            ));
        }
        let key = self.begin_keyed(Op::Clear)?;
        self.verify_registered(key)?;

        let params = PrOutParams {
            key,
            ..Default::default()
        };
        self.execute_out(PrOutAction::Clear, &params)?;

        self.set_phase(Phase::Unregistered);
        self.cache.apply_clear()
    }

    /// Remove this initiator's registration
    ///
    /// Succeeds without a device command when already unregistered.
    pub fn unregister(&mut self) -> PrResult<()> {
        self.begin(Op::Unregister)?;
        let key = match self.phase.key() {
            Some(key) => key,
            None => {
                log::debug!("Unregister on an unregistered handle, nothing to do");
                return Ok(());
            }
        };

        let params = PrOutParams {
            key,
            service_action_key: ReservationKey::ZERO,
            ..Default::default()
        };
        self.execute_out(PrOutAction::Register, &params)?;

        self.set_phase(Phase::Unregistered);
        self.cache.record_unregistration(key)
    }

    /// Hand the reservation to another initiator port with REGISTER AND MOVE
    ///
    /// `destination` is registered with `destination_key` and becomes the
    /// holder. With `unregister_self` this initiator's registration is
    /// removed as part of the same command.
    pub fn register_and_move(
        &mut self,
        destination: TransportId,
        relative_target_port: u16,
        destination_key: ReservationKey,
        unregister_self: bool,
    ) -> PrResult<()> {
        let key = self.begin_keyed(Op::Move)?;
        let reservation_type = match self.phase {
            Phase::Reserved {
                reservation_type, ..
            } => reservation_type,
            _ => return Err(rejection(&self.phase, Op::Move)),
        };
        if reservation_type.is_all_registrants() {
            return Err(PrError::InvalidParameter(format!(
                "{} reservations cannot be moved",
                reservation_type
            )));
        }

        let params = PrOutParams {
            key,
            service_action_key: destination_key,
            reservation_type: Some(reservation_type),
            aptpl: self.config.aptpl,
            move_target: Some(MoveTarget {
                transport_id: destination.clone(),
                relative_target_port,
                unregister: unregister_self,
            }),
            ..Default::default()
        };
        self.execute_out(PrOutAction::RegisterAndMove, &params)?;

        if unregister_self {
            self.set_phase(Phase::Unregistered);
        } else {
            self.set_phase(Phase::Registered { key });
        }

        let mut registrant = Registrant::new(destination_key).with_port(Some(destination));
        registrant.relative_target_port = relative_target_port;
        self.cache.record_move(key, registrant, unregister_self)
    }

    /// Reread the full PR status from the device and reconcile the phase
    pub fn refresh(&mut self) -> PrResult<ReservationSnapshot> {
        self.resync()?;
        Ok(self.cache.snapshot())
    }

    /// READ KEYS, folded into the cache
    pub fn read_keys(&mut self) -> PrResult<ReadKeys> {
        let keys = self.query(PrInAction::ReadKeys, decode_read_keys)?;
        self.cache.apply_registration(&keys)?;
        Ok(keys)
    }

    /// READ RESERVATION, folded into the cache
    pub fn read_reservation(&mut self) -> PrResult<ReadReservation> {
        let resv = self.query_read_reservation()?;
        self.cache.apply_reservation(&resv)?;
        Ok(resv)
    }

    /// REPORT CAPABILITIES
    pub fn report_capabilities(&mut self) -> PrResult<Capabilities> {
        self.query(PrInAction::ReportCapabilities, decode_report_capabilities)
    }

    fn begin(&self, op: Operation) -> PrResult<PhaseKind> {
        next_phase(self.phase.kind(), op).ok_or_else(|| {
            log::debug!("Rejected {:?} in phase {:?}", op, self.phase);
            rejection(&self.phase, op)
        })
    }

    fn begin_keyed(&self, op: Operation) -> PrResult<ReservationKey> {
        self.begin(op)?;
        self.phase.key().ok_or_else(|| rejection(&self.phase, op))
    }

    fn set_phase(&mut self, phase: Phase) {
        if phase != self.phase {
            log::info!("PR phase {:?} -> {:?}", self.phase, phase);
            self.phase = phase;
        }
    }

    fn local_registrant(&self, key: ReservationKey) -> Registrant {
        let mut registrant = Registrant::new(key).with_port(self.config.initiator_port.clone());
        registrant.all_target_ports = self.config.all_target_ports;
        registrant
    }

    fn cache_is_current(&self, observed: Generation) -> bool {
        let current = !self.cache.is_stale() && self.cache.generation() == Some(observed);
        if !current {
            log::warn!(
                "PR generation changed (cached {:?}, device {}), resynchronizing",
                self.cache.generation(),
                observed
            );
        }
        current
    }

    /// Confirm against the device that `key` is still registered
    fn verify_registered(&mut self, key: ReservationKey) -> PrResult<()> {
        let fresh = self.query(PrInAction::ReadKeys, decode_read_keys)?;
        if !self.cache_is_current(fresh.generation) {
            self.resync()?;
        }

        if !self.cache.registrations().contains(key) {
            self.reconcile_phase();
            return Err(PrError::ReservationConflict(format!(
                "key {} is no longer registered on the device",
                key
            )));
        }
        Ok(())
    }

    fn resync(&mut self) -> PrResult<FullStatus> {
        let status = self.query(PrInAction::ReadFullStatus, decode_full_status)?;
        self.cache.apply_full_status(&status)?;
        self.reconcile_phase();
        Ok(status)
    }

    /// Align the phase with freshly read device state
    fn reconcile_phase(&mut self) {
        let key = match self.phase.key() {
            Some(key) => key,
            None => return,
        };

        let registrations = self.cache.registrations();
        let phase = if !registrations.contains(key) {
            log::warn!("Registration {} was removed by another initiator", key);
            Phase::Unregistered
        } else {
            match self.cache.reservation() {
                Some(resv) if resv.is_held_by(key, registrations) => Phase::Reserved {
                    key,
                    reservation_type: resv.reservation_type,
                },
                _ => match self.phase {
                    Phase::Reserved { .. } | Phase::Preempted { .. } => Phase::Preempted { key },
                    _ => Phase::Registered { key },
                },
            }
        };
        self.set_phase(phase);
    }

    fn query_read_reservation(&mut self) -> PrResult<ReadReservation> {
        self.query(PrInAction::ReadReservation, decode_read_reservation)
    }

    /// Issue a PR IN command and decode it, growing the buffer once if the
    /// device reports more data than fit
    fn query<R>(&mut self, action: PrInAction, decode: fn(&[u8]) -> PrResult<R>) -> PrResult<R> {
        let mut allocation_length = self.config.allocation_length;
        let mut retried = false;

        loop {
            let data = self.execute_in(action, allocation_length)?;
            match decode(&data) {
                Err(PrError::TruncatedResponse { declared, available })
                    if !retried && declared > allocation_length as usize =>
                {
                    log::warn!(
                        "{:?} needs {} bytes but only {} fit, reissuing",
                        action,
                        declared,
                        available
                    );
                    allocation_length = declared.min(u16::MAX as usize) as u16;
                    retried = true;
                }
                other => return other,
            }
        }
    }

    fn execute_in(&mut self, action: PrInAction, allocation_length: u16) -> PrResult<Vec<u8>> {
        let cmd = encode_reserve_in(action, allocation_length)?;
        log::debug!("PR IN {:?}: CDB {:02x?}", action, cmd.cdb);

        let response = self
            .transport
            .execute(&cmd.cdb, &cmd.data_out, cmd.expected_in_len)?;
        let mut data = check_status(response)?;
        // Never trust more than we asked for
        data.truncate(cmd.expected_in_len);

        log::debug!("PR IN {:?}: {} bytes returned", action, data.len());
        Ok(data)
    }

    fn execute_out(&mut self, action: PrOutAction, params: &PrOutParams) -> PrResult<()> {
        let cmd = encode_reserve_out(action, params)?;
        log::debug!(
            "PR OUT {:?}: CDB {:02x?}, {} parameter bytes",
            action,
            cmd.cdb,
            cmd.data_out.len()
        );

        let response = self
            .transport
            .execute(&cmd.cdb, &cmd.data_out, cmd.expected_in_len)?;
        check_status(response).map_err(|e| {
            log::debug!("PR OUT {:?} failed: {}", action, e);
            e
        })?;
        Ok(())
    }
}

/// Builder for configuring a [`PrHandle`]
pub struct PrHandleBuilder<T: ScsiTransport> {
    initiator_port: Option<TransportId>,
    allocation_length: Option<u16>,
    aptpl: bool,
    all_target_ports: bool,
    _phantom: std::marker::PhantomData<T>,
}

impl<T: ScsiTransport> PrHandleBuilder<T> {
    fn new() -> Self {
        Self {
            initiator_port: None,
            allocation_length: None,
            aptpl: false,
            all_target_ports: false,
            _phantom: std::marker::PhantomData,
        }
    }

    /// TransportID of the local initiator port
    pub fn initiator_port(mut self, port: TransportId) -> Self {
        self.initiator_port = Some(port);
        self
    }

    /// Initial PR IN allocation length (default: 8192)
    pub fn allocation_length(mut self, len: u16) -> Self {
        self.allocation_length = Some(len);
        self
    }

    /// Set APTPL on register actions so registrations survive power loss
    pub fn aptpl(mut self, enabled: bool) -> Self {
        self.aptpl = enabled;
        self
    }

    /// Register through all target ports (ALL_TG_PT)
    pub fn all_target_ports(mut self, enabled: bool) -> Self {
        self.all_target_ports = enabled;
        self
    }

    /// Build the handle over the given transport
    pub fn build(self, transport: T) -> PrResult<PrHandle<T>> {
        let allocation_length = self.allocation_length.unwrap_or(DEFAULT_ALLOCATION_LENGTH);
        if (allocation_length as usize) < PR_IN_HEADER_LEN {
            return Err(PrError::Config(format!(
                "allocation_length must be at least {} bytes",
                PR_IN_HEADER_LEN
            )));
        }

        Ok(PrHandle {
            transport,
            config: HandleConfig {
                initiator_port: self.initiator_port,
                allocation_length,
                aptpl: self.aptpl,
                all_target_ports: self.all_target_ports,
            },
            phase: Phase::Unregistered,
            cache: ReservationCache::new(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::{SimulatedLun, SimulatedPort};

    fn handle(lun: &SimulatedLun, name: &str) -> PrHandle<SimulatedPort> {
        let port = TransportId::iscsi(&format!("iqn.2025-12.local:{}", name));
        PrHandle::builder()
            .initiator_port(port.clone())
            .build(lun.connect(port))
            .unwrap()
    }

    #[test]
    fn test_table_has_no_duplicate_transitions() {
        for (i, (from, op, _)) in TRANSITIONS.iter().enumerate() {
            assert!(
                !TRANSITIONS[i + 1..]
                    .iter()
                    .any(|(f, o, _)| f == from && o == op),
                "duplicate entry for {:?} / {:?}",
                from,
                op
            );
        }
    }

    #[test]
    fn test_unregistered_only_allows_registration() {
        let allowed: Vec<_> = TRANSITIONS
            .iter()
            .filter(|(from, _, _)| *from == PhaseKind::Unregistered)
            .map(|(_, op, _)| *op)
            .collect();
        assert_eq!(
            allowed,
            vec![Op::Register, Op::RegisterIgnoreExisting, Op::Unregister]
        );
    }

    #[test]
    fn test_release_only_from_reserved() {
        assert_eq!(
            next_phase(PhaseKind::Reserved, Op::Release),
            Some(PhaseKind::Registered)
        );
        assert_eq!(next_phase(PhaseKind::Registered, Op::Release), None);
        assert_eq!(next_phase(PhaseKind::Preempted, Op::Release), None);
    }

    #[test]
    fn test_rejection_errors() {
        let key = ReservationKey::new(0x11);
        assert!(matches!(
            rejection(&Phase::Registered { key }, Op::Register),
            PrError::AlreadyRegistered(_)
        ));
        assert!(matches!(
            rejection(&Phase::Unregistered, Op::Reserve),
            PrError::ReservationConflict(_)
        ));
        assert!(matches!(
            rejection(&Phase::Preempted { key }, Op::Release),
            PrError::ReservationConflict(_)
        ));
    }

    #[test]
    fn test_builder_defaults() {
        let lun = SimulatedLun::new();
        let h = PrHandle::builder()
            .build(lun.connect(TransportId::sas(0x5000_c500_0000_0001)))
            .unwrap();
        assert_eq!(h.config().allocation_length, DEFAULT_ALLOCATION_LENGTH);
        assert!(!h.config().aptpl);
        assert!(!h.config().all_target_ports);
        assert!(h.config().initiator_port.is_none());
        assert_eq!(h.phase(), Phase::Unregistered);
    }

    #[test]
    fn test_reserve_updates_phase_and_cache() {
        let lun = SimulatedLun::new();
        let mut h = handle(&lun, "a");
        let key = ReservationKey::new(0xAB);
        h.register(key).unwrap();
        h.reserve(ReservationType::ExclusiveAccess, ReservationScope::LogicalUnit)
            .unwrap();

        assert_eq!(
            h.phase(),
            Phase::Reserved {
                key,
                reservation_type: ReservationType::ExclusiveAccess
            }
        );
        assert_eq!(h.snapshot().holder(), Some(key));
        // Local mutations drop the generation until the next read
        assert_eq!(h.snapshot().generation, None);
    }

    #[test]
    fn test_refresh_detects_lost_registration() {
        let lun = SimulatedLun::new();
        let mut a = handle(&lun, "a");
        let mut b = handle(&lun, "b");
        a.register(ReservationKey::new(0xA)).unwrap();
        b.register(ReservationKey::new(0xB)).unwrap();

        b.clear(true).unwrap();
        let snap = a.refresh().unwrap();
        assert!(snap.registrations.is_empty());
        assert_eq!(a.phase(), Phase::Unregistered);
    }

    #[test]
    fn test_clear_without_confirm_sends_nothing() {
        let lun = SimulatedLun::new();
        let mut a = handle(&lun, "a");
        a.register(ReservationKey::new(0xA)).unwrap();
        let before = lun.command_count();
        assert!(matches!(a.clear(false), Err(PrError::InvalidParameter(_))));
        assert_eq!(lun.command_count(), before);
        assert_eq!(a.phase(), Phase::Registered { key: ReservationKey::new(0xA) });
    }
}
