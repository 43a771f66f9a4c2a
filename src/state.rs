//! Reservation state model
//!
//! An advisory, in-process projection of what the device reported. The
//! device stays authoritative: every mutation here follows either a decoded
//! PR IN response or a PR OUT command that completed with GOOD status.

use crate::error::{PrError, PrResult};
use crate::response::{FullStatus, ReadKeys, ReadReservation};
use crate::types::{Generation, ReservationKey, ReservationScope, ReservationType, TransportId};
use std::collections::btree_map;
use std::collections::BTreeMap;

/// One registered key and, when known, the initiator port that owns it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Registrant {
    pub key: ReservationKey,
    pub port: Option<TransportId>,
    pub relative_target_port: u16,
    pub all_target_ports: bool,
}

impl Registrant {
    pub fn new(key: ReservationKey) -> Self {
        Registrant {
            key,
            port: None,
            relative_target_port: 0,
            all_target_ports: false,
        }
    }

    pub fn with_port(mut self, port: Option<TransportId>) -> Self {
        self.port = port;
        self
    }
}

/// Registered keys on a logical unit; keys are unique, order is irrelevant
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct RegistrationRecord {
    entries: BTreeMap<ReservationKey, Registrant>,
}

impl RegistrationRecord {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace the registrant for its key
    pub fn insert(&mut self, registrant: Registrant) {
        self.entries.insert(registrant.key, registrant);
    }

    pub fn remove(&mut self, key: ReservationKey) -> Option<Registrant> {
        self.entries.remove(&key)
    }

    pub fn contains(&self, key: ReservationKey) -> bool {
        self.entries.contains_key(&key)
    }

    pub fn get(&self, key: ReservationKey) -> Option<&Registrant> {
        self.entries.get(&key)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn keys(&self) -> impl Iterator<Item = ReservationKey> + '_ {
        self.entries.keys().copied()
    }

    pub fn iter(&self) -> btree_map::Values<'_, ReservationKey, Registrant> {
        self.entries.values()
    }
}

/// The active reservation on a logical unit
///
/// For the all-registrants types the device reports a zero holder key and
/// every registered key holds the reservation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Reservation {
    pub holder: ReservationKey,
    pub reservation_type: ReservationType,
    pub scope: ReservationScope,
}

impl Reservation {
    pub fn new(holder: ReservationKey, reservation_type: ReservationType) -> Self {
        let holder = if reservation_type.is_all_registrants() {
            ReservationKey::ZERO
        } else {
            holder
        };
        Reservation {
            holder,
            reservation_type,
            scope: ReservationScope::LogicalUnit,
        }
    }

    /// Whether `key` holds this reservation given the current registrations
    pub fn is_held_by(&self, key: ReservationKey, registrations: &RegistrationRecord) -> bool {
        if self.reservation_type.is_all_registrants() {
            registrations.contains(key)
        } else {
            self.holder == key && !key.is_zero()
        }
    }
}

/// Immutable copy of the cached state
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ReservationSnapshot {
    /// Last generation read from the device; `None` after a local mutation
    pub generation: Option<Generation>,
    pub registrations: RegistrationRecord,
    pub reservation: Option<Reservation>,
    /// Set when an invariant violation invalidated the cache
    pub stale: bool,
}

impl ReservationSnapshot {
    pub fn is_registered(&self, key: ReservationKey) -> bool {
        self.registrations.contains(key)
    }

    /// Holder key of a single-holder reservation
    pub fn holder(&self) -> Option<ReservationKey> {
        self.reservation
            .filter(|r| !r.reservation_type.is_all_registrants())
            .map(|r| r.holder)
    }
}

/// Holder must be registered; all-registrants reservations need at least one registrant
pub fn check_invariant(
    registrations: &RegistrationRecord,
    reservation: Option<&Reservation>,
) -> PrResult<()> {
    match reservation {
        None => Ok(()),
        Some(resv) if resv.reservation_type.is_all_registrants() => {
            if registrations.is_empty() {
                Err(PrError::InconsistentState(format!(
                    "{} reservation present with no registered keys",
                    resv.reservation_type
                )))
            } else {
                Ok(())
            }
        }
        Some(resv) => {
            if registrations.contains(resv.holder) {
                Ok(())
            } else {
                Err(PrError::InconsistentState(format!(
                    "reservation holder {} is not a registered key",
                    resv.holder
                )))
            }
        }
    }
}

/// Read-through, write-through cache of one logical unit's PR state
#[derive(Debug, Default)]
pub struct ReservationCache {
    registrations: RegistrationRecord,
    reservation: Option<Reservation>,
    generation: Option<Generation>,
    stale: bool,
}

impl ReservationCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Last generation observed, `None` when a local mutation invalidated it
    pub fn generation(&self) -> Option<Generation> {
        self.generation
    }

    pub fn is_stale(&self) -> bool {
        self.stale
    }

    pub fn registrations(&self) -> &RegistrationRecord {
        &self.registrations
    }

    pub fn reservation(&self) -> Option<&Reservation> {
        self.reservation.as_ref()
    }

    /// Copy of the cached state; never touches the device
    pub fn snapshot(&self) -> ReservationSnapshot {
        ReservationSnapshot {
            generation: self.generation,
            registrations: self.registrations.clone(),
            reservation: self.reservation,
            stale: self.stale,
        }
    }

    /// Drop the cached generation so the next holder-dependent command resyncs
    pub fn invalidate(&mut self) {
        self.generation = None;
        self.stale = true;
    }

    /// Validate a staged state and install it, or invalidate the cache
    fn commit(
        &mut self,
        registrations: RegistrationRecord,
        reservation: Option<Reservation>,
        generation: Option<Generation>,
    ) -> PrResult<()> {
        if let Err(e) = check_invariant(&registrations, reservation.as_ref()) {
            log::warn!("Cached reservation state invalidated: {}", e);
            self.invalidate();
            return Err(e);
        }

        self.registrations = registrations;
        self.reservation = reservation;
        self.generation = generation;
        Ok(())
    }

    /// Replace the registered keys with a READ KEYS result
    ///
    /// Port information already known for a surviving key is kept, since
    /// READ KEYS reports bare keys only.
    pub fn apply_registration(&mut self, keys: &ReadKeys) -> PrResult<()> {
        let mut registrations = RegistrationRecord::new();
        for registrant in keys.registrations.iter() {
            let merged = self
                .registrations
                .get(registrant.key)
                .cloned()
                .unwrap_or_else(|| registrant.clone());
            registrations.insert(merged);
        }
        let generation = self.partial_generation(keys.generation);
        self.commit(registrations, self.reservation, generation)
    }

    /// Replace the reservation with a READ RESERVATION result
    pub fn apply_reservation(&mut self, resv: &ReadReservation) -> PrResult<()> {
        let generation = self.partial_generation(resv.generation);
        self.commit(self.registrations.clone(), resv.reservation, generation)
    }

    /// Generation to keep after a read that refreshed only half the cache
    ///
    /// The untouched half is known to match `observed` only if the whole
    /// cache was already current at that generation.
    fn partial_generation(&self, observed: Generation) -> Option<Generation> {
        if !self.stale && self.generation == Some(observed) {
            Some(observed)
        } else {
            None
        }
    }

    /// Replace everything with a READ FULL STATUS result and clear staleness
    pub fn apply_full_status(&mut self, status: &FullStatus) -> PrResult<()> {
        self.commit(
            status.registrations.clone(),
            status.reservation,
            Some(status.generation),
        )?;
        self.stale = false;
        Ok(())
    }

    /// A RELEASE completed
    pub fn apply_release(&mut self) -> PrResult<()> {
        self.commit(self.registrations.clone(), None, None)
    }

    /// A CLEAR completed: no registrations, no reservation
    pub fn apply_clear(&mut self) -> PrResult<()> {
        self.commit(RegistrationRecord::new(), None, None)
    }

    /// A REGISTER (or REGISTER AND IGNORE EXISTING KEY) added `registrant`,
    /// replacing `previous` when the caller changed its key
    pub fn record_registration(
        &mut self,
        previous: Option<ReservationKey>,
        registrant: Registrant,
    ) -> PrResult<()> {
        let mut registrations = self.registrations.clone();
        let mut reservation = self.reservation;

        if let Some(old) = previous.filter(|old| *old != registrant.key) {
            registrations.remove(old);
            // The holder keeps its reservation under the new key
            if let Some(resv) = reservation.as_mut() {
                if resv.holder == old {
                    resv.holder = registrant.key;
                }
            }
        }
        registrations.insert(registrant);
        self.commit(registrations, reservation, None)
    }

    /// A REGISTER with a zero service action key removed `key`
    pub fn record_unregistration(&mut self, key: ReservationKey) -> PrResult<()> {
        let mut registrations = self.registrations.clone();
        registrations.remove(key);

        let reservation = self.reservation.filter(|resv| {
            if resv.reservation_type.is_all_registrants() {
                !registrations.is_empty()
            } else {
                resv.holder != key
            }
        });
        self.commit(registrations, reservation, None)
    }

    /// A RESERVE installed `reservation`
    pub fn record_reservation(&mut self, reservation: Reservation) -> PrResult<()> {
        self.commit(self.registrations.clone(), Some(reservation), None)
    }

    /// A PREEMPT replaced any reservation with `reservation`
    ///
    /// The victim keeps its registration; only the reservation moves. A zero
    /// victim preempts an all-registrants reservation.
    pub fn record_preempt(
        &mut self,
        victim: ReservationKey,
        reservation: Reservation,
    ) -> PrResult<()> {
        let known = if victim.is_zero() {
            self.reservation
                .map_or(false, |r| r.reservation_type.is_all_registrants())
        } else {
            self.registrations.contains(victim)
        };
        if !known {
            let e = PrError::InconsistentState(format!(
                "preempted key {} is not a registered key",
                victim
            ));
            log::warn!("Cached reservation state invalidated: {}", e);
            self.invalidate();
            return Err(e);
        }
        self.commit(self.registrations.clone(), Some(reservation), None)
    }

    /// A REGISTER AND MOVE handed the reservation to `destination`
    pub fn record_move(
        &mut self,
        source: ReservationKey,
        destination: Registrant,
        unregister_source: bool,
    ) -> PrResult<()> {
        let mut registrations = self.registrations.clone();
        let reservation = self
            .reservation
            .map(|resv| Reservation::new(destination.key, resv.reservation_type));
        if unregister_source {
            registrations.remove(source);
        }
        registrations.insert(destination);
        self.commit(registrations, reservation, None)
    }
}
