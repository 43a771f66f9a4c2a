//! A pure Rust SCSI-3 Persistent Reservation engine
//!
//! This library builds PERSISTENT RESERVE IN/OUT commands, decodes the
//! device's replies and keeps an advisory model of registrations and the
//! active reservation for one logical unit. It is meant for cluster
//! fencing: nodes register a key, one takes the reservation and the
//! survivors preempt a failed node.
//!
//! Users implement the `ScsiTransport` trait to carry CDBs to the device
//! (SG_IO, an iSCSI session, a virtual disk). The `sim` module provides an
//! in-memory logical unit for tests and demos.
//!
//! # Example
//!
//! ```no_run
//! use sg_persist::sim::SimulatedLun;
//! use sg_persist::{PrHandle, ReservationKey, ReservationScope, ReservationType, TransportId};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let lun = SimulatedLun::new();
//! let port = TransportId::iscsi("iqn.2025-12.local:node1");
//!
//! let mut handle = PrHandle::builder()
//!     .initiator_port(port.clone())
//!     .allocation_length(4096)
//!     .build(lun.connect(port))?;
//!
//! handle.register(ReservationKey::new(0x1111))?;
//! handle.reserve(ReservationType::WriteExclusive, ReservationScope::LogicalUnit)?;
//! println!("{:?}", handle.refresh()?);
//! handle.release()?;
//! # Ok(())
//! # }
//! ```

pub mod cdb;
pub mod error;
pub mod handle;
pub mod response;
pub mod scsi;
pub mod sim;
pub mod state;
pub mod transport;
pub mod types;

pub use cdb::{EncodedCommand, PrInAction, PrOutAction, PrOutParams};
pub use error::{PrError, PrResult};
pub use handle::{Phase, PrHandle, PrHandleBuilder};
pub use scsi::{ScsiResponse, SenseData};
pub use state::{Reservation, ReservationSnapshot};
pub use transport::ScsiTransport;
pub use types::{Generation, ReservationKey, ReservationScope, ReservationType, TransportId};

/// Version of this library
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
