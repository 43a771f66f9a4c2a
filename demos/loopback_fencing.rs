//! Two-node fencing example against an in-memory logical unit
//!
//! Node A registers and takes a Write Exclusive, Registrants Only
//! reservation. Node B registers, decides A has failed and preempts it.
//! A notices on its next refresh that it has been fenced.
//!
//! Run with `RUST_LOG=debug` to see every CDB that is issued.

use sg_persist::sim::SimulatedLun;
use sg_persist::{PrHandle, ReservationKey, ReservationScope, ReservationType, TransportId};

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging
    env_logger::init();

    let lun = SimulatedLun::new();
    let port_a = TransportId::iscsi("iqn.2025-12.local:cluster.node-a");
    let port_b = TransportId::iscsi("iqn.2025-12.local:cluster.node-b");

    let mut node_a = PrHandle::builder()
        .initiator_port(port_a.clone())
        .build(lun.connect(port_a))?;
    let mut node_b = PrHandle::builder()
        .initiator_port(port_b.clone())
        .build(lun.connect(port_b))?;

    let key_a = ReservationKey::random();
    let key_b = ReservationKey::random();
    println!("Node A key: {}", key_a);
    println!("Node B key: {}", key_b);

    node_a.register(key_a)?;
    node_a.reserve(
        ReservationType::WriteExclusiveRegistrantsOnly,
        ReservationScope::LogicalUnit,
    )?;
    node_b.register(key_b)?;

    let caps = node_b.report_capabilities()?;
    println!("\nDevice supports: {:?}", caps.supported_types);

    let before = node_b.refresh()?;
    println!("\nBefore fencing:");
    println!("  generation: {:?}", before.generation);
    println!("  holder:     {:?}", before.holder());

    // B decides A is dead and takes over
    node_b.preempt(key_a, ReservationType::ExclusiveAccess)?;

    let after = node_b.refresh()?;
    println!("\nAfter fencing:");
    println!("  generation: {:?}", after.generation);
    println!("  holder:     {:?}", after.holder());
    println!("  A still registered: {}", after.is_registered(key_a));

    node_a.refresh()?;
    println!("\nNode A phase: {:?}", node_a.phase());
    if let Err(e) = node_a.release() {
        println!("Node A release refused: {}", e);
    }

    node_b.release()?;
    node_b.unregister()?;
    node_a.unregister()?;
    println!("\nFinal registrations: {:?}", lun.registered_keys());

    Ok(())
}
