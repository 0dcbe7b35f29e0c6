//! Example: Monitoring a Power Watchdog
//!
//! Discovers Power Watchdogs on every adapter, then keeps one connected and
//! prints its measurements every 5 seconds until Ctrl-C.
//!
//! Run with: `cargo run --example monitor`
//!
//! Set `POWER_WATCHDOG_ADDRESS` to pick a device, otherwise the first one
//! discovered is used. Set `RUST_LOG=power_watchdog_core=debug` to see every
//! decoded packet.

use std::env;
use std::sync::Arc;
use std::time::Duration;

use power_watchdog_core::{
    BtleTransport, ConnectionSupervisor, DiscoveryOptions, SupervisorConfig, discover,
};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let transport = Arc::new(BtleTransport::new().await?);

    println!("Scanning for Power Watchdogs...");
    let devices = discover(transport.as_ref(), &DiscoveryOptions::default()).await;
    for device in &devices {
        println!(
            "  {}  {} {} ({})",
            device.address, device.generation, device.device_type, device.topology
        );
    }

    let address = match env::var("POWER_WATCHDOG_ADDRESS") {
        Ok(address) if !address.is_empty() => address,
        _ => match devices.first() {
            Some(device) => device.address.clone(),
            None => {
                eprintln!(
                    "No Power Watchdog found. Set POWER_WATCHDOG_ADDRESS to retry a known device."
                );
                std::process::exit(1);
            }
        },
    };

    println!("Monitoring {} (Ctrl-C to stop)", address);
    let mut handle = ConnectionSupervisor::new(transport, SupervisorConfig::new(address))?.spawn();

    let mut ticker = tokio::time::interval(Duration::from_secs(5));
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            _ = ticker.tick() => {}
        }

        let snapshot = handle.snapshot();
        if !handle.connected() || !snapshot.is_ready() {
            println!("[{}] waiting for data", handle.state());
            continue;
        }
        for (i, line) in snapshot.lines().enumerate() {
            println!(
                "L{}: {:6.1} V  {:6.2} A  {:7.1} W  {:9.3} kWh  {:4.1} Hz  err={}",
                i + 1,
                line.input_voltage,
                line.current,
                line.power,
                line.energy,
                line.frequency,
                line.error_code
            );
        }
    }

    println!("Stopping...");
    if !handle.stop(Duration::from_secs(10)).await {
        eprintln!("Supervisor did not stop cleanly");
    }
    Ok(())
}
