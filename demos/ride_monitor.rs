use pedalers::{ble::BtleplugTransport, BikeSession, Result, SessionConfig, SessionState};
use std::{sync::Arc, time::Duration};
use tokio::time::{sleep, timeout};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging, RUST_LOG=pedalers=debug shows frames
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    info!("🚴 Pedalers Ride Monitor Example");

    let transport = Arc::new(BtleplugTransport::new().await?);
    let session = BikeSession::new(transport, SessionConfig::default());

    info!("Searching for bikes...");
    session.start_scan().await?;

    let mut updates = session.subscribe();
    let found = {
        let first = timeout(
            Duration::from_secs(15),
            updates.wait_for(|snapshot| !snapshot.devices.is_empty()),
        )
        .await;
        match first {
            Ok(Ok(snapshot)) => snapshot.devices.first().cloned(),
            _ => None,
        }
    };

    let Some(bike) = found else {
        error!("❌ No bike found");
        session.stop_scan().await?;
        return Ok(());
    };

    info!("🔌 Connecting to {bike}...");
    if let Err(e) = session.connect(bike).await {
        error!("❌ Failed to connect: {e}");
        return Err(e);
    }
    info!("✅ Streaming telemetry, press Ctrl+C to stop");

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            changed = updates.changed() => {
                if changed.is_err() {
                    break;
                }
                let snapshot = updates.borrow_and_update().clone();
                if snapshot.state == SessionState::Disconnected {
                    warn!("❌ Bike disconnected");
                    break;
                }

                let reading = snapshot.reading;
                println!(
                    "⏱  {:>6}  cadence {:>4}  difficulty {:>3}",
                    reading.formatted_timer(),
                    reading.cadence,
                    reading.difficulty_level
                );
            }
        }
        // Limit console output rate
        sleep(Duration::from_millis(250)).await;
    }

    info!("🔌 Disconnecting...");
    session.disconnect().await?;
    info!("🎉 Ride monitor completed!");
    Ok(())
}
