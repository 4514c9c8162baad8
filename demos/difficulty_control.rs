use pedalers::{ble::BtleplugTransport, BikeSession, Result, SessionConfig};
use std::{sync::Arc, time::Duration};
use tokio::time::sleep;
use tracing::{error, info};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::fmt::init();

    info!("🚴 Pedalers Difficulty Control Example");

    let transport = Arc::new(BtleplugTransport::new().await?);
    let session = BikeSession::new(transport, SessionConfig::default());

    session.start_scan().await?;
    sleep(Duration::from_secs(5)).await;

    let Some(bike) = session.discovered_devices().await.into_iter().next() else {
        error!("❌ No bike found");
        session.stop_scan().await?;
        return Ok(());
    };

    info!("🔌 Connecting to {bike}...");
    session.connect(bike).await?;
    info!("✅ Connected");

    // The bike does not acknowledge difficulty commands, watch the reported level
    info!("📈 Increasing difficulty...");
    for _ in 0..3 {
        let level = session.increase_difficulty().await?;
        info!("Requested difficulty {level}");
        sleep(Duration::from_secs(3)).await;
        info!(
            "Bike reports difficulty {}",
            session.reading().await.difficulty_level
        );
    }

    info!("📉 Decreasing difficulty...");
    for _ in 0..3 {
        let level = session.decrease_difficulty().await?;
        info!("Requested difficulty {level}");
        sleep(Duration::from_secs(3)).await;
    }

    let reading = session.reading().await;
    info!("📊 Final readings:");
    info!("  Workout timer: {}", reading.formatted_timer());
    info!("  Cadence: {}", reading.cadence);
    info!("  Difficulty: {}", reading.difficulty_level);

    info!("🔌 Disconnecting...");
    session.disconnect().await?;
    info!("🎉 Difficulty control example completed!");
    Ok(())
}
