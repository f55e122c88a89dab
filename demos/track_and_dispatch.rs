//! Tracks a few hits into a local store and delivers them to the Measurement Protocol
//! validation endpoint. Pending hits survive restarts; run it twice with the network disabled to
//! watch the queue grow.

use gai_rs_sdk::analytics::{
    get_instance_with, invalidate_instance, AnalyticsSettings, Hit, MeasurementProtocolConfig,
    MeasurementProtocolEndpoint, MeasurementProtocolTransport,
};
use std::sync::Arc;

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let transport = MeasurementProtocolTransport::new(
        MeasurementProtocolConfig::new().with_endpoint(MeasurementProtocolEndpoint::DebugCollect),
    )?;
    let analytics = get_instance_with(
        AnalyticsSettings::new("gai_demo", "0.3.0", std::env::temp_dir())
            .with_dispatch_interval(-1.0)
            .with_debug(true)
            .with_transport(Arc::new(transport)),
    )?;
    println!("Store: {}", analytics.data_store_path().display());
    println!("Client id: {}", analytics.client_id());

    let tracker = analytics.create_tracker("UA-00000000-1")?;
    analytics.set_default_tracker(&tracker);
    tracker.set("cd1", "demo")?;

    tracker.track(Hit::screen_view("start"))?;
    tracker.track(Hit::event("demo", "run").with_value(1))?;
    tracker.track(Hit::timing("demo", "startup", 42).with_label("cold"))?;
    println!("Pending hits: {}", analytics.pending_hits());

    let summary = analytics.dispatch().await?;
    println!("Dispatch summary: {summary:?}");

    invalidate_instance();
    Ok(())
}
