use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, LazyLock, Mutex, MutexGuard};

use async_trait::async_trait;
use gai_rs_sdk::analytics::{
    get_instance_with, invalidate_instance, AnalyticsError, AnalyticsErrorCode, AnalyticsResult,
    AnalyticsSettings, Hit, HitRecord, HitTransport, MeasurementProtocolConfig,
    MeasurementProtocolEndpoint, MeasurementProtocolTransport,
};
use httpmock::prelude::*;

static ENGINE_TEST_MUTEX: LazyLock<Mutex<()>> = LazyLock::new(|| Mutex::new(()));

fn engine_test_guard() -> MutexGuard<'static, ()> {
    ENGINE_TEST_MUTEX
        .lock()
        .unwrap_or_else(|poison| poison.into_inner())
}

/// Directory location (trailing separator) that does not exist yet.
fn unique_dir(name: &str) -> PathBuf {
    static COUNTER: AtomicUsize = AtomicUsize::new(0);
    PathBuf::from(format!(
        "{}/gai-delivery-{name}-{}-{}/",
        std::env::temp_dir().display(),
        std::process::id(),
        COUNTER.fetch_add(1, Ordering::SeqCst)
    ))
}

#[derive(Default)]
struct FlakyTransport {
    down: AtomicBool,
    delivered: Mutex<Vec<String>>,
}

#[async_trait]
impl HitTransport for FlakyTransport {
    async fn send(&self, batch: &[HitRecord]) -> AnalyticsResult<()> {
        if self.down.load(Ordering::SeqCst) {
            return Err(AnalyticsError::new(
                AnalyticsErrorCode::DeliveryFailure,
                "network down",
            ));
        }
        let mut delivered = self.delivered.lock().unwrap();
        for record in batch {
            delivered.push(String::from_utf8_lossy(record.payload()).into_owned());
        }
        Ok(())
    }
}

#[tokio::test(flavor = "current_thread")]
async fn queued_hits_survive_restart_and_failed_deliveries() {
    let _guard = engine_test_guard();
    let transport = Arc::new(FlakyTransport::default());
    transport.down.store(true, Ordering::SeqCst);
    let settings = AnalyticsSettings::new("restart_product", "2.0", unique_dir("restart"))
        .with_dispatch_interval(-1.0)
        .with_transport(transport.clone());

    let gai = get_instance_with(settings.clone()).unwrap();
    let client_id = gai.client_id().to_string();
    let tracker = gai.create_tracker("UA-9").unwrap();
    for screen in ["one", "two", "three"] {
        tracker.track(Hit::screen_view(screen)).unwrap();
    }
    let summary = gai.dispatch().await.unwrap();
    assert!(summary.failed);
    assert_eq!(summary.retained, 3);
    invalidate_instance();

    transport.down.store(false, Ordering::SeqCst);
    let gai = get_instance_with(settings).unwrap();
    assert_eq!(gai.client_id(), client_id);
    assert_eq!(gai.pending_hits(), 3);
    let summary = gai.dispatch().await.unwrap();
    assert_eq!(summary.delivered, 3);
    assert_eq!(summary.retained, 0);

    let delivered = transport.delivered.lock().unwrap().clone();
    assert_eq!(delivered.len(), 3);
    for (payload, screen) in delivered.iter().zip(["cd=one", "cd=two", "cd=three"]) {
        assert!(payload.contains(screen), "{payload} should contain {screen}");
    }
    invalidate_instance();
}

#[tokio::test(flavor = "current_thread")]
async fn hits_are_dropped_after_max_attempts() {
    let _guard = engine_test_guard();
    let transport = Arc::new(FlakyTransport::default());
    transport.down.store(true, Ordering::SeqCst);
    let gai = get_instance_with(
        AnalyticsSettings::new("attempts_product", "1.0", unique_dir("attempts"))
            .with_dispatch_interval(-1.0)
            .with_max_attempts(2)
            .with_transport(transport.clone()),
    )
    .unwrap();
    gai.create_tracker("UA-1")
        .unwrap()
        .track(Hit::exception("crash", true))
        .unwrap();

    assert!(gai.dispatch().await.unwrap().failed);
    assert!(gai.dispatch().await.unwrap().failed);
    let summary = gai.dispatch().await.unwrap();
    assert_eq!(summary.dropped, 1);
    assert_eq!(gai.pending_hits(), 0);
    invalidate_instance();
}

#[test]
fn measurement_protocol_transport_delivers_end_to_end() {
    let _guard = engine_test_guard();
    let server = MockServer::start();
    let mock = server.mock(|when, then| {
        when.method(POST)
            .path("/batch")
            .body_contains("t=event")
            .body_contains("tid=UA-77")
            .body_contains("qt=");
        then.status(200);
    });
    let transport = MeasurementProtocolTransport::new(
        MeasurementProtocolConfig::new()
            .with_endpoint(MeasurementProtocolEndpoint::Custom(server.url("/batch"))),
    )
    .unwrap();

    let gai = get_instance_with(
        AnalyticsSettings::new("http_product", "1.0", unique_dir("http"))
            .with_dispatch_interval(-1.0)
            .with_transport(Arc::new(transport)),
    )
    .unwrap();
    gai.create_tracker("UA-77")
        .unwrap()
        .track(Hit::event("cart", "add").with_value(2))
        .unwrap();

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .unwrap();
    let summary = runtime.block_on(gai.dispatch()).unwrap();
    mock.assert();
    assert_eq!(summary.delivered, 1);
    invalidate_instance();
}
