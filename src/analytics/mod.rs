mod api;
pub mod constants;
mod debug;
mod dispatch;
pub mod error;
mod hit;
mod journal;
mod queue;
mod registry;
mod settings;
mod tracker;
mod transport;

pub use api::{get_instance, get_instance_with, invalidate_instance, Analytics};
pub use dispatch::DispatchSummary;
pub use error::{AnalyticsError, AnalyticsErrorCode, AnalyticsResult};
pub use hit::{Hit, HitType};
pub use queue::{DurableQueue, HitRecord};
pub use settings::AnalyticsSettings;
pub use tracker::Tracker;
pub use transport::{
    HitTransport, MeasurementProtocolConfig, MeasurementProtocolEndpoint,
    MeasurementProtocolTransport,
};
