use std::collections::BTreeMap;
use std::fmt;

use bytes::Bytes;
use url::form_urlencoded;

use crate::analytics::error::{invalid_argument, AnalyticsResult};

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum HitType {
    ScreenView,
    Event,
    Exception,
    Timing,
    Custom(String),
}

impl HitType {
    pub fn as_str(&self) -> &str {
        match self {
            HitType::ScreenView => "screenview",
            HitType::Event => "event",
            HitType::Exception => "exception",
            HitType::Timing => "timing",
            HitType::Custom(value) => value,
        }
    }

    fn required_params(&self) -> &'static [&'static str] {
        match self {
            HitType::ScreenView => &["cd"],
            HitType::Event => &["ec", "ea"],
            HitType::Exception => &["exd"],
            HitType::Timing => &["utc", "utv", "utt"],
            HitType::Custom(_) => &[],
        }
    }
}

impl fmt::Display for HitType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single measurement, built up before being handed to a
/// [`Tracker`](crate::analytics::Tracker).
///
/// ```
/// use gai_rs_sdk::analytics::Hit;
///
/// let hit = Hit::event("video", "play").with_label("intro").with_value(3);
/// assert_eq!(hit.param("el"), Some("intro"));
/// ```
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Hit {
    hit_type: HitType,
    params: BTreeMap<String, String>,
}

impl Hit {
    pub fn screen_view(screen_name: impl Into<String>) -> Self {
        Self::custom(HitType::ScreenView).with_param("cd", screen_name)
    }

    pub fn event(category: impl Into<String>, action: impl Into<String>) -> Self {
        Self::custom(HitType::Event)
            .with_param("ec", category)
            .with_param("ea", action)
    }

    pub fn exception(description: impl Into<String>, fatal: bool) -> Self {
        Self::custom(HitType::Exception)
            .with_param("exd", description)
            .with_param("exf", if fatal { "1" } else { "0" })
    }

    pub fn timing(category: impl Into<String>, variable: impl Into<String>, millis: u64) -> Self {
        Self::custom(HitType::Timing)
            .with_param("utc", category)
            .with_param("utv", variable)
            .with_param("utt", millis.to_string())
    }

    pub fn custom(hit_type: HitType) -> Self {
        Self {
            hit_type,
            params: BTreeMap::new(),
        }
    }

    /// Sets the label of an event (`el`) or a timing (`utl`).
    pub fn with_label(self, label: impl Into<String>) -> Self {
        let key = if self.hit_type == HitType::Timing {
            "utl"
        } else {
            "el"
        };
        self.with_param(key, label)
    }

    pub fn with_value(self, value: i64) -> Self {
        self.with_param("ev", value.to_string())
    }

    pub fn with_param(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.params.insert(key.into(), value.into());
        self
    }

    pub fn hit_type(&self) -> &HitType {
        &self.hit_type
    }

    pub fn param(&self, key: &str) -> Option<&str> {
        self.params.get(key).map(String::as_str)
    }

    pub fn params(&self) -> &BTreeMap<String, String> {
        &self.params
    }

    pub(crate) fn validate(&self) -> AnalyticsResult<()> {
        if self.hit_type.as_str().trim().is_empty() {
            return Err(invalid_argument("hit type must not be empty"));
        }
        if self.params.keys().any(|key| key.is_empty()) {
            return Err(invalid_argument("hit parameter names must not be empty"));
        }
        for key in self.hit_type.required_params() {
            if self.param(key).map_or(true, |value| value.trim().is_empty()) {
                return Err(invalid_argument(format!(
                    "{} hit requires a non-empty '{key}' parameter",
                    self.hit_type
                )));
            }
        }
        Ok(())
    }

    /// Form-encodes the hit. Hit parameters override `defaults`, and `protocol` parameters
    /// override both. Keys are emitted in sorted order.
    pub(crate) fn encode(
        &self,
        defaults: &BTreeMap<String, String>,
        protocol: &[(&str, &str)],
    ) -> Bytes {
        let mut merged: BTreeMap<&str, &str> = defaults
            .iter()
            .map(|(key, value)| (key.as_str(), value.as_str()))
            .collect();
        merged.extend(
            self.params
                .iter()
                .map(|(key, value)| (key.as_str(), value.as_str())),
        );
        merged.extend(protocol.iter().copied());
        merged.insert("t", self.hit_type.as_str());

        let mut serializer = form_urlencoded::Serializer::new(String::new());
        serializer.extend_pairs(merged);
        Bytes::from(serializer.finish())
    }
}
