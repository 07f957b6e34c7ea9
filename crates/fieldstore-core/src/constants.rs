// ABOUTME: Fixed-shape metadata attached to every record regardless of schema.
// ABOUTME: Holds the occurrence window, optional location, and closed weather/light enums.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Local, NaiveDateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Canonical text layout for every stored timestamp. Matches what SQLite's
/// CURRENT_TIMESTAMP produces. Values are always UTC and whole seconds, so
/// an update in the same second as the insert stores updated_at equal to
/// entered_at.
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// A stored enum token that is not part of the current closed set.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown {kind} token: {token:?}")]
pub struct UnknownEnumToken {
    pub kind: &'static str,
    pub token: String,
}

/// Format a timestamp for storage: normalized to UTC, whole seconds.
pub fn format_timestamp(at: &DateTime<Utc>) -> String {
    at.format(TIMESTAMP_FORMAT).to_string()
}

/// Parse a stored timestamp. Stored text carries no zone; it is UTC by contract.
pub fn parse_timestamp(text: &str) -> Result<DateTime<Utc>, chrono::ParseError> {
    NaiveDateTime::parse_from_str(text, TIMESTAMP_FORMAT).map(|naive| naive.and_utc())
}

/// Drop sub-second precision so in-memory values compare equal to what a
/// store read gives back.
pub fn truncate_to_seconds(at: DateTime<Utc>) -> DateTime<Utc> {
    DateTime::from_timestamp(at.timestamp(), 0).unwrap_or(at)
}

macro_rules! token_enum {
    ($(#[$meta:meta])* $name:ident, $kind:literal, { $($variant:ident => $token:literal),+ $(,)? }) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
        pub enum $name {
            $(
                #[serde(rename = $token)]
                $variant,
            )+
        }

        impl $name {
            /// Every variant, in token order.
            pub const ALL: &'static [$name] = &[$($name::$variant),+];

            /// Look a token up in the closed set.
            pub fn from_token(token: &str) -> Result<Self, UnknownEnumToken> {
                match token {
                    $($token => Ok($name::$variant),)+
                    other => Err(UnknownEnumToken {
                        kind: $kind,
                        token: other.to_string(),
                    }),
                }
            }

            /// The canonical stored token.
            pub fn as_token(&self) -> &'static str {
                match self {
                    $($name::$variant => $token,)+
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_token())
            }
        }

        impl FromStr for $name {
            type Err = UnknownEnumToken;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Self::from_token(s)
            }
        }
    };
}

token_enum!(
    /// Weather at the time of the event.
    Weather, "weather", {
        Clear => "CLEAR",
        Cloudy => "CLOUDY",
        PartlyCloudy => "PARTLY_CLOUDY",
        Fog => "FOG",
        Hail => "HAIL",
        Rain => "RAIN",
        Sleet => "SLEET",
        Snow => "SNOW",
        Thunderstorm => "THUNDERSTORM",
        Tornado => "TORNADO",
        Wind => "WIND",
    }
);

token_enum!(
    /// Ambient light at the time of the event.
    Light, "light", {
        Dawn => "DAWN",
        Day => "DAY",
        Dusk => "DUSK",
        Night => "NIGHT",
    }
);

/// A latitude/longitude pair. Stored as both-or-neither, so a present
/// location at 0.0/0.0 is never confused with no location.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Location {
    pub latitude: f64,
    pub longitude: f64,
}

impl Location {
    pub fn new(latitude: f64, longitude: f64) -> Self {
        Self {
            latitude,
            longitude,
        }
    }
}

/// Metadata stored beside every record body.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConstantFields {
    pub occurred_from: DateTime<Utc>,
    /// Mirrors `occurred_from`. Not independently editable; the store
    /// overwrites it on every write.
    pub occurred_to: DateTime<Utc>,
    pub location: Option<Location>,
    pub weather: Option<Weather>,
    pub light: Option<Light>,
}

impl ConstantFields {
    /// Create constants for an event at the given time with no optional
    /// fields set.
    pub fn new(occurred_from: DateTime<Utc>) -> Self {
        Self {
            occurred_from,
            occurred_to: occurred_from,
            location: None,
            weather: None,
            light: None,
        }
    }

    /// Constants for an event happening now.
    pub fn now() -> Self {
        Self::new(Utc::now())
    }

    pub fn with_location(mut self, location: Location) -> Self {
        self.location = Some(location);
        self
    }

    pub fn with_weather(mut self, weather: Weather) -> Self {
        self.weather = Some(weather);
        self
    }

    pub fn with_light(mut self, light: Light) -> Self {
        self.light = Some(light);
        self
    }

    /// Change the occurrence time. `occurred_to` follows it.
    pub fn set_occurred_from(&mut self, at: DateTime<Utc>) {
        self.occurred_from = at;
        self.occurred_to = at;
    }

    /// The occurrence time in the device's display zone.
    pub fn occurred_from_local(&self) -> DateTime<Local> {
        self.occurred_from_in(&Local)
    }

    /// The occurrence time in an arbitrary display zone.
    pub fn occurred_from_in<Tz: TimeZone>(&self, zone: &Tz) -> DateTime<Tz> {
        self.occurred_from.with_timezone(zone)
    }

    /// The form these constants take once written: whole seconds, and
    /// `occurred_to` forced equal to `occurred_from`.
    pub fn normalized(&self) -> Self {
        let occurred = truncate_to_seconds(self.occurred_from);
        Self {
            occurred_from: occurred,
            occurred_to: occurred,
            ..self.clone()
        }
    }
}
