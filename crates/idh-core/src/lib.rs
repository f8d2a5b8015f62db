//! Core domain model for hourly login statistics: observations, methods, metric rows and
//! the instant text codec shared by the fetcher and the warehouse.

use std::fmt;

use chrono::{DateTime, Datelike, Duration, Offset, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::warn;

/// Text form used on the wire, e.g. `2014-05-01T20:00:00Z`.
pub const INSTANT_FORMAT: &str = "%Y-%m-%dT%H:%M:%SZ";

/// Earliest year a real observation can carry. Anything older is a decoding failure upstream.
pub const MIN_PLAUSIBLE_YEAR: i32 = 2000;

pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

#[derive(Debug, Error)]
pub enum HarvestError {
    #[error("transport failure: {context}")]
    Transport {
        context: String,
        status: Option<u16>,
        #[source]
        source: Option<BoxError>,
    },
    #[error("parse failure: {context}")]
    Parse {
        context: String,
        #[source]
        source: Option<BoxError>,
    },
    #[error("data integrity violation at {timestamp}: {reason}")]
    DataIntegrity { timestamp: String, reason: String },
    #[error("configuration error: {0}")]
    Configuration(String),
}

impl HarvestError {
    pub fn transport(context: impl Into<String>, source: impl Into<BoxError>) -> Self {
        Self::Transport {
            context: context.into(),
            status: None,
            source: Some(source.into()),
        }
    }

    pub fn parse(context: impl Into<String>, source: impl Into<BoxError>) -> Self {
        Self::Parse {
            context: context.into(),
            source: Some(source.into()),
        }
    }

    pub fn integrity(timestamp: &DateTime<Utc>, reason: impl Into<String>) -> Self {
        Self::DataIntegrity {
            timestamp: timestamp.to_rfc3339(),
            reason: reason.into(),
        }
    }
}

/// Format an instant as UTC text. Non-UTC inputs are accepted but logged.
pub fn format_instant<Tz: TimeZone>(instant: &DateTime<Tz>) -> String {
    let offset = instant.offset().fix();
    if offset.local_minus_utc() != 0 {
        warn!(%offset, "non-UTC instant normalized to UTC");
    }
    instant.with_timezone(&Utc).format(INSTANT_FORMAT).to_string()
}

/// Parse RFC 3339 text. Offsets other than UTC are accepted, converted and logged.
pub fn parse_instant(text: &str) -> Result<DateTime<Utc>, HarvestError> {
    let parsed = DateTime::parse_from_rfc3339(text.trim())
        .map_err(|err| HarvestError::parse(format!("invalid instant {text:?}"), err))?;
    let offset = *parsed.offset();
    if offset.local_minus_utc() != 0 {
        warn!(%offset, input = text, "non-UTC instant normalized to UTC");
    }
    Ok(parsed.with_timezone(&Utc))
}

/// Serde adapter keeping every serialized timestamp in [`INSTANT_FORMAT`].
pub mod instant_serde {
    use chrono::{DateTime, Utc};
    use serde::{de::Error as _, Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &DateTime<Utc>, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&super::format_instant(value))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<DateTime<Utc>, D::Error> {
        let text = String::deserialize(deserializer)?;
        super::parse_instant(&text).map_err(D::Error::custom)
    }
}

/// Upstream organization identifier used as the `TE-orgnum` category filter.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OrgId(String);

impl OrgId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into().trim().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for OrgId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Individually counted authentication methods. `Antall` and `Federated` are composites and
/// deliberately absent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Method {
    #[serde(rename = "minid_passport")]
    MinIdPassport,
    #[serde(rename = "commfides")]
    Commfides,
    #[serde(rename = "buypass_passport")]
    BuypassPassport,
    #[serde(rename = "eidas")]
    Eidas,
    #[serde(rename = "minid")]
    MinId,
    #[serde(rename = "bankid_mobil")]
    BankIdMobil,
    #[serde(rename = "minid_otc")]
    MinIdOtc,
    #[serde(rename = "buypass")]
    BuyPass,
    #[serde(rename = "minid_pin")]
    MinIdPin,
    #[serde(rename = "bankid")]
    BankId,
}

impl Method {
    /// Flattening order.
    pub const ALL: [Method; 10] = [
        Method::MinIdPassport,
        Method::Commfides,
        Method::BuypassPassport,
        Method::Eidas,
        Method::MinId,
        Method::BankIdMobil,
        Method::MinIdOtc,
        Method::BuyPass,
        Method::MinIdPin,
        Method::BankId,
    ];

    /// Column / metric name used in the warehouse.
    pub fn as_str(self) -> &'static str {
        match self {
            Method::MinIdPassport => "minid_passport",
            Method::Commfides => "commfides",
            Method::BuypassPassport => "buypass_passport",
            Method::Eidas => "eidas",
            Method::MinId => "minid",
            Method::BankIdMobil => "bankid_mobil",
            Method::MinIdOtc => "minid_otc",
            Method::BuyPass => "buypass",
            Method::MinIdPin => "minid_pin",
            Method::BankId => "bankid",
        }
    }

    /// Key used by the statistics source in the `measurements` object.
    pub fn source_name(self) -> &'static str {
        match self {
            Method::MinIdPassport => "MinID passport",
            Method::Commfides => "Commfides",
            Method::BuypassPassport => "Buypass passport",
            Method::Eidas => "eIDAS",
            Method::MinId => "MinID",
            Method::BankIdMobil => "BankID mobil",
            Method::MinIdOtc => "MinID OTC",
            Method::BuyPass => "BuyPass",
            Method::MinIdPin => "MinID PIN",
            Method::BankId => "BankID",
        }
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One hour's counters as reported by the source. Missing keys decode as zero.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Measurements {
    #[serde(rename = "MinID passport")]
    pub minid_passport: u32,
    #[serde(rename = "Commfides")]
    pub commfides: u32,
    #[serde(rename = "Buypass passport")]
    pub buypass_passport: u32,
    #[serde(rename = "eIDAS")]
    pub eidas: u32,
    #[serde(rename = "MinID")]
    pub minid: u32,
    #[serde(rename = "BankID mobil")]
    pub bankid_mobil: u32,
    #[serde(rename = "MinID OTC")]
    pub minid_otc: u32,
    #[serde(rename = "Antall")]
    pub antall: u32,
    #[serde(rename = "BuyPass")]
    pub buypass: u32,
    #[serde(rename = "MinID PIN")]
    pub minid_pin: u32,
    #[serde(rename = "Federated")]
    pub federated: u32,
    #[serde(rename = "BankID")]
    pub bankid: u32,
}

/// Warehouse column names, in the order returned by [`Measurements::column_values`].
pub const MEASUREMENT_COLUMNS: [&str; 12] = [
    "minid_passport",
    "commfides",
    "buypass_passport",
    "eidas",
    "minid",
    "bankid_mobil",
    "minid_otc",
    "antall",
    "buypass",
    "minid_pin",
    "federated",
    "bankid",
];

impl Measurements {
    pub fn column_values(&self) -> [u32; 12] {
        [
            self.minid_passport,
            self.commfides,
            self.buypass_passport,
            self.eidas,
            self.minid,
            self.bankid_mobil,
            self.minid_otc,
            self.antall,
            self.buypass,
            self.minid_pin,
            self.federated,
            self.bankid,
        ]
    }

    pub fn get(&self, method: Method) -> u32 {
        match method {
            Method::MinIdPassport => self.minid_passport,
            Method::Commfides => self.commfides,
            Method::BuypassPassport => self.buypass_passport,
            Method::Eidas => self.eidas,
            Method::MinId => self.minid,
            Method::BankIdMobil => self.bankid_mobil,
            Method::MinIdOtc => self.minid_otc,
            Method::BuyPass => self.buypass,
            Method::MinIdPin => self.minid_pin,
            Method::BankId => self.bankid,
        }
    }

    /// Sum over the individual methods, each counted once. Composites are excluded.
    pub fn method_sum(&self) -> i64 {
        Method::ALL.iter().map(|m| i64::from(self.get(*m))).sum()
    }
}

impl Measurements {
    /// Field-wise sum, `None` if any counter overflows.
    pub fn checked_add(&self, rhs: &Measurements) -> Option<Measurements> {
        Some(Measurements {
            minid_passport: self.minid_passport.checked_add(rhs.minid_passport)?,
            commfides: self.commfides.checked_add(rhs.commfides)?,
            buypass_passport: self.buypass_passport.checked_add(rhs.buypass_passport)?,
            eidas: self.eidas.checked_add(rhs.eidas)?,
            minid: self.minid.checked_add(rhs.minid)?,
            bankid_mobil: self.bankid_mobil.checked_add(rhs.bankid_mobil)?,
            minid_otc: self.minid_otc.checked_add(rhs.minid_otc)?,
            antall: self.antall.checked_add(rhs.antall)?,
            buypass: self.buypass.checked_add(rhs.buypass)?,
            minid_pin: self.minid_pin.checked_add(rhs.minid_pin)?,
            federated: self.federated.checked_add(rhs.federated)?,
            bankid: self.bankid.checked_add(rhs.bankid)?,
        })
    }
}

/// One hourly measurement. `source_org` only lives through the merge; `sum` is set by
/// [`Observation::derive_sum`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Observation {
    #[serde(with = "instant_serde")]
    pub timestamp: DateTime<Utc>,
    pub measurements: Measurements,
    #[serde(skip)]
    pub source_org: Option<OrgId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sum: Option<i64>,
}

impl Observation {
    pub fn new(timestamp: DateTime<Utc>, measurements: Measurements) -> Self {
        Self {
            timestamp,
            measurements,
            source_org: None,
            sum: None,
        }
    }

    pub fn with_source_org(mut self, org: OrgId) -> Self {
        self.source_org = Some(org);
        self
    }

    pub fn derive_sum(&mut self) {
        self.sum = Some(self.measurements.method_sum());
    }

    pub fn check_integrity(&self) -> Result<(), HarvestError> {
        if self.timestamp.year() < MIN_PLAUSIBLE_YEAR {
            return Err(HarvestError::integrity(
                &self.timestamp,
                format!("year {} is implausible for an observation", self.timestamp.year()),
            ));
        }
        Ok(())
    }
}

/// Flattened projection of one observation for one method.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetricRow {
    #[serde(with = "instant_serde")]
    pub timestamp: DateTime<Utc>,
    pub method: Method,
    pub count: u32,
}

/// Half-open `[from, to)` window in UTC.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeRange {
    #[serde(with = "instant_serde")]
    pub from: DateTime<Utc>,
    #[serde(with = "instant_serde")]
    pub to: DateTime<Utc>,
}

impl TimeRange {
    pub fn new(from: DateTime<Utc>, to: DateTime<Utc>) -> Result<Self, HarvestError> {
        if from > to {
            return Err(HarvestError::Configuration(format!(
                "time range starts after it ends: {} > {}",
                format_instant(&from),
                format_instant(&to)
            )));
        }
        Ok(Self { from, to })
    }

    pub fn is_empty(&self) -> bool {
        self.from >= self.to
    }

    /// Consecutive sub-windows of at most `step`, covering the range exactly.
    pub fn split(&self, step: Duration) -> Vec<TimeRange> {
        if step <= Duration::zero() {
            return vec![*self];
        }
        let mut windows = Vec::new();
        let mut cursor = self.from;
        while cursor < self.to {
            let end = (cursor + step).min(self.to);
            windows.push(TimeRange { from: cursor, to: end });
            cursor = end;
        }
        windows
    }
}

impl fmt::Display for TimeRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {})", format_instant(&self.from), format_instant(&self.to))
    }
}
