use crate::error::{BillingError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// Length of an average Gregorian year, the unit linear costs are quoted in.
pub const SECONDS_PER_YEAR: f64 = 31_556_952.0;

/// Maximum length of a resource type, matching the `rtype` column width.
pub const RTYPE_MAX_LEN: usize = 16;

macro_rules! row_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(
            Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
        )]
        #[serde(transparent)]
        pub struct $name(i64);

        impl $name {
            pub fn new(id: i64) -> Self {
                Self(id)
            }

            pub fn as_i64(&self) -> i64 {
                self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl FromStr for $name {
            type Err = std::num::ParseIntError;

            fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
                Ok(Self(s.parse()?))
            }
        }
    };
}

row_id!(
    /// Cost center identifier
    CostCenterId
);
row_id!(
    /// Account identifier
    AccountId
);
row_id!(
    /// Resource identifier
    ResourceId
);
row_id!(
    /// Segment identifier
    SegmentId
);

/// Resource type such as `nova/instance` or `memory_mb`
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Rtype(String);

impl Rtype {
    pub fn parse(value: impl Into<String>) -> Result<Self> {
        let value = value.into();
        if value.is_empty() {
            return Err(BillingError::validation("rtype", "must not be empty"));
        }
        if value.chars().count() > RTYPE_MAX_LEN {
            return Err(BillingError::validation(
                "rtype",
                format!("`{}` is longer than {} characters", value, RTYPE_MAX_LEN),
            ));
        }
        Ok(Self(value))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for Rtype {
    type Error = BillingError;

    fn try_from(value: String) -> Result<Self> {
        Self::parse(value)
    }
}

impl From<Rtype> for String {
    fn from(value: Rtype) -> Self {
        value.0
    }
}

impl fmt::Display for Rtype {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Opaque attribute bag stored alongside a resource
pub type Attrs = Map<String, Value>;

/// Merge `incoming` into `stored`: new keys are added and existing keys are
/// overwritten. Returns whether anything changed.
pub fn merge_attrs(stored: &mut Attrs, incoming: &Attrs) -> bool {
    let mut changed = false;
    for (key, value) in incoming {
        if stored.get(key) != Some(value) {
            stored.insert(key.clone(), value.clone());
            changed = true;
        }
    }
    changed
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CostCenter {
    pub id: CostCenterId,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Account {
    pub id: AccountId,
    pub name: String,
    pub cost_center_id: Option<CostCenterId>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Resource {
    pub id: ResourceId,
    pub name: Option<String>,
    pub rtype: Rtype,
    pub account_id: AccountId,
    /// Snapshot of the account's cost center when the resource was created
    pub cost_center_id: Option<CostCenterId>,
    pub parent_id: Option<ResourceId>,
    #[serde(default)]
    pub attrs: Attrs,
}

/// Natural key of a resource; lookups and inserts go through it.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ResourceKey {
    pub account_id: AccountId,
    pub parent_id: Option<ResourceId>,
    pub rtype: Rtype,
    pub name: Option<String>,
}

#[derive(Debug, Clone)]
pub struct NewResource {
    pub key: ResourceKey,
    pub cost_center_id: Option<CostCenterId>,
}

/// How a segment's cost accrues
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CostKind {
    /// Currency per year, prorated by elapsed time
    Linear,
    Free,
    /// One-time charge attributed in full
    LumpSum,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Segment {
    pub id: SegmentId,
    pub resource_id: ResourceId,
    /// Positive: linear rate. Zero: free. Negative: lump sum.
    pub cost: f64,
    pub begin_at: DateTime<Utc>,
    pub end_at: Option<DateTime<Utc>>,
}

impl Segment {
    pub fn kind(&self) -> CostKind {
        cost_kind(self.cost)
    }

    pub fn is_open(&self) -> bool {
        self.end_at.is_none()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct NewSegment {
    pub resource_id: ResourceId,
    pub cost: f64,
    pub begin_at: DateTime<Utc>,
    pub end_at: Option<DateTime<Utc>>,
}

pub fn cost_kind(cost: f64) -> CostKind {
    if cost > 0.0 {
        CostKind::Linear
    } else if cost < 0.0 {
        CostKind::LumpSum
    } else {
        CostKind::Free
    }
}

/// Cost a segment contributes over `[begin, end]`.
///
/// Linear costs scale with the elapsed seconds; lump sums come back as the
/// stored (negative) value whatever the duration.
pub fn accrued_cost(cost: f64, begin: DateTime<Utc>, end: DateTime<Utc>) -> f64 {
    match cost_kind(cost) {
        CostKind::Linear => {
            let seconds = (end - begin).num_milliseconds() as f64 / 1000.0;
            cost * seconds / SECONDS_PER_YEAR
        }
        CostKind::Free | CostKind::LumpSum => cost,
    }
}

/// Current multiplier per resource type. Types without an entry cost 1.0.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TariffMap(BTreeMap<String, f64>);

impl TariffMap {
    pub const DEFAULT_MULTIPLIER: f64 = 1.0;

    pub fn new() -> Self {
        Self::default()
    }

    pub fn multiplier(&self, rtype: &str) -> f64 {
        self.0
            .get(rtype)
            .copied()
            .unwrap_or(Self::DEFAULT_MULTIPLIER)
    }

    pub fn get(&self, rtype: &str) -> Option<f64> {
        self.0.get(rtype).copied()
    }

    pub fn insert(&mut self, rtype: impl Into<String>, multiplier: f64) {
        self.0.insert(rtype.into(), multiplier);
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, f64)> {
        self.0.iter().map(|(k, v)| (k.as_str(), *v))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl FromIterator<(String, f64)> for TariffMap {
    fn from_iter<I: IntoIterator<Item = (String, f64)>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

/// Restricts ledger queries to one account and/or one cost center
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerFilter {
    pub account_id: Option<AccountId>,
    pub cost_center_id: Option<CostCenterId>,
}

impl LedgerFilter {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn account(account_id: AccountId) -> Self {
        Self {
            account_id: Some(account_id),
            cost_center_id: None,
        }
    }

    pub fn cost_center(cost_center_id: CostCenterId) -> Self {
        Self {
            account_id: None,
            cost_center_id: Some(cost_center_id),
        }
    }

    pub fn matches(&self, resource: &Resource) -> bool {
        self.account_id.map_or(true, |id| resource.account_id == id)
            && self
                .cost_center_id
                .map_or(true, |id| resource.cost_center_id == Some(id))
    }
}

/// Extremes of a resource's segment timeline
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SegmentBounds {
    pub resource_id: ResourceId,
    pub first_begin: DateTime<Utc>,
    pub last_begin: DateTime<Utc>,
    /// Latest end among closed segments, if any
    pub last_end: Option<DateTime<Utc>>,
}

impl SegmentBounds {
    /// The resource counts as destroyed only when its latest end comes after
    /// its latest begin.
    pub fn destroyed_at(&self) -> Option<DateTime<Utc>> {
        self.last_end.filter(|end| *end > self.last_begin)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};
    use serde_json::json;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2011, 1, 2, 0, 0, 0).unwrap()
    }

    #[test]
    fn test_linear_cost_is_prorated_by_year() {
        let cost = accrued_cost(512.0, t0(), t0() + Duration::hours(1));
        let expected = 512.0 * 3600.0 / SECONDS_PER_YEAR;
        assert!((cost - expected).abs() < 1e-12);

        let full_year = accrued_cost(10.0, t0(), t0() + Duration::seconds(31_556_952));
        assert!((full_year - 10.0).abs() < 1e-9);
    }

    #[test]
    fn test_lump_sum_ignores_duration() {
        assert_eq!(accrued_cost(-5.0, t0(), t0()), -5.0);
        assert_eq!(accrued_cost(-5.0, t0(), t0() + Duration::days(400)), -5.0);
        assert_eq!(accrued_cost(0.0, t0(), t0() + Duration::days(1)), 0.0);
    }

    #[test]
    fn test_cost_kind_by_sign() {
        assert_eq!(cost_kind(1.5), CostKind::Linear);
        assert_eq!(cost_kind(0.0), CostKind::Free);
        assert_eq!(cost_kind(-0.1), CostKind::LumpSum);
    }

    #[test]
    fn test_merge_attrs_overwrites_and_adds() {
        let mut stored = json!({"instance_type": "m1.small", "zone": "a"})
            .as_object()
            .cloned()
            .unwrap();
        let incoming = json!({"instance_type": "m1.large", "image": "ubuntu"})
            .as_object()
            .cloned()
            .unwrap();

        assert!(merge_attrs(&mut stored, &incoming));
        assert_eq!(
            Value::Object(stored.clone()),
            json!({"instance_type": "m1.large", "zone": "a", "image": "ubuntu"})
        );
        assert!(!merge_attrs(&mut stored, &incoming));
    }

    #[test]
    fn test_rtype_length_is_bounded() {
        assert!(Rtype::parse("nova/instance").is_ok());
        assert!(Rtype::parse("").is_err());
        assert!(Rtype::parse("x".repeat(RTYPE_MAX_LEN + 1)).is_err());

        let parsed: std::result::Result<Rtype, _> = serde_json::from_value(json!("memory_mb"));
        assert_eq!(parsed.unwrap().as_str(), "memory_mb");
    }

    #[test]
    fn test_tariff_defaults_to_one() {
        let mut tariffs = TariffMap::new();
        tariffs.insert("memory_mb", 2.0);
        assert_eq!(tariffs.multiplier("memory_mb"), 2.0);
        assert_eq!(tariffs.multiplier("vcpus"), 1.0);
        assert_eq!(tariffs.get("vcpus"), None);
    }

    #[test]
    fn test_destroyed_only_when_timeline_closed() {
        let closed = SegmentBounds {
            resource_id: ResourceId::new(1),
            first_begin: t0(),
            last_begin: t0(),
            last_end: Some(t0() + Duration::hours(2)),
        };
        assert_eq!(closed.destroyed_at(), Some(t0() + Duration::hours(2)));

        let reopened = SegmentBounds {
            last_begin: t0() + Duration::hours(2),
            ..closed
        };
        assert_eq!(reopened.destroyed_at(), None);

        let never_closed = SegmentBounds {
            last_end: None,
            ..closed
        };
        assert_eq!(never_closed.destroyed_at(), None);
    }
}
