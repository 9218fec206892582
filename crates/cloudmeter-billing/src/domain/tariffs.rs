use crate::domain::types::{NewSegment, Rtype, SegmentId, TariffMap};
use crate::error::Result;
use crate::storage::LedgerTx;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{debug, info, warn};

/// Multipliers closer to zero than this are treated as 1.0 when dividing.
pub const RATIO_EPSILON: f64 = 1e-12;

pub fn safe_divisor(multiplier: f64) -> f64 {
    if multiplier.abs() < RATIO_EPSILON {
        1.0
    } else {
        multiplier
    }
}

/// A resource type whose multiplier moved
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TariffChange {
    pub rtype: String,
    pub old: f64,
    pub new: f64,
}

impl TariffChange {
    /// Factor applied to the cost of segments still open at the switch.
    pub fn ratio(&self) -> f64 {
        self.new / safe_divisor(self.old)
    }
}

/// Entries of `new` whose multiplier differs from `old`; types missing from
/// `old` compare against the default of 1.0.
pub fn changed_tariffs(old: &TariffMap, new: &TariffMap) -> Vec<TariffChange> {
    new.iter()
        .filter_map(|(rtype, multiplier)| {
            let previous = old.multiplier(rtype);
            (previous != multiplier).then(|| TariffChange {
                rtype: rtype.to_string(),
                old: previous,
                new: multiplier,
            })
        })
        .collect()
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MigrationSummary {
    pub changes: Vec<TariffChange>,
    /// Segments closed at the switch and continued by a re-rated copy
    pub segments_split: usize,
    /// Segments starting at or after the switch, re-rated in place
    pub segments_rerated: usize,
}

/// Re-rate every open segment of each changed resource type at `at`.
///
/// The affected segments are read once, locked, and then split or updated
/// strictly by id, so rows inserted here are never mistaken for old ones.
pub async fn migrate_tariffs(
    tx: &mut dyn LedgerTx,
    old: &TariffMap,
    new: &TariffMap,
    at: DateTime<Utc>,
) -> Result<MigrationSummary> {
    let mut summary = MigrationSummary::default();

    for change in changed_tariffs(old, new) {
        let ratio = change.ratio();
        let open = tx.open_segments_by_rtype(&change.rtype).await?;

        let mut split: Vec<SegmentId> = Vec::new();
        for segment in &open {
            let cost = segment.cost * ratio;
            if segment.begin_at < at {
                tx.append_segment(&NewSegment {
                    resource_id: segment.resource_id,
                    cost,
                    begin_at: at,
                    end_at: None,
                })
                .await?;
                split.push(segment.id);
            } else {
                tx.set_segment_cost(segment.id, cost).await?;
                summary.segments_rerated += 1;
            }
        }
        if !split.is_empty() {
            tx.close_segments(&split, at).await?;
        }

        debug!(
            rtype = %change.rtype,
            ratio,
            split = split.len(),
            open = open.len(),
            "Migrated open segments"
        );
        summary.segments_split += split.len();
        summary.changes.push(change);
    }

    Ok(summary)
}

/// Outcome of a tariff update
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TariffUpdate {
    /// Full table after the update
    pub tariffs: TariffMap,
    pub applied: Vec<String>,
    pub ignored: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub migration: Option<MigrationSummary>,
}

/// Upsert the numeric entries of `values`, then optionally migrate open
/// segments from the previous table to the new one.
pub async fn update_tariffs(
    tx: &mut dyn LedgerTx,
    values: &Map<String, Value>,
    migrate: bool,
    at: DateTime<Utc>,
) -> Result<TariffUpdate> {
    let old = tx.tariff_map().await?;
    let mut tariffs = old.clone();
    let mut applied: Vec<String> = Vec::new();
    let mut ignored: Vec<String> = Vec::new();

    for (rtype, value) in values {
        let Some(multiplier) = value.as_f64() else {
            warn!(rtype = %rtype, value = %value, "Ignoring non-numeric tariff");
            ignored.push(rtype.clone());
            continue;
        };
        let rtype = Rtype::parse(rtype.as_str())?;
        tx.set_tariff(rtype.as_str(), multiplier).await?;
        tariffs.insert(rtype.as_str(), multiplier);
        applied.push(String::from(rtype));
    }

    let migration = if migrate {
        Some(migrate_tariffs(tx, &old, &tariffs, at).await?)
    } else {
        None
    };

    info!(
        applied = applied.len(),
        ignored = ignored.len(),
        migrated = migrate,
        "Updated tariffs"
    );
    Ok(TariffUpdate {
        tariffs,
        applied,
        ignored,
        migration,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn map(entries: &[(&str, f64)]) -> TariffMap {
        entries
            .iter()
            .map(|(k, v)| (k.to_string(), *v))
            .collect()
    }

    #[test]
    fn test_safe_divisor_guards_zero() {
        assert_eq!(safe_divisor(0.0), 1.0);
        assert_eq!(safe_divisor(1e-13), 1.0);
        assert_eq!(safe_divisor(-1e-13), 1.0);
        assert_eq!(safe_divisor(0.5), 0.5);
    }

    #[test]
    fn test_ratio_from_zero_multiplier() {
        let change = TariffChange {
            rtype: "vcpus".to_string(),
            old: 0.0,
            new: 3.0,
        };
        assert_eq!(change.ratio(), 3.0);
    }

    #[test]
    fn test_only_changed_types_are_reported() {
        let old = map(&[("memory_mb", 1.0), ("vcpus", 2.0)]);
        let new = map(&[("memory_mb", 2.0), ("vcpus", 2.0), ("disk", 1.0), ("net", 4.0)]);

        let changes = changed_tariffs(&old, &new);
        assert_eq!(
            changes,
            vec![
                TariffChange {
                    rtype: "memory_mb".to_string(),
                    old: 1.0,
                    new: 2.0,
                },
                TariffChange {
                    rtype: "net".to_string(),
                    old: 1.0,
                    new: 4.0,
                },
            ]
        );
    }
}
