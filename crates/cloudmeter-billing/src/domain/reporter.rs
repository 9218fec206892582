use crate::domain::period::Period;
use crate::domain::types::{accrued_cost, AccountId, LedgerFilter, ResourceId, Rtype};
use crate::error::Result;
use crate::storage::LedgerTx;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::debug;

/// Cost one resource accrued inside a reporting window
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceCost {
    pub id: ResourceId,
    pub name: Option<String>,
    pub rtype: Rtype,
    pub parent_id: Option<ResourceId>,
    pub created_at: Option<DateTime<Utc>>,
    pub destroyed_at: Option<DateTime<Utc>>,
    pub cost: f64,
}

/// Per-account resource costs; accounts without contributing segments are absent.
pub type AccountCosts = BTreeMap<AccountId, Vec<ResourceCost>>;

/// Aggregate segment costs over `period` as seen at `now`.
///
/// Open segments accrue up to `now`. Rate segments are clipped to the
/// window and prorated; lump sums count in full whenever they overlap it.
pub async fn bill_on_interval(
    tx: &mut dyn LedgerTx,
    period: &Period,
    filter: &LedgerFilter,
    now: DateTime<Utc>,
) -> Result<AccountCosts> {
    if now <= period.start {
        return Ok(AccountCosts::new());
    }

    let rows = tx
        .segments_overlapping(period.start, period.end, filter)
        .await?;
    debug!(
        segments = rows.len(),
        period_start = %period.start,
        period_end = %period.end,
        "Loaded overlapping segments"
    );

    let mut costs: BTreeMap<ResourceId, (AccountId, ResourceCost)> = BTreeMap::new();
    for (segment, resource) in rows {
        let begin = segment.begin_at.max(period.start);
        let end = segment.end_at.unwrap_or(now).min(period.end).max(begin);
        let (_, entry) = costs.entry(resource.id).or_insert_with(|| {
            (
                resource.account_id,
                ResourceCost {
                    id: resource.id,
                    name: resource.name.clone(),
                    rtype: resource.rtype.clone(),
                    parent_id: resource.parent_id,
                    created_at: None,
                    destroyed_at: None,
                    cost: 0.0,
                },
            )
        });
        entry.cost += accrued_cost(segment.cost, begin, end);
    }

    let ids: Vec<ResourceId> = costs.keys().copied().collect();
    for bounds in tx.segment_bounds(&ids, filter).await? {
        if let Some((_, entry)) = costs.get_mut(&bounds.resource_id) {
            entry.created_at = Some(bounds.first_begin);
            entry.destroyed_at = bounds.destroyed_at();
        }
    }

    let mut report = AccountCosts::new();
    for (_, (account_id, cost)) in costs {
        // Resources without bounds fell out of scope between the two reads
        if cost.created_at.is_none() {
            continue;
        }
        report.entry(account_id).or_default().push(cost);
    }
    Ok(report)
}

/// Sum of every resource cost in a report.
pub fn total_cost(costs: &AccountCosts) -> f64 {
    costs.values().flatten().map(|c| c.cost).sum()
}
