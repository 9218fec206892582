use crate::domain::period::parse_datetime;
use crate::domain::types::{
    merge_attrs, AccountId, Attrs, CostCenterId, NewResource, NewSegment, Resource, ResourceId,
    ResourceKey, Rtype, TariffMap,
};
use crate::error::{BillingError, Result};
use crate::storage::LedgerTx;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use std::collections::BTreeMap;
use tracing::{debug, warn};

/// One node of an incoming usage tree.
///
/// `fixed` distinguishes an absent key (`None`) from an explicit `null`
/// (`Some(None)`), which terminates the resource's billing.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UsageNode {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rtype: Option<String>,
    #[serde(
        default,
        deserialize_with = "scalar_name",
        skip_serializing_if = "Option::is_none"
    )]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attrs: Option<Attrs>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub linear: Option<f64>,
    #[serde(
        default,
        deserialize_with = "explicit_null",
        skip_serializing_if = "Option::is_none"
    )]
    pub fixed: Option<Option<f64>>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub children: Vec<UsageNode>,
}

/// What a node asks the ledger to do with its resource's segments
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SegmentAction {
    /// Close open segments, open a rate segment
    Linear(f64),
    /// Close open segments, open a lump-sum (or free) segment
    Fixed(f64),
    /// Close open segments and stop billing
    Close,
    /// Leave segments alone
    Keep,
}

impl UsageNode {
    pub fn action(&self) -> SegmentAction {
        match (self.linear, self.fixed) {
            (Some(value), _) => SegmentAction::Linear(value),
            (None, Some(Some(value))) => SegmentAction::Fixed(value),
            (None, Some(None)) => SegmentAction::Close,
            (None, None) => SegmentAction::Keep,
        }
    }
}

impl SegmentAction {
    /// Signed segment cost under `multiplier`, or `None` when no segment opens.
    pub fn segment_cost(&self, multiplier: f64) -> Option<f64> {
        let cost = match *self {
            SegmentAction::Linear(value) => value * multiplier,
            SegmentAction::Fixed(value) => -value * multiplier,
            SegmentAction::Close | SegmentAction::Keep => return None,
        };
        // Collapse -0.0 so a free segment reads as 0
        Some(if cost == 0.0 { 0.0 } else { cost })
    }
}

/// A usage tree together with the account and time it applies to
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UsageEvent {
    #[serde(flatten)]
    pub node: UsageNode,
    #[serde(
        default,
        deserialize_with = "lenient_datetime",
        skip_serializing_if = "Option::is_none"
    )]
    pub datetime: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub account_id: Option<AccountId>,
    #[serde(default, alias = "account", skip_serializing_if = "Option::is_none")]
    pub account_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cost_center_name: Option<String>,
}

/// How an event names its account
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AccountRef {
    Id(AccountId),
    Name {
        name: String,
        cost_center_name: Option<String>,
    },
    /// Borrow the account of an existing resource with the same type and name
    Infer,
}

impl UsageEvent {
    pub fn account_ref(&self) -> AccountRef {
        if let Some(id) = self.account_id {
            return AccountRef::Id(id);
        }
        match &self.account_name {
            Some(name) => AccountRef::Name {
                name: name.clone(),
                cost_center_name: self.cost_center_name.clone(),
            },
            None => AccountRef::Infer,
        }
    }
}

/// Account, cost center and time a walk runs under
#[derive(Debug, Clone, Copy)]
pub struct EventContext<'a> {
    pub account_id: AccountId,
    pub cost_center_id: Option<CostCenterId>,
    pub datetime: DateTime<Utc>,
    pub tariffs: &'a TariffMap,
}

/// Resources touched by one walk, keyed by id
#[derive(Debug, Clone)]
pub struct ProcessedEvent {
    pub root: ResourceId,
    pub resources: BTreeMap<ResourceId, Resource>,
    pub segments_opened: u64,
    pub segments_closed: u64,
}

impl ProcessedEvent {
    pub fn root(&self) -> Option<&Resource> {
        self.resources.get(&self.root)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WalkMode {
    Meter,
    DeclareOnly,
}

/// Applies usage trees to the resource tree and the segment ledger
#[derive(Debug, Clone)]
pub struct EventProcessor {
    max_depth: usize,
}

impl EventProcessor {
    pub fn new(max_depth: usize) -> Self {
        Self { max_depth }
    }

    /// Walk `node` depth-first, upserting resources and opening or closing
    /// segments as each node asks.
    pub async fn process(
        &self,
        tx: &mut dyn LedgerTx,
        node: &UsageNode,
        ctx: &EventContext<'_>,
    ) -> Result<ProcessedEvent> {
        self.walk(tx, node, ctx, WalkMode::Meter).await
    }

    /// Same walk without touching segments.
    pub async fn declare(
        &self,
        tx: &mut dyn LedgerTx,
        node: &UsageNode,
        ctx: &EventContext<'_>,
    ) -> Result<ProcessedEvent> {
        self.walk(tx, node, ctx, WalkMode::DeclareOnly).await
    }

    async fn walk(
        &self,
        tx: &mut dyn LedgerTx,
        node: &UsageNode,
        ctx: &EventContext<'_>,
        mode: WalkMode,
    ) -> Result<ProcessedEvent> {
        if node.rtype.is_none() {
            return Err(BillingError::validation("rtype", "event root has no rtype"));
        }

        let mut resources = BTreeMap::new();
        let mut root = None;
        let mut segments_opened = 0;
        let mut segments_closed = 0;

        let mut stack: Vec<(&UsageNode, Option<ResourceId>, usize)> = vec![(node, None, 0)];
        while let Some((node, parent_id, depth)) = stack.pop() {
            if depth >= self.max_depth {
                return Err(BillingError::validation(
                    "children",
                    format!("event tree is nested deeper than {} levels", self.max_depth),
                ));
            }

            let Some(rtype) = node.rtype.as_deref() else {
                warn!(
                    parent_id = ?parent_id,
                    children = node.children.len(),
                    "Skipping usage node without rtype"
                );
                continue;
            };
            let rtype = Rtype::parse(rtype)?;

            let mut resource = tx
                .get_or_create_resource(&NewResource {
                    key: ResourceKey {
                        account_id: ctx.account_id,
                        parent_id,
                        rtype,
                        name: node.name.clone(),
                    },
                    cost_center_id: ctx.cost_center_id,
                })
                .await?;

            if let Some(attrs) = &node.attrs {
                if merge_attrs(&mut resource.attrs, attrs) {
                    tx.set_resource_attrs(resource.id, &resource.attrs).await?;
                }
            }

            if mode == WalkMode::Meter {
                let action = node.action();
                if action != SegmentAction::Keep {
                    segments_closed += tx.end_open_segments(resource.id, ctx.datetime).await?;
                }
                let multiplier = ctx.tariffs.multiplier(resource.rtype.as_str());
                if let Some(cost) = action.segment_cost(multiplier) {
                    tx.append_segment(&NewSegment {
                        resource_id: resource.id,
                        cost,
                        begin_at: ctx.datetime,
                        end_at: None,
                    })
                    .await?;
                    segments_opened += 1;
                }
                debug!(
                    resource_id = %resource.id,
                    rtype = %resource.rtype,
                    ?action,
                    "Applied usage node"
                );
            }

            for child in node.children.iter().rev() {
                stack.push((child, Some(resource.id), depth + 1));
            }
            root.get_or_insert(resource.id);
            resources.insert(resource.id, resource);
        }

        let root = root.ok_or_else(|| BillingError::validation("rtype", "event root has no rtype"))?;
        Ok(ProcessedEvent {
            root,
            resources,
            segments_opened,
            segments_closed,
        })
    }
}

fn explicit_null<'de, D, T>(deserializer: D) -> std::result::Result<Option<Option<T>>, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de>,
{
    Option::<T>::deserialize(deserializer).map(Some)
}

fn scalar_name<'de, D>(deserializer: D) -> std::result::Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Scalar {
        Text(String),
        Integer(i64),
        Float(f64),
    }

    Ok(Option::<Scalar>::deserialize(deserializer)?.map(|scalar| match scalar {
        Scalar::Text(text) => text,
        Scalar::Integer(value) => value.to_string(),
        Scalar::Float(value) => value.to_string(),
    }))
}

fn lenient_datetime<'de, D>(deserializer: D) -> std::result::Result<Option<DateTime<Utc>>, D::Error>
where
    D: Deserializer<'de>,
{
    match Option::<String>::deserialize(deserializer)? {
        None => Ok(None),
        Some(raw) => parse_datetime(&raw)
            .map(Some)
            .ok_or_else(|| serde::de::Error::custom(format!("invalid datetime `{}`", raw))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{LedgerStore, MemoryLedgerStore};
    use chrono::TimeZone;
    use serde_json::json;

    fn node(value: serde_json::Value) -> UsageNode {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn test_fixed_null_differs_from_absent() {
        assert_eq!(node(json!({"rtype": "a", "fixed": null})).action(), SegmentAction::Close);
        assert_eq!(node(json!({"rtype": "a"})).action(), SegmentAction::Keep);
        assert_eq!(
            node(json!({"rtype": "a", "fixed": 0})).action(),
            SegmentAction::Fixed(0.0)
        );
        assert_eq!(
            node(json!({"rtype": "a", "linear": 2, "fixed": 3})).action(),
            SegmentAction::Linear(2.0)
        );
    }

    #[test]
    fn test_segment_cost_signs() {
        assert_eq!(SegmentAction::Linear(512.0).segment_cost(2.0), Some(1024.0));
        assert_eq!(SegmentAction::Fixed(5.0).segment_cost(2.0), Some(-10.0));
        let free = SegmentAction::Fixed(0.0).segment_cost(3.0).unwrap();
        assert!(free == 0.0 && free.is_sign_positive());
        assert_eq!(SegmentAction::Close.segment_cost(1.0), None);
    }

    #[test]
    fn test_numeric_names_become_strings() {
        assert_eq!(node(json!({"rtype": "a", "name": 42})).name.as_deref(), Some("42"));
        assert_eq!(node(json!({"rtype": "a", "name": null})).name, None);
    }

    #[test]
    fn test_event_envelope() {
        let event: UsageEvent = serde_json::from_value(json!({
            "rtype": "nova/instance",
            "name": "vm1",
            "fixed": null,
            "account": "tenant-A",
            "cost_center_name": "ops",
            "datetime": "2011-01-02 03:04:05",
            "children": [{"rtype": "memory_mb", "linear": 512}]
        }))
        .unwrap();

        assert_eq!(event.node.action(), SegmentAction::Close);
        assert_eq!(event.node.children.len(), 1);
        assert_eq!(
            event.datetime,
            Some(Utc.with_ymd_and_hms(2011, 1, 2, 3, 4, 5).unwrap())
        );
        assert_eq!(
            event.account_ref(),
            AccountRef::Name {
                name: "tenant-A".to_string(),
                cost_center_name: Some("ops".to_string()),
            }
        );

        let by_id: UsageEvent =
            serde_json::from_value(json!({"rtype": "a", "account_id": 7, "account": "x"}))
                .unwrap();
        assert_eq!(by_id.account_ref(), AccountRef::Id(AccountId::new(7)));

        let bad = serde_json::from_value::<UsageEvent>(json!({"rtype": "a", "datetime": "soon"}));
        assert!(bad.is_err());
    }

    #[tokio::test]
    async fn test_walk_skips_nodes_without_rtype() {
        let store = MemoryLedgerStore::new();
        let mut tx = store.begin().await.unwrap();
        let account = tx.get_or_create_account("tenant", None).await.unwrap();
        let tariffs = TariffMap::new();
        let ctx = EventContext {
            account_id: account.id,
            cost_center_id: None,
            datetime: Utc.with_ymd_and_hms(2011, 1, 1, 0, 0, 0).unwrap(),
            tariffs: &tariffs,
        };

        let tree = node(json!({
            "rtype": "nova/instance",
            "name": "vm1",
            "fixed": 0,
            "children": [
                {"name": "orphan", "children": [{"rtype": "vcpus", "linear": 1}]},
                {"rtype": "memory_mb", "linear": 512}
            ]
        }));
        let processed = EventProcessor::new(8)
            .process(tx.as_mut(), &tree, &ctx)
            .await
            .unwrap();

        let rtypes: Vec<&str> = processed
            .resources
            .values()
            .map(|r| r.rtype.as_str())
            .collect();
        assert_eq!(rtypes, vec!["nova/instance", "memory_mb"]);
        assert_eq!(processed.segments_opened, 2);
        assert_eq!(processed.root().unwrap().name.as_deref(), Some("vm1"));
    }

    #[tokio::test]
    async fn test_walk_rejects_missing_root_rtype_and_deep_trees() {
        let store = MemoryLedgerStore::new();
        let mut tx = store.begin().await.unwrap();
        let account = tx.get_or_create_account("tenant", None).await.unwrap();
        let tariffs = TariffMap::new();
        let ctx = EventContext {
            account_id: account.id,
            cost_center_id: None,
            datetime: Utc::now(),
            tariffs: &tariffs,
        };
        let processor = EventProcessor::new(2);

        let err = processor
            .process(tx.as_mut(), &node(json!({"name": "x"})), &ctx)
            .await
            .unwrap_err();
        assert!(err.is_rejection());

        let deep = node(json!({
            "rtype": "a",
            "children": [{"rtype": "b", "children": [{"rtype": "c"}]}]
        }));
        let err = processor.process(tx.as_mut(), &deep, &ctx).await.unwrap_err();
        assert!(matches!(err, BillingError::ValidationError { .. }));
    }
}
