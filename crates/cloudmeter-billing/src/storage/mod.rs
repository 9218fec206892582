pub mod memory;
pub mod postgres;
pub mod rds;

pub use memory::MemoryLedgerStore;
pub use postgres::{PgLedgerStore, PgLedgerTx};
pub use rds::RdsConnection;

use crate::domain::types::{
    Account, AccountId, Attrs, CostCenter, CostCenterId, LedgerFilter, NewResource, NewSegment,
    Resource, ResourceId, Segment, SegmentBounds, SegmentId, TariffMap,
};
use crate::error::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Column filter for cost center listings
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CostCenterFilter {
    pub id: Option<CostCenterId>,
    pub name: Option<String>,
}

/// Column filter for account listings
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountFilter {
    pub id: Option<AccountId>,
    pub name: Option<String>,
    pub cost_center_id: Option<CostCenterId>,
}

/// Column filter for resource listings
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceFilter {
    pub id: Option<ResourceId>,
    pub name: Option<String>,
    pub rtype: Option<String>,
    pub parent_id: Option<ResourceId>,
    pub account_id: Option<AccountId>,
    pub cost_center_id: Option<CostCenterId>,
}

impl CostCenterFilter {
    pub fn is_empty(&self) -> bool {
        self.id.is_none() && self.name.is_none()
    }

    pub fn matches(&self, cost_center: &CostCenter) -> bool {
        self.id.map_or(true, |id| cost_center.id == id)
            && self.name.as_ref().map_or(true, |name| &cost_center.name == name)
    }
}

impl AccountFilter {
    pub fn is_empty(&self) -> bool {
        self.id.is_none() && self.name.is_none() && self.cost_center_id.is_none()
    }

    pub fn matches(&self, account: &Account) -> bool {
        self.id.map_or(true, |id| account.id == id)
            && self.name.as_ref().map_or(true, |name| &account.name == name)
            && self
                .cost_center_id
                .map_or(true, |id| account.cost_center_id == Some(id))
    }
}

impl ResourceFilter {
    pub fn is_empty(&self) -> bool {
        self.id.is_none()
            && self.name.is_none()
            && self.rtype.is_none()
            && self.parent_id.is_none()
            && self.account_id.is_none()
            && self.cost_center_id.is_none()
    }

    pub fn matches(&self, resource: &Resource) -> bool {
        self.id.map_or(true, |id| resource.id == id)
            && self
                .name
                .as_ref()
                .map_or(true, |name| resource.name.as_ref() == Some(name))
            && self
                .rtype
                .as_ref()
                .map_or(true, |rtype| resource.rtype.as_str() == rtype)
            && self.parent_id.map_or(true, |id| resource.parent_id == Some(id))
            && self.account_id.map_or(true, |id| resource.account_id == id)
            && self
                .cost_center_id
                .map_or(true, |id| resource.cost_center_id == Some(id))
    }
}

/// Opens units of work against the ledger tables.
#[async_trait]
pub trait LedgerStore: Send + Sync {
    async fn begin(&self) -> Result<Box<dyn LedgerTx>>;
}

/// One transaction over the ledger tables.
///
/// Nothing is visible to other transactions until [`LedgerTx::commit`];
/// dropping the value rolls every statement back.
#[async_trait]
pub trait LedgerTx: Send {
    async fn commit(self: Box<Self>) -> Result<()>;

    // Cost centers
    async fn get_or_create_cost_center(&mut self, name: &str) -> Result<CostCenter>;
    async fn find_cost_centers(&mut self, filter: &CostCenterFilter) -> Result<Vec<CostCenter>>;
    async fn rename_cost_center(&mut self, id: CostCenterId, name: &str) -> Result<()>;
    /// Re-point accounts and resources from `from` to `to`; returns rows touched.
    async fn reassign_cost_center(&mut self, from: CostCenterId, to: CostCenterId)
        -> Result<u64>;
    async fn delete_cost_center(&mut self, id: CostCenterId) -> Result<()>;

    // Accounts
    async fn get_account(&mut self, id: AccountId) -> Result<Option<Account>>;
    /// Existing accounts are returned untouched, whatever `cost_center_id` says.
    async fn get_or_create_account(
        &mut self,
        name: &str,
        cost_center_id: Option<CostCenterId>,
    ) -> Result<Account>;
    async fn find_accounts(&mut self, filter: &AccountFilter) -> Result<Vec<Account>>;
    async fn rename_account(&mut self, id: AccountId, name: &str) -> Result<()>;

    // Resources
    /// Atomic lookup-or-insert on the resource's natural key.
    async fn get_or_create_resource(&mut self, resource: &NewResource) -> Result<Resource>;
    /// First resource with this type and name in any account.
    async fn find_resource(&mut self, rtype: &str, name: Option<&str>)
        -> Result<Option<Resource>>;
    async fn find_resources(&mut self, filter: &ResourceFilter) -> Result<Vec<Resource>>;
    async fn set_resource_attrs(&mut self, id: ResourceId, attrs: &Attrs) -> Result<()>;
    async fn rename_resource(&mut self, id: ResourceId, name: &str) -> Result<()>;

    // Segments
    /// Close every open segment of the resource at `at`; returns how many.
    async fn end_open_segments(&mut self, resource_id: ResourceId, at: DateTime<Utc>)
        -> Result<u64>;
    async fn append_segment(&mut self, segment: &NewSegment) -> Result<Segment>;
    /// Open segments of resources of this type, locked for update.
    async fn open_segments_by_rtype(&mut self, rtype: &str) -> Result<Vec<Segment>>;
    async fn close_segments(&mut self, ids: &[SegmentId], at: DateTime<Utc>) -> Result<u64>;
    async fn set_segment_cost(&mut self, id: SegmentId, cost: f64) -> Result<()>;
    async fn segments_for_resource(&mut self, resource_id: ResourceId) -> Result<Vec<Segment>>;
    /// Segments overlapping `[start, end)` with their resource, ordered by
    /// resource id then begin time.
    async fn segments_overlapping(
        &mut self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        filter: &LedgerFilter,
    ) -> Result<Vec<(Segment, Resource)>>;
    async fn segment_bounds(
        &mut self,
        resource_ids: &[ResourceId],
        filter: &LedgerFilter,
    ) -> Result<Vec<SegmentBounds>>;

    // Tariffs
    async fn tariff_map(&mut self) -> Result<TariffMap>;
    async fn set_tariff(&mut self, rtype: &str, multiplier: f64) -> Result<()>;
}
