use super::{AccountFilter, CostCenterFilter, LedgerStore, LedgerTx, ResourceFilter};
use crate::domain::types::{
    Account, AccountId, Attrs, CostCenter, CostCenterId, LedgerFilter, NewResource, NewSegment,
    Resource, ResourceId, Segment, SegmentBounds, SegmentId, TariffMap,
};
use crate::error::{BillingError, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};

#[derive(Debug, Clone, Default)]
struct LedgerState {
    cost_centers: BTreeMap<CostCenterId, CostCenter>,
    accounts: BTreeMap<AccountId, Account>,
    resources: BTreeMap<ResourceId, Resource>,
    segments: BTreeMap<SegmentId, Segment>,
    tariffs: TariffMap,
    last_id: i64,
}

impl LedgerState {
    fn next_id(&mut self) -> i64 {
        self.last_id += 1;
        self.last_id
    }
}

/// Ledger kept in process memory.
///
/// Transactions run one at a time: `begin` waits for the previous one to
/// finish, works on a private copy and publishes it on commit.
#[derive(Debug, Clone, Default)]
pub struct MemoryLedgerStore {
    state: Arc<Mutex<LedgerState>>,
}

impl MemoryLedgerStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every committed segment, ordered by id.
    pub async fn segments(&self) -> Vec<Segment> {
        self.state.lock().await.segments.values().cloned().collect()
    }

    /// Every committed resource, ordered by id.
    pub async fn resources(&self) -> Vec<Resource> {
        self.state.lock().await.resources.values().cloned().collect()
    }
}

#[async_trait]
impl LedgerStore for MemoryLedgerStore {
    async fn begin(&self) -> Result<Box<dyn LedgerTx>> {
        let guard = self.state.clone().lock_owned().await;
        let working = guard.clone();
        Ok(Box::new(MemoryLedgerTx { guard, working }))
    }
}

pub struct MemoryLedgerTx {
    guard: OwnedMutexGuard<LedgerState>,
    working: LedgerState,
}

fn cost_center_not_found(id: CostCenterId) -> BillingError {
    BillingError::CostCenterNotFound {
        selector: id.to_string(),
    }
}

#[async_trait]
impl LedgerTx for MemoryLedgerTx {
    async fn commit(self: Box<Self>) -> Result<()> {
        let MemoryLedgerTx { mut guard, working } = *self;
        *guard = working;
        Ok(())
    }

    async fn get_or_create_cost_center(&mut self, name: &str) -> Result<CostCenter> {
        let state = &mut self.working;
        if let Some(existing) = state.cost_centers.values().find(|cc| cc.name == name) {
            return Ok(existing.clone());
        }
        let cost_center = CostCenter {
            id: CostCenterId::new(state.next_id()),
            name: name.to_string(),
        };
        state
            .cost_centers
            .insert(cost_center.id, cost_center.clone());
        Ok(cost_center)
    }

    async fn find_cost_centers(&mut self, filter: &CostCenterFilter) -> Result<Vec<CostCenter>> {
        Ok(self
            .working
            .cost_centers
            .values()
            .filter(|cc| filter.matches(cc))
            .cloned()
            .collect())
    }

    async fn rename_cost_center(&mut self, id: CostCenterId, name: &str) -> Result<()> {
        let cost_center = self
            .working
            .cost_centers
            .get_mut(&id)
            .ok_or_else(|| cost_center_not_found(id))?;
        cost_center.name = name.to_string();
        Ok(())
    }

    async fn reassign_cost_center(
        &mut self,
        from: CostCenterId,
        to: CostCenterId,
    ) -> Result<u64> {
        let mut touched = 0;
        for account in self.working.accounts.values_mut() {
            if account.cost_center_id == Some(from) {
                account.cost_center_id = Some(to);
                touched += 1;
            }
        }
        for resource in self.working.resources.values_mut() {
            if resource.cost_center_id == Some(from) {
                resource.cost_center_id = Some(to);
                touched += 1;
            }
        }
        Ok(touched)
    }

    async fn delete_cost_center(&mut self, id: CostCenterId) -> Result<()> {
        self.working
            .cost_centers
            .remove(&id)
            .map(|_| ())
            .ok_or_else(|| cost_center_not_found(id))
    }

    async fn get_account(&mut self, id: AccountId) -> Result<Option<Account>> {
        Ok(self.working.accounts.get(&id).cloned())
    }

    async fn get_or_create_account(
        &mut self,
        name: &str,
        cost_center_id: Option<CostCenterId>,
    ) -> Result<Account> {
        let state = &mut self.working;
        if let Some(existing) = state.accounts.values().find(|a| a.name == name) {
            return Ok(existing.clone());
        }
        let account = Account {
            id: AccountId::new(state.next_id()),
            name: name.to_string(),
            cost_center_id,
        };
        state.accounts.insert(account.id, account.clone());
        Ok(account)
    }

    async fn find_accounts(&mut self, filter: &AccountFilter) -> Result<Vec<Account>> {
        Ok(self
            .working
            .accounts
            .values()
            .filter(|a| filter.matches(a))
            .cloned()
            .collect())
    }

    async fn rename_account(&mut self, id: AccountId, name: &str) -> Result<()> {
        let account = self
            .working
            .accounts
            .get_mut(&id)
            .ok_or_else(|| BillingError::AccountNotFound { id: id.to_string() })?;
        account.name = name.to_string();
        Ok(())
    }

    async fn get_or_create_resource(&mut self, resource: &NewResource) -> Result<Resource> {
        let state = &mut self.working;
        let key = &resource.key;
        let existing = state.resources.values().find(|r| {
            r.account_id == key.account_id
                && r.parent_id == key.parent_id
                && r.rtype == key.rtype
                && r.name == key.name
        });
        if let Some(existing) = existing {
            return Ok(existing.clone());
        }

        let created = Resource {
            id: ResourceId::new(state.next_id()),
            name: key.name.clone(),
            rtype: key.rtype.clone(),
            account_id: key.account_id,
            cost_center_id: resource.cost_center_id,
            parent_id: key.parent_id,
            attrs: Attrs::new(),
        };
        state.resources.insert(created.id, created.clone());
        Ok(created)
    }

    async fn find_resource(
        &mut self,
        rtype: &str,
        name: Option<&str>,
    ) -> Result<Option<Resource>> {
        let Some(name) = name else {
            return Ok(None);
        };
        Ok(self
            .working
            .resources
            .values()
            .find(|r| r.rtype.as_str() == rtype && r.name.as_deref() == Some(name))
            .cloned())
    }

    async fn find_resources(&mut self, filter: &ResourceFilter) -> Result<Vec<Resource>> {
        Ok(self
            .working
            .resources
            .values()
            .filter(|r| filter.matches(r))
            .cloned()
            .collect())
    }

    async fn set_resource_attrs(&mut self, id: ResourceId, attrs: &Attrs) -> Result<()> {
        let resource = self
            .working
            .resources
            .get_mut(&id)
            .ok_or_else(|| BillingError::ResourceNotFound {
                selector: id.to_string(),
            })?;
        resource.attrs = attrs.clone();
        Ok(())
    }

    async fn rename_resource(&mut self, id: ResourceId, name: &str) -> Result<()> {
        let resource = self
            .working
            .resources
            .get_mut(&id)
            .ok_or_else(|| BillingError::ResourceNotFound {
                selector: id.to_string(),
            })?;
        resource.name = Some(name.to_string());
        Ok(())
    }

    async fn end_open_segments(
        &mut self,
        resource_id: ResourceId,
        at: DateTime<Utc>,
    ) -> Result<u64> {
        let mut closed = 0;
        for segment in self.working.segments.values_mut() {
            if segment.resource_id == resource_id && segment.end_at.is_none() {
                segment.end_at = Some(at);
                closed += 1;
            }
        }
        Ok(closed)
    }

    async fn append_segment(&mut self, segment: &NewSegment) -> Result<Segment> {
        let state = &mut self.working;
        let created = Segment {
            id: SegmentId::new(state.next_id()),
            resource_id: segment.resource_id,
            cost: segment.cost,
            begin_at: segment.begin_at,
            end_at: segment.end_at,
        };
        state.segments.insert(created.id, created.clone());
        Ok(created)
    }

    async fn open_segments_by_rtype(&mut self, rtype: &str) -> Result<Vec<Segment>> {
        let state = &self.working;
        Ok(state
            .segments
            .values()
            .filter(|s| s.end_at.is_none())
            .filter(|s| {
                state
                    .resources
                    .get(&s.resource_id)
                    .map_or(false, |r| r.rtype.as_str() == rtype)
            })
            .cloned()
            .collect())
    }

    async fn close_segments(&mut self, ids: &[SegmentId], at: DateTime<Utc>) -> Result<u64> {
        let mut closed = 0;
        for id in ids {
            if let Some(segment) = self.working.segments.get_mut(id) {
                segment.end_at = Some(at);
                closed += 1;
            }
        }
        Ok(closed)
    }

    async fn set_segment_cost(&mut self, id: SegmentId, cost: f64) -> Result<()> {
        if let Some(segment) = self.working.segments.get_mut(&id) {
            segment.cost = cost;
        }
        Ok(())
    }

    async fn segments_for_resource(&mut self, resource_id: ResourceId) -> Result<Vec<Segment>> {
        let mut segments: Vec<Segment> = self
            .working
            .segments
            .values()
            .filter(|s| s.resource_id == resource_id)
            .cloned()
            .collect();
        segments.sort_by_key(|s| (s.begin_at, s.id));
        Ok(segments)
    }

    async fn segments_overlapping(
        &mut self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        filter: &LedgerFilter,
    ) -> Result<Vec<(Segment, Resource)>> {
        let state = &self.working;
        let mut rows: Vec<(Segment, Resource)> = state
            .segments
            .values()
            .filter(|s| s.begin_at < end && s.end_at.map_or(true, |e| e > start))
            .filter_map(|s| {
                let resource = state.resources.get(&s.resource_id)?;
                filter
                    .matches(resource)
                    .then(|| (s.clone(), resource.clone()))
            })
            .collect();
        rows.sort_by_key(|(s, r)| (r.id, s.begin_at, s.id));
        Ok(rows)
    }

    async fn segment_bounds(
        &mut self,
        resource_ids: &[ResourceId],
        filter: &LedgerFilter,
    ) -> Result<Vec<SegmentBounds>> {
        let state = &self.working;
        let mut bounds: BTreeMap<ResourceId, SegmentBounds> = BTreeMap::new();
        for segment in state.segments.values() {
            if !resource_ids.contains(&segment.resource_id) {
                continue;
            }
            let in_scope = state
                .resources
                .get(&segment.resource_id)
                .map_or(false, |r| filter.matches(r));
            if !in_scope {
                continue;
            }

            let entry = bounds
                .entry(segment.resource_id)
                .or_insert_with(|| SegmentBounds {
                    resource_id: segment.resource_id,
                    first_begin: segment.begin_at,
                    last_begin: segment.begin_at,
                    last_end: None,
                });
            entry.first_begin = entry.first_begin.min(segment.begin_at);
            entry.last_begin = entry.last_begin.max(segment.begin_at);
            if let Some(end) = segment.end_at {
                entry.last_end = Some(entry.last_end.map_or(end, |last| last.max(end)));
            }
        }
        Ok(bounds.into_values().collect())
    }

    async fn tariff_map(&mut self) -> Result<TariffMap> {
        Ok(self.working.tariffs.clone())
    }

    async fn set_tariff(&mut self, rtype: &str, multiplier: f64) -> Result<()> {
        self.working.tariffs.insert(rtype, multiplier);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::types::{ResourceKey, Rtype};

    fn key(account_id: AccountId, name: &str) -> NewResource {
        NewResource {
            key: ResourceKey {
                account_id,
                parent_id: None,
                rtype: Rtype::parse("nova/instance").unwrap(),
                name: Some(name.to_string()),
            },
            cost_center_id: None,
        }
    }

    #[tokio::test]
    async fn test_dropped_transaction_rolls_back() {
        let store = MemoryLedgerStore::new();
        {
            let mut tx = store.begin().await.unwrap();
            tx.get_or_create_account("tenant", None).await.unwrap();
        }
        let mut tx = store.begin().await.unwrap();
        let accounts = tx.find_accounts(&AccountFilter::default()).await.unwrap();
        assert!(accounts.is_empty());
    }

    #[tokio::test]
    async fn test_resource_upsert_is_keyed() {
        let store = MemoryLedgerStore::new();
        let mut tx = store.begin().await.unwrap();
        let account = tx.get_or_create_account("tenant", None).await.unwrap();

        let first = tx.get_or_create_resource(&key(account.id, "vm1")).await.unwrap();
        let again = tx.get_or_create_resource(&key(account.id, "vm1")).await.unwrap();
        let other = tx.get_or_create_resource(&key(account.id, "vm2")).await.unwrap();
        tx.commit().await.unwrap();

        assert_eq!(first.id, again.id);
        assert_ne!(first.id, other.id);
        assert_eq!(store.resources().await.len(), 2);
    }

    #[tokio::test]
    async fn test_find_resource_requires_a_name() {
        let store = MemoryLedgerStore::new();
        let mut tx = store.begin().await.unwrap();
        let account = tx.get_or_create_account("tenant", None).await.unwrap();
        tx.get_or_create_resource(&key(account.id, "vm1")).await.unwrap();

        assert!(tx
            .find_resource("nova/instance", Some("vm1"))
            .await
            .unwrap()
            .is_some());
        assert!(tx.find_resource("nova/instance", None).await.unwrap().is_none());
        assert!(tx.find_resource("volume", Some("vm1")).await.unwrap().is_none());
    }
}
