use crate::config::LedgerConfig;
use crate::domain::directory::{self, CostCenterMerge, Selector};
use crate::domain::events::{EventContext, EventProcessor, ProcessedEvent, UsageEvent};
use crate::domain::period::Period;
use crate::domain::reporter::{self, AccountCosts, ResourceCost};
use crate::domain::tariffs::{self, MigrationSummary, TariffUpdate};
use crate::domain::types::{
    Account, AccountId, CostCenter, CostCenterId, LedgerFilter, Resource, ResourceId, Segment,
    TariffMap,
};
use crate::error::{BillingError, Result};
use crate::storage::{AccountFilter, CostCenterFilter, LedgerStore, LedgerTx, ResourceFilter};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::info;

/// Acknowledgement returned for a processed event or declaration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventReceipt {
    pub account_id: AccountId,
    pub rtype: String,
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub datetime: Option<DateTime<Utc>>,
    pub resource_ids: Vec<ResourceId>,
}

/// Restricts a report to one account, or else to one cost center
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReportFilter {
    pub account: Option<Selector<AccountId>>,
    pub cost_center: Option<Selector<CostCenterId>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AccountReport {
    pub id: AccountId,
    pub name: Option<String>,
    pub resources: Vec<ResourceCost>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Report {
    pub period_start: DateTime<Utc>,
    pub period_end: DateTime<Utc>,
    pub accounts: Vec<AccountReport>,
}

impl Report {
    pub fn total_cost(&self) -> f64 {
        self.accounts
            .iter()
            .flat_map(|a| a.resources.iter())
            .map(|r| r.cost)
            .sum()
    }
}

/// Entry point to the ledger: every call runs in one transaction
#[derive(Clone)]
pub struct LedgerService {
    store: Arc<dyn LedgerStore>,
    processor: EventProcessor,
}

impl LedgerService {
    pub fn new(store: Arc<dyn LedgerStore>, config: &LedgerConfig) -> Self {
        Self {
            store,
            processor: EventProcessor::new(config.max_event_depth),
        }
    }

    pub fn store(&self) -> &Arc<dyn LedgerStore> {
        &self.store
    }

    /// Book a usage event: resolve its account, walk its tree and apply the
    /// segment changes, all or nothing.
    pub async fn process_event(&self, event: &UsageEvent) -> Result<EventReceipt> {
        let datetime = event.datetime.ok_or_else(|| {
            BillingError::validation("datetime", "valid datetime must be specified")
        })?;

        let mut tx = self.store.begin().await?;
        let (account_id, processed) = self.walk(tx.as_mut(), event, datetime, true).await?;
        tx.commit().await?;

        info!(
            account_id = %account_id,
            resources = processed.resources.len(),
            opened = processed.segments_opened,
            closed = processed.segments_closed,
            datetime = %datetime,
            "Processed usage event"
        );
        Ok(receipt(event, account_id, processed, Some(datetime)))
    }

    /// Record the resources of a usage tree without touching segments.
    pub async fn create_resource_only(&self, event: &UsageEvent) -> Result<EventReceipt> {
        let datetime = event.datetime.unwrap_or_else(Utc::now);

        let mut tx = self.store.begin().await?;
        let (account_id, processed) = self.walk(tx.as_mut(), event, datetime, false).await?;
        tx.commit().await?;

        info!(
            account_id = %account_id,
            resources = processed.resources.len(),
            "Declared resources"
        );
        Ok(receipt(event, account_id, processed, None))
    }

    async fn walk(
        &self,
        tx: &mut dyn LedgerTx,
        event: &UsageEvent,
        datetime: DateTime<Utc>,
        meter: bool,
    ) -> Result<(AccountId, ProcessedEvent)> {
        let rtype = event
            .node
            .rtype
            .as_deref()
            .ok_or_else(|| BillingError::validation("rtype", "rtype must be specified"))?;

        let account = directory::resolve_account(
            tx,
            &event.account_ref(),
            rtype,
            event.node.name.as_deref(),
        )
        .await?;
        let tariffs = tx.tariff_map().await?;
        let ctx = EventContext {
            account_id: account.account_id,
            cost_center_id: account.cost_center_id,
            datetime,
            tariffs: &tariffs,
        };

        let processed = if meter {
            self.processor.process(tx, &event.node, &ctx).await?
        } else {
            self.processor.declare(tx, &event.node, &ctx).await?
        };
        Ok((account.account_id, processed))
    }

    /// Costs per account over `period`, accrued up to `now`.
    pub async fn bill_on_interval(
        &self,
        period: &Period,
        filter: &LedgerFilter,
        now: DateTime<Utc>,
    ) -> Result<AccountCosts> {
        let mut tx = self.store.begin().await?;
        let costs = reporter::bill_on_interval(tx.as_mut(), period, filter, now).await?;
        tx.commit().await?;
        Ok(costs)
    }

    pub async fn report(&self, period: &Period, filter: &ReportFilter) -> Result<Report> {
        self.report_at(period, filter, Utc::now()).await
    }

    /// Report as it would have looked at `now`.
    pub async fn report_at(
        &self,
        period: &Period,
        filter: &ReportFilter,
        now: DateTime<Utc>,
    ) -> Result<Report> {
        let mut tx = self.store.begin().await?;
        let ledger_filter = directory::ledger_filter_for(
            tx.as_mut(),
            filter.account.as_ref(),
            filter.cost_center.as_ref(),
        )
        .await?;
        let costs = reporter::bill_on_interval(tx.as_mut(), period, &ledger_filter, now).await?;
        let names = directory::account_map(tx.as_mut()).await?;
        tx.commit().await?;

        Ok(Report {
            period_start: period.start,
            period_end: period.end,
            accounts: costs
                .into_iter()
                .map(|(id, resources)| AccountReport {
                    id,
                    name: names.get(&id).cloned(),
                    resources,
                })
                .collect(),
        })
    }

    pub async fn tariffs(&self) -> Result<TariffMap> {
        let mut tx = self.store.begin().await?;
        let tariffs = tx.tariff_map().await?;
        tx.commit().await?;
        Ok(tariffs)
    }

    /// Store the numeric entries of `values`; with `migrate`, re-rate open
    /// segments of the changed types at `at` in the same transaction.
    pub async fn update_tariffs(
        &self,
        values: &Map<String, Value>,
        migrate: bool,
        at: DateTime<Utc>,
    ) -> Result<TariffUpdate> {
        let mut tx = self.store.begin().await?;
        let update = tariffs::update_tariffs(tx.as_mut(), values, migrate, at).await?;
        tx.commit().await?;
        Ok(update)
    }

    pub async fn migrate_tariffs(
        &self,
        old: &TariffMap,
        new: &TariffMap,
        at: DateTime<Utc>,
    ) -> Result<MigrationSummary> {
        let mut tx = self.store.begin().await?;
        let summary = tariffs::migrate_tariffs(tx.as_mut(), old, new, at).await?;
        tx.commit().await?;

        info!(
            changed = summary.changes.len(),
            split = summary.segments_split,
            rerated = summary.segments_rerated,
            "Migrated tariffs"
        );
        Ok(summary)
    }

    pub async fn account_map(&self) -> Result<BTreeMap<AccountId, String>> {
        let mut tx = self.store.begin().await?;
        let names = directory::account_map(tx.as_mut()).await?;
        tx.commit().await?;
        Ok(names)
    }

    pub async fn cost_centers(&self, filter: &CostCenterFilter) -> Result<Vec<CostCenter>> {
        let mut tx = self.store.begin().await?;
        let rows = tx.find_cost_centers(filter).await?;
        tx.commit().await?;
        Ok(rows)
    }

    /// Accounts matching `filter`, optionally narrowed to one cost center
    /// given by id or name.
    pub async fn accounts(
        &self,
        filter: &AccountFilter,
        cost_center: Option<&Selector<CostCenterId>>,
    ) -> Result<Vec<Account>> {
        let mut tx = self.store.begin().await?;
        let mut filter = filter.clone();
        if let Some(selector) = cost_center {
            let id = directory::cost_center_id_for(tx.as_mut(), selector).await?;
            filter.cost_center_id = Some(id);
        }
        let rows = tx.find_accounts(&filter).await?;
        tx.commit().await?;
        Ok(rows)
    }

    /// Resources matching `filter`, optionally narrowed to one account and
    /// one cost center given by id or name.
    pub async fn resources(
        &self,
        filter: &ResourceFilter,
        account: Option<&Selector<AccountId>>,
        cost_center: Option<&Selector<CostCenterId>>,
    ) -> Result<Vec<Resource>> {
        let mut tx = self.store.begin().await?;
        let mut filter = filter.clone();
        if let Some(selector) = account {
            let id = directory::account_id_for(tx.as_mut(), selector).await?;
            filter.account_id = Some(id);
        }
        if let Some(selector) = cost_center {
            let id = directory::cost_center_id_for(tx.as_mut(), selector).await?;
            filter.cost_center_id = Some(id);
        }
        let rows = tx.find_resources(&filter).await?;
        tx.commit().await?;
        Ok(rows)
    }

    pub async fn segments_for_resource(&self, resource_id: ResourceId) -> Result<Vec<Segment>> {
        let mut tx = self.store.begin().await?;
        let rows = tx.segments_for_resource(resource_id).await?;
        tx.commit().await?;
        Ok(rows)
    }

    pub async fn create_cost_center(&self, name: &str) -> Result<CostCenter> {
        let mut tx = self.store.begin().await?;
        let cost_center = directory::ensure_cost_center(tx.as_mut(), name).await?;
        tx.commit().await?;
        Ok(cost_center)
    }

    pub async fn create_account(
        &self,
        name: &str,
        cost_center_name: Option<&str>,
    ) -> Result<Account> {
        let mut tx = self.store.begin().await?;
        let account = directory::ensure_account(tx.as_mut(), name, cost_center_name).await?;
        tx.commit().await?;
        Ok(account)
    }

    pub async fn rename_cost_center(
        &self,
        filter: &CostCenterFilter,
        name: &str,
    ) -> Result<CostCenter> {
        let mut tx = self.store.begin().await?;
        let renamed = directory::rename_cost_center(tx.as_mut(), filter, name).await?;
        tx.commit().await?;
        Ok(renamed)
    }

    pub async fn rename_account(&self, filter: &AccountFilter, name: &str) -> Result<Account> {
        let mut tx = self.store.begin().await?;
        let renamed = directory::rename_account(tx.as_mut(), filter, name).await?;
        tx.commit().await?;
        Ok(renamed)
    }

    pub async fn rename_resource(&self, filter: &ResourceFilter, name: &str) -> Result<Resource> {
        let mut tx = self.store.begin().await?;
        let renamed = directory::rename_resource(tx.as_mut(), filter, name).await?;
        tx.commit().await?;
        Ok(renamed)
    }

    /// Merge `doomed` into `target` and delete it; both must match exactly
    /// one cost center.
    pub async fn delete_cost_center(
        &self,
        doomed: &CostCenterFilter,
        target: &CostCenterFilter,
    ) -> Result<CostCenterMerge> {
        let mut tx = self.store.begin().await?;
        let merge = directory::delete_cost_center(tx.as_mut(), doomed, target).await?;
        tx.commit().await?;
        Ok(merge)
    }
}

fn receipt(
    event: &UsageEvent,
    account_id: AccountId,
    processed: ProcessedEvent,
    datetime: Option<DateTime<Utc>>,
) -> EventReceipt {
    EventReceipt {
        account_id,
        rtype: event.node.rtype.clone().unwrap_or_default(),
        name: event.node.name.clone(),
        datetime,
        resource_ids: processed.resources.into_keys().collect(),
    }
}
