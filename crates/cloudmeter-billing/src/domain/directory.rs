use crate::domain::events::AccountRef;
use crate::domain::types::{
    Account, AccountId, CostCenter, CostCenterId, LedgerFilter, Resource,
};
use crate::error::{BillingError, Result};
use crate::storage::{AccountFilter, CostCenterFilter, LedgerTx, ResourceFilter};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::info;

/// Names a row either by id or by (first match on) name
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Selector<I> {
    Id(I),
    Name(String),
}

/// Account and cost center an event is booked against
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResolvedAccount {
    pub account_id: AccountId,
    pub cost_center_id: Option<CostCenterId>,
}

impl From<&Account> for ResolvedAccount {
    fn from(account: &Account) -> Self {
        Self {
            account_id: account.id,
            cost_center_id: account.cost_center_id,
        }
    }
}

/// Find the account an event or declaration applies to.
///
/// Named accounts are created on first use; without any account the
/// owner of an existing resource with the same type and name is used.
pub async fn resolve_account(
    tx: &mut dyn LedgerTx,
    account: &AccountRef,
    rtype: &str,
    name: Option<&str>,
) -> Result<ResolvedAccount> {
    match account {
        AccountRef::Id(id) => {
            let account = tx
                .get_account(*id)
                .await?
                .ok_or_else(|| BillingError::AccountNotFound { id: id.to_string() })?;
            Ok(ResolvedAccount::from(&account))
        }
        AccountRef::Name {
            name: account_name,
            cost_center_name,
        } => {
            let account =
                ensure_account(tx, account_name, cost_center_name.as_deref()).await?;
            Ok(ResolvedAccount::from(&account))
        }
        AccountRef::Infer => {
            let resource = tx
                .find_resource(rtype, name)
                .await?
                .ok_or_else(|| BillingError::validation("account", "account must be specified"))?;
            Ok(ResolvedAccount {
                account_id: resource.account_id,
                cost_center_id: resource.cost_center_id,
            })
        }
    }
}

/// Get-or-create an account by name. The cost center is only looked up or
/// created when the account is new.
pub async fn ensure_account(
    tx: &mut dyn LedgerTx,
    name: &str,
    cost_center_name: Option<&str>,
) -> Result<Account> {
    if name.is_empty() {
        return Err(BillingError::validation("account_name", "must not be empty"));
    }

    let existing = tx
        .find_accounts(&AccountFilter {
            name: Some(name.to_string()),
            ..Default::default()
        })
        .await?;
    if let Some(account) = existing.into_iter().next() {
        return Ok(account);
    }

    let cost_center_id = match cost_center_name.filter(|n| !n.is_empty()) {
        Some(cost_center_name) => Some(tx.get_or_create_cost_center(cost_center_name).await?.id),
        None => None,
    };
    tx.get_or_create_account(name, cost_center_id).await
}

/// Account id to name, for labelling reports.
pub async fn account_map(tx: &mut dyn LedgerTx) -> Result<BTreeMap<AccountId, String>> {
    Ok(tx
        .find_accounts(&AccountFilter::default())
        .await?
        .into_iter()
        .map(|account| (account.id, account.name))
        .collect())
}

pub async fn ensure_cost_center(tx: &mut dyn LedgerTx, name: &str) -> Result<CostCenter> {
    if name.is_empty() {
        return Err(BillingError::validation("name", "must not be empty"));
    }
    tx.get_or_create_cost_center(name).await
}

pub async fn account_id_for(
    tx: &mut dyn LedgerTx,
    selector: &Selector<AccountId>,
) -> Result<AccountId> {
    match selector {
        Selector::Id(id) => Ok(*id),
        Selector::Name(name) => tx
            .find_accounts(&AccountFilter {
                name: Some(name.clone()),
                ..Default::default()
            })
            .await?
            .first()
            .map(|account| account.id)
            .ok_or_else(|| BillingError::AccountNotFound { id: name.clone() }),
    }
}

pub async fn cost_center_id_for(
    tx: &mut dyn LedgerTx,
    selector: &Selector<CostCenterId>,
) -> Result<CostCenterId> {
    match selector {
        Selector::Id(id) => Ok(*id),
        Selector::Name(name) => tx
            .find_cost_centers(&CostCenterFilter {
                name: Some(name.clone()),
                ..Default::default()
            })
            .await?
            .first()
            .map(|cost_center| cost_center.id)
            .ok_or_else(|| BillingError::CostCenterNotFound {
                selector: name.clone(),
            }),
    }
}

/// Reports filter by account when one is given, else by cost center.
pub async fn ledger_filter_for(
    tx: &mut dyn LedgerTx,
    account: Option<&Selector<AccountId>>,
    cost_center: Option<&Selector<CostCenterId>>,
) -> Result<LedgerFilter> {
    if let Some(account) = account {
        return Ok(LedgerFilter::account(account_id_for(tx, account).await?));
    }
    if let Some(cost_center) = cost_center {
        return Ok(LedgerFilter::cost_center(
            cost_center_id_for(tx, cost_center).await?,
        ));
    }
    Ok(LedgerFilter::all())
}

fn exactly_one<T>(mut rows: Vec<T>, entity: &str) -> Result<T> {
    if rows.len() != 1 {
        return Err(BillingError::AmbiguousSelection {
            entity: entity.to_string(),
            matched: rows.len(),
        });
    }
    rows.pop().ok_or_else(|| BillingError::AmbiguousSelection {
        entity: entity.to_string(),
        matched: 0,
    })
}

fn require_selector(empty: bool, entity: &str) -> Result<()> {
    if empty {
        return Err(BillingError::validation(
            entity,
            format!("a {} selector is required", entity),
        ));
    }
    Ok(())
}

fn require_name(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(BillingError::validation("name", "must not be empty"));
    }
    Ok(())
}

pub async fn rename_cost_center(
    tx: &mut dyn LedgerTx,
    filter: &CostCenterFilter,
    name: &str,
) -> Result<CostCenter> {
    require_selector(filter.is_empty(), "cost_center")?;
    require_name(name)?;
    let mut cost_center = exactly_one(tx.find_cost_centers(filter).await?, "cost_center")?;
    tx.rename_cost_center(cost_center.id, name).await?;
    cost_center.name = name.to_string();
    Ok(cost_center)
}

pub async fn rename_account(
    tx: &mut dyn LedgerTx,
    filter: &AccountFilter,
    name: &str,
) -> Result<Account> {
    require_selector(filter.is_empty(), "account")?;
    require_name(name)?;
    let mut account = exactly_one(tx.find_accounts(filter).await?, "account")?;
    tx.rename_account(account.id, name).await?;
    account.name = name.to_string();
    Ok(account)
}

pub async fn rename_resource(
    tx: &mut dyn LedgerTx,
    filter: &ResourceFilter,
    name: &str,
) -> Result<Resource> {
    require_selector(filter.is_empty(), "resource")?;
    require_name(name)?;
    let mut resource = exactly_one(tx.find_resources(filter).await?, "resource")?;

    // (account, parent, rtype, name) stays unique
    let holders = tx
        .find_resources(&ResourceFilter {
            name: Some(name.to_string()),
            rtype: Some(resource.rtype.to_string()),
            account_id: Some(resource.account_id),
            ..Default::default()
        })
        .await?;
    if holders
        .iter()
        .any(|other| other.id != resource.id && other.parent_id == resource.parent_id)
    {
        return Err(BillingError::InvalidOperation {
            message: format!(
                "a {} named {} already exists under the same account and parent",
                resource.rtype, name
            ),
        });
    }

    tx.rename_resource(resource.id, name).await?;
    resource.name = Some(name.to_string());
    Ok(resource)
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CostCenterMerge {
    pub deleted: CostCenter,
    pub merged_into: CostCenter,
    /// Accounts and resources re-pointed to `merged_into`
    pub reassigned: u64,
}

/// Move everything booked on one cost center to another, then delete it.
pub async fn delete_cost_center(
    tx: &mut dyn LedgerTx,
    doomed: &CostCenterFilter,
    target: &CostCenterFilter,
) -> Result<CostCenterMerge> {
    require_selector(doomed.is_empty(), "cost_center")?;
    require_selector(target.is_empty(), "migrate_to")?;

    let deleted = exactly_one(tx.find_cost_centers(doomed).await?, "cost center to delete")?;
    let merged_into = exactly_one(
        tx.find_cost_centers(target).await?,
        "cost center to migrate to",
    )?;
    if deleted.id == merged_into.id {
        return Err(BillingError::InvalidOperation {
            message: "cost centers for delete and migrate are the same".to_string(),
        });
    }

    let reassigned = tx.reassign_cost_center(deleted.id, merged_into.id).await?;
    tx.delete_cost_center(deleted.id).await?;

    info!(
        deleted = %deleted.id,
        merged_into = %merged_into.id,
        reassigned,
        "Merged cost center"
    );
    Ok(CostCenterMerge {
        deleted,
        merged_into,
        reassigned,
    })
}
