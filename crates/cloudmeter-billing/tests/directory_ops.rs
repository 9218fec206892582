use chrono::{TimeZone, Utc};
use cloudmeter_billing::config::LedgerConfig;
use cloudmeter_billing::domain::directory::Selector;
use cloudmeter_billing::domain::{LedgerFilter, Period, UsageEvent};
use cloudmeter_billing::service::ReportFilter;
use cloudmeter_billing::storage::{
    AccountFilter, CostCenterFilter, MemoryLedgerStore, ResourceFilter,
};
use cloudmeter_billing::{BillingError, LedgerService};
use pretty_assertions::assert_eq;
use serde_json::json;
use std::sync::Arc;

fn service() -> LedgerService {
    LedgerService::new(
        Arc::new(MemoryLedgerStore::new()),
        &LedgerConfig::default(),
    )
}

fn by_name(name: &str) -> CostCenterFilter {
    CostCenterFilter {
        name: Some(name.to_string()),
        ..Default::default()
    }
}

async fn book(service: &LedgerService, account: &str, cost_center: &str, vm: &str) {
    let mut event: UsageEvent = serde_json::from_value(json!({
        "rtype": "nova/instance",
        "name": vm,
        "account": account,
        "cost_center_name": cost_center,
        "linear": 10
    }))
    .unwrap();
    event.datetime = Some(Utc.with_ymd_and_hms(2011, 1, 2, 0, 0, 0).unwrap());
    service.process_event(&event).await.unwrap();
}

#[tokio::test]
async fn test_account_creation_is_idempotent() {
    let service = service();
    let first = service.create_account("tenant-A", Some("ops")).await.unwrap();
    let again = service.create_account("tenant-A", Some("dev")).await.unwrap();
    assert_eq!(first, again);

    // The cost center is only created alongside a new account
    let cost_centers = service
        .cost_centers(&CostCenterFilter::default())
        .await
        .unwrap();
    let names: Vec<&str> = cost_centers.iter().map(|c| c.name.as_str()).collect();
    assert_eq!(names, vec!["ops"]);
    assert_eq!(first.cost_center_id, Some(cost_centers[0].id));

    let err = service.create_account("", None).await.unwrap_err();
    assert!(matches!(err, BillingError::ValidationError { .. }));
}

#[tokio::test]
async fn test_listings_narrow_by_owner() {
    let service = service();
    book(&service, "tenant-A", "ops", "vm1").await;
    book(&service, "tenant-A", "ops", "vm2").await;
    book(&service, "tenant-B", "dev", "vm1").await;

    let ops = Selector::Name("ops".to_string());
    let accounts = service
        .accounts(&AccountFilter::default(), Some(&ops))
        .await
        .unwrap();
    assert_eq!(accounts.len(), 1);
    assert_eq!(accounts[0].name, "tenant-A");

    let tenant_b = Selector::Name("tenant-B".to_string());
    let resources = service
        .resources(&ResourceFilter::default(), Some(&tenant_b), None)
        .await
        .unwrap();
    assert_eq!(resources.len(), 1);
    assert_eq!(resources[0].name.as_deref(), Some("vm1"));

    let named_vm1 = ResourceFilter {
        name: Some("vm1".to_string()),
        ..Default::default()
    };
    assert_eq!(
        service.resources(&named_vm1, None, None).await.unwrap().len(),
        2
    );

    let missing = Selector::Name("nobody".to_string());
    let err = service
        .resources(&ResourceFilter::default(), Some(&missing), None)
        .await
        .unwrap_err();
    assert!(matches!(err, BillingError::AccountNotFound { .. }));
}

#[tokio::test]
async fn test_report_filters_by_cost_center() {
    let service = service();
    book(&service, "tenant-A", "ops", "vm1").await;
    book(&service, "tenant-B", "dev", "vm1").await;

    let month = Period::parse_token("2011-01").unwrap();
    let now = Utc.with_ymd_and_hms(2011, 1, 3, 0, 0, 0).unwrap();
    let everything = service
        .report_at(&month, &ReportFilter::default(), now)
        .await
        .unwrap();
    assert_eq!(everything.accounts.len(), 2);

    let dev_only = ReportFilter {
        account: None,
        cost_center: Some(Selector::Name("dev".to_string())),
    };
    let report = service.report_at(&month, &dev_only, now).await.unwrap();
    assert_eq!(report.accounts.len(), 1);
    assert_eq!(report.accounts[0].name.as_deref(), Some("tenant-B"));
    assert!((everything.total_cost() - 2.0 * report.total_cost()).abs() < 1e-12);

    let costs = service
        .bill_on_interval(&month, &LedgerFilter::all(), now)
        .await
        .unwrap();
    assert_eq!(costs.len(), 2);
}

#[tokio::test]
async fn test_rename_requires_exactly_one_match() {
    let service = service();
    book(&service, "tenant-A", "ops", "vm1").await;
    book(&service, "tenant-B", "dev", "vm1").await;

    let renamed = service
        .rename_cost_center(&by_name("ops"), "operations")
        .await
        .unwrap();
    assert_eq!(renamed.name, "operations");
    assert_eq!(
        service
            .cost_centers(&by_name("operations"))
            .await
            .unwrap()
            .len(),
        1
    );

    let both_vms = ResourceFilter {
        name: Some("vm1".to_string()),
        ..Default::default()
    };
    let err = service
        .rename_resource(&both_vms, "web")
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        BillingError::AmbiguousSelection { matched: 2, .. }
    ));

    let err = service
        .rename_account(&AccountFilter::default(), "anything")
        .await
        .unwrap_err();
    assert!(matches!(err, BillingError::ValidationError { .. }));

    let tenant_a = AccountFilter {
        name: Some("tenant-A".to_string()),
        ..Default::default()
    };
    let err = service.rename_account(&tenant_a, "").await.unwrap_err();
    assert!(matches!(err, BillingError::ValidationError { .. }));

    let account = service.rename_account(&tenant_a, "tenant-C").await.unwrap();
    assert_eq!(account.name, "tenant-C");
    let names: Vec<String> = service.account_map().await.unwrap().into_values().collect();
    assert_eq!(names, vec!["tenant-C".to_string(), "tenant-B".to_string()]);
}

#[tokio::test]
async fn test_rename_keeps_resource_keys_unique() {
    let service = service();
    book(&service, "tenant-A", "ops", "vm1").await;
    book(&service, "tenant-A", "ops", "vm2").await;
    book(&service, "tenant-B", "dev", "vm3").await;

    let vm2 = ResourceFilter {
        name: Some("vm2".to_string()),
        rtype: Some("nova/instance".to_string()),
        ..Default::default()
    };
    let err = service.rename_resource(&vm2, "vm1").await.unwrap_err();
    assert!(matches!(err, BillingError::InvalidOperation { .. }));
    assert!(err.is_rejection());

    let named_vm1 = ResourceFilter {
        name: Some("vm1".to_string()),
        ..Default::default()
    };
    assert_eq!(service.resources(&named_vm1, None, None).await.unwrap().len(), 1);
    assert_eq!(service.resources(&vm2, None, None).await.unwrap().len(), 1);

    // Same name in another account is a different key
    let vm3 = ResourceFilter {
        name: Some("vm3".to_string()),
        ..Default::default()
    };
    let renamed = service.rename_resource(&vm3, "vm1").await.unwrap();
    assert_eq!(renamed.name.as_deref(), Some("vm1"));

    // Renaming a resource to its current name is a no-op
    let renamed = service.rename_resource(&vm2, "vm2").await.unwrap();
    assert_eq!(renamed.name.as_deref(), Some("vm2"));
}

#[tokio::test]
async fn test_delete_cost_center_merges_into_target() {
    let service = service();
    book(&service, "tenant-A", "ops", "vm1").await;
    book(&service, "tenant-B", "dev", "vm1").await;

    let merge = service
        .delete_cost_center(&by_name("ops"), &by_name("dev"))
        .await
        .unwrap();
    assert_eq!(merge.deleted.name, "ops");
    assert_eq!(merge.merged_into.name, "dev");
    // One account and its one resource
    assert_eq!(merge.reassigned, 2);

    let remaining = service
        .cost_centers(&CostCenterFilter::default())
        .await
        .unwrap();
    assert_eq!(remaining.len(), 1);

    let dev = Selector::Name("dev".to_string());
    let accounts = service
        .accounts(&AccountFilter::default(), Some(&dev))
        .await
        .unwrap();
    assert_eq!(accounts.len(), 2);
    let resources = service
        .resources(&ResourceFilter::default(), None, Some(&dev))
        .await
        .unwrap();
    assert_eq!(resources.len(), 2);
}

#[tokio::test]
async fn test_delete_cost_center_rejects_bad_selections() {
    let service = service();
    book(&service, "tenant-A", "ops", "vm1").await;

    let err = service
        .delete_cost_center(&by_name("ops"), &by_name("ops"))
        .await
        .unwrap_err();
    assert!(matches!(err, BillingError::InvalidOperation { .. }));

    let err = service
        .delete_cost_center(&by_name("ops"), &by_name("missing"))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        BillingError::AmbiguousSelection { matched: 0, .. }
    ));

    let err = service
        .delete_cost_center(&CostCenterFilter::default(), &by_name("ops"))
        .await
        .unwrap_err();
    assert!(err.is_rejection());

    // Nothing was touched
    let left = service.cost_centers(&by_name("ops")).await.unwrap();
    assert_eq!(left.len(), 1);
}
