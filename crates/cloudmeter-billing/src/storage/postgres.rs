use super::{AccountFilter, CostCenterFilter, LedgerStore, LedgerTx, ResourceFilter};
use crate::domain::types::{
    Account, AccountId, Attrs, CostCenter, CostCenterId, LedgerFilter, NewResource, NewSegment,
    Resource, ResourceId, Rtype, Segment, SegmentBounds, SegmentId, TariffMap,
};
use crate::error::{BillingError, Result};
use crate::storage::rds::RdsConnection;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use cloudmeter_common::distributed::{LockKey, XactLock};
use serde_json::Value;
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Postgres, Row, Transaction};
use std::sync::Arc;

pub type PgTx = Transaction<'static, Postgres>;

fn db(operation: &'static str) -> impl Fn(sqlx::Error) -> BillingError {
    move |e| BillingError::database(operation, e)
}

fn ids<I: Copy, F: Fn(I) -> i64>(values: &[I], f: F) -> Vec<i64> {
    values.iter().copied().map(f).collect()
}

fn cost_center_from_row(row: &PgRow) -> Result<CostCenter> {
    let map = db("decode cost_center");
    Ok(CostCenter {
        id: CostCenterId::new(row.try_get("id").map_err(&map)?),
        name: row.try_get("name").map_err(&map)?,
    })
}

fn account_from_row(row: &PgRow) -> Result<Account> {
    let map = db("decode account");
    let cost_center_id: Option<i64> = row.try_get("cost_center_id").map_err(&map)?;
    Ok(Account {
        id: AccountId::new(row.try_get("id").map_err(&map)?),
        name: row.try_get("name").map_err(&map)?,
        cost_center_id: cost_center_id.map(CostCenterId::new),
    })
}

/// `id_column` differs between plain resource reads and segment joins.
fn resource_from_row(row: &PgRow, id_column: &str) -> Result<Resource> {
    let map = db("decode resource");
    let rtype: String = row.try_get("rtype").map_err(&map)?;
    let cost_center_id: Option<i64> = row.try_get("cost_center_id").map_err(&map)?;
    let parent_id: Option<i64> = row.try_get("parent_id").map_err(&map)?;
    let attrs = match row.try_get::<Option<Value>, _>("attrs").map_err(&map)? {
        Some(Value::Object(attrs)) => attrs,
        _ => Attrs::new(),
    };
    Ok(Resource {
        id: ResourceId::new(row.try_get(id_column).map_err(&map)?),
        name: row.try_get("name").map_err(&map)?,
        rtype: Rtype::parse(rtype)?,
        account_id: AccountId::new(row.try_get("account_id").map_err(&map)?),
        cost_center_id: cost_center_id.map(CostCenterId::new),
        parent_id: parent_id.map(ResourceId::new),
        attrs,
    })
}

fn segment_from_row(row: &PgRow) -> Result<Segment> {
    let map = db("decode segment");
    Ok(Segment {
        id: SegmentId::new(row.try_get("segment_id").map_err(&map)?),
        resource_id: ResourceId::new(row.try_get("resource_id").map_err(&map)?),
        cost: row.try_get("cost").map_err(&map)?,
        begin_at: row.try_get("begin_at").map_err(&map)?,
        end_at: row.try_get("end_at").map_err(&map)?,
    })
}

/// Ledger tables in PostgreSQL
#[derive(Clone)]
pub struct PgLedgerStore {
    pool: PgPool,
    lock_timeout_seconds: u64,
}

impl PgLedgerStore {
    pub fn new(pool: PgPool, lock_timeout_seconds: u64) -> Self {
        Self {
            pool,
            lock_timeout_seconds,
        }
    }

    pub fn from_connection(connection: Arc<RdsConnection>, lock_timeout_seconds: u64) -> Self {
        Self::new(connection.pool().clone(), lock_timeout_seconds)
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl LedgerStore for PgLedgerStore {
    async fn begin(&self) -> Result<Box<dyn LedgerTx>> {
        let tx = self.pool.begin().await.map_err(db("begin"))?;
        Ok(Box::new(PgLedgerTx {
            tx,
            lock_timeout_seconds: self.lock_timeout_seconds,
        }))
    }
}

pub struct PgLedgerTx {
    tx: PgTx,
    lock_timeout_seconds: u64,
}

impl PgLedgerTx {
    /// Serialize get-or-create on a name-keyed table until this transaction ends.
    async fn lock_name(&mut self, table: &str, name: &str) -> Result<()> {
        XactLock::acquire_with_timeout(
            &mut self.tx,
            LockKey::for_name(table, name),
            self.lock_timeout_seconds,
        )
        .await?;
        Ok(())
    }
}

#[async_trait]
impl LedgerTx for PgLedgerTx {
    async fn commit(self: Box<Self>) -> Result<()> {
        let PgLedgerTx { tx, .. } = *self;
        tx.commit().await.map_err(db("commit"))
    }

    async fn get_or_create_cost_center(&mut self, name: &str) -> Result<CostCenter> {
        self.lock_name("cost_center", name).await?;

        let existing =
            sqlx::query("SELECT id, name FROM cost_center WHERE name = $1 ORDER BY id LIMIT 1")
                .bind(name)
                .fetch_optional(&mut *self.tx)
                .await
                .map_err(db("get_or_create_cost_center"))?;
        if let Some(row) = existing {
            return cost_center_from_row(&row);
        }

        let row = sqlx::query("INSERT INTO cost_center (name) VALUES ($1) RETURNING id, name")
            .bind(name)
            .fetch_one(&mut *self.tx)
            .await
            .map_err(db("get_or_create_cost_center"))?;
        cost_center_from_row(&row)
    }

    async fn find_cost_centers(&mut self, filter: &CostCenterFilter) -> Result<Vec<CostCenter>> {
        let rows = sqlx::query(
            r#"
            SELECT id, name
            FROM cost_center
            WHERE ($1::BIGINT IS NULL OR id = $1)
              AND ($2::VARCHAR IS NULL OR name = $2)
            ORDER BY id
            "#,
        )
        .bind(filter.id.map(|id| id.as_i64()))
        .bind(filter.name.as_deref())
        .fetch_all(&mut *self.tx)
        .await
        .map_err(db("find_cost_centers"))?;

        rows.iter().map(cost_center_from_row).collect()
    }

    async fn rename_cost_center(&mut self, id: CostCenterId, name: &str) -> Result<()> {
        let result = sqlx::query("UPDATE cost_center SET name = $2 WHERE id = $1")
            .bind(id.as_i64())
            .bind(name)
            .execute(&mut *self.tx)
            .await
            .map_err(db("rename_cost_center"))?;
        if result.rows_affected() == 0 {
            return Err(BillingError::CostCenterNotFound {
                selector: id.to_string(),
            });
        }
        Ok(())
    }

    async fn reassign_cost_center(
        &mut self,
        from: CostCenterId,
        to: CostCenterId,
    ) -> Result<u64> {
        let mut touched = 0;
        for statement in [
            "UPDATE account SET cost_center_id = $2 WHERE cost_center_id = $1",
            "UPDATE resource SET cost_center_id = $2 WHERE cost_center_id = $1",
        ] {
            touched += sqlx::query(statement)
                .bind(from.as_i64())
                .bind(to.as_i64())
                .execute(&mut *self.tx)
                .await
                .map_err(db("reassign_cost_center"))?
                .rows_affected();
        }
        Ok(touched)
    }

    async fn delete_cost_center(&mut self, id: CostCenterId) -> Result<()> {
        let result = sqlx::query("DELETE FROM cost_center WHERE id = $1")
            .bind(id.as_i64())
            .execute(&mut *self.tx)
            .await
            .map_err(db("delete_cost_center"))?;
        if result.rows_affected() == 0 {
            return Err(BillingError::CostCenterNotFound {
                selector: id.to_string(),
            });
        }
        Ok(())
    }

    async fn get_account(&mut self, id: AccountId) -> Result<Option<Account>> {
        let row = sqlx::query("SELECT id, name, cost_center_id FROM account WHERE id = $1")
            .bind(id.as_i64())
            .fetch_optional(&mut *self.tx)
            .await
            .map_err(db("get_account"))?;
        row.as_ref().map(account_from_row).transpose()
    }

    async fn get_or_create_account(
        &mut self,
        name: &str,
        cost_center_id: Option<CostCenterId>,
    ) -> Result<Account> {
        self.lock_name("account", name).await?;

        let existing = sqlx::query(
            "SELECT id, name, cost_center_id FROM account WHERE name = $1 ORDER BY id LIMIT 1",
        )
        .bind(name)
        .fetch_optional(&mut *self.tx)
        .await
        .map_err(db("get_or_create_account"))?;
        if let Some(row) = existing {
            return account_from_row(&row);
        }

        let row = sqlx::query(
            r#"
            INSERT INTO account (name, cost_center_id)
            VALUES ($1, $2)
            RETURNING id, name, cost_center_id
            "#,
        )
        .bind(name)
        .bind(cost_center_id.map(|id| id.as_i64()))
        .fetch_one(&mut *self.tx)
        .await
        .map_err(db("get_or_create_account"))?;
        account_from_row(&row)
    }

    async fn find_accounts(&mut self, filter: &AccountFilter) -> Result<Vec<Account>> {
        let rows = sqlx::query(
            r#"
            SELECT id, name, cost_center_id
            FROM account
            WHERE ($1::BIGINT IS NULL OR id = $1)
              AND ($2::VARCHAR IS NULL OR name = $2)
              AND ($3::BIGINT IS NULL OR cost_center_id = $3)
            ORDER BY id
            "#,
        )
        .bind(filter.id.map(|id| id.as_i64()))
        .bind(filter.name.as_deref())
        .bind(filter.cost_center_id.map(|id| id.as_i64()))
        .fetch_all(&mut *self.tx)
        .await
        .map_err(db("find_accounts"))?;

        rows.iter().map(account_from_row).collect()
    }

    async fn rename_account(&mut self, id: AccountId, name: &str) -> Result<()> {
        let result = sqlx::query("UPDATE account SET name = $2 WHERE id = $1")
            .bind(id.as_i64())
            .bind(name)
            .execute(&mut *self.tx)
            .await
            .map_err(db("rename_account"))?;
        if result.rows_affected() == 0 {
            return Err(BillingError::AccountNotFound { id: id.to_string() });
        }
        Ok(())
    }

    async fn get_or_create_resource(&mut self, resource: &NewResource) -> Result<Resource> {
        // The no-op update makes RETURNING yield the existing row on conflict
        let row = sqlx::query(
            r#"
            INSERT INTO resource (account_id, parent_id, rtype, name, cost_center_id)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT ON CONSTRAINT resource_natural_key
            DO UPDATE SET rtype = EXCLUDED.rtype
            RETURNING id, name, rtype, account_id, cost_center_id, parent_id, attrs
            "#,
        )
        .bind(resource.key.account_id.as_i64())
        .bind(resource.key.parent_id.map(|id| id.as_i64()))
        .bind(resource.key.rtype.as_str())
        .bind(resource.key.name.as_deref())
        .bind(resource.cost_center_id.map(|id| id.as_i64()))
        .fetch_one(&mut *self.tx)
        .await
        .map_err(db("get_or_create_resource"))?;

        resource_from_row(&row, "id")
    }

    async fn find_resource(
        &mut self,
        rtype: &str,
        name: Option<&str>,
    ) -> Result<Option<Resource>> {
        let Some(name) = name else {
            return Ok(None);
        };
        let row = sqlx::query(
            r#"
            SELECT r.id, r.name, r.rtype, r.account_id, r.cost_center_id, r.parent_id, r.attrs
            FROM resource r
            JOIN account a ON a.id = r.account_id
            WHERE r.rtype = $1 AND r.name = $2
            ORDER BY r.id
            LIMIT 1
            "#,
        )
        .bind(rtype)
        .bind(name)
        .fetch_optional(&mut *self.tx)
        .await
        .map_err(db("find_resource"))?;

        row.as_ref()
            .map(|row| resource_from_row(row, "id"))
            .transpose()
    }

    async fn find_resources(&mut self, filter: &ResourceFilter) -> Result<Vec<Resource>> {
        let rows = sqlx::query(
            r#"
            SELECT id, name, rtype, account_id, cost_center_id, parent_id, attrs
            FROM resource
            WHERE ($1::BIGINT IS NULL OR id = $1)
              AND ($2::VARCHAR IS NULL OR name = $2)
              AND ($3::VARCHAR IS NULL OR rtype = $3)
              AND ($4::BIGINT IS NULL OR parent_id = $4)
              AND ($5::BIGINT IS NULL OR account_id = $5)
              AND ($6::BIGINT IS NULL OR cost_center_id = $6)
            ORDER BY id
            "#,
        )
        .bind(filter.id.map(|id| id.as_i64()))
        .bind(filter.name.as_deref())
        .bind(filter.rtype.as_deref())
        .bind(filter.parent_id.map(|id| id.as_i64()))
        .bind(filter.account_id.map(|id| id.as_i64()))
        .bind(filter.cost_center_id.map(|id| id.as_i64()))
        .fetch_all(&mut *self.tx)
        .await
        .map_err(db("find_resources"))?;

        rows.iter().map(|row| resource_from_row(row, "id")).collect()
    }

    async fn set_resource_attrs(&mut self, id: ResourceId, attrs: &Attrs) -> Result<()> {
        let result = sqlx::query("UPDATE resource SET attrs = $2 WHERE id = $1")
            .bind(id.as_i64())
            .bind(Value::Object(attrs.clone()))
            .execute(&mut *self.tx)
            .await
            .map_err(db("set_resource_attrs"))?;
        if result.rows_affected() == 0 {
            return Err(BillingError::ResourceNotFound {
                selector: id.to_string(),
            });
        }
        Ok(())
    }

    async fn rename_resource(&mut self, id: ResourceId, name: &str) -> Result<()> {
        let result = sqlx::query("UPDATE resource SET name = $2 WHERE id = $1")
            .bind(id.as_i64())
            .bind(name)
            .execute(&mut *self.tx)
            .await
            .map_err(db("rename_resource"))?;
        if result.rows_affected() == 0 {
            return Err(BillingError::ResourceNotFound {
                selector: id.to_string(),
            });
        }
        Ok(())
    }

    async fn end_open_segments(
        &mut self,
        resource_id: ResourceId,
        at: DateTime<Utc>,
    ) -> Result<u64> {
        let result = sqlx::query(
            "UPDATE segment SET end_at = $2 WHERE resource_id = $1 AND end_at IS NULL",
        )
        .bind(resource_id.as_i64())
        .bind(at)
        .execute(&mut *self.tx)
        .await
        .map_err(db("end_open_segments"))?;
        Ok(result.rows_affected())
    }

    async fn append_segment(&mut self, segment: &NewSegment) -> Result<Segment> {
        let row = sqlx::query(
            r#"
            INSERT INTO segment (resource_id, cost, begin_at, end_at)
            VALUES ($1, $2, $3, $4)
            RETURNING id AS segment_id, resource_id, cost, begin_at, end_at
            "#,
        )
        .bind(segment.resource_id.as_i64())
        .bind(segment.cost)
        .bind(segment.begin_at)
        .bind(segment.end_at)
        .fetch_one(&mut *self.tx)
        .await
        .map_err(db("append_segment"))?;

        segment_from_row(&row)
    }

    async fn open_segments_by_rtype(&mut self, rtype: &str) -> Result<Vec<Segment>> {
        let rows = sqlx::query(
            r#"
            SELECT s.id AS segment_id, s.resource_id, s.cost, s.begin_at, s.end_at
            FROM segment s
            JOIN resource r ON r.id = s.resource_id
            WHERE s.end_at IS NULL AND r.rtype = $1
            ORDER BY s.id
            FOR UPDATE OF s
            "#,
        )
        .bind(rtype)
        .fetch_all(&mut *self.tx)
        .await
        .map_err(db("open_segments_by_rtype"))?;

        rows.iter().map(segment_from_row).collect()
    }

    async fn close_segments(
        &mut self,
        segment_ids: &[SegmentId],
        at: DateTime<Utc>,
    ) -> Result<u64> {
        let result = sqlx::query("UPDATE segment SET end_at = $2 WHERE id = ANY($1)")
            .bind(ids(segment_ids, |id| id.as_i64()))
            .bind(at)
            .execute(&mut *self.tx)
            .await
            .map_err(db("close_segments"))?;
        Ok(result.rows_affected())
    }

    async fn set_segment_cost(&mut self, id: SegmentId, cost: f64) -> Result<()> {
        sqlx::query("UPDATE segment SET cost = $2 WHERE id = $1")
            .bind(id.as_i64())
            .bind(cost)
            .execute(&mut *self.tx)
            .await
            .map_err(db("set_segment_cost"))?;
        Ok(())
    }

    async fn segments_for_resource(&mut self, resource_id: ResourceId) -> Result<Vec<Segment>> {
        let rows = sqlx::query(
            r#"
            SELECT id AS segment_id, resource_id, cost, begin_at, end_at
            FROM segment
            WHERE resource_id = $1
            ORDER BY begin_at, id
            "#,
        )
        .bind(resource_id.as_i64())
        .fetch_all(&mut *self.tx)
        .await
        .map_err(db("segments_for_resource"))?;

        rows.iter().map(segment_from_row).collect()
    }

    async fn segments_overlapping(
        &mut self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        filter: &LedgerFilter,
    ) -> Result<Vec<(Segment, Resource)>> {
        let rows = sqlx::query(
            r#"
            SELECT s.id AS segment_id, s.resource_id, s.cost, s.begin_at, s.end_at,
                   r.name, r.rtype, r.account_id, r.cost_center_id, r.parent_id, r.attrs
            FROM segment s
            JOIN resource r ON r.id = s.resource_id
            WHERE s.begin_at < $2
              AND (s.end_at > $1 OR s.end_at IS NULL)
              AND ($3::BIGINT IS NULL OR r.account_id = $3)
              AND ($4::BIGINT IS NULL OR r.cost_center_id = $4)
            ORDER BY r.id, s.begin_at, s.id
            "#,
        )
        .bind(start)
        .bind(end)
        .bind(filter.account_id.map(|id| id.as_i64()))
        .bind(filter.cost_center_id.map(|id| id.as_i64()))
        .fetch_all(&mut *self.tx)
        .await
        .map_err(db("segments_overlapping"))?;

        rows.iter()
            .map(|row| Ok((segment_from_row(row)?, resource_from_row(row, "resource_id")?)))
            .collect()
    }

    async fn segment_bounds(
        &mut self,
        resource_ids: &[ResourceId],
        filter: &LedgerFilter,
    ) -> Result<Vec<SegmentBounds>> {
        if resource_ids.is_empty() {
            return Ok(Vec::new());
        }

        let rows = sqlx::query(
            r#"
            SELECT s.resource_id,
                   MIN(s.begin_at) AS first_begin,
                   MAX(s.begin_at) AS last_begin,
                   MAX(s.end_at) AS last_end
            FROM segment s
            JOIN resource r ON r.id = s.resource_id
            WHERE s.resource_id = ANY($1)
              AND ($2::BIGINT IS NULL OR r.account_id = $2)
              AND ($3::BIGINT IS NULL OR r.cost_center_id = $3)
            GROUP BY s.resource_id
            ORDER BY s.resource_id
            "#,
        )
        .bind(ids(resource_ids, |id| id.as_i64()))
        .bind(filter.account_id.map(|id| id.as_i64()))
        .bind(filter.cost_center_id.map(|id| id.as_i64()))
        .fetch_all(&mut *self.tx)
        .await
        .map_err(db("segment_bounds"))?;

        let map = db("decode segment_bounds");
        rows.iter()
            .map(|row| {
                Ok(SegmentBounds {
                    resource_id: ResourceId::new(row.try_get("resource_id").map_err(&map)?),
                    first_begin: row.try_get("first_begin").map_err(&map)?,
                    last_begin: row.try_get("last_begin").map_err(&map)?,
                    last_end: row.try_get("last_end").map_err(&map)?,
                })
            })
            .collect()
    }

    async fn tariff_map(&mut self) -> Result<TariffMap> {
        let rows = sqlx::query("SELECT rtype, multiplier FROM tariff")
            .fetch_all(&mut *self.tx)
            .await
            .map_err(db("tariff_map"))?;

        let map = db("decode tariff");
        rows.iter()
            .map(|row| {
                let rtype: String = row.try_get("rtype").map_err(&map)?;
                let multiplier: f64 = row.try_get("multiplier").map_err(&map)?;
                Ok((rtype, multiplier))
            })
            .collect()
    }

    async fn set_tariff(&mut self, rtype: &str, multiplier: f64) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO tariff (rtype, multiplier)
            VALUES ($1, $2)
            ON CONFLICT (rtype) DO UPDATE SET multiplier = EXCLUDED.multiplier
            "#,
        )
        .bind(rtype)
        .bind(multiplier)
        .execute(&mut *self.tx)
        .await
        .map_err(db("set_tariff"))?;
        Ok(())
    }
}
