use anyhow::{anyhow, bail, Context, Result};
use chrono::{DateTime, Utc};
use clap::{Args as ClapArgs, CommandFactory, Parser, Subcommand};
use clap_verbosity_flag::{InfoLevel, Verbosity};
use cloudmeter_billing::config::BillingConfig;
use cloudmeter_billing::domain::directory::Selector;
use cloudmeter_billing::domain::period::{parse_datetime, Period};
use cloudmeter_billing::domain::types::{AccountId, CostCenterId, ResourceId};
use cloudmeter_billing::domain::UsageEvent;
use cloudmeter_billing::service::{LedgerService, ReportFilter};
use cloudmeter_billing::storage::{
    AccountFilter, CostCenterFilter, PgLedgerStore, RdsConnection, ResourceFilter,
};
use cloudmeter_common::logging;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::info;

const DEFAULT_LOG_FILTER: &str = "cloudmeter_billing=info,cloudmeter_common=info";

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
#[command(name = "cloudmeter-billing")]
#[command(about = "Cloudmeter billing ledger - usage segments, tariffs and reports")]
struct Args {
    #[arg(short, long, global = true, help = "Path to configuration file")]
    config: Option<PathBuf>,

    #[arg(long, help = "Generate sample configuration file")]
    gen_config: bool,

    #[command(flatten)]
    verbosity: Verbosity<InfoLevel>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print the default configuration as TOML
    GenConfig,
    /// Apply pending database migrations
    Migrate,
    /// Book usage events read from a JSON file (`-` for stdin)
    Event { input: PathBuf },
    /// Declare resources without billing them
    Declare { input: PathBuf },
    /// Cost report for a period
    Report {
        #[arg(long, help = "YYYY, YYYY-MM or YYYY-MM-DD", conflicts_with_all = ["start", "end"])]
        period: Option<String>,
        #[arg(long, requires = "end")]
        start: Option<String>,
        #[arg(long, requires = "start")]
        end: Option<String>,
        #[command(flatten)]
        account: AccountSelectorArgs,
        #[command(flatten)]
        cost_center: CostCenterSelectorArgs,
    },
    /// Show the tariff table
    Tariffs,
    /// Update tariffs from a JSON object of rtype -> multiplier
    SetTariffs {
        input: PathBuf,
        #[arg(long, help = "Re-rate open segments of changed types")]
        migrate: bool,
        #[arg(long, help = "When the new tariffs take effect (default: now)")]
        at: Option<String>,
    },
    /// List accounts
    Accounts {
        #[arg(long)]
        id: Option<i64>,
        #[arg(long)]
        name: Option<String>,
        #[command(flatten)]
        cost_center: CostCenterSelectorArgs,
    },
    /// List cost centers
    CostCenters {
        #[arg(long)]
        id: Option<i64>,
        #[arg(long)]
        name: Option<String>,
    },
    /// List resources with their attributes
    Resources {
        #[command(flatten)]
        resource: ResourceArgs,
        #[command(flatten)]
        account: AccountSelectorArgs,
        #[command(flatten)]
        cost_center: CostCenterSelectorArgs,
    },
    /// Show the segment history of one resource
    Segments { resource_id: i64 },
    CreateAccount {
        name: String,
        #[arg(long)]
        cost_center_name: Option<String>,
    },
    CreateCostCenter { name: String },
    RenameCostCenter {
        #[arg(long)]
        id: Option<i64>,
        #[arg(long)]
        name: Option<String>,
        #[arg(long)]
        to: String,
    },
    RenameAccount {
        #[arg(long)]
        id: Option<i64>,
        #[arg(long)]
        name: Option<String>,
        #[arg(long)]
        to: String,
    },
    RenameResource {
        #[command(flatten)]
        resource: ResourceArgs,
        #[arg(long)]
        account_id: Option<i64>,
        #[arg(long)]
        to: String,
    },
    /// Move a cost center's accounts and resources to another, then delete it
    DeleteCostCenter {
        #[arg(long)]
        id: Option<i64>,
        #[arg(long)]
        name: Option<String>,
        #[arg(long)]
        migrate_to_id: Option<i64>,
        #[arg(long)]
        migrate_to_name: Option<String>,
    },
}

#[derive(ClapArgs, Debug, Default)]
struct AccountSelectorArgs {
    #[arg(long, conflicts_with = "account_name")]
    account_id: Option<i64>,
    #[arg(long)]
    account_name: Option<String>,
}

impl AccountSelectorArgs {
    fn selector(&self) -> Option<Selector<AccountId>> {
        match (self.account_id, &self.account_name) {
            (Some(id), _) => Some(Selector::Id(AccountId::new(id))),
            (None, Some(name)) => Some(Selector::Name(name.clone())),
            (None, None) => None,
        }
    }
}

#[derive(ClapArgs, Debug, Default)]
struct CostCenterSelectorArgs {
    #[arg(long, conflicts_with = "cost_center_name")]
    cost_center_id: Option<i64>,
    #[arg(long)]
    cost_center_name: Option<String>,
}

impl CostCenterSelectorArgs {
    fn selector(&self) -> Option<Selector<CostCenterId>> {
        match (self.cost_center_id, &self.cost_center_name) {
            (Some(id), _) => Some(Selector::Id(CostCenterId::new(id))),
            (None, Some(name)) => Some(Selector::Name(name.clone())),
            (None, None) => None,
        }
    }
}

#[derive(ClapArgs, Debug, Default)]
struct ResourceArgs {
    #[arg(long)]
    id: Option<i64>,
    #[arg(long)]
    name: Option<String>,
    #[arg(long)]
    rtype: Option<String>,
    #[arg(long)]
    parent_id: Option<i64>,
}

impl ResourceArgs {
    fn filter(&self) -> ResourceFilter {
        ResourceFilter {
            id: self.id.map(ResourceId::new),
            name: self.name.clone(),
            rtype: self.rtype.clone(),
            parent_id: self.parent_id.map(ResourceId::new),
            ..Default::default()
        }
    }
}

/// Tariff input: either a bare `{rtype: multiplier}` map or a request
/// carrying `values`, `migrate` and `datetime`.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum TariffInput {
    Request {
        values: Map<String, Value>,
        #[serde(default)]
        migrate: bool,
        #[serde(default)]
        datetime: Option<String>,
    },
    Values(Map<String, Value>),
}

/// Event input is one event or a list booked one after another. The shape
/// is picked first so field errors in either form come through intact.
fn events_from_value(value: Value) -> serde_json::Result<Vec<UsageEvent>> {
    if value.is_array() {
        serde_json::from_value(value)
    } else {
        Ok(vec![serde_json::from_value(value)?])
    }
}

fn read_events(input: &Path) -> Result<Vec<UsageEvent>> {
    events_from_value(read_json::<Value>(input)?)
        .with_context(|| format!("Invalid event in {}", input.display()))
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    logging::init_logging(&args.verbosity, DEFAULT_LOG_FILTER)?;

    if args.gen_config || matches!(args.command, Some(Command::GenConfig)) {
        let config = BillingConfig::default();
        println!("{}", config.to_toml()?);
        return Ok(());
    }

    let Some(command) = args.command else {
        Args::command().print_help()?;
        return Ok(());
    };

    let config = BillingConfig::load(args.config)?;
    let connection = Arc::new(
        RdsConnection::new_direct(config.database.clone())
            .await
            .map_err(|e| anyhow!("Failed to connect to database: {}", e))?,
    );

    if matches!(command, Command::Migrate) {
        connection.run_migrations().await?;
        return Ok(());
    }
    if config.database.run_migrations {
        connection.run_migrations().await?;
    }

    let store = PgLedgerStore::from_connection(connection, config.ledger.lock_timeout_seconds);
    let service = LedgerService::new(Arc::new(store), &config.ledger);

    run(&service, command).await
}

async fn run(service: &LedgerService, command: Command) -> Result<()> {
    match command {
        Command::GenConfig | Command::Migrate => {}
        Command::Event { input } => {
            let events = read_events(&input)?;
            let mut receipts = Vec::with_capacity(events.len());
            for event in &events {
                receipts.push(service.process_event(event).await?);
            }
            info!("Booked {} event(s)", receipts.len());
            print_json(&receipts)?;
        }
        Command::Declare { input } => {
            let events = read_events(&input)?;
            let mut receipts = Vec::with_capacity(events.len());
            for event in &events {
                receipts.push(service.create_resource_only(event).await?);
            }
            print_json(&receipts)?;
        }
        Command::Report {
            period,
            start,
            end,
            account,
            cost_center,
        } => {
            let period = resolve_period(period.as_deref(), start.as_deref(), end.as_deref())?;
            let filter = ReportFilter {
                account: account.selector(),
                cost_center: cost_center.selector(),
            };
            print_json(&service.report(&period, &filter).await?)?;
        }
        Command::Tariffs => print_json(&service.tariffs().await?)?,
        Command::SetTariffs { input, migrate, at } => {
            let (values, migrate, datetime) = match read_json::<TariffInput>(&input)? {
                TariffInput::Request {
                    values,
                    migrate: requested,
                    datetime,
                } => (values, migrate || requested, at.or(datetime)),
                TariffInput::Values(values) => (values, migrate, at),
            };
            let at = match datetime {
                Some(raw) => parse_cli_datetime(&raw)?,
                None => Utc::now(),
            };
            print_json(&service.update_tariffs(&values, migrate, at).await?)?;
        }
        Command::Accounts {
            id,
            name,
            cost_center,
        } => {
            let filter = AccountFilter {
                id: id.map(AccountId::new),
                name,
                cost_center_id: None,
            };
            let selector = cost_center.selector();
            print_json(&service.accounts(&filter, selector.as_ref()).await?)?;
        }
        Command::CostCenters { id, name } => {
            let filter = CostCenterFilter {
                id: id.map(CostCenterId::new),
                name,
            };
            print_json(&service.cost_centers(&filter).await?)?;
        }
        Command::Resources {
            resource,
            account,
            cost_center,
        } => {
            let account = account.selector();
            let cost_center = cost_center.selector();
            let resources = service
                .resources(&resource.filter(), account.as_ref(), cost_center.as_ref())
                .await?;
            print_json(&resources)?;
        }
        Command::Segments { resource_id } => {
            let segments = service
                .segments_for_resource(ResourceId::new(resource_id))
                .await?;
            print_json(&segments)?;
        }
        Command::CreateAccount {
            name,
            cost_center_name,
        } => {
            let account = service
                .create_account(&name, cost_center_name.as_deref())
                .await?;
            print_json(&account)?;
        }
        Command::CreateCostCenter { name } => {
            print_json(&service.create_cost_center(&name).await?)?;
        }
        Command::RenameCostCenter { id, name, to } => {
            let filter = CostCenterFilter {
                id: id.map(CostCenterId::new),
                name,
            };
            print_json(&service.rename_cost_center(&filter, &to).await?)?;
        }
        Command::RenameAccount { id, name, to } => {
            let filter = AccountFilter {
                id: id.map(AccountId::new),
                name,
                cost_center_id: None,
            };
            print_json(&service.rename_account(&filter, &to).await?)?;
        }
        Command::RenameResource {
            resource,
            account_id,
            to,
        } => {
            let filter = ResourceFilter {
                account_id: account_id.map(AccountId::new),
                ..resource.filter()
            };
            print_json(&service.rename_resource(&filter, &to).await?)?;
        }
        Command::DeleteCostCenter {
            id,
            name,
            migrate_to_id,
            migrate_to_name,
        } => {
            let doomed = CostCenterFilter {
                id: id.map(CostCenterId::new),
                name,
            };
            let target = CostCenterFilter {
                id: migrate_to_id.map(CostCenterId::new),
                name: migrate_to_name,
            };
            print_json(&service.delete_cost_center(&doomed, &target).await?)?;
        }
    }
    Ok(())
}

fn resolve_period(token: Option<&str>, start: Option<&str>, end: Option<&str>) -> Result<Period> {
    match (token, start, end) {
        (Some(token), _, _) => Ok(Period::parse_token(token)?),
        (None, Some(start), Some(end)) => {
            Ok(Period::new(parse_cli_datetime(start)?, parse_cli_datetime(end)?)?)
        }
        (None, None, None) => Ok(Period::current_month()),
        _ => bail!("period_start and period_end must be given together"),
    }
}

fn parse_cli_datetime(raw: &str) -> Result<DateTime<Utc>> {
    parse_datetime(raw).ok_or_else(|| {
        anyhow!(
            "date `{}` should be in ISO 8601 format of YYYY-MM-DDThh:mm:ssZ",
            raw
        )
    })
}

fn read_json<T: DeserializeOwned>(input: &Path) -> Result<T> {
    let raw = if input == Path::new("-") {
        let mut buffer = String::new();
        std::io::stdin()
            .read_to_string(&mut buffer)
            .context("Failed to read stdin")?;
        buffer
    } else {
        std::fs::read_to_string(input)
            .with_context(|| format!("Failed to read {}", input.display()))?
    };
    serde_json::from_str(&raw).with_context(|| format!("Invalid JSON in {}", input.display()))
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
