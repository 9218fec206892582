pub mod directory;
pub mod events;
pub mod period;
pub mod reporter;
pub mod tariffs;
pub mod types;

pub use events::{AccountRef, EventProcessor, SegmentAction, UsageEvent, UsageNode};
pub use period::Period;
pub use reporter::{bill_on_interval, AccountCosts, ResourceCost};
pub use tariffs::{migrate_tariffs, update_tariffs, MigrationSummary, TariffChange, TariffUpdate};
pub use types::{
    Account, AccountId, CostCenter, CostCenterId, LedgerFilter, Resource, ResourceId, Rtype,
    Segment, SegmentId, TariffMap,
};
