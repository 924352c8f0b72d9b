//! Store contracts for agents, farmers, tickets, activity and reports, with
//! Postgres and in-memory backends.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use fieldops_core::{
    Cce, Farmer, FarmerFilter, Page, Report, ReportSummary, Shoot, ShootKind, Ticket, TicketSort,
};
use thiserror::Error;
use uuid::Uuid;

mod memory;
mod postgres;

pub use memory::MemoryStore;
pub use postgres::{PgStore, PgStoreConfig};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("{entity} already exists (id={id})")]
    Conflict { entity: &'static str, id: String },
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("migration error: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),
    #[error("invalid value {value:?} in column '{column}'")]
    InvalidValue { column: &'static str, value: String },
}

pub type Result<T> = std::result::Result<T, StoreError>;

/// Agent directory. `list_all` is unpaginated; the report aggregator seeds one
/// entry per returned agent.
#[async_trait]
pub trait DirectoryStore: Send + Sync {
    async fn create_cce(&self, cce: &Cce) -> Result<()>;
    async fn get_cce(&self, id: &str) -> Result<Option<Cce>>;
    /// Returns `false` when no agent with that id exists.
    async fn update_cce(&self, cce: &Cce) -> Result<bool>;
    async fn delete_cce(&self, id: &str) -> Result<bool>;
    async fn list_all(&self) -> Result<Vec<Cce>>;
}

/// Shoot (activity) records. Shoots are immutable once recorded.
#[async_trait]
pub trait ActivityStore: Send + Sync {
    async fn record_shoot(&self, shoot: &Shoot) -> Result<()>;
    async fn list_shoots(&self, kind: Option<ShootKind>) -> Result<Vec<Shoot>>;
    /// All shoots with `start <= timestamp < end`.
    async fn list_by_time_range(&self, start: DateTime<Utc>, end: DateTime<Utc>)
        -> Result<Vec<Shoot>>;
    async fn list_missed_calls(&self) -> Result<Vec<Shoot>>;
}

#[async_trait]
pub trait FarmerStore: Send + Sync {
    async fn create_farmer(&self, farmer: &Farmer) -> Result<()>;
    async fn get_farmer(&self, id: &str) -> Result<Option<Farmer>>;
    async fn get_farmer_by_contact(&self, contact: &str) -> Result<Option<Farmer>>;
    async fn list_farmers(&self, filter: &FarmerFilter) -> Result<Vec<Farmer>>;
    async fn update_farmer(&self, farmer: &Farmer) -> Result<bool>;
    async fn delete_farmer(&self, id: &str) -> Result<bool>;
}

#[async_trait]
pub trait TicketStore: Send + Sync {
    async fn create_ticket(&self, ticket: &Ticket) -> Result<()>;
    async fn get_ticket(&self, id: &str) -> Result<Option<Ticket>>;
    /// Keyset page ordered by id; `after` is the previous page's `next_token`.
    async fn list_tickets_page(&self, limit: usize, after: Option<&str>) -> Result<Page<Ticket>>;
    async fn list_tickets_by_status(
        &self,
        status: &str,
        sort: Option<TicketSort>,
    ) -> Result<Vec<Ticket>>;
    async fn list_tickets_by_farmer(&self, farmer_id: &str) -> Result<Vec<Ticket>>;
    async fn list_tickets_by_cce(&self, cce_id: &str) -> Result<Vec<Ticket>>;
    /// Tickets for `cce_id` with `start <= created_at < end`.
    async fn list_tickets_by_cce_in_range(
        &self,
        cce_id: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<Ticket>>;
    async fn list_tickets_by_cce_and_status(&self, cce_id: &str, status: &str)
        -> Result<Vec<Ticket>>;
    async fn update_ticket(&self, ticket: &Ticket) -> Result<bool>;
    async fn delete_ticket(&self, id: &str) -> Result<bool>;
}

/// Durable report storage. Reports are written once and never updated.
#[async_trait]
pub trait ReportPersister: Send + Sync {
    async fn save(&self, report: &Report) -> Result<()>;
    async fn get_report(&self, id: Uuid) -> Result<Option<Report>>;
    async fn list_recent_reports(&self, limit: usize) -> Result<Vec<ReportSummary>>;
}

/// Everything the HTTP surface and report pipeline need from one backend.
pub trait Store: DirectoryStore + ActivityStore + FarmerStore + TicketStore + ReportPersister {}

impl<T> Store for T where
    T: DirectoryStore + ActivityStore + FarmerStore + TicketStore + ReportPersister
{
}
