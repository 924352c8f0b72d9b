use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use fieldops_core::{
    Cce, Farmer, FarmerFilter, Page, Report, ReportSummary, Shoot, ShootKind, ShootStatus, Ticket,
    TicketSort,
};
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::{
    ActivityStore, DirectoryStore, FarmerStore, ReportPersister, Result, StoreError, TicketStore,
};

/// Process-local store with the same semantics as [`crate::PgStore`].
#[derive(Debug, Default)]
pub struct MemoryStore {
    state: RwLock<MemoryState>,
}

#[derive(Debug, Default)]
struct MemoryState {
    cces: BTreeMap<String, Cce>,
    farmers: BTreeMap<String, Farmer>,
    tickets: BTreeMap<String, Ticket>,
    shoots: BTreeMap<String, Shoot>,
    reports: BTreeMap<Uuid, Report>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn insert_new<K: Ord + ToString, V>(
    map: &mut BTreeMap<K, V>,
    entity: &'static str,
    key: K,
    value: V,
) -> Result<()> {
    if map.contains_key(&key) {
        return Err(StoreError::Conflict {
            entity,
            id: key.to_string(),
        });
    }
    map.insert(key, value);
    Ok(())
}

fn replace_existing<V: Clone>(map: &mut BTreeMap<String, V>, key: &str, value: &V) -> bool {
    match map.get_mut(key) {
        Some(slot) => {
            *slot = value.clone();
            true
        }
        None => false,
    }
}

fn by_timestamp(mut shoots: Vec<Shoot>) -> Vec<Shoot> {
    shoots.sort_by(|a, b| a.timestamp.cmp(&b.timestamp).then_with(|| a.id.cmp(&b.id)));
    shoots
}

#[async_trait]
impl DirectoryStore for MemoryStore {
    async fn create_cce(&self, cce: &Cce) -> Result<()> {
        let mut state = self.state.write().await;
        insert_new(&mut state.cces, "cce", cce.id.clone(), cce.clone())
    }

    async fn get_cce(&self, id: &str) -> Result<Option<Cce>> {
        Ok(self.state.read().await.cces.get(id).cloned())
    }

    async fn update_cce(&self, cce: &Cce) -> Result<bool> {
        Ok(replace_existing(&mut self.state.write().await.cces, &cce.id, cce))
    }

    async fn delete_cce(&self, id: &str) -> Result<bool> {
        Ok(self.state.write().await.cces.remove(id).is_some())
    }

    async fn list_all(&self) -> Result<Vec<Cce>> {
        Ok(self.state.read().await.cces.values().cloned().collect())
    }
}

#[async_trait]
impl ActivityStore for MemoryStore {
    async fn record_shoot(&self, shoot: &Shoot) -> Result<()> {
        let mut state = self.state.write().await;
        insert_new(&mut state.shoots, "shoot", shoot.id.clone(), shoot.clone())
    }

    async fn list_shoots(&self, kind: Option<ShootKind>) -> Result<Vec<Shoot>> {
        let state = self.state.read().await;
        let shoots = state
            .shoots
            .values()
            .filter(|s| kind.map_or(true, |k| s.kind == k))
            .cloned()
            .collect();
        Ok(by_timestamp(shoots))
    }

    async fn list_by_time_range(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<Shoot>> {
        let state = self.state.read().await;
        let shoots = state
            .shoots
            .values()
            .filter(|s| start <= s.timestamp && s.timestamp < end)
            .cloned()
            .collect();
        Ok(by_timestamp(shoots))
    }

    async fn list_missed_calls(&self) -> Result<Vec<Shoot>> {
        let state = self.state.read().await;
        let shoots = state
            .shoots
            .values()
            .filter(|s| s.kind == ShootKind::Call && s.status == ShootStatus::Missed)
            .cloned()
            .collect();
        Ok(by_timestamp(shoots))
    }
}

#[async_trait]
impl FarmerStore for MemoryStore {
    async fn create_farmer(&self, farmer: &Farmer) -> Result<()> {
        let mut state = self.state.write().await;
        insert_new(&mut state.farmers, "farmer", farmer.id.clone(), farmer.clone())
    }

    async fn get_farmer(&self, id: &str) -> Result<Option<Farmer>> {
        Ok(self.state.read().await.farmers.get(id).cloned())
    }

    async fn get_farmer_by_contact(&self, contact: &str) -> Result<Option<Farmer>> {
        let state = self.state.read().await;
        Ok(state.farmers.values().find(|f| f.contact == contact).cloned())
    }

    async fn list_farmers(&self, filter: &FarmerFilter) -> Result<Vec<Farmer>> {
        let state = self.state.read().await;
        Ok(state
            .farmers
            .values()
            .filter(|f| filter.matches(f))
            .cloned()
            .collect())
    }

    async fn update_farmer(&self, farmer: &Farmer) -> Result<bool> {
        Ok(replace_existing(&mut self.state.write().await.farmers, &farmer.id, farmer))
    }

    async fn delete_farmer(&self, id: &str) -> Result<bool> {
        Ok(self.state.write().await.farmers.remove(id).is_some())
    }
}

impl MemoryState {
    fn tickets_where(&self, pred: impl Fn(&Ticket) -> bool) -> Vec<Ticket> {
        self.tickets.values().filter(|t| pred(t)).cloned().collect()
    }
}

#[async_trait]
impl TicketStore for MemoryStore {
    async fn create_ticket(&self, ticket: &Ticket) -> Result<()> {
        let mut state = self.state.write().await;
        insert_new(&mut state.tickets, "ticket", ticket.id.clone(), ticket.clone())
    }

    async fn get_ticket(&self, id: &str) -> Result<Option<Ticket>> {
        Ok(self.state.read().await.tickets.get(id).cloned())
    }

    async fn list_tickets_page(&self, limit: usize, after: Option<&str>) -> Result<Page<Ticket>> {
        let state = self.state.read().await;
        let limit = limit.max(1);
        let mut items: Vec<Ticket> = state
            .tickets
            .values()
            .filter(|t| after.map_or(true, |a| t.id.as_str() > a))
            .take(limit + 1)
            .cloned()
            .collect();
        let next_token = if items.len() > limit {
            items.truncate(limit);
            items.last().map(|t| t.id.clone())
        } else {
            None
        };
        Ok(Page { items, next_token })
    }

    async fn list_tickets_by_status(
        &self,
        status: &str,
        sort: Option<TicketSort>,
    ) -> Result<Vec<Ticket>> {
        let mut tickets = self.state.read().await.tickets_where(|t| t.status == status);
        if let Some(sort) = sort {
            sort.apply(&mut tickets);
        }
        Ok(tickets)
    }

    async fn list_tickets_by_farmer(&self, farmer_id: &str) -> Result<Vec<Ticket>> {
        Ok(self.state.read().await.tickets_where(|t| t.farmer_id == farmer_id))
    }

    async fn list_tickets_by_cce(&self, cce_id: &str) -> Result<Vec<Ticket>> {
        Ok(self.state.read().await.tickets_where(|t| t.cce_id == cce_id))
    }

    async fn list_tickets_by_cce_in_range(
        &self,
        cce_id: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<Ticket>> {
        Ok(self.state.read().await.tickets_where(|t| {
            t.cce_id == cce_id && start <= t.created_at && t.created_at < end
        }))
    }

    async fn list_tickets_by_cce_and_status(
        &self,
        cce_id: &str,
        status: &str,
    ) -> Result<Vec<Ticket>> {
        Ok(self
            .state
            .read()
            .await
            .tickets_where(|t| t.cce_id == cce_id && t.status == status))
    }

    async fn update_ticket(&self, ticket: &Ticket) -> Result<bool> {
        Ok(replace_existing(&mut self.state.write().await.tickets, &ticket.id, ticket))
    }

    async fn delete_ticket(&self, id: &str) -> Result<bool> {
        Ok(self.state.write().await.tickets.remove(id).is_some())
    }
}

#[async_trait]
impl ReportPersister for MemoryStore {
    async fn save(&self, report: &Report) -> Result<()> {
        let mut state = self.state.write().await;
        insert_new(&mut state.reports, "report", report.id, report.clone())
    }

    async fn get_report(&self, id: Uuid) -> Result<Option<Report>> {
        Ok(self.state.read().await.reports.get(&id).cloned())
    }

    async fn list_recent_reports(&self, limit: usize) -> Result<Vec<ReportSummary>> {
        let state = self.state.read().await;
        let mut summaries: Vec<ReportSummary> =
            state.reports.values().map(ReportSummary::from).collect();
        summaries.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        summaries.truncate(limit);
        Ok(summaries)
    }
}
