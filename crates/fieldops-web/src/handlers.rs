use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use chrono::{DateTime, Utc};
use fieldops_core::{
    Cce, CceUpdate, Farmer, FarmerFilter, FarmerUpdate, Report, ReportSummary, Shoot, ShootKind,
    ShootStatus, Ticket, TicketSort, TicketUpdate,
};
use serde::Deserialize;
use serde_json::json;
use tracing::info;
use uuid::Uuid;

use crate::{ApiError, AppState, AuthUser};

type ApiResult<T> = Result<T, ApiError>;
type AppStateRef = State<Arc<AppState>>;

const DEFAULT_PAGE: usize = 20;
const MAX_PAGE: usize = 100;

fn new_id(id: Option<String>) -> String {
    id.filter(|v| !v.is_empty())
        .unwrap_or_else(|| Uuid::new_v4().to_string())
}

fn require(value: &str, field: &str) -> ApiResult<()> {
    if value.trim().is_empty() {
        return Err(ApiError::bad_request(format!("{field} is required")));
    }
    Ok(())
}

fn parse_date(raw: &str, field: &str) -> ApiResult<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|d| d.with_timezone(&Utc))
        .map_err(|_| ApiError::bad_request(format!("invalid {field} format")))
}

fn date_range(
    start: Option<&str>,
    end: Option<&str>,
) -> ApiResult<Option<(DateTime<Utc>, DateTime<Utc>)>> {
    match (start, end) {
        (None, None) => Ok(None),
        (Some(start), Some(end)) => Ok(Some((
            parse_date(start, "startDate")?,
            parse_date(end, "endDate")?,
        ))),
        _ => Err(ApiError::bad_request("startDate and endDate are required together")),
    }
}

fn page_limit(limit: Option<usize>) -> usize {
    limit.unwrap_or(DEFAULT_PAGE).clamp(1, MAX_PAGE)
}

pub async fn health() -> Json<serde_json::Value> {
    Json(json!({ "status": "ok" }))
}

// agents

#[derive(Debug, Deserialize)]
pub struct NewCce {
    id: Option<String>,
    #[serde(default)]
    name: String,
}

pub async fn list_cces(State(state): AppStateRef) -> ApiResult<Json<Vec<Cce>>> {
    Ok(Json(state.cces.list_all().await?))
}

pub async fn get_cce(State(state): AppStateRef, Path(id): Path<String>) -> ApiResult<Json<Cce>> {
    state
        .cces
        .get_cce(&id)
        .await?
        .map(Json)
        .ok_or_else(|| ApiError::not_found("cce"))
}

pub async fn create_cce(
    State(state): AppStateRef,
    AuthUser(claims): AuthUser,
    Json(body): Json<NewCce>,
) -> ApiResult<(StatusCode, Json<Cce>)> {
    require(&body.name, "name")?;
    let cce = Cce {
        id: new_id(body.id),
        name: body.name,
    };
    state.cces.create_cce(&cce).await?;
    info!(cce_id = %cce.id, by = %claims.sub, "cce created");
    Ok((StatusCode::CREATED, Json(cce)))
}

pub async fn update_cce(
    State(state): AppStateRef,
    AuthUser(_): AuthUser,
    Path(id): Path<String>,
    Json(update): Json<CceUpdate>,
) -> ApiResult<Json<Cce>> {
    let mut cce = state
        .cces
        .get_cce(&id)
        .await?
        .ok_or_else(|| ApiError::not_found("cce"))?;
    cce.apply_update(update);
    if !state.cces.update_cce(&cce).await? {
        return Err(ApiError::not_found("cce"));
    }
    Ok(Json(cce))
}

pub async fn delete_cce(
    State(state): AppStateRef,
    AuthUser(claims): AuthUser,
    Path(id): Path<String>,
) -> ApiResult<StatusCode> {
    if !state.cces.delete_cce(&id).await? {
        return Err(ApiError::not_found("cce"));
    }
    info!(cce_id = %id, by = %claims.sub, "cce deleted");
    Ok(StatusCode::NO_CONTENT)
}

// farmers

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewFarmer {
    id: Option<String>,
    #[serde(flatten)]
    fields: FarmerUpdate,
}

pub async fn list_farmers(
    State(state): AppStateRef,
    Query(filter): Query<FarmerFilter>,
) -> ApiResult<Json<Vec<Farmer>>> {
    Ok(Json(state.farmers.list_farmers(&filter).await?))
}

pub async fn get_farmer(
    State(state): AppStateRef,
    Path(id): Path<String>,
) -> ApiResult<Json<Farmer>> {
    state
        .farmers
        .get_farmer(&id)
        .await?
        .map(Json)
        .ok_or_else(|| ApiError::not_found("farmer"))
}

pub async fn get_farmer_by_contact(
    State(state): AppStateRef,
    Path(contact): Path<String>,
) -> ApiResult<Json<Farmer>> {
    state
        .farmers
        .get_farmer_by_contact(&contact)
        .await?
        .map(Json)
        .ok_or_else(|| ApiError::not_found("farmer"))
}

pub async fn create_farmer(
    State(state): AppStateRef,
    AuthUser(_): AuthUser,
    Json(body): Json<NewFarmer>,
) -> ApiResult<(StatusCode, Json<Farmer>)> {
    let mut farmer = Farmer {
        id: new_id(body.id),
        ..Default::default()
    };
    farmer.apply_update(body.fields);
    require(&farmer.name, "name")?;
    require(&farmer.contact, "contact")?;
    state.farmers.create_farmer(&farmer).await?;
    Ok((StatusCode::CREATED, Json(farmer)))
}

pub async fn update_farmer(
    State(state): AppStateRef,
    AuthUser(_): AuthUser,
    Path(id): Path<String>,
    Json(update): Json<FarmerUpdate>,
) -> ApiResult<Json<Farmer>> {
    let mut farmer = state
        .farmers
        .get_farmer(&id)
        .await?
        .ok_or_else(|| ApiError::not_found("farmer"))?;
    farmer.apply_update(update);
    if !state.farmers.update_farmer(&farmer).await? {
        return Err(ApiError::not_found("farmer"));
    }
    Ok(Json(farmer))
}

pub async fn delete_farmer(
    State(state): AppStateRef,
    AuthUser(_): AuthUser,
    Path(id): Path<String>,
) -> ApiResult<StatusCode> {
    if !state.farmers.delete_farmer(&id).await? {
        return Err(ApiError::not_found("farmer"));
    }
    Ok(StatusCode::NO_CONTENT)
}

// tickets

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TicketQuery {
    status: Option<String>,
    sort_by: Option<String>,
    sort_order: Option<String>,
    limit: Option<usize>,
    next_token: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RangeQuery {
    start_date: Option<String>,
    end_date: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewTicket {
    id: Option<String>,
    #[serde(default)]
    farmer_id: String,
    #[serde(default)]
    cce_id: String,
    #[serde(default)]
    description: String,
    status: Option<String>,
}

pub async fn list_tickets(
    State(state): AppStateRef,
    Query(query): Query<TicketQuery>,
) -> ApiResult<Response> {
    if let Some(status) = query.status.filter(|s| !s.is_empty()) {
        let sort = TicketSort::parse(
            query.sort_by.as_deref().unwrap_or_default(),
            query.sort_order.as_deref().unwrap_or_default(),
        );
        let tickets = state.tickets.list_tickets_by_status(&status, sort).await?;
        return Ok(Json(tickets).into_response());
    }

    let page = state
        .tickets
        .list_tickets_page(page_limit(query.limit), query.next_token.as_deref())
        .await?;
    Ok(Json(page).into_response())
}

pub async fn get_ticket(
    State(state): AppStateRef,
    Path(id): Path<String>,
) -> ApiResult<Json<Ticket>> {
    state
        .tickets
        .get_ticket(&id)
        .await?
        .map(Json)
        .ok_or_else(|| ApiError::not_found("ticket"))
}

pub async fn tickets_by_farmer_contact(
    State(state): AppStateRef,
    Path(contact): Path<String>,
) -> ApiResult<Json<Vec<Ticket>>> {
    let farmer = state
        .farmers
        .get_farmer_by_contact(&contact)
        .await?
        .ok_or_else(|| ApiError::not_found("farmer"))?;
    Ok(Json(state.tickets.list_tickets_by_farmer(&farmer.id).await?))
}

pub async fn tickets_by_cce(
    State(state): AppStateRef,
    Path(cce_id): Path<String>,
    Query(range): Query<RangeQuery>,
) -> ApiResult<Json<Vec<Ticket>>> {
    let tickets = match date_range(range.start_date.as_deref(), range.end_date.as_deref())? {
        Some((start, end)) => {
            state
                .tickets
                .list_tickets_by_cce_in_range(&cce_id, start, end)
                .await?
        }
        None => state.tickets.list_tickets_by_cce(&cce_id).await?,
    };
    Ok(Json(tickets))
}

pub async fn tickets_by_cce_and_status(
    State(state): AppStateRef,
    Path((cce_id, status)): Path<(String, String)>,
) -> ApiResult<Json<Vec<Ticket>>> {
    Ok(Json(
        state
            .tickets
            .list_tickets_by_cce_and_status(&cce_id, &status)
            .await?,
    ))
}

pub async fn create_ticket(
    State(state): AppStateRef,
    AuthUser(_): AuthUser,
    Json(body): Json<NewTicket>,
) -> ApiResult<(StatusCode, Json<Ticket>)> {
    require(&body.farmer_id, "farmerId")?;
    require(&body.cce_id, "cceId")?;
    let now = Utc::now();
    let ticket = Ticket {
        id: new_id(body.id),
        farmer_id: body.farmer_id,
        cce_id: body.cce_id,
        description: body.description,
        status: body
            .status
            .filter(|s| !s.is_empty())
            .unwrap_or_else(|| "open".to_string()),
        created_at: now,
        updated_at: now,
    };
    state.tickets.create_ticket(&ticket).await?;
    Ok((StatusCode::CREATED, Json(ticket)))
}

pub async fn update_ticket(
    State(state): AppStateRef,
    AuthUser(_): AuthUser,
    Path(id): Path<String>,
    Json(update): Json<TicketUpdate>,
) -> ApiResult<Json<Ticket>> {
    let mut ticket = state
        .tickets
        .get_ticket(&id)
        .await?
        .ok_or_else(|| ApiError::not_found("ticket"))?;
    ticket.apply_update(update, Utc::now());
    if !state.tickets.update_ticket(&ticket).await? {
        return Err(ApiError::not_found("ticket"));
    }
    Ok(Json(ticket))
}

pub async fn delete_ticket(
    State(state): AppStateRef,
    AuthUser(_): AuthUser,
    Path(id): Path<String>,
) -> ApiResult<StatusCode> {
    if !state.tickets.delete_ticket(&id).await? {
        return Err(ApiError::not_found("ticket"));
    }
    Ok(StatusCode::NO_CONTENT)
}

// shoots

#[derive(Debug, Default, Deserialize)]
pub struct ShootQuery {
    #[serde(rename = "type")]
    kind: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewShoot {
    id: Option<String>,
    #[serde(default)]
    farmer_id: String,
    #[serde(default)]
    cce_id: String,
    #[serde(rename = "type")]
    kind: ShootKind,
    status: ShootStatus,
    timestamp: Option<DateTime<Utc>>,
    #[serde(default, rename = "duration")]
    duration_secs: u32,
}

pub async fn list_shoots(
    State(state): AppStateRef,
    Query(query): Query<ShootQuery>,
) -> ApiResult<Json<Vec<Shoot>>> {
    let kind = match query.kind.as_deref().filter(|k| !k.is_empty()) {
        Some(raw) => Some(
            raw.parse::<ShootKind>()
                .map_err(|_| ApiError::bad_request("invalid shoot type"))?,
        ),
        None => None,
    };
    Ok(Json(state.shoots.list_shoots(kind).await?))
}

pub async fn shoots_in_range(
    State(state): AppStateRef,
    Query(range): Query<RangeQuery>,
) -> ApiResult<Json<Vec<Shoot>>> {
    let (start, end) = date_range(range.start_date.as_deref(), range.end_date.as_deref())?
        .ok_or_else(|| ApiError::bad_request("startDate and endDate are required"))?;
    Ok(Json(state.shoots.list_by_time_range(start, end).await?))
}

pub async fn missed_calls(State(state): AppStateRef) -> ApiResult<Json<Vec<Shoot>>> {
    Ok(Json(state.shoots.list_missed_calls().await?))
}

pub async fn record_shoot(
    State(state): AppStateRef,
    AuthUser(_): AuthUser,
    Json(body): Json<NewShoot>,
) -> ApiResult<(StatusCode, Json<Shoot>)> {
    require(&body.farmer_id, "farmerId")?;
    require(&body.cce_id, "cceId")?;
    let shoot = Shoot {
        id: new_id(body.id),
        farmer_id: body.farmer_id,
        cce_id: body.cce_id,
        kind: body.kind,
        status: body.status,
        timestamp: body.timestamp.unwrap_or_else(Utc::now),
        duration_secs: body.duration_secs,
    };
    state.shoots.record_shoot(&shoot).await?;
    Ok((StatusCode::CREATED, Json(shoot)))
}

// reports

#[derive(Debug, Default, Deserialize)]
pub struct ReportListQuery {
    limit: Option<usize>,
}

pub async fn list_reports(
    State(state): AppStateRef,
    Query(query): Query<ReportListQuery>,
) -> ApiResult<Json<Vec<ReportSummary>>> {
    Ok(Json(
        state
            .reports
            .list_recent_reports(page_limit(query.limit))
            .await?,
    ))
}

pub async fn get_report(
    State(state): AppStateRef,
    Path(id): Path<String>,
) -> ApiResult<Json<Report>> {
    let id = Uuid::parse_str(&id).map_err(|_| ApiError::bad_request("invalid report id"))?;
    state
        .reports
        .get_report(id)
        .await?
        .map(Json)
        .ok_or_else(|| ApiError::not_found("report"))
}

/// Runs the pipeline for the window ending today, inline with the request.
pub async fn run_report(
    State(state): AppStateRef,
    AuthUser(claims): AuthUser,
    Path(kind): Path<String>,
) -> ApiResult<(StatusCode, Json<Report>)> {
    info!(%kind, by = %claims.sub, "ad-hoc report requested");
    let report = state.pipeline.run_named(&kind, Utc::now()).await?;
    Ok((StatusCode::CREATED, Json(report)))
}
