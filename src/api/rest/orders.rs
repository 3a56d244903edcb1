use std::sync::Arc;

use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::routing::{get, post, put};
use axum::Json;
use axum::Router;
use serde::Deserialize;

use crate::auth::Authenticated;
use crate::engine::{assignment, intake, state_machine};
use crate::error::AppError;
use crate::models::claims::{Claims, ClientType};
use crate::models::order::{OrderStatus, ServiceOrder};
use crate::models::patch::PatchOperation;
use crate::state::AppState;
use crate::store::{OrderFilter, OrderScope};

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/order", post(create_order).get(list_orders))
        .route("/order/current", get(current_orders))
        .route("/order/past", get(past_orders))
        .route("/order/:id", get(get_order).patch(patch_order))
        .route("/order/:id/mechanic", put(assign_mechanic))
}

#[derive(Debug, Default, Deserialize)]
pub struct ListQuery {
    /// Comma separated statuses; empty means all.
    pub status: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct AssignQuery {
    pub mechanic_id: Option<String>,
}

fn parse_order_id(raw: &str) -> Result<i64, AppError> {
    raw.parse::<i64>()
        .ok()
        .filter(|id| *id > 0)
        .ok_or_else(|| AppError::BadRequest("invalid order id".to_string()))
}

fn parse_statuses(raw: Option<&str>) -> Result<Vec<OrderStatus>, AppError> {
    raw.unwrap_or_default()
        .split(',')
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(|value| {
            value
                .parse::<OrderStatus>()
                .map_err(|_| AppError::InvalidStatus(value.to_string()))
        })
        .collect()
}

/// Admins see every order, users their own, mechanics the ones they hold.
fn scope_for(claims: &Claims) -> OrderScope {
    match claims.client_type {
        ClientType::Admin => OrderScope::All,
        ClientType::User => OrderScope::User(claims.client_id),
        ClientType::Mechanic => OrderScope::Mechanic(claims.client_id),
    }
}

async fn create_order(
    State(state): State<Arc<AppState>>,
    Authenticated(claims): Authenticated,
    payload: Result<Json<intake::CreateOrderRequest>, JsonRejection>,
) -> Result<Json<ServiceOrder>, AppError> {
    let Json(request) = payload?;
    let order = intake::create_order(&state, &claims, &request).await?;
    Ok(Json(order))
}

async fn list_orders(
    State(state): State<Arc<AppState>>,
    Authenticated(claims): Authenticated,
    Query(query): Query<ListQuery>,
) -> Result<Json<Vec<ServiceOrder>>, AppError> {
    let statuses = parse_statuses(query.status.as_deref())?;
    let filter = OrderFilter::new(scope_for(&claims)).with_statuses(statuses);
    Ok(Json(state.store.list(&filter).await?))
}

async fn current_orders(
    State(state): State<Arc<AppState>>,
    Authenticated(claims): Authenticated,
) -> Result<Json<Vec<ServiceOrder>>, AppError> {
    let filter = OrderFilter::new(scope_for(&claims)).with_statuses(OrderStatus::ACTIVE);
    Ok(Json(state.store.list(&filter).await?))
}

async fn past_orders(
    State(state): State<Arc<AppState>>,
    Authenticated(claims): Authenticated,
) -> Result<Json<Vec<ServiceOrder>>, AppError> {
    let filter = OrderFilter::new(scope_for(&claims)).with_statuses([OrderStatus::Finished]);
    Ok(Json(state.store.list(&filter).await?))
}

async fn get_order(
    State(state): State<Arc<AppState>>,
    Authenticated(_claims): Authenticated,
    Path(id): Path<String>,
) -> Result<Json<ServiceOrder>, AppError> {
    let order_id = parse_order_id(&id)?;
    let order = state
        .store
        .get_by_id(order_id)
        .await
        .map_err(|err| match AppError::from(err) {
            AppError::NotFound(_) => AppError::NotFound(format!("order {order_id} not found")),
            other => other,
        })?;

    Ok(Json(order))
}

async fn patch_order(
    State(state): State<Arc<AppState>>,
    Authenticated(_claims): Authenticated,
    Path(id): Path<String>,
    payload: Result<Json<Vec<PatchOperation>>, JsonRejection>,
) -> Result<StatusCode, AppError> {
    let order_id = parse_order_id(&id)?;
    let Json(ops) = payload?;
    state_machine::apply_patch(&state, order_id, &ops).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn assign_mechanic(
    State(state): State<Arc<AppState>>,
    Authenticated(claims): Authenticated,
    Path(id): Path<String>,
    Query(query): Query<AssignQuery>,
) -> Result<Json<&'static str>, AppError> {
    let order_id = parse_order_id(&id)?;
    let mechanic_id = match query.mechanic_id.as_deref().map(str::trim) {
        None | Some("") => 0,
        Some(raw) => raw
            .parse::<i64>()
            .map_err(|_| AppError::BadRequest("invalid mechanic id".to_string()))?,
    };

    if mechanic_id > 0 {
        assignment::authorize_assignment(&claims, mechanic_id)?;
    }
    assignment::assign_mechanic(&state, order_id, mechanic_id).await?;
    Ok(Json("ok"))
}
