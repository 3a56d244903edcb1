use serde::Deserialize;
use tracing::info;

use crate::error::AppError;
use crate::models::claims::{Claims, ClientType};
use crate::models::order::{NewServiceOrder, ServiceOrder};
use crate::state::AppState;

/// Body of `POST /order`. Any `status`, id or timestamp a client sends is
/// ignored; the store owns those.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct CreateOrderRequest {
    #[serde(default)]
    pub user_id: i64,
    #[serde(default)]
    pub service_id: i64,
    #[serde(default)]
    pub lat: f64,
    #[serde(default)]
    pub lng: f64,
}

pub fn validate_new_order(request: &CreateOrderRequest) -> Result<NewServiceOrder, AppError> {
    if request.user_id == 0 {
        return Err(AppError::BadRequest("missing user id".to_string()));
    }
    if request.user_id < 0 {
        return Err(AppError::BadRequest("invalid user id".to_string()));
    }
    if request.service_id == 0 {
        return Err(AppError::BadRequest("missing service id".to_string()));
    }
    if request.service_id < 0 {
        return Err(AppError::BadRequest("invalid service id".to_string()));
    }
    if request.lat == 0.0 || request.lng == 0.0 {
        return Err(AppError::BadRequest("missing location".to_string()));
    }
    if !(-90.0..=90.0).contains(&request.lat) || !(-180.0..=180.0).contains(&request.lng) {
        return Err(AppError::BadRequest("invalid location".to_string()));
    }

    Ok(NewServiceOrder {
        user_id: request.user_id,
        service_id: request.service_id,
        lat: request.lat,
        lng: request.lng,
    })
}

fn authorize_creation(claims: &Claims, order: &NewServiceOrder) -> Result<(), AppError> {
    match claims.client_type {
        ClientType::Admin => Ok(()),
        ClientType::User if claims.client_id == order.user_id => Ok(()),
        ClientType::User => Err(AppError::Forbidden(
            "users may only create orders for themselves".to_string(),
        )),
        ClientType::Mechanic => Err(AppError::Forbidden(
            "mechanics may not create orders".to_string(),
        )),
    }
}

/// Validate, store as pending, then publish for assignment.
pub async fn create_order(
    state: &AppState,
    claims: &Claims,
    request: &CreateOrderRequest,
) -> Result<ServiceOrder, AppError> {
    let new_order = validate_new_order(request)?;
    authorize_creation(claims, &new_order)?;

    // Fast path only; the store enforces the same rule atomically.
    let active = state.store.list_active_by_user(new_order.user_id).await?;
    if !active.is_empty() {
        return Err(AppError::ActiveOrderExists);
    }

    let order = state.store.create(new_order).await?;
    state.metrics.orders_created_total.inc();
    info!(
        order_id = order.order_id,
        user_id = order.user_id,
        service_id = order.service_id,
        "service order created"
    );

    state.publisher.publish(&order).await?;

    Ok(order)
}
