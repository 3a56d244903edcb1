use tracing::{info, warn};

use crate::config::TransitionPolicy;
use crate::error::AppError;
use crate::models::claims::{Claims, ClientType};
use crate::state::AppState;
use crate::store::{AssignGuard, StoreError};

fn guard_for(policy: TransitionPolicy) -> AssignGuard {
    match policy {
        TransitionPolicy::Strict => AssignGuard::UnassignedOrSameMechanic,
        TransitionPolicy::Permissive => AssignGuard::Any,
    }
}

/// Mechanics may only commit themselves; admins may commit anyone.
pub fn authorize_assignment(claims: &Claims, mechanic_id: i64) -> Result<(), AppError> {
    match claims.client_type {
        ClientType::Admin => Ok(()),
        ClientType::Mechanic if claims.client_id == mechanic_id => Ok(()),
        ClientType::Mechanic => Err(AppError::Forbidden(
            "mechanics may only assign themselves".to_string(),
        )),
        ClientType::User => Err(AppError::Forbidden(
            "users may not assign mechanics".to_string(),
        )),
    }
}

/// Commit `mechanic_id` to `order_id`: mechanic and `in_progress` status
/// are written together in one conditional statement.
pub async fn assign_mechanic(
    state: &AppState,
    order_id: i64,
    mechanic_id: i64,
) -> Result<(), AppError> {
    if order_id <= 0 {
        return Err(AppError::BadRequest("invalid order id".to_string()));
    }
    if mechanic_id == 0 {
        return Err(AppError::BadRequest("missing mechanic id".to_string()));
    }
    if mechanic_id < 0 {
        return Err(AppError::BadRequest("invalid mechanic id".to_string()));
    }

    let outcome = |label: &str| {
        state
            .metrics
            .mechanic_assignments_total
            .with_label_values(&[label])
            .inc();
    };

    let guard = guard_for(state.transition_policy);
    match state.store.assign_mechanic(order_id, mechanic_id, guard).await {
        Ok(()) => {
            outcome("assigned");
            info!(order_id, mechanic_id, "mechanic assigned to order");
            Ok(())
        }
        Err(StoreError::NoRowsAffected) => {
            let current = state.store.get_by_id(order_id).await.inspect_err(|_| {
                outcome("not_found");
            })?;
            outcome("conflict");
            warn!(
                order_id,
                mechanic_id,
                status = %current.status,
                holder = ?current.mechanic_id,
                "mechanic assignment rejected"
            );
            Err(AppError::Conflict(format!(
                "order {order_id} is {} and cannot be assigned to mechanic {mechanic_id}",
                current.status
            )))
        }
        Err(err) => {
            outcome("error");
            Err(err.into())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strict_policy_guards_existing_assignments() {
        assert_eq!(
            guard_for(TransitionPolicy::Strict),
            AssignGuard::UnassignedOrSameMechanic
        );
        assert_eq!(guard_for(TransitionPolicy::Permissive), AssignGuard::Any);
    }

    #[test]
    fn only_the_mechanic_or_an_admin_may_assign() {
        assert!(authorize_assignment(&Claims::new(ClientType::Mechanic, 9), 9).is_ok());
        assert!(authorize_assignment(&Claims::new(ClientType::Admin, 1), 9).is_ok());
        assert!(authorize_assignment(&Claims::new(ClientType::Mechanic, 8), 9).is_err());
        assert!(authorize_assignment(&Claims::new(ClientType::User, 9), 9).is_err());
    }
}
