//! Order lifecycle.
//!
//! ```text
//! pending ──> in_progress ──> finished
//!    │             │    └───> failure
//!    └──────┬──────┘
//!           v
//!       cancelled
//! ```
//!
//! Only the store creates orders, always as `pending`. Terminal statuses
//! have no way out.

use tracing::info;

use crate::config::TransitionPolicy;
use crate::error::AppError;
use crate::models::order::OrderStatus;
use crate::models::patch::{PatchOperation, OP_REPLACE, PATH_STATUS};
use crate::state::AppState;
use crate::store::StoreError;

pub fn legal_predecessors(target: OrderStatus) -> &'static [OrderStatus] {
    match target {
        OrderStatus::Pending => &[],
        OrderStatus::InProgress => &[OrderStatus::Pending],
        OrderStatus::Finished | OrderStatus::Failure => &[OrderStatus::InProgress],
        OrderStatus::Cancelled => &[OrderStatus::Pending, OrderStatus::InProgress],
    }
}

pub fn can_transition(from: OrderStatus, to: OrderStatus) -> bool {
    legal_predecessors(to).contains(&from)
}

/// Statuses an order may currently hold for a patch to `target` to apply.
/// Under the strict policy `in_progress` is only reached by assigning a
/// mechanic, so an order never becomes active without an owner.
pub fn allowed_from(policy: TransitionPolicy, target: OrderStatus) -> &'static [OrderStatus] {
    match (policy, target) {
        (TransitionPolicy::Strict, OrderStatus::InProgress) => &[],
        (TransitionPolicy::Strict, _) => legal_predecessors(target),
        (TransitionPolicy::Permissive, _) => &OrderStatus::ALL,
    }
}

/// Checks the shape of a PATCH body and returns the requested status.
pub fn validate_patch(ops: &[PatchOperation]) -> Result<OrderStatus, AppError> {
    let op = match ops {
        [op] => op,
        [] => return Err(AppError::BadRequest("missing patch operation".to_string())),
        _ => return Err(AppError::BadRequest("only one op is permitted".to_string())),
    };

    if op.op.is_empty() {
        return Err(AppError::BadRequest("missing patch operation".to_string()));
    }
    if op.path.is_empty() {
        return Err(AppError::BadRequest("missing patch path".to_string()));
    }
    if op.op != OP_REPLACE {
        return Err(AppError::BadRequest(format!(
            "unsupported patch operation: {}",
            op.op
        )));
    }
    if op.path != PATH_STATUS {
        return Err(AppError::BadRequest(format!(
            "unsupported patch path: {}",
            op.path
        )));
    }

    let value = op.value.as_deref().unwrap_or_default();
    if value.is_empty() {
        return Err(AppError::BadRequest(
            "missing new value on replace operation".to_string(),
        ));
    }

    value
        .parse::<OrderStatus>()
        .map_err(|_| AppError::InvalidStatus(value.to_string()))
}

pub async fn apply_patch(
    state: &AppState,
    order_id: i64,
    ops: &[PatchOperation],
) -> Result<(), AppError> {
    let outcome = |label: &str| {
        state
            .metrics
            .order_transitions_total
            .with_label_values(&[label])
            .inc();
    };

    let target = match validate_patch(ops) {
        Ok(target) => target,
        Err(err) => {
            outcome("invalid");
            return Err(err);
        }
    };

    let allowed = allowed_from(state.transition_policy, target);
    match state.store.update_status(order_id, target, allowed).await {
        Ok(()) => {
            outcome("applied");
            info!(order_id, status = %target, "order status updated");
            Ok(())
        }
        Err(StoreError::NoRowsAffected) => {
            // Either the id is unknown or the current status is not an
            // allowed predecessor.
            let current = state.store.get_by_id(order_id).await.inspect_err(|_| {
                outcome("not_found");
            })?;
            outcome("rejected");
            Err(AppError::Conflict(format!(
                "order {order_id} cannot move from {} to {target}",
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

    fn op(op: &str, path: &str, value: Option<&str>) -> PatchOperation {
        PatchOperation {
            op: op.to_string(),
            path: path.to_string(),
            value: value.map(str::to_string),
        }
    }

    fn message(err: AppError) -> String {
        err.public_message()
    }

    #[test]
    fn lifecycle_table() {
        use OrderStatus::*;

        assert!(can_transition(Pending, InProgress));
        assert!(can_transition(InProgress, Finished));
        assert!(can_transition(InProgress, Failure));
        assert!(can_transition(Pending, Cancelled));
        assert!(can_transition(InProgress, Cancelled));

        assert!(!can_transition(Pending, Finished));
        assert!(!can_transition(Pending, Pending));
        assert!(!can_transition(InProgress, Pending));
    }

    #[test]
    fn terminal_statuses_have_no_exit() {
        for from in OrderStatus::ALL.into_iter().filter(|s| s.is_terminal()) {
            for to in OrderStatus::ALL {
                assert!(!can_transition(from, to), "{from} -> {to} must be illegal");
            }
        }
    }

    #[test]
    fn nothing_transitions_into_pending() {
        assert!(legal_predecessors(OrderStatus::Pending).is_empty());
    }

    #[test]
    fn permissive_policy_allows_every_predecessor() {
        assert_eq!(
            allowed_from(TransitionPolicy::Permissive, OrderStatus::Pending),
            &OrderStatus::ALL
        );
        assert_eq!(
            allowed_from(TransitionPolicy::Strict, OrderStatus::Finished),
            &[OrderStatus::InProgress]
        );
    }

    #[test]
    fn strict_patch_never_starts_an_order() {
        assert!(allowed_from(TransitionPolicy::Strict, OrderStatus::InProgress).is_empty());
        assert!(can_transition(OrderStatus::Pending, OrderStatus::InProgress));
    }

    #[test]
    fn accepts_single_replace_of_status() {
        let ops = [PatchOperation::replace_status("finished")];
        assert_eq!(validate_patch(&ops).unwrap(), OrderStatus::Finished);
    }

    #[test]
    fn rejects_more_than_one_operation() {
        let ops = [
            PatchOperation::replace_status("finished"),
            PatchOperation::replace_status("cancelled"),
        ];
        assert_eq!(message(validate_patch(&ops).unwrap_err()), "only one op is permitted");
    }

    #[test]
    fn rejects_missing_op_or_path() {
        assert_eq!(
            message(validate_patch(&[op("", "status", Some("finished"))]).unwrap_err()),
            "missing patch operation"
        );
        assert_eq!(
            message(validate_patch(&[op("replace", "", Some("finished"))]).unwrap_err()),
            "missing patch path"
        );
        assert_eq!(
            message(validate_patch(&[]).unwrap_err()),
            "missing patch operation"
        );
    }

    #[test]
    fn rejects_empty_value() {
        for value in [None, Some("")] {
            let err = validate_patch(&[op("replace", "status", value)]).unwrap_err();
            assert_eq!(message(err), "missing new value on replace operation");
        }
    }

    #[test]
    fn rejects_unknown_status() {
        let err = validate_patch(&[PatchOperation::replace_status("done")]).unwrap_err();
        assert!(matches!(err, AppError::InvalidStatus(ref v) if v == "done"));
    }

    #[test]
    fn rejects_other_operations_and_paths() {
        assert!(validate_patch(&[op("remove", "status", Some("finished"))]).is_err());
        assert!(validate_patch(&[op("replace", "mechanic_id", Some("3"))]).is_err());
    }
}
