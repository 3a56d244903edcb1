use std::sync::atomic::{AtomicI64, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tokio::sync::Mutex;

use crate::models::order::{NewServiceOrder, OrderStatus, ServiceOrder};
use crate::store::{AssignGuard, OrderFilter, OrderScope, OrderStore, StoreError};

/// In-process order store. Writes are serialized by `write_lock` so the
/// active-order check and the insert behave like the unique partial index
/// of the PostgreSQL schema.
pub struct MemoryOrderStore {
    orders: DashMap<i64, ServiceOrder>,
    next_id: AtomicI64,
    write_lock: Mutex<()>,
}

impl Default for MemoryOrderStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryOrderStore {
    pub fn new() -> Self {
        Self {
            orders: DashMap::new(),
            next_id: AtomicI64::new(1),
            write_lock: Mutex::new(()),
        }
    }

    pub fn len(&self) -> usize {
        self.orders.len()
    }

    pub fn is_empty(&self) -> bool {
        self.orders.is_empty()
    }

    fn user_has_other_active(&self, user_id: i64, except: Option<i64>) -> bool {
        self.orders.iter().any(|entry| {
            let order = entry.value();
            order.user_id == user_id && order.status.is_active() && Some(order.order_id) != except
        })
    }
}

fn stamp_transition(order: &mut ServiceOrder, status: OrderStatus, now: DateTime<Utc>) {
    order.status = status;
    match status {
        OrderStatus::InProgress => {
            order.started_at.get_or_insert(now);
        }
        OrderStatus::Finished | OrderStatus::Failure => {
            order.finished_at.get_or_insert(now);
        }
        OrderStatus::Cancelled => {
            order.cancelled_at.get_or_insert(now);
        }
        OrderStatus::Pending => {}
    }
}

#[async_trait]
impl OrderStore for MemoryOrderStore {
    async fn create(&self, order: NewServiceOrder) -> Result<ServiceOrder, StoreError> {
        let _guard = self.write_lock.lock().await;

        if self.user_has_other_active(order.user_id, None) {
            return Err(StoreError::ActiveOrderExists);
        }

        let order_id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let created = order.into_pending(order_id, Utc::now());
        self.orders.insert(order_id, created.clone());

        Ok(created)
    }

    async fn get_by_id(&self, order_id: i64) -> Result<ServiceOrder, StoreError> {
        self.orders
            .get(&order_id)
            .map(|entry| entry.value().clone())
            .ok_or(StoreError::NotFound)
    }

    async fn list_active_by_user(&self, user_id: i64) -> Result<Vec<ServiceOrder>, StoreError> {
        let filter = OrderFilter::new(OrderScope::User(user_id))
            .with_statuses(OrderStatus::ACTIVE);
        self.list(&filter).await
    }

    async fn list(&self, filter: &OrderFilter) -> Result<Vec<ServiceOrder>, StoreError> {
        let mut orders: Vec<ServiceOrder> = self
            .orders
            .iter()
            .filter(|entry| filter.matches(entry.value()))
            .map(|entry| entry.value().clone())
            .collect();
        orders.sort_by_key(|order| order.order_id);
        Ok(orders)
    }

    async fn update_status(
        &self,
        order_id: i64,
        status: OrderStatus,
        allowed_from: &[OrderStatus],
    ) -> Result<(), StoreError> {
        let _guard = self.write_lock.lock().await;

        let user_id = match self.orders.get(&order_id) {
            Some(entry) if allowed_from.contains(&entry.status) => entry.user_id,
            _ => return Err(StoreError::NoRowsAffected),
        };

        if status.is_active() && self.user_has_other_active(user_id, Some(order_id)) {
            return Err(StoreError::ActiveOrderExists);
        }

        let mut order = self
            .orders
            .get_mut(&order_id)
            .ok_or(StoreError::NoRowsAffected)?;
        stamp_transition(&mut order, status, Utc::now());

        Ok(())
    }

    async fn assign_mechanic(
        &self,
        order_id: i64,
        mechanic_id: i64,
        guard: AssignGuard,
    ) -> Result<(), StoreError> {
        let _guard = self.write_lock.lock().await;

        let user_id = match self.orders.get(&order_id) {
            Some(entry) if guard.admits(&entry, mechanic_id) => entry.user_id,
            _ => return Err(StoreError::NoRowsAffected),
        };

        if self.user_has_other_active(user_id, Some(order_id)) {
            return Err(StoreError::ActiveOrderExists);
        }

        let mut order = self
            .orders
            .get_mut(&order_id)
            .ok_or(StoreError::NoRowsAffected)?;
        order.mechanic_id = Some(mechanic_id);
        stamp_transition(&mut order, OrderStatus::InProgress, Utc::now());

        Ok(())
    }

    fn backend_name(&self) -> &'static str {
        "memory"
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;

    fn new_order(user_id: i64) -> NewServiceOrder {
        NewServiceOrder {
            user_id,
            service_id: 3,
            lat: 19.4,
            lng: -99.1,
        }
    }

    #[tokio::test]
    async fn create_assigns_increasing_ids_and_pending_status() {
        let store = MemoryOrderStore::new();
        let first = store.create(new_order(1)).await.unwrap();
        let second = store.create(new_order(2)).await.unwrap();

        assert!(first.order_id > 0);
        assert!(second.order_id > first.order_id);
        assert_eq!(first.status, OrderStatus::Pending);
        assert!(first.created_at.is_some());
    }

    #[tokio::test]
    async fn second_active_order_for_same_user_is_rejected() {
        let store = MemoryOrderStore::new();
        store.create(new_order(7)).await.unwrap();

        let err = store.create(new_order(7)).await.unwrap_err();
        assert!(matches!(err, StoreError::ActiveOrderExists));
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn user_may_create_again_after_terminal_status() {
        let store = MemoryOrderStore::new();
        let order = store.create(new_order(7)).await.unwrap();
        store
            .update_status(order.order_id, OrderStatus::Cancelled, &[OrderStatus::Pending])
            .await
            .unwrap();

        assert!(store.create(new_order(7)).await.is_ok());
    }

    #[tokio::test]
    async fn concurrent_creates_leave_exactly_one_active_order() {
        let store = Arc::new(MemoryOrderStore::new());
        let mut handles = Vec::new();
        for _ in 0..16 {
            let store = store.clone();
            handles.push(tokio::spawn(async move { store.create(new_order(5)).await }));
        }

        let mut created = 0;
        for handle in handles {
            if handle.await.unwrap().is_ok() {
                created += 1;
            }
        }

        assert_eq!(created, 1);
        assert_eq!(store.list_active_by_user(5).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn update_status_on_unknown_id_affects_no_rows() {
        let store = MemoryOrderStore::new();
        let err = store
            .update_status(42, OrderStatus::Finished, &OrderStatus::ALL)
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::NoRowsAffected));
    }

    #[tokio::test]
    async fn update_status_respects_allowed_predecessors() {
        let store = MemoryOrderStore::new();
        let order = store.create(new_order(1)).await.unwrap();

        let err = store
            .update_status(order.order_id, OrderStatus::Finished, &[OrderStatus::InProgress])
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::NoRowsAffected));
        assert_eq!(
            store.get_by_id(order.order_id).await.unwrap().status,
            OrderStatus::Pending
        );
    }

    #[tokio::test]
    async fn lifecycle_timestamps_are_set_once() {
        let store = MemoryOrderStore::new();
        let order = store.create(new_order(1)).await.unwrap();

        store
            .assign_mechanic(order.order_id, 9, AssignGuard::Any)
            .await
            .unwrap();
        let started = store.get_by_id(order.order_id).await.unwrap().started_at;
        assert!(started.is_some());

        store
            .assign_mechanic(order.order_id, 9, AssignGuard::Any)
            .await
            .unwrap();
        store
            .update_status(order.order_id, OrderStatus::Finished, &[OrderStatus::InProgress])
            .await
            .unwrap();

        let finished = store.get_by_id(order.order_id).await.unwrap();
        assert_eq!(finished.started_at, started);
        assert!(finished.finished_at.is_some());
        assert!(finished.cancelled_at.is_none());
    }

    #[tokio::test]
    async fn guarded_assignment_rejects_a_second_mechanic() {
        let store = MemoryOrderStore::new();
        let order = store.create(new_order(1)).await.unwrap();
        let guard = AssignGuard::UnassignedOrSameMechanic;

        store.assign_mechanic(order.order_id, 9, guard).await.unwrap();
        store.assign_mechanic(order.order_id, 9, guard).await.unwrap();
        let err = store
            .assign_mechanic(order.order_id, 10, guard)
            .await
            .unwrap_err();

        assert!(matches!(err, StoreError::NoRowsAffected));
        assert_eq!(
            store.get_by_id(order.order_id).await.unwrap().mechanic_id,
            Some(9)
        );
    }

    #[tokio::test]
    async fn guarded_assignment_claims_an_unowned_in_progress_order() {
        let store = MemoryOrderStore::new();
        let order = store.create(new_order(1)).await.unwrap();
        store
            .update_status(order.order_id, OrderStatus::InProgress, &OrderStatus::ALL)
            .await
            .unwrap();

        store
            .assign_mechanic(order.order_id, 9, AssignGuard::UnassignedOrSameMechanic)
            .await
            .unwrap();

        let assigned = store.get_by_id(order.order_id).await.unwrap();
        assert_eq!(assigned.mechanic_id, Some(9));
        assert_eq!(assigned.status, OrderStatus::InProgress);
    }

    #[tokio::test]
    async fn list_is_scoped_by_user_and_mechanic() {
        let store = MemoryOrderStore::new();
        let a = store.create(new_order(1)).await.unwrap();
        store.create(new_order(2)).await.unwrap();
        store.assign_mechanic(a.order_id, 9, AssignGuard::Any).await.unwrap();

        let all = store.list(&OrderFilter::new(OrderScope::All)).await.unwrap();
        let mine = store.list(&OrderFilter::new(OrderScope::User(1))).await.unwrap();
        let assigned = store
            .list(&OrderFilter::new(OrderScope::Mechanic(9)))
            .await
            .unwrap();
        let pending = store
            .list(&OrderFilter::new(OrderScope::All).with_statuses([OrderStatus::Pending]))
            .await
            .unwrap();

        assert_eq!(all.len(), 2);
        assert_eq!(mine.len(), 1);
        assert_eq!(assigned[0].order_id, a.order_id);
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].user_id, 2);
    }
}
