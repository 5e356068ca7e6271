//! In-memory [`EntitlementStore`] implementation.
//!
//! All tables live behind a single `parking_lot::Mutex`, which is what makes
//! `purchase` a real transaction: the balance debit, the capacity re-check
//! and the subscription insert happen under one critical section, and a
//! failed guard returns before anything is written. `capacity_snapshot`
//! reads every count under the same lock, so concurrent purchases can never
//! both observe stale low counts and jointly oversell a server — the loser
//! of the race fails the in-transaction capacity guard.

use std::collections::{HashMap, HashSet};

use parking_lot::Mutex;
use tracing::info;
use uuid::Uuid;

use vac_common::{
    now_unix, Plan, Server, ServerLoad, StoreError, Subscription, SubscriptionStatus, User,
};

use crate::{EntitlementStore, PurchaseRequest};

#[derive(Default)]
struct Inner {
    users: HashMap<Uuid, User>,
    users_by_chat: HashMap<i64, Uuid>,
    plans: HashMap<String, Plan>,
    servers: HashMap<String, Server>,
    subscriptions: HashMap<Uuid, Subscription>,
    /// System-wide credential uniqueness index.
    credentials: HashSet<Uuid>,
}

impl Inner {
    fn active_count(&self, server_id: &str) -> u32 {
        self.subscriptions
            .values()
            .filter(|s| s.server_id == server_id && s.status.is_entitled())
            .count() as u32
    }
}

/// Single-process store backed by in-memory tables.
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
        }
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl EntitlementStore for MemoryStore {
    fn upsert_user(&self, chat_id: i64) -> User {
        let mut inner = self.inner.lock();
        let now = now_unix();
        if let Some(id) = inner.users_by_chat.get(&chat_id).copied() {
            let user = inner.users.get_mut(&id).expect("chat index points at user");
            user.updated_at = now;
            return user.clone();
        }
        let user = User {
            id: Uuid::new_v4(),
            chat_id,
            balance: 0,
            created_at: now,
            updated_at: now,
        };
        inner.users_by_chat.insert(chat_id, user.id);
        inner.users.insert(user.id, user.clone());
        info!("user created chat_id={} id={}", chat_id, user.id);
        user
    }

    fn get_user(&self, id: Uuid) -> Result<User, StoreError> {
        self.inner
            .lock()
            .users
            .get(&id)
            .cloned()
            .ok_or(StoreError::UserNotFound)
    }

    fn get_user_by_chat(&self, chat_id: i64) -> Option<User> {
        let inner = self.inner.lock();
        let id = inner.users_by_chat.get(&chat_id)?;
        inner.users.get(id).cloned()
    }

    fn credit_balance(&self, user_id: Uuid, amount: i64) -> Result<i64, StoreError> {
        let mut inner = self.inner.lock();
        let user = inner.users.get_mut(&user_id).ok_or(StoreError::UserNotFound)?;
        user.balance = user.balance.saturating_add(amount);
        user.updated_at = now_unix();
        Ok(user.balance)
    }

    fn remove_user(&self, user_id: Uuid) -> Result<(), StoreError> {
        let mut inner = self.inner.lock();
        let user = inner.users.remove(&user_id).ok_or(StoreError::UserNotFound)?;
        inner.users_by_chat.remove(&user.chat_id);
        // cascade: subscriptions go with the user
        let gone: Vec<Uuid> = inner
            .subscriptions
            .values()
            .filter(|s| s.user_id == user_id)
            .map(|s| s.id)
            .collect();
        for id in gone {
            if let Some(sub) = inner.subscriptions.remove(&id) {
                inner.credentials.remove(&sub.credential);
            }
        }
        Ok(())
    }

    fn insert_plan(&self, plan: Plan) {
        self.inner.lock().plans.insert(plan.id.clone(), plan);
    }

    fn get_plan(&self, id: &str) -> Result<Plan, StoreError> {
        self.inner
            .lock()
            .plans
            .get(id)
            .cloned()
            .ok_or_else(|| StoreError::PlanNotFound(id.to_string()))
    }

    fn list_plans(&self) -> Vec<Plan> {
        let mut plans: Vec<Plan> = self.inner.lock().plans.values().cloned().collect();
        plans.sort_by(|a, b| a.id.cmp(&b.id));
        plans
    }

    fn set_plan_price(&self, id: &str, price: i64) -> Result<(), StoreError> {
        let mut inner = self.inner.lock();
        let plan = inner
            .plans
            .get_mut(id)
            .ok_or_else(|| StoreError::PlanNotFound(id.to_string()))?;
        plan.price = price;
        Ok(())
    }

    fn upsert_server(&self, server: Server) {
        self.inner.lock().servers.insert(server.id.clone(), server);
    }

    fn get_server(&self, id: &str) -> Result<Server, StoreError> {
        self.inner
            .lock()
            .servers
            .get(id)
            .cloned()
            .ok_or_else(|| StoreError::ServerNotFound(id.to_string()))
    }

    fn list_servers(&self) -> Vec<Server> {
        let mut servers: Vec<Server> = self.inner.lock().servers.values().cloned().collect();
        servers.sort_by(|a, b| a.id.cmp(&b.id));
        servers
    }

    fn set_server_enabled(&self, id: &str, enabled: bool) -> Result<(), StoreError> {
        let mut inner = self.inner.lock();
        let server = inner
            .servers
            .get_mut(id)
            .ok_or_else(|| StoreError::ServerNotFound(id.to_string()))?;
        server.enabled = enabled;
        Ok(())
    }

    fn active_count(&self, server_id: &str) -> Result<u32, StoreError> {
        let inner = self.inner.lock();
        if !inner.servers.contains_key(server_id) {
            return Err(StoreError::ServerNotFound(server_id.to_string()));
        }
        Ok(inner.active_count(server_id))
    }

    fn capacity_snapshot(&self) -> Vec<ServerLoad> {
        let inner = self.inner.lock();
        let mut loads: Vec<ServerLoad> = inner
            .servers
            .values()
            .filter(|s| s.enabled)
            .map(|s| ServerLoad {
                server: s.clone(),
                active: inner.active_count(&s.id),
            })
            .collect();
        loads.sort_by(|a, b| a.server.id.cmp(&b.server.id));
        loads
    }

    fn purchase(&self, req: PurchaseRequest) -> Result<Subscription, StoreError> {
        let mut inner = self.inner.lock();

        let plan = inner
            .plans
            .get(&req.plan_id)
            .cloned()
            .ok_or_else(|| StoreError::PlanNotFound(req.plan_id.clone()))?;
        let server = inner
            .servers
            .get(&req.server_id)
            .cloned()
            .ok_or_else(|| StoreError::ServerNotFound(req.server_id.clone()))?;

        if inner.credentials.contains(&req.credential) {
            return Err(StoreError::CredentialCollision);
        }

        // final capacity guard: placement worked from a snapshot that may be
        // stale by the time we get here
        let active = inner.active_count(&req.server_id);
        if active >= server.max_users {
            return Err(StoreError::NoCapacity {
                server_id: req.server_id.clone(),
            });
        }

        let balance = inner
            .users
            .get(&req.user_id)
            .map(|u| u.balance)
            .ok_or(StoreError::UserNotFound)?;
        if balance < plan.price {
            return Err(StoreError::InsufficientBalance {
                required: plan.price,
                available: balance,
            });
        }

        // all guards passed; apply the whole transaction
        let now = now_unix();
        let user = inner.users.get_mut(&req.user_id).expect("checked above");
        user.balance -= plan.price;
        user.updated_at = now;

        let sub = Subscription {
            id: Uuid::new_v4(),
            user_id: req.user_id,
            plan_id: req.plan_id,
            server_id: req.server_id,
            credential: req.credential,
            status: SubscriptionStatus::Active,
            expires_at: req.expires_at,
            created_at: now,
            updated_at: now,
        };
        inner.credentials.insert(sub.credential);
        inner.subscriptions.insert(sub.id, sub.clone());
        info!(
            "subscription {} created: user={} plan={} server={} credential={}",
            sub.id, sub.user_id, sub.plan_id, sub.server_id, sub.credential
        );
        Ok(sub)
    }

    fn mark_expired_if_active(&self, sub_id: Uuid) -> Result<bool, StoreError> {
        let mut inner = self.inner.lock();
        let sub = inner
            .subscriptions
            .get_mut(&sub_id)
            .ok_or(StoreError::SubscriptionNotFound)?;
        if sub.status != SubscriptionStatus::Active {
            return Ok(false);
        }
        sub.status = SubscriptionStatus::Expired;
        sub.updated_at = now_unix();
        Ok(true)
    }

    fn set_status(&self, sub_id: Uuid, status: SubscriptionStatus) -> Result<(), StoreError> {
        let mut inner = self.inner.lock();
        let sub = inner
            .subscriptions
            .get_mut(&sub_id)
            .ok_or(StoreError::SubscriptionNotFound)?;
        sub.status = status;
        sub.updated_at = now_unix();
        Ok(())
    }

    fn expired_candidates(&self, now: u64) -> Vec<Subscription> {
        let mut due: Vec<Subscription> = self
            .inner
            .lock()
            .subscriptions
            .values()
            .filter(|s| s.status == SubscriptionStatus::Active && s.is_past_due(now))
            .cloned()
            .collect();
        due.sort_by_key(|s| s.expires_at);
        due
    }

    fn get_subscription(&self, id: Uuid) -> Result<Subscription, StoreError> {
        self.inner
            .lock()
            .subscriptions
            .get(&id)
            .cloned()
            .ok_or(StoreError::SubscriptionNotFound)
    }

    fn subscriptions_for_user(&self, user_id: Uuid) -> Vec<Subscription> {
        let mut subs: Vec<Subscription> = self
            .inner
            .lock()
            .subscriptions
            .values()
            .filter(|s| s.user_id == user_id)
            .cloned()
            .collect();
        subs.sort_by_key(|s| s.created_at);
        subs
    }

    fn desired_set(&self, server_id: &str) -> Result<HashSet<Uuid>, StoreError> {
        let inner = self.inner.lock();
        if !inner.servers.contains_key(server_id) {
            return Err(StoreError::ServerNotFound(server_id.to_string()));
        }
        Ok(inner
            .subscriptions
            .values()
            .filter(|s| s.server_id == server_id && s.status.is_entitled())
            .map(|s| s.credential)
            .collect())
    }

    fn active_subscriptions(&self, server_id: &str) -> Result<Vec<Subscription>, StoreError> {
        let inner = self.inner.lock();
        if !inner.servers.contains_key(server_id) {
            return Err(StoreError::ServerNotFound(server_id.to_string()));
        }
        let mut subs: Vec<Subscription> = inner
            .subscriptions
            .values()
            .filter(|s| s.server_id == server_id && s.status.is_entitled())
            .cloned()
            .collect();
        subs.sort_by_key(|s| s.credential);
        Ok(subs)
    }
}

// ════════════════════════════════════════════════════════════════════════════
// TESTS
// ════════════════════════════════════════════════════════════════════════════
