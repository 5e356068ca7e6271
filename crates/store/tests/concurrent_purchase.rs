//! Concurrency tests for the purchase transaction.
//!
//! The capacity guard must hold under racing purchases: when N threads all
//! target a server with `max_users = K`, exactly K succeed and the rest fail
//! typed with `NoCapacity`, and no failed attempt debits a balance.

use std::sync::Arc;
use std::thread;

use uuid::Uuid;

use vac_common::{now_unix, Plan, Server, StoreError};
use vac_store::{EntitlementStore, MemoryStore, PurchaseRequest};

fn plan() -> Plan {
    Plan {
        id: "basic".to_string(),
        name: "Basic".to_string(),
        price: 100,
        bandwidth_limit_mbps: 50,
        tier: "tier-basic".to_string(),
        duration_secs: 3600,
    }
}

fn server(id: &str, max_users: u32) -> Server {
    Server {
        id: id.to_string(),
        addr: format!("{}.example.net:443", id),
        mgmt_url: "http://127.0.0.1:8686".to_string(),
        mgmt_secret: "secret".to_string(),
        routing_key: "pubkey".to_string(),
        max_users,
        enabled: true,
    }
}

#[test]
fn concurrent_purchases_saturate_exactly_to_capacity() {
    let store = Arc::new(MemoryStore::new());
    store.insert_plan(plan());
    store.upsert_server(server("srv-a", 2));

    // eight users, each funded for one purchase, all racing for two slots
    let users: Vec<_> = (0..8)
        .map(|i| {
            let u = store.upsert_user(i);
            store.credit_balance(u.id, 100).unwrap();
            u
        })
        .collect();

    let handles: Vec<_> = users
        .into_iter()
        .map(|user| {
            let store = store.clone();
            thread::spawn(move || {
                store.purchase(PurchaseRequest {
                    user_id: user.id,
                    plan_id: "basic".to_string(),
                    server_id: "srv-a".to_string(),
                    credential: Uuid::new_v4(),
                    expires_at: now_unix() + 3600,
                })
            })
        })
        .collect();

    let mut ok = 0;
    let mut no_capacity = 0;
    for handle in handles {
        match handle.join().unwrap() {
            Ok(_) => ok += 1,
            Err(StoreError::NoCapacity { server_id }) => {
                assert_eq!(server_id, "srv-a");
                no_capacity += 1;
            }
            Err(other) => panic!("unexpected error: {}", other),
        }
    }

    assert_eq!(ok, 2);
    assert_eq!(no_capacity, 6);
    assert_eq!(store.active_count("srv-a").unwrap(), 2);
    assert_eq!(store.desired_set("srv-a").unwrap().len(), 2);
}

#[test]
fn losing_purchase_does_not_debit() {
    let store = Arc::new(MemoryStore::new());
    store.insert_plan(plan());
    store.upsert_server(server("srv-b", 1));

    let winner = store.upsert_user(1);
    let loser = store.upsert_user(2);
    store.credit_balance(winner.id, 100).unwrap();
    store.credit_balance(loser.id, 100).unwrap();

    let buy = |user_id| {
        store.purchase(PurchaseRequest {
            user_id,
            plan_id: "basic".to_string(),
            server_id: "srv-b".to_string(),
            credential: Uuid::new_v4(),
            expires_at: now_unix() + 3600,
        })
    };

    buy(winner.id).unwrap();
    buy(loser.id).unwrap_err();

    assert_eq!(store.get_user(winner.id).unwrap().balance, 0);
    assert_eq!(store.get_user(loser.id).unwrap().balance, 100);
}
