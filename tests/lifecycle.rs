use std::sync::Arc;

use groupbuy_eng::collab::MemoryCatalog;
use groupbuy_eng::config::{EngineConfig, RetryConfig};
use groupbuy_eng::engine::{GroupError, GroupStatus, PaymentStatus};
use groupbuy_eng::ledger::{EntryKind, EntryStatus};
use groupbuy_eng::model::{Offer, OfferStatus};
use groupbuy_eng::{Amount, Engine, EngineError, Identity, Location};

fn catalog(price: i64) -> Arc<MemoryCatalog> {
    let catalog = MemoryCatalog::new();
    catalog
        .publish(Offer {
            id: 1,
            price: Amount::units(price),
            currency: "INR".to_string(),
            status: OfferStatus::Approved,
        })
        .unwrap();
    Arc::new(catalog)
}

/// Generous retry budget so racing tasks never exhaust it.
fn race_config() -> EngineConfig {
    EngineConfig {
        retry: RetryConfig {
            max_attempts: 100,
            base_backoff_ms: 1,
            max_backoff_ms: 50,
        },
        ..EngineConfig::default()
    }
}

fn user(id: u32) -> Identity {
    Identity::new(id, format!("user{id}"), 50.0)
}

#[tokio::test]
async fn two_member_group_end_to_end() {
    let engine = Engine::new(EngineConfig::default(), catalog(1000));
    engine.deposit(1, Amount::units(500), "pay_1").await.unwrap();
    engine.deposit(2, Amount::units(500), "pay_2").await.unwrap();

    let group = engine
        .create_group(1, 2, &user(1), Location::at(12.97, 77.59))
        .await
        .unwrap();
    let id = group.id();
    let group = engine
        .join_group(id, &user(2), Location::at(12.93, 77.62))
        .await
        .unwrap();
    assert_eq!(group.status(), GroupStatus::Locked);
    let receiver = group.receiver().unwrap();
    let member = if receiver == 1 { 2 } else { 1 };

    engine.pay_share(id, 1).await.unwrap();
    let group = engine.pay_share(id, 2).await.unwrap();
    assert_eq!(group.status(), GroupStatus::Funded);

    engine.confirm_order(id, receiver).await.unwrap();
    let arrival = engine.confirm_arrival(id, receiver).await.unwrap();
    assert_eq!(arrival.codes.len(), 1);
    let (code_member, code) = &arrival.codes[0];
    assert_eq!(*code_member, member);

    let group = engine
        .verify_handoff(id, receiver, member, code.as_str())
        .await
        .unwrap();
    assert_eq!(group.status(), GroupStatus::Completed);

    let receiver_wallet = engine.get_wallet(receiver).await.unwrap();
    assert_eq!(receiver_wallet.balance(), Amount::units(1000));
    assert_eq!(receiver_wallet.locked(), Amount::ZERO);
    let member_wallet = engine.get_wallet(member).await.unwrap();
    assert_eq!(member_wallet.total(), Amount::ZERO);

    let escrow: Vec<_> = engine
        .ledger()
        .entries()
        .unwrap()
        .into_iter()
        .filter(|e| e.kind == EntryKind::EscrowLock)
        .collect();
    assert_eq!(escrow.len(), 2);
    assert!(escrow.iter().all(|e| e.status == EntryStatus::Success));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn racing_joins_never_overfill() {
    let engine = Arc::new(Engine::new(race_config(), catalog(6000)));
    let group = engine
        .create_group(1, 6, &user(1), Location::Unknown)
        .await
        .unwrap();
    let id = group.id();

    let mut handles = Vec::new();
    for racer in 2..22 {
        let engine = engine.clone();
        handles.push(tokio::spawn(async move {
            engine
                .join_group(id, &user(racer), Location::at(0.0, f64::from(racer)))
                .await
        }));
    }

    let mut joined = 0;
    let mut full = 0;
    for handle in handles {
        match handle.await.unwrap() {
            Ok(_) => joined += 1,
            Err(EngineError::Group(GroupError::GroupFull(_))) => full += 1,
            Err(e) => panic!("unexpected join error: {e}"),
        }
    }
    assert_eq!(joined, 5);
    assert_eq!(full, 15);

    let group = engine.get_group(id).unwrap();
    assert_eq!(group.current_size(), 6);
    assert_eq!(group.status(), GroupStatus::Locked);
    assert!(group.receiver().is_some());
    group.check_invariants().unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn racing_payments_fund_exactly_once() {
    let engine = Arc::new(Engine::new(race_config(), catalog(4000)));
    for u in 1..=4 {
        engine
            .deposit(u, Amount::units(1000), &format!("pay_{u}"))
            .await
            .unwrap();
    }
    let id = engine
        .create_group(1, 4, &user(1), Location::Unknown)
        .await
        .unwrap()
        .id();
    for u in 2..=4 {
        engine.join_group(id, &user(u), Location::Unknown).await.unwrap();
    }

    // every member pays twice at once
    let mut handles = Vec::new();
    for u in (1..=4).chain(1..=4) {
        let engine = engine.clone();
        handles.push(tokio::spawn(async move { engine.pay_share(id, u).await }));
    }

    let mut paid = 0;
    for handle in handles {
        match handle.await.unwrap() {
            Ok(_) => paid += 1,
            Err(EngineError::Group(GroupError::AlreadyPaid { .. })) => {}
            Err(e) => panic!("unexpected pay error: {e}"),
        }
    }
    assert_eq!(paid, 4);

    let group = engine.get_group(id).unwrap();
    assert_eq!(group.status(), GroupStatus::Funded);
    assert!(group.members().iter().all(|m| m.payment() == PaymentStatus::Paid));
    for u in 1..=4 {
        let wallet = engine.get_wallet(u).await.unwrap();
        assert_eq!(wallet.balance(), Amount::units(0));
        assert_eq!(wallet.locked(), Amount::units(1000));
    }
}

#[tokio::test]
async fn failed_payment_can_be_retried_after_top_up() {
    let engine = Engine::new(EngineConfig::default(), catalog(1000));
    let id = engine
        .create_group(1, 2, &user(1), Location::Unknown)
        .await
        .unwrap()
        .id();
    engine.join_group(id, &user(2), Location::Unknown).await.unwrap();

    engine.deposit(1, Amount::units(100), "pay_1").await.unwrap();
    assert!(engine.pay_share(id, 1).await.is_err());

    engine.deposit(1, Amount::units(400), "pay_2").await.unwrap();
    let group = engine.pay_share(id, 1).await.unwrap();
    assert_eq!(group.member(1).unwrap().payment(), PaymentStatus::Paid);

    let statuses: Vec<_> = engine
        .ledger()
        .entries_for(1)
        .unwrap()
        .into_iter()
        .filter(|e| e.kind == EntryKind::EscrowLock)
        .map(|e| e.status)
        .collect();
    assert_eq!(statuses, vec![EntryStatus::Failed, EntryStatus::Success]);
}
