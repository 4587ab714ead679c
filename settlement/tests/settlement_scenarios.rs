//! End-to-end settlement scenarios over the in-memory store.

use std::sync::Arc;

use proptest::prelude::*;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;

use cryptoledger_common::{
    AssetId, LedgerError, ShortAccount, TransactionId, TransactionStatus, UserId,
};
use cryptoledger_ledger::{LedgerStore, MemoryStore, TransactionStore, User};
use cryptoledger_settlement::{
    EngineConfig, InMemoryAssetDirectory, InMemoryUserDirectory, LedgerReports, RequestIntake,
    SettlementEngine, SubmitRequest,
};

struct Harness {
    store: Arc<MemoryStore>,
    intake: RequestIntake,
    engine: Arc<SettlementEngine>,
    reports: LedgerReports,
}

async fn harness() -> Harness {
    let store = Arc::new(MemoryStore::new());
    let users = Arc::new(InMemoryUserDirectory::new());
    for (id, name) in [("1", "Alice"), ("2", "Bob")] {
        users.add(User::new(id, name));
        store.open_account(&UserId::new(id)).await.unwrap();
    }
    let assets = Arc::new(InMemoryAssetDirectory::with_defaults());
    let config = EngineConfig::default();

    let engine = Arc::new(SettlementEngine::new(store.clone(), config.clone()));
    let intake = RequestIntake::new(store.clone(), users, assets, config.clone())
        .with_metrics(engine.metrics().clone());
    let reports = LedgerReports::new(store.clone(), config);

    Harness {
        store,
        intake,
        engine,
        reports,
    }
}

fn alice() -> UserId {
    UserId::new("1")
}

fn request(kind: &str, asset: &str, amount: &str, price: &str) -> SubmitRequest {
    SubmitRequest {
        user_id: "1".to_string(),
        asset_id: asset.to_string(),
        transaction_type: kind.to_string(),
        amount: amount.to_string(),
        price: price.to_string(),
        wallet: String::new(),
    }
}

impl Harness {
    async fn submit(&self, kind: &str, asset: &str, amount: &str, price: &str) -> TransactionId {
        self.intake
            .submit(request(kind, asset, amount, price))
            .await
            .unwrap()
            .id
    }

    async fn holding(&self, asset: &str) -> Decimal {
        self.store
            .get_holding(&alice(), &AssetId::new(asset))
            .await
            .unwrap()
    }

    async fn cash(&self) -> Decimal {
        self.store.get_balance(&alice()).await.unwrap()
    }

    async fn status(&self, id: TransactionId) -> TransactionStatus {
        self.store.get(id).await.unwrap().status
    }
}

#[tokio::test]
async fn sell_credits_cash_and_debits_holding() {
    let h = harness().await;
    h.store
        .adjust_holding(&alice(), &AssetId::new("bitcoin"), dec!(0.5))
        .await
        .unwrap();

    let id = h.submit("sell", "bitcoin", "0.2", "50000").await;
    let receipt = h.engine.approve(id).await.unwrap();

    assert_eq!(h.holding("bitcoin").await, dec!(0.3));
    assert_eq!(h.cash().await, dec!(10000));
    assert_eq!(h.status(id).await, TransactionStatus::Completed);
    assert_eq!(receipt.entries.len(), 2);

    let json = serde_json::to_value(&receipt).unwrap();
    assert_eq!(json["transaction_type"], "sell");
}

#[tokio::test]
async fn withdrawal_without_fee_cover_is_rejected() {
    let h = harness().await;
    h.store
        .adjust_holding(&alice(), &AssetId::new("ethereum"), dec!(1.0))
        .await
        .unwrap();

    let id = h.submit("withdrawal", "ethereum", "1.0", "0").await;
    let err = h.engine.approve(id).await.unwrap_err();

    assert!(matches!(
        err,
        LedgerError::InsufficientBalance {
            account: ShortAccount::Holding(_, _),
            ..
        }
    ));
    assert_eq!(h.holding("ethereum").await, dec!(1.0));
    assert_eq!(h.status(id).await, TransactionStatus::Pending);

    // Still pending, so it can be cancelled afterwards.
    h.engine.cancel(id).await.unwrap();
    assert_eq!(h.holding("ethereum").await, dec!(1.0));
}

#[tokio::test]
async fn buy_credits_holding_only() {
    let h = harness().await;

    let id = h.submit("buy", "bitcoin", "2", "100").await;
    h.engine.approve(id).await.unwrap();

    assert_eq!(h.holding("bitcoin").await, dec!(2));
    assert_eq!(h.cash().await, Decimal::ZERO);
}

#[tokio::test]
async fn deposit_credits_cash_only() {
    let h = harness().await;

    let id = h.submit("deposit", "ethereum", "3", "1500").await;
    h.engine.approve(id).await.unwrap();

    assert_eq!(h.cash().await, dec!(4500));
    assert_eq!(h.holding("ethereum").await, Decimal::ZERO);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_approvals_apply_once() {
    let h = harness().await;
    let id = h.submit("buy", "bitcoin", "2", "100").await;

    let attempts: Vec<_> = (0..16)
        .map(|_| {
            let engine = h.engine.clone();
            tokio::spawn(async move { engine.approve(id).await })
        })
        .collect();

    let mut successes = 0;
    for result in futures::future::join_all(attempts).await {
        match result.unwrap() {
            Ok(_) => successes += 1,
            Err(e) => assert_eq!(e.error_code(), "INVALID_STATE"),
        }
    }

    assert_eq!(successes, 1);
    assert_eq!(h.holding("bitcoin").await, dec!(2));
    assert_eq!(h.engine.metrics().snapshot().approved, 1);
    assert_eq!(h.engine.metrics().snapshot().rejected_state, 15);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn approve_races_cancel() {
    let h = harness().await;
    h.store
        .adjust_holding(&alice(), &AssetId::new("bitcoin"), dec!(1))
        .await
        .unwrap();
    let id = h.submit("sell", "bitcoin", "1", "50000").await;

    let approve = {
        let engine = h.engine.clone();
        tokio::spawn(async move { engine.approve(id).await.map(|_| ()) })
    };
    let cancel = {
        let engine = h.engine.clone();
        tokio::spawn(async move { engine.cancel(id).await })
    };
    let (approved, cancelled) = (approve.await.unwrap(), cancel.await.unwrap());

    assert!(approved.is_ok() != cancelled.is_ok());
    match h.status(id).await {
        TransactionStatus::Completed => {
            assert_eq!(h.holding("bitcoin").await, Decimal::ZERO);
            assert_eq!(h.cash().await, dec!(50000));
        }
        TransactionStatus::Cancelled => {
            assert_eq!(h.holding("bitcoin").await, dec!(1));
            assert_eq!(h.cash().await, Decimal::ZERO);
        }
        TransactionStatus::Pending => panic!("transaction left pending"),
    }
}

#[tokio::test]
async fn approving_terminal_transaction_changes_nothing() {
    let h = harness().await;
    let id = h.submit("buy", "solana", "5", "20").await;
    h.engine.approve(id).await.unwrap();

    let err = h.engine.approve(id).await.unwrap_err();
    assert_eq!(
        err,
        LedgerError::InvalidState {
            transaction_id: id,
            status: TransactionStatus::Completed,
        }
    );
    assert_eq!(h.engine.cancel(id).await.unwrap_err().error_code(), "INVALID_STATE");
    assert_eq!(h.holding("solana").await, dec!(5));
}

#[tokio::test]
async fn completed_transaction_cannot_be_reopened() {
    let h = harness().await;
    let id = h.submit("buy", "bitcoin", "2", "100").await;
    h.engine.approve(id).await.unwrap();

    let err = h
        .store
        .compare_and_set_status(id, TransactionStatus::Completed, TransactionStatus::Pending)
        .await
        .unwrap_err();
    assert_eq!(err.error_code(), "INVALID_STATE");

    let err = h.engine.approve(id).await.unwrap_err();
    assert_eq!(err.error_code(), "INVALID_STATE");
    assert_eq!(h.status(id).await, TransactionStatus::Completed);
    assert_eq!(h.holding("bitcoin").await, dec!(2));
}

#[tokio::test]
async fn submit_then_cancel_leaves_ledger_untouched() {
    let h = harness().await;
    h.store.adjust_balance(&alice(), dec!(250)).await.unwrap();
    h.store
        .adjust_holding(&alice(), &AssetId::new("bitcoin"), dec!(0.7))
        .await
        .unwrap();

    for kind in ["buy", "sell", "deposit", "withdrawal"] {
        let id = h.submit(kind, "bitcoin", "0.5", "40000").await;
        h.engine
            .cancel_with_reason(id, Some("requested by user"))
            .await
            .unwrap();
    }

    assert_eq!(h.cash().await, dec!(250));
    assert_eq!(h.holding("bitcoin").await, dec!(0.7));

    let stats = h.reports.stats().await.unwrap();
    assert_eq!(stats.cancelled.count, 4);
    assert_eq!(stats.total_volume(), Decimal::ZERO);
    assert_eq!(h.engine.metrics().snapshot().submitted, 4);
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn holdings_never_negative(ops in proptest::collection::vec((0u8..4, 1i64..300, any::<bool>()), 1..24)) {
        tokio_test::block_on(async {
            let h = harness().await;
            h.store
                .adjust_holding(&alice(), &AssetId::new("bitcoin"), dec!(1))
                .await
                .unwrap();

            for (kind, hundredths, approve) in ops {
                let kind = ["buy", "sell", "deposit", "withdrawal"][kind as usize];
                let amount = Decimal::new(hundredths, 2).to_string();
                let id = h.submit(kind, "bitcoin", &amount, "100").await;

                let holding_before = h.holding("bitcoin").await;
                let cash_before = h.cash().await;
                let result = if approve {
                    h.engine.approve(id).await.map(|_| ())
                } else {
                    h.engine.cancel(id).await
                };

                match result {
                    Ok(()) => assert_ne!(h.status(id).await, TransactionStatus::Pending),
                    Err(e) => {
                        assert_eq!(e.error_code(), "INSUFFICIENT_BALANCE");
                        assert_eq!(h.status(id).await, TransactionStatus::Pending);
                        assert_eq!(h.holding("bitcoin").await, holding_before);
                        assert_eq!(h.cash().await, cash_before);
                    }
                }
                assert!(h.holding("bitcoin").await >= Decimal::ZERO);
                assert!(h.cash().await >= Decimal::ZERO);
            }
        });
    }
}
