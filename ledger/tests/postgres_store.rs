//! PostgreSQL backend checks. Skipped unless `LEDGER_TEST_DATABASE_URL` is set.

use std::time::Duration;

use rust_decimal::Decimal;
use rust_decimal_macros::dec;

use cryptoledger_common::{
    AssetId, Transaction, TransactionFilter, TransactionKind, TransactionStatus, UserId,
};
use cryptoledger_ledger::{
    CommitOutcome, LedgerAccount, LedgerBatch, LedgerStore, PgStore, SettlementStore,
    TransactionStore,
};

async fn store() -> Option<PgStore> {
    let url = std::env::var("LEDGER_TEST_DATABASE_URL").ok()?;
    let store = PgStore::connect(&url, Duration::from_secs(5)).await.unwrap();
    store.migrate().await.unwrap();
    Some(store)
}

fn fresh_user() -> UserId {
    UserId::new(format!("pg-{}", uuid::Uuid::new_v4().simple()))
}

#[tokio::test]
async fn commit_is_atomic() {
    let Some(store) = store().await else {
        return;
    };
    let user = fresh_user();
    let btc = AssetId::new("bitcoin");
    store.open_account(&user).await.unwrap();
    store.adjust_holding(&user, &btc, dec!(0.1)).await.unwrap();

    let transaction = Transaction::new(
        user.clone(),
        TransactionKind::Sell {
            asset_id: btc.clone(),
            quantity: dec!(0.2),
            price: dec!(50000),
        },
        dec!(50000),
        String::new(),
    );
    let id = transaction.id;
    store.insert(transaction).await.unwrap();

    let mut batch = LedgerBatch::new(id);
    batch.add(LedgerAccount::cash(user.clone()), dec!(10000));
    batch.add(LedgerAccount::holding(user.clone(), btc.clone()), dec!(-0.2));

    let err = store
        .commit(&batch, TransactionStatus::Pending, TransactionStatus::Completed)
        .await
        .unwrap_err();
    assert_eq!(err.error_code(), "INSUFFICIENT_BALANCE");
    assert_eq!(store.get_balance(&user).await.unwrap(), Decimal::ZERO);
    assert_eq!(store.get(id).await.unwrap().status, TransactionStatus::Pending);

    store.adjust_holding(&user, &btc, dec!(0.1)).await.unwrap();
    let outcome = store
        .commit(&batch, TransactionStatus::Pending, TransactionStatus::Completed)
        .await
        .unwrap();
    assert!(matches!(outcome, CommitOutcome::Committed(ref entries) if entries.len() == 2));
    assert_eq!(store.get_holding(&user, &btc).await.unwrap(), Decimal::ZERO);
    assert_eq!(store.journal(id).await.unwrap().len(), 2);

    let again = store
        .commit(&batch, TransactionStatus::Pending, TransactionStatus::Completed)
        .await
        .unwrap();
    assert_eq!(again, CommitOutcome::StatusMismatch(TransactionStatus::Completed));
}

#[tokio::test]
async fn cancel_round_trip() {
    let Some(store) = store().await else {
        return;
    };
    let user = fresh_user();
    store.open_account(&user).await.unwrap();

    let transaction = Transaction::new(
        user.clone(),
        TransactionKind::Withdrawal {
            asset_id: AssetId::new("ethereum"),
            quantity: dec!(1),
        },
        dec!(3000),
        "0xabc".to_string(),
    );
    let id = transaction.id;
    store.insert(transaction.clone()).await.unwrap();
    assert_eq!(store.get(id).await.unwrap().kind, transaction.kind);

    assert!(store
        .compare_and_set_status_with_note(
            id,
            TransactionStatus::Pending,
            TransactionStatus::Cancelled,
            Some("duplicate"),
        )
        .await
        .unwrap());
    assert!(!store
        .compare_and_set_status(id, TransactionStatus::Pending, TransactionStatus::Completed)
        .await
        .unwrap());

    assert_eq!(
        store
            .compare_and_set_status(id, TransactionStatus::Cancelled, TransactionStatus::Pending)
            .await
            .unwrap_err()
            .error_code(),
        "INVALID_STATE"
    );

    let listed = store
        .list(&TransactionFilter::for_user(user).with_status(TransactionStatus::Cancelled))
        .await
        .unwrap();
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].cancellation_reason.as_deref(), Some("duplicate"));
}
