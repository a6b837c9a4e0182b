//! Multi-fill orders: leaf selection, proofs and cumulative fills

mod common;

use resolver::types::SwapStatus;
use resolver::SwapError;

use common::{leaves_of, Harness};

const TOTAL: u128 = 1_000_000;
const DST_SATS: u64 = 400_000;

async fn multi_fill_order(h: &Harness, parts: usize) -> resolver::Initiated {
    let mut params = h.account_to_utxo(TOTAL, DST_SATS);
    params.allow_multiple_fills = true;
    params.parts = parts;
    h.engine.initiate_swap(params).await.unwrap()
}

#[tokio::test]
async fn test_two_halves_complete_the_order() {
    let h = Harness::new();
    let initiated = multi_fill_order(&h, 4).await;
    assert_eq!(initiated.secrets.len(), 4);
    let id = initiated.order_id;

    let record = h.record(&id).await;
    let leaves = leaves_of(&record);
    assert_eq!(leaves.root, initiated.hashlock);

    // First half: cumulative 500_000 of 1_000_000 over 4 leaves selects leaf 1
    h.engine.fund_partial(&id, 500_000).await.unwrap();
    let record = h.record(&id).await;
    let fill = record.state.active_fill().unwrap();
    assert_eq!(fill.index, 1);
    assert_eq!(fill.amount, 500_000);
    assert_eq!(fill.hashlock, leaves.secret_hash(1).unwrap());
    assert_eq!(fill.dst.as_ref().unwrap().amount, 200_000);
    assert_eq!(record.state.status, SwapStatus::DstLocked);

    h.engine
        .claim(&id, initiated.secrets[1], Some(leaves.proof(1).unwrap()))
        .await
        .unwrap();
    let record = h.record(&id).await;
    assert_eq!(record.state.status, SwapStatus::Completed);
    assert_eq!(record.state.filled_amount, 500_000);
    assert!(!record.is_finished());

    // Second half completes the order on the last leaf
    h.engine.fund_partial(&id, 500_000).await.unwrap();
    let record = h.record(&id).await;
    assert_eq!(record.state.active_fill().unwrap().index, 3);

    h.engine
        .claim(&id, initiated.secrets[3], Some(leaves.proof(3).unwrap()))
        .await
        .unwrap();
    let record = h.record(&id).await;
    assert_eq!(record.state.filled_amount, TOTAL);
    assert_eq!(record.state.fills.len(), 2);
    assert!(record.is_finished());
}

#[tokio::test]
async fn test_claim_needs_matching_proof() {
    let h = Harness::new();
    let initiated = multi_fill_order(&h, 4).await;
    let id = initiated.order_id;
    let leaves = leaves_of(&h.record(&id).await);

    h.engine.fund_partial(&id, 500_000).await.unwrap();

    assert!(matches!(
        h.engine.claim(&id, initiated.secrets[1], None).await,
        Err(SwapError::Validation(_))
    ));
    // Proof for another leaf
    assert!(matches!(
        h.engine
            .claim(&id, initiated.secrets[1], Some(leaves.proof(0).unwrap()))
            .await,
        Err(SwapError::SecretMismatch)
    ));
    // Valid secret and proof, but for a leaf that was never funded
    assert!(matches!(
        h.engine
            .claim(&id, initiated.secrets[3], Some(leaves.proof(3).unwrap()))
            .await,
        Err(SwapError::NotReady(_))
    ));
    assert_eq!(h.status(&id).await, SwapStatus::DstLocked);

    h.engine
        .claim(&id, initiated.secrets[1], Some(leaves.proof(1).unwrap()))
        .await
        .unwrap();
}

#[tokio::test]
async fn test_fill_size_limits() {
    let h = Harness::new();
    let initiated = multi_fill_order(&h, 4).await;
    let id = initiated.order_id;

    assert!(matches!(
        h.engine.fund_partial(&id, TOTAL + 1).await,
        Err(SwapError::Validation(_))
    ));
    assert!(matches!(
        h.engine.fund_partial(&id, 0).await,
        Err(SwapError::Validation(_))
    ));

    h.engine.fund_partial(&id, 500_000).await.unwrap();
    // A different fill cannot start while one is in flight
    assert!(matches!(
        h.engine.fund_partial(&id, 100_000).await,
        Err(SwapError::NotReady(_))
    ));
    // The same one is answered from the record
    let txs = h.account.tx_count();
    assert!(h.engine.fund_partial(&id, 500_000).await.unwrap().success);
    assert_eq!(h.account.tx_count(), txs);
}

#[tokio::test]
async fn test_consumed_leaf_cannot_be_reused() {
    let h = Harness::new();
    let initiated = multi_fill_order(&h, 4).await;
    let id = initiated.order_id;
    let leaves = leaves_of(&h.record(&id).await);

    h.engine.fund_partial(&id, 500_000).await.unwrap();
    h.engine
        .claim(&id, initiated.secrets[1], Some(leaves.proof(1).unwrap()))
        .await
        .unwrap();

    // Cumulative 510_000 still maps to leaf 1
    assert!(matches!(
        h.engine.fund_partial(&id, 10_000).await,
        Err(SwapError::Validation(_))
    ));
    let record = h.record(&id).await;
    assert_eq!(record.state.fills.len(), 1);
    assert_eq!(record.state.filled_amount, 500_000);
}

#[tokio::test]
async fn test_multi_fill_parameters_validated() {
    let h = Harness::new();

    let mut too_few = h.account_to_utxo(TOTAL, DST_SATS);
    too_few.allow_multiple_fills = true;
    too_few.parts = 1;
    assert!(matches!(
        h.engine.initiate_swap(too_few).await,
        Err(SwapError::Validation(_))
    ));

    let mut with_secret = h.account_to_utxo(TOTAL, DST_SATS);
    with_secret.allow_multiple_fills = true;
    with_secret.parts = 4;
    with_secret.secret = Some(resolver::hashlock::generate_secret());
    assert!(matches!(
        h.engine.initiate_swap(with_secret).await,
        Err(SwapError::Validation(_))
    ));

    let mut single = h.account_to_utxo(TOTAL, DST_SATS);
    single.allow_multiple_fills = false;
    let initiated = h.engine.initiate_swap(single).await.unwrap();
    assert!(matches!(
        h.engine.fund_partial(&initiated.order_id, TOTAL / 2).await,
        Err(SwapError::Validation(_))
    ));
}
