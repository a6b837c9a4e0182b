//! End-to-end swap lifecycle over the simulated chains
//!
//! Run with: cargo test --test swap_lifecycle

mod common;

use std::time::Duration;

use resolver::hashlock;
use resolver::store::SwapStore;
use resolver::types::{ChainKind, EscrowOutcome, SwapStatus};
use resolver::SwapError;

use common::Harness;

// ============================================================================
// Happy path
// ============================================================================

mod happy_path {
    use super::*;

    #[tokio::test]
    async fn test_account_to_utxo_swap_completes() {
        let h = Harness::new();
        let initiated = h
            .engine
            .initiate_swap(h.account_to_utxo(1_000_000, 100_000))
            .await
            .unwrap();
        assert_eq!(initiated.secrets.len(), 1);
        assert_eq!(h.status(&initiated.order_id).await, SwapStatus::Initiated);

        let funded = h.engine.fund(&initiated.order_id).await.unwrap();
        assert!(funded.success);
        assert_eq!(funded.tx_refs.len(), 1);
        assert_eq!(funded.tx_refs[0].chain, ChainKind::Account);
        assert_eq!(h.status(&initiated.order_id).await, SwapStatus::DstLocked);

        let record = h.record(&initiated.order_id).await;
        let fill = record.state.active_fill().unwrap();
        assert!(fill.src.is_some());
        assert!(fill.dst.is_some());
        assert!(fill.secret.is_none());

        let claimed = h
            .engine
            .claim(&initiated.order_id, initiated.secrets[0], None)
            .await
            .unwrap();
        assert!(claimed.success);
        assert_eq!(claimed.tx_refs.len(), 2);

        let record = h.record(&initiated.order_id).await;
        assert_eq!(record.state.status, SwapStatus::Completed);
        assert_eq!(record.state.filled_amount, 1_000_000);
        assert!(record.is_finished());
        let fill = record.state.active_fill().unwrap();
        assert!(matches!(
            fill.src.as_ref().unwrap().outcome,
            EscrowOutcome::Withdrawn { .. }
        ));
        assert!(matches!(
            fill.dst.as_ref().unwrap().outcome,
            EscrowOutcome::Withdrawn { .. }
        ));

        // Archived but still readable
        assert!(h.store.list_active().await.unwrap().is_empty());
        assert_eq!(h.engine.metrics().swaps_completed_total.get(), 1);
    }

    #[tokio::test]
    async fn test_repeated_claim_touches_no_chain() {
        let h = Harness::new();
        let initiated = h
            .engine
            .initiate_swap(h.account_to_utxo(1_000_000, 100_000))
            .await
            .unwrap();
        h.engine.fund(&initiated.order_id).await.unwrap();
        let first = h
            .engine
            .claim(&initiated.order_id, initiated.secrets[0], None)
            .await
            .unwrap();

        let utxo_broadcasts = h.utxo.broadcast_count();
        let account_txs = h.account.tx_count();

        let second = h
            .engine
            .claim(&initiated.order_id, initiated.secrets[0], None)
            .await
            .unwrap();
        assert_eq!(first, second);
        assert_eq!(h.utxo.broadcast_count(), utxo_broadcasts);
        assert_eq!(h.account.tx_count(), account_txs);

        // Funding again is answered from the record as well
        let refunded = h.engine.fund(&initiated.order_id).await.unwrap();
        assert!(refunded.success);
        assert_eq!(h.account.tx_count(), account_txs);
    }

    #[tokio::test]
    async fn test_repeated_fund_is_idempotent() {
        let h = Harness::new();
        let initiated = h
            .engine
            .initiate_swap(h.utxo_to_account(200_000, 5_000_000_000))
            .await
            .unwrap();

        let first = h.engine.fund(&initiated.order_id).await.unwrap();
        let broadcasts = h.utxo.broadcast_count();
        let txs = h.account.tx_count();

        let second = h.engine.fund(&initiated.order_id).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(h.utxo.broadcast_count(), broadcasts);
        assert_eq!(h.account.tx_count(), txs);
        assert_eq!(h.status(&initiated.order_id).await, SwapStatus::DstLocked);
    }

    #[tokio::test]
    async fn test_maker_supplied_secret() {
        let h = Harness::new();
        let secret = hashlock::generate_secret();
        let mut params = h.utxo_to_account(150_000, 1_000_000);
        params.secret = Some(secret);

        let initiated = h.engine.initiate_swap(params).await.unwrap();
        assert_eq!(initiated.hashlock, hashlock::hash(&secret));
        assert_eq!(initiated.secrets, vec![secret]);

        h.engine.fund(&initiated.order_id).await.unwrap();
        h.engine
            .claim(&initiated.order_id, secret, None)
            .await
            .unwrap();
        assert_eq!(h.status(&initiated.order_id).await, SwapStatus::Completed);
    }

    #[tokio::test]
    async fn test_hashlock_only_order_waits_for_reveal() {
        let h = Harness::new();
        let secret = hashlock::generate_secret();
        let mut params = h.utxo_to_account(150_000, 1_000_000);
        params.hashlock = Some(hashlock::hash(&secret));

        let initiated = h.engine.initiate_swap(params).await.unwrap();
        assert!(initiated.secrets.is_empty());
        h.engine.fund(&initiated.order_id).await.unwrap();

        let wrong = hashlock::generate_secret();
        assert!(matches!(
            h.engine.claim(&initiated.order_id, wrong, None).await,
            Err(SwapError::SecretMismatch)
        ));
        h.engine
            .claim(&initiated.order_id, secret, None)
            .await
            .unwrap();
        assert_eq!(h.status(&initiated.order_id).await, SwapStatus::Completed);
    }
}

// ============================================================================
// Secrets revealed on chain
// ============================================================================

mod onchain_reveal {
    use super::*;
    use resolver::chains::AccountChainClient;
    use resolver::coordinator::account::parse_address;

    #[tokio::test]
    async fn test_maker_withdrawal_reveals_secret() {
        let h = Harness::new();
        let initiated = h
            .engine
            .initiate_swap(h.utxo_to_account(250_000, 2_000_000))
            .await
            .unwrap();
        h.engine.fund(&initiated.order_id).await.unwrap();

        let record = h.record(&initiated.order_id).await;
        let dst = record.state.active_fill().unwrap().dst.clone().unwrap();
        let escrow = parse_address(&dst.address).unwrap();
        h.account
            .withdraw_escrow(escrow, &initiated.secrets[0])
            .await
            .unwrap();

        let state = h.engine.sync(&initiated.order_id).await.unwrap();
        assert_eq!(state.status, SwapStatus::Completed);
        let fill = state.active_fill().unwrap();
        assert_eq!(fill.secret, Some(initiated.secrets[0]));
        assert!(matches!(
            fill.src.as_ref().unwrap().outcome,
            EscrowOutcome::Withdrawn { tx: Some(_) }
        ));
    }

    #[tokio::test]
    async fn test_watcher_task_picks_up_reveal() {
        let h = Harness::new();
        let initiated = h
            .engine
            .initiate_swap(h.utxo_to_account(250_000, 2_000_000))
            .await
            .unwrap();
        h.engine.fund(&initiated.order_id).await.unwrap();
        assert!(h.engine.watch(&initiated.order_id).await.unwrap());
        // Only one watcher per order
        assert!(!h.engine.watch(&initiated.order_id).await.unwrap());

        let record = h.record(&initiated.order_id).await;
        let dst = record.state.active_fill().unwrap().dst.clone().unwrap();
        h.account
            .withdraw_escrow(parse_address(&dst.address).unwrap(), &initiated.secrets[0])
            .await
            .unwrap();

        h.wait_for_status(
            &initiated.order_id,
            SwapStatus::Completed,
            Duration::from_secs(5),
        )
        .await;
        h.engine.stop_watchers();
    }
}

// ============================================================================
// Confirmation of closing transactions
// ============================================================================

mod confirmations {
    use super::*;

    #[tokio::test]
    async fn test_claim_completes_once_spend_confirms() {
        let h = Harness::new();
        let initiated = h
            .engine
            .initiate_swap(h.utxo_to_account(250_000, 2_000_000))
            .await
            .unwrap();
        let id = initiated.order_id;
        h.engine.fund(&id).await.unwrap();
        h.utxo.set_auto_mine(false);

        let pending = h
            .engine
            .claim(&id, initiated.secrets[0], None)
            .await
            .unwrap();
        assert!(!pending.success);
        assert_eq!(pending.tx_refs.len(), 2);
        assert_eq!(h.utxo.mempool_len(), 1);

        let record = h.record(&id).await;
        assert_eq!(record.state.status, SwapStatus::SecretRevealed);
        assert_eq!(record.state.filled_amount, 0);
        assert!(!record.is_finished());
        assert_eq!(h.store.list_active().await.unwrap(), vec![id]);

        // A second claim waits on the same broadcast
        let broadcasts = h.utxo.broadcast_count();
        let again = h
            .engine
            .claim(&id, initiated.secrets[0], None)
            .await
            .unwrap();
        assert_eq!(again, pending);
        assert_eq!(h.utxo.broadcast_count(), broadcasts);

        h.utxo.mine(1);
        let state = h.engine.sync(&id).await.unwrap();
        assert_eq!(state.status, SwapStatus::Completed);
        assert_eq!(state.filled_amount, 250_000);
        assert!(h.record(&id).await.is_finished());
        assert!(h.store.list_active().await.unwrap().is_empty());

        let claimed = h
            .engine
            .claim(&id, initiated.secrets[0], None)
            .await
            .unwrap();
        assert!(claimed.success);
        assert_eq!(claimed.tx_refs, pending.tx_refs);
        assert_eq!(h.engine.metrics().swaps_completed_total.get(), 1);
    }

    #[tokio::test]
    async fn test_watcher_completes_after_mining() {
        let h = Harness::new();
        let initiated = h
            .engine
            .initiate_swap(h.account_to_utxo(1_000_000, 100_000))
            .await
            .unwrap();
        let id = initiated.order_id;
        h.engine.fund(&id).await.unwrap();
        h.utxo.set_auto_mine(false);
        h.engine
            .claim(&id, initiated.secrets[0], None)
            .await
            .unwrap();
        assert!(h.engine.watch(&id).await.unwrap());

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(h.status(&id).await, SwapStatus::SecretRevealed);

        h.utxo.mine(1);
        h.wait_for_status(&id, SwapStatus::Completed, Duration::from_secs(5))
            .await;
        h.engine.stop_watchers();
    }
}

// ============================================================================
// Rejected operations
// ============================================================================

mod rejections {
    use super::*;

    #[tokio::test]
    async fn test_secret_reuse_rejected() {
        let h = Harness::new();
        let secret = hashlock::generate_secret();
        let mut params = h.account_to_utxo(1_000, 50_000);
        params.secret = Some(secret);
        h.engine.initiate_swap(params.clone()).await.unwrap();

        assert!(matches!(
            h.engine.initiate_swap(params).await,
            Err(SwapError::SecretReused)
        ));

        let mut by_hash = h.account_to_utxo(1_000, 50_000);
        by_hash.hashlock = Some(hashlock::hash(&secret));
        assert!(matches!(
            h.engine.initiate_swap(by_hash).await,
            Err(SwapError::SecretReused)
        ));
    }

    #[tokio::test]
    async fn test_invalid_orders_rejected() {
        let h = Harness::new();

        let mut same_chain = h.account_to_utxo(1_000, 50_000);
        same_chain.dst = same_chain.src.clone();
        assert!(matches!(
            h.engine.initiate_swap(same_chain).await,
            Err(SwapError::Validation(_))
        ));

        let mut zero = h.account_to_utxo(0, 50_000);
        zero.src.amount = 0;
        assert!(matches!(
            h.engine.initiate_swap(zero).await,
            Err(SwapError::Validation(_))
        ));

        let mut inverted = h.account_to_utxo(1_000, 50_000);
        inverted.dst_timelock_secs = inverted.src_timelock_secs + 1;
        assert!(matches!(
            h.engine.initiate_swap(inverted).await,
            Err(SwapError::Validation(_))
        ));

        let mut bad_key = h.account_to_utxo(1_000, 50_000);
        bad_key.dst.recipient = "not-a-pubkey".to_string();
        assert!(matches!(
            h.engine.initiate_swap(bad_key).await,
            Err(SwapError::Validation(_))
        ));

        let mut both = h.account_to_utxo(1_000, 50_000);
        let secret = hashlock::generate_secret();
        both.secret = Some(secret);
        both.hashlock = Some(hashlock::hash(&secret));
        assert!(matches!(
            h.engine.initiate_swap(both).await,
            Err(SwapError::Validation(_))
        ));
    }

    #[tokio::test]
    async fn test_out_of_order_operations() {
        let h = Harness::new();
        let initiated = h
            .engine
            .initiate_swap(h.account_to_utxo(1_000_000, 100_000))
            .await
            .unwrap();
        let id = initiated.order_id;
        let secret = initiated.secrets[0];

        assert!(matches!(
            h.engine.claim(&id, secret, None).await,
            Err(SwapError::NotReady(_))
        ));
        assert!(matches!(
            h.engine.refund(&id).await,
            Err(SwapError::NotReady(_))
        ));

        h.engine.fund(&id).await.unwrap();
        assert!(matches!(
            h.engine.refund(&id).await,
            Err(SwapError::NotReady(_))
        ));

        h.engine.claim(&id, secret, None).await.unwrap();
        assert!(matches!(
            h.engine.refund(&id).await,
            Err(SwapError::InvalidTransition {
                from: SwapStatus::Completed,
                to: SwapStatus::Refunded
            })
        ));
        assert_eq!(h.status(&id).await, SwapStatus::Completed);
    }

    #[tokio::test]
    async fn test_unknown_order() {
        let h = Harness::new();
        let id = resolver::types::OrderId([0x42; 32]);
        assert!(matches!(
            h.engine.get_status(&id).await,
            Err(SwapError::UnknownOrder(_))
        ));
        assert!(matches!(
            h.engine.fund(&id).await,
            Err(SwapError::UnknownOrder(_))
        ));
    }

    #[tokio::test]
    async fn test_missing_maker_signature_rejected_by_factory() {
        let h = Harness::new();
        let mut params = h.account_to_utxo(1_000_000, 100_000);
        params.maker_signature = String::new();
        let initiated = h.engine.initiate_swap(params).await.unwrap();

        assert!(matches!(
            h.engine.fund(&initiated.order_id).await,
            Err(SwapError::InsufficientSignatureOrAllowance(_))
        ));
        let record = h.record(&initiated.order_id).await;
        assert!(record.state.fills.is_empty());
        assert_eq!(record.state.status, SwapStatus::Initiated);
        assert!(record.state.last_error.is_some());
    }
}
