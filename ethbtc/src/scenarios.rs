//! Whole swaps, from initiation to settlement, against the in-memory chains.

use crate::{
    completion::{can_complete_swap, can_refund_swap, CompleteSwap},
    engine::extract_secret,
    swap::{Status, SwapEvent},
    test_harness::Fixture,
};
use futures::{channel::mpsc, StreamExt};
use spectral::prelude::*;
use std::time::Duration;

#[tokio::test]
async fn happy_path_ends_completed_with_the_secret_on_both_chains() {
    let fixture = Fixture::new();
    let resolver = fixture.resolver(1_000_000);
    fixture.fund_wallet(&resolver, 2_000_000);
    let (sender, receiver) = mpsc::unbounded();

    let state = fixture
        .coordinator
        .initiate_eth_to_btc(fixture.initiate_params(), &sender)
        .await
        .unwrap();
    drop(sender);
    let eth_htlc = state.eth_htlc.unwrap();
    let handle = resolver.register_swap(state);

    resolver.tick().await;
    let funded = handle.lock().await.clone();
    assert_that(&funded.status).is_equal_to(Status::ParticipantFunded);
    assert_that(&can_complete_swap(&funded, fixture.now())).is_true();

    let completed = fixture
        .completion()
        .complete_swap(&handle, CompleteSwap {
            recipient_address: fixture.alice_wallet(),
            recipient_key: fixture.alice.0,
        })
        .await
        .unwrap();

    let state = handle.lock().await;
    assert_that(&state.status).is_equal_to(Status::Completed);
    assert_that(&fixture.escrow.secret_hash_of(eth_htlc.htlc_id))
        .is_equal_to(Some(state.btc_htlc.as_ref().unwrap().params.secret_hash));

    let claim = fixture.indexer.broadcasts().pop().unwrap();
    let revealed = extract_secret(&claim, &state.secret_hash).unwrap();
    assert_that(&claim.txid()).is_equal_to(completed.bitcoin_txid);
    assert_that(&fixture.escrow.withdrawals()).is_equal_to(vec![(eth_htlc.htlc_id, revealed)]);

    let events = receiver.collect::<Vec<_>>().await;
    assert_that(&events).has_length(4);
    assert!(matches!(events[3], SwapEvent::AwaitingBitcoinFunding { .. }));
}

#[tokio::test]
async fn unfunded_swap_ends_refunded_after_the_ethereum_timelock() {
    let fixture = Fixture::new();
    let state = fixture.initiate().await;
    let eth_htlc = state.eth_htlc.unwrap();
    let eth_timelock = state.eth_timelock;
    let handle = fixture.resolver(1_000_000).register_swap(state);
    let service = fixture.completion();

    fixture.advance(fixture.now().seconds_until(eth_timelock));
    assert_that(&can_refund_swap(&*handle.lock().await, fixture.now())).is_true();

    let refunded = service.refund_swap(&handle, None).await.unwrap();

    let state = handle.lock().await;
    assert_that(&state.status).is_equal_to(Status::Refunded);
    assert_that(&refunded.bitcoin_txid).is_none();
    assert_that(&refunded.ethereum_tx).is_equal_to(state.eth_refund_tx);
    assert_that(&fixture.escrow.refunds()).is_equal_to(vec![eth_htlc.htlc_id]);
    assert_that(&fixture.indexer.broadcasts()).is_empty();
}

#[tokio::test(start_paused = true)]
async fn background_resolver_funds_swaps_registered_while_running() {
    let fixture = Fixture::new();
    let resolver = fixture.resolver(1_000_000);
    fixture.fund_wallet(&resolver, 5_000_000);

    resolver.start();
    let handle = resolver.register_swap(fixture.initiate().await);
    tokio::time::sleep(Duration::from_secs(25)).await;
    resolver.stop().await;

    assert_that(&handle.lock().await.status).is_equal_to(Status::ParticipantFunded);
    assert_that(&fixture.indexer.broadcasts()).has_length(1);
    assert_that(&resolver.status().running).is_false();
}
