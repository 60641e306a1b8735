//! Settlement of a swap: claiming both legs with the secret, or taking both
//! legs back once their timelocks expired.

use crate::{
    engine::{extract_secret, public_key, BitcoinTransactionEngine, RawTx, Utxo},
    escrow::EthereumEscrow,
    ethereum,
    htlc::verify_htlc,
    resolver::SwapHandle,
    swap::{AtomicSwapState, Status},
    Clock, Error, Secret, SecretVault, Timestamp,
};
use bitcoin::{secp256k1::SecretKey, Address, Txid};
use std::{fmt, sync::Arc};
use tracing_futures::Instrument;

/// Whether the secret can still be revealed safely.
pub fn can_complete_swap(state: &AtomicSwapState, now: Timestamp) -> bool {
    !state.status.is_terminal()
        && state.is_funded()
        && state.eth_htlc.is_some()
        && now < state.timelock
}

pub fn can_refund_swap(state: &AtomicSwapState, now: Timestamp) -> bool {
    !state.status.is_terminal() && state.secret.is_none() && now >= state.timelock
}

#[derive(Clone, Debug)]
pub struct CompleteSwap {
    pub recipient_address: Address,
    pub recipient_key: SecretKey,
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Completed {
    pub bitcoin_txid: Txid,
    pub ethereum_tx: ethereum::Hash,
}

#[derive(Clone, Debug)]
pub struct BitcoinRefund {
    pub sender_address: Address,
    pub sender_key: SecretKey,
}

#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct Refunded {
    pub bitcoin_txid: Option<Txid>,
    pub ethereum_tx: Option<ethereum::Hash>,
}

pub struct SwapCompletionService {
    engine: Arc<BitcoinTransactionEngine>,
    escrow: Arc<dyn EthereumEscrow>,
    vault: SecretVault,
    clock: Arc<dyn Clock>,
}

impl fmt::Debug for SwapCompletionService {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SwapCompletionService")
            .field("engine", &self.engine)
            .field("escrow", &self.escrow)
            .finish()
    }
}

impl SwapCompletionService {
    pub fn new(
        engine: Arc<BitcoinTransactionEngine>,
        escrow: Arc<dyn EthereumEscrow>,
        vault: SecretVault,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            engine,
            escrow,
            vault,
            clock,
        }
    }

    /// Claims the bitcoin, which reveals the secret, then withdraws the
    /// ether with it.
    ///
    /// Calling this again after the withdrawal failed only retries the
    /// withdrawal.
    pub async fn complete_swap(
        &self,
        handle: &SwapHandle,
        request: CompleteSwap,
    ) -> Result<Completed, Error> {
        let mut state = handle.lock().await;
        let swap_id = state.id;

        self.complete(&mut state, request)
            .instrument(tracing::info_span!("complete", %swap_id))
            .await
    }

    async fn complete(
        &self,
        state: &mut AtomicSwapState,
        request: CompleteSwap,
    ) -> Result<Completed, Error> {
        if state.status.is_terminal() {
            return Err(Error::InvalidTransition {
                from: state.status,
                to: Status::Completed,
            });
        }

        let eth_htlc = state
            .eth_htlc
            .ok_or_else(|| Error::validation("swap has no ethereum escrow"))?;
        let claimed = state
            .btc_htlc
            .as_ref()
            .and_then(|leg| leg.claim_txid)
            .zip(state.secret);

        let (bitcoin_txid, secret) = match claimed {
            Some(claimed) => {
                tracing::info!(txid = %claimed.0, "bitcoin already claimed");
                claimed
            }
            None => self.claim_bitcoin(state, &request).await?,
        };

        let ethereum_tx = self.escrow.withdraw(eth_htlc.htlc_id, secret).await?;
        tracing::info!(tx_hash = %ethereum_tx, "withdrew {}", state.amount);

        state.eth_withdraw_tx = Some(ethereum_tx);
        state.transition(Status::Completed)?;
        self.vault.discard(&state.id);

        Ok(Completed {
            bitcoin_txid,
            ethereum_tx,
        })
    }

    async fn claim_bitcoin(
        &self,
        state: &mut AtomicSwapState,
        request: &CompleteSwap,
    ) -> Result<(Txid, Secret), Error> {
        let now = self.clock.now();
        if now >= state.timelock {
            return Err(Error::TimelockViolation {
                now,
                timelock: state.timelock,
            });
        }
        if !can_complete_swap(state, now) {
            return Err(Error::validation(format!(
                "swap in status {} cannot be completed",
                state.status
            )));
        }

        let leg = state
            .btc_htlc
            .clone()
            .ok_or_else(|| Error::validation("swap has no bitcoin htlc"))?;

        if let Err(e) = verify_htlc(&leg.params, &leg.htlc) {
            state.flag_for_reconciliation(e.to_string());
            return Err(e);
        }
        if public_key(&request.recipient_key) != leg.params.recipient_pubkey {
            return Err(Error::validation(
                "recipient key does not unlock the hashlock branch",
            ));
        }

        // The stored funding flag is not enough, the agreed coins have to be
        // there right now.
        let funding = self.engine.is_htlc_funded(&leg.htlc.address).await?;
        let utxo = funding
            .covering(leg.amount_sats)
            .cloned()
            .ok_or_else(|| {
                Error::validation(format!(
                    "bitcoin htlc holds {} sat in its largest output, {} sat were agreed",
                    funding.utxo.as_ref().map_or(0, |utxo| utxo.value),
                    leg.amount_sats
                ))
            })?;

        let commitment = self
            .vault
            .commitment(&state.id)
            .filter(|commitment| commitment.hash() == state.secret_hash)
            .ok_or_else(|| Error::validation("no secret for this swap in the vault"))?;

        let raw = self.engine.claim_htlc(
            &utxo,
            &request.recipient_address,
            commitment.preimage(),
            &leg.htlc.witness_script,
            &request.recipient_key,
        )?;
        let txid = self.publish(&raw).await?;

        state.secret = Some(commitment.preimage());
        if let Some(leg) = state.btc_htlc.as_mut() {
            leg.claim_txid = Some(txid);
        }

        Ok((txid, commitment.preimage()))
    }

    async fn publish(&self, raw: &RawTx) -> Result<Txid, Error> {
        match self.engine.broadcast(&raw.transaction).await {
            Ok(txid) => Ok(txid),
            Err(e @ Error::BroadcastRejected { .. }) => Err(e),
            Err(e) => {
                // Signing is deterministic, a retry rebuilds this exact
                // transaction.
                self.engine.release(&raw.transaction);
                Err(e)
            }
        }
    }

    /// Takes back whatever the timelocks allow.
    ///
    /// The Bitcoin leg is only touched when `bitcoin_refund` is given. The
    /// swap ends up refunded once neither leg holds locked funds.
    pub async fn refund_swap(
        &self,
        handle: &SwapHandle,
        bitcoin_refund: Option<BitcoinRefund>,
    ) -> Result<Refunded, Error> {
        let mut state = handle.lock().await;
        let swap_id = state.id;

        self.refund(&mut state, bitcoin_refund)
            .instrument(tracing::info_span!("refund", %swap_id))
            .await
    }

    async fn refund(
        &self,
        state: &mut AtomicSwapState,
        bitcoin_refund: Option<BitcoinRefund>,
    ) -> Result<Refunded, Error> {
        let now = self.clock.now();

        if state.status.is_terminal() {
            return Err(Error::InvalidTransition {
                from: state.status,
                to: Status::Refunded,
            });
        }
        if state.secret.is_some() {
            return Err(Error::validation(
                "the secret is public, the swap has to be completed",
            ));
        }
        if now < state.timelock {
            return Err(Error::TimelockViolation {
                now,
                timelock: state.timelock,
            });
        }

        let mut refunded = Refunded::default();

        match bitcoin_refund {
            Some(request) => refunded.bitcoin_txid = self.refund_bitcoin(state, &request).await?,
            None => self.observe_bitcoin(state).await?,
        }

        if let Some(eth_htlc) = state.eth_htlc {
            if state.eth_refund_tx.is_none() && now >= state.eth_timelock {
                let escrow = self.escrow.status(eth_htlc.htlc_id).await?;

                if escrow.is_locked() {
                    let tx = self.escrow.refund(eth_htlc.htlc_id).await?;
                    tracing::info!(tx_hash = %tx, "refunded {}", state.amount);
                    state.eth_refund_tx = Some(tx);
                    refunded.ethereum_tx = Some(tx);
                }
            }
        }

        let btc_locked = state
            .btc_htlc
            .as_ref()
            .map(|leg| leg.funded && !leg.is_spent())
            .unwrap_or(false);
        let eth_locked = match state.eth_htlc {
            Some(eth_htlc) if state.eth_refund_tx.is_none() => {
                self.escrow.status(eth_htlc.htlc_id).await?.is_locked()
            }
            _ => false,
        };

        if !btc_locked && !eth_locked {
            state.transition(Status::Refunded)?;
            self.vault.discard(&state.id);
            tracing::info!("swap refunded");
        } else {
            tracing::info!(btc_locked, eth_locked, "refund incomplete, funds still locked");
        }

        Ok(refunded)
    }

    async fn refund_bitcoin(
        &self,
        state: &mut AtomicSwapState,
        request: &BitcoinRefund,
    ) -> Result<Option<Txid>, Error> {
        let leg = match state.btc_htlc.clone() {
            Some(leg) if !leg.is_spent() => leg,
            _ => return Ok(None),
        };

        verify_htlc(&leg.params, &leg.htlc)?;

        let funding = self.engine.is_htlc_funded(&leg.htlc.address).await?;
        let utxo = match funding.utxo {
            Some(utxo) => utxo,
            None => {
                if let Some(spent) = &leg.funding_utxo {
                    self.detect_claim(state, spent).await?;
                }
                return Ok(None);
            }
        };

        let chain_time = self.engine.chain_time().await?;
        if chain_time < leg.params.timelock {
            tracing::info!(
                %chain_time,
                timelock = %leg.params.timelock,
                "bitcoin timelock not reached by the chain yet"
            );
            if let Some(leg) = state.btc_htlc.as_mut() {
                leg.funded = true;
            }
            return Ok(None);
        }

        let raw = self.engine.refund_htlc(
            &utxo,
            &request.sender_address,
            &leg.htlc.witness_script,
            &request.sender_key,
            leg.params.timelock,
            chain_time,
        )?;
        let txid = self.publish(&raw).await?;
        tracing::info!(%txid, "refunded {} sat", utxo.value);

        if let Some(leg) = state.btc_htlc.as_mut() {
            leg.funded = true;
            leg.refund_txid = Some(txid);
        }

        Ok(Some(txid))
    }

    /// Catches up with a Bitcoin leg this node cannot refund itself.
    async fn observe_bitcoin(&self, state: &mut AtomicSwapState) -> Result<(), Error> {
        let leg = match state.btc_htlc.clone() {
            Some(leg) if !leg.is_spent() => leg,
            _ => return Ok(()),
        };

        let funding = self.engine.is_htlc_funded(&leg.htlc.address).await?;
        match (funding.covering(leg.amount_sats).cloned(), leg.funding_utxo) {
            (Some(utxo), _) => {
                tracing::info!(
                    txid = %utxo.outpoint.txid,
                    "bitcoin htlc still holds {} sat",
                    utxo.value
                );
                if let Some(leg) = state.btc_htlc.as_mut() {
                    leg.funded = true;
                    leg.funding_txid.get_or_insert(utxo.outpoint.txid);
                    leg.funding_utxo.get_or_insert(utxo);
                }
            }
            (None, Some(spent)) => self.detect_claim(state, &spent).await?,
            (None, None) => {}
        }

        Ok(())
    }

    /// The HTLC was emptied by somebody else. If that was a claim, the
    /// secret is now public and the ether must not be refunded.
    async fn detect_claim(&self, state: &mut AtomicSwapState, funding: &Utxo) -> Result<(), Error> {
        let spender = match self.engine.spending_transaction(funding.outpoint).await? {
            Some(txid) => txid,
            None => return Ok(()),
        };
        let secret = self
            .engine
            .transaction(spender)
            .await?
            .and_then(|transaction| extract_secret(&transaction, &state.secret_hash));

        match secret {
            Some(secret) => {
                state.secret = Some(secret);
                if let Some(leg) = state.btc_htlc.as_mut() {
                    leg.claim_txid = Some(spender);
                }

                Err(Error::validation(format!(
                    "bitcoin htlc was claimed in {}, the ether has to be withdrawn",
                    spender
                )))
            }
            None => {
                if let Some(leg) = state.btc_htlc.as_mut() {
                    leg.refund_txid = Some(spender);
                }

                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_harness::Fixture;
    use spectral::prelude::*;

    struct Funded {
        fixture: Fixture,
        handle: SwapHandle,
        service: SwapCompletionService,
    }

    async fn funded_swap() -> Funded {
        let fixture = Fixture::new();
        let resolver = fixture.resolver(1_000_000);
        fixture.fund_wallet(&resolver, 5_000_000);
        let handle = resolver.register_swap(fixture.initiate().await);
        resolver.tick().await;
        let service = fixture.completion();

        Funded {
            fixture,
            handle,
            service,
        }
    }

    fn claim_request(fixture: &Fixture) -> CompleteSwap {
        CompleteSwap {
            recipient_address: fixture.alice_wallet(),
            recipient_key: fixture.alice.0,
        }
    }

    fn refund_request(fixture: &Fixture) -> BitcoinRefund {
        BitcoinRefund {
            sender_address: fixture.bob_wallet(),
            sender_key: fixture.bob.0,
        }
    }

    #[tokio::test]
    async fn eligibility_follows_funding_and_timelock() {
        let Funded { fixture, handle, .. } = funded_swap().await;
        let state = handle.lock().await.clone();

        assert_that(&can_complete_swap(&state, fixture.now())).is_true();
        assert_that(&can_refund_swap(&state, fixture.now())).is_false();
        assert_that(&can_complete_swap(&state, state.timelock)).is_false();
        assert_that(&can_refund_swap(&state, state.timelock)).is_true();
    }

    #[tokio::test]
    async fn unfunded_swap_cannot_be_completed() {
        let fixture = Fixture::new();
        let state = fixture.initiate().await;

        assert_that(&can_complete_swap(&state, fixture.now())).is_false();
    }

    #[tokio::test]
    async fn completion_claims_bitcoin_then_withdraws_ether() {
        let Funded {
            fixture,
            handle,
            service,
        } = funded_swap().await;

        let completed = service
            .complete_swap(&handle, claim_request(&fixture))
            .await
            .unwrap();

        let state = handle.lock().await;
        assert_that(&state.status).is_equal_to(Status::Completed);
        assert_that(&state.secret.map(|s| s.hash())).is_equal_to(Some(state.secret_hash));
        assert_that(&state.eth_withdraw_tx).is_equal_to(Some(completed.ethereum_tx));
        assert_that(&fixture.escrow.withdrawals()).has_length(1);
        assert_that(&fixture.indexer.balance(&fixture.alice_wallet().script_pubkey()))
            .is_greater_than(990_000);

        let claim = fixture.indexer.broadcasts().pop().unwrap();
        assert_that(&claim.txid()).is_equal_to(completed.bitcoin_txid);
        assert_that(&extract_secret(&claim, &state.secret_hash)).is_equal_to(state.secret);
    }

    #[tokio::test]
    async fn failed_withdrawal_is_retried_without_claiming_again() {
        let Funded {
            fixture,
            handle,
            service,
        } = funded_swap().await;
        fixture.escrow.fail_next_withdraw();

        let first = service.complete_swap(&handle, claim_request(&fixture)).await;
        let broadcasts_after_first = fixture.indexer.broadcasts().len();
        let second = service
            .complete_swap(&handle, claim_request(&fixture))
            .await
            .unwrap();

        assert!(matches!(first, Err(Error::Network(_))));
        assert_that(&fixture.indexer.broadcasts().len()).is_equal_to(broadcasts_after_first);
        assert_that(&handle.lock().await.status).is_equal_to(Status::Completed);
        assert_that(&fixture.escrow.withdrawals()[0].1.hash())
            .is_equal_to(handle.lock().await.secret_hash);
        assert_that(&second.bitcoin_txid)
            .is_equal_to(fixture.indexer.broadcasts().last().unwrap().txid());
    }

    #[tokio::test]
    async fn secret_stays_in_custody_when_htlc_is_empty() {
        let fixture = Fixture::new();
        let mut state = fixture.initiate().await;
        // Pretend the resolver reported funding that never made it on chain.
        state.btc_htlc.as_mut().unwrap().funded = true;
        state.status = Status::ParticipantFunded;
        let handle = fixture.resolver(1_000_000).register_swap(state);
        let service = fixture.completion();

        let result = service.complete_swap(&handle, claim_request(&fixture)).await;

        assert!(matches!(result, Err(Error::Validation(_))));
        assert_that(&handle.lock().await.secret).is_none();
        assert_that(&fixture.indexer.broadcasts()).is_empty();
    }

    #[tokio::test]
    async fn htlc_below_agreed_amount_keeps_the_secret() {
        let fixture = Fixture::new();
        let mut state = fixture.initiate().await;
        let address = state.btc_address().cloned().unwrap();
        fixture.indexer.mint(&address, 1_000);
        state.btc_htlc.as_mut().unwrap().funded = true;
        state.status = Status::ParticipantFunded;
        let handle = fixture.resolver(1_000_000).register_swap(state);
        let service = fixture.completion();

        let result = service.complete_swap(&handle, claim_request(&fixture)).await;

        assert!(matches!(result, Err(Error::Validation(_))));
        let state = handle.lock().await;
        assert_that(&state.secret).is_none();
        assert_that(&state.status).is_equal_to(Status::ParticipantFunded);
        assert_that(&fixture.indexer.broadcasts()).is_empty();
        assert_that(&fixture.escrow.withdrawals()).is_empty();
    }

    #[tokio::test]
    async fn completion_after_bitcoin_timelock_is_refused() {
        let Funded {
            fixture,
            handle,
            service,
        } = funded_swap().await;
        fixture.advance(3600);

        let result = service.complete_swap(&handle, claim_request(&fixture)).await;

        assert!(matches!(result, Err(Error::TimelockViolation { .. })));
        assert_that(&handle.lock().await.secret).is_none();
    }

    #[tokio::test]
    async fn wrong_claim_key_is_refused_before_signing() {
        let Funded {
            fixture,
            handle,
            service,
        } = funded_swap().await;
        let request = CompleteSwap {
            recipient_key: fixture.bob.0,
            ..claim_request(&fixture)
        };

        let result = service.complete_swap(&handle, request).await;

        assert!(matches!(result, Err(Error::Validation(_))));
        assert_that(&handle.lock().await.secret).is_none();
    }

    #[tokio::test]
    async fn refund_before_timelock_is_a_violation() {
        let Funded {
            fixture,
            handle,
            service,
        } = funded_swap().await;

        let result = service
            .refund_swap(&handle, Some(refund_request(&fixture)))
            .await;

        assert!(matches!(result, Err(Error::TimelockViolation { .. })));
    }

    #[tokio::test]
    async fn bitcoin_leg_is_refunded_before_ethereum_leg_expires() {
        let Funded {
            fixture,
            handle,
            service,
        } = funded_swap().await;
        fixture.advance(3600);

        let refunded = service
            .refund_swap(&handle, Some(refund_request(&fixture)))
            .await
            .unwrap();

        assert_that(&refunded.bitcoin_txid).is_some();
        assert_that(&refunded.ethereum_tx).is_none();
        let state = handle.lock().await;
        assert_that(&state.status).is_equal_to(Status::ParticipantFunded);
        assert_that(&state.btc_htlc.as_ref().unwrap().refund_txid).is_equal_to(refunded.bitcoin_txid);
    }

    #[tokio::test]
    async fn both_legs_refunded_after_both_timelocks() {
        let Funded {
            fixture,
            handle,
            service,
        } = funded_swap().await;
        fixture.advance(2 * 3600);

        let refunded = service
            .refund_swap(&handle, Some(refund_request(&fixture)))
            .await
            .unwrap();

        assert_that(&refunded.bitcoin_txid).is_some();
        assert_that(&refunded.ethereum_tx).is_some();
        assert_that(&handle.lock().await.status).is_equal_to(Status::Refunded);
        assert_that(&fixture.escrow.refunds()).has_length(1);
        assert_that(&fixture.vault.all()).is_empty();
        assert_that(&fixture.indexer.balance(&fixture.bob_wallet().script_pubkey()))
            .is_greater_than(4_990_000);
    }

    #[tokio::test]
    async fn refunded_swap_cannot_be_completed() {
        let Funded {
            fixture,
            handle,
            service,
        } = funded_swap().await;
        fixture.advance(2 * 3600);
        service
            .refund_swap(&handle, Some(refund_request(&fixture)))
            .await
            .unwrap();

        let result = service.complete_swap(&handle, claim_request(&fixture)).await;

        assert_that(&result).is_err_containing(Error::InvalidTransition {
            from: Status::Refunded,
            to: Status::Completed,
        });
    }

    #[tokio::test]
    async fn claim_seen_on_chain_blocks_ether_refund() {
        let Funded {
            fixture,
            handle,
            service,
        } = funded_swap().await;
        let other_node = fixture.completion();
        let alices_copy = handle.lock().await.clone();
        let alices_handle = fixture.resolver(1_000_000).register_swap(alices_copy);
        other_node
            .complete_swap(&alices_handle, claim_request(&fixture))
            .await
            .unwrap();
        fixture.advance(2 * 3600);

        let result = service
            .refund_swap(&handle, Some(refund_request(&fixture)))
            .await;

        assert!(matches!(result, Err(Error::Validation(_))));
        let state = handle.lock().await;
        assert_that(&state.secret.map(|s| s.hash())).is_equal_to(Some(state.secret_hash));
        assert_that(&fixture.escrow.refunds()).is_empty();
    }

    #[tokio::test]
    async fn initiator_sees_bitcoin_refunded_by_the_funder() {
        let Funded {
            fixture,
            handle,
            service,
        } = funded_swap().await;
        let alices_node = fixture.completion();
        let alices_copy = handle.lock().await.clone();
        let alices_handle = fixture.resolver(1_000_000).register_swap(alices_copy);
        fixture.advance(2 * 3600);
        service
            .refund_swap(&handle, Some(refund_request(&fixture)))
            .await
            .unwrap();

        let refunded = alices_node.refund_swap(&alices_handle, None).await.unwrap();

        assert_that(&refunded.bitcoin_txid).is_none();
        let state = alices_handle.lock().await;
        assert_that(&state.status).is_equal_to(Status::Refunded);
        assert_that(&state.btc_htlc.as_ref().unwrap().refund_txid)
            .is_equal_to(handle.lock().await.btc_htlc.as_ref().unwrap().refund_txid);
        assert_that(&fixture.escrow.refunds()).has_length(1);
    }

    #[tokio::test]
    async fn initiator_waits_while_bitcoin_is_still_locked() {
        let Funded {
            fixture,
            handle,
            service,
        } = funded_swap().await;
        let mut alices_copy = handle.lock().await.clone();
        let leg = alices_copy.btc_htlc.as_mut().unwrap();
        leg.funded = false;
        leg.funding_txid = None;
        leg.funding_utxo = None;
        let alices_handle = fixture.resolver(1_000_000).register_swap(alices_copy);
        fixture.advance(2 * 3600);

        service.refund_swap(&alices_handle, None).await.unwrap();

        let state = alices_handle.lock().await;
        assert_that(&state.status).is_equal_to(Status::ParticipantFunded);
        assert_that(&state.is_funded()).is_true();
        assert_that(&fixture.escrow.refunds()).has_length(1);
    }
}
