use tracing::{info, warn};

use super::{contract_and_hash, integrity, missing, unexpected_payload};
use crate::common::{crypto, error::EscrowError};
use crate::deposit::{PayoutTx, SignedPayoutTx, Transaction};
use crate::protocol::context::TradeContext;
use crate::protocol::messages::{PayoutTxPublished, TradePayload};
use crate::trade::{DeliveryStates, Phase, State};

/// Checks the buyer's payout against the contract before anything is signed.
pub(super) async fn process_payment_started(ctx: &mut TradeContext) -> Result<(), EscrowError> {
    let trade_id = ctx.trade.id;
    let TradePayload::PaymentStarted(started) = ctx.inbound_payload()?.clone() else {
        return Err(unexpected_payload(trade_id, "PaymentStarted"));
    };
    let (contract, _) = contract_and_hash(&ctx.trade)?;
    let deposit_txid = ctx
        .trade
        .deposit_tx_id
        .ok_or_else(|| missing(trade_id, "published deposit tx"))?;

    let expected = PayoutTx::new(
        deposit_txid,
        contract.multisig_amount()?,
        contract.buyer_payout_address(),
        contract.seller_payout_address(),
        contract.trade_amount,
        contract.buyer_security_deposit,
        contract.seller_security_deposit,
        contract.tx_fee,
    )?;
    if expected != started.payout_tx {
        return Err(integrity(trade_id, "payout tx differs from the contract"));
    }
    crypto::verify_hash_signature(
        &contract.buyer_multisig_pub_key(),
        &expected.payout_sighash()?,
        &started.buyer_payout_signature,
    )
    .map_err(|error| integrity(trade_id, format!("buyer payout signature - {}", error)))?;

    ctx.trade.process_model.payout_tx = Some(expected);
    ctx.trade.process_model.trading_peer.payout_tx_signature = Some(started.buyer_payout_signature);
    ctx.set_state(State::PaymentStartedReceived).await
}

pub(super) async fn sign_and_finalize_payout_tx(
    ctx: &mut TradeContext,
) -> Result<(), EscrowError> {
    let trade_id = ctx.trade.id;
    if ctx.trade.process_model.signed_payout_tx.is_some() {
        return Ok(());
    }
    let (contract, _) = contract_and_hash(&ctx.trade)?;
    let process_model = &ctx.trade.process_model;
    let payout_tx = process_model
        .payout_tx
        .clone()
        .ok_or_else(|| missing(trade_id, "payout tx"))?;
    let buyer_signature = process_model
        .trading_peer
        .payout_tx_signature
        .clone()
        .ok_or_else(|| missing(trade_id, "buyer payout signature"))?;
    let own_key = process_model
        .my_multisig_pub_key
        .ok_or_else(|| missing(trade_id, "own multisig key"))?;
    if own_key != contract.seller_multisig_pub_key() {
        return Err(integrity(trade_id, "own multisig key is not the contract's seller key"));
    }

    let seller_signature = ctx
        .services
        .wallet
        .sign_with_multisig_key(&own_key, &payout_tx.payout_sighash()?)
        .await?;
    let signed = SignedPayoutTx {
        tx: payout_tx,
        buyer_signature,
        seller_signature: seller_signature.clone(),
    };
    signed.verify(
        &contract.buyer_multisig_pub_key(),
        &contract.seller_multisig_pub_key(),
    )?;

    ctx.trade.process_model.payout_tx_signature = Some(seller_signature);
    ctx.trade.process_model.signed_payout_tx = Some(signed);
    ctx.set_state(State::PaymentReceived).await?;
    ctx.set_state(State::PayoutSigned).await
}

/// Broadcasts the payout unless the wallet already knows it.
pub(super) async fn publish_payout_tx(ctx: &mut TradeContext) -> Result<(), EscrowError> {
    let trade_id = ctx.trade.id;
    let signed = ctx
        .trade
        .process_model
        .signed_payout_tx
        .clone()
        .ok_or_else(|| missing(trade_id, "signed payout tx"))?;
    let txid = signed.txid()?;

    let wallet = ctx.services.wallet.clone();
    if wallet.is_tx_known(&txid).await? {
        warn!(
            "Trade w/ TradeUUID {} payout tx {} already known, not broadcasting again",
            trade_id, txid
        );
    } else {
        let broadcast_txid = wallet.broadcast(&Transaction::Payout(signed)).await?;
        if broadcast_txid != txid {
            return Err(integrity(
                trade_id,
                format!("broadcast returned txid {} for {}", broadcast_txid, txid),
            ));
        }
        info!("Trade w/ TradeUUID {} payout tx {} published", trade_id, txid);
    }

    ctx.trade.payout_tx_id = Some(txid);
    if ctx.trade.state().phase() < Phase::PayoutPublished {
        ctx.set_state(State::PayoutPublished).await
    } else {
        ctx.checkpoint()
    }
}

pub(super) async fn send_payout_tx_published_message(
    ctx: &mut TradeContext,
) -> Result<(), EscrowError> {
    let trade_id = ctx.trade.id;
    let (_, contract_hash) = contract_and_hash(&ctx.trade)?;
    let published = PayoutTxPublished {
        contract_hash,
        payout_tx: ctx
            .trade
            .process_model
            .signed_payout_tx
            .clone()
            .ok_or_else(|| missing(trade_id, "signed payout tx"))?,
    };
    let delivery_states = DeliveryStates {
        sent: Some(State::PayoutPublishedMsgSent),
        arrived: Some(State::PayoutPublishedArrived),
        stored_in_mailbox: Some(State::PayoutPublishedStoredInMailbox),
        send_failed: Some(State::PayoutPublishedSendFailed),
    };
    ctx.send_and_await(TradePayload::PayoutTxPublished(published), delivery_states)
        .await
}
