use tracing::info;

use super::{contract_and_hash, integrity, missing, unexpected_payload};
use crate::common::error::EscrowError;
use crate::deposit::PayoutTx;
use crate::protocol::context::TradeContext;
use crate::protocol::messages::{PaymentStarted, TradePayload};
use crate::trade::{DeliveryStates, State};

pub(super) async fn sign_payout_tx(ctx: &mut TradeContext) -> Result<(), EscrowError> {
    let trade_id = ctx.trade.id;
    let (contract, _) = contract_and_hash(&ctx.trade)?;
    let deposit_txid = ctx
        .trade
        .deposit_tx_id
        .ok_or_else(|| missing(trade_id, "published deposit tx"))?;
    let own_key = ctx
        .trade
        .process_model
        .my_multisig_pub_key
        .ok_or_else(|| missing(trade_id, "own multisig key"))?;
    if own_key != contract.buyer_multisig_pub_key() {
        return Err(integrity(trade_id, "own multisig key is not the contract's buyer key"));
    }

    let payout_tx = PayoutTx::new(
        deposit_txid,
        contract.multisig_amount()?,
        contract.buyer_payout_address(),
        contract.seller_payout_address(),
        contract.trade_amount,
        contract.buyer_security_deposit,
        contract.seller_security_deposit,
        contract.tx_fee,
    )?;
    let signature = ctx
        .services
        .wallet
        .sign_with_multisig_key(&own_key, &payout_tx.payout_sighash()?)
        .await?;

    ctx.trade.process_model.payout_tx = Some(payout_tx);
    ctx.trade.process_model.payout_tx_signature = Some(signature);
    ctx.set_state(State::PaymentStarted).await
}

pub(super) async fn send_payment_started_message(
    ctx: &mut TradeContext,
) -> Result<(), EscrowError> {
    let trade_id = ctx.trade.id;
    let (_, contract_hash) = contract_and_hash(&ctx.trade)?;
    let process_model = &ctx.trade.process_model;
    let started = PaymentStarted {
        contract_hash,
        payout_tx: process_model
            .payout_tx
            .clone()
            .ok_or_else(|| missing(trade_id, "payout tx"))?,
        buyer_payout_signature: process_model
            .payout_tx_signature
            .clone()
            .ok_or_else(|| missing(trade_id, "payout signature"))?,
    };

    let delivery_states = DeliveryStates {
        sent: Some(State::PaymentStartedMsgSent),
        arrived: Some(State::PaymentStartedArrived),
        stored_in_mailbox: Some(State::PaymentStartedStoredInMailbox),
        send_failed: Some(State::PaymentStartedSendFailed),
    };
    ctx.send_and_await(TradePayload::PaymentStarted(started), delivery_states)
        .await
}

/// Accepts the seller's payout only if it is the tx we signed, now carrying both signatures.
pub(super) async fn process_payout_tx_published(
    ctx: &mut TradeContext,
) -> Result<(), EscrowError> {
    let trade_id = ctx.trade.id;
    let TradePayload::PayoutTxPublished(published) = ctx.inbound_payload()?.clone() else {
        return Err(unexpected_payload(trade_id, "PayoutTxPublished"));
    };
    let (contract, _) = contract_and_hash(&ctx.trade)?;

    let own_payout = ctx
        .trade
        .process_model
        .payout_tx
        .as_ref()
        .ok_or_else(|| missing(trade_id, "payout tx"))?;
    if &published.payout_tx.tx != own_payout {
        return Err(integrity(trade_id, "published payout tx is not the one we signed"));
    }
    published.payout_tx.verify(
        &contract.buyer_multisig_pub_key(),
        &contract.seller_multisig_pub_key(),
    )?;
    let txid = published.payout_tx.txid()?;
    info!("Trade w/ TradeUUID {} payout tx {} received", trade_id, txid);

    ctx.trade.payout_tx_id = Some(txid);
    ctx.trade.process_model.signed_payout_tx = Some(published.payout_tx);
    ctx.trade.process_model.trading_peer.payout_tx_signature = ctx
        .trade
        .process_model
        .signed_payout_tx
        .as_ref()
        .map(|signed| signed.seller_signature.clone());
    ctx.set_state(State::PayoutPublishedReceived).await?;
    ctx.set_state(State::Completed).await
}
