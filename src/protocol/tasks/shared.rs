use tracing::{debug, info};

use super::{integrity, missing, security_deposit};
use crate::common::error::EscrowError;
use crate::deposit::{required_contribution, verify_input_signatures, redirect_sighash, warning_sighash};
use crate::protocol::context::TradeContext;
use crate::protocol::messages::WARNING_TX_VERSION;
use crate::protocol::protocol::TradeNotif;
use crate::trade::{DisputeState, State};

/// Reserves our side of the deposit and prepares the keys and address the contract needs.
pub(super) async fn select_inputs_and_change(ctx: &mut TradeContext) -> Result<(), EscrowError> {
    let trade_id = ctx.trade.id;
    let is_buyer = ctx.trade.is_buyer();
    let required = required_contribution(
        is_buyer,
        ctx.trade.amount,
        security_deposit(&ctx.trade, is_buyer),
        ctx.trade.tx_fee,
    )?;

    let wallet = ctx.services.wallet.clone();
    let selection = wallet
        .select_inputs_and_change(trade_id, required, ctx.services.config.fee_rate())
        .await?;
    let contribution = selection.contribution()?;
    if selection.inputs.is_empty() || contribution != required {
        return Err(integrity(
            trade_id,
            format!(
                "wallet selected {} but the deposit needs {}",
                contribution, required
            ),
        ));
    }

    let process_model = &mut ctx.trade.process_model;
    if process_model.my_multisig_pub_key.is_none() {
        process_model.my_multisig_pub_key = Some(wallet.new_multisig_pub_key(trade_id).await?);
    }
    if process_model.payout_address.is_none() {
        process_model.payout_address = Some(wallet.payout_address(trade_id).await?);
    }
    process_model.raw_transaction_inputs = selection.inputs;
    process_model.change_output = selection.change;
    process_model.funds_needed_for_trade = required;

    debug!(
        "Trade w/ TradeUUID {} reserved {} for the deposit",
        trade_id, required
    );
    ctx.checkpoint()
}

/// Signs our inputs of the prepared deposit tx. The maker also signs the warning and redirect
/// descriptors from protocol version 5 on.
pub(super) async fn sign_own_deposit_inputs(ctx: &mut TradeContext) -> Result<(), EscrowError> {
    let trade_id = ctx.trade.id;
    let process_model = &ctx.trade.process_model;
    let tx = process_model
        .prepared_deposit_tx
        .clone()
        .ok_or_else(|| missing(trade_id, "prepared deposit tx"))?;
    let own_key = process_model
        .my_multisig_pub_key
        .ok_or_else(|| missing(trade_id, "own multisig key"))?;
    let peer_key = process_model
        .trading_peer
        .multisig_pub_key
        .ok_or_else(|| missing(trade_id, "peer multisig key"))?;
    let own_inputs = process_model.raw_transaction_inputs.clone();
    let peer_inputs = process_model.trading_peer.raw_transaction_inputs.clone();

    let wallet = ctx.services.wallet.clone();
    let signatures = wallet
        .sign_multisig_inputs(&tx, &own_inputs, &peer_inputs, &own_key, &peer_key)
        .await?;
    verify_input_signatures(&tx, &own_inputs, &signatures)?;
    ctx.trade.process_model.deposit_input_signatures = signatures;

    if ctx.trade.is_maker() && ctx.trade.offer.protocol_version >= WARNING_TX_VERSION {
        let txid = tx.txid()?;
        let warning = wallet
            .sign_with_multisig_key(&own_key, &warning_sighash(&txid))
            .await?;
        let redirect = wallet
            .sign_with_multisig_key(&own_key, &redirect_sighash(&txid))
            .await?;
        ctx.trade.process_model.warning_tx_signature = Some(warning);
        ctx.trade.process_model.redirect_tx_signature = Some(redirect);
    }
    ctx.checkpoint()
}

pub(super) async fn set_deposit_confirmed(ctx: &mut TradeContext) -> Result<(), EscrowError> {
    if !ctx.trade.is_deposit_published() {
        return Err(missing(ctx.trade.id, "published deposit tx"));
    }
    ctx.set_state(State::DepositConfirmed).await
}

pub(super) async fn open_dispute(ctx: &mut TradeContext) -> Result<(), EscrowError> {
    info!("Trade w/ TradeUUID {} opening dispute", ctx.trade.id);
    ctx.trade.dispute_state = DisputeState::DisputeRequested;
    ctx.set_state(State::Disputed).await?;
    ctx.notify(TradeNotif::DisputeStateChanged {
        trade_id: ctx.trade.id,
        dispute_state: DisputeState::DisputeRequested,
    })
    .await;
    Ok(())
}

pub(super) async fn close_dispute(ctx: &mut TradeContext) -> Result<(), EscrowError> {
    info!("Trade w/ TradeUUID {} closing dispute", ctx.trade.id);
    ctx.trade.dispute_state = DisputeState::DisputeClosed;
    ctx.set_state(State::DisputeClosed).await?;
    ctx.notify(TradeNotif::DisputeStateChanged {
        trade_id: ctx.trade.id,
        dispute_state: DisputeState::DisputeClosed,
    })
    .await;
    Ok(())
}

pub(super) async fn complete_trade(ctx: &mut TradeContext) -> Result<(), EscrowError> {
    if !ctx.trade.is_payout_published() {
        return Err(missing(ctx.trade.id, "published payout tx"));
    }
    ctx.set_state(State::Completed).await
}
