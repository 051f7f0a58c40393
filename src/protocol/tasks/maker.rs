use tracing::info;

use super::{contract_and_hash, integrity, missing, security_deposit, unexpected_payload};
use crate::common::error::EscrowError;
use crate::deposit::{required_contribution, DepositTx, DepositTxParams, InputSelection};
use crate::protocol::context::TradeContext;
use crate::protocol::messages::{
    DepositTxSignaturesResponse, InputsForDepositTxResponse, TradePayload,
};
use crate::trade::{is_payment_method_compatible, Contract, DeliveryStates, State};

pub(super) async fn process_inputs_request(ctx: &mut TradeContext) -> Result<(), EscrowError> {
    let trade_id = ctx.trade.id;
    let Some(envelope) = ctx.inbound.clone() else {
        return Err(unexpected_payload(trade_id, "InputsForDepositTxRequest"));
    };
    let TradePayload::InputsForDepositTxRequest(request) = envelope.message.payload else {
        return Err(unexpected_payload(trade_id, "InputsForDepositTxRequest"));
    };

    if envelope.sender_pub_key_ring != request.taker_pub_key_ring {
        return Err(integrity(trade_id, "request not signed by the taker it names"));
    }
    if request.trade_amount != ctx.trade.amount {
        return Err(integrity(
            trade_id,
            format!(
                "requested amount {} differs from trade amount {}",
                request.trade_amount, ctx.trade.amount
            ),
        ));
    }
    if !is_payment_method_compatible(
        &ctx.trade.process_model.payment_method_id,
        &request.taker_payment_method_id,
    ) {
        return Err(integrity(trade_id, "taker payment method not compatible"));
    }

    let taker_is_buyer = !ctx.trade.is_buyer();
    let required = required_contribution(
        taker_is_buyer,
        ctx.trade.amount,
        security_deposit(&ctx.trade, taker_is_buyer),
        ctx.trade.tx_fee,
    )?;
    let taker_selection = InputSelection {
        inputs: request.raw_transaction_inputs.clone(),
        change: request.change_output.clone(),
    };
    let contribution = taker_selection.contribution()?;
    if contribution != required {
        return Err(integrity(
            trade_id,
            format!(
                "taker contributes {} but the deposit needs {}",
                contribution, required
            ),
        ));
    }

    let node_address = envelope.message.sender_node_address;
    ctx.trade.trading_peer_node_address = Some(node_address.clone());
    ctx.trade.process_model.taker_fee_tx_id = Some(request.taker_fee_tx_id);
    ctx.trade.process_model.lock_time = Some(ctx.services.config.lock_time_blocks);

    let peer = &mut ctx.trade.process_model.trading_peer;
    peer.node_address = Some(node_address);
    peer.pub_key_ring = Some(request.taker_pub_key_ring);
    peer.account_id = Some(request.taker_account_id);
    peer.payment_account_payload_hash = Some(request.taker_payment_account_payload_hash);
    peer.payment_method_id = Some(request.taker_payment_method_id);
    peer.taker_fee_tx_id = Some(request.taker_fee_tx_id);
    peer.raw_transaction_inputs = request.raw_transaction_inputs;
    peer.change_output = request.change_output;
    peer.multisig_pub_key = Some(request.taker_multisig_pub_key);
    peer.payout_address = Some(request.taker_payout_address);

    ctx.set_state(State::InputsForDepositTxRequestReceived).await
}

pub(super) async fn create_and_sign_contract(ctx: &mut TradeContext) -> Result<(), EscrowError> {
    let contract = Contract::from_trade(&ctx.trade, &ctx.my_node_address(), &ctx.my_pub_key_ring())?;
    let hash = contract.hash()?;
    let signature = Contract::sign(&hash, &ctx.services.key_ring)?;

    ctx.trade.set_contract(contract, hash)?;
    ctx.trade.maker_contract_signature = Some(signature);
    info!(
        "Trade w/ TradeUUID {} contract {} signed",
        ctx.trade.id,
        hex::encode(hash)
    );
    ctx.checkpoint()
}

pub(super) async fn send_inputs_for_deposit_tx_response(
    ctx: &mut TradeContext,
) -> Result<(), EscrowError> {
    let trade_id = ctx.trade.id;
    let (contract, contract_hash) = contract_and_hash(&ctx.trade)?;
    let process_model = &ctx.trade.process_model;
    let response = InputsForDepositTxResponse {
        maker_account_id: process_model.account_id.clone(),
        maker_payment_account_payload_hash: process_model.payment_account_payload_hash,
        maker_payment_method_id: process_model.payment_method_id.clone(),
        raw_transaction_inputs: process_model.raw_transaction_inputs.clone(),
        change_output: process_model.change_output.clone(),
        maker_multisig_pub_key: contract.maker_multisig_pub_key,
        maker_payout_address: contract.maker_payout_address.clone(),
        lock_time: contract.lock_time,
        contract_hash,
        maker_contract_signature: ctx
            .trade
            .maker_contract_signature
            .clone()
            .ok_or_else(|| missing(trade_id, "maker contract signature"))?,
    };

    let delivery_states = DeliveryStates {
        sent: Some(State::DepositInputsExchanged),
        ..Default::default()
    };
    ctx.send_and_await(
        TradePayload::InputsForDepositTxResponse(response),
        delivery_states,
    )
    .await
}

/// Rebuilds the deposit tx from our own view of the trade and only accepts the taker's version
/// if it is identical.
pub(super) async fn process_deposit_tx_signing_request(
    ctx: &mut TradeContext,
) -> Result<(), EscrowError> {
    let trade_id = ctx.trade.id;
    let TradePayload::DepositTxSigningRequest(request) = ctx.inbound_payload()?.clone() else {
        return Err(unexpected_payload(trade_id, "DepositTxSigningRequest"));
    };
    let (contract, contract_hash) = contract_and_hash(&ctx.trade)?;

    let taker_pub_key_ring = ctx
        .trade
        .process_model
        .trading_peer
        .pub_key_ring
        .ok_or_else(|| missing(trade_id, "taker pub key ring"))?;
    Contract::verify_signature(
        &contract_hash,
        &request.taker_contract_signature,
        &taker_pub_key_ring,
    )
    .map_err(|error| integrity(trade_id, format!("taker contract signature - {}", error)))?;

    let process_model = &ctx.trade.process_model;
    let expected = DepositTx::build(DepositTxParams {
        trade_amount: contract.trade_amount,
        buyer_security_deposit: contract.buyer_security_deposit,
        seller_security_deposit: contract.seller_security_deposit,
        tx_fee: contract.tx_fee,
        taker_is_buyer: !ctx.trade.is_buyer(),
        taker_inputs: &process_model.trading_peer.raw_transaction_inputs,
        taker_change: process_model.trading_peer.change_output.as_ref(),
        maker_inputs: &process_model.raw_transaction_inputs,
        maker_change: process_model.change_output.as_ref(),
        buyer_multisig_pub_key: contract.buyer_multisig_pub_key(),
        seller_multisig_pub_key: contract.seller_multisig_pub_key(),
        lock_time: contract.lock_time,
    })?;
    request.deposit_tx.verify_amounts(
        contract.buyer_security_deposit,
        contract.seller_security_deposit,
        contract.trade_amount,
        contract.tx_fee,
    )?;
    if expected != request.deposit_tx {
        return Err(integrity(trade_id, "deposit tx differs from the agreed one"));
    }

    ctx.trade.taker_contract_signature = Some(request.taker_contract_signature.clone());
    ctx.trade.process_model.trading_peer.contract_signature = Some(request.taker_contract_signature);
    ctx.trade.process_model.prepared_deposit_tx = Some(request.deposit_tx);
    ctx.checkpoint()
}

pub(super) async fn send_deposit_tx_signatures(ctx: &mut TradeContext) -> Result<(), EscrowError> {
    let (_, contract_hash) = contract_and_hash(&ctx.trade)?;
    let process_model = &ctx.trade.process_model;
    let response = DepositTxSignaturesResponse {
        contract_hash,
        maker_input_signatures: process_model.deposit_input_signatures.clone(),
        warning_tx_signature: process_model.warning_tx_signature.clone(),
        redirect_tx_signature: process_model.redirect_tx_signature.clone(),
    };

    let delivery_states = DeliveryStates {
        sent: Some(State::DepositTxSigned),
        ..Default::default()
    };
    ctx.send_and_await(
        TradePayload::DepositTxSignaturesResponse(response),
        delivery_states,
    )
    .await
}

pub(super) async fn process_deposit_tx_published(
    ctx: &mut TradeContext,
) -> Result<(), EscrowError> {
    let trade_id = ctx.trade.id;
    let TradePayload::DepositTxPublished(published) = ctx.inbound_payload()?.clone() else {
        return Err(unexpected_payload(trade_id, "DepositTxPublished"));
    };

    let prepared = ctx
        .trade
        .process_model
        .prepared_deposit_tx
        .as_ref()
        .ok_or_else(|| missing(trade_id, "prepared deposit tx"))?;
    if &published.deposit_tx.tx != prepared {
        return Err(integrity(trade_id, "published deposit tx is not the one we signed"));
    }
    published.deposit_tx.verify_complete()?;
    let txid = published.deposit_tx.txid()?;
    info!(
        "Trade w/ TradeUUID {} peer published deposit tx {}",
        trade_id, txid
    );

    ctx.trade.deposit_tx_id = Some(txid);
    ctx.trade.process_model.deposit_tx = Some(published.deposit_tx);
    ctx.set_state(State::DepositTxPublishedReceived).await
}
