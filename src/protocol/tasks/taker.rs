use tracing::{info, warn};

use super::{contract_and_hash, integrity, missing, security_deposit, unexpected_payload};
use crate::common::error::EscrowError;
use crate::deposit::{
    redirect_sighash, required_contribution, verify_input_signatures, warning_sighash, DepositTx,
    DepositTxParams, InputSelection, SignedDepositTx, Transaction,
};
use crate::common::crypto;
use crate::protocol::context::TradeContext;
use crate::protocol::messages::{
    DepositTxPublished, DepositTxSigningRequest, InputsForDepositTxRequest, TradePayload,
    WARNING_TX_VERSION,
};
use crate::trade::{is_payment_method_compatible, Contract, DeliveryStates, Phase, State};

pub(super) async fn publish_fee_tx(ctx: &mut TradeContext) -> Result<(), EscrowError> {
    let trade_id = ctx.trade.id;
    if ctx.trade.process_model.taker_fee_tx_id.is_none() {
        let txid = ctx
            .services
            .wallet
            .publish_taker_fee_tx(trade_id, ctx.trade.offer.taker_fee)
            .await?;
        info!("Trade w/ TradeUUID {} taker fee tx {} published", trade_id, txid);
        ctx.trade.process_model.taker_fee_tx_id = Some(txid);
    }

    let peer = &mut ctx.trade.process_model.trading_peer;
    if peer.node_address.is_none() {
        peer.node_address = Some(ctx.trade.offer.maker_node_address.clone());
    }
    if peer.pub_key_ring.is_none() {
        peer.pub_key_ring = Some(ctx.trade.offer.maker_pub_key_ring);
    }
    ctx.trade.trading_peer_node_address = Some(ctx.trade.offer.maker_node_address.clone());
    ctx.set_state(State::TakerFeePaid).await
}

pub(super) async fn send_inputs_for_deposit_tx_request(
    ctx: &mut TradeContext,
) -> Result<(), EscrowError> {
    let trade_id = ctx.trade.id;
    let process_model = &ctx.trade.process_model;
    let request = InputsForDepositTxRequest {
        taker_pub_key_ring: ctx.my_pub_key_ring(),
        taker_account_id: process_model.account_id.clone(),
        taker_payment_account_payload_hash: process_model.payment_account_payload_hash,
        taker_payment_method_id: process_model.payment_method_id.clone(),
        trade_amount: ctx.trade.amount,
        taker_fee_tx_id: process_model
            .taker_fee_tx_id
            .ok_or_else(|| missing(trade_id, "taker fee tx"))?,
        raw_transaction_inputs: process_model.raw_transaction_inputs.clone(),
        change_output: process_model.change_output.clone(),
        taker_multisig_pub_key: process_model
            .my_multisig_pub_key
            .ok_or_else(|| missing(trade_id, "own multisig key"))?,
        taker_payout_address: process_model
            .payout_address
            .clone()
            .ok_or_else(|| missing(trade_id, "own payout address"))?,
    };

    let delivery_states = DeliveryStates {
        sent: Some(State::InputsForDepositTxRequestSent),
        ..Default::default()
    };
    ctx.send_and_await(
        TradePayload::InputsForDepositTxRequest(request),
        delivery_states,
    )
    .await
}

pub(super) async fn process_inputs_response(ctx: &mut TradeContext) -> Result<(), EscrowError> {
    let trade_id = ctx.trade.id;
    let TradePayload::InputsForDepositTxResponse(response) = ctx.inbound_payload()?.clone() else {
        return Err(unexpected_payload(trade_id, "InputsForDepositTxResponse"));
    };

    let maker_is_buyer = !ctx.trade.is_buyer();
    let required = required_contribution(
        maker_is_buyer,
        ctx.trade.amount,
        security_deposit(&ctx.trade, maker_is_buyer),
        ctx.trade.tx_fee,
    )?;
    let maker_selection = InputSelection {
        inputs: response.raw_transaction_inputs.clone(),
        change: response.change_output.clone(),
    };
    let contribution = maker_selection.contribution()?;
    if contribution != required {
        return Err(integrity(
            trade_id,
            format!(
                "maker contributes {} but the deposit needs {}",
                contribution, required
            ),
        ));
    }
    if !is_payment_method_compatible(
        &response.maker_payment_method_id,
        &ctx.trade.process_model.payment_method_id,
    ) {
        return Err(integrity(trade_id, "maker payment method not compatible"));
    }

    ctx.trade.process_model.lock_time = Some(response.lock_time);
    let peer = &mut ctx.trade.process_model.trading_peer;
    peer.account_id = Some(response.maker_account_id);
    peer.payment_account_payload_hash = Some(response.maker_payment_account_payload_hash);
    peer.payment_method_id = Some(response.maker_payment_method_id);
    peer.raw_transaction_inputs = response.raw_transaction_inputs;
    peer.change_output = response.change_output;
    peer.multisig_pub_key = Some(response.maker_multisig_pub_key);
    peer.payout_address = Some(response.maker_payout_address);
    peer.contract_signature = Some(response.maker_contract_signature);
    ctx.checkpoint()
}

/// Builds the contract on our side. Its hash must equal the one the maker signed.
pub(super) async fn verify_and_sign_contract(ctx: &mut TradeContext) -> Result<(), EscrowError> {
    let trade_id = ctx.trade.id;
    let TradePayload::InputsForDepositTxResponse(response) = ctx.inbound_payload()? else {
        return Err(unexpected_payload(trade_id, "InputsForDepositTxResponse"));
    };
    let received_hash = response.contract_hash;

    let contract = Contract::from_trade(&ctx.trade, &ctx.my_node_address(), &ctx.my_pub_key_ring())?;
    let hash = contract.hash()?;
    if hash != received_hash {
        return Err(EscrowError::ContractHashMismatch {
            expected: hex::encode(hash),
            received: hex::encode(received_hash),
        });
    }

    let maker_signature = ctx
        .trade
        .process_model
        .trading_peer
        .contract_signature
        .clone()
        .ok_or_else(|| missing(trade_id, "maker contract signature"))?;
    Contract::verify_signature(&hash, &maker_signature, &contract.maker_pub_key_ring)
        .map_err(|error| integrity(trade_id, format!("maker contract signature - {}", error)))?;
    let taker_signature = Contract::sign(&hash, &ctx.services.key_ring)?;

    ctx.trade.set_contract(contract, hash)?;
    ctx.trade.maker_contract_signature = Some(maker_signature);
    ctx.trade.taker_contract_signature = Some(taker_signature);
    ctx.set_state(State::DepositInputsExchanged).await
}

pub(super) async fn create_unsigned_deposit_tx(ctx: &mut TradeContext) -> Result<(), EscrowError> {
    let (contract, _) = contract_and_hash(&ctx.trade)?;
    let process_model = &ctx.trade.process_model;
    let tx = DepositTx::build(DepositTxParams {
        trade_amount: contract.trade_amount,
        buyer_security_deposit: contract.buyer_security_deposit,
        seller_security_deposit: contract.seller_security_deposit,
        tx_fee: contract.tx_fee,
        taker_is_buyer: ctx.trade.is_buyer(),
        taker_inputs: &process_model.raw_transaction_inputs,
        taker_change: process_model.change_output.as_ref(),
        maker_inputs: &process_model.trading_peer.raw_transaction_inputs,
        maker_change: process_model.trading_peer.change_output.as_ref(),
        buyer_multisig_pub_key: contract.buyer_multisig_pub_key(),
        seller_multisig_pub_key: contract.seller_multisig_pub_key(),
        lock_time: contract.lock_time,
    })?;

    ctx.trade.process_model.prepared_deposit_tx = Some(tx);
    ctx.checkpoint()
}

pub(super) async fn send_deposit_tx_for_signing(ctx: &mut TradeContext) -> Result<(), EscrowError> {
    let trade_id = ctx.trade.id;
    let (_, contract_hash) = contract_and_hash(&ctx.trade)?;
    let request = DepositTxSigningRequest {
        contract_hash,
        taker_contract_signature: ctx
            .trade
            .taker_contract_signature
            .clone()
            .ok_or_else(|| missing(trade_id, "taker contract signature"))?,
        deposit_tx: ctx
            .trade
            .process_model
            .prepared_deposit_tx
            .clone()
            .ok_or_else(|| missing(trade_id, "prepared deposit tx"))?,
    };
    ctx.send_and_await(
        TradePayload::DepositTxSigningRequest(request),
        DeliveryStates::default(),
    )
    .await
}

/// Checks the maker's input signatures, plus the warning and redirect signatures from protocol
/// version 5 on.
pub(super) async fn process_deposit_tx_signatures(
    ctx: &mut TradeContext,
) -> Result<(), EscrowError> {
    let trade_id = ctx.trade.id;
    let TradePayload::DepositTxSignaturesResponse(response) = ctx.inbound_payload()?.clone()
    else {
        return Err(unexpected_payload(trade_id, "DepositTxSignaturesResponse"));
    };

    let process_model = &ctx.trade.process_model;
    let tx = process_model
        .prepared_deposit_tx
        .as_ref()
        .ok_or_else(|| missing(trade_id, "prepared deposit tx"))?;
    verify_input_signatures(
        tx,
        &process_model.trading_peer.raw_transaction_inputs,
        &response.maker_input_signatures,
    )?;

    let mut warning_signatures = None;
    if ctx.trade.offer.protocol_version >= WARNING_TX_VERSION {
        let maker_key = process_model
            .trading_peer
            .multisig_pub_key
            .ok_or_else(|| missing(trade_id, "maker multisig key"))?;
        let (Some(warning), Some(redirect)) = (
            response.warning_tx_signature.clone(),
            response.redirect_tx_signature.clone(),
        ) else {
            return Err(integrity(trade_id, "warning or redirect signature missing"));
        };
        let txid = tx.txid()?;
        crypto::verify_hash_signature(&maker_key, &warning_sighash(&txid), &warning)?;
        crypto::verify_hash_signature(&maker_key, &redirect_sighash(&txid), &redirect)?;
        warning_signatures = Some((warning, redirect));
    }

    let peer = &mut ctx.trade.process_model.trading_peer;
    peer.deposit_input_signatures = response.maker_input_signatures;
    if let Some((warning, redirect)) = warning_signatures {
        peer.warning_tx_signature = Some(warning);
        peer.redirect_tx_signature = Some(redirect);
    }
    ctx.checkpoint()
}

pub(super) async fn finalize_deposit_tx(ctx: &mut TradeContext) -> Result<(), EscrowError> {
    let trade_id = ctx.trade.id;
    let process_model = &ctx.trade.process_model;
    let tx = process_model
        .prepared_deposit_tx
        .clone()
        .ok_or_else(|| missing(trade_id, "prepared deposit tx"))?;
    let signed = SignedDepositTx::finalize(
        tx,
        &process_model.deposit_input_signatures,
        &process_model.trading_peer.deposit_input_signatures,
    )?;

    ctx.trade.process_model.deposit_tx = Some(signed);
    ctx.set_state(State::DepositTxSigned).await
}

/// Broadcasts the signed deposit tx unless the wallet already knows it.
pub(super) async fn publish_deposit_tx(ctx: &mut TradeContext) -> Result<(), EscrowError> {
    let trade_id = ctx.trade.id;
    let signed = ctx
        .trade
        .process_model
        .deposit_tx
        .clone()
        .ok_or_else(|| missing(trade_id, "signed deposit tx"))?;
    let txid = signed.txid()?;

    let wallet = ctx.services.wallet.clone();
    if wallet.is_tx_known(&txid).await? {
        warn!(
            "Trade w/ TradeUUID {} deposit tx {} already known, not broadcasting again",
            trade_id, txid
        );
    } else {
        let broadcast_txid = wallet.broadcast(&Transaction::Deposit(signed)).await?;
        if broadcast_txid != txid {
            return Err(integrity(
                trade_id,
                format!("broadcast returned txid {} for {}", broadcast_txid, txid),
            ));
        }
        info!("Trade w/ TradeUUID {} deposit tx {} published", trade_id, txid);
    }

    ctx.trade.deposit_tx_id = Some(txid);
    if ctx.trade.state().phase() < Phase::DepositPublished {
        ctx.set_state(State::DepositTxPublished).await
    } else {
        ctx.checkpoint()
    }
}

pub(super) async fn send_deposit_tx_published_message(
    ctx: &mut TradeContext,
) -> Result<(), EscrowError> {
    let trade_id = ctx.trade.id;
    let (_, contract_hash) = contract_and_hash(&ctx.trade)?;
    let published = DepositTxPublished {
        contract_hash,
        deposit_tx: ctx
            .trade
            .process_model
            .deposit_tx
            .clone()
            .ok_or_else(|| missing(trade_id, "signed deposit tx"))?,
    };
    let delivery_states = DeliveryStates {
        sent: Some(State::DepositTxPublishedMsgSent),
        arrived: Some(State::DepositTxPublishedArrived),
        stored_in_mailbox: Some(State::DepositTxPublishedStoredInMailbox),
        send_failed: Some(State::DepositTxPublishedSendFailed),
    };
    ctx.send_and_await(TradePayload::DepositTxPublished(published), delivery_states)
        .await
}
