mod buyer;
mod maker;
mod seller;
mod shared;
mod taker;

use async_trait::async_trait;
use strum_macros::{Display, IntoStaticStr};
use uuid::Uuid;

use super::context::TradeContext;
use crate::common::{error::EscrowError, types::Coin};
use crate::task::Task;
use crate::trade::{Contract, Trade};

/// Every unit of protocol work. Which ones run for a trigger is decided by the step tables.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Display, IntoStaticStr)]
pub enum TradeTask {
    // Taker
    TakerPublishFeeTx,
    TakerSendInputsForDepositTxRequest,
    TakerProcessInputsResponse,
    TakerVerifyAndSignContract,
    TakerCreateUnsignedDepositTx,
    TakerSendDepositTxForSigning,
    TakerProcessDepositTxSignatures,
    TakerFinalizeDepositTx,
    PublishDepositTx,
    SendDepositTxPublishedMessage,

    // Maker
    MakerProcessInputsRequest,
    MakerCreateAndSignContract,
    MakerSendInputsForDepositTxResponse,
    MakerProcessDepositTxSigningRequest,
    MakerSendDepositTxSignatures,
    MakerProcessDepositTxPublished,

    // Both sides of the deposit
    SelectInputsAndChange,
    SignOwnDepositInputs,

    // Buyer
    BuyerSignPayoutTx,
    BuyerSendPaymentStartedMessage,
    BuyerProcessPayoutTxPublished,

    // Seller
    SellerProcessPaymentStarted,
    SellerSignAndFinalizePayoutTx,
    SellerPublishPayoutTx,
    SellerSendPayoutTxPublishedMessage,

    // Common
    SetDepositConfirmed,
    OpenDispute,
    CloseDispute,
    CompleteTrade,
}

#[async_trait]
impl Task<TradeContext> for TradeTask {
    fn name(&self) -> &'static str {
        self.into()
    }

    async fn run(&self, ctx: &mut TradeContext) -> Result<(), EscrowError> {
        match self {
            TradeTask::TakerPublishFeeTx => taker::publish_fee_tx(ctx).await,
            TradeTask::TakerSendInputsForDepositTxRequest => {
                taker::send_inputs_for_deposit_tx_request(ctx).await
            }
            TradeTask::TakerProcessInputsResponse => taker::process_inputs_response(ctx).await,
            TradeTask::TakerVerifyAndSignContract => taker::verify_and_sign_contract(ctx).await,
            TradeTask::TakerCreateUnsignedDepositTx => {
                taker::create_unsigned_deposit_tx(ctx).await
            }
            TradeTask::TakerSendDepositTxForSigning => {
                taker::send_deposit_tx_for_signing(ctx).await
            }
            TradeTask::TakerProcessDepositTxSignatures => {
                taker::process_deposit_tx_signatures(ctx).await
            }
            TradeTask::TakerFinalizeDepositTx => taker::finalize_deposit_tx(ctx).await,
            TradeTask::PublishDepositTx => taker::publish_deposit_tx(ctx).await,
            TradeTask::SendDepositTxPublishedMessage => {
                taker::send_deposit_tx_published_message(ctx).await
            }

            TradeTask::MakerProcessInputsRequest => maker::process_inputs_request(ctx).await,
            TradeTask::MakerCreateAndSignContract => maker::create_and_sign_contract(ctx).await,
            TradeTask::MakerSendInputsForDepositTxResponse => {
                maker::send_inputs_for_deposit_tx_response(ctx).await
            }
            TradeTask::MakerProcessDepositTxSigningRequest => {
                maker::process_deposit_tx_signing_request(ctx).await
            }
            TradeTask::MakerSendDepositTxSignatures => {
                maker::send_deposit_tx_signatures(ctx).await
            }
            TradeTask::MakerProcessDepositTxPublished => {
                maker::process_deposit_tx_published(ctx).await
            }

            TradeTask::SelectInputsAndChange => shared::select_inputs_and_change(ctx).await,
            TradeTask::SignOwnDepositInputs => shared::sign_own_deposit_inputs(ctx).await,

            TradeTask::BuyerSignPayoutTx => buyer::sign_payout_tx(ctx).await,
            TradeTask::BuyerSendPaymentStartedMessage => {
                buyer::send_payment_started_message(ctx).await
            }
            TradeTask::BuyerProcessPayoutTxPublished => {
                buyer::process_payout_tx_published(ctx).await
            }

            TradeTask::SellerProcessPaymentStarted => seller::process_payment_started(ctx).await,
            TradeTask::SellerSignAndFinalizePayoutTx => {
                seller::sign_and_finalize_payout_tx(ctx).await
            }
            TradeTask::SellerPublishPayoutTx => seller::publish_payout_tx(ctx).await,
            TradeTask::SellerSendPayoutTxPublishedMessage => {
                seller::send_payout_tx_published_message(ctx).await
            }

            TradeTask::SetDepositConfirmed => shared::set_deposit_confirmed(ctx).await,
            TradeTask::OpenDispute => shared::open_dispute(ctx).await,
            TradeTask::CloseDispute => shared::close_dispute(ctx).await,
            TradeTask::CompleteTrade => shared::complete_trade(ctx).await,
        }
    }
}

fn integrity(trade_id: Uuid, detail: impl AsRef<str>) -> EscrowError {
    EscrowError::DataIntegrity(format!(
        "Trade w/ TradeUUID {} - {}",
        trade_id,
        detail.as_ref()
    ))
}

fn missing(trade_id: Uuid, what: &str) -> EscrowError {
    EscrowError::Simple(format!("Trade w/ TradeUUID {} has no {}", trade_id, what))
}

fn unexpected_payload(trade_id: Uuid, expected: &str) -> EscrowError {
    EscrowError::Simple(format!(
        "Trade w/ TradeUUID {} expected inbound {}",
        trade_id, expected
    ))
}

fn security_deposit(trade: &Trade, of_buyer: bool) -> Coin {
    if of_buyer {
        trade.buyer_security_deposit
    } else {
        trade.seller_security_deposit
    }
}

fn contract_and_hash(trade: &Trade) -> Result<(Contract, [u8; 32]), EscrowError> {
    match (trade.contract(), trade.contract_hash()) {
        (Some(contract), Some(hash)) => Ok((contract.clone(), hash)),
        _ => Err(missing(trade.id, "contract")),
    }
}
