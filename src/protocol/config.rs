use strum_macros::{Display, IntoStaticStr};

use super::tasks::TradeTask;
use crate::common::types::Role;
use crate::trade::Phase;

/// What starts a pipeline: a user request, a peer message or a chain event.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Display, IntoStaticStr)]
pub enum Trigger {
    TakeOffer,
    InputsForDepositTxRequest,
    InputsForDepositTxResponse,
    DepositTxSigningRequest,
    DepositTxSignaturesResponse,
    DepositTxPublished,
    ResendDepositTxPublished,
    DepositConfirmed,
    PaymentStarted,
    PaymentStartedMessage,
    ResendPaymentStarted,
    PaymentReceived,
    PaymentProofConfirmed,
    PayoutTxPublished,
    ResendPayoutTxPublished,
    OpenDispute,
    CloseDispute,
}

pub struct ProtocolStep {
    pub trigger: Trigger,
    pub expected_phases: &'static [Phase],
    pub tasks: &'static [TradeTask],
}

impl ProtocolStep {
    pub fn is_expected(&self, phase: Phase) -> bool {
        self.expected_phases.contains(&phase)
    }
}

const DISPUTABLE_PHASES: &[Phase] = &[
    Phase::DepositPublished,
    Phase::DepositConfirmed,
    Phase::PaymentStarted,
    Phase::PaymentReceived,
    Phase::PayoutSigned,
    Phase::PayoutPublished,
];

static TAKER_STEPS: &[ProtocolStep] = &[
    ProtocolStep {
        trigger: Trigger::TakeOffer,
        expected_phases: &[Phase::Init],
        tasks: &[
            TradeTask::TakerPublishFeeTx,
            TradeTask::SelectInputsAndChange,
            TradeTask::TakerSendInputsForDepositTxRequest,
        ],
    },
    ProtocolStep {
        trigger: Trigger::InputsForDepositTxResponse,
        expected_phases: &[Phase::FeePaid],
        tasks: &[
            TradeTask::TakerProcessInputsResponse,
            TradeTask::TakerVerifyAndSignContract,
            TradeTask::TakerCreateUnsignedDepositTx,
            TradeTask::TakerSendDepositTxForSigning,
        ],
    },
    ProtocolStep {
        trigger: Trigger::DepositTxSignaturesResponse,
        expected_phases: &[Phase::DepositInputsExchanged],
        tasks: &[
            TradeTask::TakerProcessDepositTxSignatures,
            TradeTask::SignOwnDepositInputs,
            TradeTask::TakerFinalizeDepositTx,
            TradeTask::PublishDepositTx,
            TradeTask::SendDepositTxPublishedMessage,
        ],
    },
    ProtocolStep {
        trigger: Trigger::ResendDepositTxPublished,
        expected_phases: &[Phase::DepositPublished],
        tasks: &[
            TradeTask::PublishDepositTx,
            TradeTask::SendDepositTxPublishedMessage,
        ],
    },
];

static MAKER_STEPS: &[ProtocolStep] = &[
    ProtocolStep {
        trigger: Trigger::InputsForDepositTxRequest,
        expected_phases: &[Phase::Init],
        tasks: &[
            TradeTask::MakerProcessInputsRequest,
            TradeTask::SelectInputsAndChange,
            TradeTask::MakerCreateAndSignContract,
            TradeTask::MakerSendInputsForDepositTxResponse,
        ],
    },
    ProtocolStep {
        trigger: Trigger::DepositTxSigningRequest,
        expected_phases: &[Phase::DepositInputsExchanged],
        tasks: &[
            TradeTask::MakerProcessDepositTxSigningRequest,
            TradeTask::SignOwnDepositInputs,
            TradeTask::MakerSendDepositTxSignatures,
        ],
    },
    ProtocolStep {
        trigger: Trigger::DepositTxPublished,
        expected_phases: &[Phase::DepositSigned],
        tasks: &[TradeTask::MakerProcessDepositTxPublished],
    },
];

static BUYER_STEPS: &[ProtocolStep] = &[
    ProtocolStep {
        trigger: Trigger::PaymentStarted,
        expected_phases: &[Phase::DepositConfirmed],
        tasks: &[
            TradeTask::BuyerSignPayoutTx,
            TradeTask::BuyerSendPaymentStartedMessage,
        ],
    },
    ProtocolStep {
        trigger: Trigger::ResendPaymentStarted,
        expected_phases: &[Phase::PaymentStarted],
        tasks: &[TradeTask::BuyerSendPaymentStartedMessage],
    },
    ProtocolStep {
        trigger: Trigger::PayoutTxPublished,
        expected_phases: &[Phase::PaymentStarted],
        tasks: &[TradeTask::BuyerProcessPayoutTxPublished],
    },
];

static SELLER_STEPS: &[ProtocolStep] = &[
    ProtocolStep {
        trigger: Trigger::PaymentStartedMessage,
        expected_phases: &[Phase::DepositPublished, Phase::DepositConfirmed],
        tasks: &[TradeTask::SellerProcessPaymentStarted],
    },
    ProtocolStep {
        trigger: Trigger::PaymentReceived,
        expected_phases: &[Phase::PaymentStarted],
        tasks: &[
            TradeTask::SellerSignAndFinalizePayoutTx,
            TradeTask::SellerPublishPayoutTx,
            TradeTask::SellerSendPayoutTxPublishedMessage,
            TradeTask::CompleteTrade,
        ],
    },
    ProtocolStep {
        trigger: Trigger::PaymentProofConfirmed,
        expected_phases: &[Phase::PaymentStarted],
        tasks: &[
            TradeTask::SellerSignAndFinalizePayoutTx,
            TradeTask::SellerPublishPayoutTx,
            TradeTask::SellerSendPayoutTxPublishedMessage,
            TradeTask::CompleteTrade,
        ],
    },
    ProtocolStep {
        trigger: Trigger::ResendPayoutTxPublished,
        expected_phases: &[Phase::PayoutPublished],
        tasks: &[
            TradeTask::SellerPublishPayoutTx,
            TradeTask::SellerSendPayoutTxPublishedMessage,
            TradeTask::CompleteTrade,
        ],
    },
];

static COMMON_STEPS: &[ProtocolStep] = &[
    ProtocolStep {
        trigger: Trigger::DepositConfirmed,
        expected_phases: &[Phase::DepositPublished],
        tasks: &[TradeTask::SetDepositConfirmed],
    },
    ProtocolStep {
        trigger: Trigger::OpenDispute,
        expected_phases: DISPUTABLE_PHASES,
        tasks: &[TradeTask::OpenDispute],
    },
    ProtocolStep {
        trigger: Trigger::CloseDispute,
        expected_phases: &[Phase::Disputed],
        tasks: &[TradeTask::CloseDispute],
    },
];

/// Looks up the step a role runs for `trigger`. Maker/taker steps come first, then buyer/seller
/// steps, then the steps common to all roles.
pub fn step_for(role: Role, trigger: Trigger) -> Option<&'static ProtocolStep> {
    let side_steps = if role.is_maker() {
        MAKER_STEPS
    } else {
        TAKER_STEPS
    };
    let direction_steps = if role.is_buyer() {
        BUYER_STEPS
    } else {
        SELLER_STEPS
    };
    side_steps
        .iter()
        .chain(direction_steps.iter())
        .chain(COMMON_STEPS.iter())
        .find(|step| step.trigger == trigger)
}
