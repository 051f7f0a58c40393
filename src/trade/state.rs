use serde::{Deserialize, Serialize};
use strum_macros::{Display, IntoStaticStr};

/// Coarse progress of a trade. Phases only move forward.
#[derive(
    Clone,
    Copy,
    Debug,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Serialize,
    Deserialize,
    Display,
    IntoStaticStr,
)]
pub enum Phase {
    Init,
    FeePaid,
    DepositInputsExchanged,
    DepositSigned,
    DepositPublished,
    DepositConfirmed,
    PaymentStarted,
    PaymentReceived,
    PayoutSigned,
    PayoutPublished,
    Disputed,
    Closed,
    Failed,
}

#[derive(
    Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize, Display, IntoStaticStr,
)]
pub enum State {
    OfferTaken,

    TakerFeePaid,
    InputsForDepositTxRequestSent,
    InputsForDepositTxRequestReceived,

    DepositInputsExchanged,

    DepositTxSigned,

    DepositTxPublished,
    DepositTxPublishedMsgSent,
    DepositTxPublishedArrived,
    DepositTxPublishedStoredInMailbox,
    DepositTxPublishedSendFailed,
    DepositTxPublishedReceived,

    DepositConfirmed,

    PaymentStarted,
    PaymentStartedMsgSent,
    PaymentStartedArrived,
    PaymentStartedStoredInMailbox,
    PaymentStartedSendFailed,
    PaymentStartedReceived,

    PaymentReceived,

    PayoutSigned,

    PayoutPublished,
    PayoutPublishedMsgSent,
    PayoutPublishedArrived,
    PayoutPublishedStoredInMailbox,
    PayoutPublishedSendFailed,
    PayoutPublishedReceived,

    Disputed,

    Completed,
    DisputeClosed,

    Failed,
}

impl State {
    pub fn phase(&self) -> Phase {
        match self {
            State::OfferTaken => Phase::Init,

            State::TakerFeePaid
            | State::InputsForDepositTxRequestSent
            | State::InputsForDepositTxRequestReceived => Phase::FeePaid,

            State::DepositInputsExchanged => Phase::DepositInputsExchanged,

            State::DepositTxSigned => Phase::DepositSigned,

            State::DepositTxPublished
            | State::DepositTxPublishedMsgSent
            | State::DepositTxPublishedArrived
            | State::DepositTxPublishedStoredInMailbox
            | State::DepositTxPublishedSendFailed
            | State::DepositTxPublishedReceived => Phase::DepositPublished,

            State::DepositConfirmed => Phase::DepositConfirmed,

            State::PaymentStarted
            | State::PaymentStartedMsgSent
            | State::PaymentStartedArrived
            | State::PaymentStartedStoredInMailbox
            | State::PaymentStartedSendFailed
            | State::PaymentStartedReceived => Phase::PaymentStarted,

            State::PaymentReceived => Phase::PaymentReceived,

            State::PayoutSigned => Phase::PayoutSigned,

            State::PayoutPublished
            | State::PayoutPublishedMsgSent
            | State::PayoutPublishedArrived
            | State::PayoutPublishedStoredInMailbox
            | State::PayoutPublishedSendFailed
            | State::PayoutPublishedReceived => Phase::PayoutPublished,

            State::Disputed => Phase::Disputed,

            State::Completed | State::DisputeClosed => Phase::Closed,

            State::Failed => Phase::Failed,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, State::Completed | State::DisputeClosed | State::Failed)
    }
}

#[derive(
    Clone,
    Copy,
    Debug,
    Default,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    Display,
    IntoStaticStr,
)]
pub enum DisputeState {
    #[default]
    NoDispute,
    DisputeRequested,
    DisputeStartedByPeer,
    DisputeClosed,
    MediationRequested,
    MediationStartedByPeer,
    MediationClosed,
    RefundRequested,
    RefundRequestStartedByPeer,
    RefundRequestClosed,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn phases_are_ordered() {
        assert!(Phase::Init < Phase::FeePaid);
        assert!(Phase::DepositPublished < Phase::DepositConfirmed);
        assert!(Phase::PayoutPublished < Phase::Closed);
        assert!(Phase::Closed < Phase::Failed);
    }

    #[test]
    fn message_states_share_phase() {
        assert_eq!(
            State::DepositTxPublishedSendFailed.phase(),
            State::DepositTxPublishedArrived.phase()
        );
        assert_eq!(State::PaymentStartedReceived.phase(), Phase::PaymentStarted);
    }

    #[test]
    fn terminal_states() {
        assert!(State::Completed.is_terminal());
        assert!(State::DisputeClosed.is_terminal());
        assert!(State::Failed.is_terminal());
        assert!(!State::Disputed.is_terminal());
    }
}
