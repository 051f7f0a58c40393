use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use strum_macros::{Display, IntoStaticStr};
use tokio::{
    select,
    sync::{mpsc, oneshot},
    time::Instant,
};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::config::{step_for, Trigger};
use super::context::{ProtocolServices, TradeContext};
use super::messages::{Ack, TradePayload};
use crate::common::{
    error::EscrowError,
    types::{MessageState, PubKeyRing},
};
use crate::comms::{CommsAccess, PeerEnvelope};
use crate::task::{TaskFailure, TaskRunner};
use crate::trade::{DisputeState, State, Trade, TradeData};

/// Progress reports of a trade, delivered to whoever registered for them.
#[derive(Clone, Debug, PartialEq)]
pub enum TradeNotif {
    StateChanged { trade_id: Uuid, state: State },
    DisputeStateChanged {
        trade_id: Uuid,
        dispute_state: DisputeState,
    },
    Error { trade_id: Uuid, message: String },
}

#[derive(Clone)]
pub struct TradeAccess {
    tx: mpsc::Sender<TradeRequest>,
}

impl TradeAccess {
    fn new(tx: mpsc::Sender<TradeRequest>) -> Self {
        Self { tx }
    }

    async fn trigger(&self, trigger: Trigger) -> Result<(), EscrowError> {
        let (rsp_tx, rsp_rx) = oneshot::channel::<Result<(), EscrowError>>();
        let request = TradeRequest::Trigger { trigger, rsp_tx };
        self.tx.send(request).await?;
        rsp_rx.await?
    }

    pub async fn take_offer(&self) -> Result<(), EscrowError> {
        self.trigger(Trigger::TakeOffer).await
    }

    /// Buyer side: the counter currency payment was sent.
    pub async fn payment_started(&self) -> Result<(), EscrowError> {
        self.trigger(Trigger::PaymentStarted).await
    }

    /// Seller side: the counter currency payment was received.
    pub async fn payment_received(&self) -> Result<(), EscrowError> {
        self.trigger(Trigger::PaymentReceived).await
    }

    pub async fn deposit_confirmed(&self) -> Result<(), EscrowError> {
        self.trigger(Trigger::DepositConfirmed).await
    }

    pub async fn payment_proof_confirmed(&self) -> Result<(), EscrowError> {
        self.trigger(Trigger::PaymentProofConfirmed).await
    }

    pub async fn resend_deposit_tx_published(&self) -> Result<(), EscrowError> {
        self.trigger(Trigger::ResendDepositTxPublished).await
    }

    pub async fn resend_payment_started(&self) -> Result<(), EscrowError> {
        self.trigger(Trigger::ResendPaymentStarted).await
    }

    pub async fn resend_payout_tx_published(&self) -> Result<(), EscrowError> {
        self.trigger(Trigger::ResendPayoutTxPublished).await
    }

    pub async fn open_dispute(&self) -> Result<(), EscrowError> {
        self.trigger(Trigger::OpenDispute).await
    }

    pub async fn close_dispute(&self) -> Result<(), EscrowError> {
        self.trigger(Trigger::CloseDispute).await
    }

    pub async fn query_trade(&self) -> Result<Trade, EscrowError> {
        let (rsp_tx, rsp_rx) = oneshot::channel::<Trade>();
        let request = TradeRequest::QueryTrade { rsp_tx };
        self.tx.send(request).await?;
        Ok(rsp_rx.await?)
    }

    pub async fn register_notif_tx(
        &self,
        tx: mpsc::Sender<TradeNotif>,
    ) -> Result<(), EscrowError> {
        let (rsp_tx, rsp_rx) = oneshot::channel::<Result<(), EscrowError>>();
        let request = TradeRequest::RegisterNotifTx { tx, rsp_tx };
        self.tx.send(request).await?;
        rsp_rx.await?
    }

    pub async fn unregister_notif_tx(&self) -> Result<(), EscrowError> {
        let (rsp_tx, rsp_rx) = oneshot::channel::<Result<(), EscrowError>>();
        let request = TradeRequest::UnregisterNotifTx { rsp_tx };
        self.tx.send(request).await?;
        rsp_rx.await?
    }

    pub async fn shutdown(&self) -> Result<(), EscrowError> {
        let (rsp_tx, rsp_rx) = oneshot::channel::<Result<(), EscrowError>>();
        let request = TradeRequest::Shutdown { rsp_tx };
        self.tx.send(request).await?; // Shutdown is allowed to fail if already terminated
        rsp_rx.await?
    }
}

pub(crate) struct TradeProtocol {
    tx: mpsc::Sender<TradeRequest>,
    pub(crate) task_handle: tokio::task::JoinHandle<()>,
}

impl TradeProtocol {
    /// Registers the trade for peer messages before the actor starts, so nothing addressed to it
    /// can slip through to the fallback. `initial` is processed first.
    pub(crate) async fn new(
        data: Arc<TradeData>,
        services: Arc<ProtocolServices>,
        comms_accessor: CommsAccess,
        closed_tx: mpsc::Sender<Trade>,
        initial: Option<PeerEnvelope>,
    ) -> Result<Self, EscrowError> {
        let trade_uuid = data.trade_uuid;
        let (tx, rx) = mpsc::channel::<TradeRequest>(services.config.request_channel_size);
        let (peer_tx, peer_rx) = mpsc::channel::<PeerEnvelope>(services.config.peer_channel_size);
        if let Some(envelope) = initial {
            peer_tx
                .try_send(envelope)
                .map_err(|error| EscrowError::MpscSend(error.to_string()))?;
        }
        comms_accessor
            .register_peer_message_tx(trade_uuid, peer_tx)
            .await?;

        let actor = TradeProtocolActor::new(rx, comms_accessor, data, services, closed_tx);
        let task_handle = tokio::spawn(async move { actor.run(peer_rx).await });
        Ok(Self { tx, task_handle })
    }

    pub(crate) fn new_accessor(&self) -> TradeAccess {
        TradeAccess::new(self.tx.clone())
    }
}

#[derive(Display, IntoStaticStr)]
enum TradeRequest {
    Trigger {
        trigger: Trigger,
        rsp_tx: oneshot::Sender<Result<(), EscrowError>>,
    },
    QueryTrade {
        rsp_tx: oneshot::Sender<Trade>,
    },
    RegisterNotifTx {
        tx: mpsc::Sender<TradeNotif>,
        rsp_tx: oneshot::Sender<Result<(), EscrowError>>,
    },
    UnregisterNotifTx {
        rsp_tx: oneshot::Sender<Result<(), EscrowError>>,
    },
    Shutdown {
        rsp_tx: oneshot::Sender<Result<(), EscrowError>>,
    },
}

fn trigger_for(payload: &TradePayload) -> Option<Trigger> {
    let trigger = match payload {
        TradePayload::InputsForDepositTxRequest(_) => Trigger::InputsForDepositTxRequest,
        TradePayload::InputsForDepositTxResponse(_) => Trigger::InputsForDepositTxResponse,
        TradePayload::DepositTxSigningRequest(_) => Trigger::DepositTxSigningRequest,
        TradePayload::DepositTxSignaturesResponse(_) => Trigger::DepositTxSignaturesResponse,
        TradePayload::DepositTxPublished(_) => Trigger::DepositTxPublished,
        TradePayload::PaymentStarted(_) => Trigger::PaymentStartedMessage,
        TradePayload::PayoutTxPublished(_) => Trigger::PayoutTxPublished,
        TradePayload::Ack(_) => return None,
    };
    Some(trigger)
}

/// The key a peer message must be signed with. A maker learns it from the first request.
fn expected_peer_key(trade: &Trade) -> Option<PubKeyRing> {
    trade
        .process_model
        .trading_peer
        .pub_key_ring
        .or_else(|| (!trade.is_maker()).then_some(trade.offer.maker_pub_key_ring))
}

struct TradeProtocolActor {
    rx: mpsc::Receiver<TradeRequest>,
    comms_accessor: CommsAccess,
    trade_uuid: Uuid,
    data: Arc<TradeData>,
    services: Arc<ProtocolServices>,
    notif_tx: Option<mpsc::Sender<TradeNotif>>,
    closed_tx: mpsc::Sender<Trade>,
    closed: bool,
}

impl TradeProtocolActor {
    fn new(
        rx: mpsc::Receiver<TradeRequest>,
        comms_accessor: CommsAccess,
        data: Arc<TradeData>,
        services: Arc<ProtocolServices>,
        closed_tx: mpsc::Sender<Trade>,
    ) -> Self {
        TradeProtocolActor {
            rx,
            comms_accessor,
            trade_uuid: data.trade_uuid,
            data,
            services,
            notif_tx: None,
            closed_tx,
            closed: false,
        }
    }

    async fn run(mut self, mut peer_rx: mpsc::Receiver<PeerEnvelope>) {
        self.resend_pending_outbound().await;
        self.report_if_closed().await;

        let protocol_timeout = tokio::time::sleep_until(self.protocol_deadline());
        tokio::pin!(protocol_timeout);

        while !self.closed {
            let timeout_armed = self.protocol_timeout_armed();
            select! {
                Some(request) = self.rx.recv() => {
                    if self.handle_request(request).await {
                        break;
                    }
                },
                Some(envelope) = peer_rx.recv() => {
                    self.handle_peer_message(envelope).await;
                },
                _ = &mut protocol_timeout, if timeout_armed => {
                    self.handle_protocol_timeout().await;
                },
                else => break,
            }
            self.report_if_closed().await;
        }

        // Closing the receiver first keeps Comms from blocking on a full channel meanwhile
        drop(peer_rx);
        if let Err(error) = self
            .comms_accessor
            .unregister_peer_message_tx(self.trade_uuid)
            .await
        {
            warn!(
                "Trade w/ TradeUUID {} failed to unregister from Comms - {}",
                self.trade_uuid, error
            );
        }
        info!("Trade w/ TradeUUID {} protocol terminating", self.trade_uuid);
    }

    fn new_context(&self, inbound: Option<PeerEnvelope>) -> TradeContext {
        TradeContext::new(
            self.data.clone(),
            self.services.clone(),
            inbound,
            self.notif_tx.clone(),
        )
    }

    // Top-down Requests Handling

    async fn handle_request(&mut self, request: TradeRequest) -> bool {
        let mut terminate = false;
        debug!(
            "Trade w/ TradeUUID {} handle_request() of type {}",
            self.trade_uuid, request
        );

        match request {
            TradeRequest::Trigger { trigger, rsp_tx } => {
                let mut ctx = self.new_context(None);
                let result = self.run_step(&mut ctx, trigger).await;
                rsp_tx.send(result).unwrap(); // oneshot should not fail
            }
            TradeRequest::QueryTrade { rsp_tx } => {
                rsp_tx.send(self.data.snapshot()).unwrap(); // oneshot should not fail
            }
            TradeRequest::RegisterNotifTx { tx, rsp_tx } => {
                self.register_notif_tx(tx, rsp_tx);
            }
            TradeRequest::UnregisterNotifTx { rsp_tx } => {
                self.unregister_notif_tx(rsp_tx);
            }
            TradeRequest::Shutdown { rsp_tx } => {
                self.data.request_persistence();
                rsp_tx.send(Ok(())).unwrap(); // oneshot should not fail
                terminate = true;
            }
        }
        terminate
    }

    fn register_notif_tx(
        &mut self,
        tx: mpsc::Sender<TradeNotif>,
        rsp_tx: oneshot::Sender<Result<(), EscrowError>>,
    ) {
        let mut result = Ok(());
        if self.notif_tx.is_some() {
            let error = EscrowError::Simple(format!(
                "Trade w/ TradeUUID {} already have notif_tx registered",
                self.trade_uuid
            ));
            result = Err(error);
        }
        self.notif_tx = Some(tx);
        rsp_tx.send(result).unwrap(); // oneshot should not fail
    }

    fn unregister_notif_tx(&mut self, rsp_tx: oneshot::Sender<Result<(), EscrowError>>) {
        let mut result = Ok(());
        if self.notif_tx.is_none() {
            let error = EscrowError::Simple(format!(
                "Trade w/ TradeUUID {} does not have notif_tx registered",
                self.trade_uuid
            ));
            result = Err(error);
        }
        self.notif_tx = None;
        rsp_tx.send(result).unwrap(); // oneshot should not fail
    }

    /// Runs the tasks configured for `trigger` if the trade is in one of the expected phases.
    async fn run_step(
        &mut self,
        ctx: &mut TradeContext,
        trigger: Trigger,
    ) -> Result<(), EscrowError> {
        let trade_id = ctx.trade.id;
        let role = ctx.trade.role;
        let Some(step) = step_for(role, trigger) else {
            return Err(EscrowError::Simple(format!(
                "Trade w/ TradeUUID {} as {} has no step for {}",
                trade_id, role, trigger
            )));
        };
        let phase = ctx.trade.state().phase();
        if !step.is_expected(phase) {
            return Err(EscrowError::UnexpectedPhase {
                trigger: trigger.to_string(),
                phase: phase.to_string(),
            });
        }

        debug!(
            "Trade w/ TradeUUID {} running {} step in phase {}",
            trade_id, trigger, phase
        );
        let previous = ctx.trade.state();
        let mut runner = TaskRunner::new(step.tasks.to_vec())
            .with_label(format!("Trade w/ TradeUUID {} {}", trade_id, trigger))
            .with_task_timeout(self.services.config.task_timeout())
            .on_fault(|ctx: &mut TradeContext, failure: &TaskFailure| {
                record_fault(&mut ctx.trade, failure.to_string());
                if let Err(error) = ctx.checkpoint() {
                    error!(
                        "Trade w/ TradeUUID {} failed to persist after fault - {}",
                        ctx.trade.id, error
                    );
                }
            });

        match runner.run(ctx).await {
            Ok(()) => Ok(()),
            Err(failure) => {
                error!("Trade w/ TradeUUID {} {} - {}", trade_id, trigger, failure);
                ctx.notify(TradeNotif::Error {
                    trade_id,
                    message: failure.to_string(),
                })
                .await;
                if previous != State::Failed && ctx.trade.state() == State::Failed {
                    ctx.notify(TradeNotif::StateChanged {
                        trade_id,
                        state: State::Failed,
                    })
                    .await;
                }
                Err(failure.into())
            }
        }
    }

    // Bottom-up Peer Message Handling

    async fn handle_peer_message(&mut self, envelope: PeerEnvelope) {
        let message = &envelope.message;
        debug!(
            "Trade w/ TradeUUID {} handle_peer_message() of {} with uid {}",
            self.trade_uuid,
            message.payload.name(),
            message.uid
        );

        if message.trade_id != self.trade_uuid {
            warn!(
                "Trade w/ TradeUUID {} dropped message for TradeUUID {}",
                self.trade_uuid, message.trade_id
            );
            return;
        }

        let (expected_key, already_processed) = {
            let trade = self.data.read();
            (
                expected_peer_key(&trade),
                trade.process_model.is_message_processed(&message.uid),
            )
        };
        if let Some(expected_key) = expected_key {
            if envelope.sender_pub_key_ring != expected_key {
                warn!(
                    "Trade w/ TradeUUID {} dropped {} from a key other than the trading peer's",
                    self.trade_uuid,
                    message.payload.name()
                );
                return;
            }
        }
        if already_processed {
            info!(
                "Trade w/ TradeUUID {} already processed {} with uid {}, ignoring",
                self.trade_uuid,
                message.payload.name(),
                message.uid
            );
            self.remove_mailbox_message(&message.uid).await;
            return;
        }

        let Some(trigger) = trigger_for(&message.payload) else {
            if let TradePayload::Ack(ack) = &message.payload {
                self.handle_ack(&message.uid, ack);
            }
            return;
        };

        let acked = envelope.message.clone();
        let mut ctx = self.new_context(Some(envelope));

        if let (Some(received), Some(_)) = (acked.payload.contract_hash(), ctx.trade.contract_hash())
        {
            if let Err(error) = ctx.trade.check_contract_hash(received) {
                error!(
                    "Trade w/ TradeUUID {} aborting on {} - {}",
                    self.trade_uuid,
                    acked.payload.name(),
                    error
                );
                let previous = ctx.trade.state();
                record_fault(&mut ctx.trade, error.to_string());
                ctx.trade
                    .process_model
                    .mark_message_processed(acked.uid.clone());
                if let Err(persist_error) = ctx.checkpoint() {
                    error!(
                        "Trade w/ TradeUUID {} failed to persist contract mismatch - {}",
                        self.trade_uuid, persist_error
                    );
                }
                ctx.notify(TradeNotif::Error {
                    trade_id: self.trade_uuid,
                    message: error.to_string(),
                })
                .await;
                if previous != State::Failed && ctx.trade.state() == State::Failed {
                    ctx.notify(TradeNotif::StateChanged {
                        trade_id: self.trade_uuid,
                        state: State::Failed,
                    })
                    .await;
                }
                ctx.send_ack(&acked, Some(error.to_string()));
                self.remove_mailbox_message(&acked.uid).await;
                return;
            }
        }

        match self.run_step(&mut ctx, trigger).await {
            Err(error @ EscrowError::UnexpectedPhase { .. }) => {
                warn!(
                    "Trade w/ TradeUUID {} rejected {} - {}",
                    self.trade_uuid,
                    acked.payload.name(),
                    error
                );
                ctx.send_ack(&acked, Some(error.to_string()));
            }
            result => {
                ctx.trade
                    .process_model
                    .mark_message_processed(acked.uid.clone());
                if let Err(error) = ctx.checkpoint() {
                    error!(
                        "Trade w/ TradeUUID {} failed to persist processed uid {} - {}",
                        self.trade_uuid, acked.uid, error
                    );
                }
                match result {
                    Ok(()) => {
                        ctx.send_ack(&acked, None);
                        self.remove_mailbox_message(&acked.uid).await;
                    }
                    Err(error) => ctx.send_ack(&acked, Some(error.to_string())),
                }
            }
        }
    }

    fn handle_ack(&mut self, uid: &str, ack: &Ack) {
        let state = if ack.success {
            MessageState::Acknowledged
        } else {
            MessageState::Failed
        };

        {
            let mut trade = self.data.write();
            if let Some(last_outbound) = trade.process_model.last_outbound.as_mut() {
                if last_outbound.message.uid == ack.ref_uid {
                    last_outbound.state = state;
                }
            }
            trade
                .process_model
                .set_message_state(ack.ref_payload.clone(), state);
            trade.process_model.mark_message_processed(uid);
        }

        if ack.success {
            debug!(
                "Trade w/ TradeUUID {} peer acknowledged {}",
                self.trade_uuid, ack.ref_payload
            );
        } else {
            warn!(
                "Trade w/ TradeUUID {} peer rejected {} - {}",
                self.trade_uuid,
                ack.ref_payload,
                ack.error_message.as_deref().unwrap_or("no reason given")
            );
        }
        if let Err(error) = self.data.persist_now() {
            error!(
                "Trade w/ TradeUUID {} failed to persist ack - {}",
                self.trade_uuid, error
            );
        }
    }

    async fn remove_mailbox_message(&self, uid: &str) {
        if let Err(error) = self.services.network.remove_mailbox_message(uid).await {
            warn!(
                "Trade w/ TradeUUID {} failed to remove mailbox message {} - {}",
                self.trade_uuid, uid, error
            );
        }
    }

    // Restart and timeout handling

    /// A message still marked sent was interrupted mid-delivery. It goes out again with the same
    /// uid so the peer can recognise a duplicate.
    async fn resend_pending_outbound(&mut self) {
        let pending = {
            let trade = self.data.read();
            if trade.state().is_terminal() {
                None
            } else {
                trade
                    .process_model
                    .last_outbound
                    .clone()
                    .filter(|outbound| outbound.state == MessageState::Sent)
            }
        };
        let Some(outbound) = pending else {
            return;
        };

        info!(
            "Trade w/ TradeUUID {} resending {} with uid {}",
            self.trade_uuid,
            outbound.message.payload.name(),
            outbound.message.uid
        );
        let mut ctx = self.new_context(None);
        if let Err(error) = ctx.send_outbound(outbound).await {
            error!(
                "Trade w/ TradeUUID {} resend failed - {}",
                self.trade_uuid, error
            );
        }
    }

    fn protocol_timeout_armed(&self) -> bool {
        let trade = self.data.read();
        !trade.is_deposit_published() && !trade.state().is_terminal()
    }

    fn protocol_deadline(&self) -> Instant {
        let take_offer_date = self.data.read().take_offer_date;
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|duration| duration.as_millis() as u64)
            .unwrap_or_default();
        let elapsed = Duration::from_millis(now.saturating_sub(take_offer_date));
        Instant::now()
            + self
                .services
                .config
                .protocol_timeout()
                .saturating_sub(elapsed)
    }

    async fn handle_protocol_timeout(&mut self) {
        let mut ctx = self.new_context(None);
        let message = format!(
            "Deposit not published within {} ms of taking the offer",
            self.services.config.protocol_timeout_ms
        );
        warn!("Trade w/ TradeUUID {} {}", self.trade_uuid, message);

        ctx.trade.fail(message.clone());
        if let Err(error) = ctx.checkpoint() {
            error!(
                "Trade w/ TradeUUID {} failed to persist timeout - {}",
                self.trade_uuid, error
            );
        }
        ctx.notify(TradeNotif::Error {
            trade_id: self.trade_uuid,
            message,
        })
        .await;
        ctx.notify(TradeNotif::StateChanged {
            trade_id: self.trade_uuid,
            state: ctx.trade.state(),
        })
        .await;
    }

    /// Hands a trade that reached a terminal state to the manager for archiving. The pending
    /// file stays until the archive holds it.
    async fn report_if_closed(&mut self) {
        if self.closed {
            return;
        }
        let trade = self.data.snapshot();
        if !trade.state().is_terminal() {
            return;
        }

        self.closed = true;
        self.data.close();
        info!(
            "Trade w/ TradeUUID {} closed in state {}",
            self.trade_uuid,
            trade.state()
        );
        if let Err(error) = self.closed_tx.send(trade).await {
            error!(
                "Trade w/ TradeUUID {} failed to report closing - {}",
                self.trade_uuid, error
            );
        }
    }
}

/// Fails the trade while the deposit is unpublished. Afterwards funds are locked, so only the
/// error is kept.
fn record_fault(trade: &mut Trade, message: String) {
    if trade.is_deposit_published() {
        trade.error_message = Some(message);
    } else {
        trade.fail(message);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::deposit::TxId;
    use crate::protocol::messages::PayoutTxPublished;
    use crate::testing::SomeTestTradeParams;

    #[test]
    fn ack_has_no_trigger() {
        let signed = SomeTestTradeParams::signed_payout_tx();
        let payout = TradePayload::PayoutTxPublished(PayoutTxPublished {
            contract_hash: [1; 32],
            payout_tx: signed,
        });
        assert_eq!(trigger_for(&payout), Some(Trigger::PayoutTxPublished));

        let ack = TradePayload::Ack(Ack {
            ref_uid: "uid".to_string(),
            ref_payload: "PaymentStarted".to_string(),
            success: true,
            error_message: None,
        });
        assert_eq!(trigger_for(&ack), None);
    }

    #[test]
    fn taker_expects_offer_maker_key_until_peer_known() {
        let (maker_trade, taker_trade) = SomeTestTradeParams::matched_trades();
        assert_eq!(
            expected_peer_key(&taker_trade),
            Some(taker_trade.offer.maker_pub_key_ring)
        );

        let mut fresh_maker_trade = maker_trade.clone();
        fresh_maker_trade.process_model.trading_peer.pub_key_ring = None;
        assert_eq!(expected_peer_key(&fresh_maker_trade), None);
    }

    #[test]
    fn fault_fails_trade_only_before_deposit_is_published() {
        let (mut unfunded, _) = SomeTestTradeParams::matched_trades();
        let mut funded = unfunded.clone();
        funded.deposit_tx_id = Some(TxId([7; 32]));
        let funded_state = funded.state();

        record_fault(&mut unfunded, "peer sent a different contract".to_string());
        assert_eq!(unfunded.state(), State::Failed);
        assert_eq!(
            unfunded.error_message.as_deref(),
            Some("peer sent a different contract")
        );

        record_fault(&mut funded, "peer sent a different contract".to_string());
        assert_eq!(funded.state(), funded_state);
        assert_eq!(
            funded.error_message.as_deref(),
            Some("peer sent a different contract")
        );
    }
}
