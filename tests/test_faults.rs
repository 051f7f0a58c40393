mod common;

#[cfg(test)]
mod integration_tests {
    use crusty_escrow::manager::TakerParams;
    use crusty_escrow::protocol::messages::{TradePayload, PROTOCOL_VERSION};
    use crusty_escrow::testing::{SomeTestOfferParams, SomeTestTradeParams};
    use crusty_escrow::trade::State;
    use uuid::Uuid;

    use super::common::harness::{
        eventually, wait_for, wait_for_state, TradingPair, TAKER_UTXOS,
    };
    use super::common::logger;

    #[tokio::test]
    async fn test_failed_send_after_deposit_published_can_be_resent() {
        logger::setup();
        let pair = TradingPair::start().await;
        let trade_id = pair.trade_id();
        pair.hub
            .fail_sends_of(&pair.taker.address, "DepositTxPublished", 1);

        let taker_access = pair.new_taker_trade().await;
        taker_access.take_offer().await.unwrap();

        let taker_trade = wait_for(&taker_access, |trade| {
            trade.state() == State::DepositTxPublishedSendFailed && trade.error_message.is_some()
        })
        .await;
        let deposit_tx_id = taker_trade.deposit_tx_id.unwrap();
        assert!(pair.chain.contains(&deposit_tx_id));
        assert_eq!(pair.taker.wallet.broadcast_count(), 1);

        // Deposit is on chain, so the trade stays open for a resend
        taker_access.resend_deposit_tx_published().await.unwrap();
        let taker_trade = taker_access.query_trade().await.unwrap();
        assert_eq!(taker_trade.state(), State::DepositTxPublishedArrived);
        assert_eq!(pair.taker.wallet.broadcast_count(), 1);

        let maker_access = pair.maker.access(&trade_id).await;
        let maker_trade = wait_for_state(&maker_access, State::DepositTxPublishedReceived).await;
        assert_eq!(maker_trade.deposit_tx_id, Some(deposit_tx_id));
        assert_eq!(
            pair.hub
                .sent_uids_of(&pair.taker.address, "DepositTxPublished")
                .len(),
            2
        );

        pair.shutdown().await;
    }

    #[tokio::test]
    async fn test_duplicate_delivery_is_ignored() {
        logger::setup();
        let pair = TradingPair::start().await;
        let trade_id = pair.trade_id();

        let taker_access = pair.new_taker_trade().await;
        taker_access.take_offer().await.unwrap();
        wait_for_state(&taker_access, State::DepositTxPublishedArrived).await;
        let maker_access = pair.maker.access(&trade_id).await;
        let before = wait_for_state(&maker_access, State::DepositTxPublishedReceived).await;

        let uid = pair
            .hub
            .sent_uids_of(&pair.taker.address, "DepositTxPublished")
            .remove(0);
        let hub = pair.hub.clone();
        let maker_address = pair.maker.address.clone();
        let removals = |uid: &str| {
            hub.removed_mailbox_uids(&maker_address)
                .iter()
                .filter(|removed| removed.as_str() == uid)
                .count()
        };
        eventually(|| removals(&uid) == 1).await;

        assert!(pair
            .hub
            .redeliver_last(&pair.maker.address, "DepositTxPublished"));
        eventually(|| removals(&uid) == 2).await;

        let after = maker_access.query_trade().await.unwrap();
        assert_eq!(after.state(), before.state());
        assert_eq!(after.deposit_tx_id, before.deposit_tx_id);
        assert!(after.process_model.is_message_processed(&uid));

        pair.shutdown().await;
    }

    #[tokio::test]
    async fn test_insufficient_funds_fails_before_sending() {
        logger::setup();
        let pair = TradingPair::start_with(&[1_000], |_| {}).await;
        let trade_id = pair.trade_id();

        let taker_access = pair.new_taker_trade().await;
        assert!(taker_access.take_offer().await.is_err());

        let closed = pair.taker.wait_for_closed(&trade_id).await;
        assert_eq!(closed.state(), State::Failed);
        assert!(closed.error_message.is_some());
        assert!(pair.hub.sent_messages(&pair.taker.address).is_empty());
        assert_eq!(pair.taker.wallet.reserved_inputs(&trade_id), 0);
        assert!(pair.chain.is_empty());

        // The offer is still open for another taker
        assert_eq!(pair.maker.manager().open_offers().await.len(), 1);

        pair.shutdown().await;
    }

    #[tokio::test]
    async fn test_contract_hash_mismatch_fails_trade() {
        logger::setup();
        let pair = TradingPair::start_configured(
            TAKER_UTXOS,
            |config| config.task_timeout_ms = 300,
            |_| {},
        )
        .await;
        let trade_id = pair.trade_id();
        pair.hub
            .hold_sends_of(&pair.maker.address, "DepositTxSignaturesResponse", 1);

        let taker_access = pair.new_taker_trade().await;
        taker_access.take_offer().await.unwrap();
        let taker_trade = wait_for_state(&taker_access, State::DepositInputsExchanged).await;
        assert!(taker_trade.contract_hash().is_some());

        assert!(pair.hub.redeliver_last_with(
            &pair.taker.address,
            "InputsForDepositTxResponse",
            |message| {
                message.uid = Uuid::new_v4().to_string();
                if let TradePayload::InputsForDepositTxResponse(response) = &mut message.payload {
                    response.contract_hash = [9; 32];
                }
            },
        ));

        let closed = pair.taker.wait_for_closed(&trade_id).await;
        assert_eq!(closed.state(), State::Failed);
        assert!(closed
            .error_message
            .as_deref()
            .is_some_and(|message| message.contains("ContractHashMismatch")));
        assert_eq!(closed.deposit_tx_id, None);
        assert!(pair.chain.is_empty());

        pair.shutdown().await;
    }

    #[tokio::test]
    async fn test_protocol_timeout_fails_trade_before_deposit() {
        logger::setup();
        let pair = TradingPair::start_configured(
            TAKER_UTXOS,
            |config| config.task_timeout_ms = 300,
            |config| config.protocol_timeout_ms = 500,
        )
        .await;
        let trade_id = pair.trade_id();
        pair.hub
            .hold_sends_of(&pair.maker.address, "InputsForDepositTxResponse", 1);

        let taker_access = pair.new_taker_trade().await;
        taker_access.take_offer().await.unwrap();

        let closed = pair.taker.wait_for_closed(&trade_id).await;
        assert_eq!(closed.state(), State::Failed);
        assert!(closed
            .error_message
            .as_deref()
            .is_some_and(|message| message.starts_with("Deposit not published within 500 ms")));
        assert_eq!(closed.deposit_tx_id, None);

        pair.shutdown().await;
    }

    #[tokio::test]
    async fn test_offer_newer_than_configured_version_is_refused() {
        logger::setup();
        let pair =
            TradingPair::start_with(TAKER_UTXOS, |config| config.protocol_version = 4).await;
        assert_eq!(pair.offer.protocol_version, PROTOCOL_VERSION);

        let result = pair
            .taker
            .manager()
            .take_offer(
                pair.offer.clone(),
                TakerParams {
                    account_id: "taker-account".to_string(),
                    payment_account_payload: Box::new(
                        SomeTestTradeParams::taker_payment_account_payload(),
                    ),
                    amount: SomeTestOfferParams::amount(),
                },
            )
            .await;
        assert!(result.is_err());
        assert!(pair
            .taker
            .manager()
            .trade_access(&pair.trade_id())
            .await
            .is_none());
        assert!(pair.hub.sent_messages(&pair.taker.address).is_empty());

        pair.shutdown().await;
    }
}
