mod common;

#[cfg(test)]
mod integration_tests {
    use crusty_escrow::trade::{Phase, State};

    use super::common::harness::{eventually, wait_for_state, TradingPair, TAKER_UTXOS};
    use super::common::logger;

    #[tokio::test]
    async fn test_buyer_as_taker_publishes_deposit() {
        logger::setup();
        let pair = TradingPair::start().await;
        let trade_id = pair.trade_id();

        let taker_access = pair.new_taker_trade().await;
        assert!(pair.hub.sent_messages(&pair.taker.address).is_empty());
        taker_access.take_offer().await.unwrap();

        let taker_trade = wait_for_state(&taker_access, State::DepositTxPublishedArrived).await;
        let maker_access = pair.maker.access(&trade_id).await;
        let maker_trade = wait_for_state(&maker_access, State::DepositTxPublishedReceived).await;

        let deposit_tx_id = taker_trade.deposit_tx_id.unwrap();
        assert_eq!(maker_trade.deposit_tx_id, Some(deposit_tx_id));
        assert!(pair.chain.contains(&deposit_tx_id));
        assert_eq!(pair.taker.wallet.broadcast_count(), 1);
        assert_eq!(pair.maker.wallet.broadcast_count(), 0);
        assert_eq!(taker_trade.contract_hash(), maker_trade.contract_hash());
        assert!(pair.maker.manager().open_offers().await.is_empty());

        let published_uids = pair
            .hub
            .sent_uids_of(&pair.taker.address, "DepositTxPublished");
        assert_eq!(published_uids.len(), 1);
        let maker_address = pair.maker.address.clone();
        let hub = pair.hub.clone();
        eventually(|| hub.removed_mailbox_uids(&maker_address).contains(&published_uids[0])).await;

        pair.shutdown().await;
    }

    #[tokio::test]
    async fn test_configured_protocol_version_stamps_offer() {
        logger::setup();
        let pair = TradingPair::start_configured(
            TAKER_UTXOS,
            |config| config.protocol_version = 4,
            |_| {},
        )
        .await;
        let trade_id = pair.trade_id();
        let open_offers = pair.maker.manager().open_offers().await;
        assert_eq!(open_offers.len(), 1);
        assert_eq!(open_offers[0].protocol_version, 4);

        let taker_access = pair.new_taker_trade().await;
        taker_access.take_offer().await.unwrap();
        let taker_trade = wait_for_state(&taker_access, State::DepositTxPublishedArrived).await;
        let maker_access = pair.maker.access(&trade_id).await;
        let maker_trade = wait_for_state(&maker_access, State::DepositTxPublishedReceived).await;

        assert_eq!(taker_trade.offer.protocol_version, 4);
        assert_eq!(maker_trade.offer.protocol_version, 4);
        assert!(maker_trade.process_model.warning_tx_signature.is_none());
        assert!(maker_trade.process_model.redirect_tx_signature.is_none());
        assert!(pair.chain.contains(&taker_trade.deposit_tx_id.unwrap()));

        pair.shutdown().await;
    }

    #[tokio::test]
    async fn test_manager_reports_node_address() {
        logger::setup();
        let pair = TradingPair::start().await;
        assert_eq!(
            pair.maker.manager().node_address().await.unwrap(),
            pair.maker.address
        );
        assert_eq!(
            pair.taker.manager().node_address().await.unwrap(),
            pair.taker.address
        );
        pair.shutdown().await;
    }

    #[tokio::test]
    async fn test_full_trade_completes() {
        logger::setup();
        let pair = TradingPair::start().await;
        let trade_id = pair.trade_id();

        let taker_access = pair.new_taker_trade().await;
        taker_access.take_offer().await.unwrap();
        wait_for_state(&taker_access, State::DepositTxPublishedArrived).await;
        let maker_access = pair.maker.access(&trade_id).await;
        wait_for_state(&maker_access, State::DepositTxPublishedReceived).await;

        taker_access.deposit_confirmed().await.unwrap();
        maker_access.deposit_confirmed().await.unwrap();

        taker_access.payment_started().await.unwrap();
        let taker_trade = taker_access.query_trade().await.unwrap();
        assert_eq!(taker_trade.state(), State::PaymentStartedArrived);
        let maker_trade = wait_for_state(&maker_access, State::PaymentStartedReceived).await;
        assert_eq!(maker_trade.state().phase(), Phase::PaymentStarted);

        maker_access.payment_received().await.unwrap();

        let maker_closed = pair.maker.wait_for_closed(&trade_id).await;
        let taker_closed = pair.taker.wait_for_closed(&trade_id).await;
        assert_eq!(maker_closed.state(), State::Completed);
        assert_eq!(taker_closed.state(), State::Completed);
        assert_eq!(maker_closed.payout_tx_id, taker_closed.payout_tx_id);
        assert!(pair.chain.contains(&maker_closed.payout_tx_id.unwrap()));
        assert_eq!(pair.chain.len(), 2);

        eventually(|| both_archived(&pair)).await;
        assert!(pair.maker.manager().trade_access(&trade_id).await.is_none());
        assert!(pair.taker.manager().get_trades().await.is_empty());

        pair.shutdown().await;
    }

    fn both_archived(pair: &TradingPair) -> bool {
        pair.maker.manager().closed_trades().len() == 1
            && pair.taker.manager().closed_trades().len() == 1
    }

    #[tokio::test]
    async fn test_offer_cannot_be_taken_by_its_maker() {
        logger::setup();
        let pair = TradingPair::start().await;

        let offers = pair.maker.manager().open_offers().await;
        assert_eq!(offers.len(), 1);
        assert!(pair
            .maker
            .manager()
            .take_offer(offers[0].clone(), own_offer_taker_params())
            .await
            .is_err());

        let cancelled = pair
            .maker
            .manager()
            .cancel_offer(&pair.trade_id())
            .await
            .unwrap();
        assert_eq!(cancelled.id, pair.trade_id());
        assert!(pair.maker.manager().open_offers().await.is_empty());

        pair.shutdown().await;
    }

    fn own_offer_taker_params() -> crusty_escrow::manager::TakerParams {
        crusty_escrow::manager::TakerParams {
            account_id: "maker-account".to_string(),
            payment_account_payload: Box::new(
                crusty_escrow::testing::SomeTestTradeParams::maker_payment_account_payload(),
            ),
            amount: crusty_escrow::testing::SomeTestOfferParams::amount(),
        }
    }
}
