//! Node pipeline tests against a mocked matching engine.

use chrono::{DateTime, TimeZone, Utc};
use mockall::{mock, predicate::*};
use rust_decimal_macros::dec;

use clob_core::{
    BaseQuantums, BlockInfo, ClobPairId, GoodTil, Order, OrderFlavor, OrderId, Side,
    SubaccountId, Subticks, TimeInForce,
};
use clob_keeper::{MatchOutcome, MatchedFill, MatchingEngine, OrderFilter, OrderbookInfo};
use clob_node::sim::{SimBook, SimCollateral, SimOracle};
use clob_node::{Node, NodeConfig, Tx};

mock! {
    pub Engine {}

    impl MatchingEngine for Engine {
        fn place_order(&mut self, order: &Order) -> MatchOutcome;
        fn restore_order(&mut self, order: &Order, filled: BaseQuantums);
        fn cancel_order(&mut self, order_id: &OrderId) -> bool;
        fn purge_expired_short_term(&mut self, height: u32) -> Vec<OrderId>;
        fn count_resting_orders(&self, subaccount: &SubaccountId, filter: OrderFilter) -> u32;
        fn orderbook(&self, market: ClobPairId) -> Option<OrderbookInfo>;
    }
}

fn t(secs: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(secs, 0).unwrap()
}

fn block(height: u32) -> BlockInfo {
    BlockInfo::new(height, t(i64::from(height) * 10))
}

fn alice() -> SubaccountId {
    SubaccountId::new("alice", 0)
}

fn order(flavor: OrderFlavor, client_id: u32, good_til: GoodTil) -> Order {
    Order {
        order_id: OrderId::new(alice(), client_id, ClobPairId(0), flavor),
        side: Side::Buy,
        quantums: BaseQuantums(20),
        subticks: Subticks(50),
        time_in_force: TimeInForce::GoodTilCancel,
        good_til,
        reduce_only: false,
        conditional: None,
        twap: None,
    }
}

fn oracle() -> SimOracle {
    let mut oracle = SimOracle::new();
    oracle.set_price(ClobPairId(0), dec!(50));
    oracle
}

/// Engine with a single market, an empty book and no purges.
fn quiet_engine() -> MockEngine {
    let mut engine = MockEngine::new();
    engine.expect_orderbook().returning(|_| {
        Some(OrderbookInfo {
            subticks_per_tick: 1,
            step_base_quantums: 1,
        })
    });
    engine.expect_count_resting_orders().returning(|_, _| 0);
    engine.expect_purge_expired_short_term().returning(|_| Vec::new());
    engine
}

#[test]
fn stateful_order_reaches_book_once_after_transactions() {
    let first = order(OrderFlavor::LongTerm, 1, GoodTil::Time(t(500)));
    let mut replacement = first.clone();
    replacement.subticks = Subticks(49);
    replacement.good_til = GoodTil::Time(t(600));

    let mut engine = quiet_engine();
    let expected = replacement.clone();
    engine
        .expect_place_order()
        .withf(move |o| *o == expected)
        .times(1)
        .returning(|_| MatchOutcome {
            fills: Vec::new(),
            resting: true,
        });
    engine.expect_cancel_order().never();

    let mut node = Node::new(NodeConfig::default(), engine).unwrap();
    let report = node
        .process_block(
            block(1),
            &[Tx::Place(first), Tx::Place(replacement.clone())],
            &oracle(),
            &SimCollateral::new(),
        )
        .unwrap();
    assert_eq!(report.placed.len(), 2);
    assert_eq!(node.keeper().list_all_orders().unwrap(), vec![replacement]);
}

#[test]
fn replacing_a_resting_order_cancels_it_on_the_book() {
    let first = order(OrderFlavor::LongTerm, 1, GoodTil::Time(t(500)));
    let mut replacement = first.clone();
    replacement.good_til = GoodTil::Time(t(600));

    let mut engine = quiet_engine();
    engine
        .expect_place_order()
        .times(2)
        .returning(|_| MatchOutcome::default());
    engine
        .expect_cancel_order()
        .with(eq(first.order_id.clone()))
        .times(1)
        .returning(|_| true);

    let mut node = Node::new(NodeConfig::default(), engine).unwrap();
    let collateral = SimCollateral::new();
    node.process_block(block(1), &[Tx::Place(first)], &oracle(), &collateral)
        .unwrap();
    node.process_block(block(2), &[Tx::Place(replacement)], &oracle(), &collateral)
        .unwrap();
}

#[test]
fn fatal_fill_aborts_block_and_keeps_committed_state() {
    let taker = order(OrderFlavor::ShortTerm, 1, GoodTil::Block(5));
    let mut engine = quiet_engine();
    let mut totals = vec![5u64, 10].into_iter();
    engine.expect_place_order().times(2).returning(move |o| MatchOutcome {
        fills: vec![MatchedFill {
            order: o.clone(),
            total_filled: BaseQuantums(totals.next_back().unwrap_or(0)),
        }],
        resting: false,
    });

    let mut node = Node::new(NodeConfig::default(), engine).unwrap();
    let collateral = SimCollateral::new();
    node.process_block(block(1), &[Tx::Place(taker.clone())], &oracle(), &collateral)
        .unwrap();
    let store_before = node.keeper().store().clone();

    // the engine now reports a smaller cumulative fill
    let err = node
        .process_block(block(2), &[Tx::Place(taker.clone())], &oracle(), &collateral)
        .unwrap_err();
    assert!(err.is_fatal());
    assert_eq!(node.last_height(), 1);
    assert_eq!(node.keeper().store(), &store_before);
    assert_eq!(
        node.keeper().get_fill(&taker.order_id).unwrap().unwrap().filled,
        BaseQuantums(10)
    );
}

#[test]
fn restart_restores_resting_orders_with_their_fills() {
    let dir = tempfile::tempdir().unwrap();
    let config = NodeConfig {
        snapshot_path: Some(dir.path().join("clob.snapshot")),
        ..NodeConfig::default()
    };

    let mut maker = order(OrderFlavor::LongTerm, 1, GoodTil::Time(t(500)));
    maker.side = Side::Sell;
    let mut taker = order(OrderFlavor::ShortTerm, 2, GoodTil::Block(3));
    taker.order_id.subaccount_id = SubaccountId::new("bob", 0);
    taker.quantums = BaseQuantums(6);

    {
        let mut book = SimBook::new();
        book.add_market(
            ClobPairId(0),
            OrderbookInfo {
                subticks_per_tick: 1,
                step_base_quantums: 1,
            },
        );
        let mut node = Node::new(config.clone(), book).unwrap();
        let collateral = SimCollateral::new();
        node.process_block(block(1), &[Tx::Place(maker.clone())], &oracle(), &collateral)
            .unwrap();
        node.process_block(block(2), &[Tx::Place(taker)], &oracle(), &collateral)
            .unwrap();
    }

    let mut engine = MockEngine::new();
    engine
        .expect_restore_order()
        .with(eq(maker), eq(BaseQuantums(6)))
        .times(1)
        .return_const(());
    let node = Node::new(config, engine).unwrap();
    assert_eq!(node.last_height(), 2);
}
