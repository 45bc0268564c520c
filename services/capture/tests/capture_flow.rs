//! End-to-end capture flow tests
//!
//! Drives raw JSON frame sequences through the channel dispatcher into an
//! in-memory sink and checks what lands in storage.
//!
//! Tests include:
//! - Mixed book and trade session with shutdown flush
//! - Flush threshold crossing
//! - Zero-price deletion convention
//! - Default configuration against raw-book deletions
//! - Random delta streams: written rows plus dropped events cover the stream

use std::sync::Arc;

use capture::book::BookSettings;
use capture::buffer::FlushPolicy;
use capture::config::CaptureConfig;
use capture::dispatcher::{ChannelDispatcher, CloseSummary, Dispatched};
use capture::sink::MemorySink;
use chrono::{TimeZone, Utc};
use proptest::prelude::*;
use rust_decimal::Decimal;
use types::book::DeletionSentinel;
use types::ids::{ChannelId, OrderId, PairId, TradeId};
use types::numeric::Timestamp;

const BOOK_ACK: &str = r#"{"event":"subscribed","channel":"book","chanId":10961,"symbol":"tBTCUSD","prec":"R0","freq":"F0","len":"100","pair":"BTCUSD"}"#;
const TRADES_ACK: &str = r#"{"event":"subscribed","channel":"trades","chanId":10962,"symbol":"tBTCUSD","pair":"BTCUSD"}"#;

fn ts(millis: i64) -> Timestamp {
    Utc.timestamp_millis_opt(millis).unwrap()
}

fn make_dispatcher(sink: Arc<MemorySink>, threshold: usize, sentinel: DeletionSentinel) -> ChannelDispatcher {
    let settings = BookSettings {
        flush: FlushPolicy::new(threshold),
        sentinel,
    };
    ChannelDispatcher::new(PairId::new(1), settings, sink)
}

fn book_snapshot(channel_id: i64, first_id: i64, count: i64, millis: i64) -> String {
    let levels: Vec<String> = (first_id..first_id + count)
        .map(|id| format!(r#"[{id},"7000.5","0.25"]"#))
        .collect();
    format!("[{channel_id},[{}],{millis}]", levels.join(","))
}

async fn feed(dispatcher: &mut ChannelDispatcher, frames: &[&str]) {
    for (i, frame) in frames.iter().enumerate() {
        dispatcher
            .on_message(ts(2_000_000 + i as i64), frame)
            .await
            .unwrap_or_else(|e| panic!("frame {} rejected: {}", i, e));
    }
}

#[tokio::test]
async fn test_mixed_session_with_shutdown_flush() {
    let sink = Arc::new(MemorySink::new());
    let mut dispatcher = make_dispatcher(sink.clone(), 1000, DeletionSentinel::ZeroAmount);

    feed(
        &mut dispatcher,
        &[
            r#"{"event":"info","version":2,"serverId":"abc","platform":{"status":1}}"#,
            r#"{"event":"conf","status":"OK","flags":32776}"#,
            BOOK_ACK,
            TRADES_ACK,
            r#"[10961,[[100,"7000","1"],[101,"7001","-1"]],1574694470000]"#,
            r#"[10962,[[9,1574694469000,"0.1","6999"],[8,1574694468000,"-0.2","6998"]],1574694470001]"#,
            // episode: 200, 201 closed by 202
            r#"[10961,[200,"7002","0.5"],1574694471000]"#,
            r#"[10961,[201,"7003","0.7"],1574694471005]"#,
            r#"[10961,[202,"7002","0"],1574694471010]"#,
            r#"[10961,"hb"]"#,
            r#"[10962,"te",[10,1574694471020,"0.3","7001"],1574694471021]"#,
            r#"[10962,"tu",[10,1574694471020,"0.3","7001"],1574694471500]"#,
            // 202 seeded this group, 203 keeps it open
            r#"[10961,[203,"7004","1"],1574694472000]"#,
            r#"[10962,"hb"]"#,
        ],
    )
    .await;

    assert!(sink.bulk_writes().is_empty());
    assert_eq!(sink.markers().len(), 1);
    assert_eq!(sink.markers()[0].episode_timestamp, ts(1574694470000));

    let trades = sink.trades();
    let trade_ids: Vec<TradeId> = trades.iter().map(|t| t.trade_id).collect();
    assert_eq!(trade_ids, vec![TradeId::new(9), TradeId::new(8), TradeId::new(10)]);
    assert_eq!(trades[1].quantity, Decimal::new(-2, 1));
    assert_eq!(trades[2].exchange_timestamp, ts(1574694471020));

    let summary = dispatcher.close().await.unwrap();
    assert_eq!(
        summary,
        CloseSummary {
            channels: 2,
            flushed_rows: 4,
            dropped_events: 2
        }
    );

    let writes = sink.bulk_writes();
    assert_eq!(writes.len(), 1);
    let rows = &writes[0].rows;
    let ids: Vec<OrderId> = rows.iter().map(|r| r.order_id).collect();
    assert_eq!(ids, [100, 101, 200, 201].map(OrderId::new).to_vec());

    // Snapshot rows carry the snapshot time, delta rows the lagging episode time
    assert_eq!(rows[0].episode_timestamp, ts(1574694470000));
    assert_eq!(rows[2].episode_timestamp, ts(1574694471005));
    assert_eq!(rows[3].episode_timestamp, ts(1574694471005));
    assert_eq!(rows[2].exchange_timestamp, ts(1574694471000));
    assert!(rows.iter().all(|r| r.channel_id == ChannelId::new(10961)));
    assert!(rows.iter().all(|r| r.pair_id == PairId::new(1)));
}

#[tokio::test]
async fn test_threshold_crossing_writes_one_batch() {
    let sink = Arc::new(MemorySink::new());
    let mut dispatcher = make_dispatcher(sink.clone(), 1000, DeletionSentinel::ZeroAmount);
    dispatcher.on_message(ts(1), BOOK_ACK).await.unwrap();

    dispatcher
        .on_message(ts(2), &book_snapshot(10961, 0, 600, 1_000))
        .await
        .unwrap();
    dispatcher
        .on_message(ts(3), &book_snapshot(10961, 600, 400, 1_001))
        .await
        .unwrap();
    assert!(sink.bulk_writes().is_empty());

    let result = dispatcher
        .on_message(ts(4), &book_snapshot(10961, 1000, 1, 1_002))
        .await
        .unwrap();
    match result {
        Dispatched::Book { outcome, .. } => assert_eq!(outcome.flushed_rows, 1001),
        other => panic!("Expected book dispatch, got {:?}", other),
    }

    let writes = sink.bulk_writes();
    assert_eq!(writes.len(), 1);
    assert_eq!(writes[0].rows.len(), 1001);

    // Nothing left to write on close
    dispatcher.close().await.unwrap();
    assert_eq!(sink.bulk_writes().len(), 1);
}

#[tokio::test]
async fn test_zero_price_deletions() {
    let sink = Arc::new(MemorySink::new());
    let mut dispatcher = make_dispatcher(sink.clone(), 1000, DeletionSentinel::ZeroPrice);

    feed(
        &mut dispatcher,
        &[
            BOOK_ACK,
            r#"[10961,[1,"7000","0.5"],1000]"#,
            r#"[10961,[2,"7001","-0.5"],1001]"#,
            r#"[10961,[1,"0","1"],1002]"#,
            r#"[10961,[3,"0","-1"],1003]"#,
        ],
    )
    .await;

    let summary = dispatcher.close().await.unwrap();
    assert_eq!(summary.flushed_rows, 2);
    assert_eq!(summary.dropped_events, 2);
}

#[tokio::test]
async fn test_default_config_completes_raw_book_episodes() {
    let config = CaptureConfig::default();
    let sink = Arc::new(MemorySink::new());
    let mut dispatcher = ChannelDispatcher::new(config.pair_id, config.book, sink.clone());

    feed(
        &mut dispatcher,
        &[
            BOOK_ACK,
            r#"[10961,[1,"7000","0.5"],1000]"#,
            r#"[10961,[1,"0","1"],1001]"#,
            r#"[10961,[2,"7001","-0.5"],1002]"#,
            r#"[10961,[2,"0","-1"],1003]"#,
            r#"[10961,[3,"7002","0.25"],1004]"#,
            r#"[10961,[3,"0","1"],1005]"#,
            r#"[10961,[4,"7003","0.1"],1006]"#,
        ],
    )
    .await;

    let summary = dispatcher.close().await.unwrap();
    assert_eq!(summary.flushed_rows, 5);
    assert_eq!(summary.dropped_events, 2);

    let ids: Vec<i64> = sink.book_rows().iter().map(|r| r.order_id.get()).collect();
    assert_eq!(ids, vec![1, 1, 2, 2, 3]);
}

#[tokio::test]
async fn test_protocol_fault_keeps_other_channels_intact() {
    let sink = Arc::new(MemorySink::new());
    let mut dispatcher = make_dispatcher(sink.clone(), 1000, DeletionSentinel::ZeroAmount);
    feed(&mut dispatcher, &[BOOK_ACK, r#"[10961,[[1,"7000","1"]],1000]"#]).await;

    assert!(dispatcher.on_message(ts(9), r#"[10961,[1,"7000"],1001]"#).await.is_err());
    assert!(dispatcher.on_message(ts(9), r#"[555,[1,"7000","1"],1001]"#).await.is_err());

    let summary = dispatcher.close().await.unwrap();
    assert_eq!(summary.flushed_rows, 1);
}

proptest! {
    #[test]
    fn prop_rows_and_dropped_events_cover_delta_stream(amounts in proptest::collection::vec(-1i64..2, 0..300)) {
        let runtime = tokio::runtime::Builder::new_current_thread().build().unwrap();
        let sink = Arc::new(MemorySink::new());
        let mut dispatcher = make_dispatcher(sink.clone(), 50, DeletionSentinel::ZeroAmount);

        let summary = runtime.block_on(async {
            dispatcher.on_message(ts(1), BOOK_ACK).await.unwrap();
            for (i, amount) in amounts.iter().enumerate() {
                let frame = format!(r#"[10961,[{i},"7000","{amount}"],{}]"#, 1_000 + i);
                dispatcher.on_message(ts(2), &frame).await.unwrap();
            }
            dispatcher.close().await.unwrap()
        });

        let written: Vec<i64> = sink.book_rows().iter().map(|r| r.order_id.get()).collect();
        prop_assert_eq!(written.len() + summary.dropped_events, amounts.len());
        let expected: Vec<i64> = (0..written.len() as i64).collect();
        prop_assert_eq!(written, expected);

        // Every batch but the final close flush crossed the threshold
        let writes = sink.bulk_writes();
        for write in writes.iter().take(writes.len().saturating_sub(1)) {
            prop_assert!(write.rows.len() > 50);
        }
    }
}
