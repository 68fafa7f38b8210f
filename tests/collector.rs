mod common;

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use deriv_book_collector::venue::sim::SimulatedVenue;
use deriv_book_collector::{
    Collector, CollectorError, ExitReason, InstrumentKind, OptionRight, OrderbookSnapshot,
    RawOrderbook, StreamConfig, StreamHandler, SupervisorState, VenueError, VenueRegistry,
};

use common::{Recorder, fast_config, settle, sim_venue, started, wait_until};

const T0: i64 = 1_700_000_000_000;

fn ts_of(books: &[Arc<OrderbookSnapshot>]) -> Vec<i64> {
    books.iter().map(|s| s.timestamp.timestamp_millis() - T0).collect()
}

#[tokio::test]
async fn update_flows_into_cache_history_and_handler() {
    let venue = sim_venue("sim");
    let recorder = Arc::new(Recorder::default());
    let collector = started(fast_config("sim").with_handler(recorder.clone()), &venue).await;

    assert_eq!(collector.subscribe_futures(&["BTC-PERP"]).unwrap(), 1);
    venue.push_book(
        "BTC-PERP",
        RawOrderbook::new(&[[100.0, 1.0], [99.5, 2.0]], &[[101.0, 1.5]]).at(T0),
    );

    wait_until("first update", || recorder.updates() == 1).await;

    let book = collector.latest("BTC-PERP").unwrap();
    assert_eq!(book.venue, "sim");
    assert_eq!(book.best_bid(), Some(100.0));
    assert_eq!(book.best_ask(), Some(101.0));
    assert_eq!(book.mid_price(), Some(100.5));
    assert_eq!(book.spread(), Some(1.0));
    assert_eq!(book.timestamp.timestamp_millis(), T0);
    assert_eq!(recorder.updates.lock()[0], *book);

    assert_eq!(collector.history("BTC-PERP", None).len(), 1);
    assert!(collector.futures_orderbooks().contains_key("BTC-PERP"));
    assert!(collector.options_orderbooks().is_empty());
    assert!(collector.latest("ETH-PERPETUAL").is_none());

    let table = collector.orderbooks_table();
    assert_eq!(table.len(), 1);
    assert_eq!(table.column("mid_price")[0], 100.5);
    assert_eq!(table.column("bid_size_1")[0], 2.0);
    assert!(table.column("ask_price_1")[0].is_null());

    collector.stop().await;
}

#[tokio::test]
async fn history_keeps_only_most_recent_snapshots() {
    let venue = sim_venue("sim");
    let recorder = Arc::new(Recorder::default());
    let collector = started(
        fast_config("sim").with_history(3).with_handler(recorder.clone()),
        &venue,
    )
    .await;

    collector.subscribe_futures(&["BTC-PERP"]).unwrap();
    for i in 0..5 {
        venue.push_book("BTC-PERP", RawOrderbook::new(&[[100.0, 1.0]], &[]).at(T0 + i));
    }
    wait_until("five updates", || recorder.updates() == 5).await;

    assert_eq!(ts_of(&collector.history("BTC-PERP", None)), vec![2, 3, 4]);
    assert_eq!(ts_of(&collector.history("BTC-PERP", Some(2))), vec![3, 4]);
    assert!(collector.history("BTC-PERP", Some(0)).is_empty());
    assert_eq!(collector.latest("BTC-PERP").unwrap().timestamp.timestamp_millis(), T0 + 4);

    collector.stop().await;
}

#[tokio::test]
async fn history_disabled_keeps_latest_only() {
    let venue = sim_venue("sim");
    let recorder = Arc::new(Recorder::default());
    let collector = started(
        fast_config("sim").without_history().with_handler(recorder.clone()),
        &venue,
    )
    .await;

    collector.subscribe_futures(&["BTC-PERP"]).unwrap();
    venue.push_book("BTC-PERP", RawOrderbook::new(&[[1.0, 1.0]], &[]));
    wait_until("update", || recorder.updates() == 1).await;

    assert!(collector.latest("BTC-PERP").is_some());
    assert!(collector.history("BTC-PERP", None).is_empty());

    collector.stop().await;
}

#[tokio::test]
async fn persistent_failure_gives_up_after_max_attempts() {
    let venue = sim_venue("sim");
    venue.fail_always("BTC-PERP");
    let recorder = Arc::new(Recorder::default());
    let collector = started(fast_config("sim").with_handler(recorder.clone()), &venue).await;

    collector.subscribe_futures(&["BTC-PERP"]).unwrap();
    wait_until("give up", || {
        collector.supervisor_state("BTC-PERP")
            == Some(SupervisorState::Terminated(ExitReason::GaveUp { attempts: 3 }))
    })
    .await;
    wait_until("task end", || collector.active_supervisors("BTC-PERP") == 0).await;

    assert_eq!(recorder.errors(), 3);
    assert_eq!(venue.watch_calls("BTC-PERP"), 3);
    assert!(collector.latest("BTC-PERP").is_none());

    settle().await;
    assert_eq!(recorder.errors(), 3);

    collector.stop().await;
}

#[tokio::test]
async fn success_resets_failure_count() {
    let venue = sim_venue("sim");
    let recorder = Arc::new(Recorder::default());
    let collector = started(fast_config("sim").with_handler(recorder.clone()), &venue).await;

    // Two failures, one update, twice: never three in a row
    for round in 0..2 {
        venue.push_failure("BTC-PERP", "reset");
        venue.push_failure("BTC-PERP", "reset");
        venue.push_book("BTC-PERP", RawOrderbook::new(&[[100.0, 1.0]], &[]).at(T0 + round));
    }
    collector.subscribe_futures(&["BTC-PERP"]).unwrap();

    wait_until("both updates", || recorder.updates() == 2).await;
    assert_eq!(recorder.errors(), 4);
    assert!(recorder.errors.lock()[0].contains("reset"));
    assert_eq!(collector.supervisor_state("BTC-PERP"), Some(SupervisorState::Streaming));
    assert_eq!(collector.active_supervisors("BTC-PERP"), 1);

    collector.stop().await;
}

#[tokio::test]
async fn repeated_subscribe_spawns_one_supervisor() {
    let venue = sim_venue("sim");
    let collector = started(fast_config("sim"), &venue).await;

    assert_eq!(collector.subscribe_futures(&["BTC-PERP", "BTC-PERP"]).unwrap(), 1);
    assert_eq!(collector.subscribe_futures(&["BTC-PERP"]).unwrap(), 0);
    assert_eq!(collector.subscribe_options(&["BTC-PERP"]).unwrap(), 0);
    settle().await;

    assert_eq!(collector.active_supervisors("BTC-PERP"), 1);
    assert_eq!(collector.subscribed(InstrumentKind::Future), vec!["BTC-PERP"]);
    assert!(collector.subscribed(InstrumentKind::Option).is_empty());
    assert!(collector.is_subscribed("BTC-PERP"));

    collector.stop().await;
}

#[tokio::test]
async fn unsubscribe_is_cooperative() {
    let venue = sim_venue("sim");
    let recorder = Arc::new(Recorder::default());
    let collector = started(fast_config("sim").with_handler(recorder.clone()), &venue).await;

    collector.subscribe_futures(&["BTC-PERP"]).unwrap();
    venue.push_book("BTC-PERP", RawOrderbook::new(&[[100.0, 1.0]], &[]).at(T0));
    wait_until("first update", || recorder.updates() == 1).await;

    assert!(collector.unsubscribe("BTC-PERP"));
    assert!(!collector.unsubscribe("BTC-PERP"));
    assert!(!collector.is_subscribed("BTC-PERP"));
    assert!(collector.futures_orderbooks().is_empty());
    assert!(collector.subscribed(InstrumentKind::Future).is_empty());

    // Still parked on the venue until the next update arrives
    settle().await;
    assert_eq!(collector.active_supervisors("BTC-PERP"), 1);

    venue.push_book("BTC-PERP", RawOrderbook::new(&[[200.0, 1.0]], &[]).at(T0 + 1));
    wait_until("supervisor exit", || {
        collector.supervisor_state("BTC-PERP")
            == Some(SupervisorState::Terminated(ExitReason::Unsubscribed))
    })
    .await;

    assert_eq!(recorder.updates(), 1);
    assert_eq!(collector.latest("BTC-PERP").unwrap().best_bid(), Some(100.0));
    assert_eq!(venue.released(), vec!["BTC-PERP"]);

    collector.stop().await;
}

#[tokio::test]
async fn resubscribe_while_old_supervisor_parked_keeps_one_stream() {
    let venue = sim_venue("sim");
    let recorder = Arc::new(Recorder::default());
    let collector = started(fast_config("sim").with_handler(recorder.clone()), &venue).await;

    collector.subscribe_futures(&["BTC-PERP"]).unwrap();
    settle().await;
    collector.unsubscribe("BTC-PERP");
    assert_eq!(collector.subscribe_futures(&["BTC-PERP"]).unwrap(), 1);

    // The parked supervisor consumes the first update and discards it
    venue.push_book("BTC-PERP", RawOrderbook::new(&[[1.0, 1.0]], &[]).at(T0));
    venue.push_book("BTC-PERP", RawOrderbook::new(&[[2.0, 1.0]], &[]).at(T0 + 1));

    wait_until("new stream update", || recorder.updates() == 1).await;
    wait_until("old stream exit", || collector.active_supervisors("BTC-PERP") == 1).await;

    assert_eq!(collector.latest("BTC-PERP").unwrap().best_bid(), Some(2.0));
    assert_eq!(collector.supervisor_state("BTC-PERP"), Some(SupervisorState::Streaming));
    assert!(venue.released().is_empty());

    collector.stop().await;
}

#[tokio::test]
async fn subscribe_before_start_fails() {
    let venue = sim_venue("sim");
    let collector = Collector::with_venue(StreamConfig::new("sim"), venue);

    assert!(matches!(
        collector.subscribe_futures(&["BTC-PERP"]),
        Err(CollectorError::NotRunning)
    ));
    assert!(matches!(
        collector.available_futures(None),
        Err(CollectorError::MarketsNotLoaded)
    ));
    assert!(!collector.is_subscribed("BTC-PERP"));
}

#[tokio::test]
async fn unreachable_venue_fails_start() {
    let venue = sim_venue("sim");
    venue.set_unreachable(true);
    let collector = Collector::with_venue(StreamConfig::new("sim"), venue.clone());

    let err = collector.start().await;
    assert!(matches!(err, Err(CollectorError::Venue(VenueError::Connect(_)))));
    assert!(!collector.is_running());

    venue.set_unreachable(false);
    collector.start().await.unwrap();
    assert!(collector.is_running());
    collector.stop().await;
}

#[tokio::test]
async fn unknown_venue_is_rejected() {
    let result = Collector::new(StreamConfig::new("nowhere"), &VenueRegistry::builtin());
    assert!(matches!(result, Err(CollectorError::UnknownVenue(v)) if v == "nowhere"));
}

struct Faulty {
    calls: AtomicUsize,
}

#[async_trait::async_trait]
impl StreamHandler for Faulty {
    async fn on_orderbook_update(&self, _: &OrderbookSnapshot) -> anyhow::Result<()> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst);
        if n == 0 {
            panic!("consumer bug");
        }
        anyhow::bail!("consumer refused update {n}")
    }

    async fn on_error(&self, _: &str, _: &VenueError) -> anyhow::Result<()> {
        anyhow::bail!("cannot handle errors")
    }
}

#[tokio::test]
async fn failing_callbacks_do_not_stop_the_stream() {
    let venue = sim_venue("sim");
    let handler = Arc::new(Faulty {
        calls: AtomicUsize::new(0),
    });
    let collector = started(fast_config("sim").with_handler(handler.clone()), &venue).await;

    collector.subscribe_futures(&["BTC-PERP"]).unwrap();
    venue.push_book("BTC-PERP", RawOrderbook::new(&[[1.0, 1.0]], &[]).at(T0));
    venue.push_failure("BTC-PERP", "blip");
    venue.push_book("BTC-PERP", RawOrderbook::new(&[[2.0, 1.0]], &[]).at(T0 + 1));
    venue.push_book("BTC-PERP", RawOrderbook::new(&[[3.0, 1.0]], &[]).at(T0 + 2));

    wait_until("three callbacks", || handler.calls.load(Ordering::SeqCst) == 3).await;
    assert_eq!(collector.latest("BTC-PERP").unwrap().best_bid(), Some(3.0));
    assert_eq!(collector.history("BTC-PERP", None).len(), 3);
    assert_eq!(collector.active_supervisors("BTC-PERP"), 1);

    collector.stop().await;
}

#[tokio::test]
async fn stop_ends_every_supervisor_and_is_repeatable() {
    let venue = sim_venue("sim");
    venue.fail_always("ETH-PERPETUAL");
    let collector = started(fast_config("sim"), &venue).await;

    collector
        .subscribe_futures(&["BTC-PERP", "BTC-PERPETUAL", "ETH-PERPETUAL"])
        .unwrap();
    wait_until("eth gives up", || {
        collector.active_supervisors("ETH-PERPETUAL") == 0
    })
    .await;

    collector.stop().await;
    assert!(!collector.is_running());
    assert!(venue.is_closed());
    assert!(!collector.is_subscribed("BTC-PERP"));
    assert_eq!(collector.active_supervisors("BTC-PERP"), 0);
    assert_eq!(
        collector.supervisor_state("BTC-PERP"),
        Some(SupervisorState::Terminated(ExitReason::Stopped))
    );
    assert_eq!(
        collector.supervisor_state("ETH-PERPETUAL"),
        Some(SupervisorState::Terminated(ExitReason::GaveUp { attempts: 3 }))
    );

    collector.stop().await;
    assert!(matches!(
        collector.subscribe_futures(&["BTC-PERP"]),
        Err(CollectorError::NotRunning)
    ));

    // A stopped collector can be started again
    collector.start().await.unwrap();
    assert!(!venue.is_closed());
    collector.stop().await;
}

#[tokio::test]
async fn restart_allows_subscribing_again() {
    let venue = sim_venue("sim");
    let recorder = Arc::new(Recorder::default());
    let collector = started(fast_config("sim").with_handler(recorder.clone()), &venue).await;

    collector.subscribe_futures(&["BTC-PERP"]).unwrap();
    settle().await;
    collector.stop().await;
    assert!(!collector.is_subscribed("BTC-PERP"));
    assert!(collector.subscribed(InstrumentKind::Future).is_empty());

    collector.start().await.unwrap();
    assert_eq!(collector.subscribe_futures(&["BTC-PERP"]).unwrap(), 1);
    venue.push_book("BTC-PERP", RawOrderbook::new(&[[42.0, 1.0]], &[]).at(T0));

    wait_until("update after restart", || recorder.updates() == 1).await;
    assert_eq!(collector.latest("BTC-PERP").unwrap().best_bid(), Some(42.0));
    assert_eq!(collector.active_supervisors("BTC-PERP"), 1);
    assert_eq!(collector.supervisor_state("BTC-PERP"), Some(SupervisorState::Streaming));

    collector.stop().await;
}

#[tokio::test]
async fn catalog_queries_and_bulk_subscription() {
    let venue = sim_venue("sim");
    let collector = started(fast_config("sim"), &venue).await;

    assert_eq!(
        collector.available_futures(Some("BTC")).unwrap(),
        vec!["BTC-PERP", "BTC-PERPETUAL"]
    );
    assert_eq!(
        collector
            .available_options(None, Some(OptionRight::Put), None)
            .unwrap(),
        vec!["BTC-27DEC24-50000-P"]
    );
    assert!(
        collector
            .available_options(Some("ETH"), None, None)
            .unwrap()
            .is_empty()
    );

    let info = collector.market_info("ETH-PERPETUAL").await.unwrap().unwrap();
    assert_eq!(info.base_currency.as_deref(), Some("ETH"));
    assert!(collector.market_info("DOGE-PERP").await.unwrap().is_none());

    assert_eq!(
        collector
            .subscribe_all_options(Some("BTC"), Some(OptionRight::Call), Some("27DEC24"))
            .unwrap(),
        1
    );
    assert_eq!(collector.subscribe_all_futures(Some("eth")).unwrap(), 1);
    assert_eq!(
        collector.subscribed(InstrumentKind::Option),
        vec!["BTC-27DEC24-50000-C"]
    );
    assert_eq!(collector.subscribed(InstrumentKind::Future), vec!["ETH-PERPETUAL"]);

    collector.stop().await;
}

#[tokio::test]
async fn market_info_loads_catalog_on_demand() {
    let venue = sim_venue("sim");
    let collector = Collector::with_venue(StreamConfig::new("sim"), venue);

    assert!(!collector.markets_loaded());
    assert!(collector.market_info("BTC-PERP").await.unwrap().is_some());
    assert!(collector.markets_loaded());
    assert!(!collector.is_running());
}

#[tokio::test]
async fn depth_is_requested_and_levels_reordered() {
    let venue = sim_venue("sim");
    let recorder = Arc::new(Recorder::default());
    let collector = started(
        fast_config("sim").with_depth(2).with_handler(recorder.clone()),
        &venue,
    )
    .await;

    collector.subscribe_options(&["BTC-27DEC24-50000-C"]).unwrap();
    venue.push_book(
        "BTC-27DEC24-50000-C",
        RawOrderbook::new(&[[0.04, 1.0], [0.05, 2.0], [0.01, 9.0]], &[[0.07, 1.0], [0.06, 1.0]]),
    );
    wait_until("update", || recorder.updates() == 1).await;

    assert_eq!(venue.last_depth(), 2);
    let book = collector.latest("BTC-27DEC24-50000-C").unwrap();
    assert_eq!(book.bids.len(), 2);
    assert!(book.is_well_ordered());
    assert_eq!(book.best_bid(), Some(0.05));
    assert_eq!(book.best_ask(), Some(0.06));
    assert!(collector.options_orderbooks().contains_key("BTC-27DEC24-50000-C"));

    collector.stop().await;
}

#[tokio::test]
async fn dropping_a_collector_ends_its_supervisors() {
    let venue: Arc<SimulatedVenue> = sim_venue("sim");
    venue.fail_always("BTC-PERP");
    let config = StreamConfig::new("sim").with_reconnect(std::time::Duration::from_millis(2), 1_000);
    let collector = started(config, &venue).await;

    collector.subscribe_futures(&["BTC-PERP"]).unwrap();
    wait_until("retries", || venue.watch_calls("BTC-PERP") >= 2).await;

    drop(collector);
    let calls = venue.watch_calls("BTC-PERP");
    settle().await;
    assert_eq!(venue.watch_calls("BTC-PERP"), calls);
}
