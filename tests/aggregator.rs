mod common;

use std::sync::Arc;

use deriv_book_collector::venue::sim::SimulatedVenue;
use deriv_book_collector::{
    CollectorError, MultiVenueCollector, RawOrderbook, Venue, VenueError, VenueRegistry,
};

use common::{fast_config, sim_venue, wait_until};

fn registry(venues: &[&Arc<SimulatedVenue>]) -> VenueRegistry {
    let mut registry = VenueRegistry::new();
    for venue in venues {
        let venue = Arc::clone(venue);
        registry.register(venue.id().to_string(), move |_| {
            Arc::clone(&venue) as Arc<dyn Venue>
        });
    }
    registry
}

#[tokio::test]
async fn compare_returns_one_row_per_venue() {
    let alpha = sim_venue("alpha");
    let beta = sim_venue("beta");
    let mut multi = MultiVenueCollector::new(registry(&[&alpha, &beta]));

    assert!(multi.add_venue(fast_config("alpha")).await.unwrap());
    assert!(multi.add_venue(fast_config("beta")).await.unwrap());
    assert_eq!(multi.venues(), vec!["alpha", "beta"]);

    for (venue, bid) in [(&alpha, 100.0), (&beta, 100.5)] {
        let id = venue.id().to_string();
        let collector = multi.collector(&id).unwrap();
        collector.subscribe_futures(&["BTC-PERP"]).unwrap();
        venue.push_book("BTC-PERP", RawOrderbook::new(&[[bid, 1.0]], &[[bid + 1.0, 1.0]]));
    }

    wait_until("both venues", || {
        multi.venues().iter().all(|v| {
            multi
                .collector(v)
                .is_some_and(|c| c.latest("BTC-PERP").is_some())
        })
    })
    .await;

    let table = multi.compare("BTC-PERP");
    assert_eq!(table.len(), 2);
    assert_eq!(table.column("venue"), vec!["alpha", "beta"]);
    assert_eq!(table.column("best_bid"), vec![100.0, 100.5]);
    assert_eq!(table.column("best_ask"), vec![101.0, 101.5]);

    assert!(multi.compare("ETH-PERPETUAL").is_empty());

    let all = multi.all_orderbooks();
    assert_eq!(all.len(), 2);
    assert!(all["beta"].contains_key("BTC-PERP"));

    multi.stop_all().await;
    assert!(multi.venues().is_empty());
    assert!(alpha.is_closed() && beta.is_closed());
}

#[tokio::test]
async fn adding_a_venue_twice_keeps_the_first() {
    let alpha = sim_venue("alpha");
    let mut multi = MultiVenueCollector::new(registry(&[&alpha]));

    assert!(multi.add_venue(fast_config("alpha")).await.unwrap());
    multi
        .collector("alpha")
        .unwrap()
        .subscribe_futures(&["BTC-PERP"])
        .unwrap();

    assert!(!multi.add_venue(fast_config("alpha").with_depth(1)).await.unwrap());
    assert_eq!(multi.venues(), vec!["alpha"]);

    let kept = multi.collector("alpha").unwrap();
    assert_eq!(kept.config().depth, 20);
    assert!(kept.is_subscribed("BTC-PERP"));

    multi.stop_all().await;
}

#[tokio::test]
async fn failed_venues_are_not_registered() {
    let alpha = sim_venue("alpha");
    alpha.set_unreachable(true);
    let mut multi = MultiVenueCollector::new(registry(&[&alpha]));

    assert!(matches!(
        multi.add_venue(fast_config("alpha")).await,
        Err(CollectorError::Venue(VenueError::Connect(_)))
    ));
    assert!(matches!(
        multi.add_venue(fast_config("gamma")).await,
        Err(CollectorError::UnknownVenue(_))
    ));
    assert!(multi.venues().is_empty());
    assert!(multi.compare("BTC-PERP").is_empty());

    multi.stop_all().await;
}
