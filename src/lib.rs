// ------------------------------------------------------------
// Module declarations
// ------------------------------------------------------------
//
// Each module represents a well-defined responsibility:
//
// - snapshot:   Orderbook snapshot model and fixed-shape records
// - schema:     Instrument kinds, ticker schemas, outbound messages
// - config:     Stream and binary configuration loaded from JSON
// - logging:    Per-component logging handle
// - metrics:    Process-wide runtime counters
// - util:       Time and symbol helpers
// - venue:      Venue capability trait, registry and implementations
// - handler:    Consumer callback interface
// - collector:  Per-venue collector and per-symbol supervisors
// - aggregator: Multi-venue collector
// - sink:       WebSocket forwarding of records to a master service
//
pub mod aggregator;
pub mod collector;
pub mod config;
pub mod handler;
pub mod logging;
pub mod metrics;
pub mod schema;
pub mod sink;
pub mod snapshot;
pub mod util;
pub mod venue;

pub use aggregator::MultiVenueCollector;
pub use collector::supervisor::{ExitReason, SupervisorState};
pub use collector::{Collector, CollectorError};
pub use config::{Config, Credentials, StreamConfig};
pub use handler::StreamHandler;
pub use schema::InstrumentKind;
pub use snapshot::{OrderbookSnapshot, PriceLevel, Table};
pub use venue::{MarketInfo, MarketType, OptionRight, RawOrderbook, Venue, VenueError, VenueRegistry};
