//! Lucro - cross-exchange spot/future spread scanner
//!
//! Last-trade feeds cover every cross-listed symbol all the time; order
//! book streams exist only while the scanner keeps asking for them. Books
//! are synchronized from REST snapshots plus contiguous diff streams, and
//! opportunities are priced by walking real depth at a target volume.

pub mod adjacency;
pub mod book;
pub mod catalog;
pub mod config;
pub mod exchanges;
pub mod report;
pub mod scanner;
pub mod streams;
pub mod sync;
pub mod tick_feed;
pub mod ticks;

// Re-export the common surface at the crate root
pub use book::{avg_price, BookStore, BookView, PriceLevel, VwapFill};
pub use catalog::MarketCatalog;
pub use exchanges::{Exchange, MarketKind, StreamKey};
pub use report::{OpportunityRecord, Reporter, ScanReport, Side};
pub use scanner::Scanner;
pub use streams::StreamManager;
