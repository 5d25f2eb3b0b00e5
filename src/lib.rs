//! Price tracking for amazon.sa products.
//!
//! [`tracker::PriceTracker`] refreshes tracked products and records price
//! history and notifications; [`deals::DealsBot`] seeds new products from the
//! marketplace's deal listings; [`scheduler::Scheduler`] drives both.

pub mod config;
pub mod database;
pub mod deals;
pub mod error;
pub mod extractor;
pub mod fetcher;
pub mod models;
pub mod notifier;
pub mod scheduler;
pub mod tracker;
pub mod traits;
