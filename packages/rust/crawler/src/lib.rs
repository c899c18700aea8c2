//! Item graph crawling: per-node enrichment and depth-bounded traversal.
//!
//! This crate provides:
//! - [`chain`] — the ordered enrichment stages run for every visited node
//! - [`engine`] — the level-by-level crawler driving the chain
//! - [`relationships`] — edge extraction from relationship aspect payloads

pub mod chain;
pub mod engine;
pub mod relationships;

pub use chain::{EnrichmentChain, NodeReport};
pub use engine::{CrawlReport, CrawlStats, RecursiveCrawler};
pub use relationships::parse_edges;
