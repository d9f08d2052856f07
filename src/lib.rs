//! # Mapping Engine
//!
//! An enhanced data-mapping engine that turns declarative mapping rules into
//! deterministic record transformations, with:
//! - A universal type system (C1) that normalizes source-system native types
//! - Schema discovery (C2) with a TTL/LRU cache over connected systems
//! - A five-phase transformation pipeline (C3/C4): pre, transform, validation, post
//! - Four execution strategies (C5): sequential, batch, stream, parallel
//! - Per-run execution contexts (C6) with progress, retry, and metrics bookkeeping
//! - Error recovery and circuit breaking (C7)
//! - A performance optimizer and adaptive cache (C8)
//! - Pooled connections to downstream systems (C9)
//! - An engine facade (C10) tying the above together behind one entry point
//! - A brute-force/rate-limit state engine (C11)
//!
//! ## Usage
//!
//! ```rust
//! use mapping_engine::{Config, MappingEngine};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::from_env().unwrap_or_default();
//!     let engine = MappingEngine::new(Arc::new(config));
//!     let _ = engine.get_metrics();
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod context;
pub mod discovery;
pub mod engine;
pub mod error;
pub mod health;
pub mod metrics;
pub mod performance;
pub mod pipeline;
pub mod pool;
pub mod ratelimit;
pub mod recovery;
pub mod server;
pub mod stages;
pub mod strategies;
pub mod typemap;
pub mod types;

pub use config::Config;
pub use engine::{EngineEvent, EngineObserver, ExecuteOptions, MappingEngine};
pub use error::{MappingEngineError, Result};
pub use metrics::MetricsCollector;
pub use server::build_router;
pub use types::*;

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn engine_constructs_from_default_config() {
        let engine = MappingEngine::new(Arc::new(Config::default()));
        let metrics = engine.get_metrics();
        assert_eq!(metrics.total_executions, 0);
    }
}
