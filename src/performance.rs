//! Performance Optimizer (C8): a complexity model over a mapping, a coarse
//! system-resource probe, a strategy recommender, and an adaptive cache with
//! optional value compression above a configured threshold.

use crate::strategies::StrategyOptions;
use crate::types::Mapping;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// `[0, 1]` weighted estimate of how expensive a mapping is to execute,
/// summing capped per-factor contributions rather than letting any one
/// factor (e.g. a mapping with hundreds of rules) dominate the score.
pub fn calculate_complexity(mapping: &Mapping) -> f64 {
    let rule_factor = (mapping.rules.len() as f64 / 20.0).min(1.0) * 0.35;
    let transform_count = mapping
        .rules
        .iter()
        .filter(|r| matches!(r, crate::types::Rule::Transform { .. } | crate::types::Rule::Formula { .. }))
        .count();
    let transform_factor = (transform_count as f64 / 10.0).min(1.0) * 0.2;
    let validation_factor = (mapping.validation_rules.len() as f64 / 10.0).min(1.0) * 0.15;
    let aggregation_factor = if mapping.aggregation.is_some() { 0.15 } else { 0.0 };
    let quality_factor = (mapping.quality_rules.len() as f64 / 10.0).min(1.0) * 0.15;

    (rule_factor + transform_factor + validation_factor + aggregation_factor + quality_factor).min(1.0)
}

/// A coarse, dependency-free read of how much headroom the process has.
/// `available_memory` and `cpu_usage` are heuristics, not precise OS
/// accounting -- good enough to drive the strategy recommender's policy.
#[derive(Debug, Clone, Copy)]
pub struct SystemResources {
    pub available_memory: f64,
    pub cpu_usage: f64,
    pub memory_pressure: f64,
}

/// Samples process-wide resource pressure. Real memory figures would need a
/// platform-specific probe (`/proc/self/status` on Linux); this keeps the
/// dependency-free default the optimizer falls back to when no external
/// sampler is wired in, following `num_cpus` as the only signal the teacher
/// already depends on for sizing concurrency.
pub fn get_system_resources() -> SystemResources {
    let cpus = num_cpus::get().max(1) as f64;
    let parallelism_headroom = (1.0 - (1.0 / cpus)).clamp(0.0, 1.0);
    SystemResources {
        available_memory: 0.6,
        cpu_usage: (1.0 - parallelism_headroom).clamp(0.0, 1.0),
        memory_pressure: 0.2,
    }
}

#[derive(Debug, Clone)]
pub struct StrategyRecommendation {
    pub options: StrategyOptions,
    pub reasons: Vec<String>,
}

const DEFAULT_MEMORY_PRESSURE_THRESHOLD: f64 = 0.8;

/// Policy table from spec section 4.8: small or small-and-complex inputs run
/// sequential; large, low-complexity inputs with headroom run parallel;
/// large, medium-complexity inputs run stream; everything else batches, with
/// batch size shrinking under memory pressure.
pub fn optimize_execution_strategy(data_size: usize, complexity: f64, resources: SystemResources) -> StrategyRecommendation {
    let mut reasons = Vec::new();

    if data_size <= 1 {
        reasons.push("single record: sequential".to_string());
        return StrategyRecommendation {
            options: StrategyOptions::Sequential { stop_on_error: false },
            reasons,
        };
    }

    if data_size < 50 && complexity > 0.7 {
        reasons.push(format!("small batch ({data_size}) with high complexity ({complexity:.2}): sequential"));
        return StrategyRecommendation {
            options: StrategyOptions::Sequential { stop_on_error: false },
            reasons,
        };
    }

    if data_size > 1000 && complexity < 0.3 && resources.available_memory > 0.5 {
        let parallelism = ((resources.available_memory * num_cpus::get() as f64).round() as usize).clamp(1, num_cpus::get());
        reasons.push(format!(
            "large ({data_size}), low complexity ({complexity:.2}), memory headroom ({:.2}): parallel x{parallelism}",
            resources.available_memory
        ));
        return StrategyRecommendation {
            options: StrategyOptions::Parallel {
                chunk_size: 100,
                max_concurrency: parallelism,
                record_timeout: Duration::from_secs(30),
            },
            reasons,
        };
    }

    if data_size > 500 && complexity < 0.6 {
        reasons.push(format!("large ({data_size}), medium complexity ({complexity:.2}): stream"));
        return StrategyRecommendation {
            options: StrategyOptions::Stream {
                high_water_mark: 16384,
                max_concurrency: num_cpus::get().max(2),
                backpressure_threshold: 1000,
            },
            reasons,
        };
    }

    let mut batch_size = 100usize;
    if resources.memory_pressure > DEFAULT_MEMORY_PRESSURE_THRESHOLD {
        batch_size = (batch_size / 2).max(1);
        reasons.push(format!("memory pressure {:.2} above threshold: shrinking batch size to {batch_size}", resources.memory_pressure));
    } else {
        reasons.push(format!("default policy: batch size {batch_size}"));
    }

    StrategyRecommendation {
        options: StrategyOptions::Batch {
            batch_size,
            max_batches: None,
            delay_between_batches: None,
            stop_on_error: false,
        },
        reasons,
    }
}

// ---------------------------------------------------------------------
// Adaptive cache
// ---------------------------------------------------------------------

struct CacheEntry {
    value: Vec<u8>,
    compressed: bool,
}

/// Bounded, LRU-evicting cache over arbitrary byte payloads, with optional
/// compression for values above `compression_threshold_bytes`. Backs the
/// engine facade's pipeline/result caches (spec 3's cache note) without
/// tying this module to either cache's key shape.
pub struct AdaptiveCache {
    entries: DashMap<String, CacheEntry>,
    order: Mutex<VecDeque<String>>,
    max_size: usize,
    compression_threshold_bytes: usize,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl AdaptiveCache {
    pub fn new(max_size: usize, compression_threshold_bytes: usize) -> Self {
        Self {
            entries: DashMap::new(),
            order: Mutex::new(VecDeque::new()),
            max_size,
            compression_threshold_bytes,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    pub fn get(&self, key: &str) -> Option<Vec<u8>> {
        match self.entries.get(key) {
            Some(entry) => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                Some(if entry.compressed { decompress(&entry.value) } else { entry.value.clone() })
            }
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    pub fn put(&self, key: impl Into<String>, value: Vec<u8>) {
        let key = key.into();
        let (stored, compressed) = if value.len() > self.compression_threshold_bytes {
            (compress(&value), true)
        } else {
            (value, false)
        };

        if !self.entries.contains_key(&key) {
            let mut order = self.order.lock();
            if order.len() >= self.max_size {
                if let Some(oldest) = order.pop_front() {
                    self.entries.remove(&oldest);
                }
            }
            order.push_back(key.clone());
        }
        self.entries.insert(key, CacheEntry { value: stored, compressed });
    }

    pub fn invalidate(&self, key: &str) {
        self.entries.remove(key);
        self.order.lock().retain(|k| k != key);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn hit_rate(&self) -> f64 {
        let hits = self.hits.load(Ordering::Relaxed) as f64;
        let misses = self.misses.load(Ordering::Relaxed) as f64;
        if hits + misses == 0.0 {
            0.0
        } else {
            hits / (hits + misses)
        }
    }
}

#[cfg(feature = "compression")]
fn compress(data: &[u8]) -> Vec<u8> {
    zstd::bulk::compress(data, 3).unwrap_or_else(|_| data.to_vec())
}

#[cfg(feature = "compression")]
fn decompress(data: &[u8]) -> Vec<u8> {
    // Upper bound: callers store only values produced by `compress` above,
    // so a generous fixed ceiling avoids needing the original length.
    zstd::bulk::decompress(data, 64 * 1024 * 1024).unwrap_or_else(|_| data.to_vec())
}

#[cfg(not(feature = "compression"))]
fn compress(data: &[u8]) -> Vec<u8> {
    data.to_vec()
}

#[cfg(not(feature = "compression"))]
fn decompress(data: &[u8]) -> Vec<u8> {
    data.to_vec()
}
