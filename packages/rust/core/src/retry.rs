//! The typed set of sources awaiting a retry pass.

use std::time::Duration;

use sourcewatch_shared::{FetchError, Source};

/// Longest base delay accepted from configuration, in seconds.
const MAX_BASE_DELAY_SECS: f64 = 30.0;

/// A source whose latest attempt failed.
#[derive(Debug, Clone)]
pub struct PendingRetry {
    /// Position of the source in the eligible list.
    pub index: usize,
    pub source: Source,
    pub last_error: FetchError,
}

/// Sources to attempt in the next retry pass, in eligible order.
#[derive(Debug, Default)]
pub struct RetryQueue {
    pending: Vec<PendingRetry>,
}

impl RetryQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, index: usize, source: Source, last_error: FetchError) {
        self.pending.push(PendingRetry {
            index,
            source,
            last_error,
        });
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    pub fn source_ids(&self) -> Vec<&str> {
        self.pending.iter().map(|p| p.source.id.as_str()).collect()
    }

    /// Take the queued retries, sorted by eligible position.
    pub fn drain(&mut self) -> Vec<PendingRetry> {
        let mut pending = std::mem::take(&mut self.pending);
        pending.sort_by_key(|p| p.index);
        pending
    }
}

/// Delay before retry pass `pass` (1-based): `base × 2^(pass-1)`, with the
/// base clamped to `0..=30` seconds.
pub fn retry_delay(base_secs: f64, pass: u32) -> Duration {
    let base = if base_secs.is_finite() {
        base_secs.clamp(0.0, MAX_BASE_DELAY_SECS)
    } else {
        0.0
    };
    let factor = 2f64.powi(pass.saturating_sub(1).min(16) as i32);
    Duration::from_secs_f64(base * factor)
}
