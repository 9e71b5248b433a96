//! Closed-bar cache
//!
//! Keeps the closed window of each timeframe between ticks so a warm session
//! only pulls the newest page from the exchange instead of re-paging the full
//! lookback. A page that does not reach back into the cached bars means bars
//! were missed; the caller then reloads the whole window.

use std::collections::HashMap;

use crate::{split_closed, Candle};

/// Candles requested per refresh once a timeframe is cached (one exchange page)
pub const REFRESH_PAGE: usize = 100;

/// A timeframe's closed bars and its in-progress bar
pub type Window = (Vec<Candle>, Option<Candle>);

#[derive(Debug, Clone, Default)]
pub struct BarCache {
    /// Key: timeframe string (e.g., "1h", "5m"). Value: closed bars, oldest first
    closed: HashMap<String, Vec<Candle>>,
}

impl BarCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Candles to request for `timeframe`: the full window when cold, one page when warm
    pub fn request_size(&self, timeframe: &str, limit: usize) -> usize {
        if self.closed.contains_key(timeframe) {
            limit.min(REFRESH_PAGE)
        } else {
            limit
        }
    }

    /// Cached closed bars for `timeframe`
    pub fn get(&self, timeframe: &str) -> Option<&[Candle]> {
        self.closed.get(timeframe).map(|v| v.as_slice())
    }

    /// Stores a freshly fetched full window, live bar last
    pub fn replace(&mut self, timeframe: &str, candles: &[Candle], limit: usize) -> Window {
        let (closed, live) = split_closed(candles);
        let keep = limit.saturating_sub(1);
        let closed = closed[closed.len().saturating_sub(keep)..].to_vec();
        self.closed.insert(timeframe.to_string(), closed.clone());
        (closed, live.cloned())
    }

    /// Folds the newest page into the cached bars.
    ///
    /// Cached bars older than the page's first closed bar are kept, the page
    /// overwrites the rest, and the result is trimmed to `limit - 1` closed
    /// bars. Returns `None` when nothing is cached or the page starts after the
    /// newest cached bar.
    pub fn merge(&mut self, timeframe: &str, page: &[Candle], limit: usize) -> Option<Window> {
        let (fresh, live) = split_closed(page);
        let cached = self.closed.get_mut(timeframe)?;
        let first = fresh.first()?.open_time;
        if cached.last().map_or(true, |newest| newest.open_time < first) {
            return None;
        }

        cached.retain(|c| c.open_time < first);
        cached.extend_from_slice(fresh);
        let keep = limit.saturating_sub(1);
        let excess = cached.len().saturating_sub(keep);
        cached.drain(..excess);
        Some((cached.clone(), live.cloned()))
    }
}
