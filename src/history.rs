use std::collections::{HashMap, VecDeque};

use serde::Serialize;

use crate::config::{HISTORY_WINDOW_CAP, PRICE_RANGE_EPSILON, SPARKLINE_HEIGHT, SPARKLINE_WIDTH};
use crate::types::{Market, PriceSample};

/// Derived drawing data for one market's recent price movement.
#[derive(Debug, Clone, Serialize)]
pub struct Sparkline {
    /// SVG-style path through the window's yes-price values.
    pub path: String,
    /// Whole-window trend: last sample at or above the first.
    pub is_positive: bool,
    pub samples: usize,
}

/// Maintains the capped per-market rolling window of price samples and
/// derives sparkline paths and trend flags from it on demand.
///
/// The window is the only persisted state; every derivation is pure and
/// recomputed from the current window.
pub struct HistorySummarizer {
    windows: HashMap<String, VecDeque<PriceSample>>,
}

impl HistorySummarizer {
    pub fn new() -> Self {
        Self {
            windows: HashMap::new(),
        }
    }

    /// Append one sample per market present in the snapshot, evicting the
    /// oldest sample of any window past the cap (strict FIFO).
    pub fn record(&mut self, markets: &[Market], now_ms: u64) {
        for market in markets {
            let window = self
                .windows
                .entry(market.key().to_string())
                .or_insert_with(|| VecDeque::with_capacity(HISTORY_WINDOW_CAP));
            window.push_back(PriceSample {
                yes_price: market.yes_price,
                no_price: market.no_price,
                timestamp_ms: now_ms,
            });
            while window.len() > HISTORY_WINDOW_CAP {
                window.pop_front();
            }
        }
    }

    pub fn window(&self, market_id: &str) -> Option<&VecDeque<PriceSample>> {
        self.windows.get(market_id)
    }

    /// None if the market has never appeared in a recorded snapshot.
    pub fn sparkline(&self, market_id: &str) -> Option<Sparkline> {
        let window = self.windows.get(market_id)?;
        let values: Vec<f64> = window.iter().map(|s| s.yes_price).collect();
        Some(Sparkline {
            path: sparkline_path(&values, SPARKLINE_WIDTH, SPARKLINE_HEIGHT),
            is_positive: trend_is_positive(window),
            samples: window.len(),
        })
    }

    pub fn tracked_count(&self) -> usize {
        self.windows.len()
    }
}

impl Default for HistorySummarizer {
    fn default() -> Self {
        Self::new()
    }
}

/// Non-strict comparison of the window's endpoints: a flat window counts
/// as positive, as does an empty or single-sample one.
pub fn trend_is_positive(window: &VecDeque<PriceSample>) -> bool {
    match (window.front(), window.back()) {
        (Some(first), Some(last)) => last.yes_price >= first.yes_price,
        _ => true,
    }
}

/// Build a smooth path through `values`, normalized into a `width` ×
/// `height` box.
///
/// Values are min-max scaled (an epsilon stands in for a zero range), then
/// joined by quadratic segments whose control point is the previous sample
/// and whose endpoint is the midpoint to the next — the curve passes near,
/// not through, intermediate points; only the first point is exact. Fewer
/// than two samples degenerate to a flat line at vertical center.
pub fn sparkline_path(values: &[f64], width: f64, height: f64) -> String {
    if values.len() < 2 {
        let mid = height / 2.0;
        return format!("M {:.2} {mid:.2} L {width:.2} {mid:.2}", 0.0);
    }

    let min = values.iter().copied().fold(f64::INFINITY, f64::min);
    let max = values.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    let range = if max - min > 0.0 {
        max - min
    } else {
        PRICE_RANGE_EPSILON
    };

    let step = width / (values.len() - 1) as f64;
    let points: Vec<(f64, f64)> = values
        .iter()
        .enumerate()
        .map(|(i, v)| {
            let x = i as f64 * step;
            let y = height - (v - min) / range * height;
            (x, y)
        })
        .collect();

    let mut path = format!("M {:.2} {:.2}", points[0].0, points[0].1);
    for i in 1..points.len() {
        let (px, py) = points[i - 1];
        let (cx, cy) = points[i];
        let mid_x = (px + cx) / 2.0;
        let mid_y = (py + cy) / 2.0;
        path.push_str(&format!(" Q {px:.2} {py:.2} {mid_x:.2} {mid_y:.2}"));
    }
    path
}
