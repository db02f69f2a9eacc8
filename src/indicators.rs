use crate::broker::Bar;
use rust_decimal::Decimal;

/// True range of a bar given the previous close:
/// `max(H - L, |H - C_prev|, |L - C_prev|)`. The first bar of a window has
/// no previous close and uses `H - L`.
fn true_range(bar: &Bar, prev_close: Option<Decimal>) -> Decimal {
    let high = bar.high.value();
    let low = bar.low.value();
    let hl = high - low;
    match prev_close {
        Some(prev) => {
            let hc = (high - prev).abs();
            let lc = (low - prev).abs();
            hl.max(hc).max(lc)
        }
        None => hl,
    }
}

/// ATR(n): the plain arithmetic mean of the last `n` true ranges. Wilder
/// smoothing is deliberately not used. Returns `None` with fewer than `n`
/// bars.
pub fn atr(bars: &[Bar], period: usize) -> Option<Decimal> {
    if period == 0 || bars.len() < period {
        return None;
    }
    let window = &bars[bars.len() - period..];
    // Previous close for the first bar of the window, if history exists.
    let mut prev_close = if bars.len() > period {
        Some(bars[bars.len() - period - 1].close.value())
    } else {
        None
    };
    let mut sum = Decimal::ZERO;
    for bar in window {
        sum += true_range(bar, prev_close);
        prev_close = Some(bar.close.value());
    }
    Some(sum / Decimal::from(period as u64))
}

/// Mean volume over up to `period` most-recent bars. With fewer bars than
/// `period` the mean covers what is available; the caller is expected to log
/// the shortfall. Returns `None` for an empty slice.
pub fn sma_volume(bars: &[Bar], period: usize) -> Option<Decimal> {
    if bars.is_empty() || period == 0 {
        return None;
    }
    let take = period.min(bars.len());
    let window = &bars[bars.len() - take..];
    let sum: u64 = window.iter().map(|bar| bar.volume).sum();
    Some(Decimal::from(sum) / Decimal::from(take as u64))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Price;
    use chrono::{Duration, Utc};

    fn bar(open: &str, high: &str, low: &str, close: &str, volume: u64, idx: i64) -> Bar {
        Bar {
            ts: Utc::now() + Duration::minutes(idx),
            open: Price::from_str(open).unwrap(),
            high: Price::from_str(high).unwrap(),
            low: Price::from_str(low).unwrap(),
            close: Price::from_str(close).unwrap(),
            volume,
            cum_volume: 0,
        }
    }

    #[test]
    fn test_atr_flat_bars_with_fixed_range() {
        // 10 bars, each H-L = 0.10, open = close = 10.00
        let bars: Vec<Bar> = (0..10)
            .map(|i| bar("10.00", "10.05", "9.95", "10.00", 1000, i))
            .collect();
        assert_eq!(atr(&bars, 10), Some(Decimal::new(1, 1))); // 0.10
    }

    #[test]
    fn test_atr_uses_previous_close_gap() {
        // Gap up: second bar's range is small, but the gap from the prior
        // close dominates via |H - C_prev|.
        let bars = vec![
            bar("10.00", "10.10", "9.90", "10.00", 1000, 0),
            bar("11.00", "11.05", "10.95", "11.00", 1000, 1),
        ];
        // TR_0 = 0.20 (no prev close), TR_1 = max(0.10, 1.05, 0.95) = 1.05
        assert_eq!(atr(&bars, 2), Some(Decimal::new(625, 3))); // (0.20 + 1.05) / 2
    }

    #[test]
    fn test_atr_window_sees_close_before_window() {
        // With more bars than the period, the first in-window TR uses the
        // close of the bar just before the window.
        let bars = vec![
            bar("20.00", "20.00", "20.00", "20.00", 1000, 0),
            bar("10.00", "10.05", "9.95", "10.00", 1000, 1),
            bar("10.00", "10.05", "9.95", "10.00", 1000, 2),
        ];
        // Window = last 2 bars. TR for bar[1] = max(0.10, |10.05-20|, |9.95-20|) = 10.05
        let expected = (Decimal::new(1005, 2) + Decimal::new(10, 2)) / Decimal::from(2u64);
        assert_eq!(atr(&bars, 2), Some(expected));
    }

    #[test]
    fn test_atr_insufficient_bars() {
        let bars: Vec<Bar> = (0..9)
            .map(|i| bar("10.00", "10.05", "9.95", "10.00", 1000, i))
            .collect();
        assert_eq!(atr(&bars, 10), None);
    }

    #[test]
    fn test_sma_volume_full_window() {
        let bars: Vec<Bar> = (0..20)
            .map(|i| bar("10.00", "10.05", "9.95", "10.00", 1000, i))
            .collect();
        assert_eq!(sma_volume(&bars, 20), Some(Decimal::from(1000u64)));
    }

    #[test]
    fn test_sma_volume_short_window_uses_available() {
        let bars = vec![
            bar("10.00", "10.05", "9.95", "10.00", 600, 0),
            bar("10.00", "10.05", "9.95", "10.00", 1400, 1),
        ];
        assert_eq!(sma_volume(&bars, 20), Some(Decimal::from(1000u64)));
    }

    #[test]
    fn test_sma_volume_empty() {
        assert_eq!(sma_volume(&[], 20), None);
    }
}
