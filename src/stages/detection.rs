use crate::broker::{Bar, BrokerBridge, QuoteSnapshot};
use crate::config::DetectionConfig;
use crate::error::EngineError;
use crate::indicators::{atr, sma_volume};
use crate::model::{Direction, TickerEvent, TradeSignal};
use crate::shutdown::Shutdown;
use crate::stages::{ExecCommand, DRAIN_DEADLINE};
use crate::types::{Price, Symbol};
use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use rust_decimal::Decimal;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;

/// Combined deadline for the parallel bar fetch + snapshot.
const COMBINED_FETCH_DEADLINE: Duration = Duration::from_secs(2);

/// One retry on a failed bar fetch, after this delay.
const BAR_RETRY_DELAY: Duration = Duration::from_millis(500);

const BAR_SIZE: &str = "1 min";
/// 10 closed bars for ATR plus the vendor's in-progress bar.
const BAR_COUNT: u32 = 11;
const ATR_PERIOD: usize = 10;
const VOLUME_SMA_PERIOD: usize = 20;

/// A shock verdict: direction, entry reference, and protective stop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Shock {
    pub direction: Direction,
    pub signal_price: Price,
    pub stop_price: Price,
}

/// Evaluates whether a news-referenced ticker is exhibiting a coincident
/// price and volume shock in the current minute bar. A fixed-size worker
/// pool shares the inbound ticker queue; each worker may have several broker
/// requests in flight.
pub struct DetectionStage {
    bridge: Arc<BrokerBridge>,
    config: DetectionConfig,
    cooldowns: Mutex<HashMap<Symbol, Instant>>,
}

impl DetectionStage {
    pub fn new(bridge: Arc<BrokerBridge>, config: DetectionConfig) -> Arc<Self> {
        Arc::new(Self {
            bridge,
            config,
            cooldowns: Mutex::new(HashMap::new()),
        })
    }

    /// Spawn the worker pool over a shared ticker queue.
    pub fn spawn_workers(
        stage: Arc<Self>,
        tickers: mpsc::Receiver<TickerEvent>,
        signals: mpsc::Sender<ExecCommand>,
        shutdown: Shutdown,
    ) -> Vec<tokio::task::JoinHandle<()>> {
        let shared = Arc::new(tokio::sync::Mutex::new(tickers));
        (0..stage.config.worker_count.max(1))
            .map(|worker_id| {
                let stage = Arc::clone(&stage);
                let shared = Arc::clone(&shared);
                let signals = signals.clone();
                let mut shutdown = shutdown.clone();
                tokio::spawn(async move {
                    debug!("detection worker {} started", worker_id);
                    loop {
                        // Hold the queue lock only while waiting for an item.
                        let ticker = {
                            let mut rx = shared.lock().await;
                            tokio::select! {
                                ticker = rx.recv() => ticker,
                                _ = shutdown.cancelled() => None,
                            }
                        };
                        match ticker {
                            Some(ticker) => stage.evaluate(ticker, &signals).await,
                            None => {
                                if shutdown.is_cancelled() {
                                    let deadline = Instant::now() + DRAIN_DEADLINE;
                                    while Instant::now() < deadline {
                                        let next = shared.lock().await.try_recv();
                                        match next {
                                            Ok(ticker) => stage.evaluate(ticker, &signals).await,
                                            Err(_) => break,
                                        }
                                    }
                                }
                                break;
                            }
                        }
                    }
                    debug!("detection worker {} stopped", worker_id);
                })
            })
            .collect()
    }

    async fn evaluate(&self, ticker: TickerEvent, signals: &mpsc::Sender<ExecCommand>) {
        let symbol = ticker.symbol.clone();
        if self.in_cooldown(&symbol) {
            debug!("{}: in cooldown, skipping article {}", symbol, ticker.article_id);
            return;
        }

        let fetch = async {
            tokio::join!(
                self.fetch_bars_with_retry(&symbol),
                self.bridge.snapshot_quote(&symbol)
            )
        };
        let (bars, snapshot) = match tokio::time::timeout(COMBINED_FETCH_DEADLINE, fetch).await {
            Ok((Ok(bars), Ok(snapshot))) => (bars, snapshot),
            Ok((Err(err), _)) => {
                warn!("{}: bar fetch failed: {}", symbol, err);
                return;
            }
            Ok((_, Err(err))) => {
                warn!("{}: snapshot failed: {}", symbol, err);
                return;
            }
            Err(_) => {
                warn!(
                    "{}: market data not ready within {:?}, aborting evaluation",
                    symbol, COMBINED_FETCH_DEADLINE
                );
                return;
            }
        };

        match shock_decision(&bars, &snapshot, &self.config, Utc::now()) {
            Ok(Some(shock)) => {
                let signal = TradeSignal {
                    symbol: symbol.clone(),
                    direction: shock.direction,
                    signal_price: shock.signal_price,
                    stop_price: shock.stop_price,
                    created_at: Utc::now(),
                    origin_article_id: ticker.article_id.clone(),
                };
                self.start_cooldown(&symbol);
                info!(
                    "{}: shock detected ({} @ {}, stop {}) from article {}",
                    symbol,
                    signal.direction,
                    signal.signal_price,
                    signal.stop_price,
                    ticker.article_id
                );
                if signals.send(ExecCommand::Entry(signal)).await.is_err() {
                    warn!("signal queue closed, dropping signal for {}", symbol);
                }
            }
            Ok(None) => {
                debug!("{}: no shock for article {}", symbol, ticker.article_id);
            }
            Err(err) => {
                debug!("{}: evaluation aborted: {}", symbol, err);
            }
        }
    }

    async fn fetch_bars_with_retry(&self, symbol: &Symbol) -> Result<Vec<Bar>, EngineError> {
        match self
            .bridge
            .fetch_historical_bars(symbol, BAR_SIZE, BAR_COUNT)
            .await
        {
            Ok(bars) => Ok(bars),
            Err(first_err) => {
                debug!("{}: bar fetch failed once ({}), retrying", symbol, first_err);
                tokio::time::sleep(BAR_RETRY_DELAY).await;
                self.bridge
                    .fetch_historical_bars(symbol, BAR_SIZE, BAR_COUNT)
                    .await
            }
        }
    }

    fn in_cooldown(&self, symbol: &Symbol) -> bool {
        let window = Duration::from_secs(self.config.cooldown_secs);
        let mut cooldowns = self.cooldowns.lock().expect("cooldown table poisoned");
        let now = Instant::now();
        cooldowns.retain(|_, fired| now.duration_since(*fired) < window);
        cooldowns.contains_key(symbol)
    }

    fn start_cooldown(&self, symbol: &Symbol) {
        self.cooldowns
            .lock()
            .expect("cooldown table poisoned")
            .insert(symbol.clone(), Instant::now());
    }
}

/// The shock-detection kernel, pure for testability.
///
/// The fetched window holds the vendor's forming bar; anything whose minute
/// has not elapsed at `now` is discarded and the 10 most recent closed bars
/// remain. The in-progress bar is then synthesized as
/// `{open: last_closed.close, close: snapshot.price,
///   volume: snapshot.cum_volume - last_closed.cum_volume}`.
pub fn shock_decision(
    bars: &[Bar],
    snapshot: &QuoteSnapshot,
    config: &DetectionConfig,
    now: DateTime<Utc>,
) -> Result<Option<Shock>, EngineError> {
    let closed: Vec<Bar> = bars
        .iter()
        .filter(|bar| bar.ts + chrono::Duration::seconds(60) <= now)
        .cloned()
        .collect();
    if closed.len() < ATR_PERIOD {
        return Err(EngineError::DataQuality(format!(
            "only {} closed bars, need {}",
            closed.len(),
            ATR_PERIOD
        )));
    }
    let window = &closed[closed.len() - ATR_PERIOD..];

    let atr10 = atr(window, ATR_PERIOD)
        .ok_or_else(|| EngineError::DataQuality("ATR window underflow".to_string()))?;
    if atr10 <= Decimal::ZERO {
        return Err(EngineError::DataQuality("ATR is zero, range-less bars".to_string()));
    }

    if closed.len() < VOLUME_SMA_PERIOD {
        debug!(
            "volume SMA over {} bars instead of {}",
            closed.len().min(VOLUME_SMA_PERIOD),
            VOLUME_SMA_PERIOD
        );
    }
    let vol_sma = sma_volume(&closed, VOLUME_SMA_PERIOD)
        .ok_or_else(|| EngineError::DataQuality("no bars for volume SMA".to_string()))?;
    if vol_sma <= Decimal::ZERO {
        return Err(EngineError::DataQuality("volume SMA is zero".to_string()));
    }

    let last_closed = &window[ATR_PERIOD - 1];
    let cur_open = last_closed.close;
    let cur_close = snapshot.price;
    let cur_volume = snapshot.cum_volume.saturating_sub(last_closed.cum_volume);

    // Price shock: |close - open| / open > (ATR / open) * mult, which
    // reduces to |Δ| > ATR * mult.
    let delta = (cur_close - cur_open).abs().value();
    let price_shock = delta > atr10 * config.price_mult;
    let volume_shock = Decimal::from(cur_volume) > vol_sma * config.vol_mult;
    if !(price_shock && volume_shock) {
        return Ok(None);
    }

    let direction = if cur_close > cur_open {
        Direction::Long
    } else {
        Direction::Short
    };
    let stop_price = match direction {
        Direction::Long => Price::new(cur_open.value() - atr10),
        Direction::Short => Price::new(cur_open.value() + atr10),
    };
    Ok(Some(Shock {
        direction,
        signal_price: cur_close,
        stop_price,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;

    /// 10 closed flat bars: open = close = 10.00, H-L = 0.10, volume 1000.
    /// ATR(10) = 0.10, volume SMA = 1000.
    fn baseline_bars(now: DateTime<Utc>) -> Vec<Bar> {
        (0..10)
            .map(|i| {
                let ts = now - ChronoDuration::minutes(11 - i);
                Bar {
                    ts,
                    open: Price::from_str("10.00").unwrap(),
                    high: Price::from_str("10.05").unwrap(),
                    low: Price::from_str("9.95").unwrap(),
                    close: Price::from_str("10.00").unwrap(),
                    volume: 1000,
                    cum_volume: 1000 * (i as u64 + 1),
                }
            })
            .collect()
    }

    fn config() -> DetectionConfig {
        DetectionConfig::default()
    }

    #[test]
    fn test_happy_path_long_shock() {
        let now = Utc::now();
        let bars = baseline_bars(now);
        // Current-bar volume = 16000 - 10000 = 6000 > 1000 * 5.0
        let snapshot = QuoteSnapshot {
            price: Price::from_str("10.40").unwrap(),
            cum_volume: 16_000,
        };

        let shock = shock_decision(&bars, &snapshot, &config(), now)
            .unwrap()
            .unwrap();
        assert_eq!(shock.direction, Direction::Long);
        assert_eq!(shock.signal_price, Price::from_str("10.40").unwrap());
        assert_eq!(shock.stop_price, Price::from_str("9.90").unwrap());
    }

    #[test]
    fn test_short_shock_places_stop_above_open() {
        let now = Utc::now();
        let bars = baseline_bars(now);
        let snapshot = QuoteSnapshot {
            price: Price::from_str("9.60").unwrap(),
            cum_volume: 16_000,
        };

        let shock = shock_decision(&bars, &snapshot, &config(), now)
            .unwrap()
            .unwrap();
        assert_eq!(shock.direction, Direction::Short);
        assert_eq!(shock.stop_price, Price::from_str("10.10").unwrap());
    }

    #[test]
    fn test_volume_shock_alone_is_rejected() {
        let now = Utc::now();
        let bars = baseline_bars(now);
        // |Δ| = 0.20 is not > 0.30; volume alone does not fire.
        let snapshot = QuoteSnapshot {
            price: Price::from_str("10.20").unwrap(),
            cum_volume: 19_000,
        };

        assert_eq!(shock_decision(&bars, &snapshot, &config(), now).unwrap(), None);
    }

    #[test]
    fn test_price_shock_alone_is_rejected() {
        let now = Utc::now();
        let bars = baseline_bars(now);
        // Volume delta = 2000 is not > 5000.
        let snapshot = QuoteSnapshot {
            price: Price::from_str("10.40").unwrap(),
            cum_volume: 12_000,
        };

        assert_eq!(shock_decision(&bars, &snapshot, &config(), now).unwrap(), None);
    }

    #[test]
    fn test_boundary_is_strict() {
        let now = Utc::now();
        let bars = baseline_bars(now);
        // |Δ| = 0.30 equals ATR * mult exactly; the rule is strict `>`.
        let snapshot = QuoteSnapshot {
            price: Price::from_str("10.30").unwrap(),
            cum_volume: 16_000,
        };

        assert_eq!(shock_decision(&bars, &snapshot, &config(), now).unwrap(), None);
    }

    #[test]
    fn test_fewer_than_ten_closed_bars_aborts() {
        let now = Utc::now();
        let mut bars = baseline_bars(now);
        bars.truncate(9);
        let snapshot = QuoteSnapshot {
            price: Price::from_str("10.40").unwrap(),
            cum_volume: 16_000,
        };

        let err = shock_decision(&bars, &snapshot, &config(), now).unwrap_err();
        assert!(matches!(err, EngineError::DataQuality(_)));
    }

    #[test]
    fn test_forming_bar_is_discarded() {
        let now = Utc::now();
        let mut bars = baseline_bars(now);
        // Vendor appends the in-progress bar; its minute has not elapsed.
        bars.push(Bar {
            ts: now - ChronoDuration::seconds(20),
            open: Price::from_str("10.00").unwrap(),
            high: Price::from_str("10.40").unwrap(),
            low: Price::from_str("10.00").unwrap(),
            close: Price::from_str("10.40").unwrap(),
            volume: 6000,
            cum_volume: 16_000,
        });
        let snapshot = QuoteSnapshot {
            price: Price::from_str("10.40").unwrap(),
            cum_volume: 16_000,
        };

        // The forming bar must not contaminate ATR; the verdict matches the
        // 10-closed-bar case exactly.
        let shock = shock_decision(&bars, &snapshot, &config(), now)
            .unwrap()
            .unwrap();
        assert_eq!(shock.stop_price, Price::from_str("9.90").unwrap());
    }

    #[test]
    fn test_zero_atr_aborts() {
        let now = Utc::now();
        let flat = Price::from_str("10.00").unwrap();
        let bars: Vec<Bar> = (0..10)
            .map(|i| Bar {
                ts: now - ChronoDuration::minutes(11 - i),
                open: flat,
                high: flat,
                low: flat,
                close: flat,
                volume: 1000,
                cum_volume: 1000 * (i as u64 + 1),
            })
            .collect();
        let snapshot = QuoteSnapshot {
            price: Price::from_str("10.40").unwrap(),
            cum_volume: 16_000,
        };

        let err = shock_decision(&bars, &snapshot, &config(), now).unwrap_err();
        assert!(matches!(err, EngineError::DataQuality(_)));
    }
}
