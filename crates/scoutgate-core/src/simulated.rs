//! Deterministic in-process market-data provider.
//!
//! Used by the CLI (no concrete upstream API ships with the workspace) and by
//! tests. Sources built with the same market seed produce identical candles on
//! a shared time grid, so they agree under cross-validation unless a price
//! bias is applied. Outages can be toggled per symbol or for the whole source.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::data_source::{
    MarketDataSource, SeriesRequest, SnapshotRequest, SourceError, SourceFuture,
};
use crate::{Instrument, MarketStats, OhlcvPoint, ProviderId, Symbol, UtcDateTime};

const DEFAULT_UNIVERSE: [&str; 10] = [
    "BTCUSDT", "ETHUSDT", "SOLUSDT", "BNBUSDT", "XRPUSDT", "ADAUSDT", "DOGEUSDT", "AVAXUSDT",
    "LINKUSDT", "DOTUSDT",
];

#[derive(Debug, Default)]
struct SimulatedState {
    outages: Mutex<HashSet<Symbol>>,
    down: AtomicBool,
    series_calls: AtomicU64,
    snapshot_calls: AtomicU64,
}

/// Seeded provider. Clones share outage switches and call counters.
#[derive(Debug, Clone)]
pub struct SimulatedSource {
    id: ProviderId,
    market_seed: u64,
    points: usize,
    price_bias: f64,
    latency: Duration,
    universe: Option<Arc<Vec<Instrument>>>,
    state: Arc<SimulatedState>,
}

impl SimulatedSource {
    pub fn new(id: ProviderId) -> Self {
        Self {
            id,
            market_seed: 7,
            points: 60,
            price_bias: 1.0,
            latency: Duration::ZERO,
            universe: None,
            state: Arc::new(SimulatedState::default()),
        }
    }

    pub fn with_seed(mut self, market_seed: u64) -> Self {
        self.market_seed = market_seed;
        self
    }

    /// Number of candles returned per series request.
    pub fn with_points(mut self, points: usize) -> Self {
        self.points = points;
        self
    }

    /// Multiply every price; `1.0` keeps agreement with unbiased sources.
    pub fn with_price_bias(mut self, price_bias: f64) -> Self {
        self.price_bias = price_bias;
        self
    }

    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    pub fn with_universe(mut self, universe: Vec<Instrument>) -> Self {
        self.universe = Some(Arc::new(universe));
        self
    }

    pub fn with_outage(self, symbol: Symbol) -> Self {
        self.set_outage(symbol, true);
        self
    }

    pub fn set_outage(&self, symbol: Symbol, failing: bool) {
        let mut outages = self
            .state
            .outages
            .lock()
            .expect("outage lock is not poisoned");
        if failing {
            outages.insert(symbol);
        } else {
            outages.remove(&symbol);
        }
    }

    /// Fail every request until switched back.
    pub fn set_down(&self, down: bool) {
        self.state.down.store(down, Ordering::SeqCst);
    }

    pub fn series_calls(&self) -> u64 {
        self.state.series_calls.load(Ordering::SeqCst)
    }

    pub fn snapshot_calls(&self) -> u64 {
        self.state.snapshot_calls.load(Ordering::SeqCst)
    }

    fn is_failing(&self, symbol: &Symbol) -> bool {
        self.state.down.load(Ordering::SeqCst)
            || self
                .state
                .outages
                .lock()
                .expect("outage lock is not poisoned")
                .contains(symbol)
    }

    fn universe(&self) -> Vec<Instrument> {
        match &self.universe {
            Some(universe) => universe.as_ref().clone(),
            None => DEFAULT_UNIVERSE
                .iter()
                .filter_map(|raw| Symbol::parse(raw).ok())
                .filter_map(|symbol| self.instrument_for(symbol))
                .collect(),
        }
    }

    fn instrument_for(&self, symbol: Symbol) -> Option<Instrument> {
        let mut rng = fastrand::Rng::with_seed(symbol_hash(&symbol) ^ self.market_seed);
        let price = base_price(&symbol) * self.price_bias;
        let volume = 50_000.0 + rng.f64() * 50_000_000.0;
        let change = rng.f64() * 16.0 - 8.0;
        let supply = 1_000_000.0 + rng.f64() * 500_000_000.0;
        let stats = MarketStats::new(price, volume, change, Some(price * supply)).ok()?;
        Some(Instrument::new(symbol, stats))
    }

    fn series_for(&self, request: &SeriesRequest) -> Result<Vec<OhlcvPoint>, SourceError> {
        let step_ms = i64::try_from(request.timeframe.step().as_millis()).unwrap_or(i64::MAX);
        let now_ms = UtcDateTime::now().unix_millis();
        let end_ms = now_ms - now_ms.rem_euclid(step_ms);

        let hash = symbol_hash(&request.instrument);
        let mut rng = fastrand::Rng::with_seed(hash ^ self.market_seed);
        let drift = ((hash % 7) as f64 - 3.0) * 0.001;
        let mut close = base_price(&request.instrument);

        let mut points = Vec::with_capacity(self.points);
        for index in 0..self.points {
            let open = close;
            close = (open * (1.0 + drift + rng.f64() * 0.02 - 0.01)).max(0.0001);
            let high = open.max(close) * (1.0 + rng.f64() * 0.005);
            let low = open.min(close) * (1.0 - rng.f64() * 0.005);
            let volume = 1_000.0 + rng.f64() * 5_000.0;

            let offset = (self.points - 1 - index) as i64;
            let ts = UtcDateTime::from_unix_millis(end_ms - offset * step_ms);
            points.push(OhlcvPoint::new(
                ts,
                open * self.price_bias,
                high * self.price_bias,
                low * self.price_bias,
                close * self.price_bias,
                volume,
            )?);
        }
        Ok(points)
    }

    async fn simulate_latency(&self) {
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
    }
}

impl MarketDataSource for SimulatedSource {
    fn id(&self) -> ProviderId {
        self.id.clone()
    }

    fn fetch_series<'a>(&'a self, req: SeriesRequest) -> SourceFuture<'a, Vec<OhlcvPoint>> {
        Box::pin(async move {
            self.state.series_calls.fetch_add(1, Ordering::SeqCst);
            self.simulate_latency().await;
            if self.is_failing(&req.instrument) {
                return Err(SourceError::unavailable(format!(
                    "{} is not serving {}",
                    self.id, req.instrument
                )));
            }
            self.series_for(&req)
        })
    }

    fn fetch_snapshot<'a>(&'a self, req: SnapshotRequest) -> SourceFuture<'a, Vec<Instrument>> {
        Box::pin(async move {
            self.state.snapshot_calls.fetch_add(1, Ordering::SeqCst);
            self.simulate_latency().await;
            if self.state.down.load(Ordering::SeqCst) {
                return Err(SourceError::unavailable(format!("{} is down", self.id)));
            }

            let universe = self.universe();
            let Some(requested) = req.instruments else {
                return Ok(universe);
            };
            Ok(requested
                .into_iter()
                .filter_map(|symbol| {
                    universe
                        .iter()
                        .find(|candidate| candidate.symbol == symbol)
                        .cloned()
                        .or_else(|| self.instrument_for(symbol))
                })
                .collect())
        })
    }
}

/// FNV-1a over the symbol bytes.
fn symbol_hash(symbol: &Symbol) -> u64 {
    symbol
        .as_str()
        .bytes()
        .fold(0xcbf2_9ce4_8422_2325_u64, |hash, byte| {
            (hash ^ u64::from(byte)).wrapping_mul(0x0100_0000_01b3)
        })
}

fn base_price(symbol: &Symbol) -> f64 {
    1.0 + (symbol_hash(symbol) % 100_000) as f64 / 100.0
}
