//! Telemetry & Calibration (§4.8): per-call counters, latency percentiles, and
//! an LLM-confidence reliability diagram (ECE/Brier) over the last N decisions.
//! Counters are plain atomics; the ring buffers use `std::sync::Mutex` over a
//! `VecDeque` rather than `parking_lot` — not a teacher dependency, and a bounded
//! mutex is exactly the "ambient, not exotic" texture this crate otherwise
//! follows.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex;

use statrs::statistics::{Data, Distribution, OrderStatistics};

const CALIBRATION_WINDOW: usize = 1000;
const LATENCY_WINDOW: usize = 1000;
const ECE_BINS: usize = 10;

pub const SLO_PARSE_RATE_MIN: f64 = 0.99;
pub const SLO_FALLBACK_RATE_MAX: f64 = 0.05;
pub const SLO_P95_LATENCY_MS_MAX: f64 = 2500.0;
pub const SLO_ECE_MAX: f64 = 0.10;

#[derive(Default)]
struct Counters {
    parse_ok: AtomicU64,
    parse_fail: AtomicU64,
    schema_fail: AtomicU64,
    transport_fail: AtomicU64,
    timeout: AtomicU64,
    fallback_used: AtomicU64,
    propose_total: AtomicU64,
}

pub struct Telemetry {
    counters: Counters,
    latencies_ms: Mutex<VecDeque<f64>>,
    calibration: Mutex<VecDeque<(f64, f64)>>,
    auto_degrade: AtomicBool,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct MetricsSnapshot {
    pub parse_ok: u64,
    pub parse_fail: u64,
    pub schema_fail: u64,
    pub transport_fail: u64,
    pub timeout: u64,
    pub fallback_used: u64,
    pub propose_total: u64,
    pub parse_rate: f64,
    pub fallback_rate: f64,
    pub p50_latency_ms: Option<f64>,
    pub p95_latency_ms: Option<f64>,
    pub ece: Option<f64>,
    pub brier: Option<f64>,
    pub auto_degrade: bool,
    pub slo_breaches: Vec<String>,
}

impl Default for Telemetry {
    fn default() -> Self {
        Self::new()
    }
}

impl Telemetry {
    pub fn new() -> Self {
        Self {
            counters: Counters::default(),
            latencies_ms: Mutex::new(VecDeque::with_capacity(LATENCY_WINDOW)),
            calibration: Mutex::new(VecDeque::with_capacity(CALIBRATION_WINDOW)),
            auto_degrade: AtomicBool::new(false),
        }
    }

    pub fn record_propose(&self) {
        self.counters.propose_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_parse_ok(&self) {
        self.counters.parse_ok.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_parse_fail(&self) {
        self.counters.parse_fail.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_schema_fail(&self) {
        self.counters.schema_fail.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_transport_fail(&self) {
        self.counters.transport_fail.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_timeout(&self) {
        self.counters.timeout.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_fallback_used(&self) {
        self.counters.fallback_used.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_latency_ms(&self, ms: f64) {
        let mut buf = self.latencies_ms.lock().expect("latency mutex poisoned");
        if buf.len() == LATENCY_WINDOW {
            buf.pop_front();
        }
        buf.push_back(ms);
    }

    /// `confidence` is the LLM-reported value; `reward_polarity` is `1.0` if the
    /// realized reward was positive, else `0.0` (§4.8).
    pub fn record_calibration_sample(&self, confidence: f64, reward_polarity: f64) {
        let mut buf = self.calibration.lock().expect("calibration mutex poisoned");
        if buf.len() == CALIBRATION_WINDOW {
            buf.pop_front();
        }
        buf.push_back((confidence, reward_polarity));
    }

    fn latency_percentiles(&self) -> (Option<f64>, Option<f64>) {
        let buf = self.latencies_ms.lock().expect("latency mutex poisoned");
        if buf.is_empty() {
            return (None, None);
        }
        let mut data = Data::new(buf.iter().copied().collect::<Vec<_>>());
        (Some(data.percentile(50)), Some(data.percentile(95)))
    }

    /// Expected Calibration Error over `ECE_BINS` equal-width confidence bins.
    fn ece(&self) -> Option<f64> {
        let buf = self.calibration.lock().expect("calibration mutex poisoned");
        if buf.is_empty() {
            return None;
        }
        let mut bin_conf = vec![0.0; ECE_BINS];
        let mut bin_acc = vec![0.0; ECE_BINS];
        let mut bin_count = vec![0u64; ECE_BINS];
        for &(conf, outcome) in buf.iter() {
            let bin = ((conf.clamp(0.0, 1.0) * ECE_BINS as f64) as usize).min(ECE_BINS - 1);
            bin_conf[bin] += conf;
            bin_acc[bin] += outcome;
            bin_count[bin] += 1;
        }
        let total = buf.len() as f64;
        let mut ece = 0.0;
        for i in 0..ECE_BINS {
            if bin_count[i] == 0 {
                continue;
            }
            let n = bin_count[i] as f64;
            let avg_conf = bin_conf[i] / n;
            let avg_acc = bin_acc[i] / n;
            ece += (n / total) * (avg_conf - avg_acc).abs();
        }
        Some(ece)
    }

    fn brier(&self) -> Option<f64> {
        let buf = self.calibration.lock().expect("calibration mutex poisoned");
        if buf.is_empty() {
            return None;
        }
        let squared_errors: Vec<f64> = buf.iter().map(|(c, o)| (c - o).powi(2)).collect();
        Data::new(squared_errors).mean()
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let parse_ok = self.counters.parse_ok.load(Ordering::Relaxed);
        let parse_fail = self.counters.parse_fail.load(Ordering::Relaxed);
        let fallback_used = self.counters.fallback_used.load(Ordering::Relaxed);
        let propose_total = self.counters.propose_total.load(Ordering::Relaxed).max(1);
        let parse_rate = parse_ok as f64 / (parse_ok + parse_fail).max(1) as f64;
        let fallback_rate = fallback_used as f64 / propose_total as f64;
        let (p50, p95) = self.latency_percentiles();
        let ece = self.ece();
        let brier = self.brier();

        let mut breaches = Vec::new();
        if parse_rate < SLO_PARSE_RATE_MIN {
            breaches.push(format!("parse_rate {parse_rate:.4} < {SLO_PARSE_RATE_MIN}"));
        }
        if fallback_rate > SLO_FALLBACK_RATE_MAX {
            breaches.push(format!("fallback_rate {fallback_rate:.4} > {SLO_FALLBACK_RATE_MAX}"));
        }
        if let Some(p95v) = p95 {
            if p95v > SLO_P95_LATENCY_MS_MAX {
                breaches.push(format!("p95_latency_ms {p95v:.1} > {SLO_P95_LATENCY_MS_MAX}"));
            }
        }
        if let Some(ecev) = ece {
            if ecev > SLO_ECE_MAX {
                breaches.push(format!("ece {ecev:.4} > {SLO_ECE_MAX}"));
            }
        }
        self.auto_degrade.store(!breaches.is_empty(), Ordering::Relaxed);

        MetricsSnapshot {
            parse_ok,
            parse_fail,
            schema_fail: self.counters.schema_fail.load(Ordering::Relaxed),
            transport_fail: self.counters.transport_fail.load(Ordering::Relaxed),
            timeout: self.counters.timeout.load(Ordering::Relaxed),
            fallback_used,
            propose_total: self.counters.propose_total.load(Ordering::Relaxed),
            parse_rate,
            fallback_rate,
            p50_latency_ms: p50,
            p95_latency_ms: p95,
            ece,
            brier,
            auto_degrade: self.auto_degrade.load(Ordering::Relaxed),
            slo_breaches: breaches,
        }
    }

    pub fn auto_degrade(&self) -> bool {
        self.auto_degrade.load(Ordering::Relaxed)
    }
}
