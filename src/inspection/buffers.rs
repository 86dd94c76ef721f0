//! Per-signal ring buffers and fixed-window aggregators
//!
//! All state here is local to the inspection engine task; there are no
//! locks on the hot path. Buffers are allocated when the inspection matrix
//! first requires a signal and freed when no campaign references it.

use crate::campaign::SignalNeed;
use crate::expression::{InspectionValue, SignalReader, WindowFunction};
use crate::types::{SignalId, SignalSample, SignalValue};
use std::collections::{HashMap, VecDeque};

/// Completed-window aggregate.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WindowStats {
    pub min: f64,
    pub max: f64,
    pub sum: f64,
    pub count: u64,
}

impl WindowStats {
    fn avg(&self) -> f64 {
        if self.count == 0 {
            0.0
        } else {
            self.sum / self.count as f64
        }
    }
}

/// Rolling aggregator over wall-clock-aligned windows of fixed size.
///
/// A window covering `[k·W, (k+1)·W)` completes when a sample at or past
/// its end arrives; the two most recently completed windows stay queryable.
#[derive(Debug)]
pub struct FixedWindow {
    period_ms: u64,
    window_start_ms: Option<u64>,
    current: Option<WindowStats>,
    last: Option<WindowStats>,
    prev_last: Option<WindowStats>,
}

impl FixedWindow {
    pub fn new(period_ms: u64) -> Self {
        Self {
            period_ms,
            window_start_ms: None,
            current: None,
            last: None,
            prev_last: None,
        }
    }

    pub fn add(&mut self, timestamp_ms: u64, value: f64) {
        let aligned = timestamp_ms - timestamp_ms % self.period_ms;
        match self.window_start_ms {
            Some(start) if aligned == start => {}
            Some(start) if aligned > start => {
                // Window boundary crossed; the current window completes.
                self.prev_last = self.last;
                self.last = self.current.take();
                self.window_start_ms = Some(aligned);
            }
            Some(_) => {
                // Sample from before the current window (clock step or
                // source replay): ignore rather than corrupt the roll.
                return;
            }
            None => self.window_start_ms = Some(aligned),
        }

        let stats = self.current.get_or_insert(WindowStats {
            min: value,
            max: value,
            sum: 0.0,
            count: 0,
        });
        stats.min = stats.min.min(value);
        stats.max = stats.max.max(value);
        stats.sum += value;
        stats.count += 1;
    }

    pub fn query(&self, func: WindowFunction) -> InspectionValue {
        let stats = match func {
            WindowFunction::LastWindowMin
            | WindowFunction::LastWindowMax
            | WindowFunction::LastWindowAvg => self.last,
            WindowFunction::PrevLastWindowMin
            | WindowFunction::PrevLastWindowMax
            | WindowFunction::PrevLastWindowAvg => self.prev_last,
        };
        let Some(stats) = stats else {
            return InspectionValue::Undefined;
        };
        let value = match func {
            WindowFunction::LastWindowMin | WindowFunction::PrevLastWindowMin => stats.min,
            WindowFunction::LastWindowMax | WindowFunction::PrevLastWindowMax => stats.max,
            WindowFunction::LastWindowAvg | WindowFunction::PrevLastWindowAvg => stats.avg(),
        };
        InspectionValue::Number(value)
    }
}

/// Buffered history of one signal.
#[derive(Debug)]
struct SignalState {
    capacity: usize,
    /// Arrival order; oldest evicted first.
    ring: VecDeque<SignalSample>,
    latest: Option<SignalValue>,
    windows: HashMap<u64, FixedWindow>,
}

/// The engine's signal-keyed buffer store.
#[derive(Debug, Default)]
pub struct SignalBufferSet {
    signals: HashMap<SignalId, SignalState>,
}

impl SignalBufferSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Re-shape buffers to a new matrix's requirements. Kept signals
    /// retain their history (truncated to the new capacity); dropped
    /// signals are freed.
    pub fn reconfigure(&mut self, required: &HashMap<SignalId, SignalNeed>) {
        self.signals.retain(|signal_id, _| required.contains_key(signal_id));

        for (signal_id, need) in required {
            let capacity = need.max_sample_buffer.max(1) as usize;
            let state = self.signals.entry(*signal_id).or_insert_with(|| SignalState {
                capacity,
                ring: VecDeque::with_capacity(capacity),
                latest: None,
                windows: HashMap::new(),
            });
            state.capacity = capacity;
            while state.ring.len() > capacity {
                state.ring.pop_front();
            }
            state
                .windows
                .retain(|period, _| need.window_periods_ms.contains(period));
            for period in &need.window_periods_ms {
                state
                    .windows
                    .entry(*period)
                    .or_insert_with(|| FixedWindow::new(*period));
            }
        }
    }

    /// Whether the matrix requires this signal at all.
    pub fn tracks(&self, signal_id: SignalId) -> bool {
        self.signals.contains_key(&signal_id)
    }

    /// Ingest one sample: ring buffer, latest value, and every fixed
    /// window referencing the signal.
    pub fn ingest(&mut self, sample: &SignalSample) {
        let Some(state) = self.signals.get_mut(&sample.signal_id) else {
            return;
        };

        if state.ring.len() >= state.capacity {
            state.ring.pop_front();
        }
        state.ring.push_back(sample.clone());
        state.latest = Some(sample.value.clone());

        if let Some(numeric) = sample.value.as_f64() {
            for window in state.windows.values_mut() {
                window.add(sample.timestamp_ms, numeric);
            }
        }
    }

    /// Snapshot the newest `count` samples, oldest first, thinning any
    /// that arrived closer than `min_period_ms` to the previously kept
    /// one.
    pub fn snapshot(
        &self,
        signal_id: SignalId,
        count: u32,
        min_period_ms: u64,
    ) -> Vec<SignalSample> {
        let Some(state) = self.signals.get(&signal_id) else {
            return Vec::new();
        };

        // Walk newest → oldest keeping thinned samples, then restore order.
        let mut kept: Vec<&SignalSample> = Vec::with_capacity(count as usize);
        let mut last_kept_ts: Option<u64> = None;
        for sample in state.ring.iter().rev() {
            if kept.len() >= count as usize {
                break;
            }
            if let Some(ts) = last_kept_ts {
                if min_period_ms > 0 && ts.saturating_sub(sample.timestamp_ms) < min_period_ms {
                    continue;
                }
            }
            last_kept_ts = Some(sample.timestamp_ms);
            kept.push(sample);
        }
        kept.into_iter().rev().cloned().collect()
    }
}

impl SignalReader for SignalBufferSet {
    fn latest(&self, signal_id: SignalId) -> InspectionValue {
        let Some(value) = self.signals.get(&signal_id).and_then(|s| s.latest.as_ref()) else {
            return InspectionValue::Undefined;
        };
        match value {
            SignalValue::Bool(v) => InspectionValue::Bool(*v),
            SignalValue::String(v) => InspectionValue::String(v.clone()),
            SignalValue::RawHandle(_) => InspectionValue::Undefined,
            numeric => numeric
                .as_f64()
                .map(InspectionValue::Number)
                .unwrap_or(InspectionValue::Undefined),
        }
    }

    fn window(&self, func: WindowFunction, signal_id: SignalId) -> InspectionValue {
        self.signals
            .get(&signal_id)
            .and_then(|s| {
                // One period per signal is the overwhelmingly common case;
                // with several, the smallest period answers.
                s.windows
                    .iter()
                    .min_by_key(|(period, _)| **period)
                    .map(|(_, w)| w.query(func))
            })
            .unwrap_or(InspectionValue::Undefined)
    }
}
