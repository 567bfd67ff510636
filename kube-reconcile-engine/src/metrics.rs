use crate::{controller::GenericController, utils::metric_name};

use opentelemetry::{
    KeyValue,
    global::{self},
    metrics::{Counter, Histogram, Meter, ObservableGauge},
};
use std::{
    collections::BTreeMap,
    sync::{Arc, Mutex, PoisonError},
    time::Duration,
};

const METER: &str = "reconcile_engine";

/// Start times (unix seconds) of the reconciles currently in flight.
///
/// Several workers can start within the same second, so every timestamp is
/// counted instead of being stored once.
#[derive(Default)]
pub struct ReconcileTimestamps {
    in_flight: Mutex<BTreeMap<i64, usize>>,
}

impl ReconcileTimestamps {
    pub fn insert(&self, ts: i64) {
        *self
            .in_flight
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(ts)
            .or_insert(0) += 1;
    }

    pub fn remove(&self, ts: i64) {
        let mut in_flight = self.in_flight.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(count) = in_flight.get_mut(&ts) {
            *count -= 1;
            if *count == 0 {
                in_flight.remove(&ts);
            }
        }
    }

    /// All timestamps in ascending order, duplicates included.
    pub fn sorted(&self) -> Vec<i64> {
        self.in_flight
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .flat_map(|(ts, count)| std::iter::repeat_n(*ts, *count))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.in_flight
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// OpenTelemetry instruments of one controller.
pub(crate) struct ControllerMetrics {
    labels: [KeyValue; 1],
    reconcile_count: Counter<u64>,
    reconcile_errors: Counter<u64>,
    reconcile_duration: Histogram<u64>,
}

impl ControllerMetrics {
    pub(crate) fn new(controller: &str) -> Self {
        let meter: Meter = global::meter(METER);
        let reconcile_count = meter
            .u64_counter(metric_name("reconcile_count"))
            .with_description("Count of reconcile invocations")
            .build();
        let reconcile_errors = meter
            .u64_counter(metric_name("reconcile_errors"))
            .with_description("Count of failed reconcile invocations")
            .build();
        let reconcile_duration = meter
            .u64_histogram(metric_name("reconcile_duration_ms"))
            .with_description("Reconcile duration in milliseconds")
            .with_unit("ms")
            .build();
        Self {
            labels: [KeyValue::new("controller", controller.to_string())],
            reconcile_count,
            reconcile_errors,
            reconcile_duration,
        }
    }

    pub(crate) fn record(&self, duration: Duration, failed: bool) {
        self.reconcile_count.add(1, &self.labels);
        if failed {
            self.reconcile_errors.add(1, &self.labels);
        }
        self.reconcile_duration
            .record(duration.as_millis() as u64, &self.labels);
    }

    /// Failures which did not get to record a reconcile, e.g. malformed keys.
    pub(crate) fn record_error(&self) {
        self.reconcile_errors.add(1, &self.labels);
    }
}

/// Gauges observing the queue length and the number of in-flight reconciles
/// of `controllers`. Observation stops once the returned gauges are dropped.
pub(crate) fn queue_gauges(controllers: &[Arc<GenericController>]) -> Vec<ObservableGauge<u64>> {
    let meter: Meter = global::meter(METER);
    let observed = controllers.to_vec();
    let queue_length = meter
        .u64_observable_gauge(metric_name("queue_length"))
        .with_description("Number of keys waiting in the work queue")
        .with_callback(move |observer| {
            for c in observed.iter() {
                observer.observe(
                    c.get_metrics().queue_length as u64,
                    &[KeyValue::new("controller", c.name().to_string())],
                );
            }
        })
        .build();
    let observed = controllers.to_vec();
    let in_flight = meter
        .u64_observable_gauge(metric_name("uncompleted_reconciles"))
        .with_description("Number of reconciles currently in progress")
        .with_callback(move |observer| {
            for c in observed.iter() {
                observer.observe(
                    c.get_metrics().uncompleted_reconcile_ts.len() as u64,
                    &[KeyValue::new("controller", c.name().to_string())],
                );
            }
        })
        .build();
    vec![queue_length, in_flight]
}
