//! Request metrics — in-process counters with Prometheus text rendering
//!
//! Counters are labeled `(app, code, method)`; durations are a per-app
//! histogram. Every increment also lands on the synthetic `_all` app so
//! fleet-wide dashboards don't need to sum label sets.

use std::collections::HashMap;
use std::sync::RwLock;

/// Synthetic app label receiving every increment
pub const ALL_APPS_KEY: &str = "_all";

const BUCKET_COUNT: usize = 16;

/// Exponential upper bounds from 0.25 ms to ~8 s
fn bucket_bounds() -> [f64; BUCKET_COUNT] {
    let mut bounds = [0.0; BUCKET_COUNT];
    let mut bound = 0.00025;
    for slot in bounds.iter_mut() {
        *slot = bound;
        bound *= 2.0;
    }
    bounds
}

#[derive(Debug, Clone, Default)]
struct Histogram {
    bucket_counts: [u64; BUCKET_COUNT],
    sum: f64,
    count: u64,
}

impl Histogram {
    fn observe(&mut self, value: f64) {
        for (i, bound) in bucket_bounds().iter().enumerate() {
            if value <= *bound {
                self.bucket_counts[i] += 1;
            }
        }
        self.sum += value;
        self.count += 1;
    }
}

type CounterKey = (String, String, String); // (app, code, method)

/// Edge router metrics collector
#[derive(Default)]
pub struct EdgeMetrics {
    requests_ok: RwLock<HashMap<CounterKey, u64>>,
    requests_fail: RwLock<HashMap<CounterKey, u64>>,
    request_duration: RwLock<HashMap<String, Histogram>>,
}

impl EdgeMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one completed request
    pub fn record_request(&self, app: &str, code: u16, method: &str, duration_secs: f64) {
        let counter = if code < 400 {
            &self.requests_ok
        } else {
            &self.requests_fail
        };

        {
            let mut map = counter.write().expect("metrics poisoned");
            for app_key in [app, ALL_APPS_KEY] {
                *map.entry((app_key.to_string(), code.to_string(), method.to_string()))
                    .or_insert(0) += 1;
            }
        }

        let mut durations = self.request_duration.write().expect("metrics poisoned");
        for app_key in [app, ALL_APPS_KEY] {
            durations.entry(app_key.to_string()).or_default().observe(duration_secs);
        }
    }

    pub fn requests_ok_count(&self, app: &str, code: u16, method: &str) -> u64 {
        *self
            .requests_ok
            .read()
            .expect("metrics poisoned")
            .get(&(app.to_string(), code.to_string(), method.to_string()))
            .unwrap_or(&0)
    }

    pub fn requests_fail_count(&self, app: &str, code: u16, method: &str) -> u64 {
        *self
            .requests_fail
            .read()
            .expect("metrics poisoned")
            .get(&(app.to_string(), code.to_string(), method.to_string()))
            .unwrap_or(&0)
    }

    /// Render in Prometheus text exposition format
    pub fn render_prometheus(&self) -> String {
        let mut output = String::new();

        for (name, counter) in [
            ("er_requests_ok", &self.requests_ok),
            ("er_requests_fail", &self.requests_fail),
        ] {
            output.push_str(&format!("# TYPE {} counter\n", name));

            let map = counter.read().expect("metrics poisoned");
            let mut keys: Vec<_> = map.keys().collect();
            keys.sort();
            for key in keys {
                let (app, code, method) = key;
                output.push_str(&format!(
                    "{}{{app=\"{}\",code=\"{}\",method=\"{}\"}} {}\n",
                    name, app, code, method, map[key]
                ));
            }
        }

        output.push_str("# HELP er_request_duration_seconds Histogram of the time (in seconds) each request took.\n");
        output.push_str("# TYPE er_request_duration_seconds histogram\n");

        let durations = self.request_duration.read().expect("metrics poisoned");
        let mut apps: Vec<_> = durations.keys().collect();
        apps.sort();
        for app in apps {
            let histogram = &durations[app];
            for (i, bound) in bucket_bounds().iter().enumerate() {
                output.push_str(&format!(
                    "er_request_duration_seconds_bucket{{app=\"{}\",le=\"{}\"}} {}\n",
                    app, bound, histogram.bucket_counts[i]
                ));
            }
            output.push_str(&format!(
                "er_request_duration_seconds_bucket{{app=\"{}\",le=\"+Inf\"}} {}\n",
                app, histogram.count
            ));
            output.push_str(&format!(
                "er_request_duration_seconds_sum{{app=\"{}\"}} {}\n",
                app, histogram.sum
            ));
            output.push_str(&format!(
                "er_request_duration_seconds_count{{app=\"{}\"}} {}\n",
                app, histogram.count
            ));
        }

        output
    }
}
