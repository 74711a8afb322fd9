use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicI64, AtomicU64, Ordering},
        Arc, Mutex, OnceLock,
    },
};

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct EndpointMetricKey {
    endpoint: String,
    method: String,
}

#[derive(Default)]
pub struct RelayMetrics {
    request_duration_count: Mutex<HashMap<EndpointMetricKey, u64>>,
    request_duration_sum_ms: Mutex<HashMap<EndpointMetricKey, u64>>,
    request_errors_total: Mutex<HashMap<EndpointMetricKey, u64>>,
    request_rate_total: Mutex<HashMap<EndpointMetricKey, u64>>,
    connections_admitted_total: AtomicU64,
    connections_rejected_total: AtomicU64,
    connections_active: AtomicI64,
    rooms_active: AtomicI64,
    messages_relayed_total: AtomicU64,
    messages_malformed_total: AtomicU64,
    deliveries_total: AtomicU64,
    deliveries_skipped_total: AtomicU64,
}

static GLOBAL_METRICS: OnceLock<Arc<RelayMetrics>> = OnceLock::new();

pub fn set_global_metrics(metrics: Arc<RelayMetrics>) {
    let _ = GLOBAL_METRICS.set(metrics);
}

fn global_metrics() -> Option<&'static Arc<RelayMetrics>> {
    GLOBAL_METRICS.get()
}

pub fn record_http_request(method: &str, path: &str, status_code: u16, latency_ms: u64) {
    if let Some(metrics) = global_metrics() {
        metrics.record_http_request(method, path, status_code, latency_ms);
    }
}

pub fn record_connection_admitted() {
    if let Some(metrics) = global_metrics() {
        metrics.record_connection_admitted();
    }
}

pub fn record_connection_rejected() {
    if let Some(metrics) = global_metrics() {
        metrics.record_connection_rejected();
    }
}

pub fn record_connection_closed() {
    if let Some(metrics) = global_metrics() {
        metrics.record_connection_closed();
    }
}

pub fn set_rooms_active(rooms: usize) {
    if let Some(metrics) = global_metrics() {
        metrics.set_rooms_active(rooms);
    }
}

pub fn record_relay(delivered: usize, skipped: usize) {
    if let Some(metrics) = global_metrics() {
        metrics.record_relay(delivered, skipped);
    }
}

pub fn record_malformed_message() {
    if let Some(metrics) = global_metrics() {
        metrics.record_malformed_message();
    }
}

impl RelayMetrics {
    pub fn record_http_request(&self, method: &str, path: &str, status_code: u16, latency_ms: u64) {
        let key = EndpointMetricKey {
            endpoint: normalize_endpoint(path),
            method: method.to_ascii_uppercase(),
        };

        increment_counter(&self.request_rate_total, &key, 1);
        increment_counter(&self.request_duration_sum_ms, &key, latency_ms);
        increment_counter(&self.request_duration_count, &key, 1);
        if status_code >= 400 {
            increment_counter(&self.request_errors_total, &key, 1);
        }
    }

    pub fn record_connection_admitted(&self) {
        self.connections_admitted_total.fetch_add(1, Ordering::SeqCst);
        self.connections_active.fetch_add(1, Ordering::SeqCst);
    }

    pub fn record_connection_rejected(&self) {
        self.connections_rejected_total.fetch_add(1, Ordering::SeqCst);
    }

    pub fn record_connection_closed(&self) {
        self.connections_active.fetch_sub(1, Ordering::SeqCst);
    }

    pub fn set_rooms_active(&self, rooms: usize) {
        self.rooms_active.store(i64::try_from(rooms).unwrap_or(i64::MAX), Ordering::SeqCst);
    }

    pub fn record_relay(&self, delivered: usize, skipped: usize) {
        self.messages_relayed_total.fetch_add(1, Ordering::SeqCst);
        self.deliveries_total.fetch_add(delivered as u64, Ordering::SeqCst);
        self.deliveries_skipped_total.fetch_add(skipped as u64, Ordering::SeqCst);
    }

    pub fn record_malformed_message(&self) {
        self.messages_malformed_total.fetch_add(1, Ordering::SeqCst);
    }

    pub fn render_prometheus(&self) -> String {
        let mut output = String::new();

        output.push_str("# HELP relay_request_rate_total Total HTTP requests by endpoint.\n");
        output.push_str("# TYPE relay_request_rate_total counter\n");
        append_counter_lines(&mut output, "relay_request_rate_total", &self.request_rate_total);

        output.push_str(
            "# HELP relay_request_errors_total Total HTTP error responses by endpoint.\n",
        );
        output.push_str("# TYPE relay_request_errors_total counter\n");
        append_counter_lines(&mut output, "relay_request_errors_total", &self.request_errors_total);

        output.push_str("# HELP relay_request_duration_ms_sum Sum of HTTP request latency in milliseconds by endpoint.\n");
        output.push_str("# TYPE relay_request_duration_ms_sum counter\n");
        append_counter_lines(
            &mut output,
            "relay_request_duration_ms_sum",
            &self.request_duration_sum_ms,
        );

        output.push_str("# HELP relay_request_duration_ms_count Count of HTTP request latency samples by endpoint.\n");
        output.push_str("# TYPE relay_request_duration_ms_count counter\n");
        append_counter_lines(
            &mut output,
            "relay_request_duration_ms_count",
            &self.request_duration_count,
        );

        append_scalar(
            &mut output,
            "relay_connections_admitted_total",
            "counter",
            "Total connections admitted into a room.",
            self.connections_admitted_total.load(Ordering::SeqCst),
        );
        append_scalar(
            &mut output,
            "relay_connections_rejected_total",
            "counter",
            "Total upgrade requests rejected at admission.",
            self.connections_rejected_total.load(Ordering::SeqCst),
        );
        append_scalar(
            &mut output,
            "relay_connections_active",
            "gauge",
            "Connections currently joined to a room.",
            self.connections_active.load(Ordering::SeqCst).max(0),
        );
        append_scalar(
            &mut output,
            "relay_rooms_active",
            "gauge",
            "Rooms with at least one member.",
            self.rooms_active.load(Ordering::SeqCst).max(0),
        );
        append_scalar(
            &mut output,
            "relay_messages_relayed_total",
            "counter",
            "Total inbound messages stamped and fanned out.",
            self.messages_relayed_total.load(Ordering::SeqCst),
        );
        append_scalar(
            &mut output,
            "relay_messages_malformed_total",
            "counter",
            "Total inbound messages dropped as malformed.",
            self.messages_malformed_total.load(Ordering::SeqCst),
        );
        append_scalar(
            &mut output,
            "relay_deliveries_total",
            "counter",
            "Total frames queued to recipients.",
            self.deliveries_total.load(Ordering::SeqCst),
        );
        append_scalar(
            &mut output,
            "relay_deliveries_skipped_total",
            "counter",
            "Total recipients skipped because their queue was full or closed.",
            self.deliveries_skipped_total.load(Ordering::SeqCst),
        );

        output
    }
}

fn normalize_endpoint(path: &str) -> String {
    if path.is_empty() {
        return "/".to_string();
    }

    let mut normalized_segments = Vec::new();
    for (index, segment) in path.split('/').filter(|segment| !segment.is_empty()).enumerate() {
        // Session tokens are unbounded; keep them out of label values.
        if index == 1 && normalized_segments.first().is_some_and(|first| first == "collaboration")
        {
            normalized_segments.push("{token}".to_string());
            continue;
        }

        if uuid::Uuid::parse_str(segment).is_ok() {
            normalized_segments.push("{uuid}".to_string());
            continue;
        }

        if segment.chars().all(|character| character.is_ascii_digit()) {
            normalized_segments.push("{number}".to_string());
            continue;
        }

        normalized_segments.push(segment.to_string());
    }

    if normalized_segments.is_empty() {
        "/".to_string()
    } else {
        format!("/{}", normalized_segments.join("/"))
    }
}

fn increment_counter(
    map: &Mutex<HashMap<EndpointMetricKey, u64>>,
    key: &EndpointMetricKey,
    delta: u64,
) {
    let mut guard = map.lock().expect("metrics map lock poisoned");
    let value = guard.entry(key.clone()).or_insert(0);
    *value = value.saturating_add(delta);
}

fn append_scalar(
    output: &mut String,
    metric_name: &str,
    metric_type: &str,
    help: &str,
    value: impl std::fmt::Display,
) {
    output.push_str(&format!("# HELP {metric_name} {help}\n"));
    output.push_str(&format!("# TYPE {metric_name} {metric_type}\n"));
    output.push_str(&format!("{metric_name} {value}\n"));
}

fn append_counter_lines(
    output: &mut String,
    metric_name: &str,
    map: &Mutex<HashMap<EndpointMetricKey, u64>>,
) {
    let guard = map.lock().expect("metrics map lock poisoned");
    let mut entries: Vec<_> = guard.iter().collect();
    entries.sort_by(|(left_key, _), (right_key, _)| {
        left_key
            .method
            .cmp(&right_key.method)
            .then_with(|| left_key.endpoint.cmp(&right_key.endpoint))
    });

    for (key, value) in entries {
        output.push_str(&format!(
            "{metric_name}{{method=\"{}\",endpoint=\"{}\"}} {value}\n",
            escape_label_value(&key.method),
            escape_label_value(&key.endpoint),
        ));
    }
}

fn escape_label_value(value: &str) -> String {
    value.replace('\\', "\\\\").replace('\n', "\\n").replace('"', "\\\"")
}
