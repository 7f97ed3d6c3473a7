use prometheus::{IntCounterVec, IntGaugeVec};
use std::sync::LazyLock;

static CONNECTION_GAUGE: LazyLock<IntGaugeVec> = LazyLock::new(|| {
    prometheus::register_int_gauge_vec!(
        "connection_count",
        "number of active connections",
        &["service"]
    )
    .unwrap()
});
static READY_COUNT_GAUGE: LazyLock<IntGaugeVec> = LazyLock::new(|| {
    prometheus::register_int_gauge_vec!(
        "ready_count",
        "number of messages in the ready queue",
        &["service"]
    )
    .unwrap()
});
static TOTAL_MSGS_DELIVERED: LazyLock<IntCounterVec> = LazyLock::new(|| {
    prometheus::register_int_counter_vec!(
        "total_messages_delivered",
        "total messages delivered",
        &["service"]
    )
    .unwrap()
});
static TOTAL_MSGS_TRANSFAIL: LazyLock<IntCounterVec> = LazyLock::new(|| {
    prometheus::register_int_counter_vec!(
        "total_messages_transfail",
        "total messages that transiently failed",
        &["service"]
    )
    .unwrap()
});
static TOTAL_MSGS_FAIL: LazyLock<IntCounterVec> = LazyLock::new(|| {
    prometheus::register_int_counter_vec!(
        "total_messages_fail",
        "total messages that permanently failed",
        &["service"]
    )
    .unwrap()
});

/// Per-ready-queue delivery metrics, labelled by service name
#[derive(Clone)]
pub struct DeliveryMetrics {
    pub connection_gauge: prometheus::IntGauge,
    pub ready_count: prometheus::IntGauge,
    pub msgs_delivered: prometheus::IntCounter,
    pub msgs_transfail: prometheus::IntCounter,
    pub msgs_fail: prometheus::IntCounter,
}

impl DeliveryMetrics {
    pub fn new(service: &str) -> Self {
        Self {
            connection_gauge: CONNECTION_GAUGE.with_label_values(&[service]),
            ready_count: READY_COUNT_GAUGE.with_label_values(&[service]),
            msgs_delivered: TOTAL_MSGS_DELIVERED.with_label_values(&[service]),
            msgs_transfail: TOTAL_MSGS_TRANSFAIL.with_label_values(&[service]),
            msgs_fail: TOTAL_MSGS_FAIL.with_label_values(&[service]),
        }
    }
}
