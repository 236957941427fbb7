//! Names and descriptions of the metrics emitted by the simulator.

/// Kind of a metric.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetricKind {
    /// Monotonic counter.
    Counter,
    /// Value that can go up and down.
    Gauge,
}

impl std::fmt::Display for MetricKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MetricKind::Counter => write!(f, "counter"),
            MetricKind::Gauge => write!(f, "gauge"),
        }
    }
}

/// A metric definition.
#[derive(Debug, Clone, Copy)]
pub struct MetricDef {
    /// Metric name.
    pub name: &'static str,
    /// Metric kind.
    pub kind: MetricKind,
    /// Human readable description.
    pub description: &'static str,
    /// Labels attached to every sample.
    pub labels: &'static [&'static str],
}

pub const PHY_TX_FRAMES: MetricDef = MetricDef {
    name: "ncsim.phy.tx_frames",
    kind: MetricKind::Counter,
    description: "Frames put on the air",
    labels: &["node"],
};

pub const PHY_RX_DELIVERED: MetricDef = MetricDef {
    name: "ncsim.phy.rx_delivered",
    kind: MetricKind::Counter,
    description: "Frames received with correctable bit errors and handed to the MAC",
    labels: &["node"],
};

pub const PHY_RX_DROPPED: MetricDef = MetricDef {
    name: "ncsim.phy.rx_dropped",
    kind: MetricKind::Counter,
    description: "Frames discarded because their bit error rate exceeded the MCS limit",
    labels: &["node"],
};

pub const MAC_SCHEDULES_SENT: MetricDef = MetricDef {
    name: "ncsim.mac.schedules_sent",
    kind: MetricKind::Counter,
    description: "Schedules broadcast by a gateway",
    labels: &["node"],
};

pub const MAC_CONTROLS_SENT: MetricDef = MetricDef {
    name: "ncsim.mac.controls_sent",
    kind: MetricKind::Counter,
    description: "Control messages sent by a gateway",
    labels: &["node"],
};

pub const MAC_DATA_RECEIVED: MetricDef = MetricDef {
    name: "ncsim.mac.data_received",
    kind: MetricKind::Counter,
    description: "Sensor data packets received by a gateway",
    labels: &["node"],
};

pub const MAC_ACKS_RECEIVED: MetricDef = MetricDef {
    name: "ncsim.mac.acks_received",
    kind: MetricKind::Counter,
    description: "Actuator acknowledgements received by a gateway",
    labels: &["node"],
};

pub const MAC_QUEUE_DROPPED: MetricDef = MetricDef {
    name: "ncsim.mac.queue_dropped",
    kind: MetricKind::Counter,
    description: "Outbound packets dropped because the MAC queue was full",
    labels: &["node"],
};

pub const MAC_GRANTS: MetricDef = MetricDef {
    name: "ncsim.mac.grants",
    kind: MetricKind::Counter,
    description: "Medium grants issued by the resource manager",
    labels: &["node"],
};

pub const CONTROL_REWARD: MetricDef = MetricDef {
    name: "ncsim.control.reward",
    kind: MetricKind::Gauge,
    description: "Last reward reported by the gateway's interpreter",
    labels: &["node"],
};

pub const KERNEL_HALTED_ENTITIES: MetricDef = MetricDef {
    name: "ncsim.kernel.halted_entities",
    kind: MetricKind::Counter,
    description: "Entities stopped after returning an error",
    labels: &[],
};

/// Every metric, in display order.
pub const ALL: &[MetricDef] = &[
    PHY_TX_FRAMES,
    PHY_RX_DELIVERED,
    PHY_RX_DROPPED,
    MAC_SCHEDULES_SENT,
    MAC_CONTROLS_SENT,
    MAC_DATA_RECEIVED,
    MAC_ACKS_RECEIVED,
    MAC_QUEUE_DROPPED,
    MAC_GRANTS,
    CONTROL_REWARD,
    KERNEL_HALTED_ENTITIES,
];
