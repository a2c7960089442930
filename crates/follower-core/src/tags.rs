/// Names under which one status value is published to each outer surface.
#[derive(Debug, Clone, Copy)]
pub struct Tag {
    pub key: &'static str,
    pub metric: &'static str,
}

pub const SOURCE_VOLTAGE: Tag = Tag {
    key: "source_voltage",
    metric: "follower_source_voltage_volts",
};

pub const FOLLOWER_VOLTAGE: Tag = Tag {
    key: "follower_voltage",
    metric: "follower_output_voltage_volts",
};

pub const FOLLOWER_CURRENT: Tag = Tag {
    key: "follower_current",
    metric: "follower_output_current_amps",
};

pub const COMMANDED_VOLTAGE: Tag = Tag {
    key: "commanded_voltage",
    metric: "follower_commanded_voltage_volts",
};

pub const FAULT_STATE: Tag = Tag {
    key: "fault_state",
    metric: "follower_fault_state",
};

pub const CYCLE_DURATION_US: Tag = Tag {
    key: "cycle_duration_us",
    metric: "follower_cycle_duration_microseconds",
};

pub const STATUS_TAGS: &[Tag] = &[
    SOURCE_VOLTAGE,
    FOLLOWER_VOLTAGE,
    FOLLOWER_CURRENT,
    COMMANDED_VOLTAGE,
    FAULT_STATE,
];
