//! Notification channel names (UTF-8 payloads, see [`crate::payloads`]).

pub const RUN_STATE_CHANGED: &str = "run_state_changed";
pub const RUN_CREATED: &str = "run_created";
pub const TOOL_PENDING: &str = "tool_pending";
pub const RUN_TOOLS_COMPLETE: &str = "run_tools_complete";
pub const INSTANCE_REGISTERED: &str = "instance_registered";
pub const INSTANCE_DEREGISTERED: &str = "instance_deregistered";
pub const LEADER_CHANGED: &str = "leader_changed";

/// Every channel, in the order the notifier subscribes.
pub const ALL: &[&str] = &[
    RUN_STATE_CHANGED,
    RUN_CREATED,
    TOOL_PENDING,
    RUN_TOOLS_COMPLETE,
    INSTANCE_REGISTERED,
    INSTANCE_DEREGISTERED,
    LEADER_CHANGED,
];
