pub const TOPIC_LIFECYCLE_STATE: &str = "lifecycle/state";
pub const TOPIC_LIFECYCLE_EVENT: &str = "lifecycle/event";

pub const TOPIC_CMD_CHECK: &str = "lifecycle/cmnd/check";
pub const TOPIC_CMD_UPDATE: &str = "lifecycle/cmnd/update";
pub const TOPIC_CMD_CANCEL_UPDATE: &str = "lifecycle/cmnd/update/cancel";
pub const TOPIC_CMD_FACTORY_RESET: &str = "lifecycle/cmnd/factory_reset";
