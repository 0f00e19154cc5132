use serde::{Deserialize, Serialize};

use crate::error::StorageError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResetReason {
    PowerOn,
    External,
    Software,
    Panic,
    InterruptWatchdog,
    TaskWatchdog,
    Watchdog,
    DeepSleep,
    Brownout,
    Sdio,
    Unknown,
}

impl ResetReason {
    /// Power-on, reset line and brown-out boots are what a user produces by
    /// cycling power; everything else is the firmware's own doing.
    pub fn is_abnormal(self) -> bool {
        matches!(self, Self::PowerOn | Self::External | Self::Brownout)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::PowerOn => "POWERON",
            Self::External => "EXT",
            Self::Software => "SW",
            Self::Panic => "PANIC",
            Self::InterruptWatchdog => "INT_WDT",
            Self::TaskWatchdog => "TASK_WDT",
            Self::Watchdog => "WDT",
            Self::DeepSleep => "DEEPSLEEP",
            Self::Brownout => "BROWNOUT",
            Self::Sdio => "SDIO",
            Self::Unknown => "UNKNOWN",
        }
    }

    pub fn from_label(label: &str) -> Self {
        match label.trim().to_ascii_uppercase().as_str() {
            "POWERON" | "POWER_ON" => Self::PowerOn,
            "EXT" | "EXTERNAL" => Self::External,
            "SW" | "SOFTWARE" => Self::Software,
            "PANIC" => Self::Panic,
            "INT_WDT" => Self::InterruptWatchdog,
            "TASK_WDT" => Self::TaskWatchdog,
            "WDT" => Self::Watchdog,
            "DEEPSLEEP" | "DEEP_SLEEP" => Self::DeepSleep,
            "BROWNOUT" => Self::Brownout,
            "SDIO" => Self::Sdio,
            _ => Self::Unknown,
        }
    }
}

/// Device services the lifecycle core needs but does not implement.
pub trait Platform: Send {
    fn reset_reason(&self) -> ResetReason;
    /// Version baked into the running image.
    fn firmware_version(&self) -> String;
    fn now_ms(&self) -> u64;
    fn sleep_ms(&self, ms: u64);
    fn feed_watchdog(&self);
    /// On the device this does not return.
    fn restart(&self);
    fn set_indicator(&self, active: bool);
    fn restore_network_defaults(&self) -> Result<(), StorageError>;
    fn reset_accessory_state(&self) -> Result<(), StorageError>;
}

/// Keeps the update indicator running until dropped.
pub struct IndicatorGuard<'a, P: Platform + ?Sized> {
    platform: &'a P,
}

impl<'a, P: Platform + ?Sized> IndicatorGuard<'a, P> {
    pub fn start(platform: &'a P) -> Self {
        platform.set_indicator(true);
        Self { platform }
    }
}

impl<P: Platform + ?Sized> Drop for IndicatorGuard<'_, P> {
    fn drop(&mut self) {
        self.platform.set_indicator(false);
    }
}
