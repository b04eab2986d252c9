//! # Runtime Configuration
//!
//! Plain configuration structs handed to device constructors. Nothing here
//! reads global state except [`RuntimeConfig::from_env`].

use std::sync::Arc;
use std::time::Duration;

use clrt_hal::{ImageHandle, Mailbox, MailboxConfig, TransportDriver};
use clrt_memory::{AllocPolicy, HeapConfig};

use crate::compiler::OptionPolicy;

/// Overrides the CPU device's compute-unit count
pub const ENV_COMPUTE_UNITS: &str = "CLRT_COMPUTE_UNITS";
/// `0` selects lenient build-option parsing
pub const ENV_STRICT_BUILD_OPTIONS: &str = "CLRT_STRICT_BUILD_OPTIONS";
/// `1` makes heap exhaustion recoverable
pub const ENV_HEAP_FAIL_SOFT: &str = "CLRT_HEAP_FAIL_SOFT";

/// Default wait for one remote kernel reply
pub const DEFAULT_REPLY_TIMEOUT: Duration = Duration::from_secs(10);
/// Default remote clock in MHz
pub const DEFAULT_REMOTE_CLOCK_MHZ: u32 = 1000;

// =============================================================================
// PROCESS-WIDE SETTINGS
// =============================================================================

/// Settings shared by every device in a process
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RuntimeConfig {
    /// Compute units of the root CPU device; `None` uses the host parallelism
    pub compute_units: Option<u32>,
    /// Build-option policy
    pub option_policy: OptionPolicy,
    /// Heap exhaustion policy for remote devices
    pub alloc_policy: AllocPolicy,
}

impl RuntimeConfig {
    /// Defaults: host parallelism, strict options, aborting allocations
    pub const fn new() -> Self {
        Self {
            compute_units: None,
            option_policy: OptionPolicy::Strict,
            alloc_policy: AllocPolicy::Abort,
        }
    }

    /// Defaults overridden by `CLRT_*` environment variables
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Defaults overridden through `lookup`
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::new();

        if let Some(raw) = lookup(ENV_COMPUTE_UNITS) {
            match raw.trim().parse::<u32>() {
                Ok(n) if n > 0 => config.compute_units = Some(n),
                _ => log::warn!("config: ignoring {}={:?}", ENV_COMPUTE_UNITS, raw),
            }
        }
        if let Some(raw) = lookup(ENV_STRICT_BUILD_OPTIONS) {
            if raw.trim() == "0" {
                config.option_policy = OptionPolicy::Lenient;
            }
        }
        if let Some(raw) = lookup(ENV_HEAP_FAIL_SOFT) {
            if raw.trim() == "1" {
                config.alloc_policy = AllocPolicy::FailSoft;
            }
        }

        config
    }

    /// CPU device configuration derived from these settings
    pub fn cpu_device(&self) -> CpuDeviceConfig {
        CpuDeviceConfig {
            compute_units: self.compute_units,
            option_policy: self.option_policy,
            name: None,
        }
    }
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self::new()
    }
}

// =============================================================================
// CPU DEVICE
// =============================================================================

/// Host CPU device configuration
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct CpuDeviceConfig {
    /// Compute units; `None` uses the host parallelism
    pub compute_units: Option<u32>,
    /// Build-option policy for programs built for this device
    pub option_policy: OptionPolicy,
    /// Reported name; `None` uses the host model name
    pub name: Option<String>,
}

impl CpuDeviceConfig {
    /// Device with exactly `units` compute units
    pub fn with_compute_units(units: u32) -> Self {
        Self {
            compute_units: Some(units),
            ..Self::default()
        }
    }
}

// =============================================================================
// REMOTE DEVICE
// =============================================================================

/// Remote accelerator configuration
#[derive(Clone)]
pub struct RemoteDeviceConfig {
    /// Device memory access and boot
    pub transport: Arc<dyn TransportDriver>,
    /// Kernel dispatch messages
    pub mailbox: Arc<dyn Mailbox>,
    /// Mailbox depth
    pub mailbox_config: MailboxConfig,
    /// Image booted onto the device
    pub image: ImageHandle,
    /// Buffer heap
    pub heap: HeapConfig,
    /// Optional on-demand heap for large page-granular allocations
    pub ondemand_heap: Option<HeapConfig>,
    /// Heap exhaustion policy
    pub alloc_policy: AllocPolicy,
    /// Build-option policy for programs built for this device
    pub option_policy: OptionPolicy,
    /// Wait for one kernel reply before the device is declared lost
    pub reply_timeout: Duration,
    /// Reported clock
    pub clock_mhz: u32,
    /// Reported name
    pub name: String,
}

impl RemoteDeviceConfig {
    /// Configuration with defaults for everything but the collaborators
    pub fn new(
        transport: Arc<dyn TransportDriver>,
        mailbox: Arc<dyn Mailbox>,
        image: ImageHandle,
        heap: HeapConfig,
    ) -> Self {
        Self {
            transport,
            mailbox,
            mailbox_config: MailboxConfig::new(),
            image,
            heap,
            ondemand_heap: None,
            alloc_policy: AllocPolicy::Abort,
            option_policy: OptionPolicy::Strict,
            reply_timeout: DEFAULT_REPLY_TIMEOUT,
            clock_mhz: DEFAULT_REMOTE_CLOCK_MHZ,
            name: "Remote Accelerator".to_owned(),
        }
    }

    /// Apply process-wide settings
    pub fn with_runtime(mut self, runtime: &RuntimeConfig) -> Self {
        self.alloc_policy = runtime.alloc_policy;
        self.option_policy = runtime.option_policy;
        self
    }
}

impl core::fmt::Debug for RemoteDeviceConfig {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("RemoteDeviceConfig")
            .field("image", &self.image.name())
            .field("heap", &self.heap)
            .field("ondemand_heap", &self.ondemand_heap)
            .field("alloc_policy", &self.alloc_policy)
            .field("reply_timeout", &self.reply_timeout)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn env(pairs: &'static [(&'static str, &'static str)]) -> impl Fn(&str) -> Option<String> {
        move |key| {
            pairs
                .iter()
                .find(|(k, _)| *k == key)
                .map(|(_, v)| (*v).to_owned())
        }
    }

    #[test]
    fn test_defaults() {
        let config = RuntimeConfig::from_lookup(env(&[]));
        assert_eq!(config, RuntimeConfig::new());
        assert_eq!(config.option_policy, OptionPolicy::Strict);
        assert_eq!(config.alloc_policy, AllocPolicy::Abort);
    }

    #[test]
    fn test_overrides() {
        let config = RuntimeConfig::from_lookup(env(&[
            ("CLRT_COMPUTE_UNITS", "4"),
            ("CLRT_STRICT_BUILD_OPTIONS", "0"),
            ("CLRT_HEAP_FAIL_SOFT", "1"),
        ]));
        assert_eq!(config.compute_units, Some(4));
        assert_eq!(config.option_policy, OptionPolicy::Lenient);
        assert_eq!(config.alloc_policy, AllocPolicy::FailSoft);
        assert_eq!(config.cpu_device().compute_units, Some(4));
    }

    #[test]
    fn test_bad_values_ignored() {
        let config = RuntimeConfig::from_lookup(env(&[
            ("CLRT_COMPUTE_UNITS", "zero"),
            ("CLRT_HEAP_FAIL_SOFT", "yes"),
        ]));
        assert_eq!(config.compute_units, None);
        assert_eq!(config.alloc_policy, AllocPolicy::Abort);

        let config = RuntimeConfig::from_lookup(env(&[("CLRT_COMPUTE_UNITS", "0")]));
        assert_eq!(config.compute_units, None);
    }
}
