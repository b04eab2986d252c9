//! Host facts used by the CPU device profile.

/// Reported when no model name can be read
pub const FALLBACK_MODEL_NAME: &str = "Generic CPU";
/// Reported when no clock can be read
pub const FALLBACK_MHZ: u32 = 1000;
/// Reported when total memory cannot be read
pub const FALLBACK_MEMORY: u64 = 512 * 1024 * 1024;

/// What the host says about itself
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostFacts {
    /// Processor model string
    pub model_name: String,
    /// Clock frequency in MHz
    pub mhz: u32,
    /// Installed memory in bytes
    pub total_memory: u64,
}

impl Default for HostFacts {
    fn default() -> Self {
        Self {
            model_name: FALLBACK_MODEL_NAME.to_owned(),
            mhz: FALLBACK_MHZ,
            total_memory: FALLBACK_MEMORY,
        }
    }
}

cfg_if::cfg_if! {
    if #[cfg(target_os = "linux")] {
        /// Probe `/proc` and cpufreq, falling back field by field
        pub fn probe() -> HostFacts {
            let mut facts = HostFacts::default();

            if let Ok(text) = std::fs::read_to_string("/proc/cpuinfo") {
                let (name, mhz) = parse_cpuinfo(&text);
                if let Some(name) = name {
                    facts.model_name = name;
                }
                match mhz {
                    Some(mhz) => facts.mhz = mhz,
                    None => {
                        if let Some(mhz) = read_cpufreq_mhz() {
                            facts.mhz = mhz;
                        }
                    },
                }
            }

            match std::fs::read_to_string("/proc/meminfo") {
                Ok(text) => {
                    if let Some(total) = parse_meminfo(&text) {
                        facts.total_memory = total;
                    }
                },
                Err(err) => log::debug!("sysinfo: /proc/meminfo unreadable: {}", err),
            }

            facts
        }

        fn read_cpufreq_mhz() -> Option<u32> {
            let text = std::fs::read_to_string(
                "/sys/devices/system/cpu/cpu0/cpufreq/cpuinfo_max_freq",
            )
            .ok()?;
            let khz: u64 = text.trim().parse().ok()?;
            u32::try_from(khz / 1000).ok()
        }
    } else {
        /// Probe the host; only fallbacks are available on this target
        pub fn probe() -> HostFacts {
            HostFacts::default()
        }
    }
}

/// Model name and clock from `/proc/cpuinfo` text
pub fn parse_cpuinfo(text: &str) -> (Option<String>, Option<u32>) {
    let mut name = None;
    let mut mhz = None;

    for line in text.lines() {
        let Some((key, value)) = line.split_once(':') else {
            continue;
        };
        let (key, value) = (key.trim(), value.trim());
        match key {
            "model name" | "Processor" if name.is_none() && !value.is_empty() => {
                name = Some(value.to_owned());
            },
            "cpu MHz" if mhz.is_none() => {
                mhz = value.parse::<f64>().ok().map(|v| v as u32);
            },
            _ => {},
        }
    }

    (name, mhz)
}

/// Total memory in bytes from `/proc/meminfo` text
pub fn parse_meminfo(text: &str) -> Option<u64> {
    let line = text.lines().find(|l| l.starts_with("MemTotal:"))?;
    let kib: u64 = line
        .trim_start_matches("MemTotal:")
        .trim()
        .trim_end_matches("kB")
        .trim()
        .parse()
        .ok()?;
    Some(kib * 1024)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_x86_cpuinfo() {
        let text = "processor\t: 0\nvendor_id\t: GenuineIntel\nmodel name\t: Intel(R) Xeon(R) \
                    CPU @ 2.20GHz\ncpu MHz\t\t: 2199.998\n\nprocessor\t: 1\nmodel name\t: other\n";
        let (name, mhz) = parse_cpuinfo(text);
        assert_eq!(name.as_deref(), Some("Intel(R) Xeon(R) CPU @ 2.20GHz"));
        assert_eq!(mhz, Some(2199));
    }

    #[test]
    fn test_parse_arm_cpuinfo() {
        let text = "Processor\t: ARMv7 Processor rev 10 (v7l)\nBogoMIPS\t: 1590.23\n";
        let (name, mhz) = parse_cpuinfo(text);
        assert_eq!(name.as_deref(), Some("ARMv7 Processor rev 10 (v7l)"));
        assert_eq!(mhz, None);
    }

    #[test]
    fn test_parse_meminfo() {
        let text = "MemTotal:       16318480 kB\nMemFree:         1000000 kB\n";
        assert_eq!(parse_meminfo(text), Some(16318480 * 1024));
        assert_eq!(parse_meminfo("MemFree: 1 kB\n"), None);
    }

    #[test]
    fn test_probe_never_fails() {
        let facts = probe();
        assert!(!facts.model_name.is_empty());
        assert!(facts.total_memory > 0);
    }
}
