//! # Programs and Kernels
//!
//! A program is source text plus one build per root device. Builds for a root
//! device serve every sub-device partitioned from it. The build log is shared
//! by all builds and only ever grows.

use std::sync::Arc;

use clrt_execution::{ClError, ClResult, DeviceId, Executable, KernelBinding};
use spin::Mutex;

use crate::compiler::{BuildLog, BuildOptions, Compiler};
use crate::device::Device;

/// Build state of a program for one device
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BuildStatus {
    /// Never built for the device
    None,
    /// Linked executable available
    Success,
    /// Last build failed
    Error,
}

#[derive(Clone)]
struct DeviceBuild {
    status: BuildStatus,
    options: String,
    executable: Option<Arc<dyn Executable>>,
}

/// Source program
pub struct Program {
    source: String,
    log: BuildLog,
    builds: Mutex<hashbrown::HashMap<DeviceId, DeviceBuild>>,
}

impl Program {
    /// Program over `source`
    pub fn with_source(source: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            source: source.into(),
            log: BuildLog::new(),
            builds: Mutex::new(hashbrown::HashMap::new()),
        })
    }

    /// Source text
    pub fn source(&self) -> &str {
        &self.source
    }

    /// Compile and link for `device`.
    ///
    /// Options are parsed with the device's policy, then the device's
    /// predefined macros are added. A failed build is recorded and reported
    /// as [`ClError::BuildProgramFailure`]; earlier log text is kept.
    pub fn build(&self, device: &Device, compiler: &dyn Compiler, options: &str) -> ClResult<()> {
        let root = device.root_id();

        let mut parsed = match BuildOptions::parse(options, device.option_policy()) {
            Ok(parsed) => parsed,
            Err(err) => {
                self.log.append(&format!("error: invalid build options '{}'", options));
                return Err(err);
            },
        };
        parsed.add_device_macros(&device.profile().extensions);
        for ignored in &parsed.ignored {
            self.log.append(&format!("warning: ignoring build option '{}'", ignored));
        }

        let output = compiler.compile(&parsed, &self.source);
        self.log.append(&output.log);

        let executable = output.executable.filter(|_| output.success);
        let status = if executable.is_some() {
            BuildStatus::Success
        } else {
            BuildStatus::Error
        };
        self.builds.lock().insert(
            root,
            DeviceBuild {
                status,
                options: options.to_owned(),
                executable,
            },
        );

        match status {
            BuildStatus::Success => {
                log::debug!("program: built for device {}", root.0);
                Ok(())
            },
            _ => {
                log::warn!("program: build for device {} failed", root.0);
                Err(ClError::BuildProgramFailure)
            },
        }
    }

    /// Build state for `device`
    pub fn build_status(&self, device: &Device) -> BuildStatus {
        self.builds
            .lock()
            .get(&device.root_id())
            .map_or(BuildStatus::None, |b| b.status)
    }

    /// Options of the last build for `device`
    pub fn build_options(&self, device: &Device) -> Option<String> {
        self.builds
            .lock()
            .get(&device.root_id())
            .map(|b| b.options.clone())
    }

    /// Cumulative build log
    pub fn log(&self) -> String {
        self.log.text()
    }

    /// Linked executable for devices descended from `root`
    pub fn executable_for(&self, root: DeviceId) -> Option<Arc<dyn Executable>> {
        self.builds.lock().get(&root).and_then(|b| b.executable.clone())
    }
}

impl core::fmt::Debug for Program {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let builds: Vec<_> = self
            .builds
            .lock()
            .iter()
            .map(|(id, b)| (id.0, b.status))
            .collect();
        f.debug_struct("Program")
            .field("source_len", &self.source.len())
            .field("builds", &builds)
            .finish()
    }
}

/// Named entry point of a program
#[derive(Debug)]
pub struct Kernel {
    program: Arc<Program>,
    name: String,
}

impl Kernel {
    /// Kernel `name` of `program`
    pub fn new(program: &Arc<Program>, name: &str) -> ClResult<Arc<Self>> {
        if name.is_empty() {
            return Err(ClError::InvalidKernelName);
        }
        Ok(Arc::new(Self {
            program: program.clone(),
            name: name.to_owned(),
        }))
    }

    /// Owning program
    pub fn program(&self) -> &Arc<Program> {
        &self.program
    }
}

impl KernelBinding for Kernel {
    fn name(&self) -> &str {
        &self.name
    }

    fn executable_for(&self, root: DeviceId) -> Option<Arc<dyn Executable>> {
        self.program.executable_for(root)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compiler::NativeCompiler;
    use crate::config::CpuDeviceConfig;
    use crate::device::Device;

    const SOURCE: &str = "__kernel void fill(global int *out) { out[get_global_id(0)] = 1; }";

    #[test]
    fn test_build_and_lookup() {
        let device = Device::cpu(CpuDeviceConfig::with_compute_units(2)).unwrap();
        let program = Program::with_source(SOURCE);
        let compiler = NativeCompiler::new().with_kernel("fill", |_| Ok(()));

        assert_eq!(program.build_status(&device), BuildStatus::None);
        program.build(&device, &compiler, "-cl-mad-enable").unwrap();
        assert_eq!(program.build_status(&device), BuildStatus::Success);
        assert_eq!(program.build_options(&device).as_deref(), Some("-cl-mad-enable"));
        assert!(program.executable_for(device.root_id()).is_some());

        let kernel = Kernel::new(&program, "fill").unwrap();
        assert_eq!(kernel.name(), "fill");
        assert!(kernel.executable_for(device.root_id()).is_some());
        assert!(kernel.executable_for(DeviceId(u32::MAX)).is_none());
    }

    #[test]
    fn test_failed_build_keeps_log() {
        let device = Device::cpu(CpuDeviceConfig::with_compute_units(1)).unwrap();
        let program = Program::with_source(SOURCE);

        let err = program.build(&device, &NativeCompiler::new(), "").unwrap_err();
        assert_eq!(err, ClError::BuildProgramFailure);
        assert_eq!(program.build_status(&device), BuildStatus::Error);
        let first = program.log();
        assert!(first.contains("'fill'"));

        let compiler = NativeCompiler::new().with_kernel("fill", |_| Ok(()));
        program.build(&device, &compiler, "").unwrap();
        assert!(program.log().starts_with(&first));
        assert_eq!(program.build_status(&device), BuildStatus::Success);
    }

    #[test]
    fn test_invalid_options_logged() {
        let device = Device::cpu(CpuDeviceConfig::with_compute_units(1)).unwrap();
        let program = Program::with_source(SOURCE);
        let compiler = NativeCompiler::new().with_kernel("fill", |_| Ok(()));

        assert_eq!(
            program.build(&device, &compiler, "-fancy"),
            Err(ClError::InvalidBuildOptions)
        );
        assert!(program.log().contains("-fancy"));
        assert_eq!(program.build_status(&device), BuildStatus::None);
    }

    #[test]
    fn test_empty_kernel_name() {
        let program = Program::with_source(SOURCE);
        assert_eq!(Kernel::new(&program, "").unwrap_err(), ClError::InvalidKernelName);
    }
}
