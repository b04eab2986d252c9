//! # Compiler Collaborator
//!
//! The runtime never compiles device code itself. It parses the client's
//! build options, adds the device's predefined macros, and hands both to a
//! [`Compiler`]. Whatever the compiler prints is appended to the program's
//! cumulative [`BuildLog`].
//!
//! [`NativeCompiler`] is a compiler whose "device code" is a table of host
//! closures, one per kernel name. It backs the CPU device when no external
//! compiler is plugged in, and the tests.

use std::fmt;
use std::sync::Arc;

use clrt_execution::{ClError, ClResult, ExecFault, Executable, WorkGroupRange};
use spin::Mutex;

// =============================================================================
// BUILD OPTIONS
// =============================================================================

/// Handling of unrecognised option tokens
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OptionPolicy {
    /// Unknown tokens fail the build with [`ClError::InvalidBuildOptions`]
    #[default]
    Strict,
    /// Unknown tokens are collected in [`BuildOptions::ignored`]
    Lenient,
}

/// OpenCL C language version requested with `-cl-std`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClStd {
    /// `-cl-std=CL1.1`
    Cl11,
    /// `-cl-std=CL1.2`
    Cl12,
}

bitflags::bitflags! {
    /// Floating-point and aliasing relaxations
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct MathFlags: u32 {
        const SINGLE_PRECISION_CONSTANT = 1 << 0;
        const MAD_ENABLE                = 1 << 1;
        const UNSAFE_MATH               = 1 << 2;
        const FINITE_MATH_ONLY          = 1 << 3;
        const FAST_RELAXED_MATH         = 1 << 4;
        const DENORMS_ARE_ZERO          = 1 << 5;
        const STRICT_ALIASING           = 1 << 6;
        const NO_SIGNED_ZEROS           = 1 << 7;
    }
}

/// A preprocessor definition, `name` or `name=value`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MacroDef {
    /// Macro name
    pub name: String,
    /// Replacement text
    pub value: Option<String>,
}

impl MacroDef {
    /// Parse `name` or `name=value`
    pub fn parse(text: &str) -> Self {
        match text.split_once('=') {
            Some((name, value)) => Self {
                name: name.to_owned(),
                value: Some(value.to_owned()),
            },
            None => Self {
                name: text.to_owned(),
                value: None,
            },
        }
    }
}

impl fmt::Display for MacroDef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.value {
            Some(value) => write!(f, "{}={}", self.name, value),
            None => f.write_str(&self.name),
        }
    }
}

/// Parsed build options
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildOptions {
    /// Include directories, in order
    pub include_dirs: Vec<String>,
    /// Macro definitions, in order
    pub defines: Vec<MacroDef>,
    /// Math relaxations
    pub math: MathFlags,
    /// Cleared by `-cl-opt-disable`
    pub optimize: bool,
    /// `-w`
    pub suppress_warnings: bool,
    /// `-Werror`
    pub warnings_as_errors: bool,
    /// `-cl-std=`
    pub std: Option<ClStd>,
    /// `-cl-kernel-arg-info`
    pub kernel_arg_info: bool,
    /// Unknown tokens kept under [`OptionPolicy::Lenient`]
    pub ignored: Vec<String>,
}

impl Default for BuildOptions {
    fn default() -> Self {
        Self {
            include_dirs: Vec::new(),
            defines: Vec::new(),
            math: MathFlags::empty(),
            optimize: true,
            suppress_warnings: false,
            warnings_as_errors: false,
            std: None,
            kernel_arg_info: false,
            ignored: Vec::new(),
        }
    }
}

impl BuildOptions {
    /// Parse a whitespace-separated option string
    pub fn parse(text: &str, policy: OptionPolicy) -> ClResult<Self> {
        let mut options = Self::default();
        let mut tokens = text.split_whitespace();

        while let Some(token) = tokens.next() {
            match token {
                "-I" => {
                    let dir = tokens.next().ok_or(ClError::InvalidBuildOptions)?;
                    options.include_dirs.push(dir.to_owned());
                },
                "-D" => {
                    let def = tokens.next().ok_or(ClError::InvalidBuildOptions)?;
                    options.defines.push(MacroDef::parse(def));
                },
                "-cl-single-precision-constant" => options.math |= MathFlags::SINGLE_PRECISION_CONSTANT,
                "-cl-opt-disable" => options.optimize = false,
                "-cl-mad-enable" => options.math |= MathFlags::MAD_ENABLE,
                "-cl-unsafe-math-optimizations" => options.math |= MathFlags::UNSAFE_MATH,
                "-cl-finite-math-only" => options.math |= MathFlags::FINITE_MATH_ONLY,
                "-cl-fast-relaxed-math" => {
                    options.math |= MathFlags::FAST_RELAXED_MATH
                        | MathFlags::UNSAFE_MATH
                        | MathFlags::FINITE_MATH_ONLY;
                },
                "-cl-denorms-are-zero" => options.math |= MathFlags::DENORMS_ARE_ZERO,
                "-cl-strict-aliasing" => options.math |= MathFlags::STRICT_ALIASING,
                "-cl-no-signed-zeros" => options.math |= MathFlags::NO_SIGNED_ZEROS,
                "-w" => options.suppress_warnings = true,
                "-Werror" => options.warnings_as_errors = true,
                "-cl-std=CL1.1" => options.std = Some(ClStd::Cl11),
                "-cl-std=CL1.2" => options.std = Some(ClStd::Cl12),
                "-cl-kernel-arg-info" => options.kernel_arg_info = true,
                _ => {
                    if let Some(dir) = token.strip_prefix("-I") {
                        options.include_dirs.push(dir.to_owned());
                    } else if let Some(def) = token.strip_prefix("-D") {
                        options.defines.push(MacroDef::parse(def));
                    } else if policy == OptionPolicy::Lenient {
                        log::debug!("compiler: ignoring build option '{}'", token);
                        options.ignored.push(token.to_owned());
                    } else {
                        log::warn!("compiler: invalid build option '{}'", token);
                        return Err(ClError::InvalidBuildOptions);
                    }
                },
            }
        }

        Ok(options)
    }

    /// Add a definition
    pub fn define(&mut self, def: MacroDef) {
        self.defines.push(def);
    }

    /// Add the language version macro and one macro per device extension
    pub fn add_device_macros(&mut self, extensions: &str) {
        self.define(MacroDef::parse("__OPENCL_C_VERSION__=120"));
        for ext in extensions.split_whitespace() {
            self.define(MacroDef::parse(ext));
        }
    }

    /// Whether `name` is defined
    pub fn is_defined(&self, name: &str) -> bool {
        self.defines.iter().any(|d| d.name == name)
    }
}

// =============================================================================
// BUILD LOG
// =============================================================================

/// Append-only build log shared by every build phase of a program
#[derive(Debug, Default)]
pub struct BuildLog {
    text: Mutex<String>,
}

impl BuildLog {
    /// Empty log
    pub fn new() -> Self {
        Self::default()
    }

    /// Append `chunk`, terminating it with a newline
    pub fn append(&self, chunk: &str) {
        if chunk.is_empty() {
            return;
        }
        let mut text = self.text.lock();
        text.push_str(chunk);
        if !chunk.ends_with('\n') {
            text.push('\n');
        }
    }

    /// Everything logged so far
    pub fn text(&self) -> String {
        self.text.lock().clone()
    }

    /// Log length in bytes
    pub fn len(&self) -> usize {
        self.text.lock().len()
    }

    /// Whether nothing was logged
    pub fn is_empty(&self) -> bool {
        self.text.lock().is_empty()
    }
}

// =============================================================================
// COMPILER TRAIT
// =============================================================================

/// Result of one compilation
#[derive(Clone)]
pub struct CompileOutput {
    /// Whether an executable was produced
    pub success: bool,
    /// Linked executable
    pub executable: Option<Arc<dyn Executable>>,
    /// Diagnostics text
    pub log: String,
}

impl CompileOutput {
    /// Failed compilation with diagnostics
    pub fn failed(log: impl Into<String>) -> Self {
        Self {
            success: false,
            executable: None,
            log: log.into(),
        }
    }
}

impl fmt::Debug for CompileOutput {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CompileOutput")
            .field("success", &self.success)
            .field("executable", &self.executable.is_some())
            .field("log", &self.log)
            .finish()
    }
}

/// Source-to-executable compiler
pub trait Compiler: Send + Sync {
    /// Compile and link `source`
    fn compile(&self, options: &BuildOptions, source: &str) -> CompileOutput;
}

// =============================================================================
// NATIVE COMPILER
// =============================================================================

/// Host implementation of one kernel
pub type NativeKernelFn = Arc<dyn Fn(&WorkGroupRange) -> Result<(), ExecFault> + Send + Sync>;

/// Compiler whose kernels are registered host closures.
///
/// Compiling scans the source for `__kernel`/`kernel` function declarations.
/// Every declared kernel must be registered. A source without any kernel is
/// a warning, and an error under `-Werror`.
#[derive(Default)]
pub struct NativeCompiler {
    kernels: hashbrown::HashMap<String, NativeKernelFn>,
}

impl NativeCompiler {
    /// Compiler with no kernels
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `name`
    pub fn with_kernel<F>(mut self, name: &str, body: F) -> Self
    where
        F: Fn(&WorkGroupRange) -> Result<(), ExecFault> + Send + Sync + 'static,
    {
        self.kernels.insert(name.to_owned(), Arc::new(body));
        self
    }

    /// Kernel names declared in `source`
    pub fn declared_kernels(source: &str) -> Vec<String> {
        let mut names = Vec::new();
        let mut tokens = source
            .split(|c: char| !(c.is_alphanumeric() || c == '_'))
            .filter(|t| !t.is_empty())
            .peekable();
        while let Some(token) = tokens.next() {
            if token != "__kernel" && token != "kernel" {
                continue;
            }
            if tokens.next_if(|t| *t == "void").is_some() {
                if let Some(name) = tokens.next() {
                    names.push(name.to_owned());
                }
            }
        }
        names
    }
}

impl fmt::Debug for NativeCompiler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names: Vec<_> = self.kernels.keys().collect();
        names.sort();
        f.debug_struct("NativeCompiler").field("kernels", &names).finish()
    }
}

impl Compiler for NativeCompiler {
    fn compile(&self, options: &BuildOptions, source: &str) -> CompileOutput {
        let declared = Self::declared_kernels(source);
        let mut log = String::new();

        if declared.is_empty() && !options.suppress_warnings {
            log.push_str("warning: program declares no kernels\n");
            if options.warnings_as_errors {
                log.push_str("error: warnings treated as errors\n");
                return CompileOutput::failed(log);
            }
        }

        let mut table = hashbrown::HashMap::new();
        for name in &declared {
            match self.kernels.get(name) {
                Some(body) => {
                    table.insert(name.clone(), body.clone());
                },
                None => log.push_str(&format!("error: no native body for kernel '{}'\n", name)),
            }
        }
        if table.len() != declared.len() {
            return CompileOutput::failed(log);
        }

        CompileOutput {
            success: true,
            executable: Some(Arc::new(NativeExecutable { kernels: table })),
            log,
        }
    }
}

/// Executable produced by [`NativeCompiler`]
struct NativeExecutable {
    kernels: hashbrown::HashMap<String, NativeKernelFn>,
}

impl Executable for NativeExecutable {
    fn run(&self, kernel: &str, range: &WorkGroupRange) -> Result<(), ExecFault> {
        let body = self
            .kernels
            .get(kernel)
            .ok_or(ExecFault("kernel not present in executable"))?;
        body(range)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_defines_and_includes() {
        let opts = BuildOptions::parse("-D FOO -DBAR=2 -I inc -Isrc/include", OptionPolicy::Strict)
            .unwrap();
        assert_eq!(opts.include_dirs, vec!["inc", "src/include"]);
        assert_eq!(opts.defines[0], MacroDef::parse("FOO"));
        assert_eq!(opts.defines[1].value.as_deref(), Some("2"));
    }

    #[test]
    fn test_parse_flags() {
        let opts = BuildOptions::parse(
            "-cl-opt-disable -cl-fast-relaxed-math -cl-mad-enable -w -Werror -cl-std=CL1.1 \
             -cl-kernel-arg-info -cl-denorms-are-zero -cl-strict-aliasing -cl-no-signed-zeros \
             -cl-single-precision-constant",
            OptionPolicy::Strict,
        )
        .unwrap();
        assert!(!opts.optimize);
        assert!(opts.math.contains(MathFlags::UNSAFE_MATH | MathFlags::FINITE_MATH_ONLY));
        assert!(opts.math.contains(MathFlags::MAD_ENABLE | MathFlags::NO_SIGNED_ZEROS));
        assert!(opts.suppress_warnings && opts.warnings_as_errors && opts.kernel_arg_info);
        assert_eq!(opts.std, Some(ClStd::Cl11));
    }

    #[test]
    fn test_unknown_option_policy() {
        assert_eq!(
            BuildOptions::parse("-O3", OptionPolicy::Strict),
            Err(ClError::InvalidBuildOptions)
        );
        let opts = BuildOptions::parse("-O3 -cl-std=CL1.2", OptionPolicy::Lenient).unwrap();
        assert_eq!(opts.ignored, vec!["-O3"]);
        assert_eq!(opts.std, Some(ClStd::Cl12));
    }

    #[test]
    fn test_dangling_operand() {
        assert_eq!(BuildOptions::parse("-D", OptionPolicy::Lenient), Err(ClError::InvalidBuildOptions));
        assert_eq!(BuildOptions::parse("-w -I", OptionPolicy::Strict), Err(ClError::InvalidBuildOptions));
    }

    #[test]
    fn test_device_macros() {
        let mut opts = BuildOptions::default();
        opts.add_device_macros("cl_khr_fp64  cl_khr_byte_addressable_store");
        assert!(opts.is_defined("__OPENCL_C_VERSION__"));
        assert!(opts.is_defined("cl_khr_fp64"));
        assert!(opts.is_defined("cl_khr_byte_addressable_store"));
        assert_eq!(opts.defines[0].to_string(), "__OPENCL_C_VERSION__=120");
    }

    #[test]
    fn test_log_is_cumulative() {
        let log = BuildLog::new();
        log.append("compile: ok");
        log.append("");
        log.append("link: ok\n");
        assert_eq!(log.text(), "compile: ok\nlink: ok\n");
    }

    #[test]
    fn test_declared_kernels() {
        let src = "__kernel void add(global int *a) {}\nkernel void scale(float f) {}\nvoid helper() {}";
        assert_eq!(NativeCompiler::declared_kernels(src), vec!["add", "scale"]);
    }

    #[test]
    fn test_native_compile() {
        let compiler = NativeCompiler::new().with_kernel("add", |_| Ok(()));
        let ok = compiler.compile(&BuildOptions::default(), "__kernel void add() {}");
        assert!(ok.success && ok.executable.is_some());

        let missing = compiler.compile(&BuildOptions::default(), "__kernel void mul() {}");
        assert!(!missing.success);
        assert!(missing.log.contains("'mul'"));
    }

    #[test]
    fn test_werror_on_empty_program() {
        let compiler = NativeCompiler::new();
        let warn = compiler.compile(&BuildOptions::default(), "int x;");
        assert!(warn.success);
        assert!(warn.log.starts_with("warning"));

        let opts = BuildOptions::parse("-Werror", OptionPolicy::Strict).unwrap();
        assert!(!compiler.compile(&opts, "int x;").success);

        let opts = BuildOptions::parse("-w -Werror", OptionPolicy::Strict).unwrap();
        assert!(compiler.compile(&opts, "int x;").success);
    }
}
