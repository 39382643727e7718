//! VM construction configuration.
//!
//! `VmConfig` is the one place a caller (the demonstration binary, or an
//! embedding application) describes what kind of VM to build; it derives
//! `serde::Deserialize` so the demo binary can load one from a TOML file
//! the way the teacher's own configuration surface does.

use serde::Deserialize;

use crate::platform::Architecture;

/// How the x86_64 dispatcher handles MSR accesses the core does not
/// itself model (anything outside the fixed boot MSR list).
///
/// The teacher's original MSR handling silently no-ops every unmodeled
/// MSR; this makes that behavior an explicit, chosen policy instead of
/// an implicit fallthrough, so a caller that wants stricter behavior
/// (`Trap`) or true passthrough semantics can ask for it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MsrPolicy {
    /// Accept the platform's default handling and do not log at more
    /// than debug level.
    Passthrough,
    /// Reads return zero; writes are dropped with a warning. Matches the
    /// teacher's original unconditional no-op, but observable.
    ZeroReadDropWrite,
    /// Fail the exit with `UnsupportedExit` instead of emulating it.
    Trap,
}

impl Default for MsrPolicy {
    fn default() -> Self {
        MsrPolicy::ZeroReadDropWrite
    }
}

/// Guest memory size, in bytes. Stored as a newtype so config files can't
/// accidentally confuse bytes with KiB/MiB.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(transparent)]
pub struct MemorySize(pub u64);

impl MemorySize {
    pub fn mib(count: u64) -> Self {
        Self(count * 1024 * 1024)
    }

    pub fn bytes(self) -> u64 {
        self.0
    }
}

/// Everything needed to construct a [`crate::vm::VirtualMachine`].
#[derive(Debug, Clone, Deserialize)]
pub struct VmConfig {
    /// Guest RAM size.
    pub memory_size: MemorySize,
    /// Target architecture; `None` asks the hypervisor to probe the host
    /// and use whatever it reports.
    #[serde(default)]
    pub arch: Option<ConfiguredArchitecture>,
    /// x86_64 MSR handling policy. Ignored on ARM64 partitions.
    #[serde(default)]
    pub msr_policy: MsrPolicy,
}

/// The subset of [`Architecture`] a config file can name explicitly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConfiguredArchitecture {
    X86_64,
    Arm64,
}

impl From<ConfiguredArchitecture> for Architecture {
    fn from(value: ConfiguredArchitecture) -> Self {
        match value {
            ConfiguredArchitecture::X86_64 => Architecture::X86_64,
            ConfiguredArchitecture::Arm64 => Architecture::Arm64,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_msr_policy_matches_teacher_behavior() {
        assert_eq!(MsrPolicy::default(), MsrPolicy::ZeroReadDropWrite);
    }

    #[test]
    fn config_parses_from_toml() {
        let parsed: VmConfig = toml::from_str(
            r#"
            memory_size = 268435456
            arch = "x86_64"
            msr_policy = "trap"
            "#,
        )
        .unwrap();
        assert_eq!(parsed.memory_size.bytes(), 256 * 1024 * 1024);
        assert_eq!(parsed.arch, Some(ConfiguredArchitecture::X86_64));
        assert_eq!(parsed.msr_policy, MsrPolicy::Trap);
    }

    #[test]
    fn memory_size_helper_converts_mib() {
        assert_eq!(MemorySize::mib(256).bytes(), 268_435_456);
    }
}
