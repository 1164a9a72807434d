//! CPU and OS identification for the process state.
//!
//! The string forms follow the conventions symbol files and report
//! consumers expect: `"x86"`, `"amd64"`, `"arm64"`, … for CPUs and
//! `"Windows NT"`, `"Mac OS X"`, … for OSes, with numeric fallbacks for
//! identifiers this build does not know.

use minidump::system_info::{Cpu, Os};
use minidump::MinidumpSystemInfo;
use serde::Serialize;

/// Information about the system that produced the minidump.
#[derive(Clone, Debug, Serialize)]
pub struct SystemInfo {
    /// Friendly OS name, or `"0x%08x"` of the platform id.
    pub os: String,
    /// Short OS name, as used in symbol-file MODULE records.
    pub os_short: String,
    /// `major.minor.build`, plus the service-pack string when present.
    pub os_version: String,
    /// CPU family name, or `"0x%04x"` of the architecture id.
    pub cpu: String,
    /// Vendor/model description; on ARM includes vendor, part, and the
    /// ELF hwcap feature list.
    pub cpu_info: String,
    pub cpu_count: u32,

    /// Typed ids for the stackwalkers; not part of the report.
    #[serde(skip)]
    pub os_id: Os,
    #[serde(skip)]
    pub cpu_id: Cpu,
}

impl Default for SystemInfo {
    fn default() -> SystemInfo {
        SystemInfo {
            os: String::new(),
            os_short: String::new(),
            os_version: String::new(),
            cpu: String::new(),
            cpu_info: String::new(),
            cpu_count: 0,
            os_id: Os::Unknown(0),
            cpu_id: Cpu::Unknown(0xffff),
        }
    }
}

impl SystemInfo {
    pub fn from_minidump(info: Option<&MinidumpSystemInfo>) -> SystemInfo {
        let Some(info) = info else {
            return SystemInfo::default();
        };
        let raw = &info.raw;

        let os = match raw.platform_id {
            2 => "Windows NT".to_string(),
            1 => "Windows".to_string(),
            0x8101 => "Mac OS X".to_string(),
            0x8102 => "iOS".to_string(),
            0x8201 => "Linux".to_string(),
            0x8202 => "Solaris".to_string(),
            0x8203 => "Android".to_string(),
            0x8204 => "PS3".to_string(),
            0x8205 => "NaCl".to_string(),
            0x8206 => "Fuchsia".to_string(),
            other => format!("0x{other:08x}"),
        };

        let cpu = match info.cpu {
            Cpu::X86 => "x86".to_string(),
            Cpu::X86_64 => "amd64".to_string(),
            Cpu::Ppc => "ppc".to_string(),
            Cpu::Ppc64 => "ppc64".to_string(),
            Cpu::Sparc => "sparc".to_string(),
            Cpu::Arm => "arm".to_string(),
            Cpu::Arm64 => "arm64".to_string(),
            Cpu::Mips => "mips".to_string(),
            Cpu::Mips64 => "mips64".to_string(),
            _ => format!("0x{:04x}", raw.processor_architecture),
        };

        let mut os_version = format!(
            "{}.{}.{}",
            raw.major_version, raw.minor_version, raw.build_number
        );
        if let Some(csd) = info.csd_version() {
            if !csd.is_empty() {
                os_version.push(' ');
                os_version.push_str(&csd);
            }
        }

        SystemInfo {
            os,
            os_short: info.os.to_string(),
            os_version,
            cpu,
            cpu_info: info.cpu_info().map(|s| s.into_owned()).unwrap_or_default(),
            cpu_count: raw.number_of_processors as u32,
            os_id: info.os,
            cpu_id: info.cpu,
        }
    }
}
