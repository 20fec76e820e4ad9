//! Decoder capability and runtime environment detection
//!
//! Answers two questions before codec negotiation: can this machine decode
//! a codec in hardware, and is the process running under an emulator or
//! hypervisor. Both answers are conservative: anything that cannot be
//! verified is reported as unsupported / not simulated.

use std::sync::{Arc, OnceLock};
use tracing::{debug, info};

use super::codec::VideoCodec;
use crate::config::CapabilityOverride;

/// Capability queries used by the codec filter
pub trait CapabilityInspector: Send + Sync {
    /// Whether a hardware decoder exists for `codec`
    fn has_hardware_decoder(&self, codec: VideoCodec) -> bool;

    /// Whether the process runs in an emulated or virtualized environment
    fn is_simulated_environment(&self) -> bool;
}

/// Detection results for the current machine, computed once per process
#[derive(Debug, Clone, Default)]
struct PlatformDetection {
    hardware_decoders: Vec<VideoCodec>,
    simulated: bool,
}

static PLATFORM_DETECTION: OnceLock<PlatformDetection> = OnceLock::new();

/// Inspector backed by the host platform
///
/// On Linux hardware decode is detected through VA-API (`vainfo`) and
/// V4L2 memory-to-memory decoder devices; the environment check reads the
/// CPU `hypervisor` flag and the DMI vendor strings. Other platforms report
/// no hardware decoders.
#[derive(Debug, Clone, Copy, Default)]
pub struct PlatformInspector;

impl PlatformInspector {
    pub fn new() -> Self {
        Self
    }

    fn detection(&self) -> &'static PlatformDetection {
        PLATFORM_DETECTION.get_or_init(|| {
            let detected = detect_platform();
            info!(
                "Platform capabilities: hardware decoders [{}], simulated={}",
                detected
                    .hardware_decoders
                    .iter()
                    .map(|c| c.display_name())
                    .collect::<Vec<_>>()
                    .join(", "),
                detected.simulated
            );
            detected
        })
    }
}

impl CapabilityInspector for PlatformInspector {
    fn has_hardware_decoder(&self, codec: VideoCodec) -> bool {
        self.detection().hardware_decoders.contains(&codec)
    }

    fn is_simulated_environment(&self) -> bool {
        self.detection().simulated
    }
}

const ALL_CODECS: [VideoCodec; 5] = [
    VideoCodec::H264,
    VideoCodec::H265,
    VideoCodec::VP8,
    VideoCodec::VP9,
    VideoCodec::AV1,
];

#[cfg(target_os = "linux")]
fn detect_platform() -> PlatformDetection {
    let vainfo = vainfo_output().unwrap_or_default();
    let m2m_names = v4l2_device_names();

    let hardware_decoders = ALL_CODECS
        .into_iter()
        .filter(|codec| {
            vainfo_supports_decode(&vainfo, *codec)
                || m2m_names.iter().any(|name| v4l2_name_matches(name, *codec))
        })
        .collect();

    let cpuinfo = std::fs::read_to_string("/proc/cpuinfo").unwrap_or_default();
    let sys_vendor = read_trimmed("/sys/class/dmi/id/sys_vendor");
    let product_name = read_trimmed("/sys/class/dmi/id/product_name");

    PlatformDetection {
        hardware_decoders,
        simulated: cpuinfo_has_hypervisor(&cpuinfo)
            || dmi_is_virtual(&sys_vendor, &product_name),
    }
}

#[cfg(not(target_os = "linux"))]
fn detect_platform() -> PlatformDetection {
    debug!("No decoder detection for this platform, assuming software decode only");
    PlatformDetection::default()
}

#[cfg(target_os = "linux")]
fn read_trimmed(path: &str) -> String {
    std::fs::read_to_string(path)
        .map(|s| s.trim().to_string())
        .unwrap_or_default()
}

#[cfg(target_os = "linux")]
fn vainfo_output() -> Option<String> {
    use std::process::Command;

    // Prefer the DRM display so detection works without X/Wayland
    for args in [&["--display", "drm"][..], &[][..]] {
        match Command::new("vainfo").args(args).output() {
            Ok(output) if output.status.success() => {
                return Some(String::from_utf8_lossy(&output.stdout).into_owned());
            }
            Ok(output) => {
                debug!("vainfo {:?} exited with {}", args, output.status);
            }
            Err(e) => {
                debug!("vainfo not available: {}", e);
                return None;
            }
        }
    }
    None
}

#[cfg(target_os = "linux")]
fn v4l2_device_names() -> Vec<String> {
    let entries = match std::fs::read_dir("/sys/class/video4linux") {
        Ok(entries) => entries,
        Err(_) => return Vec::new(),
    };
    entries
        .flatten()
        .filter_map(|entry| std::fs::read_to_string(entry.path().join("name")).ok())
        .map(|name| name.trim().to_string())
        .collect()
}

/// VA-API profile name prefixes per codec
fn vaapi_profiles(codec: VideoCodec) -> &'static [&'static str] {
    match codec {
        VideoCodec::H264 => &["VAProfileH264"],
        VideoCodec::H265 => &["VAProfileHEVCMain"],
        VideoCodec::VP8 => &["VAProfileVP8"],
        VideoCodec::VP9 => &["VAProfileVP9"],
        VideoCodec::AV1 => &["VAProfileAV1"],
    }
}

/// Whether `vainfo` output lists a decode (VLD) entrypoint for `codec`
fn vainfo_supports_decode(output: &str, codec: VideoCodec) -> bool {
    let profiles = vaapi_profiles(codec);
    output.lines().any(|line| {
        let Some((profile, entrypoint)) = line.split_once(':') else {
            return false;
        };
        let profile = profile.trim();
        profiles.iter().any(|p| profile.starts_with(p))
            && entrypoint.trim() == "VAEntrypointVLD"
    })
}

/// Whether a V4L2 device name looks like a stateless/stateful decoder for `codec`
fn v4l2_name_matches(name: &str, codec: VideoCodec) -> bool {
    let name = name.to_ascii_lowercase();
    let tokens: &[&str] = match codec {
        VideoCodec::H264 => &["h264", "avc"],
        VideoCodec::H265 => &["hevc", "h265"],
        VideoCodec::VP8 => &["vp8"],
        VideoCodec::VP9 => &["vp9"],
        VideoCodec::AV1 => &["av1"],
    };
    // Encoders share the naming scheme
    if name.contains("enc") {
        return false;
    }
    tokens.iter().any(|t| name.contains(t))
}

fn cpuinfo_has_hypervisor(cpuinfo: &str) -> bool {
    cpuinfo
        .lines()
        .filter(|line| line.starts_with("flags"))
        .any(|line| line.split_whitespace().any(|flag| flag == "hypervisor"))
}

fn dmi_is_virtual(sys_vendor: &str, product_name: &str) -> bool {
    const VIRTUAL_MARKERS: &[&str] = &[
        "qemu",
        "kvm",
        "virtualbox",
        "innotek",
        "vmware",
        "xen",
        "bochs",
        "parallels",
        "virtual machine",
    ];
    let haystack = format!("{} {}", sys_vendor, product_name).to_ascii_lowercase();
    VIRTUAL_MARKERS.iter().any(|m| haystack.contains(m))
}

/// Inspector with fixed answers
#[derive(Debug, Clone, Default)]
pub struct FixedCapabilities {
    pub hardware_decoders: Vec<VideoCodec>,
    pub simulated: bool,
}

impl FixedCapabilities {
    pub fn new(hardware_decoders: Vec<VideoCodec>, simulated: bool) -> Self {
        Self {
            hardware_decoders,
            simulated,
        }
    }
}

impl CapabilityInspector for FixedCapabilities {
    fn has_hardware_decoder(&self, codec: VideoCodec) -> bool {
        self.hardware_decoders.contains(&codec)
    }

    fn is_simulated_environment(&self) -> bool {
        self.simulated
    }
}

/// Applies configured overrides on top of another inspector
pub struct OverrideInspector {
    inner: Arc<dyn CapabilityInspector>,
    overrides: CapabilityOverride,
}

impl OverrideInspector {
    pub fn new(inner: Arc<dyn CapabilityInspector>, overrides: CapabilityOverride) -> Self {
        if !overrides.is_empty() {
            info!("Capability overrides active: {:?}", overrides);
        }
        Self { inner, overrides }
    }
}

impl CapabilityInspector for OverrideInspector {
    fn has_hardware_decoder(&self, codec: VideoCodec) -> bool {
        match (codec, self.overrides.hardware_h265) {
            (VideoCodec::H265, Some(forced)) => forced,
            _ => self.inner.has_hardware_decoder(codec),
        }
    }

    fn is_simulated_environment(&self) -> bool {
        self.overrides
            .simulated
            .unwrap_or_else(|| self.inner.is_simulated_environment())
    }
}
