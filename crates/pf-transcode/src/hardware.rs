//! Hardware encoder detection.
//!
//! A backend counts as available only when ffmpeg lists its H.264 encoder
//! *and* the host exposes the matching device. Detection runs once, when the
//! ffmpeg provider is built.

use std::fmt;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use pf_core::tools::ToolCommand;
use pf_core::Error;

use crate::types::TranscodeRequest;

const ENCODER_LIST_TIMEOUT: Duration = Duration::from_secs(5);

const DRI_RENDER_NODE: &str = "/dev/dri/renderD128";
const DRI_RENDER_VENDOR: &str = "/sys/class/drm/renderD128/device/vendor";
const INTEL_VENDOR_ID: &str = "0x8086";

/// A hardware encoding backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HwAccel {
    VideoToolbox,
    Nvenc,
    Vaapi,
    Qsv,
}

impl HwAccel {
    /// Most preferred first.
    pub const PREFERENCE: [HwAccel; 4] = [Self::VideoToolbox, Self::Nvenc, Self::Vaapi, Self::Qsv];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::VideoToolbox => "videotoolbox",
            Self::Nvenc => "nvenc",
            Self::Vaapi => "vaapi",
            Self::Qsv => "qsv",
        }
    }

    pub fn h264_encoder(&self) -> &'static str {
        match self {
            Self::VideoToolbox => "h264_videotoolbox",
            Self::Nvenc => "h264_nvenc",
            Self::Vaapi => "h264_vaapi",
            Self::Qsv => "h264_qsv",
        }
    }

    /// Decoder flags placed before `-i`.
    pub fn hwaccel_args(&self) -> &'static [&'static str] {
        match self {
            Self::VideoToolbox => &["-hwaccel", "videotoolbox"],
            Self::Nvenc => &["-hwaccel", "cuda"],
            Self::Vaapi => &["-hwaccel", "vaapi", "-hwaccel_output_format", "vaapi"],
            Self::Qsv => &["-hwaccel", "qsv"],
        }
    }

    /// Whether the host exposes the device this backend drives.
    fn device_present(&self) -> bool {
        match self {
            Self::VideoToolbox => cfg!(target_os = "macos"),
            Self::Nvenc => {
                Path::new("/dev/nvidiactl").exists() || Path::new("/proc/driver/nvidia/version").exists()
            }
            Self::Vaapi => Path::new(DRI_RENDER_NODE).exists(),
            Self::Qsv => {
                Path::new(DRI_RENDER_NODE).exists()
                    && std::fs::read_to_string(DRI_RENDER_VENDOR)
                        .is_ok_and(|v| v.trim().eq_ignore_ascii_case(INTEL_VENDOR_ID))
            }
        }
    }
}

impl fmt::Display for HwAccel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for HwAccel {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "videotoolbox" => Ok(Self::VideoToolbox),
            "nvenc" | "cuda" | "nvidia" => Ok(Self::Nvenc),
            "vaapi" => Ok(Self::Vaapi),
            "qsv" => Ok(Self::Qsv),
            other => Err(Error::Validation(format!("unknown hardware acceleration '{other}'"))),
        }
    }
}

/// Encoder names from `ffmpeg -encoders` output.
fn listed_encoders(listing: &str) -> Vec<&str> {
    listing
        .lines()
        .skip_while(|l| !l.trim_start().starts_with("---"))
        .skip(1)
        .filter_map(|l| l.split_whitespace().nth(1))
        .collect()
}

/// Hardware backends usable on this host, in preference order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HardwareSupport {
    available: Vec<HwAccel>,
}

impl HardwareSupport {
    /// Software encoding only.
    pub fn none() -> Self {
        Self::default()
    }

    pub fn from_available(available: impl IntoIterator<Item = HwAccel>) -> Self {
        let wanted: Vec<HwAccel> = available.into_iter().collect();
        Self {
            available: HwAccel::PREFERENCE
                .into_iter()
                .filter(|hw| wanted.contains(hw))
                .collect(),
        }
    }

    /// Backends whose encoder appears in `listing` and whose device passes
    /// `device_present`.
    pub fn from_encoder_listing(listing: &str, device_present: impl Fn(HwAccel) -> bool) -> Self {
        let encoders = listed_encoders(listing);
        Self::from_available(
            HwAccel::PREFERENCE
                .into_iter()
                .filter(|hw| encoders.contains(&hw.h264_encoder()) && device_present(*hw)),
        )
    }

    /// Ask `ffmpeg` which encoders it was built with and check the host's
    /// devices. Any failure means software only.
    pub async fn detect(ffmpeg: &Path) -> Self {
        let listing = ToolCommand::new(ffmpeg.to_path_buf())
            .args(["-hide_banner", "-encoders"])
            .timeout(ENCODER_LIST_TIMEOUT)
            .execute()
            .await;
        let support = match listing {
            Ok(output) => Self::from_encoder_listing(&output.stdout, |hw| hw.device_present()),
            Err(e) => {
                tracing::warn!(error = %e, "Could not list ffmpeg encoders, using software encoding");
                return Self::none();
            }
        };
        if support.available.is_empty() {
            tracing::info!("No hardware encoders detected, using software encoding");
        } else {
            tracing::info!(backends = ?support.names(), "Detected hardware encoders");
        }
        support
    }

    pub fn available(&self) -> &[HwAccel] {
        &self.available
    }

    pub fn best(&self) -> Option<HwAccel> {
        self.available.first().copied()
    }

    pub fn names(&self) -> Vec<String> {
        self.available.iter().map(|hw| hw.as_str().to_string()).collect()
    }

    /// Backend to encode `request` with. `None` means software.
    ///
    /// A named backend that is not available falls back to software, as does
    /// a request that does not prefer hardware.
    pub fn select(&self, request: &TranscodeRequest) -> Option<HwAccel> {
        if !request.prefer_hardware {
            return None;
        }
        let Some(name) = request.hardware_type.as_deref() else {
            return self.best();
        };
        match name.parse::<HwAccel>() {
            Ok(hw) if self.available.contains(&hw) => Some(hw),
            Ok(hw) => {
                tracing::warn!(requested = %hw, "Hardware backend not available, using software encoding");
                None
            }
            Err(e) => {
                tracing::warn!(error = %e, "Using software encoding");
                None
            }
        }
    }
}
