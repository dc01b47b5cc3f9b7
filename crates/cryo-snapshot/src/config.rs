use tracing::warn;

use crate::{Result, SnapshotError};

/// `image_size_limit` sentinel: refuse to build any image.
pub const IMAGE_SIZE_NONE: i64 = -2;
/// `image_size_limit` sentinel: no cap.
pub const IMAGE_SIZE_UNLIMITED: i64 = -1;

/// Engine policy, assembled from `name` / `name=value` options the way the
/// host passes kernel command-line parameters down.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Resume device spec: `swap:/dev/xxx[:firstblock]` or `/dev/xxx`.
    pub resume: Option<String>,
    /// Optional fallback image location.
    pub alt_resume: Option<String>,
    /// Pages; [`IMAGE_SIZE_NONE`] = no image, [`IMAGE_SIZE_UNLIMITED`] =
    /// unlimited.
    pub image_size_limit: i64,
    /// Copy pages held back for pageset-1 growth between classification
    /// and the atomic copy.
    pub extra_pages_allowance: u64,
    /// Force pageset-2 empty; everything is copied atomically.
    pub no_pageset2: bool,
    /// Aggressive pageset-2: quiescent anonymous pages stream too.
    pub full_pageset2: bool,
    /// Do not invalidate the image on resume.
    pub keep_image: bool,
    /// Reboot instead of powering off after the image is written.
    pub reboot: bool,
    /// Register as the platform's default hibernator.
    pub replace_swsusp: bool,
    /// Take non-boot CPUs down inside the atomic region rather than before
    /// the freezer.
    pub late_cpu_hotplug: bool,
    /// Freeze and thaw only; write no image.
    pub freezer_test: bool,
    /// Benchmark: drive storage with throwaway data, write no image.
    pub test_bio: bool,
    /// Benchmark: run the filter pipeline only, write nothing.
    pub test_filter_speed: bool,
    /// Insert progress pauses for debugging.
    pub slow: bool,
    /// Suppress the rootfs freeze.
    pub ignore_rootfs: bool,
    /// Force single-threaded I/O.
    pub no_multithreaded_io: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            resume: None,
            alt_resume: None,
            image_size_limit: IMAGE_SIZE_UNLIMITED,
            extra_pages_allowance: 500,
            no_pageset2: false,
            full_pageset2: false,
            keep_image: false,
            reboot: false,
            replace_swsusp: false,
            late_cpu_hotplug: false,
            freezer_test: false,
            test_bio: false,
            test_filter_speed: false,
            slow: false,
            ignore_rootfs: false,
            no_multithreaded_io: false,
        }
    }
}

fn parse_flag(name: &str, value: Option<&str>) -> Result<bool> {
    match value {
        None => Ok(true),
        Some("1") | Some("on") | Some("yes") => Ok(true),
        Some("0") | Some("off") | Some("no") => Ok(false),
        Some(other) => Err(SnapshotError::Config(format!(
            "bad value `{other}` for flag `{name}`"
        ))),
    }
}

impl EngineConfig {
    /// Apply one option in command-line form. Unknown names are reported
    /// and ignored so a newer host can boot an older engine.
    pub fn apply_option(&mut self, option: &str) -> Result<()> {
        let (name, value) = match option.split_once('=') {
            Some((n, v)) => (n, Some(v)),
            None => (option, None),
        };

        let need_value = || -> Result<&str> {
            value.ok_or_else(|| SnapshotError::Config(format!("option `{name}` needs a value")))
        };

        match name {
            "resume" => self.resume = Some(need_value()?.to_owned()),
            "alt_resume_param" => self.alt_resume = Some(need_value()?.to_owned()),
            "image_size_limit" => {
                let raw = need_value()?;
                let pages: i64 = raw.parse().map_err(|_| {
                    SnapshotError::Config(format!("bad image_size_limit `{raw}`"))
                })?;
                if pages < IMAGE_SIZE_NONE {
                    return Err(SnapshotError::Config(format!(
                        "bad image_size_limit `{raw}`"
                    )));
                }
                self.image_size_limit = pages;
            }
            "extra_pages_allowance" => {
                let raw = need_value()?;
                self.extra_pages_allowance = raw.parse().map_err(|_| {
                    SnapshotError::Config(format!("bad extra_pages_allowance `{raw}`"))
                })?;
            }
            "no_pageset2" => self.no_pageset2 = parse_flag(name, value)?,
            "full_pageset2" => self.full_pageset2 = parse_flag(name, value)?,
            "keep_image" => self.keep_image = parse_flag(name, value)?,
            "reboot" => self.reboot = parse_flag(name, value)?,
            "replace_swsusp" => self.replace_swsusp = parse_flag(name, value)?,
            "late_cpu_hotplug" => self.late_cpu_hotplug = parse_flag(name, value)?,
            "freezer_test" => self.freezer_test = parse_flag(name, value)?,
            "test_bio" => self.test_bio = parse_flag(name, value)?,
            "test_filter_speed" => self.test_filter_speed = parse_flag(name, value)?,
            "slow" => self.slow = parse_flag(name, value)?,
            "ignore_rootfs" => self.ignore_rootfs = parse_flag(name, value)?,
            "no_multithreaded_io" => self.no_multithreaded_io = parse_flag(name, value)?,
            _ => warn!(option = name, "ignoring unknown engine option"),
        }
        Ok(())
    }
}
