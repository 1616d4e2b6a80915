//! Backoff-related OSD options
//!
//! Passed explicitly to every `Session` and `PgBackoffs`; nothing reads a
//! global configuration.

use crate::error::Result;
use cephconfig::{define_options, CephConfig};
use std::path::Path;

define_options! {
    /// OSD options that control when backoffs are issued
    #[derive(Debug, Clone, PartialEq, Eq)]
    pub struct BackoffConfig {
        /// Block the whole PG for clients while it is peering
        osd_backoff_on_peering: bool = false,

        /// Block individual objects while they are degraded
        osd_backoff_on_degraded: bool = false,

        /// Block individual objects while they are unfound
        osd_backoff_on_unfound: bool = true,

        /// Crash if a client sends an op into a range it has acked a block for
        osd_debug_crash_on_ignored_backoff: bool = false,
    }
}

impl BackoffConfig {
    /// Sections consulted for OSD options, most specific first
    pub const SECTIONS: &'static [&'static str] = &["osd", "global"];

    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let conf = CephConfig::from_file(path)?;
        Ok(Self::from_ceph_config(&conf, Self::SECTIONS))
    }

    /// Options for a specific OSD, e.g. `osd.3`, falling back to `[osd]` and `[global]`
    pub fn for_osd(conf: &CephConfig, whoami: u32) -> Self {
        let name = format!("osd.{}", whoami);
        Self::from_ceph_config(conf, &[name.as_str(), "osd", "global"])
    }
}
