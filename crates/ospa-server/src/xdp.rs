//! XDP pre-filter that drops datagrams to the server port unless they carry
//! a valid ADK proof.
//!
//! The eBPF object is built separately (`crates/ospa-xdp-ebpf`) and loaded
//! from disk at runtime. Without the `xdp` feature every operation reports
//! [`XdpError::NotSupported`] and the server runs without the pre-filter.

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use thiserror::Error;

use crate::adk::{AdkProofSink, AdkSyncError};
use crate::metrics::ServerMetrics;

pub const PROGRAM_NAME: &str = "xdp_openspa_adk";
pub const CONFIG_MAP: &str = "xdp_config_map";
pub const STATS_MAP: &str = "xdp_stats_map";
pub const OPENSPA_STATS_MAP: &str = "xdp_openspa_stats_map";

/// Config map layout shared with the eBPF program.
pub const CONFIG_SERVER_PORT: u32 = 0;
pub const CONFIG_ADK_PROOF_CURRENT: u32 = 1;
pub const CONFIG_ADK_PROOF_NEXT: u32 = 2;

/// XDP actions in kernel numbering; also the stats map index.
pub const ACTIONS: [(u32, &str); 5] = [
    (0, "aborted"),
    (1, "drop"),
    (2, "pass"),
    (3, "tx"),
    (4, "redirect"),
];

#[derive(Debug, Error)]
pub enum XdpError {
    #[error("xdp is not supported in this build")]
    NotSupported,
    #[error("unknown xdp mode {0:?}, expected skb or driver")]
    UnknownMode(String),
    #[error("load xdp object: {0}")]
    Load(String),
    #[error("attach xdp program to {iface}: {reason}")]
    Attach { iface: String, reason: String },
    #[error("xdp map {map}: {reason}")]
    Map { map: &'static str, reason: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum XdpMode {
    #[default]
    Skb,
    Driver,
}

impl FromStr for XdpMode {
    type Err = XdpError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "skb" => Ok(XdpMode::Skb),
            "driver" => Ok(XdpMode::Driver),
            other => Err(XdpError::UnknownMode(other.to_string())),
        }
    }
}

impl fmt::Display for XdpMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            XdpMode::Skb => "skb",
            XdpMode::Driver => "driver",
        })
    }
}

#[derive(Debug, Clone)]
pub struct XdpSettings {
    pub interface: String,
    pub mode: XdpMode,
    pub object_path: PathBuf,
    pub server_port: u16,
    pub replace_if_loaded: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsRecord {
    pub packets: u64,
    pub bytes: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct XdpStats {
    /// Indexed like [`ACTIONS`].
    pub actions: [StatsRecord; 5],
    pub not_openspa: u64,
    pub adk_invalid: u64,
    pub adk_valid: u64,
}

impl XdpStats {
    /// Counters from several interfaces add up.
    pub fn merge(mut self, other: &XdpStats) -> Self {
        for (acc, rec) in self.actions.iter_mut().zip(other.actions.iter()) {
            acc.packets += rec.packets;
            acc.bytes += rec.bytes;
        }
        self.not_openspa += other.not_openspa;
        self.adk_invalid += other.adk_invalid;
        self.adk_valid += other.adk_valid;
        self
    }

    pub fn record(&self, metrics: &ServerMetrics) {
        for ((_, action), rec) in ACTIONS.iter().zip(self.actions.iter()) {
            metrics.xdp_observe(action, rec.packets, rec.bytes);
        }
        metrics.xdp_openspa_observe("not-openspa", self.not_openspa);
        metrics.xdp_openspa_observe("adk-invalid", self.adk_invalid);
        metrics.xdp_openspa_observe("adk-valid", self.adk_valid);
    }
}

/// True when this build can load the XDP program.
pub fn xdp_supported() -> bool {
    cfg!(all(feature = "xdp", target_os = "linux"))
}

#[cfg(feature = "xdp")]
mod imp {
    use aya::maps::{Array, PerCpuArray};
    use aya::programs::{Xdp, XdpFlags};
    use aya::Ebpf;
    use parking_lot::Mutex;
    use tracing::info;

    use super::*;

    #[repr(C)]
    #[derive(Clone, Copy, Default)]
    struct StatsDatarec {
        rx_packets: u64,
        rx_bytes: u64,
    }

    // SAFETY: plain old data matching `struct datarec` in the eBPF program.
    unsafe impl aya::Pod for StatsDatarec {}

    fn map_err(map: &'static str) -> impl Fn(aya::maps::MapError) -> XdpError {
        move |err| XdpError::Map {
            map,
            reason: err.to_string(),
        }
    }

    /// A loaded and attached XDP program. Dropping it detaches the program.
    pub struct XdpAdk {
        ebpf: Mutex<Ebpf>,
        interface: String,
    }

    impl fmt::Debug for XdpAdk {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            f.debug_struct("XdpAdk")
                .field("interface", &self.interface)
                .finish_non_exhaustive()
        }
    }

    impl XdpAdk {
        pub fn load(settings: &XdpSettings) -> Result<Self, XdpError> {
            let mut ebpf = Ebpf::load_file(&settings.object_path)
                .map_err(|err| XdpError::Load(err.to_string()))?;

            {
                let mut config: Array<_, u32> = Array::try_from(
                    ebpf.map_mut(CONFIG_MAP).ok_or(XdpError::Map {
                        map: CONFIG_MAP,
                        reason: "not found".into(),
                    })?,
                )
                .map_err(map_err(CONFIG_MAP))?;
                config
                    .set(CONFIG_SERVER_PORT, u32::from(settings.server_port), 0)
                    .map_err(map_err(CONFIG_MAP))?;
            }

            let mut flags = match settings.mode {
                XdpMode::Skb => XdpFlags::SKB_MODE,
                XdpMode::Driver => XdpFlags::DRV_MODE,
            };
            if !settings.replace_if_loaded {
                flags |= XdpFlags::UPDATE_IF_NOEXIST;
            }

            let attach_err = |reason: String| XdpError::Attach {
                iface: settings.interface.clone(),
                reason,
            };
            let program: &mut Xdp = ebpf
                .program_mut(PROGRAM_NAME)
                .ok_or_else(|| attach_err(format!("program {PROGRAM_NAME} not found")))?
                .try_into()
                .map_err(|err: aya::programs::ProgramError| attach_err(err.to_string()))?;
            program.load().map_err(|err| attach_err(err.to_string()))?;
            program
                .attach(&settings.interface, flags)
                .map_err(|err| attach_err(err.to_string()))?;

            info!(
                target: "openspa::adk",
                iface = %settings.interface,
                mode = %settings.mode,
                port = settings.server_port,
                "xdp adk program attached"
            );
            Ok(Self {
                ebpf: Mutex::new(ebpf),
                interface: settings.interface.clone(),
            })
        }

        pub fn interface(&self) -> &str {
            &self.interface
        }

        pub fn stats(&self) -> Result<XdpStats, XdpError> {
            let ebpf = self.ebpf.lock();
            let mut stats = XdpStats::default();

            let actions: PerCpuArray<_, StatsDatarec> = PerCpuArray::try_from(
                ebpf.map(STATS_MAP).ok_or(XdpError::Map {
                    map: STATS_MAP,
                    reason: "not found".into(),
                })?,
            )
            .map_err(map_err(STATS_MAP))?;
            for (slot, (index, _)) in stats.actions.iter_mut().zip(ACTIONS.iter()) {
                let values = actions.get(index, 0).map_err(map_err(STATS_MAP))?;
                for rec in values.iter() {
                    slot.packets += rec.rx_packets;
                    slot.bytes += rec.rx_bytes;
                }
            }

            let openspa: PerCpuArray<_, u64> = PerCpuArray::try_from(
                ebpf.map(OPENSPA_STATS_MAP).ok_or(XdpError::Map {
                    map: OPENSPA_STATS_MAP,
                    reason: "not found".into(),
                })?,
            )
            .map_err(map_err(OPENSPA_STATS_MAP))?;
            let sum = |index: u32| -> Result<u64, XdpError> {
                let values = openspa.get(&index, 0).map_err(map_err(OPENSPA_STATS_MAP))?;
                Ok(values.iter().sum())
            };
            stats.not_openspa = sum(0)?;
            stats.adk_invalid = sum(1)?;
            stats.adk_valid = sum(2)?;
            Ok(stats)
        }
    }

    impl AdkProofSink for XdpAdk {
        fn set_proofs(&self, current: u32, next: u32) -> Result<(), AdkSyncError> {
            let mut ebpf = self.ebpf.lock();
            let map = ebpf
                .map_mut(CONFIG_MAP)
                .ok_or_else(|| AdkSyncError::Sink(format!("{CONFIG_MAP} not found")))?;
            let mut config: Array<_, u32> = Array::try_from(map)
                .map_err(|err: aya::maps::MapError| AdkSyncError::Sink(err.to_string()))?;
            let sink_err = |err: aya::maps::MapError| AdkSyncError::Sink(err.to_string());
            config
                .set(CONFIG_ADK_PROOF_CURRENT, current, 0)
                .map_err(sink_err)?;
            config.set(CONFIG_ADK_PROOF_NEXT, next, 0).map_err(sink_err)
        }
    }
}

#[cfg(not(feature = "xdp"))]
mod imp {
    use super::*;

    /// Placeholder for builds without the `xdp` feature; it cannot be loaded.
    #[derive(Debug)]
    pub struct XdpAdk {
        _unconstructible: (),
    }

    impl XdpAdk {
        pub fn load(_settings: &XdpSettings) -> Result<Self, XdpError> {
            Err(XdpError::NotSupported)
        }

        pub fn interface(&self) -> &str {
            ""
        }

        pub fn stats(&self) -> Result<XdpStats, XdpError> {
            Err(XdpError::NotSupported)
        }
    }

    impl AdkProofSink for XdpAdk {
        fn set_proofs(&self, _current: u32, _next: u32) -> Result<(), AdkSyncError> {
            Err(AdkSyncError::Sink(XdpError::NotSupported.to_string()))
        }
    }
}

pub use imp::XdpAdk;
