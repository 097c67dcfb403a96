use std::path::PathBuf;

use anyhow::{Context, Result};
use kds_scheduler::SimCuSpec;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::cli::CliArgs;

/// Simulated fabric: where the CUs live and how each one behaves.
///
/// ```toml
/// base_addr = 0x800000
/// cu_shift = 16
///
/// [[cu]]
/// model = "hls"
/// latency = 8
///
/// [[cu]]
/// model = "acc"
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FabricConfig {
    #[serde(default = "default_base_addr")]
    pub base_addr: u64,

    /// log2 of the stride between CU register windows.
    #[serde(default = "default_cu_shift")]
    pub cu_shift: u32,

    /// Bytes per command-queue slot requested in the CONFIGURE packet.
    #[serde(default = "default_slot_size")]
    pub slot_size: u32,

    #[serde(default, rename = "cu")]
    pub cus: Vec<SimCuSpec>,
}

fn default_base_addr() -> u64 {
    0x80_0000
}

fn default_cu_shift() -> u32 {
    16
}

fn default_slot_size() -> u32 {
    0x1000
}

impl Default for FabricConfig {
    fn default() -> Self {
        Self {
            base_addr: default_base_addr(),
            cu_shift: default_cu_shift(),
            slot_size: default_slot_size(),
            cus: Vec::new(),
        }
    }
}

impl FabricConfig {
    pub fn default_config_path() -> Result<PathBuf> {
        let dir = dirs::config_dir().context("could not determine config directory")?;
        Ok(dir.join("kds").join("fabric.toml"))
    }

    /// Load the fabric from `path`, or the default path.
    /// Returns the default fabric if the file does not exist.
    pub fn load(path: Option<&str>) -> Result<Self> {
        let path = match path {
            Some(p) => PathBuf::from(p),
            None => Self::default_config_path()?,
        };
        if !path.exists() {
            debug!(?path, "Fabric file not found, using defaults");
            return Ok(Self::default());
        }
        debug!(?path, "Loading fabric");
        let content = std::fs::read_to_string(&path)
            .with_context(|| format!("failed to read fabric: {}", path.display()))?;
        toml::from_str(&content)
            .with_context(|| format!("failed to parse fabric: {}", path.display()))
    }

    /// Generate `hls` HLS CUs followed by `acc` ACC CUs when the file
    /// listed none.
    pub fn with_generated(mut self, args: &CliArgs) -> Self {
        if self.cus.is_empty() {
            let hls = if args.hls_queue_log2 == 0 {
                SimCuSpec::hls(args.latency)
            } else {
                SimCuSpec::hls_queued(args.hls_queue_log2, args.latency)
            };
            self.cus = std::iter::repeat(hls)
                .take(args.hls)
                .chain(std::iter::repeat(SimCuSpec::acc(args.latency)).take(args.acc))
                .collect();
        }
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;
    use kds_scheduler::CuModel;

    #[test]
    fn test_parse_fabric() {
        let fabric: FabricConfig = toml::from_str(
            r#"
            cu_shift = 12

            [[cu]]
            model = "hls"
            version = 1
            capacity_log2 = 3

            [[cu]]
            model = "acc"
            latency = 9
            "#,
        )
        .unwrap();
        assert_eq!(fabric.base_addr, 0x80_0000);
        assert_eq!(fabric.cu_shift, 12);
        assert_eq!(fabric.cus.len(), 2);
        assert_eq!(fabric.cus[0], SimCuSpec::hls_queued(3, 4));
        assert_eq!(fabric.cus[1].model, CuModel::Acc);
        assert_eq!(fabric.cus[1].latency, 9);
    }

    #[test]
    fn test_generated_cus_only_fill_empty_fabric() {
        let args = CliArgs::parse_from(["kds-sim", "--hls", "2", "--acc", "1", "--latency", "3"]);
        let fabric = FabricConfig::default().with_generated(&args);
        assert_eq!(
            fabric.cus,
            vec![SimCuSpec::hls(3), SimCuSpec::hls(3), SimCuSpec::acc(3)]
        );

        let args = CliArgs::parse_from(["kds-sim", "--hls", "5"]);
        let fabric = fabric.with_generated(&args);
        assert_eq!(fabric.cus.len(), 3);
    }

    #[test]
    fn test_queued_hls_generation() {
        let args = CliArgs::parse_from(["kds-sim", "--hls", "1", "--hls-queue-log2", "2"]);
        let fabric = FabricConfig::default().with_generated(&args);
        assert_eq!(fabric.cus, vec![SimCuSpec::hls_queued(2, 4)]);
    }

    #[test]
    fn test_missing_file_gives_defaults() {
        let fabric = FabricConfig::load(Some("/nonexistent/kds/fabric.toml")).unwrap();
        assert!(fabric.cus.is_empty());
        assert_eq!(fabric.slot_size, 0x1000);
    }
}
