//! CU metadata supplied by whoever loaded the bitstream.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::cu::CuModel;

/// Lookup of CU register protocols by base address.
pub trait BitstreamLayout: Send + Sync {
    /// Protocol of the CU at `addr`, or `None` if the bitstream has no CU there.
    fn cu_model(&self, addr: u64) -> Option<CuModel>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CuDescriptor {
    pub addr: u64,
    pub model: CuModel,
}

/// Explicit address-to-model table.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CuLayout {
    #[serde(default, rename = "cu")]
    cus: Vec<CuDescriptor>,
    #[serde(skip)]
    by_addr: HashMap<u64, CuModel>,
}

impl CuLayout {
    pub fn new(cus: Vec<CuDescriptor>) -> Self {
        let by_addr = cus.iter().map(|d| (d.addr, d.model)).collect();
        Self { cus, by_addr }
    }

    /// CUs laid out at `base + (i << shift)`: `hls` HLS cores followed by
    /// `acc` ACC cores.
    pub fn strided(base: u64, shift: u32, hls: usize, acc: usize) -> Self {
        let cus = (0..hls + acc)
            .map(|i| CuDescriptor {
                addr: base + ((i as u64) << shift),
                model: if i < hls { CuModel::Hls } else { CuModel::Acc },
            })
            .collect();
        Self::new(cus)
    }

    pub fn descriptors(&self) -> &[CuDescriptor] {
        &self.cus
    }
}

impl BitstreamLayout for CuLayout {
    fn cu_model(&self, addr: u64) -> Option<CuModel> {
        if self.by_addr.len() == self.cus.len() {
            return self.by_addr.get(&addr).copied();
        }
        self.cus.iter().find(|d| d.addr == addr).map(|d| d.model)
    }
}

/// Layout that reports every address as the same model.
#[derive(Debug, Clone, Copy)]
pub struct UniformLayout(pub CuModel);

impl BitstreamLayout for UniformLayout {
    fn cu_model(&self, _addr: u64) -> Option<CuModel> {
        Some(self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_strided_layout() {
        let layout = CuLayout::strided(0x80_0000, 16, 2, 1);
        assert_eq!(layout.cu_model(0x80_0000), Some(CuModel::Hls));
        assert_eq!(layout.cu_model(0x81_0000), Some(CuModel::Hls));
        assert_eq!(layout.cu_model(0x82_0000), Some(CuModel::Acc));
        assert_eq!(layout.cu_model(0x83_0000), None);
    }

    #[test]
    fn test_layout_from_toml() {
        let layout: CuLayout = toml::from_str(
            r#"
            [[cu]]
            addr = 4096
            model = "acc"
            "#,
        )
        .unwrap();
        assert_eq!(layout.cu_model(4096), Some(CuModel::Acc));
    }

    #[test]
    fn test_uniform_layout() {
        assert_eq!(UniformLayout(CuModel::Hls).cu_model(0xdead), Some(CuModel::Hls));
    }
}
