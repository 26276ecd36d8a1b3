// IOMMU配置
//
// 配置在设备构造时确定，运行期间不可变。

use crate::error::{IommuError, IommuResult};
use crate::haw_mask;
use serde::{Deserialize, Serialize};

/// 支持的主机地址宽度
pub const HOST_AW_39BIT: u8 = 39;
pub const HOST_AW_48BIT: u8 = 48;

/// 可扩展模式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScalableMode {
    /// 仅支持传统模式（legacy）根表/上下文表
    #[default]
    Off,
    /// 可扩展模式，仅二级转换
    Legacy,
    /// 可扩展模式，支持一级转换与主机PASID绑定
    Modern,
}

impl ScalableMode {
    pub fn is_enabled(self) -> bool {
        !matches!(self, ScalableMode::Off)
    }

    pub fn is_modern(self) -> bool {
        matches!(self, ScalableMode::Modern)
    }
}

/// IOMMU配置
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct IommuConfig {
    /// 主机地址宽度（39或48）
    pub aw_bits: u8,
    /// 可扩展模式
    pub scalable_mode: ScalableMode,
    /// PASID支持（需要可扩展模式）
    pub pasid_enabled: bool,
    /// PASID宽度（位数）
    pub pasid_size_bits: u8,
    /// 缓存模式：guest需对非present到present的变化也发出失效
    pub caching_mode: bool,
    /// 设备IOTLB（ATS）支持
    pub device_iotlb: bool,
    /// 直通（pass-through）支持
    pub pass_through: bool,
    /// 窥探控制（snoop control）
    pub snoop_control: bool,
    /// DMA地址转换支持
    pub dma_translation: bool,
    /// DMA读写排空
    pub dma_drain: bool,
    /// 故障记录寄存器数量
    pub fault_record_count: usize,
    /// IOTLB最大条目数
    pub iotlb_capacity: usize,
    /// PASID-IOTLB最大条目数
    pub pasid_iotlb_capacity: usize,
}

impl Default for IommuConfig {
    fn default() -> Self {
        Self {
            aw_bits: HOST_AW_39BIT,
            scalable_mode: ScalableMode::Off,
            pasid_enabled: false,
            pasid_size_bits: 20,
            caching_mode: false,
            device_iotlb: false,
            pass_through: true,
            snoop_control: false,
            dma_translation: true,
            dma_drain: true,
            fault_record_count: 1,
            iotlb_capacity: 1024,
            pasid_iotlb_capacity: 1024,
        }
    }
}

impl IommuConfig {
    /// 检查配置组合是否合法
    ///
    /// # 返回
    /// - `Ok(())`: 配置合法
    /// - `Err(IommuError::InvalidConfig)`: 非法组合
    pub fn validate(&self) -> IommuResult<()> {
        if self.scalable_mode.is_enabled() && !self.dma_drain {
            return Err(IommuError::InvalidConfig(
                "scalable mode requires dma_drain".into(),
            ));
        }
        if self.scalable_mode.is_modern() {
            if self.aw_bits != HOST_AW_48BIT {
                return Err(IommuError::InvalidConfig(format!(
                    "modern scalable mode supports aw_bits={} only",
                    HOST_AW_48BIT
                )));
            }
        } else if self.aw_bits != HOST_AW_39BIT && self.aw_bits != HOST_AW_48BIT {
            return Err(IommuError::InvalidConfig(format!(
                "supported values for aw_bits are {} and {}, got {}",
                HOST_AW_48BIT, HOST_AW_39BIT, self.aw_bits
            )));
        }
        if self.pasid_enabled && !self.scalable_mode.is_enabled() {
            return Err(IommuError::InvalidConfig(
                "PASID requires scalable mode".into(),
            ));
        }
        if self.pasid_size_bits == 0 || self.pasid_size_bits > 20 {
            return Err(IommuError::InvalidConfig(format!(
                "pasid_size_bits must be within 1..=20, got {}",
                self.pasid_size_bits
            )));
        }
        if self.fault_record_count == 0 {
            return Err(IommuError::InvalidConfig(
                "at least one fault recording register is required".into(),
            ));
        }
        if self.iotlb_capacity == 0 || self.pasid_iotlb_capacity == 0 {
            return Err(IommuError::InvalidConfig(
                "cache capacity must be non-zero".into(),
            ));
        }
        Ok(())
    }

    pub fn with_aw_bits(mut self, aw_bits: u8) -> Self {
        self.aw_bits = aw_bits;
        self
    }

    pub fn with_scalable_mode(mut self, mode: ScalableMode) -> Self {
        self.scalable_mode = mode;
        self
    }

    pub fn with_pasid(mut self, enabled: bool) -> Self {
        self.pasid_enabled = enabled;
        self
    }

    pub fn with_caching_mode(mut self, enabled: bool) -> Self {
        self.caching_mode = enabled;
        self
    }

    pub fn with_device_iotlb(mut self, enabled: bool) -> Self {
        self.device_iotlb = enabled;
        self
    }

    pub fn with_pass_through(mut self, enabled: bool) -> Self {
        self.pass_through = enabled;
        self
    }

    pub fn with_snoop_control(mut self, enabled: bool) -> Self {
        self.snoop_control = enabled;
        self
    }

    pub fn with_fault_record_count(mut self, count: usize) -> Self {
        self.fault_record_count = count;
        self
    }

    pub fn with_iotlb_capacity(mut self, capacity: usize) -> Self {
        self.iotlb_capacity = capacity;
        self
    }

    /// 主机地址宽度掩码
    pub fn haw_mask(&self) -> u64 {
        haw_mask(self.aw_bits)
    }

    /// 二级页表层级是否被支持（SAGAW）
    pub fn is_level_supported(&self, level: u32) -> bool {
        if !self.dma_translation {
            return false;
        }
        match level {
            3 => true,
            4 => self.aw_bits >= HOST_AW_48BIT,
            _ => false,
        }
    }

    /// PASID重放遍历的上界（不含）
    pub fn pasid_limit(&self) -> u32 {
        if self.pasid_enabled {
            1u32 << self.pasid_size_bits
        } else {
            2
        }
    }
}
