// Intel VT-d 风格 IOMMU 地址转换核心
//
// 本模块实现了DMA重映射的核心功能，包括：
// - 设备上下文解析（根表/上下文表/PASID目录/PASID表）
// - 二级与一级页表遍历
// - IOTLB、PASID-IOTLB与上下文缓存
// - 队列失效（Queued Invalidation）描述符处理
// - 故障记录与事件中断
// - 映射观察者（影子页表）同步与PASID绑定同步

pub mod cache;
pub mod config;
pub mod context;
pub mod device;
pub mod entry;
pub mod error;
pub mod fault;
pub mod interrupt;
pub mod invalidation;
pub mod memory;
pub mod pasid;
pub mod range_walk;
pub mod walker;

use serde::{Deserialize, Serialize};
use std::fmt;

// 重新导出主要类型
pub use cache::{CacheStats, ContextCache, Iotlb, IotlbEntry, PageInvalidation, PasidIotlb};
pub use config::{IommuConfig, ScalableMode};
pub use context::{ContextResolver, ResolveFailure, TranslationRoot};
pub use device::{
    ContextCommand, GlobalCommand, IntelIommu, IommuSnapshot, IommuStats, IotlbCommand,
    TranslationResult, VtdAddressSpace,
};
pub use entry::{
    ContextEntry, LegacyContextEntry, PasidDirEntry, PasidEntry, PasidGranularType, RootEntry,
    RootTablePointer, ScalableContextEntry, TranslationType,
};
pub use error::{FaultReason, FaultResult, IommuError, IommuResult};
pub use fault::{FaultOutcome, FaultRecord, FaultReporter, FaultStatus};
pub use interrupt::{
    InterruptController, InterruptLine, InterruptType, MsiMessage, NullInterruptLine,
};
pub use invalidation::{
    ContextInvalidation, DescriptorType, InvalidationDescriptor, InvalidationQueue,
    IotlbInvalidation, PasidCacheInvalidation, QueueState,
};
pub use memory::{GuestMemory, SparseMemory};
pub use pasid::{
    BindingOp, HostBindingPath, PasidSyncScope, PasidTracker, SyncReport, TrackedPasid,
};
pub use range_walk::{IovaTree, MappingEvent, MappingObserver, NotifierFlags};
pub use walker::{PageWalker, PagingFormat, ReservedMasks, WalkResult};

/// VT-d IOMMU 库版本
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// VT-d IOMMU 库描述
pub const DESCRIPTION: &str = "Intel VT-d style IOMMU translation core for Virtual Machine DMA remapping";

/// 基本常量
pub const PAGE_SHIFT_4K: u32 = 12;
pub const PAGE_SIZE_4K: u64 = 1 << PAGE_SHIFT_4K;
pub const PAGE_MASK_4K: u64 = !(PAGE_SIZE_4K - 1);

/// MSI中断地址窗口，DMA转换结果不得落入该区间
pub const INTERRUPT_ADDR_FIRST: u64 = 0xfee0_0000;
pub const INTERRUPT_ADDR_LAST: u64 = 0xfeef_ffff;

/// 表示"无PASID"的请求
pub const NO_PASID: u32 = u32::MAX;

/// 页失效的最大地址掩码值（MAMV）
pub const MAMV: u8 = 18;

/// 地址宽度上限时的HAW掩码
pub(crate) const fn haw_mask(aw_bits: u8) -> u64 {
    if aw_bits >= 64 {
        u64::MAX
    } else {
        (1u64 << aw_bits) - 1
    }
}

/// PCI设备标识（总线号 + devfn）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DeviceId {
    pub bus: u8,
    pub devfn: u8,
}

impl DeviceId {
    pub const fn new(bus: u8, devfn: u8) -> Self {
        Self { bus, devfn }
    }

    /// 从16位源标识（source-id）构造
    pub const fn from_sid(sid: u16) -> Self {
        Self {
            bus: (sid >> 8) as u8,
            devfn: sid as u8,
        }
    }

    /// 16位源标识：bus << 8 | devfn
    pub const fn sid(&self) -> u16 {
        ((self.bus as u16) << 8) | self.devfn as u16
    }

    pub const fn slot(&self) -> u8 {
        self.devfn >> 3
    }

    pub const fn function(&self) -> u8 {
        self.devfn & 0x7
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:02x}:{:02x}.{:x}", self.bus, self.slot(), self.function())
    }
}

/// 设备地址空间键：设备 + PASID（`NO_PASID` 表示无PASID的请求）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct AddressSpaceKey {
    pub device: DeviceId,
    pub pasid: u32,
}

impl AddressSpaceKey {
    pub const fn new(device: DeviceId, pasid: u32) -> Self {
        Self { device, pasid }
    }

    pub const fn has_pasid(&self) -> bool {
        self.pasid != NO_PASID
    }
}

/// 访问权限（NONE/RO/WO/RW）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct IommuPerm(u8);

impl IommuPerm {
    pub const NONE: Self = Self(0);
    pub const READ: Self = Self(1 << 0);
    pub const WRITE: Self = Self(1 << 1);
    pub const RW: Self = Self(1 << 0 | 1 << 1);

    pub const fn from_flags(read: bool, write: bool) -> Self {
        Self((read as u8) | ((write as u8) << 1))
    }

    pub const fn can_read(self) -> bool {
        self.0 & Self::READ.0 != 0
    }

    pub const fn can_write(self) -> bool {
        self.0 & Self::WRITE.0 != 0
    }

    pub const fn is_none(self) -> bool {
        self.0 == 0
    }

    /// 逐级权限叠加（按位与）
    pub const fn intersect(self, other: Self) -> Self {
        Self(self.0 & other.0)
    }

    pub const fn bits(self) -> u8 {
        self.0
    }
}

impl fmt::Display for IommuPerm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match (self.can_read(), self.can_write()) {
            (false, false) => "none",
            (true, false) => "ro",
            (false, true) => "wo",
            (true, true) => "rw",
        };
        f.write_str(s)
    }
}

/// 访问类型
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessType {
    Read,
    Write,
}

impl AccessType {
    pub const fn is_write(self) -> bool {
        matches!(self, AccessType::Write)
    }
}

/// 页大小（4K叶子、2M与1G大页）
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageSize {
    Size4K = 12,
    Size2M = 21,
    Size1G = 30,
}

impl PageSize {
    /// 由命中的页表层级得到页大小
    pub fn from_level(level: u32) -> Option<Self> {
        match level {
            1 => Some(PageSize::Size4K),
            2 => Some(PageSize::Size2M),
            3 => Some(PageSize::Size1G),
            _ => None,
        }
    }

    /// 获取页大小对应的位偏移
    pub fn shift(&self) -> u32 {
        *self as u32
    }

    /// 获取页大小
    pub fn size(&self) -> u64 {
        1u64 << self.shift()
    }

    /// 页内偏移掩码
    pub fn offset_mask(&self) -> u64 {
        self.size() - 1
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        assert!(!VERSION.is_empty());
        assert!(DESCRIPTION.contains("VT-d"));
    }

    #[test]
    fn test_constants() {
        assert_eq!(PAGE_SIZE_4K, 4096);
        assert_eq!(PAGE_MASK_4K, 0xffff_ffff_ffff_f000);
        assert_eq!(INTERRUPT_ADDR_LAST - INTERRUPT_ADDR_FIRST + 1, 0x10_0000);
        assert_eq!(haw_mask(39), 0x7f_ffff_ffff);
        assert_eq!(haw_mask(64), u64::MAX);
    }

    #[test]
    fn test_device_id_sid() {
        let dev = DeviceId::new(0x12, 0x1b);
        assert_eq!(dev.sid(), 0x121b);
        assert_eq!(DeviceId::from_sid(0x121b), dev);
        assert_eq!(dev.slot(), 3);
        assert_eq!(dev.function(), 3);
        assert_eq!(dev.to_string(), "12:03.3");
    }

    #[test]
    fn test_perm_intersect() {
        let perm = IommuPerm::RW.intersect(IommuPerm::READ);
        assert!(perm.can_read());
        assert!(!perm.can_write());
        assert!(IommuPerm::from_flags(false, false).is_none());
        assert_eq!(IommuPerm::from_flags(true, true), IommuPerm::RW);
        assert_eq!(IommuPerm::WRITE.to_string(), "wo");
    }

    #[test]
    fn test_page_size() {
        assert_eq!(PageSize::from_level(2), Some(PageSize::Size2M));
        assert_eq!(PageSize::Size1G.size(), 1 << 30);
        assert_eq!(PageSize::Size4K.offset_mask(), 0xfff);
        assert_eq!(PageSize::from_level(4), None);
    }
}
