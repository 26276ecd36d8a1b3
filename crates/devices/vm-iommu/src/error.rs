// IOMMU错误类型定义
//
// 包括两层：
// - FaultReason：写入故障记录寄存器的硬件故障原因码
// - IommuError：库接口返回的错误

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// DMA重映射故障原因码
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum FaultReason {
    /// 根表项不存在
    RootEntryNotPresent = 0x1,
    /// 上下文表项不存在
    ContextEntryNotPresent = 0x2,
    /// 上下文表项无效
    ContextEntryInvalid = 0x3,
    /// 地址超出MGAW
    AddressBeyondMgaw = 0x4,
    /// 写权限不足
    Write = 0x5,
    /// 读权限不足
    Read = 0x6,
    /// 页表项无效
    PagingEntryInvalid = 0x7,
    /// 根表地址无法访问
    RootTableInvalid = 0x8,
    /// 上下文表地址无法访问
    ContextTableInvalid = 0x9,
    /// 根表项保留位非零
    RootEntryReserved = 0xa,
    /// 上下文表项保留位非零
    ContextEntryReserved = 0xb,
    /// 页表项保留位非零
    PagingEntryReserved = 0xc,
    /// 上下文表项转换类型非法
    ContextEntryTranslationType = 0xd,
    /// 转换结果落入中断地址窗口
    InterruptAddr = 0xe,
    /// 根表转换模式非法
    RootTableTranslationModeInvalid = 0x31,
    /// PASID目录访问失败
    PasidDirAccessError = 0x50,
    /// PASID目录项不存在
    PasidDirEntryNotPresent = 0x51,
    /// PASID表访问失败
    PasidTableAccessError = 0x58,
    /// PASID表项不存在
    PasidEntryNotPresent = 0x59,
    /// PASID表项无效
    PasidTableEntryInvalid = 0x5b,
    /// 可扩展模式下转换结果落入中断地址窗口
    ScalableInterruptAddr = 0x87,
}

impl FaultReason {
    /// 故障原因码
    pub const fn code(self) -> u8 {
        self as u8
    }

    /// 是否为"合格"故障：FPD置位时这些故障不被记录
    pub const fn is_qualified(self) -> bool {
        matches!(
            self,
            FaultReason::ContextEntryNotPresent
                | FaultReason::ContextEntryInvalid
                | FaultReason::AddressBeyondMgaw
                | FaultReason::Write
                | FaultReason::Read
                | FaultReason::PagingEntryInvalid
                | FaultReason::InterruptAddr
                | FaultReason::PagingEntryReserved
                | FaultReason::ContextEntryTranslationType
                | FaultReason::PasidDirEntryNotPresent
                | FaultReason::PasidEntryNotPresent
                | FaultReason::PasidTableEntryInvalid
                | FaultReason::ScalableInterruptAddr
        )
    }

    /// 设备尚未配置（根表项或上下文表项不存在），不视为guest错误
    pub const fn is_benign_absence(self) -> bool {
        matches!(
            self,
            FaultReason::RootEntryNotPresent | FaultReason::ContextEntryNotPresent
        )
    }

    /// 由原因码解析
    pub fn from_code(code: u8) -> Option<Self> {
        let reason = match code {
            0x1 => FaultReason::RootEntryNotPresent,
            0x2 => FaultReason::ContextEntryNotPresent,
            0x3 => FaultReason::ContextEntryInvalid,
            0x4 => FaultReason::AddressBeyondMgaw,
            0x5 => FaultReason::Write,
            0x6 => FaultReason::Read,
            0x7 => FaultReason::PagingEntryInvalid,
            0x8 => FaultReason::RootTableInvalid,
            0x9 => FaultReason::ContextTableInvalid,
            0xa => FaultReason::RootEntryReserved,
            0xb => FaultReason::ContextEntryReserved,
            0xc => FaultReason::PagingEntryReserved,
            0xd => FaultReason::ContextEntryTranslationType,
            0xe => FaultReason::InterruptAddr,
            0x31 => FaultReason::RootTableTranslationModeInvalid,
            0x50 => FaultReason::PasidDirAccessError,
            0x51 => FaultReason::PasidDirEntryNotPresent,
            0x58 => FaultReason::PasidTableAccessError,
            0x59 => FaultReason::PasidEntryNotPresent,
            0x5b => FaultReason::PasidTableEntryInvalid,
            0x87 => FaultReason::ScalableInterruptAddr,
            _ => return None,
        };
        Some(reason)
    }
}

impl fmt::Display for FaultReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let desc = match self {
            FaultReason::RootEntryNotPresent => "root entry not present",
            FaultReason::ContextEntryNotPresent => "context entry not present",
            FaultReason::ContextEntryInvalid => "context entry invalid",
            FaultReason::AddressBeyondMgaw => "address beyond MGAW",
            FaultReason::Write => "write permission denied",
            FaultReason::Read => "read permission denied",
            FaultReason::PagingEntryInvalid => "paging entry invalid",
            FaultReason::RootTableInvalid => "root table not accessible",
            FaultReason::ContextTableInvalid => "context table not accessible",
            FaultReason::RootEntryReserved => "root entry reserved bits set",
            FaultReason::ContextEntryReserved => "context entry reserved bits set",
            FaultReason::PagingEntryReserved => "paging entry reserved bits set",
            FaultReason::ContextEntryTranslationType => "context entry translation type invalid",
            FaultReason::InterruptAddr => "translation hits interrupt address range",
            FaultReason::RootTableTranslationModeInvalid => "root table translation mode invalid",
            FaultReason::PasidDirAccessError => "PASID directory not accessible",
            FaultReason::PasidDirEntryNotPresent => "PASID directory entry not present",
            FaultReason::PasidTableAccessError => "PASID table not accessible",
            FaultReason::PasidEntryNotPresent => "PASID entry not present",
            FaultReason::PasidTableEntryInvalid => "PASID entry invalid",
            FaultReason::ScalableInterruptAddr => "scalable translation hits interrupt address range",
        };
        write!(f, "{} (0x{:x})", desc, self.code())
    }
}

/// IOMMU错误类型
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum IommuError {
    /// guest内存访问失败
    #[error("Guest memory access failed: addr={addr:#x}, len={len}")]
    GuestMemory { addr: u64, len: usize },
    /// 配置错误
    #[error("Config Error: {0}")]
    InvalidConfig(String),
    /// 地址转换故障
    #[error("Translation fault: {0}")]
    Fault(FaultReason),
    /// 设备尚未配置（根表项或上下文表项不存在）
    #[error("Device not configured: {0}")]
    NotConfigured(FaultReason),
    /// 失效队列错误
    #[error("Invalidation queue error: {0}")]
    QueueError(String),
    /// 无效参数
    #[error("Invalid Parameter: {0}")]
    InvalidParameter(String),
    /// 观察者注册被拒绝
    #[error("Observer rejected: {0}")]
    ObserverRejected(String),
    /// 主机绑定路径失败
    #[error("Host binding failed: {0}")]
    Binding(String),
}

impl IommuError {
    /// 若为转换故障，返回其原因码
    pub fn fault_reason(&self) -> Option<FaultReason> {
        match self {
            IommuError::Fault(reason) | IommuError::NotConfigured(reason) => Some(*reason),
            _ => None,
        }
    }

    /// 设备尚未配置，调用方应关闭该设备的转换而不是上报故障
    pub fn is_not_configured(&self) -> bool {
        matches!(self, IommuError::NotConfigured(_))
    }
}

impl From<FaultReason> for IommuError {
    fn from(reason: FaultReason) -> Self {
        if reason.is_benign_absence() {
            IommuError::NotConfigured(reason)
        } else {
            IommuError::Fault(reason)
        }
    }
}

/// IOMMU操作结果类型
pub type IommuResult<T> = Result<T, IommuError>;

/// 解析与页表遍历的内部结果类型
pub type FaultResult<T> = Result<T, FaultReason>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fault_codes() {
        assert_eq!(FaultReason::RootEntryNotPresent.code(), 0x1);
        assert_eq!(FaultReason::PagingEntryReserved.code(), 0xc);
        assert_eq!(FaultReason::PasidTableEntryInvalid.code(), 0x5b);
        assert_eq!(FaultReason::ScalableInterruptAddr.code(), 0x87);
        assert_eq!(FaultReason::from_code(0x31), Some(FaultReason::RootTableTranslationModeInvalid));
        assert_eq!(FaultReason::from_code(0x20), None);
    }

    #[test]
    fn test_qualified_faults() {
        assert!(FaultReason::Write.is_qualified());
        assert!(FaultReason::PasidEntryNotPresent.is_qualified());
        assert!(!FaultReason::RootEntryNotPresent.is_qualified());
        assert!(!FaultReason::ContextEntryReserved.is_qualified());
        assert!(!FaultReason::PasidDirAccessError.is_qualified());
    }

    #[test]
    fn test_benign_absence() {
        let err = IommuError::from(FaultReason::ContextEntryNotPresent);
        assert!(err.is_not_configured());
        assert!(!IommuError::from(FaultReason::Read).is_not_configured());
        assert!(!IommuError::InvalidParameter("x".into()).is_not_configured());
    }

    #[test]
    fn test_error_display() {
        let err = IommuError::GuestMemory { addr: 0x1000, len: 8 };
        assert_eq!(err.to_string(), "Guest memory access failed: addr=0x1000, len=8");
        let err = IommuError::Fault(FaultReason::Read);
        assert!(err.to_string().contains("read permission denied (0x6)"));
        let err = IommuError::from(FaultReason::RootEntryNotPresent);
        assert_eq!(err.fault_reason(), Some(FaultReason::RootEntryNotPresent));
        assert!(err.to_string().starts_with("Device not configured"));
    }
}
