// 页表遍历
//
// 实现单地址的二级与一级页表遍历：
// - 逐级索引计算（每级9位，4K起步）
// - 权限逐级叠加与读写检查
// - 按层级与大页区分的保留位检查
// - 中断地址窗口检查

use crate::error::{FaultReason, FaultResult};
use crate::memory::GuestMemory;
use crate::{haw_mask, IommuPerm, INTERRUPT_ADDR_FIRST, INTERRUPT_ADDR_LAST};
use log::{debug, error};

/// 二级页表项：读权限
pub const SL_R: u64 = 1 << 0;
/// 二级页表项：写权限
pub const SL_W: u64 = 1 << 1;
/// 页表项：大页
pub const PT_PAGE_SIZE: u64 = 1 << 7;
/// 一级页表项：present
pub const FL_P: u64 = 1 << 0;
/// 一级页表项：可写
pub const FL_RW: u64 = 1 << 1;

const SL_IGN_COM: u64 = 0xbff0_0000_0000_0000;
const SL_TM: u64 = 1 << 62;
const SPTE_SNP: u64 = 0x800;
const ADDR_MASK_4K: u64 = !0xfff;

/// 分页格式常量表
///
/// 两种格式的索引计算相同，区别在于：
/// - 二级页表项的R/W位逐级叠加，且按层级检查保留位（含SNP/TM）
/// - 一级页表项以present位隐含读权限，RW位表示可写，不使用保留位表
/// - 一级页表最多5级
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PagingFormat {
    /// 每级索引位数
    pub level_bits: u32,
    /// 最低层级（叶子层）
    pub leaf_level: u32,
    /// 最高层级
    pub max_level: u32,
    /// 是否为一级页表
    pub first_stage: bool,
}

impl PagingFormat {
    /// 二级页表格式
    pub const SECOND_STAGE: PagingFormat = PagingFormat {
        level_bits: 9,
        leaf_level: 1,
        max_level: 4,
        first_stage: false,
    };

    /// 一级页表格式
    pub const FIRST_STAGE: PagingFormat = PagingFormat {
        level_bits: 9,
        leaf_level: 1,
        max_level: 5,
        first_stage: true,
    };

    /// 顶层层级是否合法
    pub const fn is_level_valid(&self, level: u32) -> bool {
        level >= self.leaf_level && level <= self.max_level
    }

    /// 表项自身授予的读写权限
    pub const fn entry_perm(&self, pte: u64) -> (bool, bool) {
        if self.first_stage {
            let present = pte & FL_P != 0;
            (present, present && pte & FL_RW != 0)
        } else {
            (pte & SL_R != 0, pte & SL_W != 0)
        }
    }

    /// 表项是否有保留位被置位；一级页表不检查
    pub fn nonzero_reserved(&self, masks: &ReservedMasks, pte: u64, level: u32) -> bool {
        !self.first_stage && masks.nonzero_reserved(pte, level)
    }

    /// 表项是否为叶子（最低层级或大页）
    pub const fn is_last(&self, pte: u64, level: u32) -> bool {
        level == self.leaf_level || pte & PT_PAGE_SIZE != 0
    }

    /// 该层级页面的位偏移
    pub const fn level_shift(&self, level: u32) -> u32 {
        12 + (level - 1) * self.level_bits
    }

    /// 该层级页面的地址掩码
    pub const fn level_page_mask(&self, level: u32) -> u64 {
        !((1u64 << self.level_shift(level)) - 1)
    }

    /// IOVA在该层级页表中的索引
    pub const fn level_offset(&self, iova: u64, level: u32) -> u64 {
        (iova >> self.level_shift(level)) & ((1u64 << self.level_bits) - 1)
    }

    /// 该层级每个表项覆盖的大小
    pub const fn level_size(&self, level: u32) -> u64 {
        1u64 << self.level_shift(level)
    }
}

/// 每级保留位掩码表（下标0不使用，1..=4 对应页表层级）
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReservedMasks {
    aw_bits: u8,
    small: [u64; 5],
    large: [u64; 5],
}

impl ReservedMasks {
    /// 根据地址宽度与可选特性预计算保留位
    ///
    /// # 参数
    /// - `aw_bits`: 主机地址宽度
    /// - `device_iotlb`: 设备IOTLB支持（TM位不再保留）
    /// - `snoop_allowed`: 可扩展模式或窥探控制（SNP位不再保留）
    pub fn new(aw_bits: u8, device_iotlb: bool, snoop_allowed: bool) -> Self {
        let haw = haw_mask(aw_bits);
        let common = haw | SL_IGN_COM;
        let leaf = if device_iotlb { common | SL_TM } else { common };

        let mut small = [!0u64; 5];
        let mut large = [!0u64; 5];
        small[1] = 0x800 | !leaf;
        small[2] = 0x800 | !common;
        small[3] = 0x800 | !common;
        small[4] = 0x880 | !common;
        large[2] = 0x1f_f800 | !leaf;
        large[3] = 0x3fff_f800 | !leaf;

        if snoop_allowed {
            small[1] &= !SPTE_SNP;
            large[2] &= !SPTE_SNP;
            large[3] &= !SPTE_SNP;
        }

        Self {
            aw_bits,
            small,
            large,
        }
    }

    pub fn aw_bits(&self) -> u8 {
        self.aw_bits
    }

    /// 该层级的保留位掩码
    pub fn mask(&self, pte: u64, level: u32) -> u64 {
        let idx = level as usize;
        if idx >= self.small.len() {
            return !0;
        }
        if pte & PT_PAGE_SIZE != 0 && (level == 2 || level == 3) {
            self.large[idx]
        } else {
            self.small[idx]
        }
    }

    /// 页表项是否有保留位被置位
    pub fn nonzero_reserved(&self, pte: u64, level: u32) -> bool {
        pte & self.mask(pte, level) != 0
    }

    /// 页表项中下一级表或页框的地址
    pub fn pte_addr(&self, pte: u64) -> u64 {
        pte & ADDR_MASK_4K & haw_mask(self.aw_bits)
    }
}

/// 单地址遍历结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WalkResult {
    /// 命中的叶子页表项
    pub pte: u64,
    /// 叶子所在层级
    pub level: u32,
    /// 叠加后的访问权限
    pub perm: IommuPerm,
}

impl WalkResult {
    /// 叶子页面地址掩码
    pub fn page_mask(&self) -> u64 {
        PagingFormat::SECOND_STAGE.level_page_mask(self.level)
    }

    /// 叶子页面大小
    pub fn page_size(&self) -> u64 {
        PagingFormat::SECOND_STAGE.level_size(self.level)
    }

    /// 完整的输出地址（页框 + 页内偏移）
    pub fn output_address(&self, iova: u64, aw_bits: u8) -> u64 {
        let mask = self.page_mask();
        (self.pte & ADDR_MASK_4K & haw_mask(aw_bits) & mask) | (iova & !mask)
    }
}

/// 单地址页表遍历器
pub struct PageWalker<'a> {
    memory: &'a dyn GuestMemory,
    masks: &'a ReservedMasks,
    scalable_mode: bool,
}

impl<'a> PageWalker<'a> {
    /// 创建遍历器
    ///
    /// # 参数
    /// - `scalable_mode`: 决定中断地址窗口故障使用的原因码
    pub fn new(memory: &'a dyn GuestMemory, masks: &'a ReservedMasks, scalable_mode: bool) -> Self {
        Self {
            memory,
            masks,
            scalable_mode,
        }
    }

    fn read_pte(&self, table: u64, index: u64) -> Option<u64> {
        self.memory.read_u64(table + index * 8).ok()
    }

    /// IOVA是否在地址宽度范围内
    pub fn iova_in_range(&self, iova: u64, agaw: u32) -> bool {
        let width = agaw.min(self.masks.aw_bits() as u32);
        width >= 64 || iova & !((1u64 << width) - 1) == 0
    }

    /// 二级页表遍历
    ///
    /// # 参数
    /// - `base`: 顶层页表地址
    /// - `level`: 顶层层级
    /// - `agaw`: 上下文地址宽度
    /// - `iova`: 待转换地址
    /// - `is_write`: 是否为写访问
    ///
    /// # 返回
    /// - `Ok(result)`: 叶子页表项、层级与叠加权限
    /// - `Err(reason)`: 故障原因
    pub fn walk_second_stage(
        &self,
        base: u64,
        level: u32,
        agaw: u32,
        iova: u64,
        is_write: bool,
    ) -> FaultResult<WalkResult> {
        let format = PagingFormat::SECOND_STAGE;
        if !format.is_level_valid(level) {
            return Err(FaultReason::ContextEntryInvalid);
        }
        if !self.iova_in_range(iova, agaw) {
            error!(
                "iova {:#x} exceeds limits (aw={}, agaw={})",
                iova,
                self.masks.aw_bits(),
                agaw
            );
            return Err(FaultReason::AddressBeyondMgaw);
        }

        let required = if is_write { SL_W } else { SL_R };
        let top = level;
        let mut level = level;
        let mut addr = base;
        let mut reads = true;
        let mut writes = true;
        let pte = loop {
            let offset = format.level_offset(iova, level);
            let Some(pte) = self.read_pte(addr, offset) else {
                error!(
                    "fail to access second-level paging entry at level {} for iova {:#x}",
                    level, iova
                );
                return Err(if level == top {
                    FaultReason::ContextEntryInvalid
                } else {
                    FaultReason::PagingEntryInvalid
                });
            };
            let (r, w) = format.entry_perm(pte);
            reads &= r;
            writes &= w;
            if pte & required == 0 {
                debug!(
                    "slpte permission error: iova={:#x}, level={}, slpte={:#x}, write={}",
                    iova, level, pte, is_write
                );
                return Err(if is_write {
                    FaultReason::Write
                } else {
                    FaultReason::Read
                });
            }
            if format.nonzero_reserved(self.masks, pte, level) {
                error!(
                    "detected reserved bits set in slpte {:#x} (level {}, iova {:#x})",
                    pte, level, iova
                );
                return Err(FaultReason::PagingEntryReserved);
            }
            if format.is_last(pte, level) {
                break pte;
            }
            addr = self.masks.pte_addr(pte);
            level -= 1;
        };

        let xlat = self.masks.pte_addr(pte);
        let size = format.level_size(level);
        if xlat <= INTERRUPT_ADDR_LAST && xlat + size - 1 >= INTERRUPT_ADDR_FIRST {
            error!(
                "iova {:#x} translated into interrupt range (xlat={:#x}, size={:#x})",
                iova, xlat, size
            );
            return Err(if self.scalable_mode {
                FaultReason::ScalableInterruptAddr
            } else {
                FaultReason::InterruptAddr
            });
        }

        Ok(WalkResult {
            pte,
            level,
            perm: IommuPerm::from_flags(reads, writes),
        })
    }

    /// 一级页表遍历
    ///
    /// 任一级present的表项都隐含读权限；写访问需要每一级都可写。
    pub fn walk_first_stage(&self, base: u64, level: u32, iova: u64, is_write: bool) -> FaultResult<WalkResult> {
        let format = PagingFormat::FIRST_STAGE;
        if !format.is_level_valid(level) {
            return Err(FaultReason::ContextEntryInvalid);
        }

        let top = level;
        let mut level = level;
        let mut addr = base;
        let mut writes = true;
        loop {
            let offset = format.level_offset(iova, level);
            let Some(pte) = self.read_pte(addr, offset) else {
                error!(
                    "fail to access first-level paging entry at level {} for iova {:#x}",
                    level, iova
                );
                return Err(if level == top {
                    FaultReason::ContextEntryInvalid
                } else {
                    FaultReason::PagingEntryInvalid
                });
            };
            let (present, writable) = format.entry_perm(pte);
            if !present {
                debug!("iova {:#x} level {} flpte {:#x} not present", iova, level, pte);
                return Err(FaultReason::PagingEntryInvalid);
            }
            writes &= writable;
            if is_write && !writable {
                return Err(FaultReason::Write);
            }
            if format.is_last(pte, level) {
                return Ok(WalkResult {
                    pte,
                    level,
                    perm: IommuPerm::from_flags(true, writes),
                });
            }
            addr = self.masks.pte_addr(pte);
            level -= 1;
        }
    }
}
