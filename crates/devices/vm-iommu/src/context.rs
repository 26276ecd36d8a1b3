// 设备上下文解析
//
// 根表 → 上下文表 →（可扩展模式）PASID目录 → PASID表，
// 为一次设备访问确定页表根、层级、地址宽度与域标识。
// 解析过程只读guest内存，不修改任何缓存。

use crate::config::IommuConfig;
use crate::entry::{
    pasid_dir_index, pasid_table_index, ContextEntry, LegacyContextEntry, PasidDirEntry,
    PasidEntry, PasidGranularType, RootEntry, RootTablePointer, ScalableContextEntry,
    TranslationType, CONTEXT_ENTRY_LEGACY_SIZE, CONTEXT_ENTRY_SCALABLE_SIZE,
    PASID_DIR_ENTRY_SIZE, PASID_ENTRY_SIZE,
};
use crate::error::{FaultReason, FaultResult};
use crate::memory::GuestMemory;
use crate::{DeviceId, NO_PASID};
use log::{debug, warn};

/// RPS能力未置位时，无PASID请求使用的PASID
pub const RID2PASID: u32 = 0;

/// 上下文解析失败
///
/// `fpd` 为已读出的上下文表项中的故障处理禁止位，用于决定是否记录故障。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResolveFailure {
    pub reason: FaultReason,
    pub fpd: bool,
}

impl ResolveFailure {
    fn new(reason: FaultReason, fpd: bool) -> Self {
        Self { reason, fpd }
    }
}

/// 页表遍历的根
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TranslationRoot {
    /// 二级转换（嵌套类型同样按二级页表遍历）
    SecondStage {
        base: u64,
        level: u32,
        agaw: u32,
        domain_id: u16,
    },
    /// 一级转换，`agaw` 来自PASID表项的地址宽度字段，用于范围检查
    FirstStage {
        base: u64,
        level: u32,
        agaw: u32,
        domain_id: u16,
    },
    /// 直通
    PassThrough { domain_id: u16 },
}

impl TranslationRoot {
    pub fn domain_id(&self) -> u16 {
        match self {
            TranslationRoot::SecondStage { domain_id, .. }
            | TranslationRoot::FirstStage { domain_id, .. }
            | TranslationRoot::PassThrough { domain_id } => *domain_id,
        }
    }

    pub fn is_first_stage(&self) -> bool {
        matches!(self, TranslationRoot::FirstStage { .. })
    }

    pub fn is_pass_through(&self) -> bool {
        matches!(self, TranslationRoot::PassThrough { .. })
    }
}

/// 设备上下文解析器
pub struct ContextResolver<'a> {
    memory: &'a dyn GuestMemory,
    config: &'a IommuConfig,
    root: RootTablePointer,
}

impl<'a> ContextResolver<'a> {
    /// 创建解析器
    ///
    /// # 参数
    /// - `memory`: guest内存
    /// - `config`: IOMMU配置
    /// - `root`: 当前生效的根表指针
    pub fn new(memory: &'a dyn GuestMemory, config: &'a IommuConfig, root: RootTablePointer) -> Self {
        Self {
            memory,
            config,
            root,
        }
    }

    pub fn root_scalable(&self) -> bool {
        self.root.scalable
    }

    /// 读取 `bus` 对应的根表项
    pub fn root_entry(&self, bus: u8) -> FaultResult<RootEntry> {
        let mut raw = [0u64; 2];
        let addr = self.root.entry_addr(bus);
        self.memory.read_qwords(addr, &mut raw).map_err(|_| {
            debug!("root entry read failed: bus={:#x}, addr={:#x}", bus, addr);
            FaultReason::RootTableInvalid
        })?;
        Ok(RootEntry::from_raw(raw))
    }

    /// 由根表项读取上下文表项
    pub fn context_entry(&self, re: &RootEntry, devfn: u8) -> FaultResult<ContextEntry> {
        let scalable = self.root.scalable;
        let (base, index) = re.context_table(scalable, devfn);
        let entry = if scalable {
            let mut val = [0u64; 4];
            self.memory
                .read_qwords(base + index as u64 * CONTEXT_ENTRY_SCALABLE_SIZE, &mut val)
                .map_err(|_| FaultReason::ContextTableInvalid)?;
            ContextEntry::Scalable(ScalableContextEntry { val })
        } else {
            let mut raw = [0u64; 2];
            self.memory
                .read_qwords(base + index as u64 * CONTEXT_ENTRY_LEGACY_SIZE, &mut raw)
                .map_err(|_| FaultReason::ContextTableInvalid)?;
            ContextEntry::Legacy(LegacyContextEntry {
                lo: raw[0],
                hi: raw[1],
            })
        };
        Ok(entry)
    }

    /// 将设备映射为已校验的上下文表项
    ///
    /// # 返回
    /// - `Ok(ce)`: 存在且合法的上下文表项
    /// - `Err(failure)`: 解析失败；根表项/上下文表项不存在时原因码满足
    ///   `FaultReason::is_benign_absence`
    pub fn resolve(&self, dev: DeviceId) -> Result<ContextEntry, ResolveFailure> {
        let fail = |reason| ResolveFailure::new(reason, false);
        let re = self.root_entry(dev.bus).map_err(fail)?;
        if !re.is_present(self.root.scalable, dev.devfn) {
            debug!("root entry not present: bus={:#x}", dev.bus);
            return Err(fail(FaultReason::RootEntryNotPresent));
        }
        if re.reserved_bits_set(self.root.scalable, self.config.aw_bits) {
            warn!("invalid root entry: hi={:#x}, lo={:#x}", re.hi, re.lo);
            return Err(fail(FaultReason::RootEntryReserved));
        }

        let ce = self.context_entry(&re, dev.devfn).map_err(fail)?;
        let fpd = ce.fpd();
        if !ce.is_present() {
            debug!("context entry not present: dev={}", dev);
            return Err(ResolveFailure::new(FaultReason::ContextEntryNotPresent, fpd));
        }
        self.check_context(&ce)
            .map_err(|reason| ResolveFailure::new(reason, fpd))?;
        Ok(ce)
    }

    /// 与 `resolve` 相同，只返回原因码
    pub fn resolve_context(&self, dev: DeviceId) -> FaultResult<ContextEntry> {
        self.resolve(dev).map_err(|failure| failure.reason)
    }

    fn check_context(&self, ce: &ContextEntry) -> FaultResult<()> {
        let aw_bits = self.config.aw_bits;
        match ce {
            ContextEntry::Legacy(lce) => {
                if lce.reserved_bits_set(aw_bits) {
                    warn!(
                        "invalid context entry: hi={:#x}, lo={:#x} (reserved nonzero)",
                        lce.hi, lce.lo
                    );
                    return Err(FaultReason::ContextEntryReserved);
                }
                if !self.config.is_level_supported(lce.level()) {
                    warn!(
                        "invalid context entry: hi={:#x}, lo={:#x} (level {} not supported)",
                        lce.hi,
                        lce.lo,
                        lce.level()
                    );
                    return Err(FaultReason::ContextEntryInvalid);
                }
                let supported = match lce.translation_type() {
                    TranslationType::MultiLevel => true,
                    TranslationType::DeviceIotlb => self.config.device_iotlb,
                    TranslationType::PassThrough => self.config.pass_through,
                    TranslationType::Reserved => false,
                };
                if !supported {
                    warn!(
                        "unsupported context entry translation type: {:?}",
                        lce.translation_type()
                    );
                    return Err(FaultReason::ContextEntryInvalid);
                }
                Ok(())
            }
            ContextEntry::Scalable(sce) => {
                if sce.reserved_bits_set(aw_bits) {
                    warn!(
                        "invalid context entry: val={:x?} (reserved nonzero)",
                        sce.val
                    );
                    return Err(FaultReason::ContextEntryReserved);
                }
                self.pasid_entry(sce.pasid_dir_base(), self.effective_pasid(sce, NO_PASID))
                    .map(|_| ())
            }
        }
    }

    /// 无PASID请求映射到RID2PASID
    pub fn effective_pasid(&self, _ce: &ScalableContextEntry, pasid: u32) -> u32 {
        if pasid == NO_PASID { RID2PASID } else { pasid }
    }

    /// 读取PASID目录项（不检查present位）
    pub fn pasid_dir_entry(&self, dir_base: u64, pasid: u32) -> FaultResult<PasidDirEntry> {
        let addr = dir_base + pasid_dir_index(pasid) * PASID_DIR_ENTRY_SIZE;
        self.memory
            .read_u64(addr)
            .map(PasidDirEntry)
            .map_err(|_| FaultReason::PasidDirAccessError)
    }

    /// 读取PASID表项并做类型与层级检查（不检查present位）
    pub fn pasid_entry_in_table(&self, table_base: u64, pasid: u32) -> FaultResult<PasidEntry> {
        let mut val = [0u64; 8];
        let addr = table_base + pasid_table_index(pasid) * PASID_ENTRY_SIZE;
        self.memory
            .read_qwords(addr, &mut val)
            .map_err(|_| FaultReason::PasidTableAccessError)?;
        let pe = PasidEntry { val };

        match pe.pgtt() {
            PasidGranularType::FirstStage | PasidGranularType::Nested => {}
            PasidGranularType::SecondStage => {
                if !self.config.is_level_supported(pe.level()) {
                    return Err(FaultReason::PasidTableEntryInvalid);
                }
            }
            PasidGranularType::PassThrough => {
                if !self.config.pass_through {
                    return Err(FaultReason::PasidTableEntryInvalid);
                }
            }
            PasidGranularType::Unknown(_) => return Err(FaultReason::PasidTableEntryInvalid),
        }
        if pe.pgtt() == PasidGranularType::FirstStage && pe.fl_level() != 4 {
            return Err(FaultReason::PasidTableEntryInvalid);
        }
        Ok(pe)
    }

    /// 由PASID目录查找存在的PASID表项
    pub fn pasid_entry(&self, dir_base: u64, pasid: u32) -> FaultResult<PasidEntry> {
        let pdire = self.pasid_dir_entry(dir_base, pasid)?;
        if !pdire.is_present() {
            return Err(FaultReason::PasidDirEntryNotPresent);
        }
        let pe = self.pasid_entry_in_table(pdire.table_base(), pasid)?;
        if !pe.is_present() {
            return Err(FaultReason::PasidEntryNotPresent);
        }
        Ok(pe)
    }

    /// 可扩展上下文表项下 `pasid`（或RID2PASID）对应的PASID表项
    pub fn rid2pasid_entry(&self, ce: &ScalableContextEntry, pasid: u32) -> FaultResult<PasidEntry> {
        self.pasid_entry(ce.pasid_dir_base(), self.effective_pasid(ce, pasid))
    }

    /// 可扩展模式下的FPD：目录项FPD即使不存在也生效
    pub fn pasid_fpd(&self, ce: &ScalableContextEntry, pasid: u32) -> FaultResult<bool> {
        let pasid = self.effective_pasid(ce, pasid);
        let pdire = self.pasid_dir_entry(ce.pasid_dir_base(), pasid)?;
        if pdire.fpd() {
            return Ok(true);
        }
        if !pdire.is_present() {
            return Err(FaultReason::PasidDirEntryNotPresent);
        }
        let pe = self.pasid_entry_in_table(pdire.table_base(), pasid)?;
        Ok(pe.fpd())
    }

    /// 设备 + PASID 对应的PASID表项，要求根表处于可扩展模式
    pub fn device_pasid_entry(&self, dev: DeviceId, pasid: u32) -> FaultResult<PasidEntry> {
        if !self.root.scalable {
            return Err(FaultReason::RootTableTranslationModeInvalid);
        }
        match self.resolve_context(dev)? {
            ContextEntry::Scalable(sce) => self.rid2pasid_entry(&sce, pasid),
            ContextEntry::Legacy(_) => Err(FaultReason::RootTableTranslationModeInvalid),
        }
    }

    /// 由上下文表项确定遍历根
    pub fn translation_root(&self, ce: &ContextEntry, pasid: u32) -> FaultResult<TranslationRoot> {
        match ce {
            ContextEntry::Legacy(lce) => {
                if lce.translation_type() == TranslationType::PassThrough {
                    return Ok(TranslationRoot::PassThrough {
                        domain_id: lce.domain_id(),
                    });
                }
                Ok(TranslationRoot::SecondStage {
                    base: lce.slpt_base(),
                    level: lce.level(),
                    agaw: lce.agaw(),
                    domain_id: lce.domain_id(),
                })
            }
            ContextEntry::Scalable(sce) => {
                let pe = self.rid2pasid_entry(sce, pasid)?;
                Ok(Self::pasid_translation_root(&pe))
            }
        }
    }

    /// 由PASID表项确定遍历根
    pub fn pasid_translation_root(pe: &PasidEntry) -> TranslationRoot {
        let domain_id = pe.domain_id();
        match pe.pgtt() {
            PasidGranularType::PassThrough => TranslationRoot::PassThrough { domain_id },
            PasidGranularType::FirstStage => TranslationRoot::FirstStage {
                base: pe.flpt_base(),
                level: pe.fl_level(),
                agaw: pe.agaw(),
                domain_id,
            },
            _ => TranslationRoot::SecondStage {
                base: pe.slpt_base(),
                level: pe.level(),
                agaw: pe.agaw(),
                domain_id,
            },
        }
    }

    /// 上下文的域标识
    pub fn domain_id(&self, ce: &ContextEntry, pasid: u32) -> FaultResult<u16> {
        match ce {
            ContextEntry::Legacy(lce) => Ok(lce.domain_id()),
            ContextEntry::Scalable(sce) => Ok(self.rid2pasid_entry(sce, pasid)?.domain_id()),
        }
    }

    /// 是否为直通配置；PASID表项无法解析时按非直通处理
    pub fn pass_through_enabled(&self, ce: &ContextEntry, pasid: u32) -> bool {
        match ce {
            ContextEntry::Legacy(lce) => lce.translation_type() == TranslationType::PassThrough,
            ContextEntry::Scalable(sce) => self
                .rid2pasid_entry(sce, pasid)
                .map(|pe| pe.pgtt() == PasidGranularType::PassThrough)
                .unwrap_or(false),
        }
    }

    /// 上下文故障的FPD位（可扩展模式下沿PASID目录查找）
    pub fn fault_processing_disabled(&self, ce: &ContextEntry, pasid: u32) -> FaultResult<bool> {
        match ce {
            ContextEntry::Legacy(lce) => Ok(lce.fpd()),
            ContextEntry::Scalable(sce) => {
                if sce.fpd() {
                    return Ok(true);
                }
                self.pasid_fpd(sce, pasid)
            }
        }
    }
}
