// 转换结构表项
//
// guest内存中的根表项、上下文表项（传统/可扩展）、PASID目录项与PASID表项，
// 以及各字段的解码和保留位检查。

use crate::haw_mask;

pub const ROOT_ENTRY_SIZE: u64 = 16;
pub const ROOT_ENTRY_COUNT: u64 = 256;
pub const CONTEXT_ENTRY_LEGACY_SIZE: u64 = 16;
pub const CONTEXT_ENTRY_SCALABLE_SIZE: u64 = 32;
pub const PASID_DIR_ENTRY_SIZE: u64 = 8;
pub const PASID_ENTRY_SIZE: u64 = 64;
/// 每张PASID表的表项数
pub const PASID_TABLE_ENTRY_NUM: u32 = 64;

const ENTRY_PRESENT: u64 = 1 << 0;
const ENTRY_FPD: u64 = 1 << 1;
const ADDR_MASK_4K: u64 = !0xfff;

/// 根表指针（RTADDR），含可扩展模式标志
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RootTablePointer {
    pub addr: u64,
    pub scalable: bool,
}

impl RootTablePointer {
    pub fn new(addr: u64, scalable: bool, aw_bits: u8) -> Self {
        Self {
            addr: addr & ADDR_MASK_4K & haw_mask(aw_bits),
            scalable,
        }
    }

    /// 第 `bus` 个根表项的地址
    pub fn entry_addr(&self, bus: u8) -> u64 {
        self.addr + bus as u64 * ROOT_ENTRY_SIZE
    }
}

/// 根表项（16字节）
///
/// 可扩展模式下低64位描述 devfn 0..=127 的上下文表，高64位描述 devfn 128..=255。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RootEntry {
    pub lo: u64,
    pub hi: u64,
}

impl RootEntry {
    pub fn from_raw(raw: [u64; 2]) -> Self {
        Self {
            lo: raw[0],
            hi: raw[1],
        }
    }

    /// 传统模式根表项
    pub fn legacy(context_table: u64) -> Self {
        Self {
            lo: (context_table & ADDR_MASK_4K) | ENTRY_PRESENT,
            hi: 0,
        }
    }

    /// 可扩展模式根表项，`None` 表示对应半边不存在
    pub fn scalable(lower: Option<u64>, upper: Option<u64>) -> Self {
        let half = |table: Option<u64>| table.map_or(0, |t| (t & ADDR_MASK_4K) | ENTRY_PRESENT);
        Self {
            lo: half(lower),
            hi: half(upper),
        }
    }

    fn half(&self, scalable: bool, devfn: u8) -> u64 {
        if scalable && devfn > 127 { self.hi } else { self.lo }
    }

    pub fn is_present(&self, scalable: bool, devfn: u8) -> bool {
        self.half(scalable, devfn) & ENTRY_PRESENT != 0
    }

    /// 上下文表基址与表内索引
    pub fn context_table(&self, scalable: bool, devfn: u8) -> (u64, u8) {
        let base = self.half(scalable, devfn) & ADDR_MASK_4K;
        let index = if scalable { devfn & 0x7f } else { devfn };
        (base, index)
    }

    pub fn reserved_bits_set(&self, scalable: bool, aw_bits: u8) -> bool {
        let rsvd = 0xffe | !haw_mask(aw_bits);
        if scalable {
            self.lo & rsvd != 0 || self.hi & rsvd != 0
        } else {
            self.lo & rsvd != 0 || self.hi != 0
        }
    }
}

/// 传统上下文表项的转换类型（TT）
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TranslationType {
    /// 多级页表转换
    MultiLevel,
    /// 多级转换并允许设备IOTLB
    DeviceIotlb,
    /// 直通
    PassThrough,
    /// 保留值
    Reserved,
}

impl TranslationType {
    pub fn from_bits(bits: u64) -> Self {
        match bits & 0x3 {
            0 => TranslationType::MultiLevel,
            1 => TranslationType::DeviceIotlb,
            2 => TranslationType::PassThrough,
            _ => TranslationType::Reserved,
        }
    }

    pub fn bits(self) -> u64 {
        match self {
            TranslationType::MultiLevel => 0,
            TranslationType::DeviceIotlb => 1,
            TranslationType::PassThrough => 2,
            TranslationType::Reserved => 3,
        }
    }
}

/// 传统上下文表项（16字节）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct LegacyContextEntry {
    pub lo: u64,
    pub hi: u64,
}

impl LegacyContextEntry {
    const RSVD_HI: u64 = 0xffff_ffff_ff00_0080;

    /// 构造一个存在的上下文表项
    ///
    /// # 参数
    /// - `slpt`: 二级页表根地址
    /// - `aw`: 地址宽度编码（1 = 3级/39位，2 = 4级/48位）
    /// - `domain_id`: 域标识
    /// - `tt`: 转换类型
    pub fn new(slpt: u64, aw: u8, domain_id: u16, tt: TranslationType) -> Self {
        Self {
            lo: (slpt & ADDR_MASK_4K) | (tt.bits() << 2) | ENTRY_PRESENT,
            hi: (aw as u64 & 0x7) | ((domain_id as u64) << 8),
        }
    }

    pub fn with_fpd(mut self) -> Self {
        self.lo |= ENTRY_FPD;
        self
    }

    pub fn is_present(&self) -> bool {
        self.lo & ENTRY_PRESENT != 0
    }

    pub fn fpd(&self) -> bool {
        self.lo & ENTRY_FPD != 0
    }

    pub fn translation_type(&self) -> TranslationType {
        TranslationType::from_bits(self.lo >> 2)
    }

    pub fn slpt_base(&self) -> u64 {
        self.lo & ADDR_MASK_4K
    }

    pub fn address_width(&self) -> u32 {
        (self.hi & 0x7) as u32
    }

    /// 二级页表层级数
    pub fn level(&self) -> u32 {
        2 + self.address_width()
    }

    /// 调整后的guest地址宽度
    pub fn agaw(&self) -> u32 {
        30 + self.address_width() * 9
    }

    pub fn domain_id(&self) -> u16 {
        ((self.hi >> 8) & 0xffff) as u16
    }

    pub fn reserved_bits_set(&self, aw_bits: u8) -> bool {
        self.hi & Self::RSVD_HI != 0 || self.lo & (0xff0 | !haw_mask(aw_bits)) != 0
    }
}

/// 可扩展上下文表项（32字节）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ScalableContextEntry {
    pub val: [u64; 4],
}

impl ScalableContextEntry {
    const RSVD_VAL1: u64 = 0xffff_ffff_ffe0_0000;

    /// 构造一个存在的可扩展上下文表项
    ///
    /// # 参数
    /// - `pasid_dir`: PASID目录基址
    /// - `pdts`: PASID目录大小编码，目录项数为 `1 << (pdts + 7)`
    pub fn new(pasid_dir: u64, pdts: u8) -> Self {
        Self {
            val: [
                (pasid_dir & ADDR_MASK_4K) | ((pdts as u64 & 0x7) << 9) | ENTRY_PRESENT,
                0,
                0,
                0,
            ],
        }
    }

    pub fn with_fpd(mut self) -> Self {
        self.val[0] |= ENTRY_FPD;
        self
    }

    pub fn is_present(&self) -> bool {
        self.val[0] & ENTRY_PRESENT != 0
    }

    pub fn fpd(&self) -> bool {
        self.val[0] & ENTRY_FPD != 0
    }

    pub fn pasid_dir_base(&self) -> u64 {
        self.val[0] & ADDR_MASK_4K
    }

    pub fn pdts(&self) -> u32 {
        ((self.val[0] >> 9) & 0x7) as u32
    }

    /// PASID目录项数
    pub fn pdt_entry_num(&self) -> u32 {
        1u32 << (self.pdts() + 7)
    }

    /// 表项中记录的RID2PASID值
    pub fn rid2pasid(&self) -> u32 {
        (self.val[1] & 0xfffff) as u32
    }

    pub fn reserved_bits_set(&self, aw_bits: u8) -> bool {
        self.val[0] & (0x1e0 | !haw_mask(aw_bits)) != 0
            || self.val[1] & Self::RSVD_VAL1 != 0
            || self.val[2] != 0
            || self.val[3] != 0
    }
}

/// 上下文表项
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContextEntry {
    Legacy(LegacyContextEntry),
    Scalable(ScalableContextEntry),
}

impl ContextEntry {
    pub fn is_present(&self) -> bool {
        match self {
            ContextEntry::Legacy(ce) => ce.is_present(),
            ContextEntry::Scalable(ce) => ce.is_present(),
        }
    }

    pub fn fpd(&self) -> bool {
        match self {
            ContextEntry::Legacy(ce) => ce.fpd(),
            ContextEntry::Scalable(ce) => ce.fpd(),
        }
    }

    pub fn is_scalable(&self) -> bool {
        matches!(self, ContextEntry::Scalable(_))
    }

    /// 原始表项数据（用于日志）
    pub fn raw(&self) -> [u64; 4] {
        match self {
            ContextEntry::Legacy(ce) => [ce.lo, ce.hi, 0, 0],
            ContextEntry::Scalable(ce) => ce.val,
        }
    }
}

/// PASID目录项（8字节）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PasidDirEntry(pub u64);

impl PasidDirEntry {
    pub fn new(pasid_table: u64) -> Self {
        Self((pasid_table & ADDR_MASK_4K) | ENTRY_PRESENT)
    }

    pub fn is_present(&self) -> bool {
        self.0 & ENTRY_PRESENT != 0
    }

    pub fn fpd(&self) -> bool {
        self.0 & ENTRY_FPD != 0
    }

    pub fn table_base(&self) -> u64 {
        self.0 & ADDR_MASK_4K
    }
}

/// PASID目录索引
pub fn pasid_dir_index(pasid: u32) -> u64 {
    ((pasid >> 6) & 0x3fff) as u64
}

/// PASID表内索引
pub fn pasid_table_index(pasid: u32) -> u64 {
    (pasid & 0x3f) as u64
}

/// PASID粒度转换类型（PGTT）
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PasidGranularType {
    /// 一级转换
    FirstStage,
    /// 二级转换
    SecondStage,
    /// 嵌套转换
    Nested,
    /// 直通
    PassThrough,
    /// 未定义的编码
    Unknown(u8),
}

impl PasidGranularType {
    pub fn from_bits(bits: u8) -> Self {
        match bits {
            1 => PasidGranularType::FirstStage,
            2 => PasidGranularType::SecondStage,
            3 => PasidGranularType::Nested,
            4 => PasidGranularType::PassThrough,
            other => PasidGranularType::Unknown(other),
        }
    }

    pub fn bits(self) -> u8 {
        match self {
            PasidGranularType::FirstStage => 1,
            PasidGranularType::SecondStage => 2,
            PasidGranularType::Nested => 3,
            PasidGranularType::PassThrough => 4,
            PasidGranularType::Unknown(bits) => bits,
        }
    }
}

/// PASID表项（64字节）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PasidEntry {
    pub val: [u64; 8],
}

impl PasidEntry {
    fn with_type(pgtt: PasidGranularType, domain_id: u16) -> Self {
        let mut val = [0u64; 8];
        val[0] = ((pgtt.bits() as u64 & 0x7) << 6) | ENTRY_PRESENT;
        val[1] = domain_id as u64;
        Self { val }
    }

    /// 二级转换PASID表项，`aw` 为地址宽度编码
    pub fn second_stage(slpt: u64, aw: u8, domain_id: u16) -> Self {
        let mut pe = Self::with_type(PasidGranularType::SecondStage, domain_id);
        pe.val[0] |= (slpt & ADDR_MASK_4K) | ((aw as u64 & 0x7) << 2);
        pe
    }

    /// 一级转换PASID表项，`flpm` 为一级分页模式（0 = 4级）
    pub fn first_stage(flpt: u64, flpm: u8, domain_id: u16) -> Self {
        let mut pe = Self::with_type(PasidGranularType::FirstStage, domain_id);
        pe.val[2] = (flpt & ADDR_MASK_4K) | ((flpm as u64 & 0x3) << 2);
        pe
    }

    pub fn pass_through(domain_id: u16) -> Self {
        Self::with_type(PasidGranularType::PassThrough, domain_id)
    }

    pub fn with_fpd(mut self) -> Self {
        self.val[0] |= ENTRY_FPD;
        self
    }

    pub fn is_present(&self) -> bool {
        self.val[0] & ENTRY_PRESENT != 0
    }

    pub fn fpd(&self) -> bool {
        self.val[0] & ENTRY_FPD != 0
    }

    pub fn address_width(&self) -> u32 {
        ((self.val[0] >> 2) & 0x7) as u32
    }

    /// 二级页表层级数
    pub fn level(&self) -> u32 {
        2 + self.address_width()
    }

    pub fn agaw(&self) -> u32 {
        30 + self.address_width() * 9
    }

    pub fn pgtt(&self) -> PasidGranularType {
        PasidGranularType::from_bits(((self.val[0] >> 6) & 0x7) as u8)
    }

    pub fn slpt_base(&self) -> u64 {
        self.val[0] & ADDR_MASK_4K
    }

    pub fn domain_id(&self) -> u16 {
        (self.val[1] & 0xffff) as u16
    }

    pub fn flpm(&self) -> u32 {
        ((self.val[2] >> 2) & 0x3) as u32
    }

    /// 一级页表层级数
    pub fn fl_level(&self) -> u32 {
        4 + self.flpm()
    }

    /// 一级地址宽度
    pub fn fl_aw(&self) -> u32 {
        48 + self.flpm() * 9
    }

    pub fn flpt_base(&self) -> u64 {
        self.val[2] & ADDR_MASK_4K
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_root_entry_legacy() {
        let re = RootEntry::legacy(0x5000);
        assert!(re.is_present(false, 0xff));
        assert_eq!(re.context_table(false, 0x88), (0x5000, 0x88));
        assert!(!re.reserved_bits_set(false, 39));

        let re = RootEntry { lo: re.lo, hi: 1 };
        assert!(re.reserved_bits_set(false, 39));
    }

    #[test]
    fn test_root_entry_scalable_halves() {
        let re = RootEntry::scalable(Some(0x3000), None);
        assert!(re.is_present(true, 127));
        assert!(!re.is_present(true, 128));
        assert_eq!(re.context_table(true, 0x05), (0x3000, 0x05));

        let re = RootEntry::scalable(None, Some(0x4000));
        assert_eq!(re.context_table(true, 0x85), (0x4000, 0x05));
        assert!(!re.reserved_bits_set(true, 48));
    }

    #[test]
    fn test_root_entry_address_beyond_haw() {
        let re = RootEntry::legacy(1u64 << 40);
        assert!(re.reserved_bits_set(false, 39));
        assert!(!re.reserved_bits_set(false, 48));
    }

    #[test]
    fn test_legacy_context_fields() {
        let ce = LegacyContextEntry::new(0x7000, 1, 0x42, TranslationType::MultiLevel);
        assert!(ce.is_present());
        assert!(!ce.fpd());
        assert_eq!(ce.slpt_base(), 0x7000);
        assert_eq!(ce.level(), 3);
        assert_eq!(ce.agaw(), 39);
        assert_eq!(ce.domain_id(), 0x42);
        assert_eq!(ce.translation_type(), TranslationType::MultiLevel);
        assert!(!ce.reserved_bits_set(39));
        assert!(ce.with_fpd().fpd());

        let pt = LegacyContextEntry::new(0, 1, 1, TranslationType::PassThrough);
        assert_eq!(pt.translation_type(), TranslationType::PassThrough);
    }

    #[test]
    fn test_legacy_context_reserved() {
        let mut ce = LegacyContextEntry::new(0x7000, 1, 1, TranslationType::MultiLevel);
        ce.hi |= 0x80;
        assert!(ce.reserved_bits_set(39));
    }

    #[test]
    fn test_scalable_context_fields() {
        let ce = ScalableContextEntry::new(0x9000, 1);
        assert!(ce.is_present());
        assert_eq!(ce.pasid_dir_base(), 0x9000);
        assert_eq!(ce.pdt_entry_num(), 256);
        assert_eq!(ce.rid2pasid(), 0);
        assert!(!ce.reserved_bits_set(48));

        let mut bad = ce;
        bad.val[2] = 1;
        assert!(bad.reserved_bits_set(48));
    }

    #[test]
    fn test_pasid_indices() {
        assert_eq!(pasid_dir_index(0), 0);
        assert_eq!(pasid_dir_index(65), 1);
        assert_eq!(pasid_table_index(65), 1);
        assert_eq!(pasid_table_index(63), 63);
    }

    #[test]
    fn test_pasid_entry_fields() {
        let pe = PasidEntry::second_stage(0xa000, 2, 7);
        assert!(pe.is_present());
        assert_eq!(pe.pgtt(), PasidGranularType::SecondStage);
        assert_eq!(pe.slpt_base(), 0xa000);
        assert_eq!(pe.level(), 4);
        assert_eq!(pe.agaw(), 48);
        assert_eq!(pe.domain_id(), 7);

        let pe = PasidEntry::first_stage(0xb000, 0, 9);
        assert_eq!(pe.pgtt(), PasidGranularType::FirstStage);
        assert_eq!(pe.flpt_base(), 0xb000);
        assert_eq!(pe.fl_level(), 4);
        assert_eq!(pe.fl_aw(), 48);

        let pe = PasidEntry::default();
        assert_eq!(pe.pgtt(), PasidGranularType::Unknown(0));
        assert!(!pe.is_present());
    }

    #[test]
    fn test_root_table_pointer() {
        let rtp = RootTablePointer::new(0x1234_5fff, false, 39);
        assert_eq!(rtp.addr, 0x1234_5000);
        assert_eq!(rtp.entry_addr(2), 0x1234_5020);
    }
}
