// 队列失效（Queued Invalidation）
//
// guest在内存中维护一个环形描述符队列，写尾指针寄存器通知IOMMU处理。
// 本模块负责：
// - 描述符解码与保留位检查（128位与256位两种格式）
// - 队列使能、关闭、尾指针写入的状态机
// - 严格按FIFO顺序逐个取出描述符，交给处理者执行
//
// 任一描述符处理失败即停止，由调用方置队列错误位；头指针停在
// 最后一个成功处理的描述符之后。

use crate::error::{IommuError, IommuResult};
use crate::memory::GuestMemory;
use crate::{haw_mask, DeviceId, PAGE_SIZE_4K};
use log::{debug, error, info, warn};
use serde::{Deserialize, Serialize};
use std::fmt;

/// 描述符类型码
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DescriptorType {
    ContextCache,
    Iotlb,
    DeviceIotlb,
    InterruptEntryCache,
    Wait,
    PasidIotlb,
    PasidCache,
    DevicePasidIotlb,
    Unknown(u8),
}

impl DescriptorType {
    /// 由描述符低64位解析类型（bits 3:0 与 11:9）
    pub fn from_lo(lo: u64) -> Self {
        let code = (((lo >> 5) & 0x70) | (lo & 0xf)) as u8;
        match code {
            0x1 => DescriptorType::ContextCache,
            0x2 => DescriptorType::Iotlb,
            0x3 => DescriptorType::DeviceIotlb,
            0x4 => DescriptorType::InterruptEntryCache,
            0x5 => DescriptorType::Wait,
            0x6 => DescriptorType::PasidIotlb,
            0x7 => DescriptorType::PasidCache,
            0x8 => DescriptorType::DevicePasidIotlb,
            other => DescriptorType::Unknown(other),
        }
    }

    pub fn code(self) -> u8 {
        match self {
            DescriptorType::ContextCache => 0x1,
            DescriptorType::Iotlb => 0x2,
            DescriptorType::DeviceIotlb => 0x3,
            DescriptorType::InterruptEntryCache => 0x4,
            DescriptorType::Wait => 0x5,
            DescriptorType::PasidIotlb => 0x6,
            DescriptorType::PasidCache => 0x7,
            DescriptorType::DevicePasidIotlb => 0x8,
            DescriptorType::Unknown(code) => code,
        }
    }
}

impl fmt::Display for DescriptorType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DescriptorType::ContextCache => "context-cache",
            DescriptorType::Iotlb => "iotlb",
            DescriptorType::DeviceIotlb => "device",
            DescriptorType::InterruptEntryCache => "iec",
            DescriptorType::Wait => "wait",
            DescriptorType::PasidIotlb => "p-iotlb",
            DescriptorType::PasidCache => "pasid-cache",
            DescriptorType::DevicePasidIotlb => "device-piotlb",
            DescriptorType::Unknown(_) => "unknown",
        };
        write!(f, "{}", name)
    }
}

const WAIT_IF: u64 = 1 << 4;
const WAIT_SW: u64 = 1 << 5;
const WAIT_FN: u64 = 1 << 6;
const WAIT_RSVD_LO: u64 = 0xffff_f180;
const WAIT_RSVD_HI: u64 = 0x3;

const GRANULARITY: u64 = 3 << 4;

const CC_RSVD: u64 = 0xfffc_0000_0000_f1c0;
const IOTLB_RSVD_LO: u64 = 0xffff_ffff_0000_f100;
const IOTLB_RSVD_HI: u64 = 0xf80;
const DEVICE_IOTLB_RSVD_LO: u64 = 0xffff_0000_ffe0_f1f0;
const DEVICE_IOTLB_RSVD_HI: u64 = 0xffe;
const PASIDC_RSVD_VAL0: u64 = 0xfff0_0000_0000_f1c0;
const PIOTLB_RSVD_VAL0: u64 = 0xfff0_0000_0000_f1c0;
const PIOTLB_RSVD_VAL1: u64 = 0xf80;

const IQT_256_RSVD: u64 = 0x10;

/// 上下文缓存失效粒度
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContextInvalidation {
    Global,
    /// 域选择性失效按全局失效处理
    Domain(u16),
    /// 设备选择性失效，`function_mask` 屏蔽devfn的低位
    Device { source_id: u16, function_mask: u8 },
}

impl ContextInvalidation {
    /// 设备选择性失效是否覆盖某个设备
    pub fn covers(&self, dev: DeviceId) -> bool {
        match *self {
            ContextInvalidation::Global | ContextInvalidation::Domain(_) => true,
            ContextInvalidation::Device {
                source_id,
                function_mask,
            } => {
                let mask: u8 = match function_mask & 3 {
                    0 => 0,
                    1 => 4,
                    2 => 6,
                    3 => 7,
                    _ => unreachable!(),
                };
                let target = DeviceId::from_sid(source_id);
                dev.bus == target.bus && (dev.devfn & !mask) == (target.devfn & !mask)
            }
        }
    }
}

/// IOTLB失效粒度
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IotlbInvalidation {
    Global,
    Domain(u16),
    Page { domain_id: u16, addr: u64, am: u8 },
}

/// PASID缓存失效粒度
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PasidCacheInvalidation {
    Global,
    Domain(u16),
    Pasid { domain_id: u16, pasid: u32 },
}

/// 解码后的失效描述符
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InvalidationDescriptor {
    /// 等待描述符：状态写、中断或栅栏
    Wait {
        status_write: Option<(u64, u32)>,
        interrupt: bool,
        fence: bool,
    },
    ContextCache(ContextInvalidation),
    Iotlb(IotlbInvalidation),
    PasidCache(PasidCacheInvalidation),
    /// `page` 为空表示失效整个PASID
    PasidIotlb {
        domain_id: u16,
        pasid: u32,
        page: Option<(u64, u8, bool)>,
    },
    InterruptEntryCache {
        global: bool,
        index: u16,
        index_mask: u8,
    },
    /// 设备IOTLB失效，地址已按大小对齐
    DeviceIotlb { source_id: u16, addr: u64, size: u64 },
    DevicePasidIotlb,
}

fn invalid(kind: DescriptorType, raw: &[u64; 4], what: &str) -> IommuError {
    IommuError::QueueError(format!(
        "invalid {} inv desc: val={:#x?} ({})",
        kind, raw, what
    ))
}

impl InvalidationDescriptor {
    /// 解码一个描述符
    ///
    /// # 参数
    /// - `raw`: 描述符原始内容（128位格式只有前两个字有效）
    ///
    /// # 返回
    /// - `Ok(desc)`: 合法描述符
    /// - `Err(IommuError::QueueError)`: 保留位非零、粒度非法或类型未知
    pub fn decode(raw: &[u64; 4]) -> IommuResult<Self> {
        let (lo, hi) = (raw[0], raw[1]);
        let kind = DescriptorType::from_lo(lo);
        let desc = match kind {
            DescriptorType::Wait => {
                if hi & WAIT_RSVD_HI != 0 || lo & WAIT_RSVD_LO != 0 {
                    return Err(invalid(kind, raw, "reserved nonzero"));
                }
                let status_write = (lo & WAIT_SW != 0).then(|| (hi, (lo >> 32) as u32));
                let interrupt = lo & WAIT_IF != 0;
                let fence = lo & WAIT_FN != 0;
                if status_write.is_none() && !interrupt && !fence {
                    return Err(invalid(kind, raw, "unknown type"));
                }
                InvalidationDescriptor::Wait {
                    status_write,
                    interrupt,
                    fence,
                }
            }
            DescriptorType::ContextCache => {
                if lo & CC_RSVD != 0 || hi != 0 {
                    return Err(invalid(kind, raw, "reserved nonzero"));
                }
                let scope = match (lo & GRANULARITY) >> 4 {
                    1 => ContextInvalidation::Global,
                    2 => ContextInvalidation::Domain(((lo >> 16) & 0xffff) as u16),
                    3 => ContextInvalidation::Device {
                        source_id: ((lo >> 32) & 0xffff) as u16,
                        function_mask: ((lo >> 48) & 3) as u8,
                    },
                    _ => return Err(invalid(kind, raw, "invalid type")),
                };
                InvalidationDescriptor::ContextCache(scope)
            }
            DescriptorType::Iotlb => {
                if lo & IOTLB_RSVD_LO != 0 || hi & IOTLB_RSVD_HI != 0 {
                    return Err(invalid(kind, raw, "reserved bits unzero"));
                }
                let domain_id = ((lo >> 16) & 0xffff) as u16;
                let scope = match (lo & GRANULARITY) >> 4 {
                    1 => IotlbInvalidation::Global,
                    2 => IotlbInvalidation::Domain(domain_id),
                    3 => {
                        let am = (hi & 0x3f) as u8;
                        if am > crate::MAMV {
                            return Err(invalid(kind, raw, "am > MAMV"));
                        }
                        IotlbInvalidation::Page {
                            domain_id,
                            addr: hi & !0xfff,
                            am,
                        }
                    }
                    _ => return Err(invalid(kind, raw, "type mismatch")),
                };
                InvalidationDescriptor::Iotlb(scope)
            }
            DescriptorType::PasidCache => {
                if lo & PASIDC_RSVD_VAL0 != 0 || hi != 0 || raw[2] != 0 || raw[3] != 0 {
                    return Err(invalid(kind, raw, "non-zero field"));
                }
                let domain_id = ((lo >> 16) & 0xffff) as u16;
                let pasid = ((lo >> 32) & 0xf_ffff) as u32;
                let scope = match (lo & GRANULARITY) >> 4 {
                    0 => PasidCacheInvalidation::Domain(domain_id),
                    1 => PasidCacheInvalidation::Pasid { domain_id, pasid },
                    3 => PasidCacheInvalidation::Global,
                    _ => return Err(invalid(kind, raw, "invalid granularity")),
                };
                InvalidationDescriptor::PasidCache(scope)
            }
            DescriptorType::PasidIotlb => {
                if lo & PIOTLB_RSVD_VAL0 != 0 || hi & PIOTLB_RSVD_VAL1 != 0 {
                    return Err(invalid(kind, raw, "non-zero field"));
                }
                let domain_id = ((lo >> 16) & 0xffff) as u16;
                let pasid = ((lo >> 32) & 0xf_ffff) as u32;
                let page = match (lo & GRANULARITY) >> 4 {
                    2 => None,
                    3 => Some((hi & !0xfff, (hi & 0x3f) as u8, (hi >> 6) & 1 != 0)),
                    _ => return Err(invalid(kind, raw, "invalid granularity")),
                };
                InvalidationDescriptor::PasidIotlb {
                    domain_id,
                    pasid,
                    page,
                }
            }
            DescriptorType::InterruptEntryCache => InvalidationDescriptor::InterruptEntryCache {
                global: lo & (1 << 4) == 0,
                index: ((lo >> 32) & 0xffff) as u16,
                index_mask: ((lo >> 27) & 0x1f) as u8,
            },
            DescriptorType::DeviceIotlb => {
                if lo & DEVICE_IOTLB_RSVD_LO != 0 || hi & DEVICE_IOTLB_RSVD_HI != 0 {
                    return Err(invalid(kind, raw, "reserved nonzero"));
                }
                let mut addr = hi & !0xfff;
                let size = if hi & 1 != 0 {
                    // S=1：地址低位连续的1决定范围大小
                    let ones = (addr >> 12).trailing_ones();
                    let size = (PAGE_SIZE_4K * 2).checked_shl(ones).unwrap_or(0);
                    if size == 0 {
                        addr = 0;
                        u64::MAX
                    } else {
                        addr &= !(size - 1);
                        size
                    }
                } else {
                    PAGE_SIZE_4K
                };
                InvalidationDescriptor::DeviceIotlb {
                    source_id: ((lo >> 32) & 0xffff) as u16,
                    addr,
                    size,
                }
            }
            DescriptorType::DevicePasidIotlb => InvalidationDescriptor::DevicePasidIotlb,
            DescriptorType::Unknown(_) => return Err(invalid(kind, raw, "unknown type")),
        };
        Ok(desc)
    }

    pub fn descriptor_type(&self) -> DescriptorType {
        match self {
            InvalidationDescriptor::Wait { .. } => DescriptorType::Wait,
            InvalidationDescriptor::ContextCache(_) => DescriptorType::ContextCache,
            InvalidationDescriptor::Iotlb(_) => DescriptorType::Iotlb,
            InvalidationDescriptor::PasidCache(_) => DescriptorType::PasidCache,
            InvalidationDescriptor::PasidIotlb { .. } => DescriptorType::PasidIotlb,
            InvalidationDescriptor::InterruptEntryCache { .. } => {
                DescriptorType::InterruptEntryCache
            }
            InvalidationDescriptor::DeviceIotlb { .. } => DescriptorType::DeviceIotlb,
            InvalidationDescriptor::DevicePasidIotlb => DescriptorType::DevicePasidIotlb,
        }
    }
}

/// 描述符处理者
pub trait DescriptorHandler {
    fn handle(&mut self, desc: &InvalidationDescriptor) -> IommuResult<()>;
}

/// 可持久化的队列寄存器状态
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueState {
    pub base: u64,
    pub size: u32,
    pub head: u32,
    pub tail: u32,
    pub enabled: bool,
    pub dw: bool,
}

/// 失效队列状态
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InvalidationQueue {
    base: u64,
    size: u32,
    head: u32,
    tail: u32,
    enabled: bool,
    /// 256位描述符
    dw: bool,
    /// 最近一次取出的描述符类型；读取失败时为 `None`
    last_type: Option<DescriptorType>,
}

impl InvalidationQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// 设置描述符宽度（仅在队列关闭时由队列地址寄存器决定）
    pub fn set_descriptor_width(&mut self, dw: bool) {
        self.dw = dw;
    }

    pub fn descriptor_width(&self) -> bool {
        self.dw
    }

    fn descriptor_size(&self) -> u64 {
        if self.dw { 32 } else { 16 }
    }

    fn head_shift(&self) -> u32 {
        if self.dw { 5 } else { 4 }
    }

    /// 使能队列
    ///
    /// # 参数
    /// - `iqa`: 队列基址（低12位为队列大小QS）
    /// - `aw_bits`: 主机地址宽度
    ///
    /// # 返回
    /// 尾指针在使能前已被写入时返回 `true`，调用方应立即处理
    pub fn enable(&mut self, iqa: u64, aw_bits: u8) -> bool {
        self.base = iqa & (haw_mask(aw_bits) ^ 0xfff);
        let qs = (iqa & 0x7) as u32;
        self.size = 1 << (qs + 8 - u32::from(self.dw));
        self.enabled = true;
        info!(
            "queued invalidation enabled: base={:#x}, size={}",
            self.base, self.size
        );
        if self.tail != 0 {
            warn!(
                "invalidation queue tail {} set before enabling, processing anyway",
                self.tail
            );
            return true;
        }
        false
    }

    /// 关闭队列；只有队列已排空且最后一个描述符为等待描述符时才允许
    pub fn disable(&mut self) -> bool {
        if self.enabled && self.head == self.tail && self.last_type == Some(DescriptorType::Wait) {
            self.head = 0;
            self.enabled = false;
            info!("queued invalidation disabled");
            true
        } else {
            warn!(
                "detected improper state when disable QI (head={:#x}, tail={:#x}, last_type={:?})",
                self.head, self.tail, self.last_type
            );
            false
        }
    }

    /// 写尾指针寄存器
    ///
    /// # 返回
    /// 队列已使能、需要处理时返回 `true`
    pub fn write_tail(&mut self, val: u64) -> bool {
        if self.dw && val & IQT_256_RSVD != 0 {
            error!("invalidation queue tail reserved bit is set: val={:#x}", val);
            return false;
        }
        self.tail = if self.dw {
            ((val >> 5) & 0x3fff) as u32
        } else {
            ((val >> 4) & 0x7fff) as u32
        };
        debug!("invalidation queue tail: {}", self.tail);
        self.enabled
    }

    /// 按FIFO顺序处理 `head..tail` 的全部描述符
    ///
    /// # 返回
    /// - `Ok(count)`: 成功处理的描述符数
    /// - `Err(err)`: 尾指针越界、读取失败或描述符非法，调用方应置队列错误
    pub fn drain(
        &mut self,
        memory: &dyn GuestMemory,
        handler: &mut dyn DescriptorHandler,
    ) -> IommuResult<usize> {
        if self.tail >= self.size {
            return Err(IommuError::QueueError(format!(
                "detected invalid QI tail (tail={:#x}, size={:#x})",
                self.tail, self.size
            )));
        }
        let mut processed = 0;
        while self.head != self.tail {
            let raw = self.read_descriptor(memory).inspect_err(|_| {
                self.last_type = None;
            })?;
            // 先记录类型，再处理
            let kind = DescriptorType::from_lo(raw[0]);
            self.last_type = Some(kind);
            debug!(
                "inv desc {} at head {}: lo={:#x}, hi={:#x}",
                kind, self.head, raw[0], raw[1]
            );
            let desc = InvalidationDescriptor::decode(&raw)?;
            handler.handle(&desc)?;

            self.head = (self.head + 1) % self.size;
            processed += 1;
        }
        Ok(processed)
    }

    fn read_descriptor(&self, memory: &dyn GuestMemory) -> IommuResult<[u64; 4]> {
        let addr = self.base + u64::from(self.head) * self.descriptor_size();
        let mut raw = [0u64; 4];
        let words = if self.dw { 4 } else { 2 };
        memory
            .read_qwords(addr, &mut raw[..words])
            .map_err(|_| IommuError::QueueError(format!("read inv desc failed at {:#x}", addr)))?;
        Ok(raw)
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn base(&self) -> u64 {
        self.base
    }

    pub fn size(&self) -> u32 {
        self.size
    }

    pub fn head(&self) -> u32 {
        self.head
    }

    pub fn tail(&self) -> u32 {
        self.tail
    }

    /// 头指针寄存器值
    pub fn head_register(&self) -> u64 {
        (u64::from(self.head) << self.head_shift()) & 0x7_fff0
    }

    pub fn last_type(&self) -> Option<DescriptorType> {
        self.last_type
    }

    /// 保存队列寄存器状态
    pub fn save(&self) -> QueueState {
        QueueState {
            base: self.base,
            size: self.size,
            head: self.head,
            tail: self.tail,
            enabled: self.enabled,
            dw: self.dw,
        }
    }

    /// 由保存的寄存器状态恢复；最近描述符类型无法恢复，按等待描述符处理
    pub fn restore(&mut self, state: &QueueState) {
        self.base = state.base;
        self.size = state.size;
        self.head = state.head;
        self.tail = state.tail;
        self.enabled = state.enabled;
        self.dw = state.dw;
        self.last_type = Some(DescriptorType::Wait);
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::SparseMemory;

    const IQ: u64 = 0x8000;

    fn wait_desc() -> [u64; 4] {
        [0x5 | WAIT_FN, 0, 0, 0]
    }

    fn iotlb_global() -> [u64; 4] {
        [0x2 | (1 << 4), 0, 0, 0]
    }

    struct Recorder {
        seen: Vec<InvalidationDescriptor>,
        fail_on: Option<DescriptorType>,
    }

    impl DescriptorHandler for Recorder {
        fn handle(&mut self, desc: &InvalidationDescriptor) -> IommuResult<()> {
            if self.fail_on == Some(desc.descriptor_type()) {
                return Err(IommuError::QueueError("rejected".into()));
            }
            self.seen.push(*desc);
            Ok(())
        }
    }

    fn write_desc(mem: &SparseMemory, index: u64, raw: [u64; 4]) {
        mem.write_u64(IQ + index * 16, raw[0]).unwrap();
        mem.write_u64(IQ + index * 16 + 8, raw[1]).unwrap();
    }

    #[test]
    fn test_descriptor_type() {
        assert_eq!(DescriptorType::from_lo(0x5), DescriptorType::Wait);
        assert_eq!(DescriptorType::from_lo(0x200), DescriptorType::Unknown(0x10));
        assert_eq!(DescriptorType::PasidCache.code(), 0x7);
    }

    #[test]
    fn test_decode_wait() {
        let desc = InvalidationDescriptor::decode(&[0x5 | WAIT_SW | (0xabu64 << 32), 0x9000, 0, 0])
            .unwrap();
        assert_eq!(
            desc,
            InvalidationDescriptor::Wait {
                status_write: Some((0x9000, 0xab)),
                interrupt: false,
                fence: false
            }
        );
        assert!(InvalidationDescriptor::decode(&[0x5, 0, 0, 0]).is_err());
        assert!(InvalidationDescriptor::decode(&[0x5 | WAIT_FN, 1, 0, 0]).is_err());
    }

    #[test]
    fn test_decode_context_cache() {
        let lo = 0x1 | (3 << 4) | (0x0108u64 << 32) | (2u64 << 48);
        let desc = InvalidationDescriptor::decode(&[lo, 0, 0, 0]).unwrap();
        let InvalidationDescriptor::ContextCache(scope) = desc else {
            panic!("unexpected descriptor {:?}", desc);
        };
        // FM=2 屏蔽devfn的 bits 2:1
        assert!(scope.covers(DeviceId::new(1, 0x0a)));
        assert!(scope.covers(DeviceId::new(1, 0x0e)));
        assert!(!scope.covers(DeviceId::new(1, 0x09)));
        assert!(!scope.covers(DeviceId::new(1, 0x10)));
        assert!(!scope.covers(DeviceId::new(2, 0x08)));
        assert!(InvalidationDescriptor::decode(&[0x1, 0, 0, 0]).is_err());
        assert!(InvalidationDescriptor::decode(&[0x1 | (1 << 4), 1, 0, 0]).is_err());
    }

    #[test]
    fn test_decode_iotlb_page() {
        let lo = 0x2 | (3 << 4) | (7u64 << 16);
        let desc = InvalidationDescriptor::decode(&[lo, 0x4000 | 2, 0, 0]).unwrap();
        assert_eq!(
            desc,
            InvalidationDescriptor::Iotlb(IotlbInvalidation::Page {
                domain_id: 7,
                addr: 0x4000,
                am: 2
            })
        );
        assert!(InvalidationDescriptor::decode(&[lo, 0x4000 | 19, 0, 0]).is_err());
    }

    #[test]
    fn test_decode_pasid_descriptors() {
        let lo = 0x7 | (1 << 4) | (3u64 << 16) | (5u64 << 32);
        assert_eq!(
            InvalidationDescriptor::decode(&[lo, 0, 0, 0]).unwrap(),
            InvalidationDescriptor::PasidCache(PasidCacheInvalidation::Pasid {
                domain_id: 3,
                pasid: 5
            })
        );
        assert!(InvalidationDescriptor::decode(&[lo, 0, 1, 0]).is_err());

        let lo = 0x6 | (3 << 4) | (3u64 << 16) | (5u64 << 32);
        assert_eq!(
            InvalidationDescriptor::decode(&[lo, 0x2000 | (1 << 6) | 1, 0, 0]).unwrap(),
            InvalidationDescriptor::PasidIotlb {
                domain_id: 3,
                pasid: 5,
                page: Some((0x2000, 1, true))
            }
        );
    }

    #[test]
    fn test_decode_device_iotlb_size() {
        // S=1，bits 15:12 = x011 → 32K
        let desc = InvalidationDescriptor::decode(&[0x3 | (0x10u64 << 32), 0x13000 | 1, 0, 0])
            .unwrap();
        assert_eq!(
            desc,
            InvalidationDescriptor::DeviceIotlb {
                source_id: 0x10,
                addr: 0x10000,
                size: 0x8000
            }
        );
    }

    #[test]
    fn test_enable_and_drain() {
        let mem = SparseMemory::default();
        write_desc(&mem, 0, iotlb_global());
        write_desc(&mem, 1, wait_desc());

        let mut queue = InvalidationQueue::new();
        assert!(!queue.enable(IQ, 39));
        assert_eq!(queue.size(), 256);
        assert!(queue.write_tail(2 << 4));

        let mut handler = Recorder {
            seen: Vec::new(),
            fail_on: None,
        };
        assert_eq!(queue.drain(&mem, &mut handler).unwrap(), 2);
        assert_eq!(queue.head(), 2);
        assert_eq!(queue.head_register(), 2 << 4);
        assert_eq!(queue.last_type(), Some(DescriptorType::Wait));
        assert!(queue.disable());
        assert_eq!(queue.head(), 0);
    }

    #[test]
    fn test_drain_stops_at_failure() {
        let mem = SparseMemory::default();
        write_desc(&mem, 0, wait_desc());
        write_desc(&mem, 1, iotlb_global());
        write_desc(&mem, 2, wait_desc());

        let mut queue = InvalidationQueue::new();
        queue.enable(IQ, 39);
        queue.write_tail(3 << 4);
        let mut handler = Recorder {
            seen: Vec::new(),
            fail_on: Some(DescriptorType::Iotlb),
        };
        assert!(queue.drain(&mem, &mut handler).is_err());
        assert_eq!(queue.head(), 1);
        assert_eq!(queue.last_type(), Some(DescriptorType::Iotlb));
        assert!(!queue.disable());
    }

    #[test]
    fn test_tail_before_enable() {
        let mut queue = InvalidationQueue::new();
        assert!(!queue.write_tail(1 << 4));
        assert!(queue.enable(IQ, 39));
    }

    #[test]
    fn test_tail_out_of_range() {
        let mem = SparseMemory::default();
        let mut queue = InvalidationQueue::new();
        queue.enable(IQ, 39);
        queue.write_tail(300 << 4);
        let mut handler = Recorder {
            seen: Vec::new(),
            fail_on: None,
        };
        assert!(matches!(
            queue.drain(&mem, &mut handler),
            Err(IommuError::QueueError(_))
        ));
    }

    #[test]
    fn test_wide_descriptors() {
        let mut queue = InvalidationQueue::new();
        queue.set_descriptor_width(true);
        queue.enable(IQ | 1, 48);
        assert_eq!(queue.size(), 256);
        assert!(!queue.write_tail((1 << 5) | IQT_256_RSVD));
        assert_eq!(queue.tail(), 0);
        queue.write_tail(3 << 5);
        assert_eq!(queue.tail(), 3);
    }

    #[test]
    fn test_save_restore() {
        let mut queue = InvalidationQueue::new();
        queue.enable(IQ, 39);
        queue.write_tail(2 << 4);
        let saved = queue.save();

        let mut restored = InvalidationQueue::new();
        restored.restore(&saved);
        assert!(restored.is_enabled());
        assert_eq!(restored.tail(), 2);
        assert_eq!(restored.base(), IQ);
        // 恢复后可直接关闭
        restored.write_tail(0);
        assert!(restored.disable());
    }
}
