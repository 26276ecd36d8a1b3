// 范围页表遍历与映射通知
//
// 对一段IOVA区间递归遍历二级或一级页表，为映射观察者（影子页表）生成
// MAP/UNMAP事件：
// - 权限逐级叠加，无读写权限的子树整体视为未映射
// - 每个地址空间维护一棵IOVA区间树，与上次已通知的映射做差分
// - 相同映射不重复通知，变化的映射先UNMAP旧区间再MAP新区间

use crate::error::{FaultReason, IommuError, IommuResult};
use crate::memory::GuestMemory;
use crate::walker::{PagingFormat, ReservedMasks};
use crate::{haw_mask, IommuPerm, PAGE_SIZE_4K};
use log::{debug, trace};
use std::collections::BTreeMap;
use std::fmt;
use std::ops::BitOr;

/// 观察者关心的事件类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct NotifierFlags(u8);

impl NotifierFlags {
    pub const NONE: Self = Self(0);
    pub const MAP: Self = Self(1 << 0);
    pub const UNMAP: Self = Self(1 << 1);
    pub const DEVIOTLB_UNMAP: Self = Self(1 << 2);
    /// MAP + UNMAP
    pub const IOTLB_EVENTS: Self = Self(1 << 0 | 1 << 1);

    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    pub const fn intersects(self, other: Self) -> bool {
        self.0 & other.0 != 0
    }

    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }
}

impl BitOr for NotifierFlags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

/// 映射变化事件
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MappingEvent {
    /// 事件类型（MAP、UNMAP或DEVIOTLB_UNMAP之一）
    pub kind: NotifierFlags,
    /// 区间起始IOVA
    pub iova: u64,
    /// 区间掩码（大小 - 1）
    pub addr_mask: u64,
    /// 转换后的地址，仅对MAP有意义
    pub translated_addr: u64,
    /// 访问权限，UNMAP时为NONE
    pub perm: IommuPerm,
}

impl MappingEvent {
    pub fn map(iova: u64, addr_mask: u64, translated_addr: u64, perm: IommuPerm) -> Self {
        Self {
            kind: NotifierFlags::MAP,
            iova,
            addr_mask,
            translated_addr,
            perm,
        }
    }

    pub fn unmap(iova: u64, addr_mask: u64) -> Self {
        Self {
            kind: NotifierFlags::UNMAP,
            iova,
            addr_mask,
            translated_addr: 0,
            perm: IommuPerm::NONE,
        }
    }

    pub fn device_iotlb_unmap(iova: u64, addr_mask: u64) -> Self {
        Self {
            kind: NotifierFlags::DEVIOTLB_UNMAP,
            ..Self::unmap(iova, addr_mask)
        }
    }

    pub fn is_map(&self) -> bool {
        self.kind == NotifierFlags::MAP
    }

    /// 区间最后一个地址（含）
    pub fn last(&self) -> u64 {
        self.iova.saturating_add(self.addr_mask)
    }
}

impl fmt::Display for MappingEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = if self.kind == NotifierFlags::MAP {
            "MAP"
        } else if self.kind == NotifierFlags::DEVIOTLB_UNMAP {
            "DEVIOTLB_UNMAP"
        } else {
            "UNMAP"
        };
        write!(
            f,
            "{} iova={:#x} mask={:#x} xlat={:#x} perm={}",
            kind, self.iova, self.addr_mask, self.translated_addr, self.perm
        )
    }
}

/// 映射观察者
///
/// 由外部影子页表（例如直通设备的DMA映射）实现。
pub trait MappingObserver: Send + Sync {
    /// 关心的事件类型
    fn flags(&self) -> NotifierFlags;

    /// 关心的IOVA区间（含两端）
    fn range(&self) -> (u64, u64) {
        (0, u64::MAX)
    }

    /// 接收一个事件；返回错误时中止当前遍历
    fn notify(&self, event: &MappingEvent) -> IommuResult<()>;

    /// 事件是否应投递给该观察者
    fn accepts(&self, event: &MappingEvent) -> bool {
        let (start, end) = self.range();
        self.flags().intersects(event.kind) && event.iova <= end && event.last() >= start
    }
}

/// 已通知的映射区间
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DmaMap {
    pub iova: u64,
    /// 区间大小 - 1
    pub size: u64,
    pub translated_addr: u64,
    pub perm: IommuPerm,
}

impl DmaMap {
    fn last(&self) -> u64 {
        self.iova.saturating_add(self.size)
    }

    fn overlaps(&self, iova: u64, last: u64) -> bool {
        self.iova <= last && self.last() >= iova
    }
}

impl From<&MappingEvent> for DmaMap {
    fn from(event: &MappingEvent) -> Self {
        Self {
            iova: event.iova,
            size: event.addr_mask,
            translated_addr: event.translated_addr,
            perm: event.perm,
        }
    }
}

/// IOVA区间树（区间互不重叠）
#[derive(Debug, Default, Clone)]
pub struct IovaTree {
    maps: BTreeMap<u64, DmaMap>,
}

impl IovaTree {
    pub fn new() -> Self {
        Self::default()
    }

    /// 查找与 `[iova, last]` 重叠的任一映射
    pub fn find(&self, iova: u64, last: u64) -> Option<&DmaMap> {
        if let Some((_, map)) = self.maps.range(..=iova).next_back() {
            if map.overlaps(iova, last) {
                return Some(map);
            }
        }
        self.maps
            .range(iova..)
            .next()
            .map(|(_, map)| map)
            .filter(|map| map.overlaps(iova, last))
    }

    pub fn insert(&mut self, map: DmaMap) {
        self.maps.insert(map.iova, map);
    }

    /// 删除与 `[iova, last]` 重叠的全部映射
    pub fn remove(&mut self, iova: u64, last: u64) -> usize {
        let mut removed = 0;
        while let Some(key) = self.find(iova, last).map(|map| map.iova) {
            self.maps.remove(&key);
            removed += 1;
        }
        removed
    }

    pub fn clear(&mut self) {
        self.maps.clear();
    }

    pub fn len(&self) -> usize {
        self.maps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.maps.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &DmaMap> {
        self.maps.values()
    }
}

/// 事件接收者
pub type EventSink<'s> = dyn FnMut(&MappingEvent) -> IommuResult<()> + 's;

/// 范围遍历器
pub struct RangeWalker<'a> {
    memory: &'a dyn GuestMemory,
    masks: &'a ReservedMasks,
    format: PagingFormat,
    tree: &'a mut IovaTree,
    notify_unmap: bool,
    domain_id: u16,
    events: usize,
}

impl<'a> RangeWalker<'a> {
    /// 创建范围遍历器
    ///
    /// # 参数
    /// - `tree`: 地址空间的IOVA区间树
    /// - `notify_unmap`: 是否通知无效表项对应的UNMAP
    /// - `domain_id`: 仅用于日志
    pub fn new(
        memory: &'a dyn GuestMemory,
        masks: &'a ReservedMasks,
        tree: &'a mut IovaTree,
        notify_unmap: bool,
        domain_id: u16,
    ) -> Self {
        Self {
            memory,
            masks,
            format: PagingFormat::SECOND_STAGE,
            tree,
            notify_unmap,
            domain_id,
            events: 0,
        }
    }

    /// 改为遍历一级页表
    pub fn first_stage(mut self) -> Self {
        self.format = PagingFormat::FIRST_STAGE;
        self
    }

    /// 已投递的事件数
    pub fn events(&self) -> usize {
        self.events
    }

    /// 遍历 `[start, end)` 区间
    ///
    /// `start` 超出地址宽度时失败；`end` 超出时截断到上限。
    pub fn walk(
        &mut self,
        base: u64,
        level: u32,
        agaw: u32,
        start: u64,
        end: u64,
        sink: &mut EventSink<'_>,
    ) -> IommuResult<()> {
        if !self.format.is_level_valid(level) {
            return Err(IommuError::Fault(FaultReason::ContextEntryInvalid));
        }
        let width = agaw.min(self.masks.aw_bits() as u32);
        let limit = if width >= 64 { u64::MAX } else { 1u64 << width };
        if start >= limit {
            return Err(IommuError::Fault(FaultReason::AddressBeyondMgaw));
        }
        let end = end.min(limit);
        debug!(
            "range walk: did={}, first_stage={}, base={:#x}, level={}, [{:#x}, {:#x})",
            self.domain_id, self.format.first_stage, base, level, start, end
        );
        self.walk_level(base, start, end, level, true, true, sink)
    }

    #[allow(clippy::too_many_arguments)]
    fn walk_level(
        &mut self,
        addr: u64,
        start: u64,
        end: u64,
        level: u32,
        read: bool,
        write: bool,
        sink: &mut EventSink<'_>,
    ) -> IommuResult<()> {
        let format = self.format;
        let subpage_size = format.level_size(level);
        let subpage_mask = format.level_page_mask(level);
        let mut iova = start;

        while iova < end {
            let iova_next = (iova & subpage_mask).wrapping_add(subpage_size);
            let offset = format.level_offset(iova, level);
            let next = if iova_next == 0 { end } else { iova_next };

            let Ok(pte) = self.memory.read_u64(addr + offset * 8) else {
                trace!("range walk: skip unreadable [{:#x}, {:#x})", iova, next);
                iova = next;
                continue;
            };
            if format.nonzero_reserved(self.masks, pte, level) {
                trace!("range walk: skip reserved [{:#x}, {:#x})", iova, next);
                iova = next;
                continue;
            }

            let (r, w) = format.entry_perm(pte);
            let read_cur = read && r;
            let write_cur = write && w;
            let valid = read_cur || write_cur;

            if !format.is_last(pte, level) && valid {
                self.walk_level(
                    self.masks.pte_addr(pte),
                    iova,
                    next.min(end),
                    level - 1,
                    read_cur,
                    write_cur,
                    sink,
                )?;
            } else {
                let perm = IommuPerm::from_flags(read_cur, write_cur);
                let event = MappingEvent {
                    kind: if perm.is_none() {
                        NotifierFlags::UNMAP
                    } else {
                        NotifierFlags::MAP
                    },
                    iova: iova & subpage_mask,
                    addr_mask: !subpage_mask,
                    translated_addr: self.masks.pte_addr(pte),
                    perm,
                };
                self.page_walk_one(event, sink)?;
            }
            iova = next;
        }
        Ok(())
    }

    /// 与区间树做差分后投递单个事件
    fn page_walk_one(&mut self, event: MappingEvent, sink: &mut EventSink<'_>) -> IommuResult<()> {
        if !event.is_map() && !self.notify_unmap {
            return Ok(());
        }
        let target = DmaMap::from(&event);
        let mapped = self.tree.find(target.iova, target.last()).copied();

        if event.is_map() {
            if let Some(mapped) = mapped {
                if mapped == target {
                    trace!("range walk: skip unchanged map {}", event);
                    return Ok(());
                }
                // 映射变化：先撤销旧映射
                let unmap = MappingEvent::unmap(event.iova, event.addr_mask);
                debug!("range walk: did={}, {}", self.domain_id, unmap);
                sink(&unmap)?;
                self.events += 1;
                self.tree.remove(target.iova, target.last());
            }
            self.tree.insert(target);
        } else {
            if mapped.is_none() {
                return Ok(());
            }
            self.tree.remove(target.iova, target.last());
        }

        debug!("range walk: did={}, {}", self.domain_id, event);
        self.events += 1;
        sink(&event)
    }
}

/// `[start, end]` 内以 `start` 起始的最大对齐2次幂区间掩码
pub fn aligned_pow2_mask(start: u64, end: u64, max_addr_bits: u8) -> u64 {
    let max_mask = haw_mask(max_addr_bits);
    let addr_mask = end - start;
    let alignment_mask = if start == 0 {
        max_mask
    } else {
        ((start & start.wrapping_neg()) - 1).min(max_mask)
    };
    let size_mask = addr_mask.min(max_mask);
    if alignment_mask <= size_mask {
        return alignment_mask;
    }
    match size_mask.checked_add(1) {
        Some(size) => (1u64 << (63 - size.leading_zeros())) - 1,
        None => u64::MAX,
    }
}

/// 将 `[start, end]`（截断到地址宽度）拆分为对齐的UNMAP事件
pub fn unmap_range_events(start: u64, end: u64, aw_bits: u8) -> Vec<MappingEvent> {
    let end = end.min(haw_mask(aw_bits));
    let mut events = Vec::new();
    if start > end {
        return events;
    }
    let mut start = start;
    let mut remain = (end - start).saturating_add(1);
    while remain >= PAGE_SIZE_4K {
        let mask = aligned_pow2_mask(start, end, aw_bits);
        let size = mask.saturating_add(1);
        events.push(MappingEvent::unmap(start, mask));
        start = start.saturating_add(size);
        remain = remain.saturating_sub(size);
    }
    events
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::SparseMemory;
    use crate::walker::{FL_P, FL_RW, PT_PAGE_SIZE, SL_R, SL_W};

    const L3: u64 = 0x10_0000;
    const L2: u64 = 0x10_1000;
    const L1: u64 = 0x10_2000;

    fn build(mem: &SparseMemory) {
        let f = PagingFormat::SECOND_STAGE;
        mem.write_u64(L3, L2 | SL_R | SL_W).unwrap();
        mem.write_u64(L2, L1 | SL_R | SL_W).unwrap();
        mem.write_u64(L1 + f.level_offset(0x1000, 1) * 8, 0x8000 | SL_R | SL_W)
            .unwrap();
        mem.write_u64(L1 + f.level_offset(0x2000, 1) * 8, 0x9000 | SL_R).unwrap();
        // 2M大页
        mem.write_u64(L2 + 8, 0x4000_0000 | SL_R | SL_W | PT_PAGE_SIZE)
            .unwrap();
    }

    fn collect(
        mem: &SparseMemory,
        masks: &ReservedMasks,
        tree: &mut IovaTree,
        notify_unmap: bool,
    ) -> Vec<MappingEvent> {
        let mut events = Vec::new();
        let mut walker = RangeWalker::new(mem, masks, tree, notify_unmap, 1);
        walker
            .walk(L3, 3, 39, 0, 1 << 39, &mut |event: &MappingEvent| {
                events.push(*event);
                Ok(())
            })
            .unwrap();
        events
    }

    #[test]
    fn test_flags() {
        let flags = NotifierFlags::MAP | NotifierFlags::UNMAP;
        assert_eq!(flags, NotifierFlags::IOTLB_EVENTS);
        assert!(flags.contains(NotifierFlags::MAP));
        assert!(!flags.intersects(NotifierFlags::DEVIOTLB_UNMAP));
        assert!(NotifierFlags::NONE.is_empty());
    }

    #[test]
    fn test_walk_emits_leaf_maps() {
        let mem = SparseMemory::default();
        build(&mem);
        let masks = ReservedMasks::new(39, false, false);
        let mut tree = IovaTree::new();
        let events = collect(&mem, &masks, &mut tree, false);

        assert_eq!(events.len(), 3);
        assert_eq!(events[0], MappingEvent::map(0x1000, 0xfff, 0x8000, IommuPerm::RW));
        assert_eq!(events[1], MappingEvent::map(0x2000, 0xfff, 0x9000, IommuPerm::READ));
        assert_eq!(
            events[2],
            MappingEvent::map(0x20_0000, 0x1f_ffff, 0x4000_0000, IommuPerm::RW)
        );
        assert_eq!(tree.len(), 3);
    }

    #[test]
    fn test_walk_is_idempotent() {
        let mem = SparseMemory::default();
        build(&mem);
        let masks = ReservedMasks::new(39, false, false);
        let mut tree = IovaTree::new();
        collect(&mem, &masks, &mut tree, true);
        let second = collect(&mem, &masks, &mut tree, true);
        assert!(second.is_empty());
    }

    #[test]
    fn test_changed_mapping_unmaps_first() {
        let mem = SparseMemory::default();
        build(&mem);
        let masks = ReservedMasks::new(39, false, false);
        let mut tree = IovaTree::new();
        collect(&mem, &masks, &mut tree, true);

        let f = PagingFormat::SECOND_STAGE;
        mem.write_u64(L1 + f.level_offset(0x1000, 1) * 8, 0xa000 | SL_R | SL_W)
            .unwrap();
        let events = collect(&mem, &masks, &mut tree, true);
        assert_eq!(events.len(), 2);
        assert_eq!(events[0], MappingEvent::unmap(0x1000, 0xfff));
        assert_eq!(events[1], MappingEvent::map(0x1000, 0xfff, 0xa000, IommuPerm::RW));
    }

    #[test]
    fn test_removed_mapping_unmaps() {
        let mem = SparseMemory::default();
        build(&mem);
        let masks = ReservedMasks::new(39, false, false);
        let mut tree = IovaTree::new();
        collect(&mem, &masks, &mut tree, true);

        let f = PagingFormat::SECOND_STAGE;
        mem.write_u64(L1 + f.level_offset(0x2000, 1) * 8, 0).unwrap();
        let events = collect(&mem, &masks, &mut tree, true);
        assert_eq!(events, vec![MappingEvent::unmap(0x2000, 0xfff)]);
        assert_eq!(tree.len(), 2);
    }

    #[test]
    fn test_stacked_permissions() {
        let mem = SparseMemory::default();
        build(&mem);
        // 中间层只读，整个子树不可写
        mem.write_u64(L2, L1 | SL_R).unwrap();
        let masks = ReservedMasks::new(39, false, false);
        let mut tree = IovaTree::new();
        let events = collect(&mem, &masks, &mut tree, false);
        assert_eq!(events[0].perm, IommuPerm::READ);
    }

    #[test]
    fn test_start_beyond_width() {
        let mem = SparseMemory::default();
        let masks = ReservedMasks::new(39, false, false);
        let mut tree = IovaTree::new();
        let mut walker = RangeWalker::new(&mem, &masks, &mut tree, true, 1);
        let err = walker
            .walk(L3, 3, 39, 1 << 39, u64::MAX, &mut |_: &MappingEvent| Ok(()))
            .unwrap_err();
        assert_eq!(err.fault_reason(), Some(FaultReason::AddressBeyondMgaw));
    }

    #[test]
    fn test_first_stage_walk() {
        let mem = SparseMemory::default();
        let f = PagingFormat::FIRST_STAGE;
        mem.write_u64(L3, L2 | FL_P | FL_RW).unwrap();
        mem.write_u64(L2, L1 | FL_P | FL_RW).unwrap();
        mem.write_u64(L1 + f.level_offset(0x1000, 1) * 8, 0x8000 | FL_P | FL_RW)
            .unwrap();
        mem.write_u64(L1 + f.level_offset(0x2000, 1) * 8, 0x9000 | FL_P)
            .unwrap();
        // 二级页表的W位在一级页表中不隐含present
        mem.write_u64(L1 + f.level_offset(0x3000, 1) * 8, 0xa000 | FL_RW)
            .unwrap();
        // SNP位在一级页表中不是保留位
        mem.write_u64(L1 + f.level_offset(0x4000, 1) * 8, 0xb000 | FL_P | 0x800)
            .unwrap();
        let masks = ReservedMasks::new(39, false, false);
        let mut tree = IovaTree::new();
        let mut events = Vec::new();
        let mut walker = RangeWalker::new(&mem, &masks, &mut tree, true, 1).first_stage();
        walker
            .walk(L3, 3, 39, 0, 0x20_0000, &mut |event: &MappingEvent| {
                events.push(*event);
                Ok(())
            })
            .unwrap();

        assert_eq!(
            events,
            vec![
                MappingEvent::map(0x1000, 0xfff, 0x8000, IommuPerm::RW),
                MappingEvent::map(0x2000, 0xfff, 0x9000, IommuPerm::READ),
                MappingEvent::map(0x4000, 0xfff, 0xb000, IommuPerm::READ),
            ]
        );
        assert_eq!(tree.len(), 3);

        // 表项被清除后发出UNMAP
        mem.write_u64(L1 + f.level_offset(0x2000, 1) * 8, 0).unwrap();
        let mut events = Vec::new();
        let mut walker = RangeWalker::new(&mem, &masks, &mut tree, true, 1).first_stage();
        walker
            .walk(L3, 3, 39, 0, 0x20_0000, &mut |event: &MappingEvent| {
                events.push(*event);
                Ok(())
            })
            .unwrap();
        assert_eq!(events, vec![MappingEvent::unmap(0x2000, 0xfff)]);
    }

    #[test]
    fn test_sink_error_aborts() {
        let mem = SparseMemory::default();
        build(&mem);
        let masks = ReservedMasks::new(39, false, false);
        let mut tree = IovaTree::new();
        let mut walker = RangeWalker::new(&mem, &masks, &mut tree, true, 1);
        let result = walker.walk(L3, 3, 39, 0, 1 << 39, &mut |_: &MappingEvent| {
            Err(IommuError::ObserverRejected("full".into()))
        });
        assert!(matches!(result, Err(IommuError::ObserverRejected(_))));
        assert_eq!(walker.events(), 1);
    }

    #[test]
    fn test_iova_tree_overlap() {
        let mut tree = IovaTree::new();
        tree.insert(DmaMap {
            iova: 0x1000,
            size: 0xfff,
            translated_addr: 0,
            perm: IommuPerm::RW,
        });
        tree.insert(DmaMap {
            iova: 0x4000,
            size: 0x1fff,
            translated_addr: 0,
            perm: IommuPerm::RW,
        });
        assert!(tree.find(0x1800, 0x1800).is_some());
        assert!(tree.find(0x0, 0x1000).is_some());
        assert!(tree.find(0x2000, 0x3fff).is_none());
        assert!(tree.find(0x5000, 0x5000).is_some());
        assert_eq!(tree.remove(0, u64::MAX), 2);
        assert!(tree.is_empty());
    }

    #[test]
    fn test_aligned_pow2_mask() {
        assert_eq!(aligned_pow2_mask(0, (1 << 39) - 1, 39), (1 << 39) - 1);
        assert_eq!(aligned_pow2_mask(0x1000, 0xffff, 39), 0xfff);
        assert_eq!(aligned_pow2_mask(0x10000, 0x17fff, 39), 0x7fff);
        assert_eq!(aligned_pow2_mask(0, 0x2fff, 39), 0x1fff);
    }

    #[test]
    fn test_unmap_range_events() {
        let events = unmap_range_events(0, u64::MAX, 39);
        assert_eq!(events, vec![MappingEvent::unmap(0, (1 << 39) - 1)]);

        let events = unmap_range_events(0x1000, 0x3fff, 39);
        assert_eq!(
            events,
            vec![
                MappingEvent::unmap(0x1000, 0xfff),
                MappingEvent::unmap(0x2000, 0x1fff)
            ]
        );
    }
}
