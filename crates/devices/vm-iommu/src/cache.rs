// 转换缓存管理
//
// 实现VT-d的三类缓存：
// - IOTLB：按 {源标识, PASID, 层级, 页帧号} 缓存二级遍历结果
// - PASID-IOTLB：按字符串键缓存一级遍历结果
// - 上下文缓存：通过全局代数（generation）实现O(1)整体失效
//
// 缓存满时整体清空后再插入，不做LRU淘汰。

use crate::walker::PagingFormat;
use crate::{AddressSpaceKey, IommuPerm, PAGE_SHIFT_4K};
use crate::entry::ContextEntry;
use log::debug;
use std::collections::HashMap;
use std::fmt;
use std::hash::Hash;

/// 上下文缓存代数上限，达到后整体复位
pub const CONTEXT_CACHE_GEN_MAX: u32 = u32::MAX;

/// 缓存条目
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IotlbEntry {
    /// 页帧号
    pub gfn: u64,
    /// 域标识
    pub domain_id: u16,
    /// 叶子页表项
    pub pte: u64,
    /// 访问权限
    pub perm: IommuPerm,
    /// 页面地址掩码
    pub mask: u64,
    /// PASID
    pub pasid: u32,
}

/// 由地址与层级计算页帧号
pub fn iotlb_gfn(addr: u64, level: u32) -> u64 {
    (addr & PagingFormat::SECOND_STAGE.level_page_mask(level)) >> PAGE_SHIFT_4K
}

/// 缓存键
pub trait CacheKey: Eq + Hash + Clone {
    fn compose(sid: u16, pasid: u32, level: u32, gfn: u64) -> Self;
}

/// IOTLB键
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct IotlbKey {
    pub sid: u16,
    pub pasid: u32,
    pub level: u32,
    pub gfn: u64,
}

impl CacheKey for IotlbKey {
    fn compose(sid: u16, pasid: u32, level: u32, gfn: u64) -> Self {
        Self {
            sid,
            pasid,
            level,
            gfn,
        }
    }
}

/// PASID-IOTLB键（字符串编码）
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PasidIotlbKey(String);

impl PasidIotlbKey {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl CacheKey for PasidIotlbKey {
    fn compose(sid: u16, pasid: u32, level: u32, gfn: u64) -> Self {
        Self(format!(
            "rsv{:010}sid{:06}pasid{:010}gfn{:017}level{:01}",
            0, sid, pasid, gfn, level
        ))
    }
}

/// 页面失效参数
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageInvalidation {
    pub domain_id: u16,
    /// `Some` 时同时要求PASID相等（PASID-IOTLB）
    pub pasid: Option<u32>,
    pub addr: u64,
    /// 地址掩码（2^am 个4K页）
    pub am: u8,
}

impl PageInvalidation {
    fn gfn_mask(&self) -> u64 {
        !((1u64 << self.am) - 1)
    }

    /// 条目是否被本次失效覆盖
    pub fn matches(&self, entry: &IotlbEntry) -> bool {
        let mask = self.gfn_mask();
        let gfn = (self.addr >> PAGE_SHIFT_4K) & mask;
        let gfn_tlb = (self.addr & entry.mask) >> PAGE_SHIFT_4K;
        entry.domain_id == self.domain_id
            && self.pasid.is_none_or(|pasid| entry.pasid == pasid)
            && ((entry.gfn & mask) == gfn || entry.gfn == gfn_tlb)
    }
}

/// 缓存统计
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CacheStats {
    /// 查找次数
    pub lookups: u64,
    /// 命中次数
    pub hits: u64,
    /// 未命中次数
    pub misses: u64,
    /// 命中率
    pub hit_rate: f64,
    /// 当前条目数
    pub current_size: usize,
    /// 最大条目数
    pub capacity: usize,
    /// 因容量满整体清空的次数
    pub full_resets: u64,
}

impl fmt::Display for CacheStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "缓存统计信息")?;
        writeln!(f, "  查找次数: {}", self.lookups)?;
        writeln!(f, "  命中次数: {}", self.hits)?;
        writeln!(f, "  未命中次数: {}", self.misses)?;
        writeln!(f, "  命中率: {:.2}%", self.hit_rate * 100.0)?;
        writeln!(f, "  当前条目数: {}/{}", self.current_size, self.capacity)?;
        write!(f, "  整体清空次数: {}", self.full_resets)
    }
}

/// 转换缓存
pub struct TranslationCache<K: CacheKey> {
    entries: HashMap<K, IotlbEntry>,
    capacity: usize,
    hit_count: u64,
    miss_count: u64,
    full_resets: u64,
}

/// IOTLB
pub type Iotlb = TranslationCache<IotlbKey>;
/// PASID-IOTLB
pub type PasidIotlb = TranslationCache<PasidIotlbKey>;

impl<K: CacheKey> TranslationCache<K> {
    /// 创建转换缓存
    ///
    /// # 参数
    /// - `capacity`: 最大条目数，达到后插入前整体清空
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: HashMap::with_capacity(capacity.min(1024)),
            capacity,
            hit_count: 0,
            miss_count: 0,
            full_resets: 0,
        }
    }

    /// 查找缓存条目
    ///
    /// 从4K层级向上探测到1G层级，第一个命中即返回。
    ///
    /// # 返回
    /// - `Some(entry)`: 命中
    /// - `None`: 未命中，需要页表遍历
    pub fn lookup(&mut self, sid: u16, pasid: u32, addr: u64) -> Option<IotlbEntry> {
        for level in 1..4 {
            let key = K::compose(sid, pasid, level, iotlb_gfn(addr, level));
            if let Some(entry) = self.entries.get(&key) {
                self.hit_count += 1;
                return Some(*entry);
            }
        }
        self.miss_count += 1;
        None
    }

    /// 插入遍历结果
    #[allow(clippy::too_many_arguments)]
    pub fn insert(
        &mut self,
        sid: u16,
        pasid: u32,
        addr: u64,
        level: u32,
        domain_id: u16,
        pte: u64,
        perm: IommuPerm,
    ) {
        if self.entries.len() >= self.capacity {
            debug!("translation cache full ({} entries), resetting", self.entries.len());
            self.entries.clear();
            self.full_resets += 1;
        }
        let gfn = iotlb_gfn(addr, level);
        debug!(
            "cache update: sid={:#x}, pasid={:#x}, gfn={:#x}, level={}, did={}, pte={:#x}",
            sid, pasid, gfn, level, domain_id, pte
        );
        self.entries.insert(
            K::compose(sid, pasid, level, gfn),
            IotlbEntry {
                gfn,
                domain_id,
                pte,
                perm,
                mask: PagingFormat::SECOND_STAGE.level_page_mask(level),
                pasid,
            },
        );
    }

    /// 按谓词删除条目，返回删除数量
    pub fn remove_where<F>(&mut self, mut predicate: F) -> usize
    where
        F: FnMut(&IotlbEntry) -> bool,
    {
        let before = self.entries.len();
        self.entries.retain(|_, entry| !predicate(entry));
        before - self.entries.len()
    }

    /// 删除某个域的全部条目
    pub fn remove_domain(&mut self, domain_id: u16) -> usize {
        self.remove_where(|entry| entry.domain_id == domain_id)
    }

    /// 删除某个域内某个PASID的全部条目
    pub fn remove_pasid(&mut self, domain_id: u16, pasid: u32) -> usize {
        self.remove_where(|entry| entry.domain_id == domain_id && entry.pasid == pasid)
    }

    /// 页面失效
    pub fn remove_page(&mut self, inv: &PageInvalidation) -> usize {
        self.remove_where(|entry| inv.matches(entry))
    }

    /// 清空全部条目
    pub fn reset(&mut self) {
        self.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// 获取缓存统计
    pub fn get_stats(&self) -> CacheStats {
        let lookups = self.hit_count + self.miss_count;
        CacheStats {
            lookups,
            hits: self.hit_count,
            misses: self.miss_count,
            hit_rate: if lookups > 0 {
                self.hit_count as f64 / lookups as f64
            } else {
                0.0
            },
            current_size: self.entries.len(),
            capacity: self.capacity,
            full_resets: self.full_resets,
        }
    }
}

/// 上下文缓存条目
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ContextCacheEntry {
    pub context_entry: Option<ContextEntry>,
    pub generation: u32,
}

/// 上下文缓存
///
/// 条目仅当其代数等于全局代数时有效。
pub struct ContextCache {
    generation: u32,
    entries: HashMap<AddressSpaceKey, ContextCacheEntry>,
    hit_count: u64,
    miss_count: u64,
}

impl Default for ContextCache {
    fn default() -> Self {
        Self::new()
    }
}

impl ContextCache {
    pub fn new() -> Self {
        Self {
            generation: 1,
            entries: HashMap::new(),
            hit_count: 0,
            miss_count: 0,
        }
    }

    pub fn generation(&self) -> u32 {
        self.generation
    }

    /// 查找有效的缓存上下文表项
    pub fn lookup(&mut self, key: &AddressSpaceKey) -> Option<ContextEntry> {
        let hit = self
            .entries
            .get(key)
            .filter(|entry| entry.generation == self.generation)
            .and_then(|entry| entry.context_entry);
        if hit.is_some() {
            self.hit_count += 1;
        } else {
            self.miss_count += 1;
        }
        hit
    }

    /// 以当前代数写入上下文表项
    pub fn update(&mut self, key: AddressSpaceKey, ce: ContextEntry) {
        self.entries.insert(
            key,
            ContextCacheEntry {
                context_entry: Some(ce),
                generation: self.generation,
            },
        );
    }

    /// 全局失效：代数加一，回绕前整体复位
    pub fn invalidate_all(&mut self) {
        self.generation += 1;
        if self.generation == CONTEXT_CACHE_GEN_MAX {
            self.reset();
        }
    }

    /// 使单个地址空间的缓存失效
    pub fn invalidate(&mut self, key: &AddressSpaceKey) {
        if let Some(entry) = self.entries.get_mut(key) {
            entry.generation = 0;
        }
    }

    /// 所有条目代数清零，全局代数置1
    pub fn reset(&mut self) {
        for entry in self.entries.values_mut() {
            entry.generation = 0;
        }
        self.generation = 1;
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn hits(&self) -> u64 {
        self.hit_count
    }

    pub fn misses(&self) -> u64 {
        self.miss_count
    }
}
