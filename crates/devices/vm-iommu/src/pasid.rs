// PASID绑定管理
//
// 跟踪guest PASID表项，并在配置了宿主直通路径时把一级页表绑定下发到宿主：
// - 第一轮：对每个已跟踪的PASID重新读取guest表项，不存在则解绑，
//   发生变化则更新，未变化则跳过
// - 第二轮：对直通设备重新遍历PASID目录，发现新出现的表项并绑定
//
// 绑定失败只记录错误，不中断后续条目的处理。

use crate::cache::PasidIotlb;
use crate::context::{ContextResolver, RID2PASID};
use crate::entry::{ContextEntry, PasidGranularType, PasidEntry, PASID_TABLE_ENTRY_NUM};
use crate::error::{IommuError, IommuResult};
use crate::DeviceId;
use log::{debug, error, warn};
use std::collections::BTreeMap;
use std::fmt;

/// PASID缓存同步范围
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PasidSyncScope {
    /// 全局
    Global,
    /// 指定域
    Domain(u16),
    /// 指定域内的单个PASID
    Pasid { domain_id: u16, pasid: u32 },
    /// 单个设备（设备选择性上下文失效触发）
    Device(DeviceId),
    /// 强制清空（复位时使用）
    ForceReset,
}

impl PasidSyncScope {
    fn domain_filter(&self) -> Option<u16> {
        match self {
            PasidSyncScope::Domain(did) | PasidSyncScope::Pasid { domain_id: did, .. } => {
                Some(*did)
            }
            _ => None,
        }
    }
}

impl fmt::Display for PasidSyncScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PasidSyncScope::Global => write!(f, "global"),
            PasidSyncScope::Domain(did) => write!(f, "domain(did={})", did),
            PasidSyncScope::Pasid { domain_id, pasid } => {
                write!(f, "pasid(did={}, pasid={:#x})", domain_id, pasid)
            }
            PasidSyncScope::Device(dev) => write!(f, "device({})", dev),
            PasidSyncScope::ForceReset => write!(f, "force-reset"),
        }
    }
}

/// 宿主绑定操作
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BindingOp {
    Bind,
    Update,
    Unbind,
}

/// 宿主直通绑定路径
///
/// 由平台实现，将guest一级页表挂接到宿主IOMMU。
pub trait HostBindingPath: Send + Sync {
    /// 设备是否经由宿主直通
    fn has_device(&self, dev: DeviceId) -> bool;

    /// 当前所有直通设备
    fn devices(&self) -> Vec<DeviceId>;

    /// 挂接PASID的页表
    ///
    /// # 参数
    /// - `rid_pasid`: 无PASID请求所使用的PASID
    /// - `entry`: guest PASID表项
    fn attach(
        &self,
        dev: DeviceId,
        pasid: u32,
        rid_pasid: u32,
        entry: &PasidEntry,
    ) -> IommuResult<()>;

    /// 解除PASID的挂接
    fn detach(&self, dev: DeviceId, pasid: u32, entry: &PasidEntry) -> IommuResult<()>;

    /// 失效宿主侧一级页表缓存
    ///
    /// # 参数
    /// - `npages`: 页数，`u64::MAX` 表示整个地址空间
    /// - `leaf`: 仅失效叶子项
    fn invalidate(
        &self,
        dev: DeviceId,
        pasid: u32,
        addr: u64,
        npages: u64,
        leaf: bool,
    ) -> IommuResult<()>;
}

/// 批量同步结果
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SyncReport {
    /// 成功下发的绑定操作数
    pub succeeded: usize,
    /// 失败的绑定操作数
    pub failed: usize,
    /// 第一个错误
    pub first_error: Option<IommuError>,
}

impl SyncReport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn has_error(&self) -> bool {
        self.failed > 0
    }

    fn record(&mut self, result: IommuResult<()>) -> bool {
        match result {
            Ok(()) => {
                self.succeeded += 1;
                true
            }
            Err(e) => {
                self.failed += 1;
                if self.first_error.is_none() {
                    self.first_error = Some(e);
                }
                false
            }
        }
    }

    fn merge(&mut self, other: SyncReport) {
        self.succeeded += other.succeeded;
        self.failed += other.failed;
        if self.first_error.is_none() {
            self.first_error = other.first_error;
        }
    }
}

impl fmt::Display for SyncReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PASID同步: 成功 {}, 失败 {}", self.succeeded, self.failed)?;
        if let Some(e) = &self.first_error {
            write!(f, " (首个错误: {})", e)?;
        }
        Ok(())
    }
}

/// 已跟踪的PASID
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TrackedPasid {
    pub device: DeviceId,
    pub pasid: u32,
    /// 最近一次成功同步的guest表项
    pub cached: Option<PasidEntry>,
}

impl TrackedPasid {
    fn new(device: DeviceId, pasid: u32) -> Self {
        Self {
            device,
            pasid,
            cached: None,
        }
    }

    fn domain_id(&self) -> u16 {
        self.cached.map(|pe| pe.domain_id()).unwrap_or(0)
    }
}

fn bindable(pe: &PasidEntry) -> bool {
    match pe.pgtt() {
        PasidGranularType::FirstStage => pe.flpt_base() != 0,
        PasidGranularType::PassThrough => true,
        _ => false,
    }
}

/// 将一次绑定操作下发到宿主
///
/// 设备不经由宿主直通时为空操作。
fn bind_guest_pasid(
    host: Option<&dyn HostBindingPath>,
    tracked: &TrackedPasid,
    op: BindingOp,
    entry: &PasidEntry,
) -> IommuResult<()> {
    let Some(host) = host else {
        return Ok(());
    };
    if !host.has_device(tracked.device) {
        return Ok(());
    }

    debug!(
        "pasid bind: dev={}, pasid={:#x}, op={:?}",
        tracked.device, tracked.pasid, op
    );
    match op {
        BindingOp::Bind | BindingOp::Update => {
            if !bindable(entry) {
                return Err(IommuError::Binding(format!(
                    "unsupported pasid entry type {:?} for {} pasid {:#x}",
                    entry.pgtt(),
                    tracked.device,
                    tracked.pasid
                )));
            }
            host.attach(tracked.device, tracked.pasid, RID2PASID, entry)
        }
        BindingOp::Unbind => match tracked.cached {
            Some(cached) if bindable(&cached) => {
                host.detach(tracked.device, tracked.pasid, &cached)
            }
            _ => Ok(()),
        },
    }
}

/// PASID跟踪表
///
/// 以 (source id, pasid) 为键，与IOMMU其余状态由同一把锁保护。
#[derive(Debug, Default)]
pub struct PasidTracker {
    entries: BTreeMap<(u16, u32), TrackedPasid>,
}

impl PasidTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, dev: DeviceId, pasid: u32) -> Option<&TrackedPasid> {
        self.entries.get(&(dev.sid(), pasid))
    }

    pub fn iter(&self) -> impl Iterator<Item = &TrackedPasid> {
        self.entries.values()
    }

    /// 按范围同步PASID缓存与宿主绑定
    ///
    /// # 参数
    /// - `resolver`: 当前根表上的上下文解析器
    /// - `host`: 宿主直通路径（可选）
    /// - `scope`: 同步范围
    /// - `piotlb`: PASID-IOTLB，非直通设备的过期条目在此删除
    /// - `pasid_limit`: PASID数量上限（`1 << (PSS + 1)`）
    ///
    /// # 返回
    /// 绑定操作的成功/失败统计
    pub fn sync(
        &mut self,
        resolver: &ContextResolver<'_>,
        host: Option<&dyn HostBindingPath>,
        scope: PasidSyncScope,
        piotlb: &mut PasidIotlb,
        pasid_limit: u32,
    ) -> SyncReport {
        debug!("pasid cache sync: scope={}", scope);
        let mut report = self.flush(Some(resolver), host, scope, piotlb);
        if scope != PasidSyncScope::ForceReset {
            report.merge(self.replay(resolver, host, scope, pasid_limit));
        }
        if report.has_error() {
            warn!("{}", report);
        }
        report
    }

    /// 解绑并丢弃全部跟踪条目
    pub fn force_reset(
        &mut self,
        host: Option<&dyn HostBindingPath>,
        piotlb: &mut PasidIotlb,
    ) -> SyncReport {
        self.flush(None, host, PasidSyncScope::ForceReset, piotlb)
    }

    /// 第一轮：检查已跟踪条目
    fn flush(
        &mut self,
        resolver: Option<&ContextResolver<'_>>,
        host: Option<&dyn HostBindingPath>,
        scope: PasidSyncScope,
        piotlb: &mut PasidIotlb,
    ) -> SyncReport {
        let mut report = SyncReport::new();
        let mut removed = Vec::new();

        for (key, tracked) in self.entries.iter_mut() {
            let did = tracked.domain_id();
            let matched = match scope {
                PasidSyncScope::ForceReset => {
                    let result = bind_guest_pasid(host, tracked, BindingOp::Unbind, &PasidEntry::default());
                    report.record(result);
                    removed.push(*key);
                    continue;
                }
                PasidSyncScope::Global => true,
                PasidSyncScope::Domain(domain_id) => did == domain_id,
                PasidSyncScope::Pasid { domain_id, pasid } => {
                    tracked.pasid == pasid && did == domain_id
                }
                PasidSyncScope::Device(dev) => tracked.device == dev,
            };
            if !matched {
                continue;
            }
            let Some(resolver) = resolver else {
                continue;
            };

            if !host.is_some_and(|h| h.has_device(tracked.device)) {
                piotlb.remove_pasid(did, tracked.pasid);
            }

            match resolver.device_pasid_entry(tracked.device, tracked.pasid) {
                Err(reason) => {
                    debug!(
                        "pasid entry gone: dev={}, pasid={:#x}, reason={}",
                        tracked.device, tracked.pasid, reason
                    );
                    let result =
                        bind_guest_pasid(host, tracked, BindingOp::Unbind, &PasidEntry::default());
                    report.record(result);
                    removed.push(*key);
                }
                Ok(pe) => {
                    if !Self::fill(host, tracked, pe, &mut report) {
                        removed.push(*key);
                    }
                }
            }
        }

        for key in removed {
            self.entries.remove(&key);
        }
        report
    }

    /// 按最新表项刷新跟踪条目，失败返回false
    fn fill(
        host: Option<&dyn HostBindingPath>,
        tracked: &mut TrackedPasid,
        pe: PasidEntry,
        report: &mut SyncReport,
    ) -> bool {
        let op = match tracked.cached {
            Some(cached) if cached == pe => return true,
            Some(_) => BindingOp::Update,
            None => BindingOp::Bind,
        };
        let result = bind_guest_pasid(host, tracked, op, &pe);
        if report.record(result) {
            tracked.cached = Some(pe);
            true
        } else {
            error!(
                "pasid {:?} failed: dev={}, pasid={:#x}",
                op, tracked.device, tracked.pasid
            );
            false
        }
    }

    /// 第二轮：为直通设备发现新出现的PASID表项
    fn replay(
        &mut self,
        resolver: &ContextResolver<'_>,
        host: Option<&dyn HostBindingPath>,
        scope: PasidSyncScope,
        pasid_limit: u32,
    ) -> SyncReport {
        let mut report = SyncReport::new();
        let (start, end) = match scope {
            PasidSyncScope::Pasid { pasid, .. } => (pasid, pasid.saturating_add(1)),
            _ => (0, pasid_limit),
        };

        let devices = match scope {
            PasidSyncScope::ForceReset => return report,
            PasidSyncScope::Device(dev) => vec![dev],
            _ => host.map(|h| h.devices()).unwrap_or_default(),
        };
        for dev in devices {
            self.replay_for_device(resolver, host, dev, start, end, scope, &mut report);
        }
        report
    }

    #[allow(clippy::too_many_arguments)]
    fn replay_for_device(
        &mut self,
        resolver: &ContextResolver<'_>,
        host: Option<&dyn HostBindingPath>,
        dev: DeviceId,
        start: u32,
        end: u32,
        scope: PasidSyncScope,
        report: &mut SyncReport,
    ) {
        let sce = match resolver.resolve_context(dev) {
            Ok(ContextEntry::Scalable(sce)) => sce,
            _ => return,
        };
        let dir_base = sce.pasid_dir_base();
        let max_pasid = sce.pdt_entry_num().saturating_mul(PASID_TABLE_ENTRY_NUM);
        let end = end.min(max_pasid);

        let mut pasid = start;
        while pasid < end {
            let next = if end - pasid > PASID_TABLE_ENTRY_NUM {
                pasid + PASID_TABLE_ENTRY_NUM
            } else {
                end
            };
            if let Ok(pdire) = resolver.pasid_dir_entry(dir_base, pasid) {
                if pdire.is_present() {
                    self.walk_table(resolver, host, dev, pdire.table_base(), pasid, next, scope, report);
                }
            }
            pasid = next;
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn walk_table(
        &mut self,
        resolver: &ContextResolver<'_>,
        host: Option<&dyn HostBindingPath>,
        dev: DeviceId,
        table_base: u64,
        start: u32,
        end: u32,
        scope: PasidSyncScope,
        report: &mut SyncReport,
    ) {
        for pasid in start..end {
            let Ok(pe) = resolver.pasid_entry_in_table(table_base, pasid) else {
                continue;
            };
            if !pe.is_present() {
                continue;
            }
            let key = (dev.sid(), pasid);
            let tracked = self
                .entries
                .entry(key)
                .or_insert_with(|| TrackedPasid::new(dev, pasid));
            if let Some(did) = scope.domain_filter() {
                if pe.domain_id() != did {
                    continue;
                }
            }
            if !Self::fill(host, tracked, pe, report) {
                self.entries.remove(&key);
            }
        }
    }

    /// 将PASID-IOTLB失效传播到宿主一级页表绑定
    ///
    /// 仅作用于缓存表项为一级转换、且域与PASID都匹配的条目。
    pub fn flush_host_iotlb(
        &self,
        host: Option<&dyn HostBindingPath>,
        domain_id: u16,
        pasid: u32,
        addr: u64,
        npages: u64,
        leaf: bool,
    ) -> SyncReport {
        let mut report = SyncReport::new();
        let Some(host) = host else {
            return report;
        };
        for tracked in self.entries.values() {
            let Some(pe) = tracked.cached else {
                continue;
            };
            if pe.pgtt() != PasidGranularType::FirstStage
                || pe.domain_id() != domain_id
                || tracked.pasid != pasid
                || !host.has_device(tracked.device)
            {
                continue;
            }
            let result = host.invalidate(tracked.device, pasid, addr, npages, leaf);
            if let Err(e) = &result {
                error!(
                    "host iotlb invalidation failed: dev={}, pasid={:#x}, {}",
                    tracked.device, pasid, e
                );
            }
            report.record(result);
        }
        report
    }
}
