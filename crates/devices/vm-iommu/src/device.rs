// IOMMU设备核心实现
//
// 把各组件组装成一个设备对象，包括：
// - 单次DMA访问的地址转换入口
// - 全局命令、上下文命令、IOTLB命令与失效队列尾指针等寄存器触发
// - 设备地址空间管理（转换窗口/直通窗口切换）
// - 映射观察者注册、重放与影子页表同步
// - 复位与恢复
//
// 锁顺序：失效队列锁 → 平台锁 → 设备状态锁；地址空间表锁与区间树锁不与设备状态锁嵌套。
// 中断在释放设备状态锁之后投递；观察者回调期间不持有设备状态锁。

use crate::cache::{ContextCache, Iotlb, PageInvalidation, PasidIotlb};
use crate::config::IommuConfig;
use crate::context::{ContextResolver, TranslationRoot, RID2PASID};
use crate::entry::{ContextEntry, RootTablePointer};
use crate::error::{FaultReason, IommuError, IommuResult};
use crate::fault::{FaultOutcome, FaultRecord, FaultReporter, FaultStatus};
use crate::interrupt::{InterruptLine, InterruptRecord, InterruptType, MsiMessage};
use crate::invalidation::{
    ContextInvalidation, DescriptorHandler, InvalidationDescriptor, InvalidationQueue,
    IotlbInvalidation, PasidCacheInvalidation, QueueState,
};
use crate::memory::GuestMemory;
use crate::pasid::{HostBindingPath, PasidSyncScope, PasidTracker, SyncReport};
use crate::range_walk::{
    unmap_range_events, IovaTree, MappingEvent, MappingObserver, NotifierFlags, RangeWalker,
};
use crate::walker::{PageWalker, ReservedMasks};
use crate::{AddressSpaceKey, DeviceId, IommuPerm, NO_PASID, PAGE_MASK_4K, PAGE_SIZE_4K};
use log::{debug, error, info, warn};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// 上下文命令寄存器请求的失效粒度
pub type ContextCommand = ContextInvalidation;

/// IOTLB命令寄存器请求的失效粒度
pub type IotlbCommand = IotlbInvalidation;

/// 队列地址寄存器中的描述符宽度位
const IQA_DW: u64 = 1 << 11;

/// 全局命令
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GlobalCommand {
    /// 设置根表指针（SRTP）
    SetRootTablePointer { addr: u64, scalable: bool },
    /// 转换使能（TE）
    TranslationEnable(bool),
    /// 队列失效使能（QIE），`iqa` 为队列地址寄存器的值
    QueuedInvalidation { enable: bool, iqa: u64 },
}

/// 单次转换结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TranslationResult {
    /// 页对齐的输入地址
    pub iova: u64,
    /// 页对齐的输出地址
    pub translated_addr: u64,
    /// 页内偏移掩码（页大小 - 1）
    pub addr_mask: u64,
    /// 访问权限
    pub perm: IommuPerm,
}

impl TranslationResult {
    fn identity(addr: u64) -> Self {
        Self {
            iova: addr & PAGE_MASK_4K,
            translated_addr: addr & PAGE_MASK_4K,
            addr_mask: !PAGE_MASK_4K,
            perm: IommuPerm::RW,
        }
    }

    /// 页大小
    pub fn size(&self) -> u64 {
        self.addr_mask.wrapping_add(1)
    }

    /// 计算某个地址的完整输出地址
    pub fn output_address(&self, addr: u64) -> u64 {
        self.translated_addr | (addr & self.addr_mask)
    }
}

/// IOMMU统计信息
#[derive(Debug, Clone, Default, PartialEq)]
pub struct IommuStats {
    /// 总地址转换次数
    pub translations: u64,
    /// IOTLB（含PASID-IOTLB）命中次数
    pub iotlb_hits: u64,
    /// IOTLB（含PASID-IOTLB）未命中次数
    pub iotlb_misses: u64,
    /// 上下文缓存命中次数
    pub context_cache_hits: u64,
    /// 上下文缓存未命中次数
    pub context_cache_misses: u64,
    /// 已记录的故障数
    pub faults_recorded: u64,
    /// 被压缩、溢出或丢弃的故障数
    pub faults_dropped: u64,
    /// 已处理的失效描述符数
    pub descriptors_processed: u64,
    /// 失效队列错误次数
    pub queue_errors: u64,
    /// 转换缓存因容量满整体清空的次数
    pub cache_resets: u64,
}

impl IommuStats {
    /// IOTLB命中率
    pub fn hit_rate(&self) -> f64 {
        let lookups = self.iotlb_hits + self.iotlb_misses;
        if lookups == 0 {
            0.0
        } else {
            self.iotlb_hits as f64 / lookups as f64
        }
    }
}

impl fmt::Display for IommuStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "IOMMU统计信息")?;
        writeln!(f, "  总转换次数: {}", self.translations)?;
        writeln!(f, "  IOTLB命中: {}", self.iotlb_hits)?;
        writeln!(f, "  IOTLB未命中: {}", self.iotlb_misses)?;
        writeln!(f, "  命中率: {:.2}%", self.hit_rate() * 100.0)?;
        writeln!(f, "  上下文缓存命中: {}", self.context_cache_hits)?;
        writeln!(f, "  上下文缓存未命中: {}", self.context_cache_misses)?;
        writeln!(f, "  已记录故障: {}", self.faults_recorded)?;
        writeln!(f, "  丢弃故障: {}", self.faults_dropped)?;
        writeln!(f, "  已处理描述符: {}", self.descriptors_processed)?;
        writeln!(f, "  队列错误: {}", self.queue_errors)?;
        write!(f, "  缓存整体清空: {}", self.cache_resets)
    }
}

/// 可持久化的设备状态
///
/// 寄存器本身由外部保存；这里只包含恢复派生状态所需的字段。
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IommuSnapshot {
    pub root_addr: u64,
    pub root_scalable: bool,
    pub translation_enabled: bool,
    pub queue: QueueState,
}

/// 设备地址空间
///
/// 每个 (bus, devfn, pasid) 一个，首次访问时创建。
pub struct VtdAddressSpace {
    key: AddressSpaceKey,
    iova_tree: Mutex<IovaTree>,
    observers: RwLock<Vec<Arc<dyn MappingObserver>>>,
    translated: AtomicBool,
}

impl VtdAddressSpace {
    fn new(key: AddressSpaceKey) -> Self {
        Self {
            key,
            iova_tree: Mutex::new(IovaTree::new()),
            observers: RwLock::new(Vec::new()),
            translated: AtomicBool::new(false),
        }
    }

    pub fn key(&self) -> AddressSpaceKey {
        self.key
    }

    pub fn device(&self) -> DeviceId {
        self.key.device
    }

    pub fn pasid(&self) -> u32 {
        self.key.pasid
    }

    /// 可扩展模式下实际使用的PASID
    fn effective_pasid(&self) -> u32 {
        if self.key.pasid == NO_PASID {
            RID2PASID
        } else {
            self.key.pasid
        }
    }

    /// 当前是否经过转换窗口（否则为直通窗口）
    pub fn is_translated(&self) -> bool {
        self.translated.load(Ordering::Acquire)
    }

    pub fn has_observers(&self) -> bool {
        !self.observers.read().is_empty()
    }

    /// 所有观察者关心的事件类型之并
    pub fn observer_flags(&self) -> NotifierFlags {
        self.observers
            .read()
            .iter()
            .fold(NotifierFlags::NONE, |acc, o| acc | o.flags())
    }

    pub fn has_map_observer(&self) -> bool {
        self.observer_flags().contains(NotifierFlags::MAP)
    }

    /// 区间树中当前的映射数
    pub fn mapping_count(&self) -> usize {
        self.iova_tree.lock().len()
    }

    fn observers(&self) -> Vec<Arc<dyn MappingObserver>> {
        self.observers.read().clone()
    }

    fn notify(&self, event: &MappingEvent) -> IommuResult<()> {
        for observer in self.observers() {
            if observer.accepts(event) {
                observer.notify(event)?;
            }
        }
        Ok(())
    }
}

impl fmt::Debug for VtdAddressSpace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VtdAddressSpace")
            .field("key", &self.key)
            .field("translated", &self.is_translated())
            .field("observers", &self.observers.read().len())
            .finish()
    }
}

/// 设备锁保护的内部状态
struct IommuState {
    root: RootTablePointer,
    dmar_enabled: bool,
    iotlb: Iotlb,
    piotlb: PasidIotlb,
    context_cache: ContextCache,
    faults: FaultReporter,
    pasids: PasidTracker,
    translations: u64,
    descriptors_processed: u64,
    queue_errors: u64,
}

impl IommuState {
    fn new(config: &IommuConfig) -> Self {
        Self {
            root: RootTablePointer::default(),
            dmar_enabled: false,
            iotlb: Iotlb::new(config.iotlb_capacity),
            piotlb: PasidIotlb::new(config.pasid_iotlb_capacity),
            context_cache: ContextCache::new(),
            faults: FaultReporter::new(config.fault_record_count),
            pasids: PasidTracker::new(),
            translations: 0,
            descriptors_processed: 0,
            queue_errors: 0,
        }
    }

    fn reset_caches(&mut self) {
        self.context_cache.reset();
        self.iotlb.reset();
        self.piotlb.reset();
    }
}

/// 首次加锁阶段的结果
enum Lookup {
    Done(TranslationResult, bool),
    Walk {
        root: RootTablePointer,
        ce: ContextEntry,
        target: TranslationRoot,
        cache_pasid: u32,
    },
}

/// VT-d风格的IOMMU设备
pub struct IntelIommu {
    config: IommuConfig,
    memory: Arc<dyn GuestMemory>,
    interrupt_line: Arc<dyn InterruptLine>,
    host_path: Option<Arc<dyn HostBindingPath>>,
    masks: ReservedMasks,
    platform_lock: Mutex<()>,
    queue: Mutex<InvalidationQueue>,
    state: Mutex<IommuState>,
    address_spaces: Mutex<HashMap<AddressSpaceKey, Arc<VtdAddressSpace>>>,
}

impl IntelIommu {
    /// 创建IOMMU设备
    ///
    /// # 参数
    /// - `config`: 设备配置，创建前会校验
    /// - `memory`: guest内存
    /// - `interrupt_line`: 事件中断线
    ///
    /// # 示例
    /// ```ignore
    /// let iommu = IntelIommu::new(IommuConfig::default(), memory, Arc::new(NullInterruptLine))?;
    /// ```
    pub fn new(
        config: IommuConfig,
        memory: Arc<dyn GuestMemory>,
        interrupt_line: Arc<dyn InterruptLine>,
    ) -> IommuResult<Self> {
        config.validate()?;
        let masks = ReservedMasks::new(config.aw_bits, config.device_iotlb, config.snoop_control);
        info!(
            "creating iommu: aw={}, scalable={:?}, caching_mode={}",
            config.aw_bits, config.scalable_mode, config.caching_mode
        );
        Ok(Self {
            state: Mutex::new(IommuState::new(&config)),
            config,
            memory,
            interrupt_line,
            host_path: None,
            masks,
            platform_lock: Mutex::new(()),
            queue: Mutex::new(InvalidationQueue::new()),
            address_spaces: Mutex::new(HashMap::new()),
        })
    }

    /// 配置宿主直通绑定路径
    pub fn with_host_binding(mut self, host: Arc<dyn HostBindingPath>) -> Self {
        self.host_path = Some(host);
        self
    }

    pub fn config(&self) -> &IommuConfig {
        &self.config
    }

    fn host(&self) -> Option<&dyn HostBindingPath> {
        self.host_path.as_deref()
    }

    fn resolver(&self, root: RootTablePointer) -> ContextResolver<'_> {
        ContextResolver::new(self.memory.as_ref(), &self.config, root)
    }

    /// 持锁执行，释放锁之后投递期间产生的中断
    fn with_state<R>(&self, f: impl FnOnce(&mut IommuState) -> R) -> R {
        let (result, pending) = {
            let mut state = self.state.lock();
            let result = f(&mut state);
            (result, state.faults.interrupts_mut().take_pending())
        };
        self.deliver(pending);
        result
    }

    fn deliver(&self, pending: Vec<InterruptRecord>) {
        for record in pending {
            debug!(
                "raise {:?} interrupt: addr={:#x}, data={:#x}",
                record.interrupt_type, record.message.address, record.message.data
            );
            record.deliver(&self.interrupt_line);
        }
    }

    fn snapshot_root(&self) -> (RootTablePointer, bool) {
        let state = self.state.lock();
        (state.root, state.dmar_enabled)
    }

    // ========================================================================
    // 地址转换
    // ========================================================================

    /// 转换一次设备访问
    ///
    /// # 参数
    /// - `dev`: 发起访问的设备
    /// - `pasid`: 请求携带的PASID，`None` 表示无PASID请求
    /// - `iova`: 输入地址
    /// - `is_write`: 是否为写访问
    ///
    /// # 返回
    /// - `Ok(result)`: 页对齐的转换结果
    /// - `Err(IommuError::Fault)`: 转换故障，已按需记录故障
    /// - `Err(IommuError::NotConfigured)`: 根表项或上下文表项不存在
    pub fn translate(
        &self,
        dev: DeviceId,
        pasid: Option<u32>,
        iova: u64,
        is_write: bool,
    ) -> IommuResult<TranslationResult> {
        let pasid = match pasid {
            Some(pasid) if !self.config.pasid_enabled => {
                return Err(IommuError::InvalidParameter(format!(
                    "pasid {:#x} requested but pasid support is disabled",
                    pasid
                )));
            }
            Some(pasid) => pasid,
            None => NO_PASID,
        };
        let vtd_as = self.find_add_address_space(dev, pasid);
        let (result, pass_through) = self.do_translate(dev, pasid, iova, is_write)?;
        if pass_through && vtd_as.is_translated() {
            self.switch_address_space(&vtd_as);
        }
        Ok(result)
    }

    fn do_translate(
        &self,
        dev: DeviceId,
        pasid: u32,
        iova: u64,
        is_write: bool,
    ) -> IommuResult<(TranslationResult, bool)> {
        let key = AddressSpaceKey::new(dev, pasid);
        let lookup = {
            let mut guard = self.state.lock();
            let state = &mut *guard;
            state.translations += 1;
            if !state.dmar_enabled {
                return Ok((TranslationResult::identity(iova), false));
            }
            let root = state.root;
            let resolver = self.resolver(root);

            let ce = match state.context_cache.lookup(&key) {
                Some(ce) => ce,
                None => match resolver.resolve(dev) {
                    Ok(ce) => {
                        state.context_cache.update(key, ce);
                        ce
                    }
                    Err(failure) => {
                        drop(guard);
                        return Err(self.report_fault(dev, pasid, iova, is_write, failure.reason, failure.fpd));
                    }
                },
            };

            match resolver.translation_root(&ce, pasid) {
                Err(reason) => {
                    let fpd = resolver
                        .fault_processing_disabled(&ce, pasid)
                        .unwrap_or(ce.fpd());
                    drop(guard);
                    return Err(self.report_fault(dev, pasid, iova, is_write, reason, fpd));
                }
                Ok(TranslationRoot::PassThrough { .. }) => {
                    Lookup::Done(TranslationResult::identity(iova), true)
                }
                Ok(target) => {
                    let cache_pasid = if root.scalable && pasid == NO_PASID {
                        RID2PASID
                    } else {
                        pasid
                    };
                    let cached = if target.is_first_stage() {
                        state.piotlb.lookup(dev.sid(), cache_pasid, iova)
                    } else {
                        state.iotlb.lookup(dev.sid(), cache_pasid, iova)
                    };
                    match cached {
                        Some(entry) => {
                            debug!(
                                "iotlb hit: dev={}, iova={:#x}, pte={:#x}",
                                dev, iova, entry.pte
                            );
                            Lookup::Done(
                                TranslationResult {
                                    iova: iova & entry.mask,
                                    translated_addr: self.masks.pte_addr(entry.pte) & entry.mask,
                                    addr_mask: !entry.mask,
                                    perm: entry.perm,
                                },
                                false,
                            )
                        }
                        None => Lookup::Walk {
                            root,
                            ce,
                            target,
                            cache_pasid,
                        },
                    }
                }
            }
        };

        let (root, ce, target, cache_pasid) = match lookup {
            Lookup::Done(result, pass_through) => return Ok((result, pass_through)),
            Lookup::Walk {
                root,
                ce,
                target,
                cache_pasid,
            } => (root, ce, target, cache_pasid),
        };

        // 页表遍历不持有设备锁
        let walker = PageWalker::new(
            self.memory.as_ref(),
            &self.masks,
            self.config.scalable_mode.is_enabled(),
        );
        let walked = match target {
            TranslationRoot::SecondStage {
                base, level, agaw, ..
            } => walker.walk_second_stage(base, level, agaw, iova, is_write),
            TranslationRoot::FirstStage { base, level, .. } => {
                walker.walk_first_stage(base, level, iova, is_write)
            }
            TranslationRoot::PassThrough { .. } => {
                return Ok((TranslationResult::identity(iova), true));
            }
        };
        let walk = match walked {
            Ok(walk) => walk,
            Err(reason) => {
                let fpd = self
                    .resolver(root)
                    .fault_processing_disabled(&ce, pasid)
                    .unwrap_or(ce.fpd());
                return Err(self.report_fault(dev, pasid, iova, is_write, reason, fpd));
            }
        };

        let domain_id = target.domain_id();
        {
            let mut state = self.state.lock();
            if target.is_first_stage() {
                state.piotlb.insert(
                    dev.sid(),
                    cache_pasid,
                    iova,
                    walk.level,
                    domain_id,
                    walk.pte,
                    walk.perm,
                );
            } else {
                state.iotlb.insert(
                    dev.sid(),
                    cache_pasid,
                    iova,
                    walk.level,
                    domain_id,
                    walk.pte,
                    walk.perm,
                );
            }
        }

        let mask = walk.page_mask();
        Ok((
            TranslationResult {
                iova: iova & mask,
                translated_addr: self.masks.pte_addr(walk.pte) & mask,
                addr_mask: !mask,
                perm: walk.perm,
            },
            false,
        ))
    }

    fn report_fault(
        &self,
        dev: DeviceId,
        pasid: u32,
        iova: u64,
        is_write: bool,
        reason: FaultReason,
        fpd: bool,
    ) -> IommuError {
        let mut record = FaultRecord::new(dev.sid(), iova, reason, is_write);
        if pasid != NO_PASID {
            record = record.with_pasid(pasid);
        }
        let outcome = self.with_state(|state| state.faults.report(record, fpd));
        if let FaultOutcome::Recorded { index, interrupt } = outcome {
            debug!("fault recorded at slot {}, interrupt={}", index, interrupt);
        }
        IommuError::from(reason)
    }

    // ========================================================================
    // 寄存器触发
    // ========================================================================

    /// 全局命令寄存器写
    pub fn handle_global_command_write(&self, cmd: GlobalCommand) {
        match cmd {
            GlobalCommand::SetRootTablePointer { addr, scalable } => {
                let scalable = if scalable && !self.config.scalable_mode.is_enabled() {
                    warn!("scalable root table requested but scalable mode is off");
                    false
                } else {
                    scalable
                };
                self.with_state(|state| {
                    state.root = RootTablePointer::new(addr, scalable, self.config.aw_bits);
                });
                info!("root table pointer set: addr={:#x}, scalable={}", addr, scalable);
                self.on_root_table_pointer_changed();
            }
            GlobalCommand::TranslationEnable(enabled) => {
                if !self.config.dma_translation {
                    warn!("dma translation not supported, ignoring TE={}", enabled);
                    return;
                }
                let changed = self.with_state(|state| state.dmar_enabled != enabled);
                if changed {
                    self.on_translation_enabled_changed(enabled);
                }
            }
            GlobalCommand::QueuedInvalidation { enable, iqa } => {
                let mut queue = self.queue.lock();
                if enable {
                    if queue.is_enabled() {
                        return;
                    }
                    queue.set_descriptor_width(
                        self.config.scalable_mode.is_enabled() && iqa & IQA_DW != 0,
                    );
                    if queue.enable(iqa, self.config.aw_bits) {
                        self.drain_queue(&mut queue);
                    }
                } else if queue.is_enabled() {
                    queue.disable();
                }
            }
        }
    }

    /// 根表指针变化：清空缓存并重新同步观察者与宿主绑定
    pub fn on_root_table_pointer_changed(&self) {
        self.with_state(IommuState::reset_caches);
        self.address_space_refresh_all();
        self.refresh_pasid_bind();
    }

    /// 转换使能变化
    pub fn on_translation_enabled_changed(&self, enabled: bool) {
        self.with_state(|state| {
            state.dmar_enabled = enabled;
            if !enabled {
                state.faults.reset_cursor();
            }
            state.reset_caches();
        });
        info!("dma translation {}", if enabled { "enabled" } else { "disabled" });
        self.address_space_refresh_all();
        self.refresh_pasid_bind();
    }

    /// 上下文命令寄存器写
    ///
    /// # 返回
    /// 实际执行的失效粒度；队列失效已使能时忽略请求并返回 `None`
    pub fn handle_context_command_write(&self, cmd: ContextCommand) -> Option<ContextCommand> {
        if self.queue.lock().is_enabled() {
            warn!("queued invalidation enabled, should not use register-based invalidation");
            return None;
        }
        Some(self.context_cache_invalidate(cmd))
    }

    /// IOTLB命令寄存器写
    ///
    /// # 返回
    /// 实际执行的失效粒度；页粒度且 `am` 超过MAMV，或队列失效已使能时返回 `None`
    pub fn handle_iotlb_command_write(&self, cmd: IotlbCommand) -> Option<IotlbCommand> {
        if self.queue.lock().is_enabled() {
            warn!("queued invalidation enabled, should not use register-based invalidation");
            return None;
        }
        if let IotlbInvalidation::Page { am, .. } = cmd {
            if am > crate::MAMV {
                warn!("iotlb page invalidation am {} exceeds MAMV", am);
                return None;
            }
        }
        self.iotlb_invalidate(cmd);
        Some(cmd)
    }

    /// 失效队列尾指针寄存器写
    pub fn handle_invalidation_queue_tail_write(&self, val: u64) {
        let mut queue = self.queue.lock();
        if queue.write_tail(val) {
            self.drain_queue(&mut queue);
        }
    }

    fn drain_queue(&self, queue: &mut InvalidationQueue) {
        if self.with_state(|state| state.faults.status().queue_error) {
            warn!("invalidation queue error pending, descriptors not fetched");
            return;
        }
        let mut dispatcher = QueueDispatcher { iommu: self };
        match queue.drain(self.memory.as_ref(), &mut dispatcher) {
            Ok(processed) => debug!("processed {} invalidation descriptors", processed),
            Err(e) => {
                error!("invalidation queue error: {}", e);
                self.with_state(|state| {
                    state.queue_errors += 1;
                    state.faults.raise_queue_error();
                });
            }
        }
    }

    /// 失效队列头指针寄存器值
    pub fn invalidation_queue_head(&self) -> u64 {
        self.queue.lock().head_register()
    }

    pub fn is_queued_invalidation_enabled(&self) -> bool {
        self.queue.lock().is_enabled()
    }

    // ========================================================================
    // 状态寄存器
    // ========================================================================

    /// 故障状态写（写1清除溢出位/队列错误位）
    pub fn clear_fault_status(&self, overflow: bool, queue_error: bool) {
        self.with_state(|state| state.faults.clear_status(overflow, queue_error));
    }

    /// 清除故障记录的F位
    pub fn clear_fault_record(&self, index: usize) -> Option<FaultRecord> {
        self.with_state(|state| state.faults.clear_record(index))
    }

    /// 故障事件控制写
    pub fn set_fault_event_masked(&self, masked: bool) {
        self.with_state(|state| state.faults.set_fault_event_masked(masked));
    }

    /// 失效完成状态写（写1清除IWC）
    pub fn clear_wait_completion(&self) {
        self.with_state(|state| state.faults.clear_wait_completion());
    }

    /// 失效事件控制写
    pub fn set_completion_event_masked(&self, masked: bool) {
        self.with_state(|state| state.faults.set_completion_event_masked(masked));
    }

    /// 配置事件中断的MSI消息
    pub fn configure_interrupt(&self, interrupt_type: InterruptType, message: MsiMessage) {
        self.with_state(|state| {
            state
                .faults
                .interrupts_mut()
                .configure(interrupt_type, message)
        });
    }

    pub fn fault_status(&self) -> FaultStatus {
        self.state.lock().faults.status()
    }

    pub fn fault_record(&self, index: usize) -> Option<FaultRecord> {
        self.state.lock().faults.record(index)
    }

    /// 当前占用的故障记录
    pub fn fault_records(&self) -> Vec<(usize, FaultRecord)> {
        self.state
            .lock()
            .faults
            .records()
            .map(|(index, record)| (index, *record))
            .collect()
    }

    pub fn is_translation_enabled(&self) -> bool {
        self.state.lock().dmar_enabled
    }

    pub fn root_table_pointer(&self) -> RootTablePointer {
        self.state.lock().root
    }

    pub fn context_cache_generation(&self) -> u32 {
        self.state.lock().context_cache.generation()
    }

    /// IOTLB与PASID-IOTLB的条目数
    pub fn cached_translations(&self) -> (usize, usize) {
        let state = self.state.lock();
        (state.iotlb.len(), state.piotlb.len())
    }

    /// 已跟踪的PASID数
    pub fn tracked_pasids(&self) -> usize {
        self.state.lock().pasids.len()
    }

    /// 获取统计信息
    pub fn get_stats(&self) -> IommuStats {
        let state = self.state.lock();
        let iotlb = state.iotlb.get_stats();
        let piotlb = state.piotlb.get_stats();
        IommuStats {
            translations: state.translations,
            iotlb_hits: iotlb.hits + piotlb.hits,
            iotlb_misses: iotlb.misses + piotlb.misses,
            context_cache_hits: state.context_cache.hits(),
            context_cache_misses: state.context_cache.misses(),
            faults_recorded: state.faults.recorded(),
            faults_dropped: state.faults.dropped(),
            descriptors_processed: state.descriptors_processed,
            queue_errors: state.queue_errors,
            cache_resets: iotlb.full_resets + piotlb.full_resets,
        }
    }

    // ========================================================================
    // 缓存失效
    // ========================================================================

    fn context_cache_invalidate(&self, scope: ContextInvalidation) -> ContextInvalidation {
        match scope {
            ContextInvalidation::Global | ContextInvalidation::Domain(_) => {
                debug!("context cache global invalidation");
                self.with_state(|state| state.context_cache.invalidate_all());
                self.switch_address_space_all();
                self.replay_all();
                self.refresh_pasid_bind();
                ContextInvalidation::Global
            }
            ContextInvalidation::Device { source_id, .. } => {
                debug!("context cache device invalidation: sid={:#x}", source_id);
                for vtd_as in self.address_spaces() {
                    if !scope.covers(vtd_as.device()) {
                        continue;
                    }
                    debug!("invalidating context cache for {}", vtd_as.device());
                    self.with_state(|state| state.context_cache.invalidate(&vtd_as.key()));
                    self.switch_address_space(&vtd_as);
                    // 上下文表项可能已改变，而失效不一定伴随IOTLB失效
                    if let Err(e) = self.address_space_sync(&vtd_as) {
                        warn!("address space sync failed for {}: {}", vtd_as.device(), e);
                    }
                }
                self.pasid_cache_sync(PasidSyncScope::Device(DeviceId::from_sid(source_id)));
                scope
            }
        }
    }

    fn iotlb_invalidate(&self, scope: IotlbInvalidation) {
        match scope {
            IotlbInvalidation::Global => {
                debug!("iotlb global invalidation");
                self.with_state(|state| state.iotlb.reset());
                self.replay_all();
            }
            IotlbInvalidation::Domain(domain_id) => {
                let removed = self.with_state(|state| state.iotlb.remove_domain(domain_id));
                debug!("iotlb domain invalidation: did={}, removed={}", domain_id, removed);
                for vtd_as in self.address_spaces_with_observers() {
                    if self.address_space_domain(&vtd_as) == Some(domain_id) {
                        if let Err(e) = self.address_space_sync(&vtd_as) {
                            warn!("address space sync failed for {}: {}", vtd_as.device(), e);
                        }
                    }
                }
            }
            IotlbInvalidation::Page {
                domain_id,
                addr,
                am,
            } => {
                let inv = PageInvalidation {
                    domain_id,
                    pasid: None,
                    addr,
                    am,
                };
                let removed = self.with_state(|state| state.iotlb.remove_page(&inv));
                debug!(
                    "iotlb page invalidation: did={}, addr={:#x}, am={}, removed={}",
                    domain_id, addr, am, removed
                );
                self.page_invalidate_notify(domain_id, addr, am);
            }
        }
    }

    fn page_invalidate_notify(&self, domain_id: u16, addr: u64, am: u8) {
        let size = PAGE_SIZE_4K << am;
        for vtd_as in self.address_spaces_with_observers() {
            if self.address_space_domain(&vtd_as) != Some(domain_id) {
                continue;
            }
            let result = if vtd_as.has_map_observer() {
                // MAP观察者需要同步影子页表
                self.sync_range(&vtd_as, addr, addr.saturating_add(size), true)
                    .map(|_| ())
            } else {
                vtd_as.notify(&MappingEvent::unmap(addr, size - 1))
            };
            if let Err(e) = result {
                warn!("page invalidation notify failed for {}: {}", vtd_as.device(), e);
            }
        }
    }

    fn piotlb_pasid_invalidate(&self, domain_id: u16, pasid: u32) {
        let host = self.host();
        let (report, removed, root, dmar_enabled) = self.with_state(|state| {
            let report = state
                .pasids
                .flush_host_iotlb(host, domain_id, pasid, 0, u64::MAX, false);
            let removed = state.piotlb.remove_pasid(domain_id, pasid);
            (report, removed, state.root, state.dmar_enabled)
        });
        debug!(
            "piotlb pasid invalidation: did={}, pasid={:#x}, removed={}",
            domain_id, pasid, removed
        );
        if report.has_error() {
            warn!("{}", report);
        }
        if !(root.scalable && dmar_enabled) {
            return;
        }
        for vtd_as in self.address_spaces_with_observers() {
            if vtd_as.effective_pasid() == pasid
                && self.address_space_domain(&vtd_as) == Some(domain_id)
            {
                if let Err(e) = self.address_space_sync(&vtd_as) {
                    warn!("address space sync failed for {}: {}", vtd_as.device(), e);
                }
            }
        }
    }

    fn piotlb_page_invalidate(&self, domain_id: u16, pasid: u32, addr: u64, am: u8, ih: bool) {
        let host = self.host();
        let inv = PageInvalidation {
            domain_id,
            pasid: Some(pasid),
            addr,
            am,
        };
        let report = self.with_state(|state| {
            let report = state
                .pasids
                .flush_host_iotlb(host, domain_id, pasid, addr, 1u64 << am, ih);
            state.piotlb.remove_page(&inv);
            report
        });
        if report.has_error() {
            warn!("{}", report);
        }

        let mask = (PAGE_SIZE_4K << am).wrapping_sub(1);
        for vtd_as in self.address_spaces_with_observers() {
            if vtd_as.effective_pasid() != pasid
                || self.address_space_domain(&vtd_as) != Some(domain_id)
            {
                continue;
            }
            let result = if vtd_as.has_map_observer() {
                // 一级页表的影子同步只需重新遍历失效区间
                self.sync_range(&vtd_as, addr, addr.saturating_add(mask).saturating_add(1), true)
                    .map(|_| ())
            } else {
                vtd_as
                    .notify(&MappingEvent::unmap(addr, mask))
                    .and_then(|_| vtd_as.notify(&MappingEvent::device_iotlb_unmap(addr, mask)))
            };
            if let Err(e) = result {
                warn!("piotlb notify failed for {}: {}", vtd_as.device(), e);
            }
        }
    }

    fn device_iotlb_invalidate(&self, source_id: u16, addr: u64, size: u64) -> IommuResult<()> {
        let key = AddressSpaceKey::new(DeviceId::from_sid(source_id), NO_PASID);
        let Some(vtd_as) = self.address_spaces.lock().get(&key).cloned() else {
            return Ok(());
        };
        debug!(
            "device iotlb invalidation: sid={:#x}, addr={:#x}, size={:#x}",
            source_id, addr, size
        );
        vtd_as.notify(&MappingEvent::device_iotlb_unmap(addr, size.wrapping_sub(1)))
    }

    fn process_wait(&self, status_write: Option<(u64, u32)>, interrupt: bool) -> IommuResult<()> {
        if let Some((addr, data)) = status_write {
            self.memory.write_u32(addr, data).map_err(|_| {
                IommuError::QueueError(format!("fail to perform status write at {:#x}", addr))
            })?;
        }
        if interrupt {
            self.with_state(|state| state.faults.signal_wait_completion());
        }
        Ok(())
    }

    // ========================================================================
    // PASID绑定
    // ========================================================================

    /// 同步PASID缓存与宿主绑定
    ///
    /// 仅在现代可扩展模式、根表为可扩展格式且转换已使能时生效。
    pub fn pasid_cache_sync(&self, scope: PasidSyncScope) -> SyncReport {
        let host = self.host();
        let pasid_limit = self.config.pasid_limit();
        self.with_state(|guard| {
            let state = &mut *guard;
            if !(self.config.scalable_mode.is_modern() && state.root.scalable && state.dmar_enabled)
            {
                return SyncReport::new();
            }
            let resolver = self.resolver(state.root);
            state
                .pasids
                .sync(&resolver, host, scope, &mut state.piotlb, pasid_limit)
        })
    }

    fn refresh_pasid_bind(&self) {
        let report = self.pasid_cache_sync(PasidSyncScope::Global);
        if report.has_error() {
            warn!("pasid bind refresh: {}", report);
        }
    }

    // ========================================================================
    // 地址空间
    // ========================================================================

    /// 查找或创建设备地址空间
    pub fn find_add_address_space(&self, dev: DeviceId, pasid: u32) -> Arc<VtdAddressSpace> {
        let key = AddressSpaceKey::new(dev, pasid);
        let (vtd_as, created) = {
            let mut spaces = self.address_spaces.lock();
            match spaces.get(&key) {
                Some(vtd_as) => (vtd_as.clone(), false),
                None => {
                    let vtd_as = Arc::new(VtdAddressSpace::new(key));
                    spaces.insert(key, vtd_as.clone());
                    (vtd_as, true)
                }
            }
        };
        if created {
            debug!("created address space: dev={}, pasid={:#x}", dev, pasid);
            self.switch_address_space(&vtd_as);
        }
        vtd_as
    }

    pub fn address_space(&self, dev: DeviceId, pasid: u32) -> Option<Arc<VtdAddressSpace>> {
        self.address_spaces
            .lock()
            .get(&AddressSpaceKey::new(dev, pasid))
            .cloned()
    }

    fn address_spaces(&self) -> Vec<Arc<VtdAddressSpace>> {
        let mut spaces: Vec<_> = self.address_spaces.lock().values().cloned().collect();
        spaces.sort_by_key(|vtd_as| vtd_as.key());
        spaces
    }

    fn address_spaces_with_observers(&self) -> Vec<Arc<VtdAddressSpace>> {
        self.address_spaces()
            .into_iter()
            .filter(|vtd_as| vtd_as.has_observers())
            .collect()
    }

    /// 地址空间当前的域标识；上下文无法解析时为 `None`
    fn address_space_domain(&self, vtd_as: &VtdAddressSpace) -> Option<u16> {
        let (root, _) = self.snapshot_root();
        let resolver = self.resolver(root);
        let ce = resolver.resolve(vtd_as.device()).ok()?;
        resolver.domain_id(&ce, vtd_as.pasid()).ok()
    }

    /// 按当前配置切换地址空间的转换窗口/直通窗口
    ///
    /// # 返回
    /// 切换后是否经过转换窗口
    pub fn switch_address_space(&self, vtd_as: &Arc<VtdAddressSpace>) -> bool {
        let (translated, changed) = {
            let _platform = self.platform_lock.lock();
            let (root, dmar_enabled) = self.snapshot_root();
            let pass_through = {
                let resolver = self.resolver(root);
                resolver
                    .resolve(vtd_as.device())
                    .map(|ce| resolver.pass_through_enabled(&ce, vtd_as.pasid()))
                    .unwrap_or(false)
            };
            let translated = dmar_enabled && !pass_through;
            let old = vtd_as.translated.swap(translated, Ordering::AcqRel);
            (translated, old != translated)
        };
        if !changed {
            return translated;
        }
        debug!(
            "switch address space: dev={}, pasid={:#x}, translated={}",
            vtd_as.device(),
            vtd_as.pasid(),
            translated
        );
        if vtd_as.has_observers() {
            let result = if translated {
                self.address_space_sync(vtd_as)
            } else {
                self.unmap_all(vtd_as)
            };
            if let Err(e) = result {
                warn!("observer update failed for {}: {}", vtd_as.device(), e);
            }
        }
        translated
    }

    fn switch_address_space_all(&self) {
        for vtd_as in self.address_spaces() {
            self.switch_address_space(&vtd_as);
        }
    }

    fn address_space_refresh_all(&self) {
        for vtd_as in self.address_spaces_with_observers() {
            if let Err(e) = self.unmap_all(&vtd_as) {
                warn!("unmap all failed for {}: {}", vtd_as.device(), e);
            }
        }
        self.switch_address_space_all();
    }

    fn replay_all(&self) {
        for vtd_as in self.address_spaces_with_observers() {
            if let Err(e) = self.address_space_sync(&vtd_as) {
                warn!("address space sync failed for {}: {}", vtd_as.device(), e);
            }
        }
    }

    // ========================================================================
    // 映射观察者
    // ========================================================================

    /// 注册映射观察者并重放当前映射
    ///
    /// # 返回
    /// - `Err(IommuError::ObserverRejected)`: 当前配置不支持该类观察者
    pub fn register_observer(
        &self,
        dev: DeviceId,
        pasid: u32,
        observer: Arc<dyn MappingObserver>,
    ) -> IommuResult<()> {
        let flags = observer.flags();
        if self.config.snoop_control {
            return Err(IommuError::ObserverRejected(
                "snoop control is not compatible with mapping observers".to_string(),
            ));
        }
        if flags.contains(NotifierFlags::MAP) && !self.config.caching_mode {
            return Err(IommuError::ObserverRejected(format!(
                "device {} requires caching mode for MAP observers",
                dev
            )));
        }
        if flags.contains(NotifierFlags::DEVIOTLB_UNMAP) && !self.config.device_iotlb {
            return Err(IommuError::ObserverRejected(format!(
                "device {} requires device IOTLB support",
                dev
            )));
        }

        let vtd_as = self.find_add_address_space(dev, pasid);
        vtd_as.observers.write().push(observer);
        info!("registered mapping observer: dev={}, pasid={:#x}, flags={:?}", dev, pasid, flags);
        self.replay(&vtd_as)
    }

    /// 注销映射观察者
    pub fn unregister_observer(
        &self,
        dev: DeviceId,
        pasid: u32,
        observer: &Arc<dyn MappingObserver>,
    ) -> bool {
        let Some(vtd_as) = self.address_space(dev, pasid) else {
            return false;
        };
        let mut observers = vtd_as.observers.write();
        let before = observers.len();
        observers.retain(|o| !Arc::ptr_eq(o, observer));
        let removed = observers.len() != before;
        if observers.is_empty() {
            vtd_as.iova_tree.lock().clear();
        }
        removed
    }

    /// 重放：先撤销全部映射，再按当前页表通知MAP
    pub fn replay(&self, vtd_as: &Arc<VtdAddressSpace>) -> IommuResult<()> {
        self.unmap_all(vtd_as)?;
        if !vtd_as.is_translated() || !vtd_as.has_map_observer() {
            return Ok(());
        }
        self.sync_range(vtd_as, 0, u64::MAX, false).map(|_| ())
    }

    /// 全量同步影子页表
    pub fn address_space_sync(&self, vtd_as: &Arc<VtdAddressSpace>) -> IommuResult<()> {
        if !vtd_as.has_observers() {
            return Ok(());
        }
        self.sync_range(vtd_as, 0, u64::MAX, true).map(|_| ())
    }

    /// 按观察者区间撤销全部映射并清空区间树
    pub fn unmap_all(&self, vtd_as: &Arc<VtdAddressSpace>) -> IommuResult<()> {
        let aw_bits = self.config.aw_bits;
        for observer in vtd_as.observers() {
            let (start, end) = observer.range();
            for event in unmap_range_events(start, end, aw_bits) {
                if observer.accepts(&event) {
                    observer.notify(&event)?;
                }
            }
        }
        vtd_as.iova_tree.lock().clear();
        Ok(())
    }

    /// 遍历 `[start, end)` 并向观察者通知变化
    ///
    /// # 返回
    /// 本次产生的事件
    pub fn walk_range(
        &self,
        dev: DeviceId,
        pasid: u32,
        start: u64,
        end: u64,
        notify_unmap: bool,
    ) -> IommuResult<Vec<MappingEvent>> {
        let vtd_as = self.find_add_address_space(dev, pasid);
        self.sync_range(&vtd_as, start, end, notify_unmap)
    }

    fn sync_range(
        &self,
        vtd_as: &Arc<VtdAddressSpace>,
        start: u64,
        end: u64,
        notify_unmap: bool,
    ) -> IommuResult<Vec<MappingEvent>> {
        let (root, dmar_enabled) = self.snapshot_root();
        let mut events = Vec::new();
        if !dmar_enabled {
            return Ok(events);
        }
        let resolver = self.resolver(root);
        let ce = match resolver.resolve(vtd_as.device()) {
            Ok(ce) => ce,
            Err(failure) if failure.reason.is_benign_absence() => {
                // 上下文不存在：撤销全部映射
                debug!("context not present for {}, unmap all", vtd_as.device());
                self.unmap_all(vtd_as)?;
                return Ok(events);
            }
            Err(failure) => return Err(IommuError::Fault(failure.reason)),
        };

        let (base, level, agaw, domain_id, first_stage) =
            match resolver.translation_root(&ce, vtd_as.pasid())? {
                TranslationRoot::SecondStage {
                    base,
                    level,
                    agaw,
                    domain_id,
                } => (base, level, agaw, domain_id, false),
                TranslationRoot::FirstStage {
                    base,
                    level,
                    agaw,
                    domain_id,
                } => (base, level, agaw, domain_id, true),
                TranslationRoot::PassThrough { .. } => {
                    debug!("range walk skipped for pass-through {}", vtd_as.device());
                    return Ok(events);
                }
            };

        let observers = vtd_as.observers();
        let mut tree = vtd_as.iova_tree.lock();
        let mut walker = RangeWalker::new(
            self.memory.as_ref(),
            &self.masks,
            &mut tree,
            notify_unmap,
            domain_id,
        );
        if first_stage {
            walker = walker.first_stage();
        }
        walker.walk(base, level, agaw, start, end, &mut |event: &MappingEvent| -> IommuResult<()> {
            events.push(*event);
            for observer in &observers {
                if observer.accepts(event) {
                    observer.notify(event)?;
                }
            }
            Ok(())
        })?;
        Ok(events)
    }

    // ========================================================================
    // 复位与恢复
    // ========================================================================

    /// 复位：清空全部缓存、绑定、故障与队列状态
    pub fn reset(&self) {
        self.queue.lock().reset();
        let host = self.host();
        let report = self.with_state(|guard| {
            let state = &mut *guard;
            state.root = RootTablePointer::default();
            state.dmar_enabled = false;
            state.reset_caches();
            state.faults.reset();
            state.pasids.force_reset(host, &mut state.piotlb)
        });
        if report.has_error() {
            warn!("pasid reset: {}", report);
        }
        self.address_space_refresh_all();
        info!("iommu reset");
    }

    /// 保存恢复派生状态所需的字段
    pub fn snapshot(&self) -> IommuSnapshot {
        let queue = self.queue.lock().save();
        let state = self.state.lock();
        IommuSnapshot {
            root_addr: state.root.addr,
            root_scalable: state.root.scalable,
            translation_enabled: state.dmar_enabled,
            queue,
        }
    }

    /// 批量恢复寄存器后重建派生状态
    pub fn post_load(&self, snapshot: &IommuSnapshot) {
        let mut queue = snapshot.queue;
        queue.dw &= self.config.scalable_mode.is_enabled();
        self.queue.lock().restore(&queue);
        let scalable = snapshot.root_scalable && self.config.scalable_mode.is_enabled();
        self.with_state(|state| {
            state.root = RootTablePointer::new(snapshot.root_addr, scalable, self.config.aw_bits);
            state.dmar_enabled = snapshot.translation_enabled && self.config.dma_translation;
            state.reset_caches();
        });
        info!("iommu state restored: root={:#x}, scalable={}", snapshot.root_addr, scalable);
        self.address_space_refresh_all();
        self.refresh_pasid_bind();
    }
}

/// 将队列中的描述符分发到设备
struct QueueDispatcher<'a> {
    iommu: &'a IntelIommu,
}

impl DescriptorHandler for QueueDispatcher<'_> {
    fn handle(&mut self, desc: &InvalidationDescriptor) -> IommuResult<()> {
        let iommu = self.iommu;
        let scalable = iommu.config.scalable_mode.is_enabled();
        match *desc {
            InvalidationDescriptor::Wait {
                status_write,
                interrupt,
                ..
            } => iommu.process_wait(status_write, interrupt)?,
            InvalidationDescriptor::ContextCache(scope) => {
                iommu.context_cache_invalidate(scope);
            }
            InvalidationDescriptor::Iotlb(scope) => iommu.iotlb_invalidate(scope),
            InvalidationDescriptor::PasidCache(scope) => {
                if !scalable {
                    return Err(IommuError::QueueError(
                        "pasid cache descriptor without scalable mode".to_string(),
                    ));
                }
                let scope = match scope {
                    PasidCacheInvalidation::Global => PasidSyncScope::Global,
                    PasidCacheInvalidation::Domain(did) => PasidSyncScope::Domain(did),
                    PasidCacheInvalidation::Pasid { domain_id, pasid } => {
                        PasidSyncScope::Pasid { domain_id, pasid }
                    }
                };
                let report = iommu.pasid_cache_sync(scope);
                if report.has_error() {
                    warn!("pasid cache invalidation: {}", report);
                }
            }
            InvalidationDescriptor::PasidIotlb {
                domain_id,
                pasid,
                page,
            } => {
                if !scalable {
                    return Err(IommuError::QueueError(
                        "pasid iotlb descriptor without scalable mode".to_string(),
                    ));
                }
                match page {
                    None => iommu.piotlb_pasid_invalidate(domain_id, pasid),
                    Some((addr, am, ih)) => {
                        iommu.piotlb_page_invalidate(domain_id, pasid, addr, am, ih)
                    }
                }
            }
            InvalidationDescriptor::InterruptEntryCache {
                global,
                index,
                index_mask,
            } => {
                debug!(
                    "interrupt entry cache invalidation: global={}, index={:#x}, mask={}",
                    global, index, index_mask
                );
            }
            InvalidationDescriptor::DeviceIotlb {
                source_id,
                addr,
                size,
            } => iommu.device_iotlb_invalidate(source_id, addr, size)?,
            InvalidationDescriptor::DevicePasidIotlb => {
                debug!("device pasid iotlb invalidation ignored");
            }
        }
        iommu.with_state(|state| state.descriptors_processed += 1);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ScalableMode;
    use crate::entry::{LegacyContextEntry, RootEntry, TranslationType};
    use crate::interrupt::NullInterruptLine;
    use crate::memory::SparseMemory;
    use crate::walker::{SL_R, SL_W};

    const ROOT: u64 = 0x1000;
    const CTX: u64 = 0x2000;
    const SLPT: u64 = 0x10000;
    const IQ: u64 = 0x80000;

    #[derive(Default)]
    struct RecordingLine {
        edges: Mutex<Vec<InterruptType>>,
    }

    impl InterruptLine for RecordingLine {
        fn raise_edge(&self, interrupt_type: InterruptType, _message: &MsiMessage) {
            self.edges.lock().push(interrupt_type);
        }
    }

    struct RecordingObserver {
        flags: NotifierFlags,
        events: Mutex<Vec<MappingEvent>>,
    }

    impl RecordingObserver {
        fn new(flags: NotifierFlags) -> Arc<Self> {
            Arc::new(Self {
                flags,
                events: Mutex::new(Vec::new()),
            })
        }

        fn take(&self) -> Vec<MappingEvent> {
            std::mem::take(&mut *self.events.lock())
        }
    }

    impl MappingObserver for RecordingObserver {
        fn flags(&self) -> NotifierFlags {
            self.flags
        }

        fn notify(&self, event: &MappingEvent) -> IommuResult<()> {
            self.events.lock().push(*event);
            Ok(())
        }
    }

    /// 3级页表：iova 0x1000 → 0x2000 RW
    fn build_legacy_tables(mem: &SparseMemory, devfn: u8, did: u16) {
        let re = RootEntry::legacy(CTX);
        mem.write_u64(ROOT, re.lo).unwrap();
        mem.write_u64(ROOT + 8, re.hi).unwrap();
        let ce = LegacyContextEntry::new(SLPT, 1, did, TranslationType::MultiLevel);
        mem.write_u64(CTX + devfn as u64 * 16, ce.lo).unwrap();
        mem.write_u64(CTX + devfn as u64 * 16 + 8, ce.hi).unwrap();
        mem.write_u64(SLPT, (SLPT + 0x1000) | SL_R | SL_W).unwrap();
        mem.write_u64(SLPT + 0x1000, (SLPT + 0x2000) | SL_R | SL_W).unwrap();
        mem.write_u64(SLPT + 0x2000 + 8, 0x2000 | SL_R | SL_W).unwrap();
    }

    fn setup(config: IommuConfig) -> (Arc<SparseMemory>, IntelIommu, Arc<RecordingLine>) {
        let mem = Arc::new(SparseMemory::new(1 << 32));
        let line = Arc::new(RecordingLine::default());
        let iommu = IntelIommu::new(config, mem.clone(), line.clone()).unwrap();
        (mem, iommu, line)
    }

    fn enable(iommu: &IntelIommu) {
        iommu.handle_global_command_write(GlobalCommand::SetRootTablePointer {
            addr: ROOT,
            scalable: false,
        });
        iommu.handle_global_command_write(GlobalCommand::TranslationEnable(true));
    }

    #[test]
    fn test_identity_when_disabled() {
        let (_mem, iommu, _line) = setup(IommuConfig::default());
        let result = iommu
            .translate(DeviceId::new(0, 8), None, 0x1234_5678, true)
            .unwrap();
        assert_eq!(result.translated_addr, 0x1234_5000);
        assert_eq!(result.perm, IommuPerm::RW);
        assert_eq!(result.size(), PAGE_SIZE_4K);
    }

    #[test]
    fn test_translate_and_cache() {
        let (mem, iommu, _line) = setup(IommuConfig::default());
        build_legacy_tables(&mem, 8, 3);
        enable(&iommu);
        let dev = DeviceId::new(0, 8);

        let result = iommu.translate(dev, None, 0x1abc, true).unwrap();
        assert_eq!(result.iova, 0x1000);
        assert_eq!(result.translated_addr, 0x2000);
        assert_eq!(result.output_address(0x1abc), 0x2abc);
        assert_eq!(iommu.cached_translations(), (1, 0));

        let again = iommu.translate(dev, None, 0x1000, false).unwrap();
        assert_eq!(again, result);
        let stats = iommu.get_stats();
        assert_eq!(stats.iotlb_hits, 1);
        assert_eq!(stats.context_cache_hits, 1);
    }

    #[test]
    fn test_pasid_rejected_without_support() {
        let (_mem, iommu, _line) = setup(IommuConfig::default());
        let err = iommu
            .translate(DeviceId::new(0, 8), Some(1), 0x1000, false)
            .unwrap_err();
        assert!(matches!(err, IommuError::InvalidParameter(_)));
    }

    #[test]
    fn test_unmapped_iova_faults() {
        let (mem, iommu, line) = setup(IommuConfig::default());
        build_legacy_tables(&mem, 8, 3);
        enable(&iommu);
        iommu.set_fault_event_masked(false);

        let err = iommu
            .translate(DeviceId::new(0, 8), None, 0x5000, false)
            .unwrap_err();
        assert_eq!(err, IommuError::Fault(FaultReason::PagingEntryInvalid));
        assert!(iommu.fault_status().primary_pending);
        assert_eq!(line.edges.lock().as_slice(), &[InterruptType::FaultEvent]);
        let records = iommu.fault_records();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].1.address, 0x5000);
    }

    #[test]
    fn test_missing_context_is_not_configured() {
        let (mem, iommu, _line) = setup(IommuConfig::default());
        build_legacy_tables(&mem, 8, 3);
        enable(&iommu);
        let err = iommu
            .translate(DeviceId::new(0, 9), None, 0x1000, false)
            .unwrap_err();
        assert!(err.is_not_configured());
    }

    #[test]
    fn test_register_domain_invalidation() {
        let (mem, iommu, _line) = setup(IommuConfig::default());
        build_legacy_tables(&mem, 8, 3);
        enable(&iommu);
        let dev = DeviceId::new(0, 8);
        iommu.translate(dev, None, 0x1000, false).unwrap();

        // 修改页表后，未失效前仍命中旧条目
        mem.write_u64(SLPT + 0x2000 + 8, 0x7000 | SL_R | SL_W).unwrap();
        assert_eq!(iommu.translate(dev, None, 0x1000, false).unwrap().translated_addr, 0x2000);

        assert_eq!(
            iommu.handle_iotlb_command_write(IotlbInvalidation::Domain(4)),
            Some(IotlbInvalidation::Domain(4))
        );
        assert_eq!(iommu.cached_translations().0, 1);
        iommu.handle_iotlb_command_write(IotlbInvalidation::Domain(3));
        assert_eq!(iommu.cached_translations().0, 0);
        assert_eq!(iommu.translate(dev, None, 0x1000, false).unwrap().translated_addr, 0x7000);
    }

    #[test]
    fn test_page_invalidation_rejects_large_am() {
        let (_mem, iommu, _line) = setup(IommuConfig::default());
        let cmd = IotlbInvalidation::Page {
            domain_id: 1,
            addr: 0,
            am: crate::MAMV + 1,
        };
        assert_eq!(iommu.handle_iotlb_command_write(cmd), None);
    }

    #[test]
    fn test_context_command_granularity() {
        let (_mem, iommu, _line) = setup(IommuConfig::default());
        let generation = iommu.context_cache_generation();
        assert_eq!(
            iommu.handle_context_command_write(ContextInvalidation::Domain(2)),
            Some(ContextInvalidation::Global)
        );
        assert_eq!(iommu.context_cache_generation(), generation + 1);
    }

    #[test]
    fn test_pass_through_switches_window() {
        let (mem, iommu, _line) = setup(IommuConfig::default());
        let re = RootEntry::legacy(CTX);
        mem.write_u64(ROOT, re.lo).unwrap();
        mem.write_u64(ROOT + 8, re.hi).unwrap();
        let ce = LegacyContextEntry::new(0, 1, 1, TranslationType::PassThrough);
        mem.write_u64(CTX + 0x10 * 16, ce.lo).unwrap();
        mem.write_u64(CTX + 0x10 * 16 + 8, ce.hi).unwrap();
        enable(&iommu);

        let dev = DeviceId::new(0, 0x10);
        let result = iommu.translate(dev, None, 0x8000_1234, true).unwrap();
        assert_eq!(result.translated_addr, 0x8000_1000);
        assert_eq!(iommu.cached_translations(), (0, 0));
        assert!(!iommu.address_space(dev, NO_PASID).unwrap().is_translated());
    }

    #[test]
    fn test_queue_wait_descriptor() {
        let (mem, iommu, line) = setup(IommuConfig::default());
        iommu.set_completion_event_masked(false);
        iommu.handle_global_command_write(GlobalCommand::QueuedInvalidation {
            enable: true,
            iqa: IQ,
        });
        // 等待描述符：SW + IF，状态数据0x55写入0x90000
        mem.write_u64(IQ, 0x5 | (1 << 4) | (1 << 5) | (0x55 << 32)).unwrap();
        mem.write_u64(IQ + 8, 0x90000).unwrap();
        iommu.handle_invalidation_queue_tail_write(1 << 4);

        assert_eq!(mem.read_u64(0x90000).unwrap() & 0xffff_ffff, 0x55);
        assert!(iommu.fault_status().wait_complete);
        assert_eq!(line.edges.lock().as_slice(), &[InterruptType::InvalidationCompletion]);
        assert_eq!(iommu.invalidation_queue_head(), 1 << 4);
        assert!(iommu.handle_iotlb_command_write(IotlbInvalidation::Global).is_none());

        iommu.handle_global_command_write(GlobalCommand::QueuedInvalidation {
            enable: false,
            iqa: IQ,
        });
        assert!(!iommu.is_queued_invalidation_enabled());
    }

    #[test]
    fn test_queue_error_blocks_processing() {
        let (mem, iommu, _line) = setup(IommuConfig::default());
        iommu.handle_global_command_write(GlobalCommand::QueuedInvalidation {
            enable: true,
            iqa: IQ,
        });
        mem.write_u64(IQ, 0xf).unwrap();
        iommu.handle_invalidation_queue_tail_write(1 << 4);
        assert!(iommu.fault_status().queue_error);
        assert_eq!(iommu.invalidation_queue_head(), 0);
        assert_eq!(iommu.get_stats().queue_errors, 1);

        // 队列错误未清除前不再取描述符
        mem.write_u64(IQ, 0x5 | (1 << 6)).unwrap();
        iommu.handle_invalidation_queue_tail_write(1 << 4);
        assert_eq!(iommu.invalidation_queue_head(), 0);

        iommu.clear_fault_status(false, true);
        iommu.handle_invalidation_queue_tail_write(1 << 4);
        assert_eq!(iommu.invalidation_queue_head(), 1 << 4);
    }

    #[test]
    fn test_observer_registration_rules() {
        let (_mem, iommu, _line) = setup(IommuConfig::default());
        let dev = DeviceId::new(0, 8);
        let map = RecordingObserver::new(NotifierFlags::IOTLB_EVENTS);
        assert!(matches!(
            iommu.register_observer(dev, NO_PASID, map),
            Err(IommuError::ObserverRejected(_))
        ));
        let devtlb = RecordingObserver::new(NotifierFlags::DEVIOTLB_UNMAP);
        assert!(iommu.register_observer(dev, NO_PASID, devtlb).is_err());
        let unmap = RecordingObserver::new(NotifierFlags::UNMAP);
        assert!(iommu.register_observer(dev, NO_PASID, unmap).is_ok());

        let (_mem, snoop, _line) = setup(IommuConfig::default().with_snoop_control(true));
        let unmap = RecordingObserver::new(NotifierFlags::UNMAP);
        assert!(snoop.register_observer(dev, NO_PASID, unmap).is_err());
    }

    #[test]
    fn test_observer_replay_and_page_invalidation() {
        let (mem, iommu, _line) = setup(IommuConfig::default().with_caching_mode(true));
        build_legacy_tables(&mem, 8, 3);
        enable(&iommu);
        let dev = DeviceId::new(0, 8);
        let observer = RecordingObserver::new(NotifierFlags::IOTLB_EVENTS);
        iommu.register_observer(dev, NO_PASID, observer.clone()).unwrap();

        let maps: Vec<_> = observer.take().into_iter().filter(|e| e.is_map()).collect();
        assert_eq!(maps, vec![MappingEvent::map(0x1000, 0xfff, 0x2000, IommuPerm::RW)]);

        // 清除叶子后做页失效，观察者收到UNMAP
        mem.write_u64(SLPT + 0x2000 + 8, 0).unwrap();
        iommu.handle_iotlb_command_write(IotlbInvalidation::Page {
            domain_id: 3,
            addr: 0x1000,
            am: 0,
        });
        assert_eq!(observer.take(), vec![MappingEvent::unmap(0x1000, 0xfff)]);
        assert_eq!(iommu.address_space(dev, NO_PASID).unwrap().mapping_count(), 0);
    }

    #[test]
    fn test_translation_disable_unmaps_observers() {
        let (mem, iommu, _line) = setup(IommuConfig::default().with_caching_mode(true));
        build_legacy_tables(&mem, 8, 3);
        enable(&iommu);
        let dev = DeviceId::new(0, 8);
        let observer = RecordingObserver::new(NotifierFlags::IOTLB_EVENTS);
        iommu.register_observer(dev, NO_PASID, observer.clone()).unwrap();
        observer.take();

        iommu.handle_global_command_write(GlobalCommand::TranslationEnable(false));
        let events = observer.take();
        assert!(!events.is_empty());
        assert!(events.iter().all(|e| !e.is_map()));
        assert!(!iommu.address_space(dev, NO_PASID).unwrap().is_translated());
        assert_eq!(iommu.cached_translations(), (0, 0));
    }

    #[test]
    fn test_reset_and_restore() {
        let (mem, iommu, _line) = setup(IommuConfig::default());
        build_legacy_tables(&mem, 8, 3);
        enable(&iommu);
        let dev = DeviceId::new(0, 8);
        iommu.translate(dev, None, 0x1000, false).unwrap();
        let snapshot = iommu.snapshot();
        assert!(snapshot.translation_enabled);

        iommu.reset();
        assert!(!iommu.is_translation_enabled());
        assert_eq!(iommu.cached_translations(), (0, 0));
        assert!(!iommu.address_space(dev, NO_PASID).unwrap().is_translated());

        let json = serde_json::to_string(&snapshot).unwrap();
        let restored: IommuSnapshot = serde_json::from_str(&json).unwrap();
        iommu.post_load(&restored);
        assert!(iommu.is_translation_enabled());
        assert!(iommu.address_space(dev, NO_PASID).unwrap().is_translated());
        assert_eq!(iommu.translate(dev, None, 0x1000, false).unwrap().translated_addr, 0x2000);
    }

    #[test]
    fn test_scalable_root_requires_scalable_mode() {
        let (_mem, iommu, _line) = setup(IommuConfig::default());
        iommu.handle_global_command_write(GlobalCommand::SetRootTablePointer {
            addr: ROOT,
            scalable: true,
        });
        assert!(!iommu.root_table_pointer().scalable);

        let config = IommuConfig::default()
            .with_aw_bits(48)
            .with_scalable_mode(ScalableMode::Modern);
        let (_mem, iommu, _line) = setup(config);
        iommu.handle_global_command_write(GlobalCommand::SetRootTablePointer {
            addr: ROOT,
            scalable: true,
        });
        assert!(iommu.root_table_pointer().scalable);
    }

    #[test]
    fn test_stats_display() {
        let (_mem, iommu, _line) = setup(IommuConfig::default());
        iommu.translate(DeviceId::new(0, 8), None, 0, false).unwrap();
        let text = iommu.get_stats().to_string();
        assert!(text.contains("总转换次数: 1"));
    }
}
