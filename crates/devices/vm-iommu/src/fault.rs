// 故障记录
//
// 实现主故障记录环（primary fault logging）：
// - 固定数量的故障记录槽，循环分配
// - 同一源标识的未处理故障被压缩
// - 下一个槽仍被占用时置溢出位并丢弃
// - 只有从"无挂起故障"进入"有挂起故障"时才产生故障事件中断
//
// 同时维护队列错误（IQE）与失效完成（IWC）状态以及对应的两类事件中断。

use crate::error::FaultReason;
use crate::interrupt::{InterruptController, InterruptType};
use log::{debug, error, warn};
use serde::{Deserialize, Serialize};
use std::fmt;

/// 故障记录
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FaultRecord {
    /// 源标识（bus << 8 | devfn）
    pub source_id: u16,
    /// 故障地址（4K对齐部分有效）
    pub address: u64,
    /// 故障原因
    pub reason: FaultReason,
    /// 是否为写访问
    pub is_write: bool,
    /// 带PASID的请求
    pub pasid: Option<u32>,
}

impl FaultRecord {
    pub fn new(source_id: u16, address: u64, reason: FaultReason, is_write: bool) -> Self {
        Self {
            source_id,
            address,
            reason,
            is_write,
            pasid: None,
        }
    }

    pub fn with_pasid(mut self, pasid: u32) -> Self {
        self.pasid = Some(pasid);
        self
    }
}

impl fmt::Display for FaultRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "sid={:#06x} addr={:#x} {} reason={}",
            self.source_id,
            self.address,
            if self.is_write { "write" } else { "read" },
            self.reason
        )?;
        if let Some(pasid) = self.pasid {
            write!(f, " pasid={:#x}", pasid)?;
        }
        Ok(())
    }
}

/// 故障状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FaultStatus {
    /// 主故障挂起（任一记录槽被占用）
    pub primary_pending: bool,
    /// 主故障溢出
    pub primary_overflow: bool,
    /// 失效队列错误
    pub queue_error: bool,
    /// 最近一次产生中断的故障记录下标
    pub fault_record_index: usize,
    /// 失效等待完成
    pub wait_complete: bool,
}

impl FaultStatus {
    fn has_status(&self) -> bool {
        self.primary_pending || self.primary_overflow || self.queue_error
    }
}

/// 单次故障上报的结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultOutcome {
    /// 写入记录槽
    Recorded { index: usize, interrupt: bool },
    /// 与同一源标识的挂起故障压缩
    Compressed,
    /// 下一个记录槽被占用，置溢出位
    Overflow,
    /// 溢出位已置位，直接丢弃
    Dropped,
    /// 上下文FPD置位，合格故障不记录
    Suppressed,
}

impl FaultOutcome {
    pub fn is_recorded(&self) -> bool {
        matches!(self, FaultOutcome::Recorded { .. })
    }
}

/// 故障记录器
#[derive(Debug)]
pub struct FaultReporter {
    slots: Vec<Option<FaultRecord>>,
    next_index: usize,
    status: FaultStatus,
    interrupts: InterruptController,
    recorded: u64,
    dropped: u64,
}

impl FaultReporter {
    /// 创建故障记录器
    ///
    /// # 参数
    /// - `record_count`: 故障记录槽数量（至少为1）
    pub fn new(record_count: usize) -> Self {
        Self {
            slots: vec![None; record_count.max(1)],
            next_index: 0,
            status: FaultStatus::default(),
            interrupts: InterruptController::new(),
            recorded: 0,
            dropped: 0,
        }
    }

    /// 上报一次转换故障
    ///
    /// # 参数
    /// - `record`: 故障内容
    /// - `fpd`: 上下文（或PASID表项）的故障处理禁止位
    ///
    /// # 返回
    /// 本次故障的处理结果
    pub fn report(&mut self, record: FaultRecord, fpd: bool) -> FaultOutcome {
        if fpd && record.reason.is_qualified() {
            debug!("fault processing disabled for context: {}", record);
            return FaultOutcome::Suppressed;
        }
        error!("dmar fault: {}", record);

        let pre_status = self.status;
        if pre_status.primary_overflow {
            warn!("new fault is not recorded due to primary fault overflow");
            self.dropped += 1;
            return FaultOutcome::Dropped;
        }
        if self.try_collapse(record.source_id) {
            warn!("new fault is not recorded due to compression of faults");
            self.dropped += 1;
            return FaultOutcome::Compressed;
        }
        let index = self.next_index;
        if self.slots[index].is_some() {
            warn!(
                "next fault recording slot {} is used, new fault is not recorded, set overflow",
                index
            );
            self.status.primary_overflow = true;
            self.dropped += 1;
            return FaultOutcome::Overflow;
        }

        self.slots[index] = Some(record);
        self.recorded += 1;
        self.next_index = (index + 1) % self.slots.len();

        let interrupt = if pre_status.primary_pending {
            warn!("there are pending faults already, fault event is not generated");
            self.update_pending();
            false
        } else {
            self.status.fault_record_index = index;
            self.update_pending();
            self.generate_fault_event(pre_status)
        };
        FaultOutcome::Recorded { index, interrupt }
    }

    fn try_collapse(&self, source_id: u16) -> bool {
        self.slots
            .iter()
            .flatten()
            .any(|slot| slot.source_id == source_id)
    }

    fn update_pending(&mut self) {
        self.status.primary_pending = self.slots.iter().any(Option::is_some);
    }

    /// 产生故障事件；返回是否真正发出了中断
    fn generate_fault_event(&mut self, pre_status: FaultStatus) -> bool {
        if pre_status.has_status() {
            warn!("there are previous interrupt conditions to be serviced by software, fault event is not generated");
            return false;
        }
        let masked = self.interrupts.is_masked(InterruptType::FaultEvent);
        self.interrupts.signal(InterruptType::FaultEvent);
        if masked {
            debug!("fault event masked, interrupt is not generated");
        }
        !masked
    }

    /// 置失效队列错误位并尝试产生故障事件
    pub fn raise_queue_error(&mut self) {
        let pre_status = self.status;
        self.status.queue_error = true;
        self.generate_fault_event(pre_status);
    }

    /// 失效等待描述符完成：置IWC并尝试产生完成中断
    pub fn signal_wait_completion(&mut self) {
        if self.status.wait_complete {
            debug!("one completion event pending, skip current");
            return;
        }
        self.status.wait_complete = true;
        self.interrupts.signal(InterruptType::InvalidationCompletion);
    }

    /// 故障状态写（写1清除PFO/IQE）
    pub fn clear_status(&mut self, overflow: bool, queue_error: bool) {
        if overflow {
            self.status.primary_overflow = false;
        }
        if queue_error {
            self.status.queue_error = false;
        }
        if self.interrupts.is_pending(InterruptType::FaultEvent) && !self.status.has_status() {
            debug!("fault status cleared, clear fault event pending");
            self.interrupts.clear_pending(InterruptType::FaultEvent);
        }
    }

    /// 清除记录槽的F位，并重新计算挂起状态
    pub fn clear_record(&mut self, index: usize) -> Option<FaultRecord> {
        let record = self.slots.get_mut(index).and_then(Option::take);
        self.update_pending();
        record
    }

    /// 故障事件控制写（屏蔽位）
    pub fn set_fault_event_masked(&mut self, masked: bool) {
        self.interrupts.set_masked(InterruptType::FaultEvent, masked);
    }

    /// 失效完成状态写（写1清除IWC）
    pub fn clear_wait_completion(&mut self) {
        self.status.wait_complete = false;
        if self.interrupts.is_pending(InterruptType::InvalidationCompletion) {
            self.interrupts.clear_pending(InterruptType::InvalidationCompletion);
        }
    }

    /// 失效事件控制写（屏蔽位）
    pub fn set_completion_event_masked(&mut self, masked: bool) {
        self.interrupts
            .set_masked(InterruptType::InvalidationCompletion, masked);
    }

    pub fn status(&self) -> FaultStatus {
        self.status
    }

    pub fn record(&self, index: usize) -> Option<FaultRecord> {
        self.slots.get(index).copied().flatten()
    }

    /// 当前占用的记录槽
    pub fn records(&self) -> impl Iterator<Item = (usize, &FaultRecord)> {
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(index, slot)| slot.as_ref().map(|record| (index, record)))
    }

    pub fn record_count(&self) -> usize {
        self.slots.len()
    }

    pub fn next_index(&self) -> usize {
        self.next_index
    }

    /// 已记录的故障数
    pub fn recorded(&self) -> u64 {
        self.recorded
    }

    /// 被压缩、溢出或丢弃的故障数
    pub fn dropped(&self) -> u64 {
        self.dropped
    }

    pub fn interrupts(&self) -> &InterruptController {
        &self.interrupts
    }

    pub fn interrupts_mut(&mut self) -> &mut InterruptController {
        &mut self.interrupts
    }

    /// 记录游标归零
    pub fn reset_cursor(&mut self) {
        self.next_index = 0;
    }

    /// 清空全部记录、状态与中断状态
    pub fn reset(&mut self) {
        self.slots.iter_mut().for_each(|slot| *slot = None);
        self.next_index = 0;
        self.status = FaultStatus::default();
        self.interrupts.reset();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reporter(count: usize) -> FaultReporter {
        let mut reporter = FaultReporter::new(count);
        reporter.set_fault_event_masked(false);
        reporter
    }

    fn fault(sid: u16) -> FaultRecord {
        FaultRecord::new(sid, 0x1000, FaultReason::PagingEntryInvalid, false)
    }

    #[test]
    fn test_first_fault_interrupts() {
        let mut reporter = reporter(4);
        let outcome = reporter.report(fault(0x10), false);
        assert_eq!(outcome, FaultOutcome::Recorded { index: 0, interrupt: true });
        assert!(reporter.status().primary_pending);
        assert_eq!(reporter.interrupts_mut().take_pending().len(), 1);
    }

    #[test]
    fn test_compression_same_source() {
        let mut reporter = reporter(4);
        reporter.report(fault(0x10), false);
        assert_eq!(reporter.report(fault(0x10), false), FaultOutcome::Compressed);
        assert_eq!(reporter.records().count(), 1);
        assert_eq!(reporter.interrupts_mut().take_pending().len(), 1);
    }

    #[test]
    fn test_second_source_no_interrupt() {
        let mut reporter = reporter(4);
        reporter.report(fault(0x10), false);
        let outcome = reporter.report(fault(0x11), false);
        assert_eq!(outcome, FaultOutcome::Recorded { index: 1, interrupt: false });
        assert_eq!(reporter.status().fault_record_index, 0);
    }

    #[test]
    fn test_overflow_does_not_overwrite() {
        let mut reporter = reporter(2);
        reporter.report(fault(1), false);
        reporter.report(fault(2), false);
        assert_eq!(reporter.report(fault(3), false), FaultOutcome::Overflow);
        assert!(reporter.status().primary_overflow);
        assert_eq!(reporter.record(0).unwrap().source_id, 1);
        assert_eq!(reporter.record(1).unwrap().source_id, 2);
        assert_eq!(reporter.report(fault(4), false), FaultOutcome::Dropped);
        assert_eq!(reporter.dropped(), 2);
    }

    #[test]
    fn test_fpd_suppresses_qualified_only() {
        let mut reporter = reporter(2);
        let qualified = FaultRecord::new(1, 0, FaultReason::ContextEntryInvalid, false);
        assert_eq!(reporter.report(qualified, true), FaultOutcome::Suppressed);
        let unqualified = FaultRecord::new(1, 0, FaultReason::RootTableInvalid, false);
        assert!(reporter.report(unqualified, true).is_recorded());
    }

    #[test]
    fn test_clear_record_updates_pending() {
        let mut reporter = reporter(2);
        reporter.report(fault(1), false);
        assert!(reporter.clear_record(0).is_some());
        assert!(!reporter.status().primary_pending);
        // 清除后同一源标识可以再次记录，写入下一个槽
        let outcome = reporter.report(fault(1), false);
        assert_eq!(outcome, FaultOutcome::Recorded { index: 1, interrupt: true });
    }

    #[test]
    fn test_masked_fault_event_pending_then_cleared() {
        let mut reporter = FaultReporter::new(1);
        let outcome = reporter.report(fault(1), false);
        assert_eq!(outcome, FaultOutcome::Recorded { index: 0, interrupt: false });
        assert!(reporter.interrupts().is_pending(InterruptType::FaultEvent));

        // 仍有挂起故障时清状态不会清除IP
        reporter.clear_status(false, false);
        assert!(reporter.interrupts().is_pending(InterruptType::FaultEvent));
        reporter.clear_record(0);
        reporter.clear_status(false, false);
        assert!(!reporter.interrupts().is_pending(InterruptType::FaultEvent));
    }

    #[test]
    fn test_queue_error_blocks_fault_event() {
        let mut reporter = reporter(2);
        reporter.raise_queue_error();
        assert!(reporter.status().queue_error);
        assert_eq!(reporter.interrupts_mut().take_pending().len(), 1);

        let outcome = reporter.report(fault(1), false);
        assert_eq!(outcome, FaultOutcome::Recorded { index: 0, interrupt: false });
        reporter.clear_status(false, true);
        assert!(!reporter.status().queue_error);
    }

    #[test]
    fn test_wait_completion() {
        let mut reporter = reporter(1);
        reporter.set_completion_event_masked(false);
        reporter.signal_wait_completion();
        reporter.signal_wait_completion();
        assert!(reporter.status().wait_complete);
        assert_eq!(reporter.interrupts_mut().take_pending().len(), 1);
        reporter.clear_wait_completion();
        reporter.signal_wait_completion();
        assert_eq!(reporter.interrupts_mut().take_pending().len(), 1);
    }

    #[test]
    fn test_reset() {
        let mut reporter = reporter(2);
        reporter.report(fault(1), false);
        reporter.reset();
        assert_eq!(reporter.records().count(), 0);
        assert_eq!(reporter.next_index(), 0);
        assert_eq!(reporter.status(), FaultStatus::default());
        assert!(reporter.interrupts().is_masked(InterruptType::FaultEvent));
    }

    #[test]
    fn test_record_serializes_reason_and_pasid() {
        let mut reporter = reporter(2);
        reporter.report(
            FaultRecord::new(0x10, 0x3000, FaultReason::Write, true).with_pasid(7),
            false,
        );
        let (_, record) = reporter.records().next().unwrap();
        let value = serde_json::to_value(record).unwrap();
        assert_eq!(value["source_id"], 0x10);
        assert_eq!(value["reason"], "Write");
        assert_eq!(value["pasid"], 7);

        let parsed: FaultRecord = serde_json::from_value(value).unwrap();
        assert_eq!(&parsed, record);
    }
}
