// 中断管理（Interrupt Management）实现
//
// 实现VT-d的两类事件中断：
// - 故障事件中断（fault event）
// - 失效完成中断（invalidation completion event）
//
// 每类中断有屏蔽位（IM）与挂起位（IP）。屏蔽期间产生的事件只置挂起位，
// 解除屏蔽时若仍挂起则补发。待发送的中断先进入发件队列，由设备在
// 释放内部锁之后投递到中断线。

use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;

/// 中断类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum InterruptType {
    /// 故障事件中断
    FaultEvent = 0,
    /// 失效完成中断
    InvalidationCompletion = 1,
}

/// MSI消息
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MsiMessage {
    /// 目标地址
    pub address: u64,
    /// 数据字段
    pub data: u32,
}

impl MsiMessage {
    /// 创建新的MSI消息
    pub fn new(address: u64, data: u32) -> Self {
        Self { address, data }
    }
}

/// 中断线
///
/// 由平台实现，负责把边沿触发的MSI送达中断控制器。
pub trait InterruptLine: Send + Sync {
    fn raise_edge(&self, interrupt_type: InterruptType, message: &MsiMessage);
}

/// 丢弃所有中断的中断线
#[derive(Debug, Default, Clone, Copy)]
pub struct NullInterruptLine;

impl InterruptLine for NullInterruptLine {
    fn raise_edge(&self, _interrupt_type: InterruptType, _message: &MsiMessage) {}
}

/// 待投递的中断
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InterruptRecord {
    /// 中断类型
    pub interrupt_type: InterruptType,
    /// 生成时的MSI消息
    pub message: MsiMessage,
    /// 序号
    pub sequence: u64,
}

impl InterruptRecord {
    /// 投递到中断线
    pub fn deliver(&self, line: &Arc<dyn InterruptLine>) {
        line.raise_edge(self.interrupt_type, &self.message);
    }
}

/// 中断统计
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InterruptStats {
    /// 总中断次数
    pub total_interrupts: u64,
    /// 故障事件中断次数
    pub fault_event_count: u64,
    /// 失效完成中断次数
    pub completion_count: u64,
    /// 因屏蔽而挂起的次数
    pub masked_count: u64,
}

impl InterruptStats {
    pub fn new() -> Self {
        Self::default()
    }
}

impl fmt::Display for InterruptStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "中断统计信息")?;
        writeln!(f, "  总中断次数: {}", self.total_interrupts)?;
        writeln!(f, "  故障事件次数: {}", self.fault_event_count)?;
        writeln!(f, "  失效完成次数: {}", self.completion_count)?;
        write!(f, "  屏蔽挂起次数: {}", self.masked_count)
    }
}

#[derive(Debug, Clone, Copy)]
struct EventInterrupt {
    message: MsiMessage,
    masked: bool,
    pending: bool,
}

impl Default for EventInterrupt {
    fn default() -> Self {
        // 复位后默认屏蔽
        Self {
            message: MsiMessage::default(),
            masked: true,
            pending: false,
        }
    }
}

/// 中断控制器
#[derive(Debug, Default)]
pub struct InterruptController {
    fault_event: EventInterrupt,
    completion_event: EventInterrupt,
    outbox: VecDeque<InterruptRecord>,
    sequence: u64,
    stats: InterruptStats,
}

impl InterruptController {
    /// 创建新的中断控制器（两类中断均为屏蔽状态）
    pub fn new() -> Self {
        Self::default()
    }

    fn event(&self, interrupt_type: InterruptType) -> &EventInterrupt {
        match interrupt_type {
            InterruptType::FaultEvent => &self.fault_event,
            InterruptType::InvalidationCompletion => &self.completion_event,
        }
    }

    fn event_mut(&mut self, interrupt_type: InterruptType) -> &mut EventInterrupt {
        match interrupt_type {
            InterruptType::FaultEvent => &mut self.fault_event,
            InterruptType::InvalidationCompletion => &mut self.completion_event,
        }
    }

    /// 设置MSI地址与数据
    ///
    /// # 示例
    /// ```ignore
    /// controller.configure(InterruptType::FaultEvent, MsiMessage::new(0xfee0_0000, 0x31));
    /// ```
    pub fn configure(&mut self, interrupt_type: InterruptType, message: MsiMessage) {
        self.event_mut(interrupt_type).message = message;
    }

    pub fn message(&self, interrupt_type: InterruptType) -> MsiMessage {
        self.event(interrupt_type).message
    }

    /// 写屏蔽位；解除屏蔽时若挂起位仍置位则立即补发并清除挂起位
    pub fn set_masked(&mut self, interrupt_type: InterruptType, masked: bool) {
        let event = self.event_mut(interrupt_type);
        event.masked = masked;
        if !masked && event.pending {
            event.pending = false;
            self.fire(interrupt_type);
        }
    }

    /// 产生一次事件：置挂起位，未屏蔽则发送并清除挂起位
    pub fn signal(&mut self, interrupt_type: InterruptType) {
        let event = self.event_mut(interrupt_type);
        event.pending = true;
        if event.masked {
            self.stats.masked_count += 1;
            return;
        }
        event.pending = false;
        self.fire(interrupt_type);
    }

    /// 清除挂起位
    pub fn clear_pending(&mut self, interrupt_type: InterruptType) {
        self.event_mut(interrupt_type).pending = false;
    }

    pub fn is_pending(&self, interrupt_type: InterruptType) -> bool {
        self.event(interrupt_type).pending
    }

    pub fn is_masked(&self, interrupt_type: InterruptType) -> bool {
        self.event(interrupt_type).masked
    }

    fn fire(&mut self, interrupt_type: InterruptType) {
        self.sequence += 1;
        let record = InterruptRecord {
            interrupt_type,
            message: self.event(interrupt_type).message,
            sequence: self.sequence,
        };
        self.outbox.push_back(record);

        self.stats.total_interrupts += 1;
        match interrupt_type {
            InterruptType::FaultEvent => self.stats.fault_event_count += 1,
            InterruptType::InvalidationCompletion => self.stats.completion_count += 1,
        }
    }

    /// 取出全部待投递中断
    pub fn take_pending(&mut self) -> Vec<InterruptRecord> {
        self.outbox.drain(..).collect()
    }

    /// 是否有待投递中断
    pub fn has_pending_interrupts(&self) -> bool {
        !self.outbox.is_empty()
    }

    /// 获取统计信息
    pub fn get_stats(&self) -> InterruptStats {
        self.stats.clone()
    }

    /// 复位屏蔽/挂起状态与MSI配置，保留统计
    pub fn reset(&mut self) {
        self.fault_event = EventInterrupt::default();
        self.completion_event = EventInterrupt::default();
        self.outbox.clear();
    }
}
