// Guest物理内存访问接口
//
// IOMMU通过该接口读取根表、上下文表、PASID结构与页表，
// 并完成等待描述符的状态回写。所有多字节数据均为小端序。

use crate::error::{IommuError, IommuResult};
use parking_lot::RwLock;
use std::collections::HashMap;

const PAGE_SHIFT: u32 = 12;
const PAGE_SIZE: usize = 1 << PAGE_SHIFT;

/// Guest物理内存访问
///
/// 访问失败（地址越界或不可访问）时返回 `IommuError::GuestMemory`，
/// 由调用方映射为相应的故障原因码。
pub trait GuestMemory: Send + Sync {
    /// 读取 `buf.len()` 字节
    fn read(&self, addr: u64, buf: &mut [u8]) -> IommuResult<()>;

    /// 写入 `data`
    fn write(&self, addr: u64, data: &[u8]) -> IommuResult<()>;

    fn read_u64(&self, addr: u64) -> IommuResult<u64> {
        let mut bytes = [0u8; 8];
        self.read(addr, &mut bytes)?;
        Ok(u64::from_le_bytes(bytes))
    }

    /// 连续读取多个小端64位字，一次性完成以保证整体成功或失败
    fn read_qwords(&self, addr: u64, out: &mut [u64]) -> IommuResult<()> {
        let mut bytes = vec![0u8; out.len() * 8];
        self.read(addr, &mut bytes)?;
        for (value, chunk) in out.iter_mut().zip(bytes.chunks_exact(8)) {
            let mut word = [0u8; 8];
            word.copy_from_slice(chunk);
            *value = u64::from_le_bytes(word);
        }
        Ok(())
    }

    fn write_u32(&self, addr: u64, value: u32) -> IommuResult<()> {
        self.write(addr, &value.to_le_bytes())
    }

    fn write_u64(&self, addr: u64, value: u64) -> IommuResult<()> {
        self.write(addr, &value.to_le_bytes())
    }
}

/// 稀疏guest内存
///
/// 按4K页惰性分配，未写入的页读出为零；`limit` 及以上的地址不可访问。
pub struct SparseMemory {
    pages: RwLock<HashMap<u64, Box<[u8; PAGE_SIZE]>>>,
    limit: u64,
}

impl Default for SparseMemory {
    fn default() -> Self {
        Self::new(1u64 << 48)
    }
}

impl SparseMemory {
    /// 创建稀疏内存
    ///
    /// # 参数
    /// - `limit`: 可访问地址上界（不含）
    pub fn new(limit: u64) -> Self {
        Self {
            pages: RwLock::new(HashMap::new()),
            limit,
        }
    }

    pub fn limit(&self) -> u64 {
        self.limit
    }

    /// 已分配的页数
    pub fn allocated_pages(&self) -> usize {
        self.pages.read().len()
    }

    fn check_range(&self, addr: u64, len: usize) -> IommuResult<()> {
        match addr.checked_add(len as u64) {
            Some(end) if end <= self.limit => Ok(()),
            _ => Err(IommuError::GuestMemory { addr, len }),
        }
    }
}

impl GuestMemory for SparseMemory {
    fn read(&self, addr: u64, buf: &mut [u8]) -> IommuResult<()> {
        self.check_range(addr, buf.len())?;
        let pages = self.pages.read();
        let mut done = 0usize;
        while done < buf.len() {
            let cur = addr + done as u64;
            let offset = (cur as usize) & (PAGE_SIZE - 1);
            let chunk = (PAGE_SIZE - offset).min(buf.len() - done);
            match pages.get(&(cur >> PAGE_SHIFT)) {
                Some(page) => buf[done..done + chunk].copy_from_slice(&page[offset..offset + chunk]),
                None => buf[done..done + chunk].fill(0),
            }
            done += chunk;
        }
        Ok(())
    }

    fn write(&self, addr: u64, data: &[u8]) -> IommuResult<()> {
        self.check_range(addr, data.len())?;
        let mut pages = self.pages.write();
        let mut done = 0usize;
        while done < data.len() {
            let cur = addr + done as u64;
            let offset = (cur as usize) & (PAGE_SIZE - 1);
            let chunk = (PAGE_SIZE - offset).min(data.len() - done);
            let page = pages
                .entry(cur >> PAGE_SHIFT)
                .or_insert_with(|| Box::new([0u8; PAGE_SIZE]));
            page[offset..offset + chunk].copy_from_slice(&data[done..done + chunk]);
            done += chunk;
        }
        Ok(())
    }
}
