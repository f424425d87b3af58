//! 内存捕获缓冲区

use parking_lot::Mutex;

use super::record::{CaptureBatch, CaptureRecord};

#[derive(Debug, Default)]
struct BufferState {
    records: Vec<CaptureRecord>,
    /// 本轮（上次 drain 之后）追加的记录数
    cycle_count: usize,
    /// 进程生命周期内的总记录数
    total_count: u64,
}

/// 捕获缓冲区
///
/// `append` 与 `drain` 在同一把锁下互斥，记录不会在 drain 时丢失或重复
#[derive(Debug, Default)]
pub struct CaptureBuffer {
    state: Mutex<BufferState>,
}

impl CaptureBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// 追加一条记录，返回本轮计数
    pub fn append(&self, record: CaptureRecord) -> usize {
        let mut state = self.state.lock();
        state.records.push(record);
        state.cycle_count += 1;
        state.total_count += 1;
        state.cycle_count
    }

    /// 取走当前所有记录并重置本轮计数
    ///
    /// 缓冲区为空时返回 None
    pub fn drain(&self) -> Option<CaptureBatch> {
        let records = {
            let mut state = self.state.lock();
            state.cycle_count = 0;
            std::mem::take(&mut state.records)
        };
        CaptureBatch::new(records)
    }

    pub fn len(&self) -> usize {
        self.state.lock().records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state.lock().records.is_empty()
    }

    /// 本轮计数
    pub fn cycle_count(&self) -> usize {
        self.state.lock().cycle_count
    }

    /// 生命周期总计数
    pub fn total_count(&self) -> u64 {
        self.state.lock().total_count
    }
}
