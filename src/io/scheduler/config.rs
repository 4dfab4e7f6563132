// ============================================================================
// src/io/scheduler/config.rs - スケジューラ設定
// ============================================================================

use crate::error::IoError;
use crate::io::dma::DmaResource;
use crate::task::{MAX_PRIORITY, ThreadRegistry};

/// DMAリソースがない場合のブロックサイズ
pub const DEFAULT_BLOCK_SIZE: u32 = 512;
/// DMAリソースがない場合のオペレーションプールサイズ
pub const DEFAULT_OPERATION_COUNT: usize = 16;

/// 優先度からクォンタムへの変換方針
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum QuantumPolicy {
    /// 優先度に関係なく最小帯域（従来の挙動）
    #[default]
    Fixed,
    /// 優先度に比例して最小帯域から最大帯域まで拡大
    Weighted,
}

/// スケジューラ設定
///
/// `None` のフィールドはDMAリソースとスレッドレジストリから導出される。
#[derive(Debug, Clone, Default)]
pub struct SchedulerConfig {
    pub block_size: Option<u32>,
    pub operation_count: Option<usize>,
    pub max_owners: Option<usize>,
    pub min_owner_bandwidth: Option<u64>,
    pub max_owner_bandwidth: Option<u64>,
    pub iteration_bandwidth: Option<u64>,
    pub quantum_policy: QuantumPolicy,
}

/// 確定した制限値
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SchedulerLimits {
    pub block_size: u32,
    pub operation_count: usize,
    pub max_owners: usize,
    pub min_owner_bandwidth: u64,
    pub max_owner_bandwidth: u64,
    pub iteration_bandwidth: u64,
    pub quantum_policy: QuantumPolicy,
}

impl SchedulerConfig {
    /// 既定値を補って検証する
    pub fn resolve(
        &self,
        dma: Option<&dyn DmaResource>,
        threads: &dyn ThreadRegistry,
    ) -> Result<SchedulerLimits, IoError> {
        let dma_block = dma.map(|d| d.block_size()).filter(|&b| b != 0);
        let block_size = self
            .block_size
            .or(dma_block)
            .unwrap_or(DEFAULT_BLOCK_SIZE);
        if !block_size.is_power_of_two() {
            return Err(IoError::BadValue);
        }
        if let (Some(configured), Some(device)) = (self.block_size, dma_block) {
            // DMAリソースの粒度より細かくは分割できない
            if configured != device {
                return Err(IoError::BadValue);
            }
        }

        let block = u64::from(block_size);
        let limits = SchedulerLimits {
            block_size,
            operation_count: self
                .operation_count
                .or(dma.map(|d| d.buffer_count()))
                .unwrap_or(DEFAULT_OPERATION_COUNT),
            max_owners: self.max_owners.unwrap_or_else(|| threads.max_threads()),
            min_owner_bandwidth: self.min_owner_bandwidth.unwrap_or(block * 1024),
            max_owner_bandwidth: self.max_owner_bandwidth.unwrap_or(block * 4096),
            iteration_bandwidth: self.iteration_bandwidth.unwrap_or(block * 8192),
            quantum_policy: self.quantum_policy,
        };

        if limits.operation_count == 0 || limits.max_owners == 0 {
            return Err(IoError::BadValue);
        }
        if limits.min_owner_bandwidth < block
            || limits.min_owner_bandwidth > limits.max_owner_bandwidth
            || limits.iteration_bandwidth < block
        {
            return Err(IoError::BadValue);
        }

        Ok(limits)
    }
}

impl SchedulerLimits {
    /// オーナーの優先度に応じたクォンタム（バイト）
    pub fn owner_quantum(&self, priority: i32) -> u64 {
        match self.quantum_policy {
            QuantumPolicy::Fixed => self.min_owner_bandwidth,
            QuantumPolicy::Weighted => {
                let priority = priority.clamp(0, MAX_PRIORITY) as u64;
                let span = self.max_owner_bandwidth - self.min_owner_bandwidth;
                let quantum = self.min_owner_bandwidth + span * priority / MAX_PRIORITY as u64;
                // ブロック境界に揃える
                quantum & !(u64::from(self.block_size) - 1)
            }
        }
    }
}
