// ============================================================================
// src/io/dma.rs - DMA Resource
// ============================================================================
//!
//! # DMAリソース
//!
//! リクエストの未変換部分から、デバイスが一度に転送できる
//! ブロック境界に揃ったチャンクを切り出してオペレーションに設定する。
//!
//! ## 非整列の端
//! ```text
//!   block 0        block 1        block 2
//! |--------------|--------------|--------------|
//!        ^ original_offset            ^ original_end
//! |<--------------- offset/length ------------>|
//! ```
//! 端のブロックが部分的な場合、書き込みは read-modify-write になる。

use alloc::sync::Arc;
use alloc::vec::Vec;
use core::fmt;

use super::operation::{IoOperation, OperationTransfer};
use super::request::IoRequest;
use crate::error::{IoError, IoStatus};

/// DMAリソース
pub trait DmaResource: Send + Sync {
    /// デバイスのブロックサイズ（2のべき乗）
    fn block_size(&self) -> u32;

    /// 同時に使用できるバウンスバッファ数
    fn buffer_count(&self) -> usize;

    /// リクエストの次のチャンクをオペレーションに設定し、リクエストを進める
    ///
    /// `Err(IoError::Busy)` は一時的な資源不足で、後で再試行できる。
    fn translate_next(
        &self,
        request: &Arc<IoRequest>,
        operation: &IoOperation,
        max_operation_length: u64,
    ) -> IoStatus;

    /// オペレーションが使っていたバッファを返却
    fn recycle_buffer(&self, operation: &IoOperation);
}

/// ブロック単位の単純なDMAリソース
pub struct BlockDmaResource {
    block_size: u32,
    /// 1回の転送の上限
    max_transfer: u64,
    buffer_count: usize,
    free_buffers: spin::Mutex<Vec<usize>>,
}

impl BlockDmaResource {
    pub fn new(block_size: u32, max_transfer: u64, buffer_count: usize) -> Result<Self, IoError> {
        if !block_size.is_power_of_two() || max_transfer < u64::from(block_size) {
            return Err(IoError::BadValue);
        }
        if buffer_count == 0 {
            return Err(IoError::BadValue);
        }

        Ok(Self {
            block_size,
            max_transfer,
            buffer_count,
            free_buffers: spin::Mutex::new((0..buffer_count).rev().collect()),
        })
    }

    pub fn max_transfer(&self) -> u64 {
        self.max_transfer
    }

    /// 空きバッファ数
    pub fn free_buffer_count(&self) -> usize {
        self.free_buffers.lock().len()
    }
}

impl DmaResource for BlockDmaResource {
    fn block_size(&self) -> u32 {
        self.block_size
    }

    fn buffer_count(&self) -> usize {
        self.buffer_count
    }

    fn translate_next(
        &self,
        request: &Arc<IoRequest>,
        operation: &IoOperation,
        max_operation_length: u64,
    ) -> IoStatus {
        let remaining = request.remaining_bytes();
        if remaining == 0 {
            return Err(IoError::BadValue);
        }

        let block = u64::from(self.block_size);
        let start = request.current_offset();
        let aligned_start = start & !(block - 1);
        let budget = (max_operation_length.min(self.max_transfer) & !(block - 1)).max(block);
        let end = (start + remaining).min(aligned_start + budget);
        let aligned_end = end.div_ceil(block) * block;

        let buffer = self.free_buffers.lock().pop().ok_or(IoError::Busy)?;

        operation.configure(
            request,
            OperationTransfer {
                offset: aligned_start,
                length: aligned_end - aligned_start,
                original_offset: start,
                original_length: end - start,
                block_size: self.block_size,
                dma_buffer: Some(buffer),
            },
        );
        request.advance(end - start);
        Ok(())
    }

    fn recycle_buffer(&self, operation: &IoOperation) {
        if let Some(buffer) = operation.dma_buffer() {
            let mut free = self.free_buffers.lock();
            debug_assert!(!free.contains(&buffer), "DMA buffer {} recycled twice", buffer);
            free.push(buffer);
        }
    }
}

impl fmt::Debug for BlockDmaResource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BlockDmaResource")
            .field("block_size", &self.block_size)
            .field("max_transfer", &self.max_transfer)
            .field("buffer_count", &self.buffer_count)
            .field("free_buffers", &self.free_buffer_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::operation::OperationPhase;
    use crate::io::request::PhysicalBuffer;

    fn request(offset: u64, length: u64, is_write: bool) -> Arc<IoRequest> {
        Arc::new(IoRequest::new(
            offset,
            length,
            is_write,
            Arc::new(PhysicalBuffer::new(length)),
        ))
    }

    #[test]
    fn test_rejects_bad_geometry() {
        assert_eq!(
            BlockDmaResource::new(500, 4096, 4).err(),
            Some(IoError::BadValue)
        );
        assert_eq!(
            BlockDmaResource::new(512, 256, 4).err(),
            Some(IoError::BadValue)
        );
        assert_eq!(
            BlockDmaResource::new(512, 4096, 0).err(),
            Some(IoError::BadValue)
        );
    }

    #[test]
    fn test_aligned_request_is_chunked() {
        let dma = BlockDmaResource::new(512, 65536, 4).unwrap();
        let req = request(0, 10_000, false);
        let op = IoOperation::new(0);

        dma.translate_next(&req, &op, 4096).unwrap();
        assert_eq!((op.offset(), op.length()), (0, 4096));
        assert_eq!(req.remaining_bytes(), 10_000 - 4096);

        dma.recycle_buffer(&op);
        dma.translate_next(&req, &op, 4096).unwrap();
        assert_eq!((op.offset(), op.length()), (4096, 4096));

        dma.recycle_buffer(&op);
        dma.translate_next(&req, &op, 4096).unwrap();
        // 最後のチャンクはブロック境界まで切り上げ
        assert_eq!((op.offset(), op.length()), (8192, 2048));
        assert_eq!(op.original_length(), 10_000 - 8192);
        assert_eq!(req.remaining_bytes(), 0);

        assert_eq!(dma.translate_next(&req, &op, 4096), Err(IoError::BadValue));
    }

    #[test]
    fn test_unaligned_write_gets_partial_edges() {
        let dma = BlockDmaResource::new(512, 65536, 1).unwrap();
        let req = request(100, 1000, true);
        let op = IoOperation::new(0);

        dma.translate_next(&req, &op, 4096).unwrap();
        assert_eq!(op.original_offset(), 100);
        assert_eq!(op.original_length(), 1000);
        assert_eq!(op.phase(), OperationPhase::ReadBegin);
        assert_eq!(op.dma_buffer(), Some(0));
        assert_eq!(req.remaining_bytes(), 0);
    }

    #[test]
    fn test_buffer_exhaustion_is_busy() {
        let dma = BlockDmaResource::new(512, 4096, 1).unwrap();
        let req = request(0, 8192, false);
        let first = IoOperation::new(0);
        let second = IoOperation::new(1);

        dma.translate_next(&req, &first, 65536).unwrap();
        assert_eq!(first.length(), 4096);
        assert_eq!(dma.translate_next(&req, &second, 65536), Err(IoError::Busy));
        // 失敗時はリクエストを進めない
        assert_eq!(req.remaining_bytes(), 4096);

        dma.recycle_buffer(&first);
        assert_eq!(dma.free_buffer_count(), 1);
        dma.translate_next(&req, &second, 65536).unwrap();
        assert_eq!(second.offset(), 4096);
    }
}
