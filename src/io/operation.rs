// ============================================================================
// src/io/operation.rs - I/O Operation
// ============================================================================
//!
//! # I/Oオペレーション
//!
//! リクエストから切り出された、物理的に転送可能な1チャンク。
//! スケジューラが事前確保したプールから取り出され、再利用される。
//!
//! ## ライフサイクル
//! ```text
//! Idle(プール) -> Prepared -> Dispatched -> Completed -> Finished -> Idle
//! ```
//!
//! ## 非整列書き込み（read-modify-write）
//! ブロック境界に揃っていない書き込みは、端のブロックを先に読み込む
//! フェーズを経てから全体を書き込む:
//! ```text
//! ReadBegin -> ReadEnd -> DoAll
//! ```
//! `finish()` は次のフェーズが残っている間 `false` を返し、
//! オペレーションは再度ディスパッチされる。

use alloc::sync::Arc;
use core::fmt;
use core::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use bitflags::bitflags;

use super::request::IoRequest;
use crate::error::{
    IoStatus, STATUS_IDLE, STATUS_IN_PROGRESS, decode_status, encode_status,
};

bitflags! {
    /// 非整列転送のフラグ
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct OperationFlags: u32 {
        /// 先頭ブロックが部分的
        const PARTIAL_BEGIN = 1 << 0;
        /// 末尾ブロックが部分的
        const PARTIAL_END = 1 << 1;
    }
}

/// 転送フェーズ
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OperationPhase {
    /// 先頭の部分ブロックを読み込む
    ReadBegin,
    /// 末尾の部分ブロックを読み込む
    ReadEnd,
    /// 範囲全体を転送
    #[default]
    DoAll,
}

/// オペレーションの転送範囲
///
/// `offset`/`length` はブロック境界に揃えたデバイス上の範囲、
/// `original_*` はその中でリクエストが実際に要求している範囲。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OperationTransfer {
    pub offset: u64,
    pub length: u64,
    pub original_offset: u64,
    pub original_length: u64,
    pub block_size: u32,
    /// 使用するDMAバッファ
    pub dma_buffer: Option<usize>,
}

#[derive(Default)]
struct OperationInner {
    parent: Option<Arc<IoRequest>>,
    offset: u64,
    length: u64,
    original_offset: u64,
    original_length: u64,
    block_size: u32,
    is_write: bool,
    flags: OperationFlags,
    phase: OperationPhase,
    dma_buffer: Option<usize>,
}

impl OperationInner {
    /// 現在のフェーズで転送する範囲
    fn phase_range(&self) -> (u64, u64) {
        let block = u64::from(self.block_size);
        match self.phase {
            OperationPhase::ReadBegin => (self.offset, block),
            OperationPhase::ReadEnd => (self.offset + self.length - block, block),
            OperationPhase::DoAll => (self.offset, self.length),
        }
    }

    /// 先頭ブロックの読み込みで末尾もカバーされるか
    fn needs_read_end(&self) -> bool {
        self.flags.contains(OperationFlags::PARTIAL_END)
            && !(self.flags.contains(OperationFlags::PARTIAL_BEGIN)
                && self.length <= u64::from(self.block_size))
    }
}

/// I/Oオペレーション
pub struct IoOperation {
    /// プール内のインデックス
    index: usize,
    status: AtomicU32,
    transferred: AtomicU64,
    /// 正味バイト数の計算用（割り込み文脈から読む）
    net_skip: AtomicU64,
    net_limit: AtomicU64,
    inner: spin::Mutex<OperationInner>,
}

impl IoOperation {
    pub(crate) fn new(index: usize) -> Self {
        Self {
            index,
            status: AtomicU32::new(STATUS_IDLE),
            transferred: AtomicU64::new(0),
            net_skip: AtomicU64::new(0),
            net_limit: AtomicU64::new(0),
            inner: spin::Mutex::new(OperationInner::default()),
        }
    }

    pub fn index(&self) -> usize {
        self.index
    }

    /// 親リクエスト
    pub fn parent(&self) -> Option<Arc<IoRequest>> {
        self.inner.lock().parent.clone()
    }

    /// 現在のフェーズで転送するデバイス上のオフセット
    pub fn offset(&self) -> u64 {
        self.inner.lock().phase_range().0
    }

    /// 現在のフェーズで転送する長さ
    pub fn length(&self) -> u64 {
        self.inner.lock().phase_range().1
    }

    /// 現在のフェーズが書き込みか（read-modify-write の読み込み中は false）
    pub fn is_write(&self) -> bool {
        let inner = self.inner.lock();
        inner.is_write && inner.phase == OperationPhase::DoAll
    }

    /// フェーズに関係なく、整列済み転送範囲全体の長さ
    pub fn transfer_length(&self) -> u64 {
        self.inner.lock().length
    }

    pub fn original_offset(&self) -> u64 {
        self.inner.lock().original_offset
    }

    pub fn original_length(&self) -> u64 {
        self.inner.lock().original_length
    }

    pub fn phase(&self) -> OperationPhase {
        self.inner.lock().phase
    }

    pub fn flags(&self) -> OperationFlags {
        self.inner.lock().flags
    }

    pub fn dma_buffer(&self) -> Option<usize> {
        self.inner.lock().dma_buffer
    }

    /// 完了ステータス（未完了は None）
    pub fn status(&self) -> Option<IoStatus> {
        decode_status(self.status.load(Ordering::Acquire))
    }

    /// 正味の転送済みバイト数
    pub fn transferred_bytes(&self) -> u64 {
        self.transferred.load(Ordering::Acquire)
    }

    /// 転送範囲を設定してリクエストに結び付ける
    ///
    /// DMAリソースの `translate_next` から呼ばれる。
    pub fn configure(&self, request: &Arc<IoRequest>, transfer: OperationTransfer) {
        let mut flags = OperationFlags::empty();
        if transfer.original_offset > transfer.offset {
            flags |= OperationFlags::PARTIAL_BEGIN;
        }
        if transfer.original_offset + transfer.original_length < transfer.offset + transfer.length {
            flags |= OperationFlags::PARTIAL_END;
        }

        let mut inner = self.inner.lock();
        *inner = OperationInner {
            parent: Some(request.clone()),
            offset: transfer.offset,
            length: transfer.length,
            original_offset: transfer.original_offset,
            original_length: transfer.original_length,
            block_size: transfer.block_size,
            is_write: request.is_write(),
            flags,
            phase: OperationPhase::DoAll,
            dma_buffer: transfer.dma_buffer,
        };

        if inner.is_write && transfer.block_size > 0 {
            if flags.contains(OperationFlags::PARTIAL_BEGIN) {
                inner.phase = OperationPhase::ReadBegin;
            } else if flags.contains(OperationFlags::PARTIAL_END) {
                inner.phase = OperationPhase::ReadEnd;
            }
        }

        self.arm(&inner);
    }

    /// リクエスト全体を1対1で転送する（DMAリソースなし）
    pub(crate) fn prepare(&self, request: &Arc<IoRequest>) {
        self.configure(
            request,
            OperationTransfer {
                offset: request.offset(),
                length: request.length(),
                original_offset: request.offset(),
                original_length: request.length(),
                block_size: 0,
                dma_buffer: None,
            },
        );
    }

    /// 次のディスパッチに向けてステータスと正味計算の窓を設定
    fn arm(&self, inner: &OperationInner) {
        let skip = if inner.phase == OperationPhase::DoAll {
            inner.original_offset - inner.offset
        } else {
            0
        };
        self.net_skip.store(skip, Ordering::Relaxed);
        self.net_limit.store(inner.original_length, Ordering::Relaxed);
        self.transferred.store(0, Ordering::Relaxed);
        self.status.store(STATUS_IN_PROGRESS, Ordering::Release);
    }

    /// 終端ステータスを設定（処理中の場合のみ成功）
    pub(crate) fn set_status(&self, status: IoStatus) -> bool {
        self.status
            .compare_exchange(
                STATUS_IN_PROGRESS,
                encode_status(status),
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }

    /// デバイスが報告した転送量から、整列のための余分を除いた正味量を計算
    pub(crate) fn net_transferred(&self, device_bytes: u64) -> u64 {
        let skip = self.net_skip.load(Ordering::Relaxed);
        let limit = self.net_limit.load(Ordering::Relaxed);
        device_bytes.saturating_sub(skip).min(limit)
    }

    pub(crate) fn set_transferred_bytes(&self, bytes: u64) {
        self.transferred.store(bytes, Ordering::Release);
    }

    /// 現在のフェーズを終える
    ///
    /// さらにフェーズが残っていれば次へ進めて `false` を返す。
    /// 失敗したオペレーションは常に終了扱い。
    pub(crate) fn finish(&self) -> bool {
        if matches!(self.status(), Some(Err(_))) {
            return true;
        }

        let mut inner = self.inner.lock();
        match inner.phase {
            OperationPhase::ReadBegin => {
                inner.phase = if inner.needs_read_end() {
                    OperationPhase::ReadEnd
                } else {
                    OperationPhase::DoAll
                };
            }
            OperationPhase::ReadEnd => inner.phase = OperationPhase::DoAll,
            OperationPhase::DoAll => return true,
        }
        self.arm(&inner);
        false
    }

    /// プールに戻す
    pub(crate) fn recycle(&self) {
        *self.inner.lock() = OperationInner::default();
        self.transferred.store(0, Ordering::Relaxed);
        self.status.store(STATUS_IDLE, Ordering::Release);
    }
}

impl fmt::Debug for IoOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.lock();
        let (offset, length) = inner.phase_range();
        f.debug_struct("IoOperation")
            .field("index", &self.index)
            .field("request", &inner.parent.as_ref().map(|r| r.id()))
            .field("offset", &offset)
            .field("length", &length)
            .field("original_offset", &inner.original_offset)
            .field("original_length", &inner.original_length)
            .field("is_write", &inner.is_write)
            .field("phase", &inner.phase)
            .field("status", &decode_status(self.status.load(Ordering::Acquire)))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::IoError;
    use crate::io::request::PhysicalBuffer;

    fn write_request(offset: u64, length: u64) -> Arc<IoRequest> {
        Arc::new(IoRequest::new(
            offset,
            length,
            true,
            Arc::new(PhysicalBuffer::new(length)),
        ))
    }

    #[test]
    fn test_prepare_covers_whole_request() {
        let op = IoOperation::new(0);
        let req = Arc::new(IoRequest::new(
            1024,
            4096,
            false,
            Arc::new(PhysicalBuffer::new(4096)),
        ));
        op.prepare(&req);

        assert_eq!(op.offset(), 1024);
        assert_eq!(op.length(), 4096);
        assert!(!op.is_write());
        assert_eq!(op.phase(), OperationPhase::DoAll);
        assert_eq!(op.status(), None);
        assert!(op.finish());
    }

    #[test]
    fn test_status_is_set_once() {
        let op = IoOperation::new(3);
        // プール内のオペレーションは完了できない
        assert!(!op.set_status(Ok(())));

        op.prepare(&write_request(0, 512));
        assert!(op.set_status(Err(IoError::WriteError)));
        assert!(!op.set_status(Ok(())));
        assert_eq!(op.status(), Some(Err(IoError::WriteError)));

        op.recycle();
        assert_eq!(op.status(), None);
        assert!(!op.set_status(Ok(())));
    }

    #[test]
    fn test_unaligned_write_goes_through_read_phases() {
        let op = IoOperation::new(0);
        let req = write_request(100, 1000);
        op.configure(
            &req,
            OperationTransfer {
                offset: 0,
                length: 1536,
                original_offset: 100,
                original_length: 1000,
                block_size: 512,
                dma_buffer: None,
            },
        );

        assert_eq!(
            op.flags(),
            OperationFlags::PARTIAL_BEGIN | OperationFlags::PARTIAL_END
        );
        assert_eq!(op.phase(), OperationPhase::ReadBegin);
        assert!(!op.is_write());
        assert_eq!((op.offset(), op.length()), (0, 512));
        assert_eq!(op.transfer_length(), 1536);

        assert!(op.set_status(Ok(())));
        assert!(!op.finish());
        assert_eq!(op.phase(), OperationPhase::ReadEnd);
        assert_eq!((op.offset(), op.length()), (1024, 512));
        assert_eq!(op.status(), None);

        assert!(op.set_status(Ok(())));
        assert!(!op.finish());
        assert_eq!(op.phase(), OperationPhase::DoAll);
        assert!(op.is_write());
        assert_eq!((op.offset(), op.length()), (0, 1536));

        // 正味の転送量は要求範囲に切り詰められる
        assert_eq!(op.net_transferred(1536), 1000);
        assert_eq!(op.net_transferred(50), 0);
        assert!(op.set_status(Ok(())));
        assert!(op.finish());
    }

    #[test]
    fn test_single_block_partial_write_skips_read_end() {
        let op = IoOperation::new(0);
        let req = write_request(10, 20);
        op.configure(
            &req,
            OperationTransfer {
                offset: 0,
                length: 512,
                original_offset: 10,
                original_length: 20,
                block_size: 512,
                dma_buffer: Some(1),
            },
        );
        assert_eq!(op.phase(), OperationPhase::ReadBegin);
        assert!(op.set_status(Ok(())));
        assert!(!op.finish());
        assert_eq!(op.phase(), OperationPhase::DoAll);
        assert_eq!(op.dma_buffer(), Some(1));
    }

    #[test]
    fn test_failed_phase_finishes_immediately() {
        let op = IoOperation::new(0);
        let req = write_request(100, 100);
        op.configure(
            &req,
            OperationTransfer {
                offset: 0,
                length: 512,
                original_offset: 100,
                original_length: 100,
                block_size: 512,
                dma_buffer: None,
            },
        );
        assert!(op.set_status(Err(IoError::ReadError)));
        assert!(op.finish());
    }
}
