// ============================================================================
// src/io/request.rs - I/O Request
// ============================================================================
//!
//! # I/Oリクエスト
//!
//! スレッドが発行する論理I/O（バイト範囲・方向・バッファ）。
//! スケジューラによって1つ以上の `IoOperation` に分割され、
//! 全オペレーションの完了後にちょうど1回だけ完了通知される。
//!
//! ## ステータス
//! - `None`: 処理中
//! - `Some(Ok(()))`: 現在の子オペレーションがすべて成功
//! - `Some(Err(e))`: 終端エラー（最初のエラーが優先）

use alloc::boxed::Box;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::fmt;
use core::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use bitflags::bitflags;
use parking_lot::{Condvar, Mutex};

use crate::error::{IoError, IoStatus};
use crate::task::{IDLE_PRIORITY, TeamId, ThreadId};

// ============================================================================
// I/O Buffer
// ============================================================================

/// リクエストのデータバッファ
///
/// 仮想アドレスのバッファはデバイスからアクセスできるよう、
/// スケジュール前にメモリをロック（ピン留め）する必要がある。
pub trait IoBuffer: Send + Sync {
    /// 仮想アドレスで指定されたバッファか
    fn is_virtual(&self) -> bool;

    /// バッファ長（バイト）
    fn length(&self) -> u64;

    /// メモリをロック
    fn lock_memory(&self, team: TeamId, is_write: bool) -> IoStatus;

    /// メモリのロックを解除
    fn unlock_memory(&self, team: TeamId, is_write: bool);

    /// ロック中か
    fn is_memory_locked(&self) -> bool;
}

/// 物理アドレスのバッファ（ロック不要）
#[derive(Debug)]
pub struct PhysicalBuffer {
    length: u64,
}

impl PhysicalBuffer {
    pub fn new(length: u64) -> Self {
        Self { length }
    }
}

impl IoBuffer for PhysicalBuffer {
    fn is_virtual(&self) -> bool {
        false
    }

    fn length(&self) -> u64 {
        self.length
    }

    fn lock_memory(&self, _team: TeamId, _is_write: bool) -> IoStatus {
        Ok(())
    }

    fn unlock_memory(&self, _team: TeamId, _is_write: bool) {}

    fn is_memory_locked(&self) -> bool {
        false
    }
}

/// 仮想アドレスのバッファ
#[derive(Debug)]
pub struct VirtualBuffer {
    length: u64,
    /// ロック回数
    lock_count: AtomicU32,
}

impl VirtualBuffer {
    pub fn new(length: u64) -> Self {
        Self {
            length,
            lock_count: AtomicU32::new(0),
        }
    }

    pub fn lock_count(&self) -> u32 {
        self.lock_count.load(Ordering::Acquire)
    }
}

impl IoBuffer for VirtualBuffer {
    fn is_virtual(&self) -> bool {
        true
    }

    fn length(&self) -> u64 {
        self.length
    }

    fn lock_memory(&self, _team: TeamId, _is_write: bool) -> IoStatus {
        self.lock_count.fetch_add(1, Ordering::AcqRel);
        Ok(())
    }

    fn unlock_memory(&self, _team: TeamId, _is_write: bool) {
        let _ = self
            .lock_count
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1));
    }

    fn is_memory_locked(&self) -> bool {
        self.lock_count() > 0
    }
}

// ============================================================================
// I/O Request
// ============================================================================

/// I/Oリクエスト識別子
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct IoRequestId(pub u64);

impl IoRequestId {
    fn next() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }
}

bitflags! {
    /// リクエストの状態フラグ
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct RequestFlags: u32 {
        /// 一部のオペレーションが要求長を転送しきれなかった
        const PARTIAL_TRANSFER = 1 << 0;
        /// 完了通知済み
        const NOTIFIED = 1 << 1;
    }
}

/// リクエストを保持するオーナースロット
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct OwnerSlot {
    /// スケジューラID
    pub scheduler: i32,
    /// オーナーアリーナ内のインデックス
    pub index: usize,
}

/// 完了コールバック
pub type FinishedCallback = Box<dyn FnOnce(&IoRequest) + Send>;

struct RequestState {
    status: Option<IoStatus>,
    /// まだオペレーションに変換されていないバイト数
    remaining: u64,
    /// 処理中の子オペレーション数
    pending_children: u32,
    /// 実際に転送されたバイト数（正味）
    transferred: u64,
    /// 部分転送時に切り詰められた転送サイズ
    transfer_size: u64,
    flags: RequestFlags,
    owner: Option<OwnerSlot>,
    priority: i32,
    callbacks: Vec<FinishedCallback>,
}

/// I/Oリクエスト
pub struct IoRequest {
    id: IoRequestId,
    offset: u64,
    length: u64,
    is_write: bool,
    team: TeamId,
    thread: ThreadId,
    buffer: Arc<dyn IoBuffer>,
    state: spin::Mutex<RequestState>,
    /// 完了待ち用
    done: Mutex<bool>,
    done_cond: Condvar,
}

impl IoRequest {
    /// 新しいリクエストを作成（カーネルチーム・スレッド0から発行）
    pub fn new(offset: u64, length: u64, is_write: bool, buffer: Arc<dyn IoBuffer>) -> Self {
        Self {
            id: IoRequestId::next(),
            offset,
            length,
            is_write,
            team: TeamId::KERNEL,
            thread: ThreadId::new(0),
            buffer,
            state: spin::Mutex::new(RequestState {
                status: None,
                remaining: length,
                pending_children: 0,
                transferred: 0,
                transfer_size: length,
                flags: RequestFlags::empty(),
                owner: None,
                priority: IDLE_PRIORITY,
                callbacks: Vec::new(),
            }),
            done: Mutex::new(false),
            done_cond: Condvar::new(),
        }
    }

    /// 発行元のチーム/スレッドを設定
    pub fn issued_by(mut self, team: TeamId, thread: ThreadId) -> Self {
        self.team = team;
        self.thread = thread;
        self
    }

    /// 完了コールバックを追加
    pub fn with_finished_callback<F>(self, callback: F) -> Self
    where
        F: FnOnce(&IoRequest) + Send + 'static,
    {
        self.add_finished_callback(callback);
        self
    }

    /// 完了コールバックを追加（スケジュール前に呼ぶこと）
    pub fn add_finished_callback<F>(&self, callback: F)
    where
        F: FnOnce(&IoRequest) + Send + 'static,
    {
        self.state.lock().callbacks.push(Box::new(callback));
    }

    pub fn id(&self) -> IoRequestId {
        self.id
    }

    pub fn offset(&self) -> u64 {
        self.offset
    }

    pub fn length(&self) -> u64 {
        self.length
    }

    pub fn is_write(&self) -> bool {
        self.is_write
    }

    pub fn team(&self) -> TeamId {
        self.team
    }

    pub fn thread(&self) -> ThreadId {
        self.thread
    }

    pub fn buffer(&self) -> &Arc<dyn IoBuffer> {
        &self.buffer
    }

    /// 現在のステータス（処理中は None）
    pub fn status(&self) -> Option<IoStatus> {
        self.state.lock().status
    }

    /// まだオペレーションに変換されていないバイト数
    pub fn remaining_bytes(&self) -> u64 {
        self.state.lock().remaining
    }

    /// 次に変換すべき位置
    pub fn current_offset(&self) -> u64 {
        self.offset + (self.length - self.state.lock().remaining)
    }

    /// 処理中の子オペレーション数
    pub fn pending_operations(&self) -> u32 {
        self.state.lock().pending_children
    }

    /// 正味の転送済みバイト数
    pub fn transferred_bytes(&self) -> u64 {
        self.state.lock().transferred
    }

    /// 部分転送を考慮した有効転送サイズ
    pub fn transfer_size(&self) -> u64 {
        self.state.lock().transfer_size
    }

    pub fn is_partial_transfer(&self) -> bool {
        self.state.lock().flags.contains(RequestFlags::PARTIAL_TRANSFER)
    }

    /// 完了通知済みか
    pub fn is_notified(&self) -> bool {
        self.state.lock().flags.contains(RequestFlags::NOTIFIED)
    }

    /// 最後にスケジュールされた時点のオーナー優先度
    pub fn priority(&self) -> i32 {
        self.state.lock().priority
    }

    pub fn has_callbacks(&self) -> bool {
        !self.state.lock().callbacks.is_empty()
    }

    /// 変換位置を進める
    pub fn advance(&self, bytes: u64) {
        let mut state = self.state.lock();
        state.remaining -= bytes.min(state.remaining);
    }

    /// 子オペレーションを1つ追加
    pub fn add_operation(&self) {
        self.state.lock().pending_children += 1;
    }

    /// 全子オペレーションが終了し、ステータスが確定しているか
    pub fn is_finished(&self) -> bool {
        let state = self.state.lock();
        state.pending_children == 0 && state.status.is_some()
    }

    pub(crate) fn owner(&self) -> Option<OwnerSlot> {
        self.state.lock().owner
    }

    pub(crate) fn set_owner(&self, owner: Option<OwnerSlot>) {
        self.state.lock().owner = owner;
    }

    pub(crate) fn set_priority(&self, priority: i32) {
        self.state.lock().priority = priority;
    }

    /// ステータスを設定（既に終端ステータスがあれば何もしない）
    pub(crate) fn set_status(&self, status: IoStatus) {
        let mut state = self.state.lock();
        match state.status {
            None | Some(Ok(())) if status.is_err() => state.status = Some(status),
            None => state.status = Some(status),
            _ => {}
        }
    }

    /// 処理途中の成功を取り消し、残りの変換を続行可能にする
    pub(crate) fn set_unfinished(&self) {
        let mut state = self.state.lock();
        if state.status == Some(Ok(())) {
            state.status = None;
        }
    }

    /// 子オペレーションの終了を反映
    ///
    /// `transfer_end_offset` はリクエスト先頭からの相対位置で、
    /// 失敗または部分転送の場合に有効転送サイズをそこまで切り詰める。
    pub(crate) fn operation_finished(
        &self,
        status: IoStatus,
        partial_transfer: bool,
        transfer_end_offset: u64,
        transferred: u64,
    ) {
        let mut state = self.state.lock();
        state.transferred += transferred;

        if status.is_err() || partial_transfer {
            if state.transfer_size > transfer_end_offset {
                state.transfer_size = transfer_end_offset;
            }
            state.flags |= RequestFlags::PARTIAL_TRANSFER;
        }

        if let Err(e) = status {
            if !matches!(state.status, Some(Err(_))) {
                state.status = Some(Err(e));
            }
        }

        state.pending_children = state.pending_children.saturating_sub(1);
        if state.pending_children > 0 {
            return;
        }

        // 最後の子オペレーション
        if state.status.is_none() {
            state.status = Some(Ok(()));
        }
    }

    /// 完了通知（ちょうど1回だけ有効）
    ///
    /// ロック済みメモリを解放し、コールバックを実行して待機者を起こす。
    /// コールバックはブロックしうるため、スケジューラはこれを
    /// 通知スレッドから呼ぶ。
    pub(crate) fn notify_finished(&self) {
        let callbacks = {
            let mut state = self.state.lock();
            if state.flags.contains(RequestFlags::NOTIFIED) {
                return;
            }
            state.flags |= RequestFlags::NOTIFIED;
            if state.status.is_none() {
                state.status = Some(Ok(()));
            }
            state.owner = None;
            core::mem::take(&mut state.callbacks)
        };

        if self.buffer.is_virtual() && self.buffer.is_memory_locked() {
            self.buffer.unlock_memory(self.team, self.is_write);
        }

        for callback in callbacks {
            callback(self);
        }

        *self.done.lock() = true;
        self.done_cond.notify_all();
    }

    /// ステータスを設定して完了通知
    pub(crate) fn set_status_and_notify(&self, status: IoStatus) {
        self.set_status(status);
        self.notify_finished();
    }

    /// 完了まで待機し、転送バイト数を返す
    pub fn wait(&self) -> Result<u64, IoError> {
        let mut done = self.done.lock();
        while !*done {
            self.done_cond.wait(&mut done);
        }
        drop(done);
        self.result()
    }

    /// タイムアウト付きで完了を待機（タイムアウト時は None）
    pub fn wait_timeout(&self, timeout: Duration) -> Option<Result<u64, IoError>> {
        let deadline = Instant::now() + timeout;
        let mut done = self.done.lock();
        while !*done {
            if self.done_cond.wait_until(&mut done, deadline).timed_out() {
                break;
            }
        }
        if !*done {
            return None;
        }
        drop(done);
        Some(self.result())
    }

    fn result(&self) -> Result<u64, IoError> {
        let state = self.state.lock();
        match state.status {
            Some(Err(e)) => Err(e),
            _ => Ok(state.transferred),
        }
    }
}

impl fmt::Debug for IoRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("IoRequest")
            .field("id", &self.id)
            .field("offset", &self.offset)
            .field("length", &self.length)
            .field("is_write", &self.is_write)
            .field("team", &self.team)
            .field("thread", &self.thread)
            .field("status", &state.status)
            .field("remaining", &state.remaining)
            .field("pending_children", &state.pending_children)
            .field("transferred", &state.transferred)
            .field("flags", &state.flags)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::sync::atomic::AtomicUsize;

    fn request(length: u64) -> IoRequest {
        IoRequest::new(4096, length, false, Arc::new(PhysicalBuffer::new(length)))
    }

    #[test]
    fn test_advance_and_current_offset() {
        let req = request(8192);
        assert_eq!(req.current_offset(), 4096);
        req.advance(1024);
        assert_eq!(req.remaining_bytes(), 7168);
        assert_eq!(req.current_offset(), 5120);
        req.advance(100_000);
        assert_eq!(req.remaining_bytes(), 0);
    }

    #[test]
    fn test_last_child_sets_ok_and_unfinished_resets() {
        let req = request(8192);
        req.advance(4096);
        req.add_operation();
        req.add_operation();

        req.operation_finished(Ok(()), false, 2048, 2048);
        assert!(!req.is_finished());
        req.operation_finished(Ok(()), false, 4096, 2048);
        assert!(req.is_finished());
        assert_eq!(req.status(), Some(Ok(())));
        assert_eq!(req.transferred_bytes(), 4096);

        // 残りがあるので再開可能
        req.set_unfinished();
        assert_eq!(req.status(), None);
        assert!(!req.is_finished());
    }

    #[test]
    fn test_error_truncates_transfer_size() {
        let req = request(8192);
        req.advance(8192);
        req.add_operation();
        req.add_operation();

        req.operation_finished(Err(IoError::ReadError), false, 4096, 0);
        req.operation_finished(Ok(()), false, 8192, 4096);
        assert!(req.is_finished());
        assert_eq!(req.status(), Some(Err(IoError::ReadError)));
        assert_eq!(req.transfer_size(), 4096);
        assert!(req.is_partial_transfer());
    }

    #[test]
    fn test_notify_runs_callbacks_exactly_once() {
        let count = Arc::new(AtomicUsize::new(0));
        let req = {
            let count = count.clone();
            request(512).with_finished_callback(move |_| {
                count.fetch_add(1, Ordering::SeqCst);
            })
        };
        assert!(req.has_callbacks());

        req.set_status_and_notify(Err(IoError::Cancelled));
        req.notify_finished();
        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert!(req.is_notified());
        assert_eq!(req.wait(), Err(IoError::Cancelled));
    }

    #[test]
    fn test_notify_unlocks_virtual_memory() {
        let buffer = Arc::new(VirtualBuffer::new(512));
        let req = IoRequest::new(0, 512, true, buffer.clone());
        buffer.lock_memory(req.team(), true).unwrap();
        assert!(buffer.is_memory_locked());

        req.notify_finished();
        assert_eq!(buffer.lock_count(), 0);
        assert_eq!(req.wait_timeout(Duration::from_millis(10)), Some(Ok(0)));
    }

    #[test]
    fn test_wait_timeout_before_completion() {
        let req = request(512);
        assert_eq!(req.wait_timeout(Duration::from_millis(5)), None);
    }

    #[test]
    fn test_wait_wakes_on_notify_from_other_thread() {
        let req = Arc::new(request(4096));
        let notifier = {
            let req = req.clone();
            std::thread::spawn(move || {
                std::thread::sleep(Duration::from_millis(5));
                req.operation_finished(Ok(()), false, 4096, 4096);
                req.notify_finished();
            })
        };
        assert_eq!(req.wait_timeout(Duration::from_secs(10)), Some(Ok(4096)));
        assert_eq!(req.wait(), Ok(4096));
        notifier.join().unwrap();
    }
}
