// ============================================================================
// src/io/scheduler/mod.rs - I/O Scheduler
// ============================================================================
//!
//! # I/Oスケジューラ
//!
//! ブロックデバイスへのリクエストをスレッド（オーナー）単位で公平に分配し、
//! オフセット順に並べ替えてドライバへ渡す。
//!
//! ## 2つの実行ドメイン
//! ```text
//!   呼び出しスレッド ──schedule_request──> [fLock: Mutex]  <── スケジューラ/通知スレッド
//!                                              │
//!   ドライバ/割り込み ──CompletionHandle──> [IrqMutex + ConditionVariable]
//! ```
//! 割り込み文脈から触れてよいのは `CompletionHandle` だけで、
//! これはブロックもメモリ確保も行わない。

pub mod config;
pub mod elevator;
pub mod owner;
pub mod roster;
pub mod simple;

use alloc::collections::VecDeque;
use alloc::string::String;
use alloc::sync::Arc;
use core::fmt;

use crate::error::{IoError, IoStatus};
use crate::io::operation::IoOperation;
use crate::io::request::IoRequest;
use crate::sync::{ConditionVariable, IrqMutex};

pub use config::{QuantumPolicy, SchedulerConfig, SchedulerLimits};
pub use owner::IoRequestOwner;
pub use roster::{
    IoSchedulerEvent, IoSchedulerEventKind, IoSchedulerListener, IoSchedulerRoster,
    OperationEventInfo, RequestEventInfo, SchedulerInfo,
};
pub use simple::{IoSchedulerSimple, SchedulerStats};

/// オペレーション単位のトレースを出すか
pub(crate) const VERBOSE: bool = cfg!(feature = "verbose_logging");

/// ドライバのI/Oコールバック
///
/// ディスパッチされたオペレーションごとに1回呼ばれる。ドライバは
/// 同期的または非同期に、いずれ必ず完了を報告すること。
/// エラーを返した場合はそのステータスで即座に完了したものとみなす。
pub trait IoCallback: Send + Sync {
    fn do_io(&self, operation: &Arc<IoOperation>) -> IoStatus;
}

impl<F> IoCallback for F
where
    F: Fn(&Arc<IoOperation>) -> IoStatus + Send + Sync,
{
    fn do_io(&self, operation: &Arc<IoOperation>) -> IoStatus {
        self(operation)
    }
}

/// I/Oスケジューラ
pub trait IoScheduler: Send + Sync {
    fn id(&self) -> i32;

    fn name(&self) -> &str;

    /// ドライバコールバックを設定
    fn set_callback(&self, callback: Arc<dyn IoCallback>);

    /// リクエストを受け付ける
    fn schedule_request(&self, request: Arc<IoRequest>) -> IoStatus;

    /// リクエストを中止する（ベストエフォート）
    fn abort_request(&self, request: &Arc<IoRequest>, status: IoError);

    /// オペレーションの完了を報告（割り込み文脈から呼べる）
    fn operation_completed(&self, operation: &Arc<IoOperation>, status: IoStatus, transferred: u64);

    fn dump(&self, out: &mut dyn fmt::Write) -> fmt::Result;
}

// ============================================================================
// Scheduler Core
// ============================================================================

/// 全スケジューラ共通の識別情報
///
/// 作成時に名簿へ登録し、ドロップ時に登録を解除する。
pub struct SchedulerCore {
    id: i32,
    name: String,
    roster: Arc<IoSchedulerRoster>,
}

impl SchedulerCore {
    pub fn init(roster: Arc<IoSchedulerRoster>, name: &str) -> Result<Self, IoError> {
        let mut owned = String::new();
        owned
            .try_reserve_exact(name.len())
            .map_err(|_| IoError::NoMemory)?;
        owned.push_str(name);

        let id = roster.next_id();
        roster.add_scheduler(id, &owned);
        Ok(Self {
            id,
            name: owned,
            roster,
        })
    }

    pub fn id(&self) -> i32 {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn roster(&self) -> &Arc<IoSchedulerRoster> {
        &self.roster
    }
}

impl Drop for SchedulerCore {
    fn drop(&mut self) {
        self.roster.remove_scheduler(self.id);
    }
}

impl fmt::Debug for SchedulerCore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SchedulerCore")
            .field("id", &self.id)
            .field("name", &self.name)
            .finish()
    }
}

// ============================================================================
// Completion (interrupt-safe domain)
// ============================================================================

pub(crate) struct CompletionDomain {
    /// 完了済みオペレーション（容量はプールサイズで確保済み）
    pub(crate) queue: IrqMutex<VecDeque<Arc<IoOperation>>>,
    pub(crate) finished_operation: ConditionVariable,
}

/// 割り込み安全な完了報告ハンドル
///
/// スケジューラの `Mutex` には一切触れない。
#[derive(Clone)]
pub struct CompletionHandle {
    domain: Arc<CompletionDomain>,
}

impl CompletionHandle {
    pub(crate) fn new(capacity: usize) -> Self {
        Self {
            domain: Arc::new(CompletionDomain {
                queue: IrqMutex::new(VecDeque::with_capacity(capacity)),
                finished_operation: ConditionVariable::new("I/O operation finished"),
            }),
        }
    }

    pub(crate) fn domain(&self) -> &CompletionDomain {
        &self.domain
    }

    /// オペレーションの完了を報告
    ///
    /// 既に終端ステータスを持つ（またはプールに戻っている）
    /// オペレーションへの報告は無視される。
    pub fn operation_completed(&self, operation: &Arc<IoOperation>, status: IoStatus, transferred: u64) {
        let mut queue = self.domain.queue.lock();
        if !operation.set_status(status) {
            return;
        }
        operation.set_transferred_bytes(operation.net_transferred(transferred));
        queue.push_back(operation.clone());
        self.domain.finished_operation.notify_all();
    }

    /// 未処理の完了数
    pub fn pending(&self) -> usize {
        self.domain.queue.lock().len()
    }
}

impl fmt::Debug for CompletionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CompletionHandle")
            .field("pending", &self.pending())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::request::PhysicalBuffer;

    #[test]
    fn test_core_registers_and_unregisters() {
        let roster = Arc::new(IoSchedulerRoster::new());
        {
            let core = SchedulerCore::init(roster.clone(), "disk0").unwrap();
            assert_eq!(core.name(), "disk0");
            assert_eq!(roster.schedulers()[0].id, core.id());
        }
        assert_eq!(roster.scheduler_count(), 0);
    }

    #[test]
    fn test_completion_is_at_most_once() {
        let handle = CompletionHandle::new(4);
        let request = Arc::new(IoRequest::new(
            0,
            4096,
            false,
            Arc::new(PhysicalBuffer::new(4096)),
        ));
        let op = Arc::new(IoOperation::new(0));
        op.prepare(&request);

        handle.operation_completed(&op, Ok(()), 4096);
        handle.operation_completed(&op, Err(IoError::ReadError), 0);
        assert_eq!(handle.pending(), 1);
        assert_eq!(op.status(), Some(Ok(())));
        assert_eq!(op.transferred_bytes(), 4096);
    }

    #[test]
    fn test_idle_operation_is_ignored() {
        let handle = CompletionHandle::new(1);
        let op = Arc::new(IoOperation::new(0));
        handle.operation_completed(&op, Ok(()), 512);
        assert_eq!(handle.pending(), 0);
        assert_eq!(op.status(), None);
    }

    #[test]
    fn test_closure_callback() {
        let callback: Arc<dyn IoCallback> =
            Arc::new(|_: &Arc<IoOperation>| -> IoStatus { Err(IoError::NotSupported) });
        let op = Arc::new(IoOperation::new(0));
        assert_eq!(callback.do_io(&op), Err(IoError::NotSupported));
    }
}
