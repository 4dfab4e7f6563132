// ============================================================================
// src/io/scheduler/simple.rs - Simple fair-share I/O Scheduler
// ============================================================================
//!
//! # IoSchedulerSimple
//!
//! スレッドごとのオーナーをラウンドロビンで巡回し、各オーナーに
//! 優先度から決まるクォンタム（バイト数）だけオペレーションを作らせる。
//! 1回のイテレーションで集めたバッチはエレベータ順に並べ替えてから
//! ドライバへ渡し、全オペレーションの完了を待って次のイテレーションへ進む。
//!
//! ## スレッド
//! - スケジューラスレッド: バッチ作成・ディスパッチ・完了処理（Finisher）
//! - 通知スレッド: コールバック付きリクエストの完了通知
//!
//! ## ロック
//! - `state` (`Mutex`): オーナー・リング・プール。割り込み文脈からは取らない
//! - 完了キュー (`IrqMutex`): `CompletionHandle` が取る唯一のロック
//!
//! 両方を取る場合は必ず `state` → 完了キューの順。

use alloc::collections::VecDeque;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::fmt;
use core::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::thread::{self, JoinHandle};

use log::{debug, error, trace, warn};
use parking_lot::{Mutex, MutexGuard};

use super::config::{SchedulerConfig, SchedulerLimits};
use super::elevator::sort_operations;
use super::owner::OwnerTable;
use super::roster::{IoSchedulerEventKind, IoSchedulerRoster};
use super::{CompletionHandle, IoCallback, IoScheduler, SchedulerCore, VERBOSE};
use crate::error::{IoError, IoStatus};
use crate::io::dma::DmaResource;
use crate::io::operation::IoOperation;
use crate::io::request::{IoRequest, OwnerSlot};
use crate::sync::{ConditionVariable, IndexList, Link};
use crate::task::ThreadRegistry;

// ============================================================================
// Statistics
// ============================================================================

/// スケジューラ統計
#[derive(Debug)]
pub struct SchedulerStats {
    /// 受け付けたリクエスト数
    pub requests_scheduled: AtomicU64,
    /// 完了したリクエスト数
    pub requests_finished: AtomicU64,
    /// ディスパッチしたオペレーション数
    pub operations_dispatched: AtomicU64,
    /// 次のフェーズのために再キューしたオペレーション数
    pub operations_requeued: AtomicU64,
    /// 失敗したオペレーション数
    pub operations_failed: AtomicU64,
    /// ディスパッチしたバイト数
    pub bytes_dispatched: AtomicU64,
}

impl SchedulerStats {
    pub const fn new() -> Self {
        Self {
            requests_scheduled: AtomicU64::new(0),
            requests_finished: AtomicU64::new(0),
            operations_dispatched: AtomicU64::new(0),
            operations_requeued: AtomicU64::new(0),
            operations_failed: AtomicU64::new(0),
            bytes_dispatched: AtomicU64::new(0),
        }
    }
}

impl Default for SchedulerStats {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// Shared State
// ============================================================================

struct SchedulerState {
    owners: OwnerTable,
    /// オペレーションプールのリンク
    op_links: Vec<Link>,
    unused_operations: IndexList,
    /// 通知スレッドへ渡すリクエスト
    finished_requests: VecDeque<Arc<IoRequest>>,
    /// 現在のバッチで未完了のオペレーション数
    pending_operations: usize,
    /// 現在処理中のオーナー（None ならマーカーが位置を保持）
    cursor: Option<usize>,
    quantum: u64,
}

struct Shared {
    core: SchedulerCore,
    dma: Option<Arc<dyn DmaResource>>,
    threads: Arc<dyn ThreadRegistry>,
    limits: SchedulerLimits,
    callback: spin::RwLock<Option<Arc<dyn IoCallback>>>,
    operations: Box<[Arc<IoOperation>]>,
    state: Mutex<SchedulerState>,
    new_request: ConditionVariable,
    finished_request: ConditionVariable,
    completion: CompletionHandle,
    terminating: AtomicBool,
    stats: SchedulerStats,
}

/// 公平分配I/Oスケジューラ
pub struct IoSchedulerSimple {
    shared: Arc<Shared>,
    scheduler_thread: Option<JoinHandle<()>>,
    notifier_thread: Option<JoinHandle<()>>,
}

impl IoSchedulerSimple {
    /// スケジューラを作成し、スケジューラスレッドと通知スレッドを起動する
    pub fn init(
        name: &str,
        roster: Arc<IoSchedulerRoster>,
        threads: Arc<dyn ThreadRegistry>,
        dma: Option<Arc<dyn DmaResource>>,
        config: SchedulerConfig,
    ) -> Result<Self, IoError> {
        let limits = config.resolve(dma.as_deref(), threads.as_ref())?;
        let core = SchedulerCore::init(roster, name)?;

        let operation_count = limits.operation_count;
        let operations: Box<[Arc<IoOperation>]> = (0..operation_count)
            .map(|index| Arc::new(IoOperation::new(index)))
            .collect();
        let mut op_links = alloc::vec![Link::default(); operation_count];
        let mut unused_operations = IndexList::new();
        for index in 0..operation_count {
            unused_operations.push_back(&mut op_links, index);
        }

        let shared = Arc::new(Shared {
            core,
            dma,
            threads,
            limits,
            callback: spin::RwLock::new(None),
            operations,
            state: Mutex::new(SchedulerState {
                owners: OwnerTable::new(limits.max_owners),
                op_links,
                unused_operations,
                finished_requests: VecDeque::with_capacity(limits.max_owners),
                pending_operations: 0,
                cursor: None,
                quantum: 0,
            }),
            new_request: ConditionVariable::new("I/O new request"),
            finished_request: ConditionVariable::new("I/O finished request"),
            completion: CompletionHandle::new(operation_count),
            terminating: AtomicBool::new(false),
            stats: SchedulerStats::new(),
        });

        let scheduler_thread = spawn(alloc::format!("{} scheduler", name), {
            let shared = shared.clone();
            move || shared.scheduler_loop()
        })?;
        let notifier_thread = match spawn(alloc::format!("{} notifier", name), {
            let shared = shared.clone();
            move || shared.notifier_loop()
        }) {
            Ok(handle) => handle,
            Err(e) => {
                shared.terminate();
                let _ = scheduler_thread.join();
                return Err(e);
            }
        };

        debug!(
            "I/O scheduler {} ({}) initialized: block {} bytes, {} operations, {} owners, quantum {} bytes",
            shared.core.id(),
            name,
            limits.block_size,
            operation_count,
            limits.max_owners,
            limits.min_owner_bandwidth
        );

        Ok(Self {
            shared,
            scheduler_thread: Some(scheduler_thread),
            notifier_thread: Some(notifier_thread),
        })
    }

    /// 割り込み文脈で使う完了報告ハンドル
    pub fn completion_handle(&self) -> CompletionHandle {
        self.shared.completion.clone()
    }

    pub fn limits(&self) -> &SchedulerLimits {
        &self.shared.limits
    }

    pub fn stats(&self) -> &SchedulerStats {
        &self.shared.stats
    }

    /// アクティブなオーナー数
    pub fn active_owner_count(&self) -> usize {
        self.shared.lock().owners.active_count()
    }

    /// プールに残っているオペレーション数
    pub fn free_operation_count(&self) -> usize {
        self.shared.lock().unused_operations.len()
    }
}

fn spawn<F>(name: alloc::string::String, f: F) -> Result<JoinHandle<()>, IoError>
where
    F: FnOnce() + Send + 'static,
{
    thread::Builder::new().name(name).spawn(f).map_err(|e| {
        error!("failed to spawn I/O scheduler thread: {}", e);
        IoError::NoMemory
    })
}

impl IoScheduler for IoSchedulerSimple {
    fn id(&self) -> i32 {
        self.shared.core.id()
    }

    fn name(&self) -> &str {
        self.shared.core.name()
    }

    fn set_callback(&self, callback: Arc<dyn IoCallback>) {
        *self.shared.callback.write() = Some(callback);
    }

    fn schedule_request(&self, request: Arc<IoRequest>) -> IoStatus {
        self.shared.schedule_request(request)
    }

    fn abort_request(&self, request: &Arc<IoRequest>, status: IoError) {
        self.shared.abort_request(request, status);
    }

    fn operation_completed(&self, operation: &Arc<IoOperation>, status: IoStatus, transferred: u64) {
        self.shared
            .completion
            .operation_completed(operation, status, transferred);
    }

    fn dump(&self, out: &mut dyn fmt::Write) -> fmt::Result {
        let shared = &self.shared;
        let state = shared.lock();
        writeln!(
            out,
            "I/O scheduler {} ({}): block {} bytes, quantum {}..{} bytes, iteration {} bytes",
            shared.core.id(),
            shared.core.name(),
            shared.limits.block_size,
            shared.limits.min_owner_bandwidth,
            shared.limits.max_owner_bandwidth,
            shared.limits.iteration_bandwidth,
        )?;
        writeln!(
            out,
            "  operations: {} free of {}, {} pending; owners: {} active, {} unused",
            state.unused_operations.len(),
            shared.operations.len(),
            state.pending_operations,
            state.owners.active_count(),
            state.owners.unused_count(),
        )?;
        state.owners.dump(out)
    }
}

impl Drop for IoSchedulerSimple {
    fn drop(&mut self) {
        self.shared.terminate();
        for handle in [self.scheduler_thread.take(), self.notifier_thread.take()]
            .into_iter()
            .flatten()
        {
            if handle.join().is_err() {
                error!(
                    "I/O scheduler {}: worker thread panicked",
                    self.shared.core.id()
                );
            }
        }
        self.shared.cancel_remaining();
        debug!("I/O scheduler {} torn down", self.shared.core.id());
    }
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, SchedulerState> {
        self.state.lock()
    }

    fn is_terminating(&self) -> bool {
        self.terminating.load(Ordering::Acquire)
    }

    fn notify(&self, kind: IoSchedulerEventKind, request: Option<&IoRequest>, operation: Option<&IoOperation>) {
        self.core
            .roster()
            .notify(kind, self.core.id(), request, operation);
    }

    /// 終了フラグを両方のロック下で立て、全待機者を起こす
    fn terminate(&self) {
        {
            let _state = self.lock();
            let _queue = self.completion.domain().queue.lock();
            self.terminating.store(true, Ordering::Release);
        }
        self.new_request.notify_all();
        self.finished_request.notify_all();
        self.completion.domain().finished_operation.notify_all();
    }

    // ========================================================================
    // Request submission
    // ========================================================================

    fn schedule_request(&self, request: Arc<IoRequest>) -> IoStatus {
        if self.callback.read().is_none() {
            return Err(IoError::NotInitialized);
        }
        if self.is_terminating() {
            return Err(IoError::Cancelled);
        }
        if request.owner().is_some() {
            return Err(IoError::BadValue);
        }

        let buffer = request.buffer();
        if buffer.is_virtual() {
            if let Err(e) = buffer.lock_memory(request.team(), request.is_write()) {
                warn!(
                    "{}: failed to lock memory of request {:?}: {}",
                    self.core.name(),
                    request.id(),
                    e
                );
                request.set_status_and_notify(Err(e));
                return Err(e);
            }
        }

        let mut state = self.lock();
        let Some(index) = state
            .owners
            .acquire(request.team(), request.thread(), self.threads.as_ref())
        else {
            drop(state);
            if buffer.is_virtual() {
                buffer.unlock_memory(request.team(), request.is_write());
            }
            warn!(
                "{}: no free request owner for thread {}",
                self.core.name(),
                request.thread().as_i32()
            );
            return Err(IoError::NoMemory);
        };

        request.set_owner(Some(OwnerSlot {
            scheduler: self.core.id(),
            index,
        }));

        let owner = state.owners.get_mut(index);
        let was_active = owner.is_active();
        owner.requests.push_back(request.clone());
        // 優先度はスケジュールのたびに読み直す
        if let Some(priority) = self.threads.io_priority(request.thread()) {
            owner.set_priority(priority);
        }
        request.set_priority(owner.priority());
        if !was_active {
            state.owners.activate(index);
        }

        self.stats.requests_scheduled.fetch_add(1, Ordering::Relaxed);
        self.notify(IoSchedulerEventKind::RequestScheduled, Some(&*request), None);
        self.new_request.notify_all();
        Ok(())
    }

    fn abort_request(&self, request: &Arc<IoRequest>, status: IoError) {
        let mut state = self.lock();
        let st = &mut *state;
        let Some(slot) = request.owner() else {
            return;
        };
        if slot.scheduler != self.core.id() {
            return;
        }
        // ステータス確定済みで子オペレーションもない: 完了処理に任せる
        if request.is_finished() {
            return;
        }

        debug!(
            "{}: aborting request {:?} with {}",
            self.core.name(),
            request.id(),
            status
        );
        request.set_status(Err(status));

        // 再ディスパッチ待ちのオペレーションはここで失敗させる
        let owner = st.owners.get_mut(slot.index);
        let requeued: Vec<usize> = owner
            .operations
            .iter(&st.op_links)
            .filter(|&i| {
                self.operations[i]
                    .parent()
                    .is_some_and(|parent| Arc::ptr_eq(&parent, request))
            })
            .collect();
        for index in requeued {
            owner.operations.remove(&mut st.op_links, index);
            let operation = &self.operations[index];
            let start = operation.original_offset() - request.offset();
            request.operation_finished(Err(status), true, start, 0);
            self.recycle_operation(&mut st.unused_operations, &mut st.op_links, operation);
        }

        if request.pending_operations() == 0 {
            self.finish_request_locked(st, request);
        }
    }

    // ========================================================================
    // Scheduler thread
    // ========================================================================

    fn scheduler_loop(&self) {
        let capacity = self.operations.len();
        let mut batch: Vec<Arc<IoOperation>> = Vec::with_capacity(capacity);
        let mut scratch: Vec<Arc<IoOperation>> = Vec::with_capacity(capacity);
        let mut head = 0u64;
        let block = u64::from(self.limits.block_size);

        self.lock().owners.push_marker();

        while !self.is_terminating() {
            let mut state = self.lock();
            let mut iteration = self.limits.iteration_bandwidth;
            let mut resources_available = true;

            if state.cursor.is_none() {
                state.cursor = state.owners.take_marker();
                state.quantum = 0;
            }

            if state.cursor.is_none() || state.quantum < block {
                let (guard, selected) = self.next_active_owner(state, true);
                state = guard;
                if !selected {
                    break;
                }
            }

            while resources_available && iteration >= block {
                let st = &mut *state;
                let Some(index) = st.cursor else {
                    break;
                };

                // 未完了のフェーズを持つオペレーションを先に
                while st.quantum >= block && iteration >= block {
                    let owner = st.owners.get_mut(index);
                    let Some(op_index) = owner.operations.pop_front(&mut st.op_links) else {
                        break;
                    };
                    let operation = self.operations[op_index].clone();
                    let bandwidth = operation.transfer_length();
                    owner.dispatched_bytes += bandwidth;
                    batch.push(operation);
                    st.quantum = st.quantum.saturating_sub(bandwidth);
                    iteration = iteration.saturating_sub(bandwidth);
                }

                while resources_available && st.quantum >= block && iteration >= block {
                    let Some(request) = st.owners.get(index).requests.front().cloned() else {
                        break;
                    };

                    let (available, bandwidth) =
                        self.prepare_request_operations(st, &request, &mut batch);
                    resources_available = available;
                    st.owners.get_mut(index).dispatched_bytes += bandwidth;
                    st.quantum = st.quantum.saturating_sub(bandwidth);
                    iteration = iteration.saturating_sub(bandwidth);

                    // 全体を変換し終えたリクエストは完了待ちへ
                    if request.remaining_bytes() == 0 || matches!(request.status(), Some(Err(_))) {
                        let owner = st.owners.get_mut(index);
                        if owner.remove_queued(&request) {
                            owner.completed_requests.push_back(request);
                        }
                    }
                }

                if !resources_available {
                    break;
                }
                let (guard, selected) = self.next_active_owner(state, batch.is_empty());
                state = guard;
                if !selected {
                    break;
                }
            }

            // 現在のオーナーのリクエストが尽きたら、次回の走査位置をマーカーで保存
            let st = &mut *state;
            if let Some(index) = st.cursor {
                if st.owners.get(index).requests.is_empty() {
                    st.owners.insert_marker_before(index);
                    st.cursor = None;
                }
            }

            if batch.is_empty() {
                continue;
            }

            st.pending_operations = batch.len();
            drop(state);

            let passes = sort_operations(&mut batch, &mut scratch, &mut head);
            if VERBOSE {
                trace!(
                    "{}: dispatching {} operation(s) in {} pass(es)",
                    self.core.name(),
                    batch.len(),
                    passes
                );
            }

            let callback = self.callback.read().clone();
            for operation in batch.drain(..) {
                let parent = operation.parent();
                self.notify(
                    IoSchedulerEventKind::OperationStarted,
                    parent.as_deref(),
                    Some(&*operation),
                );
                self.stats.operations_dispatched.fetch_add(1, Ordering::Relaxed);
                self.stats
                    .bytes_dispatched
                    .fetch_add(operation.length(), Ordering::Relaxed);

                let result = match &callback {
                    Some(callback) => callback.do_io(&operation),
                    None => Err(IoError::NotInitialized),
                };
                if let Err(e) = result {
                    warn!(
                        "{}: dispatch of operation {} failed: {}",
                        self.core.name(),
                        operation.index(),
                        e
                    );
                    self.completion.operation_completed(&operation, Err(e), 0);
                }

                self.finisher();
            }

            // バッチの全オペレーションの完了を待つ
            loop {
                let state = self.lock();
                if state.pending_operations == 0 || self.is_terminating() {
                    break;
                }

                let queue = self.completion.domain().queue.lock();
                if !queue.is_empty() {
                    drop(queue);
                    drop(state);
                    self.finisher();
                    continue;
                }

                let entry = self.completion.domain().finished_operation.add();
                drop(queue);
                drop(state);
                entry.wait();
                self.finisher();
            }
        }

        debug!("{}: scheduler thread exiting", self.core.name());
    }

    /// カーソルの次から、ディスパッチできる作業を持つオーナーを探す
    ///
    /// `may_wait` のときは見つかるまで新しいリクエストを待つ。
    /// 終了要求時、または待てずに見つからなかったときは false。
    fn next_active_owner<'a>(
        &'a self,
        mut state: MutexGuard<'a, SchedulerState>,
        may_wait: bool,
    ) -> (MutexGuard<'a, SchedulerState>, bool) {
        loop {
            if self.is_terminating() {
                return (state, false);
            }

            // 完了処理でカーソルが外れていれば、マーカーの位置から再開
            if state.cursor.is_none() {
                state.cursor = state.owners.take_marker();
            }

            if let Some(index) = find_next_owner(&state.owners, state.cursor) {
                state.cursor = Some(index);
                state.quantum = self
                    .limits
                    .owner_quantum(state.owners.get(index).priority());
                return (state, true);
            }

            if !may_wait {
                return (state, false);
            }

            // 待つ前に完了処理が残っていないか確認
            let queue = self.completion.domain().queue.lock();
            if !queue.is_empty() {
                drop(queue);
                drop(state);
                self.finisher();
                state = self.lock();
                continue;
            }

            let entry = self.new_request.add();
            drop(queue);
            drop(state);
            entry.wait();
            self.finisher();
            state = self.lock();
        }
    }

    /// リクエストからオペレーションを作る
    ///
    /// 戻り値は（資源が残っているか, 消費した帯域）。
    fn prepare_request_operations(
        &self,
        st: &mut SchedulerState,
        request: &Arc<IoRequest>,
        batch: &mut Vec<Arc<IoOperation>>,
    ) -> (bool, u64) {
        if matches!(request.status(), Some(Err(_))) {
            return (true, 0);
        }
        if request.remaining_bytes() == 0 && request.pending_operations() == 0 {
            // 長さ0のリクエストは転送なしで完了
            request.set_status(Ok(()));
            self.finish_request_locked(st, request);
            return (true, 0);
        }

        let Some(dma) = &self.dma else {
            let Some(index) = st.unused_operations.pop_front(&mut st.op_links) else {
                return (false, 0);
            };
            let operation = &self.operations[index];
            operation.prepare(request);
            request.advance(request.remaining_bytes());
            request.add_operation();
            batch.push(operation.clone());
            return (true, operation.transfer_length());
        };

        let block = u64::from(self.limits.block_size);
        let mut bandwidth = 0;
        while st.quantum.saturating_sub(bandwidth) >= block && request.remaining_bytes() > 0 {
            let Some(index) = st.unused_operations.pop_front(&mut st.op_links) else {
                return (false, bandwidth);
            };
            let operation = &self.operations[index];

            match dma.translate_next(request, operation, st.quantum - bandwidth) {
                Ok(()) => {}
                Err(e) if e.is_transient() => {
                    // 次のイテレーションで再試行
                    operation.recycle();
                    st.unused_operations.push_front(&mut st.op_links, index);
                    return (false, bandwidth);
                }
                Err(e) => {
                    operation.recycle();
                    st.unused_operations.push_front(&mut st.op_links, index);
                    warn!(
                        "{}: translating request {:?} failed: {}",
                        self.core.name(),
                        request.id(),
                        e
                    );
                    request.set_status(Err(e));
                    if request.pending_operations() == 0 {
                        self.finish_request_locked(st, request);
                    }
                    return (true, bandwidth);
                }
            }

            request.add_operation();
            bandwidth += operation.transfer_length();
            batch.push(operation.clone());
        }
        (true, bandwidth)
    }

    // ========================================================================
    // Finisher
    // ========================================================================

    /// 完了キューを空にする
    fn finisher(&self) {
        loop {
            let Some(operation) = self.completion.domain().queue.lock().pop_front() else {
                return;
            };

            // プール外のオペレーションは扱わない
            if !self
                .operations
                .get(operation.index())
                .is_some_and(|own| Arc::ptr_eq(own, &operation))
            {
                warn!(
                    "{}: ignoring completion of foreign operation {}",
                    self.core.name(),
                    operation.index()
                );
                continue;
            }
            let Some(request) = operation.parent() else {
                continue;
            };

            if !operation.finish() {
                // 次のフェーズのために再キュー
                operation.set_transferred_bytes(0);
                let mut state = self.lock();
                let st = &mut *state;
                if let Some(slot) = request.owner() {
                    st.owners
                        .get_mut(slot.index)
                        .operations
                        .push_back(&mut st.op_links, operation.index());
                }
                st.pending_operations = st.pending_operations.saturating_sub(1);
                self.stats.operations_requeued.fetch_add(1, Ordering::Relaxed);
                continue;
            }

            let status = operation.status().unwrap_or(Ok(()));
            let transferred = operation.transferred_bytes();
            let start = operation.original_offset() - request.offset();
            let end = if status.is_ok() { start + transferred } else { start };

            // リクエストへの反映と完了判定は中止と競合しないようロック下で行う
            let finished = {
                let mut state = self.lock();
                let st = &mut *state;
                request.operation_finished(
                    status,
                    transferred < operation.original_length(),
                    end,
                    transferred,
                );
                st.pending_operations = st.pending_operations.saturating_sub(1);
                let finished = request.is_finished();
                if finished && request.status() == Some(Ok(())) && request.remaining_bytes() > 0 {
                    // 残りは次のイテレーションで変換する
                    request.set_unfinished();
                    false
                } else {
                    finished
                }
            };
            if VERBOSE {
                trace!(
                    "{}: operation {} finished: {:?}, {} bytes",
                    self.core.name(),
                    operation.index(),
                    status,
                    transferred
                );
            }
            if status.is_err() {
                self.stats.operations_failed.fetch_add(1, Ordering::Relaxed);
            }
            self.notify(
                IoSchedulerEventKind::OperationFinished,
                Some(&*request),
                Some(&*operation),
            );

            let mut state = self.lock();
            let st = &mut *state;
            self.recycle_operation(&mut st.unused_operations, &mut st.op_links, &operation);
            if finished {
                self.finish_request_locked(st, &request);
            }
        }
    }

    fn recycle_operation(&self, unused: &mut IndexList, links: &mut [Link], operation: &IoOperation) {
        if let Some(dma) = &self.dma {
            dma.recycle_buffer(operation);
        }
        operation.recycle();
        unused.push_back(links, operation.index());
    }

    /// リクエストをオーナーから外して完了通知する
    ///
    /// オーナーから外れているリクエストは既に通知済みなので何もしない。
    fn finish_request_locked(&self, st: &mut SchedulerState, request: &Arc<IoRequest>) {
        let Some(slot) = request.owner() else {
            return;
        };
        let owner = st.owners.get_mut(slot.index);
        if !owner.remove_completed(request) {
            owner.remove_queued(request);
        }
        if !owner.is_active() {
            self.deactivate_owner_locked(st, slot.index);
        }
        request.set_owner(None);
        self.stats.requests_finished.fetch_add(1, Ordering::Relaxed);

        if request.has_callbacks() {
            // コールバックはブロックしうるので通知スレッドへ
            st.finished_requests.push_back(request.clone());
            self.finished_request.notify_all();
        } else {
            self.notify(IoSchedulerEventKind::RequestFinished, Some(&**request), None);
            request.notify_finished();
        }
    }

    fn deactivate_owner_locked(&self, st: &mut SchedulerState, index: usize) {
        if st.cursor == Some(index) {
            st.owners.insert_marker_before(index);
            st.cursor = None;
        }
        st.owners.deactivate(index);
    }

    // ========================================================================
    // Notifier thread
    // ========================================================================

    fn notifier_loop(&self) {
        loop {
            let mut state = self.lock();
            match state.finished_requests.pop_front() {
                Some(request) => {
                    drop(state);
                    self.notify(IoSchedulerEventKind::RequestFinished, Some(&*request), None);
                    request.notify_finished();
                }
                None => {
                    if self.is_terminating() {
                        break;
                    }
                    let entry = self.finished_request.add();
                    drop(state);
                    entry.wait();
                }
            }
        }
        debug!("{}: notifier thread exiting", self.core.name());
    }

    /// 終了後に残ったリクエストを取り消す
    fn cancel_remaining(&self) {
        let mut cancelled = Vec::new();
        {
            let mut state = self.lock();
            let st = &mut *state;
            let active: Vec<usize> = st.owners.active_owners().collect();
            for index in active {
                let owner = st.owners.get_mut(index);
                cancelled.extend(owner.requests.drain(..));
                cancelled.extend(owner.completed_requests.drain(..));
                while let Some(op_index) = owner.operations.pop_front(&mut st.op_links) {
                    let operation = &self.operations[op_index];
                    if let Some(dma) = &self.dma {
                        dma.recycle_buffer(operation);
                    }
                    operation.recycle();
                    st.unused_operations.push_back(&mut st.op_links, op_index);
                }
                st.owners.deactivate(index);
            }
            cancelled.extend(st.finished_requests.drain(..));
        }

        if !cancelled.is_empty() {
            warn!(
                "{}: cancelling {} unfinished request(s)",
                self.core.name(),
                cancelled.len()
            );
        }
        for request in cancelled {
            request.set_status_and_notify(Err(IoError::Cancelled));
        }
    }
}

/// リング上でカーソルの次から、作業を持つオーナーを1周分探す
fn find_next_owner(owners: &OwnerTable, cursor: Option<usize>) -> Option<usize> {
    let marker = owners.marker();
    let mut candidate = cursor
        .and_then(|c| owners.ring_next(c))
        .or(owners.ring_head());
    for _ in 0..owners.ring_len() {
        let index = candidate?;
        if index != marker && owners.get(index).has_pending_work() {
            return Some(index);
        }
        candidate = owners.ring_next(index).or(owners.ring_head());
    }
    None
}
