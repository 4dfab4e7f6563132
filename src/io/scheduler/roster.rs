// ============================================================================
// src/io/scheduler/roster.rs - I/O Scheduler Roster
// ============================================================================
//!
//! # スケジューラ名簿
//!
//! 稼働中の全スケジューラの登録簿であり、イベント通知の集約点。
//! サブシステム初期化時に1つ作成し、`Arc` で各スケジューラに渡す。
//!
//! リスナーが1つもなければ `notify` はアトミック変数を1回読むだけで戻る。
//! イベントは固定長の `Copy` 構造体で、配送時にメモリ確保は行わない。

use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::fmt;
use core::sync::atomic::{AtomicI32, AtomicUsize, Ordering};

use log::debug;
use spin::{Mutex, RwLock};

use crate::error::IoStatus;
use crate::io::operation::IoOperation;
use crate::io::request::{IoRequest, IoRequestId};
use crate::task::{TeamId, ThreadId};

/// イベント種別
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoSchedulerEventKind {
    SchedulerAdded,
    SchedulerRemoved,
    RequestScheduled,
    RequestFinished,
    OperationStarted,
    OperationFinished,
}

/// イベントに含まれるリクエスト情報
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RequestEventInfo {
    pub id: IoRequestId,
    pub team: TeamId,
    pub thread: ThreadId,
    pub offset: u64,
    pub length: u64,
    pub is_write: bool,
    pub priority: i32,
    pub status: Option<IoStatus>,
    pub transferred: u64,
}

impl RequestEventInfo {
    fn capture(request: &IoRequest) -> Self {
        Self {
            id: request.id(),
            team: request.team(),
            thread: request.thread(),
            offset: request.offset(),
            length: request.length(),
            is_write: request.is_write(),
            priority: request.priority(),
            status: request.status(),
            transferred: request.transferred_bytes(),
        }
    }
}

/// イベントに含まれるオペレーション情報
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OperationEventInfo {
    pub index: usize,
    pub offset: u64,
    pub length: u64,
    pub is_write: bool,
    pub status: Option<IoStatus>,
    pub transferred: u64,
}

impl OperationEventInfo {
    fn capture(operation: &IoOperation) -> Self {
        Self {
            index: operation.index(),
            offset: operation.offset(),
            length: operation.length(),
            is_write: operation.is_write(),
            status: operation.status(),
            transferred: operation.transferred_bytes(),
        }
    }
}

/// スケジューライベント
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IoSchedulerEvent {
    pub kind: IoSchedulerEventKind,
    pub scheduler: i32,
    pub request: Option<RequestEventInfo>,
    pub operation: Option<OperationEventInfo>,
}

/// イベントの受け手
///
/// スケジューラのロック下から呼ばれることがあるため、ブロックしないこと。
pub trait IoSchedulerListener: Send + Sync {
    fn event_occurred(&self, event: &IoSchedulerEvent);
}

impl<F> IoSchedulerListener for F
where
    F: Fn(&IoSchedulerEvent) + Send + Sync,
{
    fn event_occurred(&self, event: &IoSchedulerEvent) {
        self(event)
    }
}

/// 登録済みスケジューラ
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchedulerInfo {
    pub id: i32,
    pub name: String,
}

/// スケジューラ名簿
pub struct IoSchedulerRoster {
    schedulers: Mutex<Vec<SchedulerInfo>>,
    listeners: RwLock<Vec<Arc<dyn IoSchedulerListener>>>,
    listener_count: AtomicUsize,
    next_id: AtomicI32,
}

impl IoSchedulerRoster {
    pub fn new() -> Self {
        Self {
            schedulers: Mutex::new(Vec::new()),
            listeners: RwLock::new(Vec::new()),
            listener_count: AtomicUsize::new(0),
            next_id: AtomicI32::new(1),
        }
    }

    /// スケジューラIDを払い出す
    pub fn next_id(&self) -> i32 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    /// スケジューラを登録
    pub fn add_scheduler(&self, id: i32, name: &str) {
        self.schedulers.lock().push(SchedulerInfo {
            id,
            name: String::from(name),
        });
        debug!("I/O scheduler {} ({}) registered", id, name);
        self.notify(IoSchedulerEventKind::SchedulerAdded, id, None, None);
    }

    /// スケジューラの登録を解除
    pub fn remove_scheduler(&self, id: i32) {
        let removed = {
            let mut schedulers = self.schedulers.lock();
            let before = schedulers.len();
            schedulers.retain(|s| s.id != id);
            schedulers.len() != before
        };
        if removed {
            debug!("I/O scheduler {} unregistered", id);
            self.notify(IoSchedulerEventKind::SchedulerRemoved, id, None, None);
        }
    }

    /// リスナーへイベントを配送
    pub fn notify(
        &self,
        kind: IoSchedulerEventKind,
        scheduler: i32,
        request: Option<&IoRequest>,
        operation: Option<&IoOperation>,
    ) {
        if !self.has_listeners() {
            return;
        }

        let event = IoSchedulerEvent {
            kind,
            scheduler,
            request: request.map(RequestEventInfo::capture),
            operation: operation.map(OperationEventInfo::capture),
        };
        for listener in self.listeners.read().iter() {
            listener.event_occurred(&event);
        }
    }

    pub fn add_listener(&self, listener: Arc<dyn IoSchedulerListener>) {
        let mut listeners = self.listeners.write();
        listeners.push(listener);
        self.listener_count.store(listeners.len(), Ordering::Release);
    }

    /// リスナーを解除（登録されていれば true）
    pub fn remove_listener(&self, listener: &Arc<dyn IoSchedulerListener>) -> bool {
        let mut listeners = self.listeners.write();
        let before = listeners.len();
        listeners.retain(|l| !Arc::ptr_eq(l, listener));
        self.listener_count.store(listeners.len(), Ordering::Release);
        listeners.len() != before
    }

    pub fn has_listeners(&self) -> bool {
        self.listener_count.load(Ordering::Acquire) > 0
    }

    /// 登録済みスケジューラの一覧
    pub fn schedulers(&self) -> Vec<SchedulerInfo> {
        self.schedulers.lock().clone()
    }

    pub fn scheduler_count(&self) -> usize {
        self.schedulers.lock().len()
    }

    pub fn dump(&self, out: &mut dyn fmt::Write) -> fmt::Result {
        let schedulers = self.schedulers.lock();
        writeln!(out, "I/O scheduler roster: {} scheduler(s)", schedulers.len())?;
        for scheduler in schedulers.iter() {
            writeln!(out, "  [{}] {}", scheduler.id, scheduler.name)?;
        }
        writeln!(out, "  listeners: {}", self.listener_count.load(Ordering::Acquire))
    }
}

impl Default for IoSchedulerRoster {
    fn default() -> Self {
        Self::new()
    }
}
