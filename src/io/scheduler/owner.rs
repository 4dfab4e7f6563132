// ============================================================================
// src/io/scheduler/owner.rs - I/O Request Owner
// ============================================================================
//!
//! # リクエストオーナー
//!
//! スレッドごとの未処理リクエストと処理中オペレーションの集合で、
//! 公平分配の単位。オーナーは固定長アリーナに置かれ、
//! アクティブリング・未使用リストはインデックスで連結される。
//!
//! ## 不変条件
//! - 3つのキューのいずれかが空でない ⇔ アクティブリング上にある
//! - 非アクティブなオーナーは必ず未使用リスト上にある
//!   （スレッドとの対応は再利用されるまで保持）
//!
//! アリーナの末尾には走査位置を保存するためのマーカースロットがある。

use alloc::collections::VecDeque;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::fmt;

use hashbrown::HashMap;
use log::debug;

use crate::io::request::IoRequest;
use crate::sync::{IndexList, Link};
use crate::task::{IDLE_PRIORITY, TeamId, ThreadId, ThreadRegistry};

/// リクエストオーナー
pub struct IoRequestOwner {
    team: TeamId,
    /// 未使用のまま一度も割り当てられていなければ None
    thread: Option<ThreadId>,
    priority: i32,
    /// 未変換のリクエスト
    pub(crate) requests: VecDeque<Arc<IoRequest>>,
    /// 変換済みで完了待ちのリクエスト
    pub(crate) completed_requests: VecDeque<Arc<IoRequest>>,
    /// 再ディスパッチ待ちのオペレーション（オペレーションプールのインデックス）
    pub(crate) operations: IndexList,
    /// これまでにディスパッチしたバイト数
    pub(crate) dispatched_bytes: u64,
}

impl IoRequestOwner {
    fn new() -> Self {
        Self {
            team: TeamId::KERNEL,
            thread: None,
            priority: IDLE_PRIORITY,
            requests: VecDeque::new(),
            completed_requests: VecDeque::new(),
            operations: IndexList::new(),
            dispatched_bytes: 0,
        }
    }

    pub fn team(&self) -> TeamId {
        self.team
    }

    pub fn thread(&self) -> Option<ThreadId> {
        self.thread
    }

    pub fn priority(&self) -> i32 {
        self.priority
    }

    pub(crate) fn set_priority(&mut self, priority: i32) {
        self.priority = priority;
    }

    pub fn dispatched_bytes(&self) -> u64 {
        self.dispatched_bytes
    }

    /// いずれかのキューに作業が残っているか
    pub fn is_active(&self) -> bool {
        !self.requests.is_empty()
            || !self.completed_requests.is_empty()
            || !self.operations.is_empty()
    }

    /// スケジューラが新たに何かをディスパッチできるか
    pub(crate) fn has_pending_work(&self) -> bool {
        !self.requests.is_empty() || !self.operations.is_empty()
    }

    /// 完了待ちリストから取り外す
    pub(crate) fn remove_completed(&mut self, request: &Arc<IoRequest>) -> bool {
        match self
            .completed_requests
            .iter()
            .position(|r| Arc::ptr_eq(r, request))
        {
            Some(position) => {
                self.completed_requests.remove(position);
                true
            }
            None => false,
        }
    }

    /// 未変換リストから取り外す
    pub(crate) fn remove_queued(&mut self, request: &Arc<IoRequest>) -> bool {
        match self.requests.iter().position(|r| Arc::ptr_eq(r, request)) {
            Some(position) => {
                self.requests.remove(position);
                true
            }
            None => false,
        }
    }

    pub fn dump(&self, out: &mut dyn fmt::Write) -> fmt::Result {
        writeln!(
            out,
            "owner team {} thread {:?}: priority {}, {} request(s), {} completed, {} operation(s), {} bytes dispatched",
            self.team.as_i32(),
            self.thread.map(|t| t.as_i32()),
            self.priority,
            self.requests.len(),
            self.completed_requests.len(),
            self.operations.len(),
            self.dispatched_bytes,
        )
    }
}

/// オーナーアリーナ
pub(crate) struct OwnerTable {
    owners: Vec<IoRequestOwner>,
    /// `owners.len() + 1` 個（最後がマーカー）
    links: Vec<Link>,
    active: IndexList,
    unused: IndexList,
    by_thread: HashMap<ThreadId, usize>,
}

impl OwnerTable {
    pub fn new(capacity: usize) -> Self {
        let mut table = Self {
            owners: (0..capacity).map(|_| IoRequestOwner::new()).collect(),
            links: alloc::vec![Link::default(); capacity + 1],
            active: IndexList::new(),
            unused: IndexList::new(),
            by_thread: HashMap::with_capacity(capacity),
        };
        for index in 0..capacity {
            table.unused.push_back(&mut table.links, index);
        }
        table
    }

    pub fn marker(&self) -> usize {
        self.owners.len()
    }

    pub fn get(&self, index: usize) -> &IoRequestOwner {
        &self.owners[index]
    }

    pub fn get_mut(&mut self, index: usize) -> &mut IoRequestOwner {
        &mut self.owners[index]
    }

    /// スレッドのオーナーを取得（なければ未使用スロットを割り当てる）
    ///
    /// 返されたオーナーが非アクティブなら未使用リストから外されているので、
    /// 呼び出し側はキューに積んでから `activate` すること。
    /// 空きがなければ None。
    pub fn acquire(
        &mut self,
        team: TeamId,
        thread: ThreadId,
        threads: &dyn ThreadRegistry,
    ) -> Option<usize> {
        if let Some(index) = self.lookup(thread) {
            if !self.owners[index].is_active() {
                self.unused.remove(&mut self.links, index);
            }
            self.owners[index].team = team;
            return Some(index);
        }

        // 一度も使われていないか、スレッドが終了したスロットを優先
        let index = self
            .unused
            .iter(&self.links)
            .find(|&i| match self.owners[i].thread {
                None => true,
                Some(t) => !threads.is_alive(t),
            })
            .or(self.unused.head())?;

        self.unused.remove(&mut self.links, index);
        let owner = &mut self.owners[index];
        if let Some(previous) = owner.thread.take() {
            self.by_thread.remove(&previous);
            debug!(
                "recycling request owner {} from thread {} to thread {}",
                index,
                previous.as_i32(),
                thread.as_i32()
            );
        }
        owner.team = team;
        owner.thread = Some(thread);
        owner.priority = IDLE_PRIORITY;
        owner.dispatched_bytes = 0;
        self.by_thread.insert(thread, index);
        Some(index)
    }

    /// スレッドに対応するオーナー
    pub fn lookup(&self, thread: ThreadId) -> Option<usize> {
        self.by_thread.get(&thread).copied()
    }

    /// アクティブリングの末尾に追加
    pub fn activate(&mut self, index: usize) {
        self.active.push_back(&mut self.links, index);
    }

    /// アクティブリングから外して未使用リストへ
    pub fn deactivate(&mut self, index: usize) {
        self.active.remove(&mut self.links, index);
        self.unused.push_back(&mut self.links, index);
    }

    pub fn ring_head(&self) -> Option<usize> {
        self.active.head()
    }

    pub fn ring_next(&self, index: usize) -> Option<usize> {
        self.active.next(&self.links, index)
    }

    /// リング上の要素数（マーカーを含む）
    pub fn ring_len(&self) -> usize {
        self.active.len()
    }

    pub fn active_count(&self) -> usize {
        self.active.len() - usize::from(self.marker_linked())
    }

    pub fn unused_count(&self) -> usize {
        self.unused.len()
    }

    /// アクティブリング上のオーナー（マーカーを除く）
    pub fn active_owners(&self) -> impl Iterator<Item = usize> + '_ {
        let marker = self.marker();
        self.active.iter(&self.links).filter(move |&i| i != marker)
    }

    pub fn marker_linked(&self) -> bool {
        self.links[self.marker()].is_linked()
    }

    /// `owner` の直前にマーカーを置く
    pub fn insert_marker_before(&mut self, owner: usize) {
        let marker = self.marker();
        self.active.insert_before(&mut self.links, owner, marker);
    }

    /// マーカーをリングの末尾に置く
    pub fn push_marker(&mut self) {
        let marker = self.marker();
        self.active.push_back(&mut self.links, marker);
    }

    /// マーカーを外し、その直前にあったオーナーを返す
    pub fn take_marker(&mut self) -> Option<usize> {
        let marker = self.marker();
        if !self.links[marker].is_linked() {
            return None;
        }
        let previous = self.active.prev(&self.links, marker);
        self.active.remove(&mut self.links, marker);
        previous
    }

    pub fn dump(&self, out: &mut dyn fmt::Write) -> fmt::Result {
        for index in self.active_owners() {
            write!(out, "  [{}] ", index)?;
            self.owners[index].dump(out)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::request::PhysicalBuffer;
    use crate::task::{NORMAL_PRIORITY, ThreadTable};

    fn request() -> Arc<IoRequest> {
        Arc::new(IoRequest::new(0, 512, false, Arc::new(PhysicalBuffer::new(512))))
    }

    fn enqueue(table: &mut OwnerTable, threads: &ThreadTable, thread: i32) -> usize {
        let index = table
            .acquire(TeamId::KERNEL, ThreadId::new(thread), threads)
            .unwrap();
        let was_active = table.get(index).is_active();
        table.get_mut(index).requests.push_back(request());
        if !was_active {
            table.activate(index);
        }
        index
    }

    #[test]
    fn test_same_thread_reuses_owner() {
        let threads = ThreadTable::new(4);
        threads.register(ThreadId::new(1), TeamId::KERNEL, NORMAL_PRIORITY);
        let mut table = OwnerTable::new(2);

        let a = enqueue(&mut table, &threads, 1);
        let b = enqueue(&mut table, &threads, 1);
        assert_eq!(a, b);
        assert_eq!(table.get(a).requests.len(), 2);
        assert_eq!(table.active_count(), 1);
        assert_eq!(table.unused_count(), 1);
    }

    #[test]
    fn test_exhaustion_and_recycling() {
        let threads = ThreadTable::new(4);
        for t in 1..=3 {
            threads.register(ThreadId::new(t), TeamId::KERNEL, NORMAL_PRIORITY);
        }
        let mut table = OwnerTable::new(2);

        let first = enqueue(&mut table, &threads, 1);
        enqueue(&mut table, &threads, 2);
        assert_eq!(
            table.acquire(TeamId::KERNEL, ThreadId::new(3), &threads),
            None
        );

        // 1つ目が空になれば、生存スレッドのものでも再利用される
        table.get_mut(first).requests.clear();
        table.deactivate(first);
        let recycled = enqueue(&mut table, &threads, 3);
        assert_eq!(recycled, first);
        assert_eq!(table.lookup(ThreadId::new(1)), None);
        assert_eq!(table.lookup(ThreadId::new(3)), Some(first));
    }

    #[test]
    fn test_dead_thread_slot_is_preferred() {
        let threads = ThreadTable::new(4);
        for t in 1..=3 {
            threads.register(ThreadId::new(t), TeamId::KERNEL, NORMAL_PRIORITY);
        }
        let mut table = OwnerTable::new(2);

        let a = enqueue(&mut table, &threads, 1);
        let b = enqueue(&mut table, &threads, 2);
        for index in [a, b] {
            table.get_mut(index).requests.clear();
            table.deactivate(index);
        }
        threads.exit(ThreadId::new(2));

        assert_eq!(enqueue(&mut table, &threads, 3), b);
        assert_eq!(table.lookup(ThreadId::new(1)), Some(a));
    }

    #[test]
    fn test_marker_keeps_position() {
        let threads = ThreadTable::new(4);
        let mut table = OwnerTable::new(3);
        let a = enqueue(&mut table, &threads, 1);
        let b = enqueue(&mut table, &threads, 2);
        let c = enqueue(&mut table, &threads, 3);

        table.insert_marker_before(b);
        assert_eq!(table.active_count(), 3);
        assert_eq!(table.active_owners().collect::<Vec<_>>(), vec![a, b, c]);

        table.get_mut(b).requests.clear();
        table.deactivate(b);
        assert_eq!(table.take_marker(), Some(a));
        assert_eq!(table.ring_next(a), Some(c));
        assert!(!table.marker_linked());
        assert_eq!(table.take_marker(), None);
    }
}
