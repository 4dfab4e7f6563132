//! スレッド管理 (Thread Registry)
//!
//! I/Oスケジューラが参照するスレッド情報。
//! リクエストオーナーの優先度はスケジュール時に毎回ここから読み直され、
//! オーナースロットの再利用可否は `is_alive` で判定される。

use hashbrown::HashMap;
use spin::RwLock;

/// チームID (Newtype)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Ord, PartialOrd)]
pub struct TeamId(i32);

impl TeamId {
    pub const KERNEL: Self = Self(1);

    pub const fn new(id: i32) -> Self {
        Self(id)
    }

    pub const fn as_i32(&self) -> i32 {
        self.0
    }
}

/// スレッドID (Newtype)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Ord, PartialOrd)]
pub struct ThreadId(i32);

impl ThreadId {
    pub const fn new(id: i32) -> Self {
        Self(id)
    }

    pub const fn as_i32(&self) -> i32 {
        self.0
    }
}

/// 最低のI/O優先度（新規オーナーの初期値）
pub const IDLE_PRIORITY: i32 = 0;
/// 通常のI/O優先度
pub const NORMAL_PRIORITY: i32 = 10;
/// 最高のI/O優先度
pub const MAX_PRIORITY: i32 = 120;

/// スケジューラから見たスレッド情報の提供者
pub trait ThreadRegistry: Send + Sync {
    /// 同時に存在しうる最大スレッド数（オーナーアリーナのサイズ）
    fn max_threads(&self) -> usize;

    /// 現在のI/O優先度（スレッドが存在しなければ None）
    fn io_priority(&self, thread: ThreadId) -> Option<i32>;

    /// スレッドがまだ生存しているか
    fn is_alive(&self, thread: ThreadId) -> bool;
}

/// スレッドエントリ
#[derive(Debug, Clone, Copy)]
struct ThreadEntry {
    team: TeamId,
    io_priority: i32,
}

/// ハッシュテーブルによる `ThreadRegistry` 実装
pub struct ThreadTable {
    max_threads: usize,
    threads: RwLock<HashMap<ThreadId, ThreadEntry>>,
}

impl ThreadTable {
    pub fn new(max_threads: usize) -> Self {
        Self {
            max_threads,
            threads: RwLock::new(HashMap::with_capacity(max_threads)),
        }
    }

    /// スレッドを登録（既存なら上書き）
    pub fn register(&self, thread: ThreadId, team: TeamId, io_priority: i32) {
        self.threads
            .write()
            .insert(thread, ThreadEntry { team, io_priority });
    }

    /// I/O優先度を変更
    pub fn set_io_priority(&self, thread: ThreadId, io_priority: i32) -> bool {
        match self.threads.write().get_mut(&thread) {
            Some(entry) => {
                entry.io_priority = io_priority.clamp(IDLE_PRIORITY, MAX_PRIORITY);
                true
            }
            None => false,
        }
    }

    /// スレッド終了
    pub fn exit(&self, thread: ThreadId) {
        self.threads.write().remove(&thread);
    }

    /// 所属チーム
    pub fn team_of(&self, thread: ThreadId) -> Option<TeamId> {
        self.threads.read().get(&thread).map(|e| e.team)
    }

    pub fn thread_count(&self) -> usize {
        self.threads.read().len()
    }
}

impl ThreadRegistry for ThreadTable {
    fn max_threads(&self) -> usize {
        self.max_threads
    }

    fn io_priority(&self, thread: ThreadId) -> Option<i32> {
        self.threads.read().get(&thread).map(|e| e.io_priority)
    }

    fn is_alive(&self, thread: ThreadId) -> bool {
        self.threads.read().contains_key(&thread)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_thread_table_lifecycle() {
        let table = ThreadTable::new(8);
        let thread = ThreadId::new(42);

        assert!(!table.is_alive(thread));
        table.register(thread, TeamId::new(7), NORMAL_PRIORITY);
        assert!(table.is_alive(thread));
        assert_eq!(table.io_priority(thread), Some(NORMAL_PRIORITY));
        assert_eq!(table.team_of(thread), Some(TeamId::new(7)));

        assert!(table.set_io_priority(thread, 500));
        assert_eq!(table.io_priority(thread), Some(MAX_PRIORITY));

        table.exit(thread);
        assert!(!table.is_alive(thread));
        assert_eq!(table.io_priority(thread), None);
        assert!(!table.set_io_priority(thread, 1));
    }
}
