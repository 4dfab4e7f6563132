// ============================================================================
// src/sync/condition.rs - 割り込み安全な条件変数
// ============================================================================
//!
//! # ConditionVariable
//!
//! 待機者はまず述語を保護するロックを保持したまま `add()` で自分を登録し、
//! ロックを解放してから `wait()` する。登録から待機までの間に
//! `notify_all()` されても起床は失われない（アンパークトークンが残る）。
//!
//! `notify_all()` はブロックもメモリ確保もしないため、
//! `IrqMutex` を保持した割り込み文脈から呼び出せる。
//!
//! 待機は中断可能で、偽の起床がありうる。呼び出し側は必ずループで
//! 状態を再確認すること。

use std::thread::{self, Thread};
use std::time::Duration;

use super::irq_mutex::IrqMutex;

/// 事前に確保する待機者スロット数
const INITIAL_WAITER_CAPACITY: usize = 4;

/// 割り込み安全な条件変数
pub struct ConditionVariable {
    /// デバッグ用の名前
    name: &'static str,
    /// 登録済み待機スレッド
    waiters: IrqMutex<Vec<Thread>>,
}

impl ConditionVariable {
    /// 新しい条件変数を作成
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            waiters: IrqMutex::new(Vec::with_capacity(INITIAL_WAITER_CAPACITY)),
        }
    }

    /// 名前を取得
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// 現在のスレッドを待機者として登録
    pub fn add(&self) -> ConditionVariableEntry<'_> {
        let current = thread::current();
        {
            let mut waiters = self.waiters.lock();
            if !waiters.iter().any(|t| t.id() == current.id()) {
                waiters.push(current.clone());
            }
        }
        ConditionVariableEntry {
            condition: self,
            thread: current,
        }
    }

    /// 登録済みの全待機者を起床
    pub fn notify_all(&self) {
        let mut waiters = self.waiters.lock();
        for waiter in waiters.drain(..) {
            waiter.unpark();
        }
    }

    /// 登録済み待機者数
    pub fn waiter_count(&self) -> usize {
        self.waiters.lock().len()
    }
}

impl core::fmt::Debug for ConditionVariable {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("ConditionVariable")
            .field("name", &self.name)
            .field("waiters", &self.waiter_count())
            .finish()
    }
}

/// 条件変数への登録エントリ
///
/// ドロップ時に（まだ残っていれば）登録を解除する。
pub struct ConditionVariableEntry<'a> {
    condition: &'a ConditionVariable,
    thread: Thread,
}

impl ConditionVariableEntry<'_> {
    /// 通知されるまで待機（偽の起床あり）
    pub fn wait(self) {
        thread::park();
    }

    /// タイムアウト付き待機（偽の起床あり）
    pub fn wait_timeout(self, timeout: Duration) {
        thread::park_timeout(timeout);
    }
}

impl Drop for ConditionVariableEntry<'_> {
    fn drop(&mut self) {
        let id = self.thread.id();
        self.condition.waiters.lock().retain(|t| t.id() != id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, Ordering};

    #[test]
    fn test_notify_before_wait_is_not_lost() {
        let cond = ConditionVariable::new("test");
        let entry = cond.add();
        assert_eq!(cond.waiter_count(), 1);
        cond.notify_all();
        // トークンが残っているので即座に戻る
        entry.wait();
        assert_eq!(cond.waiter_count(), 0);
    }

    #[test]
    fn test_entry_drop_unregisters() {
        let cond = ConditionVariable::new("test");
        {
            let _entry = cond.add();
            let _again = cond.add();
            assert_eq!(cond.waiter_count(), 1);
        }
        assert_eq!(cond.waiter_count(), 0);
    }

    #[test]
    fn test_cross_thread_wakeup() {
        let cond = Arc::new(ConditionVariable::new("test"));
        let flag = Arc::new(AtomicBool::new(false));

        let waiter = {
            let cond = cond.clone();
            let flag = flag.clone();
            thread::spawn(move || {
                while !flag.load(Ordering::Acquire) {
                    let entry = cond.add();
                    if flag.load(Ordering::Acquire) {
                        break;
                    }
                    entry.wait();
                }
            })
        };

        flag.store(true, Ordering::Release);
        cond.notify_all();
        waiter.join().unwrap();
    }
}
