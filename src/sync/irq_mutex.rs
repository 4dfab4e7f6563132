// ============================================================================
// src/sync/irq_mutex.rs - 割り込み禁止Mutex
//
// 問題: 通常のMutexはロック中でも割り込みを許可する
// → 割り込みハンドラが同じロックを取ろうとするとデッドロック
//
// 解決: ロック取得時に割り込みを禁止し、解放時に元の状態へ復元する
//       （ベアメタルx86_64のみ。ホスト環境ではハードウェア割り込みが
//        存在しないため純粋なスピンロックとして振る舞う）
//
// 参考: Linux の spin_lock_irqsave / spin_unlock_irqrestore
// ============================================================================

use core::cell::UnsafeCell;
use core::ops::{Deref, DerefMut};
use core::sync::atomic::{AtomicBool, Ordering};

#[cfg(all(target_arch = "x86_64", target_os = "none"))]
mod arch {
    use x86_64::instructions::interrupts;

    /// 割り込みフラグを保存して割り込みを禁止
    ///
    /// # Returns
    /// 元の割り込み有効状態 (true = 有効だった)
    #[inline]
    pub fn save_and_disable_interrupts() -> bool {
        let was_enabled = interrupts::are_enabled();
        interrupts::disable();
        was_enabled
    }

    /// 割り込みを復元（元々有効だった場合のみ有効化）
    #[inline]
    pub fn restore_interrupts(was_enabled: bool) {
        if was_enabled {
            interrupts::enable();
        }
    }
}

#[cfg(not(all(target_arch = "x86_64", target_os = "none")))]
mod arch {
    #[inline]
    pub fn save_and_disable_interrupts() -> bool {
        false
    }

    #[inline]
    pub fn restore_interrupts(_was_enabled: bool) {}
}

/// 割り込み禁止Mutex
///
/// ロック取得時に自動的に割り込みを禁止し、
/// ロック解放時に元の状態に復元する。
///
/// # Usage
/// ```
/// use rany_iosched::sync::IrqMutex;
///
/// let data = IrqMutex::new(0u64);
/// {
///     let mut guard = data.lock();
///     *guard += 1;
///     // guard がドロップされると割り込みが復元される
/// }
/// assert_eq!(*data.lock(), 1);
/// ```
///
/// # 割り込みハンドラからの使用
/// このMutexのクリティカルセクション内でブロックしてはならない。
/// 待機・メモリ確保・他のスリープ可能なロックの取得は禁止。
pub struct IrqMutex<T: ?Sized> {
    /// スピンロック本体
    locked: AtomicBool,
    /// 保護されるデータ
    data: UnsafeCell<T>,
}

// SAFETY: IrqMutex は排他的アクセスを保証する
unsafe impl<T: ?Sized + Send> Sync for IrqMutex<T> {}
unsafe impl<T: ?Sized + Send> Send for IrqMutex<T> {}

impl<T> IrqMutex<T> {
    /// 新しい IrqMutex を作成
    pub const fn new(data: T) -> Self {
        Self {
            locked: AtomicBool::new(false),
            data: UnsafeCell::new(data),
        }
    }
}

impl<T: ?Sized> IrqMutex<T> {
    /// ロックを取得
    ///
    /// 割り込みを禁止してからスピンロックを取得する。
    /// ガードがドロップされると自動的に割り込みが復元される。
    pub fn lock(&self) -> IrqMutexGuard<'_, T> {
        // 1. 割り込みを禁止（現在の状態を保存）
        let irq_was_enabled = arch::save_and_disable_interrupts();

        // 2. スピンロックを取得
        while self
            .locked
            .compare_exchange_weak(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            while self.locked.load(Ordering::Relaxed) {
                core::hint::spin_loop();
            }
        }

        IrqMutexGuard {
            lock: self,
            irq_was_enabled,
        }
    }

    /// ロックを試行（失敗したら即座に返る）
    pub fn try_lock(&self) -> Option<IrqMutexGuard<'_, T>> {
        let irq_was_enabled = arch::save_and_disable_interrupts();

        if self
            .locked
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
        {
            Some(IrqMutexGuard {
                lock: self,
                irq_was_enabled,
            })
        } else {
            // ロック失敗 → 割り込みを復元
            arch::restore_interrupts(irq_was_enabled);
            None
        }
    }

    /// ロック状態を確認（デバッグ用）
    pub fn is_locked(&self) -> bool {
        self.locked.load(Ordering::Relaxed)
    }
}

impl<T: Default> Default for IrqMutex<T> {
    fn default() -> Self {
        Self::new(T::default())
    }
}

/// IrqMutex のガード
///
/// ドロップ時にロックを解放し、割り込み状態を復元する。
pub struct IrqMutexGuard<'a, T: ?Sized> {
    lock: &'a IrqMutex<T>,
    irq_was_enabled: bool,
}

impl<T: ?Sized> Deref for IrqMutexGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        // SAFETY: ロックを保持しているので安全にアクセス可能
        unsafe { &*self.lock.data.get() }
    }
}

impl<T: ?Sized> DerefMut for IrqMutexGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        // SAFETY: ロックを保持しているので安全にアクセス可能
        unsafe { &mut *self.lock.data.get() }
    }
}

impl<T: ?Sized> Drop for IrqMutexGuard<'_, T> {
    fn drop(&mut self) {
        // 1. スピンロックを解放
        self.lock.locked.store(false, Ordering::Release);

        // 2. 割り込み状態を復元
        arch::restore_interrupts(self.irq_was_enabled);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_irq_mutex_basic() {
        let mutex = IrqMutex::new(42u64);

        {
            let mut guard = mutex.lock();
            assert_eq!(*guard, 42);
            *guard = 100;
        }

        {
            let guard = mutex.lock();
            assert_eq!(*guard, 100);
        }
    }

    #[test]
    fn test_try_lock() {
        let mutex = IrqMutex::new(0u64);

        let guard = mutex.lock();
        assert!(mutex.try_lock().is_none()); // 既にロック中
        assert!(mutex.is_locked());
        drop(guard);

        assert!(mutex.try_lock().is_some()); // 解放後は取得可能
    }

    #[test]
    fn test_contended_increments() {
        let mutex = Arc::new(IrqMutex::new(0u64));
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let mutex = mutex.clone();
                thread::spawn(move || {
                    for _ in 0..1000 {
                        *mutex.lock() += 1;
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(*mutex.lock(), 4000);
    }
}
