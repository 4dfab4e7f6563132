// ============================================================================
// src/sync/mod.rs - 同期プリミティブ
// 割り込み安全なロック機構と、メモリ確保を伴わないアリーナ型リスト
// ============================================================================

pub mod condition;
pub mod index_list;
pub mod irq_mutex;

pub use condition::{ConditionVariable, ConditionVariableEntry};
pub use index_list::{IndexList, Link};
pub use irq_mutex::{IrqMutex, IrqMutexGuard};
