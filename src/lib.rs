// ============================================================================
// rany_iosched - Fair-share block I/O request scheduler
// ============================================================================
//!
//! ブロックデバイス向けI/Oスケジューラ。
//!
//! - `io::scheduler::IoSchedulerSimple`: オーナー単位の公平分配とエレベータ順ディスパッチ
//! - `io::scheduler::IoSchedulerRoster`: スケジューラ登録簿とイベント通知
//! - `io::scheduler::CompletionHandle`: 割り込み文脈からの完了報告
//!
//! ## 使用例
//! ```
//! use std::sync::Arc;
//! use rany_iosched::io::{IoOperation, IoRequest, PhysicalBuffer};
//! use rany_iosched::io::scheduler::{
//!     IoScheduler, IoSchedulerRoster, IoSchedulerSimple, SchedulerConfig,
//! };
//! use rany_iosched::task::ThreadTable;
//!
//! let roster = Arc::new(IoSchedulerRoster::new());
//! let threads = Arc::new(ThreadTable::new(16));
//! let scheduler =
//!     IoSchedulerSimple::init("disk0", roster, threads, None, SchedulerConfig::default()).unwrap();
//!
//! // 同期的に完了するドライバ
//! let handle = scheduler.completion_handle();
//! scheduler.set_callback(Arc::new(move |op: &Arc<IoOperation>| -> rany_iosched::IoStatus {
//!     handle.operation_completed(op, Ok(()), op.length());
//!     Ok(())
//! }));
//!
//! let request = Arc::new(IoRequest::new(0, 4096, false, Arc::new(PhysicalBuffer::new(4096))));
//! scheduler.schedule_request(request.clone()).unwrap();
//! assert_eq!(request.wait(), Ok(4096));
//! ```

extern crate alloc;

pub mod error;
pub mod io;
pub mod sync;
pub mod task;

pub use error::{IoError, IoStatus};
