// ============================================================================
// I/O Subsystem Module
// リクエスト・オペレーション・DMAリソースとスケジューラ
// ============================================================================
pub mod dma;
pub mod operation;
pub mod request;
pub mod scheduler;

pub use dma::{BlockDmaResource, DmaResource};
pub use operation::{IoOperation, OperationFlags, OperationPhase, OperationTransfer};
pub use request::{
    FinishedCallback, IoBuffer, IoRequest, IoRequestId, PhysicalBuffer, RequestFlags,
    VirtualBuffer,
};
