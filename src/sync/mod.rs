// ============================================================================
// src/sync/mod.rs - 同期プリミティブ
// 転送完了を待つスレッドと割り込みハンドラの間の待ち合わせ
// ============================================================================

pub mod wait_queue;

#[allow(unused_imports)]
pub use wait_queue::{Parker, WaitQueue};
