// ============================================================================
// src/sync/mod.rs - 同期プリミティブ
// ドライバコア用のバックオフ戦略と割り込み可能ウェイトキュー
// ============================================================================

pub mod backoff;
pub mod wait_queue;

pub use backoff::Backoff;
pub use wait_queue::WaitQueue;
