// ============================================================================
// src/mm/mod.rs - DMAバッファのメモリ管理
//
// - segment: 物理連続ページ群（バッキングストア）の確保
// - buffer:  バッファ本体と所有権トラッカ（状態/所有プロセス）
// - pool:    サイズクラス別プールとウォーターマーク付きフリーリスト
// ============================================================================

pub mod buffer;
pub mod pool;
pub mod segment;

pub use buffer::{BufFlags, BufState, Buffer, BufferIndex};
pub use pool::{BufferPool, Freelist, order_of, MAX_BUF_COUNT, MAX_ORDER, MIN_ORDER};
pub use segment::{RamSegments, Segment, SegmentSource, PAGE_SIZE};
