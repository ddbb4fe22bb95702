// ============================================================================
// src/dma/mod.rs - デバイス大域DMA状態とベンダ送出境界
//
// 全サイズクラスを貫く平坦なバッファ表、集計カウンタ、そして
// 「プール作成進行中」カウンタと粘着的な「バッファ使用開始」フラグを
// 保持する。buf_use が一度立つと以後のプール作成は恒久的に拒否される。
//
// 進行中カウンタと粘着フラグの読み書きはどちらもデバイスの構造
// ミューテックス下に置き、検査と作成を1つの臨界区間で行う
// （DESIGN.md参照）。
// ============================================================================
#![allow(dead_code)]

pub mod scheduler;

pub use scheduler::{Scheduler, Selection};

use alloc::sync::Arc;
use alloc::vec::Vec;

use crate::error::{DrmError, InvalidKind};
use crate::mm::buffer::{Buffer, BufferIndex};
use crate::mm::pool::{BufferPool, MAX_ORDER};

/// オーダー添字配列の長さ
pub const ORDER_SLOTS: usize = MAX_ORDER as usize + 1;

/// ベンダ固有のコマンド送出境界
///
/// ディスパッチャはバッファを1本ずつここへ渡す。符号化やリング書き込みは
/// 実装側の仕事で、完了は `Device::complete` の呼び戻しで知らせる。
pub trait DmaBackend: Send + Sync {
    /// バッファ1本をハードウェアへ送出する
    fn submit(&self, context: usize, buf: &Arc<Buffer>);

    /// 送出済みコマンドの静止を待つ（FINISH経路のフック）
    fn quiesce(&self) {}
}

/// 送出をログするだけの既定バックエンド
pub struct LogBackend;

impl DmaBackend for LogBackend {
    fn submit(&self, context: usize, buf: &Arc<Buffer>) {
        log::debug!(
            "dma: submit buffer {} (ctx {}, {} bytes at bus {:#x})",
            buf.index().as_raw(),
            context,
            buf.total(),
            buf.bus_address()
        );
    }
}

/// デバイス大域DMA状態（デバイスの構造ミューテックス下で変更する）
pub struct DmaState {
    /// オーダー添字のプール表。各オーダーにつき最大1つ
    pools: [Option<Arc<BufferPool>>; ORDER_SLOTS],
    /// 全サイズクラスを貫く平坦なバッファ表（大域インデックス順）
    buflist: Vec<Arc<Buffer>>,
    byte_count: usize,
    seg_count: usize,
    page_count: usize,
    /// プール作成進行中カウンタ
    buf_alloc: usize,
    /// バッファ使用開始の粘着フラグ。以後のプール作成を恒久拒否
    buf_use: bool,
}

impl DmaState {
    pub fn new() -> Self {
        Self {
            pools: core::array::from_fn(|_| None),
            buflist: Vec::new(),
            byte_count: 0,
            seg_count: 0,
            page_count: 0,
            buf_alloc: 0,
            buf_use: false,
        }
    }

    #[inline]
    pub fn pool(&self, order: u8) -> Option<&Arc<BufferPool>> {
        self.pools.get(order as usize).and_then(Option::as_ref)
    }

    /// 生成済みプールを登録し、バッファを平坦表へ連結する
    pub fn install_pool(&mut self, pool: Arc<BufferPool>) {
        let order = pool.order() as usize;
        self.byte_count += pool.byte_count();
        self.seg_count += pool.segments().len();
        self.page_count += pool.page_count();
        self.buflist.extend(pool.buffers().iter().cloned());
        self.pools[order] = Some(pool);
    }

    #[inline]
    pub fn buf_count(&self) -> usize {
        self.buflist.len()
    }

    #[inline]
    pub fn byte_count(&self) -> usize {
        self.byte_count
    }

    #[inline]
    pub fn seg_count(&self) -> usize {
        self.seg_count
    }

    #[inline]
    pub fn page_count(&self) -> usize {
        self.page_count
    }

    pub fn buffer(&self, index: BufferIndex) -> Result<Arc<Buffer>, DrmError> {
        self.buflist
            .get(index.as_usize())
            .cloned()
            .ok_or(DrmError::InvalidArgument(InvalidKind::BufferIndex))
    }

    #[inline]
    pub fn buffers(&self) -> &[Arc<Buffer>] {
        &self.buflist
    }

    #[inline]
    pub fn buf_use(&self) -> bool {
        self.buf_use
    }

    /// バッファ使用開始を記録する（以後戻せない）
    #[inline]
    pub fn mark_buf_use(&mut self) {
        self.buf_use = true;
    }

    #[inline]
    pub fn alloc_in_progress(&self) -> bool {
        self.buf_alloc > 0
    }

    #[inline]
    pub fn begin_alloc(&mut self) {
        self.buf_alloc += 1;
    }

    #[inline]
    pub fn end_alloc(&mut self) {
        if self.buf_alloc == 0 {
            // 整合性異常: 対応しないend。ログのみで続行
            log::error!("dma: unbalanced end_alloc");
            return;
        }
        self.buf_alloc -= 1;
    }

    /// 指定オーダー群のプールが存在するか
    pub fn orders_in_use(&self) -> Vec<u8> {
        self.pools
            .iter()
            .enumerate()
            .filter_map(|(o, p)| p.as_ref().map(|_| o as u8))
            .collect()
    }
}

impl Default for DmaState {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mm::pool::order_of;
    use crate::mm::segment::RamSegments;

    #[test]
    fn test_install_pool_aggregates() {
        let src = RamSegments::new();
        let mut state = DmaState::new();

        let p1 = Arc::new(BufferPool::new(order_of(4096).unwrap(), 4, false, &src, 0).unwrap());
        state.install_pool(p1);
        assert_eq!(state.buf_count(), 4);
        assert_eq!(state.byte_count(), 4 * 4096);

        let start = state.buf_count() as u32;
        let p2 = Arc::new(BufferPool::new(order_of(8192).unwrap(), 2, false, &src, start).unwrap());
        state.install_pool(p2);
        assert_eq!(state.buf_count(), 6);
        // 平坦表は大域インデックス順
        for (i, buf) in state.buffers().iter().enumerate() {
            assert_eq!(buf.index().as_usize(), i);
        }
    }

    #[test]
    fn test_buffer_lookup_bounds() {
        let state = DmaState::new();
        assert_eq!(
            state.buffer(BufferIndex::new(0)).unwrap_err(),
            DrmError::InvalidArgument(InvalidKind::BufferIndex)
        );
    }

    #[test]
    fn test_buf_use_is_sticky() {
        let mut state = DmaState::new();
        assert!(!state.buf_use());
        state.mark_buf_use();
        assert!(state.buf_use());
    }
}
