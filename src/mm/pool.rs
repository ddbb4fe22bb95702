// ============================================================================
// src/mm/pool.rs - サイズクラス別バッファプールとフリーリスト
//
// プールは2冪サイズクラス（オーダー）ごとに最大1つ。生成時にセグメントを
// 確保して固定本数のバッファへ切り出し、大域インデックスを前プールの
// 続きから振り、全量をフリーリストへ投入する。
//
// フリーリストはLIFO（直近解放を先に返す。キャッシュ局所性のための方針で
// あって契約ではない）。ブロッキング取得は put か終了処理で起床し、
// ウォーターマークヒステリシスにより低水位際でのスラッシングを避ける。
// ============================================================================
#![allow(dead_code)]

use alloc::sync::Arc;
use alloc::vec::Vec;

use crate::error::{DrmError, InvalidKind, ResourceError};
use crate::mm::buffer::{Buffer, BufferIndex, BufState};
use crate::mm::segment::{Segment, SegmentSource, PAGE_SIZE};
use crate::process::TaskContext;
use crate::sync::WaitQueue;

/// 対応する最小オーダー（2^5 = 32バイト）
pub const MIN_ORDER: u8 = 5;
/// 対応する最大オーダー（2^22 = 4MiB）
pub const MAX_ORDER: u8 = 22;
/// プール1つあたりのバッファ本数上限
pub const MAX_BUF_COUNT: usize = 4096;

/// size バイト以上を収める最小の2冪オーダーを返す
pub fn order_of(size: usize) -> Result<u8, DrmError> {
    if size == 0 {
        return Err(DrmError::InvalidArgument(InvalidKind::Size));
    }
    let order = (usize::BITS - (size - 1).leading_zeros()) as u8;
    // size == 1 のとき order 0
    Ok(if size == 1 { 0 } else { order })
}

/// フリーリスト内部状態（スピンロック下でのみ触る）
#[derive(Debug)]
struct FreeInner {
    initialized: bool,
    /// スタック上のバッファ本数。不変条件: count == stack.len()
    count: usize,
    /// seed時の全量（整合性検査用）
    capacity: usize,
    low_mark: usize,
    high_mark: usize,
    /// 高水位待ち（waiting-for-high）。低水位到達後、回復まで取得を保留
    wfh: bool,
    /// ドライバ終了処理中
    shutdown: bool,
    /// LIFOスタック
    stack: Vec<Arc<Buffer>>,
}

/// ウォーターマーク付きブロッキングフリーリスト
#[derive(Debug)]
pub struct Freelist {
    inner: spin::Mutex<FreeInner>,
    waiters: WaitQueue,
}

impl Freelist {
    pub const fn new() -> Self {
        Self {
            inner: spin::Mutex::new(FreeInner {
                initialized: false,
                count: 0,
                capacity: 0,
                low_mark: 0,
                high_mark: 0,
                wfh: false,
                shutdown: false,
                stack: Vec::new(),
            }),
            waiters: WaitQueue::new(),
        }
    }

    /// プール生成時に全バッファを投入する（一度だけ）
    pub fn seed(&self, buffers: &[Arc<Buffer>]) -> Result<(), DrmError> {
        let mut inner = self.inner.lock();
        if inner.initialized {
            return Err(DrmError::Resource(ResourceError::OrderInUse));
        }
        inner.initialized = true;
        inner.capacity = buffers.len();
        inner.count = buffers.len();
        inner.stack.reserve_exact(buffers.len());
        for buf in buffers {
            buf.set_state(BufState::Free);
            inner.stack.push(buf.clone());
        }
        Ok(())
    }

    /// 現在の空き本数
    pub fn count(&self) -> usize {
        self.inner.lock().count
    }

    /// 低/高ウォーターマークを設定
    pub fn set_marks(&self, low: usize, high: usize) -> Result<(), DrmError> {
        let mut inner = self.inner.lock();
        if low > high || high > inner.capacity {
            return Err(DrmError::InvalidArgument(InvalidKind::Watermark));
        }
        inner.low_mark = low;
        inner.high_mark = high;
        Ok(())
    }

    pub fn marks(&self) -> (usize, usize) {
        let inner = self.inner.lock();
        (inner.low_mark, inner.high_mark)
    }

    /// 先頭バッファを取り出す
    ///
    /// 空で `block == false` のときは Exhausted を返す。これはエラーという
    /// より「出払い」の通知で、複数サイズクラスを順に探るDMA要求経路が
    /// この区別に依存している。`block == true` なら put か終了処理まで
    /// 割り込み可能に眠る。
    pub fn get(&self, task: &TaskContext, block: bool) -> Result<Arc<Buffer>, DrmError> {
        {
            let mut inner = self.inner.lock();
            if inner.shutdown {
                return Err(DrmError::Resource(ResourceError::Busy));
            }
            // 低水位到達でヒステリシスを張る（high_mark設定時のみ）
            if inner.high_mark > 0 && inner.count <= inner.low_mark {
                inner.wfh = true;
            }
            if !inner.wfh {
                if let Some(buf) = inner.stack.pop() {
                    inner.count -= 1;
                    buf.set_state(BufState::None);
                    return Ok(buf);
                }
            }
            if !block {
                return Err(DrmError::Resource(ResourceError::Exhausted));
            }
        }

        let mut got: Option<Arc<Buffer>> = None;
        self.waiters.wait_until(task, || {
            let mut inner = self.inner.lock();
            if inner.shutdown {
                return Err(DrmError::Resource(ResourceError::Busy));
            }
            if !inner.wfh {
                if let Some(buf) = inner.stack.pop() {
                    inner.count -= 1;
                    buf.set_state(BufState::None);
                    got = Some(buf);
                    return Ok(true);
                }
            }
            Ok(false)
        })?;
        got.ok_or(DrmError::Resource(ResourceError::Exhausted))
    }

    /// バッファを先頭へ返却し、待機者がいれば1名だけ起こす
    pub fn put(&self, buf: Arc<Buffer>) {
        {
            let mut inner = self.inner.lock();
            if inner.count + 1 > inner.capacity {
                // 整合性異常: 解放数が割り当て数を超過。可用性優先でログのみ
                log::error!(
                    "freelist: free count {} exceeds allocation {} (buffer {})",
                    inner.count + 1,
                    inner.capacity,
                    buf.index().as_raw()
                );
            }
            buf.set_owner(None);
            buf.set_context(None);
            buf.clear_flags();
            buf.set_state(BufState::Free);
            inner.stack.push(buf);
            inner.count += 1;
            if inner.wfh && inner.count >= inner.high_mark {
                inner.wfh = false;
            }
        }
        self.waiters.wake_one();
    }

    /// ドライバ終了: 以後の取得を拒否し、全待機者をエラー起床させる
    pub fn shutdown(&self) {
        self.inner.lock().shutdown = true;
        self.waiters.wake_all();
    }

    /// 現在フリーリスト上にあるバッファのインデックス一覧（診断用）
    pub fn snapshot(&self) -> Vec<BufferIndex> {
        self.inner
            .lock()
            .stack
            .iter()
            .map(|b| b.index())
            .collect()
    }
}

impl Default for Freelist {
    fn default() -> Self {
        Self::new()
    }
}

/// サイズクラス1つ分のバッファプール
#[derive(Debug)]
pub struct BufferPool {
    order: u8,
    /// バッファ1本の実効長（ページ整列時はページ倍数へ切り上げ）
    buf_size: usize,
    buf_count: usize,
    page_order: u8,
    buffers: Vec<Arc<Buffer>>,
    segments: Vec<Segment>,
    freelist: Freelist,
}

impl BufferPool {
    /// プールを生成してフリーリストへ全量投入する
    ///
    /// インデックスは `start_index` から連番。オーダー範囲と本数上限の
    /// 検査は済んでいる前提ではなく、ここでも拒否する。
    pub fn new(
        order: u8,
        count: usize,
        page_align: bool,
        source: &dyn SegmentSource,
        start_index: u32,
    ) -> Result<Self, DrmError> {
        if !(MIN_ORDER..=MAX_ORDER).contains(&order) {
            return Err(DrmError::InvalidArgument(InvalidKind::Order));
        }
        if count == 0 || count > MAX_BUF_COUNT {
            return Err(DrmError::InvalidArgument(InvalidKind::Count));
        }

        let size = 1usize << order;
        let stride = if page_align {
            size.div_ceil(PAGE_SIZE) * PAGE_SIZE
        } else {
            size
        };

        // セグメントは少なくともバッファ1本を収める大きさ
        let seg_size = stride.max(PAGE_SIZE);
        let page_order = (seg_size / PAGE_SIZE).trailing_zeros() as u8;
        let per_segment = seg_size / stride;

        let mut buffers = Vec::with_capacity(count);
        let mut segments = Vec::new();
        while buffers.len() < count {
            let seg = source.alloc(page_order)?;
            for k in 0..per_segment {
                if buffers.len() == count {
                    break;
                }
                let idx = BufferIndex::new(start_index + buffers.len() as u32);
                buffers.push(Arc::new(Buffer::new(
                    idx,
                    stride,
                    order,
                    seg.offset() + k * stride,
                    seg.bus_address() + (k * stride) as u64,
                )));
            }
            segments.push(seg);
        }

        let freelist = Freelist::new();
        freelist.seed(&buffers)?;

        Ok(Self {
            order,
            buf_size: stride,
            buf_count: count,
            page_order,
            buffers,
            segments,
            freelist,
        })
    }

    #[inline]
    pub fn order(&self) -> u8 {
        self.order
    }

    #[inline]
    pub fn buf_size(&self) -> usize {
        self.buf_size
    }

    #[inline]
    pub fn buf_count(&self) -> usize {
        self.buf_count
    }

    #[inline]
    pub fn page_order(&self) -> u8 {
        self.page_order
    }

    #[inline]
    pub fn buffers(&self) -> &[Arc<Buffer>] {
        &self.buffers
    }

    #[inline]
    pub fn segments(&self) -> &[Segment] {
        &self.segments
    }

    #[inline]
    pub fn freelist(&self) -> &Freelist {
        &self.freelist
    }

    /// プール全体のバイト数
    pub fn byte_count(&self) -> usize {
        self.buf_size * self.buf_count
    }

    /// プール全体のページ数
    pub fn page_count(&self) -> usize {
        self.segments.iter().map(Segment::page_count).sum()
    }
}
