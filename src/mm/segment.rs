// ============================================================================
// src/mm/segment.rs - セグメントアロケータ
//
// DMAバッファのバッキングストアとなる物理連続ページ群を確保する。
// 実デバイスでは GART/PCI/AGP 資源から切り出すため SegmentSource を
// トレイト境界とし、本クレートには所有メモリで裏打ちし安定したバス
// アドレスを合成する RamSegments を備える。プロセス空間へのマッピングは
// 外部協調者の仕事であり、ここではオフセットとバスアドレスのみ公表する。
// ============================================================================
#![allow(dead_code)]

use alloc::boxed::Box;
use alloc::vec;
use core::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use crate::error::{DrmError, ResourceError};

/// 4KiB ページサイズ
pub const PAGE_SIZE: usize = 4096;

/// 物理連続ページ群1つ分
#[derive(Debug)]
pub struct Segment {
    /// デバイス内アパーチャでのバイトオフセット
    offset: usize,
    /// バス（物理）アドレス
    bus_address: u64,
    /// セグメント長（PAGE_SIZE << page_order）
    size: usize,
    /// ページオーダー（2^page_order ページ）
    page_order: u8,
    /// 裏打ちメモリ。寿命の間バスアドレスを安定させる
    backing: Box<[u8]>,
}

impl Segment {
    #[inline]
    pub fn offset(&self) -> usize {
        self.offset
    }

    #[inline]
    pub fn bus_address(&self) -> u64 {
        self.bus_address
    }

    #[inline]
    pub fn size(&self) -> usize {
        self.size
    }

    #[inline]
    pub fn page_order(&self) -> u8 {
        self.page_order
    }

    /// セグメントに含まれるページ数
    #[inline]
    pub fn page_count(&self) -> usize {
        1usize << self.page_order
    }
}

/// 物理連続ページ群の供給源
pub trait SegmentSource: Send + Sync {
    /// 2^page_order ページの連続領域を1つ確保する
    fn alloc(&self, page_order: u8) -> Result<Segment, DrmError>;
}

/// RAM裏打ちのセグメント供給源
///
/// バスアドレスは固定基底からの通し割り当てで合成する（ページ境界整列）。
/// テストおよびマッピング層を持たない組み込み構成向け。
pub struct RamSegments {
    next_offset: AtomicUsize,
    bus_base: AtomicU64,
}

/// 合成バスアドレスの既定基底
const DEFAULT_BUS_BASE: u64 = 0x1000_0000;

impl RamSegments {
    pub const fn new() -> Self {
        Self {
            next_offset: AtomicUsize::new(0),
            bus_base: AtomicU64::new(DEFAULT_BUS_BASE),
        }
    }
}

impl Default for RamSegments {
    fn default() -> Self {
        Self::new()
    }
}

impl SegmentSource for RamSegments {
    fn alloc(&self, page_order: u8) -> Result<Segment, DrmError> {
        // usizeのシフト幅を超える要求は供給不能
        if page_order as u32 >= usize::BITS - 13 {
            return Err(DrmError::Resource(ResourceError::NoSegments));
        }
        let size = PAGE_SIZE << page_order;
        let offset = self.next_offset.fetch_add(size, Ordering::AcqRel);
        let bus = self.bus_base.load(Ordering::Acquire) + offset as u64;

        let backing = vec![0u8; size].into_boxed_slice();
        Ok(Segment {
            offset,
            bus_address: bus,
            size,
            page_order,
            backing,
        })
    }
}
