// ============================================================================
// src/mm/buffer.rs - DMAバッファと所有権トラッカ
//
// バッファはプール初期化時に一度だけ生成され、ドライバ終了まで破棄され
// ない。どの瞬間も所有者は次のうち厳密に1つ:
//   サイズクラスのフリーリスト / いずれかのコンテキストのWaitlist /
//   ハードウェアで実行中（in flight）
// 可変フィールド（状態・所有pid・フラグ・所属コンテキスト）はatomicで、
// 遷移そのものはフリーリスト/Waitlistのスピンロック下で行われる。
// ============================================================================
#![allow(dead_code)]

use core::sync::atomic::{AtomicU8, AtomicU32, Ordering};

use bitflags::bitflags;

use crate::process::ProcessId;

/// デバイス全サイズクラスを貫く大域バッファインデックス（Newtype）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Ord, PartialOrd)]
pub struct BufferIndex(u32);

impl BufferIndex {
    #[inline]
    pub const fn new(raw: u32) -> Self {
        Self(raw)
    }

    #[inline]
    pub const fn as_raw(self) -> u32 {
        self.0
    }

    #[inline]
    pub const fn as_usize(self) -> usize {
        self.0 as usize
    }
}

/// バッファの所在状態
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum BufState {
    /// どのリストにも属さない（プロセスへ貸与中）
    None = 0,
    /// フリーリスト上
    Free = 1,
    /// Waitlist上（ディスパッチ待ち）
    Wait = 2,
    /// ハードウェアへ送出済み（in flight）
    Pend = 3,
    /// 優先送出予約
    Prio = 4,
    /// 所有プロセス消滅。完了イベントで回収する
    Reclaim = 5,
}

impl BufState {
    fn from_raw(raw: u8) -> Self {
        match raw {
            1 => Self::Free,
            2 => Self::Wait,
            3 => Self::Pend,
            4 => Self::Prio,
            5 => Self::Reclaim,
            _ => Self::None,
        }
    }
}

bitflags! {
    /// バッファ状態の補助フラグ
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct BufFlags: u32 {
        /// Waitlistへ積まれている
        const WAITING      = 1 << 0;
        /// ハードウェア送出済み
        const PENDING      = 1 << 1;
        /// ハードウェアロック保持中に送出された
        const WHILE_LOCKED = 1 << 2;
    }
}

/// コンテキスト未所属を表す番兵値
pub const CTX_NONE: u32 = u32::MAX;

/// DMAバッファ1本
///
/// 不変フィールドは生成時に固定。所有権トラッカに相当する可変
/// フィールドのみatomic。
#[derive(Debug)]
pub struct Buffer {
    index: BufferIndex,
    /// バッファ総バイト数（ストライド）
    total: usize,
    /// 所属サイズクラスのオーダー
    order: u8,
    /// バッキングストア内バイトオフセット
    offset: usize,
    /// バスアドレス
    bus_address: u64,
    /// 所有プロセス（0 = 未所有）
    pid: AtomicU32,
    /// 所属コンテキスト（CTX_NONE = 未所属）
    context: AtomicU32,
    state: AtomicU8,
    flags: AtomicU32,
}

impl Buffer {
    pub fn new(
        index: BufferIndex,
        total: usize,
        order: u8,
        offset: usize,
        bus_address: u64,
    ) -> Self {
        Self {
            index,
            total,
            order,
            offset,
            bus_address,
            pid: AtomicU32::new(0),
            context: AtomicU32::new(CTX_NONE),
            state: AtomicU8::new(BufState::None as u8),
            flags: AtomicU32::new(0),
        }
    }

    #[inline]
    pub fn index(&self) -> BufferIndex {
        self.index
    }

    #[inline]
    pub fn total(&self) -> usize {
        self.total
    }

    #[inline]
    pub fn order(&self) -> u8 {
        self.order
    }

    #[inline]
    pub fn offset(&self) -> usize {
        self.offset
    }

    #[inline]
    pub fn bus_address(&self) -> u64 {
        self.bus_address
    }

    #[inline]
    pub fn state(&self) -> BufState {
        BufState::from_raw(self.state.load(Ordering::Acquire))
    }

    #[inline]
    pub fn set_state(&self, state: BufState) {
        self.state.store(state as u8, Ordering::Release);
    }

    /// 状態を比較交換で遷移させる。失敗時は現在の状態を返す
    pub fn transition(&self, from: BufState, to: BufState) -> Result<(), BufState> {
        self.state
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .map(|_| ())
            .map_err(BufState::from_raw)
    }

    #[inline]
    pub fn owner(&self) -> Option<ProcessId> {
        match self.pid.load(Ordering::Acquire) {
            0 => None,
            raw => Some(ProcessId::new(raw)),
        }
    }

    #[inline]
    pub fn set_owner(&self, pid: Option<ProcessId>) {
        self.pid
            .store(pid.map_or(0, ProcessId::as_raw), Ordering::Release);
    }

    #[inline]
    pub fn context(&self) -> Option<usize> {
        match self.context.load(Ordering::Acquire) {
            CTX_NONE => None,
            raw => Some(raw as usize),
        }
    }

    #[inline]
    pub fn set_context(&self, ctx: Option<usize>) {
        self.context
            .store(ctx.map_or(CTX_NONE, |c| c as u32), Ordering::Release);
    }

    #[inline]
    pub fn flags(&self) -> BufFlags {
        BufFlags::from_bits_truncate(self.flags.load(Ordering::Acquire))
    }

    #[inline]
    pub fn insert_flags(&self, flags: BufFlags) {
        self.flags.fetch_or(flags.bits(), Ordering::AcqRel);
    }

    #[inline]
    pub fn remove_flags(&self, flags: BufFlags) {
        self.flags.fetch_and(!flags.bits(), Ordering::AcqRel);
    }

    #[inline]
    pub fn clear_flags(&self) {
        self.flags.store(0, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_transitions() {
        let buf = Buffer::new(BufferIndex::new(3), 4096, 12, 0, 0x1000_0000);
        assert_eq!(buf.state(), BufState::None);

        buf.set_state(BufState::Free);
        assert!(buf.transition(BufState::Free, BufState::Wait).is_ok());
        // 既にWaitなのでFreeからの遷移は失敗し、現状態が返る
        assert_eq!(
            buf.transition(BufState::Free, BufState::Pend),
            Err(BufState::Wait)
        );
    }

    #[test]
    fn test_ownership_tracking() {
        let buf = Buffer::new(BufferIndex::new(0), 4096, 12, 0, 0);
        assert_eq!(buf.owner(), None);

        buf.set_owner(Some(ProcessId::new(77)));
        assert_eq!(buf.owner(), Some(ProcessId::new(77)));

        buf.set_owner(None);
        assert_eq!(buf.owner(), None);
    }

    #[test]
    fn test_flags() {
        let buf = Buffer::new(BufferIndex::new(0), 4096, 12, 0, 0);
        buf.insert_flags(BufFlags::WAITING);
        buf.insert_flags(BufFlags::WHILE_LOCKED);
        assert!(buf.flags().contains(BufFlags::WAITING));

        buf.remove_flags(BufFlags::WAITING);
        assert!(!buf.flags().contains(BufFlags::WAITING));
        assert!(buf.flags().contains(BufFlags::WHILE_LOCKED));
    }
}
