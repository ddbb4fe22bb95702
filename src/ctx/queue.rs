// ============================================================================
// src/ctx/queue.rs - ハードウェアコンテキスト（キュー）
//
// コンテキストはスケジューリング/所有権ドメインで、論理GPUコマンド
// ストリーム1本（おおよそクライアントのレンダターゲット1枚）に対応する。
//
// ライフサイクルは+1バイアス付き参照カウントで表す:
// - use_count == 0              : 空きスロット
// - use_count == 1              : 割り当て済み（保持者なし）
// - use_count >  1              : 外部保持中
// - finalization != 0           : 終了処理中。スケジューリングから除外
// 終了処理は use_count を2下げ（割り当てトークン+終了者の保持分）、
// 全保持者が解放し use_count ≤ 0 かつ finalization == 0 になった時点で
// スロットが再利用可能になる。
// ============================================================================
#![allow(dead_code)]

use core::sync::atomic::{AtomicI32, AtomicU32, Ordering};

use bitflags::bitflags;

use crate::ctx::waitlist::Waitlist;
use crate::sync::WaitQueue;

/// 特権調停プロセスが使う予約コンテキストID
pub const KERNEL_CONTEXT: usize = 0;

bitflags! {
    /// コンテキスト属性フラグ
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct CtxFlags: u32 {
        /// コンテキスト切り替え時にハードウェア状態を保存/復元する
        const PRESERVED = 1 << 0;
        /// 2D操作専用
        const ONLY_2D   = 1 << 1;
    }
}

/// ハードウェアコンテキスト1つ分
#[derive(Debug)]
pub struct HwContext {
    /// +1バイアス付き参照カウント。負値は終了処理直後の過渡状態
    use_count: AtomicI32,
    /// 終了処理カウンタ（非0の間はスケジューリング除外）
    finalization: AtomicU32,
    flags: AtomicU32,
    waitlist: Waitlist,
    /// ブロック中の読み手/書き手/フラッシュ待ちの起床先
    read_wait: WaitQueue,
    write_wait: WaitQueue,
    flush_wait: WaitQueue,
}

impl HwContext {
    /// 空きスロットとして生成
    pub fn new(waitlist_capacity: usize) -> Self {
        Self {
            use_count: AtomicI32::new(0),
            finalization: AtomicU32::new(0),
            flags: AtomicU32::new(0),
            waitlist: Waitlist::new(waitlist_capacity),
            read_wait: WaitQueue::new(),
            write_wait: WaitQueue::new(),
            flush_wait: WaitQueue::new(),
        }
    }

    /// 割り当て済みとして生成（表の拡張時、最初の1つを即時確保する）
    pub fn new_claimed(waitlist_capacity: usize) -> Self {
        let ctx = Self::new(waitlist_capacity);
        ctx.use_count.store(1, Ordering::Release);
        ctx
    }

    /// 空きスロットの楽観的確保を試みる
    ///
    /// 増分してから結果を検査し、外れなら巻き戻す（ロックフリー線形
    /// プローブ）。成功時のみ true。
    pub fn try_claim(&self) -> bool {
        let prev = self.use_count.fetch_add(1, Ordering::AcqRel);
        if prev == 0 && self.finalization.load(Ordering::Acquire) == 0 {
            true
        } else {
            self.use_count.fetch_sub(1, Ordering::AcqRel);
            false
        }
    }

    /// 外部保持（+1）。割り当て済みかつ終了処理中でない場合のみ成功
    pub fn hold(&self) -> bool {
        let prev = self.use_count.fetch_add(1, Ordering::AcqRel);
        if prev >= 1 && self.finalization.load(Ordering::Acquire) == 0 {
            true
        } else {
            self.use_count.fetch_sub(1, Ordering::AcqRel);
            false
        }
    }

    /// 保持を解放（−1）
    pub fn release(&self) {
        self.use_count.fetch_sub(1, Ordering::AcqRel);
    }

    #[inline]
    pub fn use_count(&self) -> i32 {
        self.use_count.load(Ordering::Acquire)
    }

    #[inline]
    pub fn is_allocated(&self) -> bool {
        self.use_count() >= 1 && !self.in_finalization()
    }

    #[inline]
    pub fn is_free_slot(&self) -> bool {
        self.use_count() <= 0 && !self.in_finalization()
    }

    #[inline]
    pub fn in_finalization(&self) -> bool {
        self.finalization.load(Ordering::Acquire) != 0
    }

    /// 終了処理の開始。割り当てトークンと終了者の保持分を一括で返す
    pub fn begin_finalize(&self) {
        self.finalization.fetch_add(1, Ordering::AcqRel);
        self.use_count.fetch_sub(2, Ordering::AcqRel);
    }

    /// 終了処理の完了
    pub fn end_finalize(&self) {
        self.finalization.fetch_sub(1, Ordering::AcqRel);
    }

    #[inline]
    pub fn waitlist(&self) -> &Waitlist {
        &self.waitlist
    }

    #[inline]
    pub fn read_wait(&self) -> &WaitQueue {
        &self.read_wait
    }

    #[inline]
    pub fn write_wait(&self) -> &WaitQueue {
        &self.write_wait
    }

    #[inline]
    pub fn flush_wait(&self) -> &WaitQueue {
        &self.flush_wait
    }

    #[inline]
    pub fn ctx_flags(&self) -> CtxFlags {
        CtxFlags::from_bits_truncate(self.flags.load(Ordering::Acquire))
    }

    #[inline]
    pub fn set_ctx_flags(&self, flags: CtxFlags) {
        self.flags.store(flags.bits(), Ordering::Release);
    }

    /// ディスパッチ可能な保留作業があるか
    #[inline]
    pub fn has_pending_work(&self) -> bool {
        !self.in_finalization() && !self.waitlist.is_empty()
    }
}
