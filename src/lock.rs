// ============================================================================
// src/lock.rs - ハードウェアロック
//
// GPUへコマンドを送出する権利を与えるデバイス単位の排他トークン。
// 1ワードに 保持ビット / 競合ビット / 所有コンテキストID を詰め、
// 比較交換（CAS）だけで更新する。粗粒度ミューテックスの下では決して
// 触らないため、非競合時の獲得経路はロックフリーのまま。
//
// 状態機械: UNLOCKED → LOCKED(owner) → UNLOCKED
// - take:     1回のCAS試行。失敗時は競合ビットを立てて即座に戻る
// - transfer: 無条件で新所有者へ付け替え（クライアント→調停者の移行）
// - free:     保持確認と所有者照合の上でクリア。不一致は重大異常として
//             ログするが、カーネル常駐コアを道連れにはしない
// ============================================================================
#![allow(dead_code)]

use core::sync::atomic::{AtomicU32, Ordering};

use crate::error::{DrmError, OwnershipError};
use crate::process::{ProcessId, TaskContext};
use crate::sync::WaitQueue;

/// 保持ビット
pub const LOCK_HELD: u32 = 1 << 31;
/// 競合ビット（情報提供のみ。獲得失敗側が立てる）
pub const LOCK_CONT: u32 = 1 << 30;
/// 所有コンテキストIDのマスク
const LOCK_OWNER_MASK: u32 = !(LOCK_HELD | LOCK_CONT);

/// ロックワードから所有コンテキストIDを取り出す
#[inline]
const fn owner_of(word: u32) -> u32 {
    word & LOCK_OWNER_MASK
}

/// デバイス単位のハードウェア排他ロック
pub struct HardwareLock {
    word: AtomicU32,
    /// 最後にロックを取ったプロセス（解放権限の照合用）
    holder_pid: AtomicU32,
    waiters: WaitQueue,
}

impl HardwareLock {
    pub const fn new() -> Self {
        Self {
            word: AtomicU32::new(0),
            holder_pid: AtomicU32::new(0),
            waiters: WaitQueue::new(),
        }
    }

    /// 非ブロッキング獲得を1回だけ試みる
    ///
    /// 成功時 true。失敗時は（情報提供として）競合ビットを立てて false。
    pub fn take(&self, context: usize, pid: ProcessId) -> bool {
        let new = LOCK_HELD | (context as u32 & LOCK_OWNER_MASK);
        let mut current = self.word.load(Ordering::Acquire);
        loop {
            if current & LOCK_HELD != 0 {
                // 保持中。競合ビットを立てるだけ（失敗してもよいベストエフォート）
                let _ = self.word.compare_exchange_weak(
                    current,
                    current | LOCK_CONT,
                    Ordering::AcqRel,
                    Ordering::Acquire,
                );
                return false;
            }
            match self.word.compare_exchange_weak(
                current,
                new,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => {
                    self.holder_pid.store(pid.as_raw(), Ordering::Release);
                    return true;
                }
                Err(observed) => current = observed,
            }
        }
    }

    /// ブロッキング獲得
    ///
    /// take に失敗したらウェイトキューへ並び、割り込み可能に眠る。
    /// 保留中の終了シグナルは Interrupted で即座に巻き戻す（再試行しない）。
    pub fn take_blocking(
        &self,
        task: &TaskContext,
        context: usize,
    ) -> Result<(), DrmError> {
        if self.take(context, task.pid()) {
            return Ok(());
        }
        self.waiters
            .wait_until(task, || Ok(self.take(context, task.pid())))
    }

    /// 無条件で所有者を付け替える
    ///
    /// クライアントから特権調停者へ制御が戻る際に使う。競合ビットは
    /// 立てたまま渡す（切替要求が飛び交っている状況のため）。
    pub fn transfer(&self, context: usize, pid: ProcessId) {
        let new = LOCK_HELD | LOCK_CONT | (context as u32 & LOCK_OWNER_MASK);
        self.word.store(new, Ordering::Release);
        self.holder_pid.store(pid.as_raw(), Ordering::Release);
    }

    /// ロックを解放する
    ///
    /// 保持されていない、または記録された所有コンテキストが一致しない
    /// 場合は重大異常としてログし、状態は変えずに拒否する。
    pub fn free(&self, context: usize) -> Result<(), DrmError> {
        let mut current = self.word.load(Ordering::Acquire);
        loop {
            if current & LOCK_HELD == 0 {
                log::error!("hw lock: freeing unheld lock (ctx {context})");
                return Err(DrmError::Ownership(OwnershipError::LockNotHeld));
            }
            if owner_of(current) != context as u32 & LOCK_OWNER_MASK {
                log::error!(
                    "hw lock: free by ctx {} but held by ctx {}",
                    context,
                    owner_of(current)
                );
                return Err(DrmError::Ownership(OwnershipError::NotLockOwner));
            }
            match self.word.compare_exchange_weak(
                current,
                0,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => {
                    self.holder_pid.store(0, Ordering::Release);
                    self.waiters.wake_one();
                    return Ok(());
                }
                Err(observed) => current = observed,
            }
        }
    }

    #[inline]
    pub fn is_held(&self) -> bool {
        self.word.load(Ordering::Acquire) & LOCK_HELD != 0
    }

    #[inline]
    pub fn is_contended(&self) -> bool {
        self.word.load(Ordering::Acquire) & LOCK_CONT != 0
    }

    /// 現在の所有コンテキスト（保持中のみ）
    pub fn owner(&self) -> Option<usize> {
        let word = self.word.load(Ordering::Acquire);
        if word & LOCK_HELD != 0 {
            Some(owner_of(word) as usize)
        } else {
            None
        }
    }

    /// 最後に獲得したプロセス
    pub fn holder_pid(&self) -> Option<ProcessId> {
        match self.holder_pid.load(Ordering::Acquire) {
            0 => None,
            raw => Some(ProcessId::new(raw)),
        }
    }
}

impl Default for HardwareLock {
    fn default() -> Self {
        Self::new()
    }
}
