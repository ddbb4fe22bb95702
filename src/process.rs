// ============================================================================
// src/process.rs - 呼び出しプロセスの識別とシグナル状態
//
// デバイスハンドル1つにつき1本の実行パスが並行してリクエストを発行する。
// ブロッキング操作（フリーリスト取得、ハードウェアロック獲得、排出待ち）
// はすべて TaskContext を受け取り、保留中の終了シグナルを観測した時点で
// DrmError::Interrupted で巻き戻る。成功と区別された失敗にすることで、
// 呼び出し側が参照カウントを漏らさずに解放経路へ入れる。
// ============================================================================
#![allow(dead_code)]

use core::sync::atomic::{AtomicBool, Ordering};

/// プロセスID（Newtype）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Ord, PartialOrd)]
pub struct ProcessId(u32);

impl ProcessId {
    /// カーネル（調停プロセス以前の内部処理）を表す予約ID
    pub const KERNEL: Self = Self(0);

    #[inline]
    pub const fn new(raw: u32) -> Self {
        Self(raw)
    }

    #[inline]
    pub const fn as_raw(self) -> u32 {
        self.0
    }
}

/// リクエスト発行側の実行文脈
///
/// - `pid`: 発行プロセスの識別子。バッファ所有権の記録に使用
/// - `authenticated`: デバイスオープン後の認証完了フラグ
/// - `privileged`: 特権調停プロセスかどうか
/// - `signal_pending`: 終了シグナル到達フラグ。全ブロッキング点で監視
pub struct TaskContext {
    pid: ProcessId,
    authenticated: bool,
    privileged: bool,
    signal_pending: AtomicBool,
}

impl TaskContext {
    /// 認証済みの一般クライアント文脈を作成
    pub const fn new(pid: ProcessId) -> Self {
        Self {
            pid,
            authenticated: true,
            privileged: false,
            signal_pending: AtomicBool::new(false),
        }
    }

    /// 特権調停プロセスの文脈を作成
    pub const fn privileged(pid: ProcessId) -> Self {
        Self {
            pid,
            authenticated: true,
            privileged: true,
            signal_pending: AtomicBool::new(false),
        }
    }

    /// 未認証の文脈を作成（オープン直後など）
    pub const fn unauthenticated(pid: ProcessId) -> Self {
        Self {
            pid,
            authenticated: false,
            privileged: false,
            signal_pending: AtomicBool::new(false),
        }
    }

    #[inline]
    pub const fn pid(&self) -> ProcessId {
        self.pid
    }

    #[inline]
    pub const fn is_authenticated(&self) -> bool {
        self.authenticated
    }

    #[inline]
    pub const fn is_privileged(&self) -> bool {
        self.privileged
    }

    /// 終了シグナルが保留中か
    #[inline]
    pub fn signal_pending(&self) -> bool {
        self.signal_pending.load(Ordering::Acquire)
    }

    /// 終了シグナルを配達（テスト/埋め込み側のシグナル配送ハンドラが呼ぶ）
    #[inline]
    pub fn post_signal(&self) {
        self.signal_pending.store(true, Ordering::Release);
    }

    /// シグナル保留状態をクリア
    #[inline]
    pub fn clear_signal(&self) {
        self.signal_pending.store(false, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_signal_flag() {
        let task = TaskContext::new(ProcessId::new(42));
        assert!(!task.signal_pending());
        task.post_signal();
        assert!(task.signal_pending());
        task.clear_signal();
        assert!(!task.signal_pending());
    }

    #[test]
    fn test_privilege_flags() {
        let root = TaskContext::privileged(ProcessId::new(1));
        assert!(root.is_privileged());
        assert!(root.is_authenticated());

        let raw = TaskContext::unauthenticated(ProcessId::new(7));
        assert!(!raw.is_authenticated());
        assert!(!raw.is_privileged());
    }
}
