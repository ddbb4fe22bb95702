//! 統一エラーハンドリングモジュール
//!
//! ドライバコア全体で使用される統一エラー型を定義します。
//! エラー分類は回復方針と対応します:
//! - 引数不正: 同期的に拒否、状態変化なし
//! - 資源枯渇: 引数不正とは区別して返却（呼び出し側がリトライや
//!   別サイズクラスの試行を行えるようにする）
//! - 所有権違反: 重大異常としてログした上で拒否（クラッシュさせない）
//! - 待機中断: リトライ不能な結果として区別（終了シグナル観測時）

use core::fmt;

/// ドライバコア全体の統一エラー型
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DrmError {
    /// 引数不正（状態変化なしで同期的に拒否）
    InvalidArgument(InvalidKind),
    /// 資源枯渇（リトライ/別サイズクラス試行が可能）
    Resource(ResourceError),
    /// 所有権違反（ログ済みの重大異常、拒否のみ）
    Ownership(OwnershipError),
    /// ブロッキング待機中に終了シグナルを観測（リトライ不能）
    Interrupted,
    /// 呼び出し元メモリとの引数コピー失敗
    BadAddress,
    /// 認証不足または特権不足
    PermissionDenied,
}

/// 引数不正の種類
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InvalidKind {
    /// サイズクラス（オーダー）が対応範囲外
    Order,
    /// バッファサイズ不正
    Size,
    /// バッファ数不正（0 または上限超過）
    Count,
    /// バッファインデックスが範囲外
    BufferIndex,
    /// コンテキストIDが範囲外または未割り当て
    ContextId,
    /// ウォーターマーク指定が不正
    Watermark,
    /// 未知のオペコード
    Opcode,
}

/// 資源枯渇エラーの種類
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceError {
    /// バッキングセグメントを確保できない
    NoSegments,
    /// フリーリストが空（非ブロッキング取得時）
    /// エラーというより「このサイズクラスは出払っている」の通知
    Exhausted,
    /// 同一オーダーのプールが既に存在する
    OrderInUse,
    /// バッファ使用開始後のプール作成、または保留作業中の構造変更
    Busy,
    /// コンテキスト表が拡張前の状態で満杯
    TableFull,
    /// 待機リスト溢れ（設計上発生しない。発生時は整合性異常）
    Overflow,
}

/// 所有権違反エラーの種類
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OwnershipError {
    /// 呼び出しプロセスが所有していないバッファの操作
    NotOwner,
    /// 滞留中・飛行中・返却済みバッファの送出または返却
    OnList,
    /// 保持されていないハードウェアロックの解放
    LockNotHeld,
    /// 記録された所有者と異なる者によるロック解放
    NotLockOwner,
}

impl fmt::Display for DrmError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidArgument(kind) => write!(f, "invalid argument: {kind}"),
            Self::Resource(kind) => write!(f, "resource: {kind}"),
            Self::Ownership(kind) => write!(f, "ownership violation: {kind}"),
            Self::Interrupted => write!(f, "interrupted by pending signal"),
            Self::BadAddress => write!(f, "bad address in argument transfer"),
            Self::PermissionDenied => write!(f, "permission denied"),
        }
    }
}

impl fmt::Display for InvalidKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Order => "order out of supported range",
            Self::Size => "bad buffer size",
            Self::Count => "bad buffer count",
            Self::BufferIndex => "buffer index out of range",
            Self::ContextId => "bad context id",
            Self::Watermark => "bad freelist watermark",
            Self::Opcode => "unknown opcode",
        };
        f.write_str(s)
    }
}

impl fmt::Display for ResourceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::NoSegments => "no backing segments available",
            Self::Exhausted => "freelist exhausted",
            Self::OrderInUse => "pool already exists for order",
            Self::Busy => "buffers in flight or in use",
            Self::TableFull => "context table full",
            Self::Overflow => "waitlist overflow",
        };
        f.write_str(s)
    }
}

impl fmt::Display for OwnershipError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::NotOwner => "buffer not owned by caller",
            Self::OnList => "buffer is on a list",
            Self::LockNotHeld => "hardware lock not held",
            Self::NotLockOwner => "hardware lock held by another owner",
        };
        f.write_str(s)
    }
}

impl DrmError {
    /// 資源枯渇（呼び出し側がリトライ可能）かどうか
    #[inline]
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::Resource(_))
    }

    /// フリーリスト枯渇（非エラーの「出払い」通知）かどうか
    #[inline]
    pub const fn is_exhausted(&self) -> bool {
        matches!(self, Self::Resource(ResourceError::Exhausted))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exhausted_is_distinct_from_invalid() {
        let exhausted = DrmError::Resource(ResourceError::Exhausted);
        let invalid = DrmError::InvalidArgument(InvalidKind::Count);

        assert!(exhausted.is_exhausted());
        assert!(exhausted.is_retryable());
        assert!(!invalid.is_retryable());
        assert_ne!(exhausted, invalid);
    }

    #[test]
    fn test_display_nonempty() {
        let errors = [
            DrmError::InvalidArgument(InvalidKind::Order),
            DrmError::Resource(ResourceError::Busy),
            DrmError::Ownership(OwnershipError::NotLockOwner),
            DrmError::Interrupted,
            DrmError::BadAddress,
            DrmError::PermissionDenied,
        ];
        for e in errors {
            assert!(!alloc::format!("{e}").is_empty());
        }
    }
}
