// ============================================================================
// src/sync/backoff.rs - 待機ループのスピン逓減
//
// WaitQueueの条件再確認ループが使う待機プリミティブ。再確認が外れる
// たびにスピン量を倍にし、上限到達後はホスト環境でスレッドを譲る
// （カーネル組み込みでは譲る先がないため純スピンに縮退する）。
// ============================================================================
#![allow(dead_code)]

/// スピン量の倍化をやめる段数（1回あたり最大 2^6 = 64 回転）
const DOUBLING_LIMIT: u32 = 6;
/// 飽和段数。ここまで外れ続けたら短期競合ではなく長い待ちとみなす
const SATURATION: u32 = 10;

/// 外れた回数に応じてスピン量を逓増させるカウンタ
#[derive(Debug, Default)]
pub struct Backoff {
    misses: u32,
}

impl Backoff {
    #[inline]
    pub const fn new() -> Self {
        Self { misses: 0 }
    }

    /// 条件が一度成立したら呼んで最初の段へ戻す
    #[inline]
    pub fn reset(&mut self) {
        self.misses = 0;
    }

    /// 1段ぶん待って外れを記録する
    #[inline]
    pub fn snooze(&mut self) {
        for _ in 0..(1u32 << self.misses.min(DOUBLING_LIMIT)) {
            core::hint::spin_loop();
        }
        if self.misses >= DOUBLING_LIMIT {
            #[cfg(any(feature = "std", test))]
            std::thread::yield_now();
        }
        if self.misses < SATURATION {
            self.misses += 1;
        }
    }

    /// 飽和したか（呼び出し側がスピンを諦める目安）
    #[inline]
    pub fn is_saturated(&self) -> bool {
        self.misses >= SATURATION
    }
}
