// ============================================================================
// src/sync/wait_queue.rs - 割り込み可能ウェイトキュー
//
// カーネルの wait_queue / wake_up_interruptible 相当。待機者は条件が
// 満たされるまでバックオフ付きスピンで眠り、以下のいずれかで帰還する:
// - 条件成立 → Ok
// - 条件クロージャ自身がエラーを報告（コンテキスト終了処理など）→ そのErr
// - 終了シグナル観測 → Err(Interrupted)。リトライせず即座に巻き戻す
//
// 起床は wake_one（フリーリストput等、待機者1名のみ起こす）と
// wake_all（終了処理で全員をエラー起床させる）の2種。
// ============================================================================
#![allow(dead_code)]

use alloc::collections::VecDeque;
use alloc::sync::Arc;
use core::sync::atomic::{AtomicBool, Ordering};

use crate::error::DrmError;
use crate::process::TaskContext;
use crate::sync::Backoff;

/// キュー上の待機者1名分の状態
#[derive(Debug)]
struct Waiter {
    woken: AtomicBool,
}

impl Waiter {
    fn new() -> Self {
        Self {
            woken: AtomicBool::new(false),
        }
    }

    #[inline]
    fn is_woken(&self) -> bool {
        self.woken.load(Ordering::Acquire)
    }

    #[inline]
    fn wake(&self) {
        self.woken.store(true, Ordering::Release);
    }
}

/// 割り込み可能ウェイトキュー
#[derive(Debug)]
pub struct WaitQueue {
    waiters: spin::Mutex<VecDeque<Arc<Waiter>>>,
}

impl WaitQueue {
    pub const fn new() -> Self {
        Self {
            waiters: spin::Mutex::new(VecDeque::new()),
        }
    }

    /// 待機者がいれば先頭の1名を起床させる
    ///
    /// # Returns
    /// 起床させた場合 true
    pub fn wake_one(&self) -> bool {
        let mut q = self.waiters.lock();
        if let Some(w) = q.pop_front() {
            w.wake();
            true
        } else {
            false
        }
    }

    /// 全待機者を起床させる（終了処理用）
    ///
    /// # Returns
    /// 起床させた人数
    pub fn wake_all(&self) -> usize {
        let mut q = self.waiters.lock();
        let n = q.len();
        for w in q.drain(..) {
            w.wake();
        }
        n
    }

    /// 現在の待機者数
    pub fn len(&self) -> usize {
        self.waiters.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.waiters.lock().is_empty()
    }

    /// 条件が成立するまで割り込み可能に待機する
    ///
    /// `cond` は検査のたびに呼ばれ、
    /// - `Ok(true)`  : 条件成立、待機終了
    /// - `Ok(false)` : 未成立、眠り続ける
    /// - `Err(e)`    : 待機対象が消滅した等。待機を破棄して `e` を返す
    ///
    /// 登録と再検査の順序により起床喪失は起きない: 登録後に必ず `cond` を
    /// 再検査してから眠りに入るため、登録前後のwakeはどちらも観測できる。
    pub fn wait_until<F>(&self, task: &TaskContext, mut cond: F) -> Result<(), DrmError>
    where
        F: FnMut() -> Result<bool, DrmError>,
    {
        let mut backoff = Backoff::new();
        loop {
            if cond()? {
                return Ok(());
            }
            if task.signal_pending() {
                return Err(DrmError::Interrupted);
            }

            // 登録してから条件を再検査（起床喪失防止）
            let waiter = Arc::new(Waiter::new());
            self.waiters.lock().push_back(waiter.clone());

            match cond() {
                Ok(true) => {
                    self.remove(&waiter);
                    return Ok(());
                }
                Ok(false) => {}
                Err(e) => {
                    self.remove(&waiter);
                    return Err(e);
                }
            }

            while !waiter.is_woken() {
                if task.signal_pending() {
                    self.remove(&waiter);
                    return Err(DrmError::Interrupted);
                }
                backoff.snooze();
            }
            backoff.reset();
            // 起床後は先頭ループで条件を再検査する。条件が未成立なら
            // （wakeを消費してしまった分を含め）再登録して眠り直す
        }
    }

    /// 待機者をキューから除去（自発的な離脱時）
    fn remove(&self, target: &Arc<Waiter>) {
        let mut q = self.waiters.lock();
        q.retain(|w| !Arc::ptr_eq(w, target));
    }
}

impl Default for WaitQueue {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::process::ProcessId;
    use core::sync::atomic::AtomicUsize;
    use std::thread;

    #[test]
    fn test_wait_immediate_condition() {
        let q = WaitQueue::new();
        let task = TaskContext::new(ProcessId::new(1));
        assert!(q.wait_until(&task, || Ok(true)).is_ok());
        assert!(q.is_empty());
    }

    #[test]
    fn test_wake_one_unblocks_waiter() {
        let q = Arc::new(WaitQueue::new());
        let ready = Arc::new(AtomicUsize::new(0));

        let q2 = q.clone();
        let ready2 = ready.clone();
        let handle = thread::spawn(move || {
            let task = TaskContext::new(ProcessId::new(2));
            q2.wait_until(&task, || Ok(ready2.load(Ordering::Acquire) > 0))
        });

        // 待機者が登録されるまで待つ
        while q.is_empty() {
            thread::yield_now();
        }
        ready.store(1, Ordering::Release);
        q.wake_one();
        assert!(handle.join().unwrap().is_ok());
    }

    #[test]
    fn test_signal_interrupts_wait() {
        let q = Arc::new(WaitQueue::new());
        let task = Arc::new(TaskContext::new(ProcessId::new(3)));

        let q2 = q.clone();
        let task2 = task.clone();
        let handle = thread::spawn(move || q2.wait_until(&task2, || Ok(false)));

        while q.is_empty() {
            thread::yield_now();
        }
        task.post_signal();
        assert_eq!(handle.join().unwrap(), Err(DrmError::Interrupted));
        // 中断した待機者はキューに残らない
        assert!(q.is_empty());
    }

    #[test]
    fn test_cond_error_aborts_wait() {
        let q = WaitQueue::new();
        let task = TaskContext::new(ProcessId::new(4));
        let r = q.wait_until(&task, || Err(DrmError::Resource(crate::error::ResourceError::Busy)));
        assert_eq!(r, Err(DrmError::Resource(crate::error::ResourceError::Busy)));
        assert!(q.is_empty());
    }

    #[test]
    fn test_wake_all_unblocks_everyone() {
        let q = Arc::new(WaitQueue::new());
        let gate = Arc::new(AtomicUsize::new(0));
        let mut handles = alloc::vec::Vec::new();

        for i in 0..4 {
            let q2 = q.clone();
            let gate2 = gate.clone();
            handles.push(thread::spawn(move || {
                let task = TaskContext::new(ProcessId::new(10 + i));
                q2.wait_until(&task, || Ok(gate2.load(Ordering::Acquire) > 0))
            }));
        }

        while q.len() < 4 {
            thread::yield_now();
        }
        gate.store(1, Ordering::Release);
        q.wake_all();
        for h in handles {
            assert!(h.join().unwrap().is_ok());
        }
    }
}
