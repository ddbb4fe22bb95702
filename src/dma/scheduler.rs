// ============================================================================
// src/dma/scheduler.rs - DMAディスパッチスケジューラ
//
// どのコンテキストのWaitlistを次に流すかを選ぶ。方針は3段:
// 1. 特権コンテキスト（ID 0）に滞留があれば常に優先（バイパス）
// 2. 直前に走らせたコンテキストに滞留が残り、タイムスライスが切れて
//    いなければ継続（切替コストの償却）
// 3. 前回走査位置の次から一巡走査し、最初の非空Waitlistを選ぶ。ただし
//    候補が現行と異なりスライスが残っている間は、残り時間のワンショット
//    遅延を組んで即時切替を避ける
//
// 時間基盤はデバイスのティックカウンタ。終了処理中のコンテキストは
// スケジューリングから除外する。
// ============================================================================
#![allow(dead_code)]

use alloc::sync::Arc;

use crate::ctx::queue::{HwContext, KERNEL_CONTEXT};

/// select_next の結果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Selection {
    /// このコンテキストのWaitlistを流す
    Run(usize),
    /// 切替をスライス満了まで遅延（残りティック数）
    Deferred { remaining: u64 },
    /// 全Waitlistが空
    Idle,
}

struct SchedState {
    /// 直前に走らせたコンテキスト
    current: Option<usize>,
    /// 走査の再開位置（前回見つけた位置）
    last_checked: usize,
    /// 現行スライスの開始ティック
    slice_start: u64,
    /// ワンショット遅延の満了ティック
    deferred_until: Option<u64>,
}

/// DMAディスパッチスケジューラ
pub struct Scheduler {
    inner: spin::Mutex<SchedState>,
    time_slice: u64,
}

impl Scheduler {
    pub const fn new(time_slice: u64) -> Self {
        Self {
            inner: spin::Mutex::new(SchedState {
                current: None,
                last_checked: 0,
                slice_start: 0,
                deferred_until: None,
            }),
            time_slice,
        }
    }

    /// 次に流すコンテキストを選ぶ
    pub fn select_next(&self, contexts: &[Arc<HwContext>], now: u64) -> Selection {
        let mut st = self.inner.lock();

        // 特権コンテキストの優先バイパス
        if let Some(ctx) = contexts.get(KERNEL_CONTEXT) {
            if ctx.has_pending_work() {
                if st.current != Some(KERNEL_CONTEXT) {
                    st.slice_start = now;
                }
                st.current = Some(KERNEL_CONTEXT);
                st.deferred_until = None;
                return Selection::Run(KERNEL_CONTEXT);
            }
        }

        let expired = match st.current {
            Some(_) => now >= st.slice_start.saturating_add(self.time_slice),
            None => true,
        };

        // 現行コンテキストへのアフィニティ
        if let Some(cur) = st.current {
            if !expired {
                if let Some(ctx) = contexts.get(cur) {
                    if ctx.has_pending_work() {
                        st.deferred_until = None;
                        return Selection::Run(cur);
                    }
                }
            }
        }

        if contexts.is_empty() {
            return Selection::Idle;
        }

        // 前回位置の次から一巡走査
        let n = contexts.len();
        for step in 1..=n {
            let id = (st.last_checked + step) % n;
            if !contexts[id].has_pending_work() {
                continue;
            }
            st.last_checked = id;

            if st.current != Some(id) && !expired {
                // スライスが残っている間は切替を遅延する
                let deadline = st.slice_start.saturating_add(self.time_slice);
                st.deferred_until = Some(deadline);
                return Selection::Deferred {
                    remaining: deadline.saturating_sub(now),
                };
            }

            st.current = Some(id);
            st.slice_start = now;
            st.deferred_until = None;
            return Selection::Run(id);
        }

        Selection::Idle
    }

    /// 直前に走らせたコンテキスト
    pub fn current(&self) -> Option<usize> {
        self.inner.lock().current
    }

    /// 調停プロセスが切替を完了した際に現行を付け替える（NEW_CTX経路）
    pub fn set_current(&self, id: usize, now: u64) {
        let mut st = self.inner.lock();
        st.current = Some(id);
        st.slice_start = now;
        st.deferred_until = None;
    }

    /// 組まれているワンショット遅延の満了ティック
    pub fn deferred_until(&self) -> Option<u64> {
        self.inner.lock().deferred_until
    }

    #[inline]
    pub fn time_slice(&self) -> u64 {
        self.time_slice
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mm::buffer::{Buffer, BufferIndex};
    use alloc::vec::Vec;

    const SLICE: u64 = 10;

    fn make_contexts(n: usize) -> Vec<Arc<HwContext>> {
        (0..n)
            .map(|_| {
                let ctx = Arc::new(HwContext::new(16));
                assert!(ctx.try_claim());
                ctx
            })
            .collect()
    }

    fn enqueue(ctx: &HwContext, idx: u32) {
        let buf = Arc::new(Buffer::new(BufferIndex::new(idx), 4096, 12, 0, 0));
        ctx.waitlist().put(buf).unwrap();
    }

    #[test]
    fn test_idle_when_all_empty() {
        let sched = Scheduler::new(SLICE);
        let ctxs = make_contexts(3);
        assert_eq!(sched.select_next(&ctxs, 0), Selection::Idle);
    }

    #[test]
    fn test_privileged_context_bypasses() {
        let sched = Scheduler::new(SLICE);
        let ctxs = make_contexts(3);
        enqueue(&ctxs[2], 0);
        enqueue(&ctxs[KERNEL_CONTEXT], 1);

        // ID 0 に滞留がある限り他は選ばれない
        assert_eq!(sched.select_next(&ctxs, 0), Selection::Run(KERNEL_CONTEXT));
        assert_eq!(sched.select_next(&ctxs, 1), Selection::Run(KERNEL_CONTEXT));

        // 特権側が掃けた後、スライス満了を待って一般コンテキストへ移る
        ctxs[KERNEL_CONTEXT].waitlist().get();
        assert!(matches!(
            sched.select_next(&ctxs, 2),
            Selection::Deferred { .. }
        ));
        assert_eq!(sched.select_next(&ctxs, 12), Selection::Run(2));
    }

    #[test]
    fn test_affinity_keeps_current_within_slice() {
        let sched = Scheduler::new(SLICE);
        let ctxs = make_contexts(3);
        enqueue(&ctxs[1], 0);
        enqueue(&ctxs[1], 1);

        assert_eq!(sched.select_next(&ctxs, 0), Selection::Run(1));
        // スライス内は同じコンテキストを使い続ける
        assert_eq!(sched.select_next(&ctxs, 5), Selection::Run(1));
    }

    #[test]
    fn test_switch_deferred_until_slice_expiry() {
        let sched = Scheduler::new(SLICE);
        let ctxs = make_contexts(3);
        enqueue(&ctxs[1], 0);

        assert_eq!(sched.select_next(&ctxs, 0), Selection::Run(1));
        ctxs[1].waitlist().get();

        // 現行(1)は空になったが、スライス中の候補(2)への切替は遅延
        enqueue(&ctxs[2], 1);
        assert_eq!(
            sched.select_next(&ctxs, 4),
            Selection::Deferred { remaining: 6 }
        );
        assert_eq!(sched.deferred_until(), Some(10));

        // スライス満了後は切替が成立する
        assert_eq!(sched.select_next(&ctxs, 10), Selection::Run(2));
        assert_eq!(sched.deferred_until(), None);
    }

    #[test]
    fn test_round_robin_resumes_past_last_checked() {
        let sched = Scheduler::new(SLICE);
        let ctxs = make_contexts(4);
        enqueue(&ctxs[1], 0);
        enqueue(&ctxs[3], 1);

        assert_eq!(sched.select_next(&ctxs, 0), Selection::Run(1));
        ctxs[1].waitlist().get();

        // 前回位置(1)の次から走査するので3が先に見つかる
        assert_eq!(sched.select_next(&ctxs, 20), Selection::Run(3));
    }

    #[test]
    fn test_finalizing_context_excluded() {
        let sched = Scheduler::new(SLICE);
        let ctxs = make_contexts(2);
        enqueue(&ctxs[1], 0);
        assert!(ctxs[1].hold());
        ctxs[1].begin_finalize();

        assert_eq!(sched.select_next(&ctxs, 0), Selection::Idle);
        ctxs[1].end_finalize();
    }

    #[test]
    fn test_expired_slice_renews_for_same_context() {
        let sched = Scheduler::new(SLICE);
        let ctxs = make_contexts(2);
        enqueue(&ctxs[1], 0);
        enqueue(&ctxs[1], 1);

        assert_eq!(sched.select_next(&ctxs, 0), Selection::Run(1));
        // スライス切れでも他に候補がなければ同じコンテキストを再選択
        assert_eq!(sched.select_next(&ctxs, 15), Selection::Run(1));
    }
}
