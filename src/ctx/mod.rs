// ============================================================================
// src/ctx/mod.rs - コンテキスト/キュー表
//
// 動的拡張される参照カウント付きのハードウェアコンテキスト配列。
// 割り当ては既存スロットへのロックフリー線形プローブ（楽観的増分と
// 巻き戻し）で行い、空きが無ければ粗粒度構造ミューテックスの下で
// 幾何級数的（倍々）に拡張する。
// ============================================================================
#![allow(dead_code)]

pub mod queue;
pub mod waitlist;

pub use queue::{CtxFlags, HwContext, KERNEL_CONTEXT};
pub use waitlist::Waitlist;

use alloc::sync::Arc;
use alloc::vec::Vec;

use crate::error::{DrmError, InvalidKind, ResourceError};

/// コンテキスト表の上限（拡張してもこれを超えない）
pub const MAX_CONTEXTS: usize = 1024;

/// 拡張時の最小スロット数
const INITIAL_CONTEXTS: usize = 4;

/// コンテキスト表
pub struct ContextTable {
    slots: spin::RwLock<Vec<Arc<HwContext>>>,
}

impl ContextTable {
    pub const fn new() -> Self {
        Self {
            slots: spin::RwLock::new(Vec::new()),
        }
    }

    pub fn len(&self) -> usize {
        self.slots.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.read().is_empty()
    }

    /// IDからコンテキストを引く（保持はしない）
    pub fn get(&self, id: usize) -> Result<Arc<HwContext>, DrmError> {
        self.slots
            .read()
            .get(id)
            .cloned()
            .ok_or(DrmError::InvalidArgument(InvalidKind::ContextId))
    }

    /// スケジューラ走査用のスナップショット
    pub fn snapshot(&self) -> Vec<Arc<HwContext>> {
        self.slots.read().clone()
    }

    /// コンテキストを割り当てる
    ///
    /// 既存スロットの楽観的プローブ → 外れなら `struct_lock` の下で
    /// 再走査と倍々拡張。割り当て直後の use_count は 1、finalization は 0。
    pub fn alloc(
        &self,
        struct_lock: &spin::Mutex<()>,
        waitlist_capacity: usize,
    ) -> Result<(usize, Arc<HwContext>), DrmError> {
        if let Some(found) = self.probe() {
            return Ok(found);
        }

        // 構造変更は粗粒度ミューテックスの下で直列化する
        let _guard = struct_lock.lock();

        // 待っている間に他者が解放/拡張したかもしれない
        if let Some(found) = self.probe() {
            return Ok(found);
        }

        let mut slots = self.slots.write();
        let old_len = slots.len();
        if old_len >= MAX_CONTEXTS {
            return Err(DrmError::Resource(ResourceError::TableFull));
        }
        let new_len = (old_len * 2).clamp(INITIAL_CONTEXTS, MAX_CONTEXTS);

        // 拡張分の最初の1つを確保済みで構築する
        let claimed = Arc::new(HwContext::new_claimed(waitlist_capacity));
        slots.push(claimed.clone());
        while slots.len() < new_len {
            slots.push(Arc::new(HwContext::new(waitlist_capacity)));
        }
        Ok((old_len, claimed))
    }

    /// 既存スロットへの楽観的プローブ
    fn probe(&self) -> Option<(usize, Arc<HwContext>)> {
        let slots = self.slots.read();
        for (id, ctx) in slots.iter().enumerate() {
            if ctx.try_claim() {
                return Some((id, ctx.clone()));
            }
        }
        None
    }

    /// 全コンテキストのWaitlist容量を作り直す（プール追加時）
    ///
    /// プール作成は保留作業ゼロの時に限るため、各リングは空のはず。
    pub fn resize_waitlists(&self, buf_count: usize) -> Result<(), DrmError> {
        let slots = self.slots.read();
        for ctx in slots.iter() {
            ctx.waitlist().resize(buf_count)?;
        }
        Ok(())
    }

    /// 割り当て済みコンテキストのID一覧
    pub fn allocated_ids(&self) -> Vec<usize> {
        self.slots
            .read()
            .iter()
            .enumerate()
            .filter(|(_, ctx)| ctx.is_allocated())
            .map(|(id, _)| id)
            .collect()
    }
}

impl Default for ContextTable {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_alloc_grows_geometrically() {
        let table = ContextTable::new();
        let lock = spin::Mutex::new(());

        let (id0, _) = table.alloc(&lock, 8).unwrap();
        assert_eq!(id0, 0);
        assert_eq!(table.len(), INITIAL_CONTEXTS);

        // 既存の空きスロットが使い切られるまで拡張しない
        for expect in 1..INITIAL_CONTEXTS {
            let (id, _) = table.alloc(&lock, 8).unwrap();
            assert_eq!(id, expect);
        }
        assert_eq!(table.len(), INITIAL_CONTEXTS);

        let (id, _) = table.alloc(&lock, 8).unwrap();
        assert_eq!(id, INITIAL_CONTEXTS);
        assert_eq!(table.len(), INITIAL_CONTEXTS * 2);
    }

    /// 終了処理中のコンテキストは割り当てられず、完了後に再利用できる
    #[test]
    fn test_alloc_skips_finalizing_slot() {
        let table = ContextTable::new();
        let lock = spin::Mutex::new(());

        let (id, ctx) = table.alloc(&lock, 8).unwrap();
        assert!(ctx.hold());
        ctx.begin_finalize();

        // 終了処理中のスロットは再利用されない
        let (id2, ctx2) = table.alloc(&lock, 8).unwrap();
        assert_ne!(id, id2);
        assert!(!ctx2.in_finalization());

        ctx.end_finalize();
        // 終了処理完了後はスロットが再利用できる
        let (id3, _) = table.alloc(&lock, 8).unwrap();
        assert_eq!(id3, id);
    }

    #[test]
    fn test_lookup_out_of_range() {
        let table = ContextTable::new();
        assert_eq!(
            table.get(3).unwrap_err(),
            DrmError::InvalidArgument(InvalidKind::ContextId)
        );
    }
}
