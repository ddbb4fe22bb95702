// ============================================================================
// src/ctx/waitlist.rs - ディスパッチ待ちFIFOリング（Waitlist）
//
// コンテキスト1つにつき1本。容量はデバイス全バッファ数+1で、+1の
// 過剰確保により読み書きカーソルだけで満/空の曖昧さなく判定できる。
// 不変条件: 滞留数 = (write − read) mod capacity。
//
// putもgetもブロックしない。ブロッキングはスケジューラ側で重ねる。
// 生産者はフリーリストから取り外し済みのバッファしか積まないため、
// 設計上は溢れない（溢れたら整合性異常としてログする）。
// ============================================================================
#![allow(dead_code)]

use alloc::sync::Arc;
use alloc::vec::Vec;

use crate::error::{DrmError, ResourceError};
use crate::mm::buffer::Buffer;

#[derive(Debug)]
struct Ring {
    slots: Vec<Option<Arc<Buffer>>>,
    read: usize,
    write: usize,
}

impl Ring {
    fn with_buf_capacity(buf_count: usize) -> Self {
        let cap = buf_count + 1;
        let mut slots = Vec::with_capacity(cap);
        slots.resize_with(cap, || None);
        Self {
            slots,
            read: 0,
            write: 0,
        }
    }

    #[inline]
    fn len(&self) -> usize {
        let cap = self.slots.len();
        (self.write + cap - self.read) % cap
    }

    #[inline]
    fn is_empty(&self) -> bool {
        self.read == self.write
    }
}

/// コンテキスト1つ分のディスパッチ待ちFIFO
#[derive(Debug)]
pub struct Waitlist {
    ring: spin::Mutex<Ring>,
}

impl Waitlist {
    /// デバイスの総バッファ数に合わせて生成する
    pub fn new(buf_count: usize) -> Self {
        Self {
            ring: spin::Mutex::new(Ring::with_buf_capacity(buf_count)),
        }
    }

    /// 末尾（書き込みカーソル）へ追加
    pub fn put(&self, buf: Arc<Buffer>) -> Result<(), DrmError> {
        let mut ring = self.ring.lock();
        let cap = ring.slots.len();
        let next = (ring.write + 1) % cap;
        if next == ring.read {
            // 設計上到達しない。プール外のバッファが紛れ込んだ等
            log::error!(
                "waitlist: overflow at capacity {} (buffer {})",
                cap - 1,
                buf.index().as_raw()
            );
            return Err(DrmError::Resource(ResourceError::Overflow));
        }
        let write = ring.write;
        ring.slots[write] = Some(buf);
        ring.write = next;
        Ok(())
    }

    /// 先頭（読み出しカーソル）から取り出す。空なら None
    pub fn get(&self) -> Option<Arc<Buffer>> {
        let mut ring = self.ring.lock();
        if ring.is_empty() {
            return None;
        }
        let read = ring.read;
        let buf = ring.slots[read].take();
        ring.read = (read + 1) % ring.slots.len();
        buf
    }

    /// 滞留数
    pub fn len(&self) -> usize {
        self.ring.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.ring.lock().is_empty()
    }

    /// 容量を作り直す（プール追加時）
    ///
    /// プール作成は保留作業が無いときに限られるため、呼び出し時点で
    /// リングは空である。空でなければ拒否する。
    pub fn resize(&self, buf_count: usize) -> Result<(), DrmError> {
        let mut ring = self.ring.lock();
        if !ring.is_empty() {
            return Err(DrmError::Resource(ResourceError::Busy));
        }
        *ring = Ring::with_buf_capacity(buf_count);
        Ok(())
    }

    /// 述語に合致するバッファをリングから抜き取る（FIFO順は保存）
    ///
    /// プロセス消滅時の回収で使う。抜き取ったバッファを返す。
    pub fn remove_matching<F>(&self, mut pred: F) -> Vec<Arc<Buffer>>
    where
        F: FnMut(&Arc<Buffer>) -> bool,
    {
        let mut ring = self.ring.lock();
        let cap = ring.slots.len();
        let mut kept = Vec::new();
        let mut removed = Vec::new();

        let mut cursor = ring.read;
        while cursor != ring.write {
            if let Some(buf) = ring.slots[cursor].take() {
                if pred(&buf) {
                    removed.push(buf);
                } else {
                    kept.push(buf);
                }
            }
            cursor = (cursor + 1) % cap;
        }

        ring.read = 0;
        ring.write = 0;
        for buf in kept {
            let write = ring.write;
            ring.slots[write] = Some(buf);
            ring.write = (write + 1) % cap;
        }
        removed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mm::buffer::BufferIndex;

    fn mk(idx: u32) -> Arc<Buffer> {
        Arc::new(Buffer::new(BufferIndex::new(idx), 4096, 12, 0, 0))
    }

    /// 単一コンテキスト内はFIFO
    #[test]
    fn test_fifo_order() {
        let wl = Waitlist::new(4);
        for i in 0..4 {
            wl.put(mk(i)).unwrap();
        }
        for i in 0..4 {
            assert_eq!(wl.get().unwrap().index().as_raw(), i);
        }
        assert!(wl.get().is_none());
    }

    #[test]
    fn test_len_mod_capacity_invariant() {
        let wl = Waitlist::new(2);
        assert_eq!(wl.len(), 0);
        wl.put(mk(0)).unwrap();
        wl.put(mk(1)).unwrap();
        assert_eq!(wl.len(), 2);

        // カーソルを一周させても滞留数は正しい
        assert_eq!(wl.get().unwrap().index().as_raw(), 0);
        wl.put(mk(2)).unwrap();
        assert_eq!(wl.len(), 2);
        assert_eq!(wl.get().unwrap().index().as_raw(), 1);
        assert_eq!(wl.get().unwrap().index().as_raw(), 2);
        assert!(wl.is_empty());
    }

    #[test]
    fn test_overflow_is_reported() {
        let wl = Waitlist::new(1);
        wl.put(mk(0)).unwrap();
        assert_eq!(
            wl.put(mk(1)).unwrap_err(),
            DrmError::Resource(ResourceError::Overflow)
        );
    }

    #[test]
    fn test_resize_requires_empty() {
        let wl = Waitlist::new(1);
        wl.put(mk(0)).unwrap();
        assert!(wl.resize(8).is_err());
        wl.get();
        wl.resize(8).unwrap();
        for i in 0..8 {
            wl.put(mk(i)).unwrap();
        }
        assert_eq!(wl.len(), 8);
    }

    #[test]
    fn test_remove_matching_preserves_order() {
        let wl = Waitlist::new(8);
        for i in 0..6 {
            wl.put(mk(i)).unwrap();
        }
        let removed = wl.remove_matching(|b| b.index().as_raw() % 2 == 0);
        let removed_idx: Vec<u32> = removed.iter().map(|b| b.index().as_raw()).collect();
        assert_eq!(removed_idx, alloc::vec![0, 2, 4]);

        assert_eq!(wl.get().unwrap().index().as_raw(), 1);
        assert_eq!(wl.get().unwrap().index().as_raw(), 3);
        assert_eq!(wl.get().unwrap().index().as_raw(), 5);
        assert!(wl.get().is_none());
    }
}
