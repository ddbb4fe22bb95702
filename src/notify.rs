// ============================================================================
// src/notify.rs - 調停プロセス向け非同期通知チャネル
//
// 「コンテキスト切替要求」を特権調停プロセスへ運ぶ読み出し専用の
// 循環テキストバッファ。書き手はドライバのみ。ブロック中の読み手は
// 単一待機者通知で起こし、併せて非同期シグナルフラグを立てる
// （埋め込み側が SIGIO 相当の配送に使う）。
// 行の字句フォーマットそのものは帯域外プロトコルの領分であり、
// ここでは1行1要求のテキストを書き込むだけに留める。
// ============================================================================
#![allow(dead_code)]

use alloc::vec::Vec;
use core::fmt::Write as _;
use core::sync::atomic::{AtomicBool, Ordering};

use crate::error::DrmError;
use crate::process::TaskContext;
use crate::sync::WaitQueue;

/// 循環テキストバッファの容量
const NOTIFY_BUF_SIZE: usize = 4096;

struct ByteRing {
    buf: Vec<u8>,
    read: usize,
    write: usize,
}

impl ByteRing {
    fn new() -> Self {
        let mut buf = Vec::with_capacity(NOTIFY_BUF_SIZE);
        buf.resize(NOTIFY_BUF_SIZE, 0);
        Self {
            buf,
            read: 0,
            write: 0,
        }
    }

    #[inline]
    fn len(&self) -> usize {
        (self.write + self.buf.len() - self.read) % self.buf.len()
    }

    #[inline]
    fn space(&self) -> usize {
        self.buf.len() - 1 - self.len()
    }

    fn push_bytes(&mut self, bytes: &[u8]) -> bool {
        if bytes.len() > self.space() {
            return false;
        }
        for &b in bytes {
            self.buf[self.write] = b;
            self.write = (self.write + 1) % self.buf.len();
        }
        true
    }

    fn pop_into(&mut self, out: &mut [u8]) -> usize {
        let mut n = 0;
        while n < out.len() && self.read != self.write {
            out[n] = self.buf[self.read];
            self.read = (self.read + 1) % self.buf.len();
            n += 1;
        }
        n
    }
}

/// 小さな行フォーマット用の固定長ライタ
struct LineBuf {
    bytes: [u8; 64],
    len: usize,
}

impl LineBuf {
    const fn new() -> Self {
        Self {
            bytes: [0; 64],
            len: 0,
        }
    }

    fn as_slice(&self) -> &[u8] {
        &self.bytes[..self.len]
    }
}

impl core::fmt::Write for LineBuf {
    fn write_str(&mut self, s: &str) -> core::fmt::Result {
        let b = s.as_bytes();
        if self.len + b.len() > self.bytes.len() {
            return Err(core::fmt::Error);
        }
        self.bytes[self.len..self.len + b.len()].copy_from_slice(b);
        self.len += b.len();
        Ok(())
    }
}

/// 非同期通知チャネル
pub struct NotifyChannel {
    ring: spin::Mutex<ByteRing>,
    reader: WaitQueue,
    /// 非同期シグナル配送フラグ（埋め込み側が読み取ってクリアする）
    sigio: AtomicBool,
}

impl NotifyChannel {
    pub fn new() -> Self {
        Self {
            ring: spin::Mutex::new(ByteRing::new()),
            reader: WaitQueue::new(),
            sigio: AtomicBool::new(false),
        }
    }

    /// コンテキスト切替要求を1行書き込み、読み手を起こす
    pub fn post_switch(&self, from: usize, to: usize) {
        let mut line = LineBuf::new();
        // 1行1要求。書式は帯域外プロトコル側の合意に合わせる
        if write!(line, "C {from} {to}\n").is_err() {
            log::error!("notify: switch line too long ({from} -> {to})");
            return;
        }
        {
            let mut ring = self.ring.lock();
            if !ring.push_bytes(line.as_slice()) {
                // 読み手が滞っている。要求を落とし、可用性を優先する
                log::warn!("notify: ring full, dropping switch request {from} -> {to}");
                return;
            }
        }
        self.sigio.store(true, Ordering::Release);
        self.reader.wake_one();
    }

    /// 溜まっているバイト列を読み出す
    ///
    /// 空で `block == false` なら 0 を返す。`block == true` なら書き込みが
    /// あるまで割り込み可能に眠る。
    pub fn read(
        &self,
        task: &TaskContext,
        out: &mut [u8],
        block: bool,
    ) -> Result<usize, DrmError> {
        if out.is_empty() {
            return Ok(0);
        }
        {
            let mut ring = self.ring.lock();
            let n = ring.pop_into(out);
            if n > 0 || !block {
                return Ok(n);
            }
        }

        let mut got = 0;
        self.reader.wait_until(task, || {
            let mut ring = self.ring.lock();
            got = ring.pop_into(out);
            Ok(got > 0)
        })?;
        Ok(got)
    }

    /// 未読バイト数
    pub fn pending_bytes(&self) -> usize {
        self.ring.lock().len()
    }

    /// 非同期シグナルフラグを読み取ってクリアする
    pub fn take_sigio(&self) -> bool {
        self.sigio.swap(false, Ordering::AcqRel)
    }
}

impl Default for NotifyChannel {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::process::ProcessId;
    use alloc::string::String;
    use alloc::sync::Arc;
    use std::thread;

    #[test]
    fn test_post_and_read_line() {
        let ch = NotifyChannel::new();
        let task = TaskContext::new(ProcessId::new(1));

        ch.post_switch(0, 3);
        assert!(ch.take_sigio());

        let mut buf = [0u8; 64];
        let n = ch.read(&task, &mut buf, false).unwrap();
        assert_eq!(core::str::from_utf8(&buf[..n]).unwrap(), "C 0 3\n");
        assert_eq!(ch.pending_bytes(), 0);
    }

    #[test]
    fn test_nonblocking_read_on_empty() {
        let ch = NotifyChannel::new();
        let task = TaskContext::new(ProcessId::new(1));
        let mut buf = [0u8; 8];
        assert_eq!(ch.read(&task, &mut buf, false).unwrap(), 0);
        assert!(!ch.take_sigio());
    }

    #[test]
    fn test_blocking_reader_woken_by_post() {
        let ch = Arc::new(NotifyChannel::new());
        let ch2 = ch.clone();
        let handle = thread::spawn(move || {
            let task = TaskContext::new(ProcessId::new(2));
            let mut buf = [0u8; 64];
            let n = ch2.read(&task, &mut buf, true).unwrap();
            String::from_utf8(buf[..n].to_vec()).unwrap()
        });

        thread::sleep(std::time::Duration::from_millis(5));
        ch.post_switch(2, 5);
        assert_eq!(handle.join().unwrap(), "C 2 5\n");
    }

    #[test]
    fn test_multiple_lines_fifo() {
        let ch = NotifyChannel::new();
        let task = TaskContext::new(ProcessId::new(1));
        ch.post_switch(0, 1);
        ch.post_switch(1, 2);

        let mut buf = [0u8; 64];
        let n = ch.read(&task, &mut buf, false).unwrap();
        assert_eq!(core::str::from_utf8(&buf[..n]).unwrap(), "C 0 1\nC 1 2\n");
    }
}
