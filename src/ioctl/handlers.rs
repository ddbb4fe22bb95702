// ============================================================================
// src/ioctl/handlers.rs - オペコード別リクエストハンドラ
//
// 各ハンドラは引数バイト像を全て復号してからデバイスを操作し、最後に
// 結果を書き戻す。復号段の BadAddress ではデバイス状態は一切変わらない。
// 引数レイアウトは各ハンドラ冒頭のコメントを正とする（オフセットは
// バイト、整数はリトルエンディアン）。
// ============================================================================
#![allow(dead_code)]

use alloc::vec::Vec;

use crate::ctx::CtxFlags;
use crate::device::{
    Device, DmaFlags, DmaRequest, LockFlags, MapEntry, MapFlags, MapKind,
};
use crate::error::DrmError;
use crate::ioctl::args::{read_u32, read_u64, write_u32, write_u64};
use crate::mm::buffer::BufferIndex;
use crate::process::TaskContext;

/// ADD_BUFS の PAGE_ALIGN 要求ビット
const ADD_BUFS_PAGE_ALIGN: u32 = 1 << 0;

// in:  offset u64 @0, size u64 @8, kind u32 @16, flags u32 @20
pub fn add_map(dev: &Device, _task: &TaskContext, arg: &mut [u8]) -> Result<(), DrmError> {
    let offset = read_u64(arg, 0)?;
    let size = read_u64(arg, 8)?;
    let kind = MapKind::from_raw(read_u32(arg, 16)?)?;
    let flags = MapFlags::from_bits_truncate(read_u32(arg, 20)?);
    dev.add_map(MapEntry {
        offset,
        size,
        kind,
        flags,
    })
}

// in:  count u32 @0, size u32 @4, flags u32 @8
// out: count u32 @0 (実本数), size u32 @4 (実効ストライド), order u32 @12
pub fn add_bufs(dev: &Device, _task: &TaskContext, arg: &mut [u8]) -> Result<(), DrmError> {
    let count = read_u32(arg, 0)? as usize;
    let size = read_u32(arg, 4)? as usize;
    let flags = read_u32(arg, 8)?;
    // 書き戻し先の検証を先に済ませる（実行後のBadAddressを避ける）
    let _ = read_u32(arg, 12)?;

    let page_align = flags & ADD_BUFS_PAGE_ALIGN != 0;
    let (order, actual) = dev.create_pool(count, size, page_align)?;
    let stride = dev
        .info_bufs()
        .into_iter()
        .find(|p| p.order == order)
        .map_or(size, |p| p.size);

    write_u32(arg, 0, actual as u32)?;
    write_u32(arg, 4, stride as u32)?;
    write_u32(arg, 12, order as u32)?;
    Ok(())
}

// in: size u32 @0, low u32 @4, high u32 @8
pub fn mark_bufs(dev: &Device, _task: &TaskContext, arg: &mut [u8]) -> Result<(), DrmError> {
    let size = read_u32(arg, 0)? as usize;
    let low = read_u32(arg, 4)? as usize;
    let high = read_u32(arg, 8)? as usize;
    dev.mark_bufs(size, low, high)
}

// in:  capacity u32 @0
// out: count u32 @4 (総プール数), エントリ @8 から20バイトずつ
//      {order u32, count u32, size u32, low u32, high u32}
pub fn info_bufs(dev: &Device, _task: &TaskContext, arg: &mut [u8]) -> Result<(), DrmError> {
    let capacity = read_u32(arg, 0)? as usize;
    let info = dev.info_bufs();

    write_u32(arg, 4, info.len() as u32)?;
    for (i, pool) in info.iter().take(capacity).enumerate() {
        let base = 8 + i * 20;
        write_u32(arg, base, pool.order as u32)?;
        write_u32(arg, base + 4, pool.count as u32)?;
        write_u32(arg, base + 8, pool.size as u32)?;
        write_u32(arg, base + 12, pool.low_mark as u32)?;
        write_u32(arg, base + 16, pool.high_mark as u32)?;
    }
    Ok(())
}

// in:  capacity u32 @0
// out: count u32 @4 (総本数), エントリ @8 から16バイトずつ
//      {index u32, total u32, offset u64}
pub fn map_bufs(dev: &Device, _task: &TaskContext, arg: &mut [u8]) -> Result<(), DrmError> {
    let capacity = read_u32(arg, 0)? as usize;
    // 応答が溢れるなら buf_use を立てる前に拒否する
    let total = dev.info_bufs().iter().map(|p| p.count).sum::<usize>();
    if total > capacity || arg.len() < 8 + total * 16 {
        return Err(DrmError::BadAddress);
    }

    let handles = dev.map_bufs();
    write_u32(arg, 4, handles.len() as u32)?;
    for (i, (index, total, offset)) in handles.iter().enumerate() {
        let base = 8 + i * 16;
        write_u32(arg, base, index.as_raw())?;
        write_u32(arg, base + 4, *total as u32)?;
        write_u64(arg, base + 8, *offset as u64)?;
    }
    Ok(())
}

// in: count u32 @0, インデックス u32×count @4
pub fn free_bufs(dev: &Device, task: &TaskContext, arg: &mut [u8]) -> Result<(), DrmError> {
    let count = read_u32(arg, 0)? as usize;
    if arg.len() < 4 + count * 4 {
        return Err(DrmError::BadAddress);
    }
    let mut indices = Vec::with_capacity(count);
    for i in 0..count {
        indices.push(BufferIndex::new(read_u32(arg, 4 + i * 4)?));
    }
    dev.free_bufs(task, &indices)
}

// in:  flags u32 @4
// out: handle u32 @0
pub fn add_ctx(dev: &Device, _task: &TaskContext, arg: &mut [u8]) -> Result<(), DrmError> {
    let flags = CtxFlags::from_bits_truncate(read_u32(arg, 4)?);
    let _ = read_u32(arg, 0)?;
    let id = dev.alloc_context(flags)?;
    write_u32(arg, 0, id as u32)
}

// in: handle u32 @0
pub fn rm_ctx(dev: &Device, _task: &TaskContext, arg: &mut [u8]) -> Result<(), DrmError> {
    let id = read_u32(arg, 0)? as usize;
    dev.rm_context(id)
}

// in: handle u32 @0, flags u32 @4
pub fn mod_ctx(dev: &Device, _task: &TaskContext, arg: &mut [u8]) -> Result<(), DrmError> {
    let id = read_u32(arg, 0)? as usize;
    let flags = CtxFlags::from_bits_truncate(read_u32(arg, 4)?);
    dev.mod_ctx_flags(id, flags)
}

// in:  handle u32 @0
// out: flags u32 @4
pub fn get_ctx(dev: &Device, _task: &TaskContext, arg: &mut [u8]) -> Result<(), DrmError> {
    let id = read_u32(arg, 0)? as usize;
    let _ = read_u32(arg, 4)?;
    let flags = dev.get_ctx_flags(id)?;
    write_u32(arg, 4, flags.bits())
}

// in: handle u32 @0
pub fn switch_ctx(dev: &Device, _task: &TaskContext, arg: &mut [u8]) -> Result<(), DrmError> {
    let id = read_u32(arg, 0)? as usize;
    dev.switch_ctx(id)
}

// in: handle u32 @0
pub fn new_ctx(dev: &Device, task: &TaskContext, arg: &mut [u8]) -> Result<(), DrmError> {
    let id = read_u32(arg, 0)? as usize;
    dev.new_ctx(task, id)
}

// in:  capacity u32 @0
// out: count u32 @4 (総割り当て数), ハンドル u32×min(capacity,count) @8
pub fn res_ctx(dev: &Device, _task: &TaskContext, arg: &mut [u8]) -> Result<(), DrmError> {
    let capacity = read_u32(arg, 0)? as usize;
    let ids = dev.res_ctx();
    write_u32(arg, 4, ids.len() as u32)?;
    for (i, id) in ids.iter().take(capacity).enumerate() {
        write_u32(arg, 8 + i * 4, *id as u32)?;
    }
    Ok(())
}

// in: context u32 @0, flags u32 @4
pub fn lock(dev: &Device, task: &TaskContext, arg: &mut [u8]) -> Result<(), DrmError> {
    let context = read_u32(arg, 0)? as usize;
    let flags = LockFlags::from_bits_truncate(read_u32(arg, 4)?);
    dev.lock_hw(task, context, flags)
}

// in: context u32 @0
pub fn unlock(dev: &Device, task: &TaskContext, arg: &mut [u8]) -> Result<(), DrmError> {
    let context = read_u32(arg, 0)? as usize;
    dev.unlock_hw(task, context)
}

// in: context u32 @0
pub fn finish(dev: &Device, task: &TaskContext, arg: &mut [u8]) -> Result<(), DrmError> {
    let context = read_u32(arg, 0)? as usize;
    dev.finish_hw(task, context)
}

// in:  context u32 @0, send_count u32 @4, request_count u32 @8,
//      request_size u32 @12, flags u32 @16,
//      送出インデックス u32×send_count @24
// out: granted_count u32 @20,
//      取得エントリ {index u32, total u32} ×granted_count
//      @24 + 4×send_count
pub fn dma(dev: &Device, task: &TaskContext, arg: &mut [u8]) -> Result<(), DrmError> {
    let context = read_u32(arg, 0)? as usize;
    let send_count = read_u32(arg, 4)? as usize;
    let request_count = read_u32(arg, 8)? as usize;
    let request_size = read_u32(arg, 12)? as usize;
    let flags = DmaFlags::from_bits_truncate(read_u32(arg, 16)?);

    // 入出力の全域を先に検証する
    let needed = 24 + send_count * 4 + request_count * 8;
    if arg.len() < needed {
        return Err(DrmError::BadAddress);
    }

    let mut send = Vec::with_capacity(send_count);
    for i in 0..send_count {
        send.push(BufferIndex::new(read_u32(arg, 24 + i * 4)?));
    }

    let req = DmaRequest {
        context,
        send,
        request_count,
        request_size,
        flags,
    };
    let grants = dev.dma(task, &req)?;

    write_u32(arg, 20, grants.len() as u32)?;
    let base = 24 + send_count * 4;
    for (i, grant) in grants.iter().enumerate() {
        write_u32(arg, base + i * 8, grant.index.as_raw())?;
        write_u32(arg, base + i * 8 + 4, grant.total as u32)?;
    }
    Ok(())
}
