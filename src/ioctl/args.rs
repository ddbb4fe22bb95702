// ============================================================================
// src/ioctl/args.rs - リクエスト引数の転写ヘルパ
//
// 引数はリトルエンディアンの固定オフセットのバイト像として渡される。
// 範囲外アクセスは BadAddress（呼び出し元メモリとのコピー失敗のモデル）。
// ハンドラは「全読み取り → 実行 → 全書き戻し」の順を守り、復号失敗時に
// デバイス状態へ触れないこと。
// ============================================================================
#![allow(dead_code)]

use crate::error::DrmError;

/// 指定オフセットから u32 を読む
pub fn read_u32(arg: &[u8], offset: usize) -> Result<u32, DrmError> {
    let end = offset.checked_add(4).ok_or(DrmError::BadAddress)?;
    let bytes = arg.get(offset..end).ok_or(DrmError::BadAddress)?;
    Ok(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
}

/// 指定オフセットから u64 を読む
pub fn read_u64(arg: &[u8], offset: usize) -> Result<u64, DrmError> {
    let end = offset.checked_add(8).ok_or(DrmError::BadAddress)?;
    let bytes = arg.get(offset..end).ok_or(DrmError::BadAddress)?;
    let mut raw = [0u8; 8];
    raw.copy_from_slice(bytes);
    Ok(u64::from_le_bytes(raw))
}

/// 指定オフセットへ u32 を書く
pub fn write_u32(arg: &mut [u8], offset: usize, value: u32) -> Result<(), DrmError> {
    let end = offset.checked_add(4).ok_or(DrmError::BadAddress)?;
    let bytes = arg.get_mut(offset..end).ok_or(DrmError::BadAddress)?;
    bytes.copy_from_slice(&value.to_le_bytes());
    Ok(())
}

/// 指定オフセットへ u64 を書く
pub fn write_u64(arg: &mut [u8], offset: usize, value: u64) -> Result<(), DrmError> {
    let end = offset.checked_add(8).ok_or(DrmError::BadAddress)?;
    let bytes = arg.get_mut(offset..end).ok_or(DrmError::BadAddress)?;
    bytes.copy_from_slice(&value.to_le_bytes());
    Ok(())
}
