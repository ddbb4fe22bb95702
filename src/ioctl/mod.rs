// ============================================================================
// src/ioctl/mod.rs - リクエストディスパッチ（固定オペコード表）
//
// 番号順の固定記述子表。各記述子はハンドラと権限フラグ
// （認証必須 / 特権必須）を持ち、入口で一律に検査してから委譲する。
// 未知のオペコードは表引き以前に拒否する。
// ============================================================================
#![allow(dead_code)]

pub mod args;
pub mod handlers;

use crate::device::Device;
use crate::error::{DrmError, InvalidKind};
use crate::process::TaskContext;

/// リクエストのオペコード
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum Opcode {
    AddMap = 0,
    AddBufs = 1,
    MarkBufs = 2,
    InfoBufs = 3,
    MapBufs = 4,
    FreeBufs = 5,
    AddCtx = 6,
    RmCtx = 7,
    ModCtx = 8,
    GetCtx = 9,
    SwitchCtx = 10,
    NewCtx = 11,
    ResCtx = 12,
    Lock = 13,
    Unlock = 14,
    Finish = 15,
    Dma = 16,
}

impl Opcode {
    pub fn from_raw(raw: u32) -> Result<Self, DrmError> {
        Ok(match raw {
            0 => Self::AddMap,
            1 => Self::AddBufs,
            2 => Self::MarkBufs,
            3 => Self::InfoBufs,
            4 => Self::MapBufs,
            5 => Self::FreeBufs,
            6 => Self::AddCtx,
            7 => Self::RmCtx,
            8 => Self::ModCtx,
            9 => Self::GetCtx,
            10 => Self::SwitchCtx,
            11 => Self::NewCtx,
            12 => Self::ResCtx,
            13 => Self::Lock,
            14 => Self::Unlock,
            15 => Self::Finish,
            16 => Self::Dma,
            _ => return Err(DrmError::InvalidArgument(InvalidKind::Opcode)),
        })
    }
}

/// ハンドラ関数の型
pub type Handler = fn(&Device, &TaskContext, &mut [u8]) -> Result<(), DrmError>;

/// オペコード記述子
pub struct IoctlDesc {
    pub opcode: Opcode,
    pub handler: Handler,
    /// 認証済みハンドルのみ
    pub auth_required: bool,
    /// 特権調停プロセスのみ
    pub root_only: bool,
}

const fn desc(opcode: Opcode, handler: Handler, auth: bool, root: bool) -> IoctlDesc {
    IoctlDesc {
        opcode,
        handler,
        auth_required: auth,
        root_only: root,
    }
}

/// 固定ディスパッチ表（オペコード番号順）
pub static IOCTL_TABLE: [IoctlDesc; 17] = [
    desc(Opcode::AddMap, handlers::add_map, true, true),
    desc(Opcode::AddBufs, handlers::add_bufs, true, true),
    desc(Opcode::MarkBufs, handlers::mark_bufs, true, true),
    desc(Opcode::InfoBufs, handlers::info_bufs, true, false),
    desc(Opcode::MapBufs, handlers::map_bufs, true, false),
    desc(Opcode::FreeBufs, handlers::free_bufs, true, false),
    desc(Opcode::AddCtx, handlers::add_ctx, true, true),
    desc(Opcode::RmCtx, handlers::rm_ctx, true, true),
    desc(Opcode::ModCtx, handlers::mod_ctx, true, true),
    desc(Opcode::GetCtx, handlers::get_ctx, true, false),
    desc(Opcode::SwitchCtx, handlers::switch_ctx, true, true),
    desc(Opcode::NewCtx, handlers::new_ctx, true, true),
    desc(Opcode::ResCtx, handlers::res_ctx, true, false),
    desc(Opcode::Lock, handlers::lock, true, false),
    desc(Opcode::Unlock, handlers::unlock, true, false),
    desc(Opcode::Finish, handlers::finish, true, false),
    desc(Opcode::Dma, handlers::dma, true, false),
];

/// リクエスト入口
///
/// 権限検査はハンドラ委譲の前に一律で行う。検査に落ちた場合、引数
/// バイト像にもデバイス状態にも変化はない。
pub fn ioctl(
    dev: &Device,
    task: &TaskContext,
    opcode: u32,
    arg: &mut [u8],
) -> Result<(), DrmError> {
    let op = Opcode::from_raw(opcode)?;
    let entry = &IOCTL_TABLE[op as usize];
    debug_assert_eq!(entry.opcode, op);

    if entry.auth_required && !task.is_authenticated() {
        return Err(DrmError::PermissionDenied);
    }
    if entry.root_only && !task.is_privileged() {
        return Err(DrmError::PermissionDenied);
    }
    (entry.handler)(dev, task, arg)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::process::ProcessId;

    fn setup() -> Device {
        Device::with_defaults()
    }

    fn add_bufs_arg(count: u32, size: u32) -> [u8; 16] {
        let mut arg = [0u8; 16];
        arg[0..4].copy_from_slice(&count.to_le_bytes());
        arg[4..8].copy_from_slice(&size.to_le_bytes());
        arg
    }

    #[test]
    fn test_unknown_opcode_rejected() {
        let dev = setup();
        let task = TaskContext::privileged(ProcessId::new(1));
        let mut arg = [0u8; 16];
        assert_eq!(
            ioctl(&dev, &task, 99, &mut arg).unwrap_err(),
            DrmError::InvalidArgument(InvalidKind::Opcode)
        );
    }

    #[test]
    fn test_unauthenticated_rejected_without_mutation() {
        let dev = setup();
        let task = TaskContext::unauthenticated(ProcessId::new(1));
        let mut arg = add_bufs_arg(4, 4096);
        let before = arg;

        assert_eq!(
            ioctl(&dev, &task, Opcode::AddBufs as u32, &mut arg).unwrap_err(),
            DrmError::PermissionDenied
        );
        assert_eq!(arg, before);
        assert!(dev.info_bufs().is_empty());
    }

    #[test]
    fn test_root_only_rejects_plain_client() {
        let dev = setup();
        let task = TaskContext::new(ProcessId::new(1));
        let mut arg = add_bufs_arg(4, 4096);

        assert_eq!(
            ioctl(&dev, &task, Opcode::AddBufs as u32, &mut arg).unwrap_err(),
            DrmError::PermissionDenied
        );
        assert!(dev.info_bufs().is_empty());
    }

    #[test]
    fn test_add_bufs_roundtrip() {
        let dev = setup();
        let root = TaskContext::privileged(ProcessId::new(1));
        let mut arg = add_bufs_arg(8, 4096);

        ioctl(&dev, &root, Opcode::AddBufs as u32, &mut arg).unwrap();
        assert_eq!(u32::from_le_bytes(arg[0..4].try_into().unwrap()), 8);
        assert_eq!(u32::from_le_bytes(arg[4..8].try_into().unwrap()), 4096);
        assert_eq!(u32::from_le_bytes(arg[12..16].try_into().unwrap()), 12);
    }

    /// 短すぎる引数像は BadAddress で拒否され、デバイス状態は不変
    #[test]
    fn test_short_argument_no_mutation() {
        let dev = setup();
        let root = TaskContext::privileged(ProcessId::new(1));

        let mut short = [0u8; 6];
        short[0..4].copy_from_slice(&8u32.to_le_bytes());
        assert_eq!(
            ioctl(&dev, &root, Opcode::AddBufs as u32, &mut short).unwrap_err(),
            DrmError::BadAddress
        );
        assert!(dev.info_bufs().is_empty());
    }

    #[test]
    fn test_ctx_lifecycle_through_table() {
        let dev = setup();
        let root = TaskContext::privileged(ProcessId::new(1));

        // ADD_CTX
        let mut arg = [0u8; 8];
        arg[4..8].copy_from_slice(&1u32.to_le_bytes()); // PRESERVED
        ioctl(&dev, &root, Opcode::AddCtx as u32, &mut arg).unwrap();
        let handle = u32::from_le_bytes(arg[0..4].try_into().unwrap());
        assert_ne!(handle, 0);

        // GET_CTX でフラグが読める
        let mut get = [0u8; 8];
        get[0..4].copy_from_slice(&handle.to_le_bytes());
        ioctl(&dev, &root, Opcode::GetCtx as u32, &mut get).unwrap();
        assert_eq!(u32::from_le_bytes(get[4..8].try_into().unwrap()), 1);

        // RM_CTX
        let mut rm = [0u8; 8];
        rm[0..4].copy_from_slice(&handle.to_le_bytes());
        ioctl(&dev, &root, Opcode::RmCtx as u32, &mut rm).unwrap();

        // 除去後のGET_CTXは失敗する
        assert_eq!(
            ioctl(&dev, &root, Opcode::GetCtx as u32, &mut get).unwrap_err(),
            DrmError::InvalidArgument(InvalidKind::ContextId)
        );
    }

    #[test]
    fn test_lock_unlock_through_table() {
        let dev = setup();
        let root = TaskContext::privileged(ProcessId::new(1));

        let mut add = [0u8; 8];
        ioctl(&dev, &root, Opcode::AddCtx as u32, &mut add).unwrap();
        let handle = u32::from_le_bytes(add[0..4].try_into().unwrap());

        let mut arg = [0u8; 8];
        arg[0..4].copy_from_slice(&handle.to_le_bytes());
        ioctl(&dev, &root, Opcode::Lock as u32, &mut arg).unwrap();
        assert!(dev.hw_lock().is_held());

        ioctl(&dev, &root, Opcode::Unlock as u32, &mut arg).unwrap();
        assert!(!dev.hw_lock().is_held());
    }
}
