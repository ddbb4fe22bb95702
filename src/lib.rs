// ============================================================================
// src/lib.rs - drmk: GPUコマンドDMAドライバフレームワーク中核
//
// 複数の非特権プロセスと単一の特権調停プロセスが、GPUコマンドDMAバッファと
// ハードウェア直列化ロックを共有するための並行性/資源管理コア。
//
// 構成（依存順、葉から）:
// - mm:     セグメントアロケータ / サイズクラス別バッファプール / フリーリスト
// - ctx:    ハードウェアコンテキスト表と待機リスト（Waitlist）
// - lock:   デバイス単位のハードウェア排他ロック（CASワード）
// - dma:    DMAディスパッチスケジューラとデバイス大域DMA状態
// - ioctl:  固定オペコード表によるリクエストディスパッチ
// - notify: 調停プロセス向け非同期通知チャネル（循環テキストバッファ）
//
// ベンダ固有のコマンド符号化、物理/仮想マッピング、PCI資源検出は
// 外部協調者であり、本クレートの対象外。
// ============================================================================
#![cfg_attr(not(any(feature = "std", test)), no_std)]

extern crate alloc;

#[cfg(any(feature = "std", test))]
extern crate std;

pub mod ctx;
pub mod device;
pub mod dma;
pub mod error;
pub mod ioctl;
pub mod lock;
pub mod mm;
pub mod notify;
pub mod process;
pub mod sync;

pub use device::{Device, DeviceConfig};
pub use error::DrmError;
pub use process::{ProcessId, TaskContext};
