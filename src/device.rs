// ============================================================================
// src/device.rs - デバイスオブジェクト
//
// プール/コンテキスト/ロック/スケジューラの集約。プロセス大域の
// シングルトンにはせず、全操作が &Device を受け取る明示オブジェクトに
// する（テストで独立インスタンスを複数立てられる）。
//
// ロック規律:
// - 短命な更新は各構造のスピンロック
// - 複数段の構造変更（プール作成・コンテキスト表拡張）は struct_lock
// - ハードウェアロックワードはCASのみ。struct_lock の下では触らない
// ============================================================================
#![allow(dead_code)]

use alloc::boxed::Box;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicU64, Ordering};

use bitflags::bitflags;
use hashbrown::HashMap;

use crate::ctx::{ContextTable, CtxFlags, HwContext, KERNEL_CONTEXT};
use crate::dma::{DmaBackend, DmaState, LogBackend, Selection, Scheduler};
use crate::error::{DrmError, InvalidKind, OwnershipError, ResourceError};
use crate::lock::HardwareLock;
use crate::mm::buffer::{BufFlags, BufState, Buffer, BufferIndex};
use crate::mm::pool::{order_of, BufferPool, MAX_ORDER, MIN_ORDER};
use crate::mm::segment::{RamSegments, SegmentSource};
use crate::notify::NotifyChannel;
use crate::process::{ProcessId, TaskContext};

/// デバイス構成
#[derive(Debug, Clone, Copy)]
pub struct DeviceConfig {
    /// スケジューラのタイムスライス（ティック）
    pub time_slice_ticks: u64,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            time_slice_ticks: 20,
        }
    }
}

bitflags! {
    /// マッピング登録の属性（登録簿のみ。実マッピングは外部協調者）
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct MapFlags: u32 {
        const RESTRICTED      = 1 << 0;
        const READ_ONLY       = 1 << 1;
        const LOCKED          = 1 << 2;
        const WRITE_COMBINING = 1 << 3;
    }
}

/// マッピング対象の種別
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MapKind {
    FrameBuffer,
    Registers,
    ShmArea,
    AgpArea,
}

impl MapKind {
    pub fn from_raw(raw: u32) -> Result<Self, DrmError> {
        match raw {
            0 => Ok(Self::FrameBuffer),
            1 => Ok(Self::Registers),
            2 => Ok(Self::ShmArea),
            3 => Ok(Self::AgpArea),
            _ => Err(DrmError::InvalidArgument(InvalidKind::Size)),
        }
    }

    pub fn as_raw(self) -> u32 {
        match self {
            Self::FrameBuffer => 0,
            Self::Registers => 1,
            Self::ShmArea => 2,
            Self::AgpArea => 3,
        }
    }
}

/// マッピング登録エントリ
#[derive(Debug, Clone, Copy)]
pub struct MapEntry {
    pub offset: u64,
    pub size: u64,
    pub kind: MapKind,
    pub flags: MapFlags,
}

bitflags! {
    /// ロック獲得時の付帯要求
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct LockFlags: u32 {
        /// 獲得前にハードウェアの静止を待つ
        const QUIESCENT  = 1 << 0;
        /// 獲得前に保留DMAを掃き切る
        const FLUSH      = 1 << 1;
        /// 全コンテキストの保留DMAを掃き切る
        const FLUSH_ALL  = 1 << 2;
    }
}

bitflags! {
    /// DMA要求の付帯フラグ
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct DmaFlags: u32 {
        /// 空きが出るまでブロックして要求本数を満たす
        const BLOCK = 1 << 0;
        /// ハードウェアロック保持中の送出であることを記録
        const WHILE_LOCKED = 1 << 1;
    }
}

/// DMA要求（送出N本 + 取得M本の複合）
pub struct DmaRequest {
    pub context: usize,
    pub send: Vec<BufferIndex>,
    pub request_count: usize,
    pub request_size: usize,
    pub flags: DmaFlags,
}

/// 取得できたバッファ1本分の応答
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DmaGrant {
    pub index: BufferIndex,
    pub total: usize,
}

/// プール1つ分の情報（INFO_BUFS応答）
#[derive(Debug, Clone, Copy)]
pub struct PoolInfo {
    pub order: u8,
    pub count: usize,
    pub size: usize,
    pub low_mark: usize,
    pub high_mark: usize,
}

/// GPU DMAデバイス1台分
pub struct Device {
    config: DeviceConfig,
    /// 粗粒度構造ミューテックス（表拡張・プール作成の直列化）
    struct_lock: spin::Mutex<()>,
    dma: spin::RwLock<DmaState>,
    contexts: ContextTable,
    hw_lock: HardwareLock,
    sched: Scheduler,
    notify: NotifyChannel,
    maps: spin::Mutex<HashMap<u64, MapEntry>>,
    backend: Arc<dyn DmaBackend>,
    segments: Box<dyn SegmentSource>,
    /// 時間基盤（埋め込み側のタイマ割り込みが進める）
    ticks: AtomicU64,
    /// ハードウェアで実行中のバッファ（1本ずつ）
    in_flight: spin::Mutex<Option<Arc<Buffer>>>,
}

impl Device {
    pub fn new(
        config: DeviceConfig,
        backend: Arc<dyn DmaBackend>,
        segments: Box<dyn SegmentSource>,
    ) -> Self {
        let dev = Self {
            struct_lock: spin::Mutex::new(()),
            dma: spin::RwLock::new(DmaState::new()),
            contexts: ContextTable::new(),
            hw_lock: HardwareLock::new(),
            sched: Scheduler::new(config.time_slice_ticks),
            notify: NotifyChannel::new(),
            maps: spin::Mutex::new(HashMap::new()),
            backend,
            segments,
            ticks: AtomicU64::new(0),
            in_flight: spin::Mutex::new(None),
            config,
        };
        // 特権調停者の予約コンテキスト（ID 0）を先に確保しておく
        match dev.contexts.alloc(&dev.struct_lock, 1) {
            Ok((id, _)) => debug_assert_eq!(id, KERNEL_CONTEXT),
            Err(e) => log::error!("device: failed to reserve kernel context: {e}"),
        }
        dev
    }

    /// 既定構成（ログバックエンド + RAMセグメント）
    pub fn with_defaults() -> Self {
        Self::new(
            DeviceConfig::default(),
            Arc::new(LogBackend),
            Box::new(RamSegments::new()),
        )
    }

    // ------------------------------------------------------------------
    // 時間基盤
    // ------------------------------------------------------------------

    #[inline]
    pub fn now(&self) -> u64 {
        self.ticks.load(Ordering::Acquire)
    }

    /// ティックを進める。組まれていた切替遅延が満了していれば再キック
    pub fn advance_ticks(&self, n: u64) {
        let now = self.ticks.fetch_add(n, Ordering::AcqRel) + n;
        if let Some(deadline) = self.sched.deferred_until() {
            if now >= deadline {
                self.kick();
            }
        }
    }

    // ------------------------------------------------------------------
    // マッピング登録（ADD_MAP）
    // ------------------------------------------------------------------

    /// マッピング記録を登録する。実マッピングは外部協調者が行う
    pub fn add_map(&self, entry: MapEntry) -> Result<(), DrmError> {
        if entry.size == 0 {
            return Err(DrmError::InvalidArgument(InvalidKind::Size));
        }
        let mut maps = self.maps.lock();
        if maps.contains_key(&entry.offset) {
            return Err(DrmError::Resource(ResourceError::Busy));
        }
        maps.insert(entry.offset, entry);
        Ok(())
    }

    pub fn find_map(&self, offset: u64) -> Option<MapEntry> {
        self.maps.lock().get(&offset).copied()
    }

    // ------------------------------------------------------------------
    // バッファプール
    // ------------------------------------------------------------------

    /// サイズクラス別プールを作成する（ADD_BUFS）
    ///
    /// 進行中カウンタと粘着フラグの読み書きは struct_lock 下に置き、
    /// 検査と作成を1つの臨界区間で行う（相互の検査が食い違わない）。
    pub fn create_pool(
        &self,
        count: usize,
        size: usize,
        page_align: bool,
    ) -> Result<(u8, usize), DrmError> {
        let order = order_of(size)?;
        if !(MIN_ORDER..=MAX_ORDER).contains(&order) {
            return Err(DrmError::InvalidArgument(InvalidKind::Order));
        }

        let _guard = self.struct_lock.lock();
        {
            let dma = self.dma.read();
            if dma.buf_use() {
                return Err(DrmError::Resource(ResourceError::Busy));
            }
            if dma.pool(order).is_some() {
                return Err(DrmError::Resource(ResourceError::OrderInUse));
            }
        }
        // バッファが飛行中ならプールは作れない
        if self.has_pending_work() {
            return Err(DrmError::Resource(ResourceError::Busy));
        }

        let start_index = self.dma.read().buf_count() as u32;
        self.dma.write().begin_alloc();
        let result = BufferPool::new(order, count, page_align, self.segments.as_ref(), start_index);
        let pool = match result {
            Ok(pool) => Arc::new(pool),
            Err(e) => {
                self.dma.write().end_alloc();
                return Err(e);
            }
        };
        let buf_size = pool.buf_size();

        // dma() は struct_lock を取らずに滞留を積むため、上の保留作業検査と
        // ここの間で滞留が生じ得る。Waitlist容量の作り直しをプール公開より
        // 先に行い、空でなく失敗した場合はプール未設置のまま返す
        let total = start_index as usize + pool.buf_count();
        if let Err(e) = self.contexts.resize_waitlists(total) {
            self.dma.write().end_alloc();
            return Err(e);
        }

        {
            let mut dma = self.dma.write();
            dma.install_pool(pool);
            dma.end_alloc();
        }

        log::debug!("device: pool order {order} created ({count} bufs of {buf_size} bytes)");
        Ok((order, count))
    }

    /// フリーリストのウォーターマークを設定する（MARK_BUFS）
    pub fn mark_bufs(&self, size: usize, low: usize, high: usize) -> Result<(), DrmError> {
        let order = order_of(size)?;
        let dma = self.dma.read();
        let pool = dma
            .pool(order)
            .ok_or(DrmError::InvalidArgument(InvalidKind::Order))?;
        pool.freelist().set_marks(low, high)
    }

    /// プール情報を列挙する（INFO_BUFS）
    pub fn info_bufs(&self) -> Vec<PoolInfo> {
        let dma = self.dma.read();
        dma.orders_in_use()
            .into_iter()
            .filter_map(|order| {
                dma.pool(order).map(|pool| {
                    let (low, high) = pool.freelist().marks();
                    PoolInfo {
                        order,
                        count: pool.buf_count(),
                        size: pool.buf_size(),
                        low_mark: low,
                        high_mark: high,
                    }
                })
            })
            .collect()
    }

    /// 全バッファのハンドルを公表し、buf_useを立てる（MAP_BUFS）
    pub fn map_bufs(&self) -> Vec<(BufferIndex, usize, usize)> {
        let _guard = self.struct_lock.lock();
        let mut dma = self.dma.write();
        dma.mark_buf_use();
        dma.buffers()
            .iter()
            .map(|b| (b.index(), b.total(), b.offset()))
            .collect()
    }

    /// 呼び出しプロセス所有のバッファを返却する（FREE_BUFS）
    ///
    /// 返却できるのは貸与中（どのリストにも属さない）のバッファのみ。
    /// 滞留中・飛行中の返却は、同一実体を二重にフリーリストへ載せる
    /// ことになるため所有権違反として拒否する。
    pub fn free_bufs(&self, task: &TaskContext, indices: &[BufferIndex]) -> Result<(), DrmError> {
        for &idx in indices {
            let buf = self.dma.read().buffer(idx)?;
            if buf.owner() != Some(task.pid()) {
                log::error!(
                    "device: pid {} freeing buffer {} owned by {:?}",
                    task.pid().as_raw(),
                    idx.as_raw(),
                    buf.owner().map(ProcessId::as_raw)
                );
                return Err(DrmError::Ownership(OwnershipError::NotOwner));
            }
            // CASで貸与中から外す。並行する二重返却もここで片方が弾かれる
            if let Err(state) = buf.transition(BufState::None, BufState::Free) {
                log::error!(
                    "device: pid {} freeing buffer {} in state {:?}",
                    task.pid().as_raw(),
                    idx.as_raw(),
                    state
                );
                return Err(DrmError::Ownership(OwnershipError::OnList));
            }
            self.release_to_freelist(&buf);
        }
        Ok(())
    }

    /// サイズクラスのフリーリストから1本取得する
    ///
    /// 非ブロッキング時は指定オーダーで出払っていれば上位オーダーを順に
    /// 探る（大きめのバッファで代用できる）。ブロッキング時は指定
    /// オーダーで待つ。
    pub fn acquire_buffer(
        &self,
        task: &TaskContext,
        size: usize,
        block: bool,
    ) -> Result<Arc<Buffer>, DrmError> {
        let order = order_of(size)?;
        let dma = self.dma.read();

        if block {
            let pool = dma
                .pool(order)
                .ok_or(DrmError::InvalidArgument(InvalidKind::Order))?
                .clone();
            drop(dma);
            let buf = pool.freelist().get(task, true)?;
            buf.set_owner(Some(task.pid()));
            return Ok(buf);
        }

        let mut probed_any = false;
        for o in order..=MAX_ORDER {
            if let Some(pool) = dma.pool(o) {
                probed_any = true;
                match pool.freelist().get(task, false) {
                    Ok(buf) => {
                        buf.set_owner(Some(task.pid()));
                        return Ok(buf);
                    }
                    Err(e) if e.is_exhausted() => continue,
                    Err(e) => return Err(e),
                }
            }
        }
        if probed_any {
            Err(DrmError::Resource(ResourceError::Exhausted))
        } else {
            Err(DrmError::InvalidArgument(InvalidKind::Order))
        }
    }

    /// バッファを所属サイズクラスのフリーリストへ戻す
    fn release_to_freelist(&self, buf: &Arc<Buffer>) {
        let dma = self.dma.read();
        match dma.pool(buf.order()) {
            Some(pool) => pool.freelist().put(buf.clone()),
            None => log::error!(
                "device: buffer {} has no pool for order {}",
                buf.index().as_raw(),
                buf.order()
            ),
        }
    }

    // ------------------------------------------------------------------
    // コンテキストライフサイクル
    // ------------------------------------------------------------------

    /// コンテキストを割り当てる（ADD_CTX）
    pub fn alloc_context(&self, flags: CtxFlags) -> Result<usize, DrmError> {
        let capacity = self.dma.read().buf_count();
        let (id, ctx) = self.contexts.alloc(&self.struct_lock, capacity)?;
        ctx.set_ctx_flags(flags);
        log::debug!("device: context {id} allocated");
        Ok(id)
    }

    /// コンテキストを除去する（RM_CTX）
    ///
    /// 滞留バッファは各フリーリストへ戻り、そのコンテキストで
    /// ブロックしている全待機者はエラー起床する。
    pub fn rm_context(&self, id: usize) -> Result<(), DrmError> {
        if id == KERNEL_CONTEXT {
            return Err(DrmError::InvalidArgument(InvalidKind::ContextId));
        }
        let ctx = self.contexts.get(id)?;
        // 終了者の保持分。未割り当てならここで弾かれる
        if !ctx.hold() {
            return Err(DrmError::InvalidArgument(InvalidKind::ContextId));
        }

        ctx.begin_finalize();

        // Waitlistを排出し、全量をフリーリストへ
        while let Some(buf) = ctx.waitlist().get() {
            self.release_to_freelist(&buf);
        }

        // ブロック中の読み手/書き手/フラッシュ待ちを全員エラー起床させる
        ctx.read_wait().wake_all();
        ctx.write_wait().wake_all();
        ctx.flush_wait().wake_all();

        ctx.end_finalize();
        log::debug!("device: context {id} removed");
        Ok(())
    }

    /// コンテキスト属性を読む（GET_CTX）
    pub fn get_ctx_flags(&self, id: usize) -> Result<CtxFlags, DrmError> {
        let ctx = self.allocated(id)?;
        Ok(ctx.ctx_flags())
    }

    /// コンテキスト属性を変更する（MOD_CTX）
    pub fn mod_ctx_flags(&self, id: usize, flags: CtxFlags) -> Result<(), DrmError> {
        let ctx = self.allocated(id)?;
        ctx.set_ctx_flags(flags);
        Ok(())
    }

    /// 割り当て済みコンテキストのID一覧（RES_CTX）
    pub fn res_ctx(&self) -> Vec<usize> {
        self.contexts.allocated_ids()
    }

    /// 非同期コンテキスト切替を要求する（SWITCH_CTX）
    ///
    /// 現行と同じ宛先なら何もしない。それ以外は通知チャネルへ1行書き、
    /// 読み手を起こす。実際の切替は調停者が NEW_CTX で完了させる。
    pub fn switch_ctx(&self, to: usize) -> Result<(), DrmError> {
        let _ = self.allocated(to)?;
        let from = self.sched.current().unwrap_or(KERNEL_CONTEXT);
        if from == to {
            return Ok(());
        }
        self.notify.post_switch(from, to);
        Ok(())
    }

    /// コンテキスト切替を完了する（NEW_CTX、調停者のみ）
    ///
    /// 現行コンテキストを付け替え、ハードウェアロックを新所有者へ
    /// 無条件移譲する。
    pub fn new_ctx(&self, task: &TaskContext, to: usize) -> Result<(), DrmError> {
        let _ = self.allocated(to)?;
        self.sched.set_current(to, self.now());
        self.hw_lock.transfer(to, task.pid());
        Ok(())
    }

    fn allocated(&self, id: usize) -> Result<Arc<HwContext>, DrmError> {
        let ctx = self.contexts.get(id)?;
        if !ctx.is_allocated() {
            return Err(DrmError::InvalidArgument(InvalidKind::ContextId));
        }
        Ok(ctx)
    }

    // ------------------------------------------------------------------
    // ハードウェアロック
    // ------------------------------------------------------------------

    /// ロックをブロッキング獲得する（LOCK）
    pub fn lock_hw(
        &self,
        task: &TaskContext,
        context: usize,
        flags: LockFlags,
    ) -> Result<(), DrmError> {
        let _ = self.allocated(context)?;
        self.hw_lock.take_blocking(task, context)?;
        if flags.intersects(LockFlags::QUIESCENT | LockFlags::FLUSH | LockFlags::FLUSH_ALL) {
            self.backend.quiesce();
        }
        Ok(())
    }

    /// ロックを解放する（UNLOCK）
    ///
    /// 解放権限の照合: 獲得時に記録したプロセスか特権調停者のみ。
    pub fn unlock_hw(&self, task: &TaskContext, context: usize) -> Result<(), DrmError> {
        if !task.is_privileged() && self.hw_lock.holder_pid() != Some(task.pid()) {
            log::error!(
                "device: pid {} unlocking lock held by pid {:?}",
                task.pid().as_raw(),
                self.hw_lock.holder_pid().map(ProcessId::as_raw)
            );
            return Err(DrmError::Ownership(OwnershipError::NotLockOwner));
        }
        self.hw_lock.free(context)?;
        // 解放で送出の機会ができたかもしれない
        self.kick();
        Ok(())
    }

    /// 静止してから解放する（FINISH）
    pub fn finish_hw(
        &self,
        task: &TaskContext,
        context: usize,
    ) -> Result<(), DrmError> {
        self.flush_context(task, context)?;
        self.backend.quiesce();
        self.unlock_hw(task, context)
    }

    /// コンテキストの滞留と飛行中バッファが掃けるまで待つ
    ///
    /// コンテキスト終了処理に巻き込まれた場合は ContextId エラーで
    /// 起床する（待機者を残さないため）。
    pub fn flush_context(&self, task: &TaskContext, context: usize) -> Result<(), DrmError> {
        let ctx = self.allocated(context)?;
        ctx.flush_wait().wait_until(task, || {
            if ctx.in_finalization() {
                return Err(DrmError::InvalidArgument(InvalidKind::ContextId));
            }
            if !ctx.waitlist().is_empty() {
                // 送出機会を逃さない
                self.kick();
                return Ok(false);
            }
            let in_flight = self.in_flight.lock();
            match in_flight.as_ref() {
                Some(buf) if buf.context() == Some(context) => Ok(false),
                _ => Ok(true),
            }
        })
    }

    #[inline]
    pub fn hw_lock(&self) -> &HardwareLock {
        &self.hw_lock
    }

    // ------------------------------------------------------------------
    // DMA送出と取得
    // ------------------------------------------------------------------

    /// 複合DMA要求: N本送出し、M本取得して返す（DMA）
    pub fn dma(&self, task: &TaskContext, req: &DmaRequest) -> Result<Vec<DmaGrant>, DrmError> {
        let ctx = self.allocated(req.context)?;
        if !ctx.hold() {
            return Err(DrmError::InvalidArgument(InvalidKind::ContextId));
        }
        let result = self.dma_inner(task, req, &ctx);
        ctx.release();
        result
    }

    fn dma_inner(
        &self,
        task: &TaskContext,
        req: &DmaRequest,
        ctx: &Arc<HwContext>,
    ) -> Result<Vec<DmaGrant>, DrmError> {
        // 送出側: 所有権とリスト状態を検査してWaitlistへ積む。
        // 途中で弾かれても先行分は積み終えているため、送出機会は逃さない
        let mut queued = 0usize;
        let mut submit = Ok(());
        for &idx in &req.send {
            let buf = match self.dma.read().buffer(idx) {
                Ok(buf) => buf,
                Err(e) => {
                    submit = Err(e);
                    break;
                }
            };
            if buf.owner() != Some(task.pid()) {
                log::error!(
                    "device: pid {} submitting buffer {} owned by {:?}",
                    task.pid().as_raw(),
                    idx.as_raw(),
                    buf.owner().map(ProcessId::as_raw)
                );
                submit = Err(DrmError::Ownership(OwnershipError::NotOwner));
                break;
            }
            // CASで貸与中から滞留へ遷移させる。既に滞留中・飛行中の実体や
            // 同一要求内の重複インデックスはここで弾かれる
            if let Err(state) = buf.transition(BufState::None, BufState::Wait) {
                log::error!(
                    "device: pid {} submitting buffer {} in state {:?}",
                    task.pid().as_raw(),
                    idx.as_raw(),
                    state
                );
                submit = Err(DrmError::Ownership(OwnershipError::OnList));
                break;
            }
            buf.set_context(Some(req.context));
            buf.insert_flags(BufFlags::WAITING);
            if req.flags.contains(DmaFlags::WHILE_LOCKED)
                || self.hw_lock.owner() == Some(req.context)
            {
                buf.insert_flags(BufFlags::WHILE_LOCKED);
            }
            if let Err(e) = ctx.waitlist().put(buf) {
                submit = Err(e);
                break;
            }
            queued += 1;
        }
        if queued > 0 {
            self.kick();
        }
        submit?;

        // 取得側: 要求本数まで集める。非ブロッキングで出払ったら
        // そこまでの部分応答を返す
        let block = req.flags.contains(DmaFlags::BLOCK);
        let mut grants = Vec::with_capacity(req.request_count);
        for _ in 0..req.request_count {
            match self.acquire_buffer(task, req.request_size, block) {
                Ok(buf) => grants.push(DmaGrant {
                    index: buf.index(),
                    total: buf.total(),
                }),
                Err(e) if e.is_exhausted() && !grants.is_empty() => break,
                Err(e) => {
                    if e == DrmError::Interrupted {
                        // 既に確保した分は返却して巻き戻す
                        for g in &grants {
                            if let Ok(buf) = self.dma.read().buffer(g.index) {
                                self.release_to_freelist(&buf);
                            }
                        }
                        return Err(e);
                    }
                    if grants.is_empty() {
                        return Err(e);
                    }
                    break;
                }
            }
        }
        Ok(grants)
    }

    /// ディスパッチ機会を検査し、可能なら1本送出する
    ///
    /// ハードウェアは同時に1本しか実行しない。完了（complete）でまた
    /// 呼ばれるため、ここでは多くとも1本だけ流す。
    pub fn kick(&self) {
        let mut in_flight = self.in_flight.lock();
        if in_flight.is_some() {
            return;
        }

        let contexts = self.contexts.snapshot();
        loop {
            match self.sched.select_next(&contexts, self.now()) {
                Selection::Run(id) => {
                    let Some(buf) = contexts[id].waitlist().get() else {
                        // 選択と取り出しの間に他者へ渡った。走査し直す
                        continue;
                    };
                    buf.remove_flags(BufFlags::WAITING);
                    buf.insert_flags(BufFlags::PENDING);
                    buf.set_state(BufState::Pend);
                    *in_flight = Some(buf.clone());
                    drop(in_flight);
                    self.backend.submit(id, &buf);
                    return;
                }
                Selection::Deferred { remaining } => {
                    log::trace!("device: context switch deferred for {remaining} ticks");
                    return;
                }
                Selection::Idle => return,
            }
        }
    }

    /// ハードウェア完了の呼び戻し
    ///
    /// 飛行中バッファをフリーリストへ戻し、フラッシュ待ちを起こし、
    /// 次の送出機会を探す。RECLAIM印のバッファもここで回収される。
    pub fn complete(&self, index: BufferIndex) -> Result<(), DrmError> {
        let buf = self.dma.read().buffer(index)?;
        {
            let mut in_flight = self.in_flight.lock();
            match in_flight.take() {
                Some(current) if Arc::ptr_eq(&current, &buf) => {}
                Some(current) => {
                    log::error!(
                        "device: completion for buffer {} but {} is in flight",
                        index.as_raw(),
                        current.index().as_raw()
                    );
                    *in_flight = Some(current);
                    return Err(DrmError::InvalidArgument(InvalidKind::BufferIndex));
                }
                None => {
                    log::warn!(
                        "device: completion for buffer {} with nothing in flight",
                        index.as_raw()
                    );
                    return Err(DrmError::InvalidArgument(InvalidKind::BufferIndex));
                }
            }
        }

        let owner_ctx = buf.context();
        self.release_to_freelist(&buf);
        if let Some(id) = owner_ctx {
            if let Ok(ctx) = self.contexts.get(id) {
                ctx.flush_wait().wake_all();
            }
        }
        self.kick();
        Ok(())
    }

    /// 現在飛行中のバッファ
    pub fn in_flight(&self) -> Option<BufferIndex> {
        self.in_flight.lock().as_ref().map(|b| b.index())
    }

    /// どこかに保留作業（滞留または飛行中）があるか
    pub fn has_pending_work(&self) -> bool {
        if self.in_flight.lock().is_some() {
            return true;
        }
        self.contexts
            .snapshot()
            .iter()
            .any(|ctx| ctx.has_pending_work())
    }

    // ------------------------------------------------------------------
    // プロセス消滅時の回収
    // ------------------------------------------------------------------

    /// デバイスハンドルを閉じたプロセスの全バッファを回収する
    ///
    /// 未送出分は即時フリーリストへ。飛行中の分はRECLAIM印を付け、
    /// 次の完了イベントで回収される（生きているプロセスへの再貸与を
    /// 防ぐ）。
    pub fn reclaim_buffers(&self, pid: ProcessId) {
        // Waitlist上の滞留分を抜き取って返す
        for ctx in self.contexts.snapshot() {
            let removed = ctx
                .waitlist()
                .remove_matching(|b| b.owner() == Some(pid));
            for buf in removed {
                self.release_to_freelist(&buf);
            }
        }

        // 貸与中（どのリストにも居ない）と飛行中を平坦表から拾う
        let buffers: Vec<Arc<Buffer>> = self
            .dma
            .read()
            .buffers()
            .iter()
            .filter(|b| b.owner() == Some(pid))
            .cloned()
            .collect();
        for buf in buffers {
            match buf.state() {
                BufState::None | BufState::Wait => self.release_to_freelist(&buf),
                BufState::Pend | BufState::Prio => {
                    buf.set_state(BufState::Reclaim);
                    log::debug!(
                        "device: buffer {} marked for reclaim (in flight)",
                        buf.index().as_raw()
                    );
                }
                BufState::Free | BufState::Reclaim => {}
            }
        }
    }

    /// ドライバ終了処理: 全フリーリストを閉じ、待機者を全員起こす
    pub fn shutdown(&self) {
        let dma = self.dma.read();
        for order in dma.orders_in_use() {
            if let Some(pool) = dma.pool(order) {
                pool.freelist().shutdown();
            }
        }
        drop(dma);
        for ctx in self.contexts.snapshot() {
            ctx.read_wait().wake_all();
            ctx.write_wait().wake_all();
            ctx.flush_wait().wake_all();
        }
    }

    // ------------------------------------------------------------------
    // 参照アクセサ
    // ------------------------------------------------------------------

    #[inline]
    pub fn notify(&self) -> &NotifyChannel {
        &self.notify
    }

    #[inline]
    pub fn contexts(&self) -> &ContextTable {
        &self.contexts
    }

    #[inline]
    pub fn config(&self) -> &DeviceConfig {
        &self.config
    }

    /// 指定オーダーのフリーリスト空き本数（診断用）
    pub fn free_count(&self, size: usize) -> Result<usize, DrmError> {
        let order = order_of(size)?;
        let dma = self.dma.read();
        let pool = dma
            .pool(order)
            .ok_or(DrmError::InvalidArgument(InvalidKind::Order))?;
        Ok(pool.freelist().count())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dev_with_pool(count: usize, size: usize) -> Device {
        let dev = Device::with_defaults();
        dev.create_pool(count, size, false).unwrap();
        dev
    }

    #[test]
    fn test_create_pool_rejects_duplicate_order() {
        let dev = dev_with_pool(4, 4096);
        assert_eq!(
            dev.create_pool(4, 4096, false).unwrap_err(),
            DrmError::Resource(ResourceError::OrderInUse)
        );
        // 別オーダーは作れる
        dev.create_pool(2, 8192, false).unwrap();
    }

    #[test]
    fn test_create_pool_forbidden_after_buf_use() {
        let dev = dev_with_pool(4, 4096);
        let _ = dev.map_bufs();
        assert_eq!(
            dev.create_pool(2, 8192, false).unwrap_err(),
            DrmError::Resource(ResourceError::Busy)
        );
    }

    #[test]
    fn test_create_pool_forbidden_with_pending_work() {
        let dev = dev_with_pool(4, 4096);
        let task = TaskContext::new(ProcessId::new(1));
        let ctx = dev.alloc_context(CtxFlags::empty()).unwrap();

        let buf = dev.acquire_buffer(&task, 4096, false).unwrap();
        let req = DmaRequest {
            context: ctx,
            send: alloc::vec![buf.index()],
            request_count: 0,
            request_size: 4096,
            flags: DmaFlags::empty(),
        };
        dev.dma(&task, &req).unwrap();

        assert_eq!(
            dev.create_pool(2, 8192, false).unwrap_err(),
            DrmError::Resource(ResourceError::Busy)
        );
    }

    #[test]
    fn test_create_pool_failure_leaves_order_reusable() {
        use crate::mm::pool::MAX_BUF_COUNT;

        let dev = Device::with_defaults();
        assert_eq!(
            dev.create_pool(MAX_BUF_COUNT + 1, 4096, false).unwrap_err(),
            DrmError::InvalidArgument(InvalidKind::Count)
        );
        // 失敗後に半端な設置が残っていれば OrderInUse になる
        dev.create_pool(4, 4096, false).unwrap();
    }

    #[test]
    fn test_acquire_probes_higher_orders() {
        let dev = Device::with_defaults();
        dev.create_pool(1, 4096, false).unwrap();
        dev.create_pool(1, 8192, false).unwrap();
        let task = TaskContext::new(ProcessId::new(1));

        let a = dev.acquire_buffer(&task, 4096, false).unwrap();
        assert_eq!(a.total(), 4096);
        // 4096側は出払ったので8192側で代用される
        let b = dev.acquire_buffer(&task, 4096, false).unwrap();
        assert_eq!(b.total(), 8192);
        assert!(dev
            .acquire_buffer(&task, 4096, false)
            .unwrap_err()
            .is_exhausted());
    }

    #[test]
    fn test_dma_submit_requires_ownership() {
        let dev = dev_with_pool(2, 4096);
        let alice = TaskContext::new(ProcessId::new(1));
        let mallory = TaskContext::new(ProcessId::new(2));
        let ctx = dev.alloc_context(CtxFlags::empty()).unwrap();

        let buf = dev.acquire_buffer(&alice, 4096, false).unwrap();
        let req = DmaRequest {
            context: ctx,
            send: alloc::vec![buf.index()],
            request_count: 0,
            request_size: 4096,
            flags: DmaFlags::empty(),
        };
        assert_eq!(
            dev.dma(&mallory, &req).unwrap_err(),
            DrmError::Ownership(OwnershipError::NotOwner)
        );
    }

    #[test]
    fn test_dma_rejects_duplicate_index_in_one_request() {
        let dev = dev_with_pool(2, 4096);
        let task = TaskContext::new(ProcessId::new(1));
        let ctx = dev.alloc_context(CtxFlags::empty()).unwrap();

        let buf = dev.acquire_buffer(&task, 4096, false).unwrap();
        let req = DmaRequest {
            context: ctx,
            send: alloc::vec![buf.index(), buf.index()],
            request_count: 0,
            request_size: 4096,
            flags: DmaFlags::empty(),
        };
        // 2本目の複製は既に滞留中として弾かれる
        assert_eq!(
            dev.dma(&task, &req).unwrap_err(),
            DrmError::Ownership(OwnershipError::OnList)
        );

        // 1本目の実体は送出され、完了後の空き数が総本数を超えない
        assert_eq!(dev.in_flight(), Some(buf.index()));
        dev.complete(buf.index()).unwrap();
        assert_eq!(dev.in_flight(), None);
        assert_eq!(dev.free_count(4096).unwrap(), 2);
    }

    #[test]
    fn test_free_bufs_rejects_queued_and_in_flight() {
        let dev = dev_with_pool(3, 4096);
        let task = TaskContext::new(ProcessId::new(1));
        let ctx = dev.alloc_context(CtxFlags::empty()).unwrap();

        let a = dev.acquire_buffer(&task, 4096, false).unwrap();
        let b = dev.acquire_buffer(&task, 4096, false).unwrap();
        dev.dma(
            &task,
            &DmaRequest {
                context: ctx,
                send: alloc::vec![a.index(), b.index()],
                request_count: 0,
                request_size: 4096,
                flags: DmaFlags::empty(),
            },
        )
        .unwrap();

        // aは飛行中、bは滞留。どちらも返却できない
        assert_eq!(dev.in_flight(), Some(a.index()));
        assert_eq!(
            dev.free_bufs(&task, &[a.index()]).unwrap_err(),
            DrmError::Ownership(OwnershipError::OnList)
        );
        assert_eq!(
            dev.free_bufs(&task, &[b.index()]).unwrap_err(),
            DrmError::Ownership(OwnershipError::OnList)
        );

        // 完了で掃けた後は全量がフリーリストへ戻る
        while let Some(idx) = dev.in_flight() {
            dev.complete(idx).unwrap();
        }
        assert_eq!(dev.free_count(4096).unwrap(), 3);
    }

    #[test]
    fn test_dispatch_and_complete_cycle() {
        let dev = dev_with_pool(2, 4096);
        let task = TaskContext::new(ProcessId::new(1));
        let ctx = dev.alloc_context(CtxFlags::empty()).unwrap();

        let buf = dev.acquire_buffer(&task, 4096, false).unwrap();
        let idx = buf.index();
        let req = DmaRequest {
            context: ctx,
            send: alloc::vec![idx],
            request_count: 0,
            request_size: 4096,
            flags: DmaFlags::empty(),
        };
        dev.dma(&task, &req).unwrap();

        // 送出済み（飛行中）になっている
        assert_eq!(dev.in_flight(), Some(idx));
        assert_eq!(dev.free_count(4096).unwrap(), 1);

        dev.complete(idx).unwrap();
        assert_eq!(dev.in_flight(), None);
        assert_eq!(dev.free_count(4096).unwrap(), 2);
    }

    #[test]
    fn test_rm_context_returns_queued_buffers() {
        let dev = dev_with_pool(4, 4096);
        let task = TaskContext::new(ProcessId::new(1));
        let c1 = dev.alloc_context(CtxFlags::empty()).unwrap();
        let c2 = dev.alloc_context(CtxFlags::empty()).unwrap();

        // c1を現行にしてスライスを占有させ、c2の滞留を動かさない
        let warm = dev.acquire_buffer(&task, 4096, false).unwrap();
        dev.dma(
            &task,
            &DmaRequest {
                context: c1,
                send: alloc::vec![warm.index()],
                request_count: 0,
                request_size: 4096,
                flags: DmaFlags::empty(),
            },
        )
        .unwrap();

        let a = dev.acquire_buffer(&task, 4096, false).unwrap();
        let b = dev.acquire_buffer(&task, 4096, false).unwrap();
        dev.dma(
            &task,
            &DmaRequest {
                context: c2,
                send: alloc::vec![a.index(), b.index()],
                request_count: 0,
                request_size: 4096,
                flags: DmaFlags::empty(),
            },
        )
        .unwrap();

        assert_eq!(dev.free_count(4096).unwrap(), 1);
        dev.rm_context(c2).unwrap();
        // 滞留2本がフリーリストへ戻る
        assert_eq!(dev.free_count(4096).unwrap(), 3);

        // スロットは再利用できる
        let c3 = dev.alloc_context(CtxFlags::empty()).unwrap();
        assert_eq!(c3, c2);
    }

    #[test]
    fn test_reclaim_frees_undispatched_and_flags_pending() {
        let dev = dev_with_pool(3, 4096);
        let task = TaskContext::new(ProcessId::new(9));
        let ctx = dev.alloc_context(CtxFlags::empty()).unwrap();

        let a = dev.acquire_buffer(&task, 4096, false).unwrap();
        let b = dev.acquire_buffer(&task, 4096, false).unwrap();
        let c = dev.acquire_buffer(&task, 4096, false).unwrap();

        // aは送出（飛行中）、bは滞留、cは貸与のまま
        dev.dma(
            &task,
            &DmaRequest {
                context: ctx,
                send: alloc::vec![a.index(), b.index()],
                request_count: 0,
                request_size: 4096,
                flags: DmaFlags::empty(),
            },
        )
        .unwrap();
        assert_eq!(dev.in_flight(), Some(a.index()));

        dev.reclaim_buffers(task.pid());

        // b(滞留)とc(貸与)は即時回収、a(飛行中)はRECLAIM印
        assert_eq!(dev.free_count(4096).unwrap(), 2);
        assert_eq!(a.state(), BufState::Reclaim);

        // 完了イベントで回収される
        dev.complete(a.index()).unwrap();
        assert_eq!(dev.free_count(4096).unwrap(), 3);
    }

    #[test]
    fn test_switch_ctx_noop_for_current() {
        let dev = dev_with_pool(2, 4096);
        let task = TaskContext::privileged(ProcessId::new(1));
        let c1 = dev.alloc_context(CtxFlags::empty()).unwrap();

        dev.new_ctx(&task, c1).unwrap();
        // 現行と同じ宛先は書き込みなし
        dev.switch_ctx(c1).unwrap();
        assert_eq!(dev.notify().pending_bytes(), 0);

        dev.switch_ctx(KERNEL_CONTEXT).unwrap();
        assert!(dev.notify().pending_bytes() > 0);
    }

    #[test]
    fn test_unlock_requires_holder_or_privilege() {
        let dev = dev_with_pool(2, 4096);
        let alice = TaskContext::new(ProcessId::new(1));
        let mallory = TaskContext::new(ProcessId::new(2));
        let root = TaskContext::privileged(ProcessId::new(3));
        let ctx = dev.alloc_context(CtxFlags::empty()).unwrap();

        dev.lock_hw(&alice, ctx, LockFlags::empty()).unwrap();
        assert_eq!(
            dev.unlock_hw(&mallory, ctx).unwrap_err(),
            DrmError::Ownership(OwnershipError::NotLockOwner)
        );
        // 特権調停者は解放できる
        dev.unlock_hw(&root, ctx).unwrap();
        assert!(!dev.hw_lock().is_held());
    }
}
