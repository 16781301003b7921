// ============================================================================
// src/io/usb/uhci/controller.rs - UHCI Controller
// ============================================================================
//!
//! # UHCI コントローラ本体
//!
//! - PCI ファンクションからのレジスタマップと初期化
//! - ルートポートのリセットとデバイスの列挙
//! - 割り込みハンドラ（周期転送の完了処理と待機者の起床）
//! - [`HostController`] の実装
//!
//! ## ロック
//! コントローラごとに 1 つの `spin::Mutex<UhciState>` がプール、
//! スケジュール、フレームリスト、パイプ一覧を守る。
//! コールバックは必ずロックを外して呼ぶ。
//!
//! ## 割り込みがない場合
//! IRQ を登録できなかったコントローラはポーリングで動く。
//! 同期転送の待機者はパークのティックごとに自分で [`Uhci::poll`] する。

use alloc::sync::{Arc, Weak};
use alloc::vec;
use alloc::vec::Vec;
use core::mem::ManuallyDrop;
use core::sync::atomic::{AtomicBool, Ordering};
use log::{debug, error, info, warn};
use spin::Mutex;

use super::frame_list::FrameList;
use super::hw::link;
use super::pipe::{IntrPipeState, IsocPipeState, isoc_td_count};
use super::poll::{TransferState, poll_queue};
use super::pool::{DescriptorPool, Ownership};
use super::regs::{
    FRBASEADD, FRNUM, FRNUM_MASK, PortSc, REGISTER_BAR, REGISTER_SPACE, USBCMD, USBINTR, USBSTS,
    UsbCmd, UsbIntr, UsbSts, portsc,
};
use super::schedule::{Anchor, Schedule};
use super::transfer::{TdChain, TdTarget, build_control, completed_bytes, mark_chain, release_chain};
use super::{QhPool, QhSlot, TdPool, UhciConfig};
use crate::error::{UsbError, UsbResult};
use crate::io::dma::DmaAllocator;
use crate::io::pci::{InterruptHandler, IrqHandle, PciFunction, RegisterWindow};
use crate::io::usb::hcd::{AddressAllocator, DeviceTarget, HostController};
use crate::io::usb::{
    DeviceAddress, InterruptPipe, IsochronousPipe, TransferDirection, UsbManager, UsbSpeed,
    usb_manager,
};
use crate::sync::wait_queue::{Parker, WaitQueue};

#[cfg(feature = "stats")]
use super::{UhciStats, UhciStatsSnapshot};

// ============================================================================
// Controller State
// ============================================================================

/// 完了待ちのコントロール転送
struct SyncTransfer {
    qh: QhSlot,
    chain: TdChain,
}

/// ロックで守られる状態
struct UhciState {
    tds: TdPool,
    qhs: QhPool,
    frames: FrameList,
    schedule: Schedule,
    intr_pipes: Vec<IntrPipeState>,
    isoc_pipes: Vec<IsocPipeState>,
    sync: Vec<SyncTransfer>,
}

impl UhciState {
    fn new(dma: &Arc<dyn DmaAllocator>, config: &UhciConfig) -> UsbResult<Self> {
        let tds = DescriptorPool::new(dma, config.td_pool_pages)?;
        let mut qhs = DescriptorPool::new(dma, config.qh_pool_pages)?;
        let frames = FrameList::new(dma)?;
        let schedule = Schedule::new(&mut qhs, &frames)?;
        Ok(Self {
            tds,
            qhs,
            frames,
            schedule,
            intr_pipes: Vec::new(),
            isoc_pipes: Vec::new(),
            sync: Vec::new(),
        })
    }

    /// 同期転送のどれかがハードウェアの処理を終えたか
    fn any_sync_settled(&self) -> bool {
        self.sync.iter().any(|transfer| {
            !matches!(
                poll_queue(&self.tds, self.qhs.get(transfer.qh), &transfer.chain),
                Ok(TransferState::Busy)
            )
        })
    }
}

/// 割り込み完了の後処理（ロック外で集めた結果）
enum Completion {
    Interrupt(Arc<InterruptPipe>),
    Isochronous {
        pipe: Arc<IsochronousPipe>,
        half: usize,
        sizes: Vec<u16>,
    },
}

// ============================================================================
// UHCI Controller
// ============================================================================

/// UHCI ホストコントローラ
pub struct Uhci {
    regs: Arc<dyn RegisterWindow>,
    pci: Arc<dyn PciFunction>,
    dma: Arc<dyn DmaAllocator>,
    config: UhciConfig,
    /// 停止を確認できなかった場合はドロップしない（DMA を解放しない）
    state: ManuallyDrop<Mutex<UhciState>>,
    waitq: WaitQueue,
    addresses: AddressAllocator,
    irq: Mutex<Option<IrqHandle>>,
    polled: AtomicBool,
    #[cfg(feature = "stats")]
    stats: UhciStats,
}

/// 割り込みハンドラとして登録する弱参照
///
/// PCI 側がハンドラを保持してもコントローラの寿命は延ばさない。
struct IrqShim(Weak<Uhci>);

impl InterruptHandler for IrqShim {
    fn handle_interrupt(&self) -> bool {
        self.0
            .upgrade()
            .is_some_and(|controller| controller.handle_interrupt())
    }
}

impl Uhci {
    /// PCI ファンクションにアタッチしてコントローラを起動する
    ///
    /// ポートの走査は行わない（[`Uhci::probe_ports`]）。
    pub fn attach(
        pci: Arc<dyn PciFunction>,
        dma: Arc<dyn DmaAllocator>,
        parker: Arc<dyn Parker>,
        config: UhciConfig,
    ) -> UsbResult<Arc<Self>> {
        let regs = pci.map_bar(REGISTER_BAR, REGISTER_SPACE, 0)?;
        pci.enable_bus_master();
        let state = UhciState::new(&dma, &config)?;

        let controller = Arc::new(Self {
            regs,
            pci,
            dma,
            config,
            state: ManuallyDrop::new(Mutex::new(state)),
            waitq: WaitQueue::new(parker),
            addresses: AddressAllocator::new(),
            irq: Mutex::new(None),
            polled: AtomicBool::new(false),
            #[cfg(feature = "stats")]
            stats: UhciStats::default(),
        });

        controller.stop()?;
        controller.reset()?;

        let frame_list = controller.state.lock().frames.device_addr();
        controller.regs.write32(FRBASEADD, frame_list);
        controller.regs.write16(FRNUM, 0);

        let shim: Arc<dyn InterruptHandler> = Arc::new(IrqShim(Arc::downgrade(&controller)));
        match controller.pci.register_irq(shim) {
            Ok(handle) => *controller.irq.lock() = Some(handle),
            Err(e) => {
                warn!("uhci: irq registration failed ({}), falling back to polling", e);
                controller.polled.store(true, Ordering::Release);
            }
        }

        controller.start()?;
        info!(
            "uhci: controller running, frame list at {:#010x}{}",
            frame_list,
            if controller.is_polled() { " (polled)" } else { "" }
        );
        Ok(controller)
    }

    // ------------------------------------------------------------------------
    // Register handshakes
    // ------------------------------------------------------------------------

    /// `done` が真になるまで規定回数だけ待つ
    fn handshake(&self, what: &str, done: impl FnMut() -> bool) -> UsbResult<()> {
        self.wait_until(what, self.config.handshake_retries, done)
    }

    fn wait_until(
        &self,
        what: &str,
        retries: u32,
        mut done: impl FnMut() -> bool,
    ) -> UsbResult<()> {
        for _ in 0..retries {
            if done() {
                return Ok(());
            }
            self.waitq.parker().sleep_ms(self.config.handshake_delay_ms);
        }
        if done() {
            return Ok(());
        }
        warn!("uhci: {} handshake timed out", what);
        Err(UsbError::Timeout)
    }

    fn status(&self) -> UsbSts {
        UsbSts::from_bits_truncate(self.regs.read16(USBSTS))
    }

    fn command(&self) -> UsbCmd {
        UsbCmd::from_bits_truncate(self.regs.read16(USBCMD))
    }

    /// コントローラを停止
    fn stop(&self) -> UsbResult<()> {
        self.regs.write16(USBINTR, 0);
        self.regs
            .write16(USBCMD, self.command().difference(UsbCmd::RUN).bits());
        self.handshake("halt", || self.status().contains(UsbSts::HALTED))
    }

    /// コントローラをリセット
    fn reset(&self) -> UsbResult<()> {
        self.regs.write16(USBCMD, UsbCmd::HC_RESET.bits());
        self.handshake("reset", || !self.command().contains(UsbCmd::HC_RESET))
    }

    /// コントローラを開始
    fn start(&self) -> UsbResult<()> {
        self.regs.write16(USBINTR, UsbIntr::all().bits());
        self.regs.write16(USBSTS, UsbSts::ACK_ALL);
        self.regs.write16(
            USBCMD,
            (UsbCmd::RUN | UsbCmd::CONFIGURE | UsbCmd::MAX_PACKET_64).bits(),
        );
        self.handshake("start", || !self.status().contains(UsbSts::HALTED))
    }

    /// 現在のフレーム番号 (0..1024)
    pub fn frame_number(&self) -> u16 {
        self.regs.read16(FRNUM) & FRNUM_MASK
    }

    /// フレーム番号が進むまで待つ
    ///
    /// スケジュールから外した記述子をハードウェアがもう参照しないことの保証。
    fn wait_frame_boundary(&self) -> UsbResult<()> {
        let start = self.frame_number();
        self.wait_until("frame boundary", self.config.frame_wait_retries, || {
            self.frame_number() != start
        })
    }

    /// IRQ なしで動作しているか
    pub fn is_polled(&self) -> bool {
        self.polled.load(Ordering::Acquire)
    }

    /// 使用中の (TD, QH) 数（アンカー QH を含む）
    pub fn descriptors_in_use(&self) -> (usize, usize) {
        let state = self.state.lock();
        (state.tds.in_use(), state.qhs.in_use())
    }

    #[cfg(feature = "stats")]
    pub fn stats(&self) -> UhciStatsSnapshot {
        self.stats.snapshot()
    }

    // ------------------------------------------------------------------------
    // Root ports
    // ------------------------------------------------------------------------

    pub fn port_status(&self, port: u8) -> PortSc {
        PortSc::from_bits_truncate(self.regs.read16(portsc(port)))
    }

    /// ポートをリセットして有効化し、接続デバイスの速度を返す
    pub fn reset_port(&self, port: u8) -> UsbResult<UsbSpeed> {
        let reg = portsc(port);

        let status = self.port_status(port);
        self.regs.write16(reg, (status.preserve() | PortSc::RESET).bits());
        self.waitq.parker().sleep_ms(self.config.port_reset_ms);
        let status = self.port_status(port);
        self.regs
            .write16(reg, status.preserve().difference(PortSc::RESET).bits());
        self.handshake("port reset", || {
            !self.port_status(port).contains(PortSc::RESET)
        })?;

        // 変化ビットを落としてから有効化する
        let status = self.port_status(port);
        self.regs.write16(
            reg,
            (status.preserve() | (status & PortSc::CHANGE_BITS) | PortSc::ENABLED).bits(),
        );
        self.handshake("port enable", || {
            self.port_status(port).contains(PortSc::ENABLED)
        })?;

        let status = self.port_status(port);
        self.regs
            .write16(reg, (status.preserve() | (status & PortSc::CHANGE_BITS)).bits());
        Ok(if status.contains(PortSc::LOW_SPEED) {
            UsbSpeed::Low
        } else {
            UsbSpeed::Full
        })
    }

    /// 接続済みのルートポートをリセットし、デバイスを列挙する
    ///
    /// 列挙できたデバイス数を返す。失敗したポートは飛ばす。
    pub fn probe_ports(self: &Arc<Self>, manager: &UsbManager) -> usize {
        let hcd: Arc<dyn HostController> = self.clone();
        let mut attached = 0;
        for port in 0..self.config.max_ports {
            let raw = self.regs.read16(portsc(port));
            let status = PortSc::from_bits_truncate(raw);
            // 存在しないポートはビット 7 が 0 か、全ビット 1 で読める
            if raw == 0xFFFF || !status.contains(PortSc::PRESENT) {
                continue;
            }
            if !status.contains(PortSc::CONNECTED) {
                continue;
            }
            let speed = match self.reset_port(port) {
                Ok(speed) => speed,
                Err(e) => {
                    warn!("uhci: port {} reset failed: {}", port, e);
                    continue;
                }
            };
            info!("uhci: port {} connected ({:?} speed)", port, speed);
            match manager.attach_device(hcd.clone(), speed) {
                Ok(_) => attached += 1,
                Err(e) => warn!("uhci: port {} enumeration failed: {}", port, e),
            }
        }
        attached
    }

    // ------------------------------------------------------------------------
    // Interrupt servicing
    // ------------------------------------------------------------------------

    /// 割り込みハンドラ本体。自コントローラの割り込みなら true
    pub fn handle_interrupt(&self) -> bool {
        let status = self.status();
        if status.difference(UsbSts::HALTED).is_empty() {
            return false;
        }
        self.regs.write16(USBSTS, UsbSts::ACK_ALL);
        if status.is_fatal() {
            error!("uhci: controller error, status {:?}", status);
        }
        #[cfg(feature = "stats")]
        self.stats
            .interrupts
            .fetch_add(1, core::sync::atomic::Ordering::Relaxed);
        self.service();
        true
    }

    /// IRQ なしで動かす場合の定期処理
    pub fn poll(&self) {
        if !self.handle_interrupt() {
            self.service();
        }
    }

    /// 周期転送の完了を処理し、同期転送の待機者を起こす
    fn service(&self) {
        // 1. ロック中に完了を集める
        let mut completions = Vec::new();
        {
            let mut guard = self.state.lock();
            let state = &mut *guard;
            for pipe in state.intr_pipes.iter_mut() {
                if pipe.in_callback {
                    continue;
                }
                if let Some(result) = pipe.poll(&state.tds, &state.qhs) {
                    pipe.in_callback = true;
                    completions.push((Completion::Interrupt(pipe.pipe.clone()), result));
                }
            }
            for pipe in state.isoc_pipes.iter_mut() {
                if pipe.in_callback {
                    continue;
                }
                if let Some(sizes) = pipe.poll(&state.tds) {
                    pipe.in_callback = true;
                    let completion = Completion::Isochronous {
                        pipe: pipe.pipe.clone(),
                        half: pipe.current(),
                        sizes,
                    };
                    completions.push((completion, Ok(0)));
                }
            }
        }

        // 2. ロックを外してコールバック
        for (completion, result) in completions.iter_mut() {
            match completion {
                Completion::Interrupt(pipe) => {
                    if let Err(e) = result {
                        warn!(
                            "uhci: interrupt pipe {}:{} failed: {}",
                            pipe.target().address.as_u8(),
                            pipe.endpoint().address.number(),
                            e
                        );
                    }
                    #[cfg(feature = "stats")]
                    self.stats.record(result);
                    pipe.complete(*result);
                }
                Completion::Isochronous { pipe, half, sizes } => {
                    if let Err(e) = pipe.refill(*half, sizes) {
                        warn!("uhci: isochronous refill failed: {}", e);
                    }
                }
            }
        }

        // 3. 再アームして、同期転送が終わっていれば起こす
        let mut guard = self.state.lock();
        let state = &mut *guard;
        for (completion, _) in completions {
            match completion {
                Completion::Interrupt(pipe) => {
                    // コールバック中にキャンセルされたパイプは見つからない
                    if let Some(entry) = state
                        .intr_pipes
                        .iter_mut()
                        .find(|p| Arc::ptr_eq(&p.pipe, &pipe))
                    {
                        entry.rearm(&state.tds, &state.qhs);
                        entry.in_callback = false;
                    }
                }
                Completion::Isochronous { pipe, half, sizes } => {
                    if let Some(entry) = state
                        .isoc_pipes
                        .iter_mut()
                        .find(|p| Arc::ptr_eq(&p.pipe, &pipe))
                    {
                        entry.advance(&state.frames, &mut state.tds, half, &sizes);
                        entry.in_callback = false;
                    }
                }
            }
        }
        let wake = state.any_sync_settled();
        drop(guard);
        if wake {
            self.waitq.wake_all();
        }
    }

    // ------------------------------------------------------------------------
    // Synchronous transfers
    // ------------------------------------------------------------------------

    /// コントロール転送の完了を待つ
    fn wait_sync(&self, qh: QhSlot) -> UsbResult<()> {
        loop {
            let seen = {
                let state = self.state.lock();
                let transfer = state
                    .sync
                    .iter()
                    .find(|t| t.qh == qh)
                    .ok_or(UsbError::NotFound)?;
                let head = state.qhs.get(qh);
                match poll_queue(&state.tds, head, &transfer.chain)? {
                    TransferState::Complete => return Ok(()),
                    TransferState::Short(index) => {
                        // 残りのデータ TD を飛ばしてステータスステージへ
                        debug!("uhci: short packet at td {}, skipping to status", index);
                        if let Some(status) = transfer.chain.last() {
                            head.set_element(state.tds.addr(status));
                        }
                    }
                    TransferState::Busy => {}
                }
                // ロック中に世代を読むので、この後の wake は取りこぼさない
                self.waitq.generation()
            };
            self.waitq.wait(seen)?;
            if self.is_polled() {
                self.poll();
            }
        }
    }

    /// フレーム境界を待ってから記述子を返却する
    ///
    /// フレームカウンタが止まっている場合は返却せずに漏らす。
    fn reclaim(&self, what: &str, release: impl FnOnce(&mut UhciState)) -> UsbResult<()> {
        match self.wait_frame_boundary() {
            Ok(()) => {
                let mut guard = self.state.lock();
                release(&mut *guard);
                Ok(())
            }
            Err(e) => {
                error!("uhci: {} descriptors leaked, frame counter stalled", what);
                Err(e)
            }
        }
    }
}

// ============================================================================
// Host Controller Capability
// ============================================================================

impl HostController for Uhci {
    fn name(&self) -> &str {
        "uhci"
    }

    fn get_addr(&self) -> UsbResult<DeviceAddress> {
        self.addresses.allocate()
    }

    fn ctrl_transfer(
        &self,
        target: &DeviceTarget,
        direction: TransferDirection,
        request_addr: u32,
        data_addr: u32,
        size: usize,
    ) -> UsbResult<usize> {
        let td_target = TdTarget {
            address: target.address.as_u8(),
            endpoint: 0,
            low_speed: target.speed == UsbSpeed::Low,
            error_count: self.config.error_count,
        };

        let qh = {
            let mut guard = self.state.lock();
            let state = &mut *guard;
            let mut chain = build_control(
                &mut state.tds,
                &td_target,
                direction,
                request_addr,
                data_addr,
                size,
                target.max_packet_size as usize,
            )?;
            let qh = match state.qhs.allocate() {
                Ok(qh) => qh,
                Err(e) => {
                    error!("uhci: qh pool exhausted");
                    release_chain(&mut state.tds, &mut chain);
                    return Err(e);
                }
            };
            let head = state.qhs.get(qh);
            head.link.store(link::TERMINATE, Ordering::Relaxed);
            head.set_element(chain.head_link(&state.tds));
            mark_chain(&mut state.tds, &chain, Ownership::HardwareOwned);
            #[cfg(feature = "verbose_logging")]
            super::transfer::dump_chain(&state.tds, &chain);
            state.schedule.queue(&mut state.qhs, Anchor::Control, qh);
            state.sync.push(SyncTransfer { qh, chain });
            qh
        };

        let result = self.wait_sync(qh);

        let (mut transfer, result) = {
            let mut guard = self.state.lock();
            let state = &mut *guard;
            let index = state
                .sync
                .iter()
                .position(|t| t.qh == qh)
                .ok_or(UsbError::NotFound)?;
            let transfer = state.sync.swap_remove(index);
            // 解放で ACTIVE を落とす前に数える
            let result = result.map(|()| completed_bytes(&state.tds, &transfer.chain, true));
            if let Err(e) = state.schedule.remove(&mut state.qhs, Anchor::Control, qh) {
                error!("uhci: control qh missing from schedule: {}", e);
            }
            (transfer, result)
        };

        // 回収に失敗しても転送の結果は返す（記述子はリーク済み）
        if let Err(e) = self.reclaim("control transfer", |state| {
            release_chain(&mut state.tds, &mut transfer.chain);
            state.qhs.release(transfer.qh);
        }) {
            debug!("uhci: control transfer reclaim skipped: {}", e);
        }

        match &result {
            Ok(len) => debug!(
                "uhci: control transfer to {} done, {} of {} bytes",
                target.address.as_u8(),
                len,
                size
            ),
            Err(e) => debug!(
                "uhci: control transfer to {} failed: {}",
                target.address.as_u8(),
                e
            ),
        }
        #[cfg(feature = "stats")]
        self.stats.record(&result);
        result
    }

    fn intr_transfer(&self, pipe: Arc<InterruptPipe>) -> UsbResult<()> {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        if state.intr_pipes.iter().any(|p| Arc::ptr_eq(&p.pipe, &pipe)) {
            return Err(UsbError::InvalidParameter);
        }
        let entry = IntrPipeState::build(
            &mut state.tds,
            &mut state.qhs,
            pipe.clone(),
            self.config.error_count,
        )?;
        state
            .schedule
            .queue(&mut state.qhs, Anchor::Interrupt, entry.qh);
        debug!(
            "uhci: interrupt pipe {}:{} armed ({} bytes)",
            pipe.target().address.as_u8(),
            pipe.endpoint().address.number(),
            pipe.size()
        );
        state.intr_pipes.push(entry);
        Ok(())
    }

    fn isoc_transfer(&self, pipe: Arc<IsochronousPipe>) -> UsbResult<()> {
        let mps = pipe.endpoint().max_packet_size;
        let td_count = isoc_td_count(mps as usize, self.config.isoc_max_td)?;
        let half = td_count / 2;

        // OUT は開始前に両方の半バッファを埋める（ロック外）
        let mut sizes = [vec![mps; half], vec![mps; half]];
        if pipe.direction() == TransferDirection::Out {
            for (i, sizes) in sizes.iter_mut().enumerate() {
                pipe.refill(i, sizes)?;
            }
        }

        let mut guard = self.state.lock();
        let state = &mut *guard;
        if state.isoc_pipes.iter().any(|p| Arc::ptr_eq(&p.pipe, &pipe)) {
            return Err(UsbError::InvalidParameter);
        }
        let mut entry =
            IsocPipeState::build(&mut state.tds, pipe.clone(), td_count, self.config.error_count)?;
        for (i, sizes) in sizes.iter().enumerate() {
            entry.apply_sizes(&state.tds, i, sizes);
        }
        entry.start(&state.frames, &mut state.tds, self.frame_number());
        debug!(
            "uhci: isochronous pipe {}:{} started at frame {} ({} tds)",
            pipe.target().address.as_u8(),
            pipe.endpoint().address.number(),
            entry.position(0),
            td_count
        );
        state.isoc_pipes.push(entry);
        Ok(())
    }

    fn cancel_intr(&self, pipe: &Arc<InterruptPipe>) -> UsbResult<()> {
        let entry = {
            let mut guard = self.state.lock();
            let state = &mut *guard;
            let index = state
                .intr_pipes
                .iter()
                .position(|p| Arc::ptr_eq(&p.pipe, pipe))
                .ok_or(UsbError::NotFound)?;
            let entry = state.intr_pipes.remove(index);
            if let Err(e) = state
                .schedule
                .remove(&mut state.qhs, Anchor::Interrupt, entry.qh)
            {
                error!("uhci: interrupt qh missing from schedule: {}", e);
            }
            entry
        };
        self.reclaim("interrupt pipe", |state| {
            entry.release(&mut state.tds, &mut state.qhs)
        })
    }

    fn cancel_isoc(&self, pipe: &Arc<IsochronousPipe>) -> UsbResult<()> {
        let entry = {
            let mut guard = self.state.lock();
            let state = &mut *guard;
            let index = state
                .isoc_pipes
                .iter()
                .position(|p| Arc::ptr_eq(&p.pipe, pipe))
                .ok_or(UsbError::NotFound)?;
            let entry = state.isoc_pipes.remove(index);
            entry.unlink(&state.frames, &mut state.tds);
            entry
        };
        self.reclaim("isochronous pipe", |state| entry.release(&mut state.tds))
    }

    fn dma_allocator(&self) -> &Arc<dyn DmaAllocator> {
        &self.dma
    }
}

impl Drop for Uhci {
    fn drop(&mut self) {
        if let Some(handle) = self.irq.lock().take() {
            self.pci.unregister_irq(handle);
        }
        if self.stop().is_ok() {
            // SAFETY: 停止を確認したのでハードウェアはもう記述子を読まない。
            // state はこの後参照されない
            unsafe { ManuallyDrop::drop(&mut self.state) };
        } else {
            error!("uhci: controller did not halt, leaking schedule memory");
        }
    }
}

// ============================================================================
// PCI Initialization
// ============================================================================

/// PCI ファンクションの UHCI を初期化し、ルートポートのデバイスを登録する
pub fn init_pci(
    pci: Arc<dyn PciFunction>,
    dma: Arc<dyn DmaAllocator>,
    parker: Arc<dyn Parker>,
) -> UsbResult<Arc<Uhci>> {
    let controller = Uhci::attach(pci, dma, parker, UhciConfig::default())?;
    let attached = controller.probe_ports(usb_manager());
    info!("uhci: {} device(s) attached", attached);
    Ok(controller)
}
