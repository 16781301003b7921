// ============================================================================
// tests/common/mod.rs - Simulated UHCI
// ============================================================================
//!
//! 統合テスト用の UHCI シミュレーション
//!
//! - `SimDma`: ヒープをデバイスアドレス空間に見立てるアロケータ
//! - `SimRegs`: I/O レジスタファイル（ポートのリセット・有効化を含む）
//! - `SimHost`: フレームごとにスケジュールをたどり、TD を
//!   スクリプト化したデバイスに対して実行するスレッド
//!
//! ビット配置は UHCI Design Guide 1.1 に従い、ドライバ側の定義は使わない。

#![allow(dead_code)]

use std::alloc::{Layout, alloc_zeroed, dealloc};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::ptr::NonNull;
use std::sync::atomic::{AtomicBool, AtomicU16, AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use rany_usb::io::dma::{DmaAllocator, DmaFlags, DmaRegion};
use rany_usb::io::pci::{InterruptHandler, IrqHandle, PciFunction, RegisterWindow};
use rany_usb::io::usb::uhci::{Uhci, UhciConfig};
use rany_usb::sync::Parker;
use rany_usb::{UsbError, UsbResult};

// ============================================================================
// Hardware bits
// ============================================================================

const LINK_T: u32 = 1 << 0;
const LINK_Q: u32 = 1 << 1;

const TD_ACTLEN: u32 = 0x7FF;
const TD_CRC_TIMEOUT: u32 = 1 << 18;
const TD_NAK: u32 = 1 << 19;
const TD_STALLED: u32 = 1 << 22;
const TD_ACTIVE: u32 = 1 << 23;
const TD_IOC: u32 = 1 << 24;
const TD_IOS: u32 = 1 << 25;
const TD_SPD: u32 = 1 << 29;

const PID_SETUP: u8 = 0x2D;
const PID_IN: u8 = 0x69;
const PID_OUT: u8 = 0xE1;

const CMD_RUN: u16 = 1 << 0;
const CMD_HCRESET: u16 = 1 << 1;
const STS_USBINT: u16 = 1 << 0;
const STS_ERROR: u16 = 1 << 1;
const STS_HALTED: u16 = 1 << 5;

const PORT_CONNECTED: u16 = 1 << 0;
const PORT_CONNECT_CHANGE: u16 = 1 << 1;
const PORT_ENABLED: u16 = 1 << 2;
const PORT_ENABLE_CHANGE: u16 = 1 << 3;
const PORT_PRESENT: u16 = 1 << 7;
const PORT_LOW_SPEED: u16 = 1 << 8;
const PORT_RESET: u16 = 1 << 9;

pub const PORTS: usize = 2;

// ============================================================================
// DMA
// ============================================================================

/// ヒープ上の DMA 領域
pub struct SimDma {
    next: AtomicU32,
    /// (デバイスアドレス, CPU アドレス, サイズ)
    regions: Mutex<Vec<(u32, usize, usize)>>,
    pub live: AtomicUsize,
}

impl SimDma {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            next: AtomicU32::new(0x0010_0000),
            regions: Mutex::new(Vec::new()),
            live: AtomicUsize::new(0),
        })
    }

    fn translate(&self, addr: u32, len: usize) -> Option<*mut u8> {
        self.regions
            .lock()
            .unwrap()
            .iter()
            .find(|(base, _, size)| {
                addr >= *base && (addr - base) as usize + len <= *size
            })
            .map(|(base, cpu, _)| (cpu + (addr - base) as usize) as *mut u8)
    }

    /// ハードウェアと共有する 32 ビット語
    fn word(&self, addr: u32) -> Option<&AtomicU32> {
        if addr % 4 != 0 {
            return None;
        }
        let ptr = self.translate(addr, 4)?;
        // SAFETY: 4 バイト境界に揃ったヒープ上の領域。ドライバは
        // フレーム境界を待ってから解放するので、フレーム処理中は生きている
        Some(unsafe { &*(ptr as *const AtomicU32) })
    }

    fn read(&self, addr: u32, len: usize) -> Option<Vec<u8>> {
        if len == 0 {
            return Some(Vec::new());
        }
        let ptr = self.translate(addr, len)?;
        let mut data = vec![0u8; len];
        unsafe { std::ptr::copy_nonoverlapping(ptr, data.as_mut_ptr(), len) };
        Some(data)
    }

    fn write(&self, addr: u32, data: &[u8]) -> Option<()> {
        if data.is_empty() {
            return Some(());
        }
        let ptr = self.translate(addr, data.len())?;
        unsafe { std::ptr::copy_nonoverlapping(data.as_ptr(), ptr, data.len()) };
        Some(())
    }
}

impl DmaAllocator for SimDma {
    fn allocate_coherent(&self, size: usize, _flags: DmaFlags) -> UsbResult<DmaRegion> {
        let size = size.max(1).div_ceil(4096) * 4096;
        let layout = Layout::from_size_align(size, 4096).map_err(|_| UsbError::InvalidParameter)?;
        let ptr = unsafe { alloc_zeroed(layout) };
        let cpu = NonNull::new(ptr).ok_or(UsbError::NoMemory)?;
        let device_addr = self.next.fetch_add(size as u32, Ordering::SeqCst);
        self.regions
            .lock()
            .unwrap()
            .push((device_addr, ptr as usize, size));
        self.live.fetch_add(1, Ordering::SeqCst);
        Ok(DmaRegion {
            cpu,
            device_addr,
            size,
        })
    }

    unsafe fn free_coherent(&self, region: DmaRegion) {
        self.regions
            .lock()
            .unwrap()
            .retain(|(base, _, _)| *base != region.device_addr);
        self.live.fetch_sub(1, Ordering::SeqCst);
        let layout = Layout::from_size_align(region.size, 4096).unwrap();
        unsafe { dealloc(region.cpu.as_ptr(), layout) };
    }
}

// ============================================================================
// Parker
// ============================================================================

/// Condvar によるパーカー（1ms ティック）
#[derive(Default)]
pub struct SimParker {
    lock: Mutex<()>,
    cond: Condvar,
    pub cancelled: AtomicBool,
}

impl Parker for SimParker {
    fn park(&self, should_wake: &dyn Fn() -> bool) -> UsbResult<()> {
        let guard = self.lock.lock().unwrap();
        if !should_wake() && !self.cancelled.load(Ordering::SeqCst) {
            let _ = self
                .cond
                .wait_timeout(guard, Duration::from_millis(1))
                .unwrap();
        }
        if self.cancelled.load(Ordering::SeqCst) {
            return Err(UsbError::Interrupted);
        }
        Ok(())
    }

    fn unpark_all(&self) {
        let _guard = self.lock.lock().unwrap();
        self.cond.notify_all();
    }

    fn sleep_ms(&self, ms: u32) {
        std::thread::sleep(Duration::from_millis(ms as u64));
    }
}

// ============================================================================
// Registers
// ============================================================================

#[derive(Default)]
pub struct SimRegs {
    cmd: AtomicU16,
    sts: AtomicU16,
    intr: AtomicU16,
    frnum: AtomicU16,
    frbase: AtomicU32,
    ports: [AtomicU16; PORTS],
}

impl SimRegs {
    fn new(ports: [u16; PORTS]) -> Self {
        let regs = Self::default();
        regs.sts.store(STS_HALTED, Ordering::SeqCst);
        for (reg, value) in regs.ports.iter().zip(ports) {
            reg.store(value, Ordering::SeqCst);
        }
        regs
    }

    pub fn port(&self, port: usize) -> u16 {
        self.ports[port].load(Ordering::SeqCst)
    }

    pub fn is_halted(&self) -> bool {
        self.sts.load(Ordering::SeqCst) & STS_HALTED != 0
    }

    fn port_enabled(&self, port: usize) -> bool {
        self.port(port) & PORT_ENABLED != 0
    }

    fn write_port(&self, port: usize, value: u16) {
        let reg = &self.ports[port];
        let mut current = reg.load(Ordering::SeqCst);
        current &= !(value & (PORT_CONNECT_CHANGE | PORT_ENABLE_CHANGE));
        if value & PORT_RESET != 0 {
            current |= PORT_RESET;
            current &= !PORT_ENABLED;
        } else {
            current &= !PORT_RESET;
        }
        let can_enable = current & PORT_CONNECTED != 0 && current & PORT_RESET == 0;
        if value & PORT_ENABLED != 0 && can_enable {
            current |= PORT_ENABLED;
        } else {
            current &= !PORT_ENABLED;
        }
        reg.store(current, Ordering::SeqCst);
    }
}

impl RegisterWindow for SimRegs {
    fn read16(&self, offset: u16) -> u16 {
        match offset {
            0x00 => self.cmd.load(Ordering::SeqCst),
            0x02 => self.sts.load(Ordering::SeqCst),
            0x04 => self.intr.load(Ordering::SeqCst),
            0x06 => self.frnum.load(Ordering::SeqCst),
            0x10 => self.port(0),
            0x12 => self.port(1),
            _ => 0xFFFF,
        }
    }

    fn write16(&self, offset: u16, value: u16) {
        match offset {
            0x00 if value & CMD_HCRESET != 0 => {
                self.cmd.store(0, Ordering::SeqCst);
                self.intr.store(0, Ordering::SeqCst);
                self.frnum.store(0, Ordering::SeqCst);
                self.frbase.store(0, Ordering::SeqCst);
                self.sts.store(STS_HALTED, Ordering::SeqCst);
                for port in 0..PORTS {
                    self.ports[port].fetch_and(!PORT_ENABLED, Ordering::SeqCst);
                }
            }
            0x00 => self.cmd.store(value, Ordering::SeqCst),
            // HALTED はフレーム処理スレッドが管理する
            0x02 => {
                self.sts.fetch_and(!(value & 0x1F), Ordering::SeqCst);
            }
            0x04 => self.intr.store(value, Ordering::SeqCst),
            0x06 => self.frnum.store(value & 0x7FF, Ordering::SeqCst),
            0x10 => self.write_port(0, value),
            0x12 => self.write_port(1, value),
            _ => {}
        }
    }

    fn write32(&self, offset: u16, value: u32) {
        if offset == 0x08 {
            self.frbase.store(value & !0xFFF, Ordering::SeqCst);
        }
    }
}

// ============================================================================
// PCI Function
// ============================================================================

pub struct SimPci {
    regs: Arc<SimRegs>,
    irq: bool,
    handler: Mutex<Option<Arc<dyn InterruptHandler>>>,
    pub bus_master: AtomicBool,
}

impl SimPci {
    pub fn has_handler(&self) -> bool {
        self.handler.lock().unwrap().is_some()
    }
}

impl PciFunction for SimPci {
    fn map_bar(&self, index: u8, size: usize, _offset: usize) -> UsbResult<Arc<dyn RegisterWindow>> {
        if index != 4 || size > 0x20 {
            return Err(UsbError::InvalidParameter);
        }
        let regs: Arc<dyn RegisterWindow> = self.regs.clone();
        Ok(regs)
    }

    fn register_irq(&self, handler: Arc<dyn InterruptHandler>) -> UsbResult<IrqHandle> {
        if !self.irq {
            return Err(UsbError::Unsupported);
        }
        *self.handler.lock().unwrap() = Some(handler);
        Ok(IrqHandle(11))
    }

    fn unregister_irq(&self, _handle: IrqHandle) {
        self.handler.lock().unwrap().take();
    }

    fn enable_bus_master(&self) {
        self.bus_master.store(true, Ordering::SeqCst);
    }
}

// ============================================================================
// Scripted Devices
// ============================================================================

/// デバイスの応答
enum Handshake {
    Ack(Vec<u8>),
    Nak,
    Stall,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum ControlStage {
    Idle,
    DataIn { data: Vec<u8>, offset: usize },
    /// OUT リクエストのステータスステージ待ち
    StatusIn { new_address: Option<u8> },
    /// 次の SETUP まで STALL を返す
    Stalled,
}

/// スクリプト化した USB デバイス
pub struct SimDevice {
    pub port: usize,
    pub low_speed: bool,
    pub address: u8,
    pub device: Vec<u8>,
    pub languages: Vec<u8>,
    pub strings: BTreeMap<u8, Vec<u8>>,
    pub configuration: Vec<u8>,
    /// デバイスディスクリプタを 8 バイトで打ち切る
    pub truncate_device_descriptor: bool,
    pub configured: Option<u8>,
    /// 受け取った SETUP パケット
    pub requests: Vec<[u8; 8]>,
    /// インタラプト IN エンドポイントごとのレポート
    pub reports: HashMap<u8, VecDeque<Vec<u8>>>,
    /// レポートを渡したときのデータトグル
    pub toggles: HashMap<u8, Vec<bool>>,
    /// 送ったアイソクロナスパケット数
    pub isoc_packets: usize,
    control: ControlStage,
}

pub fn string_descriptor(s: &str) -> Vec<u8> {
    let mut data = vec![0u8, 3];
    for unit in s.encode_utf16() {
        data.extend_from_slice(&unit.to_le_bytes());
    }
    data[0] = data.len() as u8;
    data
}

impl SimDevice {
    /// HID ブートキーボード (3/1/1, EP0 8 バイト, EP1 IN インタラプト)
    pub fn keyboard(port: usize, low_speed: bool) -> Self {
        let mut configuration = vec![
            9, 2, 0, 0, 1, 1, 0, 0xA0, 50, // configuration
            9, 4, 0, 0, 1, 3, 1, 1, 0, // interface: HID boot keyboard
            9, 0x21, 0x11, 0x01, 0, 1, 0x22, 63, 0, // HID
            7, 5, 0x81, 3, 8, 0, 10, // endpoint 1 IN, interrupt
        ];
        let total = configuration.len() as u16;
        configuration[2..4].copy_from_slice(&total.to_le_bytes());
        let mut strings = BTreeMap::new();
        strings.insert(1, string_descriptor("Rany"));
        strings.insert(2, string_descriptor("Keyboard"));
        Self {
            port,
            low_speed,
            address: 0,
            device: vec![
                18, 1, 0x10, 0x01, 0, 0, 0, 8, 0x6D, 0x04, 0x1C, 0xC3, 0x00, 0x01, 1, 2, 0, 1,
            ],
            languages: vec![4, 3, 0x09, 0x04],
            strings,
            configuration,
            truncate_device_descriptor: false,
            configured: None,
            requests: Vec::new(),
            reports: HashMap::new(),
            toggles: HashMap::new(),
            isoc_packets: 0,
            control: ControlStage::Idle,
        }
    }

    /// 受け取ったリクエストコード列
    pub fn request_codes(&self) -> Vec<u8> {
        self.requests.iter().map(|r| r[1]).collect()
    }

    pub fn queue_report(&mut self, endpoint: u8, report: &[u8]) {
        self.reports
            .entry(endpoint)
            .or_default()
            .push_back(report.to_vec());
    }

    fn setup(&mut self, packet: &[u8]) {
        let mut setup = [0u8; 8];
        setup.copy_from_slice(&packet[..8]);
        self.requests.push(setup);
        let request_type = setup[0];
        let request = setup[1];
        let value = u16::from_le_bytes([setup[2], setup[3]]);
        let length = u16::from_le_bytes([setup[6], setup[7]]) as usize;

        self.control = if request_type & 0x80 != 0 {
            let response = match (request, (value >> 8) as u8, value as u8) {
                (0x06, 1, _) if self.truncate_device_descriptor => Some(self.device[..8].to_vec()),
                (0x06, 1, _) => Some(self.device.clone()),
                (0x06, 2, 0) => Some(self.configuration.clone()),
                (0x06, 3, 0) => Some(self.languages.clone()),
                (0x06, 3, index) => self.strings.get(&index).cloned(),
                (0x00, _, _) => Some(vec![1, 0]),
                _ => None,
            };
            match response {
                Some(mut data) => {
                    data.truncate(length);
                    ControlStage::DataIn { data, offset: 0 }
                }
                None => ControlStage::Stalled,
            }
        } else {
            match request {
                0x05 => ControlStage::StatusIn {
                    new_address: Some(value as u8),
                },
                0x09 => {
                    self.configured = Some(value as u8);
                    ControlStage::StatusIn { new_address: None }
                }
                0x01 | 0x03 | 0x0B => ControlStage::StatusIn { new_address: None },
                _ => ControlStage::Stalled,
            }
        }
    }

    fn transact(
        &mut self,
        pid: u8,
        endpoint: u8,
        toggle: bool,
        isochronous: bool,
        out: &[u8],
        max_len: usize,
    ) -> Handshake {
        if isochronous {
            if pid == PID_IN {
                let fill = self.isoc_packets as u8;
                self.isoc_packets += 1;
                return Handshake::Ack(vec![fill; max_len]);
            }
            self.isoc_packets += 1;
            return Handshake::Ack(Vec::new());
        }

        if endpoint != 0 {
            if pid != PID_IN {
                return Handshake::Stall;
            }
            let Some(report) = self.reports.get_mut(&endpoint).and_then(|q| q.pop_front()) else {
                return Handshake::Nak;
            };
            self.toggles.entry(endpoint).or_default().push(toggle);
            let mut report = report;
            report.truncate(max_len);
            return Handshake::Ack(report);
        }

        match pid {
            PID_SETUP => {
                self.setup(out);
                Handshake::Ack(Vec::new())
            }
            PID_IN => match &mut self.control {
                ControlStage::DataIn { data, offset } => {
                    let end = (*offset + max_len).min(data.len());
                    let chunk = data[*offset..end].to_vec();
                    *offset = end;
                    Handshake::Ack(chunk)
                }
                ControlStage::StatusIn { new_address } => {
                    if let Some(address) = new_address.take() {
                        self.address = address;
                    }
                    self.control = ControlStage::Idle;
                    Handshake::Ack(Vec::new())
                }
                ControlStage::Stalled => Handshake::Stall,
                ControlStage::Idle => Handshake::Stall,
            },
            PID_OUT => match self.control {
                ControlStage::Stalled => Handshake::Stall,
                _ => {
                    self.control = ControlStage::Idle;
                    Handshake::Ack(Vec::new())
                }
            },
            _ => Handshake::Stall,
        }
    }
}

// ============================================================================
// Frame Engine
// ============================================================================

#[derive(Default)]
struct FrameCtx {
    interrupt: bool,
    error: bool,
    budget: usize,
}

struct Shared {
    regs: Arc<SimRegs>,
    dma: Arc<SimDma>,
    pci: Arc<SimPci>,
    bus: Mutex<Vec<SimDevice>>,
    stop: AtomicBool,
    paused: AtomicBool,
    frames: AtomicUsize,
    fault: Mutex<Option<String>>,
}

enum Outcome {
    Inactive,
    Done,
    Short,
    Nak,
    Failed,
}

impl Shared {
    fn word(&self, addr: u32) -> Result<&AtomicU32, String> {
        self.dma
            .word(addr)
            .ok_or_else(|| format!("unmapped descriptor address {:#010x}", addr))
    }

    fn run(&self) {
        while !self.stop.load(Ordering::SeqCst) {
            let running = self.regs.cmd.load(Ordering::SeqCst) & CMD_RUN != 0;
            if !running {
                self.regs.sts.fetch_or(STS_HALTED, Ordering::SeqCst);
            } else {
                self.regs.sts.fetch_and(!STS_HALTED, Ordering::SeqCst);
                if !self.paused.load(Ordering::SeqCst) {
                    self.run_frame();
                    self.deliver_irq();
                }
            }
            std::thread::sleep(Duration::from_micros(200));
        }
    }

    fn run_frame(&self) {
        let frame = (self.regs.frnum.load(Ordering::SeqCst) & 0x3FF) as u32;
        let base = self.regs.frbase.load(Ordering::SeqCst);
        let mut ctx = FrameCtx {
            budget: 4096,
            ..FrameCtx::default()
        };
        let result = self.word(base + frame * 4).and_then(|slot| {
            let link = slot.load(Ordering::Acquire);
            let mut bus = self.bus.lock().unwrap();
            self.walk(&mut bus, link, &mut ctx)
        });
        if let Err(fault) = result {
            self.fault.lock().unwrap().get_or_insert(fault);
        }
        let next = (self.regs.frnum.load(Ordering::SeqCst) + 1) & 0x7FF;
        self.regs.frnum.store(next, Ordering::SeqCst);
        if ctx.interrupt {
            self.regs.sts.fetch_or(STS_USBINT, Ordering::SeqCst);
        }
        if ctx.error {
            self.regs.sts.fetch_or(STS_ERROR, Ordering::SeqCst);
        }
        self.frames.fetch_add(1, Ordering::SeqCst);
    }

    fn deliver_irq(&self) {
        let pending = self.regs.sts.load(Ordering::SeqCst) & (STS_USBINT | STS_ERROR) != 0;
        if !pending || self.regs.intr.load(Ordering::SeqCst) == 0 {
            return;
        }
        let handler = self.pci.handler.lock().unwrap().clone();
        if let Some(handler) = handler {
            handler.handle_interrupt();
        }
    }

    /// 水平方向にたどる
    fn walk(&self, bus: &mut [SimDevice], mut link: u32, ctx: &mut FrameCtx) -> Result<(), String> {
        while link & LINK_T == 0 {
            ctx.budget = ctx
                .budget
                .checked_sub(1)
                .ok_or_else(|| "schedule does not terminate".to_string())?;
            let addr = link & !0xF;
            if link & LINK_Q != 0 {
                self.process_qh(bus, addr, ctx)?;
                link = self.word(addr)?.load(Ordering::Acquire);
            } else {
                self.execute_td(bus, addr, ctx)?;
                link = self.word(addr)?.load(Ordering::Acquire);
            }
        }
        Ok(())
    }

    /// QH の要素を深さ方向に処理する
    fn process_qh(&self, bus: &mut [SimDevice], qh: u32, ctx: &mut FrameCtx) -> Result<(), String> {
        let element = self.word(qh + 4)?;
        loop {
            let current = element.load(Ordering::Acquire);
            if current & LINK_T != 0 {
                return Ok(());
            }
            if current & LINK_Q != 0 {
                return self.walk(bus, current, ctx);
            }
            let td = current & !0xF;
            match self.execute_td(bus, td, ctx)? {
                Outcome::Done => {
                    let next = self.word(td)?.load(Ordering::Acquire);
                    element.store(next, Ordering::Release);
                    if next & LINK_T != 0 {
                        return Ok(());
                    }
                }
                Outcome::Inactive | Outcome::Short | Outcome::Nak | Outcome::Failed => {
                    return Ok(());
                }
            }
        }
    }

    fn execute_td(&self, bus: &mut [SimDevice], td: u32, ctx: &mut FrameCtx) -> Result<Outcome, String> {
        let status = self.word(td + 4)?;
        let token = self.word(td + 8)?.load(Ordering::Acquire);
        let buffer = self.word(td + 12)?.load(Ordering::Acquire);
        let cs = status.load(Ordering::Acquire);
        if cs & TD_ACTIVE == 0 {
            return Ok(Outcome::Inactive);
        }

        let pid = token as u8;
        let address = ((token >> 8) & 0x7F) as u8;
        let endpoint = ((token >> 15) & 0xF) as u8;
        let toggle = token & (1 << 19) != 0;
        let max_len = (((token >> 21) + 1) & 0x7FF) as usize;
        let isochronous = cs & TD_IOS != 0;

        let out = if pid == PID_IN {
            Vec::new()
        } else {
            self.dma
                .read(buffer, max_len)
                .ok_or_else(|| format!("td buffer {:#010x} unmapped", buffer))?
        };

        let regs = &self.regs;
        let device = bus
            .iter_mut()
            .find(|d| regs.port_enabled(d.port) && d.address == address);
        let handshake = match device {
            Some(device) => device.transact(pid, endpoint, toggle, isochronous, &out, max_len),
            None => {
                let cs = (cs & !TD_ACTIVE) | TD_CRC_TIMEOUT;
                status.store(cs, Ordering::Release);
                ctx.error = true;
                return Ok(Outcome::Failed);
            }
        };

        let cleared = cs & !(TD_ACTIVE | TD_NAK | TD_ACTLEN);
        match handshake {
            Handshake::Ack(data) => {
                let len = if pid == PID_IN { data.len() } else { max_len };
                if pid == PID_IN {
                    self.dma
                        .write(buffer, &data)
                        .ok_or_else(|| format!("td buffer {:#010x} unmapped", buffer))?;
                }
                let actlen = (len as u32).wrapping_sub(1) & TD_ACTLEN;
                status.store(cleared | actlen, Ordering::Release);
                if cs & TD_IOC != 0 {
                    ctx.interrupt = true;
                }
                if pid == PID_IN && len < max_len && cs & TD_SPD != 0 {
                    ctx.interrupt = true;
                    return Ok(Outcome::Short);
                }
                Ok(Outcome::Done)
            }
            Handshake::Nak => {
                status.store(cs | TD_NAK, Ordering::Release);
                Ok(Outcome::Nak)
            }
            Handshake::Stall => {
                status.store(cleared | TD_ACTLEN | TD_STALLED, Ordering::Release);
                ctx.error = true;
                Ok(Outcome::Failed)
            }
        }
    }
}

// ============================================================================
// Host
// ============================================================================

/// シミュレーションされた UHCI とルートポートのデバイス
pub struct SimHost {
    shared: Arc<Shared>,
    thread: Option<JoinHandle<()>>,
    pub parker: Arc<SimParker>,
}

impl SimHost {
    pub fn start(devices: Vec<SimDevice>, irq: bool) -> Self {
        let mut ports = [PORT_PRESENT; PORTS];
        for device in devices.iter() {
            ports[device.port] |= PORT_CONNECTED | PORT_CONNECT_CHANGE;
            if device.low_speed {
                ports[device.port] |= PORT_LOW_SPEED;
            }
        }
        let regs = Arc::new(SimRegs::new(ports));
        let pci = Arc::new(SimPci {
            regs: regs.clone(),
            irq,
            handler: Mutex::new(None),
            bus_master: AtomicBool::new(false),
        });
        let shared = Arc::new(Shared {
            regs,
            dma: SimDma::new(),
            pci,
            bus: Mutex::new(devices),
            stop: AtomicBool::new(false),
            paused: AtomicBool::new(false),
            frames: AtomicUsize::new(0),
            fault: Mutex::new(None),
        });
        let engine = shared.clone();
        let thread = std::thread::spawn(move || engine.run());
        Self {
            shared,
            thread: Some(thread),
            parker: Arc::new(SimParker::default()),
        }
    }

    pub fn config() -> UhciConfig {
        UhciConfig {
            max_ports: PORTS as u8,
            port_reset_ms: 10,
            ..UhciConfig::default()
        }
    }

    /// コントローラをアタッチする
    pub fn attach(&self) -> UsbResult<Arc<Uhci>> {
        Uhci::attach(
            self.shared.pci.clone(),
            self.shared.dma.clone(),
            self.parker.clone(),
            Self::config(),
        )
    }

    pub fn regs(&self) -> &SimRegs {
        &self.shared.regs
    }

    pub fn pci(&self) -> &SimPci {
        &self.shared.pci
    }

    pub fn dma_live(&self) -> usize {
        self.shared.dma.live.load(Ordering::SeqCst)
    }

    pub fn device<R>(&self, port: usize, f: impl FnOnce(&mut SimDevice) -> R) -> R {
        let mut bus = self.shared.bus.lock().unwrap();
        let device = bus
            .iter_mut()
            .find(|d| d.port == port)
            .expect("no device on port");
        f(device)
    }

    /// フレームの進行を止める（RUN は立ったまま）
    pub fn pause(&self, paused: bool) {
        self.shared.paused.store(paused, Ordering::SeqCst);
    }

    pub fn frames(&self) -> usize {
        self.shared.frames.load(Ordering::SeqCst)
    }

    /// スケジュールの異常（未マップのリンクなど）
    pub fn fault(&self) -> Option<String> {
        self.shared.fault.lock().unwrap().clone()
    }
}

impl Drop for SimHost {
    fn drop(&mut self) {
        self.shared.stop.store(true, Ordering::SeqCst);
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

/// `condition` が成り立つまで待つ（最大 5 秒）
pub fn wait_until(mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + Duration::from_secs(5);
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(1));
    }
    condition()
}
