// ============================================================================
// src/io/pci.rs - PCI Function Interface
// ============================================================================
//!
//! # PCI ファンクション境界
//!
//! PCI の列挙と割り込みルーティングはカーネル側の責務。
//! ホストコントローラドライバは [`PciFunction`] を通して
//! BAR のマップと割り込みハンドラの登録だけを行う。

use alloc::sync::Arc;

use crate::error::UsbResult;

// ============================================================================
// Register Access
// ============================================================================

/// マップ済みレジスタウィンドウ
///
/// UHCI は I/O 空間 (BAR4) にレジスタを置くため、実機では
/// [`PortIoWindow`] が使われる。
pub trait RegisterWindow: Send + Sync {
    fn read16(&self, offset: u16) -> u16;
    fn write16(&self, offset: u16, value: u16);
    fn write32(&self, offset: u16, value: u32);
}

/// I/O ポート空間のレジスタウィンドウ
#[cfg(target_arch = "x86_64")]
pub struct PortIoWindow {
    base: u16,
}

#[cfg(target_arch = "x86_64")]
impl PortIoWindow {
    /// # Safety
    /// `base` から始まる I/O ポートはこのウィンドウだけが操作すること。
    pub unsafe fn new(base: u16) -> Self {
        Self { base }
    }
}

#[cfg(target_arch = "x86_64")]
impl RegisterWindow for PortIoWindow {
    fn read16(&self, offset: u16) -> u16 {
        let mut port = x86_64::instructions::port::Port::<u16>::new(self.base + offset);
        // SAFETY: コンストラクタの契約によりポートはこのウィンドウの占有
        unsafe { port.read() }
    }

    fn write16(&self, offset: u16, value: u16) {
        let mut port = x86_64::instructions::port::Port::<u16>::new(self.base + offset);
        unsafe { port.write(value) }
    }

    fn write32(&self, offset: u16, value: u32) {
        let mut port = x86_64::instructions::port::Port::<u32>::new(self.base + offset);
        unsafe { port.write(value) }
    }
}

// ============================================================================
// Interrupts
// ============================================================================

/// 割り込みハンドラ
pub trait InterruptHandler: Send + Sync {
    /// 割り込みを処理する。自デバイスの割り込みだった場合 true
    fn handle_interrupt(&self) -> bool;
}

/// 登録済み割り込みのハンドル
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IrqHandle(pub u32);

// ============================================================================
// PCI Function
// ============================================================================

/// ドライバから見た PCI ファンクション
pub trait PciFunction: Send + Sync {
    /// BAR `index` の `offset` から `size` バイトをマップする
    fn map_bar(&self, index: u8, size: usize, offset: usize) -> UsbResult<Arc<dyn RegisterWindow>>;

    /// 割り込みハンドラを登録する
    fn register_irq(&self, handler: Arc<dyn InterruptHandler>) -> UsbResult<IrqHandle>;

    /// 割り込みハンドラの登録を解除する
    fn unregister_irq(&self, handle: IrqHandle);

    /// バスマスタ（DMA）を有効化
    fn enable_bus_master(&self);
}
