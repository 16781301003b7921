// ============================================================================
// src/io/usb/uhci/regs.rs - UHCI I/O Registers
// ============================================================================
//!
//! UHCI のレジスタは BAR4 (I/O 空間) に 0x20 バイト並ぶ。
//! ステータス系のビットは書き込み 1 でクリアされる。

use bitflags::bitflags;

/// レジスタ空間のサイズ
pub const REGISTER_SPACE: usize = 0x20;

/// レジスタを置く BAR
pub const REGISTER_BAR: u8 = 4;

// ============================================================================
// Register Offsets
// ============================================================================

/// USB Command
pub const USBCMD: u16 = 0x00;
/// USB Status
pub const USBSTS: u16 = 0x02;
/// USB Interrupt Enable
pub const USBINTR: u16 = 0x04;
/// Frame Number
pub const FRNUM: u16 = 0x06;
/// Frame List Base Address
pub const FRBASEADD: u16 = 0x08;
/// Start Of Frame Modify
pub const SOFMOD: u16 = 0x0C;

/// ルートポート `port` (0 起点) のステータス/コントロール
pub const fn portsc(port: u8) -> u16 {
    0x10 + 2 * port as u16
}

/// FRNUM の有効ビット
pub const FRNUM_MASK: u16 = 0x3FF;

// ============================================================================
// USBCMD
// ============================================================================

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct UsbCmd: u16 {
        /// Run/Stop
        const RUN = 1 << 0;
        /// Host Controller Reset
        const HC_RESET = 1 << 1;
        /// Global Reset
        const GLOBAL_RESET = 1 << 2;
        /// Enter Global Suspend Mode
        const GLOBAL_SUSPEND = 1 << 3;
        /// Force Global Resume
        const FORCE_RESUME = 1 << 4;
        /// Software Debug
        const SOFTWARE_DEBUG = 1 << 5;
        /// Configure Flag
        const CONFIGURE = 1 << 6;
        /// Max Packet (1 = 64 バイト)
        const MAX_PACKET_64 = 1 << 7;
    }
}

// ============================================================================
// USBSTS
// ============================================================================

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct UsbSts: u16 {
        /// IOC または短パケットによる割り込み
        const USB_INTERRUPT = 1 << 0;
        /// エラー割り込み
        const ERROR_INTERRUPT = 1 << 1;
        /// Resume Detect
        const RESUME_DETECT = 1 << 2;
        /// Host System Error
        const HOST_SYSTEM_ERROR = 1 << 3;
        /// Host Controller Process Error
        const PROCESS_ERROR = 1 << 4;
        /// HC Halted
        const HALTED = 1 << 5;
    }
}

impl UsbSts {
    /// 書き込み 1 でクリアできるビット
    pub const ACK_ALL: u16 = 0x3F;

    /// 復旧できないコントローラ側の異常
    pub fn is_fatal(&self) -> bool {
        self.intersects(Self::HOST_SYSTEM_ERROR | Self::PROCESS_ERROR)
    }
}

// ============================================================================
// USBINTR
// ============================================================================

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct UsbIntr: u16 {
        const TIMEOUT_CRC = 1 << 0;
        const RESUME = 1 << 1;
        const COMPLETE = 1 << 2;
        const SHORT_PACKET = 1 << 3;
    }
}

// ============================================================================
// PORTSC
// ============================================================================

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PortSc: u16 {
        /// Current Connect Status
        const CONNECTED = 1 << 0;
        /// Connect Status Change (W1C)
        const CONNECT_CHANGE = 1 << 1;
        /// Port Enabled
        const ENABLED = 1 << 2;
        /// Port Enable Change (W1C)
        const ENABLE_CHANGE = 1 << 3;
        /// Line Status
        const LINE_STATUS = 3 << 4;
        /// Resume Detect
        const RESUME_DETECT = 1 << 6;
        /// 予約。実在するポートでは常に 1 が読める
        const PRESENT = 1 << 7;
        /// Low Speed Device Attached
        const LOW_SPEED = 1 << 8;
        /// Port Reset
        const RESET = 1 << 9;
        /// Suspend
        const SUSPEND = 1 << 12;
    }
}

impl PortSc {
    /// 書き込み 1 でクリアされる変化ビット
    pub const CHANGE_BITS: Self = Self::CONNECT_CHANGE.union(Self::ENABLE_CHANGE);

    /// 変化ビットを誤ってクリアしないための書き込み値
    pub fn preserve(self) -> Self {
        self.difference(Self::CHANGE_BITS)
            .intersection(Self::ENABLED | Self::RESET | Self::SUSPEND | Self::RESUME_DETECT)
    }
}
