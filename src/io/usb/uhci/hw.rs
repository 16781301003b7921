// ============================================================================
// src/io/usb/uhci/hw.rs - Hardware Descriptor Layout
// ============================================================================
//!
//! # TD / QH のメモリレイアウト
//!
//! コントローラが DMA で読み書きする構造体。
//! フィールドはすべて `AtomicU32` で、ハードウェアが観測しうる
//! 書き込みは 1 回のストアで完結する（ポインタが破れて見えない）。
//!
//! ```text
//! TD (32 バイト, 32 バイト境界)
//! +0  link       : 次の TD/QH | VF | Q | T
//! +4  ctrl_sts   : ActLen[10:0] 状態[23:17] IOC IOS LS C_ERR SPD
//! +8  token      : PID[7:0] ADDR[14:8] ENDP[18:15] D[19] MaxLen[31:21]
//! +12 buffer     : データバッファのデバイスアドレス
//! +16 (ソフトウェア予約)
//!
//! QH (16 バイト, 16 バイト境界)
//! +0  link       : 水平方向の次の QH
//! +4  element    : 最初の TD または入れ子の QH
//! ```

use bitflags::bitflags;
use core::sync::atomic::{AtomicU32, Ordering};

// ============================================================================
// Link Pointer
// ============================================================================

/// リンクポインタのビット
pub mod link {
    /// Terminate: リンク先なし
    pub const TERMINATE: u32 = 1 << 0;
    /// リンク先は QH
    pub const QH: u32 = 1 << 1;
    /// 深さ優先 (Vertical First)
    pub const DEPTH: u32 = 1 << 2;
    /// アドレス部のマスク
    pub const ADDR_MASK: u32 = !0xF;

    pub const fn is_terminate(link: u32) -> bool {
        link & TERMINATE != 0
    }

    pub const fn is_qh(link: u32) -> bool {
        link & QH != 0
    }

    pub const fn addr(link: u32) -> u32 {
        link & ADDR_MASK
    }
}

/// プールで管理されるハードウェア記述子
pub trait HwDescriptor: Sync {
    /// 割り当て直後の状態（どこにもリンクしない）に戻す
    fn clear(&self);
}

// ============================================================================
// Transfer Descriptor
// ============================================================================

bitflags! {
    /// TD の制御/状態ワード
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct TdStatus: u32 {
        const BITSTUFF_ERROR = 1 << 17;
        const CRC_TIMEOUT = 1 << 18;
        const NAK = 1 << 19;
        const BABBLE = 1 << 20;
        const DATA_BUFFER_ERROR = 1 << 21;
        const STALLED = 1 << 22;
        const ACTIVE = 1 << 23;
        /// Interrupt On Complete
        const IOC = 1 << 24;
        /// Isochronous Select
        const ISOCHRONOUS = 1 << 25;
        const LOW_SPEED = 1 << 26;
        /// Short Packet Detect
        const SHORT_PACKET = 1 << 29;
    }
}

impl TdStatus {
    /// 再試行で回復しないトランザクションエラー
    pub const TRANSACTION_ERRORS: Self = Self::CRC_TIMEOUT
        .union(Self::BITSTUFF_ERROR)
        .union(Self::BABBLE)
        .union(Self::DATA_BUFFER_ERROR);

    /// ActLen のマスク
    pub const ACTUAL_LENGTH_MASK: u32 = 0x7FF;

    /// C_ERR のシフト量
    pub const ERROR_COUNT_SHIFT: u32 = 27;

    /// エラーカウンタ値 (0..=3)
    pub fn error_count(count: u8) -> u32 {
        ((count as u32) & 0x3) << Self::ERROR_COUNT_SHIFT
    }
}

/// パケット ID
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Pid {
    Setup = 0x2D,
    In = 0x69,
    Out = 0xE1,
}

/// トークンワードの組み立て
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Token(pub u32);

impl Token {
    const TOGGLE: u32 = 1 << 19;
    const MAX_LENGTH_SHIFT: u32 = 21;

    pub fn new(pid: Pid, address: u8, endpoint: u8, toggle: bool, length: usize) -> Self {
        // MaxLen は n-1 で表し、0 バイトは 0x7FF
        let max_len = (length as u32).wrapping_sub(1) & 0x7FF;
        Self(
            pid as u32
                | ((address as u32 & 0x7F) << 8)
                | ((endpoint as u32 & 0xF) << 15)
                | if toggle { Self::TOGGLE } else { 0 }
                | (max_len << Self::MAX_LENGTH_SHIFT),
        )
    }

    pub fn pid(&self) -> u8 {
        (self.0 & 0xFF) as u8
    }

    pub fn address(&self) -> u8 {
        ((self.0 >> 8) & 0x7F) as u8
    }

    pub fn endpoint(&self) -> u8 {
        ((self.0 >> 15) & 0xF) as u8
    }

    pub fn toggle(&self) -> bool {
        self.0 & Self::TOGGLE != 0
    }

    pub fn with_toggle(self, toggle: bool) -> Self {
        if toggle {
            Self(self.0 | Self::TOGGLE)
        } else {
            Self(self.0 & !Self::TOGGLE)
        }
    }

    /// 要求バイト数
    pub fn max_length(&self) -> usize {
        (((self.0 >> Self::MAX_LENGTH_SHIFT) + 1) & 0x7FF) as usize
    }

    pub fn with_max_length(self, length: usize) -> Self {
        let max_len = (length as u32).wrapping_sub(1) & 0x7FF;
        Self((self.0 & !(0x7FF << Self::MAX_LENGTH_SHIFT)) | (max_len << Self::MAX_LENGTH_SHIFT))
    }
}

/// Transfer Descriptor
#[repr(C, align(32))]
pub struct TransferDescriptor {
    pub link: AtomicU32,
    pub ctrl_sts: AtomicU32,
    pub token: AtomicU32,
    pub buffer: AtomicU32,
    _software: [u32; 4],
}

const _: () = assert!(core::mem::size_of::<TransferDescriptor>() == 32);

impl HwDescriptor for TransferDescriptor {
    fn clear(&self) {
        self.link.store(link::TERMINATE, Ordering::Relaxed);
        self.ctrl_sts.store(0, Ordering::Relaxed);
        self.token.store(0, Ordering::Relaxed);
        self.buffer.store(0, Ordering::Relaxed);
    }
}

impl TransferDescriptor {
    /// アクティブな TD として書き込む（リンクは終端）
    pub fn prepare(&self, token: Token, buffer: u32, flags: TdStatus, error_count: u8) {
        self.link.store(link::TERMINATE, Ordering::Relaxed);
        self.token.store(token.0, Ordering::Relaxed);
        self.buffer.store(buffer, Ordering::Relaxed);
        self.ctrl_sts.store(
            (flags | TdStatus::ACTIVE).bits()
                | TdStatus::error_count(error_count)
                | TdStatus::ACTUAL_LENGTH_MASK,
            Ordering::Release,
        );
    }

    /// 状態をリセットして再度アクティブにする
    pub fn rearm(&self, flags: TdStatus, error_count: u8) {
        self.ctrl_sts.store(
            (flags | TdStatus::ACTIVE).bits()
                | TdStatus::error_count(error_count)
                | TdStatus::ACTUAL_LENGTH_MASK,
            Ordering::Release,
        );
    }

    pub fn status(&self) -> TdStatus {
        TdStatus::from_bits_truncate(self.ctrl_sts.load(Ordering::Acquire))
    }

    pub fn is_active(&self) -> bool {
        self.status().contains(TdStatus::ACTIVE)
    }

    /// ハードウェアが報告した転送バイト数
    pub fn actual_length(&self) -> usize {
        let actlen = self.ctrl_sts.load(Ordering::Acquire) & TdStatus::ACTUAL_LENGTH_MASK;
        ((actlen + 1) & 0x7FF) as usize
    }

    pub fn token(&self) -> Token {
        Token(self.token.load(Ordering::Acquire))
    }

    pub fn set_token(&self, token: Token) {
        self.token.store(token.0, Ordering::Relaxed);
    }

    /// ACTIVE ビットだけを落とす
    pub fn deactivate(&self) {
        self.ctrl_sts
            .fetch_and(!TdStatus::ACTIVE.bits(), Ordering::AcqRel);
    }

    /// IOC を付ける
    pub fn set_ioc(&self) {
        self.ctrl_sts.fetch_or(TdStatus::IOC.bits(), Ordering::AcqRel);
    }
}

// ============================================================================
// Queue Head
// ============================================================================

/// Queue Head
#[repr(C, align(16))]
pub struct QueueHead {
    pub link: AtomicU32,
    pub element: AtomicU32,
    _software: [u32; 2],
}

const _: () = assert!(core::mem::size_of::<QueueHead>() == 16);

impl HwDescriptor for QueueHead {
    fn clear(&self) {
        self.link.store(link::TERMINATE, Ordering::Relaxed);
        self.element.store(link::TERMINATE, Ordering::Relaxed);
    }
}

impl QueueHead {
    pub fn link(&self) -> u32 {
        self.link.load(Ordering::Acquire)
    }

    pub fn element(&self) -> u32 {
        self.element.load(Ordering::Acquire)
    }

    pub fn set_element(&self, element: u32) {
        self.element.store(element, Ordering::Release);
    }
}
