// ============================================================================
// src/io/usb/uhci/mod.rs - UHCI Host Controller Driver
// ============================================================================
//!
//! # UHCI (Universal Host Controller Interface) ドライバ
//!
//! USB 1.1 (Low/Full Speed) ホストコントローラ。
//!
//! ## アーキテクチャ
//! - 固定サイズの TD/QH プール（DMA コヒーレントページから切り出し）
//! - 静的な QH 階層: フレームリスト → root → interrupt → control → bulk
//! - アイソクロナス TD はフレームリストのスロットに直接つなぐ
//! - 完了は TD の状態ビットで検出（割り込みはフレーム単位でまとめて届く）
//!
//! ## モジュール
//! - [`regs`]: I/O レジスタ
//! - [`hw`]: TD/QH のレイアウト
//! - [`pool`]: 記述子プール
//! - [`frame_list`]: フレームリスト
//! - [`transfer`]: TD チェーンの組み立て
//! - [`schedule`]: QH 階層とフレームスロットへの挿入・削除
//! - [`poll`]: 完了判定
//! - [`pipe`]: 周期転送パイプの状態
//! - [`controller`]: コントローラ本体

pub mod controller;
pub mod frame_list;
pub mod hw;
pub mod pipe;
pub mod poll;
pub mod pool;
pub mod regs;
pub mod schedule;
pub mod transfer;

pub use controller::{Uhci, init_pci};

use hw::{QueueHead, TransferDescriptor};
use pool::{DescriptorPool, Slot};

pub type TdPool = DescriptorPool<TransferDescriptor>;
pub type QhPool = DescriptorPool<QueueHead>;
pub type TdSlot = Slot<TransferDescriptor>;
pub type QhSlot = Slot<QueueHead>;

// ============================================================================
// Configuration
// ============================================================================

/// コントローラごとの設定
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UhciConfig {
    /// 調べるルートポート数
    pub max_ports: u8,
    /// TD プールのページ数
    pub td_pool_pages: usize,
    /// QH プールのページ数
    pub qh_pool_pages: usize,
    /// アイソクロナスパイプあたりの TD 数の上限
    pub isoc_max_td: usize,
    /// TD の C_ERR (0 は無制限)
    pub error_count: u8,
    /// ハードウェアハンドシェイクの再試行回数
    pub handshake_retries: u32,
    /// 再試行の間隔 (ms)
    pub handshake_delay_ms: u32,
    /// ポートリセットを保持する時間 (ms)
    pub port_reset_ms: u32,
    /// フレーム境界待ちの再試行回数（1ms 間隔）
    pub frame_wait_retries: u32,
}

impl Default for UhciConfig {
    fn default() -> Self {
        Self {
            max_ports: 8,
            td_pool_pages: 8,
            qh_pool_pages: 1,
            isoc_max_td: 16,
            error_count: 3,
            handshake_retries: 100,
            handshake_delay_ms: 1,
            port_reset_ms: 50,
            frame_wait_retries: 16,
        }
    }
}

// ============================================================================
// Statistics
// ============================================================================

#[cfg(feature = "stats")]
pub use stats::{UhciStats, UhciStatsSnapshot};

#[cfg(feature = "stats")]
mod stats {
    use core::sync::atomic::{AtomicU64, Ordering};

    /// コントローラの統計カウンタ
    #[derive(Debug, Default)]
    pub struct UhciStats {
        pub completed: AtomicU64,
        pub failed: AtomicU64,
        pub interrupts: AtomicU64,
    }

    /// ある時点の統計値
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct UhciStatsSnapshot {
        pub completed: u64,
        pub failed: u64,
        pub interrupts: u64,
    }

    impl UhciStats {
        pub fn record<T, E>(&self, result: &Result<T, E>) {
            match result {
                Ok(_) => self.completed.fetch_add(1, Ordering::Relaxed),
                Err(_) => self.failed.fetch_add(1, Ordering::Relaxed),
            };
        }

        pub fn snapshot(&self) -> UhciStatsSnapshot {
            UhciStatsSnapshot {
                completed: self.completed.load(Ordering::Relaxed),
                failed: self.failed.load(Ordering::Relaxed),
                interrupts: self.interrupts.load(Ordering::Relaxed),
            }
        }
    }
}
