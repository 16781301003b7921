// ============================================================================
// src/sync/wait_queue.rs - Wait Queue
//
// 問題: スピンロックを保持したままスリープできない
// → ロックを外してから待つと、その隙間の wake を取りこぼす
//
// 解決: 世代カウンタ（イベントカウント）
//       ロック中に世代を読み、ロックを外し、世代が変わっていなければ寝る
//       wake_all は世代を進めてからパーカーを起こす
// ============================================================================
use alloc::sync::Arc;
use core::sync::atomic::{AtomicU64, Ordering};

use crate::error::UsbResult;

/// スレッドを休止・再開させるカーネル側の機構
///
/// `park` は `should_wake` が真になるか、1 ティック経過で戻る。
/// ティックでの復帰はポーリング動作（割り込みなし）のために必要。
pub trait Parker: Send + Sync {
    /// 休止する。待機がキャンセルされた場合は `UsbError::Interrupted`
    fn park(&self, should_wake: &dyn Fn() -> bool) -> UsbResult<()>;

    /// 休止中のスレッドをすべて起こす
    fn unpark_all(&self);

    /// ミリ秒単位のビジーでない遅延
    fn sleep_ms(&self, ms: u32);
}

/// 世代カウンタ付き待ちキュー
pub struct WaitQueue {
    generation: AtomicU64,
    parker: Arc<dyn Parker>,
}

impl WaitQueue {
    pub fn new(parker: Arc<dyn Parker>) -> Self {
        Self {
            generation: AtomicU64::new(0),
            parker,
        }
    }

    /// 現在の世代（ロック保持中に読むこと）
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    /// `seen` 以降に wake がなければ休止する
    pub fn wait(&self, seen: u64) -> UsbResult<()> {
        self.parker
            .park(&|| self.generation.load(Ordering::Acquire) != seen)
    }

    /// 全待機者を起こす
    pub fn wake_all(&self) {
        self.generation.fetch_add(1, Ordering::AcqRel);
        self.parker.unpark_all();
    }

    /// 下位のパーカー
    pub fn parker(&self) -> &Arc<dyn Parker> {
        &self.parker
    }
}
