// ============================================================================
// src/io/usb/uhci/transfer.rs - Transfer Builder
// ============================================================================
//!
//! # TD チェーンの組み立て
//!
//! 1 つの転送を最大パケットサイズごとの TD に分割し、深さ優先で連結する。
//!
//! コントロール転送:
//! ```text
//! SETUP(D0, 8) -> DATA(D1) -> DATA(D0) -> ... -> STATUS(D1, 0, 逆方向, IOC)
//! ```

use alloc::vec::Vec;
use core::sync::atomic::Ordering;

use super::hw::{Pid, TdStatus, Token, link};
use super::pool::Ownership;
use super::{TdPool, TdSlot};
use crate::error::UsbResult;
use crate::io::usb::{SetupPacket, TransferDirection};

// ============================================================================
// Data Toggle
// ============================================================================

/// エンドポイントごとに持続するデータトグル
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DataToggle(bool);

impl DataToggle {
    pub const DATA0: Self = Self(false);
    pub const DATA1: Self = Self(true);

    pub fn get(&self) -> bool {
        self.0
    }

    /// 現在値を返して反転する
    pub fn next(&mut self) -> bool {
        let current = self.0;
        self.0 = !current;
        current
    }

    /// `packets` 回反転した値
    pub fn advanced(self, packets: usize) -> Self {
        Self(self.0 ^ (packets % 2 == 1))
    }
}

// ============================================================================
// Target / Chain
// ============================================================================

/// TD のトークンに埋め込む転送先
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TdTarget {
    pub address: u8,
    pub endpoint: u8,
    pub low_speed: bool,
    /// C_ERR に書く再試行回数
    pub error_count: u8,
}

impl TdTarget {
    fn flags(&self, pid: Pid) -> TdStatus {
        let mut flags = TdStatus::empty();
        if self.low_speed {
            flags |= TdStatus::LOW_SPEED;
        }
        if pid == Pid::In {
            flags |= TdStatus::SHORT_PACKET;
        }
        flags
    }
}

/// 1 転送分の TD 列（先頭から順にハードウェアが処理する）
#[derive(Debug, Clone, Default)]
pub struct TdChain {
    tds: Vec<TdSlot>,
}

impl TdChain {
    pub fn new() -> Self {
        Self { tds: Vec::new() }
    }

    /// 末尾に連結する
    pub fn push(&mut self, pool: &TdPool, td: TdSlot) {
        if let Some(&last) = self.tds.last() {
            pool.get(last)
                .link
                .store(link::DEPTH | pool.addr(td), Ordering::Release);
        }
        self.tds.push(td);
    }

    pub fn first(&self) -> Option<TdSlot> {
        self.tds.first().copied()
    }

    pub fn last(&self) -> Option<TdSlot> {
        self.tds.last().copied()
    }

    pub fn get(&self, index: usize) -> Option<TdSlot> {
        self.tds.get(index).copied()
    }

    pub fn len(&self) -> usize {
        self.tds.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tds.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = TdSlot> + '_ {
        self.tds.iter().copied()
    }

    pub fn position(&self, td: TdSlot) -> Option<usize> {
        self.tds.iter().position(|&t| t == td)
    }

    /// QH の element に書くリンク
    pub fn head_link(&self, pool: &TdPool) -> u32 {
        self.first()
            .map(|td| pool.addr(td))
            .unwrap_or(link::TERMINATE)
    }
}

/// データステージの指定
#[derive(Debug, Clone, Copy)]
pub struct DataStage {
    pub pid: Pid,
    /// バッファのデバイスアドレス
    pub buffer: u32,
    pub size: usize,
    pub max_packet_size: usize,
}

// ============================================================================
// Builders
// ============================================================================

/// 最大パケットサイズごとの TD を `chain` に追加する
///
/// 失敗時に追加済みの TD は `chain` に残るので、呼び出し側が解放する。
pub fn build_data_chain(
    pool: &mut TdPool,
    chain: &mut TdChain,
    target: &TdTarget,
    stage: &DataStage,
    toggle: &mut DataToggle,
) -> UsbResult<()> {
    let flags = target.flags(stage.pid);
    let mut offset = 0;
    while offset < stage.size {
        let len = (stage.size - offset).min(stage.max_packet_size);
        let td = pool.allocate()?;
        let token = Token::new(stage.pid, target.address, target.endpoint, toggle.next(), len);
        pool.get(td)
            .prepare(token, stage.buffer + offset as u32, flags, target.error_count);
        chain.push(pool, td);
        offset += len;
    }
    Ok(())
}

/// SETUP / DATA / STATUS の 3 ステージを組み立てる
///
/// プールが尽きた場合は途中まで確保した TD をすべて返却する。
pub fn build_control(
    pool: &mut TdPool,
    target: &TdTarget,
    direction: TransferDirection,
    request_addr: u32,
    data_addr: u32,
    size: usize,
    max_packet_size: usize,
) -> UsbResult<TdChain> {
    let mut chain = TdChain::new();
    match build_control_stages(
        pool,
        &mut chain,
        target,
        direction,
        request_addr,
        data_addr,
        size,
        max_packet_size,
    ) {
        Ok(()) => Ok(chain),
        Err(e) => {
            log::error!("uhci: control transfer build failed: {}", e);
            release_chain(pool, &mut chain);
            Err(e)
        }
    }
}

#[allow(clippy::too_many_arguments)]
fn build_control_stages(
    pool: &mut TdPool,
    chain: &mut TdChain,
    target: &TdTarget,
    direction: TransferDirection,
    request_addr: u32,
    data_addr: u32,
    size: usize,
    max_packet_size: usize,
) -> UsbResult<()> {
    // SETUP
    let setup = pool.allocate()?;
    let token = Token::new(
        Pid::Setup,
        target.address,
        target.endpoint,
        false,
        SetupPacket::SIZE,
    );
    pool.get(setup)
        .prepare(token, request_addr, target.flags(Pid::Setup), target.error_count);
    chain.push(pool, setup);

    // DATA
    let data_pid = pid_for(direction);
    let mut toggle = DataToggle::DATA1;
    build_data_chain(
        pool,
        chain,
        target,
        &DataStage {
            pid: data_pid,
            buffer: data_addr,
            size,
            max_packet_size,
        },
        &mut toggle,
    )?;

    // STATUS
    let status_pid = pid_for(direction.reverse());
    let status = pool.allocate()?;
    let token = Token::new(status_pid, target.address, target.endpoint, true, 0);
    // 0 バイトなので SPD は不要
    let flags = target.flags(status_pid).difference(TdStatus::SHORT_PACKET) | TdStatus::IOC;
    pool.get(status).prepare(token, 0, flags, target.error_count);
    chain.push(pool, status);
    Ok(())
}

pub fn pid_for(direction: TransferDirection) -> Pid {
    match direction {
        TransferDirection::In => Pid::In,
        TransferDirection::Out => Pid::Out,
    }
}

// ============================================================================
// Completion Accounting
// ============================================================================

/// 完了した TD のバイト数を合計する
///
/// 最初のアクティブな TD で止まる。短パケットで後続の TD が
/// 未処理のまま残るのは正常な終わり方。
pub fn completed_bytes(pool: &TdPool, chain: &TdChain, skip_setup: bool) -> usize {
    chain
        .iter()
        .skip(usize::from(skip_setup))
        .map(|td| pool.get(td))
        .take_while(|td| !td.is_active())
        .map(|td| td.actual_length())
        .sum()
}

/// 先頭から連続してエラーなく完了した TD の数
pub fn completed_count(pool: &TdPool, chain: &TdChain) -> usize {
    chain
        .iter()
        .map(|td| pool.get(td).status())
        .take_while(|status| {
            !status.contains(TdStatus::ACTIVE)
                && !status.intersects(TdStatus::TRANSACTION_ERRORS | TdStatus::STALLED)
        })
        .count()
}

/// チェーンを再アクティブ化する（周期転送の再アーム）
///
/// トークンのトグルを `toggle` から振り直し、最後の TD に IOC を付ける。
pub fn rearm_chain(pool: &TdPool, chain: &TdChain, target: &TdTarget, toggle: &mut DataToggle) {
    let last = chain.len().saturating_sub(1);
    for (i, td) in chain.iter().enumerate() {
        let td = pool.get(td);
        let token = td.token();
        td.set_token(token.with_toggle(toggle.next()));
        let pid = if token.pid() == Pid::In as u8 {
            Pid::In
        } else {
            Pid::Out
        };
        let mut flags = target.flags(pid);
        if i == last {
            flags |= TdStatus::IOC;
        }
        td.rearm(flags, target.error_count);
    }
}

/// チェーン全体の所有状態を変更する
pub fn mark_chain(pool: &mut TdPool, chain: &TdChain, ownership: Ownership) {
    for td in chain.iter() {
        pool.set_ownership(td, ownership);
    }
}

/// チェーンをプールに返却する（スケジュールから外した後に呼ぶこと）
pub fn release_chain(pool: &mut TdPool, chain: &mut TdChain) {
    for td in chain.tds.drain(..) {
        pool.get(td).deactivate();
        if pool.ownership(td) == Ownership::HardwareOwned {
            pool.set_ownership(td, Ownership::Queued);
        }
        pool.release(td);
    }
}

/// TD チェーンの内容をトレース出力する
#[cfg(feature = "verbose_logging")]
pub fn dump_chain(pool: &TdPool, chain: &TdChain) {
    for (i, slot) in chain.iter().enumerate() {
        let td = pool.get(slot);
        log::trace!(
            "uhci: td[{}] @{:#010x} link={:#010x} sts={:#010x} token={:#010x} buf={:#010x}",
            i,
            pool.addr(slot),
            td.link.load(Ordering::Relaxed),
            td.ctrl_sts.load(Ordering::Relaxed),
            td.token.load(Ordering::Relaxed),
            td.buffer.load(Ordering::Relaxed),
        );
    }
}
