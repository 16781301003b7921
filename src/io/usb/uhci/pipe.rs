// ============================================================================
// src/io/usb/uhci/pipe.rs - Periodic Pipe State
// ============================================================================
//!
//! # 周期転送パイプのコントローラ側状態
//!
//! ## インタラプト
//! パイプごとに 1 つの QH を interrupt アンカーに常駐させる。
//! 完了のたびに TD をリセットし、データトグルを引き継いで再アームする。
//!
//! ## アイソクロナス
//! ```text
//! half 0: pos0 .. pos0+h-1     half 1: pos1 = pos0+h .. pos0+2h-1
//!            |                            |
//!   完了 -> 外す -> 再充填 -> pos0 += 2h -> 挿入 -> 交代
//! ```
//! h は 2 のべき乗なので、挿入位置が 1024 の折り返しをまたいでも
//! 半バッファの途中で剰余がずれることはない。

use alloc::sync::Arc;
use alloc::vec::Vec;

use super::frame_list::{FRAME_LIST_LEN, FrameList};
use super::hw::{TdStatus, link};
use super::poll::{TransferState, poll_queue};
use super::pool::Ownership;
use super::schedule::{insert_isoc, remove_isoc};
use super::transfer::{
    DataStage, DataToggle, TdChain, TdTarget, build_data_chain, completed_bytes, completed_count,
    mark_chain, pid_for, rearm_chain, release_chain,
};
use super::{QhPool, QhSlot, TdPool};
use crate::error::{UsbError, UsbResult};
use crate::io::dma::PAGE_SIZE;
use crate::io::usb::hcd::{DeviceTarget, EndpointInfo};
use crate::io::usb::{InterruptPipe, IsochronousPipe, TransferDirection, UsbSpeed};

fn td_target(device: &DeviceTarget, endpoint: &EndpointInfo, error_count: u8) -> TdTarget {
    TdTarget {
        address: device.address.as_u8(),
        endpoint: endpoint.address.number(),
        low_speed: device.speed == UsbSpeed::Low,
        error_count,
    }
}

// ============================================================================
// Interrupt Pipe
// ============================================================================

pub struct IntrPipeState {
    pub pipe: Arc<InterruptPipe>,
    pub qh: QhSlot,
    chain: TdChain,
    target: TdTarget,
    /// 現在のチェーン先頭 TD のトグル
    first_toggle: DataToggle,
    /// コールバック実行中（ロック外）
    pub in_callback: bool,
}

impl IntrPipeState {
    /// QH と TD チェーンを確保する（スケジュールへの挿入は呼び出し側）
    pub fn build(
        tds: &mut TdPool,
        qhs: &mut QhPool,
        pipe: Arc<InterruptPipe>,
        error_count: u8,
    ) -> UsbResult<Self> {
        let endpoint = *pipe.endpoint();
        let target = td_target(pipe.target(), &endpoint, error_count);
        let qh = qhs.allocate()?;

        let mut chain = TdChain::new();
        let mut toggle = DataToggle::DATA0;
        let stage = DataStage {
            pid: pid_for(endpoint.address.direction()),
            buffer: pipe.buffer().device_addr(),
            size: pipe.size(),
            max_packet_size: endpoint.max_packet_size as usize,
        };
        if let Err(e) = build_data_chain(tds, &mut chain, &target, &stage, &mut toggle) {
            log::error!("uhci: interrupt pipe td allocation failed");
            release_chain(tds, &mut chain);
            qhs.release(qh);
            return Err(e);
        }
        if let Some(last) = chain.last() {
            tds.get(last).set_ioc();
        }
        mark_chain(tds, &chain, Ownership::HardwareOwned);

        let head = qhs.get(qh);
        head.link.store(link::TERMINATE, core::sync::atomic::Ordering::Relaxed);
        head.set_element(chain.head_link(tds));

        Ok(Self {
            pipe,
            qh,
            chain,
            target,
            first_toggle: DataToggle::DATA0,
            in_callback: false,
        })
    }

    /// 完了していればバイト数かエラーを返す
    pub fn poll(&self, tds: &TdPool, qhs: &QhPool) -> Option<UsbResult<usize>> {
        match poll_queue(tds, qhs.get(self.qh), &self.chain) {
            Ok(TransferState::Busy) => None,
            Ok(TransferState::Complete) | Ok(TransferState::Short(_)) => {
                Some(Ok(completed_bytes(tds, &self.chain, false)))
            }
            Err(e) => Some(Err(e)),
        }
    }

    /// TD をリセットして QH を先頭に戻す
    ///
    /// トグルは実際に完了した TD の数だけ進めた値から再開する。
    pub fn rearm(&mut self, tds: &TdPool, qhs: &QhPool) {
        let head = qhs.get(self.qh);
        // 短パケット・エラー時は element が途中の TD を指したままなので先に切る
        head.set_element(link::TERMINATE);
        let completed = completed_count(tds, &self.chain);
        let mut toggle = self.first_toggle.advanced(completed);
        self.first_toggle = toggle;
        rearm_chain(tds, &self.chain, &self.target, &mut toggle);
        head.set_element(self.chain.head_link(tds));
    }

    /// 記述子を返却する（スケジュールから外し、フレーム境界を待った後）
    pub fn release(mut self, tds: &mut TdPool, qhs: &mut QhPool) {
        release_chain(tds, &mut self.chain);
        if qhs.ownership(self.qh) == Ownership::HardwareOwned {
            qhs.set_ownership(self.qh, Ownership::Queued);
        }
        qhs.release(self.qh);
    }
}

// ============================================================================
// Isochronous Pipe
// ============================================================================

/// パイプあたりの TD 数（2 のべき乗に切り下げ）
pub fn isoc_td_count(max_packet_size: usize, ceiling: usize) -> UsbResult<usize> {
    if max_packet_size == 0 {
        return Err(UsbError::InvalidParameter);
    }
    let count = (PAGE_SIZE / max_packet_size).min(ceiling);
    if count < 2 {
        log::warn!("uhci: isochronous packet size {} too big", max_packet_size);
        return Err(UsbError::InvalidParameter);
    }
    Ok(1 << (usize::BITS - 1 - count.leading_zeros()))
}

/// 最初の半バッファを置くスロット
///
/// 現在のフレームから 2 フレーム以上先で、`half` の倍数に揃える。
pub fn isoc_start_frame(frame_number: u16, half: usize) -> usize {
    let position = frame_number as usize + 2 + half;
    (position - position % half) % FRAME_LIST_LEN
}

pub struct IsocPipeState {
    pub pipe: Arc<IsochronousPipe>,
    halves: [TdChain; 2],
    positions: [usize; 2],
    td_count: usize,
    current: usize,
    target: TdTarget,
    pub in_callback: bool,
}

impl IsocPipeState {
    /// 2 つの半バッファ分の TD を確保する（フレームリストへの挿入は `start`）
    pub fn build(
        tds: &mut TdPool,
        pipe: Arc<IsochronousPipe>,
        td_count: usize,
        error_count: u8,
    ) -> UsbResult<Self> {
        let endpoint = *pipe.endpoint();
        let target = td_target(pipe.target(), &endpoint, error_count);
        let mps = endpoint.max_packet_size as usize;
        let half_len = td_count / 2 * mps;

        let mut halves = [TdChain::new(), TdChain::new()];
        for i in 0..halves.len() {
            // アイソクロナスはトグルを使わない (常に DATA0)
            let mut toggle = DataToggle::DATA0;
            let stage = DataStage {
                pid: pid_for(pipe.direction()),
                buffer: pipe.buffer().device_addr_at(i * half_len),
                size: half_len,
                max_packet_size: mps,
            };
            if let Err(e) = build_data_chain(tds, &mut halves[i], &target, &stage, &mut toggle) {
                log::error!("uhci: isochronous td allocation failed");
                for chain in halves.iter_mut() {
                    release_chain(tds, chain);
                }
                return Err(e);
            }
            for td in halves[i].iter() {
                let td = tds.get(td);
                td.set_token(td.token().with_toggle(false));
            }
        }

        Ok(Self {
            pipe,
            halves,
            positions: [0; 2],
            td_count,
            current: 0,
            target,
            in_callback: false,
        })
    }

    /// 半バッファあたりの TD 数
    pub fn half_len(&self) -> usize {
        self.td_count / 2
    }

    pub fn current(&self) -> usize {
        self.current
    }

    pub fn position(&self, half: usize) -> usize {
        self.positions[half]
    }

    /// 半バッファ `half` の TD をパケットサイズ `sizes` でアクティブにする
    pub fn apply_sizes(&self, tds: &TdPool, half: usize, sizes: &[u16]) {
        let chain = &self.halves[half];
        let last = chain.len().saturating_sub(1);
        for (i, (td, &size)) in chain.iter().zip(sizes.iter()).enumerate() {
            let td = tds.get(td);
            td.set_token(td.token().with_max_length(size as usize));
            let mut flags = TdStatus::ISOCHRONOUS;
            if self.target.low_speed {
                flags |= TdStatus::LOW_SPEED;
            }
            if i == last {
                flags |= TdStatus::IOC;
            }
            td.rearm(flags, self.target.error_count);
        }
    }

    /// 両方の半バッファをフレームリストに挿入する
    pub fn start(&mut self, frames: &FrameList, tds: &mut TdPool, frame_number: u16) {
        let half = self.half_len();
        self.positions[0] = isoc_start_frame(frame_number, half);
        self.positions[1] = (self.positions[0] + half) % FRAME_LIST_LEN;
        self.current = 0;
        for i in 0..2 {
            insert_isoc(frames, tds, &self.halves[i], self.positions[i]);
        }
    }

    /// 処理中の半バッファが終わっていれば、TD ごとの実転送サイズを返す
    pub fn poll(&self, tds: &TdPool) -> Option<Vec<u16>> {
        let chain = &self.halves[self.current];
        let last = chain.last()?;
        if tds.get(last).is_active() {
            return None;
        }
        Some(
            chain
                .iter()
                .map(|td| {
                    let td = tds.get(td);
                    let status = td.status();
                    if status.intersects(TdStatus::TRANSACTION_ERRORS) {
                        log::debug!("uhci: isochronous packet error {:?}", status);
                    }
                    td.actual_length() as u16
                })
                .collect(),
        )
    }

    /// 完了した半バッファを外し、1 周期先に挿入し直して交代する
    pub fn advance(&mut self, frames: &FrameList, tds: &mut TdPool, half: usize, sizes: &[u16]) {
        debug_assert_eq!(half, self.current);
        remove_isoc(frames, tds, &self.halves[half], self.positions[half]);
        let next_sizes = self.next_sizes(sizes);
        self.apply_sizes(tds, half, &next_sizes);
        self.positions[half] = (self.positions[half] + self.td_count) % FRAME_LIST_LEN;
        insert_isoc(frames, tds, &self.halves[half], self.positions[half]);
        self.current ^= 1;
    }

    /// 次に要求するパケットサイズ（IN は常に最大パケットサイズ）
    fn next_sizes(&self, sizes: &[u16]) -> Vec<u16> {
        let mps = self.pipe.endpoint().max_packet_size;
        match self.pipe.direction() {
            TransferDirection::In => alloc::vec![mps; self.half_len()],
            TransferDirection::Out => sizes.to_vec(),
        }
    }

    /// フレームリストから外す
    pub fn unlink(&self, frames: &FrameList, tds: &mut TdPool) {
        for half in 0..2 {
            remove_isoc(frames, tds, &self.halves[half], self.positions[half]);
        }
    }

    /// TD を返却する（`unlink` とフレーム境界待ちの後、または挿入前）
    pub fn release(mut self, tds: &mut TdPool) {
        for chain in self.halves.iter_mut() {
            release_chain(tds, chain);
        }
    }
}
