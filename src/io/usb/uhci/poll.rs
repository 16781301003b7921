// ============================================================================
// src/io/usb/uhci/poll.rs - Completion Poller
// ============================================================================
//!
//! 転送の完了はハードウェアが上書きする状態ビットでしか分からない。
//! QH の element が指す TD を見て、キューの状態を判定する。
//!
//! | element / TD の状態              | 判定                |
//! |----------------------------------|---------------------|
//! | element = T                      | Complete            |
//! | ACTIVE                           | Busy                |
//! | STALLED                          | Err(Stalled)        |
//! | CRC/bitstuff/babble/DBE          | Err(TransactionError) |
//! | 非アクティブ・最後の TD          | Complete            |
//! | 非アクティブ・要求より短い       | Short(index)        |
//! | それ以外（ハードウェアが前進中） | Busy                |

use super::hw::{QueueHead, TdStatus, link};
use super::TdPool;
use super::transfer::TdChain;
use crate::error::{UsbError, UsbResult};

/// キューの状態
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferState {
    /// まだハードウェアが処理中
    Busy,
    /// 全 TD を処理済み
    Complete,
    /// `index` 番目の TD で短パケットを受け、キューが止まった
    Short(usize),
}

/// QH のキューを判定する
///
/// element がプール外や `chain` 外を指していたら内部不整合としてパニックする。
pub fn poll_queue(pool: &TdPool, qh: &QueueHead, chain: &TdChain) -> UsbResult<TransferState> {
    let element = qh.element();
    if link::is_terminate(element) {
        return Ok(TransferState::Complete);
    }
    let Some(slot) = pool.resolve(link::addr(element)) else {
        log::error!("uhci: bogus td link {:#010x}", element);
        panic!("uhci: qh element {:#010x} is not a pool td", element);
    };
    let Some(index) = chain.position(slot) else {
        panic!("uhci: qh element {:#010x} outside its td chain", element);
    };

    let td = pool.get(slot);
    let status = td.status();
    if status.contains(TdStatus::ACTIVE) {
        return Ok(TransferState::Busy);
    }
    if status.contains(TdStatus::STALLED) {
        return Err(UsbError::Stalled);
    }
    if status.intersects(TdStatus::TRANSACTION_ERRORS) {
        return Err(UsbError::TransactionError);
    }
    if index + 1 == chain.len() {
        return Ok(TransferState::Complete);
    }
    if td.actual_length() < td.token().max_length() {
        return Ok(TransferState::Short(index));
    }
    Ok(TransferState::Busy)
}
