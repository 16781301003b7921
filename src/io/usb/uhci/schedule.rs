// ============================================================================
// src/io/usb/uhci/schedule.rs - Queue Scheduler
// ============================================================================
//!
//! # スケジュール
//!
//! ## 静的階層
//! ```text
//! frame[i] -> root QH
//!               | element
//!               v
//!             interrupt anchor --element--> intr QH -> intr QH -> control anchor
//!                                                                    | element
//!                                                                    v
//!                                   ctrl QH -> ctrl QH -> bulk anchor (T)
//! ```
//! 各サブリストは先頭に挿入する。ハードウェアが見るリンクは
//! 1 回のアトミックストアでしか変わらない。
//!
//! リンクは前方向にしかないため、削除はアンカーから先行要素を探す。
//!
//! ## アイソクロナス
//! TD をフレームスロットの先頭に直接つなぐ。削除はスロットごとに
//! 先頭から対象までたどる。

use alloc::vec::Vec;
use core::sync::atomic::{Ordering, fence};

use super::frame_list::{FRAME_LIST_LEN, FrameList};
use super::hw::link;
use super::pool::Ownership;
use super::transfer::TdChain;
use super::{QhPool, QhSlot, TdPool};
use crate::error::{UsbError, UsbResult};

/// サブリストのアンカー
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Anchor {
    Interrupt,
    Control,
    Bulk,
}

/// 静的 QH 階層
pub struct Schedule {
    root: QhSlot,
    interrupt: QhSlot,
    control: QhSlot,
    bulk: QhSlot,
    /// 帯域再利用 (bandwidth reclamation) の起点となる QH
    reclaim_head: Option<QhSlot>,
}

impl Schedule {
    /// アンカー QH を確保して階層を組み、フレームリスト全体を root に向ける
    pub fn new(qhs: &mut QhPool, frames: &FrameList) -> UsbResult<Self> {
        let mut anchors = Vec::with_capacity(4);
        for _ in 0..4 {
            match qhs.allocate() {
                Ok(qh) => anchors.push(qh),
                Err(e) => {
                    log::error!("uhci: anchor qh allocation failed");
                    for qh in anchors {
                        qhs.release(qh);
                    }
                    return Err(e);
                }
            }
        }
        let schedule = Self {
            root: anchors[0],
            interrupt: anchors[1],
            control: anchors[2],
            bulk: anchors[3],
            reclaim_head: None,
        };

        let wire = |qh: QhSlot, element: u32| {
            let head = qhs.get(qh);
            head.link.store(link::TERMINATE, Ordering::Relaxed);
            head.element.store(element, Ordering::Relaxed);
        };
        wire(schedule.bulk, link::TERMINATE);
        wire(schedule.control, link::QH | qhs.addr(schedule.bulk));
        wire(schedule.interrupt, link::QH | qhs.addr(schedule.control));
        wire(schedule.root, link::QH | qhs.addr(schedule.interrupt));
        for qh in anchors {
            qhs.set_ownership(qh, Ownership::HardwareOwned);
        }

        frames.fill(link::QH | qhs.addr(schedule.root));
        Ok(schedule)
    }

    pub fn root(&self) -> QhSlot {
        self.root
    }

    pub fn anchor(&self, anchor: Anchor) -> QhSlot {
        match anchor {
            Anchor::Interrupt => self.interrupt,
            Anchor::Control => self.control,
            Anchor::Bulk => self.bulk,
        }
    }

    /// サブリストの終端（次の階層のアンカー）
    fn terminator(&self, anchor: Anchor) -> Option<QhSlot> {
        match anchor {
            Anchor::Interrupt => Some(self.control),
            Anchor::Control => Some(self.bulk),
            Anchor::Bulk => None,
        }
    }

    pub fn reclaim_head(&self) -> Option<QhSlot> {
        self.reclaim_head
    }

    /// `qh` をサブリストの先頭に挿入する
    pub fn queue(&mut self, qhs: &mut QhPool, anchor: Anchor, qh: QhSlot) {
        let head = qhs.get(self.anchor(anchor));
        qhs.get(qh).link.store(head.element(), Ordering::Relaxed);
        fence(Ordering::Release);
        head.element
            .store(link::QH | qhs.addr(qh), Ordering::Release);
        qhs.set_ownership(qh, Ownership::HardwareOwned);
        if anchor == Anchor::Control {
            self.reclaim_head = Some(qh);
        }
    }

    /// `qh` をサブリストから外す
    ///
    /// ハードウェアはこの後も現在のフレームが終わるまで `qh` を
    /// 参照しうるので、解放はフレーム境界を待ってから行うこと。
    pub fn remove(&mut self, qhs: &mut QhPool, anchor: Anchor, qh: QhSlot) -> UsbResult<()> {
        let head = self.anchor(anchor);
        let terminator = self.terminator(anchor);
        let mut prev: Option<QhSlot> = None;
        let mut element = qhs.get(head).element();
        loop {
            if link::is_terminate(element) || !link::is_qh(element) {
                log::warn!("uhci: qh {:?} not found in {:?} list", qh, anchor);
                return Err(UsbError::NotFound);
            }
            let Some(it) = qhs.resolve(link::addr(element)) else {
                panic!("uhci: bogus qh link {:#010x}", element);
            };
            if Some(it) == terminator {
                log::warn!("uhci: qh {:?} not found in {:?} list", qh, anchor);
                return Err(UsbError::NotFound);
            }
            if it != qh {
                prev = Some(it);
                element = qhs.get(it).link();
                continue;
            }

            let next = qhs.get(qh).link();
            match prev {
                Some(prev) => qhs.get(prev).link.store(next, Ordering::Release),
                None => qhs.get(head).element.store(next, Ordering::Release),
            }
            if self.reclaim_head == Some(qh) {
                self.reclaim_head = Some(prev.unwrap_or(head));
            }
            qhs.set_ownership(qh, Ownership::Queued);
            return Ok(());
        }
    }

    /// サブリストを前方にたどった QH の列
    pub fn sub_list(&self, qhs: &QhPool, anchor: Anchor) -> Vec<QhSlot> {
        let terminator = self.terminator(anchor);
        let mut list = Vec::new();
        let mut element = qhs.get(self.anchor(anchor)).element();
        while !link::is_terminate(element) && link::is_qh(element) {
            let Some(it) = qhs.resolve(link::addr(element)) else {
                panic!("uhci: bogus qh link {:#010x}", element);
            };
            if Some(it) == terminator {
                break;
            }
            list.push(it);
            element = qhs.get(it).link();
        }
        list
    }
}

// ============================================================================
// Isochronous Slots
// ============================================================================

/// チェーンの TD を `start` から連続するスロットの先頭に挿入する
pub fn insert_isoc(frames: &FrameList, tds: &mut TdPool, chain: &TdChain, start: usize) {
    for (i, td) in chain.iter().enumerate() {
        let slot = frames.slot(start + i);
        tds.get(td)
            .link
            .store(slot.load(Ordering::Acquire), Ordering::Relaxed);
        fence(Ordering::Release);
        slot.store(tds.addr(td), Ordering::Release);
        tds.set_ownership(td, Ownership::HardwareOwned);
    }
}

/// `insert_isoc` で挿入した TD をスロットから外す
pub fn remove_isoc(frames: &FrameList, tds: &mut TdPool, chain: &TdChain, start: usize) {
    for (i, td) in chain.iter().enumerate() {
        let frame = (start + i) % FRAME_LIST_LEN;
        let slot = frames.slot(frame);
        let mut prev = None;
        let mut element = slot.load(Ordering::Acquire);
        loop {
            if element & (link::QH | link::TERMINATE) != 0 {
                log::error!("uhci: isochronous td {:?} not found in frame {}", td, frame);
                break;
            }
            let Some(it) = tds.resolve(link::addr(element)) else {
                panic!("uhci: bogus td link {:#010x} in frame {}", element, frame);
            };
            if it != td {
                prev = Some(it);
                element = tds.get(it).link.load(Ordering::Acquire);
                continue;
            }
            let next = tds.get(td).link.load(Ordering::Acquire);
            match prev {
                Some(prev) => tds.get(prev).link.store(next, Ordering::Release),
                None => slot.store(next, Ordering::Release),
            }
            tds.set_ownership(td, Ownership::Queued);
            break;
        }
    }
}
