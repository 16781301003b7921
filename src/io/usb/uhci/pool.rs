// ============================================================================
// src/io/usb/uhci/pool.rs - Descriptor Pool
// ============================================================================
//!
//! # 固定サイズ記述子プール
//!
//! 初期化時に DMA コヒーレントページを TD/QH 単位に切り分け、
//! フリーリストにつなぐ。拡張はしない（アドレスが固定であることが前提）。
//!
//! ## 所有状態
//! ```text
//! Free --allocate--> Queued --link--> HardwareOwned
//!   ^                  |  ^                |
//!   +-----release------+  +---unlink-------+
//! ```
//! HardwareOwned のまま release するのはバグで、debug ビルドで検出する。

use alloc::sync::Arc;
use alloc::vec::Vec;
use core::fmt;
use core::marker::PhantomData;
use core::mem::size_of;

use super::hw::HwDescriptor;
use crate::error::{UsbError, UsbResult};
use crate::io::dma::{DmaAllocator, DmaBuffer, PAGE_SIZE};

/// 記述子の所有状態
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ownership {
    /// フリーリスト上
    Free,
    /// ソフトウェアが組み立て中、または切り離し済み
    Queued,
    /// スケジュールにリンクされ、ハードウェアが参照しうる
    HardwareOwned,
}

/// プール内の記述子へのハンドル
pub struct Slot<T> {
    index: u16,
    _marker: PhantomData<fn() -> T>,
}

impl<T> Slot<T> {
    fn new(index: usize) -> Self {
        Self {
            index: index as u16,
            _marker: PhantomData,
        }
    }

    pub fn index(&self) -> usize {
        self.index as usize
    }
}

impl<T> Clone for Slot<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for Slot<T> {}

impl<T> PartialEq for Slot<T> {
    fn eq(&self, other: &Self) -> bool {
        self.index == other.index
    }
}

impl<T> Eq for Slot<T> {}

impl<T> fmt::Debug for Slot<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Slot({})", self.index)
    }
}

/// 記述子プール
pub struct DescriptorPool<T: HwDescriptor> {
    buffer: DmaBuffer,
    capacity: usize,
    free: Vec<u16>,
    ownership: Vec<Ownership>,
    _marker: PhantomData<T>,
}

// SAFETY: 記述子はすべて Atomic フィールドで構成され、
// 可変操作はプールの所有者（コントローラのロック保持者）だけが行う
unsafe impl<T: HwDescriptor> Send for DescriptorPool<T> {}
unsafe impl<T: HwDescriptor> Sync for DescriptorPool<T> {}

impl<T: HwDescriptor> DescriptorPool<T> {
    /// `pages` ページ分の記述子を確保する
    pub fn new(dma: &Arc<dyn DmaAllocator>, pages: usize) -> UsbResult<Self> {
        if pages == 0 {
            return Err(UsbError::InvalidParameter);
        }
        let buffer = DmaBuffer::allocate_pages(dma, pages)?;
        let capacity = (pages * PAGE_SIZE / size_of::<T>()).min(u16::MAX as usize + 1);
        let pool = Self {
            buffer,
            capacity,
            free: (0..capacity as u32).map(|i| i as u16).collect(),
            ownership: alloc::vec![Ownership::Free; capacity],
            _marker: PhantomData,
        };
        for index in 0..capacity {
            pool.entry(index).clear();
        }
        Ok(pool)
    }

    fn entry(&self, index: usize) -> &T {
        debug_assert!(index < self.capacity);
        // SAFETY: バッファはページ境界（T のアライメント以上）から始まり、
        // capacity 個の T を収める。ゼロ初期化は Atomic にとって有効な値
        unsafe { &*(self.buffer.as_ptr() as *const T).add(index) }
    }

    /// フリーリストの末尾から 1 つ取り出す
    pub fn allocate(&mut self) -> UsbResult<Slot<T>> {
        let index = self.free.pop().ok_or(UsbError::NoMemory)? as usize;
        debug_assert_eq!(self.ownership[index], Ownership::Free);
        self.ownership[index] = Ownership::Queued;
        self.entry(index).clear();
        Ok(Slot::new(index))
    }

    /// フリーリストの末尾に戻す
    pub fn release(&mut self, slot: Slot<T>) {
        let index = slot.index();
        assert!(
            self.ownership[index] != Ownership::Free,
            "descriptor {} released twice",
            index
        );
        debug_assert!(
            self.ownership[index] != Ownership::HardwareOwned,
            "descriptor {} released while hardware-owned",
            index
        );
        self.ownership[index] = Ownership::Free;
        self.free.push(slot.index);
    }

    /// 所有状態を変更する
    pub fn set_ownership(&mut self, slot: Slot<T>, ownership: Ownership) {
        debug_assert!(self.ownership[slot.index()] != Ownership::Free);
        debug_assert!(ownership != Ownership::Free);
        self.ownership[slot.index()] = ownership;
    }

    pub fn ownership(&self, slot: Slot<T>) -> Ownership {
        self.ownership[slot.index()]
    }

    pub fn get(&self, slot: Slot<T>) -> &T {
        self.entry(slot.index())
    }

    /// ハードウェアのリンクに書くアドレス
    pub fn addr(&self, slot: Slot<T>) -> u32 {
        self.buffer.device_addr_at(slot.index() * size_of::<T>())
    }

    /// リンクのアドレスから記述子を引く（プール外・境界違反なら None）
    pub fn resolve(&self, addr: u32) -> Option<Slot<T>> {
        let base = self.buffer.device_addr();
        let offset = addr.checked_sub(base)? as usize;
        if offset % size_of::<T>() != 0 {
            return None;
        }
        let index = offset / size_of::<T>();
        (index < self.capacity).then(|| Slot::new(index))
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// 空き数
    pub fn available(&self) -> usize {
        self.free.len()
    }

    /// 使用中の数
    pub fn in_use(&self) -> usize {
        self.capacity - self.free.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::dma::testing::heap_dma;
    use crate::io::usb::uhci::hw::{QueueHead, TransferDescriptor};
    use alloc::collections::BTreeSet;

    #[test]
    fn test_capacity_from_pages() {
        let dma = heap_dma();
        let tds = DescriptorPool::<TransferDescriptor>::new(&dma, 8).unwrap();
        assert_eq!(tds.capacity(), 1024);
        let qhs = DescriptorPool::<QueueHead>::new(&dma, 1).unwrap();
        assert_eq!(qhs.capacity(), 256);
        assert_eq!(qhs.available(), 256);
    }

    #[test]
    fn test_pool_conservation() {
        let dma = heap_dma();
        let mut pool = DescriptorPool::<QueueHead>::new(&dma, 1).unwrap();
        let mut held = Vec::new();
        let mut seen = BTreeSet::new();

        // 確保と解放を交互に混ぜる
        for round in 0..600usize {
            if round % 3 == 2 {
                if let Some(slot) = held.pop() {
                    seen.remove(&slot_index(slot));
                    pool.release(slot);
                }
            } else {
                match pool.allocate() {
                    Ok(slot) => {
                        // 解放前に同じ記述子が二度払い出されない
                        assert!(seen.insert(slot_index(slot)));
                        held.push(slot);
                    }
                    Err(e) => {
                        assert_eq!(e, UsbError::NoMemory);
                        assert_eq!(held.len(), pool.capacity());
                    }
                }
            }
            assert!(pool.in_use() <= pool.capacity());
            assert_eq!(pool.in_use(), held.len());
        }
    }

    fn slot_index(slot: Slot<QueueHead>) -> usize {
        slot.index()
    }

    #[test]
    fn test_exhaustion_returns_no_memory() {
        let dma = heap_dma();
        let mut pool = DescriptorPool::<QueueHead>::new(&dma, 1).unwrap();
        let slots: Vec<_> = (0..256).map(|_| pool.allocate().unwrap()).collect();
        assert_eq!(pool.allocate(), Err(UsbError::NoMemory));
        pool.release(slots[10]);
        // 解放した末尾の記述子が次に払い出される
        assert_eq!(pool.allocate().unwrap(), slots[10]);
    }

    #[test]
    fn test_resolve() {
        let dma = heap_dma();
        let mut pool = DescriptorPool::<TransferDescriptor>::new(&dma, 1).unwrap();
        let slot = pool.allocate().unwrap();
        let addr = pool.addr(slot);
        assert_eq!(addr % 32, 0);
        assert_eq!(pool.resolve(addr), Some(slot));
        assert_eq!(pool.resolve(addr + 4), None);
        assert_eq!(pool.resolve(pool.addr(slot).wrapping_sub(0x10_0000)), None);
        assert_eq!(pool.resolve(addr + PAGE_SIZE as u32 * 2), None);
    }

    #[test]
    #[should_panic(expected = "released twice")]
    fn test_double_release_panics() {
        let dma = heap_dma();
        let mut pool = DescriptorPool::<QueueHead>::new(&dma, 1).unwrap();
        let slot = pool.allocate().unwrap();
        pool.release(slot);
        pool.release(slot);
    }
}
