// ============================================================================
// src/io/dma.rs - DMA-Coherent Buffer Management
// ============================================================================
//!
//! # DMAコヒーレントバッファ
//!
//! コントローラと共有するメモリは、カーネル側の [`DmaAllocator`] から
//! ページ単位で受け取る。割り当て結果は CPU 側ポインタと
//! デバイス側 32 ビットアドレスの組 ([`DmaRegion`]) になる。
//!
//! [`DmaBuffer`] は領域の所有者で、ドロップ時にアロケータへ返却する。
//!
//! ## 所有状態
//! ```text
//! allocate ---> DmaBuffer (CPU/デバイス共有) ---> drop ---> free_coherent
//! ```
//! 共有中の領域をデバイスが参照しなくなったことの保証は呼び出し側
//! （スケジュールからの切り離し + フレーム境界待ち）が行う。

use alloc::sync::Arc;
use bitflags::bitflags;
use core::ptr::NonNull;
use core::sync::atomic::{Ordering, fence};

use crate::error::{UsbError, UsbResult};

/// ページサイズ
pub const PAGE_SIZE: usize = 4096;

/// DMAバッファの最小アライメント
pub const DMA_ALIGNMENT: usize = PAGE_SIZE;

bitflags! {
    /// 割り当てフラグ
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct DmaFlags: u32 {
        /// キャッシュコヒーレント
        const COHERENT = 1 << 0;
        /// ゼロ初期化
        const ZEROED = 1 << 1;
        /// 32 ビットで表現できる物理アドレス
        const BELOW_4G = 1 << 2;
    }
}

impl DmaFlags {
    /// コントローラ共有メモリの標準フラグ
    pub const fn controller() -> Self {
        Self::COHERENT.union(Self::ZEROED).union(Self::BELOW_4G)
    }
}

// ============================================================================
// DMA Region
// ============================================================================

/// アロケータが返す生の領域
#[derive(Debug)]
pub struct DmaRegion {
    /// CPU から見たアドレス
    pub cpu: NonNull<u8>,
    /// デバイスから見たアドレス
    pub device_addr: u32,
    /// バイト数
    pub size: usize,
}

// SAFETY: 領域はカーネルが固定したメモリで、どのコアからも同じアドレスで見える
unsafe impl Send for DmaRegion {}
unsafe impl Sync for DmaRegion {}

/// DMA コヒーレントメモリの供給元
pub trait DmaAllocator: Send + Sync {
    /// `size` バイト（ページ境界に切り上げ）のコヒーレント領域を割り当てる
    fn allocate_coherent(&self, size: usize, flags: DmaFlags) -> UsbResult<DmaRegion>;

    /// 領域を返却する
    ///
    /// # Safety
    /// `region` はこのアロケータが返したもので、デバイスからもう参照されないこと。
    unsafe fn free_coherent(&self, region: DmaRegion);
}

// ============================================================================
// DMA Buffer
// ============================================================================

/// コヒーレント領域の所有者
pub struct DmaBuffer {
    region: DmaRegion,
    allocator: Arc<dyn DmaAllocator>,
}

impl DmaBuffer {
    /// 新しいバッファを割り当てる（ゼロ初期化済み）
    pub fn allocate(allocator: &Arc<dyn DmaAllocator>, size: usize) -> UsbResult<Self> {
        if size == 0 {
            return Err(UsbError::InvalidParameter);
        }
        let size = size.div_ceil(PAGE_SIZE) * PAGE_SIZE;
        let region = allocator.allocate_coherent(size, DmaFlags::controller())?;
        if region.size < size || region.cpu.as_ptr() as usize % DMA_ALIGNMENT != 0 {
            // SAFETY: 直前に割り当てた領域で、まだ誰にも渡していない
            unsafe { allocator.free_coherent(region) };
            return Err(UsbError::NoMemory);
        }

        // SAFETY: region.size バイトが書き込み可能
        unsafe { core::ptr::write_bytes(region.cpu.as_ptr(), 0, region.size) };

        Ok(Self {
            region,
            allocator: allocator.clone(),
        })
    }

    /// ページ数を指定して割り当てる
    pub fn allocate_pages(allocator: &Arc<dyn DmaAllocator>, pages: usize) -> UsbResult<Self> {
        Self::allocate(allocator, pages * PAGE_SIZE)
    }

    /// デバイスアドレス
    pub fn device_addr(&self) -> u32 {
        self.region.device_addr
    }

    /// 先頭から `offset` バイト目のデバイスアドレス
    pub fn device_addr_at(&self, offset: usize) -> u32 {
        debug_assert!(offset <= self.region.size);
        self.region.device_addr + offset as u32
    }

    /// CPU 側の先頭ポインタ
    pub fn as_ptr(&self) -> *mut u8 {
        self.region.cpu.as_ptr()
    }

    /// サイズ
    pub fn len(&self) -> usize {
        self.region.size
    }

    pub fn is_empty(&self) -> bool {
        self.region.size == 0
    }

    /// デバイスが書き込んだ内容を読み出す
    pub fn read(&self, offset: usize, out: &mut [u8]) -> UsbResult<()> {
        let end = offset.checked_add(out.len()).ok_or(UsbError::Overflow)?;
        if end > self.region.size {
            return Err(UsbError::Overflow);
        }
        fence(Ordering::Acquire);
        // SAFETY: 範囲は上で検査済み
        unsafe {
            core::ptr::copy_nonoverlapping(
                self.as_ptr().add(offset),
                out.as_mut_ptr(),
                out.len(),
            );
        }
        Ok(())
    }

    /// デバイスに渡す内容を書き込む
    pub fn write(&self, offset: usize, data: &[u8]) -> UsbResult<()> {
        let end = offset.checked_add(data.len()).ok_or(UsbError::Overflow)?;
        if end > self.region.size {
            return Err(UsbError::Overflow);
        }
        // SAFETY: 範囲は上で検査済み
        unsafe {
            core::ptr::copy_nonoverlapping(data.as_ptr(), self.as_ptr().add(offset), data.len());
        }
        fence(Ordering::Release);
        Ok(())
    }
}

impl Drop for DmaBuffer {
    fn drop(&mut self) {
        let region = DmaRegion {
            cpu: self.region.cpu,
            device_addr: self.region.device_addr,
            size: self.region.size,
        };
        // SAFETY: 所有者はこのバッファだけで、呼び出し側が
        // デバイスからの参照が切れてからドロップする
        unsafe { self.allocator.free_coherent(region) };
    }
}
