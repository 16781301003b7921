// ============================================================================
// src/io/usb/uhci/frame_list.rs - Frame List
// ============================================================================
//!
//! 1024 エントリの周期スケジュール。コントローラは 1ms ごとに
//! FRNUM が指すエントリを読み、そこからリンクをたどる。

use alloc::sync::Arc;
use core::sync::atomic::{AtomicU32, Ordering};

use crate::error::UsbResult;
use crate::io::dma::{DmaAllocator, DmaBuffer, PAGE_SIZE};

/// フレームリストのエントリ数
pub const FRAME_LIST_LEN: usize = 1024;

const _: () = assert!(FRAME_LIST_LEN * 4 == PAGE_SIZE);

pub struct FrameList {
    buffer: DmaBuffer,
}

impl FrameList {
    pub fn new(dma: &Arc<dyn DmaAllocator>) -> UsbResult<Self> {
        Ok(Self {
            buffer: DmaBuffer::allocate(dma, PAGE_SIZE)?,
        })
    }

    /// FRBASEADD に書くアドレス
    pub fn device_addr(&self) -> u32 {
        self.buffer.device_addr()
    }

    /// エントリ `frame` (1024 で剰余を取る)
    pub fn slot(&self, frame: usize) -> &AtomicU32 {
        let frame = frame % FRAME_LIST_LEN;
        // SAFETY: 1 ページ = 1024 個の u32 で、ページ境界に置かれている
        unsafe { &*(self.buffer.as_ptr() as *const AtomicU32).add(frame) }
    }

    /// 全エントリを同じリンクで埋める
    pub fn fill(&self, link: u32) {
        for frame in 0..FRAME_LIST_LEN {
            self.slot(frame).store(link, Ordering::Relaxed);
        }
        core::sync::atomic::fence(Ordering::Release);
    }
}
