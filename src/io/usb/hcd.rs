// ============================================================================
// src/io/usb/hcd.rs - Host Controller Capability
// ============================================================================
//!
//! # ホストコントローラ能力
//!
//! USB コアから見たホストコントローラの操作。
//! UHCI・EHCI などコントローラ種別ごとの差はこのトレイトの実装に閉じる。
//!
//! 周期転送のパイプ ([`InterruptPipe`], [`IsochronousPipe`]) は
//! コア側のオブジェクトで、DMA バッファとコールバックを所有する。

use alloc::boxed::Box;
use alloc::sync::Arc;
use alloc::vec;
use alloc::vec::Vec;
use spin::Mutex;

use super::descriptor::EndpointDescriptor;
use super::{DeviceAddress, EndpointAddress, TransferDirection, UsbSpeed};
use crate::error::{UsbError, UsbResult};
use crate::io::dma::{DmaAllocator, DmaBuffer, PAGE_SIZE};

// ============================================================================
// Device Target
// ============================================================================

/// 転送先デバイスの情報（TD のトークン生成に必要な分だけ）
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceTarget {
    /// デバイスアドレス（列挙中は 0）
    pub address: DeviceAddress,
    /// 速度
    pub speed: UsbSpeed,
    /// EP0 の最大パケットサイズ
    pub max_packet_size: u16,
}

// ============================================================================
// Host Controller Trait
// ============================================================================

/// ホストコントローラトレイト
pub trait HostController: Send + Sync {
    /// コントローラ名
    fn name(&self) -> &str;

    /// 次のデバイスアドレスを払い出す（1..=127、再利用しない）
    fn get_addr(&self) -> UsbResult<DeviceAddress>;

    /// コントロール転送 (SETUP / DATA / STATUS) を実行し、完了まで待つ
    ///
    /// `request_addr` は 8 バイトの SETUP パケット、`data_addr` は
    /// データステージのバッファのデバイスアドレス。
    /// 転送されたデータバイト数を返す（短くてもよい）。
    fn ctrl_transfer(
        &self,
        target: &DeviceTarget,
        direction: TransferDirection,
        request_addr: u32,
        data_addr: u32,
        size: usize,
    ) -> UsbResult<usize>;

    /// インタラプト転送を開始する。完了ごとに再アームされる
    fn intr_transfer(&self, pipe: Arc<InterruptPipe>) -> UsbResult<()>;

    /// アイソクロナス転送（ダブルバッファ）を開始する
    fn isoc_transfer(&self, pipe: Arc<IsochronousPipe>) -> UsbResult<()>;

    /// インタラプトパイプをスケジュールから外す
    fn cancel_intr(&self, pipe: &Arc<InterruptPipe>) -> UsbResult<()>;

    /// アイソクロナスパイプをスケジュールから外す
    fn cancel_isoc(&self, pipe: &Arc<IsochronousPipe>) -> UsbResult<()>;

    /// コントローラと共有するメモリの供給元
    fn dma_allocator(&self) -> &Arc<dyn DmaAllocator>;
}

// ============================================================================
// Address Allocation
// ============================================================================

/// デバイスアドレスの払い出し
///
/// 1 から順に払い出し、切断されたデバイスのアドレスも再利用しない。
pub struct AddressAllocator {
    next: Mutex<u8>,
}

impl AddressAllocator {
    pub const fn new() -> Self {
        Self { next: Mutex::new(1) }
    }

    pub fn allocate(&self) -> UsbResult<DeviceAddress> {
        let mut next = self.next.lock();
        let address = DeviceAddress(*next);
        if !address.is_valid() {
            return Err(UsbError::AddressExhausted);
        }
        *next += 1;
        Ok(address)
    }
}

impl Default for AddressAllocator {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// Endpoint Info
// ============================================================================

/// 周期転送エンドポイントの情報
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EndpointInfo {
    pub address: EndpointAddress,
    pub max_packet_size: u16,
    pub interval: u8,
}

impl From<&EndpointDescriptor> for EndpointInfo {
    fn from(desc: &EndpointDescriptor) -> Self {
        Self {
            address: desc.address(),
            max_packet_size: desc.max_packet_size(),
            interval: desc.b_interval,
        }
    }
}

// ============================================================================
// Interrupt Pipe
// ============================================================================

/// インタラプト完了コールバック
///
/// 成功時は受信したバイト列、失敗時はエラーを受け取る。
pub type InterruptCallback = Box<dyn FnMut(UsbResult<&[u8]>) + Send>;

/// インタラプトパイプ
pub struct InterruptPipe {
    target: DeviceTarget,
    endpoint: EndpointInfo,
    buffer: DmaBuffer,
    size: usize,
    scratch: Mutex<Vec<u8>>,
    callback: Mutex<InterruptCallback>,
}

impl InterruptPipe {
    /// `size` バイトの転送を繰り返すパイプを作成
    pub fn new(
        dma: &Arc<dyn DmaAllocator>,
        target: DeviceTarget,
        endpoint: EndpointInfo,
        size: usize,
        callback: InterruptCallback,
    ) -> UsbResult<Self> {
        if size == 0 || endpoint.max_packet_size == 0 {
            return Err(UsbError::InvalidParameter);
        }
        let buffer = DmaBuffer::allocate(dma, size)?;
        Ok(Self {
            target,
            endpoint,
            buffer,
            size,
            scratch: Mutex::new(vec![0; size]),
            callback: Mutex::new(callback),
        })
    }

    pub fn target(&self) -> &DeviceTarget {
        &self.target
    }

    pub fn endpoint(&self) -> &EndpointInfo {
        &self.endpoint
    }

    pub fn buffer(&self) -> &DmaBuffer {
        &self.buffer
    }

    /// 1 回の転送サイズ
    pub fn size(&self) -> usize {
        self.size
    }

    /// 完了を通知する（コントローラのロック外で呼ぶこと）
    pub fn complete(&self, result: UsbResult<usize>) {
        let mut scratch = self.scratch.lock();
        let mut callback = self.callback.lock();
        match result {
            Ok(len) => {
                let len = len.min(self.size);
                match self.buffer.read(0, &mut scratch[..len]) {
                    Ok(()) => callback(Ok(&scratch[..len])),
                    Err(e) => callback(Err(e)),
                }
            }
            Err(e) => callback(Err(e)),
        }
    }
}

// ============================================================================
// Isochronous Pipe
// ============================================================================

/// 半バッファ分のパケット
///
/// OUT エンドポイントではコールバックが `data` と `sizes` を埋める。
/// IN エンドポイントでは受信済みの内容と実際のサイズが入っている。
pub struct IsocFrame<'a> {
    /// 半バッファ（パケットごとに最大パケットサイズ間隔）
    pub data: &'a mut [u8],
    /// パケットごとのバイト数
    pub sizes: &'a mut [u16],
}

/// アイソクロナスコールバック
pub type IsochronousCallback = Box<dyn FnMut(&mut IsocFrame<'_>) + Send>;

struct IsocScratch {
    data: Vec<u8>,
    sizes: Vec<u16>,
}

/// アイソクロナスパイプ
///
/// 1 ページの DMA バッファを前半・後半に分けて交互に使う。
pub struct IsochronousPipe {
    target: DeviceTarget,
    endpoint: EndpointInfo,
    buffer: DmaBuffer,
    scratch: Mutex<IsocScratch>,
    callback: Mutex<IsochronousCallback>,
}

impl IsochronousPipe {
    pub fn new(
        dma: &Arc<dyn DmaAllocator>,
        target: DeviceTarget,
        endpoint: EndpointInfo,
        callback: IsochronousCallback,
    ) -> UsbResult<Self> {
        if endpoint.max_packet_size == 0 {
            return Err(UsbError::InvalidParameter);
        }
        let buffer = DmaBuffer::allocate(dma, PAGE_SIZE)?;
        Ok(Self {
            target,
            endpoint,
            buffer,
            scratch: Mutex::new(IsocScratch {
                data: Vec::new(),
                sizes: Vec::new(),
            }),
            callback: Mutex::new(callback),
        })
    }

    pub fn target(&self) -> &DeviceTarget {
        &self.target
    }

    pub fn endpoint(&self) -> &EndpointInfo {
        &self.endpoint
    }

    pub fn buffer(&self) -> &DmaBuffer {
        &self.buffer
    }

    pub fn direction(&self) -> TransferDirection {
        self.endpoint.address.direction()
    }

    /// 半バッファ `half` をコールバックで処理する（ロック外で呼ぶこと）
    ///
    /// `sizes` は入力としてパケットごとの実サイズ（IN）、
    /// 出力として次に送るサイズ（OUT）を持つ。
    pub fn refill(&self, half: usize, sizes: &mut [u16]) -> UsbResult<()> {
        let mps = self.endpoint.max_packet_size as usize;
        let half_len = sizes.len() * mps;
        let offset = half * half_len;

        let mut scratch = self.scratch.lock();
        let scratch = &mut *scratch;
        scratch.data.resize(half_len, 0);
        scratch.sizes.clear();
        scratch.sizes.extend_from_slice(sizes);

        if self.direction() == TransferDirection::In {
            self.buffer.read(offset, &mut scratch.data)?;
        }

        {
            let mut callback = self.callback.lock();
            let mut frame = IsocFrame {
                data: &mut scratch.data,
                sizes: &mut scratch.sizes,
            };
            callback(&mut frame);
        }

        for (size, requested) in sizes.iter_mut().zip(scratch.sizes.iter()) {
            *size = (*requested).min(mps as u16);
        }
        if self.direction() == TransferDirection::Out {
            self.buffer.write(offset, &scratch.data)?;
        }
        Ok(())
    }
}
