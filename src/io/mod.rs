// ============================================================================
// I/O Subsystem Module
// USB ホストスタックとそのハードウェア境界
// ============================================================================
pub mod dma;
pub mod pci;
pub mod usb;

#[allow(unused_imports)]
pub use dma::{DmaAllocator, DmaBuffer, DmaFlags, DmaRegion, PAGE_SIZE};
#[allow(unused_imports)]
pub use pci::{InterruptHandler, IrqHandle, PciFunction, RegisterWindow};
