#![cfg_attr(not(test), no_std)]

extern crate alloc;

pub mod error;
pub mod io; // usb (コア + UHCI), dma, pci
pub mod sync; // 待ちキュー / パーカー

pub use error::{UsbError, UsbResult};
