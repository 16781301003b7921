// ============================================================================
// src/io/usb/mod.rs - USB Subsystem
// ============================================================================
//!
//! # USBサブシステム
//!
//! USB (Universal Serial Bus) デバイスのサポート。
//! UHCI (USB 1.x) コントローラを中心とした実装。
//!
//! ## アーキテクチャ
//! - ホストコントローラ能力トレイト ([`hcd::HostController`])
//! - UHCI ホストコントローラドライバ ([`uhci`])
//! - USB デバイスの列挙と管理 ([`device`], [`UsbManager`])
//! - クラスドライバのプローブ（{class, subclass, protocol} 照合）
//!
//! ## 型安全性
//! - Newtype パターンによるアドレス/エンドポイント管理
//! - 状態機械による列挙の状態遷移

pub mod descriptor;
pub mod device;
pub mod hcd;
pub mod uhci;

use alloc::sync::Arc;
use alloc::vec::Vec;
use lazy_static::lazy_static;
use log::{debug, info, warn};
use spin::RwLock;

pub use crate::error::{UsbError, UsbResult};
pub use device::{DeviceId, UsbDevice, UsbEndpoint, UsbInterface};
pub use hcd::{DeviceTarget, HostController, InterruptPipe, IsochronousPipe};

// ============================================================================
// USB Constants
// ============================================================================

/// USB 速度
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UsbSpeed {
    /// Low Speed (1.5 Mbps)
    Low,
    /// Full Speed (12 Mbps)
    Full,
    /// High Speed (480 Mbps)
    High,
}

impl UsbSpeed {
    /// 列挙開始時の EP0 最大パケットサイズ
    ///
    /// デバイスディスクリプタの先頭 8 バイトを読むまでの仮の値。
    pub fn default_max_packet_size(&self) -> u16 {
        match self {
            UsbSpeed::Low | UsbSpeed::Full => 8,
            UsbSpeed::High => 16,
        }
    }
}

// ============================================================================
// Type-Safe Identifiers
// ============================================================================

/// USBデバイスアドレス (型安全)
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct DeviceAddress(pub u8);

impl DeviceAddress {
    pub const UNASSIGNED: Self = Self(0);
    pub const MAX: Self = Self(127);

    pub fn is_valid(&self) -> bool {
        self.0 > 0 && self.0 <= 127
    }

    pub fn as_u8(&self) -> u8 {
        self.0
    }
}

/// エンドポイントアドレス (型安全)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EndpointAddress(pub u8);

impl EndpointAddress {
    /// コントロールエンドポイント
    pub const CONTROL: Self = Self(0);

    /// エンドポイント番号を取得 (0-15)
    pub fn number(&self) -> u8 {
        self.0 & 0x0F
    }

    /// 方向を取得 (true = IN, false = OUT)
    pub fn is_in(&self) -> bool {
        (self.0 & 0x80) != 0
    }

    /// 転送方向
    pub fn direction(&self) -> TransferDirection {
        if self.is_in() {
            TransferDirection::In
        } else {
            TransferDirection::Out
        }
    }

    /// INエンドポイントを作成
    pub fn in_endpoint(num: u8) -> Self {
        Self(0x80 | (num & 0x0F))
    }

    /// OUTエンドポイントを作成
    pub fn out_endpoint(num: u8) -> Self {
        Self(num & 0x0F)
    }
}

// ============================================================================
// USB Transfer Types
// ============================================================================

/// USB転送タイプ
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferType {
    /// コントロール転送
    Control,
    /// バルク転送
    Bulk,
    /// インタラプト転送
    Interrupt,
    /// アイソクロナス転送
    Isochronous,
}

/// USB転送方向
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferDirection {
    /// ホストからデバイス
    Out,
    /// デバイスからホスト
    In,
}

impl TransferDirection {
    /// 逆方向（ステータスステージ用）
    pub fn reverse(self) -> Self {
        match self {
            TransferDirection::Out => TransferDirection::In,
            TransferDirection::In => TransferDirection::Out,
        }
    }
}

// ============================================================================
// USB Setup Packet
// ============================================================================

/// bmRequestType のビット
pub mod request_type {
    pub const HOST_TO_DEVICE: u8 = 0x00;
    pub const DEVICE_TO_HOST: u8 = 0x80;
    pub const STANDARD: u8 = 0x00;
    pub const CLASS: u8 = 0x20;
    pub const VENDOR: u8 = 0x40;
    pub const DEVICE: u8 = 0x00;
    pub const INTERFACE: u8 = 0x01;
    pub const ENDPOINT: u8 = 0x02;
    pub const OTHER: u8 = 0x03;
}

/// 標準リクエストコード
pub mod request {
    pub const GET_STATUS: u8 = 0x00;
    pub const CLEAR_FEATURE: u8 = 0x01;
    pub const SET_FEATURE: u8 = 0x03;
    pub const SET_ADDRESS: u8 = 0x05;
    pub const GET_DESCRIPTOR: u8 = 0x06;
    pub const SET_DESCRIPTOR: u8 = 0x07;
    pub const GET_CONFIGURATION: u8 = 0x08;
    pub const SET_CONFIGURATION: u8 = 0x09;
    pub const GET_INTERFACE: u8 = 0x0A;
    pub const SET_INTERFACE: u8 = 0x0B;
}

/// USBセットアップパケット (8バイト)
#[repr(C, packed)]
#[derive(Clone, Copy, Debug)]
pub struct SetupPacket {
    /// リクエストタイプ
    pub bm_request_type: u8,
    /// リクエスト
    pub b_request: u8,
    /// 値
    pub w_value: u16,
    /// インデックス
    pub w_index: u16,
    /// 長さ
    pub w_length: u16,
}

impl SetupPacket {
    pub const SIZE: usize = 8;

    /// GET_DESCRIPTOR リクエスト
    pub fn get_descriptor(desc_type: u8, desc_index: u8, lang_id: u16, length: u16) -> Self {
        Self {
            bm_request_type: request_type::DEVICE_TO_HOST,
            b_request: request::GET_DESCRIPTOR,
            w_value: ((desc_type as u16) << 8) | (desc_index as u16),
            w_index: lang_id,
            w_length: length,
        }
    }

    /// SET_ADDRESS リクエスト
    pub fn set_address(address: DeviceAddress) -> Self {
        Self {
            bm_request_type: request_type::HOST_TO_DEVICE,
            b_request: request::SET_ADDRESS,
            w_value: address.as_u8() as u16,
            w_index: 0,
            w_length: 0,
        }
    }

    /// SET_CONFIGURATION リクエスト
    pub fn set_configuration(config: u8) -> Self {
        Self {
            bm_request_type: request_type::HOST_TO_DEVICE,
            b_request: request::SET_CONFIGURATION,
            w_value: config as u16,
            w_index: 0,
            w_length: 0,
        }
    }

    /// SET_INTERFACE リクエスト
    pub fn set_interface(interface: u8, alternate_setting: u8) -> Self {
        Self {
            bm_request_type: request_type::HOST_TO_DEVICE | request_type::INTERFACE,
            b_request: request::SET_INTERFACE,
            w_value: alternate_setting as u16,
            w_index: interface as u16,
            w_length: 0,
        }
    }

    /// GET_STATUS リクエスト
    pub fn get_status() -> Self {
        Self {
            bm_request_type: request_type::DEVICE_TO_HOST,
            b_request: request::GET_STATUS,
            w_value: 0,
            w_index: 0,
            w_length: 2,
        }
    }

    /// CLEAR_FEATURE リクエスト
    pub fn clear_feature(recipient: u8, feature: u16, index: u16) -> Self {
        Self {
            bm_request_type: request_type::HOST_TO_DEVICE | (recipient & 0x1F),
            b_request: request::CLEAR_FEATURE,
            w_value: feature,
            w_index: index,
            w_length: 0,
        }
    }

    /// SET_FEATURE リクエスト
    pub fn set_feature(recipient: u8, feature: u16, index: u16) -> Self {
        Self {
            bm_request_type: request_type::HOST_TO_DEVICE | (recipient & 0x1F),
            b_request: request::SET_FEATURE,
            w_value: feature,
            w_index: index,
            w_length: 0,
        }
    }

    /// クラス固有のリクエスト
    pub fn class_request(
        direction_in: bool,
        recipient: u8,
        request: u8,
        value: u16,
        index: u16,
        length: u16,
    ) -> Self {
        let direction = if direction_in {
            request_type::DEVICE_TO_HOST
        } else {
            request_type::HOST_TO_DEVICE
        };
        let bm_request_type = direction | request_type::CLASS | (recipient & 0x1F);

        Self {
            bm_request_type,
            b_request: request,
            w_value: value,
            w_index: index,
            w_length: length,
        }
    }

    /// データステージの方向
    pub fn direction(&self) -> TransferDirection {
        if self.bm_request_type & request_type::DEVICE_TO_HOST != 0 {
            TransferDirection::In
        } else {
            TransferDirection::Out
        }
    }

    /// ワイヤ形式（リトルエンディアン）
    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let value = self.w_value.to_le_bytes();
        let index = self.w_index.to_le_bytes();
        let length = self.w_length.to_le_bytes();
        [
            self.bm_request_type,
            self.b_request,
            value[0],
            value[1],
            index[0],
            index[1],
            length[0],
            length[1],
        ]
    }

    /// ワイヤ形式から復元
    pub fn from_bytes(bytes: &[u8; Self::SIZE]) -> Self {
        Self {
            bm_request_type: bytes[0],
            b_request: bytes[1],
            w_value: u16::from_le_bytes([bytes[2], bytes[3]]),
            w_index: u16::from_le_bytes([bytes[4], bytes[5]]),
            w_length: u16::from_le_bytes([bytes[6], bytes[7]]),
        }
    }
}

// ============================================================================
// USB Class Driver Trait
// ============================================================================

/// プローブ対象の {class, subclass, protocol}
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InterfaceId {
    pub class: u8,
    pub subclass: u8,
    pub protocol: u8,
}

impl InterfaceId {
    pub const fn new(class: u8, subclass: u8, protocol: u8) -> Self {
        Self { class, subclass, protocol }
    }

    pub fn matches(&self, interface: &UsbInterface) -> bool {
        let desc = interface.descriptor();
        desc.b_interface_class == self.class
            && desc.b_interface_sub_class == self.subclass
            && desc.b_interface_protocol == self.protocol
    }
}

/// USBクラスドライバトレイト
pub trait UsbClassDriver: Send + Sync {
    /// ドライバ名
    fn name(&self) -> &str;

    /// 対応するインターフェースの一覧
    fn id_table(&self) -> &[InterfaceId];

    /// インターフェースを初期化。Ok を返すとインターフェースを占有する
    fn probe(&self, device: &Arc<UsbDevice>, interface: &Arc<UsbInterface>) -> UsbResult<()>;

    /// デバイスを切断
    fn disconnect(&self, _device: &Arc<UsbDevice>, _interface: &Arc<UsbInterface>) {}
}

// ============================================================================
// USB Manager
// ============================================================================

/// USBマネージャー
///
/// 列挙済みデバイスと登録済みクラスドライバを保持し、
/// 未占有インターフェースへのプローブを行う。
pub struct UsbManager {
    /// 登録されたクラスドライバ（登録順）
    class_drivers: RwLock<Vec<Arc<dyn UsbClassDriver>>>,
    /// 接続されたデバイス（列挙順）
    devices: RwLock<Vec<Arc<UsbDevice>>>,
}

impl UsbManager {
    /// 新しいUSBマネージャーを作成
    pub fn new() -> Self {
        Self {
            class_drivers: RwLock::new(Vec::new()),
            devices: RwLock::new(Vec::new()),
        }
    }

    /// クラスドライバを登録し、既存デバイスの未占有インターフェースを再走査する
    pub fn register_class_driver(&self, driver: Arc<dyn UsbClassDriver>) {
        info!("usb: registering class driver {}", driver.name());
        self.class_drivers.write().push(driver.clone());

        for device in self.devices() {
            for interface in device.interfaces() {
                self.try_probe(&driver, &device, &interface);
            }
        }
    }

    /// ルートポートに接続されたデバイスを列挙して登録する
    pub fn attach_device(
        &self,
        hcd: Arc<dyn HostController>,
        speed: UsbSpeed,
    ) -> UsbResult<Arc<UsbDevice>> {
        let device = UsbDevice::enumerate(hcd, speed)?;
        info!(
            "usb: device {} on {} attached ({:04x}:{:04x})",
            device.address().as_u8(),
            device.host_controller().name(),
            device.vendor_id(),
            device.product_id()
        );
        self.devices.write().push(device.clone());
        self.probe_device(&device);
        Ok(device)
    }

    /// デバイスの未占有インターフェースごとに、登録順で最初に
    /// プローブに成功したドライバへ占有させる
    pub fn probe_device(&self, device: &Arc<UsbDevice>) {
        let drivers = self.class_drivers.read().clone();
        for interface in device.interfaces() {
            for driver in drivers.iter() {
                if self.try_probe(driver, device, &interface) {
                    break;
                }
            }
        }
    }

    /// プローブ中はインターフェースを仮占有し、失敗したら手放す
    fn try_probe(
        &self,
        driver: &Arc<dyn UsbClassDriver>,
        device: &Arc<UsbDevice>,
        interface: &Arc<UsbInterface>,
    ) -> bool {
        if !driver.id_table().iter().any(|id| id.matches(interface)) {
            return false;
        }
        if !interface.try_claim(driver.clone()) {
            return false;
        }
        if let Err(e) = driver.probe(device, interface) {
            warn!("usb: {} probe failed: {}", driver.name(), e);
            interface.release();
            return false;
        }
        // プローブ中に切断された場合、detach 側が占有を見落としていれば通知する
        if !self.is_registered(device) {
            if let Some(driver) = interface.release() {
                driver.disconnect(device, interface);
            }
            return false;
        }
        debug!(
            "usb: interface {} of device {} claimed by {}",
            interface.number(),
            device.address().as_u8(),
            driver.name()
        );
        true
    }

    fn is_registered(&self, device: &Arc<UsbDevice>) -> bool {
        self.devices.read().iter().any(|d| Arc::ptr_eq(d, device))
    }

    /// デバイスを削除し、占有中のドライバに通知する
    pub fn detach_device(&self, id: DeviceId) -> UsbResult<()> {
        let device = {
            let mut devices = self.devices.write();
            let index = devices
                .iter()
                .position(|d| d.id() == id)
                .ok_or(UsbError::NotFound)?;
            devices.remove(index)
        };
        for interface in device.interfaces() {
            if let Some(driver) = interface.release() {
                driver.disconnect(&device, &interface);
            }
        }
        info!("usb: device {} detached", id.address.as_u8());
        Ok(())
    }

    /// 全デバイスを取得（列挙順）
    pub fn devices(&self) -> Vec<Arc<UsbDevice>> {
        self.devices.read().clone()
    }

    /// 識別子でデバイスを検索
    pub fn find_device(&self, id: DeviceId) -> Option<Arc<UsbDevice>> {
        self.devices.read().iter().find(|d| d.id() == id).cloned()
    }

    /// コントローラとアドレスでデバイスを検索
    pub fn find_device_on(
        &self,
        hcd: &Arc<dyn HostController>,
        address: DeviceAddress,
    ) -> Option<Arc<UsbDevice>> {
        self.devices
            .read()
            .iter()
            .find(|d| Arc::ptr_eq(d.host_controller(), hcd) && d.address() == address)
            .cloned()
    }

    /// VID/PIDでデバイスを検索
    pub fn find_device_by_vid_pid(&self, vendor_id: u16, product_id: u16) -> Option<Arc<UsbDevice>> {
        self.devices()
            .into_iter()
            .find(|d| d.vendor_id() == vendor_id && d.product_id() == product_id)
    }
}

impl Default for UsbManager {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// Global USB Manager
// ============================================================================

lazy_static! {
    static ref USB_MANAGER: UsbManager = UsbManager::new();
}

/// グローバルUSBマネージャーを取得
pub fn usb_manager() -> &'static UsbManager {
    &USB_MANAGER
}

#[cfg(test)]
mod tests {
    use super::*;
    use super::hcd::testing::{MockController, MockDevice};
    use core::sync::atomic::{AtomicUsize, Ordering};

    struct RecordingDriver {
        name: &'static str,
        ids: Vec<InterfaceId>,
        accept: bool,
        probes: AtomicUsize,
        disconnects: AtomicUsize,
    }

    impl RecordingDriver {
        fn new(name: &'static str, id: InterfaceId, accept: bool) -> Arc<Self> {
            Arc::new(Self {
                name,
                ids: alloc::vec![id],
                accept,
                probes: AtomicUsize::new(0),
                disconnects: AtomicUsize::new(0),
            })
        }
    }

    impl UsbClassDriver for RecordingDriver {
        fn name(&self) -> &str {
            self.name
        }

        fn id_table(&self) -> &[InterfaceId] {
            &self.ids
        }

        fn probe(&self, _device: &Arc<UsbDevice>, _interface: &Arc<UsbInterface>) -> UsbResult<()> {
            self.probes.fetch_add(1, Ordering::SeqCst);
            if self.accept { Ok(()) } else { Err(UsbError::Unsupported) }
        }

        fn disconnect(&self, _device: &Arc<UsbDevice>, _interface: &Arc<UsbInterface>) {
            self.disconnects.fetch_add(1, Ordering::SeqCst);
        }
    }

    const BOOT_KEYBOARD: InterfaceId = InterfaceId::new(3, 1, 1);

    #[test]
    fn test_attach_probes_matching_driver() {
        let manager = UsbManager::new();
        let keyboard = RecordingDriver::new("kbd", BOOT_KEYBOARD, true);
        let mouse = RecordingDriver::new("mouse", InterfaceId::new(3, 1, 2), true);
        manager.register_class_driver(mouse.clone());
        manager.register_class_driver(keyboard.clone());

        let hcd = MockController::new(MockDevice::keyboard());
        let device = manager.attach_device(hcd, UsbSpeed::Low).unwrap();

        assert_eq!(device.address(), DeviceAddress(1));
        assert_eq!(keyboard.probes.load(Ordering::SeqCst), 1);
        assert_eq!(mouse.probes.load(Ordering::SeqCst), 0);
        assert!(device.interfaces()[0].is_claimed());
        assert_eq!(device.strings().product.as_deref(), Some("Keyboard"));
    }

    #[test]
    fn test_first_successful_probe_claims() {
        let manager = UsbManager::new();
        let refusing = RecordingDriver::new("refusing", BOOT_KEYBOARD, false);
        let first = RecordingDriver::new("first", BOOT_KEYBOARD, true);
        let second = RecordingDriver::new("second", BOOT_KEYBOARD, true);
        manager.register_class_driver(refusing.clone());
        manager.register_class_driver(first.clone());
        manager.register_class_driver(second.clone());

        let hcd = MockController::new(MockDevice::keyboard());
        manager.attach_device(hcd, UsbSpeed::Low).unwrap();

        assert_eq!(refusing.probes.load(Ordering::SeqCst), 1);
        assert_eq!(first.probes.load(Ordering::SeqCst), 1);
        assert_eq!(second.probes.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_late_registration_rescans_unclaimed() {
        let manager = UsbManager::new();
        let hcd = MockController::new(MockDevice::keyboard());
        let device = manager.attach_device(hcd, UsbSpeed::Low).unwrap();
        assert!(!device.interfaces()[0].is_claimed());

        let keyboard = RecordingDriver::new("kbd", BOOT_KEYBOARD, true);
        manager.register_class_driver(keyboard.clone());
        assert_eq!(keyboard.probes.load(Ordering::SeqCst), 1);
        assert!(device.interfaces()[0].is_claimed());

        // 占有済みのインターフェースは再走査しない
        let other = RecordingDriver::new("other", BOOT_KEYBOARD, true);
        manager.register_class_driver(other.clone());
        assert_eq!(other.probes.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_detach_notifies_driver() {
        let manager = UsbManager::new();
        let keyboard = RecordingDriver::new("kbd", BOOT_KEYBOARD, true);
        manager.register_class_driver(keyboard.clone());
        let hcd = MockController::new(MockDevice::keyboard());
        let device = manager.attach_device(hcd, UsbSpeed::Low).unwrap();

        assert!(manager.find_device(device.id()).is_some());
        assert!(manager.find_device_by_vid_pid(0x046D, 0xC31C).is_some());
        manager.detach_device(device.id()).unwrap();
        assert_eq!(keyboard.disconnects.load(Ordering::SeqCst), 1);
        assert!(manager.devices().is_empty());
        assert_eq!(manager.detach_device(device.id()), Err(UsbError::NotFound));
    }

    #[test]
    fn test_same_address_on_two_controllers() {
        let manager = UsbManager::new();
        let keyboard = RecordingDriver::new("kbd", BOOT_KEYBOARD, true);
        manager.register_class_driver(keyboard.clone());
        let first_hcd: Arc<dyn HostController> = MockController::new(MockDevice::keyboard());
        let second_hcd: Arc<dyn HostController> = MockController::new(MockDevice::keyboard());
        let first = manager.attach_device(first_hcd.clone(), UsbSpeed::Low).unwrap();
        let second = manager.attach_device(second_hcd.clone(), UsbSpeed::Low).unwrap();

        assert_eq!(first.address(), DeviceAddress(1));
        assert_eq!(second.address(), DeviceAddress(1));
        assert_ne!(first.id(), second.id());
        assert_eq!(manager.devices().len(), 2);
        assert_eq!(keyboard.probes.load(Ordering::SeqCst), 2);

        let found = manager.find_device_on(&second_hcd, DeviceAddress(1)).unwrap();
        assert!(Arc::ptr_eq(&found, &second));

        // 片方を外してももう片方は残る
        manager.detach_device(first.id()).unwrap();
        assert_eq!(keyboard.disconnects.load(Ordering::SeqCst), 1);
        let remaining = manager.devices();
        assert_eq!(remaining.len(), 1);
        assert!(Arc::ptr_eq(&remaining[0], &second));
        assert!(manager.find_device_on(&first_hcd, DeviceAddress(1)).is_none());
        assert!(second.interfaces()[0].is_claimed());
    }

    /// プローブ中にデバイスを切断するドライバ
    struct DetachingDriver {
        manager: Arc<UsbManager>,
        disconnects: AtomicUsize,
    }

    impl UsbClassDriver for DetachingDriver {
        fn name(&self) -> &str {
            "detaching"
        }

        fn id_table(&self) -> &[InterfaceId] {
            core::slice::from_ref(&BOOT_KEYBOARD)
        }

        fn probe(&self, device: &Arc<UsbDevice>, _interface: &Arc<UsbInterface>) -> UsbResult<()> {
            self.manager.detach_device(device.id())
        }

        fn disconnect(&self, _device: &Arc<UsbDevice>, _interface: &Arc<UsbInterface>) {
            self.disconnects.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn test_detach_during_probe_disconnects_once() {
        let manager = Arc::new(UsbManager::new());
        let hcd = MockController::new(MockDevice::keyboard());
        let device = manager.attach_device(hcd, UsbSpeed::Low).unwrap();

        let driver = Arc::new(DetachingDriver {
            manager: manager.clone(),
            disconnects: AtomicUsize::new(0),
        });
        manager.register_class_driver(driver.clone());

        assert!(manager.devices().is_empty());
        assert_eq!(driver.disconnects.load(Ordering::SeqCst), 1);
        assert!(!device.interfaces()[0].is_claimed());
    }

    #[test]
    fn test_failed_probe_leaves_interface_unclaimed() {
        let manager = UsbManager::new();
        let refusing = RecordingDriver::new("refusing", BOOT_KEYBOARD, false);
        manager.register_class_driver(refusing.clone());
        let hcd = MockController::new(MockDevice::keyboard());
        let device = manager.attach_device(hcd, UsbSpeed::Low).unwrap();
        assert!(!device.interfaces()[0].is_claimed());

        let keyboard = RecordingDriver::new("kbd", BOOT_KEYBOARD, true);
        manager.register_class_driver(keyboard.clone());
        assert!(device.interfaces()[0].is_claimed());
    }

    #[test]
    fn test_addresses_are_not_reused() {
        let manager = UsbManager::new();
        let hcd = MockController::new(MockDevice::keyboard());
        let first = manager.attach_device(hcd.clone(), UsbSpeed::Low).unwrap();
        manager.detach_device(first.id()).unwrap();
        let second = manager.attach_device(hcd, UsbSpeed::Low).unwrap();
        assert_eq!(second.address(), DeviceAddress(2));
    }

    #[test]
    fn test_setup_packet_bytes() {
        let setup = SetupPacket::get_descriptor(1, 0, 0, 18);
        assert_eq!(setup.to_bytes(), [0x80, 6, 0, 1, 0, 0, 18, 0]);
        assert_eq!(setup.direction(), TransferDirection::In);
        let back = SetupPacket::from_bytes(&setup.to_bytes());
        assert_eq!({ back.w_value }, 0x0100);
    }

    #[test]
    fn test_class_request_bytes() {
        // HID SET_IDLE / GET_REPORT
        let set_idle = SetupPacket::class_request(false, request_type::INTERFACE, 0x0A, 0, 0, 0);
        assert_eq!(set_idle.to_bytes(), [0x21, 0x0A, 0, 0, 0, 0, 0, 0]);
        assert_eq!(set_idle.direction(), TransferDirection::Out);
        let get_report =
            SetupPacket::class_request(true, request_type::INTERFACE, 0x01, 0x0100, 0, 8);
        assert_eq!(get_report.to_bytes(), [0xA1, 0x01, 0, 1, 0, 0, 8, 0]);
        assert_eq!(get_report.direction(), TransferDirection::In);
    }

    #[test]
    fn test_set_interface_request() {
        let setup = SetupPacket::set_interface(1, 2);
        assert_eq!(setup.to_bytes(), [0x01, 0x0B, 2, 0, 1, 0, 0, 0]);
        assert_eq!(setup.direction(), TransferDirection::Out);
    }

    #[test]
    fn test_device_address_range() {
        assert!(!DeviceAddress::UNASSIGNED.is_valid());
        assert!(DeviceAddress(1).is_valid());
        assert!(DeviceAddress::MAX.is_valid());
        assert!(!DeviceAddress(128).is_valid());
    }

    #[test]
    fn test_endpoint_address() {
        let ep = EndpointAddress::in_endpoint(1);
        assert_eq!(ep.0, 0x81);
        assert_eq!(ep.direction(), TransferDirection::In);
        assert_eq!(EndpointAddress::out_endpoint(2).number(), 2);
    }

    #[test]
    fn test_default_max_packet_size() {
        assert_eq!(UsbSpeed::Low.default_max_packet_size(), 8);
        assert_eq!(UsbSpeed::Full.default_max_packet_size(), 8);
        assert_eq!(UsbSpeed::High.default_max_packet_size(), 16);
    }
}
