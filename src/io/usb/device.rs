// ============================================================================
// src/io/usb/device.rs - USB Device Management
// ============================================================================
//!
//! # USBデバイス管理
//!
//! USBデバイスの列挙と管理機能。
//!
//! ## 列挙の流れ
//! ```text
//! Attached --GET_DESCRIPTOR(8)--> SET_ADDRESS --> Addressed
//!   --GET_DESCRIPTOR(18)--> 言語/文字列 --> コンフィグヘッダ
//!   --SELECT_CONFIGURATION(0)--> Configured
//! ```
//!
//! コントロール転送はデバイスごとの 1 ページのステージングバッファを使う。
//! 先頭 8 バイトが SETUP パケット、その直後がデータステージ。

use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicU8, AtomicU16, Ordering};
use log::{debug, info, warn};
use spin::{Mutex, RwLock};

use super::descriptor::{
    ClassDescriptor, ConfigurationDescriptor, DescriptorType, DeviceDescriptor,
    EndpointDescriptor, InterfaceDescriptor, ParsedInterface, parse_configuration,
    parse_languages, parse_string_descriptor,
};
use super::hcd::{
    DeviceTarget, EndpointInfo, HostController, InterruptCallback, InterruptPipe,
    IsochronousCallback, IsochronousPipe,
};
use super::{
    DeviceAddress, EndpointAddress, SetupPacket, TransferType, UsbClassDriver, UsbSpeed,
    request_type,
};
use crate::error::{UsbError, UsbResult};
use crate::io::dma::{DmaBuffer, PAGE_SIZE};

/// データステージに使えるステージングバッファの容量
pub const STAGING_DATA_CAPACITY: usize = PAGE_SIZE - SetupPacket::SIZE;

/// ENDPOINT_HALT フィーチャーセレクタ
const FEATURE_ENDPOINT_HALT: u16 = 0;

// ============================================================================
// Device State
// ============================================================================

/// デバイス状態
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceState {
    /// 接続検出（アドレス 0 で応答）
    Attached,
    /// アドレス割り当て済み
    Addressed,
    /// コンフィグレーション設定済み
    Configured,
}

// ============================================================================
// Endpoint / Interface
// ============================================================================

/// エンドポイント
#[derive(Debug, Clone)]
pub struct UsbEndpoint {
    descriptor: EndpointDescriptor,
}

impl UsbEndpoint {
    pub fn descriptor(&self) -> &EndpointDescriptor {
        &self.descriptor
    }

    pub fn address(&self) -> EndpointAddress {
        self.descriptor.address()
    }

    pub fn transfer_type(&self) -> TransferType {
        self.descriptor.transfer_type()
    }

    pub fn max_packet_size(&self) -> u16 {
        self.descriptor.max_packet_size()
    }

    pub fn info(&self) -> EndpointInfo {
        EndpointInfo::from(&self.descriptor)
    }
}

/// インターフェース
pub struct UsbInterface {
    descriptor: InterfaceDescriptor,
    endpoints: Vec<UsbEndpoint>,
    extra: Vec<ClassDescriptor>,
    /// 占有しているクラスドライバ
    driver: Mutex<Option<Arc<dyn UsbClassDriver>>>,
}

impl UsbInterface {
    fn from_parsed(parsed: ParsedInterface) -> Self {
        Self {
            descriptor: parsed.interface,
            endpoints: parsed
                .endpoints
                .into_iter()
                .map(|descriptor| UsbEndpoint { descriptor })
                .collect(),
            extra: parsed.extra,
            driver: Mutex::new(None),
        }
    }

    pub fn descriptor(&self) -> &InterfaceDescriptor {
        &self.descriptor
    }

    /// インターフェース番号
    pub fn number(&self) -> u8 {
        self.descriptor.b_interface_number
    }

    pub fn alternate_setting(&self) -> u8 {
        self.descriptor.b_alternate_setting
    }

    pub fn endpoints(&self) -> &[UsbEndpoint] {
        &self.endpoints
    }

    /// 指定タイプ・方向の最初のエンドポイント
    pub fn find_endpoint(&self, transfer_type: TransferType, is_in: bool) -> Option<&UsbEndpoint> {
        self.endpoints
            .iter()
            .find(|ep| ep.transfer_type() == transfer_type && ep.address().is_in() == is_in)
    }

    /// クラス固有ディスクリプタ
    pub fn extra_descriptors(&self) -> &[ClassDescriptor] {
        &self.extra
    }

    pub fn is_claimed(&self) -> bool {
        self.driver.lock().is_some()
    }

    /// 未占有なら `driver` に占有させる。既に占有されていれば false
    pub(crate) fn try_claim(&self, driver: Arc<dyn UsbClassDriver>) -> bool {
        let mut slot = self.driver.lock();
        if slot.is_some() {
            return false;
        }
        *slot = Some(driver);
        true
    }

    pub(crate) fn release(&self) -> Option<Arc<dyn UsbClassDriver>> {
        self.driver.lock().take()
    }
}

/// 製造者・製品・シリアル文字列
#[derive(Debug, Clone, Default)]
pub struct DeviceStrings {
    pub manufacturer: Option<String>,
    pub product: Option<String>,
    pub serial_number: Option<String>,
}

// ============================================================================
// USB Device
// ============================================================================

/// マネージャー内でデバイスを一意に指す識別子
///
/// アドレスはコントローラごとに独立して払い出されるため、
/// コントローラの同一性と組にする。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DeviceId {
    controller: usize,
    pub address: DeviceAddress,
}

/// USBデバイス
pub struct UsbDevice {
    hcd: Arc<dyn HostController>,
    speed: UsbSpeed,
    address: AtomicU8,
    max_packet_size: AtomicU16,
    state: Mutex<DeviceState>,
    /// コントロール転送用ステージングバッファ（転送を直列化する）
    staging: Mutex<DmaBuffer>,
    descriptor: RwLock<Option<DeviceDescriptor>>,
    languages: RwLock<Vec<u16>>,
    strings: RwLock<DeviceStrings>,
    configurations: RwLock<Vec<ConfigurationDescriptor>>,
    configuration: AtomicU8,
    interfaces: RwLock<Vec<Arc<UsbInterface>>>,
}

impl UsbDevice {
    /// アドレス 0 で応答する新規デバイス
    pub fn new(hcd: Arc<dyn HostController>, speed: UsbSpeed) -> UsbResult<Self> {
        let staging = DmaBuffer::allocate(hcd.dma_allocator(), PAGE_SIZE)?;
        Ok(Self {
            hcd,
            speed,
            address: AtomicU8::new(DeviceAddress::UNASSIGNED.as_u8()),
            max_packet_size: AtomicU16::new(speed.default_max_packet_size()),
            state: Mutex::new(DeviceState::Attached),
            staging: Mutex::new(staging),
            descriptor: RwLock::new(None),
            languages: RwLock::new(Vec::new()),
            strings: RwLock::new(DeviceStrings::default()),
            configurations: RwLock::new(Vec::new()),
            configuration: AtomicU8::new(0),
            interfaces: RwLock::new(Vec::new()),
        })
    }

    /// デバイスを列挙し、最初のコンフィグレーションを選択する
    pub fn enumerate(hcd: Arc<dyn HostController>, speed: UsbSpeed) -> UsbResult<Arc<Self>> {
        let device = Arc::new(Self::new(hcd, speed)?);

        device.read_device_descriptor_header()?;

        let address = device.hcd.get_addr()?;
        device.set_address(address)?;

        device.read_device_descriptor()?;
        device.read_strings()?;
        device.read_configurations()?;
        device.select_configuration(0)?;

        Ok(device)
    }

    // ------------------------------------------------------------------------
    // Accessors
    // ------------------------------------------------------------------------

    pub fn address(&self) -> DeviceAddress {
        DeviceAddress(self.address.load(Ordering::Acquire))
    }

    pub fn id(&self) -> DeviceId {
        DeviceId {
            controller: Arc::as_ptr(&self.hcd) as *const () as usize,
            address: self.address(),
        }
    }

    pub fn speed(&self) -> UsbSpeed {
        self.speed
    }

    pub fn state(&self) -> DeviceState {
        *self.state.lock()
    }

    pub fn max_packet_size(&self) -> u16 {
        self.max_packet_size.load(Ordering::Acquire)
    }

    pub fn host_controller(&self) -> &Arc<dyn HostController> {
        &self.hcd
    }

    /// コントローラに渡す転送先
    pub fn target(&self) -> DeviceTarget {
        DeviceTarget {
            address: self.address(),
            speed: self.speed,
            max_packet_size: self.max_packet_size(),
        }
    }

    pub fn descriptor(&self) -> Option<DeviceDescriptor> {
        *self.descriptor.read()
    }

    pub fn vendor_id(&self) -> u16 {
        self.descriptor().map(|d| d.id_vendor).unwrap_or(0)
    }

    pub fn product_id(&self) -> u16 {
        self.descriptor().map(|d| d.id_product).unwrap_or(0)
    }

    pub fn languages(&self) -> Vec<u16> {
        self.languages.read().clone()
    }

    pub fn strings(&self) -> DeviceStrings {
        self.strings.read().clone()
    }

    pub fn configurations(&self) -> Vec<ConfigurationDescriptor> {
        self.configurations.read().clone()
    }

    /// 選択中のコンフィグレーションのインデックス
    pub fn configuration_index(&self) -> u8 {
        self.configuration.load(Ordering::Acquire)
    }

    pub fn interfaces(&self) -> Vec<Arc<UsbInterface>> {
        self.interfaces.read().clone()
    }

    // ------------------------------------------------------------------------
    // Control Transfers
    // ------------------------------------------------------------------------

    /// 同期コントロール転送
    ///
    /// IN リクエストでは受信したバイトを `data` の先頭にコピーし、
    /// OUT リクエストでは `data` を送信する。転送バイト数を返す。
    pub fn control_transfer(
        &self,
        request_type: u8,
        request: u8,
        value: u16,
        index: u16,
        data: &mut [u8],
    ) -> UsbResult<usize> {
        if data.len() > STAGING_DATA_CAPACITY {
            return Err(UsbError::Overflow);
        }
        let setup = SetupPacket {
            bm_request_type: request_type,
            b_request: request,
            w_value: value,
            w_index: index,
            w_length: data.len() as u16,
        };
        let direction = setup.direction();

        let staging = self.staging.lock();
        staging.write(0, &setup.to_bytes())?;
        if direction == super::TransferDirection::Out {
            staging.write(SetupPacket::SIZE, data)?;
        }

        let transferred = self.hcd.ctrl_transfer(
            &self.target(),
            direction,
            staging.device_addr(),
            staging.device_addr_at(SetupPacket::SIZE),
            data.len(),
        )?;
        let transferred = transferred.min(data.len());

        if direction == super::TransferDirection::In {
            staging.read(SetupPacket::SIZE, &mut data[..transferred])?;
        }
        Ok(transferred)
    }

    /// GET_DESCRIPTOR (device recipient)
    pub fn get_descriptor(
        &self,
        desc_type: DescriptorType,
        index: u8,
        lang_id: u16,
        data: &mut [u8],
    ) -> UsbResult<usize> {
        let setup = SetupPacket::get_descriptor(desc_type as u8, index, lang_id, data.len() as u16);
        self.control_transfer(
            setup.bm_request_type,
            setup.b_request,
            setup.w_value,
            setup.w_index,
            data,
        )
    }

    /// 要求した長さちょうどのディスクリプタを読む
    fn get_descriptor_exact(
        &self,
        desc_type: DescriptorType,
        index: u8,
        lang_id: u16,
        data: &mut [u8],
    ) -> UsbResult<()> {
        let len = self.get_descriptor(desc_type, index, lang_id, data)?;
        if len != data.len() {
            debug!(
                "usb: short {:?} descriptor: {} / {}",
                desc_type,
                len,
                data.len()
            );
            return Err(UsbError::ProtocolError);
        }
        Ok(())
    }

    fn send_request(&self, setup: SetupPacket) -> UsbResult<()> {
        self.control_transfer(
            setup.bm_request_type,
            setup.b_request,
            setup.w_value,
            setup.w_index,
            &mut [],
        )?;
        Ok(())
    }

    // ------------------------------------------------------------------------
    // Enumeration Steps
    // ------------------------------------------------------------------------

    /// 先頭 8 バイトから EP0 の最大パケットサイズを得る
    fn read_device_descriptor_header(&self) -> UsbResult<()> {
        let mut header = [0u8; DeviceDescriptor::HEADER_SIZE];
        self.get_descriptor_exact(DescriptorType::Device, 0, 0, &mut header)?;
        if header[1] != DescriptorType::Device as u8 || header[7] == 0 {
            return Err(UsbError::ProtocolError);
        }
        self.max_packet_size.store(header[7] as u16, Ordering::Release);
        Ok(())
    }

    fn set_address(&self, address: DeviceAddress) -> UsbResult<()> {
        self.send_request(SetupPacket::set_address(address))?;
        self.address.store(address.as_u8(), Ordering::Release);
        *self.state.lock() = DeviceState::Addressed;
        debug!("usb: device addressed as {}", address.as_u8());
        Ok(())
    }

    fn read_device_descriptor(&self) -> UsbResult<()> {
        let mut data = [0u8; DeviceDescriptor::SIZE];
        self.get_descriptor_exact(DescriptorType::Device, 0, 0, &mut data)?;
        let desc = DeviceDescriptor::parse(&data)?;
        self.max_packet_size
            .store(desc.b_max_packet_size0 as u16, Ordering::Release);
        *self.descriptor.write() = Some(desc);
        Ok(())
    }

    /// 長さバイトを読んでから全体を読む
    fn read_variable_descriptor(
        &self,
        desc_type: DescriptorType,
        index: u8,
        lang_id: u16,
    ) -> UsbResult<Vec<u8>> {
        let mut length = [0u8; 1];
        self.get_descriptor_exact(desc_type, index, lang_id, &mut length)?;
        if length[0] < 2 {
            return Err(UsbError::ProtocolError);
        }
        let mut data = vec![0u8; length[0] as usize];
        self.get_descriptor_exact(desc_type, index, lang_id, &mut data)?;
        Ok(data)
    }

    /// 言語IDリストと製造者・製品・シリアル文字列
    fn read_strings(&self) -> UsbResult<()> {
        let Some(desc) = self.descriptor() else {
            return Err(UsbError::ProtocolError);
        };
        let indices = [desc.i_manufacturer, desc.i_product, desc.i_serial_number];
        if indices.iter().all(|&i| i == 0) {
            return Ok(());
        }

        let languages = parse_languages(&self.read_variable_descriptor(DescriptorType::String, 0, 0)?)?;
        let lang_id = languages.first().copied().ok_or(UsbError::ProtocolError)?;
        *self.languages.write() = languages;

        let mut strings = DeviceStrings::default();
        let slots = [
            &mut strings.manufacturer,
            &mut strings.product,
            &mut strings.serial_number,
        ];
        for (index, slot) in indices.into_iter().zip(slots) {
            if index == 0 {
                continue;
            }
            let data = self.read_variable_descriptor(DescriptorType::String, index, lang_id)?;
            *slot = Some(parse_string_descriptor(&data)?);
        }
        *self.strings.write() = strings;
        Ok(())
    }

    /// 文字列ディスクリプタを最初の言語で読む
    pub fn read_string(&self, index: u8) -> UsbResult<String> {
        if index == 0 {
            return Err(UsbError::InvalidParameter);
        }
        let lang_id = self
            .languages
            .read()
            .first()
            .copied()
            .ok_or(UsbError::NotFound)?;
        let data = self.read_variable_descriptor(DescriptorType::String, index, lang_id)?;
        parse_string_descriptor(&data)
    }

    /// 全コンフィグレーションのヘッダ
    fn read_configurations(&self) -> UsbResult<()> {
        let count = self
            .descriptor()
            .map(|d| d.b_num_configurations)
            .unwrap_or(0);
        if count == 0 {
            warn!("usb: device {} has no configurations", self.address().as_u8());
            return Err(UsbError::ProtocolError);
        }

        let mut configurations = Vec::with_capacity(count as usize);
        for index in 0..count {
            let mut header = [0u8; ConfigurationDescriptor::SIZE];
            self.get_descriptor_exact(DescriptorType::Configuration, index, 0, &mut header)?;
            configurations.push(ConfigurationDescriptor::parse(&header)?);
        }
        *self.configurations.write() = configurations;
        Ok(())
    }

    /// コンフィグレーション `index` を読み込み、SET_CONFIGURATION する
    ///
    /// 成功した場合だけインターフェース一覧を置き換える。
    pub fn select_configuration(&self, index: u8) -> UsbResult<()> {
        let config = self
            .configurations
            .read()
            .get(index as usize)
            .copied()
            .ok_or(UsbError::InvalidParameter)?;
        let total_length = config.total_length();
        if total_length > STAGING_DATA_CAPACITY {
            warn!("usb: configuration too big: {} bytes", total_length);
            return Err(UsbError::Overflow);
        }

        let mut data = vec![0u8; total_length];
        self.get_descriptor_exact(DescriptorType::Configuration, index, 0, &mut data)?;
        let interfaces: Vec<_> = parse_configuration(&data)?
            .into_iter()
            .map(|parsed| Arc::new(UsbInterface::from_parsed(parsed)))
            .collect();

        self.send_request(SetupPacket::set_configuration(config.b_configuration_value))?;

        *self.interfaces.write() = interfaces;
        self.configuration.store(index, Ordering::Release);
        *self.state.lock() = DeviceState::Configured;
        info!(
            "usb: device {} configured ({} interfaces)",
            self.address().as_u8(),
            self.interfaces.read().len()
        );
        Ok(())
    }

    // ------------------------------------------------------------------------
    // Standard Requests
    // ------------------------------------------------------------------------

    /// インターフェースの代替設定を有効にする (SET_INTERFACE)
    pub fn set_interface(&self, interface: &UsbInterface) -> UsbResult<()> {
        self.send_request(SetupPacket::set_interface(
            interface.number(),
            interface.alternate_setting(),
        ))
    }

    /// デバイスステータスを取得
    pub fn get_status(&self) -> UsbResult<u16> {
        let mut buffer = [0u8; 2];
        let setup = SetupPacket::get_status();
        let len = self.control_transfer(
            setup.bm_request_type,
            setup.b_request,
            setup.w_value,
            setup.w_index,
            &mut buffer,
        )?;
        if len != buffer.len() {
            return Err(UsbError::ProtocolError);
        }
        Ok(u16::from_le_bytes(buffer))
    }

    /// エンドポイントのSTALLをクリア
    pub fn clear_endpoint_halt(&self, endpoint: EndpointAddress) -> UsbResult<()> {
        self.send_request(SetupPacket::clear_feature(
            request_type::ENDPOINT,
            FEATURE_ENDPOINT_HALT,
            endpoint.0 as u16,
        ))
    }

    /// デバイスフィーチャーを設定
    pub fn set_feature(&self, feature: u16) -> UsbResult<()> {
        self.send_request(SetupPacket::set_feature(request_type::DEVICE, feature, 0))
    }

    // ------------------------------------------------------------------------
    // Periodic Pipes
    // ------------------------------------------------------------------------

    /// インタラプトパイプを作成して開始する
    pub fn open_interrupt_pipe(
        &self,
        endpoint: &UsbEndpoint,
        size: usize,
        callback: InterruptCallback,
    ) -> UsbResult<Arc<InterruptPipe>> {
        if endpoint.transfer_type() != TransferType::Interrupt {
            return Err(UsbError::InvalidParameter);
        }
        let pipe = Arc::new(InterruptPipe::new(
            self.hcd.dma_allocator(),
            self.target(),
            endpoint.info(),
            size,
            callback,
        )?);
        self.hcd.intr_transfer(pipe.clone())?;
        Ok(pipe)
    }

    /// アイソクロナスパイプを作成して開始する
    pub fn open_isochronous_pipe(
        &self,
        endpoint: &UsbEndpoint,
        callback: IsochronousCallback,
    ) -> UsbResult<Arc<IsochronousPipe>> {
        if endpoint.transfer_type() != TransferType::Isochronous {
            return Err(UsbError::InvalidParameter);
        }
        let pipe = Arc::new(IsochronousPipe::new(
            self.hcd.dma_allocator(),
            self.target(),
            endpoint.info(),
            callback,
        )?);
        self.hcd.isoc_transfer(pipe.clone())?;
        Ok(pipe)
    }
}
