// ============================================================================
// src/io/usb/descriptor.rs - USB Descriptors
// ============================================================================
//!
//! # USB ディスクリプタ
//!
//! USBデバイスの構成を記述するディスクリプタの定義。
//!
//! ## 型安全性
//! - SafePackedRead による安全なパック構造体アクセス
//! - 宣言長・タイプと実際の形が食い違う場合は `ProtocolError`

use alloc::string::String;
use alloc::vec::Vec;

use crate::error::{UsbError, UsbResult};

// ============================================================================
// Descriptor Types
// ============================================================================

/// ディスクリプタタイプ
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DescriptorType {
    Device = 1,
    Configuration = 2,
    String = 3,
    Interface = 4,
    Endpoint = 5,
    DeviceQualifier = 6,
    OtherSpeedConfiguration = 7,
    InterfacePower = 8,
    InterfaceAssociation = 11,
    // クラス固有
    Hid = 0x21,
    HidReport = 0x22,
    Hub = 0x29,
}

// ============================================================================
// Safe Packed Read Trait
// ============================================================================

/// パック構造体の安全な読み取りトレイト
pub trait SafePackedRead: Sized {
    /// バイト配列から構造体を作成
    fn from_bytes(data: &[u8]) -> Option<Self>;
}

/// フィールドの安全な読み取りマクロ
macro_rules! read_field {
    ($ptr:expr, $field:ident) => {{
        let field_ptr = unsafe { core::ptr::addr_of!((*$ptr).$field) };
        unsafe { core::ptr::read_unaligned(field_ptr) }
    }};
}

// ============================================================================
// Device Descriptor
// ============================================================================

/// デバイスディスクリプタ (18バイト)
#[repr(C, packed)]
#[derive(Clone, Copy, Debug)]
pub struct DeviceDescriptor {
    /// 長さ (18)
    pub b_length: u8,
    /// タイプ (1)
    pub b_descriptor_type: u8,
    /// USB仕様バージョン (BCD)
    pub bcd_usb: u16,
    /// デバイスクラス
    pub b_device_class: u8,
    /// デバイスサブクラス
    pub b_device_sub_class: u8,
    /// デバイスプロトコル
    pub b_device_protocol: u8,
    /// 最大パケットサイズ (EP0)
    pub b_max_packet_size0: u8,
    /// ベンダーID
    pub id_vendor: u16,
    /// プロダクトID
    pub id_product: u16,
    /// デバイスバージョン (BCD)
    pub bcd_device: u16,
    /// 製造者文字列インデックス
    pub i_manufacturer: u8,
    /// 製品文字列インデックス
    pub i_product: u8,
    /// シリアル番号文字列インデックス
    pub i_serial_number: u8,
    /// コンフィグレーション数
    pub b_num_configurations: u8,
}

impl DeviceDescriptor {
    pub const SIZE: usize = 18;
    /// 最大パケットサイズを知るために最初に読むヘッダ長
    pub const HEADER_SIZE: usize = 8;
}

impl SafePackedRead for DeviceDescriptor {
    fn from_bytes(data: &[u8]) -> Option<Self> {
        if data.len() < Self::SIZE {
            return None;
        }

        let ptr = data.as_ptr() as *const Self;
        Some(Self {
            b_length: read_field!(ptr, b_length),
            b_descriptor_type: read_field!(ptr, b_descriptor_type),
            bcd_usb: u16::from_le(read_field!(ptr, bcd_usb)),
            b_device_class: read_field!(ptr, b_device_class),
            b_device_sub_class: read_field!(ptr, b_device_sub_class),
            b_device_protocol: read_field!(ptr, b_device_protocol),
            b_max_packet_size0: read_field!(ptr, b_max_packet_size0),
            id_vendor: u16::from_le(read_field!(ptr, id_vendor)),
            id_product: u16::from_le(read_field!(ptr, id_product)),
            bcd_device: u16::from_le(read_field!(ptr, bcd_device)),
            i_manufacturer: read_field!(ptr, i_manufacturer),
            i_product: read_field!(ptr, i_product),
            i_serial_number: read_field!(ptr, i_serial_number),
            b_num_configurations: read_field!(ptr, b_num_configurations),
        })
    }
}

impl DeviceDescriptor {
    /// 完全なディスクリプタを検証付きで読み取る
    pub fn parse(data: &[u8]) -> UsbResult<Self> {
        let desc = Self::from_bytes(data).ok_or(UsbError::ProtocolError)?;
        if (desc.b_length as usize) < Self::SIZE
            || desc.b_descriptor_type != DescriptorType::Device as u8
        {
            return Err(UsbError::ProtocolError);
        }
        Ok(desc)
    }

    /// USB バージョンを文字列で取得
    pub fn usb_version_string(&self) -> String {
        let bcd = self.bcd_usb;
        let major = (bcd >> 8) & 0xFF;
        let minor = (bcd >> 4) & 0x0F;
        let patch = bcd & 0x0F;
        alloc::format!("{}.{}.{}", major, minor, patch)
    }
}

// ============================================================================
// Configuration Descriptor
// ============================================================================

/// コンフィグレーションディスクリプタ (9バイト)
#[repr(C, packed)]
#[derive(Clone, Copy, Debug)]
pub struct ConfigurationDescriptor {
    /// 長さ (9)
    pub b_length: u8,
    /// タイプ (2)
    pub b_descriptor_type: u8,
    /// 合計長さ
    pub w_total_length: u16,
    /// インターフェース数
    pub b_num_interfaces: u8,
    /// コンフィグレーション値
    pub b_configuration_value: u8,
    /// コンフィグレーション文字列インデックス
    pub i_configuration: u8,
    /// 属性
    pub bm_attributes: u8,
    /// 最大電力 (2mA単位)
    pub b_max_power: u8,
}

impl ConfigurationDescriptor {
    pub const SIZE: usize = 9;
}

impl SafePackedRead for ConfigurationDescriptor {
    fn from_bytes(data: &[u8]) -> Option<Self> {
        if data.len() < Self::SIZE {
            return None;
        }

        let ptr = data.as_ptr() as *const Self;
        Some(Self {
            b_length: read_field!(ptr, b_length),
            b_descriptor_type: read_field!(ptr, b_descriptor_type),
            w_total_length: u16::from_le(read_field!(ptr, w_total_length)),
            b_num_interfaces: read_field!(ptr, b_num_interfaces),
            b_configuration_value: read_field!(ptr, b_configuration_value),
            i_configuration: read_field!(ptr, i_configuration),
            bm_attributes: read_field!(ptr, bm_attributes),
            b_max_power: read_field!(ptr, b_max_power),
        })
    }
}

impl ConfigurationDescriptor {
    /// ヘッダを検証付きで読み取る
    pub fn parse(data: &[u8]) -> UsbResult<Self> {
        let desc = Self::from_bytes(data).ok_or(UsbError::ProtocolError)?;
        if (desc.b_length as usize) < Self::SIZE
            || desc.b_descriptor_type != DescriptorType::Configuration as u8
            || (desc.w_total_length as usize) < desc.b_length as usize
        {
            return Err(UsbError::ProtocolError);
        }
        Ok(desc)
    }

    /// 合計長さ
    pub fn total_length(&self) -> usize {
        self.w_total_length as usize
    }

    /// セルフパワード?
    pub fn is_self_powered(&self) -> bool {
        (self.bm_attributes & 0x40) != 0
    }

    /// 最大電力 (mA)
    pub fn max_power_ma(&self) -> u16 {
        (self.b_max_power as u16) * 2
    }
}

// ============================================================================
// Interface Descriptor
// ============================================================================

/// インターフェースディスクリプタ (9バイト)
#[repr(C, packed)]
#[derive(Clone, Copy, Debug)]
pub struct InterfaceDescriptor {
    /// 長さ (9)
    pub b_length: u8,
    /// タイプ (4)
    pub b_descriptor_type: u8,
    /// インターフェース番号
    pub b_interface_number: u8,
    /// 代替設定
    pub b_alternate_setting: u8,
    /// エンドポイント数
    pub b_num_endpoints: u8,
    /// インターフェースクラス
    pub b_interface_class: u8,
    /// インターフェースサブクラス
    pub b_interface_sub_class: u8,
    /// インターフェースプロトコル
    pub b_interface_protocol: u8,
    /// インターフェース文字列インデックス
    pub i_interface: u8,
}

impl InterfaceDescriptor {
    pub const SIZE: usize = 9;
}

impl SafePackedRead for InterfaceDescriptor {
    fn from_bytes(data: &[u8]) -> Option<Self> {
        if data.len() < Self::SIZE {
            return None;
        }

        let ptr = data.as_ptr() as *const Self;
        Some(Self {
            b_length: read_field!(ptr, b_length),
            b_descriptor_type: read_field!(ptr, b_descriptor_type),
            b_interface_number: read_field!(ptr, b_interface_number),
            b_alternate_setting: read_field!(ptr, b_alternate_setting),
            b_num_endpoints: read_field!(ptr, b_num_endpoints),
            b_interface_class: read_field!(ptr, b_interface_class),
            b_interface_sub_class: read_field!(ptr, b_interface_sub_class),
            b_interface_protocol: read_field!(ptr, b_interface_protocol),
            i_interface: read_field!(ptr, i_interface),
        })
    }
}

/// USBクラスコード
pub mod class_code {
    pub const AUDIO: u8 = 0x01;
    pub const CDC: u8 = 0x02;
    pub const HID: u8 = 0x03;
    pub const PRINTER: u8 = 0x07;
    pub const MASS_STORAGE: u8 = 0x08;
    pub const HUB: u8 = 0x09;
    pub const VIDEO: u8 = 0x0E;
    pub const VENDOR_SPECIFIC: u8 = 0xFF;
}

// ============================================================================
// Endpoint Descriptor
// ============================================================================

/// エンドポイントディスクリプタ (7バイト)
#[repr(C, packed)]
#[derive(Clone, Copy, Debug)]
pub struct EndpointDescriptor {
    /// 長さ (7)
    pub b_length: u8,
    /// タイプ (5)
    pub b_descriptor_type: u8,
    /// エンドポイントアドレス
    pub b_endpoint_address: u8,
    /// 属性
    pub bm_attributes: u8,
    /// 最大パケットサイズ
    pub w_max_packet_size: u16,
    /// ポーリング間隔
    pub b_interval: u8,
}

impl EndpointDescriptor {
    pub const SIZE: usize = 7;
}

impl SafePackedRead for EndpointDescriptor {
    fn from_bytes(data: &[u8]) -> Option<Self> {
        if data.len() < Self::SIZE {
            return None;
        }

        let ptr = data.as_ptr() as *const Self;
        Some(Self {
            b_length: read_field!(ptr, b_length),
            b_descriptor_type: read_field!(ptr, b_descriptor_type),
            b_endpoint_address: read_field!(ptr, b_endpoint_address),
            bm_attributes: read_field!(ptr, bm_attributes),
            w_max_packet_size: u16::from_le(read_field!(ptr, w_max_packet_size)),
            b_interval: read_field!(ptr, b_interval),
        })
    }
}

impl EndpointDescriptor {
    /// IN方向?
    pub fn is_in(&self) -> bool {
        (self.b_endpoint_address & 0x80) != 0
    }

    /// 転送タイプ
    pub fn transfer_type(&self) -> super::TransferType {
        match self.bm_attributes & 0x03 {
            0 => super::TransferType::Control,
            1 => super::TransferType::Isochronous,
            2 => super::TransferType::Bulk,
            _ => super::TransferType::Interrupt,
        }
    }

    /// 最大パケットサイズ（追加トランザクション数を除く）
    pub fn max_packet_size(&self) -> u16 {
        let size = self.w_max_packet_size;
        size & 0x07FF
    }

    /// エンドポイントアドレスを取得
    pub fn address(&self) -> super::EndpointAddress {
        super::EndpointAddress(self.b_endpoint_address)
    }
}

// ============================================================================
// String Descriptor
// ============================================================================

/// 文字列ディスクリプタをパース
pub fn parse_string_descriptor(data: &[u8]) -> UsbResult<String> {
    let units = string_descriptor_units(data)?;
    // 不正なサロゲートは置換文字にする
    Ok(char::decode_utf16(units)
        .map(|c| c.unwrap_or(char::REPLACEMENT_CHARACTER))
        .collect())
}

/// 文字列ディスクリプタ 0（言語IDリスト）をパース
pub fn parse_languages(data: &[u8]) -> UsbResult<Vec<u16>> {
    if data.first().is_some_and(|&len| len < 4 || len & 1 != 0) {
        return Err(UsbError::ProtocolError);
    }
    Ok(string_descriptor_units(data)?.collect())
}

fn string_descriptor_units(data: &[u8]) -> UsbResult<impl Iterator<Item = u16> + '_> {
    if data.len() < 2 {
        return Err(UsbError::ProtocolError);
    }

    let length = data[0] as usize;
    if length < 2 || length > data.len() || data[1] != DescriptorType::String as u8 {
        return Err(UsbError::ProtocolError);
    }

    // UTF-16LE
    Ok(data[2..length]
        .chunks_exact(2)
        .map(|pair| u16::from_le_bytes([pair[0], pair[1]])))
}

// ============================================================================
// Descriptor Parser
// ============================================================================

/// インターフェースに付随するクラス固有ディスクリプタ
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClassDescriptor {
    /// タイプ
    pub descriptor_type: u8,
    /// 長さ・タイプを除いた本体
    pub data: Vec<u8>,
}

/// パースされたインターフェース
#[derive(Debug, Clone)]
pub struct ParsedInterface {
    pub interface: InterfaceDescriptor,
    pub endpoints: Vec<EndpointDescriptor>,
    pub extra: Vec<ClassDescriptor>,
}

/// コンフィグレーションディスクリプタ全体をパース
///
/// ヘッダの直後はインターフェースディスクリプタで始まり、
/// `wTotalLength` ちょうどで終わらなければならない。
pub fn parse_configuration(data: &[u8]) -> UsbResult<Vec<ParsedInterface>> {
    let config = ConfigurationDescriptor::parse(data)?;
    let total_length = config.total_length();
    if data.len() < total_length {
        return Err(UsbError::ProtocolError);
    }

    let data = &data[..total_length];
    let mut interfaces = Vec::new();
    let mut offset = config.b_length as usize;

    while offset < total_length {
        let (interface, next) = parse_interface(data, offset)?;
        interfaces.push(interface);
        offset = next;
    }

    if offset != total_length {
        return Err(UsbError::ProtocolError);
    }
    Ok(interfaces)
}

/// `offset` から始まるインターフェース1つと、それに続く
/// エンドポイント・クラス固有ディスクリプタを読む
fn parse_interface(data: &[u8], offset: usize) -> UsbResult<(ParsedInterface, usize)> {
    let interface = InterfaceDescriptor::from_bytes(&data[offset..])
        .ok_or(UsbError::ProtocolError)?;
    if interface.b_length as usize != InterfaceDescriptor::SIZE
        || interface.b_descriptor_type != DescriptorType::Interface as u8
    {
        log::debug!("usb: malformed interface descriptor at {}", offset);
        return Err(UsbError::ProtocolError);
    }

    let mut parsed = ParsedInterface {
        interface,
        endpoints: Vec::new(),
        extra: Vec::new(),
    };
    let mut offset = offset + InterfaceDescriptor::SIZE;

    while data.len() - offset >= 2 {
        let length = data[offset] as usize;
        let desc_type = data[offset + 1];
        if desc_type == DescriptorType::Interface as u8 {
            break;
        }
        if length < 2 || data.len() - offset < length {
            return Err(UsbError::ProtocolError);
        }

        let entry = &data[offset..offset + length];
        if desc_type == DescriptorType::Endpoint as u8 {
            let endpoint = EndpointDescriptor::from_bytes(entry).ok_or(UsbError::ProtocolError)?;
            parsed.endpoints.push(endpoint);
        } else {
            parsed.extra.push(ClassDescriptor {
                descriptor_type: desc_type,
                data: entry[2..].to_vec(),
            });
        }
        offset += length;
    }

    Ok((parsed, offset))
}
