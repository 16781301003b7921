//! 統一エラーハンドリングモジュール
//!
//! USB スタック全体で使用されるエラー型を定義します。
//! ハードウェアの状態ビットからの変換は完了ポーラーだけが行い、
//! それ以外の層はこの型をそのまま伝播します。

use core::fmt;

/// USB スタックの統一エラー型
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UsbError {
    /// ディスクリプタプール・DMA メモリの枯渇
    NoMemory,
    /// ディスクリプタの長さ・タイプが実際の形と一致しない
    ProtocolError,
    /// データがステージングバッファ（1ページ）に収まらない
    Overflow,
    /// CRC/タイムアウト、ビットスタッフ、バブル、データバッファエラー
    TransactionError,
    /// エンドポイントが STALL を返した
    Stalled,
    /// 待機がキャンセルされた
    Interrupted,
    /// デバイスアドレス (1..=127) を使い切った
    AddressExhausted,
    /// ハードウェアのハンドシェイクが規定回数内に完了しない
    Timeout,
    /// 無効なパラメータ
    InvalidParameter,
    /// 対象が見つからない
    NotFound,
    /// 未対応の操作
    Unsupported,
}

/// USB 操作の結果型
pub type UsbResult<T> = Result<T, UsbError>;

impl UsbError {
    /// 再試行で回復しうるエラーか
    pub fn is_transient(&self) -> bool {
        matches!(self, UsbError::TransactionError | UsbError::Timeout)
    }
}

impl fmt::Display for UsbError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UsbError::NoMemory => write!(f, "out of descriptor memory"),
            UsbError::ProtocolError => write!(f, "malformed descriptor"),
            UsbError::Overflow => write!(f, "transfer exceeds staging buffer"),
            UsbError::TransactionError => write!(f, "transaction error"),
            UsbError::Stalled => write!(f, "endpoint stalled"),
            UsbError::Interrupted => write!(f, "wait interrupted"),
            UsbError::AddressExhausted => write!(f, "device addresses exhausted"),
            UsbError::Timeout => write!(f, "hardware handshake timed out"),
            UsbError::InvalidParameter => write!(f, "invalid parameter"),
            UsbError::NotFound => write!(f, "not found"),
            UsbError::Unsupported => write!(f, "unsupported operation"),
        }
    }
}
