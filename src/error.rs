//! 統一エラーハンドリングモジュール
//!
//! I/Oスケジューラ全体で使用されるステータス型を定義します。
//! リクエスト/オペレーションの完了ステータスはすべて `IoStatus` で表現され、
//! 単一の完了経路（`IoRequest::notify_finished`）で呼び出し元に届きます。

use core::fmt;

/// I/O処理の完了ステータス
///
/// `Ok(())` が成功、`Err` が終端エラー。処理中は `Option::None` で表す。
pub type IoStatus = Result<(), IoError>;

/// I/O関連エラー
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IoError {
    /// メモリ/スロット不足（リトライ可能）
    NoMemory,
    /// 一時的にリソースが使用中（リトライ可能）
    Busy,
    /// 無効な引数
    BadValue,
    /// 無効なアドレス（メモリロック失敗など）
    BadAddress,
    /// 待機が中断された
    Interrupted,
    /// キャンセルされた
    Cancelled,
    /// デバイスエラー
    DeviceError,
    /// 読み取りエラー
    ReadError,
    /// 書き込みエラー
    WriteError,
    /// 初期化されていない（コールバック未設定など）
    NotInitialized,
    /// サポートされていない操作
    NotSupported,
}

impl IoError {
    /// アトミック変数に格納するための数値コード
    ///
    /// 0 は使用しない（呼び出し側で「未完了」などの状態値に使う）。
    pub const fn code(self) -> u32 {
        match self {
            IoError::NoMemory => 1,
            IoError::Busy => 2,
            IoError::BadValue => 3,
            IoError::BadAddress => 4,
            IoError::Interrupted => 5,
            IoError::Cancelled => 6,
            IoError::DeviceError => 7,
            IoError::ReadError => 8,
            IoError::WriteError => 9,
            IoError::NotInitialized => 10,
            IoError::NotSupported => 11,
        }
    }

    /// 数値コードから復元
    pub const fn from_code(code: u32) -> Option<Self> {
        Some(match code {
            1 => IoError::NoMemory,
            2 => IoError::Busy,
            3 => IoError::BadValue,
            4 => IoError::BadAddress,
            5 => IoError::Interrupted,
            6 => IoError::Cancelled,
            7 => IoError::DeviceError,
            8 => IoError::ReadError,
            9 => IoError::WriteError,
            10 => IoError::NotInitialized,
            11 => IoError::NotSupported,
            _ => return None,
        })
    }

    /// 後で再試行すれば成功しうるエラーか
    pub const fn is_transient(self) -> bool {
        matches!(self, IoError::NoMemory | IoError::Busy)
    }
}

// ===== Display implementations =====

impl fmt::Display for IoError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IoError::NoMemory => write!(f, "out of memory"),
            IoError::Busy => write!(f, "resource busy"),
            IoError::BadValue => write!(f, "bad value"),
            IoError::BadAddress => write!(f, "bad address"),
            IoError::Interrupted => write!(f, "interrupted"),
            IoError::Cancelled => write!(f, "cancelled"),
            IoError::DeviceError => write!(f, "device error"),
            IoError::ReadError => write!(f, "read error"),
            IoError::WriteError => write!(f, "write error"),
            IoError::NotInitialized => write!(f, "not initialized"),
            IoError::NotSupported => write!(f, "not supported"),
        }
    }
}

impl core::error::Error for IoError {}

// ===== ステータスのアトミック表現 =====

/// プールに戻っている（未使用）
pub(crate) const STATUS_IDLE: u32 = 0;
/// 処理中
pub(crate) const STATUS_IN_PROGRESS: u32 = 1;
/// 成功
pub(crate) const STATUS_OK: u32 = 2;
/// エラーコードのオフセット
const STATUS_ERROR_BASE: u32 = 2;

/// 終端ステータスを数値化
pub(crate) const fn encode_status(status: IoStatus) -> u32 {
    match status {
        Ok(()) => STATUS_OK,
        Err(e) => STATUS_ERROR_BASE + e.code(),
    }
}

/// 数値から終端ステータスを復元（未完了なら None）
pub(crate) const fn decode_status(raw: u32) -> Option<IoStatus> {
    match raw {
        STATUS_IDLE | STATUS_IN_PROGRESS => None,
        STATUS_OK => Some(Ok(())),
        _ => match IoError::from_code(raw - STATUS_ERROR_BASE) {
            Some(e) => Some(Err(e)),
            None => Some(Err(IoError::DeviceError)),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_encoding_distinguishes_pending_states() {
        assert_eq!(decode_status(STATUS_IDLE), None);
        assert_eq!(decode_status(STATUS_IN_PROGRESS), None);
        assert_eq!(decode_status(encode_status(Ok(()))), Some(Ok(())));
        assert_eq!(
            decode_status(encode_status(Err(IoError::WriteError))),
            Some(Err(IoError::WriteError))
        );
    }

    #[test]
    fn test_transient_errors() {
        assert!(IoError::Busy.is_transient());
        assert!(IoError::NoMemory.is_transient());
        assert!(!IoError::DeviceError.is_transient());
    }
}
