//! Strongly-typed identifiers.
//!
//! # ULID ベースの ID
//! リクエスト (`RequestId`) とキュー上のタスク (`TaskId`) を ULID で識別します。
//!
//! ## ULID の特性
//! - **時刻でソート可能**: 先頭が timestamp なので、生成順に並ぶ
//! - **分散生成可能**: 複数のキューやプロセスで調整なしに生成できる
//! - **128-bit**: UUID と同じサイズ
//!
//! ## Phantom Type
//! `Id<T>` の `T` は実行時には存在しないマーカー型 (PhantomData) です。
//! `RequestId` と `TaskId` はメモリ上は同じ表現ですが、型が異なるので混同できません。
//! シリアライズ時は ULID 文字列そのもの (`#[serde(transparent)]`)、
//! Display ではマーカーのプレフィックス付き (例: `req-01J...`) になります。

use serde::{Deserialize, Serialize};
use std::fmt;
use std::marker::PhantomData;
use ulid::Ulid;

/// IdMarker は各 ID 型のマーカー trait
///
/// Display で使うプレフィックス（"req-", "task-"）を提供します。
pub trait IdMarker: Send + Sync + 'static {
    fn prefix() -> &'static str;
}

/// ジェネリック ID 型
///
/// # 例
/// ```ignore
/// let request: RequestId = Id::generate();
/// let task: TaskId = Id::generate();
/// // request と task は異なる型なので、比較も代入もできない
/// ```
#[repr(transparent)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Id<T: IdMarker> {
    ulid: Ulid,
    #[serde(skip)]
    _marker: PhantomData<T>,
}

impl<T: IdMarker> Id<T> {
    /// 新しい ID を生成（生成時刻順にソートされる）
    pub fn generate() -> Self {
        Self::from_ulid(Ulid::new())
    }

    pub fn from_ulid(ulid: Ulid) -> Self {
        Self {
            ulid,
            _marker: PhantomData,
        }
    }

    pub fn as_ulid(&self) -> Ulid {
        self.ulid
    }
}

impl<T: IdMarker> From<Ulid> for Id<T> {
    fn from(ulid: Ulid) -> Self {
        Self::from_ulid(ulid)
    }
}

impl<T: IdMarker> fmt::Display for Id<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", T::prefix(), self.ulid)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Request {}

impl IdMarker for Request {
    fn prefix() -> &'static str {
        "req-"
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Task {}

impl IdMarker for Task {
    fn prefix() -> &'static str {
        "task-"
    }
}

/// Correlation id carried by an envelope through a whole flow run.
pub type RequestId = Id<Request>;

/// Identifier of a queued task.
pub type TaskId = Id<Task>;
