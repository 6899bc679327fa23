//! 数据实体定义 - 本地缓存实体与三类待同步变更

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// 本地临时 ID 前缀（与服务端 ID 空间不相交）
pub const LOCAL_ID_PREFIX: &str = "local_";

/// 生成本地临时 ID，例如 `local_3f2b...`
pub fn new_local_id() -> String {
    format!("{}{}", LOCAL_ID_PREFIX, Uuid::new_v4().simple())
}

/// 是否为客户端生成的临时 ID
pub fn is_local_id(id: &str) -> bool {
    id.starts_with(LOCAL_ID_PREFIX)
}

/// 收支类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransactionKind {
    Income,
    Expense,
}

impl fmt::Display for TransactionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransactionKind::Income => write!(f, "income"),
            TransactionKind::Expense => write!(f, "expense"),
        }
    }
}

/// 交易记录（服务端权威实体）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransactionRecord {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    pub amount: f64,
    #[serde(rename = "type")]
    pub kind: TransactionKind,
    pub category: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// 记账日期（YYYY-MM-DD），格式化由 UI 负责
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub date: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<String>,
}

/// 新建交易请求（PendingCreate 的 payload）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewTransaction {
    pub amount: f64,
    #[serde(rename = "type")]
    pub kind: TransactionKind,
    pub category: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub date: Option<String>,
}

impl NewTransaction {
    pub fn new(amount: f64, kind: TransactionKind, category: impl Into<String>) -> Self {
        Self {
            amount,
            kind,
            category: category.into(),
            description: None,
            date: None,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn with_date(mut self, date: impl Into<String>) -> Self {
        self.date = Some(date.into());
        self
    }

    /// 以给定 ID 生成一条（乐观）实体
    pub fn to_record(&self, id: &str, user_id: Option<&str>) -> TransactionRecord {
        TransactionRecord {
            id: id.to_string(),
            user_id: user_id.map(str::to_string),
            amount: self.amount,
            kind: self.kind,
            category: self.category.clone(),
            description: self.description.clone(),
            date: self.date.clone(),
            created_at: Some(crate::utils::now_rfc3339()),
            updated_at: None,
        }
    }
}

/// 部分字段更新（PendingUpdate 的 patch）
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TransactionPatch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub amount: Option<f64>,
    #[serde(default, rename = "type", skip_serializing_if = "Option::is_none")]
    pub kind: Option<TransactionKind>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub date: Option<String>,
}

impl TransactionPatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn amount(mut self, amount: f64) -> Self {
        self.amount = Some(amount);
        self
    }

    pub fn kind(mut self, kind: TransactionKind) -> Self {
        self.kind = Some(kind);
        self
    }

    pub fn category(mut self, category: impl Into<String>) -> Self {
        self.category = Some(category.into());
        self
    }

    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn date(mut self, date: impl Into<String>) -> Self {
        self.date = Some(date.into());
        self
    }

    pub fn is_empty(&self) -> bool {
        self.amount.is_none()
            && self.kind.is_none()
            && self.category.is_none()
            && self.description.is_none()
            && self.date.is_none()
    }

    /// 把补丁应用到实体上，返回新实体
    pub fn apply_to(&self, record: &TransactionRecord) -> TransactionRecord {
        let mut next = record.clone();
        if let Some(amount) = self.amount {
            next.amount = amount;
        }
        if let Some(kind) = self.kind {
            next.kind = kind;
        }
        if let Some(category) = &self.category {
            next.category = category.clone();
        }
        if let Some(description) = &self.description {
            next.description = Some(description.clone());
        }
        if let Some(date) = &self.date {
            next.date = Some(date.clone());
        }
        next.updated_at = Some(crate::utils::now_rfc3339());
        next
    }
}

/// 待同步日志类别
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PendingKind {
    Create,
    Update,
    Delete,
}

impl PendingKind {
    /// 回放顺序：create → update → delete
    pub const REPLAY_ORDER: [PendingKind; 3] =
        [PendingKind::Create, PendingKind::Update, PendingKind::Delete];

    pub fn as_str(&self) -> &'static str {
        match self {
            PendingKind::Create => "create",
            PendingKind::Update => "update",
            PendingKind::Delete => "delete",
        }
    }

    pub fn table_name(&self) -> &'static str {
        match self {
            PendingKind::Create => "pending_creates",
            PendingKind::Update => "pending_updates",
            PendingKind::Delete => "pending_deletes",
        }
    }

    /// 主键列名（create 日志以 local_id 为键）
    pub(crate) fn id_column(&self) -> &'static str {
        match self {
            PendingKind::Create => "local_id",
            PendingKind::Update | PendingKind::Delete => "id",
        }
    }
}

impl fmt::Display for PendingKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingCreate {
    pub local_id: String,
    pub payload: NewTransaction,
    pub created_at: i64,
    pub synced: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingUpdate {
    pub id: String,
    pub target_entity_id: String,
    pub patch: TransactionPatch,
    pub created_at: i64,
    pub synced: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingDelete {
    pub id: String,
    pub target_entity_id: String,
    pub created_at: i64,
    pub synced: bool,
}

/// 尚未被后端确认的本地变更
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum PendingMutation {
    Create(PendingCreate),
    Update(PendingUpdate),
    Delete(PendingDelete),
}

impl PendingMutation {
    pub fn kind(&self) -> PendingKind {
        match self {
            PendingMutation::Create(_) => PendingKind::Create,
            PendingMutation::Update(_) => PendingKind::Update,
            PendingMutation::Delete(_) => PendingKind::Delete,
        }
    }

    /// 日志内 ID（mark_synced 用）
    pub fn id(&self) -> &str {
        match self {
            PendingMutation::Create(c) => &c.local_id,
            PendingMutation::Update(u) => &u.id,
            PendingMutation::Delete(d) => &d.id,
        }
    }

    /// 变更指向的实体 ID；create 指向自己的临时 ID
    pub fn target_id(&self) -> &str {
        match self {
            PendingMutation::Create(c) => &c.local_id,
            PendingMutation::Update(u) => &u.target_entity_id,
            PendingMutation::Delete(d) => &d.target_entity_id,
        }
    }

    pub fn created_at(&self) -> i64 {
        match self {
            PendingMutation::Create(c) => c.created_at,
            PendingMutation::Update(u) => u.created_at,
            PendingMutation::Delete(d) => d.created_at,
        }
    }

    pub fn is_synced(&self) -> bool {
        match self {
            PendingMutation::Create(c) => c.synced,
            PendingMutation::Update(u) => u.synced,
            PendingMutation::Delete(d) => d.synced,
        }
    }
}

/// 三类日志中未同步条目数量
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingCounts {
    pub create: usize,
    pub update: usize,
    pub delete: usize,
}

impl PendingCounts {
    pub fn total(&self) -> usize {
        self.create + self.update + self.delete
    }

    pub fn is_empty(&self) -> bool {
        self.total() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_record() -> TransactionRecord {
        NewTransaction::new(100.0, TransactionKind::Expense, "food").to_record("tx-1", Some("u1"))
    }

    #[test]
    fn test_local_id_format() {
        let id = new_local_id();
        assert!(is_local_id(&id));
        assert!(!is_local_id("7d1c0b2e-server"));
        assert_ne!(id, new_local_id());
    }

    #[test]
    fn test_patch_apply_only_touches_set_fields() {
        let record = sample_record();
        let patched = TransactionPatch::new().amount(42.5).apply_to(&record);
        assert_eq!(patched.amount, 42.5);
        assert_eq!(patched.category, "food");
        assert_eq!(patched.kind, TransactionKind::Expense);
        assert!(patched.updated_at.is_some());
    }

    #[test]
    fn test_wire_format_uses_type_field() {
        let payload = NewTransaction::new(100.0, TransactionKind::Expense, "food");
        let value = serde_json::to_value(&payload).unwrap();
        assert_eq!(value["type"], "expense");
        assert_eq!(value["amount"], 100.0);
        assert!(value.get("description").is_none());

        let patch: TransactionPatch = serde_json::from_str(r#"{"type":"income"}"#).unwrap();
        assert_eq!(patch.kind, Some(TransactionKind::Income));
        assert!(!patch.is_empty());
    }
}
