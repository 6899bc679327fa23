//! 汇总计算
//!
//! 计算规则由外部协作方决定，引擎只依赖 [`SummaryCalculator`] 这个纯函数接口。

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::storage::entities::{TransactionKind, TransactionRecord};

/// 收支汇总
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Summary {
    pub total_income: f64,
    pub total_expenses: f64,
    pub balance: f64,
    pub transaction_count: usize,
    /// 按分类汇总的支出
    pub expenses_by_category: BTreeMap<String, f64>,
}

/// 汇总计算器：输入一组实体，输出汇总；不得有副作用
pub trait SummaryCalculator: Send + Sync + std::fmt::Debug {
    fn compute(&self, records: &[TransactionRecord]) -> Summary;
}

/// 默认的收入 / 支出 / 余额汇总
#[derive(Debug, Default, Clone, Copy)]
pub struct FinancialSummaryCalculator;

impl SummaryCalculator for FinancialSummaryCalculator {
    fn compute(&self, records: &[TransactionRecord]) -> Summary {
        let mut summary = Summary {
            transaction_count: records.len(),
            ..Summary::default()
        };
        for record in records {
            match record.kind {
                TransactionKind::Income => summary.total_income += record.amount,
                TransactionKind::Expense => {
                    summary.total_expenses += record.amount;
                    *summary
                        .expenses_by_category
                        .entry(record.category.clone())
                        .or_insert(0.0) += record.amount;
                }
            }
        }
        summary.balance = summary.total_income - summary.total_expenses;
        summary
    }
}
