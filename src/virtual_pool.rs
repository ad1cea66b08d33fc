// =============================================================================
// VIRTUAL STOCK POOL
// =============================================================================
// Individually addressable consumables (license keys, codes) behind a pool
// ledger. Item status is authoritative; the pool counters always equal the
// number of non-invalid items in each status.
// =============================================================================

use chrono::{DateTime, Utc};
use rand::seq::SliceRandom;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::ledger::{Ledger, LedgerChange, LedgerError, Reservable, ResourceRef};

/// Rounds of candidate selection before a virtual reservation gives up.
pub const MAX_ALLOCATION_ATTEMPTS: usize = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemStatus {
    Available,
    Reserved,
    Sold,
    Invalid,
}

impl ItemStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ItemStatus::Available => "available",
            ItemStatus::Reserved => "reserved",
            ItemStatus::Sold => "sold",
            ItemStatus::Invalid => "invalid",
        }
    }
}

impl FromStr for ItemStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "available" => Ok(ItemStatus::Available),
            "reserved" => Ok(ItemStatus::Reserved),
            "sold" => Ok(ItemStatus::Sold),
            "invalid" => Ok(ItemStatus::Invalid),
            other => Err(format!("unknown item status: {other}")),
        }
    }
}

// -----------------------------------------------------------------------------
// ALLOCATION POLICY
// -----------------------------------------------------------------------------

/// Order in which available items are handed out.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AllocationPolicy {
    #[default]
    Random,
    Newest,
    Oldest,
}

impl AllocationPolicy {
    pub fn as_str(&self) -> &'static str {
        match self {
            AllocationPolicy::Random => "random",
            AllocationPolicy::Newest => "newest",
            AllocationPolicy::Oldest => "oldest",
        }
    }

    /// ORDER BY clause for candidate selection in SQL.
    pub fn sql_order(&self) -> &'static str {
        match self {
            AllocationPolicy::Random => "random()",
            AllocationPolicy::Newest => "created_at DESC, id DESC",
            AllocationPolicy::Oldest => "created_at ASC, id ASC",
        }
    }

    /// Arrange candidates in hand-out order.
    pub fn arrange<R: Rng + ?Sized>(&self, candidates: &mut Vec<&VirtualStockItem>, rng: &mut R) {
        match self {
            AllocationPolicy::Random => candidates.shuffle(rng),
            AllocationPolicy::Oldest => candidates.sort_by_key(|i| (i.created_at, i.id)),
            AllocationPolicy::Newest => {
                candidates.sort_by_key(|i| (i.created_at, i.id));
                candidates.reverse();
            }
        }
    }
}

impl FromStr for AllocationPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "random" => Ok(AllocationPolicy::Random),
            "newest" => Ok(AllocationPolicy::Newest),
            "oldest" => Ok(AllocationPolicy::Oldest),
            other => Err(format!("unknown allocation policy: {other}")),
        }
    }
}

// =============================================================================
// POOL
// =============================================================================

#[derive(Debug, Clone, Serialize)]
pub struct VirtualPool {
    pub id: i64,
    pub name: String,
    pub ledger: Ledger,
    pub active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Reservable for VirtualPool {
    fn resource(&self) -> ResourceRef {
        ResourceRef::pool(self.id)
    }

    fn ledger(&self) -> &Ledger {
        &self.ledger
    }

    fn ledger_mut(&mut self) -> &mut Ledger {
        &mut self.ledger
    }

    fn accepts_reservations(&self, _now: DateTime<Utc>) -> bool {
        self.active
    }

    /// Refunded items were already disclosed to the buyer and become invalid,
    /// so they leave `total` as well as `sold`.
    fn return_sold(&mut self, qty: i32) -> Result<LedgerChange, LedgerError> {
        let change = self.ledger.return_sold(qty)?;
        if let Some(total) = self.ledger.total.as_mut() {
            *total -= qty;
        }
        Ok(change)
    }
}

#[cfg(test)]
impl VirtualPool {
    pub fn for_tests(id: i64, total: i32) -> Self {
        let now = Utc::now();
        Self {
            id,
            name: format!("pool-{id}"),
            ledger: Ledger::bounded(total),
            active: true,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Item counts per status, for admin display and consistency checks.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PoolStats {
    pub available: i32,
    pub reserved: i32,
    pub sold: i32,
    pub invalid: i32,
}

impl PoolStats {
    pub fn tally<'a>(items: impl IntoIterator<Item = &'a VirtualStockItem>) -> Self {
        let mut stats = Self::default();
        for item in items {
            match item.status {
                ItemStatus::Available => stats.available += 1,
                ItemStatus::Reserved => stats.reserved += 1,
                ItemStatus::Sold => stats.sold += 1,
                ItemStatus::Invalid => stats.invalid += 1,
            }
        }
        stats
    }

    pub fn matches(&self, ledger: &Ledger) -> bool {
        ledger.reserved == self.reserved
            && ledger.sold == self.sold
            && ledger.total == Some(self.available + self.reserved + self.sold)
    }
}

// =============================================================================
// ITEMS
// =============================================================================

#[derive(Clone, Serialize)]
pub struct VirtualStockItem {
    pub id: i64,
    pub pool_id: i64,
    pub content: String,
    pub remark: Option<String>,
    pub status: ItemStatus,
    pub order_id: Option<i64>,
    pub order_no: Option<String>,
    pub batch_no: String,
    pub created_at: DateTime<Utc>,
    pub reserved_at: Option<DateTime<Utc>>,
    pub sold_at: Option<DateTime<Utc>>,
    pub invalidated_at: Option<DateTime<Utc>>,
}

// Content is the secret payload; keep it out of logs.
impl fmt::Debug for VirtualStockItem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VirtualStockItem")
            .field("id", &self.id)
            .field("pool_id", &self.pool_id)
            .field("content", &"<redacted>")
            .field("status", &self.status)
            .field("order_id", &self.order_id)
            .field("batch_no", &self.batch_no)
            .finish()
    }
}

impl VirtualStockItem {
    pub fn bind(&mut self, order_id: i64, order_no: &str, now: DateTime<Utc>) {
        self.status = ItemStatus::Reserved;
        self.order_id = Some(order_id);
        self.order_no = Some(order_no.to_string());
        self.reserved_at = Some(now);
    }

    pub fn unbind(&mut self) {
        self.status = ItemStatus::Available;
        self.order_id = None;
        self.order_no = None;
        self.reserved_at = None;
    }

    pub fn deliver(&mut self, now: DateTime<Utc>) {
        self.status = ItemStatus::Sold;
        self.sold_at = Some(now);
    }

    pub fn invalidate(&mut self, now: DateTime<Utc>) {
        self.status = ItemStatus::Invalid;
        self.invalidated_at = Some(now);
    }
}

/// One parsed line of an import.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ImportedItem {
    pub content: String,
    pub remark: Option<String>,
}

/// Parse `content[,remark]` lines. Blank lines are skipped.
pub fn parse_import(text: &str) -> Vec<ImportedItem> {
    text.lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .filter_map(|line| {
            let (content, remark) = match line.split_once(',') {
                Some((content, remark)) => (content.trim(), remark.trim()),
                None => (line, ""),
            };
            if content.is_empty() {
                return None;
            }
            Some(ImportedItem {
                content: content.to_string(),
                remark: (!remark.is_empty()).then(|| remark.to_string()),
            })
        })
        .collect()
}

pub fn batch_no(now: DateTime<Utc>) -> String {
    format!("BATCH-{}", now.format("%Y%m%d%H%M%S"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn item(id: i64, age_minutes: i64) -> VirtualStockItem {
        VirtualStockItem {
            id,
            pool_id: 1,
            content: format!("KEY-{id}"),
            remark: None,
            status: ItemStatus::Available,
            order_id: None,
            order_no: None,
            batch_no: "BATCH-1".into(),
            created_at: Utc::now() - Duration::minutes(age_minutes),
            reserved_at: None,
            sold_at: None,
            invalidated_at: None,
        }
    }

    #[test]
    fn oldest_and_newest_ordering() {
        let items = vec![item(1, 5), item(2, 30), item(3, 1)];
        let mut rng = rand::thread_rng();

        let mut oldest: Vec<_> = items.iter().collect();
        AllocationPolicy::Oldest.arrange(&mut oldest, &mut rng);
        assert_eq!(oldest.iter().map(|i| i.id).collect::<Vec<_>>(), vec![2, 1, 3]);

        let mut newest: Vec<_> = items.iter().collect();
        AllocationPolicy::Newest.arrange(&mut newest, &mut rng);
        assert_eq!(newest.iter().map(|i| i.id).collect::<Vec<_>>(), vec![3, 1, 2]);
    }

    #[test]
    fn random_keeps_every_candidate() {
        let items: Vec<_> = (1..=20).map(|i| item(i, i)).collect();
        let mut picked: Vec<_> = items.iter().collect();
        AllocationPolicy::Random.arrange(&mut picked, &mut rand::thread_rng());
        let mut ids: Vec<_> = picked.iter().map(|i| i.id).collect();
        ids.sort_unstable();
        assert_eq!(ids, (1..=20).collect::<Vec<_>>());
    }

    #[test]
    fn policy_parses_case_insensitively() {
        assert_eq!("OLDEST".parse::<AllocationPolicy>(), Ok(AllocationPolicy::Oldest));
        assert!("lifo".parse::<AllocationPolicy>().is_err());
        assert_eq!(AllocationPolicy::default(), AllocationPolicy::Random);
    }

    #[test]
    fn import_lines_with_optional_remark() {
        let parsed = parse_import("AAA-111, first\n\n  BBB-222  \n,orphan remark\nCCC,\n");
        assert_eq!(
            parsed,
            vec![
                ImportedItem { content: "AAA-111".into(), remark: Some("first".into()) },
                ImportedItem { content: "BBB-222".into(), remark: None },
                ImportedItem { content: "CCC".into(), remark: None },
            ]
        );
    }

    #[test]
    fn refund_removes_items_from_total() {
        let mut pool = VirtualPool::for_tests(1, 3);
        pool.reserve(2).unwrap();
        pool.deduct(2).unwrap();
        pool.return_sold(1).unwrap();
        assert_eq!(pool.ledger, Ledger { total: Some(2), reserved: 0, sold: 1 });
    }

    #[test]
    fn debug_output_hides_content() {
        let rendered = format!("{:?}", item(9, 0));
        assert!(!rendered.contains("KEY-9"));
    }

    #[test]
    fn stats_track_ledger() {
        let mut items = vec![item(1, 3), item(2, 2), item(3, 1)];
        items[0].status = ItemStatus::Reserved;
        items[1].status = ItemStatus::Invalid;
        let stats = PoolStats::tally(&items);
        let ledger = Ledger { total: Some(2), reserved: 1, sold: 0 };
        assert!(stats.matches(&ledger));
    }
}
