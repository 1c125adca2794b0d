use chrono::{DateTime, NaiveDate, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use crate::error::{AppError, Result};

// ============================================================================
// BILL
// ============================================================================

/// Bill lifecycle status. New bills start `Unpaid`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BillStatus {
    Unpaid,
    Paid,
    Canceled,
}

impl BillStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            BillStatus::Unpaid => "unpaid",
            BillStatus::Paid => "paid",
            BillStatus::Canceled => "canceled",
        }
    }
}

impl fmt::Display for BillStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BillStatus {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "unpaid" => Ok(BillStatus::Unpaid),
            "paid" => Ok(BillStatus::Paid),
            "canceled" => Ok(BillStatus::Canceled),
            other => Err(AppError::BadRequest(format!(
                "status must be one of unpaid, paid, canceled (got {:?})",
                other
            ))),
        }
    }
}

/// Stored bill record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Bill {
    /// Stable identity, 32 hex chars, never reused
    pub id: String,
    pub vendor: String,
    pub amount: f64,
    pub due_date: NaiveDate,
    pub status: BillStatus,
    #[serde(default)]
    pub note: Option<String>,
}

/// Bill submission before validation and id assignment
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct NewBill {
    pub vendor: String,
    pub amount: f64,
    /// ISO date (`YYYY-MM-DD`), checked by `BillStore::create`
    pub due_date: String,
    #[serde(default)]
    pub note: Option<String>,
    /// Defaults to `unpaid`
    #[serde(default)]
    pub status: Option<BillStatus>,
}

impl NewBill {
    pub fn new(vendor: &str, amount: f64, due_date: &str) -> Self {
        NewBill {
            vendor: vendor.to_string(),
            amount,
            due_date: due_date.to_string(),
            note: None,
            status: None,
        }
    }

    /// Builder pattern: add optional note
    pub fn with_note(mut self, note: &str) -> Self {
        self.note = Some(note.to_string());
        self
    }

    /// Build from raw form fields; `amount` must parse as a number
    pub fn from_fields(vendor: &str, amount: &str, due_date: &str, note: Option<&str>) -> Result<Self> {
        let amount: f64 = amount
            .trim()
            .parse()
            .map_err(|_| AppError::Validation(format!("amount is not a number: {:?}", amount)))?;

        Ok(NewBill {
            vendor: vendor.to_string(),
            amount,
            due_date: due_date.trim().to_string(),
            note: note.filter(|n| !n.is_empty()).map(String::from),
            status: None,
        })
    }

    /// Check invariants and produce a bill with a fresh id
    pub fn validate(self) -> Result<Bill> {
        if !self.amount.is_finite() || self.amount < 0.0 {
            return Err(AppError::Validation(format!(
                "amount must be a non-negative number, got {}",
                self.amount
            )));
        }

        let due_date = NaiveDate::parse_from_str(&self.due_date, "%Y-%m-%d").map_err(|_| {
            AppError::Validation(format!("due_date is not a valid date: {:?}", self.due_date))
        })?;

        Ok(Bill {
            id: new_bill_id(),
            vendor: self.vendor,
            amount: self.amount,
            due_date,
            status: self.status.unwrap_or(BillStatus::Unpaid),
            note: self.note,
        })
    }
}

fn new_bill_id() -> String {
    uuid::Uuid::new_v4().simple().to_string()
}

// ============================================================================
// EVENTS (audit trail: every change to a bill is an event)
// ============================================================================

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct BillEvent {
    pub event_id: String,
    pub timestamp: DateTime<Utc>,
    pub event_type: String,
    pub bill_id: String,
    pub data: serde_json::Value,
    pub actor: String,
}

impl BillEvent {
    pub fn new(event_type: &str, bill_id: &str, data: serde_json::Value, actor: &str) -> Self {
        Self {
            event_id: uuid::Uuid::new_v4().to_string(),
            timestamp: Utc::now(),
            event_type: event_type.to_string(),
            bill_id: bill_id.to_string(),
            data,
            actor: actor.to_string(),
        }
    }
}

// ============================================================================
// STORE
// ============================================================================

/// SQLite-backed bill store.
///
/// Holds only the file path; each operation opens its own connection and
/// drops it before returning. Concurrent writers are serialized by SQLite.
#[derive(Debug, Clone)]
pub struct BillStore {
    path: PathBuf,
}

impl BillStore {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn connect(&self) -> Result<Connection> {
        let conn = Connection::open(&self.path)?;
        conn.busy_timeout(std::time::Duration::from_secs(5))?;
        Ok(conn)
    }

    /// Open the store and make sure the schema exists
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let store = Self::new(path);
        let conn = store.connect()?;
        setup_database(&conn)?;
        Ok(store)
    }

    /// Validate and persist a new bill
    pub fn create(&self, new_bill: NewBill, actor: &str) -> Result<Bill> {
        let bill = new_bill.validate()?;
        let mut conn = self.connect()?;
        let tx = conn.transaction()?;

        tx.execute(
            "INSERT INTO bills (id, vendor, amount, due_date, status, note)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                bill.id,
                bill.vendor,
                bill.amount,
                bill.due_date.format("%Y-%m-%d").to_string(),
                bill.status.as_str(),
                bill.note,
            ],
        )?;

        insert_event(
            &tx,
            &BillEvent::new(
                "bill_created",
                &bill.id,
                serde_json::json!({
                    "vendor": bill.vendor,
                    "amount": bill.amount,
                    "status": bill.status,
                }),
                actor,
            ),
        )?;

        tx.commit()?;
        tracing::info!(bill_id = %bill.id, vendor = %bill.vendor, "bill created");

        Ok(bill)
    }

    pub fn get(&self, id: &str) -> Result<Option<Bill>> {
        let conn = self.connect()?;
        let bill = conn
            .query_row(
                "SELECT id, vendor, amount, due_date, status, note FROM bills WHERE id = ?1",
                [id],
                bill_from_row,
            )
            .optional()?;

        Ok(bill)
    }

    /// Bills ordered by ascending due date, optionally filtered by status
    pub fn list(&self, status: Option<BillStatus>) -> Result<Vec<Bill>> {
        let conn = self.connect()?;

        let bills = match status {
            Some(status) => {
                let mut stmt = conn.prepare(
                    "SELECT id, vendor, amount, due_date, status, note
                     FROM bills
                     WHERE status = ?1
                     ORDER BY due_date ASC, seq ASC",
                )?;
                let rows = stmt.query_map([status.as_str()], bill_from_row)?;
                rows.collect::<std::result::Result<Vec<_>, _>>()?
            }
            None => {
                let mut stmt = conn.prepare(
                    "SELECT id, vendor, amount, due_date, status, note
                     FROM bills
                     ORDER BY due_date ASC, seq ASC",
                )?;
                let rows = stmt.query_map([], bill_from_row)?;
                rows.collect::<std::result::Result<Vec<_>, _>>()?
            }
        };

        Ok(bills)
    }

    /// Unconditional status overwrite. Returns false when the bill is unknown.
    ///
    /// Setting the status a bill already has is a no-op and records no event.
    pub fn set_status(&self, id: &str, status: BillStatus, actor: &str) -> Result<bool> {
        let mut conn = self.connect()?;
        let tx = conn.transaction()?;

        let previous: Option<String> = tx
            .query_row("SELECT status FROM bills WHERE id = ?1", [id], |row| row.get(0))
            .optional()?;

        let previous = match previous {
            Some(previous) => previous,
            None => return Ok(false),
        };

        if previous == status.as_str() {
            return Ok(true);
        }

        tx.execute(
            "UPDATE bills SET status = ?1, updated_at = CURRENT_TIMESTAMP WHERE id = ?2",
            params![status.as_str(), id],
        )?;

        insert_event(
            &tx,
            &BillEvent::new(
                "status_changed",
                id,
                serde_json::json!({ "previous_status": previous, "status": status }),
                actor,
            ),
        )?;
        tx.commit()?;

        tracing::info!(bill_id = %id, %status, "bill status set");
        Ok(true)
    }

    /// Move a bill to `paid` unless it already is.
    ///
    /// The check and the update are one statement, so two concurrent
    /// confirmations cannot both succeed. Returns true only for the call that
    /// performed the transition.
    pub fn mark_paid_once(&self, id: &str, data: serde_json::Value, actor: &str) -> Result<bool> {
        let mut conn = self.connect()?;
        let tx = conn.transaction()?;

        let changed = tx.execute(
            "UPDATE bills SET status = 'paid', updated_at = CURRENT_TIMESTAMP
             WHERE id = ?1 AND status != 'paid'",
            [id],
        )?;

        if changed == 0 {
            return Ok(false);
        }

        insert_event(&tx, &BillEvent::new("payment_confirmed", id, data, actor))?;
        tx.commit()?;

        tracing::info!(bill_id = %id, "bill marked paid");
        Ok(true)
    }

    /// Append an event outside of a status change (e.g. a reminder was sent)
    pub fn record_event(&self, event: &BillEvent) -> Result<()> {
        let conn = self.connect()?;
        insert_event(&conn, event)
    }

    /// Audit trail of one bill, newest first
    pub fn events_for(&self, bill_id: &str) -> Result<Vec<BillEvent>> {
        let conn = self.connect()?;
        get_events_for_bill(&conn, bill_id)
    }

    pub fn count(&self) -> Result<i64> {
        let conn = self.connect()?;
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM bills", [], |row| row.get(0))?;
        Ok(count)
    }
}

fn bill_from_row(row: &Row<'_>) -> rusqlite::Result<Bill> {
    let due_date_str: String = row.get(3)?;
    let status_str: String = row.get(4)?;

    let due_date = NaiveDate::parse_from_str(&due_date_str, "%Y-%m-%d").map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(3, rusqlite::types::Type::Text, Box::new(e))
    })?;
    let status = status_str.parse::<BillStatus>().map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(4, rusqlite::types::Type::Text, Box::new(e))
    })?;

    Ok(Bill {
        id: row.get(0)?,
        vendor: row.get(1)?,
        amount: row.get(2)?,
        due_date,
        status,
        note: row.get(5)?,
    })
}

pub fn setup_database(conn: &Connection) -> Result<()> {
    // Enable WAL mode for crash recovery
    conn.pragma_update(None, "journal_mode", "WAL")?;

    // ==========================================================================
    // Bills Table
    // seq keeps insertion order for bills sharing a due date
    // ==========================================================================
    conn.execute(
        "CREATE TABLE IF NOT EXISTS bills (
            seq INTEGER PRIMARY KEY AUTOINCREMENT,
            id TEXT UNIQUE NOT NULL,
            vendor TEXT NOT NULL,
            amount REAL NOT NULL CHECK (amount >= 0),
            due_date TEXT NOT NULL,
            status TEXT NOT NULL CHECK (status IN ('unpaid', 'paid', 'canceled')),
            note TEXT,
            created_at DATETIME DEFAULT CURRENT_TIMESTAMP,
            updated_at DATETIME DEFAULT CURRENT_TIMESTAMP
        )",
        [],
    )?;

    // ==========================================================================
    // Events Table (audit trail)
    // ==========================================================================
    conn.execute(
        "CREATE TABLE IF NOT EXISTS bill_events (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            event_id TEXT UNIQUE NOT NULL,
            timestamp TEXT NOT NULL,
            event_type TEXT NOT NULL,
            bill_id TEXT NOT NULL,
            data TEXT NOT NULL,
            actor TEXT NOT NULL
        )",
        [],
    )?;

    // ==========================================================================
    // Indexes
    // ==========================================================================
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_bills_status_due ON bills(status, due_date)",
        [],
    )?;

    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_bills_due ON bills(due_date)",
        [],
    )?;

    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_events_bill ON bill_events(bill_id)",
        [],
    )?;

    Ok(())
}

/// Insert event into audit trail
pub fn insert_event(conn: &Connection, event: &BillEvent) -> Result<()> {
    let data_json = serde_json::to_string(&event.data)?;

    conn.execute(
        "INSERT INTO bill_events (
            event_id, timestamp, event_type, bill_id, data, actor
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        params![
            event.event_id,
            event.timestamp.to_rfc3339(),
            event.event_type,
            event.bill_id,
            data_json,
            event.actor,
        ],
    )?;

    Ok(())
}

/// Get events for a specific bill
pub fn get_events_for_bill(conn: &Connection, bill_id: &str) -> Result<Vec<BillEvent>> {
    let mut stmt = conn.prepare(
        "SELECT event_id, timestamp, event_type, bill_id, data, actor
         FROM bill_events
         WHERE bill_id = ?1
         ORDER BY id DESC",
    )?;

    let events = stmt
        .query_map([bill_id], |row| {
            let timestamp_str: String = row.get(1)?;
            let data_json: String = row.get(4)?;

            Ok(BillEvent {
                event_id: row.get(0)?,
                timestamp: DateTime::parse_from_rfc3339(&timestamp_str)
                    .map_err(|e| {
                        rusqlite::Error::FromSqlConversionFailure(
                            1,
                            rusqlite::types::Type::Text,
                            Box::new(e),
                        )
                    })?
                    .with_timezone(&Utc),
                event_type: row.get(2)?,
                bill_id: row.get(3)?,
                data: serde_json::from_str(&data_json).map_err(|e| {
                    rusqlite::Error::FromSqlConversionFailure(
                        4,
                        rusqlite::types::Type::Text,
                        Box::new(e),
                    )
                })?,
                actor: row.get(5)?,
            })
        })?
        .collect::<std::result::Result<Vec<_>, _>>()?;

    Ok(events)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn test_store() -> (TempDir, BillStore) {
        let dir = TempDir::new().unwrap();
        let store = BillStore::open(dir.path().join("bills.sqlite3")).unwrap();
        (dir, store)
    }

    #[test]
    fn test_create_and_get() {
        let (_dir, store) = test_store();

        let bill = store
            .create(NewBill::new("Acme", 42.50, "2024-05-01"), "test")
            .unwrap();

        assert_eq!(bill.id.len(), 32);
        assert_eq!(bill.status, BillStatus::Unpaid);
        assert_eq!(bill.due_date, NaiveDate::from_ymd_opt(2024, 5, 1).unwrap());

        let loaded = store.get(&bill.id).unwrap().unwrap();
        assert_eq!(loaded, bill);
    }

    #[test]
    fn test_get_unknown_is_none() {
        let (_dir, store) = test_store();
        assert!(store.get("does-not-exist").unwrap().is_none());
    }

    #[test]
    fn test_ids_are_unique() {
        let (_dir, store) = test_store();
        let a = store.create(NewBill::new("A", 1.0, "2024-01-01"), "test").unwrap();
        let b = store.create(NewBill::new("A", 1.0, "2024-01-01"), "test").unwrap();
        assert_ne!(a.id, b.id);
        assert_eq!(store.count().unwrap(), 2);
    }

    #[test]
    fn test_create_rejects_negative_amount() {
        let (_dir, store) = test_store();
        let err = store
            .create(NewBill::new("Acme", -1.0, "2024-05-01"), "test")
            .unwrap_err();
        assert!(matches!(err, AppError::Validation(_)));
        assert_eq!(store.count().unwrap(), 0);
    }

    #[test]
    fn test_create_rejects_non_finite_amount() {
        let (_dir, store) = test_store();
        let err = store
            .create(NewBill::new("Acme", f64::NAN, "2024-05-01"), "test")
            .unwrap_err();
        assert!(matches!(err, AppError::Validation(_)));
    }

    #[test]
    fn test_create_rejects_bad_date() {
        let (_dir, store) = test_store();
        for date in ["2024-02-30", "05/01/2024", "tomorrow", ""] {
            let err = store.create(NewBill::new("Acme", 1.0, date), "test").unwrap_err();
            assert!(matches!(err, AppError::Validation(_)), "date {:?}", date);
        }
    }

    #[test]
    fn test_create_with_explicit_status() {
        let (_dir, store) = test_store();
        let mut new_bill = NewBill::new("Acme", 5.0, "2024-05-01");
        new_bill.status = Some(BillStatus::Canceled);

        let bill = store.create(new_bill, "test").unwrap();
        assert_eq!(bill.status, BillStatus::Canceled);
    }

    #[test]
    fn test_from_fields() {
        let new_bill = NewBill::from_fields("Acme", " 12.5 ", "2024-05-01", Some("")).unwrap();
        assert_eq!(new_bill.amount, 12.5);
        assert!(new_bill.note.is_none());

        let err = NewBill::from_fields("Acme", "twelve", "2024-05-01", None).unwrap_err();
        assert!(matches!(err, AppError::Validation(_)));
    }

    #[test]
    fn test_list_ordered_by_due_date() {
        let (_dir, store) = test_store();
        store.create(NewBill::new("March", 3.0, "2024-03-01"), "test").unwrap();
        store.create(NewBill::new("January", 1.0, "2024-01-15"), "test").unwrap();
        store.create(NewBill::new("December", 12.0, "2023-12-31"), "test").unwrap();

        let vendors: Vec<String> = store
            .list(None)
            .unwrap()
            .into_iter()
            .map(|b| b.vendor)
            .collect();

        assert_eq!(vendors, vec!["December", "January", "March"]);
    }

    #[test]
    fn test_list_filtered_by_status() {
        let (_dir, store) = test_store();
        let late = store.create(NewBill::new("Late", 1.0, "2024-06-01"), "test").unwrap();
        store.create(NewBill::new("Open", 2.0, "2024-04-01"), "test").unwrap();
        let early = store.create(NewBill::new("Early", 3.0, "2024-02-01"), "test").unwrap();

        store.set_status(&late.id, BillStatus::Paid, "test").unwrap();
        store.set_status(&early.id, BillStatus::Paid, "test").unwrap();

        let paid = store.list(Some(BillStatus::Paid)).unwrap();
        assert_eq!(paid.len(), 2);
        assert!(paid.iter().all(|b| b.status == BillStatus::Paid));
        assert_eq!(paid[0].id, early.id);
        assert_eq!(paid[1].id, late.id);

        let unpaid = store.list(Some(BillStatus::Unpaid)).unwrap();
        assert_eq!(unpaid.len(), 1);
        assert_eq!(unpaid[0].vendor, "Open");

        assert!(store.list(Some(BillStatus::Canceled)).unwrap().is_empty());
    }

    #[test]
    fn test_set_status_unknown_bill() {
        let (_dir, store) = test_store();
        assert!(!store.set_status("missing", BillStatus::Paid, "test").unwrap());
    }

    #[test]
    fn test_set_status_is_unconditional() {
        let (_dir, store) = test_store();
        let bill = store.create(NewBill::new("Acme", 1.0, "2024-01-01"), "test").unwrap();

        assert!(store.set_status(&bill.id, BillStatus::Paid, "test").unwrap());
        assert!(store.set_status(&bill.id, BillStatus::Unpaid, "test").unwrap());
        assert_eq!(store.get(&bill.id).unwrap().unwrap().status, BillStatus::Unpaid);
    }

    #[test]
    fn test_set_same_status_records_no_event() {
        let (_dir, store) = test_store();
        let bill = store.create(NewBill::new("Acme", 1.0, "2024-01-01"), "test").unwrap();

        assert!(store.set_status(&bill.id, BillStatus::Paid, "test").unwrap());
        assert_eq!(store.events_for(&bill.id).unwrap().len(), 2);

        assert!(store.set_status(&bill.id, BillStatus::Paid, "test").unwrap());
        let events = store.events_for(&bill.id).unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].data["previous_status"], "unpaid");
        assert_eq!(store.get(&bill.id).unwrap().unwrap().status, BillStatus::Paid);
    }

    #[test]
    fn test_mark_paid_once() {
        let (_dir, store) = test_store();
        let bill = store.create(NewBill::new("Acme", 1.0, "2024-01-01"), "test").unwrap();

        let data = serde_json::json!({ "external_ref": "ref-1" });
        assert!(store.mark_paid_once(&bill.id, data.clone(), "webhook").unwrap());
        assert!(!store.mark_paid_once(&bill.id, data, "webhook").unwrap());
        assert_eq!(store.get(&bill.id).unwrap().unwrap().status, BillStatus::Paid);

        let confirmations = store
            .events_for(&bill.id)
            .unwrap()
            .into_iter()
            .filter(|e| e.event_type == "payment_confirmed")
            .count();
        assert_eq!(confirmations, 1);
    }

    #[test]
    fn test_event_log() {
        let (_dir, store) = test_store();
        let bill = store.create(NewBill::new("Acme", 1.0, "2024-01-01"), "cli").unwrap();
        store.set_status(&bill.id, BillStatus::Canceled, "api").unwrap();
        store
            .record_event(&BillEvent::new(
                "reminder_sent",
                &bill.id,
                serde_json::json!({ "channel": "console" }),
                "api",
            ))
            .unwrap();

        let events = store.events_for(&bill.id).unwrap();
        let types: Vec<&str> = events.iter().map(|e| e.event_type.as_str()).collect();
        assert_eq!(types, vec!["reminder_sent", "status_changed", "bill_created"]);
        assert_eq!(events[2].actor, "cli");
        assert_eq!(events[1].data["status"], "canceled");
    }

    #[test]
    fn test_reopen_keeps_data() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("bills.sqlite3");

        let id = BillStore::open(&path)
            .unwrap()
            .create(NewBill::new("Acme", 1.0, "2024-01-01"), "test")
            .unwrap()
            .id;

        let reopened = BillStore::open(&path).unwrap();
        assert!(reopened.get(&id).unwrap().is_some());
    }

    #[test]
    fn test_status_parse() {
        assert_eq!("paid".parse::<BillStatus>().unwrap(), BillStatus::Paid);
        assert!("PAID".parse::<BillStatus>().is_err());
        assert!("refunded".parse::<BillStatus>().is_err());
        assert_eq!(BillStatus::Canceled.to_string(), "canceled");
    }
}
