// Bill text extraction and CSV bulk import
// Free-form bill text → NewBill, with fixed fallbacks for missing fields

use chrono::NaiveDate;
use regex::Regex;
use serde::Deserialize;
use std::path::Path;
use std::sync::OnceLock;

use crate::db::NewBill;
use crate::error::Result;

pub const UNKNOWN_VENDOR: &str = "Unknown Vendor";
pub const PARSED_NOTE: &str = "parsed-from-text";

struct Patterns {
    vendor: Regex,
    amount: Regex,
    due: Regex,
}

fn patterns() -> &'static Patterns {
    static PATTERNS: OnceLock<Patterns> = OnceLock::new();
    PATTERNS.get_or_init(|| Patterns {
        vendor: Regex::new(r"Vendor:\s*(.+)").expect("valid vendor regex"),
        amount: Regex::new(r"Amount:\s*\$?([0-9]+(?:\.[0-9]{1,2})?)").expect("valid amount regex"),
        due: Regex::new(r"Due:\s*([0-9]{4}-[0-9]{2}-[0-9]{2})").expect("valid due regex"),
    })
}

/// Extract vendor / amount / due date from bill text.
///
/// Looks for `Vendor: ...`, `Amount: $12.34` and `Due: YYYY-MM-DD` anywhere
/// in the text. Missing fields fall back to "Unknown Vendor", 0.0 and
/// `today`. The result is not validated; a matched but impossible date such
/// as 2024-13-45 is rejected later by `BillStore::create`.
pub fn parse_bill_text(text: &str, today: NaiveDate) -> NewBill {
    let p = patterns();

    let vendor = p
        .vendor
        .captures(text)
        .map(|c| c[1].trim().to_string())
        .filter(|v| !v.is_empty())
        .unwrap_or_else(|| UNKNOWN_VENDOR.to_string());

    let amount = p
        .amount
        .captures(text)
        .and_then(|c| c[1].parse::<f64>().ok())
        .unwrap_or(0.0);

    let due_date = p
        .due
        .captures(text)
        .map(|c| c[1].to_string())
        .unwrap_or_else(|| today.format("%Y-%m-%d").to_string());

    NewBill::new(&vendor, amount, &due_date).with_note(PARSED_NOTE)
}

/// Decode an `application/x-www-form-urlencoded` body into key/value pairs.
///
/// Invalid UTF-8 is replaced rather than dropped; a key without `=` gets an
/// empty value.
pub fn parse_form(body: &[u8]) -> Vec<(String, String)> {
    url::form_urlencoded::parse(body).into_owned().collect()
}

/// One row of a bill CSV (`vendor,amount,due_date,note`)
#[derive(Debug, Deserialize)]
struct CsvBill {
    vendor: String,
    amount: String,
    due_date: String,
    #[serde(default)]
    note: Option<String>,
}

/// Load bills from a CSV file with a header row
pub fn load_csv(csv_path: &Path) -> Result<Vec<NewBill>> {
    let mut rdr = csv::Reader::from_path(csv_path)?;
    read_csv(&mut rdr)
}

/// Same as `load_csv` for any reader
pub fn read_csv<R: std::io::Read>(rdr: &mut csv::Reader<R>) -> Result<Vec<NewBill>> {
    let mut bills = Vec::new();

    for result in rdr.deserialize() {
        let row: CsvBill = result?;
        bills.push(NewBill::from_fields(
            &row.vendor,
            &row.amount,
            &row.due_date,
            row.note.as_deref(),
        )?);
    }

    Ok(bills)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn today() -> NaiveDate {
        NaiveDate::from_ymd_opt(2025, 1, 31).unwrap()
    }

    #[test]
    fn test_parse_full_text() {
        let text = "CITY WATER DEPT\nVendor: City Water\nAmount: $42.50\nDue: 2024-05-01\n";
        let bill = parse_bill_text(text, today());

        assert_eq!(bill.vendor, "City Water");
        assert_eq!(bill.amount, 42.50);
        assert_eq!(bill.due_date, "2024-05-01");
        assert_eq!(bill.note.as_deref(), Some(PARSED_NOTE));
        assert!(bill.status.is_none());
    }

    #[test]
    fn test_parse_without_dollar_sign() {
        let bill = parse_bill_text("Amount: 1200", today());
        assert_eq!(bill.amount, 1200.0);
    }

    #[test]
    fn test_parse_fallbacks() {
        let bill = parse_bill_text("nothing useful here", today());
        assert_eq!(bill.vendor, UNKNOWN_VENDOR);
        assert_eq!(bill.amount, 0.0);
        assert_eq!(bill.due_date, "2025-01-31");
    }

    #[test]
    fn test_vendor_stops_at_line_end() {
        let bill = parse_bill_text("Vendor:   Power Co  \r\nAmount: 3", today());
        assert_eq!(bill.vendor, "Power Co");
    }

    #[test]
    fn test_amount_keeps_two_decimals() {
        // Third decimal is ignored by the pattern
        let bill = parse_bill_text("Amount: $9.999", today());
        assert_eq!(bill.amount, 9.99);
    }

    #[test]
    fn test_parse_form() {
        let pairs = parse_form(b"vendor=City+Water&amount=12.50&note=a%26b&flag");
        assert_eq!(
            pairs,
            vec![
                ("vendor".to_string(), "City Water".to_string()),
                ("amount".to_string(), "12.50".to_string()),
                ("note".to_string(), "a&b".to_string()),
                ("flag".to_string(), String::new()),
            ]
        );
    }

    #[test]
    fn test_parse_form_keeps_invalid_utf8_escapes() {
        let pairs = parse_form(b"note=%FF&b=ok");
        assert_eq!(
            pairs,
            vec![
                ("note".to_string(), "\u{FFFD}".to_string()),
                ("b".to_string(), "ok".to_string()),
            ]
        );
    }

    #[test]
    fn test_read_csv() {
        let data = "vendor,amount,due_date,note\nAcme,42.50,2024-05-01,first\nPower Co,10,2024-06-01,\n";
        let mut rdr = csv::Reader::from_reader(data.as_bytes());
        let bills = read_csv(&mut rdr).unwrap();

        assert_eq!(bills.len(), 2);
        assert_eq!(bills[0].vendor, "Acme");
        assert_eq!(bills[0].note.as_deref(), Some("first"));
        assert_eq!(bills[1].amount, 10.0);
        assert!(bills[1].note.is_none());
    }

    #[test]
    fn test_read_csv_bad_amount() {
        let data = "vendor,amount,due_date\nAcme,lots,2024-05-01\n";
        let mut rdr = csv::Reader::from_reader(data.as_bytes());
        assert!(read_csv(&mut rdr).is_err());
    }
}
