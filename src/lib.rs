// CivicAPI Bills - Core Library
// Exposes all modules for use in CLI, API server, and tests

pub mod config;
pub mod db;
pub mod error;
pub mod logging;
pub mod notify;
pub mod parser;
pub mod token;
pub mod webhook;

#[cfg(feature = "server")]
pub mod api;

// Re-export commonly used types
pub use config::Config;
pub use db::{Bill, BillEvent, BillStatus, BillStore, NewBill, setup_database};
pub use error::{AppError, Result};
pub use notify::{Channel, NotificationResult, Notifier, reminder_message};
pub use parser::{load_csv, parse_bill_text};
pub use token::TokenSigner;
pub use webhook::{handle_payment, WebhookOutcome, WebhookPayload};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
