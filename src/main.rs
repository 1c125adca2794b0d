use anyhow::{bail, Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};

use civicapi::{load_csv, logging, parse_bill_text, BillStatus, BillStore, Config, TokenSigner};

/// Local administration of the bill store
#[derive(Debug, Parser)]
#[command(name = "civicapi", version, about)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Create the database schema
    Init,
    /// Import bills from a CSV file (vendor,amount,due_date,note) or a bill text file
    Import { file: PathBuf },
    /// List bills ordered by due date
    List {
        #[arg(long)]
        status: Option<String>,
    },
    /// Mark a bill as paid
    MarkPaid { bill_id: String },
    /// Print the signed pay link of a bill
    Link { bill_id: String },
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = Config::load()?;
    logging::init(&config.log_level);

    let db_path = config.database_path();
    let store = BillStore::open(&db_path)
        .with_context(|| format!("Failed to open database {}", db_path.display()))?;

    match cli.command {
        Command::Init => {
            println!("✓ Database ready: {}", db_path.display());
        }
        Command::Import { file } => run_import(&store, &file)?,
        Command::List { status } => run_list(&store, status.as_deref())?,
        Command::MarkPaid { bill_id } => {
            if !store.set_status(&bill_id, BillStatus::Paid, "cli")? {
                bail!("Bill not found: {}", bill_id);
            }
            println!("✓ {} marked paid", bill_id);
        }
        Command::Link { bill_id } => {
            if store.get(&bill_id)?.is_none() {
                bail!("Bill not found: {}", bill_id);
            }
            let signer = TokenSigner::new(&config.webhook_secret);
            println!("{}", signer.pay_link(&config.public_base_url, &bill_id));
        }
    }

    Ok(())
}

fn run_import(store: &BillStore, file: &Path) -> Result<()> {
    let is_csv = file
        .extension()
        .map(|ext| ext.eq_ignore_ascii_case("csv"))
        .unwrap_or(false);

    let new_bills = if is_csv {
        load_csv(file).with_context(|| format!("Failed to read {}", file.display()))?
    } else {
        let text = std::fs::read(file).with_context(|| format!("Failed to read {}", file.display()))?;
        vec![parse_bill_text(&String::from_utf8_lossy(&text), Utc::now().date_naive())]
    };

    let before = store.count()?;
    let mut failed = 0;

    for new_bill in new_bills {
        let vendor = new_bill.vendor.clone();
        match store.create(new_bill, "cli") {
            Ok(bill) => println!(
                "✓ {}  {:<24} ${:>10.2}  due {}",
                bill.id, bill.vendor, bill.amount, bill.due_date
            ),
            Err(e) => {
                failed += 1;
                eprintln!("✗ {}: {}", vendor, e);
            }
        }
    }

    let after = store.count()?;
    println!("\n✓ Imported: {} bills", after - before);
    if failed > 0 {
        println!("✗ Rejected: {}", failed);
    }

    Ok(())
}

fn run_list(store: &BillStore, status: Option<&str>) -> Result<()> {
    let status = status.map(str::parse::<BillStatus>).transpose()?;
    let bills = store.list(status)?;

    for bill in &bills {
        println!(
            "{}  {:<8} {:<24} ${:>10.2}  due {}",
            bill.id, bill.status.as_str(), bill.vendor, bill.amount, bill.due_date
        );
    }
    println!("\n{} bills", bills.len());

    Ok(())
}
