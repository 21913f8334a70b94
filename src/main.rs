// Spot Reviews - maintenance CLI
// Database setup, location seeding and aggregate reconciliation

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};

use spot_reviews::{db, reconcile, Store};

#[derive(Parser, Debug)]
#[command(name = "spot-reviews")]
#[command(about = "Spot Reviews maintenance tools", version)]
struct Cli {
    /// SQLite database file
    #[arg(long, env = "SPOT_DATABASE", default_value = "spot-reviews.db")]
    database: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Create the database schema
    Init,

    /// Merge locations from a CSV file (id,place_id,name,address,lat,lng,types)
    Import { csv: PathBuf },

    /// Recompute every rating aggregate from the stored reviews
    Reconcile,

    /// Show row counts
    Stats,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let store = Store::open(&cli.database)
        .with_context(|| format!("Failed to open database {}", cli.database.display()))?;

    match cli.command {
        Command::Init => {
            println!("✓ Database initialized: {}", cli.database.display());
        }
        Command::Import { csv } => run_import(&store, &csv)?,
        Command::Reconcile => run_reconcile(&store)?,
        Command::Stats => run_stats(&store)?,
    }

    Ok(())
}

fn run_import(store: &Store, csv_path: &Path) -> Result<()> {
    println!("📂 Loading locations from {}...", csv_path.display());
    let places = db::load_locations_csv(csv_path).context("Failed to load CSV")?;
    println!("✓ Loaded {} locations", places.len());

    store
        .with_conn(|conn| {
            let tx = conn.transaction()?;
            for place in &places {
                db::upsert_location(&tx, place)?;
            }
            tx.commit()?;
            Ok(())
        })
        .context("Failed to store locations")?;

    println!("✓ Merged {} locations (existing ratings kept)", places.len());
    Ok(())
}

fn run_reconcile(store: &Store) -> Result<()> {
    println!("🔍 Recomputing aggregates from reviews...");
    let drifted = reconcile(store).context("Reconciliation failed")?;

    if drifted.is_empty() {
        println!("✓ All aggregates match the review log");
        return Ok(());
    }

    for entry in &drifted {
        println!(
            "  {}: {} @ {:.2} → {} @ {:.2}",
            entry.location_id,
            entry.before.ratings_count,
            entry.before.average_rating,
            entry.after.ratings_count,
            entry.after.average_rating,
        );
    }
    println!("✓ Corrected {} aggregates", drifted.len());
    Ok(())
}

fn run_stats(store: &Store) -> Result<()> {
    let stats = store.with_conn(|conn| db::store_stats(conn))?;

    println!("📊 Spot Reviews v{}", spot_reviews::VERSION);
    println!("   Reviews:           {}", stats.reviews);
    println!("   Locations:         {}", stats.locations);
    println!("   Processed reviews: {}", stats.processed_reviews);

    let pending = stats.reviews - stats.processed_reviews;
    if pending > 0 {
        println!("   ⚠️  {pending} reviews not yet counted (run `reconcile`)");
    }

    Ok(())
}
