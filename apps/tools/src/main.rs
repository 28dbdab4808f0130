use anyhow::Result;
use clap::{Parser, Subcommand};
use storage::Storage;

#[derive(Parser, Debug)]
struct Cli {
    #[arg(long, env = "DATABASE_URL", default_value = "sqlite://./data/ride_feed.db")]
    database_url: String,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print every stored ride request in log order.
    ListRequests,
    CountRequests,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let storage = Storage::new(&cli.database_url).await?;

    match cli.command {
        Command::ListRequests => {
            for request in storage.list_ride_requests().await? {
                println!(
                    "{}\t{}\t{}\t{} -> {}",
                    request.id,
                    request.created_at.to_rfc3339(),
                    request.author_label,
                    request.pickup_location,
                    request.dropoff_location
                );
            }
        }
        Command::CountRequests => {
            println!("ride_requests={}", storage.count_ride_requests().await?);
        }
    }

    Ok(())
}
