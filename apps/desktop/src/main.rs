use std::{path::PathBuf, sync::Arc, time::Duration};

use anyhow::{bail, Result};
use clap::{Parser, Subcommand};
use client_core::{
    load_client_settings, ride_request_line,
    transport::{HttpAuthProvider, HttpRequestStore},
    ClientEvent, Credentials, FeedClient, FeedView, RideRequestForm,
};
use tokio_stream::StreamExt;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

const PUBLISH_ECHO_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Parser, Debug)]
#[command(about = "Terminal front-end for the shared ride request feed")]
struct Args {
    /// Settings file; defaults to ./client.toml when present.
    #[arg(long, env = "RIDE_FEED_SETTINGS")]
    settings: Option<PathBuf>,
    /// Overrides the server url from settings.
    #[arg(long)]
    server_url: Option<String>,
    #[arg(long, env = "RIDE_FEED_EMAIL")]
    email: String,
    #[arg(long, env = "RIDE_FEED_PASSWORD", hide_env_values = true)]
    password: String,
    /// Create the account instead of signing in.
    #[arg(long)]
    register: bool,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Publish one ride request and wait until it appears in the feed.
    Publish {
        #[arg(long)]
        pickup: String,
        #[arg(long)]
        dropoff: String,
    },
    /// Print the feed every time it changes, until ctrl-c.
    Watch,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "warn".into()))
        .init();
    let args = Args::parse();

    let mut settings = load_client_settings(args.settings.as_deref());
    if let Some(server_url) = args.server_url {
        settings.server_url = server_url;
    }

    let auth = HttpAuthProvider::new(settings.server_url.clone());
    let store = Arc::new(HttpRequestStore::new(
        settings.server_url.clone(),
        Arc::clone(&auth),
    ));
    let client = FeedClient::new(auth, store, &settings);
    let mut events = client.subscribe_events();
    client.run().await;

    let credentials = Credentials::new(args.email, args.password);
    if args.register {
        client.register(&credentials).await?;
    } else {
        client.login(&credentials).await?;
    }
    drop(credentials);

    let mut session = client.subscribe_session();
    let label = session
        .wait_for(|session| session.is_authenticated())
        .await?
        .display_label
        .clone();
    println!("Signed in as {label}");

    let outcome = match args.command {
        Command::Publish { pickup, dropoff } => publish(&client, pickup, dropoff).await,
        Command::Watch => watch(&client, &mut events).await,
    };

    if let Err(err) = client.logout().await {
        warn!(%err, "logout failed");
    }
    client.shutdown().await;
    outcome
}

async fn publish(client: &FeedClient, pickup: String, dropoff: String) -> Result<()> {
    let mut updates = client.feed_updates();
    let mut form = RideRequestForm::new(pickup, dropoff);
    let expected = form.clone();
    let author = client.session().identity;
    client.publish(&mut form).await?;
    info!("ride request published; waiting for it in the feed");

    let echoed = tokio::time::timeout(PUBLISH_ECHO_TIMEOUT, async {
        while let Some(view) = updates.next().await {
            let found = view.iter().any(|request| {
                Some(request.author) == author
                    && request.pickup_location == expected.pickup_location.trim()
                    && request.dropoff_location == expected.dropoff_location.trim()
            });
            if found {
                return Some(view);
            }
        }
        None
    })
    .await;

    match echoed {
        Ok(Some(view)) => {
            render(&view);
            Ok(())
        }
        Ok(None) => bail!("feed closed before the request appeared"),
        Err(_) => bail!("request not seen in the feed within {PUBLISH_ECHO_TIMEOUT:?}"),
    }
}

async fn watch(
    client: &FeedClient,
    events: &mut tokio::sync::broadcast::Receiver<ClientEvent>,
) -> Result<()> {
    let mut updates = client.feed_updates();
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("interrupted");
                return Ok(());
            }
            view = updates.next() => match view {
                Some(view) => render(&view),
                None => return Ok(()),
            },
            event = events.recv() => match event {
                Ok(ClientEvent::SubscriptionLost) => bail!("feed subscription lost"),
                Ok(ClientEvent::Error(message)) => eprintln!("error: {message}"),
                Ok(_) => {}
                Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "event stream lagged");
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => return Ok(()),
            },
        }
    }
}

fn render(view: &FeedView) {
    println!("--- {} ride request(s) ---", view.len());
    for request in view {
        println!("{}", ride_request_line(request));
    }
}
