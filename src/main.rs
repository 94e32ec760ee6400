use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, Duration, Utc};
use clap::{Parser, Subcommand};
use tracing::{info, warn};

use skillswap_sync::backend::Backend;
use skillswap_sync::chat::ChatScreen;
use skillswap_sync::clock::{Clock, SystemClock};
use skillswap_sync::config::AppConfig;
use skillswap_sync::feed::ChangeFeed;
use skillswap_sync::inbox::InboxScreen;
use skillswap_sync::logging::{init_from_config, OperationTimer};
use skillswap_sync::meeting::MeetingScreen;
use skillswap_sync::memory::MemoryBackend;
use skillswap_sync::models::{Profile, UserId};
use skillswap_sync::profile::ProfileScreen;
use skillswap_sync::retry::RetryPolicy;
use skillswap_sync::session::{countdown, format_countdown, SessionPhase};
use skillswap_sync::slots::{BrowseSlotsScreen, SessionsScreen, SlotDraft};
use skillswap_sync::unread::{badge_label, UnreadMonitor};

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Configuration file replacing the default lookup
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print the phase and countdown of a session
    Phase {
        /// Session start (RFC 3339)
        #[arg(long)]
        start: String,

        /// Session end (RFC 3339)
        #[arg(long)]
        end: String,

        /// Instant to evaluate at (RFC 3339), defaults to now
        #[arg(long)]
        now: Option<String>,
    },
    /// Print the unread badge for a count
    Badge {
        /// Unread message count
        count: u32,
    },
    /// Run the two-user booking and messaging scenario in memory
    Demo,
    /// Print the effective configuration as YAML
    ShowConfig,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => AppConfig::load_from(path)
            .with_context(|| format!("Failed to load configuration from {}", path.display()))?,
        None => AppConfig::load().context("Failed to load configuration")?,
    };
    let _guard = init_from_config(&config.logging).context("Failed to initialize logging")?;

    match cli.command {
        Commands::Phase { start, end, now } => {
            let start = parse_instant("start", &start)?;
            let end = parse_instant("end", &end)?;
            let now = match now {
                Some(now) => parse_instant("now", &now)?,
                None => Utc::now(),
            };
            if end <= start {
                anyhow::bail!("--end must be after --start");
            }
            let phase = SessionPhase::at(now, start, end);
            match countdown(now, start, end) {
                Some(left) => println!("{} {}", phase.status_label(), format_countdown(left)),
                None => println!("{}", phase.status_label()),
            }
        }
        Commands::Badge { count } => {
            println!("{}", badge_label(count).unwrap_or_default());
        }
        Commands::Demo => {
            run_demo(&config).await?;
        }
        Commands::ShowConfig => {
            print!("{}", config.to_yaml()?);
        }
    }

    Ok(())
}

fn parse_instant(name: &str, value: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|instant| instant.with_timezone(&Utc))
        .with_context(|| format!("Invalid --{name} instant: {value}"))
}

async fn run_demo(config: &AppConfig) -> Result<()> {
    let timer = OperationTimer::new("demo");
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let store = Arc::new(MemoryBackend::new(Arc::clone(&clock)));
    let backend: Arc<dyn Backend> = store.clone();
    let feed: Arc<dyn ChangeFeed> = Arc::new(store.feed());

    let (ana, ben) = (UserId::new(), UserId::new());
    for (id, name) in [(ana, "Ana"), (ben, "Ben")] {
        store
            .put_profile(Profile {
                id,
                display_name: Some(name.to_string()),
                email: Some(format!("{}@example.com", name.to_lowercase())),
                bio: None,
            })
            .await;
    }

    let mut sessions = SessionsScreen::mount(backend.clone(), feed.clone(), ana, config).await?;
    let mut browse =
        BrowseSlotsScreen::mount(backend.clone(), feed.clone(), clock.clone(), ben, config).await?;
    let mut unread = UnreadMonitor::mount(
        backend.clone(),
        feed.clone(),
        ana,
        RetryPolicy::from(&config.retry),
    )
    .await?;

    let start = clock.now() + Duration::minutes(30);
    let slot = sessions
        .create_slot(SlotDraft {
            start_at: Some(start),
            end_at: Some(start + Duration::hours(1)),
            timezone: "Europe/Lisbon".to_string(),
            notes: Some("Beginner guitar".to_string()),
        })
        .await?;
    browse.pump().await?;
    for listing in browse.listings() {
        info!(slot = %listing.slot.id, status = listing.status.label(), "Ben sees slot");
    }

    browse.book(slot.id).await?;
    sessions.pump().await?;
    for owned in sessions.slots() {
        info!(slot = %owned.slot.id, state = owned.booking_label(), "Ana sees slot");
    }

    let meeting = MeetingScreen::load(backend.clone(), slot.id, ben, config).await?;
    let now = clock.now();
    let phase = meeting.phase(now);
    info!(
        partner = meeting.partner_label(),
        status = phase.status_label(),
        countdown = %meeting.countdown_label(now),
        "Ben opens the meeting"
    );

    let thread = meeting.open_chat().await?;
    let mut ben_chat =
        ChatScreen::open(backend.clone(), feed.clone(), clock.clone(), thread, ben, config).await?;
    ben_chat.send("Hi Ana, looking forward to it!").await?;
    ben_chat.pump().await?;
    info!(pending = ben_chat.pending_count(), "Ben's message confirmed");

    unread.pump().await?;
    info!(badge = ?unread.badge(), "Ana's unread badge");

    let inbox = InboxScreen::mount(backend.clone(), feed.clone(), ana, config).await?;
    for preview in inbox.previews() {
        info!(
            with = %preview.other_label,
            unread = preview.unread,
            last = preview.snippet(),
            "Ana's inbox"
        );
    }

    let mut ana_chat =
        ChatScreen::open(backend.clone(), feed.clone(), clock.clone(), thread, ana, config).await?;
    unread.pump().await?;
    info!(badge = ?unread.badge(), "Ana read the thread");

    store.simulate_drop("demo network blip").await;
    unread.pump().await?;
    browse.pump().await?;

    browse.cancel(slot.id).await?;
    sessions.pump().await?;
    if let Some(owned) = sessions.slots().first() {
        info!(state = owned.booking_label(), "Ana sees the cancellation");
    } else {
        warn!("Ana's slot disappeared");
    }

    let mut profile = ProfileScreen::mount(backend.clone(), feed.clone(), ana, config).await?;
    profile.save("Ana", "Guitar tutor, learning Spanish").await?;
    info!(
        name = ?profile.profile().display_name,
        rating = %profile.rating().label(),
        "Ana's profile"
    );

    profile.unmount();
    ana_chat.close();
    ben_chat.close();
    unread.unmount();
    timer.finish();
    Ok(())
}
