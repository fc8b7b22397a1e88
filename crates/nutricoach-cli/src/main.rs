//! Nutricoach CLI - log meals and weight from the terminal.
//!
//! A thin front end over `nutricoach-core`: every command goes through the
//! same cache and mutation layer the mobile screens use, so changes made
//! while offline are held and sent once the API is reachable again.

use std::io::{self, BufRead, Write};
use std::path::Path;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use chrono::{Local, NaiveDate};
use serde::de::DeserializeOwned;
use tracing::{info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use nutricoach_core::connectivity::{probe_once, probe_target};
use nutricoach_core::models::{
    MealType, NewMealLog, NewWeightLog, OnboardingStep, PhotoAttachment,
};
use nutricoach_core::{
    CancelToken, Coach, Config, ConfigFile, ConnectivityMonitor, NormalizedError, QueryObserver,
    QueryStatus,
};

// ============================================================================
// Constants
// ============================================================================

/// How often the API host is probed for reachability
const PROBE_INTERVAL_SECS: u64 = 5;

/// How long a queued change waits for connectivity before giving up
const OFFLINE_WAIT_SECS: u64 = 120;

/// Upper bound on waiting for a query to settle
const QUERY_WAIT_SECS: u64 = 60;

const LOG_FILE_NAME: &str = "nutricoach.log";

const USAGE: &str = "\
Usage: nutricoach <command> [args]

Commands:
  login <phone>                          Sign in with a one-time code
  logout                                 Sign out and clear local data
  weights                                Show recent weight entries
  log-weight <kg> [YYYY-MM-DD]           Log a weight (defaults to today)
  meals [YYYY-MM-DD]                     Show meals for a day (defaults to today)
  log-meal <type> <description> [--photo <path>]
                                         Log a meal (breakfast, lunch, dinner, snack)
  adherence                              Show the current adherence summary
  onboarding <step> <json>               Submit an onboarding step (1-4)

Set NUTRICOACH_API_URL to point at the backend. RUST_LOG controls logging.";

/// Initialize the tracing subscriber for logging.
///
/// Logs go to stderr and, when a cache directory is available, to a daily
/// rolling file. The returned guard must live until exit so the file writer
/// flushes.
fn init_tracing(log_dir: Option<&Path>) -> Option<WorkerGuard> {
    // Use RUST_LOG env var to control log level (e.g., RUST_LOG=debug)
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));

    let (file_layer, guard) = match log_dir {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, LOG_FILE_NAME);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = fmt::layer().with_writer(writer).with_ansi(false);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(io::stderr))
        .with(file_layer)
        .with(filter)
        .init();

    guard
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file if present (silently ignore if not found)
    let _ = dotenvy::dotenv();

    let log_dir = Config::default_cache_dir().ok();
    let _guard = init_tracing(log_dir.as_deref());

    let args: Vec<String> = std::env::args().collect();
    let Some(command) = args.get(1).map(String::as_str) else {
        println!("{}", USAGE);
        return Ok(());
    };
    if matches!(command, "help" | "--help" | "-h") {
        println!("{}", USAGE);
        return Ok(());
    }

    let config = Config::load()?;
    let connectivity = match probe_target(&config.api_base_url) {
        Some(target) => {
            let monitor = ConnectivityMonitor::new(probe_once(&target).await);
            monitor.spawn_probe(target, Duration::from_secs(PROBE_INTERVAL_SECS));
            monitor
        }
        None => ConnectivityMonitor::default(),
    };

    let coach = Coach::from_config(&config, connectivity).await?;
    let _background = coach.start();
    info!(command, "nutricoach starting");

    let rest = &args[2..];
    match command {
        "login" => login(&coach, rest).await,
        "logout" => logout(&coach).await,
        "weights" => weights(&coach).await,
        "log-weight" => log_weight(&coach, rest).await,
        "meals" => meals(&coach, rest).await,
        "log-meal" => log_meal(&coach, rest).await,
        "adherence" => adherence(&coach).await,
        "onboarding" => onboarding(&coach, rest).await,
        other => bail!("Unknown command '{}'\n\n{}", other, USAGE),
    }
}

// ============================================================================
// Helpers
// ============================================================================

/// Present a normalized error the way the app screens do: title, message,
/// and a retry hint when retrying can help.
fn user_error(err: NormalizedError) -> anyhow::Error {
    if err.retryable {
        anyhow!("{}: {} (you can retry this command)", err.title(), err.message)
    } else {
        anyhow!("{}: {}", err.title(), err.message)
    }
}

fn parse_date(arg: Option<&String>) -> Result<NaiveDate> {
    match arg {
        Some(s) => NaiveDate::parse_from_str(s, "%Y-%m-%d")
            .with_context(|| format!("Invalid date '{}', expected YYYY-MM-DD", s)),
        None => Ok(Local::now().date_naive()),
    }
}

async fn require_session(coach: &Coach) -> Result<()> {
    if coach.restore_session().await?.is_none() {
        bail!("Not signed in. Run `nutricoach login <phone>` first.");
    }
    Ok(())
}

/// Cancel token that fires after the offline wait limit
fn offline_deadline(coach: &Coach) -> CancelToken {
    let cancel = CancelToken::new();
    if !coach.connectivity().is_connected() {
        println!("Offline - the change will be sent when the connection returns.");
        let deadline = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(OFFLINE_WAIT_SECS)).await;
            deadline.cancel();
        });
    }
    cancel
}

/// Wait for a query to settle and return its data, printing staleness notes
async fn settle<T: DeserializeOwned>(mut observer: QueryObserver<T>) -> Result<Option<T>> {
    let snapshot = tokio::time::timeout(Duration::from_secs(QUERY_WAIT_SECS), observer.settled())
        .await
        .map_err(|_| anyhow!("Timed out waiting for the server"))?;

    let age = snapshot.age_display();
    match (snapshot.status, snapshot.error) {
        (QueryStatus::Error, Some(err)) if snapshot.data.is_none() => Err(user_error(err)),
        (QueryStatus::Error, Some(err)) => {
            eprintln!("Could not refresh ({}). Showing data from {}.", err, age);
            Ok(snapshot.data)
        }
        (QueryStatus::Idle, _) => {
            println!("Offline - nothing cached yet.");
            Ok(None)
        }
        _ => Ok(snapshot.data),
    }
}

// ============================================================================
// Commands
// ============================================================================

async fn login(coach: &Coach, args: &[String]) -> Result<()> {
    let phone = args
        .first()
        .context("Usage: nutricoach login <phone>")?;
    coach.request_otp(phone).await.map_err(user_error)?;

    print!("Enter the code sent to {}: ", phone);
    io::stdout().flush()?;
    let mut code = String::new();
    io::stdin().lock().read_line(&mut code)?;

    let client = coach
        .verify_otp(phone, code.trim())
        .await
        .map_err(user_error)?;

    let mut file = ConfigFile::load().unwrap_or_default();
    file.last_phone = Some(phone.clone());
    if let Err(e) = file.save() {
        warn!(error = %e, "Failed to save config");
    }

    println!("Signed in as {}", client.display_name());
    if !client.onboarding_completed {
        println!("Onboarding is not complete yet. See `nutricoach onboarding`.");
    }
    Ok(())
}

async fn logout(coach: &Coach) -> Result<()> {
    coach.sign_out().await?;
    println!("Signed out.");
    Ok(())
}

async fn weights(coach: &Coach) -> Result<()> {
    require_session(coach).await?;
    let Some(history) = settle(coach.weight_history()).await? else {
        return Ok(());
    };
    if history.is_empty() {
        println!("No weight entries yet.");
    }
    for entry in &history {
        println!("{}  {}", entry.log_date, entry.display_weight());
    }
    Ok(())
}

async fn log_weight(coach: &Coach, args: &[String]) -> Result<()> {
    require_session(coach).await?;
    let kg: f64 = args
        .first()
        .context("Usage: nutricoach log-weight <kg> [YYYY-MM-DD]")?
        .parse()
        .context("Weight must be a number in kg")?;
    let date = parse_date(args.get(1))?;

    let cancel = offline_deadline(coach);
    let saved = coach
        .log_weight_mutation()
        .mutate_with(NewWeightLog::new(kg, date), &cancel)
        .await
        .map_err(user_error)?;
    println!("Logged {} for {}", saved.display_weight(), saved.log_date);
    Ok(())
}

async fn meals(coach: &Coach, args: &[String]) -> Result<()> {
    require_session(coach).await?;
    let date = parse_date(args.first())?;
    let Some(meals) = settle(coach.meals_for(date)).await? else {
        return Ok(());
    };
    if meals.is_empty() {
        println!("No meals logged for {}.", date);
    }
    for meal in &meals {
        let photo = if meal.photo_url.is_some() { " [photo]" } else { "" };
        println!("{:<10} {}{}", meal.meal_type.display_name(), meal.description, photo);
    }
    Ok(())
}

async fn log_meal(coach: &Coach, args: &[String]) -> Result<()> {
    const USAGE_LOG_MEAL: &str = "Usage: nutricoach log-meal <type> <description> [--photo <path>]";

    require_session(coach).await?;
    let meal_type = args
        .first()
        .and_then(|s| MealType::parse(s))
        .context(USAGE_LOG_MEAL)?;
    let description = args.get(1).context(USAGE_LOG_MEAL)?;

    let photo = match args.iter().position(|a| a == "--photo") {
        Some(i) => {
            let path = args.get(i + 1).context(USAGE_LOG_MEAL)?;
            let bytes = tokio::fs::read(path)
                .await
                .with_context(|| format!("Failed to read photo {}", path))?;
            Some(PhotoAttachment::from_path_bytes(path, bytes))
        }
        None => None,
    };

    let entry = NewMealLog::new(meal_type, description.as_str(), Local::now().date_naive());
    let cancel = offline_deadline(coach);
    let result = coach
        .log_meal_mutation()
        .mutate_with(nutricoach_core::WithAttachment::new(entry, photo), &cancel)
        .await
        .map_err(user_error)?;
    println!("Logged {}: {}", result.output.meal_type.display_name(), result.output.description);

    // The meal is saved either way; the photo outcome is informational
    if let Some(upload) = result.upload {
        println!("Uploading photo...");
        match upload.settled().await {
            Some(record) if record.succeeded() => println!("Photo uploaded."),
            Some(record) => {
                let reason = record
                    .error
                    .map(|e| e.to_string())
                    .unwrap_or_default();
                println!("The meal was saved, but the photo could not be uploaded: {}", reason);
            }
            None => println!("The meal was saved; the photo upload did not finish."),
        }
    }
    Ok(())
}

async fn adherence(coach: &Coach) -> Result<()> {
    require_session(coach).await?;
    let Some(summary) = settle(coach.adherence_summary()).await? else {
        return Ok(());
    };
    println!(
        "Adherence {} ({} to {})",
        summary.score_display(),
        summary.period_start,
        summary.period_end
    );
    println!("  Meals logged:   {}", summary.meals_logged);
    println!("  Weights logged: {}", summary.weights_logged);
    Ok(())
}

async fn onboarding(coach: &Coach, args: &[String]) -> Result<()> {
    const USAGE_ONBOARDING: &str = "Usage: nutricoach onboarding <step> <json>";

    require_session(coach).await?;
    let step: u8 = args
        .first()
        .context(USAGE_ONBOARDING)?
        .parse()
        .with_context(|| {
            format!(
                "Step must be a number from {} to {}",
                OnboardingStep::FIRST,
                OnboardingStep::LAST
            )
        })?;
    let payload: serde_json::Value = serde_json::from_str(args.get(1).context(USAGE_ONBOARDING)?)
        .context("Step payload must be valid JSON")?;
    let step = OnboardingStep::from_payload(step, payload)?;

    coach.submit_onboarding(step.clone()).await.map_err(user_error)?;
    println!("Onboarding step {} saved.", step.number());
    Ok(())
}
