use chrono::{DateTime, NaiveDate, NaiveTime, Utc};
use clap::{Parser, Subcommand};
use color_eyre::{eyre::eyre, Result};
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;
use tracing_appender::non_blocking::WorkerGuard;

use ledgersync::cache::{CacheEvent, Cacheable, QueryKey};
use ledgersync::model::{
  DateRange, Direction, NotificationFilters, NotificationKind, Pagination, TransactionFilters,
  TransactionStatus, UnreadAggregate,
};
use ledgersync::{output, Config, HttpRemote, Session};

#[derive(Parser, Debug)]
#[command(name = "ledgersync")]
#[command(about = "Seller notifications and wallet transactions from the terminal")]
#[command(version)]
struct Args {
  /// Path to config file (default: $XDG_CONFIG_HOME/ledgersync/config.yaml)
  #[arg(short, long, global = true)]
  config: Option<PathBuf>,

  /// Print JSON instead of table rows
  #[arg(long, global = true)]
  json: bool,

  /// Also log to stderr
  #[arg(short, long, global = true)]
  verbose: bool,

  #[command(subcommand)]
  command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
  /// List notifications
  Notifications {
    /// Only unread notifications
    #[arg(long, conflicts_with = "read")]
    unread: bool,
    /// Only read notifications
    #[arg(long)]
    read: bool,
    /// Only this kind (order, delivery, payout, support, product, other)
    #[arg(long)]
    kind: Option<NotificationKind>,
    #[arg(long, default_value_t = 1)]
    page: u32,
    #[arg(long, default_value_t = 20)]
    limit: u32,
  },
  /// Show the unread count
  Unread,
  /// Keep printing the unread count as it changes (Ctrl+C to stop)
  WatchUnread,
  /// Mark one notification as read
  MarkRead { id: String },
  /// Mark every notification as read
  MarkAllRead,
  /// Delete one notification
  Delete { id: String },
  /// List wallet transactions
  Transactions {
    #[arg(long)]
    direction: Option<Direction>,
    #[arg(long)]
    status: Option<TransactionStatus>,
    /// First day to include (YYYY-MM-DD)
    #[arg(long, value_parser = parse_day)]
    from: Option<NaiveDate>,
    /// Last day to include (YYYY-MM-DD)
    #[arg(long, value_parser = parse_day)]
    to: Option<NaiveDate>,
    /// Match id, description or order/withdrawal reference
    #[arg(long)]
    search: Option<String>,
    #[arg(long, default_value_t = 1)]
    page: u32,
    #[arg(long, default_value_t = 20)]
    limit: u32,
  },
  /// Look up one transaction by id
  Transaction { id: String },
}

fn parse_day(s: &str) -> std::result::Result<NaiveDate, String> {
  NaiveDate::parse_from_str(s, "%Y-%m-%d").map_err(|e| format!("expected YYYY-MM-DD: {}", e))
}

fn start_of(day: NaiveDate) -> DateTime<Utc> {
  day.and_time(NaiveTime::default()).and_utc()
}

fn end_of(day: NaiveDate) -> DateTime<Utc> {
  day
    .and_hms_milli_opt(23, 59, 59, 999)
    .map(|at| at.and_utc())
    .unwrap_or_else(|| start_of(day))
}

/// File logging in the data directory; `verbose` mirrors it to stderr.
fn init_logging(verbose: bool) -> Result<WorkerGuard> {
  use tracing_subscriber::{fmt, prelude::*, EnvFilter};

  let log_dir = dirs::data_dir()
    .unwrap_or_else(std::env::temp_dir)
    .join("ledgersync")
    .join("logs");
  std::fs::create_dir_all(&log_dir)
    .map_err(|e| eyre!("Failed to create log directory {}: {}", log_dir.display(), e))?;

  let (file_writer, guard) =
    tracing_appender::non_blocking(tracing_appender::rolling::daily(&log_dir, "ledgersync.log"));

  let env_filter =
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("ledgersync=info"));
  let stderr_layer = verbose.then(|| fmt::layer().with_writer(std::io::stderr).with_target(false));

  tracing_subscriber::registry()
    .with(env_filter)
    .with(fmt::layer().with_writer(file_writer).with_ansi(false))
    .with(stderr_layer)
    .init();

  Ok(guard)
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
  println!("{}", serde_json::to_string_pretty(value)?);
  Ok(())
}

fn print_unread(unread: &UnreadAggregate, json: bool) -> Result<()> {
  if json {
    print_json(unread)
  } else {
    println!("{} unread", unread.count);
    Ok(())
  }
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();
  let _log_guard = init_logging(args.verbose)?;

  // Load configuration
  let config = Config::load(args.config.as_deref())?;
  let remote = Arc::new(HttpRemote::new(&config.api)?);
  let session = Session::new(&config, remote);
  let notifications = session.notifications();

  match args.command {
    Command::Notifications {
      unread,
      read,
      kind,
      page,
      limit,
    } => {
      let filters = NotificationFilters {
        read: match (unread, read) {
          (true, _) => Some(false),
          (_, true) => Some(true),
          _ => None,
        },
        kind,
      };
      let page = notifications
        .fetch_list(&filters, Pagination { page, limit })
        .await?;
      if args.json {
        print_json(&page)?;
      } else {
        for record in &page.records {
          println!("{}", output::notification_row(record));
        }
        println!("{}", output::page_footer(&page));
      }
    }
    Command::Unread => {
      let unread = notifications.fetch_unread_aggregate().await?;
      print_unread(&unread, args.json)?;
    }
    Command::WatchUnread => {
      let mut updates = session.cache().subscribe(&QueryKey::UnreadAggregate);
      let _watcher = notifications.watch_unread();
      info!("watching unread count");
      loop {
        tokio::select! {
          event = updates.recv() => match event {
            Some(CacheEvent::Updated(value)) => {
              if let Some(unread) = UnreadAggregate::from_cached(&value) {
                print_unread(&unread, args.json)?;
              }
            }
            Some(_) => {}
            None => break,
          },
          _ = tokio::signal::ctrl_c() => break,
        }
      }
    }
    Command::MarkRead { id } => {
      notifications.mark_read(&id).await?;
      println!("Marked {} as read", id);
    }
    Command::MarkAllRead => {
      notifications.mark_all_read().await?;
      println!("Marked all notifications as read");
    }
    Command::Delete { id } => {
      notifications.delete(&id).await?;
      println!("Deleted {}", id);
    }
    Command::Transactions {
      direction,
      status,
      from,
      to,
      search,
      page,
      limit,
    } => {
      let date_range = (from.is_some() || to.is_some()).then(|| DateRange {
        start: from.map(start_of),
        end: to.map(end_of),
      });
      let filters = TransactionFilters {
        direction,
        status,
        date_range,
        search_term: search,
      };
      let page = session
        .transactions()
        .fetch_page(&filters, page, limit)
        .await?;
      if args.json {
        print_json(&page)?;
      } else {
        for record in &page.records {
          println!("{}", output::transaction_row(record));
        }
        println!("{}", output::page_footer(&page));
      }
    }
    Command::Transaction { id } => {
      let record = session.transactions().resolve_by_id(&id).await?;
      if args.json {
        print_json(&record)?;
      } else {
        println!("{}", output::transaction_row(&record));
        if let Some(order) = &record.references.order_id {
          println!("  order:      {}", order);
        }
        if let Some(withdrawal) = &record.references.withdrawal_id {
          println!("  withdrawal: {}", withdrawal);
        }
      }
    }
  }

  Ok(())
}
