use std::io::{self, BufRead, BufReader};
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use serde_json::json;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use notify_hub::config::HubConfig;
use notify_hub::logging;
use notify_hub::notification::{HubEvent, IngestOutcome, NotificationEngine, Role, ViewerScope};
use notify_hub::store::{HttpNotificationStore, MemoryNotificationStore, NotificationStore};
use notify_hub::transport::{LocalBus, TransportSignal};

/// Replay transport signals through the notification engine.
///
/// Reads one JSON signal per line, e.g.
/// `{"signal":"event","kind":"task.assigned","payload":{...}}`, and prints the
/// resulting notification collection and unread badges.
#[derive(Parser, Debug)]
#[command(name = "notify-hub", version, about)]
struct Args {
    /// Signal file (newline-delimited JSON). Reads stdin when omitted.
    input: Option<PathBuf>,

    /// Viewer role: admin, branch, production or chef.
    #[arg(short, long, default_value = "admin")]
    role: Role,

    /// Viewer user id.
    #[arg(short, long, default_value = "local-user")]
    user: String,

    #[arg(long)]
    branch: Option<String>,

    #[arg(long)]
    department: Option<String>,

    #[arg(long)]
    chef: Option<String>,

    /// Log filter directive, overriding RUST_LOG.
    #[arg(long)]
    log_filter: Option<String>,

    /// Pretty-print the output JSON.
    #[arg(long)]
    pretty: bool,
}

impl Args {
    fn scope(&self) -> ViewerScope {
        let mut scope = ViewerScope::new(self.role, self.user.clone());
        scope.branch_id = self.branch.clone();
        scope.department_id = self.department.clone();
        scope.chef_id = self.chef.clone();
        scope
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let config = HubConfig::from_env()?;

    let (logging_config, _guard) = logging::init_logging(&config.log_dir)?;
    if let Some(filter) = &args.log_filter {
        logging_config.set_filter(filter)?;
    }

    let store: Arc<dyn NotificationStore> = match HttpNotificationStore::from_config(&config)? {
        Some(store) => Arc::new(store),
        None => {
            info!("No store URL configured, using in-memory store");
            Arc::new(MemoryNotificationStore::new())
        }
    };

    let bus = LocalBus::new(config.event_buffer);
    let session = Arc::new(bus.session());
    let engine = Arc::new(NotificationEngine::new(config, store, session.clone())?);
    engine.sign_in(args.scope())?;

    let dispatcher = spawn_dispatcher(engine.subscribe());

    let reader: Box<dyn BufRead> = match &args.input {
        Some(path) => Box::new(BufReader::new(
            std::fs::File::open(path).with_context(|| format!("opening {}", path.display()))?,
        )),
        None => Box::new(io::stdin().lock()),
    };

    let mut stats = ReplayStats::default();
    for (index, line) in reader.lines().enumerate() {
        let line = line?;
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        let signal: TransportSignal = match serde_json::from_str(line) {
            Ok(signal) => signal,
            Err(e) => {
                warn!(line = index + 1, "Skipping unparsable signal: {}", e);
                stats.unparsable += 1;
                continue;
            }
        };

        if let Some(outcome) = engine.handle_signal(signal).await {
            stats.record(&outcome);
        }
    }

    engine.stop().await;
    tokio::task::yield_now().await;
    dispatcher.abort();

    let output = json!({
        "notifications": engine.notifications(),
        "unread": engine.unread(),
        "unreadTotal": engine.unread_count(),
        "reconciler": engine.reconciler_stats(),
        "replay": stats,
    });
    let text = if args.pretty {
        serde_json::to_string_pretty(&output)?
    } else {
        serde_json::to_string(&output)?
    };
    println!("{}", text);

    Ok(())
}

#[derive(Debug, Default, serde::Serialize)]
struct ReplayStats {
    accepted: usize,
    duplicate: usize,
    irrelevant: usize,
    malformed: usize,
    scope_unavailable: usize,
    unparsable: usize,
}

impl ReplayStats {
    fn record(&mut self, outcome: &IngestOutcome) {
        match outcome {
            IngestOutcome::Accepted(_) => self.accepted += 1,
            IngestOutcome::Duplicate => self.duplicate += 1,
            IngestOutcome::Irrelevant => self.irrelevant += 1,
            IngestOutcome::Malformed(_) => self.malformed += 1,
            IngestOutcome::ScopeUnavailable => self.scope_unavailable += 1,
        }
    }
}

/// Log hub facts the way a UI dispatcher would present them.
fn spawn_dispatcher(mut rx: broadcast::Receiver<HubEvent>) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(HubEvent::Accepted {
                    notification,
                    route,
                }) => {
                    info!(
                        severity = %notification.severity,
                        category = %notification.category,
                        route = route.as_deref().unwrap_or("-"),
                        "{}",
                        notification.message
                    );
                }
                Ok(HubEvent::SyncFailed {
                    operation, message, ..
                }) => {
                    warn!(operation = %operation, "Sync failed: {}", message);
                }
                Ok(event) => debug!(event = event.event_type(), "Hub event"),
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!("Dispatcher lagged by {} events", n);
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    })
}
