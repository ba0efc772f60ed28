use anyhow::Result;
use serde_json::json;

use crate::events::DomainEvent;
use crate::logging::{log, obj, v_str, Domain, Level};
use crate::report::{ErrorReport, ErrorReporter};

pub trait NotificationService {
    fn notify(&self, event: &DomainEvent) -> Result<()>;
}

/// Default notifier: records each event as a log line.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogNotifier;

impl NotificationService for LogNotifier {
    fn notify(&self, event: &DomainEvent) -> Result<()> {
        log(
            Level::Info,
            Domain::Notify,
            event.name(),
            obj(&[
                ("user_id", json!(event.user_id())),
                ("payload", serde_json::to_value(event)?),
            ]),
        );
        Ok(())
    }
}

/// Delivers every event, fire-and-forget. A failing notifier is reported
/// and skipped; the originating operation has already completed.
/// Returns the number of events delivered.
pub fn dispatch(
    events: &[DomainEvent],
    notifier: &dyn NotificationService,
    reporter: &dyn ErrorReporter,
) -> usize {
    let mut delivered = 0;
    for event in events {
        match notifier.notify(event) {
            Ok(()) => delivered += 1,
            Err(err) => {
                log(
                    Level::Warn,
                    Domain::Notify,
                    "notify_failed",
                    obj(&[("event_name", v_str(event.name())), ("error", v_str(&err.to_string()))]),
                );
                reporter.report(
                    &ErrorReport::new("notification_failed", err.to_string())
                        .with("event", v_str(event.name()))
                        .with("user_id", json!(event.user_id())),
                );
            }
        }
    }
    delivered
}
