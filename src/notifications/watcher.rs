//! Periodic refresh of the unread count while it is on screen.

use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{self, MissedTickBehavior};
use tracing::debug;

use super::NotificationSync;

/// Refreshes the unread count on start, every `period` while visible, and
/// immediately when the view becomes visible again. Hidden views are not
/// polled. Dropping the watcher stops it.
pub struct UnreadWatcher {
  visible: watch::Sender<bool>,
  task: JoinHandle<()>,
}

impl UnreadWatcher {
  pub fn start(sync: NotificationSync, period: Duration) -> Self {
    let (visible, mut visibility) = watch::channel(true);

    let task = tokio::spawn(async move {
      let mut ticker = time::interval(period);
      ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

      loop {
        tokio::select! {
          // The first tick completes at once: refresh on start
          _ = ticker.tick() => {
            let is_visible = *visibility.borrow();
            if is_visible {
              refresh(&sync).await;
            }
          }
          changed = visibility.changed() => {
            if changed.is_err() {
              break;
            }
            let is_visible = *visibility.borrow_and_update();
            if is_visible {
              refresh(&sync).await;
              ticker.reset();
            }
          }
        }
      }
    });

    Self { visible, task }
  }

  /// Report whether the unread badge is currently visible.
  pub fn set_visible(&self, visible: bool) {
    self.visible.send_if_modified(|current| {
      if *current == visible {
        return false;
      }
      *current = visible;
      true
    });
  }

  pub fn is_visible(&self) -> bool {
    *self.visible.borrow()
  }
}

async fn refresh(sync: &NotificationSync) {
  match sync.refresh_unread().await {
    Ok(unread) => debug!(count = unread.count, "unread count refreshed"),
    Err(err) => debug!(error = %err, "unread refresh failed"),
  }
}

impl Drop for UnreadWatcher {
  fn drop(&mut self) {
    self.task.abort();
  }
}
