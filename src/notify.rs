//! Push notification rendering and click routing.

use serde::Serialize;
use std::io::Write;
use std::sync::Arc;
use tracing::{debug, info, warn};
use url::Url;

use crate::config::NotificationConfig;

pub const ACTION_EXPLORE: &str = "explore";
pub const ACTION_CLOSE: &str = "close";

const NOTIFICATION_TAG: &str = "outpost-push";

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NotificationAction {
  pub action: String,
  pub title: String,
}

/// A rendered, ephemeral notification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Notification {
  pub tag: String,
  pub title: String,
  pub body: String,
  pub icon: String,
  pub badge: String,
  pub vibrate: Vec<u32>,
  pub actions: Vec<NotificationAction>,
}

/// Where a notification click led.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClickRoute {
  /// Opened (or focused) an application view
  Opened(Url),
  /// Notification closed, nothing opened
  Dismissed,
}

/// Platform surface that displays notifications and application views.
pub trait NotificationHost: Send + Sync {
  fn show(&self, notification: &Notification);
  fn close(&self, tag: &str);
  /// Focus an existing view of `url`, or open a new one.
  fn open_view(&self, url: &Url);
}

/// Host that writes notifications and opened views to stdout as JSON lines.
pub struct ConsoleHost;

impl ConsoleHost {
  fn emit(value: serde_json::Value) {
    let mut stdout = std::io::stdout().lock();
    if let Err(e) = writeln!(stdout, "{}", value) {
      warn!("failed to write to stdout: {}", e);
    }
  }
}

impl NotificationHost for ConsoleHost {
  fn show(&self, notification: &Notification) {
    Self::emit(serde_json::json!({ "notification": notification }));
  }

  fn close(&self, tag: &str) {
    Self::emit(serde_json::json!({ "closed": tag }));
  }

  fn open_view(&self, url: &Url) {
    Self::emit(serde_json::json!({ "open": url.as_str() }));
  }
}

pub struct NotificationRouter {
  config: NotificationConfig,
  details_url: Url,
  default_url: Url,
  host: Arc<dyn NotificationHost>,
}

impl NotificationRouter {
  pub fn new(
    config: NotificationConfig,
    details_url: Url,
    default_url: Url,
    host: Arc<dyn NotificationHost>,
  ) -> Self {
    Self {
      config,
      details_url,
      default_url,
      host,
    }
  }

  /// Render a push payload and hand it to the host. Fire-and-forget.
  pub fn on_push(&self, payload: Option<&str>) -> Notification {
    // Blank payloads get the default; any other text is shown verbatim
    let body = payload
      .filter(|text| !text.trim().is_empty())
      .unwrap_or(self.config.default_body.as_str())
      .to_string();

    let notification = Notification {
      tag: NOTIFICATION_TAG.to_string(),
      title: self.config.title.clone(),
      body,
      icon: self.config.icon.clone(),
      badge: self.config.badge.clone(),
      vibrate: vec![100, 50, 100],
      actions: vec![
        NotificationAction {
          action: ACTION_EXPLORE.to_string(),
          title: "View details".to_string(),
        },
        NotificationAction {
          action: ACTION_CLOSE.to_string(),
          title: "Close".to_string(),
        },
      ],
    };

    info!(body = %notification.body, "showing notification");
    self.host.show(&notification);
    notification
  }

  /// Close the notification and route the click. Exactly one branch fires.
  pub fn on_click(&self, action: Option<&str>) -> ClickRoute {
    self.host.close(NOTIFICATION_TAG);

    let target = match action.filter(|a| !a.is_empty()) {
      Some(ACTION_EXPLORE) => &self.details_url,
      Some(ACTION_CLOSE) => {
        debug!("notification dismissed");
        return ClickRoute::Dismissed;
      }
      Some(other) => {
        warn!(action = other, "unknown notification action, opening default view");
        &self.default_url
      }
      None => &self.default_url,
    };

    info!(url = %target, "opening view from notification");
    self.host.open_view(target);
    ClickRoute::Opened(target.clone())
  }
}
