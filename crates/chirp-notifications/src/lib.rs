//! Turns session events into host-platform notifications.
//!
//! The only behavior that depends on whether the app is frontmost lives
//! here: a presence-subscription request is surfaced as an in-process alert
//! while the app is in the foreground, and as a local notification when it
//! is backgrounded. The foreground/background question is answered by an
//! injected [`ActivityState`], never by a platform call, so the manager
//! stays testable.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tracing::{debug, error, info, warn};

use chirp_core::error::EventBusError;
use chirp_core::event::{Event, EventBus, EventPayload};

#[derive(Debug, thiserror::Error)]
pub enum NotificationError {
    #[error("notification dispatch failed: {0}")]
    DispatchFailed(String),

    #[error("event bus error: {0}")]
    EventBus(#[from] EventBusError),
}

/// Whether the application is currently frontmost.
pub trait ActivityState: Send + Sync + 'static {
    fn is_foreground(&self) -> bool;
}

/// Shared flag the UI shell flips as the app gains and loses focus.
#[derive(Debug)]
pub struct AppActivity(AtomicBool);

impl AppActivity {
    pub fn new(foreground: bool) -> Self {
        Self(AtomicBool::new(foreground))
    }

    pub fn set_foreground(&self, foreground: bool) {
        self.0.store(foreground, Ordering::Relaxed);
    }
}

impl Default for AppActivity {
    fn default() -> Self {
        Self::new(true)
    }
}

impl ActivityState for AppActivity {
    fn is_foreground(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }
}

/// What gets handed to the host platform's notification service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NotificationRequest {
    pub title: String,
    pub body: String,
    pub category: String,
    pub request_id: String,
}

pub trait NotificationDispatcher: Send + Sync {
    fn dispatch(&self, request: NotificationRequest) -> Result<(), NotificationError>;
}

#[cfg(feature = "native")]
#[derive(Debug, Default)]
struct NativeDispatcher;

#[cfg(feature = "native")]
impl NotificationDispatcher for NativeDispatcher {
    fn dispatch(&self, request: NotificationRequest) -> Result<(), NotificationError> {
        notify_rust::Notification::new()
            .summary(&request.title)
            .body(&request.body)
            .show()
            .map_err(|error| NotificationError::DispatchFailed(error.to_string()))?;
        Ok(())
    }
}

const SUBSCRIPTION_CATEGORY: &str = "subscription.request";

pub struct NotificationManager {
    event_bus: Arc<dyn EventBus>,
    activity: Arc<dyn ActivityState>,
    dispatcher: Arc<dyn NotificationDispatcher>,
    enabled: bool,
}

impl NotificationManager {
    #[cfg(feature = "native")]
    pub fn new(
        event_bus: Arc<dyn EventBus>,
        activity: Arc<dyn ActivityState>,
        enabled: bool,
    ) -> Self {
        Self::with_dispatcher(event_bus, activity, Arc::new(NativeDispatcher), enabled)
    }

    pub fn with_dispatcher(
        event_bus: Arc<dyn EventBus>,
        activity: Arc<dyn ActivityState>,
        dispatcher: Arc<dyn NotificationDispatcher>,
        enabled: bool,
    ) -> Self {
        Self {
            event_bus,
            activity,
            dispatcher,
            enabled,
        }
    }

    /// Consume session events until the bus closes.
    pub async fn serve(self: Arc<Self>) -> Result<(), NotificationError> {
        let mut subscription = self.event_bus.subscribe("xmpp.**")?;

        loop {
            match subscription.recv().await {
                Ok(event) => self.handle_event(&event),
                Err(EventBusError::ChannelClosed) => {
                    debug!("event bus closed, notification manager stopping");
                    return Ok(());
                }
                Err(EventBusError::Lagged(missed)) => {
                    warn!(missed, "notification manager lagged, events dropped");
                }
                Err(error) => return Err(error.into()),
            }
        }
    }

    pub fn handle_event(&self, event: &Event) {
        if let EventPayload::SubscriptionRequest { from, display_name } = &event.payload {
            self.on_subscription_request(event, from, display_name);
        }
    }

    fn on_subscription_request(&self, event: &Event, from: &str, display_name: &str) {
        if !self.enabled {
            return;
        }

        let body = if display_name != from {
            format!("Buddy request from {display_name} <{from}>")
        } else {
            format!("Buddy request from {display_name}")
        };

        if self.activity.is_foreground() {
            // Frontmost: an in-process alert is enough.
            info!(title = %display_name, %body, "subscription request");
            return;
        }

        let request = NotificationRequest {
            title: display_name.to_string(),
            body,
            category: SUBSCRIPTION_CATEGORY.to_string(),
            request_id: event.id.to_string(),
        };
        if let Err(error) = self.dispatcher.dispatch(request) {
            error!(%error, "failed to dispatch local notification");
        }
    }
}
