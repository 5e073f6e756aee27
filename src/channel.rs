//! Single-channel occupancy for a connector.
//!
//! `ChannelSwitcher` is the only component that moves a connector between
//! user channels. Switches are serialized; the current channel is published
//! only after the new channel is joined, so readers see either the old
//! channel, no channel, or the new one.

use std::sync::{Arc, Mutex};

use arc_swap::ArcSwapOption;

use crate::connector::MessageConnector;
use crate::error::{BusResult, LockResultExt};

const LOG_TARGET: &str = "devbus::channel";

pub struct ChannelSwitcher {
    connector: MessageConnector,
    current: ArcSwapOption<String>,
    switching: Mutex<()>,
}

impl ChannelSwitcher {
    pub fn new(connector: MessageConnector) -> Self {
        Self {
            connector,
            current: ArcSwapOption::empty(),
            switching: Mutex::new(()),
        }
    }

    pub fn connector(&self) -> &MessageConnector {
        &self.connector
    }

    /// The channel currently occupied, if any.
    pub fn channel(&self) -> Option<Arc<String>> {
        self.current.load_full()
    }

    /// Move the connector to `channel`, or off any channel for `None`.
    ///
    /// Leaving the previous channel is not awaited; joining the new one
    /// blocks until the broker confirmed it. If joining fails the connector
    /// ends up on no channel and the error is returned. Switching to the
    /// channel already occupied does nothing.
    pub fn switch_to_channel(&self, channel: Option<&str>) -> BusResult<()> {
        let _guard = self.switching.lock().recover_poison("ChannelSwitcher::switch_to_channel");

        let previous = self.current.load_full();
        if previous.as_deref().map(String::as_str) == channel {
            log::debug!(target: LOG_TARGET, "Already on channel {:?}", channel);
            return Ok(());
        }

        if let Some(previous) = previous {
            log::debug!(target: LOG_TARGET, "Leaving channel {}", previous);
            self.current.store(None);
            // Completion is only logged; joining the next channel does not wait for it.
            self.connector
                .disconnect_from_channel(&previous)
                .rejected(move |e| {
                    log::warn!(target: LOG_TARGET, "Leaving channel {} failed: {}", previous, e);
                });
        }

        let Some(channel) = channel else {
            return Ok(());
        };
        self.connector.connect_to_channel_sync(channel)?;
        self.current.store(Some(Arc::new(channel.to_string())));
        log::info!(target: LOG_TARGET, "Switched to channel {}", channel);
        Ok(())
    }
}
