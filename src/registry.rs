//! Lifecycle management for a set of components.
//!
//! The registry announces every component to Home Assistant, waits for the
//! hub to process the discovery documents, marks components available,
//! pushes periodic state updates and tears everything down again.

use crate::component::Component;
use crate::discovery::HubConfig;
use crate::error::{HaMqttError, Result};
use crate::topic::SharedTopic;
use log::{error, info, warn};
use std::sync::Arc;
use std::time::Duration;

/// Time given to the hub to process discovery documents before
/// availability is announced.
pub const DEFAULT_SETTLE_DELAY: Duration = Duration::from_secs(1);

pub struct Registry {
    components: Vec<(Component, bool)>,
    shared_topics: Vec<Arc<SharedTopic>>,
    settle_delay: Duration,
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

impl Registry {
    pub fn new() -> Self {
        Self {
            components: Vec::new(),
            shared_topics: Vec::new(),
            settle_delay: DEFAULT_SETTLE_DELAY,
        }
    }

    pub fn with_settle_delay(mut self, settle_delay: Duration) -> Self {
        self.settle_delay = settle_delay;
        self
    }

    /// Register a component. With `send_updates == false` it is announced
    /// and exported but skipped by [`Registry::send_updates`].
    pub fn add_component(&mut self, component: impl Into<Component>, send_updates: bool) {
        self.components.push((component.into(), send_updates));
    }

    pub fn add_components<C: Into<Component>>(
        &mut self,
        components: impl IntoIterator<Item = C>,
        send_updates: bool,
    ) {
        for component in components {
            self.add_component(component, send_updates);
        }
    }

    pub fn add_shared_topic(&mut self, topic: &Arc<SharedTopic>) {
        self.shared_topics.push(topic.clone());
    }

    pub fn add_shared_topics<'a>(&mut self, topics: impl IntoIterator<Item = &'a Arc<SharedTopic>>) {
        for topic in topics {
            self.add_shared_topic(topic);
        }
    }

    pub fn components(&self) -> impl Iterator<Item = &Component> {
        self.components.iter().map(|(component, _)| component)
    }

    pub fn len(&self) -> usize {
        self.components.len()
    }

    pub fn is_empty(&self) -> bool {
        self.components.is_empty()
    }

    /// Push the state of every updating component, then flush every shared
    /// topic.
    ///
    /// A failing component or topic does not stop the others; the failures
    /// are logged and summarised in the returned error.
    pub fn send_updates(&self) -> Result<()> {
        let mut failed = 0;
        let mut total = 0;

        for (component, _) in self.components.iter().filter(|(_, send)| *send) {
            total += 1;
            if let Err(e) = component.send_update() {
                failed += 1;
                error!(
                    "[Registry] Failed to update {}: {}",
                    component.entity().id(),
                    e
                );
            }
        }

        for topic in &self.shared_topics {
            total += 1;
            if let Err(e) = topic.publish(None) {
                failed += 1;
                error!("[Registry] Failed to flush {}: {}", topic.name(), e);
            }
        }

        if failed > 0 {
            return Err(HaMqttError::UpdatesFailed { failed, total });
        }
        Ok(())
    }

    /// Hub configuration for every registered component as YAML.
    pub fn create_config(&self) -> Result<String> {
        HubConfig::from_components(self.components()).to_yaml()
    }

    /// Announce all components, wait for the hub to settle, then mark them
    /// available.
    ///
    /// The teardown guard is armed before the first announcement. If
    /// announcing fails part-way, or the returned future is dropped during
    /// the settle delay, the components announced so far are removed again.
    pub async fn start(&self) -> Result<Started<'_>> {
        info!("[Registry] Starting {} components", self.components.len());
        let mut started = Started {
            registry: self,
            announced: 0,
            online: false,
        };

        for (component, _) in &self.components {
            if let Err(e) = component.start() {
                error!(
                    "[Registry] Failed to announce {}: {}",
                    component.entity().id(),
                    e
                );
                return Err(e);
            }
            started.announced += 1;
        }

        tokio::time::sleep(self.settle_delay).await;

        started.online = true;
        for (component, _) in &self.components {
            if let Err(e) = component.available_set(true) {
                error!(
                    "[Registry] Failed to mark {} available: {}",
                    component.entity().id(),
                    e
                );
                return Err(e);
            }
        }

        info!("[Registry] All components available");
        Ok(started)
    }
}

/// Scope guard returned by [`Registry::start`].
///
/// Stopping or dropping it marks the components offline and removes them
/// from the hub, once.
#[must_use = "dropping the guard stops the registry immediately"]
pub struct Started<'a> {
    registry: &'a Registry,
    announced: usize,
    online: bool,
}

impl Started<'_> {
    pub fn registry(&self) -> &Registry {
        self.registry
    }

    /// Mark every component offline and remove it from the hub.
    ///
    /// Errors are logged; teardown continues with the next component.
    pub fn stop(self) {
        drop(self);
    }
}

impl Drop for Started<'_> {
    fn drop(&mut self) {
        let components = &self.registry.components[..self.announced];
        info!("[Registry] Stopping {} components", components.len());

        for (component, _) in components {
            if self.online
                && let Err(e) = component.available_set(false)
            {
                warn!(
                    "[Registry] Failed to mark {} offline: {}",
                    component.entity().id(),
                    e
                );
            }
            if let Err(e) = component.stop() {
                warn!(
                    "[Registry] Failed to remove {}: {}",
                    component.entity().id(),
                    e
                );
            }
        }
    }
}
