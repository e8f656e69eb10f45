// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Tracked subscription intent.
//!
//! The registry's filter set is what the broker should be subscribed to.
//! Caller-facing subscribe and unsubscribe record the change and, when a
//! live session is available, apply it on the wire. Changes made without a
//! live session are also kept as pending additions and removals. After every
//! (re)connect the connection supervisor calls [`SubscriptionRegistry::resync`]
//! to bring the broker back in line with the set.
//!
//! Both paths hold the same async lock, so a subscribe racing a reconnect
//! either lands in the set before the resync reads it or sees the session
//! already marked connected and goes to the wire itself.

use std::collections::BTreeSet;

use tokio::sync::Mutex;

use crate::error::{SubscribeError, TransportError};
use crate::event::{ClientEvent, EventBus};
use crate::topic::TopicFilter;
use crate::transport::{Link, QoS};

/// Outcome of replaying the tracked filters on a new session.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ResyncReport {
    /// Filters the broker accepted.
    pub subscribed: usize,
    /// Filters removed on the broker because they were unsubscribed offline.
    pub unsubscribed: usize,
    /// Filters the broker refused, with the reason.
    pub failures: Vec<(TopicFilter, TransportError)>,
}

impl ResyncReport {
    /// Returns `true` if every filter was restored.
    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.failures.is_empty()
    }
}

/// How much of the registry a resync pushes to the broker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ResyncScope {
    /// Every tracked filter. Used when the broker session starts empty.
    Full,
    /// Only changes made while no session was live. Used when the broker
    /// kept the previous session.
    Pending,
}

#[derive(Debug, Default)]
struct Filters {
    active: BTreeSet<TopicFilter>,
    added: BTreeSet<TopicFilter>,
    removed: BTreeSet<TopicFilter>,
}

pub(crate) struct SubscriptionRegistry {
    filters: Mutex<Filters>,
    qos: QoS,
    events: EventBus,
}

impl SubscriptionRegistry {
    pub(crate) fn new(qos: QoS, events: EventBus) -> Self {
        Self {
            filters: Mutex::new(Filters::default()),
            qos,
            events,
        }
    }

    /// Records `filter` and subscribes on the wire if `link` yields a live session.
    ///
    /// `link` is evaluated under the registry lock. A filter already tracked
    /// is subscribed again. On error a filter that was not tracked before is
    /// not recorded.
    pub(crate) async fn subscribe<L: Link>(
        &self,
        filter: TopicFilter,
        link: impl FnOnce() -> Option<L> + Send,
    ) -> Result<(), SubscribeError> {
        filter.validate()?;

        let mut filters = self.filters.lock().await;
        let inserted = filters.active.insert(filter.clone());

        let Some(link) = link() else {
            filters.removed.remove(&filter);
            filters.added.insert(filter.clone());
            tracing::debug!(filter = %filter, "Subscription recorded, applied on next connect");
            return Ok(());
        };

        match link.subscribe(&filter.to_topic_string(), self.qos).await {
            Ok(()) => {
                filters.removed.remove(&filter);
                tracing::debug!(filter = %filter, "Subscribed");
                Ok(())
            }
            Err(e) => {
                if inserted {
                    filters.active.remove(&filter);
                }
                tracing::warn!(filter = %filter, error = %e, "Subscribe failed");
                Err(SubscribeError::from_transport(e))
            }
        }
    }

    /// Forgets `filter` and unsubscribes on the wire if `link` yields a live session.
    ///
    /// Returns whether the filter was tracked.
    pub(crate) async fn unsubscribe<L: Link>(
        &self,
        filter: &TopicFilter,
        link: impl FnOnce() -> Option<L> + Send,
    ) -> Result<bool, SubscribeError> {
        let mut filters = self.filters.lock().await;
        let removed = filters.active.remove(filter);
        filters.added.remove(filter);

        let Some(link) = link() else {
            if removed {
                filters.removed.insert(filter.clone());
                tracing::debug!(filter = %filter, "Unsubscribe recorded, applied on next connect");
            }
            return Ok(removed);
        };

        link.unsubscribe(&filter.to_topic_string())
            .await
            .map_err(SubscribeError::from_transport)?;
        tracing::debug!(filter = %filter, "Unsubscribed");
        Ok(removed)
    }

    /// Brings the broker in line with the registry on a fresh session, then
    /// runs `on_complete` before releasing the lock.
    ///
    /// Filters unsubscribed while offline are removed first. Then the
    /// filters in `scope` go out as one batch. If the batch is refused each
    /// filter is retried on its own so one bad filter cannot block the rest.
    /// Every filter that still fails is reported as
    /// [`ClientEvent::SubscriptionFailed`].
    pub(crate) async fn resync<L: Link>(
        &self,
        link: &L,
        scope: ResyncScope,
        on_complete: impl FnOnce(&ResyncReport) + Send,
    ) -> ResyncReport {
        let mut filters = self.filters.lock().await;
        let mut report = ResyncReport::default();

        for filter in std::mem::take(&mut filters.removed) {
            match link.unsubscribe(&filter.to_topic_string()).await {
                Ok(()) => report.unsubscribed += 1,
                Err(e) => {
                    tracing::warn!(filter = %filter, error = %e, "Deferred unsubscribe failed");
                }
            }
        }

        let added = std::mem::take(&mut filters.added);
        let targets: Vec<TopicFilter> = match scope {
            ResyncScope::Full => filters.active.iter().cloned().collect(),
            ResyncScope::Pending => added
                .into_iter()
                .filter(|filter| filters.active.contains(filter))
                .collect(),
        };

        if !targets.is_empty() {
            let topics: Vec<String> = targets.iter().map(TopicFilter::to_topic_string).collect();
            match link.subscribe_many(&topics, self.qos).await {
                Ok(()) => report.subscribed = topics.len(),
                Err(batch_error) => {
                    tracing::debug!(
                        error = %batch_error,
                        count = topics.len(),
                        "Batch resubscribe refused, retrying one by one"
                    );
                    for (filter, topic) in targets.iter().zip(&topics) {
                        match link.subscribe(topic, self.qos).await {
                            Ok(()) => report.subscribed += 1,
                            Err(e) => {
                                tracing::warn!(filter = %filter, error = %e, "Resubscribe failed");
                                self.report_failure(filter.clone(), e.clone());
                                report.failures.push((filter.clone(), e));
                            }
                        }
                    }
                }
            }
        }

        on_complete(&report);
        report
    }

    /// Reports a broker refusal that arrived after the subscribe call
    /// returned. Returns `false` if `topic` is not a tracked filter.
    ///
    /// The filter stays recorded and is offered again on the next resync.
    pub(crate) async fn refused(&self, topic: &str) -> bool {
        let filter = {
            let filters = self.filters.lock().await;
            filters
                .active
                .iter()
                .find(|filter| filter.to_topic_string() == topic)
                .cloned()
        };
        let Some(filter) = filter else {
            tracing::debug!(topic, "Broker refused an untracked filter");
            return false;
        };
        tracing::warn!(filter = %filter, "Broker refused subscription");
        self.report_failure(
            filter,
            TransportError::Rejected("subscription refused by broker".to_string()),
        );
        true
    }

    fn report_failure(&self, filter: TopicFilter, error: TransportError) {
        self.events
            .publish(ClientEvent::SubscriptionFailed { filter, error });
    }

    pub(crate) async fn filters(&self) -> Vec<TopicFilter> {
        self.filters.lock().await.active.iter().cloned().collect()
    }

    pub(crate) async fn contains(&self, filter: &TopicFilter) -> bool {
        self.filters.lock().await.active.contains(filter)
    }
}
