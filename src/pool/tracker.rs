use crate::entity::keys::SERVICE_UP;
use crate::entity::{Entity, Group, MembershipEvent};
use crate::error::Result;
use crate::pool::reconciler::ServerPoolReconciler;
use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::{Arc, Mutex};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Receives membership callbacks from a [`MembershipTracker`].
#[async_trait]
pub trait MembershipListener: Send + Sync {
    async fn on_member_added(&self, member: &Entity) -> Result<()>;

    async fn on_member_removed(&self, member: &Entity) -> Result<()>;

    async fn on_member_changed(&self, member: &Entity) -> Result<()>;
}

#[async_trait]
impl MembershipListener for ServerPoolReconciler {
    async fn on_member_added(&self, member: &Entity) -> Result<()> {
        ServerPoolReconciler::on_member_added(self, member).await
    }

    async fn on_member_removed(&self, member: &Entity) -> Result<()> {
        ServerPoolReconciler::on_member_removed(self, member).await
    }

    async fn on_member_changed(&self, member: &Entity) -> Result<()> {
        ServerPoolReconciler::on_member_changed(self, member).await
    }
}

/// Mirrors membership of a source group into a target group through a mapping.
///
/// Each member added to the source contributes the entity returned by `derive` to the
/// target; removal takes it out again.
#[derive(Clone)]
pub struct DerivedMembership {
    target: Group,
    derive: Arc<dyn Fn(&Entity) -> Option<Entity> + Send + Sync>,
}

impl DerivedMembership {
    pub fn new<F>(target: Group, derive: F) -> Self
    where
        F: Fn(&Entity) -> Option<Entity> + Send + Sync + 'static,
    {
        Self {
            target,
            derive: Arc::new(derive),
        }
    }

    /// Source members join the target group themselves.
    pub fn identity(target: Group) -> Self {
        Self::new(target, |member| Some(member.clone()))
    }

    pub fn target(&self) -> &Group {
        &self.target
    }

    /// Adds the entity derived from `member` to the target group.
    pub fn mirror(&self, member: &Entity) {
        if let Some(derived) = (self.derive)(member) {
            self.target.add_member(&derived);
        }
    }
}

impl fmt::Debug for DerivedMembership {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DerivedMembership")
            .field("target", &self.target)
            .finish()
    }
}

#[async_trait]
impl MembershipListener for DerivedMembership {
    async fn on_member_added(&self, member: &Entity) -> Result<()> {
        self.mirror(member);
        Ok(())
    }

    async fn on_member_removed(&self, member: &Entity) -> Result<()> {
        if let Some(derived) = (self.derive)(member) {
            self.target.remove_member(&derived);
        }
        Ok(())
    }

    async fn on_member_changed(&self, _member: &Entity) -> Result<()> {
        Ok(())
    }
}

struct Attachment {
    group: Group,
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

/// Policy that follows a group and forwards membership and member-attribute changes to a
/// listener.
///
/// All callbacks for one tracker come from a single task, so events about the same member
/// are delivered in the order they happened. Members present when the tracker attaches
/// are watched but not announced; callers rescan the group themselves.
pub struct MembershipTracker {
    name: String,
    listener: Arc<dyn MembershipListener>,
    tracked_attributes: Arc<Vec<String>>,
    attachment: Mutex<Option<Attachment>>,
}

impl MembershipTracker {
    /// Tracker that reports a member as changed when `service.isUp` changes.
    pub fn new(name: impl Into<String>, listener: Arc<dyn MembershipListener>) -> Self {
        Self::with_attributes(name, listener, vec![SERVICE_UP.name().to_string()])
    }

    pub fn with_attributes(
        name: impl Into<String>,
        listener: Arc<dyn MembershipListener>,
        tracked_attributes: Vec<String>,
    ) -> Self {
        Self {
            name: name.into(),
            listener,
            tracked_attributes: Arc::new(tracked_attributes),
            attachment: Mutex::new(None),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn group(&self) -> Option<Group> {
        self.attachment
            .lock()
            .unwrap_or_else(|err| err.into_inner())
            .as_ref()
            .map(|attachment| attachment.group.clone())
    }

    pub fn is_attached(&self) -> bool {
        self.attachment
            .lock()
            .unwrap_or_else(|err| err.into_inner())
            .as_ref()
            .map(|attachment| !attachment.handle.is_finished())
            .unwrap_or(false)
    }

    /// Starts following `group`, detaching from any group followed before.
    ///
    /// Subscriptions are taken before this returns, so no change made afterwards is missed.
    pub fn set_group(&self, group: Group, shutdown: &CancellationToken) {
        self.reset();

        let cancel = shutdown.child_token();
        let membership = group.subscribe();
        let (changed_tx, changed_rx) = mpsc::unbounded_channel();

        let mut watchers = HashMap::new();
        for member in group.members() {
            let token = spawn_watcher(
                member.clone(),
                Arc::clone(&self.tracked_attributes),
                changed_tx.clone(),
                cancel.child_token(),
            );
            watchers.insert(member, token);
        }

        let worker = TrackerLoop {
            name: self.name.clone(),
            group: group.clone(),
            listener: Arc::clone(&self.listener),
            tracked_attributes: Arc::clone(&self.tracked_attributes),
            cancel: cancel.clone(),
            changed_tx,
            watchers,
        };
        let handle = tokio::spawn(worker.run(membership, changed_rx));

        tracing::info!(tracker = %self.name, group = %group.entity(), "membership tracker attached");
        *self.attachment.lock().unwrap_or_else(|err| err.into_inner()) = Some(Attachment {
            group,
            cancel,
            handle,
        });
    }

    /// Detaches from the current group, if any.
    pub fn reset(&self) {
        let previous = self
            .attachment
            .lock()
            .unwrap_or_else(|err| err.into_inner())
            .take();
        if let Some(attachment) = previous {
            attachment.cancel.cancel();
            tracing::info!(
                tracker = %self.name,
                group = %attachment.group.entity(),
                "membership tracker detached"
            );
        }
    }
}

impl Drop for MembershipTracker {
    fn drop(&mut self) {
        if let Some(attachment) = self
            .attachment
            .get_mut()
            .unwrap_or_else(|err| err.into_inner())
            .take()
        {
            attachment.cancel.cancel();
        }
    }
}

struct TrackerLoop {
    name: String,
    group: Group,
    listener: Arc<dyn MembershipListener>,
    tracked_attributes: Arc<Vec<String>>,
    cancel: CancellationToken,
    changed_tx: mpsc::UnboundedSender<Entity>,
    watchers: HashMap<Entity, CancellationToken>,
}

impl TrackerLoop {
    async fn run(
        mut self,
        mut membership: tokio::sync::broadcast::Receiver<MembershipEvent>,
        mut changed_rx: mpsc::UnboundedReceiver<Entity>,
    ) {
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                event = membership.recv() => match event {
                    Ok(MembershipEvent::Added(member)) => self.added(member).await,
                    Ok(MembershipEvent::Removed(member)) => self.removed(member).await,
                    Err(RecvError::Lagged(skipped)) => {
                        tracing::warn!(tracker = %self.name, skipped, "membership events lagged; resynchronising");
                        self.resync().await;
                    }
                    Err(RecvError::Closed) => break,
                },
                Some(member) = changed_rx.recv() => {
                    if self.watchers.contains_key(&member) {
                        self.deliver("changed", &member, self.listener.on_member_changed(&member).await);
                    }
                }
            }
        }

        for token in self.watchers.values() {
            token.cancel();
        }
    }

    async fn added(&mut self, member: Entity) {
        if !self.watchers.contains_key(&member) {
            let token = spawn_watcher(
                member.clone(),
                Arc::clone(&self.tracked_attributes),
                self.changed_tx.clone(),
                self.cancel.child_token(),
            );
            self.watchers.insert(member.clone(), token);
        }
        let outcome = self.listener.on_member_added(&member).await;
        self.deliver("added", &member, outcome);
    }

    async fn removed(&mut self, member: Entity) {
        if let Some(token) = self.watchers.remove(&member) {
            token.cancel();
        }
        let outcome = self.listener.on_member_removed(&member).await;
        self.deliver("removed", &member, outcome);
    }

    async fn resync(&mut self) {
        let current: HashSet<Entity> = self.group.members().into_iter().collect();
        let departed: Vec<Entity> = self
            .watchers
            .keys()
            .filter(|member| !current.contains(*member))
            .cloned()
            .collect();
        for member in departed {
            self.removed(member).await;
        }
        for member in current {
            if self.watchers.contains_key(&member) {
                let outcome = self.listener.on_member_changed(&member).await;
                self.deliver("changed", &member, outcome);
            } else {
                self.added(member).await;
            }
        }
    }

    fn deliver(&self, kind: &str, member: &Entity, outcome: Result<()>) {
        if let Err(err) = outcome {
            tracing::error!(
                tracker = %self.name,
                member = %member,
                event = kind,
                error = %err,
                "membership listener failed"
            );
        }
    }
}

fn spawn_watcher(
    member: Entity,
    tracked_attributes: Arc<Vec<String>>,
    changed_tx: mpsc::UnboundedSender<Entity>,
    cancel: CancellationToken,
) -> CancellationToken {
    let mut changes = member.attributes().subscribe();
    let token = cancel.clone();
    tokio::spawn(async move {
        loop {
            let relevant = tokio::select! {
                _ = cancel.cancelled() => break,
                received = changes.recv() => match received {
                    Ok(change) => tracked_attributes.iter().any(|name| *name == change.name),
                    Err(RecvError::Lagged(_)) => true,
                    Err(RecvError::Closed) => break,
                },
            };
            if relevant && changed_tx.send(member.clone()).is_err() {
                break;
            }
        }
    });
    token
}
