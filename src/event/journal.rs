use async_trait::async_trait;
use chrono::Utc;
use futures::FutureExt;
use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use std::fmt::{self, Display};
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use uuid::Uuid;

use super::store::EventStore;
use super::{
    AllowedPermission, CancelInfo, EventData, EventError, Filter, Kind, KindType, LogEntry, Opts,
    Owner, Target, TargetType, ThrottlingSpec,
};
use crate::auth::Token;
use crate::config::EventConfig;
use crate::metrics;
use crate::permission::PermissionError;

const LOCK_RETRY_INTERVAL: Duration = Duration::from_millis(100);
const LIST_BATCH: usize = 200;

/// Sink receiving a copy of every byte written to an event.
pub trait LogWriter: Send + Sync {
    fn write_log(&self, data: &[u8]);
}

/// Called once for every event that reaches its terminal state.
#[async_trait]
pub trait EventHook: Send + Sync {
    async fn on_done(&self, evt: &EventData);
}

#[derive(Debug, Clone)]
pub struct JournalSettings {
    pub lock_expire: Duration,
    pub lock_update_interval: Duration,
    pub app_lock_retry: Duration,
    pub throttling: Vec<ThrottlingSpec>,
}

impl From<&EventConfig> for JournalSettings {
    fn from(config: &EventConfig) -> Self {
        Self {
            lock_expire: Duration::from_secs(config.lock_expire_secs.max(1)),
            lock_update_interval: Duration::from_secs(config.lock_update_secs.max(1)),
            app_lock_retry: Duration::from_millis(config.app_lock_retry_millis),
            throttling: config.throttling.clone(),
        }
    }
}

struct Shared {
    store: Arc<dyn EventStore>,
    settings: JournalSettings,
    hooks: RwLock<Vec<Arc<dyn EventHook>>>,
}

impl Shared {
    async fn run_hooks(&self, evt: &EventData) {
        let hooks: Vec<Arc<dyn EventHook>> = self.hooks.read().clone();
        for hook in hooks {
            hook.on_done(evt).await;
        }
    }
}

/// Entry point for creating, reading and canceling events.
#[derive(Clone)]
pub struct Journal {
    shared: Arc<Shared>,
}

impl Journal {
    pub fn new(store: Arc<dyn EventStore>, settings: JournalSettings) -> Self {
        Self {
            shared: Arc::new(Shared {
                store,
                settings,
                hooks: RwLock::new(Vec::new()),
            }),
        }
    }

    pub fn add_hook(&self, hook: Arc<dyn EventHook>) {
        self.shared.hooks.write().push(hook);
    }

    pub fn store(&self) -> &Arc<dyn EventStore> {
        &self.shared.store
    }

    /// Create an event for an action described by a permission scheme.
    pub async fn new_event(&self, opts: Opts) -> Result<Event, EventError> {
        let kind = match opts.kind.as_deref() {
            Some(kind) if !kind.is_empty() => kind.to_string(),
            _ => return Err(EventError::Validation("event kind is mandatory")),
        };
        let owner = opts
            .owner
            .clone()
            .ok_or(EventError::Validation("event owner is mandatory"))?;
        self.create(
            opts,
            Kind {
                kind_type: KindType::Permission,
                name: kind,
            },
            owner,
        )
        .await
    }

    /// Create an event originated inside the API (autoscaler, healer).
    pub async fn new_internal(&self, opts: Opts) -> Result<Event, EventError> {
        if opts.owner.is_some() {
            return Err(EventError::Validation(
                "event owner must not be set on internal events",
            ));
        }
        if opts.kind.is_some() {
            return Err(EventError::Validation(
                "event kind must not be set on internal events",
            ));
        }
        let kind = match opts.internal_kind.as_deref() {
            Some(kind) if !kind.is_empty() => kind.to_string(),
            _ => return Err(EventError::Validation("event internal kind is mandatory")),
        };
        self.create(
            opts,
            Kind {
                kind_type: KindType::Internal,
                name: kind,
            },
            Owner::internal(),
        )
        .await
    }

    async fn create(&self, opts: Opts, kind: Kind, owner: Owner) -> Result<Event, EventError> {
        let target = opts
            .target
            .clone()
            .ok_or(EventError::Validation("event target is mandatory"))?;
        if opts.allowed.is_empty() {
            return Err(EventError::Validation("event allowed is mandatory"));
        }
        if opts.cancelable && opts.allowed_cancel.is_empty() {
            return Err(EventError::Validation(
                "event allowed cancel is mandatory for cancelable events",
            ));
        }

        if let Err(e) = self.check_throttling(&target, &kind.name).await {
            metrics::event_rejected(&kind.name, &e);
            return Err(e);
        }

        let retry = opts.retry_timeout.unwrap_or_else(|| {
            if target.target_type == TargetType::App {
                self.shared.settings.app_lock_retry
            } else {
                Duration::ZERO
            }
        });
        let deadline = tokio::time::Instant::now() + retry;

        loop {
            let now = Utc::now();
            let data = EventData {
                unique_id: Uuid::new_v4(),
                start_time: now,
                end_time: None,
                target: target.clone(),
                extra_targets: opts.extra_targets.clone(),
                start_custom_data: opts.custom_data.clone(),
                end_custom_data: None,
                other_custom_data: None,
                kind: kind.clone(),
                owner: owner.clone(),
                source_ip: opts.remote_addr.clone().unwrap_or_default(),
                lock_update_time: now,
                error: String::new(),
                log: String::new(),
                structured_log: Vec::new(),
                cancel_info: CancelInfo::default(),
                cancelable: opts.cancelable,
                running: true,
                lockable: !opts.disable_lock,
                allowed: opts.allowed.clone(),
                allowed_cancel: opts.allowed_cancel.clone(),
            };
            match self
                .shared
                .store
                .insert(data.clone(), self.shared.settings.lock_expire)
                .await
            {
                Ok(released) => {
                    for expired in &released {
                        metrics::event_expired(expired);
                        self.shared.run_hooks(expired).await;
                    }
                    metrics::event_started(&kind.name);
                    debug!("event {} created: {} on {}", data.unique_id, kind.name, target);
                    return Ok(Event::start(self.shared.clone(), data));
                }
                Err(EventError::Locked(holder)) if tokio::time::Instant::now() < deadline => {
                    debug!("target {} locked by {}, retrying", target, holder);
                    tokio::time::sleep(LOCK_RETRY_INTERVAL).await;
                }
                Err(e) => {
                    metrics::event_rejected(&kind.name, &e);
                    return Err(e);
                }
            }
        }
    }

    async fn check_throttling(&self, target: &Target, kind: &str) -> Result<(), EventError> {
        for all_targets in [false, true] {
            let spec = self.find_throttling(target.target_type, kind, all_targets);
            let Some(spec) = spec else { continue };

            let scope = Filter {
                target_type: Some(target.target_type),
                target_value: (!all_targets).then(|| target.value.clone()),
                kind_names: if spec.kind_name.is_empty() {
                    Vec::new()
                } else {
                    vec![kind.to_string()]
                },
                ..Default::default()
            };
            let same_target = |e: &EventData| {
                e.target.target_type == target.target_type
                    && (all_targets || e.target.value == target.value)
            };
            let now = Utc::now();
            let window = chrono::Duration::seconds(spec.window_secs as i64);
            let recent = Filter {
                since: Some(now - window),
                ..scope.clone()
            };
            let mut counted: Vec<Uuid> = self
                .shared
                .store
                .list(&recent)
                .await?
                .iter()
                .filter(|e| same_target(*e))
                .map(|e| e.unique_id)
                .collect();
            if spec.wait_finish {
                let running = Filter {
                    running: Some(true),
                    ..scope
                };
                for evt in self.shared.store.list(&running).await? {
                    if same_target(&evt)
                        && !evt.lock_expired(now, self.shared.settings.lock_expire)
                        && !counted.contains(&evt.unique_id)
                    {
                        counted.push(evt.unique_id);
                    }
                }
            }
            if counted.len() >= spec.max {
                return Err(EventError::Throttled(throttled_message(
                    spec,
                    target,
                    all_targets,
                )));
            }
        }
        Ok(())
    }

    fn find_throttling(
        &self,
        target_type: TargetType,
        kind: &str,
        all_targets: bool,
    ) -> Option<&ThrottlingSpec> {
        let specs = &self.shared.settings.throttling;
        let candidates = || {
            specs
                .iter()
                .filter(move |s| s.target_type == target_type && s.all_targets == all_targets)
        };
        candidates()
            .find(|s| s.kind_name == kind)
            .or_else(|| candidates().find(|s| s.kind_name.is_empty()))
    }

    pub async fn get(&self, id: Uuid) -> Result<EventData, EventError> {
        self.shared.store.get(id).await?.ok_or(EventError::NotFound)
    }

    /// Fetch an event the token is allowed to see.
    pub async fn get_visible(&self, id: Uuid, token: &Token) -> Result<EventData, EventError> {
        let evt = self.get(id).await?;
        if !evt.allowed.check(token) {
            return Err(PermissionError::Unauthorized.into());
        }
        Ok(evt)
    }

    /// Events matching `filter` whose read predicate the token satisfies.
    ///
    /// The store is read in pages until enough visible events are found.
    pub async fn list(&self, token: &Token, filter: &Filter) -> Result<Vec<EventData>, EventError> {
        let wanted = filter.limit.map(|limit| filter.skip + limit);
        let mut visible = Vec::new();
        let mut offset = 0;
        loop {
            let page = Filter {
                skip: offset,
                limit: Some(LIST_BATCH),
                ..filter.clone()
            };
            let batch = self.shared.store.list(&page).await?;
            let fetched = batch.len();
            offset += fetched;
            visible.extend(batch.into_iter().filter(|evt| evt.allowed.check(token)));
            if fetched < LIST_BATCH || wanted.is_some_and(|w| visible.len() >= w) {
                break;
            }
        }
        let visible = visible.into_iter().skip(filter.skip);
        Ok(match filter.limit {
            Some(limit) => visible.take(limit).collect(),
            None => visible.collect(),
        })
    }

    pub async fn try_cancel(
        &self,
        id: Uuid,
        token: &Token,
        reason: &str,
    ) -> Result<EventData, EventError> {
        let evt = self.get(id).await?;
        if !evt.cancelable {
            return Err(EventError::NotCancelable);
        }
        if !evt.allowed_cancel.check(token) {
            return Err(PermissionError::Unauthorized.into());
        }
        self.shared
            .store
            .request_cancel(id, token.user_name(), reason)
            .await
    }

    pub async fn kinds(&self) -> Result<Vec<Kind>, EventError> {
        self.shared.store.kinds().await
    }

    pub async fn health_check(&self) -> Result<(), EventError> {
        self.shared.store.health_check().await
    }
}

fn throttled_message(spec: &ThrottlingSpec, target: &Target, all_targets: bool) -> String {
    let kind = if spec.kind_name.is_empty() {
        String::new()
    } else {
        format!(" {} on", spec.kind_name)
    };
    let target = if all_targets {
        format!("any {}", target.target_type)
    } else {
        format!("{} {:?}", target.target_type, target.value)
    };
    format!(
        "event throttled, limit for{} {} is {} every {:?}",
        kind,
        target,
        spec.max,
        Duration::from_secs(spec.window_secs)
    )
}

struct Inner {
    shared: Arc<Shared>,
    id: Uuid,
    target: Target,
    kind: Kind,
    owner: Owner,
    allowed: AllowedPermission,
    pending: Mutex<Vec<LogEntry>>,
    /// Serializes take-and-append so chunks reach the store in write order.
    flushing: tokio::sync::Mutex<()>,
    log_writer: Mutex<Option<Arc<dyn LogWriter>>>,
    done: AtomicBool,
    stop: Arc<Notify>,
    updater: Mutex<Option<JoinHandle<()>>>,
}

impl Inner {
    fn take_pending(&self) -> Vec<LogEntry> {
        std::mem::take(&mut *self.pending.lock())
    }

    /// Push entries back in front of anything written since they were taken.
    fn restore_pending(&self, entries: Vec<LogEntry>) {
        let mut pending = self.pending.lock();
        let newer = std::mem::replace(&mut *pending, entries);
        pending.extend(newer);
    }

    async fn flush(&self) -> Result<(), EventError> {
        let _guard = self.flushing.lock().await;
        let mut taken = Taken {
            inner: self,
            entries: Some(self.take_pending()),
        };
        let entries = match taken.entries.as_ref() {
            Some(entries) if !entries.is_empty() => entries.clone(),
            _ => return Ok(()),
        };
        self.shared.store.append_log(self.id, entries).await?;
        taken.entries = None;
        Ok(())
    }

    /// Stop the lock updater, letting an in-flight flush complete first.
    async fn stop_updater(&self) {
        self.stop.notify_one();
        let handle = self.updater.lock().take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                if e.is_panic() {
                    warn!("lock updater of event {} panicked", self.id);
                }
            }
        }
    }
}

/// Log entries taken out of the pending buffer; restored unless the store
/// accepted them.
struct Taken<'a> {
    inner: &'a Inner,
    entries: Option<Vec<LogEntry>>,
}

impl Drop for Taken<'_> {
    fn drop(&mut self) {
        if let Some(entries) = self.entries.take() {
            if !entries.is_empty() {
                self.inner.restore_pending(entries);
            }
        }
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        if self.done.load(Ordering::SeqCst) {
            return;
        }
        if let Some(handle) = self.updater.get_mut().take() {
            handle.abort();
        }
        let shared = self.shared.clone();
        let id = self.id;
        let pending = self.take_pending();
        warn!("event {} dropped while running, finalizing", id);
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(async move {
                if !pending.is_empty() {
                    let _ = shared.store.append_log(id, pending).await;
                }
                let error = Some("event finalized without an explicit outcome".to_string());
                match shared.store.finish(id, error, None).await {
                    Ok(Some(evt)) => {
                        metrics::event_finished(&evt);
                        shared.run_hooks(&evt).await;
                    }
                    Ok(None) => {}
                    Err(e) => warn!("unable to finalize event {}: {}", id, e),
                }
            });
        }
    }
}

/// Handle to a running event.
///
/// Writes are teed to the attached log writer immediately and flushed to
/// the store in chunks. The last handle dropped without `done` finalizes
/// the event with an error.
#[derive(Clone)]
pub struct Event {
    inner: Arc<Inner>,
}

impl Event {
    fn start(shared: Arc<Shared>, data: EventData) -> Self {
        let interval = shared.settings.lock_update_interval;
        let inner = Arc::new(Inner {
            shared,
            id: data.unique_id,
            target: data.target,
            kind: data.kind,
            owner: data.owner,
            allowed: data.allowed,
            pending: Mutex::new(Vec::new()),
            flushing: tokio::sync::Mutex::new(()),
            log_writer: Mutex::new(None),
            done: AtomicBool::new(false),
            stop: Arc::new(Notify::new()),
            updater: Mutex::new(None),
        });
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            let task = handle.spawn(update_lock(
                Arc::downgrade(&inner),
                inner.stop.clone(),
                interval,
            ));
            *inner.updater.lock() = Some(task);
        }
        Event { inner }
    }

    pub fn id(&self) -> Uuid {
        self.inner.id
    }

    pub fn target(&self) -> &Target {
        &self.inner.target
    }

    pub fn kind(&self) -> &Kind {
        &self.inner.kind
    }

    pub fn owner(&self) -> &Owner {
        &self.inner.owner
    }

    pub fn allowed(&self) -> &AllowedPermission {
        &self.inner.allowed
    }

    pub fn set_log_writer(&self, writer: Arc<dyn LogWriter>) {
        *self.inner.log_writer.lock() = Some(writer);
    }

    pub fn write(&self, data: &[u8]) {
        if data.is_empty() {
            return;
        }
        let message = String::from_utf8_lossy(data).into_owned();
        debug!("event {}: {}", self.inner.id, message.trim_end());
        self.inner.pending.lock().push(LogEntry {
            date: Utc::now(),
            message,
        });
        let writer = self.inner.log_writer.lock().clone();
        if let Some(writer) = writer {
            writer.write_log(data);
        }
    }

    /// Write one line, adding the trailing newline when missing.
    pub fn log(&self, message: impl Display) {
        let mut line = message.to_string();
        if !line.ends_with('\n') {
            line.push('\n');
        }
        self.write(line.as_bytes());
    }

    pub async fn flush(&self) -> Result<(), EventError> {
        self.inner.flush().await
    }

    pub async fn set_other_custom_data(&self, data: Value) -> Result<(), EventError> {
        self.inner.shared.store.set_other_data(self.inner.id, data).await
    }

    /// Whether someone asked this event to stop.
    pub async fn is_canceled(&self) -> Result<bool, EventError> {
        let evt = self
            .inner
            .shared
            .store
            .get(self.inner.id)
            .await?
            .ok_or(EventError::NotFound)?;
        Ok(evt.cancel_info.asked)
    }

    pub async fn ack_cancel(&self) -> Result<bool, EventError> {
        self.inner.shared.store.ack_cancel(self.inner.id).await
    }

    pub async fn done(&self, error: Option<String>) -> Result<(), EventError> {
        self.done_custom_data(error, None).await
    }

    /// Finalize the event. Only the first call has any effect.
    pub async fn done_custom_data(
        &self,
        error: Option<String>,
        data: Option<Value>,
    ) -> Result<(), EventError> {
        if self.inner.done.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.inner.stop_updater().await;
        self.flush().await?;
        let finished = self.inner.shared.store.finish(self.inner.id, error, data).await?;
        if let Some(evt) = finished {
            debug!("event {} finished", evt.unique_id);
            metrics::event_finished(&evt);
            self.inner.shared.run_hooks(&evt).await;
        }
        Ok(())
    }

    /// Discard the event record entirely.
    pub async fn abort(&self) -> Result<(), EventError> {
        if self.inner.done.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.inner.stop_updater().await;
        self.inner.take_pending();
        metrics::event_aborted(&self.inner.kind.name);
        self.inner.shared.store.remove(self.inner.id).await
    }
}

impl fmt::Debug for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Event")
            .field("id", &self.inner.id)
            .field("target", &self.inner.target)
            .field("kind", &self.inner.kind.name)
            .finish()
    }
}

async fn update_lock(inner: Weak<Inner>, stop: Arc<Notify>, interval: Duration) {
    let mut ticker = tokio::time::interval(interval);
    ticker.tick().await;
    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = stop.notified() => return,
        }
        let Some(inner) = inner.upgrade() else { return };
        if inner.done.load(Ordering::SeqCst) {
            return;
        }
        let has_pending = !inner.pending.lock().is_empty();
        let result = if has_pending {
            inner.flush().await
        } else {
            inner.shared.store.touch(inner.id).await
        };
        if let Err(e) = result {
            warn!("unable to update lock of event {}: {}", inner.id, e);
        }
    }
}

/// Run `work` to completion and finalize `evt` with its outcome, panics included.
pub async fn finish<T, E, F>(evt: &Event, work: F) -> Result<T, E>
where
    E: Display,
    F: Future<Output = Result<T, E>>,
{
    match AssertUnwindSafe(work).catch_unwind().await {
        Ok(result) => {
            let error = result.as_ref().err().map(|e| e.to_string());
            if let Err(e) = evt.done(error).await {
                warn!("unable to finalize event {}: {}", evt.id(), e);
            }
            result
        }
        Err(panic) => {
            let message = panic
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| panic.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "unknown panic".to_string());
            if let Err(e) = evt.done(Some(format!("panic: {}", message))).await {
                warn!("unable to finalize event {}: {}", evt.id(), e);
            }
            std::panic::resume_unwind(panic)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{MemoryEventStore, CANCELED_ERROR};
    use crate::permission::scheme::{APP_READ_EVENTS, APP_UPDATE};
    use crate::permission::{Context, Permission};
    use crate::storage::models::User;
    use std::sync::atomic::AtomicUsize;

    fn settings() -> JournalSettings {
        JournalSettings {
            lock_expire: Duration::from_secs(60),
            lock_update_interval: Duration::from_secs(5),
            app_lock_retry: Duration::ZERO,
            throttling: Vec::new(),
        }
    }

    fn journal_with(settings: JournalSettings) -> Journal {
        Journal::new(Arc::new(MemoryEventStore::new()), settings)
    }

    fn token(perms: Vec<Permission>) -> Token {
        let user = User {
            email: "me@example.com".into(),
            password: String::new(),
            api_key: None,
            roles: vec![],
        };
        Token::for_user("tok", user, perms)
    }

    fn opts(app: &str) -> Opts {
        Opts {
            target: Some(Target::app(app)),
            kind: Some(APP_UPDATE.to_string()),
            owner: Some(Owner::from_token(&token(vec![]))),
            allowed: AllowedPermission::new(APP_READ_EVENTS, vec![Context::app(app)]),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_validation_messages() {
        let journal = journal_with(settings());
        let cases = [
            (Opts { target: None, ..opts("a") }, "event target is mandatory"),
            (Opts { kind: None, ..opts("a") }, "event kind is mandatory"),
            (Opts { owner: None, ..opts("a") }, "event owner is mandatory"),
            (
                Opts { allowed: AllowedPermission::default(), ..opts("a") },
                "event allowed is mandatory",
            ),
            (
                Opts { cancelable: true, ..opts("a") },
                "event allowed cancel is mandatory for cancelable events",
            ),
        ];
        for (opts, message) in cases {
            let err = journal.new_event(opts).await.unwrap_err();
            assert_eq!(err.to_string(), message);
        }

        let err = journal.new_internal(opts("a")).await.unwrap_err();
        assert_eq!(err.to_string(), "event owner must not be set on internal events");
        let err = journal
            .new_internal(Opts { owner: None, ..opts("a") })
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "event kind must not be set on internal events");
        let err = journal
            .new_internal(Opts { owner: None, kind: None, ..opts("a") })
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "event internal kind is mandatory");
    }

    #[tokio::test]
    async fn test_lock_conflict_until_done() {
        let journal = journal_with(settings());
        let evt = journal.new_event(opts("myapp")).await.unwrap();

        let err = journal.new_event(opts("myapp")).await.unwrap_err();
        let message = err.to_string();
        assert!(message.starts_with("event locked: app(myapp) running \"app.update\" start by user me@example.com at "));

        let mut unlocked = opts("myapp");
        unlocked.disable_lock = true;
        journal.new_event(unlocked).await.unwrap().done(None).await.unwrap();

        evt.done(None).await.unwrap();
        journal.new_event(opts("myapp")).await.unwrap().done(None).await.unwrap();
    }

    #[tokio::test]
    async fn test_app_lock_retry_waits_for_holder() {
        let journal = journal_with(JournalSettings {
            app_lock_retry: Duration::from_secs(2),
            ..settings()
        });
        let evt = journal.new_event(opts("myapp")).await.unwrap();
        let holder = evt.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(250)).await;
            holder.done(None).await.unwrap();
        });
        drop(evt);
        journal.new_event(opts("myapp")).await.unwrap().done(None).await.unwrap();
    }

    #[tokio::test]
    async fn test_done_is_idempotent_and_persists_log() {
        let journal = journal_with(settings());
        let evt = journal.new_event(opts("myapp")).await.unwrap();
        evt.log("deploying");
        evt.write(b"step 2\n");
        evt.done_custom_data(None, Some(serde_json::json!({"ok": true})))
            .await
            .unwrap();
        evt.done(Some("ignored".into())).await.unwrap();

        let data = journal.get(evt.id()).await.unwrap();
        assert!(!data.running);
        assert!(data.end_time.is_some());
        assert_eq!(data.error, "");
        assert_eq!(data.end_custom_data, Some(serde_json::json!({"ok": true})));
        let messages: Vec<_> = data.structured_log.iter().map(|e| e.message.as_str()).collect();
        assert_eq!(messages, vec!["deploying\n", "step 2\n"]);
        assert!(data.log.contains(": deploying\n"));
    }

    #[tokio::test]
    async fn test_log_writer_receives_writes() {
        struct Collect(Mutex<Vec<u8>>);
        impl LogWriter for Collect {
            fn write_log(&self, data: &[u8]) {
                self.0.lock().extend_from_slice(data);
            }
        }
        let journal = journal_with(settings());
        let evt = journal.new_event(opts("myapp")).await.unwrap();
        let sink = Arc::new(Collect(Mutex::new(Vec::new())));
        evt.set_log_writer(sink.clone());
        evt.log("hello");
        evt.done(None).await.unwrap();
        assert_eq!(sink.0.lock().as_slice(), b"hello\n");
    }

    #[tokio::test]
    async fn test_finish_records_error_and_panic() {
        let journal = journal_with(settings());
        let evt = journal.new_event(opts("a")).await.unwrap();
        let result: Result<(), String> = finish(&evt, async { Err("boom".to_string()) }).await;
        assert!(result.is_err());
        assert_eq!(journal.get(evt.id()).await.unwrap().error, "boom");

        let evt = journal.new_event(opts("b")).await.unwrap();
        let id = evt.id();
        let handle = tokio::spawn(async move {
            let _: Result<(), String> = finish(&evt, async { panic!("kaboom") }).await;
        });
        assert!(handle.await.is_err());
        let data = journal.get(id).await.unwrap();
        assert!(!data.running);
        assert_eq!(data.error, "panic: kaboom");
    }

    #[tokio::test]
    async fn test_dropped_event_is_finalized() {
        let journal = journal_with(settings());
        let evt = journal.new_event(opts("a")).await.unwrap();
        let id = evt.id();
        drop(evt);
        for _ in 0..50 {
            if !journal.get(id).await.unwrap().running {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("event still running");
    }

    #[tokio::test]
    async fn test_abort_removes_record() {
        let journal = journal_with(settings());
        let evt = journal.new_event(opts("a")).await.unwrap();
        evt.abort().await.unwrap();
        assert_eq!(journal.get(evt.id()).await, Err(EventError::NotFound));
    }

    #[tokio::test]
    async fn test_cancel_flow() {
        let journal = journal_with(settings());
        let mut o = opts("a");
        o.cancelable = true;
        o.allowed_cancel = AllowedPermission::new("app.update.cancel", vec![Context::app("a")]);
        let evt = journal.new_event(o).await.unwrap();

        let outsider = token(vec![]);
        assert_eq!(
            journal.try_cancel(evt.id(), &outsider, "stop").await,
            Err(EventError::Permission(PermissionError::Unauthorized))
        );

        let admin = token(vec![Permission::new("app", Context::app("a"))]);
        let data = journal.try_cancel(evt.id(), &admin, "stop").await.unwrap();
        assert_eq!(data.cancel_info.reason, "stop");
        assert_eq!(
            journal.try_cancel(evt.id(), &admin, "again").await,
            Err(EventError::CancelAlreadyRequested)
        );

        assert!(evt.is_canceled().await.unwrap());
        assert!(evt.ack_cancel().await.unwrap());
        evt.done(None).await.unwrap();
        let data = journal.get(evt.id()).await.unwrap();
        assert_eq!(data.error, CANCELED_ERROR);
        assert!(data.cancel_info.canceled);
    }

    #[tokio::test]
    async fn test_list_filters_by_visibility() {
        let journal = journal_with(settings());
        journal.new_event(opts("mine")).await.unwrap().done(None).await.unwrap();
        journal.new_event(opts("theirs")).await.unwrap().done(None).await.unwrap();

        let reader = token(vec![Permission::new(APP_READ_EVENTS, Context::app("mine"))]);
        let events = journal.list(&reader, &Filter::default()).await.unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].target.value, "mine");

        let root = token(vec![Permission::new("*", Context::Global)]);
        let events = journal.list(&root, &Filter::default()).await.unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].target.value, "theirs");
    }

    #[tokio::test]
    async fn test_throttling() {
        let journal = journal_with(JournalSettings {
            throttling: vec![ThrottlingSpec {
                target_type: TargetType::App,
                kind_name: APP_UPDATE.to_string(),
                max: 1,
                window_secs: 60,
                all_targets: false,
                wait_finish: false,
            }],
            ..settings()
        });
        journal.new_event(opts("a")).await.unwrap().done(None).await.unwrap();
        let err = journal.new_event(opts("a")).await.unwrap_err();
        assert_eq!(
            err.to_string(),
            "event throttled, limit for app.update on app \"a\" is 1 every 60s"
        );
        journal.new_event(opts("b")).await.unwrap().done(None).await.unwrap();
    }

    #[tokio::test]
    async fn test_hooks_fire_once() {
        struct Count(AtomicUsize);
        #[async_trait]
        impl EventHook for Count {
            async fn on_done(&self, _evt: &EventData) {
                self.0.fetch_add(1, Ordering::SeqCst);
            }
        }
        let journal = journal_with(settings());
        let hook = Arc::new(Count(AtomicUsize::new(0)));
        journal.add_hook(hook.clone());
        let evt = journal.new_event(opts("a")).await.unwrap();
        evt.done(None).await.unwrap();
        evt.done(None).await.unwrap();
        assert_eq!(hook.0.load(Ordering::SeqCst), 1);
    }

    /// Memory store whose log appends take a while.
    struct SlowAppend {
        store: MemoryEventStore,
        delay: Duration,
    }

    #[async_trait]
    impl EventStore for SlowAppend {
        async fn insert(
            &self,
            evt: EventData,
            lock_expire: Duration,
        ) -> Result<Vec<EventData>, EventError> {
            self.store.insert(evt, lock_expire).await
        }
        async fn get(&self, id: Uuid) -> Result<Option<EventData>, EventError> {
            self.store.get(id).await
        }
        async fn list(&self, filter: &Filter) -> Result<Vec<EventData>, EventError> {
            self.store.list(filter).await
        }
        async fn append_log(&self, id: Uuid, entries: Vec<LogEntry>) -> Result<(), EventError> {
            tokio::time::sleep(self.delay).await;
            self.store.append_log(id, entries).await
        }
        async fn touch(&self, id: Uuid) -> Result<(), EventError> {
            self.store.touch(id).await
        }
        async fn request_cancel(
            &self,
            id: Uuid,
            owner: &str,
            reason: &str,
        ) -> Result<EventData, EventError> {
            self.store.request_cancel(id, owner, reason).await
        }
        async fn ack_cancel(&self, id: Uuid) -> Result<bool, EventError> {
            self.store.ack_cancel(id).await
        }
        async fn finish(
            &self,
            id: Uuid,
            error: Option<String>,
            end_data: Option<Value>,
        ) -> Result<Option<EventData>, EventError> {
            self.store.finish(id, error, end_data).await
        }
        async fn set_other_data(&self, id: Uuid, data: Value) -> Result<(), EventError> {
            self.store.set_other_data(id, data).await
        }
        async fn remove(&self, id: Uuid) -> Result<(), EventError> {
            self.store.remove(id).await
        }
        async fn kinds(&self) -> Result<Vec<Kind>, EventError> {
            self.store.kinds().await
        }
    }

    #[tokio::test]
    async fn test_done_keeps_lines_flushed_by_lock_update() {
        let journal = Journal::new(
            Arc::new(SlowAppend {
                store: MemoryEventStore::new(),
                delay: Duration::from_millis(200),
            }),
            JournalSettings {
                lock_update_interval: Duration::from_millis(100),
                ..settings()
            },
        );
        let evt = journal.new_event(opts("myapp")).await.unwrap();
        evt.log("line one");
        tokio::time::sleep(Duration::from_millis(150)).await;
        evt.log("line two");
        evt.done(None).await.unwrap();

        let data = journal.get(evt.id()).await.unwrap();
        let messages: Vec<_> = data.structured_log.iter().map(|e| e.message.as_str()).collect();
        assert_eq!(messages, vec!["line one\n", "line two\n"]);
    }

    #[tokio::test]
    async fn test_lines_written_during_flush_stay_in_order() {
        let journal = Journal::new(
            Arc::new(SlowAppend {
                store: MemoryEventStore::new(),
                delay: Duration::from_millis(50),
            }),
            settings(),
        );
        let evt = journal.new_event(opts("myapp")).await.unwrap();
        evt.log("first");
        let flusher = evt.clone();
        let flush = tokio::spawn(async move { flusher.flush().await });
        tokio::time::sleep(Duration::from_millis(10)).await;
        evt.log("second");
        evt.flush().await.unwrap();
        flush.await.unwrap().unwrap();
        evt.done(None).await.unwrap();

        let data = journal.get(evt.id()).await.unwrap();
        let messages: Vec<_> = data.structured_log.iter().map(|e| e.message.as_str()).collect();
        assert_eq!(messages, vec!["first\n", "second\n"]);
    }

    #[tokio::test]
    async fn test_throttling_ignores_events_outside_window() {
        let store = Arc::new(MemoryEventStore::new());
        let mut old = crate::event::tests::sample(Target::app("a"));
        old.running = false;
        store.insert(old, Duration::from_secs(60)).await.unwrap();
        let journal = Journal::new(
            store,
            JournalSettings {
                throttling: vec![ThrottlingSpec {
                    target_type: TargetType::App,
                    kind_name: APP_UPDATE.to_string(),
                    max: 1,
                    window_secs: 60,
                    all_targets: false,
                    wait_finish: false,
                }],
                ..settings()
            },
        );
        journal.new_event(opts("a")).await.unwrap().done(None).await.unwrap();
    }

    #[tokio::test]
    async fn test_wait_finish_counts_running_events() {
        let journal = journal_with(JournalSettings {
            throttling: vec![ThrottlingSpec {
                target_type: TargetType::App,
                kind_name: String::new(),
                max: 1,
                window_secs: 0,
                all_targets: true,
                wait_finish: true,
            }],
            ..settings()
        });
        let running = journal.new_event(opts("a")).await.unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;
        let err = journal.new_event(opts("b")).await.unwrap_err();
        assert!(matches!(err, EventError::Throttled(_)));
        running.done(None).await.unwrap();
        journal.new_event(opts("b")).await.unwrap().done(None).await.unwrap();
    }

    #[tokio::test]
    async fn test_list_pages_past_invisible_events() {
        let journal = journal_with(settings());
        journal.new_event(opts("mine")).await.unwrap().done(None).await.unwrap();
        for _ in 0..(LIST_BATCH + 5) {
            let mut o = opts("theirs");
            o.disable_lock = true;
            journal.new_event(o).await.unwrap().done(None).await.unwrap();
        }
        let reader = token(vec![Permission::new(APP_READ_EVENTS, Context::app("mine"))]);
        let filter = Filter {
            limit: Some(10),
            ..Default::default()
        };
        let events = journal.list(&reader, &filter).await.unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].target.value, "mine");

        let root = token(vec![Permission::new("*", Context::Global)]);
        let filter = Filter {
            skip: 3,
            limit: Some(4),
            ..Default::default()
        };
        assert_eq!(journal.list(&root, &filter).await.unwrap().len(), 4);
    }

    #[tokio::test]
    async fn test_hooks_fire_for_expired_lock_holders() {
        struct Collect(Mutex<Vec<String>>);
        #[async_trait]
        impl EventHook for Collect {
            async fn on_done(&self, evt: &EventData) {
                self.0.lock().push(evt.error.clone());
            }
        }
        let store = Arc::new(MemoryEventStore::new());
        let stale = crate::event::tests::sample(Target::app("myapp"));
        store.insert(stale, Duration::from_secs(60)).await.unwrap();

        let journal = Journal::new(store, settings());
        let hook = Arc::new(Collect(Mutex::new(Vec::new())));
        journal.add_hook(hook.clone());
        journal.new_event(opts("myapp")).await.unwrap().done(None).await.unwrap();

        let errors = hook.0.lock().clone();
        assert_eq!(errors.len(), 2);
        assert_eq!(errors[0], "event expired, no update for 60s");
        assert_eq!(errors[1], "");
    }
}
