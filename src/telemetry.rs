use crate::error::Result;
use chrono::{SecondsFormat, Utc};
use std::collections::BTreeMap;
use std::fmt::{self as stdfmt};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::sync::OnceLock;
use tracing::field::{Field, Visit};
use tracing::Event;
use tracing::Subscriber;
use tracing_subscriber::fmt::writer::MakeWriterExt;
use tracing_subscriber::fmt::{
    self as fmt_subscriber, format::Writer, FmtContext, FormatEvent, FormatFields,
};
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::EnvFilter;

const SERVICE_NAME: &str = "steward";
const DEFAULT_FILTER: &str = "steward=info,info";

/// Installs the global subscriber: `RUST_LOG` (or `steward=info,info`), key=value lines,
/// INFO and below on stdout, WARN and above on stderr.
pub fn init_tracing() -> Result<()> {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));

    let stdout = std::io::stdout;
    let stderr = std::io::stderr;

    let writer = stdout
        .with_max_level(tracing::Level::INFO)
        .or_else(stderr.with_min_level(tracing::Level::WARN));

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .with_level(false)
        .with_ansi(false)
        .event_format(KeyValueFormatter::new())
        .fmt_fields(fmt_subscriber::format::DefaultFields::new())
        .with_writer(writer)
        .try_init()
        .map_err(|err| crate::err!("failed to initialise tracing subscriber: {err}"))
}

/// One line per event: fixed header fields, then `entity`, then the remaining fields sorted.
pub struct KeyValueFormatter {
    service_name: &'static str,
}

impl KeyValueFormatter {
    pub const fn new() -> Self {
        Self {
            service_name: SERVICE_NAME,
        }
    }
}

impl Default for KeyValueFormatter {
    fn default() -> Self {
        Self::new()
    }
}

impl<S, N> FormatEvent<S, N> for KeyValueFormatter
where
    S: Subscriber + for<'lookup> LookupSpan<'lookup>,
    N: for<'writer> FormatFields<'writer> + 'static,
{
    fn format_event(
        &self,
        ctx: &FmtContext<'_, S, N>,
        mut writer: Writer<'_>,
        event: &Event<'_>,
    ) -> stdfmt::Result {
        let timestamp = Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true);
        let metadata = event.metadata();

        let mut visitor = FieldVisitor::default();
        event.record(&mut visitor);

        let message = visitor
            .message
            .take()
            .unwrap_or_else(|| metadata.name().to_string());
        let entity = visitor.entity.take();

        let mut fields = visitor.fields;
        fields.sort_by(|(lhs, _), (rhs, _)| lhs.cmp(rhs));

        let mut line = String::new();
        push_field(&mut line, "ts", &timestamp);
        push_field(&mut line, "level", metadata.level().as_str());
        push_field(&mut line, "service", self.service_name);
        push_field(&mut line, "component", metadata.target());

        if let Some(span_path) = current_span_path(ctx) {
            push_field(&mut line, "span", &span_path);
        }
        if let Some(entity) = entity {
            push_field(&mut line, "entity", &entity);
        }

        push_field(&mut line, "msg", &message);

        for (key, value) in fields {
            push_field(&mut line, &key, &value);
        }

        if let (Some(file), Some(line_no)) = (metadata.file(), metadata.line()) {
            push_field(&mut line, "at", &format!("{file}:{line_no}"));
        }

        writer.write_str(&line)?;
        writer.write_char('\n')
    }
}

fn current_span_path<S, N>(ctx: &FmtContext<'_, S, N>) -> Option<String>
where
    S: Subscriber + for<'lookup> LookupSpan<'lookup>,
    N: for<'writer> FormatFields<'writer> + 'static,
{
    let span = ctx.lookup_current()?;
    let names: Vec<&str> = span.scope().from_root().map(|s| s.name()).collect();
    (!names.is_empty()).then(|| names.join("."))
}

#[derive(Default)]
struct FieldVisitor {
    message: Option<String>,
    entity: Option<String>,
    fields: Vec<(String, String)>,
}

impl FieldVisitor {
    fn record_field(&mut self, field: &Field, value: String) {
        match field.name() {
            "" => {}
            "message" => self.message = Some(value),
            "entity" => self.entity = Some(value),
            name => self.fields.push((name.to_string(), value)),
        }
    }
}

impl Visit for FieldVisitor {
    fn record_str(&mut self, field: &Field, value: &str) {
        self.record_field(field, value.to_string());
    }

    fn record_debug(&mut self, field: &Field, value: &dyn stdfmt::Debug) {
        self.record_field(field, format!("{value:?}"));
    }

    fn record_i64(&mut self, field: &Field, value: i64) {
        self.record_field(field, value.to_string());
    }

    fn record_u64(&mut self, field: &Field, value: u64) {
        self.record_field(field, value.to_string());
    }

    fn record_bool(&mut self, field: &Field, value: bool) {
        self.record_field(field, value.to_string());
    }
}

pub(crate) fn encode_field_value(value: &str) -> String {
    let needs_quotes = value.is_empty()
        || value.chars().any(|c| {
            c.is_whitespace() || matches!(c, '"' | '\\' | '=' | '[' | ']' | '{' | '}' | ',')
        });

    if !needs_quotes {
        return value.to_string();
    }

    let mut encoded = String::with_capacity(value.len() + 2);
    encoded.push('"');
    for ch in value.chars() {
        match ch {
            '"' => encoded.push_str("\\\""),
            '\\' => encoded.push_str("\\\\"),
            '\n' => encoded.push_str("\\n"),
            '\r' => encoded.push_str("\\r"),
            '\t' => encoded.push_str("\\t"),
            _ => encoded.push(ch),
        }
    }
    encoded.push('"');
    encoded
}

fn push_field(buffer: &mut String, key: &str, value: &str) {
    if !buffer.is_empty() {
        buffer.push(' ');
    }
    buffer.push_str(key);
    buffer.push('=');
    buffer.push_str(&encode_field_value(value));
}

/// Process-wide reconciliation and lifecycle counters.
#[derive(Default)]
pub struct RuntimeCounters {
    reconfigurations: AtomicU64,
    reloads: AtomicU64,
    reload_failures: AtomicU64,
    deferred_updates: AtomicU64,
    unresolved_members: AtomicU64,
    transitions: TransitionRegistry,
    entities: EntityCounterRegistry,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RuntimeCountersSnapshot {
    pub reconfigurations: u64,
    pub reloads: u64,
    pub reload_failures: u64,
    pub deferred_updates: u64,
    pub unresolved_members: u64,
    pub lifecycle_transitions: Vec<LifecycleTransitionSnapshot>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LifecycleTransitionSnapshot {
    pub from: String,
    pub to: String,
    pub total: u64,
}

/// Counters attributed to one entity, keyed by its display name.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct EntityCountersSnapshot {
    pub reconfigurations: u64,
    pub reloads: u64,
    pub reload_failures: u64,
    pub deferred_updates: u64,
    pub unresolved_members: u64,
    pub transitions: u64,
}

static RUNTIME_COUNTERS: OnceLock<RuntimeCounters> = OnceLock::new();

pub fn runtime_counters() -> &'static RuntimeCounters {
    RUNTIME_COUNTERS.get_or_init(RuntimeCounters::default)
}

impl RuntimeCounters {
    pub fn record_reconfiguration(&self, entity: &str) {
        self.reconfigurations.fetch_add(1, Ordering::Relaxed);
        self.entities
            .update(entity, |counters| counters.reconfigurations += 1);
    }

    pub fn record_reload(&self, entity: &str, success: bool) {
        self.reloads.fetch_add(1, Ordering::Relaxed);
        if !success {
            self.reload_failures.fetch_add(1, Ordering::Relaxed);
        }
        self.entities.update(entity, |counters| {
            counters.reloads += 1;
            if !success {
                counters.reload_failures += 1;
            }
        });
    }

    pub fn record_deferred_update(&self, entity: &str) {
        self.deferred_updates.fetch_add(1, Ordering::Relaxed);
        self.entities
            .update(entity, |counters| counters.deferred_updates += 1);
    }

    pub fn record_unresolved_member(&self, entity: &str) {
        self.unresolved_members.fetch_add(1, Ordering::Relaxed);
        self.entities
            .update(entity, |counters| counters.unresolved_members += 1);
    }

    pub fn record_lifecycle_transition(&self, entity: &str, from: &str, to: &str) {
        self.transitions.record(from, to);
        self.entities.update(entity, |counters| counters.transitions += 1);
    }

    pub fn snapshot(&self) -> RuntimeCountersSnapshot {
        RuntimeCountersSnapshot {
            reconfigurations: self.reconfigurations.load(Ordering::Relaxed),
            reloads: self.reloads.load(Ordering::Relaxed),
            reload_failures: self.reload_failures.load(Ordering::Relaxed),
            deferred_updates: self.deferred_updates.load(Ordering::Relaxed),
            unresolved_members: self.unresolved_members.load(Ordering::Relaxed),
            lifecycle_transitions: self.transitions.snapshot(),
        }
    }

    pub fn entity_snapshot(&self, entity: &str) -> EntityCountersSnapshot {
        self.entities.get(entity)
    }
}

#[derive(Default)]
struct TransitionRegistry {
    inner: Mutex<BTreeMap<(String, String), u64>>,
}

impl TransitionRegistry {
    fn record(&self, from: &str, to: &str) {
        let mut guard = self.inner.lock().unwrap_or_else(|err| err.into_inner());
        let counter = guard.entry((from.to_string(), to.to_string())).or_insert(0);
        *counter = counter.saturating_add(1);
    }

    fn snapshot(&self) -> Vec<LifecycleTransitionSnapshot> {
        let guard = self.inner.lock().unwrap_or_else(|err| err.into_inner());
        guard
            .iter()
            .map(|((from, to), total)| LifecycleTransitionSnapshot {
                from: from.clone(),
                to: to.clone(),
                total: *total,
            })
            .collect()
    }
}

#[derive(Default)]
struct EntityCounterRegistry {
    inner: Mutex<BTreeMap<String, EntityCountersSnapshot>>,
}

impl EntityCounterRegistry {
    fn update(&self, entity: &str, apply: impl FnOnce(&mut EntityCountersSnapshot)) {
        let mut guard = self.inner.lock().unwrap_or_else(|err| err.into_inner());
        apply(guard.entry(entity.to_string()).or_default());
    }

    fn get(&self, entity: &str) -> EntityCountersSnapshot {
        let guard = self.inner.lock().unwrap_or_else(|err| err.into_inner());
        guard.get(entity).cloned().unwrap_or_default()
    }
}
