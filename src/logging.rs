//! Helper macro keeping the `entity` field present on lifecycle and reconciler events.
//!
//! Log consumers group lines by `entity` and `event`; every event emitted through
//! [`steward_event!`] carries both.

/// Log a named event for an entity plus any extra `Display` fields.
///
/// ```ignore
/// steward_event!(info, "pool_reconfigured", entity = reconciler.entity(), targets = count);
/// ```
#[macro_export]
macro_rules! steward_event {
    ($level:ident, $event:expr, entity = $entity:expr $(, $field:ident = $value:expr )* $(,)?) => {
        tracing::$level!(
            event = $event,
            entity = %$entity,
            $($field = %$value,)*
            "{}",
            $event
        )
    };
}
