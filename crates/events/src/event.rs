use chrono::{DateTime, Utc};

/// A committed fact another process may want to hear about.
///
/// Never emitted for work that rolled back. Consumers can see an event more
/// than once, so handlers must be idempotent.
pub trait Event: Clone + core::fmt::Debug + Send + Sync + 'static {
    /// Dotted name, e.g. `inventory.stock.changed`.
    fn event_type(&self) -> &'static str;

    fn version(&self) -> u32;

    fn occurred_at(&self) -> DateTime<Utc>;

    /// `<event_type>.v<version>`, the name consumers dispatch on.
    fn schema(&self) -> String {
        format!("{}.v{}", self.event_type(), self.version())
    }
}
