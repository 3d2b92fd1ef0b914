use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

/// Declares a set of monotonically increasing counters shared between tasks,
/// together with a plain `Serialize` snapshot type for logging.
macro_rules! counters {
    ($name:ident => $snapshot:ident { $($field:ident),+ $(,)? }) => {
        #[derive(Debug, Default)]
        pub struct $name {
            $(pub $field: AtomicU64,)+
        }

        #[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
        pub struct $snapshot {
            $(pub $field: u64,)+
        }

        impl $name {
            pub fn snapshot(&self) -> $snapshot {
                $snapshot {
                    $($field: self.$field.load(Ordering::Relaxed),)+
                }
            }
        }
    };
}

counters!(PollerStats => PollerSnapshot {
    ticks,
    fetch_failures,
    decode_failures,
    entity_errors,
    decoded,
    published,
    publish_failures,
});

counters!(PublisherStats => PublisherSnapshot {
    published,
    retries,
    dropped,
});

counters!(ConsumerStats => ConsumerSnapshot {
    received,
    stored,
    stale,
    excluded,
    duplicates,
    poison,
    rejected,
    store_failures,
    commit_failures,
});

pub fn incr(counter: &AtomicU64) {
    add(counter, 1);
}

pub fn add(counter: &AtomicU64, n: u64) {
    counter.fetch_add(n, Ordering::Relaxed);
}

impl ConsumerSnapshot {
    /// Envelopes that reached a terminal outcome and were committed or are
    /// about to be.
    pub fn settled(&self) -> u64 {
        self.stored + self.stale + self.excluded + self.duplicates + self.poison + self.rejected
    }
}
