//! Per-device label cache (§4.1, §9). Guarded by whatever owns the
//! device (the Drive Registry in the root crate) -- never a global
//! singleton, so each device's cache lives and dies with its handle.

use std::time::{Duration, Instant};

use crate::label::TapeLabel;

const FRESHNESS_WINDOW: Duration = Duration::from_secs(5);

#[derive(Default)]
pub struct LabelCache {
    entry: Option<(TapeLabel, Instant)>,
}

impl LabelCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the cached label if present and within the freshness
    /// window. Callers that pass `bypass_cache` to `read_label` should
    /// not consult this at all.
    pub fn get(&self) -> Option<&TapeLabel> {
        self.entry
            .as_ref()
            .filter(|(_, at)| at.elapsed() < FRESHNESS_WINDOW)
            .map(|(label, _)| label)
    }

    pub fn set(&mut self, label: TapeLabel) {
        self.entry = Some((label, Instant::now()));
    }

    /// Invalidated on any eject, load, erase, or label write.
    pub fn invalidate(&mut self) {
        self.entry = None;
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use tbarr_types::CompressionType;
    use uuid::Uuid;

    fn sample_label() -> TapeLabel {
        TapeLabel {
            label_text: "T1".into(),
            uuid: Uuid::new_v4(),
            pool: "DAILY".into(),
            ctime: 0,
            encryption_key_fingerprint: None,
            compression_type: Some(CompressionType::None),
        }
    }

    #[test]
    fn fresh_entry_is_returned() {
        let mut cache = LabelCache::new();
        cache.set(sample_label());
        assert!(cache.get().is_some());
    }

    #[test]
    fn invalidate_clears_entry() {
        let mut cache = LabelCache::new();
        cache.set(sample_label());
        cache.invalidate();
        assert!(cache.get().is_none());
    }
}
