//! Local preference storage for the broadcaster profile.

use std::collections::HashMap;

use crate::protocol::{BroadcasterProfile, FIELD_BUS_NO, FIELD_DRIVER_NAME, FIELD_SIMULATE};

/// String key/value preferences that survive restarts.
pub trait PreferenceStore: Send {
    fn get(&self, key: &str) -> Option<String>;
    fn set(&mut self, key: &str, value: &str);
}

/// In-memory preferences.
#[derive(Debug, Clone, Default)]
pub struct MemoryPreferences {
    values: HashMap<String, String>,
}

impl MemoryPreferences {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

impl PreferenceStore for MemoryPreferences {
    fn get(&self, key: &str) -> Option<String> {
        self.values.get(key).cloned()
    }

    fn set(&mut self, key: &str, value: &str) {
        self.values.insert(key.to_string(), value.to_string());
    }
}

/// Read the saved profile; missing keys yield empty fields.
pub fn load_profile(prefs: &dyn PreferenceStore) -> BroadcasterProfile {
    BroadcasterProfile {
        bus_no: prefs.get(FIELD_BUS_NO).unwrap_or_default(),
        driver_name: prefs.get(FIELD_DRIVER_NAME).unwrap_or_default(),
        simulate: prefs.get(FIELD_SIMULATE).as_deref() == Some("true"),
    }
}

pub fn save_profile(prefs: &mut dyn PreferenceStore, profile: &BroadcasterProfile) {
    prefs.set(FIELD_BUS_NO, &profile.bus_no);
    prefs.set(FIELD_DRIVER_NAME, &profile.driver_name);
    prefs.set(FIELD_SIMULATE, if profile.simulate { "true" } else { "false" });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_load_profile_defaults() {
        let prefs = MemoryPreferences::new();
        assert_eq!(load_profile(&prefs), BroadcasterProfile::default());
    }

    #[test]
    fn test_save_then_load_profile() {
        let mut prefs = MemoryPreferences::new();
        let profile = BroadcasterProfile::new("42", "Mo", true);
        save_profile(&mut prefs, &profile);

        assert_eq!(prefs.get(FIELD_SIMULATE).as_deref(), Some("true"));
        assert_eq!(load_profile(&prefs), profile);
    }

    #[test]
    fn test_simulate_requires_literal_true() {
        let mut prefs = MemoryPreferences::new();
        prefs.set(FIELD_SIMULATE, "yes");
        assert!(!load_profile(&prefs).simulate);
    }
}
