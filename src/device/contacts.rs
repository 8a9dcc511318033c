// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (c) 2025-2026 JR Morton

//! Emergency contact directory.

use crate::config::default_contacts;
use crate::core::incident::EmergencyContact;

/// Ordered list of parties to alert, lowest `priority` first.
pub trait ContactDirectory: Send + Sync {
    fn contacts(&self) -> Vec<EmergencyContact>;
}

/// Fixed directory, typically built from the config. Falls back to the
/// default national/roadside/medical numbers when empty.
pub struct StaticDirectory {
    contacts: Vec<EmergencyContact>,
}

impl StaticDirectory {
    pub fn new(mut contacts: Vec<EmergencyContact>) -> Self {
        contacts.sort_by_key(|c| c.priority);
        Self { contacts }
    }
}

impl Default for StaticDirectory {
    fn default() -> Self {
        Self::new(default_contacts())
    }
}

impl ContactDirectory for StaticDirectory {
    fn contacts(&self) -> Vec<EmergencyContact> {
        if self.contacts.is_empty() {
            return default_contacts();
        }
        self.contacts.clone()
    }
}
