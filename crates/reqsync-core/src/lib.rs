//! Core domain model for approved purchase-requisition documents.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

pub const CRATE_NAME: &str = "reqsync-core";

/// Workflow form that carries a factory code inside its document number.
pub const PURCHASE_REQUISITION_FORM_ID: i64 = 40;

/// Character position (0-indexed) of the factory code inside `document_number`.
pub const FACTORY_CODE_INDEX: usize = 3;

/// Factory name recorded when a document's factory code has no mapping.
pub const UNKNOWN_FACTORY: &str = "unknown";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NamedRef {
    pub name: String,
}

/// One record as returned by the document search endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawRecord {
    pub document_id: i64,
    pub document_number: String,
    pub title: String,
    pub request_user: NamedRef,
    pub request_group: NamedRef,
    pub end_date: String,
}

/// Normalized document as persisted into the destination table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CanonicalDocument {
    pub document_id: i64,
    pub document_number: String,
    pub title: String,
    pub request_user: String,
    pub request_group: String,
    /// Approval timestamp in Japan local time, `YYYY-MM-DD HH:MM:SS`.
    pub end_date: String,
    pub form_id: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_factory: Option<String>,
}

impl CanonicalDocument {
    /// Column value for `request_factory`; forms without a factory store an empty string.
    pub fn request_factory_or_empty(&self) -> &str {
        self.request_factory.as_deref().unwrap_or_default()
    }
}

/// Factory code (single character) to factory name.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FactoryMap {
    entries: BTreeMap<char, String>,
}

impl FactoryMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, code: char, name: impl Into<String>) {
        self.entries.insert(code, name.into());
    }

    pub fn get(&self, code: char) -> Option<&str> {
        self.entries.get(&code).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Extracts the factory code from `document_number` and resolves it,
    /// falling back to [`UNKNOWN_FACTORY`] when the number is too short or the code is unmapped.
    pub fn resolve(&self, document_number: &str) -> String {
        factory_code(document_number)
            .and_then(|code| self.get(code))
            .unwrap_or(UNKNOWN_FACTORY)
            .to_string()
    }
}

impl FromIterator<(char, String)> for FactoryMap {
    fn from_iter<I: IntoIterator<Item = (char, String)>>(iter: I) -> Self {
        Self {
            entries: iter.into_iter().collect(),
        }
    }
}

pub fn factory_code(document_number: &str) -> Option<char> {
    document_number.chars().nth(FACTORY_CODE_INDEX)
}
