use crate::model::Id;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::io::{Cursor, Read};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttachmentInfo {
    pub name: String,
    pub content_type: String,
}

/// Binary attachments of FILE parameters, keyed by parameter id
pub trait AttachmentStore: Send + Sync {
    fn get_info(&self, parameter_id: &Id) -> Option<AttachmentInfo>;

    fn get_bytes(&self, parameter_id: &Id) -> Option<Box<dyn Read + Send>>;
}

#[derive(Debug, Default)]
pub struct MemoryAttachments {
    files: RwLock<HashMap<Id, (AttachmentInfo, Vec<u8>)>>,
}

impl MemoryAttachments {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, parameter_id: Id, info: AttachmentInfo, bytes: Vec<u8>) {
        self.files.write().insert(parameter_id, (info, bytes));
    }
}

impl AttachmentStore for MemoryAttachments {
    fn get_info(&self, parameter_id: &Id) -> Option<AttachmentInfo> {
        self.files.read().get(parameter_id).map(|(info, _)| info.clone())
    }

    fn get_bytes(&self, parameter_id: &Id) -> Option<Box<dyn Read + Send>> {
        self.files
            .read()
            .get(parameter_id)
            .map(|(_, bytes)| Box::new(Cursor::new(bytes.clone())) as Box<dyn Read + Send>)
    }
}

/// Where a text value is being rendered
#[derive(Debug, Clone, PartialEq)]
pub struct MacroContext {
    pub data_set_list_id: Id,
    pub data_set_id: Id,
}

/// Expands (or collapses) reference aliases embedded in text values.
/// Only called when formatting a value for display.
pub trait MacroResolver: Send + Sync {
    fn evaluate(&self, text: &str, context: &MacroContext) -> String;
}

/// Leaves text untouched
#[derive(Debug, Default, Clone, Copy)]
pub struct NoMacros;

impl MacroResolver for NoMacros {
    fn evaluate(&self, text: &str, _context: &MacroContext) -> String {
        text.to_string()
    }
}

/// Side channel told about every mutation, by affected list
pub trait AuditSink: Send + Sync {
    fn data_set_list_modified(&self, data_set_list_id: &Id);
}

#[derive(Debug, Default, Clone, Copy)]
pub struct LogAuditSink;

impl AuditSink for LogAuditSink {
    fn data_set_list_modified(&self, data_set_list_id: &Id) {
        log::info!("data set list modified: {}", data_set_list_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::generate_id;

    #[test]
    fn test_memory_attachments() {
        let attachments = MemoryAttachments::new();
        let parameter_id = generate_id();
        attachments.insert(
            parameter_id,
            AttachmentInfo {
                name: "photo.png".into(),
                content_type: "image/png".into(),
            },
            vec![1, 2, 3],
        );

        assert_eq!(attachments.get_info(&parameter_id).unwrap().name, "photo.png");
        let mut bytes = Vec::new();
        attachments
            .get_bytes(&parameter_id)
            .unwrap()
            .read_to_end(&mut bytes)
            .unwrap();
        assert_eq!(bytes, vec![1, 2, 3]);
        assert!(attachments.get_info(&generate_id()).is_none());
    }
}
