use crate::error::Result;
use crate::logic::resolve::ResolvedValue;
use crate::model::{Attribute, AttributeType, Parameter, ParameterValue};
use crate::store::{AttachmentStore, MacroContext, MacroResolver, MemoryAttachments, NoMacros};
use std::sync::Arc;

/// Shown in place of ENCRYPTED values
pub const ENCRYPTED_MASK: &str = "********";

/// Display boundary for parameter values: macros expand text here and
/// nowhere else, attachments are looked up by parameter id, references
/// show the referenced row's name.
#[derive(Clone)]
pub struct ValueFormatter {
    macros: Arc<dyn MacroResolver>,
    attachments: Arc<dyn AttachmentStore>,
    reveal_encrypted: bool,
}

impl ValueFormatter {
    pub fn new(macros: Arc<dyn MacroResolver>, attachments: Arc<dyn AttachmentStore>) -> Self {
        Self {
            macros,
            attachments,
            reveal_encrypted: false,
        }
    }

    pub fn reveal_encrypted(mut self, reveal: bool) -> Self {
        self.reveal_encrypted = reveal;
        self
    }

    pub fn format(&self, attribute: &Attribute, parameter: &Parameter, context: &MacroContext) -> Result<Option<String>> {
        let text = match &parameter.value {
            ParameterValue::Empty => None,
            ParameterValue::Text(_) if attribute.attribute_type == AttributeType::Encrypted && !self.reveal_encrypted => {
                Some(ENCRYPTED_MASK.to_string())
            }
            ParameterValue::Text(text) => Some(self.macros.evaluate(text, context)),
            ParameterValue::ListValue(value) => value.get()?.map(|value| value.text.clone()),
            ParameterValue::File(file) => self.attachments.get_info(&file.parameter_id).map(|info| info.name),
            ParameterValue::DataSetRef(reference) => reference.get()?.map(|row| row.name.clone()),
        };
        Ok(text)
    }

    pub fn format_resolved(
        &self,
        target: &Attribute,
        resolved: &ResolvedValue,
        context: &MacroContext,
    ) -> Result<Option<String>> {
        match &resolved.parameter {
            Some(parameter) => self.format(target, parameter, context),
            None => Ok(None),
        }
    }
}

impl Default for ValueFormatter {
    fn default() -> Self {
        Self::new(Arc::new(NoMacros), Arc::new(MemoryAttachments::new()))
    }
}

impl std::fmt::Debug for ValueFormatter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ValueFormatter")
            .field("reveal_encrypted", &self.reveal_encrypted)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::LazyRef;
    use crate::model::{generate_id, DataSet, FileRef, Id};
    use crate::store::AttachmentInfo;

    struct Upper;

    impl MacroResolver for Upper {
        fn evaluate(&self, text: &str, _context: &MacroContext) -> String {
            text.to_uppercase()
        }
    }

    fn attribute(ty: AttributeType) -> Attribute {
        let reference = ty.is_reference().then(|| LazyRef::detached(generate_id()));
        Attribute::new(generate_id(), generate_id(), "field".into(), 0, ty, reference).unwrap()
    }

    fn parameter(attribute: &Attribute, value: ParameterValue) -> Parameter {
        Parameter::direct(generate_id(), generate_id(), attribute.id, value)
    }

    fn context() -> MacroContext {
        MacroContext {
            data_set_list_id: Id::nil(),
            data_set_id: Id::nil(),
        }
    }

    #[test]
    fn test_encrypted_masked_unless_revealed() {
        let attribute = attribute(AttributeType::Encrypted);
        let secret = parameter(&attribute, ParameterValue::Text("hunter2".into()));

        let formatter = ValueFormatter::default();
        assert_eq!(
            formatter.format(&attribute, &secret, &context()).unwrap().as_deref(),
            Some(ENCRYPTED_MASK)
        );

        let formatter = formatter.reveal_encrypted(true);
        assert_eq!(
            formatter.format(&attribute, &secret, &context()).unwrap().as_deref(),
            Some("hunter2")
        );
    }

    #[test]
    fn test_text_goes_through_macros() {
        let attribute = attribute(AttributeType::Text);
        let value = parameter(&attribute, ParameterValue::Text("paris".into()));
        let formatter = ValueFormatter::new(Arc::new(Upper), Arc::new(MemoryAttachments::new()));

        assert_eq!(
            formatter.format(&attribute, &value, &context()).unwrap().as_deref(),
            Some("PARIS")
        );
    }

    #[test]
    fn test_file_and_reference_display() {
        let attachments = Arc::new(MemoryAttachments::new());
        let file_attribute = attribute(AttributeType::File);
        let file = parameter(&file_attribute, ParameterValue::File(FileRef { parameter_id: Id::nil() }));
        attachments.insert(
            Id::nil(),
            AttachmentInfo {
                name: "report.pdf".into(),
                content_type: "application/pdf".into(),
            },
            Vec::new(),
        );
        let formatter = ValueFormatter::new(Arc::new(NoMacros), attachments);
        assert_eq!(
            formatter.format(&file_attribute, &file, &context()).unwrap().as_deref(),
            Some("report.pdf")
        );

        let home = Arc::new(DataSet::new(generate_id(), generate_id(), "home".into(), 0, false));
        let dsl = attribute(AttributeType::Dsl);
        let reference = parameter(&dsl, ParameterValue::DataSetRef(LazyRef::resolved(home.id, &home)));
        assert_eq!(
            formatter.format(&dsl, &reference, &context()).unwrap().as_deref(),
            Some("home")
        );
    }
}
