use super::{file_name, ExportArtifact, ExportFormat, ExportOptions, SchematicExporter};
use crate::core::SchemaScanError;
use crate::document::SchematicDocument;

/// Serializes the whole document. Every component is kept, classified or
/// not, so the output always reads back into an equal document.
pub struct JsonExporter;

impl SchematicExporter for JsonExporter {
    fn format(&self) -> ExportFormat {
        ExportFormat::Json
    }

    fn extension(&self) -> &'static str {
        "json"
    }

    fn export(&self, document: &SchematicDocument, options: &ExportOptions) -> Result<ExportArtifact, SchemaScanError> {
        let content = serde_json::to_string_pretty(document)
            .map_err(|e| SchemaScanError::InvalidInputFormat(format!("document serialization failed: {}", e)))?;
        Ok(ExportArtifact {
            format: ExportFormat::Json,
            file_name: file_name(document, options, self.extension()),
            content,
            exported_components: document.components().len(),
            issues: Vec::new(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::export::fixtures;

    #[test]
    fn test_json_reads_back_into_an_equal_document() {
        let doc = fixtures::document();
        let artifact = JsonExporter.export(&doc, &ExportOptions::default()).unwrap();
        assert_eq!(artifact.file_name, "board.json");
        assert_eq!(artifact.exported_components, 4);
        assert!(artifact.issues.is_empty());

        let back: SchematicDocument = serde_json::from_str(&artifact.content).unwrap();
        assert_eq!(back, doc);
        assert_eq!(back.net_partition(), doc.net_partition());
    }

    #[test]
    fn test_tampered_json_is_rejected() {
        let doc = fixtures::document();
        let artifact = JsonExporter.export(&doc, &ExportOptions::default()).unwrap();
        // point a net at a component that does not exist
        let mut value: serde_json::Value = serde_json::from_str(&artifact.content).unwrap();
        value["nets"][0]["terminals"][0]["component"] = serde_json::json!(99);
        assert!(serde_json::from_value::<SchematicDocument>(value).is_err());
    }
}
