//! Built-in chain steps

use super::{GenerationStep, StepFailure, StepResult, ValidationStep};
use crate::models::{AipDraft, IngestMetadata, SipDescriptor};

/// Structural checks on the SIP descriptor and its data files
pub struct DefaultSipValidation;

#[async_trait::async_trait]
impl ValidationStep for DefaultSipValidation {
    fn name(&self) -> &'static str {
        "DefaultSipValidation"
    }

    async fn validate(&self, sip: &SipDescriptor) -> StepResult<()> {
        let mut errors = sip.validate();

        let mut seen = Vec::new();
        for file in &sip.files {
            if seen.contains(&&file.checksum) {
                errors.push(format!("Duplicate data file checksum {}", file.checksum));
            }
            seen.push(&file.checksum);
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(StepFailure::with_reasons(errors))
        }
    }
}

/// One AIP per SIP, carrying all its files, tags and the session
/// categories and storages
pub struct DefaultSingleAipGeneration;

#[async_trait::async_trait]
impl GenerationStep for DefaultSingleAipGeneration {
    fn name(&self) -> &'static str {
        "DefaultSingleAipGeneration"
    }

    async fn generate(
        &self,
        sip: &SipDescriptor,
        metadata: &IngestMetadata,
    ) -> StepResult<Vec<AipDraft>> {
        Ok(vec![AipDraft {
            provider_id: sip.provider_id.clone(),
            tags: sip.tags.clone(),
            categories: metadata.categories.clone(),
            storages: metadata.storages.clone(),
            files: sip.files.clone(),
        }])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{DataFile, StorageMetadata};

    fn file(checksum: &str) -> DataFile {
        DataFile {
            filename: format!("{}.dat", checksum),
            checksum: checksum.into(),
            algorithm: "MD5".into(),
            mime_type: "application/octet-stream".into(),
            origin_url: None,
        }
    }

    #[tokio::test]
    async fn test_validation_rejects_duplicate_files() {
        let sip = SipDescriptor::new("P1").with_file(file("aa")).with_file(file("aa"));
        let failure = DefaultSipValidation.validate(&sip).await.unwrap_err();
        assert!(failure.message().contains("Duplicate data file checksum aa"));

        let sip = SipDescriptor::new("P1").with_file(file("aa")).with_file(file("bb"));
        assert!(DefaultSipValidation.validate(&sip).await.is_ok());
    }

    #[tokio::test]
    async fn test_generation_copies_session_targets() {
        let sip = SipDescriptor::new("P1").with_tag("t1").with_file(file("aa"));
        let mut metadata = IngestMetadata::new("owner", "s1", "DefaultProcessingChain")
            .with_storage(StorageMetadata::new("disk"));
        metadata.categories = vec!["cat".into()];

        let drafts = DefaultSingleAipGeneration.generate(&sip, &metadata).await.unwrap();
        assert_eq!(drafts.len(), 1);
        assert_eq!(drafts[0].provider_id, "P1");
        assert_eq!(drafts[0].tags, vec!["t1"]);
        assert_eq!(drafts[0].categories, vec!["cat"]);
        assert_eq!(drafts[0].storages[0].storage, "disk");
        assert_eq!(drafts[0].files.len(), 1);
    }
}
