//! Authoritative classification of the DICOM tags this proxy treats as PHI.
//!
//! The sets mirror the original Django proxy's `PHIAnonymizer` tag lists
//! (patient/study/series) exactly; anything not named here is left untouched
//! by [`crate::anonymizer::Anonymizer`].

use dicom_core::Tag;
use dicom_dictionary_std::tags;

/// Which record a piece of extracted PHI belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TagLevel {
    Patient,
    Study,
    Series,
}

pub const PATIENT_LEVEL_TAGS: &[Tag] = &[
    tags::PATIENT_BIRTH_DATE,
    tags::PATIENT_BIRTH_NAME,
    tags::PATIENT_SIZE,
    tags::PATIENT_WEIGHT,
    tags::PATIENT_SEX,
    tags::OTHER_PATIENT_IDS,
    tags::OTHER_PATIENT_NAMES,
    tags::ETHNIC_GROUP,
    tags::OCCUPATION,
    tags::ADDITIONAL_PATIENT_HISTORY,
    tags::PATIENT_COMMENTS,
    tags::MEDICAL_RECORD_LOCATOR,
    tags::ISSUER_OF_PATIENT_ID,
];

pub const STUDY_LEVEL_TAGS: &[Tag] = &[
    tags::STUDY_DATE,
    tags::STUDY_TIME,
    tags::STUDY_ID,
    tags::INSTITUTION_NAME,
    tags::INSTITUTION_ADDRESS,
    tags::INSTITUTIONAL_DEPARTMENT_NAME,
    tags::STATION_NAME,
    tags::REFERRING_PHYSICIAN_NAME,
    tags::REFERRING_PHYSICIAN_ADDRESS,
    tags::REFERRING_PHYSICIAN_TELEPHONE_NUMBERS,
    tags::PHYSICIANS_OF_RECORD,
    tags::PERFORMING_PHYSICIAN_NAME,
    tags::NAME_OF_PHYSICIANS_READING_STUDY,
    tags::OPERATORS_NAME,
];

pub const SERIES_LEVEL_TAGS: &[Tag] = &[
    tags::SERIES_DATE,
    tags::SERIES_TIME,
    tags::ACQUISITION_DATE,
    tags::ACQUISITION_TIME,
    tags::CONTENT_DATE,
    tags::CONTENT_TIME,
    tags::DEVICE_SERIAL_NUMBER,
    tags::IMAGE_COMMENTS,
];

/// Tags always rewritten to the anonymous identifier, never stored as PHI
/// metadata (they're derivable from the mapping itself).
pub const IDENTIFIER_TAGS: &[Tag] = &[tags::PATIENT_NAME, tags::PATIENT_ID];

/// Tags deleted outright rather than replaced.
pub const REMOVE_TAGS: &[Tag] = &[
    tags::FRAME_OF_REFERENCE_UID,
    tags::SYNCHRONIZATION_FRAME_OF_REFERENCE_UID,
    tags::REQUEST_ATTRIBUTES_SEQUENCE,
    tags::STORAGE_MEDIA_FILE_SET_UID,
    tags::REFERENCED_FRAME_OF_REFERENCE_UID,
    tags::RELATED_FRAME_OF_REFERENCE_UID,
];

/// Date-valued tags in the anonymize set; rewritten to `19700101`.
pub const DATE_TAGS: &[Tag] = &[
    tags::PATIENT_BIRTH_DATE,
    tags::STUDY_DATE,
    tags::SERIES_DATE,
    tags::ACQUISITION_DATE,
    tags::CONTENT_DATE,
];

/// Time-valued tags in the anonymize set; rewritten to `000000`.
pub const TIME_TAGS: &[Tag] = &[
    tags::STUDY_TIME,
    tags::SERIES_TIME,
    tags::ACQUISITION_TIME,
    tags::CONTENT_TIME,
];

/// Every tag the anonymizer touches by replacing its value (union of the
/// three levels plus the identifier tags).
pub fn anonymize_set() -> impl Iterator<Item = Tag> {
    PATIENT_LEVEL_TAGS
        .iter()
        .chain(STUDY_LEVEL_TAGS.iter())
        .chain(SERIES_LEVEL_TAGS.iter())
        .chain(IDENTIFIER_TAGS.iter())
        .copied()
}

pub fn classify(tag: Tag) -> Option<TagLevel> {
    if PATIENT_LEVEL_TAGS.contains(&tag) {
        Some(TagLevel::Patient)
    } else if STUDY_LEVEL_TAGS.contains(&tag) {
        Some(TagLevel::Study)
    } else if SERIES_LEVEL_TAGS.contains(&tag) {
        Some(TagLevel::Series)
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identifier_tags_are_not_classified() {
        for tag in IDENTIFIER_TAGS {
            assert!(classify(*tag).is_none());
        }
    }

    #[test]
    fn every_level_tag_classifies_uniquely() {
        for tag in PATIENT_LEVEL_TAGS {
            assert_eq!(classify(*tag), Some(TagLevel::Patient));
        }
        for tag in STUDY_LEVEL_TAGS {
            assert_eq!(classify(*tag), Some(TagLevel::Study));
        }
        for tag in SERIES_LEVEL_TAGS {
            assert_eq!(classify(*tag), Some(TagLevel::Series));
        }
    }
}
