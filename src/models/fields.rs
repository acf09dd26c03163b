// src/models/fields.rs

//! Trackable Edition fields and a typed per-field record.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Edition fields that carry provenance and can be extracted or corrected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum TrackedField {
    RaceDate,
    RegistrationStatus,
    RegistrationUrl,
}

impl TrackedField {
    pub const ALL: [TrackedField; 3] = [
        TrackedField::RaceDate,
        TrackedField::RegistrationStatus,
        TrackedField::RegistrationUrl,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            TrackedField::RaceDate => "raceDate",
            TrackedField::RegistrationStatus => "registrationStatus",
            TrackedField::RegistrationUrl => "registrationUrl",
        }
    }
}

impl fmt::Display for TrackedField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One optional slot per [`TrackedField`].
///
/// Used for field values, provenance stamps, extraction rules and
/// extraction methods alike, so adding a field is a compile error
/// everywhere it is not handled.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct FieldMap<T> {
    // No `default`: it would require `T: Default`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub race_date: Option<T>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub registration_status: Option<T>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub registration_url: Option<T>,
}

impl<T> Default for FieldMap<T> {
    fn default() -> Self {
        Self {
            race_date: None,
            registration_status: None,
            registration_url: None,
        }
    }
}

impl<T> FieldMap<T> {
    pub fn get(&self, field: TrackedField) -> Option<&T> {
        match field {
            TrackedField::RaceDate => self.race_date.as_ref(),
            TrackedField::RegistrationStatus => self.registration_status.as_ref(),
            TrackedField::RegistrationUrl => self.registration_url.as_ref(),
        }
    }

    pub fn slot_mut(&mut self, field: TrackedField) -> &mut Option<T> {
        match field {
            TrackedField::RaceDate => &mut self.race_date,
            TrackedField::RegistrationStatus => &mut self.registration_status,
            TrackedField::RegistrationUrl => &mut self.registration_url,
        }
    }

    pub fn set(&mut self, field: TrackedField, value: Option<T>) {
        *self.slot_mut(field) = value;
    }

    /// Fill every empty slot from `other`, keeping existing values.
    pub fn fill_from(&mut self, other: FieldMap<T>) {
        let FieldMap {
            race_date,
            registration_status,
            registration_url,
        } = other;
        for (field, value) in [
            (TrackedField::RaceDate, race_date),
            (TrackedField::RegistrationStatus, registration_status),
            (TrackedField::RegistrationUrl, registration_url),
        ] {
            let slot = self.slot_mut(field);
            if slot.is_none() {
                *slot = value;
            }
        }
    }

    /// Iterate over populated slots in field order.
    pub fn iter(&self) -> impl Iterator<Item = (TrackedField, &T)> {
        TrackedField::ALL
            .into_iter()
            .filter_map(move |field| self.get(field).map(|value| (field, value)))
    }

    pub fn is_empty(&self) -> bool {
        self.iter().next().is_none()
    }
}

/// Field values of an Edition, or of an incoming update.
pub type EditionFields = FieldMap<String>;

impl EditionFields {
    /// Trim values and drop the ones that end up empty.
    pub fn normalized(mut self) -> Self {
        for field in TrackedField::ALL {
            let slot = self.slot_mut(field);
            *slot = slot
                .take()
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty());
        }
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn serializes_with_camel_case_names() {
        let mut fields = EditionFields::default();
        fields.set(TrackedField::RaceDate, Some("2026-03-07".to_string()));
        let json = serde_json::to_string(&fields).unwrap();
        assert_eq!(json, r#"{"raceDate":"2026-03-07"}"#);
    }

    #[test]
    fn rejects_unknown_field_names() {
        let parsed: Result<EditionFields, _> = serde_json::from_str(r#"{"startTime":"x"}"#);
        assert!(parsed.is_err());
    }

    #[test]
    fn deserializes_partial_maps_of_plain_values() {
        #[derive(Debug, PartialEq, Deserialize)]
        struct Plain {
            weight: u8,
        }

        let parsed: FieldMap<Plain> =
            serde_json::from_str(r#"{"registrationUrl":{"weight":3}}"#).unwrap();
        assert_eq!(parsed.registration_url, Some(Plain { weight: 3 }));
        assert!(parsed.race_date.is_none());

        let empty: FieldMap<Plain> = serde_json::from_str("{}").unwrap();
        assert!(empty.is_empty());
    }

    #[test]
    fn fill_from_keeps_existing_values() {
        let mut a = EditionFields {
            race_date: Some("2026-03-07".into()),
            ..Default::default()
        };
        let b = EditionFields {
            race_date: Some("2026-03-08".into()),
            registration_url: Some("https://example.com/entry".into()),
            ..Default::default()
        };
        a.fill_from(b);
        assert_eq!(a.race_date.as_deref(), Some("2026-03-07"));
        assert_eq!(a.registration_url.as_deref(), Some("https://example.com/entry"));
    }

    #[test]
    fn normalized_drops_blank_values() {
        let fields = EditionFields {
            race_date: Some("  ".into()),
            registration_status: Some(" open ".into()),
            ..Default::default()
        }
        .normalized();
        assert!(fields.race_date.is_none());
        assert_eq!(fields.registration_status.as_deref(), Some("open"));
        assert_eq!(fields.iter().count(), 1);
    }
}
